//! The memory-sandbox backend: the target runs under valgrind, gdb
//! attaches through vgdb. Valgrind implements watchpoints in software,
//! so the reported capacity is effectively unlimited.

use super::gdb::GdbSession;
use super::{Debugger, Frame, Location, StopEvent, WatchKind, WatchpointId};
use crate::config::Config;
use crate::error::{Error, Result};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use tracing::info;

pub struct SandboxGdb {
    session: GdbSession,
    watch_expr: String,
    valgrind: Option<Child>,
}

impl SandboxGdb {
    pub fn new(config: &Config, _seed_path: &Path) -> Result<Self> {
        let session = GdbSession::spawn(&config.gdb_path, config.command_timeout())?;
        Ok(SandboxGdb {
            session,
            watch_expr: config.watchpoint_type.clone(),
            valgrind: None,
        })
    }
}

impl Debugger for SandboxGdb {
    fn launch(&mut self, program: &Path, args: &[String], stdin: Option<&Path>) -> Result<()> {
        let mut cmd = Command::new("valgrind");
        cmd.args([
            "--vgdb=yes",
            "--vgdb-stop-at=startup",
            "--undef-value-errors=no",
            "--leak-check=no",
        ])
        .arg(program)
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null());
        if let Some(path) = stdin {
            cmd.stdin(Stdio::from(std::fs::File::open(path)?));
        } else {
            cmd.stdin(Stdio::null());
        }

        let child = cmd.spawn()?;
        let pid = child.id();
        self.valgrind = Some(child);
        info!(pid, "valgrind sandbox started");

        // give vgdb a moment to open its control socket
        std::thread::sleep(Duration::from_millis(500));

        self.session
            .expect_done("-gdb-set disable-randomization on")?;
        self.session.load_binary(program)?;
        self.session
            .target_select(&format!("| vgdb --pid={}", pid))?;
        self.session.drain_stops();
        Ok(())
    }

    fn set_breakpoint(&mut self, location: &Location) -> Result<u32> {
        match location {
            Location::Symbol(name) => self.session.insert_breakpoint(name),
            Location::Address(addr) => self.session.insert_breakpoint(&format!("*{:#x}", addr)),
        }
    }

    fn continue_until_stop(&mut self) -> Result<StopEvent> {
        if self.valgrind.is_none() {
            return Err(Error::DebuggerProtocolError(
                "continue before launch".into(),
            ));
        }
        // the remote target is already live, never -exec-run
        self.session.continue_and_wait(false)
    }

    fn step_instruction(&mut self) -> Result<StopEvent> {
        self.session.step_and_wait("-exec-step-instruction")
    }

    fn step_out(&mut self) -> Result<StopEvent> {
        self.session.step_and_wait("-exec-finish")
    }

    fn read_memory(&mut self, addr: u64, len: usize) -> Result<Vec<u8>> {
        self.session.read_memory(addr, len)
    }

    fn write_memory(&mut self, addr: u64, bytes: &[u8]) -> Result<()> {
        self.session.write_memory(addr, bytes)
    }

    fn get_registers(&mut self) -> Result<Vec<(String, u64)>> {
        self.session.registers()
    }

    fn resolve_symbol(&mut self, name: &str) -> Result<u64> {
        self.session.evaluate_address(&format!("&{}", name))
    }

    fn get_backtrace(&mut self) -> Result<Vec<Frame>> {
        self.session.backtrace()
    }

    fn set_watchpoint(&mut self, addr: u64, _len: usize, kind: WatchKind) -> Result<WatchpointId> {
        self.session.insert_watchpoint(addr, kind, &self.watch_expr)
    }

    fn clear_watchpoint(&mut self, id: WatchpointId) -> Result<()> {
        self.session.delete_breakpoint(id)
    }

    fn watchpoint_capacity(&self) -> usize {
        // software watchpoints; the scheduler may arm the whole input
        usize::MAX
    }
}

impl Drop for SandboxGdb {
    fn drop(&mut self) {
        if let Some(mut child) = self.valgrind.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
