//! The plain backend: gdb driving a native process.

use super::gdb::GdbSession;
use super::{Debugger, Frame, Location, StopEvent, WatchKind, WatchpointId};
use crate::config::Config;
use crate::error::{Error, Result};
use std::path::Path;
use tracing::info;

pub struct DirectGdb {
    session: GdbSession,
    watch_expr: String,
    capacity: usize,
    started: bool,
}

impl DirectGdb {
    pub fn new(config: &Config) -> Result<Self> {
        // read watchpoints only exist in hardware here; the software
        // fallback lives in the memory-sandbox backend
        let capacity = match config.watchpoint_budget() {
            Some(w) if w > 0 => w,
            _ => {
                return Err(Error::ConfigInvalid(
                    "the direct instance needs a positive watchpoint_count; \
                     use instance = \"memory-sandbox\" for software watchpoints"
                        .into(),
                ))
            }
        };

        let mut session = GdbSession::spawn(&config.gdb_path, config.command_timeout())?;
        session.expect_done("-gdb-set disable-randomization on")?;

        Ok(DirectGdb {
            session,
            watch_expr: config.watchpoint_type.clone(),
            capacity,
            started: false,
        })
    }
}

impl Debugger for DirectGdb {
    fn launch(&mut self, program: &Path, args: &[String], stdin: Option<&Path>) -> Result<()> {
        info!(program = %program.display(), "launching native target");
        self.session.load_binary(program)?;

        let mut arg_line = args.join(" ");
        if let Some(path) = stdin {
            arg_line.push_str(&format!(" < {}", path.display()));
        }
        if !arg_line.is_empty() {
            self.session
                .expect_done(&format!("-exec-arguments {}", arg_line.trim()))?;
        }
        Ok(())
    }

    fn set_breakpoint(&mut self, location: &Location) -> Result<u32> {
        match location {
            Location::Symbol(name) => self.session.insert_breakpoint(name),
            Location::Address(addr) => self.session.insert_breakpoint(&format!("*{:#x}", addr)),
        }
    }

    fn continue_until_stop(&mut self) -> Result<StopEvent> {
        let first = !self.started;
        self.started = true;
        self.session.continue_and_wait(first)
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
        self.capacity
    }
}
