//! The on-chip backend: gdb talking to a hardware probe's gdb server,
//! the seed delivered over a serial line. Watchpoint capacity is the
//! device's fixed comparator count.

use super::gdb::GdbSession;
use super::{Debugger, Frame, Location, StopEvent, WatchKind, WatchpointId};
use crate::chan::SerialLink;
use crate::config::Config;
use crate::error::{Error, Result};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use tracing::{info, warn};

pub struct ProbeGdb {
    session: GdbSession,
    watch_expr: String,
    capacity: usize,
    server: Option<Child>,
    server_address: String,
    serial: SerialLink,
    seed: Vec<u8>,
    seed_sent: bool,
}

impl ProbeGdb {
    pub fn new(config: &Config, seed_path: &Path) -> Result<Self> {
        let server_address = config
            .gdb_server_address
            .clone()
            .ok_or_else(|| Error::ConfigInvalid("on-chip requires gdb_server_address".into()))?;

        // the probe's gdb server (e.g. openocd) runs for the whole trace
        let server = match &config.gdb_server_path {
            Some(path) => {
                let mut parts = path.split_whitespace();
                let program = parts
                    .next()
                    .ok_or_else(|| Error::ConfigInvalid("gdb_server_path is empty".into()))?;
                let child = Command::new(program)
                    .args(parts)
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .spawn()?;
                info!(pid = child.id(), "gdb server started");
                std::thread::sleep(Duration::from_secs(1));
                Some(child)
            }
            None => None,
        };

        let session = GdbSession::spawn(&config.gdb_path, config.command_timeout())?;

        let port = config
            .port
            .as_deref()
            .ok_or_else(|| Error::ConfigInvalid("on-chip requires a serial port".into()))?;
        let serial = SerialLink::open(port, config.baud_rate.unwrap_or(115_200))?;

        let seed = std::fs::read(seed_path)?;

        let capacity = match config.watchpoint_budget() {
            Some(w) if w > 0 => w,
            _ => {
                return Err(Error::ConfigInvalid(
                    "on-chip requires a positive watchpoint_count".into(),
                ))
            }
        };

        Ok(ProbeGdb {
            session,
            watch_expr: config.watchpoint_type.clone(),
            capacity,
            server,
            server_address,
            serial,
            seed,
            seed_sent: false,
        })
    }
}

impl Debugger for ProbeGdb {
    fn launch(&mut self, program: &Path, _args: &[String], _stdin: Option<&Path>) -> Result<()> {
        // the firmware is already on the device; the ELF only provides
        // symbols
        self.session.load_binary(program)?;
        self.session.target_select(&self.server_address)?;
        self.session.monitor("reset halt")?;
        self.session.console("flushregs")?;
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
        if !self.seed_sent {
            // resume first, then feed the firmware's input request so
            // it can run into the parser entrypoint
            self.session.expect_done("-exec-continue")?;
            self.serial.wait_for_input_request()?;
            let seed = std::mem::take(&mut self.seed);
            if !self.serial.send_input(&seed)? {
                warn!("target rejected the seed frame");
            }
            self.seed_sent = true;
            return match self.session.wait_for_stop()? {
                Some(stop) => Ok(self.session.stop_event(&stop)),
                None => Ok(StopEvent::Timeout),
            };
        }
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
        self.capacity
    }
}

impl Drop for ProbeGdb {
    fn drop(&mut self) {
        if let Some(mut child) = self.server.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
