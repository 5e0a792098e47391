//! Uniform capability over the underlying debugger. The tracer only
//! ever talks to [`Debugger`]; which gdb setup answers (plain process,
//! valgrind memory sandbox, hardware probe) is decided once per trace
//! from the configuration.

use crate::config::{Config, InstanceKind};
use crate::error::Result;
use std::path::Path;

pub mod direct;
pub mod gdb;
pub mod mi;
pub mod probe;
pub mod sandbox;

/// gdb-assigned breakpoint/watchpoint number.
pub type WatchpointId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
    Read,
    Write,
    ReadWrite,
}

/// Where a breakpoint goes: a symbol name or a raw address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Symbol(String),
    Address(u64),
}

impl Location {
    pub fn parse(s: &str) -> Location {
        if let Some(hex) = s.strip_prefix("0x") {
            if let Ok(addr) = u64::from_str_radix(hex, 16) {
                return Location::Address(addr);
            }
        }
        Location::Symbol(s.to_string())
    }
}

/// Why the target stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum StopEvent {
    /// A code breakpoint (only the exitpoint and the entry breakpoint
    /// are ever set).
    Breakpoint,
    /// A watchpoint fired. `kind` distinguishes the read we asked for
    /// from a write into the watched cell.
    WatchpointHit {
        id: WatchpointId,
        addr: u64,
        kind: WatchKind,
    },
    Signal(String),
    Exited(i32),
    Timeout,
    /// A step or step-out completed without hitting anything. Only
    /// `step_instruction`/`step_out` produce this.
    Stepped,
}

/// One backtrace entry, innermost at level 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub level: usize,
    pub addr: u64,
    pub func: String,
    pub file: Option<String>,
    pub line: Option<u32>,
}

impl Frame {
    /// `file:line`, used as the call-site qualifier of the next-inner
    /// frame.
    pub fn source_location(&self) -> Option<String> {
        match (&self.file, self.line) {
            (Some(file), Some(line)) => Some(format!("{}:{}", file, line)),
            _ => None,
        }
    }
}

/// The capability set every backend provides. All calls are synchronous
/// and bounded by the configured per-command timeout; an expired
/// timeout surfaces as `BackendUnresponsive`.
pub trait Debugger {
    /// Start (or attach to) the target with the seed delivered on the
    /// configured input channel. After launch the target is stopped
    /// before reaching the entrypoint.
    fn launch(&mut self, program: &Path, args: &[String], stdin: Option<&Path>) -> Result<()>;

    fn set_breakpoint(&mut self, location: &Location) -> Result<u32>;

    fn continue_until_stop(&mut self) -> Result<StopEvent>;

    fn step_instruction(&mut self) -> Result<StopEvent>;

    fn step_out(&mut self) -> Result<StopEvent>;

    fn read_memory(&mut self, addr: u64, len: usize) -> Result<Vec<u8>>;

    fn write_memory(&mut self, addr: u64, bytes: &[u8]) -> Result<()>;

    fn get_registers(&mut self) -> Result<Vec<(String, u64)>>;

    fn resolve_symbol(&mut self, name: &str) -> Result<u64>;

    /// Innermost first.
    fn get_backtrace(&mut self) -> Result<Vec<Frame>>;

    fn set_watchpoint(&mut self, addr: u64, len: usize, kind: WatchKind)
        -> Result<WatchpointId>;

    fn clear_watchpoint(&mut self, id: WatchpointId) -> Result<()>;

    /// How many watchpoints may be live at once. Software-watchpoint
    /// backends report an effectively unlimited value.
    fn watchpoint_capacity(&self) -> usize;
}

/// Build the configured backend for one trace of `seed_path`.
pub fn create(config: &Config, seed_path: &Path) -> Result<Box<dyn Debugger>> {
    Ok(match config.instance {
        InstanceKind::Direct => Box::new(direct::DirectGdb::new(config)?),
        InstanceKind::MemorySandbox => {
            Box::new(sandbox::SandboxGdb::new(config, seed_path)?)
        }
        InstanceKind::OnChip => Box::new(probe::ProbeGdb::new(config, seed_path)?),
    })
}
