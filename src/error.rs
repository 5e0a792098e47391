use std::path::PathBuf;
use thiserror::Error;

/// Everything that can go wrong between loading a config and writing the
/// grammar file. Fatality is decided by the caller: the driver aborts on
/// config/symbol errors, retries whole traces on backend errors, and
/// skips seeds that stay inconsistent.
#[derive(Debug, Error)]
pub enum Error {
    /// The configuration file is unreadable or a value is out of range.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Entrypoint, exitpoint or input buffer could not be resolved.
    #[error("symbol '{0}' not found in {1}")]
    SymbolNotFound(String, PathBuf),

    /// A debugger command did not answer within its timeout.
    #[error("debugger backend unresponsive while {0}")]
    BackendUnresponsive(String),

    /// The backend answered with something we cannot interpret.
    #[error("debugger protocol error: {0}")]
    DebuggerProtocolError(String),

    /// The scheduler armed more watchpoints than the hardware budget.
    /// This is an internal invariant violation, never retried.
    #[error("watchpoint budget exceeded: {armed} armed, budget {budget}")]
    WatchpointBudgetExceeded { armed: usize, budget: usize },

    /// Sibling ranges overlap; the trace is a watchpoint-timing artifact.
    #[error("inconsistent tree for seed '{0}': {1}")]
    InconsistentTree(String, String),

    /// The miner produced a right-hand side referencing an absent
    /// nonterminal. Implementation bug, fatal.
    #[error("grammar references missing nonterminal {0}")]
    GrammarReferenceMissing(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Regex(#[from] regex::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
