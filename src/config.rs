use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How the seed bytes reach the target program.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InputChannelKind {
    /// Seed file path passed as the program's argument.
    File,
    /// Seed bytes piped into the program's stdin.
    Stdin,
    /// Seed bytes framed over a serial line (on-chip targets).
    Serial,
}

fn default_input_channel() -> InputChannelKind {
    InputChannelKind::File
}

/// Which debugger backend drives the target.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceKind {
    /// gdb alone on a native process.
    Direct,
    /// gdb attached to a valgrind vgdb session; software watchpoints,
    /// effectively unlimited capacity.
    MemorySandbox,
    /// gdb talking to a hardware probe's gdb server.
    OnChip,
}

fn default_instance() -> InstanceKind {
    InstanceKind::Direct
}

fn default_gdb_path() -> String {
    "gdb".to_string()
}

fn default_watchpoint_type() -> String {
    String::new()
}

fn default_timeout() -> u64 {
    10
}

fn default_watchpoint_count() -> i64 {
    4
}

fn default_log_level() -> String {
    "INFO".to_string()
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub seed_directory: PathBuf,
    /// Inputs for the external precision/recall evaluator. Validated,
    /// not consumed here.
    pub eval_directory: Option<PathBuf>,
    pub output_directory: PathBuf,
    pub binary_file: PathBuf,

    #[serde(default = "default_input_channel")]
    pub input_channel: InputChannelKind,
    pub port: Option<String>,
    pub baud_rate: Option<u32>,

    #[serde(default = "default_gdb_path")]
    pub gdb_path: String,
    #[serde(default = "default_instance")]
    pub instance: InstanceKind,
    pub gdb_server_path: Option<String>,
    pub gdb_server_address: Option<String>,

    #[serde(default)]
    pub ignore_functions_regex: String,
    /// Pointer type used when arming watchpoints, e.g. "(char*)".
    #[serde(default = "default_watchpoint_type")]
    pub watchpoint_type: String,
    /// Hardware watchpoint budget W; -1 means unlimited (software).
    #[serde(default = "default_watchpoint_count")]
    pub watchpoint_count: i64,
    /// Per-debugger-command timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    pub entrypoint: String,
    /// Empty: the trace ends when execution returns past the entrypoint
    /// frame's depth.
    #[serde(default)]
    pub exitpoint: String,
    pub input_buffer: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Cap on how many seeds are traced, in lexical order.
    pub number_of_seeds: Option<usize>,
    /// Baseline-algorithm selector for the external comparison harness;
    /// recorded in the log, not consumed by the core.
    #[serde(default)]
    pub original_mimid: bool,
    /// Delayed-watchpoint attribution policy.
    #[serde(default)]
    pub delay_wp: bool,
    /// Consumed by the external evaluator.
    pub precision_set_size: Option<usize>,
    /// Qualify nonterminals with the caller's call-site location.
    #[serde(default)]
    pub qualify_call_sites: bool,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigInvalid(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::ConfigInvalid(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !self.binary_file.is_file() {
            return Err(Error::ConfigInvalid(format!(
                "binary_file {} is not a readable file",
                self.binary_file.display()
            )));
        }
        if !self.seed_directory.is_dir() {
            return Err(Error::ConfigInvalid(format!(
                "seed_directory {} is not a directory",
                self.seed_directory.display()
            )));
        }
        if self.entrypoint.is_empty() {
            return Err(Error::ConfigInvalid("entrypoint must not be empty".into()));
        }
        if self.input_buffer.is_empty() {
            return Err(Error::ConfigInvalid(
                "input_buffer must not be empty".into(),
            ));
        }
        if self.watchpoint_count < -1 {
            return Err(Error::ConfigInvalid(format!(
                "watchpoint_count must be >= -1, got {}",
                self.watchpoint_count
            )));
        }
        if self.instance == InstanceKind::Direct && self.watchpoint_count <= 0 {
            return Err(Error::ConfigInvalid(
                "the direct instance needs a positive watchpoint_count; \
                 use instance = \"memory-sandbox\" for software watchpoints"
                    .into(),
            ));
        }
        if self.input_channel == InputChannelKind::Serial && self.port.is_none() {
            return Err(Error::ConfigInvalid(
                "input_channel = \"serial\" requires port".into(),
            ));
        }
        if self.instance == InstanceKind::OnChip && self.gdb_server_address.is_none() {
            return Err(Error::ConfigInvalid(
                "instance = \"on-chip\" requires gdb_server_address".into(),
            ));
        }
        self.tracing_filter()?;
        Ok(())
    }

    /// W as the scheduler sees it; None means unlimited.
    pub fn watchpoint_budget(&self) -> Option<usize> {
        match self.watchpoint_count {
            -1 => None,
            n => Some(n as usize),
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Maps the configured level to a tracing filter directive.
    pub fn tracing_filter(&self) -> Result<&'static str> {
        match self.log_level.as_str() {
            "DEBUG" => Ok("debug"),
            "INFO" => Ok("info"),
            "WARNING" => Ok("warn"),
            "ERROR" => Ok("error"),
            "CRITICAL" => Ok("error"),
            other => Err(Error::ConfigInvalid(format!(
                "log_level must be one of DEBUG/INFO/WARNING/ERROR/CRITICAL, got {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_seed_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("seed-0"), b"1+2").unwrap();
        dir
    }

    fn minimal_toml(binary: &Path, seeds: &Path, out: &Path) -> String {
        format!(
            r#"
seed_directory = "{}"
output_directory = "{}"
binary_file = "{}"
entrypoint = "parse_expr"
input_buffer = "input"
"#,
            seeds.display(),
            out.display(),
            binary.display()
        )
    }

    #[test]
    fn load_minimal() {
        let seeds = write_seed_dir();
        let out = tempfile::tempdir().unwrap();
        let mut binary = tempfile::NamedTempFile::new().unwrap();
        binary.write_all(b"\x7fELF").unwrap();

        let toml = minimal_toml(binary.path(), seeds.path(), out.path());
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), toml).unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.instance, InstanceKind::Direct);
        assert_eq!(config.input_channel, InputChannelKind::File);
        assert_eq!(config.watchpoint_budget(), Some(4));
        assert_eq!(config.command_timeout(), Duration::from_secs(10));
        assert!(!config.delay_wp);
    }

    #[test]
    fn unlimited_watchpoints() {
        let seeds = write_seed_dir();
        let out = tempfile::tempdir().unwrap();
        let mut binary = tempfile::NamedTempFile::new().unwrap();
        binary.write_all(b"\x7fELF").unwrap();

        let mut toml = minimal_toml(binary.path(), seeds.path(), out.path());
        toml.push_str("watchpoint_count = -1\ninstance = \"memory-sandbox\"\n");
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), toml).unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.watchpoint_budget(), None);
        assert_eq!(config.instance, InstanceKind::MemorySandbox);
    }

    #[test]
    fn serial_requires_port() {
        let seeds = write_seed_dir();
        let out = tempfile::tempdir().unwrap();
        let mut binary = tempfile::NamedTempFile::new().unwrap();
        binary.write_all(b"\x7fELF").unwrap();

        let mut toml = minimal_toml(binary.path(), seeds.path(), out.path());
        toml.push_str("input_channel = \"serial\"\n");
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), toml).unwrap();

        assert!(matches!(
            Config::load(file.path()),
            Err(Error::ConfigInvalid(_))
        ));
    }

    #[test]
    fn bad_log_level_rejected() {
        let seeds = write_seed_dir();
        let out = tempfile::tempdir().unwrap();
        let mut binary = tempfile::NamedTempFile::new().unwrap();
        binary.write_all(b"\x7fELF").unwrap();

        let mut toml = minimal_toml(binary.path(), seeds.path(), out.path());
        toml.push_str("log_level = \"CHATTY\"\n");
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), toml).unwrap();

        assert!(Config::load(file.path()).is_err());
    }
}
