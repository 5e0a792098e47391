//! Seed delivery to the target: file argument, stdin redirection, or a
//! framed serial line for on-chip targets.

use crate::config::{Config, InputChannelKind};
use crate::error::{Error, Result};
use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

/// Launch-time shape of the configured channel: program arguments and
/// the stdin redirection, if any. The serial channel contributes
/// neither; the on-chip backend pushes the bytes itself through
/// [`SerialLink`].
pub fn launch_io(config: &Config, seed_path: &Path) -> (Vec<String>, Option<PathBuf>) {
    match config.input_channel {
        InputChannelKind::File => (vec![seed_path.display().to_string()], None),
        InputChannelKind::Stdin => (vec![], Some(seed_path.to_path_buf())),
        InputChannelKind::Serial => (vec![], None),
    }
}

/// A raw serial device. The line is configured by shelling out to
/// `stty`; frames are a little-endian length prefix plus the payload,
/// acknowledged by a single status byte.
pub struct SerialLink {
    device: std::fs::File,
    port: String,
}

impl SerialLink {
    pub fn open(port: &str, baud_rate: u32) -> Result<Self> {
        let status = Command::new("stty")
            .args(["-F", port, &baud_rate.to_string(), "raw", "-echo"])
            .status()?;
        if !status.success() {
            return Err(Error::ConfigInvalid(format!(
                "stty failed to configure {} at {} baud",
                port, baud_rate
            )));
        }

        let device = OpenOptions::new().read(true).write(true).open(port)?;
        info!(port, baud_rate, "serial line up");
        Ok(SerialLink {
            device,
            port: port.to_string(),
        })
    }

    /// The target announces readiness with an `A` byte.
    pub fn wait_for_input_request(&mut self) -> Result<()> {
        let mut byte = [0u8; 1];
        loop {
            self.device.read_exact(&mut byte)?;
            if byte[0] == b'A' {
                return Ok(());
            }
            debug!(byte = byte[0], port = %self.port, "discarding serial noise");
        }
    }

    /// Send one seed frame. Returns whether the target accepted it.
    pub fn send_input(&mut self, input: &[u8]) -> Result<bool> {
        debug!(len = input.len(), port = %self.port, "sending seed frame");
        self.device
            .write_all(&(input.len() as u32).to_le_bytes())?;
        self.device.write_all(input)?;
        self.device.flush()?;

        let mut ack = [0u8; 1];
        self.device.read_exact(&mut ack)?;
        match ack[0] {
            0x00 => Ok(true),
            0xff => Ok(false),
            other => Err(Error::DebuggerProtocolError(format!(
                "unexpected serial ack {:#04x}",
                other
            ))),
        }
    }
}
