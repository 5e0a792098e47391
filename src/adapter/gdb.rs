//! gdb/MI session plumbing shared by every backend: subprocess
//! management, a reader thread feeding parsed records over a channel,
//! and synchronous command execution under the per-command timeout.

use super::mi::{self, AsyncKind, AsyncRecord, Record, ResultClass, ResultRecord, StreamKind};
use super::{Frame, StopEvent, WatchKind, WatchpointId};
use crate::error::{Error, Result};
use std::collections::{HashMap, VecDeque};
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;
use tracing::{debug, trace, warn};

pub struct GdbSession {
    child: Child,
    stdin: std::process::ChildStdin,
    rx: flume::Receiver<Record>,
    timeout: Duration,
    /// `*stopped` records seen while waiting for a result record.
    stops: VecDeque<AsyncRecord>,
    /// Our watchpoints: gdb number → watched address.
    watch_addrs: HashMap<WatchpointId, u64>,
}

impl GdbSession {
    /// Spawn `gdb_path` (which may carry extra arguments) in MI3 mode.
    pub fn spawn(gdb_path: &str, timeout: Duration) -> Result<Self> {
        let mut parts = gdb_path.split_whitespace();
        let gdb = parts
            .next()
            .ok_or_else(|| Error::ConfigInvalid("gdb_path is empty".into()))?;

        let mut child = Command::new(gdb)
            .args(parts)
            .args(["--nx", "--quiet", "--interpreter=mi3"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let stdin = child.stdin.take().expect("stdin was piped");
        let stdout = child.stdout.take().expect("stdout was piped");

        let (tx, rx) = flume::unbounded();
        thread::spawn(move || {
            let reader = BufReader::new(stdout);
            for line in reader.lines() {
                let Ok(line) = line else { break };
                if line.is_empty() {
                    continue;
                }
                match mi::parse_line(&line) {
                    Ok(record) => {
                        if tx.send(record).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(%line, error = %e, "unparseable MI record"),
                }
            }
            // EOF: gdb went away, the channel closing tells the session
        });

        let mut session = GdbSession {
            child,
            stdin,
            rx,
            timeout,
            stops: VecDeque::new(),
            watch_addrs: HashMap::new(),
        };

        session.execute("-gdb-set confirm off")?;
        session.execute("-gdb-set breakpoint pending on")?;
        Ok(session)
    }

    /// Write one MI command and collect records until its result record
    /// arrives. Async stops seen on the way are queued for
    /// [`wait_for_stop`](Self::wait_for_stop).
    pub fn execute(&mut self, cmd: &str) -> Result<ResultRecord> {
        debug!(%cmd, "gdb");
        writeln!(self.stdin, "{}", cmd)?;
        self.stdin.flush()?;

        loop {
            let record = self
                .rx
                .recv_timeout(self.timeout)
                .map_err(|_| Error::BackendUnresponsive(format!("executing '{}'", cmd)))?;
            match record {
                Record::Result(result) => return Ok(result),
                Record::Async(rec) => self.stash(rec),
                Record::Stream(StreamKind::Console, text) => trace!(%text, "gdb console"),
                Record::Stream(_, _) | Record::Prompt => {}
            }
        }
    }

    /// Like [`execute`](Self::execute) but an `^error` answer is a
    /// protocol error.
    pub fn expect_done(&mut self, cmd: &str) -> Result<ResultRecord> {
        let result = self.execute(cmd)?;
        if result.class == ResultClass::Error {
            let msg = mi::lookup(&result.results, "msg")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error");
            return Err(Error::DebuggerProtocolError(format!(
                "'{}' failed: {}",
                cmd, msg
            )));
        }
        Ok(result)
    }

    fn stash(&mut self, rec: AsyncRecord) {
        if rec.kind == AsyncKind::Exec && rec.class == "stopped" {
            self.stops.push_back(rec);
        }
    }

    /// Next `*stopped` record; `None` when the per-command timeout
    /// expires with the target still running.
    pub fn wait_for_stop(&mut self) -> Result<Option<AsyncRecord>> {
        loop {
            if let Some(stop) = self.stops.pop_front() {
                return Ok(Some(stop));
            }
            match self.rx.recv_timeout(self.timeout) {
                Ok(Record::Async(rec)) => self.stash(rec),
                Ok(Record::Stream(StreamKind::Console, text)) => trace!(%text, "gdb console"),
                Ok(_) => {}
                Err(flume::RecvTimeoutError::Timeout) => return Ok(None),
                Err(flume::RecvTimeoutError::Disconnected) => {
                    return Err(Error::BackendUnresponsive(
                        "gdb closed its output stream".into(),
                    ))
                }
            }
        }
    }

    /// Translate a `*stopped` record into the adapter's stop event.
    pub fn stop_event(&self, stop: &AsyncRecord) -> StopEvent {
        let reason = mi::lookup(&stop.results, "reason")
            .and_then(|v| v.as_str())
            .unwrap_or("");

        match reason {
            "breakpoint-hit" => StopEvent::Breakpoint,
            "read-watchpoint-trigger" | "access-watchpoint-trigger" | "watchpoint-trigger" => {
                let key = match reason {
                    "read-watchpoint-trigger" => "hw-rwpt",
                    "access-watchpoint-trigger" => "hw-awpt",
                    _ => "wpt",
                };
                let kind = match reason {
                    "read-watchpoint-trigger" => WatchKind::Read,
                    "access-watchpoint-trigger" => WatchKind::ReadWrite,
                    _ => WatchKind::Write,
                };
                let id = mi::lookup(&stop.results, key)
                    .and_then(|v| match v {
                        // sometimes a list of duplicates; the first one counts
                        mi::Value::List(items) => items.first().cloned(),
                        v => Some(v.clone()),
                    })
                    .and_then(|v| v.get("number").and_then(|n| n.as_u64()))
                    .unwrap_or(0) as WatchpointId;
                let addr = self.watch_addrs.get(&id).copied().unwrap_or(0);
                StopEvent::WatchpointHit { id, addr, kind }
            }
            "signal-received" => {
                let name = mi::lookup(&stop.results, "signal-name")
                    .and_then(|v| v.as_str())
                    .unwrap_or("UNKNOWN");
                StopEvent::Signal(name.to_string())
            }
            "exited-normally" => StopEvent::Exited(0),
            "exited" => {
                // exit-code is octal in MI
                let code = mi::lookup(&stop.results, "exit-code")
                    .and_then(|v| v.as_str())
                    .and_then(|s| i32::from_str_radix(s, 8).ok())
                    .unwrap_or(-1);
                StopEvent::Exited(code)
            }
            "exited-signalled" => {
                let name = mi::lookup(&stop.results, "signal-name")
                    .and_then(|v| v.as_str())
                    .unwrap_or("UNKNOWN");
                StopEvent::Signal(name.to_string())
            }
            "end-stepping-range" | "function-finished" | "" => StopEvent::Stepped,
            other => {
                warn!(reason = other, "unrecognized stop reason");
                StopEvent::Stepped
            }
        }
    }

    pub fn load_binary(&mut self, path: &std::path::Path) -> Result<()> {
        self.expect_done(&format!("-file-exec-and-symbols {}", path.display()))?;
        Ok(())
    }

    pub fn insert_breakpoint(&mut self, spec: &str) -> Result<u32> {
        // temporary: both uses (entry, exit) are one-shot per trace
        let result = self.expect_done(&format!("-break-insert -t {}", spec))?;
        let number = mi::lookup(&result.results, "bkpt")
            .and_then(|b| b.get("number"))
            .and_then(|n| n.as_u64())
            .ok_or_else(|| {
                Error::DebuggerProtocolError("breakpoint reply without number".into())
            })?;
        Ok(number as u32)
    }

    /// `watch_expr` is the configured pointer type, e.g. `(char*)`.
    pub fn insert_watchpoint(
        &mut self,
        addr: u64,
        kind: WatchKind,
        watch_expr: &str,
    ) -> Result<WatchpointId> {
        let flag = match kind {
            WatchKind::Read => "-r ",
            WatchKind::ReadWrite => "-a ",
            WatchKind::Write => "",
        };
        let type_cast = if watch_expr.is_empty() {
            "(char*)"
        } else {
            watch_expr
        };
        let result = self.expect_done(&format!(
            "-break-watch {}*{}{:#x}",
            flag, type_cast, addr
        ))?;
        let number = ["wpt", "hw-rwpt", "hw-awpt"]
            .iter()
            .find_map(|key| mi::lookup(&result.results, key))
            .and_then(|w| w.get("number"))
            .and_then(|n| n.as_u64())
            .ok_or_else(|| {
                Error::DebuggerProtocolError("watchpoint reply without number".into())
            })? as WatchpointId;
        self.watch_addrs.insert(number, addr);
        Ok(number)
    }

    pub fn delete_breakpoint(&mut self, id: u32) -> Result<()> {
        self.expect_done(&format!("-break-delete {}", id))?;
        self.watch_addrs.remove(&id);
        Ok(())
    }

    pub fn read_memory(&mut self, addr: u64, len: usize) -> Result<Vec<u8>> {
        let result =
            self.expect_done(&format!("-data-read-memory-bytes {:#x} {}", addr, len))?;
        let contents = mi::lookup(&result.results, "memory")
            .and_then(|m| m.as_list())
            .and_then(|items| items.first())
            .and_then(|item| item.get("contents"))
            .and_then(|c| c.as_str())
            .ok_or_else(|| Error::DebuggerProtocolError("memory reply without contents".into()))?;
        hex::decode(contents)
            .map_err(|e| Error::DebuggerProtocolError(format!("bad memory contents: {}", e)))
    }

    pub fn write_memory(&mut self, addr: u64, bytes: &[u8]) -> Result<()> {
        self.expect_done(&format!(
            "-data-write-memory-bytes {:#x} {}",
            addr,
            hex::encode(bytes)
        ))?;
        Ok(())
    }

    pub fn registers(&mut self) -> Result<Vec<(String, u64)>> {
        let names = self.expect_done("-data-list-register-names")?;
        let names: Vec<String> = mi::lookup(&names.results, "register-names")
            .and_then(|v| v.as_list())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let values = self.expect_done("-data-list-register-values x")?;
        let mut out = Vec::new();
        if let Some(items) = mi::lookup(&values.results, "register-values").and_then(|v| v.as_list())
        {
            for item in items {
                let number = item.get("number").and_then(|n| n.as_u64());
                let value = item.get("value").and_then(|v| v.as_u64());
                if let (Some(number), Some(value)) = (number, value) {
                    if let Some(name) = names.get(number as usize) {
                        if !name.is_empty() {
                            out.push((name.clone(), value));
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    pub fn evaluate_address(&mut self, expr: &str) -> Result<u64> {
        let result = self.expect_done(&format!("-data-evaluate-expression {}", expr))?;
        let value = mi::lookup(&result.results, "value")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::DebuggerProtocolError("evaluate reply without value".into()))?;
        // value looks like "0x601040", "0x601040 <input>" or
        // "{char [64]} 0x601040 <input>"
        value
            .split_whitespace()
            .find_map(|tok| {
                tok.strip_prefix("0x")
                    .and_then(|hex| u64::from_str_radix(hex, 16).ok())
            })
            .ok_or_else(|| {
                Error::DebuggerProtocolError(format!("no address in value '{}'", value))
            })
    }

    pub fn backtrace(&mut self) -> Result<Vec<Frame>> {
        let result = self.expect_done("-stack-list-frames")?;
        let stack = mi::lookup(&result.results, "stack")
            .and_then(|v| v.as_list())
            .ok_or_else(|| Error::DebuggerProtocolError("stack reply without frames".into()))?;

        let mut frames = Vec::with_capacity(stack.len());
        for item in stack {
            let frame = item
                .get("frame")
                .ok_or_else(|| Error::DebuggerProtocolError("frame entry malformed".into()))?;
            frames.push(Frame {
                level: frame
                    .get("level")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(frames.len() as u64) as usize,
                addr: frame.get("addr").and_then(|v| v.as_u64()).unwrap_or(0),
                func: frame
                    .get("func")
                    .and_then(|v| v.as_str())
                    .unwrap_or("??")
                    .to_string(),
                file: frame
                    .get("file")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                line: frame
                    .get("line")
                    .and_then(|v| v.as_u64())
                    .map(|l| l as u32),
            });
        }
        Ok(frames)
    }

    /// Continue and wait. `None` stop means the timeout elapsed.
    pub fn continue_and_wait(&mut self, first_run: bool) -> Result<StopEvent> {
        let cmd = if first_run { "-exec-run" } else { "-exec-continue" };
        self.expect_done(cmd)?;
        match self.wait_for_stop()? {
            Some(stop) => Ok(self.stop_event(&stop)),
            None => Ok(StopEvent::Timeout),
        }
    }

    pub fn step_and_wait(&mut self, cmd: &str) -> Result<StopEvent> {
        self.expect_done(cmd)?;
        match self.wait_for_stop()? {
            Some(stop) => Ok(self.stop_event(&stop)),
            None => Ok(StopEvent::Timeout),
        }
    }

    /// Forget stops seen during attach/reset so the tracer only ever
    /// observes stops it caused.
    pub fn drain_stops(&mut self) {
        self.stops.clear();
    }

    pub fn target_select(&mut self, target: &str) -> Result<()> {
        self.expect_done(&format!("-target-select extended-remote {}", target))?;
        Ok(())
    }

    pub fn monitor(&mut self, cmd: &str) -> Result<()> {
        self.expect_done(&format!("-interpreter-exec console \"monitor {}\"", cmd))?;
        Ok(())
    }

    pub fn console(&mut self, cmd: &str) -> Result<()> {
        self.expect_done(&format!("-interpreter-exec console \"{}\"", cmd))?;
        Ok(())
    }
}

impl Drop for GdbSession {
    fn drop(&mut self) {
        // best effort orderly exit, then make sure the process is gone
        let _ = writeln!(self.stdin, "-gdb-exit");
        let _ = self.stdin.flush();
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
