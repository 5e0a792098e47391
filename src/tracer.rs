//! Drives one traced execution per seed: from the entrypoint to the
//! exitpoint, correlating watchpoint hits with frame identity and
//! emitting a raw parse tree.

use crate::adapter::{self, Debugger, Frame, StopEvent, WatchKind};
use crate::chan;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::oracle::Oracle;
use crate::sched::{HitOutcome, WatchScheduler};
use crate::tree::{CallSiteKey, FrameId, ParseNode, Seed, Trace};
use std::path::Path;
use tracing::{debug, info, warn};

/// One activation being traced: identity plus everything needed to
/// close it into a [`ParseNode`].
struct OpenFrame {
    id: FrameId,
    func: String,
    reads: Vec<usize>,
    children: Vec<ParseNode>,
    /// Rightmost consumed position below this frame; anchors epsilon
    /// children.
    watermark: usize,
}

impl OpenFrame {
    fn close(self) -> ParseNode {
        let mut lo = usize::MAX;
        let mut hi = 0usize;
        for &i in &self.reads {
            lo = lo.min(i);
            hi = hi.max(i + 1);
        }
        for child in &self.children {
            if child.lo < child.hi {
                lo = lo.min(child.lo);
                hi = hi.max(child.hi);
            }
        }
        if lo == usize::MAX {
            lo = self.watermark;
            hi = self.watermark;
        }
        ParseNode {
            frame: self.id,
            lo,
            hi,
            reads: self.reads,
            children: self.children,
            spans: vec![],
        }
    }
}

pub struct Tracer<'a> {
    config: &'a Config,
    oracle: &'a Oracle,
}

impl<'a> Tracer<'a> {
    pub fn new(config: &'a Config, oracle: &'a Oracle) -> Self {
        Tracer { config, oracle }
    }

    /// Trace one seed with a fresh backend. The returned tree is raw;
    /// the annotator makes it well-formed.
    pub fn trace_seed(&self, seed: &Seed, seed_path: &Path) -> Result<Trace> {
        let mut dbg = adapter::create(self.config, seed_path)?;
        self.run(dbg.as_mut(), seed, seed_path)
    }

    /// The per-seed state machine, on an already-constructed backend.
    pub fn run(&self, dbg: &mut dyn Debugger, seed: &Seed, seed_path: &Path) -> Result<Trace> {
        let n = seed.len();
        info!(seed = %seed.name, len = n, "tracing");

        // LaunchInit
        let (args, stdin) = chan::launch_io(self.config, seed_path);
        dbg.launch(&self.config.binary_file, &args, stdin.as_deref())?;
        dbg.set_breakpoint(self.oracle.entrypoint())?;
        match dbg.continue_until_stop()? {
            StopEvent::Breakpoint => {}
            other => {
                return Err(Error::DebuggerProtocolError(format!(
                    "target never reached the entrypoint: {:?}",
                    other
                )))
            }
        }

        // AtEntry
        let base = self.oracle.input_buffer_base(dbg)?;
        let entry_bt = dbg.get_backtrace()?;
        if entry_bt.is_empty() {
            return Err(Error::DebuggerProtocolError(
                "empty backtrace at entrypoint".into(),
            ));
        }
        let entry_depth = entry_bt.len();
        let entry_key = self.oracle.call_site_key(&entry_bt[0], entry_bt.get(1));

        let mut serial = 0u64;
        let mut open: Vec<OpenFrame> = vec![OpenFrame {
            id: FrameId {
                key: entry_key,
                depth: 0,
                serial,
            },
            func: entry_bt[0].func.clone(),
            reads: Vec::new(),
            children: Vec::new(),
            watermark: 0,
        }];

        if let Some(exit) = self.oracle.exitpoint() {
            dbg.set_breakpoint(exit)?;
        }

        let budget = match self.config.watchpoint_budget() {
            None => None,
            Some(0) => Some(0),
            Some(w) => Some(w.min(dbg.watchpoint_capacity())),
        };
        let mut sched = WatchScheduler::new(n, budget, self.config.delay_wp);
        sched.replan(dbg, base)?;

        // Running
        let mut truncated = false;
        loop {
            match dbg.continue_until_stop()? {
                StopEvent::WatchpointHit { id, addr, kind } => {
                    if kind == WatchKind::Write {
                        return Err(Error::DebuggerProtocolError(format!(
                            "target writes into the input buffer at {:#x}; \
                             in-place rewriting is unsupported",
                            addr
                        )));
                    }

                    let index = addr
                        .checked_sub(base)
                        .map(|d| d as usize)
                        .filter(|&i| i < n)
                        .or_else(|| sched.index_of(id));
                    let Some(index) = index else {
                        debug!(id, addr, "watchpoint hit outside the input buffer");
                        continue;
                    };

                    let bt = dbg.get_backtrace()?;
                    if bt.len() < entry_depth {
                        // returned past the entry frame: the parse is over
                        break;
                    }

                    self.sync_stack(&mut open, &bt, entry_depth, &mut serial, &mut sched);

                    let innermost = open.last().expect("entry frame stays open");
                    match sched.on_hit(index, innermost.id.serial, innermost.id.depth) {
                        HitOutcome::Attribute(i) => {
                            let top = open.last_mut().expect("entry frame stays open");
                            top.reads.push(i);
                            top.watermark = top.watermark.max(i + 1);
                        }
                        HitOutcome::Defer | HitOutcome::Ignore => {}
                    }

                    sched.replan(dbg, base)?;
                }
                StopEvent::Breakpoint => break, // only the exitpoint is left
                StopEvent::Exited(code) => {
                    if code != 0 {
                        warn!(code, seed = %seed.name, "target exited nonzero");
                        truncated = true;
                    }
                    break;
                }
                StopEvent::Signal(sig) => {
                    warn!(signal = %sig, seed = %seed.name, "target crashed mid-trace");
                    truncated = true;
                    break;
                }
                StopEvent::Timeout => {
                    warn!(seed = %seed.name, "trace timed out");
                    truncated = true;
                    break;
                }
                StopEvent::Stepped => {}
            }
        }

        // AtExit: close everything LIFO, settling deferred attributions
        while open.len() > 1 {
            Self::close_top(&mut open, &mut sched);
        }
        let mut root_frame = open.pop().expect("entry frame stays open");
        let late = sched.frame_closed(root_frame.id.serial);
        root_frame.reads.extend(late);
        for (i, _) in sched.finalize_all() {
            root_frame.reads.push(i);
        }
        let root = root_frame.close();

        // watchpoints die with the session anyway, but be tidy when the
        // target is still alive
        let _ = sched.disarm_all(dbg);

        Ok(Trace {
            seed_name: seed.name.clone(),
            input_len: n,
            root,
            truncated,
            partially_consumed: false,
        })
    }

    /// Reconcile the open-frame stack with the current backtrace.
    /// Frames are matched positionally by function symbol; a mismatch
    /// or a shallower stack closes frames LIFO, a deeper stack opens
    /// the new activations.
    fn sync_stack(
        &self,
        open: &mut Vec<OpenFrame>,
        bt: &[Frame],
        entry_depth: usize,
        serial: &mut u64,
        sched: &mut WatchScheduler,
    ) {
        // innermost..entry, flipped so path[0] is the entry frame
        let rel = bt.len() - entry_depth;
        let path: Vec<&Frame> = bt[..=rel].iter().rev().collect();

        let mut keep = 1;
        while keep < open.len() && keep < path.len() && open[keep].func == path[keep].func {
            keep += 1;
        }
        while open.len() > keep {
            Self::close_top(open, sched);
        }
        for depth in open.len()..path.len() {
            let frame = path[depth];
            let caller = path[depth - 1];
            *serial += 1;
            let watermark = open.last().map(|f| f.watermark).unwrap_or(0);
            debug!(func = %frame.func, depth, serial = *serial, "frame entered");
            open.push(OpenFrame {
                id: FrameId {
                    key: self.key_for(frame, caller),
                    depth,
                    serial: *serial,
                },
                func: frame.func.clone(),
                reads: Vec::new(),
                children: Vec::new(),
                watermark,
            });
        }
    }

    fn key_for(&self, frame: &Frame, caller: &Frame) -> CallSiteKey {
        self.oracle.call_site_key(frame, Some(caller))
    }

    fn close_top(open: &mut Vec<OpenFrame>, sched: &mut WatchScheduler) {
        let mut top = open.pop().expect("caller checked depth");
        let late = sched.frame_closed(top.id.serial);
        top.reads.extend(late);
        debug!(func = %top.func, serial = top.id.serial, "frame left");
        let node = top.close();
        let parent = open.last_mut().expect("entry frame stays open");
        parent.watermark = parent.watermark.max(node.hi);
        parent.children.push(node);
    }
}
