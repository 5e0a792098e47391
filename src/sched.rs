//! Watchpoint scheduling: which input indices carry a live read
//! watchpoint, and when a hit index is considered attributed.

use crate::adapter::{Debugger, WatchKind, WatchpointId};
use crate::error::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, trace};

/// What the tracer should do with a watchpoint hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitOutcome {
    /// Attribute the index to the current innermost frame now.
    Attribute(usize),
    /// Delay policy: candidate recorded, index stays armed.
    Defer,
    /// Re-read of an already-attributed index; unblocks execution only.
    Ignore,
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    serial: u64,
    depth: usize,
}

/// Maintains `Armed ⊆ [0, n)` with `|Armed| ≤ W`, the set of attributed
/// indices and the frontier `f = min unattributed`. After every stop
/// [`replan`](WatchScheduler::replan) slides a contiguous window of at
/// most `W` watchpoints forward from the frontier.
pub struct WatchScheduler {
    n: usize,
    window: usize,
    delay: bool,
    watch_expr_len: usize,
    armed: BTreeMap<usize, WatchpointId>,
    hit: Vec<bool>,
    hit_count: usize,
    /// Delay policy: indices read once, awaiting a deeper reader.
    pending: HashMap<usize, Pending>,
}

impl WatchScheduler {
    /// `budget`: None = unlimited (software watchpoints). A budget of 0
    /// also means software watchpoints: only the memory-sandbox backend
    /// supports either, by instrumenting every access, slow but
    /// correct.
    pub fn new(n: usize, budget: Option<usize>, delay: bool) -> Self {
        let window = match budget {
            Some(0) | None => n.max(1),
            Some(w) => w,
        };
        WatchScheduler {
            n,
            window,
            delay,
            watch_expr_len: 1,
            armed: BTreeMap::new(),
            hit: vec![false; n],
            hit_count: 0,
            pending: HashMap::new(),
        }
    }

    pub fn frontier(&self) -> usize {
        self.hit.iter().position(|h| !h).unwrap_or(self.n)
    }

    pub fn all_attributed(&self) -> bool {
        self.hit_count == self.n
    }

    pub fn armed_indices(&self) -> Vec<usize> {
        self.armed.keys().copied().collect()
    }

    /// Index of the watchpoint id, if it is one of ours.
    pub fn index_of(&self, id: WatchpointId) -> Option<usize> {
        self.armed
            .iter()
            .find(|(_, &wid)| wid == id)
            .map(|(&i, _)| i)
    }

    /// Slide the window: clear resolved watchpoints, arm up to `W`
    /// contiguous indices from the frontier.
    pub fn replan(&mut self, dbg: &mut dyn Debugger, base: u64) -> Result<()> {
        let f = self.frontier();

        let stale: Vec<usize> = self
            .armed
            .range(..f)
            .map(|(&i, _)| i)
            .collect();
        for i in stale {
            let id = self.armed.remove(&i).unwrap();
            dbg.clear_watchpoint(id)?;
        }
        // an armed index at or past the frontier that was hit without
        // the delay policy holding it is resolved too
        let resolved: Vec<usize> = self
            .armed
            .keys()
            .copied()
            .filter(|&i| self.hit[i])
            .collect();
        for i in resolved {
            let id = self.armed.remove(&i).unwrap();
            dbg.clear_watchpoint(id)?;
        }

        // fill the budget with the first unattributed indices from the
        // frontier on
        let mut i = f;
        while i < self.n && self.armed.len() < self.window {
            if !self.hit[i] && !self.armed.contains_key(&i) {
                let id =
                    dbg.set_watchpoint(base + i as u64, self.watch_expr_len, WatchKind::Read)?;
                self.armed.insert(i, id);
            }
            i += 1;
        }

        if self.armed.len() > self.window {
            return Err(Error::WatchpointBudgetExceeded {
                armed: self.armed.len(),
                budget: self.window,
            });
        }
        trace!(frontier = f, armed = self.armed.len(), "replanned");
        Ok(())
    }

    /// A read of index `i` while the innermost open frame is `serial`
    /// at `depth`.
    pub fn on_hit(&mut self, i: usize, serial: u64, depth: usize) -> HitOutcome {
        if i >= self.n || self.hit[i] {
            return HitOutcome::Ignore;
        }

        if !self.delay {
            self.mark_hit(i);
            return HitOutcome::Attribute(i);
        }

        match self.pending.get(&i).copied() {
            None => {
                self.pending.insert(i, Pending { serial, depth });
                debug!(index = i, depth, "attribution deferred");
                HitOutcome::Defer
            }
            Some(p) if depth > p.depth => {
                // a deeper frame read it: the innermost reader wins
                self.pending.remove(&i);
                self.mark_hit(i);
                HitOutcome::Attribute(i)
            }
            Some(_) => HitOutcome::Ignore,
        }
    }

    /// A frame left the stack: finalize every index whose candidate was
    /// that frame. Returns the indices now attributed to it.
    pub fn frame_closed(&mut self, serial: u64) -> Vec<usize> {
        let mut finalized: Vec<usize> = self
            .pending
            .iter()
            .filter(|(_, p)| p.serial == serial)
            .map(|(&i, _)| i)
            .collect();
        finalized.sort_unstable();
        for &i in &finalized {
            self.pending.remove(&i);
            self.mark_hit(i);
        }
        finalized
    }

    /// Trace over: whatever is still deferred belongs to its candidate.
    /// Returns `(index, frame serial)` pairs.
    pub fn finalize_all(&mut self) -> Vec<(usize, u64)> {
        let mut rest: Vec<(usize, u64)> = self
            .pending
            .drain()
            .map(|(i, p)| (i, p.serial))
            .collect();
        rest.sort_unstable();
        for &(i, _) in &rest {
            self.mark_hit(i);
        }
        rest
    }

    pub fn disarm_all(&mut self, dbg: &mut dyn Debugger) -> Result<()> {
        for (_, id) in std::mem::take(&mut self.armed) {
            dbg.clear_watchpoint(id)?;
        }
        Ok(())
    }

    fn mark_hit(&mut self, i: usize) {
        if !self.hit[i] {
            self.hit[i] = true;
            self.hit_count += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{Frame, Location, StopEvent};
    use crate::error::Result;
    use std::path::Path;

    /// Counts watchpoint traffic, hands out ids.
    struct CountingDebugger {
        next_id: WatchpointId,
        live: Vec<WatchpointId>,
    }

    impl CountingDebugger {
        fn new() -> Self {
            CountingDebugger {
                next_id: 1,
                live: vec![],
            }
        }
    }

    impl Debugger for CountingDebugger {
        fn launch(&mut self, _: &Path, _: &[String], _: Option<&Path>) -> Result<()> {
            Ok(())
        }
        fn set_breakpoint(&mut self, _: &Location) -> Result<u32> {
            Ok(0)
        }
        fn continue_until_stop(&mut self) -> Result<StopEvent> {
            Ok(StopEvent::Exited(0))
        }
        fn step_instruction(&mut self) -> Result<StopEvent> {
            Ok(StopEvent::Exited(0))
        }
        fn step_out(&mut self) -> Result<StopEvent> {
            Ok(StopEvent::Exited(0))
        }
        fn read_memory(&mut self, _: u64, len: usize) -> Result<Vec<u8>> {
            Ok(vec![0; len])
        }
        fn write_memory(&mut self, _: u64, _: &[u8]) -> Result<()> {
            Ok(())
        }
        fn get_registers(&mut self) -> Result<Vec<(String, u64)>> {
            Ok(vec![])
        }
        fn resolve_symbol(&mut self, _: &str) -> Result<u64> {
            Ok(0)
        }
        fn get_backtrace(&mut self) -> Result<Vec<Frame>> {
            Ok(vec![])
        }
        fn set_watchpoint(&mut self, _: u64, _: usize, _: WatchKind) -> Result<WatchpointId> {
            let id = self.next_id;
            self.next_id += 1;
            self.live.push(id);
            Ok(id)
        }
        fn clear_watchpoint(&mut self, id: WatchpointId) -> Result<()> {
            self.live.retain(|&l| l != id);
            Ok(())
        }
        fn watchpoint_capacity(&self) -> usize {
            usize::MAX
        }
    }

    #[test]
    fn window_slides_forward() {
        let mut dbg = CountingDebugger::new();
        let mut sched = WatchScheduler::new(6, Some(2), false);

        sched.replan(&mut dbg, 0x1000).unwrap();
        assert_eq!(sched.armed_indices(), vec![0, 1]);
        assert_eq!(dbg.live.len(), 2);

        assert_eq!(sched.on_hit(0, 0, 0), HitOutcome::Attribute(0));
        sched.replan(&mut dbg, 0x1000).unwrap();
        assert_eq!(sched.armed_indices(), vec![1, 2]);

        assert_eq!(sched.on_hit(1, 0, 0), HitOutcome::Attribute(1));
        assert_eq!(sched.on_hit(2, 0, 0), HitOutcome::Attribute(2));
        sched.replan(&mut dbg, 0x1000).unwrap();
        assert_eq!(sched.armed_indices(), vec![3, 4]);
        assert_eq!(dbg.live.len(), 2);
    }

    #[test]
    fn out_of_order_hits_keep_frontier() {
        let mut dbg = CountingDebugger::new();
        let mut sched = WatchScheduler::new(4, Some(3), false);
        sched.replan(&mut dbg, 0).unwrap();

        // index 1 read before index 0
        assert_eq!(sched.on_hit(1, 0, 0), HitOutcome::Attribute(1));
        sched.replan(&mut dbg, 0).unwrap();
        // frontier still 0; hole at 1 is resolved, 3 joins the window
        assert_eq!(sched.armed_indices(), vec![0, 2, 3]);
    }

    #[test]
    fn rereads_are_ignored() {
        let mut dbg = CountingDebugger::new();
        let mut sched = WatchScheduler::new(3, Some(3), false);
        sched.replan(&mut dbg, 0).unwrap();

        assert_eq!(sched.on_hit(0, 0, 0), HitOutcome::Attribute(0));
        assert_eq!(sched.on_hit(0, 5, 3), HitOutcome::Ignore);
    }

    #[test]
    fn unlimited_budget_arms_everything() {
        let mut dbg = CountingDebugger::new();
        let mut sched = WatchScheduler::new(10, None, false);
        sched.replan(&mut dbg, 0).unwrap();
        assert_eq!(sched.armed_indices().len(), 10);
    }

    #[test]
    fn delay_waits_for_deeper_reader() {
        let mut dbg = CountingDebugger::new();
        let mut sched = WatchScheduler::new(3, Some(3), true);
        sched.replan(&mut dbg, 0).unwrap();

        // frame 7 at depth 1 reads index 0: deferred, still armed
        assert_eq!(sched.on_hit(0, 7, 1), HitOutcome::Defer);
        assert!(sched.armed_indices().contains(&0));

        // frame 9 at depth 2 re-reads: attributed to the deeper frame
        assert_eq!(sched.on_hit(0, 9, 2), HitOutcome::Attribute(0));
        sched.replan(&mut dbg, 0).unwrap();
        assert!(!sched.armed_indices().contains(&0));
    }

    #[test]
    fn delay_finalizes_on_frame_close() {
        let mut dbg = CountingDebugger::new();
        let mut sched = WatchScheduler::new(3, Some(3), true);
        sched.replan(&mut dbg, 0).unwrap();

        assert_eq!(sched.on_hit(0, 7, 1), HitOutcome::Defer);
        // a shallower read does not steal it
        assert_eq!(sched.on_hit(0, 3, 0), HitOutcome::Ignore);

        assert_eq!(sched.frame_closed(7), vec![0]);
        assert!(sched.frontier() > 0);
    }

    #[test]
    fn delay_finalize_all_at_exit() {
        let mut dbg = CountingDebugger::new();
        let mut sched = WatchScheduler::new(2, Some(2), true);
        sched.replan(&mut dbg, 0).unwrap();

        sched.on_hit(0, 7, 1);
        sched.on_hit(1, 8, 2);
        let rest = sched.finalize_all();
        assert_eq!(rest, vec![(0, 7), (1, 8)]);
        assert!(sched.all_attributed());
    }

    #[test]
    fn disarm_releases_every_handle() {
        let mut dbg = CountingDebugger::new();
        let mut sched = WatchScheduler::new(8, Some(4), false);
        sched.replan(&mut dbg, 0).unwrap();
        assert_eq!(dbg.live.len(), 4);
        sched.disarm_all(&mut dbg).unwrap();
        assert!(dbg.live.is_empty());
    }
}
