//! Cross-core synchronization: flags between a matrix core and its paired
//! vector cores, plus whole-kind barriers.
//!
//! Flags are counting semaphores scoped to one AIC group (one matrix core and
//! the vector cores paired with it). A set toward the vector side posts one
//! credit to every vector core in the group; a wait on the matrix side
//! consumes one credit from each paired vector core. Data still travels only
//! through global memory; flags carry ordering, never data.

use std::sync::{Barrier, Condvar, Mutex};
use std::time::Duration;

use crate::arch::CoreKind;

/// Flag ids available per group and direction.
pub const FLAG_ID_MAX: u8 = 16;

/// Sets a flag may run ahead of its reverse acknowledgement.
pub const MAX_REVERSE_DEPTH: u32 = 16;

/// Cross-core wait longer than this is reported as a hang.
const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Identifies one cross-core flag within a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlagId(pub u8);

struct Sem {
    count: Mutex<u32>,
    cv: Condvar,
}

impl Sem {
    fn new() -> Self {
        Sem {
            count: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    fn post(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.cv.notify_all();
    }

    fn wait(&self, what: &str) {
        let count = self.count.lock().unwrap();
        let (mut count, timeout) = self
            .cv
            .wait_timeout_while(count, WAIT_TIMEOUT, |c| *c == 0)
            .unwrap();
        assert!(!timeout.timed_out(), "cross-core wait hung on {}", what);
        *count -= 1;
    }
}

struct Group {
    /// `[aiv_idx][flag]`, credits posted by the matrix core.
    to_aiv: Vec<Vec<Sem>>,
    /// `[aiv_idx][flag]`, credits posted by each vector core.
    to_aic: Vec<Vec<Sem>>,
}

/// All cross-core flags and barriers for one launch.
pub struct FlagHub {
    aiv_per_aic: u32,
    groups: Vec<Group>,
    aic_barrier: Barrier,
    aiv_barrier: Barrier,
    group_barriers: Vec<Barrier>,
}

impl FlagHub {
    pub fn new(aic_num: u32, aiv_per_aic: u32) -> Self {
        let make_sems = || -> Vec<Vec<Sem>> {
            (0..aiv_per_aic)
                .map(|_| (0..FLAG_ID_MAX).map(|_| Sem::new()).collect())
                .collect()
        };
        FlagHub {
            aiv_per_aic,
            groups: (0..aic_num)
                .map(|_| Group {
                    to_aiv: make_sems(),
                    to_aic: make_sems(),
                })
                .collect(),
            aic_barrier: Barrier::new(aic_num as usize),
            aiv_barrier: Barrier::new((aic_num * aiv_per_aic) as usize),
            group_barriers: (0..aic_num)
                .map(|_| Barrier::new(1 + aiv_per_aic as usize))
                .collect(),
        }
    }

    #[inline]
    pub fn aiv_per_aic(&self) -> u32 {
        self.aiv_per_aic
    }

    fn group(&self, group: u32) -> &Group {
        &self.groups[group as usize]
    }

    /// Matrix core posts `flag` to every vector core in its group.
    pub fn set_to_aiv(&self, group: u32, flag: FlagId) {
        for sems in &self.group(group).to_aiv {
            sems[flag.0 as usize].post();
        }
    }

    /// Vector core `aiv_idx` consumes one credit of `flag`.
    pub fn wait_on_aiv(&self, group: u32, aiv_idx: u32, flag: FlagId) {
        self.group(group).to_aiv[aiv_idx as usize][flag.0 as usize]
            .wait("aic-to-aiv flag");
    }

    /// Vector core `aiv_idx` posts `flag` toward its matrix core.
    pub fn set_to_aic(&self, group: u32, aiv_idx: u32, flag: FlagId) {
        self.group(group).to_aic[aiv_idx as usize][flag.0 as usize].post();
    }

    /// Matrix core consumes one credit of `flag` from each paired vector
    /// core. Returns only when every vector core has posted.
    pub fn wait_on_aic(&self, group: u32, flag: FlagId) {
        for sems in &self.group(group).to_aic {
            sems[flag.0 as usize].wait("aiv-to-aic flag");
        }
    }

    /// Barrier across every core of one kind.
    pub fn barrier(&self, kind: CoreKind) {
        match kind {
            CoreKind::Aic => self.aic_barrier.wait(),
            CoreKind::Aiv => self.aiv_barrier.wait(),
        };
    }

    /// Barrier across one group: the matrix core and its paired vector cores.
    pub fn barrier_group(&self, group: u32) {
        self.group_barriers[group as usize].wait();
    }
}

/// Rendezvous of every core of `kind`.
pub fn cross_core_barrier(hub: &FlagHub, kind: CoreKind) {
    hub.barrier(kind);
}

/// One-directional flag with no backpressure. The producer may run ahead of
/// the consumer without bound.
#[derive(Debug, Clone, Copy)]
pub struct CrossCoreFlag {
    pub id: FlagId,
}

impl CrossCoreFlag {
    pub const fn new(id: FlagId) -> Self {
        CrossCoreFlag { id }
    }
}

/// Flag paired with a reverse flag for bounded-depth backpressure.
///
/// After `depth` sets the producer blocks until the consumer has acknowledged
/// a full window through the reverse flag; the consumer posts that
/// acknowledgement after `depth` waits. Each side keeps its own window
/// counter.
#[derive(Debug)]
pub struct CrossCoreFlagWithReverse {
    id: FlagId,
    reverse_id: FlagId,
    depth: u32,
    set_count: u32,
    wait_count: u32,
}

impl CrossCoreFlagWithReverse {
    pub fn new(id: FlagId, reverse_id: FlagId, depth: u32) -> Self {
        assert!(
            depth >= 1 && depth <= MAX_REVERSE_DEPTH,
            "reverse depth {} outside 1..={}",
            depth,
            MAX_REVERSE_DEPTH
        );
        assert!(id != reverse_id, "flag and reverse flag must differ");
        CrossCoreFlagWithReverse {
            id,
            reverse_id,
            depth,
            set_count: 0,
            wait_count: 0,
        }
    }

    /// Matrix-core set toward the vector side.
    pub fn set_from_aic(&mut self, hub: &FlagHub, group: u32) {
        hub.set_to_aiv(group, self.id);
        self.set_count += 1;
        if self.set_count >= self.depth {
            hub.wait_on_aic(group, self.reverse_id);
            self.set_count = 0;
        }
    }

    /// Vector-core wait matching [`Self::set_from_aic`].
    pub fn wait_on_aiv(&mut self, hub: &FlagHub, group: u32, aiv_idx: u32) {
        hub.wait_on_aiv(group, aiv_idx, self.id);
        self.wait_count += 1;
        if self.wait_count >= self.depth {
            hub.set_to_aic(group, aiv_idx, self.reverse_id);
            self.wait_count = 0;
        }
    }

    /// Vector-core set toward the matrix side.
    pub fn set_from_aiv(&mut self, hub: &FlagHub, group: u32, aiv_idx: u32) {
        hub.set_to_aic(group, aiv_idx, self.id);
        self.set_count += 1;
        if self.set_count >= self.depth {
            hub.wait_on_aiv(group, aiv_idx, self.reverse_id);
            self.set_count = 0;
        }
    }

    /// Matrix-core wait matching [`Self::set_from_aiv`].
    pub fn wait_on_aic(&mut self, hub: &FlagHub, group: u32) {
        hub.wait_on_aic(group, self.id);
        self.wait_count += 1;
        if self.wait_count >= self.depth {
            hub.set_to_aiv(group, self.reverse_id);
            self.wait_count = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_aic_set_reaches_every_aiv() {
        let hub = FlagHub::new(1, 2);
        let flag = FlagId(0);
        thread::scope(|s| {
            s.spawn(|| hub.set_to_aiv(0, flag));
            s.spawn(|| hub.wait_on_aiv(0, 0, flag));
            s.spawn(|| hub.wait_on_aiv(0, 1, flag));
        });
    }

    #[test]
    fn test_aic_wait_needs_all_aivs() {
        let hub = FlagHub::new(1, 2);
        let flag = FlagId(3);
        thread::scope(|s| {
            s.spawn(|| {
                hub.wait_on_aic(0, flag);
            });
            s.spawn(|| hub.set_to_aic(0, 0, flag));
            s.spawn(|| hub.set_to_aic(0, 1, flag));
        });
    }

    #[test]
    fn test_groups_are_isolated() {
        let hub = FlagHub::new(2, 1);
        let flag = FlagId(1);
        hub.set_to_aiv(0, flag);
        // Group 1 never sees group 0's credit; a wait there would hang.
        hub.wait_on_aiv(0, 0, flag);
    }

    #[test]
    fn test_reverse_flag_bounds_producer() {
        // Depth 2: the producer must block on the third set until the
        // consumer has drained a full window.
        let hub = FlagHub::new(1, 1);
        thread::scope(|s| {
            s.spawn(|| {
                let mut f = CrossCoreFlagWithReverse::new(FlagId(0), FlagId(1), 2);
                for _ in 0..6 {
                    f.set_from_aic(&hub, 0);
                }
            });
            s.spawn(|| {
                let mut f = CrossCoreFlagWithReverse::new(FlagId(0), FlagId(1), 2);
                for _ in 0..6 {
                    f.wait_on_aiv(&hub, 0, 0);
                }
            });
        });
    }

    #[test]
    #[should_panic(expected = "reverse depth")]
    fn test_depth_above_max_rejected() {
        let _ = CrossCoreFlagWithReverse::new(FlagId(0), FlagId(1), MAX_REVERSE_DEPTH + 1);
    }
}
