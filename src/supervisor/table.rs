//! The process table: one slot per worker process.
//!
//! Owned and mutated only by the supervisor. Workers never write here;
//! they exit, and the supervisor observes that through wait.

use nix::unistd::Pid;

/// Lifecycle state of one process slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    /// Never occupied, or cleared after a reaped exit.
    Empty,
    /// Freshly forked, not yet promoted by a maintenance pass.
    Starting,
    /// Serving.
    Ready,
    /// Told to wind down (graceful restart) but not yet reaped.
    Dying,
    /// Reaped; pid is gone.
    Dead,
}

/// One worker process slot.
#[derive(Debug, Clone, Copy)]
pub struct ProcessSlot {
    pid: Option<Pid>,
    status: SlotStatus,
}

impl ProcessSlot {
    fn empty() -> Self {
        Self {
            pid: None,
            status: SlotStatus::Empty,
        }
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    pub fn status(&self) -> SlotStatus {
        self.status
    }

    /// A slot holds a live process exactly when it has a pid.
    pub fn is_live(&self) -> bool {
        !matches!(self.status, SlotStatus::Empty | SlotStatus::Dead)
    }
}

/// Fixed-size table of worker process slots.
#[derive(Debug)]
pub struct ProcessTable {
    slots: Vec<ProcessSlot>,
}

impl ProcessTable {
    pub fn new(max_processes: usize) -> Self {
        Self {
            slots: vec![ProcessSlot::empty(); max_processes],
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slot(&self, index: usize) -> &ProcessSlot {
        &self.slots[index]
    }

    /// Grow the table for a raised process count; live slots are kept.
    /// The table never shrinks while slots may be live.
    pub fn grow(&mut self, max_processes: usize) {
        while self.slots.len() < max_processes {
            self.slots.push(ProcessSlot::empty());
        }
    }

    /// Record a fork into `index`.
    pub fn started(&mut self, index: usize, pid: Pid) {
        debug_assert!(!self.slots[index].is_live(), "slot already occupied");
        self.slots[index] = ProcessSlot {
            pid: Some(pid),
            status: SlotStatus::Starting,
        };
    }

    /// Promote freshly started slots; run by the supervisor on quiet
    /// maintenance cycles once the fork has had a moment to come up.
    pub fn promote_started(&mut self) {
        for slot in &mut self.slots {
            if slot.status == SlotStatus::Starting {
                slot.status = SlotStatus::Ready;
            }
        }
    }

    /// Mark every live slot as winding down. Returns how many there were.
    pub fn mark_all_dying(&mut self) -> usize {
        let mut count = 0;
        for slot in &mut self.slots {
            if slot.is_live() {
                slot.status = SlotStatus::Dying;
                count += 1;
            }
        }
        count
    }

    /// Record a reaped exit. Returns the slot index, or None for a pid the
    /// table never knew about.
    pub fn record_exit(&mut self, pid: Pid) -> Option<usize> {
        let index = self.slot_of(pid)?;
        self.slots[index] = ProcessSlot {
            pid: None,
            status: SlotStatus::Dead,
        };
        Some(index)
    }

    pub fn slot_of(&self, pid: Pid) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.pid() == Some(pid))
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_live()).count()
    }

    pub fn live_pids(&self) -> Vec<Pid> {
        self.slots.iter().filter_map(|slot| {
            if slot.is_live() { slot.pid() } else { None }
        }).collect()
    }

    /// Indices of the first `limit` slots with no process, scanning at
    /// most the first `within` slots.
    pub fn free_slots(&self, within: usize, limit: usize) -> Vec<usize> {
        let mut free = Vec::new();
        for (index, slot) in self.slots.iter().take(within).enumerate() {
            if !slot.is_live() {
                free.push(index);
                if free.len() == limit {
                    break;
                }
            }
        }
        free
    }

    /// Check the table invariant: a pid is present exactly on live slots,
    /// and no pid appears twice.
    #[cfg(test)]
    pub fn assert_invariants(&self) {
        let mut seen = std::collections::HashSet::new();
        for slot in &self.slots {
            assert_eq!(slot.pid().is_some(), slot.is_live());
            if let Some(pid) = slot.pid() {
                assert!(seen.insert(pid), "pid {} appears twice", pid);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(n: i32) -> Pid {
        Pid::from_raw(n)
    }

    #[test]
    fn test_new_table_is_all_empty() {
        let table = ProcessTable::new(4);
        assert_eq!(table.len(), 4);
        assert_eq!(table.live_count(), 0);
        for i in 0..4 {
            assert_eq!(table.slot(i).status(), SlotStatus::Empty);
        }
        table.assert_invariants();
    }

    #[test]
    fn test_started_then_exit_lifecycle() {
        let mut table = ProcessTable::new(2);
        table.started(0, pid(100));
        assert_eq!(table.slot(0).status(), SlotStatus::Starting);
        assert_eq!(table.live_count(), 1);
        table.assert_invariants();

        table.promote_started();
        assert_eq!(table.slot(0).status(), SlotStatus::Ready);

        assert_eq!(table.record_exit(pid(100)), Some(0));
        assert_eq!(table.slot(0).status(), SlotStatus::Dead);
        assert!(table.slot(0).pid().is_none());
        assert_eq!(table.live_count(), 0);
        table.assert_invariants();
    }

    #[test]
    fn test_each_pid_maps_to_one_slot() {
        let mut table = ProcessTable::new(3);
        table.started(0, pid(100));
        table.started(2, pid(200));
        assert_eq!(table.slot_of(pid(100)), Some(0));
        assert_eq!(table.slot_of(pid(200)), Some(2));
        assert_eq!(table.slot_of(pid(300)), None);
        table.assert_invariants();
    }

    #[test]
    fn test_unknown_pid_exit_is_ignored() {
        let mut table = ProcessTable::new(1);
        assert_eq!(table.record_exit(pid(999)), None);
    }

    #[test]
    fn test_live_count_never_exceeds_capacity() {
        let mut table = ProcessTable::new(3);
        for i in 0..3 {
            table.started(i, pid(100 + i as i32));
        }
        assert_eq!(table.live_count(), 3);
        assert!(table.live_count() <= table.len());
        assert!(table.free_slots(3, 32).is_empty());
    }

    #[test]
    fn test_mark_all_dying_counts_live_only() {
        let mut table = ProcessTable::new(4);
        table.started(0, pid(100));
        table.started(1, pid(101));
        table.started(3, pid(103));
        table.record_exit(pid(101));

        assert_eq!(table.mark_all_dying(), 2);
        assert_eq!(table.slot(0).status(), SlotStatus::Dying);
        assert_eq!(table.slot(1).status(), SlotStatus::Dead);
        assert_eq!(table.slot(3).status(), SlotStatus::Dying);
        // Dying slots still count as live until reaped.
        assert_eq!(table.live_count(), 2);
    }

    #[test]
    fn test_free_slots_bounded_by_limit_and_range() {
        let mut table = ProcessTable::new(6);
        table.started(1, pid(100));
        assert_eq!(table.free_slots(6, 2), vec![0, 2]);
        assert_eq!(table.free_slots(6, 32), vec![0, 2, 3, 4, 5]);
        // Scanning only the first 3 slots ignores the tail.
        assert_eq!(table.free_slots(3, 32), vec![0, 2]);
    }

    #[test]
    fn test_grow_keeps_live_slots() {
        let mut table = ProcessTable::new(2);
        table.started(0, pid(100));
        table.grow(4);
        assert_eq!(table.len(), 4);
        assert_eq!(table.slot_of(pid(100)), Some(0));
        assert_eq!(table.slot(3).status(), SlotStatus::Empty);
    }
}
