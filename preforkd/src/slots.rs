// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use log::debug;
use nix::unistd::Pid;

use crate::error::IpcError;
use crate::ipc::ShmRegion;

/// Placeholder recorded between slot assignment and fork() returning the
/// real child pid.
const PID_PENDING: i32 = 0;

/// Supervisor-local side of the worker pool.
///
/// Occupancy lives in the shared region; the pid of the worker owning each
/// slot is supervisor-only knowledge and lives here. All methods that
/// touch the region expect the caller to hold the global mutex.
#[derive(Debug, Default)]
pub(crate) struct SlotTable {
    pids: Vec<Option<Pid>>,
}

impl SlotTable {
    pub fn new() -> Self {
        Self { pids: Vec::new() }
    }

    /// Allocate the initial table, all slots unoccupied.
    pub fn init(&mut self, region: &ShmRegion, max_workers: usize) {
        region.set_slot_len(max_workers);
        self.pids = vec![None; max_workers];
    }

    /// Keep the local pid map as long as the shared table. Slots another
    /// path grew are unowned until assigned.
    fn sync_len(&mut self, region: &ShmRegion) {
        let len = region.slot_len();
        if self.pids.len() < len {
            self.pids.resize(len, None);
        } else {
            self.pids.truncate(len);
        }
    }

    /// First unoccupied slot within the current cap, lowest index wins.
    /// Returns `None` when the cap shrank below the occupied range and
    /// nothing in range is free.
    pub fn assign(
        &mut self,
        region: &ShmRegion,
        max_workers: usize,
    ) -> Result<Option<usize>, IpcError> {
        self.sync_len(region);
        let in_range = region.slot_len().min(max_workers);
        for index in 0..in_range {
            if !region.occupied(index)? {
                region.set_occupied(index, true)?;
                self.pids[index] = Some(Pid::from_raw(PID_PENDING));
                return Ok(Some(index));
            }
        }
        // The cap may exceed the table when it was raised before init or
        // while every existing slot was busy; append one slot and take it.
        if region.slot_len() < max_workers {
            let index = region.slot_len();
            region.set_slot_len(index + 1);
            region.set_occupied(index, true)?;
            self.pids.push(Some(Pid::from_raw(PID_PENDING)));
            return Ok(Some(index));
        }
        Ok(None)
    }

    /// Record the pid fork() returned for an assigned slot.
    pub fn set_pid(&mut self, slot: usize, pid: Pid) {
        if let Some(entry) = self.pids.get_mut(slot) {
            *entry = Some(pid);
        }
    }

    /// Free a slot. Idempotent: the active count drops only if the shared
    /// occupancy was still set (a cleanly exiting worker clears it first).
    pub fn release(
        &mut self,
        region: &ShmRegion,
        slot: usize,
        max_workers: usize,
    ) -> Result<(), IpcError> {
        self.sync_len(region);
        if slot < region.slot_len() && region.occupied(slot)? {
            region.set_occupied(slot, false)?;
            region.dec_active();
        }
        if let Some(entry) = self.pids.get_mut(slot) {
            *entry = None;
        }
        self.compact(region, max_workers)?;
        Ok(())
    }

    /// Drop trailing unoccupied slots beyond the cap. Occupied over-range
    /// slots stay until their worker exits; the next release retries.
    pub fn compact(&mut self, region: &ShmRegion, max_workers: usize) -> Result<(), IpcError> {
        let mut len = region.slot_len();
        let before = len;
        while len > max_workers && !region.occupied(len - 1)? {
            len -= 1;
            region.set_slot_len(len);
        }
        if len != before {
            debug!(target: "daemon", "slot table compacted from {} to {}", before, len);
            self.pids.truncate(len);
        }
        Ok(())
    }

    /// Slot owned by `pid`, if the supervisor tracks one.
    pub fn slot_of(&self, pid: Pid) -> Option<usize> {
        self.pids.iter().position(|p| *p == Some(pid))
    }

    /// Live worker pids for signal relay. Pending assignments (pid still
    /// 0) are skipped.
    pub fn worker_pids(&self) -> impl Iterator<Item = Pid> + '_ {
        self.pids
            .iter()
            .flatten()
            .copied()
            .filter(|pid| pid.as_raw() != PID_PENDING)
    }

    /// Forget every inherited pid. Run first thing in a forked worker so
    /// it cannot act on the supervisor's bookkeeping.
    pub fn clear_local(&mut self) {
        self.pids.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_IPC_SIZE;

    fn test_region(tag: &str) -> ShmRegion {
        let name = format!("/preforkd-slots-{}-{}", tag, std::process::id());
        ShmRegion::create(&name, DEFAULT_IPC_SIZE).expect("create region")
    }

    #[test]
    fn assign_takes_lowest_free_index() {
        let region = test_region("assign");
        let mut slots = SlotTable::new();
        slots.init(&region, 3);

        assert_eq!(slots.assign(&region, 3).unwrap(), Some(0));
        assert_eq!(slots.assign(&region, 3).unwrap(), Some(1));
        region.inc_active();
        region.inc_active();

        slots.release(&region, 0, 3).unwrap();
        assert_eq!(region.active_count(), 1);
        assert_eq!(slots.assign(&region, 3).unwrap(), Some(0));
        region.unlink();
    }

    #[test]
    fn assign_respects_shrunk_cap() {
        let region = test_region("shrink");
        let mut slots = SlotTable::new();
        slots.init(&region, 3);
        for _ in 0..3 {
            slots.assign(&region, 3).unwrap().unwrap();
            region.inc_active();
        }

        // Cap shrank below occupancy: no slot in range, nothing appended.
        assert_eq!(slots.assign(&region, 1).unwrap(), None);
        assert_eq!(region.slot_len(), 3);

        // Slots 2 and 1 drain; compaction trims the table to the cap.
        slots.release(&region, 2, 1).unwrap();
        assert_eq!(region.slot_len(), 2);
        slots.release(&region, 1, 1).unwrap();
        assert_eq!(region.slot_len(), 1);
        // Slot 0 still busy, still none free under cap 1.
        assert_eq!(slots.assign(&region, 1).unwrap(), None);
        slots.release(&region, 0, 1).unwrap();
        assert_eq!(slots.assign(&region, 1).unwrap(), Some(0));
        region.unlink();
    }

    #[test]
    fn compaction_skips_occupied_tail() {
        let region = test_region("tail");
        let mut slots = SlotTable::new();
        slots.init(&region, 3);
        slots.assign(&region, 3).unwrap().unwrap(); // slot 0
        region.inc_active();
        slots.assign(&region, 3).unwrap().unwrap(); // slot 1
        region.inc_active();
        slots.assign(&region, 3).unwrap().unwrap(); // slot 2
        region.inc_active();

        // Free the middle, keep the tail occupied, shrink the cap: the
        // occupied slot 2 pins the table length.
        slots.release(&region, 1, 1).unwrap();
        assert_eq!(region.slot_len(), 3);

        slots.release(&region, 2, 1).unwrap();
        // Tail gone: trailing unoccupied entries (2 and 1) both go.
        assert_eq!(region.slot_len(), 1);
        region.unlink();
    }

    #[test]
    fn release_is_idempotent() {
        let region = test_region("idem");
        let mut slots = SlotTable::new();
        slots.init(&region, 2);
        let slot = slots.assign(&region, 2).unwrap().unwrap();
        region.inc_active();

        slots.release(&region, slot, 2).unwrap();
        assert_eq!(region.active_count(), 0);
        // A second release (worker cleaned up, then the reaper ran) must
        // not drive the count negative.
        slots.release(&region, slot, 2).unwrap();
        assert_eq!(region.active_count(), 0);
        region.unlink();
    }

    #[test]
    fn grow_appends_when_all_busy() {
        let region = test_region("grow");
        let mut slots = SlotTable::new();
        slots.init(&region, 1);
        assert_eq!(slots.assign(&region, 1).unwrap(), Some(0));
        region.inc_active();
        // Cap raised at runtime while slot 0 is busy.
        assert_eq!(slots.assign(&region, 2).unwrap(), Some(1));
        assert_eq!(region.slot_len(), 2);
        region.unlink();
    }

    #[test]
    fn pid_tracking() {
        let region = test_region("pids");
        let mut slots = SlotTable::new();
        slots.init(&region, 2);
        let slot = slots.assign(&region, 2).unwrap().unwrap();
        // Pending assignment is invisible to relay.
        assert_eq!(slots.worker_pids().count(), 0);
        slots.set_pid(slot, Pid::from_raw(4242));
        assert_eq!(slots.slot_of(Pid::from_raw(4242)), Some(slot));
        assert_eq!(slots.worker_pids().count(), 1);
        slots.release(&region, slot, 2).unwrap();
        assert_eq!(slots.slot_of(Pid::from_raw(4242)), None);
        region.unlink();
    }
}
