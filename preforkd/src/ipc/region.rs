// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::os::fd::OwnedFd;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use log::warn;
use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use serde::{Deserialize, Serialize};

use crate::config::SLOT_CAPACITY;
use crate::error::IpcError;

const REGION_MAGIC: u32 = 0x5046_4b44; // "PFKD"

/// Whether the supervisor keeps dispatching or drains and exits.
///
/// The transition RUN -> TERMINATE is one-way for the lifetime of the
/// region; attempts to go back are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RunStatus {
    Run = 0,
    Terminate = 1,
}

impl RunStatus {
    fn from_raw(raw: u32) -> Self {
        if raw == RunStatus::Terminate as u32 {
            RunStatus::Terminate
        } else {
            RunStatus::Run
        }
    }
}

/// A value in the shared application map.
///
/// Values carry an explicit discriminator on the wire instead of being
/// guessed back from their serialized shape. Composite data goes in as
/// `Bytes`; the encoding of those bytes is the application's business.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "kebab-case")]
pub enum AppVar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

// Fixed-layout header at offset 0 of the region. Atomics only: the region
// is mapped MAP_SHARED into the supervisor and every worker, and
// single-field reads are allowed without the mutex.
//
// No pointers, no references, no heap handles in shared memory; the region
// lands at a different address in every process.
#[repr(C)]
struct RegionHeader {
    magic: AtomicU32,
    run_status: AtomicU32,
    active_count: AtomicU32,
    slot_len: AtomicU32,
    vars_len: AtomicU32,
}

const HEADER_SIZE: usize = std::mem::size_of::<RegionHeader>();

/// The shared region: header, slot-occupancy bytes, app-var blob.
///
/// The supervisor creates it once after the lock file is held; workers
/// inherit the mapping across fork() and never open it themselves.
/// Multi-field mutations require the [`NamedMutex`](super::NamedMutex) to
/// be held by the caller; this type does not lock on its own.
#[derive(Debug)]
pub struct ShmRegion {
    name: String,
    ptr: NonNull<libc::c_void>,
    size: usize,
}

// One thread of control per process; cross-process visibility is handled
// by the atomics and the named mutex.
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

impl ShmRegion {
    /// Create (or re-attach and re-initialize) the region under `name`.
    ///
    /// Re-initializing an existing name is intentional: the lock file
    /// guarantees at most one live supervisor per pid-file path, so
    /// anything found under the derived name is leftovers of a dead one.
    pub fn create(name: &str, size: usize) -> Result<Self, IpcError> {
        let min = HEADER_SIZE + SLOT_CAPACITY + 1;
        if size < min {
            return Err(IpcError::RegionTooSmall { need: min, got: size });
        }

        let fd: OwnedFd = shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|source| IpcError::Shm { name: name.to_string(), source })?;
        nix::unistd::ftruncate(&fd, size as libc::off_t)
            .map_err(|source| IpcError::Shm { name: name.to_string(), source })?;

        let len = NonZeroUsize::new(size).expect("size checked above");
        let ptr = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )
        }
        .map_err(IpcError::Map)?;

        let region = Self { name: name.to_string(), ptr, size };
        region.initialize();
        Ok(region)
    }

    fn initialize(&self) {
        let h = self.header();
        h.run_status.store(RunStatus::Run as u32, Ordering::SeqCst);
        h.active_count.store(0, Ordering::SeqCst);
        h.slot_len.store(0, Ordering::SeqCst);
        h.vars_len.store(0, Ordering::SeqCst);
        for i in 0..SLOT_CAPACITY {
            self.slot_byte(i).store(0, Ordering::SeqCst);
        }
        h.magic.store(REGION_MAGIC, Ordering::SeqCst);
    }

    fn header(&self) -> &RegionHeader {
        // ptr points at a mapping of at least HEADER_SIZE bytes, aligned by
        // mmap to a page boundary.
        unsafe { &*(self.ptr.as_ptr() as *const RegionHeader) }
    }

    fn slot_byte(&self, index: usize) -> &AtomicU8 {
        debug_assert!(index < SLOT_CAPACITY);
        unsafe {
            let base = (self.ptr.as_ptr() as *const u8).add(HEADER_SIZE);
            &*(base.add(index) as *const AtomicU8)
        }
    }

    fn vars_base(&self) -> *mut u8 {
        unsafe { (self.ptr.as_ptr() as *mut u8).add(HEADER_SIZE + SLOT_CAPACITY) }
    }

    pub fn vars_capacity(&self) -> usize {
        self.size - HEADER_SIZE - SLOT_CAPACITY
    }

    // ---- run status ----

    pub fn run_status(&self) -> RunStatus {
        RunStatus::from_raw(self.header().run_status.load(Ordering::SeqCst))
    }

    pub fn set_run_status(&self, status: RunStatus) {
        if status == RunStatus::Run && self.run_status() == RunStatus::Terminate {
            warn!("ignoring run-status rollback: TERMINATE is final");
            return;
        }
        self.header().run_status.store(status as u32, Ordering::SeqCst);
    }

    // ---- active worker count ----

    pub fn active_count(&self) -> usize {
        self.header().active_count.load(Ordering::SeqCst) as usize
    }

    pub fn inc_active(&self) {
        self.header().active_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn dec_active(&self) {
        let prev = self.header().active_count.fetch_sub(1, Ordering::SeqCst);
        if prev == 0 {
            // Keep the counter sane even after a double release.
            self.header().active_count.store(0, Ordering::SeqCst);
            warn!("active-worker count underflow");
        }
    }

    // ---- slot table ----

    pub fn slot_len(&self) -> usize {
        self.header().slot_len.load(Ordering::SeqCst) as usize
    }

    /// Resize the occupancy table. Newly exposed slots are unoccupied.
    /// Caller holds the mutex.
    pub fn set_slot_len(&self, len: usize) {
        let len = len.min(SLOT_CAPACITY);
        let old = self.slot_len();
        for i in old..len {
            self.slot_byte(i).store(0, Ordering::SeqCst);
        }
        self.header().slot_len.store(len as u32, Ordering::SeqCst);
    }

    pub fn occupied(&self, index: usize) -> Result<bool, IpcError> {
        let len = self.slot_len();
        if index >= len {
            return Err(IpcError::SlotOutOfRange { index, len });
        }
        Ok(self.slot_byte(index).load(Ordering::SeqCst) != 0)
    }

    /// Caller holds the mutex.
    pub fn set_occupied(&self, index: usize, occupied: bool) -> Result<(), IpcError> {
        let len = self.slot_len();
        if index >= len {
            return Err(IpcError::SlotOutOfRange { index, len });
        }
        self.slot_byte(index).store(u8::from(occupied), Ordering::SeqCst);
        Ok(())
    }

    // ---- app vars ----

    /// Deserialize the whole shared map. Caller holds the mutex when the
    /// read must be consistent with other fields.
    pub fn load_vars(&self) -> Result<HashMap<String, AppVar>, IpcError> {
        let len = self.header().vars_len.load(Ordering::SeqCst) as usize;
        if len == 0 {
            return Ok(HashMap::new());
        }
        let mut buf = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(self.vars_base(), buf.as_mut_ptr(), len);
        }
        Ok(serde_json::from_slice(&buf)?)
    }

    /// Serialize and write back the whole map. Caller holds the mutex.
    pub fn store_vars(&self, vars: &HashMap<String, AppVar>) -> Result<(), IpcError> {
        let buf = serde_json::to_vec(vars)?;
        if buf.len() > self.vars_capacity() {
            return Err(IpcError::VarsOverflow {
                len: buf.len(),
                capacity: self.vars_capacity(),
            });
        }
        unsafe {
            std::ptr::copy_nonoverlapping(buf.as_ptr(), self.vars_base(), buf.len());
        }
        self.header().vars_len.store(buf.len() as u32, Ordering::SeqCst);
        Ok(())
    }

    /// Remove the region name from the system. Teardown only; a worker's
    /// inherited copy must never unlink.
    pub fn unlink(&self) {
        if let Err(err) = shm_unlink(self.name.as_str()) {
            if err != nix::errno::Errno::ENOENT {
                warn!("shm_unlink {}: {}", self.name, err);
            }
        }
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        // Unmap only; the name outlives any one mapping until teardown
        // unlinks it explicitly.
        unsafe {
            let _ = munmap(self.ptr, self.size);
        }
    }
}
