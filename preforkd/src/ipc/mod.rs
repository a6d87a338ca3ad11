// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>
//! Cross-process state: one POSIX shared-memory region plus one named
//! semaphore acting as the global mutex.
//!
//! The region name is derived from the lock-file path, so a supervisor
//! recreated with the same pid file attaches the same region — colliding
//! with a stale instance on purpose. Workers never open the region
//! themselves; the mapping is inherited across fork().

use std::os::unix::ffi::OsStrExt;
use std::path::Path;

pub mod mutex;
pub mod region;

pub use mutex::NamedMutex;
pub use region::{AppVar, RunStatus, ShmRegion};

/// The live cross-process state: the shared region plus its mutex.
#[derive(Debug)]
pub(crate) struct Ipc {
    pub(crate) region: ShmRegion,
    pub(crate) mutex: NamedMutex,
}

/// Project discriminator mixed into the key, so that unrelated tools keyed
/// off the same pid file land in different regions.
const PROJECT_ID: u8 = b'p';

/// Stable 64-bit key from the lock-file path plus the project byte (FNV-1a).
pub(crate) fn derive_key(pid_file: &Path) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = FNV_OFFSET;
    for byte in pid_file.as_os_str().as_bytes().iter().chain(std::iter::once(&PROJECT_ID)) {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Name of the shared-memory object for a given lock file.
pub(crate) fn region_name(pid_file: &Path) -> String {
    format!("/preforkd-{:016x}", derive_key(pid_file))
}

/// Name of the named semaphore guarding that region.
pub(crate) fn mutex_name(pid_file: &Path) -> String {
    format!("/preforkd-{:016x}.sem", derive_key(pid_file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn key_is_stable_for_a_path() {
        let a = PathBuf::from("/var/run/scannerd.pid");
        assert_eq!(derive_key(&a), derive_key(&a));
        assert_eq!(region_name(&a), region_name(&a));
    }

    #[test]
    fn different_paths_get_different_keys() {
        let a = PathBuf::from("/var/run/scannerd.pid");
        let b = PathBuf::from("/var/run/scannerd2.pid");
        assert_ne!(derive_key(&a), derive_key(&b));
    }

    #[test]
    fn region_and_mutex_names_differ() {
        let a = PathBuf::from("/var/run/scannerd.pid");
        assert_ne!(region_name(&a), mutex_name(&a));
    }
}
