// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::ffi::CString;
use std::io;

use log::warn;

use crate::error::IpcError;

/// The one named semaphore guarding multi-field mutations of the shared
/// region. nix has no wrapper for POSIX named semaphores, so this goes
/// through libc directly.
///
/// Deliberately not RAII: the dispatcher holds and releases the lock at
/// points that do not nest, and a failed release must be reported as fatal
/// instead of being swallowed by a Drop impl.
#[derive(Debug)]
pub struct NamedMutex {
    name: CString,
    sem: *mut libc::sem_t,
}

// The semaphore handle is a process-shared kernel object; the raw pointer
// is only ever used from the owning supervisor or a forked worker, one
// thread of control each.
unsafe impl Send for NamedMutex {}
unsafe impl Sync for NamedMutex {}

impl NamedMutex {
    /// Create or attach the semaphore with an initial count of 1.
    pub fn open(name: &str) -> Result<Self, IpcError> {
        let cname = CString::new(name).map_err(|_| IpcError::Semaphore {
            op: "open",
            source: io::Error::new(io::ErrorKind::InvalidInput, "embedded NUL in name"),
        })?;
        let sem = unsafe {
            libc::sem_open(
                cname.as_ptr(),
                libc::O_CREAT,
                libc::S_IRUSR | libc::S_IWUSR,
                1 as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(IpcError::Semaphore {
                op: "open",
                source: io::Error::last_os_error(),
            });
        }
        Ok(Self { name: cname, sem })
    }

    /// Block until the mutex is held. Restarts on EINTR; the signal latch
    /// is inspected by the dispatcher, never here.
    pub fn lock(&self) -> Result<(), IpcError> {
        loop {
            if unsafe { libc::sem_wait(self.sem) } == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(IpcError::Semaphore { op: "wait", source: err });
        }
    }

    pub fn unlock(&self) -> Result<(), IpcError> {
        if unsafe { libc::sem_post(self.sem) } == 0 {
            Ok(())
        } else {
            Err(IpcError::Semaphore {
                op: "post",
                source: io::Error::last_os_error(),
            })
        }
    }

    /// Remove the semaphore name from the system. Only the supervisor calls
    /// this, during teardown.
    pub fn unlink(&self) {
        if unsafe { libc::sem_unlink(self.name.as_ptr()) } != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                warn!("sem_unlink {:?}: {}", self.name, err);
            }
        }
    }
}

impl Drop for NamedMutex {
    fn drop(&mut self) {
        // Close the handle only. Unlinking is an explicit teardown step;
        // a forked worker dropping its copy must not take the name away
        // from the supervisor.
        unsafe {
            libc::sem_close(self.sem);
        }
    }
}
