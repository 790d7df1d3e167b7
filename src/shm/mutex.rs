//! Process-shared, robust mutex for protecting mutators of the master
//! region (base spec §4.1 / §5: "owners must tolerate `owner-dead` by
//! releasing and retrying once").
//!
//! This wraps a `pthread_mutex_t` configured with `PTHREAD_PROCESS_SHARED`
//! and `PTHREAD_MUTEX_ROBUST`, placed directly inside the shared-memory
//! payload so every attached process synchronizes through the same
//! underlying futex rather than a per-process lock.

use crate::error::{Result, RyeError};
use std::mem::MaybeUninit;

/// In-place, process-shared robust mutex. `#[repr(C)]` so its layout is
/// stable when placed at a fixed offset inside a shared-memory segment.
#[repr(C)]
pub struct RobustMutex {
    inner: libc::pthread_mutex_t,
}

/// Whether `lock()` recovered from a previous owner dying mid-critical-
/// section. The caller must validate/repair shared state before treating
/// the region as consistent again (base spec: "invalidate the shm region"
/// recovery hook).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired,
    RecoveredFromOwnerDeath,
}

pub struct MutexGuard<'a> {
    mutex: &'a RobustMutex,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_mutex_unlock(self.mutex.inner_ptr());
        }
    }
}

impl RobustMutex {
    /// Initializes a mutex in place. Must be called exactly once, by the
    /// process that created the shared-memory region, before any other
    /// process attaches and calls [`RobustMutex::lock`].
    ///
    /// # Safety
    /// `ptr` must point to valid, writable memory of at least
    /// `size_of::<RobustMutex>()` bytes that outlives every attaching
    /// process, and must not already be initialized.
    pub unsafe fn init_in_place(ptr: *mut RobustMutex) -> Result<()> {
        let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        if libc::pthread_mutexattr_init(attr.as_mut_ptr()) != 0 {
            return Err(RyeError::Shm("pthread_mutexattr_init failed".into()));
        }
        let mut attr = attr.assume_init();
        if libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED) != 0 {
            return Err(RyeError::Shm("pthread_mutexattr_setpshared failed".into()));
        }
        if libc::pthread_mutexattr_setrobust(&mut attr, libc::PTHREAD_MUTEX_ROBUST) != 0 {
            return Err(RyeError::Shm("pthread_mutexattr_setrobust failed".into()));
        }
        let rc = libc::pthread_mutex_init((*ptr).inner_ptr(), &attr);
        libc::pthread_mutexattr_destroy(&mut attr);
        if rc != 0 {
            return Err(RyeError::Shm("pthread_mutex_init failed".into()));
        }
        Ok(())
    }

    fn inner_ptr(&self) -> *mut libc::pthread_mutex_t {
        &self.inner as *const _ as *mut _
    }

    /// Locks the mutex, tolerating a previous owner dying while holding
    /// it: on `EOWNERDEAD` the lock is still granted, and the caller gets
    /// [`LockOutcome::RecoveredFromOwnerDeath`] so it can repair shared
    /// state and call [`RobustMutex::mark_consistent`].
    pub fn lock(&self) -> Result<(MutexGuard<'_>, LockOutcome)> {
        let rc = unsafe { libc::pthread_mutex_lock(self.inner_ptr()) };
        match rc {
            0 => Ok((MutexGuard { mutex: self }, LockOutcome::Acquired)),
            e if e == libc::EOWNERDEAD => {
                Ok((MutexGuard { mutex: self }, LockOutcome::RecoveredFromOwnerDeath))
            }
            e => Err(RyeError::Shm(format!("pthread_mutex_lock failed: errno {e}"))),
        }
    }

    /// Must be called while holding the lock after a
    /// [`LockOutcome::RecoveredFromOwnerDeath`], once the caller has
    /// repaired whatever invariant the dead owner may have broken.
    pub fn mark_consistent(&self, _guard: &MutexGuard<'_>) -> Result<()> {
        let rc = unsafe { libc::pthread_mutex_consistent(self.inner_ptr()) };
        if rc != 0 {
            return Err(RyeError::Shm(format!("pthread_mutex_consistent failed: errno {rc}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::MaybeUninit;

    #[test]
    fn init_lock_unlock_in_single_process() {
        let mut storage = MaybeUninit::<RobustMutex>::uninit();
        unsafe {
            RobustMutex::init_in_place(storage.as_mut_ptr()).unwrap();
            let mutex = &*storage.as_ptr();
            let (guard, outcome) = mutex.lock().unwrap();
            assert_eq!(outcome, LockOutcome::Acquired);
            drop(guard);
            let (_guard2, outcome2) = mutex.lock().unwrap();
            assert_eq!(outcome2, LockOutcome::Acquired);
        }
    }
}
