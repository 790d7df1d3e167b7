//! Typed System-V shared-memory regions.
//!
//! Lifecycle matches base spec §4.1: `create` stamps a zeroed, owner-mapped
//! region; `attach` validates magic/status/type before handing back a
//! read-only or read-write view; `destroy` marks the header
//! `mark-deleted`, detaches, and removes the segment. `create` fails if the
//! key already exists with the same type (the caller is expected to
//! `destroy` and retry); `destroy` is idempotent.

use crate::error::{Result, RyeError};
use std::ffi::c_void;
use std::mem::size_of;

pub const MAGIC_STRING: &[u8; 8] = b"RYE_SHM\0";
pub const MAGIC_NUMBER: u32 = 0x5259_4553; // "RYES"

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ShmStatus {
    Unknown = 0,
    Created = 1,
    Valid = 2,
    MarkDeleted = 3,
}

impl ShmStatus {
    fn from_u32(v: u32) -> Self {
        match v {
            1 => ShmStatus::Created,
            2 => ShmStatus::Valid,
            3 => ShmStatus::MarkDeleted,
            _ => ShmStatus::Unknown,
        }
    }
}

/// Fixed-layout header stamped at offset 0 of every region. `align(8)` so
/// `payload_ptr()` (header size bytes past the segment start) lands on an
/// 8-byte boundary, which `pthread_mutex_t` at the head of the payload
/// requires.
#[repr(C, align(8))]
#[derive(Clone, Copy)]
pub struct ShmHeader {
    pub magic_string: [u8; 8],
    pub magic_number: u32,
    pub type_tag: u32,
    pub status: u32,
    pub key: i32,
    pub version: u32,
}

impl ShmHeader {
    fn zeroed() -> Self {
        ShmHeader { magic_string: [0; 8], magic_number: 0, type_tag: 0, status: 0, key: 0, version: 0 }
    }

    pub fn is_valid_magic(&self) -> bool {
        &self.magic_string == MAGIC_STRING && self.magic_number == MAGIC_NUMBER
    }

    pub fn status(&self) -> ShmStatus {
        ShmStatus::from_u32(self.status)
    }
}

/// An attached System-V shared memory segment, `HeaderSize + payload_size`
/// bytes, owned (created by us) or merely attached (viewer).
pub struct ShmRegion {
    shmid: i32,
    addr: *mut c_void,
    total_size: usize,
    owner: bool,
    readonly: bool,
}

unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

impl ShmRegion {
    /// Creates and zero-stamps a new region for `key`. Fails with
    /// [`RyeError::AlreadyExists`] if a segment for this key already
    /// exists; the caller should `destroy` and retry if that's expected.
    pub fn create(key: i32, type_tag: u32, version: u32, payload_size: usize) -> Result<Self> {
        let total_size = size_of::<ShmHeader>() + payload_size;
        let shmid = unsafe {
            libc::shmget(
                key,
                total_size,
                libc::IPC_CREAT | libc::IPC_EXCL | 0o600,
            )
        };
        if shmid < 0 {
            let errno = std::io::Error::last_os_error();
            if errno.raw_os_error() == Some(libc::EEXIST) {
                return Err(RyeError::AlreadyExists(format!("shm key {key} already exists")));
            }
            return Err(RyeError::Shm(format!("shmget({key}) failed: {errno}")));
        }

        let addr = unsafe { libc::shmat(shmid, std::ptr::null(), 0) };
        if addr == usize::MAX as *mut c_void {
            let errno = std::io::Error::last_os_error();
            unsafe { libc::shmctl(shmid, libc::IPC_RMID, std::ptr::null_mut()) };
            return Err(RyeError::Shm(format!("shmat({key}) failed: {errno}")));
        }

        let region = ShmRegion { shmid, addr, total_size, owner: true, readonly: false };

        let header = ShmHeader {
            magic_string: *MAGIC_STRING,
            magic_number: MAGIC_NUMBER,
            type_tag,
            status: ShmStatus::Created as u32,
            key,
            version,
        };
        unsafe {
            std::ptr::write_bytes(region.addr as *mut u8, 0, region.total_size);
            std::ptr::write(region.addr as *mut ShmHeader, header);
            (*(region.addr as *mut ShmHeader)).status = ShmStatus::Valid as u32;
        }
        Ok(region)
    }

    /// Attaches an existing region. `expected_type` of `None` probes the
    /// type tag instead of enforcing it (base spec: "caller supplies
    /// `unknown` to probe").
    pub fn attach(key: i32, expected_type: Option<u32>, readonly: bool, payload_size: usize) -> Result<Self> {
        let total_size = size_of::<ShmHeader>() + payload_size;
        let shmid = unsafe { libc::shmget(key, 0, 0o600) };
        if shmid < 0 {
            return Err(RyeError::NotFound(format!("shm key {key} not found")));
        }

        let flags = if readonly { libc::SHM_RDONLY } else { 0 };
        let addr = unsafe { libc::shmat(shmid, std::ptr::null(), flags) };
        if addr == usize::MAX as *mut c_void {
            let errno = std::io::Error::last_os_error();
            return Err(RyeError::Shm(format!("shmat({key}) failed: {errno}")));
        }

        let region = ShmRegion { shmid, addr, total_size, owner: false, readonly };
        let header = region.header();
        if !header.is_valid_magic() {
            unsafe { libc::shmdt(region.addr) };
            return Err(RyeError::Shm(format!("bad magic for shm key {key}")));
        }
        if header.status() != ShmStatus::Valid {
            unsafe { libc::shmdt(region.addr) };
            return Err(RyeError::Shm(format!("shm key {key} is not valid (status stale)")));
        }
        if let Some(expected) = expected_type {
            if header.type_tag != expected {
                unsafe { libc::shmdt(region.addr) };
                return Err(RyeError::Shm(format!(
                    "shm key {key} type mismatch: expected {expected}, got {}",
                    header.type_tag
                )));
            }
        }
        Ok(region)
    }

    /// Stamps `mark-deleted`, detaches and removes the segment. Idempotent:
    /// a missing key is not an error.
    pub fn destroy(key: i32) -> Result<()> {
        let shmid = unsafe { libc::shmget(key, 0, 0o600) };
        if shmid < 0 {
            return Ok(());
        }
        let addr = unsafe { libc::shmat(shmid, std::ptr::null(), 0) };
        if addr != usize::MAX as *mut c_void {
            unsafe {
                (*(addr as *mut ShmHeader)).status = ShmStatus::MarkDeleted as u32;
                libc::shmdt(addr);
            }
        }
        unsafe { libc::shmctl(shmid, libc::IPC_RMID, std::ptr::null_mut()) };
        Ok(())
    }

    pub fn header(&self) -> &ShmHeader {
        unsafe { &*(self.addr as *const ShmHeader) }
    }

    pub fn payload_ptr(&self) -> *mut u8 {
        unsafe { (self.addr as *mut u8).add(size_of::<ShmHeader>()) }
    }

    pub fn payload_len(&self) -> usize {
        self.total_size - size_of::<ShmHeader>()
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        unsafe {
            libc::shmdt(self.addr);
        }
        if self.owner {
            unsafe {
                libc::shmctl(self.shmid, libc::IPC_RMID, std::ptr::null_mut());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> i32 {
        // Derived from the pid so concurrent `cargo test` threads in this
        // process don't collide on the same System-V key.
        0x5259_0000 ^ (std::process::id() as i32)
    }

    #[test]
    fn create_attach_destroy_roundtrip() {
        let key = test_key();
        let _ = ShmRegion::destroy(key);

        let owner = ShmRegion::create(key, 42, 1, 256).expect("create");
        assert_eq!(owner.header().status(), ShmStatus::Valid);
        assert_eq!(owner.payload_len(), 256);

        let viewer = ShmRegion::attach(key, Some(42), true, 256).expect("attach");
        assert!(viewer.is_readonly());
        assert_eq!(viewer.header().type_tag, 42);

        drop(viewer);
        drop(owner);
        ShmRegion::destroy(key).expect("destroy idempotent");
    }

    #[test]
    fn create_fails_when_key_already_exists() {
        let key = test_key() ^ 1;
        let _ = ShmRegion::destroy(key);
        let first = ShmRegion::create(key, 1, 1, 64).expect("first create");
        let second = ShmRegion::create(key, 1, 1, 64);
        assert!(matches!(second, Err(RyeError::AlreadyExists(_))));
        drop(first);
        ShmRegion::destroy(key).unwrap();
    }

    #[test]
    fn attach_fails_on_type_mismatch() {
        let key = test_key() ^ 2;
        let _ = ShmRegion::destroy(key);
        let owner = ShmRegion::create(key, 7, 1, 64).expect("create");
        let result = ShmRegion::attach(key, Some(8), true, 64);
        assert!(result.is_err());
        drop(owner);
        ShmRegion::destroy(key).unwrap();
    }
}
