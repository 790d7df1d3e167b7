//! Epoll-based idle-connection watcher (base spec §4.5): watches idle
//! client sockets for `EPOLLERR|EPOLLHUP|EPOLLIN`; a one-byte peek probes
//! a real close before enqueueing a close-handler job, and
//! `epoll_set_check(fd, enabled)` gives the dispatcher an ordering
//! guarantee against tearing a connection down mid-RPC.

use crate::dispatch::queue::JobQueue;
use crate::error::{Result, RyeError};
use dashmap::DashMap;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

/// One watched connection's "currently processing a request" flag. While
/// `true`, an `EPOLLIN` wakeup for this fd is ignored by the watcher
/// thread — the base spec's guarantee that "between `epoll_set_check(true)`
/// ... and `epoll_set_check(false)` ... the connection cannot be torn down
/// by a background thread."
struct WatchedFd {
    in_flight: std::sync::atomic::AtomicBool,
}

pub struct IdleConnectionWatcher {
    epfd: RawFd,
    watched: DashMap<RawFd, WatchedFd>,
    close_queue: Arc<JobQueue<RawFd>>,
}

impl IdleConnectionWatcher {
    pub fn new(close_queue: Arc<JobQueue<RawFd>>) -> Result<Self> {
        let epfd = unsafe { libc::epoll_create1(0) };
        if epfd < 0 {
            return Err(RyeError::Dispatch("epoll_create1 failed".into()));
        }
        Ok(IdleConnectionWatcher { epfd, watched: DashMap::new(), close_queue })
    }

    /// Starts watching `fd` for peer-initiated close while idle.
    pub fn watch(&self, fd: RawFd) -> Result<()> {
        let mut ev = libc::epoll_event {
            events: (libc::EPOLLERR | libc::EPOLLHUP | libc::EPOLLIN) as u32,
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut ev) };
        if rc != 0 {
            return Err(RyeError::Dispatch(format!("epoll_ctl ADD failed for fd {fd}")));
        }
        self.watched.insert(fd, WatchedFd { in_flight: std::sync::atomic::AtomicBool::new(false) });
        Ok(())
    }

    pub fn unwatch(&self, fd: RawFd) {
        unsafe {
            libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
        }
        self.watched.remove(&fd);
    }

    /// Marks `fd` as actively processing an in-flight RPC (`enabled =
    /// false` for peer-close detection) or idle again (`enabled = true`).
    pub fn epoll_set_check(&self, fd: RawFd, enabled: bool) {
        if let Some(entry) = self.watched.get(&fd) {
            entry.in_flight.store(!enabled, std::sync::atomic::Ordering::SeqCst);
        }
    }

    /// Runs one `epoll_wait` pass with the given timeout, probing each
    /// signalled fd that isn't currently in-flight and enqueueing a close
    /// job for any that prove to be a real close.
    pub fn poll_once(&self, timeout: Duration) -> Result<usize> {
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; 64];
        let n = unsafe {
            libc::epoll_wait(self.epfd, events.as_mut_ptr(), events.len() as i32, timeout.as_millis() as i32)
        };
        if n < 0 {
            return Err(RyeError::Dispatch("epoll_wait failed".into()));
        }
        let mut closed = 0;
        for ev in &events[..n as usize] {
            let fd = ev.u64 as RawFd;
            let Some(entry) = self.watched.get(&fd) else { continue };
            if entry.in_flight.load(std::sync::atomic::Ordering::SeqCst) {
                continue;
            }
            drop(entry);
            if Self::is_real_close(fd) {
                self.close_queue.add(fd);
                closed += 1;
            }
        }
        Ok(closed)
    }

    /// Peeks one byte without consuming it to distinguish a real close
    /// (`recv` returns `0`) from spurious readability.
    fn is_real_close(fd: RawFd) -> bool {
        let mut byte = [0u8; 1];
        let rc = unsafe {
            libc::recv(fd, byte.as_mut_ptr() as *mut _, 1, libc::MSG_PEEK | libc::MSG_DONTWAIT)
        };
        rc == 0
    }
}

impl Drop for IdleConnectionWatcher {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::queue::QueueKind;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn in_flight_fd_is_skipped_even_when_readable() {
        let (a, b) = UnixStream::pair().unwrap();
        let close_queue = Arc::new(JobQueue::new(QueueKind::Close, 1));
        let watcher = IdleConnectionWatcher::new(close_queue.clone()).unwrap();
        watcher.watch(a.as_raw_fd()).unwrap();
        watcher.epoll_set_check(a.as_raw_fd(), false); // mark in-flight

        drop(b); // peer closes, a becomes readable with EOF
        watcher.poll_once(Duration::from_millis(100)).unwrap();
        assert_eq!(close_queue.pending_len(), 0, "in-flight fd must not be torn down");
    }

    #[test]
    fn idle_fd_enqueues_close_on_peer_hangup() {
        let (a, b) = UnixStream::pair().unwrap();
        let close_queue = Arc::new(JobQueue::new(QueueKind::Close, 1));
        let watcher = IdleConnectionWatcher::new(close_queue.clone()).unwrap();
        watcher.watch(a.as_raw_fd()).unwrap();

        drop(b);
        watcher.poll_once(Duration::from_millis(100)).unwrap();
        assert_eq!(close_queue.pending_len(), 1);
    }
}
