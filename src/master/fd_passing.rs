//! Driver file-descriptor passthrough: the master accepts a client
//! connection, then hands the raw fd to the chosen `rye_server` over
//! `SCM_RIGHTS` rather than proxying bytes itself (base spec §4.3:
//! "forwards client FDs to servers").

use crate::error::{Result, RyeError};
use std::mem::{size_of, MaybeUninit};
use std::os::unix::io::RawFd;

/// Sends `fd` across `socket_fd` (a connected `AF_UNIX` socket) as
/// ancillary data, with a one-byte payload so the receiver has something
/// to read alongside the control message.
///
/// # Safety
/// `socket_fd` and `fd` must both be valid, open file descriptors for the
/// duration of the call.
pub unsafe fn send_fd(socket_fd: RawFd, fd: RawFd) -> Result<()> {
    let mut iov_base = [0u8; 1];
    let mut iov = libc::iovec { iov_base: iov_base.as_mut_ptr() as *mut _, iov_len: 1 };

    let cmsg_space = libc::CMSG_SPACE(size_of::<RawFd>() as u32) as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut msg: libc::msghdr = std::mem::zeroed();
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut _;
    msg.msg_controllen = cmsg_space as _;

    let cmsg = libc::CMSG_FIRSTHDR(&msg);
    if cmsg.is_null() {
        return Err(RyeError::Master("CMSG_FIRSTHDR returned null while sending fd".into()));
    }
    (*cmsg).cmsg_level = libc::SOL_SOCKET;
    (*cmsg).cmsg_type = libc::SCM_RIGHTS;
    (*cmsg).cmsg_len = libc::CMSG_LEN(size_of::<RawFd>() as u32) as _;
    std::ptr::write(libc::CMSG_DATA(cmsg) as *mut RawFd, fd);

    let rc = libc::sendmsg(socket_fd, &msg, 0);
    if rc < 0 {
        return Err(RyeError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

/// Receives a single passed fd from `socket_fd`, as sent by [`send_fd`].
///
/// # Safety
/// `socket_fd` must be a valid, open file descriptor for an `AF_UNIX`
/// socket connected to a peer that calls [`send_fd`].
pub unsafe fn recv_fd(socket_fd: RawFd) -> Result<RawFd> {
    let mut iov_base = [0u8; 1];
    let mut iov = libc::iovec { iov_base: iov_base.as_mut_ptr() as *mut _, iov_len: 1 };

    let cmsg_space = libc::CMSG_SPACE(size_of::<RawFd>() as u32) as usize;
    let mut cmsg_buf: Vec<MaybeUninit<u8>> = vec![MaybeUninit::uninit(); cmsg_space];

    let mut msg: libc::msghdr = std::mem::zeroed();
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut _;
    msg.msg_controllen = cmsg_space as _;

    let rc = libc::recvmsg(socket_fd, &mut msg, 0);
    if rc < 0 {
        return Err(RyeError::Io(std::io::Error::last_os_error()));
    }

    let cmsg = libc::CMSG_FIRSTHDR(&msg);
    if cmsg.is_null() || (*cmsg).cmsg_type != libc::SCM_RIGHTS {
        return Err(RyeError::Master("no SCM_RIGHTS control message received".into()));
    }
    let fd = std::ptr::read(libc::CMSG_DATA(cmsg) as *const RawFd);
    Ok(fd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixDatagram;

    #[test]
    fn passes_an_fd_across_a_socketpair() {
        let (a, b) = UnixDatagram::pair().unwrap();
        let donor = tempfile::tempfile().unwrap();

        unsafe {
            send_fd(a.as_raw_fd(), donor.as_raw_fd()).unwrap();
            let received = recv_fd(b.as_raw_fd()).unwrap();
            assert!(received >= 0);
            libc::close(received);
        }
    }
}
