// Not all functions are used by all tests.
#![allow(dead_code)]

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Once;

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        env_logger::try_init().expect("unable to initialise logger");
    });
}

pub fn assert_sync<T: Sync>() {}
pub fn assert_send<T: Send>() {}

/// Non-blocking pipe; returns (read end, write end).
pub fn pipe() -> (OwnedFd, OwnedFd) {
    let mut fds = [0 as libc::c_int; 2];
    let res = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
    assert_eq!(res, 0, "pipe2 failed: {}", io::Error::last_os_error());
    unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
}

/// Write the whole buffer, retrying short writes.
pub fn write_all(fd: &OwnedFd, mut data: &[u8]) {
    while !data.is_empty() {
        let n = unsafe {
            libc::write(
                fd.as_raw_fd(),
                data.as_ptr() as *const libc::c_void,
                data.len(),
            )
        };
        assert!(n > 0, "write failed: {}", io::Error::last_os_error());
        data = &data[n as usize..];
    }
}

/// Read until the descriptor would block; returns everything drained.
pub fn drain(fd: RawFd) -> Vec<u8> {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n > 0 {
            data.extend_from_slice(&buf[..n as usize]);
        } else {
            break;
        }
    }
    data
}

/// Read at most `max` bytes.
pub fn read_some(fd: RawFd, max: usize) -> Vec<u8> {
    let mut buf = vec![0u8; max];
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n > 0 {
        buf.truncate(n as usize);
        buf
    } else {
        Vec::new()
    }
}
