use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};

/// Wakeup primitive backed by `eventfd(2)`.
///
/// The eventfd is effectively a 64 bit counter: all 8-byte writes add to
/// it, 8-byte reads reset it to zero and return the count. `wake` bumps
/// the counter; `ack` drains it so the level-triggered registration goes
/// quiet again.
#[derive(Debug)]
pub(crate) struct Waker {
    fd: File,
}

impl Waker {
    pub fn new() -> io::Result<Waker> {
        let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;
        // SAFETY: `eventfd(2)` just handed us the fd.
        let file = unsafe { File::from_raw_fd(fd) };
        Ok(Waker { fd: file })
    }

    #[allow(clippy::unused_io_amount)] // 8-byte eventfd writes don't split
    pub fn wake(&self) -> io::Result<()> {
        let buf: [u8; 8] = 1u64.to_ne_bytes();
        match (&self.fd).write(&buf) {
            Ok(_) => Ok(()),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                // Writing only blocks if the counter is about to overflow.
                // Reset it and wake again.
                self.ack();
                self.wake()
            }
            Err(err) => Err(err),
        }
    }

    /// Drain the counter. Quiet when there is nothing to read.
    #[allow(clippy::unused_io_amount)]
    pub fn ack(&self) {
        let mut buf = [0u8; 8];
        let _ = (&self.fd).read(&mut buf);
    }
}

impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
