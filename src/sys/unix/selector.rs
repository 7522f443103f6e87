use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

use libc::{EPOLLERR, EPOLLET, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP};

use crate::ready::{Ready, Trigger};

/// Maximum number of events drained from the kernel per wait.
pub(crate) const EVENTS_CAP: usize = 1024;

pub(crate) type Event = libc::epoll_event;
pub(crate) type Events = Vec<Event>;

/// Thin wrapper around the epoll descriptor.
#[derive(Debug)]
pub(crate) struct Selector {
    ep: OwnedFd,
}

impl Selector {
    pub fn new() -> io::Result<Selector> {
        // SAFETY: `epoll_create1(2)` ensures the fd is valid.
        let ep = unsafe { OwnedFd::from_raw_fd(syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?) };
        Ok(Selector { ep })
    }

    /// Wait for at most `events.capacity()` events. `timeout` is in
    /// milliseconds: 0 polls, -1 blocks. An interrupted wait surfaces as
    /// `ErrorKind::Interrupted`; the caller owns the retry policy.
    pub fn wait(&self, events: &mut Events, timeout: i32) -> io::Result<usize> {
        events.clear();
        let n_events = syscall!(epoll_wait(
            self.ep.as_raw_fd(),
            events.as_mut_ptr(),
            events.capacity() as i32,
            timeout,
        ))?;
        // SAFETY: `epoll_wait` ensures that `n_events` are assigned.
        unsafe { events.set_len(n_events as usize) };
        Ok(n_events as usize)
    }

    pub fn add(&self, fd: RawFd, mask: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, mask)
    }

    pub fn modify(&self, fd: RawFd, mask: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, mask)
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        syscall!(epoll_ctl(
            self.ep.as_raw_fd(),
            libc::EPOLL_CTL_DEL,
            fd,
            ptr::null_mut(),
        ))
        .map(|_| ())
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, mask: u32) -> io::Result<()> {
        // The user data slot carries the target fd back out of the wait.
        let mut event = libc::epoll_event {
            events: mask,
            u64: fd as u64,
        };
        syscall!(epoll_ctl(self.ep.as_raw_fd(), op, fd, &mut event)).map(|_| ())
    }
}

impl AsRawFd for Selector {
    fn as_raw_fd(&self) -> RawFd {
        self.ep.as_raw_fd()
    }
}

/// Kernel-facing mask for an interest set.
///
/// Edge watchers register the full mask once and keep it; later interest
/// changes are resolved against latent readiness without another syscall.
/// Level watchers register exactly what was asked for.
pub(crate) fn interest_mask(interest: Ready, trigger: Trigger) -> u32 {
    match trigger {
        Trigger::Edge => (EPOLLIN | EPOLLRDHUP | EPOLLOUT | EPOLLET) as u32,
        Trigger::Level => {
            let mut mask = 0;
            if interest.is_readable() {
                mask |= EPOLLIN | EPOLLRDHUP;
            }
            if interest.is_writable() {
                mask |= EPOLLOUT;
            }
            mask as u32
        }
    }
}

/// Mask for the loop's wakeup descriptor: level-triggered readable, acked
/// by draining the counter on every dispatch.
pub(crate) fn waker_mask() -> u32 {
    EPOLLIN as u32
}

/// Readiness reported by the kernel, folded onto `Ready` bits.
pub(crate) fn ready_from(event: &Event) -> Ready {
    let bits = event.events as libc::c_int;
    let mut ready = Ready::EMPTY;
    if bits & EPOLLIN != 0 {
        ready |= Ready::READABLE;
    }
    if bits & EPOLLOUT != 0 {
        ready |= Ready::WRITABLE;
    }
    if bits & EPOLLERR != 0 {
        ready |= Ready::ERROR;
    }
    if bits & (EPOLLHUP | EPOLLRDHUP) != 0 {
        ready |= Ready::HUP;
    }
    ready
}

/// The fd an event is about, recovered from the user data slot.
pub(crate) fn event_fd(event: &Event) -> RawFd {
    event.u64 as RawFd
}
