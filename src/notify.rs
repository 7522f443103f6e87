//! Cross-thread doors into the loop.
//!
//! Everything here funnels through the loop's eventfd waker: senders make
//! their payload visible, then bump the counter so a blocked poll returns.
//! The loop drains both sides when the waker fires.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;

use crate::sys;

/// What travels on the internal queue. User messages and request
/// completions share it so delivery order matches send order.
pub(crate) enum Envelope<M> {
    Message(M),
    Request(M),
}

/// Sends messages to an [`EventLoop`] from any thread, waking it up if it
/// is blocked in the kernel.
///
/// Obtained from [`EventLoop::channel`]; cheap to clone.
///
/// [`EventLoop`]: crate::EventLoop
/// [`EventLoop::channel`]: crate::EventLoop::channel
pub struct Sender<M> {
    tx: mpsc::Sender<Envelope<M>>,
    waker: Arc<sys::Waker>,
}

impl<M: Send> Sender<M> {
    pub(crate) fn new(tx: mpsc::Sender<Envelope<M>>, waker: Arc<sys::Waker>) -> Sender<M> {
        Sender { tx, waker }
    }

    /// Queue `msg` for delivery to [`Handler::notify`].
    ///
    /// Fails when the receiving loop no longer exists.
    ///
    /// [`Handler::notify`]: crate::Handler::notify
    pub fn send(&self, msg: M) -> io::Result<()> {
        if self.tx.send(Envelope::Message(msg)).is_err() {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "event loop is gone",
            ));
        }
        self.waker.wake()
    }
}

impl<M> Clone for Sender<M> {
    fn clone(&self) -> Sender<M> {
        Sender {
            tx: self.tx.clone(),
            waker: self.waker.clone(),
        }
    }
}

impl<M> fmt::Debug for Sender<M> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Sender").finish()
    }
}

pub(crate) struct AsyncShared {
    pub pending: AtomicBool,
}

/// Signals an async handle from any thread.
///
/// Sends coalesce: however many arrive before the loop dispatches, the
/// handle's [`Handler::wake`] callback runs once. Only the rising edge
/// pays for the wakeup syscall.
///
/// [`Handler::wake`]: crate::Handler::wake
pub struct AsyncSender {
    shared: Arc<AsyncShared>,
    waker: Arc<sys::Waker>,
}

impl AsyncSender {
    pub(crate) fn new(shared: Arc<AsyncShared>, waker: Arc<sys::Waker>) -> AsyncSender {
        AsyncSender { shared, waker }
    }

    /// Signal the handle. Safe from any thread; idempotent until the loop
    /// dispatches the wake callback.
    pub fn send(&self) -> io::Result<()> {
        if !self.shared.pending.swap(true, Ordering::AcqRel) {
            self.waker.wake()?;
        }
        Ok(())
    }
}

impl Clone for AsyncSender {
    fn clone(&self) -> AsyncSender {
        AsyncSender {
            shared: self.shared.clone(),
            waker: self.waker.clone(),
        }
    }
}

impl fmt::Debug for AsyncSender {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("AsyncSender")
            .field("pending", &self.shared.pending.load(Ordering::Relaxed))
            .finish()
    }
}
