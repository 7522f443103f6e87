use crate::{EventLoop, Ready, Token};

/// Receives the callbacks an [`EventLoop`] dispatches.
///
/// There is one method per dispatch source and all of them have empty
/// default bodies, so an implementation only picks up the phases it cares
/// about. Every method gets mutable access to the loop and may start, stop,
/// or close any handle from inside the callback, including the handle the
/// callback is about.
///
/// Callbacks run to completion on the loop thread; a long callback delays
/// the entire loop.
#[allow(unused_variables)]
pub trait Handler: Sized {
    /// Message type carried by the loop's cross-thread channel and by
    /// request completions.
    type Message: Send + 'static;

    /// An io watcher observed readiness. `events` is the subset of the
    /// watcher's interest that became ready, plus [`Ready::ERROR`] and
    /// [`Ready::HUP`] whenever the kernel reports them.
    fn ready(&mut self, event_loop: &mut EventLoop<Self>, token: Token, events: Ready) {}

    /// A timer reached its deadline.
    fn timer(&mut self, event_loop: &mut EventLoop<Self>, token: Token) {}

    /// Deferred readiness scheduled with [`EventLoop::defer`], delivered at
    /// the next pass of the pending phase.
    fn pending(&mut self, event_loop: &mut EventLoop<Self>, token: Token, events: Ready) {}

    /// An idle watcher. Runs every iteration while started and keeps the
    /// poll phase from blocking.
    fn idle(&mut self, event_loop: &mut EventLoop<Self>, token: Token) {}

    /// A prepare watcher. Runs right before the loop blocks for I/O.
    fn prepare(&mut self, event_loop: &mut EventLoop<Self>, token: Token) {}

    /// A check watcher. Runs right after the loop wakes from I/O.
    fn check(&mut self, event_loop: &mut EventLoop<Self>, token: Token) {}

    /// An async handle was signalled from another thread. However many
    /// sends arrived since the last dispatch, this runs once.
    fn wake(&mut self, event_loop: &mut EventLoop<Self>, token: Token) {}

    /// A message arrived over the loop's channel, or a submitted request
    /// completed. Messages are delivered in send order.
    fn notify(&mut self, event_loop: &mut EventLoop<Self>, msg: Self::Message) {}

    /// A closing handle reached the close phase. The token is dead once
    /// this returns; this is the last callback the handle generates.
    fn closed(&mut self, event_loop: &mut EventLoop<Self>, token: Token) {}
}
