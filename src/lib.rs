//! A single-threaded readiness event loop.
//!
//! Gyre multiplexes the operating system's scattered notification
//! facilities — descriptor readiness, monotonic timers, deferred work,
//! cross-thread signals — behind one programming model. Callers register
//! *handles* (an io watcher on a descriptor, a timer, an idle/prepare/check
//! watcher, an async signaler) and *requests* (one-shot background jobs)
//! against an [`EventLoop`]; the loop drives them by sleeping on the
//! kernel's readiness primitive and dispatching the [`Handler`] callbacks.
//!
//! The loop is cooperative and owned by one thread. Each iteration visits
//! a fixed sequence of phases — timers, deferred callbacks, idle, prepare,
//! poll, check, close — and every callback runs to completion before the
//! next fires. The only cross-thread doors are [`AsyncSender`],
//! [`Sender`], and [`EventLoop::submit`], all of which re-enter the loop
//! thread before any user callback is invoked.
//!
//! A handle is never torn down in place: [`EventLoop::close`] stops it and
//! defers destruction to the close phase, which is what makes it safe to
//! close a handle from inside its own callback.

#![deny(missing_docs)]

mod event_loop;
mod handler;
mod heap;
mod notify;
mod ready;
mod slab;
mod sys;
mod token;

pub use crate::event_loop::EventLoop;
pub use crate::handler::Handler;
pub use crate::notify::{AsyncSender, Sender};
pub use crate::ready::{Ready, Trigger};
pub use crate::token::Token;
