#[cfg(unix)]
mod unix;

#[cfg(unix)]
pub(crate) use self::unix::{
    event_fd, interest_mask, ready_from, waker_mask, Event, Events, Selector, Waker, EVENTS_CAP,
};
