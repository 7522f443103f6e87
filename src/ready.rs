use std::{fmt, ops};

/// A set of readiness bits.
///
/// `Ready` plays two roles: it is the interest mask handed to
/// [`EventLoop::io_start`] and [`EventLoop::io_stop`], and it is the
/// readiness set delivered to [`Handler::ready`]. Only [`READABLE`] and
/// [`WRITABLE`] may be requested as interest; [`ERROR`] and [`HUP`] are
/// delivered whenever the kernel reports them, requested or not.
///
/// [`EventLoop::io_start`]: crate::EventLoop::io_start
/// [`EventLoop::io_stop`]: crate::EventLoop::io_stop
/// [`Handler::ready`]: crate::Handler::ready
/// [`READABLE`]: Ready::READABLE
/// [`WRITABLE`]: Ready::WRITABLE
/// [`ERROR`]: Ready::ERROR
/// [`HUP`]: Ready::HUP
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Ready(u8);

// These must be unique.
const READABLE: u8 = 0b0001;
const WRITABLE: u8 = 0b0010;
const ERROR: u8 = 0b0100;
const HUP: u8 = 0b1000;

impl Ready {
    /// The empty set.
    pub const EMPTY: Ready = Ready(0);

    /// Readable readiness.
    pub const READABLE: Ready = Ready(READABLE);

    /// Writable readiness.
    pub const WRITABLE: Ready = Ready(WRITABLE);

    /// Error readiness. Delivered without being requested.
    pub const ERROR: Ready = Ready(ERROR);

    /// Hang-up readiness: the peer closed its end. Delivered without being
    /// requested.
    pub const HUP: Ready = Ready(HUP);

    /// Returns true if no bits are set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Add together two `Ready` sets.
    ///
    /// This does the same thing as the `BitOr` implementation, but is a
    /// constant function.
    #[allow(clippy::should_implement_trait)]
    pub const fn add(self, other: Ready) -> Ready {
        Ready(self.0 | other.0)
    }

    /// Returns the bits of `self` that are not in `other`.
    pub const fn remove(self, other: Ready) -> Ready {
        Ready(self.0 & !other.0)
    }

    /// Returns true if every bit of `other` is set in `self`.
    pub const fn contains(self, other: Ready) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns true if any bit of `other` is set in `self`.
    pub const fn intersects(self, other: Ready) -> bool {
        self.0 & other.0 != 0
    }

    /// Returns true if the value includes readable readiness.
    pub const fn is_readable(self) -> bool {
        self.0 & READABLE != 0
    }

    /// Returns true if the value includes writable readiness.
    pub const fn is_writable(self) -> bool {
        self.0 & WRITABLE != 0
    }

    /// Returns true if the value includes error readiness.
    pub const fn is_error(self) -> bool {
        self.0 & ERROR != 0
    }

    /// Returns true if the value includes hang-up readiness.
    pub const fn is_hup(self) -> bool {
        self.0 & HUP != 0
    }
}

impl ops::BitOr for Ready {
    type Output = Ready;

    #[inline]
    fn bitor(self, other: Ready) -> Ready {
        self.add(other)
    }
}

impl ops::BitOrAssign for Ready {
    #[inline]
    fn bitor_assign(&mut self, other: Ready) {
        self.0 |= other.0;
    }
}

impl ops::BitAnd for Ready {
    type Output = Ready;

    #[inline]
    fn bitand(self, other: Ready) -> Ready {
        Ready(self.0 & other.0)
    }
}

impl ops::Sub for Ready {
    type Output = Ready;

    #[inline]
    fn sub(self, other: Ready) -> Ready {
        self.remove(other)
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(fmt, "(empty)");
        }
        let mut one = false;
        for (bit, name) in [
            (Ready::READABLE, "READABLE"),
            (Ready::WRITABLE, "WRITABLE"),
            (Ready::ERROR, "ERROR"),
            (Ready::HUP, "HUP"),
        ] {
            if self.contains(bit) {
                if one {
                    write!(fmt, " | ")?;
                }
                write!(fmt, "{}", name)?;
                one = true;
            }
        }
        Ok(())
    }
}

/// How the kernel reports readiness for an io watcher.
///
/// Level-triggered watchers are re-reported for as long as the condition
/// holds; edge-triggered watchers are reported once per transition and the
/// consumer must drain completely before the next report.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Trigger {
    /// Report readiness as long as the condition holds.
    Level,
    /// Report readiness only on transitions.
    Edge,
}
