use std::{fmt, ops};

/// A set of reactor events for one completion handle.
///
/// `RECV`/`SEND` mirror poller readiness; `ERROR`/`HANGUP` are
/// delivered alongside them on socket failure; `TIMER` marks an
/// expired deadline and `CLEAR` a silent teardown of the handle.
#[derive(Copy, PartialEq, Eq, Clone, PartialOrd, Ord)]
pub struct Ready(usize);

const RECV: usize = 0b00_0001;
const SEND: usize = 0b00_0010;
const ERROR: usize = 0b00_0100;
const HANGUP: usize = 0b00_1000;
const TIMER: usize = 0b01_0000;
const CLEAR: usize = 0b10_0000;

impl Ready {
    #[inline]
    pub fn empty() -> Ready {
        Ready(0)
    }

    #[inline]
    pub fn recv() -> Ready {
        Ready(RECV)
    }

    #[inline]
    pub fn send() -> Ready {
        Ready(SEND)
    }

    #[inline]
    pub fn error() -> Ready {
        Ready(ERROR)
    }

    #[inline]
    pub fn hangup() -> Ready {
        Ready(HANGUP)
    }

    #[inline]
    pub fn timer() -> Ready {
        Ready(TIMER)
    }

    #[inline]
    pub fn clear() -> Ready {
        Ready(CLEAR)
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn is_recv(self) -> bool {
        self.contains(Ready(RECV))
    }

    #[inline]
    pub fn is_send(self) -> bool {
        self.contains(Ready(SEND))
    }

    #[inline]
    pub fn is_error(self) -> bool {
        self.contains(Ready(ERROR))
    }

    #[inline]
    pub fn is_hangup(self) -> bool {
        self.contains(Ready(HANGUP))
    }

    #[inline]
    pub fn is_timer(self) -> bool {
        self.contains(Ready(TIMER))
    }

    #[inline]
    pub fn is_clear(self) -> bool {
        self.contains(Ready(CLEAR))
    }

    #[inline]
    pub fn insert(&mut self, other: Ready) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove(&mut self, other: Ready) {
        self.0 &= !other.0;
    }

    #[inline]
    pub fn contains(self, other: Ready) -> bool {
        (self & other) == other
    }
}

impl ops::BitOr for Ready {
    type Output = Ready;

    #[inline]
    fn bitor(self, other: Ready) -> Ready {
        Ready(self.0 | other.0)
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
        Ready(self.0 & !other.0)
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let flags = [
            (Ready(RECV), "Recv"),
            (Ready(SEND), "Send"),
            (Ready(ERROR), "Error"),
            (Ready(HANGUP), "Hangup"),
            (Ready(TIMER), "Timer"),
            (Ready(CLEAR), "Clear"),
        ];

        let mut one = false;
        write!(fmt, "Ready {{")?;
        for &(flag, msg) in &flags {
            if self.contains(flag) {
                if one {
                    write!(fmt, " | ")?
                }
                write!(fmt, "{}", msg)?;
                one = true
            }
        }
        write!(fmt, "}}")
    }
}
