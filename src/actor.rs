use std::any::Any;
use std::fmt;

use crate::event::Event;
use crate::reactor::{ReactorContext, Ready};

/// Stable identity of a registered actor: the manager row index plus
/// a reuse counter. A notification addressed to `(i, u)` is delivered
/// only while row `i` still holds generation `u`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActorId {
    pub index: u32,
    pub unique: u32,
}

impl ActorId {
    pub const INVALID: ActorId = ActorId {
        index: u32::MAX,
        unique: u32::MAX,
    };

    pub fn new(index: u32, unique: u32) -> ActorId {
        ActorId { index, unique }
    }

    pub fn is_valid(&self) -> bool {
        *self != ActorId::INVALID
    }
}

impl fmt::Debug for ActorId {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "ActorId({}:{})", self.index, self.unique)
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}:{}", self.index, self.unique)
    }
}

/// Slot of a completion handle within its owning reactor.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(pub(crate) usize);

impl HandleId {
    pub const INVALID: HandleId = HandleId(usize::MAX);

    pub fn is_valid(&self) -> bool {
        *self != HandleId::INVALID
    }
}

impl fmt::Debug for HandleId {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        if self.is_valid() {
            write!(fmt, "HandleId({})", self.0)
        } else {
            write!(fmt, "HandleId(-)")
        }
    }
}

/// A unit of work owned by one reactor.
///
/// All three callbacks run on the owning reactor thread with the
/// actor's mutex held; they must never block. I/O and timer handles
/// owned by the actor deliver through `on_completion`, which routes by
/// [`HandleId`] to the matching handle's `on_ready`.
pub trait Actor: Any + Send {
    fn on_event(&mut self, ctx: &mut ReactorContext<'_>, event: Event);

    fn on_completion(&mut self, ctx: &mut ReactorContext<'_>, handle: HandleId, ready: Ready) {
        let _ = (ctx, handle, ready);
    }

    /// Last callback before the reactor frees the actor's slot.
    fn on_stopped(&mut self, ctx: &mut ReactorContext<'_>) {
        let _ = ctx;
    }
}
