//! Typed I/O handles owned by actors.
//!
//! Every handle binds one kernel resource (or a deadline slot) to its
//! owning actor through a completion-handle registration. Operations
//! never block: they record a plain `fn` continuation and arm poller
//! interest; the actor routes readiness back in through the handle's
//! `on_ready`, passing a projection from the actor to the handle field
//! so the continuation can run against the whole actor again.

mod datagram;
mod listener;
#[cfg(feature = "tls")]
mod secure;
mod stream;
mod timer;

pub use datagram::{Datagram, RecvFromFn, SendToFn};
pub use listener::{AcceptFn, Listener};
#[cfg(feature = "tls")]
pub use secure::SecureSession;
pub use stream::{ConnectFn, RecvFn, SendFn, Stream};
pub use timer::{Timer, TimerFn};
