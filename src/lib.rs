//! Reactor based asynchronous I/O runtime with a multiplexed RPC
//! layer on top.
//!
//! The runtime half is a set of single-threaded cooperative reactors:
//! each one multiplexes sockets, timers and cross-thread events for
//! the actors it owns, with completion-style I/O handles ([`Stream`],
//! [`Datagram`], [`Listener`], [`Timer`]) and a process-wide
//! [`Manager`] giving every actor a stable identity for
//! notifications.
//!
//! The RPC half ([`rpc`]) rides one TCP (optionally TLS) connection
//! per peer and multiplexes many in-flight messages over it, with
//! per-connection write scheduling, keep-alives, cancellation,
//! flow-control credits and optional in-process relaying of message
//! bytes between two connections.
//!
//! ```no_run
//! use std::sync::Arc;
//! use weave_io::{Manager, Scheduler};
//! use weave_io::rpc::{BytesProtocol, Configuration, Service};
//!
//! let manager = Manager::new();
//! let scheduler = Scheduler::new(manager);
//! scheduler.start(2).unwrap();
//!
//! let mut config = Configuration::new(Arc::new(BytesProtocol));
//! config.listener_address = Some("127.0.0.1:0".parse().unwrap());
//! let service = Service::start(config, &scheduler).unwrap();
//!
//! // ... send(), cancel(), stop() ...
//! service.stop();
//! scheduler.stop();
//! ```
//!
//! [`Stream`]: handle::Stream
//! [`Datagram`]: handle::Datagram
//! [`Listener`]: handle::Listener
//! [`Timer`]: handle::Timer

pub mod sys;

pub mod actor;
pub mod buffer;
pub mod error;
pub mod event;
pub mod handle;
pub mod manager;
pub mod reactor;
pub mod rpc;
pub mod scheduler;

pub use actor::{Actor, ActorId, HandleId};
pub use buffer::{make_buffer, SharedBuffer, MAX_BUFFER_CAPACITY, MIN_BUFFER_CAPACITY};
pub use error::{Error, Result};
pub use event::{Event, EventCategory};
pub use manager::Manager;
pub use reactor::{Reactor, ReactorContext, Ready};
pub use scheduler::Scheduler;
