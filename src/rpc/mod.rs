//! Multiplexed RPC/messaging layer.
//!
//! One TCP (optionally TLS) connection carries many in-flight
//! messages, framed into packets of records. A [`Service`] keeps a
//! pool of connections per peer name, routes user sends and cancels
//! to them as events, and can relay message bytes between two
//! connections of the same process through the [`RelayEngine`].

pub mod config;
pub mod connection;
pub mod listener;
pub mod message;
pub mod protocol;
pub mod reader;
pub mod relay;
pub mod service;
pub mod wire;
pub mod writer;

pub use config::{Configuration, Resolver, SideConfiguration, StartState, ThreadResolver};
pub use connection::{
    event_post, event_recv_raw, event_send_raw, Connection, ConnectionContext, PostFn, RawRecvFn,
    RawSendFn, ReceivedMessage, RecvHandler,
};
pub use message::{
    CompleteFn, Completion, MessageBundle, MessageFlags, MessageHeader, MessageId, MessagePtr,
};
pub use protocol::{BytesProtocol, Deserializer, Protocol, Serializer};
pub use relay::{RelayAccept, RelayChunk, RelayConnId, RelayEngine, RelayMessageId, RelayPoll};
pub use service::Service;
