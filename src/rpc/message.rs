use std::any::Any;
use std::fmt;

use bitflags::bitflags;

use crate::error::Error;

/// Type-erased user message. The concrete type is whatever the
/// configured [`Protocol`](super::protocol::Protocol) understands.
pub type MessagePtr = Box<dyn Any + Send>;

bitflags! {
    /// Per-message behavior flags; the low bits travel on the wire
    /// inside the serialized message header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MessageFlags: u32 {
        /// Keep the message alive until the peer responds.
        const WAIT_RESPONSE  = 0x01;
        /// Strict FIFO with every other synchronous message on the
        /// same connection.
        const SYNCHRONOUS    = 0x02;
        /// Drop instead of re-routing when the connection dies.
        const ONE_SHOT       = 0x04;
        /// This message answers a previous request.
        const RESPONSE       = 0x08;
        /// Deliver the completion on the sending connection.
        const BACK_ON_SENDER = 0x10;
        /// Terminated early; the peer discards collected bytes.
        const CANCELED       = 0x20;
    }
}

/// Identity of a tracked message: slot index plus reuse counter.
/// Separate namespaces exist per pool and per connection.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId {
    pub index: u32,
    pub unique: u32,
}

impl MessageId {
    pub const INVALID: MessageId = MessageId {
        index: u32::MAX,
        unique: u32::MAX,
    };

    pub fn new(index: u32, unique: u32) -> MessageId {
        MessageId { index, unique }
    }

    pub fn is_valid(&self) -> bool {
        *self != MessageId::INVALID
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "MessageId({}:{})", self.index, self.unique)
    }
}

/// Header traveling with every message: routing url, behavior flags
/// and the request ids that pair responses with requests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageHeader {
    pub flags: MessageFlags,
    pub url: String,
    pub sender_request_id: u32,
    pub recipient_request_id: u32,
}

impl MessageHeader {
    pub fn request(url: impl Into<String>, flags: MessageFlags) -> MessageHeader {
        MessageHeader {
            flags,
            url: url.into(),
            sender_request_id: 0,
            recipient_request_id: 0,
        }
    }

    /// Header for a response to `request`: swaps the request id over
    /// to the recipient side and marks the response flag.
    pub fn response_to(request: &MessageHeader) -> MessageHeader {
        MessageHeader {
            flags: MessageFlags::RESPONSE,
            url: String::new(),
            sender_request_id: 0,
            recipient_request_id: request.sender_request_id,
        }
    }
}

/// Terminal state of one tracked message, handed to its completion
/// callback exactly once.
pub struct Completion {
    /// The original request object, when still owned by this side.
    pub request: Option<MessagePtr>,
    /// The decoded response, present only on clean request/response.
    pub response: Option<MessagePtr>,
    pub error: Option<Error>,
}

pub type CompleteFn = Box<dyn FnOnce(Completion) + Send>;

/// A user message bundled with everything the writer needs to track
/// it: header template, the erased object, and the completion hook.
pub struct MessageBundle {
    pub message: Option<MessagePtr>,
    pub flags: MessageFlags,
    pub url: String,
    /// For responses: the peer's request id being answered.
    pub recipient_request_id: u32,
    pub complete: Option<CompleteFn>,
}

impl MessageBundle {
    pub fn new(message: MessagePtr, url: impl Into<String>, flags: MessageFlags) -> MessageBundle {
        MessageBundle {
            message: Some(message),
            flags,
            url: url.into(),
            recipient_request_id: 0,
            complete: None,
        }
    }

    /// Bundles a response answering `request`.
    pub fn response(message: MessagePtr, request: &MessageHeader) -> MessageBundle {
        MessageBundle {
            message: Some(message),
            flags: MessageFlags::RESPONSE,
            url: String::new(),
            recipient_request_id: request.sender_request_id,
            complete: None,
        }
    }

    pub fn with_completion(mut self, complete: CompleteFn) -> MessageBundle {
        self.complete = Some(complete);
        self
    }

    /// Fires the completion callback, if any is still armed.
    pub fn complete(&mut self, response: Option<MessagePtr>, error: Option<Error>) {
        if let Some(complete) = self.complete.take() {
            complete(Completion {
                request: self.message.take(),
                response,
                error,
            });
        }
    }
}

impl fmt::Debug for MessageBundle {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(
            fmt,
            "MessageBundle(url = {:?}, flags = {:?})",
            self.url, self.flags
        )
    }
}
