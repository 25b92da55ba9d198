use std::fmt;
use std::ops::Range;
use std::sync::Mutex;

use indexmap::IndexMap;
use log::{debug, trace};
use slab::Slab;

use crate::actor::ActorId;
use crate::buffer::SharedBuffer;
use crate::error::{Error, Result};
use crate::manager::Manager;

use super::connection::{event_relay_done, event_relay_new, event_retry_recv};
use super::message::{MessageFlags, MessageHeader};

/// Identity of a connection registered with the engine.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RelayConnId {
    index: u32,
    unique: u32,
}

impl RelayConnId {
    pub const INVALID: RelayConnId = RelayConnId {
        index: u32::MAX,
        unique: u32::MAX,
    };

    pub fn is_valid(&self) -> bool {
        *self != RelayConnId::INVALID
    }
}

impl fmt::Debug for RelayConnId {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "RelayConnId({}:{})", self.index, self.unique)
    }
}

/// Identity of one relayed message inside the engine.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RelayMessageId {
    index: u32,
    unique: u32,
}

impl fmt::Debug for RelayMessageId {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "RelayMessageId({}:{})", self.index, self.unique)
    }
}

/// One slice of relayed bytes, pinned in the originating
/// connection's receive buffer.
pub struct RelayChunk {
    pub buf: SharedBuffer,
    pub range: Range<usize>,
    pub is_last: bool,
}

/// Outcome of offering data to the engine.
#[derive(Debug, PartialEq, Eq)]
pub enum RelayAccept {
    Accepted,
    /// Back-pressure: retry the same bytes later.
    Refused,
    /// The other side is gone; drop the rest of the message and ack
    /// the buffer locally.
    Dead,
}

/// One unit of output drained by [`RelayEngine::poll_new`].
pub enum RelayPoll {
    /// The head chunk of a queued message, with its header on the
    /// first poll.
    Chunk(RelayMessageId, Option<(MessageHeader, u8)>, RelayChunk),
    /// The message was canceled; emit an end marker if it started.
    Cancel(RelayMessageId),
}

const MAX_QUEUED_MESSAGES: usize = 16;
const MAX_QUEUED_CHUNKS: usize = 32;

#[derive(PartialEq)]
enum Phase {
    Forward,
    Response,
}

struct QueuedChunk {
    chunk: RelayChunk,
    origin: usize,
}

struct RelayMsg {
    unique: u32,
    from: usize,
    to: usize,
    /// Header handed to the destination writer with the first chunk.
    header: Option<(MessageHeader, u8)>,
    chunks: Vec<QueuedChunk>,
    phase: Phase,
    wait_response: bool,
    canceled: bool,
    queued: bool,
}

impl RelayMsg {
    fn dest(&self) -> usize {
        match self.phase {
            Phase::Forward => self.to,
            Phase::Response => self.from,
        }
    }
}

struct RelayConn {
    unique: u32,
    actor: ActorId,
    /// Message slots with output queued for this connection.
    outbound: Vec<usize>,
    notified: bool,
    /// Buffer id -> chunks of it still travelling.
    held: IndexMap<usize, u32>,
    done_pending: u32,
    done_notified: bool,
    /// Connections back-pressured while feeding this one; poked once
    /// the queue drains.
    blocked_senders: Vec<usize>,
}

struct RelayInner {
    conns: Slab<RelayConn>,
    names: IndexMap<String, RelayConnId>,
    msgs: Slab<RelayMsg>,
    conn_unique: u32,
    msg_unique: u32,
}

/// In-process forwarding of message bytes between two connections.
///
/// The engine owns clones of the receive buffers the slices live in;
/// the originating connection gets a `RelayDone` once every slice cut
/// from one of its buffers has been drained by the peers, at which
/// point the buffer drops back to a single owner and can be reused.
/// Cross-reactor notifications are coalesced: a flag per connection,
/// one wake per batch.
pub struct RelayEngine {
    manager: Manager,
    inner: Mutex<RelayInner>,
}

impl RelayEngine {
    pub fn new(manager: Manager) -> RelayEngine {
        RelayEngine {
            manager,
            inner: Mutex::new(RelayInner {
                conns: Slab::new(),
                names: IndexMap::new(),
                msgs: Slab::new(),
                conn_unique: 0,
                msg_unique: 0,
            }),
        }
    }

    pub fn register_connection(&self, actor: ActorId) -> RelayConnId {
        let mut inner = self.inner.lock().unwrap();
        inner.conn_unique = inner.conn_unique.wrapping_add(1);
        let unique = inner.conn_unique;
        let index = inner.conns.insert(RelayConn {
            unique,
            actor,
            outbound: Vec::new(),
            notified: false,
            held: IndexMap::new(),
            done_pending: 0,
            done_notified: false,
            blocked_senders: Vec::new(),
        }) as u32;
        trace!("relay: connection {} registered as {}:{}", actor, index, unique);
        RelayConnId { index, unique }
    }

    /// Binds a routing name to a registered connection. Returns false
    /// when the name is already taken by a live connection.
    pub fn register_name(&self, name: &str, id: RelayConnId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if !inner.conn_valid(id) {
            return false;
        }
        match inner.names.get(name) {
            Some(&existing) if inner.conn_valid(existing) && existing != id => false,
            _ => {
                inner.names.insert(name.to_owned(), id);
                debug!("relay: name {:?} -> {:?}", name, id);
                true
            }
        }
    }

    /// Starts relaying a message routed by its header url. `Ok(None)`
    /// is back-pressure; unknown destinations are an error on the
    /// offering connection.
    pub fn relay_start(
        &self,
        from: RelayConnId,
        header: MessageHeader,
        relay_hops: u8,
        chunk: RelayChunk,
    ) -> Result<Option<RelayMessageId>> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.conn_valid(from) {
            return Err(Error::ConnectionInvalidState);
        }
        let to = match inner.names.get(header.url.as_str()) {
            Some(&id) if inner.conn_valid(id) => id.index as usize,
            _ => return Err(Error::ConnectionInvalidState),
        };
        if inner.conns[to].outbound.len() >= MAX_QUEUED_MESSAGES {
            inner.block_sender(to, from.index as usize);
            return Ok(None);
        }

        inner.msg_unique = inner.msg_unique.wrapping_add(1);
        let unique = inner.msg_unique;
        let wait_response = header.flags.contains(MessageFlags::WAIT_RESPONSE);
        let from_slot = from.index as usize;

        inner.hold_buffer(from_slot, &chunk.buf);
        let index = inner.msgs.insert(RelayMsg {
            unique,
            from: from_slot,
            to,
            header: Some((header, relay_hops.saturating_add(1))),
            chunks: vec![QueuedChunk {
                chunk,
                origin: from_slot,
            }],
            phase: Phase::Forward,
            wait_response,
            canceled: false,
            queued: false,
        });
        let id = RelayMessageId {
            index: index as u32,
            unique,
        };
        inner.queue_msg(index);
        inner.notify_new(&self.manager, to);
        Ok(Some(id))
    }

    /// Appends body bytes to an in-flight relayed message.
    pub fn relay_body(
        &self,
        from: RelayConnId,
        id: RelayMessageId,
        chunk: RelayChunk,
    ) -> Result<RelayAccept> {
        let mut inner = self.inner.lock().unwrap();
        let slot = id.index as usize;
        let msg = match inner.msgs.get(slot) {
            Some(msg) if msg.unique == id.unique && !msg.canceled => msg,
            _ => return Ok(RelayAccept::Dead),
        };
        if msg.from != from.index as usize {
            return Err(Error::ConnectionInvalidState);
        }
        if msg.chunks.len() >= MAX_QUEUED_CHUNKS {
            let dest = msg.dest();
            let from_slot = from.index as usize;
            inner.block_sender(dest, from_slot);
            return Ok(RelayAccept::Refused);
        }
        let origin = msg.from;
        let dest = msg.dest();
        inner.hold_buffer(origin, &chunk.buf);
        inner.msgs[slot].chunks.push(QueuedChunk { chunk, origin });
        inner.queue_msg(slot);
        inner.notify_new(&self.manager, dest);
        Ok(RelayAccept::Accepted)
    }

    /// Starts the response leg of a relayed request, flowing from the
    /// destination connection back to the originating one.
    pub fn relay_response(
        &self,
        from: RelayConnId,
        id: RelayMessageId,
        header: MessageHeader,
        relay_hops: u8,
        chunk: RelayChunk,
    ) -> Result<RelayAccept> {
        let mut inner = self.inner.lock().unwrap();
        let slot = id.index as usize;
        let msg = match inner.msgs.get_mut(slot) {
            Some(msg) if msg.unique == id.unique && !msg.canceled => msg,
            _ => return Ok(RelayAccept::Dead),
        };
        if msg.to != from.index as usize || !msg.wait_response {
            return Err(Error::ConnectionInvalidResponseState);
        }
        msg.phase = Phase::Response;
        msg.header = Some((header, relay_hops.saturating_add(1)));
        let origin = msg.to;
        let dest = msg.dest();
        inner.hold_buffer(origin, &chunk.buf);
        inner.msgs[slot].chunks.push(QueuedChunk { chunk, origin });
        inner.queue_msg(slot);
        inner.notify_new(&self.manager, dest);
        Ok(RelayAccept::Accepted)
    }

    /// Looks up which engine message a received response belongs to.
    pub fn response_target(&self, from: RelayConnId, request_id: u32) -> Option<RelayMessageId> {
        let inner = self.inner.lock().unwrap();
        for (index, msg) in inner.msgs.iter() {
            if msg.to == from.index as usize
                && msg.wait_response
                && !msg.canceled
                && msg
                    .header
                    .as_ref()
                    .map(|(h, _)| h.sender_request_id == request_id)
                    .unwrap_or(false)
            {
                return Some(RelayMessageId {
                    index: index as u32,
                    unique: msg.unique,
                });
            }
        }
        None
    }

    /// Drains queued output for connection `me`: at most the head
    /// chunk of every queued message (the destination writer holds
    /// one chunk per relayed message at a time), plus cancel markers.
    /// Rejected items go back through [`RelayEngine::push_back`];
    /// completed chunks re-queue their message via
    /// [`RelayEngine::complete`].
    pub fn poll_new(&self, me: RelayConnId) -> Vec<RelayPoll> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.conn_valid(me) {
            return Vec::new();
        }
        let slot = me.index as usize;
        inner.conns[slot].notified = false;

        let outbound = std::mem::take(&mut inner.conns[slot].outbound);
        let mut items = Vec::with_capacity(outbound.len());

        for msg_slot in outbound {
            let item = match inner.msgs.get_mut(msg_slot) {
                None => None,
                Some(msg) => {
                    let id = RelayMessageId {
                        index: msg_slot as u32,
                        unique: msg.unique,
                    };
                    if msg.canceled {
                        Some(RelayPoll::Cancel(id))
                    } else if msg.chunks.is_empty() {
                        msg.queued = false;
                        None
                    } else {
                        msg.queued = false;
                        let header = msg.header.take();
                        let queued = msg.chunks.remove(0);
                        Some(RelayPoll::Chunk(id, header, queued.chunk))
                    }
                }
            };
            match item {
                Some(RelayPoll::Cancel(id)) => {
                    inner.release_msg_chunks(msg_slot, &self.manager);
                    inner.msgs.remove(msg_slot);
                    items.push(RelayPoll::Cancel(id));
                }
                Some(item) => items.push(item),
                None => (),
            }
        }

        // the queue has room again: wake senders we turned away
        let blocked = std::mem::take(&mut inner.conns[slot].blocked_senders);
        for sender in blocked {
            if let Some(conn) = inner.conns.get(sender) {
                self.manager.notify(conn.actor, event_retry_recv());
            }
        }

        items
    }

    /// Returns a polled chunk the destination writer could not take;
    /// it goes back to the head of its message.
    pub fn push_back(
        &self,
        id: RelayMessageId,
        header: Option<(MessageHeader, u8)>,
        chunk: RelayChunk,
    ) {
        let mut inner = self.inner.lock().unwrap();
        let slot = id.index as usize;
        let valid = inner
            .msgs
            .get(slot)
            .map(|m| m.unique == id.unique)
            .unwrap_or(false);
        if !valid {
            // canceled in the meantime; unwind the buffer hold
            let buf_id = chunk.buf.id();
            drop(chunk);
            inner.release_hold_anywhere(&self.manager, buf_id);
            return;
        }
        let msg = &mut inner.msgs[slot];
        if header.is_some() {
            msg.header = header;
        }
        let origin = match msg.phase {
            Phase::Forward => msg.from,
            Phase::Response => msg.to,
        };
        msg.chunks.insert(0, QueuedChunk { chunk, origin });
        inner.queue_msg(slot);
    }

    /// The destination's writer finished one chunk: release the hold
    /// on the originating buffer and, when the message is complete,
    /// retire or park the slot for its response leg.
    pub fn complete(&self, id: RelayMessageId, buf: SharedBuffer, was_last: bool) {
        let mut inner = self.inner.lock().unwrap();
        let slot = id.index as usize;

        let origin = match inner.msgs.get(slot) {
            Some(msg) if msg.unique == id.unique => match msg.phase {
                Phase::Forward => msg.from,
                Phase::Response => msg.to,
            },
            _ => {
                // msg is gone (canceled under the writer); the buffer
                // hold still must unwind for whoever owns it
                let buf_id = buf.id();
                drop(buf);
                inner.release_hold_anywhere(&self.manager, buf_id);
                return;
            }
        };

        let buf_id = buf.id();
        drop(buf);
        inner.release_hold(&self.manager, origin, buf_id);

        if was_last {
            let retire = {
                let msg = &mut inner.msgs[slot];
                match msg.phase {
                    // park the slot for the response leg
                    Phase::Forward if msg.wait_response => false,
                    _ => true,
                }
            };
            if retire {
                inner.msgs.remove(slot);
            }
            return;
        }

        // more chunks may already be buffered; put the message back
        // in the destination's queue
        let dest = {
            let msg = &inner.msgs[slot];
            if msg.chunks.is_empty() || msg.queued {
                return;
            }
            msg.dest()
        };
        inner.queue_msg(slot);
        inner.notify_new(&self.manager, dest);
    }

    /// Drains the count of this connection's buffers fully returned
    /// by relaying peers.
    pub fn take_done(&self, me: RelayConnId) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        if !inner.conn_valid(me) {
            return 0;
        }
        let conn = &mut inner.conns[me.index as usize];
        conn.done_notified = false;
        std::mem::take(&mut conn.done_pending)
    }

    /// Cancels one in-flight relayed message from its sending side;
    /// the destination's writer emits the end marker.
    pub fn cancel_message(&self, from: RelayConnId, id: RelayMessageId) {
        let mut inner = self.inner.lock().unwrap();
        let slot = id.index as usize;
        let dest = match inner.msgs.get_mut(slot) {
            Some(msg) if msg.unique == id.unique && msg.from == from.index as usize => {
                msg.canceled = true;
                msg.dest()
            }
            _ => return,
        };
        inner.release_msg_chunks(slot, &self.manager);
        inner.queue_msg(slot);
        inner.notify_new(&self.manager, dest);
    }

    /// Tears down a connection: cancels every message touching it and
    /// releases held buffers back to the survivors.
    pub fn unregister_connection(&self, me: RelayConnId) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.conn_valid(me) {
            return;
        }
        let slot = me.index as usize;

        let involved: Vec<usize> = inner
            .msgs
            .iter()
            .filter(|(_, m)| m.from == slot || m.to == slot)
            .map(|(i, _)| i)
            .collect();

        for msg_slot in involved {
            let dest = {
                let msg = &mut inner.msgs[msg_slot];
                msg.canceled = true;
                msg.dest()
            };
            inner.release_msg_chunks(msg_slot, &self.manager);
            if dest != slot {
                // let the peer's writer emit its cancel marker
                inner.queue_msg(msg_slot);
                inner.notify_new(&self.manager, dest);
            } else {
                inner.msgs.remove(msg_slot);
            }
        }

        inner.names.retain(|_, id| id.index as usize != slot);
        inner.conns.remove(slot);
        debug!("relay: connection {:?} unregistered", me);
    }
}

impl RelayInner {
    fn block_sender(&mut self, dest: usize, sender: usize) {
        if let Some(conn) = self.conns.get_mut(dest) {
            if !conn.blocked_senders.contains(&sender) {
                conn.blocked_senders.push(sender);
            }
        }
    }

    fn conn_valid(&self, id: RelayConnId) -> bool {
        self.conns
            .get(id.index as usize)
            .map(|c| c.unique == id.unique)
            .unwrap_or(false)
    }

    fn hold_buffer(&mut self, origin: usize, buf: &SharedBuffer) {
        if let Some(conn) = self.conns.get_mut(origin) {
            *conn.held.entry(buf.id()).or_insert(0) += 1;
        }
    }

    /// Releases a hold when the owning connection is no longer known
    /// from the message (a receive buffer is pinned by exactly one
    /// connection, so the scan is unambiguous).
    fn release_hold_anywhere(&mut self, manager: &Manager, buf_id: usize) {
        let origin = self
            .conns
            .iter()
            .find(|(_, c)| c.held.contains_key(&buf_id))
            .map(|(i, _)| i);
        if let Some(origin) = origin {
            self.release_hold(manager, origin, buf_id);
        }
    }

    fn release_hold(&mut self, manager: &Manager, origin: usize, buf_id: usize) {
        let Some(conn) = self.conns.get_mut(origin) else {
            return;
        };
        let drained = match conn.held.get_mut(&buf_id) {
            Some(count) => {
                *count -= 1;
                *count == 0
            }
            None => false,
        };
        if drained {
            conn.held.swap_remove(&buf_id);
            conn.done_pending += 1;
            if !conn.done_notified {
                conn.done_notified = true;
                manager.notify(conn.actor, event_relay_done());
            }
        }
    }

    fn release_msg_chunks(&mut self, msg_slot: usize, manager: &Manager) {
        let chunks = match self.msgs.get_mut(msg_slot) {
            Some(msg) => std::mem::take(&mut msg.chunks),
            None => return,
        };
        for queued in chunks {
            let buf_id = queued.chunk.buf.id();
            drop(queued.chunk);
            self.release_hold(manager, queued.origin, buf_id);
        }
    }

    fn queue_msg(&mut self, msg_slot: usize) {
        let dest = match self.msgs.get_mut(msg_slot) {
            Some(msg) => {
                if msg.queued {
                    return;
                }
                msg.queued = true;
                msg.dest()
            }
            None => return,
        };
        if let Some(conn) = self.conns.get_mut(dest) {
            conn.outbound.push(msg_slot);
        }
    }

    fn notify_new(&mut self, manager: &Manager, dest: usize) {
        if let Some(conn) = self.conns.get_mut(dest) {
            if !conn.notified {
                conn.notified = true;
                manager.notify(conn.actor, event_relay_new());
            }
        }
    }
}
