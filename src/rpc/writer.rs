use std::collections::VecDeque;

use indexmap::IndexMap;
use log::trace;
use slab::Slab;

use crate::buffer::SharedBuffer;
use crate::error::{Error, Result};

use super::message::{MessageBundle, MessageFlags, MessageHeader, MessageId};
use super::protocol::{Protocol, Serializer};
use super::relay::{RelayChunk, RelayMessageId};
use super::wire::{
    encode_message_header, PacketHeader, PacketType, RecordFlags, RecordHeader,
    PACKET_HEADER_SIZE, RECORD_HEADER_SIZE,
};

/// Smallest record worth opening a packet for: sub-header plus a few
/// body bytes.
const MIN_RECORD_SPACE: usize = RECORD_HEADER_SIZE + 16;

struct MessageSlot {
    bundle: MessageBundle,
    serializer: Option<Box<dyn Serializer>>,
    header_bytes: Vec<u8>,
    request_id: u32,
    pool_id: MessageId,
    started: bool,
    canceled: bool,
    sync: bool,
}

struct RelaySlot {
    engine_id: RelayMessageId,
    header: Option<Vec<u8>>,
    hops: u8,
    response: bool,
    chunk: Option<RelayChunk>,
    chunk_off: usize,
    started: bool,
    canceled: bool,
}

enum SlotKind {
    Message(MessageSlot),
    Relay(RelaySlot),
}

struct WriteSlot {
    unique: u32,
    kind: SlotKind,
}

/// Flags and side-channel data for one [`MessageWriter::write_to`].
#[derive(Default)]
pub struct WriteOptions {
    /// Emit a keepalive probe when there is no other traffic.
    pub keepalive: bool,
    /// Receive-buffer acks to piggyback on this packet.
    pub ack_count: u8,
    /// Body records are allowed (there is send credit).
    pub data_allowed: bool,
}

/// What one `write_to` produced beyond the bytes themselves.
#[derive(Default)]
pub struct WriteOutcome {
    pub len: usize,
    pub keepalive_sent: bool,
    /// The ack count was embedded and must not be re-sent.
    pub ack_consumed: bool,
    /// Fully handled messages: completion callbacks to fire.
    pub completed: Vec<(MessageBundle, MessageId, Option<Error>)>,
    /// Relay chunks fully copied out: return them to the engine.
    pub relay_done: Vec<(RelayMessageId, SharedBuffer, bool)>,
}

/// Everything a dying connection still owed.
#[derive(Default)]
pub struct WriterDrain {
    /// `(bundle, pool id, started)`; unstarted non-oneshot messages
    /// may go back to the pool.
    pub messages: Vec<(MessageBundle, MessageId, bool)>,
    /// Relay chunks never emitted, to release with the engine.
    pub relays: Vec<(RelayMessageId, Option<(SharedBuffer, bool)>)>,
}

/// Outcome of a local cancel.
pub enum CancelOutcome {
    Unknown,
    /// Never started: complete it as canceled.
    Dropped(MessageBundle, MessageId),
    /// Mid-flight: a cancel end-marker goes out with the next write.
    Marked,
    /// Fully sent and waiting: complete as canceled and piggyback a
    /// cancel request so the peer stops responding.
    CancelRequest(u32, MessageBundle, MessageId),
}

/// Queue of outgoing messages framed into packets within a capped
/// buffer.
///
/// Message slots serialize round-robin; synchronous messages stay
/// strictly FIFO among themselves by letting only one of them emit at
/// a time. Send-buffer credits throttle body records: with the peer
/// not acking, only keepalives, acks and cancel notifications flow.
pub struct MessageWriter {
    slots: Slab<WriteSlot>,
    unique: u32,
    /// Message slots not yet started, in push order.
    pending: VecDeque<usize>,
    /// Slots currently emitting, round-robin.
    active: VecDeque<usize>,
    /// sender_request_id -> slot parked for its response.
    wait_response: IndexMap<u32, usize>,
    relay_slots: IndexMap<RelayMessageId, usize>,
    cancel_requests: VecDeque<u32>,
    next_request_id: u32,
    message_count: usize,
    max_messages: usize,
    flow_credit: u32,
    max_credit: u32,
    /// Slot currently holding the synchronous lane.
    sync_slot: Option<usize>,
}

impl MessageWriter {
    pub fn new(max_messages: usize, flow_credit: u32) -> MessageWriter {
        MessageWriter {
            slots: Slab::new(),
            unique: 0,
            pending: VecDeque::new(),
            active: VecDeque::new(),
            wait_response: IndexMap::new(),
            relay_slots: IndexMap::new(),
            cancel_requests: VecDeque::new(),
            next_request_id: 0,
            message_count: 0,
            max_messages,
            flow_credit,
            max_credit: flow_credit,
            sync_slot: None,
        }
    }

    pub fn can_accept(&self) -> bool {
        self.message_count < self.max_messages && self.flow_credit > 0
    }

    pub fn is_drained(&self) -> bool {
        self.slots.is_empty() && self.cancel_requests.is_empty()
    }

    pub fn has_work(&self) -> bool {
        !self.pending.is_empty() || !self.active.is_empty() || !self.cancel_requests.is_empty()
    }

    pub fn has_credit(&self) -> bool {
        self.flow_credit > 0
    }

    /// One send buffer went out: burn a credit.
    pub fn consume_credit(&mut self) {
        self.flow_credit = self.flow_credit.saturating_sub(1);
    }

    /// The peer released `count` of our send buffers.
    pub fn add_credits(&mut self, count: u8) -> Result<()> {
        let next = self.flow_credit + u32::from(count);
        if next > self.max_credit {
            return Err(Error::ConnectionAckCount);
        }
        self.flow_credit = next;
        Ok(())
    }

    fn bump_request_id(&mut self) -> u32 {
        // zero means "no response expected"
        self.next_request_id = self.next_request_id.wrapping_add(1);
        if self.next_request_id == 0 {
            self.next_request_id = 1;
        }
        self.next_request_id
    }

    /// Accepts a message into the slot table. On failure the bundle
    /// comes back so its completion can still fire.
    pub fn push_message(
        &mut self,
        mut bundle: MessageBundle,
        pool_id: MessageId,
        proto: &dyn Protocol,
    ) -> std::result::Result<MessageId, (MessageBundle, Error)> {
        if self.message_count >= self.max_messages {
            return Err((bundle, Error::Already));
        }

        let serializer = match &bundle.message {
            Some(message) => match proto.serializer(&**message) {
                Ok(serializer) => serializer,
                Err(e) => return Err((bundle, e)),
            },
            None => {
                return Err((
                    bundle,
                    Error::InvalidConfiguration("message bundle without payload"),
                ))
            }
        };

        let request_id = if bundle.flags.contains(MessageFlags::WAIT_RESPONSE) {
            self.bump_request_id()
        } else {
            0
        };

        let header = MessageHeader {
            flags: bundle.flags,
            url: std::mem::take(&mut bundle.url),
            sender_request_id: request_id,
            recipient_request_id: bundle.recipient_request_id,
        };
        let mut header_bytes = Vec::new();
        if let Err(e) = encode_message_header(&header, &mut header_bytes) {
            bundle.url = header.url;
            return Err((bundle, e));
        }
        bundle.url = header.url;

        self.unique = self.unique.wrapping_add(1);
        let unique = self.unique;
        let sync = bundle.flags.contains(MessageFlags::SYNCHRONOUS);

        let slot = self.slots.insert(WriteSlot {
            unique,
            kind: SlotKind::Message(MessageSlot {
                bundle,
                serializer: Some(serializer),
                header_bytes,
                request_id,
                pool_id,
                started: false,
                canceled: false,
                sync,
            }),
        });
        self.message_count += 1;
        self.pending.push_back(slot);

        trace!("writer: slot {} queued, request id {}", slot, request_id);
        Ok(MessageId::new(slot as u32, unique))
    }

    /// Cancels a tracked message; see [`CancelOutcome`].
    pub fn cancel(&mut self, id: MessageId) -> CancelOutcome {
        let slot = id.index as usize;
        let (started, waiting) = match self.slots.get(slot) {
            Some(s) if s.unique == id.unique => match &s.kind {
                SlotKind::Message(m) => (
                    m.started,
                    m.serializer.is_none() && self.wait_response.contains_key(&m.request_id),
                ),
                SlotKind::Relay(_) => return CancelOutcome::Unknown,
            },
            _ => return CancelOutcome::Unknown,
        };

        if !started {
            let removed = self.remove_message_slot(slot);
            self.pending.retain(|&s| s != slot);
            self.active.retain(|&s| s != slot);
            return CancelOutcome::Dropped(removed.bundle, removed.pool_id);
        }

        if waiting {
            let removed = self.remove_message_slot(slot);
            self.wait_response.swap_remove(&removed.request_id);
            return CancelOutcome::CancelRequest(
                removed.request_id,
                removed.bundle,
                removed.pool_id,
            );
        }

        if let Some(WriteSlot {
            kind: SlotKind::Message(m),
            ..
        }) = self.slots.get_mut(slot)
        {
            m.canceled = true;
        }
        CancelOutcome::Marked
    }

    /// Resolves an incoming response to the waiting bundle.
    pub fn take_response(
        &mut self,
        recipient_request_id: u32,
    ) -> Option<(MessageBundle, MessageId)> {
        let slot = self.wait_response.swap_remove(&recipient_request_id)?;
        let removed = self.remove_message_slot(slot);
        Some((removed.bundle, removed.pool_id))
    }

    /// The peer canceled the response for one of our requests.
    pub fn response_canceled(&mut self, request_id: u32) -> Option<(MessageBundle, MessageId)> {
        self.take_response(request_id)
    }

    pub fn is_waiting_response(&self, request_id: u32) -> bool {
        self.wait_response.contains_key(&request_id)
    }

    /// Queues a cancel-request notification to the peer.
    pub fn push_cancel_request(&mut self, request_id: u32) {
        self.cancel_requests.push_back(request_id);
    }

    /// Offers one relay chunk; false means the slot is still holding
    /// the previous chunk and the engine should retry later.
    pub fn push_relay_chunk(
        &mut self,
        engine_id: RelayMessageId,
        header: Option<(MessageHeader, u8)>,
        chunk: RelayChunk,
    ) -> std::result::Result<(), (Option<(MessageHeader, u8)>, RelayChunk)> {
        if let Some(&slot) = self.relay_slots.get(&engine_id) {
            match &mut self.slots[slot].kind {
                SlotKind::Relay(r) if r.chunk.is_none() && !r.canceled => {
                    r.chunk = Some(chunk);
                    r.chunk_off = 0;
                    if !self.active.contains(&slot) {
                        self.active.push_back(slot);
                    }
                    Ok(())
                }
                _ => Err((header, chunk)),
            }
        } else {
            let (hdr, hops) = match header {
                Some(pair) => pair,
                // a first chunk without its header cannot be framed
                None => return Err((None, chunk)),
            };
            let response = hdr.flags.contains(MessageFlags::RESPONSE);
            let mut header_bytes = Vec::new();
            if encode_message_header(&hdr, &mut header_bytes).is_err() {
                return Err((Some((hdr, hops)), chunk));
            }

            self.unique = self.unique.wrapping_add(1);
            let slot = self.slots.insert(WriteSlot {
                unique: self.unique,
                kind: SlotKind::Relay(RelaySlot {
                    engine_id,
                    header: Some(header_bytes),
                    hops,
                    response,
                    chunk: Some(chunk),
                    chunk_off: 0,
                    started: false,
                    canceled: false,
                }),
            });
            self.relay_slots.insert(engine_id, slot);
            self.active.push_back(slot);
            Ok(())
        }
    }

    /// Marks a relayed message canceled. Returns a chunk that never
    /// hit the wire so the caller can release it with the engine.
    pub fn cancel_relay(&mut self, engine_id: RelayMessageId) -> Option<(SharedBuffer, bool)> {
        let &slot = self.relay_slots.get(&engine_id)?;
        let (started, held) = match &mut self.slots[slot].kind {
            SlotKind::Relay(r) => {
                let held = r.chunk.take().map(|c| (c.buf, c.is_last));
                r.canceled = true;
                (r.started, held)
            }
            SlotKind::Message(_) => return None,
        };
        if started {
            if !self.active.contains(&slot) {
                self.active.push_back(slot);
            }
        } else {
            self.relay_slots.swap_remove(&engine_id);
            self.active.retain(|&s| s != slot);
            self.slots.remove(slot);
        }
        held
    }

    /// Empties the writer for connection teardown.
    pub fn drain_for_stop(&mut self) -> WriterDrain {
        let mut drain = WriterDrain::default();
        let slots: Vec<usize> = self.slots.iter().map(|(i, _)| i).collect();
        for slot in slots {
            match self.slots.remove(slot).kind {
                SlotKind::Message(m) => {
                    drain.messages.push((m.bundle, m.pool_id, m.started));
                }
                SlotKind::Relay(r) => {
                    drain
                        .relays
                        .push((r.engine_id, r.chunk.map(|c| (c.buf, c.is_last))));
                }
            }
        }
        self.pending.clear();
        self.active.clear();
        self.wait_response.clear();
        self.relay_slots.clear();
        self.cancel_requests.clear();
        self.message_count = 0;
        self.sync_slot = None;
        drain
    }

    fn remove_message_slot(&mut self, slot: usize) -> MessageSlot {
        if self.sync_slot == Some(slot) {
            self.sync_slot = None;
        }
        let removed = self.slots.remove(slot);
        self.message_count -= 1;
        match removed.kind {
            SlotKind::Message(m) => m,
            // callers only hand message slots here
            SlotKind::Relay(_) => unreachable!("relay slot in message table"),
        }
    }

    /// Moves eligible pending messages into the active set; at most
    /// one synchronous message owns the lane at a time.
    fn promote_pending(&mut self) {
        let mut rest = VecDeque::new();
        while let Some(slot) = self.pending.pop_front() {
            let sync = match self.slots.get(slot) {
                Some(WriteSlot {
                    kind: SlotKind::Message(m),
                    ..
                }) => m.sync,
                _ => continue,
            };
            if sync {
                if self.sync_slot.is_some() {
                    rest.push_back(slot);
                    continue;
                }
                self.sync_slot = Some(slot);
            }
            self.active.push_back(slot);
        }
        self.pending = rest;
    }

    /// Fills `out` with at most one packet. See [`WriteOutcome`].
    pub fn write_to(&mut self, out: &mut [u8], opts: WriteOptions) -> Result<WriteOutcome> {
        let mut outcome = WriteOutcome::default();
        if out.len() < PACKET_HEADER_SIZE + MIN_RECORD_SPACE {
            return Ok(outcome);
        }

        let body_cap = out.len() - PACKET_HEADER_SIZE;
        let mut body_len = 0usize;

        // cancel notifications ride ahead of everything else
        while !self.cancel_requests.is_empty() && body_cap - body_len >= RECORD_HEADER_SIZE {
            let request_id = match self.cancel_requests.pop_front() {
                Some(id) => id,
                None => break,
            };
            let rec = RecordHeader {
                flags: RecordFlags::CANCEL_REQUEST,
                relay_hops: 0,
                message_index: 0,
                length: 0,
                sender_request_id: 0,
                recipient_request_id: request_id,
            };
            rec.encode(&mut out[PACKET_HEADER_SIZE + body_len..]);
            body_len += RECORD_HEADER_SIZE;
        }

        let body_start = body_len;
        if opts.data_allowed && self.flow_credit > 0 {
            self.promote_pending();

            let mut spins = self.active.len();
            while spins > 0 && body_cap - body_len >= MIN_RECORD_SPACE {
                let slot = match self.active.pop_front() {
                    Some(slot) => slot,
                    None => break,
                };
                spins -= 1;

                let end = PACKET_HEADER_SIZE + body_cap;
                let emitted = self.emit_slot(
                    slot,
                    &mut out[PACKET_HEADER_SIZE + body_len..end],
                    &mut outcome,
                )?;
                body_len += emitted.bytes;

                if emitted.keep_active {
                    self.active.push_back(slot);
                    if emitted.bytes > 0 {
                        spins += 1;
                    }
                }
            }
        }

        // each data packet that carried body records burns one
        // flow-control credit; the peer acks it back
        if body_len > body_start {
            self.flow_credit = self.flow_credit.saturating_sub(1);
        }

        let mut hdr = PacketHeader::new(PacketType::Data);
        if body_len == 0 {
            if !opts.keepalive && opts.ack_count == 0 {
                return Ok(outcome);
            }
            hdr = PacketHeader::new(PacketType::KeepAlive);
            outcome.keepalive_sent = opts.keepalive;
        }
        hdr.length = body_len as u32;
        hdr.ack_count = opts.ack_count;
        outcome.ack_consumed = opts.ack_count > 0;
        hdr.encode(out);
        outcome.len = PACKET_HEADER_SIZE + body_len;
        Ok(outcome)
    }

    fn emit_slot(
        &mut self,
        slot: usize,
        out: &mut [u8],
        outcome: &mut WriteOutcome,
    ) -> Result<EmitResult> {
        let is_message = match self.slots.get(slot) {
            Some(s) => matches!(s.kind, SlotKind::Message(_)),
            None => {
                return Ok(EmitResult {
                    bytes: 0,
                    keep_active: false,
                })
            }
        };
        if is_message {
            self.emit_message_record(slot, out, outcome)
        } else {
            self.emit_relay_record(slot, out, outcome)
        }
    }

    fn emit_message_record(
        &mut self,
        slot: usize,
        out: &mut [u8],
        outcome: &mut WriteOutcome,
    ) -> Result<EmitResult> {
        let message_index = slot as u16;
        let cap = out.len() - RECORD_HEADER_SIZE;

        let (written, finished, canceled) = {
            let m = match &mut self.slots[slot].kind {
                SlotKind::Message(m) => m,
                SlotKind::Relay(_) => unreachable!("slot kind changed"),
            };

            if m.canceled {
                let mut flags = RecordFlags::CANCELED;
                if m.bundle.flags.contains(MessageFlags::RESPONSE) {
                    flags |= RecordFlags::RESPONSE;
                }
                let rec = RecordHeader {
                    flags,
                    relay_hops: 0,
                    message_index,
                    length: 0,
                    sender_request_id: m.request_id,
                    recipient_request_id: m.bundle.recipient_request_id,
                };
                rec.encode(out);
                (0, false, true)
            } else {
                let dst = &mut out[RECORD_HEADER_SIZE..];
                let mut written = 0usize;

                if !m.started {
                    // the whole message header rides the first record
                    if m.header_bytes.len() + 1 > cap {
                        return Ok(EmitResult {
                            bytes: 0,
                            keep_active: true,
                        });
                    }
                    dst[..m.header_bytes.len()].copy_from_slice(&m.header_bytes);
                    written = m.header_bytes.len();
                }

                let mut finished = false;
                if let Some(ser) = &mut m.serializer {
                    if !ser.is_finished() && written < cap {
                        written += ser.write_some(&mut dst[written..cap])?;
                    }
                    finished = ser.is_finished();
                }

                let mut flags = RecordFlags::empty();
                if !m.started {
                    flags |= RecordFlags::NEW_MESSAGE;
                }
                if m.bundle.flags.contains(MessageFlags::RESPONSE) {
                    flags |= RecordFlags::RESPONSE;
                }
                if !finished {
                    flags |= RecordFlags::CONTINUED;
                }

                let rec = RecordHeader {
                    flags,
                    relay_hops: 0,
                    message_index,
                    length: written as u32,
                    sender_request_id: m.request_id,
                    recipient_request_id: m.bundle.recipient_request_id,
                };
                rec.encode(out);
                m.started = true;
                if finished {
                    m.serializer = None;
                }
                (written, finished, false)
            }
        };

        if canceled {
            let removed = self.remove_message_slot(slot);
            outcome
                .completed
                .push((removed.bundle, removed.pool_id, Some(Error::MessageCanceled)));
            return Ok(EmitResult {
                bytes: RECORD_HEADER_SIZE,
                keep_active: false,
            });
        }

        if !finished {
            return Ok(EmitResult {
                bytes: RECORD_HEADER_SIZE + written,
                keep_active: true,
            });
        }

        // finished: park for the response or complete now
        let (wait, request_id) = match &self.slots[slot].kind {
            SlotKind::Message(m) => (
                m.bundle.flags.contains(MessageFlags::WAIT_RESPONSE),
                m.request_id,
            ),
            SlotKind::Relay(_) => unreachable!("slot kind changed"),
        };
        if self.sync_slot == Some(slot) {
            self.sync_slot = None;
        }
        if wait {
            self.wait_response.insert(request_id, slot);
        } else {
            let removed = self.remove_message_slot(slot);
            outcome
                .completed
                .push((removed.bundle, removed.pool_id, None));
        }
        Ok(EmitResult {
            bytes: RECORD_HEADER_SIZE + written,
            keep_active: false,
        })
    }

    fn emit_relay_record(
        &mut self,
        slot: usize,
        out: &mut [u8],
        outcome: &mut WriteOutcome,
    ) -> Result<EmitResult> {
        let message_index = slot as u16;
        let cap = out.len() - RECORD_HEADER_SIZE;

        // cancel marker first
        let cancel = match &self.slots[slot].kind {
            SlotKind::Relay(r) if r.canceled => Some((r.engine_id, r.response, r.hops)),
            SlotKind::Relay(_) => None,
            SlotKind::Message(_) => unreachable!("slot kind changed"),
        };
        if let Some((engine_id, response, hops)) = cancel {
            let mut flags = RecordFlags::CANCELED;
            if response {
                flags |= RecordFlags::RESPONSE;
            }
            let rec = RecordHeader {
                flags,
                relay_hops: hops,
                message_index,
                length: 0,
                sender_request_id: 0,
                recipient_request_id: 0,
            };
            rec.encode(out);
            self.relay_slots.swap_remove(&engine_id);
            self.slots.remove(slot);
            return Ok(EmitResult {
                bytes: RECORD_HEADER_SIZE,
                keep_active: false,
            });
        }

        // the message header rides whole in the first record
        let header = {
            let r = match &mut self.slots[slot].kind {
                SlotKind::Relay(r) => r,
                SlotKind::Message(_) => unreachable!("slot kind changed"),
            };
            if r.chunk.is_none() {
                return Ok(EmitResult {
                    bytes: 0,
                    keep_active: false,
                });
            }
            match r.header.take() {
                Some(header) if header.len() + 1 > cap => {
                    r.header = Some(header);
                    return Ok(EmitResult {
                        bytes: 0,
                        keep_active: true,
                    });
                }
                other => other,
            }
        };

        let mut written = 0usize;
        if let Some(header) = header {
            out[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + header.len()].copy_from_slice(&header);
            written = header.len();
        }

        let (total, chunk_done, is_last, engine_id, first, response, hops) = {
            let r = match &mut self.slots[slot].kind {
                SlotKind::Relay(r) => r,
                SlotKind::Message(_) => unreachable!("slot kind changed"),
            };
            let chunk = match r.chunk.take() {
                Some(chunk) => chunk,
                None => {
                    return Ok(EmitResult {
                        bytes: 0,
                        keep_active: false,
                    })
                }
            };

            let data = &chunk.buf.bytes()[chunk.range.clone()];
            let n = (data.len() - r.chunk_off).min(cap - written);
            out[RECORD_HEADER_SIZE + written..RECORD_HEADER_SIZE + written + n]
                .copy_from_slice(&data[r.chunk_off..r.chunk_off + n]);
            r.chunk_off += n;

            let chunk_done = r.chunk_off == chunk.range.len();
            let is_last = chunk_done && chunk.is_last;
            let engine_id = r.engine_id;
            let first = !r.started;
            r.started = true;

            if chunk_done {
                r.chunk_off = 0;
                outcome.relay_done.push((engine_id, chunk.buf, chunk.is_last));
            } else {
                r.chunk = Some(chunk);
            }

            (
                written + n,
                chunk_done,
                is_last,
                engine_id,
                first,
                r.response,
                r.hops,
            )
        };

        let mut flags = RecordFlags::empty();
        if first {
            flags |= RecordFlags::NEW_MESSAGE;
        }
        if response {
            flags |= RecordFlags::RESPONSE;
        }
        if !is_last {
            flags |= RecordFlags::CONTINUED;
        }

        let rec = RecordHeader {
            flags,
            relay_hops: hops,
            message_index,
            length: total as u32,
            sender_request_id: 0,
            recipient_request_id: 0,
        };
        rec.encode(out);

        if is_last {
            self.relay_slots.swap_remove(&engine_id);
            self.slots.remove(slot);
        }

        Ok(EmitResult {
            bytes: RECORD_HEADER_SIZE + total,
            keep_active: !chunk_done,
        })
    }
}

struct EmitResult {
    bytes: usize,
    keep_active: bool,
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::rpc::message::MessageHeader;
    use crate::rpc::protocol::BytesProtocol;
    use crate::rpc::reader::{MessageReader, Receiver, ResponseState};
    use crate::rpc::relay::RelayAccept;
    use std::ops::Range;

    #[derive(Default)]
    struct TestReceiver {
        messages: Vec<(MessageHeader, Vec<u8>)>,
        keepalives: usize,
        acks: u32,
        data_packets: u32,
        cancel_requests: Vec<u32>,
        waiting: Vec<u32>,
    }

    impl Receiver for TestReceiver {
        fn receive_message(&mut self, header: MessageHeader, message: crate::rpc::MessagePtr, _type_id: u64) {
            let body = *message.downcast::<Vec<u8>>().unwrap();
            self.messages.push((header, body));
        }

        fn receive_keepalive(&mut self) {
            self.keepalives += 1;
        }

        fn receive_data_packet(&mut self, _held_by_relay: bool) {
            self.data_packets += 1;
        }

        fn receive_ack_count(&mut self, count: u8) {
            self.acks += u32::from(count);
        }

        fn receive_cancel_request(&mut self, request_id: u32) {
            self.cancel_requests.push(request_id);
        }

        fn receive_response_canceled(&mut self, _request_id: u32) {}

        fn check_response_state(&mut self, header: &MessageHeader) -> ResponseState {
            if self.waiting.contains(&header.recipient_request_id) {
                ResponseState::Accept
            } else {
                ResponseState::Invalid
            }
        }

        fn should_relay(&mut self, _header: &MessageHeader) -> bool {
            false
        }

        fn receive_relay_start(
            &mut self,
            _header: &MessageHeader,
            _relay_hops: u8,
            _data: Range<usize>,
            _is_last: bool,
        ) -> Result<Option<RelayMessageId>> {
            panic!("relay unused in these tests");
        }

        fn receive_relay_body(
            &mut self,
            _id: RelayMessageId,
            _data: Range<usize>,
            _is_last: bool,
        ) -> Result<RelayAccept> {
            panic!("relay unused in these tests");
        }

        fn receive_relay_response(
            &mut self,
            _header: &MessageHeader,
            _relay_hops: u8,
            _id: RelayMessageId,
            _data: Range<usize>,
            _is_last: bool,
        ) -> Result<RelayAccept> {
            panic!("relay unused in these tests");
        }

        fn receive_relay_cancel(&mut self, _id: RelayMessageId) {}
    }

    fn pump(
        writer: &mut MessageWriter,
        reader: &mut MessageReader,
        rcv: &mut TestReceiver,
        buf_size: usize,
    ) -> Vec<(MessageBundle, MessageId, Option<Error>)> {
        let proto = BytesProtocol;
        let mut completed = Vec::new();
        let mut buf = vec![0u8; buf_size];
        loop {
            let outcome = writer
                .write_to(
                    &mut buf,
                    WriteOptions {
                        keepalive: false,
                        ack_count: 0,
                        data_allowed: true,
                    },
                )
                .unwrap();
            if outcome.len == 0 {
                break;
            }
            let before = rcv.data_packets;
            let read = reader.read(&buf[..outcome.len], &proto, rcv).unwrap();
            assert_eq!(read.consumed, outcome.len);
            assert!(!read.blocked);
            completed.extend(outcome.completed);
            // loop the peer's flow-control acks straight back
            let acked = rcv.data_packets - before;
            if acked > 0 {
                writer.add_credits(acked as u8).unwrap();
            }
        }
        completed
    }

    fn bundle(data: Vec<u8>, url: &str, flags: MessageFlags) -> MessageBundle {
        MessageBundle::new(Box::new(data), url, flags)
    }

    #[test]
    fn single_message_roundtrip() {
        let mut writer = MessageWriter::new(16, 4);
        let mut reader = MessageReader::new(true);
        let mut rcv = TestReceiver::default();
        let proto = BytesProtocol;

        writer
            .push_message(
                bundle(b"hello there".to_vec(), "peer/one", MessageFlags::empty()),
                MessageId::new(0, 0),
                &proto,
            )
            .unwrap();

        let completed = pump(&mut writer, &mut reader, &mut rcv, 4096);
        assert_eq!(completed.len(), 1);
        assert!(completed[0].2.is_none());

        assert_eq!(rcv.messages.len(), 1);
        assert_eq!(rcv.messages[0].0.url, "peer/one");
        assert_eq!(rcv.messages[0].1, b"hello there");
        assert!(writer.is_drained());
    }

    #[test]
    fn large_message_spans_packets() {
        let mut writer = MessageWriter::new(16, 4);
        let mut reader = MessageReader::new(true);
        let mut rcv = TestReceiver::default();
        let proto = BytesProtocol;

        let body: Vec<u8> = (0..10_000u32).map(|i| i as u8).collect();
        writer
            .push_message(
                bundle(body.clone(), "", MessageFlags::empty()),
                MessageId::new(0, 0),
                &proto,
            )
            .unwrap();

        pump(&mut writer, &mut reader, &mut rcv, 1024);
        assert_eq!(rcv.messages.len(), 1);
        assert_eq!(rcv.messages[0].1, body);
    }

    #[test]
    fn messages_multiplex_within_one_packet() {
        let mut writer = MessageWriter::new(16, 4);
        let mut reader = MessageReader::new(true);
        let mut rcv = TestReceiver::default();
        let proto = BytesProtocol;

        for i in 0..3u8 {
            writer
                .push_message(
                    bundle(vec![i; 64], "", MessageFlags::empty()),
                    MessageId::new(u32::from(i), 0),
                    &proto,
                )
                .unwrap();
        }

        let completed = pump(&mut writer, &mut reader, &mut rcv, 4096);
        assert_eq!(completed.len(), 3);
        assert_eq!(rcv.messages.len(), 3);
    }

    #[test]
    fn synchronous_messages_stay_fifo() {
        let mut writer = MessageWriter::new(16, 8);
        let mut reader = MessageReader::new(true);
        let mut rcv = TestReceiver::default();
        let proto = BytesProtocol;

        // both synchronous messages are longer than one packet
        writer
            .push_message(
                bundle(vec![1; 3000], "", MessageFlags::SYNCHRONOUS),
                MessageId::new(1, 0),
                &proto,
            )
            .unwrap();
        writer
            .push_message(
                bundle(vec![2; 3000], "", MessageFlags::SYNCHRONOUS),
                MessageId::new(2, 0),
                &proto,
            )
            .unwrap();

        pump(&mut writer, &mut reader, &mut rcv, 512);
        assert_eq!(rcv.messages.len(), 2);
        // delivery completes in push order, never interleaved
        assert_eq!(rcv.messages[0].1[0], 1);
        assert_eq!(rcv.messages[1].1[0], 2);
    }

    #[test]
    fn cancel_before_start_drops() {
        let mut writer = MessageWriter::new(16, 4);
        let proto = BytesProtocol;

        let id = writer
            .push_message(
                bundle(vec![9; 10], "", MessageFlags::empty()),
                MessageId::new(7, 1),
                &proto,
            )
            .unwrap();

        match writer.cancel(id) {
            CancelOutcome::Dropped(_, pool_id) => assert_eq!(pool_id, MessageId::new(7, 1)),
            _ => panic!("expected a drop"),
        }
        assert!(writer.is_drained());
    }

    #[test]
    fn cancel_mid_flight_emits_end_marker() {
        let mut writer = MessageWriter::new(16, 8);
        let mut reader = MessageReader::new(true);
        let mut rcv = TestReceiver::default();
        let proto = BytesProtocol;

        let id = writer
            .push_message(
                bundle(vec![3; 5000], "", MessageFlags::empty()),
                MessageId::new(0, 0),
                &proto,
            )
            .unwrap();

        // push the first packet out, then cancel
        let mut buf = vec![0u8; 1024];
        let outcome = writer
            .write_to(
                &mut buf,
                WriteOptions {
                    keepalive: false,
                    ack_count: 0,
                    data_allowed: true,
                },
            )
            .unwrap();
        assert!(outcome.len > 0);
        reader.read(&buf[..outcome.len], &proto, &mut rcv).unwrap();

        assert!(matches!(writer.cancel(id), CancelOutcome::Marked));

        let completed = pump(&mut writer, &mut reader, &mut rcv, 1024);
        assert_eq!(completed.len(), 1);
        assert!(matches!(completed[0].2, Some(Error::MessageCanceled)));
        // the peer never sees a finished message
        assert!(rcv.messages.is_empty());
        assert!(writer.is_drained());
    }

    #[test]
    fn wait_response_parks_the_slot() {
        let mut writer = MessageWriter::new(16, 4);
        let mut reader = MessageReader::new(true);
        let mut rcv = TestReceiver::default();
        let proto = BytesProtocol;

        writer
            .push_message(
                bundle(vec![5; 32], "", MessageFlags::WAIT_RESPONSE),
                MessageId::new(3, 3),
                &proto,
            )
            .unwrap();

        let completed = pump(&mut writer, &mut reader, &mut rcv, 1024);
        assert!(completed.is_empty());
        assert!(writer.is_waiting_response(1));

        let (bundle, pool_id) = writer.take_response(1).unwrap();
        assert_eq!(pool_id, MessageId::new(3, 3));
        assert!(bundle.message.is_some());
        assert!(writer.is_drained());
    }

    #[test]
    fn cancel_requests_piggyback() {
        let mut writer = MessageWriter::new(16, 4);
        let mut reader = MessageReader::new(true);
        let mut rcv = TestReceiver::default();
        let proto = BytesProtocol;

        writer.push_cancel_request(42);
        writer.push_cancel_request(43);

        let mut buf = vec![0u8; 256];
        let outcome = writer
            .write_to(
                &mut buf,
                WriteOptions {
                    keepalive: false,
                    ack_count: 0,
                    data_allowed: false,
                },
            )
            .unwrap();
        assert!(outcome.len > 0);

        reader.read(&buf[..outcome.len], &proto, &mut rcv).unwrap();
        assert_eq!(rcv.cancel_requests, vec![42, 43]);
    }

    #[test]
    fn keepalive_only_when_idle() {
        let mut writer = MessageWriter::new(16, 4);
        let mut reader = MessageReader::new(true);
        let mut rcv = TestReceiver::default();
        let proto = BytesProtocol;

        // a bare probe counts as a keepalive
        let mut buf = vec![0u8; 256];
        let outcome = writer
            .write_to(
                &mut buf,
                WriteOptions {
                    keepalive: true,
                    ack_count: 0,
                    data_allowed: true,
                },
            )
            .unwrap();
        assert!(outcome.keepalive_sent);
        reader.read(&buf[..outcome.len], &proto, &mut rcv).unwrap();
        assert_eq!(rcv.keepalives, 1);

        // an ack-carrying packet is flow bookkeeping, not a probe
        let outcome = writer
            .write_to(
                &mut buf,
                WriteOptions {
                    keepalive: false,
                    ack_count: 2,
                    data_allowed: true,
                },
            )
            .unwrap();
        assert!(outcome.ack_consumed);
        reader.read(&buf[..outcome.len], &proto, &mut rcv).unwrap();
        assert_eq!(rcv.keepalives, 1);
        assert_eq!(rcv.acks, 2);
    }

    #[test]
    fn credits_reject_over_ack() {
        let mut writer = MessageWriter::new(16, 4);
        writer.consume_credit();
        writer.consume_credit();
        assert!(writer.add_credits(1).is_ok());
        assert!(writer.add_credits(1).is_ok());
        assert!(matches!(
            writer.add_credits(1),
            Err(Error::ConnectionAckCount)
        ));
    }

    #[test]
    fn no_credit_blocks_data_not_bookkeeping() {
        let mut writer = MessageWriter::new(16, 1);
        let proto = BytesProtocol;
        writer.consume_credit();
        assert!(!writer.can_accept());

        writer
            .push_message(
                bundle(vec![1; 16], "", MessageFlags::empty()),
                MessageId::new(0, 0),
                &proto,
            )
            .unwrap();

        // data held back: only a keepalive goes out
        let mut buf = vec![0u8; 256];
        let outcome = writer
            .write_to(
                &mut buf,
                WriteOptions {
                    keepalive: true,
                    ack_count: 0,
                    data_allowed: writer.has_credit(),
                },
            )
            .unwrap();
        assert!(outcome.keepalive_sent);
        assert!(outcome.completed.is_empty());
    }
}
