use std::ops::Range;

use indexmap::IndexMap;
use log::trace;

use crate::error::{Error, Result};

use super::message::{MessageFlags, MessageHeader, MessagePtr};
use super::protocol::{Deserializer, Protocol};
use super::relay::{RelayAccept, RelayMessageId};
use super::wire::{
    decode_message_header, PacketHeader, PacketType, RecordFlags, RecordHeader,
    PACKET_HEADER_SIZE, RECORD_HEADER_SIZE,
};

/// Answer to "does this response header still have a taker here?".
pub enum ResponseState {
    /// Deserialize and deliver locally.
    Accept,
    /// Forward to the relayed requester behind this engine id.
    Relay(RelayMessageId),
    /// The request was canceled; collect and discard the body.
    Cancel,
    /// Nothing matches: protocol violation.
    Invalid,
}

/// Callback surface the reader decodes into. Implemented by the
/// connection; relay ranges index into the `input` slice handed to
/// [`MessageReader::read`].
pub trait Receiver {
    fn receive_message(&mut self, header: MessageHeader, message: MessagePtr, type_id: u64);

    fn receive_keepalive(&mut self);

    /// One data packet carrying body records finished processing.
    /// `held_by_relay` marks packets whose bytes relays still pin;
    /// their flow-control ack is deferred until the buffers return.
    fn receive_data_packet(&mut self, held_by_relay: bool) {
        let _ = held_by_relay;
    }

    fn receive_ack_count(&mut self, count: u8);

    fn receive_cancel_request(&mut self, request_id: u32);

    /// A response the peer started is not coming after all.
    fn receive_response_canceled(&mut self, request_id: u32);

    fn check_response_state(&mut self, header: &MessageHeader) -> ResponseState;

    /// Whether this message should be forwarded instead of decoded.
    fn should_relay(&mut self, header: &MessageHeader) -> bool;

    /// Offers the first slice of a relayed message. `Ok(None)` is
    /// back-pressure: the reader stops before this packet and the
    /// connection retries later.
    fn receive_relay_start(
        &mut self,
        header: &MessageHeader,
        relay_hops: u8,
        data: Range<usize>,
        is_last: bool,
    ) -> Result<Option<RelayMessageId>>;

    fn receive_relay_body(
        &mut self,
        id: RelayMessageId,
        data: Range<usize>,
        is_last: bool,
    ) -> Result<RelayAccept>;

    fn receive_relay_response(
        &mut self,
        header: &MessageHeader,
        relay_hops: u8,
        id: RelayMessageId,
        data: Range<usize>,
        is_last: bool,
    ) -> Result<RelayAccept>;

    /// The sender canceled a message mid-relay.
    fn receive_relay_cancel(&mut self, id: RelayMessageId);
}

enum RecvKind {
    Deserialize(Box<dyn Deserializer>),
    Relay(RelayMessageId),
    Discard,
}

struct RecvMessage {
    header: MessageHeader,
    kind: RecvKind,
}

/// Progress within the packet at the current consume position, kept
/// across a back-pressure retry so records and the ack byte are not
/// replayed.
#[derive(Default, Clone, Copy)]
struct PacketProgress {
    records_done: u16,
    ack_done: bool,
    had_body: bool,
    had_relay: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ReadOutcome {
    pub consumed: usize,
    /// Stopped on relay back-pressure; call again with the same bytes
    /// once the engine drained.
    pub blocked: bool,
}

/// Turns the received byte stream into packets, records and finally
/// decoded messages or relay slices.
///
/// The caller guarantees a whole packet fits its receive buffer, so
/// the reader only ever consumes complete packets; partial state
/// lives per message (indexed by the peer's message index), not per
/// packet.
pub struct MessageReader {
    states: IndexMap<u16, RecvMessage>,
    progress: PacketProgress,
    strict: bool,
}

impl MessageReader {
    pub fn new(strict: bool) -> MessageReader {
        MessageReader {
            states: IndexMap::new(),
            progress: PacketProgress::default(),
            strict,
        }
    }

    /// Drops all partial state; in-flight relayed messages are handed
    /// back so the engine can cancel them.
    pub fn drain_for_stop(&mut self) -> Vec<RelayMessageId> {
        let mut relays = Vec::new();
        for (_, state) in self.states.drain(..) {
            if let RecvKind::Relay(id) = state.kind {
                relays.push(id);
            }
        }
        relays
    }

    pub fn read(
        &mut self,
        input: &[u8],
        proto: &dyn Protocol,
        rcv: &mut dyn Receiver,
    ) -> Result<ReadOutcome> {
        let mut consumed = 0;

        loop {
            let remaining = &input[consumed..];
            if remaining.len() < PACKET_HEADER_SIZE {
                break;
            }
            let hdr = PacketHeader::decode(remaining, self.strict)?;
            let total = PACKET_HEADER_SIZE + hdr.length as usize;
            if remaining.len() < total {
                break;
            }

            if hdr.ack_count > 0 && !self.progress.ack_done {
                rcv.receive_ack_count(hdr.ack_count);
            }
            self.progress.ack_done = true;

            match hdr.ptype {
                PacketType::KeepAlive => {
                    if hdr.length != 0 {
                        return Err(Error::ConnectionInvalidState);
                    }
                    // an ack-carrying packet is bookkeeping, not an
                    // idle probe; only bare keepalives count against
                    // the flood limit
                    if hdr.ack_count == 0 {
                        rcv.receive_keepalive();
                    }
                }
                PacketType::Data => {
                    let payload_base = consumed + PACKET_HEADER_SIZE;
                    let payload = &input[payload_base..payload_base + hdr.length as usize];
                    if !self.process_records(payload, payload_base, proto, rcv)? {
                        // blocked mid-packet; progress survives in
                        // self.progress for the retry
                        return Ok(ReadOutcome {
                            consumed,
                            blocked: true,
                        });
                    }
                    if self.progress.had_body {
                        rcv.receive_data_packet(self.progress.had_relay);
                    }
                }
                // the handshake runs before the reader is engaged
                PacketType::Connecting | PacketType::Accepting => {
                    return Err(Error::ConnectionInvalidState);
                }
            }

            consumed += total;
            self.progress = PacketProgress::default();
        }

        Ok(ReadOutcome {
            consumed,
            blocked: false,
        })
    }

    /// Processes the records of one data packet. Returns false when
    /// relay back-pressure stops the packet short.
    fn process_records(
        &mut self,
        payload: &[u8],
        payload_base: usize,
        proto: &dyn Protocol,
        rcv: &mut dyn Receiver,
    ) -> Result<bool> {
        let mut offset = 0usize;
        let mut index = 0u16;

        while offset < payload.len() {
            let rec = RecordHeader::decode(&payload[offset..])?;
            let body_start = offset + RECORD_HEADER_SIZE;
            let body_end = body_start + rec.length as usize;
            if body_end > payload.len() {
                return Err(Error::ConnectionInvalidState);
            }

            if index < self.progress.records_done {
                // already handled before the back-pressure retry
                if !rec.flags.contains(RecordFlags::CANCEL_REQUEST) {
                    self.progress.had_body = true;
                }
                offset = body_end;
                index += 1;
                continue;
            }

            let body = &payload[body_start..body_start + rec.length as usize];
            let body_range = payload_base + body_start..payload_base + body_end;

            if !self.process_record(rec, body, body_range, proto, rcv)? {
                return Ok(false);
            }

            self.progress.records_done = index + 1;
            offset = body_end;
            index += 1;
        }

        Ok(true)
    }

    fn process_record(
        &mut self,
        rec: RecordHeader,
        body: &[u8],
        body_range: Range<usize>,
        proto: &dyn Protocol,
        rcv: &mut dyn Receiver,
    ) -> Result<bool> {
        if rec.flags.contains(RecordFlags::CANCEL_REQUEST) {
            rcv.receive_cancel_request(rec.recipient_request_id);
            return Ok(true);
        }

        self.progress.had_body = true;

        if rec.flags.contains(RecordFlags::CANCELED) {
            self.cancel_in_progress(rec, rcv);
            return Ok(true);
        }

        let is_last = !rec.flags.contains(RecordFlags::CONTINUED);

        if rec.flags.contains(RecordFlags::NEW_MESSAGE) {
            if self.states.contains_key(&rec.message_index) {
                return Err(Error::ConnectionInvalidState);
            }
            let (header, used) = decode_message_header(body)?;
            let data = &body[used..];
            let data_range = body_range.start + used..body_range.end;

            if rec.flags.contains(RecordFlags::RESPONSE) {
                return self.start_response(rec, header, data, data_range, is_last, proto, rcv);
            }

            if rcv.should_relay(&header) {
                return self.start_relay(rec, header, data_range, is_last, rcv);
            }

            return self.start_local(rec, header, data, is_last, proto, rcv);
        }

        // continuation of a known message
        let slot = match self.states.get_mut(&rec.message_index) {
            Some(slot) => slot,
            None => return Err(Error::ConnectionInvalidState),
        };

        match &mut slot.kind {
            RecvKind::Deserialize(de) => {
                de.read_some(body)?;
                if is_last {
                    let state = self.remove_state(rec.message_index);
                    if let Some(state) = state {
                        if let RecvKind::Deserialize(de) = state.kind {
                            let (ptr, type_id) = de.finish()?;
                            rcv.receive_message(state.header, ptr, type_id);
                        }
                    }
                }
                Ok(true)
            }
            RecvKind::Relay(id) => {
                let id = *id;
                match rcv.receive_relay_body(id, body_range, is_last)? {
                    RelayAccept::Accepted => {
                        self.progress.had_relay = true;
                        if is_last {
                            self.remove_state(rec.message_index);
                        }
                        Ok(true)
                    }
                    RelayAccept::Refused => Ok(false),
                    RelayAccept::Dead => {
                        // peer connection died; discard the rest
                        if is_last {
                            self.remove_state(rec.message_index);
                        } else {
                            slot_to_discard(self.states.get_mut(&rec.message_index));
                        }
                        Ok(true)
                    }
                }
            }
            RecvKind::Discard => {
                if is_last {
                    self.remove_state(rec.message_index);
                }
                Ok(true)
            }
        }
    }

    fn start_response(
        &mut self,
        rec: RecordHeader,
        header: MessageHeader,
        data: &[u8],
        data_range: Range<usize>,
        is_last: bool,
        proto: &dyn Protocol,
        rcv: &mut dyn Receiver,
    ) -> Result<bool> {
        match rcv.check_response_state(&header) {
            ResponseState::Accept => {
                let mut de = proto.deserializer();
                de.read_some(data)?;
                if is_last {
                    let (ptr, type_id) = de.finish()?;
                    rcv.receive_message(header, ptr, type_id);
                } else {
                    self.states.insert(
                        rec.message_index,
                        RecvMessage {
                            header,
                            kind: RecvKind::Deserialize(de),
                        },
                    );
                }
                Ok(true)
            }
            ResponseState::Relay(id) => {
                match rcv.receive_relay_response(&header, rec.relay_hops, id, data_range, is_last)? {
                    RelayAccept::Accepted => {
                        self.progress.had_relay = true;
                        if !is_last {
                            self.states.insert(
                                rec.message_index,
                                RecvMessage {
                                    header,
                                    kind: RecvKind::Relay(id),
                                },
                            );
                        }
                        Ok(true)
                    }
                    RelayAccept::Refused => Ok(false),
                    RelayAccept::Dead => {
                        if !is_last {
                            self.states.insert(
                                rec.message_index,
                                RecvMessage {
                                    header,
                                    kind: RecvKind::Discard,
                                },
                            );
                        }
                        Ok(true)
                    }
                }
            }
            ResponseState::Cancel => {
                trace!("discarding response for canceled request {}", header.recipient_request_id);
                if !is_last {
                    self.states.insert(
                        rec.message_index,
                        RecvMessage {
                            header,
                            kind: RecvKind::Discard,
                        },
                    );
                }
                Ok(true)
            }
            ResponseState::Invalid => Err(Error::ConnectionInvalidResponseState),
        }
    }

    fn start_relay(
        &mut self,
        rec: RecordHeader,
        header: MessageHeader,
        data_range: Range<usize>,
        is_last: bool,
        rcv: &mut dyn Receiver,
    ) -> Result<bool> {
        match rcv.receive_relay_start(&header, rec.relay_hops, data_range, is_last)? {
            Some(id) => {
                self.progress.had_relay = true;
                if !is_last {
                    self.states.insert(
                        rec.message_index,
                        RecvMessage {
                            header,
                            kind: RecvKind::Relay(id),
                        },
                    );
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn start_local(
        &mut self,
        rec: RecordHeader,
        header: MessageHeader,
        data: &[u8],
        is_last: bool,
        proto: &dyn Protocol,
        rcv: &mut dyn Receiver,
    ) -> Result<bool> {
        let mut de = proto.deserializer();
        de.read_some(data)?;
        if is_last {
            let (ptr, type_id) = de.finish()?;
            rcv.receive_message(header, ptr, type_id);
        } else {
            self.states.insert(
                rec.message_index,
                RecvMessage {
                    header,
                    kind: RecvKind::Deserialize(de),
                },
            );
        }
        Ok(true)
    }

    fn cancel_in_progress(&mut self, rec: RecordHeader, rcv: &mut dyn Receiver) {
        match self.remove_state(rec.message_index) {
            Some(state) => match state.kind {
                RecvKind::Relay(id) => rcv.receive_relay_cancel(id),
                RecvKind::Deserialize(_) | RecvKind::Discard => {
                    if state.header.flags.contains(MessageFlags::RESPONSE) {
                        rcv.receive_response_canceled(state.header.recipient_request_id);
                    }
                }
            },
            None => {
                // cancel marker for a message that never opened here
                // (writer-side cancel raced the first record); ignore
            }
        }
    }

    fn remove_state(&mut self, index: u16) -> Option<RecvMessage> {
        self.states.swap_remove(&index)
    }
}

fn slot_to_discard(slot: Option<&mut RecvMessage>) {
    if let Some(slot) = slot {
        slot.kind = RecvKind::Discard;
    }
}
