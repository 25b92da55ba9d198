use std::net::SocketAddr;
use std::ops::Range;
use std::sync::Arc;

use bitflags::bitflags;
use log::{debug, trace, warn};

use crate::actor::{Actor, ActorId, HandleId};
use crate::buffer::{make_buffer, SharedBuffer};
use crate::error::{Error, Result};
use crate::event::{Event, EventCategory, EVENT_KILL, EVENT_START, GENERIC_EVENTS};
use crate::handle::{Stream, Timer};
use crate::reactor::{ReactorContext, Ready};
use crate::sys::Socket;

use super::config::StartState;
use super::message::{
    MessageBundle, MessageFlags, MessageHeader, MessageId, MessagePtr,
};
use super::reader::{MessageReader, Receiver, ResponseState};
use super::relay::{RelayAccept, RelayChunk, RelayConnId, RelayEngine, RelayMessageId, RelayPoll};
use super::service::ServiceInner;
use super::wire::{PacketHeader, PacketType, PACKET_HEADER_SIZE};
use super::writer::{CancelOutcome, MessageWriter, WriteOptions};

pub static CONNECTION_EVENTS: EventCategory = EventCategory::new("connection");

const EV_RESOLVE: usize = 1;
const EV_NEW_POOL_MESSAGE: usize = 2;
const EV_NEW_CONN_MESSAGE: usize = 3;
const EV_CANCEL_CONN_MESSAGE: usize = 4;
const EV_ENTER_ACTIVE: usize = 5;
const EV_ENTER_PASSIVE: usize = 6;
const EV_START_SECURE: usize = 7;
const EV_SEND_RAW: usize = 8;
const EV_RECV_RAW: usize = 9;
const EV_RELAY_NEW: usize = 10;
const EV_RELAY_DONE: usize = 11;
const EV_RETRY_RECV: usize = 12;
const EV_POST: usize = 13;

pub(crate) fn event_resolve(res: Result<Vec<SocketAddr>>) -> Event {
    Event::with(&CONNECTION_EVENTS, EV_RESOLVE, res)
}

pub(crate) fn event_new_pool_message() -> Event {
    Event::new(&CONNECTION_EVENTS, EV_NEW_POOL_MESSAGE)
}

pub(crate) fn event_new_conn_message(id: MessageId) -> Event {
    Event::with(&CONNECTION_EVENTS, EV_NEW_CONN_MESSAGE, id)
}

pub(crate) fn event_cancel_conn_message(id: MessageId) -> Event {
    Event::with(&CONNECTION_EVENTS, EV_CANCEL_CONN_MESSAGE, id)
}

pub(crate) fn event_enter_active() -> Event {
    Event::new(&CONNECTION_EVENTS, EV_ENTER_ACTIVE)
}

pub(crate) fn event_enter_passive() -> Event {
    Event::new(&CONNECTION_EVENTS, EV_ENTER_PASSIVE)
}

pub(crate) fn event_start_secure() -> Event {
    Event::new(&CONNECTION_EVENTS, EV_START_SECURE)
}

pub(crate) fn event_relay_new() -> Event {
    Event::new(&CONNECTION_EVENTS, EV_RELAY_NEW)
}

pub(crate) fn event_relay_done() -> Event {
    Event::new(&CONNECTION_EVENTS, EV_RELAY_DONE)
}

pub(crate) fn event_retry_recv() -> Event {
    Event::new(&CONNECTION_EVENTS, EV_RETRY_RECV)
}

/// Raw-state send completion.
pub type RawSendFn = Box<dyn FnOnce(&mut ConnectionContext<'_, '_>, Result<()>) + Send>;
/// Raw-state receive completion, handed the received bytes.
pub type RawRecvFn = Box<dyn FnOnce(&mut ConnectionContext<'_, '_>, Result<Vec<u8>>) + Send>;
/// User closure executed on the connection's reactor.
pub type PostFn = Box<dyn FnOnce(&mut ConnectionContext<'_, '_>) + Send>;

/// Sends raw bytes on a connection still in the raw state.
pub fn event_send_raw(data: Vec<u8>, done: RawSendFn) -> Event {
    Event::with(&CONNECTION_EVENTS, EV_SEND_RAW, (data, done))
}

/// Receives raw bytes on a connection still in the raw state.
pub fn event_recv_raw(done: RawRecvFn) -> Event {
    Event::with(&CONNECTION_EVENTS, EV_RECV_RAW, done)
}

/// Runs a closure inline on the connection's reactor thread.
pub fn event_post(f: PostFn) -> Event {
    Event::with(&CONNECTION_EVENTS, EV_POST, f)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Init,
    Resolving,
    Connecting,
    #[cfg_attr(not(feature = "tls"), allow(dead_code))]
    Securing,
    Handshake,
    Raw,
    Passive,
    Active,
    Stopping,
    Stopped,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    struct ConnFlags: u32 {
        /// A keepalive probe should go out with the next write.
        const KEEPALIVE    = 0x0001;
        const HAS_ACTIVITY = 0x0002;
        const SENT         = 0x0004;
        const POLL_POOL    = 0x0008;
        /// Reading paused: no receive buffer available.
        const RECV_STALLED = 0x0010;
        /// Reading paused: relay engine back-pressure.
        const RECV_BLOCKED = 0x0020;
        const CONNECTED    = 0x0040;
        const SECURE       = 0x0080;
        /// The writer refused a polled relay chunk; poll again after
        /// the next send completes.
        const RELAY_RETRY  = 0x0100;
    }
}

const MAX_TRACKED_CANCELS: usize = 64;

/// Message delivered to the application handler.
pub struct ReceivedMessage {
    pub header: MessageHeader,
    pub message: MessagePtr,
    pub type_id: u64,
}

/// Handler invoked on the connection's reactor for every decoded
/// incoming message.
pub type RecvHandler = Arc<dyn Fn(&mut ConnectionContext<'_, '_>, ReceivedMessage) + Send + Sync>;

/// One multiplexed RPC connection: a state machine gluing a stream to
/// the message reader and writer, with keepalive, flow-control and
/// relay plumbing. Owned by a reactor; poked from outside through
/// events.
pub struct Connection {
    service: Arc<ServiceInner>,
    pool_index: usize,
    pool_name: String,
    id: ActorId,
    server: bool,
    state: ConnState,
    flags: ConnFlags,
    sock: Option<Stream<Connection>>,
    timer: Timer<Connection>,
    reader: MessageReader,
    writer: MessageWriter,
    recv_buf: Option<SharedBuffer>,
    recv_off: usize,
    cons_off: usize,
    recv_bufs: Vec<SharedBuffer>,
    recv_buf_count: u16,
    ackd_buf_count: u32,
    pending_relay_acks: u32,
    recv_keepalive_count: u32,
    send_buf: Option<SharedBuffer>,
    relay_id: RelayConnId,
    resolve_addrs: Vec<SocketAddr>,
    peer_base_port: u16,
    /// Requests we canceled; late responses to them are discarded.
    canceled_requests: Vec<u32>,
    /// Requests the peer canceled; our responses to them are dropped.
    canceled_peer_requests: Vec<u32>,
    raw_recv: Option<RawRecvFn>,
    raw_send: Option<RawSendFn>,
    error: Option<Error>,
    #[cfg(feature = "tls")]
    secure: Option<crate::handle::SecureSession>,
    #[cfg(feature = "tls")]
    tls_in: Option<SharedBuffer>,
    #[cfg(feature = "tls")]
    tls_out: Option<SharedBuffer>,
}

impl Connection {
    fn new(
        service: Arc<ServiceInner>,
        pool_index: usize,
        pool_name: String,
        sock: Option<Socket>,
        server: bool,
    ) -> Connection {
        let strict = service.config.strict_decode;
        let writer = MessageWriter::new(
            service.config.writer_message_count,
            service.config.writer_flow_credit,
        );
        Connection {
            service,
            pool_index,
            pool_name,
            id: ActorId::INVALID,
            server,
            state: ConnState::Init,
            flags: ConnFlags::default(),
            sock: sock.map(Stream::new),
            timer: Timer::new(),
            reader: MessageReader::new(strict),
            writer,
            recv_buf: None,
            recv_off: 0,
            cons_off: 0,
            recv_bufs: Vec::new(),
            recv_buf_count: 0,
            ackd_buf_count: 0,
            pending_relay_acks: 0,
            recv_keepalive_count: 0,
            send_buf: None,
            relay_id: RelayConnId::INVALID,
            resolve_addrs: Vec::new(),
            peer_base_port: 0,
            canceled_requests: Vec::new(),
            canceled_peer_requests: Vec::new(),
            raw_recv: None,
            raw_send: None,
            error: None,
            #[cfg(feature = "tls")]
            secure: None,
            #[cfg(feature = "tls")]
            tls_in: None,
            #[cfg(feature = "tls")]
            tls_out: None,
        }
    }

    pub(crate) fn new_client(
        service: Arc<ServiceInner>,
        pool_index: usize,
        pool_name: String,
    ) -> Connection {
        Connection::new(service, pool_index, pool_name, None, false)
    }

    pub(crate) fn new_server(
        service: Arc<ServiceInner>,
        pool_index: usize,
        sock: Socket,
    ) -> Connection {
        Connection::new(service, pool_index, String::new(), Some(sock), true)
    }

    pub fn is_server(&self) -> bool {
        self.server
    }

    pub fn peer_base_port(&self) -> u16 {
        self.peer_base_port
    }

    pub fn relay_conn_id(&self) -> RelayConnId {
        self.relay_id
    }

    fn is_running(&self) -> bool {
        matches!(
            self.state,
            ConnState::Raw | ConnState::Passive | ConnState::Active
        )
    }

    fn sock_proj(c: &mut Connection) -> &mut Stream<Connection> {
        match &mut c.sock {
            Some(sock) => sock,
            None => unreachable!("completion for a connection without a socket"),
        }
    }

    /// Direct message injection, used by `Service::send_to_connection`
    /// through a manager visit; the caller follows up with an event
    /// so the writer gets flushed.
    pub(crate) fn try_push_direct(&mut self, bundle: MessageBundle) -> Result<MessageId> {
        if !self.is_running() {
            return Err(Error::MessageConnection);
        }
        if bundle.flags.contains(MessageFlags::RESPONSE)
            && self
                .canceled_peer_requests
                .contains(&bundle.recipient_request_id)
        {
            return Err(Error::MessageCanceled);
        }
        if !self.writer.can_accept() {
            return Err(Error::MessageConnection);
        }
        self.writer
            .push_message(bundle, MessageId::INVALID, &*self.service.config.protocol)
            .map_err(|(_, e)| e)
    }

    // ===== startup =====

    fn do_start(&mut self, ctx: &mut ReactorContext<'_>) {
        self.id = ctx.actor_id();
        debug!(
            "connection {}: start ({})",
            self.id,
            if self.server { "server" } else { "client" }
        );

        if self.server {
            if let Some(sock) = &self.sock {
                let _ = sock.socket().set_nodelay(true);
            }
            self.arm_timer(ctx);
            if self.service.config.server.start_secure {
                self.start_securing(ctx);
            } else {
                self.state = ConnState::Handshake;
                self.start_recv(ctx);
            }
        } else {
            self.state = ConnState::Resolving;
            let manager = self.service.manager.clone();
            let id = self.id;
            self.service.config.resolver.resolve(
                &self.pool_name,
                self.service.config.default_port,
                Box::new(move |res| {
                    manager.notify(id, event_resolve(res));
                }),
            );
        }
    }

    fn do_resolve(&mut self, ctx: &mut ReactorContext<'_>, res: Result<Vec<SocketAddr>>) {
        if self.state != ConnState::Resolving {
            return;
        }
        match res {
            Ok(addrs) => {
                self.resolve_addrs = addrs;
                self.do_try_connect(ctx);
            }
            Err(e) => self.do_stop(ctx, e),
        }
    }

    fn do_try_connect(&mut self, ctx: &mut ReactorContext<'_>) {
        loop {
            let addr = match self.resolve_addrs.pop() {
                Some(addr) => addr,
                None => {
                    self.do_stop(ctx, Error::Resolve);
                    return;
                }
            };
            if let Some(sock) = &mut self.sock {
                sock.deactivate(ctx);
            }
            let sock = match Socket::new_stream(&addr) {
                Ok(sock) => sock,
                Err(e) => {
                    trace!("connection {}: socket failed: {}", self.id, e);
                    continue;
                }
            };
            self.sock = Some(Stream::new(sock));
            let stream = match &mut self.sock {
                Some(stream) => stream,
                None => return,
            };
            match stream.post_connect(ctx, &addr, Connection::on_connect) {
                Ok(()) => {
                    trace!("connection {}: connecting to {}", self.id, addr);
                    self.state = ConnState::Connecting;
                    return;
                }
                Err(e) => {
                    trace!("connection {}: connect to {} failed: {}", self.id, addr, e);
                    continue;
                }
            }
        }
    }

    fn on_connect(c: &mut Connection, ctx: &mut ReactorContext<'_>, res: Result<()>) {
        match res {
            Ok(()) => {
                if let Some(sock) = &c.sock {
                    let _ = sock.socket().set_nodelay(true);
                }
                c.flags.insert(ConnFlags::CONNECTED);
                c.arm_timer(ctx);
                if c.service.config.client.start_secure {
                    c.start_securing(ctx);
                } else {
                    c.begin_handshake(ctx);
                }
            }
            Err(e) => {
                trace!("connection {}: connect failed: {}", c.id, e);
                // fall through to the next resolved endpoint
                c.do_try_connect(ctx);
            }
        }
    }

    // ===== handshake =====

    /// Base port advertised in the handshake: the local listener's,
    /// when this process has one.
    fn base_port(&self) -> u16 {
        self.service
            .listener_addr
            .lock()
            .unwrap()
            .map(|a| a.port())
            .unwrap_or(0)
    }

    fn begin_handshake(&mut self, ctx: &mut ReactorContext<'_>) {
        self.state = ConnState::Handshake;
        if !self.server {
            let port = self.base_port();
            self.send_handshake_packet(ctx, PacketType::Connecting, u32::from(port));
        }
        self.start_recv(ctx);
    }

    fn send_handshake_packet(&mut self, ctx: &mut ReactorContext<'_>, ptype: PacketType, val: u32) {
        let mut packet = [0u8; PACKET_HEADER_SIZE + 4];
        let mut hdr = PacketHeader::new(ptype);
        hdr.length = 4;
        hdr.encode(&mut packet);
        packet[PACKET_HEADER_SIZE..].copy_from_slice(&val.to_be_bytes());
        if let Err(e) = self.send_transport(ctx, &packet) {
            self.do_stop(ctx, e);
        }
    }

    fn do_handshake_bytes(&mut self, ctx: &mut ReactorContext<'_>) {
        loop {
            let (ptype, val, total) = {
                let buf = match &self.recv_buf {
                    Some(buf) => buf,
                    None => return,
                };
                let input = &buf.bytes()[self.cons_off..self.recv_off];
                if input.len() < PACKET_HEADER_SIZE {
                    return;
                }
                let hdr = match PacketHeader::decode(input, self.service.config.strict_decode) {
                    Ok(hdr) => hdr,
                    Err(e) => {
                        self.do_stop(ctx, e);
                        return;
                    }
                };
                let total = PACKET_HEADER_SIZE + hdr.length as usize;
                if input.len() < total {
                    return;
                }
                if hdr.length < 4 {
                    self.do_stop(ctx, Error::ConnectionInvalidState);
                    return;
                }
                let val = u32::from_be_bytes([
                    input[PACKET_HEADER_SIZE],
                    input[PACKET_HEADER_SIZE + 1],
                    input[PACKET_HEADER_SIZE + 2],
                    input[PACKET_HEADER_SIZE + 3],
                ]);
                (hdr.ptype, val, total)
            };

            match (self.server, ptype) {
                (true, PacketType::Connecting) => {
                    self.cons_off += total;
                    self.peer_base_port = val as u16;
                    trace!("connection {}: peer base port {}", self.id, self.peer_base_port);
                    self.send_handshake_packet(ctx, PacketType::Accepting, val);
                    if self.state != ConnState::Handshake {
                        return; // the send failed and stopped us
                    }
                    self.enter_post_handshake(ctx);
                    return;
                }
                (false, PacketType::Accepting) => {
                    self.cons_off += total;
                    self.peer_base_port = val as u16;
                    self.enter_post_handshake(ctx);
                    return;
                }
                _ => {
                    self.do_stop(ctx, Error::ConnectionInvalidState);
                    return;
                }
            }
        }
    }

    fn enter_post_handshake(&mut self, ctx: &mut ReactorContext<'_>) {
        let side = if self.server {
            self.service.config.server
        } else {
            self.service.config.client
        };

        if let Some(engine) = &self.service.relay {
            self.relay_id = engine.register_connection(self.id);
        }

        debug!(
            "connection {}: handshake complete, entering {:?}",
            self.id, side.start_state
        );

        match side.start_state {
            StartState::Raw => {
                self.state = ConnState::Raw;
            }
            StartState::Passive => {
                self.state = ConnState::Passive;
                // data may already trail the handshake packet
                self.do_process_recv(ctx);
                self.start_recv(ctx);
                self.do_send(ctx);
            }
            StartState::Active => {
                self.state = ConnState::Passive;
                self.do_activate(ctx);
                self.do_process_recv(ctx);
                self.start_recv(ctx);
            }
        }
    }

    fn do_activate(&mut self, ctx: &mut ReactorContext<'_>) {
        if !matches!(self.state, ConnState::Raw | ConnState::Passive) {
            return;
        }
        self.state = ConnState::Active;
        self.flags.insert(ConnFlags::POLL_POOL);
        let has_pending = self.service.connection_activated(self.pool_index, self.id);
        if has_pending {
            self.do_poll_pool(ctx);
        } else {
            self.do_send(ctx);
        }
        self.start_recv(ctx);
    }

    // ===== secure =====

    #[cfg(feature = "tls")]
    fn start_securing(&mut self, ctx: &mut ReactorContext<'_>) {
        use crate::handle::SecureSession;

        let session = if self.server {
            match &self.service.config.tls_server {
                Some(cfg) => SecureSession::server(cfg.clone()),
                None => Err(Error::SecureContext),
            }
        } else {
            match &self.service.config.tls_client {
                Some(cfg) => {
                    SecureSession::client(cfg.clone(), &self.service.config.tls_server_name)
                }
                None => Err(Error::SecureContext),
            }
        };

        match session {
            Ok(session) => {
                self.secure = Some(session);
                self.state = ConnState::Securing;
                self.pump_tls(ctx);
                self.start_recv(ctx);
            }
            Err(e) => self.do_stop(ctx, e),
        }
    }

    #[cfg(not(feature = "tls"))]
    fn start_securing(&mut self, ctx: &mut ReactorContext<'_>) {
        self.do_stop(ctx, Error::SecureContext);
    }

    #[cfg(feature = "tls")]
    fn secure_role_error(&self) -> Error {
        if self.server {
            Error::SecureAccept
        } else {
            Error::SecureConnect
        }
    }

    #[cfg(feature = "tls")]
    fn pump_tls(&mut self, ctx: &mut ReactorContext<'_>) {
        let wants_write = match &self.secure {
            Some(session) => session.wants_write(),
            None => return,
        };
        if !wants_write {
            return;
        }
        let pending = self
            .sock
            .as_ref()
            .map(|s| s.has_pending_send())
            .unwrap_or(true);
        if pending {
            return;
        }

        let cap = self.service.config.send_buffer_capacity();
        let mut out = self
            .tls_out
            .take()
            .unwrap_or_else(|| make_buffer(cap));
        let n = {
            let (session, bytes) = match (&mut self.secure, out.bytes_mut()) {
                (Some(session), Some(bytes)) => (session, bytes),
                _ => {
                    self.tls_out = Some(out);
                    return;
                }
            };
            match session.pull_wire(bytes) {
                Ok(n) => n,
                Err(e) => {
                    self.tls_out = Some(out);
                    self.do_stop(ctx, e);
                    return;
                }
            }
        };

        if n == 0 {
            self.tls_out = Some(out);
            return;
        }
        if let Some(sock) = &mut self.sock {
            if let Err(e) = sock.post_send_all(ctx, out, 0..n, Connection::on_tls_sent) {
                self.do_stop(ctx, e);
            }
        }
    }

    #[cfg(feature = "tls")]
    fn on_tls_sent(c: &mut Connection, ctx: &mut ReactorContext<'_>, buf: SharedBuffer, res: Result<()>) {
        c.tls_out = Some(buf);
        if let Err(e) = res {
            c.do_stop(ctx, e);
            return;
        }
        c.pump_tls(ctx);
        let wants_write = c.secure.as_ref().map(|s| s.wants_write()).unwrap_or(false);
        if !wants_write {
            c.after_send(ctx);
        }
    }

    #[cfg(feature = "tls")]
    fn on_tls_recv(c: &mut Connection, ctx: &mut ReactorContext<'_>, buf: SharedBuffer, res: Result<usize>) {
        c.tls_in = Some(buf);
        let n = match res {
            Ok(0) => {
                c.do_stop(ctx, Error::StreamShutdown);
                return;
            }
            Ok(n) => n,
            Err(e) => {
                c.do_stop(ctx, e);
                return;
            }
        };
        c.flags.insert(ConnFlags::HAS_ACTIVITY);

        let was_handshaking = c
            .secure
            .as_ref()
            .map(|s| s.is_handshaking())
            .unwrap_or(false);

        // feed the wire bytes
        let fed = {
            let (session, tls_in) = match (&mut c.secure, &c.tls_in) {
                (Some(session), Some(tls_in)) => (session, tls_in),
                _ => return,
            };
            session.feed_wire(&tls_in.bytes()[..n])
        };
        if fed.is_err() {
            let e = if was_handshaking {
                c.secure_role_error()
            } else {
                Error::SecureSocket
            };
            c.do_stop(ctx, e);
            return;
        }

        // drain decrypted plaintext into the receive buffer
        loop {
            if !c.ensure_recv_space(ctx) {
                break;
            }
            let n = {
                let (session, buf) = match (&mut c.secure, &mut c.recv_buf) {
                    (Some(session), Some(buf)) => (session, buf),
                    _ => break,
                };
                let off = c.recv_off;
                match buf.bytes_mut() {
                    Some(bytes) => session.read_plain(&mut bytes[off..]),
                    None => break,
                }
            };
            if n == 0 {
                break;
            }
            c.recv_off += n;
            c.route_recv_bytes(ctx);
            if !matches!(
                c.state,
                ConnState::Securing
                    | ConnState::Handshake
                    | ConnState::Raw
                    | ConnState::Passive
                    | ConnState::Active
            ) {
                return;
            }
        }

        let done_handshaking = c
            .secure
            .as_ref()
            .map(|s| !s.is_handshaking())
            .unwrap_or(false);
        if was_handshaking && done_handshaking && c.state == ConnState::Securing {
            c.flags.insert(ConnFlags::SECURE);
            debug!("connection {}: secure transport established", c.id);
            c.begin_handshake(ctx);
        }

        c.pump_tls(ctx);
        c.start_recv(ctx);
    }

    fn is_secure_transport(&self) -> bool {
        #[cfg(feature = "tls")]
        {
            self.secure.is_some()
        }
        #[cfg(not(feature = "tls"))]
        {
            false
        }
    }

    // ===== receive path =====

    fn start_recv(&mut self, ctx: &mut ReactorContext<'_>) {
        if !matches!(
            self.state,
            ConnState::Securing
                | ConnState::Handshake
                | ConnState::Passive
                | ConnState::Active
        ) {
            return;
        }
        if self
            .flags
            .intersects(ConnFlags::RECV_STALLED | ConnFlags::RECV_BLOCKED)
        {
            return;
        }
        let pending = self
            .sock
            .as_ref()
            .map(|s| s.has_pending_recv())
            .unwrap_or(true);
        if pending {
            return;
        }

        if self.is_secure_transport() {
            #[cfg(feature = "tls")]
            {
                let cap = self.service.config.recv_buffer_capacity();
                let buf = self.tls_in.take().unwrap_or_else(|| make_buffer(cap));
                let range = 0..buf.capacity();
                if let Some(sock) = &mut self.sock {
                    if let Err(e) = sock.post_recv_some(ctx, buf, range, Connection::on_tls_recv) {
                        self.do_stop(ctx, e);
                    }
                }
            }
            return;
        }

        if !self.ensure_recv_space(ctx) {
            return;
        }
        let buf = match self.recv_buf.take() {
            Some(buf) => buf,
            None => return,
        };
        let range = self.recv_off..buf.capacity();
        if let Some(sock) = &mut self.sock {
            if let Err(e) = sock.post_recv_some(ctx, buf, range, Connection::on_recv) {
                self.do_stop(ctx, e);
            }
        }
    }

    fn on_recv(c: &mut Connection, ctx: &mut ReactorContext<'_>, buf: SharedBuffer, res: Result<usize>) {
        c.recv_buf = Some(buf);
        match res {
            Ok(0) => c.do_stop(ctx, Error::StreamShutdown),
            Ok(n) => {
                c.recv_off += n;
                c.flags.insert(ConnFlags::HAS_ACTIVITY);
                c.route_recv_bytes(ctx);
                c.start_recv(ctx);
            }
            Err(e) => c.do_stop(ctx, e),
        }
    }

    fn route_recv_bytes(&mut self, ctx: &mut ReactorContext<'_>) {
        match self.state {
            ConnState::Handshake => self.do_handshake_bytes(ctx),
            ConnState::Raw => self.deliver_raw_recv(ctx),
            ConnState::Passive | ConnState::Active => self.do_process_recv(ctx),
            _ => (),
        }
    }

    fn deliver_raw_recv(&mut self, ctx: &mut ReactorContext<'_>) {
        let Some(done) = self.raw_recv.take() else {
            return;
        };
        let data = match &self.recv_buf {
            Some(buf) => buf.bytes()[self.cons_off..self.recv_off].to_vec(),
            None => Vec::new(),
        };
        self.cons_off = 0;
        self.recv_off = 0;
        done(&mut ConnectionContext { conn: self, rctx: ctx }, Ok(data));
    }

    /// Makes sure `recv_buf` is a writable buffer with room at
    /// `recv_off`; false pauses reading (stall) or stops on error.
    fn ensure_recv_space(&mut self, ctx: &mut ReactorContext<'_>) -> bool {
        let cap = self.service.config.recv_buffer_capacity();

        if self.recv_buf.is_none() {
            match self.obtain_recv_buffer(cap) {
                Ok(Some(buf)) => {
                    self.recv_buf = Some(buf);
                    self.cons_off = 0;
                    self.recv_off = 0;
                    return true;
                }
                Ok(None) => return false,
                Err(e) => {
                    self.do_stop(ctx, e);
                    return false;
                }
            }
        }

        let shared = self
            .recv_buf
            .as_ref()
            .map(|b| b.is_shared())
            .unwrap_or(false);

        if shared {
            // relays still pin this buffer; carry the tail into a
            // fresh one and park the old
            let fresh = match self.obtain_recv_buffer(cap) {
                Ok(Some(buf)) => buf,
                Ok(None) => return false,
                Err(e) => {
                    self.do_stop(ctx, e);
                    return false;
                }
            };
            let old = match self.recv_buf.take() {
                Some(old) => old,
                None => return false,
            };
            let mut fresh = fresh;
            let tail_len = self.recv_off - self.cons_off;
            if tail_len > 0 {
                if let Some(bytes) = fresh.bytes_mut() {
                    bytes[..tail_len]
                        .copy_from_slice(&old.bytes()[self.cons_off..self.recv_off]);
                }
            }
            self.recv_bufs.push(old);
            self.recv_buf = Some(fresh);
            self.cons_off = 0;
            self.recv_off = tail_len;
            return true;
        }

        if self.cons_off == self.recv_off {
            self.cons_off = 0;
            self.recv_off = 0;
            return true;
        }

        if self.recv_off == cap {
            if self.cons_off == 0 {
                // a packet larger than the whole buffer
                self.do_stop(ctx, Error::ConnectionInvalidState);
                return false;
            }
            let (cons, recv) = (self.cons_off, self.recv_off);
            if let Some(bytes) = self.recv_buf.as_mut().and_then(|b| b.bytes_mut()) {
                bytes.copy_within(cons..recv, 0);
            }
            self.recv_off = recv - cons;
            self.cons_off = 0;
        }

        true
    }

    fn obtain_recv_buffer(&mut self, cap: usize) -> Result<Option<SharedBuffer>> {
        if let Some(pos) = self.recv_bufs.iter().position(|b| !b.is_shared()) {
            return Ok(Some(self.recv_bufs.swap_remove(pos)));
        }
        let limit = 1 + usize::from(self.service.config.connection_relay_buffer_count);
        if usize::from(self.recv_buf_count) < limit {
            self.recv_buf_count += 1;
            return Ok(Some(make_buffer(cap)));
        }
        if !self.recv_bufs.is_empty() {
            // every buffer is out with relays; resume on RelayDone
            self.flags.insert(ConnFlags::RECV_STALLED);
            return Ok(None);
        }
        Err(Error::ConnectionTooManyRecvBuffers)
    }

    fn do_process_recv(&mut self, ctx: &mut ReactorContext<'_>) {
        let service = self.service.clone();
        let relay = service.relay.clone();

        loop {
            if self.cons_off >= self.recv_off {
                break;
            }

            let (outcome, actions) = {
                let buf = match &self.recv_buf {
                    Some(buf) => buf,
                    None => break,
                };
                let input = &buf.bytes()[self.cons_off..self.recv_off];
                let mut rcv = ConnReceiver {
                    writer: &mut self.writer,
                    relay: relay.as_deref().map(|e| (e, self.relay_id)),
                    buf,
                    base: self.cons_off,
                    server: self.server,
                    relay_enabled: service.config.relay_enabled,
                    canceled_requests: &self.canceled_requests,
                    actions: RecvActions::default(),
                };
                match self.reader.read(input, &*service.config.protocol, &mut rcv) {
                    Ok(outcome) => (outcome, rcv.actions),
                    Err(e) => {
                        self.do_stop(ctx, e);
                        return;
                    }
                }
            };

            self.cons_off += outcome.consumed;
            self.apply_recv_actions(ctx, actions);
            if !self.is_running() {
                return;
            }

            if outcome.blocked {
                self.flags.insert(ConnFlags::RECV_BLOCKED);
                break;
            }
            if outcome.consumed == 0 {
                break;
            }
        }

        if self.ackd_buf_count > 0 || self.writer.has_work() {
            self.do_send(ctx);
        }
    }

    fn apply_recv_actions(&mut self, ctx: &mut ReactorContext<'_>, actions: RecvActions) {
        let had_data = actions.data_packets > 0
            || actions.relay_packets > 0
            || !actions.delivered.is_empty()
            || !actions.responses.is_empty();
        if had_data {
            self.recv_keepalive_count = 0;
        }

        self.ackd_buf_count = self.ackd_buf_count.saturating_add(actions.data_packets);
        self.pending_relay_acks = self.pending_relay_acks.saturating_add(actions.relay_packets);

        if actions.keepalives > 0 && self.server {
            self.recv_keepalive_count += actions.keepalives;
            let limit = self.service.config.inactivity_keepalive_count;
            if limit > 0 && self.recv_keepalive_count > limit {
                self.do_stop(ctx, Error::ConnectionTooManyKeepalive);
                return;
            }
        }

        for request_id in actions.cancel_requests {
            if self.canceled_peer_requests.len() >= MAX_TRACKED_CANCELS {
                self.canceled_peer_requests.remove(0);
            }
            self.canceled_peer_requests.push(request_id);
        }

        for (bundle, pool_id, response) in actions.responses {
            self.complete_bundle(bundle, pool_id, Some(response), None);
        }
        for (bundle, pool_id) in actions.peer_canceled {
            self.complete_bundle(bundle, pool_id, None, Some(Error::MessageCanceledPeer));
        }

        if !actions.delivered.is_empty() {
            match self.service.config.on_message.clone() {
                Some(handler) => {
                    for (header, message, type_id) in actions.delivered {
                        handler(
                            &mut ConnectionContext {
                                conn: self,
                                rctx: ctx,
                            },
                            ReceivedMessage {
                                header,
                                message,
                                type_id,
                            },
                        );
                        if !self.is_running() {
                            break;
                        }
                    }
                }
                None => {
                    trace!(
                        "connection {}: {} messages dropped (no handler)",
                        self.id,
                        actions.delivered.len()
                    );
                }
            }
        }

        if let Some(e) = actions.error {
            self.do_stop(ctx, e);
        }
    }

    // ===== send path =====

    fn do_send(&mut self, ctx: &mut ReactorContext<'_>) {
        if !matches!(self.state, ConnState::Passive | ConnState::Active) {
            return;
        }
        let pending = self
            .sock
            .as_ref()
            .map(|s| s.has_pending_send())
            .unwrap_or(true);
        if pending {
            return;
        }

        if self.flags.contains(ConnFlags::POLL_POOL) && self.writer.can_accept() {
            self.pull_pool_messages();
        }

        let cap = self.service.config.send_buffer_capacity();
        let mut buf = self.send_buf.take().unwrap_or_else(|| make_buffer(cap));

        let mut completed = Vec::new();
        let mut relay_done = Vec::new();
        let mut write_err = None;
        let mut filled = 0usize;
        {
            let bytes = match buf.bytes_mut() {
                Some(bytes) => bytes,
                None => {
                    // a send buffer is never shared
                    self.do_stop(ctx, Error::ConnectionInvalidState);
                    return;
                }
            };
            loop {
                let ack = self.ackd_buf_count.min(u32::from(u8::MAX)) as u8;
                let opts = WriteOptions {
                    keepalive: self.flags.contains(ConnFlags::KEEPALIVE),
                    ack_count: ack,
                    data_allowed: true,
                };
                match self.writer.write_to(&mut bytes[filled..], opts) {
                    Ok(outcome) => {
                        if outcome.len == 0 {
                            break;
                        }
                        filled += outcome.len;
                        if outcome.ack_consumed {
                            self.ackd_buf_count -= u32::from(ack);
                        }
                        if outcome.keepalive_sent {
                            self.flags.remove(ConnFlags::KEEPALIVE);
                        }
                        completed.extend(outcome.completed);
                        relay_done.extend(outcome.relay_done);
                    }
                    Err(e) => {
                        write_err = Some(e);
                        break;
                    }
                }
            }
        }

        for (bundle, pool_id, err) in completed {
            self.complete_bundle(bundle, pool_id, None, err);
        }
        if let Some(engine) = &self.service.relay {
            for (engine_id, chunk_buf, was_last) in relay_done {
                engine.complete(engine_id, chunk_buf, was_last);
            }
        }

        if let Some(e) = write_err {
            self.send_buf = Some(buf);
            self.do_stop(ctx, e);
            return;
        }

        if filled == 0 {
            self.send_buf = Some(buf);
            return;
        }

        if let Err(e) = self.post_transport_send(ctx, buf, filled) {
            self.do_stop(ctx, e);
        }
    }

    /// Routes `filled` bytes of `buf` out, through the TLS session
    /// when one is active.
    fn post_transport_send(
        &mut self,
        ctx: &mut ReactorContext<'_>,
        buf: SharedBuffer,
        filled: usize,
    ) -> Result<()> {
        if self.is_secure_transport() {
            #[cfg(feature = "tls")]
            {
                let session = match &mut self.secure {
                    Some(session) => session,
                    None => return Err(Error::SecureContext),
                };
                session.write_plain(&buf.bytes()[..filled])?;
                self.send_buf = Some(buf);
                self.pump_tls(ctx);
            }
            return Ok(());
        }

        match &mut self.sock {
            Some(sock) => sock.post_send_all(ctx, buf, 0..filled, Connection::on_sent),
            None => Err(Error::StreamShutdown),
        }
    }

    /// Sends a transient chunk (handshake packets, raw data) through
    /// the shared send buffer.
    fn send_transport(&mut self, ctx: &mut ReactorContext<'_>, data: &[u8]) -> Result<()> {
        let cap = self.service.config.send_buffer_capacity();
        if data.len() > cap {
            return Err(Error::ConnectionInvalidState);
        }
        let pending = self
            .sock
            .as_ref()
            .map(|s| s.has_pending_send())
            .unwrap_or(true);
        if pending {
            return Err(Error::Already);
        }
        let mut buf = self.send_buf.take().unwrap_or_else(|| make_buffer(cap));
        match buf.bytes_mut() {
            Some(bytes) => bytes[..data.len()].copy_from_slice(data),
            None => return Err(Error::ConnectionInvalidState),
        }
        self.post_transport_send(ctx, buf, data.len())
    }

    fn on_sent(c: &mut Connection, ctx: &mut ReactorContext<'_>, buf: SharedBuffer, res: Result<()>) {
        c.send_buf = Some(buf);
        if let Some(done) = c.raw_send.take() {
            done(
                &mut ConnectionContext {
                    conn: c,
                    rctx: ctx,
                },
                res.clone(),
            );
        }
        match res {
            Ok(()) => c.after_send(ctx),
            Err(e) => c.do_stop(ctx, e),
        }
    }

    fn after_send(&mut self, ctx: &mut ReactorContext<'_>) {
        self.flags.insert(ConnFlags::SENT);
        if !matches!(self.state, ConnState::Passive | ConnState::Active) {
            return;
        }
        if self.flags.contains(ConnFlags::RELAY_RETRY) {
            self.flags.remove(ConnFlags::RELAY_RETRY);
            self.do_poll_relay(ctx);
        }
        if self.writer.has_work()
            || self.ackd_buf_count > 0
            || self.flags.contains(ConnFlags::KEEPALIVE)
        {
            self.do_send(ctx);
        }
    }

    fn pull_pool_messages(&mut self) {
        let service = self.service.clone();
        while self.writer.can_accept() {
            let Some((bundle, pool_id)) = service.pop_pending(self.pool_index) else {
                break;
            };
            match self
                .writer
                .push_message(bundle, pool_id, &*service.config.protocol)
            {
                Ok(conn_msg) => service.assign_message(pool_id, self.id, conn_msg),
                Err((bundle, e)) => {
                    warn!("connection {}: pool message rejected: {}", self.id, e);
                    self.complete_bundle(bundle, pool_id, None, Some(e));
                }
            }
        }
    }

    fn complete_bundle(
        &mut self,
        mut bundle: MessageBundle,
        pool_id: MessageId,
        response: Option<MessagePtr>,
        error: Option<Error>,
    ) {
        bundle.complete(response, error);
        self.service.message_done(pool_id);
    }

    // ===== relay =====

    fn do_poll_relay(&mut self, ctx: &mut ReactorContext<'_>) {
        let Some(engine) = self.service.relay.clone() else {
            return;
        };
        if !self.relay_id.is_valid() {
            return;
        }

        let mut released: Vec<(RelayMessageId, SharedBuffer, bool)> = Vec::new();
        for item in engine.poll_new(self.relay_id) {
            match item {
                RelayPoll::Chunk(id, header, chunk) => {
                    if let Err((header, chunk)) = self.writer.push_relay_chunk(id, header, chunk)
                    {
                        engine.push_back(id, header, chunk);
                        self.flags.insert(ConnFlags::RELAY_RETRY);
                    }
                }
                RelayPoll::Cancel(id) => {
                    if let Some((buf, last)) = self.writer.cancel_relay(id) {
                        released.push((id, buf, last));
                    }
                }
            }
        }
        for (id, buf, last) in released {
            engine.complete(id, buf, last);
        }
        self.do_send(ctx);
    }

    fn do_relay_done(&mut self, ctx: &mut ReactorContext<'_>) {
        let Some(engine) = &self.service.relay else {
            return;
        };
        let returned = engine.take_done(self.relay_id);
        if returned > 0 {
            // buffers came home: release the deferred packet acks
            self.ackd_buf_count = self
                .ackd_buf_count
                .saturating_add(std::mem::take(&mut self.pending_relay_acks));
        }
        if self.flags.contains(ConnFlags::RECV_STALLED) {
            self.flags.remove(ConnFlags::RECV_STALLED);
            self.start_recv(ctx);
        }
        if self.ackd_buf_count > 0 {
            self.do_send(ctx);
        }
    }

    // ===== timers =====

    fn arm_timer(&mut self, ctx: &mut ReactorContext<'_>) {
        let secs = if self.server {
            self.service.config.inactivity_timeout_seconds
        } else {
            self.service.config.keepalive_timeout_seconds
        };
        if secs == 0 {
            return;
        }
        if let Err(e) = self.timer.wait_for(
            ctx,
            std::time::Duration::from_secs(u64::from(secs)),
            Connection::on_timer,
        ) {
            warn!("connection {}: timer failed: {}", self.id, e);
        }
    }

    fn on_timer(c: &mut Connection, ctx: &mut ReactorContext<'_>, res: Result<()>) {
        if res.is_err() {
            // canceled
            return;
        }
        if c.server {
            if c.flags.contains(ConnFlags::HAS_ACTIVITY) {
                c.flags.remove(ConnFlags::HAS_ACTIVITY);
                // a fresh window also forgives the keepalive budget
                c.recv_keepalive_count = 0;
                c.arm_timer(ctx);
            } else {
                c.do_stop(ctx, Error::ConnectionInactivityTimeout);
            }
        } else {
            c.flags.insert(ConnFlags::KEEPALIVE);
            c.do_send(ctx);
            c.arm_timer(ctx);
        }
    }

    // ===== message events =====

    fn do_cancel_conn_message(&mut self, ctx: &mut ReactorContext<'_>, id: MessageId) {
        match self.writer.cancel(id) {
            CancelOutcome::Unknown => (),
            CancelOutcome::Dropped(bundle, pool_id) => {
                self.complete_bundle(bundle, pool_id, None, Some(Error::MessageCanceled));
            }
            CancelOutcome::Marked => {
                self.do_send(ctx);
            }
            CancelOutcome::CancelRequest(request_id, bundle, pool_id) => {
                if self.canceled_requests.len() >= MAX_TRACKED_CANCELS {
                    self.canceled_requests.remove(0);
                }
                self.canceled_requests.push(request_id);
                self.writer.push_cancel_request(request_id);
                self.complete_bundle(bundle, pool_id, None, Some(Error::MessageCanceled));
                self.do_send(ctx);
            }
        }
    }

    fn do_poll_pool(&mut self, ctx: &mut ReactorContext<'_>) {
        if self.state != ConnState::Active {
            return;
        }
        self.do_send(ctx);
    }

    // ===== raw state =====

    fn do_send_raw(&mut self, ctx: &mut ReactorContext<'_>, data: Vec<u8>, done: RawSendFn) {
        if self.state != ConnState::Raw {
            done(
                &mut ConnectionContext {
                    conn: self,
                    rctx: ctx,
                },
                Err(Error::ConnectionInvalidState),
            );
            return;
        }
        if self.raw_send.is_some() {
            done(
                &mut ConnectionContext {
                    conn: self,
                    rctx: ctx,
                },
                Err(Error::Already),
            );
            return;
        }
        match self.send_transport(ctx, &data) {
            Ok(()) => {
                // fires from the send completion
                self.raw_send = Some(done);
            }
            Err(e) => {
                done(
                    &mut ConnectionContext {
                        conn: self,
                        rctx: ctx,
                    },
                    Err(e),
                );
            }
        }
    }

    fn do_recv_raw(&mut self, ctx: &mut ReactorContext<'_>, done: RawRecvFn) {
        if self.state != ConnState::Raw {
            done(
                &mut ConnectionContext {
                    conn: self,
                    rctx: ctx,
                },
                Err(Error::ConnectionInvalidState),
            );
            return;
        }
        if self.cons_off < self.recv_off {
            // bytes already buffered
            self.raw_recv = Some(done);
            self.deliver_raw_recv(ctx);
            return;
        }
        self.raw_recv = Some(done);
        if self.ensure_recv_space(ctx) {
            if let Some(buf) = self.recv_buf.take() {
                let range = self.recv_off..buf.capacity();
                if let Some(sock) = &mut self.sock {
                    if let Err(e) = sock.post_recv_some(ctx, buf, range, Connection::on_recv) {
                        self.do_stop(ctx, e);
                    }
                }
            }
        }
    }

    // ===== stopping =====

    fn do_stop(&mut self, ctx: &mut ReactorContext<'_>, err: Error) {
        if matches!(self.state, ConnState::Stopping | ConnState::Stopped) {
            return;
        }
        debug!("connection {}: stopping: {}", self.id, err);
        // first failure wins
        if self.error.is_none() {
            self.error = Some(err);
        }
        self.state = ConnState::Stopping;

        // in-flight relayed receives we were the source of
        if let Some(engine) = &self.service.relay {
            for id in self.reader.drain_for_stop() {
                engine.cancel_message(self.relay_id, id);
            }
        } else {
            self.reader.drain_for_stop();
        }

        // tracked messages
        let drain = self.writer.drain_for_stop();
        let service = self.service.clone();
        for (bundle, pool_id, started) in drain.messages {
            let one_shot = bundle.flags.contains(MessageFlags::ONE_SHOT);
            if !started && !one_shot && pool_id.is_valid() {
                if let Some(bundle) =
                    service.reschedule_message(self.pool_index, pool_id, bundle)
                {
                    self.complete_bundle(bundle, pool_id, None, Some(Error::MessageConnection));
                }
            } else {
                self.complete_bundle(bundle, pool_id, None, Some(Error::MessageConnection));
            }
        }
        if let Some(engine) = &self.service.relay {
            for (engine_id, chunk) in drain.relays {
                if let Some((buf, last)) = chunk {
                    engine.complete(engine_id, buf, last);
                }
            }
            if self.relay_id.is_valid() {
                engine.unregister_connection(self.relay_id);
                self.relay_id = RelayConnId::INVALID;
            }
        }

        if let Some(done) = self.raw_recv.take() {
            done(
                &mut ConnectionContext {
                    conn: self,
                    rctx: ctx,
                },
                Err(Error::ConnectionKilled),
            );
        }
        if let Some(done) = self.raw_send.take() {
            done(
                &mut ConnectionContext {
                    conn: self,
                    rctx: ctx,
                },
                Err(Error::ConnectionKilled),
            );
        }

        #[cfg(feature = "tls")]
        {
            // best-effort close_notify before the socket goes away
            if let Some(session) = &mut self.secure {
                session.start_shutdown();
            }
            if self.secure.is_some() {
                self.pump_tls(ctx);
            }
        }

        if let Some(sock) = &mut self.sock {
            let _ = sock.socket().shutdown(std::net::Shutdown::Both);
            sock.deactivate(ctx);
        }
        self.timer.deactivate(ctx);

        self.service
            .connection_stopped(self.pool_index, self.id, self.error.as_ref());

        self.state = ConnState::Stopped;
        ctx.post_stop();
    }
}

impl Actor for Connection {
    fn on_event(&mut self, ctx: &mut ReactorContext<'_>, mut event: Event) {
        if event.is(&GENERIC_EVENTS, EVENT_START) {
            self.do_start(ctx);
            return;
        }
        if event.is(&GENERIC_EVENTS, EVENT_KILL) {
            self.do_stop(ctx, Error::ConnectionKilled);
            return;
        }
        if !std::ptr::eq(event.category(), &CONNECTION_EVENTS) {
            return;
        }

        match event.id() {
            EV_RESOLVE => {
                if let Some(res) = event.take_payload::<Result<Vec<SocketAddr>>>() {
                    self.do_resolve(ctx, res);
                }
            }
            EV_NEW_POOL_MESSAGE => self.do_poll_pool(ctx),
            EV_NEW_CONN_MESSAGE => self.do_send(ctx),
            EV_CANCEL_CONN_MESSAGE => {
                if let Some(id) = event.take_payload::<MessageId>() {
                    self.do_cancel_conn_message(ctx, id);
                }
            }
            EV_ENTER_ACTIVE => self.do_activate(ctx),
            EV_ENTER_PASSIVE => {
                if self.state == ConnState::Raw {
                    self.state = ConnState::Passive;
                    self.start_recv(ctx);
                    self.do_send(ctx);
                }
            }
            EV_START_SECURE => {
                if self.state == ConnState::Raw {
                    self.start_securing(ctx);
                }
            }
            EV_SEND_RAW => {
                if let Some((data, done)) = event.take_payload::<(Vec<u8>, RawSendFn)>() {
                    self.do_send_raw(ctx, data, done);
                }
            }
            EV_RECV_RAW => {
                if let Some(done) = event.take_payload::<RawRecvFn>() {
                    self.do_recv_raw(ctx, done);
                }
            }
            EV_RELAY_NEW => self.do_poll_relay(ctx),
            EV_RELAY_DONE => self.do_relay_done(ctx),
            EV_RETRY_RECV => {
                if self.flags.contains(ConnFlags::RECV_BLOCKED) {
                    self.flags.remove(ConnFlags::RECV_BLOCKED);
                    self.do_process_recv(ctx);
                    self.start_recv(ctx);
                }
            }
            EV_POST => {
                if let Some(f) = event.take_payload::<PostFn>() {
                    f(&mut ConnectionContext {
                        conn: self,
                        rctx: ctx,
                    });
                }
            }
            other => trace!("connection {}: unknown event id {}", self.id, other),
        }
    }

    fn on_completion(&mut self, ctx: &mut ReactorContext<'_>, handle: HandleId, ready: Ready) {
        let sock_handle = self.sock.as_ref().map(|s| s.handle());
        if sock_handle == Some(handle) {
            Stream::on_ready(self, ctx, Connection::sock_proj, ready);
            return;
        }
        if self.timer.handle() == handle {
            Timer::on_ready(self, ctx, |c| &mut c.timer, ready);
        }
    }

    fn on_stopped(&mut self, ctx: &mut ReactorContext<'_>) {
        if !matches!(self.state, ConnState::Stopped) {
            // killed without a stop pass (scheduler teardown)
            self.do_stop(ctx, Error::ConnectionKilled);
        }
    }
}

/// Execution context handed to application callbacks running on a
/// connection's reactor.
pub struct ConnectionContext<'a, 'b> {
    conn: &'a mut Connection,
    rctx: &'a mut ReactorContext<'b>,
}

impl ConnectionContext<'_, '_> {
    pub fn connection_id(&self) -> ActorId {
        self.conn.id
    }

    pub fn pool_name(&self) -> &str {
        &self.conn.pool_name
    }

    pub fn is_server(&self) -> bool {
        self.conn.server
    }

    pub fn peer_base_port(&self) -> u16 {
        self.conn.peer_base_port
    }

    pub fn relay_conn_id(&self) -> RelayConnId {
        self.conn.relay_id
    }

    /// Binds a relay routing name to this connection.
    pub fn register_relay_name(&mut self, name: &str) -> bool {
        match &self.conn.service.relay {
            Some(engine) => engine.register_name(name, self.conn.relay_id),
            None => false,
        }
    }

    /// Queues a response to `request` on this connection.
    pub fn send_response(&mut self, message: MessagePtr, request: &MessageHeader) -> Result<()> {
        let bundle = MessageBundle::response(message, request);
        self.conn.try_push_direct(bundle)?;
        self.conn.do_send(self.rctx);
        Ok(())
    }

    /// Queues an unsolicited message on this connection.
    pub fn send_message(&mut self, message: MessagePtr, flags: MessageFlags) -> Result<MessageId> {
        let bundle = MessageBundle::new(message, "", flags);
        let id = self.conn.try_push_direct(bundle)?;
        self.conn.do_send(self.rctx);
        Ok(id)
    }

    /// Stops the connection with [`Error::ConnectionKilled`].
    pub fn force_close(&mut self) {
        self.conn.do_stop(self.rctx, Error::ConnectionKilled);
    }
}

// ===== reader callback adapter =====

#[derive(Default)]
struct RecvActions {
    delivered: Vec<(MessageHeader, MessagePtr, u64)>,
    responses: Vec<(MessageBundle, MessageId, MessagePtr)>,
    peer_canceled: Vec<(MessageBundle, MessageId)>,
    keepalives: u32,
    data_packets: u32,
    relay_packets: u32,
    cancel_requests: Vec<u32>,
    error: Option<Error>,
}

struct ConnReceiver<'a> {
    writer: &'a mut MessageWriter,
    relay: Option<(&'a RelayEngine, RelayConnId)>,
    buf: &'a SharedBuffer,
    base: usize,
    server: bool,
    relay_enabled: bool,
    canceled_requests: &'a [u32],
    actions: RecvActions,
}

impl ConnReceiver<'_> {
    fn chunk(&self, range: Range<usize>, is_last: bool) -> RelayChunk {
        RelayChunk {
            buf: self.buf.clone(),
            range: self.base + range.start..self.base + range.end,
            is_last,
        }
    }
}

impl Receiver for ConnReceiver<'_> {
    fn receive_message(&mut self, header: MessageHeader, message: MessagePtr, type_id: u64) {
        if header.flags.contains(MessageFlags::RESPONSE) {
            match self.writer.take_response(header.recipient_request_id) {
                Some((bundle, pool_id)) => {
                    self.actions.responses.push((bundle, pool_id, message));
                }
                // raced a local cancel; the body is already decoded,
                // just drop it
                None => trace!(
                    "response for request {} has no taker",
                    header.recipient_request_id
                ),
            }
        } else {
            self.actions.delivered.push((header, message, type_id));
        }
    }

    fn receive_keepalive(&mut self) {
        self.actions.keepalives += 1;
    }

    fn receive_data_packet(&mut self, held_by_relay: bool) {
        if held_by_relay {
            self.actions.relay_packets += 1;
        } else {
            self.actions.data_packets += 1;
        }
    }

    fn receive_ack_count(&mut self, count: u8) {
        if let Err(e) = self.writer.add_credits(count) {
            self.actions.error.get_or_insert(e);
        }
    }

    fn receive_cancel_request(&mut self, request_id: u32) {
        self.actions.cancel_requests.push(request_id);
    }

    fn receive_response_canceled(&mut self, request_id: u32) {
        if let Some((bundle, pool_id)) = self.writer.response_canceled(request_id) {
            self.actions.peer_canceled.push((bundle, pool_id));
        }
    }

    fn check_response_state(&mut self, header: &MessageHeader) -> ResponseState {
        if self.writer.is_waiting_response(header.recipient_request_id) {
            return ResponseState::Accept;
        }
        if self.canceled_requests.contains(&header.recipient_request_id) {
            return ResponseState::Cancel;
        }
        if let Some((engine, conn_id)) = &self.relay {
            if let Some(id) = engine.response_target(*conn_id, header.recipient_request_id) {
                return ResponseState::Relay(id);
            }
        }
        ResponseState::Invalid
    }

    fn should_relay(&mut self, header: &MessageHeader) -> bool {
        self.relay_enabled && self.server && !header.url.is_empty() && self.relay.is_some()
    }

    fn receive_relay_start(
        &mut self,
        header: &MessageHeader,
        relay_hops: u8,
        data: Range<usize>,
        is_last: bool,
    ) -> Result<Option<RelayMessageId>> {
        let (engine, conn_id) = match &self.relay {
            Some(pair) => pair,
            None => return Err(Error::ConnectionInvalidState),
        };
        let chunk = self.chunk(data, is_last);
        engine.relay_start(*conn_id, header.clone(), relay_hops, chunk)
    }

    fn receive_relay_body(
        &mut self,
        id: RelayMessageId,
        data: Range<usize>,
        is_last: bool,
    ) -> Result<RelayAccept> {
        let (engine, conn_id) = match &self.relay {
            Some(pair) => pair,
            None => return Err(Error::ConnectionInvalidState),
        };
        let chunk = self.chunk(data, is_last);
        engine.relay_body(*conn_id, id, chunk)
    }

    fn receive_relay_response(
        &mut self,
        header: &MessageHeader,
        relay_hops: u8,
        id: RelayMessageId,
        data: Range<usize>,
        is_last: bool,
    ) -> Result<RelayAccept> {
        let (engine, conn_id) = match &self.relay {
            Some(pair) => pair,
            None => return Err(Error::ConnectionInvalidState),
        };
        let chunk = self.chunk(data, is_last);
        engine.relay_response(*conn_id, id, header.clone(), relay_hops, chunk)
    }

    fn receive_relay_cancel(&mut self, id: RelayMessageId) {
        if let Some((engine, conn_id)) = &self.relay {
            engine.cancel_message(*conn_id, id);
        }
    }
}
