use std::io;
use std::mem;
use std::net::{Shutdown, SocketAddr};
use std::ops::Range;

use log::warn;

use crate::actor::{Actor, HandleId};
use crate::buffer::SharedBuffer;
use crate::error::{Error, Result};
use crate::reactor::{ReactorContext, Ready};
use crate::sys::Socket;

pub type RecvFn<A> = fn(&mut A, &mut ReactorContext<'_>, SharedBuffer, Result<usize>);
pub type SendFn<A> = fn(&mut A, &mut ReactorContext<'_>, SharedBuffer, Result<()>);
pub type ConnectFn<A> = fn(&mut A, &mut ReactorContext<'_>, Result<()>);

enum RecvOp<A> {
    Idle,
    Pending {
        buf: SharedBuffer,
        range: Range<usize>,
        f: RecvFn<A>,
    },
}

enum SendOp<A> {
    Idle,
    Pending {
        buf: SharedBuffer,
        range: Range<usize>,
        sent: usize,
        f: SendFn<A>,
    },
}

/// Asynchronous TCP stream bound to one actor.
///
/// At most one receive and one transmit operation may be pending at a
/// time; overlap fails with [`Error::Already`]. Buffers move into the
/// pending operation and come back through the continuation, so no
/// borrow is held across the suspension. A transmit completion fires
/// only once the whole requested range reached the kernel; partial
/// writes stay invisible to the caller.
pub struct Stream<A> {
    sock: Socket,
    hid: HandleId,
    connect: Option<ConnectFn<A>>,
    recv: RecvOp<A>,
    send: SendOp<A>,
}

impl<A: Actor> Stream<A> {
    pub fn new(sock: Socket) -> Stream<A> {
        Stream {
            sock,
            hid: HandleId::INVALID,
            connect: None,
            recv: RecvOp::Idle,
            send: SendOp::Idle,
        }
    }

    pub fn socket(&self) -> &Socket {
        &self.sock
    }

    pub fn handle(&self) -> HandleId {
        self.hid
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.sock.local_addr()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.sock.peer_addr()
    }

    fn ensure_registered(&mut self, ctx: &mut ReactorContext<'_>) -> Result<()> {
        if !self.hid.is_valid() {
            self.hid = ctx
                .register_handle(Some(self.sock.raw()))
                .map_err(Error::stream_system)?;
        }
        Ok(())
    }

    fn update_interest(&mut self, ctx: &mut ReactorContext<'_>) {
        let mut interest = Ready::empty();
        if matches!(self.recv, RecvOp::Pending { .. }) {
            interest.insert(Ready::recv());
        }
        if matches!(self.send, SendOp::Pending { .. }) || self.connect.is_some() {
            interest.insert(Ready::send());
        }
        if let Err(e) = ctx.set_interest(self.hid, interest) {
            warn!("stream interest update failed: {}", e);
        }
    }

    /// Starts a non-blocking connect; `f` fires once the socket is
    /// writable, with the pending socket error if the attempt failed.
    pub fn post_connect(
        &mut self,
        ctx: &mut ReactorContext<'_>,
        addr: &SocketAddr,
        f: ConnectFn<A>,
    ) -> Result<()> {
        if self.connect.is_some() {
            return Err(Error::Already);
        }
        self.ensure_registered(ctx)?;
        self.sock.connect(addr).map_err(Error::stream_system)?;
        self.connect = Some(f);
        self.update_interest(ctx);
        Ok(())
    }

    /// Schedules a receive of up to `range.len()` bytes into `buf`.
    /// The continuation gets the byte count, `0` meaning orderly peer
    /// shutdown.
    pub fn post_recv_some(
        &mut self,
        ctx: &mut ReactorContext<'_>,
        buf: SharedBuffer,
        range: Range<usize>,
        f: RecvFn<A>,
    ) -> Result<()> {
        if matches!(self.recv, RecvOp::Pending { .. }) {
            return Err(Error::Already);
        }
        if range.is_empty() || range.end > buf.capacity() || buf.is_shared() {
            return Err(Error::Already);
        }
        self.ensure_registered(ctx)?;
        self.recv = RecvOp::Pending { buf, range, f };
        self.update_interest(ctx);
        Ok(())
    }

    /// Schedules a transmit of the whole `range`; the continuation
    /// fires only when every byte is accepted by the kernel.
    pub fn post_send_all(
        &mut self,
        ctx: &mut ReactorContext<'_>,
        buf: SharedBuffer,
        range: Range<usize>,
        f: SendFn<A>,
    ) -> Result<()> {
        if matches!(self.send, SendOp::Pending { .. }) {
            return Err(Error::Already);
        }
        if range.end > buf.capacity() {
            return Err(Error::Already);
        }
        self.ensure_registered(ctx)?;
        self.send = SendOp::Pending {
            buf,
            range,
            sent: 0,
            f,
        };
        self.update_interest(ctx);
        Ok(())
    }

    /// Synchronous-first receive: `Ok(Some((buf, n)))` completed
    /// without the continuation, `Ok(None)` scheduled it.
    pub fn recv_some(
        &mut self,
        ctx: &mut ReactorContext<'_>,
        mut buf: SharedBuffer,
        range: Range<usize>,
        f: RecvFn<A>,
    ) -> Result<Option<(SharedBuffer, usize)>> {
        if matches!(self.recv, RecvOp::Pending { .. }) {
            return Err(Error::Already);
        }
        if range.is_empty() || range.end > buf.capacity() || buf.is_shared() {
            return Err(Error::Already);
        }
        self.ensure_registered(ctx)?;

        let res = match buf.bytes_mut() {
            Some(bytes) => self.sock.recv(&mut bytes[range.clone()]),
            None => return Err(Error::Already),
        };
        match res {
            Ok(n) => Ok(Some((buf, n))),
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                self.recv = RecvOp::Pending { buf, range, f };
                self.update_interest(ctx);
                Ok(None)
            }
            Err(e) => Err(Error::stream_system(e)),
        }
    }

    /// Synchronous-first transmit: `Ok(Some(buf))` wrote the whole
    /// range inline, `Ok(None)` scheduled the rest.
    pub fn send_all(
        &mut self,
        ctx: &mut ReactorContext<'_>,
        buf: SharedBuffer,
        range: Range<usize>,
        f: SendFn<A>,
    ) -> Result<Option<SharedBuffer>> {
        if matches!(self.send, SendOp::Pending { .. }) {
            return Err(Error::Already);
        }
        if range.end > buf.capacity() {
            return Err(Error::Already);
        }
        self.ensure_registered(ctx)?;

        let mut sent = 0usize;
        loop {
            if sent >= range.len() {
                return Ok(Some(buf));
            }
            match self.sock.send(&buf.bytes()[range.start + sent..range.end]) {
                Ok(n) => sent += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.send = SendOp::Pending {
                        buf,
                        range,
                        sent,
                        f,
                    };
                    self.update_interest(ctx);
                    return Ok(None);
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => (),
                Err(e) => return Err(Error::stream_system(e)),
            }
        }
    }

    pub fn has_pending_send(&self) -> bool {
        matches!(self.send, SendOp::Pending { .. })
    }

    pub fn has_pending_recv(&self) -> bool {
        matches!(self.recv, RecvOp::Pending { .. })
    }

    /// Readiness entry point; the actor routes its completion events
    /// here with a projection back to this stream field.
    pub fn on_ready(
        actor: &mut A,
        ctx: &mut ReactorContext<'_>,
        proj: fn(&mut A) -> &mut Stream<A>,
        ready: Ready,
    ) {
        if ready.is_error() {
            let err = {
                let s = proj(actor);
                match s.sock.take_error() {
                    Ok(Some(e)) => Error::stream_socket(e),
                    Ok(None) => Error::StreamShutdown,
                    Err(e) => Error::stream_system(e),
                }
            };
            Stream::fail_ops(actor, ctx, proj, err);
            return;
        }

        if ready.is_clear() {
            proj(actor).clear_ops();
            return;
        }

        if ready.is_send() || ready.is_hangup() {
            Stream::complete_connect(actor, ctx, proj, ready);
        }

        if ready.is_recv() || ready.is_hangup() {
            Stream::progress_recv(actor, ctx, proj);
        }

        if ready.is_send() || ready.is_hangup() {
            Stream::progress_send(actor, ctx, proj);
        }
    }

    fn complete_connect(
        actor: &mut A,
        ctx: &mut ReactorContext<'_>,
        proj: fn(&mut A) -> &mut Stream<A>,
        ready: Ready,
    ) {
        let done = {
            let s = proj(actor);
            match s.connect.take() {
                Some(f) => {
                    let res = match s.sock.take_error() {
                        Ok(Some(e)) => Err(Error::stream_socket(e)),
                        Ok(None) if ready.is_hangup() && !ready.is_send() => {
                            Err(Error::StreamShutdown)
                        }
                        Ok(None) => Ok(()),
                        Err(e) => Err(Error::stream_system(e)),
                    };
                    s.update_interest(ctx);
                    Some((f, res))
                }
                None => None,
            }
        };
        if let Some((f, res)) = done {
            f(actor, ctx, res);
        }
    }

    fn progress_recv(
        actor: &mut A,
        ctx: &mut ReactorContext<'_>,
        proj: fn(&mut A) -> &mut Stream<A>,
    ) {
        let done = {
            let s = proj(actor);
            match mem::replace(&mut s.recv, RecvOp::Idle) {
                RecvOp::Idle => None,
                RecvOp::Pending { mut buf, range, f } => {
                    let res = match buf.bytes_mut() {
                        Some(bytes) => s.sock.recv(&mut bytes[range.clone()]),
                        None => Err(io::Error::new(
                            io::ErrorKind::Other,
                            "receive buffer is shared",
                        )),
                    };
                    match res {
                        Ok(n) => Some((buf, Ok(n), f)),
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                            s.recv = RecvOp::Pending { buf, range, f };
                            None
                        }
                        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                            s.recv = RecvOp::Pending { buf, range, f };
                            None
                        }
                        Err(e) => Some((buf, Err(Error::stream_system(e)), f)),
                    }
                }
            }
        };
        {
            let s = proj(actor);
            s.update_interest(ctx);
        }
        if let Some((buf, res, f)) = done {
            f(actor, ctx, buf, res);
        }
    }

    fn progress_send(
        actor: &mut A,
        ctx: &mut ReactorContext<'_>,
        proj: fn(&mut A) -> &mut Stream<A>,
    ) {
        let done = {
            let s = proj(actor);
            match mem::replace(&mut s.send, SendOp::Idle) {
                SendOp::Idle => None,
                SendOp::Pending {
                    buf,
                    range,
                    mut sent,
                    f,
                } => loop {
                    if sent >= range.len() {
                        break Some((buf, Ok(()), f));
                    }
                    match s.sock.send(&buf.bytes()[range.start + sent..range.end]) {
                        Ok(n) => sent += n,
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                            s.send = SendOp::Pending {
                                buf,
                                range,
                                sent,
                                f,
                            };
                            break None;
                        }
                        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => (),
                        Err(e) => break Some((buf, Err(Error::stream_system(e)), f)),
                    }
                },
            }
        };
        {
            let s = proj(actor);
            s.update_interest(ctx);
        }
        if let Some((buf, res, f)) = done {
            f(actor, ctx, buf, res);
        }
    }

    /// Completes every pending operation with `err`.
    pub fn fail_ops(
        actor: &mut A,
        ctx: &mut ReactorContext<'_>,
        proj: fn(&mut A) -> &mut Stream<A>,
        err: Error,
    ) {
        let (conn, recv, send) = {
            let s = proj(actor);
            let conn = s.connect.take();
            let recv = match mem::replace(&mut s.recv, RecvOp::Idle) {
                RecvOp::Pending { buf, f, .. } => Some((buf, f)),
                RecvOp::Idle => None,
            };
            let send = match mem::replace(&mut s.send, SendOp::Idle) {
                SendOp::Pending { buf, f, .. } => Some((buf, f)),
                SendOp::Idle => None,
            };
            s.update_interest(ctx);
            (conn, recv, send)
        };
        if let Some(f) = conn {
            f(actor, ctx, Err(err.clone()));
        }
        if let Some((buf, f)) = recv {
            f(actor, ctx, buf, Err(err.clone()));
        }
        if let Some((buf, f)) = send {
            f(actor, ctx, buf, Err(err));
        }
    }

    /// Shuts the socket down and wakes both pending continuations
    /// with [`Error::StreamShutdown`].
    pub fn shutdown(actor: &mut A, ctx: &mut ReactorContext<'_>, proj: fn(&mut A) -> &mut Stream<A>) {
        {
            let s = proj(actor);
            let _ = s.sock.shutdown(Shutdown::Both);
        }
        Stream::fail_ops(actor, ctx, proj, Error::StreamShutdown);
    }

    fn clear_ops(&mut self) {
        self.connect = None;
        self.recv = RecvOp::Idle;
        self.send = SendOp::Idle;
    }

    /// Silently drops pending continuations and releases the poller
    /// registration.
    pub fn deactivate(&mut self, ctx: &mut ReactorContext<'_>) {
        self.clear_ops();
        if self.hid.is_valid() {
            ctx.deregister_handle(self.hid);
            self.hid = HandleId::INVALID;
        }
    }
}
