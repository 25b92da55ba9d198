use std::io;
use std::mem;
use std::net::SocketAddr;
use std::ops::Range;

use log::warn;

use crate::actor::{Actor, HandleId};
use crate::buffer::SharedBuffer;
use crate::error::{Error, Result};
use crate::reactor::{ReactorContext, Ready};
use crate::sys::Socket;

pub type RecvFromFn<A> = fn(&mut A, &mut ReactorContext<'_>, SharedBuffer, Result<(usize, SocketAddr)>);
pub type SendToFn<A> = fn(&mut A, &mut ReactorContext<'_>, SharedBuffer, Result<()>);

enum RecvOp<A> {
    Idle,
    Pending {
        buf: SharedBuffer,
        range: Range<usize>,
        f: RecvFromFn<A>,
    },
}

enum SendOp<A> {
    Idle,
    Pending {
        buf: SharedBuffer,
        range: Range<usize>,
        addr: SocketAddr,
        f: SendToFn<A>,
    },
}

/// UDP socket bound to one actor. Datagrams are delivered whole; a
/// zero length read signals datagram shutdown to the caller.
pub struct Datagram<A> {
    sock: Socket,
    hid: HandleId,
    recv: RecvOp<A>,
    send: SendOp<A>,
}

impl<A: Actor> Datagram<A> {
    pub fn bind(addr: &SocketAddr) -> io::Result<Datagram<A>> {
        let sock = Socket::new_datagram(addr)?;
        sock.bind(addr)?;
        Ok(Datagram {
            sock,
            hid: HandleId::INVALID,
            recv: RecvOp::Idle,
            send: SendOp::Idle,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.sock.local_addr()
    }

    pub fn handle(&self) -> HandleId {
        self.hid
    }

    fn ensure_registered(&mut self, ctx: &mut ReactorContext<'_>) -> Result<()> {
        if !self.hid.is_valid() {
            self.hid = ctx
                .register_handle(Some(self.sock.raw()))
                .map_err(Error::datagram_system)?;
        }
        Ok(())
    }

    fn update_interest(&mut self, ctx: &mut ReactorContext<'_>) {
        let mut interest = Ready::empty();
        if matches!(self.recv, RecvOp::Pending { .. }) {
            interest.insert(Ready::recv());
        }
        if matches!(self.send, SendOp::Pending { .. }) {
            interest.insert(Ready::send());
        }
        if let Err(e) = ctx.set_interest(self.hid, interest) {
            warn!("datagram interest update failed: {}", e);
        }
    }

    pub fn post_recv_from(
        &mut self,
        ctx: &mut ReactorContext<'_>,
        buf: SharedBuffer,
        range: Range<usize>,
        f: RecvFromFn<A>,
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

    pub fn post_send_to(
        &mut self,
        ctx: &mut ReactorContext<'_>,
        buf: SharedBuffer,
        range: Range<usize>,
        addr: SocketAddr,
        f: SendToFn<A>,
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
            addr,
            f,
        };
        self.update_interest(ctx);
        Ok(())
    }

    pub fn on_ready(
        actor: &mut A,
        ctx: &mut ReactorContext<'_>,
        proj: fn(&mut A) -> &mut Datagram<A>,
        ready: Ready,
    ) {
        if ready.is_clear() {
            let d = proj(actor);
            d.recv = RecvOp::Idle;
            d.send = SendOp::Idle;
            return;
        }

        if ready.is_error() {
            let err = {
                let d = proj(actor);
                match d.sock.take_error() {
                    Ok(Some(e)) => Error::datagram_system(e),
                    _ => Error::DatagramShutdown,
                }
            };
            Datagram::fail_ops(actor, ctx, proj, err);
            return;
        }

        if ready.is_recv() || ready.is_hangup() {
            let done = {
                let d = proj(actor);
                match mem::replace(&mut d.recv, RecvOp::Idle) {
                    RecvOp::Idle => None,
                    RecvOp::Pending { mut buf, range, f } => {
                        let res = match buf.bytes_mut() {
                            Some(bytes) => d.sock.recv_from(&mut bytes[range.clone()]),
                            None => Err(io::Error::new(
                                io::ErrorKind::Other,
                                "receive buffer is shared",
                            )),
                        };
                        match res {
                            Ok((n, from)) => Some((buf, Ok((n, from)), f)),
                            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                                d.recv = RecvOp::Pending { buf, range, f };
                                None
                            }
                            Err(e) => Some((buf, Err(Error::datagram_system(e)), f)),
                        }
                    }
                }
            };
            {
                let d = proj(actor);
                d.update_interest(ctx);
            }
            if let Some((buf, res, f)) = done {
                f(actor, ctx, buf, res);
            }
        }

        if ready.is_send() || ready.is_hangup() {
            let done = {
                let d = proj(actor);
                match mem::replace(&mut d.send, SendOp::Idle) {
                    SendOp::Idle => None,
                    SendOp::Pending {
                        buf,
                        range,
                        addr,
                        f,
                    } => match d.sock.send_to(&buf.bytes()[range.clone()], &addr) {
                        Ok(_) => Some((buf, Ok(()), f)),
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                            d.send = SendOp::Pending {
                                buf,
                                range,
                                addr,
                                f,
                            };
                            None
                        }
                        Err(e) => Some((buf, Err(Error::datagram_system(e)), f)),
                    },
                }
            };
            {
                let d = proj(actor);
                d.update_interest(ctx);
            }
            if let Some((buf, res, f)) = done {
                f(actor, ctx, buf, res);
            }
        }
    }

    pub fn fail_ops(
        actor: &mut A,
        ctx: &mut ReactorContext<'_>,
        proj: fn(&mut A) -> &mut Datagram<A>,
        err: Error,
    ) {
        let (recv, send) = {
            let d = proj(actor);
            let recv = match mem::replace(&mut d.recv, RecvOp::Idle) {
                RecvOp::Pending { buf, f, .. } => Some((buf, f)),
                RecvOp::Idle => None,
            };
            let send = match mem::replace(&mut d.send, SendOp::Idle) {
                SendOp::Pending { buf, f, .. } => Some((buf, f)),
                SendOp::Idle => None,
            };
            d.update_interest(ctx);
            (recv, send)
        };
        if let Some((buf, f)) = recv {
            f(actor, ctx, buf, Err(err.clone()));
        }
        if let Some((buf, f)) = send {
            f(actor, ctx, buf, Err(err));
        }
    }

    pub fn deactivate(&mut self, ctx: &mut ReactorContext<'_>) {
        self.recv = RecvOp::Idle;
        self.send = SendOp::Idle;
        if self.hid.is_valid() {
            ctx.deregister_handle(self.hid);
            self.hid = HandleId::INVALID;
        }
    }
}
