use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use log::warn;

use crate::actor::{Actor, HandleId};
use crate::error::{Error, Result};
use crate::reactor::{ReactorContext, Ready};
use crate::sys::Socket;

pub type AcceptFn<A> = fn(&mut A, &mut ReactorContext<'_>, Result<(Socket, SocketAddr)>);

/// Backoff applied when accept fails with a transient resource error
/// (EMFILE and friends) instead of spinning on a level-triggered fd.
const ACCEPT_BACKOFF: Duration = Duration::from_secs(10);

/// Accepting TCP socket bound to one actor. One accept request is
/// pending at a time; the continuation re-posts to keep accepting.
pub struct Listener<A> {
    sock: Socket,
    hid: HandleId,
    f: Option<AcceptFn<A>>,
}

impl<A: Actor> Listener<A> {
    /// Binds and starts listening on `addr`.
    pub fn bind(addr: &SocketAddr, backlog: i32) -> io::Result<Listener<A>> {
        let sock = Socket::new_stream(addr)?;
        sock.set_reuseaddr(true)?;
        sock.bind(addr)?;
        sock.listen(backlog)?;
        Ok(Listener {
            sock,
            hid: HandleId::INVALID,
            f: None,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.sock.local_addr()
    }

    pub fn handle(&self) -> HandleId {
        self.hid
    }

    pub fn post_accept(&mut self, ctx: &mut ReactorContext<'_>, f: AcceptFn<A>) -> Result<()> {
        if self.f.is_some() {
            return Err(Error::Already);
        }
        if !self.hid.is_valid() {
            self.hid = ctx
                .register_handle(Some(self.sock.raw()))
                .map_err(Error::listener_system)?;
        }
        self.f = Some(f);
        if let Err(e) = ctx.set_interest(self.hid, Ready::recv()) {
            warn!("listener interest update failed: {}", e);
        }
        Ok(())
    }

    pub fn on_ready(
        actor: &mut A,
        ctx: &mut ReactorContext<'_>,
        proj: fn(&mut A) -> &mut Listener<A>,
        ready: Ready,
    ) {
        if ready.is_clear() {
            proj(actor).f = None;
            return;
        }

        if ready.is_timer() {
            // backoff expired, resume accepting
            let l = proj(actor);
            if l.f.is_some() {
                if let Err(e) = ctx.set_interest(l.hid, Ready::recv()) {
                    warn!("listener interest update failed: {}", e);
                }
            }
            return;
        }

        if !ready.is_recv() && !ready.is_error() && !ready.is_hangup() {
            return;
        }

        let done = {
            let l = proj(actor);
            if l.f.is_none() {
                None
            } else {
                match l.sock.accept() {
                    Ok(pair) => l.f.take().map(|f| (f, Ok(pair))),
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => None,
                    Err(e) if is_transient(&e) => {
                        warn!("accept backing off after: {}", e);
                        if let Err(e) = ctx.set_interest(l.hid, Ready::empty()) {
                            warn!("listener interest update failed: {}", e);
                        }
                        ctx.arm_timer(l.hid, ctx.now() + ACCEPT_BACKOFF);
                        None
                    }
                    Err(e) => l.f.take().map(|f| (f, Err(Error::listener_system(e)))),
                }
            }
        };

        if let Some((f, res)) = done {
            f(actor, ctx, res);
        }
    }

    pub fn deactivate(&mut self, ctx: &mut ReactorContext<'_>) {
        self.f = None;
        if self.hid.is_valid() {
            ctx.deregister_handle(self.hid);
            self.hid = HandleId::INVALID;
        }
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS) | Some(libc::ENOMEM)
    )
}
