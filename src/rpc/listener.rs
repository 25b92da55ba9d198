use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, warn};

use crate::actor::{Actor, HandleId};
use crate::error::Result;
use crate::event::{event_start, Event, EVENT_KILL, EVENT_START, GENERIC_EVENTS};
use crate::handle::Listener;
use crate::reactor::{ReactorContext, Ready};
use crate::sys::Socket;

use super::connection::Connection;
use super::service::ServiceInner;

const ACCEPT_BACKLOG: i32 = 128;

/// Accepting actor of an RPC service: every inbound socket becomes a
/// server-side [`Connection`] placed on the scheduler.
pub(crate) struct ListenerActor {
    service: Arc<ServiceInner>,
    listener: Listener<ListenerActor>,
    local_addr: SocketAddr,
    pool_index: usize,
}

impl ListenerActor {
    pub(crate) fn bind(service: Arc<ServiceInner>, addr: &SocketAddr) -> io::Result<ListenerActor> {
        let listener = Listener::bind(addr, ACCEPT_BACKLOG)?;
        let local_addr = listener.local_addr()?;
        let pool_index = service.server_pool_index();
        Ok(ListenerActor {
            service,
            listener,
            local_addr,
            pool_index,
        })
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn accept_next(&mut self, ctx: &mut ReactorContext<'_>) {
        if let Err(e) = self.listener.post_accept(ctx, ListenerActor::on_accept) {
            warn!("listener: accept arm failed: {}", e);
        }
    }

    fn on_accept(
        l: &mut ListenerActor,
        ctx: &mut ReactorContext<'_>,
        res: Result<(Socket, SocketAddr)>,
    ) {
        match res {
            Ok((sock, peer)) => {
                debug!("listener: connection accepted from {}", peer);
                let conn = Connection::new_server(l.service.clone(), l.pool_index, sock);
                match l
                    .service
                    .scheduler
                    .start_actor(conn, l.service.service_index, event_start())
                {
                    Ok(id) => l.service.server_pool_register(l.pool_index, id),
                    Err(e) => warn!("listener: server connection rejected: {}", e),
                }
            }
            Err(e) => warn!("listener: accept failed: {}", e),
        }
        l.accept_next(ctx);
    }
}

impl Actor for ListenerActor {
    fn on_event(&mut self, ctx: &mut ReactorContext<'_>, event: Event) {
        if event.is(&GENERIC_EVENTS, EVENT_START) {
            debug!("listener: accepting on {}", self.local_addr);
            self.accept_next(ctx);
        } else if event.is(&GENERIC_EVENTS, EVENT_KILL) {
            self.listener.deactivate(ctx);
            ctx.post_stop();
        }
    }

    fn on_completion(&mut self, ctx: &mut ReactorContext<'_>, handle: HandleId, ready: Ready) {
        if self.listener.handle() == handle {
            Listener::on_ready(self, ctx, |l| &mut l.listener, ready);
        }
    }
}
