use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;
use log::{debug, trace, warn};
use slab::Slab;

use crate::actor::ActorId;
use crate::error::{Error, Result};
use crate::event::event_start;
use crate::manager::Manager;
use crate::scheduler::Scheduler;

use super::config::Configuration;
use super::connection::{
    event_cancel_conn_message, event_enter_active, event_enter_passive, event_new_conn_message,
    event_new_pool_message, event_start_secure, Connection,
};
use super::listener::ListenerActor;
use super::message::{CompleteFn, MessageBundle, MessageFlags, MessageId, MessagePtr};
use super::relay::RelayEngine;

struct PoolMsg {
    unique: u32,
    pool_index: usize,
    /// Present while unassigned; a connection takes it over.
    bundle: Option<MessageBundle>,
    assigned: Option<(ActorId, MessageId)>,
}

struct ConnectionPool {
    name: String,
    pending: VecDeque<usize>,
    connections: Vec<ActorId>,
    /// Connections promoted to active, lowest id first.
    active: Vec<ActorId>,
    server_side: bool,
}

#[derive(Default)]
struct PoolTable {
    pools: Slab<ConnectionPool>,
    by_name: IndexMap<String, usize>,
    msgs: Slab<PoolMsg>,
    msg_unique: u32,
}

pub(crate) struct ServiceInner {
    pub(crate) config: Configuration,
    pub(crate) manager: Manager,
    pub(crate) scheduler: Scheduler,
    pub(crate) service_index: usize,
    pub(crate) relay: Option<Arc<RelayEngine>>,
    pub(crate) listener_addr: Mutex<Option<SocketAddr>>,
    pools: Mutex<PoolTable>,
    stopping: Mutex<bool>,
}

/// Pool of connections per peer name plus the user-facing send and
/// cancel surface.
#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

impl Service {
    /// Validates the configuration, registers with the manager, and
    /// (when a listener address is configured) binds and starts the
    /// accepting actor.
    pub fn start(config: Configuration, scheduler: &Scheduler) -> Result<Service> {
        config.validate()?;

        let manager = scheduler.manager().clone();
        let service_index = manager.register_service();
        let relay = if config.relay_enabled {
            Some(Arc::new(RelayEngine::new(manager.clone())))
        } else {
            None
        };

        let inner = Arc::new(ServiceInner {
            config,
            manager,
            scheduler: scheduler.clone(),
            service_index,
            relay,
            listener_addr: Mutex::new(None),
            pools: Mutex::new(PoolTable::default()),
            stopping: Mutex::new(false),
        });

        if let Some(addr) = inner.config.listener_address {
            let listener = ListenerActor::bind(inner.clone(), &addr)
                .map_err(Error::listener_system)?;
            *inner.listener_addr.lock().unwrap() = Some(listener.local_addr());
            scheduler.start_actor(listener, service_index, event_start())?;
        }

        debug!("rpc service {} started", service_index);
        Ok(Service { inner })
    }

    /// Address the listener actually bound (useful with port zero).
    pub fn listener_addr(&self) -> Option<SocketAddr> {
        *self.inner.listener_addr.lock().unwrap()
    }

    pub fn relay_engine(&self) -> Option<&Arc<RelayEngine>> {
        self.inner.relay.as_ref()
    }

    /// Sends a message towards `peer`, creating the pool and its
    /// first connection on demand.
    pub fn send(&self, peer: &str, message: MessagePtr, flags: MessageFlags) -> Result<MessageId> {
        self.send_bundle(peer, MessageBundle::new(message, "", flags))
    }

    /// Like [`Service::send`] with a completion callback; the
    /// callback fires exactly once.
    pub fn send_request(
        &self,
        peer: &str,
        message: MessagePtr,
        flags: MessageFlags,
        complete: CompleteFn,
    ) -> Result<MessageId> {
        self.send_bundle(
            peer,
            MessageBundle::new(message, "", flags).with_completion(complete),
        )
    }

    /// Full-control send: destination url (routes through the relay
    /// engine on a relaying peer), flags and an optional completion.
    pub fn send_message(
        &self,
        peer: &str,
        url: &str,
        message: MessagePtr,
        flags: MessageFlags,
        complete: Option<CompleteFn>,
    ) -> Result<MessageId> {
        let mut bundle = MessageBundle::new(message, url, flags);
        bundle.complete = complete;
        self.send_bundle(peer, bundle)
    }

    fn send_bundle(&self, peer: &str, bundle: MessageBundle) -> Result<MessageId> {
        if *self.inner.stopping.lock().unwrap() {
            return Err(Error::MessageConnection);
        }

        let (id, conn) = {
            let mut pools = self.inner.pools.lock().unwrap();
            let pool_index = self.inner.pool_index_for(&mut pools, peer);

            pools.msg_unique = pools.msg_unique.wrapping_add(1);
            let unique = pools.msg_unique;
            let slot = pools.msgs.insert(PoolMsg {
                unique,
                pool_index,
                bundle: Some(bundle),
                assigned: None,
            });
            pools.pools[pool_index].pending.push_back(slot);

            let conn = match self.inner.pick_or_spawn(&mut pools, pool_index) {
                Ok(conn) => conn,
                Err(e) => {
                    pools.pools[pool_index].pending.retain(|&s| s != slot);
                    pools.msgs.remove(slot);
                    return Err(e);
                }
            };
            (MessageId::new(slot as u32, unique), conn)
        };

        if let Some(conn) = conn {
            self.inner.manager.notify(conn, event_new_pool_message());
        }
        Ok(id)
    }

    /// Pushes a message straight into one connection, bypassing the
    /// pool queue. Runs inline against the connection's slot table.
    pub fn send_to_connection(
        &self,
        conn: ActorId,
        message: MessagePtr,
        flags: MessageFlags,
    ) -> Result<MessageId> {
        let bundle = MessageBundle::new(message, "", flags);
        let pushed = self
            .inner
            .manager
            .visit::<Connection, _>(conn, |c| c.try_push_direct(bundle))
            .ok_or(Error::MessageConnection)??;
        self.inner.manager.notify(conn, event_new_conn_message(pushed));
        Ok(pushed)
    }

    /// Cancels a tracked message. Unassigned messages complete right
    /// here with [`Error::MessageCanceled`]; assigned ones resolve on
    /// their connection.
    pub fn cancel(&self, id: MessageId) -> bool {
        let action = {
            let mut pools = self.inner.pools.lock().unwrap();
            let slot = id.index as usize;
            match pools.msgs.get_mut(slot) {
                Some(msg) if msg.unique == id.unique => {
                    if msg.bundle.is_some() {
                        let bundle = msg.bundle.take();
                        let pool_index = msg.pool_index;
                        pools.msgs.remove(slot);
                        if let Some(pool) = pools.pools.get_mut(pool_index) {
                            pool.pending.retain(|&s| s != slot);
                        }
                        CancelAction::CompleteNow(bundle)
                    } else if let Some((conn, conn_msg)) = msg.assigned {
                        CancelAction::Forward(conn, conn_msg)
                    } else {
                        CancelAction::None
                    }
                }
                _ => CancelAction::None,
            }
        };

        match action {
            CancelAction::CompleteNow(Some(mut bundle)) => {
                bundle.complete(None, Some(Error::MessageCanceled));
                true
            }
            CancelAction::CompleteNow(None) => true,
            CancelAction::Forward(conn, conn_msg) => self
                .inner
                .manager
                .notify(conn, event_cancel_conn_message(conn_msg)),
            CancelAction::None => false,
        }
    }

    /// Kills every connection of the pool; pending messages complete
    /// with [`Error::MessageConnection`].
    pub fn force_close(&self, peer: &str) {
        let (conns, mut bundles) = {
            let mut pools = self.inner.pools.lock().unwrap();
            let Some(&pool_index) = pools.by_name.get(peer) else {
                return;
            };
            let conns = pools.pools[pool_index].connections.clone();
            let bundles = self.inner.drain_pool_pending(&mut pools, pool_index);
            (conns, bundles)
        };
        for bundle in &mut bundles {
            bundle.complete(None, Some(Error::MessageConnection));
        }
        for conn in conns {
            self.inner.manager.notify(conn, crate::event::event_kill());
        }
    }

    /// Asks a connection to move to the active set of its pool.
    pub fn connection_enter_active(&self, conn: ActorId) -> bool {
        self.inner.manager.notify(conn, event_enter_active())
    }

    /// Asks a connection to settle as passive.
    pub fn connection_enter_passive(&self, conn: ActorId) -> bool {
        self.inner.manager.notify(conn, event_enter_passive())
    }

    /// Asks a raw connection to run the TLS upgrade.
    pub fn connection_start_secure(&self, conn: ActorId) -> bool {
        self.inner.manager.notify(conn, event_start_secure())
    }

    /// Graceful shutdown: completes everything still pending with
    /// [`Error::MessageConnection`], kills the connections and waits
    /// for the last actor of the service to unwind.
    pub fn stop(&self) {
        {
            let mut stopping = self.inner.stopping.lock().unwrap();
            if *stopping {
                return;
            }
            *stopping = true;
        }

        let mut bundles = Vec::new();
        {
            let mut pools = self.inner.pools.lock().unwrap();
            let indices: Vec<usize> = pools.pools.iter().map(|(i, _)| i).collect();
            for pool_index in indices {
                bundles.extend(self.inner.drain_pool_pending(&mut pools, pool_index));
            }
        }
        for bundle in &mut bundles {
            bundle.complete(None, Some(Error::MessageConnection));
        }

        self.inner.manager.stop_service(self.inner.service_index);
        debug!("rpc service {} stopped", self.inner.service_index);
    }
}

enum CancelAction {
    CompleteNow(Option<MessageBundle>),
    Forward(ActorId, MessageId),
    None,
}

impl ServiceInner {
    pub(crate) fn is_stopping(&self) -> bool {
        *self.stopping.lock().unwrap()
    }

    fn pool_index_for(&self, pools: &mut PoolTable, peer: &str) -> usize {
        match pools.by_name.get(peer) {
            Some(&index) => index,
            None => {
                let index = pools.pools.insert(ConnectionPool {
                    name: peer.to_owned(),
                    pending: VecDeque::new(),
                    connections: Vec::new(),
                    active: Vec::new(),
                    server_side: false,
                });
                pools.by_name.insert(peer.to_owned(), index);
                trace!("pool {:?} created as {}", peer, index);
                index
            }
        }
    }

    /// Picks a notification target for new pool work: an active
    /// connection when one exists, spawning a fresh one otherwise.
    fn pick_or_spawn(
        self: &Arc<Self>,
        pools: &mut PoolTable,
        pool_index: usize,
    ) -> Result<Option<ActorId>> {
        let pool = &mut pools.pools[pool_index];
        if let Some(&conn) = pool.active.first() {
            return Ok(Some(conn));
        }
        if pool.connections.len() < self.config.connections_per_pool {
            let conn = Connection::new_client(self.clone(), pool_index, pool.name.clone());
            let id = self
                .scheduler
                .start_actor(conn, self.service_index, event_start())?;
            pools.pools[pool_index].connections.push(id);
            debug!("pool {}: client connection {} spawned", pool_index, id);
            // it will drain the queue once it finishes its handshake
            return Ok(None);
        }
        // all connections still handshaking; they poll on activation
        Ok(None)
    }

    fn drain_pool_pending(
        &self,
        pools: &mut PoolTable,
        pool_index: usize,
    ) -> Vec<MessageBundle> {
        let pending: Vec<usize> = pools.pools[pool_index].pending.drain(..).collect();
        let mut bundles = Vec::new();
        for slot in pending {
            if let Some(msg) = pools.msgs.get_mut(slot) {
                if let Some(bundle) = msg.bundle.take() {
                    bundles.push(bundle);
                }
                pools.msgs.remove(slot);
            }
        }
        bundles
    }

    /// Registers an accepted connection under the shared server-side
    /// pool, creating it on first use.
    pub(crate) fn server_pool_index(&self) -> usize {
        let mut pools = self.pools.lock().unwrap();
        for (index, pool) in pools.pools.iter() {
            if pool.server_side {
                return index;
            }
        }
        let index = pools.pools.insert(ConnectionPool {
            name: String::new(),
            pending: VecDeque::new(),
            connections: Vec::new(),
            active: Vec::new(),
            server_side: true,
        });
        index
    }

    pub(crate) fn server_pool_register(&self, pool_index: usize, conn: ActorId) {
        let mut pools = self.pools.lock().unwrap();
        if let Some(pool) = pools.pools.get_mut(pool_index) {
            pool.connections.push(conn);
        }
    }

    /// Takes the next unassigned message off the pool queue.
    pub(crate) fn pop_pending(&self, pool_index: usize) -> Option<(MessageBundle, MessageId)> {
        let mut pools = self.pools.lock().unwrap();
        loop {
            let slot = pools.pools.get_mut(pool_index)?.pending.pop_front()?;
            let Some(msg) = pools.msgs.get_mut(slot) else {
                continue;
            };
            let Some(bundle) = msg.bundle.take() else {
                continue;
            };
            let unique = msg.unique;
            return Some((bundle, MessageId::new(slot as u32, unique)));
        }
    }

    /// Records where a popped message ended up, for cancellation.
    pub(crate) fn assign_message(&self, pool_id: MessageId, conn: ActorId, conn_msg: MessageId) {
        let mut pools = self.pools.lock().unwrap();
        if let Some(msg) = pools.msgs.get_mut(pool_id.index as usize) {
            if msg.unique == pool_id.unique {
                msg.assigned = Some((conn, conn_msg));
            }
        }
    }

    /// A tracked message reached its terminal state on a connection.
    pub(crate) fn message_done(&self, pool_id: MessageId) {
        if !pool_id.is_valid() {
            return;
        }
        let mut pools = self.pools.lock().unwrap();
        let slot = pool_id.index as usize;
        if pools
            .msgs
            .get(slot)
            .map(|m| m.unique == pool_id.unique)
            .unwrap_or(false)
        {
            pools.msgs.remove(slot);
        }
    }

    /// Puts a message a dying connection never started back onto the
    /// pool queue and pokes another connection.
    pub(crate) fn reschedule_message(
        self: &Arc<Self>,
        pool_index: usize,
        pool_id: MessageId,
        bundle: MessageBundle,
    ) -> Option<MessageBundle> {
        if self.is_stopping() {
            return Some(bundle);
        }
        let notify = {
            let mut pools = self.pools.lock().unwrap();
            if pools.pools.get(pool_index).is_none() {
                return Some(bundle);
            }
            let slot = pool_id.index as usize;
            match pools.msgs.get_mut(slot) {
                Some(msg) if msg.unique == pool_id.unique => {
                    msg.bundle = Some(bundle);
                    msg.assigned = None;
                    pools.pools[pool_index].pending.push_back(slot);
                }
                // untracked (direct) messages cannot be re-routed
                _ => return Some(bundle),
            }
            self.pick_or_spawn(&mut pools, pool_index).unwrap_or(None)
        };
        if let Some(conn) = notify {
            self.manager.notify(conn, event_new_pool_message());
        }
        None
    }

    /// A connection finished its handshake and wants into the active
    /// set. The lowest id stays first, so racing promotions resolve
    /// deterministically.
    pub(crate) fn connection_activated(&self, pool_index: usize, conn: ActorId) -> bool {
        let mut pools = self.pools.lock().unwrap();
        let Some(pool) = pools.pools.get_mut(pool_index) else {
            return false;
        };
        if !pool.active.contains(&conn) {
            pool.active.push(conn);
            pool.active.sort();
        }
        !pool.pending.is_empty()
    }

    /// Removes a stopped connection; spawns a replacement when work
    /// is still queued.
    pub(crate) fn connection_stopped(
        self: &Arc<Self>,
        pool_index: usize,
        conn: ActorId,
        error: Option<&Error>,
    ) {
        let respawn = {
            let mut pools = self.pools.lock().unwrap();
            let Some(pool) = pools.pools.get_mut(pool_index) else {
                return;
            };
            pool.connections.retain(|&c| c != conn);
            pool.active.retain(|&c| c != conn);
            let respawn =
                !pool.server_side && !pool.pending.is_empty() && !self.is_stopping();
            if let Some(error) = error {
                trace!(
                    "pool {}: connection {} stopped: {}",
                    pool_index,
                    conn,
                    error
                );
            }
            respawn
        };

        if respawn {
            let mut pools = self.pools.lock().unwrap();
            if let Err(e) = self.pick_or_spawn(&mut pools, pool_index) {
                warn!("pool {}: respawn failed: {}", pool_index, e);
                drop(pools);
                let mut bundles = {
                    let mut pools = self.pools.lock().unwrap();
                    self.drain_pool_pending(&mut pools, pool_index)
                };
                for bundle in &mut bundles {
                    bundle.complete(None, Some(Error::MessageConnection));
                }
            }
        }
    }
}
