use std::any::Any;
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};

use log::trace;
use slab::Slab;

use crate::actor::{Actor, ActorId};
use crate::error::Error;
use crate::event::{event_kill, Event};
use crate::reactor::{Notification, ReactorShared};

const ROWS_PER_CHUNK: usize = 256;

struct Row {
    unique: u32,
    service: usize,
    reactor: usize,
    actor: Option<Weak<Mutex<dyn Actor>>>,
}

impl Row {
    fn empty() -> Row {
        Row {
            unique: 0,
            service: usize::MAX,
            reactor: usize::MAX,
            actor: None,
        }
    }
}

struct ServiceEntry {
    live: usize,
    stopping: bool,
}

struct ManagerInner {
    chunks: RwLock<Vec<Arc<Mutex<Vec<Row>>>>>,
    free: Mutex<Vec<u32>>,
    reactors: RwLock<Vec<Arc<ReactorShared>>>,
    services: Mutex<Slab<ServiceEntry>>,
    services_cv: Condvar,
}

/// Process-wide actor registry.
///
/// Rows live behind chunked mutexes; a row lock is held only to check
/// the generation and enqueue on the owning reactor, which is what
/// gives cross-thread notifications their per-destination FIFO order.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

impl Default for Manager {
    fn default() -> Manager {
        Manager::new()
    }
}

impl Manager {
    pub fn new() -> Manager {
        Manager {
            inner: Arc::new(ManagerInner {
                chunks: RwLock::new(Vec::new()),
                free: Mutex::new(Vec::new()),
                reactors: RwLock::new(Vec::new()),
                services: Mutex::new(Slab::new()),
                services_cv: Condvar::new(),
            }),
        }
    }

    pub fn register_service(&self) -> usize {
        self.inner.services.lock().unwrap().insert(ServiceEntry {
            live: 0,
            stopping: false,
        })
    }

    pub(crate) fn register_reactor(&self, shared: Arc<ReactorShared>) -> usize {
        let mut reactors = self.inner.reactors.write().unwrap();
        reactors.push(shared);
        reactors.len() - 1
    }

    pub fn reactor_count(&self) -> usize {
        self.inner.reactors.read().unwrap().len()
    }

    fn with_row<R>(&self, index: u32, f: impl FnOnce(&mut Row) -> R) -> Option<R> {
        let chunk = {
            let chunks = self.inner.chunks.read().unwrap();
            chunks.get(index as usize / ROWS_PER_CHUNK)?.clone()
        };
        let mut rows = chunk.lock().unwrap();
        rows.get_mut(index as usize % ROWS_PER_CHUNK).map(f)
    }

    fn allocate_row(&self) -> u32 {
        if let Some(index) = self.inner.free.lock().unwrap().pop() {
            return index;
        }
        let mut chunks = self.inner.chunks.write().unwrap();
        let base = (chunks.len() * ROWS_PER_CHUNK) as u32;
        let mut rows = Vec::with_capacity(ROWS_PER_CHUNK);
        rows.resize_with(ROWS_PER_CHUNK, Row::empty);
        chunks.push(Arc::new(Mutex::new(rows)));
        {
            let mut free = self.inner.free.lock().unwrap();
            // hand out the first row, park the rest
            for offset in (1..ROWS_PER_CHUNK as u32).rev() {
                free.push(base + offset);
            }
        }
        base
    }

    /// Installs an actor in a fresh row. The caller still has to hand
    /// the actor itself to the owning reactor.
    pub(crate) fn register_actor(
        &self,
        service: usize,
        reactor: usize,
        actor: &Arc<Mutex<dyn Actor>>,
    ) -> Result<ActorId, Error> {
        {
            let mut services = self.inner.services.lock().unwrap();
            match services.get_mut(service) {
                Some(entry) if !entry.stopping => entry.live += 1,
                _ => return Err(Error::InvalidConfiguration("service is not accepting actors")),
            }
        }

        let index = self.allocate_row();
        let unique = self
            .with_row(index, |row| {
                row.service = service;
                row.reactor = reactor;
                row.actor = Some(Arc::downgrade(actor));
                row.unique
            })
            .unwrap_or(0);

        let id = ActorId::new(index, unique);
        trace!("actor {} registered with service {}", id, service);
        Ok(id)
    }

    /// Delivers `event` to the actor when the row still holds this
    /// generation. Returns whether the event was enqueued.
    pub fn notify(&self, id: ActorId, event: Event) -> bool {
        self.with_row(id.index, |row| {
            if row.unique == id.unique && row.actor.is_some() {
                let shared = self.inner.reactors.read().unwrap().get(row.reactor).cloned();
                if let Some(shared) = shared {
                    shared.push(Notification::Event { id, event });
                    return true;
                }
            }
            false
        })
        .unwrap_or(false)
    }

    /// Runs `f` inline against the actor when the row generation and
    /// the concrete type both match. The actor mutex serializes `f`
    /// with the owning reactor's callbacks; `f` must not block and
    /// must not call back into the manager.
    pub fn visit<A: Actor, R>(&self, id: ActorId, f: impl FnOnce(&mut A) -> R) -> Option<R> {
        let actor = self.with_row(id.index, |row| {
            if row.unique == id.unique {
                row.actor.as_ref().and_then(Weak::upgrade)
            } else {
                None
            }
        })??;

        // the row lock is released before the actor lock; the upgrade
        // keeps the actor alive even if it stops in between, in which
        // case `f` observes the stopped state and bails out itself
        let mut guard = actor.lock().unwrap();
        let any: &mut dyn Any = &mut *guard;
        any.downcast_mut::<A>().map(f)
    }

    pub(crate) fn actor_stopped(&self, id: ActorId) {
        let service = self.with_row(id.index, |row| {
            if row.unique != id.unique {
                return None;
            }
            row.unique = row.unique.wrapping_add(1);
            row.actor = None;
            row.reactor = usize::MAX;
            let service = row.service;
            row.service = usize::MAX;
            Some(service)
        });

        let Some(Some(service)) = service else { return };

        self.inner.free.lock().unwrap().push(id.index);

        let mut services = self.inner.services.lock().unwrap();
        if let Some(entry) = services.get_mut(service) {
            entry.live = entry.live.saturating_sub(1);
            if entry.live == 0 {
                self.inner.services_cv.notify_all();
            }
        }
    }

    fn service_actor_ids(&self, service: usize) -> Vec<ActorId> {
        let chunks: Vec<_> = self.inner.chunks.read().unwrap().clone();
        let mut out = Vec::new();
        for (chunk_idx, chunk) in chunks.iter().enumerate() {
            let rows = chunk.lock().unwrap();
            for (offset, row) in rows.iter().enumerate() {
                if row.service == service && row.actor.is_some() {
                    let index = (chunk_idx * ROWS_PER_CHUNK + offset) as u32;
                    out.push(ActorId::new(index, row.unique));
                }
            }
        }
        out
    }

    /// Broadcasts `Kill` to every actor of the service and blocks
    /// until the last one is gone.
    pub fn stop_service(&self, service: usize) {
        {
            let mut services = self.inner.services.lock().unwrap();
            match services.get_mut(service) {
                Some(entry) => entry.stopping = true,
                None => return,
            }
        }

        for id in self.service_actor_ids(service) {
            self.notify(id, event_kill());
        }

        let mut services = self.inner.services.lock().unwrap();
        while services.get(service).map(|e| e.live).unwrap_or(0) > 0 {
            services = self.inner.services_cv.wait(services).unwrap();
        }
    }
}
