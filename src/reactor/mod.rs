use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use concurrent_queue::ConcurrentQueue;
use indexmap::IndexMap;
use log::{debug, trace, warn};
use slab::Slab;

use crate::actor::{Actor, ActorId, HandleId};
use crate::event::Event;
use crate::manager::Manager;

mod poller;
mod ready;
mod timestore;

pub use poller::{Events, Poller, Waker, WAKE_TOKEN};
pub use ready::Ready;
pub use timestore::{TimeStore, TimerTicket};

/// Control-plane item for one reactor, pushed from any thread.
pub(crate) enum Notification {
    Start {
        id: ActorId,
        actor: Arc<Mutex<dyn Actor>>,
        event: Event,
    },
    Event {
        id: ActorId,
        event: Event,
    },
    Stop,
}

/// The part of a reactor other threads may touch: its inbound queue
/// and its wake handle.
pub(crate) struct ReactorShared {
    queue: ConcurrentQueue<Notification>,
    waker: Waker,
}

impl ReactorShared {
    pub(crate) fn new() -> io::Result<Arc<ReactorShared>> {
        Ok(Arc::new(ReactorShared {
            queue: ConcurrentQueue::unbounded(),
            waker: Waker::new()?,
        }))
    }

    pub(crate) fn push(&self, notification: Notification) {
        if self.queue.push(notification).is_ok() {
            let _ = self.waker.wakeup();
        }
    }
}

struct ActorEntry {
    id: ActorId,
    actor: Arc<Mutex<dyn Actor>>,
    handles: Vec<usize>,
    stopping: bool,
}

struct HandleEntry {
    actor_slot: usize,
    fd: Option<RawFd>,
    interest: Ready,
    ticket: Option<TimerTicket>,
}

/// Single-threaded cooperative event loop owning actors, their
/// completion handles, a poller and a deadline store.
pub struct Reactor {
    index: usize,
    manager: Manager,
    shared: Arc<ReactorShared>,
    poller: Poller,
    times: TimeStore,
    handles: Slab<HandleEntry>,
    actors: Slab<ActorEntry>,
    ids: IndexMap<ActorId, usize>,
    posted: VecDeque<(usize, Event)>,
    stopped: Vec<usize>,
    now: Instant,
    running: bool,
}

impl Reactor {
    pub(crate) fn new(
        index: usize,
        shared: Arc<ReactorShared>,
        manager: Manager,
    ) -> io::Result<Reactor> {
        let poller = Poller::with_waker(shared.waker.clone())?;
        Ok(Reactor {
            index,
            manager,
            shared,
            poller,
            times: TimeStore::new(),
            handles: Slab::new(),
            actors: Slab::new(),
            ids: IndexMap::new(),
            posted: VecDeque::new(),
            stopped: Vec::new(),
            now: Instant::now(),
            running: false,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Runs the loop until a stop notification arrives.
    pub fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(1024);
        let mut batch = Vec::new();
        let mut expired = Vec::new();

        debug!("reactor {} running", self.index());
        self.running = true;

        while self.running {
            let timeout = if !self.queue_is_empty() {
                Some(Duration::ZERO)
            } else {
                self.times
                    .next_deadline()
                    .map(|deadline| deadline.saturating_duration_since(Instant::now()))
            };

            self.poller.wait(&mut events, timeout)?;
            self.now = Instant::now();

            // inbound notifications first, so a Start always precedes
            // the events that follow it in the queue
            while let Ok(notification) = self.shared.queue.pop() {
                batch.push(notification);
            }
            for notification in batch.drain(..) {
                self.handle_notification(notification);
            }
            self.run_posted();

            for i in 0..events.len() {
                let (token, mask) = match events.get(i) {
                    Some(pair) => pair,
                    None => break,
                };
                if token == WAKE_TOKEN {
                    continue;
                }
                self.deliver_ready(token, poller::ready_from_epoll(mask));
                self.run_posted();
            }

            self.times.pop_expired(self.now, &mut expired);
            for token in expired.drain(..) {
                self.deliver_timer(token);
                self.run_posted();
            }

            self.process_stopped();
        }

        debug!("reactor {} stopped", self.index());
        Ok(())
    }

    fn queue_is_empty(&self) -> bool {
        self.shared.queue.is_empty()
    }

    fn handle_notification(&mut self, notification: Notification) {
        match notification {
            Notification::Start { id, actor, event } => {
                let slot = self.actors.insert(ActorEntry {
                    id,
                    actor,
                    handles: Vec::new(),
                    stopping: false,
                });
                self.ids.insert(id, slot);
                trace!("reactor {}: actor {} installed", self.index(), id);
                self.deliver_event(slot, event);
            }
            Notification::Event { id, event } => match self.ids.get(&id) {
                Some(&slot) => self.deliver_event(slot, event),
                None => trace!("reactor {}: drop event for stale {}", self.index(), id),
            },
            Notification::Stop => {
                self.running = false;
            }
        }
    }

    fn deliver_event(&mut self, slot: usize, event: Event) {
        let (id, actor) = match self.actors.get(slot) {
            Some(entry) => (entry.id, entry.actor.clone()),
            None => return,
        };
        let mut guard = actor.lock().unwrap();
        let mut ctx = ReactorContext {
            reactor: self,
            actor_slot: slot,
            actor_id: id,
        };
        guard.on_event(&mut ctx, event);
    }

    fn deliver_ready(&mut self, token: usize, ready: Ready) {
        let slot = match self.handles.get(token) {
            Some(handle) => handle.actor_slot,
            None => return,
        };
        self.deliver_completion(slot, HandleId(token), ready);
    }

    fn deliver_timer(&mut self, token: usize) {
        let slot = match self.handles.get_mut(token) {
            Some(handle) => {
                handle.ticket = None;
                handle.actor_slot
            }
            None => return,
        };
        self.deliver_completion(slot, HandleId(token), Ready::timer());
    }

    fn deliver_completion(&mut self, slot: usize, handle: HandleId, ready: Ready) {
        let (id, actor) = match self.actors.get(slot) {
            Some(entry) => (entry.id, entry.actor.clone()),
            None => return,
        };
        let mut guard = actor.lock().unwrap();
        let mut ctx = ReactorContext {
            reactor: self,
            actor_slot: slot,
            actor_id: id,
        };
        guard.on_completion(&mut ctx, handle, ready);
    }

    fn run_posted(&mut self) {
        while let Some((slot, event)) = self.posted.pop_front() {
            self.deliver_event(slot, event);
        }
    }

    fn process_stopped(&mut self) {
        while let Some(slot) = self.stopped.pop() {
            let entry = match self.actors.try_remove(slot) {
                Some(entry) => entry,
                None => continue,
            };
            self.ids.swap_remove(&entry.id);

            {
                let mut guard = entry.actor.lock().unwrap();
                let mut ctx = ReactorContext {
                    reactor: self,
                    actor_slot: slot,
                    actor_id: entry.id,
                };
                guard.on_stopped(&mut ctx);
            }

            for token in entry.handles {
                self.remove_handle_of(token, slot);
            }

            trace!("reactor {}: actor {} removed", self.index(), entry.id);
            self.manager.actor_stopped(entry.id);
        }
    }

    fn remove_handle_of(&mut self, token: usize, actor_slot: usize) {
        let matches = self
            .handles
            .get(token)
            .map(|handle| handle.actor_slot == actor_slot)
            .unwrap_or(false);
        if !matches {
            return;
        }
        let handle = self.handles.remove(token);
        if let Some(ticket) = handle.ticket {
            self.times.cancel(ticket);
        }
        if let Some(fd) = handle.fd {
            if let Err(e) = self.poller.deregister(fd) {
                warn!("reactor {}: deregister failed: {}", self.index(), e);
            }
        }
    }
}

/// Execution context handed to every actor callback. Borrows the
/// reactor, so everything here runs on the owning thread.
pub struct ReactorContext<'a> {
    reactor: &'a mut Reactor,
    actor_slot: usize,
    actor_id: ActorId,
}

impl ReactorContext<'_> {
    pub fn actor_id(&self) -> ActorId {
        self.actor_id
    }

    pub fn reactor_index(&self) -> usize {
        self.reactor.index()
    }

    /// Steady time of the current reactor tick.
    pub fn now(&self) -> Instant {
        self.reactor.now
    }

    pub fn manager(&self) -> &Manager {
        &self.reactor.manager
    }

    /// Enqueues an event back to the current actor, delivered after
    /// the running callback returns and before the tick moves on.
    pub fn post(&mut self, event: Event) {
        self.reactor.posted.push_back((self.actor_slot, event));
    }

    /// Schedules removal of the current actor at the end of this
    /// tick. Pending events for it are dropped afterwards.
    pub fn post_stop(&mut self) {
        let entry = match self.reactor.actors.get_mut(self.actor_slot) {
            Some(entry) => entry,
            None => return,
        };
        if !entry.stopping {
            entry.stopping = true;
            self.reactor.stopped.push(self.actor_slot);
        }
    }

    pub(crate) fn register_handle(&mut self, fd: Option<RawFd>) -> io::Result<HandleId> {
        let token = self.reactor.handles.insert(HandleEntry {
            actor_slot: self.actor_slot,
            fd,
            interest: Ready::empty(),
            ticket: None,
        });
        if let Some(fd) = fd {
            if let Err(e) = self.reactor.poller.register(fd, token, Ready::empty()) {
                self.reactor.handles.remove(token);
                return Err(e);
            }
        }
        if let Some(entry) = self.reactor.actors.get_mut(self.actor_slot) {
            entry.handles.push(token);
        }
        Ok(HandleId(token))
    }

    pub(crate) fn deregister_handle(&mut self, handle: HandleId) {
        let token = handle.0;
        let slot = self.actor_slot;
        self.reactor.remove_handle_of(token, slot);
        if let Some(entry) = self.reactor.actors.get_mut(slot) {
            entry.handles.retain(|&h| h != token);
        }
    }

    pub(crate) fn set_interest(&mut self, handle: HandleId, interest: Ready) -> io::Result<()> {
        let entry = match self.reactor.handles.get_mut(handle.0) {
            Some(entry) => entry,
            None => return Ok(()),
        };
        if entry.interest == interest {
            return Ok(());
        }
        entry.interest = interest;
        match entry.fd {
            Some(fd) => self.reactor.poller.modify(fd, handle.0, interest),
            None => Ok(()),
        }
    }

    /// Arms (or re-arms) the deadline of a handle. A handle carries
    /// at most one armed deadline at a time.
    pub(crate) fn arm_timer(&mut self, handle: HandleId, deadline: Instant) {
        let old = match self.reactor.handles.get_mut(handle.0) {
            Some(entry) => entry.ticket.take(),
            None => return,
        };
        if let Some(ticket) = old {
            self.reactor.times.cancel(ticket);
        }
        let ticket = self.reactor.times.add(handle.0, deadline);
        if let Some(entry) = self.reactor.handles.get_mut(handle.0) {
            entry.ticket = Some(ticket);
        }
    }

    /// Disarms the handle's deadline; returns whether one was armed.
    pub(crate) fn cancel_timer(&mut self, handle: HandleId) -> bool {
        let ticket = match self.reactor.handles.get_mut(handle.0) {
            Some(entry) => entry.ticket.take(),
            None => None,
        };
        match ticket {
            Some(ticket) => self.reactor.times.cancel(ticket),
            None => false,
        }
    }
}
