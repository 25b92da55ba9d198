use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::error;

use crate::actor::{Actor, ActorId};
use crate::error::Error;
use crate::event::Event;
use crate::manager::Manager;
use crate::reactor::{Notification, Reactor, ReactorShared};

struct SchedulerInner {
    manager: Manager,
    reactors: Mutex<Vec<(usize, Arc<ReactorShared>)>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    next: AtomicUsize,
}

/// Fixed set of reactor threads with round-robin actor placement.
///
/// Services running actors on a scheduler must be stopped before the
/// scheduler itself: `stop` tears the reactor threads down and any
/// actor still installed is dropped without its stop callback.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(manager: Manager) -> Scheduler {
        Scheduler {
            inner: Arc::new(SchedulerInner {
                manager,
                reactors: Mutex::new(Vec::new()),
                threads: Mutex::new(Vec::new()),
                next: AtomicUsize::new(0),
            }),
        }
    }

    pub fn manager(&self) -> &Manager {
        &self.inner.manager
    }

    /// Spawns `count` reactor threads.
    pub fn start(&self, count: usize) -> io::Result<()> {
        let mut reactors = self.inner.reactors.lock().unwrap();
        let mut threads = self.inner.threads.lock().unwrap();

        if !reactors.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "scheduler already started",
            ));
        }

        for _ in 0..count.max(1) {
            let shared = ReactorShared::new()?;
            let index = self.inner.manager.register_reactor(shared.clone());
            let manager = self.inner.manager.clone();
            let thread_shared = shared.clone();

            let handle = thread::Builder::new()
                .name(format!("reactor-{}", index))
                .spawn(move || match Reactor::new(index, thread_shared, manager) {
                    Ok(mut reactor) => {
                        if let Err(e) = reactor.run() {
                            error!("reactor {} failed: {}", index, e);
                        }
                    }
                    Err(e) => error!("reactor {} failed to start: {}", index, e),
                })?;

            reactors.push((index, shared));
            threads.push(handle);
        }

        Ok(())
    }

    /// Installs `actor` on the next reactor in round-robin order and
    /// posts `start_event` as its first delivery.
    pub fn start_actor<A: Actor>(
        &self,
        actor: A,
        service: usize,
        start_event: Event,
    ) -> Result<ActorId, Error> {
        let arc: Arc<Mutex<dyn Actor>> = Arc::new(Mutex::new(actor));

        let (reactor_index, shared) = {
            let reactors = self.inner.reactors.lock().unwrap();
            if reactors.is_empty() {
                return Err(Error::InvalidConfiguration("scheduler is not started"));
            }
            let pick = self.inner.next.fetch_add(1, Ordering::Relaxed) % reactors.len();
            reactors[pick].clone()
        };

        let id = self
            .inner
            .manager
            .register_actor(service, reactor_index, &arc)?;

        shared.push(Notification::Start {
            id,
            actor: arc,
            event: start_event,
        });

        Ok(id)
    }

    /// Stops every reactor thread and joins them.
    pub fn stop(&self) {
        let reactors: Vec<_> = {
            let mut reactors = self.inner.reactors.lock().unwrap();
            reactors.drain(..).collect()
        };
        for (_, shared) in &reactors {
            shared.push(Notification::Stop);
        }

        let threads: Vec<_> = {
            let mut threads = self.inner.threads.lock().unwrap();
            threads.drain(..).collect()
        };
        for handle in threads {
            let _ = handle.join();
        }
    }
}
