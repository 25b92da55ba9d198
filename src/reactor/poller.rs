use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use libc::{EPOLLERR, EPOLLET, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLPRI, EPOLLRDHUP};

use crate::sys::{self, EventFd};

use super::ready::Ready;

/// Token reserved for the wake descriptor.
pub const WAKE_TOKEN: usize = usize::MAX;

pub use crate::sys::epoll::Events;

/// Cross-thread wakeup handle for one poller.
///
/// `wakeup` is callable from any thread, is idempotent across
/// concurrent callers and coalesces into at most one extra readiness
/// event per outstanding `wait` (the eventfd counter saturating to
/// `WouldBlock` means a wakeup is already queued).
#[derive(Debug, Clone)]
pub struct Waker {
    inner: Arc<EventFd>,
}

impl Waker {
    pub fn new() -> io::Result<Waker> {
        Ok(Waker {
            inner: Arc::new(EventFd::new()?),
        })
    }

    pub fn wakeup(&self) -> io::Result<()> {
        match self.inner.write(1) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn drain(&self) {
        loop {
            match self.inner.read() {
                Ok(_) => (),
                Err(_) => return,
            }
        }
    }
}

/// The OS readiness demultiplexer of one reactor: an epoll instance
/// plus the wake eventfd registered at [`WAKE_TOKEN`]. Registrations
/// are level triggered; interest is recomputed whenever a handle arms
/// or disarms an operation.
pub struct Poller {
    epoll: sys::Epoll,
    waker: Waker,
}

impl Poller {
    pub fn new() -> io::Result<Poller> {
        Poller::with_waker(Waker::new()?)
    }

    /// Builds a poller around a waker created ahead of time, so the
    /// wake handle can be shared before the owning thread runs.
    pub fn with_waker(waker: Waker) -> io::Result<Poller> {
        let epoll = sys::Epoll::new()?;

        epoll.add(
            waker.inner.as_raw_fd(),
            WAKE_TOKEN,
            (EPOLLIN | EPOLLET) as u32,
        )?;

        Ok(Poller { epoll, waker })
    }

    pub fn waker(&self) -> Waker {
        self.waker.clone()
    }

    pub fn register(&self, fd: RawFd, token: usize, interest: Ready) -> io::Result<()> {
        self.epoll.add(fd, token, interest_to_epoll(interest))
    }

    pub fn modify(&self, fd: RawFd, token: usize, interest: Ready) -> io::Result<()> {
        self.epoll.modify(fd, token, interest_to_epoll(interest))
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        self.epoll.delete(fd)
    }

    /// Blocks up to `timeout` for readiness. Wake events are consumed
    /// here; the caller only sees handle tokens.
    pub fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        self.epoll.wait(events, timeout)?;

        for i in 0..events.len() {
            if let Some((WAKE_TOKEN, _)) = events.get(i) {
                self.waker.drain();
            }
        }

        Ok(())
    }
}

fn interest_to_epoll(interest: Ready) -> u32 {
    let mut kind = 0;

    if interest.is_recv() {
        kind |= EPOLLIN;
    }

    if interest.is_send() {
        kind |= EPOLLOUT;
    }

    kind as u32 | EPOLLRDHUP as u32
}

pub fn ready_from_epoll(epoll: u32) -> Ready {
    let epoll = epoll as libc::c_int;
    let mut kind = Ready::empty();

    if (epoll & EPOLLIN) != 0 || (epoll & EPOLLPRI) != 0 {
        kind.insert(Ready::recv());
    }

    if (epoll & EPOLLOUT) != 0 {
        kind.insert(Ready::send());
    }

    if (epoll & EPOLLERR) != 0 {
        kind.insert(Ready::error());
    }

    if (epoll & EPOLLRDHUP) != 0 || (epoll & EPOLLHUP) != 0 {
        kind.insert(Ready::hangup());
    }

    kind
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[test]
    fn wake_is_idempotent_and_coalesced() {
        let poller = Poller::new().unwrap();
        let waker = poller.waker();
        let mut events = Events::with_capacity(8);

        waker.wakeup().unwrap();
        waker.wakeup().unwrap();
        waker.wakeup().unwrap();

        poller
            .wait(&mut events, Some(Duration::from_millis(100)))
            .unwrap();
        assert_eq!(events.len(), 1);

        // drained: the next wait times out without events
        poller
            .wait(&mut events, Some(Duration::from_millis(10)))
            .unwrap();
        assert_eq!(events.len(), 0);
    }
}
