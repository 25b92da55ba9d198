use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;
use std::{cmp, mem};

/// Raw `epoll(7)` instance. Interest translation to and from the
/// runtime's readiness sets lives in the reactor's poller, this type
/// only moves `epoll_event` structs across the syscall boundary.
pub struct Epoll {
    epfd: RawFd,
}

impl Epoll {
    pub fn new() -> io::Result<Epoll> {
        let epfd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        Ok(Epoll { epfd })
    }

    pub fn wait(&self, evts: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        let timeout = timeout
            .map(|to| {
                // round up so a 1ns timeout does not busy-spin as 0ms
                let millis = to.as_millis() + u128::from(to.subsec_nanos() % 1_000_000 != 0);
                cmp::min(millis, libc::c_int::MAX as u128) as libc::c_int
            })
            .unwrap_or(-1);

        evts.events.clear();

        let cnt = match syscall!(epoll_wait(
            self.epfd,
            evts.events.as_mut_ptr(),
            evts.events.capacity() as i32,
            timeout
        )) {
            Ok(cnt) => cnt,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => 0,
            Err(e) => return Err(e),
        };

        unsafe { evts.events.set_len(cnt as usize) };

        Ok(())
    }

    pub fn add(&self, fd: RawFd, token: usize, events: u32) -> io::Result<()> {
        let mut info = libc::epoll_event {
            events,
            u64: token as u64,
        };

        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut info))?;

        Ok(())
    }

    pub fn modify(&self, fd: RawFd, token: usize, events: u32) -> io::Result<()> {
        let mut info = libc::epoll_event {
            events,
            u64: token as u64,
        };

        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, &mut info))?;

        Ok(())
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        let mut info: libc::epoll_event = unsafe { mem::zeroed() };

        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut info))?;

        Ok(())
    }
}

impl AsRawFd for Epoll {
    fn as_raw_fd(&self) -> RawFd {
        self.epfd
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        let _ = unsafe { libc::close(self.epfd) };
    }
}

pub struct Events {
    events: Vec<libc::epoll_event>,
}

impl Events {
    pub fn with_capacity(cap: usize) -> Events {
        Events {
            events: Vec::with_capacity(cap),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    #[inline]
    pub fn get(&self, idx: usize) -> Option<(usize, u32)> {
        self.events
            .get(idx)
            .map(|event| (event.u64 as usize, event.events))
    }
}
