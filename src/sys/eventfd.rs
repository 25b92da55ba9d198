use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};

use super::fd::FileDesc;

/// Wrapper around a non-blocking `eventfd(2)` descriptor.
///
/// Writing adds to the kernel counter, reading drains it. With the
/// counter saturated a write fails with `WouldBlock`, which callers
/// treat as "a wakeup is already pending".
#[derive(Debug)]
pub struct EventFd {
    inner: FileDesc,
}

impl EventFd {
    pub fn new() -> io::Result<EventFd> {
        let flags = libc::EFD_CLOEXEC | libc::EFD_NONBLOCK;
        let fd = syscall!(eventfd(0, flags))?;
        Ok(EventFd {
            inner: unsafe { FileDesc::new(fd) },
        })
    }

    pub fn read(&self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        (&self.inner).read_exact(&mut buf)?;
        Ok(u64::from_ne_bytes(buf))
    }

    pub fn write(&self, val: u64) -> io::Result<()> {
        let buf: [u8; 8] = val.to_ne_bytes();
        (&self.inner).write_all(&buf)?;
        Ok(())
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.raw()
    }
}

#[cfg(test)]
mod test {
    use super::EventFd;

    #[test]
    fn write_and_read() {
        let eventfd = EventFd::new().unwrap();
        eventfd.write(123).unwrap();
        let count = eventfd.read().unwrap();
        assert_eq!(123, count);
    }

    #[test]
    fn write_block() {
        let eventfd = EventFd::new().unwrap();

        assert!(eventfd.write(0xfffffffffffffffe).is_ok());
        assert!(eventfd.write(0xfffffffffffffffe).is_err());
    }
}
