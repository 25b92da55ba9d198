use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};

/// Owned file descriptor, closed on drop.
#[derive(Debug)]
pub struct FileDesc(File);

impl FileDesc {
    /// # Safety
    ///
    /// `fd` must be an open descriptor owned by the caller.
    pub unsafe fn new(fd: RawFd) -> Self {
        FileDesc(File::from_raw_fd(fd))
    }

    pub fn raw(&self) -> RawFd {
        self.0.as_raw_fd()
    }

    pub fn into_raw(self) -> RawFd {
        self.0.into_raw_fd()
    }
}

impl AsRawFd for FileDesc {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

impl Read for &FileDesc {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.0).read(buf)
    }
}

impl Write for &FileDesc {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&self.0).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
