use std::io::{self, Error, ErrorKind};
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::{AsRawFd, RawFd};

use libc::{c_int, c_void, socklen_t, SOCK_CLOEXEC, SOCK_NONBLOCK};

use super::fd::FileDesc;

/// Non-blocking socket device. Every constructor sets
/// `SOCK_NONBLOCK | SOCK_CLOEXEC`; all I/O either completes or fails
/// with `WouldBlock`, which the completion handles turn into poller
/// interest.
#[derive(Debug)]
pub struct Socket(FileDesc);

pub fn setsockopt<T>(sock: &Socket, level: c_int, name: c_int, payload: T) -> io::Result<()> {
    let payload = &payload as *const T as *const c_void;
    syscall!(setsockopt(
        sock.raw(),
        level,
        name,
        payload,
        mem::size_of::<T>() as socklen_t
    ))?;
    Ok(())
}

pub fn getsockopt<T: Copy>(sock: &Socket, level: c_int, name: c_int) -> io::Result<T> {
    let mut slot: T = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<T>() as socklen_t;
    syscall!(getsockopt(
        sock.raw(),
        level,
        name,
        &mut slot as *mut _ as *mut _,
        &mut len
    ))?;
    debug_assert_eq!(len as usize, mem::size_of::<T>());
    Ok(slot)
}

fn addr_into_storage(addr: &SocketAddr) -> (libc::sockaddr_storage, socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };

    match addr {
        SocketAddr::V4(a) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: a.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(a.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                *(&mut storage as *mut _ as *mut libc::sockaddr_in) = sin;
            }
            (storage, mem::size_of::<libc::sockaddr_in>() as socklen_t)
        }
        SocketAddr::V6(a) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: a.port().to_be(),
                sin6_flowinfo: a.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: a.ip().octets(),
                },
                sin6_scope_id: a.scope_id(),
            };
            unsafe {
                *(&mut storage as *mut _ as *mut libc::sockaddr_in6) = sin6;
            }
            (storage, mem::size_of::<libc::sockaddr_in6>() as socklen_t)
        }
    }
}

pub fn storage_to_addr(storage: &libc::sockaddr_storage, len: usize) -> io::Result<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            debug_assert!(len >= mem::size_of::<libc::sockaddr_in>());
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            Ok(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes()),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            debug_assert!(len >= mem::size_of::<libc::sockaddr_in6>());
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            Ok(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => Err(Error::new(ErrorKind::InvalidInput, "invalid address family")),
    }
}

impl Socket {
    fn new(family: c_int, ty: c_int) -> io::Result<Socket> {
        let fd = syscall!(socket(family, ty | SOCK_CLOEXEC | SOCK_NONBLOCK, 0))?;
        Ok(Socket(unsafe { FileDesc::new(fd) }))
    }

    pub fn new_stream(addr: &SocketAddr) -> io::Result<Socket> {
        Socket::new(family_of(addr), libc::SOCK_STREAM)
    }

    pub fn new_datagram(addr: &SocketAddr) -> io::Result<Socket> {
        Socket::new(family_of(addr), libc::SOCK_DGRAM)
    }

    /// # Safety
    ///
    /// `fd` must be an open socket owned by the caller.
    pub unsafe fn from_raw(fd: RawFd) -> Socket {
        Socket(FileDesc::new(fd))
    }

    pub fn raw(&self) -> RawFd {
        self.0.raw()
    }

    pub fn bind(&self, addr: &SocketAddr) -> io::Result<()> {
        let (storage, len) = addr_into_storage(addr);
        syscall!(bind(self.raw(), &storage as *const _ as *const _, len))?;
        Ok(())
    }

    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        syscall!(listen(self.raw(), backlog))?;
        Ok(())
    }

    /// Starts a non-blocking connect. `Ok(false)` means in progress;
    /// completion is observed through send readiness plus
    /// [`Socket::take_error`].
    pub fn connect(&self, addr: &SocketAddr) -> io::Result<bool> {
        let (storage, len) = addr_into_storage(addr);
        match syscall!(connect(self.raw(), &storage as *const _ as *const _, len)) {
            Ok(_) => Ok(true),
            Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Ok(false),
            Err(ref e) if e.kind() == ErrorKind::Interrupted => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn accept(&self) -> io::Result<(Socket, SocketAddr)> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of_val(&storage) as socklen_t;

        let fd = loop {
            match syscall!(accept4(
                self.raw(),
                &mut storage as *mut _ as *mut _,
                &mut len,
                SOCK_CLOEXEC | SOCK_NONBLOCK
            )) {
                Err(ref e) if e.kind() == ErrorKind::Interrupted => (),
                other => break other?,
            }
        };

        let sock = Socket(unsafe { FileDesc::new(fd) });
        let addr = storage_to_addr(&storage, len as usize)?;
        Ok((sock, addr))
    }

    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = syscall!(recv(
            self.raw(),
            buf.as_mut_ptr() as *mut c_void,
            buf.len(),
            0
        ))?;
        Ok(n as usize)
    }

    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        let n = syscall!(send(
            self.raw(),
            buf.as_ptr() as *const c_void,
            buf.len(),
            libc::MSG_NOSIGNAL
        ))?;
        Ok(n as usize)
    }

    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of_val(&storage) as socklen_t;

        let n = syscall!(recvfrom(
            self.raw(),
            buf.as_mut_ptr() as *mut c_void,
            buf.len(),
            0,
            &mut storage as *mut _ as *mut _,
            &mut len
        ))?;
        Ok((n as usize, storage_to_addr(&storage, len as usize)?))
    }

    pub fn send_to(&self, buf: &[u8], addr: &SocketAddr) -> io::Result<usize> {
        let (storage, len) = addr_into_storage(addr);
        let n = syscall!(sendto(
            self.raw(),
            buf.as_ptr() as *const c_void,
            buf.len(),
            libc::MSG_NOSIGNAL,
            &storage as *const _ as *const _,
            len
        ))?;
        Ok(n as usize)
    }

    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        let how = match how {
            Shutdown::Write => libc::SHUT_WR,
            Shutdown::Read => libc::SHUT_RD,
            Shutdown::Both => libc::SHUT_RDWR,
        };
        syscall!(shutdown(self.raw(), how))?;
        Ok(())
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of_val(&storage) as socklen_t;
        syscall!(getsockname(
            self.raw(),
            &mut storage as *mut _ as *mut _,
            &mut len
        ))?;
        storage_to_addr(&storage, len as usize)
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of_val(&storage) as socklen_t;
        syscall!(getpeername(
            self.raw(),
            &mut storage as *mut _ as *mut _,
            &mut len
        ))?;
        storage_to_addr(&storage, len as usize)
    }

    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        let raw: c_int = getsockopt(self, libc::SOL_SOCKET, libc::SO_ERROR)?;
        if raw == 0 {
            Ok(None)
        } else {
            Ok(Some(io::Error::from_raw_os_error(raw)))
        }
    }

    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        setsockopt(self, libc::IPPROTO_TCP, libc::TCP_NODELAY, nodelay as c_int)
    }

    pub fn set_reuseaddr(&self, reuse: bool) -> io::Result<()> {
        setsockopt(self, libc::SOL_SOCKET, libc::SO_REUSEADDR, reuse as c_int)
    }
}

fn family_of(addr: &SocketAddr) -> c_int {
    match addr {
        SocketAddr::V4(..) => libc::AF_INET,
        SocketAddr::V6(..) => libc::AF_INET6,
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.0.raw()
    }
}

#[cfg(test)]
mod test {
    use super::Socket;
    use std::net::SocketAddr;

    #[test]
    fn bind_and_query() {
        let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let sock = Socket::new_stream(&any).unwrap();
        sock.set_reuseaddr(true).unwrap();
        sock.bind(&any).unwrap();
        let local = sock.local_addr().unwrap();
        assert_eq!(local.ip(), any.ip());
        assert_ne!(local.port(), 0);
    }

    #[test]
    fn datagram_roundtrip() {
        let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let a = Socket::new_datagram(&any).unwrap();
        let b = Socket::new_datagram(&any).unwrap();
        a.bind(&any).unwrap();
        b.bind(&any).unwrap();

        let to = b.local_addr().unwrap();
        assert_eq!(a.send_to(b"ping", &to).unwrap(), 4);

        let mut buf = [0u8; 16];
        loop {
            match b.recv_from(&mut buf) {
                Ok((n, from)) => {
                    assert_eq!(&buf[..n], b"ping");
                    assert_eq!(from, a.local_addr().unwrap());
                    break;
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::yield_now();
                }
                Err(e) => panic!("recv_from: {}", e),
            }
        }
    }
}
