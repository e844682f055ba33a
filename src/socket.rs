//! Blocking socket wrappers used by the mock socket server.
//!
//! Ported from the original `Socket` class (`socket.h`/`socket.cc`), which
//! wraps the raw `socket`/`bind`/`listen`/`accept`/`connect`/`read`/`write`
//! syscalls behind one move-only class holding a single fd.
//! `std::net::{TcpListener, TcpStream}` already provide exactly that wrapper
//! idiomatically, so this module is thinner than the original: two small
//! newtypes giving the call sites the same verbs (`bind`, `accept`,
//! `connect`, `read`, `write_all`), reaching for raw `libc` socket calls only
//! where `std::net` cannot express the original's behavior (binding the
//! client endpoint before `connect`, see [`ConnectedSocket::connect_from`]).

use crate::error::Result;
use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6, TcpListener, TcpStream};

/// A bound, listening TCP socket. Corresponds to a `Socket` on which
/// `Create`/`Bind`/`Listen` have all succeeded.
pub struct ListeningSocket(TcpListener);

impl ListeningSocket {
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        Ok(ListeningSocket(listener))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.0.local_addr()?)
    }

    /// Blocks until a connection arrives, mirroring `Socket::Accept`.
    pub fn accept(&self) -> Result<(ConnectedSocket, SocketAddr)> {
        let (stream, addr) = self.0.accept()?;
        Ok((ConnectedSocket(stream), addr))
    }
}

/// A connected TCP socket, either from `accept` or `connect`.
pub struct ConnectedSocket(TcpStream);

impl ConnectedSocket {
    pub fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        Ok(ConnectedSocket(stream))
    }

    /// Connects to `remote` from `local`, binding the outgoing socket to
    /// `local` first. `std::net::TcpStream::connect` has no portable way to
    /// pick the local endpoint before connecting, so this drops to the raw
    /// `socket`/`bind`/`connect` syscalls the original used, via `libc`.
    #[cfg(unix)]
    pub fn connect_from(local: SocketAddr, remote: SocketAddr) -> Result<Self> {
        use std::os::unix::io::FromRawFd;

        let domain = match (&local, &remote) {
            (SocketAddr::V4(_), SocketAddr::V4(_)) => libc::AF_INET,
            (SocketAddr::V6(_), SocketAddr::V6(_)) => libc::AF_INET6,
            _ => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "connect_from: local and remote address families differ",
                )
                .into())
            }
        };

        let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM, 0) };
        if fd < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        let guard = FdGuard(fd);

        let reuse: libc::c_int = 1;
        unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &reuse as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }

        bind_raw(fd, local)?;
        connect_raw(fd, remote)?;

        let fd = guard.release();
        Ok(ConnectedSocket(unsafe { TcpStream::from_raw_fd(fd) }))
    }

    /// Non-unix fallback: `std::net` gives no way to bind before `connect`
    /// here, so the client endpoint is dropped and this behaves like
    /// [`ConnectedSocket::connect`].
    #[cfg(not(unix))]
    pub fn connect_from(_local: SocketAddr, remote: SocketAddr) -> Result<Self> {
        Self::connect(remote)
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        Ok(self.0.peer_addr()?)
    }

    /// Reads up to `buf.len()` bytes. `Ok(0)` means the peer closed the
    /// connection, mirroring `Socket::Read`'s `read(2)` passthrough.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        use std::io::Read;
        Ok(self.0.read(buf)?)
    }

    pub fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        use std::io::Write;
        self.0.write_all(buf)?;
        Ok(())
    }

    pub fn shutdown(&self) -> Result<()> {
        // Both directions; a half-closed socket isn't meaningful once a
        // replayed conversation has run its course.
        let _ = self.0.shutdown(std::net::Shutdown::Both);
        Ok(())
    }

    pub fn set_nodelay(&self, enabled: bool) -> Result<()> {
        Ok(self.0.set_nodelay(enabled)?)
    }
}

/// Closes the held fd on drop unless [`FdGuard::release`] was called first,
/// so a `bind`/`connect` failure in [`ConnectedSocket::connect_from`] doesn't
/// leak the socket.
#[cfg(unix)]
struct FdGuard(libc::c_int);

#[cfg(unix)]
impl FdGuard {
    fn release(self) -> libc::c_int {
        let fd = self.0;
        std::mem::forget(self);
        fd
    }
}

#[cfg(unix)]
impl Drop for FdGuard {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.0);
        }
    }
}

#[cfg(unix)]
fn bind_raw(fd: libc::c_int, addr: SocketAddr) -> Result<()> {
    let result = match addr {
        SocketAddr::V4(v4) => {
            let sockaddr = sockaddr_in_from(v4);
            unsafe {
                libc::bind(
                    fd,
                    &sockaddr as *const libc::sockaddr_in as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                )
            }
        }
        SocketAddr::V6(v6) => {
            let sockaddr = sockaddr_in6_from(v6);
            unsafe {
                libc::bind(
                    fd,
                    &sockaddr as *const libc::sockaddr_in6 as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
                )
            }
        }
    };
    if result < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

#[cfg(unix)]
fn connect_raw(fd: libc::c_int, addr: SocketAddr) -> Result<()> {
    let result = match addr {
        SocketAddr::V4(v4) => {
            let sockaddr = sockaddr_in_from(v4);
            unsafe {
                libc::connect(
                    fd,
                    &sockaddr as *const libc::sockaddr_in as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                )
            }
        }
        SocketAddr::V6(v6) => {
            let sockaddr = sockaddr_in6_from(v6);
            unsafe {
                libc::connect(
                    fd,
                    &sockaddr as *const libc::sockaddr_in6 as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
                )
            }
        }
    };
    if result < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

#[cfg(unix)]
fn sockaddr_in_from(addr: SocketAddrV4) -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: addr.port().to_be(),
        sin_addr: libc::in_addr { s_addr: u32::from_ne_bytes(addr.ip().octets()) },
        sin_zero: [0; 8],
        ..unsafe { std::mem::zeroed() }
    }
}

#[cfg(unix)]
fn sockaddr_in6_from(addr: SocketAddrV6) -> libc::sockaddr_in6 {
    libc::sockaddr_in6 {
        sin6_family: libc::AF_INET6 as libc::sa_family_t,
        sin6_port: addr.port().to_be(),
        sin6_flowinfo: addr.flowinfo(),
        sin6_addr: libc::in6_addr { s6_addr: addr.ip().octets() },
        sin6_scope_id: addr.scope_id(),
        ..unsafe { std::mem::zeroed() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_and_round_trip_bytes() {
        let listener = ListeningSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();

        let client_handle = std::thread::spawn(move || {
            let mut client = ConnectedSocket::connect(addr).unwrap();
            client.write_all(b"ping").unwrap();
            let mut buf = [0u8; 4];
            client.read(&mut buf).unwrap();
            buf
        });

        let (mut server, _) = listener.accept().unwrap();
        let mut buf = [0u8; 4];
        let n = server.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
        server.write_all(b"pong").unwrap();

        assert_eq!(&client_handle.join().unwrap(), b"pong");
    }

    #[test]
    #[cfg(unix)]
    fn connect_from_binds_the_given_local_endpoint() {
        // Reserve a local port, then free it; connect_from should rebind it.
        let probe = TcpListener::bind("127.0.0.1:0").unwrap();
        let local_addr = probe.local_addr().unwrap();
        drop(probe);

        let listener = ListeningSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let server_addr = listener.local_addr().unwrap();

        let client_handle = std::thread::spawn(move || ConnectedSocket::connect_from(local_addr, server_addr).unwrap());

        let (_server_socket, peer_addr) = listener.accept().unwrap();
        let _client = client_handle.join().unwrap();
        assert_eq!(peer_addr, local_addr);
    }
}
