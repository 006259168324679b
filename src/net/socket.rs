//! Dual-stack TCP sockets built on the reactor's awaitable syscalls.
//!
//! Grounded on `examples/original_source/src/async_socket.cc` and
//! `connect_operation.cc`: `ListeningSocket::setupListener` (IPv6 dual
//! stack, `SO_REUSEADDR`, bind/listen), `ConnectingSocket::connect` (connect
//! on a fresh `PF_INET6` socket, then a `getpeername` probe once writable —
//! an `ENOTCONN` there means the connect actually failed, surfaced by a
//! one-byte `read` that picks up the pending error), and
//! `AsyncSocket::{recv,send}` (loop until the requested length is filled or
//! the peer closes).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::io::{IntoRawFd, RawFd};

use nix::errno::Errno;
use nix::sys::socket::{SockaddrIn6, SockaddrLike};
use socket2::{Domain, Socket, Type};

use crate::reactor::{fd::FileDescriptor, ops, Interest, Reactor};

const DEFAULT_LISTEN_BACKLOG: i32 = 8;

/// Converts any [`SocketAddr`] to its IPv4-mapped IPv6 form, since every
/// socket in this crate is `PF_INET6` (spec §4.5).
fn to_v6(addr: SocketAddr) -> std::net::SocketAddrV6 {
    match addr {
        SocketAddr::V6(v6) => v6,
        SocketAddr::V4(v4) => {
            let mapped = v4.ip().to_ipv6_mapped();
            std::net::SocketAddrV6::new(mapped, v4.port(), 0, 0)
        }
    }
}

fn v6_to_peer_addr(addr: &SockaddrIn6) -> IpAddr {
    let octets = addr.ip().octets();
    let v6 = Ipv6Addr::from(octets);
    match v6.to_ipv4_mapped() {
        Some(v4) => IpAddr::V4(v4),
        None => IpAddr::V6(v6),
    }
}

fn set_nonblocking(raw: RawFd) -> Result<(), Errno> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};
    let flags = OFlag::from_bits_truncate(fcntl(raw, FcntlArg::F_GETFL)?);
    fcntl(raw, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

/// A bound, listening socket accepting incoming peer connections.
pub struct ListeningSocket {
    handle: FileDescriptor,
}

impl ListeningSocket {
    /// Binds `[::]:port` with `IPV6_V6ONLY` disabled so IPv4 peers connect
    /// via their IPv4-mapped IPv6 address, and `SO_REUSEADDR` so a restart
    /// doesn't fail on a lingering `TIME_WAIT` socket.
    pub fn bind(port: u16, reactor: &Reactor) -> Result<Self, Errno> {
        let socket = Socket::new(Domain::IPV6, Type::STREAM, None).map_err(io_to_errno)?;
        socket.set_only_v6(false).map_err(io_to_errno)?;
        socket.set_reuse_address(true).map_err(io_to_errno)?;
        let addr: SocketAddr = (Ipv6Addr::UNSPECIFIED, port).into();
        socket.bind(&addr.into()).map_err(io_to_errno)?;
        socket.listen(DEFAULT_LISTEN_BACKLOG).map_err(io_to_errno)?;
        socket.set_nonblocking(true).map_err(io_to_errno)?;

        let raw = socket.into_raw_fd();
        let handle = FileDescriptor::from_raw(raw);
        reactor.attach(handle.clone(), Interest::ReadOnly)?;
        Ok(Self { handle })
    }

    pub async fn accept(&self, reactor: &Reactor) -> Result<ConnectedSocket, Errno> {
        let raw = ops::accept(&self.handle).await?;
        let handle = FileDescriptor::from_raw(raw);
        reactor.attach(handle.clone(), Interest::ReadWrite)?;
        Ok(ConnectedSocket { handle })
    }

    /// The address actually bound, including the OS-assigned port when
    /// [`bind`](ListeningSocket::bind) was called with port `0` — used by
    /// tests that need an ephemeral port to avoid colliding with a real
    /// `shared-state` daemon.
    pub fn local_addr(&self) -> Result<SocketAddr, Errno> {
        let addr = nix::sys::socket::getsockname::<SockaddrIn6>(self.handle.raw_fd())?;
        Ok(SocketAddr::new(v6_to_peer_addr(&addr), addr.port()))
    }

    pub async fn close(self, reactor: &Reactor) -> Result<(), Errno> {
        reactor.close_a_fd(&self.handle).await
    }
}

/// A socket mid-handshake of a non-blocking `connect(2)`.
pub struct ConnectingSocket {
    handle: FileDescriptor,
}

impl ConnectingSocket {
    /// Issues a non-blocking connect to `addr`, suspends until writable,
    /// then confirms success with a `getpeername` probe (spec §4.5).
    pub async fn connect(addr: SocketAddr, reactor: &Reactor) -> Result<ConnectedSocket, Errno> {
        let raw = unsafe { libc::socket(libc::PF_INET6, libc::SOCK_STREAM, 0) };
        if raw < 0 {
            return Err(Errno::last());
        }
        set_nonblocking(raw)?;
        let handle = FileDescriptor::from_raw(raw);
        reactor.attach(handle.clone(), Interest::WriteOnly)?;

        let target = SockaddrIn6::from(to_v6(addr));
        ops::connect(&handle, &target).await?;

        let connecting = Self { handle };
        connecting.confirm_connected(reactor).await
    }

    async fn confirm_connected(self, reactor: &Reactor) -> Result<ConnectedSocket, Errno> {
        match nix::sys::socket::getpeername::<SockaddrIn6>(self.handle.raw_fd()) {
            Ok(_) => {
                reactor.watch_read(self.handle.raw_fd());
                Ok(ConnectedSocket { handle: self.handle })
            }
            Err(Errno::ENOTCONN) => {
                let mut discard = [0u8; 1];
                let read_err = match nix::unistd::read(self.handle.raw_fd(), &mut discard) {
                    Ok(_) => Errno::ECONNREFUSED,
                    Err(e) => e,
                };
                reactor.close_a_fd(&self.handle).await.ok();
                Err(read_err)
            }
            Err(e) => {
                reactor.close_a_fd(&self.handle).await.ok();
                Err(e)
            }
        }
    }
}

/// An established, bidirectional connection.
pub struct ConnectedSocket {
    handle: FileDescriptor,
}

impl ConnectedSocket {
    /// Reads until `buf` is filled or the peer closes (a `0`-length read),
    /// returning the number of bytes actually filled (spec §4.5).
    pub async fn recv(&self, buf: &mut [u8]) -> Result<usize, Errno> {
        let mut total = 0;
        while total < buf.len() {
            let n = ops::recv(&self.handle, &mut buf[total..]).await?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    pub async fn send(&self, buf: &[u8]) -> Result<usize, Errno> {
        let mut total = 0;
        while total < buf.len() {
            let n = ops::send(&self.handle, &buf[total..]).await?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    pub fn peer_addr(&self) -> Result<IpAddr, Errno> {
        let addr = nix::sys::socket::getpeername::<SockaddrIn6>(self.handle.raw_fd())?;
        Ok(v6_to_peer_addr(&addr))
    }

    pub async fn close(self, reactor: &Reactor) -> Result<(), Errno> {
        reactor.close_a_fd(&self.handle).await
    }
}

fn io_to_errno(e: std::io::Error) -> Errno {
    e.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_address_maps_to_ipv6() {
        let v4: SocketAddr = (Ipv4Addr::new(192, 168, 1, 1), 3490).into();
        let mapped = to_v6(v4);
        assert!(mapped.ip().to_ipv4_mapped().is_some());
        assert_eq!(mapped.port(), 3490);
    }

    #[test]
    fn ipv6_mapped_address_recovers_ipv4() {
        let mapped = Ipv4Addr::new(10, 1, 2, 3).to_ipv6_mapped();
        let target = SockaddrIn6::from(std::net::SocketAddrV6::new(mapped, 3490, 0, 0));
        let recovered = v6_to_peer_addr(&target);
        assert_eq!(recovered, IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)));
    }
}
