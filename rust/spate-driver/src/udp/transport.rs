//! Non-blocking UDP socket wrapper.
//!
//! Sockets are always non-blocking; readiness comes from the
//! [`TransportPoller`](crate::udp::TransportPoller). A send that would
//! block is reported as a short send, never waited on.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};

use crate::udp::channel::UdpChannel;

/// A bound UDP socket for one channel endpoint.
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Socket for a receive endpoint: bind the channel's data address and
    /// join the group when multicast.
    pub fn for_receive(channel: &UdpChannel, rcvbuf: usize) -> io::Result<Self> {
        let bind_addr = channel
            .bind_addr()
            .map_err(|e| io::Error::other(e.to_string()))?;

        let socket = if channel.is_multicast {
            let socket = bind_reuse(bind_addr)?;
            match (bind_addr.ip(), Ipv4Addr::UNSPECIFIED) {
                (std::net::IpAddr::V4(group), interface) => {
                    socket.join_multicast_v4(&group, &interface)?;
                }
                (std::net::IpAddr::V6(group), _) => {
                    socket.join_multicast_v6(&group, 0)?;
                }
            }
            socket
        } else {
            UdpSocket::bind(bind_addr)?
        };

        socket.set_nonblocking(true)?;
        set_buffer_length(socket.as_raw_fd(), libc::SO_RCVBUF, rcvbuf)?;
        Ok(Self { socket })
    }

    /// Socket for a send endpoint: ephemeral local bind; TTL applied for
    /// multicast channels.
    pub fn for_send(channel: &UdpChannel, sndbuf: usize) -> io::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_nonblocking(true)?;
        set_buffer_length(socket.as_raw_fd(), libc::SO_SNDBUF, sndbuf)?;
        if channel.is_multicast && channel.ttl > 0 {
            socket.set_multicast_ttl_v4(channel.ttl as u32)?;
        }
        Ok(Self { socket })
    }

    /// Send one datagram; `Ok(None)` means the socket would block (short
    /// send).
    pub fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<Option<usize>> {
        match self.socket.send_to(buf, addr) {
            Ok(sent) => Ok(Some(sent)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Receive one datagram; `Ok(None)` when nothing is queued.
    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.socket.recv_from(buf) {
            Ok((length, addr)) => Ok(Some((length, addr))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// The locally bound address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

/// Bind with SO_REUSEADDR so several receivers can join the same group.
fn bind_reuse(addr: SocketAddr) -> io::Result<UdpSocket> {
    let domain = if addr.is_ipv4() { libc::AF_INET } else { libc::AF_INET6 };
    let fd = unsafe { libc::socket(domain, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let one: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const libc::c_void,
            core::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }

    let socket = unsafe { <UdpSocket as std::os::unix::io::FromRawFd>::from_raw_fd(fd) };
    bind_fd(&socket, addr)?;
    Ok(socket)
}

fn bind_fd(socket: &UdpSocket, addr: SocketAddr) -> io::Result<()> {
    match addr {
        SocketAddr::V4(v4) => {
            let sockaddr = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr { s_addr: u32::from_ne_bytes(v4.ip().octets()) },
                sin_zero: [0; 8],
            };
            let rc = unsafe {
                libc::bind(
                    socket.as_raw_fd(),
                    &sockaddr as *const _ as *const libc::sockaddr,
                    core::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                )
            };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        SocketAddr::V6(_) => {
            return Err(io::Error::other("ipv6 multicast bind not supported"));
        }
    }
    Ok(())
}

fn set_buffer_length(fd: RawFd, option: libc::c_int, length: usize) -> io::Result<()> {
    if length == 0 {
        return Ok(());
    }
    let value = length as libc::c_int;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            option,
            &value as *const _ as *const libc::c_void,
            core::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uri::ChannelUri;

    fn channel(uri: &str) -> UdpChannel {
        UdpChannel::from_uri(&ChannelUri::parse(uri).unwrap()).unwrap()
    }

    #[test]
    fn unicast_send_receive() {
        let receive =
            UdpTransport::for_receive(&channel("spate:udp?endpoint=127.0.0.1:0"), 64 * 1024);
        // Port 0 binds an ephemeral port.
        let receive = receive.unwrap();
        let addr = receive.local_addr().unwrap();

        let send = UdpTransport::for_send(
            &channel(&format!("spate:udp?endpoint={addr}")),
            64 * 1024,
        )
        .unwrap();

        assert_eq!(send.send_to(b"datagram", addr).unwrap(), Some(8));

        // Non-blocking: spin briefly until the datagram lands.
        let mut buf = [0u8; 64];
        let mut received = None;
        for _ in 0..1000 {
            if let Some((length, from)) = receive.recv_from(&mut buf).unwrap() {
                received = Some((length, from));
                break;
            }
            std::thread::yield_now();
        }
        let (length, _) = received.expect("datagram not delivered");
        assert_eq!(&buf[..length], b"datagram");
    }

    #[test]
    fn empty_socket_returns_none() {
        let receive =
            UdpTransport::for_receive(&channel("spate:udp?endpoint=127.0.0.1:0"), 0).unwrap();
        let mut buf = [0u8; 64];
        assert!(receive.recv_from(&mut buf).unwrap().is_none());
    }
}
