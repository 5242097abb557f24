//! Shared UDP endpoint.
//!
//! All protocol conversations (handshakes, discovery, commands) run over a
//! single non-blocking UDP socket bound to an ephemeral port, with broadcast
//! enabled for discovery hellos. Rebinding to a fresh ephemeral port is part
//! of the protocol flow: it discards any stale datagrams queued from earlier
//! exchanges.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

/// Sleep granularity between non-blocking reads inside bounded poll loops.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(3);

/// The shared UDP endpoint used by sessions and connection state machines.
pub struct UdpEndpoint {
    socket: UdpSocket,
}

impl UdpEndpoint {
    /// Bind a new endpoint to an ephemeral port with broadcast enabled.
    pub fn bind() -> io::Result<Self> {
        Ok(Self {
            socket: Self::new_socket()?,
        })
    }

    fn new_socket() -> io::Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_broadcast(true)?;
        socket.set_nonblocking(true)?;
        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
        socket.bind(&SockAddr::from(bind_addr))?;
        Ok(socket.into())
    }

    /// Rebind to a fresh ephemeral port, dropping any queued datagrams.
    pub fn rebind(&mut self) -> io::Result<()> {
        self.socket = Self::new_socket()?;
        Ok(())
    }

    /// The local address the endpoint is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Send one datagram.
    pub fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(data, addr)
    }

    /// Non-blocking receive. Returns `Ok(None)` when no datagram is queued.
    pub fn poll_recv(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.socket.recv_from(buf) {
            Ok((len, src)) => Ok(Some((len, src))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_is_ephemeral_and_nonblocking() {
        let endpoint = UdpEndpoint::bind().unwrap();
        assert_ne!(endpoint.local_addr().unwrap().port(), 0);

        let mut buf = [0u8; 64];
        assert!(endpoint.poll_recv(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_rebind_changes_port_and_drops_queue() {
        let mut endpoint = UdpEndpoint::bind().unwrap();
        let first = endpoint.local_addr().unwrap();
        let reachable = SocketAddr::from(([127, 0, 0, 1], first.port()));

        // Queue a datagram, then rebind; it must not be observable afterward.
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"stale", reachable).unwrap();
        std::thread::sleep(Duration::from_millis(20));

        endpoint.rebind().unwrap();
        assert_ne!(endpoint.local_addr().unwrap(), first);
        let mut buf = [0u8; 64];
        assert!(endpoint.poll_recv(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_loopback_round_trip() {
        let endpoint = UdpEndpoint::bind().unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();

        endpoint
            .send_to(b"ping", peer.local_addr().unwrap())
            .unwrap();
        let mut buf = [0u8; 16];
        peer.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        let (len, src) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"ping");

        peer.send_to(b"pong", src).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(1);
        loop {
            if let Some((len, _)) = endpoint.poll_recv(&mut buf).unwrap() {
                assert_eq!(&buf[..len], b"pong");
                break;
            }
            assert!(std::time::Instant::now() < deadline, "no reply on loopback");
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}
