use socket2::{Domain, Protocol, SockAddr, SockRef, Socket, Type};
use std::io::{self, IoSlice};
use std::net::{SocketAddr, UdpSocket};
use std::sync::OnceLock;

use super::{NetworkInterface, ReceiveBatch};
use crate::endpoint::{NetworkEndPoint, NetworkFamily};
use crate::error::{NetworkError, Result};

/// Non-blocking UDP/IPv4 backend.
/// The socket is configured through socket2 and used as a std `UdpSocket`.
#[derive(Debug)]
pub struct UdpNetworkInterface {
    bound: OnceLock<BoundSocket>,
    receive_buffer_size: usize,
    send_buffer_size: usize,
}

/// Socket plus the address the OS actually assigned, resolved once at bind
#[derive(Debug)]
struct BoundSocket {
    socket: UdpSocket,
    local: NetworkEndPoint,
}

impl UdpNetworkInterface {
    pub fn new(receive_buffer_size: usize, send_buffer_size: usize) -> Self {
        UdpNetworkInterface {
            bound: OnceLock::new(),
            receive_buffer_size,
            send_buffer_size,
        }
    }

    fn socket(&self) -> Result<&UdpSocket> {
        self.bound
            .get()
            .map(|b| &b.socket)
            .ok_or(NetworkError::NotBound)
    }

    fn open(&self, addr: SocketAddr) -> io::Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;

        // Kernel may clamp these; a refusal is not fatal.
        if let Err(e) = socket.set_recv_buffer_size(self.receive_buffer_size) {
            tracing::warn!("Could not set UDP receive buffer size: {}", e);
        }
        if let Err(e) = socket.set_send_buffer_size(self.send_buffer_size) {
            tracing::warn!("Could not set UDP send buffer size: {}", e);
        }

        socket.bind(&addr.into())?;
        Ok(socket.into())
    }
}

impl Default for UdpNetworkInterface {
    fn default() -> Self {
        Self::new(256 * 1024, 256 * 1024)
    }
}

impl NetworkInterface for UdpNetworkInterface {
    fn family(&self) -> NetworkFamily {
        NetworkFamily::UdpIpv4
    }

    fn bind(&self, endpoint: &NetworkEndPoint) -> Result<()> {
        if let Some(bound) = self.local_endpoint() {
            return Err(NetworkError::AlreadyBound(bound.to_string()));
        }
        let addr = endpoint.socket_addr().ok_or(NetworkError::FamilyMismatch {
            expected: NetworkFamily::UdpIpv4,
            actual: endpoint.family(),
        })?;

        let socket = self.open(addr)?;
        let local = NetworkEndPoint::from_socket_addr(socket.local_addr()?)?;
        self.bound
            .set(BoundSocket { socket, local })
            .map_err(|_| NetworkError::AlreadyBound(local.to_string()))?;
        tracing::info!("UDP interface bound to {}", local);
        Ok(())
    }

    fn local_endpoint(&self) -> Option<NetworkEndPoint> {
        self.bound.get().map(|b| b.local)
    }

    fn send_message(&self, iov: &[IoSlice<'_>], to: &NetworkEndPoint) -> Result<usize> {
        let socket = self.socket()?;
        let addr = to.socket_addr().ok_or(NetworkError::FamilyMismatch {
            expected: NetworkFamily::UdpIpv4,
            actual: to.family(),
        })?;

        match SockRef::from(socket).send_to_vectored(iov, &SockAddr::from(addr)) {
            Ok(sent) => Ok(sent),
            // A full send buffer drops the datagram, as the network would.
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                tracing::warn!("UDP send buffer full, dropping datagram to {}", addr);
                Ok(0)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn receive(&self, batch: &mut ReceiveBatch) -> Result<usize> {
        let socket = self.socket()?;
        let mut count = 0;

        loop {
            let Some(buf) = batch.slot() else {
                tracing::debug!("Receive buffer full after {} datagrams", count);
                break;
            };

            match socket.recv_from(buf) {
                Ok((len, from)) => {
                    let Ok(endpoint) = NetworkEndPoint::from_socket_addr(from) else {
                        continue;
                    };
                    batch.push(endpoint, len)?;
                    count += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // ICMP port-unreachable surfaces here on some platforms
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                    tracing::trace!("Ignoring connection reset on UDP socket");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(count)
    }
}
