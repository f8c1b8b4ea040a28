//! Network Endpoints
//!
//! A single address type for both backends: a UDP/IPv4 socket address or an
//! in-process IPC slot stamped with a generation.

use std::collections::VecDeque;
use std::fmt;
use std::net::{SocketAddr, SocketAddrV4};

use crate::error::{NetworkError, Result};

/// Address family of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NetworkFamily {
    Invalid = 0,
    UdpIpv4 = 1,
    Ipc = 2,
}

/// Remote or local address understood by a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NetworkEndPoint {
    #[default]
    Invalid,
    UdpIpv4(SocketAddrV4),
    /// In-process mailbox. Same slot with a different generation is a
    /// different endpoint.
    Ipc { slot: u32, generation: u16 },
}

impl NetworkEndPoint {
    pub fn udp(addr: SocketAddrV4) -> Self {
        NetworkEndPoint::UdpIpv4(addr)
    }

    /// Build from an OS socket address. Only IPv4 is supported.
    pub fn from_socket_addr(addr: SocketAddr) -> Result<Self> {
        match addr {
            SocketAddr::V4(v4) => Ok(NetworkEndPoint::UdpIpv4(v4)),
            SocketAddr::V6(v6) => Err(NetworkError::InvalidEndPoint(format!(
                "IPv6 address {} is not supported",
                v6
            ))),
        }
    }

    /// Parse `"a.b.c.d:port"`
    pub fn parse_udp(s: &str) -> Result<Self> {
        let addr: SocketAddr = s
            .parse()
            .map_err(|_| NetworkError::InvalidEndPoint(format!("Cannot parse {:?}", s)))?;
        Self::from_socket_addr(addr)
    }

    pub fn family(&self) -> NetworkFamily {
        match self {
            NetworkEndPoint::Invalid => NetworkFamily::Invalid,
            NetworkEndPoint::UdpIpv4(_) => NetworkFamily::UdpIpv4,
            NetworkEndPoint::Ipc { .. } => NetworkFamily::Ipc,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.family() != NetworkFamily::Invalid
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            NetworkEndPoint::UdpIpv4(addr) => Some(SocketAddr::V4(*addr)),
            _ => None,
        }
    }
}

impl fmt::Display for NetworkEndPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkEndPoint::Invalid => write!(f, "invalid"),
            NetworkEndPoint::UdpIpv4(addr) => write!(f, "udp://{}", addr),
            NetworkEndPoint::Ipc { slot, generation } => {
                write!(f, "ipc://{}#{}", slot, generation)
            }
        }
    }
}

/// Hands out IPC slots and stamps them with a generation
///
/// Releasing a slot bumps its generation (wrapping to 1, never 0), so
/// endpoints captured before the release never equal the reused slot.
#[derive(Debug, Default)]
pub struct IpcSlotAllocator {
    generations: Vec<u16>,
    in_use: Vec<bool>,
    free: VecDeque<u32>,
}

impl IpcSlotAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a slot, reusing released ones first
    pub fn allocate(&mut self) -> NetworkEndPoint {
        let slot = match self.free.pop_front() {
            Some(slot) => slot,
            None => {
                self.generations.push(1);
                self.in_use.push(false);
                (self.generations.len() - 1) as u32
            }
        };
        self.in_use[slot as usize] = true;
        NetworkEndPoint::Ipc {
            slot,
            generation: self.generations[slot as usize],
        }
    }

    /// Return a slot. Stale or foreign endpoints are ignored.
    pub fn release(&mut self, endpoint: &NetworkEndPoint) -> bool {
        if !self.is_live(endpoint) {
            return false;
        }
        if let NetworkEndPoint::Ipc { slot, .. } = *endpoint {
            let idx = slot as usize;
            self.in_use[idx] = false;
            self.generations[idx] = next_generation(self.generations[idx]);
            self.free.push_back(slot);
            return true;
        }
        false
    }

    /// True while the endpoint's slot is allocated at that generation
    pub fn is_live(&self, endpoint: &NetworkEndPoint) -> bool {
        match *endpoint {
            NetworkEndPoint::Ipc { slot, generation } => {
                let idx = slot as usize;
                idx < self.generations.len()
                    && self.in_use[idx]
                    && self.generations[idx] == generation
            }
            _ => false,
        }
    }

    pub fn live_count(&self) -> usize {
        self.in_use.iter().filter(|used| **used).count()
    }
}

fn next_generation(current: u16) -> u16 {
    match current.wrapping_add(1) {
        0 => 1,
        next => next,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_udp_equality() {
        let a = NetworkEndPoint::parse_udp("127.0.0.1:9000").unwrap();
        let b = NetworkEndPoint::udp(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9000));
        let c = NetworkEndPoint::parse_udp("127.0.0.1:9001").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.family(), NetworkFamily::UdpIpv4);
        assert!(a.is_valid());
        assert!(!NetworkEndPoint::default().is_valid());
    }

    #[test]
    fn test_ipv6_rejected() {
        let v6: SocketAddr = "[::1]:9000".parse().unwrap();
        assert!(NetworkEndPoint::from_socket_addr(v6).is_err());
        assert!(NetworkEndPoint::parse_udp("nonsense").is_err());
    }

    #[test]
    fn test_ipc_generation_bump() {
        let mut alloc = IpcSlotAllocator::new();
        let first = alloc.allocate();
        assert!(alloc.is_live(&first));
        assert!(alloc.release(&first));
        assert!(!alloc.release(&first));

        let reused = alloc.allocate();
        match (first, reused) {
            (
                NetworkEndPoint::Ipc { slot: s1, generation: g1 },
                NetworkEndPoint::Ipc { slot: s2, generation: g2 },
            ) => {
                assert_eq!(s1, s2);
                assert_ne!(g1, g2);
            }
            _ => panic!("expected IPC endpoints"),
        }
        assert_ne!(first, reused);
        assert!(!alloc.is_live(&first));
        assert_eq!(alloc.live_count(), 1);
    }

    #[test]
    fn test_generation_skips_zero() {
        assert_eq!(next_generation(u16::MAX), 1);
        assert_eq!(next_generation(1), 2);
    }
}
