//! In-Process Transport
//!
//! Loopback backend for tests and tooling. Every [`IpcHub`] is an isolated
//! "network": endpoints are mailbox slots in a shared [`MultiQueue`], and
//! sending copies the datagram into the destination's mailbox.

use bytes::{Bytes, BytesMut};
use std::io::IoSlice;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use super::packet::MTU;
use super::{NetworkInterface, ReceiveBatch};
use crate::endpoint::{IpcSlotAllocator, NetworkEndPoint, NetworkFamily};
use crate::error::{NetworkError, Result};
use crate::multi_queue::MultiQueue;

/// Initial mailbox size per slot
const MAILBOX_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
struct IpcDatagram {
    from: NetworkEndPoint,
    payload: Bytes,
}

#[derive(Debug)]
struct HubState {
    slots: IpcSlotAllocator,
    mailboxes: MultiQueue<IpcDatagram>,
}

/// Shared registry of IPC slots and their mailboxes. Clones share state.
#[derive(Debug, Clone)]
pub struct IpcHub {
    state: Arc<Mutex<HubState>>,
}

impl Default for IpcHub {
    fn default() -> Self {
        Self::new()
    }
}

impl IpcHub {
    pub fn new() -> Self {
        IpcHub {
            state: Arc::new(Mutex::new(HubState {
                slots: IpcSlotAllocator::new(),
                mailboxes: MultiQueue::new(4, MAILBOX_CAPACITY),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a fresh endpoint to bind an [`IpcNetworkInterface`] to
    pub fn create_endpoint(&self) -> NetworkEndPoint {
        self.lock().slots.allocate()
    }

    /// Free an endpoint's slot and drop its queued datagrams
    pub fn release_endpoint(&self, endpoint: &NetworkEndPoint) -> bool {
        let mut state = self.lock();
        if !state.slots.release(endpoint) {
            return false;
        }
        if let NetworkEndPoint::Ipc { slot, .. } = endpoint {
            state.mailboxes.clear(*slot as usize);
        }
        true
    }

    pub fn is_live(&self, endpoint: &NetworkEndPoint) -> bool {
        self.lock().slots.is_live(endpoint)
    }

    /// Datagrams waiting for `endpoint`
    pub fn pending(&self, endpoint: &NetworkEndPoint) -> usize {
        match endpoint {
            NetworkEndPoint::Ipc { slot, .. } => self.lock().mailboxes.len(*slot as usize),
            _ => 0,
        }
    }

    /// Throw away everything queued for `endpoint`, as a lossy network
    /// would. Returns the number of datagrams lost.
    pub fn discard_pending(&self, endpoint: &NetworkEndPoint) -> usize {
        let NetworkEndPoint::Ipc { slot, .. } = *endpoint else {
            return 0;
        };
        let mut state = self.lock();
        if !state.slots.is_live(endpoint) {
            return 0;
        }
        let lost = state.mailboxes.len(slot as usize);
        state.mailboxes.clear(slot as usize);
        lost
    }

    fn deliver(&self, to: &NetworkEndPoint, datagram: IpcDatagram) -> bool {
        let mut state = self.lock();
        match *to {
            NetworkEndPoint::Ipc { slot, .. } if state.slots.is_live(to) => {
                state.mailboxes.enqueue(slot as usize, datagram);
                true
            }
            _ => false,
        }
    }
}

/// Backend that sends through an [`IpcHub`]
///
/// Outgoing datagrams are buffered and handed to the hub on
/// [`flush`](NetworkInterface::flush), i.e. at the start of the next tick.
#[derive(Debug)]
pub struct IpcNetworkInterface {
    hub: IpcHub,
    local: OnceLock<NetworkEndPoint>,
    outbox: Mutex<Vec<(NetworkEndPoint, Bytes)>>,
}

impl IpcNetworkInterface {
    pub fn new(hub: IpcHub) -> Self {
        IpcNetworkInterface {
            hub,
            local: OnceLock::new(),
            outbox: Mutex::new(Vec::new()),
        }
    }

    pub fn hub(&self) -> &IpcHub {
        &self.hub
    }

    fn local(&self) -> Result<NetworkEndPoint> {
        self.local.get().copied().ok_or(NetworkError::NotBound)
    }
}

impl NetworkInterface for IpcNetworkInterface {
    fn family(&self) -> NetworkFamily {
        NetworkFamily::Ipc
    }

    fn bind(&self, endpoint: &NetworkEndPoint) -> Result<()> {
        if let Some(bound) = self.local.get() {
            return Err(NetworkError::AlreadyBound(bound.to_string()));
        }
        if endpoint.family() != NetworkFamily::Ipc {
            return Err(NetworkError::FamilyMismatch {
                expected: NetworkFamily::Ipc,
                actual: endpoint.family(),
            });
        }
        if !self.hub.is_live(endpoint) {
            return Err(NetworkError::InvalidEndPoint(format!(
                "{} was not issued by this hub or has been released",
                endpoint
            )));
        }
        self.local
            .set(*endpoint)
            .map_err(|bound| NetworkError::AlreadyBound(bound.to_string()))?;
        tracing::info!("IPC interface bound to {}", endpoint);
        Ok(())
    }

    fn local_endpoint(&self) -> Option<NetworkEndPoint> {
        self.local.get().copied()
    }

    fn send_message(&self, iov: &[IoSlice<'_>], to: &NetworkEndPoint) -> Result<usize> {
        self.local()?;
        if to.family() != NetworkFamily::Ipc {
            return Err(NetworkError::FamilyMismatch {
                expected: NetworkFamily::Ipc,
                actual: to.family(),
            });
        }

        let size: usize = iov.iter().map(|s| s.len()).sum();
        if size > MTU {
            return Err(NetworkError::PayloadTooLarge { size, max: MTU });
        }
        let mut payload = BytesMut::with_capacity(size);
        for slice in iov {
            payload.extend_from_slice(slice);
        }

        self.outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((*to, payload.freeze()));
        Ok(size)
    }

    fn receive(&self, batch: &mut ReceiveBatch) -> Result<usize> {
        let NetworkEndPoint::Ipc { slot, .. } = self.local()? else {
            return Err(NetworkError::NotBound);
        };
        let bucket = slot as usize;
        let mut state = self.hub.lock();
        let mut count = 0;

        while !state.mailboxes.is_empty(bucket) {
            let Some(buf) = batch.slot() else {
                break;
            };
            let Some(datagram) = state.mailboxes.dequeue(bucket) else {
                break;
            };
            let len = datagram.payload.len();
            buf[..len].copy_from_slice(&datagram.payload);
            batch.push(datagram.from, len)?;
            count += 1;
        }

        Ok(count)
    }

    fn flush(&self) -> Result<()> {
        let Some(from) = self.local.get().copied() else {
            return Ok(());
        };
        let pending = {
            let mut outbox = self.outbox.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *outbox)
        };
        for (to, payload) in pending {
            // Unknown or released destinations lose the datagram.
            if !self.hub.deliver(&to, IpcDatagram { from, payload }) {
                tracing::trace!("Dropping IPC datagram to dead endpoint {}", to);
            }
        }
        Ok(())
    }
}

impl Drop for IpcNetworkInterface {
    fn drop(&mut self) {
        // Sends made right before the drop (e.g. a Disconnect) still go out.
        if let Err(e) = self.flush() {
            tracing::warn!("Failed to flush IPC outbox on drop: {}", e);
        }
        if let Some(local) = self.local.get() {
            self.hub.release_endpoint(local);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bound(hub: &IpcHub) -> IpcNetworkInterface {
        let iface = IpcNetworkInterface::new(hub.clone());
        iface.bind(&hub.create_endpoint()).unwrap();
        iface
    }

    #[test]
    fn test_send_receive_after_flush() {
        let hub = IpcHub::new();
        let a = bound(&hub);
        let b = bound(&hub);
        let b_addr = b.local_endpoint().unwrap();

        a.send_message(&[IoSlice::new(b"he"), IoSlice::new(b"llo")], &b_addr)
            .unwrap();
        assert_eq!(hub.pending(&b_addr), 0);
        a.flush().unwrap();
        assert_eq!(hub.pending(&b_addr), 1);

        let mut batch = ReceiveBatch::new(0);
        assert_eq!(b.receive(&mut batch).unwrap(), 1);
        let datagram = batch.datagrams()[0];
        assert_eq!(batch.bytes(&datagram), b"hello");
        assert_eq!(Some(datagram.from), a.local_endpoint());
    }

    #[test]
    fn test_drop_flushes_outbox() {
        let hub = IpcHub::new();
        let a = bound(&hub);
        let b = bound(&hub);
        let b_addr = b.local_endpoint().unwrap();

        a.send_message(&[IoSlice::new(b"bye")], &b_addr).unwrap();
        drop(a);
        assert_eq!(hub.pending(&b_addr), 1);
        assert_eq!(hub.discard_pending(&b_addr), 1);
        assert_eq!(hub.pending(&b_addr), 0);
    }

    #[test]
    fn test_released_slot_drops_traffic() {
        let hub = IpcHub::new();
        let a = bound(&hub);
        let b = bound(&hub);
        let stale = b.local_endpoint().unwrap();
        drop(b);
        assert!(!hub.is_live(&stale));

        // Slot is reused under a new generation; old address must not reach it.
        let c = bound(&hub);
        assert_ne!(c.local_endpoint(), Some(stale));
        a.send_message(&[IoSlice::new(b"x")], &stale).unwrap();
        a.flush().unwrap();

        let mut batch = ReceiveBatch::new(0);
        assert_eq!(c.receive(&mut batch).unwrap(), 0);
    }

    #[test]
    fn test_fixed_batch_leaves_rest_queued() {
        let hub = IpcHub::new();
        let a = bound(&hub);
        let b = bound(&hub);
        let b_addr = b.local_endpoint().unwrap();
        for _ in 0..3 {
            a.send_message(&[IoSlice::new(&[7u8; 10])], &b_addr).unwrap();
        }
        a.flush().unwrap();

        let mut batch = ReceiveBatch::new(MTU + 5);
        assert_eq!(b.receive(&mut batch).unwrap(), 1);
        assert_eq!(hub.pending(&b_addr), 2);
    }

    #[test]
    fn test_bind_rules() {
        let hub = IpcHub::new();
        let other = IpcHub::new();
        let iface = IpcNetworkInterface::new(hub.clone());

        let _ = other.create_endpoint();
        let foreign = other.create_endpoint();
        assert!(iface.bind(&foreign).is_err());
        assert!(iface.bind(&NetworkEndPoint::parse_udp("127.0.0.1:1").unwrap()).is_err());

        let ep = hub.create_endpoint();
        iface.bind(&ep).unwrap();
        assert!(matches!(
            iface.bind(&hub.create_endpoint()),
            Err(NetworkError::AlreadyBound(_))
        ));
        assert!(iface
            .send_message(&[IoSlice::new(&[0u8; MTU + 1])], &ep)
            .is_err());
    }
}
