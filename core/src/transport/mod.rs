//! Transport Module
//!
//! Session protocol over unreliable datagrams: backends, wire framing,
//! connection table, dispatcher and the driver tying them together.

pub mod connection;
pub mod dispatcher;
pub mod driver;
pub mod ipc;
pub mod packet;
pub mod udp;

use std::io::IoSlice;

use crate::data_stream::DataStreamWriter;
use crate::endpoint::{NetworkEndPoint, NetworkFamily};
use crate::error::Result;

// Re-exports for convenience
pub use connection::{Connection, ConnectionState, ConnectionTable, NetworkConnection};
pub use driver::{ConcurrentDriver, DriverStatistics, NetworkDriver};
pub use ipc::{IpcHub, IpcNetworkInterface};
pub use packet::{Header, PacketError, PacketType, MAX_PAYLOAD_SIZE, MTU};
pub use udp::UdpNetworkInterface;

/// Receive slot size. The spare byte makes datagrams longer than the MTU
/// show up as `MTU + 1` bytes instead of being silently cut to a valid size.
pub const RECEIVE_SLOT_SIZE: usize = MTU + 1;

/// Datagram backend used by the driver
///
/// Every method takes `&self`: sends may come from several threads through
/// a [`ConcurrentDriver`], and the receive step may run on a blocking task.
pub trait NetworkInterface: Send + Sync {
    /// Family of endpoints this backend can address
    fn family(&self) -> NetworkFamily;

    /// Bind to a local endpoint. Binding twice is an error.
    fn bind(&self, endpoint: &NetworkEndPoint) -> Result<()>;

    fn local_endpoint(&self) -> Option<NetworkEndPoint>;

    /// Send one datagram gathered from `iov`. Returns bytes handed to the
    /// backend.
    fn send_message(&self, iov: &[IoSlice<'_>], to: &NetworkEndPoint) -> Result<usize>;

    /// Read datagrams into `batch` until nothing is pending or the batch is
    /// full. Returns the number of datagrams read.
    fn receive(&self, batch: &mut ReceiveBatch) -> Result<usize>;

    /// Push out sends the backend buffered. Called at the start of each tick.
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// One raw datagram inside a [`ReceiveBatch`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceivedDatagram {
    pub from: NetworkEndPoint,
    pub offset: usize,
    pub len: usize,
}

/// Datagrams read during one tick, stored back to back in one stream
///
/// Data events point into this stream, so it lives until the next tick
/// clears it.
#[derive(Debug, Default)]
pub struct ReceiveBatch {
    stream: DataStreamWriter,
    datagrams: Vec<ReceivedDatagram>,
}

impl ReceiveBatch {
    /// `capacity == 0` makes the stream grow on demand
    pub fn new(capacity: usize) -> Self {
        ReceiveBatch {
            stream: DataStreamWriter::new(capacity),
            datagrams: Vec::new(),
        }
    }

    pub fn stream(&self) -> &DataStreamWriter {
        &self.stream
    }

    pub fn datagrams(&self) -> &[ReceivedDatagram] {
        &self.datagrams
    }

    pub fn clear(&mut self) {
        self.stream.clear();
        self.datagrams.clear();
    }

    /// Space for one more datagram, or `None` when a fixed stream is full
    pub fn slot(&mut self) -> Option<&mut [u8]> {
        self.stream.reserve_tail(RECEIVE_SLOT_SIZE)
    }

    /// Accept `len` bytes written into the last [`slot`](Self::slot)
    pub fn push(&mut self, from: NetworkEndPoint, len: usize) -> Result<()> {
        let offset = self.stream.length();
        self.stream.commit(len)?;
        self.datagrams.push(ReceivedDatagram { from, offset, len });
        Ok(())
    }

    /// Raw bytes of one datagram
    pub fn bytes(&self, datagram: &ReceivedDatagram) -> &[u8] {
        &self.stream.as_slice()[datagram.offset..datagram.offset + datagram.len]
    }
}
