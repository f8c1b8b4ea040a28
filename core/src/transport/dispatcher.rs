//! Protocol Dispatcher
//!
//! Turns received datagrams into connection state changes and events.
//!
//! Token convention: a packet's header carries the token the *receiver*
//! assigned to the connection (our `send_token`). The one exception is
//! `ConnectionRequest`, which carries the requester's own `receive_token`
//! because nothing has been assigned yet. A set connect-token flag means the
//! sender's `receive_token` trails the payload.

use std::collections::VecDeque;
use std::io::IoSlice;
use std::sync::atomic::{AtomicU64, Ordering};

use super::connection::{Connection, ConnectionState, ConnectionTable, NetworkConnection};
use super::driver::DriverStatistics;
use super::packet::{read_token_trailer, Header, PacketType, MTU, TOKEN_SIZE};
use super::NetworkInterface;
use crate::config::NetworkConfig;
use crate::endpoint::{NetworkEndPoint, NetworkFamily};
use crate::error::Result;
use crate::event_queue::{EventQueue, NetworkEvent, NetworkEventType};

/// Next value of a wrapping 16-bit session token counter
pub(crate) fn next_token(counter: &mut u16) -> u16 {
    let token = *counter;
    *counter = counter.wrapping_add(1);
    token
}

/// Send side of the driver: the backend plus its sent-datagram counter
#[derive(Clone, Copy)]
pub(crate) struct Outbound<'a> {
    backend: &'a dyn NetworkInterface,
    sent: &'a AtomicU64,
}

impl<'a> Outbound<'a> {
    pub fn new(backend: &'a dyn NetworkInterface, sent: &'a AtomicU64) -> Self {
        Outbound { backend, sent }
    }

    pub fn family(&self) -> NetworkFamily {
        self.backend.family()
    }

    /// Gather header, payload and optional token trailer into one datagram
    pub fn packet(
        &self,
        to: &NetworkEndPoint,
        header: Header,
        payload: &[u8],
        trailer: Option<u16>,
    ) -> Result<usize> {
        let header = match trailer {
            Some(_) => header.with_connect_token(),
            None => header,
        };
        let head = header.to_bytes();
        let tail = trailer.unwrap_or(0).to_le_bytes();
        let tail_len = if trailer.is_some() { TOKEN_SIZE } else { 0 };

        let iov = [
            IoSlice::new(&head),
            IoSlice::new(payload),
            IoSlice::new(&tail[..tail_len]),
        ];
        let sent = self.backend.send_message(&iov, to)?;
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(sent)
    }

    pub fn request(&self, conn: &Connection) -> Result<usize> {
        let header = Header::new(PacketType::ConnectionRequest, conn.receive_token);
        self.packet(&conn.remote, header, &[], None)
    }

    pub fn accept(&self, conn: &Connection) -> Result<usize> {
        let header = Header::new(PacketType::ConnectionAccept, conn.send_token);
        self.packet(&conn.remote, header, &[], Some(conn.receive_token))
    }

    pub fn reject(&self, to: &NetworkEndPoint, offered_token: u16) -> Result<usize> {
        let header = Header::new(PacketType::ConnectionReject, offered_token);
        self.packet(to, header, &[], None)
    }

    pub fn disconnect(&self, conn: &Connection) -> Result<usize> {
        let header = Header::new(PacketType::Disconnect, conn.send_token);
        self.packet(&conn.remote, header, &[], None)
    }

    /// Data carries our receive token until the peer has proven it knows it
    pub fn data(&self, conn: &Connection, payload: &[u8]) -> Result<usize> {
        let header = Header::new(PacketType::Data, conn.send_token);
        let trailer = (!conn.did_receive_data).then_some(conn.receive_token);
        self.packet(&conn.remote, header, payload, trailer)
    }
}

pub(crate) fn push_event(
    events: &mut EventQueue,
    kind: NetworkEventType,
    handle: NetworkConnection,
    offset: usize,
    size: usize,
) {
    events.push_event(NetworkEvent {
        kind,
        connection_id: handle.id(),
        generation: handle.generation(),
        offset,
        size,
    });
}

/// Borrowed view of the driver state one datagram may touch
pub(crate) struct ProtocolDispatcher<'a> {
    pub table: &'a mut ConnectionTable,
    pub events: &'a mut EventQueue,
    pub accept_queue: &'a mut VecDeque<NetworkConnection>,
    pub token_counter: &'a mut u16,
    pub stats: &'a mut DriverStatistics,
    pub out: Outbound<'a>,
    pub config: &'a NetworkConfig,
    pub listening: bool,
    pub now_ms: i64,
}

impl ProtocolDispatcher<'_> {
    /// Process one datagram that sits at `offset` in the receive stream.
    /// Returns the number of events produced; malformed or unmatched
    /// packets produce none.
    pub fn append_packet(
        &mut self,
        from: &NetworkEndPoint,
        datagram: &[u8],
        offset: usize,
    ) -> Result<usize> {
        self.stats.packets_received += 1;
        self.stats.bytes_received += datagram.len() as u64;

        if from.family() != self.out.family() {
            return Ok(self.drop_packet(from, "endpoint family mismatch"));
        }
        if datagram.len() > MTU {
            return Ok(self.drop_packet(from, "datagram longer than MTU"));
        }
        let header = match Header::decode(datagram) {
            Ok(header) => header,
            Err(e) => {
                tracing::trace!("Malformed packet from {}: {}", from, e);
                return Ok(self.drop_packet(from, "malformed header"));
            }
        };
        let payload = &datagram[Header::SIZE..];

        let produced = match header.packet_type {
            PacketType::ConnectionRequest => self.on_connection_request(from, header)?,
            PacketType::ConnectionReject => self.on_connection_reject(from, header),
            PacketType::ConnectionAccept => self.on_connection_accept(from, header, payload),
            PacketType::Disconnect => self.on_disconnect(from, header),
            PacketType::Data => self.on_data(from, header, payload, offset + Header::SIZE),
        };
        self.stats.events_produced += produced as u64;
        Ok(produced)
    }

    fn on_connection_request(&mut self, from: &NetworkEndPoint, header: Header) -> Result<usize> {
        if !self.listening {
            return Ok(self.drop_packet(from, "connection request while not listening"));
        }

        // Retransmitted request: the accept was lost, send it again.
        if let Some(id) = self.table.find_by_send_token(from, header.session_token) {
            if let Some(conn) = self.table.by_id_mut(id) {
                conn.attempts += 1;
                conn.touch(self.now_ms);
                self.out.accept(conn)?;
            }
            return Ok(0);
        }

        let max = self.config.max_connections;
        if max != 0 && self.table.live_count() >= max {
            tracing::debug!("Rejecting {}: connection limit {} reached", from, max);
            self.out.reject(from, header.session_token)?;
            return Ok(0);
        }

        let receive_token = next_token(self.token_counter);
        let conn = self.table.allocate(*from, self.now_ms);
        conn.state = ConnectionState::Connected;
        conn.send_token = header.session_token;
        conn.receive_token = receive_token;
        conn.attempts = 1;
        let handle = conn.handle();
        self.out.accept(conn)?;

        tracing::debug!("Accepted connection {:?} from {}", handle, from);
        push_event(self.events, NetworkEventType::Connect, handle, 0, 0);
        self.accept_queue.push_back(handle);
        Ok(1)
    }

    fn on_connection_reject(&mut self, from: &NetworkEndPoint, header: Header) -> usize {
        let Some(id) = self.connecting_match(from, header.session_token) else {
            return self.drop_packet(from, "reject for unknown connection");
        };
        let Some(handle) = self.table.teardown(id) else {
            return 0;
        };
        tracing::debug!("Connection {:?} rejected by {}", handle, from);
        push_event(self.events, NetworkEventType::Disconnect, handle, 0, 0);
        1
    }

    fn on_connection_accept(
        &mut self,
        from: &NetworkEndPoint,
        header: Header,
        payload: &[u8],
    ) -> usize {
        if !header.has_connect_token() {
            return self.drop_packet(from, "accept without connect token");
        }
        let Ok(send_token) = read_token_trailer(payload) else {
            return self.drop_packet(from, "accept with truncated token");
        };
        let Some(id) = self.table.find_by_receive_token(from, header.session_token) else {
            return self.drop_packet(from, "accept for unknown connection");
        };
        let Some(conn) = self.table.by_id_mut(id) else {
            return 0;
        };

        conn.touch(self.now_ms);
        if conn.state != ConnectionState::Connecting {
            // Duplicate accept for an established connection
            return 0;
        }
        conn.send_token = send_token;
        conn.state = ConnectionState::Connected;
        let handle = conn.handle();

        tracing::debug!("Connection {:?} established with {}", handle, from);
        push_event(self.events, NetworkEventType::Connect, handle, 0, 0);
        1
    }

    fn on_disconnect(&mut self, from: &NetworkEndPoint, header: Header) -> usize {
        let Some(id) = self.table.find_by_receive_token(from, header.session_token) else {
            return self.drop_packet(from, "disconnect for unknown connection");
        };
        let Some(handle) = self.table.teardown(id) else {
            return 0;
        };
        tracing::debug!("Connection {:?} closed by {}", handle, from);
        push_event(self.events, NetworkEventType::Disconnect, handle, 0, 0);
        1
    }

    fn on_data(
        &mut self,
        from: &NetworkEndPoint,
        header: Header,
        payload: &[u8],
        payload_offset: usize,
    ) -> usize {
        let Some(id) = self.table.find_by_receive_token(from, header.session_token) else {
            return self.drop_packet(from, "data for unknown connection");
        };

        let mut size = payload.len();
        let trailer = if header.has_connect_token() {
            match read_token_trailer(payload) {
                Ok(token) => {
                    size -= TOKEN_SIZE;
                    Some(token)
                }
                Err(_) => return self.drop_packet(from, "data with truncated token"),
            }
        } else {
            None
        };

        let Some(conn) = self.table.by_id_mut(id) else {
            return 0;
        };
        let mut produced = 0;

        match (conn.state, trailer) {
            // Data overtook a lost accept; it carries everything we need.
            (ConnectionState::Connecting, Some(token)) => {
                conn.send_token = token;
                conn.state = ConnectionState::Connected;
                let handle = conn.handle();
                tracing::debug!("Connection {:?} established by data from {}", handle, from);
                push_event(self.events, NetworkEventType::Connect, handle, 0, 0);
                produced += 1;
            }
            (ConnectionState::Connecting, None) => {
                return self.drop_packet(from, "data before handshake completed");
            }
            (ConnectionState::AwaitingResponse, _) => {
                conn.state = ConnectionState::Connected;
            }
            _ => {}
        }

        let Some(conn) = self.table.by_id_mut(id) else {
            return produced;
        };
        conn.did_receive_data = true;
        conn.touch(self.now_ms);

        // Empty data is a keep-alive.
        if size > 0 {
            push_event(
                self.events,
                NetworkEventType::Data,
                conn.handle(),
                payload_offset,
                size,
            );
            produced += 1;
        }
        produced
    }

    /// Live Connecting connection from `from` expecting `token`
    fn connecting_match(&self, from: &NetworkEndPoint, token: u16) -> Option<u32> {
        let id = self.table.find_by_receive_token(from, token)?;
        match self.table.by_id(id)?.state {
            ConnectionState::Connecting => Some(id),
            _ => None,
        }
    }

    fn drop_packet(&mut self, from: &NetworkEndPoint, reason: &str) -> usize {
        self.stats.packets_dropped += 1;
        tracing::trace!("Dropped packet from {}: {}", from, reason);
        0
    }
}
