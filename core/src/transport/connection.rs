//! Connection State Management
//!
//! Generational table of connection records. Slots are recycled through a
//! free list; every teardown bumps the slot's generation so handles issued
//! earlier stop resolving.

use std::collections::VecDeque;

use crate::endpoint::NetworkEndPoint;

/// Connection state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Slot is free or the connection was torn down
    #[default]
    Disconnected,
    /// Client sent a request and waits for the accept
    Connecting,
    /// Accept sent, waiting for the peer to answer
    AwaitingResponse,
    /// Handshake complete, data may flow
    Connected,
}

/// Caller-facing handle: slot index plus the generation it was issued at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetworkConnection {
    id: u32,
    generation: u32,
}

impl NetworkConnection {
    pub(crate) fn new(id: u32, generation: u32) -> Self {
        NetworkConnection { id, generation }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// Represents a single connection slot
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: u32,
    pub generation: u32,
    pub remote: NetworkEndPoint,
    pub state: ConnectionState,
    /// Token put in the header of everything we send
    pub send_token: u16,
    /// Token the peer must put in the header of everything it sends
    pub receive_token: u16,
    /// Whether the peer has sent us data yet; until then outgoing data
    /// carries our receive token as a trailer
    pub did_receive_data: bool,
    pub attempts: u32,
    pub last_activity_ms: i64,
}

impl Connection {
    fn new(id: u32, remote: NetworkEndPoint, now_ms: i64) -> Self {
        Connection {
            id,
            generation: 1,
            remote,
            state: ConnectionState::Disconnected,
            send_token: 0,
            receive_token: 0,
            did_receive_data: false,
            attempts: 0,
            last_activity_ms: now_ms,
        }
    }

    pub fn handle(&self) -> NetworkConnection {
        NetworkConnection::new(self.id, self.generation)
    }

    /// Record activity at `now_ms`
    pub fn touch(&mut self, now_ms: i64) {
        self.last_activity_ms = now_ms;
    }

    /// Milliseconds since the last recorded activity
    pub fn idle_ms(&self, now_ms: i64) -> i64 {
        now_ms - self.last_activity_ms
    }
}

/// Slot arena for connections
#[derive(Debug, Default)]
pub struct ConnectionTable {
    connections: Vec<Connection>,
    free: VecDeque<u32>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of slots ever allocated
    pub fn slot_count(&self) -> usize {
        self.connections.len()
    }

    pub fn live_count(&self) -> usize {
        self.connections
            .iter()
            .filter(|c| c.state != ConnectionState::Disconnected)
            .count()
    }

    /// Take a slot (reusing freed ones first) and reset it for `remote`
    pub fn allocate(&mut self, remote: NetworkEndPoint, now_ms: i64) -> &mut Connection {
        let id = match self.free.pop_front() {
            Some(id) => {
                let conn = &mut self.connections[id as usize];
                let generation = conn.generation;
                *conn = Connection::new(id, remote, now_ms);
                conn.generation = generation;
                id
            }
            None => {
                let id = self.connections.len() as u32;
                self.connections.push(Connection::new(id, remote, now_ms));
                id
            }
        };
        &mut self.connections[id as usize]
    }

    /// Resolve a handle; stale handles and torn-down slots yield `None`
    pub fn get(&self, handle: NetworkConnection) -> Option<&Connection> {
        self.connections
            .get(handle.id as usize)
            .filter(|c| c.generation == handle.generation && c.state != ConnectionState::Disconnected)
    }

    pub fn get_mut(&mut self, handle: NetworkConnection) -> Option<&mut Connection> {
        self.connections
            .get_mut(handle.id as usize)
            .filter(|c| c.generation == handle.generation && c.state != ConnectionState::Disconnected)
    }

    pub fn by_id(&self, id: u32) -> Option<&Connection> {
        self.connections.get(id as usize)
    }

    pub fn by_id_mut(&mut self, id: u32) -> Option<&mut Connection> {
        self.connections.get_mut(id as usize)
    }

    pub fn state(&self, handle: NetworkConnection) -> ConnectionState {
        self.get(handle)
            .map(|c| c.state)
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// Live connection from `remote` whose receive token is `token`
    pub fn find_by_receive_token(&self, remote: &NetworkEndPoint, token: u16) -> Option<u32> {
        self.connections
            .iter()
            .find(|c| {
                c.state != ConnectionState::Disconnected
                    && c.remote == *remote
                    && c.receive_token == token
            })
            .map(|c| c.id)
    }

    /// Live connection from `remote` whose send token is `token`
    pub fn find_by_send_token(&self, remote: &NetworkEndPoint, token: u16) -> Option<u32> {
        self.connections
            .iter()
            .find(|c| {
                c.state != ConnectionState::Disconnected
                    && c.remote == *remote
                    && c.send_token == token
            })
            .map(|c| c.id)
    }

    /// Free the slot and invalidate outstanding handles. Returns the handle
    /// that was valid up to now.
    pub fn teardown(&mut self, id: u32) -> Option<NetworkConnection> {
        let conn = self.connections.get_mut(id as usize)?;
        if conn.state == ConnectionState::Disconnected {
            return None;
        }
        let handle = conn.handle();
        conn.state = ConnectionState::Disconnected;
        conn.generation = match conn.generation.wrapping_add(1) {
            0 => 1,
            next => next,
        };
        self.free.push_back(id);
        Some(handle)
    }
}
