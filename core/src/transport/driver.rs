//! Network Driver
//!
//! Owns a backend, the connection table, the event queue and the receive
//! batch, and advances all of them one tick at a time.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::connection::{ConnectionState, ConnectionTable, NetworkConnection};
use super::dispatcher::{next_token, push_event, Outbound, ProtocolDispatcher};
use super::ipc::{IpcHub, IpcNetworkInterface};
use super::packet::MAX_PAYLOAD_SIZE;
use super::udp::UdpNetworkInterface;
use super::{NetworkInterface, ReceiveBatch};
use crate::clock::{Clock, SystemClock};
use crate::config::NetworkConfig;
use crate::data_stream::DataStreamReader;
use crate::endpoint::NetworkEndPoint;
use crate::error::{NetworkError, Result};
use crate::event_queue::{EventQueue, NetworkEvent, NetworkEventType};

/// Counters since the driver was created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DriverStatistics {
    pub packets_received: u64,
    /// Datagrams that were malformed or matched no connection
    pub packets_dropped: u64,
    pub bytes_received: u64,
    pub events_produced: u64,
    pub packets_sent: u64,
}

/// Tick-driven connection manager
///
/// Call [`update`](Self::update) (or [`schedule_update`](Self::schedule_update))
/// once per tick, then drain events. Events and the payload bytes they point
/// at stay valid until the next tick begins.
pub struct NetworkDriver {
    backend: Arc<dyn NetworkInterface>,
    config: NetworkConfig,
    clock: Arc<dyn Clock>,
    table: ConnectionTable,
    events: EventQueue,
    batch: ReceiveBatch,
    accept_queue: VecDeque<NetworkConnection>,
    token_counter: u16,
    listening: bool,
    stats: DriverStatistics,
    packets_sent: AtomicU64,
}

impl NetworkDriver {
    /// Create a driver over `backend`, timed by the system clock
    pub fn new<B: NetworkInterface + 'static>(backend: B, config: NetworkConfig) -> Result<Self> {
        Self::with_clock(backend, config, Arc::new(SystemClock::new()))
    }

    pub fn with_clock<B: NetworkInterface + 'static>(
        backend: B,
        config: NetworkConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let token_counter = config.session_token_seed.unwrap_or_else(rand::random);

        Ok(NetworkDriver {
            backend: Arc::new(backend),
            events: EventQueue::new(config.event_queue_capacity),
            batch: ReceiveBatch::new(config.initial_stream_capacity),
            table: ConnectionTable::new(),
            accept_queue: VecDeque::new(),
            token_counter,
            listening: false,
            stats: DriverStatistics::default(),
            packets_sent: AtomicU64::new(0),
            clock,
            config,
        })
    }

    /// Driver over a fresh UDP/IPv4 socket sized from `config`
    pub fn udp(config: NetworkConfig) -> Result<Self> {
        let backend = UdpNetworkInterface::new(
            config.socket_receive_buffer_size,
            config.socket_send_buffer_size,
        );
        Self::new(backend, config)
    }

    /// Driver on an in-process hub
    pub fn ipc(hub: &IpcHub, config: NetworkConfig) -> Result<Self> {
        Self::new(IpcNetworkInterface::new(hub.clone()), config)
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn bind(&mut self, endpoint: &NetworkEndPoint) -> Result<()> {
        self.backend.bind(endpoint)
    }

    pub fn local_endpoint(&self) -> Option<NetworkEndPoint> {
        self.backend.local_endpoint()
    }

    /// Start accepting incoming connection requests
    pub fn listen(&mut self) -> Result<()> {
        let local = self.local_endpoint().ok_or(NetworkError::NotBound)?;
        self.listening = true;
        tracing::info!("Listening on {}", local);
        Ok(())
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }

    /// Next connection accepted by the server side, oldest first.
    /// Connections that closed before being accepted are skipped.
    pub fn accept(&mut self) -> Option<NetworkConnection> {
        while let Some(handle) = self.accept_queue.pop_front() {
            if self.table.get(handle).is_some() {
                return Some(handle);
            }
        }
        None
    }

    /// Start a handshake with `endpoint`. The connection stays `Connecting`
    /// until a later tick sees the accept.
    pub fn connect(&mut self, endpoint: &NetworkEndPoint) -> Result<NetworkConnection> {
        if self.local_endpoint().is_none() {
            return Err(NetworkError::NotBound);
        }
        if endpoint.family() != self.backend.family() {
            return Err(NetworkError::FamilyMismatch {
                expected: self.backend.family(),
                actual: endpoint.family(),
            });
        }
        if !endpoint.is_valid() {
            return Err(NetworkError::InvalidEndPoint(endpoint.to_string()));
        }

        let now = self.clock.now_ms();
        let receive_token = next_token(&mut self.token_counter);
        let conn = self.table.allocate(*endpoint, now);
        conn.state = ConnectionState::Connecting;
        conn.receive_token = receive_token;
        conn.attempts = 1;
        let handle = conn.handle();

        let out = Outbound::new(self.backend.as_ref(), &self.packets_sent);
        if let Err(e) = out.request(conn) {
            self.table.teardown(handle.id());
            return Err(e);
        }

        tracing::debug!("Connecting {:?} to {}", handle, endpoint);
        Ok(handle)
    }

    /// Close a connection. A connected peer is told with a `Disconnect`
    /// packet; a pending handshake is dropped silently.
    pub fn disconnect(&mut self, handle: NetworkConnection) -> Result<()> {
        let conn = self
            .table
            .get(handle)
            .ok_or(NetworkError::InvalidConnection)?;

        let notified = match conn.state {
            ConnectionState::Connected | ConnectionState::AwaitingResponse => {
                Outbound::new(self.backend.as_ref(), &self.packets_sent)
                    .disconnect(conn)
                    .map(|_| ())
            }
            _ => Ok(()),
        };
        self.table.teardown(handle.id());
        tracing::debug!("Disconnected {:?}", handle);
        notified
    }

    /// Send one datagram of application data. Stale handles send nothing and
    /// return 0; otherwise returns the payload length.
    pub fn send(&self, handle: NetworkConnection, payload: &[u8]) -> Result<usize> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(NetworkError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let Some(conn) = self.table.get(handle) else {
            return Ok(0);
        };
        if conn.state == ConnectionState::Connecting {
            return Err(NetworkError::SendWhileConnecting);
        }

        Outbound::new(self.backend.as_ref(), &self.packets_sent).data(conn, payload)?;
        Ok(payload.len())
    }

    /// Next event of this tick in arrival order, with the handle it belongs to
    pub fn pop_event(&mut self) -> Option<(NetworkConnection, NetworkEvent)> {
        let event = self.events.pop_event()?;
        Some((
            NetworkConnection::new(event.connection_id, event.generation),
            event,
        ))
    }

    /// Next event of this tick for one connection
    pub fn pop_event_for_connection(&mut self, handle: NetworkConnection) -> Option<NetworkEvent> {
        self.concurrent().pop_event_for_connection(handle)
    }

    pub fn connection_state(&self, handle: NetworkConnection) -> ConnectionState {
        self.table.state(handle)
    }

    pub fn remote_endpoint(&self, handle: NetworkConnection) -> Option<NetworkEndPoint> {
        self.table.get(handle).map(|c| c.remote)
    }

    /// Payload bytes of a `Data` event; empty for any other kind
    pub fn payload(&self, event: &NetworkEvent) -> &[u8] {
        if event.kind != NetworkEventType::Data {
            return &[];
        }
        self.batch
            .stream()
            .as_slice()
            .get(event.offset..event.offset + event.size)
            .unwrap_or(&[])
    }

    /// Reader over the payload of a `Data` event
    pub fn reader(&self, event: &NetworkEvent) -> DataStreamReader<'_> {
        DataStreamReader::new(self.payload(event))
    }

    pub fn statistics(&self) -> DriverStatistics {
        DriverStatistics {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            ..self.stats
        }
    }

    /// Shared view for sending and draining from several threads
    pub fn concurrent(&self) -> ConcurrentDriver<'_> {
        ConcurrentDriver { driver: self }
    }

    /// Run one tick on the calling thread. Returns the number of events
    /// recorded.
    pub fn update(&mut self) -> Result<usize> {
        let (now, mut produced) = self.begin_update()?;

        if self.local_endpoint().is_some() {
            self.backend.receive(&mut self.batch)?;
        }

        produced += self.dispatch_batch(now)?;
        self.backend.flush()?;
        Ok(produced)
    }

    /// Same tick as [`update`](Self::update), with the backend receive loop
    /// run on a tokio blocking thread.
    pub async fn schedule_update(&mut self) -> Result<usize> {
        let (now, mut produced) = self.begin_update()?;

        if self.local_endpoint().is_some() {
            let backend = Arc::clone(&self.backend);
            let mut batch = std::mem::take(&mut self.batch);
            let (batch, received) = tokio::task::spawn_blocking(move || {
                let received = backend.receive(&mut batch);
                (batch, received)
            })
            .await
            .map_err(|e| NetworkError::ReceiveTask(e.to_string()))?;
            self.batch = batch;
            received?;
        }

        produced += self.dispatch_batch(now)?;
        self.backend.flush()?;
        Ok(produced)
    }

    /// Deliver queued sends, drop the last tick's events and data, run the
    /// timeout sweep and forget dead handles nobody accepted
    fn begin_update(&mut self) -> Result<(i64, usize)> {
        self.backend.flush()?;
        self.events.clear();
        self.batch.clear();

        let now = self.clock.now_ms();
        let expired = self.check_timeouts(now)?;
        self.stats.events_produced += expired as u64;

        // Servers that only watch Connect events never call accept().
        let table = &self.table;
        self.accept_queue.retain(|handle| table.get(*handle).is_some());
        Ok((now, expired))
    }

    fn check_timeouts(&mut self, now: i64) -> Result<usize> {
        let connect_timeout = self.config.connect_timeout_ms as i64;
        let disconnect_timeout = self.config.disconnect_timeout_ms as i64;
        let max_attempts = self.config.max_connect_attempts;
        let out = Outbound::new(self.backend.as_ref(), &self.packets_sent);
        let mut produced = 0;

        for id in 0..self.table.slot_count() as u32 {
            let Some(conn) = self.table.by_id_mut(id) else {
                continue;
            };
            let idle = conn.idle_ms(now);

            let expired = match conn.state {
                ConnectionState::Disconnected => false,
                ConnectionState::Connecting | ConnectionState::AwaitingResponse => {
                    if idle <= connect_timeout {
                        false
                    } else if conn.attempts >= max_attempts {
                        true
                    } else {
                        conn.attempts += 1;
                        conn.touch(now);
                        if conn.state == ConnectionState::Connecting {
                            out.request(conn)?;
                        } else {
                            out.accept(conn)?;
                        }
                        false
                    }
                }
                ConnectionState::Connected => idle > disconnect_timeout,
            };

            if expired {
                if let Some(handle) = self.table.teardown(id) {
                    tracing::debug!("Connection {:?} timed out after {} ms", handle, idle);
                    push_event(&mut self.events, NetworkEventType::Disconnect, handle, 0, 0);
                    produced += 1;
                }
            }
        }
        Ok(produced)
    }

    fn dispatch_batch(&mut self, now: i64) -> Result<usize> {
        let mut dispatcher = ProtocolDispatcher {
            table: &mut self.table,
            events: &mut self.events,
            accept_queue: &mut self.accept_queue,
            token_counter: &mut self.token_counter,
            stats: &mut self.stats,
            out: Outbound::new(self.backend.as_ref(), &self.packets_sent),
            config: &self.config,
            listening: self.listening,
            now_ms: now,
        };

        let mut produced = 0;
        for datagram in self.batch.datagrams() {
            let bytes = self.batch.bytes(datagram);
            produced += dispatcher.append_packet(&datagram.from, bytes, datagram.offset)?;
        }
        Ok(produced)
    }
}

/// Borrowed view of a [`NetworkDriver`] that can be shared between threads
///
/// Threads may send on any connection and drain per-connection events; each
/// event is handed out exactly once.
#[derive(Clone, Copy)]
pub struct ConcurrentDriver<'a> {
    driver: &'a NetworkDriver,
}

impl ConcurrentDriver<'_> {
    pub fn send(&self, handle: NetworkConnection, payload: &[u8]) -> Result<usize> {
        self.driver.send(handle, payload)
    }

    /// Events recorded for an older generation of the slot are left alone
    pub fn pop_event_for_connection(&self, handle: NetworkConnection) -> Option<NetworkEvent> {
        self.driver
            .events
            .concurrent()
            .pop_event_for_generation(handle.id() as usize, handle.generation())
    }

    pub fn payload(&self, event: &NetworkEvent) -> &[u8] {
        self.driver.payload(event)
    }

    pub fn connection_state(&self, handle: NetworkConnection) -> ConnectionState {
        self.driver.connection_state(handle)
    }
}
