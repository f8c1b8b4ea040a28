//! Event Queue
//!
//! Events produced during one tick. Each connection has its own FIFO, and a
//! master queue remembers global arrival order. Everything is discarded by
//! [`EventQueue::clear`] at the start of the next tick.

use std::sync::atomic::{AtomicUsize, Ordering};

/// What happened on a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkEventType {
    /// Unused slot
    #[default]
    Empty,
    Data,
    Connect,
    Disconnect,
}

/// A delivered event. For `Data`, `offset..offset + size` indexes the
/// driver's receive buffer for the current tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetworkEvent {
    pub kind: NetworkEventType,
    pub connection_id: u32,
    /// Generation of the connection when the event was recorded
    pub generation: u32,
    pub offset: usize,
    pub size: usize,
}

/// Per-connection event FIFOs plus a global ordering queue
///
/// Storage is one flat array, `capacity` slots per connection. A connection
/// whose slots run out doubles the capacity of every connection.
#[derive(Debug)]
pub struct EventQueue {
    events: Vec<NetworkEvent>,
    heads: Vec<AtomicUsize>,
    tails: Vec<usize>,
    capacity: usize,
    /// (connection, index within that connection's FIFO)
    master: Vec<(usize, usize)>,
    master_head: usize,
}

impl EventQueue {
    pub fn new(capacity_per_connection: usize) -> Self {
        EventQueue {
            events: Vec::new(),
            heads: Vec::new(),
            tails: Vec::new(),
            capacity: capacity_per_connection.max(1),
            master: Vec::new(),
            master_head: 0,
        }
    }

    pub fn capacity_per_connection(&self) -> usize {
        self.capacity
    }

    pub fn connection_count(&self) -> usize {
        self.tails.len()
    }

    /// Events not yet popped, across all connections
    pub fn pending(&self) -> usize {
        (0..self.connection_count())
            .map(|id| self.pending_for_connection(id))
            .sum()
    }

    pub fn pending_for_connection(&self, id: usize) -> usize {
        match self.tails.get(id) {
            Some(tail) => tail - self.heads[id].load(Ordering::Acquire),
            None => 0,
        }
    }

    pub fn push_event(&mut self, event: NetworkEvent) {
        let id = event.connection_id as usize;
        if id >= self.connection_count() {
            self.grow_connections(id + 1);
        }
        if self.tails[id] == self.capacity {
            self.grow_capacity();
        }

        let index = self.tails[id];
        self.events[id * self.capacity + index] = event;
        self.tails[id] = index + 1;
        self.master.push((id, index));
    }

    /// Next event in global arrival order
    pub fn pop_event(&mut self) -> Option<NetworkEvent> {
        while self.master_head < self.master.len() {
            let (id, index) = self.master[self.master_head];
            self.master_head += 1;

            let head = self.heads[id].get_mut();
            // Entries already taken through pop_event_for_connection are skipped.
            if *head == index {
                *head += 1;
                return Some(self.events[id * self.capacity + index]);
            }
        }
        None
    }

    pub fn pop_event_for_connection(&mut self, id: usize) -> Option<NetworkEvent> {
        let tail = *self.tails.get(id)?;
        let head = self.heads[id].get_mut();
        if *head >= tail {
            return None;
        }
        let index = *head;
        *head += 1;
        Some(self.events[id * self.capacity + index])
    }

    pub fn peek_for_connection(&self, id: usize) -> Option<&NetworkEvent> {
        let tail = *self.tails.get(id)?;
        let head = self.heads[id].load(Ordering::Acquire);
        if head >= tail {
            return None;
        }
        Some(&self.events[id * self.capacity + head])
    }

    /// Forget every event, consumed or not
    pub fn clear(&mut self) {
        for head in &mut self.heads {
            *head.get_mut() = 0;
        }
        for tail in &mut self.tails {
            *tail = 0;
        }
        self.master.clear();
        self.master_head = 0;
    }

    /// View that lets several threads drain per-connection queues at once
    pub fn concurrent(&self) -> ConcurrentEventQueue<'_> {
        ConcurrentEventQueue { queue: self }
    }

    fn grow_connections(&mut self, count: usize) {
        self.events
            .resize(count * self.capacity, NetworkEvent::default());
        self.heads.resize_with(count, || AtomicUsize::new(0));
        self.tails.resize(count, 0);
    }

    fn grow_capacity(&mut self) {
        let old = self.capacity;
        let new = old * 2;
        let count = self.connection_count();
        self.events.resize(count * new, NetworkEvent::default());

        // Copy from the back so no slot is overwritten before it moves.
        for id in (0..count).rev() {
            for index in (0..self.tails[id]).rev() {
                self.events[id * new + index] = self.events[id * old + index];
            }
        }
        self.capacity = new;
    }
}

/// Shared view over an [`EventQueue`] with lock-free per-connection pops
#[derive(Debug, Clone, Copy)]
pub struct ConcurrentEventQueue<'a> {
    queue: &'a EventQueue,
}

impl ConcurrentEventQueue<'_> {
    pub fn peek_for_connection(&self, id: usize) -> Option<&NetworkEvent> {
        self.queue.peek_for_connection(id)
    }

    pub fn pop_event_for_connection(&self, id: usize) -> Option<NetworkEvent> {
        self.pop_where(id, |_| true)
    }

    /// Pop the next event only if it was recorded for `generation`, so a
    /// stale handle cannot consume events meant for the slot's new owner
    pub fn pop_event_for_generation(&self, id: usize, generation: u32) -> Option<NetworkEvent> {
        self.pop_where(id, |event| event.generation == generation)
    }

    fn pop_where(&self, id: usize, accept: impl Fn(&NetworkEvent) -> bool) -> Option<NetworkEvent> {
        let tail = *self.queue.tails.get(id)?;
        let head = &self.queue.heads[id];
        let base = id * self.queue.capacity;
        let mut current = head.load(Ordering::Acquire);
        loop {
            if current >= tail {
                return None;
            }
            let event = self.queue.events[base + current];
            if !accept(&event) {
                return None;
            }
            match head.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(event),
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn event(id: u32, kind: NetworkEventType, offset: usize) -> NetworkEvent {
        NetworkEvent {
            kind,
            connection_id: id,
            generation: 1,
            offset,
            size: 0,
        }
    }

    #[test]
    fn test_global_order() {
        let mut queue = EventQueue::new(4);
        queue.push_event(event(0, NetworkEventType::Connect, 0));
        queue.push_event(event(1, NetworkEventType::Data, 1));
        queue.push_event(event(0, NetworkEventType::Data, 2));

        let order: Vec<(u32, usize)> = std::iter::from_fn(|| queue.pop_event())
            .map(|e| (e.connection_id, e.offset))
            .collect();
        assert_eq!(order, vec![(0, 0), (1, 1), (0, 2)]);
    }

    #[test]
    fn test_per_connection_order() {
        let mut queue = EventQueue::new(4);
        queue.push_event(event(0, NetworkEventType::Connect, 0));
        queue.push_event(event(1, NetworkEventType::Data, 1));
        queue.push_event(event(0, NetworkEventType::Data, 2));

        assert_eq!(queue.pop_event_for_connection(0).map(|e| e.offset), Some(0));
        assert_eq!(queue.pop_event_for_connection(0).map(|e| e.offset), Some(2));
        assert_eq!(queue.pop_event_for_connection(0), None);
        assert_eq!(queue.pop_event_for_connection(42), None);

        // The master queue skips what was consumed per connection.
        assert_eq!(queue.pop_event().map(|e| e.connection_id), Some(1));
        assert_eq!(queue.pop_event(), None);
    }

    #[test]
    fn test_growth_preserves_events() {
        let mut queue = EventQueue::new(1);
        for i in 0..5 {
            queue.push_event(event(2, NetworkEventType::Data, i));
            queue.push_event(event(0, NetworkEventType::Data, 100 + i));
        }
        assert_eq!(queue.capacity_per_connection(), 8);
        assert_eq!(queue.pending(), 10);

        for i in 0..5 {
            assert_eq!(queue.pop_event_for_connection(0).map(|e| e.offset), Some(100 + i));
        }
        for i in 0..5 {
            assert_eq!(queue.pop_event().map(|e| e.offset), Some(i));
        }
    }

    #[test]
    fn test_clear_drops_unconsumed() {
        let mut queue = EventQueue::new(2);
        queue.push_event(event(0, NetworkEventType::Data, 0));
        queue.push_event(event(1, NetworkEventType::Data, 0));
        queue.clear();
        assert_eq!(queue.pending(), 0);
        assert_eq!(queue.pop_event(), None);

        queue.push_event(event(1, NetworkEventType::Disconnect, 9));
        assert_eq!(
            queue.pop_event().map(|e| e.kind),
            Some(NetworkEventType::Disconnect)
        );
    }

    #[test]
    fn test_concurrent_drain_exactly_once() {
        let mut queue = EventQueue::new(4);
        for i in 0..200 {
            queue.push_event(event((i % 2) as u32, NetworkEventType::Data, i));
        }

        let seen = Mutex::new(Vec::new());
        let view = queue.concurrent();
        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    let mut local = Vec::new();
                    while let Some(ev) = view.pop_event_for_connection(0) {
                        local.push(ev.offset);
                    }
                    seen.lock().unwrap().extend(local);
                });
            }
        });

        let mut seen = seen.into_inner().unwrap();
        seen.sort_unstable();
        let expected: Vec<usize> = (0..200).filter(|i| i % 2 == 0).collect();
        assert_eq!(seen, expected);
        assert_eq!(queue.pending_for_connection(0), 0);
        assert_eq!(queue.pending_for_connection(1), 100);
    }

    #[test]
    fn test_pop_for_generation() {
        let mut queue = EventQueue::new(4);
        queue.push_event(event(3, NetworkEventType::Disconnect, 0));
        queue.push_event(NetworkEvent {
            generation: 2,
            ..event(3, NetworkEventType::Connect, 1)
        });

        let view = queue.concurrent();
        assert_eq!(view.pop_event_for_generation(3, 2), None);
        assert_eq!(view.pop_event_for_generation(3, 1).map(|e| e.offset), Some(0));
        assert_eq!(view.pop_event_for_generation(3, 1), None);
        assert_eq!(view.pop_event_for_generation(3, 2).map(|e| e.offset), Some(1));
    }
}
