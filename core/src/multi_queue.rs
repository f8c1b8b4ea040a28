//! Multi-Bucket Queue
//!
//! One flat array split into equally sized FIFO buckets. The IPC backend uses
//! one bucket per slot as that slot's mailbox.

/// FIFO buckets over a single backing array
///
/// Item `i` of bucket `b` lives at `b * bucket_capacity + i`. Both the number
/// of buckets and the bucket size double on demand.
#[derive(Debug)]
pub struct MultiQueue<T> {
    items: Vec<Option<T>>,
    /// (head, tail) per bucket
    cursors: Vec<(usize, usize)>,
    bucket_capacity: usize,
}

impl<T> MultiQueue<T> {
    pub fn new(bucket_count: usize, bucket_capacity: usize) -> Self {
        let bucket_capacity = bucket_capacity.max(1);
        let mut items = Vec::new();
        items.resize_with(bucket_count * bucket_capacity, || None);
        MultiQueue {
            items,
            cursors: vec![(0, 0); bucket_count],
            bucket_capacity,
        }
    }

    pub fn bucket_count(&self) -> usize {
        self.cursors.len()
    }

    pub fn bucket_capacity(&self) -> usize {
        self.bucket_capacity
    }

    pub fn len(&self, bucket: usize) -> usize {
        self.cursors
            .get(bucket)
            .map(|(head, tail)| tail - head)
            .unwrap_or(0)
    }

    pub fn is_empty(&self, bucket: usize) -> bool {
        self.len(bucket) == 0
    }

    /// Append to `bucket`, growing the bucket count or bucket size as needed
    pub fn enqueue(&mut self, bucket: usize, value: T) {
        if bucket >= self.bucket_count() {
            self.grow_buckets(bucket + 1);
        }

        let (head, tail) = self.cursors[bucket];
        if tail == self.bucket_capacity {
            if head > 0 {
                self.compact(bucket);
            } else {
                self.grow_capacity();
            }
        }

        let (_, tail) = self.cursors[bucket];
        self.items[bucket * self.bucket_capacity + tail] = Some(value);
        self.cursors[bucket].1 = tail + 1;
    }

    pub fn peek(&self, bucket: usize) -> Option<&T> {
        let (head, tail) = *self.cursors.get(bucket)?;
        if head == tail {
            return None;
        }
        self.items[bucket * self.bucket_capacity + head].as_ref()
    }

    pub fn dequeue(&mut self, bucket: usize) -> Option<T> {
        let (head, tail) = *self.cursors.get(bucket)?;
        if head == tail {
            return None;
        }
        let value = self.items[bucket * self.bucket_capacity + head].take();
        self.cursors[bucket] = if head + 1 == tail { (0, 0) } else { (head + 1, tail) };
        value
    }

    /// Drop everything queued in `bucket`
    pub fn clear(&mut self, bucket: usize) {
        let Some(&(head, tail)) = self.cursors.get(bucket) else {
            return;
        };
        let base = bucket * self.bucket_capacity;
        for item in &mut self.items[base + head..base + tail] {
            *item = None;
        }
        self.cursors[bucket] = (0, 0);
    }

    fn grow_buckets(&mut self, needed: usize) {
        let mut count = self.bucket_count().max(1);
        while count < needed {
            count *= 2;
        }
        // New buckets go after the existing ones, so nothing moves.
        self.items.resize_with(count * self.bucket_capacity, || None);
        self.cursors.resize(count, (0, 0));
    }

    fn grow_capacity(&mut self) {
        let old = self.bucket_capacity;
        let new = old * 2;
        self.items.resize_with(self.bucket_count() * new, || None);

        // Every item moves to a higher index; walk backwards so nothing is
        // overwritten before it has been moved.
        for bucket in (0..self.bucket_count()).rev() {
            let (head, tail) = self.cursors[bucket];
            for i in (head..tail).rev() {
                let value = self.items[bucket * old + i].take();
                self.items[bucket * new + i] = value;
            }
        }
        self.bucket_capacity = new;
    }

    fn compact(&mut self, bucket: usize) {
        let (head, tail) = self.cursors[bucket];
        let base = bucket * self.bucket_capacity;
        for i in head..tail {
            let value = self.items[base + i].take();
            self.items[base + i - head] = value;
        }
        self.cursors[bucket] = (0, tail - head);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_per_bucket() {
        let mut queue = MultiQueue::new(2, 4);
        queue.enqueue(0, 1);
        queue.enqueue(1, 10);
        queue.enqueue(0, 2);

        assert_eq!(queue.peek(0), Some(&1));
        assert_eq!(queue.dequeue(0), Some(1));
        assert_eq!(queue.dequeue(0), Some(2));
        assert_eq!(queue.dequeue(0), None);
        assert_eq!(queue.dequeue(1), Some(10));
        assert_eq!(queue.dequeue(7), None);
    }

    #[test]
    fn test_bucket_count_growth_keeps_items() {
        let mut queue = MultiQueue::new(2, 2);
        queue.enqueue(0, "a");
        queue.enqueue(1, "b");
        queue.enqueue(1, "c");

        queue.enqueue(9, "z");
        assert!(queue.bucket_count() >= 10);
        assert_eq!(queue.dequeue(0), Some("a"));
        assert_eq!(queue.dequeue(1), Some("b"));
        assert_eq!(queue.dequeue(1), Some("c"));
        assert_eq!(queue.dequeue(9), Some("z"));
    }

    #[test]
    fn test_bucket_capacity_growth_relayouts() {
        let mut queue = MultiQueue::new(3, 2);
        queue.enqueue(0, 0);
        queue.enqueue(0, 1);
        queue.enqueue(2, 20);
        queue.enqueue(2, 21);

        queue.enqueue(1, 10);
        queue.enqueue(1, 11);
        queue.enqueue(1, 12);
        assert_eq!(queue.bucket_capacity(), 4);

        assert_eq!(queue.len(0), 2);
        assert_eq!(queue.dequeue(0), Some(0));
        assert_eq!(queue.dequeue(0), Some(1));
        assert_eq!(queue.dequeue(1), Some(10));
        assert_eq!(queue.dequeue(1), Some(11));
        assert_eq!(queue.dequeue(1), Some(12));
        assert_eq!(queue.dequeue(2), Some(20));
        assert_eq!(queue.dequeue(2), Some(21));
    }

    #[test]
    fn test_compacts_before_growing() {
        let mut queue = MultiQueue::new(1, 2);
        queue.enqueue(0, 1);
        queue.enqueue(0, 2);
        assert_eq!(queue.dequeue(0), Some(1));
        queue.enqueue(0, 3);
        assert_eq!(queue.bucket_capacity(), 2);
        assert_eq!(queue.dequeue(0), Some(2));
        assert_eq!(queue.dequeue(0), Some(3));
    }

    #[test]
    fn test_clear_bucket() {
        let mut queue = MultiQueue::new(2, 2);
        queue.enqueue(0, 1);
        queue.enqueue(1, 2);
        queue.clear(0);
        queue.clear(5);
        assert!(queue.is_empty(0));
        assert_eq!(queue.peek(1), Some(&2));
    }
}
