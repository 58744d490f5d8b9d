//! Bounded, time-ordered sample buffers shared between an asynchronous
//! producer and the odometry worker.
//!
//! The producer side only ever takes the lock for one insertion. The worker
//! copies what it needs once per cycle and never waits for new data.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

pub trait Stamped {
    fn stamp(&self) -> f64;
}

/// Ring buffer kept sorted by timestamp. When full, the oldest entry is dropped.
#[derive(Debug, Clone)]
pub struct TimeOrderedBuffer<T> {
    capacity: usize,
    items: VecDeque<T>,
    evicted: u64,
}

impl<T: Stamped + Clone> TimeOrderedBuffer<T> {
    pub fn new(capacity: usize) -> TimeOrderedBuffer<T> {
        TimeOrderedBuffer {
            capacity,
            items: VecDeque::with_capacity(capacity),
            evicted: 0,
        }
    }

    pub fn insert(&mut self, item: T) {
        if self.capacity == 0 {
            self.evicted += 1;
            return;
        }
        let stamp = item.stamp();
        let pos = self.items.partition_point(|s| s.stamp() <= stamp);
        self.items.insert(pos, item);
        while self.items.len() > self.capacity {
            self.items.pop_front();
            self.evicted += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }
}

/// Creates the producer and consumer handles of one shared buffer.
pub fn shared_buffer<T: Stamped + Clone>(capacity: usize) -> (BufferProducer<T>, BufferConsumer<T>) {
    let inner = Arc::new(Mutex::new(TimeOrderedBuffer::new(capacity)));
    (
        BufferProducer {
            inner: inner.clone(),
        },
        BufferConsumer { inner },
    )
}

#[derive(Clone)]
pub struct BufferProducer<T> {
    inner: Arc<Mutex<TimeOrderedBuffer<T>>>,
}

impl<T: Stamped + Clone> BufferProducer<T> {
    pub fn push(&self, item: T) {
        self.inner.lock().insert(item);
    }
}

#[derive(Clone)]
pub struct BufferConsumer<T> {
    inner: Arc<Mutex<TimeOrderedBuffer<T>>>,
}

impl<T: Stamped + Clone> BufferConsumer<T> {
    /// Copy of the whole buffer at this instant.
    pub fn snapshot(&self) -> Vec<T> {
        self.inner.lock().to_vec()
    }

    /// Copy of the buffer and the running eviction count, under one lock.
    pub fn snapshot_with_evicted(&self) -> (Vec<T>, u64) {
        let buffer = self.inner.lock();
        (buffer.to_vec(), buffer.evicted())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Tick(f64);

    impl Stamped for Tick {
        fn stamp(&self) -> f64 {
            self.0
        }
    }

    #[test]
    fn out_of_order_inserts_stay_sorted() {
        let mut buffer = TimeOrderedBuffer::new(8);
        for t in [3.0, 1.0, 2.0, 5.0, 4.0] {
            buffer.insert(Tick(t));
        }
        let stamps: Vec<f64> = buffer.iter().map(|t| t.0).collect();
        assert_eq!(stamps, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn overflow_drops_oldest() {
        let mut buffer = TimeOrderedBuffer::new(3);
        for t in [1.0, 2.0, 3.0, 4.0, 0.5] {
            buffer.insert(Tick(t));
        }
        let stamps: Vec<f64> = buffer.iter().map(|t| t.0).collect();
        assert_eq!(stamps, vec![2.0, 3.0, 4.0]);
        assert_eq!(buffer.evicted(), 2);
    }

    #[test]
    fn snapshot_is_detached_from_producer() {
        let (producer, consumer) = shared_buffer(4);
        producer.push(Tick(1.0));
        producer.push(Tick(2.0));
        let snapshot = consumer.snapshot();
        producer.push(Tick(3.0));
        assert_eq!(snapshot, vec![Tick(1.0), Tick(2.0)]);
        assert_eq!(consumer.snapshot().len(), 3);
    }

    #[test]
    fn consumer_sees_evictions() {
        let (producer, consumer) = shared_buffer(2);
        for t in [1.0, 2.0, 3.0, 4.0] {
            producer.push(Tick(t));
        }
        let (items, evicted) = consumer.snapshot_with_evicted();
        assert_eq!(items, vec![Tick(3.0), Tick(4.0)]);
        assert_eq!(evicted, 2);
    }

    #[test]
    fn producer_on_another_thread() {
        let (producer, consumer) = shared_buffer(1000);
        let handle = std::thread::spawn(move || {
            for i in 0..500 {
                producer.push(Tick(i as f64));
            }
        });
        handle.join().unwrap();
        assert_eq!(consumer.snapshot().len(), 500);
    }
}
