//! Fixed-capacity FIFO of decoded blocks between the decode thread and the
//! playback side.
//!
//! Admission is drop-oldest: a live broadcast should lose stale audio rather
//! than accumulate latency or stall the producer.

use log::debug;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::events::PcmBlock;

#[derive(Debug)]
struct Inner {
    blocks: VecDeque<Arc<PcmBlock>>,
    evicted: u64,
}

#[derive(Debug)]
pub struct BoundedSampleQueue {
    inner: Mutex<Inner>,
    capacity: usize,
    minimum: usize,
}

impl BoundedSampleQueue {
    /// `minimum` is clamped into `1..=capacity`.
    pub fn new(capacity: usize, minimum: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                blocks: VecDeque::with_capacity(capacity),
                evicted: 0,
            }),
            capacity,
            minimum: minimum.clamp(1, capacity),
        }
    }

    // A panic while holding the lock cannot leave the deque half-updated,
    // so a poisoned guard is still usable.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn minimum(&self) -> usize {
        self.minimum
    }

    /// Never blocks, never fails. Evicts the oldest block when full.
    pub fn enqueue(&self, block: Arc<PcmBlock>) {
        let mut inner = self.lock();
        if inner.blocks.len() >= self.capacity {
            inner.blocks.pop_front();
            inner.evicted += 1;
            debug!("Sample queue full, dropped oldest block ({} total)", inner.evicted);
        }
        inner.blocks.push_back(block);
    }

    pub fn dequeue(&self) -> Option<Arc<PcmBlock>> {
        self.lock().blocks.pop_front()
    }

    /// Remove and return everything currently queued, oldest first.
    pub fn drain(&self) -> Vec<Arc<PcmBlock>> {
        self.lock().blocks.drain(..).collect()
    }

    pub fn peek(&self) -> Option<Arc<PcmBlock>> {
        self.lock().blocks.front().cloned()
    }

    pub fn clear(&self) {
        self.lock().blocks.clear();
    }

    pub fn count(&self) -> usize {
        self.lock().blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().blocks.is_empty()
    }

    pub fn has_reached_minimum(&self) -> bool {
        self.count() >= self.minimum
    }

    /// Blocks dropped by drop-oldest admission since construction.
    pub fn evicted(&self) -> u64 {
        self.lock().evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::AudioFormat;

    fn block(tag: f32) -> Arc<PcmBlock> {
        let format = AudioFormat {
            sample_rate: 44_100,
            channels: 1,
        };
        Arc::new(PcmBlock::new(format, vec![tag]))
    }

    fn tags(blocks: &[Arc<PcmBlock>]) -> Vec<f32> {
        blocks.iter().map(|b| b.samples[0]).collect()
    }

    #[test]
    fn test_keeps_most_recent_on_overflow() {
        let queue = BoundedSampleQueue::new(4, 2);
        for i in 0..11 {
            queue.enqueue(block(i as f32));
            assert!(queue.count() <= 4);
        }
        assert_eq!(queue.evicted(), 7);
        assert_eq!(tags(&queue.drain()), vec![7.0, 8.0, 9.0, 10.0]);
    }

    #[test]
    fn test_fifo_order_and_peek() {
        let queue = BoundedSampleQueue::new(8, 2);
        assert!(queue.is_empty());
        assert!(queue.dequeue().is_none());

        queue.enqueue(block(1.0));
        queue.enqueue(block(2.0));
        assert_eq!(queue.peek().unwrap().samples[0], 1.0);
        assert_eq!(queue.count(), 2);
        assert_eq!(queue.dequeue().unwrap().samples[0], 1.0);
        assert_eq!(queue.dequeue().unwrap().samples[0], 2.0);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_minimum_threshold() {
        let queue = BoundedSampleQueue::new(4, 2);
        queue.enqueue(block(0.0));
        assert!(!queue.has_reached_minimum());
        queue.enqueue(block(1.0));
        assert!(queue.has_reached_minimum());
        queue.clear();
        assert!(!queue.has_reached_minimum());
        assert_eq!(queue.count(), 0);
    }

    #[test]
    fn test_minimum_clamped_to_capacity() {
        let queue = BoundedSampleQueue::new(3, 10);
        assert_eq!(queue.minimum(), 3);
        let queue = BoundedSampleQueue::new(0, 0);
        assert_eq!(queue.capacity(), 1);
        assert_eq!(queue.minimum(), 1);
    }

    #[test]
    fn test_concurrent_producer_consumer() {
        let queue = Arc::new(BoundedSampleQueue::new(16, 1));
        let producer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                for i in 0..5_000 {
                    queue.enqueue(block(i as f32));
                }
            })
        };

        let mut seen = Vec::new();
        while !producer.is_finished() || !queue.is_empty() {
            if let Some(b) = queue.dequeue() {
                seen.push(b.samples[0]);
            }
        }
        producer.join().unwrap();

        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(*seen.last().unwrap(), 4_999.0);
    }
}
