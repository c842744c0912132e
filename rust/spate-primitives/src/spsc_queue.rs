//! Wait-free single-producer single-consumer queue of owned values.
//!
//! The intra-driver command queues (the agent "proxies") carry owned enum
//! values, not byte records, so this is a typed sibling of the byte rings:
//! a power-of-two slot array with head/tail counters on separate cache
//! lines. The producer publishes a slot with a release store of the head;
//! the consumer releases the slot back with a release store of the tail.

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;

use crate::bits::is_power_of_two;
use crate::sync::{AtomicU64, Ordering};

struct Slot<T>(UnsafeCell<MaybeUninit<T>>);

/// Cache-line padded counter.
#[repr(C, align(64))]
struct PaddedCounter(AtomicU64);

/// A bounded SPSC queue.
pub struct SpscQueue<T> {
    slots: Box<[Slot<T>]>,
    mask: u64,
    /// Producer publication index.
    head: PaddedCounter,
    /// Consumer index.
    tail: PaddedCounter,
}

unsafe impl<T: Send> Send for SpscQueue<T> {}
unsafe impl<T: Send> Sync for SpscQueue<T> {}

impl<T> SpscQueue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(is_power_of_two(capacity), "capacity must be a power of two");
        let slots = (0..capacity)
            .map(|_| Slot(UnsafeCell::new(MaybeUninit::uninit())))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            mask: (capacity - 1) as u64,
            head: PaddedCounter(AtomicU64::new(0)),
            tail: PaddedCounter(AtomicU64::new(0)),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Producer side: enqueue, or hand the value back when full.
    pub fn offer(&self, value: T) -> Result<(), T> {
        let head = self.head.0.load(Ordering::Relaxed);
        let tail = self.tail.0.load(Ordering::Acquire);
        if head.wrapping_sub(tail) >= self.slots.len() as u64 {
            return Err(value);
        }

        let slot = &self.slots[(head & self.mask) as usize];
        // SAFETY: slot is outside [tail, head) so the consumer cannot touch
        // it; the single producer owns it until the head store below.
        unsafe { (*slot.0.get()).write(value) };
        self.head.0.store(head.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Consumer side: dequeue one value.
    pub fn poll(&self) -> Option<T> {
        let tail = self.tail.0.load(Ordering::Relaxed);
        let head = self.head.0.load(Ordering::Acquire);
        if tail == head {
            return None;
        }

        let slot = &self.slots[(tail & self.mask) as usize];
        // SAFETY: the producer released this slot via the head store; the
        // single consumer owns it until the tail store below.
        let value = unsafe { (*slot.0.get()).assume_init_read() };
        self.tail.0.store(tail.wrapping_add(1), Ordering::Release);
        Some(value)
    }

    /// Drain up to `limit` values into `handler`; returns the count.
    pub fn drain(&self, mut handler: impl FnMut(T), limit: usize) -> usize {
        let mut count = 0;
        while count < limit {
            match self.poll() {
                Some(value) => {
                    handler(value);
                    count += 1;
                }
                None => break,
            }
        }
        count
    }

    pub fn is_empty(&self) -> bool {
        self.tail.0.load(Ordering::Relaxed) == self.head.0.load(Ordering::Acquire)
    }
}

impl<T> Drop for SpscQueue<T> {
    fn drop(&mut self) {
        while self.poll().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn offer_poll_order() {
        let queue = SpscQueue::new(8);
        queue.offer("a").unwrap();
        queue.offer("b").unwrap();
        assert_eq!(queue.poll(), Some("a"));
        assert_eq!(queue.poll(), Some("b"));
        assert_eq!(queue.poll(), None);
    }

    #[test]
    fn full_queue_hands_value_back() {
        let queue = SpscQueue::new(2);
        queue.offer(1).unwrap();
        queue.offer(2).unwrap();
        assert_eq!(queue.offer(3), Err(3));
        queue.poll();
        queue.offer(3).unwrap();
    }

    #[test]
    fn owned_values_are_dropped_exactly_once() {
        let tracked = Arc::new(());
        {
            let queue = SpscQueue::new(4);
            queue.offer(Arc::clone(&tracked)).unwrap();
            queue.offer(Arc::clone(&tracked)).unwrap();
            assert!(queue.poll().is_some());
            // One value left in the queue when it drops.
        }
        assert_eq!(Arc::strong_count(&tracked), 1);
    }

    #[test]
    fn cross_thread_handoff() {
        let queue = Arc::new(SpscQueue::new(64));
        let producer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || {
                for i in 0..10_000u64 {
                    loop {
                        if queue.offer(i).is_ok() {
                            break;
                        }
                        std::hint::spin_loop();
                    }
                }
            })
        };

        let mut expected = 0u64;
        while expected < 10_000 {
            if let Some(value) = queue.poll() {
                assert_eq!(value, expected);
                expected += 1;
            }
        }
        producer.join().unwrap();
    }
}
