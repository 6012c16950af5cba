// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Bounded FIFO between the receive loop and the ingress workers.
//!
//! The producer never waits: [`RingBuffer::try_push`] hands the item back when the ring is
//! full or closed. Consumers park on a condition variable until an item arrives or the ring
//! is closed. Closing stops new pushes but lets consumers drain what was already accepted.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;

/// Default ring capacity on the ingress path
pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, PartialEq, Eq)]
pub enum PushError<T> {
    /// Ring is at capacity; the newest item is rejected
    Full(T),
    /// Ring has been closed
    Closed(T),
}

impl<T> PushError<T> {
    pub fn into_inner(self) -> T {
        match self {
            PushError::Full(item) | PushError::Closed(item) => item,
        }
    }
}

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

pub struct RingBuffer<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    capacity: usize,
}

impl<T> std::fmt::Debug for RingBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RingBuffer")
            .field("len", &state.items.len())
            .field("capacity", &self.capacity)
            .field("closed", &state.closed)
            .finish()
    }
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be non-zero");
        Self {
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Condvar::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue without blocking
    pub fn try_push(&self, item: T) -> Result<(), PushError<T>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PushError::Closed(item));
        }
        if state.items.len() >= self.capacity {
            return Err(PushError::Full(item));
        }
        state.items.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Dequeue, waiting for an item. Returns `None` once the ring is closed and drained.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            if state.closed {
                return None;
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Stop accepting items and wake every waiting consumer
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.not_empty.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_full_ring_drops_newest_and_keeps_fifo() {
        let ring = RingBuffer::new(DEFAULT_CAPACITY);
        for i in 0..DEFAULT_CAPACITY + 1 {
            let result = ring.try_push(i);
            if i < DEFAULT_CAPACITY {
                assert!(result.is_ok());
            } else {
                assert_eq!(result, Err(PushError::Full(DEFAULT_CAPACITY)));
            }
        }
        assert_eq!(ring.len(), DEFAULT_CAPACITY);

        ring.close();
        let drained: Vec<_> = std::iter::from_fn(|| ring.pop()).collect();
        assert_eq!(drained, (0..DEFAULT_CAPACITY).collect::<Vec<_>>());
    }

    #[test]
    fn test_closed_ring_rejects_and_drains() {
        let ring = RingBuffer::new(4);
        ring.try_push(1).unwrap();
        ring.close();
        assert_eq!(ring.try_push(2), Err(PushError::Closed(2)));
        assert_eq!(ring.pop(), Some(1));
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn test_close_wakes_blocked_consumers() {
        let ring: Arc<RingBuffer<u32>> = Arc::new(RingBuffer::new(8));
        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let ring = ring.clone();
                thread::spawn(move || ring.pop())
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        ring.close();
        for consumer in consumers {
            assert_eq!(consumer.join().unwrap(), None);
        }
    }

    #[test]
    fn test_consumer_receives_pushed_items() {
        let ring: Arc<RingBuffer<u32>> = Arc::new(RingBuffer::new(16));
        let consumer = {
            let ring = ring.clone();
            thread::spawn(move || std::iter::from_fn(|| ring.pop()).sum::<u32>())
        };
        for i in 1..=10 {
            ring.try_push(i).unwrap();
        }
        ring.close();
        assert_eq!(consumer.join().unwrap(), 55);
    }
}
