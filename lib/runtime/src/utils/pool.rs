// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Recycling pool for hot-path allocations.
//!
//! Items are handed out as [`PoolItem`] guards and go back to the pool when the guard drops.
//! Acquisition never blocks: an empty pool builds a fresh item with the factory, and items
//! returned while the pool already holds `max_idle` entries are simply dropped. This bounds
//! allocation churn on the ingress path without ever stalling the receive loop.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Trait for items that can be returned to a pool
pub trait Returnable: Send + Sync + 'static {
    /// Called when an item is returned to the pool
    fn on_return(&mut self) {}
}

impl Returnable for Vec<u8> {
    fn on_return(&mut self) {
        self.clear();
    }
}

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;

struct PoolState<T: Returnable> {
    idle: Mutex<VecDeque<T>>,
    factory: Factory<T>,
    max_idle: usize,
    created: AtomicUsize,
}

impl<T: Returnable> PoolState<T> {
    fn return_to_pool(&self, mut value: T) {
        value.on_return();
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push_back(value);
        }
    }
}

/// Shared, cloneable handle to a recycling pool
pub struct Pool<T: Returnable> {
    state: Arc<PoolState<T>>,
}

impl<T: Returnable> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T: Returnable> Pool<T> {
    /// Create a pool that keeps at most `max_idle` returned items and builds new ones with
    /// `factory`.
    pub fn new<F>(max_idle: usize, factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self {
            state: Arc::new(PoolState {
                idle: Mutex::new(VecDeque::with_capacity(max_idle)),
                factory: Box::new(factory),
                max_idle,
                created: AtomicUsize::new(0),
            }),
        }
    }

    /// Take an idle item, or build a new one when the pool is empty
    pub fn acquire(&self) -> PoolItem<T> {
        let recycled = self.state.idle.lock().pop_front();
        let value = match recycled {
            Some(value) => value,
            None => {
                self.state.created.fetch_add(1, Ordering::Relaxed);
                (self.state.factory)()
            }
        };
        PoolItem {
            value: Some(value),
            state: self.state.clone(),
        }
    }

    /// Number of items currently parked in the pool
    pub fn idle(&self) -> usize {
        self.state.idle.lock().len()
    }

    /// Total number of items the factory has built
    pub fn created(&self) -> usize {
        self.state.created.load(Ordering::Relaxed)
    }
}

/// An item borrowed from a [`Pool`]; returned on drop
pub struct PoolItem<T: Returnable> {
    value: Option<T>,
    state: Arc<PoolState<T>>,
}

impl<T: Returnable> Deref for PoolItem<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // value is only taken in drop
        self.value.as_ref().expect("pool item already detached")
    }
}

impl<T: Returnable> DerefMut for PoolItem<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.value.as_mut().expect("pool item already detached")
    }
}

impl<T: Returnable + std::fmt::Debug> std::fmt::Debug for PoolItem<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolItem").field("value", &self.value).finish()
    }
}

impl<T: Returnable> Drop for PoolItem<T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            self.state.return_to_pool(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    // Implement Returnable for u32 just for testing
    impl Returnable for u32 {
        fn on_return(&mut self) {
            *self = 0;
        }
    }

    #[test]
    fn test_acquire_release() {
        let pool = Pool::new(4, || 7u32);

        let mut item = pool.acquire();
        assert_eq!(*item, 7);
        *item += 10;
        assert_eq!(*item, 17);
        drop(item);

        // returned item is reset and reused instead of building a new one
        assert_eq!(pool.idle(), 1);
        let item = pool.acquire();
        assert_eq!(*item, 0);
        assert_eq!(pool.created(), 1);
    }

    #[test]
    fn test_empty_pool_builds_without_blocking() {
        let pool = Pool::new(1, || 1u32);
        let a = pool.acquire();
        let b = pool.acquire();
        assert_eq!(pool.created(), 2);
        drop(a);
        drop(b);
        // only max_idle items are retained
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn test_vec_is_cleared_but_keeps_capacity() {
        let pool = Pool::new(2, || Vec::with_capacity(4096));
        let mut buf = pool.acquire();
        buf.extend_from_slice(&[1, 2, 3]);
        drop(buf);

        let buf = pool.acquire();
        assert!(buf.is_empty());
        assert!(buf.capacity() >= 4096);
    }

    #[test]
    fn test_concurrent_return() {
        let pool = Pool::new(64, || 0u32);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        let mut item = pool.acquire();
                        *item += 1;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(pool.created() <= 8);
        assert_eq!(pool.idle(), pool.created());
    }
}
