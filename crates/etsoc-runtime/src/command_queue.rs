// SPDX-License-Identifier: AGPL-3.0-only

//! Blocking thread-safe FIFO
//!
//! Multiple producers, any number of consumers. `pop` and `front` park the
//! calling thread until an item arrives or the queue is closed.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

#[derive(Debug)]
struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// FIFO shared between submitting threads and a dispatch thread
#[derive(Debug)]
pub struct CommandQueue<T> {
    state: Mutex<State<T>>,
    available: Condvar,
}

impl<T> Default for CommandQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CommandQueue<T> {
    /// Create an empty, open queue
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                items: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Append an item and wake one waiting consumer.
    ///
    /// Returns the item back if the queue is closed.
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` after [`close`](Self::close).
    pub fn push(&self, item: T) -> Result<(), T> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(item);
        }
        state.items.push_back(item);
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    /// Block until an item is available and remove it.
    ///
    /// Returns `None` once the queue is closed and empty.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            if state.closed {
                return None;
            }
            self.available.wait(&mut state);
        }
    }

    /// Like [`pop`](Self::pop) but gives up after `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            if state.closed {
                return None;
            }
            if self.available.wait_for(&mut state, timeout).timed_out() {
                return state.items.pop_front();
            }
        }
    }

    /// Remove the head without blocking.
    pub fn try_pop(&self) -> Option<T> {
        self.state.lock().items.pop_front()
    }

    /// Remove everything still queued.
    pub fn drain(&self) -> Vec<T> {
        self.state.lock().items.drain(..).collect()
    }

    /// Refuse further pushes and wake every waiter.
    ///
    /// Items already queued can still be popped.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.available.notify_all();
    }

    /// True after [`close`](Self::close)
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Items currently queued
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// True if nothing is queued
    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }
}

impl<T: Clone> CommandQueue<T> {
    /// Block until an item is available and return a copy, leaving it queued.
    ///
    /// Returns `None` once the queue is closed and empty.
    pub fn front(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.front() {
                let item = item.clone();
                drop(state);
                // Another consumer may be parked behind us on the same item.
                self.available.notify_one();
                return Some(item);
            }
            if state.closed {
                return None;
            }
            self.available.wait(&mut state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_order() {
        let q = CommandQueue::new();
        for i in 0..5 {
            q.push(i).unwrap();
        }
        let out: Vec<_> = (0..5).filter_map(|_| q.try_pop()).collect();
        assert_eq!(out, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn front_leaves_item_in_place() {
        let q = CommandQueue::new();
        q.push("a").unwrap();
        q.push("b").unwrap();
        assert_eq!(q.front(), Some("a"));
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop(), Some("a"));
        assert_eq!(q.front(), Some("b"));
    }

    #[test]
    fn pop_blocks_until_push() {
        let q = Arc::new(CommandQueue::new());
        let consumer = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.pop())
        };
        thread::sleep(Duration::from_millis(20));
        q.push(42).unwrap();
        assert_eq!(consumer.join().unwrap(), Some(42));
    }

    #[test]
    fn close_releases_waiters() {
        let q: Arc<CommandQueue<u32>> = Arc::new(CommandQueue::new());
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let q = Arc::clone(&q);
                thread::spawn(move || q.pop())
            })
            .collect();
        thread::sleep(Duration::from_millis(20));
        q.close();
        for w in waiters {
            assert_eq!(w.join().unwrap(), None);
        }
        assert_eq!(q.push(1), Err(1));
    }

    #[test]
    fn queued_items_survive_close() {
        let q = CommandQueue::new();
        q.push(1).unwrap();
        q.close();
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn pop_timeout_expires() {
        let q: CommandQueue<u8> = CommandQueue::new();
        assert_eq!(q.pop_timeout(Duration::from_millis(10)), None);
    }

    #[test]
    fn many_producers_one_consumer() {
        let q = Arc::new(CommandQueue::new());
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let q = Arc::clone(&q);
                thread::spawn(move || {
                    for i in 0..250 {
                        q.push(p * 1000 + i).unwrap();
                    }
                })
            })
            .collect();
        let mut seen = Vec::new();
        while seen.len() < 1000 {
            seen.push(q.pop().unwrap());
        }
        for p in producers {
            p.join().unwrap();
        }
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 1000);
    }
}
