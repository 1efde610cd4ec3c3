//! Bounded hand-off ring between the preprocessor and downstream stages.
//!
//! The ring is a fixed-capacity FIFO sized for burst absorption, not for
//! steady-state buffering. The common deployment is one producer (the
//! preprocessor) and one consumer (the next pipeline stage), but both sides
//! are safe with any number of threads. After [`close`](Ring::close),
//! readers drain what is queued and then observe end-of-stream.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;

/// A rejected [`Ring::write`], handing the item back to the caller.
#[derive(Debug, PartialEq, Eq)]
pub enum WriteError<T> {
    /// The ring was full and the write was non-blocking
    Full(T),
    /// The ring is closed; no further writes are accepted
    Closed(T),
}

impl<T> WriteError<T> {
    /// Recovers the item that could not be queued.
    pub fn into_inner(self) -> T {
        match self {
            WriteError::Full(item) | WriteError::Closed(item) => item,
        }
    }
}

struct RingState<T> {
    queue: VecDeque<T>,
    closed: bool,
}

/// Bounded MPMC FIFO. See the [module docs](self).
pub struct Ring<T> {
    state: Mutex<RingState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T> std::fmt::Debug for Ring<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ring")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<T> Ring<T> {
    /// Creates a ring holding at most `capacity` items.
    ///
    /// # Panics
    ///
    /// Panics when `capacity` is 0; the pipeline builder validates this
    /// before construction.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be greater than 0");
        Self {
            state: Mutex::new(RingState {
                queue: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    /// Queues `item`, or refuses it.
    ///
    /// With `block` set, a full ring suspends the caller until space frees
    /// up; otherwise the item comes straight back as
    /// [`WriteError::Full`]. A closed ring always refuses.
    pub fn write(&self, item: T, block: bool) -> Result<(), WriteError<T>> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(WriteError::Closed(item));
            }
            if state.queue.len() < self.capacity {
                state.queue.push_back(item);
                drop(state);
                self.not_empty.notify_one();
                return Ok(());
            }
            if !block {
                return Err(WriteError::Full(item));
            }
            self.not_full.wait(&mut state);
        }
    }

    /// Takes the next item, suspending until one is queued.
    ///
    /// Returns `None` once the ring is closed and drained.
    pub fn read(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.queue.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Some(item);
            }
            if state.closed {
                return None;
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Takes the next item when one is queued, without suspending.
    pub fn try_read(&self) -> Option<T> {
        let mut state = self.state.lock();
        let item = state.queue.pop_front();
        drop(state);
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Closes the ring: pending and future reads drain the queue and then
    /// observe end-of-stream; writes are refused.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Items currently queued.
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fixed capacity chosen at construction.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// True once [`close`](Ring::close) was called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn fifo_order() {
        let ring = Ring::with_capacity(4);
        ring.write(1, false).unwrap();
        ring.write(2, false).unwrap();
        ring.write(3, false).unwrap();

        assert_eq!(ring.read(), Some(1));
        assert_eq!(ring.read(), Some(2));
        assert_eq!(ring.read(), Some(3));
        assert_eq!(ring.try_read(), None);
    }

    #[test]
    fn nonblocking_write_refuses_when_full() {
        let ring = Ring::with_capacity(1);
        ring.write("a", false).unwrap();

        assert_eq!(ring.write("b", false), Err(WriteError::Full("b")));
        assert_eq!(ring.len(), 1);

        assert_eq!(ring.read(), Some("a"));
        ring.write("b", false).unwrap();
    }

    #[test]
    fn close_drains_then_ends_the_stream() {
        let ring = Ring::with_capacity(4);
        ring.write(1, false).unwrap();
        ring.write(2, false).unwrap();
        ring.close();

        assert_eq!(ring.write(3, false), Err(WriteError::Closed(3)));
        assert_eq!(ring.read(), Some(1));
        assert_eq!(ring.read(), Some(2));
        assert_eq!(ring.read(), None);
        assert_eq!(ring.read(), None);
    }

    #[test]
    fn blocking_read_wakes_on_write() {
        let ring = Arc::new(Ring::with_capacity(2));

        let reader = {
            let ring = ring.clone();
            thread::spawn(move || ring.read())
        };

        thread::sleep(Duration::from_millis(20));
        ring.write(42, false).unwrap();
        assert_eq!(reader.join().unwrap(), Some(42));
    }

    #[test]
    fn blocking_write_wakes_on_read() {
        let ring = Arc::new(Ring::with_capacity(1));
        ring.write(1, false).unwrap();

        let writer = {
            let ring = ring.clone();
            thread::spawn(move || ring.write(2, true))
        };

        thread::sleep(Duration::from_millis(20));
        assert_eq!(ring.read(), Some(1));
        writer.join().unwrap().unwrap();
        assert_eq!(ring.read(), Some(2));
    }

    #[test]
    fn close_wakes_blocked_readers() {
        let ring: Arc<Ring<u32>> = Arc::new(Ring::with_capacity(1));

        let readers: Vec<_> = (0..2)
            .map(|_| {
                let ring = ring.clone();
                thread::spawn(move || ring.read())
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        ring.close();
        for reader in readers {
            assert_eq!(reader.join().unwrap(), None);
        }
    }

    #[test]
    fn many_producers_one_consumer() {
        let ring = Arc::new(Ring::with_capacity(8));

        let producers: Vec<_> = (0..4)
            .map(|p| {
                let ring = ring.clone();
                thread::spawn(move || {
                    for i in 0..100 {
                        ring.write(p * 1000 + i, true).unwrap();
                    }
                })
            })
            .collect();

        let mut seen = Vec::new();
        for _ in 0..400 {
            seen.push(ring.read().unwrap());
        }
        for producer in producers {
            producer.join().unwrap();
        }

        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 400);
    }
}
