//! I/O readiness notification.
//!
//! A [`SelectHandle`] is the consumer side of a `select`/`poll` style wait:
//! interested parties register it with a descriptor, producers mark events
//! ready on it, and the consumer blocks until any of them fire. Producers
//! that serve many waiters keep them in a [`SelectPool`].

use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use parking_lot::{Condvar, Mutex};

bitflags! {
    /// Readiness event flavors.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SelectEvents: u16 {
        /// Data can be read without blocking.
        const READ = 1 << 0;
        /// Data can be written without blocking.
        const WRITE = 1 << 1;
        /// An error condition is pending.
        const ERROR = 1 << 2;
        /// The other end has gone away.
        const DISCONNECTED = 1 << 3;
        /// The descriptor itself became invalid while selected.
        const INVALID = 1 << 4;
    }
}

/// A waitable readiness sink.
#[derive(Debug, Default)]
pub struct SelectHandle {
    ready: Mutex<SelectEvents>,
    condition: Condvar,
}

impl SelectHandle {
    /// Creates a fresh handle with no events pending.
    pub fn new() -> Arc<SelectHandle> {
        Arc::new(SelectHandle::default())
    }

    /// Marks `events` ready and wakes all waiters.
    pub fn notify(&self, events: SelectEvents) {
        let mut ready = self.ready.lock();
        *ready |= events;
        self.condition.notify_all();
    }

    /// The currently pending events, without waiting.
    pub fn ready(&self) -> SelectEvents {
        *self.ready.lock()
    }

    /// Clears pending events, typically after consuming them.
    pub fn clear(&self, events: SelectEvents) {
        let mut ready = self.ready.lock();
        *ready &= !events;
    }

    /// Blocks until at least one event is pending and returns the set.
    pub fn wait(&self) -> SelectEvents {
        let mut ready = self.ready.lock();
        while ready.is_empty() {
            self.condition.wait(&mut ready);
        }
        *ready
    }

    /// As [`SelectHandle::wait`], giving up after `timeout`. Returns the
    /// pending set, which is empty on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> SelectEvents {
        let mut ready = self.ready.lock();
        if ready.is_empty() {
            self.condition.wait_for(&mut ready, timeout);
        }
        *ready
    }
}

/// A producer-side collection of registered handles. Not internally
/// synchronized; the owning object guards it with its own lock.
#[derive(Debug, Default)]
pub(crate) struct SelectPool {
    entries: Vec<(Arc<SelectHandle>, SelectEvents)>,
}

impl SelectPool {
    /// Registers interest of `handle` in `events`.
    pub(crate) fn add(&mut self, handle: &Arc<SelectHandle>, events: SelectEvents) {
        for (existing, selected) in &mut self.entries {
            if Arc::ptr_eq(existing, handle) {
                *selected |= events;
                return;
            }
        }
        self.entries.push((handle.clone(), events));
    }

    /// Withdraws interest of `handle` in `events`, dropping the entry when
    /// nothing remains selected.
    pub(crate) fn remove(&mut self, handle: &Arc<SelectHandle>, events: SelectEvents) {
        self.entries.retain_mut(|(existing, selected)| {
            if Arc::ptr_eq(existing, handle) {
                *selected &= !events;
                !selected.is_empty()
            } else {
                true
            }
        });
    }

    /// Whether no handle is registered.
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Notifies every handle interested in `event`.
    pub(crate) fn notify(&self, event: SelectEvents) {
        for (handle, selected) in &self.entries {
            if selected.intersects(event) {
                handle.notify(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notify_wakes_waiter() {
        let handle = SelectHandle::new();
        let waiter = {
            let handle = handle.clone();
            std::thread::spawn(move || handle.wait())
        };
        std::thread::sleep(Duration::from_millis(20));
        handle.notify(SelectEvents::READ);
        assert_eq!(waiter.join().unwrap(), SelectEvents::READ);
    }

    #[test]
    fn pool_routes_by_interest() {
        let mut pool = SelectPool::default();
        let reader = SelectHandle::new();
        let writer = SelectHandle::new();
        pool.add(&reader, SelectEvents::READ);
        pool.add(&writer, SelectEvents::WRITE);

        pool.notify(SelectEvents::READ);
        assert_eq!(reader.ready(), SelectEvents::READ);
        assert!(writer.ready().is_empty());

        pool.remove(&reader, SelectEvents::READ);
        assert!(pool.is_empty() || !pool.entries.iter().any(|(h, _)| Arc::ptr_eq(h, &reader)));
    }

    #[test]
    fn wait_timeout_returns_empty() {
        let handle = SelectHandle::new();
        assert!(handle.wait_timeout(Duration::from_millis(10)).is_empty());
    }
}
