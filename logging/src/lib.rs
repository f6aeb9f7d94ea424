//! Common event-logging infrastructure.
//!
//! A [`Registry`] binds named logging streams (e.g. `"cnc/step"`,
//! `"cnc/item"`) to an action invoked on buffered batches of timestamped
//! events. Nobody pays for logging they don't register a destination for:
//! `Registry::get` on an unbound name returns `None`, and the macro-free
//! `log!` call sites throughout the core are simple `if let Some(l) = ...`
//! checks.
//!
//! The registry is keyed by an arbitrary `Id: Clone`, so the same registry
//! type serves the per-worker `"cnc/step"` stream and the per-process
//! `"cnc/comm"` stream.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// A collection of named, independently-destined logging streams.
pub struct Registry<Id> {
    time: Instant,
    id: Id,
    map: HashMap<String, Box<dyn Any>>,
    // A flush thunk per bound stream, kept alongside `map` because the
    // erased `Box<dyn Any>` above cannot be called without re-downcasting
    // to a `T` nobody here still has a name for.
    flushers: HashMap<String, Box<dyn Fn()>>,
}

impl<Id: Clone + 'static> Registry<Id> {
    /// Creates a new, empty registry bound to a common start instant and an
    /// identifier (e.g. worker index) attached to every event through the
    /// logger's `id()`.
    pub fn new(time: Instant, id: Id) -> Self {
        Registry { time, id, map: HashMap::new(), flushers: HashMap::new() }
    }

    /// Binds a stream name to an action invoked on event batches.
    ///
    /// Returns any previously-bound action under the same name, without
    /// redirecting loggers that already hold a clone of the old stream.
    pub fn insert<T: 'static>(
        &mut self,
        name: &str,
        action: Box<dyn Fn(&Id, &Duration, &[(Duration, T)])>,
    ) -> Option<Box<dyn Any>> {
        let logger = Logger::new(self.time, self.id.clone(), action);
        let flush_handle = logger.clone();
        self.flushers.insert(name.to_owned(), Box::new(move || flush_handle.flush()));
        self.map.insert(name.to_owned(), Box::new(logger))
    }

    /// Removes a bound stream, signalling its end to any consumer that
    /// drives the action off of `Logger` being dropped.
    pub fn remove(&mut self, name: &str) -> Option<Box<dyn Any>> {
        self.flushers.remove(name);
        self.map.remove(name)
    }

    /// Retrieves a shared handle to a named stream, if one is bound.
    pub fn get<T: 'static>(&self, name: &str) -> Option<Logger<Id, T>> {
        self.map
            .get(name)
            .and_then(|entry| entry.downcast_ref::<Logger<Id, T>>())
            .cloned()
    }

    /// Flushes every bound stream's buffer.
    pub fn flush(&mut self) {
        // Streams flush themselves on every full buffer and on `Logger::flush`;
        // this sweep catches partially-filled buffers at natural breakpoints
        // (e.g. the end of a scheduler step) so consumers see output promptly.
        for flusher in self.flushers.values() {
            flusher();
        }
    }
}

/// A cloneable, buffering handle to a single named logging stream.
pub struct Logger<Id, T> {
    time: Instant,
    id: Id,
    action: Rc<Box<dyn Fn(&Id, &Duration, &[(Duration, T)])>>,
    buffer: Rc<RefCell<Vec<(Duration, T)>>>,
}

impl<Id: Clone, T> Clone for Logger<Id, T> {
    fn clone(&self) -> Self {
        Logger {
            time: self.time,
            id: self.id.clone(),
            action: self.action.clone(),
            buffer: self.buffer.clone(),
        }
    }
}

const DEFAULT_BUFFER_CAPACITY: usize = 1024;

impl<Id: Clone, T> Logger<Id, T> {
    /// Allocates a new stream handle bound to a destination action.
    pub fn new(time: Instant, id: Id, action: Box<dyn Fn(&Id, &Duration, &[(Duration, T)])>) -> Self {
        Logger {
            time,
            id,
            action: Rc::new(action),
            buffer: Rc::new(RefCell::new(Vec::with_capacity(DEFAULT_BUFFER_CAPACITY))),
        }
    }

    /// Logs one event, timestamped at the moment of the call (but possibly
    /// delivered to the action later, once the buffer is flushed).
    pub fn log(&self, event: T) {
        let mut buffer = self.buffer.borrow_mut();
        buffer.push((self.time.elapsed(), event));
        if buffer.len() == buffer.capacity() {
            (self.action)(&self.id, &self.time.elapsed(), &buffer[..]);
            buffer.clear();
        }
    }

    /// Forces delivery of any buffered events.
    pub fn flush(&self) {
        let mut buffer = self.buffer.borrow_mut();
        if !buffer.is_empty() {
            (self.action)(&self.id, &self.time.elapsed(), &buffer[..]);
            buffer.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn logger_buffers_until_capacity_or_flush() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry: Registry<usize> = Registry::new(Instant::now(), 0);
        let seen2 = seen.clone();
        registry.insert::<&'static str>(
            "test",
            Box::new(move |id, _now, events| {
                for (_, event) in events {
                    seen2.lock().unwrap().push((*id, *event));
                }
            }),
        );
        let logger = registry.get::<&'static str>("test").unwrap();
        logger.log("a");
        logger.log("b");
        assert!(seen.lock().unwrap().is_empty(), "events stay buffered until flush");
        logger.flush();
        assert_eq!(*seen.lock().unwrap(), vec![(0, "a"), (0, "b")]);
    }

    #[test]
    fn unbound_stream_returns_none() {
        let registry: Registry<usize> = Registry::new(Instant::now(), 0);
        assert!(registry.get::<u32>("missing").is_none());
    }
}
