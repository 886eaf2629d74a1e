//! Completion events and how they reach the caller.
//!
//! Events are delivered exactly once, from whichever thread serviced the
//! ring, and never while a session lock is held.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use crossbeam_channel::Sender;

use crate::ring::RingId;
use crate::session::SessionId;
use crate::topology::DevId;

/// Destination for completion events of type `E`.
pub enum Notifier<E> {
    Callback(Arc<dyn Fn(E) + Send + Sync>),
    Channel(Sender<E>),
}

impl<E> Notifier<E> {
    pub fn callback(f: impl Fn(E) + Send + Sync + 'static) -> Self {
        Notifier::Callback(Arc::new(f))
    }

    pub fn channel(tx: Sender<E>) -> Self {
        Notifier::Channel(tx)
    }

    pub(crate) fn deliver(&self, event: E) {
        match self {
            Notifier::Callback(f) => f(event),
            Notifier::Channel(tx) => {
                if tx.send(event).is_err() {
                    tracing::debug!("completion receiver dropped");
                }
            }
        }
    }
}

impl<E> Clone for Notifier<E> {
    fn clone(&self) -> Self {
        match self {
            Notifier::Callback(f) => Notifier::Callback(Arc::clone(f)),
            Notifier::Channel(tx) => Notifier::Channel(tx.clone()),
        }
    }
}

impl<E> fmt::Debug for Notifier<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notifier::Callback(_) => f.write_str("Notifier::Callback"),
            Notifier::Channel(_) => f.write_str("Notifier::Channel"),
        }
    }
}

// ── Events ──────────────────────────────────────────────────────────

/// A pushed instruction-list batch finished executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IlCompletion {
    pub session: SessionId,
    /// Buffers the batch was transmitted in.
    pub buffers: u32,
    /// At least one buffer reported an error.
    pub error: bool,
}

/// One sub-transfer of a read-block operation completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadBlockEvent {
    /// First entry covered, relative to the start of the request.
    pub offset: u32,
    pub count: u32,
    pub error: bool,
    /// `count` entries as read from the device.
    pub data: Bytes,
}

/// Every targeted pipe acknowledged a write-block operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteBlockEvent {
    /// Physical pipes written.
    pub pipe_mask: u32,
    pub error: bool,
}

/// A read instruction list completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadIlEvent {
    pub error: bool,
    pub data: Bytes,
}

/// Unsolicited learn, stat or idle notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub dev: DevId,
    pub ring: RingId,
    pub error: bool,
    pub data: Bytes,
}

// ── Deferred delivery ───────────────────────────────────────────────

/// Events collected under a session lock, delivered once it is dropped.
#[derive(Default)]
pub(crate) struct Deferred(Vec<Box<dyn FnOnce() + Send>>);

impl Deferred {
    pub fn push<E: Send + 'static>(&mut self, notifier: Notifier<E>, event: E) {
        self.0.push(Box::new(move || notifier.deliver(event)));
    }

    pub fn run(self) {
        for f in self.0 {
            f();
        }
    }
}
