//! Event broadcaster - fan-out of outbound events to observers
//!
//! Each subscriber owns a bounded queue. `publish` never waits on a slow
//! subscriber: when a queue is full its oldest entry is dropped and the
//! subscriber is marked lagging. Sequence numbers are assigned under the
//! registry lock, so every subscriber sees events in publish order.

use crate::domain::events::OutboundEvent;
use crate::infra::metrics::Metrics;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Published event with its global sequence number
#[derive(Debug, Clone)]
pub struct Envelope {
    pub seq: u64,
    pub event: Arc<OutboundEvent>,
}

/// Delivery counters for one subscriber
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberStatus {
    pub name: String,
    pub queued: usize,
    pub delivered: u64,
    pub dropped: u64,
    pub lagging: bool,
}

struct Slot {
    name: String,
    queue: Mutex<VecDeque<Envelope>>,
    notify: Notify,
    lagging: AtomicBool,
    closed: AtomicBool,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl Slot {
    /// Enqueue, dropping the oldest entry when full. Returns true on overflow.
    fn push(&self, envelope: Envelope, capacity: usize) -> bool {
        let overflowed = {
            let mut queue = self.queue.lock();
            let overflowed = queue.len() >= capacity;
            if overflowed {
                queue.pop_front();
            }
            queue.push_back(envelope);
            overflowed
        };
        if overflowed {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            if !self.lagging.swap(true, Ordering::AcqRel) {
                warn!(subscriber = %self.name, "subscriber_lagging");
            }
        }
        self.notify.notify_one();
        overflowed
    }

    fn status(&self) -> SubscriberStatus {
        SubscriberStatus {
            name: self.name.clone(),
            queued: self.queue.lock().len(),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            lagging: self.lagging.load(Ordering::Acquire),
        }
    }
}

struct Registry {
    slots: FxHashMap<u64, Arc<Slot>>,
    next_id: u64,
    next_seq: u64,
    closed: bool,
}

struct Shared {
    registry: Mutex<Registry>,
    capacity: usize,
    metrics: Arc<Metrics>,
}

#[derive(Clone)]
pub struct Broadcaster {
    shared: Arc<Shared>,
}

impl Broadcaster {
    /// `capacity` is the per-subscriber queue bound (at least 1)
    pub fn new(capacity: usize, metrics: Arc<Metrics>) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry: Mutex::new(Registry {
                    slots: FxHashMap::default(),
                    next_id: 0,
                    next_seq: 0,
                    closed: false,
                }),
                capacity: capacity.max(1),
                metrics,
            }),
        }
    }

    /// Deliver to every current subscriber. Returns the sequence number,
    /// or `None` once closed.
    pub fn publish(&self, event: OutboundEvent) -> Option<u64> {
        let event = Arc::new(event);
        let mut registry = self.shared.registry.lock();
        if registry.closed {
            return None;
        }
        registry.next_seq += 1;
        let seq = registry.next_seq;

        for slot in registry.slots.values() {
            let envelope = Envelope { seq, event: Arc::clone(&event) };
            if slot.push(envelope, self.shared.capacity) {
                self.shared.metrics.record_event_overflow();
            }
        }
        drop(registry);

        self.shared.metrics.record_event_published();
        debug!(seq = %seq, event = %event.name(), "event_published");
        Some(seq)
    }

    /// Register a subscriber. It receives events published after this call.
    pub fn subscribe(&self, name: impl Into<String>) -> Subscription {
        let slot = Arc::new(Slot {
            name: name.into(),
            queue: Mutex::new(VecDeque::with_capacity(self.shared.capacity)),
            notify: Notify::new(),
            lagging: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });

        let mut registry = self.shared.registry.lock();
        registry.next_id += 1;
        let id = registry.next_id;
        if registry.closed {
            slot.closed.store(true, Ordering::Release);
        } else {
            registry.slots.insert(id, Arc::clone(&slot));
        }
        drop(registry);

        debug!(subscriber = %slot.name, id = %id, "subscriber_added");
        Subscription { id, slot, shared: Arc::clone(&self.shared) }
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.registry.lock().slots.len()
    }

    pub fn subscribers(&self) -> Vec<SubscriberStatus> {
        let registry = self.shared.registry.lock();
        let mut all: Vec<_> = registry.slots.values().map(|slot| slot.status()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Stop accepting events. Subscribers drain what is queued, then `recv` returns `None`.
    pub fn close(&self) {
        let mut registry = self.shared.registry.lock();
        registry.closed = true;
        for slot in registry.slots.values() {
            slot.closed.store(true, Ordering::Release);
            slot.notify.notify_one();
        }
    }
}

/// Receiving side of one subscriber; unregisters on drop
pub struct Subscription {
    id: u64,
    slot: Arc<Slot>,
    shared: Arc<Shared>,
}

impl Subscription {
    pub fn name(&self) -> &str {
        &self.slot.name
    }

    /// Next event in publish order; `None` once the broadcaster is closed and drained
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            if let Some(envelope) = self.try_recv() {
                return Some(envelope);
            }
            if self.slot.closed.load(Ordering::Acquire) {
                return None;
            }
            // notify_one stores a permit, so a publish between the checks is not lost
            self.slot.notify.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Option<Envelope> {
        let envelope = self.slot.queue.lock().pop_front()?;
        self.slot.delivered.fetch_add(1, Ordering::Relaxed);
        Some(envelope)
    }

    pub fn status(&self) -> SubscriberStatus {
        self.slot.status()
    }

    /// Read and clear the lagging flag
    pub fn take_lagged(&mut self) -> bool {
        self.slot.lagging.swap(false, Ordering::AcqRel)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.shared.registry.lock().slots.remove(&self.id);
        debug!(subscriber = %self.slot.name, "subscriber_removed");
    }
}
