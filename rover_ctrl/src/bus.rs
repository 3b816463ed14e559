//! # Reading Bus
//!
//! Multicast of decoded [`Reading`]s from a rover link to any number of subscribers.
//!
//! Handlers run on the publishing thread, in subscription order, and see readings in the order
//! they were published. A handler which may take a while should be subscribed with
//! [`ReadingBus::subscribe_offloaded`] so it gets its own thread and cannot stall the others.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use comms_if::rover::Reading;
use log::{debug, trace};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc::channel,
        Arc, Mutex,
    },
    thread,
};

use crate::lock;

// ------------------------------------------------------------------------------------------------
// TYPES
// ------------------------------------------------------------------------------------------------

/// A function called with every published reading.
pub type Handler = Arc<dyn Fn(&Reading) + Send + Sync>;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Handle identifying one subscription, used to unsubscribe.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub struct ReadingBus {
    next_id: AtomicU64,

    subscribers: Mutex<Vec<(SubscriptionId, Handler)>>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Could not spawn the subscriber thread: {0}")]
    SpawnError(std::io::Error),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl ReadingBus {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Register a handler called on the publishing thread for every reading.
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&Reading) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));

        lock(&self.subscribers).push((id, Arc::new(handler)));

        debug!("Subscriber {:?} added", id);

        id
    }

    /// Register a handler which runs on its own thread.
    ///
    /// Readings are queued to the thread in publish order, so the handler still sees them in
    /// order, but the publisher never waits for it. The thread exits once the subscription is
    /// removed and the queue has drained.
    pub fn subscribe_offloaded<F>(
        &self,
        name: &str,
        mut handler: F,
    ) -> Result<SubscriptionId, BusError>
    where
        F: FnMut(Reading) + Send + 'static,
    {
        let (tx, rx) = channel::<Reading>();

        thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                for reading in rx {
                    handler(reading);
                }
            })
            .map_err(BusError::SpawnError)?;

        // Sender is only Sync on recent toolchains
        let tx = Mutex::new(tx);

        Ok(self.subscribe(move |reading| {
            lock(&tx).send(reading.clone()).ok();
        }))
    }

    /// Remove a subscription.
    ///
    /// Returns `false` if it was not (or no longer) subscribed. A publish already in progress
    /// on another thread may still deliver its current reading to the removed handler.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = lock(&self.subscribers);
        let num_before = subscribers.len();

        subscribers.retain(|(s, _)| *s != id);

        let removed = subscribers.len() != num_before;
        if removed {
            debug!("Subscriber {:?} removed", id);
        }
        removed
    }

    /// Deliver a reading to every current subscriber.
    ///
    /// The subscriber list is copied before delivery, so handlers may subscribe or unsubscribe
    /// (themselves or others) without deadlocking or skipping anyone in this round.
    pub fn publish(&self, reading: &Reading) {
        let snapshot: Vec<(SubscriptionId, Handler)> = lock(&self.subscribers).clone();

        trace!("Publishing reading to {} subscribers", snapshot.len());

        for (id, handler) in snapshot {
            // Skip handlers removed by an earlier handler in this round
            if !self.is_subscribed(id) {
                continue;
            }
            handler(reading);
        }
    }

    pub fn is_subscribed(&self, id: SubscriptionId) -> bool {
        lock(&self.subscribers).iter().any(|(s, _)| *s == id)
    }

    pub fn num_subscribers(&self) -> usize {
        lock(&self.subscribers).len()
    }
}

impl Default for ReadingBus {
    fn default() -> Self {
        Self::new()
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use crate::loopback::reading_at;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_publish_order() {
        let bus = ReadingBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_a = seen.clone();
        bus.subscribe(move |r| lock(&seen_a).push(("a", r.speed)));
        let seen_b = seen.clone();
        bus.subscribe(move |r| lock(&seen_b).push(("b", r.speed)));

        bus.publish(&reading_at(0, 1.0));
        bus.publish(&reading_at(50, 2.0));

        assert_eq!(
            *lock(&seen),
            vec![("a", 1.0), ("b", 1.0), ("a", 2.0), ("b", 2.0)]
        );
    }

    #[test]
    fn test_unsubscribe() {
        let bus = ReadingBus::new();
        let count = Arc::new(AtomicU64::new(0));

        let c = count.clone();
        let id = bus.subscribe(move |_| {
            c.fetch_add(1, Ordering::Relaxed);
        });

        bus.publish(&reading_at(0, 0.0));
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.publish(&reading_at(10, 0.0));

        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert_eq!(bus.num_subscribers(), 0);
    }

    #[test]
    fn test_unsubscribe_during_publish() {
        let bus = Arc::new(ReadingBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let victim: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));

        // The first handler removes the second, the third must still be called
        let (b, v) = (bus.clone(), victim.clone());
        let s = seen.clone();
        bus.subscribe(move |_| {
            lock(&s).push(1);
            if let Some(id) = lock(&v).take() {
                b.unsubscribe(id);
            }
        });
        let s = seen.clone();
        let id = bus.subscribe(move |_| lock(&s).push(2));
        let s = seen.clone();
        bus.subscribe(move |_| lock(&s).push(3));
        *lock(&victim) = Some(id);

        bus.publish(&reading_at(0, 0.0));
        bus.publish(&reading_at(10, 0.0));

        assert_eq!(*lock(&seen), vec![1, 3, 1, 3]);
    }

    #[test]
    fn test_offloaded_subscriber() {
        let bus = ReadingBus::new();
        let (tx, rx) = mpsc::channel();

        let id = bus
            .subscribe_offloaded("test_sub", move |r| {
                // A slow handler must not hold up the publisher
                thread::sleep(Duration::from_millis(20));
                tx.send(r.speed).ok();
            })
            .unwrap();

        for i in 0..3 {
            bus.publish(&reading_at(i * 50, i as f64));
        }

        let got: Vec<f64> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        assert_eq!(got, vec![0.0, 1.0, 2.0]);

        assert!(bus.unsubscribe(id));
    }
}
