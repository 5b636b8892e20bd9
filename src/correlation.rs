//! Request/response correlation table.
//!
//! A `Correlator` owns every in-flight entry for one component (a transport
//! session or the execution bridge). An entry is inserted when a request is
//! sent and removed exactly once, by whichever comes first:
//!
//! - a matching reply (`resolve`),
//! - the waiter's timeout ([`Pending::wait`] returns [`Settled::TimedOut`]),
//! - a bulk abort (`fail_all`, used on disconnect),
//! - the waiter being dropped before any of the above.
//!
//! The removal happens under the table lock, so the losing path always finds
//! the entry gone and becomes a no-op.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

struct Waiter<T> {
    submitted_at: Instant,
    reply: oneshot::Sender<T>,
}

/// Terminal outcome of one waiter.
#[derive(Debug, PartialEq)]
pub enum Settled<T> {
    Resolved(T),
    TimedOut,
    /// The sender went away without a value. Only happens if the owning
    /// component is dropped mid-flight.
    Dropped,
}

pub struct Correlator<K, T> {
    entries: Mutex<HashMap<K, Waiter<T>>>,
}

impl<K, T> Default for Correlator<K, T>
where
    K: Eq + Hash + Clone + std::fmt::Display,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T> Correlator<K, T>
where
    K: Eq + Hash + Clone + std::fmt::Display,
{
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Register a new in-flight entry. The entry lives until the returned
    /// guard settles it or is dropped.
    pub fn insert(&self, key: K) -> Pending<'_, K, T> {
        let (tx, rx) = oneshot::channel();
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.insert(
            key.clone(),
            Waiter {
                submitted_at: Instant::now(),
                reply: tx,
            },
        );
        Pending {
            table: self,
            key,
            rx: Some(rx),
            settled: false,
        }
    }

    /// Deliver `value` to the waiter for `key`. Returns `false` when there is
    /// no such entry (unknown id, or already settled).
    pub fn resolve(&self, key: &K, value: T) -> bool {
        let waiter = {
            let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
            entries.remove(key)
        };
        match waiter {
            Some(w) => {
                tracing::trace!(
                    key = %key,
                    elapsed_ms = w.submitted_at.elapsed().as_millis() as u64,
                    "correlation: resolved"
                );
                // The receiver may already be gone if the caller was cancelled.
                let _ = w.reply.send(value);
                true
            }
            None => false,
        }
    }

    /// Remove an entry without delivering anything.
    pub fn remove(&self, key: &K) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.remove(key).is_some()
    }

    /// Settle every entry with a value built from its key. Returns how many
    /// entries were settled; the table is empty afterwards.
    pub fn fail_all(&self, make: impl Fn(&K) -> T) -> usize {
        let drained: Vec<(K, Waiter<T>)> = {
            let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
            entries.drain().collect()
        };
        let count = drained.len();
        for (key, waiter) in drained {
            let _ = waiter.reply.send(make(&key));
        }
        count
    }

    pub fn contains(&self, key: &K) -> bool {
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Caller side of one in-flight entry.
pub struct Pending<'a, K, T>
where
    K: Eq + Hash + Clone + std::fmt::Display,
{
    table: &'a Correlator<K, T>,
    key: K,
    rx: Option<oneshot::Receiver<T>>,
    settled: bool,
}

impl<K, T> Pending<'_, K, T>
where
    K: Eq + Hash + Clone + std::fmt::Display,
{
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Wait for the entry to settle, at most `timeout`.
    ///
    /// On timeout the entry is claimed here; if a reply claimed it first the
    /// reply wins and is returned instead.
    pub async fn wait(mut self, timeout: Duration) -> Settled<T> {
        let Some(mut rx) = self.rx.take() else {
            return Settled::Dropped;
        };
        let outcome = match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(value)) => Settled::Resolved(value),
            Ok(Err(_)) => Settled::Dropped,
            Err(_) => {
                if self.table.remove(&self.key) {
                    Settled::TimedOut
                } else {
                    match rx.await {
                        Ok(value) => Settled::Resolved(value),
                        Err(_) => Settled::Dropped,
                    }
                }
            }
        };
        self.settled = true;
        outcome
    }
}

impl<K, T> Drop for Pending<'_, K, T>
where
    K: Eq + Hash + Clone + std::fmt::Display,
{
    fn drop(&mut self) {
        if !self.settled && self.table.remove(&self.key) {
            tracing::trace!(key = %self.key, "correlation: abandoned");
        }
    }
}
