//! In-flight request bookkeeping.
//!
//! [`RequestRegistry`] is the single source of truth for "is key X in flight". Every component
//! asks it instead of keeping its own flags, which is what prevents two connections for one key.
//!
//! Each registration carries:
//! - a [`CancellationToken`] that owns the lifetime of the underlying connection,
//! - a registration id, so a finishing request can never remove a newer registration of the same
//!   key,
//! - the key's [`ProgressiveByteStore`] once one exists. Keeping the store inside the entry makes
//!   "attach a reader to the live stream" and "the stream finished" mutually exclusive.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::TtsResult;
use crate::key::RequestKey;
use crate::storage::{Completion, ProgressiveByteStore};

struct InFlight {
    id: u64,
    token: CancellationToken,
    store: Option<ProgressiveByteStore>,
}

/// Ticket for a successful [`RequestRegistry::try_register`].
#[derive(Debug, Clone)]
pub struct Registration {
    pub key: RequestKey,
    pub id: u64,
    pub token: CancellationToken,
}

/// What [`RequestRegistry::release`] removed.
#[derive(Debug, Default)]
pub struct Released {
    /// False if the registration had already been cancelled or replaced.
    pub removed: bool,
    pub store: Option<ProgressiveByteStore>,
}

/// Concurrent registry of in-flight requests, keyed by [`RequestKey`].
#[derive(Default)]
pub struct RequestRegistry {
    in_flight: DashMap<RequestKey, InFlight>,
    next_id: AtomicU64,
    cache_hits: AtomicU64,
}

impl std::fmt::Debug for RequestRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestRegistry")
            .field("in_flight", &self.in_flight.len())
            .field("cache_hits", &self.cache_hits())
            .finish()
    }
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically register `key`. Returns `None` if it is already in flight.
    pub fn try_register(&self, key: &RequestKey) -> Option<Registration> {
        match self.in_flight.entry(key.clone()) {
            Entry::Occupied(_) => {
                trace!("registry: already in flight key='{}'", key);
                None
            }
            Entry::Vacant(slot) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let token = CancellationToken::new();
                slot.insert(InFlight {
                    id,
                    token: token.clone(),
                    store: None,
                });
                debug!(key = %key, id, "request registered");
                Some(Registration {
                    key: key.clone(),
                    id,
                    token,
                })
            }
        }
    }

    /// Remove `key` regardless of which registration owns it. Returns true if it was present.
    ///
    /// Does not cancel the connection; see [`cancel`](Self::cancel).
    pub fn unregister(&self, key: &RequestKey) -> bool {
        let removed = self.in_flight.remove(key).is_some();
        if removed {
            debug!(key = %key, "request unregistered");
        }
        removed
    }

    /// Remove the entry owned by `reg`, handing back its store.
    ///
    /// After this returns no reader can attach to the request's store through the registry.
    pub fn release(&self, reg: &Registration) -> Released {
        match self.in_flight.remove_if(&reg.key, |_, v| v.id == reg.id) {
            Some((_, entry)) => {
                debug!(key = %reg.key, id = reg.id, "request released");
                Released {
                    removed: true,
                    store: entry.store,
                }
            }
            None => Released::default(),
        }
    }

    /// Cancel the request for `key`: remove it, terminate its connection and complete its store
    /// as [`Completion::Cancelled`]. Returns true if the key was in flight.
    ///
    /// The token is cancelled before the entry disappears, so a task whose
    /// [`release`](Self::release) finds nothing always observes the cancellation.
    pub fn cancel(&self, key: &RequestKey) -> bool {
        let removed = self.in_flight.remove_if(key, |_, entry| {
            entry.token.cancel();
            true
        });
        let Some((_, entry)) = removed else {
            return false;
        };
        if let Some(store) = entry.store {
            store.complete_with(Completion::Cancelled);
        }
        debug!(key = %key, id = entry.id, "request cancelled");
        true
    }

    /// Cancel every in-flight request. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let keys: Vec<RequestKey> = self.in_flight.iter().map(|e| e.key().clone()).collect();
        keys.iter().filter(|k| self.cancel(k)).count()
    }

    pub fn is_in_flight(&self, key: &RequestKey) -> bool {
        self.in_flight.contains_key(key)
    }

    /// Number of in-flight requests.
    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }

    /// Store of the request owned by `reg`, creating it with `create` if it has none yet.
    ///
    /// Returns `None` once `reg` was released, cancelled or replaced by a newer registration of
    /// the same key; a stale request can never reach a newer request's store.
    pub fn attach_store<F>(&self, reg: &Registration, create: F) -> Option<TtsResult<ProgressiveByteStore>>
    where
        F: FnOnce() -> TtsResult<ProgressiveByteStore>,
    {
        self.attach(&reg.key, Some(reg.id), create)
    }

    /// Store of whichever request is in flight for `key`, creating it with `create` if needed.
    ///
    /// Returns `None` if `key` is not in flight; no store is kept in that case.
    pub fn live_store<F>(&self, key: &RequestKey, create: F) -> Option<TtsResult<ProgressiveByteStore>>
    where
        F: FnOnce() -> TtsResult<ProgressiveByteStore>,
    {
        self.attach(key, None, create)
    }

    fn attach<F>(
        &self,
        key: &RequestKey,
        id: Option<u64>,
        create: F,
    ) -> Option<TtsResult<ProgressiveByteStore>>
    where
        F: FnOnce() -> TtsResult<ProgressiveByteStore>,
    {
        let owned = |entry: &InFlight| id.map_or(true, |id| entry.id == id);
        {
            let entry = self.in_flight.get(key)?;
            if !owned(&*entry) {
                trace!("registry: stale attach key='{}' id={:?}", key, id);
                return None;
            }
            if let Some(store) = &entry.store {
                return Some(Ok(store.clone()));
            }
        }

        // File I/O happens outside the shard lock. A store that loses the race below is dropped
        // and removes its own backing file.
        let created = match create() {
            Ok(store) => store,
            Err(e) => return Some(Err(e)),
        };

        let mut entry = self.in_flight.get_mut(key)?;
        if !owned(&*entry) {
            trace!("registry: stale attach key='{}' id={:?}", key, id);
            return None;
        }
        let store = entry.store.get_or_insert_with(|| {
            trace!("registry: store attached key='{}'", key);
            created
        });
        Some(Ok(store.clone()))
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of requests short-circuited to the cache so far.
    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }
}
