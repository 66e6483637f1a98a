//! Per-user session state owned by a plugin.
//!
//! Plugins that remember something about a caller between messages (the
//! bulletin board's "active board", a menu position) keep it here, keyed by
//! sender id. With a TTL, an entry expires once it has gone unused for that
//! long; reads and writes both count as use. Without one, entries live until
//! removed.

use std::collections::HashMap;
use std::sync::Mutex;
use tokio::time::{Duration, Instant};

struct Slot<T> {
    value: T,
    touched: Instant,
}

pub struct SessionStore<T> {
    entries: Mutex<HashMap<String, Slot<T>>>,
    ttl: Option<Duration>,
}

impl<T: Clone> SessionStore<T> {
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Slot<T>>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn expired(&self, slot: &Slot<T>, now: Instant) -> bool {
        self.ttl
            .is_some_and(|ttl| now.duration_since(slot.touched) >= ttl)
    }

    pub fn get(&self, user: &str) -> Option<T> {
        let now = Instant::now();
        let mut entries = self.lock();
        let expired = entries.get(user).is_some_and(|slot| self.expired(slot, now));
        if expired {
            entries.remove(user);
            return None;
        }
        entries.get_mut(user).map(|slot| {
            slot.touched = now;
            slot.value.clone()
        })
    }

    /// Store `value` for `user`, returning the previous live value.
    pub fn set(&self, user: &str, value: T) -> Option<T> {
        let now = Instant::now();
        let previous = self.lock().insert(
            user.to_string(),
            Slot {
                value,
                touched: now,
            },
        );
        previous.filter(|slot| !self.expired(slot, now)).map(|slot| slot.value)
    }

    pub fn remove(&self, user: &str) -> Option<T> {
        self.lock().remove(user).map(|slot| slot.value)
    }

    /// Drop every expired entry; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, slot| !self.expired(slot, now));
        before - entries.len()
    }

    /// Live (unexpired) entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock()
            .values()
            .filter(|slot| !self.expired(slot, now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
