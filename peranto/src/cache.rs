//! A generic TTL cache for credential material with refresh-ahead semantics
//!
//! The cache never performs I/O of its own. Callers consult
//! [`needs_refresh`][CredentialCache::needs_refresh] and decide whether to
//! fetch a replacement; a value past its expiry is never returned. Entries
//! are immutable once inserted and are replaced wholesale on refresh, which
//! keeps concurrent readers safe without read-side locking tricks.

use std::{
    borrow::Borrow,
    collections::HashMap,
    hash::Hash,
    sync::{Arc, RwLock},
};

use aliri_clock::{Clock, DurationSecs, System, UnixTime};

/// A credential value together with its lifetime bounds
///
/// `refresh_at` always precedes `expires_at`, giving callers a window in
/// which the old value remains usable while a replacement is obtained.
#[derive(Clone, Debug)]
pub struct CachedCredential<T> {
    value: Arc<T>,
    issued_at: UnixTime,
    expires_at: UnixTime,
    refresh_at: UnixTime,
}

impl<T> CachedCredential<T> {
    /// The cached value
    pub fn value(&self) -> &Arc<T> {
        &self.value
    }

    /// The time the value was inserted into the cache
    pub fn issued_at(&self) -> UnixTime {
        self.issued_at
    }

    /// The time after which the value must no longer be used
    pub fn expires_at(&self) -> UnixTime {
        self.expires_at
    }

    /// The time after which a replacement should be sought
    pub fn refresh_at(&self) -> UnixTime {
        self.refresh_at
    }

    fn is_expired_at(&self, now: UnixTime) -> bool {
        now >= self.expires_at
    }

    fn is_refresh_due_at(&self, now: UnixTime) -> bool {
        now >= self.refresh_at
    }
}

/// A bounded TTL cache of credentials, keyed by `K`
///
/// One instance backs each credential concern: per-tenant signing keys use
/// a longer refresh buffer and a small bound, while upstream access tokens
/// use a short buffer and a single logical entry.
#[derive(Debug)]
pub struct CredentialCache<K, T, C = System> {
    entries: RwLock<HashMap<K, CachedCredential<T>>>,
    refresh_buffer: DurationSecs,
    max_entries: usize,
    clock: C,
}

impl<K, T> CredentialCache<K, T> {
    /// Constructs an unbounded cache with the given refresh buffer
    ///
    /// A value becomes refresh-due once `now >= expires_at - refresh_buffer`.
    pub fn new(refresh_buffer: DurationSecs) -> Self {
        Self::bounded(refresh_buffer, usize::MAX)
    }

    /// Constructs a cache holding at most `max_entries` values
    ///
    /// When full, inserting a new key evicts the entry closest to expiry.
    pub fn bounded(refresh_buffer: DurationSecs, max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            refresh_buffer,
            max_entries: max_entries.max(1),
            clock: System,
        }
    }
}

impl<K, T, C> CredentialCache<K, T, C> {
    /// Sets a custom clock to be used
    ///
    /// Useful for testing purposes
    pub fn with_clock<D>(self, clock: D) -> CredentialCache<K, T, D> {
        CredentialCache {
            entries: self.entries,
            refresh_buffer: self.refresh_buffer,
            max_entries: self.max_entries,
            clock,
        }
    }
}

impl<K, T, C> CredentialCache<K, T, C>
where
    K: Eq + Hash + Clone,
    C: Clock,
{
    /// Gets the cached value for `key`, if present and not yet expired
    ///
    /// A value that is refresh-due but still within its lifetime is
    /// returned as-is; deciding whether to refresh is the caller's job.
    pub fn get<Q>(&self, key: &Q) -> Option<Arc<T>>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        let now = self.clock.now();
        let entries = self.entries.read().expect("credential cache lock poisoned");
        entries
            .get(key)
            .filter(|e| !e.is_expired_at(now))
            .map(|e| Arc::clone(&e.value))
    }

    /// Reports whether the value for `key` is absent, expired, or refresh-due
    pub fn needs_refresh<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        let now = self.clock.now();
        let entries = self.entries.read().expect("credential cache lock poisoned");
        entries
            .get(key)
            .map(|e| e.is_refresh_due_at(now))
            .unwrap_or(true)
    }

    /// Inserts or replaces the value for `key` with the given lifetime
    ///
    /// The refresh point is set `refresh_buffer` ahead of expiry, clamped to
    /// the insertion time so that `refresh_at < expires_at` always holds.
    /// A zero lifetime is ignored: an already-expired value is useless.
    pub fn set(&self, key: K, value: T, ttl: DurationSecs) {
        if ttl.0 == 0 {
            tracing::warn!("refusing to cache a credential with a zero lifetime");
            return;
        }

        let issued_at = self.clock.now();
        let expires_at = issued_at + ttl;
        let refresh_at = if self.refresh_buffer.0 >= ttl.0 {
            issued_at
        } else {
            expires_at - self.refresh_buffer
        };

        let entry = CachedCredential {
            value: Arc::new(value),
            issued_at,
            expires_at,
            refresh_at,
        };

        let mut entries = self
            .entries
            .write()
            .expect("credential cache lock poisoned");

        if !entries.contains_key(&key) && entries.len() >= self.max_entries {
            entries.retain(|_, e| !e.is_expired_at(issued_at));

            if entries.len() >= self.max_entries {
                let evict = entries
                    .iter()
                    .min_by_key(|(_, e)| e.expires_at)
                    .map(|(k, _)| k.clone());
                if let Some(evict) = evict {
                    entries.remove(&evict);
                }
            }
        }

        entries.insert(key, entry);
    }

    /// Removes the value for `key`, if present
    pub fn remove<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        let mut entries = self
            .entries
            .write()
            .expect("credential cache lock poisoned");
        entries.remove(key);
    }

    /// Drops every cached value
    pub fn clear(&self) {
        let mut entries = self
            .entries
            .write()
            .expect("credential cache lock poisoned");
        entries.clear();
    }

    /// The number of entries currently held, including expired ones
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .expect("credential cache lock poisoned")
            .len()
    }

    /// Whether the cache currently holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use aliri_clock::TestClock;

    use super::*;

    fn cache_at(buffer: u64, now: u64) -> CredentialCache<String, String, TestClock> {
        CredentialCache::new(DurationSecs(buffer)).with_clock(TestClock::new(UnixTime(now)))
    }

    #[test]
    fn absent_key_needs_refresh() {
        let cache = cache_at(60, 1000);
        assert!(cache.needs_refresh("missing"));
        assert!(cache.get("missing").is_none());
    }

    #[test]
    fn fresh_value_is_returned_without_refresh() {
        let cache = cache_at(60, 1000);
        cache.set("k".to_owned(), "v".to_owned(), DurationSecs(300));
        assert_eq!(cache.get("k").as_deref(), Some(&"v".to_owned()));
        assert!(!cache.needs_refresh("k"));
    }

    #[test]
    fn refresh_due_value_is_still_returned() {
        let clock = TestClock::new(UnixTime(1000));
        let cache = CredentialCache::new(DurationSecs(60)).with_clock(clock.clone());
        cache.set("k".to_owned(), "v".to_owned(), DurationSecs(300));

        clock.set(UnixTime(1250));
        assert!(cache.needs_refresh("k"));
        assert!(cache.get("k").is_some());
    }

    #[test]
    fn expired_value_is_never_returned() {
        let clock = TestClock::new(UnixTime(1000));
        let cache = CredentialCache::new(DurationSecs(60)).with_clock(clock.clone());
        cache.set("k".to_owned(), "v".to_owned(), DurationSecs(300));

        clock.set(UnixTime(1300));
        assert!(cache.get("k").is_none());
        assert!(cache.needs_refresh("k"));
    }

    #[test]
    fn short_lifetimes_are_immediately_refresh_due_but_valid() {
        let cache = cache_at(60, 1000);
        cache.set("k".to_owned(), "v".to_owned(), DurationSecs(30));
        assert!(cache.needs_refresh("k"));
        assert!(cache.get("k").is_some());
    }

    #[test]
    fn zero_lifetime_is_not_cached() {
        let cache = cache_at(60, 1000);
        cache.set("k".to_owned(), "v".to_owned(), DurationSecs(0));
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn replacing_a_value_updates_its_lifetime() {
        let clock = TestClock::new(UnixTime(1000));
        let cache = CredentialCache::new(DurationSecs(10)).with_clock(clock.clone());
        cache.set("k".to_owned(), "one".to_owned(), DurationSecs(100));

        clock.set(UnixTime(1050));
        cache.set("k".to_owned(), "two".to_owned(), DurationSecs(100));

        clock.set(UnixTime(1120));
        assert_eq!(cache.get("k").as_deref(), Some(&"two".to_owned()));
    }

    #[test]
    fn full_cache_evicts_the_soonest_to_expire_entry() {
        let cache = CredentialCache::bounded(DurationSecs(1), 2)
            .with_clock(TestClock::new(UnixTime(1000)));
        cache.set("long".to_owned(), "a".to_owned(), DurationSecs(500));
        cache.set("short".to_owned(), "b".to_owned(), DurationSecs(100));
        cache.set("new".to_owned(), "c".to_owned(), DurationSecs(300));

        assert_eq!(cache.len(), 2);
        assert!(cache.get("short").is_none());
        assert!(cache.get("long").is_some());
        assert!(cache.get("new").is_some());
    }
}
