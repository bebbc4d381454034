use std::collections::hash_map::Entry as MapEntry;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::config::StoreConfig;
use crate::entry::Entry;
use crate::timeout::{self, PendingLog, TimeoutShared, NO_WAKEUP};

/// Cap on the accepted timeout (about 100 years) so deadline arithmetic
/// and `Instant` addition cannot overflow.
const MAX_TIMEOUT_MS: u64 = 100 * 365 * 24 * 60 * 60 * 1000;

const NANOS_PER_MS: u64 = 1_000_000;

/// Entry map plus the pending-operation log, guarded as a unit.
///
/// Keeping both behind one lock is what lets a write capture the old
/// deadline and record the matching ladder edit atomically.
pub(crate) struct CacheData<K, V> {
    pub(crate) entries: HashMap<K, Entry<V>>,
    pub(crate) pending: PendingLog<K>,
    pub(crate) closed: bool,
}

/// State shared between store handles and the purger thread.
pub(crate) struct Shared<K, V> {
    data: RwLock<CacheData<K, V>>,
    tm: TimeoutShared,
    config: StoreConfig,
    /// Base instant all deadlines are measured from.
    base: Instant,
}

impl<K: Eq + Hash, V> Shared<K, V> {
    fn new(config: StoreConfig) -> Self {
        Self {
            data: RwLock::new(CacheData {
                entries: HashMap::new(),
                pending: PendingLog::new(),
                closed: false,
            }),
            tm: TimeoutShared::new(),
            config,
            base: Instant::now(),
        }
    }

    pub(crate) fn data(&self) -> &RwLock<CacheData<K, V>> {
        &self.data
    }

    pub(crate) fn tm(&self) -> &TimeoutShared {
        &self.tm
    }

    pub(crate) fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Nanoseconds elapsed since the store's base instant.
    pub(crate) fn now_nanos(&self) -> u64 {
        self.base.elapsed().as_nanos() as u64
    }

    /// Converts a deadline back into the instant the purger parks on.
    pub(crate) fn instant_at(&self, deadline: u64) -> Instant {
        self.base + Duration::from_nanos(deadline)
    }

    fn deadline_after(&self, timeout_ms: u64) -> u64 {
        let capped = timeout_ms.min(MAX_TIMEOUT_MS);
        self.now_nanos().saturating_add(capped * NANOS_PER_MS)
    }

    fn pending_limit(&self, live: usize) -> usize {
        self.config
            .pending_max
            .max(self.config.pending_ratio.saturating_mul(live))
    }
}

/// Thread-safe in-memory key-value store with per-entry expiration
///
/// Every insert carries a timeout in milliseconds; an entry that is not
/// removed or overwritten before its deadline is evicted by a background
/// purger parked on the earliest deadline. Client operations stay O(1):
/// they append to an unsorted pending log under the map's writer lock and
/// leave all sorting and searching to the purger.
///
/// Cloning a `Store` yields another handle to the same map. The purger
/// thread is spawned on first use and exits after an idle period, so an
/// unused store has no background thread.
///
/// # Example
///
/// ```rust
/// use lapse_core::Store;
///
/// let store = Store::new();
///
/// // Entry expires 5 minutes from now unless removed first.
/// store.put("user:123".to_string(), "Ada".to_string(), 300_000);
///
/// assert_eq!(store.get(&"user:123".to_string()), Some("Ada".to_string()));
///
/// store.remove(&"user:123".to_string());
/// store.close();
/// ```
pub struct Store<K, V> {
    shared: Arc<Shared<K, V>>,
}

impl<K, V> Clone for Store<K, V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K, V> Store<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates a new store with default configuration
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    /// Creates a new store with custom configuration
    pub fn with_config(config: StoreConfig) -> Self {
        Self {
            shared: Arc::new(Shared::new(config)),
        }
    }

    /// Inserts or replaces the entry for `key`, expiring after `timeout_ms`
    ///
    /// A zero timeout is a no-op and inserts nothing, so callers may pass
    /// computed timeouts without guarding. Replacing an entry reschedules
    /// its eviction at the new deadline, whether earlier or later.
    pub fn put(&self, key: K, value: V, timeout_ms: u64) {
        if timeout_ms == 0 {
            return;
        }
        let deadline = self.shared.deadline_after(timeout_ms);
        let need_wake = {
            let mut data = self.shared.data().write();
            if data.closed {
                return;
            }
            let old = match data.entries.entry(key.clone()) {
                MapEntry::Occupied(mut slot) => Some(slot.get_mut().replace(value, deadline)),
                MapEntry::Vacant(slot) => {
                    slot.insert(Entry::new(value, deadline));
                    None
                }
            };
            data.pending.record_add(key, old, deadline);
            self.put_needs_wake(&data, old, deadline)
        };
        // The purger is signalled outside the writer lock.
        if need_wake {
            timeout::notify_reschedule(&self.shared);
        }
    }

    /// Retrieves the value for `key`
    ///
    /// Returns `None` if the key was never inserted, was removed, or has
    /// been evicted. An entry past its deadline but not yet swept may
    /// still be observed; once absent it stays absent unless re-inserted.
    pub fn get(&self, key: &K) -> Option<V> {
        let data = self.shared.data().read();
        data.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Removes the entry for `key`, returning its value
    ///
    /// Removing an absent key is a no-op and returns `None`.
    pub fn remove(&self, key: &K) -> Option<V> {
        let mut need_wake = false;
        let removed = {
            let mut data = self.shared.data().write();
            if data.closed {
                return None;
            }
            match data.entries.remove(key) {
                None => None,
                Some(entry) => {
                    let (value, old) = entry.into_parts();
                    data.pending.record_del(key.clone(), old);
                    need_wake = self.del_needs_wake(&data, old);
                    Some(value)
                }
            }
        };
        if need_wake {
            timeout::notify_reschedule(&self.shared);
        }
        removed
    }

    /// Returns the number of live entries
    pub fn len(&self) -> usize {
        self.shared.data().read().entries.len()
    }

    /// Returns `true` if the store holds no entries
    pub fn is_empty(&self) -> bool {
        self.shared.data().read().entries.is_empty()
    }

    /// Checks whether `key` is present
    pub fn contains_key(&self, key: &K) -> bool {
        self.shared.data().read().entries.contains_key(key)
    }

    /// Returns a snapshot of the live keys
    pub fn keys(&self) -> Vec<K> {
        self.shared
            .data()
            .read()
            .entries
            .keys()
            .cloned()
            .collect()
    }

    /// Stops the purger thread and clears the store
    ///
    /// Idempotent. Afterwards `get` returns `None` and `put`/`remove` are
    /// silent no-ops. A store dropped without `close()` cleans up on its
    /// own: remaining entries expire on schedule and the purger exits
    /// once idle.
    pub fn close(&self) {
        timeout::shutdown_worker(self.shared.tm());
        let mut data = self.shared.data().write();
        data.closed = true;
        data.entries.clear();
        data.pending.clear();
    }

    /// A wake-up is needed when the purger is idle, when the new deadline
    /// undercuts the parked target, when the parked target is the slot
    /// being vacated, or when the pending log outgrew its bound.
    fn put_needs_wake(&self, data: &CacheData<K, V>, old: Option<u64>, new: u64) -> bool {
        let next = self.shared.tm().next_wakeup();
        next == NO_WAKEUP
            || new < next
            || old == Some(next)
            || data.pending.len() > self.shared.pending_limit(data.entries.len())
    }

    fn del_needs_wake(&self, data: &CacheData<K, V>, old: u64) -> bool {
        old == self.shared.tm().next_wakeup()
            || data.pending.len() > self.shared.pending_limit(data.entries.len())
    }

    #[cfg(test)]
    fn purger_running(&self) -> bool {
        self.shared.tm().worker_running()
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.shared.data().read().pending.len()
    }
}

impl<K, V> Default for Store<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn sleep_ms(ms: u64) {
        thread::sleep(Duration::from_millis(ms));
    }

    #[test]
    fn test_get_absent_key() {
        let store: Store<String, u32> = Store::new();
        assert_eq!(store.get(&"x".to_string()), None);
        assert_eq!(store.len(), 0);
        assert!(store.is_empty());
    }

    #[test]
    fn test_zero_timeout_is_noop() {
        let store: Store<&str, u32> = Store::new();
        store.put("a", 1, 0);

        assert_eq!(store.len(), 0);
        assert_eq!(store.get(&"a"), None);
        // Nothing was scheduled, so no background thread exists either.
        assert!(!store.purger_running());
    }

    #[test]
    fn test_basic_expiry() {
        let store: Store<&str, u32> = Store::new();
        store.put("a", 1, 200);

        assert_eq!(store.get(&"a"), Some(1));
        sleep_ms(100);
        assert_eq!(store.get(&"a"), Some(1));
        sleep_ms(300);
        assert_eq!(store.get(&"a"), None);
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_out_of_order_expiration() {
        let store: Store<&str, u32> = Store::new();
        store.put("k1", 1, 250);
        store.put("k2", 2, 300);
        store.put("k3", 3, 100);

        sleep_ms(150);
        assert_eq!(store.get(&"k3"), None);
        assert_eq!(store.get(&"k1"), Some(1));
        assert_eq!(store.get(&"k2"), Some(2));

        store.remove(&"k2");
        assert_eq!(store.get(&"k2"), None);
        assert_eq!(store.get(&"k1"), Some(1));
    }

    #[test]
    fn test_replace_shortens_deadline() {
        let store: Store<&str, u32> = Store::new();
        store.put("a", 1, 1000);
        store.put("a", 2, 100);

        sleep_ms(200);
        assert_eq!(store.get(&"a"), None);
    }

    #[test]
    fn test_replace_lengthens_deadline() {
        let store: Store<&str, u32> = Store::new();
        store.put("a", 1, 100);
        store.put("a", 2, 1000);

        sleep_ms(300);
        assert_eq!(store.get(&"a"), Some(2));
        sleep_ms(1000);
        assert_eq!(store.get(&"a"), None);
    }

    #[test]
    fn test_replace_updates_value_immediately() {
        let store: Store<&str, &str> = Store::new();
        store.put("a", "first", 60_000);
        store.put("a", "second", 60_000);

        assert_eq!(store.get(&"a"), Some("second"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_remove_returns_value() {
        let store: Store<&str, u32> = Store::new();
        store.put("a", 7, 60_000);

        assert_eq!(store.remove(&"a"), Some(7));
        assert_eq!(store.get(&"a"), None);
        // Removing again changes nothing.
        assert_eq!(store.remove(&"a"), None);
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_contains_and_keys() {
        let store: Store<String, u32> = Store::new();
        store.put("a".to_string(), 1, 60_000);
        store.put("b".to_string(), 2, 60_000);

        assert!(store.contains_key(&"a".to_string()));
        assert!(!store.contains_key(&"c".to_string()));

        let mut keys = store.keys();
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_clone_shares_data() {
        let store1: Store<&str, u32> = Store::new();
        let store2 = store1.clone();

        store1.put("a", 1, 60_000);
        assert_eq!(store2.get(&"a"), Some(1));

        store2.put("b", 2, 60_000);
        assert_eq!(store1.get(&"b"), Some(2));
        assert_eq!(store1.len(), 2);
    }

    #[test]
    fn test_close_stops_purger_and_clears() {
        let store: Store<&str, u32> = Store::new();
        store.put("a", 1, 60_000);
        store.put("b", 2, 60_000);
        assert!(store.purger_running());

        store.close();

        assert!(!store.purger_running());
        assert_eq!(store.get(&"a"), None);
        assert_eq!(store.len(), 0);

        // Operations after close are silent no-ops.
        store.put("c", 3, 60_000);
        assert_eq!(store.get(&"c"), None);
        assert_eq!(store.remove(&"a"), None);
        assert!(!store.purger_running());

        // Closing again is harmless.
        store.close();
    }

    #[test]
    fn test_purger_spawns_lazily_and_idles_out() {
        let config = StoreConfig::default().with_idle_timeout(Duration::from_millis(100));
        let store: Store<&str, u32> = Store::with_config(config);
        assert!(!store.purger_running());

        store.put("a", 1, 50);
        assert!(store.purger_running());

        // Entry evicted at ~50ms, idle period over at ~150ms.
        sleep_ms(400);
        assert_eq!(store.get(&"a"), None);
        assert!(!store.purger_running());

        // The next insert brings the worker back.
        store.put("b", 2, 50);
        assert!(store.purger_running());
        sleep_ms(400);
        assert_eq!(store.get(&"b"), None);
        assert!(!store.purger_running());
    }

    #[test]
    fn test_pending_log_stays_bounded_under_churn() {
        let store: Store<&str, u32> = Store::new();
        for round in 0..500 {
            store.put("hot", round, 60_000);
        }
        // Rewrites of one key coalesce into a single pending record, so
        // the log never outgrows its floor.
        assert!(store.pending_len() <= 32);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_parallel_stress() {
        let store: Store<String, usize> = Store::new();
        let threads = 10;
        let keys_per_thread = 100;

        let mut handles = Vec::new();
        for thread_id in 0..threads {
            let store = store.clone();
            handles.push(thread::spawn(move || {
                for i in 0..keys_per_thread {
                    let key = format!("t{}:k{}", thread_id, i);
                    let value = thread_id * keys_per_thread + i;
                    let timeout_ms = 150 + ((thread_id * 17 + i * 31) % 101) as u64;
                    store.put(key.clone(), value, timeout_ms);
                    assert_eq!(store.get(&key), Some(value));
                }
                for i in 0..keys_per_thread {
                    let key = format!("t{}:k{}", thread_id, i);
                    store.remove(&key);
                    assert_eq!(store.get(&key), None);
                }
            }));
        }
        for handle in handles {
            handle.join().expect("worker thread panicked");
        }

        assert_eq!(store.len(), 0);

        // Give the purger time to drain the backlog of cancelled
        // schedules; nothing may reappear.
        sleep_ms(400);
        assert_eq!(store.len(), 0);
        store.close();
    }

    #[test]
    fn test_eviction_is_monotone() {
        let store: Store<&str, u32> = Store::new();
        store.put("a", 1, 100);

        sleep_ms(250);
        assert_eq!(store.get(&"a"), None);

        // Re-inserting is the only way back in.
        store.put("a", 2, 60_000);
        assert_eq!(store.get(&"a"), Some(2));
    }
}
