//! Expiration scheduling: the pending-operation log, the deadline ladder,
//! and the background purger.
//!
//! Client writes never touch the sorted structure. They append a record to
//! an unsorted per-key log under the store's writer lock and, when the
//! record changes the earliest deadline or the log outgrows its bound,
//! wake the purger. The purger drains the log in one batch, replays it
//! against the ladder (a deadline-sorted sequence of key buckets), evicts
//! whatever has expired, and parks itself until the next head deadline.
//!
//! The purger thread is spawned lazily on the first wake-up and exits on
//! its own after `idle_timeout` with an empty ladder, so an unused store
//! costs no background thread.

use std::collections::HashMap;
use std::hash::Hash;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::store::Shared;

/// Deadline value meaning "the purger has nothing scheduled".
pub(crate) const NO_WAKEUP: u64 = u64::MAX;

/// A prospective edit to the deadline ladder, recorded by a client under
/// the store's writer lock and applied later by the purger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PendingOp {
    /// Schedule eviction at `deadline`.
    Add { deadline: u64 },
    /// Cancel the schedule previously created at `deadline`.
    Del { deadline: u64 },
    /// Cancel the schedule at `old` and re-schedule at `new`.
    Replace { old: u64, new: u64 },
}

/// Unsorted log of pending ladder edits, keyed by entry key.
///
/// At most one record exists per key: later edits coalesce into the
/// earlier record, so a key rewritten in a tight loop occupies one slot
/// no matter how many writes it absorbs. Mutated only under the store's
/// writer lock.
#[derive(Debug)]
pub(crate) struct PendingLog<K> {
    ops: HashMap<K, PendingOp>,
    /// Smallest deadline recorded since the last drain. The purger
    /// consults this before parking to catch records that arrived while
    /// a cycle was in flight.
    min_add: u64,
}

impl<K: Eq + Hash> PendingLog<K> {
    pub(crate) fn new() -> Self {
        Self {
            ops: HashMap::new(),
            min_add: NO_WAKEUP,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.ops.len()
    }

    pub(crate) fn min_add(&self) -> u64 {
        self.min_add
    }

    /// Records that `key` now expires at `new`. `old` is the deadline the
    /// live entry carried before this write, if the write replaced one.
    pub(crate) fn record_add(&mut self, key: K, old: Option<u64>, new: u64) {
        self.min_add = self.min_add.min(new);
        match self.ops.get_mut(&key) {
            None => {
                let op = match old {
                    Some(old) => PendingOp::Replace { old, new },
                    None => PendingOp::Add { deadline: new },
                };
                self.ops.insert(key, op);
            }
            Some(op) => {
                *op = match *op {
                    // The ladder has not seen this key yet.
                    PendingOp::Add { .. } => PendingOp::Add { deadline: new },
                    // The old slot still has to be vacated.
                    PendingOp::Del { deadline } => PendingOp::Replace { old: deadline, new },
                    PendingOp::Replace { old, .. } => PendingOp::Replace { old, new },
                };
            }
        }
    }

    /// Records that `key`, which expired at `old`, left the store.
    pub(crate) fn record_del(&mut self, key: K, old: u64) {
        match self.ops.get(&key).copied() {
            None => {
                self.ops.insert(key, PendingOp::Del { deadline: old });
            }
            // The ladder never saw this key; the two records cancel out.
            Some(PendingOp::Add { .. }) => {
                self.ops.remove(&key);
            }
            // The planned re-add is cancelled, the original slot still
            // has to be vacated.
            Some(PendingOp::Replace { old: first, .. }) => {
                self.ops.insert(key, PendingOp::Del { deadline: first });
            }
            // Latest observation wins.
            Some(PendingOp::Del { .. }) => {
                self.ops.insert(key, PendingOp::Del { deadline: old });
            }
        }
    }

    /// Takes over every record, leaving the log empty.
    pub(crate) fn drain(&mut self) -> HashMap<K, PendingOp> {
        self.min_add = NO_WAKEUP;
        mem::take(&mut self.ops)
    }

    pub(crate) fn clear(&mut self) {
        self.min_add = NO_WAKEUP;
        self.ops.clear();
    }

    #[cfg(test)]
    pub(crate) fn op(&self, key: &K) -> Option<PendingOp> {
        self.ops.get(key).copied()
    }
}

/// All keys scheduled to expire at the same deadline instant.
///
/// The clock may not be strictly monotonic at nanosecond resolution, so
/// equal deadlines are expected; keys sharing one are evicted together in
/// a single pass. Order within a bucket is not observable.
#[derive(Debug)]
struct Bucket<K> {
    deadline: u64,
    keys: Vec<K>,
}

/// The deadline-sorted sequence of buckets, head at the earliest deadline.
///
/// Owned exclusively by the purger thread; all the O(log n) search and
/// shift work happens here, off the client path.
#[derive(Debug)]
pub(crate) struct Ladder<K> {
    buckets: Vec<Bucket<K>>,
}

impl<K: Eq> Ladder<K> {
    pub(crate) fn new() -> Self {
        Self {
            buckets: Vec::new(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub(crate) fn head_deadline(&self) -> Option<u64> {
        self.buckets.first().map(|bucket| bucket.deadline)
    }

    fn find(&self, deadline: u64) -> Result<usize, usize> {
        self.buckets
            .binary_search_by(|bucket| bucket.deadline.cmp(&deadline))
    }

    fn add(&mut self, key: K, deadline: u64) {
        match self.find(deadline) {
            Ok(at) => self.buckets[at].keys.push(key),
            Err(at) => self.buckets.insert(
                at,
                Bucket {
                    deadline,
                    keys: vec![key],
                },
            ),
        }
    }

    /// Removes `key` from the bucket at `deadline`. A missing bucket or
    /// key is expected when the bucket was already evicted before the
    /// delete record was replayed; the record is simply dropped.
    fn del(&mut self, key: &K, deadline: u64) {
        match self.find(deadline) {
            Ok(at) => {
                let bucket = &mut self.buckets[at];
                match bucket.keys.iter().position(|k| k == key) {
                    Some(slot) => {
                        bucket.keys.swap_remove(slot);
                    }
                    None => tracing::debug!(deadline, "stale delete: key not in its bucket"),
                }
                // An empty bucket must not persist.
                if bucket.keys.is_empty() {
                    self.buckets.remove(at);
                }
            }
            Err(_) => tracing::debug!(deadline, "stale delete: no bucket at deadline"),
        }
    }

    fn pop_head(&mut self) -> Bucket<K> {
        self.buckets.remove(0)
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    #[cfg(test)]
    fn keys_at(&self, deadline: u64) -> Option<&[K]> {
        self.find(deadline)
            .ok()
            .map(|at| self.buckets[at].keys.as_slice())
    }
}

/// Applies a drained batch of pending records to the ladder.
fn replay<K: Eq>(ladder: &mut Ladder<K>, ops: HashMap<K, PendingOp>) {
    for (key, op) in ops {
        match op {
            PendingOp::Add { deadline } => ladder.add(key, deadline),
            PendingOp::Del { deadline } => ladder.del(&key, deadline),
            PendingOp::Replace { old, new } => {
                ladder.del(&key, old);
                ladder.add(key, new);
            }
        }
    }
}

/// Purger wake-up state shared between client threads and the worker.
struct WakeState {
    /// Handle of the live purger thread. `None` means no worker exists;
    /// spawning is decided under the wake lock, so at most one runs.
    worker: Option<thread::JoinHandle<()>>,
    /// Set by a client signal; the worker runs a cycle before re-parking.
    has_new_min: bool,
    /// Set by `close()`. The worker exits and is never re-spawned.
    shutdown: bool,
}

/// Park/wake protocol state plus the published wake-up target.
pub(crate) struct TimeoutShared {
    /// Deadline the purger is currently parked on, `NO_WAKEUP` when idle.
    /// Written by the purger, read by clients deciding whether to signal.
    next_wakeup: AtomicU64,
    wake: Mutex<WakeState>,
    wake_cond: Condvar,
}

impl TimeoutShared {
    pub(crate) fn new() -> Self {
        Self {
            next_wakeup: AtomicU64::new(NO_WAKEUP),
            wake: Mutex::new(WakeState {
                worker: None,
                has_new_min: false,
                shutdown: false,
            }),
            wake_cond: Condvar::new(),
        }
    }

    pub(crate) fn next_wakeup(&self) -> u64 {
        self.next_wakeup.load(Ordering::Acquire)
    }

    fn publish_next_wakeup(&self, deadline: u64) {
        self.next_wakeup.store(deadline, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn worker_running(&self) -> bool {
        self.wake.lock().worker.is_some()
    }
}

/// Wakes the purger, spawning it first if no worker thread exists.
///
/// Called by clients after they release the store's writer lock.
pub(crate) fn notify_reschedule<K, V>(shared: &Arc<Shared<K, V>>)
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    let tm = shared.tm();
    let mut wake = tm.wake.lock();
    if wake.shutdown {
        return;
    }
    if wake.worker.is_none() {
        let worker_shared = Arc::clone(shared);
        let spawned = thread::Builder::new()
            .name("lapse-purger".into())
            .spawn(move || purger_main(worker_shared));
        match spawned {
            Ok(handle) => wake.worker = Some(handle),
            Err(err) => {
                // The next write retries the spawn.
                tracing::error!(error = %err, "failed to spawn purger thread");
                return;
            }
        }
    }
    wake.has_new_min = true;
    tm.wake_cond.notify_all();
}

/// Stops the purger and joins it. Idempotent; no worker is ever spawned
/// afterwards.
pub(crate) fn shutdown_worker(tm: &TimeoutShared) {
    let worker = {
        let mut wake = tm.wake.lock();
        wake.shutdown = true;
        tm.wake_cond.notify_all();
        wake.worker.take()
    };
    // Joined outside the wake lock; the worker re-takes it to exit.
    if let Some(worker) = worker {
        let _ = worker.join();
    }
}

/// What the purger does after finishing a maintenance cycle.
enum Target {
    /// A deadline arrived in the log mid-cycle; run another cycle now.
    Immediate,
    /// Park until the head deadline.
    WakeAt(Instant),
    /// Nothing scheduled; park for the idle period, then exit.
    Idle(Instant),
}

/// The purger thread body: alternate maintenance cycles with parking.
fn purger_main<K, V>(shared: Arc<Shared<K, V>>)
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    tracing::debug!("purger started");
    let mut ladder = Ladder::new();
    loop {
        let target = run_cycle(&shared, &mut ladder);

        let tm = shared.tm();
        let mut wake = tm.wake.lock();
        loop {
            if wake.shutdown {
                wake.worker = None;
                tracing::debug!("purger exiting: store closed");
                return;
            }
            if wake.has_new_min {
                wake.has_new_min = false;
                break;
            }
            match target {
                Target::Immediate => break,
                Target::WakeAt(instant) => {
                    if tm.wake_cond.wait_until(&mut wake, instant).timed_out() {
                        break;
                    }
                    // Signalled or woken early: the loop re-checks the
                    // flags and re-parks on the remaining time.
                }
                Target::Idle(until) => {
                    if tm.wake_cond.wait_until(&mut wake, until).timed_out() {
                        // Idle period elapsed with nothing scheduled and
                        // no signal: let the thread go. The next write
                        // re-spawns it.
                        debug_assert!(ladder.is_empty());
                        wake.worker = None;
                        tracing::debug!("purger exiting: idle");
                        return;
                    }
                }
            }
        }
    }
}

/// One maintenance cycle: drain the log, replay it, evict what expired,
/// publish the next wake-up target.
fn run_cycle<K, V>(shared: &Shared<K, V>, ladder: &mut Ladder<K>) -> Target
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    // Take over the pending log in one brief writer-lock section, so
    // client writes are never blocked behind the sorted-structure work.
    let ops = shared.data().write().pending.drain();
    if !ops.is_empty() {
        tracing::trace!(records = ops.len(), "replaying pending log");
    }
    replay(ladder, ops);

    sweep(shared, ladder);

    // Publish the new target while holding the data lock. Clients read
    // and decide under the writer lock, so any record appended before
    // this point has bumped `min_add` and is caught here, and any record
    // appended after it sees the fresh target. Either way no deadline
    // can be left sleeping past its due time.
    let next = ladder.head_deadline().unwrap_or(NO_WAKEUP);
    let data = shared.data().read();
    shared.tm().publish_next_wakeup(next);
    let undercut = data.pending.min_add() < next;
    drop(data);

    if undercut {
        return Target::Immediate;
    }
    if next == NO_WAKEUP {
        Target::Idle(Instant::now() + shared.config().idle_timeout)
    } else {
        Target::WakeAt(shared.instant_at(next))
    }
}

/// Evicts every entry in expired head buckets.
///
/// The writer lock is taken once for the whole sweep, not per bucket.
fn sweep<K, V>(shared: &Shared<K, V>, ladder: &mut Ladder<K>)
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    let now = shared.now_nanos();
    if ladder.head_deadline().map_or(true, |deadline| deadline > now) {
        return;
    }

    let mut evicted = 0usize;
    let mut data = shared.data().write();
    while ladder.head_deadline().is_some_and(|deadline| deadline <= now) {
        let bucket = ladder.pop_head();
        for key in bucket.keys {
            // A write that landed after this bucket was built may have
            // re-scheduled the key; evict only while the live deadline
            // still matches the bucket.
            let matches = data
                .entries
                .get(&key)
                .is_some_and(|entry| entry.deadline() == bucket.deadline);
            if matches {
                data.entries.remove(&key);
                evicted += 1;
            }
        }
    }
    drop(data);

    if evicted > 0 {
        tracing::trace!(evicted, "evicted expired entries");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_on_fresh_key() {
        let mut log = PendingLog::new();
        log.record_add("a", None, 100);

        assert_eq!(log.op(&"a"), Some(PendingOp::Add { deadline: 100 }));
        assert_eq!(log.min_add(), 100);
    }

    #[test]
    fn test_add_replacing_live_entry() {
        let mut log = PendingLog::new();
        log.record_add("a", Some(50), 100);

        assert_eq!(log.op(&"a"), Some(PendingOp::Replace { old: 50, new: 100 }));
    }

    #[test]
    fn test_add_coalesces_over_add() {
        let mut log = PendingLog::new();
        log.record_add("a", None, 100);
        log.record_add("a", Some(100), 200);

        // The ladder never materialized the first deadline, so a plain
        // add at the newest deadline is enough.
        assert_eq!(log.op(&"a"), Some(PendingOp::Add { deadline: 200 }));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_add_coalesces_over_del() {
        let mut log = PendingLog::new();
        log.record_del("a", 50);
        log.record_add("a", None, 200);

        assert_eq!(log.op(&"a"), Some(PendingOp::Replace { old: 50, new: 200 }));
    }

    #[test]
    fn test_add_coalesces_over_replace_keeps_first_old() {
        let mut log = PendingLog::new();
        log.record_add("a", Some(50), 100);
        log.record_add("a", Some(100), 300);

        assert_eq!(log.op(&"a"), Some(PendingOp::Replace { old: 50, new: 300 }));
    }

    #[test]
    fn test_del_on_fresh_key() {
        let mut log = PendingLog::new();
        log.record_del("a", 70);

        assert_eq!(log.op(&"a"), Some(PendingOp::Del { deadline: 70 }));
    }

    #[test]
    fn test_del_cancels_pending_add() {
        let mut log = PendingLog::new();
        log.record_add("a", None, 100);
        log.record_del("a", 100);

        assert_eq!(log.op(&"a"), None);
        assert_eq!(log.len(), 0);
    }

    #[test]
    fn test_del_collapses_replace() {
        let mut log = PendingLog::new();
        log.record_add("a", Some(50), 100);
        log.record_del("a", 100);

        assert_eq!(log.op(&"a"), Some(PendingOp::Del { deadline: 50 }));
    }

    #[test]
    fn test_del_over_del_takes_latest() {
        let mut log = PendingLog::new();
        log.record_del("a", 70);
        log.record_del("a", 90);

        assert_eq!(log.op(&"a"), Some(PendingOp::Del { deadline: 90 }));
    }

    #[test]
    fn test_drain_resets_min_add() {
        let mut log = PendingLog::new();
        log.record_add("a", None, 100);
        log.record_add("b", None, 40);
        assert_eq!(log.min_add(), 40);

        let ops = log.drain();
        assert_eq!(ops.len(), 2);
        assert_eq!(log.len(), 0);
        assert_eq!(log.min_add(), NO_WAKEUP);
    }

    #[test]
    fn test_ladder_keeps_buckets_sorted() {
        let mut ladder = Ladder::new();
        ladder.add("b", 200);
        ladder.add("a", 100);
        ladder.add("c", 300);

        assert_eq!(ladder.head_deadline(), Some(100));
        assert_eq!(ladder.bucket_count(), 3);

        assert_eq!(ladder.pop_head().deadline, 100);
        assert_eq!(ladder.pop_head().deadline, 200);
        assert_eq!(ladder.pop_head().deadline, 300);
        assert!(ladder.is_empty());
    }

    #[test]
    fn test_ladder_groups_equal_deadlines() {
        let mut ladder = Ladder::new();
        ladder.add("a", 100);
        ladder.add("b", 100);

        assert_eq!(ladder.bucket_count(), 1);
        assert_eq!(ladder.keys_at(100).map(<[_]>::len), Some(2));
    }

    #[test]
    fn test_ladder_del_drops_empty_bucket() {
        let mut ladder = Ladder::new();
        ladder.add("a", 100);
        ladder.add("b", 200);

        ladder.del(&"a", 100);

        assert_eq!(ladder.bucket_count(), 1);
        assert_eq!(ladder.head_deadline(), Some(200));
    }

    #[test]
    fn test_ladder_ignores_stale_del() {
        let mut ladder = Ladder::new();
        ladder.add("a", 100);

        // Bucket already gone and key never present; both are ignored.
        ladder.del(&"a", 999);
        ladder.del(&"b", 100);

        assert_eq!(ladder.bucket_count(), 1);
        assert_eq!(ladder.keys_at(100).map(<[_]>::len), Some(1));
    }

    #[test]
    fn test_replay_applies_mixed_batch() {
        let mut ladder = Ladder::new();
        ladder.add("a", 100);
        ladder.add("b", 200);

        let mut ops = HashMap::new();
        ops.insert("a", PendingOp::Replace { old: 100, new: 300 });
        ops.insert("b", PendingOp::Del { deadline: 200 });
        ops.insert("c", PendingOp::Add { deadline: 50 });
        replay(&mut ladder, ops);

        assert_eq!(ladder.head_deadline(), Some(50));
        assert_eq!(ladder.bucket_count(), 2);
        assert_eq!(ladder.keys_at(300).map(<[_]>::len), Some(1));
        assert!(ladder.keys_at(100).is_none());
        assert!(ladder.keys_at(200).is_none());
    }
}
