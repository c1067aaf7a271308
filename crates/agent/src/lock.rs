//! Per-session mutual exclusion.
//!
//! One live lock per session id, owned by the run that acquired it. Callers
//! that find a session busy park as waiters until the holder releases, the
//! holder's lock expires, or their acquire timeout elapses. Locks carry an
//! expiry so a crashed holder can't wedge a session forever; waiters notice
//! it on their own, and `spawn_cleanup` only reclaims memory.
//!
//! The table is process-local. Construct one manager and hand it to the
//! orchestrator; there is no global instance.

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use vaultmind_config::LockConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionLock {
    pub session_id: String,
    pub run_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SessionLock {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Releases a run's lock when dropped unless [`disarm`](Self::disarm)ed.
///
/// Held by the orchestrator for the lifetime of a run, so a caller that
/// drops the run future mid-flight doesn't leave the session locked.
pub struct SessionLockGuard {
    manager: Arc<SessionLockManager>,
    session_id: String,
    run_id: String,
    armed: bool,
}

impl SessionLockGuard {
    pub fn new(
        manager: Arc<SessionLockManager>,
        session_id: impl Into<String>,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            manager,
            session_id: session_id.into(),
            run_id: run_id.into(),
            armed: true,
        }
    }

    /// The run released the lock itself; do nothing on drop.
    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for SessionLockGuard {
    fn drop(&mut self) {
        if self.armed && self.manager.release(&self.session_id, &self.run_id) {
            warn!(
                session_id = %self.session_id,
                run_id = %self.run_id,
                "Run dropped while holding the session lock, released"
            );
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    #[error("Timeout waiting for session lock after {waited_ms}ms")]
    Timeout { waited_ms: u64 },

    #[error("Session lock acquired by another run")]
    Contended,

    #[error("Lock manager was reset while waiting")]
    Reset,
}

/// Result of [`SessionLockManager::acquire`]. Failure is data, not an `Err`.
#[derive(Debug, Clone)]
pub struct AcquireOutcome {
    pub success: bool,
    pub lock: Option<SessionLock>,
    pub error: Option<LockError>,
    pub waited_ms: u64,
}

impl AcquireOutcome {
    fn acquired(lock: SessionLock, waited_ms: u64) -> Self {
        Self {
            success: true,
            lock: Some(lock),
            error: None,
            waited_ms,
        }
    }

    fn failed(error: LockError, waited_ms: u64) -> Self {
        Self {
            success: false,
            lock: None,
            error: Some(error),
            waited_ms,
        }
    }
}

struct Waiter {
    id: u64,
    wake: oneshot::Sender<()>,
}

#[derive(Default)]
struct LockTable {
    locks: HashMap<String, SessionLock>,
    waiters: HashMap<String, Vec<Waiter>>,
}

impl LockTable {
    /// Take the lock if it's free, expired, or already held by `run_id`.
    fn try_take(&mut self, session_id: &str, run_id: &str, ttl: Duration) -> Option<SessionLock> {
        let now = Utc::now();
        let expires_at = deadline(now, ttl);

        if let Some(existing) = self.locks.get_mut(session_id) {
            if existing.run_id == run_id && !existing.is_expired_at(now) {
                existing.expires_at = expires_at;
                return Some(existing.clone());
            }
            if !existing.is_expired_at(now) {
                return None;
            }
        }

        let lock = SessionLock {
            session_id: session_id.to_string(),
            run_id: run_id.to_string(),
            acquired_at: now,
            expires_at,
        };
        self.locks.insert(session_id.to_string(), lock.clone());
        Some(lock)
    }

    /// Drop the session's lock if expired. Returns whether one was evicted.
    fn evict_if_expired(&mut self, session_id: &str, now: DateTime<Utc>) -> bool {
        let expired = self
            .locks
            .get(session_id)
            .is_some_and(|l| l.is_expired_at(now));
        if expired {
            self.locks.remove(session_id);
            self.wake_all(session_id);
        }
        expired
    }

    fn remove_waiter(&mut self, session_id: &str, waiter_id: u64) {
        if let Some(waiters) = self.waiters.get_mut(session_id) {
            waiters.retain(|w| w.id != waiter_id);
            if waiters.is_empty() {
                self.waiters.remove(session_id);
            }
        }
    }

    fn wake_all(&mut self, session_id: &str) {
        if let Some(waiters) = self.waiters.remove(session_id) {
            for waiter in waiters {
                // Receiver gone means that waiter already timed out.
                let _ = waiter.wake.send(());
            }
        }
    }
}

fn deadline(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    let ttl = TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX);
    now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

pub struct SessionLockManager {
    config: LockConfig,
    table: Mutex<LockTable>,
    next_waiter: AtomicU64,
}

impl SessionLockManager {
    pub fn new(config: LockConfig) -> Self {
        Self {
            config,
            table: Mutex::new(LockTable::default()),
            next_waiter: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Acquire the session's lock, waiting up to `acquire_timeout_ms`.
    ///
    /// A `run_id` of `None` gets a fresh one. Acquiring again with the
    /// run id that already holds the lock succeeds immediately and refreshes
    /// its expiry; one `release` still frees it.
    pub async fn acquire(&self, session_id: &str, run_id: Option<String>) -> AcquireOutcome {
        let run_id = run_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let started = Instant::now();
        let ttl = self.config.lock_timeout();
        let budget = self.config.acquire_timeout();
        let mut first_attempt = true;

        loop {
            let (waiter_id, woken, holder_left) = {
                let mut table = self.table.lock();
                if let Some(lock) = table.try_take(session_id, &run_id, ttl) {
                    let waited_ms = if first_attempt { 0 } else { elapsed_ms(started) };
                    debug!(session_id, run_id = %run_id, waited_ms, "Session lock acquired");
                    return AcquireOutcome::acquired(lock, waited_ms);
                }
                let holder_left = table
                    .locks
                    .get(session_id)
                    .and_then(|l| (l.expires_at - Utc::now()).to_std().ok())
                    .unwrap_or_default();
                let (tx, rx) = oneshot::channel();
                let id = self.next_waiter.fetch_add(1, Ordering::Relaxed);
                table
                    .waiters
                    .entry(session_id.to_string())
                    .or_default()
                    .push(Waiter { id, wake: tx });
                (id, rx, holder_left)
            };

            if first_attempt {
                debug!(session_id, run_id = %run_id, "Session busy, waiting for lock");
            }
            first_attempt = false;

            // Wake no later than the holder's expiry so a crashed holder
            // frees the session without a cleanup pass.
            let remaining = budget.saturating_sub(started.elapsed());
            let until_expiry = holder_left < remaining;
            let wait = remaining.min(holder_left);

            // The timer is dropped with this future when the wake wins.
            match tokio::time::timeout(wait, woken).await {
                Ok(Ok(())) => {
                    let waited_ms = elapsed_ms(started);
                    let mut table = self.table.lock();
                    return match table.try_take(session_id, &run_id, ttl) {
                        Some(lock) => {
                            debug!(session_id, run_id = %run_id, waited_ms, "Session lock acquired after wait");
                            AcquireOutcome::acquired(lock, waited_ms)
                        }
                        None => AcquireOutcome::failed(LockError::Contended, waited_ms),
                    };
                }
                Ok(Err(_)) => return AcquireOutcome::failed(LockError::Reset, elapsed_ms(started)),
                Err(_) => {
                    self.table.lock().remove_waiter(session_id, waiter_id);
                    if until_expiry {
                        debug!(session_id, run_id = %run_id, "Holder lock expired, retrying");
                        continue;
                    }
                    let waited_ms = elapsed_ms(started);
                    warn!(session_id, run_id = %run_id, waited_ms, "Timed out waiting for session lock");
                    return AcquireOutcome::failed(LockError::Timeout { waited_ms }, waited_ms);
                }
            }
        }
    }

    /// Release the lock if `run_id` holds it. Returns false otherwise.
    pub fn release(&self, session_id: &str, run_id: &str) -> bool {
        let mut table = self.table.lock();
        let held = table
            .locks
            .get(session_id)
            .is_some_and(|l| l.run_id == run_id);
        if !held {
            return false;
        }
        table.locks.remove(session_id);
        table.wake_all(session_id);
        debug!(session_id, run_id, "Session lock released");
        true
    }

    /// Release regardless of owner.
    pub fn force_release(&self, session_id: &str) -> bool {
        let mut table = self.table.lock();
        let removed = table.locks.remove(session_id).is_some();
        table.wake_all(session_id);
        if removed {
            warn!(session_id, "Session lock force-released");
        }
        removed
    }

    /// Push the expiry out to now + `additional` (default: the lock timeout).
    pub fn extend(&self, session_id: &str, run_id: &str, additional: Option<Duration>) -> bool {
        let now = Utc::now();
        let mut table = self.table.lock();
        if table.evict_if_expired(session_id, now) {
            return false;
        }
        match table.locks.get_mut(session_id) {
            Some(lock) if lock.run_id == run_id => {
                lock.expires_at = deadline(now, additional.unwrap_or(self.config.lock_timeout()));
                true
            }
            _ => false,
        }
    }

    pub fn is_locked(&self, session_id: &str) -> bool {
        self.get_lock(session_id).is_some()
    }

    pub fn get_lock(&self, session_id: &str) -> Option<SessionLock> {
        let mut table = self.table.lock();
        table.evict_if_expired(session_id, Utc::now());
        table.locks.get(session_id).cloned()
    }

    /// All live locks, ordered by session id.
    pub fn get_active_locks(&self) -> Vec<SessionLock> {
        let now = Utc::now();
        let mut table = self.table.lock();
        let expired: Vec<String> = table
            .locks
            .values()
            .filter(|l| l.is_expired_at(now))
            .map(|l| l.session_id.clone())
            .collect();
        for session_id in &expired {
            table.evict_if_expired(session_id, now);
        }
        let mut locks: Vec<SessionLock> = table.locks.values().cloned().collect();
        locks.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        locks
    }

    /// Number of callers parked on a session.
    pub fn waiter_count(&self, session_id: &str) -> usize {
        self.table
            .lock()
            .waiters
            .get(session_id)
            .map_or(0, Vec::len)
    }

    /// Evict expired locks and wake waiters parked on free sessions.
    /// Returns the number of locks evicted.
    pub fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let mut table = self.table.lock();
        let expired: Vec<String> = table
            .locks
            .values()
            .filter(|l| l.is_expired_at(now))
            .map(|l| l.session_id.clone())
            .collect();
        for session_id in &expired {
            table.evict_if_expired(session_id, now);
        }

        let orphaned: Vec<String> = table
            .waiters
            .keys()
            .filter(|s| !table.locks.contains_key(*s))
            .cloned()
            .collect();
        for session_id in &orphaned {
            table.wake_all(session_id);
        }
        for waiters in table.waiters.values_mut() {
            waiters.retain(|w| !w.wake.is_closed());
        }
        table.waiters.retain(|_, w| !w.is_empty());

        if !expired.is_empty() {
            debug!(count = expired.len(), "Expired session locks evicted");
        }
        expired.len()
    }

    /// Drop every lock and fail every waiter with [`LockError::Reset`].
    pub fn reset(&self) {
        let mut table = self.table.lock();
        let locks = table.locks.len();
        let waiters: usize = table.waiters.values().map(Vec::len).sum();
        table.locks.clear();
        // Dropping the senders resolves each receiver with an error.
        table.waiters.clear();
        if locks > 0 || waiters > 0 {
            warn!(locks, waiters, "Session lock manager reset");
        }
    }

    /// Run [`cleanup_expired`](Self::cleanup_expired) every `interval` until
    /// the manager is dropped.
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                manager.cleanup_expired();
            }
        })
    }
}

impl Default for SessionLockManager {
    fn default() -> Self {
        Self::new(LockConfig::default())
    }
}
