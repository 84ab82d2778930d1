//! Session table: one control connection per (host, port, user, password).
//!
//! Each key maps to a slot that serialises access to its session. Async
//! callers hold an owned `tokio::sync::Mutex` guard; blocking callers check
//! the session out of a [`BlockingSlot`]. Either way at most one caller
//! drives a control connection at a time, and a second `load_uri` against
//! the same key queues behind the first.

use crate::ftp::blocking::BlockingSession;
use crate::ftp::session::{AsyncSession, SessionKey, SessionState};
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time;

pub type AsyncSlot = Mutex<Option<AsyncSession>>;
pub type AsyncLease = OwnedMutexGuard<Option<AsyncSession>>;

fn lock<T>(m: &StdMutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Table of session slots keyed by [`SessionKey`].
pub struct SessionTable<S> {
    slots: StdMutex<HashMap<SessionKey, Arc<S>>>,
    idle_timeout: Duration,
}

impl<S: Default> SessionTable<S> {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            slots: StdMutex::new(HashMap::new()),
            idle_timeout,
        }
    }

    /// The slot for `key`, created empty on first use.
    pub fn slot(&self, key: &SessionKey) -> Arc<S> {
        Arc::clone(lock(&self.slots).entry(key.clone()).or_default())
    }

    pub fn len(&self) -> usize {
        lock(&self.slots).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.slots).is_empty()
    }

    pub fn keys(&self) -> Vec<SessionKey> {
        lock(&self.slots).keys().cloned().collect()
    }

    fn entries(&self) -> Vec<(SessionKey, Arc<S>)> {
        lock(&self.slots)
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect()
    }

    /// Drop `key` from the table if it still maps to `slot`.
    fn forget(&self, key: &SessionKey, slot: &Arc<S>) {
        let mut slots = lock(&self.slots);
        if slots.get(key).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            slots.remove(key);
        }
    }

    /// Remove `key` if nothing outside the table holds its slot and
    /// `vacant` says the slot has no usable session.
    fn discard_if(&self, key: &SessionKey, vacant: impl FnOnce(&S) -> bool) -> bool {
        let mut slots = lock(&self.slots);
        let discard = slots
            .get(key)
            .is_some_and(|slot| Arc::strong_count(slot) == 1 && vacant(slot));
        if discard {
            slots.remove(key);
        }
        discard
    }

    fn is_expired(&self, state: &SessionState, now: Instant) -> bool {
        state.is_dead() || now.saturating_duration_since(state.last_used()) >= self.idle_timeout
    }
}

// ─── Async sessions ──────────────────────────────────────────────────

impl SessionTable<AsyncSlot> {
    /// Close sessions unused for longer than the idle timeout, and any
    /// dead ones. Sessions currently in use are left alone.
    pub async fn reap_idle(&self, now: Instant) -> usize {
        let mut reaped = 0;
        for (key, slot) in self.entries() {
            let session = match slot.try_lock() {
                Ok(mut guard) => {
                    let expired = guard
                        .as_ref()
                        .is_some_and(|s| self.is_expired(s.state(), now));
                    if expired {
                        guard.take()
                    } else {
                        None
                    }
                }
                Err(_) => None,
            };
            if let Some(session) = session {
                self.forget(&key, &slot);
                session.quit().await;
                reaped += 1;
            }
        }
        for key in self.keys() {
            self.discard_vacant(&key);
        }
        if reaped > 0 {
            log::info!("FTP: reaped {} idle sessions", reaped);
        }
        reaped
    }

    /// Drop the slot for `key` when no caller holds it and it has no live
    /// session, as after a failed connect or login.
    pub fn discard_vacant(&self, key: &SessionKey) -> bool {
        let discarded = self.discard_if(key, |slot| {
            slot.try_lock()
                .is_ok_and(|guard| guard.as_ref().map_or(true, AsyncSession::is_dead))
        });
        if discarded {
            log::debug!("FTP: dropped vacant slot {}", key);
        }
        discarded
    }

    /// QUIT every idle session and empty the table.
    pub async fn shutdown(&self) {
        let entries = self.entries();
        lock(&self.slots).clear();
        for (key, slot) in entries {
            let session = match slot.try_lock() {
                Ok(mut guard) => guard.take(),
                Err(_) => {
                    log::debug!("FTP: {} is in use, not closing it", key);
                    None
                }
            };
            if let Some(session) = session {
                session.quit().await;
            }
        }
    }
}

/// Spawn a background task that periodically reaps idle sessions.
pub fn spawn_reaper(
    table: Arc<SessionTable<AsyncSlot>>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        loop {
            ticker.tick().await;
            table.reap_idle(Instant::now()).await;
        }
    })
}

// ─── Blocking sessions ───────────────────────────────────────────────

#[derive(Default)]
struct SlotInner {
    session: Option<BlockingSession>,
    leased: bool,
}

/// Check-out/check-in holder for one blocking session.
#[derive(Default)]
pub struct BlockingSlot {
    inner: StdMutex<SlotInner>,
    released: Condvar,
}

impl BlockingSlot {
    /// Wait until no one else holds the session, then take it.
    pub fn checkout(self: &Arc<Self>) -> BlockingLease {
        let mut inner = lock(&self.inner);
        while inner.leased {
            inner = self
                .released
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
        inner.leased = true;
        BlockingLease {
            slot: Arc::clone(self),
            session: inner.session.take(),
        }
    }

    fn take_if(&self, pred: impl FnOnce(&BlockingSession) -> bool) -> Option<BlockingSession> {
        let mut inner = lock(&self.inner);
        if inner.leased {
            return None;
        }
        if inner.session.as_ref().is_some_and(pred) {
            inner.session.take()
        } else {
            None
        }
    }
}

/// Exclusive hold on a blocking slot. Dropping it checks the session back
/// in, discarding it if it died.
pub struct BlockingLease {
    slot: Arc<BlockingSlot>,
    session: Option<BlockingSession>,
}

impl BlockingLease {
    pub fn session_mut(&mut self) -> Option<&mut BlockingSession> {
        self.session.as_mut()
    }

    pub fn is_live(&self) -> bool {
        self.session.as_ref().is_some_and(|s| !s.is_dead())
    }

    pub fn install(&mut self, session: BlockingSession) {
        self.session = Some(session);
    }
}

impl Drop for BlockingLease {
    fn drop(&mut self) {
        let mut inner = lock(&self.slot.inner);
        inner.session = self.session.take().filter(|s| !s.is_dead());
        inner.leased = false;
        drop(inner);
        self.slot.released.notify_one();
    }
}

impl SessionTable<BlockingSlot> {
    pub fn reap_idle(&self, now: Instant) -> usize {
        let mut reaped = 0;
        for (key, slot) in self.entries() {
            if let Some(session) = slot.take_if(|s| self.is_expired(s.state(), now)) {
                self.forget(&key, &slot);
                session.quit();
                reaped += 1;
            }
        }
        for key in self.keys() {
            self.discard_vacant(&key);
        }
        if reaped > 0 {
            log::info!("FTP: reaped {} idle sessions", reaped);
        }
        reaped
    }

    /// Drop the slot for `key` when no caller holds it and it has no live
    /// session.
    pub fn discard_vacant(&self, key: &SessionKey) -> bool {
        let discarded = self.discard_if(key, |slot| {
            let inner = lock(&slot.inner);
            !inner.leased && inner.session.as_ref().map_or(true, BlockingSession::is_dead)
        });
        if discarded {
            log::debug!("FTP: dropped vacant slot {}", key);
        }
        discarded
    }

    /// QUIT every idle session and empty the table.
    pub fn close_all(&self) {
        let entries = self.entries();
        lock(&self.slots).clear();
        for (key, slot) in entries {
            match slot.take_if(|_| true) {
                Some(session) => session.quit(),
                None => log::debug!("FTP: {} is in use or empty, not closing it", key),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(user: &str) -> SessionKey {
        SessionKey {
            host: "localhost".into(),
            port: 21,
            user: user.into(),
            password: "pw".into(),
        }
    }

    #[test]
    fn slots_are_shared_per_key() {
        let table: SessionTable<AsyncSlot> = SessionTable::new(Duration::from_secs(300));
        let a = table.slot(&key("a"));
        let again = table.slot(&key("a"));
        let b = table.slot(&key("b"));
        assert!(Arc::ptr_eq(&a, &again));
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(table.len(), 2);
        assert!(!table.is_empty());
    }

    #[test]
    fn port_is_part_of_the_key() {
        let table: SessionTable<BlockingSlot> = SessionTable::new(Duration::from_secs(300));
        let mut other = key("a");
        other.port = 2121;
        table.slot(&key("a"));
        table.slot(&other);
        assert_eq!(table.keys().len(), 2);
    }

    #[test]
    fn blocking_checkout_serialises_holders() {
        let slot = Arc::new(BlockingSlot::default());
        let lease = slot.checkout();
        assert!(!lease.is_live());

        let (tx, rx) = std::sync::mpsc::channel();
        let slot2 = Arc::clone(&slot);
        let waiter = std::thread::spawn(move || {
            let _second = slot2.checkout();
            tx.send(()).ok();
        });

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        drop(lease);
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        waiter.join().unwrap();
    }

    #[tokio::test]
    async fn reaping_drops_empty_slots() {
        let table: SessionTable<AsyncSlot> = SessionTable::new(Duration::from_secs(300));
        table.slot(&key("a"));
        let held = table.slot(&key("b"));
        assert_eq!(table.reap_idle(Instant::now()).await, 0);
        assert_eq!(table.keys(), vec![key("b")]);

        drop(held);
        assert_eq!(table.reap_idle(Instant::now()).await, 0);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn locked_slot_is_not_discarded() {
        let table: SessionTable<AsyncSlot> = SessionTable::new(Duration::from_secs(300));
        let lease = table.slot(&key("a")).lock_owned().await;
        assert!(!table.discard_vacant(&key("a")));
        drop(lease);
        assert!(table.discard_vacant(&key("a")));
        assert!(!table.discard_vacant(&key("a")));
    }

    #[test]
    fn blocking_vacant_slot_is_discarded_after_checkin() {
        let table: SessionTable<BlockingSlot> = SessionTable::new(Duration::from_secs(300));
        let lease = table.slot(&key("a")).checkout();
        assert!(!table.discard_vacant(&key("a")));
        drop(lease);
        assert!(table.discard_vacant(&key("a")));
        assert_eq!(table.reap_idle(Instant::now()), 0);
        assert!(table.is_empty());
    }
}
