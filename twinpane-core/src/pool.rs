//! Bounded pool of backend sessions.
//!
//! Slots live in a small arena indexed by position. A counting semaphore with
//! one permit per slot bounds concurrent borrowers, so a borrower holding a
//! permit always finds a slot that is not borrowed. Sessions are created
//! lazily and checked for liveness on every borrow.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::error::SourceError;
use crate::retry::RetryPolicy;

pub const DEFAULT_POOL_SIZE: usize = 4;

#[async_trait]
pub trait Manager: Send + Sync + 'static {
    type Connection: Send + 'static;

    async fn create(&self) -> Result<Self::Connection, SourceError>;

    async fn is_alive(&self, conn: &mut Self::Connection) -> bool;

    async fn dispose(&self, conn: Self::Connection);
}

enum Slot<C> {
    Empty,
    Idle(C),
    Borrowed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub capacity: usize,
    pub idle: usize,
    pub borrowed: usize,
    pub connecting: usize,
}

struct Shared<M: Manager> {
    manager: M,
    slots: Mutex<Vec<Slot<M::Connection>>>,
    permits: Arc<Semaphore>,
    retry: RetryPolicy,
    connecting: AtomicUsize,
    closed: AtomicBool,
}

pub struct Pool<M: Manager> {
    shared: Arc<Shared<M>>,
}

impl<M: Manager> Pool<M> {
    pub fn new(manager: M, capacity: usize, retry: RetryPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            shared: Arc::new(Shared {
                manager,
                slots: Mutex::new((0..capacity).map(|_| Slot::Empty).collect()),
                permits: Arc::new(Semaphore::new(capacity)),
                retry,
                connecting: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.slots.lock().len()
    }

    /// Borrows a session, waiting while all slots are in use.
    pub async fn get(&self) -> Result<PooledConnection<M>, SourceError> {
        let permit = Arc::clone(&self.shared.permits)
            .acquire_owned()
            .await
            .map_err(|_| SourceError::PoolClosed)?;
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(SourceError::PoolClosed);
        }

        let (index, existing) = {
            let mut slots = self.shared.slots.lock();
            let index = slots
                .iter()
                .position(|slot| matches!(slot, Slot::Idle(_)))
                .or_else(|| slots.iter().position(|slot| matches!(slot, Slot::Empty)))
                .ok_or(SourceError::PoolClosed)?;
            let previous = std::mem::replace(&mut slots[index], Slot::Borrowed);
            let existing = match previous {
                Slot::Idle(conn) => Some(conn),
                _ => None,
            };
            (index, existing)
        };

        // Until `conn` is filled in, dropping the guard frees the slot.
        let mut guard = PooledConnection {
            shared: Arc::clone(&self.shared),
            index,
            conn: None,
            _permit: permit,
        };

        let conn = match existing {
            Some(mut conn) => {
                if self.shared.manager.is_alive(&mut conn).await {
                    conn
                } else {
                    debug!(slot = index, "pooled session is dead, replacing it");
                    self.shared.manager.dispose(conn).await;
                    self.create().await?
                }
            }
            None => self.create().await?,
        };
        guard.conn = Some(conn);
        Ok(guard)
    }

    async fn create(&self) -> Result<M::Connection, SourceError> {
        self.shared.connecting.fetch_add(1, Ordering::AcqRel);
        let shared = &self.shared;
        let result = shared.retry.run(|| shared.manager.create()).await;
        self.shared.connecting.fetch_sub(1, Ordering::AcqRel);
        result
    }

    pub fn status(&self) -> PoolStatus {
        let slots = self.shared.slots.lock();
        let mut status = PoolStatus {
            capacity: slots.len(),
            idle: 0,
            borrowed: 0,
            connecting: self.shared.connecting.load(Ordering::Acquire),
        };
        for slot in slots.iter() {
            match slot {
                Slot::Idle(_) => status.idle += 1,
                Slot::Borrowed => status.borrowed += 1,
                Slot::Empty => {}
            }
        }
        status
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Disposes idle sessions; borrowed ones are disposed when returned.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.permits.close();
        let idle: Vec<M::Connection> = {
            let mut slots = self.shared.slots.lock();
            let mut idle = Vec::new();
            for slot in slots.iter_mut() {
                if matches!(slot, Slot::Idle(_))
                    && let Slot::Idle(conn) = std::mem::replace(slot, Slot::Empty)
                {
                    idle.push(conn);
                }
            }
            idle
        };
        debug!(count = idle.len(), "disposing idle pooled sessions");
        for conn in idle {
            self.shared.manager.dispose(conn).await;
        }
    }
}

/// Exclusive access to one pooled session, returned to its slot on drop.
pub struct PooledConnection<M: Manager> {
    shared: Arc<Shared<M>>,
    index: usize,
    conn: Option<M::Connection>,
    _permit: OwnedSemaphorePermit,
}

impl<M: Manager> PooledConnection<M> {
    /// Drops the session instead of returning it, e.g. after a protocol desync.
    pub fn discard(mut self) {
        if let Some(conn) = self.conn.take() {
            dispose_detached(&self.shared, conn);
        }
    }
}

impl<M: Manager> Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn
            .as_ref()
            .expect("pooled connection is present until drop")
    }
}

impl<M: Manager> DerefMut for PooledConnection<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn
            .as_mut()
            .expect("pooled connection is present until drop")
    }
}

impl<M: Manager> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        let conn = self.conn.take();
        let mut slots = self.shared.slots.lock();
        let closed = self.shared.closed.load(Ordering::Acquire);
        match conn {
            Some(conn) if !closed => slots[self.index] = Slot::Idle(conn),
            Some(conn) => {
                slots[self.index] = Slot::Empty;
                drop(slots);
                dispose_detached(&self.shared, conn);
            }
            None => slots[self.index] = Slot::Empty,
        }
    }
}

fn dispose_detached<M: Manager>(shared: &Arc<Shared<M>>, conn: M::Connection) {
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            let shared = Arc::clone(shared);
            runtime.spawn(async move {
                shared.manager.dispose(conn).await;
            });
        }
        Err(_) => drop(conn),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Default, Clone)]
    struct Counters {
        created: Arc<AtomicUsize>,
        disposed: Arc<AtomicUsize>,
        dead: Arc<AtomicBool>,
        fail_create: Arc<AtomicBool>,
    }

    struct CountingManager {
        counters: Counters,
    }

    #[async_trait]
    impl Manager for CountingManager {
        type Connection = usize;

        async fn create(&self) -> Result<usize, SourceError> {
            if self.counters.fail_create.load(Ordering::SeqCst) {
                return Err(SourceError::Transport("refused".into()));
            }
            Ok(self.counters.created.fetch_add(1, Ordering::SeqCst))
        }

        async fn is_alive(&self, _conn: &mut usize) -> bool {
            !self.counters.dead.load(Ordering::SeqCst)
        }

        async fn dispose(&self, _conn: usize) {
            self.counters.disposed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pool(capacity: usize) -> (Pool<CountingManager>, Counters) {
        let counters = Counters::default();
        let pool = Pool::new(
            CountingManager {
                counters: counters.clone(),
            },
            capacity,
            RetryPolicy::none(),
        );
        (pool, counters)
    }

    #[tokio::test]
    async fn reuses_idle_sessions() {
        let (pool, counters) = pool(2);
        {
            let conn = pool.get().await.unwrap();
            assert_eq!(*conn, 0);
        }
        let conn = pool.get().await.unwrap();
        assert_eq!(*conn, 0);
        assert_eq!(counters.created.load(Ordering::SeqCst), 1);
        assert_eq!(
            pool.status(),
            PoolStatus {
                capacity: 2,
                idle: 0,
                borrowed: 1,
                connecting: 0
            }
        );
    }

    #[tokio::test]
    async fn extra_borrower_waits_for_a_free_slot() {
        let (pool, _) = pool(2);
        let first = pool.get().await.unwrap();
        let _second = pool.get().await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), pool.get()).await;
        assert!(blocked.is_err(), "third borrower must wait");

        drop(first);
        let third = tokio::time::timeout(Duration::from_secs(1), pool.get())
            .await
            .expect("slot should be free")
            .unwrap();
        assert_eq!(*third, 0);
    }

    #[tokio::test]
    async fn never_exceeds_capacity_under_load() {
        let (pool, counters) = pool(3);
        let pool = Arc::new(pool);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::new();
        for _ in 0..4 {
            let pool = Arc::clone(&pool);
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            workers.push(tokio::spawn(async move {
                let _conn = pool.get().await.unwrap();
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for worker in workers {
            worker.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(counters.created.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn replaces_dead_sessions_on_borrow() {
        let (pool, counters) = pool(1);
        drop(pool.get().await.unwrap());
        counters.dead.store(true, Ordering::SeqCst);

        let conn = pool.get().await.unwrap();
        assert_eq!(*conn, 1);
        assert_eq!(counters.disposed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_creation_releases_the_slot() {
        let (pool, counters) = pool(1);
        counters.fail_create.store(true, Ordering::SeqCst);
        assert!(pool.get().await.is_err());
        assert_eq!(pool.status().borrowed, 0);

        counters.fail_create.store(false, Ordering::SeqCst);
        assert!(pool.get().await.is_ok());
    }

    #[tokio::test]
    async fn discarded_sessions_are_replaced() {
        let (pool, counters) = pool(1);
        pool.get().await.unwrap().discard();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(counters.disposed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.status().idle, 0);
        assert_eq!(pool.status().borrowed, 0);

        let conn = pool.get().await.unwrap();
        assert_eq!(*conn, 1);
        assert_eq!(counters.created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn close_disposes_idle_and_rejects_new_borrowers() {
        let (pool, counters) = pool(2);
        drop(pool.get().await.unwrap());
        let in_flight = pool.get().await.unwrap();
        assert_eq!(pool.status().idle, 0);
        drop(pool.get().await.unwrap());

        pool.close().await;
        pool.close().await;
        assert_eq!(counters.disposed.load(Ordering::SeqCst), 1);
        assert!(matches!(pool.get().await, Err(SourceError::PoolClosed)));

        drop(in_flight);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(counters.disposed.load(Ordering::SeqCst), 2);
        assert_eq!(pool.status().idle, 0);
    }
}
