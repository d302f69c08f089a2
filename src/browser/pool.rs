use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

struct IdleSession<S> {
    /// Egress the session is bound to
    key: Option<String>,
    session: S,
}

struct PoolInner<S> {
    permits: Arc<Semaphore>,

    /// Sessions ready for reuse, most recently returned last
    idle: Mutex<Vec<IdleSession<S>>>,

    size: usize,
}

impl<S> PoolInner<S> {
    fn idle(&self) -> std::sync::MutexGuard<'_, Vec<IdleSession<S>>> {
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Bounded set of reusable sessions.
///
/// At most `size` sessions are alive at once, idle or checked out; callers
/// wait for a slot without holding anything. Sessions are bound to a key (the
/// proxy they were started with) and only reused for the same key; starting a
/// session for a new key closes idle ones of other keys to make room.
pub struct SessionPool<S> {
    inner: Arc<PoolInner<S>>,
}

impl<S> Clone for SessionPool<S> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<S: Send + 'static> SessionPool<S> {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            inner: Arc::new(PoolInner {
                permits: Arc::new(Semaphore::new(size)),
                idle: Mutex::new(Vec::new()),
                size,
            }),
        }
    }

    /// Check out a session for `key`, starting one with `launch` if none is idle
    pub async fn acquire<F, Fut>(&self, key: Option<&str>, launch: F) -> Result<PooledSession<S>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<S>>,
    {
        let permit = Arc::clone(&self.inner.permits)
            .acquire_owned()
            .await
            .context("Session pool is closed")?;

        let (reused, evicted) = {
            let mut idle = self.inner.idle();
            match idle.iter().rposition(|entry| entry.key.as_deref() == key) {
                Some(index) => (Some(idle.remove(index).session), Vec::new()),
                None => {
                    // Idle plus checked-out sessions, ours included, stay within size
                    let checked_out = self.inner.size - self.inner.permits.available_permits();
                    let keep = self.inner.size.saturating_sub(checked_out);
                    let excess = idle.len().saturating_sub(keep);
                    (None, idle.drain(..excess).collect::<Vec<_>>())
                }
            }
        };
        if !evicted.is_empty() {
            debug!("Closing {} idle sessions bound to other proxies", evicted.len());
        }
        drop(evicted);

        let session = match reused {
            Some(session) => {
                debug!("Reusing pooled session for {:?}", key);
                session
            }
            None => {
                debug!("Starting new pooled session for {:?}", key);
                launch().await?
            }
        };

        Ok(PooledSession {
            session: Some(session),
            key: key.map(str::to_string),
            pool: Arc::clone(&self.inner),
            discard: false,
            _permit: permit,
        })
    }

    pub fn idle_count(&self) -> usize {
        self.inner.idle().len()
    }

    /// Slots not currently checked out
    pub fn available(&self) -> usize {
        self.inner.permits.available_permits()
    }

    /// Take every idle session out of the pool, for shutdown
    pub fn drain(&self) -> Vec<S> {
        self.inner.idle().drain(..).map(|entry| entry.session).collect()
    }
}

/// Checked-out session; returns to the pool on drop unless discarded
pub struct PooledSession<S> {
    session: Option<S>,
    key: Option<String>,
    pool: Arc<PoolInner<S>>,
    discard: bool,
    _permit: OwnedSemaphorePermit,
}

impl<S> PooledSession<S> {
    /// Drop the session instead of returning it, e.g. after it was blocked
    pub fn discard(mut self) {
        self.discard = true;
    }
}

impl<S> Deref for PooledSession<S> {
    type Target = S;

    fn deref(&self) -> &S {
        // Only taken in drop
        self.session.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<S> DerefMut for PooledSession<S> {
    fn deref_mut(&mut self) -> &mut S {
        self.session.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<S> Drop for PooledSession<S> {
    fn drop(&mut self) {
        let session = match self.session.take() {
            Some(session) => session,
            None => return,
        };
        if self.discard {
            debug!("Discarding pooled session for {:?}", self.key);
            return;
        }

        let mut idle = self.pool.idle();
        idle.push(IdleSession { key: self.key.take(), session });
        if idle.len() > self.pool.size {
            // Oldest idle session goes; dropping it closes it
            idle.remove(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    async fn launch(counter: &AtomicU32) -> Result<u32> {
        Ok(counter.fetch_add(1, Ordering::SeqCst))
    }

    #[tokio::test]
    async fn test_returned_session_is_reused_for_same_key() {
        let pool = SessionPool::new(2);
        let launched = AtomicU32::new(0);

        let first = pool.acquire(Some("proxy-a"), || launch(&launched)).await.unwrap();
        assert_eq!(*first, 0);
        drop(first);
        assert_eq!(pool.idle_count(), 1);

        let again = pool.acquire(Some("proxy-a"), || launch(&launched)).await.unwrap();
        assert_eq!(*again, 0);

        // Different egress needs its own browser
        let other = pool.acquire(Some("proxy-b"), || launch(&launched)).await.unwrap();
        assert_eq!(*other, 1);
        assert_eq!(launched.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_discarded_session_is_not_reused() {
        let pool = SessionPool::new(1);
        let launched = AtomicU32::new(0);

        pool.acquire(None, || launch(&launched)).await.unwrap().discard();
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.available(), 1);

        let next = pool.acquire(None, || launch(&launched)).await.unwrap();
        assert_eq!(*next, 1);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_free_slot() {
        let pool = SessionPool::new(1);
        let launched = AtomicU32::new(0);

        let held = pool.acquire(None, || launch(&launched)).await.unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(50), pool.acquire(None, || launch(&launched))).await;
        assert!(blocked.is_err());

        drop(held);
        let next = pool.acquire(None, || launch(&launched)).await.unwrap();
        assert_eq!(*next, 0);
    }

    /// Session that tracks how many instances are alive
    struct Tracked(Arc<AtomicU32>);

    impl Tracked {
        fn start(live: &Arc<AtomicU32>) -> Self {
            live.fetch_add(1, Ordering::SeqCst);
            Tracked(Arc::clone(live))
        }
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_new_key_evicts_idle_sessions_of_other_keys() {
        let pool = SessionPool::new(2);
        let live = Arc::new(AtomicU32::new(0));
        let start = || async { Ok(Tracked::start(&live)) };

        drop(pool.acquire(Some("proxy-a"), start).await.unwrap());
        drop(pool.acquire(Some("proxy-b"), start).await.unwrap());
        assert_eq!(pool.idle_count(), 2);
        assert_eq!(live.load(Ordering::SeqCst), 2);

        let c = pool.acquire(Some("proxy-c"), start).await.unwrap();
        assert_eq!(live.load(Ordering::SeqCst), 2);
        assert_eq!(pool.idle_count(), 1);

        let d = pool.acquire(Some("proxy-d"), start).await.unwrap();
        assert_eq!(live.load(Ordering::SeqCst), 2);
        assert_eq!(pool.idle_count(), 0);

        drop(c);
        drop(d);
        assert_eq!(live.load(Ordering::SeqCst), 2);
        assert_eq!(pool.idle_count(), 2);
    }

    #[tokio::test]
    async fn test_failed_launch_releases_slot() {
        let pool: SessionPool<u32> = SessionPool::new(1);
        let result = pool.acquire(None, || async { anyhow::bail!("no webdriver") }).await;
        assert!(result.is_err());
        assert_eq!(pool.available(), 1);
    }
}
