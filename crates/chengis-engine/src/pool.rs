//! Bounded worker pool for local builds.
//!
//! Each in-flight build runs on its own task; the semaphore bounds how many
//! run concurrently at this node.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

pub struct BuildWorkerPool {
    permits: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
    capacity: usize,
}

impl BuildWorkerPool {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            active: Arc::new(AtomicUsize::new(0)),
            capacity: max_concurrent.max(1),
        }
    }

    /// Spawn a build task once a permit frees up.
    pub fn spawn<F>(&self, work: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = self.permits.clone();
        let active = self.active.clone();
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire().await else {
                return;
            };
            active.fetch_add(1, Ordering::SeqCst);
            work.await;
            active.fetch_sub(1, Ordering::SeqCst);
        })
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// True when every worker slot is taken.
    pub fn is_saturated(&self) -> bool {
        self.permits.available_permits() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn bounds_concurrency() {
        let pool = BuildWorkerPool::new(2);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let peak = Arc::new(AtomicUsize::new(0));
        let running = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..8 {
            let tx = tx.clone();
            let peak = peak.clone();
            let running = running.clone();
            handles.push(pool.spawn(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                let _ = tx.send(i);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        drop(tx);

        let mut done = 0;
        while rx.recv().await.is_some() {
            done += 1;
        }
        assert_eq!(done, 8);
        assert!(peak.load(Ordering::SeqCst) <= 2, "pool exceeded its bound");
    }

    #[tokio::test]
    async fn saturation_is_observable() {
        let pool = BuildWorkerPool::new(1);
        assert!(!pool.is_saturated());
        let handle = pool.spawn(async {
            tokio::time::sleep(Duration::from_millis(50)).await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(pool.is_saturated());
        handle.await.unwrap();
        assert!(!pool.is_saturated());
    }
}
