//! Leader loop over the advisory lock.
//!
//! A background worker probes lock acquisition on an interval, calls
//! `on_acquire` when this process first becomes leader and `on_lose` when
//! the loop stops or the lock drops. Singleton loops (queue processor,
//! orphan monitor) hang off these callbacks.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use chengis_db::LeaderLock;

type Callback = Arc<dyn Fn() + Send + Sync>;

pub struct LeaderHandle {
    leading: Arc<AtomicBool>,
    stop: CancellationToken,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl LeaderHandle {
    /// Whether this process currently holds the lock.
    pub fn is_leading(&self) -> bool {
        self.leading.load(Ordering::SeqCst)
    }

    /// Stop the loop, firing `on_lose` and releasing the lock if held.
    /// Idempotent.
    pub async fn stop(&self) {
        self.stop.cancel();
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

/// Start the background leadership prober.
pub fn start_leader_loop(
    lock: Arc<dyn LeaderLock>,
    lock_id: i64,
    on_acquire: Callback,
    on_lose: Callback,
    poll: Duration,
) -> Arc<LeaderHandle> {
    let leading = Arc::new(AtomicBool::new(false));
    let stop = CancellationToken::new();

    let task = {
        let leading = leading.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = stop.cancelled() => break,
                }

                match lock.try_acquire(lock_id).await {
                    Ok(true) => {
                        if !leading.load(Ordering::SeqCst) {
                            // A panicking on_acquire must not leave this
                            // process believing it leads.
                            let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
                                on_acquire();
                            }));
                            match result {
                                Ok(()) => {
                                    info!(lock_id, "leadership acquired");
                                    leading.store(true, Ordering::SeqCst);
                                }
                                Err(_) => {
                                    error!(lock_id, "on_acquire panicked, releasing lock");
                                    let _ = lock.release(lock_id).await;
                                }
                            }
                        }
                    }
                    Ok(false) => {
                        if leading.swap(false, Ordering::SeqCst) {
                            warn!(lock_id, "leadership lost");
                            on_lose();
                        }
                    }
                    Err(e) => {
                        warn!(lock_id, error = %e, "leader probe failed");
                    }
                }
            }

            if leading.swap(false, Ordering::SeqCst) {
                on_lose();
                if let Err(e) = lock.release(lock_id).await {
                    warn!(lock_id, error = %e, "lock release failed");
                }
                info!(lock_id, "leadership released");
            }
        })
    };

    Arc::new(LeaderHandle {
        leading,
        stop,
        task: tokio::sync::Mutex::new(Some(task)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chengis_db::DevLeaderLock;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn acquires_and_releases_on_stop() {
        let acquired = Arc::new(AtomicUsize::new(0));
        let lost = Arc::new(AtomicUsize::new(0));
        let a = acquired.clone();
        let l = lost.clone();

        let handle = start_leader_loop(
            Arc::new(DevLeaderLock::default()),
            7,
            Arc::new(move || {
                a.fetch_add(1, Ordering::SeqCst);
            }),
            Arc::new(move || {
                l.fetch_add(1, Ordering::SeqCst);
            }),
            Duration::from_millis(10),
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.is_leading());
        assert_eq!(acquired.load(Ordering::SeqCst), 1, "on_acquire fires once");

        handle.stop().await;
        assert!(!handle.is_leading());
        assert_eq!(lost.load(Ordering::SeqCst), 1);

        // Idempotent stop.
        handle.stop().await;
        assert_eq!(lost.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_on_acquire_leaves_not_leading() {
        let handle = start_leader_loop(
            Arc::new(DevLeaderLock::default()),
            8,
            Arc::new(|| panic!("boot failure")),
            Arc::new(|| {}),
            Duration::from_millis(10),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_leading());
        handle.stop().await;
    }
}
