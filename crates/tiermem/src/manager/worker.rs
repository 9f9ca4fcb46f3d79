//! Bounded background worker pool
//!
//! Jobs go through a bounded queue; `try_submit` never waits and drops the
//! job when the queue is full. A dispatcher runs at most `concurrency` jobs
//! at a time.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

pub struct WorkerPool<J> {
    tx: mpsc::Sender<J>,
    rx: Mutex<Option<mpsc::Receiver<J>>>,
    semaphore: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    submitted: AtomicU64,
    dropped: AtomicU64,
    capacity: usize,
}

impl<J> std::fmt::Debug for WorkerPool<J> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("capacity", &self.capacity)
            .field("in_flight", &self.in_flight())
            .field("dropped", &self.dropped())
            .finish()
    }
}

impl<J> WorkerPool<J> {
    /// Jobs queued or running
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Wait until every accepted job has finished
    pub async fn wait_idle(&self) {
        while self.in_flight() > 0 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }
}

impl<J: Send + 'static> WorkerPool<J> {
    pub fn new(capacity: usize, concurrency: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            in_flight: Arc::new(AtomicUsize::new(0)),
            submitted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            capacity,
        }
    }

    /// Queue a job; returns false if the queue was full or closed
    pub fn try_submit(&self, job: J) -> bool {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        match self.tx.try_send(job) {
            Ok(()) => {
                self.submitted.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Start the dispatcher. Only the first call spawns anything.
    pub fn start<F, Fut>(&self, mut shutdown: watch::Receiver<bool>, handler: F) -> Option<JoinHandle<()>>
    where
        F: Fn(J) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut rx = self.rx.lock().unwrap_or_else(|e| e.into_inner()).take()?;
        let semaphore = self.semaphore.clone();
        let in_flight = self.in_flight.clone();

        Some(tokio::spawn(async move {
            loop {
                let job = tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    job = rx.recv() => match job {
                        Some(job) => job,
                        None => break,
                    },
                };
                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    break;
                };
                let work = handler(job);
                let in_flight = in_flight.clone();
                tokio::spawn(async move {
                    work.await;
                    drop(permit);
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                });
            }
            debug!("worker pool dispatcher stopped");
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_runs_submitted_jobs() {
        let pool = WorkerPool::new(16, 2);
        let (_tx, shutdown) = watch::channel(false);
        let done = Arc::new(AtomicUsize::new(0));
        let counter = done.clone();
        pool.start(shutdown, move |n: usize| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(n, Ordering::SeqCst);
            }
        });

        for n in 1..=4 {
            assert!(pool.try_submit(n));
        }
        tokio::time::timeout(Duration::from_secs(2), pool.wait_idle())
            .await
            .unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 10);
        assert_eq!(pool.submitted(), 4);
    }

    #[tokio::test]
    async fn test_drops_when_queue_full() {
        // Not started, so nothing drains the queue
        let pool: WorkerPool<u32> = WorkerPool::new(2, 1);
        assert!(pool.try_submit(1));
        assert!(pool.try_submit(2));
        assert!(!pool.try_submit(3));
        assert_eq!(pool.dropped(), 1);
        assert_eq!(pool.in_flight(), 2);
    }

    #[test]
    fn test_debug_reports_counters() {
        let pool: WorkerPool<u32> = WorkerPool::new(1, 1);
        assert!(pool.try_submit(1));
        assert!(!pool.try_submit(2));
        let shown = format!("{pool:?}");
        assert!(shown.contains("in_flight: 1"));
        assert!(shown.contains("dropped: 1"));
    }

    #[tokio::test]
    async fn test_concurrency_bounded() {
        let pool = WorkerPool::new(32, 2);
        let (_tx, shutdown) = watch::channel(false);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (r, p) = (running.clone(), peak.clone());
        pool.start(shutdown, move |_: ()| {
            let (running, peak) = (r.clone(), p.clone());
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }
        });
        for _ in 0..8 {
            assert!(pool.try_submit(()));
        }
        tokio::time::timeout(Duration::from_secs(2), pool.wait_idle())
            .await
            .unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_start_only_once() {
        let pool: WorkerPool<()> = WorkerPool::new(4, 1);
        let (_tx, shutdown) = watch::channel(false);
        assert!(pool.start(shutdown.clone(), |_| async {}).is_some());
        assert!(pool.start(shutdown, |_| async {}).is_none());
    }
}
