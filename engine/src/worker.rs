//! Single background worker per subsystem.
//!
//! Each worker owns its model slot exclusively and processes jobs strictly
//! in submission order from a FIFO queue, so there is at most one generation
//! in flight per model kind. An interrupt clears the pending backlog; the
//! in-flight call is stopped separately through its own cooperative flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct Worker<J> {
    tx: mpsc::Sender<J>,
    interrupt: Arc<AtomicBool>,
}

impl<J> Clone for Worker<J> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            interrupt: self.interrupt.clone(),
        }
    }
}

impl<J: Send + 'static> Worker<J> {
    /// Spawn a dedicated worker thread. The handler receives each job plus
    /// the worker's interrupt flag, which it may poll at step boundaries.
    pub fn spawn<F>(name: &str, mut handler: F) -> Self
    where
        F: FnMut(J, &AtomicBool) + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<J>(64);
        let interrupt = Arc::new(AtomicBool::new(false));
        let flag = interrupt.clone();
        let thread_name = format!("artforge-{name}");

        std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                tracing::debug!(worker = %thread_name, "worker started");
                while let Some(job) = rx.blocking_recv() {
                    if flag.load(Ordering::SeqCst) {
                        let mut dropped = 1usize;
                        while rx.try_recv().is_ok() {
                            dropped += 1;
                        }
                        flag.store(false, Ordering::SeqCst);
                        tracing::info!(
                            worker = %thread_name,
                            dropped,
                            "interrupt: cleared queued work"
                        );
                        continue;
                    }
                    handler(job, &flag);
                }
                tracing::debug!(worker = %thread_name, "worker stopped");
            })
            .expect("failed to spawn worker thread");

        Self { tx, interrupt }
    }

    /// Enqueue a job. Returns `false` if the worker has shut down.
    pub async fn submit(&self, job: J) -> bool {
        self.tx.send(job).await.is_ok()
    }

    /// Non-async enqueue for synchronous callers; fails when the queue is
    /// full instead of waiting.
    pub fn try_submit(&self, job: J) -> bool {
        self.tx.try_send(job).is_ok()
    }

    /// Raise the interrupt: pending queued jobs are dropped before the next
    /// job runs. Stopping the in-flight call is the caller's business (its
    /// cooperative flag), since this worker cannot preempt it.
    pub fn interrupt(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn jobs_run_in_submission_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let worker = Worker::spawn("test-order", move |job: u32, _flag: &AtomicBool| {
            sink.lock().unwrap().push(job);
        });

        for i in 0..16 {
            assert!(worker.submit(i).await);
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*seen.lock().unwrap(), (0..16).collect::<Vec<u32>>());
    }

    #[tokio::test]
    async fn interrupt_clears_pending_queue() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let worker = Worker::spawn("test-interrupt", move |job: u32, _flag: &AtomicBool| {
            sink.lock().unwrap().push(job);
            // Slow job so the backlog builds up.
            std::thread::sleep(Duration::from_millis(100));
        });

        assert!(worker.submit(1).await);
        assert!(worker.submit(2).await);
        assert!(worker.submit(3).await);
        tokio::time::sleep(Duration::from_millis(30)).await;
        worker.interrupt();
        tokio::time::sleep(Duration::from_millis(400)).await;

        // Job 1 was in flight; 2 and 3 were dropped.
        assert_eq!(*seen.lock().unwrap(), vec![1]);

        // The worker keeps accepting new work afterwards.
        assert!(worker.submit(4).await);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*seen.lock().unwrap(), vec![1, 4]);
    }
}
