use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{sync::Notify, task::JoinHandle, time::Instant};

pub(crate) async fn run_at_fixed_interval<T: PeriodicRunnable + ?Sized>(
    runnable: Arc<T>,
    interval: Duration,
    shutdown: Arc<Notify>,
) {
    let mut last_loop_time = Instant::now();
    loop {
        let mut shutdown_signal = false;
        tokio::select! {
            _ = shutdown.notified() => { shutdown_signal = true }
            _ = runnable.run_once() => {}
        }

        if !shutdown_signal && Instant::now() - last_loop_time < interval {
            tokio::select! {
                _ = shutdown.notified() => { shutdown_signal = true }
                _ = tokio::time::sleep_until(last_loop_time + interval) => {}
            }
        }
        last_loop_time = Instant::now();

        if shutdown_signal {
            break;
        }
    }

    runnable.before_shutdown_complete().await;
}

#[async_trait]
pub(crate) trait PeriodicRunnable: Send + Sync {
    async fn run_once(&self);
    async fn before_shutdown_complete(&self) {}
}

/// A spawned `run_at_fixed_interval` loop and the means to stop it.
pub(crate) struct PeriodicTask {
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    pub(crate) fn spawn<T: PeriodicRunnable + 'static>(runnable: Arc<T>, interval: Duration) -> Self {
        let shutdown = Arc::new(Notify::new());
        let handle = tokio::spawn(run_at_fixed_interval(runnable, interval, shutdown.clone()));
        Self { shutdown, handle }
    }

    /// Signals the loop and waits for it to wind down. `notify_one` keeps the
    /// signal even if the loop is between polls of `notified()`.
    pub(crate) async fn stop(self) {
        self.shutdown.notify_one();
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct Counter(AtomicUsize);

    #[async_trait]
    impl PeriodicRunnable for Counter {
        async fn run_once(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn runs_at_interval_until_stopped() {
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let task = PeriodicTask::spawn(counter.clone(), Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(350)).await;
        task.stop().await;
        let runs = counter.0.load(Ordering::SeqCst);
        assert_eq!(runs, 4);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(counter.0.load(Ordering::SeqCst), runs);
    }
}
