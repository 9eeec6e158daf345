use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Periodic progress task with an explicit handle.
///
/// The task runs `tick` at a fixed cadence until `tick` returns `false`, the
/// ticker is cancelled, or the ticker is dropped. Dropping aborts the task, so
/// every exit path releases it.
#[derive(Debug)]
pub struct ProgressTicker {
    task: Option<JoinHandle<()>>,
}

impl ProgressTicker {
    /// Spawn onto the current tokio runtime
    pub fn spawn<F>(interval: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let task = tokio::spawn(async move {
            let mut cadence = tokio::time::interval(interval);
            cadence.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                cadence.tick().await;
                if !tick() {
                    break;
                }
            }
        });
        Self { task: Some(task) }
    }

    /// Stop the task. Idempotent.
    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for ProgressTicker {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn ticks_at_cadence_until_cancelled() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let mut ticker = ProgressTicker::spawn(Duration::from_millis(100), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        });

        tokio::time::sleep(Duration::from_millis(350)).await;
        let seen = ticks.load(Ordering::SeqCst);
        assert_eq!(seen, 4);
        assert!(ticker.is_running());

        ticker.cancel();
        ticker.cancel();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
        assert!(!ticker.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn stops_when_callback_declines() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let ticker = ProgressTicker::spawn(Duration::from_millis(100), move || {
            counter.fetch_add(1, Ordering::SeqCst) < 2
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
        assert!(!ticker.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn drop_aborts_task() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let ticker = ProgressTicker::spawn(Duration::from_millis(100), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        });
        tokio::time::sleep(Duration::from_millis(150)).await;
        drop(ticker);
        let seen = ticks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }
}
