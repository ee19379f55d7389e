use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

const MIN_PERIOD: Duration = Duration::from_millis(10);

/// After a period change the next tick is due at `last tick + new period`,
/// or immediately if that has passed.
pub struct Scheduler {
    period_tx: watch::Sender<Duration>,
    task: JoinHandle<()>,
}

impl Scheduler {
    pub fn spawn<F>(period: Duration, mut on_tick: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let (period_tx, mut period_rx) = watch::channel(period.max(MIN_PERIOD));
        let task = tokio::spawn(async move {
            let mut period = *period_rx.borrow_and_update();
            let mut last = Instant::now();
            let mut deadline = last + period;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {
                        on_tick();
                        last = Instant::now();
                        deadline = last + period;
                    }
                    changed = period_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        period = *period_rx.borrow_and_update();
                        deadline = (last + period).max(Instant::now());
                        debug!(period_ms = period.as_millis() as u64, "scheduler period changed");
                    }
                }
            }
        });
        Self { period_tx, task }
    }

    pub fn period(&self) -> Duration {
        *self.period_tx.borrow()
    }

    pub fn set_period(&self, period: Duration) {
        let period = period.max(MIN_PERIOD);
        self.period_tx.send_if_modified(|current| {
            if *current == period {
                false
            } else {
                *current = period;
                true
            }
        });
    }

    pub fn cancel(&self) {
        self.task.abort();
    }

    #[cfg(test)]
    pub fn is_cancelled(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.task.abort();
    }
}
