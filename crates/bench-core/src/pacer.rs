use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Global pacing timer shared by every worker.
///
/// Ticks fire at a fixed interval of `1 / rate` seconds. Each tick is handed
/// to whichever worker is waiting first; a tick nobody is waiting for is
/// dropped, so the aggregate request rate never exceeds `rate`.
pub struct Pacer {
    period: Duration,
}

impl Pacer {
    pub fn new(rate: f64) -> Self {
        Self {
            period: Duration::from_secs_f64(1.0 / rate),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Start the timer task. It runs until `shutdown` is cancelled, after
    /// which the returned source yields `None`.
    pub fn spawn(self, shutdown: CancellationToken) -> (TickSource, JoinHandle<()>) {
        // A single slot mirrors a ticker that holds at most one pending tick.
        let (tx, rx) = mpsc::channel(1);
        let period = self.period;

        let handle = tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut fired = 0u64;
            let mut dropped = 0u64;

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    tick = interval.tick() => {
                        fired += 1;
                        match tx.try_send(tick) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(_)) => dropped += 1,
                            Err(mpsc::error::TrySendError::Closed(_)) => break,
                        }
                    }
                }
            }

            debug!("Pacer stopped after {} ticks ({} dropped)", fired, dropped);
        });

        (
            TickSource {
                rx: Arc::new(Mutex::new(rx)),
            },
            handle,
        )
    }
}

/// Receiving side of the pacer, cloned into every worker.
#[derive(Clone)]
pub struct TickSource {
    rx: Arc<Mutex<mpsc::Receiver<Instant>>>,
}

impl TickSource {
    /// Wait for the next tick. Returns `None` once the pacer has stopped.
    pub async fn next(&self) -> Option<Instant> {
        let mut rx = self.rx.lock().await;
        rx.recv().await
    }
}
