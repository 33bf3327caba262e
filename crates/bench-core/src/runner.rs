use crate::config::LoadConfig;
use crate::connection::{Connection, ConnectionError, Dialer, RequestParams};
use crate::pacer::{Pacer, TickSource};
use crate::stats::{LatencySummary, StatsCollector};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Capacity of the sample channel between workers and the collector.
pub const SAMPLE_BUFFER: usize = 1024;

pub const STATUS_OK: u16 = 200;

/// Why a worker stopped issuing requests.
#[derive(Debug)]
pub enum WorkerExit {
    /// The measurement window closed.
    Shutdown,
    /// The tick stream ended before the shutdown signal was seen.
    PacerStopped,
    Dial(ConnectionError),
    Request(ConnectionError),
    Status(u16),
    Read(ConnectionError),
}

impl WorkerExit {
    pub fn is_failure(&self) -> bool {
        !matches!(self, WorkerExit::Shutdown | WorkerExit::PacerStopped)
    }
}

#[derive(Debug)]
pub struct WorkerOutcome {
    pub id: usize,
    pub samples: u64,
    pub exit: WorkerExit,
}

/// One sequential request loop over its own connection.
pub struct Worker {
    id: usize,
    dialer: Arc<dyn Dialer>,
    params: Arc<RequestParams>,
    ticks: TickSource,
    shutdown: CancellationToken,
    samples: mpsc::Sender<Duration>,
}

impl Worker {
    pub fn new(
        id: usize,
        dialer: Arc<dyn Dialer>,
        params: Arc<RequestParams>,
        ticks: TickSource,
        shutdown: CancellationToken,
        samples: mpsc::Sender<Duration>,
    ) -> Self {
        Self {
            id,
            dialer,
            params,
            ticks,
            shutdown,
            samples,
        }
    }

    pub async fn run(self) -> WorkerOutcome {
        let mut conn = match self.dialer.dial().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Worker {}: dial: {}", self.id, e);
                return WorkerOutcome {
                    id: self.id,
                    samples: 0,
                    exit: WorkerExit::Dial(e),
                };
            }
        };
        conn.set_keep_alive(true);

        let mut samples = 0u64;
        let exit = self.drive(conn.as_mut(), &mut samples).await;
        conn.close().await;

        match &exit {
            WorkerExit::Shutdown | WorkerExit::PacerStopped => {
                debug!("Worker {} finished after {} requests", self.id, samples)
            }
            WorkerExit::Request(e) => warn!("Worker {}: get: {}", self.id, e),
            WorkerExit::Status(status) => warn!("Worker {}: http: {}", self.id, status),
            WorkerExit::Read(e) => warn!("Worker {}: read: {}", self.id, e),
            WorkerExit::Dial(_) => {}
        }

        WorkerOutcome {
            id: self.id,
            samples,
            exit,
        }
    }

    async fn drive(&self, conn: &mut dyn Connection, samples: &mut u64) -> WorkerExit {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return WorkerExit::Shutdown,
                tick = self.ticks.next() => {
                    if tick.is_none() {
                        return WorkerExit::PacerStopped;
                    }
                }
            }

            let start = Instant::now();
            let response = match conn.get(&self.params).await {
                Ok(response) => response,
                Err(e) => return WorkerExit::Request(e),
            };
            if response.status != STATUS_OK {
                return WorkerExit::Status(response.status);
            }
            if let Err(e) = response.body.read_all() {
                return WorkerExit::Read(e);
            }

            if self.samples.send(start.elapsed()).await.is_err() {
                // collector is gone, nothing left to measure for
                return WorkerExit::Shutdown;
            }
            *samples += 1;
        }
    }
}

/// Cancel `shutdown` once `duration` has elapsed. Stopping early is fine:
/// the timer exits as soon as someone else cancels the token.
pub fn spawn_shutdown_timer(duration: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = sleep(duration) => {
                info!("Measurement window of {:?} elapsed, stopping workers", duration);
                shutdown.cancel();
            }
            _ = shutdown.cancelled() => {}
        }
    })
}

/// Wait for every worker, then drop the last sample sender so the
/// collector sees the channel close.
pub fn spawn_supervisor(
    mut workers: JoinSet<WorkerOutcome>,
    samples: mpsc::Sender<Duration>,
) -> JoinHandle<Vec<WorkerOutcome>> {
    tokio::spawn(async move {
        let mut outcomes = Vec::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => warn!("Worker task failed: {}", e),
            }
        }
        drop(samples);
        outcomes.sort_by_key(|o| o.id);
        outcomes
    })
}

#[derive(Debug)]
pub struct BenchmarkReport {
    pub elapsed: Duration,
    pub latency: Option<LatencySummary>,
    pub workers: Vec<WorkerOutcome>,
}

impl BenchmarkReport {
    pub fn count(&self) -> usize {
        self.latency.map_or(0, |s| s.count)
    }

    pub fn failed_workers(&self) -> usize {
        self.workers.iter().filter(|w| w.exit.is_failure()).count()
    }
}

pub async fn run_benchmark(
    load: &LoadConfig,
    dialer: Arc<dyn Dialer>,
    params: Arc<RequestParams>,
) -> Result<BenchmarkReport> {
    load.validate()?;

    let started = Instant::now();
    let shutdown = CancellationToken::new();
    let pacer = Pacer::new(load.rate);

    info!(
        "Starting {} workers using {}: {} req/s (one tick every {:?}) for {:?}",
        load.workers,
        dialer.name(),
        load.rate,
        pacer.period(),
        load.duration()
    );

    let (ticks, pacer_handle) = pacer.spawn(shutdown.clone());
    let (sample_tx, mut sample_rx) = mpsc::channel(SAMPLE_BUFFER);

    let mut workers = JoinSet::new();
    for id in 0..load.workers {
        let worker = Worker::new(
            id,
            dialer.clone(),
            params.clone(),
            ticks.clone(),
            shutdown.clone(),
            sample_tx.clone(),
        );
        workers.spawn(worker.run());
    }

    let timer = spawn_shutdown_timer(load.duration(), shutdown.clone());
    let supervisor = spawn_supervisor(workers, sample_tx);

    let mut stats = StatsCollector::new();
    while let Some(latency) = sample_rx.recv().await {
        stats.record(latency);
    }

    let outcomes = supervisor.await?;
    // Every worker may have failed before the window closed.
    shutdown.cancel();
    timer.await?;
    pacer_handle.await?;

    info!("Done sending {} requests", stats.count());

    Ok(BenchmarkReport {
        elapsed: started.elapsed(),
        latency: stats.summary(),
        workers: outcomes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::MockDialer;

    fn params() -> Arc<RequestParams> {
        Arc::new(RequestParams::for_script("/srv", "index.php"))
    }

    fn worker(
        dialer: &MockDialer,
        ticks: TickSource,
        shutdown: &CancellationToken,
        tx: mpsc::Sender<Duration>,
    ) -> Worker {
        Worker::new(
            0,
            Arc::new(dialer.clone()),
            params(),
            ticks,
            shutdown.clone(),
            tx,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_dial_failure_emits_nothing() {
        let dialer = MockDialer::new(Duration::ZERO).failing_dial();
        let shutdown = CancellationToken::new();
        let (ticks, _pacer) = Pacer::new(10.0).spawn(shutdown.clone());
        let (tx, mut rx) = mpsc::channel(8);

        let outcome = worker(&dialer, ticks, &shutdown, tx).run().await;
        assert!(matches!(outcome.exit, WorkerExit::Dial(_)));
        assert_eq!(outcome.samples, 0);
        assert_eq!(dialer.requests(), 0);
        assert!(rx.recv().await.is_none());
        shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_status_stops_worker() {
        let dialer = MockDialer::new(Duration::from_millis(1)).with_status(500);
        let shutdown = CancellationToken::new();
        let (ticks, _pacer) = Pacer::new(10.0).spawn(shutdown.clone());
        let (tx, mut rx) = mpsc::channel(8);

        let outcome = worker(&dialer, ticks, &shutdown, tx).run().await;
        assert!(matches!(outcome.exit, WorkerExit::Status(500)));
        assert!(outcome.exit.is_failure());
        assert_eq!(dialer.requests(), 1);
        assert_eq!(dialer.closes(), 1);
        assert!(rx.recv().await.is_none());
        shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_and_read_errors_stop_worker() {
        let shutdown = CancellationToken::new();
        let (ticks, _pacer) = Pacer::new(10.0).spawn(shutdown.clone());

        let dialer = MockDialer::new(Duration::ZERO).failing_requests();
        let (tx, _rx) = mpsc::channel(8);
        let outcome = worker(&dialer, ticks.clone(), &shutdown, tx).run().await;
        assert!(matches!(outcome.exit, WorkerExit::Request(_)));
        assert_eq!(dialer.closes(), 1);

        let dialer = MockDialer::new(Duration::ZERO).truncating_body();
        let (tx, _rx) = mpsc::channel(8);
        let outcome = worker(&dialer, ticks, &shutdown, tx).run().await;
        assert!(matches!(outcome.exit, WorkerExit::Read(_)));
        assert_eq!(outcome.samples, 0);
        assert_eq!(dialer.closes(), 1);
        shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_before_first_tick() {
        let dialer = MockDialer::new(Duration::ZERO);
        let shutdown = CancellationToken::new();
        let (ticks, _pacer) = Pacer::new(1.0).spawn(shutdown.clone());
        let (tx, _rx) = mpsc::channel(8);

        shutdown.cancel();
        let outcome = worker(&dialer, ticks, &shutdown, tx).run().await;
        assert!(matches!(outcome.exit, WorkerExit::Shutdown));
        assert_eq!(dialer.requests(), 0);
        assert_eq!(dialer.closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_emits_one_sample_per_tick() {
        let dialer = MockDialer::new(Duration::from_millis(3));
        let shutdown = CancellationToken::new();
        let (ticks, _pacer) = Pacer::new(10.0).spawn(shutdown.clone());
        let (tx, mut rx) = mpsc::channel(8);

        let timer = spawn_shutdown_timer(Duration::from_millis(350), shutdown.clone());
        let outcome = worker(&dialer, ticks, &shutdown, tx).run().await;
        timer.await.unwrap();

        assert!(matches!(outcome.exit, WorkerExit::Shutdown));
        assert_eq!(outcome.samples, 3);
        let mut received = Vec::new();
        while let Some(latency) = rx.recv().await {
            received.push(latency);
        }
        assert_eq!(received, vec![Duration::from_millis(3); 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_benchmark_rejects_invalid_load() {
        let load = LoadConfig {
            workers: 0,
            rate: 10.0,
            duration_ms: 1000,
        };
        let dialer: Arc<dyn Dialer> = Arc::new(MockDialer::new(Duration::ZERO));
        assert!(run_benchmark(&load, dialer, params()).await.is_err());
    }
}
