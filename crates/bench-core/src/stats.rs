use std::time::Duration;

/// Percentiles reported for every run, in report order.
pub const REPORTED_PERCENTILES: [u64; 4] = [50, 90, 95, 99];

/// Collects latency samples for one benchmark run.
#[derive(Debug, Clone, Default)]
pub struct StatsCollector {
    samples: Vec<Duration>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, latency: Duration) {
        self.samples.push(latency);
    }

    pub fn count(&self) -> usize {
        self.samples.len()
    }

    /// Compute the summary over everything recorded so far.
    /// Returns `None` when no samples were recorded.
    pub fn summary(&self) -> Option<LatencySummary> {
        if self.samples.is_empty() {
            return None;
        }

        let count = self.samples.len();
        let total: u128 = self.samples.iter().map(Duration::as_nanos).sum();
        let mean = Duration::from_nanos((total / count as u128) as u64);

        let mut sorted = self.samples.clone();
        sorted.sort_unstable();
        let at = |p: u64| sorted[percentile_index(count, p)];

        Some(LatencySummary {
            count,
            mean,
            min: sorted[0],
            p50: at(50),
            p90: at(90),
            p95: at(95),
            p99: at(99),
            max: sorted[count - 1],
        })
    }
}

/// Nearest-rank index of percentile `p` in a sorted sequence of `count`
/// samples: `floor(count * p / 100)`, clamped to the last element.
pub fn percentile_index(count: usize, p: u64) -> usize {
    debug_assert!(count > 0);
    let idx = (count as u128 * p as u128 / 100) as usize;
    idx.min(count - 1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencySummary {
    pub count: usize,
    pub mean: Duration,
    pub min: Duration,
    pub p50: Duration,
    pub p90: Duration,
    pub p95: Duration,
    pub p99: Duration,
    pub max: Duration,
}

impl LatencySummary {
    /// Labelled values in report order, count excluded.
    pub fn rows(&self) -> [(&'static str, Duration); 7] {
        [
            ("Mean", self.mean),
            ("Min ", self.min),
            ("50th", self.p50),
            ("90th", self.p90),
            ("95th", self.p95),
            ("99th", self.p99),
            ("Max ", self.max),
        ]
    }
}
