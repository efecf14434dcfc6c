use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Aggregate statistics for a fixed time bucket, keyed by bucket start
/// (milliseconds since the execution started).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BucketStats {
    pub count: u64,
    pub failures: u64,
    pub total_duration_ms: f64,
}

impl BucketStats {
    pub fn mean_duration_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_duration_ms / self.count as f64
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MetricsSummary {
    pub total_requests: u64,
    pub total_failures: u64,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub rps: f64,
}

/// Per-slave (and, on the master side, execution-wide) streaming aggregator.
/// Response times are kept in a flat `Vec` and sorted on demand for
/// percentile lookups, matching the simple-but-correct approach used
/// throughout this codebase's result-processing paths.
#[derive(Debug, Default)]
pub struct StreamingAggregator {
    response_times: Vec<f64>,
    failures: u64,
    time_buckets: BTreeMap<u64, BucketStats>,
    bucket_width_ms: u64,
}

impl StreamingAggregator {
    pub fn new(bucket_width_ms: u64) -> Self {
        Self {
            response_times: Vec::new(),
            failures: 0,
            time_buckets: BTreeMap::new(),
            bucket_width_ms: bucket_width_ms.max(1),
        }
    }

    pub fn record(&mut self, elapsed_ms: u64, duration_ms: f64, success: bool) {
        self.response_times.push(duration_ms);
        if !success {
            self.failures += 1;
        }
        let bucket_key = (elapsed_ms / self.bucket_width_ms) * self.bucket_width_ms;
        let bucket = self.time_buckets.entry(bucket_key).or_default();
        bucket.count += 1;
        bucket.total_duration_ms += duration_ms;
        if !success {
            bucket.failures += 1;
        }
    }

    /// Percentile in `[0, 100]` using the nearest-rank method: the
    /// `ceil(p/100 * n)`-th smallest value, 1-indexed.
    pub fn percentile(&self, p: f64) -> f64 {
        if self.response_times.is_empty() {
            return 0.0;
        }
        let mut sorted = self.response_times.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
        let index = rank.saturating_sub(1).min(sorted.len() - 1);
        sorted[index]
    }

    pub fn current_rps(&self) -> f64 {
        let Some((&latest_key, _)) = self.time_buckets.iter().next_back() else {
            return 0.0;
        };
        let window_start = latest_key.saturating_sub(self.bucket_width_ms * 4);
        let (count, span_buckets) = self
            .time_buckets
            .range(window_start..=latest_key)
            .fold((0u64, 0u64), |(count, span), (_, bucket)| {
                (count + bucket.count, span + 1)
            });
        if span_buckets == 0 {
            return 0.0;
        }
        let span_secs = (span_buckets * self.bucket_width_ms) as f64 / 1000.0;
        if span_secs == 0.0 {
            0.0
        } else {
            count as f64 / span_secs
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            total_requests: self.response_times.len() as u64,
            total_failures: self.failures,
            p50_ms: self.percentile(50.0),
            p90_ms: self.percentile(90.0),
            p95_ms: self.percentile(95.0),
            p99_ms: self.percentile(99.0),
            rps: self.current_rps(),
        }
    }

    pub fn time_series(&self) -> Vec<(u64, BucketStats)> {
        self.time_buckets
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect()
    }
}
