//! In-process latency tracking for the `/projects/:project/query` endpoint.
//!
//! Kept separate from [`crate::auth::UsageMeter`], which records per-key
//! call counts rather than latency distributions.

use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Rolling window of query latencies, queried for percentiles.
#[derive(Debug, Clone)]
pub struct QueryMetrics {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug)]
struct Inner {
    latencies_ms: Vec<u64>,
    max_samples: usize,
    total_queries: u64,
}

impl Default for QueryMetrics {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl QueryMetrics {
    pub fn new(max_samples: usize) -> Self {
        Self { inner: Arc::new(Mutex::new(Inner { latencies_ms: Vec::with_capacity(max_samples), max_samples, total_queries: 0 })) }
    }

    pub fn record(&self, elapsed: Duration) {
        #[allow(clippy::cast_possible_truncation)]
        let latency_ms = elapsed.as_millis().min(u128::from(u64::MAX)) as u64;
        let Ok(mut inner) = self.inner.lock() else { return };
        inner.total_queries += 1;
        if inner.latencies_ms.len() >= inner.max_samples {
            inner.latencies_ms.remove(0);
        }
        inner.latencies_ms.push(latency_ms);
    }

    /// `percentile` in `[0.0, 1.0]`.
    pub fn percentile(&self, percentile: f64) -> f64 {
        let Ok(inner) = self.inner.lock() else { return 0.0 };
        if inner.latencies_ms.is_empty() {
            return 0.0;
        }
        let mut sorted = inner.latencies_ms.clone();
        sorted.sort_unstable();

        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let index = (((sorted.len() - 1) as f64) * percentile).round() as usize;
        let index = index.min(sorted.len() - 1);

        #[allow(clippy::cast_precision_loss)]
        let value = sorted[index] as f64;
        value
    }

    pub fn total_queries(&self) -> u64 {
        self.inner.lock().map(|inner| inner.total_queries).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentiles_over_samples() {
        let metrics = QueryMetrics::new(100);
        for ms in [10, 20, 30, 40, 50] {
            metrics.record(Duration::from_millis(ms));
        }
        assert!((metrics.percentile(0.5) - 30.0).abs() < 1.0);
        assert!((metrics.percentile(0.95) - 50.0).abs() < 1.0);
        assert_eq!(metrics.total_queries(), 5);
    }

    #[test]
    fn test_window_evicts_oldest_sample() {
        let metrics = QueryMetrics::new(3);
        for ms in [10, 20, 30, 40] {
            metrics.record(Duration::from_millis(ms));
        }
        assert!((metrics.percentile(0.5) - 30.0).abs() < 1.0);
        assert_eq!(metrics.total_queries(), 4);
    }
}
