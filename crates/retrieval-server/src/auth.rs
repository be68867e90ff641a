//! Structural auth and rate-limit hook point.
//!
//! No identity provider is wired up; callers configure a static API key
//! list and a per-key request budget. This is the seam a real deployment
//! replaces with its own provider, not a complete auth system.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// Authentication and rate-limiting guard.
pub struct AuthGuard {
    api_keys: Vec<String>,
    rate_limit_per_minute: u32,
    counters: Mutex<HashMap<String, (u32, Instant)>>,
}

impl AuthGuard {
    pub fn new(api_keys: Vec<String>, rate_limit_per_minute: u32) -> Self {
        Self { api_keys, rate_limit_per_minute, counters: Mutex::new(HashMap::new()) }
    }

    /// An empty key list disables auth entirely.
    pub fn authenticate(&self, api_key: Option<&str>) -> bool {
        if self.api_keys.is_empty() {
            return true;
        }
        api_key.is_some_and(|key| self.api_keys.iter().any(|k| k == key))
    }

    pub async fn check_rate_limit(&self, api_key: &str) -> bool {
        if self.rate_limit_per_minute == 0 {
            return true;
        }
        let mut counters = self.counters.lock().await;
        let now = Instant::now();
        let window = Duration::from_secs(60);
        let entry = counters.entry(api_key.to_string()).or_insert((0, now));
        if now.duration_since(entry.1) > window {
            *entry = (0, now);
        }
        if entry.0 >= self.rate_limit_per_minute {
            return false;
        }
        entry.0 += 1;
        true
    }
}

/// A single usage record, kept in memory for the lifetime of the process.
#[derive(Debug, Clone, serde::Serialize)]
pub struct UsageRecord {
    pub api_key: String,
    pub endpoint: String,
    pub response_ms: u64,
}

pub struct UsageMeter {
    records: Mutex<Vec<UsageRecord>>,
}

impl Default for UsageMeter {
    fn default() -> Self {
        Self { records: Mutex::new(Vec::new()) }
    }
}

impl UsageMeter {
    pub async fn record(&self, api_key: &str, endpoint: &str, response_ms: u64) {
        self.records.lock().await.push(UsageRecord { api_key: api_key.to_string(), endpoint: endpoint.to_string(), response_ms });
    }

    pub async fn stats_for_key(&self, api_key: &str) -> (usize, u64) {
        let records = self.records.lock().await;
        let matching: Vec<&UsageRecord> = records.iter().filter(|r| r.api_key == api_key).collect();
        (matching.len(), matching.iter().map(|r| r.response_ms).sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_no_keys_allows_any_request() {
        let guard = AuthGuard::new(vec![], 0);
        assert!(guard.authenticate(None));
        assert!(guard.authenticate(Some("anything")));
    }

    #[test]
    fn test_auth_with_keys_requires_match() {
        let guard = AuthGuard::new(vec!["valid".into()], 0);
        assert!(!guard.authenticate(None));
        assert!(!guard.authenticate(Some("wrong")));
        assert!(guard.authenticate(Some("valid")));
    }

    #[tokio::test]
    async fn test_rate_limit_blocks_after_budget() {
        let guard = AuthGuard::new(vec!["key".into()], 2);
        assert!(guard.check_rate_limit("key").await);
        assert!(guard.check_rate_limit("key").await);
        assert!(!guard.check_rate_limit("key").await);
    }

    #[tokio::test]
    async fn test_usage_meter_aggregates_per_key() {
        let meter = UsageMeter::default();
        meter.record("key", "/query", 12).await;
        meter.record("key", "/query", 8).await;
        let (calls, total_ms) = meter.stats_for_key("key").await;
        assert_eq!(calls, 2);
        assert_eq!(total_ms, 20);
    }
}
