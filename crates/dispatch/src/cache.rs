//! Performance/availability cache and the optional external cache store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Get/set-by-key store with TTL.
///
/// Only used for freshness; nothing relies on it for correctness.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<serde_json::Value>;
    async fn set(&self, key: &str, value: serde_json::Value, ttl: Duration);
    async fn delete(&self, key: &str);
}

/// In-process fallback store
#[derive(Debug, Default)]
pub struct InMemoryCacheStore {
    entries: Mutex<HashMap<String, (serde_json::Value, Option<Instant>)>>,
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter(|(_, expires_at)| is_live(*expires_at, now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn is_live(expires_at: Option<Instant>, now: Instant) -> bool {
    expires_at.map_or(true, |at| at > now)
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn get(&self, key: &str) -> Option<serde_json::Value> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((value, expires_at)) if is_live(*expires_at, Instant::now()) => {
                Some(value.clone())
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    async fn set(&self, key: &str, value: serde_json::Value, ttl: Duration) {
        // A ttl past the representable horizon never expires
        let expires_at = Instant::now().checked_add(ttl);
        self.entries
            .lock()
            .insert(key.to_string(), (value, expires_at));
    }

    async fn delete(&self, key: &str) {
        self.entries.lock().remove(key);
    }
}

/// Observed performance signals for one model, each on a 0-10 scale
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceData {
    pub quality: f64,
    pub reliability: f64,
    pub cost_efficiency: f64,
    pub avg_latency_ms: Option<f64>,
    pub sample_count: u64,
}

impl PerformanceData {
    pub fn new(quality: f64, reliability: f64, cost_efficiency: f64) -> Self {
        Self {
            quality: quality.clamp(0.0, 10.0),
            reliability: reliability.clamp(0.0, 10.0),
            cost_efficiency: cost_efficiency.clamp(0.0, 10.0),
            avg_latency_ms: None,
            sample_count: 1,
        }
    }

    pub fn with_latency(mut self, avg_latency_ms: f64) -> Self {
        self.avg_latency_ms = Some(avg_latency_ms);
        self
    }

    /// Score contribution used by recommendation scoring
    pub fn score_signal(&self) -> f64 {
        self.quality * 2.0 + self.reliability * 1.5 + self.cost_efficiency
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceEntry {
    pub data: PerformanceData,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailabilityEntry {
    pub available: bool,
    pub updated_at: DateTime<Utc>,
}

/// Availability-by-(provider, model) and performance-by-model.
///
/// Lock-free itself; the owner wraps it in its own lock.
#[derive(Debug, Clone)]
pub struct ModelCache {
    ttl: Duration,
    availability: HashMap<(String, String), AvailabilityEntry>,
    performance: HashMap<String, PerformanceEntry>,
}

/// Serializable copy of the cache contents
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheSnapshot {
    pub availability: Vec<(String, String, AvailabilityEntry)>,
    pub performance: Vec<(String, PerformanceEntry)>,
}

impl ModelCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            availability: HashMap::new(),
            performance: HashMap::new(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn is_fresh(&self, updated_at: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(self.ttl) {
            Ok(ttl) => Utc::now().signed_duration_since(updated_at) <= ttl,
            Err(_) => true,
        }
    }

    pub fn set_availability(&mut self, provider: &str, model_id: &str, available: bool) {
        self.availability.insert(
            (provider.to_string(), model_id.to_string()),
            AvailabilityEntry {
                available,
                updated_at: Utc::now(),
            },
        );
    }

    /// Fresh availability, `None` when unknown or stale
    pub fn availability(&self, provider: &str, model_id: &str) -> Option<bool> {
        self.availability
            .get(&(provider.to_string(), model_id.to_string()))
            .filter(|entry| self.is_fresh(entry.updated_at))
            .map(|entry| entry.available)
    }

    pub fn set_performance(&mut self, model_id: &str, data: PerformanceData) {
        self.performance.insert(
            model_id.to_string(),
            PerformanceEntry {
                data,
                updated_at: Utc::now(),
            },
        );
    }

    pub fn insert_performance_entry(&mut self, model_id: &str, entry: PerformanceEntry) {
        self.performance.insert(model_id.to_string(), entry);
    }

    /// Fresh performance data, `None` when missing or stale
    pub fn performance(&self, model_id: &str) -> Option<&PerformanceData> {
        self.performance
            .get(model_id)
            .filter(|entry| self.is_fresh(entry.updated_at))
            .map(|entry| &entry.data)
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        CacheSnapshot {
            availability: self
                .availability
                .iter()
                .map(|((provider, model), entry)| (provider.clone(), model.clone(), entry.clone()))
                .collect(),
            performance: self
                .performance
                .iter()
                .map(|(model, entry)| (model.clone(), entry.clone()))
                .collect(),
        }
    }
}
