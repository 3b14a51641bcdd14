//! MetricsCache - Cached Host Metrics
//!
//! ## Responsibilities
//!
//! - Sample host metrics (CPU, memory, disk, temperatures) on demand
//! - Cache with a TTL so metric-hungry dashboards cannot cause
//!   recomputation storms
//! - Single-flight: concurrent callers share one in-flight sample

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use sysinfo::{Components, Disks, System};

/// Point-in-time host metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub hostname: Option<String>,
    pub uptime_sec: u64,
    pub cpu_percent: f32,
    pub memory: MemoryMetrics,
    pub load_avg: LoadAverage,
    pub disk: DiskMetrics,
    /// Sensor label -> degrees Celsius
    pub temps: HashMap<String, f32>,
    pub sampled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryMetrics {
    pub total: u64,
    pub used: u64,
    pub percent: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadAverage {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskMetrics {
    pub total: u64,
    pub free: u64,
}

/// Host sampling boundary
#[async_trait]
pub trait MetricsSampler: Send + Sync {
    async fn sample(&self) -> MetricsSnapshot;
}

/// sysinfo-backed sampler
pub struct SysinfoSampler {
    system: tokio::sync::Mutex<System>,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        Self {
            system: tokio::sync::Mutex::new(System::new_all()),
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetricsSampler for SysinfoSampler {
    async fn sample(&self) -> MetricsSnapshot {
        let mut sys = self.system.lock().await;
        sys.refresh_all();

        let cpu_percent = {
            let cpus = sys.cpus();
            if cpus.is_empty() {
                0.0
            } else {
                cpus.iter().map(|c| c.cpu_usage()).sum::<f32>() / cpus.len() as f32
            }
        };
        let memory = MemoryMetrics {
            total: sys.total_memory(),
            used: sys.used_memory(),
            percent: if sys.total_memory() > 0 {
                (sys.used_memory() as f32 / sys.total_memory() as f32) * 100.0
            } else {
                0.0
            },
        };
        drop(sys);

        let load = System::load_average();
        let disks = Disks::new_with_refreshed_list();
        let disk = disks
            .iter()
            .find(|d| d.mount_point() == std::path::Path::new("/"))
            .or_else(|| disks.iter().next())
            .map(|d| DiskMetrics {
                total: d.total_space(),
                free: d.available_space(),
            })
            .unwrap_or(DiskMetrics { total: 0, free: 0 });

        let temps = Components::new_with_refreshed_list()
            .iter()
            .map(|c| (c.label().to_string(), c.temperature()))
            .collect();

        MetricsSnapshot {
            hostname: System::host_name(),
            uptime_sec: System::uptime(),
            cpu_percent,
            memory,
            load_avg: LoadAverage {
                one: load.one,
                five: load.five,
                fifteen: load.fifteen,
            },
            disk,
            temps,
            sampled_at: Utc::now(),
        }
    }
}

/// MetricsCache instance
pub struct MetricsCache {
    sampler: Arc<dyn MetricsSampler>,
    ttl: Duration,
    cached: Mutex<Option<(Instant, MetricsSnapshot)>>,
    refresh_gate: tokio::sync::Mutex<()>,
}

impl MetricsCache {
    pub fn new(sampler: Arc<dyn MetricsSampler>, ttl: Duration) -> Self {
        Self {
            sampler,
            ttl,
            cached: Mutex::new(None),
            refresh_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Current metrics, recomputed only if the cached snapshot is older
    /// than the TTL. At most one recompute runs per TTL window; callers
    /// arriving during a recompute wait for it instead of duplicating it.
    pub async fn get(&self) -> MetricsSnapshot {
        if let Some(snapshot) = self.fresh() {
            return snapshot;
        }

        let _refresh = self.refresh_gate.lock().await;
        // Another caller may have refreshed while we waited for the gate.
        if let Some(snapshot) = self.fresh() {
            return snapshot;
        }

        let snapshot = self.sampler.sample().await;
        tracing::debug!(cpu = snapshot.cpu_percent, "Metrics resampled");
        let mut cached = self.cached.lock().expect("metrics cache lock poisoned");
        *cached = Some((Instant::now(), snapshot.clone()));
        snapshot
    }

    fn fresh(&self) -> Option<MetricsSnapshot> {
        let cached = self.cached.lock().expect("metrics cache lock poisoned");
        cached
            .as_ref()
            .filter(|(at, _)| at.elapsed() <= self.ttl)
            .map(|(_, snapshot)| snapshot.clone())
    }
}
