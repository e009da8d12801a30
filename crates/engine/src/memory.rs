//! Host memory monitor.
//!
//! Polls sysinfo on an interval and publishes the latest snapshot plus the
//! configured high-watermark percentage. Readers never touch sysinfo
//! directly; they read the last published snapshot.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use sysinfo::System;

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct MemorySnapshot {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub used_pct: f64,
    pub threshold_pct: f64,
}

impl MemorySnapshot {
    pub fn over_threshold(&self) -> bool {
        self.used_pct >= self.threshold_pct
    }

    pub fn available_gb(&self) -> f64 {
        self.available_bytes as f64 / 1e9
    }
}

pub struct MemoryMonitor {
    system: Mutex<System>,
    snapshot: RwLock<MemorySnapshot>,
    threshold_pct: RwLock<f64>,
    poll_interval: Duration,
}

impl MemoryMonitor {
    pub fn new(threshold_pct: f64, poll_interval: Duration) -> Self {
        let monitor = Self {
            system: Mutex::new(System::new()),
            snapshot: RwLock::new(MemorySnapshot {
                total_bytes: 0,
                used_bytes: 0,
                available_bytes: 0,
                used_pct: 0.0,
                threshold_pct,
            }),
            threshold_pct: RwLock::new(threshold_pct),
            poll_interval: poll_interval.max(Duration::from_secs(1)),
        };
        monitor.refresh();
        monitor
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> MemorySnapshot {
        *self.snapshot.read()
    }

    pub fn threshold_pct(&self) -> f64 {
        *self.threshold_pct.read()
    }

    /// Hot-reload entry point for `memory.threshold_pct`.
    pub fn set_threshold_pct(&self, threshold_pct: f64) {
        *self.threshold_pct.write() = threshold_pct.clamp(0.0, 100.0);
        let mut snapshot = self.snapshot.write();
        snapshot.threshold_pct = *self.threshold_pct.read();
    }

    /// Re-read host memory and publish a fresh snapshot.
    pub fn refresh(&self) -> MemorySnapshot {
        let (total, used, available) = {
            let mut system = self.system.lock();
            system.refresh_memory();
            (
                system.total_memory(),
                system.used_memory(),
                system.available_memory(),
            )
        };
        let used_pct = if total > 0 {
            used as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        let fresh = MemorySnapshot {
            total_bytes: total,
            used_bytes: used,
            available_bytes: available,
            used_pct,
            threshold_pct: self.threshold_pct(),
        };
        *self.snapshot.write() = fresh;
        fresh
    }

    /// Spawn the background poll loop.
    pub fn spawn_poll_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(monitor.poll_interval);
            loop {
                interval.tick().await;
                let snapshot = monitor.refresh();
                if snapshot.over_threshold() {
                    tracing::warn!(
                        used_pct = format!("{:.1}", snapshot.used_pct),
                        threshold_pct = snapshot.threshold_pct,
                        "memory above high watermark"
                    );
                }
            }
        })
    }
}
