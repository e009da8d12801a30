//! Concurrency control for the inference engine.
//!
//! Owns every semaphore in the system: the global slot pool, the
//! normal/privileged lane split, per-model caps, and lazily-created
//! per-client fairness semaphores. Also maintains the adaptive global
//! limit (memory pressure ladder plus a p95-latency nudge) and the drain
//! gate used at shutdown.
//!
//! Acquire order for one request: lane (high or normal) → global →
//! per-model → per-client. Each step uses the configured admission
//! timeout; a timeout anywhere releases what was already held and fails
//! the request with the overload error.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};

use lmx_domain::chat::Priority;
use lmx_domain::config::ServerConfig;
use lmx_domain::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Options
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub max_concurrent_requests: usize,
    pub semaphore_timeout: Duration,
    pub per_client_default_concurrency: Option<usize>,
    pub per_client_concurrency_overrides: HashMap<String, usize>,
    pub per_model_concurrency_limits: HashMap<String, usize>,
    pub adaptive_enabled: bool,
    pub adaptive_latency_target: Duration,
    pub adaptive_latency_window: usize,
    pub adaptive_min_concurrent: usize,
}

impl ControllerOptions {
    pub fn from_config(server: &ServerConfig, per_model: &HashMap<String, usize>) -> Self {
        Self {
            max_concurrent_requests: server.max_concurrent_requests.clamp(1, 64),
            semaphore_timeout: Duration::from_secs_f64(server.semaphore_timeout_sec),
            per_client_default_concurrency: server.per_client_default_concurrency,
            per_client_concurrency_overrides: server.per_client_concurrency_overrides.clone(),
            per_model_concurrency_limits: per_model.clone(),
            adaptive_enabled: server.adaptive_concurrency_enabled,
            adaptive_latency_target: Duration::from_secs_f64(
                (server.adaptive_latency_target_ms / 1000.0).max(0.1),
            ),
            adaptive_latency_window: server.adaptive_latency_window.max(8),
            adaptive_min_concurrent: server.adaptive_min_concurrent_requests.max(1),
        }
    }
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 4,
            semaphore_timeout: Duration::from_secs(30),
            per_client_default_concurrency: None,
            per_client_concurrency_overrides: HashMap::new(),
            per_model_concurrency_limits: HashMap::new(),
            adaptive_enabled: true,
            adaptive_latency_target: Duration::from_millis(2500),
            adaptive_latency_window: 128,
            adaptive_min_concurrent: 1,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Lanes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The rebuildable lane set. Swapped atomically under the mutex whenever
/// the adaptive limit is applied (only at in_flight == 0, so no permit
/// from an old generation is still held).
struct Lanes {
    global: Arc<Semaphore>,
    normal: Option<Arc<Semaphore>>,
    high: Option<Arc<Semaphore>>,
    current_limit: usize,
}

impl Lanes {
    fn build(limit: usize) -> Self {
        let bounded = limit.max(1);
        let high_slots = if bounded < 3 { 0 } else { 1 };
        let normal_slots = bounded.saturating_sub(high_slots).max(1);
        Self {
            global: Arc::new(Semaphore::new(bounded)),
            normal: (high_slots > 0).then(|| Arc::new(Semaphore::new(normal_slots))),
            high: (high_slots > 0).then(|| Arc::new(Semaphore::new(high_slots))),
            current_limit: bounded,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueKind {
    Global,
    Model,
    Client,
    NormalLane,
    HighLane,
}

impl QueueKind {
    fn as_str(self) -> &'static str {
        match self {
            QueueKind::Global => "global",
            QueueKind::Model => "model",
            QueueKind::Client => "client",
            QueueKind::NormalLane => "normal_lane",
            QueueKind::HighLane => "high_lane",
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Controller
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ConcurrencyController {
    options: ControllerOptions,
    lanes: Mutex<Lanes>,

    waiting: [AtomicUsize; 5],

    client_semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
    model_semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,

    active_by_model: Mutex<HashMap<String, usize>>,
    waiting_by_model: Mutex<HashMap<String, usize>>,

    in_flight: AtomicUsize,
    drain_tx: watch::Sender<usize>,

    latency_samples: Mutex<VecDeque<f64>>,
    last_adapt_reason: Mutex<&'static str>,
}

impl ConcurrencyController {
    pub fn new(options: ControllerOptions) -> Self {
        let lanes = Lanes::build(options.max_concurrent_requests);
        let (drain_tx, _) = watch::channel(0usize);
        Self {
            lanes: Mutex::new(lanes),
            options,
            waiting: Default::default(),
            client_semaphores: Mutex::new(HashMap::new()),
            model_semaphores: Mutex::new(HashMap::new()),
            active_by_model: Mutex::new(HashMap::new()),
            waiting_by_model: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            drain_tx,
            latency_samples: Mutex::new(VecDeque::new()),
            last_adapt_reason: Mutex::new("startup"),
        }
    }

    // ── Introspection ──────────────────────────────────────────────────

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn current_limit(&self) -> usize {
        self.lanes.lock().current_limit
    }

    pub fn configured_max(&self) -> usize {
        self.options.max_concurrent_requests
    }

    pub fn waiting_queue_count(&self) -> usize {
        self.waiting.iter().map(|w| w.load(Ordering::Relaxed)).sum()
    }

    pub fn last_adapt_reason(&self) -> &'static str {
        *self.last_adapt_reason.lock()
    }

    /// Rolling p95 latency over the adaptive window, in seconds.
    pub fn latency_p95_sec(&self) -> Option<f64> {
        let samples = self.latency_samples.lock();
        if samples.is_empty() {
            return None;
        }
        let mut ordered: Vec<f64> = samples.iter().copied().collect();
        ordered.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let index = ((ordered.len() - 1) as f64 * 0.95) as usize;
        Some(ordered[index])
    }

    /// Currently-executing requests against one model.
    pub fn active_count_for(&self, model_id: &str) -> usize {
        *self.active_by_model.lock().get(model_id).unwrap_or(&0)
    }

    /// Effective per-model cap used for invariant checks and the load
    /// snapshot. Absent or >= global means the global limit applies.
    pub fn per_model_cap(&self, model_id: &str) -> usize {
        let max = self.options.max_concurrent_requests;
        match self.options.per_model_concurrency_limits.get(model_id) {
            Some(&limit) if limit >= 1 && limit < max => limit,
            _ => max,
        }
    }

    // ── Acquisition ────────────────────────────────────────────────────

    /// Acquire all slots for one request. The returned guard holds the
    /// permits; dropping it releases them in reverse order and decrements
    /// the in-flight counters. The guard is `'static` so it can ride
    /// inside a response stream.
    pub async fn acquire(
        self: &Arc<Self>,
        model_id: &str,
        priority: Priority,
        client_id: Option<&str>,
    ) -> Result<RequestSlots> {
        let client_key = normalize_client_key(client_id);
        let model_semaphore = self.model_semaphore_for(model_id);
        let client_semaphore = self.client_semaphore_for(&client_key);
        let (global, normal, high) = {
            let lanes = self.lanes.lock();
            (
                lanes.global.clone(),
                lanes.normal.clone(),
                lanes.high.clone(),
            )
        };

        let wait_started = Instant::now();
        increment(&self.waiting_by_model, model_id);

        let mut permits: Vec<OwnedSemaphorePermit> = Vec::with_capacity(4);
        let result = async {
            match (priority, &high, &normal) {
                (Priority::High, Some(high), _) => {
                    permits.push(
                        self.acquire_slot(high.clone(), QueueKind::HighLane, model_id, &client_key)
                            .await?,
                    );
                }
                (_, _, Some(normal)) => {
                    permits.push(
                        self.acquire_slot(
                            normal.clone(),
                            QueueKind::NormalLane,
                            model_id,
                            &client_key,
                        )
                        .await?,
                    );
                }
                _ => {}
            }

            permits.push(
                self.acquire_slot(global, QueueKind::Global, model_id, &client_key)
                    .await?,
            );

            if let Some(model_sem) = model_semaphore {
                permits.push(
                    self.acquire_slot(model_sem, QueueKind::Model, model_id, &client_key)
                        .await?,
                );
            }
            if let Some(client_sem) = client_semaphore {
                permits.push(
                    self.acquire_slot(client_sem, QueueKind::Client, model_id, &client_key)
                        .await?,
                );
            }
            Ok(())
        }
        .await;

        decrement(&self.waiting_by_model, model_id);
        let queue_wait = wait_started.elapsed();

        match result {
            Ok(()) => {
                self.in_flight.fetch_add(1, Ordering::AcqRel);
                self.drain_tx.send_replace(self.in_flight.load(Ordering::Acquire));
                increment(&self.active_by_model, model_id);
                Ok(RequestSlots {
                    controller: self.clone(),
                    model_id: model_id.to_string(),
                    _permits: permits,
                    queue_wait,
                })
            }
            Err(e) => {
                drop(permits);
                Err(e)
            }
        }
    }

    async fn acquire_slot(
        &self,
        semaphore: Arc<Semaphore>,
        queue_kind: QueueKind,
        model_id: &str,
        client_key: &str,
    ) -> Result<OwnedSemaphorePermit> {
        let counter = &self.waiting[queue_kind as usize];
        counter.fetch_add(1, Ordering::Relaxed);
        let acquired =
            tokio::time::timeout(self.options.semaphore_timeout, semaphore.acquire_owned()).await;
        counter.fetch_sub(1, Ordering::Relaxed);

        match acquired {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_closed)) => Err(Error::Internal("inference semaphore closed".into())),
            Err(_elapsed) => {
                tracing::warn!(
                    queue_kind = queue_kind.as_str(),
                    model_id,
                    client_id = client_key,
                    timeout_sec = self.options.semaphore_timeout.as_secs_f64(),
                    in_flight = self.in_flight_count(),
                    waiting_total = self.waiting_queue_count(),
                    "semaphore timeout"
                );
                Err(Error::Overloaded)
            }
        }
    }

    fn model_semaphore_for(&self, model_id: &str) -> Option<Arc<Semaphore>> {
        let limit = *self.options.per_model_concurrency_limits.get(model_id)?;
        if limit == 0 || limit >= self.options.max_concurrent_requests {
            return None;
        }
        let mut semaphores = self.model_semaphores.lock();
        Some(
            semaphores
                .entry(model_id.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(limit)))
                .clone(),
        )
    }

    fn client_semaphore_for(&self, client_key: &str) -> Option<Arc<Semaphore>> {
        let default = self.options.per_client_default_concurrency?;
        let max = self.options.max_concurrent_requests;
        let limit = self
            .options
            .per_client_concurrency_overrides
            .get(client_key)
            .or_else(|| {
                self.options
                    .per_client_concurrency_overrides
                    .get(&client_key.to_lowercase())
            })
            .copied()
            .unwrap_or(default)
            .clamp(1, max);

        let mut semaphores = self.client_semaphores.lock();
        Some(
            semaphores
                .entry(client_key.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(limit)))
                .clone(),
        )
    }

    // ── Adaptive concurrency ───────────────────────────────────────────

    pub fn record_latency(&self, latency: Duration) {
        let mut samples = self.latency_samples.lock();
        samples.push_back(latency.as_secs_f64());
        while samples.len() > self.options.adaptive_latency_window {
            samples.pop_front();
        }
    }

    /// Recompute the concurrency target from memory pressure and latency.
    /// The new target is applied (semaphores rebuilt) only when no request
    /// is in flight; otherwise it is deferred to the next adapt call.
    pub fn adapt(&self, memory_usage_pct: f64, memory_threshold_pct: f64) -> usize {
        let max = self.options.max_concurrent_requests;
        let min = self.options.adaptive_min_concurrent;
        let ratio = if memory_threshold_pct > 0.0 {
            memory_usage_pct / memory_threshold_pct
        } else {
            0.0
        };

        let mut reason: &'static str = "memory";
        let mut target = if ratio < 0.70 {
            max
        } else if ratio < 0.85 {
            (max * 3 / 4).max(1).clamp(min, max)
        } else if ratio < 0.95 {
            (max / 2).max(1).clamp(min, max)
        } else {
            min
        };

        if self.options.adaptive_enabled {
            let sample_count = self.latency_samples.lock().len();
            if sample_count >= 8 {
                if let Some(p95) = self.latency_p95_sec() {
                    let target_sec = self.options.adaptive_latency_target.as_secs_f64();
                    if p95 > target_sec * 1.25 {
                        target = target.saturating_sub(1).max(min);
                        reason = "latency_high";
                    } else if p95 < target_sec * 0.70 && self.waiting_queue_count() > 0 {
                        target = (target + 1).min(max);
                        reason = "latency_low_queue_backlog";
                    }
                }
            }
        }

        let mut lanes = self.lanes.lock();
        if target != lanes.current_limit {
            if self.in_flight_count() == 0 {
                *lanes = Lanes::build(target);
                *self.last_adapt_reason.lock() = reason;
                tracing::info!(
                    new_limit = target,
                    memory_usage_pct,
                    latency_p95_sec = self.latency_p95_sec(),
                    reason,
                    "concurrency adapted"
                );
            } else {
                tracing::debug!(
                    target,
                    reason,
                    in_flight = self.in_flight_count(),
                    "concurrency adaptation deferred"
                );
            }
        } else {
            *self.last_adapt_reason.lock() = reason;
        }

        target
    }

    // ── Drain ──────────────────────────────────────────────────────────

    /// Wait for all in-flight requests to complete. Does not reject new
    /// arrivals; shutdown code is responsible for refusing further work.
    pub async fn drain(&self, timeout: Duration) -> bool {
        if self.in_flight_count() == 0 {
            return true;
        }
        tracing::info!(in_flight = self.in_flight_count(), "drain started");

        let mut rx = self.drain_tx.subscribe();
        let wait = async {
            loop {
                if *rx.borrow() == 0 {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(()) => {
                tracing::info!("drain complete");
                true
            }
            Err(_) => {
                tracing::warn!(
                    remaining = self.in_flight_count(),
                    timeout_sec = timeout.as_secs_f64(),
                    "drain timeout"
                );
                false
            }
        }
    }

    // ── Load snapshot ──────────────────────────────────────────────────

    /// Best-effort per-model live load score (lower is better), used by
    /// the router's `auto`/alias tie-breaking.
    pub fn model_load_snapshot(&self, model_ids: &[String]) -> HashMap<String, f64> {
        if model_ids.is_empty() {
            return HashMap::new();
        }
        let global_capacity = self.options.max_concurrent_requests.max(1);
        let global_pressure = self.waiting_queue_count() as f64 / global_capacity as f64;
        let active = self.active_by_model.lock();
        let waiting = self.waiting_by_model.lock();

        model_ids
            .iter()
            .map(|model_id| {
                let a = *active.get(model_id).unwrap_or(&0) as f64;
                let w = *waiting.get(model_id).unwrap_or(&0) as f64;
                let capacity = self.per_model_cap(model_id).max(1) as f64;
                let score = a + w + a / capacity + w / capacity + global_pressure;
                (model_id.clone(), score)
            })
            .collect()
    }

    fn release(&self, model_id: &str) {
        decrement(&self.active_by_model, model_id);
        let remaining = self.in_flight.fetch_sub(1, Ordering::AcqRel) - 1;
        self.drain_tx.send_replace(remaining);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request-slots guard
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Held for the duration of one inference request. Permits release on
/// drop in reverse acquisition order.
#[derive(Debug)]
pub struct RequestSlots {
    controller: Arc<ConcurrencyController>,
    model_id: String,
    _permits: Vec<OwnedSemaphorePermit>,
    queue_wait: Duration,
}

impl RequestSlots {
    /// Time this request spent waiting for admission.
    pub fn queue_wait(&self) -> Duration {
        self.queue_wait
    }
}

impl Drop for RequestSlots {
    fn drop(&mut self) {
        self.controller.release(&self.model_id);
    }
}

// ── Counter helpers ────────────────────────────────────────────────

fn normalize_client_key(client_id: Option<&str>) -> String {
    match client_id.map(str::trim) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => "anonymous".to_string(),
    }
}

fn increment(counter: &Mutex<HashMap<String, usize>>, key: &str) {
    *counter.lock().entry(key.to_string()).or_insert(0) += 1;
}

fn decrement(counter: &Mutex<HashMap<String, usize>>, key: &str) {
    let mut map = counter.lock();
    if let Some(value) = map.get_mut(key) {
        if *value > 1 {
            *value -= 1;
        } else {
            map.remove(key);
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(options: ControllerOptions) -> Arc<ConcurrencyController> {
        Arc::new(ConcurrencyController::new(options))
    }

    fn options(max: usize) -> ControllerOptions {
        ControllerOptions {
            max_concurrent_requests: max,
            semaphore_timeout: Duration::from_millis(50),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn acquire_and_release_tracks_in_flight() {
        let controller = controller(options(2));
        let slot = controller
            .acquire("m", Priority::Normal, None)
            .await
            .unwrap();
        assert_eq!(controller.in_flight_count(), 1);
        drop(slot);
        assert_eq!(controller.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn overload_on_exhausted_slots() {
        let controller = controller(options(2));
        let _a = controller
            .acquire("m", Priority::Normal, None)
            .await
            .unwrap();
        let _b = controller
            .acquire("m", Priority::Normal, None)
            .await
            .unwrap();
        let err = controller
            .acquire("m", Priority::Normal, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Overloaded));
        drop(_a);
        // A slot freed up; the next acquire succeeds.
        let _c = controller
            .acquire("m", Priority::Normal, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn no_lane_split_below_three() {
        let controller = controller(options(2));
        // Both priorities go straight to the global pool.
        let _a = controller.acquire("m", Priority::High, None).await.unwrap();
        let _b = controller
            .acquire("m", Priority::Normal, None)
            .await
            .unwrap();
        assert_eq!(controller.in_flight_count(), 2);
    }

    #[tokio::test]
    async fn high_lane_reserved_at_capacity_three() {
        let controller = controller(options(3));
        // Normal traffic can hold at most 2 of 3 slots.
        let _a = controller
            .acquire("m", Priority::Normal, None)
            .await
            .unwrap();
        let _b = controller
            .acquire("m", Priority::Normal, None)
            .await
            .unwrap();
        let err = controller
            .acquire("m", Priority::Normal, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Overloaded));
        // The privileged lane still admits high-priority traffic.
        let _c = controller.acquire("m", Priority::High, None).await.unwrap();
        assert_eq!(controller.in_flight_count(), 3);
    }

    #[tokio::test]
    async fn per_model_cap_enforced() {
        let mut opts = options(4);
        opts.per_model_concurrency_limits
            .insert("small".to_string(), 1);
        let controller = controller(opts);

        let _a = controller
            .acquire("small", Priority::Normal, None)
            .await
            .unwrap();
        let err = controller
            .acquire("small", Priority::Normal, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Overloaded));
        // Other models are unaffected.
        let _b = controller
            .acquire("big", Priority::Normal, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn per_model_cap_at_or_above_global_is_uncapped() {
        let mut opts = options(2);
        opts.per_model_concurrency_limits.insert("m".to_string(), 5);
        let controller = controller(opts);
        assert_eq!(controller.per_model_cap("m"), 2);
        let _a = controller
            .acquire("m", Priority::Normal, None)
            .await
            .unwrap();
        let _b = controller
            .acquire("m", Priority::Normal, None)
            .await
            .unwrap();
        assert_eq!(controller.in_flight_count(), 2);
    }

    #[tokio::test]
    async fn per_client_fairness() {
        let mut opts = options(4);
        opts.per_client_default_concurrency = Some(1);
        let controller = controller(opts);

        let _a = controller
            .acquire("m", Priority::Normal, Some("alice"))
            .await
            .unwrap();
        let err = controller
            .acquire("m", Priority::Normal, Some("alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Overloaded));
        // Another client has its own lane.
        let _b = controller
            .acquire("m", Priority::Normal, Some("bob"))
            .await
            .unwrap();
        // Unset client ids share the anonymous key.
        let _c = controller
            .acquire("m", Priority::Normal, None)
            .await
            .unwrap();
        let err = controller
            .acquire("m", Priority::Normal, Some("  "))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Overloaded));
    }

    #[tokio::test]
    async fn adapt_ladder_on_memory_pressure() {
        let controller = controller(options(8));
        assert_eq!(controller.adapt(50.0, 85.0), 8); // ratio 0.59
        assert_eq!(controller.adapt(65.0, 85.0), 6); // ratio 0.76 → 3/4
        assert_eq!(controller.adapt(76.0, 85.0), 4); // ratio 0.89 → 1/2
        assert_eq!(controller.adapt(84.0, 85.0), 1); // ratio 0.99 → min
    }

    #[tokio::test]
    async fn adapt_applies_only_when_idle() {
        let controller = controller(options(8));
        let slot = controller
            .acquire("m", Priority::Normal, None)
            .await
            .unwrap();
        // Deferred while in flight.
        assert_eq!(controller.adapt(96.0, 100.0), 1);
        assert_eq!(controller.current_limit(), 8);
        drop(slot);
        assert_eq!(controller.adapt(96.0, 100.0), 1);
        assert_eq!(controller.current_limit(), 1);
    }

    #[tokio::test]
    async fn adapt_latency_nudges() {
        let controller = controller(ControllerOptions {
            max_concurrent_requests: 8,
            adaptive_latency_target: Duration::from_secs(1),
            ..options(8)
        });
        for _ in 0..8 {
            controller.record_latency(Duration::from_secs(2));
        }
        // p95 well above 1.25× target: reduce by one even with low memory.
        assert_eq!(controller.adapt(10.0, 85.0), 7);
        assert_eq!(controller.last_adapt_reason(), "latency_high");
    }

    #[tokio::test]
    async fn adapt_bounds_respected() {
        let controller = controller(ControllerOptions {
            adaptive_min_concurrent: 2,
            ..options(8)
        });
        let target = controller.adapt(99.0, 85.0);
        assert_eq!(target, 2);
        assert!(target >= 2 && target <= 8);
    }

    #[tokio::test]
    async fn drain_waits_for_idle() {
        let controller = controller(options(2));
        assert!(controller.drain(Duration::from_millis(10)).await);

        let slot = controller
            .acquire("m", Priority::Normal, None)
            .await
            .unwrap();
        assert!(!controller.drain(Duration::from_millis(20)).await);
        drop(slot);
        assert!(controller.drain(Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn load_snapshot_reflects_active_requests() {
        let controller = controller(options(4));
        let _slot = controller
            .acquire("busy", Priority::Normal, None)
            .await
            .unwrap();
        let snapshot =
            controller.model_load_snapshot(&["busy".to_string(), "idle".to_string()]);
        assert!(snapshot["busy"] > snapshot["idle"]);
        assert!(controller.model_load_snapshot(&[]).is_empty());
    }

    #[tokio::test]
    async fn queue_wait_recorded() {
        let controller = controller(options(2));
        let slot = controller
            .acquire("m", Priority::Normal, None)
            .await
            .unwrap();
        assert!(slot.queue_wait() < Duration::from_secs(1));
    }

    #[test]
    fn p95_of_sorted_samples() {
        let controller = controller(options(4));
        assert!(controller.latency_p95_sec().is_none());
        for i in 1..=100 {
            controller.record_latency(Duration::from_millis(i * 10));
        }
        let p95 = controller.latency_p95_sec().unwrap();
        assert!(p95 >= 0.9 && p95 <= 1.0, "{p95}");
    }
}
