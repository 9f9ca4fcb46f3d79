//! Unified memory manager
//!
//! The only component callers use. Reads probe the tiers fastest first under
//! one deadline; writes go through to the durable tier before they are
//! acknowledged (or into the write-behind buffer when L3 is write-behind);
//! cache tiers are populated opportunistically.
//!
//! Background work runs on tasks started by [`UnifiedMemoryManager::start`]:
//! placement jobs on a bounded worker pool, the repair loop, the write-behind
//! flusher, the placement recompute pass and the expiry sweep.

pub mod batch;
pub mod health;
pub mod locks;
pub mod repair;
pub mod worker;
pub mod write_behind;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{Config, ManagerConfig, PlacementConfig};
use crate::error::{MemoryError, Result};
use crate::memory::types::{EntryKey, MemoryEntry, SEARCHABLE_TAG, TierId};
use crate::memory::{Clock, SequenceClock, SystemClock, TombstoneRegistry};
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::placement::{
    AccessTelemetry, PlacementModel, PlacementOptimizer, PlacementPlan, TierContext,
    model_from_config,
};
use crate::tier::{ScoredEntry, SearchFilter, TierRegistry, TierStats, TierStore, WriteMode};

pub use batch::{OpOutcome, Operation, SetOptions, WriteAck};
pub use health::{HealthReport, TierHealthReport, TierStatus};

use batch::{OperationKind, plan_groups};
use health::TierHealth;
use locks::KeyLocks;
use repair::{RepairOp, RepairQueue};
use worker::WorkerPool;
use write_behind::WriteBehindBuffer;

/// Repairs attempted per pass
const REPAIR_BATCH: usize = 256;

/// Summary of an expiry sweep
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupReport {
    /// Entries physically removed, per tier
    pub purged: BTreeMap<TierId, u64>,
    /// Tiers that failed part-way; they are retried on the next sweep
    pub failed: Vec<TierId>,
    /// False if the sweep stopped early for shutdown
    pub completed: bool,
}

impl CleanupReport {
    pub fn total(&self) -> u64 {
        self.purged.values().sum()
    }
}

/// Background placement work for one key
#[derive(Debug)]
struct PlacementJob {
    key: EntryKey,
    /// The version that was read; fetched from L3 when absent
    entry: Option<MemoryEntry>,
    plan: PlacementPlan,
    read_at: Instant,
}

struct Inner {
    registry: TierRegistry,
    config: ManagerConfig,
    placement: PlacementConfig,
    namespace: String,
    clock: Arc<dyn Clock>,
    sequence: SequenceClock,
    tombstones: TombstoneRegistry,
    locks: KeyLocks,
    optimizer: PlacementOptimizer,
    metrics: Arc<MetricsCollector>,
    workers: WorkerPool<PlacementJob>,
    write_behind: Option<WriteBehindBuffer>,
    repairs: Arc<RepairQueue>,
    health: TierHealth,
    stats: DashMap<TierId, TierStats>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    closed: AtomicBool,
}

/// Handle to a running memory manager; cheap to clone
#[derive(Clone)]
pub struct UnifiedMemoryManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for UnifiedMemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnifiedMemoryManager")
            .field("registry", &self.inner.registry)
            .field("model", &self.inner.optimizer.model_name())
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish()
    }
}

pub struct ManagerBuilder {
    registry: TierRegistry,
    manager: ManagerConfig,
    placement: PlacementConfig,
    namespace: String,
    clock: Option<Arc<dyn Clock>>,
    model: Option<Arc<dyn PlacementModel>>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl ManagerBuilder {
    /// Take manager, placement and namespace settings from a full config
    pub fn config(mut self, config: &Config) -> Self {
        self.manager = config.manager.clone();
        self.placement = config.placement.clone();
        self.namespace = config.namespace.clone();
        self
    }

    pub fn manager_config(mut self, manager: ManagerConfig) -> Self {
        self.manager = manager;
        self
    }

    pub fn placement_config(mut self, placement: PlacementConfig) -> Self {
        self.placement = placement;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Replace the placement model chosen by configuration
    pub fn model(mut self, model: Arc<dyn PlacementModel>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Assemble the manager. Background tasks start with
    /// [`UnifiedMemoryManager::start`].
    pub fn build(self) -> Result<UnifiedMemoryManager> {
        let config = self.manager;
        if config.worker_concurrency == 0 {
            return Err(MemoryError::Config(
                "manager.worker_concurrency must be at least 1".to_string(),
            ));
        }
        if config.get_deadline_ms == 0 {
            return Err(MemoryError::Config(
                "manager.get_deadline_ms must be positive".to_string(),
            ));
        }

        let write_behind = match self.registry.durable().descriptor().write_mode {
            WriteMode::WriteThrough => None,
            WriteMode::WriteBehind { max_staleness } => {
                if max_staleness.is_zero() {
                    return Err(MemoryError::Config(
                        "write-behind requires a positive max staleness".to_string(),
                    ));
                }
                Some(WriteBehindBuffer::new(max_staleness))
            }
        };

        let model = self
            .model
            .unwrap_or_else(|| model_from_config(&self.placement));
        let telemetry = Arc::new(AccessTelemetry::new(
            Duration::from_millis(self.placement.window_ms),
            self.placement.max_events_per_key,
        ));
        let (shutdown, _) = watch::channel(false);

        let inner = Inner {
            optimizer: PlacementOptimizer::new(model, telemetry),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            metrics: self
                .metrics
                .unwrap_or_else(|| Arc::new(MetricsCollector::new())),
            sequence: SequenceClock::new(),
            tombstones: TombstoneRegistry::new(Duration::from_secs(config.tombstone_grace_secs)),
            locks: KeyLocks::new(config.lock_shards),
            workers: WorkerPool::new(config.queue_capacity, config.worker_concurrency),
            repairs: Arc::new(RepairQueue::new(Duration::from_millis(
                config.repair_interval_ms,
            ))),
            health: TierHealth::new(Duration::from_millis(config.reprobe_interval_ms)),
            stats: DashMap::new(),
            write_behind,
            registry: self.registry,
            placement: self.placement,
            namespace: self.namespace,
            config,
            shutdown,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        };
        Ok(UnifiedMemoryManager {
            inner: Arc::new(inner),
        })
    }
}

impl UnifiedMemoryManager {
    pub fn builder(registry: TierRegistry) -> ManagerBuilder {
        ManagerBuilder {
            registry,
            manager: ManagerConfig::default(),
            placement: PlacementConfig::default(),
            namespace: crate::memory::DEFAULT_NAMESPACE.to_string(),
            clock: None,
            model: None,
            metrics: None,
        }
    }

    /// Build every tier from configuration and start serving.
    ///
    /// Fails with `Config` if the durable tier cannot be reached.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let registry = TierRegistry::from_config(config).await?;
        let manager = Self::builder(registry).config(config).build()?;
        manager.start();
        Ok(manager)
    }

    /// Spawn the background tasks. Calling it again is a no-op.
    pub fn start(&self) {
        let inner = &self.inner;
        if inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak = Arc::downgrade(inner);
        let mut tasks = Vec::new();

        let job_owner = weak.clone();
        if let Some(task) = inner.workers.start(inner.shutdown.subscribe(), move |job| {
            let owner = job_owner.clone();
            async move {
                if let Some(inner) = owner.upgrade() {
                    inner.run_placement(job).await;
                }
            }
        }) {
            tasks.push(task);
        }

        tasks.push(spawn_repair_loop(
            weak.clone(),
            inner.repairs.clone(),
            inner.shutdown.subscribe(),
            Duration::from_millis(inner.config.repair_interval_ms.max(1)),
        ));

        if let Some(buffer) = &inner.write_behind {
            let period = (buffer.max_staleness() / 4).max(Duration::from_millis(5));
            tasks.push(spawn_periodic(
                weak.clone(),
                inner.shutdown.subscribe(),
                period,
                "write-behind flusher",
                |inner| async move { inner.flush_due().await },
            ));
        }

        if inner.placement.recompute_interval_ms > 0 {
            tasks.push(spawn_periodic(
                weak.clone(),
                inner.shutdown.subscribe(),
                Duration::from_millis(inner.placement.recompute_interval_ms),
                "placement recompute",
                |inner| async move {
                    inner.recompute_placements().await;
                },
            ));
        }

        if inner.config.cleanup_interval_secs > 0 {
            tasks.push(spawn_periodic(
                weak,
                inner.shutdown.subscribe(),
                Duration::from_secs(inner.config.cleanup_interval_secs),
                "expiry sweep",
                |inner| async move {
                    if let Err(e) = inner.cleanup_expired().await {
                        warn!("Expiry sweep failed: {e}");
                    }
                },
            ));
        }

        info!(
            tiers = ?inner.registry.ids(),
            model = inner.optimizer.model_name(),
            write_behind = inner.write_behind.is_some(),
            "Memory manager started"
        );
        inner
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(tasks);
    }

    /// Key in the configured default namespace
    pub fn key(&self, key: &str) -> EntryKey {
        EntryKey::new(self.inner.namespace.clone(), key)
    }

    pub fn registry(&self) -> &TierRegistry {
        &self.inner.registry
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn metrics_collector(&self) -> &Arc<MetricsCollector> {
        &self.inner.metrics
    }

    pub fn telemetry(&self) -> &Arc<AccessTelemetry> {
        self.inner.optimizer.telemetry()
    }

    /// Fetch an entry within the configured deadline
    pub async fn get(&self, key: impl Into<EntryKey>) -> Result<Option<MemoryEntry>> {
        let budget = Duration::from_millis(self.inner.config.get_deadline_ms);
        self.inner.get(&key.into(), budget).await
    }

    /// Fetch an entry within `deadline` across the whole tier chain
    pub async fn get_with_deadline(
        &self,
        key: impl Into<EntryKey>,
        deadline: Duration,
    ) -> Result<Option<MemoryEntry>> {
        self.inner.get(&key.into(), deadline).await
    }

    /// Fetch only the value
    pub async fn get_value(&self, key: impl Into<EntryKey>) -> Result<Option<Bytes>> {
        Ok(self.get(key).await?.map(|e| e.value))
    }

    pub async fn set(
        &self,
        key: impl Into<EntryKey>,
        value: impl Into<Bytes>,
        options: SetOptions,
    ) -> Result<WriteAck> {
        self.inner.set(key.into(), value.into(), options).await
    }

    /// Write with default options
    pub async fn put(&self, key: impl Into<EntryKey>, value: impl Into<Bytes>) -> Result<WriteAck> {
        self.set(key, value, SetOptions::default()).await
    }

    /// Delete everywhere; returns whether the key existed
    pub async fn delete(&self, key: impl Into<EntryKey>) -> Result<bool> {
        self.inner.delete(&key.into()).await
    }

    /// Run operations in order; each one gets its own result
    pub async fn batch(&self, ops: Vec<Operation>) -> Vec<Result<OpOutcome>> {
        self.inner.batch(ops).await
    }

    pub async fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ScoredEntry>> {
        self.inner.search(query, k, filter).await
    }

    /// Make a buffered write durable now
    pub async fn flush(&self, key: impl Into<EntryKey>) -> Result<()> {
        self.inner.flush(&key.into()).await
    }

    /// Flush every buffered write; returns how many were flushed
    pub async fn flush_all(&self) -> Result<usize> {
        self.inner.flush_all().await
    }

    pub async fn cleanup_expired(&self) -> Result<CleanupReport> {
        self.inner.cleanup_expired().await
    }

    pub async fn health(&self) -> HealthReport {
        self.inner.health().await
    }

    /// Retry due cache-tier repairs; returns how many were verified
    pub async fn run_repairs(&self) -> usize {
        self.inner.run_repairs().await
    }

    /// Re-score tracked keys; returns how many placement jobs were queued
    pub async fn recompute_placements(&self) -> usize {
        self.inner.recompute_placements().await
    }

    /// Wait for queued placement work, then run due repairs once
    pub async fn settle(&self) {
        self.inner.workers.wait_idle().await;
        self.inner.run_repairs().await;
        self.inner.workers.wait_idle().await;
    }

    /// Flush the write-behind buffer and stop background tasks
    pub async fn shutdown(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Shutting down memory manager");

        if tokio::time::timeout(Duration::from_secs(5), inner.workers.wait_idle())
            .await
            .is_err()
        {
            warn!("Placement jobs still running at shutdown");
        }
        let flushed = inner.flush_all().await;
        inner.run_repairs().await;

        let _ = inner.shutdown.send(true);
        let tasks = std::mem::take(&mut *inner.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            let _ = task.await;
        }
        flushed.map(|n| {
            if n > 0 {
                info!("Flushed {n} buffered writes at shutdown");
            }
        })
    }
}

fn spawn_periodic<F, Fut>(
    owner: Weak<Inner>,
    mut shutdown: watch::Receiver<bool>,
    period: Duration,
    name: &'static str,
    tick: F,
) -> JoinHandle<()>
where
    F: Fn(Arc<Inner>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = interval.tick() => {}
            }
            let Some(inner) = owner.upgrade() else {
                break;
            };
            tick(inner).await;
        }
        debug!("{name} stopped");
    })
}

fn spawn_repair_loop(
    owner: Weak<Inner>,
    repairs: Arc<RepairQueue>,
    mut shutdown: watch::Receiver<bool>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = interval.tick() => {}
                _ = repairs.notified() => {}
            }
            let Some(inner) = owner.upgrade() else {
                break;
            };
            inner.run_repairs().await;
        }
        debug!("repair loop stopped");
    })
}

impl Inner {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(MemoryError::Shutdown)
        } else {
            Ok(())
        }
    }

    fn telemetry(&self) -> &AccessTelemetry {
        self.optimizer.telemetry()
    }

    /// Run one tier call under the tier deadline, tracking tier health
    async fn call<T>(
        &self,
        tier: TierId,
        timeout: Duration,
        operation: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(timeout, operation).await {
            Ok(Ok(value)) => {
                if self.health.is_down(tier) {
                    self.health.mark_up(tier);
                }
                Ok(value)
            }
            Ok(Err(e)) => {
                if e.is_transient() {
                    self.metrics.record_unavailable(tier);
                    self.health.mark_down(tier, e.to_string());
                }
                Err(e)
            }
            Err(_) => {
                self.metrics.record_tier_timeout(tier);
                let e = MemoryError::unavailable(
                    tier,
                    format!("timed out after {}ms", timeout.as_millis()),
                );
                self.health.mark_down(tier, e.to_string());
                Err(e)
            }
        }
    }

    /// Whether a read may consult `tier` for `key`
    fn readable(&self, tier: TierId, key: &EntryKey) -> bool {
        !self.health.should_skip(tier) && !self.repairs.is_pending(tier, key)
    }

    #[instrument(level = "debug", skip_all, fields(key = %key))]
    async fn get(&self, key: &EntryKey, budget: Duration) -> Result<Option<MemoryEntry>> {
        self.ensure_open()?;
        self.metrics.record_get();
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + budget;
        let now = self.clock.now();

        if let Some(entry) = self.write_behind.as_ref().and_then(|b| b.get(key)) {
            if entry.is_expired(now) {
                self.metrics.record_not_found();
                return Ok(None);
            }
            self.telemetry()
                .record(key, TierId::L1, started.elapsed(), entry.size_bytes() as u64);
            return Ok(Some(entry));
        }

        let mut missed = Vec::new();

        if let Some(l1) = self.registry.get(TierId::L1) {
            if self.readable(TierId::L1, key) {
                let probe = Instant::now();
                let read = tokio::time::timeout_at(
                    deadline,
                    self.call(TierId::L1, l1.descriptor().timeout, l1.get(key)),
                )
                .await;
                let Ok(read) = read else {
                    self.metrics.record_deadline_exceeded();
                    return Err(MemoryError::Timeout {
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    });
                };
                match read {
                    Ok(Some(mut entry)) if !entry.is_expired(now) => {
                        let latency = probe.elapsed();
                        self.metrics.record_hit(TierId::L1, latency);
                        debug!("hit in L1");
                        self.on_hit(key, TierId::L1, &entry, latency, &missed).await;
                        entry.mark_accessed(now);
                        return Ok(Some(entry));
                    }
                    Ok(_) => {
                        self.metrics.record_miss(TierId::L1, probe.elapsed());
                        missed.push(TierId::L1);
                    }
                    Err(e) => debug!("L1 probe failed: {e}"),
                }
            }
        }

        let mut durable_error = None;
        let mut probes = FuturesUnordered::new();
        for tier in self.registry.chain().iter().filter(|t| t.id() != TierId::L1) {
            let id = tier.id();
            if !self.readable(id, key) {
                if id == TierId::L3 {
                    let reason = self
                        .health
                        .reason(id)
                        .unwrap_or_else(|| "awaiting re-probe".to_string());
                    durable_error = Some(MemoryError::unavailable(id, reason));
                }
                continue;
            }
            let tier = tier.clone();
            probes.push(async move {
                let probe = Instant::now();
                let result = self.call(id, tier.descriptor().timeout, tier.get(key)).await;
                (id, result, probe.elapsed())
            });
        }

        let outcome = tokio::time::timeout_at(deadline, async {
            while let Some((id, result, latency)) = probes.next().await {
                match result {
                    Ok(Some(entry)) if !entry.is_expired(now) => {
                        self.metrics.record_hit(id, latency);
                        return Ok(Some((id, entry, latency)));
                    }
                    Ok(_) => {
                        self.metrics.record_miss(id, latency);
                        missed.push(id);
                    }
                    Err(e) if id == TierId::L3 => durable_error = Some(e),
                    Err(e) => debug!("{id} probe failed: {e}"),
                }
            }
            match durable_error.take() {
                Some(e) => Err(e),
                None => Ok(None),
            }
        })
        .await;

        match outcome {
            Err(_) => {
                self.metrics.record_deadline_exceeded();
                Err(MemoryError::Timeout {
                    elapsed_ms: started.elapsed().as_millis() as u64,
                })
            }
            Ok(Err(e)) => Err(e),
            Ok(Ok(None)) => {
                self.metrics.record_not_found();
                for tier in &missed {
                    self.telemetry().set_present(key, *tier, false);
                }
                Ok(None)
            }
            Ok(Ok(Some((tier, mut entry, latency)))) => {
                debug!("hit in {tier}");
                self.on_hit(key, tier, &entry, latency, &missed).await;
                entry.mark_accessed(now);
                Ok(Some(entry))
            }
        }
    }

    /// Record the access and, for a slower-tier hit, decide placement now
    async fn on_hit(
        &self,
        key: &EntryKey,
        tier: TierId,
        entry: &MemoryEntry,
        latency: Duration,
        missed: &[TierId],
    ) {
        let telemetry = self.telemetry();
        for miss in missed {
            telemetry.set_present(key, *miss, false);
        }
        telemetry.record(key, tier, latency, entry.size_bytes() as u64);
        if tier == TierId::L1 {
            return;
        }

        if let Some(l1) = self.registry.get(TierId::L1) {
            if let Ok(stats) = self
                .call(TierId::L1, l1.descriptor().timeout, l1.approximate_size())
                .await
            {
                self.stats.insert(TierId::L1, stats);
            }
        }
        let contexts = self.tier_contexts();
        let mut cycle = self.optimizer.begin_cycle();
        if let Some(plan) = self.optimizer.plan(key, &contexts, &mut cycle) {
            self.submit_plan(key, Some(entry.clone()), plan);
        }
    }

    fn submit_plan(&self, key: &EntryKey, entry: Option<MemoryEntry>, plan: PlacementPlan) -> bool {
        for tier in &plan.refused {
            self.metrics.record_promotion_refused(*tier);
        }
        if plan.is_noop() {
            return false;
        }
        let job = PlacementJob {
            key: key.clone(),
            entry,
            plan,
            read_at: Instant::now(),
        };
        if self.workers.try_submit(job) {
            self.metrics.record_job_submitted();
            true
        } else {
            self.metrics.record_job_dropped();
            debug!(key = %key, "placement queue full, job dropped");
            false
        }
    }

    fn tier_contexts(&self) -> Vec<TierContext> {
        self.registry
            .fast_tiers()
            .map(|tier| {
                let id = tier.id();
                let stats = self.stats.get(&id).map(|s| *s).unwrap_or_default();
                TierContext {
                    descriptor: tier.descriptor().clone(),
                    stats,
                    latency: self.metrics.median_latency(id),
                    available: !self.health.is_down(id),
                }
            })
            .collect()
    }

    async fn refresh_stats(&self) {
        for tier in self.registry.fast_tiers() {
            let id = tier.id();
            if self.health.should_skip(id) {
                continue;
            }
            if let Ok(stats) = self
                .call(id, tier.descriptor().timeout, tier.approximate_size())
                .await
            {
                self.stats.insert(id, stats);
            }
        }
    }

    #[instrument(level = "debug", skip_all, fields(key = %job.key))]
    async fn run_placement(&self, job: PlacementJob) {
        let key = job.key;
        let _guard = self.locks.lock(&key).await;
        let now = self.clock.now();

        let window = Duration::from_millis(self.config.consistency_window_ms);
        let trusted = job.read_at.elapsed() < window;
        let entry = match job.entry {
            _ if job.plan.promote.is_empty() => None,
            Some(entry) if trusted => Some(entry),
            read => match self.current_version(&key).await {
                Ok(current) => {
                    if let (Some(read), Some(current)) = (&read, &current) {
                        if current.sequence > read.sequence {
                            debug!(
                                read = read.sequence,
                                current = current.sequence,
                                "key rewritten since read, promoting the newer version"
                            );
                        }
                    }
                    current
                }
                Err(e) => {
                    warn!("Skipping promotion of {key}: {e}");
                    return;
                }
            },
        };
        let entry = entry.filter(|e| !e.is_expired(now));

        if let Some(entry) = &entry {
            if self.tombstones.blocks(&key, entry.sequence) {
                debug!("key deleted since read, promotion skipped");
                return;
            }
        }

        let telemetry = self.telemetry();
        if let Some(entry) = &entry {
            for (tier, victim) in &job.plan.displaced {
                let Some(store) = self.registry.get(*tier) else {
                    continue;
                };
                match self
                    .call(*tier, store.descriptor().timeout, store.delete(victim))
                    .await
                {
                    Ok(_) => {
                        telemetry.set_present(victim, *tier, false);
                        self.metrics.record_evictions(*tier, 1);
                    }
                    Err(e) => warn!("Failed to displace {victim} from {tier}: {e}"),
                }
            }

            for tier in &job.plan.promote {
                if self.repairs.is_pending(*tier, &key) {
                    continue;
                }
                let Some(store) = self.registry.get(*tier) else {
                    continue;
                };
                match self
                    .call(*tier, store.descriptor().timeout, store.set(entry))
                    .await
                {
                    Ok(()) => {
                        telemetry.set_present(&key, *tier, true);
                        self.metrics.record_promotion(*tier);
                        debug!("promoted into {tier}");
                    }
                    Err(MemoryError::StaleWriteRejected { .. }) => {
                        debug!("{tier} already holds a newer copy");
                    }
                    Err(MemoryError::CapacityExceeded { .. }) => {
                        self.metrics.record_promotion_refused(*tier);
                    }
                    Err(e) => warn!("Promotion of {key} into {tier} failed: {e}"),
                }
            }
        }

        if !job.plan.demote.is_empty() {
            self.demote_locked(&key, &job.plan.demote).await;
        }
        self.refresh_stats().await;
    }

    /// Newest acknowledged version: the write-behind buffer, then L3
    async fn current_version(&self, key: &EntryKey) -> Result<Option<MemoryEntry>> {
        if let Some(entry) = self.write_behind.as_ref().and_then(|b| b.get(key)) {
            return Ok(Some(entry));
        }
        let durable = self.registry.durable();
        self.call(TierId::L3, durable.descriptor().timeout, durable.get(key))
            .await
    }

    /// Drop cache copies; a buffered write is made durable first
    async fn demote_locked(&self, key: &EntryKey, tiers: &[TierId]) {
        if self.write_behind.as_ref().is_some_and(|b| b.contains(key)) {
            if let Err(e) = self.flush_locked(key).await {
                warn!("Demotion of {key} postponed, flush failed: {e}");
                return;
            }
        }
        for tier in tiers {
            let Some(store) = self.registry.get(*tier) else {
                continue;
            };
            match self
                .call(*tier, store.descriptor().timeout, store.delete(key))
                .await
            {
                Ok(_) => {
                    self.telemetry().set_present(key, *tier, false);
                    self.metrics.record_demotion(*tier);
                    debug!("demoted {key} from {tier}");
                }
                Err(e) => warn!("Demotion of {key} from {tier} failed: {e}"),
            }
        }
    }

    async fn recompute_placements(&self) -> usize {
        self.refresh_stats().await;
        let contexts = self.tier_contexts();
        let mut cycle = self.optimizer.begin_cycle();
        let keys = self.telemetry().tracked_keys();
        let mut submitted = 0;

        for chunk in keys.chunks(self.placement.recompute_chunk.max(1)) {
            if self.closed.load(Ordering::SeqCst) {
                break;
            }
            for key in chunk {
                if let Some(plan) = self.optimizer.plan(key, &contexts, &mut cycle) {
                    if self.submit_plan(key, None, plan) {
                        submitted += 1;
                    }
                }
            }
            tokio::task::yield_now().await;
        }

        let pruned = self.telemetry().prune_idle();
        self.tombstones.prune();
        if submitted > 0 || pruned > 0 {
            debug!(
                cycle = cycle.id(),
                submitted, pruned, "placement recompute finished"
            );
        }
        submitted
    }

    fn validate(&self, key: &EntryKey, options: &SetOptions) -> Result<()> {
        if key.key.is_empty() {
            return Err(MemoryError::InvalidInput("Key must not be empty".to_string()));
        }
        let searchable = options
            .metadata
            .get(SEARCHABLE_TAG)
            .is_some_and(|v| v == "true");
        if searchable && options.embedding.is_none() {
            return Err(MemoryError::InvalidInput(format!(
                "{key} is tagged {SEARCHABLE_TAG} but has no embedding"
            )));
        }
        Ok(())
    }

    /// Assign a sequence and check it against the key's tombstone
    fn build_entry(&self, key: EntryKey, value: Bytes, options: SetOptions) -> Result<MemoryEntry> {
        let mut sequence = match options.sequence {
            Some(sequence) => {
                self.sequence.observe(sequence);
                sequence
            }
            None => self.sequence.next(),
        };
        if let Some(deleted) = self.tombstones.sequence(&key) {
            if sequence <= deleted {
                if options.sequence.is_some() {
                    return Err(MemoryError::StaleWriteRejected {
                        key: key.to_string(),
                        stored: deleted,
                        attempted: sequence,
                    });
                }
                self.sequence.observe(deleted);
                sequence = self.sequence.next();
            }
        }

        let mut entry = MemoryEntry::new(key, value, sequence, self.clock.now())
            .with_metadata(options.metadata)
            .with_durability(options.durability);
        if let Some(ttl) = options.ttl {
            entry = entry.with_ttl(ttl);
        }
        if let Some(embedding) = options.embedding {
            entry = entry.with_embedding(embedding);
        }
        Ok(entry)
    }

    fn record_write(&self, result: &Result<WriteAck>) {
        match result {
            Ok(_) => self.metrics.record_set(),
            Err(MemoryError::StaleWriteRejected { .. }) => self.metrics.record_stale_rejected(),
            Err(_) => {}
        }
    }

    #[instrument(level = "debug", skip_all, fields(key = %key))]
    async fn set(&self, key: EntryKey, value: Bytes, options: SetOptions) -> Result<WriteAck> {
        self.ensure_open()?;
        self.validate(&key, &options)?;
        let _guard = self.locks.lock(&key).await;
        let result = self.set_locked(key, value, options).await;
        self.record_write(&result);
        result
    }

    async fn set_locked(&self, key: EntryKey, value: Bytes, options: SetOptions) -> Result<WriteAck> {
        let explicit = options.sequence.is_some();
        let mut entry = self.build_entry(key, value, options)?;

        if let Some(buffer) = &self.write_behind {
            self.buffer_write(buffer, &mut entry, explicit)?;
            self.metrics.set_write_behind_pending(buffer.len());
            self.populate_cache_tiers(&entry).await;
            return Ok(WriteAck {
                sequence: entry.sequence,
                durable: false,
            });
        }

        self.write_durable(&mut entry, explicit).await?;
        self.populate_cache_tiers(&entry).await;
        Ok(WriteAck {
            sequence: entry.sequence,
            durable: true,
        })
    }

    /// Move an auto-sequenced entry past `stored`, a sequence some caller
    /// chose ahead of the clock
    fn resequence(&self, entry: &mut MemoryEntry, stored: u64) {
        self.sequence.observe(stored);
        entry.sequence = self.sequence.next();
    }

    fn buffer_write(
        &self,
        buffer: &WriteBehindBuffer,
        entry: &mut MemoryEntry,
        explicit: bool,
    ) -> Result<()> {
        match buffer.insert(entry.clone(), explicit) {
            Err(MemoryError::StaleWriteRejected { stored, .. }) if !explicit => {
                self.resequence(entry, stored);
                buffer.insert(entry.clone(), explicit)
            }
            result => result,
        }
    }

    /// Write to L3; an auto-sequenced entry that loses to a stored explicit
    /// sequence is resequenced and written once more
    async fn write_durable(&self, entry: &mut MemoryEntry, explicit: bool) -> Result<()> {
        let durable = self.registry.durable();
        let timeout = durable.descriptor().timeout;
        let first = self.call(TierId::L3, timeout, durable.set(&*entry)).await;
        match first {
            Err(MemoryError::StaleWriteRejected { stored, .. }) if !explicit => {
                self.resequence(entry, stored);
                self.call(TierId::L3, timeout, durable.set(&*entry)).await
            }
            result => result,
        }
    }

    /// Best-effort cache population after a durable (or buffered) write.
    /// L1 is written inline; slower tiers go through the repair queue.
    async fn populate_cache_tiers(&self, entry: &MemoryEntry) {
        let key = &entry.key;
        let telemetry = self.telemetry();
        telemetry.set_size(key, entry.size_bytes() as u64);

        for tier in self.registry.fast_tiers() {
            let id = tier.id();
            if id != TierId::L1 {
                self.repairs.record(id, key, RepairOp::Upsert(entry.clone()));
                continue;
            }
            match self.call(id, tier.descriptor().timeout, tier.set(entry)).await {
                Ok(()) => telemetry.set_present(key, id, true),
                Err(MemoryError::StaleWriteRejected { .. }) => {}
                Err(e) => {
                    debug!("L1 population of {key} deferred: {e}");
                    self.repairs.record(id, key, RepairOp::Upsert(entry.clone()));
                }
            }
        }

        if self.registry.similarity().is_some() {
            if entry.is_searchable() {
                self.repairs
                    .record(TierId::L4, key, RepairOp::Upsert(entry.clone()));
            } else if telemetry.mask(key).contains(TierId::L4) {
                self.repairs.record(TierId::L4, key, RepairOp::Delete);
            }
        }
        self.metrics.set_repairs_pending(self.repairs.len());
    }

    #[instrument(level = "debug", skip_all, fields(key = %key))]
    async fn delete(&self, key: &EntryKey) -> Result<bool> {
        self.ensure_open()?;
        let _guard = self.locks.lock(key).await;
        let deleted = self.delete_locked(key).await?;
        self.metrics.record_delete();
        Ok(deleted)
    }

    async fn delete_locked(&self, key: &EntryKey) -> Result<bool> {
        let durable = self.registry.durable();
        let timeout = durable.descriptor().timeout;

        let buffered = self.write_behind.as_ref().and_then(|b| b.get(key));
        let stored = self
            .call(TierId::L3, timeout, durable.get(key))
            .await?;
        let removed = self.call(TierId::L3, timeout, durable.delete(key)).await?;
        if let Some(buffer) = &self.write_behind {
            buffer.take(key);
            self.metrics.set_write_behind_pending(buffer.len());
        }

        let mut newest = [
            buffered.as_ref().map(|e| e.sequence),
            stored.as_ref().map(|e| e.sequence),
        ]
        .into_iter()
        .flatten()
        .max();

        if let Some(l1) = self.registry.get(TierId::L1) {
            let timeout = l1.descriptor().timeout;
            if let Ok(Some(cached)) = self.call(TierId::L1, timeout, l1.get(key)).await {
                newest = newest.max(Some(cached.sequence));
            }
            if let Err(e) = self.call(TierId::L1, timeout, l1.delete(key)).await {
                debug!("L1 delete of {key} deferred: {e}");
                self.repairs.record(TierId::L1, key, RepairOp::Delete);
            }
        }
        if let Some(sequence) = newest {
            self.tombstones.record(key, sequence);
        }

        for tier in self.registry.fast_tiers().filter(|t| t.id() != TierId::L1) {
            self.repairs.record(tier.id(), key, RepairOp::Delete);
        }
        if self.registry.similarity().is_some() {
            self.repairs.record(TierId::L4, key, RepairOp::Delete);
        }
        self.telemetry().forget(key);
        self.metrics.set_repairs_pending(self.repairs.len());

        Ok(removed || buffered.is_some())
    }

    async fn batch(&self, ops: Vec<Operation>) -> Vec<Result<OpOutcome>> {
        if self.ensure_open().is_err() {
            return ops.iter().map(|_| Err(MemoryError::Shutdown)).collect();
        }
        let budget = Duration::from_millis(self.config.get_deadline_ms);
        let mut results: Vec<Option<Result<OpOutcome>>> = ops.iter().map(|_| None).collect();

        for group in plan_groups(&ops) {
            match group.kind {
                OperationKind::Get => {
                    let reads = group.indices.iter().map(|&i| self.get(ops[i].key(), budget));
                    let outcomes = futures::future::join_all(reads).await;
                    for (i, outcome) in group.indices.iter().zip(outcomes) {
                        results[*i] = Some(outcome.map(OpOutcome::Value));
                    }
                }
                OperationKind::Delete => {
                    let deletes = group.indices.iter().map(|&i| self.delete(ops[i].key()));
                    let outcomes = futures::future::join_all(deletes).await;
                    for (i, outcome) in group.indices.iter().zip(outcomes) {
                        results[*i] = Some(outcome.map(OpOutcome::Deleted));
                    }
                }
                OperationKind::Set => {
                    let writes = group
                        .indices
                        .iter()
                        .filter_map(|&i| match &ops[i] {
                            Operation::Set {
                                key,
                                value,
                                options,
                            } => Some((key.clone(), value.clone(), options.clone())),
                            _ => None,
                        })
                        .collect();
                    let outcomes = self.set_group(writes).await;
                    for (i, outcome) in group.indices.iter().zip(outcomes) {
                        results[*i] = Some(outcome.map(OpOutcome::Written));
                    }
                }
            }
        }

        results
            .into_iter()
            .map(|r| {
                r.unwrap_or_else(|| {
                    Err(MemoryError::InvalidInput(
                        "operation was not executed".to_string(),
                    ))
                })
            })
            .collect()
    }

    /// Write distinct keys with one durable round trip
    async fn set_group(&self, writes: Vec<(EntryKey, Bytes, SetOptions)>) -> Vec<Result<WriteAck>> {
        let _guards = self.locks.lock_many(writes.iter().map(|(k, _, _)| k)).await;
        let mut results: Vec<Option<Result<WriteAck>>> = writes.iter().map(|_| None).collect();
        let mut accepted: Vec<(usize, MemoryEntry, bool)> = Vec::new();

        for (i, (key, value, options)) in writes.into_iter().enumerate() {
            let explicit = options.sequence.is_some();
            match self
                .validate(&key, &options)
                .and_then(|_| self.build_entry(key, value, options))
            {
                Ok(entry) => accepted.push((i, entry, explicit)),
                Err(e) => results[i] = Some(Err(e)),
            }
        }

        if let Some(buffer) = &self.write_behind {
            for (i, mut entry, explicit) in accepted {
                let result = self
                    .buffer_write(buffer, &mut entry, explicit)
                    .map(|_| WriteAck {
                        sequence: entry.sequence,
                        durable: false,
                    });
                if result.is_ok() {
                    self.populate_cache_tiers(&entry).await;
                }
                results[i] = Some(result);
            }
            self.metrics.set_write_behind_pending(buffer.len());
        } else if !accepted.is_empty() {
            let durable = self.registry.durable();
            let entries: Vec<MemoryEntry> = accepted.iter().map(|(_, e, _)| e.clone()).collect();
            let budget = durable
                .descriptor()
                .timeout
                .saturating_mul(entries.len().clamp(1, 10) as u32);
            let outcomes = match tokio::time::timeout(budget, durable.set_many(&entries)).await {
                Ok(outcomes) => outcomes,
                Err(_) => {
                    self.metrics.record_tier_timeout(TierId::L3);
                    self.health.mark_down(TierId::L3, "batch write timed out");
                    entries
                        .iter()
                        .map(|_| {
                            Err(MemoryError::unavailable(TierId::L3, "batch write timed out"))
                        })
                        .collect()
                }
            };
            for ((i, mut entry, explicit), outcome) in accepted.into_iter().zip(outcomes) {
                let outcome = match outcome {
                    Err(MemoryError::StaleWriteRejected { stored, .. }) if !explicit => {
                        self.resequence(&mut entry, stored);
                        self.call(TierId::L3, durable.descriptor().timeout, durable.set(&entry))
                            .await
                    }
                    outcome => outcome,
                };
                let result = match outcome {
                    Ok(()) => {
                        self.populate_cache_tiers(&entry).await;
                        Ok(WriteAck {
                            sequence: entry.sequence,
                            durable: true,
                        })
                    }
                    Err(e) => Err(e),
                };
                results[i] = Some(result);
            }
        }

        results
            .into_iter()
            .map(|r| {
                let result = r.unwrap_or_else(|| {
                    Err(MemoryError::Storage("durable tier returned too few results".to_string()))
                });
                self.record_write(&result);
                result
            })
            .collect()
    }

    #[instrument(level = "debug", skip_all, fields(k = k))]
    async fn search(&self, query: &[f32], k: usize, filter: &SearchFilter) -> Result<Vec<ScoredEntry>> {
        self.ensure_open()?;
        let similarity = self.registry.similarity().ok_or_else(|| {
            MemoryError::InvalidInput("No similarity tier is configured".to_string())
        })?;
        self.metrics.record_search();
        if k == 0 {
            return Ok(Vec::new());
        }

        let hits = self
            .call(
                TierId::L4,
                similarity.descriptor().timeout,
                similarity.search(query, k, filter),
            )
            .await?;
        let now = self.clock.now();
        Ok(hits
            .into_iter()
            .filter(|hit| {
                let key = &hit.entry.key;
                !hit.entry.is_expired(now)
                    && !self.tombstones.blocks(key, hit.entry.sequence)
                    && !self
                        .repairs
                        .current(TierId::L4, key)
                        .is_some_and(|r| matches!(r.op, RepairOp::Delete))
            })
            .collect())
    }

    async fn flush(&self, key: &EntryKey) -> Result<()> {
        if self.write_behind.is_none() {
            return Ok(());
        }
        let _guard = self.locks.lock(key).await;
        self.flush_locked(key).await
    }

    async fn flush_locked(&self, key: &EntryKey) -> Result<()> {
        let Some(buffer) = &self.write_behind else {
            return Ok(());
        };
        let Some(mut write) = buffer.take(key) else {
            return Ok(());
        };
        let buffered_sequence = write.entry.sequence;
        let result = self.write_durable(&mut write.entry, write.explicit).await;
        match &result {
            Ok(()) => {
                if write.entry.sequence != buffered_sequence {
                    // Cache copies still carry the sequence that was buffered
                    self.populate_cache_tiers(&write.entry).await;
                }
            }
            Err(MemoryError::StaleWriteRejected { .. }) => {
                self.metrics.record_stale_rejected();
                error!("Buffered write for {key} is older than the durable copy, dropped");
                self.invalidate_cache_copies(key).await;
            }
            Err(e) => {
                error!("Flush of {key} failed: {e}");
                buffer.restore(write);
            }
        }
        self.metrics.set_write_behind_pending(buffer.len());
        result
    }

    /// Remove cache copies of a buffered write that lost to the durable
    /// copy. L1 is cleared inline; the other tiers are skipped for the key
    /// until their repair is verified.
    async fn invalidate_cache_copies(&self, key: &EntryKey) {
        for tier in self.registry.fast_tiers() {
            let id = tier.id();
            if id == TierId::L1 {
                match self.call(id, tier.descriptor().timeout, tier.delete(key)).await {
                    Ok(_) => {
                        self.telemetry().set_present(key, id, false);
                        continue;
                    }
                    Err(e) => debug!("L1 invalidation of {key} deferred: {e}"),
                }
            }
            self.repairs.record(id, key, RepairOp::Delete);
        }

        if self.registry.similarity().is_some() {
            let durable = self.registry.durable();
            let op = match self
                .call(TierId::L3, durable.descriptor().timeout, durable.get(key))
                .await
            {
                Ok(Some(current)) if current.is_searchable() => RepairOp::Upsert(current),
                _ => RepairOp::Delete,
            };
            self.repairs.record(TierId::L4, key, op);
        }
        self.metrics.set_repairs_pending(self.repairs.len());
    }

    async fn flush_all(&self) -> Result<usize> {
        let Some(buffer) = &self.write_behind else {
            return Ok(0);
        };
        let mut flushed = 0;
        let mut first_error = None;
        for key in buffer.keys() {
            let _guard = self.locks.lock(&key).await;
            match self.flush_locked(&key).await {
                Ok(()) => flushed += 1,
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(flushed),
        }
    }

    /// Flush buffered writes whose staleness deadline is near
    async fn flush_due(&self) {
        let Some(buffer) = &self.write_behind else {
            return;
        };
        for key in buffer.due(buffer.max_staleness() / 2) {
            let _guard = self.locks.lock(&key).await;
            // Errors are logged in flush_locked and retried next tick
            let _ = self.flush_locked(&key).await;
        }
    }

    async fn run_repairs(&self) -> usize {
        let due = self.repairs.due(REPAIR_BATCH);
        if due.is_empty() {
            return 0;
        }
        let verified = AtomicUsize::new(0);
        futures::stream::iter(due)
            .for_each_concurrent(self.config.worker_concurrency.max(1), |(tier, key)| {
                let verified = &verified;
                async move {
                    if self.repair_one(tier, &key).await {
                        verified.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
            .await;
        self.metrics.set_repairs_pending(self.repairs.len());
        verified.into_inner()
    }

    async fn repair_one(&self, tier: TierId, key: &EntryKey) -> bool {
        if self.health.should_skip(tier) {
            return false;
        }
        let _guard = self.locks.lock(key).await;
        let Some(repair) = self.repairs.current(tier, key) else {
            return false;
        };

        let outcome = if tier == TierId::L4 {
            match self.registry.similarity() {
                Some(store) => self.apply_repair(store.as_ref(), key, &repair.op).await,
                None => Ok(()),
            }
        } else {
            match self.registry.get(tier) {
                Some(store) => self.apply_repair(store.as_ref(), key, &repair.op).await,
                None => Ok(()),
            }
        };

        match outcome {
            Ok(()) => {
                self.repairs.complete(tier, key, repair.generation);
                true
            }
            Err(e) => {
                debug!(attempts = repair.attempts, "repair of {key} in {tier} failed: {e}");
                self.repairs.retry_later(tier, key, repair.generation);
                false
            }
        }
    }

    /// Apply one repair and verify the tier no longer holds a stale copy
    async fn apply_repair<T: TierStore + ?Sized>(
        &self,
        tier: &T,
        key: &EntryKey,
        op: &RepairOp,
    ) -> Result<()> {
        let id = tier.id();
        let timeout = tier.descriptor().timeout;
        let telemetry = self.telemetry();

        match op {
            RepairOp::Upsert(entry) => {
                match self.call(id, timeout, tier.set(entry)).await {
                    Ok(()) | Err(MemoryError::StaleWriteRejected { .. }) => {}
                    Err(MemoryError::CapacityExceeded { .. }) => {
                        // No room: make sure no older copy survives instead
                        self.call(id, timeout, tier.delete(key)).await?;
                        telemetry.set_present(key, id, false);
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                }
                match self.call(id, timeout, tier.get(key)).await? {
                    Some(stored) if stored.sequence < entry.sequence => {
                        Err(MemoryError::Storage(format!(
                            "{id} still holds sequence {} for {key}",
                            stored.sequence
                        )))
                    }
                    Some(_) => {
                        telemetry.set_present(key, id, true);
                        Ok(())
                    }
                    None => Ok(()),
                }
            }
            RepairOp::Delete => {
                self.call(id, timeout, tier.delete(key)).await?;
                if self.call(id, timeout, tier.exists(key)).await? {
                    return Err(MemoryError::Storage(format!("{id} still holds {key}")));
                }
                telemetry.set_present(key, id, false);
                Ok(())
            }
        }
    }

    async fn purge_tier<T: TierStore + ?Sized>(&self, tier: &T, report: &mut CleanupReport) -> bool {
        let id = tier.id();
        let chunk = self.config.cleanup_chunk.max(1);
        let now = self.clock.now();
        let timeout = tier.descriptor().timeout.max(Duration::from_secs(1));
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return false;
            }
            match self.call(id, timeout, tier.purge_expired(now, chunk)).await {
                Ok(keys) => {
                    for key in &keys {
                        self.telemetry().set_present(key, id, false);
                    }
                    *report.purged.entry(id).or_default() += keys.len() as u64;
                    if keys.len() < chunk {
                        return true;
                    }
                }
                Err(e) => {
                    warn!("Expiry sweep of {id} stopped: {e}");
                    report.failed.push(id);
                    return true;
                }
            }
        }
    }

    async fn cleanup_expired(&self) -> Result<CleanupReport> {
        let mut report = CleanupReport {
            completed: true,
            ..Default::default()
        };
        for tier in self.registry.chain() {
            if !self.purge_tier(tier.as_ref(), &mut report).await {
                report.completed = false;
                return Ok(report);
            }
        }
        if let Some(similarity) = self.registry.similarity() {
            if !self.purge_tier(similarity.as_ref(), &mut report).await {
                report.completed = false;
                return Ok(report);
            }
        }

        let total = report.total();
        self.metrics.record_expired_purged(total);
        if total > 0 {
            info!("Expiry sweep removed {total} entries");
        }
        Ok(report)
    }

    async fn probe<T: TierStore + ?Sized>(&self, tier: &T) -> TierHealthReport {
        let id = tier.id();
        let started = Instant::now();
        let result = self
            .call(id, tier.descriptor().timeout, tier.approximate_size())
            .await;
        let probe_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(stats) => {
                self.health.mark_up(id);
                self.stats.insert(id, stats);
                TierHealthReport {
                    tier: id,
                    role: id.role().to_string(),
                    status: TierStatus::Up,
                    probe_ms,
                    entries: Some(stats.entries),
                    bytes: Some(stats.bytes),
                    evictions: Some(stats.evictions),
                    error: None,
                }
            }
            Err(e) => TierHealthReport {
                tier: id,
                role: id.role().to_string(),
                status: TierStatus::Unavailable,
                probe_ms,
                entries: None,
                bytes: None,
                evictions: None,
                error: Some(e.to_string()),
            },
        }
    }

    async fn health(&self) -> HealthReport {
        let probes = self.registry.chain().iter().map(|t| self.probe(t.as_ref()));
        let mut tiers = futures::future::join_all(probes).await;
        if let Some(similarity) = self.registry.similarity() {
            tiers.push(self.probe(similarity.as_ref()).await);
        }
        let healthy = tiers
            .iter()
            .any(|t| t.tier == TierId::L3 && t.status == TierStatus::Up);

        HealthReport {
            healthy,
            placement_model: self.optimizer.model_name().to_string(),
            tiers,
            repairs_pending: self.repairs.len(),
            write_behind_pending: self.write_behind.as_ref().map_or(0, |b| b.len()),
            tombstones: self.tombstones.len(),
            metrics: self.metrics.snapshot(),
        }
    }
}
