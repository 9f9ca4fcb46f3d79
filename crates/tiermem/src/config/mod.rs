use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{MemoryError, Result};
use crate::memory::types::{DEFAULT_NAMESPACE, TierId};
use crate::tier::{Capacity, EvictionPolicy, TierDescriptor, WriteMode};

/// Main configuration structure for tiermem
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Namespace used for bare keys
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Base directory for the durable and similarity stores
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Manager behaviour (deadlines, worker pool, background loops)
    #[serde(default)]
    pub manager: ManagerConfig,
    /// Per-tier settings
    #[serde(default)]
    pub tiers: TiersConfig,
    /// Placement optimizer settings
    #[serde(default)]
    pub placement: PlacementConfig,
    /// Shared cache daemon settings
    #[serde(default)]
    pub server: ServerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            data_dir: default_data_dir(),
            manager: ManagerConfig::default(),
            tiers: TiersConfig::default(),
            placement: PlacementConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".tiermem"))
        .unwrap_or_else(|| PathBuf::from(".tiermem"))
}

impl Config {
    /// Parse configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| MemoryError::Config(format!("Failed to parse config: {e}")))
    }

    /// Load from `path`, or from the first default location that exists.
    ///
    /// Default locations: `~/.tiermem/config.toml`,
    /// `<config_dir>/tiermem/config.toml`, `./config.toml`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load_file(path);
        }

        let default_paths = [
            dirs::home_dir().map(|h| h.join(".tiermem").join("config.toml")),
            dirs::config_dir().map(|c| c.join("tiermem").join("config.toml")),
            Some(PathBuf::from("config.toml")),
        ];

        for path in default_paths.iter().flatten() {
            if path.exists() {
                return Self::load_file(path);
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_file(path: &Path) -> Result<Self> {
        tracing::info!("Loading config from: {}", path.display());
        let content = std::fs::read_to_string(path).map_err(|e| {
            MemoryError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        let config = Self::from_toml_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the manager cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(MemoryError::Config("namespace must not be empty".to_string()));
        }
        if self.manager.worker_concurrency == 0 {
            return Err(MemoryError::Config(
                "manager.worker_concurrency must be at least 1".to_string(),
            ));
        }
        if self.manager.queue_capacity == 0 {
            return Err(MemoryError::Config(
                "manager.queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.manager.lock_shards == 0 {
            return Err(MemoryError::Config(
                "manager.lock_shards must be at least 1".to_string(),
            ));
        }
        if self.manager.get_deadline_ms == 0 {
            return Err(MemoryError::Config(
                "manager.get_deadline_ms must be positive".to_string(),
            ));
        }

        let thresholds = [
            (TierId::L1, self.tiers.l1.promote_threshold, self.tiers.l1.retain_threshold),
            (TierId::L2, self.tiers.l2.promote_threshold, self.tiers.l2.retain_threshold),
        ];
        for (tier, promote, retain) in thresholds {
            if retain > promote {
                return Err(MemoryError::Config(format!(
                    "{tier} retain_threshold ({retain}) exceeds promote_threshold ({promote})"
                )));
            }
            if promote < 0.0 || retain < 0.0 {
                return Err(MemoryError::Config(format!(
                    "{tier} thresholds must not be negative"
                )));
            }
        }

        if self.tiers.l1.max_entries == Some(0) {
            return Err(MemoryError::Config(
                "tiers.l1.max_entries must be positive".to_string(),
            ));
        }
        if self.tiers.l3.write_mode == WriteModeKind::WriteBehind
            && self.tiers.l3.max_staleness_ms == 0
        {
            return Err(MemoryError::Config(
                "tiers.l3.max_staleness_ms is required for write_behind".to_string(),
            ));
        }
        if self.tiers.l4.enabled && self.tiers.l4.dimension == 0 {
            return Err(MemoryError::Config(
                "tiers.l4.dimension must be positive".to_string(),
            ));
        }
        if self.placement.window_ms == 0 {
            return Err(MemoryError::Config(
                "placement.window_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// sqlx url of the durable store
    pub fn durable_url(&self) -> String {
        self.tiers.l3.database_url.clone().unwrap_or_else(|| {
            format!(
                "sqlite://{}?mode=rwc",
                self.data_dir.join("tiermem.db").display()
            )
        })
    }
}

/// Manager behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Budget for a whole `get` across the probe chain
    #[serde(default = "default_get_deadline_ms")]
    pub get_deadline_ms: u64,
    /// Maximum concurrent background promotion/demotion jobs
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
    /// Bounded job queue; jobs are dropped when full
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Number of key-lock shards on the write path
    #[serde(default = "default_lock_shards")]
    pub lock_shards: usize,
    /// How long deletes are remembered to block resurrection
    #[serde(default = "default_tombstone_grace_secs")]
    pub tombstone_grace_secs: u64,
    /// How long an unavailable tier is skipped before re-probing
    #[serde(default = "default_reprobe_interval_ms")]
    pub reprobe_interval_ms: u64,
    /// Interval of the fast-tier repair loop
    #[serde(default = "default_repair_interval_ms")]
    pub repair_interval_ms: u64,
    /// Entries purged per tier per cleanup chunk
    #[serde(default = "default_cleanup_chunk")]
    pub cleanup_chunk: usize,
    /// Background cleanup interval (0 disables the loop)
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// How long a queued promotion may apply the version it read. Older
    /// jobs re-read the write-behind buffer or L3 first; 0 re-reads always.
    #[serde(default)]
    pub consistency_window_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            get_deadline_ms: default_get_deadline_ms(),
            worker_concurrency: default_worker_concurrency(),
            queue_capacity: default_queue_capacity(),
            lock_shards: default_lock_shards(),
            tombstone_grace_secs: default_tombstone_grace_secs(),
            reprobe_interval_ms: default_reprobe_interval_ms(),
            repair_interval_ms: default_repair_interval_ms(),
            cleanup_chunk: default_cleanup_chunk(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            consistency_window_ms: 0,
        }
    }
}

fn default_get_deadline_ms() -> u64 {
    250
}

fn default_worker_concurrency() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_lock_shards() -> usize {
    64
}

fn default_tombstone_grace_secs() -> u64 {
    300
}

fn default_reprobe_interval_ms() -> u64 {
    1000
}

fn default_repair_interval_ms() -> u64 {
    200
}

fn default_cleanup_chunk() -> usize {
    500
}

fn default_cleanup_interval_secs() -> u64 {
    60
}

/// Settings for every tier
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TiersConfig {
    #[serde(default)]
    pub l1: LocalTierConfig,
    #[serde(default)]
    pub l2: SharedTierConfig,
    #[serde(default)]
    pub l3: DurableTierConfig,
    #[serde(default)]
    pub l4: SimilarityTierConfig,
}

/// In-process tier (L1)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalTierConfig {
    #[serde(default = "default_l1_max_entries")]
    pub max_entries: Option<u64>,
    #[serde(default = "default_l1_max_bytes")]
    pub max_bytes: Option<u64>,
    #[serde(default)]
    pub eviction: EvictionPolicy,
    #[serde(default = "default_l1_timeout_ms")]
    pub timeout_ms: u64,
    /// Accesses per window to be promoted into L1
    #[serde(default = "default_l1_promote_threshold")]
    pub promote_threshold: f64,
    #[serde(default = "default_l1_retain_threshold")]
    pub retain_threshold: f64,
    #[serde(default = "default_l1_cooldown_ms")]
    pub cooldown_ms: u64,
}

impl Default for LocalTierConfig {
    fn default() -> Self {
        Self {
            max_entries: default_l1_max_entries(),
            max_bytes: default_l1_max_bytes(),
            eviction: EvictionPolicy::Lru,
            timeout_ms: default_l1_timeout_ms(),
            promote_threshold: default_l1_promote_threshold(),
            retain_threshold: default_l1_retain_threshold(),
            cooldown_ms: default_l1_cooldown_ms(),
        }
    }
}

impl LocalTierConfig {
    pub fn descriptor(&self) -> TierDescriptor {
        TierDescriptor::new(TierId::L1)
            .with_capacity(Capacity {
                max_entries: self.max_entries,
                max_bytes: self.max_bytes,
            })
            .with_eviction(self.eviction)
            .with_timeout(Duration::from_millis(self.timeout_ms))
            .with_thresholds(self.promote_threshold, self.retain_threshold)
            .with_cooldown(Duration::from_millis(self.cooldown_ms))
    }
}

fn default_l1_max_entries() -> Option<u64> {
    Some(10_000)
}

fn default_l1_max_bytes() -> Option<u64> {
    Some(64 * 1024 * 1024)
}

fn default_l1_timeout_ms() -> u64 {
    5
}

fn default_l1_promote_threshold() -> f64 {
    3.0
}

fn default_l1_retain_threshold() -> f64 {
    1.0
}

fn default_l1_cooldown_ms() -> u64 {
    30_000
}

/// Shared cache tier (L2)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedTierConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Base url of a `tiermem-cache` daemon
    #[serde(default = "default_l2_url")]
    pub url: String,
    #[serde(default = "default_l2_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_l2_retries")]
    pub retries: u32,
    #[serde(default = "default_l2_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Capacity bound the daemon is configured with
    #[serde(default)]
    pub max_entries: Option<u64>,
    #[serde(default = "default_l2_promote_threshold")]
    pub promote_threshold: f64,
    #[serde(default = "default_l2_retain_threshold")]
    pub retain_threshold: f64,
    #[serde(default = "default_l2_cooldown_ms")]
    pub cooldown_ms: u64,
}

impl Default for SharedTierConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_l2_url(),
            timeout_ms: default_l2_timeout_ms(),
            retries: default_l2_retries(),
            backoff_base_ms: default_l2_backoff_base_ms(),
            max_entries: None,
            promote_threshold: default_l2_promote_threshold(),
            retain_threshold: default_l2_retain_threshold(),
            cooldown_ms: default_l2_cooldown_ms(),
        }
    }
}

impl SharedTierConfig {
    pub fn descriptor(&self) -> TierDescriptor {
        TierDescriptor::new(TierId::L2)
            .with_capacity(Capacity {
                max_entries: self.max_entries,
                max_bytes: None,
            })
            .with_timeout(Duration::from_millis(self.timeout_ms))
            .with_thresholds(self.promote_threshold, self.retain_threshold)
            .with_cooldown(Duration::from_millis(self.cooldown_ms))
    }
}

fn default_l2_url() -> String {
    "http://127.0.0.1:7379".to_string()
}

fn default_l2_timeout_ms() -> u64 {
    50
}

fn default_l2_retries() -> u32 {
    2
}

fn default_l2_backoff_base_ms() -> u64 {
    25
}

fn default_l2_promote_threshold() -> f64 {
    2.0
}

fn default_l2_retain_threshold() -> f64 {
    0.5
}

fn default_l2_cooldown_ms() -> u64 {
    120_000
}

/// Write acknowledgement mode of the durable tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteModeKind {
    #[default]
    WriteThrough,
    WriteBehind,
}

/// Durable tier (L3)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DurableTierConfig {
    /// sqlx SQLite url; defaults to `<data_dir>/tiermem.db`
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default = "default_l3_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_l3_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub write_mode: WriteModeKind,
    /// Upper bound on how long a write-behind entry may stay unflushed
    #[serde(default = "default_l3_max_staleness_ms")]
    pub max_staleness_ms: u64,
}

impl Default for DurableTierConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: default_l3_max_connections(),
            timeout_ms: default_l3_timeout_ms(),
            write_mode: WriteModeKind::WriteThrough,
            max_staleness_ms: default_l3_max_staleness_ms(),
        }
    }
}

impl DurableTierConfig {
    pub fn descriptor(&self) -> TierDescriptor {
        let write_mode = match self.write_mode {
            WriteModeKind::WriteThrough => WriteMode::WriteThrough,
            WriteModeKind::WriteBehind => WriteMode::WriteBehind {
                max_staleness: Duration::from_millis(self.max_staleness_ms),
            },
        };
        TierDescriptor::new(TierId::L3)
            .with_eviction(EvictionPolicy::Lru)
            .with_write_mode(write_mode)
            .with_timeout(Duration::from_millis(self.timeout_ms))
    }
}

fn default_l3_max_connections() -> u32 {
    5
}

fn default_l3_timeout_ms() -> u64 {
    1000
}

fn default_l3_max_staleness_ms() -> u64 {
    1000
}

/// Similarity tier (L4)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarityTierConfig {
    #[serde(default = "default_l4_enabled")]
    pub enabled: bool,
    /// LanceDB directory, relative to `data_dir`
    #[serde(default = "default_l4_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_l4_table")]
    pub table: String,
    #[serde(default = "default_l4_dimension")]
    pub dimension: usize,
    /// Candidates fetched per requested result before post-filtering
    #[serde(default = "default_l4_overfetch")]
    pub overfetch: usize,
    #[serde(default = "default_l4_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for SimilarityTierConfig {
    fn default() -> Self {
        Self {
            enabled: default_l4_enabled(),
            directory: default_l4_directory(),
            table: default_l4_table(),
            dimension: default_l4_dimension(),
            overfetch: default_l4_overfetch(),
            timeout_ms: default_l4_timeout_ms(),
        }
    }
}

impl SimilarityTierConfig {
    pub fn descriptor(&self) -> TierDescriptor {
        TierDescriptor::new(TierId::L4)
            .with_eviction(EvictionPolicy::None)
            .with_timeout(Duration::from_millis(self.timeout_ms))
    }
}

fn default_l4_enabled() -> bool {
    true
}

fn default_l4_directory() -> PathBuf {
    PathBuf::from("vectors")
}

fn default_l4_table() -> String {
    crate::tier::similarity::DEFAULT_TABLE.to_string()
}

fn default_l4_dimension() -> usize {
    crate::tier::similarity::DEFAULT_DIMENSION
}

fn default_l4_overfetch() -> usize {
    4
}

fn default_l4_timeout_ms() -> u64 {
    2000
}

/// Which placement model scores keys
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlacementModelKind {
    /// Deterministic frequency/recency thresholds
    #[default]
    Heuristic,
    /// Logistic score over the same features
    Linear,
}

/// Placement optimizer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementConfig {
    #[serde(default)]
    pub model: PlacementModelKind,
    /// Trailing window for access frequency
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    /// Events kept per key inside the window
    #[serde(default = "default_max_events_per_key")]
    pub max_events_per_key: usize,
    /// Interval of the asynchronous recompute pass (0 disables it)
    #[serde(default = "default_recompute_interval_ms")]
    pub recompute_interval_ms: u64,
    /// Keys scored per recompute chunk
    #[serde(default = "default_recompute_chunk")]
    pub recompute_chunk: usize,
    #[serde(default)]
    pub linear: LinearModelConfig,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            model: PlacementModelKind::Heuristic,
            window_ms: default_window_ms(),
            max_events_per_key: default_max_events_per_key(),
            recompute_interval_ms: default_recompute_interval_ms(),
            recompute_chunk: default_recompute_chunk(),
            linear: LinearModelConfig::default(),
        }
    }
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_max_events_per_key() -> usize {
    64
}

fn default_recompute_interval_ms() -> u64 {
    5_000
}

fn default_recompute_chunk() -> usize {
    256
}

/// Weights of the logistic placement model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearModelConfig {
    #[serde(default = "default_linear_bias")]
    pub bias: f64,
    #[serde(default = "default_linear_frequency")]
    pub frequency: f64,
    #[serde(default = "default_linear_recency")]
    pub recency: f64,
    #[serde(default = "default_linear_size")]
    pub size: f64,
    #[serde(default = "default_linear_latency")]
    pub latency: f64,
    #[serde(default = "default_linear_pressure")]
    pub pressure: f64,
    /// Score above which a key belongs in a tier
    #[serde(default = "default_linear_promote_above")]
    pub promote_above: f64,
    /// Score below which a key starts cooling down out of a tier
    #[serde(default = "default_linear_demote_below")]
    pub demote_below: f64,
}

impl Default for LinearModelConfig {
    fn default() -> Self {
        Self {
            bias: default_linear_bias(),
            frequency: default_linear_frequency(),
            recency: default_linear_recency(),
            size: default_linear_size(),
            latency: default_linear_latency(),
            pressure: default_linear_pressure(),
            promote_above: default_linear_promote_above(),
            demote_below: default_linear_demote_below(),
        }
    }
}

fn default_linear_bias() -> f64 {
    -2.0
}

fn default_linear_frequency() -> f64 {
    1.0
}

fn default_linear_recency() -> f64 {
    1.5
}

fn default_linear_size() -> f64 {
    -0.5
}

fn default_linear_latency() -> f64 {
    0.5
}

fn default_linear_pressure() -> f64 {
    -1.0
}

fn default_linear_promote_above() -> f64 {
    0.6
}

fn default_linear_demote_below() -> f64 {
    0.3
}

/// Shared cache daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_server_max_entries")]
    pub max_entries: u64,
    #[serde(default = "default_server_max_bytes")]
    pub max_bytes: u64,
    #[serde(default)]
    pub eviction: EvictionPolicy,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_entries: default_server_max_entries(),
            max_bytes: default_server_max_bytes(),
            eviction: EvictionPolicy::Lru,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl ServerConfig {
    /// Descriptor of the in-process tier the daemon serves
    pub fn descriptor(&self) -> TierDescriptor {
        TierDescriptor::new(TierId::L2)
            .with_capacity(Capacity::entries(self.max_entries).with_max_bytes(self.max_bytes))
            .with_eviction(self.eviction)
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1:7379".to_string()
}

fn default_server_max_entries() -> u64 {
    100_000
}

fn default_server_max_bytes() -> u64 {
    256 * 1024 * 1024
}

fn default_request_timeout_secs() -> u64 {
    5
}
