//! Configuration types

use crate::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// DEFAULTS
// ============================================================================

/// Normal TTL for cached values (30 minutes).
pub const DEFAULT_CACHE_TTL_MS: u64 = 30 * 60 * 1000;
/// TTL of the negative-cache sentinel (2 minutes).
pub const DEFAULT_NULL_TTL_MS: u64 = 2 * 60 * 1000;
/// Lease of the per-id rebuild lock (10 seconds).
pub const DEFAULT_REBUILD_LOCK_LEASE_MS: u64 = 10_000;
/// Wait between mutex-policy retries (50 milliseconds).
pub const DEFAULT_RETRY_INTERVAL_MS: u64 = 50;
pub const DEFAULT_MAX_LOCK_RETRIES: u32 = 100;
/// Lease of the per-user order lock on the synchronous path.
pub const DEFAULT_ORDER_LOCK_LEASE_MS: u64 = 30_000;
/// Attempts at the per-user lock when the stream fallback persists an order.
pub const DEFAULT_ORDER_LOCK_MAX_RETRIES: u32 = 3;
pub const DEFAULT_ORDER_LOCK_RETRY_INTERVAL_MS: u64 = 50;
/// 2023-08-03T00:00:00Z.
pub const DEFAULT_ID_ORIGIN_SECS: i64 = 1_691_020_800;
pub const DEFAULT_COUNTER_BITS: u32 = 32;
pub const DEFAULT_STREAM: &str = "stream.orders";
pub const DEFAULT_GROUP: &str = "g1";
pub const DEFAULT_LOCAL_BUFFER_CAPACITY: usize = 1024 * 1024;
/// Idle time after which another worker takes over a pending entry.
pub const DEFAULT_CLAIM_IDLE_MS: u64 = 60_000;

// ============================================================================
// SERDE HELPERS
// ============================================================================

/// Durations travel as integer milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn env_millis(name: &str) -> Option<Duration> {
    env_parse::<u64>(name).map(Duration::from_millis)
}

fn invalid(field: &str, value: impl fmt::Display, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

// ============================================================================
// SECTIONS
// ============================================================================

/// Cache-aside engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    #[serde(with = "duration_ms")]
    pub normal_ttl: Duration,
    /// TTL of the negative sentinel written for ids the loader cannot find.
    #[serde(with = "duration_ms")]
    pub null_ttl: Duration,
    #[serde(with = "duration_ms")]
    pub rebuild_lock_lease: Duration,
    #[serde(with = "duration_ms")]
    pub retry_interval: Duration,
    /// Cap on mutex-policy retries before `LockError::Timeout`.
    pub max_lock_retries: u32,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            normal_ttl: Duration::from_millis(DEFAULT_CACHE_TTL_MS),
            null_ttl: Duration::from_millis(DEFAULT_NULL_TTL_MS),
            rebuild_lock_lease: Duration::from_millis(DEFAULT_REBUILD_LOCK_LEASE_MS),
            retry_interval: Duration::from_millis(DEFAULT_RETRY_INTERVAL_MS),
            max_lock_retries: DEFAULT_MAX_LOCK_RETRIES,
        }
    }
}

/// Distributed lock settings for the synchronous order path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    #[serde(with = "duration_ms")]
    pub order_lock_lease: Duration,
    /// Attempts at the order lock before the stream fallback gives up.
    pub max_retries: u32,
    #[serde(with = "duration_ms")]
    pub retry_interval: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            order_lock_lease: Duration::from_millis(DEFAULT_ORDER_LOCK_LEASE_MS),
            max_retries: DEFAULT_ORDER_LOCK_MAX_RETRIES,
            retry_interval: Duration::from_millis(DEFAULT_ORDER_LOCK_RETRY_INTERVAL_MS),
        }
    }
}

/// Sequence generator layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequenceSettings {
    /// Custom epoch, seconds since the Unix epoch.
    pub origin_epoch_secs: i64,
    /// Low bits reserved for the per-day counter.
    pub counter_bits: u32,
    /// Namespace used for order ids.
    pub order_namespace: String,
}

impl Default for SequenceSettings {
    fn default() -> Self {
        Self {
            origin_epoch_secs: DEFAULT_ID_ORIGIN_SECS,
            counter_bits: DEFAULT_COUNTER_BITS,
            order_namespace: "order".to_string(),
        }
    }
}

/// How admitted orders reach persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// Consumer-group stream with a pending list. Survives crashes.
    #[default]
    DurableStream,
    /// In-process bounded buffer. Tasks are lost on crash and never redelivered.
    LocalBuffer,
    /// Per-user lock and an inline transactional write.
    Synchronous,
}

impl DispatchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchMode::DurableStream => "durable_stream",
            DispatchMode::LocalBuffer => "local_buffer",
            DispatchMode::Synchronous => "synchronous",
        }
    }

    pub fn is_durable(&self) -> bool {
        !matches!(self, DispatchMode::LocalBuffer)
    }
}

impl fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DispatchMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "durable_stream" | "stream" => Ok(DispatchMode::DurableStream),
            "local_buffer" | "buffer" => Ok(DispatchMode::LocalBuffer),
            "synchronous" | "sync" => Ok(DispatchMode::Synchronous),
            other => Err(invalid(
                "admission.dispatch",
                other,
                "expected durable_stream, local_buffer or synchronous",
            )),
        }
    }
}

/// Admission pipeline settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionSettings {
    pub dispatch: DispatchMode,
    pub stream: String,
    pub group: String,
    pub local_buffer_capacity: usize,
}

impl Default for AdmissionSettings {
    fn default() -> Self {
        Self {
            dispatch: DispatchMode::default(),
            stream: DEFAULT_STREAM.to_string(),
            group: DEFAULT_GROUP.to_string(),
            local_buffer_capacity: DEFAULT_LOCAL_BUFFER_CAPACITY,
        }
    }
}

/// Order worker pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub count: usize,
    /// Entries requested per stream read.
    pub read_count: usize,
    /// How long a read blocks waiting for new entries.
    #[serde(with = "duration_ms")]
    pub block: Duration,
    /// Entries requested per pending-list read during recovery.
    pub pending_batch: usize,
    /// Pause after a failed read or handle before trying again.
    #[serde(with = "duration_ms")]
    pub error_backoff: Duration,
    /// Pending entries idle this long in any consumer's list are claimed.
    /// Also the interval between claim sweeps.
    #[serde(with = "duration_ms")]
    pub claim_idle: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            count: 1,
            read_count: 1,
            block: Duration::from_secs(2),
            pending_batch: 16,
            error_backoff: Duration::from_millis(20),
            claim_idle: Duration::from_millis(DEFAULT_CLAIM_IDLE_MS),
        }
    }
}

// ============================================================================
// TOP-LEVEL CONFIG
// ============================================================================

/// Complete Rushline configuration.
///
/// Every section falls back to its defaults, so a TOML file only needs the
/// values it overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RushlineConfig {
    pub cache: CacheSettings,
    pub lock: LockSettings,
    pub sequence: SequenceSettings,
    pub admission: AdmissionSettings,
    pub worker: WorkerSettings,
}

impl RushlineConfig {
    /// Create a configuration from environment variables, falling back to
    /// defaults for anything unset or unparsable.
    ///
    /// # Environment Variables
    /// - `RUSHLINE_CACHE_TTL_MS`, `RUSHLINE_CACHE_NULL_TTL_MS`
    /// - `RUSHLINE_CACHE_LOCK_LEASE_MS`, `RUSHLINE_CACHE_RETRY_INTERVAL_MS`,
    ///   `RUSHLINE_CACHE_MAX_LOCK_RETRIES`
    /// - `RUSHLINE_ORDER_LOCK_LEASE_MS`, `RUSHLINE_ORDER_LOCK_MAX_RETRIES`,
    ///   `RUSHLINE_ORDER_LOCK_RETRY_INTERVAL_MS`
    /// - `RUSHLINE_ID_ORIGIN_SECS`, `RUSHLINE_ID_COUNTER_BITS`, `RUSHLINE_ID_NAMESPACE`
    /// - `RUSHLINE_DISPATCH` (`durable_stream` | `local_buffer` | `synchronous`)
    /// - `RUSHLINE_STREAM`, `RUSHLINE_STREAM_GROUP`, `RUSHLINE_LOCAL_BUFFER_CAPACITY`
    /// - `RUSHLINE_WORKERS`, `RUSHLINE_WORKER_READ_COUNT`, `RUSHLINE_WORKER_BLOCK_MS`,
    ///   `RUSHLINE_WORKER_PENDING_BATCH`, `RUSHLINE_WORKER_ERROR_BACKOFF_MS`,
    ///   `RUSHLINE_WORKER_CLAIM_IDLE_MS`
    pub fn from_env() -> Self {
        let d = Self::default();

        let cache = CacheSettings {
            normal_ttl: env_millis("RUSHLINE_CACHE_TTL_MS").unwrap_or(d.cache.normal_ttl),
            null_ttl: env_millis("RUSHLINE_CACHE_NULL_TTL_MS").unwrap_or(d.cache.null_ttl),
            rebuild_lock_lease: env_millis("RUSHLINE_CACHE_LOCK_LEASE_MS")
                .unwrap_or(d.cache.rebuild_lock_lease),
            retry_interval: env_millis("RUSHLINE_CACHE_RETRY_INTERVAL_MS")
                .unwrap_or(d.cache.retry_interval),
            max_lock_retries: env_parse("RUSHLINE_CACHE_MAX_LOCK_RETRIES")
                .unwrap_or(d.cache.max_lock_retries),
        };

        let lock = LockSettings {
            order_lock_lease: env_millis("RUSHLINE_ORDER_LOCK_LEASE_MS")
                .unwrap_or(d.lock.order_lock_lease),
            max_retries: env_parse("RUSHLINE_ORDER_LOCK_MAX_RETRIES")
                .unwrap_or(d.lock.max_retries),
            retry_interval: env_millis("RUSHLINE_ORDER_LOCK_RETRY_INTERVAL_MS")
                .unwrap_or(d.lock.retry_interval),
        };

        let sequence = SequenceSettings {
            origin_epoch_secs: env_parse("RUSHLINE_ID_ORIGIN_SECS")
                .unwrap_or(d.sequence.origin_epoch_secs),
            counter_bits: env_parse("RUSHLINE_ID_COUNTER_BITS").unwrap_or(d.sequence.counter_bits),
            order_namespace: std::env::var("RUSHLINE_ID_NAMESPACE")
                .unwrap_or(d.sequence.order_namespace),
        };

        let admission = AdmissionSettings {
            dispatch: env_parse("RUSHLINE_DISPATCH").unwrap_or(d.admission.dispatch),
            stream: std::env::var("RUSHLINE_STREAM").unwrap_or(d.admission.stream),
            group: std::env::var("RUSHLINE_STREAM_GROUP").unwrap_or(d.admission.group),
            local_buffer_capacity: env_parse("RUSHLINE_LOCAL_BUFFER_CAPACITY")
                .unwrap_or(d.admission.local_buffer_capacity),
        };

        let worker = WorkerSettings {
            count: env_parse("RUSHLINE_WORKERS").unwrap_or(d.worker.count),
            read_count: env_parse("RUSHLINE_WORKER_READ_COUNT").unwrap_or(d.worker.read_count),
            block: env_millis("RUSHLINE_WORKER_BLOCK_MS").unwrap_or(d.worker.block),
            pending_batch: env_parse("RUSHLINE_WORKER_PENDING_BATCH")
                .unwrap_or(d.worker.pending_batch),
            error_backoff: env_millis("RUSHLINE_WORKER_ERROR_BACKOFF_MS")
                .unwrap_or(d.worker.error_backoff),
            claim_idle: env_millis("RUSHLINE_WORKER_CLAIM_IDLE_MS")
                .unwrap_or(d.worker.claim_idle),
        };

        Self {
            cache,
            lock,
            sequence,
            admission,
            worker,
        }
    }

    /// Parse a TOML document. Missing sections and fields take their defaults.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        toml::from_str(source).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })
    }

    /// Configuration with short timings for tests and local development.
    pub fn development() -> Self {
        let mut config = Self::default();
        config.cache.retry_interval = Duration::from_millis(10);
        config.cache.rebuild_lock_lease = Duration::from_secs(2);
        config.lock.order_lock_lease = Duration::from_secs(5);
        config.lock.retry_interval = Duration::from_millis(10);
        config.worker.block = Duration::from_millis(100);
        config.worker.error_backoff = Duration::from_millis(5);
        config.worker.claim_idle = Duration::from_secs(5);
        config.admission.local_buffer_capacity = 1024;
        config
    }

    /// Validate the configuration.
    ///
    /// Rejects zero TTLs and leases, zero retry caps, a zero worker count,
    /// a counter width outside `1..=32` and empty stream or group names.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("cache.normal_ttl", self.cache.normal_ttl),
            ("cache.null_ttl", self.cache.null_ttl),
            ("cache.rebuild_lock_lease", self.cache.rebuild_lock_lease),
            ("lock.order_lock_lease", self.lock.order_lock_lease),
            ("worker.claim_idle", self.worker.claim_idle),
        ];
        for (field, value) in durations {
            if value.is_zero() {
                return Err(invalid(field, format!("{:?}", value), "must be positive"));
            }
        }

        if self.cache.max_lock_retries == 0 {
            return Err(invalid("cache.max_lock_retries", 0, "must be at least 1"));
        }

        if self.lock.max_retries == 0 {
            return Err(invalid("lock.max_retries", 0, "must be at least 1"));
        }

        if !(1..=32).contains(&self.sequence.counter_bits) {
            return Err(invalid(
                "sequence.counter_bits",
                self.sequence.counter_bits,
                "must be between 1 and 32",
            ));
        }

        if self.sequence.origin_epoch_secs < 0 {
            return Err(invalid(
                "sequence.origin_epoch_secs",
                self.sequence.origin_epoch_secs,
                "must be non-negative",
            ));
        }

        if self.sequence.order_namespace.trim().is_empty() {
            return Err(invalid("sequence.order_namespace", "", "must not be empty"));
        }

        if self.admission.stream.trim().is_empty() {
            return Err(invalid("admission.stream", "", "must not be empty"));
        }

        if self.admission.group.trim().is_empty() {
            return Err(invalid("admission.group", "", "must not be empty"));
        }

        if self.admission.local_buffer_capacity == 0 {
            return Err(invalid("admission.local_buffer_capacity", 0, "must be positive"));
        }

        if self.worker.count == 0 {
            return Err(invalid("worker.count", 0, "must be positive"));
        }

        if self.worker.read_count == 0 || self.worker.pending_batch == 0 {
            return Err(invalid(
                "worker.read_count",
                self.worker.read_count.min(self.worker.pending_batch),
                "batch sizes must be positive",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_constants() {
        let config = RushlineConfig::default();
        assert_eq!(config.cache.normal_ttl, Duration::from_secs(30 * 60));
        assert_eq!(config.cache.null_ttl, Duration::from_secs(2 * 60));
        assert_eq!(config.cache.rebuild_lock_lease, Duration::from_secs(10));
        assert_eq!(config.cache.retry_interval, Duration::from_millis(50));
        assert_eq!(config.sequence.origin_epoch_secs, 1_691_020_800);
        assert_eq!(config.sequence.counter_bits, 32);
        assert_eq!(config.admission.stream, "stream.orders");
        assert_eq!(config.admission.group, "g1");
        assert_eq!(config.admission.dispatch, DispatchMode::DurableStream);
        assert!(config.validate().is_ok());
        assert!(RushlineConfig::development().validate().is_ok());
    }

    #[test]
    fn test_from_toml_partial_override() {
        let config = RushlineConfig::from_toml_str(
            r#"
            [cache]
            null_ttl = 5000

            [admission]
            dispatch = "local_buffer"

            [worker]
            count = 4
            "#,
        )
        .unwrap();

        assert_eq!(config.cache.null_ttl, Duration::from_millis(5000));
        assert_eq!(config.cache.normal_ttl, Duration::from_secs(30 * 60));
        assert_eq!(config.admission.dispatch, DispatchMode::LocalBuffer);
        assert_eq!(config.admission.stream, "stream.orders");
        assert_eq!(config.worker.count, 4);
    }

    #[test]
    fn test_from_toml_rejects_garbage() {
        let err = RushlineConfig::from_toml_str("[cache\nnull_ttl = ").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_toml_round_trip_keeps_millis() {
        let config = RushlineConfig::development();
        let text = toml::to_string(&config).unwrap();
        assert!(text.contains("retry_interval = 10"));
        assert_eq!(RushlineConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = RushlineConfig::default();
        config.worker.count = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "worker.count"
        ));

        let mut config = RushlineConfig::default();
        config.sequence.counter_bits = 40;
        assert!(config.validate().is_err());

        let mut config = RushlineConfig::default();
        config.cache.null_ttl = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = RushlineConfig::default();
        config.cache.max_lock_retries = 0;
        assert!(config.validate().is_err());

        let mut config = RushlineConfig::default();
        config.worker.claim_idle = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = RushlineConfig::default();
        config.lock.max_retries = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "lock.max_retries"
        ));

        let mut config = RushlineConfig::default();
        config.admission.group = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_dispatch_mode_parse() {
        assert_eq!("sync".parse::<DispatchMode>().unwrap(), DispatchMode::Synchronous);
        assert_eq!(
            "Durable_Stream".parse::<DispatchMode>().unwrap(),
            DispatchMode::DurableStream
        );
        assert!("kafka".parse::<DispatchMode>().is_err());
        assert!(!DispatchMode::LocalBuffer.is_durable());
    }

    #[test]
    fn test_from_env_reads_overrides() {
        std::env::set_var("RUSHLINE_WORKER_PENDING_BATCH", "7");
        std::env::set_var("RUSHLINE_ID_COUNTER_BITS", "not-a-number");
        let config = RushlineConfig::from_env();
        std::env::remove_var("RUSHLINE_WORKER_PENDING_BATCH");
        std::env::remove_var("RUSHLINE_ID_COUNTER_BITS");

        assert_eq!(config.worker.pending_batch, 7);
        assert_eq!(config.sequence.counter_bits, DEFAULT_COUNTER_BITS);
    }
}
