use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Cache line size used to align pool items.
pub const CACHE_LINE: usize = 64;

/// Tunables for the ring, the slab pool and the flusher.
///
/// Every field has a default, so an empty YAML document is a valid config.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmitterConfig {
    /// Number of ring slots. Must be a power of two. Default: 4096.
    pub ring_capacity: usize,

    /// Largest encoded event record in bytes. Default: 4096.
    pub max_record_size: usize,

    /// Most records handed to the sink in one write. Default: 64.
    pub max_batch: usize,

    /// How long the flusher parks between drain cycles. Default: 100us.
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Pool items allocated up front. Default: 1024.
    pub pool_initial_items: usize,

    /// Hard ceiling on pool items before the heap fallback kicks in. Default: 8192.
    pub pool_max_items: usize,

    /// Items added per growth step. Default: 256.
    pub slab_items: usize,

    /// Use the general allocator when the pool is at its ceiling. Default: true.
    pub pool_fallback: bool,

    /// Deadline handed to each sink write. Default: 2s.
    #[serde(with = "humantime_serde")]
    pub sink_timeout: Duration,

    /// Retries after a failed sink write before the batch is dropped. Default: 3.
    pub sink_retry_limit: u32,

    /// First retry delay; doubles per attempt. Default: 1ms.
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,

    /// Cap on the retry delay. Default: 100ms.
    #[serde(with = "humantime_serde")]
    pub retry_backoff_max: Duration,

    /// Time allowed for the final drain on shutdown. Default: 5s.
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 4096,
            max_record_size: 4096,
            max_batch: 64,
            flush_interval: Duration::from_micros(100),
            pool_initial_items: 1024,
            pool_max_items: 8192,
            slab_items: 256,
            pool_fallback: true,
            sink_timeout: Duration::from_secs(2),
            sink_retry_limit: 3,
            retry_backoff: Duration::from_millis(1),
            retry_backoff_max: Duration::from_millis(100),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl EmitterConfig {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        let cfg = Self::from_yaml(&data).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    fn from_yaml(data: &str) -> Result<Self, serde_yaml::Error> {
        if data.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(data)
    }

    /// Size of one pool item: the record maximum rounded up to whole cache lines.
    pub fn item_size(&self) -> usize {
        (self.max_record_size + CACHE_LINE - 1) & !(CACHE_LINE - 1)
    }

    /// Check ranges and cross-field consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ring_capacity == 0 || !self.ring_capacity.is_power_of_two() {
            return Err(ConfigError::RingCapacity(self.ring_capacity));
        }

        let non_zero = [
            ("max_record_size", self.max_record_size),
            ("max_batch", self.max_batch),
            ("pool_max_items", self.pool_max_items),
            ("slab_items", self.slab_items),
        ];
        for (field, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }
        if self.flush_interval.is_zero() {
            return Err(ConfigError::Zero {
                field: "flush_interval",
            });
        }
        if self.sink_timeout.is_zero() {
            return Err(ConfigError::Zero {
                field: "sink_timeout",
            });
        }

        if self.max_batch > self.ring_capacity {
            return Err(ConfigError::BatchExceedsRing {
                max_batch: self.max_batch,
                ring_capacity: self.ring_capacity,
            });
        }

        // Records carry a u32 length prefix and pool indices are u32.
        if self.max_record_size > u32::MAX as usize {
            return Err(ConfigError::RecordExceedsItem {
                record: self.max_record_size,
                item: u32::MAX as usize,
            });
        }

        if self.pool_initial_items > self.pool_max_items {
            return Err(ConfigError::PoolBounds {
                initial: self.pool_initial_items,
                max: self.pool_max_items,
            });
        }

        if self.shutdown_grace >= Duration::from_secs(10) {
            return Err(ConfigError::GraceTooLong(self.shutdown_grace));
        }

        Ok(())
    }
}
