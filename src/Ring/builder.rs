use super::consumer::Flusher;
use super::{EventEmitter, FlusherHandle};
use crate::config::EmitterConfig;
use crate::error::EmitError;
use crate::metrics::EmitterCounters;
use crate::sink::Sink;
use crate::Core::slab::SlabPool;
use crate::Ring::Buffer::RingBuffer;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Wires counters, slab pool, ring and flusher together.
#[derive(Debug, Clone, Default)]
pub struct EmitterBuilder {
    config: EmitterConfig,
}

impl EmitterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config_file(path: &Path) -> Result<Self, EmitError> {
        Ok(Self::default().with_config(EmitterConfig::load(path)?))
    }

    pub fn with_config(mut self, config: EmitterConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_ring_capacity(mut self, capacity: usize) -> Self {
        self.config.ring_capacity = capacity;
        self
    }

    pub fn with_max_record_size(mut self, size: usize) -> Self {
        self.config.max_record_size = size;
        self
    }

    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.config.max_batch = max_batch;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.config.flush_interval = interval;
        self
    }

    /// Items pre-allocated at build time and the ceiling before fallback.
    pub fn with_pool_items(mut self, initial: usize, max: usize) -> Self {
        self.config.pool_initial_items = initial;
        self.config.pool_max_items = max;
        self
    }

    pub fn with_slab_items(mut self, items: usize) -> Self {
        self.config.slab_items = items;
        self
    }

    pub fn with_pool_fallback(mut self, enabled: bool) -> Self {
        self.config.pool_fallback = enabled;
        self
    }

    pub fn with_sink_timeout(mut self, timeout: Duration) -> Self {
        self.config.sink_timeout = timeout;
        self
    }

    /// Retry budget per batch and the backoff range between attempts.
    pub fn with_retry(mut self, limit: u32, backoff: Duration, backoff_max: Duration) -> Self {
        self.config.sink_retry_limit = limit;
        self.config.retry_backoff = backoff;
        self.config.retry_backoff_max = backoff_max;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.config.shutdown_grace = grace;
        self
    }

    pub fn config(&self) -> &EmitterConfig {
        &self.config
    }

    /// Validate the config, allocate the ring and pool, and start the
    /// flusher writing into `sink`.
    pub fn build<S: Sink + 'static>(self, sink: S) -> Result<(EventEmitter, FlusherHandle), EmitError> {
        let cfg = self.config;
        cfg.validate()?;

        let counters = Arc::new(EmitterCounters::new());
        let pool = Arc::new(SlabPool::new(
            cfg.item_size(),
            cfg.pool_initial_items,
            cfg.slab_items,
            cfg.pool_max_items,
            cfg.pool_fallback,
            counters.clone(),
        ));
        let ring = Arc::new(RingBuffer::new(cfg.ring_capacity, pool, counters.clone())?);
        let reader = ring.reader()?;
        debug!(
            ring_capacity = cfg.ring_capacity,
            item_size = cfg.item_size(),
            "emitter built"
        );

        let emitter = EventEmitter::new(ring, counters.clone(), cfg.max_record_size, cfg.max_batch);
        let handle = Flusher::new(reader, sink, counters, &cfg).spawn()?;
        Ok((emitter, handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;
    use crate::sink::MemorySink;

    #[test]
    fn test_build_rejects_invalid_config() {
        let err = EmitterBuilder::new()
            .with_ring_capacity(1000)
            .build(MemorySink::new())
            .err()
            .unwrap();
        assert!(matches!(err, EmitError::Config(ConfigError::RingCapacity(1000))));
    }

    #[test]
    fn test_build_and_shutdown_idle() {
        let (emitter, handle) = EmitterBuilder::new()
            .with_ring_capacity(64)
            .with_max_batch(8)
            .with_pool_items(16, 64)
            .build(MemorySink::new())
            .unwrap();
        assert!(!emitter.is_closed());
        let report = handle.shutdown().unwrap();
        assert_eq!(report, Default::default());
        assert!(emitter.is_closed());
    }
}
