//! Pipeline configuration

use replay_cache::CacheConfig;

/// Tunables for the capture pipeline
#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    /// Bound on sequences admitted but not yet emitted; beyond it new
    /// captures are rejected with backpressure
    pub max_pending_sequences: usize,
    /// Resource cache tunables
    pub cache: CacheConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_pending_sequences: 16,
            cache: CacheConfig::default(),
        }
    }
}
