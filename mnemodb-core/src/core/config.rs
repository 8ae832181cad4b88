/// Store configuration.
///
/// Every tunable of the store lives here with its default. `from_env`
/// overlays `MNEMODB_*` variables on top of the defaults.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use crate::core::errors::{MnemoError, Result};

/// Clustering triggers and k-means bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Inserts since the last pass that make a pass due
    pub pending_threshold: usize,
    /// Wall-clock interval after which a pass is due (ms)
    pub interval_ms: u64,
    /// pending / total ratio that makes a pass due
    pub pending_ratio: f64,
    /// Lower bound for k on a full recluster
    pub min_clusters: usize,
    /// Upper bound for k on a full recluster
    pub max_clusters: usize,
    /// Lloyd iteration cap
    pub max_iterations: usize,
    /// Labels kept in `ClusterMetadata::dominant_labels`
    pub dominant_labels: usize,
    /// Seed for k-means++ sampling
    pub seed: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            pending_threshold: 100,
            interval_ms: 5 * 60 * 1000,
            pending_ratio: 0.1,
            min_clusters: 2,
            max_clusters: 64,
            max_iterations: 50,
            dominant_labels: 5,
            seed: 42,
        }
    }
}

impl ClusterConfig {
    /// k for a full recluster of `total_live` vectors.
    pub fn target_k(&self, total_live: usize) -> usize {
        let raw = ((total_live as f64) / 2.0).sqrt().floor() as usize;
        raw.clamp(self.min_clusters, self.max_clusters)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionConfig {
    pub max_partition_size: usize,
    pub min_partition_size: usize,
    /// Cosine similarity a centroid must exceed to route/assign
    pub similarity_threshold: f32,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        PartitionConfig {
            max_partition_size: 1000,
            min_partition_size: 100,
            similarity_threshold: 0.7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Byte budget of the query result cache
    pub query_budget_bytes: usize,
    /// Byte budget of the hot record cache
    pub record_budget_bytes: usize,
    pub ttl_ms: u64,
    /// Background TTL sweep period (ms)
    pub sweep_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            query_budget_bytes: 64 * 1024 * 1024,
            record_budget_bytes: 16 * 1024 * 1024,
            ttl_ms: 5 * 60 * 1000,
            sweep_interval_ms: 60 * 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecayConfig {
    /// Strength floor; records reaching it are archived
    pub min_strength: f32,
    /// Dampening per access: exp(-access_count * access_boost)
    pub access_boost: f32,
    pub importance_multiplier: f32,
}

impl Default for DecayConfig {
    fn default() -> Self {
        DecayConfig {
            min_strength: 0.1,
            access_boost: 0.1,
            importance_multiplier: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidationConfig {
    pub enabled: bool,
    /// Weighted similarity above which two records are merged
    pub similarity_threshold: f32,
    pub vector_weight: f32,
    pub label_weight: f32,
    pub relevance_weight: f32,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        ConsolidationConfig {
            enabled: true,
            similarity_threshold: 0.92,
            vector_weight: 0.7,
            label_weight: 0.2,
            relevance_weight: 0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    pub enabled: bool,
    /// Period of a full maintenance cycle (ms)
    pub interval_ms: u64,
    /// How often the scheduler wakes up to check (ms)
    pub check_interval_ms: u64,
    /// Defer non-urgent cycles while CPU load is above this
    pub max_cpu_load: f32,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        MaintenanceConfig {
            enabled: true,
            interval_ms: 60 * 60 * 1000,
            check_interval_ms: 60 * 1000,
            max_cpu_load: 0.85,
        }
    }
}

/// Parameters of the bundled HNSW index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
    pub seed: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        IndexConfig {
            m: 16,
            ef_construction: 100,
            ef_search: 50,
            seed: 42,
        }
    }
}

/// Values filled in when an inserted record leaves them unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordDefaults {
    pub decay_rate: f32,
    pub importance: f32,
    pub strength: f32,
}

impl Default for RecordDefaults {
    fn default() -> Self {
        RecordDefaults {
            decay_rate: 0.1,
            importance: 0.5,
            strength: 1.0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryConfig {
    pub cluster: ClusterConfig,
    pub partition: PartitionConfig,
    pub cache: CacheConfig,
    pub decay: DecayConfig,
    pub consolidation: ConsolidationConfig,
    pub maintenance: MaintenanceConfig,
    pub index: IndexConfig,
    pub defaults: RecordDefaults,
}

fn env_override<T: FromStr>(name: &str, target: &mut T) {
    if let Ok(raw) = std::env::var(name) {
        match raw.parse() {
            Ok(value) => *target = value,
            Err(_) => tracing::warn!(var = name, value = %raw, "Ignoring unparsable env override"),
        }
    }
}

impl MemoryConfig {
    /// Load from environment variables.
    pub fn from_env() -> Self {
        let mut config = MemoryConfig::default();

        env_override("MNEMODB_CLUSTER_PENDING_THRESHOLD", &mut config.cluster.pending_threshold);
        env_override("MNEMODB_CLUSTER_INTERVAL_MS", &mut config.cluster.interval_ms);
        env_override("MNEMODB_CLUSTER_PENDING_RATIO", &mut config.cluster.pending_ratio);
        env_override("MNEMODB_MIN_CLUSTERS", &mut config.cluster.min_clusters);
        env_override("MNEMODB_MAX_CLUSTERS", &mut config.cluster.max_clusters);

        env_override("MNEMODB_MAX_PARTITION_SIZE", &mut config.partition.max_partition_size);
        env_override("MNEMODB_MIN_PARTITION_SIZE", &mut config.partition.min_partition_size);
        env_override("MNEMODB_PARTITION_SIMILARITY", &mut config.partition.similarity_threshold);

        env_override("MNEMODB_QUERY_CACHE_BYTES", &mut config.cache.query_budget_bytes);
        env_override("MNEMODB_RECORD_CACHE_BYTES", &mut config.cache.record_budget_bytes);
        env_override("MNEMODB_CACHE_TTL_MS", &mut config.cache.ttl_ms);
        env_override("MNEMODB_CACHE_SWEEP_MS", &mut config.cache.sweep_interval_ms);

        env_override("MNEMODB_MIN_STRENGTH", &mut config.decay.min_strength);
        env_override("MNEMODB_ACCESS_BOOST", &mut config.decay.access_boost);
        env_override("MNEMODB_IMPORTANCE_MULTIPLIER", &mut config.decay.importance_multiplier);

        env_override("MNEMODB_CONSOLIDATION_ENABLED", &mut config.consolidation.enabled);
        env_override("MNEMODB_CONSOLIDATION_THRESHOLD", &mut config.consolidation.similarity_threshold);

        env_override("MNEMODB_MAINTENANCE_ENABLED", &mut config.maintenance.enabled);
        env_override("MNEMODB_MAINTENANCE_INTERVAL_MS", &mut config.maintenance.interval_ms);
        env_override("MNEMODB_MAINTENANCE_CHECK_MS", &mut config.maintenance.check_interval_ms);

        env_override("MNEMODB_HNSW_M", &mut config.index.m);
        env_override("MNEMODB_HNSW_EF_CONSTRUCTION", &mut config.index.ef_construction);
        env_override("MNEMODB_HNSW_EF_SEARCH", &mut config.index.ef_search);

        config
    }

    /// Reject settings the engines cannot honor.
    pub fn validate(&self) -> Result<()> {
        let fail = |message: &str| Err(MnemoError::ConfigError { message: message.to_string() });

        if self.cluster.min_clusters == 0 || self.cluster.min_clusters > self.cluster.max_clusters {
            return fail("min_clusters must be in 1..=max_clusters");
        }
        if self.cluster.max_iterations == 0 {
            return fail("max_iterations must be positive");
        }
        if self.partition.min_partition_size > self.partition.max_partition_size
            || self.partition.max_partition_size < 2
        {
            return fail("partition sizes must satisfy 2 <= max and min <= max");
        }
        if !(0.0..=1.0).contains(&self.decay.min_strength) {
            return fail("min_strength must be within [0, 1]");
        }
        let weights = &self.consolidation;
        if weights.vector_weight < 0.0 || weights.label_weight < 0.0 || weights.relevance_weight < 0.0 {
            return fail("consolidation weights must be non-negative");
        }
        if weights.vector_weight + weights.label_weight <= 0.0 {
            return fail("vector_weight + label_weight must be positive");
        }
        if self.index.m == 0 {
            return fail("HNSW m must be positive");
        }
        Ok(())
    }
}
