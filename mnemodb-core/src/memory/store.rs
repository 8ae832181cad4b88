/// MemoryStore: category-scoped memory engine
///
/// Responsibilities:
/// 1. Route writes: partition placement, index insert, incremental cluster
///    assignment, clustering trigger
/// 2. Route reads: result cache, relevant partitions, scoped index search
/// 3. Explicit cluster edits (merge, split, recluster)
/// 4. Maintenance: decay, consolidation, rebalance, cache optimization
/// 5. Save/load of every category
///
/// `MemoryStore` is a cheap handle; clones share the same state.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use parking_lot::RwLock;
use tracing::{debug, info, warn};
use crate::cache::{CacheSweeper, ResultCache, Sweepable};
use crate::clustering::{ClusterEngine, ClusterId, ClusterMetadata};
use crate::collaborators::{
    EmbeddingService, InlineExecutor, RelevanceService, TaskExecutor, TaskJob, TaskPriority, TaskType,
};
use crate::core::config::MemoryConfig;
use crate::core::errors::{Collaborator, MnemoError, Result};
use crate::core::utils::current_timestamp_ms;
use crate::index::{HnswIndex, SlotId, TombstoneReason, VectorIndex};
use crate::maintenance::{consolidation, decay, CategoryMaintenance, MaintenanceReport};
use crate::memory::cache_key::CacheKey;
use crate::memory::category::{ActivityGuard, CategoryActivity, CategoryState};
use crate::memory::record::{ArchivedRecord, MemoryRecord, NewMemory, QueryHit, SlotMetadata};
use crate::observability::{CategoryStats, StoreStats};
use crate::partition::{Partition, PartitionId, PartitionManager};
use crate::storage::persistence::{self, CategorySection, MetadataDocument, METADATA_FILE};

/// Kind of clustering pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassKind {
    /// k-means++ over every live record
    Full,
    /// Centroid refresh of clusters that received members
    Incremental,
}

impl fmt::Display for PassKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PassKind::Full => write!(f, "full"),
            PassKind::Incremental => write!(f, "incremental"),
        }
    }
}

pub(crate) struct StoreInner {
    pub config: MemoryConfig,
    pub categories: RwLock<HashMap<String, Arc<CategoryState>>>,
    pub clusters: ClusterEngine,
    pub partitions: PartitionManager,
    pub query_cache: Arc<ResultCache<CacheKey, Vec<QueryHit>>>,
    pub record_cache: Arc<ResultCache<CacheKey, MemoryRecord>>,
    pub embedding: Option<Arc<dyn EmbeddingService>>,
    pub relevance: Option<Arc<dyn RelevanceService>>,
    pub executor: Arc<dyn TaskExecutor>,
    pub maintenance_running: AtomicBool,
}

/// Clears a flag on drop.
struct RunningFlag<'a>(&'a AtomicBool);

impl Drop for RunningFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct MemoryStoreBuilder {
    config: MemoryConfig,
    embedding: Option<Arc<dyn EmbeddingService>>,
    relevance: Option<Arc<dyn RelevanceService>>,
    executor: Option<Arc<dyn TaskExecutor>>,
}

impl MemoryStoreBuilder {
    pub fn embedding(mut self, service: Arc<dyn EmbeddingService>) -> Self {
        self.embedding = Some(service);
        self
    }

    pub fn relevance(mut self, service: Arc<dyn RelevanceService>) -> Self {
        self.relevance = Some(service);
        self
    }

    /// Backend for clustering passes. Defaults to `InlineExecutor`.
    pub fn executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn build(self) -> Result<MemoryStore> {
        self.config.validate()?;
        let config = self.config;

        let inner = StoreInner {
            clusters: ClusterEngine::new(config.cluster.clone()),
            partitions: PartitionManager::new(config.partition.clone(), config.cluster.seed),
            query_cache: Arc::new(ResultCache::new(config.cache.query_budget_bytes, config.cache.ttl_ms)),
            record_cache: Arc::new(ResultCache::new(config.cache.record_budget_bytes, config.cache.ttl_ms)),
            categories: RwLock::new(HashMap::new()),
            embedding: self.embedding,
            relevance: self.relevance,
            executor: self.executor.unwrap_or_else(|| Arc::new(InlineExecutor)),
            maintenance_running: AtomicBool::new(false),
            config,
        };
        Ok(MemoryStore { inner: Arc::new(inner) })
    }
}

#[derive(Clone)]
pub struct MemoryStore {
    pub(crate) inner: Arc<StoreInner>,
}

impl MemoryStore {
    pub fn new(config: MemoryConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: MemoryConfig) -> MemoryStoreBuilder {
        MemoryStoreBuilder {
            config,
            embedding: None,
            relevance: None,
            executor: None,
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.inner.config
    }

    // ========================================================================
    // Categories
    // ========================================================================

    /// Create a category backed by the bundled HNSW index.
    pub fn create_category(&self, name: &str, dimension: usize) -> Result<()> {
        if dimension == 0 {
            return Err(MnemoError::ConfigError {
                message: format!("category {} needs a positive dimension", name),
            });
        }
        let index = HnswIndex::new(dimension, self.inner.config.index.clone());
        self.register_category(name, Box::new(index))
    }

    /// Register a category over a caller-supplied, empty index.
    pub fn register_category(&self, name: &str, index: Box<dyn VectorIndex>) -> Result<()> {
        if index.count() != 0 {
            return Err(MnemoError::ConfigError {
                message: format!("index for category {} must be empty", name),
            });
        }
        let mut categories = self.inner.categories.write();
        if categories.contains_key(name) {
            return Err(MnemoError::CategoryExists(name.to_string()));
        }
        let dimension = index.dimension();
        categories.insert(
            name.to_string(),
            Arc::new(CategoryState::new(name, index, current_timestamp_ms())),
        );
        info!(category = name, dimension, "Category registered");
        Ok(())
    }

    pub fn categories(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.categories.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn category(&self, name: &str) -> Result<Arc<CategoryState>> {
        self.inner
            .categories
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| MnemoError::UnknownCategory(name.to_string()))
    }

    fn category_states(&self) -> Vec<Arc<CategoryState>> {
        let mut states: Vec<Arc<CategoryState>> = self.inner.categories.read().values().cloned().collect();
        states.sort_by(|a, b| a.name.cmp(&b.name));
        states
    }

    // ========================================================================
    // Writes
    // ========================================================================

    pub fn insert(&self, memory: NewMemory) -> Result<SlotId> {
        let state = self.category(&memory.category)?;
        if memory.vector.len() != state.dimension {
            return Err(MnemoError::VectorDimensionMismatch {
                expected: state.dimension,
                got: memory.vector.len(),
            });
        }

        let importance_unset = memory.importance.is_none();
        let mut record = memory.into_record(&self.inner.config.defaults);
        self.enrich(&mut record, importance_unset);
        let memory_id = record.id.clone();
        let now = current_timestamp_ms();

        let (slot, partition, cluster) = {
            let _writer = state.writer.lock();
            if state.records.read().slot_of.contains_key(&record.id) {
                return Err(MnemoError::DuplicateMemoryId(record.id));
            }

            let slot = state.index.write().insert(&record.vector)?;
            state.slots.write().insert(slot, SlotMetadata {
                memory_id: memory_id.clone(),
                category: state.name.clone(),
                inserted_at: now,
            });

            let (partitions, partition) =
                self.inner.partitions.assign_slot(&state.partition_snapshot(), &state.name, slot, &record.vector, now);
            let (clusters, cluster) = self.inner.clusters.assign_incremental(&state.cluster_snapshot(), slot, &record);

            state.records.write().insert(slot, record);
            state.publish_partitions(partitions);
            state.publish_clusters(clusters);
            state.bump_generation();

            let mut pending = state.pending.lock();
            pending.inserts += 1;
            pending.touched.insert(cluster);
            (slot, partition, cluster)
        };

        debug!(category = %state.name, memory_id = %memory_id, slot, partition, cluster, "Inserted memory");

        if let Err(e) = self.trigger_clustering_if_due(&state.name) {
            warn!(category = %state.name, error = %e, "Clustering trigger failed");
        }
        Ok(slot)
    }

    /// Embed `content` and insert it as a new memory.
    pub fn insert_text(&self, category: &str, content: &str) -> Result<SlotId> {
        self.category(category)?;
        let vector = self.embed(content)?;
        self.insert(NewMemory::new(category, vector).with_content(content))
    }

    /// Archive a live memory on request.
    pub fn remove(&self, category: &str, memory_id: &str) -> Result<()> {
        let state = self.category(category)?;
        let _writer = state.writer.lock();
        let slot = state
            .records
            .read()
            .slot_of
            .get(memory_id)
            .copied()
            .ok_or_else(|| MnemoError::NotFound(format!("memory {} in {}", memory_id, category)))?;
        self.archive_slots(&state, &[slot], TombstoneReason::Removed, current_timestamp_ms())?;
        Ok(())
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let service = self
            .inner
            .embedding
            .as_ref()
            .ok_or_else(|| MnemoError::collaborator(Collaborator::Embedding, "no embedding service configured"))?;
        service.embed(text).map_err(|e| match e {
            MnemoError::CollaboratorUnavailable { .. } => e,
            other => MnemoError::collaborator(Collaborator::Embedding, other),
        })
    }

    /// Fill importance and labels from the relevance service. Failures
    /// leave the record as it is.
    fn enrich(&self, record: &mut MemoryRecord, importance_unset: bool) {
        let Some(relevance) = &self.inner.relevance else { return };

        if importance_unset {
            match relevance.predict_relevance(record) {
                Ok(score) => record.importance = score.clamp(0.0, 1.0),
                Err(e) => warn!(memory_id = %record.id, error = %e, "Relevance prediction failed, keeping default importance"),
            }
        }
        match relevance.generate_tags(record) {
            Ok(tags) => record.labels.extend(tags),
            Err(e) => warn!(memory_id = %record.id, error = %e, "Tag generation failed"),
        }
        match relevance.analyze_context(record) {
            Ok(labels) => record.labels.extend(labels),
            Err(e) => warn!(memory_id = %record.id, error = %e, "Context analysis failed"),
        }
    }

    /// Move live slots to the archive: tombstone in the index, drop from
    /// cluster and partition tables. Callers hold the category's writer.
    fn archive_slots(
        &self,
        state: &CategoryState,
        slots: &[SlotId],
        reason: TombstoneReason,
        now: u64,
    ) -> Result<usize> {
        let mut records = state.records.write();
        let live: Vec<SlotId> = slots.iter().copied().filter(|s| records.by_slot.contains_key(s)).collect();
        if live.is_empty() {
            return Ok(0);
        }

        {
            let mut index = state.index.write();
            for &slot in &live {
                index.tombstone(slot, reason)?;
            }
        }
        {
            let mut archive = state.archive.write();
            for &slot in &live {
                if let Some(record) = records.remove(slot) {
                    archive.insert(record.id.clone(), ArchivedRecord {
                        slot,
                        record,
                        reason,
                        archived_at: now,
                    });
                }
            }
        }

        let clusters = self.inner.clusters.remove_slots(&state.cluster_snapshot(), &live, &records.by_slot);
        let partitions = self.inner.partitions.remove_slots(&state.partition_snapshot(), &live, &records.by_slot, now);
        drop(records);

        state.publish_clusters(clusters);
        state.publish_partitions(partitions);
        state.bump_generation();
        debug!(category = %state.name, archived = live.len(), ?reason, "Archived slots");
        Ok(live.len())
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Up to `k` memories with similarity >= `threshold`, most similar
    /// first. An empty category yields an empty list.
    pub fn query_similar(&self, category: &str, query: &[f32], k: usize, threshold: f32) -> Result<Vec<QueryHit>> {
        let state = self.category(category)?;
        if query.len() != state.dimension {
            return Err(MnemoError::VectorDimensionMismatch {
                expected: state.dimension,
                got: query.len(),
            });
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let key = CacheKey::query(&state.name, state.generation(), query, k, threshold);
        if let Some(hits) = self.inner.query_cache.get(&key) {
            self.track_access(&state, &hits);
            return Ok(hits);
        }

        let hits = self.search_partitions(&state, query, k, threshold)?;
        if !self.inner.query_cache.set(key, hits.clone()) {
            debug!(category, k, "Query result too large to cache");
        }
        self.track_access(&state, &hits);
        Ok(hits)
    }

    pub fn query_text(&self, category: &str, text: &str, k: usize, threshold: f32) -> Result<Vec<QueryHit>> {
        self.category(category)?;
        let vector = self.embed(text)?;
        self.query_similar(category, &vector, k, threshold)
    }

    fn search_partitions(
        &self,
        state: &CategoryState,
        query: &[f32],
        k: usize,
        threshold: f32,
    ) -> Result<Vec<QueryHit>> {
        let partitions = state.partition_snapshot();
        let relevant = self.inner.partitions.relevant_partitions(&partitions, query);

        let mut best: HashMap<String, f32> = HashMap::new();
        {
            let index = state.index.read();
            let slots = state.slots.read();
            for id in &relevant {
                let Some(partition) = partitions.get(*id) else { continue };
                let allowed: HashSet<SlotId> = partition.members.iter().copied().collect();
                for hit in index.search_within(query, k, &allowed)? {
                    let Some(meta) = slots.get(&hit.slot) else { continue };
                    let similarity = hit.similarity();
                    best.entry(meta.memory_id.clone())
                        .and_modify(|s| *s = s.max(similarity))
                        .or_insert(similarity);
                }
            }
        }

        let mut hits: Vec<QueryHit> = best
            .into_iter()
            .filter(|(_, similarity)| *similarity >= threshold)
            .map(|(memory_id, similarity)| QueryHit { memory_id, similarity })
            .collect();
        hits.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| a.memory_id.cmp(&b.memory_id))
        });
        hits.truncate(k);

        debug!(category = %state.name, partitions = relevant.len(), hits = hits.len(), "Similarity query");
        Ok(hits)
    }

    fn track_access(&self, state: &CategoryState, hits: &[QueryHit]) {
        if hits.is_empty() {
            return;
        }
        let now = current_timestamp_ms();
        let mut records = state.records.write();
        for hit in hits {
            records.touch(&hit.memory_id, now);
        }
    }

    /// Fetch a live record, counting the access. Served from the hot record
    /// cache when possible; a cached copy reflects the record as of the
    /// last write to the category.
    pub fn get_record(&self, category: &str, memory_id: &str) -> Result<MemoryRecord> {
        let state = self.category(category)?;
        let now = current_timestamp_ms();
        let key = CacheKey::record(&state.name, state.generation(), memory_id);

        if let Some(record) = self.inner.record_cache.get(&key) {
            state.records.write().touch(memory_id, now);
            return Ok(record);
        }

        let record = {
            let mut records = state.records.write();
            let record = records
                .get_mut_by_id(memory_id)
                .ok_or_else(|| MnemoError::NotFound(format!("memory {} in {}", memory_id, category)))?;
            record.touch(now);
            record.clone()
        };
        self.inner.record_cache.set(key, record.clone());
        Ok(record)
    }

    /// Number of reference hops to the farthest live record reachable
    /// from `memory_id`. Cycles are walked once.
    pub fn reference_depth(&self, category: &str, memory_id: &str) -> Result<usize> {
        let state = self.category(category)?;
        let records = state.records.read();
        if records.get_by_id(memory_id).is_none() {
            return Err(MnemoError::NotFound(format!("memory {} in {}", memory_id, category)));
        }

        let mut visited: HashSet<&str> = HashSet::from([memory_id]);
        let mut queue: VecDeque<(&str, usize)> = VecDeque::from([(memory_id, 0)]);
        let mut depth = 0;
        while let Some((id, level)) = queue.pop_front() {
            depth = depth.max(level);
            let Some(record) = records.get_by_id(id) else { continue };
            for next in &record.references {
                if records.get_by_id(next).is_some() && visited.insert(next.as_str()) {
                    queue.push_back((next.as_str(), level + 1));
                }
            }
        }
        Ok(depth)
    }

    // ========================================================================
    // Clustering
    // ========================================================================

    /// Start a clustering pass if one is due. Returns whether a pass was
    /// started; a pass already running (or any other activity on the
    /// category) makes this a no-op.
    pub fn trigger_clustering_if_due(&self, category: &str) -> Result<bool> {
        let state = self.category(category)?;
        let config = self.inner.clusters.config();
        let now = current_timestamp_ms();
        let total = state.records.read().len();

        let ratio_fired = {
            let pending = state.pending.lock();
            if pending.inserts == 0 {
                return Ok(false);
            }
            let ratio_fired = total > 0 && pending.inserts as f64 / total as f64 >= config.pending_ratio;
            let due = ratio_fired
                || pending.inserts >= config.pending_threshold
                || now.saturating_sub(pending.last_pass_ms) >= config.interval_ms;
            if !due {
                return Ok(false);
            }
            ratio_fired
        };

        let Some(guard) = state.try_begin(CategoryActivity::Clustering) else {
            debug!(category, activity = %state.activity(), "Clustering due but category busy");
            return Ok(false);
        };

        let clusters = state.cluster_snapshot();
        let kind = if clusters.is_empty() || (ratio_fired && clusters.len() < config.target_k(total)) {
            PassKind::Full
        } else {
            PassKind::Incremental
        };

        self.dispatch_clustering(state, guard, kind);
        Ok(true)
    }

    fn dispatch_clustering(&self, state: Arc<CategoryState>, guard: ActivityGuard, kind: PassKind) {
        let store = self.clone();
        let job_state = state.clone();
        let job: TaskJob = Box::new(move || {
            store.run_clustering_pass(&job_state, kind);
            drop(guard);
        });

        if let Err(e) = self.inner.executor.submit(TaskType::Clustering, job, TaskPriority::Normal) {
            // The rejected job was dropped together with its guard
            warn!(category = %state.name, error = %e, "Task backend rejected clustering pass, running inline");
            if let Some(_guard) = state.try_begin(CategoryActivity::Clustering) {
                self.run_clustering_pass(&state, kind);
            }
        }
    }

    /// Run a full k-means++ pass now. Returns false if the category was
    /// busy or the pass was cancelled or superseded.
    pub fn recluster(&self, category: &str) -> Result<bool> {
        let state = self.category(category)?;
        let Some(_guard) = state.try_begin(CategoryActivity::Clustering) else {
            return Ok(false);
        };
        Ok(self.run_clustering_pass(&state, PassKind::Full))
    }

    /// Compute off-lock, then publish under the writer after reconciling
    /// with writes that happened meanwhile. Caller holds the Clustering
    /// activity.
    fn run_clustering_pass(&self, state: &CategoryState, kind: PassKind) -> bool {
        let started = Instant::now();
        let epoch = state.cluster_epoch.load(Ordering::Acquire);
        let (taken, touched) = {
            let mut pending = state.pending.lock();
            (std::mem::take(&mut pending.inserts), std::mem::take(&mut pending.touched))
        };
        let give_back = |touched: BTreeSet<ClusterId>| {
            let mut pending = state.pending.lock();
            pending.inserts += taken;
            pending.touched.extend(touched);
        };

        let records = state.live_records();
        let current = state.cluster_snapshot();
        let computed = match kind {
            PassKind::Full => self.inner.clusters.full_recluster(&records, current.next_id),
            PassKind::Incremental => Some(self.inner.clusters.refresh(&current, &touched, &records)),
        };
        let Some(computed) = computed else {
            info!(category = %state.name, %kind, "Clustering pass cancelled");
            give_back(touched);
            return false;
        };

        let _writer = state.writer.lock();
        if state.cluster_epoch.load(Ordering::Acquire) != epoch {
            debug!(category = %state.name, %kind, "Clusters edited during pass, discarding result");
            give_back(touched);
            return false;
        }

        let reconciled = {
            let live = state.records.read();
            self.inner.clusters.reconcile(computed, &state.cluster_snapshot(), &live.by_slot)
        };
        let cluster_count = reconciled.len();
        state.publish_clusters(reconciled);
        state.pending.lock().last_pass_ms = current_timestamp_ms();

        info!(
            category = %state.name,
            %kind,
            records = records.len(),
            clusters = cluster_count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Clustering pass complete"
        );
        true
    }

    pub fn merge_clusters(&self, category: &str, a: ClusterId, b: ClusterId) -> Result<ClusterId> {
        let state = self.category(category)?;
        let _writer = state.writer.lock();
        let (table, merged) = {
            let records = state.records.read();
            self.inner.clusters.merge(&state.cluster_snapshot(), &state.name, a, b, &records.by_slot)?
        };
        state.publish_clusters(table);
        state.cluster_epoch.fetch_add(1, Ordering::AcqRel);
        info!(category, a, b, merged, "Clusters merged");
        Ok(merged)
    }

    pub fn split_cluster(&self, category: &str, cluster_id: ClusterId) -> Result<(ClusterId, ClusterId)> {
        let state = self.category(category)?;
        let _writer = state.writer.lock();
        let (table, left, right) = {
            let records = state.records.read();
            self.inner.clusters.split(&state.cluster_snapshot(), &state.name, cluster_id, &records.by_slot)?
        };
        state.publish_clusters(table);
        state.cluster_epoch.fetch_add(1, Ordering::AcqRel);
        info!(category, cluster_id, left, right, "Cluster split");
        Ok((left, right))
    }

    /// Clusters of a category, by id.
    pub fn clusters(&self, category: &str) -> Result<Vec<ClusterMetadata>> {
        let state = self.category(category)?;
        let clusters = state.cluster_snapshot().clusters.values().cloned().collect();
        Ok(clusters)
    }

    pub fn cluster_of(&self, category: &str, slot: SlotId) -> Result<Option<ClusterId>> {
        Ok(self.category(category)?.cluster_snapshot().cluster_of(slot))
    }

    // ========================================================================
    // Partitions
    // ========================================================================

    pub fn partitions(&self, category: &str) -> Result<Vec<Partition>> {
        let state = self.category(category)?;
        let partitions = state.partition_snapshot().partitions.values().cloned().collect();
        Ok(partitions)
    }

    pub fn partition_of(&self, category: &str, slot: SlotId) -> Result<Option<PartitionId>> {
        Ok(self.category(category)?.partition_snapshot().partition_of(slot))
    }

    /// Split oversized and merge undersized partitions. Returns whether
    /// anything changed; a busy category is left alone.
    pub fn rebalance(&self, category: &str) -> Result<bool> {
        let state = self.category(category)?;
        let Some(_guard) = state.try_begin(CategoryActivity::Rebalancing) else {
            debug!(category, activity = %state.activity(), "Rebalance skipped, category busy");
            return Ok(false);
        };

        let now = current_timestamp_ms();
        let records = state.live_records();
        let outcome = self.inner.partitions.rebalance(&state.partition_snapshot(), &records, now);
        if outcome.cancelled {
            info!(category, "Rebalance cancelled");
            return Ok(false);
        }
        let Some(table) = outcome.table else {
            return Ok(false);
        };

        let _writer = state.writer.lock();
        let reconciled = {
            let live = state.records.read();
            self.inner
                .partitions
                .reconcile(table, &state.partition_snapshot(), &live.by_slot, &state.name, now)
        };
        let partition_count = reconciled.len();
        state.publish_partitions(reconciled);
        state.bump_generation();

        info!(
            category,
            splits = outcome.splits,
            merges = outcome.merges,
            partitions = partition_count,
            "Partitions rebalanced"
        );
        Ok(true)
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Live slots of a category, ascending.
    pub fn live_slots(&self, category: &str) -> Result<Vec<SlotId>> {
        let state = self.category(category)?;
        let mut slots: Vec<SlotId> = state.records.read().by_slot.keys().copied().collect();
        slots.sort_unstable();
        Ok(slots)
    }

    /// Live records of a category by slot. Unlike `get_record` this does
    /// not count as an access.
    pub fn records(&self, category: &str) -> Result<Vec<(SlotId, MemoryRecord)>> {
        let state = self.category(category)?;
        let mut records: Vec<(SlotId, MemoryRecord)> = state.live_records().into_iter().collect();
        records.sort_by_key(|(slot, _)| *slot);
        Ok(records)
    }

    /// Archived records of a category, by slot.
    pub fn archived(&self, category: &str) -> Result<Vec<ArchivedRecord>> {
        let state = self.category(category)?;
        let mut archived: Vec<ArchivedRecord> = state.archive.read().values().cloned().collect();
        archived.sort_by_key(|a| a.slot);
        Ok(archived)
    }

    pub fn stats(&self, category: &str) -> Result<CategoryStats> {
        let state = self.category(category)?;
        Ok(self.category_stats(&state))
    }

    pub fn store_stats(&self) -> StoreStats {
        StoreStats {
            categories: self.category_states().iter().map(|s| self.category_stats(s)).collect(),
            query_cache: self.inner.query_cache.stats(),
            record_cache: self.inner.record_cache.stats(),
        }
    }

    fn category_stats(&self, state: &CategoryState) -> CategoryStats {
        let (live_records, average_strength) = {
            let records = state.records.read();
            (records.len(), records.average_strength())
        };
        let partitions = state.partition_snapshot();
        CategoryStats {
            category: state.name.clone(),
            dimension: state.dimension,
            live_records,
            archived_records: state.archive.read().len(),
            index_slots: state.index.read().count(),
            clusters: state.cluster_snapshot().len(),
            partitions: partitions.len(),
            largest_partition: partitions.partitions.values().map(Partition::size).max().unwrap_or(0),
            pending_inserts: state.pending.lock().inserts,
            average_strength,
            activity: state.activity(),
        }
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// True when any category's average strength is below twice the
    /// decay floor.
    pub fn needs_maintenance(&self) -> bool {
        let floor = self.inner.config.decay.min_strength * 2.0;
        self.category_states().iter().any(|state| {
            state
                .records
                .read()
                .average_strength()
                .is_some_and(|avg| avg < floor)
        })
    }

    pub fn run_maintenance(&self) -> MaintenanceReport {
        self.run_maintenance_at(current_timestamp_ms())
    }

    /// One maintenance cycle with `now_ms` as the decay clock: decay and
    /// archival, consolidation, then rebalance per category, then cache
    /// optimization. Only one cycle runs at a time.
    pub fn run_maintenance_at(&self, now_ms: u64) -> MaintenanceReport {
        let started = Instant::now();
        let mut report = MaintenanceReport {
            started_at: now_ms,
            ..MaintenanceReport::default()
        };
        if self.inner.maintenance_running.swap(true, Ordering::AcqRel) {
            debug!("Maintenance already running, skipping");
            report.skipped = true;
            return report;
        }
        let _running = RunningFlag(&self.inner.maintenance_running);

        for state in self.category_states() {
            match self.maintain_category(&state, now_ms) {
                Ok(Some(mut summary)) => {
                    match self.rebalance(&state.name) {
                        Ok(changed) => summary.rebalanced = changed,
                        Err(e) => report.errors.push(format!("{}: {}", state.name, e)),
                    }
                    report.categories.push(summary);
                }
                Ok(None) => report.busy_categories.push(state.name.clone()),
                Err(e) => {
                    warn!(category = %state.name, error = %e, "Maintenance failed for category");
                    report.errors.push(format!("{}: {}", state.name, e));
                }
            }
            let name = state.name.as_str();
            self.inner.query_cache.retain(|key| key.category() != name);
            self.inner.record_cache.retain(|key| key.category() != name);
        }

        report.cache_evictions = self.inner.query_cache.optimize() + self.inner.record_cache.optimize();
        report.duration_ms = started.elapsed().as_millis() as u64;

        info!(
            categories = report.categories.len(),
            busy = report.busy_categories.len(),
            archived = report.archived(),
            cache_evictions = report.cache_evictions,
            errors = report.errors.len(),
            duration_ms = report.duration_ms,
            "Maintenance cycle complete"
        );
        report
    }

    /// Decay, archival and consolidation of one category. `None` when the
    /// category is busy.
    fn maintain_category(&self, state: &Arc<CategoryState>, now: u64) -> Result<Option<CategoryMaintenance>> {
        let Some(_guard) = state.try_begin(CategoryActivity::Maintaining) else {
            return Ok(None);
        };
        let consolidation_enabled = self.inner.config.consolidation.enabled;
        let relevance = if consolidation_enabled { self.relevance_scores(state) } else { None };

        let _writer = state.writer.lock();
        let mut summary = CategoryMaintenance {
            category: state.name.clone(),
            ..CategoryMaintenance::default()
        };

        let mut floored = Vec::new();
        {
            let mut records = state.records.write();
            for (&slot, record) in records.by_slot.iter_mut() {
                summary.decayed += 1;
                if decay::apply_decay(record, now, &self.inner.config.decay) {
                    floored.push(slot);
                }
            }
        }
        floored.sort_unstable();
        summary.archived = self.archive_slots(state, &floored, TombstoneReason::Decayed, now)?;

        if consolidation_enabled {
            summary.consolidated = self.consolidate(state, relevance.as_ref(), now)?;
        }
        state.bump_generation();

        debug!(
            category = %state.name,
            decayed = summary.decayed,
            archived = summary.archived,
            consolidated = summary.consolidated,
            "Category maintained"
        );
        Ok(Some(summary))
    }

    /// Relevance of every live record, or `None` if the service is absent
    /// or fails for any record.
    fn relevance_scores(&self, state: &CategoryState) -> Option<HashMap<SlotId, f32>> {
        let service = self.inner.relevance.as_ref()?;
        let records = state.live_records();
        let mut scores = HashMap::with_capacity(records.len());
        for (slot, record) in &records {
            match service.predict_relevance(record) {
                Ok(score) => {
                    scores.insert(*slot, score.clamp(0.0, 1.0));
                }
                Err(e) => {
                    warn!(category = %state.name, error = %e, "Relevance unavailable, consolidating on vectors and labels");
                    return None;
                }
            }
        }
        Some(scores)
    }

    /// Fold near-duplicates within each cluster into their strongest
    /// member. Callers hold the writer. Returns the number absorbed.
    fn consolidate(
        &self,
        state: &CategoryState,
        relevance: Option<&HashMap<SlotId, f32>>,
        now: u64,
    ) -> Result<usize> {
        let config = &self.inner.config.consolidation;
        let clusters = state.cluster_snapshot();
        let mut records = state.records.write();

        let mut groups = Vec::new();
        for members in clusters.members_by_cluster().values() {
            let items: Vec<(SlotId, &MemoryRecord)> = members
                .iter()
                .filter_map(|slot| records.by_slot.get(slot).map(|r| (*slot, r)))
                .collect();
            groups.extend(consolidation::plan_groups(&items, relevance, config));
        }
        if groups.is_empty() {
            return Ok(0);
        }

        let mut absorbed_slots = Vec::new();
        let mut renamed: HashMap<String, String> = HashMap::new();
        for group in &groups {
            let absorbed: Vec<MemoryRecord> = group
                .absorbed
                .iter()
                .filter_map(|slot| records.by_slot.get(slot).cloned())
                .collect();
            let Some(survivor) = records.by_slot.get_mut(&group.survivor) else { continue };
            for record in &absorbed {
                consolidation::merge_into(survivor, record);
                renamed.insert(record.id.clone(), survivor.id.clone());
            }
            absorbed_slots.extend(group.absorbed.iter().copied());
        }

        // References to absorbed records now point at their survivor
        for record in records.by_slot.values_mut() {
            let stale: Vec<String> = record
                .references
                .iter()
                .filter(|id| renamed.contains_key(*id))
                .cloned()
                .collect();
            for old in stale {
                record.references.remove(&old);
                if let Some(new) = renamed.get(&old) {
                    if *new != record.id {
                        record.references.insert(new.clone());
                    }
                }
            }
        }
        drop(records);

        absorbed_slots.sort_unstable();
        self.archive_slots(state, &absorbed_slots, TombstoneReason::Consolidated, now)
    }

    /// Spawn a tokio task sweeping expired entries of both caches.
    pub fn spawn_cache_sweeper(&self) -> CacheSweeper {
        let targets: Vec<Arc<dyn Sweepable>> = vec![
            self.inner.query_cache.clone() as Arc<dyn Sweepable>,
            self.inner.record_cache.clone() as Arc<dyn Sweepable>,
        ];
        CacheSweeper::spawn(targets, Duration::from_millis(self.inner.config.cache.sweep_interval_ms))
    }

    /// Cancel running and future clustering and rebalance passes.
    pub fn shutdown(&self) {
        self.inner.clusters.cancel();
        self.inner.partitions.cancel();
        info!("Memory store shutting down, background passes cancelled");
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Write every category to `dir`. A category that fails keeps its
    /// previous section and index file; the failure is reported after the
    /// others have been saved.
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|e| MnemoError::persistence("create data dir", e))?;
        let now = current_timestamp_ms();

        let previous = match persistence::read_document(dir) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Previous metadata unreadable, writing a fresh document");
                None
            }
        };

        let mut doc = MetadataDocument::new(now);
        let mut written: Vec<(String, String)> = Vec::new();
        let mut failures = Vec::new();

        for state in self.category_states() {
            let prior = previous.as_ref().and_then(|d| d.categories.get(&state.name));
            let generation = prior.map_or(now, |s| now.max(s.index_generation + 1));
            match self.snapshot_category(&state, dir, generation, now) {
                Ok(section) => {
                    written.push((state.name.clone(), section.index_file.clone()));
                    doc.categories.insert(state.name.clone(), section);
                }
                Err(e) => {
                    warn!(category = %state.name, error = %e, "Category save failed, keeping previous snapshot");
                    failures.push(format!("{}: {}", state.name, e));
                    if let Some(section) = prior {
                        doc.categories.insert(state.name.clone(), section.clone());
                    }
                }
            }
        }

        if let Err(e) = persistence::write_document(dir, &doc) {
            for (_, file) in &written {
                let _ = fs::remove_file(dir.join(file));
            }
            return Err(e);
        }

        let referenced: BTreeSet<String> = doc.categories.values().map(|s| s.index_file.clone()).collect();
        for (name, _) in &written {
            persistence::remove_stale_indexes(dir, name, &referenced);
        }

        info!(
            dir = %dir.display(),
            saved = written.len(),
            failed = failures.len(),
            "Store saved"
        );
        if failures.is_empty() {
            Ok(())
        } else {
            Err(MnemoError::PersistenceFailure(failures.join("; ")))
        }
    }

    fn snapshot_category(
        &self,
        state: &CategoryState,
        dir: &Path,
        generation: u64,
        now: u64,
    ) -> Result<CategorySection> {
        let _writer = state.writer.lock();
        let file = persistence::index_file_name(&state.name, generation);
        state.index.read().persist(&dir.join(&file))?;
        Ok(state.to_section(file, generation, now))
    }

    /// Load every category saved in `dir`, replacing same-named categories.
    /// A category that cannot be restored is installed empty and reported
    /// in the returned error; the others load normally.
    pub fn load(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        let doc = persistence::read_document(dir)?.ok_or_else(|| {
            MnemoError::PersistenceFailure(format!("no {} in {}", METADATA_FILE, dir.display()))
        })?;
        let now = current_timestamp_ms();
        let mut failures = Vec::new();
        let mut loaded = 0;

        for (name, section) in doc.categories {
            let dimension = section.dimension;
            let state = match self.restore_category(&name, section, dir, now) {
                Ok(state) => {
                    loaded += 1;
                    state
                }
                Err(e) => {
                    warn!(category = %name, error = %e, "Category load failed, starting it empty");
                    failures.push(format!("{}: {}", name, e));
                    let index = HnswIndex::new(dimension, self.inner.config.index.clone());
                    CategoryState::new(&name, Box::new(index), now)
                }
            };
            self.inner.categories.write().insert(name, Arc::new(state));
        }

        // Generations restart with the new states
        self.inner.query_cache.clear();
        self.inner.record_cache.clear();

        info!(dir = %dir.display(), loaded, failed = failures.len(), "Store loaded");
        if failures.is_empty() {
            Ok(())
        } else {
            Err(MnemoError::PersistenceFailure(failures.join("; ")))
        }
    }

    fn restore_category(
        &self,
        name: &str,
        section: CategorySection,
        dir: &Path,
        now: u64,
    ) -> Result<CategoryState> {
        let mut index = HnswIndex::new(section.dimension, self.inner.config.index.clone());
        index.restore(&dir.join(&section.index_file), section.slots.len())?;
        CategoryState::from_section(name, section, Box::new(index), now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingExecutor;

    impl TaskExecutor for FailingExecutor {
        fn submit(&self, _task_type: TaskType, _job: TaskJob, _priority: TaskPriority) -> Result<()> {
            Err(MnemoError::collaborator(Collaborator::TaskBackend, "queue full"))
        }
    }

    struct FixedRelevance;

    impl RelevanceService for FixedRelevance {
        fn predict_relevance(&self, _record: &MemoryRecord) -> Result<f32> {
            Ok(0.8)
        }

        fn generate_tags(&self, _record: &MemoryRecord) -> Result<BTreeSet<String>> {
            Ok(BTreeSet::from(["tagged".to_string()]))
        }

        fn analyze_context(&self, _record: &MemoryRecord) -> Result<BTreeSet<String>> {
            Err(MnemoError::collaborator(Collaborator::Relevance, "offline"))
        }
    }

    fn store() -> MemoryStore {
        let store = MemoryStore::new(MemoryConfig::default()).unwrap();
        store.create_category("episodic", 2).unwrap();
        store
    }

    #[test]
    fn test_unknown_category_and_duplicates() {
        let store = store();
        let err = store.insert(NewMemory::new("semantic", vec![1.0, 0.0])).unwrap_err();
        assert!(matches!(err, MnemoError::UnknownCategory(_)));
        assert!(matches!(store.create_category("episodic", 2), Err(MnemoError::CategoryExists(_))));

        store.insert(NewMemory::new("episodic", vec![1.0, 0.0]).with_id("m1")).unwrap();
        let err = store.insert(NewMemory::new("episodic", vec![0.0, 1.0]).with_id("m1")).unwrap_err();
        assert!(matches!(err, MnemoError::DuplicateMemoryId(_)));
        assert_eq!(store.live_slots("episodic").unwrap(), vec![0]);
    }

    #[test]
    fn test_dimension_checked() {
        let store = store();
        let err = store.insert(NewMemory::new("episodic", vec![1.0, 0.0, 0.0])).unwrap_err();
        assert!(matches!(err, MnemoError::VectorDimensionMismatch { expected: 2, got: 3 }));
        assert!(store.query_similar("episodic", &[1.0], 3, 0.0).is_err());
    }

    #[test]
    fn test_relevance_enrichment_degrades() {
        let store = MemoryStore::builder(MemoryConfig::default())
            .relevance(Arc::new(FixedRelevance))
            .build()
            .unwrap();
        store.create_category("episodic", 2).unwrap();
        store.insert(NewMemory::new("episodic", vec![1.0, 0.0]).with_id("a")).unwrap();

        let record = store.get_record("episodic", "a").unwrap();
        assert_eq!(record.importance, 0.8);
        assert!(record.labels.contains("tagged"));
    }

    #[test]
    fn test_rejected_job_runs_inline() {
        let store = MemoryStore::builder(MemoryConfig::default())
            .executor(Arc::new(FailingExecutor))
            .build()
            .unwrap();
        store.create_category("episodic", 2).unwrap();
        store.insert(NewMemory::new("episodic", vec![1.0, 0.0])).unwrap();

        let stats = store.stats("episodic").unwrap();
        assert_eq!(stats.clusters, 1);
        assert_eq!(stats.pending_inserts, 0);
        assert_eq!(stats.activity, CategoryActivity::Idle);
    }

    #[test]
    fn test_query_caches_and_invalidates_on_write() {
        let store = store();
        store.insert(NewMemory::new("episodic", vec![1.0, 0.0]).with_id("a")).unwrap();

        let first = store.query_similar("episodic", &[1.0, 0.0], 5, 0.5).unwrap();
        let again = store.query_similar("episodic", &[1.0, 0.0], 5, 0.5).unwrap();
        assert_eq!(first, again);
        assert_eq!(store.store_stats().query_cache.hits, 1);

        store.insert(NewMemory::new("episodic", vec![0.9, 0.1]).with_id("b")).unwrap();
        let fresh = store.query_similar("episodic", &[1.0, 0.0], 5, 0.5).unwrap();
        assert_eq!(fresh.len(), 2);
        assert_eq!(fresh[0].memory_id, "a");
    }

    #[test]
    fn test_query_tracks_access() {
        let store = store();
        store.insert(NewMemory::new("episodic", vec![1.0, 0.0]).with_id("a")).unwrap();
        store.query_similar("episodic", &[1.0, 0.0], 1, 0.0).unwrap();
        let record = store.get_record("episodic", "a").unwrap();
        // One from the query, one from this lookup
        assert_eq!(record.access_count, 2);
    }

    #[test]
    fn test_remove_archives_record() {
        let store = store();
        let slot = store.insert(NewMemory::new("episodic", vec![1.0, 0.0]).with_id("a")).unwrap();
        store.remove("episodic", "a").unwrap();

        assert!(store.live_slots("episodic").unwrap().is_empty());
        assert_eq!(store.cluster_of("episodic", slot).unwrap(), None);
        assert_eq!(store.partition_of("episodic", slot).unwrap(), None);
        let archived = store.archived("episodic").unwrap();
        assert_eq!(archived[0].reason, TombstoneReason::Removed);
        assert!(store.query_similar("episodic", &[1.0, 0.0], 3, 0.0).unwrap().is_empty());
        assert!(matches!(store.remove("episodic", "a"), Err(MnemoError::NotFound(_))));
    }

    #[test]
    fn test_reference_depth_handles_cycles() {
        let store = store();
        store.insert(NewMemory::new("episodic", vec![1.0, 0.0]).with_id("a").with_references(["b"])).unwrap();
        store.insert(NewMemory::new("episodic", vec![0.0, 1.0]).with_id("b").with_references(["c", "a"])).unwrap();
        store.insert(NewMemory::new("episodic", vec![0.5, 0.5]).with_id("c").with_references(["a", "missing"])).unwrap();

        assert_eq!(store.reference_depth("episodic", "a").unwrap(), 2);
        assert_eq!(store.reference_depth("episodic", "c").unwrap(), 2);
        assert!(store.reference_depth("episodic", "zzz").is_err());
    }

    #[test]
    fn test_text_operations_need_embedding() {
        let store = store();
        let err = store.insert_text("episodic", "hello").unwrap_err();
        assert_eq!(err.code(), crate::core::errors::ErrorCode::EmbeddingUnavailable);
        assert!(matches!(store.query_text("nope", "hello", 1, 0.0), Err(MnemoError::UnknownCategory(_))));
    }

    #[test]
    fn test_needs_maintenance_on_weak_category() {
        let store = store();
        assert!(!store.needs_maintenance());
        store.insert(NewMemory::new("episodic", vec![1.0, 0.0]).with_strength(0.15)).unwrap();
        assert!(store.needs_maintenance());
    }
}
