use {
    crate::{
        error::{ConfigError, ConfigResult, RouterError, RouterResult},
        shard::{Operation, Shard, ShardId, ShardLoad, ShardStatus},
    },
    std::collections::BTreeMap,
};

/// Utilization at or above which a shard stops receiving new work.
pub const DEFAULT_LOAD_THRESHOLD: f64 = 0.8;

const BASE_SCORE: f64 = 100.0;
const UTILIZATION_PENALTY: f64 = 50.0;
const REGION_BONUS: f64 = 20.0;
const READ_ONLY_READ_BONUS: f64 = 10.0;

/// Per-request knobs for shard selection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectOptions {
    /// Candidates in this region get a score bonus.
    pub preferred_region: Option<String>,
}

impl SelectOptions {
    pub fn in_region(region: impl Into<String>) -> Self {
        Self {
            preferred_region: Some(region.into()),
        }
    }
}

/// Shard registry.
///
/// Holds configuration, capacity and health of every shard and enforces the
/// availability policy used by routing. Shards are kept ordered by id so
/// that iteration (and therefore fan-out order) is deterministic.
#[derive(Debug, Clone)]
pub struct ShardRegistry {
    shards: BTreeMap<ShardId, Shard>,
    load_threshold: f64,
}

impl Default for ShardRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_LOAD_THRESHOLD)
    }
}

impl ShardRegistry {
    pub fn new(load_threshold: f64) -> Self {
        Self {
            shards: BTreeMap::new(),
            load_threshold,
        }
    }

    pub fn load_threshold(&self) -> f64 {
        self.load_threshold
    }

    /// Adds a shard to the registry.
    pub fn insert(&mut self, shard: Shard) -> ConfigResult<()> {
        if self.shards.contains_key(shard.id()) {
            return Err(ConfigError::DuplicateShard(shard.id().clone()));
        }
        self.shards.insert(shard.id().clone(), shard);
        Ok(())
    }

    /// Removes and returns (if existed) a shard from the registry.
    ///
    /// References to the shard from other shards' replica lists are dropped
    /// as well.
    pub fn remove(&mut self, id: &ShardId) -> Option<Shard> {
        let removed = self.shards.remove(id)?;
        for shard in self.shards.values_mut() {
            shard.replicas.retain(|replica| replica != id);
        }
        Some(removed)
    }

    pub fn get(&self, id: &ShardId) -> Option<&Shard> {
        self.shards.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: &ShardId) -> Option<&mut Shard> {
        self.shards.get_mut(id)
    }

    pub fn contains(&self, id: &ShardId) -> bool {
        self.shards.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// Iterator over the shards, ordered by id.
    pub fn iter(&self) -> impl Iterator<Item = &Shard> {
        self.shards.values()
    }

    /// Shards whose status allows routing (active or read-only).
    pub fn routable(&self) -> impl Iterator<Item = &Shard> {
        self.shards.values().filter(|shard| shard.is_routable())
    }

    /// Sets the status of a shard, returning the previous one.
    pub fn set_status(&mut self, id: &ShardId, status: ShardStatus) -> Option<ShardStatus> {
        self.shards
            .get_mut(id)
            .map(|shard| std::mem::replace(&mut shard.status, status))
    }

    /// Records the latest load figures reported for a shard.
    pub fn update_load(&mut self, id: &ShardId, load: ShardLoad) -> bool {
        match self.shards.get_mut(id) {
            Some(shard) => {
                let capacity = &mut shard.config.capacity;
                capacity.current_connections = load.connections;
                capacity.current_qps = load.qps;
                capacity.used_storage = load.used_storage;
                true
            }
            None => false,
        }
    }

    /// Registers `replica` as holding a read replica of `source`.
    pub fn register_replica(&mut self, source: &ShardId, replica: &ShardId) -> bool {
        if !self.shards.contains_key(replica) {
            return false;
        }
        match self.shards.get_mut(source) {
            Some(shard) if !shard.replicas.contains(replica) => {
                shard.replicas.push(replica.clone());
                shard.config.replication_factor = shard.config.replication_factor.saturating_add(1);
                true
            }
            _ => false,
        }
    }

    /// QPS utilization of every routable shard.
    pub fn utilizations(&self) -> Vec<(ShardId, f64)> {
        self.routable()
            .map(|shard| (shard.id().clone(), shard.qps_utilization()))
            .collect()
    }

    /// Whether the shard may take the operation right now.
    ///
    /// Status must allow the operation, and both connection and QPS
    /// utilization must stay below the load threshold: shards above it are
    /// shed even when nominally active.
    pub fn is_shard_available(&self, shard: &Shard, op: Operation) -> bool {
        shard.accepts(op)
            && shard.connection_utilization() < self.load_threshold
            && shard.qps_utilization() < self.load_threshold
    }

    /// Selection score of an (already available) shard.
    pub fn score(&self, shard: &Shard, op: Operation, options: &SelectOptions) -> f64 {
        let mut score = BASE_SCORE
            - UTILIZATION_PENALTY * (shard.connection_utilization() + shard.qps_utilization());
        if options.preferred_region.as_deref() == Some(shard.region()) {
            score += REGION_BONUS;
        }
        if op == Operation::Read && shard.status == ShardStatus::ReadOnly {
            score += READ_ONLY_READ_BONUS;
        }
        score.max(0.0)
    }

    /// Picks the best shard among `candidates`.
    ///
    /// Unavailable shards are filtered out first, then the highest scoring
    /// shard wins; on ties the earlier candidate is kept.
    pub fn select_optimal_shard(
        &self,
        candidates: &[ShardId],
        op: Operation,
        options: &SelectOptions,
    ) -> RouterResult<ShardId> {
        if candidates.is_empty() {
            return Err(RouterError::NoAvailableShards);
        }

        let mut best: Option<(&Shard, f64)> = None;
        for shard in candidates.iter().filter_map(|id| self.shards.get(id)) {
            if !self.is_shard_available(shard, op) {
                continue;
            }
            let score = self.score(shard, op, options);
            if best.is_none_or(|(_, top)| score > top) {
                best = Some((shard, score));
            }
        }

        best.map(|(shard, _)| shard.id().clone())
            .ok_or(RouterError::NoHealthyShards(candidates.len()))
    }
}
