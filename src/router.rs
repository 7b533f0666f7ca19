use {
    crate::{
        config::RouterConfig,
        error::{ConfigError, ConfigResult, QueryError, RouterError, RouterResult},
        events::{Event, EventSink},
        index::IndexId,
        query::{AnalyzedQuery, Value, plan::Optimization, planner::QueryPlanner},
        registry::SelectOptions,
        ring::VirtualNodeStatus,
        shard::{Operation, Shard, ShardConfig, ShardId, ShardLoad, ShardStatus},
        topology::{Topology, TopologyHandle},
    },
    serde::{Deserialize, Serialize},
    std::sync::Arc,
    tracing::debug,
};

/// How a query reaches its shards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    /// Shard key resolved to a single shard.
    SingleShard,
    /// Shard key resolved to a subset of shards.
    MultiShard,
    /// Served by global secondary index partitions.
    IndexLookup { index: IndexId },
    /// Every shard is involved.
    FanOut,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub target_shards: Vec<ShardId>,
    pub strategy: RoutingStrategy,
    pub estimated_cost: f64,
    /// Topology version the decision was made against.
    pub version: u64,
}

/// Picks the best shard for a key.
///
/// Reads consider the key's ring owners up to `replica_candidates` plus the
/// registered read replicas of the primary. Writes go to the primary only.
pub(crate) fn select_for_key(
    topology: &Topology,
    key: &str,
    op: Operation,
    replica_candidates: usize,
    options: &SelectOptions,
) -> RouterResult<ShardId> {
    let mut candidates = match op {
        Operation::Read => topology.ring.get_nodes(key, replica_candidates),
        Operation::Write => topology.ring.get_nodes(key, 1),
    };
    let Some(primary) = candidates.first().cloned() else {
        return Err(RouterError::NoAvailableShards);
    };
    if op == Operation::Read
        && let Some(shard) = topology.registry.get(&primary)
    {
        for replica in &shard.replicas {
            if !candidates.contains(replica) {
                candidates.push(replica.clone());
            }
        }
    }
    topology
        .registry
        .select_optimal_shard(&candidates, op, options)
}

/// Shard membership and key routing.
///
/// Every mutation is applied to a copy of the current topology and
/// published atomically, so concurrent routing decisions see either the old
/// or the new ring, never a mix.
pub struct ShardRouter {
    topology: Arc<TopologyHandle>,
    config: Arc<RouterConfig>,
    sink: Arc<dyn EventSink>,
}

impl ShardRouter {
    pub fn new(topology: Arc<TopologyHandle>, config: Arc<RouterConfig>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            topology,
            config,
            sink,
        }
    }

    pub fn topology(&self) -> &Arc<TopologyHandle> {
        &self.topology
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Registers a shard and places its virtual nodes.
    ///
    /// The configuration is rejected as a whole on any error.
    pub fn add_shard(&self, config: ShardConfig) -> ConfigResult<()> {
        config.validate()?;
        let id = config.id.clone();
        let virtual_nodes = config.virtual_nodes.unwrap_or(self.config.virtual_nodes);
        let weight = config.weight;

        self.topology.update(|topology| {
            if topology.registry.contains(&id) {
                return Err(ConfigError::DuplicateShard(id.clone()));
            }
            topology.ring.add_shard(&id, virtual_nodes, weight)?;
            topology.registry.insert(Shard::new(config, virtual_nodes))
        })?;

        debug!(shard_id = %id, virtual_nodes, "Shard placed on the ring");
        self.sink.emit(Event::ShardAdded {
            shard: id,
            virtual_nodes,
        });
        Ok(())
    }

    /// Removes a shard; its ranges are absorbed by ring successors.
    ///
    /// Shards with virtual nodes in flight are refused.
    pub fn remove_shard(&self, id: &ShardId) -> ConfigResult<Shard> {
        let removed = self.topology.update(|topology| {
            let busy = topology
                .ring
                .virtual_nodes()
                .any(|node| &node.shard == id && node.status == VirtualNodeStatus::Migrating);
            if busy {
                return Err(ConfigError::ShardBusy(id.clone()));
            }
            let shard = topology
                .registry
                .remove(id)
                .ok_or_else(|| ConfigError::UnknownShard(id.clone()))?;
            let tokens = topology.ring.remove_node(id);
            let rehomed = topology.indexes.rehome(&topology.ring);
            debug!(shard_id = %id, tokens, rehomed, "Shard taken off the ring");
            Ok(shard)
        })?;

        self.sink.emit(Event::ShardRemoved { shard: id.clone() });
        Ok(removed)
    }

    /// Sets the status of a shard, returning the previous one.
    pub fn set_status(&self, id: &ShardId, status: ShardStatus) -> ConfigResult<ShardStatus> {
        let previous = self.topology.update(|topology| {
            topology
                .registry
                .set_status(id, status)
                .ok_or_else(|| ConfigError::UnknownShard(id.clone()))
        })?;
        if previous != status {
            self.sink.emit(Event::ShardStatusChanged {
                shard: id.clone(),
                previous,
                current: status,
            });
        }
        Ok(previous)
    }

    /// Records reported load figures for several shards at once.
    ///
    /// Unknown shards are skipped.
    pub fn update_loads(&self, loads: &[(ShardId, ShardLoad)]) {
        let _ = self.topology.update(|topology| {
            for (id, load) in loads {
                topology.registry.update_load(id, *load);
            }
            Ok::<_, ConfigError>(())
        });
    }

    /// Best available shard for the key.
    pub fn select_shard(&self, key: &str, op: Operation, options: &SelectOptions) -> RouterResult<ShardId> {
        let topology = self.topology.load();
        let mut options = options.clone();
        if options.preferred_region.is_none() {
            options.preferred_region = self.config.preferred_region.clone();
        }
        select_for_key(&topology, key, op, self.config.replica_candidates, &options)
    }

    /// Shards a query would touch, without executing it.
    pub fn route_query(&self, query: &AnalyzedQuery, params: &[Value]) -> RouterResult<RoutingDecision> {
        let topology = self.topology.load();
        let plan = QueryPlanner::new(&topology, &self.config)
            .plan(query, params, None)
            .map_err(|err| match err {
                QueryError::Unavailable(err) => err,
                other => RouterError::UnroutableQuery(other.to_string()),
            })?;

        let target_shards = plan.shards();
        let index = plan.optimizations().iter().find_map(|opt| match opt {
            Optimization::IndexRouting(index) => Some(index.clone()),
            _ => None,
        });
        let pruned = plan.optimizations().contains(&Optimization::ShardKeyPruning);
        let strategy = match index {
            Some(index) => RoutingStrategy::IndexLookup { index },
            None if target_shards.len() == 1 => RoutingStrategy::SingleShard,
            None if pruned => RoutingStrategy::MultiShard,
            None => RoutingStrategy::FanOut,
        };

        Ok(RoutingDecision {
            target_shards,
            strategy,
            estimated_cost: plan.estimated_cost(),
            version: topology.version,
        })
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            events::ChannelSink,
            query::{Operand, Predicate},
            shard::{ConnectionInfo, ShardCapacity},
        },
        serde_json::json,
    };

    fn config(id: &str) -> ShardConfig {
        ShardConfig::new(
            id,
            "eu",
            ConnectionInfo::new("db", 5432),
            ShardCapacity::new(100, 1 << 30, 1000),
        )
        .with_virtual_nodes(32)
    }

    fn router() -> (ShardRouter, tokio::sync::mpsc::UnboundedReceiver<Event>) {
        let (sink, rx) = ChannelSink::new();
        let router = ShardRouter::new(
            Arc::new(TopologyHandle::default()),
            Arc::new(RouterConfig::default()),
            Arc::new(sink),
        );
        (router, rx)
    }

    #[test]
    fn add_shard_is_all_or_nothing() {
        let (router, mut events) = router();
        router.add_shard(config("s1")).unwrap();
        assert_eq!(
            events.try_recv().unwrap(),
            Event::ShardAdded {
                shard: "s1".into(),
                virtual_nodes: 32
            }
        );

        let version = router.topology().version();
        assert_eq!(
            router.add_shard(config("s1")),
            Err(ConfigError::DuplicateShard("s1".into()))
        );
        let mut broken = config("s2");
        broken.capacity.max_connections = 0;
        assert!(router.add_shard(broken).is_err());

        assert_eq!(router.topology().version(), version);
        let topology = router.topology().load();
        assert_eq!(topology.ring.len(), 32);
        assert_eq!(topology.registry.len(), 1);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn default_virtual_nodes() {
        let (router, _events) = router();
        let mut config = config("s1");
        config.virtual_nodes = None;
        router.add_shard(config).unwrap();
        assert_eq!(router.topology().load().ring.len(), 256);
    }

    #[test]
    fn selection_and_removal() {
        let (router, _events) = router();
        router.add_shard(config("s1")).unwrap();
        router.add_shard(config("s2")).unwrap();

        let primary = router.topology().load().ring.primary("opportunity-42").cloned().unwrap();
        let picked = router
            .select_shard("opportunity-42", Operation::Write, &SelectOptions::default())
            .unwrap();
        assert_eq!(picked, primary);

        router.remove_shard(&primary).unwrap();
        let remaining = router
            .select_shard("opportunity-42", Operation::Read, &SelectOptions::default())
            .unwrap();
        assert_ne!(remaining, primary);

        assert_eq!(
            router.remove_shard(&primary),
            Err(ConfigError::UnknownShard(primary.clone()))
        );
    }

    #[test]
    fn status_changes_are_reported() {
        let (router, mut events) = router();
        router.add_shard(config("s1")).unwrap();
        let _ = events.try_recv();

        assert_eq!(router.set_status(&"s1".into(), ShardStatus::ReadOnly), Ok(ShardStatus::Active));
        assert_eq!(events.try_recv().unwrap().name(), "shard.status_changed");

        assert_eq!(
            router.select_shard("k", Operation::Write, &SelectOptions::default()),
            Err(RouterError::NoHealthyShards(1))
        );
        assert!(router.select_shard("k", Operation::Read, &SelectOptions::default()).is_ok());
    }

    #[test]
    fn routing_decisions() {
        let (router, _events) = router();
        assert_eq!(
            router.route_query(&AnalyzedQuery::select("q", "users"), &[]),
            Err(RouterError::NoAvailableShards)
        );

        for id in ["s1", "s2", "s3"] {
            router.add_shard(config(id)).unwrap();
        }
        let point = AnalyzedQuery::select("q", "users")
            .with_shard_key("id")
            .with_predicate(Predicate::eq("id", Operand::Param(0)));
        let decision = router.route_query(&point, &[json!(1)]).unwrap();
        assert_eq!(decision.strategy, RoutingStrategy::SingleShard);
        assert_eq!(decision.target_shards.len(), 1);

        let scan = AnalyzedQuery::select("q", "users");
        let decision = router.route_query(&scan, &[]).unwrap();
        assert_eq!(decision.strategy, RoutingStrategy::FanOut);
        assert_eq!(decision.target_shards.len(), 3);
        assert!(decision.estimated_cost > 30.0);
    }
}
