use {
    crate::{
        config::RouterConfig,
        coordinator::ShardCoordinator,
        error::{ConfigError, ConfigResult},
        events::{EventSink, TracingSink},
        monitor::HealthProbe,
        query::executor::ShardAccess,
        rebalance::DataCopier,
        registry::ShardRegistry,
        shard::ShardConfig,
        topology::{Topology, TopologyHandle},
    },
    std::sync::Arc,
};

/// Shard coordinator builder.
pub struct CoordinatorBuilder {
    config: RouterConfig,
    shards: Vec<ShardConfig>,
    sink: Arc<dyn EventSink>,
    access: Option<Arc<dyn ShardAccess>>,
    copier: Option<Arc<dyn DataCopier>>,
    probe: Option<Arc<dyn HealthProbe>>,
}

impl CoordinatorBuilder {
    /// Create new coordinator builder.
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            shards: Vec::new(),
            sink: Arc::new(TracingSink),
            access: None,
            copier: None,
            probe: None,
        }
    }

    /// Shards registered at build time, in order.
    pub fn with_shards<I: IntoIterator<Item = ShardConfig>>(mut self, shards: I) -> Self {
        self.shards.extend(shards);
        self
    }

    /// Event receiver; defaults to [`TracingSink`].
    pub fn with_event_sink(mut self, sink: impl EventSink + 'static) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    pub fn with_shard_access(mut self, access: impl ShardAccess + 'static) -> Self {
        self.access = Some(Arc::new(access));
        self
    }

    pub fn with_data_copier(mut self, copier: impl DataCopier + 'static) -> Self {
        self.copier = Some(Arc::new(copier));
        self
    }

    /// Health probe used by the background tasks. Optional.
    pub fn with_health_probe(mut self, probe: impl HealthProbe + 'static) -> Self {
        self.probe = Some(Arc::new(probe));
        self
    }

    /// Build the coordinator.
    ///
    /// Fails on an invalid configuration, a missing collaborator or any
    /// rejected initial shard.
    pub fn build(self) -> ConfigResult<ShardCoordinator> {
        self.config.validate()?;
        let access = self.access.ok_or(ConfigError::MissingComponent("shard access"))?;
        let copier = self.copier.ok_or(ConfigError::MissingComponent("data copier"))?;

        let registry = ShardRegistry::new(self.config.load_threshold);
        let topology = Arc::new(TopologyHandle::new(Topology::new(registry)));
        let coordinator = ShardCoordinator::new(
            Arc::new(self.config),
            topology,
            self.sink,
            access,
            copier,
            self.probe,
        );
        for shard in self.shards {
            coordinator.add_shard(shard)?;
        }
        Ok(coordinator)
    }
}
