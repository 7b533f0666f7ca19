use {
    crate::{
        builder::CoordinatorBuilder,
        config::RouterConfig,
        error::{ConfigError, ConfigResult, IndexResult, QueryError, RebalanceResult, RouterResult},
        events::EventSink,
        index::{GlobalIndexCoordinator, IndexDefinition, IndexId},
        monitor::{BackgroundTasks, HealthMonitor, HealthProbe},
        query::{
            AnalyzedQuery, Value,
            executor::{QueryExecutor, QueryOptions, QueryResult, ShardAccess},
            plan::Optimization,
            planner::QueryPlanner,
        },
        rebalance::{DataCopier, PlanId, Rebalancer},
        registry::SelectOptions,
        router::{RoutingDecision, ShardRouter},
        shard::{Operation, Shard, ShardConfig, ShardId},
        topology::TopologyHandle,
    },
    std::sync::Arc,
    tracing::debug,
};

/// Entry point of the crate.
///
/// Ties the router, planner, executor, index coordinator and rebalancer
/// together around one shared topology handle.
pub struct ShardCoordinator {
    config: Arc<RouterConfig>,
    topology: Arc<TopologyHandle>,
    router: Arc<ShardRouter>,
    indexes: Arc<GlobalIndexCoordinator>,
    rebalancer: Arc<Rebalancer>,
    executor: QueryExecutor,
    access: Arc<dyn ShardAccess>,
    probe: Option<Arc<dyn HealthProbe>>,
}

impl ShardCoordinator {
    pub fn builder(config: RouterConfig) -> CoordinatorBuilder {
        CoordinatorBuilder::new(config)
    }

    pub(crate) fn new(
        config: Arc<RouterConfig>,
        topology: Arc<TopologyHandle>,
        sink: Arc<dyn EventSink>,
        access: Arc<dyn ShardAccess>,
        copier: Arc<dyn DataCopier>,
        probe: Option<Arc<dyn HealthProbe>>,
    ) -> Self {
        let router = Arc::new(ShardRouter::new(topology.clone(), config.clone(), sink.clone()));
        let indexes = Arc::new(GlobalIndexCoordinator::new(topology.clone(), sink.clone()));
        let rebalancer = Arc::new(Rebalancer::new(
            topology.clone(),
            config.clone(),
            copier,
            sink.clone(),
        ));
        let executor = QueryExecutor::new(
            access.clone(),
            sink,
            config.max_parallelism,
            config.step_timeout(),
        );
        Self {
            config,
            topology,
            router,
            indexes,
            rebalancer,
            executor,
            access,
            probe,
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn topology(&self) -> &Arc<TopologyHandle> {
        &self.topology
    }

    pub fn router(&self) -> &Arc<ShardRouter> {
        &self.router
    }

    pub fn indexes(&self) -> &Arc<GlobalIndexCoordinator> {
        &self.indexes
    }

    pub fn rebalancer(&self) -> &Arc<Rebalancer> {
        &self.rebalancer
    }

    pub fn add_shard(&self, config: ShardConfig) -> ConfigResult<()> {
        self.router.add_shard(config)
    }

    pub fn remove_shard(&self, id: &ShardId) -> ConfigResult<Shard> {
        self.router.remove_shard(id)
    }

    pub fn select_shard(&self, key: &str, op: Operation, options: &SelectOptions) -> RouterResult<ShardId> {
        self.router.select_shard(key, op, options)
    }

    pub fn route_query(&self, query: &AnalyzedQuery, params: &[Value]) -> RouterResult<RoutingDecision> {
        self.router.route_query(query, params)
    }

    /// Plans and runs a query against the current topology.
    ///
    /// Writes queue maintenance of the table's asynchronous indexes once the
    /// base write succeeded; a write failing on any shard is an error.
    pub async fn execute_cross_shard_query(
        &self,
        query: &AnalyzedQuery,
        params: &[Value],
        options: &QueryOptions,
    ) -> Result<QueryResult, QueryError> {
        let plan = {
            let topology = self.topology.load();
            let mut planner = QueryPlanner::new(&topology, &self.config);
            if let Some(region) = &options.preferred_region {
                planner = planner.with_select_options(SelectOptions::in_region(region.clone()));
            }
            planner.plan(query, params, options.consistency)?
        };
        debug!(
            steps = plan.steps().len(),
            estimated_cost = plan.estimated_cost(),
            requires_transaction = plan.requires_transaction(),
            "Query planned"
        );
        let result = self.executor.execute(plan, &query.statement, params, options).await?;
        if result
            .optimizations
            .iter()
            .any(|opt| matches!(opt, Optimization::IndexRouting(_)))
        {
            self.indexes.record_lookup();
        }
        if query.kind.is_write() && !result.partial {
            let queued = self.indexes.enqueue_async_updates(query, params);
            if queued > 0 {
                debug!(queued, "Asynchronous index updates queued");
            }
        }
        Ok(result)
    }

    pub fn create_global_secondary_index(&self, definition: IndexDefinition) -> IndexResult<IndexId> {
        self.indexes.create_index(definition)
    }

    /// Plans a rebalance; run it with
    /// [`Rebalancer::execute_plan()`](crate::rebalance::Rebalancer::execute_plan).
    pub fn initiate_rebalancing(&self) -> RebalanceResult<PlanId> {
        self.rebalancer.initiate_rebalancing()
    }

    /// Starts the periodic health, rebalance and index loops.
    ///
    /// Requires a health probe; must be called from within a Tokio runtime.
    pub fn start_background_tasks(&self) -> ConfigResult<BackgroundTasks> {
        let probe = self
            .probe
            .clone()
            .ok_or(ConfigError::MissingComponent("health probe"))?;
        let health = Arc::new(HealthMonitor::new(self.router.clone(), probe));
        Ok(BackgroundTasks::spawn(
            health,
            self.rebalancer.clone(),
            self.indexes.clone(),
            self.access.clone(),
        ))
    }
}
