use {
    super::{
        AnalyzedQuery, CombineKind, Value,
        plan::{AccessPath, ExecutionPlan, MergeStrategy, Optimization, PlanBuilder, StepId, StepKind},
        value_key,
    },
    crate::{
        config::RouterConfig,
        error::{QueryError, RouterError},
        index::{GlobalSecondaryIndex, UpdateMode},
        registry::SelectOptions,
        router::select_for_key,
        shard::{ConsistencyLevel, Operation, ShardId},
        topology::Topology,
    },
    std::collections::BTreeMap,
};

/// Base cost of a shard leg, scaled up by the shard's QPS utilization.
const SHARD_QUERY_COST: f64 = 10.0;
const CONCAT_COST: f64 = 1.0;
const HASH_JOIN_COST: f64 = 5.0;
const AGGREGATE_COST: f64 = 2.0;
const SORT_COST: f64 = 3.0;
const FILTER_COST: f64 = 1.0;

/// Leg to be planned: target shard and how it reads.
type Leg = (ShardId, AccessPath);

/// Turns analyzed queries into execution plans against one topology
/// snapshot.
pub struct QueryPlanner<'a> {
    topology: &'a Topology,
    default_consistency: ConsistencyLevel,
    replica_candidates: usize,
    select: SelectOptions,
}

impl<'a> QueryPlanner<'a> {
    pub fn new(topology: &'a Topology, config: &RouterConfig) -> Self {
        Self {
            topology,
            default_consistency: config.default_consistency,
            replica_candidates: config.replica_candidates,
            select: SelectOptions {
                preferred_region: config.preferred_region.clone(),
            },
        }
    }

    pub fn with_select_options(mut self, select: SelectOptions) -> Self {
        self.select = select;
        self
    }

    /// Plans the query.
    ///
    /// `requested` overrides the consistency carried by the query, which in
    /// turn overrides the router default.
    pub fn plan(
        &self,
        query: &AnalyzedQuery,
        params: &[Value],
        requested: Option<ConsistencyLevel>,
    ) -> Result<ExecutionPlan, QueryError> {
        validate(query)?;
        if self.topology.ring.is_empty() {
            return Err(RouterError::NoAvailableShards.into());
        }
        let consistency = requested
            .or(query.consistency)
            .unwrap_or(self.default_consistency);

        if query.kind.is_write() {
            self.plan_write(query, params, consistency)
        } else if !query.joins.is_empty() {
            self.plan_join(query, params, consistency)
        } else {
            self.plan_read(query, params, consistency)
        }
    }

    fn plan_read(
        &self,
        query: &AnalyzedQuery,
        params: &[Value],
        consistency: ConsistencyLevel,
    ) -> Result<ExecutionPlan, QueryError> {
        let mut optimizations = Vec::new();
        let legs: Vec<Leg> = match self.pinned_shards(query, params, Operation::Read)? {
            Some(shards) => {
                optimizations.push(Optimization::ShardKeyPruning);
                shards.into_iter().map(|s| (s, AccessPath::Table)).collect()
            }
            None => match self.index_legs(query, params, consistency) {
                Some((index, legs)) => {
                    optimizations.push(Optimization::IndexRouting(index.id().clone()));
                    if index.covers(&query.projection) {
                        optimizations.push(Optimization::CoveringIndex(index.id().clone()));
                    }
                    legs
                }
                None => self
                    .fan_out(Operation::Read, consistency)?
                    .into_iter()
                    .map(|s| (s, AccessPath::Table))
                    .collect(),
            },
        };

        let multi = legs.len() > 1;
        let aggregate = multi && query.combine == CombineKind::Aggregate;
        let pushdown = multi && !aggregate && query.having.is_empty() && query.limit.is_some();
        if aggregate {
            optimizations.push(Optimization::PartialAggregation);
        }
        if pushdown {
            optimizations.push(Optimization::LimitPushdown);
        }

        let mut builder = PlanBuilder::new();
        let ids: Vec<StepId> = legs
            .into_iter()
            .map(|(shard, access)| {
                let cost = self.leg_cost(&shard);
                builder.push(
                    StepKind::ShardQuery {
                        shard,
                        table: None,
                        access,
                        partial_aggregate: aggregate,
                        limit: query.limit.filter(|_| pushdown),
                    },
                    vec![],
                    cost,
                )
            })
            .collect();

        // A single shard answers the statement on its own.
        let output = if multi {
            let combined = if aggregate {
                builder.push(
                    StepKind::Aggregate {
                        group_by: query.group_by.clone(),
                        aggregates: query.aggregates.clone(),
                        partial: true,
                    },
                    ids,
                    AGGREGATE_COST,
                )
            } else {
                builder.push(StepKind::Merge(MergeStrategy::Concat), ids, CONCAT_COST)
            };
            finishing_steps(&mut builder, query, combined)
        } else {
            ids[0]
        };

        builder.finish(output, consistency, false, optimizations)
    }

    /// One leg per (shard, table); legs are combined by hash joins chained in
    /// declaration order.
    fn plan_join(
        &self,
        query: &AnalyzedQuery,
        params: &[Value],
        consistency: ConsistencyLevel,
    ) -> Result<ExecutionPlan, QueryError> {
        let mut builder = PlanBuilder::new();
        let mut optimizations = Vec::new();
        let mut legs_by_table: BTreeMap<&str, Vec<StepId>> = BTreeMap::new();

        for (position, table) in query.tables.iter().enumerate() {
            // The shard key belongs to the first table.
            let pinned = match position {
                0 => self.pinned_shards(query, params, Operation::Read)?,
                _ => None,
            };
            let shards = match pinned {
                Some(shards) => {
                    optimizations.push(Optimization::ShardKeyPruning);
                    shards
                }
                None => self.fan_out(Operation::Read, consistency)?,
            };
            let ids = shards
                .into_iter()
                .map(|shard| {
                    let cost = self.leg_cost(&shard);
                    builder.push(
                        StepKind::ShardQuery {
                            shard,
                            table: Some(table.clone()),
                            access: AccessPath::Table,
                            partial_aggregate: false,
                            limit: None,
                        },
                        vec![],
                        cost,
                    )
                })
                .collect();
            legs_by_table.insert(table.as_str(), ids);
        }

        let mut previous: Option<StepId> = None;
        for join in &query.joins {
            let left = match previous {
                Some(step) => vec![step],
                None => legs_by_table
                    .get(join.left_table.as_str())
                    .cloned()
                    .unwrap_or_default(),
            };
            let right = legs_by_table
                .get(join.right_table.as_str())
                .cloned()
                .unwrap_or_default();
            let dependencies = left.iter().chain(&right).copied().collect();
            previous = Some(builder.push(
                StepKind::Merge(MergeStrategy::HashJoin {
                    join: join.clone(),
                    left,
                    right,
                }),
                dependencies,
                HASH_JOIN_COST,
            ));
        }
        let joined = previous.ok_or_else(|| QueryError::InvalidQuery("join without join spec".into()))?;

        let combined = if query.aggregates.is_empty() && query.group_by.is_empty() {
            joined
        } else {
            builder.push(
                StepKind::Aggregate {
                    group_by: query.group_by.clone(),
                    aggregates: query.aggregates.clone(),
                    partial: false,
                },
                vec![joined],
                AGGREGATE_COST,
            )
        };
        let output = finishing_steps(&mut builder, query, combined);
        builder.finish(output, consistency, false, optimizations)
    }

    /// Base legs plus synchronous index maintenance legs.
    ///
    /// Asynchronous indexes are not part of the plan; they are queued once
    /// the write succeeds.
    fn plan_write(
        &self,
        query: &AnalyzedQuery,
        params: &[Value],
        consistency: ConsistencyLevel,
    ) -> Result<ExecutionPlan, QueryError> {
        let mut optimizations = Vec::new();
        let table = &query.tables[0];
        let base = match self.pinned_shards(query, params, Operation::Write)? {
            Some(shards) => {
                optimizations.push(Optimization::ShardKeyPruning);
                shards
            }
            None => self.fan_out(Operation::Write, ConsistencyLevel::Strong)?,
        };

        let mut legs: Vec<(ShardId, Option<String>, AccessPath)> = base
            .into_iter()
            .map(|shard| (shard, None, AccessPath::Table))
            .collect();
        for index in self.topology.indexes.for_table(table) {
            if index.definition.update_mode != UpdateMode::Sync {
                continue;
            }
            for ordinal in index.partitions_for(query, params) {
                let Some(partition) = index.partition(ordinal) else {
                    continue;
                };
                self.require(&partition.shard, Operation::Write)?;
                legs.push((
                    partition.shard.clone(),
                    Some(table.clone()),
                    AccessPath::IndexWrite {
                        index: index.id().clone(),
                        partition: ordinal,
                    },
                ));
            }
        }

        let mut shards: Vec<&ShardId> = legs.iter().map(|(shard, ..)| shard).collect();
        shards.sort();
        shards.dedup();
        let requires_transaction = shards.len() > 1;

        let mut builder = PlanBuilder::new();
        let ids: Vec<StepId> = legs
            .into_iter()
            .map(|(shard, table, access)| {
                let cost = self.leg_cost(&shard);
                builder.push(
                    StepKind::ShardQuery {
                        shard,
                        table,
                        access,
                        partial_aggregate: false,
                        limit: None,
                    },
                    vec![],
                    cost,
                )
            })
            .collect();
        let output = match ids.as_slice() {
            [single] => *single,
            _ => builder.push(StepKind::Merge(MergeStrategy::Concat), ids, CONCAT_COST),
        };
        builder
            .finish(output, consistency, requires_transaction, optimizations)
            .map(ExecutionPlan::into_write)
    }

    /// Shards selected by shard key values the query pins, if any.
    fn pinned_shards(
        &self,
        query: &AnalyzedQuery,
        params: &[Value],
        op: Operation,
    ) -> Result<Option<Vec<ShardId>>, QueryError> {
        let Some(values) = query
            .shard_key
            .as_deref()
            .and_then(|column| query.pinned_values(column, params))
        else {
            return Ok(None);
        };
        if values.is_empty() {
            return Err(QueryError::InvalidQuery("shard key pinned to an empty set".into()));
        }

        let mut shards: Vec<ShardId> = Vec::new();
        for value in values {
            let shard = select_for_key(
                self.topology,
                &value_key(value),
                op,
                self.replica_candidates,
                &self.select,
            )?;
            if !shards.contains(&shard) {
                shards.push(shard);
            }
        }
        Ok(Some(shards))
    }

    /// Every shard owning part of the ring.
    ///
    /// Owners unable to serve the operation are skipped when eventual
    /// consistency allows it; otherwise the query is refused.
    fn fan_out(&self, op: Operation, consistency: ConsistencyLevel) -> Result<Vec<ShardId>, QueryError> {
        let owners: Vec<&ShardId> = self.topology.ring.shards().collect();
        let (serving, unavailable): (Vec<&ShardId>, Vec<&ShardId>) = owners
            .iter()
            .partition(|id| self.topology.registry.get(id).is_some_and(|s| s.accepts(op)));

        if serving.is_empty() || (consistency == ConsistencyLevel::Strong && !unavailable.is_empty()) {
            return Err(RouterError::NoHealthyShards(owners.len()).into());
        }
        Ok(serving.into_iter().cloned().collect())
    }

    fn require(&self, shard: &ShardId, op: Operation) -> Result<(), QueryError> {
        match self.topology.registry.get(shard) {
            Some(s) if s.accepts(op) => Ok(()),
            _ => Err(RouterError::NoHealthyShards(1).into()),
        }
    }

    /// Legs reading through the applicable index touching the fewest shards.
    fn index_legs(
        &self,
        query: &AnalyzedQuery,
        params: &[Value],
        consistency: ConsistencyLevel,
    ) -> Option<(&'a GlobalSecondaryIndex, Vec<Leg>)> {
        if query.tables.len() != 1 {
            return None;
        }
        self.topology
            .indexes
            .find_applicable_indexes(query, consistency)
            .into_iter()
            .filter_map(|index| {
                let mut by_shard: BTreeMap<ShardId, Vec<u32>> = BTreeMap::new();
                for ordinal in index.partitions_for(query, params) {
                    let partition = index.partition(ordinal)?;
                    by_shard
                        .entry(partition.shard.clone())
                        .or_default()
                        .push(ordinal);
                }
                if by_shard.is_empty()
                    || by_shard.keys().any(|shard| self.require(shard, Operation::Read).is_err())
                {
                    return None;
                }
                let legs = by_shard
                    .into_iter()
                    .map(|(shard, partitions)| {
                        let access = AccessPath::Index {
                            index: index.id().clone(),
                            partitions,
                        };
                        (shard, access)
                    })
                    .collect::<Vec<_>>();
                Some((index, legs))
            })
            .min_by_key(|(_, legs)| legs.len())
    }

    fn leg_cost(&self, shard: &ShardId) -> f64 {
        let utilization = self
            .topology
            .registry
            .get(shard)
            .map_or(0.0, |s| s.qps_utilization());
        SHARD_QUERY_COST * (1.0 + utilization)
    }
}

/// Post-combine filter (`HAVING`) and sort/limit, each on top of the
/// previous tail.
fn finishing_steps(builder: &mut PlanBuilder, query: &AnalyzedQuery, mut tail: StepId) -> StepId {
    if !query.having.is_empty() {
        tail = builder.push(
            StepKind::Filter {
                predicates: query.having.clone(),
            },
            vec![tail],
            FILTER_COST,
        );
    }
    if !query.order_by.is_empty() || query.limit.is_some() {
        tail = builder.push(
            StepKind::Sort {
                order_by: query.order_by.clone(),
                limit: query.limit,
            },
            vec![tail],
            SORT_COST,
        );
    }
    tail
}

fn validate(query: &AnalyzedQuery) -> Result<(), QueryError> {
    if query.tables.is_empty() {
        return Err(QueryError::InvalidQuery("query names no table".into()));
    }
    for join in &query.joins {
        for table in [&join.left_table, &join.right_table] {
            if !query.tables.contains(table) {
                return Err(QueryError::InvalidQuery(format!(
                    "join references unknown table {table}"
                )));
            }
        }
    }
    if query.combine == CombineKind::Aggregate && query.aggregates.is_empty() && query.group_by.is_empty()
    {
        return Err(QueryError::InvalidQuery("aggregate query without aggregates".into()));
    }
    if query.kind.is_write() && !query.joins.is_empty() {
        return Err(QueryError::InvalidQuery("joins are only supported in reads".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            index::{IndexColumn, IndexDefinition, IndexSharding},
            query::{AggregateExpr, AggregateFn, JoinSpec, Operand, Predicate, QueryKind},
            shard::{ConnectionInfo, Shard, ShardCapacity, ShardConfig, ShardStatus},
        },
        serde_json::json,
    };

    fn topology(shards: &[&str]) -> Topology {
        let mut topology = Topology::default();
        for id in shards {
            let config = ShardConfig::new(
                *id,
                "eu",
                ConnectionInfo::new("db", 5432),
                ShardCapacity::new(100, 1 << 30, 1000),
            );
            topology.ring.add_shard(&config.id, 64, 1).unwrap();
            topology.registry.insert(Shard::new(config, 64)).unwrap();
        }
        topology
    }

    fn planner(topology: &Topology) -> QueryPlanner<'_> {
        QueryPlanner::new(topology, &RouterConfig::default())
    }

    fn users() -> AnalyzedQuery {
        AnalyzedQuery::select("SELECT * FROM users", "users").with_shard_key("id")
    }

    #[test]
    fn shard_key_equality_pins_one_shard() {
        let topology = topology(&["s1", "s2", "s3"]);
        let query = users().with_predicate(Predicate::eq("id", Operand::Param(0)));
        let plan = planner(&topology).plan(&query, &[json!(42)], None).unwrap();

        assert_eq!(plan.steps().len(), 1);
        assert_eq!(plan.shards(), vec![topology.ring.primary("42").unwrap().clone()]);
        assert_eq!(plan.optimizations(), &[Optimization::ShardKeyPruning]);
        assert!(!plan.requires_transaction());
    }

    #[test]
    fn scatter_gather_fans_out() {
        let topology = topology(&["s1", "s2", "s3"]);
        let query = users().with_order_by("name", false).with_limit(10);
        let plan = planner(&topology).plan(&query, &[], None).unwrap();

        let legs = plan.steps().iter().filter(|s| s.is_shard_query()).count();
        assert_eq!(legs, 3);
        assert!(plan.optimizations().contains(&Optimization::LimitPushdown));

        let output = plan.step(plan.output()).unwrap();
        assert_eq!(output.kind.name(), "sort");
        // Legs overlap, merge and sort add up: 10 + 1 + 3.
        assert!((plan.estimated_latency() - 14.0).abs() < 1e-9);
        assert!((plan.estimated_cost() - 34.0).abs() < 1e-9);
    }

    #[test]
    fn aggregate_uses_partial_aggregation() {
        let topology = topology(&["s1", "s2"]);
        let query = users()
            .with_aggregate(AggregateExpr::new(AggregateFn::Count, None, "n"))
            .with_group_by("region")
            .with_having(Predicate::new("n", crate::query::PredicateOp::Gt(json!(5).into())));
        let plan = planner(&topology).plan(&query, &[], None).unwrap();

        assert!(plan.steps().iter().all(|step| match &step.kind {
            StepKind::ShardQuery {
                partial_aggregate, ..
            } => *partial_aggregate,
            _ => true,
        }));
        let kinds: Vec<&str> = plan.steps().iter().map(|s| s.kind.name()).collect();
        assert_eq!(kinds, vec!["shard_query", "shard_query", "aggregate", "filter"]);
        assert!(plan.optimizations().contains(&Optimization::PartialAggregation));
    }

    #[test]
    fn join_legs_per_table() {
        let topology = topology(&["s1", "s2"]);
        let query = users().with_join(JoinSpec {
            left_table: "users".into(),
            left_column: "id".into(),
            right_table: "orders".into(),
            right_column: "user_id".into(),
        });
        let plan = planner(&topology).plan(&query, &[], None).unwrap();

        let legs = plan.steps().iter().filter(|s| s.is_shard_query()).count();
        assert_eq!(legs, 4);
        let output = plan.step(plan.output()).unwrap();
        assert!(matches!(
            &output.kind,
            StepKind::Merge(MergeStrategy::HashJoin { left, right, .. }) if left.len() == 2 && right.len() == 2
        ));
    }

    #[test]
    fn cross_shard_write_requires_transaction() {
        let topology = topology(&["s1", "s2", "s3"]);
        let single = AnalyzedQuery::new(QueryKind::Update, "UPDATE users", "users")
            .with_shard_key("id")
            .with_predicate(Predicate::eq("id", json!(7)));
        assert!(!planner(&topology).plan(&single, &[], None).unwrap().requires_transaction());

        let broad = AnalyzedQuery::new(QueryKind::Update, "UPDATE users", "users");
        assert!(planner(&topology).plan(&broad, &[], None).unwrap().requires_transaction());
    }

    #[test]
    fn sync_index_adds_write_legs() {
        let mut topology = topology(&["s1", "s2", "s3"]);
        let definition = IndexDefinition::new("by_email", "users", IndexSharding::Hash { partitions: 16 })
            .with_column(IndexColumn::hash("email"));
        topology.indexes.create(definition, &topology.ring).unwrap();

        let insert = AnalyzedQuery::new(QueryKind::Insert, "INSERT", "users")
            .with_shard_key("id")
            .with_assignment("id", json!(1))
            .with_assignment("email", json!("ada@example.com"));
        let plan = planner(&topology).plan(&insert, &[], None).unwrap();

        let index_legs: Vec<_> = plan
            .steps()
            .iter()
            .filter(|s| matches!(&s.kind, StepKind::ShardQuery { access: AccessPath::IndexWrite { .. }, .. }))
            .collect();
        assert_eq!(index_legs.len(), 1);
        assert_eq!(plan.requires_transaction(), plan.shards().len() > 1);
    }

    #[test]
    fn index_routes_reads_without_shard_key() {
        let mut topology = topology(&["s1", "s2", "s3"]);
        let definition = IndexDefinition::new("by_email", "users", IndexSharding::Hash { partitions: 8 })
            .with_column(IndexColumn::hash("email"))
            .with_column(IndexColumn::include("name"));
        let id = topology.indexes.create(definition, &topology.ring).unwrap();

        let query = users()
            .with_predicate(Predicate::eq("email", json!("ada@example.com")))
            .with_projection(&["email", "name"]);

        // Building indexes are not used.
        let plan = planner(&topology).plan(&query, &[], None).unwrap();
        assert_eq!(plan.shards().len(), 3);

        topology.indexes.activate(&id).unwrap();
        let plan = planner(&topology).plan(&query, &[], None).unwrap();
        assert_eq!(plan.shards().len(), 1);
        assert!(plan.optimizations().contains(&Optimization::IndexRouting(id.clone())));
        assert!(plan.optimizations().contains(&Optimization::CoveringIndex(id)));
    }

    #[test]
    fn unavailable_owners() {
        let mut topology = topology(&["s1", "s2"]);
        topology.registry.set_status(&"s2".into(), ShardStatus::Failed);
        let query = users();

        let eventual = planner(&topology).plan(&query, &[], None).unwrap();
        assert_eq!(eventual.shards(), vec![ShardId::from("s1")]);

        assert_eq!(
            planner(&topology).plan(&query, &[], Some(ConsistencyLevel::Strong)),
            Err(QueryError::Unavailable(RouterError::NoHealthyShards(2)))
        );
        assert_eq!(
            planner(&Topology::default()).plan(&query, &[], None),
            Err(QueryError::Unavailable(RouterError::NoAvailableShards))
        );
    }
}
