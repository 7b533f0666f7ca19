use {
    super::{AggregateExpr, JoinSpec, OrderBy, Predicate},
    crate::{
        error::QueryError,
        index::IndexId,
        shard::{ConsistencyLevel, ShardId},
    },
    std::collections::VecDeque,
};

/// Step handle, equal to the step's position in the plan.
pub type StepId = usize;

/// How a shard leg reaches its data.
#[derive(Debug, Clone, PartialEq)]
pub enum AccessPath {
    /// Base table scan/lookup on the shard.
    Table,
    /// Lookup through global secondary index partitions hosted on the shard.
    Index { index: IndexId, partitions: Vec<u32> },
    /// Synchronous maintenance of an index partition as part of a write.
    IndexWrite { index: IndexId, partition: u32 },
}

/// Combination of rows coming from several steps.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeStrategy {
    Concat,
    HashJoin {
        join: JoinSpec,
        left: Vec<StepId>,
        right: Vec<StepId>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepKind {
    ShardQuery {
        shard: ShardId,
        /// Table the leg reads, when the query touches several.
        table: Option<String>,
        access: AccessPath,
        /// Shard returns partial aggregates instead of raw rows.
        partial_aggregate: bool,
        /// Row limit the shard may apply locally.
        limit: Option<usize>,
    },
    Merge(MergeStrategy),
    Aggregate {
        group_by: Vec<String>,
        aggregates: Vec<AggregateExpr>,
        /// Inputs are per-shard partial aggregates rather than raw rows.
        partial: bool,
    },
    Sort {
        order_by: Vec<OrderBy>,
        limit: Option<usize>,
    },
    Filter {
        predicates: Vec<Predicate>,
    },
}

impl StepKind {
    pub fn name(&self) -> &'static str {
        match self {
            StepKind::ShardQuery { .. } => "shard_query",
            StepKind::Merge(_) => "merge",
            StepKind::Aggregate { .. } => "aggregate",
            StepKind::Sort { .. } => "sort",
            StepKind::Filter { .. } => "filter",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionStep {
    pub id: StepId,
    pub kind: StepKind,
    pub dependencies: Vec<StepId>,
    /// Estimated cost, also used as the latency estimate of the step.
    pub cost: f64,
}

impl ExecutionStep {
    /// Shards the step is dispatched to.
    pub fn target(&self) -> Option<&ShardId> {
        match &self.kind {
            StepKind::ShardQuery { shard, .. } => Some(shard),
            _ => None,
        }
    }

    pub fn is_shard_query(&self) -> bool {
        matches!(self.kind, StepKind::ShardQuery { .. })
    }
}

/// Planner decision recorded on the plan.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Optimization {
    /// Shard key predicates limited the fan-out.
    ShardKeyPruning,
    /// Legs were routed through a global secondary index.
    IndexRouting(IndexId),
    /// The index holds every projected column.
    CoveringIndex(IndexId),
    /// Shards pre-aggregate before the final fold.
    PartialAggregation,
    /// Limit is applied on the shards as well as after the merge.
    LimitPushdown,
}

/// Incrementally assembles plan steps.
#[derive(Debug, Default)]
pub struct PlanBuilder {
    steps: Vec<ExecutionStep>,
}

impl PlanBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, kind: StepKind, dependencies: Vec<StepId>, cost: f64) -> StepId {
        let id = self.steps.len();
        self.steps.push(ExecutionStep {
            id,
            kind,
            dependencies,
            cost,
        });
        id
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn finish(
        self,
        output: StepId,
        consistency: ConsistencyLevel,
        requires_transaction: bool,
        optimizations: Vec<Optimization>,
    ) -> Result<ExecutionPlan, QueryError> {
        ExecutionPlan::new(self.steps, output, consistency, requires_transaction, optimizations)
    }
}

/// Dependency-ordered execution plan.
///
/// Steps form a DAG. Steps with no dependencies are eligible immediately;
/// every other step becomes eligible once all of its dependencies are done.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionPlan {
    steps: Vec<ExecutionStep>,
    output: StepId,
    consistency: ConsistencyLevel,
    requires_transaction: bool,
    writes: bool,
    optimizations: Vec<Optimization>,
    estimated_cost: f64,
    estimated_latency: f64,
}

impl ExecutionPlan {
    /// Validates the DAG and computes estimates.
    ///
    /// Step ids must equal their position, dependencies must exist and the
    /// graph must be acyclic.
    pub fn new(
        steps: Vec<ExecutionStep>,
        output: StepId,
        consistency: ConsistencyLevel,
        requires_transaction: bool,
        optimizations: Vec<Optimization>,
    ) -> Result<Self, QueryError> {
        if steps.is_empty() {
            return Err(QueryError::InvalidPlan("plan has no steps".into()));
        }
        if output >= steps.len() {
            return Err(QueryError::InvalidPlan(format!("output step {output} does not exist")));
        }
        for (idx, step) in steps.iter().enumerate() {
            if step.id != idx {
                return Err(QueryError::InvalidPlan(format!(
                    "step {} stored at position {idx}",
                    step.id
                )));
            }
            if let Some(dep) = step.dependencies.iter().find(|dep| **dep >= steps.len()) {
                return Err(QueryError::InvalidPlan(format!(
                    "step {idx} depends on missing step {dep}"
                )));
            }
        }

        let order = topological_order(&steps)
            .ok_or_else(|| QueryError::InvalidPlan("dependency cycle".into()))?;

        let estimated_cost = steps.iter().map(|step| step.cost).sum();
        let mut finish = vec![0.0f64; steps.len()];
        for idx in order {
            let step = &steps[idx];
            let ready = step
                .dependencies
                .iter()
                .map(|dep| finish[*dep])
                .fold(0.0, f64::max);
            finish[idx] = ready + step.cost;
        }
        let estimated_latency = finish.into_iter().fold(0.0, f64::max);

        Ok(Self {
            steps,
            output,
            consistency,
            requires_transaction,
            writes: false,
            optimizations,
            estimated_cost,
            estimated_latency,
        })
    }

    /// Marks the plan as modifying data.
    pub(crate) fn into_write(mut self) -> Self {
        self.writes = true;
        self
    }

    pub fn steps(&self) -> &[ExecutionStep] {
        &self.steps
    }

    pub fn step(&self, id: StepId) -> Option<&ExecutionStep> {
        self.steps.get(id)
    }

    /// Step whose output is the query result.
    pub fn output(&self) -> StepId {
        self.output
    }

    pub fn consistency(&self) -> ConsistencyLevel {
        self.consistency
    }

    pub fn requires_transaction(&self) -> bool {
        self.requires_transaction
    }

    /// Whether the plan modifies data; a failed leg can never be dropped.
    pub fn is_write(&self) -> bool {
        self.writes
    }

    pub fn optimizations(&self) -> &[Optimization] {
        &self.optimizations
    }

    /// Sum of step costs, i.e. cost of running everything serially.
    pub fn estimated_cost(&self) -> f64 {
        self.estimated_cost
    }

    /// Length of the critical path: parallel legs overlap, dependent steps
    /// add up.
    pub fn estimated_latency(&self) -> f64 {
        self.estimated_latency
    }

    /// Distinct shards targeted by the plan, in step order.
    pub fn shards(&self) -> Vec<ShardId> {
        let mut shards: Vec<ShardId> = Vec::new();
        for shard in self.steps.iter().filter_map(ExecutionStep::target) {
            if !shards.contains(shard) {
                shards.push(shard.clone());
            }
        }
        shards
    }

    /// Steps depending on each step.
    pub fn dependents(&self) -> Vec<Vec<StepId>> {
        let mut dependents = vec![Vec::new(); self.steps.len()];
        for step in &self.steps {
            for dep in &step.dependencies {
                dependents[*dep].push(step.id);
            }
        }
        dependents
    }
}

/// Kahn's algorithm; `None` when the graph has a cycle.
fn topological_order(steps: &[ExecutionStep]) -> Option<Vec<StepId>> {
    let mut pending: Vec<usize> = steps.iter().map(|s| s.dependencies.len()).collect();
    let mut dependents = vec![Vec::new(); steps.len()];
    for step in steps {
        for dep in &step.dependencies {
            dependents[*dep].push(step.id);
        }
    }

    let mut ready: VecDeque<StepId> = (0..steps.len()).filter(|idx| pending[*idx] == 0).collect();
    let mut order = Vec::with_capacity(steps.len());
    while let Some(idx) = ready.pop_front() {
        order.push(idx);
        for next in &dependents[idx] {
            pending[*next] -= 1;
            if pending[*next] == 0 {
                ready.push_back(*next);
            }
        }
    }
    (order.len() == steps.len()).then_some(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leg(shard: &str) -> StepKind {
        StepKind::ShardQuery {
            shard: shard.into(),
            table: None,
            access: AccessPath::Table,
            partial_aggregate: false,
            limit: None,
        }
    }

    #[test]
    fn estimates() {
        let mut builder = PlanBuilder::new();
        let a = builder.push(leg("a"), vec![], 10.0);
        let b = builder.push(leg("b"), vec![], 12.0);
        let merge = builder.push(StepKind::Merge(MergeStrategy::Concat), vec![a, b], 2.0);
        let sort = builder.push(
            StepKind::Sort {
                order_by: vec![],
                limit: Some(5),
            },
            vec![merge],
            3.0,
        );
        let plan = builder
            .finish(sort, ConsistencyLevel::Eventual, false, vec![])
            .unwrap();

        assert_eq!(plan.estimated_cost(), 27.0);
        assert_eq!(plan.estimated_latency(), 17.0);
        assert_eq!(plan.shards(), vec![ShardId::from("a"), ShardId::from("b")]);
        assert_eq!(plan.dependents()[a], vec![merge]);
    }

    #[test]
    fn cycles_rejected() {
        let steps = vec![
            ExecutionStep {
                id: 0,
                kind: StepKind::Merge(MergeStrategy::Concat),
                dependencies: vec![1],
                cost: 1.0,
            },
            ExecutionStep {
                id: 1,
                kind: StepKind::Merge(MergeStrategy::Concat),
                dependencies: vec![0],
                cost: 1.0,
            },
        ];
        assert_eq!(
            ExecutionPlan::new(steps, 0, ConsistencyLevel::Strong, false, vec![]),
            Err(QueryError::InvalidPlan("dependency cycle".into()))
        );
    }

    #[test]
    fn dangling_dependency_rejected() {
        let mut builder = PlanBuilder::new();
        builder.push(StepKind::Merge(MergeStrategy::Concat), vec![4], 1.0);
        assert!(matches!(
            builder.finish(0, ConsistencyLevel::Strong, false, vec![]),
            Err(QueryError::InvalidPlan(_))
        ));
    }
}
