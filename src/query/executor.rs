use {
    super::{
        Row, Value,
        merge::{aggregate_rows, concat, filter_rows, final_aggregate, hash_join, sort_rows},
        plan::{AccessPath, ExecutionPlan, MergeStrategy, Optimization, StepId, StepKind},
    },
    crate::{
        error::{QueryError, ShardError},
        events::{Event, EventSink},
        shard::{ConsistencyLevel, ShardId},
    },
    async_trait::async_trait,
    std::{collections::VecDeque, sync::Arc, time::Duration},
    tokio::{
        sync::{Semaphore, watch},
        task::JoinSet,
        time::timeout,
    },
    tracing::{debug, warn},
};

/// Work sent to a single shard.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardRequest {
    pub shard: ShardId,
    /// Statement as handed over by the analyzer.
    pub statement: String,
    pub params: Vec<Value>,
    pub table: Option<String>,
    pub access: AccessPath,
    /// Shard should return per-group partial aggregates.
    pub partial_aggregate: bool,
    pub limit: Option<usize>,
    pub consistency: ConsistencyLevel,
}

/// Transport to shard nodes.
#[async_trait]
pub trait ShardAccess: Send + Sync {
    async fn execute(&self, request: ShardRequest) -> Result<Vec<Row>, ShardError>;
}

/// Cooperative cancellation of a running query.
///
/// Legs not dispatched yet are skipped; dispatched legs run to completion.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`cancel()`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// Per-query execution knobs; unset fields use the router configuration.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub consistency: Option<ConsistencyLevel>,
    pub timeout: Option<Duration>,
    pub max_parallelism: Option<usize>,
    pub preferred_region: Option<String>,
    pub cancel: Option<CancelHandle>,
}

impl QueryOptions {
    pub fn with_consistency(mut self, consistency: ConsistencyLevel) -> Self {
        self.consistency = Some(consistency);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_parallelism(mut self, max: usize) -> Self {
        self.max_parallelism = Some(max);
        self
    }

    pub fn with_preferred_region(mut self, region: impl Into<String>) -> Self {
        self.preferred_region = Some(region.into());
        self
    }

    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

#[derive(Debug, Clone)]
pub struct QueryResult {
    pub rows: Vec<Row>,
    /// Shards whose legs returned successfully.
    pub shards_queried: Vec<ShardId>,
    pub plan: ExecutionPlan,
    /// Some legs failed or were skipped; rows cover the remaining shards.
    pub partial: bool,
    pub cancelled: bool,
    pub failed_shards: Vec<ShardId>,
    pub optimizations: Vec<Optimization>,
}

/// Runs execution plans.
///
/// Shard legs run concurrently, bounded by a semaphore; every other step is
/// a pure transform run inline once all of its dependencies are done.
pub struct QueryExecutor {
    access: Arc<dyn ShardAccess>,
    sink: Arc<dyn EventSink>,
    max_parallelism: usize,
    step_timeout: Duration,
}

type LegOutcome = (StepId, ShardId, Result<Vec<Row>, ShardError>);

/// Bookkeeping of a single plan run.
struct Run<'a> {
    plan: &'a ExecutionPlan,
    params: &'a [Value],
    outputs: Vec<Option<Vec<Row>>>,
    waiting_on: Vec<usize>,
    dependents: Vec<Vec<StepId>>,
    ready: VecDeque<StepId>,
}

impl<'a> Run<'a> {
    fn new(plan: &'a ExecutionPlan, params: &'a [Value]) -> Self {
        let waiting_on: Vec<usize> = plan.steps().iter().map(|s| s.dependencies.len()).collect();
        let ready = (0..waiting_on.len()).filter(|idx| waiting_on[*idx] == 0).collect();
        Self {
            plan,
            params,
            outputs: vec![None; plan.steps().len()],
            waiting_on,
            dependents: plan.dependents(),
            ready,
        }
    }

    fn complete(&mut self, step: StepId, rows: Vec<Row>) {
        self.outputs[step] = Some(rows);
        for next in &self.dependents[step] {
            self.waiting_on[*next] -= 1;
            if self.waiting_on[*next] == 0 {
                self.ready.push_back(*next);
            }
        }
    }

    fn input(&self, steps: &[StepId]) -> Vec<Row> {
        concat(
            steps
                .iter()
                .map(|id| self.outputs[*id].clone().unwrap_or_default())
                .collect(),
        )
    }

    /// Output of a transform step over its dependencies' outputs.
    fn transform(&self, step: StepId) -> Vec<Row> {
        let step = &self.plan.steps()[step];
        let input = || self.input(&step.dependencies);
        match &step.kind {
            StepKind::ShardQuery { .. } => Vec::new(),
            StepKind::Merge(MergeStrategy::Concat) => input(),
            StepKind::Merge(MergeStrategy::HashJoin { join, left, right }) => {
                hash_join(self.input(left), self.input(right), join)
            }
            StepKind::Aggregate {
                group_by,
                aggregates,
                partial: true,
            } => final_aggregate(input(), group_by, aggregates),
            StepKind::Aggregate {
                group_by,
                aggregates,
                partial: false,
            } => aggregate_rows(input(), group_by, aggregates),
            StepKind::Sort { order_by, limit } => sort_rows(input(), order_by, *limit),
            StepKind::Filter { predicates } => filter_rows(input(), predicates, self.params),
        }
    }
}

impl QueryExecutor {
    pub fn new(
        access: Arc<dyn ShardAccess>,
        sink: Arc<dyn EventSink>,
        max_parallelism: usize,
        step_timeout: Duration,
    ) -> Self {
        Self {
            access,
            sink,
            max_parallelism: max_parallelism.max(1),
            step_timeout,
        }
    }

    /// Executes the plan.
    ///
    /// Under strong consistency, for writes, or when the plan requires a
    /// transaction, the first failed leg aborts the query. Otherwise failed
    /// legs are dropped and the result is flagged partial.
    pub async fn execute(
        &self,
        plan: ExecutionPlan,
        statement: &str,
        params: &[Value],
        options: &QueryOptions,
    ) -> Result<QueryResult, QueryError> {
        let strict =
            plan.consistency() == ConsistencyLevel::Strong || plan.requires_transaction() || plan.is_write();
        let step_timeout = options.timeout.unwrap_or(self.step_timeout);
        let parallelism = options.max_parallelism.unwrap_or(self.max_parallelism).max(1);
        let semaphore = Arc::new(Semaphore::new(parallelism));
        let cancel = options.cancel.clone();
        let is_cancelled = || cancel.as_ref().is_some_and(CancelHandle::is_cancelled);

        let mut run = Run::new(&plan, params);
        let mut legs: JoinSet<LegOutcome> = JoinSet::new();
        let mut shards_queried: Vec<ShardId> = Vec::new();
        let mut failed_shards: Vec<ShardId> = Vec::new();
        let mut answered: Vec<StepId> = Vec::new();
        let mut cancelled = false;

        loop {
            while let Some(id) = run.ready.pop_front() {
                let step = &plan.steps()[id];
                let StepKind::ShardQuery {
                    shard,
                    table,
                    access,
                    partial_aggregate,
                    limit,
                } = &step.kind
                else {
                    let rows = run.transform(id);
                    run.complete(id, rows);
                    continue;
                };

                if is_cancelled() {
                    if strict {
                        return Err(QueryError::Cancelled);
                    }
                    cancelled = true;
                    run.complete(id, Vec::new());
                    continue;
                }

                let request = ShardRequest {
                    shard: shard.clone(),
                    statement: statement.to_string(),
                    params: params.to_vec(),
                    table: table.clone(),
                    access: access.clone(),
                    partial_aggregate: *partial_aggregate,
                    limit: *limit,
                    consistency: plan.consistency(),
                };
                let shard = shard.clone();
                let client = Arc::clone(&self.access);
                let semaphore = Arc::clone(&semaphore);
                let cancel = cancel.clone();
                legs.spawn(async move {
                    let outcome = async {
                        let Ok(_permit) = semaphore.acquire_owned().await else {
                            return Err(ShardError::Cancelled);
                        };
                        if cancel.as_ref().is_some_and(CancelHandle::is_cancelled) {
                            return Err(ShardError::Cancelled);
                        }
                        match timeout(step_timeout, client.execute(request)).await {
                            Ok(result) => result,
                            Err(_) => Err(ShardError::Timeout(step_timeout)),
                        }
                    }
                    .await;
                    (id, shard, outcome)
                });
            }

            let Some(joined) = legs.join_next().await else {
                break;
            };
            let (id, shard, outcome) = match joined {
                Ok(outcome) => outcome,
                Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
                Err(_) => continue,
            };

            match outcome {
                Ok(rows) => {
                    debug!(shard_id = %shard, step = id, rows = rows.len(), "Shard leg completed");
                    if !shards_queried.contains(&shard) {
                        shards_queried.push(shard);
                    }
                    answered.push(id);
                    run.complete(id, rows);
                }
                Err(ShardError::Cancelled) => {
                    if strict {
                        legs.abort_all();
                        return Err(QueryError::Cancelled);
                    }
                    cancelled = true;
                    run.complete(id, Vec::new());
                }
                Err(source) => {
                    warn!(shard_id = %shard, step = id, error = %source, "Shard leg failed");
                    if strict {
                        legs.abort_all();
                        return Err(QueryError::ConsistencyViolation { shard, source });
                    }
                    if !failed_shards.contains(&shard) {
                        failed_shards.push(shard);
                    }
                    run.complete(id, Vec::new());
                }
            }
        }

        let rows = run.outputs[plan.output()].take().unwrap_or_default();
        let partial = cancelled || !failed_shards.is_empty();
        if partial {
            self.sink.emit(Event::QueryPartial {
                failed_shards: failed_shards.clone(),
                cancelled,
            });
        }

        let optimizations = exercised(&plan, &answered);
        Ok(QueryResult {
            rows,
            shards_queried,
            plan,
            partial,
            cancelled,
            failed_shards,
            optimizations,
        })
    }
}

/// Planned optimizations backed by at least one leg that answered.
fn exercised(plan: &ExecutionPlan, answered: &[StepId]) -> Vec<Optimization> {
    let legs: Vec<&StepKind> = answered
        .iter()
        .filter_map(|id| plan.step(*id))
        .map(|step| &step.kind)
        .collect();
    plan.optimizations()
        .iter()
        .filter(|optimization| match optimization {
            Optimization::ShardKeyPruning => true,
            Optimization::IndexRouting(index) | Optimization::CoveringIndex(index) => legs.iter().any(|kind| {
                matches!(
                    kind,
                    StepKind::ShardQuery { access: AccessPath::Index { index: used, .. }, .. } if used == index
                )
            }),
            Optimization::PartialAggregation => legs
                .iter()
                .any(|kind| matches!(kind, StepKind::ShardQuery { partial_aggregate: true, .. })),
            Optimization::LimitPushdown => legs
                .iter()
                .any(|kind| matches!(kind, StepKind::ShardQuery { limit: Some(_), .. })),
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            events::{ChannelSink, TracingSink},
            index::IndexId,
            query::plan::PlanBuilder,
        },
        parking_lot::Mutex,
        serde_json::json,
    };

    /// Returns one row per shard, tagged with the shard id.
    #[derive(Default)]
    struct Echo {
        failing: Vec<ShardId>,
        slow: Vec<ShardId>,
        seen: Mutex<Vec<ShardId>>,
    }

    #[async_trait]
    impl ShardAccess for Echo {
        async fn execute(&self, request: ShardRequest) -> Result<Vec<Row>, ShardError> {
            self.seen.lock().push(request.shard.clone());
            if self.slow.contains(&request.shard) {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            if self.failing.contains(&request.shard) {
                return Err(ShardError::Unreachable(request.shard.to_string()));
            }
            let row = json!({"shard": request.shard.as_str(), "n": 1});
            Ok(vec![row.as_object().cloned().unwrap_or_default()])
        }
    }

    fn fan_out(shards: &[&str], consistency: ConsistencyLevel) -> ExecutionPlan {
        let mut builder = PlanBuilder::new();
        let legs: Vec<StepId> = shards
            .iter()
            .map(|shard| {
                builder.push(
                    StepKind::ShardQuery {
                        shard: ShardId::from(*shard),
                        table: None,
                        access: AccessPath::Table,
                        partial_aggregate: false,
                        limit: None,
                    },
                    vec![],
                    10.0,
                )
            })
            .collect();
        let merge = builder.push(StepKind::Merge(MergeStrategy::Concat), legs, 1.0);
        builder.finish(merge, consistency, false, vec![]).unwrap()
    }

    fn executor(access: Echo) -> QueryExecutor {
        QueryExecutor::new(Arc::new(access), Arc::new(TracingSink), 4, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn concat_over_all_legs() {
        let result = executor(Echo::default())
            .execute(
                fan_out(&["a", "b", "c"], ConsistencyLevel::Strong),
                "SELECT",
                &[],
                &QueryOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(result.rows.len(), 3);
        assert_eq!(result.shards_queried.len(), 3);
        assert!(!result.partial);
    }

    #[tokio::test]
    async fn strong_failure_aborts() {
        let access = Echo {
            failing: vec!["b".into()],
            ..Echo::default()
        };
        let err = executor(access)
            .execute(
                fan_out(&["a", "b"], ConsistencyLevel::Strong),
                "SELECT",
                &[],
                &QueryOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(
            err,
            QueryError::ConsistencyViolation {
                shard: "b".into(),
                source: ShardError::Unreachable("b".into())
            }
        );
    }

    #[tokio::test]
    async fn eventual_failure_is_partial() {
        let (sink, mut events) = ChannelSink::new();
        let access = Echo {
            failing: vec!["b".into()],
            ..Echo::default()
        };
        let executor =
            QueryExecutor::new(Arc::new(access), Arc::new(sink), 4, Duration::from_secs(1));
        let result = executor
            .execute(
                fan_out(&["a", "b", "c"], ConsistencyLevel::Eventual),
                "SELECT",
                &[],
                &QueryOptions::default(),
            )
            .await
            .unwrap();
        assert!(result.partial);
        assert_eq!(result.rows.len(), 2);
        assert_eq!(result.failed_shards, vec![ShardId::from("b")]);
        assert_eq!(events.try_recv().unwrap().name(), "query.partial");
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_count_as_failures() {
        let access = Echo {
            slow: vec!["b".into()],
            ..Echo::default()
        };
        let result = executor(access)
            .execute(
                fan_out(&["a", "b"], ConsistencyLevel::Eventual),
                "SELECT",
                &[],
                &QueryOptions::default().with_timeout(Duration::from_millis(100)),
            )
            .await
            .unwrap();
        assert!(result.partial);
        assert_eq!(result.failed_shards, vec![ShardId::from("b")]);
    }

    #[tokio::test]
    async fn cancelled_before_dispatch() {
        let cancel = CancelHandle::new();
        cancel.cancel();
        let options = QueryOptions::default().with_cancel(cancel);

        let result = executor(Echo::default())
            .execute(
                fan_out(&["a", "b"], ConsistencyLevel::Eventual),
                "SELECT",
                &[],
                &options,
            )
            .await
            .unwrap();
        assert!(result.cancelled);
        assert!(result.partial);
        assert!(result.rows.is_empty());

        let err = executor(Echo::default())
            .execute(
                fan_out(&["a", "b"], ConsistencyLevel::Strong),
                "SELECT",
                &[],
                &options,
            )
            .await
            .unwrap_err();
        assert_eq!(err, QueryError::Cancelled);
    }

    #[tokio::test]
    async fn failed_write_is_never_partial() {
        let access = Echo {
            failing: vec!["a".into()],
            ..Echo::default()
        };
        let plan = fan_out(&["a"], ConsistencyLevel::Eventual).into_write();
        assert!(plan.is_write());
        let err = executor(access)
            .execute(plan, "INSERT", &[], &QueryOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::ConsistencyViolation { shard, .. } if shard.as_str() == "a"));
    }

    #[tokio::test]
    async fn failed_index_legs_drop_index_routing() {
        let index = IndexId::new("users_by_email");
        let mut builder = PlanBuilder::new();
        let legs = ["a", "b"]
            .into_iter()
            .map(|shard| {
                builder.push(
                    StepKind::ShardQuery {
                        shard: shard.into(),
                        table: None,
                        access: AccessPath::Index {
                            index: index.clone(),
                            partitions: vec![0],
                        },
                        partial_aggregate: false,
                        limit: None,
                    },
                    vec![],
                    10.0,
                )
            })
            .collect();
        let merge = builder.push(StepKind::Merge(MergeStrategy::Concat), legs, 1.0);
        let optimizations = vec![Optimization::ShardKeyPruning, Optimization::IndexRouting(index.clone())];
        let plan = builder
            .finish(merge, ConsistencyLevel::Eventual, false, optimizations)
            .unwrap();

        let access = Echo {
            failing: vec!["a".into(), "b".into()],
            ..Echo::default()
        };
        let result = executor(access)
            .execute(plan.clone(), "SELECT", &[], &QueryOptions::default())
            .await
            .unwrap();
        assert!(result.partial);
        assert_eq!(result.optimizations, vec![Optimization::ShardKeyPruning]);

        let access = Echo {
            failing: vec!["a".into()],
            ..Echo::default()
        };
        let result = executor(access)
            .execute(plan, "SELECT", &[], &QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(result.optimizations.len(), 2);
    }
}
