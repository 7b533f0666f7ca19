pub mod migration;
pub mod operation;

use {
    crate::{
        config::RouterConfig,
        error::{RebalanceError, RebalanceResult, ShardError},
        events::{Event, EventSink},
        hash::Position,
        query::executor::CancelHandle,
        registry::ShardRegistry,
        ring::{KeyRange, VirtualNodeStatus},
        shard::{Operation, Shard, ShardId},
        topology::{Topology, TopologyHandle},
    },
    async_trait::async_trait,
    parking_lot::Mutex,
    serde::{Deserialize, Serialize},
    std::{
        collections::{BTreeMap, BTreeSet},
        sync::Arc,
    },
    tracing::{debug, info, warn},
};

pub use {
    migration::MigrationPlan,
    operation::{OperationId, OperationKind, OperationStatus, Phase, PlanId, RebalanceOperation},
};

/// Moves data between shards while an operation is in flight.
#[async_trait]
pub trait DataCopier: Send + Sync {
    /// Copies the given ranges held by `source` onto `target`.
    async fn copy(&self, source: &ShardId, target: &ShardId, ranges: &[KeyRange]) -> Result<(), ShardError>;
}

/// Whether QPS utilization of routable shards is spread wider than
/// `threshold`.
pub fn should_rebalance(registry: &ShardRegistry, threshold: f64) -> bool {
    let utilizations = registry.utilizations();
    if utilizations.len() < 2 {
        return false;
    }
    let (min, max) = utilizations
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(min, max), (_, util)| {
            (min.min(*util), max.max(*util))
        });
    max - min > threshold
}

/// Operation proposed by [`plan_operations()`].
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedOperation {
    pub kind: OperationKind,
    pub tokens: Vec<Position>,
}

/// Routable shard owning at least one virtual node.
struct Candidate<'a> {
    shard: &'a Shard,
    util: f64,
    tokens: Vec<Position>,
}

/// Proposes operations evening out QPS utilization.
///
/// Shards above the mean by more than half the rebalance threshold shed
/// load: into an underloaded shard when the projected load of the receiver
/// stays below the load threshold, otherwise into a new logical shard.
/// Remaining cold shards below the merge threshold are merged pairwise.
/// No shard takes part in more than one operation.
pub fn plan_operations(topology: &Topology, config: &RouterConfig) -> Vec<PlannedOperation> {
    let candidates: Vec<Candidate<'_>> = topology
        .registry
        .routable()
        .filter_map(|shard| {
            let tokens = topology.ring.shard_tokens(shard.id());
            (!tokens.is_empty()).then(|| Candidate {
                shard,
                util: shard.qps_utilization(),
                tokens,
            })
        })
        .collect();
    if !should_rebalance(&topology.registry, config.rebalance_threshold) || candidates.len() < 2 {
        return Vec::new();
    }

    let mean = candidates.iter().map(|c| c.util).sum::<f64>() / candidates.len() as f64;
    let margin = config.rebalance_threshold / 2.0;

    let mut hot: Vec<&Candidate<'_>> = candidates.iter().filter(|c| c.util > mean + margin).collect();
    hot.sort_by(|a, b| b.util.total_cmp(&a.util));
    let mut cold: Vec<&Candidate<'_>> = candidates
        .iter()
        .filter(|c| c.util < mean - margin && c.shard.accepts(Operation::Write))
        .collect();
    cold.sort_by(|a, b| a.util.total_cmp(&b.util));

    let mut involved: BTreeSet<&ShardId> = BTreeSet::new();
    let mut new_shards: BTreeSet<ShardId> = BTreeSet::new();
    let mut planned = Vec::new();

    for source in hot {
        let moved = cold
            .iter()
            .filter(|target| !involved.contains(target.shard.id()))
            .find_map(|target| plan_move(source, target, mean, config.load_threshold).map(|op| (target, op)));
        if let Some((target, op)) = moved {
            involved.insert(source.shard.id());
            involved.insert(target.shard.id());
            planned.push(op);
            continue;
        }

        let count = source.tokens.len();
        if count < 2 {
            debug!(shard_id = %source.shard.id(), "Overloaded shard has a single virtual node, skipping");
            continue;
        }
        let new_shard = split_shard_id(&topology.registry, source.shard.id(), &new_shards);
        new_shards.insert(new_shard.clone());
        involved.insert(source.shard.id());
        planned.push(PlannedOperation {
            kind: OperationKind::Split {
                source: source.shard.id().clone(),
                new_shard,
            },
            tokens: spread(&source.tokens, count / 2),
        });
    }

    let idle: Vec<&Candidate<'_>> = cold
        .into_iter()
        .filter(|c| c.util < config.merge_threshold && !involved.contains(c.shard.id()))
        .collect();
    for pair in idle.chunks_exact(2) {
        let (source, target) = (pair[0], pair[1]);
        let capacity = target.shard.capacity();
        let combined = (source.shard.capacity().current_qps as f64 + capacity.current_qps as f64)
            / capacity.max_qps as f64;
        if combined >= config.load_threshold {
            continue;
        }
        planned.push(PlannedOperation {
            kind: OperationKind::Merge {
                source: source.shard.id().clone(),
                target: target.shard.id().clone(),
            },
            tokens: source.tokens.clone(),
        });
    }
    planned
}

/// Moves just enough virtual nodes for the source to drop to the mean
/// without pushing the target above it.
fn plan_move(source: &Candidate<'_>, target: &Candidate<'_>, mean: f64, load_threshold: f64) -> Option<PlannedOperation> {
    let count = source.tokens.len();
    let from = source.shard.capacity();
    let to = target.shard.capacity();
    if count < 2 || from.current_qps == 0 || to.max_qps == 0 {
        return None;
    }

    let excess = (source.util - mean) * from.max_qps as f64;
    let room = (mean - target.util) * to.max_qps as f64;
    let shift = excess.min(room);
    if shift <= 0.0 {
        return None;
    }
    let per_token = from.current_qps as f64 / count as f64;
    let moved = ((shift / per_token).round() as usize).clamp(1, count - 1);
    let projected = (to.current_qps as f64 + per_token * moved as f64) / to.max_qps as f64;
    if projected >= load_threshold {
        return None;
    }

    Some(PlannedOperation {
        kind: OperationKind::Move {
            source: source.shard.id().clone(),
            target: target.shard.id().clone(),
        },
        tokens: spread(&source.tokens, moved),
    })
}

/// Picks `n` tokens evenly spaced around the ring.
fn spread(tokens: &[Position], n: usize) -> Vec<Position> {
    let count = tokens.len();
    let n = n.min(count);
    (0..n).map(|i| tokens[i * count / n]).collect()
}

fn split_shard_id(registry: &ShardRegistry, source: &ShardId, taken: &BTreeSet<ShardId>) -> ShardId {
    let mut n = 1;
    loop {
        let id = ShardId::from(format!("{source}-s{n}"));
        if !registry.contains(&id) && !taken.contains(&id) {
            return id;
        }
        n += 1;
    }
}

fn invalid(reason: impl Into<String>) -> RebalanceError {
    RebalanceError::InvalidOperation(reason.into())
}

/// Checks that the operation can start against the topology.
fn validate(topology: &Topology, kind: &OperationKind, tokens: &[Position]) -> RebalanceResult<()> {
    let source = kind.source();
    let target = kind.target();
    if source == target {
        return Err(invalid(format!("source and target are both {source}")));
    }
    if !topology.registry.contains(source) {
        return Err(invalid(format!("unknown source shard {source}")));
    }
    if tokens.is_empty() {
        return Err(invalid(format!("no virtual nodes selected on {source}")));
    }
    for token in tokens {
        match topology.ring.node(*token) {
            Some(node) if &node.shard != source => {
                return Err(invalid(format!("virtual node at {token} is not owned by {source}")));
            }
            Some(node) if node.status != VirtualNodeStatus::Active => {
                return Err(invalid(format!("virtual node at {token} is not active")));
            }
            Some(_) => {}
            None => return Err(invalid(format!("no virtual node at {token}"))),
        }
    }

    let owned = topology.ring.shard_tokens(source).len();
    let writable = |id: &ShardId| {
        topology
            .registry
            .get(id)
            .is_some_and(|shard| shard.accepts(Operation::Write))
    };
    match kind {
        OperationKind::Split { new_shard, .. } => {
            if topology.registry.contains(new_shard) {
                return Err(invalid(format!("shard {new_shard} already exists")));
            }
            if tokens.len() >= owned {
                return Err(invalid(format!("split must leave {source} at least one virtual node")));
            }
        }
        OperationKind::Move { target, .. } => {
            if !writable(target) {
                return Err(invalid(format!("target {target} cannot take writes")));
            }
            if tokens.len() >= owned {
                return Err(invalid(format!("move must leave {source} at least one virtual node")));
            }
        }
        OperationKind::Merge { target, .. } => {
            if !writable(target) {
                return Err(invalid(format!("target {target} cannot take writes")));
            }
            if tokens.len() != owned {
                return Err(invalid(format!("merge must drain every virtual node of {source}")));
            }
        }
        OperationKind::Replicate { target, .. } => {
            let known = topology
                .registry
                .get(source)
                .is_some_and(|shard| shard.replicas.contains(target));
            if !topology.registry.contains(target) || known {
                return Err(invalid(format!("{target} cannot become a replica of {source}")));
            }
        }
    }
    Ok(())
}

/// Ownership flip; the sole commit point of an operation.
///
/// Returns the ranges that changed hands, taken from the ring being
/// flipped rather than from the one the operation was planned against.
fn commit(topology: &mut Topology, op: &RebalanceOperation) -> RebalanceResult<Vec<KeyRange>> {
    let source = op.kind.source();
    let conflict = |err: &dyn std::fmt::Display| RebalanceError::CommitConflict(err.to_string());
    if let Some(token) = op
        .tokens
        .iter()
        .find(|token| topology.ring.node(**token).map(|node| &node.shard) != Some(source))
    {
        return Err(RebalanceError::CommitConflict(format!(
            "virtual node at {token} is no longer owned by {source}"
        )));
    }

    let moved: Vec<KeyRange> = op
        .tokens
        .iter()
        .flat_map(|token| topology.ring.node_ranges(*token))
        .collect();

    match &op.kind {
        OperationKind::Split { source, new_shard } => {
            let parent = topology
                .registry
                .get(source)
                .ok_or_else(|| RebalanceError::CommitConflict(format!("shard {source} is gone")))?;
            let mut config = parent.config.clone();
            config.id = new_shard.clone();
            config.virtual_nodes = Some(op.tokens.len() as u32);
            config.capacity.current_connections = 0;
            config.capacity.current_qps = 0;
            config.capacity.used_storage = 0;
            topology
                .registry
                .insert(Shard::new(config, 0))
                .map_err(|err| conflict(&err))?;
            topology
                .ring
                .reassign(&op.tokens, new_shard)
                .map_err(|err| conflict(&err))?;
        }
        OperationKind::Merge { target, .. } | OperationKind::Move { target, .. } => {
            let writable = topology
                .registry
                .get(target)
                .is_some_and(|shard| shard.accepts(Operation::Write));
            if !writable {
                return Err(RebalanceError::CommitConflict(format!(
                    "target {target} cannot take writes"
                )));
            }
            topology
                .ring
                .reassign(&op.tokens, target)
                .map_err(|err| conflict(&err))?;
        }
        OperationKind::Replicate { source, target } => {
            if !topology.registry.register_replica(source, target) {
                return Err(RebalanceError::CommitConflict(format!(
                    "{target} cannot become a replica of {source}"
                )));
            }
        }
    }
    Ok(moved)
}

/// Post-commit bookkeeping: token status, registry figures and index
/// partitions following the moved ranges.
fn finalize(topology: &mut Topology, op: &RebalanceOperation, moved_ranges: &[KeyRange]) -> RebalanceResult<()> {
    let live: Vec<Position> = op
        .tokens
        .iter()
        .copied()
        .filter(|token| topology.ring.node(*token).is_some())
        .collect();
    topology
        .ring
        .set_status(&live, VirtualNodeStatus::Active)
        .map_err(|err| RebalanceError::CommitConflict(err.to_string()))?;
    if !op.kind.transfers_ownership() {
        return Ok(());
    }

    let (source, target) = (op.kind.source(), op.kind.target());
    let moved = op.tokens.len() as u32;
    let mut shifted = 0;
    if let Some(shard) = topology.registry.get_mut(source) {
        let capacity = &mut shard.config.capacity;
        if shard.virtual_nodes > 0 {
            shifted = (capacity.current_qps as u64 * moved.min(shard.virtual_nodes) as u64
                / shard.virtual_nodes as u64) as u32;
        }
        capacity.current_qps -= shifted;
        shard.virtual_nodes = shard.virtual_nodes.saturating_sub(moved);
    }
    if let Some(shard) = topology.registry.get_mut(target) {
        shard.config.capacity.current_qps = shard.config.capacity.current_qps.saturating_add(shifted);
        shard.virtual_nodes += moved;
    }

    let partitions = topology.indexes.reassign_partitions(source, target, moved_ranges);
    if matches!(op.kind, OperationKind::Merge { .. }) && !topology.ring.contains_shard(source) {
        topology.registry.remove(source);
    }
    debug!(
        operation_id = %op.id,
        virtual_nodes = moved,
        qps = shifted,
        partitions,
        "Registry updated after commit"
    );
    Ok(())
}

/// Outcome of [`Rebalancer::execute_plan()`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanReport {
    pub plan: PlanId,
    pub completed: usize,
    pub failed: usize,
}

struct Tracked {
    operation: RebalanceOperation,
    cancel: CancelHandle,
}

#[derive(Default)]
struct State {
    next_operation: u64,
    next_plan: u64,
    operations: BTreeMap<OperationId, Tracked>,
    plans: BTreeMap<PlanId, Vec<OperationId>>,
}

impl State {
    /// Forgets the oldest finished operations and plans beyond `retained`.
    ///
    /// A plan goes once all of its operations are forgotten, or when it is
    /// among the oldest plans and none of its operations is still pending.
    fn prune(&mut self, retained: usize) {
        let finished: Vec<OperationId> = self
            .operations
            .iter()
            .filter(|(_, tracked)| tracked.operation.status.is_terminal())
            .map(|(id, _)| *id)
            .collect();
        let excess = finished.len().saturating_sub(retained);
        for id in &finished[..excess] {
            self.operations.remove(id);
        }

        let operations = &self.operations;
        self.plans
            .retain(|_, ids| ids.is_empty() || ids.iter().any(|id| operations.contains_key(id)));
        let mut excess = self.plans.len().saturating_sub(retained);
        self.plans.retain(|_, ids| {
            let settled = ids.iter().all(|id| {
                operations
                    .get(id)
                    .is_none_or(|tracked| tracked.operation.status.is_terminal())
            });
            if excess > 0 && settled {
                excess -= 1;
                return false;
            }
            true
        });
    }
}

/// Plans and executes rebalance operations.
///
/// Every operation goes through four phases, each one publishing a new
/// topology snapshot:
///
/// 1. the virtual nodes taking part are marked `Migrating`;
/// 2. the [`DataCopier`] copies their ranges to the target;
/// 3. ownership is flipped in one publication, after verifying that the
///    source still owns every token;
/// 4. tokens go back to `Active`, registry figures and index partitions
///    follow the moved ranges.
///
/// Anything failing before phase 3 restores token status and leaves
/// ownership untouched. Phase 3 is the only commit point: cancellation is
/// refused past it.
pub struct Rebalancer {
    topology: Arc<TopologyHandle>,
    config: Arc<RouterConfig>,
    copier: Arc<dyn DataCopier>,
    sink: Arc<dyn EventSink>,
    state: Mutex<State>,
}

impl Rebalancer {
    pub fn new(
        topology: Arc<TopologyHandle>,
        config: Arc<RouterConfig>,
        copier: Arc<dyn DataCopier>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            topology,
            config,
            copier,
            sink,
            state: Mutex::new(State::default()),
        }
    }

    pub fn should_rebalance(&self) -> bool {
        should_rebalance(&self.topology.load().registry, self.config.rebalance_threshold)
    }

    /// Plans operations against the current topology and registers them
    /// under a new plan. Nothing runs until
    /// [`execute_plan()`](Self::execute_plan).
    pub fn initiate_rebalancing(&self) -> RebalanceResult<PlanId> {
        let topology = self.topology.load();
        if topology.ring.is_empty() {
            return Err(invalid("no shards on the ring"));
        }
        let planned = plan_operations(&topology, &self.config);

        let mut state = self.state.lock();
        let ids: Vec<OperationId> = planned
            .into_iter()
            .map(|op| Self::track(&mut state, &topology, op.kind, op.tokens))
            .collect();
        state.next_plan += 1;
        let plan = PlanId(state.next_plan);
        let operations = ids.len();
        state.plans.insert(plan, ids);
        state.prune(self.config.operation_history);
        drop(state);

        info!(plan_id = %plan, operations, "Rebalance plan created");
        self.sink.emit(Event::RebalancingStarted { plan, operations });
        Ok(plan)
    }

    /// Registers a manually requested operation.
    ///
    /// Without explicit tokens, splits and moves take half of the source's
    /// virtual nodes, merges and replication take all of them.
    pub fn submit(&self, kind: OperationKind, tokens: Option<Vec<Position>>) -> RebalanceResult<OperationId> {
        let topology = self.topology.load();
        let tokens = tokens.unwrap_or_else(|| {
            let owned = topology.ring.shard_tokens(kind.source());
            match kind {
                OperationKind::Split { .. } | OperationKind::Move { .. } => spread(&owned, owned.len() / 2),
                OperationKind::Merge { .. } | OperationKind::Replicate { .. } => owned,
            }
        });
        validate(&topology, &kind, &tokens)?;
        Ok(Self::track(&mut self.state.lock(), &topology, kind, tokens))
    }

    fn track(state: &mut State, topology: &Topology, kind: OperationKind, tokens: Vec<Position>) -> OperationId {
        state.next_operation += 1;
        let id = OperationId(state.next_operation);
        let ranges = tokens
            .iter()
            .flat_map(|token| topology.ring.node_ranges(*token))
            .collect();
        debug!(operation_id = %id, operation = %kind, tokens = tokens.len(), "Rebalance operation planned");
        state.operations.insert(
            id,
            Tracked {
                operation: RebalanceOperation::new(id, kind, tokens, ranges),
                cancel: CancelHandle::new(),
            },
        );
        id
    }

    /// Operations of a plan.
    pub fn plan(&self, plan: PlanId) -> RebalanceResult<Vec<OperationId>> {
        self.state
            .lock()
            .plans
            .get(&plan)
            .cloned()
            .ok_or(RebalanceError::PlanNotFound(plan))
    }

    pub fn status(&self, id: OperationId) -> RebalanceResult<RebalanceOperation> {
        self.state
            .lock()
            .operations
            .get(&id)
            .map(|tracked| tracked.operation.clone())
            .ok_or(RebalanceError::NotFound(id))
    }

    pub fn operations(&self) -> Vec<RebalanceOperation> {
        self.state
            .lock()
            .operations
            .values()
            .map(|tracked| tracked.operation.clone())
            .collect()
    }

    /// Runs the operations of a plan one after another.
    ///
    /// A failing operation does not stop the rest of the plan.
    pub async fn execute_plan(&self, plan: PlanId) -> RebalanceResult<PlanReport> {
        let ids = self.plan(plan)?;
        let mut report = PlanReport {
            plan,
            completed: 0,
            failed: 0,
        };
        let mut last_error = None;
        for id in ids {
            match self.run(id).await {
                Ok(()) => report.completed += 1,
                Err(err) => {
                    report.failed += 1;
                    last_error = Some(err);
                }
            }
        }

        match last_error {
            Some(err) if report.completed == 0 => self.sink.emit(Event::RebalancingFailed {
                plan,
                reason: err.to_string(),
            }),
            _ => self.sink.emit(Event::RebalancingCompleted {
                plan,
                completed: report.completed,
                failed: report.failed,
            }),
        }
        Ok(report)
    }

    /// Executes a planned operation through all its phases.
    pub async fn run(&self, id: OperationId) -> RebalanceResult<()> {
        let (op, cancel) = {
            let mut state = self.state.lock();
            let tracked = state
                .operations
                .get_mut(&id)
                .ok_or(RebalanceError::NotFound(id))?;
            match tracked.operation.status {
                OperationStatus::Planned => {}
                _ if tracked.cancel.is_cancelled() => return Err(RebalanceError::Cancelled(id)),
                _ => return Err(invalid(format!("operation {id} is not in a planned state"))),
            }
            tracked.operation.enter(Phase::MarkMigrating);
            (tracked.operation.clone(), tracked.cancel.clone())
        };

        info!(operation_id = %id, operation = %op.kind, "Rebalance operation started");
        let outcome = self.drive(&op, &cancel).await;

        let mut state = self.state.lock();
        if let Some(tracked) = state.operations.get_mut(&id) {
            match &outcome {
                Ok(()) => tracked.operation.complete(),
                Err(err) => tracked.operation.fail(err.to_string()),
            }
        }
        state.prune(self.config.operation_history);
        drop(state);

        match &outcome {
            Ok(()) => {
                info!(operation_id = %id, "Rebalance operation completed");
                self.sink.emit(Event::OperationCompleted { operation: id });
            }
            Err(err) => {
                warn!(operation_id = %id, error = %err, "Rebalance operation failed");
                self.sink.emit(Event::OperationFailed {
                    operation: id,
                    reason: err.to_string(),
                });
            }
        }
        outcome
    }

    async fn drive(&self, op: &RebalanceOperation, cancel: &CancelHandle) -> RebalanceResult<()> {
        self.topology.update(|topology| {
            validate(topology, &op.kind, &op.tokens)?;
            topology
                .ring
                .set_status(&op.tokens, VirtualNodeStatus::Migrating)
                .map_err(|err| invalid(err.to_string()))
        })?;

        if let Err(err) = self.copy(op, cancel).await {
            self.revert(op);
            return Err(err);
        }

        self.enter(op.id, Phase::Commit);
        let committed = {
            let mut state = self.state.lock();
            if cancel.is_cancelled() {
                Err(RebalanceError::Cancelled(op.id))
            } else {
                let result = self.topology.update(|topology| commit(topology, op));
                if let Ok(moved) = &result
                    && let Some(tracked) = state.operations.get_mut(&op.id)
                {
                    tracked.operation.committed = true;
                    tracked.operation.ranges = moved.clone();
                }
                result
            }
        };
        let moved = match committed {
            Ok(moved) => moved,
            Err(err) => {
                self.revert(op);
                return Err(err);
            }
        };
        debug!(operation_id = %op.id, ranges = moved.len(), "Ownership committed");

        self.enter(op.id, Phase::Finalize);
        self.topology.update(|topology| finalize(topology, op, &moved))
    }

    async fn copy(&self, op: &RebalanceOperation, cancel: &CancelHandle) -> RebalanceResult<()> {
        self.enter(op.id, Phase::CopyData);
        let ranges = self.copy_ranges(op);
        let (source, target) = (op.kind.source(), op.kind.target());
        debug!(operation_id = %op.id, ranges = ranges.len(), "Copying ranges");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RebalanceError::Cancelled(op.id)),
            copied = self.copier.copy(source, target, &ranges) => {
                copied.map_err(|source| RebalanceError::CopyFailed { op: op.id, source })
            }
        }
    }

    /// Ranges the target has to receive.
    fn copy_ranges(&self, op: &RebalanceOperation) -> Vec<KeyRange> {
        let topology = self.topology.load();
        if !op.kind.transfers_ownership() {
            return topology.ring.intervals(op.kind.source()).unwrap_or_default();
        }
        let mut after = topology.ring.clone();
        if after.reassign(&op.tokens, op.kind.target()).is_err() {
            return op.ranges.clone();
        }
        MigrationPlan::between(&topology.ring, &after)
            .pending_intervals(op.kind.target())
            .map(|interval| *interval.key_range())
            .collect()
    }

    /// Puts tokens left in `Migrating` back to `Active`.
    fn revert(&self, op: &RebalanceOperation) {
        let reverted = self.topology.update(|topology| {
            let stuck: Vec<Position> = op
                .tokens
                .iter()
                .copied()
                .filter(|token| {
                    topology
                        .ring
                        .node(*token)
                        .is_some_and(|node| node.status == VirtualNodeStatus::Migrating)
                })
                .collect();
            topology.ring.set_status(&stuck, VirtualNodeStatus::Active)
        });
        if let Err(err) = reverted {
            warn!(operation_id = %op.id, error = %err, "Failed to restore virtual node status");
        }
    }

    fn enter(&self, id: OperationId, phase: Phase) {
        if let Some(tracked) = self.state.lock().operations.get_mut(&id) {
            tracked.operation.enter(phase);
        }
    }

    /// Cancels an operation that has not committed yet.
    ///
    /// A planned operation fails right away; a running one is stopped at
    /// its next phase boundary, or as soon as the data copy is interrupted.
    pub fn cancel(&self, id: OperationId) -> RebalanceResult<()> {
        let mut state = self.state.lock();
        let tracked = state
            .operations
            .get_mut(&id)
            .ok_or(RebalanceError::NotFound(id))?;
        if tracked.operation.committed || tracked.operation.status == OperationStatus::Completed {
            return Err(RebalanceError::AlreadyCommitted(id));
        }
        tracked.cancel.cancel();
        if tracked.operation.status != OperationStatus::Planned {
            return Ok(());
        }

        let reason = RebalanceError::Cancelled(id).to_string();
        tracked.operation.fail(reason.clone());
        state.prune(self.config.operation_history);
        drop(state);
        info!(operation_id = %id, "Planned rebalance operation cancelled");
        self.sink.emit(Event::OperationFailed {
            operation: id,
            reason,
        });
        Ok(())
    }

    /// Registers a fresh copy of a failed operation.
    pub fn retry(&self, id: OperationId) -> RebalanceResult<OperationId> {
        let (kind, tokens) = {
            let state = self.state.lock();
            let tracked = state.operations.get(&id).ok_or(RebalanceError::NotFound(id))?;
            if !matches!(tracked.operation.status, OperationStatus::Failed { .. }) {
                return Err(RebalanceError::NotRetryable(id));
            }
            (tracked.operation.kind.clone(), tracked.operation.tokens.clone())
        };
        let retried = self.submit(kind, Some(tokens))?;
        debug!(operation_id = %id, retry_id = %retried, "Rebalance operation retried");
        Ok(retried)
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            index::{IndexColumn, IndexDefinition, IndexSharding},
            shard::{ConnectionInfo, ShardCapacity, ShardConfig, ShardLoad},
        },
    };

    fn topology(utilizations: &[f64]) -> Topology {
        let mut topology = Topology::default();
        for (i, util) in utilizations.iter().enumerate() {
            let id = ShardId::from(format!("s{}", i + 1));
            let config = ShardConfig::new(
                id.clone(),
                "eu",
                ConnectionInfo::new("db", 5432),
                ShardCapacity::new(100, 1 << 30, 1000),
            );
            topology.ring.add_shard(&id, 32, 1).unwrap();
            topology.registry.insert(Shard::new(config, 32)).unwrap();
            topology.registry.update_load(
                &id,
                ShardLoad {
                    connections: 10,
                    qps: (util * 1000.0) as u32,
                    used_storage: 0,
                },
            );
        }
        topology
    }

    #[test]
    fn skewed_cluster_is_rebalanced() {
        let topology = topology(&[0.9, 0.9, 0.1]);
        assert!(should_rebalance(&topology.registry, 0.30));

        let planned = plan_operations(&topology, &RouterConfig::default());
        assert!(!planned.is_empty());
        assert!(matches!(
            &planned[0].kind,
            OperationKind::Move { target, .. } if target.as_str() == "s3"
        ));
        assert!(matches!(&planned[1].kind, OperationKind::Split { new_shard, .. } if new_shard.as_str().ends_with("-s1")));
        for op in &planned {
            assert!(!op.tokens.is_empty());
            assert!(op.tokens.len() < 32);
        }
    }

    #[test]
    fn balanced_cluster_is_left_alone() {
        let topology = topology(&[0.5, 0.55, 0.5]);
        assert!(!should_rebalance(&topology.registry, 0.30));
        assert!(plan_operations(&topology, &RouterConfig::default()).is_empty());
    }

    #[test]
    fn idle_shards_are_merged() {
        let topology = topology(&[0.9, 0.05, 0.05, 0.1]);
        let planned = plan_operations(&topology, &RouterConfig::default());
        let merges: Vec<_> = planned
            .iter()
            .filter(|op| matches!(op.kind, OperationKind::Merge { .. }))
            .collect();
        assert_eq!(merges.len(), 1);
        assert_eq!(merges[0].tokens.len(), 32);

        let mut involved = BTreeSet::new();
        for op in &planned {
            assert!(involved.insert(op.kind.source().clone()));
        }
    }

    #[test]
    fn spread_picks_distinct_tokens() {
        let tokens: Vec<Position> = (0..10).collect();
        assert_eq!(spread(&tokens, 5), vec![0, 2, 4, 6, 8]);
        assert_eq!(spread(&tokens, 3), vec![0, 3, 6]);
        assert_eq!(spread(&tokens, 20).len(), 10);
    }

    #[test]
    fn validation() {
        let topology = topology(&[0.5, 0.5]);
        let owned = topology.ring.shard_tokens(&"s1".into());

        let drain = OperationKind::Move {
            source: "s1".into(),
            target: "s2".into(),
        };
        assert!(validate(&topology, &drain, &owned).is_err());
        assert!(validate(&topology, &drain, &owned[..4]).is_ok());

        let foreign = topology.ring.shard_tokens(&"s2".into());
        assert!(validate(&topology, &drain, &foreign[..1]).is_err());

        let merge = OperationKind::Merge {
            source: "s1".into(),
            target: "s2".into(),
        };
        assert!(validate(&topology, &merge, &owned[..4]).is_err());
        assert!(validate(&topology, &merge, &owned).is_ok());

        let split = OperationKind::Split {
            source: "s1".into(),
            new_shard: "s2".into(),
        };
        assert!(validate(&topology, &split, &owned[..4]).is_err());
    }

    #[test]
    fn partitions_follow_ranges_flipped_at_commit() {
        let mut topology = topology(&[0.5, 0.5, 0.5]);
        let definition = IndexDefinition::new("by_email", "users", IndexSharding::Hash { partitions: 64 })
            .with_column(IndexColumn::hash("email"));
        topology.indexes.create(definition, &topology.ring).unwrap();

        let s1 = ShardId::from("s1");
        let tokens = topology.ring.shard_tokens(&s1)[1..].to_vec();
        let planned: Vec<KeyRange> = tokens
            .iter()
            .flat_map(|token| topology.ring.node_ranges(*token))
            .collect();
        let kind = OperationKind::Move {
            source: s1.clone(),
            target: "s2".into(),
        };
        let op = RebalanceOperation::new(OperationId(1), kind, tokens, planned.clone());

        // s3 leaves after planning: arcs of s1 widen and its partitions are rehomed.
        topology.registry.remove(&"s3".into());
        topology.ring.remove_node(&"s3".into());
        topology.indexes.rehome(&topology.ring);

        let moved = commit(&mut topology, &op).unwrap();
        assert_ne!(moved, planned);
        finalize(&mut topology, &op, &moved).unwrap();
        for index in topology.indexes.iter() {
            for partition in &index.partitions {
                let owner = topology.ring.owner(partition.token).map(|node| &node.shard);
                assert_eq!(owner, Some(&partition.shard), "partition {}", partition.ordinal);
            }
        }
    }

    struct NoCopy;

    #[async_trait]
    impl DataCopier for NoCopy {
        async fn copy(&self, _: &ShardId, _: &ShardId, _: &[KeyRange]) -> Result<(), ShardError> {
            Ok(())
        }
    }

    #[test]
    fn finished_operations_are_forgotten() {
        let config = RouterConfig {
            operation_history: 2,
            ..RouterConfig::default()
        };
        let rebalancer = Rebalancer::new(
            Arc::new(TopologyHandle::new(topology(&[0.5, 0.5, 0.5]))),
            Arc::new(config),
            Arc::new(NoCopy),
            Arc::new(crate::events::TracingSink),
        );

        let pending = rebalancer
            .submit(
                OperationKind::Move {
                    source: "s3".into(),
                    target: "s1".into(),
                },
                None,
            )
            .unwrap();
        let cancelled: Vec<OperationId> = (0..4)
            .map(|_| {
                let id = rebalancer
                    .submit(
                        OperationKind::Move {
                            source: "s1".into(),
                            target: "s2".into(),
                        },
                        None,
                    )
                    .unwrap();
                rebalancer.cancel(id).unwrap();
                id
            })
            .collect();

        let kept: Vec<OperationId> = rebalancer.operations().iter().map(|op| op.id).collect();
        assert_eq!(kept, vec![pending, cancelled[2], cancelled[3]]);
        assert_eq!(rebalancer.status(cancelled[0]), Err(RebalanceError::NotFound(cancelled[0])));

        let plans: Vec<PlanId> = (0..4).map(|_| rebalancer.initiate_rebalancing().unwrap()).collect();
        assert_eq!(rebalancer.plan(plans[1]), Err(RebalanceError::PlanNotFound(plans[1])));
        assert!(rebalancer.plan(plans[2]).is_ok());
        assert!(rebalancer.plan(plans[3]).is_ok());
    }
}
