use {
    crate::{
        hash::Position,
        index::IndexId,
        rebalance::{OperationId, PlanId},
        shard::ShardId,
    },
    std::time::Duration,
};

/// Failure reported by a shard-side collaborator (data access, health probe,
/// data copy).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ShardError {
    /// Shard could not be reached.
    #[error("Shard unreachable: {0}")]
    Unreachable(String),

    /// Shard refused to execute the operation.
    #[error("Shard rejected operation: {0}")]
    Rejected(String),

    /// Operation did not complete in time.
    #[error("Shard operation timed out after {0:?}")]
    Timeout(Duration),

    /// Operation was cancelled before it was dispatched.
    #[error("Operation cancelled before dispatch")]
    Cancelled,
}

/// Hash ring mutation failure.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RingError {
    /// Another virtual node already sits at the position.
    #[error("Ring position {token} is already taken by shard {owner}")]
    TokenOccupied { token: Position, owner: ShardId },

    /// No virtual node at the position.
    #[error("No virtual node at ring position {0}")]
    UnknownToken(Position),
}

/// Invalid shard or router configuration.
///
/// Configuration errors are never partially applied: the whole change is
/// rejected.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// Shard has no usable connection info.
    #[error("Shard {0} has no connection info")]
    MissingConnectionInfo(ShardId),

    /// One of the capacity figures is zero.
    #[error("Shard {shard} has non-positive capacity: {field}")]
    NonPositiveCapacity { shard: ShardId, field: &'static str },

    /// Shard must claim at least one virtual node.
    #[error("Shard {0} must have at least one virtual node")]
    NoVirtualNodes(ShardId),

    /// Shard weight must be positive.
    #[error("Shard {0} has zero weight")]
    InvalidWeight(ShardId),

    /// Shard with the same id is already registered.
    #[error("Shard {0} is already registered")]
    DuplicateShard(ShardId),

    /// Shard is not registered.
    #[error("Shard {0} is not registered")]
    UnknownShard(ShardId),

    /// No free ring position could be found for a virtual node.
    #[error("No free ring position for virtual node {ordinal} of shard {shard}")]
    TokenSpaceExhausted { shard: ShardId, ordinal: u32 },

    /// Shard has ranges in flight and cannot be removed.
    #[error("Shard {0} is part of a running rebalance operation")]
    ShardBusy(ShardId),

    /// Coordinator was built without a required collaborator.
    #[error("Missing component: {0}")]
    MissingComponent(&'static str),

    /// Router level setting is out of range.
    #[error("Invalid setting `{name}`: {reason}")]
    InvalidSetting { name: &'static str, reason: String },
}

/// Shard selection failure.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RouterError {
    /// The ring produced no candidate shards (ring is empty).
    #[error("No available shards")]
    NoAvailableShards,

    /// Every candidate was rejected by the availability policy.
    #[error("No healthy shards among {0} candidates")]
    NoHealthyShards(usize),

    /// Query cannot be mapped onto shards.
    #[error("Query cannot be routed: {0}")]
    UnroutableQuery(String),
}

impl RouterError {
    /// Availability failures clear up once load drops or shards recover.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, RouterError::UnroutableQuery(_))
    }
}

/// Cross-shard query failure.
///
/// Partial results under eventual consistency are *not* errors, they come
/// back as a successful result flagged partial.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum QueryError {
    /// A leg failed while the query required every leg to succeed.
    #[error("Consistency violation: shard {shard} failed: {source}")]
    ConsistencyViolation { shard: ShardId, source: ShardError },

    /// Query was cancelled under strong consistency.
    #[error("Query cancelled")]
    Cancelled,

    /// Analyzed query cannot be planned.
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Plan is malformed (cycle, dangling dependency).
    #[error("Invalid execution plan: {0}")]
    InvalidPlan(String),

    /// No shard can serve the query.
    #[error(transparent)]
    Unavailable(#[from] RouterError),
}

impl QueryError {
    /// Whether the caller may retry without changing the query.
    pub fn is_retryable(&self) -> bool {
        match self {
            QueryError::ConsistencyViolation { .. } => false,
            QueryError::InvalidQuery(_) | QueryError::InvalidPlan(_) => false,
            QueryError::Cancelled => true,
            QueryError::Unavailable(err) => err.is_retryable(),
        }
    }
}

/// Re-balancing failure.
///
/// A failed operation leaves ring ownership as it was before the operation
/// started; it must be retried as a brand new operation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RebalanceError {
    /// Unknown operation.
    #[error("Rebalance operation {0} not found")]
    NotFound(OperationId),

    /// Unknown plan.
    #[error("Rebalance plan {0} not found")]
    PlanNotFound(PlanId),

    /// Operation already passed its commit point.
    #[error("Rebalance operation {0} is already committed")]
    AlreadyCommitted(OperationId),

    /// Only failed operations can be retried.
    #[error("Rebalance operation {0} is not in a failed state")]
    NotRetryable(OperationId),

    /// Operation makes no sense for the current topology.
    #[error("Invalid rebalance operation: {0}")]
    InvalidOperation(String),

    /// Data copy for the operation failed.
    #[error("Data copy for operation {op} failed: {source}")]
    CopyFailed { op: OperationId, source: ShardError },

    /// Ownership changed under the operation before it could commit.
    #[error("Commit conflict: {0}")]
    CommitConflict(String),

    /// Operation was cancelled before its commit point.
    #[error("Rebalance operation {0} cancelled")]
    Cancelled(OperationId),
}

impl RebalanceError {
    /// Whether a fresh operation may be attempted.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, RebalanceError::InvalidOperation(_))
    }
}

/// Global secondary index failure.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum IndexError {
    /// Index with the same id exists.
    #[error("Index {0} already exists")]
    Duplicate(IndexId),

    /// Index definition is malformed.
    #[error("Invalid index definition: {0}")]
    InvalidDefinition(String),

    /// Unknown index.
    #[error("Index {0} not found")]
    NotFound(IndexId),

    /// No shards to place index partitions on.
    #[error("No shards available to host index partitions")]
    NoShards,
}

pub type RingResult<T> = Result<T, RingError>;
pub type ConfigResult<T> = Result<T, ConfigError>;
pub type RouterResult<T> = Result<T, RouterError>;
pub type RebalanceResult<T> = Result<T, RebalanceError>;
pub type IndexResult<T> = Result<T, IndexError>;
