//! Shard routing and cross-shard query coordination.
//!
//! Keys are placed on a consistent hash ring of virtual nodes; every
//! position of the `u64` hash space is owned by exactly one shard at any
//! topology version. On top of the ring the crate provides:
//!
//! - load and region aware shard selection ([`ShardRouter`]);
//! - planning and execution of queries spanning several shards
//!   ([`QueryPlanner`], [`QueryExecutor`]);
//! - global secondary indexes sharded independently of their base table
//!   ([`GlobalIndexCoordinator`]);
//! - phased re-balancing of ring ownership ([`Rebalancer`]).
//!
//! Transport to the shards, data copy and health checks are supplied by the
//! caller through the [`ShardAccess`], [`DataCopier`] and [`HealthProbe`]
//! traits.
//!
//! ```ignore
//! let coordinator = ShardCoordinator::builder(RouterConfig::from_env()?)
//!     .with_shard_access(access)
//!     .with_data_copier(copier)
//!     .with_shards(shards)
//!     .build()?;
//! let shard = coordinator.select_shard("opportunity-42", Operation::Read, &SelectOptions::default())?;
//! ```

pub mod builder;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod hash;
pub mod index;
pub mod monitor;
pub mod query;
pub mod rebalance;
pub mod registry;
pub mod ring;
pub mod router;
pub mod shard;
pub mod telemetry;
pub mod topology;

pub use {
    builder::CoordinatorBuilder,
    config::RouterConfig,
    coordinator::ShardCoordinator,
    error::*,
    events::{ChannelSink, Event, EventSink, TracingSink},
    index::{GlobalIndexCoordinator, GlobalSecondaryIndex, IndexDefinition, IndexId},
    monitor::{BackgroundTasks, HealthMonitor, HealthProbe},
    query::{
        AnalyzedQuery, Row, Value,
        executor::{CancelHandle, QueryExecutor, QueryOptions, QueryResult, ShardAccess, ShardRequest},
        plan::ExecutionPlan,
        planner::QueryPlanner,
    },
    rebalance::{DataCopier, MigrationPlan, OperationId, OperationKind, PlanId, Rebalancer},
    registry::{SelectOptions, ShardRegistry},
    ring::{HashRing, KeyRange, VirtualNode},
    router::{RoutingDecision, RoutingStrategy, ShardRouter},
    shard::{ConsistencyLevel, Operation, Shard, ShardConfig, ShardId, ShardStatus},
    topology::{Topology, TopologyHandle},
};
