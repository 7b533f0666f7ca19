//! Lifecycle events.
//!
//! Every topology change, rebalance step and degraded query is reported as
//! an [`Event`] to the configured [`EventSink`]. Sinks are fire-and-forget:
//! they must not block and cannot fail the operation that emitted the event.

use {
    crate::{
        index::IndexId,
        rebalance::{OperationId, PlanId},
        shard::{ShardId, ShardStatus},
    },
    auto_impl::auto_impl,
    tokio::sync::mpsc,
    tracing::{info, warn},
};

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    ShardAdded {
        shard: ShardId,
        virtual_nodes: u32,
    },
    ShardRemoved {
        shard: ShardId,
    },
    ShardStatusChanged {
        shard: ShardId,
        previous: ShardStatus,
        current: ShardStatus,
    },
    IndexCreated {
        index: IndexId,
        partitions: u32,
    },
    IndexDropped {
        index: IndexId,
    },
    RebalancingStarted {
        plan: PlanId,
        operations: usize,
    },
    RebalancingCompleted {
        plan: PlanId,
        completed: usize,
        failed: usize,
    },
    RebalancingFailed {
        plan: PlanId,
        reason: String,
    },
    OperationCompleted {
        operation: OperationId,
    },
    OperationFailed {
        operation: OperationId,
        reason: String,
    },
    QueryPartial {
        failed_shards: Vec<ShardId>,
        cancelled: bool,
    },
}

impl Event {
    /// Dotted event name, e.g. `shard.added`.
    pub fn name(&self) -> &'static str {
        match self {
            Event::ShardAdded { .. } => "shard.added",
            Event::ShardRemoved { .. } => "shard.removed",
            Event::ShardStatusChanged { .. } => "shard.status_changed",
            Event::IndexCreated { .. } => "index.created",
            Event::IndexDropped { .. } => "index.dropped",
            Event::RebalancingStarted { .. } => "rebalancing.started",
            Event::RebalancingCompleted { .. } => "rebalancing.completed",
            Event::RebalancingFailed { .. } => "rebalancing.failed",
            Event::OperationCompleted { .. } => "operation.completed",
            Event::OperationFailed { .. } => "operation.failed",
            Event::QueryPartial { .. } => "query.partial",
        }
    }
}

/// Receiver of lifecycle events.
#[auto_impl(&, Arc, Box)]
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// Logs events through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: Event) {
        let event_type = event.name();
        match event {
            Event::ShardAdded {
                shard,
                virtual_nodes,
            } => info!(event_type, shard_id = %shard, virtual_nodes, "Shard added"),
            Event::ShardRemoved { shard } => info!(event_type, shard_id = %shard, "Shard removed"),
            Event::ShardStatusChanged {
                shard,
                previous,
                current,
            } => info!(
                event_type,
                shard_id = %shard,
                previous = %previous,
                current = %current,
                "Shard status changed"
            ),
            Event::IndexCreated { index, partitions } => {
                info!(event_type, index_id = %index, partitions, "Index created")
            }
            Event::IndexDropped { index } => info!(event_type, index_id = %index, "Index dropped"),
            Event::RebalancingStarted { plan, operations } => {
                info!(event_type, plan_id = %plan, operations, "Rebalancing started")
            }
            Event::RebalancingCompleted {
                plan,
                completed,
                failed,
            } => info!(event_type, plan_id = %plan, completed, failed, "Rebalancing completed"),
            Event::RebalancingFailed { plan, reason } => {
                warn!(event_type, plan_id = %plan, reason = %reason, "Rebalancing failed")
            }
            Event::OperationCompleted { operation } => {
                info!(event_type, operation_id = %operation, "Rebalance operation completed")
            }
            Event::OperationFailed { operation, reason } => warn!(
                event_type,
                operation_id = %operation,
                reason = %reason,
                "Rebalance operation failed"
            ),
            Event::QueryPartial {
                failed_shards,
                cancelled,
            } => warn!(
                event_type,
                failed_shards = ?failed_shards,
                cancelled,
                "Query returned partial results"
            ),
        }
    }
}

/// Forwards events into a channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: Event) {
        // Receiver gone means nobody is listening anymore.
        let _ = self.tx.send(event);
    }
}
