use {
    super::{GlobalSecondaryIndex, IndexDefinition, IndexId, PartitionStatus, UpdateMode},
    crate::{
        error::{IndexError, IndexResult},
        events::{Event, EventSink},
        query::{
            AnalyzedQuery, Value,
            executor::{ShardAccess, ShardRequest},
            plan::AccessPath,
        },
        shard::ConsistencyLevel,
        topology::TopologyHandle,
    },
    parking_lot::Mutex,
    std::{
        collections::VecDeque,
        sync::{
            Arc,
            atomic::{AtomicU64, Ordering},
        },
    },
    tracing::{debug, warn},
};

/// Index maintenance deferred for an asynchronous index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexUpdate {
    pub index: IndexId,
    pub partition: u32,
    pub table: String,
    /// Base write the index entry is derived from.
    pub statement: String,
    pub params: Vec<Value>,
}

/// Point-in-time index statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IndexStats {
    pub indexes: usize,
    pub total_partitions: usize,
    pub active_partitions: usize,
    pub building_partitions: usize,
    pub failed_partitions: usize,
    pub pending_updates: usize,
    pub applied_updates: u64,
    pub lookups: u64,
}

/// Drives index lifecycle and asynchronous index maintenance.
///
/// Definitions and placement are published through the topology handle;
/// the coordinator itself only owns the queue of deferred updates and the
/// usage counters.
pub struct GlobalIndexCoordinator {
    topology: Arc<TopologyHandle>,
    sink: Arc<dyn EventSink>,
    pending: Mutex<VecDeque<IndexUpdate>>,
    lookups: AtomicU64,
    applied: AtomicU64,
}

impl GlobalIndexCoordinator {
    pub fn new(topology: Arc<TopologyHandle>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            topology,
            sink,
            pending: Mutex::new(VecDeque::new()),
            lookups: AtomicU64::new(0),
            applied: AtomicU64::new(0),
        }
    }

    /// Creates the index and places its partitions; partitions are
    /// `Building` until [`activate_index()`](Self::activate_index).
    pub fn create_index(&self, definition: IndexDefinition) -> IndexResult<IndexId> {
        let partitions = definition.sharding.partition_count();
        let id = self
            .topology
            .update(|topology| topology.indexes.create(definition, &topology.ring))?;
        self.sink.emit(Event::IndexCreated {
            index: id.clone(),
            partitions,
        });
        Ok(id)
    }

    pub fn activate_index(&self, id: &IndexId) -> IndexResult<()> {
        self.topology.update(|topology| topology.indexes.activate(id))
    }

    pub fn set_partition_status(
        &self,
        id: &IndexId,
        ordinal: u32,
        status: PartitionStatus,
    ) -> IndexResult<()> {
        self.topology
            .update(|topology| topology.indexes.set_status(id, Some(ordinal), status))
    }

    /// Drops the index along with its queued updates.
    pub fn drop_index(&self, id: &IndexId) -> IndexResult<()> {
        self.topology.update(|topology| topology.indexes.drop_index(id))?;
        self.pending.lock().retain(|update| &update.index != id);
        self.sink.emit(Event::IndexDropped { index: id.clone() });
        Ok(())
    }

    pub fn index(&self, id: &IndexId) -> IndexResult<GlobalSecondaryIndex> {
        self.topology
            .load()
            .indexes
            .get(id)
            .cloned()
            .ok_or_else(|| IndexError::NotFound(id.clone()))
    }

    /// Active indexes able to serve the query at the required consistency.
    pub fn find_applicable_indexes(
        &self,
        query: &AnalyzedQuery,
        required: ConsistencyLevel,
    ) -> Vec<GlobalSecondaryIndex> {
        self.topology
            .load()
            .indexes
            .find_applicable_indexes(query, required)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn record_lookup(&self) {
        self.lookups.fetch_add(1, Ordering::Relaxed);
    }

    /// Queues maintenance of every asynchronous index on the written table.
    ///
    /// Returns the number of queued updates. Reads are ignored.
    pub fn enqueue_async_updates(&self, query: &AnalyzedQuery, params: &[Value]) -> usize {
        let Some(table) = query.tables.first().filter(|_| query.kind.is_write()) else {
            return 0;
        };
        let topology = self.topology.load();
        let updates: Vec<IndexUpdate> = topology
            .indexes
            .for_table(table)
            .filter(|index| index.definition.update_mode == UpdateMode::Async)
            .flat_map(|index| {
                index
                    .partitions_for(query, params)
                    .into_iter()
                    .map(|partition| IndexUpdate {
                        index: index.id().clone(),
                        partition,
                        table: table.clone(),
                        statement: query.statement.clone(),
                        params: params.to_vec(),
                    })
            })
            .collect();

        let queued = updates.len();
        self.pending.lock().extend(updates);
        queued
    }

    pub fn pending_updates(&self) -> usize {
        self.pending.lock().len()
    }

    /// Applies queued updates in order, returning how many were applied.
    ///
    /// Stops at the first failing update, which stays at the head of the
    /// queue for the next flush. Updates of dropped indexes are discarded.
    pub async fn flush_pending(&self, access: &dyn ShardAccess) -> usize {
        let mut applied = 0;
        loop {
            let Some(update) = self.pending.lock().pop_front() else {
                break;
            };

            let topology = self.topology.load();
            let Some(shard) = topology
                .indexes
                .get(&update.index)
                .and_then(|index| index.partition(update.partition))
                .map(|partition| partition.shard.clone())
            else {
                debug!(index_id = %update.index, "Discarding update of dropped index");
                continue;
            };

            let request = ShardRequest {
                shard: shard.clone(),
                statement: update.statement.clone(),
                params: update.params.clone(),
                table: Some(update.table.clone()),
                access: AccessPath::IndexWrite {
                    index: update.index.clone(),
                    partition: update.partition,
                },
                partial_aggregate: false,
                limit: None,
                consistency: ConsistencyLevel::Eventual,
            };
            match access.execute(request).await {
                Ok(_) => {
                    applied += 1;
                    self.applied.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    warn!(
                        index_id = %update.index,
                        partition = update.partition,
                        shard_id = %shard,
                        error = %err,
                        "Index update failed, keeping it queued"
                    );
                    self.pending.lock().push_front(update);
                    break;
                }
            }
        }
        applied
    }

    /// Recomputes index statistics from the current snapshot.
    pub fn refresh_stats(&self) -> IndexStats {
        let topology = self.topology.load();
        let mut stats = IndexStats {
            indexes: topology.indexes.len(),
            pending_updates: self.pending_updates(),
            applied_updates: self.applied.load(Ordering::Relaxed),
            lookups: self.lookups.load(Ordering::Relaxed),
            ..IndexStats::default()
        };
        for partition in topology.indexes.iter().flat_map(|index| &index.partitions) {
            stats.total_partitions += 1;
            match partition.status {
                PartitionStatus::Active => stats.active_partitions += 1,
                PartitionStatus::Building => stats.building_partitions += 1,
                PartitionStatus::Failed => stats.failed_partitions += 1,
            }
        }
        debug!(
            indexes = stats.indexes,
            active_partitions = stats.active_partitions,
            pending_updates = stats.pending_updates,
            applied_updates = stats.applied_updates,
            "Index statistics refreshed"
        );
        stats
    }
}
