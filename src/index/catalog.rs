use {
    super::{
        GlobalSecondaryIndex, IndexDefinition, IndexId, IndexPartition, PartitionStatus,
        partition_bounds,
    },
    crate::{
        error::{IndexError, IndexResult},
        query::AnalyzedQuery,
        ring::{HashRing, KeyRange},
        shard::{ConsistencyLevel, ShardId},
    },
    std::collections::BTreeMap,
};

/// Index definitions and partition placement.
///
/// Part of the topology snapshot, so index placement is versioned together
/// with the ring it was derived from.
#[derive(Debug, Clone, Default)]
pub struct IndexCatalog {
    indexes: BTreeMap<IndexId, GlobalSecondaryIndex>,
}

impl IndexCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.indexes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }

    pub fn get(&self, id: &IndexId) -> Option<&GlobalSecondaryIndex> {
        self.indexes.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &GlobalSecondaryIndex> {
        self.indexes.values()
    }

    /// Indexes defined on a table.
    pub fn for_table<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a GlobalSecondaryIndex> {
        self.indexes.values().filter(move |index| index.table() == table)
    }

    /// Validates the definition and places its partitions on the ring.
    ///
    /// Partitions start out `Building`.
    pub fn create(&mut self, definition: IndexDefinition, ring: &HashRing) -> IndexResult<IndexId> {
        definition.validate()?;
        if self.indexes.contains_key(&definition.id) {
            return Err(IndexError::Duplicate(definition.id));
        }
        if ring.is_empty() {
            return Err(IndexError::NoShards);
        }

        let mut partitions = Vec::new();
        for (ordinal, bounds) in partition_bounds(&definition.sharding).into_iter().enumerate() {
            let ordinal = ordinal as u32;
            let token = HashRing::hash(&IndexPartition::token_seed(&definition.id, ordinal));
            let shard = ring
                .owner(token)
                .map(|node| node.shard.clone())
                .ok_or(IndexError::NoShards)?;
            partitions.push(IndexPartition {
                ordinal,
                shard,
                token,
                bounds,
                status: PartitionStatus::Building,
            });
        }

        let id = definition.id.clone();
        self.indexes.insert(
            id.clone(),
            GlobalSecondaryIndex {
                definition,
                partitions,
            },
        );
        Ok(id)
    }

    /// Marks every partition of the index as built.
    pub fn activate(&mut self, id: &IndexId) -> IndexResult<()> {
        self.set_status(id, None, PartitionStatus::Active)
    }

    /// Sets the status of one partition, or of all of them when `ordinal`
    /// is `None`.
    pub fn set_status(
        &mut self,
        id: &IndexId,
        ordinal: Option<u32>,
        status: PartitionStatus,
    ) -> IndexResult<()> {
        let index = self
            .indexes
            .get_mut(id)
            .ok_or_else(|| IndexError::NotFound(id.clone()))?;
        for partition in &mut index.partitions {
            if ordinal.is_none_or(|ordinal| ordinal == partition.ordinal) {
                partition.status = status;
            }
        }
        Ok(())
    }

    pub fn drop_index(&mut self, id: &IndexId) -> IndexResult<GlobalSecondaryIndex> {
        self.indexes
            .remove(id)
            .ok_or_else(|| IndexError::NotFound(id.clone()))
    }

    /// Active indexes able to serve the query at the required consistency.
    pub fn find_applicable_indexes(
        &self,
        query: &AnalyzedQuery,
        required: ConsistencyLevel,
    ) -> Vec<&GlobalSecondaryIndex> {
        self.indexes
            .values()
            .filter(|index| index.is_active())
            .filter(|index| index.consistency().satisfies(required))
            .filter(|index| index.matches(query))
            .collect()
    }

    /// Moves partitions placed on `source` whose token falls in one of the
    /// moved ranges over to `target`.
    ///
    /// Returns the number of partitions moved.
    pub fn reassign_partitions(
        &mut self,
        source: &ShardId,
        target: &ShardId,
        ranges: &[KeyRange],
    ) -> usize {
        let mut moved = 0;
        for partition in self.indexes.values_mut().flat_map(|i| i.partitions.iter_mut()) {
            if &partition.shard == source && ranges.iter().any(|r| r.contains(partition.token)) {
                partition.shard = target.clone();
                moved += 1;
            }
        }
        moved
    }

    /// Re-places partitions whose shard no longer owns their token, e.g.
    /// after the shard left the ring.
    pub fn rehome(&mut self, ring: &HashRing) -> usize {
        let mut moved = 0;
        for partition in self.indexes.values_mut().flat_map(|i| i.partitions.iter_mut()) {
            if let Some(node) = ring.owner(partition.token)
                && node.shard != partition.shard
            {
                partition.shard = node.shard.clone();
                moved += 1;
            }
        }
        moved
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            index::{IndexColumn, IndexSharding, UpdateMode},
            query::Predicate,
        },
        serde_json::json,
    };

    fn ring() -> HashRing {
        let mut ring = HashRing::new();
        for shard in ["s1", "s2", "s3"] {
            ring.add_shard(&ShardId::from(shard), 32, 1).unwrap();
        }
        ring
    }

    fn definition(id: &str, mode: UpdateMode) -> IndexDefinition {
        IndexDefinition::new(id, "events", IndexSharding::Hash { partitions: 4 })
            .with_column(IndexColumn::hash("tenant_id"))
            .with_column(IndexColumn::range("created_at"))
            .with_update_mode(mode)
    }

    fn tenant_query() -> AnalyzedQuery {
        AnalyzedQuery::select("q", "events")
            .with_predicate(Predicate::eq("tenant_id", json!("t1")))
            .with_predicate(Predicate::between("created_at", json!(1), json!(2)))
    }

    #[test]
    fn create_places_partitions_on_ring_owners() {
        let ring = ring();
        let mut catalog = IndexCatalog::new();
        let id = catalog
            .create(definition("by_tenant", UpdateMode::Sync), &ring)
            .unwrap();

        let index = catalog.get(&id).unwrap();
        assert_eq!(index.partitions.len(), 4);
        for partition in &index.partitions {
            assert_eq!(partition.status, PartitionStatus::Building);
            assert_eq!(Some(&partition.shard), ring.owner(partition.token).map(|n| &n.shard));
        }

        assert_eq!(
            catalog.create(definition("by_tenant", UpdateMode::Sync), &ring),
            Err(IndexError::Duplicate("by_tenant".into()))
        );
        assert_eq!(
            IndexCatalog::new().create(definition("x", UpdateMode::Sync), &HashRing::new()),
            Err(IndexError::NoShards)
        );
    }

    #[test]
    fn only_active_consistent_indexes_apply() {
        let ring = ring();
        let mut catalog = IndexCatalog::new();
        let sync = catalog.create(definition("sync", UpdateMode::Sync), &ring).unwrap();
        let lagging = catalog.create(definition("async", UpdateMode::Async), &ring).unwrap();
        let query = tenant_query();

        assert!(catalog.find_applicable_indexes(&query, ConsistencyLevel::Eventual).is_empty());

        catalog.activate(&sync).unwrap();
        catalog.activate(&lagging).unwrap();
        assert_eq!(catalog.find_applicable_indexes(&query, ConsistencyLevel::Eventual).len(), 2);

        let strong = catalog.find_applicable_indexes(&query, ConsistencyLevel::Strong);
        assert_eq!(strong.len(), 1);
        assert_eq!(strong[0].id(), &sync);
    }

    #[test]
    fn partitions_follow_ownership() {
        let mut ring = ring();
        let mut catalog = IndexCatalog::new();
        let id = catalog.create(definition("idx", UpdateMode::Sync), &ring).unwrap();

        let first = catalog.get(&id).unwrap().partitions[0].clone();
        let other = ShardId::from(if first.shard.as_str() == "s1" { "s2" } else { "s1" });
        let moved = catalog.reassign_partitions(&first.shard, &other, &[KeyRange::FULL]);
        assert!(moved >= 1);
        assert_eq!(catalog.get(&id).unwrap().partitions[0].shard, other);

        ring.remove_node(&other);
        catalog.rehome(&ring);
        assert!(catalog
            .get(&id)
            .unwrap()
            .partitions
            .iter()
            .all(|p| p.shard != other));
    }
}
