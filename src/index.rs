//! Global secondary indexes.
//!
//! An index is sharded independently of its base table: its partitions are
//! placed on the ring by a partition token, not by the base table's shard
//! key. Definitions and partition placement live in the [`IndexCatalog`],
//! which is part of every topology snapshot; the [`GlobalIndexCoordinator`]
//! drives catalog changes and asynchronous index maintenance.

pub mod catalog;
pub mod coordinator;

use {
    crate::{
        error::{IndexError, IndexResult},
        hash::{self, Position},
        query::{AnalyzedQuery, Value, merge::compare_values, value_key},
        ring::KeyRange,
        shard::{ConsistencyLevel, ShardId},
    },
    serde::{Deserialize, Serialize},
    std::{cmp::Ordering, fmt},
};

pub use {
    catalog::IndexCatalog,
    coordinator::{GlobalIndexCoordinator, IndexStats, IndexUpdate},
};

/// Above this many hash-column value combinations a lookup scans every
/// partition instead of enumerating point lookups.
const MAX_POINT_LOOKUPS: usize = 64;

/// Separator between hash column values when forming the partition key.
const KEY_SEPARATOR: char = '\u{1f}';

/// Index identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IndexId(String);

impl IndexId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IndexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IndexId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for IndexId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexColumnKind {
    /// Distributes entries; lookups need equality.
    Hash,
    /// Orders entries; lookups accept equality or ranges.
    Range,
    /// Stored alongside the entry, not searchable.
    Include,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexColumn {
    pub name: String,
    pub kind: IndexColumnKind,
}

impl IndexColumn {
    pub fn hash(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: IndexColumnKind::Hash,
        }
    }

    pub fn range(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: IndexColumnKind::Range,
        }
    }

    pub fn include(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: IndexColumnKind::Include,
        }
    }
}

/// How index entries are spread over partitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexSharding {
    /// Hash of the hash columns, split into equal slices of the hash space.
    Hash { partitions: u32 },
    /// Value ranges of the first range column, cut at the split points.
    Range { split_points: Vec<Value> },
    /// Hash partitioned; range columns only order entries inside a partition.
    Composite { partitions: u32 },
}

impl IndexSharding {
    pub fn partition_count(&self) -> u32 {
        match self {
            IndexSharding::Hash { partitions } | IndexSharding::Composite { partitions } => {
                *partitions
            }
            IndexSharding::Range { split_points } => split_points.len() as u32 + 1,
        }
    }
}

/// When index entries are written relative to the base row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMode {
    /// Same atomic unit as the base write.
    #[default]
    Sync,
    /// Queued and applied in the background; reads may lag.
    Async,
}

impl UpdateMode {
    /// Consistency a reader gets when served from the index.
    pub fn consistency(self) -> ConsistencyLevel {
        match self {
            UpdateMode::Sync => ConsistencyLevel::Strong,
            UpdateMode::Async => ConsistencyLevel::Eventual,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub id: IndexId,
    pub table: String,
    /// Ordered columns; hash and range columns are matched in this order.
    pub columns: Vec<IndexColumn>,
    pub sharding: IndexSharding,
    #[serde(default)]
    pub update_mode: UpdateMode,
}

impl IndexDefinition {
    pub fn new(id: impl Into<IndexId>, table: impl Into<String>, sharding: IndexSharding) -> Self {
        Self {
            id: id.into(),
            table: table.into(),
            columns: Vec::new(),
            sharding,
            update_mode: UpdateMode::default(),
        }
    }

    pub fn with_column(mut self, column: IndexColumn) -> Self {
        self.columns.push(column);
        self
    }

    pub fn with_update_mode(mut self, mode: UpdateMode) -> Self {
        self.update_mode = mode;
        self
    }

    pub fn columns_of(&self, kind: IndexColumnKind) -> impl Iterator<Item = &str> {
        self.columns
            .iter()
            .filter(move |column| column.kind == kind)
            .map(|column| column.name.as_str())
    }

    pub fn validate(&self) -> IndexResult<()> {
        let invalid = |reason: String| Err(IndexError::InvalidDefinition(reason));

        if self.id.as_str().trim().is_empty() {
            return invalid("index id is empty".into());
        }
        if self.table.trim().is_empty() {
            return invalid(format!("index {} has no table", self.id));
        }
        for (idx, column) in self.columns.iter().enumerate() {
            if self.columns[..idx].iter().any(|c| c.name == column.name) {
                return invalid(format!("column {} listed twice", column.name));
            }
        }

        let hash_columns = self.columns_of(IndexColumnKind::Hash).count();
        let range_columns = self.columns_of(IndexColumnKind::Range).count();
        if hash_columns + range_columns == 0 {
            return invalid(format!("index {} has no hash or range column", self.id));
        }

        match &self.sharding {
            IndexSharding::Hash { partitions } | IndexSharding::Composite { partitions } => {
                if *partitions == 0 {
                    return invalid("partition count must be positive".into());
                }
                if hash_columns == 0 {
                    return invalid("hash sharding needs a hash column".into());
                }
            }
            IndexSharding::Range { split_points } => {
                if range_columns == 0 {
                    return invalid("range sharding needs a range column".into());
                }
                let ascending = split_points
                    .windows(2)
                    .all(|pair| compare_values(&pair[0], &pair[1]) == Some(Ordering::Less));
                if !ascending {
                    return invalid("split points must be strictly ascending".into());
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionStatus {
    Building,
    Active,
    Failed,
}

/// Slice of the index key space held by a partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionBounds {
    /// Slice of the hash space of the hash columns.
    Hash(KeyRange),
    /// Values of the first range column, lower inclusive, upper exclusive.
    Values {
        lower: Option<Value>,
        upper: Option<Value>,
    },
}

impl PartitionBounds {
    /// Whether values within `[low, high]` may live in the partition.
    fn overlaps(&self, low: Option<&Value>, high: Option<&Value>) -> bool {
        let PartitionBounds::Values { lower, upper } = self else {
            return true;
        };
        let below_upper = match (low, upper) {
            (Some(low), Some(upper)) => !matches!(
                compare_values(low, upper),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            _ => true,
        };
        let above_lower = match (high, lower) {
            (Some(high), Some(lower)) => compare_values(high, lower) != Some(Ordering::Less),
            _ => true,
        };
        below_upper && above_lower
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexPartition {
    pub ordinal: u32,
    pub shard: ShardId,
    /// Ring position of the partition token; the partition lives on the
    /// shard owning this position.
    pub token: Position,
    pub bounds: PartitionBounds,
    pub status: PartitionStatus,
}

impl IndexPartition {
    /// Seed hashed to place a partition on the ring.
    pub fn token_seed(index: &IndexId, ordinal: u32) -> String {
        format!("gsi:{index}:{ordinal}")
    }
}

/// Index definition with its placed partitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalSecondaryIndex {
    pub definition: IndexDefinition,
    pub partitions: Vec<IndexPartition>,
}

impl GlobalSecondaryIndex {
    pub fn id(&self) -> &IndexId {
        &self.definition.id
    }

    pub fn table(&self) -> &str {
        &self.definition.table
    }

    pub fn consistency(&self) -> ConsistencyLevel {
        self.definition.update_mode.consistency()
    }

    /// Every partition is built and serving.
    pub fn is_active(&self) -> bool {
        self.partitions
            .iter()
            .all(|partition| partition.status == PartitionStatus::Active)
    }

    /// Whether the query's predicates can be answered through the index.
    ///
    /// Every hash column needs an equality (or `IN`) predicate and every
    /// range column an equality or range predicate.
    pub fn matches(&self, query: &AnalyzedQuery) -> bool {
        if !query.tables.iter().any(|table| table == self.table()) {
            return false;
        }
        let definition = &self.definition;
        definition
            .columns_of(IndexColumnKind::Hash)
            .all(|column| query.predicates_on(column).any(|p| p.is_equality()))
            && definition
                .columns_of(IndexColumnKind::Range)
                .all(|column| query.predicates_on(column).next().is_some())
    }

    /// All the columns the index can return without touching the base table.
    pub fn covers(&self, projection: &[String]) -> bool {
        !projection.is_empty()
            && projection
                .iter()
                .all(|name| self.definition.columns.iter().any(|c| &c.name == name))
    }

    /// Ordinals of the partitions that may hold entries for the query.
    ///
    /// Values the query pins (predicates or written values) narrow the set;
    /// whatever cannot be narrowed down falls back to every partition.
    pub fn partitions_for(&self, query: &AnalyzedQuery, params: &[Value]) -> Vec<u32> {
        let all = || self.partitions.iter().map(|p| p.ordinal).collect::<Vec<_>>();

        match &self.definition.sharding {
            IndexSharding::Hash { .. } | IndexSharding::Composite { .. } => {
                let Some(keys) = self.hash_keys(query, params) else {
                    return all();
                };
                let mut ordinals: Vec<u32> = keys
                    .iter()
                    .filter_map(|key| self.hash_partition(hash::hash(key)))
                    .collect();
                ordinals.sort_unstable();
                ordinals.dedup();
                ordinals
            }
            IndexSharding::Range { .. } => {
                let Some(column) = self.definition.columns_of(IndexColumnKind::Range).next() else {
                    return all();
                };
                let (low, high) = match query.pinned_values(column, params) {
                    Some(values) if values.len() == 1 => (Some(values[0]), Some(values[0])),
                    Some(_) => return all(),
                    None => query
                        .predicates_on(column)
                        .next()
                        .map(|p| p.bounds(params))
                        .unwrap_or((None, None)),
                };
                self.partitions
                    .iter()
                    .filter(|p| p.bounds.overlaps(low, high))
                    .map(|p| p.ordinal)
                    .collect()
            }
        }
    }

    pub fn partition(&self, ordinal: u32) -> Option<&IndexPartition> {
        self.partitions.iter().find(|p| p.ordinal == ordinal)
    }

    /// Partition keys for every combination of pinned hash column values.
    fn hash_keys(&self, query: &AnalyzedQuery, params: &[Value]) -> Option<Vec<String>> {
        let mut keys = vec![String::new()];
        for (idx, column) in self.definition.columns_of(IndexColumnKind::Hash).enumerate() {
            let values = query.pinned_values(column, params)?;
            if keys.len() * values.len() > MAX_POINT_LOOKUPS {
                return None;
            }
            keys = keys
                .iter()
                .flat_map(|prefix| {
                    values.iter().map(move |value| {
                        if idx == 0 {
                            value_key(value)
                        } else {
                            format!("{prefix}{KEY_SEPARATOR}{}", value_key(value))
                        }
                    })
                })
                .collect();
        }
        Some(keys)
    }

    fn hash_partition(&self, position: Position) -> Option<u32> {
        self.partitions.iter().find_map(|p| match &p.bounds {
            PartitionBounds::Hash(range) if range.contains(position) => Some(p.ordinal),
            _ => None,
        })
    }
}

/// Bounds of every partition of a new index, in ordinal order.
pub(crate) fn partition_bounds(sharding: &IndexSharding) -> Vec<PartitionBounds> {
    match sharding {
        IndexSharding::Hash { partitions } | IndexSharding::Composite { partitions } => {
            KeyRange::partition(*partitions)
                .into_iter()
                .map(PartitionBounds::Hash)
                .collect()
        }
        IndexSharding::Range { split_points } => {
            let mut lower = None;
            let mut bounds = Vec::with_capacity(split_points.len() + 1);
            for point in split_points {
                bounds.push(PartitionBounds::Values {
                    lower: lower.take(),
                    upper: Some(point.clone()),
                });
                lower = Some(point.clone());
            }
            bounds.push(PartitionBounds::Values { lower, upper: None });
            bounds
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::query::{Operand, Predicate},
        serde_json::json,
    };

    fn placed(definition: IndexDefinition) -> GlobalSecondaryIndex {
        let partitions = partition_bounds(&definition.sharding)
            .into_iter()
            .enumerate()
            .map(|(ordinal, bounds)| IndexPartition {
                ordinal: ordinal as u32,
                shard: ShardId::from("s1"),
                token: 0,
                bounds,
                status: PartitionStatus::Active,
            })
            .collect();
        GlobalSecondaryIndex {
            definition,
            partitions,
        }
    }

    fn tenant_index() -> GlobalSecondaryIndex {
        placed(
            IndexDefinition::new("by_tenant", "events", IndexSharding::Composite { partitions: 8 })
                .with_column(IndexColumn::hash("tenant_id"))
                .with_column(IndexColumn::range("created_at"))
                .with_column(IndexColumn::include("kind")),
        )
    }

    #[test]
    fn validation() {
        let no_columns = IndexDefinition::new("i", "t", IndexSharding::Hash { partitions: 4 });
        assert!(matches!(
            no_columns.validate(),
            Err(IndexError::InvalidDefinition(_))
        ));

        let include_only = IndexDefinition::new("i", "t", IndexSharding::Hash { partitions: 4 })
            .with_column(IndexColumn::include("x"));
        assert!(include_only.validate().is_err());

        let unsorted = IndexDefinition::new(
            "i",
            "t",
            IndexSharding::Range {
                split_points: vec![json!(10), json!(5)],
            },
        )
        .with_column(IndexColumn::range("x"));
        assert!(unsorted.validate().is_err());

        assert!(tenant_index().definition.validate().is_ok());
    }

    #[test]
    fn matching_requires_hash_equality() {
        let index = tenant_index();

        let both = AnalyzedQuery::select("q", "events")
            .with_predicate(Predicate::eq("tenant_id", json!("t1")))
            .with_predicate(Predicate::between("created_at", json!(1), json!(9)));
        assert!(index.matches(&both));

        let range_only = AnalyzedQuery::select("q", "events")
            .with_predicate(Predicate::between("created_at", json!(1), json!(9)));
        assert!(!index.matches(&range_only));

        let other_table = AnalyzedQuery::select("q", "users")
            .with_predicate(Predicate::eq("tenant_id", json!("t1")))
            .with_predicate(Predicate::eq("created_at", json!(3)));
        assert!(!index.matches(&other_table));
    }

    #[test]
    fn hash_partition_pruning() {
        let index = tenant_index();
        let point = AnalyzedQuery::select("q", "events")
            .with_predicate(Predicate::eq("tenant_id", Operand::Param(0)));
        let hit = index.partitions_for(&point, &[json!("t1")]);
        assert_eq!(hit.len(), 1);
        assert_eq!(hit, index.partitions_for(&point, &[json!("t1")]));

        let unbound = index.partitions_for(&point, &[]);
        assert_eq!(unbound.len(), 8);
    }

    #[test]
    fn range_partition_pruning() {
        let index = placed(
            IndexDefinition::new(
                "by_age",
                "users",
                IndexSharding::Range {
                    split_points: vec![json!(18), json!(65)],
                },
            )
            .with_column(IndexColumn::range("age")),
        );

        let adults = AnalyzedQuery::select("q", "users")
            .with_predicate(Predicate::between("age", json!(20), json!(30)));
        assert_eq!(index.partitions_for(&adults, &[]), vec![1]);

        let exact = AnalyzedQuery::select("q", "users").with_predicate(Predicate::eq("age", json!(18)));
        assert_eq!(index.partitions_for(&exact, &[]), vec![1]);

        let wide = AnalyzedQuery::select("q", "users")
            .with_predicate(Predicate::between("age", json!(10), json!(70)));
        assert_eq!(index.partitions_for(&wide, &[]), vec![0, 1, 2]);
    }

    #[test]
    fn covering() {
        let index = tenant_index();
        assert!(index.covers(&["tenant_id".into(), "kind".into()]));
        assert!(!index.covers(&["payload".into()]));
        assert!(!index.covers(&[]));
    }
}
