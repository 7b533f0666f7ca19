//! Analyzed query model, planning and distributed execution.
//!
//! Parsing is not done here: callers hand in an [`AnalyzedQuery`] produced by
//! an external analyzer. The planner turns it into an
//! [`ExecutionPlan`](plan::ExecutionPlan) which the executor runs against
//! shards through the [`ShardAccess`](executor::ShardAccess) seam.

pub mod executor;
pub mod merge;
pub mod plan;
pub mod planner;

use {
    crate::shard::{ConsistencyLevel, Operation},
    serde::{Deserialize, Serialize},
    std::cmp::Ordering,
};

pub use serde_json::Value;

/// Result row, keyed by column name.
pub type Row = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    Select,
    Insert,
    Update,
    Delete,
}

impl QueryKind {
    pub fn is_write(self) -> bool {
        !matches!(self, QueryKind::Select)
    }

    pub fn operation(self) -> Operation {
        if self.is_write() {
            Operation::Write
        } else {
            Operation::Read
        }
    }
}

/// Value reference inside a predicate: either inline or a bound parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    Literal(Value),
    Param(usize),
}

impl Operand {
    pub fn resolve<'a>(&'a self, params: &'a [Value]) -> Option<&'a Value> {
        match self {
            Operand::Literal(value) => Some(value),
            Operand::Param(idx) => params.get(*idx),
        }
    }
}

impl From<Value> for Operand {
    fn from(value: Value) -> Self {
        Operand::Literal(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredicateOp {
    Eq(Operand),
    In(Vec<Operand>),
    /// Inclusive on both ends.
    Between(Operand, Operand),
    Lt(Operand),
    Le(Operand),
    Gt(Operand),
    Ge(Operand),
}

/// Condition on a single column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub column: String,
    pub op: PredicateOp,
}

impl Predicate {
    pub fn new(column: impl Into<String>, op: PredicateOp) -> Self {
        Self {
            column: column.into(),
            op,
        }
    }

    pub fn eq(column: impl Into<String>, operand: impl Into<Operand>) -> Self {
        Self::new(column, PredicateOp::Eq(operand.into()))
    }

    pub fn between(
        column: impl Into<String>,
        low: impl Into<Operand>,
        high: impl Into<Operand>,
    ) -> Self {
        Self::new(column, PredicateOp::Between(low.into(), high.into()))
    }

    pub fn is_in(column: impl Into<String>, operands: Vec<Operand>) -> Self {
        Self::new(column, PredicateOp::In(operands))
    }

    /// Pins the column to one or a few discrete values.
    pub fn is_equality(&self) -> bool {
        matches!(self.op, PredicateOp::Eq(_) | PredicateOp::In(_))
    }

    /// Constrains the column to one contiguous range (a single `Eq` included).
    pub fn is_range(&self) -> bool {
        !matches!(self.op, PredicateOp::In(_))
    }

    /// Discrete values the predicate pins the column to, if any.
    pub fn equality_values<'a>(&'a self, params: &'a [Value]) -> Option<Vec<&'a Value>> {
        match &self.op {
            PredicateOp::Eq(operand) => operand.resolve(params).map(|value| vec![value]),
            PredicateOp::In(operands) => operands
                .iter()
                .map(|operand| operand.resolve(params))
                .collect(),
            _ => None,
        }
    }

    /// Inclusive lower and upper bounds implied by the predicate.
    pub fn bounds<'a>(&'a self, params: &'a [Value]) -> (Option<&'a Value>, Option<&'a Value>) {
        match &self.op {
            PredicateOp::Eq(v) => (v.resolve(params), v.resolve(params)),
            PredicateOp::Between(low, high) => (low.resolve(params), high.resolve(params)),
            PredicateOp::Lt(v) | PredicateOp::Le(v) => (None, v.resolve(params)),
            PredicateOp::Gt(v) | PredicateOp::Ge(v) => (v.resolve(params), None),
            PredicateOp::In(_) => (None, None),
        }
    }

    /// Evaluates the predicate against a row. Missing columns never match.
    pub fn matches(&self, row: &Row, params: &[Value]) -> bool {
        let Some(actual) = row.get(&self.column) else {
            return false;
        };
        let cmp = |operand: &Operand| {
            operand
                .resolve(params)
                .and_then(|expected| merge::compare_values(actual, expected))
        };
        match &self.op {
            PredicateOp::Eq(v) => cmp(v) == Some(Ordering::Equal),
            PredicateOp::In(vs) => vs.iter().any(|v| cmp(v) == Some(Ordering::Equal)),
            PredicateOp::Between(low, high) => {
                matches!(cmp(low), Some(Ordering::Greater | Ordering::Equal))
                    && matches!(cmp(high), Some(Ordering::Less | Ordering::Equal))
            }
            PredicateOp::Lt(v) => cmp(v) == Some(Ordering::Less),
            PredicateOp::Le(v) => matches!(cmp(v), Some(Ordering::Less | Ordering::Equal)),
            PredicateOp::Gt(v) => cmp(v) == Some(Ordering::Greater),
            PredicateOp::Ge(v) => matches!(cmp(v), Some(Ordering::Greater | Ordering::Equal)),
        }
    }
}

/// Equi-join between two tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinSpec {
    pub left_table: String,
    pub left_column: String,
    pub right_table: String,
    pub right_column: String,
}

/// How partial results from several shards are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombineKind {
    Union,
    Join,
    Aggregate,
    #[default]
    ScatterGather,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFn {
    Count,
    Sum,
    Min,
    Max,
    Avg,
}

/// Aggregate output column.
///
/// Shards asked for a partial aggregate return one row per group, with the
/// partial value under `alias`; for `Avg` they return `{alias}__sum` and
/// `{alias}__count` instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateExpr {
    pub function: AggregateFn,
    pub column: Option<String>,
    pub alias: String,
}

impl AggregateExpr {
    pub fn new(function: AggregateFn, column: Option<&str>, alias: impl Into<String>) -> Self {
        Self {
            function,
            column: column.map(str::to_owned),
            alias: alias.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub column: String,
    #[serde(default)]
    pub descending: bool,
}

/// Structured query handed over by the external analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzedQuery {
    /// Statement forwarded verbatim to shards.
    pub statement: String,
    pub kind: QueryKind,
    pub tables: Vec<String>,
    #[serde(default)]
    pub predicates: Vec<Predicate>,
    #[serde(default)]
    pub joins: Vec<JoinSpec>,
    #[serde(default)]
    pub combine: CombineKind,
    #[serde(default)]
    pub aggregates: Vec<AggregateExpr>,
    #[serde(default)]
    pub group_by: Vec<String>,
    /// Predicates applied after rows from all shards are combined.
    #[serde(default)]
    pub having: Vec<Predicate>,
    #[serde(default)]
    pub order_by: Vec<OrderBy>,
    #[serde(default)]
    pub limit: Option<usize>,
    /// Selected columns; empty means all.
    #[serde(default)]
    pub projection: Vec<String>,
    /// Column values written by inserts and updates.
    #[serde(default)]
    pub assignments: Vec<(String, Operand)>,
    /// Shard key column of the (first) table.
    #[serde(default)]
    pub shard_key: Option<String>,
    /// Consistency the caller requires; `None` uses the router default.
    #[serde(default)]
    pub consistency: Option<ConsistencyLevel>,
}

impl AnalyzedQuery {
    pub fn new(kind: QueryKind, statement: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            statement: statement.into(),
            kind,
            tables: vec![table.into()],
            predicates: Vec::new(),
            joins: Vec::new(),
            combine: CombineKind::default(),
            aggregates: Vec::new(),
            group_by: Vec::new(),
            having: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            projection: Vec::new(),
            assignments: Vec::new(),
            shard_key: None,
            consistency: None,
        }
    }

    pub fn select(statement: impl Into<String>, table: impl Into<String>) -> Self {
        Self::new(QueryKind::Select, statement, table)
    }

    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    pub fn with_shard_key(mut self, column: impl Into<String>) -> Self {
        self.shard_key = Some(column.into());
        self
    }

    pub fn with_combine(mut self, combine: CombineKind) -> Self {
        self.combine = combine;
        self
    }

    pub fn with_join(mut self, join: JoinSpec) -> Self {
        if !self.tables.contains(&join.right_table) {
            self.tables.push(join.right_table.clone());
        }
        self.joins.push(join);
        self.combine = CombineKind::Join;
        self
    }

    pub fn with_aggregate(mut self, aggregate: AggregateExpr) -> Self {
        self.aggregates.push(aggregate);
        self.combine = CombineKind::Aggregate;
        self
    }

    pub fn with_group_by(mut self, column: impl Into<String>) -> Self {
        self.group_by.push(column.into());
        self
    }

    pub fn with_having(mut self, predicate: Predicate) -> Self {
        self.having.push(predicate);
        self
    }

    pub fn with_order_by(mut self, column: impl Into<String>, descending: bool) -> Self {
        self.order_by.push(OrderBy {
            column: column.into(),
            descending,
        });
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_projection(mut self, columns: &[&str]) -> Self {
        self.projection = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_assignment(mut self, column: impl Into<String>, operand: impl Into<Operand>) -> Self {
        self.assignments.push((column.into(), operand.into()));
        self
    }

    pub fn with_consistency(mut self, consistency: ConsistencyLevel) -> Self {
        self.consistency = Some(consistency);
        self
    }

    /// Predicates on a column.
    pub fn predicates_on<'a>(&'a self, column: &'a str) -> impl Iterator<Item = &'a Predicate> {
        self.predicates.iter().filter(move |p| p.column == column)
    }

    /// Values the query pins a column to: an equality predicate first, then
    /// a written value.
    pub fn pinned_values<'a>(&'a self, column: &str, params: &'a [Value]) -> Option<Vec<&'a Value>> {
        self.predicates
            .iter()
            .filter(|p| p.column == column)
            .find_map(|p| p.equality_values(params))
            .or_else(|| {
                self.assignments
                    .iter()
                    .find(|(name, _)| name == column)
                    .and_then(|(_, operand)| operand.resolve(params))
                    .map(|value| vec![value])
            })
    }
}

/// Routing key derived from a column value.
///
/// Strings are used as-is, so `"opportunity-42"` hashes identically whether
/// it arrives as a key or as a column value.
pub fn value_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
