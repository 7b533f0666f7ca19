//! Pure transformations over rows returned by shards.
//!
//! Dependent plan steps (merge, aggregate, sort, filter) are evaluated with
//! these functions once their inputs are available. None of them perform
//! I/O.

use {
    super::{AggregateExpr, AggregateFn, JoinSpec, OrderBy, Predicate, Row, Value, value_key},
    rapidhash::RapidHashMap,
    std::cmp::Ordering,
};

/// Orders two JSON values of compatible types.
///
/// Null sorts before everything else; numbers compare numerically; values of
/// unrelated types are incomparable.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Null, _) => Some(Ordering::Less),
        (_, Value::Null) => Some(Ordering::Greater),
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Concatenates inputs in order.
pub fn concat(inputs: Vec<Vec<Row>>) -> Vec<Row> {
    inputs.into_iter().flatten().collect()
}

/// Inner equi-join; the right side is used as the build side.
///
/// Columns present on both sides with different values are kept from the
/// left, the right value is stored as `{right_table}.{column}`.
pub fn hash_join(left: Vec<Row>, right: Vec<Row>, join: &JoinSpec) -> Vec<Row> {
    let mut build: RapidHashMap<String, Vec<&Row>> = RapidHashMap::default();
    for row in &right {
        match row.get(&join.right_column) {
            Some(Value::Null) | None => continue,
            Some(value) => build.entry(value_key(value)).or_default().push(row),
        }
    }

    let mut joined = Vec::new();
    for row in &left {
        let Some(value) = row.get(&join.left_column).filter(|v| !v.is_null()) else {
            continue;
        };
        for matched in build.get(&value_key(value)).into_iter().flatten() {
            let mut out = row.clone();
            for (column, value) in matched.iter() {
                match out.get(column) {
                    Some(existing) if existing != value => {
                        out.insert(format!("{}.{column}", join.right_table), value.clone());
                    }
                    Some(_) => {}
                    None => {
                        out.insert(column.clone(), value.clone());
                    }
                }
            }
            joined.push(out);
        }
    }
    joined
}

/// Running numeric total preserving integer results where possible.
#[derive(Debug, Clone, Copy)]
enum Total {
    Int(i64),
    Float(f64),
}

impl Total {
    fn add(self, value: &Value) -> Self {
        match (self, value.as_i64(), value.as_f64()) {
            (Total::Int(acc), Some(v), _) => acc.checked_add(v).map_or(Total::Float(acc as f64 + v as f64), Total::Int),
            (Total::Int(acc), None, Some(v)) => Total::Float(acc as f64 + v),
            (Total::Float(acc), _, Some(v)) => Total::Float(acc + v),
            (total, _, None) => total,
        }
    }

    fn as_f64(self) -> f64 {
        match self {
            Total::Int(v) => v as f64,
            Total::Float(v) => v,
        }
    }

    fn into_value(self) -> Value {
        match self {
            Total::Int(v) => Value::from(v),
            Total::Float(v) => Value::from(v),
        }
    }
}

#[derive(Debug, Clone)]
enum Accumulator {
    Count(Total),
    Sum(Option<Total>),
    Min(Option<Value>),
    Max(Option<Value>),
    Avg { sum: Total, count: Total },
}

impl Accumulator {
    fn new(function: AggregateFn) -> Self {
        match function {
            AggregateFn::Count => Accumulator::Count(Total::Int(0)),
            AggregateFn::Sum => Accumulator::Sum(None),
            AggregateFn::Min => Accumulator::Min(None),
            AggregateFn::Max => Accumulator::Max(None),
            AggregateFn::Avg => Accumulator::Avg {
                sum: Total::Int(0),
                count: Total::Int(0),
            },
        }
    }

    fn fold(&mut self, expr: &AggregateExpr, row: &Row) {
        let partial = row.get(&expr.alias).filter(|v| !v.is_null());
        match self {
            Accumulator::Count(total) => {
                if let Some(v) = partial {
                    *total = total.add(v);
                }
            }
            Accumulator::Sum(total) => {
                if let Some(v) = partial {
                    *total = Some(total.unwrap_or(Total::Int(0)).add(v));
                }
            }
            Accumulator::Min(current) => pick(current, partial, Ordering::Less),
            Accumulator::Max(current) => pick(current, partial, Ordering::Greater),
            Accumulator::Avg { sum, count } => {
                if let Some(v) = row.get(&format!("{}__sum", expr.alias)) {
                    *sum = sum.add(v);
                }
                if let Some(v) = row.get(&format!("{}__count", expr.alias)) {
                    *count = count.add(v);
                }
            }
        }
    }

    /// Folds one unaggregated row.
    fn fold_raw(&mut self, expr: &AggregateExpr, row: &Row) {
        let value = expr
            .column
            .as_ref()
            .and_then(|column| row.get(column))
            .filter(|v| !v.is_null());
        match self {
            Accumulator::Count(total) => {
                if expr.column.is_none() || value.is_some() {
                    *total = total.add(&Value::from(1));
                }
            }
            Accumulator::Sum(total) => {
                if let Some(v) = value {
                    *total = Some(total.unwrap_or(Total::Int(0)).add(v));
                }
            }
            Accumulator::Min(current) => pick(current, value, Ordering::Less),
            Accumulator::Max(current) => pick(current, value, Ordering::Greater),
            Accumulator::Avg { sum, count } => {
                if let Some(v) = value {
                    *sum = sum.add(v);
                    *count = count.add(&Value::from(1));
                }
            }
        }
    }

    fn finish(self) -> Value {
        match self {
            Accumulator::Count(total) => total.into_value(),
            Accumulator::Sum(total) => total.map_or(Value::Null, Total::into_value),
            Accumulator::Min(value) | Accumulator::Max(value) => value.unwrap_or(Value::Null),
            Accumulator::Avg { sum, count } => {
                if count.as_f64() == 0.0 {
                    Value::Null
                } else {
                    Value::from(sum.as_f64() / count.as_f64())
                }
            }
        }
    }
}

fn pick(current: &mut Option<Value>, candidate: Option<&Value>, wanted: Ordering) {
    let Some(candidate) = candidate else {
        return;
    };
    let replace = match current {
        None => true,
        Some(existing) => compare_values(candidate, existing) == Some(wanted),
    };
    if replace {
        *current = Some(candidate.clone());
    }
}

/// Folds per-shard partial aggregates into final values.
///
/// Groups appear in the order they are first seen in `rows`. Without
/// `GROUP BY`, exactly one row is produced even when there is no input.
pub fn final_aggregate(rows: Vec<Row>, group_by: &[String], aggregates: &[AggregateExpr]) -> Vec<Row> {
    group_and_fold(rows, group_by, aggregates, Accumulator::fold)
}

/// Aggregates raw rows, e.g. the output of a join.
///
/// Same grouping rules as [`final_aggregate()`].
pub fn aggregate_rows(rows: Vec<Row>, group_by: &[String], aggregates: &[AggregateExpr]) -> Vec<Row> {
    group_and_fold(rows, group_by, aggregates, Accumulator::fold_raw)
}

fn group_and_fold(
    rows: Vec<Row>,
    group_by: &[String],
    aggregates: &[AggregateExpr],
    fold: fn(&mut Accumulator, &AggregateExpr, &Row),
) -> Vec<Row> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: RapidHashMap<String, (Row, Vec<Accumulator>)> = RapidHashMap::default();

    for row in &rows {
        let key = group_by
            .iter()
            .map(|column| row.get(column).map(value_key).unwrap_or_default())
            .collect::<Vec<_>>()
            .join("\u{1f}");
        let (_, accumulators) = groups.entry(key.clone()).or_insert_with(|| {
            order.push(key);
            let mut head = Row::new();
            for column in group_by {
                head.insert(column.clone(), row.get(column).cloned().unwrap_or(Value::Null));
            }
            let accumulators = aggregates.iter().map(|a| Accumulator::new(a.function)).collect();
            (head, accumulators)
        });
        for (accumulator, expr) in accumulators.iter_mut().zip(aggregates) {
            fold(accumulator, expr, row);
        }
    }

    if group_by.is_empty() && order.is_empty() {
        let accumulators = aggregates.iter().map(|a| Accumulator::new(a.function)).collect();
        order.push(String::new());
        groups.insert(String::new(), (Row::new(), accumulators));
    }

    order
        .into_iter()
        .filter_map(|key| groups.remove(&key))
        .map(|(mut row, accumulators)| {
            for (accumulator, expr) in accumulators.into_iter().zip(aggregates) {
                row.insert(expr.alias.clone(), accumulator.finish());
            }
            row
        })
        .collect()
}

/// Stable multi-column sort followed by an optional limit.
pub fn sort_rows(mut rows: Vec<Row>, order_by: &[OrderBy], limit: Option<usize>) -> Vec<Row> {
    if !order_by.is_empty() {
        rows.sort_by(|a, b| {
            for key in order_by {
                let ordering = match (a.get(&key.column), b.get(&key.column)) {
                    (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
                    (None, Some(_)) => Ordering::Less,
                    (Some(_), None) => Ordering::Greater,
                    (None, None) => Ordering::Equal,
                };
                let ordering = if key.descending { ordering.reverse() } else { ordering };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        });
    }
    if let Some(limit) = limit {
        rows.truncate(limit);
    }
    rows
}

/// Keeps rows matching every predicate.
pub fn filter_rows(rows: Vec<Row>, predicates: &[Predicate], params: &[Value]) -> Vec<Row> {
    rows.into_iter()
        .filter(|row| predicates.iter().all(|p| p.matches(row, params)))
        .collect()
}
