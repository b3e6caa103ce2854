//! Query execution over an in-memory log snapshot
//!
//! Evaluation order mirrors SQL semantics: source → WHERE → projection → ORDER BY →
//! LIMIT. Comparisons follow SQLite storage-class rules (see [`Cell::sql_cmp`]) after
//! applying the log table's column affinities to the operands, so that the in-memory
//! log and the SQLite log return identical rows for the supported subset.

use std::cmp::Ordering;
use std::sync::Arc;

use sqlparser::ast::{BinaryOperator, Expr, UnaryOperator, Value};

use super::{OrderDirection, Projection, QueryPlan, Source};
use crate::bus::{Cell, Record, Row};
use crate::{Error, Result};

/// Query executor for parsed SQL queries
#[derive(Debug, Default)]
pub struct QueryExecutor {
    _private: (),
}

impl QueryExecutor {
    /// Create a new query executor
    #[must_use]
    pub const fn new() -> Self {
        Self { _private: () }
    }

    /// Execute a query plan against a log snapshot
    ///
    /// # Arguments
    /// * `plan` - Parsed query plan from `QueryEngine::parse()`
    /// * `records` - Log snapshot in append order
    ///
    /// # Errors
    /// Returns `Error::Query` if a column does not exist or an expression is not
    /// supported.
    ///
    /// # Example
    /// ```rust
    /// use std::sync::Arc;
    /// use beaver::bus::Record;
    /// use beaver::query::{QueryEngine, QueryExecutor};
    ///
    /// # fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let records = vec![Arc::new(Record {
    ///     id: 1,
    ///     topic: "features".to_string(),
    ///     key: "a".to_string(),
    ///     created_at: chrono::Utc::now(),
    ///     value: b"{}".to_vec(),
    /// })];
    ///
    /// let plan = QueryEngine::new().parse("SELECT key FROM messages WHERE topic = 'features'")?;
    /// let rows = QueryExecutor::new().execute(&plan, &records)?;
    /// assert_eq!(rows.len(), 1);
    /// # Ok(())
    /// # }
    /// ```
    pub fn execute(&self, plan: &QueryPlan, records: &[Arc<Record>]) -> Result<Vec<Row>> {
        Ok(self.run(plan, records)?.0)
    }

    /// Execute a plan, also returning the affinity of each output column.
    fn run(
        &self,
        plan: &QueryPlan,
        records: &[Arc<Record>],
    ) -> Result<(Vec<Row>, Vec<Affinity>)> {
        let (input, input_affinity) = match &plan.source {
            Source::Log => (
                records.iter().map(|record| record.to_row()).collect(),
                LOG_AFFINITY.to_vec(),
            ),
            Source::Derived(subquery) => self.run(subquery, records)?,
        };

        // Apply WHERE filter
        let mut kept = Vec::with_capacity(input.len());
        for row in input {
            if let Some(filter) = &plan.filter {
                if eval(filter, Scope::single(&row, &input_affinity))?.truthy() != Some(true) {
                    continue;
                }
            }
            kept.push(row);
        }

        let output_affinity = kept.first().map_or_else(Vec::new, |row| {
            projected_affinity(&plan.projection, row, &input_affinity)
        });

        let mut projected = Vec::with_capacity(kept.len());
        for row in kept {
            let out = Self::project(&plan.projection, &row, &input_affinity)?;
            projected.push((out, row));
        }

        // Apply ORDER BY + LIMIT
        let mut rows = if plan.order_by.is_empty() {
            projected.into_iter().map(|(out, _)| out).collect()
        } else {
            Self::apply_order_by(projected, &plan.order_by)?
        };
        if let Some(limit) = plan.limit {
            rows.truncate(limit);
        }

        Ok((rows, output_affinity))
    }

    fn project(projection: &[Projection], row: &Row, affinity: &[Affinity]) -> Result<Row> {
        let mut columns = Vec::new();
        let mut cells = Vec::new();
        for item in projection {
            match item {
                Projection::Wildcard => {
                    columns.extend(row.columns().iter().cloned());
                    cells.extend(row.cells().iter().cloned());
                }
                Projection::Column { expr, name } => {
                    cells.push(eval(expr, Scope::single(row, affinity))?);
                    columns.push(name.clone());
                }
            }
        }
        Ok(Row::new(columns, cells))
    }

    /// Stable sort; keys resolve against output columns first, then input columns.
    fn apply_order_by(
        rows: Vec<(Row, Row)>,
        order_by: &[(Expr, OrderDirection)],
    ) -> Result<Vec<Row>> {
        let mut keyed = Vec::with_capacity(rows.len());
        for (out, input) in rows {
            let scope = Scope {
                primary: &out,
                fallback: Some(&input),
                affinity: &[],
            };
            let keys = order_by
                .iter()
                .map(|(expr, _)| eval(expr, scope))
                .collect::<Result<Vec<_>>>()?;
            keyed.push((keys, out));
        }

        keyed.sort_by(|(a, _), (b, _)| {
            for ((x, y), (_, dir)) in a.iter().zip(b).zip(order_by) {
                let ord = match dir {
                    OrderDirection::Asc => x.sql_cmp(y),
                    OrderDirection::Desc => y.sql_cmp(x),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });

        Ok(keyed.into_iter().map(|(_, row)| row).collect())
    }
}

/// Column affinity as SQLite derives it from a declared column type.
///
/// Literals and computed expressions carry [`Affinity::None`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Affinity {
    Integer,
    Text,
    None,
}

/// Declared affinity of the log table, in `LOG_COLUMNS` order.
const LOG_AFFINITY: [Affinity; 5] = [
    Affinity::Integer,
    Affinity::Text,
    Affinity::Text,
    Affinity::Text,
    Affinity::None,
];

/// Rows an expression can see. Columns resolve against `primary` first; `affinity`
/// describes `primary`'s columns.
#[derive(Clone, Copy)]
struct Scope<'a> {
    primary: &'a Row,
    fallback: Option<&'a Row>,
    affinity: &'a [Affinity],
}

impl<'a> Scope<'a> {
    const fn single(row: &'a Row, affinity: &'a [Affinity]) -> Self {
        Self {
            primary: row,
            fallback: None,
            affinity,
        }
    }

    fn lookup(&self, name: &str) -> Result<Cell> {
        self.primary
            .get(name)
            .or_else(|| self.fallback.and_then(|row| row.get(name)))
            .cloned()
            .ok_or_else(|| Error::Query(format!("no such column: {name}")))
    }

    fn affinity_of(&self, expr: &Expr) -> Affinity {
        let name = match expr {
            Expr::Identifier(ident) => &ident.value,
            Expr::CompoundIdentifier(idents) => match idents.last() {
                Some(ident) => &ident.value,
                None => return Affinity::None,
            },
            Expr::Nested(inner) => return self.affinity_of(inner),
            _ => return Affinity::None,
        };
        self.primary
            .columns()
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .and_then(|i| self.affinity.get(i).copied())
            .unwrap_or(Affinity::None)
    }
}

/// Affinity of each output column; a column reference keeps the affinity of its source.
fn projected_affinity(projection: &[Projection], row: &Row, input: &[Affinity]) -> Vec<Affinity> {
    let scope = Scope::single(row, input);
    let mut out = Vec::new();
    for item in projection {
        match item {
            Projection::Wildcard => {
                out.extend(
                    (0..row.columns().len())
                        .map(|i| input.get(i).copied().unwrap_or(Affinity::None)),
                );
            }
            Projection::Column { expr, .. } => out.push(scope.affinity_of(expr)),
        }
    }
    out
}

fn bool_cell(value: Option<bool>) -> Cell {
    value.map_or(Cell::Null, |b| Cell::Integer(i64::from(b)))
}

fn literal(value: &Value) -> Result<Cell> {
    match value {
        Value::Number(n, _) => n
            .parse::<i64>()
            .map(Cell::Integer)
            .or_else(|_| n.parse::<f64>().map(Cell::Real))
            .map_err(|_| Error::Query(format!("invalid number literal: {n}"))),
        Value::SingleQuotedString(s) => Ok(Cell::Text(s.clone())),
        Value::Boolean(b) => Ok(Cell::Integer(i64::from(*b))),
        Value::Null => Ok(Cell::Null),
        other => Err(Error::Query(format!("unsupported literal: {other}"))),
    }
}

/// NUMERIC affinity: well-formed numeric text becomes a number, anything else is kept.
#[allow(clippy::cast_possible_truncation)]
fn to_numeric(cell: Cell) -> Cell {
    match cell {
        Cell::Text(text) => {
            let trimmed = text.trim();
            if let Ok(v) = trimmed.parse::<i64>() {
                return Cell::Integer(v);
            }
            match trimmed.parse::<f64>() {
                Ok(v) if v.is_finite() && v.fract() == 0.0 && v.abs() < 9.0e18 => {
                    Cell::Integer(v as i64)
                }
                Ok(v) if v.is_finite() => Cell::Real(v),
                _ => Cell::Text(text),
            }
        }
        other => other,
    }
}

/// TEXT affinity: numbers are rendered as text.
fn to_text(cell: Cell) -> Cell {
    match cell {
        Cell::Integer(v) => Cell::Text(v.to_string()),
        Cell::Real(v) if v.fract() == 0.0 && v.abs() < 1.0e15 => Cell::Text(format!("{v:.1}")),
        Cell::Real(v) => Cell::Text(v.to_string()),
        other => other,
    }
}

/// Conversions SQLite applies to comparison operands before comparing them.
fn coerce(left: Cell, la: Affinity, right: Cell, ra: Affinity) -> (Cell, Cell) {
    match (la, ra) {
        (Affinity::Integer, Affinity::Text | Affinity::None) => (left, to_numeric(right)),
        (Affinity::Text | Affinity::None, Affinity::Integer) => (to_numeric(left), right),
        (Affinity::Text, Affinity::None) => (left, to_text(right)),
        (Affinity::None, Affinity::Text) => (to_text(left), right),
        _ => (left, right),
    }
}

fn compare(op: &BinaryOperator, left: &Cell, right: &Cell) -> Cell {
    if matches!(left, Cell::Null) || matches!(right, Cell::Null) {
        return Cell::Null;
    }
    let ord = left.sql_cmp(right);
    let result = match op {
        BinaryOperator::Eq => ord == Ordering::Equal,
        BinaryOperator::NotEq => ord != Ordering::Equal,
        BinaryOperator::Lt => ord == Ordering::Less,
        BinaryOperator::LtEq => ord != Ordering::Greater,
        BinaryOperator::Gt => ord == Ordering::Greater,
        BinaryOperator::GtEq => ord != Ordering::Less,
        _ => return Cell::Null,
    };
    bool_cell(Some(result))
}

/// Evaluate an expression against a row scope (first row that has the column wins).
fn eval(expr: &Expr, scope: Scope<'_>) -> Result<Cell> {
    match expr {
        Expr::Identifier(ident) => scope.lookup(&ident.value),
        Expr::CompoundIdentifier(idents) => match idents.last() {
            Some(ident) => scope.lookup(&ident.value),
            None => Err(Error::Query("empty identifier".to_string())),
        },
        Expr::Value(value) => literal(value),
        Expr::Nested(inner) => eval(inner, scope),
        Expr::IsNull(inner) => Ok(bool_cell(Some(matches!(eval(inner, scope)?, Cell::Null)))),
        Expr::IsNotNull(inner) => Ok(bool_cell(Some(!matches!(
            eval(inner, scope)?,
            Cell::Null
        )))),
        Expr::UnaryOp { op, expr: inner } => {
            let value = eval(inner, scope)?;
            match (op, value) {
                (UnaryOperator::Not, value) => Ok(bool_cell(value.truthy().map(|b| !b))),
                (UnaryOperator::Minus, Cell::Integer(v)) => Ok(Cell::Integer(-v)),
                (UnaryOperator::Minus, Cell::Real(v)) => Ok(Cell::Real(-v)),
                (UnaryOperator::Plus, value) => Ok(value),
                (op, _) => Err(Error::Query(format!("unsupported unary operator: {op}"))),
            }
        }
        Expr::BinaryOp { left, op, right } => {
            let l = eval(left, scope)?;
            let r = eval(right, scope)?;
            match op {
                BinaryOperator::And => Ok(bool_cell(match (l.truthy(), r.truthy()) {
                    (Some(false), _) | (_, Some(false)) => Some(false),
                    (Some(true), Some(true)) => Some(true),
                    _ => None,
                })),
                BinaryOperator::Or => Ok(bool_cell(match (l.truthy(), r.truthy()) {
                    (Some(true), _) | (_, Some(true)) => Some(true),
                    (Some(false), Some(false)) => Some(false),
                    _ => None,
                })),
                BinaryOperator::Eq
                | BinaryOperator::NotEq
                | BinaryOperator::Lt
                | BinaryOperator::LtEq
                | BinaryOperator::Gt
                | BinaryOperator::GtEq => {
                    let (l, r) = coerce(l, scope.affinity_of(left), r, scope.affinity_of(right));
                    Ok(compare(op, &l, &r))
                }
                other => Err(Error::Query(format!("unsupported operator: {other}"))),
            }
        }
        Expr::InList {
            expr: inner,
            list,
            negated,
        } => {
            let value = eval(inner, scope)?;
            if matches!(value, Cell::Null) {
                return Ok(Cell::Null);
            }
            let affinity = scope.affinity_of(inner);
            let mut found = false;
            for item in list {
                let item_value = eval(item, scope)?;
                let (l, r) = coerce(value.clone(), affinity, item_value, scope.affinity_of(item));
                if l.sql_cmp(&r) == Ordering::Equal {
                    found = true;
                    break;
                }
            }
            Ok(bool_cell(Some(found != *negated)))
        }
        other => Err(Error::Query(format!("unsupported expression: {other}"))),
    }
}
