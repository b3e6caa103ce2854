//! Query parsing for the in-memory event log
//!
//! The SQLite backend hands view queries straight to SQLite. The in-memory backend
//! has no database underneath, so it parses the query with `sqlparser` and interprets
//! a deliberately small SELECT subset against the `messages` table.
//!
//! ## Supported SQL Subset
//!
//! - SELECT with `*`, columns, expressions and `AS` aliases
//! - FROM `messages` (optionally aliased) or a derived table `(SELECT ...) AS alias`
//! - WHERE with AND/OR/NOT, comparisons (=, !=, <>, <, <=, >, >=),
//!   IS [NOT] NULL, [NOT] IN (...), parentheses and unary minus
//! - ORDER BY (ASC/DESC)
//! - LIMIT
//!
//! Joins, GROUP BY, DISTINCT, HAVING, OFFSET and CTEs are rejected with
//! [`Error::Query`](crate::Error::Query).
//!
//! References:
//! - sqlparser-rs: <https://docs.rs/sqlparser>
//! - SQLite datatypes (comparison rules): <https://www.sqlite.org/datatype3.html>

mod executor;

pub use executor::QueryExecutor;

use sqlparser::ast::{
    Expr, GroupByExpr, Query, Select, SelectItem, SetExpr, Statement, TableFactor,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

use crate::{Error, Result};

/// Name of the log table every backend exposes
pub const LOG_TABLE: &str = "messages";

/// Parsed SQL query with extracted components
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    /// Output columns
    pub projection: Vec<Projection>,
    /// Row source
    pub source: Source,
    /// WHERE clause expression (optional)
    pub filter: Option<Expr>,
    /// ORDER BY clauses
    pub order_by: Vec<(Expr, OrderDirection)>,
    /// LIMIT count (optional)
    pub limit: Option<usize>,
}

/// One item of the SELECT list
#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    /// `*`: every input column
    Wildcard,
    /// An expression with its output column name
    Column {
        /// Expression evaluated per row
        expr: Expr,
        /// Output column name (alias, column name, or expression text)
        name: String,
    },
}

/// Where rows come from
#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    /// The `messages` log table
    Log,
    /// A derived table (sub-select)
    Derived(Box<QueryPlan>),
}

/// Sort order direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderDirection {
    /// Ascending order (smallest first)
    Asc,
    /// Descending order (largest first)
    Desc,
}

/// Query parser
#[derive(Debug, Default)]
pub struct QueryEngine {
    dialect: GenericDialect,
}

impl QueryEngine {
    /// Create a new query engine
    #[must_use]
    pub const fn new() -> Self {
        Self {
            dialect: GenericDialect {},
        }
    }

    /// Parse SQL query into query plan
    ///
    /// # Errors
    /// Returns `Error::Query` if:
    /// - SQL is empty or syntactically invalid
    /// - Query uses unsupported features (JOINs, GROUP BY, etc.)
    /// - Multiple statements provided
    /// - The table is not `messages`
    ///
    /// # Example
    /// ```
    /// use beaver::query::{QueryEngine, Source};
    ///
    /// # fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let engine = QueryEngine::new();
    /// let plan = engine.parse("SELECT key, value FROM messages WHERE topic = 'features'")?;
    /// assert_eq!(plan.source, Source::Log);
    /// assert_eq!(plan.projection.len(), 2);
    /// # Ok(())
    /// # }
    /// ```
    pub fn parse(&self, sql: &str) -> Result<QueryPlan> {
        if sql.trim().is_empty() {
            return Err(Error::Query("empty query".to_string()));
        }

        let statements = Parser::parse_sql(&self.dialect, sql)
            .map_err(|e| Error::Query(format!("SQL parse error: {e}")))?;

        if statements.len() != 1 {
            return Err(Error::Query(
                "Only single statements supported".to_string(),
            ));
        }

        let Statement::Query(query) = &statements[0] else {
            return Err(Error::Query("Only SELECT queries supported".to_string()));
        };

        Self::parse_select_query(query)
    }

    fn parse_select_query(query: &Query) -> Result<QueryPlan> {
        if query.with.is_some() {
            return Err(unsupported("WITH clauses"));
        }
        if query.offset.is_some() {
            return Err(unsupported("OFFSET"));
        }

        let SetExpr::Select(select) = query.body.as_ref() else {
            return Err(Error::Query("Only SELECT queries supported".to_string()));
        };

        Self::reject_aggregation(select)?;

        let source = Self::extract_source(select)?;
        let projection = Self::extract_projection(&select.projection)?;
        let filter = select.selection.clone();
        let order_by = Self::extract_order_by(query.order_by.as_ref());
        let limit = Self::extract_limit(query.limit.as_ref())?;

        Ok(QueryPlan {
            projection,
            source,
            filter,
            order_by,
            limit,
        })
    }

    fn reject_aggregation(select: &Select) -> Result<()> {
        if select.distinct.is_some() {
            return Err(unsupported("DISTINCT"));
        }
        if select.having.is_some() {
            return Err(unsupported("HAVING"));
        }
        match &select.group_by {
            GroupByExpr::All(_) => Err(unsupported("GROUP BY")),
            GroupByExpr::Expressions(exprs, _) if !exprs.is_empty() => {
                Err(unsupported("GROUP BY"))
            }
            GroupByExpr::Expressions(..) => Ok(()),
        }
    }

    fn extract_source(select: &Select) -> Result<Source> {
        if select.from.is_empty() {
            return Err(Error::Query("FROM clause required".to_string()));
        }
        if select.from.len() > 1 {
            return Err(unsupported("multiple tables"));
        }

        let table_with_joins = &select.from[0];
        if !table_with_joins.joins.is_empty() {
            return Err(unsupported("JOINs"));
        }

        match &table_with_joins.relation {
            TableFactor::Table { name, .. } => {
                let table = name.0.last().map(|ident| ident.value.as_str());
                match table {
                    Some(table) if table.eq_ignore_ascii_case(LOG_TABLE) => Ok(Source::Log),
                    _ => Err(Error::Query(format!("no such table: {name}"))),
                }
            }
            TableFactor::Derived { subquery, .. } => Ok(Source::Derived(Box::new(
                Self::parse_select_query(subquery)?,
            ))),
            other => Err(Error::Query(format!("unsupported table source: {other}"))),
        }
    }

    fn extract_projection(items: &[SelectItem]) -> Result<Vec<Projection>> {
        items
            .iter()
            .map(|item| match item {
                SelectItem::Wildcard(_) => Ok(Projection::Wildcard),
                SelectItem::UnnamedExpr(expr) => Ok(Projection::Column {
                    name: Self::column_name(expr),
                    expr: expr.clone(),
                }),
                SelectItem::ExprWithAlias { expr, alias } => Ok(Projection::Column {
                    name: alias.value.clone(),
                    expr: expr.clone(),
                }),
                SelectItem::QualifiedWildcard(..) => {
                    Err(unsupported("qualified wildcards"))
                }
            })
            .collect()
    }

    /// Output name SQLite would give an un-aliased expression.
    fn column_name(expr: &Expr) -> String {
        match expr {
            Expr::Identifier(ident) => ident.value.clone(),
            Expr::CompoundIdentifier(idents) => idents
                .last()
                .map_or_else(|| expr.to_string(), |ident| ident.value.clone()),
            _ => expr.to_string(),
        }
    }

    fn extract_order_by(
        order_by: Option<&sqlparser::ast::OrderBy>,
    ) -> Vec<(Expr, OrderDirection)> {
        order_by
            .map(|ob| {
                ob.exprs
                    .iter()
                    .map(|o| {
                        let dir = if o.asc.unwrap_or(true) {
                            OrderDirection::Asc
                        } else {
                            OrderDirection::Desc
                        };
                        (o.expr.clone(), dir)
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn extract_limit(limit: Option<&Expr>) -> Result<Option<usize>> {
        match limit {
            None => Ok(None),
            Some(Expr::Value(sqlparser::ast::Value::Number(n, _))) => n
                .parse()
                .map(Some)
                .map_err(|_| Error::Query(format!("invalid LIMIT: {n}"))),
            Some(other) => Err(Error::Query(format!("unsupported LIMIT: {other}"))),
        }
    }
}

fn unsupported(feature: &str) -> Error {
    Error::Query(format!("{feature} not supported by the in-memory log"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_view_query() {
        let engine = QueryEngine::new();
        let plan = engine
            .parse("SELECT key, created_at AS ts, value FROM messages WHERE topic = 'f'")
            .unwrap();

        assert_eq!(plan.source, Source::Log);
        let names: Vec<_> = plan
            .projection
            .iter()
            .map(|p| match p {
                Projection::Column { name, .. } => name.as_str(),
                Projection::Wildcard => "*",
            })
            .collect();
        assert_eq!(names, vec!["key", "ts", "value"]);
        assert!(plan.filter.is_some());
        assert!(plan.limit.is_none());
    }

    #[test]
    fn test_parse_derived_table() {
        let engine = QueryEngine::new();
        let plan = engine
            .parse(
                "SELECT * FROM (SELECT key, created_at FROM messages) AS bounded_view \
                 WHERE \"created_at\" > '2024-01-01T00:00:00.000000Z'",
            )
            .unwrap();

        assert_eq!(plan.projection, vec![Projection::Wildcard]);
        assert!(matches!(plan.source, Source::Derived(_)));
    }

    #[test]
    fn test_parse_order_and_limit() {
        let engine = QueryEngine::new();
        let plan = engine
            .parse("SELECT key FROM messages ORDER BY created_at DESC LIMIT 5")
            .unwrap();

        assert_eq!(plan.order_by.len(), 1);
        assert_eq!(plan.order_by[0].1, OrderDirection::Desc);
        assert_eq!(plan.limit, Some(5));
    }

    #[test]
    fn test_parse_rejects_unsupported() {
        let engine = QueryEngine::new();
        for sql in [
            "",
            "SELECT FROM WHERE",
            "SELECT key FROM other_table",
            "SELECT key, COUNT(*) FROM messages GROUP BY key",
            "SELECT DISTINCT key FROM messages",
            "SELECT a.key FROM messages a JOIN messages b ON a.id = b.id",
            "SELECT 1; SELECT 2",
            "INSERT INTO messages (key) VALUES ('x')",
            "SELECT 1",
        ] {
            let err = engine.parse(sql).unwrap_err();
            assert!(matches!(err, Error::Query(_)), "expected query error for {sql}");
        }
    }
}
