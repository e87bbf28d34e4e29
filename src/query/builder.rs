//! SQL builders for the audit/event/activity/facet query surfaces.

use chrono::{DateTime, Utc};
use clickhouse::query::Query;
use clickhouse::Row;
use serde::Deserialize;

use crate::query::cursor::Cursor;
use crate::query::filter::{self, FilterExpr, SqlParam};
use crate::query::scope::ScopePredicate;
use crate::query::time::EffectiveWindow;

#[derive(Clone)]
pub enum BoundValue {
    Str(String),
    F64(f64),
    Bool(bool),
    DateTime(DateTime<Utc>),
}

pub struct RecordQuery {
    pub sql: String,
    pub params: Vec<BoundValue>,
}

/// `table`: ClickHouse table name. `timestamp_col`/`tiebreak_col`: the
/// surface's ordering columns.
pub struct SurfaceSpec<'a> {
    pub table: &'a str,
    pub timestamp_col: &'a str,
    pub tiebreak_col: &'a str,
}

pub fn build_record_query(
    surface: &SurfaceSpec,
    scope: &ScopePredicate,
    window: &EffectiveWindow,
    filter: Option<&FilterExpr>,
    cursor: Option<&Cursor>,
    limit: u32,
) -> RecordQuery {
    let mut clauses = vec![scope.clause.to_string()];
    let mut params: Vec<BoundValue> = scope.params.iter().cloned().map(BoundValue::Str).collect();

    clauses.push(format!("{} >= ?", surface.timestamp_col));
    params.push(BoundValue::DateTime(window.start));
    clauses.push(format!("{} <= ?", surface.timestamp_col));
    params.push(BoundValue::DateTime(window.end));

    if let Some(expr) = filter {
        let (clause, sql_params) = filter::to_sql(expr);
        clauses.push(clause);
        params.extend(sql_params.into_iter().map(sql_param_to_bound));
    }

    if let Some(c) = cursor {
        clauses.push(format!(
            "({ts}, {tb}) < (?, ?)",
            ts = surface.timestamp_col,
            tb = surface.tiebreak_col
        ));
        params.push(BoundValue::DateTime(c.timestamp));
        params.push(BoundValue::Str(c.tie_breaker.clone()));
    }

    let sql = format!(
        "SELECT * FROM {table} WHERE {where_clause} ORDER BY {ts} DESC, {tb} DESC LIMIT {limit}",
        table = surface.table,
        where_clause = clauses.join(" AND "),
        ts = surface.timestamp_col,
        tb = surface.tiebreak_col,
    );

    RecordQuery { sql, params }
}

/// One decoded facet aggregation row.
#[derive(Debug, Clone, Deserialize, Row)]
pub struct FacetRow {
    pub value: String,
    pub cnt: u64,
}

pub struct FacetQuery {
    pub sql: String,
    pub params: Vec<BoundValue>,
}

/// One `SELECT field, count() ... GROUP BY field ORDER BY count DESC LIMIT N`
/// per requested facet.
pub fn build_facet_query(
    table: &str,
    field: &str,
    scope: &ScopePredicate,
    window_col: &str,
    window: &EffectiveWindow,
    filter: Option<&FilterExpr>,
    limit: u32,
) -> FacetQuery {
    let mut clauses = vec![scope.clause.to_string()];
    let mut params: Vec<BoundValue> = scope.params.iter().cloned().map(BoundValue::Str).collect();

    clauses.push(format!("{window_col} >= ?"));
    params.push(BoundValue::DateTime(window.start));
    clauses.push(format!("{window_col} <= ?"));
    params.push(BoundValue::DateTime(window.end));

    if let Some(expr) = filter {
        let (clause, sql_params) = filter::to_sql(expr);
        clauses.push(clause);
        params.extend(sql_params.into_iter().map(sql_param_to_bound));
    }

    let sql = format!(
        "SELECT {field} AS value, count() AS cnt FROM {table} WHERE {where_clause} GROUP BY {field} ORDER BY cnt DESC LIMIT {limit}",
        where_clause = clauses.join(" AND "),
    );

    FacetQuery { sql, params }
}

fn sql_param_to_bound(p: SqlParam) -> BoundValue {
    match p {
        SqlParam::Str(s) => BoundValue::Str(s),
        SqlParam::Num(n) => BoundValue::F64(n),
        SqlParam::Bool(b) => BoundValue::Bool(b),
    }
}

/// Apply bound values positionally to a `clickhouse` query builder, in the
/// same order they were pushed while building the SQL text.
pub fn apply_bounds(mut query: Query, params: &[BoundValue]) -> Query {
    for p in params {
        query = match p {
            BoundValue::Str(s) => query.bind(s),
            BoundValue::F64(n) => query.bind(n),
            BoundValue::Bool(b) => query.bind(b),
            BoundValue::DateTime(dt) => query.bind(dt.timestamp()),
        };
    }
    query
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::filter::{CmpOp, Literal};
    use crate::types::{ScopeType, TenantRef};
    use chrono::TimeZone;

    fn window() -> EffectiveWindow {
        EffectiveWindow {
            start: Utc.with_ymd_and_hms(2026, 7, 1, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2026, 7, 28, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn builds_ordered_limited_query_with_scope_and_time_bounds() {
        let scope = crate::query::scope::scope_predicate(&TenantRef {
            scope_type: ScopeType::Project,
            name: "p1".into(),
        });
        let surface = SurfaceSpec {
            table: "audit_log",
            timestamp_col: "timestamp",
            tiebreak_col: "audit_id",
        };
        let q = build_record_query(&surface, &scope, &window(), None, None, 100);
        assert!(q.sql.contains("ORDER BY timestamp DESC, audit_id DESC"));
        assert!(q.sql.contains("LIMIT 100"));
        assert_eq!(q.params.len(), 3); // scope name + start + end
    }

    #[test]
    fn cursor_adds_tuple_predicate() {
        let scope = crate::query::scope::scope_predicate(&TenantRef::platform());
        let surface = SurfaceSpec {
            table: "audit_log",
            timestamp_col: "timestamp",
            tiebreak_col: "audit_id",
        };
        let cursor = Cursor {
            timestamp: Utc.with_ymd_and_hms(2026, 7, 15, 0, 0, 0).unwrap(),
            tie_breaker: "a-42".into(),
        };
        let q = build_record_query(&surface, &scope, &window(), None, Some(&cursor), 100);
        assert!(q.sql.contains("(timestamp, audit_id) < (?, ?)"));
    }

    #[test]
    fn filter_clause_is_anded_in() {
        let scope = crate::query::scope::scope_predicate(&TenantRef::platform());
        let surface = SurfaceSpec {
            table: "audit_log",
            timestamp_col: "timestamp",
            tiebreak_col: "audit_id",
        };
        let expr = FilterExpr::Compare {
            field: "verb".into(),
            op: CmpOp::Eq,
            value: Literal::Str("create".into()),
        };
        let q = build_record_query(&surface, &scope, &window(), Some(&expr), None, 100);
        assert!(q.sql.contains("verb == ?"));
    }

    #[test]
    fn facet_query_groups_and_orders_by_count() {
        let scope = crate::query::scope::scope_predicate(&TenantRef::platform());
        let q = build_facet_query("audit_log", "verb", &scope, "timestamp", &window(), None, 20);
        assert!(q.sql.contains("GROUP BY verb"));
        assert!(q.sql.contains("ORDER BY cnt DESC LIMIT 20"));
    }
}
