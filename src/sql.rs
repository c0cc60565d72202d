use chrono::{DateTime, NaiveDate};
use rust_decimal::Decimal;
use sqlparser::ast::{
    self, AssignmentTarget, Expr, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject,
    Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;

use crate::model::*;

/// Which reservations a `SELECT ... FROM reservations` asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationFilter {
    Id(ReservationId),
    User(UserId),
    Resource(ResourceId),
    Owner(UserId),
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsScope {
    Platform,
    Owner(UserId),
    Resource(ResourceId),
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertReservation {
        resource_id: ResourceId,
        start: Ms,
        end: Ms,
    },
    UpdateStatus {
        id: ReservationId,
        status: ReservationStatus,
    },
    SelectReservations {
        filter: ReservationFilter,
    },
    SelectStats {
        scope: StatsScope,
    },
    SelectResourceStats {
        owner_id: Option<UserId>,
    },
    SelectSlots {
        resource_id: ResourceId,
        date: NaiveDate,
    },
    UpsertResource {
        listing: ResourceListing,
    },
}

const RESERVATION_COLUMNS: &[&str] = &["resource_id", "start", "end"];
const RESOURCE_COLUMNS: &[&str] = &["id", "owner_id", "name", "category", "rate", "approved"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection.as_ref()),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "reservations" => {
            let row = Row::new(insert, &values, RESERVATION_COLUMNS, "reservations")?;
            Ok(Command::InsertReservation {
                resource_id: parse_u64_expr(row.required("resource_id")?)?,
                start: parse_timestamp_expr(row.required("start")?)?,
                end: parse_timestamp_expr(row.required("end")?)?,
            })
        }
        "resources" => {
            let row = Row::new(insert, &values, RESOURCE_COLUMNS, "resources")?;
            let rate = row
                .get("rate")
                .or_else(|| row.get("rate_per_hour"))
                .ok_or(SqlError::MissingColumn("rate"))?;
            Ok(Command::UpsertResource {
                listing: ResourceListing {
                    id: parse_u64_expr(row.required("id")?)?,
                    owner_id: parse_u64_expr(row.required("owner_id")?)?,
                    name: parse_string_expr(row.required("name")?)?,
                    category: parse_string_expr(row.required("category")?)?,
                    rate_per_hour: parse_decimal_expr(rate)?,
                    approved: row.get("approved").map(parse_bool).transpose()?.unwrap_or(false),
                },
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: Option<&Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    if table != "reservations" {
        return Err(SqlError::UnknownTable(table));
    }

    let mut status = None;
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        };
        match column.as_deref() {
            Some("status") => {
                let text = parse_string_expr(&assignment.value)?;
                status = Some(text.parse::<ReservationStatus>().map_err(SqlError::Parse)?);
            }
            Some(other) => return Err(SqlError::Unsupported(format!("SET {other}"))),
            None => return Err(SqlError::Parse("unsupported SET target".into())),
        }
    }
    let status = status.ok_or(SqlError::MissingColumn("status"))?;

    let filters = collect_filters(selection)?;
    let id = filters
        .iter()
        .find(|(col, _)| col == "id")
        .ok_or(SqlError::MissingFilter("id"))
        .and_then(|(_, e)| parse_u64_expr(e))?;
    Ok(Command::UpdateStatus { id, status })
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;
    let filters = collect_filters(select.selection.as_ref())?;

    match table.as_str() {
        "reservations" => {
            let filter = match single_filter(&filters, &["id", "user_id", "resource_id", "owner_id"])? {
                None => ReservationFilter::All,
                Some(("id", e)) => ReservationFilter::Id(parse_u64_expr(e)?),
                Some(("user_id", e)) => ReservationFilter::User(parse_u64_expr(e)?),
                Some(("resource_id", e)) => ReservationFilter::Resource(parse_u64_expr(e)?),
                Some((_, e)) => ReservationFilter::Owner(parse_u64_expr(e)?),
            };
            Ok(Command::SelectReservations { filter })
        }
        "stats" => {
            let scope = match single_filter(&filters, &["owner_id", "resource_id"])? {
                None => StatsScope::Platform,
                Some(("owner_id", e)) => StatsScope::Owner(parse_u64_expr(e)?),
                Some((_, e)) => StatsScope::Resource(parse_u64_expr(e)?),
            };
            Ok(Command::SelectStats { scope })
        }
        "resource_stats" => {
            let owner_id = single_filter(&filters, &["owner_id"])?
                .map(|(_, e)| parse_u64_expr(e))
                .transpose()?;
            Ok(Command::SelectResourceStats { owner_id })
        }
        "slots" => {
            let (mut resource_id, mut date) = (None, None);
            for (col, e) in &filters {
                match col.as_str() {
                    "resource_id" => resource_id = Some(parse_u64_expr(e)?),
                    "date" => date = Some(parse_date_expr(e)?),
                    other => return Err(SqlError::Unsupported(format!("filter on {other}"))),
                }
            }
            Ok(Command::SelectSlots {
                resource_id: resource_id.ok_or(SqlError::MissingFilter("resource_id"))?,
                date: date.ok_or(SqlError::MissingFilter("date"))?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten `a = 1 AND b = 2` into `[(a, 1), (b, 2)]`. Anything else is rejected.
fn collect_filters(selection: Option<&Expr>) -> Result<Vec<(String, Expr)>, SqlError> {
    fn walk(expr: &Expr, out: &mut Vec<(String, Expr)>) -> Result<(), SqlError> {
        match expr {
            Expr::BinaryOp { left, op, right } => match op {
                ast::BinaryOperator::And => {
                    walk(left, out)?;
                    walk(right, out)
                }
                ast::BinaryOperator::Eq => {
                    let col = expr_column_name(left)
                        .ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
                    out.push((col, right.as_ref().clone()));
                    Ok(())
                }
                _ => Err(SqlError::Unsupported(format!("operator {op}"))),
            },
            Expr::Nested(inner) => walk(inner, out),
            other => Err(SqlError::Unsupported(format!("filter {other}"))),
        }
    }

    let mut out = Vec::new();
    if let Some(expr) = selection {
        walk(expr, &mut out)?;
    }
    Ok(out)
}

/// At most one filter, and only on one of `allowed`.
fn single_filter<'a>(
    filters: &'a [(String, Expr)],
    allowed: &[&'static str],
) -> Result<Option<(&'static str, &'a Expr)>, SqlError> {
    match filters {
        [] => Ok(None),
        [(col, e)] => allowed
            .iter()
            .find(|a| **a == col.as_str())
            .map(|a| Some((*a, e)))
            .ok_or_else(|| SqlError::Unsupported(format!("filter on {col}"))),
        _ => Err(SqlError::Unsupported("at most one filter".into())),
    }
}

/// INSERT values addressed by column name. Without a column list, `defaults`
/// gives the positional order.
struct Row<'a> {
    columns: Vec<String>,
    values: &'a [Expr],
}

impl<'a> Row<'a> {
    fn new(
        insert: &ast::Insert,
        values: &'a [Expr],
        defaults: &[&str],
        table: &'static str,
    ) -> Result<Self, SqlError> {
        let columns: Vec<String> = if insert.columns.is_empty() {
            defaults.iter().map(|c| c.to_string()).collect()
        } else {
            insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
        };
        if values.len() > columns.len() {
            return Err(SqlError::WrongArity(table, columns.len(), values.len()));
        }
        Ok(Self { columns, values })
    }

    fn get(&self, column: &str) -> Option<&'a Expr> {
        let pos = self.columns.iter().position(|c| c == column)?;
        self.values.get(pos)
    }

    fn required(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(column))
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [row] => Ok(row.clone()),
            [] => Err(SqlError::Parse("empty VALUES".into())),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_u64_expr(expr: &Expr) -> Result<u64, SqlError> {
    let v = parse_i64_expr(expr)?;
    u64::try_from(v).map_err(|_| SqlError::Parse(format!("{v} is not a valid id")))
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_decimal_expr(expr: &Expr) -> Result<Decimal, SqlError> {
    match extract_value(expr) {
        Some(Value::Number(s, _) | Value::SingleQuotedString(s)) => s
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad amount {s:?}: {e}"))),
        _ => Err(SqlError::Parse(format!("expected amount, got {expr}"))),
    }
}

/// Unix milliseconds, or an RFC 3339 string such as `'2030-05-01T10:00:00+05:30'`.
fn parse_timestamp_expr(expr: &Expr) -> Result<Ms, SqlError> {
    if let Some(Value::SingleQuotedString(s)) = extract_value(expr) {
        if let Ok(ms) = s.parse::<Ms>() {
            return Ok(ms);
        }
        return DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.timestamp_millis())
            .map_err(|e| SqlError::Parse(format!("bad timestamp {s:?}: {e}")));
    }
    parse_i64_expr(expr)
}

fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string_expr(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: expected at most {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_insert_reservation_millis() {
        let sql = r#"INSERT INTO reservations (resource_id, start, "end") VALUES (4, 1900000000000, 1900003600000)"#;
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::InsertReservation {
                resource_id: 4,
                start: 1_900_000_000_000,
                end: 1_900_003_600_000,
            }
        );
    }

    #[test]
    fn parse_insert_reservation_rfc3339() {
        let sql = r#"INSERT INTO reservations (resource_id, start, "end") VALUES (4, '2030-05-01T10:00:00+05:30', '2030-05-01T11:00:00+05:30')"#;
        match parse_sql(sql).unwrap() {
            Command::InsertReservation { start, end, .. } => {
                let expected = DateTime::parse_from_rfc3339("2030-05-01T04:30:00Z")
                    .unwrap()
                    .timestamp_millis();
                assert_eq!(start, expected);
                assert_eq!(end - start, HOUR_MS);
            }
            cmd => panic!("expected InsertReservation, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_reservation_column_order() {
        let sql = r#"INSERT INTO reservations ("end", start, resource_id) VALUES (2000, 1000, 9)"#;
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::InsertReservation {
                resource_id: 9,
                start: 1000,
                end: 2000
            }
        );
    }

    #[test]
    fn parse_insert_reservation_missing_end() {
        let sql = "INSERT INTO reservations (resource_id, start) VALUES (9, 1000)";
        assert_eq!(parse_sql(sql), Err(SqlError::MissingColumn("end")));
    }

    #[test]
    fn parse_bad_timestamp() {
        let sql = r#"INSERT INTO reservations (resource_id, start, "end") VALUES (9, 'tomorrow', 2000)"#;
        assert!(matches!(parse_sql(sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_update_status() {
        for (word, status) in [
            ("confirmed", ReservationStatus::Confirmed),
            ("rejected", ReservationStatus::Rejected),
            ("cancelled", ReservationStatus::Cancelled),
        ] {
            let sql = format!("UPDATE reservations SET status = '{word}' WHERE id = 12");
            assert_eq!(parse_sql(&sql).unwrap(), Command::UpdateStatus { id: 12, status });
        }
    }

    #[test]
    fn parse_update_needs_id_and_known_status() {
        assert_eq!(
            parse_sql("UPDATE reservations SET status = 'confirmed'"),
            Err(SqlError::MissingFilter("id"))
        );
        assert!(matches!(
            parse_sql("UPDATE reservations SET status = 'paid' WHERE id = 1"),
            Err(SqlError::Parse(_))
        ));
        assert!(matches!(
            parse_sql("UPDATE reservations SET start = 5 WHERE id = 1"),
            Err(SqlError::Unsupported(_))
        ));
    }

    #[test]
    fn parse_select_reservations_filters() {
        let cases = [
            ("SELECT * FROM reservations", ReservationFilter::All),
            ("SELECT * FROM reservations WHERE id = 3", ReservationFilter::Id(3)),
            ("SELECT * FROM reservations WHERE user_id = 7", ReservationFilter::User(7)),
            ("SELECT * FROM reservations WHERE resource_id = '2'", ReservationFilter::Resource(2)),
            ("SELECT * FROM reservations WHERE owner_id = 50", ReservationFilter::Owner(50)),
        ];
        for (sql, filter) in cases {
            assert_eq!(parse_sql(sql).unwrap(), Command::SelectReservations { filter }, "{sql}");
        }
        assert!(parse_sql("SELECT * FROM reservations WHERE user_id = 1 AND id = 2").is_err());
        assert!(parse_sql("SELECT * FROM reservations WHERE price = 2").is_err());
    }

    #[test]
    fn parse_select_stats_scopes() {
        assert_eq!(
            parse_sql("SELECT * FROM stats").unwrap(),
            Command::SelectStats { scope: StatsScope::Platform }
        );
        assert_eq!(
            parse_sql("SELECT * FROM stats WHERE owner_id = 5").unwrap(),
            Command::SelectStats { scope: StatsScope::Owner(5) }
        );
        assert_eq!(
            parse_sql("SELECT count FROM stats WHERE resource_id = 9").unwrap(),
            Command::SelectStats { scope: StatsScope::Resource(9) }
        );
        assert_eq!(
            parse_sql("SELECT * FROM resource_stats WHERE owner_id = 5").unwrap(),
            Command::SelectResourceStats { owner_id: Some(5) }
        );
    }

    #[test]
    fn parse_select_slots() {
        let sql = "SELECT * FROM slots WHERE resource_id = 4 AND date = '2030-05-01'";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::SelectSlots {
                resource_id: 4,
                date: NaiveDate::from_ymd_opt(2030, 5, 1).unwrap(),
            }
        );
        assert_eq!(
            parse_sql("SELECT * FROM slots WHERE resource_id = 4"),
            Err(SqlError::MissingFilter("date"))
        );
    }

    #[test]
    fn parse_upsert_resource() {
        let sql = "INSERT INTO resources (id, owner_id, name, category, rate, approved) \
                   VALUES (4, 50, 'Court A', 'badminton', 120.50, true)";
        match parse_sql(sql).unwrap() {
            Command::UpsertResource { listing } => {
                assert_eq!(listing.id, 4);
                assert_eq!(listing.owner_id, 50);
                assert_eq!(listing.name, "Court A");
                assert_eq!(listing.rate_per_hour, Decimal::new(12050, 2));
                assert!(listing.approved);
            }
            cmd => panic!("expected UpsertResource, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_upsert_resource_defaults_unapproved() {
        let sql = "INSERT INTO resources (id, owner_id, name, category, rate_per_hour) \
                   VALUES (4, 50, 'Court A', 'badminton', '80')";
        match parse_sql(sql).unwrap() {
            Command::UpsertResource { listing } => assert!(!listing.approved),
            cmd => panic!("expected UpsertResource, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_unknown_table_errors() {
        assert_eq!(
            parse_sql("SELECT * FROM bookings"),
            Err(SqlError::UnknownTable("bookings".into()))
        );
    }

    #[test]
    fn parse_empty_errors() {
        assert_eq!(parse_sql(""), Err(SqlError::Empty));
    }

    #[test]
    fn parse_delete_unsupported() {
        assert!(matches!(
            parse_sql("DELETE FROM reservations WHERE id = 1"),
            Err(SqlError::Unsupported(_))
        ));
    }
}
