use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use sqlparser::ast::{
    self, AssignmentTarget, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement,
    TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::limits::DEFAULT_DURATION_MINUTES;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertTables {
        tables: Vec<Table>,
    },
    SelectTables {
        min_capacity: Option<u32>,
    },
    SelectAvailability {
        start: Ms,
        guests: u32,
        duration_minutes: u32,
    },
    InsertReservation {
        draft: ReservationDraft,
        returning: bool,
    },
    UpdateReservation {
        id: Ulid,
        patch: ReservationPatch,
        returning: bool,
    },
    DeleteReservation {
        id: Ulid,
        returning: bool,
    },
    SelectReservations {
        filter: ReservationFilter,
    },
    /// `day: None` means today (UTC).
    SelectStats {
        day: Option<Ms>,
    },
}

/// Positional order when an INSERT names no columns.
const TABLE_COLUMNS: &[&str] = &["id", "number", "capacity"];
const RESERVATION_COLUMNS: &[&str] = &[
    "table_id", "name", "email", "phone", "date", "guests", "duration", "notes", "id",
];

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
            returning,
            ..
        } => parse_update(table, assignments, selection, returning.is_some()),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let rows = extract_insert_rows(insert)?;
    let named: Vec<String> = insert.columns.iter().map(|c| c.value.to_lowercase()).collect();

    match table.as_str() {
        "tables" => {
            let columns = columns_or_default(named, TABLE_COLUMNS);
            let mut tables = Vec::with_capacity(rows.len());
            for row in rows {
                let values = bind_row(&columns, row, TABLE_COLUMNS)?;
                tables.push(Table {
                    id: match values.get("id") {
                        Some(e) => parse_ulid("id", e)?,
                        None => Ulid::new(),
                    },
                    number: parse_u32("number", require(&values, "number")?)?,
                    capacity: parse_u32("capacity", require(&values, "capacity")?)?,
                });
            }
            Ok(Command::InsertTables { tables })
        }
        "reservations" => {
            if rows.len() != 1 {
                return Err(SqlError::Unsupported("multi-row INSERT into reservations".into()));
            }
            let columns = columns_or_default(named, RESERVATION_COLUMNS);
            let values = bind_row(&columns, &rows[0], RESERVATION_COLUMNS)?;
            let draft = ReservationDraft {
                id: values.get("id").map(|e| parse_ulid_or_null("id", e)).transpose()?.flatten(),
                table_id: parse_ulid("table_id", require(&values, "table_id")?)?,
                name: parse_text("name", require(&values, "name")?)?,
                email: parse_text("email", require(&values, "email")?)?,
                phone: parse_text("phone", require(&values, "phone")?)?,
                start: parse_timestamp("date", require(&values, "date")?)?,
                guests: parse_u32("guests", require(&values, "guests")?)?,
                duration_minutes: match values.get("duration") {
                    Some(e) => parse_u32_or_null("duration", e)?.unwrap_or(DEFAULT_DURATION_MINUTES),
                    None => DEFAULT_DURATION_MINUTES,
                },
                notes: values
                    .get("notes")
                    .map(|e| parse_text_or_null("notes", e))
                    .transpose()?
                    .flatten(),
            };
            Ok(Command::InsertReservation {
                draft,
                returning: insert.returning.is_some(),
            })
        }
        "availability" | "reservation_stats" => Err(SqlError::Unsupported(format!("{table} is read-only"))),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
    returning: bool,
) -> Result<Command, SqlError> {
    let name = table_factor_name(&table.relation)?;
    if name != "reservations" {
        return match name.as_str() {
            "tables" | "availability" | "reservation_stats" => {
                Err(SqlError::Unsupported(format!("UPDATE on {name}")))
            }
            _ => Err(SqlError::UnknownTable(name)),
        };
    }
    let id = extract_where_id(selection)?;

    let mut patch = ReservationPatch::default();
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => {
                object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))?
            }
            AssignmentTarget::Tuple(_) => {
                return Err(SqlError::Unsupported("tuple assignment".into()));
            }
        };
        let value = &assignment.value;
        match column.as_str() {
            "table_id" => patch.table_id = Some(parse_ulid("table_id", value)?),
            "name" => patch.name = Some(parse_text("name", value)?),
            "email" => patch.email = Some(parse_text("email", value)?),
            "phone" => patch.phone = Some(parse_text("phone", value)?),
            "date" => patch.start = Some(parse_timestamp("date", value)?),
            "guests" => patch.guests = Some(parse_u32("guests", value)?),
            "duration" => patch.duration_minutes = Some(parse_u32("duration", value)?),
            "status" => patch.status = Some(parse_status(value)?),
            "notes" => patch.notes = Some(parse_text_or_null("notes", value)?),
            "id" | "created_at" | "end" | "table_number" | "table_capacity" => {
                return Err(SqlError::invalid(&column, "column is read-only"));
            }
            _ => return Err(SqlError::UnknownColumn(column)),
        }
    }

    Ok(Command::UpdateReservation { id, patch, returning })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    match table.as_str() {
        "reservations" => Ok(Command::DeleteReservation {
            id: extract_where_id(&delete.selection)?,
            returning: delete.returning.is_some(),
        }),
        "tables" | "availability" | "reservation_stats" => {
            Err(SqlError::Unsupported(format!("DELETE from {table}")))
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    let mut conditions = Vec::new();
    if let Some(selection) = &select.selection {
        collect_conditions(selection, &mut conditions)?;
    }

    match table.as_str() {
        "tables" => {
            let mut min_capacity = None;
            for (column, op, value) in conditions {
                match (column.as_str(), op) {
                    ("capacity", BinaryOperator::GtEq) => min_capacity = Some(parse_u32("capacity", value)?),
                    ("capacity", BinaryOperator::Gt) => {
                        let n = parse_u32("capacity", value)?;
                        min_capacity = Some(n.saturating_add(1));
                    }
                    _ => return Err(SqlError::unsupported_filter(&table, &column, op)),
                }
            }
            Ok(Command::SelectTables { min_capacity })
        }
        "availability" => {
            let (mut date, mut time, mut guests, mut duration) = (None, None, None, None);
            for (column, op, value) in conditions {
                if *op != BinaryOperator::Eq {
                    return Err(SqlError::unsupported_filter(&table, &column, op));
                }
                match column.as_str() {
                    "date" => date = Some(parse_date("date", value)?),
                    "time" => time = Some(parse_time("time", value)?),
                    "guests" => guests = Some(parse_u32("guests", value)?),
                    "duration" => duration = Some(parse_u32("duration", value)?),
                    _ => return Err(SqlError::UnknownColumn(column)),
                }
            }
            let date = date.ok_or(SqlError::MissingFilter("date"))?;
            let time = time.ok_or(SqlError::MissingFilter("time"))?;
            Ok(Command::SelectAvailability {
                start: date.and_time(time).and_utc().timestamp_millis(),
                guests: guests.ok_or(SqlError::MissingFilter("guests"))?,
                duration_minutes: duration.unwrap_or(DEFAULT_DURATION_MINUTES),
            })
        }
        "reservations" => {
            let mut filter = ReservationFilter::default();
            for (column, op, value) in conditions {
                if *op != BinaryOperator::Eq {
                    return Err(SqlError::unsupported_filter(&table, &column, op));
                }
                match column.as_str() {
                    "id" => filter.id = Some(parse_ulid("id", value)?),
                    "table_id" => filter.table_id = Some(parse_ulid("table_id", value)?),
                    "status" => filter.status = Some(parse_status(value)?),
                    "date" => filter.day = Some(day_start(parse_date("date", value)?)),
                    _ => return Err(SqlError::UnknownColumn(column)),
                }
            }
            Ok(Command::SelectReservations { filter })
        }
        "reservation_stats" => {
            let mut day = None;
            for (column, op, value) in conditions {
                match (column.as_str(), op) {
                    ("date", BinaryOperator::Eq) => day = Some(day_start(parse_date("date", value)?)),
                    _ => return Err(SqlError::unsupported_filter(&table, &column, op)),
                }
            }
            Ok(Command::SelectStats { day })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten a WHERE clause of `column <op> value` terms joined by AND.
fn collect_conditions<'a>(
    expr: &'a Expr,
    out: &mut Vec<(String, &'a BinaryOperator, &'a Expr)>,
) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_conditions(inner, out),
        Expr::BinaryOp { left, op: BinaryOperator::And, right } => {
            collect_conditions(left, out)?;
            collect_conditions(right, out)
        }
        Expr::BinaryOp { left, op, right } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("condition {expr}")))?;
            out.push((column, op, right));
            Ok(())
        }
        _ => Err(SqlError::Unsupported(format!("condition {expr}"))),
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

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
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

fn extract_insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) if !values.rows.is_empty() => Ok(&values.rows),
        SetExpr::Values(_) => Err(SqlError::Parse("empty VALUES".into())),
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

/// Named columns, or the positional default when the INSERT names none.
fn columns_or_default(named: Vec<String>, default: &[&str]) -> (Vec<String>, bool) {
    if named.is_empty() {
        (default.iter().map(|c| c.to_string()).collect(), true)
    } else {
        (named, false)
    }
}

/// Pair each value with its column. A positional row may stop early and
/// leave the trailing optional columns unset.
fn bind_row<'a>(
    (columns, positional): &(Vec<String>, bool),
    row: &'a [Expr],
    known: &[&str],
) -> Result<HashMap<String, &'a Expr>, SqlError> {
    if row.len() > columns.len() || (row.len() < columns.len() && !positional) {
        return Err(SqlError::WrongArity(columns.len(), row.len()));
    }
    let mut values = HashMap::with_capacity(row.len());
    for (column, value) in columns.iter().zip(row) {
        if !known.contains(&column.as_str()) {
            return Err(SqlError::UnknownColumn(column.clone()));
        }
        if values.insert(column.clone(), value).is_some() {
            return Err(SqlError::Parse(format!("column {column} given twice")));
        }
    }
    Ok(values)
}

fn require<'a>(values: &HashMap<String, &'a Expr>, column: &'static str) -> Result<&'a Expr, SqlError> {
    values.get(column).copied().ok_or(SqlError::MissingColumn(column))
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid("id", right),
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

/// Literal as text; `None` for NULL. Bound parameters arrive as quoted strings.
fn literal(column: &str, expr: &Expr) -> Result<Option<String>, SqlError> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => Ok(Some(s.clone())),
            Value::Boolean(b) => Ok(Some(b.to_string())),
            Value::Null => Ok(None),
            other => Err(SqlError::invalid(column, format!("unsupported literal {other}"))),
        },
        Expr::UnaryOp {
            op: ast::UnaryOperator::Minus,
            expr,
        } => Ok(literal(column, expr)?.map(|s| format!("-{s}"))),
        _ => Err(SqlError::invalid(column, format!("expected a literal, got {expr}"))),
    }
}

fn non_null(column: &str, expr: &Expr) -> Result<String, SqlError> {
    literal(column, expr)?.ok_or_else(|| SqlError::invalid(column, "must not be NULL"))
}

fn parse_ulid(column: &str, expr: &Expr) -> Result<Ulid, SqlError> {
    let s = non_null(column, expr)?;
    Ulid::from_string(s.trim()).map_err(|e| SqlError::invalid(column, format!("bad ULID: {e}")))
}

fn parse_ulid_or_null(column: &str, expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    match literal(column, expr)? {
        None => Ok(None),
        Some(_) => parse_ulid(column, expr).map(Some),
    }
}

fn parse_u32(column: &str, expr: &Expr) -> Result<u32, SqlError> {
    let s = non_null(column, expr)?;
    s.trim()
        .parse::<u32>()
        .map_err(|_| SqlError::invalid(column, format!("{s} is not a non-negative integer")))
}

fn parse_u32_or_null(column: &str, expr: &Expr) -> Result<Option<u32>, SqlError> {
    match literal(column, expr)? {
        None => Ok(None),
        Some(_) => parse_u32(column, expr).map(Some),
    }
}

fn parse_text(column: &str, expr: &Expr) -> Result<String, SqlError> {
    non_null(column, expr)
}

fn parse_text_or_null(column: &str, expr: &Expr) -> Result<Option<String>, SqlError> {
    literal(column, expr)
}

fn parse_status(expr: &Expr) -> Result<ReservationStatus, SqlError> {
    let s = non_null("status", expr)?;
    ReservationStatus::parse(&s).ok_or_else(|| SqlError::invalid("status", format!("unknown status {s}")))
}

fn parse_date(column: &str, expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = non_null(column, expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|_| SqlError::invalid(column, format!("{s} is not a YYYY-MM-DD date")))
}

fn parse_time(column: &str, expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = non_null(column, expr)?;
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .map_err(|_| SqlError::invalid(column, format!("{s} is not an HH:MM time")))
}

/// Unix ms, RFC 3339, or a naive `YYYY-MM-DD[T ]HH:MM[:SS]` taken as UTC.
fn parse_timestamp(column: &str, expr: &Expr) -> Result<Ms, SqlError> {
    let s = non_null(column, expr)?;
    let s = s.trim();
    if let Ok(ms) = s.parse::<Ms>() {
        return Ok(ms);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.timestamp_millis());
    }
    ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|dt| dt.and_utc().timestamp_millis())
        .ok_or_else(|| SqlError::invalid(column, format!("{s} is not a timestamp")))
}

/// Midnight UTC of `date`, in ms.
pub fn day_start(date: NaiveDate) -> Ms {
    date.and_time(NaiveTime::MIN).and_utc().timestamp_millis()
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    WrongArity(usize, usize),
    MissingColumn(&'static str),
    MissingFilter(&'static str),
    InvalidValue { column: String, reason: String },
}

impl SqlError {
    fn invalid(column: &str, reason: impl Into<String>) -> Self {
        SqlError::InvalidValue {
            column: column.to_string(),
            reason: reason.into(),
        }
    }

    fn unsupported_filter(table: &str, column: &str, op: &BinaryOperator) -> Self {
        SqlError::Unsupported(format!("filter {column} {op} on {table}"))
    }

    pub fn sqlstate(&self) -> &'static str {
        match self {
            SqlError::Parse(_) | SqlError::Empty | SqlError::Unsupported(_) | SqlError::WrongArity(..) => {
                "42601"
            }
            SqlError::UnknownTable(_) => "42P01",
            SqlError::UnknownColumn(_) => "42703",
            SqlError::MissingColumn(_) | SqlError::MissingFilter(_) => "23502",
            SqlError::InvalidValue { .. } => "22023",
        }
    }
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::WrongArity(expected, got) => {
                write!(f, "expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(col) => write!(f, "missing value for column: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::InvalidValue { column, reason } => write!(f, "invalid {column}: {reason}"),
        }
    }
}

impl std::error::Error for SqlError {}
