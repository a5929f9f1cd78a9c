use std::collections::HashMap;
use std::ops::ControlFlow;

use chrono::NaiveDate;
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    /// `upsert` is set by `ON CONFLICT ... DO UPDATE`.
    InsertRoom {
        room: Room,
        upsert: bool,
    },
    InsertClass {
        class: Class,
    },
    InsertUser {
        user: User,
    },
    InsertBooking {
        booking: NewBooking,
        returning: bool,
    },
    DeleteBooking {
        id: Ulid,
    },
    SelectRooms,
    SelectBookings {
        room_id: Option<Ulid>,
    },
    SelectOccupancy {
        room_id: Ulid,
        date: NaiveDate,
    },
    SelectSlotOptions {
        room_id: Ulid,
        date: NaiveDate,
        start_hour: Option<HourBucket>,
    },
    SelectMonthCalendar {
        date: NaiveDate,
    },
    SelectDayTimeline {
        date: NaiveDate,
    },
    SelectNotifications {
        user_id: Ulid,
    },
}

/// Column order assumed when an INSERT names no columns.
const ROOM_COLUMNS: &[&str] = &["id", "name", "type"];
const CLASS_COLUMNS: &[&str] = &["id", "name"];
const USER_COLUMNS: &[&str] = &["id", "name", "class_id"];
const BOOKING_COLUMNS: &[&str] = &["room_id", "user_id", "title", "start", "end", "description", "class_id"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    parse_bound(sql, &[])
}

/// Parse every statement of a simple-query string. Nothing is returned unless
/// all of them parse.
pub fn parse_batch(sql: &str) -> Result<Vec<Command>, SqlError> {
    let stmts = parse_statements(sql)?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    stmts.iter().map(to_command).collect()
}

/// Parse a single statement, binding `$N` to `params[N - 1]` (text, `None` is
/// NULL) in the syntax tree.
pub fn parse_bound(sql: &str, params: &[Option<String>]) -> Result<Command, SqlError> {
    let mut stmts = parse_statements(sql)?;
    let mut stmt = match stmts.len() {
        0 => return Err(SqlError::Empty),
        1 => stmts.remove(0),
        n => return Err(SqlError::Unsupported(format!("{n} statements in one prepared query"))),
    };
    bind_params(&mut stmt, params)?;
    to_command(&stmt)
}

fn parse_statements(sql: &str) -> Result<Vec<Statement>, SqlError> {
    let dialect = PostgreSqlDialect {};
    Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))
}

fn bind_params(stmt: &mut Statement, params: &[Option<String>]) -> Result<(), SqlError> {
    let flow = ast::visit_expressions_mut(stmt, |expr| {
        let Expr::Value(ValueWithSpan { value, .. }) = expr else {
            return ControlFlow::Continue(());
        };
        let Value::Placeholder(name) = value else {
            return ControlFlow::Continue(());
        };
        let bound = name
            .strip_prefix('$')
            .and_then(|n| n.parse::<usize>().ok())
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| params.get(i));
        let Some(bound) = bound else {
            return ControlFlow::Break(SqlError::UnboundParameter(name.clone()));
        };
        *value = match bound {
            Some(text) => Value::SingleQuotedString(text.clone()),
            None => Value::Null,
        };
        ControlFlow::Continue(())
    });
    match flow {
        ControlFlow::Break(e) => Err(e),
        ControlFlow::Continue(()) => Ok(()),
    }
}

fn to_command(stmt: &Statement) -> Result<Command, SqlError> {
    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Only `ON CONFLICT ... DO UPDATE` is understood, as an upsert.
fn room_upsert(on: Option<&ast::OnInsert>) -> Result<bool, SqlError> {
    match on {
        None => Ok(false),
        Some(ast::OnInsert::OnConflict(ast::OnConflict {
            action: ast::OnConflictAction::DoUpdate(_),
            ..
        })) => Ok(true),
        Some(other) => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;

    match table.as_str() {
        "rooms" => {
            let mut row = insert_row(insert, ROOM_COLUMNS)?;
            Ok(Command::InsertRoom {
                room: Room {
                    id: parse_ulid(&take(&mut row, "id")?)?,
                    name: parse_text(&take(&mut row, "name")?)?,
                    kind: optional(&mut row, "type", parse_text_or_null)?.unwrap_or_default(),
                },
                upsert: room_upsert(insert.on.as_ref())?,
            })
        }
        "classes" => {
            let mut row = insert_row(insert, CLASS_COLUMNS)?;
            Ok(Command::InsertClass {
                class: Class {
                    id: parse_ulid(&take(&mut row, "id")?)?,
                    name: parse_text(&take(&mut row, "name")?)?,
                },
            })
        }
        "users" => {
            let mut row = insert_row(insert, USER_COLUMNS)?;
            Ok(Command::InsertUser {
                user: User {
                    id: parse_ulid(&take(&mut row, "id")?)?,
                    name: parse_text(&take(&mut row, "name")?)?,
                    class_id: optional(&mut row, "class_id", parse_ulid_or_null)?,
                },
            })
        }
        "bookings" => {
            let mut row = insert_row(insert, BOOKING_COLUMNS)?;
            if row.contains_key("id") {
                return Err(SqlError::Unsupported("booking ids are assigned by the server".into()));
            }
            Ok(Command::InsertBooking {
                booking: NewBooking {
                    room_id: parse_ulid(&take(&mut row, "room_id")?)?,
                    user_id: parse_ulid(&take(&mut row, "user_id")?)?,
                    class_id: optional(&mut row, "class_id", parse_ulid_or_null)?,
                    title: optional(&mut row, "title", parse_text_or_null)?.unwrap_or_default(),
                    start_time: parse_text(&take(&mut row, "start")?)?,
                    end_time: parse_text(&take(&mut row, "end")?)?,
                    description: optional(&mut row, "description", parse_text_or_null)?,
                },
                returning: insert.returning.is_some(),
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "bookings" => Ok(Command::DeleteBooking { id }),
        "rooms" => Err(SqlError::Unsupported("rooms cannot be deleted".into())),
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

    let mut filters = HashMap::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }
    let required = |filters: &mut HashMap<String, Expr>, col: &'static str| {
        filters.remove(col).ok_or(SqlError::MissingFilter(col))
    };

    match table.as_str() {
        "rooms" => Ok(Command::SelectRooms),
        "bookings" => Ok(Command::SelectBookings {
            room_id: filters.remove("room_id").map(|e| parse_ulid(&e)).transpose()?,
        }),
        "occupancy" => Ok(Command::SelectOccupancy {
            room_id: parse_ulid(&required(&mut filters, "room_id")?)?,
            date: parse_date(&required(&mut filters, "date")?)?,
        }),
        "slot_options" => Ok(Command::SelectSlotOptions {
            room_id: parse_ulid(&required(&mut filters, "room_id")?)?,
            date: parse_date(&required(&mut filters, "date")?)?,
            start_hour: filters.remove("start_hour").map(|e| parse_hour(&e)).transpose()?,
        }),
        "month_calendar" => Ok(Command::SelectMonthCalendar {
            date: parse_date(&required(&mut filters, "date")?)?,
        }),
        "day_timeline" => Ok(Command::SelectDayTimeline {
            date: parse_date(&required(&mut filters, "date")?)?,
        }),
        "notifications" => Ok(Command::SelectNotifications {
            user_id: parse_ulid(&required(&mut filters, "user_id")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Gather `col = value` terms joined by AND. Other predicates are ignored.
fn collect_eq_filters(expr: &Expr, filters: &mut HashMap<String, Expr>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp { left, op: ast::BinaryOperator::And, right } => {
            collect_eq_filters(left, filters)?;
            collect_eq_filters(right, filters)
        }
        Expr::BinaryOp { left, op: ast::BinaryOperator::Eq, right } => {
            if let Some(col) = expr_column_name(left) {
                filters.insert(col, right.as_ref().clone());
            }
            Ok(())
        }
        Expr::Nested(inner) => collect_eq_filters(inner, filters),
        _ => Ok(()),
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
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
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

/// The single VALUES row of an INSERT, keyed by lower-cased column name.
/// Without a column list, values are matched to `default_columns` in order.
fn insert_row(insert: &ast::Insert, default_columns: &[&str]) -> Result<HashMap<String, Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let rows = match body.body.as_ref() {
        SetExpr::Values(values) => &values.rows,
        _ => return Err(SqlError::Parse("expected VALUES".into())),
    };
    let row = match rows.as_slice() {
        [] => return Err(SqlError::Parse("empty VALUES".into())),
        [row] => row,
        _ => return Err(SqlError::Unsupported("multi-row INSERT".into())),
    };

    let columns: Vec<String> = if insert.columns.is_empty() {
        default_columns.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if row.len() > columns.len() || (!insert.columns.is_empty() && row.len() != columns.len()) {
        return Err(SqlError::WrongArity(columns.len(), row.len()));
    }
    Ok(columns.into_iter().zip(row.iter().cloned()).collect())
}

fn take(row: &mut HashMap<String, Expr>, col: &'static str) -> Result<Expr, SqlError> {
    row.remove(col).ok_or(SqlError::MissingColumn(col))
}

/// Parse an optional column whose parser already maps NULL to `None`.
fn optional<T>(
    row: &mut HashMap<String, Expr>,
    col: &str,
    parse: fn(&Expr) -> Result<Option<T>, SqlError>,
) -> Result<Option<T>, SqlError> {
    row.remove(col).map_or(Ok(None), |e| parse(&e))
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    let mut filters = HashMap::new();
    collect_eq_filters(sel, &mut filters)?;
    let id = filters.remove("id").ok_or(SqlError::MissingFilter("id"))?;
    parse_ulid(&id)
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

fn parse_text_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) | Some(Value::DoubleQuotedString(s)) => Ok(Some(s.clone())),
        Some(Value::Number(s, _)) => Ok(Some(s.clone())),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    parse_text_or_null(expr)?.ok_or_else(|| SqlError::Parse("unexpected NULL".into()))
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    parse_text_or_null(expr)?
        .map(|s| Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}"))))
        .transpose()
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    parse_ulid_or_null(expr)?.ok_or_else(|| SqlError::Parse("expected ULID, got NULL".into()))
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_text(expr)?;
    let date = NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))?;
    if !day_in_range(date) {
        return Err(SqlError::Parse(format!("date {s:?} out of range")));
    }
    Ok(date)
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_hour(expr: &Expr) -> Result<HourBucket, SqlError> {
    let v = parse_i64_expr(expr)?;
    HourBucket::try_from(v)
        .ok()
        .filter(|h| *h < 24)
        .ok_or_else(|| SqlError::Parse(format!("hour {v} out of range 0..=23")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("expected {0} values, got {1}")]
    WrongArity(usize, usize),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("no value bound for parameter {0}")]
    UnboundParameter(String),
}
