use std::collections::HashSet;
use std::str::FromStr;

use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, LimitClause, ObjectNamePart, OrderByKind, SetExpr,
    Statement, TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::documents::Upload;
use crate::engine::{
    parse_instant, BookingPatch, BookingQuery, BookingRequest, Period, RoomPatch, RoomSpec,
    SortField,
};
use crate::input;
use crate::limits::DEFAULT_UPCOMING_DAYS;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertRoom(RoomSpec),
    UpdateRoom {
        id: Ulid,
        patch: RoomPatch,
    },
    SelectRooms,
    InsertBooking(BookingRequest),
    UpdateBooking {
        id: Ulid,
        patch: BookingPatch,
    },
    CancelBooking {
        id: Ulid,
        note: Option<String>,
    },
    SetStatus {
        id: Ulid,
        status: BookingStatus,
        note: Option<String>,
    },
    DeleteBooking {
        id: Ulid,
    },
    SelectBooking {
        id: Ulid,
    },
    SelectMyBookings(BookingQuery),
    SelectBookings(BookingQuery),
    SelectStatistics {
        period: Period,
    },
    SelectUpcoming {
        days: u32,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    if stmts.len() > 1 {
        return Err(SqlError::Unsupported("multiple statements".into()));
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Statement verb, used to describe prepared statements before their
/// parameters are bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Insert,
    Update,
    Delete,
    Select,
}

/// Verb and target table of a statement, without interpreting any values.
pub fn statement_target(sql: &str) -> Option<(Verb, String)> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).ok()?;
    match stmts.first()? {
        Statement::Insert(insert) => Some((Verb::Insert, insert_table_name(insert).ok()?)),
        Statement::Update { table, .. } => {
            Some((Verb::Update, table_factor_name(&table.relation).ok()?))
        }
        Statement::Delete(delete) => Some((Verb::Delete, delete_table_name(delete).ok()?)),
        Statement::Query(query) => match query.body.as_ref() {
            SetExpr::Select(s) => {
                let first = s.from.first()?;
                Some((Verb::Select, table_factor_name(&first.relation).ok()?))
            }
            _ => None,
        },
        _ => None,
    }
}

// ── INSERT ───────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    match table.as_str() {
        "rooms" => {
            let columns = insert_columns(insert, "rooms")?;
            Ok(Command::InsertRoom(room_spec(&columns)?))
        }
        "bookings" => {
            let columns = insert_columns(insert, "bookings")?;
            Ok(Command::InsertBooking(booking_request(&columns)?))
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn room_spec(columns: &[(String, &Expr)]) -> Result<RoomSpec, SqlError> {
    let mut spec = RoomSpec::default();
    for (column, expr) in columns {
        match column.as_str() {
            "id" => spec.id = optional_ulid(column, expr)?,
            "name" => spec.name = text(column, expr)?,
            "capacity" => spec.capacity = integer(column, expr)?,
            "location" => spec.location = text(column, expr)?,
            "active" => spec.active = boolean(column, expr)?,
            "open_time" => spec.open_time = text(column, expr)?,
            "close_time" => spec.close_time = text(column, expr)?,
            "timezone" => spec.timezone = text(column, expr)?,
            "image" => spec.image = text(column, expr)?,
            _ => return Err(unknown_column("rooms", column)),
        }
    }
    Ok(spec)
}

fn booking_request(columns: &[(String, &Expr)]) -> Result<BookingRequest, SqlError> {
    let mut req = BookingRequest::default();
    let mut document = DocumentColumns::default();
    for (column, expr) in columns {
        match column.as_str() {
            "room_id" => req.room_id = text(column, expr)?,
            "activity_name" => req.activity_name = text(column, expr)?,
            "purpose" => req.purpose = text(column, expr)?,
            "start_time" => req.start_time = text(column, expr)?,
            "end_time" => req.end_time = text(column, expr)?,
            "participants_count" => req.participants_count = integer(column, expr)?,
            "notes" => req.notes = text(column, expr)?,
            "contact_person" => req.contact_person = contact_person(column, expr)?.flatten(),
            "equipment" => req.equipment = equipment(column, expr)?.unwrap_or_default(),
            "document_name" => document.name = text(column, expr)?,
            "document" => document.bytes = bytes(column, expr)?,
            _ => return Err(unknown_column("bookings", column)),
        }
    }
    req.document = document.into_upload()?;
    Ok(req)
}

/// `document_name` and `document` travel as two columns and become one upload.
#[derive(Default)]
struct DocumentColumns {
    name: Option<String>,
    bytes: Option<Vec<u8>>,
}

impl DocumentColumns {
    fn into_upload(self) -> Result<Option<Upload>, SqlError> {
        match (self.name, self.bytes) {
            (name, Some(bytes)) => Ok(Some(Upload {
                file_name: name.unwrap_or_else(|| "document".to_string()),
                bytes,
            })),
            (Some(_), None) => Err(invalid("document_name", "given without document")),
            (None, None) => Ok(None),
        }
    }
}

// ── UPDATE ───────────────────────────────────────────────────

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let name = table_factor_name(&table.relation)?;
    let id = extract_where_id(&name, selection)?;
    let columns = assignment_columns(assignments)?;

    match name.as_str() {
        "rooms" => Ok(Command::UpdateRoom {
            id,
            patch: room_patch(&columns)?,
        }),
        "bookings" => {
            let status = columns.iter().find(|(c, _)| c == "status");
            let note = columns.iter().find(|(c, _)| c == "note");
            match (status, note) {
                (Some((_, status)), note) => {
                    if let Some((other, _)) =
                        columns.iter().find(|(c, _)| c != "status" && c != "note")
                    {
                        return Err(SqlError::Unsupported(format!(
                            "status cannot be changed together with {other}"
                        )));
                    }
                    let status = not_null("status", status)?;
                    let status = BookingStatus::from_str(&status)
                        .map_err(|reason| invalid("status", reason))?;
                    let note = match note {
                        Some((_, expr)) => text("note", expr)?,
                        None => None,
                    };
                    if status == BookingStatus::Cancelled {
                        Ok(Command::CancelBooking { id, note })
                    } else {
                        Ok(Command::SetStatus { id, status, note })
                    }
                }
                (None, Some(_)) => Err(SqlError::Unsupported(
                    "note is only accepted together with status".into(),
                )),
                (None, None) => Ok(Command::UpdateBooking {
                    id,
                    patch: booking_patch(&columns)?,
                }),
            }
        }
        _ => Err(SqlError::UnknownTable(name)),
    }
}

fn room_patch(columns: &[(String, &Expr)]) -> Result<RoomPatch, SqlError> {
    let mut patch = RoomPatch::default();
    for (column, expr) in columns {
        match column.as_str() {
            "name" => patch.name = Some(not_null(column, expr)?),
            "capacity" => {
                patch.capacity =
                    Some(integer(column, expr)?.ok_or_else(|| invalid(column, "cannot be NULL"))?)
            }
            "location" => patch.location = Some(text(column, expr)?),
            "active" => {
                patch.active =
                    Some(boolean(column, expr)?.ok_or_else(|| invalid(column, "cannot be NULL"))?)
            }
            "open_time" => patch.open_time = Some(not_null(column, expr)?),
            "close_time" => patch.close_time = Some(not_null(column, expr)?),
            "timezone" => patch.timezone = Some(not_null(column, expr)?),
            "image" => patch.image = Some(text(column, expr)?),
            _ => return Err(unknown_column("rooms", column)),
        }
    }
    Ok(patch)
}

fn booking_patch(columns: &[(String, &Expr)]) -> Result<BookingPatch, SqlError> {
    let mut patch = BookingPatch::default();
    let mut document = DocumentColumns::default();
    for (column, expr) in columns {
        match column.as_str() {
            "room_id" => patch.room_id = Some(not_null(column, expr)?),
            "activity_name" => patch.activity_name = Some(not_null(column, expr)?),
            "purpose" => patch.purpose = Some(text(column, expr)?),
            "start_time" => patch.start_time = Some(not_null(column, expr)?),
            "end_time" => patch.end_time = Some(not_null(column, expr)?),
            "participants_count" => patch.participants_count = Some(integer(column, expr)?),
            "notes" => patch.notes = Some(text(column, expr)?),
            "contact_person" => {
                patch.contact_person = Some(contact_person(column, expr)?.flatten())
            }
            "equipment" => patch.equipment = Some(equipment(column, expr)?.unwrap_or_default()),
            "document_name" => document.name = text(column, expr)?,
            "document" => {
                document.bytes =
                    Some(bytes(column, expr)?.ok_or_else(|| invalid(column, "cannot be NULL"))?)
            }
            _ => return Err(unknown_column("bookings", column)),
        }
    }
    patch.document = document.into_upload()?;
    Ok(patch)
}

fn assignment_columns(assignments: &[ast::Assignment]) -> Result<Vec<(String, &Expr)>, SqlError> {
    let mut columns: Vec<(String, &Expr)> = Vec::with_capacity(assignments.len());
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name)
                .ok_or_else(|| SqlError::Parse("empty column name".into()))?,
            AssignmentTarget::Tuple(_) => {
                return Err(SqlError::Unsupported("tuple assignment".into()));
            }
        };
        if columns.iter().any(|(c, _)| *c == column) {
            return Err(SqlError::DuplicateColumn(column));
        }
        columns.push((column, &assignment.value));
    }
    Ok(columns)
}

// ── DELETE ───────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    match table.as_str() {
        "bookings" => Ok(Command::DeleteBooking {
            id: extract_where_id("bookings", &delete.selection)?,
        }),
        "rooms" => Err(SqlError::Unsupported(
            "rooms are deactivated, not deleted (UPDATE rooms SET active = false)".into(),
        )),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ───────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    if select.from.len() > 1 || !select.from[0].joins.is_empty() {
        return Err(SqlError::Unsupported("joins".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "rooms" => {
            if let Some(f) = filters.first() {
                return Err(unsupported_filter("rooms", f));
            }
            Ok(Command::SelectRooms)
        }
        "bookings" => {
            if let Some(id) = filters
                .iter()
                .find(|f| f.column == "id" && f.cmp == Cmp::Eq)
            {
                if filters.len() > 1 {
                    return Err(SqlError::Unsupported(
                        "id cannot be combined with other filters".into(),
                    ));
                }
                return Ok(Command::SelectBooking {
                    id: row_id("bookings", id.value)?,
                });
            }
            let query = booking_query("bookings", &filters, query)?;
            Ok(Command::SelectBookings(query))
        }
        "my_bookings" => {
            if let Some(f) = filters.iter().find(|f| f.column != "status") {
                return Err(unsupported_filter("my_bookings", f));
            }
            let query = booking_query("my_bookings", &filters, query)?;
            Ok(Command::SelectMyBookings(query))
        }
        "statistics" => {
            let mut period = None;
            for f in &filters {
                match (f.column.as_str(), f.cmp) {
                    ("period", Cmp::Eq) => {
                        let raw = not_null("period", f.value)?;
                        period = Some(Period::from_str(&raw).map_err(|r| invalid("period", r))?);
                    }
                    _ => return Err(unsupported_filter("statistics", f)),
                }
            }
            Ok(Command::SelectStatistics {
                period: period.ok_or(SqlError::MissingFilter("period"))?,
            })
        }
        "upcoming" => {
            let mut days = DEFAULT_UPCOMING_DAYS;
            for f in &filters {
                match (f.column.as_str(), f.cmp) {
                    ("days", Cmp::Eq) => {
                        let n = integer("days", f.value)?
                            .ok_or_else(|| invalid("days", "cannot be NULL"))?;
                        days = u32::try_from(n).map_err(|_| invalid("days", "out of range"))?;
                    }
                    _ => return Err(unsupported_filter("upcoming", f)),
                }
            }
            Ok(Command::SelectUpcoming { days })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn booking_query(
    table: &'static str,
    filters: &[Filter<'_>],
    query: &ast::Query,
) -> Result<BookingQuery, SqlError> {
    let mut q = BookingQuery::default();
    for f in filters {
        match (f.column.as_str(), f.cmp) {
            ("status", Cmp::Eq) => {
                let raw = not_null("status", f.value)?;
                q.status = Some(BookingStatus::from_str(&raw).map_err(|r| invalid("status", r))?);
            }
            ("room_id", Cmp::Eq) => q.room_id = Some(ulid("room_id", f.value)?),
            ("user_id" | "requester_id", Cmp::Eq) => q.user_id = Some(ulid(&f.column, f.value)?),
            ("start_time", Cmp::GtEq) => q.from = Some(instant("start_time", f.value)?),
            ("end_time", Cmp::LtEq) => q.to = Some(instant("end_time", f.value)?),
            ("search", Cmp::Eq) => q.search = text("search", f.value)?,
            _ => return Err(unsupported_filter(table, f)),
        }
    }

    if let Some(order_by) = &query.order_by {
        match &order_by.kind {
            OrderByKind::Expressions(exprs) => match exprs.as_slice() {
                [] => {}
                [first] => {
                    let column = expr_column_name(&first.expr).ok_or_else(|| {
                        SqlError::Unsupported(format!("ORDER BY {}", first.expr))
                    })?;
                    q.sort = SortField::from_str(&column).map_err(|r| invalid("ORDER BY", r))?;
                    q.descending = first.options.asc == Some(false);
                }
                _ => return Err(SqlError::Unsupported("ORDER BY more than one column".into())),
            },
            OrderByKind::All(_) => return Err(SqlError::Unsupported("ORDER BY ALL".into())),
        }
    }

    let (limit, offset) = match &query.limit_clause {
        None => (None, None),
        Some(LimitClause::LimitOffset { limit, offset, .. }) => {
            (limit.as_ref(), offset.as_ref().map(|o| &o.value))
        }
        Some(LimitClause::OffsetCommaLimit { offset, limit }) => (Some(limit), Some(offset)),
    };
    if let Some(limit) = limit {
        q.limit = count("LIMIT", limit)?;
    }
    if let Some(offset) = offset {
        let offset = count("OFFSET", offset)?;
        if q.limit == 0 || offset % q.limit != 0 {
            return Err(invalid("OFFSET", "must be a multiple of LIMIT"));
        }
        q.page = offset / q.limit + 1;
    }
    Ok(q)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cmp {
    Eq,
    GtEq,
    LtEq,
}

#[derive(Debug)]
struct Filter<'a> {
    column: String,
    cmp: Cmp,
    value: &'a Expr,
}

/// Flattens `a = 1 AND (b >= 2 AND c <= 3)` into comparisons.
fn collect_filters<'a>(expr: &'a Expr, out: &mut Vec<Filter<'a>>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_filters(inner, out),
        Expr::BinaryOp { left, op, right } => {
            let cmp = match op {
                ast::BinaryOperator::And => {
                    collect_filters(left, out)?;
                    return collect_filters(right, out);
                }
                ast::BinaryOperator::Eq => Cmp::Eq,
                ast::BinaryOperator::GtEq => Cmp::GtEq,
                ast::BinaryOperator::LtEq => Cmp::LtEq,
                _ => return Err(SqlError::Unsupported(format!("WHERE {expr}"))),
            };
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("WHERE {expr}")))?;
            out.push(Filter {
                column,
                cmp,
                value: right,
            });
            Ok(())
        }
        _ => Err(SqlError::Unsupported(format!("WHERE {expr}"))),
    }
}

fn unsupported_filter(table: &str, f: &Filter<'_>) -> SqlError {
    let op = match f.cmp {
        Cmp::Eq => "=",
        Cmp::GtEq => ">=",
        Cmp::LtEq => "<=",
    };
    SqlError::Unsupported(format!("filter {} {op} on {table}", f.column))
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

/// Pairs the explicit column list with the single VALUES row.
fn insert_columns<'a>(
    insert: &'a ast::Insert,
    table: &'static str,
) -> Result<Vec<(String, &'a Expr)>, SqlError> {
    if insert.columns.is_empty() {
        return Err(SqlError::Parse(format!("INSERT INTO {table} needs a column list")));
    }
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let row = match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => return Err(SqlError::Parse("empty VALUES".into())),
            [row] => row,
            _ => return Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => return Err(SqlError::Parse("expected VALUES".into())),
    };
    if row.len() != insert.columns.len() {
        return Err(SqlError::WrongArity(table, insert.columns.len(), row.len()));
    }

    let mut seen = HashSet::with_capacity(row.len());
    let mut columns = Vec::with_capacity(row.len());
    for (ident, expr) in insert.columns.iter().zip(row) {
        let column = ident.value.to_lowercase();
        if !seen.insert(column.clone()) {
            return Err(SqlError::DuplicateColumn(column));
        }
        columns.push((column, expr));
    }
    Ok(columns)
}

fn extract_where_id(table: &str, selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => row_id(table, right),
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

/// A literal as the client wrote it, casts stripped.
#[derive(Debug, PartialEq)]
enum Literal {
    Null,
    Text(String),
    Number(String),
    Bool(bool),
    Hex(String),
}

fn literal(column: &str, expr: &Expr) -> Result<Literal, SqlError> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => match value {
            Value::Null => Ok(Literal::Null),
            Value::Boolean(b) => Ok(Literal::Bool(*b)),
            Value::Number(n, _) => Ok(Literal::Number(n.clone())),
            Value::SingleQuotedString(s)
            | Value::EscapedStringLiteral(s)
            | Value::DoubleQuotedString(s)
            | Value::DollarQuotedString(ast::DollarQuotedString { value: s, .. }) => {
                Ok(Literal::Text(s.clone()))
            }
            Value::HexStringLiteral(h) => Ok(Literal::Hex(h.clone())),
            other => Err(invalid(column, format!("unsupported literal {other}"))),
        },
        Expr::UnaryOp {
            op: ast::UnaryOperator::Minus,
            expr,
        } => match literal(column, expr)? {
            Literal::Number(n) => Ok(Literal::Number(format!("-{n}"))),
            _ => Err(invalid(column, format!("expected number, got {expr}"))),
        },
        Expr::Cast { expr, .. } | Expr::Nested(expr) => literal(column, expr),
        _ => Err(invalid(column, format!("expected a literal, got {expr}"))),
    }
}

fn text(column: &str, expr: &Expr) -> Result<Option<String>, SqlError> {
    match literal(column, expr)? {
        Literal::Null => Ok(None),
        Literal::Text(s) | Literal::Number(s) => Ok(Some(s)),
        Literal::Bool(b) => Ok(Some(b.to_string())),
        Literal::Hex(_) => Err(invalid(column, "expected text, got a hex literal")),
    }
}

fn not_null(column: &str, expr: &Expr) -> Result<String, SqlError> {
    text(column, expr)?.ok_or_else(|| invalid(column, "cannot be NULL"))
}

fn integer(column: &str, expr: &Expr) -> Result<Option<i64>, SqlError> {
    match literal(column, expr)? {
        Literal::Null => Ok(None),
        Literal::Number(s) | Literal::Text(s) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| invalid(column, format!("expected an integer, got {s:?}"))),
        other => Err(invalid(column, format!("expected an integer, got {other:?}"))),
    }
}

fn count(column: &str, expr: &Expr) -> Result<usize, SqlError> {
    let n = integer(column, expr)?.ok_or_else(|| invalid(column, "cannot be NULL"))?;
    usize::try_from(n).map_err(|_| invalid(column, "cannot be negative"))
}

fn boolean(column: &str, expr: &Expr) -> Result<Option<bool>, SqlError> {
    match literal(column, expr)? {
        Literal::Null => Ok(None),
        Literal::Bool(b) => Ok(Some(b)),
        Literal::Text(s) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" | "yes" => Ok(Some(true)),
            "false" | "f" | "0" | "no" => Ok(Some(false)),
            _ => Err(invalid(column, format!("bad bool: {s}"))),
        },
        Literal::Number(n) => Ok(Some(n != "0")),
        Literal::Hex(_) => Err(invalid(column, "expected bool, got a hex literal")),
    }
}

fn ulid(column: &str, expr: &Expr) -> Result<Ulid, SqlError> {
    let raw = not_null(column, expr)?;
    Ulid::from_string(raw.trim()).map_err(|e| invalid(column, format!("bad ULID: {e}")))
}

/// A malformed key names no row, so it reads as a missing row rather than bad input.
fn row_id(table: &str, expr: &Expr) -> Result<Ulid, SqlError> {
    let raw = not_null("id", expr)?;
    Ulid::from_string(raw.trim()).map_err(|_| SqlError::NoSuchRow {
        table: table.to_string(),
        id: raw,
    })
}

fn optional_ulid(column: &str, expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    match literal(column, expr)? {
        Literal::Null => Ok(None),
        _ => ulid(column, expr).map(Some),
    }
}

fn instant(column: &str, expr: &Expr) -> Result<Ms, SqlError> {
    let raw = not_null(column, expr)?;
    parse_instant(&raw).map_err(|reason| invalid(column, reason))
}

/// bytea input: `'\x2550..'`, `X'2550..'`, or plain text taken as its bytes.
fn bytes(column: &str, expr: &Expr) -> Result<Option<Vec<u8>>, SqlError> {
    let decode = |h: &str| hex::decode(h).map_err(|e| invalid(column, format!("bad hex: {e}")));
    match literal(column, expr)? {
        Literal::Null => Ok(None),
        Literal::Hex(h) => decode(&h).map(Some),
        Literal::Text(s) => match s.strip_prefix("\\x") {
            Some(h) => decode(h).map(Some),
            None => Ok(Some(s.into_bytes())),
        },
        other => Err(invalid(column, format!("expected bytea, got {other:?}"))),
    }
}

/// `None` when the column was not a usable value, `Some(None)` for SQL NULL
/// or an all-empty contact.
fn contact_person(column: &str, expr: &Expr) -> Result<Option<Option<ContactPerson>>, SqlError> {
    match text(column, expr)? {
        None => Ok(Some(None)),
        Some(raw) => input::parse_contact_person(&raw)
            .map(Some)
            .map_err(|reason| invalid(column, reason)),
    }
}

fn equipment(column: &str, expr: &Expr) -> Result<Option<Vec<String>>, SqlError> {
    match text(column, expr)? {
        None => Ok(None),
        Some(raw) => input::parse_equipment(&raw)
            .map(Some)
            .map_err(|reason| invalid(column, reason)),
    }
}

fn invalid(column: &str, reason: impl Into<String>) -> SqlError {
    SqlError::InvalidValue {
        column: column.to_string(),
        reason: reason.into(),
    }
}

fn unknown_column(table: &'static str, column: &str) -> SqlError {
    SqlError::UnknownColumn {
        table,
        column: column.to_string(),
    }
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
    #[error("unknown column {column} in {table}")]
    UnknownColumn { table: &'static str, column: String },
    #[error("column {0} given more than once")]
    DuplicateColumn(String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("invalid value for {column}: {reason}")]
    InvalidValue { column: String, reason: String },
    #[error("no row in {table} with id {id}")]
    NoSuchRow { table: String, id: String },
}
