use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::messages::data::DataRow;
use pgwire::tokio::TlsAcceptor;
use serde_json::json;
use tokio::net::TcpStream;
use ulid::Ulid;

use crate::auth::{Directory, DirectoryAuthSource};
use crate::engine::{Engine, EngineError, Statistics};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError, Verb};

pub struct RoomdHandler {
    engine: Arc<Engine>,
    directory: Arc<Directory>,
    query_parser: Arc<RoomdQueryParser>,
}

impl RoomdHandler {
    pub fn new(engine: Arc<Engine>, directory: Arc<Directory>) -> Self {
        Self {
            engine,
            directory,
            query_parser: Arc::new(RoomdQueryParser),
        }
    }

    fn resolve_caller<C: ClientInfo>(&self, client: &C) -> PgWireResult<Caller> {
        let login = client
            .metadata()
            .get("user")
            .cloned()
            .unwrap_or_default();
        self.directory.caller(&login).ok_or_else(|| {
            user_error("28000", format!("no account for user {login:?}"))
        })
    }

    /// Parse, execute and record one statement.
    async fn run(&self, caller: &Caller, sql: &str) -> PgWireResult<Response> {
        let started = Instant::now();
        let cmd = match sql::parse_sql(sql) {
            Ok(cmd) => cmd,
            Err(e) => {
                metrics::counter!(QUERIES_TOTAL, "command" => "unparsed", "status" => "error")
                    .increment(1);
                tracing::debug!(user = %caller.id, "rejected statement: {e}");
                return Err(sql_err(e));
            }
        };
        let label = command_label(&cmd);
        let result = self.execute_command(caller, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, caller: &Caller, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertRoom(spec) => {
                let room = engine.register_room(caller, spec).await.map_err(engine_err)?;
                rooms_response(vec![room])
            }
            Command::UpdateRoom { id, patch } => {
                let room = engine
                    .update_room(caller, id, patch)
                    .await
                    .map_err(engine_err)?;
                rooms_response(vec![room])
            }
            Command::SelectRooms => rooms_response(engine.list_rooms(caller).await),
            Command::InsertBooking(req) => {
                let booking = engine
                    .create_booking(caller, req)
                    .await
                    .map_err(engine_err)?;
                self.bookings_response(vec![booking], PageMeta::single()).await
            }
            Command::UpdateBooking { id, patch } => {
                let booking = engine
                    .update_booking(caller, id, patch)
                    .await
                    .map_err(engine_err)?;
                self.bookings_response(vec![booking], PageMeta::single()).await
            }
            Command::CancelBooking { id, note } => {
                let booking = engine
                    .cancel_booking(caller, id, note)
                    .await
                    .map_err(engine_err)?;
                self.bookings_response(vec![booking], PageMeta::single()).await
            }
            Command::SetStatus { id, status, note } => {
                let booking = engine
                    .set_status(caller, id, status, note)
                    .await
                    .map_err(engine_err)?;
                self.bookings_response(vec![booking], PageMeta::single()).await
            }
            Command::DeleteBooking { id } => {
                engine.delete_booking(caller, id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectBooking { id } => {
                let booking = engine.get_booking(caller, id).await.map_err(engine_err)?;
                self.bookings_response(vec![booking], PageMeta::single()).await
            }
            Command::SelectMyBookings(query) => {
                let page = engine
                    .list_own_bookings(caller, &query)
                    .await
                    .map_err(engine_err)?;
                self.page_response(page).await
            }
            Command::SelectBookings(query) => {
                let page = engine
                    .list_bookings(caller, &query)
                    .await
                    .map_err(engine_err)?;
                self.page_response(page).await
            }
            Command::SelectStatistics { period } => {
                let stats = engine
                    .statistics(caller, period)
                    .await
                    .map_err(engine_err)?;
                statistics_response(&stats)
            }
            Command::SelectUpcoming { days } => {
                let items = engine.upcoming(caller, days).await.map_err(engine_err)?;
                let meta = PageMeta {
                    page: 1,
                    limit: items.len(),
                    total: items.len(),
                    total_pages: usize::from(!items.is_empty()),
                };
                self.bookings_response(items, meta).await
            }
        }
    }

    async fn bookings_response(&self, items: Vec<Booking>, meta: PageMeta) -> PgWireResult<Response> {
        let names = self.engine.room_names().await;
        let schema = Arc::new(booking_schema());
        let rows: Vec<PgWireResult<DataRow>> = items
            .iter()
            .map(|b| encode_booking(&schema, b, &names, &meta))
            .collect();
        Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
    }

    /// A listing page. An empty page still yields one row, all booking
    /// columns NULL, so the paging columns reach the client.
    async fn page_response(&self, page: Page<Booking>) -> PgWireResult<Response> {
        let meta = PageMeta::of(&page);
        if !page.items.is_empty() {
            return self.bookings_response(page.items, meta).await;
        }
        let schema = Arc::new(booking_schema());
        let rows = vec![encode_empty_page(&schema, &meta)];
        Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
    }
}

// ── Row shapes ───────────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn typed_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("room_id"),
        text_field("room_name"),
        text_field("requester_id"),
        text_field("requester_name"),
        text_field("requester_email"),
        text_field("activity_name"),
        text_field("purpose"),
        text_field("start_time"),
        text_field("end_time"),
        typed_field("participants_count", Type::INT8),
        text_field("notes"),
        text_field("contact_person"),
        text_field("equipment"),
        text_field("document_path"),
        text_field("status"),
        text_field("history"),
        text_field("created_at"),
        text_field("updated_at"),
        typed_field("page", Type::INT8),
        typed_field("limit", Type::INT8),
        typed_field("total", Type::INT8),
        typed_field("total_pages", Type::INT8),
    ]
}

fn rooms_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("name"),
        typed_field("capacity", Type::INT8),
        text_field("location"),
        typed_field("active", Type::BOOL),
        text_field("open_time"),
        text_field("close_time"),
        text_field("timezone"),
        text_field("image"),
    ]
}

fn statistics_schema() -> Vec<FieldInfo> {
    vec![text_field("statistics")]
}

/// Paging columns carried on every booking row.
struct PageMeta {
    page: usize,
    limit: usize,
    total: usize,
    total_pages: usize,
}

impl PageMeta {
    fn single() -> Self {
        Self {
            page: 1,
            limit: 1,
            total: 1,
            total_pages: 1,
        }
    }

    fn of<T>(page: &Page<T>) -> Self {
        Self {
            page: page.page,
            limit: page.limit,
            total: page.total,
            total_pages: page.total_pages,
        }
    }

    fn encode(&self, encoder: &mut DataRowEncoder) -> PgWireResult<()> {
        for n in [self.page, self.limit, self.total, self.total_pages] {
            encoder.encode_field(&i64::try_from(n).unwrap_or(i64::MAX))?;
        }
        Ok(())
    }
}

/// Columns before the paging columns in `booking_schema`.
const BOOKING_COLUMNS: usize = 19;

fn encode_empty_page(schema: &Arc<Vec<FieldInfo>>, meta: &PageMeta) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    for _ in 0..BOOKING_COLUMNS {
        encoder.encode_field(&None::<String>)?;
    }
    meta.encode(&mut encoder)?;
    Ok(encoder.take_row())
}

fn encode_booking(
    schema: &Arc<Vec<FieldInfo>>,
    b: &Booking,
    names: &HashMap<Ulid, String>,
    meta: &PageMeta,
) -> PgWireResult<DataRow> {
    let contact = b
        .contact_person
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(internal)?;
    let equipment = serde_json::to_string(&b.equipment).map_err(internal)?;
    let history: Vec<_> = b
        .history
        .iter()
        .map(|c| {
            json!({
                "actor": c.actor.to_string(),
                "from": c.from,
                "to": c.to,
                "note": c.note,
                "at": format_ms(c.at),
            })
        })
        .collect();
    let history = serde_json::to_string(&history).map_err(internal)?;

    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&b.id.to_string())?;
    encoder.encode_field(&b.room_id.to_string())?;
    encoder.encode_field(&names.get(&b.room_id).cloned())?;
    encoder.encode_field(&b.requester_id.to_string())?;
    encoder.encode_field(&b.requester.name)?;
    encoder.encode_field(&b.requester.email)?;
    encoder.encode_field(&b.activity_name)?;
    encoder.encode_field(&b.purpose)?;
    encoder.encode_field(&format_ms(b.span.start))?;
    encoder.encode_field(&format_ms(b.span.end))?;
    encoder.encode_field(&b.participants_count.map(i64::from))?;
    encoder.encode_field(&b.notes)?;
    encoder.encode_field(&contact)?;
    encoder.encode_field(&equipment)?;
    encoder.encode_field(&b.document_path)?;
    encoder.encode_field(&b.status.to_string())?;
    encoder.encode_field(&history)?;
    encoder.encode_field(&format_ms(b.created_at))?;
    encoder.encode_field(&format_ms(b.updated_at))?;
    meta.encode(&mut encoder)?;
    Ok(encoder.take_row())
}

fn rooms_response(rooms: Vec<Room>) -> PgWireResult<Response> {
    let schema = Arc::new(rooms_schema());
    let rows: Vec<PgWireResult<DataRow>> = rooms
        .iter()
        .map(|room| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&room.id.to_string())?;
            encoder.encode_field(&room.name)?;
            encoder.encode_field(&i64::from(room.capacity))?;
            encoder.encode_field(&room.location)?;
            encoder.encode_field(&room.active)?;
            encoder.encode_field(&room.hours.open_str())?;
            encoder.encode_field(&room.hours.close_str())?;
            encoder.encode_field(&room.timezone)?;
            encoder.encode_field(&room.image)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn statistics_response(stats: &Statistics) -> PgWireResult<Response> {
    let schema = Arc::new(statistics_schema());
    let body = serde_json::to_string(stats).map_err(internal)?;
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&body)?;
    let rows = vec![Ok(encoder.take_row())];
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

/// Result columns for a statement, judged from its verb and table alone.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    match sql::statement_target(sql) {
        Some((Verb::Delete, _)) | None => vec![],
        Some((_, table)) => match table.as_str() {
            "rooms" => rooms_schema(),
            "statistics" => statistics_schema(),
            "bookings" | "my_bookings" | "upcoming" => booking_schema(),
            _ => vec![],
        },
    }
}

#[async_trait]
impl SimpleQueryHandler for RoomdHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let caller = self.resolve_caller(client)?;
        Ok(vec![self.run(&caller, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct RoomdQueryParser;

#[async_trait]
impl QueryParser for RoomdQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for RoomdHandler {
    type Statement = String;
    type QueryParser = RoomdQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let caller = self.resolve_caller(client)?;
        let sql = substitute_params(portal);
        self.run(&caller, &sql).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>()
            {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    substitute(&portal.statement.statement, &portal.parameters)
}

fn param_literal(param: &Option<bytes::Bytes>) -> String {
    match param {
        Some(bytes) => {
            let text = String::from_utf8_lossy(bytes);
            format!("'{}'", text.replace('\'', "''"))
        }
        None => "NULL".to_string(),
    }
}

/// Single pass over the statement: placeholders inside quoted text are left
/// alone and spliced values are never scanned again.
fn substitute(sql: &str, params: &[Option<bytes::Bytes>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.char_indices().peekable();
    let mut quote: Option<char> = None;
    while let Some((i, c)) = chars.next() {
        if let Some(q) = quote {
            // A doubled quote closes and reopens, which copies it unchanged.
            if c == q {
                quote = None;
            }
            out.push(c);
            continue;
        }
        match c {
            '\'' | '"' => {
                quote = Some(c);
                out.push(c);
            }
            '$' => {
                let mut end = i + 1;
                while let Some(&(j, d)) = chars.peek() {
                    if !d.is_ascii_digit() {
                        break;
                    }
                    end = j + 1;
                    chars.next();
                }
                let param = sql[i + 1..end]
                    .parse::<usize>()
                    .ok()
                    .and_then(|n| n.checked_sub(1))
                    .and_then(|k| params.get(k));
                match param {
                    Some(param) => out.push_str(&param_literal(param)),
                    None => out.push_str(&sql[i..end]),
                }
            }
            _ => out.push(c),
        }
    }
    out
}

// ── Factory ──────────────────────────────────────────────────────

type AuthHandler = CleartextPasswordAuthStartupHandler<DirectoryAuthSource, DefaultServerParameterProvider>;

#[derive(Clone)]
pub struct RoomdFactory {
    handler: Arc<RoomdHandler>,
    auth_handler: Arc<AuthHandler>,
    noop: Arc<NoopHandler>,
}

impl RoomdFactory {
    pub fn new(engine: Arc<Engine>, directory: Arc<Directory>) -> Self {
        let auth_source = DirectoryAuthSource::new(directory.clone());
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(RoomdHandler::new(engine, directory)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for RoomdFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    factory: Arc<RoomdFactory>,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    pgwire::tokio::process_socket(socket, tls, factory.as_ref().clone()).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

/// SQLSTATE for each engine refusal.
pub fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::InvalidInput(_) => "22023",
        EngineError::NotFound { .. } => "P0002",
        EngineError::Forbidden(_) => "42501",
        EngineError::CapacityExceeded { .. } | EngineError::OutOfOperatingHours { .. } => "23514",
        EngineError::Conflict(_) => "23P01",
        EngineError::InvalidState { .. } => "55000",
        EngineError::AlreadyExists { .. } => "23505",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::Internal(_) => "XX000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    let message = match &e {
        EngineError::Conflict(existing) => match serde_json::to_string(existing) {
            Ok(detail) => format!("{e}; conflicting booking: {detail}"),
            Err(_) => e.to_string(),
        },
        EngineError::Internal(_) => {
            tracing::error!("{e}");
            e.to_string()
        }
        _ => e.to_string(),
    };
    user_error(engine_sqlstate(&e), message)
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match &e {
        SqlError::InvalidValue { .. } => "22023",
        SqlError::NoSuchRow { .. } => "P0002",
        SqlError::UnknownTable(_) => "42P01",
        SqlError::UnknownColumn { .. } => "42703",
        _ => "42601",
    };
    user_error(code, e.to_string())
}

fn internal(e: impl std::fmt::Display) -> PgWireError {
    user_error("XX000", format!("internal error: {e}"))
}
