use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler};
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
use tokio::net::TcpStream;

use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability;
use crate::sql::{self, Command};
use crate::store::Store;

/// What a connection talks to: the booking engine, the roster store for
/// class and user administration, and the notification inbox.
pub struct Backend {
    pub engine: Arc<Engine>,
    pub store: Arc<Store>,
    pub hub: Arc<NotifyHub>,
}

pub struct RoomcalHandler {
    backend: Arc<Backend>,
    query_parser: Arc<RoomcalQueryParser>,
}

impl RoomcalHandler {
    pub fn new(backend: Arc<Backend>) -> Self {
        Self {
            backend,
            query_parser: Arc::new(RoomcalQueryParser),
        }
    }

    async fn run(&self, cmd: Command) -> PgWireResult<Vec<Response>> {
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Vec<Response>> {
        let engine = &self.backend.engine;
        match cmd {
            Command::InsertRoom { room, upsert } => {
                if upsert {
                    engine.upsert_room(room).await.map_err(engine_err)?;
                } else {
                    engine.create_room(room).await.map_err(engine_err)?;
                }
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::InsertClass { class } => {
                self.backend
                    .store
                    .insert_class(class)
                    .await
                    .map_err(|e| engine_err(e.into()))?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::InsertUser { user } => {
                self.backend
                    .store
                    .insert_user(user)
                    .await
                    .map_err(|e| engine_err(e.into()))?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::InsertBooking { booking, returning } => {
                let created = engine.create_booking(booking).await.map_err(engine_err)?;
                if returning {
                    Ok(vec![bookings_response(vec![created])])
                } else {
                    Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
                }
            }
            Command::DeleteBooking { id } => {
                engine.delete_booking(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectRooms => {
                let rooms = engine.list_rooms().await.map_err(engine_err)?;
                Ok(vec![rows_response(rooms_schema(), rooms, |enc, room| {
                    enc.encode_field(&room.id.to_string())?;
                    enc.encode_field(&room.name)?;
                    enc.encode_field(&room.kind)
                })])
            }
            Command::SelectBookings { room_id } => {
                let bookings = engine.list_bookings(room_id).await.map_err(engine_err)?;
                Ok(vec![bookings_response(bookings)])
            }
            Command::SelectOccupancy { room_id, date } => {
                let hours = engine.occupancy(room_id, date).await.map_err(engine_err)?;
                let rid = room_id.to_string();
                let day = date.to_string();
                Ok(vec![rows_response(occupancy_schema(), hours, |enc, hour| {
                    enc.encode_field(&rid)?;
                    enc.encode_field(&day)?;
                    enc.encode_field(&(hour as i32))
                })])
            }
            Command::SelectSlotOptions { room_id, date, start_hour } => {
                let opts = engine
                    .slot_options(room_id, date, start_hour)
                    .await
                    .map_err(engine_err)?;
                let rows = opts
                    .starts
                    .into_iter()
                    .map(|o| ("start", o))
                    .chain(opts.ends.into_iter().map(|o| ("end", o)));
                Ok(vec![rows_response(slot_options_schema(), rows, |enc, (kind, opt)| {
                    enc.encode_field(&kind)?;
                    enc.encode_field(&(opt.hour as i32))?;
                    enc.encode_field(&opt.available)
                })])
            }
            Command::SelectMonthCalendar { date } => {
                let view = engine.month_calendar(date).await.map_err(engine_err)?;
                let blanks = view.leading_blanks as i32;
                Ok(vec![rows_response(month_schema(), view.days, |enc, day| {
                    let bookings = serde_json::to_string(&day.bookings)
                        .map_err(|e| PgWireError::ApiError(Box::new(e)))?;
                    enc.encode_field(&day.date.to_string())?;
                    enc.encode_field(&(day.week_row as i32))?;
                    enc.encode_field(&(day.weekday as i32))?;
                    enc.encode_field(&blanks)?;
                    enc.encode_field(&(day.count() as i64))?;
                    enc.encode_field(&bookings)
                })])
            }
            Command::SelectDayTimeline { date } => {
                let timeline = engine.day_timeline(date).await.map_err(engine_err)?;
                // One row per booking in a cell; a free cell is a single row of NULLs.
                let mut lines = Vec::new();
                for row in timeline.rows {
                    let room_id = row.room.id.to_string();
                    for cell in row.cells {
                        if cell.entries.is_empty() {
                            lines.push((room_id.clone(), row.room.name.clone(), cell.hour, None));
                        }
                        for entry in cell.entries {
                            lines.push((room_id.clone(), row.room.name.clone(), cell.hour, Some(entry)));
                        }
                    }
                }
                Ok(vec![rows_response(timeline_schema(), lines, |enc, (room_id, room_name, hour, entry)| {
                    let label = entry.as_ref().and_then(|e| e.label.as_ref());
                    enc.encode_field(&room_id)?;
                    enc.encode_field(&room_name)?;
                    enc.encode_field(&(hour as i32))?;
                    enc.encode_field(&entry.as_ref().map(|e| e.booking_id.to_string()))?;
                    enc.encode_field(&label.map(|l| l.title.clone()))?;
                    enc.encode_field(&label.and_then(|l| l.user_name.clone()))?;
                    enc.encode_field(&label.and_then(|l| l.class_name.clone()))
                })])
            }
            Command::SelectNotifications { user_id } => {
                let inbox = self.backend.hub.recent(user_id);
                Ok(vec![rows_response(notifications_schema(), inbox, |enc, n| {
                    enc.encode_field(&n.user_id.to_string())?;
                    enc.encode_field(&n.title)?;
                    enc.encode_field(&n.message)?;
                    enc.encode_field(&n.url)
                })])
            }
        }
    }
}

/// Encode `items` as the rows of one result set.
fn rows_response<T>(
    schema: Vec<FieldInfo>,
    items: impl IntoIterator<Item = T>,
    encode: impl Fn(&mut DataRowEncoder, T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .into_iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn bookings_response(bookings: Vec<Booking>) -> Response {
    rows_response(bookings_schema(), bookings, |enc, b| {
        enc.encode_field(&b.id.to_string())?;
        enc.encode_field(&b.room_id.to_string())?;
        enc.encode_field(&b.user_id.to_string())?;
        enc.encode_field(&b.class_id.map(|c| c.to_string()))?;
        enc.encode_field(&b.title)?;
        enc.encode_field(&b.start_time)?;
        enc.encode_field(&b.end_time)?;
        enc.encode_field(&b.description)
    })
}

// ── Result schemas ───────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn rooms_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("type", Type::VARCHAR),
    ]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("room_id", Type::VARCHAR),
        field("user_id", Type::VARCHAR),
        field("class_id", Type::VARCHAR),
        field("title", Type::VARCHAR),
        field("start", Type::VARCHAR),
        field("end", Type::VARCHAR),
        field("description", Type::VARCHAR),
    ]
}

fn occupancy_schema() -> Vec<FieldInfo> {
    vec![
        field("room_id", Type::VARCHAR),
        field("date", Type::VARCHAR),
        field("hour", Type::INT4),
    ]
}

fn slot_options_schema() -> Vec<FieldInfo> {
    vec![
        field("kind", Type::VARCHAR),
        field("hour", Type::INT4),
        field("available", Type::BOOL),
    ]
}

fn month_schema() -> Vec<FieldInfo> {
    vec![
        field("date", Type::VARCHAR),
        field("week_row", Type::INT4),
        field("weekday", Type::INT4),
        field("leading_blanks", Type::INT4),
        field("booking_count", Type::INT8),
        field("bookings", Type::VARCHAR),
    ]
}

fn timeline_schema() -> Vec<FieldInfo> {
    vec![
        field("room_id", Type::VARCHAR),
        field("room_name", Type::VARCHAR),
        field("hour", Type::INT4),
        field("booking_id", Type::VARCHAR),
        field("title", Type::VARCHAR),
        field("user_name", Type::VARCHAR),
        field("class_name", Type::VARCHAR),
    ]
}

fn notifications_schema() -> Vec<FieldInfo> {
    vec![
        field("user_id", Type::VARCHAR),
        field("title", Type::VARCHAR),
        field("message", Type::VARCHAR),
        field("url", Type::VARCHAR),
    ]
}

/// Result columns a statement will produce, judged from its text alone since
/// prepared statements still carry `$N` placeholders.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.trim_start().to_uppercase();
    if upper.starts_with("INSERT") {
        return if upper.contains("RETURNING") && upper.contains("BOOKINGS") {
            bookings_schema()
        } else {
            vec![]
        };
    }
    if !upper.starts_with("SELECT") {
        return vec![];
    }
    let table = upper
        .split(" FROM ")
        .nth(1)
        .and_then(|rest| rest.split_whitespace().next())
        .map(|t| t.trim_matches(|c| c == ';' || c == '"').to_lowercase());
    match table.as_deref() {
        Some("rooms") => rooms_schema(),
        Some("bookings") => bookings_schema(),
        Some("occupancy") => occupancy_schema(),
        Some("slot_options") => slot_options_schema(),
        Some("month_calendar") => month_schema(),
        Some("day_timeline") => timeline_schema(),
        Some("notifications") => notifications_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for RoomcalHandler {
    async fn do_query<C>(
        &self,
        _client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        // Statements run in order; the first failure ends the batch.
        let mut responses = Vec::new();
        for cmd in sql::parse_batch(query).map_err(sql_err)? {
            match self.run(cmd).await {
                Ok(done) => responses.extend(done),
                Err(PgWireError::UserError(info)) if !responses.is_empty() => {
                    responses.push(Response::Error(info));
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(responses)
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct RoomcalQueryParser;

#[async_trait]
impl QueryParser for RoomcalQueryParser {
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
impl ExtendedQueryHandler for RoomcalHandler {
    type Statement = String;
    type QueryParser = RoomcalQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let params: Vec<Option<String>> = portal
            .parameters
            .iter()
            .map(|p| p.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
            .collect();
        let cmd = sql::parse_bound(&portal.statement.statement, &params).map_err(sql_err)?;
        self.run(cmd)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| user_error("XX000", "statement produced no result".to_string()))
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
        Ok(DescribeStatementResponse::new(param_types, result_schema(&target.statement)))
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
        Ok(DescribePortalResponse::new(result_schema(&target.statement.statement)))
    }
}

/// Highest `$N` placeholder in the SQL string.
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
            if let Ok(n) = sql[start..i].parse::<usize>() {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

// ── Auth ─────────────────────────────────────────────────────────

/// Single shared password for every user name.
#[derive(Debug)]
pub struct RoomcalAuthSource {
    password: String,
}

impl RoomcalAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for RoomcalAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

// ── Factory ──────────────────────────────────────────────────────

pub struct RoomcalFactory {
    handler: Arc<RoomcalHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<RoomcalAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl RoomcalFactory {
    pub fn new(backend: Arc<Backend>, password: String) -> Self {
        let auth_source = RoomcalAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(RoomcalHandler::new(backend)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for RoomcalFactory {
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

/// Serve one client until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    backend: Arc<Backend>,
    password: String,
) -> io::Result<()> {
    let factory = Arc::new(RoomcalFactory::new(backend, password));
    pgwire::tokio::process_socket(socket, None, factory).await
}

// ── Error mapping ────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::InvalidRange(_) => "22007",
        EngineError::OutOfWindow { .. } => "23514",
        EngineError::Conflict(_) => "23P01",
        EngineError::NotFound(_) => "02000",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::Persistence(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    let message = match &e {
        EngineError::Conflict(hits) => {
            let listed: Vec<String> = hits
                .iter()
                .map(|b| {
                    format!(
                        "{} \"{}\" [{}, {})",
                        b.id,
                        b.title,
                        b.start_time,
                        b.end_time.as_deref().unwrap_or("?")
                    )
                })
                .collect();
            format!("{e}: {}", listed.join("; "))
        }
        _ => e.to_string(),
    };
    user_error(sqlstate(&e), message)
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
