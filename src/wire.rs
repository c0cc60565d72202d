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
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type, METADATA_USER};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::data::DataRow;
use pgwire::messages::PgWireBackendMessage;
use tokio::net::TcpStream;

use crate::auth::{parse_user_id, SlotbookAuthSource};
use crate::directory::{DirectoryError, InMemoryDirectory};
use crate::engine::{AggregateStat, Engine, EngineError};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, ReservationFilter, StatsScope};

pub struct SlotbookHandler {
    engine: Arc<Engine>,
    directory: Arc<InMemoryDirectory>,
    query_parser: Arc<SlotbookQueryParser>,
}

impl SlotbookHandler {
    pub fn new(engine: Arc<Engine>, directory: Arc<InMemoryDirectory>) -> Self {
        Self {
            engine,
            directory,
            query_parser: Arc::new(SlotbookQueryParser),
        }
    }

    fn session_user<C: ClientInfo>(client: &C) -> PgWireResult<UserId> {
        parse_user_id(client.metadata().get(METADATA_USER).map(String::as_str))
    }

    /// Parse, execute and record metrics for one statement.
    async fn run(&self, user_id: UserId, sql: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(user_id, cmd).await;

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        if let Err(e) = &result {
            tracing::debug!(user_id, command = label, "query failed: {e}");
        }
        result
    }

    async fn execute_command(&self, user_id: UserId, cmd: Command) -> PgWireResult<Vec<Response>> {
        let engine = &self.engine;
        match cmd {
            Command::InsertReservation {
                resource_id,
                start,
                end,
            } => {
                // Not Span::new: inverted spans are the engine's to reject.
                let r = engine
                    .request_booking(user_id, resource_id, Span { start, end })
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(booking_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&(r.id as i64))?;
                encoder.encode_field(&r.status.to_string())?;
                encoder.encode_field(&r.total_price.to_string())?;
                Ok(vec![query_response(schema, vec![Ok(encoder.take_row())])])
            }
            Command::UpdateStatus { id, status } => {
                let outcome = match status {
                    ReservationStatus::Confirmed => engine.confirm_payment(id).await,
                    ReservationStatus::Rejected => engine.reject_payment(id).await,
                    ReservationStatus::Cancelled => engine.cancel_by_user(id, user_id).await,
                    // Nothing moves back to pending; this reports why.
                    ReservationStatus::Pending => {
                        engine
                            .transition_status(id, &[], ReservationStatus::Pending, Some(user_id))
                            .await
                    }
                };
                outcome.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::SelectReservations { filter } => {
                let views = match filter {
                    ReservationFilter::Id(id) => match engine.get_view(id).await {
                        Ok(view) => vec![view],
                        Err(EngineError::NotFound(_)) => vec![],
                        Err(e) => return Err(engine_err(e)),
                    },
                    ReservationFilter::User(u) => engine.list_by_user(u).await,
                    ReservationFilter::Resource(r) => engine.list_by_resource(r).await,
                    ReservationFilter::Owner(o) => engine.list_by_owner(o).await,
                    ReservationFilter::All => engine.list_all().await,
                };
                let schema = Arc::new(reservation_schema());
                let rows: Vec<PgWireResult<DataRow>> = views
                    .iter()
                    .map(|v| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&(v.id as i64))?;
                        encoder.encode_field(&(v.user_id as i64))?;
                        encoder.encode_field(&(v.resource_id as i64))?;
                        encoder.encode_field(&v.resource_name)?;
                        encoder.encode_field(&v.category)?;
                        encoder.encode_field(&v.start)?;
                        encoder.encode_field(&v.end)?;
                        encoder.encode_field(&v.total_price.to_string())?;
                        encoder.encode_field(&v.status.to_string())?;
                        encoder.encode_field(&v.created_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::SelectStats { scope } => {
                let stat = match scope {
                    StatsScope::Platform => engine.platform_stats().await,
                    StatsScope::Owner(o) => engine.owner_stats(o).await,
                    StatsScope::Resource(r) => engine.resource_stats(r).await,
                }
                .map_err(engine_err)?;
                let schema = Arc::new(stats_schema());
                Ok(vec![query_response(schema.clone(), vec![encode_stat(&schema, &stat)])])
            }
            Command::SelectResourceStats { owner_id } => {
                let breakdown = engine
                    .resource_breakdown(owner_id)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(resource_stats_schema());
                let rows: Vec<PgWireResult<DataRow>> = breakdown
                    .iter()
                    .map(|s| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&(s.resource_id as i64))?;
                        encoder.encode_field(&s.name)?;
                        encoder.encode_field(&s.category)?;
                        encoder.encode_field(&(s.count as i64))?;
                        encoder.encode_field(&s.revenue.to_string())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::SelectSlots { resource_id, date } => {
                let slots = engine.list_confirmed_slots(resource_id, date).await;
                let schema = Arc::new(slots_schema());
                let rows: Vec<PgWireResult<DataRow>> = slots
                    .iter()
                    .map(|s| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&(resource_id as i64))?;
                        encoder.encode_field(&s.start)?;
                        encoder.encode_field(&s.end)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::UpsertResource { listing } => {
                let id = listing.id;
                self.directory.upsert(listing).map_err(directory_err)?;
                tracing::info!(resource_id = id, "directory listing synced");
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
        }
    }
}

fn query_response(schema: Arc<Vec<FieldInfo>>, rows: Vec<PgWireResult<DataRow>>) -> Response {
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn encode_stat(schema: &Arc<Vec<FieldInfo>>, stat: &AggregateStat) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&(stat.count as i64))?;
    encoder.encode_field(&stat.revenue.to_string())?;
    encoder.encode_field(&stat.peak_hour.to_string())?;
    Ok(encoder.take_row())
}

// ── Result schemas ───────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::INT8),
        field("status", Type::VARCHAR),
        field("total_price", Type::VARCHAR),
    ]
}

fn reservation_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::INT8),
        field("user_id", Type::INT8),
        field("resource_id", Type::INT8),
        field("resource_name", Type::VARCHAR),
        field("category", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("total_price", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("created_at", Type::INT8),
    ]
}

fn stats_schema() -> Vec<FieldInfo> {
    vec![
        field("count", Type::INT8),
        field("revenue", Type::VARCHAR),
        field("peak_hour", Type::VARCHAR),
    ]
}

fn resource_stats_schema() -> Vec<FieldInfo> {
    vec![
        field("resource_id", Type::INT8),
        field("name", Type::VARCHAR),
        field("category", Type::VARCHAR),
        field("count", Type::INT8),
        field("revenue", Type::VARCHAR),
    ]
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![
        field("resource_id", Type::INT8),
        field("start", Type::INT8),
        field("end", Type::INT8),
    ]
}

/// Result columns for a statement, decided before its parameters are bound.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.trim_start().to_uppercase();
    if upper.starts_with("INSERT") {
        if upper.contains("RESERVATIONS") {
            return booking_schema();
        }
        return vec![];
    }
    if !upper.starts_with("SELECT") {
        return vec![];
    }
    if upper.contains("RESOURCE_STATS") {
        resource_stats_schema()
    } else if upper.contains("STATS") {
        stats_schema()
    } else if upper.contains("SLOTS") {
        slots_schema()
    } else if upper.contains("RESERVATIONS") {
        reservation_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for SlotbookHandler {
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
        let user_id = Self::session_user(client)?;
        self.run(user_id, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotbookQueryParser;

#[async_trait]
impl QueryParser for SlotbookQueryParser {
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
impl ExtendedQueryHandler for SlotbookHandler {
    type Statement = String;
    type QueryParser = SlotbookQueryParser;

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
        let user_id = Self::session_user(client)?;
        let sql = substitute_params(portal);
        let mut responses = self.run(user_id, &sql).await?;
        Ok(responses.remove(0))
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
            if let Ok(n) = sql[start..i].parse::<usize>() {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Highest index first, so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut sql = portal.statement.statement.clone();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        sql = sql.replace(&placeholder, &value);
    }
    sql
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotbookFactory {
    handler: Arc<SlotbookHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SlotbookAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SlotbookFactory {
    pub fn new(engine: Arc<Engine>, directory: Arc<InMemoryDirectory>, password: String) -> Self {
        Self {
            handler: Arc::new(SlotbookHandler::new(engine, directory)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                SlotbookAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotbookFactory {
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
    engine: Arc<Engine>,
    directory: Arc<InMemoryDirectory>,
    password: String,
) -> std::io::Result<()> {
    let factory = Arc::new(SlotbookFactory::new(engine, directory, password));
    pgwire::tokio::process_socket(socket, None, factory).await
}

// ── Error mapping ────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

/// SQLSTATE for each engine failure.
pub fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::SlotUnavailable(_) => "23P01",
        EngineError::ResourceNotFound(_) | EngineError::NotFound(_) => "P0002",
        EngineError::Forbidden(_) => "42501",
        EngineError::InvalidInterval(_) => "22007",
        EngineError::InvalidTransition { .. } => "55000",
        EngineError::Persistence(_) => "58030",
        EngineError::LimitExceeded(_) => "54000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn directory_err(e: DirectoryError) -> PgWireError {
    let code = match &e {
        DirectoryError::Invalid(_) => "22023",
        DirectoryError::Io(_) | DirectoryError::Format(_) => "58030",
    };
    user_error(code, e.to_string())
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
