use std::fmt::Debug;
use std::io;
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
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::SlotbookAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, DayKey};

pub struct SlotbookHandler {
    engine: Arc<Engine>,
    query_parser: Arc<SlotbookQueryParser>,
}

impl SlotbookHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(SlotbookQueryParser),
        }
    }

    async fn run(&self, query: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::SelectSlots {
                service_id,
                date,
                duration,
            } => {
                let slots = engine
                    .available_slots(service_id, date, duration)
                    .await
                    .map_err(engine_err)?;
                Ok(slot_rows(slots))
            }
            Command::SelectNearestSlot {
                service_id,
                date,
                start,
                duration,
            } => {
                let nearest = engine
                    .find_nearest_available_slot(service_id, date, start, duration)
                    .await
                    .map_err(engine_err)?;
                Ok(slot_rows(nearest))
            }
            Command::SelectUnavailableDates {
                service_id,
                start,
                end,
            } => {
                let dates = engine
                    .unavailable_dates(service_id, start, end)
                    .await
                    .map_err(engine_err)?;
                Ok(query_response(unavailable_schema(), dates, |enc, d| {
                    enc.encode_field(&format_date(d.date))?;
                    enc.encode_field(&d.reason.as_str().to_string())
                }))
            }
            Command::SelectWorkingHours { date } => {
                let hours = engine.effective_working_hours(date).await;
                Ok(query_response(working_hours_schema(), hours, |enc, h| {
                    enc.encode_field(&format_date(date))?;
                    enc.encode_field(&format_clock(h.open))?;
                    enc.encode_field(&format_clock(h.close))?;
                    enc.encode_field(&format_breaks(&h.breaks))
                }))
            }
            Command::SelectSlotCounts {
                service_id,
                start,
                end,
            } => {
                let counts = engine
                    .slot_counts(service_id, start, end)
                    .await
                    .map_err(engine_err)?;
                Ok(query_response(counts_schema(), counts, |enc, (date, n)| {
                    enc.encode_field(&format_date(date))?;
                    enc.encode_field(&(n as i64))
                }))
            }
            Command::SelectSlotStatus { id } => {
                let available = engine.check_slot_still_available(id).await;
                Ok(query_response(status_schema(), [available], |enc, a| {
                    enc.encode_field(&id.to_string())?;
                    enc.encode_field(&a)
                }))
            }
            Command::SelectReservation { reference } => {
                let found = engine.reservation_by_reference(&reference).await;
                Ok(query_response(reservation_schema(), found, encode_reservation))
            }
            Command::SelectServices => {
                let services = engine.list_services().await;
                Ok(query_response(services_schema(), services, |enc, s| {
                    enc.encode_field(&s.id.to_string())?;
                    enc.encode_field(&s.kind.as_str().to_string())?;
                    enc.encode_field(&s.name_en)?;
                    enc.encode_field(&s.name_ar)?;
                    let durations: Vec<String> = s.durations.iter().map(|d| d.to_string()).collect();
                    enc.encode_field(&durations.join(","))?;
                    enc.encode_field(&s.active)?;
                    enc.encode_field(&s.requires_payment)
                }))
            }
            Command::InsertReservation(req) => {
                let outcome = engine.reserve_slots(req).await.map_err(engine_err)?;
                // A lost race is an ordinary outcome: zero rows inserted.
                let rows = usize::from(outcome.is_success());
                Ok(Response::Execution(Tag::new("INSERT").with_oid(0).with_rows(rows)))
            }
            Command::InsertConfirmation {
                reservation_id,
                reference,
            } => {
                engine
                    .finalize_reservation(reservation_id, &reference)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_oid(0).with_rows(1)))
            }
            Command::InsertClaimRenewal { reservation_id } => {
                engine
                    .extend_claim(reservation_id)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_oid(0).with_rows(1)))
            }
            Command::DeleteReservation { id } => {
                engine.release_reservation(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertService {
                id,
                kind,
                name_en,
                name_ar,
                durations,
                requires_payment,
            } => {
                engine
                    .create_service(id, kind, name_en, name_ar, durations, requires_payment)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_oid(0).with_rows(1)))
            }
            Command::DeleteService { id } => {
                engine
                    .set_service_active(id, false)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertWorkingHours { day, hours } => {
                set_hours(engine, day, Some(hours)).await?;
                Ok(Response::Execution(Tag::new("INSERT").with_oid(0).with_rows(1)))
            }
            Command::DeleteWorkingHours { day } => {
                set_hours(engine, day, None).await?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertUnits {
                service_id,
                date,
                units,
            } => {
                let count = units.len();
                engine
                    .publish_units(service_id, date, units)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_oid(0).with_rows(count)))
            }
            Command::InsertBlockedDate { date } => {
                engine.block_date(date).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_oid(0).with_rows(1)))
            }
            Command::DeleteBlockedDate { date } => {
                engine.unblock_date(date).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
        }
    }
}

async fn set_hours(engine: &Engine, day: DayKey, hours: Option<WorkingHours>) -> PgWireResult<()> {
    match day {
        DayKey::Weekly(weekday) => engine.set_weekly_hours(weekday, hours).await,
        DayKey::Date(date) => engine.set_date_hours(date, hours).await,
    }
    .map_err(engine_err)
}

fn format_breaks(breaks: &[Span]) -> String {
    breaks
        .iter()
        .map(|b| format!("{}-{}", format_clock(b.start), format_clock(b.end)))
        .collect::<Vec<_>>()
        .join(",")
}

fn encode_reservation(enc: &mut DataRowEncoder, r: Reservation) -> PgWireResult<()> {
    enc.encode_field(&r.id.to_string())?;
    enc.encode_field(&r.slot_id.to_string())?;
    enc.encode_field(&r.service_id.to_string())?;
    enc.encode_field(&format_date(r.date))?;
    enc.encode_field(&format_clock(r.span.start))?;
    enc.encode_field(&format_clock(r.span.end))?;
    enc.encode_field(&i32::from(r.duration))?;
    match r.status {
        ReservationStatus::Claimed { expires_at } => {
            enc.encode_field(&"claimed".to_string())?;
            enc.encode_field(&None::<String>)?;
            enc.encode_field(&Some(expires_at))
        }
        ReservationStatus::Finalized { reference } => {
            enc.encode_field(&"finalized".to_string())?;
            enc.encode_field(&Some(reference))?;
            enc.encode_field(&None::<i64>)
        }
    }
}

fn slot_rows(slots: impl IntoIterator<Item = ComputedSlot>) -> Response {
    query_response(slot_schema(), slots, |enc, s| {
        enc.encode_field(&s.id.to_string())?;
        enc.encode_field(&s.start_clock())?;
        enc.encode_field(&s.end_clock())?;
        enc.encode_field(&s.is_available)
    })
}

fn query_response<T>(
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

// ── Result schemas ───────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn slot_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("start", Type::VARCHAR),
        field("end", Type::VARCHAR),
        field("is_available", Type::BOOL),
    ]
}

fn unavailable_schema() -> Vec<FieldInfo> {
    vec![field("date", Type::VARCHAR), field("reason", Type::VARCHAR)]
}

fn working_hours_schema() -> Vec<FieldInfo> {
    vec![
        field("date", Type::VARCHAR),
        field("open", Type::VARCHAR),
        field("close", Type::VARCHAR),
        field("breaks", Type::VARCHAR),
    ]
}

fn counts_schema() -> Vec<FieldInfo> {
    vec![field("date", Type::VARCHAR), field("count", Type::INT8)]
}

fn status_schema() -> Vec<FieldInfo> {
    vec![field("id", Type::VARCHAR), field("is_available", Type::BOOL)]
}

fn reservation_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("slot_id", Type::VARCHAR),
        field("service_id", Type::VARCHAR),
        field("date", Type::VARCHAR),
        field("start", Type::VARCHAR),
        field("end", Type::VARCHAR),
        field("duration", Type::INT4),
        field("status", Type::VARCHAR),
        field("reference", Type::VARCHAR),
        field("expires_at", Type::INT8),
    ]
}

fn services_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("kind", Type::VARCHAR),
        field("name_en", Type::VARCHAR),
        field("name_ar", Type::VARCHAR),
        field("durations", Type::VARCHAR),
        field("active", Type::BOOL),
        field("requires_payment", Type::BOOL),
    ]
}

/// Result columns for a statement, judged from the table it selects from.
fn result_schema(stmt: &str) -> Vec<FieldInfo> {
    let lower = stmt.to_lowercase();
    if !lower.trim_start().starts_with("select") {
        return vec![];
    }
    let table = lower
        .split_once(" from ")
        .and_then(|(_, rest)| rest.split_whitespace().next())
        .map(|t| t.trim_matches(|c| c == '"' || c == ';'));
    match table {
        Some("slots" | "nearest_slot") => slot_schema(),
        Some("unavailable_dates") => unavailable_schema(),
        Some("working_hours") => working_hours_schema(),
        Some("slot_counts") => counts_schema(),
        Some("slot_status") => status_schema(),
        Some("reservations") => reservation_schema(),
        Some("services") => services_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for SlotbookHandler {
    async fn do_query<C>(&self, _client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(query).await?])
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
        let sql = substitute_params(portal);
        self.run(&sql).await
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

/// Highest `$N` placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    // Highest index first so `$1` never clobbers the prefix of `$10`.
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotbookFactory {
    handler: Arc<SlotbookHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SlotbookAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SlotbookFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = SlotbookAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SlotbookHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
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
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = SlotbookFactory::new(engine, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn engine_err(e: EngineError) -> PgWireError {
    // 40001 tells clients the statement is safe to retry as-is.
    let code = if e.is_retryable() { "40001" } else { "P0001" };
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        e.to_string(),
    )))
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
