use std::collections::HashSet;
use std::fmt::Debug;
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
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
use tokio::net::TcpStream;
use ulid::Ulid;

use crate::auth::{self, RentdAuthSource};
use crate::engine::{Engine, EngineError, rejection_label};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, RowShape, SqlError};

pub struct RentdHandler {
    engine: Arc<Engine>,
    admins: Arc<HashSet<Ulid>>,
    query_parser: Arc<RentdQueryParser>,
}

impl RentdHandler {
    pub fn new(engine: Arc<Engine>, admins: Arc<HashSet<Ulid>>) -> Self {
        Self {
            engine,
            admins,
            query_parser: Arc::new(RentdQueryParser),
        }
    }

    fn caller_from<C: ClientInfo>(&self, client: &C) -> PgWireResult<Caller> {
        let user = client.metadata().get("user").cloned();
        auth::resolve_caller(user.as_deref(), &self.admins).ok_or_else(|| {
            engine_err(EngineError::Unauthenticated("startup user is not a valid user id"))
        })
    }

    /// Parse, run and time one statement.
    async fn run<C: ClientInfo>(&self, client: &C, query: &str) -> PgWireResult<Response> {
        let caller = self.caller_from(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);

        let started = Instant::now();
        let result = self.execute_command(&caller, cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());

        let status = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind().as_str(),
        };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        if let Err(e) = &result {
            tracing::debug!(command = label, caller = %caller.user_id, "statement failed: {e}");
        }
        result.map_err(engine_err)
    }

    async fn execute_command(&self, caller: &Caller, cmd: Command) -> Result<Response, EngineError> {
        let engine = &self.engine;
        match cmd {
            Command::RegisterVehicle { vehicle } => {
                engine.register_vehicle(caller, vehicle).await?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateVehicle { id, patch } => {
                engine.update_vehicle(caller, id, patch).await?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::AddWindow {
                id,
                vehicle_id,
                available_from,
                available_to,
                recurrence,
            } => {
                let window = engine
                    .add_window(caller, id, vehicle_id, available_from, available_to, recurrence)
                    .await?;
                Ok(window_rows(vec![window]))
            }
            Command::UpdateWindow { id, patch } => {
                let window = engine.update_window(caller, id, patch).await?;
                Ok(window_rows(vec![window]))
            }
            Command::RemoveWindow { id } => {
                engine.remove_window(caller, id).await?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectWindows {
                vehicle_id,
                status,
                from,
                to,
            } => {
                let windows = engine.list_windows(vehicle_id, status, from, to).await?;
                Ok(window_rows(windows))
            }
            Command::SelectCanBook {
                vehicle_id,
                start,
                end,
            } => {
                let check = engine.can_book(caller, vehicle_id, start, end).await?;
                Ok(can_book_rows(&check))
            }
            Command::CreateReservation { request } => {
                let r = engine.create_reservation(caller, request).await?;
                Ok(reservation_rows(vec![r]))
            }
            Command::ConfirmReservation { id } => {
                let r = engine.confirm_reservation(caller, id).await?;
                Ok(reservation_rows(vec![r]))
            }
            Command::CancelReservation { id } => {
                let r = engine.cancel_reservation(caller, id).await?;
                Ok(reservation_rows(vec![r]))
            }
            Command::DisputeReservation { id } => {
                let r = engine.dispute_reservation(caller, id).await?;
                Ok(reservation_rows(vec![r]))
            }
            Command::IssueCode {
                reservation_id,
                phase,
            } => {
                let issued = engine.issue_code(caller, reservation_id, phase).await?;
                Ok(code_rows(&issued))
            }
            Command::Pickup {
                reservation_id,
                code,
                report,
            } => {
                let r = engine.pickup(caller, reservation_id, &code, report).await?;
                Ok(reservation_rows(vec![r]))
            }
            Command::Return {
                reservation_id,
                code,
                report,
            } => {
                let r = engine
                    .return_vehicle(caller, reservation_id, &code, report)
                    .await?;
                Ok(reservation_rows(vec![r]))
            }
            Command::SelectReservations { filter } => {
                let rs = engine.list_reservations(caller, filter).await?;
                Ok(reservation_rows(rs))
            }
            Command::SelectActiveReservation => {
                let r = engine.active_reservation(caller).await;
                Ok(reservation_rows(r.into_iter().collect()))
            }
            Command::SelectReservationHistory => {
                let rs = engine.reservation_history(caller).await;
                Ok(reservation_rows(rs))
            }
        }
    }
}

// ── Row encoding ─────────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn float_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::FLOAT8, FieldFormat::Text)
}

fn bool_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::BOOL, FieldFormat::Text)
}

fn window_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("vehicle_id"),
        int_field("available_from"),
        int_field("available_to"),
        text_field("status"),
        text_field("days_of_week"),
        text_field("daily_start"),
        text_field("daily_end"),
    ]
}

fn can_book_schema() -> Vec<FieldInfo> {
    vec![
        text_field("vehicle_id"),
        int_field("start"),
        int_field("end"),
        bool_field("bookable"),
        text_field("failure"),
        text_field("reason"),
        int_field("price_per_km"),
        int_field("price_per_hour"),
        int_field("price_per_day"),
        int_field("base_price"),
    ]
}

fn reservation_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("vehicle_id"),
        text_field("renter_id"),
        text_field("owner_id"),
        int_field("start"),
        int_field("end"),
        int_field("duration_hours"),
        text_field("pricing_model"),
        float_field("estimated_distance_km"),
        int_field("estimated_price"),
        int_field("final_price"),
        int_field("security_deposit"),
        text_field("pickup_location"),
        text_field("return_location"),
        text_field("notes"),
        text_field("status"),
        int_field("created_at"),
        int_field("updated_at"),
        int_field("picked_up_at"),
        int_field("returned_at"),
        float_field("actual_distance_km"),
        float_field("fuel_consumed_liters"),
        int_field("fuel_cost_charged"),
    ]
}

fn code_schema() -> Vec<FieldInfo> {
    vec![
        text_field("reservation_id"),
        text_field("phase"),
        text_field("code"),
        int_field("expires_at"),
    ]
}

fn schema_for(shape: RowShape) -> Vec<FieldInfo> {
    match shape {
        RowShape::Tag => vec![],
        RowShape::Windows => window_schema(),
        RowShape::CanBook => can_book_schema(),
        RowShape::Reservations => reservation_schema(),
        RowShape::Code => code_schema(),
    }
}

fn rows_response(schema: Arc<Vec<FieldInfo>>, rows: Vec<PgWireResult<DataRow>>) -> Response {
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn window_rows(windows: Vec<AvailabilityWindow>) -> Response {
    let schema = Arc::new(window_schema());
    let rows = windows
        .into_iter()
        .map(|w| -> PgWireResult<DataRow> {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&w.id.to_string())?;
            encoder.encode_field(&w.vehicle_id.to_string())?;
            encoder.encode_field(&w.span.start)?;
            encoder.encode_field(&w.span.end)?;
            encoder.encode_field(&w.status.as_str())?;
            let rec = w.recurrence.as_ref();
            encoder.encode_field(&rec.map(Recurrence::days_label))?;
            encoder.encode_field(&rec.map(|r| format_clock(r.daily_start)))?;
            encoder.encode_field(&rec.map(|r| format_clock(r.daily_end)))?;
            Ok(encoder.take_row())
        })
        .collect();
    rows_response(schema, rows)
}

fn can_book_rows(check: &BookingCheck) -> Response {
    let schema = Arc::new(can_book_schema());
    let encode = || -> PgWireResult<DataRow> {
        let mut encoder = DataRowEncoder::new(schema.clone());
        encoder.encode_field(&check.vehicle_id.to_string())?;
        encoder.encode_field(&check.span.start)?;
        encoder.encode_field(&check.span.end)?;
        encoder.encode_field(&check.bookable())?;
        encoder.encode_field(&check.verdict.as_ref().err().map(rejection_label))?;
        encoder.encode_field(&check.reason())?;
        encoder.encode_field(&check.rates.price_per_km)?;
        encoder.encode_field(&check.rates.price_per_hour)?;
        encoder.encode_field(&check.rates.price_per_day)?;
        encoder.encode_field(&check.rates.base_price)?;
        Ok(encoder.take_row())
    };
    let row = encode();
    rows_response(schema, vec![row])
}

fn reservation_rows(reservations: Vec<Reservation>) -> Response {
    let schema = Arc::new(reservation_schema());
    let rows = reservations
        .into_iter()
        .map(|r| -> PgWireResult<DataRow> {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id.to_string())?;
            encoder.encode_field(&r.vehicle_id.to_string())?;
            encoder.encode_field(&r.renter_id.to_string())?;
            encoder.encode_field(&r.owner_id.to_string())?;
            encoder.encode_field(&r.span.start)?;
            encoder.encode_field(&r.span.end)?;
            encoder.encode_field(&r.duration_hours)?;
            encoder.encode_field(&r.pricing_model.as_str())?;
            encoder.encode_field(&r.estimated_distance_km)?;
            encoder.encode_field(&r.estimated_price)?;
            encoder.encode_field(&r.final_price)?;
            encoder.encode_field(&r.security_deposit)?;
            encoder.encode_field(&r.pickup_location)?;
            encoder.encode_field(&r.return_location)?;
            encoder.encode_field(&r.notes)?;
            encoder.encode_field(&r.status.as_str())?;
            encoder.encode_field(&r.created_at)?;
            encoder.encode_field(&r.updated_at)?;
            encoder.encode_field(&r.pickup.as_ref().map(|h| h.at))?;
            encoder.encode_field(&r.dropoff.as_ref().map(|h| h.at))?;
            encoder.encode_field(&r.actual_distance_km)?;
            encoder.encode_field(&r.fuel_consumed_liters)?;
            encoder.encode_field(&r.fuel_cost_charged)?;
            Ok(encoder.take_row())
        })
        .collect();
    rows_response(schema, rows)
}

fn code_rows(issued: &IssuedCode) -> Response {
    let schema = Arc::new(code_schema());
    let encode = || -> PgWireResult<DataRow> {
        let mut encoder = DataRowEncoder::new(schema.clone());
        encoder.encode_field(&issued.reservation_id.to_string())?;
        encoder.encode_field(&issued.phase.as_str())?;
        encoder.encode_field(&issued.code)?;
        encoder.encode_field(&issued.expires_at)?;
        Ok(encoder.take_row())
    };
    let row = encode();
    rows_response(schema, vec![row])
}

#[async_trait]
impl SimpleQueryHandler for RentdHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(client, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct RentdQueryParser;

#[async_trait]
impl QueryParser for RentdQueryParser {
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
        Ok(schema_for(sql::row_shape(stmt)))
    }
}

#[async_trait]
impl ExtendedQueryHandler for RentdHandler {
    type Statement = String;
    type QueryParser = RentdQueryParser;

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
        let sql = substitute_params(portal);
        self.run(client, &sql).await
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
        let fields = schema_for(sql::row_shape(&target.statement));
        Ok(DescribeStatementResponse::new(param_types, fields))
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
        let fields = schema_for(sql::row_shape(&target.statement.statement));
        Ok(DescribePortalResponse::new(fields))
    }
}

/// Byte ranges and indexes of `$N` placeholders outside quoted literals
/// and quoted identifiers.
fn placeholders(sql: &str) -> Vec<(Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut quote = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            // a doubled quote inside a literal is an escape, and re-enters it
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None if b == b'$' => {
                let start = i;
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if let Ok(n) = sql[start + 1..i].parse::<usize>() {
                    found.push((start..i, n));
                }
                continue;
            }
            None => {}
        }
        i += 1;
    }
    found
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

/// Inline bound text parameters as quoted literals in one pass over the
/// statement, so bound text is never rescanned for placeholders.
fn substitute_params(portal: &Portal<String>) -> String {
    inline_params(&portal.statement.statement, &portal.parameters)
}

fn inline_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    for (range, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|i| params.get(i)) else {
            continue;
        };
        out.push_str(&sql[copied..range.start]);
        match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                out.push('\'');
                out.push_str(&text.replace('\'', "''"));
                out.push('\'');
            }
            None => out.push_str("NULL"),
        }
        copied = range.end;
    }
    out.push_str(&sql[copied..]);
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct RentdFactory {
    handler: Arc<RentdHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<RentdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl RentdFactory {
    pub fn new(engine: Arc<Engine>, password: String, admins: Arc<HashSet<Ulid>>) -> Self {
        Self {
            handler: Arc::new(RentdHandler::new(engine, admins)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                RentdAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for RentdFactory {
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
    admins: Arc<HashSet<Ulid>>,
    tls: Option<TlsAcceptor>,
) -> Result<(), std::io::Error> {
    let factory = Arc::new(RentdFactory::new(engine, password, admins));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        e.sqlstate().into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        e.sqlstate().into(),
        e.to_string(),
    )))
}
