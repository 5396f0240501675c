use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::NaiveDate;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::StartupHandler;
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldInfo, QueryResponse,
    Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::data::DataRow;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use ulid::Ulid;

use crate::auth::{LabbookStartupHandler, ACCOUNT_KEY};
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::permissions::{authenticated, Actor};
use crate::sql::{self, Command, Table};
use crate::validator::Transition;

/// What a command produced, before encoding.
enum Output {
    Done(&'static str, usize),
    Laboratories(Vec<Laboratory>),
    Users(Vec<User>),
    Bookings(Vec<Booking>),
    Calendar(Vec<CalendarSlot>),
    Availability {
        laboratory_id: Ulid,
        date: NaiveDate,
        windows: Vec<TimeRange>,
    },
}

pub struct LabbookHandler {
    engine: Arc<Engine>,
    query_parser: Arc<LabbookQueryParser>,
}

impl LabbookHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(LabbookQueryParser),
        }
    }

    /// The account the connection logged in as, with its current
    /// permissions. Anonymous logins and since-deactivated accounts get `None`.
    fn resolve_actor<C: ClientInfo>(&self, client: &C) -> Option<Actor> {
        let id = client.metadata().get(ACCOUNT_KEY)?.parse::<Ulid>().ok()?;
        self.engine.actor(id)
    }

    async fn execute(&self, actor: Option<&Actor>, cmd: Command, format: &Format) -> PgWireResult<Response> {
        let label = command_label(&cmd);
        let table = cmd.table();
        let started = Instant::now();
        let result = self.execute_command(actor, cmd).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);

        match result {
            Ok(output) => encode_output(table, output, format),
            Err(e) => {
                tracing::debug!("{label} rejected: {e}");
                Err(engine_err(e))
            }
        }
    }

    async fn execute_command(&self, actor: Option<&Actor>, cmd: Command) -> Result<Output, EngineError> {
        let engine = &self.engine;
        match cmd {
            Command::InsertLaboratory(req) => {
                engine.create_laboratory(authenticated(actor)?, req).await?;
                Ok(Output::Done("INSERT", 1))
            }
            Command::UpdateLaboratory { id, patch } => {
                engine.update_laboratory(authenticated(actor)?, id, patch).await?;
                Ok(Output::Done("UPDATE", 1))
            }
            Command::DeleteLaboratory { id } => {
                engine.delete_laboratory(authenticated(actor)?, id).await?;
                Ok(Output::Done("DELETE", 1))
            }
            Command::InsertUser(req) => {
                engine.register_user(actor, req).await?;
                Ok(Output::Done("INSERT", 1))
            }
            Command::UpdateUser { id, patch } => {
                engine.update_user(authenticated(actor)?, id, patch).await?;
                Ok(Output::Done("UPDATE", 1))
            }
            Command::OverridePermissions { id, permissions } => {
                engine
                    .override_permissions(authenticated(actor)?, id, permissions)
                    .await?;
                Ok(Output::Done("UPDATE", 1))
            }
            Command::DeleteUser { id } => {
                engine.delete_user(authenticated(actor)?, id).await?;
                Ok(Output::Done("DELETE", 1))
            }
            Command::InsertBooking(req) => {
                engine.create_booking(authenticated(actor)?, req).await?;
                Ok(Output::Done("INSERT", 1))
            }
            Command::UpdateBooking { id, patch } => {
                engine.update_booking(authenticated(actor)?, id, patch).await?;
                Ok(Output::Done("UPDATE", 1))
            }
            Command::TransitionBooking { id, transition, reason } => {
                let actor = authenticated(actor)?;
                match transition {
                    Transition::Approve => engine.approve_booking(actor, id).await?,
                    Transition::Reject => engine.reject_booking(actor, id, reason).await?,
                    Transition::Cancel => engine.cancel_booking(actor, id).await?,
                    Transition::Reopen => engine.reopen_booking(actor, id).await?,
                };
                Ok(Output::Done("UPDATE", 1))
            }
            Command::DeleteBooking { id } => {
                engine.delete_booking(authenticated(actor)?, id).await?;
                Ok(Output::Done("DELETE", 1))
            }
            Command::SelectLaboratories { id } => {
                let labs = match id {
                    Some(id) => vec![engine.get_laboratory(id).await?],
                    None => engine.list_laboratories().await,
                };
                Ok(Output::Laboratories(labs))
            }
            Command::SelectUsers { id } => {
                let users = match id {
                    Some(id) => vec![engine.get_user(actor, id)?],
                    None => engine.list_users(actor)?,
                };
                Ok(Output::Users(users))
            }
            Command::SelectBookings { id, filter } => {
                let actor = authenticated(actor)?;
                let bookings = match id {
                    Some(id) => {
                        let b = engine.get_booking(actor, id).await?;
                        if filter.matches(&b) { vec![b] } else { Vec::new() }
                    }
                    None => engine.list_bookings(actor, filter).await?,
                };
                Ok(Output::Bookings(bookings))
            }
            Command::SelectCalendar { laboratory_id, date } => {
                Ok(Output::Calendar(engine.calendar(actor, laboratory_id, date).await?))
            }
            Command::SelectAvailability {
                laboratory_id,
                date,
                min_duration,
            } => {
                let windows = engine
                    .availability(actor, laboratory_id, date, min_duration)
                    .await?;
                Ok(Output::Availability {
                    laboratory_id,
                    date,
                    windows,
                })
            }
        }
    }
}

// ── Result encoding ──────────────────────────────────────────────

fn columns(table: Table) -> Vec<(&'static str, Type)> {
    match table {
        Table::Laboratories => vec![
            ("id", Type::VARCHAR),
            ("name", Type::VARCHAR),
            ("code", Type::VARCHAR),
            ("capacity", Type::INT8),
            ("open_time", Type::VARCHAR),
            ("close_time", Type::VARCHAR),
            ("status", Type::VARCHAR),
            ("location", Type::VARCHAR),
            ("description", Type::VARCHAR),
            ("created_at", Type::INT8),
            ("updated_at", Type::INT8),
        ],
        Table::Users => vec![
            ("id", Type::VARCHAR),
            ("username", Type::VARCHAR),
            ("email", Type::VARCHAR),
            ("role", Type::VARCHAR),
            ("permissions", Type::VARCHAR),
            ("is_active", Type::BOOL),
            ("created_at", Type::INT8),
            ("updated_at", Type::INT8),
        ],
        Table::Bookings => vec![
            ("id", Type::VARCHAR),
            ("laboratory_id", Type::VARCHAR),
            ("user_id", Type::VARCHAR),
            ("date", Type::VARCHAR),
            ("start_time", Type::VARCHAR),
            ("end_time", Type::VARCHAR),
            ("status", Type::VARCHAR),
            ("attendees", Type::INT8),
            ("purpose", Type::VARCHAR),
            ("notes", Type::VARCHAR),
            ("processed_by", Type::VARCHAR),
            ("processed_at", Type::INT8),
            ("rejection_reason", Type::VARCHAR),
            ("created_at", Type::INT8),
            ("updated_at", Type::INT8),
        ],
        Table::Calendar => vec![
            ("booking_id", Type::VARCHAR),
            ("date", Type::VARCHAR),
            ("start_time", Type::VARCHAR),
            ("end_time", Type::VARCHAR),
            ("status", Type::VARCHAR),
            ("user_id", Type::VARCHAR),
            ("purpose", Type::VARCHAR),
        ],
        Table::Availability => vec![
            ("laboratory_id", Type::VARCHAR),
            ("date", Type::VARCHAR),
            ("start_time", Type::VARCHAR),
            ("end_time", Type::VARCHAR),
            ("duration_minutes", Type::INT4),
        ],
    }
}

fn schema(table: Table, format: &Format) -> Vec<FieldInfo> {
    columns(table)
        .into_iter()
        .enumerate()
        .map(|(i, (name, ty))| FieldInfo::new(name.into(), None, None, ty, format.format_for(i)))
        .collect()
}

fn encode_laboratory(e: &mut DataRowEncoder, lab: &Laboratory) -> PgWireResult<()> {
    e.encode_field(&lab.id.to_string())?;
    e.encode_field(&lab.name)?;
    e.encode_field(&lab.code)?;
    e.encode_field(&i64::from(lab.capacity))?;
    e.encode_field(&lab.operating_hours.open.to_string())?;
    e.encode_field(&lab.operating_hours.close.to_string())?;
    e.encode_field(&lab.status.as_str())?;
    e.encode_field(&lab.location)?;
    e.encode_field(&lab.description)?;
    e.encode_field(&lab.created_at)?;
    e.encode_field(&lab.updated_at)
}

fn encode_user(e: &mut DataRowEncoder, user: &User) -> PgWireResult<()> {
    let permissions = serde_json::to_string(&user.permissions)
        .map_err(|err| PgWireError::ApiError(Box::new(err)))?;
    e.encode_field(&user.id.to_string())?;
    e.encode_field(&user.username)?;
    e.encode_field(&user.email)?;
    e.encode_field(&user.role.as_str())?;
    e.encode_field(&permissions)?;
    e.encode_field(&user.is_active)?;
    e.encode_field(&user.created_at)?;
    e.encode_field(&user.updated_at)
}

fn encode_booking(e: &mut DataRowEncoder, b: &Booking) -> PgWireResult<()> {
    e.encode_field(&b.id.to_string())?;
    e.encode_field(&b.laboratory_id.to_string())?;
    e.encode_field(&b.user_id.to_string())?;
    e.encode_field(&b.date.to_string())?;
    e.encode_field(&b.start.to_string())?;
    e.encode_field(&b.end.to_string())?;
    e.encode_field(&b.status.as_str())?;
    e.encode_field(&i64::from(b.attendees))?;
    e.encode_field(&b.purpose)?;
    e.encode_field(&b.notes)?;
    e.encode_field(&b.processed_by.map(|id| id.to_string()))?;
    e.encode_field(&b.processed_at)?;
    e.encode_field(&b.rejection_reason)?;
    e.encode_field(&b.created_at)?;
    e.encode_field(&b.updated_at)
}

fn encode_slot(e: &mut DataRowEncoder, slot: &CalendarSlot) -> PgWireResult<()> {
    e.encode_field(&slot.booking_id.to_string())?;
    e.encode_field(&slot.date.to_string())?;
    e.encode_field(&slot.start.to_string())?;
    e.encode_field(&slot.end.to_string())?;
    e.encode_field(&slot.status.as_str())?;
    e.encode_field(&slot.owner.map(|id| id.to_string()))?;
    e.encode_field(&slot.purpose)
}

fn rows<T>(
    schema: &Arc<Vec<FieldInfo>>,
    items: &[T],
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Vec<PgWireResult<DataRow>> {
    items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect()
}

fn encode_output(table: Table, output: Output, format: &Format) -> PgWireResult<Response> {
    let schema = Arc::new(schema(table, format));
    let data = match output {
        Output::Done(tag, count) => return Ok(Response::Execution(Tag::new(tag).with_rows(count))),
        Output::Laboratories(labs) => rows(&schema, &labs, encode_laboratory),
        Output::Users(users) => rows(&schema, &users, encode_user),
        Output::Bookings(bookings) => rows(&schema, &bookings, encode_booking),
        Output::Calendar(slots) => rows(&schema, &slots, encode_slot),
        Output::Availability {
            laboratory_id,
            date,
            windows,
        } => {
            let (lab, date) = (laboratory_id.to_string(), date.to_string());
            rows(&schema, &windows, |e, w| {
                e.encode_field(&lab)?;
                e.encode_field(&date)?;
                e.encode_field(&w.start.to_string())?;
                e.encode_field(&w.end.to_string())?;
                e.encode_field(&i32::from(w.duration_minutes()))
            })
        }
    };
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(data))))
}

#[async_trait]
impl SimpleQueryHandler for LabbookHandler {
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
        let actor = self.resolve_actor(&*client);
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let response = self
            .execute(actor.as_ref(), cmd, &Format::UnifiedText)
            .await?;
        Ok(vec![response])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct LabbookQueryParser;

/// Result columns of a statement, known from its table alone.
fn statement_schema(sql: &str, format: &Format) -> Vec<FieldInfo> {
    sql::select_table(sql).map_or_else(Vec::new, |table| schema(table, format))
}

#[async_trait]
impl QueryParser for LabbookQueryParser {
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
        column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(statement_schema(stmt, column_format.unwrap_or(&Format::UnifiedText)))
    }
}

#[async_trait]
impl ExtendedQueryHandler for LabbookHandler {
    type Statement = String;
    type QueryParser = LabbookQueryParser;

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
        let actor = self.resolve_actor(&*client);
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        self.execute(actor.as_ref(), cmd, &portal.result_column_format)
            .await
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
            statement_schema(&target.statement, &Format::UnifiedText),
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
        Ok(DescribePortalResponse::new(statement_schema(
            &target.statement.statement,
            &target.result_column_format,
        )))
    }
}

/// Count the highest $N parameter placeholder outside quoted text.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' => {
                for inner in chars.by_ref() {
                    if inner == c {
                        break;
                    }
                }
            }
            '$' => {
                let mut n = String::new();
                while let Some(d) = chars.next_if(char::is_ascii_digit) {
                    n.push(d);
                }
                if let Ok(n) = n.parse::<usize>() {
                    max = max.max(n);
                }
            }
            _ => {}
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, &portal.parameters)
}

/// One pass over the statement. Quoted literals and identifiers are copied
/// untouched, and substituted values are never rescanned. Placeholders with
/// no bound value are left as written.
fn bind_params(sql: &str, params: &[Option<bytes::Bytes>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.char_indices().peekable();
    while let Some((start, c)) = chars.next() {
        match c {
            '\'' | '"' => {
                out.push(c);
                // A doubled quote is an escape; it closes and reopens, so
                // copying quote to quote handles it.
                for (_, inner) in chars.by_ref() {
                    out.push(inner);
                    if inner == c {
                        break;
                    }
                }
            }
            '$' => {
                let mut end = start + 1;
                while let Some(&(i, d)) = chars.peek() {
                    if !d.is_ascii_digit() {
                        break;
                    }
                    end = i + 1;
                    chars.next();
                }
                let bound = sql[start + 1..end]
                    .parse::<usize>()
                    .ok()
                    .and_then(|n| n.checked_sub(1))
                    .and_then(|i| params.get(i));
                match bound {
                    Some(Some(bytes)) => {
                        let text = String::from_utf8_lossy(bytes);
                        out.push('\'');
                        out.push_str(&text.replace('\'', "''"));
                        out.push('\'');
                    }
                    Some(None) => out.push_str("NULL"),
                    None => out.push_str(&sql[start..end]),
                }
            }
            _ => out.push(c),
        }
    }
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct LabbookFactory {
    handler: Arc<LabbookHandler>,
    auth_handler: Arc<LabbookStartupHandler>,
    noop: Arc<NoopHandler>,
}

impl LabbookFactory {
    pub fn new(engine: Arc<Engine>, token: String) -> Self {
        Self {
            auth_handler: Arc::new(LabbookStartupHandler::new(engine.clone(), token)),
            handler: Arc::new(LabbookHandler::new(engine)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for LabbookFactory {
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
    token: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(LabbookFactory::new(engine, token));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

pub fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::TimeConflict { .. } => "23P01",
        EngineError::CapacityExceeded(_) | EngineError::OutsideOperatingHours { .. } => "23514",
        EngineError::InvalidRange { .. } | EngineError::InvalidInput(_) => "22023",
        EngineError::InvalidTransition { .. }
        | EngineError::NotEditable(_)
        | EngineError::LaboratoryUnavailable { .. }
        | EngineError::HasActiveBookings(_) => "55000",
        EngineError::PermissionDenied(_) | EngineError::RoleElevationDenied => "42501",
        EngineError::NotFound(..) => "P0002",
        EngineError::AlreadyExists(..) => "23505",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::DependencyUnavailable(_) => "58000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
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
