use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use tokio::net::TcpStream;
use tracing::{debug, error};

use crate::auth::StaffAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{self, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError};
use crate::venue::VenueManager;

pub struct TablebookHandler {
    venues: Arc<VenueManager>,
    query_parser: Arc<TablebookQueryParser>,
}

impl TablebookHandler {
    pub fn new(venues: Arc<VenueManager>) -> Self {
        Self {
            venues,
            query_parser: Arc::new(TablebookQueryParser),
        }
    }

    /// The database name in the startup packet selects the venue.
    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let venue = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.venues.get_or_create(&venue).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("venue error: {e}"),
            )))
        })
    }

    /// Parse, execute and record metrics for one statement. `format` is the
    /// result encoding the client asked for.
    async fn run(&self, engine: &Engine, query: &str, format: &Format) -> PgWireResult<Response> {
        let started = Instant::now();
        let parsed = sql::parse_sql(query);
        let label = observability::statement_label(&parsed);
        let cmd = match parsed {
            Ok(cmd) => cmd,
            Err(e) => {
                metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => "error").increment(1);
                return Err(sql_err(e));
            }
        };

        let result = self.execute_command(engine, cmd, format).await;

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        cmd: Command,
        format: &Format,
    ) -> PgWireResult<Response> {
        match cmd {
            Command::InsertTables { tables } => {
                let count = tables.len();
                engine.create_tables(tables).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(count)))
            }
            Command::SelectTables { min_capacity } => {
                Ok(table_rows(engine.list_tables(min_capacity).await, format))
            }
            Command::SelectAvailability {
                start,
                guests,
                duration_minutes,
            } => {
                let tables = engine
                    .search_availability(start, guests, duration_minutes)
                    .await
                    .map_err(engine_err)?;
                Ok(table_rows(tables, format))
            }
            Command::InsertReservation { draft, returning } => {
                let info = engine.create_reservation(draft).await.map_err(engine_err)?;
                Ok(written("INSERT", info, returning, format))
            }
            Command::UpdateReservation { id, patch, returning } => {
                let info = engine
                    .update_reservation(id, patch)
                    .await
                    .map_err(engine_err)?;
                Ok(written("UPDATE", info, returning, format))
            }
            Command::DeleteReservation { id, returning } => {
                let info = engine.delete_reservation(id).await.map_err(engine_err)?;
                Ok(written("DELETE", info, returning, format))
            }
            Command::SelectReservations { filter } => {
                Ok(reservation_rows(engine.list_reservations(&filter).await, format))
            }
            Command::SelectStats { day } => {
                let day = day.unwrap_or_else(|| sql::day_start(chrono::Utc::now().date_naive()));
                let stats = engine.reservation_stats(day).await;
                let schema = Arc::new(stats_schema(format));
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&(stats.total as i64))?;
                encoder.encode_field(&(stats.pending as i64))?;
                encoder.encode_field(&(stats.confirmed as i64))?;
                encoder.encode_field(&(stats.day_active as i64))?;
                let row = encoder.take_row();
                Ok(Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(vec![Ok::<_, PgWireError>(row)]),
                )))
            }
        }
    }
}

// ── Result encoding ──────────────────────────────────────────────

fn schema(columns: &[(&str, Type)], format: &Format) -> Vec<FieldInfo> {
    columns
        .iter()
        .enumerate()
        .map(|(i, (name, ty))| {
            FieldInfo::new(name.to_string(), None, None, ty.clone(), format.format_for(i))
        })
        .collect()
}

fn table_schema(format: &Format) -> Vec<FieldInfo> {
    schema(
        &[("id", Type::VARCHAR), ("number", Type::INT8), ("capacity", Type::INT8)],
        format,
    )
}

fn reservation_schema(format: &Format) -> Vec<FieldInfo> {
    schema(
        &[
            ("id", Type::VARCHAR),
            ("table_id", Type::VARCHAR),
            ("table_number", Type::INT8),
            ("table_capacity", Type::INT8),
            ("name", Type::VARCHAR),
            ("email", Type::VARCHAR),
            ("phone", Type::VARCHAR),
            ("date", Type::INT8),
            ("end", Type::INT8),
            ("guests", Type::INT8),
            ("duration", Type::INT8),
            ("status", Type::VARCHAR),
            ("notes", Type::VARCHAR),
            ("created_at", Type::INT8),
        ],
        format,
    )
}

fn stats_schema(format: &Format) -> Vec<FieldInfo> {
    schema(
        &[
            ("total", Type::INT8),
            ("pending", Type::INT8),
            ("confirmed", Type::INT8),
            ("day_active", Type::INT8),
        ],
        format,
    )
}

fn table_rows(tables: Vec<Table>, format: &Format) -> Response {
    let schema = Arc::new(table_schema(format));
    let rows: Vec<PgWireResult<_>> = tables
        .into_iter()
        .map(|t| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&t.id.to_string())?;
            encoder.encode_field(&(t.number as i64))?;
            encoder.encode_field(&(t.capacity as i64))?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn reservation_rows(infos: Vec<ReservationInfo>, format: &Format) -> Response {
    let schema = Arc::new(reservation_schema(format));
    let rows: Vec<PgWireResult<_>> = infos
        .into_iter()
        .map(|ReservationInfo { reservation: r, table }| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id.to_string())?;
            encoder.encode_field(&table.id.to_string())?;
            encoder.encode_field(&(table.number as i64))?;
            encoder.encode_field(&(table.capacity as i64))?;
            encoder.encode_field(&r.name)?;
            encoder.encode_field(&r.email)?;
            encoder.encode_field(&r.phone)?;
            encoder.encode_field(&r.start)?;
            encoder.encode_field(&r.window().end())?;
            encoder.encode_field(&(r.guests as i64))?;
            encoder.encode_field(&(r.duration_minutes as i64))?;
            encoder.encode_field(&r.status.as_str())?;
            encoder.encode_field(&r.notes)?;
            encoder.encode_field(&r.created_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

/// A write returns the affected record with `RETURNING`, a command tag otherwise.
fn written(tag: &str, info: ReservationInfo, returning: bool, format: &Format) -> Response {
    if returning {
        reservation_rows(vec![info], format)
    } else {
        Response::Execution(Tag::new(tag).with_rows(1))
    }
}

#[async_trait]
impl SimpleQueryHandler for TablebookHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        Ok(vec![self.run(&engine, query, &Format::UnifiedText).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct TablebookQueryParser;

#[async_trait]
impl QueryParser for TablebookQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
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
        Ok(result_schema(stmt, column_format.unwrap_or(&Format::UnifiedText)))
    }
}

#[async_trait]
impl ExtendedQueryHandler for TablebookHandler {
    type Statement = String;
    type QueryParser = TablebookQueryParser;

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
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(&portal.statement.statement, &portal.parameters);
        self.run(&engine, &sql, &portal.result_column_format).await
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
            result_schema(&target.statement, &Format::UnifiedText),
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
            &target.result_column_format,
        )))
    }
}

/// Row shape of a statement, known before it runs. Only SELECTs and writes
/// with RETURNING produce rows; the relation after FROM/INTO/UPDATE picks
/// the shape.
fn result_schema(sql: &str, format: &Format) -> Vec<FieldInfo> {
    let upper = sql.to_ascii_uppercase();
    let words: Vec<&str> = upper
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .collect();

    let returns_rows = words.first() == Some(&"SELECT") || words.contains(&"RETURNING");
    if !returns_rows {
        return vec![];
    }
    let relation = words
        .windows(2)
        .find(|pair| matches!(pair[0], "FROM" | "INTO" | "UPDATE"))
        .map(|pair| pair[1]);
    match relation {
        Some("TABLES" | "AVAILABILITY") => table_schema(format),
        Some("RESERVATIONS") => reservation_schema(format),
        Some("RESERVATION_STATS") => stats_schema(format),
        _ => vec![],
    }
}

/// Highest `$N` placeholder outside string literals.
fn count_params(sql: &str) -> usize {
    let mut max = 0;
    scan_placeholders(sql, |n| {
        max = max.max(n);
        None
    });
    max
}

/// Replace `$N` placeholders with the bound values as quoted text literals.
/// Parameters arrive in text format; the SQL layer parses numbers out of
/// quoted strings, so every value can be quoted.
fn substitute_params(sql: &str, params: &[Option<Bytes>]) -> String {
    scan_placeholders(sql, |n| {
        let value = match params.get(n.checked_sub(1)?)? {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        Some(value)
    })
}

/// Walk `sql`, calling `replace` for every `$N` outside single quotes.
/// Returns the rewritten text; a `None` replacement keeps the placeholder.
fn scan_placeholders(sql: &str, mut replace: impl FnMut(usize) -> Option<String>) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.char_indices().peekable();
    let mut in_quote = false;

    while let Some((i, c)) = chars.next() {
        if c == '\'' {
            in_quote = !in_quote;
        }
        if c != '$' || in_quote {
            out.push(c);
            continue;
        }
        let digits_start = i + 1;
        let mut digits_end = digits_start;
        while let Some((j, d)) = chars.peek().copied() {
            if !d.is_ascii_digit() {
                break;
            }
            digits_end = j + 1;
            chars.next();
        }
        let placeholder = &sql[i..digits_end];
        match sql[digits_start..digits_end].parse::<usize>().ok().and_then(&mut replace) {
            Some(value) => out.push_str(&value),
            None => out.push_str(placeholder),
        }
    }
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct TablebookFactory {
    handler: Arc<TablebookHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<StaffAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl TablebookFactory {
    pub fn new(venues: Arc<VenueManager>, user: String, password: String) -> Self {
        let auth_source = StaffAuthSource::new(user, password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(TablebookHandler::new(venues)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for TablebookFactory {
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
pub async fn process_connection(socket: TcpStream, factory: Arc<TablebookFactory>) -> io::Result<()> {
    pgwire::tokio::process_socket(socket, None, factory).await
}

fn engine_err(e: EngineError) -> PgWireError {
    if e.kind().is_retryable() {
        error!("write failed: {e}");
    } else {
        debug!("rejected: {e}");
    }
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

#[cfg(test)]
mod tests {
    use super::*;

    fn text_schema(sql: &str) -> Vec<FieldInfo> {
        result_schema(sql, &Format::UnifiedText)
    }

    fn names(schema: Vec<FieldInfo>) -> Vec<String> {
        schema.iter().map(|f| f.name().to_string()).collect()
    }

    #[test]
    fn schema_follows_relation() {
        assert_eq!(
            names(text_schema("SELECT * FROM availability WHERE date = $1")),
            ["id", "number", "capacity"]
        );
        assert_eq!(names(text_schema("select * from reservation_stats")).len(), 4);
        assert_eq!(
            names(text_schema("SELECT * FROM reservations WHERE id = $1"))[2],
            "table_number"
        );
    }

    #[test]
    fn writes_have_rows_only_with_returning() {
        assert!(text_schema("INSERT INTO reservations (table_id) VALUES ($1)").is_empty());
        assert_eq!(
            text_schema("INSERT INTO reservations (table_id) VALUES ($1) RETURNING *").len(),
            14
        );
        assert_eq!(
            text_schema("UPDATE reservations SET status = $1 WHERE id = $2 RETURNING *").len(),
            14
        );
        assert!(text_schema("DELETE FROM reservations WHERE id = $1").is_empty());
    }

    #[test]
    fn params_counted_outside_quotes() {
        assert_eq!(count_params("SELECT * FROM tables"), 0);
        assert_eq!(count_params("UPDATE reservations SET name = $2 WHERE id = $1"), 2);
        assert_eq!(count_params("SELECT * FROM reservations WHERE id = $12"), 12);
        assert_eq!(count_params("UPDATE reservations SET notes = 'costs $5' WHERE id = $1"), 1);
    }

    #[test]
    fn two_digit_placeholders_substituted_whole() {
        let params: Vec<Option<Bytes>> = (1..=10)
            .map(|n| Some(Bytes::from(n.to_string())))
            .collect();
        let sql = substitute_params("VALUES ($1, $10)", &params);
        assert_eq!(sql, "VALUES ('1', '10')");
    }

    #[test]
    fn substituted_values_are_quoted_and_escaped() {
        let params = vec![Some(Bytes::from_static(b"O'Brien")), None];
        let sql = substitute_params("SET name = $1, notes = $2", &params);
        assert_eq!(sql, "SET name = 'O''Brien', notes = NULL");
    }

    #[test]
    fn unbound_placeholder_left_in_place() {
        let sql = substitute_params("WHERE id = $3", &[]);
        assert_eq!(sql, "WHERE id = $3");
    }
}
