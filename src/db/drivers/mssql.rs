// MS-SQL Driver
// Implements the Driver trait for SQL Server using tiberius with bb8 pooling

use crate::db::config::ConnectionConfig;
use crate::db::registry::TerminationNotifier;
use crate::db::traits::{Connection, DatabaseError, Driver, Input, Result};
use crate::db::types::{ColumnInfo, RecordSet, Row, SqlType, Value};
use bb8::Pool;
use bb8_tiberius::ConnectionManager;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tiberius::numeric::Numeric;
use tiberius::{AuthMethod, ColumnData, ColumnType, Config, EncryptionLevel, FromSql, ToSql};
use tracing::debug;

/// Type alias for our connection pool
pub type MssqlPool = Pool<ConnectionManager>;

/// SQL Server error number for an expired login password
const PASSWORD_EXPIRED: u32 = 18488;

impl From<tiberius::error::Error> for DatabaseError {
    fn from(err: tiberius::error::Error) -> Self {
        DatabaseError::QueryError(err.to_string())
    }
}

impl<E: std::error::Error + 'static> From<bb8::RunError<E>> for DatabaseError {
    fn from(err: bb8::RunError<E>) -> Self {
        DatabaseError::PoolError(err.to_string())
    }
}

/// Whether a pool failure means the server connection is gone
fn is_transport_failure(err: &bb8_tiberius::Error) -> bool {
    matches!(
        err,
        bb8_tiberius::Error::Io(_) | bb8_tiberius::Error::Tiberius(tiberius::error::Error::Io { .. })
    )
}

/// Map a failure while opening to a connection error
fn open_error(err: bb8_tiberius::Error) -> DatabaseError {
    if let bb8_tiberius::Error::Tiberius(tiberius::error::Error::Server(e)) = &err {
        if e.code() == PASSWORD_EXPIRED {
            return DatabaseError::ConnectionFailed(
                "Password expired. Please change your password using another tool.".to_string(),
            );
        }
    }
    DatabaseError::ConnectionFailed(err.to_string())
}

/// Create a tiberius Config from a connection configuration.
///
/// Recognized options: `encrypt` (default false), `trust_server_certificate`
/// (default true) and `app_name`. A server of the form `host\instance`
/// connects to a named instance.
pub fn to_tiberius_config(config: &ConnectionConfig) -> Result<Config> {
    let server = config
        .server_address()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| DatabaseError::InvalidConfig("Server address is required".to_string()))?;

    let mut tiberius_config = Config::new();
    match server.split_once('\\') {
        Some((host, instance)) => {
            tiberius_config.host(host);
            tiberius_config.instance_name(instance);
        }
        None => tiberius_config.host(server),
    }
    if let Some(port) = config.port {
        tiberius_config.port(port);
    }
    if let Some(database) = &config.database {
        tiberius_config.database(database);
    }
    tiberius_config.authentication(AuthMethod::sql_server(
        config.user.as_deref().unwrap_or_default(),
        config.password.as_deref().unwrap_or_default(),
    ));

    if config.option_bool("trust_server_certificate").unwrap_or(true) {
        tiberius_config.trust_cert();
    }
    tiberius_config.encryption(if config.option_bool("encrypt").unwrap_or(false) {
        EncryptionLevel::Required
    } else {
        EncryptionLevel::Off
    });
    if let Some(app_name) = config.option_str("app_name") {
        tiberius_config.application_name(app_name);
    }

    Ok(tiberius_config)
}

/// MS-SQL driver
pub struct MssqlDriver {
    max_size: u32,
}

impl MssqlDriver {
    pub fn new() -> Self {
        Self { max_size: 5 }
    }
}

impl Default for MssqlDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Driver for MssqlDriver {
    fn driver_name(&self) -> &'static str {
        "Microsoft SQL Server"
    }

    async fn open(
        &self,
        config: &ConnectionConfig,
        notifier: TerminationNotifier,
    ) -> Result<Arc<dyn Connection>> {
        let tiberius_config = to_tiberius_config(config)?;
        let manager = ConnectionManager::build(tiberius_config)
            .map_err(|e| DatabaseError::InvalidConfig(e.to_string()))?;

        let pool = Pool::builder()
            .max_size(self.max_size)
            .min_idle(Some(1))
            .build(manager)
            .await
            .map_err(open_error)?;

        // Check out one connection so a bad login fails here, not on first query
        {
            let _conn = pool.get().await.map_err(|e| match e {
                bb8::RunError::User(e) => open_error(e),
                bb8::RunError::TimedOut => {
                    DatabaseError::ConnectionFailed("Timed out waiting for a connection".to_string())
                }
            })?;
        }

        Ok(Arc::new(MssqlConnection {
            name: notifier.name().to_string(),
            pool,
            notifier,
            closed: AtomicBool::new(false),
        }))
    }
}

/// MS-SQL pool registered under one canonical name
pub struct MssqlConnection {
    name: String,
    pool: MssqlPool,
    notifier: TerminationNotifier,
    closed: AtomicBool,
}

impl MssqlConnection {
    fn report(&self, error: DatabaseError, fatal: bool) -> DatabaseError {
        if fatal {
            self.notifier.errored(&error);
        }
        error
    }

    /// Checking out a pooled connection failed
    fn checkout_failed(&self, err: bb8_tiberius::Error) -> DatabaseError {
        let fatal = is_transport_failure(&err);
        self.report(DatabaseError::ConnectionFailed(err.to_string()), fatal)
    }

    /// A statement failed on a checked out connection
    fn query_failed(&self, err: tiberius::error::Error) -> DatabaseError {
        let fatal = matches!(err, tiberius::error::Error::Io { .. });
        self.report(DatabaseError::from(err), fatal)
    }
}

#[async_trait::async_trait]
impl Connection for MssqlConnection {
    fn connection_id(&self) -> &str {
        &self.name
    }

    async fn execute(&self, sql: &str, inputs: &[Input]) -> Result<RecordSet> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DatabaseError::ConnectionTerminated(self.name.clone()));
        }

        let params = inputs
            .iter()
            .map(|input| match input.ty {
                Some(ty) => coerce_param(&input.name, ty, &input.value),
                None => Ok(infer_param(&input.value)),
            })
            .collect::<Result<Vec<SqlParam>>>()?;
        let names: Vec<&str> = inputs
            .iter()
            .map(|input| input.name.trim_start_matches('@'))
            .collect();
        let sql = positional_sql(sql, &names);
        let param_refs: Vec<&dyn ToSql> = params.iter().map(|p| p as &dyn ToSql).collect();

        let mut conn = match self.pool.get().await {
            Ok(conn) => conn,
            Err(bb8::RunError::User(e)) => return Err(self.checkout_failed(e)),
            Err(e) => return Err(e.into()),
        };

        debug!(connection = %self.name, params = params.len(), "Executing statement");
        let stream = conn.query(sql.as_str(), &param_refs).await.map_err(|e| self.query_failed(e))?;
        let result_sets = stream.into_results().await.map_err(|e| self.query_failed(e))?;

        Ok(record_set(result_sets.into_iter().next().unwrap_or_default()))
    }

    async fn close(&self) -> Result<()> {
        // The pool's sockets close once the last handle drops it
        self.closed.store(true, Ordering::SeqCst);
        self.notifier.closed();
        Ok(())
    }
}

/// Owned parameter bound as a typed TDS parameter, never spliced into SQL text
#[derive(Debug, Clone, PartialEq)]
enum SqlParam {
    Null,
    TypedNull(SqlType),
    Bit(bool),
    U8(u8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    String(String),
    Guid(tiberius::Uuid),
    DateTime2(NaiveDateTime),
    Date(NaiveDate),
    Binary(Vec<u8>),
}

impl ToSql for SqlParam {
    fn to_sql(&self) -> ColumnData<'_> {
        match self {
            SqlParam::Null => ColumnData::String(None),
            SqlParam::TypedNull(ty) => match ty {
                SqlType::Bit => ColumnData::Bit(None),
                SqlType::TinyInt => ColumnData::U8(None),
                SqlType::SmallInt => ColumnData::I16(None),
                SqlType::Int => ColumnData::I32(None),
                SqlType::BigInt => ColumnData::I64(None),
                SqlType::Real => ColumnData::F32(None),
                SqlType::Float => ColumnData::F64(None),
                SqlType::NVarChar | SqlType::VarChar => ColumnData::String(None),
                SqlType::UniqueIdentifier => ColumnData::Guid(None),
                SqlType::DateTime2 => ColumnData::DateTime2(None),
                SqlType::Date => ColumnData::Date(None),
                SqlType::VarBinary => ColumnData::Binary(None),
            },
            SqlParam::Bit(b) => ColumnData::Bit(Some(*b)),
            SqlParam::U8(n) => ColumnData::U8(Some(*n)),
            SqlParam::I16(n) => ColumnData::I16(Some(*n)),
            SqlParam::I32(n) => ColumnData::I32(Some(*n)),
            SqlParam::I64(n) => ColumnData::I64(Some(*n)),
            SqlParam::F32(n) => ColumnData::F32(Some(*n)),
            SqlParam::F64(n) => ColumnData::F64(Some(*n)),
            SqlParam::String(s) => ColumnData::String(Some(Cow::Borrowed(s.as_str()))),
            SqlParam::Guid(u) => ColumnData::Guid(Some(*u)),
            SqlParam::DateTime2(dt) => dt.to_sql(),
            SqlParam::Date(d) => d.to_sql(),
            SqlParam::Binary(b) => ColumnData::Binary(Some(Cow::Borrowed(b.as_slice()))),
        }
    }
}

/// Bind a value with the type its runtime variant suggests
fn infer_param(value: &Value) -> SqlParam {
    match value {
        Value::Null => SqlParam::Null,
        Value::Bool(b) => SqlParam::Bit(*b),
        Value::Int(n) => i32::try_from(*n).map(SqlParam::I32).unwrap_or(SqlParam::I64(*n)),
        Value::Float(n) => SqlParam::F64(*n),
        Value::String(s) | Value::DateTime(s) => SqlParam::String(s.clone()),
        Value::Binary(b) => SqlParam::Binary(b.clone()),
    }
}

/// Bind a value as an explicitly requested SQL type
fn coerce_param(name: &str, ty: SqlType, value: &Value) -> Result<SqlParam> {
    let invalid = || DatabaseError::InvalidParam {
        name: name.to_string(),
        reason: format!("cannot bind {} value as {}", value.type_name(), ty),
    };

    let param = match (ty, value) {
        (_, Value::Null) => SqlParam::TypedNull(ty),
        (SqlType::Bit, Value::Bool(b)) => SqlParam::Bit(*b),
        (SqlType::Bit, Value::Int(n)) => SqlParam::Bit(*n != 0),
        (SqlType::TinyInt, Value::Int(n)) => u8::try_from(*n).map(SqlParam::U8).map_err(|_| invalid())?,
        (SqlType::SmallInt, Value::Int(n)) => i16::try_from(*n).map(SqlParam::I16).map_err(|_| invalid())?,
        (SqlType::Int, Value::Int(n)) => i32::try_from(*n).map(SqlParam::I32).map_err(|_| invalid())?,
        (SqlType::BigInt, Value::Int(n)) => SqlParam::I64(*n),
        (SqlType::Real, Value::Float(n)) => SqlParam::F32(*n as f32),
        (SqlType::Real, Value::Int(n)) => SqlParam::F32(*n as f32),
        (SqlType::Float, Value::Float(n)) => SqlParam::F64(*n),
        (SqlType::Float, Value::Int(n)) => SqlParam::F64(*n as f64),
        (SqlType::NVarChar | SqlType::VarChar, Value::String(s) | Value::DateTime(s)) => {
            SqlParam::String(s.clone())
        }
        (SqlType::NVarChar | SqlType::VarChar, Value::Int(n)) => SqlParam::String(n.to_string()),
        (SqlType::NVarChar | SqlType::VarChar, Value::Float(n)) => SqlParam::String(n.to_string()),
        (SqlType::NVarChar | SqlType::VarChar, Value::Bool(b)) => SqlParam::String(b.to_string()),
        (SqlType::UniqueIdentifier, Value::String(s)) => tiberius::Uuid::parse_str(s)
            .map(SqlParam::Guid)
            .map_err(|_| invalid())?,
        (SqlType::DateTime2, Value::String(s) | Value::DateTime(s)) => {
            parse_datetime(s).map(SqlParam::DateTime2).ok_or_else(invalid)?
        }
        (SqlType::Date, Value::String(s) | Value::DateTime(s)) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map(SqlParam::Date)
            .map_err(|_| invalid())?,
        (SqlType::VarBinary, Value::Binary(b)) => SqlParam::Binary(b.clone()),
        _ => return Err(invalid()),
    };
    Ok(param)
}

fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

/// Rewrite `@name` references into tiberius positional `@P1..@Pn`.
///
/// Names match case-insensitively. Text inside quotes, brackets and comments
/// is left alone, as are `@@` system variables and undeclared variables.
fn positional_sql(sql: &str, names: &[&str]) -> String {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len() + names.len() * 2);
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\'' | '"' | '[' => {
                let close = if c == '[' { ']' } else { c };
                out.push(c);
                i += 1;
                while i < chars.len() {
                    out.push(chars[i]);
                    i += 1;
                    if chars[i - 1] == close {
                        break;
                    }
                }
            }
            '-' if chars.get(i + 1) == Some(&'-') => {
                while i < chars.len() {
                    out.push(chars[i]);
                    i += 1;
                    if chars[i - 1] == '\n' {
                        break;
                    }
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                out.push_str("/*");
                i += 2;
                while i < chars.len() {
                    if chars[i] == '*' && chars.get(i + 1) == Some(&'/') {
                        out.push_str("*/");
                        i += 2;
                        break;
                    }
                    out.push(chars[i]);
                    i += 1;
                }
            }
            '@' if chars.get(i + 1) == Some(&'@') => {
                out.push_str("@@");
                i += 2;
            }
            '@' => {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && (chars[end].is_alphanumeric() || chars[end] == '_') {
                    end += 1;
                }
                let ident: String = chars[start..end].iter().collect();
                match names.iter().position(|n| !ident.is_empty() && n.eq_ignore_ascii_case(&ident)) {
                    Some(pos) => out.push_str(&format!("@P{}", pos + 1)),
                    None => {
                        out.push('@');
                        out.push_str(&ident);
                    }
                }
                i = end;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    out
}

/// Convert tiberius ColumnType to a SQL data type name
fn column_type_name(col_type: &ColumnType) -> String {
    match col_type {
        ColumnType::Int1 => "tinyint".to_string(),
        ColumnType::Int2 => "smallint".to_string(),
        ColumnType::Int4 | ColumnType::Intn => "int".to_string(),
        ColumnType::Int8 => "bigint".to_string(),
        ColumnType::Float4 => "real".to_string(),
        ColumnType::Float8 | ColumnType::Floatn => "float".to_string(),
        ColumnType::Decimaln => "decimal".to_string(),
        ColumnType::Numericn => "numeric".to_string(),
        ColumnType::Money => "money".to_string(),
        ColumnType::Money4 => "smallmoney".to_string(),
        ColumnType::Bit | ColumnType::Bitn => "bit".to_string(),
        ColumnType::BigVarChar => "varchar".to_string(),
        ColumnType::BigChar => "char".to_string(),
        ColumnType::NVarchar => "nvarchar".to_string(),
        ColumnType::NChar => "nchar".to_string(),
        ColumnType::Text => "text".to_string(),
        ColumnType::NText => "ntext".to_string(),
        ColumnType::BigVarBin => "varbinary".to_string(),
        ColumnType::BigBinary => "binary".to_string(),
        ColumnType::Image => "image".to_string(),
        ColumnType::Datetime | ColumnType::Datetimen => "datetime".to_string(),
        ColumnType::Datetime2 => "datetime2".to_string(),
        ColumnType::Datetime4 => "smalldatetime".to_string(),
        ColumnType::Daten => "date".to_string(),
        ColumnType::Timen => "time".to_string(),
        ColumnType::DatetimeOffsetn => "datetimeoffset".to_string(),
        ColumnType::Guid => "uniqueidentifier".to_string(),
        ColumnType::Xml => "xml".to_string(),
        ColumnType::Null => "null".to_string(),
        _ => format!("{:?}", col_type).to_lowercase(),
    }
}

fn get<'a, T: FromSql<'a>>(row: &'a tiberius::Row, idx: usize) -> Option<T> {
    row.try_get::<T, _>(idx).ok().flatten()
}

/// Convert a tiberius column value to a Value
fn cell_value(row: &tiberius::Row, idx: usize, col_type: &ColumnType) -> Value {
    let value = match col_type {
        ColumnType::Null => None,

        ColumnType::Int1 => get::<u8>(row, idx).map(Value::from),
        ColumnType::Int2 => get::<i16>(row, idx).map(Value::from),
        ColumnType::Int4 => get::<i32>(row, idx).map(Value::from),
        ColumnType::Int8 => get::<i64>(row, idx).map(Value::from),
        ColumnType::Intn => get::<i64>(row, idx)
            .map(Value::from)
            .or_else(|| get::<i32>(row, idx).map(Value::from))
            .or_else(|| get::<i16>(row, idx).map(Value::from))
            .or_else(|| get::<u8>(row, idx).map(Value::from)),

        ColumnType::Float4 => get::<f32>(row, idx).map(Value::from),
        ColumnType::Float8 | ColumnType::Money | ColumnType::Money4 => {
            get::<f64>(row, idx).map(Value::from)
        }
        ColumnType::Floatn => get::<f64>(row, idx)
            .map(Value::from)
            .or_else(|| get::<f32>(row, idx).map(Value::from)),
        ColumnType::Decimaln | ColumnType::Numericn => {
            get::<Numeric>(row, idx).map(|n| Value::Float(f64::from(n)))
        }

        ColumnType::Bit | ColumnType::Bitn => get::<bool>(row, idx).map(Value::from),

        ColumnType::Datetime | ColumnType::Datetime2 | ColumnType::Datetimen | ColumnType::Datetime4 => {
            get::<NaiveDateTime>(row, idx).map(|dt| Value::DateTime(dt.to_string()))
        }
        ColumnType::DatetimeOffsetn => {
            get::<DateTime<Utc>>(row, idx).map(|dt| Value::DateTime(dt.to_rfc3339()))
        }
        ColumnType::Daten => get::<NaiveDate>(row, idx).map(|d| Value::DateTime(d.to_string())),
        ColumnType::Timen => get::<NaiveTime>(row, idx).map(|t| Value::DateTime(t.to_string())),

        ColumnType::BigVarBin | ColumnType::BigBinary | ColumnType::Image => {
            get::<&[u8]>(row, idx).map(|b| Value::Binary(b.to_vec()))
        }
        ColumnType::Guid => get::<tiberius::Uuid>(row, idx).map(|u| Value::String(u.to_string())),

        // Character types and anything else: try as string
        _ => get::<&str>(row, idx).map(Value::from),
    };
    value.unwrap_or(Value::Null)
}

/// Convert the first result set of a statement
fn record_set(rows: Vec<tiberius::Row>) -> RecordSet {
    let Some(first) = rows.first() else {
        return RecordSet::default();
    };

    let columns: Vec<ColumnInfo> = first
        .columns()
        .iter()
        .map(|col| ColumnInfo::new(col.name(), column_type_name(&col.column_type())))
        .collect();
    let col_types: Vec<ColumnType> = first.columns().iter().map(|c| c.column_type()).collect();
    let names = Arc::new(columns.iter().map(|c| c.name.clone()).collect::<Vec<_>>());

    let rows = rows
        .iter()
        .map(|row| {
            let values = col_types
                .iter()
                .enumerate()
                .map(|(idx, col_type)| cell_value(row, idx, col_type))
                .collect();
            Row::new(Arc::clone(&names), values)
        })
        .collect();

    RecordSet::new(columns, rows)
}
