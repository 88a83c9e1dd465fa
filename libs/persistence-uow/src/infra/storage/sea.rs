//! SeaORM-backed sessions
//!
//! Statements are built with sea-query from the model's table targets, so no
//! SeaORM entity definitions are needed. Rows travel as JSON objects.
//!
//! Column types must accept the bound JSON scalars: integers bind as
//! `BIGINT`, floats as `DOUBLE`, strings as text, booleans as booleans and
//! nested objects or arrays as JSON.

use crate::config::{DataSourceConfig, PersistenceConfig};
use crate::contract::StoreError;
use crate::domain::data_source::DataSources;
use crate::domain::model::{Model, TableTarget};
use crate::domain::query::{Filter, Order, QuerySpec, Row};
use crate::domain::store::{Session, SessionFactory, WriteKind, WriteOp};
use async_trait::async_trait;
use sea_orm::sea_query::{
    Alias, Asterisk, Expr, IntoTableRef, Keyword, Order as SqlOrder, Query, SimpleExpr, TableRef,
};
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseBackend, DatabaseConnection, DbErr,
    FromQueryResult, SqlErr, TransactionTrait, Value as SqlValue,
};
use serde_json::Value as JsonValue;
use std::sync::Arc;

const BACKEND: &str = "sea-orm";

#[derive(Debug, Clone, Copy)]
struct PoolSettings {
    max_connections: u32,
    sqlx_logging: bool,
}

async fn open(url: &str, settings: PoolSettings) -> Result<DatabaseConnection, StoreError> {
    let mut options = ConnectOptions::new(url.to_string());
    options
        .max_connections(settings.max_connections)
        .sqlx_logging(settings.sqlx_logging);
    let db = Database::connect(options).await.map_err(|e| match e {
        DbErr::Conn(_) => StoreError::Unavailable(e.to_string()),
        other => StoreError::Database(other),
    })?;
    tracing::debug!(backend = ?db.get_database_backend(), "Connected to database");
    Ok(db)
}

/// Connection pool shared by every session of one data source
#[derive(Debug, Clone)]
pub struct SeaOrmStore {
    db: DatabaseConnection,
    url: String,
    settings: PoolSettings,
}

impl SeaOrmStore {
    pub async fn connect(config: &DataSourceConfig) -> Result<Self, StoreError> {
        let settings = PoolSettings {
            max_connections: config.max_connections,
            sqlx_logging: config.sqlx_logging,
        };
        Ok(Self {
            db: open(&config.url, settings).await?,
            url: config.url.clone(),
            settings,
        })
    }

    /// Wrap an existing connection. `url` is used when a session retargets.
    pub fn from_connection(db: DatabaseConnection, url: impl Into<String>) -> Self {
        Self {
            db,
            url: url.into(),
            settings: PoolSettings {
                max_connections: 1,
                sqlx_logging: false,
            },
        }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }
}

impl SessionFactory for SeaOrmStore {
    fn open_session(&self) -> Box<dyn Session> {
        Box::new(SeaOrmSession {
            db: Some(self.db.clone()),
            url: self.url.clone(),
            settings: self.settings,
        })
    }
}

/// Connect every configured data source and register it with its model.
///
/// `model_for` returns the model of a data source by name. A configured
/// schema is applied to that model before it is registered.
pub async fn connect_data_sources(
    config: &PersistenceConfig,
    model_for: impl Fn(&str) -> Arc<Model>,
) -> Result<DataSources, StoreError> {
    let mut sources = DataSources::new(config.context_options());
    for (name, source) in &config.data_sources {
        let model = model_for(name);
        if let Some(schema) = config.schema_for(name) {
            model.set_schema_all(schema);
        }
        let store = SeaOrmStore::connect(source).await?;
        sources.register(name.clone(), model, Arc::new(store));
        tracing::info!(data_source = %name, "Data source ready");
    }
    Ok(sources)
}

/// Session over a SeaORM connection. Retargeting drops the connection; the
/// next I/O reconnects to the new location.
#[derive(Debug)]
pub struct SeaOrmSession {
    db: Option<DatabaseConnection>,
    url: String,
    settings: PoolSettings,
}

impl SeaOrmSession {
    async fn connection(&mut self) -> Result<&DatabaseConnection, StoreError> {
        if self.db.is_none() {
            self.db = Some(open(&self.url, self.settings).await?);
        }
        self.db
            .as_ref()
            .ok_or_else(|| StoreError::Unavailable("no connection".to_string()))
    }
}

#[async_trait]
impl Session for SeaOrmSession {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn ping(&mut self) -> Result<(), StoreError> {
        self.connection()
            .await?
            .ping()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    async fn fetch(
        &mut self,
        target: &TableTarget,
        spec: &QuerySpec,
    ) -> Result<Vec<Row>, StoreError> {
        let db = self.connection().await?;
        let backend = db.get_database_backend();

        let mut select = Query::select();
        select.column(Asterisk).from(table_ref(target));
        if let Some(filter) = &spec.filter {
            select.and_where(filter_expr(filter));
        }
        for (column, order) in &spec.order {
            let order = match order {
                Order::Asc => SqlOrder::Asc,
                Order::Desc => SqlOrder::Desc,
            };
            select.order_by(Alias::new(column), order);
        }
        match (spec.limit, spec.offset) {
            (Some(limit), _) => {
                select.limit(limit);
            }
            // SQLite rejects OFFSET without LIMIT
            (None, Some(_)) if backend == DatabaseBackend::Sqlite => {
                select.limit(i64::MAX as u64);
            }
            (None, _) => {}
        }
        if let Some(offset) = spec.offset {
            select.offset(offset);
        }

        let rows = db.query_all(backend.build(&select)).await?;
        rows.iter()
            .map(|row| match JsonValue::from_query_result(row, "")? {
                JsonValue::Object(row) => Ok(row),
                other => Err(StoreError::MalformedRow {
                    target: target.to_string(),
                    message: format!("expected an object, got {other}"),
                }),
            })
            .collect()
    }

    async fn count(
        &mut self,
        target: &TableTarget,
        filter: Option<&Filter>,
    ) -> Result<u64, StoreError> {
        let db = self.connection().await?;
        let backend = db.get_database_backend();

        let mut select = Query::select();
        select
            .expr_as(Expr::cust("COUNT(*)"), Alias::new("count"))
            .from(table_ref(target));
        if let Some(filter) = filter {
            select.and_where(filter_expr(filter));
        }

        let row = db
            .query_one(backend.build(&select))
            .await?
            .ok_or_else(|| StoreError::MalformedRow {
                target: target.to_string(),
                message: "count returned no row".to_string(),
            })?;
        let count: i64 = row.try_get("", "count")?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    async fn apply(&mut self, batch: &mut [WriteOp]) -> Result<u64, StoreError> {
        let db = self.connection().await?;
        let backend = db.get_database_backend();
        let txn = db.begin().await?;

        let mut affected = 0;
        for op in batch.iter_mut() {
            affected += match op.kind {
                WriteKind::Insert => insert(&txn, backend, op).await?,
                WriteKind::Update => update(&txn, backend, op).await?,
                WriteKind::Delete => delete(&txn, backend, op).await?,
            };
        }

        txn.commit().await?;
        Ok(affected)
    }

    fn change_database(&mut self, database: &str) -> Result<(), StoreError> {
        if self.url.starts_with("sqlite:") {
            return Err(StoreError::Unsupported {
                backend: BACKEND,
                operation: "changing the database of a SQLite connection".to_string(),
            });
        }
        let mut url = url::Url::parse(&self.url).map_err(|e| StoreError::Other(e.into()))?;
        url.set_path(&format!("/{database}"));
        self.url = url.to_string();
        self.db = None;
        Ok(())
    }

    fn change_connection(&mut self, connection: &str) -> Result<(), StoreError> {
        self.url = connection.to_string();
        self.db = None;
        Ok(())
    }
}

async fn insert<C: ConnectionTrait>(
    conn: &C,
    backend: DatabaseBackend,
    op: &mut WriteOp,
) -> Result<u64, StoreError> {
    let mut stmt = Query::insert();
    stmt.into_table(table_ref(&op.target));
    if op.row.is_empty() {
        stmt.or_default_values();
    } else {
        stmt.columns(op.row.keys().map(Alias::new))
            .values(op.row.values().map(sql_expr))
            .map_err(|e| StoreError::Other(e.into()))?;
    }

    if !op.generate_key {
        let result = conn
            .execute(backend.build(&stmt))
            .await
            .map_err(|e| write_error(&op.target, e))?;
        return Ok(result.rows_affected());
    }

    stmt.returning_col(Alias::new(op.key_column));
    let row = conn
        .query_one(backend.build(&stmt))
        .await
        .map_err(|e| write_error(&op.target, e))?
        .ok_or_else(|| StoreError::MalformedRow {
            target: op.target.to_string(),
            message: "insert returned no key".to_string(),
        })?;
    let key = match JsonValue::from_query_result(&row, "")? {
        JsonValue::Object(mut returned) => returned.remove(op.key_column),
        _ => None,
    };
    op.generated_key = Some(key.ok_or_else(|| StoreError::MalformedRow {
        target: op.target.to_string(),
        message: format!("returned row has no `{}` column", op.key_column),
    })?);
    Ok(1)
}

async fn update<C: ConnectionTrait>(
    conn: &C,
    backend: DatabaseBackend,
    op: &WriteOp,
) -> Result<u64, StoreError> {
    let mut stmt = Query::update();
    stmt.table(table_ref(&op.target))
        .values(op.row.iter().map(|(column, value)| (Alias::new(column), sql_expr(value))))
        .and_where(Expr::col(Alias::new(op.key_column)).eq(sql_expr(&op.key)));
    let result = conn
        .execute(backend.build(&stmt))
        .await
        .map_err(|e| write_error(&op.target, e))?;
    match result.rows_affected() {
        0 => Err(stale(op)),
        n => Ok(n),
    }
}

async fn delete<C: ConnectionTrait>(
    conn: &C,
    backend: DatabaseBackend,
    op: &WriteOp,
) -> Result<u64, StoreError> {
    let mut stmt = Query::delete();
    stmt.from_table(table_ref(&op.target))
        .and_where(Expr::col(Alias::new(op.key_column)).eq(sql_expr(&op.key)));
    let result = conn
        .execute(backend.build(&stmt))
        .await
        .map_err(|e| write_error(&op.target, e))?;
    match result.rows_affected() {
        0 => Err(stale(op)),
        n => Ok(n),
    }
}

fn stale(op: &WriteOp) -> StoreError {
    StoreError::StaleWrite {
        target: op.target.to_string(),
        key: op.key.to_string(),
    }
}

fn write_error(target: &TableTarget, err: DbErr) -> StoreError {
    match err.sql_err() {
        Some(SqlErr::UniqueConstraintViolation(message))
        | Some(SqlErr::ForeignKeyConstraintViolation(message)) => StoreError::Constraint {
            target: target.to_string(),
            message,
        },
        _ => StoreError::Database(err),
    }
}

fn table_ref(target: &TableTarget) -> TableRef {
    match &target.schema {
        Some(schema) => (Alias::new(schema), Alias::new(&target.table)).into_table_ref(),
        None => Alias::new(&target.table).into_table_ref(),
    }
}

fn sql_expr(value: &JsonValue) -> SimpleExpr {
    let value = match value {
        JsonValue::Null => return SimpleExpr::Keyword(Keyword::Null),
        JsonValue::Bool(b) => SqlValue::Bool(Some(*b)),
        JsonValue::Number(n) => match (n.as_i64(), n.as_u64()) {
            (Some(i), _) => SqlValue::BigInt(Some(i)),
            (None, Some(u)) => SqlValue::BigUnsigned(Some(u)),
            (None, None) => SqlValue::Double(n.as_f64()),
        },
        JsonValue::String(s) => SqlValue::String(Some(Box::new(s.clone()))),
        other => SqlValue::Json(Some(Box::new(other.clone()))),
    };
    SimpleExpr::Value(value)
}

fn filter_expr(filter: &Filter) -> SimpleExpr {
    let col = |name: &String| Expr::col(Alias::new(name));
    match filter {
        Filter::Eq(name, value) => col(name).eq(sql_expr(value)),
        Filter::Ne(name, value) => col(name).ne(sql_expr(value)),
        Filter::Gt(name, value) => col(name).gt(sql_expr(value)),
        Filter::Ge(name, value) => col(name).gte(sql_expr(value)),
        Filter::Lt(name, value) => col(name).lt(sql_expr(value)),
        Filter::Le(name, value) => col(name).lte(sql_expr(value)),
        Filter::In(_, values) if values.is_empty() => Expr::cust("1 = 0"),
        Filter::In(name, values) => col(name).is_in(values.iter().map(sql_expr)),
        Filter::IsNull(name) => col(name).is_null(),
        Filter::IsNotNull(name) => col(name).is_not_null(),
        Filter::And(all) => all
            .iter()
            .map(filter_expr)
            .reduce(SimpleExpr::and)
            .unwrap_or_else(|| Expr::cust("1 = 1")),
        Filter::Or(any) => any
            .iter()
            .map(filter_expr)
            .reduce(SimpleExpr::or)
            .unwrap_or_else(|| Expr::cust("1 = 0")),
        Filter::Not(inner) => filter_expr(inner).not(),
    }
}
