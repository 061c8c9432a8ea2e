//! # Database Module
//!
//! One persistent SQLx connection (SQLite or PostgreSQL) behind an async
//! mutex, so statements are serialized.
//!
//! Statements use named `:name` placeholders which are rewritten to the
//! backend's positional form before binding. Every statement returns a
//! [`QueryResult`] envelope; a driver failure is returned as
//! `Error::Database` and additionally recorded on the instance
//! ([`Database::has_error`], [`Database::last_error`]).
//!
//! [`Database::begin_transaction`] hands out a [`Transaction`] that owns the
//! connection until it finishes. Statements on the shared handle wait for
//! it, so one request's transaction never sees another request's writes.
//! Inside a transaction, levels nest through a depth counter; only the
//! outermost commit or rollback reaches the server unless savepoint nesting
//! is enabled with [`Database::with_nested_savepoints`].

use crate::config::{Config, DatabaseConfig};
use crate::controller::BoxFuture;
use crate::error::{Error, Result};
use crate::query_builder::{validate_identifier, QueryBuilder};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::Serialize;
use serde_json::{Map, Number, Value};
use sqlx::postgres::{PgConnection, PgRow};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteRow};
use sqlx::{Column, ConnectOptions, Connection as _, Row as _, TypeInfo, ValueRef};
use std::ops::Deref;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

/// One result row, by column name
pub type Row = Map<String, Value>;

/// Named statement parameters
pub type QueryParams = Map<String, Value>;

/// Parameters from a JSON object literal; anything else gives none
///
/// ```ignore
/// db.query("SELECT * FROM users WHERE id = :id", &params(json!({ "id": 7 }))).await?;
/// ```
#[must_use]
pub fn params(value: Value) -> QueryParams {
    match value {
        Value::Object(map) => map,
        _ => QueryParams::new(),
    }
}

/// Database backend of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// SQLite
    Sqlite,
    /// PostgreSQL
    Postgres,
}

enum Connection {
    Sqlite(SqliteConnection),
    Postgres(PgConnection),
}

/// Result envelope of [`Database::query`]
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    /// Statement as written by the caller
    pub query: String,
    /// Parameters it was run with
    pub params: QueryParams,
    /// Returned rows (empty for writes)
    pub rows: Vec<Row>,
    /// Rows changed by a write, or rows returned by a read
    pub rows_affected: u64,
    /// Row id of the last insert, where the backend reports one
    pub last_insert_id: Option<i64>,
    /// Sequence number of the statement on this instance
    pub query_id: u64,
}

/// What a transaction level call did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    /// Only the depth counter moved; `depth` is the new depth
    Nested {
        /// Depth after the call
        depth: u32,
    },
    /// `COMMIT` was issued
    Committed,
    /// `ROLLBACK` was issued
    RolledBack,
}

#[derive(Default)]
struct State {
    last_error: Option<String>,
    last_insert_id: Option<i64>,
    missing_tables: Vec<String>,
    fillable: Vec<String>,
}

enum Bound {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

type Outcome = (Vec<Row>, u64, Option<i64>);

/// Everything the handles of one database have in common
struct Shared {
    conn: Arc<Mutex<Connection>>,
    backend: Backend,
    state: RwLock<State>,
    query_counter: AtomicU64,
    /// Set when a [`Transaction`] is dropped while still open
    abandoned: AtomicBool,
}

impl Shared {
    /// Roll back a transaction that was dropped without finishing
    async fn settle(&self, conn: &mut Connection) {
        if !self.abandoned.swap(false, Ordering::AcqRel) {
            return;
        }
        match execute(conn, "ROLLBACK", &[]).await {
            Ok(_) => debug!("Abandoned transaction rolled back"),
            Err(e) => warn!(error = %e, "Rolling back an abandoned transaction failed"),
        }
    }
}

/// Connection pinned by a transaction; `None` once it has finished
struct Pinned {
    conn: Mutex<Option<OwnedMutexGuard<Connection>>>,
    depth: AtomicU32,
}

/// Database handle
pub struct Database {
    shared: Arc<Shared>,
    nested_savepoints: bool,
    pinned: Option<Arc<Pinned>>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("backend", &self.shared.backend)
            .field("nested_savepoints", &self.nested_savepoints)
            .field("in_transaction", &self.pinned.is_some())
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Connect using a URL (`sqlite:...` or `postgres://...`)
    ///
    /// # Errors
    ///
    /// `Error::Config` for an unknown scheme, `Error::Database` when the
    /// connection fails.
    pub async fn connect(url: &str) -> Result<Self> {
        if url.starts_with("sqlite:") {
            Self::connect_sqlite(url).await
        } else if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Self::connect_postgres(url).await
        } else {
            Err(Error::Config {
                message: format!("Unsupported database URL: {url}"),
            })
        }
    }

    /// Connect to a SQLite database, creating the file if needed
    ///
    /// # Example
    ///
    /// ```ignore
    /// let db = Database::connect_sqlite("sqlite::memory:").await?;
    /// let db = Database::connect_sqlite("sqlite:app.db").await?;
    /// ```
    ///
    /// # Errors
    ///
    /// `Error::Database` when the connection fails.
    pub async fn connect_sqlite(url: &str) -> Result<Self> {
        let conn = SqliteConnectOptions::from_str(url)
            .map_err(|e| Error::Database {
                message: format!("SQLite connection failed: {e}"),
            })?
            .create_if_missing(true)
            .connect()
            .await
            .map_err(|e| Error::Database {
                message: format!("SQLite connection failed: {e}"),
            })?;

        info!(backend = "sqlite", "Database connected");
        Ok(Self::from_connection(Connection::Sqlite(conn), Backend::Sqlite))
    }

    /// Connect to a PostgreSQL database
    ///
    /// # Errors
    ///
    /// `Error::Database` when the connection fails.
    pub async fn connect_postgres(url: &str) -> Result<Self> {
        let conn = PgConnection::connect(url)
            .await
            .map_err(|e| Error::Database {
                message: format!("PostgreSQL connection failed: {e}"),
            })?;

        info!(backend = "postgres", "Database connected");
        Ok(Self::from_connection(Connection::Postgres(conn), Backend::Postgres))
    }

    /// Connect with the `DB_*` / `DATABASE_URL` settings; `None` when no
    /// database is configured
    ///
    /// # Errors
    ///
    /// Configuration or connection errors.
    pub async fn from_config(config: &Config) -> Result<Option<Self>> {
        match DatabaseConfig::from_config(config)? {
            Some(settings) => Ok(Some(Self::connect(&settings.url).await?)),
            None => Ok(None),
        }
    }

    fn from_connection(conn: Connection, backend: Backend) -> Self {
        Self {
            shared: Arc::new(Shared {
                conn: Arc::new(Mutex::new(conn)),
                backend,
                state: RwLock::new(State::default()),
                query_counter: AtomicU64::new(0),
                abandoned: AtomicBool::new(false),
            }),
            nested_savepoints: false,
            pinned: None,
        }
    }

    /// Back inner transaction levels with `SAVEPOINT sp_<depth>`
    #[must_use]
    pub fn with_nested_savepoints(mut self, enabled: bool) -> Self {
        self.nested_savepoints = enabled;
        self
    }

    /// Backend of the connection
    #[must_use]
    pub fn backend(&self) -> Backend {
        self.shared.backend
    }

    /// Restrict `insert` / `update` to these columns; empty allows all
    pub fn set_fillable(&self, columns: &[&str]) {
        self.state_mut().fillable = columns.iter().map(|c| (*c).to_string()).collect();
    }

    fn state(&self) -> RwLockReadGuard<'_, State> {
        self.shared.state.read()
    }

    fn state_mut(&self) -> RwLockWriteGuard<'_, State> {
        self.shared.state.write()
    }

    /// Whether the most recent statement failed
    #[must_use]
    pub fn has_error(&self) -> bool {
        self.state().last_error.is_some()
    }

    /// Driver message of the most recent failure, until a statement succeeds
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.state().last_error.clone()
    }

    /// Row id reported by the most recent insert
    #[must_use]
    pub fn last_insert_id(&self) -> Option<i64> {
        self.state().last_insert_id
    }

    /// Tables reported absent by the latest [`Database::table_exists`]
    #[must_use]
    pub fn missing_tables(&self) -> Vec<String> {
        self.state().missing_tables.clone()
    }

    /// Transaction depth of this handle; always 0 outside a [`Transaction`]
    #[must_use]
    pub fn transaction_depth(&self) -> u32 {
        self.pinned
            .as_ref()
            .map_or(0, |p| p.depth.load(Ordering::Acquire))
    }

    /// Query builder over `table`
    ///
    /// # Errors
    ///
    /// `QueryArgument` for an invalid table name.
    pub fn table(&self, table: &str) -> Result<QueryBuilder> {
        QueryBuilder::new(table)
    }

    /// Run a statement with named parameters
    ///
    /// On a [`Transaction`] the statement runs on its pinned connection;
    /// otherwise it waits until no transaction holds the connection.
    ///
    /// # Errors
    ///
    /// `QueryArgument` when the SQL names a parameter that was not given,
    /// `TransactionState` on a finished transaction, `Error::Database` when
    /// the driver fails (the failure is also recorded, see
    /// [`Database::has_error`]).
    pub async fn query(&self, sql: &str, params: &QueryParams) -> Result<QueryResult> {
        let query_id = self.shared.query_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let (compiled, binds) = compile_named(sql, params, self.backend())?;
        debug!(query_id, sql = %compiled, "Executing statement");

        let outcome = match &self.pinned {
            None => {
                let mut conn = self.shared.conn.lock().await;
                self.shared.settle(&mut conn).await;
                execute(&mut conn, &compiled, &binds).await
            }
            Some(pinned) => {
                let mut slot = pinned.conn.lock().await;
                let Some(conn) = slot.as_mut() else {
                    return Err(finished());
                };
                execute(conn, &compiled, &binds).await
            }
        };

        match outcome {
            Ok((rows, rows_affected, last_insert_id)) => {
                let mut state = self.state_mut();
                state.last_error = None;
                if last_insert_id.is_some() {
                    state.last_insert_id = last_insert_id;
                }
                Ok(QueryResult {
                    query: sql.to_string(),
                    params: params.clone(),
                    rows,
                    rows_affected,
                    last_insert_id,
                    query_id,
                })
            }
            Err(e) => {
                let message = e.to_string();
                error!(
                    query_id,
                    class = classify(&e),
                    sql = %compiled,
                    error = %message,
                    "Database statement failed"
                );
                self.state_mut().last_error = Some(message.clone());
                Err(Error::Database { message })
            }
        }
    }

    async fn statement(&self, sql: &str) -> Result<()> {
        self.query(sql, &QueryParams::new()).await.map(|_| ())
    }

    /// Open a transaction that owns the connection until it finishes
    ///
    /// Other handles wait for the connection meanwhile. Dropping the
    /// transaction without committing rolls it back before the connection
    /// is used again.
    ///
    /// # Errors
    ///
    /// `TransactionState` when called through a transaction (nest with
    /// [`Transaction::begin_transaction`] instead), driver errors from
    /// `BEGIN`.
    pub async fn begin_transaction(&self) -> Result<Transaction> {
        if self.pinned.is_some() {
            return Err(Error::TransactionState {
                message: "already inside a transaction".to_string(),
            });
        }
        let mut conn = Arc::clone(&self.shared.conn).lock_owned().await;
        self.shared.settle(&mut conn).await;

        let pinned = Arc::new(Pinned {
            conn: Mutex::new(Some(conn)),
            depth: AtomicU32::new(0),
        });
        let db = Self {
            shared: Arc::clone(&self.shared),
            nested_savepoints: self.nested_savepoints,
            pinned: Some(Arc::clone(&pinned)),
        };
        db.statement("BEGIN").await?;
        let tx = Transaction { db, pinned };
        tx.set_depth(1);
        debug!("Transaction opened");
        Ok(tx)
    }

    /// Run `work` inside a transaction, committing on success and rolling
    /// back on error
    ///
    /// ```ignore
    /// db.transaction(|tx| Box::pin(async move {
    ///     tx.insert("users", &params(json!({ "name": "Ana" }))).await?;
    ///     tx.insert("audit", &params(json!({ "event": "signup" }))).await
    /// })).await?;
    /// ```
    ///
    /// # Errors
    ///
    /// The error returned by `work`, or a transaction error.
    pub async fn transaction<T, F>(&self, work: F) -> Result<T>
    where
        F: for<'a> FnOnce(&'a Transaction) -> BoxFuture<'a, Result<T>>,
    {
        let tx = self.begin_transaction().await?;
        let outcome = work(&tx).await;
        match outcome {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    error!(error = %rollback, "Rollback after failed transaction also failed");
                }
                Err(e)
            }
        }
    }

    /// `SAVEPOINT name`
    ///
    /// # Errors
    ///
    /// `QueryArgument` for an invalid name, `TransactionState` outside a
    /// transaction, driver errors otherwise.
    pub async fn create_savepoint(&self, name: &str) -> Result<()> {
        self.savepoint_statement("SAVEPOINT", name).await
    }

    /// `RELEASE SAVEPOINT name`
    ///
    /// # Errors
    ///
    /// See [`Database::create_savepoint`].
    pub async fn release_savepoint(&self, name: &str) -> Result<()> {
        self.savepoint_statement("RELEASE SAVEPOINT", name).await
    }

    /// `ROLLBACK TO SAVEPOINT name`
    ///
    /// # Errors
    ///
    /// See [`Database::create_savepoint`].
    pub async fn rollback_to_savepoint(&self, name: &str) -> Result<()> {
        self.savepoint_statement("ROLLBACK TO SAVEPOINT", name).await
    }

    async fn savepoint_statement(&self, verb: &str, name: &str) -> Result<()> {
        validate_identifier(name)?;
        if self.pinned.is_none() {
            return Err(Error::TransactionState {
                message: format!("{verb} needs an open transaction"),
            });
        }
        self.statement(&format!("{verb} {name}")).await
    }

    /// Run statements in order inside one transaction
    ///
    /// # Errors
    ///
    /// The first failing statement's error; everything is rolled back.
    pub async fn execute_batch(&self, statements: &[&str]) -> Result<()> {
        let statements: Vec<String> = statements.iter().map(|s| (*s).to_string()).collect();
        self.transaction(move |tx| {
            Box::pin(async move {
                for sql in &statements {
                    tx.statement(sql).await?;
                }
                Ok(())
            })
        })
        .await
    }

    /// Run arbitrary SQL with named parameters
    ///
    /// # Errors
    ///
    /// See [`Database::query`].
    pub async fn execute_raw(&self, sql: &str, params: &QueryParams) -> Result<QueryResult> {
        self.query(sql, params).await
    }

    /// `SELECT columns FROM table WHERE col = :col AND ... [ORDER BY] [LIMIT]`
    ///
    /// # Errors
    ///
    /// `QueryArgument` for bad identifiers, driver errors otherwise.
    pub async fn select(
        &self,
        table: &str,
        columns: &str,
        conditions: &QueryParams,
        order_by: Option<&str>,
        limit: Option<u64>,
    ) -> Result<Vec<Row>> {
        let mut sql = select_sql(table, columns, conditions, order_by, false)?;
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        Ok(self.query(&sql, &prefixed(conditions)).await?.rows)
    }

    /// First matching row
    ///
    /// # Errors
    ///
    /// See [`Database::select`].
    pub async fn select_one(
        &self,
        table: &str,
        columns: &str,
        conditions: &QueryParams,
        order_by: Option<&str>,
    ) -> Result<Option<Row>> {
        let rows = self.select(table, columns, conditions, order_by, Some(1)).await?;
        Ok(rows.into_iter().next())
    }

    /// Values of one column
    ///
    /// # Errors
    ///
    /// See [`Database::select`].
    pub async fn select_column(
        &self,
        table: &str,
        column: &str,
        conditions: &QueryParams,
    ) -> Result<Vec<Value>> {
        let rows = self.select(table, column, conditions, None, None).await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.into_iter().next().map(|(_, v)| v))
            .collect())
    }

    /// `SELECT DISTINCT column`
    ///
    /// # Errors
    ///
    /// See [`Database::select`].
    pub async fn select_distinct(
        &self,
        table: &str,
        column: &str,
        conditions: &QueryParams,
        order_by: Option<&str>,
    ) -> Result<Vec<Row>> {
        let sql = select_sql(table, column, conditions, order_by, true)?;
        Ok(self.query(&sql, &prefixed(conditions)).await?.rows)
    }

    /// `SELECT ... LIMIT limit OFFSET offset`
    ///
    /// # Errors
    ///
    /// See [`Database::select`].
    pub async fn select_with_pagination(
        &self,
        table: &str,
        columns: &str,
        conditions: &QueryParams,
        order_by: Option<&str>,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<Row>> {
        let mut sql = select_sql(table, columns, conditions, order_by, false)?;
        sql.push_str(&format!(" LIMIT {limit} OFFSET {offset}"));
        Ok(self.query(&sql, &prefixed(conditions)).await?.rows)
    }

    /// Insert one row; returns the affected row count
    ///
    /// # Errors
    ///
    /// `QueryArgument` for empty data or a column outside the fillable
    /// list, driver errors otherwise.
    pub async fn insert(&self, table: &str, data: &QueryParams) -> Result<u64> {
        validate_identifier(table)?;
        self.check_fillable(data)?;
        let columns: Vec<&str> = data.keys().map(String::as_str).collect();
        let placeholders: Vec<String> = columns.iter().map(|c| format!(":{c}")).collect();
        let sql = format!(
            "INSERT INTO {table} ({}) VALUES ({})",
            columns.join(", "),
            placeholders.join(", ")
        );
        Ok(self.query(&sql, data).await?.rows_affected)
    }

    /// Update matching rows; returns the affected row count
    ///
    /// # Errors
    ///
    /// See [`Database::insert`].
    pub async fn update(&self, table: &str, data: &QueryParams, conditions: &QueryParams) -> Result<u64> {
        validate_identifier(table)?;
        self.check_fillable(data)?;
        let set: Vec<String> = data.keys().map(|c| format!("{c} = :{c}")).collect();
        let sql = format!("UPDATE {table} SET {}{}", set.join(", "), where_sql(conditions)?);

        let mut all = data.clone();
        all.extend(prefixed(conditions));
        Ok(self.query(&sql, &all).await?.rows_affected)
    }

    /// Delete matching rows; returns the affected row count
    ///
    /// # Errors
    ///
    /// See [`Database::select`].
    pub async fn delete(&self, table: &str, conditions: &QueryParams) -> Result<u64> {
        validate_identifier(table)?;
        let sql = format!("DELETE FROM {table}{}", where_sql(conditions)?);
        Ok(self.query(&sql, &prefixed(conditions)).await?.rows_affected)
    }

    /// Number of matching rows
    ///
    /// # Errors
    ///
    /// See [`Database::select`].
    pub async fn count_rows(&self, table: &str, conditions: &QueryParams) -> Result<i64> {
        let rows = self.select(table, "COUNT(*) AS count", conditions, None, None).await?;
        Ok(rows
            .first()
            .and_then(|row| row.get("count"))
            .and_then(Value::as_i64)
            .unwrap_or(0))
    }

    /// Whether any row matches
    ///
    /// # Errors
    ///
    /// See [`Database::select`].
    pub async fn record_exists(&self, table: &str, conditions: &QueryParams) -> Result<bool> {
        Ok(self.count_rows(table, conditions).await? > 0)
    }

    /// Column names of `table`, in declaration order
    ///
    /// # Errors
    ///
    /// `QueryArgument` for an invalid name, driver errors otherwise.
    pub async fn column_names(&self, table: &str) -> Result<Vec<String>> {
        validate_identifier(table)?;
        let sql = match self.backend() {
            Backend::Sqlite => "SELECT name FROM pragma_table_info(:table)",
            Backend::Postgres => {
                "SELECT column_name AS name FROM information_schema.columns \
                 WHERE table_name = :table ORDER BY ordinal_position"
            }
        };
        let result = self.query(sql, &params(serde_json::json!({ "table": table }))).await?;
        Ok(string_column(result.rows))
    }

    /// Names of the user tables
    ///
    /// # Errors
    ///
    /// Driver errors.
    pub async fn table_names(&self) -> Result<Vec<String>> {
        let sql = match self.backend() {
            Backend::Sqlite => {
                "SELECT name FROM sqlite_master WHERE type = 'table' \
                 AND name NOT LIKE 'sqlite_%' ORDER BY name"
            }
            Backend::Postgres => {
                "SELECT tablename AS name FROM pg_catalog.pg_tables \
                 WHERE schemaname = 'public' ORDER BY tablename"
            }
        };
        let result = self.query(sql, &QueryParams::new()).await?;
        Ok(string_column(result.rows))
    }

    /// Which of `names` do not exist; also kept as
    /// [`Database::missing_tables`]
    ///
    /// # Errors
    ///
    /// Driver errors.
    pub async fn table_exists(&self, names: &[&str]) -> Result<Vec<String>> {
        let existing = self.table_names().await?;
        let missing: Vec<String> = names
            .iter()
            .filter(|name| !existing.iter().any(|t| t == *name))
            .map(|name| (*name).to_string())
            .collect();
        if !missing.is_empty() {
            info!(missing = ?missing, "Tables missing");
        }
        self.state_mut().missing_tables.clone_from(&missing);
        Ok(missing)
    }

    fn check_fillable(&self, data: &QueryParams) -> Result<()> {
        if data.is_empty() {
            return Err(Error::query_argument("no columns given"));
        }
        let state = self.state();
        for column in data.keys() {
            validate_identifier(column)?;
            if !state.fillable.is_empty() && !state.fillable.contains(column) {
                return Err(Error::query_argument(format!("column '{column}' is not fillable")));
            }
        }
        Ok(())
    }
}

/// Transaction holding the connection of a [`Database`]
///
/// Derefs to [`Database`], so every statement helper and
/// [`QueryBuilder`] execution runs inside it. Levels nest with
/// [`Transaction::begin_transaction`]; [`Transaction::commit`] and
/// [`Transaction::rollback`] finish the whole transaction.
pub struct Transaction {
    db: Database,
    pinned: Arc<Pinned>,
}

impl Deref for Transaction {
    type Target = Database;

    fn deref(&self) -> &Database {
        &self.db
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("depth", &self.depth())
            .finish_non_exhaustive()
    }
}

impl Transaction {
    /// Current nesting depth; 0 once finished
    #[must_use]
    pub fn depth(&self) -> u32 {
        self.pinned.depth.load(Ordering::Acquire)
    }

    fn set_depth(&self, depth: u32) {
        self.pinned.depth.store(depth, Ordering::Release);
    }

    /// Finish at the server and hand the connection back
    async fn finish(&self, sql: &str) -> Result<()> {
        let result = self.db.statement(sql).await;
        self.set_depth(0);
        if result.is_err() {
            self.db.shared.abandoned.store(true, Ordering::Release);
        }
        self.pinned.conn.lock().await.take();
        result
    }

    /// Go one level deeper
    ///
    /// # Errors
    ///
    /// `TransactionState` once finished, driver errors from `SAVEPOINT`.
    pub async fn begin_transaction(&self) -> Result<TxOutcome> {
        let depth = match self.depth() {
            0 => return Err(finished()),
            depth => depth + 1,
        };
        if self.db.nested_savepoints {
            self.db.statement(&format!("SAVEPOINT sp_{depth}")).await?;
        }
        self.set_depth(depth);
        Ok(TxOutcome::Nested { depth })
    }

    /// Commit the outermost level, or leave an inner one
    ///
    /// # Errors
    ///
    /// `TransactionState` once finished, driver errors otherwise.
    pub async fn commit_transaction(&self) -> Result<TxOutcome> {
        match self.depth() {
            0 => Err(finished()),
            1 => {
                self.finish("COMMIT").await?;
                debug!("Transaction committed");
                Ok(TxOutcome::Committed)
            }
            depth => {
                if self.db.nested_savepoints {
                    self.db
                        .statement(&format!("RELEASE SAVEPOINT sp_{depth}"))
                        .await?;
                }
                self.set_depth(depth - 1);
                Ok(TxOutcome::Nested { depth: depth - 1 })
            }
        }
    }

    /// Roll back the outermost level, or leave an inner one
    ///
    /// Without savepoint nesting an inner rollback only moves the counter;
    /// its work is undone only if an outer level rolls back too.
    ///
    /// # Errors
    ///
    /// `TransactionState` once finished, driver errors otherwise.
    pub async fn rollback_transaction(&self) -> Result<TxOutcome> {
        match self.depth() {
            0 => Err(finished()),
            1 => {
                self.finish("ROLLBACK").await?;
                debug!("Transaction rolled back");
                Ok(TxOutcome::RolledBack)
            }
            depth => {
                if self.db.nested_savepoints {
                    let name = format!("sp_{depth}");
                    self.db.rollback_to_savepoint(&name).await?;
                    self.db.release_savepoint(&name).await?;
                }
                self.set_depth(depth - 1);
                Ok(TxOutcome::Nested { depth: depth - 1 })
            }
        }
    }

    /// Commit every level
    ///
    /// # Errors
    ///
    /// `TransactionState` when already finished, driver errors otherwise.
    pub async fn commit(self) -> Result<()> {
        if self.depth() == 0 {
            return Err(finished());
        }
        self.finish("COMMIT").await?;
        debug!("Transaction committed");
        Ok(())
    }

    /// Roll back every level
    ///
    /// # Errors
    ///
    /// `TransactionState` when already finished, driver errors otherwise.
    pub async fn rollback(self) -> Result<()> {
        if self.depth() == 0 {
            return Err(finished());
        }
        self.finish("ROLLBACK").await?;
        debug!("Transaction rolled back");
        Ok(())
    }

    /// Run `work` one level deeper, leaving the level by commit on success
    /// and by rollback on error
    ///
    /// # Errors
    ///
    /// The error returned by `work`, or a transaction error.
    pub async fn transaction<T, F>(&self, work: F) -> Result<T>
    where
        F: for<'a> FnOnce(&'a Self) -> BoxFuture<'a, Result<T>>,
    {
        self.begin_transaction().await?;
        let outcome = work(self).await;
        match outcome {
            Ok(value) => {
                self.commit_transaction().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = self.rollback_transaction().await {
                    error!(error = %rollback, "Rollback of a nested level also failed");
                }
                Err(e)
            }
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.depth() > 0 {
            warn!("Transaction dropped while open, rolling back");
            self.db.shared.abandoned.store(true, Ordering::Release);
        }
    }
}

fn finished() -> Error {
    Error::TransactionState {
        message: "transaction already finished".to_string(),
    }
}

async fn execute(
    conn: &mut Connection,
    sql: &str,
    binds: &[Bound],
) -> std::result::Result<Outcome, sqlx::Error> {
    let returns_rows = returns_rows(sql);

    macro_rules! bind_all {
        ($query:expr) => {{
            let mut query = $query;
            for value in binds {
                query = match value {
                    Bound::Int(v) => query.bind(*v),
                    Bound::Float(v) => query.bind(*v),
                    Bound::Bool(v) => query.bind(*v),
                    Bound::Text(v) => query.bind(v.clone()),
                };
            }
            query
        }};
    }

    match conn {
        Connection::Sqlite(c) => {
            let query = bind_all!(sqlx::query::<sqlx::Sqlite>(sql));
            if returns_rows {
                let rows: Vec<SqliteRow> = query.fetch_all(&mut *c).await?;
                let rows: Vec<Row> = rows.iter().map(sqlite_row_to_map).collect();
                let count = rows.len() as u64;
                Ok((rows, count, None))
            } else {
                let result = query.execute(&mut *c).await?;
                let id = sql
                    .trim_start()
                    .get(..6)
                    .is_some_and(|head| head.eq_ignore_ascii_case("INSERT"))
                    .then(|| result.last_insert_rowid());
                Ok((Vec::new(), result.rows_affected(), id))
            }
        }
        Connection::Postgres(c) => {
            let query = bind_all!(sqlx::query::<sqlx::Postgres>(sql));
            if returns_rows {
                let rows: Vec<PgRow> = query.fetch_all(&mut *c).await?;
                let rows: Vec<Row> = rows.iter().map(pg_row_to_map).collect();
                let id = rows
                    .first()
                    .and_then(|r| r.get("id"))
                    .and_then(Value::as_i64)
                    .filter(|_| sql.to_ascii_uppercase().contains("RETURNING"));
                let count = rows.len() as u64;
                Ok((rows, count, id))
            } else {
                let result = query.execute(&mut *c).await?;
                Ok((Vec::new(), result.rows_affected(), None))
            }
        }
    }
}

/// Driver error class used in logs
fn classify(error: &sqlx::Error) -> &'static str {
    match error {
        sqlx::Error::Database(db) if db.is_unique_violation() => "duplicate",
        sqlx::Error::Database(db)
            if matches!(db.code().as_deref(), Some("28P01" | "28000" | "1045")) =>
        {
            "authentication"
        }
        _ => "generic",
    }
}

fn returns_rows(sql: &str) -> bool {
    let head = sql
        .trim_start()
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or("")
        .to_ascii_uppercase();
    matches!(
        head.as_str(),
        "SELECT" | "WITH" | "PRAGMA" | "SHOW" | "EXPLAIN" | "VALUES"
    ) || sql.to_ascii_uppercase().contains(" RETURNING ")
}

/// Condition parameters are bound as `:where_<col>` so they cannot clash
/// with `SET` values of the same column
fn prefixed(conditions: &QueryParams) -> QueryParams {
    conditions
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| (format!("where_{k}"), v.clone()))
        .collect()
}

fn where_sql(conditions: &QueryParams) -> Result<String> {
    if conditions.is_empty() {
        return Ok(String::new());
    }
    let mut parts = Vec::with_capacity(conditions.len());
    for (column, value) in conditions {
        validate_identifier(column)?;
        if value.is_null() {
            parts.push(format!("{column} IS NULL"));
        } else {
            parts.push(format!("{column} = :where_{column}"));
        }
    }
    Ok(format!(" WHERE {}", parts.join(" AND ")))
}

fn select_sql(
    table: &str,
    columns: &str,
    conditions: &QueryParams,
    order_by: Option<&str>,
    distinct: bool,
) -> Result<String> {
    validate_identifier(table)?;
    if columns.contains(';') || columns.contains("--") {
        return Err(Error::query_argument(format!("invalid column list '{columns}'")));
    }
    let mut sql = format!(
        "SELECT {}{columns} FROM {table}{}",
        if distinct { "DISTINCT " } else { "" },
        where_sql(conditions)?
    );
    if let Some(order_by) = order_by {
        let mut parts = order_by.split_whitespace();
        let column = parts.next().unwrap_or("");
        validate_identifier(column)?;
        let direction = parts.next().unwrap_or("ASC").to_ascii_uppercase();
        if !matches!(direction.as_str(), "ASC" | "DESC") || parts.next().is_some() {
            return Err(Error::query_argument(format!("invalid order '{order_by}'")));
        }
        sql.push_str(&format!(" ORDER BY {column} {direction}"));
    }
    Ok(sql)
}

fn string_column(rows: Vec<Row>) -> Vec<String> {
    rows.into_iter()
        .filter_map(|row| row.into_iter().next())
        .filter_map(|(_, v)| v.as_str().map(str::to_string))
        .collect()
}

/// Rewrite `:name` placeholders to `?` (SQLite) or `$n` (PostgreSQL)
///
/// Quoted text and `::` casts are left alone. Null values are written
/// inline; inside a condition `= :x` / `!= :x` become `IS NULL` /
/// `IS NOT NULL`. A name used twice is bound twice on SQLite and reuses its
/// index on PostgreSQL.
fn compile_named(sql: &str, params: &QueryParams, backend: Backend) -> Result<(String, Vec<Bound>)> {
    let mut out = String::with_capacity(sql.len());
    let mut binds = Vec::new();
    let mut indexes: Vec<(String, usize)> = Vec::new();
    let mut quote: Option<char> = None;
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            out.push(c);
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => {
                quote = Some(c);
                out.push(c);
            }
            ':' if chars.peek() == Some(&':') => {
                out.push_str("::");
                chars.next();
            }
            ':' if chars.peek().is_some_and(|n| n.is_ascii_alphabetic() || *n == '_') => {
                let mut name = String::new();
                while let Some(&n) = chars.peek() {
                    if n.is_ascii_alphanumeric() || n == '_' {
                        name.push(n);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value = params.get(&name).ok_or_else(|| {
                    Error::query_argument(format!("no value bound for parameter :{name}"))
                })?;
                let Some(bound) = to_bound(value) else {
                    push_null(&mut out);
                    continue;
                };
                match backend {
                    Backend::Sqlite => {
                        out.push('?');
                        binds.push(bound);
                    }
                    Backend::Postgres => {
                        let index = if let Some((_, i)) = indexes.iter().find(|(n, _)| *n == name) {
                            *i
                        } else {
                            binds.push(bound);
                            indexes.push((name, binds.len()));
                            binds.len()
                        };
                        out.push_str(&format!("${index}"));
                    }
                }
            }
            _ => out.push(c),
        }
    }
    Ok((out, binds))
}

fn push_null(out: &mut String) {
    let trimmed = out.trim_end();
    let rewrite = if !in_condition(trimmed) {
        None
    } else if let Some(rest) = trimmed
        .strip_suffix("!=")
        .or_else(|| trimmed.strip_suffix("<>"))
    {
        Some((rest.len(), "IS NOT NULL"))
    } else {
        trimmed
            .strip_suffix('=')
            .filter(|rest| !rest.ends_with(|c: char| c == '<' || c == '>'))
            .map(|rest| (rest.len(), "IS NULL"))
    };

    match rewrite {
        Some((len, keyword)) => {
            out.truncate(len);
            if !out.ends_with(' ') {
                out.push(' ');
            }
            out.push_str(keyword);
        }
        None => out.push_str("NULL"),
    }
}

/// Whether the end of `sql` sits in a `WHERE` / `HAVING` / `ON` clause
/// rather than a `SET`, `VALUES` or select list
fn in_condition(sql: &str) -> bool {
    sql.split(|c: char| c.is_whitespace() || c == '(' || c == ')')
        .rev()
        .find_map(|word| {
            if ["WHERE", "HAVING", "ON"].iter().any(|k| word.eq_ignore_ascii_case(k)) {
                Some(true)
            } else if ["SET", "VALUES", "SELECT"].iter().any(|k| word.eq_ignore_ascii_case(k)) {
                Some(false)
            } else {
                None
            }
        })
        .unwrap_or(false)
}

fn to_bound(value: &Value) -> Option<Bound> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(Bound::Bool(*b)),
        Value::Number(n) => Some(
            n.as_i64()
                .map_or_else(|| Bound::Float(n.as_f64().unwrap_or(0.0)), Bound::Int),
        ),
        Value::String(s) => Some(Bound::Text(s.clone())),
        other => Some(Bound::Text(other.to_string())),
    }
}

fn float_value(v: f64) -> Value {
    Number::from_f64(v).map_or(Value::Null, Value::Number)
}

/// Convert a SQLite row using the storage class of each value
fn sqlite_row_to_map(row: &SqliteRow) -> Row {
    let mut map = Row::new();

    for (i, column) in row.columns().iter().enumerate() {
        let name = column.name().to_string();
        let value = match row.try_get_raw(i) {
            Ok(raw) if raw.is_null() => Value::Null,
            Ok(raw) => match raw.type_info().name() {
                "INTEGER" | "BOOLEAN" => row
                    .try_get_unchecked::<i64, _>(i)
                    .map_or(Value::Null, Value::from),
                "REAL" => row
                    .try_get_unchecked::<f64, _>(i)
                    .map_or(Value::Null, float_value),
                "BLOB" => row
                    .try_get_unchecked::<Vec<u8>, _>(i)
                    .map_or(Value::Null, |b| Value::String(String::from_utf8_lossy(&b).into_owned())),
                _ => row
                    .try_get_unchecked::<String, _>(i)
                    .map_or(Value::Null, Value::String),
            },
            Err(_) => Value::Null,
        };

        map.insert(name, value);
    }

    map
}

/// Convert a PostgreSQL row
fn pg_row_to_map(row: &PgRow) -> Row {
    let mut map = Row::new();

    for (i, column) in row.columns().iter().enumerate() {
        let name = column.name().to_string();
        let type_name = column.type_info().name();

        let value = match type_name {
            "INT2" => row.try_get::<Option<i16>, _>(i).ok().flatten().map(Value::from),
            "INT4" => row.try_get::<Option<i32>, _>(i).ok().flatten().map(Value::from),
            "INT8" => row.try_get::<Option<i64>, _>(i).ok().flatten().map(Value::from),
            "FLOAT4" => row
                .try_get::<Option<f32>, _>(i)
                .ok()
                .flatten()
                .map(|v| float_value(f64::from(v))),
            "FLOAT8" => row.try_get::<Option<f64>, _>(i).ok().flatten().map(float_value),
            "BOOL" => row.try_get::<Option<bool>, _>(i).ok().flatten().map(Value::Bool),
            "BYTEA" => row
                .try_get::<Option<Vec<u8>>, _>(i)
                .ok()
                .flatten()
                .map(|b| Value::String(String::from_utf8_lossy(&b).into_owned())),
            _ => row
                .try_get_unchecked::<Option<String>, _>(i)
                .ok()
                .flatten()
                .map(Value::String),
        };

        map.insert(name, value.unwrap_or(Value::Null));
    }

    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn memory() -> Database {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        db.execute_raw(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT UNIQUE, score REAL)",
            &QueryParams::new(),
        )
        .await
        .unwrap();
        db
    }

    #[test]
    fn test_compile_named_sqlite() {
        let p = params(json!({ "id": 1, "name": "a", "gone": null }));
        let (sql, binds) = compile_named(
            "SELECT ':id', x::text FROM t WHERE id = :id OR parent = :id AND name = :name AND d = :gone",
            &p,
            Backend::Sqlite,
        )
        .unwrap();
        assert_eq!(
            sql,
            "SELECT ':id', x::text FROM t WHERE id = ? OR parent = ? AND name = ? AND d IS NULL"
        );
        assert_eq!(binds.len(), 3);
    }

    #[test]
    fn test_compile_named_null_outside_conditions() {
        let p = params(json!({ "id": 1, "gone": null }));
        let (sql, _) = compile_named(
            "UPDATE t SET d = :gone WHERE id = :id AND d <> :gone AND e >= :gone",
            &p,
            Backend::Sqlite,
        )
        .unwrap();
        assert_eq!(
            sql,
            "UPDATE t SET d = NULL WHERE id = ? AND d IS NOT NULL AND e >= NULL"
        );

        let (sql, _) =
            compile_named("INSERT INTO t (d) VALUES (:gone)", &p, Backend::Postgres).unwrap();
        assert_eq!(sql, "INSERT INTO t (d) VALUES (NULL)");
    }

    #[test]
    fn test_compile_named_postgres_reuses_index() {
        let p = params(json!({ "id": 1, "name": "a" }));
        let (sql, binds) =
            compile_named("WHERE id = :id OR parent = :id AND name = :name", &p, Backend::Postgres)
                .unwrap();
        assert_eq!(sql, "WHERE id = $1 OR parent = $1 AND name = $2");
        assert_eq!(binds.len(), 2);
    }

    #[test]
    fn test_compile_named_unknown_parameter() {
        assert!(matches!(
            compile_named("WHERE id = :id", &QueryParams::new(), Backend::Sqlite),
            Err(Error::QueryArgument { .. })
        ));
    }

    #[tokio::test]
    async fn test_unsupported_url() {
        assert!(matches!(
            Database::connect("mysql://localhost/db").await,
            Err(Error::Config { .. })
        ));
    }

    #[tokio::test]
    async fn test_query_envelope() {
        let db = memory().await;
        let inserted = db
            .query(
                "INSERT INTO users (name, score) VALUES (:name, :score)",
                &params(json!({ "name": "Ana", "score": 9.5 })),
            )
            .await
            .unwrap();
        assert_eq!(inserted.rows_affected, 1);
        assert_eq!(inserted.last_insert_id, Some(1));
        assert_eq!(db.last_insert_id(), Some(1));

        let selected = db
            .query("SELECT * FROM users WHERE name = :name", &params(json!({ "name": "Ana" })))
            .await
            .unwrap();
        assert_eq!(selected.rows.len(), 1);
        assert_eq!(selected.rows[0]["score"], json!(9.5));
        assert_eq!(selected.params["name"], json!("Ana"));
        assert!(selected.query_id > inserted.query_id);
    }

    #[tokio::test]
    async fn test_error_flag_recorded_and_cleared() {
        let db = memory().await;
        db.insert("users", &params(json!({ "name": "Ana" }))).await.unwrap();

        let err = db.insert("users", &params(json!({ "name": "Ana" }))).await.unwrap_err();
        assert!(matches!(err, Error::Database { .. }));
        assert!(db.has_error());
        assert!(db.last_error().unwrap().contains("UNIQUE"));

        db.count_rows("users", &QueryParams::new()).await.unwrap();
        assert!(!db.has_error());
    }

    #[tokio::test]
    async fn test_nested_begin_commit_issues_one_commit() {
        let db = memory().await;
        let tx = db.begin_transaction().await.unwrap();
        assert_eq!(tx.depth(), 1);
        assert_eq!(tx.begin_transaction().await.unwrap(), TxOutcome::Nested { depth: 2 });
        tx.insert("users", &params(json!({ "name": "Ana" }))).await.unwrap();

        // inner commit only moves the counter, so the outer rollback undoes it
        assert_eq!(tx.commit_transaction().await.unwrap(), TxOutcome::Nested { depth: 1 });
        assert_eq!(tx.rollback_transaction().await.unwrap(), TxOutcome::RolledBack);
        drop(tx);
        assert_eq!(db.count_rows("users", &QueryParams::new()).await.unwrap(), 0);

        let tx = db.begin_transaction().await.unwrap();
        tx.begin_transaction().await.unwrap();
        tx.insert("users", &params(json!({ "name": "Bea" }))).await.unwrap();
        assert_eq!(tx.commit_transaction().await.unwrap(), TxOutcome::Nested { depth: 1 });
        assert_eq!(tx.commit_transaction().await.unwrap(), TxOutcome::Committed);
        assert_eq!(tx.depth(), 0);
        drop(tx);
        assert_eq!(db.transaction_depth(), 0);
        assert_eq!(db.count_rows("users", &QueryParams::new()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_finished_transaction_rejects_work() {
        let db = memory().await;
        let tx = db.begin_transaction().await.unwrap();
        tx.commit_transaction().await.unwrap();
        assert!(matches!(
            tx.commit_transaction().await,
            Err(Error::TransactionState { .. })
        ));
        assert!(matches!(
            tx.rollback_transaction().await,
            Err(Error::TransactionState { .. })
        ));
        assert!(matches!(
            tx.count_rows("users", &QueryParams::new()).await,
            Err(Error::TransactionState { .. })
        ));
        assert!(matches!(tx.commit().await, Err(Error::TransactionState { .. })));
    }

    #[tokio::test]
    async fn test_other_handles_wait_for_the_transaction() {
        let db = Arc::new(memory().await);
        let tx = db.begin_transaction().await.unwrap();
        tx.insert("users", &params(json!({ "name": "Ana" }))).await.unwrap();

        let other = Arc::clone(&db);
        let writer = tokio::spawn(async move {
            other.insert("users", &params(json!({ "name": "Bob" }))).await
        });
        tokio::task::yield_now().await;
        assert!(!writer.is_finished());

        tx.rollback().await.unwrap();
        assert_eq!(writer.await.unwrap().unwrap(), 1);

        let names = db.select_column("users", "name", &QueryParams::new()).await.unwrap();
        assert_eq!(names, vec![json!("Bob")]);
    }

    #[tokio::test]
    async fn test_dropped_transaction_rolls_back() {
        let db = memory().await;
        {
            let tx = db.begin_transaction().await.unwrap();
            tx.insert("users", &params(json!({ "name": "Ana" }))).await.unwrap();
        }
        assert_eq!(db.count_rows("users", &QueryParams::new()).await.unwrap(), 0);

        // the connection is usable for a fresh transaction afterwards
        let tx = db.begin_transaction().await.unwrap();
        tx.insert("users", &params(json!({ "name": "Bea" }))).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(db.count_rows("users", &QueryParams::new()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_nested_savepoints_mode() {
        let db = memory().await.with_nested_savepoints(true);
        let tx = db.begin_transaction().await.unwrap();
        tx.insert("users", &params(json!({ "name": "Ana" }))).await.unwrap();
        tx.begin_transaction().await.unwrap();
        tx.insert("users", &params(json!({ "name": "Bea" }))).await.unwrap();
        assert_eq!(tx.rollback_transaction().await.unwrap(), TxOutcome::Nested { depth: 1 });
        assert_eq!(tx.commit_transaction().await.unwrap(), TxOutcome::Committed);
        drop(tx);

        let names = db.select_column("users", "name", &QueryParams::new()).await.unwrap();
        assert_eq!(names, vec![json!("Ana")]);
    }

    #[tokio::test]
    async fn test_explicit_savepoints() {
        let db = memory().await;
        assert!(matches!(
            db.create_savepoint("outside").await,
            Err(Error::TransactionState { .. })
        ));

        let tx = db.begin_transaction().await.unwrap();
        tx.insert("users", &params(json!({ "name": "Ana" }))).await.unwrap();
        tx.create_savepoint("before_bea").await.unwrap();
        tx.insert("users", &params(json!({ "name": "Bea" }))).await.unwrap();
        tx.rollback_to_savepoint("before_bea").await.unwrap();
        tx.release_savepoint("before_bea").await.unwrap();
        assert!(tx.create_savepoint("bad name").await.is_err());
        tx.commit().await.unwrap();
        assert_eq!(db.count_rows("users", &QueryParams::new()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_transaction_closure_rolls_back_on_error() {
        let db = memory().await;
        let result: Result<()> = db
            .transaction(|tx| {
                Box::pin(async move {
                    tx.insert("users", &params(json!({ "name": "Ana" }))).await?;
                    tx.insert("users", &params(json!({ "name": "Ana" }))).await?;
                    Ok(())
                })
            })
            .await;
        assert!(result.is_err());
        assert!(!db.record_exists("users", &QueryParams::new()).await.unwrap());

        let batch = db
            .execute_batch(&[
                "INSERT INTO users (name) VALUES ('Ana')",
                "INSERT INTO users (name) VALUES ('Bea')",
            ])
            .await;
        assert!(batch.is_ok());
        assert_eq!(db.count_rows("users", &QueryParams::new()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_nested_closure_level() {
        let db = memory().await;
        let tx = db.begin_transaction().await.unwrap();
        tx.insert("users", &params(json!({ "name": "Ana" }))).await.unwrap();
        let inner: Result<u64> = tx
            .transaction(|tx| {
                Box::pin(async move {
                    assert_eq!(tx.depth(), 2);
                    tx.insert("users", &params(json!({ "name": "Bea" }))).await
                })
            })
            .await;
        assert_eq!(inner.unwrap(), 1);
        assert_eq!(tx.depth(), 1);
        tx.commit().await.unwrap();
        assert_eq!(db.count_rows("users", &QueryParams::new()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_crud_helpers() {
        let db = memory().await;
        for name in ["Ana", "Bea", "Caio"] {
            db.insert("users", &params(json!({ "name": name, "score": 1.0 })))
                .await
                .unwrap();
        }

        let updated = db
            .update(
                "users",
                &params(json!({ "name": "Beatriz" })),
                &params(json!({ "name": "Bea" })),
            )
            .await
            .unwrap();
        assert_eq!(updated, 1);

        let row = db
            .select_one("users", "id, name", &params(json!({ "id": 2 })), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row["name"], json!("Beatriz"));

        let page = db
            .select_with_pagination("users", "name", &QueryParams::new(), Some("name DESC"), 1, 1)
            .await
            .unwrap();
        assert_eq!(page[0]["name"], json!("Beatriz"));

        let distinct = db
            .select_distinct("users", "score", &QueryParams::new(), None)
            .await
            .unwrap();
        assert_eq!(distinct.len(), 1);

        assert_eq!(db.delete("users", &params(json!({ "name": "Caio" }))).await.unwrap(), 1);
        assert!(db.record_exists("users", &params(json!({ "name": "Ana" }))).await.unwrap());
        assert!(db
            .select("users", "*", &QueryParams::new(), Some("name; DROP"), None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_fillable() {
        let db = memory().await;
        db.set_fillable(&["name"]);
        assert!(matches!(
            db.insert("users", &params(json!({ "name": "Ana", "score": 2 }))).await,
            Err(Error::QueryArgument { .. })
        ));
        assert_eq!(db.insert("users", &params(json!({ "name": "Ana" }))).await.unwrap(), 1);

        let rejected = db
            .update("users", &params(json!({ "score": 5 })), &params(json!({ "name": "Ana" })))
            .await;
        assert!(matches!(rejected, Err(Error::QueryArgument { .. })));
        let row = db
            .select_one("users", "score", &params(json!({ "name": "Ana" })), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row["score"], Value::Null);
    }

    #[tokio::test]
    async fn test_schema_introspection() {
        let db = memory().await;
        db.execute_raw("CREATE TABLE posts (id INTEGER PRIMARY KEY)", &QueryParams::new())
            .await
            .unwrap();

        assert_eq!(db.table_names().await.unwrap(), vec!["posts", "users"]);
        assert_eq!(
            db.column_names("users").await.unwrap(),
            vec!["id", "name", "score"]
        );
        let missing = db.table_exists(&["users", "comments", "tags"]).await.unwrap();
        assert_eq!(missing, vec!["comments", "tags"]);
        assert_eq!(db.missing_tables(), missing);
    }
}
