//! Persistence layer for the locally managed database engine catalog.
//!
//! This crate owns the record types shared by the lifecycle core and the
//! daemon (engine catalogue, instance status, instance rows) and an async API
//! around SQLite (sqlx) that stores exactly one row per installed engine
//! instance. Rows are reloaded at startup to repopulate the in-memory
//! registry; a row that violates the record invariants is reported as
//! corrupted instead of being skipped.

use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Row, SqlitePool,
};
use thiserror::Error;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Default SQLite busy timeout in milliseconds when the DB is under load.
const SQLITE_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Primary entry point to the persistence layer.
#[derive(Clone, Debug)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes (or creates) a connection pool to the SQLite database located at
    /// the given URL (e.g. `sqlite:///home/me/.local-db/state.db`).
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_millis(SQLITE_BUSY_TIMEOUT_MS));

        // Every connection to `:memory:` opens its own database.
        let in_memory = database_url.contains(":memory:");
        let mut pool_options = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(if in_memory { 1 } else { 4 });
        if in_memory {
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }

        let pool = pool_options.connect_with(options).await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Connects to a file path via `sqlite://` scheme, creating the parent directory.
    pub async fn connect_file(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("creating state directory {}", parent.display()))?;
            }
        }
        let url = format!("sqlite://{}", path.display());
        Self::connect(&url).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Inserts the instance row or overwrites the row with the same id.
    ///
    /// A second row for an engine type that already has one is rejected with
    /// [`StoreError::DuplicateEngine`].
    pub async fn upsert_instance(&self, instance: &DatabaseInstance) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO instances (
                id, engine_type, name, version, install_path, data_path,
                log_path, config_path, port, username, password, status,
                pid, auto_start, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                version = excluded.version,
                port = excluded.port,
                username = excluded.username,
                password = excluded.password,
                status = excluded.status,
                pid = excluded.pid,
                auto_start = excluded.auto_start,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(instance.id.to_string())
        .bind(instance.engine_type.as_str())
        .bind(&instance.name)
        .bind(&instance.version)
        .bind(path_to_text(&instance.install_path))
        .bind(path_to_text(&instance.data_path))
        .bind(path_to_text(&instance.log_path))
        .bind(instance.config_path.as_deref().map(path_to_text))
        .bind(instance.port as i64)
        .bind(&instance.username)
        .bind(&instance.password)
        .bind(instance.status.as_str())
        .bind(instance.pid.map(|pid| pid as i64))
        .bind(instance.auto_start as i32)
        .bind(instance.created_at.to_rfc3339())
        .bind(instance.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                anyhow::Error::new(StoreError::DuplicateEngine(instance.engine_type))
            } else {
                err.into()
            }
        })?;
        Ok(())
    }

    /// Retrieves an instance row by its identifier.
    pub async fn fetch_instance(&self, id: Uuid) -> Result<Option<DatabaseInstance>> {
        let row = sqlx::query("SELECT * FROM instances WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(map_instance).transpose()
    }

    /// Loads every persisted instance ordered by creation time.
    ///
    /// Fails on the first row that cannot be decoded or breaks a record invariant.
    pub async fn load_instances(&self) -> Result<Vec<DatabaseInstance>> {
        let rows = sqlx::query("SELECT * FROM instances ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(map_instance).collect()
    }

    /// Removes an instance row. Returns whether a row existed.
    pub async fn delete_instance(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM instances WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db_err) if db_err.message().contains("UNIQUE"))
}

fn path_to_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn parse_datetime(value: String) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| anyhow!("invalid RFC3339 timestamp '{}': {}", value, err))
}

fn map_instance(row: SqliteRow) -> Result<DatabaseInstance> {
    let id: String = row.try_get("id")?;
    let engine: String = row.try_get("engine_type")?;
    let status: String = row.try_get("status")?;
    let port: i64 = row.try_get("port")?;

    let corrupted = |reason: String| StoreError::Corrupted {
        id: id.clone(),
        reason,
    };

    let instance = DatabaseInstance {
        id: Uuid::parse_str(&id).map_err(|err| corrupted(err.to_string()))?,
        engine_type: EngineType::from_str(&engine)?,
        name: row.try_get("name")?,
        version: row.try_get("version")?,
        install_path: PathBuf::from(row.try_get::<String, _>("install_path")?),
        data_path: PathBuf::from(row.try_get::<String, _>("data_path")?),
        log_path: PathBuf::from(row.try_get::<String, _>("log_path")?),
        config_path: row
            .try_get::<Option<String>, _>("config_path")?
            .map(PathBuf::from),
        port: u16::try_from(port).map_err(|_| corrupted(format!("port {port} out of range")))?,
        username: row.try_get("username")?,
        password: row.try_get("password")?,
        status: InstanceStatus::from_str(&status)?,
        pid: row
            .try_get::<Option<i64>, _>("pid")?
            .map(|pid| u32::try_from(pid).map_err(|_| corrupted(format!("pid {pid} out of range"))))
            .transpose()?,
        auto_start: row.try_get::<i32, _>("auto_start")? != 0,
        created_at: parse_datetime(row.try_get("created_at")?)?,
        updated_at: parse_datetime(row.try_get("updated_at")?)?,
    };

    if instance.status == InstanceStatus::NotInstalled {
        return Err(corrupted("not_installed is never persisted".into()).into());
    }
    if instance.pid.is_some() != (instance.status == InstanceStatus::Running) {
        return Err(corrupted(format!(
            "status {} does not match pid {:?}",
            instance.status, instance.pid
        ))
        .into());
    }

    Ok(instance)
}

/// Errors returned by the persistence layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("an instance of engine '{0}' is already recorded")]
    DuplicateEngine(EngineType),
    #[error("unsupported engine type '{0}'")]
    UnknownEngine(String),
    #[error("unknown instance status '{0}'")]
    UnknownStatus(String),
    #[error("corrupted instance row {id}: {reason}")]
    Corrupted { id: String, reason: String },
}

/// Database products this manager knows how to install and run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum EngineType {
    MySql,
    PostgreSql,
    MongoDb,
    Redis,
    Qdrant,
    Neo4j,
    SeekDb,
    SurrealDb,
}

impl EngineType {
    pub const ALL: [EngineType; 8] = [
        EngineType::MySql,
        EngineType::PostgreSql,
        EngineType::MongoDb,
        EngineType::Redis,
        EngineType::Qdrant,
        EngineType::Neo4j,
        EngineType::SeekDb,
        EngineType::SurrealDb,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EngineType::MySql => "mysql",
            EngineType::PostgreSql => "postgresql",
            EngineType::MongoDb => "mongodb",
            EngineType::Redis => "redis",
            EngineType::Qdrant => "qdrant",
            EngineType::Neo4j => "neo4j",
            EngineType::SeekDb => "seekdb",
            EngineType::SurrealDb => "surrealdb",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            EngineType::MySql => "MySQL",
            EngineType::PostgreSql => "PostgreSQL",
            EngineType::MongoDb => "MongoDB",
            EngineType::Redis => "Redis",
            EngineType::Qdrant => "Qdrant",
            EngineType::Neo4j => "Neo4j",
            EngineType::SeekDb => "SeekDB",
            EngineType::SurrealDb => "SurrealDB",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            EngineType::MySql => 3306,
            EngineType::PostgreSql => 5432,
            EngineType::MongoDb => 27017,
            EngineType::Redis => 6379,
            EngineType::Qdrant => 6333,
            EngineType::Neo4j => 7474,
            EngineType::SeekDb => 8080,
            EngineType::SurrealDb => 8000,
        }
    }

    /// File name of the foreground server executable inside the install directory.
    pub fn server_binary(&self) -> &'static str {
        match self {
            EngineType::MySql => "mysqld",
            EngineType::PostgreSql => "postgres",
            EngineType::MongoDb => "mongod",
            EngineType::Redis => "redis-server",
            EngineType::Qdrant => "qdrant",
            EngineType::Neo4j => "neo4j",
            EngineType::SeekDb => "seekdb",
            EngineType::SurrealDb => "surreal",
        }
    }

    pub fn pid_file_name(&self) -> String {
        format!("{}.pid", self.as_str())
    }

    pub fn config_file_name(&self) -> &'static str {
        match self {
            EngineType::MySql => "my.cnf",
            EngineType::PostgreSql => "postgresql.conf",
            EngineType::MongoDb => "mongod.conf",
            EngineType::Redis => "redis.conf",
            EngineType::Qdrant => "qdrant-config.yaml",
            EngineType::Neo4j => "neo4j.conf",
            EngineType::SeekDb => "seekdb.conf",
            EngineType::SurrealDb => "surrealdb.env",
        }
    }
}

impl fmt::Display for EngineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        EngineType::ALL
            .into_iter()
            .find(|engine| engine.as_str() == normalized)
            .ok_or_else(|| StoreError::UnknownEngine(s.to_string()))
    }
}

/// Lifecycle status of an engine instance.
///
/// `NotInstalled` is synthetic: it describes engine types without a record and
/// never appears in a persisted row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    NotInstalled,
    Stopped,
    Running,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::NotInstalled => "not_installed",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Running => "running",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_installed" => Ok(InstanceStatus::NotInstalled),
            "stopped" => Ok(InstanceStatus::Stopped),
            "running" => Ok(InstanceStatus::Running),
            other => Err(StoreError::UnknownStatus(other.to_string())),
        }
    }
}

/// One installed engine. At most one exists per [`EngineType`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatabaseInstance {
    pub id: Uuid,
    pub engine_type: EngineType,
    pub name: String,
    pub version: String,
    pub install_path: PathBuf,
    pub data_path: PathBuf,
    pub log_path: PathBuf,
    pub config_path: Option<PathBuf>,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub status: InstanceStatus,
    pub pid: Option<u32>,
    pub auto_start: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DatabaseInstance {
    pub fn is_running(&self) -> bool {
        self.status == InstanceStatus::Running
    }

    pub fn binary_path(&self) -> PathBuf {
        self.install_path.join(self.engine_type.server_binary())
    }

    pub fn pid_file(&self) -> PathBuf {
        self.data_path.join(self.engine_type.pid_file_name())
    }
}

/// Helper trait for background jobs that need a graceful shutdown.
#[async_trait]
pub trait BackgroundWorker: Send + Sync {
    async fn run(self: Arc<Self>) -> Result<()>;
}

/// A guard that owns the join handle of a running worker.
pub struct WorkerGuard {
    handle: JoinHandle<Result<()>>,
}

impl WorkerGuard {
    pub fn new(handle: JoinHandle<Result<()>>) -> Self {
        Self { handle }
    }

    pub async fn join(self) -> Result<()> {
        self.handle.await??;
        Ok(())
    }
}

/// Owns the join handles of long-running workers (status sync loop, HTTP
/// server) so the daemon can surface their errors on shutdown.
#[derive(Default)]
pub struct WorkerRegistry {
    workers: RwLock<Vec<WorkerGuard>>,
}

impl WorkerRegistry {
    pub fn register(&self, handle: JoinHandle<Result<()>>) {
        self.workers.write().push(WorkerGuard::new(handle));
    }

    pub fn spawn<W>(&self, worker: Arc<W>)
    where
        W: BackgroundWorker + 'static,
    {
        self.register(tokio::spawn(worker.run()));
    }

    pub async fn wait_all(self) -> Result<()> {
        for guard in self.workers.into_inner() {
            guard.join().await?;
        }
        Ok(())
    }
}
