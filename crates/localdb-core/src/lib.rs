//! Lifecycle core for locally installed database engines.
//!
//! The [`DbManager`] facade owns the instance registry, the background task
//! engine, the process controller and the status synchronizer. Callers issue
//! request/response commands against it and may subscribe to the push channel
//! for install progress and instance snapshots; the pollable snapshots and the
//! pushed notifications are backed by the same state.

mod controller;
mod events;
mod probe;
mod provision;
mod registry;
mod sync;
mod tasks;

use std::{
    path::PathBuf,
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use localdb_store::{Database, DatabaseInstance, EngineType, InstanceStatus, StoreError};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, instrument};
use uuid::Uuid;

pub use controller::{launch_args, ControllerSettings, ProcessController};
pub use events::{EventHub, Notification, Subscription, INSTALL_PROGRESS, INSTANCES_UPDATED};
#[cfg(unix)]
pub use probe::SignalProbe;
#[cfg(windows)]
pub use probe::TasklistProbe;
pub use probe::{platform_probe, read_pid_file, ProcessProbe};
pub use provision::{
    render_config, EngineLayout, InstallOptions, LocalProvisioner, ProgressSink,
    ProvisionRequest, ProvisionedEngine, Provisioner, DEFAULT_VERSION,
};
pub use registry::{InstanceRegistry, InstanceStore, MemoryStore, OperationGuard};
pub use sync::{AutoStartFailure, ReconcileReport, StartupReport, StatusSynchronizer};
pub use tasks::{AsyncTask, TaskEngine, TaskStatus, TaskType};

/// Tunables shared by the core components.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Root holding `bin/`, `config/`, `data/` and `logs/` per engine.
    pub storage_root: PathBuf,
    /// Directory searched for server binaries before `PATH`.
    pub binary_source: Option<PathBuf>,
    pub sync_interval: Duration,
    pub stop_timeout: Duration,
    pub kill_timeout: Duration,
    pub poll_interval: Duration,
    /// A spawned engine that exits within this window failed to start.
    pub startup_grace: Duration,
    /// How long terminal tasks stay pollable.
    pub task_retention: Duration,
    pub event_capacity: usize,
}

impl CoreConfig {
    pub fn with_storage_root(root: impl Into<PathBuf>) -> Self {
        Self {
            storage_root: root.into(),
            ..Self::default()
        }
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("./.local-db"),
            binary_source: None,
            sync_interval: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(10),
            kill_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
            startup_grace: Duration::from_millis(500),
            task_retention: Duration::from_secs(60),
            event_capacity: 256,
        }
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("instance {0} is not running")]
    NotRunning(Uuid),
    #[error("process error: {0}")]
    Process(String),
    #[error("provisioning failed: {0}")]
    Provisioning(String),
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    #[error(transparent)]
    Storage(anyhow::Error),
    #[error("failed to manipulate {0}: {1}")]
    Io(PathBuf, std::io::Error),
}

impl From<StoreError> for CoreError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::DuplicateEngine(engine) => {
                CoreError::Conflict(format!("{engine} is already installed"))
            }
            StoreError::UnknownEngine(name) => {
                CoreError::NotFound(format!("unsupported engine type '{name}'"))
            }
            other => CoreError::Storage(other.into()),
        }
    }
}

impl From<anyhow::Error> for CoreError {
    fn from(value: anyhow::Error) -> Self {
        match value.downcast::<StoreError>() {
            Ok(store_err) => store_err.into(),
            Err(other) => CoreError::Storage(other),
        }
    }
}

/// Parses a wire engine name; unknown names are `NotFound`.
pub fn parse_engine(name: &str) -> Result<EngineType, CoreError> {
    EngineType::from_str(name).map_err(CoreError::from)
}

/// Status of one supported engine type, installed or not.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineOverview {
    pub engine_type: EngineType,
    pub display_name: &'static str,
    pub default_port: u16,
    pub status: InstanceStatus,
    pub instance: Option<DatabaseInstance>,
}

/// Command surface over the registry, tasks, controller and synchronizer.
#[derive(Clone)]
pub struct DbManager {
    registry: Arc<InstanceRegistry>,
    tasks: Arc<TaskEngine>,
    controller: Arc<ProcessController>,
    synchronizer: Arc<StatusSynchronizer>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl DbManager {
    /// Loads the registry from `store` and wires the components together.
    /// Corrupted persisted state fails here.
    pub async fn open(
        config: CoreConfig,
        store: Arc<dyn InstanceStore>,
        provisioner: Arc<dyn Provisioner>,
        probe: Arc<dyn ProcessProbe>,
    ) -> Result<Self, CoreError> {
        let events = EventHub::new(config.event_capacity);
        let registry = Arc::new(InstanceRegistry::load(store, events.clone()).await?);
        let controller = Arc::new(ProcessController::new(
            registry.clone(),
            probe.clone(),
            ControllerSettings::from(&config),
        ));
        let tasks = Arc::new(TaskEngine::new(
            registry.clone(),
            controller.clone(),
            provisioner,
            events,
            config.task_retention,
        ));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let synchronizer = Arc::new(StatusSynchronizer::new(
            registry.clone(),
            controller.clone(),
            probe,
            config.sync_interval,
            shutdown_rx,
        ));

        info!(
            storage_root = %config.storage_root.display(),
            instances = registry.list().len(),
            "database manager ready"
        );
        Ok(Self {
            registry,
            tasks,
            controller,
            synchronizer,
            shutdown: Arc::new(shutdown),
        })
    }

    /// Manager backed by the SQLite catalog, the local provisioner and the
    /// platform process probe.
    pub async fn with_database(config: CoreConfig, db: Database) -> Result<Self, CoreError> {
        let provisioner = Arc::new(LocalProvisioner::new(
            config.storage_root.clone(),
            config.binary_source.clone(),
        ));
        Self::open(config, Arc::new(db), provisioner, platform_probe()).await
    }

    pub fn list_instances(&self) -> Vec<DatabaseInstance> {
        self.registry.list()
    }

    pub fn get_instance(&self, id: Uuid) -> Result<DatabaseInstance, CoreError> {
        self.registry.get(id)
    }

    pub fn get_instance_by_type(&self, engine: EngineType) -> Result<DatabaseInstance, CoreError> {
        self.registry
            .get_by_type(engine)
            .ok_or_else(|| CoreError::NotFound(format!("{engine} instance")))
    }

    /// Every supported engine type with its instance, or `NotInstalled`.
    pub fn engines(&self) -> Vec<EngineOverview> {
        EngineType::ALL
            .into_iter()
            .map(|engine| {
                let instance = self.registry.get_by_type(engine);
                EngineOverview {
                    engine_type: engine,
                    display_name: engine.display_name(),
                    default_port: engine.default_port(),
                    status: instance
                        .as_ref()
                        .map(|i| i.status)
                        .unwrap_or(InstanceStatus::NotInstalled),
                    instance,
                }
            })
            .collect()
    }

    pub async fn start_instance(&self, id: Uuid) -> Result<DatabaseInstance, CoreError> {
        self.controller.start(id).await
    }

    pub async fn stop_instance(&self, id: Uuid) -> Result<DatabaseInstance, CoreError> {
        self.controller.stop(id).await
    }

    pub async fn restart_instance(&self, id: Uuid) -> Result<DatabaseInstance, CoreError> {
        self.controller.restart(id).await
    }

    /// Stops the instance if needed and destroys its record, optionally with
    /// its data directory. A failed stop keeps the record.
    #[instrument(skip(self))]
    pub async fn delete_instance(&self, id: Uuid, purge_data: bool) -> Result<(), CoreError> {
        let _claim = self.registry.claim(id)?;
        let instance = self.registry.get(id)?;
        if instance.is_running() {
            match self.controller.stop_claimed(id).await {
                Ok(_) | Err(CoreError::NotRunning(_)) => {}
                Err(err) => return Err(err),
            }
        }

        if purge_data {
            provision::remove_dir_if_present(&instance.data_path)
                .await
                .map_err(|err| CoreError::Io(instance.data_path.clone(), err))?;
        }
        self.registry.remove(id).await?;
        info!(instance_id = %id, engine = %instance.engine_type, purge_data, "instance deleted");
        self.registry.notify();
        Ok(())
    }

    pub fn install(
        &self,
        engine: EngineType,
        version: Option<String>,
        options: InstallOptions,
    ) -> Result<Uuid, CoreError> {
        self.tasks.submit_install(engine, version, options)
    }

    pub fn uninstall(&self, id: Uuid, purge_data: bool) -> Result<Uuid, CoreError> {
        self.tasks.submit_uninstall(id, purge_data)
    }

    pub fn get_task(&self, id: Uuid) -> Result<AsyncTask, CoreError> {
        self.tasks.get(id)
    }

    pub fn list_tasks(&self) -> Vec<AsyncTask> {
        self.tasks.list()
    }

    #[instrument(skip(self))]
    pub async fn set_auto_start(
        &self,
        id: Uuid,
        enabled: bool,
    ) -> Result<DatabaseInstance, CoreError> {
        let updated = self.registry.set_auto_start(id, enabled).await?;
        self.registry.notify();
        Ok(updated)
    }

    /// Runs a reconciliation pass now and returns the refreshed snapshot.
    pub async fn sync_status(&self) -> Result<Vec<DatabaseInstance>, CoreError> {
        self.synchronizer.reconcile().await?;
        Ok(self.registry.list())
    }

    /// Startup pass: reconcile leftovers, then auto-start flagged instances.
    pub async fn startup(&self) -> Result<StartupReport, CoreError> {
        self.synchronizer.startup().await
    }

    /// The periodic reconciliation worker; spawn it on a `WorkerRegistry`.
    pub fn synchronizer(&self) -> Arc<StatusSynchronizer> {
        self.synchronizer.clone()
    }

    pub fn subscribe(&self) -> Subscription {
        self.registry.events().subscribe()
    }

    /// Signals background workers to stop. Engine processes keep running.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Watch flipped to `true` by [`DbManager::shutdown`].
    pub fn shutdown_listener(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}
