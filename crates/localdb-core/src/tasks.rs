//! Background install/uninstall tasks with single-flight admission per
//! engine type.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use localdb_store::{DatabaseInstance, EngineType, InstanceStatus};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinError;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    controller::ProcessController,
    events::{EventHub, Notification},
    provision::{InstallOptions, ProgressSink, ProvisionRequest, Provisioner},
    registry::InstanceRegistry,
    CoreError,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Install,
    Uninstall,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Install => "install",
            TaskType::Uninstall => "uninstall",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_active(self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    pub(crate) fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Running) | (Pending, Failed) | (Running, Completed) | (Running, Failed)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Snapshot of a background operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AsyncTask {
    pub id: Uuid,
    pub task_type: TaskType,
    pub engine_type: EngineType,
    /// Instance produced by an install, or targeted by an uninstall.
    pub instance_id: Option<Uuid>,
    pub status: TaskStatus,
    pub progress: u8,
    pub message: String,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AsyncTask {
    fn new(task_type: TaskType, engine_type: EngineType, instance_id: Option<Uuid>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            task_type,
            engine_type,
            instance_id,
            status: TaskStatus::Pending,
            progress: 0,
            message: "queued".into(),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Owns every task record. The map lock is only held for in-memory updates.
pub struct TaskEngine {
    tasks: Mutex<HashMap<Uuid, AsyncTask>>,
    registry: Arc<InstanceRegistry>,
    controller: Arc<ProcessController>,
    provisioner: Arc<dyn Provisioner>,
    events: EventHub,
    retention: Duration,
}

impl TaskEngine {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        controller: Arc<ProcessController>,
        provisioner: Arc<dyn Provisioner>,
        events: EventHub,
        retention: Duration,
    ) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            registry,
            controller,
            provisioner,
            events,
            retention,
        }
    }

    pub fn get(&self, id: Uuid) -> Result<AsyncTask, CoreError> {
        self.tasks
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("task {id}")))
    }

    /// Every retained task, newest first.
    pub fn list(&self) -> Vec<AsyncTask> {
        let mut tasks: Vec<_> = self.tasks.lock().values().cloned().collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks
    }

    /// Accepts an install and schedules it. Returns the task id without
    /// waiting for the work.
    #[instrument(skip(self, options))]
    pub fn submit_install(
        self: &Arc<Self>,
        engine: EngineType,
        version: Option<String>,
        options: InstallOptions,
    ) -> Result<Uuid, CoreError> {
        let task = {
            let mut tasks = self.tasks.lock();
            Self::ensure_no_active_task(&tasks, engine)?;
            if let Some(existing) = self.registry.get_by_type(engine) {
                return Err(CoreError::Conflict(format!(
                    "{engine} is already installed as instance {}",
                    existing.id
                )));
            }
            let task = AsyncTask::new(TaskType::Install, engine, None);
            tasks.insert(task.id, task.clone());
            task
        };
        info!(task_id = %task.id, engine = %engine, "install task accepted");
        self.publish(task.clone());

        let request = ProvisionRequest::new(engine, version, options);
        let task_id = task.id;
        let worker = Arc::clone(self);
        tokio::spawn(async move {
            let runner = Arc::clone(&worker);
            let attempt = request.clone();
            let outcome =
                tokio::spawn(async move { runner.run_install(task_id, attempt).await }).await;
            if let Err(err) = outcome {
                if worker.is_active(task_id) {
                    worker.cleanup(&request).await;
                }
                worker.abort(task_id, TaskType::Install, err);
            }
            worker.schedule_eviction(task_id);
        });
        Ok(task.id)
    }

    /// Accepts an uninstall of an existing instance and schedules it.
    #[instrument(skip(self))]
    pub fn submit_uninstall(
        self: &Arc<Self>,
        instance_id: Uuid,
        purge_data: bool,
    ) -> Result<Uuid, CoreError> {
        let instance = self.registry.get(instance_id)?;
        let task = {
            let mut tasks = self.tasks.lock();
            Self::ensure_no_active_task(&tasks, instance.engine_type)?;
            let task = AsyncTask::new(TaskType::Uninstall, instance.engine_type, Some(instance_id));
            tasks.insert(task.id, task.clone());
            task
        };
        info!(task_id = %task.id, instance_id = %instance_id, "uninstall task accepted");
        self.publish(task.clone());

        let task_id = task.id;
        let worker = Arc::clone(self);
        tokio::spawn(async move {
            let runner = Arc::clone(&worker);
            let outcome = tokio::spawn(async move {
                runner.run_uninstall(task_id, instance_id, purge_data).await
            })
            .await;
            if let Err(err) = outcome {
                worker.abort(task_id, TaskType::Uninstall, err);
            }
            worker.schedule_eviction(task_id);
        });
        Ok(task.id)
    }

    fn ensure_no_active_task(
        tasks: &HashMap<Uuid, AsyncTask>,
        engine: EngineType,
    ) -> Result<(), CoreError> {
        match tasks
            .values()
            .find(|task| task.engine_type == engine && task.status.is_active())
        {
            Some(active) => Err(CoreError::Conflict(format!(
                "task {} is already {} for {engine}",
                active.id, active.status
            ))),
            None => Ok(()),
        }
    }

    async fn run_install(self: &Arc<Self>, task_id: Uuid, request: ProvisionRequest) {
        let engine = request.engine;
        if let Some(existing) = self.registry.get_by_type(engine) {
            self.fail(
                task_id,
                format!("{engine} is already installed as instance {}", existing.id),
            );
            return;
        }
        if self
            .advance(task_id, TaskStatus::Running, |task| {
                task.message = format!("installing {}", engine.display_name());
            })
            .is_err()
        {
            return;
        }

        let sink = TaskProgress {
            engine: self.as_ref(),
            task_id,
        };
        let provisioned = match self.provisioner.provision(&request, &sink).await {
            Ok(provisioned) => provisioned,
            Err(err) => {
                warn!(task_id = %task_id, engine = %engine, error = %format!("{err:#}"), "provisioning failed");
                self.cleanup(&request).await;
                self.fail(
                    task_id,
                    CoreError::Provisioning(format!("{err:#}")).to_string(),
                );
                return;
            }
        };

        let now = Utc::now();
        let record = DatabaseInstance {
            id: Uuid::new_v4(),
            engine_type: engine,
            name: engine.display_name().to_string(),
            version: provisioned.version,
            install_path: provisioned.install_path,
            data_path: provisioned.data_path,
            log_path: provisioned.log_path,
            config_path: provisioned.config_path,
            port: provisioned.port,
            username: provisioned.username,
            password: provisioned.password,
            status: InstanceStatus::Stopped,
            pid: None,
            auto_start: request.options.auto_start,
            created_at: now,
            updated_at: now,
        };

        match self.registry.upsert(record).await {
            Ok(record) => {
                self.provisioner.commit(&request);
                let _ = self.advance(task_id, TaskStatus::Completed, |task| {
                    task.progress = 100;
                    task.instance_id = Some(record.id);
                    task.message = format!("{} installed", engine.display_name());
                });
                info!(task_id = %task_id, instance_id = %record.id, engine = %engine, "install completed");
                self.registry.notify();
            }
            Err(err) => {
                warn!(task_id = %task_id, engine = %engine, error = %err, "install could not be recorded");
                self.cleanup(&request).await;
                self.fail(task_id, err.to_string());
            }
        }
    }

    async fn run_uninstall(self: &Arc<Self>, task_id: Uuid, instance_id: Uuid, purge_data: bool) {
        let instance = match self.registry.get(instance_id) {
            Ok(instance) => instance,
            Err(err) => {
                self.fail(task_id, err.to_string());
                return;
            }
        };
        if self
            .advance(task_id, TaskStatus::Running, |task| {
                task.message = format!("uninstalling {}", instance.engine_type.display_name());
            })
            .is_err()
        {
            return;
        }

        // Held until the record is gone so no start can slip in between.
        let _claim = match self.registry.claim(instance_id) {
            Ok(claim) => claim,
            Err(err) => {
                self.fail(task_id, err.to_string());
                return;
            }
        };
        let instance = match self.registry.get(instance_id) {
            Ok(instance) => instance,
            Err(err) => {
                self.fail(task_id, err.to_string());
                return;
            }
        };

        if instance.is_running() {
            self.report(task_id, 10, "stopping instance");
            match self.controller.stop_claimed(instance_id).await {
                Ok(_) | Err(CoreError::NotRunning(_)) => {}
                Err(err) => {
                    self.fail(task_id, err.to_string());
                    return;
                }
            }
        }

        self.report(task_id, 50, "removing files");
        if let Err(err) = self.provisioner.remove(&instance, purge_data).await {
            self.fail(
                task_id,
                CoreError::Provisioning(format!("{err:#}")).to_string(),
            );
            return;
        }

        self.report(task_id, 90, "removing record");
        match self.registry.remove(instance_id).await {
            Ok(_) => {
                let _ = self.advance(task_id, TaskStatus::Completed, |task| {
                    task.progress = 100;
                    task.message = format!("{} uninstalled", instance.engine_type.display_name());
                });
                info!(task_id = %task_id, instance_id = %instance_id, "uninstall completed");
                self.registry.notify();
            }
            Err(err) => self.fail(task_id, err.to_string()),
        }
    }

    fn is_active(&self, task_id: Uuid) -> bool {
        self.tasks
            .lock()
            .get(&task_id)
            .is_some_and(|task| task.status.is_active())
    }

    /// Fails a task whose worker panicked or was cancelled before reaching a
    /// terminal state.
    fn abort(&self, task_id: Uuid, task_type: TaskType, err: JoinError) {
        if !self.is_active(task_id) {
            return;
        }
        error!(task_id = %task_id, task_type = task_type.as_str(), error = %err, "task worker aborted");
        let message = match task_type {
            TaskType::Install => CoreError::Provisioning(format!("install worker aborted: {err}")),
            TaskType::Uninstall => CoreError::Process(format!("uninstall worker aborted: {err}")),
        };
        self.fail(task_id, message.to_string());
    }

    async fn cleanup(&self, request: &ProvisionRequest) {
        if let Err(err) = self.provisioner.cleanup(request).await {
            warn!(engine = %request.engine, error = %format!("{err:#}"), "cleanup after failed install was incomplete");
        }
    }

    /// Moves the task along its state machine and publishes the snapshot.
    fn advance(
        &self,
        task_id: Uuid,
        next: TaskStatus,
        update: impl FnOnce(&mut AsyncTask),
    ) -> Result<AsyncTask, CoreError> {
        let snapshot = {
            let mut tasks = self.tasks.lock();
            let task = tasks
                .get_mut(&task_id)
                .ok_or_else(|| CoreError::NotFound(format!("task {task_id}")))?;
            if !task.status.can_transition_to(next) {
                let err = CoreError::InvariantViolation(format!(
                    "task {task_id} cannot move from {} to {next}",
                    task.status
                ));
                error!(task_id = %task_id, error = %err, "rejected task transition");
                return Err(err);
            }
            task.status = next;
            update(task);
            task.updated_at = Utc::now();
            task.clone()
        };
        self.publish(snapshot.clone());
        Ok(snapshot)
    }

    fn fail(&self, task_id: Uuid, message: String) {
        let _ = self.advance(task_id, TaskStatus::Failed, |task| {
            task.message = "failed".into();
            task.error = Some(message);
        });
    }

    /// Applies a progress update to a running task. Progress never goes
    /// backwards and stays below 100 until completion.
    fn report(&self, task_id: Uuid, progress: u8, message: &str) {
        let snapshot = {
            let mut tasks = self.tasks.lock();
            let Some(task) = tasks.get_mut(&task_id) else {
                return;
            };
            if task.status != TaskStatus::Running {
                return;
            }
            task.progress = task.progress.max(progress.min(99));
            task.message = message.to_string();
            task.updated_at = Utc::now();
            task.clone()
        };
        self.publish(snapshot);
    }

    fn publish(&self, task: AsyncTask) {
        self.events.publish(Notification::InstallProgress(task));
    }

    fn schedule_eviction(self: &Arc<Self>, task_id: Uuid) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(engine.retention).await;
            let mut tasks = engine.tasks.lock();
            if tasks
                .get(&task_id)
                .is_some_and(|task| task.status.is_terminal())
            {
                tasks.remove(&task_id);
            }
        });
    }
}

struct TaskProgress<'a> {
    engine: &'a TaskEngine,
    task_id: Uuid,
}

impl ProgressSink for TaskProgress<'_> {
    fn report(&self, progress: u8, message: &str) {
        self.engine.report(self.task_id, progress, message);
    }
}
