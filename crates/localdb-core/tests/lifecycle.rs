#![cfg(unix)]

use std::{
    net::TcpListener,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{bail, Result};
use async_trait::async_trait;
use localdb_core::{
    platform_probe, AsyncTask, CoreConfig, CoreError, DbManager, EngineLayout, InstallOptions,
    InstanceStore, MemoryStore, Notification, ProcessProbe, ProgressSink, ProvisionRequest,
    ProvisionedEngine, Provisioner, SignalProbe, TaskStatus, TaskType,
};
use localdb_store::{DatabaseInstance, EngineType, InstanceStatus};
use tempfile::TempDir;
use tokio::{
    sync::Notify,
    time::{sleep, timeout},
};
use uuid::Uuid;

const SLEEPER: &str = "#!/bin/sh\nexec sleep 60\n";
const STUBBORN: &str = "#!/bin/sh\ntrap '' TERM\nsleep 60\n";
const CRASHER: &str = "#!/bin/sh\necho boom >&2\nexit 3\n";
const FORKER: &str = "#!/bin/sh\nsleep 60 &\necho $! > child.pid\nwait\n";
const STUBBORN_FORKER: &str = "#!/bin/sh\ntrap '' TERM\nsleep 60 &\necho $! > child.pid\nwait\n";

/// Writes a shell script in place of the engine's server binary.
struct ScriptProvisioner {
    root: PathBuf,
    script: &'static str,
    gate: Option<Arc<Notify>>,
    remove_gate: Option<Arc<Notify>>,
    fail: bool,
    panics: bool,
    cleanups: AtomicUsize,
}

impl ScriptProvisioner {
    fn new(root: &Path, script: &'static str) -> Self {
        Self {
            root: root.to_path_buf(),
            script,
            gate: None,
            remove_gate: None,
            fail: false,
            panics: false,
            cleanups: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Provisioner for ScriptProvisioner {
    async fn provision(
        &self,
        request: &ProvisionRequest,
        progress: &dyn ProgressSink,
    ) -> Result<ProvisionedEngine> {
        progress.report(10, "downloading");
        if let Some(gate) = self.gate.as_ref() {
            gate.notified().await;
        }
        if self.fail {
            bail!("checksum mismatch for {}", request.engine);
        }
        if self.panics {
            panic!("archive reader crashed on {}", request.engine);
        }

        let layout = EngineLayout::new(&self.root, request.engine);
        for dir in [&layout.bin, &layout.data, &layout.logs] {
            std::fs::create_dir_all(dir)?;
        }
        let binary = layout.bin.join(request.engine.server_binary());
        std::fs::write(&binary, self.script)?;
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755))?;
        progress.report(60, "configuring");

        Ok(ProvisionedEngine {
            version: request.version.clone(),
            install_path: layout.bin.clone(),
            data_path: layout.data.clone(),
            log_path: layout.log_file(request.engine),
            config_path: None,
            port: request.port(),
            username: request.options.username.clone(),
            password: request.options.password.clone(),
        })
    }

    async fn cleanup(&self, _request: &ProvisionRequest) -> Result<()> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove(&self, instance: &DatabaseInstance, _purge_data: bool) -> Result<()> {
        if let Some(gate) = self.remove_gate.as_ref() {
            gate.notified().await;
        }
        std::fs::remove_dir_all(&instance.install_path)?;
        Ok(())
    }
}

fn test_config(root: &Path) -> CoreConfig {
    CoreConfig {
        startup_grace: Duration::from_millis(200),
        stop_timeout: Duration::from_millis(500),
        kill_timeout: Duration::from_secs(3),
        poll_interval: Duration::from_millis(20),
        ..CoreConfig::with_storage_root(root)
    }
}

async fn open_manager(
    config: CoreConfig,
    store: Arc<dyn InstanceStore>,
    provisioner: Arc<ScriptProvisioner>,
) -> DbManager {
    DbManager::open(config, store, provisioner, platform_probe())
        .await
        .expect("open manager")
}

async fn manager_with(dir: &TempDir, provisioner: Arc<ScriptProvisioner>) -> DbManager {
    open_manager(
        test_config(dir.path()),
        Arc::new(MemoryStore::default()),
        provisioner,
    )
    .await
}

/// Store whose writes fail while `full` is set.
#[derive(Default)]
struct FullDisk {
    inner: MemoryStore,
    full: AtomicBool,
}

impl FullDisk {
    fn full() -> Self {
        Self {
            full: AtomicBool::new(true),
            ..Self::default()
        }
    }

    fn check(&self) -> Result<()> {
        if self.full.load(Ordering::SeqCst) {
            bail!("disk full");
        }
        Ok(())
    }
}

#[async_trait]
impl InstanceStore for FullDisk {
    async fn load_all(&self) -> Result<Vec<DatabaseInstance>> {
        self.inner.load_all().await
    }

    async fn save(&self, instance: &DatabaseInstance) -> Result<()> {
        self.check()?;
        self.inner.save(instance).await
    }

    async fn remove(&self, id: Uuid) -> Result<()> {
        self.check()?;
        self.inner.remove(id).await
    }
}

async fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !done() {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .expect("ephemeral port")
}

async fn wait_for_task(manager: &DbManager, id: Uuid) -> AsyncTask {
    timeout(Duration::from_secs(5), async {
        loop {
            let task = manager.get_task(id).expect("task retained");
            if task.status.is_terminal() {
                return task;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("task finished in time")
}

async fn install_redis(manager: &DbManager) -> DatabaseInstance {
    let options = InstallOptions {
        port: Some(free_port()),
        ..Default::default()
    };
    let task_id = manager
        .install(EngineType::Redis, None, options)
        .expect("install accepted");
    let task = wait_for_task(manager, task_id).await;
    assert_eq!(task.status, TaskStatus::Completed, "{:?}", task.error);
    manager
        .get_instance_by_type(EngineType::Redis)
        .expect("instance recorded")
}

#[tokio::test]
async fn install_records_a_stopped_instance() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let provisioner = Arc::new(ScriptProvisioner::new(dir.path(), SLEEPER));
    let manager = manager_with(&dir, provisioner).await;
    let mut events = manager.subscribe();

    let task_id = manager.install(EngineType::MongoDb, Some("7.0.9".into()), InstallOptions::default())?;
    let task = wait_for_task(&manager, task_id).await;

    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.progress, 100);
    let instance = manager.get_instance_by_type(EngineType::MongoDb)?;
    assert_eq!(task.instance_id, Some(instance.id));
    assert_eq!(instance.status, InstanceStatus::Stopped);
    assert_eq!(instance.pid, None);
    assert_eq!(instance.port, 27017);
    assert_eq!(instance.version, "7.0.9");

    let mut last_progress = 0;
    let mut saw_snapshot = false;
    timeout(Duration::from_secs(1), async {
        while !(saw_snapshot && last_progress == 100) {
            match events.recv().await.expect("event hub open") {
                Notification::InstallProgress(update) => {
                    assert!(update.progress >= last_progress, "progress went backwards");
                    last_progress = update.progress;
                }
                Notification::InstancesUpdated(instances) => {
                    saw_snapshot |= instances.iter().any(|i| i.id == instance.id);
                }
            }
        }
    })
    .await?;
    Ok(())
}

#[tokio::test]
async fn second_install_while_running_conflicts() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let gate = Arc::new(Notify::new());
    let mut provisioner = ScriptProvisioner::new(dir.path(), SLEEPER);
    provisioner.gate = Some(gate.clone());
    let manager = manager_with(&dir, Arc::new(provisioner)).await;

    let first = manager.install(EngineType::MongoDb, None, InstallOptions::default())?;
    let err = manager
        .install(EngineType::MongoDb, None, InstallOptions::default())
        .unwrap_err();
    assert!(matches!(err, CoreError::Conflict(_)));
    assert!(manager.get_task(first)?.status.is_active());

    gate.notify_one();
    assert_eq!(wait_for_task(&manager, first).await.status, TaskStatus::Completed);

    let err = manager
        .install(EngineType::MongoDb, None, InstallOptions::default())
        .unwrap_err();
    assert!(matches!(err, CoreError::Conflict(_)));
    assert_eq!(manager.list_instances().len(), 1);
    Ok(())
}

#[tokio::test]
async fn failed_install_leaves_no_record() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut provisioner = ScriptProvisioner::new(dir.path(), SLEEPER);
    provisioner.fail = true;
    let provisioner = Arc::new(provisioner);
    let manager = manager_with(&dir, provisioner.clone()).await;

    let task_id = manager.install(EngineType::Qdrant, None, InstallOptions::default())?;
    let task = wait_for_task(&manager, task_id).await;

    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.as_deref().unwrap_or_default().contains("checksum mismatch"));
    assert!(matches!(
        manager.get_instance_by_type(EngineType::Qdrant),
        Err(CoreError::NotFound(_))
    ));
    assert_eq!(provisioner.cleanups.load(Ordering::SeqCst), 1);

    // A terminal task no longer blocks a retry.
    assert!(manager
        .install(EngineType::Qdrant, None, InstallOptions::default())
        .is_ok());
    Ok(())
}

#[tokio::test]
async fn concurrent_start_yields_one_process() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let manager = manager_with(&dir, Arc::new(ScriptProvisioner::new(dir.path(), SLEEPER))).await;
    let instance = install_redis(&manager).await;

    let (first, second) = tokio::join!(
        manager.start_instance(instance.id),
        manager.start_instance(instance.id)
    );
    let (started, rejected) = match (first, second) {
        (Ok(started), Err(err)) | (Err(err), Ok(started)) => (started, err),
        other => panic!("expected exactly one start to win: {other:?}"),
    };
    assert!(matches!(rejected, CoreError::Conflict(_)));
    assert_eq!(started.status, InstanceStatus::Running);
    let pid = started.pid.expect("running instance has a pid");
    assert_eq!(localdb_core::read_pid_file(&started.pid_file()), Some(pid));

    let err = manager.start_instance(instance.id).await.unwrap_err();
    assert!(matches!(err, CoreError::Conflict(_)));

    let stopped = manager.stop_instance(instance.id).await?;
    assert_eq!(stopped.status, InstanceStatus::Stopped);
    assert_eq!(stopped.pid, None);
    assert!(!started.pid_file().exists());

    let err = manager.stop_instance(instance.id).await.unwrap_err();
    assert!(matches!(err, CoreError::NotRunning(_)));
    Ok(())
}

#[tokio::test]
async fn externally_killed_process_is_reconciled() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let manager = manager_with(&dir, Arc::new(ScriptProvisioner::new(dir.path(), SLEEPER))).await;
    let instance = install_redis(&manager).await;
    let pid = manager
        .start_instance(instance.id)
        .await?
        .pid
        .expect("pid recorded");
    let mut events = manager.subscribe();

    let status = std::process::Command::new("kill")
        .args(["-9", &pid.to_string()])
        .status()?;
    assert!(status.success());

    let reconciled = timeout(Duration::from_secs(5), async {
        loop {
            let snapshot = manager.sync_status().await.expect("sync pass");
            let current = snapshot
                .into_iter()
                .find(|i| i.id == instance.id)
                .expect("instance still listed");
            if current.status == InstanceStatus::Stopped {
                return current;
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await?;
    assert_eq!(reconciled.pid, None);

    let published = timeout(Duration::from_secs(1), async {
        loop {
            match events.recv().await {
                Some(Notification::InstancesUpdated(instances)) => return instances,
                Some(_) => continue,
                None => panic!("event hub closed"),
            }
        }
    })
    .await?;
    assert!(published
        .iter()
        .any(|i| i.id == instance.id && i.status == InstanceStatus::Stopped));
    Ok(())
}

#[tokio::test]
async fn stubborn_process_is_force_killed() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let manager = manager_with(&dir, Arc::new(ScriptProvisioner::new(dir.path(), STUBBORN))).await;
    let instance = install_redis(&manager).await;
    manager.start_instance(instance.id).await?;

    let stopped = manager.stop_instance(instance.id).await?;
    assert_eq!(stopped.status, InstanceStatus::Stopped);
    assert_eq!(stopped.pid, None);
    Ok(())
}

#[tokio::test]
async fn early_exit_is_a_process_error() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let manager = manager_with(&dir, Arc::new(ScriptProvisioner::new(dir.path(), CRASHER))).await;
    let instance = install_redis(&manager).await;

    let err = manager.start_instance(instance.id).await.unwrap_err();
    assert!(matches!(err, CoreError::Process(_)), "{err}");
    assert_eq!(
        manager.get_instance(instance.id)?.status,
        InstanceStatus::Stopped
    );
    let log = std::fs::read_to_string(&instance.log_path)?;
    assert!(log.contains("boom"));
    Ok(())
}

#[tokio::test]
async fn restart_from_stopped_starts() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let manager = manager_with(&dir, Arc::new(ScriptProvisioner::new(dir.path(), SLEEPER))).await;
    let instance = install_redis(&manager).await;

    let restarted = manager.restart_instance(instance.id).await?;
    assert_eq!(restarted.status, InstanceStatus::Running);
    let first_pid = restarted.pid;

    let restarted = manager.restart_instance(instance.id).await?;
    assert_ne!(restarted.pid, first_pid);

    manager.delete_instance(instance.id, true).await?;
    assert!(manager.list_instances().is_empty());
    assert!(!instance.data_path.exists());
    Ok(())
}

#[tokio::test]
async fn uninstall_task_removes_instance() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let manager = manager_with(&dir, Arc::new(ScriptProvisioner::new(dir.path(), SLEEPER))).await;
    let instance = install_redis(&manager).await;
    manager.start_instance(instance.id).await?;

    let task_id = manager.uninstall(instance.id, false)?;
    let task = wait_for_task(&manager, task_id).await;

    assert_eq!(task.status, TaskStatus::Completed, "{:?}", task.error);
    assert!(manager.list_instances().is_empty());
    assert!(!instance.install_path.exists());
    Ok(())
}

#[tokio::test]
async fn panicking_install_fails_the_task_and_frees_the_type() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut provisioner = ScriptProvisioner::new(dir.path(), SLEEPER);
    provisioner.panics = true;
    let provisioner = Arc::new(provisioner);
    let manager = manager_with(&dir, provisioner.clone()).await;

    let task_id = manager.install(EngineType::Neo4j, None, InstallOptions::default())?;
    let task = wait_for_task(&manager, task_id).await;

    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.progress, 10);
    assert!(task.error.as_deref().unwrap_or_default().contains("aborted"), "{:?}", task.error);
    assert_eq!(provisioner.cleanups.load(Ordering::SeqCst), 1);
    assert!(manager.list_instances().is_empty());

    assert!(manager
        .install(EngineType::Neo4j, None, InstallOptions::default())
        .is_ok());
    Ok(())
}

#[tokio::test]
async fn unpersistable_install_fails_without_a_record() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let provisioner = Arc::new(ScriptProvisioner::new(dir.path(), SLEEPER));
    let manager = open_manager(
        test_config(dir.path()),
        Arc::new(FullDisk::full()),
        provisioner.clone(),
    )
    .await;

    let task_id = manager.install(EngineType::Redis, None, InstallOptions::default())?;
    let task = wait_for_task(&manager, task_id).await;

    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.as_deref().unwrap_or_default().contains("disk full"), "{:?}", task.error);
    assert!(manager.list_instances().is_empty());
    assert!(matches!(
        manager.get_instance_by_type(EngineType::Redis),
        Err(CoreError::NotFound(_))
    ));
    assert_eq!(provisioner.cleanups.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn unrecorded_start_kills_the_new_process() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Arc::new(FullDisk::default());
    let manager = open_manager(
        test_config(dir.path()),
        store.clone(),
        Arc::new(ScriptProvisioner::new(dir.path(), SLEEPER)),
    )
    .await;
    let instance = install_redis(&manager).await;
    store.full.store(true, Ordering::SeqCst);

    let err = manager.start_instance(instance.id).await.unwrap_err();
    assert!(matches!(err, CoreError::Storage(_)), "{err}");
    let current = manager.get_instance(instance.id)?;
    assert_eq!(current.status, InstanceStatus::Stopped);
    assert_eq!(current.pid, None);

    let pid = localdb_core::read_pid_file(&instance.pid_file()).expect("pid-file written");
    wait_until("the unrecorded process to die", || !SignalProbe.is_alive(pid)).await;
    Ok(())
}

/// Treats exited-but-unreaped processes as gone.
#[cfg(target_os = "linux")]
fn process_gone(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Err(_) => true,
        Ok(stat) => stat
            .rsplit(')')
            .next()
            .is_some_and(|rest| rest.trim_start().starts_with('Z')),
    }
}

#[cfg(target_os = "linux")]
async fn stop_reaches_child_of(script: &'static str) -> Result<()> {
    let dir = tempfile::tempdir()?;
    let manager = manager_with(&dir, Arc::new(ScriptProvisioner::new(dir.path(), script))).await;
    let instance = install_redis(&manager).await;
    manager.start_instance(instance.id).await?;

    let child_pid_file = instance.data_path.join("child.pid");
    wait_until("the helper pid", || {
        localdb_core::read_pid_file(&child_pid_file).is_some()
    })
    .await;
    let child = localdb_core::read_pid_file(&child_pid_file).expect("helper pid");
    assert!(!process_gone(child));

    let stopped = manager.stop_instance(instance.id).await?;
    assert_eq!(stopped.status, InstanceStatus::Stopped);
    wait_until("the helper to exit", || process_gone(child)).await;
    Ok(())
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn stop_terminates_the_engines_child_processes() -> Result<()> {
    stop_reaches_child_of(FORKER).await
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn forced_kill_reaches_child_processes_ignoring_term() -> Result<()> {
    stop_reaches_child_of(STUBBORN_FORKER).await
}

#[tokio::test]
async fn terminal_tasks_are_evicted_after_retention() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = CoreConfig {
        task_retention: Duration::from_millis(100),
        ..test_config(dir.path())
    };
    let manager = open_manager(
        config,
        Arc::new(MemoryStore::default()),
        Arc::new(ScriptProvisioner::new(dir.path(), SLEEPER)),
    )
    .await;

    let task_id = manager.install(EngineType::Qdrant, None, InstallOptions::default())?;
    assert_eq!(wait_for_task(&manager, task_id).await.status, TaskStatus::Completed);

    wait_until("task eviction", || {
        matches!(manager.get_task(task_id), Err(CoreError::NotFound(_)))
    })
    .await;
    assert!(manager.list_tasks().is_empty());
    assert_eq!(manager.list_instances().len(), 1);
    Ok(())
}

#[tokio::test]
async fn active_uninstall_blocks_other_work_on_the_engine() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let remove_gate = Arc::new(Notify::new());
    let mut provisioner = ScriptProvisioner::new(dir.path(), SLEEPER);
    provisioner.remove_gate = Some(remove_gate.clone());
    let manager = manager_with(&dir, Arc::new(provisioner)).await;
    let instance = install_redis(&manager).await;

    let uninstall = manager.uninstall(instance.id, false)?;
    wait_until("the uninstall to reach file removal", || {
        manager
            .get_task(uninstall)
            .is_ok_and(|task| task.status == TaskStatus::Running && task.progress >= 50)
    })
    .await;

    let err = manager
        .install(EngineType::Redis, None, InstallOptions::default())
        .unwrap_err();
    assert!(matches!(err, CoreError::Conflict(_)));
    assert!(err.to_string().contains(&uninstall.to_string()), "{err}");
    assert!(matches!(
        manager.uninstall(instance.id, true),
        Err(CoreError::Conflict(_))
    ));
    assert!(matches!(
        manager.delete_instance(instance.id, true).await,
        Err(CoreError::Conflict(_))
    ));
    assert!(matches!(
        manager.start_instance(instance.id).await,
        Err(CoreError::Conflict(_))
    ));

    remove_gate.notify_one();
    let task = wait_for_task(&manager, uninstall).await;
    assert_eq!(task.status, TaskStatus::Completed, "{:?}", task.error);
    assert_eq!(task.task_type, TaskType::Uninstall);
    assert!(manager.list_instances().is_empty());
    assert!(manager
        .install(EngineType::Redis, None, InstallOptions::default())
        .is_ok());
    Ok(())
}
