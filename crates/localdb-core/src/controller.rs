//! Spawns, signals, and supervises engine server processes.

use std::{
    ffi::OsString,
    fs::OpenOptions,
    io,
    net::{Ipv4Addr, SocketAddrV4, TcpListener},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use localdb_store::{DatabaseInstance, EngineType, InstanceStatus};
use tokio::{
    process::{Child, Command},
    time::{sleep, timeout, Instant},
};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{probe::ProcessProbe, registry::InstanceRegistry, CoreConfig, CoreError};

/// Timeouts governing spawn and shutdown.
#[derive(Debug, Clone, Copy)]
pub struct ControllerSettings {
    pub stop_timeout: Duration,
    pub kill_timeout: Duration,
    pub poll_interval: Duration,
    pub startup_grace: Duration,
}

impl From<&CoreConfig> for ControllerSettings {
    fn from(config: &CoreConfig) -> Self {
        Self {
            stop_timeout: config.stop_timeout,
            kill_timeout: config.kill_timeout,
            poll_interval: config.poll_interval,
            startup_grace: config.startup_grace,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignalOutcome {
    Delivered,
    NoSuchProcess,
}

pub struct ProcessController {
    registry: Arc<InstanceRegistry>,
    probe: Arc<dyn ProcessProbe>,
    settings: ControllerSettings,
}

impl ProcessController {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        probe: Arc<dyn ProcessProbe>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            registry,
            probe,
            settings,
        }
    }

    /// Spawns the instance's server. A running instance, or one with another
    /// operation in flight, is a conflict. Spawn failures leave the status
    /// untouched.
    #[instrument(skip(self))]
    pub async fn start(&self, id: Uuid) -> Result<DatabaseInstance, CoreError> {
        let _claim = self.registry.claim(id)?;
        self.start_claimed(id).await
    }

    /// Terminates the instance's server, escalating to a forced kill after
    /// the stop timeout.
    #[instrument(skip(self))]
    pub async fn stop(&self, id: Uuid) -> Result<DatabaseInstance, CoreError> {
        let _claim = self.registry.claim(id)?;
        self.stop_claimed(id).await
    }

    /// Stops (if running) and starts again under a single claim.
    #[instrument(skip(self))]
    pub async fn restart(&self, id: Uuid) -> Result<DatabaseInstance, CoreError> {
        let _claim = self.registry.claim(id)?;
        match self.stop_claimed(id).await {
            Ok(_) | Err(CoreError::NotRunning(_)) => {}
            Err(err) => return Err(err),
        }
        self.start_claimed(id).await
    }

    async fn start_claimed(&self, id: Uuid) -> Result<DatabaseInstance, CoreError> {
        let instance = self.registry.get(id)?;
        if instance.is_running() {
            return Err(CoreError::Conflict(format!(
                "instance {id} is already running with pid {}",
                instance.pid.unwrap_or_default()
            )));
        }

        ensure_port_free(instance.port)?;
        for dir in [Some(instance.data_path.as_path()), instance.log_path.parent()]
            .into_iter()
            .flatten()
        {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|err| CoreError::Io(dir.to_path_buf(), err))?;
        }

        let mut child = self.spawn(&instance)?;
        let pid = child.id().ok_or_else(|| {
            CoreError::Process(format!("{} exited before reporting a pid", instance.engine_type))
        })?;

        match timeout(self.settings.startup_grace, child.wait()).await {
            Ok(Ok(status)) => {
                return Err(CoreError::Process(format!(
                    "{} exited during startup with {status}; see {}",
                    instance.engine_type,
                    instance.log_path.display()
                )));
            }
            Ok(Err(err)) => {
                return Err(CoreError::Process(format!(
                    "failed to observe {} after spawn: {err}",
                    instance.engine_type
                )));
            }
            Err(_) => {}
        }

        let pid_file = instance.pid_file();
        if let Err(err) = tokio::fs::write(&pid_file, format!("{pid}\n")).await {
            warn!(instance_id = %id, path = %pid_file.display(), error = %err, "failed to write pid-file");
        }
        supervise(id, instance.engine_type, child);

        match self
            .registry
            .set_status(id, InstanceStatus::Running, Some(pid))
            .await
        {
            Ok(updated) => {
                info!(instance_id = %id, engine = %instance.engine_type, pid, "instance running");
                self.registry.notify();
                Ok(updated)
            }
            Err(err) => {
                warn!(instance_id = %id, pid, error = %err, "discarding process that could not be recorded");
                if let Err(kill_err) = send_signal(pid, true).await {
                    warn!(instance_id = %id, pid, error = %kill_err, "failed to kill unrecorded engine process");
                }
                Err(err)
            }
        }
    }

    pub(crate) async fn stop_claimed(&self, id: Uuid) -> Result<DatabaseInstance, CoreError> {
        let instance = self.registry.get(id)?;
        let pid = match (instance.status, instance.pid) {
            (InstanceStatus::Running, Some(pid)) => pid,
            _ => return Err(CoreError::NotRunning(id)),
        };

        self.terminate(pid).await?;

        let pid_file = instance.pid_file();
        if let Err(err) = tokio::fs::remove_file(&pid_file).await {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(instance_id = %id, path = %pid_file.display(), error = %err, "failed to remove pid-file");
            }
        }

        let updated = self
            .registry
            .set_status(id, InstanceStatus::Stopped, None)
            .await?;
        info!(instance_id = %id, engine = %instance.engine_type, "instance stopped");
        self.registry.notify();
        Ok(updated)
    }

    async fn terminate(&self, pid: u32) -> Result<(), CoreError> {
        if !self.probe.is_alive(pid) && !self.probe.is_group_alive(pid) {
            debug!(pid, "process already gone");
            return Ok(());
        }

        match send_signal(pid, false).await {
            Ok(SignalOutcome::NoSuchProcess) => return Ok(()),
            Ok(SignalOutcome::Delivered) => {}
            Err(err) => {
                return Err(CoreError::Process(format!(
                    "failed to signal pid {pid}: {err}"
                )))
            }
        }
        if self.wait_for_group_exit(pid, self.settings.stop_timeout).await {
            return Ok(());
        }

        warn!(
            pid,
            timeout_secs = self.settings.stop_timeout.as_secs(),
            "stop timeout reached, force killing"
        );
        match send_signal(pid, true).await {
            Ok(SignalOutcome::NoSuchProcess) => return Ok(()),
            Ok(SignalOutcome::Delivered) => {}
            Err(err) => {
                return Err(CoreError::Process(format!(
                    "failed to kill pid {pid}: {err}"
                )))
            }
        }
        if self.wait_for_exit(pid, self.settings.kill_timeout).await {
            Ok(())
        } else {
            Err(CoreError::Process(format!(
                "pid {pid} is still alive after a forced kill"
            )))
        }
    }

    /// Waits for the leader and every other member of its group to exit.
    async fn wait_for_group_exit(&self, pid: u32, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            if !self.probe.is_alive(pid) && !self.probe.is_group_alive(pid) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(self.settings.poll_interval).await;
        }
    }

    async fn wait_for_exit(&self, pid: u32, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            if !self.probe.is_alive(pid) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(self.settings.poll_interval).await;
        }
    }

    fn spawn(&self, instance: &DatabaseInstance) -> Result<Child, CoreError> {
        let binary = instance.binary_path();
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&instance.log_path)
            .map_err(|err| CoreError::Io(instance.log_path.clone(), err))?;
        let log_err = log
            .try_clone()
            .map_err(|err| CoreError::Io(instance.log_path.clone(), err))?;

        let mut std_command = std::process::Command::new(&binary);
        std_command
            .args(launch_args(instance))
            .current_dir(&instance.data_path)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        if instance.engine_type == EngineType::Neo4j {
            if let Some(conf_dir) = instance.config_path.as_deref().and_then(|p| p.parent()) {
                std_command.env("NEO4J_CONF", conf_dir);
            }
        }
        // Engines outlive the manager and must not receive its terminal signals.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            std_command.process_group(0);
        }

        let mut command = Command::from(std_command);
        command.kill_on_drop(false);
        command.spawn().map_err(|err| {
            let reason = match err.kind() {
                io::ErrorKind::NotFound => "binary missing",
                io::ErrorKind::PermissionDenied => "permission denied",
                _ => "spawn failed",
            };
            CoreError::Process(format!("{reason}: {}: {err}", binary.display()))
        })
    }
}

/// Reaps the child when it exits so the probe stops reporting it alive.
fn supervise(id: Uuid, engine: EngineType, mut child: Child) {
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => info!(instance_id = %id, engine = %engine, %status, "engine process exited"),
            Err(err) => warn!(instance_id = %id, engine = %engine, error = %err, "failed to wait on engine process"),
        }
    });
}

fn ensure_port_free(port: u16) -> Result<(), CoreError> {
    match TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)) {
        Ok(listener) => {
            drop(listener);
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::AddrInUse => Err(CoreError::Process(format!(
            "port in use: 127.0.0.1:{port}"
        ))),
        Err(err) => Err(CoreError::Process(format!(
            "cannot bind 127.0.0.1:{port}: {err}"
        ))),
    }
}

/// Foreground launch arguments for the instance's server binary.
pub fn launch_args(instance: &DatabaseInstance) -> Vec<OsString> {
    let port = instance.port.to_string();
    let data = instance.data_path.as_os_str().to_os_string();
    let config = instance.config_path.as_ref().map(|p| p.as_os_str().to_os_string());
    let mut args: Vec<OsString> = Vec::new();

    match instance.engine_type {
        EngineType::MySql => match config {
            Some(config) => {
                let mut flag = OsString::from("--defaults-file=");
                flag.push(config);
                args.push(flag);
            }
            None => {
                let mut datadir = OsString::from("--datadir=");
                datadir.push(&data);
                args.push(datadir);
                args.push(format!("--port={port}").into());
            }
        },
        EngineType::PostgreSql => {
            args.extend(["-D".into(), data, "-p".into(), port.into()]);
            if let Some(config) = config {
                let mut flag = OsString::from("config_file=");
                flag.push(config);
                args.extend(["-c".into(), flag]);
            }
        }
        EngineType::MongoDb => match config {
            Some(config) => args.extend(["--config".into(), config]),
            None => args.extend([
                "--dbpath".into(),
                data,
                "--port".into(),
                port.into(),
                "--bind_ip".into(),
                "127.0.0.1".into(),
            ]),
        },
        EngineType::Redis => match config {
            Some(config) => args.push(config),
            None => args.extend(["--port".into(), port.into(), "--dir".into(), data]),
        },
        EngineType::Qdrant => {
            if let Some(config) = config {
                args.extend(["--config-path".into(), config]);
            }
        }
        EngineType::Neo4j => args.push("console".into()),
        EngineType::SeekDb => {
            if let Some(config) = config {
                args.extend(["-config".into(), config]);
            }
        }
        EngineType::SurrealDb => {
            let mut path = OsString::from("file://");
            path.push(&data);
            args.extend([
                "start".into(),
                "--user".into(),
                instance.username.as_deref().unwrap_or("root").into(),
                "--pass".into(),
                instance.password.as_deref().unwrap_or("root").into(),
                "--bind".into(),
                format!("127.0.0.1:{port}").into(),
                path,
            ]);
        }
    }
    args
}

/// Signals the process group led by `pid`. Engines are spawned as group
/// leaders, so this reaches their helper processes too; a pid that leads no
/// group (one adopted from a pid-file) is signalled on its own.
#[cfg(unix)]
async fn send_signal(pid: u32, force: bool) -> io::Result<SignalOutcome> {
    use nix::{
        errno::Errno,
        sys::signal::{kill, killpg, Signal},
        unistd::Pid,
    };

    let raw = i32::try_from(pid)
        .ok()
        .filter(|raw| *raw > 0)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("pid {pid} out of range")))?;
    let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    let target = Pid::from_raw(raw);
    let result = match killpg(target, signal) {
        Err(Errno::ESRCH) => kill(target, signal),
        other => other,
    };
    match result {
        Ok(()) => Ok(SignalOutcome::Delivered),
        Err(Errno::ESRCH) => Ok(SignalOutcome::NoSuchProcess),
        Err(errno) => Err(io::Error::from(errno)),
    }
}

#[cfg(windows)]
async fn send_signal(pid: u32, force: bool) -> io::Result<SignalOutcome> {
    let mut command = Command::new("taskkill");
    command.args(["/PID", &pid.to_string(), "/T"]);
    if force {
        command.arg("/F");
    }
    let output = command.output().await?;
    if output.status.success() {
        Ok(SignalOutcome::Delivered)
    } else if String::from_utf8_lossy(&output.stderr).contains("not found") {
        Ok(SignalOutcome::NoSuchProcess)
    } else {
        Err(io::Error::other(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ))
    }
}
