//! Provisioning boundary: materialises an engine binary plus its directory
//! layout before a registry record exists.

use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    process::Stdio,
};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use localdb_store::{DatabaseInstance, EngineType};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{fs, process::Command};
use tracing::{debug, info, warn};
use which::which;

pub const DEFAULT_VERSION: &str = "latest";

const INITDB: &str = "initdb";

/// Caller-supplied overrides for an install.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallOptions {
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub auto_start: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionRequest {
    pub engine: EngineType,
    pub version: String,
    pub options: InstallOptions,
}

impl ProvisionRequest {
    pub fn new(engine: EngineType, version: Option<String>, options: InstallOptions) -> Self {
        Self {
            engine,
            version: version
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_VERSION.to_string()),
            options,
        }
    }

    pub fn port(&self) -> u16 {
        self.options.port.unwrap_or_else(|| self.engine.default_port())
    }
}

/// What a successful provisioning run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedEngine {
    pub version: String,
    pub install_path: PathBuf,
    pub data_path: PathBuf,
    pub log_path: PathBuf,
    pub config_path: Option<PathBuf>,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Receives progress increments from a provisioner.
pub trait ProgressSink: Send + Sync {
    fn report(&self, progress: u8, message: &str);
}

/// Materialises engines on disk. Each step carries its own timeouts; callers
/// treat a run as opaque.
#[async_trait]
pub trait Provisioner: Send + Sync + 'static {
    async fn provision(
        &self,
        request: &ProvisionRequest,
        progress: &dyn ProgressSink,
    ) -> Result<ProvisionedEngine>;

    /// Removes whatever a failed or unrecorded `provision` call left behind.
    async fn cleanup(&self, request: &ProvisionRequest) -> Result<()>;

    /// Called once the provisioned engine is recorded; afterwards `cleanup`
    /// no longer touches its files.
    fn commit(&self, _request: &ProvisionRequest) {}

    /// Removes the artifacts of an installed engine.
    async fn remove(&self, instance: &DatabaseInstance, purge_data: bool) -> Result<()>;
}

/// Per-engine directories under the storage root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineLayout {
    pub bin: PathBuf,
    pub config: PathBuf,
    pub data: PathBuf,
    pub logs: PathBuf,
}

impl EngineLayout {
    pub fn new(root: &Path, engine: EngineType) -> Self {
        Self {
            bin: root.join("bin").join(engine.as_str()),
            config: root.join("config").join(engine.as_str()),
            data: root.join("data").join(engine.as_str()),
            logs: root.join("logs").join(engine.as_str()),
        }
    }

    pub fn config_file(&self, engine: EngineType) -> PathBuf {
        self.config.join(engine.config_file_name())
    }

    pub fn log_file(&self, engine: EngineType) -> PathBuf {
        self.logs.join(format!("{}.log", engine.as_str()))
    }

    fn dirs(&self) -> [&Path; 4] {
        [&self.bin, &self.config, &self.data, &self.logs]
    }
}

/// Installs engines by copying an existing server binary from a source
/// directory (or `PATH`) into the storage root.
#[derive(Debug)]
pub struct LocalProvisioner {
    root: PathBuf,
    binary_source: Option<PathBuf>,
    created: Mutex<HashMap<EngineType, Vec<PathBuf>>>,
}

impl LocalProvisioner {
    pub fn new(root: impl Into<PathBuf>, binary_source: Option<PathBuf>) -> Self {
        Self {
            root: root.into(),
            binary_source,
            created: Mutex::new(HashMap::new()),
        }
    }

    pub fn layout(&self, engine: EngineType) -> EngineLayout {
        EngineLayout::new(&self.root, engine)
    }

    fn locate_binary(&self, name: &str) -> Result<PathBuf> {
        if let Some(source) = self.binary_source.as_ref() {
            let candidate = source.join(name);
            if candidate.is_file() {
                return Ok(candidate);
            }
            debug!(source = %source.display(), binary = name, "binary not in source directory");
        }
        which(name).map_err(|_| {
            let searched = self
                .binary_source
                .as_ref()
                .map(|source| format!("{} or PATH", source.display()))
                .unwrap_or_else(|| "PATH".to_string());
            anyhow!("{name} not found in {searched}")
        })
    }

    /// Copies a located binary into the engine's `bin/` under `name`.
    async fn install_binary(
        &self,
        source: &Path,
        name: &str,
        layout: &EngineLayout,
    ) -> Result<PathBuf> {
        let target = layout.bin.join(name);
        fs::copy(source, &target)
            .await
            .with_context(|| format!("copying {} to {}", source.display(), target.display()))?;
        make_executable(&target).await?;
        Ok(target)
    }

    /// Runs the engine's one-off data directory initializer. Engines without
    /// one, and data directories that already hold a cluster, are skipped.
    async fn initialize_data(
        &self,
        engine: EngineType,
        layout: &EngineLayout,
        username: Option<&str>,
        progress: &dyn ProgressSink,
    ) -> Result<()> {
        let mut command = match engine {
            EngineType::MySql => {
                if layout.data.join("mysql").exists() {
                    debug!(engine = %engine, "data directory already initialized");
                    return Ok(());
                }
                let mut command = Command::new(layout.bin.join(engine.server_binary()));
                command
                    .arg("--initialize-insecure")
                    .arg(format!("--datadir={}", layout.data.display()))
                    .arg(format!("--basedir={}", layout.bin.display()));
                command
            }
            EngineType::PostgreSql => {
                if layout.data.join("PG_VERSION").exists() {
                    debug!(engine = %engine, "data directory already initialized");
                    return Ok(());
                }
                let source = self.locate_binary(INITDB)?;
                let initdb = self.install_binary(&source, INITDB, layout).await?;
                let mut command = Command::new(initdb);
                command
                    .arg("-D")
                    .arg(&layout.data)
                    .arg("-U")
                    .arg(username.unwrap_or("postgres"))
                    .arg("--auth=trust");
                command
            }
            _ => return Ok(()),
        };

        progress.report(65, "initializing data directory");
        let output = command
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("running the {} data initializer", engine.display_name()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "{} data initialization failed ({}): {}",
                engine.display_name(),
                output.status,
                stderr.trim()
            );
        }
        info!(engine = %engine, data = %layout.data.display(), "data directory initialized");
        Ok(())
    }
}

#[async_trait]
impl Provisioner for LocalProvisioner {
    async fn provision(
        &self,
        request: &ProvisionRequest,
        progress: &dyn ProgressSink,
    ) -> Result<ProvisionedEngine> {
        let engine = request.engine;
        let layout = self.layout(engine);

        progress.report(5, "preparing directories");
        self.created.lock().insert(engine, Vec::new());
        for dir in layout.dirs() {
            if fs::metadata(dir).await.is_err() {
                // Recorded first so a partial create is still cleaned up.
                self.created
                    .lock()
                    .entry(engine)
                    .or_default()
                    .push(dir.to_path_buf());
                fs::create_dir_all(dir)
                    .await
                    .with_context(|| format!("creating {}", dir.display()))?;
            }
        }

        progress.report(25, &format!("locating {}", engine.server_binary()));
        let source = self.locate_binary(engine.server_binary())?;

        progress.report(50, &format!("installing {}", engine.server_binary()));
        let target = self
            .install_binary(&source, engine.server_binary(), &layout)
            .await?;

        let username = request
            .options
            .username
            .clone()
            .or_else(|| default_username(engine).map(str::to_string));
        self.initialize_data(engine, &layout, username.as_deref(), progress)
            .await?;

        progress.report(80, "writing configuration");
        let port = request.port();
        let password = request.options.password.clone();
        let config_path = layout.config_file(engine);
        let log_path = layout.log_file(engine);
        let content = render_config(
            engine,
            &layout,
            port,
            username.as_deref(),
            password.as_deref(),
        );
        fs::write(&config_path, content)
            .await
            .with_context(|| format!("writing {}", config_path.display()))?;

        progress.report(95, "finalizing installation");
        info!(engine = %engine, binary = %target.display(), "engine provisioned");

        Ok(ProvisionedEngine {
            version: request.version.clone(),
            install_path: layout.bin,
            data_path: layout.data,
            log_path,
            config_path: Some(config_path),
            port,
            username,
            password,
        })
    }

    async fn cleanup(&self, request: &ProvisionRequest) -> Result<()> {
        let created = self
            .created
            .lock()
            .remove(&request.engine)
            .unwrap_or_default();
        let mut first_error = None;
        for dir in created.iter().rev() {
            if let Err(err) = remove_dir_if_present(dir).await {
                warn!(path = %dir.display(), error = %err, "failed to remove provisioning leftovers");
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    fn commit(&self, request: &ProvisionRequest) {
        self.created.lock().remove(&request.engine);
    }

    async fn remove(&self, instance: &DatabaseInstance, purge_data: bool) -> Result<()> {
        remove_dir_if_present(&instance.install_path)
            .await
            .with_context(|| format!("removing {}", instance.install_path.display()))?;
        if let Some(config_dir) = instance.config_path.as_deref().and_then(Path::parent) {
            remove_dir_if_present(config_dir)
                .await
                .with_context(|| format!("removing {}", config_dir.display()))?;
        }
        if purge_data {
            remove_dir_if_present(&instance.data_path)
                .await
                .with_context(|| format!("removing {}", instance.data_path.display()))?;
        }
        Ok(())
    }
}

pub(crate) async fn remove_dir_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = fs::metadata(path).await?.permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

fn default_username(engine: EngineType) -> Option<&'static str> {
    match engine {
        EngineType::MySql => Some("root"),
        EngineType::PostgreSql => Some("postgres"),
        EngineType::Neo4j => Some("neo4j"),
        EngineType::SurrealDb => Some("root"),
        _ => None,
    }
}

/// Engine-appropriate configuration for a foreground server.
pub fn render_config(
    engine: EngineType,
    layout: &EngineLayout,
    port: u16,
    username: Option<&str>,
    password: Option<&str>,
) -> String {
    let data = layout.data.display();
    let log = layout.log_file(engine);
    let log = log.display();
    let pid = layout.data.join(engine.pid_file_name());
    let pid = pid.display();

    match engine {
        EngineType::MySql => format!(
            "[mysqld]\ndatadir={data}\nbasedir={bin}\nport={port}\nbind-address=127.0.0.1\nlog-error={log}\npid-file={pid}\n",
            bin = layout.bin.display(),
        ),
        EngineType::PostgreSql => format!(
            "listen_addresses = '127.0.0.1'\nport = {port}\nunix_socket_directories = '{data}'\nexternal_pid_file = '{pid}'\n"
        ),
        EngineType::MongoDb => format!(
            "systemLog:\n  destination: file\n  path: \"{log}\"\n  logAppend: true\nstorage:\n  dbPath: \"{data}\"\nnet:\n  port: {port}\n  bindIp: 127.0.0.1\nprocessManagement:\n  fork: false\n  pidFilePath: \"{pid}\"\n"
        ),
        EngineType::Redis => {
            let mut config = format!(
                "bind 127.0.0.1\nport {port}\ndir {data}\ndaemonize no\npidfile {pid}\n"
            );
            if let Some(password) = password {
                config.push_str(&format!("requirepass {password}\n"));
            }
            config
        }
        EngineType::Qdrant => format!(
            "service:\n  host: 127.0.0.1\n  http_port: {port}\n  grpc_port: {grpc}\nstorage:\n  storage_path: {data}\nlog_level: INFO\n",
            grpc = port.saturating_add(1),
        ),
        EngineType::Neo4j => format!(
            "server.directories.data={data}\nserver.directories.logs={logs}\nserver.default_listen_address=127.0.0.1\nserver.http.listen_address=:{port}\n",
            logs = layout.logs.display(),
        ),
        EngineType::SeekDb => format!(
            "[server]\nport = {port}\nhost = 127.0.0.1\n\n[data]\ndir = {data}\n\n[logging]\nlevel = info\nfile = {log}\n"
        ),
        EngineType::SurrealDb => format!(
            "SURREAL_BIND=127.0.0.1:{port}\nSURREAL_USER={user}\nSURREAL_PASS={pass}\nSURREAL_PATH=file://{data}\n",
            user = username.unwrap_or("root"),
            pass = password.unwrap_or("root"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Silent;

    impl ProgressSink for Silent {
        fn report(&self, _progress: u8, _message: &str) {}
    }

    #[test]
    fn request_defaults_version_and_port() {
        let request = ProvisionRequest::new(EngineType::MongoDb, None, InstallOptions::default());
        assert_eq!(request.version, DEFAULT_VERSION);
        assert_eq!(request.port(), 27017);

        let request = ProvisionRequest::new(
            EngineType::Redis,
            Some("7.2".into()),
            InstallOptions {
                port: Some(6380),
                ..Default::default()
            },
        );
        assert_eq!(request.version, "7.2");
        assert_eq!(request.port(), 6380);
    }

    #[test]
    fn redis_config_carries_port_and_password() {
        let layout = EngineLayout::new(Path::new("/srv/localdb"), EngineType::Redis);
        let config = render_config(EngineType::Redis, &layout, 6380, None, Some("hunter2"));
        assert!(config.contains("port 6380"));
        assert!(config.contains("dir /srv/localdb/data/redis"));
        assert!(config.contains("requirepass hunter2"));
    }

    #[tokio::test]
    async fn copies_binary_from_source_and_writes_config() {
        let root = tempfile::tempdir().unwrap();
        let source = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("redis-server"), "#!/bin/sh\n").unwrap();

        let provisioner =
            LocalProvisioner::new(root.path(), Some(source.path().to_path_buf()));
        let request = ProvisionRequest::new(EngineType::Redis, None, InstallOptions::default());
        let provisioned = provisioner.provision(&request, &Silent).await.unwrap();

        assert!(provisioned.install_path.join("redis-server").is_file());
        assert_eq!(provisioned.port, 6379);
        let config = std::fs::read_to_string(provisioned.config_path.unwrap()).unwrap();
        assert!(config.contains("port 6379"));
        assert!(provisioned.data_path.is_dir());
    }

    #[tokio::test]
    async fn failed_provision_cleans_only_created_directories() {
        let root = tempfile::tempdir().unwrap();
        let empty_source = tempfile::tempdir().unwrap();
        let layout = EngineLayout::new(root.path(), EngineType::SeekDb);
        std::fs::create_dir_all(&layout.data).unwrap();
        std::fs::write(layout.data.join("keep.db"), "precious").unwrap();

        let provisioner =
            LocalProvisioner::new(root.path(), Some(empty_source.path().to_path_buf()));
        let request = ProvisionRequest::new(EngineType::SeekDb, None, InstallOptions::default());
        let err = provisioner.provision(&request, &Silent).await.unwrap_err();
        assert!(err.to_string().contains("seekdb not found"));

        provisioner.cleanup(&request).await.unwrap();
        assert!(!layout.bin.exists());
        assert!(!layout.config.exists());
        assert!(layout.data.join("keep.db").is_file());
    }
    #[tokio::test]
    async fn partially_prepared_directories_are_cleaned_up() {
        let root = tempfile::tempdir().unwrap();
        let layout = EngineLayout::new(root.path(), EngineType::Qdrant);
        std::fs::write(root.path().join("config"), "not a directory").unwrap();

        let provisioner = LocalProvisioner::new(root.path(), None);
        let request = ProvisionRequest::new(EngineType::Qdrant, None, InstallOptions::default());
        let err = provisioner.provision(&request, &Silent).await.unwrap_err();
        assert!(format!("{err:#}").contains("creating"));
        assert!(layout.bin.is_dir());

        provisioner.cleanup(&request).await.unwrap();
        assert!(!layout.bin.exists());
        assert!(root.path().join("config").is_file());
    }

    #[tokio::test]
    async fn cleanup_reaches_unrecorded_installs_until_committed() {
        let root = tempfile::tempdir().unwrap();
        let source = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("mongod"), "#!/bin/sh
").unwrap();
        let provisioner =
            LocalProvisioner::new(root.path(), Some(source.path().to_path_buf()));
        let request = ProvisionRequest::new(EngineType::MongoDb, None, InstallOptions::default());

        let provisioned = provisioner.provision(&request, &Silent).await.unwrap();
        provisioner.cleanup(&request).await.unwrap();
        assert!(!provisioned.install_path.exists());
        assert!(!provisioned.data_path.exists());

        let provisioned = provisioner.provision(&request, &Silent).await.unwrap();
        provisioner.commit(&request);
        provisioner.cleanup(&request).await.unwrap();
        assert!(provisioned.install_path.join("mongod").is_file());
        assert!(provisioned.data_path.is_dir());
    }

    #[cfg(unix)]
    mod data_init {
        use std::os::unix::fs::PermissionsExt;

        use super::*;

        #[derive(Default)]
        struct Recorded(Mutex<Vec<String>>);

        impl ProgressSink for Recorded {
            fn report(&self, _progress: u8, message: &str) {
                self.0.lock().push(message.to_string());
            }
        }

        impl Recorded {
            fn saw(&self, message: &str) -> bool {
                self.0.lock().iter().any(|m| m == message)
            }
        }

        fn script(dir: &Path, name: &str, body: &str) {
            let path = dir.join(name);
            std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        const FAKE_MYSQLD: &str = r#"echo "$@" > "$(dirname "$0")/init-args"
for arg in "$@"; do
  case "$arg" in --datadir=*) mkdir -p "${arg#--datadir=}/mysql" ;; esac
done
"#;

        #[tokio::test]
        async fn mysql_data_directory_is_initialized_once() {
            let root = tempfile::tempdir().unwrap();
            let source = tempfile::tempdir().unwrap();
            script(source.path(), "mysqld", FAKE_MYSQLD);
            let provisioner =
                LocalProvisioner::new(root.path(), Some(source.path().to_path_buf()));
            let request = ProvisionRequest::new(EngineType::MySql, None, InstallOptions::default());
            let layout = provisioner.layout(EngineType::MySql);

            let progress = Recorded::default();
            provisioner.provision(&request, &progress).await.unwrap();
            provisioner.commit(&request);
            assert!(progress.saw("initializing data directory"));
            let args = std::fs::read_to_string(layout.bin.join("init-args")).unwrap();
            assert!(args.contains("--initialize-insecure"));
            assert!(args.contains(&format!("--datadir={}", layout.data.display())));
            assert!(args.contains(&format!("--basedir={}", layout.bin.display())));
            assert!(layout.data.join("mysql").is_dir());

            std::fs::remove_file(layout.bin.join("init-args")).unwrap();
            let progress = Recorded::default();
            provisioner.provision(&request, &progress).await.unwrap();
            assert!(!progress.saw("initializing data directory"));
            assert!(!layout.bin.join("init-args").exists());
        }

        #[tokio::test]
        async fn postgres_cluster_is_created_with_initdb() {
            let root = tempfile::tempdir().unwrap();
            let source = tempfile::tempdir().unwrap();
            script(source.path(), "postgres", "exit 0\n");
            script(
                source.path(),
                "initdb",
                "echo \"$@\" > \"$2/initdb-args\"\necho 16 > \"$2/PG_VERSION\"\n",
            );
            let provisioner =
                LocalProvisioner::new(root.path(), Some(source.path().to_path_buf()));
            let request =
                ProvisionRequest::new(EngineType::PostgreSql, None, InstallOptions::default());

            let provisioned = provisioner.provision(&request, &Silent).await.unwrap();
            assert!(provisioned.install_path.join("initdb").is_file());
            assert!(provisioned.data_path.join("PG_VERSION").is_file());
            let args =
                std::fs::read_to_string(provisioned.data_path.join("initdb-args")).unwrap();
            assert!(args.contains("-U postgres --auth=trust"));
        }

        #[tokio::test]
        async fn failing_initializer_fails_the_install_and_is_cleaned_up() {
            let root = tempfile::tempdir().unwrap();
            let source = tempfile::tempdir().unwrap();
            script(source.path(), "mysqld", "echo 'cannot lock ibdata1' >&2\nexit 1\n");
            let provisioner =
                LocalProvisioner::new(root.path(), Some(source.path().to_path_buf()));
            let request = ProvisionRequest::new(EngineType::MySql, None, InstallOptions::default());
            let layout = provisioner.layout(EngineType::MySql);

            let err = provisioner.provision(&request, &Silent).await.unwrap_err();
            let message = format!("{err:#}");
            assert!(message.contains("MySQL data initialization failed"), "{message}");
            assert!(message.contains("cannot lock ibdata1"), "{message}");

            provisioner.cleanup(&request).await.unwrap();
            assert!(!layout.bin.exists());
            assert!(!layout.data.exists());
        }
    }
}
