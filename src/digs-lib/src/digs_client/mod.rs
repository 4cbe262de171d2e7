mod admin;
mod listing;
mod locking;
mod transfer;


pub use admin::*;
pub use listing::*;
pub use locking::*;
pub use transfer::*;

use md5::{Digest, Md5};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;

use crate::{
    non_null_attr, parse_simple_list, send_command, BackendType, ControlChannel, ControlCommand,
    DigsConfigFile, DigsError, DigsResult, FileListCache, GridTransport, GroupMap, LocalSettings,
    LogicalDirectory, LogicalFile, NewFolders, NodeRegistry, ReplicaRegistry, StorageNode,
    DEFAULT_CONTROL_PORT, DEFAULT_REFRESH_INTERVAL, DEFAULT_RLS_PORT,
};

pub const DEFAULT_USER_GROUP: &str = "ukq";
pub const DEFAULT_MIN_COPIES: u32 = 2;
const CHECKSUM_BLOCK_SIZE: usize = 64 * 1024;

/// Receives `(message, percentage)` while the client loads the grid configuration.
pub type StatusObserver = Arc<dyn Fn(&str, u8) + Send + Sync>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserIdentity {
    pub dn: String,
    //overrides the group map lookup
    pub group: Option<String>,
}

impl UserIdentity {
    pub fn new(dn: &str) -> Self {
        Self {
            dn: dn.to_string(),
            group: None,
        }
    }

    pub fn with_group(mut self, group: &str) -> Self {
        self.group = Some(group.to_string());
        self
    }
}

#[derive(Clone)]
pub struct ClientOptions {
    pub settings_path: PathBuf,
    pub identity: UserIdentity,
    pub cache_refresh_interval: Duration,
    pub status_observer: Option<StatusObserver>,
}

impl ClientOptions {
    pub fn new(identity: UserIdentity) -> Self {
        Self {
            settings_path: LocalSettings::default_path(),
            identity,
            cache_refresh_interval: DEFAULT_REFRESH_INTERVAL,
            status_observer: None,
        }
    }

    pub fn with_settings_path(mut self, path: &Path) -> Self {
        self.settings_path = path.to_path_buf();
        self
    }

    pub fn with_status_observer(mut self, observer: StatusObserver) -> Self {
        self.status_observer = Some(observer);
        self
    }

    pub fn with_cache_refresh_interval(mut self, interval: Duration) -> Self {
        self.cache_refresh_interval = interval;
        self
    }

    fn report(&self, message: &str, percentage: u8) {
        debug!("{} ({}%)", message, percentage);
        if let Some(observer) = &self.status_observer {
            observer(message, percentage);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Main,
    Backup,
}

/// Values read from the grid's main configuration file.
#[derive(Debug, Clone)]
pub struct GridConfig {
    pub administrators: Vec<String>,
    pub rls_port: u16,
    pub control_port: u16,
    pub min_copies: u32,
    pub digs_version: u32,
    pub group_map: GroupMap,
    pub raw: DigsConfigFile,
}

impl GridConfig {
    pub fn parse(data: &[u8]) -> DigsResult<Self> {
        let raw = DigsConfigFile::parse(data)?;
        let rls_port = port_value(&raw, "rc_port", DEFAULT_RLS_PORT)?;
        let control_port = port_value(&raw, "qcdgrid_port", DEFAULT_CONTROL_PORT)?;
        let min_copies = u32::try_from(raw.int_value("min_copies", DEFAULT_MIN_COPIES as i64))
            .map_err(|_| DigsError::Config("min_copies must not be negative".to_string()))?;
        Ok(Self {
            administrators: raw.values_of("administrator"),
            rls_port,
            control_port,
            min_copies,
            digs_version: 3,
            group_map: GroupMap::default(),
            raw,
        })
    }
}

fn port_value(cfg: &DigsConfigFile, key: &str, default: u16) -> DigsResult<u16> {
    u16::try_from(cfg.int_value(key, default as i64))
        .map_err(|_| DigsError::Config(format!("Invalid {} in qcdgrid.conf", key)))
}

struct LoadedGrid {
    config: GridConfig,
    nodes: NodeRegistry,
    registry: Arc<dyn ReplicaRegistry>,
}

/// MD5 of a local file as uppercase hex.
pub async fn checksum_file(path: &Path) -> DigsResult<String> {
    let mut file = tokio::fs::File::open(path).await.map_err(|e| {
        DigsError::Io(format!("open {} for checksum failed: {}", path.display(), e))
    })?;
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; CHECKSUM_BLOCK_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:X}", hasher.finalize()))
}

pub fn normalize_lfn(lfn: &str) -> String {
    let mut out = lfn.to_string();
    while out.contains("//") {
        out = out.replace("//", "/");
    }
    out
}

/// Inbox file name for `lfn`: directory separators become `-DIR-`.
pub fn flatten_lfn(lfn: &str) -> String {
    lfn.replace('/', "-DIR-")
}

/// Free space a copy of `bytes` needs, in whole kilobytes.
pub fn required_kb(bytes: u64) -> u64 {
    bytes.div_ceil(1024)
}

fn dir_prefix(ldn: &str) -> String {
    if ldn.ends_with('/') {
        ldn.to_string()
    } else {
        format!("{}/", ldn)
    }
}

/// Client for one grid. Owns its node registry, registry connection, control
/// channel and metadata cache; several clients can live in one process.
pub struct DigsClient {
    transport: Arc<dyn GridTransport>,
    options: ClientOptions,
    settings: Mutex<LocalSettings>,
    state: RwLock<ConnectionState>,
    grid_node: String,
    grid_node_path: String,
    config: GridConfig,
    nodes: RwLock<NodeRegistry>,
    registry: Arc<dyn ReplicaRegistry>,
    control: Option<Arc<dyn ControlChannel>>,
    cache: OnceLock<Arc<FileListCache>>,
    new_folders: Arc<NewFolders>,
}

impl DigsClient {
    /// Connects using the main and backup nodes recorded in the local settings.
    /// Falls back to the backup node, without a control channel, if the main
    /// node cannot be loaded.
    pub async fn connect(
        transport: Arc<dyn GridTransport>,
        options: ClientOptions,
    ) -> DigsResult<Self> {
        let mut settings = LocalSettings::load(&options.settings_path).await?;
        let (main, main_path) = match (&settings.main_node, &settings.main_node_path) {
            (Some(n), Some(p)) if !n.is_empty() && !p.is_empty() => (n.clone(), p.clone()),
            _ => {
                return Err(DigsError::Config(
                    "Main node info not found in preferences".to_string(),
                ))
            }
        };

        let (state, node, path, loaded) =
            match Self::load_grid(transport.as_ref(), &options, &main, &main_path).await {
                Ok(loaded) => (ConnectionState::Main, main, main_path, loaded),
                Err(e) => {
                    warn!("main node {} failed: {}", main, e);
                    let (backup, backup_path) =
                        match (&settings.backup_node, &settings.backup_node_path) {
                            (Some(n), Some(p)) if !n.is_empty() && !p.is_empty() => {
                                (n.clone(), p.clone())
                            }
                            _ => {
                                return Err(DigsError::Connection(format!(
                                    "Main node is down: {}",
                                    e
                                )))
                            }
                        };
                    match Self::load_grid(transport.as_ref(), &options, &backup, &backup_path)
                        .await
                    {
                        Ok(loaded) => {
                            warn!("using backup node {}, administration disabled", backup);
                            (ConnectionState::Backup, backup, backup_path, loaded)
                        }
                        Err(e2) => {
                            return Err(DigsError::Connection(format!(
                                "Main node failed with: {}, backup node failed with: {}",
                                e, e2
                            )))
                        }
                    }
                }
            };

        let LoadedGrid {
            config,
            mut nodes,
            registry,
        } = loaded;

        let prefs = match settings.preference_list() {
            Some(prefs) if !prefs.is_empty() => prefs,
            _ => {
                let prefs = nodes.names().to_vec();
                settings.set_preference_list(&prefs);
                settings.save(&options.settings_path).await?;
                info!("created default node preference list");
                prefs
            }
        };
        nodes.set_preference_list(prefs)?;

        let control = match state {
            ConnectionState::Main => Some(transport.control_channel(&node, config.control_port)),
            _ => None,
        };

        options.report("Connected!", 100);
        info!(
            "connected to grid via {} ({} nodes, protocol version {})",
            node,
            nodes.len(),
            config.digs_version
        );

        Ok(Self {
            transport,
            options,
            settings: Mutex::new(settings),
            state: RwLock::new(state),
            grid_node: node,
            grid_node_path: path,
            config,
            nodes: RwLock::new(nodes),
            registry,
            control,
            cache: OnceLock::new(),
            new_folders: Arc::new(NewFolders::default()),
        })
    }

    /// Records new main and backup nodes in the local settings, then connects.
    pub async fn connect_to(
        transport: Arc<dyn GridTransport>,
        options: ClientOptions,
        main: (&str, &str),
        backup: Option<(&str, &str)>,
    ) -> DigsResult<Self> {
        let mut settings = LocalSettings::load(&options.settings_path).await?;
        settings.main_node = Some(main.0.to_string());
        settings.main_node_path = Some(main.1.to_string());
        if let Some((node, path)) = backup {
            settings.backup_node = Some(node.to_string());
            settings.backup_node_path = Some(path.to_string());
        }
        settings.save(&options.settings_path).await?;
        Self::connect(transport, options).await
    }

    async fn load_grid(
        transport: &dyn GridTransport,
        options: &ClientOptions,
        node: &str,
        path: &str,
    ) -> DigsResult<LoadedGrid> {
        let fetch = |name: &str| {
            let remote = format!("{}/{}", path, name);
            async move { transport.fetch_file(node, &remote).await }
        };

        options.report("Downloading main configuration file", 0);
        let mut config = GridConfig::parse(&fetch("qcdgrid.conf").await?)?;

        options.report("Downloading master list of nodes", 15);
        let mut nodes = NodeRegistry::parse_main_node_list(&fetch("mainnodelist.conf").await?)?;

        options.report("Downloading node lists", 30);
        nodes.apply_dead_list(&parse_simple_list(&fetch("deadnodes.conf").await?))?;
        options.report("Downloading node lists", 45);
        nodes.apply_disabled_list(&parse_simple_list(&fetch("disablednodes.conf").await?))?;
        options.report("Downloading node lists", 60);
        nodes.apply_retiring_list(&parse_simple_list(&fetch("retiringnodes.conf").await?))?;

        options.report("Downloading group map file", 75);
        match fetch("group-mapfile").await {
            Ok(data) => config.group_map = GroupMap::parse(&data),
            Err(e) => {
                info!("no group map on {} ({}), assuming protocol version 2", node, e);
                config.digs_version = 2;
            }
        }

        options.report("Connecting to replica location service", 90);
        let registry = transport.open_registry(node, config.rls_port).await?;

        Ok(LoadedGrid {
            config,
            nodes,
            registry,
        })
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state
            .read()
            .map(|s| *s)
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn is_using_backup_node(&self) -> bool {
        self.connection_state() == ConnectionState::Backup
    }

    /// Node the configuration and registry were loaded from.
    pub fn grid_node(&self) -> (&str, &str) {
        (&self.grid_node, &self.grid_node_path)
    }

    pub fn digs_version(&self) -> u32 {
        self.config.digs_version
    }

    pub fn min_copies(&self) -> u32 {
        self.config.min_copies
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    pub fn administrators(&self) -> &[String] {
        &self.config.administrators
    }

    pub fn user_dn(&self) -> &str {
        &self.options.identity.dn
    }

    pub fn is_user_administrator(&self) -> bool {
        self.config
            .administrators
            .iter()
            .any(|a| a == &self.options.identity.dn)
    }

    pub fn user_group(&self) -> String {
        if let Some(group) = &self.options.identity.group {
            return group.clone();
        }
        self.config
            .group_map
            .primary_group(&self.options.identity.dn)
            .unwrap_or(DEFAULT_USER_GROUP)
            .to_string()
    }

    fn with_nodes<R>(&self, f: impl FnOnce(&NodeRegistry) -> DigsResult<R>) -> DigsResult<R> {
        let nodes = self
            .nodes
            .read()
            .map_err(|_| DigsError::Config("node registry poisoned".to_string()))?;
        f(&nodes)
    }

    fn with_nodes_mut<R>(
        &self,
        f: impl FnOnce(&mut NodeRegistry) -> DigsResult<R>,
    ) -> DigsResult<R> {
        let mut nodes = self
            .nodes
            .write()
            .map_err(|_| DigsError::Config("node registry poisoned".to_string()))?;
        f(&mut nodes)
    }

    pub fn node(&self, name: &str) -> DigsResult<StorageNode> {
        self.with_nodes(|n| n.node(name).cloned())
    }

    pub fn node_names(&self) -> Vec<String> {
        self.with_nodes(|n| Ok(n.names().to_vec()))
            .unwrap_or_default()
    }

    pub fn node_path(&self, name: &str) -> DigsResult<String> {
        self.with_nodes(|n| Ok(n.node(name)?.path.clone()))
    }

    pub fn node_inbox(&self, name: &str) -> DigsResult<String> {
        let version = self.config.digs_version;
        self.with_nodes(|n| Ok(n.node(name)?.inbox_path(version)))
    }

    pub fn is_node_dead(&self, name: &str) -> DigsResult<bool> {
        self.with_nodes(|n| Ok(n.node(name)?.dead))
    }

    pub fn is_node_disabled(&self, name: &str) -> DigsResult<bool> {
        self.with_nodes(|n| Ok(n.node(name)?.disabled))
    }

    pub fn is_node_retiring(&self, name: &str) -> DigsResult<bool> {
        self.with_nodes(|n| Ok(n.node(name)?.retiring))
    }

    pub fn nodes_by_type(&self, backend: BackendType) -> Vec<String> {
        self.with_nodes(|n| Ok(n.nodes_by_type(backend)))
            .unwrap_or_default()
    }

    pub fn preference_list(&self) -> Vec<String> {
        self.with_nodes(|n| Ok(n.preference_list().to_vec()))
            .unwrap_or_default()
    }

    /// Replaces the preference list and persists it to the local settings.
    pub async fn set_preference_list(&self, prefs: Vec<String>) -> DigsResult<()> {
        self.with_nodes_mut(|n| n.set_preference_list(prefs.clone()))?;
        let mut settings = self.settings.lock().await;
        settings.set_preference_list(&prefs);
        settings.save(&self.options.settings_path).await
    }

    pub fn sort_by_preference(&self, names: &[String]) -> Vec<String> {
        self.with_nodes(|n| Ok(n.sort_by_preference(names)))
            .unwrap_or_else(|_| names.to_vec())
    }

    /// Nodes with more than `kb` kilobytes free, preferred first.
    pub fn nodes_with_space(&self, kb: u64) -> Vec<String> {
        self.with_nodes(|n| Ok(n.nodes_with_space(kb)))
            .unwrap_or_default()
    }

    pub fn registry(&self) -> Arc<dyn ReplicaRegistry> {
        self.registry.clone()
    }

    pub async fn file_locations(&self, lfn: &str) -> DigsResult<Vec<String>> {
        self.registry.get_file_locations(&normalize_lfn(lfn)).await
    }

    pub async fn attribute(&self, lfn: &str, attr: &str) -> DigsResult<Option<String>> {
        let value = self.registry.get_attribute(&normalize_lfn(lfn), attr).await?;
        Ok(non_null_attr(value))
    }

    /// Registry failures read as "does not exist".
    pub async fn file_exists(&self, lfn: &str) -> bool {
        match self.registry.lfn_exists(&normalize_lfn(lfn)).await {
            Ok(exists) => exists,
            Err(e) => {
                debug!("existence check for {} failed: {}", lfn, e);
                false
            }
        }
    }

    /// Metadata cache, started on first use.
    pub fn file_list_cache(&self) -> Arc<FileListCache> {
        self.cache
            .get_or_init(|| {
                Arc::new(FileListCache::start(
                    self.registry.clone(),
                    self.options.cache_refresh_interval,
                ))
            })
            .clone()
    }

    fn request_cache_refresh(&self) {
        if let Some(cache) = self.cache.get() {
            cache.request_refresh();
        }
    }

    pub fn new_folders(&self) -> Arc<NewFolders> {
        self.new_folders.clone()
    }

    pub fn logical_file(&self, lfn: &str) -> LogicalFile {
        LogicalFile::new(
            &normalize_lfn(lfn),
            self.registry.clone(),
            self.file_list_cache(),
        )
    }

    pub fn directory(&self, ldn: &str) -> LogicalDirectory {
        LogicalDirectory::new(
            &normalize_lfn(ldn),
            self.registry.clone(),
            self.file_list_cache(),
            self.new_folders.clone(),
        )
    }

    pub fn root_directory(&self) -> LogicalDirectory {
        self.directory("")
    }

    pub async fn logical_directory_size(&self, ldn: &str) -> DigsResult<u64> {
        self.directory(ldn).size().await
    }

    fn control(&self) -> DigsResult<Arc<dyn ControlChannel>> {
        match self.connection_state() {
            ConnectionState::Main => {}
            ConnectionState::Backup => return Err(DigsError::BackupNodeMode),
            ConnectionState::Disconnected => {
                return Err(DigsError::Connection("Client is not connected".to_string()))
            }
        }
        self.control.clone().ok_or(DigsError::BackupNodeMode)
    }

    /// Fails with `BackupNodeMode` before anything else when administration is unavailable.
    fn ensure_main(&self) -> DigsResult<()> {
        self.control().map(|_| ())
    }

    async fn send(&self, command: ControlCommand) -> DigsResult<()> {
        let control = self.control()?;
        debug!("sending control command: {}", command);
        send_command(control.as_ref(), &command).await
    }

    /// `false` on the backup node or on any failure.
    pub async fn ping(&self) -> bool {
        if self.control().is_err() {
            return false;
        }
        match self.send(ControlCommand::Ping).await {
            Ok(()) => true,
            Err(e) => {
                debug!("ping failed: {}", e);
                false
            }
        }
    }

    pub fn close(&self) {
        if let Some(cache) = self.cache.get() {
            cache.stop();
        }
        if let Ok(mut state) = self.state.write() {
            *state = ConnectionState::Disconnected;
        }
        info!("disconnected from {}", self.grid_node);
    }
}
