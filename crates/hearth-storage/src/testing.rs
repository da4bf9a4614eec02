//! In-process fakes for the OS seams, and a fixture wiring them up.
//!
//! Available to this crate's tests and, behind the `test-mock` feature,
//! to downstream integration tests.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;

use crate::config::{NetworkConfig, RootsConfig, SambaConfig, ServerConfig, StorageConfig};
use crate::error::{StorageError, StorageResult};
use crate::favorites::FavoritesIndex;
use crate::network::{Credentials, MountState, NetworkStorageManager, NetworkTimings, SmbClient};
use crate::shares::{Daemon, SambaPublisher, ServiceControl, ShareRegistry};
use crate::store::CollectionStore;
use crate::vfs::{BaseCategory, PathResolver, VirtualPath};

/// A recorded [`ServiceControl`] call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ServiceCall {
    Start(Daemon),
    Stop(Daemon),
    Reload(Daemon),
    SetPassword(String),
}

/// [`ServiceControl`] that records calls and fails on request.
#[derive(Debug, Default)]
pub struct RecordingServices {
    calls: Mutex<Vec<ServiceCall>>,
    failures: Mutex<HashSet<ServiceCall>>,
}

impl RecordingServices {
    /// Drain the calls recorded so far.
    pub fn take(&self) -> Vec<ServiceCall> {
        std::mem::take(&mut *self.calls.lock())
    }

    /// Make every future `call` fail.
    pub fn fail_on(&self, call: ServiceCall) {
        self.failures.lock().insert(call);
    }

    pub fn clear_failures(&self) {
        self.failures.lock().clear();
    }

    fn record(&self, call: ServiceCall) -> StorageResult<()> {
        let fail = self.failures.lock().contains(&call);
        self.calls.lock().push(call.clone());
        if fail {
            return Err(StorageError::command("fake", format!("injected failure: {call:?}")));
        }
        Ok(())
    }
}

#[async_trait]
impl ServiceControl for RecordingServices {
    async fn start(&self, daemon: Daemon) -> StorageResult<()> {
        self.record(ServiceCall::Start(daemon))
    }

    async fn stop(&self, daemon: Daemon) -> StorageResult<()> {
        self.record(ServiceCall::Stop(daemon))
    }

    async fn reload(&self, daemon: Daemon) -> StorageResult<()> {
        self.record(ServiceCall::Reload(daemon))
    }

    async fn set_password(&self, user: &str, _secret: &str) -> StorageResult<()> {
        self.record(ServiceCall::SetPassword(user.to_string()))
    }
}

#[derive(Debug, Default)]
struct FakeHost {
    credentials: Credentials,
    shares: BTreeSet<String>,
}

#[derive(Debug)]
struct FakeMount {
    host: String,
    share: String,
    alive: bool,
}

#[derive(Debug, Default)]
struct FakeNetwork {
    hosts: BTreeMap<String, FakeHost>,
    mounts: HashMap<PathBuf, FakeMount>,
    fail_unmounts: bool,
    mount_delay: Option<Duration>,
}

/// [`SmbClient`] simulating a LAN of hosts in memory.
///
/// Hosts accept only their configured credentials (any, for guest hosts).
/// Removing a share kills its existing mounts: they stay in the "mount
/// table" but report [`MountState::Stale`] until detached.
#[derive(Debug, Default)]
pub struct FakeSmbClient {
    net: Mutex<FakeNetwork>,
}

impl FakeSmbClient {
    /// Add a host. An empty `username` makes it a guest host.
    pub fn add_host(&self, host: &str, username: &str, password: &str, shares: &[&str]) {
        self.net.lock().hosts.insert(
            host.to_string(),
            FakeHost {
                credentials: Credentials::new(username, password),
                shares: shares.iter().map(|s| s.to_string()).collect(),
            },
        );
    }

    /// Take a host off the network. Its mounts go stale.
    pub fn remove_host(&self, host: &str) {
        let mut net = self.net.lock();
        net.hosts.remove(host);
        for mount in net.mounts.values_mut().filter(|m| m.host == host) {
            mount.alive = false;
        }
    }

    pub fn add_share(&self, host: &str, share: &str) {
        if let Some(h) = self.net.lock().hosts.get_mut(host) {
            h.shares.insert(share.to_string());
        }
    }

    /// Stop offering `share`. Its mounts go stale.
    pub fn remove_share(&self, host: &str, share: &str) {
        let mut net = self.net.lock();
        if let Some(h) = net.hosts.get_mut(host) {
            h.shares.remove(share);
        }
        for mount in net
            .mounts
            .values_mut()
            .filter(|m| m.host == host && m.share == share)
        {
            mount.alive = false;
        }
    }

    /// Forget every mount, as if the kernel dropped them silently.
    pub fn drop_mounts(&self) {
        self.net.lock().mounts.clear();
    }

    pub fn fail_unmounts(&self, fail: bool) {
        self.net.lock().fail_unmounts = fail;
    }

    pub fn set_mount_delay(&self, delay: Duration) {
        self.net.lock().mount_delay = Some(delay);
    }

    pub fn is_mounted_at(&self, mount_point: &Path) -> bool {
        self.net.lock().mounts.contains_key(mount_point)
    }

    pub fn mount_count(&self) -> usize {
        self.net.lock().mounts.len()
    }

    fn authenticate(net: &FakeNetwork, host: &str, credentials: &Credentials) -> StorageResult<()> {
        let Some(h) = net.hosts.get(host) else {
            return Err(StorageError::NetworkUnreachable(host.to_string()));
        };
        if !h.credentials.is_guest() && h.credentials != *credentials {
            return Err(StorageError::CredentialError(host.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SmbClient for FakeSmbClient {
    async fn discover_servers(&self) -> StorageResult<Vec<String>> {
        Ok(self.net.lock().hosts.keys().cloned().collect())
    }

    async fn list_shares(&self, host: &str, credentials: &Credentials) -> StorageResult<Vec<String>> {
        let net = self.net.lock();
        Self::authenticate(&net, host, credentials)?;
        Ok(net
            .hosts
            .get(host)
            .map(|h| h.shares.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn mount(
        &self,
        host: &str,
        share: &str,
        credentials: &Credentials,
        mount_point: &Path,
    ) -> StorageResult<()> {
        let delay = self.net.lock().mount_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut net = self.net.lock();
        Self::authenticate(&net, host, credentials)?;
        if !net.hosts.get(host).is_some_and(|h| h.shares.contains(share)) {
            return Err(StorageError::command("mount", "NT_STATUS_BAD_NETWORK_NAME"));
        }
        if !mount_point.is_dir() {
            return Err(StorageError::command("mount", "mount point does not exist"));
        }
        if net.mounts.contains_key(mount_point) {
            return Err(StorageError::command("mount", "device or resource busy"));
        }
        net.mounts.insert(
            mount_point.to_path_buf(),
            FakeMount {
                host: host.to_string(),
                share: share.to_string(),
                alive: true,
            },
        );
        Ok(())
    }

    async fn unmount(&self, mount_point: &Path) -> StorageResult<()> {
        let mut net = self.net.lock();
        if net.fail_unmounts {
            return Err(StorageError::command("umount", "target is busy"));
        }
        match net.mounts.remove(mount_point) {
            Some(_) => Ok(()),
            None => Err(StorageError::command("umount", "not mounted")),
        }
    }

    async fn mount_state(&self, mount_point: &Path) -> StorageResult<MountState> {
        Ok(match self.net.lock().mounts.get(mount_point) {
            Some(m) if m.alive => MountState::Mounted,
            Some(_) => MountState::Stale,
            None => MountState::Unmounted,
        })
    }
}

/// Real base roots under a temp dir, an in-memory store, and every
/// component wired to the fakes.
pub struct Fixture {
    pub dir: TempDir,
    pub resolver: Arc<PathResolver>,
    pub store: Arc<CollectionStore>,
    pub services: Arc<RecordingServices>,
    pub smb: Arc<FakeSmbClient>,
    pub shares: Arc<ShareRegistry>,
    pub favorites: Arc<FavoritesIndex>,
    pub network: Arc<NetworkStorageManager>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_reconcile_interval(Duration::from_millis(50))
    }

    pub fn with_reconcile_interval(reconcile_interval: Duration) -> Self {
        let dir = tempfile::tempdir().expect("create fixture tempdir");
        let config = storage_config(dir.path());
        for root in [
            &config.roots.home,
            &config.roots.apps,
            &config.roots.external,
            &config.roots.network,
        ] {
            std::fs::create_dir_all(root).expect("create base root");
        }

        let resolver = Arc::new(PathResolver::new(config.roots.to_base_roots()));
        let store = Arc::new(CollectionStore::in_memory().expect("open in-memory store"));
        let services = Arc::new(RecordingServices::default());
        let smb = Arc::new(FakeSmbClient::default());
        let publisher = Arc::new(SambaPublisher::new(config.samba.clone(), services.clone()));
        let shares = Arc::new(ShareRegistry::new(
            resolver.clone(),
            store.clone(),
            publisher,
        ));
        let favorites = Arc::new(FavoritesIndex::new(resolver.clone(), store.clone()));
        let network = Arc::new(NetworkStorageManager::new(
            resolver.clone(),
            store.clone(),
            smb.clone(),
            NetworkTimings {
                reconcile_interval,
                mount_timeout: Duration::from_millis(500),
                discovery_timeout: Duration::from_millis(500),
            },
        ));

        Self {
            dir,
            resolver,
            store,
            services,
            smb,
            shares,
            favorites,
            network,
        }
    }

    /// Real path behind `vpath`.
    pub fn real(&self, vpath: &str) -> PathBuf {
        let vp = VirtualPath::parse(vpath).expect("valid virtual path");
        let mut real = self.resolver.root(vp.base()).to_path_buf();
        real.extend(vp.segments());
        real
    }

    pub fn mkdir(&self, vpath: &str) -> PathBuf {
        let real = self.real(vpath);
        std::fs::create_dir_all(&real).expect("mkdir");
        real
    }

    pub fn rmdir(&self, vpath: &str) {
        std::fs::remove_dir_all(self.real(vpath)).expect("rmdir");
    }

    pub fn write(&self, vpath: &str) -> PathBuf {
        let real = self.real(vpath);
        if let Some(parent) = real.parent() {
            std::fs::create_dir_all(parent).expect("mkdir parent");
        }
        std::fs::write(&real, b"hearth").expect("write file");
        real
    }

    /// Where the publisher renders the daemon configuration.
    pub fn samba_conf(&self) -> PathBuf {
        self.dir.path().join("samba").join("smb.conf")
    }

    pub fn base_root(&self, base: BaseCategory) -> &Path {
        self.resolver.root(base)
    }
}

impl Default for Fixture {
    fn default() -> Self {
        Self::new()
    }
}

/// A complete config rooted at `dir`, with daemon commands that do nothing.
pub fn storage_config(dir: &Path) -> StorageConfig {
    let noop = || vec!["true".to_string()];
    StorageConfig {
        roots: RootsConfig {
            home: dir.join("home"),
            apps: dir.join("apps"),
            external: dir.join("external"),
            network: dir.join("network"),
        },
        state_db: dir.join("state").join("hearth.db"),
        samba: SambaConfig {
            config_path: dir.join("samba").join("smb.conf"),
            start_sharing: noop(),
            stop_sharing: noop(),
            reload_sharing: noop(),
            start_discovery: noop(),
            stop_discovery: noop(),
            set_password: noop(),
            ..SambaConfig::default()
        },
        network: NetworkConfig {
            reconcile_interval_secs: 1,
            mount_timeout_secs: 1,
            discovery_timeout_secs: 1,
            ..NetworkConfig::default()
        },
        server: ServerConfig {
            socket_path: dir.join("hearth.sock"),
        },
    }
}
