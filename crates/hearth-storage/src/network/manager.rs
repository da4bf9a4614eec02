//! NetworkStorageManager: persisted remote mounts and their upkeep.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::smb::{Credentials, MountState, SmbClient};
use crate::config::NetworkConfig;
use crate::error::{StorageError, StorageResult};
use crate::store::{CollectionStore, NETWORK_SHARES_KEY};
use crate::vfs::{BaseCategory, PathResolver, VirtualPath};

/// A remote share mounted under `/Network/<host>/<share>`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkShareRecord {
    pub host: String,
    pub share: String,
    /// Always `/Network/<host>/<share>`. Unique.
    pub mount_path: String,
    #[serde(default)]
    pub username: String,
    /// Kept for remounting. Never listed.
    #[serde(default)]
    pub password: String,
}

impl NetworkShareRecord {
    fn credentials(&self) -> Credentials {
        Credentials::new(self.username.clone(), self.password.clone())
    }
}

impl std::fmt::Debug for NetworkShareRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkShareRecord")
            .field("host", &self.host)
            .field("share", &self.share)
            .field("mount_path", &self.mount_path)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// A record as listed to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkShareStatus {
    pub host: String,
    pub share: String,
    pub mount_path: String,
    pub username: String,
    pub is_mounted: bool,
}

/// Timing knobs for the manager.
#[derive(Debug, Clone, Copy)]
pub struct NetworkTimings {
    pub reconcile_interval: Duration,
    pub mount_timeout: Duration,
    pub discovery_timeout: Duration,
}

impl From<&NetworkConfig> for NetworkTimings {
    fn from(config: &NetworkConfig) -> Self {
        Self {
            reconcile_interval: config.reconcile_interval(),
            mount_timeout: config.mount_timeout(),
            discovery_timeout: config.discovery_timeout(),
        }
    }
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub checked: usize,
    pub remounted: usize,
    pub failed: usize,
}

/// Owns `files.networkShares` and every mount under the Network root.
pub struct NetworkStorageManager {
    resolver: Arc<PathResolver>,
    store: Arc<CollectionStore>,
    client: Arc<dyn SmbClient>,
    timings: NetworkTimings,
}

impl std::fmt::Debug for NetworkStorageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkStorageManager")
            .field("timings", &self.timings)
            .finish_non_exhaustive()
    }
}

impl NetworkStorageManager {
    pub fn new(
        resolver: Arc<PathResolver>,
        store: Arc<CollectionStore>,
        client: Arc<dyn SmbClient>,
        timings: NetworkTimings,
    ) -> Self {
        Self {
            resolver,
            store,
            client,
            timings,
        }
    }

    /// Hosts announcing SMB. Read-only.
    pub async fn discover_servers(&self) -> StorageResult<Vec<String>> {
        bounded(
            "discover servers",
            self.timings.discovery_timeout,
            self.client.discover_servers(),
        )
        .await
    }

    /// Shares offered by `host`. Read-only; bad credentials are `CredentialError`.
    pub async fn discover_shares(
        &self,
        host: &str,
        username: &str,
        password: &str,
    ) -> StorageResult<Vec<String>> {
        validate_component("host", host)?;
        validate_username(username)?;
        let credentials = Credentials::new(username, password);
        bounded(
            "discover shares",
            self.timings.discovery_timeout,
            self.client.list_shares(host, &credentials),
        )
        .await
    }

    /// Mount `//host/share` at `/Network/<host>/<share>` and persist it.
    ///
    /// The mount is active when this returns. On failure nothing is
    /// persisted and no directory created here survives.
    pub async fn add_network_share(
        &self,
        host: &str,
        share: &str,
        username: &str,
        password: &str,
    ) -> StorageResult<String> {
        validate_component("host", host)?;
        validate_component("share", share)?;
        validate_username(username)?;
        let vp = VirtualPath::from_parts(
            BaseCategory::Network,
            vec![host.to_string(), share.to_string()],
        );
        let mount_path = vp.to_string();

        let guard = self.store.lock(NETWORK_SHARES_KEY).await;
        let mut records: Vec<NetworkShareRecord> = guard.read()?;
        if records.iter().any(|r| r.mount_path == mount_path) {
            return Err(StorageError::NetworkShareAlreadyExists(mount_path));
        }

        let real = self.resolver.resolve_parsed(&vp)?;
        let created = self.create_mount_point(&real).await?;
        let record = NetworkShareRecord {
            host: host.to_string(),
            share: share.to_string(),
            mount_path: mount_path.clone(),
            username: username.to_string(),
            password: password.to_string(),
        };

        if let Err(e) = self.mount(&record, &real).await {
            remove_created(&created).await;
            return Err(e);
        }

        records.push(record);
        if let Err(e) = guard.write(&records) {
            if let Err(unmount_err) = self.unmount(&real).await {
                tracing::warn!(path = %mount_path, error = %unmount_err, "failed to undo mount");
            }
            remove_created(&created).await;
            return Err(e.into());
        }

        tracing::info!(path = %mount_path, host = %host, "network share mounted");
        Ok(mount_path)
    }

    /// Unmount and forget `mount_path`. Returns `false` if there was no record.
    ///
    /// Unmounting is best-effort: a record for a mount that is already gone
    /// must stay removable.
    pub async fn remove_network_share(&self, mount_path: &str) -> StorageResult<bool> {
        let key = VirtualPath::parse(mount_path)?.to_string();

        let guard = self.store.lock(NETWORK_SHARES_KEY).await;
        let mut records: Vec<NetworkShareRecord> = guard.read()?;
        let Some(pos) = records.iter().position(|r| r.mount_path == key) else {
            return Ok(false);
        };
        let record = records.remove(pos);
        self.detach(&record).await;
        guard.write(&records)?;

        tracing::info!(path = %key, "network share removed");
        Ok(true)
    }

    /// Persisted records with their current mount state.
    pub async fn list(&self) -> StorageResult<Vec<NetworkShareStatus>> {
        let records: Vec<NetworkShareRecord> = self.store.get(NETWORK_SHARES_KEY)?;
        let states =
            futures::future::join_all(records.iter().map(|r| self.record_state(r))).await;
        Ok(records
            .into_iter()
            .zip(states)
            .map(|(r, state)| NetworkShareStatus {
                host: r.host,
                share: r.share,
                mount_path: r.mount_path,
                username: r.username,
                is_mounted: state == MountState::Mounted,
            })
            .collect())
    }

    /// Fail with `NetworkUnreachable` if `path` lies on a mount that is down.
    ///
    /// Paths outside any mount (the Network root, host directories, other
    /// bases) always pass.
    pub async fn ensure_reachable(&self, path: &str) -> StorageResult<()> {
        let vp = VirtualPath::parse(path)?;
        if vp.base() != BaseCategory::Network || vp.depth() < 2 {
            return Ok(());
        }
        let mount = VirtualPath::from_parts(BaseCategory::Network, vp.segments()[..2].to_vec());
        let key = mount.to_string();

        let records: Vec<NetworkShareRecord> = self.store.get(NETWORK_SHARES_KEY)?;
        let Some(record) = records.iter().find(|r| r.mount_path == key) else {
            return Ok(());
        };
        match self.record_state(record).await {
            MountState::Mounted => Ok(()),
            _ => Err(StorageError::NetworkUnreachable(format!(
                "host is down: {}",
                record.host
            ))),
        }
    }

    /// One pass over every persisted record, remounting what has dropped.
    ///
    /// Each record is handled under the collection lock after re-reading
    /// it, so a removal that lands first is never resurrected.
    pub async fn reconcile_once(&self) -> StorageResult<ReconcileReport> {
        let snapshot: Vec<NetworkShareRecord> = self.store.get(NETWORK_SHARES_KEY)?;
        let mut report = ReconcileReport::default();

        for entry in snapshot {
            let guard = self.store.lock(NETWORK_SHARES_KEY).await;
            let current: Vec<NetworkShareRecord> = guard.read()?;
            let Some(record) = current.into_iter().find(|r| r.mount_path == entry.mount_path)
            else {
                continue;
            };
            report.checked += 1;

            let real = match self.real_path(&record) {
                Ok(real) => real,
                Err(e) => {
                    tracing::warn!(path = %record.mount_path, error = %e, "cannot resolve mount path");
                    report.failed += 1;
                    continue;
                }
            };

            match self.state(&real).await {
                MountState::Mounted => continue,
                MountState::Stale => {
                    tracing::info!(path = %record.mount_path, "mount is stale, detaching");
                    if let Err(e) = self.unmount(&real).await {
                        tracing::warn!(path = %record.mount_path, error = %e, "failed to detach stale mount");
                    }
                }
                MountState::Unmounted => {}
            }

            let remount = async {
                self.create_mount_point(&real).await?;
                self.mount(&record, &real).await
            };
            match remount.await {
                Ok(()) => {
                    report.remounted += 1;
                    tracing::info!(path = %record.mount_path, host = %record.host, "network share remounted");
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(path = %record.mount_path, host = %record.host, error = %e, "remount failed, will retry");
                }
            }
            drop(guard);
        }
        Ok(report)
    }

    /// Run [`reconcile_once`](Self::reconcile_once) every interval until stopped.
    ///
    /// Passes never overlap; ticks missed while a pass runs are skipped.
    pub fn spawn_reconciler(self: &Arc<Self>) -> ReconcilerHandle {
        let manager = Arc::clone(self);
        let period = self.timings.reconcile_interval;
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tracing::info!(interval = ?period, "reconciliation loop started");
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        match manager.reconcile_once().await {
                            Ok(report) if report.remounted > 0 || report.failed > 0 => {
                                tracing::debug!(?report, "reconciliation pass");
                            }
                            Ok(_) => {}
                            Err(e) => tracing::warn!(error = %e, "reconciliation pass failed"),
                        }
                    }
                }
            }
            tracing::info!("reconciliation loop stopped");
        });

        ReconcilerHandle {
            shutdown_tx: Some(shutdown_tx),
            task,
        }
    }

    /// Unmount every mount and remove its directory. Records are kept so the
    /// next start remounts them.
    pub async fn shutdown(&self) -> StorageResult<()> {
        let guard = self.store.lock(NETWORK_SHARES_KEY).await;
        let records: Vec<NetworkShareRecord> = guard.read()?;
        for record in &records {
            self.detach(record).await;
        }
        tracing::info!(mounts = records.len(), "network shares detached");
        Ok(())
    }

    fn real_path(&self, record: &NetworkShareRecord) -> StorageResult<PathBuf> {
        let vp = VirtualPath::parse(&record.mount_path)?;
        Ok(self.resolver.resolve_parsed(&vp)?)
    }

    async fn mount(&self, record: &NetworkShareRecord, real: &Path) -> StorageResult<()> {
        bounded(
            "mount",
            self.timings.mount_timeout,
            self.client
                .mount(&record.host, &record.share, &record.credentials(), real),
        )
        .await
    }

    async fn unmount(&self, real: &Path) -> StorageResult<()> {
        bounded(
            "unmount",
            self.timings.mount_timeout,
            self.client.unmount(real),
        )
        .await
    }

    /// Mount state; probe failures count as not mounted.
    async fn state(&self, real: &Path) -> MountState {
        match bounded(
            "mount check",
            self.timings.mount_timeout,
            self.client.mount_state(real),
        )
        .await
        {
            Ok(state) => state,
            Err(e) => {
                tracing::debug!(path = %real.display(), error = %e, "mount check failed");
                MountState::Unmounted
            }
        }
    }

    async fn record_state(&self, record: &NetworkShareRecord) -> MountState {
        match self.real_path(record) {
            Ok(real) => self.state(&real).await,
            Err(_) => MountState::Unmounted,
        }
    }

    /// Best-effort unmount, then remove the mount directory and an emptied
    /// host directory. Only empty directories are ever removed.
    async fn detach(&self, record: &NetworkShareRecord) {
        let real = match self.real_path(record) {
            Ok(real) => real,
            Err(e) => {
                tracing::warn!(path = %record.mount_path, error = %e, "cannot resolve mount path");
                return;
            }
        };
        if self.state(&real).await != MountState::Unmounted {
            if let Err(e) = self.unmount(&real).await {
                tracing::warn!(path = %record.mount_path, error = %e, "unmount failed");
            }
        }
        remove_empty_dir(&real).await;
        if let Some(host_dir) = real.parent() {
            if host_dir != self.resolver.root(BaseCategory::Network) {
                remove_empty_dir(host_dir).await;
            }
        }
    }

    /// Create the host and share directories as needed. Returns the ones
    /// created here, outermost first.
    async fn create_mount_point(&self, real: &Path) -> StorageResult<Vec<PathBuf>> {
        let mut created = Vec::new();
        let Some(host_dir) = real.parent() else {
            return Ok(created);
        };
        for dir in [host_dir, real] {
            match tokio::fs::create_dir(dir).await {
                Ok(()) => created.push(dir.to_path_buf()),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => {
                    remove_created(&created).await;
                    return Err(e.into());
                }
            }
        }
        Ok(created)
    }
}

/// Stops the reconciliation loop.
#[derive(Debug)]
pub struct ReconcilerHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ReconcilerHandle {
    /// Signal the loop and wait for an in-flight pass to finish.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            tracing::warn!(error = %e, "reconciliation task ended abnormally");
        }
    }
}

/// Run `fut`, turning an overrun of `limit` into `StorageError::Timeout`.
async fn bounded<T>(
    operation: &str,
    limit: Duration,
    fut: impl Future<Output = StorageResult<T>>,
) -> StorageResult<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(StorageError::timeout(operation, limit)),
    }
}

fn validate_component(what: &str, value: &str) -> StorageResult<()> {
    if value.is_empty()
        || value == "."
        || value == ".."
        || value.contains(['/', '\0'])
        || value.chars().any(char::is_control)
    {
        return Err(StorageError::not_allowed(format!("invalid {what}: {value:?}")));
    }
    Ok(())
}

/// Usernames end up inside a comma-separated mount option list.
fn validate_username(username: &str) -> StorageResult<()> {
    if username.contains([',', '\0']) || username.chars().any(char::is_control) {
        return Err(StorageError::not_allowed(format!("invalid username: {username:?}")));
    }
    Ok(())
}

async fn remove_created(created: &[PathBuf]) {
    for dir in created.iter().rev() {
        remove_empty_dir(dir).await;
    }
}

async fn remove_empty_dir(dir: &Path) {
    match tokio::fs::remove_dir(dir).await {
        Ok(()) => tracing::debug!(path = %dir.display(), "removed mount directory"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::debug!(path = %dir.display(), error = %e, "kept mount directory"),
    }
}
