//! StorageService: wires the components together and owns their lifecycle.

use std::sync::Arc;

use strum::IntoEnumIterator;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::StorageConfig;
use crate::error::StorageResult;
use crate::favorites::FavoritesIndex;
use crate::flows::{SharedFsFlowBus, shared_fs_flow_bus};
use crate::network::{
    CifsClient, NetworkStorageManager, NetworkTimings, ReconcilerHandle, SmbClient,
};
use crate::shares::{SambaPublisher, ServiceControl, ShareRegistry, SystemServices};
use crate::store::CollectionStore;
use crate::vfs::{BaseCategory, PathResolver};
use crate::watch::{FsWatcher, WatcherHandle};

/// Capacity of the filesystem event bus.
const FS_BUS_CAPACITY: usize = 1024;

/// Bases whose changes feed share and favorite pruning.
const WATCHED_BASES: &[BaseCategory] = &[BaseCategory::Home];

/// Tasks started by [`StorageService::start`].
struct Background {
    pruners: Vec<JoinHandle<()>>,
    reconciler: ReconcilerHandle,
    watcher: Option<WatcherHandle>,
}

/// The storage control plane.
pub struct StorageService {
    config: StorageConfig,
    resolver: Arc<PathResolver>,
    store: Arc<CollectionStore>,
    bus: SharedFsFlowBus,
    shares: Arc<ShareRegistry>,
    favorites: Arc<FavoritesIndex>,
    network: Arc<NetworkStorageManager>,
    /// Held across `start` and `shutdown` so they never interleave.
    background: Mutex<Option<Background>>,
}

impl std::fmt::Debug for StorageService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageService")
            .field("roots", &self.config.roots)
            .field("state_db", &self.config.state_db)
            .finish_non_exhaustive()
    }
}

impl StorageService {
    /// Build the service over explicit OS seams.
    ///
    /// Creates the base roots if missing and opens the state database.
    pub fn new(
        config: StorageConfig,
        smb: Arc<dyn SmbClient>,
        services: Arc<dyn ServiceControl>,
    ) -> StorageResult<Self> {
        let roots = config.roots.to_base_roots();
        for base in BaseCategory::iter() {
            std::fs::create_dir_all(roots.get(base))?;
        }

        let resolver = Arc::new(PathResolver::new(roots));
        let store = Arc::new(CollectionStore::open(&config.state_db)?);
        let publisher = Arc::new(SambaPublisher::new(config.samba.clone(), services));
        let shares = Arc::new(ShareRegistry::new(
            resolver.clone(),
            store.clone(),
            publisher,
        ));
        let favorites = Arc::new(FavoritesIndex::new(resolver.clone(), store.clone()));
        let network = Arc::new(NetworkStorageManager::new(
            resolver.clone(),
            store.clone(),
            smb,
            NetworkTimings::from(&config.network),
        ));

        Ok(Self {
            config,
            resolver,
            store,
            bus: shared_fs_flow_bus(FS_BUS_CAPACITY),
            shares,
            favorites,
            network,
            background: Mutex::new(None),
        })
    }

    /// Build the service over the system tools named in `config`.
    pub fn system(config: StorageConfig) -> StorageResult<Self> {
        let smb = Arc::new(CifsClient::new(config.network.clone()));
        let services = Arc::new(SystemServices::new(config.samba.clone()));
        Self::new(config, smb, services)
    }

    /// Restore published shares and start pruning, reconciliation and
    /// filesystem watching. Calling it twice is a no-op.
    pub async fn start(&self) -> StorageResult<()> {
        let mut background = self.background.lock().await;
        if background.is_some() {
            return Ok(());
        }

        if let Err(e) = self.shares.restore().await {
            tracing::warn!(error = %e, "failed to restore local shares");
        }

        let pruners = vec![
            self.shares.spawn_pruner(&self.bus),
            self.favorites.spawn_pruner(&self.bus),
        ];
        let reconciler = self.network.spawn_reconciler();
        let watcher = match FsWatcher::start(self.resolver.clone(), self.bus.clone(), WATCHED_BASES) {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::warn!(error = %e, "filesystem watcher unavailable, pruning on events disabled");
                None
            }
        };

        *background = Some(Background {
            pruners,
            reconciler,
            watcher,
        });
        tracing::info!("storage service started");
        Ok(())
    }

    /// Stop background work, detach every network mount and stop the
    /// sharing daemons. Persisted records are kept.
    pub async fn shutdown(&self) -> StorageResult<()> {
        let mut background = self.background.lock().await;
        if let Some(bg) = background.take() {
            if let Some(watcher) = bg.watcher {
                watcher.stop();
            }
            bg.reconciler.stop().await;
            for task in bg.pruners {
                task.abort();
            }
        }

        let network = self.network.shutdown().await;
        let shares = self.shares.shutdown().await;
        drop(background);
        tracing::info!("storage service stopped");
        network.and(shares)
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn resolver(&self) -> &Arc<PathResolver> {
        &self.resolver
    }

    pub fn store(&self) -> &Arc<CollectionStore> {
        &self.store
    }

    /// Filesystem change bus. Other file operations publish here too.
    pub fn bus(&self) -> &SharedFsFlowBus {
        &self.bus
    }

    pub fn shares(&self) -> &Arc<ShareRegistry> {
        &self.shares
    }

    pub fn favorites(&self) -> &Arc<FavoritesIndex> {
        &self.favorites
    }

    pub fn network(&self) -> &Arc<NetworkStorageManager> {
        &self.network
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flows::FsFlow;
    use crate::store::SHARES_KEY;
    use crate::shares::{Daemon, ShareRecord};
    use crate::testing::{FakeSmbClient, RecordingServices, ServiceCall, storage_config};
    use crate::vfs::VirtualPath;
    use std::time::Duration;
    use tempfile::TempDir;

    fn service(dir: &TempDir) -> (StorageService, Arc<FakeSmbClient>) {
        let smb = Arc::new(FakeSmbClient::default());
        let service = StorageService::new(
            storage_config(dir.path()),
            smb.clone(),
            Arc::new(RecordingServices::default()),
        )
        .unwrap();
        (service, smb)
    }

    #[tokio::test]
    async fn test_new_creates_roots() {
        let dir = TempDir::new().unwrap();
        let (service, _) = service(&dir);
        for base in BaseCategory::iter() {
            assert!(service.resolver().root(base).is_dir(), "{base}");
        }
    }

    #[tokio::test]
    async fn test_bus_events_prune_shares() {
        let dir = TempDir::new().unwrap();
        let (service, _) = service(&dir);
        std::fs::create_dir_all(dir.path().join("home/docs")).unwrap();
        service.start().await.unwrap();
        service.shares().add_share("/Home/docs").await.unwrap();

        service.bus().publish(FsFlow::Deleted {
            path: VirtualPath::parse("/Home").unwrap(),
        });
        for _ in 0..100 {
            let stored: Vec<ShareRecord> = service.store().get(SHARES_KEY).unwrap();
            if stored.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let stored: Vec<ShareRecord> = service.store().get(SHARES_KEY).unwrap();
        assert!(stored.is_empty());
        service.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_remounts_network_shares() {
        let dir = TempDir::new().unwrap();
        let (service, smb) = service(&dir);
        smb.add_host("nas", "", "", &["media"]);
        service.start().await.unwrap();
        service
            .network()
            .add_network_share("nas", "media", "", "")
            .await
            .unwrap();
        let mount_point = dir.path().join("network/nas/media");
        assert!(mount_point.is_dir());

        service.shutdown().await.unwrap();
        assert!(!mount_point.exists());
        assert_eq!(smb.mount_count(), 0);
        drop(service);

        let restarted = StorageService::new(
            storage_config(dir.path()),
            smb.clone(),
            Arc::new(RecordingServices::default()),
        )
        .unwrap();
        assert!(!restarted.network().list().await.unwrap()[0].is_mounted);
        restarted.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(restarted.network().list().await.unwrap()[0].is_mounted);
        restarted.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_start_spawns_once() {
        let dir = TempDir::new().unwrap();
        let services = Arc::new(RecordingServices::default());
        let service = StorageService::new(
            storage_config(dir.path()),
            Arc::new(FakeSmbClient::default()),
            services.clone(),
        )
        .unwrap();
        std::fs::create_dir_all(dir.path().join("home/docs")).unwrap();
        service
            .store()
            .lock(SHARES_KEY)
            .await
            .write(&vec![ShareRecord {
                path: "/Home/docs".into(),
                name: "docs".into(),
                sharename: "docs".into(),
            }])
            .unwrap();

        let (a, b) = tokio::join!(service.start(), service.start());
        a.unwrap();
        b.unwrap();
        assert_eq!(
            services.take(),
            vec![
                ServiceCall::SetPassword("hearth".into()),
                ServiceCall::Start(Daemon::Sharing),
                ServiceCall::Start(Daemon::Discovery),
            ]
        );
        service.shutdown().await.unwrap();
    }
}
