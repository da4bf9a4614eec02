//! FavoritesIndex: the persisted list of favorited directories.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::error::{StorageError, StorageResult};
use crate::flows::SharedFsFlowBus;
use crate::store::{CollectionStore, FAVORITES_KEY};
use crate::vfs::{Operations, PathResolver, VirtualPath};

/// Owns `files.favorites`, an ordered list of virtual paths.
pub struct FavoritesIndex {
    resolver: Arc<PathResolver>,
    store: Arc<CollectionStore>,
}

impl std::fmt::Debug for FavoritesIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FavoritesIndex").finish_non_exhaustive()
    }
}

impl FavoritesIndex {
    pub fn new(resolver: Arc<PathResolver>, store: Arc<CollectionStore>) -> Self {
        Self { resolver, store }
    }

    /// Favorites that are still directories. Does not persist the filtering.
    pub async fn list(&self) -> StorageResult<Vec<String>> {
        let entries: Vec<String> = self.store.get(FAVORITES_KEY)?;
        let live = futures::future::join_all(entries.iter().map(|p| self.is_live(p))).await;
        Ok(entries
            .into_iter()
            .zip(live)
            .filter_map(|(p, live)| live.then_some(p))
            .collect())
    }

    /// Favorite the directory at `path`. Idempotent.
    pub async fn add(&self, path: &str) -> StorageResult<bool> {
        let (vp, _) = self.resolver.check(path, Operations::FAVORITE)?;
        if !self.resolver.is_directory(&vp).await {
            return Err(StorageError::NotADirectory(vp.to_string()));
        }
        let key = vp.to_string();

        let guard = self.store.lock(FAVORITES_KEY).await;
        let mut entries: Vec<String> = guard.read()?;
        if entries.contains(&key) {
            return Ok(true);
        }
        entries.retain(|p| VirtualPath::parse(p).is_ok());
        entries.push(key.clone());
        guard.write(&entries)?;

        tracing::debug!(path = %key, "favorite added");
        Ok(true)
    }

    /// Unfavorite `path`. Returns `false` if it was not a favorite.
    pub async fn remove(&self, path: &str) -> StorageResult<bool> {
        let key = VirtualPath::parse(path)?.to_string();

        let guard = self.store.lock(FAVORITES_KEY).await;
        let mut entries: Vec<String> = guard.read()?;
        let before = entries.len();
        entries.retain(|p| *p != key);
        if entries.len() == before {
            return Ok(false);
        }
        guard.write(&entries)?;

        tracing::debug!(path = %key, "favorite removed");
        Ok(true)
    }

    /// Drop every favorite at or below `removed`. Returns how many went.
    pub async fn prune(&self, removed: &VirtualPath) -> StorageResult<usize> {
        let guard = self.store.lock(FAVORITES_KEY).await;
        let mut entries: Vec<String> = guard.read()?;
        let before = entries.len();
        entries.retain(|p| {
            VirtualPath::parse(p)
                .map(|vp| !vp.is_within(removed))
                .unwrap_or(false)
        });
        let pruned = before - entries.len();
        if pruned > 0 {
            guard.write(&entries)?;
        }
        Ok(pruned)
    }

    /// Prune favorites whenever their directory (or an ancestor) goes away.
    pub fn spawn_pruner(self: &Arc<Self>, bus: &SharedFsFlowBus) -> JoinHandle<()> {
        let index = Arc::clone(self);
        let mut sub = bus.subscribe();
        tokio::spawn(async move {
            while let Some(removed) = sub.next_removed().await {
                match index.prune(&removed).await {
                    Ok(0) => {}
                    Ok(n) => tracing::info!(path = %removed, pruned = n, "pruned favorites"),
                    Err(e) => tracing::warn!(path = %removed, error = %e, "failed to prune favorites"),
                }
            }
            tracing::debug!("favorites pruner stopped");
        })
    }

    async fn is_live(&self, path: &str) -> bool {
        match VirtualPath::parse(path) {
            Ok(vp) => self.resolver.is_directory(&vp).await,
            Err(_) => false,
        }
    }
}
