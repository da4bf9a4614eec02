//! ShareRegistry: the persisted set of locally published directories.

use std::collections::HashSet;
use std::sync::Arc;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use super::samba::{PublishedShare, SambaPublisher};
use crate::error::{StorageError, StorageResult};
use crate::flows::SharedFsFlowBus;
use crate::store::{CollectionGuard, CollectionStore, SHARED_SECRET_KEY, SHARES_KEY};
use crate::vfs::{Operations, PathResolver, VirtualPath};

/// A directory published as a network share.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareRecord {
    /// Virtual path of the shared directory. Unique.
    pub path: String,
    /// Last path segment.
    pub name: String,
    /// Name the share is published under. Unique (case-insensitive).
    pub sharename: String,
}

/// Owns `files.shares` and `files.sharedSecret`.
pub struct ShareRegistry {
    resolver: Arc<PathResolver>,
    store: Arc<CollectionStore>,
    publisher: Arc<SambaPublisher>,
}

impl std::fmt::Debug for ShareRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShareRegistry").finish_non_exhaustive()
    }
}

impl ShareRegistry {
    pub fn new(
        resolver: Arc<PathResolver>,
        store: Arc<CollectionStore>,
        publisher: Arc<SambaPublisher>,
    ) -> Self {
        Self {
            resolver,
            store,
            publisher,
        }
    }

    pub fn publisher(&self) -> &Arc<SambaPublisher> {
        &self.publisher
    }

    /// Publish the directory at `path`. Returns the assigned sharename.
    ///
    /// The share is live (daemon reloaded or started) when this returns.
    pub async fn add_share(&self, path: &str) -> StorageResult<String> {
        let (vp, real_path) = self.resolver.check(path, Operations::SHARE)?;
        PublishedShare {
            sharename: vp.name().to_string(),
            real_path,
        }
        .validate()?;
        if !self.resolver.is_directory(&vp).await {
            return Err(StorageError::NotADirectory(vp.to_string()));
        }
        let secret = self.shared_secret().await?;

        let guard = self.store.lock(SHARES_KEY).await;
        let current: Vec<ShareRecord> = guard.read()?;
        let key = vp.to_string();
        if current.iter().any(|r| r.path == key) {
            return Err(StorageError::ShareAlreadyExists(key));
        }

        let record = ShareRecord {
            path: key,
            name: vp.name().to_string(),
            sharename: unique_sharename(vp.name(), &current),
        };
        let mut next = current.clone();
        next.push(record.clone());
        self.commit(&guard, &current, &next, &secret).await?;

        tracing::info!(path = %record.path, sharename = %record.sharename, "share added");
        Ok(record.sharename)
    }

    /// Unpublish `path`. Returns `false` if it was not shared.
    pub async fn remove_share(&self, path: &str) -> StorageResult<bool> {
        let key = VirtualPath::parse(path)?.to_string();
        let secret = self.shared_secret().await?;

        let guard = self.store.lock(SHARES_KEY).await;
        let current: Vec<ShareRecord> = guard.read()?;
        let next: Vec<ShareRecord> = current.iter().filter(|r| r.path != key).cloned().collect();
        if next.len() == current.len() {
            return Ok(false);
        }
        self.commit(&guard, &current, &next, &secret).await?;

        tracing::info!(path = %key, "share removed");
        Ok(true)
    }

    /// Shares whose directory still exists. Does not persist the filtering.
    pub async fn list(&self) -> StorageResult<Vec<ShareRecord>> {
        let records: Vec<ShareRecord> = self.store.get(SHARES_KEY)?;
        let live = futures::future::join_all(records.iter().map(|r| self.is_live(r))).await;
        Ok(records
            .into_iter()
            .zip(live)
            .filter_map(|(r, live)| live.then_some(r))
            .collect())
    }

    /// The password for every share. Generated and persisted on first use.
    pub async fn shared_secret(&self) -> StorageResult<String> {
        let guard = self.store.lock(SHARED_SECRET_KEY).await;
        if let Some(secret) = guard.read::<Option<String>>()? {
            return Ok(secret);
        }
        let mut bytes = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        let secret = hex::encode(bytes);
        guard.write(&Some(&secret))?;
        tracing::info!("generated shared secret");
        Ok(secret)
    }

    /// Remove every record at or below `removed`. Returns how many went.
    pub async fn prune(&self, removed: &VirtualPath) -> StorageResult<usize> {
        let guard = self.store.lock(SHARES_KEY).await;
        let current: Vec<ShareRecord> = guard.read()?;
        let next: Vec<ShareRecord> = current
            .iter()
            .filter(|r| {
                VirtualPath::parse(&r.path)
                    .map(|vp| !vp.is_within(removed))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        let pruned = current.len() - next.len();
        if pruned == 0 {
            return Ok(0);
        }
        let secret = self.shared_secret().await?;
        self.commit(&guard, &current, &next, &secret).await?;
        Ok(pruned)
    }

    /// Re-publish persisted shares so daemon state matches after a restart.
    pub async fn restore(&self) -> StorageResult<()> {
        let guard = self.store.lock(SHARES_KEY).await;
        let records: Vec<ShareRecord> = guard.read()?;
        let secret = self.shared_secret().await?;
        let shares = self.published(&records).await;
        self.publisher.publish(&shares, &secret).await?;
        tracing::info!(shares = shares.len(), "restored local shares");
        Ok(())
    }

    /// Stop the daemons.
    pub async fn shutdown(&self) -> StorageResult<()> {
        let _guard = self.store.lock(SHARES_KEY).await;
        self.publisher.stop().await
    }

    /// Prune shares whenever their directory (or an ancestor) goes away.
    pub fn spawn_pruner(self: &Arc<Self>, bus: &SharedFsFlowBus) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let mut sub = bus.subscribe();
        tokio::spawn(async move {
            while let Some(removed) = sub.next_removed().await {
                match registry.prune(&removed).await {
                    Ok(0) => {}
                    Ok(n) => tracing::info!(path = %removed, pruned = n, "pruned shares"),
                    Err(e) => tracing::warn!(path = %removed, error = %e, "failed to prune shares"),
                }
            }
            tracing::debug!("share pruner stopped");
        })
    }

    /// Publish `next`, then persist it. Either step failing restores `previous`.
    async fn commit(
        &self,
        guard: &CollectionGuard,
        previous: &[ShareRecord],
        next: &[ShareRecord],
        secret: &str,
    ) -> StorageResult<()> {
        let shares = self.published(next).await;
        if let Err(e) = self.publisher.publish(&shares, secret).await {
            self.republish(previous, secret).await;
            return Err(e);
        }
        if let Err(e) = guard.write(next) {
            self.republish(previous, secret).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn republish(&self, records: &[ShareRecord], secret: &str) {
        let shares = self.published(records).await;
        if let Err(e) = self.publisher.publish(&shares, secret).await {
            tracing::warn!(error = %e, "failed to restore previous share configuration");
        }
    }

    /// Live records, resolved to real paths.
    async fn published(&self, records: &[ShareRecord]) -> Vec<PublishedShare> {
        let mut shares = Vec::with_capacity(records.len());
        for record in records {
            let Ok(vp) = VirtualPath::parse(&record.path) else {
                continue;
            };
            if !self.resolver.is_directory(&vp).await {
                continue;
            }
            let Ok(real_path) = self.resolver.resolve_parsed(&vp) else {
                continue;
            };
            let share = PublishedShare {
                sharename: record.sharename.clone(),
                real_path,
            };
            match share.validate() {
                Ok(()) => shares.push(share),
                Err(e) => tracing::warn!(path = ?record.path, error = %e, "not publishing share"),
            }
        }
        shares
    }

    async fn is_live(&self, record: &ShareRecord) -> bool {
        match VirtualPath::parse(&record.path) {
            Ok(vp) => self.resolver.is_directory(&vp).await,
            Err(_) => false,
        }
    }
}

/// `name`, or `name (2)`, `name (3)`, ... whichever is free first.
fn unique_sharename(name: &str, existing: &[ShareRecord]) -> String {
    let taken: HashSet<String> = existing.iter().map(|r| r.sharename.to_lowercase()).collect();
    if !taken.contains(&name.to_lowercase()) {
        return name.to_string();
    }
    let mut n = 2;
    loop {
        let candidate = format!("{name} ({n})");
        if !taken.contains(&candidate.to_lowercase()) {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flows::{FsFlow, shared_fs_flow_bus};
    use crate::shares::samba::Daemon;
    use crate::testing::{Fixture, ServiceCall};
    use std::time::Duration;

    fn record(path: &str, sharename: &str) -> ShareRecord {
        ShareRecord {
            path: path.into(),
            name: path.rsplit('/').next().unwrap_or_default().into(),
            sharename: sharename.into(),
        }
    }

    #[test]
    fn test_unique_sharename() {
        let existing = vec![record("/Home/a/same-name", "same-name")];
        assert_eq!(unique_sharename("other", &existing), "other");
        assert_eq!(unique_sharename("same-name", &existing), "same-name (2)");
        assert_eq!(unique_sharename("Same-Name", &existing), "Same-Name (2)");

        let existing = vec![
            record("/Home/a/x", "x"),
            record("/Home/b/x", "x (2)"),
            record("/Home/c/x", "x (3)"),
        ];
        assert_eq!(unique_sharename("x", &existing), "x (4)");
    }

    #[tokio::test]
    async fn test_add_same_name_twice() {
        let fx = Fixture::new();
        fx.mkdir("/Home/a/same-name");
        fx.mkdir("/Home/b/same-name");

        assert_eq!(fx.shares.add_share("/Home/a/same-name").await.unwrap(), "same-name");
        assert_eq!(
            fx.shares.add_share("/Home/b/same-name").await.unwrap(),
            "same-name (2)"
        );
        let list = fx.shares.list().await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].name, "same-name");
    }

    #[tokio::test]
    async fn test_add_rejections() {
        let fx = Fixture::new();
        fx.mkdir("/Home/docs");
        fx.mkdir("/Apps/app");
        fx.write("/Home/file.txt");

        fx.shares.add_share("/Home/docs").await.unwrap();
        assert!(matches!(
            fx.shares.add_share("/Home/docs/").await,
            Err(StorageError::ShareAlreadyExists(_))
        ));
        for path in ["/Apps/app", "/External/usb", "/Network/h/s", "/Home/../Apps/app"] {
            assert!(matches!(
                fx.shares.add_share(path).await,
                Err(StorageError::OperationNotAllowed(_))
            ), "{path}");
        }
        assert!(matches!(
            fx.shares.add_share("/Home/file.txt").await,
            Err(StorageError::NotADirectory(_))
        ));
        assert!(fx.shares.add_share("/Home/missing").await.is_err());
    }

    #[tokio::test]
    async fn test_daemon_lifecycle_follows_shares() {
        let fx = Fixture::new();
        fx.mkdir("/Home/a");
        fx.mkdir("/Home/b");

        fx.shares.add_share("/Home/a").await.unwrap();
        assert!(fx.shares.publisher().is_active().await);
        fx.shares.add_share("/Home/b").await.unwrap();
        assert!(fx.shares.remove_share("/Home/a").await.unwrap());
        assert!(fx.shares.publisher().is_active().await);
        assert!(fx.shares.remove_share("/Home/b").await.unwrap());
        assert!(!fx.shares.publisher().is_active().await);
        assert!(!fx.shares.remove_share("/Home/b").await.unwrap());

        let calls = fx.services.take();
        assert_eq!(
            calls.iter().filter(|c| **c == ServiceCall::Start(Daemon::Discovery)).count(),
            1
        );
        assert_eq!(calls.last(), Some(&ServiceCall::Stop(Daemon::Sharing)));
    }

    #[tokio::test]
    async fn test_failed_publish_leaves_state_unchanged() {
        let fx = Fixture::new();
        fx.mkdir("/Home/a");
        fx.services.fail_on(ServiceCall::Start(Daemon::Sharing));

        assert!(fx.shares.add_share("/Home/a").await.is_err());
        let stored: Vec<ShareRecord> = fx.store.get(SHARES_KEY).unwrap();
        assert!(stored.is_empty());
        assert!(!fx.shares.publisher().is_active().await);
    }

    #[tokio::test]
    async fn test_list_hides_deleted_without_persisting() {
        let fx = Fixture::new();
        fx.mkdir("/Home/X");
        fx.shares.add_share("/Home/X").await.unwrap();

        fx.rmdir("/Home/X");
        assert!(fx.shares.list().await.unwrap().is_empty());
        let stored: Vec<ShareRecord> = fx.store.get(SHARES_KEY).unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn test_prune_descendants_on_ancestor_delete() {
        let fx = Fixture::new();
        fx.mkdir("/Home/parent/a");
        fx.mkdir("/Home/parent/b");
        fx.mkdir("/Home/parentless");
        for p in ["/Home/parent/a", "/Home/parent/b", "/Home/parentless"] {
            fx.shares.add_share(p).await.unwrap();
        }

        let removed = VirtualPath::parse("/Home/parent").unwrap();
        assert_eq!(fx.shares.prune(&removed).await.unwrap(), 2);
        let stored: Vec<ShareRecord> = fx.store.get(SHARES_KEY).unwrap();
        assert_eq!(stored, vec![record("/Home/parentless", "parentless")]);
    }

    #[tokio::test]
    async fn test_pruner_reacts_to_delete_and_rename() {
        let fx = Fixture::new();
        fx.mkdir("/Home/a");
        fx.mkdir("/Home/b");
        fx.shares.add_share("/Home/a").await.unwrap();
        fx.shares.add_share("/Home/b").await.unwrap();

        let bus = shared_fs_flow_bus(16);
        let task = fx.shares.spawn_pruner(&bus);

        bus.publish(FsFlow::Deleted {
            path: VirtualPath::parse("/Home/a").unwrap(),
        });
        bus.publish(FsFlow::Renamed {
            from: VirtualPath::parse("/Home/b").unwrap(),
            to: VirtualPath::parse("/Home/c").unwrap(),
        });

        for _ in 0..100 {
            let stored: Vec<ShareRecord> = fx.store.get(SHARES_KEY).unwrap();
            if stored.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let stored: Vec<ShareRecord> = fx.store.get(SHARES_KEY).unwrap();
        assert!(stored.is_empty());
        assert!(!fx.shares.publisher().is_active().await);
        task.abort();
    }

    #[tokio::test]
    async fn test_shared_secret_is_stable() {
        let fx = Fixture::new();
        let a = fx.shares.shared_secret().await.unwrap();
        let b = fx.shares.shared_secret().await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn test_restore_republishes() {
        let fx = Fixture::new();
        fx.mkdir("/Home/a");
        fx.store
            .lock(SHARES_KEY)
            .await
            .write(&vec![record("/Home/a", "a")])
            .unwrap();

        fx.shares.restore().await.unwrap();
        assert!(fx.shares.publisher().is_active().await);
        let conf = std::fs::read_to_string(fx.samba_conf()).unwrap();
        assert!(conf.contains("[a]"));
    }

    #[tokio::test]
    async fn test_control_characters_rejected() {
        let fx = Fixture::new();
        fx.mkdir("/Home/evil]\n[global");
        assert!(matches!(
            fx.shares.add_share("/Home/evil]\n[global").await,
            Err(StorageError::OperationNotAllowed(_))
        ));
    }

    #[tokio::test]
    async fn test_newline_in_parent_cannot_inject_sections() {
        let fx = Fixture::new();
        let path = "/Home/x\n[root]\n   path = /\n#/docs";
        fx.mkdir(path);

        assert!(matches!(
            fx.shares.add_share(path).await,
            Err(StorageError::OperationNotAllowed(_))
        ));
        let stored: Vec<ShareRecord> = fx.store.get(SHARES_KEY).unwrap();
        assert!(stored.is_empty());
        let conf = std::fs::read_to_string(fx.samba_conf()).unwrap_or_default();
        assert!(!conf.contains("\n[root]\n"));
    }

    #[tokio::test]
    async fn test_restore_skips_unrenderable_records() {
        let fx = Fixture::new();
        let bad = "/Home/x\n[root]\n   path = /\n#/docs";
        fx.mkdir(bad);
        fx.mkdir("/Home/good");
        fx.store
            .lock(SHARES_KEY)
            .await
            .write(&vec![record(bad, "docs"), record("/Home/good", "good")])
            .unwrap();

        fx.shares.restore().await.unwrap();
        let conf = std::fs::read_to_string(fx.samba_conf()).unwrap();
        assert!(conf.contains("[good]"));
        assert!(!conf.contains("[docs]"));
        assert!(!conf.contains("\n[root]\n"));
    }

    #[tokio::test]
    async fn test_failed_stop_keeps_discovery_tied_to_shares() {
        let fx = Fixture::new();
        fx.mkdir("/Home/a");
        fx.mkdir("/Home/b");
        fx.shares.add_share("/Home/a").await.unwrap();

        fx.services.fail_on(ServiceCall::Stop(Daemon::Sharing));
        assert!(fx.shares.remove_share("/Home/a").await.is_err());
        fx.services.clear_failures();
        assert!(fx.shares.publisher().is_active().await);

        fx.shares.add_share("/Home/b").await.unwrap();
        assert!(fx.shares.publisher().is_active().await);
        let calls = fx.services.take();
        let last_stop = calls
            .iter()
            .rposition(|c| *c == ServiceCall::Stop(Daemon::Discovery))
            .unwrap();
        assert!(calls[last_stop..].contains(&ServiceCall::Start(Daemon::Discovery)));
    }
}
