//! End-to-end tests of the RPC surface over in-process OS fakes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use hearth_server::{Request, RpcError, dispatch};
use hearth_storage::testing::{FakeSmbClient, RecordingServices, storage_config};
use hearth_storage::{Operations, StorageError, StorageService};
use serde_json::{Value, json};
use tempfile::TempDir;

struct Harness {
    dir: TempDir,
    smb: Arc<FakeSmbClient>,
    service: StorageService,
}

impl Harness {
    async fn start() -> Self {
        let dir = TempDir::new().unwrap();
        let smb = Arc::new(FakeSmbClient::default());
        let service = open(dir.path(), &smb);
        service.start().await.unwrap();
        Self { dir, smb, service }
    }

    async fn call(&self, request: Value) -> Result<Value, RpcError> {
        let request: Request = serde_json::from_value(request).unwrap();
        dispatch(&self.service, request).await
    }

    fn home(&self, rel: &str) -> PathBuf {
        self.dir.path().join("home").join(rel)
    }

    fn network(&self) -> PathBuf {
        self.dir.path().join("network")
    }
}

fn open(dir: &Path, smb: &Arc<FakeSmbClient>) -> StorageService {
    StorageService::new(
        storage_config(dir),
        smb.clone(),
        Arc::new(RecordingServices::default()),
    )
    .unwrap()
}

fn code(result: Result<Value, RpcError>) -> String {
    result.expect_err("expected an error").code
}

async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    check().await
}

fn is_mounted(list: &Value, mount_path: &str) -> bool {
    list.as_array()
        .into_iter()
        .flatten()
        .any(|r| r["mountPath"] == mount_path && r["isMounted"] == true)
}

#[tokio::test]
async fn test_traversal_and_relative_paths_rejected() {
    let h = Harness::start().await;
    std::fs::create_dir_all(h.home("docs")).unwrap();

    for path in ["/Home/../Apps", "/Home/docs/../docs", "Home/docs", "docs", "", "/Home/./docs"] {
        assert_eq!(
            code(h.call(json!({"method": "shares.add", "params": {"path": path}})).await),
            "operation-not-allowed",
            "{path:?}"
        );
        assert_eq!(
            code(h.call(json!({"method": "favorites.add", "params": {"path": path}})).await),
            "operation-not-allowed",
            "{path:?}"
        );
    }
}

#[tokio::test]
async fn test_symlink_escape_rejected() {
    let h = Harness::start().await;
    let outside = h.dir.path().join("outside");
    std::fs::create_dir_all(outside.join("inner")).unwrap();
    std::os::unix::fs::symlink(&outside, h.home("escape")).unwrap();

    for path in ["/Home/escape", "/Home/escape/inner"] {
        assert_eq!(
            code(h.call(json!({"method": "shares.add", "params": {"path": path}})).await),
            "operation-not-allowed"
        );
        assert_eq!(
            code(h.call(json!({"method": "favorites.add", "params": {"path": path}})).await),
            "operation-not-allowed"
        );
        assert!(matches!(
            h.service.resolver().check(path, Operations::DELETE),
            Err(StorageError::OperationNotAllowed(_))
        ));
    }
}

#[tokio::test]
async fn test_deleted_share_disappears_from_list() {
    let h = Harness::start().await;
    std::fs::create_dir_all(h.home("X")).unwrap();
    h.call(json!({"method": "shares.add", "params": {"path": "/Home/X"}}))
        .await
        .unwrap();

    std::fs::remove_dir(h.home("X")).unwrap();
    let list = h.call(json!({"method": "shares.list"})).await.unwrap();
    assert_eq!(list, json!([]));
}

#[tokio::test]
async fn test_same_name_shares_get_suffix() {
    let h = Harness::start().await;
    std::fs::create_dir_all(h.home("a/same-name")).unwrap();
    std::fs::create_dir_all(h.home("b/same-name")).unwrap();

    let first = h
        .call(json!({"method": "shares.add", "params": {"path": "/Home/a/same-name"}}))
        .await
        .unwrap();
    let second = h
        .call(json!({"method": "shares.add", "params": {"path": "/Home/b/same-name"}}))
        .await
        .unwrap();
    assert_eq!(first, json!("same-name"));
    assert_eq!(second, json!("same-name (2)"));

    assert_eq!(
        code(h.call(json!({"method": "shares.add", "params": {"path": "/Home/a/same-name"}})).await),
        "share-already-exists"
    );
    let password = h.call(json!({"method": "shares.password"})).await.unwrap();
    assert_eq!(password, h.call(json!({"method": "shares.password"})).await.unwrap());
}

#[tokio::test]
async fn test_network_add_and_duplicate() {
    let h = Harness::start().await;
    h.smb.add_host("h", "amy", "pw", &["s"]);

    let add = json!({"method": "network.add", "params": {"host": "h", "share": "s", "username": "amy", "password": "pw"}});
    assert_eq!(h.call(add.clone()).await.unwrap(), json!("/Network/h/s"));
    assert_eq!(code(h.call(add).await), "network-share-already-exists");

    let list = h.call(json!({"method": "network.list"})).await.unwrap();
    assert!(is_mounted(&list, "/Network/h/s"));
    assert!(list[0].get("password").is_none());
}

#[tokio::test]
async fn test_failed_network_add_leaves_no_trace() {
    let h = Harness::start().await;
    let result = h
        .call(json!({"method": "network.add", "params": {"host": "unreachable", "share": "s"}}))
        .await;
    assert_eq!(code(result), "network-unreachable");

    assert_eq!(std::fs::read_dir(h.network()).unwrap().count(), 0);
    assert_eq!(h.call(json!({"method": "network.list"})).await.unwrap(), json!([]));
}

#[tokio::test]
async fn test_discover_shares_reports_credential_error() {
    let h = Harness::start().await;
    h.smb.add_host("nas", "amy", "pw", &["media", "print$"]);

    let servers = h.call(json!({"method": "network.discoverServers"})).await.unwrap();
    assert_eq!(servers, json!(["nas"]));
    let bad = h
        .call(json!({"method": "network.discoverShares", "params": {"host": "nas", "username": "amy", "password": "nope"}}))
        .await;
    assert_eq!(code(bad), "credential-error");
    let good = h
        .call(json!({"method": "network.discoverShares", "params": {"host": "nas", "username": "amy", "password": "pw"}}))
        .await
        .unwrap();
    assert!(good.as_array().unwrap().contains(&json!("media")));
}

#[tokio::test]
async fn test_reconciliation_heals_removed_remote_share() {
    let h = Harness::start().await;
    h.smb.add_host("h", "", "", &["s"]);
    h.call(json!({"method": "network.add", "params": {"host": "h", "share": "s"}}))
        .await
        .unwrap();
    let list = h.call(json!({"method": "network.list"})).await.unwrap();
    assert!(is_mounted(&list, "/Network/h/s"));

    h.smb.remove_share("h", "s");
    let down = wait_until(Duration::from_secs(5), || async {
        matches!(
            h.service.network().ensure_reachable("/Network/h/s").await,
            Err(StorageError::NetworkUnreachable(_))
        )
    })
    .await;
    assert!(down, "mount should report host down once the share is gone");

    h.smb.add_share("h", "s");
    let healed = wait_until(Duration::from_secs(5), || async {
        let list = h.call(json!({"method": "network.list"})).await.unwrap();
        is_mounted(&list, "/Network/h/s")
    })
    .await;
    assert!(healed, "reconciliation should remount without a new call");
}

#[tokio::test]
async fn test_network_mount_levels_are_protected() {
    let h = Harness::start().await;
    h.smb.add_host("h", "", "", &["s"]);
    h.call(json!({"method": "network.add", "params": {"host": "h", "share": "s"}}))
        .await
        .unwrap();

    let resolver = h.service.resolver();
    for path in ["/Network", "/Network/h", "/Network/h/s"] {
        for op in [
            Operations::TRASH,
            Operations::DELETE,
            Operations::MOVE,
            Operations::RENAME,
        ] {
            assert!(
                matches!(resolver.check(path, op), Err(StorageError::OperationNotAllowed(_))),
                "{path} {op:?}"
            );
        }
    }
    for sibling in ["/Network/other-host", "/Network/h/other-share"] {
        assert!(matches!(
            resolver.check(sibling, Operations::CREATE),
            Err(StorageError::OperationNotAllowed(_))
        ));
    }
    assert!(resolver.check("/Network/h/s/inside", Operations::CREATE).is_ok());

    assert_eq!(
        code(h.call(json!({"method": "shares.add", "params": {"path": "/Network/h/s"}})).await),
        "operation-not-allowed"
    );
}

#[tokio::test]
async fn test_shutdown_removes_mounts_and_restart_restores_them() {
    let h = Harness::start().await;
    h.smb.add_host("h", "", "", &["s"]);
    h.call(json!({"method": "network.add", "params": {"host": "h", "share": "s"}}))
        .await
        .unwrap();
    let mount_point = h.network().join("h").join("s");
    assert!(mount_point.is_dir());

    h.service.shutdown().await.unwrap();
    assert!(!mount_point.exists());
    assert_eq!(h.smb.mount_count(), 0);

    let restarted = open(h.dir.path(), &h.smb);
    restarted.start().await.unwrap();
    let back = wait_until(Duration::from_secs(5), || async {
        let list = dispatch(&restarted, Request::NetworkList).await.unwrap();
        is_mounted(&list, "/Network/h/s")
    })
    .await;
    assert!(back);
    assert!(mount_point.is_dir());
    restarted.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_network_remove() {
    let h = Harness::start().await;
    h.smb.add_host("h", "", "", &["s"]);
    h.call(json!({"method": "network.add", "params": {"host": "h", "share": "s"}}))
        .await
        .unwrap();

    let remove = json!({"method": "network.remove", "params": {"mountPath": "/Network/h/s"}});
    assert_eq!(h.call(remove.clone()).await.unwrap(), json!(true));
    assert_eq!(h.call(remove).await.unwrap(), json!(false));
    assert_eq!(std::fs::read_dir(h.network()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_favorites() {
    let h = Harness::start().await;
    std::fs::create_dir_all(h.home("photos")).unwrap();
    std::fs::create_dir_all(h.dir.path().join("apps/app")).unwrap();

    let add = json!({"method": "favorites.add", "params": {"path": "/Home/photos"}});
    assert_eq!(h.call(add.clone()).await.unwrap(), json!(true));
    assert_eq!(h.call(add).await.unwrap(), json!(true));
    assert_eq!(
        h.call(json!({"method": "favorites.list"})).await.unwrap(),
        json!(["/Home/photos"])
    );

    assert_eq!(
        code(h.call(json!({"method": "favorites.add", "params": {"path": "/Apps/app"}})).await),
        "operation-not-allowed"
    );

    let remove = json!({"method": "favorites.remove", "params": {"path": "/Home/photos"}});
    assert_eq!(h.call(remove.clone()).await.unwrap(), json!(true));
    assert_eq!(h.call(remove).await.unwrap(), json!(false));
}

#[tokio::test]
async fn test_watcher_prunes_deleted_parent() {
    let h = Harness::start().await;
    std::fs::create_dir_all(h.home("parent/child")).unwrap();
    h.call(json!({"method": "shares.add", "params": {"path": "/Home/parent/child"}}))
        .await
        .unwrap();
    h.call(json!({"method": "favorites.add", "params": {"path": "/Home/parent/child"}}))
        .await
        .unwrap();

    std::fs::remove_dir_all(h.home("parent")).unwrap();
    let pruned = wait_until(Duration::from_secs(5), || async {
        let shares: Vec<Value> = h
            .service
            .store()
            .get(hearth_storage::store::SHARES_KEY)
            .unwrap();
        let favorites: Vec<String> = h
            .service
            .store()
            .get(hearth_storage::store::FAVORITES_KEY)
            .unwrap();
        shares.is_empty() && favorites.is_empty()
    })
    .await;
    assert!(pruned, "persisted records should be pruned by the watcher");
}
