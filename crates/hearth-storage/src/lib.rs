//! # hearth-storage
//!
//! Storage control plane for hearth.
//!
//! Every file the user sees lives under one of four virtual bases
//! (`/Home`, `/Apps`, `/External`, `/Network`). This crate owns that
//! namespace and the long-lived state hanging off it:
//! - Local directories published as SMB shares, with the sharing and
//!   discovery daemons running exactly while a share exists
//! - Remote SMB shares mounted under `/Network/<host>/<share>`, kept alive
//!   by a reconciliation loop
//! - Favorited directories
//!
//! Records are persisted per collection and pruned when the filesystem
//! watcher reports their directory gone.

pub mod config;
pub mod error;
pub mod favorites;
pub mod flows;
pub mod network;
pub mod process;
pub mod service;
pub mod shares;
pub mod store;
pub mod vfs;
pub mod watch;

#[cfg(any(test, feature = "test-mock"))]
pub mod testing;

pub use config::{ConfigError, NetworkConfig, RootsConfig, SambaConfig, ServerConfig, StorageConfig};
pub use error::{StorageError, StorageResult};
pub use favorites::FavoritesIndex;
pub use flows::{FsFlow, FsFlowBus, SharedFsFlowBus, Subscription, shared_fs_flow_bus};
pub use network::{
    CifsClient, Credentials, MountState, NetworkShareRecord, NetworkShareStatus,
    NetworkStorageManager, NetworkTimings, ReconcileReport, ReconcilerHandle, SmbClient,
};
pub use service::StorageService;
pub use shares::{
    Daemon, PublishedShare, SambaPublisher, ServiceControl, ShareRecord, ShareRegistry,
    SystemServices,
};
pub use store::{CollectionGuard, CollectionStore, StoreError, StoreResult};
pub use vfs::{
    BaseCategory, BaseRoots, Classification, Operations, PathError, PathResolver, PathResult,
    VirtualPath,
};
pub use watch::{FsWatcher, WatcherHandle};
