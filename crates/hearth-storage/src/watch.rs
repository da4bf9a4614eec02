//! Bridges `notify` into the filesystem flow bus.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, oneshot};

use crate::flows::{FsFlow, SharedFsFlowBus};
use crate::vfs::{BaseCategory, PathResolver};

/// Raw change as seen by the OS watcher, before translation.
#[derive(Debug, Clone, PartialEq, Eq)]
enum RawChange {
    Created(PathBuf),
    Deleted(PathBuf),
    Renamed(PathBuf, PathBuf),
}

/// Keeps the watcher alive. Dropping it stops event delivery.
pub struct WatcherHandle {
    _watcher: RecommendedWatcher,
    shutdown_tx: oneshot::Sender<()>,
}

impl WatcherHandle {
    /// Stop watching and end the translation task.
    pub fn stop(self) {
        let _ = self.shutdown_tx.send(());
    }
}

impl std::fmt::Debug for WatcherHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatcherHandle").finish_non_exhaustive()
    }
}

/// Recursive watcher over selected base roots.
pub struct FsWatcher;

impl FsWatcher {
    /// Watch the roots of `bases` and publish their changes on `bus` as
    /// virtual-path [`FsFlow`] events. Paths that do not map back into the
    /// namespace are dropped.
    pub fn start(
        resolver: Arc<PathResolver>,
        bus: SharedFsFlowBus,
        bases: &[BaseCategory],
    ) -> notify::Result<WatcherHandle> {
        let (tx, mut rx) = mpsc::channel::<RawChange>(1024);

        let mut watcher = RecommendedWatcher::new(
            move |result: Result<Event, notify::Error>| match result {
                Ok(event) => {
                    for change in raw_changes(event) {
                        if tx.try_send(change).is_err() {
                            tracing::warn!("filesystem event queue full, dropping event");
                        }
                    }
                }
                Err(e) => tracing::warn!(error = %e, "filesystem watcher error"),
            },
            notify::Config::default().with_poll_interval(Duration::from_millis(500)),
        )?;

        for base in bases {
            let root = resolver.root(*base);
            watcher.watch(root, RecursiveMode::Recursive)?;
            tracing::info!(base = %base, path = %root.display(), "watching base root");
        }

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        tracing::info!("filesystem watcher shutting down");
                        break;
                    }
                    Some(change) = rx.recv() => {
                        if let Some(flow) = translate(&resolver, change) {
                            tracing::debug!(subject = flow.subject(), ?flow, "filesystem change");
                            bus.publish(flow);
                        }
                    }
                    else => break,
                }
            }
        });

        Ok(WatcherHandle {
            _watcher: watcher,
            shutdown_tx,
        })
    }
}

/// Split a notify event into raw changes.
///
/// A rename reported in halves becomes a delete of the old path and a
/// create of the new one.
fn raw_changes(event: Event) -> Vec<RawChange> {
    let mut paths = event.paths.into_iter();
    match event.kind {
        EventKind::Create(_) => paths.map(RawChange::Created).collect(),
        EventKind::Remove(_) => paths.map(RawChange::Deleted).collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            paths.map(RawChange::Deleted).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            paths.map(RawChange::Created).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            match (paths.next(), paths.next()) {
                (Some(from), Some(to)) => vec![RawChange::Renamed(from, to)],
                _ => Vec::new(),
            }
        }
        EventKind::Modify(ModifyKind::Name(_)) => paths
            .map(|p| {
                if p.exists() {
                    RawChange::Created(p)
                } else {
                    RawChange::Deleted(p)
                }
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn translate(resolver: &PathResolver, change: RawChange) -> Option<FsFlow> {
    match change {
        RawChange::Created(p) => resolver.to_virtual(&p).ok().map(|path| FsFlow::Created { path }),
        RawChange::Deleted(p) => resolver.to_virtual(&p).ok().map(|path| FsFlow::Deleted { path }),
        RawChange::Renamed(from, to) => match (resolver.to_virtual(&from), resolver.to_virtual(&to)) {
            (Ok(from), Ok(to)) => Some(FsFlow::Renamed { from, to }),
            (Ok(from), Err(_)) => Some(FsFlow::Deleted { path: from }),
            (Err(_), Ok(to)) => Some(FsFlow::Created { path: to }),
            (Err(_), Err(_)) => None,
        },
    }
}
