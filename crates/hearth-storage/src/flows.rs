//! Broadcast bus for filesystem change events.
//!
//! The watcher publishes [`FsFlow`] events; the share registry and the
//! favorites index each hold their own [`Subscription`] so a failure in one
//! handler never touches the other's state.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::vfs::VirtualPath;

/// Filesystem change, in virtual-path terms.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FsFlow {
    Created { path: VirtualPath },
    Deleted { path: VirtualPath },
    /// A paired rename. Consumers treat this as a delete of `from`.
    Renamed { from: VirtualPath, to: VirtualPath },
}

impl FsFlow {
    pub fn subject(&self) -> &'static str {
        match self {
            Self::Created { .. } => "fs.created",
            Self::Deleted { .. } => "fs.deleted",
            Self::Renamed { .. } => "fs.renamed",
        }
    }

    /// The path that no longer exists after this event, if any.
    pub fn removed_path(&self) -> Option<&VirtualPath> {
        match self {
            Self::Created { .. } => None,
            Self::Deleted { path } => Some(path),
            Self::Renamed { from, .. } => Some(from),
        }
    }
}

/// Multi-subscriber bus of [`FsFlow`] events.
#[derive(Debug)]
pub struct FsFlowBus {
    tx: broadcast::Sender<FsFlow>,
}

impl FsFlowBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Returns the number of subscribers reached.
    pub fn publish(&self, flow: FsFlow) -> usize {
        self.tx.send(flow).unwrap_or(0)
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
        }
    }
}

/// One consumer's view of the bus.
#[derive(Debug)]
pub struct Subscription {
    rx: broadcast::Receiver<FsFlow>,
}

impl Subscription {
    /// Receive the next event. Returns None once the bus is gone.
    ///
    /// A subscriber that falls behind loses the overflowed events and
    /// carries on with the oldest one still buffered.
    pub async fn recv(&mut self) -> Option<FsFlow> {
        loop {
            match self.rx.recv().await {
                Ok(flow) => return Some(flow),
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(lagged = n, "filesystem event subscriber lagged behind");
                }
            }
        }
    }

    /// Receive the next path that stopped existing, skipping creations.
    pub async fn next_removed(&mut self) -> Option<VirtualPath> {
        loop {
            if let Some(removed) = self.recv().await?.removed_path() {
                return Some(removed.clone());
            }
        }
    }
}

pub type SharedFsFlowBus = Arc<FsFlowBus>;

pub fn shared_fs_flow_bus(capacity: usize) -> SharedFsFlowBus {
    Arc::new(FsFlowBus::new(capacity))
}
