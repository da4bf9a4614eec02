//! Remote SMB shares mounted under the Network base.
//!
//! [`NetworkStorageManager`] owns the persisted records and every mount
//! point; [`SmbClient`] is the seam to the OS tools that discover, mount
//! and unmount. A reconciliation loop repairs mounts that dropped.

mod manager;
mod smb;

pub use manager::{
    NetworkShareRecord, NetworkShareStatus, NetworkStorageManager, NetworkTimings,
    ReconcileReport, ReconcilerHandle,
};
pub use smb::{CifsClient, Credentials, MountState, SmbClient};
