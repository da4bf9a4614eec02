//! Local share publication.
//!
//! - [`ShareRegistry`] - persisted share records, naming, shared secret,
//!   reactive pruning
//! - [`SambaPublisher`] - daemon configuration and lifecycle

mod registry;
mod samba;

pub use registry::{ShareRecord, ShareRegistry};
pub use samba::{Daemon, PublishedShare, SambaPublisher, ServiceControl, SystemServices};
