//! Virtual filesystem namespace.
//!
//! Four bases sit at the top of the namespace, each backed by a real root:
//!
//! - `/Home` - user data; shareable and favoritable
//! - `/Apps` - application data; never shared or favorited
//! - `/External` - attached removable media; never shared or favorited
//! - `/Network` - remote mounts at `/Network/<host>/<share>`; the mount
//!   levels themselves cannot be detached, renamed or created beside
//!
//! [`PathResolver`] translates between the two namespaces and is the single
//! gate for every mutating operation.

mod error;
mod resolver;
mod types;

pub use error::{PathError, PathResult};
pub use resolver::{BaseRoots, PathResolver};
pub use types::{BaseCategory, Classification, Operations, VirtualPath};
