//! Server configuration constants.

/// Log filter used when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Permission bits of the RPC socket: owner read/write only.
pub const SOCKET_MODE: u32 = 0o600;

/// Longest request line accepted, in bytes.
pub const MAX_REQUEST_BYTES: usize = 64 * 1024;
