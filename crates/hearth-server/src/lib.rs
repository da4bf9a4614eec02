//! hearth server library
//!
//! JSON-lines RPC over a local Unix socket for the hearth storage control
//! plane: local shares, network mounts and favorites.

pub mod constants;
pub mod rpc;
pub mod server;

pub use rpc::{Request, Response, RpcError, dispatch, handle_line};
pub use server::{RpcServer, ServeError, run};
