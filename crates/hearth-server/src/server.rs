//! Unix socket listener serving JSON-lines RPC.

use std::future::Future;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hearth_storage::{StorageError, StorageService};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

use crate::constants::{MAX_REQUEST_BYTES, SOCKET_MODE};
use crate::rpc::{self, RpcError, Response};

/// Errors from [`run`].
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("binding {}: {source}", path.display())]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    #[error("RPC server: {0}")]
    Io(#[from] std::io::Error),
}

/// Bind the socket, start `service`, serve until `shutdown`, then shut the
/// service down.
///
/// The socket is bound before any daemon or mount is brought up, so a bind
/// failure returns with nothing to clean up.
pub async fn run(
    service: Arc<StorageService>,
    socket_path: &Path,
    shutdown: impl Future<Output = ()>,
) -> Result<(), ServeError> {
    let server = RpcServer::bind(Arc::clone(&service), socket_path).map_err(|source| {
        ServeError::Bind {
            path: socket_path.to_path_buf(),
            source,
        }
    })?;

    if let Err(e) = service.start().await {
        if let Err(shutdown_err) = service.shutdown().await {
            tracing::warn!(error = %shutdown_err, "storage shutdown after failed start");
        }
        server.close();
        return Err(e.into());
    }

    let served = server.serve(shutdown).await;
    tracing::info!("shutting down");
    service.shutdown().await?;
    served?;
    Ok(())
}

/// RPC server bound to a Unix socket.
///
/// Only the socket owner (and root) may connect: the socket is created
/// with mode 0600 and each peer's uid is checked on accept.
pub struct RpcServer {
    service: Arc<StorageService>,
    listener: UnixListener,
    socket_path: PathBuf,
    owner_uid: u32,
}

impl RpcServer {
    /// Bind `socket_path`, replacing a stale socket left by a previous run.
    pub fn bind(service: Arc<StorageService>, socket_path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::remove_file(socket_path) {
            Ok(()) => tracing::debug!(path = %socket_path.display(), "removed stale socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let listener = UnixListener::bind(socket_path)?;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(SOCKET_MODE))?;
        let owner_uid = std::fs::metadata(socket_path)?.uid();

        tracing::info!(path = %socket_path.display(), "RPC socket listening");
        Ok(Self {
            service,
            listener,
            socket_path: socket_path.to_path_buf(),
            owner_uid,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accept connections until `shutdown` resolves, then remove the socket.
    pub async fn serve(self, shutdown: impl Future<Output = ()>) -> std::io::Result<()> {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => {
                    let (stream, _) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    if !self.authorized(&stream) {
                        continue;
                    }
                    let service = Arc::clone(&self.service);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(service, stream).await {
                            tracing::debug!(error = %e, "connection ended with error");
                        }
                    });
                }
            }
        }

        self.close();
        tracing::info!("RPC server stopped");
        Ok(())
    }

    /// Stop listening and remove the socket file.
    pub fn close(self) {
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            tracing::debug!(path = %self.socket_path.display(), error = %e, "could not remove socket");
        }
    }

    fn authorized(&self, stream: &UnixStream) -> bool {
        match stream.peer_cred() {
            Ok(cred) if cred.uid() == self.owner_uid || cred.uid() == 0 => true,
            Ok(cred) => {
                tracing::warn!(uid = cred.uid(), "rejected connection from foreign user");
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot read peer credentials, rejecting");
                false
            }
        }
    }
}

/// Serve one client: a response line for every request line, in order.
async fn handle_connection(service: Arc<StorageService>, stream: UnixStream) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let limit = MAX_REQUEST_BYTES as u64 + 1;
        let read = (&mut reader).take(limit).read_line(&mut line).await?;
        if read == 0 {
            return Ok(());
        }
        if line.len() > MAX_REQUEST_BYTES {
            let response = Response::Error(RpcError::invalid_request("request too large"));
            let mut out = serde_json::to_string(&response).map_err(std::io::Error::other)?;
            out.push('\n');
            writer.write_all(out.as_bytes()).await?;
            return Ok(());
        }
        let request = line.trim();
        if request.is_empty() {
            continue;
        }

        let mut out = rpc::handle_line(&service, request).await;
        out.push('\n');
        writer.write_all(out.as_bytes()).await?;
    }
}
