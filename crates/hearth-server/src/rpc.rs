//! Request types and dispatch onto the storage service.
//!
//! One request per line:
//!
//! ```json
//! {"method": "shares.add", "params": {"path": "/Home/photos"}}
//! ```
//!
//! One response per line, either `{"ok": <result>}` or
//! `{"error": {"code": "share-already-exists", "message": "..."}}`.

use hearth_storage::{StorageError, StorageService};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error code for lines that are not a valid request.
pub const INVALID_REQUEST: &str = "invalid-request";

/// A call on the RPC surface.
#[derive(Clone, Deserialize, Serialize)]
#[serde(tag = "method", content = "params")]
pub enum Request {
    #[serde(rename = "shares.list")]
    SharesList,
    #[serde(rename = "shares.add")]
    SharesAdd { path: String },
    #[serde(rename = "shares.remove")]
    SharesRemove { path: String },
    #[serde(rename = "shares.password")]
    SharesPassword,

    #[serde(rename = "network.list")]
    NetworkList,
    #[serde(rename = "network.discoverServers")]
    NetworkDiscoverServers,
    #[serde(rename = "network.discoverShares")]
    NetworkDiscoverShares {
        host: String,
        #[serde(default)]
        username: String,
        #[serde(default)]
        password: String,
    },
    #[serde(rename = "network.add")]
    NetworkAdd {
        host: String,
        share: String,
        #[serde(default)]
        username: String,
        #[serde(default)]
        password: String,
    },
    #[serde(rename = "network.remove")]
    NetworkRemove {
        #[serde(rename = "mountPath")]
        mount_path: String,
    },

    #[serde(rename = "favorites.list")]
    FavoritesList,
    #[serde(rename = "favorites.add")]
    FavoritesAdd { path: String },
    #[serde(rename = "favorites.remove")]
    FavoritesRemove { path: String },
}

impl Request {
    /// Wire name of the method.
    pub fn method(&self) -> &'static str {
        match self {
            Self::SharesList => "shares.list",
            Self::SharesAdd { .. } => "shares.add",
            Self::SharesRemove { .. } => "shares.remove",
            Self::SharesPassword => "shares.password",
            Self::NetworkList => "network.list",
            Self::NetworkDiscoverServers => "network.discoverServers",
            Self::NetworkDiscoverShares { .. } => "network.discoverShares",
            Self::NetworkAdd { .. } => "network.add",
            Self::NetworkRemove { .. } => "network.remove",
            Self::FavoritesList => "favorites.list",
            Self::FavoritesAdd { .. } => "favorites.add",
            Self::FavoritesRemove { .. } => "favorites.remove",
        }
    }
}

// Params may carry passwords.
impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method())
            .finish_non_exhaustive()
    }
}

/// Error half of a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct RpcError {
    pub code: String,
    pub message: String,
}

impl RpcError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(INVALID_REQUEST, message)
    }
}

impl From<StorageError> for RpcError {
    fn from(e: StorageError) -> Self {
        Self::new(e.code(), e.to_string())
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(e: serde_json::Error) -> Self {
        Self::new("internal", e.to_string())
    }
}

/// One response line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Response {
    Ok(Value),
    Error(RpcError),
}

impl From<Result<Value, RpcError>> for Response {
    fn from(result: Result<Value, RpcError>) -> Self {
        match result {
            Ok(value) => Self::Ok(value),
            Err(e) => Self::Error(e),
        }
    }
}

/// Execute `request` against `service`.
pub async fn dispatch(service: &StorageService, request: Request) -> Result<Value, RpcError> {
    let value = match request {
        Request::SharesList => serde_json::to_value(service.shares().list().await?)?,
        Request::SharesAdd { path } => Value::from(service.shares().add_share(&path).await?),
        Request::SharesRemove { path } => Value::from(service.shares().remove_share(&path).await?),
        Request::SharesPassword => Value::from(service.shares().shared_secret().await?),

        Request::NetworkList => serde_json::to_value(service.network().list().await?)?,
        Request::NetworkDiscoverServers => {
            Value::from(service.network().discover_servers().await?)
        }
        Request::NetworkDiscoverShares {
            host,
            username,
            password,
        } => Value::from(
            service
                .network()
                .discover_shares(&host, &username, &password)
                .await?,
        ),
        Request::NetworkAdd {
            host,
            share,
            username,
            password,
        } => Value::from(
            service
                .network()
                .add_network_share(&host, &share, &username, &password)
                .await?,
        ),
        Request::NetworkRemove { mount_path } => {
            Value::from(service.network().remove_network_share(&mount_path).await?)
        }

        Request::FavoritesList => Value::from(service.favorites().list().await?),
        Request::FavoritesAdd { path } => Value::from(service.favorites().add(&path).await?),
        Request::FavoritesRemove { path } => Value::from(service.favorites().remove(&path).await?),
    };
    Ok(value)
}

/// Parse one request line, dispatch it, and render the response line
/// (without the trailing newline).
pub async fn handle_line(service: &StorageService, line: &str) -> String {
    let result = match serde_json::from_str::<Request>(line) {
        Ok(request) => {
            let method = request.method();
            let result = dispatch(service, request).await;
            match &result {
                Ok(_) => tracing::debug!(method, "request ok"),
                Err(e) => tracing::info!(method, code = %e.code, error = %e.message, "request failed"),
            }
            result
        }
        Err(e) => Err(RpcError::invalid_request(e.to_string())),
    };

    let response = Response::from(result);
    serde_json::to_string(&response).unwrap_or_else(|e| {
        format!(r#"{{"error":{{"code":"internal","message":"{}"}}}}"#, e.to_string().replace('"', "'"))
    })
}
