//! Storage configuration.
//!
//! Loaded from TOML. Every field has a default, so an empty file (or no
//! file at all) yields a working configuration:
//!
//! ```toml
//! state_db = "~/.local/share/hearth/storage.db"
//!
//! [roots]
//! home = "/srv/hearth/home"
//! apps = "/srv/hearth/apps"
//! external = "/media"
//! network = "/srv/hearth/network"
//!
//! [network]
//! reconcile_interval_secs = 30
//! mount_timeout_secs = 15
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use thiserror::Error;

use crate::vfs::{BaseCategory, BaseRoots};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "HEARTH_CONFIG";

/// Error type for config loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("cannot expand {0}: {1}")]
    Expand(String, String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// A command line: program plus arguments.
pub type CommandLine = Vec<String>;

fn cmd(parts: &[&str]) -> CommandLine {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Top-level storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub roots: RootsConfig,
    /// SQLite database backing the persisted collections.
    pub state_db: PathBuf,
    pub samba: SambaConfig,
    pub network: NetworkConfig,
    pub server: ServerConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("/var/lib"))
            .join("hearth");
        Self {
            roots: RootsConfig::default(),
            state_db: data.join("storage.db"),
            samba: SambaConfig::default(),
            network: NetworkConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RootsConfig {
    pub home: PathBuf,
    pub apps: PathBuf,
    pub external: PathBuf,
    pub network: PathBuf,
}

impl Default for RootsConfig {
    fn default() -> Self {
        Self {
            home: PathBuf::from("/srv/hearth/home"),
            apps: PathBuf::from("/srv/hearth/apps"),
            external: PathBuf::from("/media/hearth"),
            network: PathBuf::from("/srv/hearth/network"),
        }
    }
}

impl RootsConfig {
    pub fn to_base_roots(&self) -> BaseRoots {
        BaseRoots {
            home: self.home.clone(),
            apps: self.apps.clone(),
            external: self.external.clone(),
            network: self.network.clone(),
        }
    }
}

/// Local share publication (sharing daemon + discovery daemon).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SambaConfig {
    /// Where the rendered daemon configuration is written.
    pub config_path: PathBuf,
    /// Account every share authenticates as; its password is the shared secret.
    pub user: String,
    pub workgroup: String,
    pub server_string: String,
    pub start_sharing: CommandLine,
    pub stop_sharing: CommandLine,
    pub reload_sharing: CommandLine,
    pub start_discovery: CommandLine,
    pub stop_discovery: CommandLine,
    /// Password tool; receives the secret twice on stdin, user appended.
    pub set_password: CommandLine,
    pub command_timeout_secs: u64,
}

impl Default for SambaConfig {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("/etc/samba/smb.conf"),
            user: "hearth".to_string(),
            workgroup: "WORKGROUP".to_string(),
            server_string: "hearth".to_string(),
            start_sharing: cmd(&["systemctl", "start", "smbd"]),
            stop_sharing: cmd(&["systemctl", "stop", "smbd"]),
            reload_sharing: cmd(&["smbcontrol", "smbd", "reload-config"]),
            start_discovery: cmd(&["systemctl", "start", "wsdd2"]),
            stop_discovery: cmd(&["systemctl", "stop", "wsdd2"]),
            set_password: cmd(&["smbpasswd", "-s", "-a"]),
            command_timeout_secs: 20,
        }
    }
}

impl SambaConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// Remote share consumption.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub reconcile_interval_secs: u64,
    pub mount_timeout_secs: u64,
    pub discovery_timeout_secs: u64,
    /// Mount table to consult for `is_mounted`.
    pub mount_table: PathBuf,
    /// mDNS browse for SMB hosts, parsable output.
    pub browse: CommandLine,
    pub list_shares: CommandLine,
    pub mount: CommandLine,
    pub unmount: CommandLine,
    /// Extra `-o` options passed to the mount command.
    pub mount_options: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: 30,
            mount_timeout_secs: 15,
            discovery_timeout_secs: 10,
            mount_table: PathBuf::from("/proc/self/mounts"),
            browse: cmd(&["avahi-browse", "--terminate", "--parsable", "--resolve", "_smb._tcp"]),
            list_shares: cmd(&["smbclient", "--grepable", "--list"]),
            mount: cmd(&["mount", "-t", "cifs"]),
            unmount: cmd(&["umount", "--lazy"]),
            mount_options: vec!["iocharset=utf8".to_string(), "vers=3.0".to_string()],
        }
    }
}

impl NetworkConfig {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }

    pub fn mount_timeout(&self) -> Duration {
        Duration::from_secs(self.mount_timeout_secs)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub socket_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let runtime = dirs::runtime_dir().unwrap_or_else(std::env::temp_dir);
        Self {
            socket_path: runtime.join("hearth").join("storage.sock"),
        }
    }
}

impl StorageConfig {
    /// Default config file location (`$XDG_CONFIG_HOME/hearth/storage.toml`).
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("hearth").join("storage.toml"))
    }

    /// Load configuration.
    ///
    /// `explicit` (or `$HEARTH_CONFIG`) must exist; the default location may
    /// be absent, in which case built-in defaults apply.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let from_env = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let required = explicit.map(Path::to_path_buf).or(from_env);

        let config = match required {
            Some(path) => Self::from_file(&path)?,
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => {
                    tracing::debug!("no config file found, using defaults");
                    Self::default()
                }
            },
        };

        let config = config.expanded()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!(path = %path.display(), "loaded storage config");
        Ok(config)
    }

    /// Expand `~` and `$VAR` in every path field.
    fn expanded(mut self) -> Result<Self, ConfigError> {
        for path in [
            &mut self.roots.home,
            &mut self.roots.apps,
            &mut self.roots.external,
            &mut self.roots.network,
            &mut self.state_db,
            &mut self.samba.config_path,
            &mut self.network.mount_table,
            &mut self.server.socket_path,
        ] {
            *path = expand_path(path)?;
        }
        Ok(self)
    }

    /// Roots must be absolute and must not overlap.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let roots = self.roots.to_base_roots();
        for base in BaseCategory::iter() {
            let root = roots.get(base);
            if !root.is_absolute() {
                return Err(ConfigError::Invalid(format!(
                    "{base} root must be absolute: {}",
                    root.display()
                )));
            }
            for other in BaseCategory::iter().filter(|o| *o != base) {
                if root.starts_with(roots.get(other)) {
                    return Err(ConfigError::Invalid(format!(
                        "{base} root {} overlaps {other} root",
                        root.display()
                    )));
                }
            }
        }
        if self.samba.user.is_empty() {
            return Err(ConfigError::Invalid("samba.user must not be empty".into()));
        }
        Ok(())
    }
}

fn expand_path(path: &Path) -> Result<PathBuf, ConfigError> {
    let raw = path.to_string_lossy();
    shellexpand::full(&raw)
        .map(|s| PathBuf::from(s.as_ref()))
        .map_err(|e| ConfigError::Expand(raw.to_string(), e.to_string()))
}
