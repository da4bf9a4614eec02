//! SambaPublisher: renders share configuration and drives the daemons.
//!
//! The sharing daemon (and with it the SMB listening port) and the
//! discovery daemon run exactly while at least one share is published:
//!
//! ```text
//!   0 shares ──publish(1+)──▶ set password, start sharing, start discovery
//!   1+ shares ──publish(1+)──▶ reload sharing
//!   1+ shares ──publish(0)───▶ stop discovery, stop sharing
//! ```

use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use strum::Display;
use tokio::sync::Mutex;

use crate::config::SambaConfig;
use crate::error::{StorageError, StorageResult};
use crate::process::{self, Invocation};

/// Daemons owned by the publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Daemon {
    /// The SMB file-sharing daemon; owns the listening port.
    Sharing,
    /// The companion announce/discovery daemon.
    Discovery,
}

/// OS seam for daemon lifecycle and credential installation.
#[async_trait]
pub trait ServiceControl: Send + Sync {
    async fn start(&self, daemon: Daemon) -> StorageResult<()>;
    async fn stop(&self, daemon: Daemon) -> StorageResult<()>;
    async fn reload(&self, daemon: Daemon) -> StorageResult<()>;
    /// Install `secret` as the password of `user`.
    async fn set_password(&self, user: &str, secret: &str) -> StorageResult<()>;
}

/// [`ServiceControl`] backed by the configured command lines.
#[derive(Debug, Clone)]
pub struct SystemServices {
    config: SambaConfig,
}

impl SystemServices {
    pub fn new(config: SambaConfig) -> Self {
        Self { config }
    }

    async fn exec(&self, command_line: &[String], inv: Invocation<'_>) -> StorageResult<()> {
        process::run_checked(command_line, inv, self.config.command_timeout()).await?;
        Ok(())
    }
}

#[async_trait]
impl ServiceControl for SystemServices {
    async fn start(&self, daemon: Daemon) -> StorageResult<()> {
        let cmd = match daemon {
            Daemon::Sharing => &self.config.start_sharing,
            Daemon::Discovery => &self.config.start_discovery,
        };
        self.exec(cmd, Invocation::default()).await
    }

    async fn stop(&self, daemon: Daemon) -> StorageResult<()> {
        let cmd = match daemon {
            Daemon::Sharing => &self.config.stop_sharing,
            Daemon::Discovery => &self.config.stop_discovery,
        };
        self.exec(cmd, Invocation::default()).await
    }

    async fn reload(&self, daemon: Daemon) -> StorageResult<()> {
        match daemon {
            Daemon::Sharing => self.exec(&self.config.reload_sharing, Invocation::default()).await,
            // Discovery announces the host, not individual shares.
            Daemon::Discovery => Ok(()),
        }
    }

    async fn set_password(&self, user: &str, secret: &str) -> StorageResult<()> {
        let inv = Invocation::default()
            .arg(user)
            .stdin(format!("{secret}\n{secret}\n"));
        self.exec(&self.config.set_password, inv).await
    }
}

/// A share as the daemon sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedShare {
    pub sharename: String,
    pub real_path: PathBuf,
}

impl PublishedShare {
    /// Refuse shares that would not render as exactly one config section.
    ///
    /// The daemon config is line oriented. A control character or `\` in
    /// the path splits or continues a line; brackets break the header.
    pub fn validate(&self) -> StorageResult<()> {
        if self.sharename.is_empty()
            || self
                .sharename
                .chars()
                .any(|c| c.is_control() || matches!(c, '[' | ']' | '\\'))
        {
            return Err(StorageError::not_allowed(format!(
                "cannot publish a share named {:?}",
                self.sharename
            )));
        }
        match self.real_path.to_str() {
            Some(path) if !path.chars().any(|c| c.is_control() || c == '\\') => Ok(()),
            _ => Err(StorageError::not_allowed(format!(
                "cannot publish {:?}",
                self.real_path
            ))),
        }
    }
}

/// Which daemons are up, as far as the publisher knows.
#[derive(Debug, Default, Clone, Copy)]
struct Running {
    sharing: bool,
    discovery: bool,
}

/// Renders the daemon configuration and keeps daemon state in step with it.
pub struct SambaPublisher {
    config: SambaConfig,
    services: Arc<dyn ServiceControl>,
    /// Daemon state. Also serializes publishes.
    running: Mutex<Running>,
}

impl std::fmt::Debug for SambaPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SambaPublisher")
            .field("config_path", &self.config.config_path)
            .finish_non_exhaustive()
    }
}

impl SambaPublisher {
    pub fn new(config: SambaConfig, services: Arc<dyn ServiceControl>) -> Self {
        Self {
            config,
            services,
            running: Mutex::new(Running::default()),
        }
    }

    /// Whether the sharing and discovery daemons are both running.
    pub async fn is_active(&self) -> bool {
        let running = self.running.lock().await;
        running.sharing && running.discovery
    }

    /// Render the full daemon configuration for `shares`.
    pub fn render(&self, shares: &[PublishedShare]) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Generated by hearth. Local edits are overwritten.");
        let _ = writeln!(out, "[global]");
        let _ = writeln!(out, "   workgroup = {}", self.config.workgroup);
        let _ = writeln!(out, "   server string = {}", self.config.server_string);
        let _ = writeln!(out, "   security = user");
        let _ = writeln!(out, "   map to guest = never");
        let _ = writeln!(out, "   load printers = no");
        let _ = writeln!(out, "   disable netbios = yes");
        for share in shares {
            let _ = writeln!(out);
            let _ = writeln!(out, "[{}]", share.sharename);
            let _ = writeln!(out, "   path = {}", share.real_path.display());
            let _ = writeln!(out, "   valid users = {}", self.config.user);
            let _ = writeln!(out, "   force user = {}", self.config.user);
            let _ = writeln!(out, "   read only = no");
            let _ = writeln!(out, "   browseable = yes");
        }
        out
    }

    /// Write the configuration for `shares` and bring the daemons in line.
    ///
    /// Returns once the daemons have started, reloaded or stopped. Each
    /// daemon is driven from its own state, so a publish after a partial
    /// failure starts or stops whichever one is out of step.
    pub async fn publish(&self, shares: &[PublishedShare], secret: &str) -> StorageResult<()> {
        let mut running = self.running.lock().await;
        self.write_config(&self.render(shares)).await?;

        if shares.is_empty() {
            return self.stop_running(&mut running).await;
        }

        let mut started_sharing = false;
        if running.sharing {
            self.services.reload(Daemon::Sharing).await?;
            tracing::debug!(shares = shares.len(), "sharing daemon reloaded");
        } else {
            self.services.set_password(&self.config.user, secret).await?;
            self.services.start(Daemon::Sharing).await?;
            running.sharing = true;
            started_sharing = true;
        }

        if !running.discovery {
            if let Err(e) = self.services.start(Daemon::Discovery).await {
                if started_sharing {
                    match self.services.stop(Daemon::Sharing).await {
                        Ok(()) => running.sharing = false,
                        Err(stop_err) => tracing::warn!(
                            error = %stop_err,
                            "failed to stop sharing daemon after discovery start failed"
                        ),
                    }
                }
                return Err(e);
            }
            running.discovery = true;
            tracing::info!(shares = shares.len(), "sharing and discovery daemons started");
        }
        Ok(())
    }

    /// Stop both daemons if running. Used at shutdown.
    pub async fn stop(&self) -> StorageResult<()> {
        let mut running = self.running.lock().await;
        self.stop_running(&mut running).await
    }

    async fn stop_running(&self, running: &mut Running) -> StorageResult<()> {
        if running.discovery {
            self.services.stop(Daemon::Discovery).await?;
            running.discovery = false;
        }
        if running.sharing {
            self.services.stop(Daemon::Sharing).await?;
            running.sharing = false;
            tracing::info!("no shares left, sharing and discovery daemons stopped");
        }
        Ok(())
    }

    /// Atomic replace: write a sibling temp file, then rename over.
    async fn write_config(&self, contents: &str) -> StorageResult<()> {
        let path = &self.config.config_path;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("conf.tmp");
        tokio::fs::write(&tmp, contents).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}
