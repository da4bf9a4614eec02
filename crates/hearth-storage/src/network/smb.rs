//! SMB client seam: discovery, share listing, mount and unmount.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::NetworkConfig;
use crate::error::{StorageError, StorageResult};
use crate::process::{self, CommandOutput, Invocation};

/// How long a liveness probe of a mounted directory may take.
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Username and password for a remote host.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn is_guest(&self) -> bool {
        self.username.is_empty()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Observed state of a mount point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountState {
    /// Mounted and answering.
    Mounted,
    /// In the mount table but the remote side is gone.
    Stale,
    /// Not mounted.
    Unmounted,
}

/// OS seam for consuming remote SMB shares.
#[async_trait]
pub trait SmbClient: Send + Sync {
    /// Hosts announcing SMB on the local network.
    async fn discover_servers(&self) -> StorageResult<Vec<String>>;

    /// Shares offered by `host`. Rejected credentials are `CredentialError`.
    async fn list_shares(&self, host: &str, credentials: &Credentials) -> StorageResult<Vec<String>>;

    /// Mount `//host/share` on the existing directory `mount_point`.
    async fn mount(
        &self,
        host: &str,
        share: &str,
        credentials: &Credentials,
        mount_point: &Path,
    ) -> StorageResult<()>;

    /// Detach whatever is mounted at `mount_point`.
    async fn unmount(&self, mount_point: &Path) -> StorageResult<()>;

    async fn mount_state(&self, mount_point: &Path) -> StorageResult<MountState>;
}

/// [`SmbClient`] backed by `mount.cifs`, `smbclient` and mDNS browsing.
#[derive(Debug, Clone)]
pub struct CifsClient {
    config: NetworkConfig,
}

impl CifsClient {
    pub fn new(config: NetworkConfig) -> Self {
        Self { config }
    }

    fn mount_options(&self, credentials: &Credentials) -> String {
        let mut options = Vec::with_capacity(self.config.mount_options.len() + 1);
        if credentials.is_guest() {
            options.push("guest".to_string());
        } else {
            options.push(format!("username={}", credentials.username));
        }
        options.extend(self.config.mount_options.iter().cloned());
        options.join(",")
    }
}

#[async_trait]
impl SmbClient for CifsClient {
    async fn discover_servers(&self) -> StorageResult<Vec<String>> {
        let output = process::run(
            &self.config.browse,
            Invocation::default(),
            self.config.discovery_timeout(),
        )
        .await?;
        if !output.success && output.stdout.trim().is_empty() {
            return Err(StorageError::command("browse", output.stderr.trim()));
        }
        Ok(parse_browse(&output.stdout))
    }

    async fn list_shares(&self, host: &str, credentials: &Credentials) -> StorageResult<Vec<String>> {
        let mut inv = Invocation::default().arg(format!("//{host}"));
        inv = if credentials.is_guest() {
            inv.arg("-N")
        } else {
            inv.arg("-U")
                .arg(credentials.username.clone())
                .env("PASSWD", &credentials.password)
        };
        let output = process::run(&self.config.list_shares, inv, self.config.discovery_timeout()).await?;
        if !output.success {
            return Err(classify_failure(host, &output));
        }
        Ok(parse_share_list(&output.stdout))
    }

    async fn mount(
        &self,
        host: &str,
        share: &str,
        credentials: &Credentials,
        mount_point: &Path,
    ) -> StorageResult<()> {
        let inv = Invocation::default()
            .arg(format!("//{host}/{share}"))
            .arg(mount_point.to_string_lossy())
            .arg("-o")
            .arg(self.mount_options(credentials))
            .env("PASSWD", &credentials.password);
        let output = process::run(&self.config.mount, inv, self.config.mount_timeout()).await?;
        if !output.success {
            return Err(classify_failure(host, &output));
        }
        Ok(())
    }

    async fn unmount(&self, mount_point: &Path) -> StorageResult<()> {
        let inv = Invocation::default().arg(mount_point.to_string_lossy());
        process::run_checked(&self.config.unmount, inv, self.config.mount_timeout()).await?;
        Ok(())
    }

    async fn mount_state(&self, mount_point: &Path) -> StorageResult<MountState> {
        let table = tokio::fs::read_to_string(&self.config.mount_table).await?;
        if !parse_mount_points(&table).iter().any(|p| p == mount_point) {
            return Ok(MountState::Unmounted);
        }

        let dir = mount_point.to_path_buf();
        let probe = tokio::task::spawn_blocking(move || std::fs::read_dir(&dir).map(|_| ()));
        Ok(match tokio::time::timeout(HEALTH_PROBE_TIMEOUT, probe).await {
            Ok(Ok(Ok(()))) => MountState::Mounted,
            _ => MountState::Stale,
        })
    }
}

/// Map a failed `smbclient`/`mount.cifs` run onto the error taxonomy.
fn classify_failure(host: &str, output: &CommandOutput) -> StorageError {
    let text = format!("{}\n{}", output.stderr, output.stdout);
    let lower = text.to_lowercase();

    const CREDENTIAL_MARKERS: &[&str] = &[
        "nt_status_logon_failure",
        "nt_status_access_denied",
        "nt_status_wrong_password",
        "nt_status_account_disabled",
        "nt_status_account_locked_out",
        "nt_status_password_expired",
        "permission denied",
        "error(13)",
    ];
    const UNREACHABLE_MARKERS: &[&str] = &[
        "nt_status_host_unreachable",
        "nt_status_network_unreachable",
        "nt_status_connection_refused",
        "nt_status_io_timeout",
        "nt_status_unsuccessful",
        "host is down",
        "no route to host",
        "connection refused",
        "connection timed out",
        "could not resolve address",
        "unable to find suitable address",
        "error(112)",
        "error(113)",
    ];

    if CREDENTIAL_MARKERS.iter().any(|m| lower.contains(m)) {
        StorageError::CredentialError(host.to_string())
    } else if UNREACHABLE_MARKERS.iter().any(|m| lower.contains(m)) {
        StorageError::NetworkUnreachable(host.to_string())
    } else {
        StorageError::command("smb", text.trim())
    }
}

/// Hostnames from `avahi-browse --parsable --resolve` output.
fn parse_browse(stdout: &str) -> Vec<String> {
    let mut hosts: Vec<String> = stdout
        .lines()
        .filter(|line| line.starts_with('='))
        .filter_map(|line| line.split(';').nth(6))
        .map(|host| host.trim_end_matches('.').to_string())
        .filter(|host| !host.is_empty())
        .collect();
    hosts.sort();
    hosts.dedup();
    hosts
}

/// Disk shares from `smbclient --grepable --list` output; hidden `$` shares dropped.
fn parse_share_list(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.split('|');
            match (fields.next(), fields.next()) {
                (Some("Disk"), Some(name)) if !name.is_empty() && !name.ends_with('$') => {
                    Some(name.to_string())
                }
                _ => None,
            }
        })
        .collect()
}

/// Mount points listed in a `/proc/mounts`-format table.
fn parse_mount_points(table: &str) -> Vec<PathBuf> {
    table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(|field| PathBuf::from(unescape_mount_field(field)))
        .collect()
}

/// Decode the `\040`-style octal escapes the kernel uses in mount tables.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            let value = std::str::from_utf8(digits)
                .ok()
                .and_then(|d| u8::from_str_radix(d, 8).ok());
            if let Some(value) = value {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_browse() {
        let out = "\
+;eth0;IPv4;nas;_smb._tcp;local
=;eth0;IPv4;nas;_smb._tcp;local;nas.local;192.168.1.10;445;
=;eth0;IPv6;nas;_smb._tcp;local;nas.local;fe80::1;445;
=;eth0;IPv4;media\\032box;_smb._tcp;local;mediabox.local;192.168.1.11;445;
";
        assert_eq!(parse_browse(out), vec!["mediabox.local", "nas.local"]);
    }

    #[test]
    fn test_parse_share_list() {
        let out = "\
Disk|media|Movies and music
Disk|backup|
IPC|IPC$|IPC Service
Disk|print$|Printer Drivers
Printer|laser|
";
        assert_eq!(parse_share_list(out), vec!["media", "backup"]);
    }

    #[test]
    fn test_parse_mount_points_unescapes() {
        let table = "\
proc /proc proc rw 0 0
//nas/media /srv/net/nas/media cifs rw 0 0
//nas/my\\040stuff /srv/net/nas/my\\040stuff cifs rw 0 0
";
        let points = parse_mount_points(table);
        assert!(points.contains(&PathBuf::from("/srv/net/nas/media")));
        assert!(points.contains(&PathBuf::from("/srv/net/nas/my stuff")));
    }

    #[test]
    fn test_classify_failure() {
        let out = |stderr: &str| CommandOutput {
            success: false,
            code: Some(1),
            stdout: String::new(),
            stderr: stderr.to_string(),
        };
        assert!(matches!(
            classify_failure("nas", &out("session setup failed: NT_STATUS_LOGON_FAILURE")),
            StorageError::CredentialError(_)
        ));
        assert!(matches!(
            classify_failure("nas", &out("mount error(112): Host is down")),
            StorageError::NetworkUnreachable(_)
        ));
        assert!(matches!(
            classify_failure("nas", &out("do_connect: Connection to nas failed (Error NT_STATUS_CONNECTION_REFUSED)")),
            StorageError::NetworkUnreachable(_)
        ));
        assert!(matches!(
            classify_failure("nas", &out("something odd")),
            StorageError::Command { .. }
        ));
    }

    fn sh(script: String) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script]
    }

    #[tokio::test]
    async fn test_cifs_mount_passes_password_in_env() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("args");
        let config = NetworkConfig {
            // `sh -c` binds the first appended argument to $0.
            mount: sh(format!(
                "echo \"$0 $1 $3 pw=$PASSWD\" > {}",
                log.display()
            )),
            mount_options: vec!["vers=3.0".into()],
            ..NetworkConfig::default()
        };
        let client = CifsClient::new(config);
        let mp = dir.path().join("mp");
        client
            .mount("nas", "media", &Credentials::new("amy", "pw1"), &mp)
            .await
            .unwrap();

        let logged = std::fs::read_to_string(&log).unwrap();
        assert_eq!(
            logged.trim(),
            format!("//nas/media {} username=amy,vers=3.0 pw=pw1", mp.display())
        );
    }

    #[tokio::test]
    async fn test_cifs_list_shares_credential_error() {
        let config = NetworkConfig {
            list_shares: sh("echo 'session setup failed: NT_STATUS_LOGON_FAILURE' >&2; exit 1".into()),
            ..NetworkConfig::default()
        };
        let client = CifsClient::new(config);
        let result = client.list_shares("nas", &Credentials::new("amy", "bad")).await;
        assert!(matches!(result, Err(StorageError::CredentialError(_))));
    }

    #[tokio::test]
    async fn test_cifs_mount_state_from_table() {
        let dir = TempDir::new().unwrap();
        let mounted = dir.path().join("mounted");
        std::fs::create_dir(&mounted).unwrap();
        let table = dir.path().join("mounts");
        std::fs::write(
            &table,
            format!("//nas/media {} cifs rw 0 0\n", mounted.display()),
        )
        .unwrap();
        let client = CifsClient::new(NetworkConfig {
            mount_table: table,
            ..NetworkConfig::default()
        });

        assert_eq!(client.mount_state(&mounted).await.unwrap(), MountState::Mounted);
        assert_eq!(
            client.mount_state(&dir.path().join("other")).await.unwrap(),
            MountState::Unmounted
        );

        std::fs::remove_dir(&mounted).unwrap();
        assert_eq!(client.mount_state(&mounted).await.unwrap(), MountState::Stale);
    }
}
