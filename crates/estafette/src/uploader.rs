//! Remote delivery.
//!
//! One connection per upload call: the pipeline never manages transport
//! state, and a failed attempt leaves nothing behind to clean up.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ssh2::Session;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::cancel::CancellationToken;
use crate::config::SftpConfig;

/// Cancellation is checked between chunks of this size.
const CHUNK_SIZE: usize = 64 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Blocking-call ceiling for the ssh session, in milliseconds.
const SESSION_TIMEOUT_MS: u32 = 30_000;

/// Errors from a delivery attempt. All of them are transient from the
/// pipeline's point of view: the item is abandoned and retried.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("connection to {host}:{port} failed: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("ssh session setup failed: {source}")]
    Session {
        #[source]
        source: ssh2::Error,
    },

    #[error("authentication as {username} failed: {source}")]
    Auth {
        username: String,
        #[source]
        source: ssh2::Error,
    },

    #[error("host key rejected: {reason}")]
    HostKey { reason: String },

    #[error("transfer to {remote} failed: {message}")]
    Transfer { remote: String, message: String },

    #[error("upload cancelled by shutdown")]
    Cancelled,
}

/// Delivers one local blob to a slash-delimited remote path.
///
/// Implementations own their whole connection lifecycle per call and must
/// create intermediate remote directories as needed.
pub trait Uploader: Send + Sync {
    fn upload(
        &self,
        local: &Path,
        remote: &str,
        cancel: &CancellationToken,
    ) -> Result<(), UploadError>;
}

/// SFTP delivery over libssh2.
pub struct SftpUploader {
    config: SftpConfig,
}

impl SftpUploader {
    pub fn new(config: SftpConfig) -> Self {
        Self { config }
    }

    fn connect(&self) -> Result<Session, UploadError> {
        let host = self.config.host.as_str();
        let port = self.config.port;
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|source| UploadError::Connect {
                host: host.to_string(),
                port,
                source,
            })?
            .next()
            .ok_or_else(|| UploadError::Connect {
                host: host.to_string(),
                port,
                source: io::Error::new(io::ErrorKind::NotFound, "no address resolved"),
            })?;
        let tcp = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).map_err(|source| {
            UploadError::Connect {
                host: host.to_string(),
                port,
                source,
            }
        })?;

        let mut session = Session::new().map_err(|source| UploadError::Session { source })?;
        session.set_timeout(SESSION_TIMEOUT_MS);
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|source| UploadError::Session { source })?;

        self.verify_host_key(&session)?;
        self.authenticate(&session)?;
        Ok(session)
    }

    fn verify_host_key(&self, session: &Session) -> Result<(), UploadError> {
        let Some(expected) = self.config.fingerprint_sha256.as_deref() else {
            return Ok(());
        };
        let hash = session
            .host_key_hash(ssh2::HashType::Sha256)
            .ok_or_else(|| UploadError::HostKey {
                reason: "server presented no host key".to_string(),
            })?;
        // OpenSSH prints "SHA256:<unpadded base64>"; accept with or without
        // the prefix and padding.
        let actual = BASE64.encode(hash);
        let actual = actual.trim_end_matches('=');
        let expected = expected
            .strip_prefix("SHA256:")
            .unwrap_or(expected)
            .trim_end_matches('=');
        if actual != expected {
            return Err(UploadError::HostKey {
                reason: format!("fingerprint SHA256:{actual} does not match configuration"),
            });
        }
        Ok(())
    }

    fn authenticate(&self, session: &Session) -> Result<(), UploadError> {
        let username = self.config.username.as_str();
        let auth_err = |source| UploadError::Auth {
            username: username.to_string(),
            source,
        };
        match self.config.private_key_path.as_deref() {
            Some(key) if key.exists() => session
                .userauth_pubkey_file(
                    username,
                    None,
                    key,
                    self.config.private_key_passphrase.as_deref(),
                )
                .map_err(auth_err),
            _ => session
                .userauth_password(username, self.config.password.as_deref().unwrap_or_default())
                .map_err(auth_err),
        }
    }
}

impl Uploader for SftpUploader {
    fn upload(
        &self,
        local: &Path,
        remote: &str,
        cancel: &CancellationToken,
    ) -> Result<(), UploadError> {
        if cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        let session = self.connect()?;
        let sftp = session
            .sftp()
            .map_err(|source| UploadError::Session { source })?;

        let transfer_err = |message: String| UploadError::Transfer {
            remote: remote.to_string(),
            message,
        };

        if let Some((dir, _)) = remote.rsplit_once('/') {
            ensure_remote_dirs(&sftp, dir);
        }

        let mut reader = std::fs::File::open(local)
            .map_err(|e| transfer_err(format!("cannot read {}: {e}", local.display())))?;
        let mut writer = sftp
            .create(Path::new(remote))
            .map_err(|e| transfer_err(format!("cannot create remote file: {e}")))?;

        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            if cancel.is_cancelled() {
                return Err(UploadError::Cancelled);
            }
            let n = reader
                .read(&mut buf)
                .map_err(|e| transfer_err(format!("local read failed: {e}")))?;
            if n == 0 {
                break;
            }
            writer
                .write_all(&buf[..n])
                .map_err(|e| transfer_err(format!("remote write failed: {e}")))?;
        }
        drop(writer);

        let _ = session.disconnect(None, "upload complete", None);
        info!(local = %local.display(), remote, "upload finished");
        Ok(())
    }
}

/// Create each missing segment of `dir` in turn. Races with another
/// creator or pre-existing directories are fine; a genuinely failed mkdir
/// surfaces later when the file create fails.
fn ensure_remote_dirs(sftp: &ssh2::Sftp, dir: &str) {
    let mut current = String::new();
    for part in dir.split('/').filter(|p| !p.is_empty()) {
        current.push('/');
        current.push_str(part);
        let path = Path::new(&current);
        if sftp.stat(path).is_err() {
            if let Err(err) = sftp.mkdir(path, 0o755) {
                if sftp.stat(path).is_err() {
                    warn!(dir = %current, error = %err, "could not create remote directory");
                }
            }
        }
    }
}

/// Stand-in uploader used when no SFTP host is configured: logs the
/// would-be transfer and reports success so the pipeline can be exercised
/// end to end.
pub struct NoopUploader;

impl Uploader for NoopUploader {
    fn upload(
        &self,
        local: &Path,
        remote: &str,
        cancel: &CancellationToken,
    ) -> Result<(), UploadError> {
        if cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }
        warn!(local = %local.display(), remote, "no sftp host configured, simulating upload");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_token_short_circuits_before_connecting() {
        let uploader = SftpUploader::new(SftpConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = uploader
            .upload(Path::new("/nonexistent"), "/data/x", &cancel)
            .unwrap_err();
        assert!(matches!(err, UploadError::Cancelled));
    }

    #[test]
    fn noop_uploader_reports_success() {
        let cancel = CancellationToken::new();
        assert!(NoopUploader
            .upload(Path::new("/tmp/blob"), "/data/x", &cancel)
            .is_ok());
    }

    #[test]
    fn noop_uploader_honours_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = NoopUploader
            .upload(Path::new("/tmp/blob"), "/data/x", &cancel)
            .unwrap_err();
        assert!(matches!(err, UploadError::Cancelled));
    }
}
