//! SSH tunnel connector
//!
//! Opens an SSH session to a jump host and a `direct-tcpip` channel from there
//! to the archive server's TCP port. The channel carries the ordinary TCP
//! packet stream. Uses `russh` (pure Rust SSH implementation).

use async_trait::async_trait;
use parking_lot::Mutex;
use russh::client;
use russh_keys::key::PublicKey;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, error, info, warn};

use crate::{BoxedStream, Connector, TransportError};

/// How the client proves its identity to the SSH server
#[derive(Debug, Clone)]
pub enum SshAuth {
    Password(String),
    Key {
        path: PathBuf,
        passphrase: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: SshAuth,

    /// Expected `SHA256:` fingerprint of the server host key. Unpinned
    /// connections accept any key and log it.
    pub host_key_fingerprint: Option<String>,

    /// Archive server as seen from the SSH host
    pub target_host: String,
    pub target_port: u16,
}

struct ClientHandler {
    expected: Option<String>,
    mismatch: Arc<AtomicBool>,
    presented: Arc<Mutex<Option<String>>>,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = format!("SHA256:{}", server_public_key.fingerprint());
        *self.presented.lock() = Some(fingerprint.clone());

        match &self.expected {
            None => {
                warn!("SSH host key not pinned, accepting {}", fingerprint);
                Ok(true)
            }
            Some(expected) if fingerprints_match(expected, &fingerprint) => Ok(true),
            Some(expected) => {
                error!(
                    "SSH host key mismatch: expected {}, got {}",
                    expected, fingerprint
                );
                self.mismatch.store(true, Ordering::SeqCst);
                Ok(false)
            }
        }
    }
}

fn fingerprints_match(expected: &str, actual: &str) -> bool {
    let strip = |s: &str| s.trim().trim_start_matches("SHA256:").trim_end_matches('=').to_string();
    strip(expected) == strip(actual)
}

pub struct SshConnector {
    config: SshConfig,
}

impl SshConnector {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    async fn authenticate(
        &self,
        session: &mut client::Handle<ClientHandler>,
    ) -> Result<(), TransportError> {
        let user = &self.config.username;
        let accepted = match &self.config.auth {
            SshAuth::Password(password) => session
                .authenticate_password(user, password)
                .await
                .map_err(|e| TransportError::Ssh(e.to_string()))?,
            SshAuth::Key { path, passphrase } => {
                let key = russh_keys::load_secret_key(path, passphrase.as_deref())
                    .map_err(|e| TransportError::Key(format!("{}: {}", path.display(), e)))?;
                session
                    .authenticate_publickey(user, Arc::new(key))
                    .await
                    .map_err(|e| TransportError::Ssh(e.to_string()))?
            }
        };

        if !accepted {
            return Err(TransportError::AuthenticationRejected(user.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self) -> Result<BoxedStream, TransportError> {
        let ssh_config = Arc::new(client::Config {
            inactivity_timeout: Some(Duration::from_secs(300)),
            keepalive_interval: Some(Duration::from_secs(60)),
            ..Default::default()
        });

        let mismatch = Arc::new(AtomicBool::new(false));
        let presented = Arc::new(Mutex::new(None));
        let handler = ClientHandler {
            expected: self.config.host_key_fingerprint.clone(),
            mismatch: mismatch.clone(),
            presented: presented.clone(),
        };

        debug!("Opening SSH session to {}:{}", self.config.host, self.config.port);
        let mut session =
            match client::connect(ssh_config, (self.config.host.as_str(), self.config.port), handler)
                .await
            {
                Ok(session) => session,
                Err(_) if mismatch.load(Ordering::SeqCst) => {
                    return Err(TransportError::HostKeyMismatch {
                        host: self.config.host.clone(),
                        actual: presented.lock().take().unwrap_or_default(),
                    });
                }
                Err(e) => return Err(TransportError::Ssh(e.to_string())),
            };

        self.authenticate(&mut session).await?;

        let channel = session
            .channel_open_direct_tcpip(
                self.config.target_host.as_str(),
                self.config.target_port as u32,
                "127.0.0.1",
                0,
            )
            .await
            .map_err(|e| TransportError::Ssh(e.to_string()))?;

        info!("SSH tunnel open to {}", self.describe());
        Ok(Box::new(SshTunnelStream {
            stream: channel.into_stream(),
            _session: session,
        }))
    }

    fn describe(&self) -> String {
        format!(
            "ssh://{}@{}:{} -> {}:{}",
            self.config.username,
            self.config.host,
            self.config.port,
            self.config.target_host,
            self.config.target_port
        )
    }
}

/// Channel stream that keeps its session handle alive
struct SshTunnelStream {
    stream: russh::ChannelStream<client::Msg>,
    _session: client::Handle<ClientHandler>,
}

impl AsyncRead for SshTunnelStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for SshTunnelStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}
