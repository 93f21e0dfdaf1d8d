//! Byte-stream connectors for the TCP packet framing
//!
//! The archive server is reached either directly or through an SSH
//! `direct-tcpip` channel. Both produce a boxed stream the framer reads from.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Any duplex byte stream a session can run over
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection to {0} timed out")]
    Timeout(String),

    #[error("SSH error: {0}")]
    Ssh(String),

    #[error("SSH authentication rejected for user {0}")]
    AuthenticationRejected(String),

    #[error("SSH key error: {0}")]
    Key(String),

    /// The server presented a host key other than the pinned one
    #[error("SSH host key mismatch for {host}: got {actual}")]
    HostKeyMismatch { host: String, actual: String },
}

impl TransportError {
    /// Errors that must stop the reconnect loop until configuration changes
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::HostKeyMismatch { .. })
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<BoxedStream, TransportError>;

    /// Human readable target for logs
    fn describe(&self) -> String;
}

/// Direct TCP connection to the archive server
#[derive(Debug, Clone)]
pub struct TcpConnector {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<BoxedStream, TransportError> {
        let target = self.describe();
        debug!("Connecting to {}", target);

        let stream = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        .map_err(|_| TransportError::Timeout(target.clone()))??;
        stream.set_nodelay(true)?;

        info!("Connected to {}", target);
        Ok(Box::new(stream))
    }

    fn describe(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }
}

/// Fixed-delay reconnect policy
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            backoff: Duration::from_secs(60),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the next attempt, or `None` to give up
    pub fn next_delay(&self, error: &TransportError) -> Option<Duration> {
        if error.is_fatal() {
            None
        } else {
            Some(self.backoff)
        }
    }
}
