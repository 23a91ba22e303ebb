//! File-server frontends for the two FS transports.
//!
//! The engine runs the protocol in-band over the multiplexed compiler
//! pipe (config line `-2`). The repro tooling runs it out-of-band over a
//! TCP socket; the config line then carries the port number.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::fs::FileSystem;
use crate::fs_protocol::FsProtocol;

/// Serves the FS protocol over the compiler's own pipe pair.
pub struct PipeFileServer {
    protocol: Arc<FsProtocol>,
}

impl PipeFileServer {
    pub fn new(fs: Arc<dyn FileSystem>, sdk_path: impl Into<String>) -> Self {
        PipeFileServer {
            protocol: Arc::new(FsProtocol::new(fs, sdk_path)),
        }
    }

    pub fn protocol(&self) -> Arc<FsProtocol> {
        self.protocol.clone()
    }

    /// The config line selecting in-band mode.
    pub fn config_line(&self) -> String {
        "-2".to_string()
    }

    /// Starts serving `reader`/`writer`; returns the serving task. The
    /// task ends when the compiler closes the request channel.
    pub fn run<R, W>(&self, reader: R, writer: W) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let protocol = self.protocol.clone();
        tokio::spawn(async move {
            protocol.handle_conn(reader, writer).await;
        })
    }
}

/// Serves the FS protocol on a TCP socket, one task per connection.
pub struct TcpFileServer {
    protocol: Arc<FsProtocol>,
    listener: TcpListener,
    shutdown: CancellationToken,
}

impl TcpFileServer {
    /// Binds `addr` (use port 0 for an ephemeral port).
    pub async fn bind(
        fs: Arc<dyn FileSystem>,
        sdk_path: impl Into<String>,
        addr: &str,
    ) -> io::Result<Self> {
        Ok(TcpFileServer {
            protocol: Arc::new(FsProtocol::new(fs, sdk_path)),
            listener: TcpListener::bind(addr).await?,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn protocol(&self) -> Arc<FsProtocol> {
        self.protocol.clone()
    }

    pub fn port(&self) -> io::Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    /// The config line selecting out-of-band mode.
    pub fn config_line(&self) -> io::Result<String> {
        Ok(self.port()?.to_string())
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accept loop; returns once the shutdown token fires.
    pub async fn serve(&self) -> io::Result<()> {
        loop {
            let (conn, peer) = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                accepted = self.listener.accept() => accepted?,
            };
            tracing::debug!("compiler fs connection from {peer}");
            let protocol = self.protocol.clone();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                let (reader, writer) = conn.into_split();
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = protocol.handle_conn(reader, writer) => {}
                }
            });
        }
    }
}
