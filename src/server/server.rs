//! TCP server for the admission service.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use super::service::{error_line, AdmissionService};
use crate::error::Result;
use crate::middleware::RateLimitMiddleware;

/// Longest request line accepted, newline excluded.
pub const MAX_LINE_BYTES: usize = 8 * 1024;

/// Line-delimited JSON server answering admission queries.
pub struct AdmissionServer {
    listener: TcpListener,
    service: Arc<AdmissionService>,
}

impl AdmissionServer {
    /// Bind the listening socket.
    pub async fn bind(addr: SocketAddr, middleware: Arc<RateLimitMiddleware>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            service: Arc::new(AdmissionService::new(middleware)),
        })
    }

    /// The address actually bound.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Start the server with graceful shutdown.
    ///
    /// Stops accepting connections when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        info!(
            addr = %self.local_addr()?,
            "Starting admission server"
        );

        tokio::pin!(signal);
        loop {
            tokio::select! {
                _ = &mut signal => {
                    info!("Admission server stopping");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };
                    let service = self.service.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, service).await {
                            debug!(peer = %peer, error = %e, "Connection closed with error");
                        }
                    });
                }
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, service: Arc<AdmissionService>) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(256);

    loop {
        buf.clear();
        let read = (&mut reader)
            .take(MAX_LINE_BYTES as u64 + 1)
            .read_until(b'\n', &mut buf)
            .await?;
        if read == 0 {
            break;
        }

        let mut reply = if buf.last() != Some(&b'\n') && buf.len() > MAX_LINE_BYTES {
            warn!(limit = MAX_LINE_BYTES, "Discarding overlong admission request");
            discard_line(&mut reader).await?;
            error_line(format!("request exceeds {} bytes", MAX_LINE_BYTES))
        } else {
            match std::str::from_utf8(&buf) {
                Ok(line) if line.trim().is_empty() => continue,
                Ok(line) => service.handle_line(line.trim_end()).await,
                Err(e) => {
                    warn!(error = %e, "Received non UTF-8 admission request");
                    error_line(format!("invalid request: {}", e))
                }
            }
        };
        reply.push('\n');
        writer.write_all(reply.as_bytes()).await?;
    }

    Ok(())
}

/// Skip the rest of the current line without buffering it.
async fn discard_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> std::io::Result<()> {
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(());
        }
        match available.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                reader.consume(pos + 1);
                return Ok(());
            }
            None => {
                let len = available.len();
                reader.consume(len);
            }
        }
    }
}
