//! TCP accept loop for inbound packs.
//!
//! One envelope per connection: admitted peers get their request read to
//! EOF (size-capped), handed to the executor, and the transcript written
//! back. Concurrency is bounded by a counting semaphore acquired in the
//! accept loop, so at most `max_conns` connections are ever in flight and
//! the listener itself backpressures once the bound is reached. Each
//! socket read and write is wrapped in the configured I/O timeout; a slow
//! or stalled peer surfaces as `read_failed`, never as a wedged task.

use std::sync::Arc;
use std::time::Duration;

use actionpack_core::PackExecutor;
use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::admission::PeerFilter;

/// Connection-level limits.
#[derive(Debug, Clone, Copy)]
pub struct ServerLimits {
    /// Maximum concurrently handled connections.
    pub max_conns: usize,
    /// Per-read/per-write socket timeout.
    pub io_timeout: Duration,
    /// Request size cap in bytes.
    pub max_request_bytes: usize,
}

/// The receiver's connection server.
pub struct PackServer {
    executor: Arc<PackExecutor>,
    filter: PeerFilter,
    limits: ServerLimits,
}

impl PackServer {
    #[must_use]
    pub fn new(executor: Arc<PackExecutor>, filter: PeerFilter, limits: ServerLimits) -> Self {
        Self {
            executor,
            filter,
            limits,
        }
    }

    /// Runs the accept loop until the listener fails.
    ///
    /// # Errors
    ///
    /// Returns an error when `accept` fails in a non-transient way.
    pub async fn run(self, listener: TcpListener) -> Result<()> {
        let local = listener.local_addr().context("listener has no local addr")?;
        info!(%local, "action pack server listening");

        let semaphore = Arc::new(Semaphore::new(self.limits.max_conns.max(1)));
        loop {
            let (stream, peer) = listener.accept().await.context("accept failed")?;

            if !self.filter.allows(&peer) {
                debug!(%peer, "peer denied");
                drop(stream);
                continue;
            }

            // Blocking acquire in the accept loop is the concurrency bound:
            // no task is spawned until a permit is free.
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .context("semaphore closed")?;
            let executor = Arc::clone(&self.executor);
            let limits = self.limits;
            tokio::spawn(async move {
                let _permit = permit;
                handle_connection(stream, &executor, limits).await;
            });
        }
    }
}

/// Reads one request, runs it, writes the transcript, closes.
async fn handle_connection(mut stream: TcpStream, executor: &PackExecutor, limits: ServerLimits) {
    let response = match read_request(&mut stream, limits).await {
        Ok(request) => executor.handle_request(&request).await,
        Err(e) => {
            debug!(error = %e, "request read failed");
            "ERR read_failed\n".to_string()
        },
    };

    let write = async {
        stream.write_all(response.as_bytes()).await?;
        stream.shutdown().await
    };
    match tokio::time::timeout(limits.io_timeout, write).await {
        Ok(Ok(())) => {},
        Ok(Err(e)) => warn!(error = %e, "response write failed"),
        Err(_) => warn!("response write timed out"),
    }
}

/// Reads until EOF, capped at `max_request_bytes`; each read gets its own
/// I/O timeout.
async fn read_request(stream: &mut TcpStream, limits: ServerLimits) -> std::io::Result<Vec<u8>> {
    let mut request = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = tokio::time::timeout(limits.io_timeout, stream.read(&mut buf))
            .await
            .map_err(std::io::Error::from)??;
        if n == 0 {
            return Ok(request);
        }
        if request.len() + n > limits.max_request_bytes {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "request exceeds size cap",
            ));
        }
        request.extend_from_slice(&buf[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_request_caps_size() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move {
            let mut s = TcpStream::connect(addr).await.unwrap();
            s.write_all(&[0u8; 64]).await.unwrap();
            s.shutdown().await.unwrap();
        });
        let (mut stream, _) = listener.accept().await.unwrap();
        let limits = ServerLimits {
            max_conns: 1,
            io_timeout: Duration::from_secs(5),
            max_request_bytes: 16,
        };
        assert!(read_request(&mut stream, limits).await.is_err());
        client.await.unwrap();
    }

    #[tokio::test]
    async fn read_request_reads_to_eof() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move {
            let mut s = TcpStream::connect(addr).await.unwrap();
            s.write_all(b"hello ").await.unwrap();
            s.write_all(b"world").await.unwrap();
            s.shutdown().await.unwrap();
        });
        let (mut stream, _) = listener.accept().await.unwrap();
        let limits = ServerLimits {
            max_conns: 1,
            io_timeout: Duration::from_secs(5),
            max_request_bytes: 1024,
        };
        assert_eq!(read_request(&mut stream, limits).await.unwrap(), b"hello world");
        client.await.unwrap();
    }
}
