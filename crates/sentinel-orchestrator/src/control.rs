//! Unix socket control transport.
//!
//! ```text
//! ┌───────────────┐   one JSON line    ┌──────────────────┐
//! │ sentinel ctl  │ ─────────────────▶ │  ControlServer   │──▶ Orchestrator::handle
//! │  (dashboard)  │ ◀───────────────── │  task per client │
//! └───────────────┘   one JSON line    └──────────────────┘
//! ```
//!
//! A connection may carry any number of request lines; each gets exactly one
//! response line, in order.

use crate::core::Orchestrator;
use crate::protocol::{Request, Response};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, warn};

/// Longest accepted request line
pub const MAX_LINE: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("bad response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("connection closed before a response arrived")]
    ConnectionClosed,
}

pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
}

impl ControlServer {
    /// Bind `path`, replacing a stale socket file
    pub fn bind(path: impl AsRef<Path>) -> Result<Self, ControlError> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let listener = UnixListener::bind(&path)?;
        info!("Control socket listening on {:?}", path);
        Ok(Self { listener, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept clients forever
    pub async fn serve(&self, orchestrator: Arc<Orchestrator>) -> Result<(), ControlError> {
        loop {
            let (stream, _addr) = self.listener.accept().await?;
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_client(stream, orchestrator).await {
                    warn!("Control client error: {}", e);
                }
                debug!("Control client disconnected");
            });
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        if self.path.exists()
            && let Err(e) = std::fs::remove_file(&self.path)
        {
            warn!("Failed to remove socket file: {}", e);
        }
    }
}

async fn handle_client(stream: UnixStream, orchestrator: Arc<Orchestrator>) -> Result<(), ControlError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        // Never buffers more than one byte past the limit
        let read = (&mut reader)
            .take(MAX_LINE as u64 + 1)
            .read_until(b'\n', &mut buf)
            .await?;
        if read == 0 {
            return Ok(());
        }
        let oversized = buf.len() > MAX_LINE && buf.last() != Some(&b'\n');

        let response = if oversized {
            Response::malformed(format!("request exceeds {MAX_LINE} bytes"))
        } else {
            let line = buf.trim_ascii();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_slice::<Request>(line) {
                Ok(request) => orchestrator.handle(request).await,
                Err(e) => Response::malformed(e),
            }
        };
        let mut encoded = match serde_json::to_vec(&response) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to encode response: {}", e);
                serde_json::to_vec(&Response::malformed("response not encodable"))?
            }
        };
        encoded.push(b'\n');
        write_half.write_all(&encoded).await?;

        // The rest of the oversized line cannot be framed reliably
        if oversized {
            debug!("Dropping control client after an oversized request");
            return Ok(());
        }
    }
}

/// Send one request and wait for its response
pub async fn send(path: impl AsRef<Path>, request: &Request) -> Result<Response, ControlError> {
    let stream = UnixStream::connect(path.as_ref()).await?;
    let (read_half, mut write_half) = stream.into_split();

    let mut encoded = serde_json::to_vec(request)?;
    encoded.push(b'\n');
    write_half.write_all(&encoded).await?;

    let mut lines = BufReader::new(read_half).lines();
    let line = lines
        .next_line()
        .await?
        .ok_or(ControlError::ConnectionClosed)?;
    Ok(serde_json::from_str(&line)?)
}
