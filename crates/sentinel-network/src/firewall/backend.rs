//! Ruleset backends.

use super::model::TABLE;
use async_trait::async_trait;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("ruleset rejected: {0}")]
    Rejected(String),

    #[error("backend unavailable: {0}")]
    Unavailable(#[from] std::io::Error),
}

/// Where rendered rulesets go
#[async_trait]
pub trait FirewallBackend: Send + Sync {
    /// Dry-run the script without touching live state
    async fn validate(&self, script: &str) -> Result<(), BackendError>;

    /// Load the script as one transaction
    async fn load(&self, script: &str) -> Result<(), BackendError>;

    /// Ruleset currently live in the kernel
    async fn current(&self) -> Result<String, BackendError>;
}

/// nftables via the `nft` binary
#[derive(Debug, Clone)]
pub struct NftBackend {
    binary: String,
}

impl NftBackend {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, args: &[&str], stdin: Option<&str>) -> Result<String, BackendError> {
        debug!("{} {}", self.binary, args.join(" "));
        let mut child = Command::new(&self.binary)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let (Some(script), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(script.as_bytes()).await?;
            // Close stdin so nft sees EOF
            drop(pipe);
        }

        let output = child.wait_with_output().await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(BackendError::Rejected(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }
}

impl Default for NftBackend {
    fn default() -> Self {
        Self::new("nft")
    }
}

#[async_trait]
impl FirewallBackend for NftBackend {
    async fn validate(&self, script: &str) -> Result<(), BackendError> {
        self.run(&["-c", "-f", "-"], Some(script)).await.map(|_| ())
    }

    async fn load(&self, script: &str) -> Result<(), BackendError> {
        self.run(&["-f", "-"], Some(script)).await.map(|_| ())
    }

    async fn current(&self) -> Result<String, BackendError> {
        self.run(&["list", "table", "inet", TABLE], None).await
    }
}
