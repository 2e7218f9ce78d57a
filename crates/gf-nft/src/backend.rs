use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("failed to render ruleset JSON: {0}")]
    Render(#[from] serde_json::Error),
    #[error("failed to run nft: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("nft rejected ruleset: {stderr}")]
    Rejected { stderr: String },
}

impl ApplyError {
    /// The kernel reports operations against an absent table as ENOENT,
    /// which nft surfaces as "No such file or directory".
    pub fn is_missing_table(&self) -> bool {
        matches!(self, Self::Rejected { stderr } if stderr.contains("No such file or directory"))
    }
}

/// Seam between ruleset rendering and the kernel apply. Tests substitute a
/// recording backend; production pipes the payload to `nft -j -f -` so the
/// whole ruleset lands in one atomic transaction.
#[async_trait]
pub trait NftBackend: Send + Sync {
    async fn apply(&self, payload: &str) -> Result<(), ApplyError>;
}

pub struct NftCli;

#[async_trait]
impl NftBackend for NftCli {
    async fn apply(&self, payload: &str) -> Result<(), ApplyError> {
        use tokio::io::AsyncWriteExt;
        use tokio::process::Command;

        let mut child = Command::new("nft")
            .arg("-j")
            .arg("-f")
            .arg("-")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(payload.as_bytes()).await?;
            drop(stdin);
        }

        let output = child.wait_with_output().await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(ApplyError::Rejected { stderr });
        }

        Ok(())
    }
}
