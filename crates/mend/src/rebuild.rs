//! External image rebuild hook.
//!
//! Rebuilding and republishing an image is somebody else's pipeline; the
//! reconciler only knows how to invoke it and read back success or
//! failure.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

use crate::error::CallError;

/// Opaque collaborator that rebuilds an image artifact and makes it
/// pull-able by the cluster's nodes.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Rebuilder: Send + Sync {
    async fn rebuild_and_publish(&self, image: &str) -> Result<(), CallError>;
}

/// Runs a user-supplied shell command, passing the image reference in
/// `$MEND_IMAGE`.
pub struct ShellRebuilder {
    command: String,
}

impl ShellRebuilder {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl Rebuilder for ShellRebuilder {
    async fn rebuild_and_publish(&self, image: &str) -> Result<(), CallError> {
        info!(image = %image, command = %self.command, "Invoking rebuild hook");
        let output = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("MEND_IMAGE", image)
            .output()
            .await
            .map_err(|e| CallError::Other(format!("failed to spawn rebuild hook: {e}")))?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(image = %image, status = %output.status, "Rebuild hook failed");
            Err(CallError::Other(format!(
                "rebuild hook exited with {}: {}",
                output.status,
                stderr.trim()
            )))
        }
    }
}
