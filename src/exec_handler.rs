//! Item handler that runs a shell command per item.

use std::process::Stdio;

use async_trait::async_trait;
use leaseq_queue::{ItemHandler, QueueError, QueueItem};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Pipes each payload to `sh -c <command>`.
///
/// Exit status 0 completes the item; anything else fails it with the
/// command's stderr as the error message.
pub(crate) struct ExecHandler {
    command: String,
}

impl ExecHandler {
    pub(crate) fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl ItemHandler for ExecHandler {
    async fn handle(&self, item: &QueueItem) -> Result<(), QueueError> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("LEASEQ_ITEM_ID", item.id.to_string())
            .env("LEASEQ_RETRY_COUNT", item.retry_count.to_string())
            .env("LEASEQ_WORKER_ID", item.locked_by.clone().unwrap_or_default())
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| QueueError::ExecutionFailed(format!("spawn failed: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A command that ignores stdin may close it early.
            if let Err(e) = stdin.write_all(&item.payload).await {
                debug!("Item {}: stdin closed early: {}", item.id, e);
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| QueueError::ExecutionFailed(format!("wait failed: {}", e)))?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let message = if stderr.is_empty() {
            format!("command exited with {}", output.status)
        } else {
            stderr
        };
        Err(QueueError::ExecutionFailed(message))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use leaseq_queue::{NewItem, QueueItem};

    fn item(payload: &str) -> QueueItem {
        let mut item = QueueItem::pending(7, NewItem::new(0, payload), chrono::Utc::now());
        item.retry_count = 2;
        item
    }

    #[tokio::test]
    async fn test_success() {
        let handler = ExecHandler::new("cat > /dev/null");
        assert!(handler.handle(&item("hello")).await.is_ok());
    }

    #[tokio::test]
    async fn test_payload_and_env_reach_command() {
        let handler = ExecHandler::new(
            r#"test "$(cat)" = "hello" && test "$LEASEQ_ITEM_ID" = 7 && test "$LEASEQ_RETRY_COUNT" = 2"#,
        );
        assert!(handler.handle(&item("hello")).await.is_ok());
    }

    #[tokio::test]
    async fn test_failure_carries_stderr() {
        let handler = ExecHandler::new("echo 'bad page' >&2; exit 3");
        let err = handler.handle(&item("x")).await.unwrap_err();
        assert!(matches!(err, QueueError::ExecutionFailed(ref m) if m == "bad page"));
    }

    #[tokio::test]
    async fn test_failure_without_stderr() {
        let handler = ExecHandler::new("exit 1");
        let err = handler.handle(&item("x")).await.unwrap_err();
        assert!(err.to_string().contains("exited"));
    }
}
