//! Newline-framed socket output shared by client connections and peer links.

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub async fn write_line<W>(writer: &mut W, line: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

/// Spawns a task that forwards queued lines to `writer` until every sender
/// is dropped or a write fails, then runs `on_exit`.
pub fn spawn_line_writer<W, F>(
    mut writer: W,
    mut rx: UnboundedReceiver<String>,
    label: String,
    on_exit: F,
) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
    F: FnOnce() + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if let Err(e) = write_line(&mut writer, &line).await {
                warn!(%label, error = %e, "write failed, closing send loop");
                break;
            }
        }
        let _ = writer.shutdown().await;
        on_exit();
        debug!(%label, "send loop closed");
    })
}
