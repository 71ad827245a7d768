use std::path::{Path, PathBuf};

use anyhow::Context;
use keel_process::ProcessStatus;
use tokio::{io::AsyncWriteExt, sync::watch, task::JoinHandle};

/// Replaces `path` with the JSON form of `status` via a sibling temp file.
pub async fn write_status(path: &Path, status: &ProcessStatus) -> anyhow::Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir)
            .await
            .context("create status dir")?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let data = serde_json::to_vec_pretty(status).context("serialize status")?;
    let mut f = tokio::fs::File::create(&tmp)
        .await
        .context("create status tmp")?;
    f.write_all(&data).await.context("write status tmp")?;
    f.flush().await.ok();
    tokio::fs::rename(&tmp, path)
        .await
        .context("persist status")?;
    Ok(())
}

/// Rewrites the status file every time the published status changes.
pub fn spawn_writer(path: PathBuf, mut rx: watch::Receiver<ProcessStatus>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let snapshot = rx.borrow_and_update().clone();
            if let Err(e) = write_status(&path, &snapshot).await {
                tracing::warn!(path = %path.display(), error = %format!("{e:#}"), "status file not written");
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
    })
}
