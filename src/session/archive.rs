// Optional on-disk archive of finished sessions

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::debug;

use super::SessionSnapshot;

/// Write a finished session to `<dir>/<id>.json`, creating `dir` if needed.
pub async fn write_snapshot(dir: &Path, snapshot: &SessionSnapshot) -> io::Result<PathBuf> {
    fs::create_dir_all(dir).await?;

    let path = dir.join(format!("{}.json", snapshot.id));
    let body = serde_json::to_vec_pretty(snapshot).map_err(io::Error::other)?;
    fs::write(&path, body).await?;

    debug!(session_id = %snapshot.id, path = %path.display(), "Session archived");
    Ok(path)
}
