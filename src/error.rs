use std::path::PathBuf;

use callgauge_runtime::RenderError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no callgauge snapshots found in {} -- deliver one with write_snapshot or SnapshotDumper", .0.display())]
    NoSnapshots(PathBuf),

    #[error("failed to read snapshot file {}: {source}", path.display())]
    SnapshotReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid snapshot data in {}: {reason}", path.display())]
    InvalidSnapshot { path: PathBuf, reason: String },

    #[error("{0}")]
    Render(#[from] RenderError),

    #[error("{0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Io(#[from] std::io::Error),
}
