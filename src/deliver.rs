//! Writing snapshots to disk and finding them again.
//!
//! Files are named `<timestamp_ms>.<ext>` after the end of the window they
//! cover, so the newest file sorts last numerically.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

use callgauge_runtime::{Profiler, RenderOptions, Renderer, Snapshot};

use crate::error::Error;
use crate::json::JsonRenderer;

/// Directory snapshots are delivered to.
///
/// Uses `CALLGAUGE_SNAPSHOT_DIR` if set, otherwise `~/.callgauge/snapshots/`.
pub fn snapshot_dir() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var("CALLGAUGE_SNAPSHOT_DIR") {
        return Some(PathBuf::from(dir));
    }
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".callgauge").join("snapshots"))
}

/// Snapshot `profiler`, render it, and write it under `dir`. Returns the path
/// written.
pub fn write_snapshot(
    profiler: &Profiler,
    renderer: &dyn Renderer,
    options: &RenderOptions,
    dir: &Path,
) -> Result<PathBuf, Error> {
    write_snapshot_file(&profiler.snapshot(), renderer, options, dir)
}

/// Render an already built snapshot and write it under `dir`.
///
/// Two snapshots stamped with the same millisecond get consecutive names;
/// an existing file is never overwritten.
pub fn write_snapshot_file(
    snapshot: &Snapshot,
    renderer: &dyn Renderer,
    options: &RenderOptions,
    dir: &Path,
) -> Result<PathBuf, Error> {
    let rendered = renderer.render(snapshot, options)?;
    std::fs::create_dir_all(dir)?;

    let mut stamp = u128::from(snapshot.ended_at_ms);
    let (path, mut file) = loop {
        let candidate = dir.join(format!("{stamp}.{}", renderer.extension()));
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(file) => break (candidate, file),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => stamp += 1,
            Err(e) => return Err(e.into()),
        }
    };
    file.write_all(rendered.as_bytes())?;
    log::debug!("wrote snapshot {}", path.display());
    Ok(path)
}

/// Newest `<timestamp_ms>.json` file in `dir`.
pub fn latest_snapshot(dir: &Path) -> Result<PathBuf, Error> {
    let entries: Vec<(u128, PathBuf)> = std::fs::read_dir(dir)
        .map_err(|source| Error::SnapshotReadError {
            path: dir.to_path_buf(),
            source,
        })?
        .filter_map(|entry| {
            let path = entry.ok()?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                return None;
            }
            let stamp: u128 = path.file_stem()?.to_str()?.parse().ok()?;
            Some((stamp, path))
        })
        .collect();

    entries
        .into_iter()
        .max_by_key(|(stamp, _)| *stamp)
        .map(|(_, path)| path)
        .ok_or_else(|| Error::NoSnapshots(dir.to_path_buf()))
}

/// Background thread that delivers a JSON snapshot every `interval`, and
/// once more when stopped or dropped. Empty snapshots are skipped.
pub struct SnapshotDumper {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
    profiler: Profiler,
    dir: PathBuf,
}

impl SnapshotDumper {
    pub fn spawn(profiler: Profiler, dir: PathBuf, interval: Duration) -> Result<Self, Error> {
        let (stop, stopped) = mpsc::channel::<()>();
        let worker_profiler = profiler.clone();
        let worker_dir = dir.clone();
        let handle = std::thread::Builder::new()
            .name("callgauge-dumper".to_owned())
            .spawn(move || loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if let Err(e) = deliver(&worker_profiler, &worker_dir) {
                            log::warn!("periodic snapshot failed: {e}");
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;
        log::info!(
            "delivering snapshots to {} every {:?}",
            dir.display(),
            interval
        );
        Ok(Self {
            stop: Some(stop),
            handle: Some(handle),
            profiler,
            dir,
        })
    }

    /// Stop the thread and write a final snapshot. Returns its path, or
    /// `None` when nothing had been recorded.
    pub fn stop(mut self) -> Result<Option<PathBuf>, Error> {
        self.finish()
    }

    fn finish(&mut self) -> Result<Option<PathBuf>, Error> {
        let Some(stop) = self.stop.take() else {
            return Ok(None);
        };
        drop(stop);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("snapshot dumper thread panicked");
            }
        }
        deliver(&self.profiler, &self.dir)
    }
}

impl Drop for SnapshotDumper {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            log::warn!("final snapshot failed: {e}");
        }
    }
}

fn deliver(profiler: &Profiler, dir: &Path) -> Result<Option<PathBuf>, Error> {
    let snapshot = profiler.snapshot();
    if snapshot.is_empty() {
        return Ok(None);
    }
    write_snapshot_file(&snapshot, &JsonRenderer, &RenderOptions::default(), dir).map(Some)
}
