//! Declared-length file streaming
//!
//! Moves exactly `declared` bytes between a file and a socket. A receive
//! lands in a scratch file and only replaces the destination once every
//! byte is on disk, so a failed receive leaves the folder as it was.

use crate::transport::{with_timeout, FrameReader};
use crate::{Error, Result, CHUNK_SIZE};
use std::path::Path;
use std::time::Duration;
use tempfile::TempPath;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Turns byte counts into whole percentages, reporting each value once
#[derive(Debug)]
pub struct ProgressTracker {
    total: u64,
    last: Option<u8>,
}

impl ProgressTracker {
    pub fn new(total: u64) -> Self {
        Self { total, last: None }
    }

    /// Returns the new percentage if it changed since the last update
    pub fn update(&mut self, transferred: u64) -> Option<u8> {
        let percent = if self.total == 0 {
            100
        } else {
            let scaled = u128::from(transferred.min(self.total)) * 100 / u128::from(self.total);
            scaled as u8
        };
        if self.last == Some(percent) {
            return None;
        }
        self.last = Some(percent);
        Some(percent)
    }
}

/// Open a hidden scratch file next to the final destination. The scratch
/// file is removed when its [`TempPath`] drops without being persisted,
/// which covers early returns and cancelled futures alike.
fn scratch_file(dir: &Path) -> std::io::Result<(File, TempPath)> {
    let (file, path) = tempfile::Builder::new()
        .prefix(".partial-")
        .tempfile_in(dir)?
        .into_parts();
    Ok((File::from_std(file), path))
}

/// Receive `declared` bytes from `reader` into `dest`.
///
/// The reader is left positioned on the first byte after the payload.
/// When the local disk fails, the rest of the payload is drained so the
/// stream stays in sync for whoever reads it next. `stall` bounds each
/// individual read.
pub async fn receive_file<R, F>(
    reader: &mut FrameReader<R>,
    dest: &Path,
    declared: u64,
    stall: Option<Duration>,
    mut on_progress: F,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    F: FnMut(u8),
{
    let dir = match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    if let Err(e) = tokio::fs::create_dir_all(dir).await {
        drain(reader, declared, stall).await?;
        return Err(Error::filesystem(format!("create {}", dir.display()), e));
    }

    let (mut file, partial) = match scratch_file(dir) {
        Ok(scratch) => scratch,
        Err(e) => {
            drain(reader, declared, stall).await?;
            return Err(Error::filesystem(format!("create file in {}", dir.display()), e));
        }
    };

    let mut tracker = ProgressTracker::new(declared);
    let mut total = 0u64;
    if let Some(percent) = tracker.update(0) {
        on_progress(percent);
    }

    while total < declared {
        let want = (declared - total).min(CHUNK_SIZE as u64) as usize;
        let chunk = with_timeout(stall, reader.read_chunk(want)).await?;
        if chunk.is_empty() {
            return Err(Error::TransferIntegrity {
                expected: declared,
                actual: total,
            });
        }

        if let Err(e) = file.write_all(&chunk).await {
            let remaining = declared - total - chunk.len() as u64;
            drain(reader, remaining, stall).await?;
            return Err(Error::filesystem(format!("write {}", dest.display()), e));
        }

        total += chunk.len() as u64;
        if let Some(percent) = tracker.update(total) {
            on_progress(percent);
        }
    }

    file.flush()
        .await
        .map_err(|e| Error::filesystem(format!("flush {}", dest.display()), e))?;
    drop(file);

    // Final consistency guard against what actually landed on disk
    let written = tokio::fs::metadata(&partial)
        .await
        .map_err(|e| Error::filesystem(format!("stat {}", partial.display()), e))?
        .len();
    if written != declared {
        return Err(Error::TransferIntegrity {
            expected: declared,
            actual: written,
        });
    }

    partial
        .persist(dest)
        .map_err(|e| Error::filesystem(format!("rename into {}", dest.display()), e.error))?;
    Ok(total)
}

async fn drain<R: AsyncRead + Unpin>(
    reader: &mut FrameReader<R>,
    remaining: u64,
    stall: Option<Duration>,
) -> Result<()> {
    let skipped = reader.skip(remaining, stall).await?;
    if skipped < remaining {
        tracing::debug!("Stream ended while draining: {} of {} bytes", skipped, remaining);
    }
    Ok(())
}

/// Stream exactly `declared` bytes of `source` into `writer`, then flush.
///
/// A source that runs out early is a [`Error::TransferIntegrity`]; the
/// payload never runs past `declared` even if the file has grown.
pub async fn send_file<W, F>(
    writer: &mut W,
    source: &mut File,
    declared: u64,
    stall: Option<Duration>,
    mut on_progress: F,
) -> Result<u64>
where
    W: AsyncWrite + Unpin,
    F: FnMut(u8),
{
    let mut tracker = ProgressTracker::new(declared);
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;

    while total < declared {
        let want = (declared - total).min(CHUNK_SIZE as u64) as usize;
        let n = source
            .read(&mut buf[..want])
            .await
            .map_err(|e| Error::filesystem("read source file", e))?;
        if n == 0 {
            return Err(Error::TransferIntegrity {
                expected: declared,
                actual: total,
            });
        }

        let write = async {
            writer
                .write_all(&buf[..n])
                .await
                .map_err(|e| Error::connection("send failed", e))
        };
        with_timeout(stall, write).await?;

        total += n as u64;
        if let Some(percent) = tracker.update(total) {
            on_progress(percent);
        }
    }

    let flush = async {
        writer
            .flush()
            .await
            .map_err(|e| Error::connection("flush failed", e))
    };
    with_timeout(stall, flush).await?;

    if declared == 0 {
        if let Some(percent) = tracker.update(0) {
            on_progress(percent);
        }
    }
    Ok(total)
}
