//! # Line Readers
//!
//! [`LineReader`] walks a static log file once, for queries. Failures are
//! returned to the caller immediately.
//!
//! [`read_lines_retrying`] is for files that are still being written. It
//! retries transient I/O errors, resumes from the last complete line, and
//! treats end-of-file as a normal stop.

use crate::error::{QueryError, Result};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};

/// Sequential reader yielding `(line_number, line)` with 1-based numbering.
/// The final line is returned even without a trailing newline.
pub struct LineReader {
    path: PathBuf,
    inner: BufReader<File>,
    line_number: u64,
    buf: Vec<u8>,
}

impl LineReader {
    pub async fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .await
            .map_err(|e| QueryError::read(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            inner: BufReader::new(file),
            line_number: 0,
            buf: Vec::with_capacity(1024),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Next line without its terminator, or `None` at end of file.
    pub async fn next_line(&mut self) -> Result<Option<(u64, &[u8])>> {
        self.buf.clear();
        let n = self
            .inner
            .read_until(b'\n', &mut self.buf)
            .await
            .map_err(|e| QueryError::read(&self.path, e))?;
        if n == 0 {
            return Ok(None);
        }
        self.line_number += 1;
        Ok(Some((self.line_number, strip_terminator(&self.buf))))
    }
}

/// Retry behaviour for [`read_lines_retrying`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub pause: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            pause: Duration::from_secs(30),
        }
    }
}

/// Delivers every complete line after `offset` to `on_line` and returns the
/// offset just past the last one delivered.
///
/// A trailing partial line is left for the next call. If the file shrank
/// below `offset` it is read again from the start.
pub async fn read_lines_retrying<F>(
    path: &Path,
    offset: u64,
    policy: &RetryPolicy,
    mut on_line: F,
) -> Result<u64>
where
    F: FnMut(&[u8]),
{
    let mut offset = offset;
    let mut attempt = 0;
    loop {
        match read_complete_lines(path, &mut offset, &mut on_line).await {
            Ok(()) => return Ok(offset),
            Err(e) => {
                attempt += 1;
                if attempt >= policy.max_attempts {
                    return Err(QueryError::RetriesExhausted {
                        path: path.to_path_buf(),
                        attempts: attempt,
                        source: e,
                    });
                }
                tracing::warn!(
                    path = %path.display(),
                    attempt,
                    error = %e,
                    "read failed, retrying in {:?}",
                    policy.pause
                );
                tokio::time::sleep(policy.pause).await;
            }
        }
    }
}

async fn read_complete_lines<F>(path: &Path, offset: &mut u64, on_line: &mut F) -> std::io::Result<()>
where
    F: FnMut(&[u8]),
{
    let mut file = File::open(path).await?;
    let len = file.metadata().await?.len();
    if len < *offset {
        tracing::debug!(path = %path.display(), "file shrank, reading from the start");
        *offset = 0;
    }
    file.seek(SeekFrom::Start(*offset)).await?;

    let mut reader = BufReader::new(file);
    let mut buf = Vec::with_capacity(1024);
    loop {
        buf.clear();
        let n = reader.read_until(b'\n', &mut buf).await?;
        if n == 0 || buf.last() != Some(&b'\n') {
            return Ok(());
        }
        *offset += n as u64;
        on_line(strip_terminator(&buf));
    }
}

fn strip_terminator(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}
