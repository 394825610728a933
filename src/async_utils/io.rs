//! File output helpers.
//!
//! Everything we write into an output tree goes through
//! [`write_file_atomically_if`], so a reader (or a crash, or a cancelled
//! batch) never sees a half-written page.

use std::io::Write as _;

use tokio::{
    fs::File,
    io::{AsyncWriteExt as _, BufWriter},
};

use super::blocking::spawn_blocking_propagating_panics;
use crate::prelude::*;

/// Write `data` to `path` via a temporary file in the same directory.
pub async fn write_file_atomically(path: &Path, data: Vec<u8>) -> Result<()> {
    write_file_atomically_if(path, data, || true).await?;
    Ok(())
}

/// Write `data` to a temporary file next to `path`, then call `commit`. If
/// it returns `true`, rename the temporary file over `path`; otherwise
/// discard it. Returns whether the file was committed.
pub async fn write_file_atomically_if<F>(path: &Path, data: Vec<u8>, commit: F) -> Result<bool>
where
    F: FnOnce() -> bool + Send + 'static,
{
    let path = path.to_owned();
    spawn_blocking_propagating_panics(move || -> Result<bool> {
        let dir = path
            .parent()
            .ok_or_else(|| anyhow!("{:?} has no parent directory", path))?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("cannot create temporary file in {:?}", dir))?;
        tmp.write_all(&data)
            .with_context(|| format!("cannot write temporary file for {:?}", path))?;
        tmp.flush()
            .with_context(|| format!("cannot flush temporary file for {:?}", path))?;
        if !commit() {
            // Dropping `tmp` deletes it.
            return Ok(false);
        }
        tmp.persist(&path)
            .map_err(|err| err.error)
            .with_context(|| format!("cannot move output into place at {:?}", path))?;
        Ok(true)
    })
    .await
}

/// Writes one JSON value per line.
pub struct JsonlWriter {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlWriter {
    /// Create (or truncate) `path`.
    pub async fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .await
            .with_context(|| format!("cannot create {:?}", path))?;
        Ok(Self {
            path: path.to_owned(),
            writer: BufWriter::new(file),
        })
    }

    /// Append a record.
    pub async fn write<T: Serialize>(&mut self, record: &T) -> Result<()> {
        let mut line =
            serde_json::to_vec(record).context("cannot serialize report record")?;
        line.push(b'\n');
        self.writer
            .write_all(&line)
            .await
            .with_context(|| format!("cannot write to {:?}", self.path))
    }

    /// Flush and close.
    pub async fn finish(mut self) -> Result<()> {
        self.writer
            .flush()
            .await
            .with_context(|| format!("cannot flush {:?}", self.path))
    }
}
