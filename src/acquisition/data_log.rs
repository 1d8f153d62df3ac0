//! Append-only CSV data log, one row per acquisition tick.
//!
//! Column order is fixed when the log is created: `Timestamp`, the inputs in ascending physical
//! index, then the outputs in ascending physical index. Every log is a new file starting with
//! the header; an existing file is never appended to.

use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use crate::config::ChannelLayout;

pub const TIMESTAMP_COLUMN: &str = "Timestamp";

#[derive(Error, Debug)]
pub enum DataLogError {
    #[error("unable to open data log {path:?}: {source}")]
    Open {
        path: PathBuf,
        source: io::Error,
    },
    #[error("row has {actual} columns, the data log has {expected}")]
    RowLength { expected: usize, actual: usize },
    #[error("unable to write data log: {0}")]
    Write(#[from] csv::Error),
    #[error("unable to flush data log: {0}")]
    Flush(#[from] io::Error),
    #[error("data log {0:?} is already closed")]
    Closed(PathBuf),
}

/// Header row for a channel layout
pub fn header(layout: &ChannelLayout) -> Vec<String> {
    std::iter::once(TIMESTAMP_COLUMN.to_owned())
        .chain(layout.inputs.header_labels())
        .chain(layout.outputs.header_labels())
        .collect()
}

#[derive(Debug)]
pub struct DataLog {
    path: PathBuf,
    writer: Option<csv::Writer<File>>,
    columns: usize,
    rows: u64,
}

impl DataLog {
    /// Create a new log at `path`, creating parent directories, and write `header`.
    ///
    /// If `path` already exists the log goes to the first free `{stem}_{n}.{ext}` beside it;
    /// [`DataLog::path`] tells where it ended up.
    pub fn create(path: &Path, header: &[String]) -> Result<Self, DataLogError> {
        let open_err = |source| DataLogError::Open {
            path: path.to_owned(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(open_err)?;
        }
        let (path, file) = create_unique(path).map_err(open_err)?;

        let mut writer = csv::Writer::from_writer(file);
        writer.write_record(header)?;
        writer.flush()?;
        info!("data log opened at '{}'", path.display());

        Ok(Self {
            path,
            writer: Some(writer),
            columns: header.len(),
            rows: 0,
        })
    }

    /// Append one row and flush it, so readers never observe a partial row
    pub fn append(
        &mut self,
        elapsed: Duration,
        inputs: &[f64],
        outputs: &[f64],
    ) -> Result<(), DataLogError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| DataLogError::Closed(self.path.clone()))?;

        let actual = 1 + inputs.len() + outputs.len();
        if actual != self.columns {
            return Err(DataLogError::RowLength {
                expected: self.columns,
                actual,
            });
        }

        let record = std::iter::once(format!("{:.6}", elapsed.as_secs_f64()))
            .chain(inputs.iter().chain(outputs).map(f64::to_string));
        writer.write_record(record)?;
        writer.flush()?;
        self.rows += 1;
        Ok(())
    }

    /// Flush and release the file; a second call reports [`DataLogError::Closed`]
    pub fn close(&mut self) -> Result<(), DataLogError> {
        let mut writer = self
            .writer
            .take()
            .ok_or_else(|| DataLogError::Closed(self.path.clone()))?;
        writer.flush()?;
        info!(
            "data log '{}' closed after {} rows",
            self.path.display(),
            self.rows
        );
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.writer.is_some()
    }
}

/// Create `path`, or the first numbered sibling of it that does not exist yet
fn create_unique(path: &Path) -> io::Result<(PathBuf, File)> {
    let mut attempt = 0u32;
    loop {
        let candidate = match attempt {
            0 => path.to_owned(),
            n => numbered(path, n),
        };
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(file) => return Ok((candidate, file)),
            Err(err) if err.kind() == ErrorKind::AlreadyExists && !candidate.is_dir() => {
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

fn numbered(path: &Path, n: u32) -> PathBuf {
    let stem = path.file_stem().unwrap_or_default().to_string_lossy();
    let name = match path.extension() {
        Some(ext) => format!("{stem}_{n}.{}", ext.to_string_lossy()),
        None => format!("{stem}_{n}"),
    };
    path.with_file_name(name)
}
