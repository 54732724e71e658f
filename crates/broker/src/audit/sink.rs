//! Audit record destinations.

use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use thiserror::Error;

use super::AuditRecord;

/// Failure to write an audit record.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AuditSinkError {
    /// The sink could not be written.
    #[error("audit sink I/O failure: {0}")]
    Io(#[from] std::io::Error),

    /// The sink rejected the record.
    #[error("audit sink rejected record: {0}")]
    Rejected(String),
}

/// Destination for audit records.
///
/// Writes happen on the request path, in request order, so implementations
/// should be quick. Errors are logged by the recorder and never reach clients.
pub trait AuditSink: Send + Sync {
    /// Writes one record.
    fn write(&self, record: &AuditRecord) -> Result<(), AuditSinkError>;
}

impl<S: AuditSink + ?Sized> AuditSink for Arc<S> {
    fn write(&self, record: &AuditRecord) -> Result<(), AuditSinkError> {
        (**self).write(record)
    }
}

/// Appends records to one file per UTC day, `audit-YYYY-MM-DD.log`.
pub struct FileAuditSink {
    dir: PathBuf,
    current: Mutex<Option<(NaiveDate, File)>>,
}

impl FileAuditSink {
    /// Opens a sink writing into `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if `dir` does not exist or today's file cannot be opened.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, AuditSinkError> {
        let dir = dir.into();
        let today = Utc::now().date_naive();
        let file = open_day_file(&dir, today)?;
        Ok(Self { dir, current: Mutex::new(Some((today, file))) })
    }

    /// Directory receiving the files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file holding records written on `day`.
    #[must_use]
    pub fn file_for(&self, day: NaiveDate) -> PathBuf {
        day_file_path(&self.dir, day)
    }
}

impl AuditSink for FileAuditSink {
    fn write(&self, record: &AuditRecord) -> Result<(), AuditSinkError> {
        fail::fail_point!("audit-file-write", |_| {
            Err(AuditSinkError::Rejected("injected audit failure".into()))
        });

        let day = record.timestamp.date_naive();
        let mut current = self.current.lock();
        if !matches!(&*current, Some((open_day, _)) if *open_day == day) {
            *current = Some((day, open_day_file(&self.dir, day)?));
        }
        if let Some((_, file)) = current.as_mut() {
            writeln!(file, "{record}")?;
            file.flush()?;
        }
        Ok(())
    }
}

fn day_file_path(dir: &Path, day: NaiveDate) -> PathBuf {
    dir.join(format!("audit-{}.log", day.format("%Y-%m-%d")))
}

fn open_day_file(dir: &Path, day: NaiveDate) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(day_file_path(dir, day))
}

/// Emits each record as an `info` level `tracing` event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn write(&self, record: &AuditRecord) -> Result<(), AuditSinkError> {
        tracing::info!(
            audit.transaction_id = %record.transaction_id,
            audit.result = record.result,
            audit.app_id = %record.app_id,
            audit.operation = %record.operation,
            audit.provider = record.provider.as_deref().unwrap_or_default(),
            audit.node = %record.node,
            "audit_record"
        );
        Ok(())
    }
}
