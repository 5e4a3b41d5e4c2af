//! Flat-file snapshot log.
//!
//! Layout is one header line followed by one `timestamp,balance` row per
//! observation, in append order. The file is opened for exactly one append or
//! one full read and closed again.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use balance_watch_core::{Observation, SnapshotStore, WatchError, RECORD_FIELDS};

/// First line of every log file.
pub const HEADER: &str = "timestamp,balance";

#[derive(Debug, Clone)]
pub struct CsvSnapshotStore {
    path: PathBuf,
}

impl CsvSnapshotStore {
    /// Binds a store to `path`. Nothing is touched on disk until the first
    /// append or load.
    #[must_use]
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn storage_error(&self, action: &str, err: &std::io::Error) -> WatchError {
        WatchError::Storage(format!(
            "failed to {action} {}: {err}",
            self.path.display()
        ))
    }

    fn open_for_append(&self) -> Result<File, WatchError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|err| self.storage_error("create parent directory of", &err))?;
            }
        }

        OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&self.path)
            .map_err(|err| self.storage_error("open", &err))
    }

    /// Text that must precede the next row: the header for a fresh file, a
    /// line break when a hand-edited file lost its trailing newline.
    fn row_prefix(&self, file: &mut File) -> Result<String, WatchError> {
        let len = file
            .metadata()
            .map_err(|err| self.storage_error("stat", &err))?
            .len();
        if len == 0 {
            return Ok(format!("{HEADER}\n"));
        }

        let mut last = [0_u8; 1];
        file.seek(SeekFrom::Start(len - 1))
            .and_then(|_| file.read_exact(&mut last))
            .map_err(|err| self.storage_error("read", &err))?;

        Ok(if last[0] == b'\n' {
            String::new()
        } else {
            "\n".to_string()
        })
    }
}

impl SnapshotStore for CsvSnapshotStore {
    fn append(&self, observation: &Observation) -> Result<(), WatchError> {
        let [timestamp, balance] = observation.to_record()?;

        let mut file = self.open_for_append()?;
        let prefix = self.row_prefix(&mut file)?;
        let chunk = format!("{prefix}{timestamp},{balance}\n");

        file.write_all(chunk.as_bytes())
            .and_then(|()| file.sync_all())
            .map_err(|err| self.storage_error("append to", &err))
    }

    fn load_all(&self) -> Result<Vec<Observation>, WatchError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(WatchError::StoreNotFound(self.path.display().to_string()));
            }
            Err(err) => return Err(self.storage_error("read", &err)),
        };

        parse_log(&content)
    }
}

/// Parses the full text of a log file. A zero-byte file is an empty history.
///
/// # Errors
/// Returns [`WatchError::Parse`] naming the 1-based line of the first bad row,
/// or of a missing/unexpected header.
pub fn parse_log(content: &str) -> Result<Vec<Observation>, WatchError> {
    let mut lines = content.lines().enumerate();

    match lines.next() {
        None => return Ok(Vec::new()),
        Some((_, header)) if header == HEADER => {}
        Some((_, other)) => {
            return Err(WatchError::Parse(format!(
                "line 1: expected header '{HEADER}', found '{other}'"
            )));
        }
    }

    lines
        .map(|(index, line)| parse_row(index + 1, line))
        .collect()
}

fn parse_row(line_number: usize, line: &str) -> Result<Observation, WatchError> {
    let mut fields = line.split(',');
    match (fields.next(), fields.next(), fields.next()) {
        (Some(timestamp), Some(balance), None) => Observation::from_record(timestamp, balance)
            .map_err(|err| match err {
                WatchError::Parse(message) => {
                    WatchError::Parse(format!("line {line_number}: {message}"))
                }
                other => other,
            }),
        _ => Err(WatchError::Parse(format!(
            "line {line_number}: expected {} fields ({}), found '{line}'",
            RECORD_FIELDS.len(),
            RECORD_FIELDS.join(",")
        ))),
    }
}
