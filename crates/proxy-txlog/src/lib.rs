#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **proxy-txlog** – Append-only transaction log.
//!
//! One file per process, UTF-8 text, one JSON record per line:
//! `{"v":1,"at":"<ISO>","ops":[...]}`. The write protocol is
//! serialize → single `write` → fsync, so a record is either fully durable
//! or the file ends in a truncated tail. The loader tolerates exactly that
//! one truncated trailing line; any interior parse error aborts the load,
//! as does a record with an unknown `v`.
//!
//! The file descriptor has a single owner; appends are serialized behind a
//! mutex. A failed append is fatal to the process — the in-memory store can
//! no longer be committed durably.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use proxy_types::Op;

/// Supported record version.
pub const TXLOG_VERSION: u32 = 1;

/// One journalled operation batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxRecord {
    /// Format version; always [`TXLOG_VERSION`] for records this build writes.
    pub v: u32,
    /// Commit time (ISO-8601).
    pub at: String,
    /// The applied batch, in application order.
    pub ops: Vec<Op>,
}

impl TxRecord {
    /// A version-stamped record.
    pub fn new(at: String, ops: Vec<Op>) -> Self {
        Self {
            v: TXLOG_VERSION,
            at,
            ops,
        }
    }
}

/// Errors raised by the log.
#[derive(Debug, thiserror::Error)]
pub enum TxLogError {
    /// Filesystem failure; fatal on the append path.
    #[error("txlog io error at {path}: {source}")]
    Io {
        /// Log file path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// A record before the trailing line failed to parse.
    #[error("txlog corrupt at {path} line {line}: {reason}")]
    Corrupt {
        /// Log file path.
        path: PathBuf,
        /// 1-based line number.
        line: usize,
        /// Parse failure detail.
        reason: String,
    },
    /// A record carried an unsupported version.
    #[error("txlog record at {path} line {line} has unsupported version {version}")]
    UnsupportedVersion {
        /// Log file path.
        path: PathBuf,
        /// 1-based line number.
        line: usize,
        /// The offending version.
        version: u32,
    },
    /// Record serialization failed before any bytes were written.
    #[error("txlog serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Append-only transaction log with a single-writer file descriptor.
#[derive(Debug)]
pub struct TxLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl TxLog {
    /// Open (creating if absent) the log at `path` for appending.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TxLogError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| TxLogError::Io {
                path: path.clone(),
                source,
            })?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Path the log writes to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record: serialize, single write, fsync.
    pub fn append(&self, record: &TxRecord) -> Result<(), TxLogError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        file.write_all(&line).map_err(|source| TxLogError::Io {
            path: self.path.clone(),
            source,
        })?;
        file.sync_data().map_err(|source| TxLogError::Io {
            path: self.path.clone(),
            source,
        })
    }

    /// Read every durable record from `path`, in append order.
    ///
    /// A single truncated trailing line (a crash between write and fsync)
    /// is ignored. Records with `v != 1` and interior parse errors abort
    /// the load.
    pub fn load(path: impl AsRef<Path>) -> Result<Vec<TxRecord>, TxLogError> {
        let path = path.as_ref().to_path_buf();
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(TxLogError::Io { path, source }),
        };

        let reader = BufReader::new(file);
        let mut lines = Vec::new();
        for (idx, line) in reader.lines().enumerate() {
            let line = line.map_err(|source| TxLogError::Io {
                path: path.clone(),
                source,
            })?;
            lines.push((idx + 1, line));
        }

        let total = lines.len();
        let mut records = Vec::with_capacity(total);
        for (line_no, line) in lines {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TxRecord>(&line) {
                Ok(record) if record.v == TXLOG_VERSION => records.push(record),
                Ok(record) => {
                    return Err(TxLogError::UnsupportedVersion {
                        path,
                        line: line_no,
                        version: record.v,
                    })
                }
                Err(reason) => {
                    if line_no == total {
                        // Torn tail from a crash mid-write; the record never
                        // became durable, so it is dropped.
                        break;
                    }
                    return Err(TxLogError::Corrupt {
                        path,
                        line: line_no,
                        reason: reason.to_string(),
                    });
                }
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proxy_types::{Op, UpsertOp};
    use serde_json::json;

    fn upsert(id: &str) -> Op {
        Op::RobotUpserted(UpsertOp {
            tenant_id: "default".into(),
            id: id.into(),
            record: json!({"id": id}),
        })
    }

    fn record(at: &str, ids: &[&str]) -> TxRecord {
        TxRecord::new(at.into(), ids.iter().map(|id| upsert(id)).collect())
    }

    #[test]
    fn append_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tx.log");

        let log = TxLog::open(&path).unwrap();
        let first = record("2026-08-01T00:00:00.000Z", &["r1"]);
        let second = record("2026-08-01T00:00:01.000Z", &["r2", "r3"]);
        log.append(&first).unwrap();
        log.append(&second).unwrap();

        let loaded = TxLog::load(&path).unwrap();
        assert_eq!(loaded, vec![first, second]);
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(TxLog::load(dir.path().join("absent.log")).unwrap().is_empty());
    }

    #[test]
    fn truncated_trailing_line_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tx.log");

        let log = TxLog::open(&path).unwrap();
        let first = record("2026-08-01T00:00:00.000Z", &["r1"]);
        log.append(&first).unwrap();
        // Simulate a crash mid-write: a torn, never-fsynced tail.
        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(b"{\"v\":1,\"at\":\"2026-")
            .unwrap();

        let loaded = TxLog::load(&path).unwrap();
        assert_eq!(loaded, vec![first]);
    }

    #[test]
    fn interior_corruption_aborts_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tx.log");

        let log = TxLog::open(&path).unwrap();
        log.append(&record("2026-08-01T00:00:00.000Z", &["r1"])).unwrap();
        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(b"not json\n")
            .unwrap();
        log.append(&record("2026-08-01T00:00:02.000Z", &["r2"])).unwrap();

        match TxLog::load(&path) {
            Err(TxLogError::Corrupt { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected corruption error, got {other:?}"),
        }
    }

    #[test]
    fn unknown_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tx.log");
        std::fs::write(&path, "{\"v\":2,\"at\":\"2026-08-01T00:00:00.000Z\",\"ops\":[]}\n")
            .unwrap();

        match TxLog::load(&path) {
            Err(TxLogError::UnsupportedVersion { version, .. }) => assert_eq!(version, 2),
            other => panic!("expected version error, got {other:?}"),
        }
    }
}
