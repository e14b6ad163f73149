//! Append-only operation log, one JSON record per line.
//!
//! Every operation is appended after the feed view has prepared it (so the
//! assigned lids are recorded) and before its writes are dispatched. Replay
//! reads records back in serial order. A torn final line from a crash is
//! cut off when the log is reopened, so later appends start on a clean line.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use super::operation::FeedOperation;
use crate::error::Result;
use crate::types::SerialNum;

const OPLOG_FILE: &str = "oplog.jsonl";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpLogRecord {
    pub serial: SerialNum,
    pub written_at: DateTime<Utc>,
    pub node_id: String,
    pub op: FeedOperation,
}

pub struct OpLog {
    path: PathBuf,
    node_id: String,
    writer: Mutex<BufWriter<File>>,
    last_serial: AtomicU64,
}

impl OpLog {
    /// Open (or create) the log in `dir`, scanning existing records for the last serial.
    pub fn open(dir: &Path, node_id: &str) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(OPLOG_FILE);
        let last_serial = if path.exists() {
            let scan = scan_records(&path)?;
            if scan.valid_len < scan.file_len {
                tracing::warn!(
                    "[OPLOG {}] truncating torn tail of {} from {} to {} bytes",
                    node_id,
                    path.display(),
                    scan.file_len,
                    scan.valid_len
                );
                OpenOptions::new()
                    .write(true)
                    .open(&path)?
                    .set_len(scan.valid_len)?;
            }
            if scan.needs_newline {
                OpenOptions::new().append(true).open(&path)?.write_all(b"\n")?;
            }
            scan.records.last().map(|r| r.serial).unwrap_or(0)
        } else {
            0
        };
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        tracing::info!(
            "[OPLOG {}] opened {} last_serial={}",
            node_id,
            path.display(),
            last_serial
        );
        Ok(OpLog {
            path,
            node_id: node_id.to_string(),
            writer: Mutex::new(BufWriter::new(file)),
            last_serial: AtomicU64::new(last_serial),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn last_serial(&self) -> SerialNum {
        self.last_serial.load(Ordering::Acquire)
    }

    pub fn append(&self, op: &FeedOperation) -> Result<()> {
        let record = OpLogRecord {
            serial: op.serial(),
            written_at: Utc::now(),
            node_id: self.node_id.clone(),
            op: op.clone(),
        };
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        writer.write_all(line.as_bytes())?;
        writer.flush()?;
        self.last_serial.fetch_max(record.serial, Ordering::AcqRel);
        Ok(())
    }

    /// Operations with serial greater than `after`, in log order.
    pub fn read_from(&self, after: SerialNum) -> Result<Vec<FeedOperation>> {
        self.writer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .flush()?;
        Ok(scan_records(&self.path)?
            .records
            .into_iter()
            .filter(|r| r.serial > after)
            .map(|r| r.op)
            .collect())
    }
}

struct Scan {
    records: Vec<OpLogRecord>,
    /// Byte length up to and including the last record that parsed.
    valid_len: u64,
    file_len: u64,
    /// The last good record is complete but its newline was never written.
    needs_newline: bool,
}

fn scan_records(path: &Path) -> Result<Scan> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    let mut offset = 0u64;
    let mut valid_len = 0u64;
    let mut needs_newline = false;
    let mut torn: Option<serde_json::Error> = None;
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let read = reader.read_until(b'\n', &mut buf)?;
        if read == 0 {
            break;
        }
        offset += read as u64;
        if let Some(e) = torn.take() {
            // A bad record followed by more data is corruption, not a torn tail.
            return Err(e.into());
        }
        let terminated = buf.last() == Some(&b'\n');
        let line = String::from_utf8_lossy(&buf);
        if line.trim().is_empty() {
            if terminated {
                valid_len = offset;
            }
            continue;
        }
        match serde_json::from_str::<OpLogRecord>(line.trim_end()) {
            Ok(record) => {
                records.push(record);
                valid_len = offset;
                needs_newline = !terminated;
            }
            Err(e) => {
                tracing::warn!(
                    "[OPLOG] skipping torn final record in {}: {}",
                    path.display(),
                    e
                );
                torn = Some(e);
            }
        }
    }
    Ok(Scan {
        records,
        valid_len,
        file_len: offset,
        needs_newline,
    })
}
