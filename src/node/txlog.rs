//! Transaction phase log
//!
//! Append-only record of 2PC phase transitions on the coordinator, so a
//! restarted coordinator knows which rounds it left undecided.
//! Line format: `<crc32 hex> <json record>\n`, CRC over the JSON bytes.
//!
//! Only the coordinator side is logged. Participants keep nothing on disk.

use crate::common::{crc32, Error, LogSyncPolicy, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxnPhase {
    /// PREPARE about to be sent
    Prepare,
    /// Decision: commit
    Commit,
    /// Decision: abort
    Abort,
    /// Commit applied locally
    Complete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxnRecord {
    pub sequence: u64,
    pub txn_id: Uuid,
    pub phase: TxnPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub at: DateTime<Utc>,
}

/// What a replay found unfinished
#[derive(Debug, Default)]
pub struct RecoveryReport {
    /// PREPARE logged, no decision: no participant can have committed
    pub in_doubt: Vec<TxnRecord>,
    /// COMMIT decided but never marked complete
    pub unfinished_commits: Vec<TxnRecord>,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.in_doubt.is_empty() && self.unfinished_commits.is_empty()
    }
}

pub struct TxnLog {
    path: PathBuf,
    writer: BufWriter<File>,
    next_sequence: u64,
    sync_policy: LogSyncPolicy,
    /// Rounds appended through this handle and not yet settled
    open: HashSet<Uuid>,
    /// Commits a previous run never completed; kept across compaction
    carried: Vec<TxnRecord>,
}

impl TxnLog {
    /// Open or create the log, resuming after its last valid record.
    pub fn open(path: impl AsRef<Path>, sync_policy: LogSyncPolicy) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut next_sequence = 0;
        Self::replay(&path, |record| {
            next_sequence = next_sequence.max(record.sequence + 1);
            Ok(())
        })?;

        let carried = Self::recover(&path)?.unfinished_commits;
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path,
            writer: BufWriter::new(file),
            next_sequence,
            sync_policy,
            open: HashSet::new(),
            carried,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one phase transition; returns its sequence number.
    pub fn append(&mut self, txn_id: Uuid, phase: TxnPhase, query: Option<&str>) -> Result<u64> {
        let sequence = self.write_record(TxnRecord {
            sequence: self.next_sequence,
            txn_id,
            phase,
            query: query.map(str::to_string),
            at: Utc::now(),
        })?;

        match phase {
            TxnPhase::Prepare => {
                self.open.insert(txn_id);
            }
            TxnPhase::Abort | TxnPhase::Complete => {
                self.open.remove(&txn_id);
            }
            TxnPhase::Commit => {}
        }
        Ok(sequence)
    }

    fn write_record(&mut self, record: TxnRecord) -> Result<u64> {
        let body = serde_json::to_vec(&record)?;
        write!(self.writer, "{:08x} ", crc32(&body))?;
        self.writer.write_all(&body)?;
        self.writer.write_all(b"\n")?;
        self.maybe_sync()?;

        self.next_sequence = record.sequence + 1;
        Ok(record.sequence)
    }

    /// Rounds this handle has seen start and not settle
    pub fn open_rounds(&self) -> usize {
        self.open.len()
    }

    /// Rewrite the log once every round appended here is settled.
    ///
    /// Only the commits a previous run left unfinished survive, so they are
    /// reported again on the next start. Returns whether the log was
    /// rewritten.
    pub fn compact(&mut self) -> Result<bool> {
        if !self.open.is_empty() || self.next_sequence as usize <= self.carried.len() {
            return Ok(false);
        }

        let carried = std::mem::take(&mut self.carried);
        self.truncate()?;
        for (sequence, record) in carried.iter().enumerate() {
            self.write_record(TxnRecord {
                sequence: sequence as u64,
                ..record.clone()
            })?;
        }
        self.carried = carried;
        Ok(true)
    }

    fn maybe_sync(&mut self) -> Result<()> {
        match self.sync_policy {
            LogSyncPolicy::Always => {
                self.writer.flush()?;
                self.writer.get_ref().sync_all()?;
            }
            LogSyncPolicy::Interval => {
                self.writer.flush()?;
            }
            LogSyncPolicy::Never => {}
        }
        Ok(())
    }

    /// Replay records in order, stopping at the first damaged line.
    pub fn replay<F>(path: impl AsRef<Path>, mut callback: F) -> Result<()>
    where
        F: FnMut(TxnRecord) -> Result<()>,
    {
        let file = match File::open(path.as_ref()) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            match Self::parse_line(&line) {
                Ok(record) => callback(record)?,
                Err(e) => {
                    tracing::warn!("transaction log replay stopped at damaged record: {}", e);
                    break;
                }
            }
        }

        Ok(())
    }

    fn parse_line(line: &str) -> Result<TxnRecord> {
        let (crc_hex, body) = line
            .split_once(' ')
            .ok_or_else(|| Error::Internal("missing checksum prefix".into()))?;
        let stored = u32::from_str_radix(crc_hex, 16)
            .map_err(|_| Error::Internal(format!("bad checksum prefix {:?}", crc_hex)))?;
        if crc32(body.as_bytes()) != stored {
            return Err(Error::Integrity {
                expected: crc_hex.to_string(),
                actual: format!("{:08x}", crc32(body.as_bytes())),
            });
        }
        Ok(serde_json::from_str(body)?)
    }

    /// Find transactions the last run left undecided or unfinished.
    pub fn recover(path: impl AsRef<Path>) -> Result<RecoveryReport> {
        let mut last: HashMap<Uuid, TxnRecord> = HashMap::new();
        let mut prepared_query: HashMap<Uuid, Option<String>> = HashMap::new();

        Self::replay(path, |record| {
            if record.phase == TxnPhase::Prepare {
                prepared_query.insert(record.txn_id, record.query.clone());
            }
            last.insert(record.txn_id, record);
            Ok(())
        })?;

        let mut report = RecoveryReport::default();
        for (txn_id, mut record) in last {
            if record.query.is_none() {
                record.query = prepared_query.get(&txn_id).cloned().flatten();
            }
            match record.phase {
                TxnPhase::Prepare => report.in_doubt.push(record),
                TxnPhase::Commit => report.unfinished_commits.push(record),
                TxnPhase::Abort | TxnPhase::Complete => {}
            }
        }
        report.in_doubt.sort_by_key(|r| r.sequence);
        report.unfinished_commits.sort_by_key(|r| r.sequence);
        Ok(report)
    }

    /// Drop every record.
    pub fn truncate(&mut self) -> Result<()> {
        self.writer.flush()?;
        let file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        drop(std::mem::replace(&mut self.writer, BufWriter::new(file)));
        // Reopen in append mode so later writes land at the end.
        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.next_sequence = 0;
        self.open.clear();
        Ok(())
    }

    /// Sync to disk
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }
}
