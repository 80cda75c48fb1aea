use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::{LedgerEntry, LedgerError};

/// Write-only destination for ledger entries.
pub trait TelemetrySink: Send + Sync {
    fn record(&self, entry: &LedgerEntry) -> Result<(), LedgerError>;
}

/// Append-only JSON lines file, one entry per line.
pub struct JsonlSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| LedgerError::Io(e.to_string()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| LedgerError::Io(e.to_string()))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TelemetrySink for JsonlSink {
    fn record(&self, entry: &LedgerEntry) -> Result<(), LedgerError> {
        let line = serde_json::to_string(entry).map_err(|e| LedgerError::Parse(e.to_string()))?;
        let mut file = self.file.lock().map_err(|_| LedgerError::Io("lock".into()))?;
        writeln!(file, "{line}").map_err(|e| LedgerError::Io(e.to_string()))
    }
}

/// Keeps every entry in memory, unbounded. For tests and short-lived demos only.
#[derive(Default)]
pub struct MemorySink {
    entries: Mutex<Vec<LedgerEntry>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl TelemetrySink for MemorySink {
    fn record(&self, entry: &LedgerEntry) -> Result<(), LedgerError> {
        let mut entries = self.entries.lock().map_err(|_| LedgerError::Io("lock".into()))?;
        entries.push(entry.clone());
        Ok(())
    }
}

/// Discards every entry. Used when no ledger file is configured.
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn record(&self, _entry: &LedgerEntry) -> Result<(), LedgerError> {
        Ok(())
    }
}

/// Last `n` entries of a JSONL ledger. A missing file reads as empty.
pub fn tail(path: impl AsRef<Path>, n: usize) -> Result<Vec<LedgerEntry>, LedgerError> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path).map_err(|e| LedgerError::Io(e.to_string()))?;
    let mut last = VecDeque::with_capacity(n);
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| LedgerError::Io(e.to_string()))?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: LedgerEntry =
            serde_json::from_str(&line).map_err(|e| LedgerError::Parse(e.to_string()))?;
        if n == 0 {
            continue;
        }
        if last.len() == n {
            last.pop_front();
        }
        last.push_back(entry);
    }
    Ok(last.into())
}
