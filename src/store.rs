//! Durable overflow store
//!
//! Append-only on-disk log used when immediate delivery and in-memory
//! queueing both fail. Each record is one JSON fragment per line (outer
//! array brackets stripped on append); a drain pass re-wraps records
//! into bounded array chunks and hands them back to the send path. The
//! log is deleted only after a pass in which every chunk succeeded.

use crate::error::StoreError;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// Overflow store tuning
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Log file location
    pub path: PathBuf,
    /// Records per outbound chunk on drain
    pub chunk_records: usize,
    /// Files smaller than this are discarded as noise without a send
    pub min_file_bytes: u64,
    /// Lines shorter than this are skipped during a scan
    pub min_line_bytes: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("uplink-overflow.log"),
            chunk_records: 10,
            min_file_bytes: 10,
            min_line_bytes: 5,
        }
    }
}

/// Result of one drain pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
    /// Chunks delivered successfully
    pub chunks_sent: usize,
    /// Chunks that failed (at most 1; a failure aborts the pass)
    pub chunks_failed: usize,
    /// Records read from the log during this pass
    pub records: usize,
    /// Whether the log file was deleted
    pub deleted: bool,
}

impl DrainReport {
    /// Whether every chunk of the pass was delivered
    pub fn clean(&self) -> bool {
        self.chunks_failed == 0
    }
}

/// Append-only overflow log with chunked drain
pub struct OverflowStore {
    config: StoreConfig,
}

impl OverflowStore {
    /// Create a store at the given path with default chunking
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_config(StoreConfig {
            path: path.into(),
            ..Default::default()
        })
    }

    /// Create a store with full tuning
    pub fn with_config(config: StoreConfig) -> Self {
        Self { config }
    }

    /// Log file path
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Whether the log file currently exists
    pub fn exists(&self) -> bool {
        self.config.path.exists()
    }

    /// Current log size in bytes (0 when absent)
    pub fn len_bytes(&self) -> u64 {
        fs::metadata(&self.config.path).map(|m| m.len()).unwrap_or(0)
    }

    /// Append one serialized payload as a log record
    ///
    /// Outer array brackets are stripped so that drain can re-wrap any
    /// number of records into a single array chunk.
    pub fn append(&self, payload: &str) -> Result<(), StoreError> {
        let fragment = Self::strip_brackets(payload);
        if fragment.is_empty() {
            log::debug!("store: empty payload not persisted");
            return Ok(());
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.config.path)
            .map_err(|e| StoreError::Open {
                path: self.config.path.display().to_string(),
                reason: e.to_string(),
            })?;

        writeln!(file, "{}", fragment).map_err(|e| StoreError::Append(e.to_string()))?;
        log::info!("store: payload persisted ({} bytes)", fragment.len());
        Ok(())
    }

    /// Scan the log, resend records in chunks, delete on a clean pass
    ///
    /// `send` receives one JSON array per chunk and reports delivery
    /// success. The first failed chunk aborts the pass: the log stays
    /// intact and the next pass re-scans from the top.
    pub fn drain_and_resend<F>(&self, mut send: F) -> Result<DrainReport, StoreError>
    where
        F: FnMut(&str) -> bool,
    {
        let mut report = DrainReport::default();

        if !self.exists() {
            return Ok(report);
        }

        if self.len_bytes() < self.config.min_file_bytes {
            self.delete()?;
            report.deleted = true;
            log::debug!("store: discarded sub-threshold log as noise");
            return Ok(report);
        }

        let file = File::open(&self.config.path).map_err(|e| StoreError::Open {
            path: self.config.path.display().to_string(),
            reason: e.to_string(),
        })?;
        let reader = BufReader::new(file);

        let mut chunk: Vec<String> = Vec::with_capacity(self.config.chunk_records);
        for line in reader.lines() {
            let line = line.map_err(|e| StoreError::Read(e.to_string()))?;
            let record = line.trim();
            if record.len() < self.config.min_line_bytes {
                continue;
            }

            report.records += 1;
            chunk.push(record.to_string());

            if chunk.len() >= self.config.chunk_records
                && !self.flush_chunk(&mut chunk, &mut report, &mut send)
            {
                return Ok(report);
            }
        }

        if !chunk.is_empty() && !self.flush_chunk(&mut chunk, &mut report, &mut send) {
            return Ok(report);
        }

        if report.clean() && report.chunks_sent > 0 {
            self.delete()?;
            report.deleted = true;
            log::info!(
                "store: drained {} records in {} chunks, log cleared",
                report.records,
                report.chunks_sent
            );
        }

        Ok(report)
    }

    /// Remove the log file
    pub fn delete(&self) -> Result<(), StoreError> {
        fs::remove_file(&self.config.path).map_err(|e| StoreError::Delete(e.to_string()))
    }

    fn flush_chunk<F>(&self, chunk: &mut Vec<String>, report: &mut DrainReport, send: &mut F) -> bool
    where
        F: FnMut(&str) -> bool,
    {
        let wrapped = format!("[{}]", chunk.join(","));
        chunk.clear();

        if send(&wrapped) {
            report.chunks_sent += 1;
            true
        } else {
            report.chunks_failed += 1;
            log::warn!("store: chunk resend failed, aborting drain pass");
            false
        }
    }

    fn strip_brackets(payload: &str) -> &str {
        let trimmed = payload.trim();
        let trimmed = trimmed.strip_prefix('[').unwrap_or(trimmed);
        trimmed.strip_suffix(']').unwrap_or(trimmed).trim()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> OverflowStore {
        OverflowStore::new(dir.path().join("overflow.log"))
    }

    #[test]
    fn test_append_strips_outer_brackets() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        store.append("[{\"temp\":21.5}]").unwrap();
        store.append("{\"temp\":22.0}").unwrap();

        let contents = fs::read_to_string(store.path()).unwrap();
        assert_eq!(contents, "{\"temp\":21.5}\n{\"temp\":22.0}\n");
    }

    #[test]
    fn test_drain_missing_file_is_noop() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        let report = store.drain_and_resend(|_| panic!("nothing to send")).unwrap();
        assert_eq!(report, DrainReport::default());
    }

    #[test]
    fn test_tiny_file_discarded_as_noise() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        fs::write(store.path(), "x\n").unwrap();

        let report = store.drain_and_resend(|_| panic!("noise must not be sent")).unwrap();
        assert!(report.deleted);
        assert_eq!(report.records, 0);
        assert!(!store.exists());
    }

    #[test]
    fn test_clean_drain_chunks_and_deletes() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        for i in 0..23 {
            store.append(&format!("{{\"seq\":{}}}", i)).unwrap();
        }

        let mut chunks: Vec<String> = Vec::new();
        let report = store
            .drain_and_resend(|chunk| {
                chunks.push(chunk.to_string());
                true
            })
            .unwrap();

        // ceil(23 / 10) = 3 chunks, remainder included
        assert_eq!(report.chunks_sent, 3);
        assert_eq!(report.records, 23);
        assert!(report.deleted);
        assert!(!store.exists());

        let first: serde_json::Value = serde_json::from_str(&chunks[0]).unwrap();
        assert_eq!(first.as_array().unwrap().len(), 10);
        let last: serde_json::Value = serde_json::from_str(&chunks[2]).unwrap();
        assert_eq!(last.as_array().unwrap().len(), 3);
    }

    #[test]
    fn test_failed_chunk_aborts_pass_and_keeps_log() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        for i in 0..25 {
            store.append(&format!("{{\"seq\":{}}}", i)).unwrap();
        }

        let mut calls = 0;
        let report = store
            .drain_and_resend(|_| {
                calls += 1;
                calls != 2 // second chunk fails
            })
            .unwrap();

        assert_eq!(report.chunks_sent, 1);
        assert_eq!(report.chunks_failed, 1);
        assert!(!report.deleted);
        assert!(store.exists(), "log must survive a dirty pass");
        assert_eq!(calls, 2, "pass aborts at the failed chunk");

        // Next pass re-reads from the top
        let mut total = 0;
        let report = store
            .drain_and_resend(|chunk| {
                let parsed: serde_json::Value = serde_json::from_str(chunk).unwrap();
                total += parsed.as_array().unwrap().len();
                true
            })
            .unwrap();
        assert_eq!(total, 25);
        assert!(report.deleted);
    }

    #[test]
    fn test_short_lines_skipped() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        fs::write(store.path(), "{\"seq\":1,\"value\":3}\nx,\n{\"seq\":2,\"value\":4}\n").unwrap();

        let mut records = 0;
        store
            .drain_and_resend(|chunk| {
                let parsed: serde_json::Value = serde_json::from_str(chunk).unwrap();
                records += parsed.as_array().unwrap().len();
                true
            })
            .unwrap();
        assert_eq!(records, 2);
    }
}
