//! Append-only JSON-lines result sink
//!
//! Summaries are buffered and appended in batches to
//! `summaries-<shard>.jsonl`; each batch is one `write_all` followed by
//! `sync_data`, so a crash loses at most the unflushed batch and never leaves
//! a half-written batch behind a later one. `meta-<shard>.json` is replaced
//! atomically every `metadata_every` flushes so another process can tail the
//! run.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::record::{RunMetadata, RunStatus, SummaryRecord};
use crate::{SinkError, SinkResult};

const MAX_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_millis(50);

pub fn summaries_path(dir: &Path, shard: usize) -> PathBuf {
    dir.join(format!("summaries-{shard}.jsonl"))
}

pub fn metadata_path(dir: &Path, shard: usize) -> PathBuf {
    dir.join(format!("meta-{shard}.json"))
}

#[derive(Debug, Clone, Copy)]
pub struct SinkConfig {
    pub batch_size: usize,
    pub metadata_every: usize,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            batch_size: 2000,
            metadata_every: 5,
        }
    }
}

/// Durable append target behind a shard
pub trait ShardFile: Send {
    /// Append `buf` and make it durable
    fn append(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Cut the file back to `len` bytes
    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

impl ShardFile for File {
    fn append(&mut self, buf: &[u8]) -> io::Result<()> {
        self.write_all(buf)?;
        self.sync_data()
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

pub struct JsonlSink {
    path: PathBuf,
    meta_path: PathBuf,
    file: Box<dyn ShardFile>,
    /// Bytes known to be durable
    committed: u64,
    buffer: Vec<u8>,
    pending: usize,
    config: SinkConfig,
    metadata: RunMetadata,
    flushes_since_meta: usize,
}

impl JsonlSink {
    /// Start a fresh shard in `dir`, replacing any previous output for it
    pub fn create(dir: &Path, run_id: &str, shard: usize, shards: usize, config: SinkConfig) -> SinkResult<Self> {
        fs::create_dir_all(dir).map_err(|e| SinkError::io(dir, e))?;
        let path = summaries_path(dir, shard);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| SinkError::io(&path, e))?;
        drop(file);
        let file = OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|e| SinkError::io(&path, e))?;
        Self::with_file(dir, run_id, shard, shards, config, Box::new(file))
    }

    /// Start a shard in `dir` appending through `file`
    pub fn with_file(
        dir: &Path,
        run_id: &str,
        shard: usize,
        shards: usize,
        config: SinkConfig,
        file: Box<dyn ShardFile>,
    ) -> SinkResult<Self> {
        let mut sink = Self {
            meta_path: metadata_path(dir, shard),
            path: summaries_path(dir, shard),
            file,
            committed: 0,
            buffer: Vec::new(),
            pending: 0,
            config: SinkConfig {
                batch_size: config.batch_size.max(1),
                metadata_every: config.metadata_every.max(1),
            },
            metadata: RunMetadata::new(run_id, shard, shards),
            flushes_since_meta: 0,
        };
        sink.write_metadata()?;
        debug!(path = %sink.path.display(), shard, "Result sink opened");
        Ok(sink)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn metadata(&self) -> &RunMetadata {
        &self.metadata
    }

    /// Buffer one summary, flushing when the batch is full
    pub fn push(&mut self, record: &SummaryRecord) -> SinkResult<()> {
        serde_json::to_writer(&mut self.buffer, record)?;
        self.buffer.push(b'\n');
        self.pending += 1;
        if self.pending >= self.config.batch_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Generator counters, persisted with the next metadata write
    pub fn record_progress(&mut self, enumerated: u64, pruned: u64) {
        self.metadata.combinations_enumerated = enumerated;
        self.metadata.combinations_pruned = pruned;
    }

    pub fn flush(&mut self) -> SinkResult<()> {
        if self.pending == 0 {
            return Ok(());
        }
        self.append_with_retry()?;
        self.metadata.strategies_written += self.pending as u64;
        self.metadata.batches_flushed += 1;
        self.pending = 0;
        self.buffer.clear();

        self.flushes_since_meta += 1;
        if self.flushes_since_meta >= self.config.metadata_every {
            self.write_metadata()?;
        }
        Ok(())
    }

    /// Flush the tail and mark the shard complete. A failed flush marks it failed.
    pub fn finish(mut self) -> SinkResult<RunMetadata> {
        if let Err(e) = self.flush() {
            self.metadata.status = RunStatus::Failed;
            self.metadata.error = Some(e.to_string());
            if let Err(meta) = self.write_metadata() {
                warn!(path = %self.meta_path.display(), error = %meta, "Failed to record shard failure");
            }
            return Err(e);
        }
        self.metadata.status = RunStatus::Complete;
        self.write_metadata()?;
        info!(
            shard = self.metadata.shard,
            written = self.metadata.strategies_written,
            batches = self.metadata.batches_flushed,
            "Result sink complete"
        );
        Ok(self.metadata)
    }

    /// Record a failed run. Already-flushed batches stay valid.
    pub fn fail(mut self, message: &str) -> SinkResult<RunMetadata> {
        self.metadata.status = RunStatus::Failed;
        self.metadata.error = Some(message.to_string());
        self.write_metadata()?;
        Ok(self.metadata)
    }

    fn append_with_retry(&mut self) -> SinkResult<()> {
        let mut delay = INITIAL_BACKOFF;
        let mut attempt = 1;
        loop {
            let error = match self.file.append(&self.buffer) {
                Ok(()) => {
                    self.committed += self.buffer.len() as u64;
                    return Ok(());
                }
                Err(e) => e,
            };

            // Drop whatever part of the batch reached the file. If that fails
            // a retry would append behind the partial bytes.
            if let Err(trunc) = self.file.truncate(self.committed) {
                warn!(path = %self.path.display(), attempt, error = %error, "Batch append failed");
                return Err(SinkError::io(&self.path, trunc));
            }
            if attempt >= MAX_ATTEMPTS {
                return Err(SinkError::Exhausted {
                    path: self.path.clone(),
                    attempts: attempt,
                    source: error,
                });
            }
            warn!(
                path = %self.path.display(),
                attempt,
                error = %error,
                "Batch append failed, retrying"
            );
            std::thread::sleep(delay);
            delay *= 2;
            attempt += 1;
        }
    }

    fn write_metadata(&mut self) -> SinkResult<()> {
        self.metadata.updated_at = Utc::now();
        write_json_atomic(&self.meta_path, &self.metadata)?;
        self.flushes_since_meta = 0;
        Ok(())
    }
}

/// Write JSON to a sibling temp file, sync it and rename over `path`
pub fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> SinkResult<()> {
    let tmp = path.with_extension("json.tmp");
    let bytes = serde_json::to_vec_pretty(value)?;
    let mut file = File::create(&tmp).map_err(|e| SinkError::io(&tmp, e))?;
    file.write_all(&bytes).map_err(|e| SinkError::io(&tmp, e))?;
    file.sync_data().map_err(|e| SinkError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| SinkError::io(path, e))?;
    Ok(())
}

pub fn read_metadata(path: &Path) -> SinkResult<RunMetadata> {
    let raw = fs::read_to_string(path).map_err(|e| SinkError::io(path, e))?;
    serde_json::from_str(&raw).map_err(|e| SinkError::Corrupt {
        path: path.to_path_buf(),
        line: e.line(),
        message: e.to_string(),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::{Arc, Mutex};

    pub(crate) fn record(name: &str, shard: usize) -> SummaryRecord {
        SummaryRecord {
            combination_hash: format!("hash-{name}"),
            name: name.to_string(),
            side_factor: "home".to_string(),
            size_factor: "flat".to_string(),
            optional_factors: vec![],
            total_bets: 20,
            wins: 12,
            losses: 7,
            pushes: 1,
            skipped: 0,
            total_stake: dec!(2000),
            total_payout: dec!(2210.50),
            total_profit: dec!(210.50),
            roi: dec!(10.53),
            win_rate: dec!(60),
            avg_odds: dec!(1.92),
            max_drawdown: dec!(300),
            max_consecutive_losses: 3,
            run_id: "run-1".to_string(),
            shard,
        }
    }

    fn lines(path: &Path) -> Vec<SummaryRecord> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_batches_flush_at_size() {
        let dir = tempfile::tempdir().unwrap();
        let config = SinkConfig {
            batch_size: 2,
            metadata_every: 100,
        };
        let mut sink = JsonlSink::create(dir.path(), "run-1", 0, 1, config).unwrap();
        sink.push(&record("a", 0)).unwrap();
        assert!(lines(sink.path()).is_empty());
        sink.push(&record("b", 0)).unwrap();
        assert_eq!(lines(sink.path()).len(), 2);
        sink.push(&record("c", 0)).unwrap();
        assert_eq!(lines(sink.path()).len(), 2);

        let meta = sink.finish().unwrap();
        assert_eq!(meta.status, RunStatus::Complete);
        assert_eq!(meta.strategies_written, 3);
        assert_eq!(meta.batches_flushed, 2);

        let out = lines(&summaries_path(dir.path(), 0));
        assert_eq!(out.len(), 3);
        assert_eq!(out[2], record("c", 0));
        let on_disk = read_metadata(&metadata_path(dir.path(), 0)).unwrap();
        assert_eq!(on_disk, meta);
    }

    #[test]
    fn test_metadata_written_periodically() {
        let dir = tempfile::tempdir().unwrap();
        let config = SinkConfig {
            batch_size: 1,
            metadata_every: 2,
        };
        let mut sink = JsonlSink::create(dir.path(), "run-1", 3, 4, config).unwrap();
        let meta_path = metadata_path(dir.path(), 3);
        assert_eq!(read_metadata(&meta_path).unwrap().status, RunStatus::Running);

        sink.record_progress(10, 4);
        sink.push(&record("a", 3)).unwrap();
        assert_eq!(read_metadata(&meta_path).unwrap().strategies_written, 0);
        sink.push(&record("b", 3)).unwrap();
        let meta = read_metadata(&meta_path).unwrap();
        assert_eq!(meta.strategies_written, 2);
        assert_eq!(meta.combinations_enumerated, 10);
        assert_eq!(meta.combinations_pruned, 4);
        assert_eq!(meta.shards, 4);
    }

    #[test]
    fn test_create_replaces_previous_output() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = JsonlSink::create(dir.path(), "old", 0, 1, SinkConfig::default()).unwrap();
        sink.push(&record("old", 0)).unwrap();
        sink.finish().unwrap();

        let sink = JsonlSink::create(dir.path(), "new", 0, 1, SinkConfig::default()).unwrap();
        let meta = sink.fail("interrupted").unwrap();
        assert!(lines(&summaries_path(dir.path(), 0)).is_empty());
        assert_eq!(meta.status, RunStatus::Failed);
        assert_eq!(meta.error.as_deref(), Some("interrupted"));
    }

    /// In-memory shard that writes half a batch and then errors while
    /// `failing_appends` is positive
    #[derive(Default)]
    struct FlakyState {
        data: Vec<u8>,
        failing_appends: u32,
        truncate_fails: bool,
        appends: u32,
    }

    #[derive(Clone, Default)]
    struct FlakyFile(Arc<Mutex<FlakyState>>);

    impl FlakyFile {
        fn failing(appends: u32, truncate_fails: bool) -> Self {
            Self(Arc::new(Mutex::new(FlakyState {
                failing_appends: appends,
                truncate_fails,
                ..Default::default()
            })))
        }

        fn records(&self) -> Vec<SummaryRecord> {
            let state = self.0.lock().unwrap();
            String::from_utf8(state.data.clone())
                .unwrap()
                .lines()
                .map(|l| serde_json::from_str(l).unwrap())
                .collect()
        }

        fn appends(&self) -> u32 {
            self.0.lock().unwrap().appends
        }
    }

    impl ShardFile for FlakyFile {
        fn append(&mut self, buf: &[u8]) -> io::Result<()> {
            let mut state = self.0.lock().unwrap();
            state.appends += 1;
            if state.failing_appends > 0 {
                state.failing_appends -= 1;
                state.data.extend_from_slice(&buf[..buf.len() / 2]);
                return Err(io::Error::new(io::ErrorKind::Other, "disk hiccup"));
            }
            state.data.extend_from_slice(buf);
            Ok(())
        }

        fn truncate(&mut self, len: u64) -> io::Result<()> {
            let mut state = self.0.lock().unwrap();
            if state.truncate_fails {
                return Err(io::Error::new(io::ErrorKind::Other, "read-only"));
            }
            state.data.truncate(len as usize);
            Ok(())
        }
    }

    fn flaky_sink(dir: &Path, file: &FlakyFile, batch_size: usize) -> JsonlSink {
        let config = SinkConfig {
            batch_size,
            metadata_every: 100,
        };
        JsonlSink::with_file(dir, "run-1", 0, 1, config, Box::new(file.clone())).unwrap()
    }

    #[test]
    fn test_retry_rolls_back_partial_batch() {
        let dir = tempfile::tempdir().unwrap();
        let file = FlakyFile::failing(1, false);
        let mut sink = flaky_sink(dir.path(), &file, 2);
        sink.push(&record("a", 0)).unwrap();
        sink.push(&record("b", 0)).unwrap();
        sink.push(&record("c", 0)).unwrap();
        let meta = sink.finish().unwrap();

        assert_eq!(file.appends(), 3);
        let names: Vec<String> = file.records().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(meta.strategies_written, 3);
        assert_eq!(meta.batches_flushed, 2);
    }

    #[test]
    fn test_failed_rollback_stops_without_retrying() {
        let dir = tempfile::tempdir().unwrap();
        let file = FlakyFile::default();
        let mut sink = flaky_sink(dir.path(), &file, 1);
        sink.push(&record("a", 0)).unwrap();

        file.0.lock().unwrap().failing_appends = 1;
        file.0.lock().unwrap().truncate_fails = true;
        let err = sink.push(&record("b", 0)).unwrap_err();
        assert!(matches!(err, SinkError::Io { .. }));
        assert_eq!(file.appends(), 2);
        assert_eq!(sink.metadata().strategies_written, 1);
    }

    #[test]
    fn test_persistent_failure_exhausts_retries() {
        let dir = tempfile::tempdir().unwrap();
        let file = FlakyFile::failing(u32::MAX, false);
        let mut sink = flaky_sink(dir.path(), &file, 10);
        sink.push(&record("a", 0)).unwrap();

        let err = sink.finish().unwrap_err();
        assert!(matches!(err, SinkError::Exhausted { attempts: 3, .. }));
        assert_eq!(file.appends(), 3);
        assert!(file.records().is_empty());

        let meta = read_metadata(&metadata_path(dir.path(), 0)).unwrap();
        assert_eq!(meta.status, RunStatus::Failed);
        assert!(meta.error.unwrap().contains("3 attempts"));
    }
}
