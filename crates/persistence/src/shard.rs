//! Reading shard files back and merging them
//!
//! A shard can be read while its run is still going or after a crash. The
//! last line may then be incomplete; it is dropped with a warning. Any other
//! unreadable line is an error.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{info, warn};

use crate::record::{RunMetadata, RunStatus, SummaryRecord};
use crate::sink::{metadata_path, read_metadata, write_json_atomic};
use crate::{SinkError, SinkResult};

pub const MERGED_SUMMARIES: &str = "summaries.jsonl";
pub const MERGED_METADATA: &str = "meta.json";

/// Streams the complete records of one shard file
pub struct ShardReader {
    path: PathBuf,
    reader: BufReader<File>,
    line_no: usize,
    line: String,
    truncated: bool,
}

impl ShardReader {
    pub fn open(path: impl AsRef<Path>) -> SinkResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| SinkError::io(&path, e))?;
        Ok(Self {
            path,
            reader: BufReader::new(file),
            line_no: 0,
            line: String::new(),
            truncated: false,
        })
    }

    /// Whether an incomplete trailing line was dropped
    pub fn truncated(&self) -> bool {
        self.truncated
    }
}

impl Iterator for ShardReader {
    type Item = SinkResult<SummaryRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.line.clear();
            let read = match self.reader.read_line(&mut self.line) {
                Ok(n) => n,
                Err(e) => return Some(Err(SinkError::io(&self.path, e))),
            };
            if read == 0 {
                return None;
            }
            self.line_no += 1;
            let complete = self.line.ends_with('\n');
            let text = self.line.trim();
            if text.is_empty() {
                continue;
            }

            return match serde_json::from_str::<SummaryRecord>(text) {
                Ok(record) => Some(Ok(record)),
                Err(_) if !complete => {
                    self.truncated = true;
                    warn!(path = %self.path.display(), line = self.line_no, "Dropping incomplete trailing record");
                    None
                }
                Err(e) => Some(Err(SinkError::Corrupt {
                    path: self.path.clone(),
                    line: self.line_no,
                    message: e.to_string(),
                })),
            };
        }
    }
}

/// Shard files in `dir`, ordered by shard number
pub fn list_shards(dir: &Path) -> SinkResult<Vec<(usize, PathBuf)>> {
    let mut shards = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| SinkError::io(dir, e))? {
        let entry = entry.map_err(|e| SinkError::io(dir, e))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let shard = name
            .strip_prefix("summaries-")
            .and_then(|rest| rest.strip_suffix(".jsonl"))
            .and_then(|n| n.parse::<usize>().ok());
        if let Some(shard) = shard {
            shards.push((shard, entry.path()));
        }
    }
    shards.sort();
    Ok(shards)
}

#[derive(Debug, Clone)]
pub struct MergeReport {
    pub shards: usize,
    pub records: u64,
    pub truncated_shards: usize,
    pub metadata: RunMetadata,
}

/// Concatenate every shard in `dir` into `summaries.jsonl` and combine their
/// metadata into `meta.json`. Shards are read-only inputs.
pub fn merge_shards(dir: &Path, out_dir: &Path) -> SinkResult<MergeReport> {
    let shards = list_shards(dir)?;
    fs::create_dir_all(out_dir).map_err(|e| SinkError::io(out_dir, e))?;

    let out_path = out_dir.join(MERGED_SUMMARIES);
    let tmp_path = out_dir.join(format!("{MERGED_SUMMARIES}.tmp"));
    let file = File::create(&tmp_path).map_err(|e| SinkError::io(&tmp_path, e))?;
    let mut writer = BufWriter::new(file);

    let mut records = 0u64;
    let mut truncated_shards = 0;
    let mut merged: Option<RunMetadata> = None;

    for (shard, path) in &shards {
        let mut reader = ShardReader::open(path)?;
        for record in reader.by_ref() {
            serde_json::to_writer(&mut writer, &record?)?;
            writer.write_all(b"\n").map_err(|e| SinkError::io(&tmp_path, e))?;
            records += 1;
        }
        if reader.truncated() {
            truncated_shards += 1;
        }

        let meta_file = metadata_path(dir, *shard);
        match read_metadata(&meta_file) {
            Ok(meta) => merged = Some(combine(merged, meta)),
            Err(e) => warn!(shard, error = %e, "Shard metadata unreadable"),
        }
    }

    let file = writer
        .into_inner()
        .map_err(|e| SinkError::io(&tmp_path, e.into_error()))?;
    file.sync_data().map_err(|e| SinkError::io(&tmp_path, e))?;
    fs::rename(&tmp_path, &out_path).map_err(|e| SinkError::io(&out_path, e))?;

    let mut metadata = merged.unwrap_or_else(|| RunMetadata::new("", 0, 0));
    metadata.shard = 0;
    metadata.shards = shards.len();
    metadata.strategies_written = records;
    metadata.updated_at = Utc::now();
    write_json_atomic(&out_dir.join(MERGED_METADATA), &metadata)?;

    info!(
        shards = shards.len(),
        records,
        truncated_shards,
        status = ?metadata.status,
        "Shards merged"
    );
    Ok(MergeReport {
        shards: shards.len(),
        records,
        truncated_shards,
        metadata,
    })
}

fn combine(acc: Option<RunMetadata>, meta: RunMetadata) -> RunMetadata {
    let Some(mut acc) = acc else {
        return meta;
    };
    acc.combinations_enumerated += meta.combinations_enumerated;
    acc.combinations_pruned += meta.combinations_pruned;
    acc.batches_flushed += meta.batches_flushed;
    acc.started_at = acc.started_at.min(meta.started_at);
    acc.status = match (acc.status, meta.status) {
        (RunStatus::Failed, _) | (_, RunStatus::Failed) => RunStatus::Failed,
        (RunStatus::Running, _) | (_, RunStatus::Running) => RunStatus::Running,
        _ => RunStatus::Complete,
    };
    if acc.error.is_none() {
        acc.error = meta.error;
    }
    acc
}
