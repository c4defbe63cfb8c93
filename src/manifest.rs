//! Append-only run log.
//!
//! Every event is one JSON object per line, flushed and synced before
//! `record` returns. The log is the durable record of which species went
//! into which checkpoint; [`RunLog::replay`] rebuilds that from disk,
//! tolerating a final line cut short by a crash.

use crate::error::{ExclusionKind, Result};
use crate::season::{SeasonCodes, SeasonFilter};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LogEvent {
    RunStarted {
        group: String,
        species_count: usize,
        interval: usize,
        season: SeasonFilter,
    },
    BatchStarted {
        batch: String,
        offset: usize,
        members: Vec<String>,
    },
    SpeciesStaged {
        batch: String,
        species: String,
    },
    SpeciesExcluded {
        batch: String,
        species: String,
        reason: ExclusionKind,
        message: String,
    },
    SpeciesReclassified {
        batch: String,
        species: String,
        present_cells: usize,
    },
    CheckpointWritten {
        batch: String,
        offset: usize,
        path: PathBuf,
        members: Vec<String>,
        included: Vec<String>,
        max_value: Option<u16>,
        params: BatchParameters,
    },
    BatchEmpty {
        batch: String,
        offset: usize,
        members: Vec<String>,
        params: BatchParameters,
    },
    BatchResumed {
        batch: String,
        offset: usize,
        path: Option<PathBuf>,
    },
    ValidationMismatch {
        batch: String,
        expected: usize,
        observed: Option<u16>,
    },
    MergeCompleted {
        path: PathBuf,
        species_count: usize,
        max_value: Option<u16>,
    },
    SpeciesTableWritten {
        path: PathBuf,
    },
    RunCompleted {
        included: usize,
        excluded: usize,
        mismatches: usize,
    },
}

/// Settings that determine a checkpoint's contents. A checkpoint is only
/// reused by a run with the same parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchParameters {
    pub season: SeasonFilter,
    pub season_codes: SeasonCodes,
    pub extent_reference: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub event: LogEvent,
}

/// Handle for appending events to `log_<group>.txt`.
#[derive(Debug)]
pub struct RunLog {
    path: PathBuf,
    file: File,
}

impl RunLog {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&mut self, event: LogEvent) -> Result<()> {
        let record = LogRecord {
            ts: Utc::now(),
            event,
        };
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        self.file.write_all(line.as_bytes())?;
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Read back every complete record in the log at `path`. A missing log
    /// yields an empty list.
    pub fn read_records(path: &Path) -> Result<Vec<LogRecord>> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let lines = BufReader::new(file)
            .lines()
            .collect::<io::Result<Vec<String>>>()?;
        let last = lines.len().saturating_sub(1);

        let mut records = Vec::with_capacity(lines.len());
        for (i, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) if i == last => {
                    warn!("Ignoring truncated final line of {}: {}", path.display(), e);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(records)
    }

    /// Rebuild per-batch results from the log at `path`.
    pub fn replay(path: &Path) -> Result<ManifestReplay> {
        let mut replay = ManifestReplay::default();
        for record in Self::read_records(path)? {
            match record.event {
                LogEvent::CheckpointWritten {
                    offset,
                    path,
                    members,
                    included,
                    params,
                    ..
                } => {
                    replay.batches.insert(
                        offset,
                        CompletedBatch {
                            checkpoint: Some(path),
                            members,
                            included,
                            params,
                        },
                    );
                }
                LogEvent::BatchEmpty {
                    offset,
                    members,
                    params,
                    ..
                } => {
                    replay.batches.insert(
                        offset,
                        CompletedBatch {
                            checkpoint: None,
                            members,
                            included: Vec::new(),
                            params,
                        },
                    );
                }
                _ => {}
            }
        }
        debug!(
            "Replayed {} completed batches from {}",
            replay.batches.len(),
            path.display()
        );
        Ok(replay)
    }
}

/// A batch the log records as finished.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedBatch {
    pub checkpoint: Option<PathBuf>,
    pub members: Vec<String>,
    pub included: Vec<String>,
    pub params: BatchParameters,
}

impl CompletedBatch {
    /// True when the recorded batch can stand in for a batch with these
    /// members and parameters, and its checkpoint (if any) is still on disk.
    pub fn is_reusable_for(&self, members: &[String], params: &BatchParameters) -> bool {
        self.members == members
            && self.params == *params
            && self
                .checkpoint
                .as_deref()
                .map_or(true, |path| fs::metadata(path).map(|m| m.is_file()).unwrap_or(false))
    }
}

/// Completed batches keyed by offset. Later log entries win.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManifestReplay {
    batches: BTreeMap<usize, CompletedBatch>,
}

impl ManifestReplay {
    pub fn completed(&self, offset: usize) -> Option<&CompletedBatch> {
        self.batches.get(&offset)
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Every species recorded as contributing to a checkpoint, in offset order.
    pub fn included_species(&self) -> Vec<String> {
        self.batches
            .values()
            .flat_map(|batch| batch.included.iter().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(season: SeasonFilter) -> BatchParameters {
        BatchParameters {
            season,
            season_codes: SeasonCodes::default(),
            extent_reference: None,
        }
    }

    fn checkpoint_event(offset: usize, path: &Path, included: &[&str]) -> LogEvent {
        LogEvent::CheckpointWritten {
            batch: format!("birds_{}", offset),
            offset,
            path: path.to_path_buf(),
            members: vec!["sp1".to_string(), "sp2".to_string()],
            included: included.iter().map(|s| s.to_string()).collect(),
            max_value: Some(1),
            params: params(SeasonFilter::YearRound),
        }
    }

    #[test]
    fn test_records_are_json_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("log_birds.txt");

        let mut log = RunLog::open(&path).unwrap();
        log.record(LogEvent::SpeciesExcluded {
            batch: "birds_0".to_string(),
            species: "sp2".to_string(),
            reason: ExclusionKind::MissingSource,
            message: "habitat raster not found for sp2".to_string(),
        })
        .unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(value["event"], "species_excluded");
        assert_eq!(value["reason"], "missing_source");
        assert_eq!(value["species"], "sp2");
        assert!(value["ts"].is_string());
    }

    #[test]
    fn test_log_is_append_only() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("log_birds.txt");

        RunLog::open(&path)
            .unwrap()
            .record(LogEvent::SpeciesTableWritten {
                path: "a.csv".into(),
            })
            .unwrap();
        RunLog::open(&path)
            .unwrap()
            .record(LogEvent::SpeciesTableWritten {
                path: "b.csv".into(),
            })
            .unwrap();

        let records = RunLog::read_records(&path).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_replay_tolerates_truncated_last_line() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("log_birds.txt");
        let checkpoint = tmp.path().join("birds_0.tif");

        let mut log = RunLog::open(&path).unwrap();
        log.record(checkpoint_event(0, &checkpoint, &["sp1"])).unwrap();
        drop(log);

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(br#"{"ts":"2024-01-01T00:00:00Z","event":"checkpoint_wr"#)
            .unwrap();

        let replay = RunLog::replay(&path).unwrap();
        assert_eq!(replay.len(), 1);
        assert_eq!(replay.included_species(), vec!["sp1".to_string()]);
    }

    #[test]
    fn test_replay_rejects_corruption_mid_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("log_birds.txt");
        fs::write(&path, "garbage\n").unwrap();
        let mut log = RunLog::open(&path).unwrap();
        log.record(LogEvent::SpeciesTableWritten {
            path: "a.csv".into(),
        })
        .unwrap();

        assert!(RunLog::replay(&path).is_err());
    }

    #[test]
    fn test_replay_missing_log_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let replay = RunLog::replay(&tmp.path().join("log_none.txt")).unwrap();
        assert!(replay.is_empty());
    }

    #[test]
    fn test_completed_batch_reuse_requires_checkpoint_file() {
        let tmp = tempfile::tempdir().unwrap();
        let checkpoint = tmp.path().join("birds_0.tif");
        let members = vec!["sp1".to_string(), "sp2".to_string()];
        let batch = CompletedBatch {
            checkpoint: Some(checkpoint.clone()),
            members: members.clone(),
            included: vec!["sp1".to_string()],
            params: params(SeasonFilter::YearRound),
        };
        let current = params(SeasonFilter::YearRound);

        assert!(!batch.is_reusable_for(&members, &current));
        fs::write(&checkpoint, b"tif").unwrap();
        assert!(batch.is_reusable_for(&members, &current));
        assert!(!batch.is_reusable_for(&members[..1], &current));
    }

    #[test]
    fn test_completed_batch_reuse_requires_same_parameters() {
        let members = vec!["sp1".to_string()];
        let batch = CompletedBatch {
            checkpoint: None,
            members: members.clone(),
            included: Vec::new(),
            params: params(SeasonFilter::YearRound),
        };

        assert!(batch.is_reusable_for(&members, &params(SeasonFilter::YearRound)));
        assert!(!batch.is_reusable_for(&members, &params(SeasonFilter::Summer)));

        let mut shifted = params(SeasonFilter::YearRound);
        shifted.season_codes.summer = 4;
        assert!(!batch.is_reusable_for(&members, &shifted));

        let mut extended = params(SeasonFilter::YearRound);
        extended.extent_reference = Some(PathBuf::from("conus_ext.tif"));
        assert!(!batch.is_reusable_for(&members, &extended));
    }

    #[test]
    fn test_batch_parameters_round_trip_through_log() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("log_birds.txt");
        let mut log = RunLog::open(&path).unwrap();
        log.record(LogEvent::BatchEmpty {
            batch: "birds_0".to_string(),
            offset: 0,
            members: vec!["sp1".to_string()],
            params: params(SeasonFilter::Winter),
        })
        .unwrap();

        let replay = RunLog::replay(&path).unwrap();
        let batch = replay.completed(0).unwrap();
        assert_eq!(batch.params.season, SeasonFilter::Winter);
        assert!(batch.checkpoint.is_none());
    }
}
