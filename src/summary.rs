use crate::config::Config;
use crate::recording::{self, RecordingFile};
use anyhow::{Context, Result};
use chrono::{Duration, FixedOffset};
use log::{info, warn};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Summary of every candidate recording file in the study directory, one row
/// per file, sorted by watch id. Watch ids are not unique across rows.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SummaryTable {
    pub rows: Vec<RecordingFile>,
}

impl SummaryTable {
    /// Drop every row whose watch id appears in the flagged subset.
    pub fn exclude_flagged(&mut self, flagged: &[RecordingFile]) {
        let ids: BTreeSet<&str> = flagged.iter().map(|r| r.watch_id.as_str()).collect();
        self.rows.retain(|r| !ids.contains(r.watch_id.as_str()));
    }
}

/// Sorted list of files in `dir` whose names end with `suffix`.
pub fn list_study_files(dir: &Path, suffix: &str) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| entry.file_name().to_string_lossy().ends_with(suffix))
        .map(|entry| entry.into_path())
        .collect();
    files.sort();
    Ok(files)
}

/// Parse every candidate file in the configured raw directory into a
/// [`SummaryTable`].
pub fn summarise_directory(cfg: &Config) -> Result<SummaryTable> {
    let tz = cfg.tz_offset()?;
    let files = list_study_files(&cfg.raw_dir, &cfg.file_pattern)
        .with_context(|| format!("failed to scan {}", cfg.raw_dir.display()))?;
    info!("Reading {} files in: {}", files.len(), cfg.raw_dir.display());
    Ok(summarise_files(&files, tz))
}

/// Parse each listed file into a summary row. A file that cannot be opened
/// (vanished or unreadable since the scan) contributes a sentinel row instead
/// of stopping the pass, so the table always has one row per listed file.
pub fn summarise_files(files: &[PathBuf], tz: FixedOffset) -> SummaryTable {
    let mut rows = Vec::with_capacity(files.len());
    for path in files {
        info!("Checking file: {}", path.display());
        match recording::check_file(path, tz) {
            Some((rec, issues)) => {
                for issue in &issues {
                    warn!("{} in: {}", issue, path.display());
                }
                rows.push(rec);
            }
            None => rows.push(RecordingFile::sentinel(path)),
        }
    }

    rows.sort_by(|a, b| a.watch_id.cmp(&b.watch_id));
    SummaryTable { rows }
}

/// Return the rows violating the minimum duration / minimum sample-rate
/// thresholds. The input table is left untouched; the caller decides how to
/// exclude the flagged watch ids.
///
/// The sample threshold uses the whole-second floor of the minimum length,
/// so `60.5s` still demands only `60 * rate` samples.
pub fn flag_records(
    table: &SummaryTable,
    minimum_record_length: f64,
    minimum_sample_rate: f64,
) -> Vec<RecordingFile> {
    let min_length = Duration::milliseconds((minimum_record_length * 1000.0) as i64);
    let min_samples = minimum_record_length.floor() * minimum_sample_rate;
    info!(
        "Flagging records with: duration less than {minimum_record_length} seconds, \
         or sample rate less than {minimum_sample_rate} samples/sec."
    );

    let flagged: Vec<RecordingFile> = table
        .rows
        .iter()
        .filter(|r| r.duration < min_length || (r.samples as f64) < min_samples)
        .cloned()
        .collect();
    info!("Flagged {} records", flagged.len());
    flagged
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone, Utc};

    fn row(watch_id: &str, duration_secs: i64, samples: u64) -> RecordingFile {
        let tz = FixedOffset::east_opt(0).unwrap();
        let start = Utc
            .timestamp_millis_opt(1_700_000_000_000)
            .unwrap()
            .with_timezone(&tz);
        RecordingFile {
            watch_id: watch_id.to_string(),
            file: PathBuf::from(format!("{watch_id}.csv")),
            mac_address: "AA:BB:CC:DD:EE:FF".to_string(),
            record_start: Some(start),
            record_finish: Some(start + Duration::seconds(duration_secs)),
            duration: Duration::seconds(duration_secs),
            samples,
        }
    }

    #[test]
    fn short_recording_is_flagged() {
        // 50s of data with 50 samples against a 60s / 1 sample-per-second bar
        let table = SummaryTable {
            rows: vec![row("W001", 50, 50), row("W002", 90, 90)],
        };
        let flagged = flag_records(&table, 60.0, 1.0);
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].watch_id, "W001");
    }

    #[test]
    fn undersampled_recording_is_flagged() {
        let table = SummaryTable {
            rows: vec![row("W001", 90, 30)],
        };
        let flagged = flag_records(&table, 60.0, 1.0);
        assert_eq!(flagged.len(), 1);
    }

    #[test]
    fn sample_threshold_floors_the_length() {
        // 60.5s minimum still requires only floor(60.5) * rate = 60 samples
        let table = SummaryTable {
            rows: vec![row("W001", 61, 60)],
        };
        assert!(flag_records(&table, 60.5, 1.0).is_empty());
        assert_eq!(flag_records(&table, 61.0, 1.0).len(), 1);
    }

    #[test]
    fn flagging_is_idempotent() {
        let table = SummaryTable {
            rows: vec![row("W001", 50, 50), row("W002", 90, 90), row("W003", 10, 5)],
        };
        let first = flag_records(&table, 60.0, 1.0);
        let second = flag_records(&table, 60.0, 1.0);
        assert_eq!(first, second);
    }

    #[test]
    fn exclude_flagged_removes_all_rows_for_a_watch() {
        let mut table = SummaryTable {
            rows: vec![row("W001", 50, 50), row("W001", 90, 90), row("W002", 90, 90)],
        };
        let flagged = vec![row("W001", 50, 50)];
        table.exclude_flagged(&flagged);
        assert_eq!(table.rows.len(), 1);
        assert_eq!(table.rows[0].watch_id, "W002");
    }

    #[test]
    fn unopenable_file_contributes_a_sentinel_row() {
        let dir =
            std::env::temp_dir().join(format!("watch-preprocess-sent-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let good = dir.join("W001.csv");
        std::fs::write(
            &good,
            "{\"MAC\":\"AA:BB:CC:DD:EE:FF\",\"name\":\"W001\"}\n\
             {\"UNIXTimeStamp\":\"1700000000000\",\"event\":\"START\"}\n\
             0,700,95,12000,11000\n",
        )
        .unwrap();

        // The vanished file comes first; the good one must still be parsed.
        let files = vec![dir.join("vanished.csv"), good];
        let table = summarise_files(&files, FixedOffset::east_opt(0).unwrap());

        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0].watch_id, recording::UNKNOWN);
        assert_eq!(table.rows[0].samples, 0);
        assert!(table.rows[0].record_start.is_none());
        assert_eq!(table.rows[1].watch_id, "W001");
        assert_eq!(table.rows[1].samples, 1);
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn listing_is_sorted_and_filtered() {
        let dir = std::env::temp_dir().join(format!("watch-preprocess-list-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        for name in ["b.csv", "a.csv", "notes.txt"] {
            std::fs::write(dir.join(name), "x").unwrap();
        }
        let files = list_study_files(&dir, ".csv").unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.csv", "b.csv"]);
        std::fs::remove_dir_all(dir).ok();
    }
}
