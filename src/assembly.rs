use crate::recording::{self};
use crate::summary::SummaryTable;
use chrono::{DateTime, Duration, FixedOffset};
use log::{debug, warn};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// One ingested measurement with its derived fields.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleRow {
    pub watch_id: String,
    /// Absolute time: recording start + `time_from_start`.
    pub time: DateTime<FixedOffset>,
    /// Millisecond offset from recording start.
    pub time_from_start: i64,
    /// Decoded BPM (the wire value is BPM x 10).
    pub heart_rate: f64,
    pub confidence: f64,
    pub ppg_raw: f64,
    pub ppg_filter: f64,
    /// Successive difference of `time_from_start`; `None` on the first row of
    /// a file.
    pub time_difference: Option<i64>,
}

/// The assembled multi-watch dataset, in file-enumeration order. Not globally
/// time-sorted.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawDataset {
    pub rows: Vec<SampleRow>,
}

/// Read the sample rows of one recording file.
///
/// The header is re-parsed through the Recording Parser (the summarizer's
/// earlier parse is deliberately not reused, so the passes stay independent).
/// Files with one or zero samples carry no usable signal and are skipped, as
/// are files whose start time could not be parsed: without an anchor there is
/// no absolute time column to derive. Malformed rows are dropped silently.
pub fn read_file_samples(path: &Path, tz: FixedOffset) -> Vec<SampleRow> {
    let Some((rec, _issues)) = recording::check_file(path, tz) else {
        return Vec::new();
    };
    if rec.samples <= 1 {
        warn!("Skipping {}: {} samples, no usable signal", path.display(), rec.samples);
        return Vec::new();
    }
    let Some(start) = rec.record_start else {
        warn!("Skipping {}: no start time to anchor samples", path.display());
        return Vec::new();
    };

    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) => {
            warn!("Could not reopen {}: {e}", path.display());
            return Vec::new();
        }
    };

    let mut rows = Vec::with_capacity(rec.samples as usize);
    let mut previous_offset: Option<i64> = None;
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let Ok(line) = line else { continue };
        // The first two lines are header metadata, not samples.
        if index < 2 || line.contains("STOP_RECORD") {
            continue;
        }
        let Some(row) = decode_row(&line, &rec.watch_id, start, previous_offset) else {
            debug!("Dropping malformed row {index} in {}", path.display());
            continue;
        };
        previous_offset = Some(row.time_from_start);
        rows.push(row);
    }
    rows
}

/// Decode one `timeFromStart,heartRate*10,confidence,ppgRaw,ppgFilter` line.
fn decode_row(
    line: &str,
    watch_id: &str,
    start: DateTime<FixedOffset>,
    previous_offset: Option<i64>,
) -> Option<SampleRow> {
    let mut fields = line.split(',');
    let time_from_start: i64 = fields.next()?.trim().parse().ok()?;
    let heart_rate_raw: f64 = fields.next()?.trim().parse().ok()?;
    let confidence: f64 = fields.next()?.trim().parse().ok()?;
    let ppg_raw: f64 = fields.next()?.trim().parse().ok()?;
    let ppg_filter: f64 = fields.next()?.trim().parse().ok()?;

    // f64::parse accepts the literal tokens NaN/inf; a non-finite measurement
    // is a malformed row, not a value.
    if [heart_rate_raw, confidence, ppg_raw, ppg_filter]
        .iter()
        .any(|v| !v.is_finite())
    {
        return None;
    }

    Some(SampleRow {
        watch_id: watch_id.to_string(),
        time: start + Duration::milliseconds(time_from_start),
        time_from_start,
        heart_rate: heart_rate_raw / 10.0,
        confidence,
        ppg_raw,
        ppg_filter,
        time_difference: previous_offset.map(|p| time_from_start - p),
    })
}

/// Read every accepted recording in summary-table order and concatenate the
/// per-watch frames into one dataset.
pub fn assemble_raw_data(table: &SummaryTable, tz: FixedOffset) -> RawDataset {
    let mut rows = Vec::new();
    for rec in &table.rows {
        rows.extend(read_file_samples(&rec.file, tz));
    }
    RawDataset { rows }
}

/// Restrict the dataset to `period_start < time < period_end` (strict,
/// exclusive bounds). An absent bound passes everything through on that side.
pub fn trim_raw_data(
    dataset: &RawDataset,
    period_start: Option<DateTime<FixedOffset>>,
    period_end: Option<DateTime<FixedOffset>>,
) -> RawDataset {
    if period_start.is_none() {
        warn!("No trim_data_before configured; keeping data from the recording start");
    }
    if period_end.is_none() {
        warn!("No trim_data_after configured; keeping data to the recording end");
    }
    let rows = dataset
        .rows
        .iter()
        .filter(|r| period_start.map_or(true, |s| r.time > s))
        .filter(|r| period_end.map_or(true, |e| r.time < e))
        .cloned()
        .collect();
    RawDataset { rows }
}
