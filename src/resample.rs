use crate::assembly::{RawDataset, SampleRow};
use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use log::info;
use std::collections::BTreeMap;

/// One heart-rate sample on the fixed grid. Bins with no source samples keep
/// their row with missing values.
#[derive(Debug, Clone, PartialEq)]
pub struct HrSample {
    pub watch_id: String,
    /// Bin start.
    pub time: DateTime<FixedOffset>,
    pub heart_rate: Option<f64>,
    pub confidence: Option<f64>,
    /// `60000 / heart_rate` in ms/beat, rounded to 3 decimals; missing when
    /// the heart rate is missing or zero.
    pub heart_period: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct HrDataset {
    pub rows: Vec<HrSample>,
}

/// One realigned PPG sample. All numeric columns are linear interpolations of
/// the source series.
#[derive(Debug, Clone, PartialEq)]
pub struct PpgSample {
    pub watch_id: String,
    pub time: DateTime<FixedOffset>,
    pub time_from_start: f64,
    pub heart_rate: f64,
    pub confidence: f64,
    pub ppg_raw: f64,
    pub ppg_filter: f64,
    pub time_difference: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PpgDataset {
    pub rows: Vec<PpgSample>,
}

/// Group rows by watch id, each group sorted by time. BTreeMap keeps the
/// group iteration order deterministic (sorted by watch id).
fn group_by_watch(dataset: &RawDataset) -> BTreeMap<&str, Vec<&SampleRow>> {
    let mut groups: BTreeMap<&str, Vec<&SampleRow>> = BTreeMap::new();
    for row in &dataset.rows {
        groups.entry(row.watch_id.as_str()).or_default().push(row);
    }
    for rows in groups.values_mut() {
        rows.sort_by_key(|r| r.time);
    }
    groups
}

fn bin_start(ts_ms: i64, width_ms: i64) -> i64 {
    ts_ms.div_euclid(width_ms) * width_ms
}

fn bin_label(ts_ms: i64, tz: FixedOffset) -> DateTime<FixedOffset> {
    Utc.timestamp_millis_opt(ts_ms)
        .single()
        .expect("bin label in range")
        .with_timezone(&tz)
}

/// Bin each watch's heart-rate series onto an epoch-aligned grid of
/// `rate_ms`-wide bins and average within each bin. PPG columns and offsets
/// are dropped.
pub fn resample_hr(dataset: &RawDataset, rate_ms: i64) -> HrDataset {
    info!("Resampling heart rate at: {rate_ms}ms");
    let mut out = Vec::new();

    for (watch_id, rows) in group_by_watch(dataset) {
        if rows.is_empty() {
            continue;
        }
        let tz = *rows[0].time.offset();
        let mut bins: BTreeMap<i64, (f64, f64, usize)> = BTreeMap::new();
        for row in &rows {
            let bin = bin_start(row.time.timestamp_millis(), rate_ms);
            let entry = bins.entry(bin).or_insert((0.0, 0.0, 0));
            entry.0 += row.heart_rate;
            entry.1 += row.confidence;
            entry.2 += 1;
        }

        let first = bin_start(rows[0].time.timestamp_millis(), rate_ms);
        let last = bin_start(rows[rows.len() - 1].time.timestamp_millis(), rate_ms);
        let mut bin = first;
        while bin <= last {
            let (heart_rate, confidence) = match bins.get(&bin) {
                Some(&(hr_sum, conf_sum, n)) => {
                    (Some(hr_sum / n as f64), Some(conf_sum / n as f64))
                }
                None => (None, None),
            };
            let heart_period = heart_rate
                .filter(|&hr| hr != 0.0)
                .map(|hr| (60_000.0 / hr * 1000.0).round() / 1000.0);
            out.push(HrSample {
                watch_id: watch_id.to_string(),
                time: bin_label(bin, tz),
                heart_rate,
                confidence,
                heart_period,
            });
            bin += rate_ms;
        }
    }

    HrDataset { rows: out }
}

/// Linear interpolant over an irregularly sampled column, evaluated at
/// ascending grid points. Evaluation clamps to the end values outside the
/// defined span; a grid point coincident with a sample reproduces it exactly.
struct LinearInterp {
    xs: Vec<i64>,
    ys: Vec<f64>,
    cursor: usize,
}

impl LinearInterp {
    fn new(xs: Vec<i64>, ys: Vec<f64>) -> Self {
        debug_assert_eq!(xs.len(), ys.len());
        LinearInterp { xs, ys, cursor: 0 }
    }

    /// Evaluate at `x`. Callers must present `x` in ascending order.
    fn at(&mut self, x: i64) -> Option<f64> {
        if self.xs.is_empty() {
            return None;
        }
        if x <= self.xs[0] {
            return Some(self.ys[0]);
        }
        while self.cursor + 1 < self.xs.len() && self.xs[self.cursor + 1] < x {
            self.cursor += 1;
        }
        if self.cursor + 1 >= self.xs.len() {
            return Some(self.ys[self.xs.len() - 1]);
        }
        let (x1, x2) = (self.xs[self.cursor], self.xs[self.cursor + 1]);
        let (y1, y2) = (self.ys[self.cursor], self.ys[self.cursor + 1]);
        if x2 == x1 {
            return Some(y1);
        }
        let alpha = (x - x1) as f64 / (x2 - x1) as f64;
        Some(y1 + alpha * (y2 - y1))
    }
}

/// Interpolation phase: reconstruct one watch's series on a fine epoch-aligned
/// grid confined to the watch's data span, linearly interpolating every
/// numeric column.
pub fn interpolate_to_grid(watch_id: &str, rows: &[&SampleRow], step_ms: i64) -> Vec<PpgSample> {
    if rows.is_empty() {
        return Vec::new();
    }
    let tz = *rows[0].time.offset();
    let ts: Vec<i64> = rows.iter().map(|r| r.time.timestamp_millis()).collect();

    let column = |f: &dyn Fn(&SampleRow) -> f64| -> LinearInterp {
        LinearInterp::new(ts.clone(), rows.iter().map(|r| f(r)).collect())
    };
    let mut time_from_start = column(&|r| r.time_from_start as f64);
    let mut heart_rate = column(&|r| r.heart_rate);
    let mut confidence = column(&|r| r.confidence);
    let mut ppg_raw = column(&|r| r.ppg_raw);
    let mut ppg_filter = column(&|r| r.ppg_filter);

    // The difference column is undefined on each file's first row; grid
    // points before its first defined sample stay undefined.
    let defined: Vec<(i64, f64)> = rows
        .iter()
        .zip(&ts)
        .filter_map(|(r, &t)| r.time_difference.map(|d| (t, d as f64)))
        .collect();
    let diff_start = defined.first().map(|&(t, _)| t);
    let mut time_difference = LinearInterp::new(
        defined.iter().map(|&(t, _)| t).collect(),
        defined.iter().map(|&(_, d)| d).collect(),
    );

    let first = ts[0];
    let last = ts[ts.len() - 1];
    let mut grid = bin_start(first, step_ms);
    if grid < first {
        grid += step_ms;
    }

    let mut out = Vec::new();
    while grid <= last {
        out.push(PpgSample {
            watch_id: watch_id.to_string(),
            time: bin_label(grid, tz),
            time_from_start: time_from_start.at(grid).unwrap_or_default(),
            heart_rate: heart_rate.at(grid).unwrap_or_default(),
            confidence: confidence.at(grid).unwrap_or_default(),
            ppg_raw: ppg_raw.at(grid).unwrap_or_default(),
            ppg_filter: ppg_filter.at(grid).unwrap_or_default(),
            time_difference: match diff_start {
                Some(start) if grid >= start => time_difference.at(grid),
                _ => None,
            },
        });
        grid += step_ms;
    }
    out
}

/// Decimation phase: project an interpolated series onto the coarse grid by
/// taking the first sample within each bin, preserving instantaneous waveform
/// shape. Rows are relabeled with the bin start.
pub fn decimate_first(rows: &[PpgSample], rate_ms: i64) -> Vec<PpgSample> {
    let mut out: Vec<PpgSample> = Vec::new();
    let mut current_bin: Option<i64> = None;
    for row in rows {
        let bin = bin_start(row.time.timestamp_millis(), rate_ms);
        if current_bin == Some(bin) {
            continue;
        }
        current_bin = Some(bin);
        let mut relabeled = row.clone();
        relabeled.time = bin_label(bin, *row.time.offset());
        out.push(relabeled);
    }
    out
}

/// Two-phase PPG realignment: linear interpolation onto the fine grid, then
/// first-in-bin decimation onto the target grid, per watch. Direct decimation
/// onto the coarse grid would alias or drop waveform peaks.
pub fn resample_ppg(dataset: &RawDataset, interpolation_ms: i64, rate_ms: i64) -> PpgDataset {
    info!("Resampling PPG at: {rate_ms}ms [{interpolation_ms}ms interpolation]");
    let mut out = Vec::new();
    for (watch_id, rows) in group_by_watch(dataset) {
        let interpolated = interpolate_to_grid(watch_id, &rows, interpolation_ms);
        out.extend(decimate_first(&interpolated, rate_ms));
    }
    PpgDataset { rows: out }
}
