use crate::resample::{PpgDataset, PpgSample};
use crate::PipelineError;
use anyhow::Result;
use log::{debug, info};
use rustfft::{num_complex::Complex, FftPlanner};
use sci_rs::signal::filter::{design::Sos, sosfiltfilt_dyn};
use std::collections::BTreeMap;
use std::f64::consts::PI;

/// Per-sample annotations for one watch's PPG waveform. Every vector has
/// exactly the length of the input signal; that alignment is the contract
/// [`find_ppg_peaks`] enforces.
#[derive(Debug, Clone, PartialEq)]
pub struct PpgAnnotations {
    pub clean: Vec<f64>,
    pub rate: Vec<Option<f64>>,
    pub quality: Vec<f64>,
    pub peaks: Vec<bool>,
    pub troughs: Vec<bool>,
}

/// The physiological signal-processing collaborator: given one watch's
/// ordered waveform and its sampling frequency, produce per-sample
/// annotations of equal length and order.
pub trait PpgProcessor {
    fn process(&self, signal: &[f64], sampling_rate: f64) -> PpgAnnotations;
}

/// One PPG sample joined with its annotations.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnotatedSample {
    pub sample: PpgSample,
    pub ppg_clean: f64,
    pub ppg_rate: Option<f64>,
    pub ppg_quality: f64,
    pub ppg_peak: bool,
    pub ppg_trough: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct AnnotatedDataset {
    pub rows: Vec<AnnotatedSample>,
}

/// Annotate each watch's waveform through `processor` and rejoin the
/// annotations positionally. A length mismatch between the signal and any
/// returned annotation vector is a contract violation and aborts the run.
pub fn find_ppg_peaks(
    dataset: &PpgDataset,
    resample_rate_ms: i64,
    processor: &dyn PpgProcessor,
) -> Result<AnnotatedDataset> {
    let sampling_rate = 1000.0 / resample_rate_ms as f64;
    info!("Finding PPG peaks at {sampling_rate} Hz");

    let mut groups: BTreeMap<&str, Vec<&PpgSample>> = BTreeMap::new();
    for row in &dataset.rows {
        groups.entry(row.watch_id.as_str()).or_default().push(row);
    }

    let mut out = Vec::with_capacity(dataset.rows.len());
    for (watch_id, rows) in groups {
        let signal: Vec<f64> = rows.iter().map(|r| r.ppg_raw).collect();
        let annotations = processor.process(&signal, sampling_rate);

        let expected = rows.len();
        for actual in [
            annotations.clean.len(),
            annotations.rate.len(),
            annotations.quality.len(),
            annotations.peaks.len(),
            annotations.troughs.len(),
        ] {
            if actual != expected {
                return Err(PipelineError::AnnotationMismatch {
                    watch_id: watch_id.to_string(),
                    expected,
                    actual,
                }
                .into());
            }
        }

        debug!(
            "Annotated {} samples for {watch_id} ({} peaks)",
            expected,
            annotations.peaks.iter().filter(|&&p| p).count()
        );
        for (i, row) in rows.into_iter().enumerate() {
            out.push(AnnotatedSample {
                sample: row.clone(),
                ppg_clean: annotations.clean[i],
                ppg_rate: annotations.rate[i],
                ppg_quality: annotations.quality[i],
                ppg_peak: annotations.peaks[i],
                ppg_trough: annotations.troughs[i],
            });
        }
    }

    Ok(AnnotatedDataset { rows: out })
}

/// Default processor: zero-phase bandpass cleaning, adaptive moving-average
/// peak fitting, and spectral quality scoring.
#[derive(Debug, Clone)]
pub struct ElgendiProcessor {
    pub lowcut_hz: f64,
    pub highcut_hz: f64,
    pub bpm_min: f64,
    pub bpm_max: f64,
}

impl Default for ElgendiProcessor {
    fn default() -> Self {
        ElgendiProcessor {
            lowcut_hz: 0.5,
            highcut_hz: 8.0,
            bpm_min: 40.0,
            bpm_max: 180.0,
        }
    }
}

impl PpgProcessor for ElgendiProcessor {
    fn process(&self, signal: &[f64], sampling_rate: f64) -> PpgAnnotations {
        let n = signal.len();
        let clean = bandpass_filter(signal, self.lowcut_hz, self.highcut_hz, sampling_rate);

        if n < 2 {
            return PpgAnnotations {
                clean,
                rate: vec![None; n],
                quality: vec![0.0; n],
                peaks: vec![false; n],
                troughs: vec![false; n],
            };
        }

        let rol_mean = rolling_mean(&clean, 0.75, sampling_rate);
        let (peaklist, _ybeat) =
            fit_peaks(&clean, &rol_mean, sampling_rate, self.bpm_min, self.bpm_max);

        let mut peaks = vec![false; n];
        for &p in &peaklist {
            peaks[p] = true;
        }
        let troughs = find_troughs(&clean, &peaklist, n);
        let rate = rate_per_sample(&peaklist, sampling_rate, n);
        let quality = quality_scores(&clean, sampling_rate, n);

        PpgAnnotations {
            clean,
            rate,
            quality,
            peaks,
            troughs,
        }
    }
}

/// Design a constant-peak-gain biquad bandpass and apply it forward-backward.
/// Short signals are returned unfiltered; zero-phase padding needs headroom.
pub fn bandpass_filter(data: &[f64], lowcut: f64, highcut: f64, sample_rate: f64) -> Vec<f64> {
    let nyquist = sample_rate / 2.0;
    let highcut = highcut.min(0.9 * nyquist);
    if data.len() < 30 || lowcut >= highcut {
        return data.to_vec();
    }

    let (b, a) = design_bandpass_filter(lowcut, highcut, sample_rate);
    let sos = vec![Sos::new([b[0], b[1], b[2]], [1.0, a[1], a[2]])];
    sosfiltfilt_dyn(data.iter(), &sos)
}

/// RBJ-style biquad bandpass with 0 dB peak gain, centered on the geometric
/// mean of the cutoffs with the bandwidth expressed in octaves.
fn design_bandpass_filter(lowcut: f64, highcut: f64, sample_rate: f64) -> (Vec<f64>, Vec<f64>) {
    debug_assert!(sample_rate > 0.0);
    debug_assert!(0.0 < lowcut && lowcut < highcut);

    let center = (lowcut * highcut).sqrt();
    let bandwidth_octaves = (highcut / lowcut).log2();
    let w0 = 2.0 * PI * center / sample_rate;
    let alpha = w0.sin() * ((2.0f64.ln() / 2.0) * bandwidth_octaves * w0 / w0.sin()).sinh();

    let a0 = 1.0 + alpha;
    let b = vec![alpha / a0, 0.0, -alpha / a0];
    let a = vec![1.0, -2.0 * w0.cos() / a0, (1.0 - alpha) / a0];
    (b, a)
}

/// Rolling mean over a `window_size`-second window (uniform filter semantics).
fn rolling_mean(data: &[f64], window_size: f64, sample_rate: f64) -> Vec<f64> {
    let size = ((window_size * sample_rate) as usize).max(1);
    let mut result = vec![0.0; data.len()];

    for i in 0..data.len() {
        let start = if i < size / 2 { 0 } else { i - size / 2 };
        let end = (i + size / 2 + 1).min(data.len());
        result[i] = data[start..end].iter().sum::<f64>() / (end - start) as f64;
    }
    result
}

/// Detect candidate peaks: contiguous runs above the raised rolling mean,
/// keeping the maximum of each run.
fn detect_peaks(data: &[f64], rol_mean: &[f64], ma_perc: f64) -> (Vec<usize>, Vec<f64>) {
    let mn = rol_mean.iter().map(|&x| x / 100.0).sum::<f64>() / rol_mean.len() as f64 * ma_perc;
    let rol_mean: Vec<f64> = rol_mean.iter().map(|&r| r + mn).collect();

    let mut peaksx = Vec::new();
    let mut peaksy = Vec::new();
    for (i, (&d, &t)) in data.iter().zip(rol_mean.iter()).enumerate() {
        if d > t {
            peaksx.push(i);
            peaksy.push(d);
        }
    }
    if peaksx.is_empty() {
        return (Vec::new(), Vec::new());
    }

    let mut peakedges = vec![0];
    for i in 1..peaksx.len() {
        if peaksx[i] - peaksx[i - 1] > 1 {
            peakedges.push(i);
        }
    }
    peakedges.push(peaksx.len());

    let mut final_peaksx = Vec::new();
    let mut final_peaksy = Vec::new();
    for window in peakedges.windows(2) {
        if let Some(max_idx) =
            (window[0]..window[1]).max_by(|&a, &b| peaksy[a].total_cmp(&peaksy[b]))
        {
            final_peaksx.push(peaksx[max_idx]);
            final_peaksy.push(peaksy[max_idx]);
        }
    }
    (final_peaksx, final_peaksy)
}

/// Sweep moving-average percentages and keep the detection with the lowest
/// RR-interval standard deviation inside the plausible BPM band.
fn fit_peaks(
    data: &[f64],
    rol_mean: &[f64],
    sample_rate: f64,
    bpm_min: f64,
    bpm_max: f64,
) -> (Vec<usize>, Vec<f64>) {
    let ma_percs = [
        5.0, 10.0, 15.0, 20.0, 25.0, 30.0, 40.0, 50.0, 60.0, 70.0, 80.0, 90.0, 100.0, 110.0,
        120.0, 150.0, 200.0, 300.0,
    ];

    let mut best: Option<(f64, Vec<usize>, Vec<f64>)> = None;
    for ma_perc in ma_percs {
        let (peaklist, ybeat) = detect_peaks(data, rol_mean, ma_perc);
        let bpm = (peaklist.len() as f64 / (data.len() as f64 / sample_rate)) * 60.0;

        let rrsd = if peaklist.len() > 2 {
            let rr: Vec<f64> = peaklist
                .windows(2)
                .map(|w| (w[1] - w[0]) as f64 / sample_rate * 1000.0)
                .collect();
            let mean_rr = rr.iter().sum::<f64>() / rr.len() as f64;
            (rr.iter().map(|&x| (x - mean_rr).powi(2)).sum::<f64>() / (rr.len() - 1) as f64).sqrt()
        } else {
            f64::INFINITY
        };

        debug!("ma_perc: {ma_perc}, peaks: {}, bpm: {bpm:.1}", peaklist.len());
        if rrsd > 0.1 && bpm >= bpm_min && bpm <= bpm_max {
            match &best {
                Some((best_rrsd, _, _)) if *best_rrsd <= rrsd => {}
                _ => best = Some((rrsd, peaklist, ybeat)),
            }
        }
    }

    match best {
        Some((_, peaklist, ybeat)) => (peaklist, ybeat),
        None => (Vec::new(), Vec::new()),
    }
}

/// Mark the minimum between each pair of adjacent peaks as a trough.
fn find_troughs(clean: &[f64], peaklist: &[usize], n: usize) -> Vec<bool> {
    let mut troughs = vec![false; n];
    for pair in peaklist.windows(2) {
        let segment = &clean[pair[0]..pair[1]];
        if let Some(offset) = (0..segment.len()).min_by(|&a, &b| segment[a].total_cmp(&segment[b]))
        {
            troughs[pair[0] + offset] = true;
        }
    }
    troughs
}

/// Instantaneous rate per sample, linearly interpolated between peaks and
/// clamped beyond the first/last peak. All missing with fewer than two peaks.
fn rate_per_sample(peaklist: &[usize], sample_rate: f64, n: usize) -> Vec<Option<f64>> {
    if peaklist.len() < 2 {
        return vec![None; n];
    }

    // BPM of each interval, attributed to the interval's closing peak.
    let anchors: Vec<(usize, f64)> = peaklist
        .windows(2)
        .map(|w| (w[1], 60.0 * sample_rate / (w[1] - w[0]) as f64))
        .collect();

    let mut rate = Vec::with_capacity(n);
    let mut cursor = 0usize;
    for i in 0..n {
        while cursor + 1 < anchors.len() && anchors[cursor + 1].0 < i {
            cursor += 1;
        }
        let value = if i <= anchors[0].0 {
            anchors[0].1
        } else if i >= anchors[anchors.len() - 1].0 {
            anchors[anchors.len() - 1].1
        } else {
            let (x1, y1) = anchors[cursor];
            let (x2, y2) = anchors[cursor + 1];
            let alpha = (i - x1) as f64 / (x2 - x1) as f64;
            y1 + alpha * (y2 - y1)
        };
        rate.push(Some(value));
    }
    rate
}

fn create_hann_window(size: usize) -> Vec<f64> {
    (0..size)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f64 / size as f64).cos()))
        .collect()
}

/// Spectral concentration of one window: share of power held by the top 3
/// bins, rescaled so 50%+ maps to 1.0 and 5% or less to 0.0.
fn window_concentration(window: &[f64]) -> f64 {
    let hann = create_hann_window(window.len());
    let mut buffer: Vec<Complex<f64>> = window
        .iter()
        .zip(hann.iter())
        .map(|(&s, &w)| Complex::new(s * w, 0.0))
        .collect();

    let mut planner = FftPlanner::new();
    let fft = planner.plan_fft_forward(buffer.len());
    fft.process(&mut buffer);

    let mut power: Vec<f64> = buffer
        .iter()
        .take(buffer.len() / 2)
        .skip(1) // DC carries the baseline, not the pulse
        .map(|x| x.norm_sqr())
        .collect();
    let total: f64 = power.iter().sum();
    if total < 1e-12 {
        return 0.0;
    }
    power.sort_by(|a, b| b.total_cmp(a));
    let top: f64 = power.iter().take(3).sum();
    ((top / total - 0.05) / 0.45).clamp(0.0, 1.0)
}

/// Per-sample quality: spectral concentration over ~10s half-overlapping
/// windows, averaged where windows overlap.
fn quality_scores(clean: &[f64], sample_rate: f64, n: usize) -> Vec<f64> {
    let window = ((sample_rate * 10.0) as usize).clamp(16, n.max(1));
    if n < 16 {
        return vec![0.0; n];
    }
    let hop = (window / 2).max(1);

    let mut sums = vec![0.0; n];
    let mut counts = vec![0usize; n];
    let mut start = 0usize;
    loop {
        let end = (start + window).min(n);
        let score = window_concentration(&clean[start..end]);
        for i in start..end {
            sums[i] += score;
            counts[i] += 1;
        }
        if end == n {
            break;
        }
        start += hop;
    }

    sums.iter()
        .zip(counts.iter())
        .map(|(&s, &c)| if c == 0 { 0.0 } else { s / c as f64 })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, FixedOffset, TimeZone, Utc};

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    fn at(offset_ms: i64) -> DateTime<FixedOffset> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + offset_ms)
            .unwrap()
            .with_timezone(&utc())
    }

    /// 1.2 Hz pulse riding a 12000-count baseline, sampled at `rate_ms`.
    fn synthetic_dataset(watch_id: &str, rate_ms: i64, seconds: f64) -> PpgDataset {
        let n = (seconds * 1000.0 / rate_ms as f64) as i64;
        let rows = (0..n)
            .map(|i| {
                let t = (i * rate_ms) as f64 / 1000.0;
                PpgSample {
                    watch_id: watch_id.to_string(),
                    time: at(i * rate_ms),
                    time_from_start: (i * rate_ms) as f64,
                    heart_rate: 72.0,
                    confidence: 95.0,
                    ppg_raw: 12_000.0 + 400.0 * (2.0 * PI * 1.2 * t).sin(),
                    ppg_filter: 0.0,
                    time_difference: Some(rate_ms as f64),
                }
            })
            .collect();
        PpgDataset { rows }
    }

    #[test]
    fn annotations_align_with_input() {
        let dataset = synthetic_dataset("W001", 40, 30.0);
        let annotated =
            find_ppg_peaks(&dataset, 40, &ElgendiProcessor::default()).unwrap();
        assert_eq!(annotated.rows.len(), dataset.rows.len());
        for (out, src) in annotated.rows.iter().zip(dataset.rows.iter()) {
            assert_eq!(out.sample, *src);
        }
    }

    #[test]
    fn detects_pulse_rate_on_synthetic_signal() {
        let dataset = synthetic_dataset("W001", 40, 30.0);
        let annotated =
            find_ppg_peaks(&dataset, 40, &ElgendiProcessor::default()).unwrap();

        // 1.2 Hz over 30s is 36 beats
        let peak_count = annotated.rows.iter().filter(|r| r.ppg_peak).count();
        assert!((28..=44).contains(&peak_count), "found {peak_count} peaks");

        let rates: Vec<f64> = annotated.rows.iter().filter_map(|r| r.ppg_rate).collect();
        assert!(!rates.is_empty());
        let mean = rates.iter().sum::<f64>() / rates.len() as f64;
        assert!((60.0..=85.0).contains(&mean), "mean rate {mean}");
    }

    #[test]
    fn troughs_fall_between_peaks() {
        let dataset = synthetic_dataset("W001", 40, 30.0);
        let annotated =
            find_ppg_peaks(&dataset, 40, &ElgendiProcessor::default()).unwrap();
        let peak_count = annotated.rows.iter().filter(|r| r.ppg_peak).count();
        let trough_count = annotated.rows.iter().filter(|r| r.ppg_trough).count();
        assert!(peak_count > 1);
        assert_eq!(trough_count, peak_count - 1);
    }

    struct TruncatingProcessor;

    impl PpgProcessor for TruncatingProcessor {
        fn process(&self, signal: &[f64], _sampling_rate: f64) -> PpgAnnotations {
            // Violates the alignment contract: one annotation short.
            let n = signal.len().saturating_sub(1);
            PpgAnnotations {
                clean: vec![0.0; n],
                rate: vec![None; n],
                quality: vec![0.0; n],
                peaks: vec![false; n],
                troughs: vec![false; n],
            }
        }
    }

    #[test]
    fn misaligned_annotations_are_fatal() {
        let dataset = synthetic_dataset("W001", 40, 5.0);
        let err = find_ppg_peaks(&dataset, 40, &TruncatingProcessor).unwrap_err();
        match err.downcast_ref::<PipelineError>() {
            Some(PipelineError::AnnotationMismatch {
                watch_id,
                expected,
                actual,
            }) => {
                assert_eq!(watch_id, "W001");
                assert_eq!(*expected, dataset.rows.len());
                assert_eq!(*actual, dataset.rows.len() - 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn short_signals_get_passthrough_annotations() {
        let processor = ElgendiProcessor::default();
        let annotations = processor.process(&[12_000.0], 25.0);
        assert_eq!(annotations.clean, vec![12_000.0]);
        assert_eq!(annotations.rate, vec![None]);
        assert_eq!(annotations.peaks, vec![false]);
    }

    #[test]
    fn non_finite_sample_does_not_abort_annotation() {
        let mut signal: Vec<f64> = (0..500)
            .map(|i| {
                let t = i as f64 * 0.04;
                12_000.0 + 400.0 * (2.0 * PI * 1.2 * t).sin()
            })
            .collect();
        signal[250] = f64::NAN;

        let annotations = ElgendiProcessor::default().process(&signal, 25.0);
        assert_eq!(annotations.clean.len(), signal.len());
        assert_eq!(annotations.rate.len(), signal.len());
        assert_eq!(annotations.quality.len(), signal.len());
        assert_eq!(annotations.peaks.len(), signal.len());
        assert_eq!(annotations.troughs.len(), signal.len());
    }

    #[test]
    fn bandpass_preserves_length_and_finiteness() {
        let signal: Vec<f64> = (0..500)
            .map(|i| 12_000.0 + (i as f64 * 0.3).sin() * 400.0 + i as f64)
            .collect();
        let filtered = bandpass_filter(&signal, 0.5, 8.0, 25.0);
        assert_eq!(filtered.len(), signal.len());
        assert!(filtered.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn rate_interpolates_between_peaks() {
        // Peaks every 20 samples at 25 Hz: 75 BPM everywhere.
        let rate = rate_per_sample(&[0, 20, 40, 60], 25.0, 80);
        assert_eq!(rate.len(), 80);
        for value in rate.iter().flatten() {
            assert!((value - 75.0).abs() < 1e-9);
        }
    }
}
