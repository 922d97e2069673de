use crate::PipelineError;
use chrono::{DateTime, FixedOffset, NaiveDateTime};
use clap::Parser;
use log::LevelFilter;
use std::path::PathBuf;

/// Preprocess raw recordings from wearable PPG watches
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Directory containing raw watch recording files
    #[arg(help = "Directory containing raw watch recording files")]
    pub raw_dir: PathBuf,

    /// Directory for processed data artifacts
    #[arg(long, default_value = "processed")]
    pub processed_dir: PathBuf,

    /// Directory for the file summary table
    #[arg(long, default_value = "summary")]
    pub summary_dir: PathBuf,

    /// Directory reserved for figure output
    #[arg(long, default_value = "figures")]
    pub figures_dir: PathBuf,

    /// Suffix that candidate recording files must match
    #[arg(long, default_value = ".csv")]
    pub file_pattern: String,

    /// Fixed UTC offset for all timestamps (format: +HH:MM), defaults to UTC
    #[arg(long)]
    pub timezone: Option<String>,

    /// Minimum record length in seconds below which a recording is flagged
    #[arg(long, default_value = "60.0")]
    pub minimum_record_length: f64,

    /// Minimum sample rate in samples/second below which a recording is flagged
    #[arg(long, default_value = "1.0")]
    pub minimum_sample_rate: f64,

    /// Drop samples at or before this instant (format: YYYY-MM-DD HH:MM)
    #[arg(long)]
    pub trim_data_before: Option<String>,

    /// Drop samples at or after this instant (format: YYYY-MM-DD HH:MM)
    #[arg(long)]
    pub trim_data_after: Option<String>,

    /// Heart-rate resampling grid width in milliseconds
    #[arg(long, default_value = "1000")]
    pub hr_resample_rate: i64,

    /// PPG resampling grid width in milliseconds
    #[arg(long, default_value = "50")]
    pub ppg_resample_rate: i64,

    /// PPG interpolation grid width in milliseconds (1ms recommended)
    #[arg(long, default_value = "1")]
    pub interpolation_rate: i64,

    /// Reprocess everything even if artifacts already exist
    #[arg(long)]
    pub force: bool,

    /// Log verbosity (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    pub log_level: LevelFilter,
}

impl Config {
    /// The fixed offset all parsed instants are converted into.
    pub fn tz_offset(&self) -> Result<FixedOffset, PipelineError> {
        match &self.timezone {
            None => Ok(FixedOffset::east_opt(0).unwrap()),
            Some(s) => parse_offset(s)
                .ok_or_else(|| PipelineError::Config(format!("invalid timezone offset: {s}"))),
        }
    }

    pub fn trim_bounds(
        &self,
    ) -> Result<(Option<DateTime<FixedOffset>>, Option<DateTime<FixedOffset>>), PipelineError>
    {
        let tz = self.tz_offset()?;
        let parse = |s: &Option<String>| -> Result<Option<DateTime<FixedOffset>>, PipelineError> {
            match s {
                None => Ok(None),
                Some(raw) => {
                    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M")
                        .map_err(|e| {
                            PipelineError::Config(format!("invalid trim instant {raw:?}: {e}"))
                        })?;
                    naive
                        .and_local_timezone(tz)
                        .single()
                        .map(Some)
                        .ok_or_else(|| {
                            PipelineError::Config(format!("ambiguous trim instant: {raw}"))
                        })
                }
            }
        };
        Ok((parse(&self.trim_data_before)?, parse(&self.trim_data_after)?))
    }

    /// Reject configurations no stage could run under. Fatal before any stage.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if !self.raw_dir.is_dir() {
            return Err(PipelineError::Config(format!(
                "raw data directory does not exist: {}",
                self.raw_dir.display()
            )));
        }
        if self.minimum_record_length < 0.0 || self.minimum_sample_rate < 0.0 {
            return Err(PipelineError::Config(
                "quality thresholds must be non-negative".into(),
            ));
        }
        if self.hr_resample_rate <= 0 || self.ppg_resample_rate <= 0 || self.interpolation_rate <= 0
        {
            return Err(PipelineError::Config(
                "resample rates must be positive millisecond widths".into(),
            ));
        }
        if self.interpolation_rate > self.ppg_resample_rate {
            return Err(PipelineError::Config(format!(
                "interpolation rate ({}ms) must not exceed the PPG resample rate ({}ms)",
                self.interpolation_rate, self.ppg_resample_rate
            )));
        }
        self.tz_offset()?;
        self.trim_bounds()?;
        Ok(())
    }

    /// Create the output directories. The raw directory is never created:
    /// pointing the tool at a missing input location is a configuration error.
    pub fn init_directories(&self) -> anyhow::Result<()> {
        for dir in [&self.processed_dir, &self.summary_dir, &self.figures_dir] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Parse a "+HH:MM" / "-HH:MM" offset string.
fn parse_offset(s: &str) -> Option<FixedOffset> {
    let (sign, rest) = match s.as_bytes().first()? {
        b'+' => (1, &s[1..]),
        b'-' => (-1, &s[1..]),
        _ => return None,
    };
    let (hh, mm) = rest.split_once(':')?;
    let hours: i32 = hh.parse().ok()?;
    let minutes: i32 = mm.parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}
