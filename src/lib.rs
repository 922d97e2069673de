pub mod assembly;
pub mod config;
pub mod output;
pub mod ppg_analysis;
pub mod recording;
pub mod resample;
pub mod summary;

use thiserror::Error;

/// Fatal pipeline failures. Per-file and per-row problems are tolerated with
/// sentinel values or exclusion and never surface as errors; these two abort
/// the run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error(
        "annotation mismatch for watch {watch_id}: signal has {expected} samples, \
         processor returned {actual}"
    )]
    AnnotationMismatch {
        watch_id: String,
        expected: usize,
        actual: usize,
    },
}
