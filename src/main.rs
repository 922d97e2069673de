use anyhow::Result;
use clap::Parser;
use log::info;
use watch_preprocess::config::Config;
use watch_preprocess::ppg_analysis::{find_ppg_peaks, ElgendiProcessor};
use watch_preprocess::{assembly, output, resample, summary};

fn main() -> Result<()> {
    let cfg = Config::parse();
    env_logger::Builder::new().filter_level(cfg.log_level).init();

    cfg.validate()?;
    cfg.init_directories()?;
    if cfg.force {
        info!("Force flag set, existing artifacts will be overwritten");
    }
    let tz = cfg.tz_offset()?;

    // Stage 1: scan the study directory and persist the per-file summary.
    let mut table = summary::summarise_directory(&cfg)?;
    output::write_summary(&table, &cfg.summary_dir.join("files_watch_summary.csv"))?;

    // Stage 2: drop every watch with a recording below the quality bar.
    let flagged = summary::flag_records(&table, cfg.minimum_record_length, cfg.minimum_sample_rate);
    table.exclude_flagged(&flagged);

    // Stage 3: ingest the surviving recordings into one dataset.
    let raw = assembly::assemble_raw_data(&table, tz);
    output::write_raw_dataset(&raw, &cfg.processed_dir.join("raw_data_full.arrow"))?;

    // Stage 4: restrict to the study period.
    let (period_start, period_end) = cfg.trim_bounds()?;
    let trimmed = assembly::trim_raw_data(&raw, period_start, period_end);
    output::write_raw_dataset(&trimmed, &cfg.processed_dir.join("raw_data_trimmed.arrow"))?;

    // Stage 5: fixed-grid resampling of both modalities.
    let hr = resample::resample_hr(&trimmed, cfg.hr_resample_rate);
    output::write_hr_dataset(
        &hr,
        &cfg.processed_dir
            .join(format!("resampled_HR_{}ms.arrow", cfg.hr_resample_rate)),
    )?;

    let ppg = resample::resample_ppg(&trimmed, cfg.interpolation_rate, cfg.ppg_resample_rate);
    output::write_ppg_dataset(
        &ppg,
        &cfg.processed_dir
            .join(format!("resampled_PPG_{}ms.arrow", cfg.ppg_resample_rate)),
    )?;

    // Stage 6: per-sample PPG annotation.
    let annotated = find_ppg_peaks(&ppg, cfg.ppg_resample_rate, &ElgendiProcessor::default())?;
    output::write_annotated_dataset(
        &annotated,
        &cfg.processed_dir
            .join(format!("ppg_peaks_{}ms.arrow", cfg.ppg_resample_rate)),
    )?;

    info!("Preprocessing complete");
    Ok(())
}
