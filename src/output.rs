use crate::assembly::{RawDataset, SampleRow};
use crate::ppg_analysis::AnnotatedDataset;
use crate::recording::RecordingFile;
use crate::resample::{HrDataset, HrSample, PpgDataset, PpgSample};
use crate::summary::SummaryTable;
use anyhow::{anyhow, Context, Result};
use arrow::array::{
    Array, ArrayRef, BooleanArray, Float64Array, Int64Array, RecordBatch, StringArray,
    TimestampMillisecondArray,
};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::ipc::reader::FileReader;
use arrow::ipc::writer::FileWriter;
use chrono::{DateTime, Duration, FixedOffset, SecondsFormat, TimeZone, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

/// One summary CSV row. Timestamps travel as RFC 3339 strings with
/// millisecond precision; missing values as empty fields.
#[derive(Debug, Serialize, Deserialize)]
struct SummaryRecord {
    #[serde(rename = "Watch")]
    watch: String,
    #[serde(rename = "File")]
    file: String,
    #[serde(rename = "MAC")]
    mac: String,
    #[serde(rename = "RecordStart")]
    record_start: Option<String>,
    #[serde(rename = "RecordFinish")]
    record_finish: Option<String>,
    #[serde(rename = "DurationMs")]
    duration_ms: i64,
    #[serde(rename = "Samples")]
    samples: u64,
}

fn format_instant(t: &DateTime<FixedOffset>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_instant(raw: &str) -> Result<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(raw).with_context(|| format!("invalid timestamp: {raw}"))
}

pub fn write_summary(table: &SummaryTable, path: &Path) -> Result<()> {
    info!("Writing summary table to: {}", path.display());
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    for row in &table.rows {
        writer.serialize(SummaryRecord {
            watch: row.watch_id.clone(),
            file: row.file.display().to_string(),
            mac: row.mac_address.clone(),
            record_start: row.record_start.as_ref().map(format_instant),
            record_finish: row.record_finish.as_ref().map(format_instant),
            duration_ms: row.duration.num_milliseconds(),
            samples: row.samples,
        })?;
    }
    writer.flush()?;
    Ok(())
}

pub fn read_summary(path: &Path) -> Result<SummaryTable> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut rows = Vec::new();
    for record in reader.deserialize() {
        let record: SummaryRecord = record?;
        rows.push(RecordingFile {
            watch_id: record.watch,
            file: record.file.into(),
            mac_address: record.mac,
            record_start: record.record_start.as_deref().map(parse_instant).transpose()?,
            record_finish: record.record_finish.as_deref().map(parse_instant).transpose()?,
            duration: Duration::milliseconds(record.duration_ms),
            samples: record.samples,
        });
    }
    Ok(SummaryTable { rows })
}

fn timestamp_field(name: &str) -> Field {
    Field::new(
        name,
        DataType::Timestamp(TimeUnit::Millisecond, Some("UTC".into())),
        false,
    )
}

fn timestamp_array(times: impl Iterator<Item = i64>) -> ArrayRef {
    Arc::new(TimestampMillisecondArray::from(times.collect::<Vec<_>>()).with_timezone("UTC"))
}

fn write_batch(batch: RecordBatch, path: &Path) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = FileWriter::try_new(file, batch.schema_ref())?;
    writer.write(&batch)?;
    writer.finish()?;
    Ok(())
}

fn read_batches(path: &Path) -> Result<Vec<RecordBatch>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let reader = FileReader::try_new(file, None)?;
    reader
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("failed to read {}", path.display()))
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref())
        .ok_or_else(|| anyhow!("missing string column: {name}"))
}

fn timestamp_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a TimestampMillisecondArray> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref())
        .ok_or_else(|| anyhow!("missing timestamp column: {name}"))
}

fn float_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a Float64Array> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref())
        .ok_or_else(|| anyhow!("missing float column: {name}"))
}

fn int_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a Int64Array> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref())
        .ok_or_else(|| anyhow!("missing integer column: {name}"))
}

fn rehydrate(ms: i64, tz: FixedOffset) -> Result<DateTime<FixedOffset>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|t| t.with_timezone(&tz))
        .ok_or_else(|| anyhow!("timestamp out of range: {ms}"))
}

fn optional_float(array: &Float64Array, i: usize) -> Option<f64> {
    (!array.is_null(i)).then(|| array.value(i))
}

pub fn write_raw_dataset(dataset: &RawDataset, path: &Path) -> Result<()> {
    info!("Writing {} raw samples to: {}", dataset.rows.len(), path.display());
    let schema = Arc::new(Schema::new(vec![
        Field::new("watch", DataType::Utf8, false),
        timestamp_field("time"),
        Field::new("time_from_start", DataType::Int64, false),
        Field::new("heart_rate", DataType::Float64, false),
        Field::new("confidence", DataType::Float64, false),
        Field::new("ppg_raw", DataType::Float64, false),
        Field::new("ppg_filter", DataType::Float64, false),
        Field::new("time_difference", DataType::Int64, true),
    ]));
    let rows = &dataset.rows;
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from_iter_values(rows.iter().map(|r| &r.watch_id))),
            timestamp_array(rows.iter().map(|r| r.time.timestamp_millis())),
            Arc::new(Int64Array::from_iter_values(rows.iter().map(|r| r.time_from_start))),
            Arc::new(Float64Array::from_iter_values(rows.iter().map(|r| r.heart_rate))),
            Arc::new(Float64Array::from_iter_values(rows.iter().map(|r| r.confidence))),
            Arc::new(Float64Array::from_iter_values(rows.iter().map(|r| r.ppg_raw))),
            Arc::new(Float64Array::from_iter_values(rows.iter().map(|r| r.ppg_filter))),
            Arc::new(Int64Array::from_iter(rows.iter().map(|r| r.time_difference))),
        ],
    )?;
    write_batch(batch, path)
}

pub fn read_raw_dataset(path: &Path, tz: FixedOffset) -> Result<RawDataset> {
    let mut rows = Vec::new();
    for batch in read_batches(path)? {
        let watch = string_column(&batch, "watch")?;
        let time = timestamp_column(&batch, "time")?;
        let time_from_start = int_column(&batch, "time_from_start")?;
        let heart_rate = float_column(&batch, "heart_rate")?;
        let confidence = float_column(&batch, "confidence")?;
        let ppg_raw = float_column(&batch, "ppg_raw")?;
        let ppg_filter = float_column(&batch, "ppg_filter")?;
        let time_difference = int_column(&batch, "time_difference")?;
        for i in 0..batch.num_rows() {
            rows.push(SampleRow {
                watch_id: watch.value(i).to_string(),
                time: rehydrate(time.value(i), tz)?,
                time_from_start: time_from_start.value(i),
                heart_rate: heart_rate.value(i),
                confidence: confidence.value(i),
                ppg_raw: ppg_raw.value(i),
                ppg_filter: ppg_filter.value(i),
                time_difference: (!time_difference.is_null(i)).then(|| time_difference.value(i)),
            });
        }
    }
    Ok(RawDataset { rows })
}

pub fn write_hr_dataset(dataset: &HrDataset, path: &Path) -> Result<()> {
    info!("Writing {} HR samples to: {}", dataset.rows.len(), path.display());
    let schema = Arc::new(Schema::new(vec![
        Field::new("watch", DataType::Utf8, false),
        timestamp_field("time"),
        Field::new("heart_rate", DataType::Float64, true),
        Field::new("confidence", DataType::Float64, true),
        Field::new("heart_period", DataType::Float64, true),
    ]));
    let rows = &dataset.rows;
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from_iter_values(rows.iter().map(|r| &r.watch_id))),
            timestamp_array(rows.iter().map(|r| r.time.timestamp_millis())),
            Arc::new(Float64Array::from_iter(rows.iter().map(|r| r.heart_rate))),
            Arc::new(Float64Array::from_iter(rows.iter().map(|r| r.confidence))),
            Arc::new(Float64Array::from_iter(rows.iter().map(|r| r.heart_period))),
        ],
    )?;
    write_batch(batch, path)
}

pub fn read_hr_dataset(path: &Path, tz: FixedOffset) -> Result<HrDataset> {
    let mut rows = Vec::new();
    for batch in read_batches(path)? {
        let watch = string_column(&batch, "watch")?;
        let time = timestamp_column(&batch, "time")?;
        let heart_rate = float_column(&batch, "heart_rate")?;
        let confidence = float_column(&batch, "confidence")?;
        let heart_period = float_column(&batch, "heart_period")?;
        for i in 0..batch.num_rows() {
            rows.push(HrSample {
                watch_id: watch.value(i).to_string(),
                time: rehydrate(time.value(i), tz)?,
                heart_rate: optional_float(heart_rate, i),
                confidence: optional_float(confidence, i),
                heart_period: optional_float(heart_period, i),
            });
        }
    }
    Ok(HrDataset { rows })
}

fn ppg_fields() -> Vec<Field> {
    vec![
        Field::new("watch", DataType::Utf8, false),
        timestamp_field("time"),
        Field::new("time_from_start", DataType::Float64, false),
        Field::new("heart_rate", DataType::Float64, false),
        Field::new("confidence", DataType::Float64, false),
        Field::new("ppg_raw", DataType::Float64, false),
        Field::new("ppg_filter", DataType::Float64, false),
        Field::new("time_difference", DataType::Float64, true),
    ]
}

fn ppg_arrays(rows: &[PpgSample]) -> Vec<ArrayRef> {
    vec![
        Arc::new(StringArray::from_iter_values(rows.iter().map(|r| &r.watch_id))),
        timestamp_array(rows.iter().map(|r| r.time.timestamp_millis())),
        Arc::new(Float64Array::from_iter_values(rows.iter().map(|r| r.time_from_start))),
        Arc::new(Float64Array::from_iter_values(rows.iter().map(|r| r.heart_rate))),
        Arc::new(Float64Array::from_iter_values(rows.iter().map(|r| r.confidence))),
        Arc::new(Float64Array::from_iter_values(rows.iter().map(|r| r.ppg_raw))),
        Arc::new(Float64Array::from_iter_values(rows.iter().map(|r| r.ppg_filter))),
        Arc::new(Float64Array::from_iter(rows.iter().map(|r| r.time_difference))),
    ]
}

pub fn write_ppg_dataset(dataset: &PpgDataset, path: &Path) -> Result<()> {
    info!("Writing {} PPG samples to: {}", dataset.rows.len(), path.display());
    let schema = Arc::new(Schema::new(ppg_fields()));
    let batch = RecordBatch::try_new(schema, ppg_arrays(&dataset.rows))?;
    write_batch(batch, path)
}

pub fn read_ppg_dataset(path: &Path, tz: FixedOffset) -> Result<PpgDataset> {
    let mut rows = Vec::new();
    for batch in read_batches(path)? {
        let watch = string_column(&batch, "watch")?;
        let time = timestamp_column(&batch, "time")?;
        let time_from_start = float_column(&batch, "time_from_start")?;
        let heart_rate = float_column(&batch, "heart_rate")?;
        let confidence = float_column(&batch, "confidence")?;
        let ppg_raw = float_column(&batch, "ppg_raw")?;
        let ppg_filter = float_column(&batch, "ppg_filter")?;
        let time_difference = float_column(&batch, "time_difference")?;
        for i in 0..batch.num_rows() {
            rows.push(PpgSample {
                watch_id: watch.value(i).to_string(),
                time: rehydrate(time.value(i), tz)?,
                time_from_start: time_from_start.value(i),
                heart_rate: heart_rate.value(i),
                confidence: confidence.value(i),
                ppg_raw: ppg_raw.value(i),
                ppg_filter: ppg_filter.value(i),
                time_difference: optional_float(time_difference, i),
            });
        }
    }
    Ok(PpgDataset { rows })
}

pub fn write_annotated_dataset(dataset: &AnnotatedDataset, path: &Path) -> Result<()> {
    info!(
        "Writing {} annotated PPG samples to: {}",
        dataset.rows.len(),
        path.display()
    );
    let mut fields = ppg_fields();
    fields.extend([
        Field::new("ppg_clean", DataType::Float64, false),
        Field::new("ppg_rate", DataType::Float64, true),
        Field::new("ppg_quality", DataType::Float64, false),
        Field::new("ppg_peak", DataType::Boolean, false),
        Field::new("ppg_trough", DataType::Boolean, false),
    ]);
    let samples: Vec<PpgSample> = dataset.rows.iter().map(|r| r.sample.clone()).collect();
    let mut arrays = ppg_arrays(&samples);
    arrays.extend([
        Arc::new(Float64Array::from_iter_values(dataset.rows.iter().map(|r| r.ppg_clean)))
            as ArrayRef,
        Arc::new(Float64Array::from_iter(dataset.rows.iter().map(|r| r.ppg_rate))),
        Arc::new(Float64Array::from_iter_values(dataset.rows.iter().map(|r| r.ppg_quality))),
        Arc::new(BooleanArray::from_iter(
            dataset.rows.iter().map(|r| Some(r.ppg_peak)),
        )),
        Arc::new(BooleanArray::from_iter(
            dataset.rows.iter().map(|r| Some(r.ppg_trough)),
        )),
    ]);
    let batch = RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)?;
    write_batch(batch, path)
}
