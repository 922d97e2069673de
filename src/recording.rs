use chrono::{DateTime, Duration, FixedOffset, TimeZone, Utc};
use log::error;
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

/// Placeholder for header metadata that is absent or unparseable.
pub const UNKNOWN: &str = "Unknown";

/// Parsed header metadata for one raw recording file. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingFile {
    /// 4-character watch id (`W` + 3 alphanumerics), or [`UNKNOWN`].
    pub watch_id: String,
    pub file: PathBuf,
    /// Six colon-separated hex byte pairs, or [`UNKNOWN`].
    pub mac_address: String,
    pub record_start: Option<DateTime<FixedOffset>>,
    pub record_finish: Option<DateTime<FixedOffset>>,
    /// `record_finish - record_start`, or zero if either endpoint is missing.
    pub duration: Duration,
    pub samples: u64,
}

impl RecordingFile {
    /// Sentinel row standing in for a file that could not be opened.
    pub fn sentinel(path: &Path) -> Self {
        RecordingFile {
            watch_id: UNKNOWN.to_string(),
            file: path.to_path_buf(),
            mac_address: UNKNOWN.to_string(),
            record_start: None,
            record_finish: None,
            duration: Duration::zero(),
            samples: 0,
        }
    }
}

/// A header field that was absent or malformed. Collected alongside the parse
/// result instead of interrupting the scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderIssue {
    MacMissing,
    WatchIdMissing,
    StartTimestampMissing,
    StartTimestampInvalid(String),
    EndTimestampMissing,
    EndTimestampInvalid(String),
}

impl fmt::Display for HeaderIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderIssue::MacMissing => write!(f, "MAC address not found"),
            HeaderIssue::WatchIdMissing => write!(f, "watch id not found"),
            HeaderIssue::StartTimestampMissing => write!(f, "start timestamp missing"),
            HeaderIssue::StartTimestampInvalid(v) => write!(f, "invalid start timestamp: {v}"),
            HeaderIssue::EndTimestampMissing => {
                write!(f, "end timestamp missing after STOP_RECORD")
            }
            HeaderIssue::EndTimestampInvalid(v) => write!(f, "invalid end timestamp: {v}"),
        }
    }
}

/// Parse one recording file in a single forward scan.
///
/// Line 1 carries the MAC address and watch id, line 2 the start timestamp,
/// and any line containing `STOP_RECORD` the end timestamp (the last
/// occurrence governs). Every other line counts as one sample. Missing or
/// malformed header fields become sentinels plus a [`HeaderIssue`]; only a
/// file that cannot be opened yields `None`, with the error logged.
pub fn check_file(path: &Path, tz: FixedOffset) -> Option<(RecordingFile, Vec<HeaderIssue>)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) => {
            error!("File not found: {} ({e})", path.display());
            return None;
        }
    };
    let mut reader = BufReader::new(file);

    let mut watch_id = UNKNOWN.to_string();
    let mut mac_address = UNKNOWN.to_string();
    let mut record_start = None;
    let mut record_finish = None;
    let mut samples: u64 = 0;
    let mut issues = Vec::new();

    let mut buf = Vec::new();
    let mut index = 0usize;
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                error!("Read error in {}: {e}", path.display());
                break;
            }
        }
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end_matches(['\n', '\r']);

        if index == 0 {
            match extract_mac(line) {
                Some(mac) => mac_address = mac.to_string(),
                None => issues.push(HeaderIssue::MacMissing),
            }
            match extract_watch_id(line) {
                Some(id) => watch_id = id.to_string(),
                None => issues.push(HeaderIssue::WatchIdMissing),
            }
        } else if index == 1 {
            match quoted_field(line, "UNIXTimeStamp") {
                Some(raw) => match parse_epoch_ms(raw, tz) {
                    Some(t) => record_start = Some(t),
                    None => issues.push(HeaderIssue::StartTimestampInvalid(raw.to_string())),
                },
                None => issues.push(HeaderIssue::StartTimestampMissing),
            }
        } else if line.contains("STOP_RECORD") {
            match quoted_field(line, "UNIXTimeStamp") {
                Some(raw) => match parse_epoch_ms(raw, tz) {
                    Some(t) => record_finish = Some(t),
                    None => issues.push(HeaderIssue::EndTimestampInvalid(raw.to_string())),
                },
                None => issues.push(HeaderIssue::EndTimestampMissing),
            }
        } else {
            samples += 1;
        }
        index += 1;
    }

    let duration = match (record_start, record_finish) {
        (Some(start), Some(finish)) => finish - start,
        _ => Duration::zero(),
    };

    Some((
        RecordingFile {
            watch_id,
            file: path.to_path_buf(),
            mac_address,
            record_start,
            record_finish,
            duration,
            samples,
        },
        issues,
    ))
}

/// Extract the value of a `"key":"value"` field from a quasi-JSON line.
fn quoted_field<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let tag = format!("\"{key}\":\"");
    let start = line.find(&tag)? + tag.len();
    let rest = &line[start..];
    let end = rest.find('"')?;
    Some(&rest[..end])
}

fn extract_mac(line: &str) -> Option<&str> {
    let candidate = quoted_field(line, "MAC")?;
    if candidate.len() != 17 {
        return None;
    }
    let ok = candidate.as_bytes().iter().enumerate().all(|(i, &b)| {
        if i % 3 == 2 {
            b == b':'
        } else {
            b.is_ascii_hexdigit()
        }
    });
    ok.then_some(candidate)
}

/// First 4-character token starting with `W` followed by 3 alphanumerics.
fn extract_watch_id(line: &str) -> Option<&str> {
    let bytes = line.as_bytes();
    for i in 0..bytes.len().saturating_sub(3) {
        if bytes[i] == b'W' && bytes[i + 1..i + 4].iter().all(|b| b.is_ascii_alphanumeric()) {
            return Some(&line[i..i + 4]);
        }
    }
    None
}

/// Parse a UTC epoch-millisecond string into the configured offset.
fn parse_epoch_ms(raw: &str, tz: FixedOffset) -> Option<DateTime<FixedOffset>> {
    let ms: i64 = raw.trim().parse().ok()?;
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|t| t.with_timezone(&tz))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    fn write_temp(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("watch-preprocess-{}-{name}", std::process::id()));
        let mut f = File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    const HEADER: &str = "{\"MAC\":\"AA:BB:CC:DD:EE:FF\",\"name\":\"W001\"}\n\
                          {\"UNIXTimeStamp\":\"1700000000000\",\"event\":\"START\"}\n";

    #[test]
    fn parses_well_formed_header() {
        let path = write_temp("wellformed.csv", &format!("{HEADER}0,700,95,12000,11000\n1000,700,95,12100,11050\n"));
        let (rec, issues) = check_file(&path, utc()).unwrap();
        assert_eq!(rec.watch_id, "W001");
        assert_eq!(rec.mac_address, "AA:BB:CC:DD:EE:FF");
        assert_eq!(rec.record_start.unwrap().timestamp_millis(), 1_700_000_000_000);
        assert_eq!(rec.samples, 2);
        assert_eq!(rec.duration, Duration::zero());
        assert!(issues.is_empty());
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn stop_record_sets_duration_and_is_not_a_sample() {
        let contents = format!(
            "{HEADER}0,700,95,12000,11000\n1000,700,95,12100,11050\n\
             {{\"event\":\"STOP_RECORD\",\"UNIXTimeStamp\":\"1700000050000\"}}\n"
        );
        let path = write_temp("stop.csv", &contents);
        let (rec, issues) = check_file(&path, utc()).unwrap();
        assert_eq!(rec.samples, 2);
        assert_eq!(rec.duration, Duration::seconds(50));
        assert!(issues.is_empty());
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn last_stop_record_governs() {
        let contents = format!(
            "{HEADER}0,700,95,12000,11000\n\
             {{\"event\":\"STOP_RECORD\",\"UNIXTimeStamp\":\"1700000010000\"}}\n\
             1000,700,95,12100,11050\n\
             {{\"event\":\"STOP_RECORD\",\"UNIXTimeStamp\":\"1700000060000\"}}\n"
        );
        let path = write_temp("double-stop.csv", &contents);
        let (rec, _) = check_file(&path, utc()).unwrap();
        assert_eq!(rec.duration, Duration::seconds(60));
        assert_eq!(rec.samples, 2);
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn missing_fields_become_sentinels_with_issues() {
        let contents = "{\"name\":\"watch\"}\n{\"event\":\"START\"}\n0,700,95,1,1\n";
        let path = write_temp("missing.csv", contents);
        let (rec, issues) = check_file(&path, utc()).unwrap();
        assert_eq!(rec.watch_id, UNKNOWN);
        assert_eq!(rec.mac_address, UNKNOWN);
        assert!(rec.record_start.is_none());
        assert_eq!(rec.duration, Duration::zero());
        assert!(issues.contains(&HeaderIssue::MacMissing));
        assert!(issues.contains(&HeaderIssue::WatchIdMissing));
        assert!(issues.contains(&HeaderIssue::StartTimestampMissing));
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn malformed_mac_is_rejected() {
        let contents = "{\"MAC\":\"not-a-mac-addr!!\",\"name\":\"W0A9\"}\n\
                        {\"UNIXTimeStamp\":\"1700000000000\"}\n";
        let path = write_temp("badmac.csv", contents);
        let (rec, issues) = check_file(&path, utc()).unwrap();
        assert_eq!(rec.mac_address, UNKNOWN);
        assert_eq!(rec.watch_id, "W0A9");
        assert!(issues.contains(&HeaderIssue::MacMissing));
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn invalid_timestamp_reported() {
        let contents = "{\"MAC\":\"AA:BB:CC:DD:EE:FF\",\"name\":\"W001\"}\n\
                        {\"UNIXTimeStamp\":\"not-a-number\"}\n";
        let path = write_temp("badts.csv", contents);
        let (rec, issues) = check_file(&path, utc()).unwrap();
        assert!(rec.record_start.is_none());
        assert!(issues
            .iter()
            .any(|i| matches!(i, HeaderIssue::StartTimestampInvalid(_))));
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn timezone_offset_is_applied() {
        let path = write_temp("tz.csv", HEADER);
        let tz = FixedOffset::east_opt(9 * 3600 + 30 * 60).unwrap();
        let (rec, _) = check_file(&path, tz).unwrap();
        let start = rec.record_start.unwrap();
        assert_eq!(start.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(start.offset().local_minus_utc(), 9 * 3600 + 30 * 60);
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn missing_file_yields_none() {
        assert!(check_file(Path::new("/no/such/recording.csv"), utc()).is_none());
    }
}
