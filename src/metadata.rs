#![forbid(unsafe_code)]

//! On-disk metadata documents for archived records.
//!
//! Every record id owns one directory under the output root. The directory
//! holds either a success bundle (`metadata.json`, `videoplayback.flv`,
//! optionally `thumbnail.jpg`) or a `failed.json` marker. The structs in
//! this module mirror how those documents are serialized to disk.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDateTime, TimeZone};
use serde::{Deserialize, Serialize};

pub const METADATA_FILE: &str = "metadata.json";
pub const FAILURE_FILE: &str = "failed.json";
pub const VIDEO_FILE: &str = "videoplayback.flv";
pub const THUMBNAIL_FILE: &str = "thumbnail.jpg";

/// Upload dates in the dump look like `20210615120000` with an optional
/// `,PDT`-style tail.
const UPLOAD_FORMAT: &str = "%Y%m%d%H%M%S";

/// Success document written next to the downloaded media.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoMetadata {
    pub id: String,
    pub title: String,
    pub description: String,
    /// `null` when the source omitted the length and probing the downloaded
    /// file failed too.
    pub length: Option<String>,
    /// Upload time as epoch seconds.
    pub uploaded: i64,
}

/// Marker document for records whose media is gone for good. Its presence
/// makes every future run skip the record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub id: String,
    /// HTTP status code that made the record permanently unarchivable.
    pub error: u16,
}

/// Parses the archive's upload field into epoch seconds.
///
/// Trailing comma-separated free text (usually a timezone label) is
/// discarded. The timestamp carries a fixed offset baked into the source
/// data, so it is interpreted in local time and not normalized further.
pub fn parse_upload_timestamp(value: &str) -> Option<i64> {
    let digits = value.split(',').next().unwrap_or_default().trim();
    let naive = NaiveDateTime::parse_from_str(digits, UPLOAD_FORMAT).ok()?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|stamp| stamp.timestamp())
}

fn write_document<T: Serialize>(path: &Path, document: &T) -> Result<()> {
    let payload =
        serde_json::to_string_pretty(document).context("serializing metadata document")?;
    fs::write(path, payload).with_context(|| format!("writing {}", path.display()))
}

/// Persists the success document inside the record directory.
pub fn write_metadata(dir: &Path, metadata: &VideoMetadata) -> Result<()> {
    write_document(&dir.join(METADATA_FILE), metadata)
}

/// Persists the permanent-failure marker inside the record directory.
pub fn write_failure(dir: &Path, failure: &FailureRecord) -> Result<()> {
    write_document(&dir.join(FAILURE_FILE), failure)
}

/// Reads a previously written success document.
pub fn read_metadata(dir: &Path) -> Result<VideoMetadata> {
    let path = dir.join(METADATA_FILE);
    let payload =
        fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&payload).with_context(|| format!("parsing {}", path.display()))
}

/// True when the directory carries a `failed.json` marker, i.e. the record
/// is known-bad and must never be reattempted.
pub fn has_failure_marker(dir: &Path) -> bool {
    dir.join(FAILURE_FILE).is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parses_upload_timestamp_with_timezone_tail() {
        let epoch = parse_upload_timestamp("20210615120000,PDT").expect("timestamp parses");
        let expected = Local
            .with_ymd_and_hms(2021, 6, 15, 12, 0, 0)
            .earliest()
            .expect("local time resolves")
            .timestamp();
        assert_eq!(epoch, expected);
    }

    #[test]
    fn parses_upload_timestamp_without_tail() {
        let epoch = parse_upload_timestamp("20200101000000").expect("timestamp parses");
        let expected = Local
            .with_ymd_and_hms(2020, 1, 1, 0, 0, 0)
            .earliest()
            .expect("local time resolves")
            .timestamp();
        assert_eq!(epoch, expected);
    }

    #[test]
    fn rejects_non_timestamp_values() {
        assert!(parse_upload_timestamp("01:30").is_none());
        assert!(parse_upload_timestamp("").is_none());
        assert!(parse_upload_timestamp("http://x/video.flv").is_none());
        // Month 13 is structurally a digit string but not a date.
        assert!(parse_upload_timestamp("20211315120000").is_none());
    }

    #[test]
    fn metadata_document_round_trips() {
        let dir = tempdir().unwrap();
        let metadata = VideoMetadata {
            id: "123".into(),
            title: "My Video".into(),
            description: "A great clip".into(),
            length: Some("01:30".into()),
            uploaded: 1_623_783_600,
        };
        write_metadata(dir.path(), &metadata).unwrap();
        let read_back = read_metadata(dir.path()).unwrap();
        assert_eq!(read_back, metadata);
    }

    #[test]
    fn unknown_length_serializes_as_null() {
        let dir = tempdir().unwrap();
        let metadata = VideoMetadata {
            id: "9".into(),
            title: "t".into(),
            description: "d".into(),
            length: None,
            uploaded: 0,
        };
        write_metadata(dir.path(), &metadata).unwrap();
        let raw = std::fs::read_to_string(dir.path().join(METADATA_FILE)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(value["length"].is_null());
    }

    #[test]
    fn failure_marker_is_detected() {
        let dir = tempdir().unwrap();
        assert!(!has_failure_marker(dir.path()));
        write_failure(
            dir.path(),
            &FailureRecord {
                id: "123".into(),
                error: 404,
            },
        )
        .unwrap();
        assert!(has_failure_marker(dir.path()));

        let raw = std::fs::read_to_string(dir.path().join(FAILURE_FILE)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["error"], 404);
        assert_eq!(value["id"], "123");
    }
}
