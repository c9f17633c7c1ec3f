/*!
Archive document schema and archive object naming.

Every snapshot produces one object named `backup-{epochMillis}.json`. The
millisecond timestamp in the name is what the retention pruner compares
against its cutoff, so the name is the only thing the pruner ever reads.
*/

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Current archive format version
pub const ARCHIVE_FORMAT_VERSION: &str = "1.0";

/// Content type written alongside every archive object
pub const ARCHIVE_CONTENT_TYPE: &str = "application/json";

const ARCHIVE_NAME_PREFIX: &str = "backup-";
const ARCHIVE_NAME_SUFFIX: &str = ".json";

/// Metadata keys attached to every archive object
pub const META_KEY_COUNT: &str = "keyCount";
pub const META_TIMESTAMP: &str = "timestamp";
pub const META_VERSION: &str = "version";

/// The payload written per snapshot
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ArchiveDocument {
    /// Store key to the JSON value stored under it
    pub data: BTreeMap<String, serde_json::Value>,

    /// Instant the snapshot was produced, ISO 8601
    pub timestamp: String,

    /// Format version of this document
    pub version: String,
}

impl ArchiveDocument {
    /// Create a document for `data` captured at `taken_at`
    pub fn new(data: BTreeMap<String, serde_json::Value>, taken_at: DateTime<Utc>) -> Self {
        Self {
            data,
            timestamp: format_timestamp(taken_at),
            version: ARCHIVE_FORMAT_VERSION.to_string(),
        }
    }

    /// Number of keys captured
    pub fn key_count(&self) -> usize {
        self.data.len()
    }

    /// Serialize as pretty-printed JSON
    pub fn to_json_bytes(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Parse a serialized archive document
    pub fn from_json_bytes(bytes: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Object metadata denormalized from the document
    pub fn object_metadata(&self) -> HashMap<String, String> {
        HashMap::from([
            (META_KEY_COUNT.to_string(), self.key_count().to_string()),
            (META_TIMESTAMP.to_string(), self.timestamp.clone()),
            (META_VERSION.to_string(), self.version.clone()),
        ])
    }
}

/// RFC 3339 with millisecond precision and a `Z` suffix
pub fn format_timestamp(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Archive object name for a snapshot taken at `taken_at`
pub fn archive_name(taken_at: DateTime<Utc>) -> String {
    format!(
        "{ARCHIVE_NAME_PREFIX}{}{ARCHIVE_NAME_SUFFIX}",
        taken_at.timestamp_millis()
    )
}

/// Extract the embedded millisecond timestamp from an archive object name
///
/// Returns `None` for anything that is not exactly `backup-<digits>.json`,
/// including digit runs too large for an `i64`.
pub fn parse_archive_name(name: &str) -> Option<i64> {
    let digits = name
        .strip_prefix(ARCHIVE_NAME_PREFIX)?
        .strip_suffix(ARCHIVE_NAME_SUFFIX)?;

    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn instant(millis: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(millis).unwrap()
    }

    #[test]
    fn test_archive_name_embeds_millis() {
        assert_eq!(archive_name(instant(1_700_000_000_123)), "backup-1700000000123.json");
    }

    #[test]
    fn test_parse_archive_name() {
        assert_eq!(parse_archive_name("backup-1000.json"), Some(1000));
        assert_eq!(
            parse_archive_name("backup-9999999999999.json"),
            Some(9_999_999_999_999)
        );
    }

    #[test]
    fn test_parse_archive_name_rejects_other_objects() {
        for name in [
            "notes.txt",
            "backup-.json",
            "backup-12a4.json",
            "backup-1234.json.gz",
            "prefix/backup-1234.json",
            "backup--1234.json",
            "backup-+1234.json",
            "Backup-1234.json",
            "backup-99999999999999999999999.json",
        ] {
            assert_eq!(parse_archive_name(name), None, "{name} should not parse");
        }
    }

    #[test]
    fn test_name_parse_roundtrip() {
        let taken_at = instant(1_234_567_890_000);
        assert_eq!(
            parse_archive_name(&archive_name(taken_at)),
            Some(taken_at.timestamp_millis())
        );
    }

    #[test]
    fn test_document_metadata() {
        let data = BTreeMap::from([
            ("user_codes/g1/u1".to_string(), json!([{"name": "SW", "code": "123"}])),
            ("user_codes/g2/u2".to_string(), json!([{"name": "friend", "code": "456"}])),
        ]);
        let doc = ArchiveDocument::new(data, instant(5_000));

        assert_eq!(doc.version, "1.0");
        assert_eq!(doc.timestamp, "1970-01-01T00:00:05.000Z");

        let metadata = doc.object_metadata();
        assert_eq!(metadata.len(), 3);
        assert_eq!(metadata[META_KEY_COUNT], "2");
        assert_eq!(metadata[META_TIMESTAMP], "1970-01-01T00:00:05.000Z");
        assert_eq!(metadata[META_VERSION], "1.0");
    }

    #[test]
    fn test_document_serialization_preserves_entry_order() {
        let entries = json!([
            {"name": "zeta", "code": "1"},
            {"name": "alpha", "code": "2"},
            {"name": "mid", "code": "3"}
        ]);
        let data = BTreeMap::from([("user_codes/g/u".to_string(), entries.clone())]);
        let doc = ArchiveDocument::new(data, instant(0));

        let bytes = doc.to_json_bytes().unwrap();
        let parsed = ArchiveDocument::from_json_bytes(&bytes).unwrap();

        assert_eq!(parsed.data, doc.data);
        assert_eq!(parsed.data["user_codes/g/u"], entries);
    }

    #[test]
    fn test_document_json_shape() {
        let doc = ArchiveDocument::new(BTreeMap::new(), instant(0));
        let value: serde_json::Value =
            serde_json::from_slice(&doc.to_json_bytes().unwrap()).unwrap();

        assert_eq!(value["data"], json!({}));
        assert_eq!(value["version"], "1.0");
        assert!(value["timestamp"].is_string());
    }
}
