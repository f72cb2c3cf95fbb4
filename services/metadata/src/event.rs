//! Change event model.
//!
//! A [`ChangeEvent`] is parsed once per invocation from the notification
//! envelope delivered by the event bus. Only the event-bus envelope shape is
//! supported; the direct bucket-notification shape (`{"Records": [...]}`) is
//! rejected with [`Error::UnsupportedSourceFormat`] rather than guessed at.

use crate::error::{Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Version sentinel used in the identity key of unversioned containers
pub const UNVERSIONED_SENTINEL: &str = "0";

/// Kind of change reported by the notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "Object Created")]
    Created,
    #[serde(rename = "Object Deleted")]
    Deleted,
}

/// Sub-kind of a delete notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeletionType {
    #[serde(rename = "Permanently Deleted")]
    PermanentlyDeleted,
    #[serde(rename = "Delete Marker Created")]
    DeleteMarkerCreated,
}

/// Source-assigned ordering token.
///
/// Ordered byte-wise. For two events on the same identity the later one
/// carries the strictly greater sequencer; equal sequencers are the same
/// logical event delivered twice.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sequencer(String);

impl Sequencer {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Sequencer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Primary key of a metadata record: `base64(container/key)-<version | 0>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityKey(String);

impl IdentityKey {
    pub fn from_parts(container: &str, key: &str, version_id: Option<&str>) -> Self {
        let encoded = STANDARD.encode(format!("{}/{}", container, key));
        Self(format!(
            "{}-{}",
            encoded,
            version_id.unwrap_or(UNVERSIONED_SENTINEL)
        ))
    }

    /// Wrap an already-derived key, e.g. one read back from storage
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable change notification for one object version
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeEvent {
    pub kind: EventKind,
    /// Source-reported time; never used for ordering
    pub occurred_at: DateTime<Utc>,
    pub container: String,
    pub key: String,
    /// `None` for unversioned containers
    pub version_id: Option<String>,
    pub sequencer: Sequencer,
    /// Content fingerprint used to pin fetches to the notified content
    pub etag: Option<String>,
    pub deletion_type: Option<DeletionType>,
}

/// Event-bus notification envelope
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "detail-type")]
    detail_type: EventKind,
    time: String,
    detail: Detail,
}

#[derive(Debug, Deserialize)]
struct Detail {
    bucket: BucketRef,
    object: ObjectRef,
    #[serde(rename = "deletion-type", default)]
    deletion_type: Option<DeletionType>,
}

#[derive(Debug, Deserialize)]
struct BucketRef {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ObjectRef {
    key: String,
    #[serde(rename = "version-id", default)]
    version_id: Option<String>,
    #[serde(default)]
    etag: Option<String>,
    sequencer: String,
}

impl ChangeEvent {
    /// Parse a raw notification body
    pub fn from_slice(payload: &[u8]) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_slice(payload)
            .map_err(|e| Error::MalformedEvent(format!("payload is not JSON: {}", e)))?;
        Self::from_value(value)
    }

    /// Parse an already-decoded notification envelope
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let Some(object) = value.as_object() else {
            return Err(Error::UnsupportedSourceFormat(
                "envelope is not a JSON object".to_string(),
            ));
        };

        if object.contains_key("Records") {
            return Err(Error::UnsupportedSourceFormat(
                "direct bucket notifications (Records) are not supported".to_string(),
            ));
        }

        let envelope: Envelope =
            serde_json::from_value(value).map_err(|e| Error::MalformedEvent(e.to_string()))?;

        let occurred_at = parse_event_time(&envelope.time)?;
        let Detail {
            bucket,
            object,
            deletion_type,
        } = envelope.detail;

        if bucket.name.is_empty() {
            return Err(Error::MalformedEvent("empty bucket name".to_string()));
        }
        if object.key.is_empty() {
            return Err(Error::MalformedEvent("empty object key".to_string()));
        }
        if object.sequencer.is_empty() {
            return Err(Error::MalformedEvent("empty sequencer".to_string()));
        }

        Ok(Self {
            kind: envelope.detail_type,
            occurred_at,
            container: bucket.name,
            key: object.key,
            version_id: object.version_id.filter(|v| !v.is_empty()),
            sequencer: Sequencer::new(object.sequencer),
            etag: object.etag.filter(|e| !e.is_empty()),
            deletion_type,
        })
    }

    pub fn identity_key(&self) -> IdentityKey {
        IdentityKey::from_parts(&self.container, &self.key, self.version_id.as_deref())
    }

    /// Lower-cased key extension without the dot, if any
    pub fn key_extension(&self) -> Option<String> {
        let file_name = self.key.rsplit('/').next().unwrap_or(&self.key);
        match file_name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => {
                Some(ext.to_ascii_lowercase())
            }
            _ => None,
        }
    }
}

/// Accept RFC 3339 and offset-less ISO-8601 timestamps (assumed UTC)
fn parse_event_time(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }

    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| Utc.from_utc_datetime(&naive))
        .map_err(|e| Error::MalformedEvent(format!("invalid time {:?}: {}", raw, e)))
}

#[cfg(test)]
pub(crate) fn test_event(kind: EventKind, key: &str, sequencer: &str) -> ChangeEvent {
    ChangeEvent {
        kind,
        occurred_at: Utc.with_ymd_and_hms(2024, 8, 20, 20, 18, 8).unwrap(),
        container: "input-bucket".to_string(),
        key: key.to_string(),
        version_id: None,
        sequencer: Sequencer::new(sequencer),
        etag: Some("\"1a58ea1ae8e96a9415258423fc223992\"".to_string()),
        deletion_type: None,
    }
}
