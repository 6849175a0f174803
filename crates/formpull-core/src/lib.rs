//! Core domain model for the formpull sync pipeline.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

pub const CRATE_NAME: &str = "formpull-core";

/// Remote metadata keys the survey service injects into every submission row.
pub const UID_KEY: &str = "_uuid";
pub const SUBMISSION_TIME_KEY: &str = "_submission_time";
pub const FORM_ID_KEY: &str = "_xform_id_string";
pub const ATTACHMENTS_KEY: &str = "_attachments";

/// One submission row as produced by the remote form service: a flat map from
/// dotted/grouped question keys to JSON values. Immutable once fetched; a
/// resubmission on the remote side shows up as a new row with a new UID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteSubmission {
    row: JsonMap<String, JsonValue>,
}

impl RemoteSubmission {
    /// Accepts a raw JSON row, requiring an object with a non-empty external UID.
    pub fn from_value(value: JsonValue) -> Option<Self> {
        let row = match value {
            JsonValue::Object(map) => map,
            _ => return None,
        };
        let has_uid = row
            .get(UID_KEY)
            .and_then(JsonValue::as_str)
            .is_some_and(|uid| !uid.is_empty());
        if !has_uid {
            return None;
        }
        Some(Self { row })
    }

    pub fn uid(&self) -> &str {
        self.row
            .get(UID_KEY)
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
    }

    pub fn submission_time(&self) -> Option<&str> {
        self.row.get(SUBMISSION_TIME_KEY).and_then(JsonValue::as_str)
    }

    pub fn form_id(&self) -> Option<&str> {
        self.row.get(FORM_ID_KEY).and_then(JsonValue::as_str)
    }

    pub fn value(&self, key: &str) -> Option<&JsonValue> {
        self.row.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.row.contains_key(key)
    }

    /// Attachment descriptors under `_attachments`; rows that do not parse as
    /// descriptors are dropped rather than failing the submission.
    pub fn attachments(&self) -> Vec<AttachmentDescriptor> {
        self.row
            .get(ATTACHMENTS_KEY)
            .and_then(JsonValue::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| {
                        serde_json::from_value::<AttachmentDescriptor>(entry.clone()).ok()
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Full raw payload, serialized for the audit field on the target record.
    pub fn raw_json(&self) -> String {
        serde_json::to_string(&self.row).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Reference to one uploaded file inside a submission. `download_url` may point
/// at the bytes directly or at a metadata document that redirects to them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AttachmentDescriptor {
    #[serde(default)]
    pub question_xpath: String,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub download_url: Option<String>,
}

impl AttachmentDescriptor {
    /// Final path segment of the question identifier, used to resolve the
    /// descriptor against the attachment mapping table.
    pub fn lookup_key(&self) -> &str {
        self.question_xpath
            .trim()
            .rsplit('/')
            .next()
            .unwrap_or_default()
    }
}

/// Opaque pagination token returned by the remote service. Followed verbatim,
/// never reconstructed, so service-controlled query parameters survive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    pub fn new(url: impl Into<String>) -> Self {
        Self(url.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Target field kinds reported by schema introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// Free-form scalar (text, date, number).
    Scalar,
    /// Enumerated scalar restricted to a closed allow-list.
    Select,
    /// Structured child-table field. Never a scalar write target.
    Table,
    /// Scalar holding a stored-file locator.
    Attach,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub kind: FieldKind,
    #[serde(default)]
    pub options: Vec<String>,
}

impl FieldDef {
    pub fn scalar() -> Self {
        Self {
            kind: FieldKind::Scalar,
            options: Vec::new(),
        }
    }

    pub fn select(options: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            kind: FieldKind::Select,
            options: options.into_iter().map(Into::into).collect(),
        }
    }

    pub fn table() -> Self {
        Self {
            kind: FieldKind::Table,
            options: Vec::new(),
        }
    }

    pub fn attach() -> Self {
        Self {
            kind: FieldKind::Attach,
            options: Vec::new(),
        }
    }
}

/// Read-only schema introspection over the target record type.
pub trait TargetSchema: Send + Sync {
    fn field(&self, name: &str) -> Option<FieldDef>;

    fn field_kind(&self, name: &str) -> Option<FieldKind> {
        self.field(name).map(|def| def.kind)
    }

    fn allowed_values(&self, name: &str) -> Vec<String> {
        self.field(name).map(|def| def.options).unwrap_or_default()
    }
}

/// Static remote-key -> target-field configuration. Keys are unique by
/// construction; values must name scalar fields only, which the projector
/// enforces against the schema at runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldMappingTable {
    entries: BTreeMap<String, String>,
}

impl FieldMappingTable {
    pub fn new(entries: BTreeMap<String, String>) -> Self {
        Self { entries }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn remote_keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Static question-identifier-suffix -> target-field configuration for
/// attachment resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttachmentMappingTable {
    entries: BTreeMap<String, String>,
}

impl AttachmentMappingTable {
    pub fn new(entries: BTreeMap<String, String>) -> Self {
        Self { entries }
    }

    pub fn resolve(&self, suffix: &str) -> Option<&str> {
        self.entries.get(suffix).map(String::as_str)
    }
}

/// Canonical persisted record: identity coincides with the external UID, so
/// the dedup key and the record name are the same string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetRecord {
    pub uid: String,
    pub fields: BTreeMap<String, JsonValue>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl TargetRecord {
    pub fn new(uid: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            uid: uid.into(),
            fields: BTreeMap::new(),
            created_at: now,
            modified_at: now,
        }
    }

    pub fn get(&self, field: &str) -> Option<&JsonValue> {
        self.fields.get(field)
    }

    pub fn set(&mut self, field: impl Into<String>, value: JsonValue) {
        self.fields.insert(field.into(), value);
    }

    pub fn clear(&mut self, field: impl Into<String>) {
        self.fields.insert(field.into(), JsonValue::Null);
    }

    /// Empty means unset, JSON null, or the empty string. Numeric zero is a
    /// real value and is not empty.
    pub fn is_field_empty(&self, field: &str) -> bool {
        match self.fields.get(field) {
            None => true,
            Some(value) => is_empty_value(value),
        }
    }
}

/// Presence test shared by the projector and the upsert engine.
pub fn is_empty_value(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::String(s) => s.is_empty(),
        _ => false,
    }
}
