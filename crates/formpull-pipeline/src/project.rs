//! Field projection: narrowing a loosely-typed remote submission onto the
//! strictly-typed target schema.

use formpull_core::{is_empty_value, FieldKind, FieldMappingTable, RemoteSubmission, TargetSchema};
use serde_json::Value as JsonValue;
use tracing::warn;

/// One projected write. `Clear` is an explicit write of emptiness, distinct
/// from producing no write at all.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldWrite {
    Set(JsonValue),
    Clear,
}

/// An enumerated value outside the schema's allow-list. The field is skipped;
/// the rest of the record still projects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectRejection {
    pub field: String,
    pub rejected: String,
    pub allowed: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Projection {
    pub writes: Vec<(String, FieldWrite)>,
    pub warnings: Vec<SelectRejection>,
}

/// Projects every mapping-table entry onto target-field writes.
///
/// Per-kind rules:
/// - table-typed targets are skipped silently, whatever the remote value;
/// - enumerated targets are cleared when the remote key is absent or empty,
///   and validated exactly against the allow-list when present;
/// - free scalars are written only when present and non-empty, and left
///   untouched otherwise.
///
/// Enumerated fields clear on absence while free scalars do not: a stale
/// enumerated value or a schema default would otherwise survive the remote
/// source dropping the field, and read as valid state.
pub fn project(
    submission: &RemoteSubmission,
    mapping: &FieldMappingTable,
    schema: &dyn TargetSchema,
) -> Projection {
    let mut projection = Projection::default();

    for (remote_key, field) in mapping.iter() {
        let Some(def) = schema.field(field) else {
            continue;
        };
        if def.kind == FieldKind::Table {
            continue;
        }

        let value = submission.value(remote_key);

        if def.kind == FieldKind::Select {
            let value = match value {
                Some(v) if !is_empty_value(v) => v,
                _ => {
                    projection
                        .writes
                        .push((field.to_string(), FieldWrite::Clear));
                    continue;
                }
            };
            let candidate = value.as_str();
            let accepted = match candidate {
                Some(s) => def.options.is_empty() || def.options.iter().any(|o| o == s),
                None => false,
            };
            if accepted {
                projection
                    .writes
                    .push((field.to_string(), FieldWrite::Set(value.clone())));
            } else {
                let rejected = candidate
                    .map(str::to_string)
                    .unwrap_or_else(|| value.to_string());
                warn!(
                    uid = submission.uid(),
                    field,
                    value = rejected.as_str(),
                    "skipping select value outside the allowed set"
                );
                projection.warnings.push(SelectRejection {
                    field: field.to_string(),
                    rejected,
                    allowed: def.options.clone(),
                });
            }
            continue;
        }

        // Free scalar (including attachment-locator fields): write only a
        // meaningful value, never clear.
        if let Some(value) = value {
            if !is_empty_value(value) {
                projection
                    .writes
                    .push((field.to_string(), FieldWrite::Set(value.clone())));
            }
        }
    }

    projection
}
