//! Attachment resolution: match remote file blobs to target fields, fetch
//! their bytes, and persist locators back onto the record.

use std::sync::Arc;

use formpull_core::{AttachmentMappingTable, FieldKind, RemoteSubmission, TargetSchema};
use formpull_store::{BlobStore, RecordStore};
use serde_json::json;
use tracing::{debug, warn};

use crate::source::FormSource;

pub struct AttachmentResolver {
    source: Arc<dyn FormSource>,
    store: Arc<dyn RecordStore>,
    blobs: Arc<dyn BlobStore>,
    schema: Arc<dyn TargetSchema>,
    mapping: AttachmentMappingTable,
}

impl AttachmentResolver {
    pub fn new(
        source: Arc<dyn FormSource>,
        store: Arc<dyn RecordStore>,
        blobs: Arc<dyn BlobStore>,
        schema: Arc<dyn TargetSchema>,
        mapping: AttachmentMappingTable,
    ) -> Self {
        Self {
            source,
            store,
            blobs,
            schema,
            mapping,
        }
    }

    /// Resolves every attachment on an already-upserted record. Failures are
    /// contained per attachment: a fetch or store error is logged and the
    /// remaining attachments still run. Returns the number of locators
    /// written. Locator writes bypass the modification timestamp so backfill
    /// does not read as a content edit.
    pub async fn resolve_all(&self, uid: &str, submission: &RemoteSubmission) -> usize {
        let mut stored = 0usize;

        for descriptor in submission.attachments() {
            let key = descriptor.lookup_key();
            if key.is_empty() {
                continue;
            }
            let Some(field) = self.mapping.resolve(key) else {
                continue;
            };
            let Some(def) = self.schema.field(field) else {
                continue;
            };
            if def.kind == FieldKind::Table {
                continue;
            }

            let fetched = match self.source.fetch_attachment(&descriptor).await {
                Ok(Some(fetched)) => fetched,
                Ok(None) => {
                    debug!(uid, field, key, "attachment no longer available; skipping");
                    continue;
                }
                Err(err) => {
                    warn!(uid, field, key, error = %err, "attachment fetch failed; skipping");
                    continue;
                }
            };

            let blob = match self
                .blobs
                .store_blob(uid, &fetched.filename, &fetched.bytes)
                .await
            {
                Ok(blob) => blob,
                Err(err) => {
                    warn!(uid, field, error = %err, "storing attachment bytes failed; skipping");
                    continue;
                }
            };

            match self
                .store
                .set_field_untracked(uid, field, json!(blob.locator))
                .await
            {
                Ok(()) => stored += 1,
                Err(err) => {
                    warn!(uid, field, error = %err, "writing attachment locator failed");
                }
            }
        }

        stored
    }
}
