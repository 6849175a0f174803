//! Upsert engine: create-if-absent, update-if-present, keyed by external UID.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use formpull_core::{FieldKind, RemoteSubmission, TargetRecord, TargetSchema};
use formpull_store::RecordStore;
use serde_json::{json, Value as JsonValue};
use tokio::sync::Mutex;

use crate::project::{FieldWrite, Projection};

/// Audit field holding the full serialized remote submission.
pub const RAW_PAYLOAD_FIELD: &str = "submission_data";
pub const SUBMITTED_AT_FIELD: &str = "date_submitted";
pub const FORM_ID_FIELD: &str = "form_id";

pub struct UpsertEngine {
    store: Arc<dyn RecordStore>,
    schema: Arc<dyn TargetSchema>,
    counter_field: Option<String>,
    uid_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl UpsertEngine {
    pub fn new(
        store: Arc<dyn RecordStore>,
        schema: Arc<dyn TargetSchema>,
        counter_field: Option<String>,
    ) -> Self {
        Self {
            store,
            schema,
            counter_field,
            uid_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn uid_lock(&self, uid: &str) -> Arc<Mutex<()>> {
        let mut locks = self.uid_locks.lock().await;
        locks
            .entry(uid.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// One logical commit per submission: metadata fields and the raw payload
    /// are always rewritten, projected writes applied, and the whole record
    /// committed atomically. Concurrent upserts for one UID are serialized so
    /// they converge on a single record.
    pub async fn upsert(
        &self,
        submission: &RemoteSubmission,
        projection: &Projection,
    ) -> anyhow::Result<String> {
        let uid = submission.uid().to_string();
        let lock = self.uid_lock(&uid).await;
        let _guard = lock.lock().await;

        let now = Utc::now();
        let (mut record, created) = match self.store.load(&uid).await? {
            Some(record) => (record, false),
            None => (TargetRecord::new(&uid, now), true),
        };

        record.set(
            SUBMITTED_AT_FIELD,
            submission
                .submission_time()
                .map(|t| json!(t))
                .unwrap_or(JsonValue::Null),
        );
        record.set(
            FORM_ID_FIELD,
            submission
                .form_id()
                .map(|f| json!(f))
                .unwrap_or(JsonValue::Null),
        );
        record.set(RAW_PAYLOAD_FIELD, json!(submission.raw_json()));

        for (field, write) in &projection.writes {
            match write {
                FieldWrite::Set(value) => record.set(field.clone(), value.clone()),
                FieldWrite::Clear => record.clear(field.clone()),
            }
        }

        if created {
            self.apply_counter_default(&mut record);
        }

        record.modified_at = now;
        self.store.commit(&record).await?;
        Ok(uid)
    }

    /// Counter defaults to zero on first creation only, and only when the
    /// field is not table-typed and not already populated. An existing
    /// non-empty counter is never overwritten.
    fn apply_counter_default(&self, record: &mut TargetRecord) {
        let Some(counter) = self.counter_field.as_deref() else {
            return;
        };
        if self.schema.field_kind(counter) == Some(FieldKind::Table) {
            return;
        }
        if record.is_field_empty(counter) {
            record.set(counter, json!(0));
        }
    }
}
