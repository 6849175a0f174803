//! Page driver: orchestrates fetch -> project -> upsert -> attachments for
//! one page or the full set of pages.

use std::sync::Arc;

use anyhow::Result;
use formpull_core::{Cursor, RemoteSubmission, TargetSchema};
use formpull_store::{BlobStore, RecordStore};
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

use crate::attach::AttachmentResolver;
use crate::config::MappingConfig;
use crate::project::project;
use crate::source::FormSource;
use crate::upsert::UpsertEngine;

#[derive(Debug, Clone, Copy)]
pub struct PagePullRequest {
    pub page_size: u32,
    pub page_index: u32,
    pub with_attachments: bool,
    pub log_missing: bool,
}

impl Default for PagePullRequest {
    fn default() -> Self {
        Self {
            page_size: 10,
            page_index: 1,
            with_attachments: false,
            log_missing: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagePull {
    pub imported: usize,
    pub page_index: u32,
    /// Page number for the caller to schedule next; `None` when the remote
    /// service reported no further page.
    pub next_page_index: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FullPull {
    pub imported: usize,
}

pub struct PageDriver {
    source: Arc<dyn FormSource>,
    schema: Arc<dyn TargetSchema>,
    mapping: MappingConfig,
    upserts: UpsertEngine,
    attachments: AttachmentResolver,
}

impl PageDriver {
    pub fn new(
        source: Arc<dyn FormSource>,
        store: Arc<dyn RecordStore>,
        blobs: Arc<dyn BlobStore>,
        schema: Arc<dyn TargetSchema>,
        mapping: MappingConfig,
    ) -> Self {
        let upserts = UpsertEngine::new(
            store.clone(),
            schema.clone(),
            mapping.counter_field.clone(),
        );
        let attachments = AttachmentResolver::new(
            source.clone(),
            store,
            blobs,
            schema.clone(),
            mapping.attachments.clone(),
        );
        Self {
            source,
            schema,
            mapping,
            upserts,
            attachments,
        }
    }

    /// Imports one page as an independently retriable unit of work and
    /// decodes the next page number for external re-enqueue.
    pub async fn pull_page(&self, request: PagePullRequest) -> Result<PagePull> {
        let run_id = Uuid::new_v4();
        let span = info_span!("pull_page", %run_id, page_index = request.page_index);
        async {
            let page = self
                .source
                .fetch_page(request.page_size, request.page_index)
                .await?;

            let mut imported = 0usize;
            for submission in &page.results {
                self.process(submission, request.with_attachments, request.log_missing)
                    .await?;
                imported += 1;
            }

            Ok(PagePull {
                imported,
                page_index: request.page_index,
                next_page_index: next_page_index(page.next.as_ref(), request.page_index),
            })
        }
        .instrument(span)
        .await
    }

    /// Imports every page, following the opaque cursor until exhausted.
    pub async fn pull_all(&self, page_size: u32, with_attachments: bool) -> Result<FullPull> {
        let run_id = Uuid::new_v4();
        let span = info_span!("pull_all", %run_id, page_size);
        async {
            let mut imported = 0usize;
            let mut page = self.source.fetch_page(page_size, 1).await?;

            loop {
                for submission in &page.results {
                    self.process(submission, with_attachments, false).await?;
                    imported += 1;
                }
                match page.next {
                    Some(cursor) => page = self.source.fetch_cursor(&cursor).await?,
                    None => break,
                }
            }

            Ok(FullPull { imported })
        }
        .instrument(span)
        .await
    }

    async fn process(
        &self,
        submission: &RemoteSubmission,
        with_attachments: bool,
        log_missing: bool,
    ) -> Result<()> {
        if log_missing {
            for key in self.mapping.fields.remote_keys() {
                if !submission.contains_key(key) {
                    warn!(
                        uid = submission.uid(),
                        key, "mapped remote key missing from submission"
                    );
                }
            }
        }

        let projection = project(submission, &self.mapping.fields, self.schema.as_ref());
        let uid = self.upserts.upsert(submission, &projection).await?;

        if with_attachments {
            self.attachments.resolve_all(&uid, submission).await;
        }
        Ok(())
    }
}

/// Decodes the `page` query parameter out of the next-page cursor. A cursor
/// with an unparsable or missing page number falls back to the next index in
/// sequence; no cursor at all means the data is exhausted.
pub fn next_page_index(next: Option<&Cursor>, current_page: u32) -> Option<u32> {
    let cursor = next?;
    let query = cursor
        .as_str()
        .split_once('?')
        .map(|(_, query)| query)
        .unwrap_or("");
    for pair in query.split('&') {
        if let Some(raw) = pair.strip_prefix("page=") {
            if let Ok(page) = raw.parse::<u32>() {
                return Some(page);
            }
        }
    }
    Some(current_page + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use formpull_client::{ClientError, FetchedAttachment, SubmissionPage};
    use formpull_core::{AttachmentDescriptor, FieldDef};
    use formpull_store::{MemoryBlobStore, MemoryRecordStore, SchemaMap};
    use serde_json::json;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Mutex;

    #[derive(Clone)]
    enum FakeAttachment {
        Bytes { filename: String, bytes: Vec<u8> },
        Gone,
        Broken,
    }

    struct FakeSource {
        pages: Vec<SubmissionPage>,
        cursor_pages: HashMap<String, SubmissionPage>,
        attachments: HashMap<String, FakeAttachment>,
        followed_cursors: Mutex<Vec<String>>,
    }

    impl FakeSource {
        fn single_page(results: Vec<serde_json::Value>) -> Self {
            Self {
                pages: vec![page(results, None)],
                cursor_pages: HashMap::new(),
                attachments: HashMap::new(),
                followed_cursors: Mutex::new(Vec::new()),
            }
        }
    }

    fn page(results: Vec<serde_json::Value>, next: Option<&str>) -> SubmissionPage {
        SubmissionPage {
            results: results
                .into_iter()
                .filter_map(RemoteSubmission::from_value)
                .collect(),
            next: next.map(Cursor::new),
        }
    }

    #[async_trait]
    impl FormSource for FakeSource {
        async fn fetch_page(
            &self,
            _page_size: u32,
            page_index: u32,
        ) -> Result<SubmissionPage, ClientError> {
            Ok(self
                .pages
                .get((page_index as usize).saturating_sub(1))
                .cloned()
                .unwrap_or_else(|| page(vec![], None)))
        }

        async fn fetch_cursor(&self, cursor: &Cursor) -> Result<SubmissionPage, ClientError> {
            self.followed_cursors
                .lock()
                .unwrap()
                .push(cursor.as_str().to_string());
            Ok(self
                .cursor_pages
                .get(cursor.as_str())
                .cloned()
                .unwrap_or_else(|| page(vec![], None)))
        }

        async fn fetch_attachment(
            &self,
            descriptor: &AttachmentDescriptor,
        ) -> Result<Option<FetchedAttachment>, ClientError> {
            let Some(url) = descriptor.download_url.as_deref() else {
                return Ok(None);
            };
            match self.attachments.get(url) {
                Some(FakeAttachment::Bytes { filename, bytes }) => Ok(Some(FetchedAttachment {
                    filename: filename.clone(),
                    bytes: bytes.clone(),
                })),
                Some(FakeAttachment::Gone) | None => Ok(None),
                Some(FakeAttachment::Broken) => Err(ClientError::Status {
                    status: 500,
                    url: url.to_string(),
                    body: "boom".to_string(),
                }),
            }
        }
    }

    fn schema() -> Arc<SchemaMap> {
        Arc::new(SchemaMap::from_fields([
            ("award_category", FieldDef::select(["Health", "Education"])),
            ("full_name", FieldDef::scalar()),
            ("testimonial", FieldDef::attach()),
            ("votes", FieldDef::scalar()),
            ("votes_detail", FieldDef::table()),
        ]))
    }

    fn mapping() -> MappingConfig {
        MappingConfig {
            fields: formpull_core::FieldMappingTable::new(BTreeMap::from([
                (
                    "nomination_category/category".to_string(),
                    "award_category".to_string(),
                ),
                (
                    "group_nominee/nominee_full_name".to_string(),
                    "full_name".to_string(),
                ),
            ])),
            attachments: formpull_core::AttachmentMappingTable::new(BTreeMap::from([
                ("Attach_Testimonial".to_string(), "testimonial".to_string()),
                ("Attach_Table".to_string(), "votes_detail".to_string()),
            ])),
            counter_field: Some("votes".to_string()),
        }
    }

    struct Harness {
        store: Arc<MemoryRecordStore>,
        blobs: Arc<MemoryBlobStore>,
        driver: PageDriver,
    }

    fn harness(source: FakeSource) -> Harness {
        let store = Arc::new(MemoryRecordStore::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let driver = PageDriver::new(
            Arc::new(source),
            store.clone(),
            blobs.clone(),
            schema(),
            mapping(),
        );
        Harness {
            store,
            blobs,
            driver,
        }
    }

    fn submission_a() -> serde_json::Value {
        json!({
            "_uuid": "A",
            "_submission_time": "2026-03-01T10:00:00",
            "_xform_id_string": "awards_2026",
            "nomination_category/category": "Health",
            "group_nominee/nominee_full_name": "Jane Doe",
            "_attachments": [{
                "question_xpath": "docs/Attach_Testimonial",
                "filename": "testimonial.pdf",
                "download_url": "https://x/att/1",
            }],
        })
    }

    fn submission_b() -> serde_json::Value {
        json!({
            "_uuid": "B",
            "_submission_time": "2026-03-01T11:00:00",
            "_xform_id_string": "awards_2026",
            "group_nominee/nominee_full_name": "John Roe",
        })
    }

    #[tokio::test]
    async fn two_submission_page_imports_both_with_attachment_and_cleared_select() {
        let mut source = FakeSource::single_page(vec![submission_a(), submission_b()]);
        source.attachments.insert(
            "https://x/att/1".to_string(),
            FakeAttachment::Bytes {
                filename: "testimonial.pdf".to_string(),
                bytes: b"pdf bytes".to_vec(),
            },
        );
        let h = harness(source);

        let pull = h
            .driver
            .pull_page(PagePullRequest {
                with_attachments: true,
                log_missing: true,
                ..Default::default()
            })
            .await
            .expect("pull");

        assert_eq!(pull.imported, 2);
        assert_eq!(pull.page_index, 1);
        assert_eq!(pull.next_page_index, None);

        let a = h.store.load("A").await.unwrap().expect("record A");
        assert_eq!(a.get("award_category"), Some(&json!("Health")));
        assert_eq!(a.get("full_name"), Some(&json!("Jane Doe")));
        assert_eq!(a.get("votes"), Some(&json!(0)));
        let locator = a.get("testimonial").and_then(|v| v.as_str()).expect("locator");
        assert!(!locator.is_empty());
        assert_eq!(h.blobs.len().await, 1);

        let b = h.store.load("B").await.unwrap().expect("record B");
        assert!(b.is_field_empty("award_category"));
        assert_eq!(b.get("full_name"), Some(&json!("John Roe")));
    }

    #[tokio::test]
    async fn rerunning_a_page_is_idempotent() {
        let h = harness(FakeSource::single_page(vec![submission_a(), submission_b()]));

        let first = h.driver.pull_page(PagePullRequest::default()).await.expect("first");
        let fields_after_first = h.store.load("A").await.unwrap().expect("A").fields;

        let second = h.driver.pull_page(PagePullRequest::default()).await.expect("second");
        let fields_after_second = h.store.load("A").await.unwrap().expect("A").fields;

        assert_eq!(first.imported, 2);
        assert_eq!(second.imported, 2);
        assert_eq!(h.store.len().await, 2);
        assert_eq!(fields_after_first, fields_after_second);
    }

    #[tokio::test]
    async fn invalid_select_value_keeps_prior_value_and_projects_the_rest() {
        let store = Arc::new(MemoryRecordStore::new());
        let blobs = Arc::new(MemoryBlobStore::new());

        let first = PageDriver::new(
            Arc::new(FakeSource::single_page(vec![submission_a()])),
            store.clone(),
            blobs.clone(),
            schema(),
            mapping(),
        );
        first.pull_page(PagePullRequest::default()).await.expect("seed");

        let mut changed = submission_a();
        changed["nomination_category/category"] = json!("Wellbeing");
        changed["group_nominee/nominee_full_name"] = json!("Jane Q. Doe");
        let second = PageDriver::new(
            Arc::new(FakeSource::single_page(vec![changed])),
            store.clone(),
            blobs,
            schema(),
            mapping(),
        );
        second.pull_page(PagePullRequest::default()).await.expect("rerun");

        let a = store.load("A").await.unwrap().expect("A");
        assert_eq!(a.get("award_category"), Some(&json!("Health")));
        assert_eq!(a.get("full_name"), Some(&json!("Jane Q. Doe")));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn attachment_failures_are_contained_per_attachment() {
        let mut row = submission_a();
        row["_attachments"] = json!([
            {"question_xpath": "docs/Attach_Testimonial", "filename": "gone.pdf", "download_url": "https://x/att/gone"},
            {"question_xpath": "docs/Attach_Testimonial", "filename": "broken.pdf", "download_url": "https://x/att/broken"},
            {"question_xpath": "docs/Attach_Testimonial", "filename": "ok.pdf", "download_url": "https://x/att/ok"},
        ]);
        let mut source = FakeSource::single_page(vec![row]);
        source
            .attachments
            .insert("https://x/att/gone".to_string(), FakeAttachment::Gone);
        source
            .attachments
            .insert("https://x/att/broken".to_string(), FakeAttachment::Broken);
        source.attachments.insert(
            "https://x/att/ok".to_string(),
            FakeAttachment::Bytes {
                filename: "ok.pdf".to_string(),
                bytes: b"ok".to_vec(),
            },
        );
        let h = harness(source);

        let pull = h
            .driver
            .pull_page(PagePullRequest {
                with_attachments: true,
                ..Default::default()
            })
            .await
            .expect("pull must not abort");

        assert_eq!(pull.imported, 1);
        assert_eq!(h.blobs.len().await, 1);
        let a = h.store.load("A").await.unwrap().expect("A");
        assert!(a.get("testimonial").is_some());
    }

    #[tokio::test]
    async fn table_mapped_attachments_are_discarded() {
        let mut row = submission_b();
        row["_attachments"] = json!([
            {"question_xpath": "docs/Attach_Table", "filename": "x.csv", "download_url": "https://x/att/t"},
            {"question_xpath": "docs/Unmapped_Question", "filename": "y.csv", "download_url": "https://x/att/u"},
        ]);
        let mut source = FakeSource::single_page(vec![row]);
        source.attachments.insert(
            "https://x/att/t".to_string(),
            FakeAttachment::Bytes {
                filename: "x.csv".to_string(),
                bytes: b"csv".to_vec(),
            },
        );
        let h = harness(source);

        h.driver
            .pull_page(PagePullRequest {
                with_attachments: true,
                ..Default::default()
            })
            .await
            .expect("pull");

        assert_eq!(h.blobs.len().await, 0);
        let b = h.store.load("B").await.unwrap().expect("B");
        assert!(b.get("votes_detail").is_none());
    }

    #[tokio::test]
    async fn pull_all_follows_the_opaque_cursor_verbatim() {
        let cursor_url = "https://x/api/v2/assets/a1/data/?format=json&page_size=2&page=2&sort=%7B%22_id%22%3A1%7D";
        let mut source = FakeSource {
            pages: vec![page(vec![submission_a(), submission_b()], Some(cursor_url))],
            cursor_pages: HashMap::new(),
            attachments: HashMap::new(),
            followed_cursors: Mutex::new(Vec::new()),
        };
        source.cursor_pages.insert(
            cursor_url.to_string(),
            page(vec![json!({"_uuid": "C"})], None),
        );
        let source = Arc::new(source);
        let store = Arc::new(MemoryRecordStore::new());
        let driver = PageDriver::new(
            source.clone(),
            store.clone(),
            Arc::new(MemoryBlobStore::new()),
            schema(),
            mapping(),
        );

        let pull = driver.pull_all(2, false).await.expect("pull_all");

        assert_eq!(pull.imported, 3);
        assert_eq!(store.len().await, 3);
        // The service-controlled query parameters survive untouched.
        assert_eq!(
            *source.followed_cursors.lock().unwrap(),
            vec![cursor_url.to_string()]
        );
    }

    #[tokio::test]
    async fn single_page_pull_decodes_next_page_number() {
        let source = FakeSource {
            pages: vec![
                page(vec![], None),
                page(vec![], None),
                page(
                    vec![submission_a()],
                    Some("https://x/data/?format=json&page_size=1&page=4"),
                ),
            ],
            cursor_pages: HashMap::new(),
            attachments: HashMap::new(),
            followed_cursors: Mutex::new(Vec::new()),
        };
        let h = harness(source);

        let pull = h
            .driver
            .pull_page(PagePullRequest {
                page_size: 1,
                page_index: 3,
                ..Default::default()
            })
            .await
            .expect("pull");

        assert_eq!(pull.next_page_index, Some(4));
    }

    #[test]
    fn next_page_index_decoding() {
        let current = 3;
        assert_eq!(next_page_index(None, current), None);

        let cursor = Cursor::new("https://x/data/?page_size=10&page=7");
        assert_eq!(next_page_index(Some(&cursor), current), Some(7));

        // page_size must not be mistaken for page.
        let cursor = Cursor::new("https://x/data/?page_size=10");
        assert_eq!(next_page_index(Some(&cursor), current), Some(4));

        let cursor = Cursor::new("https://x/data/?page=not-a-number");
        assert_eq!(next_page_index(Some(&cursor), current), Some(4));

        let cursor = Cursor::new("https://x/data/");
        assert_eq!(next_page_index(Some(&cursor), current), Some(4));
    }
}
