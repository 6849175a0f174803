//! Sync pipeline: projection, upsert, attachment resolution, page driving.

pub mod attach;
pub mod config;
pub mod driver;
pub mod project;
pub mod source;
pub mod upsert;

pub const CRATE_NAME: &str = "formpull-pipeline";

pub use attach::AttachmentResolver;
pub use config::{MappingConfig, SyncConfig};
pub use driver::{next_page_index, FullPull, PageDriver, PagePull, PagePullRequest};
pub use project::{project, FieldWrite, Projection, SelectRejection};
pub use source::FormSource;
pub use upsert::{UpsertEngine, FORM_ID_FIELD, RAW_PAYLOAD_FIELD, SUBMITTED_AT_FIELD};
