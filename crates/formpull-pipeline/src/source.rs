//! Seam between the page driver and the remote form service.

use async_trait::async_trait;
use formpull_client::{ClientError, FetchedAttachment, FormClient, SubmissionPage};
use formpull_core::{AttachmentDescriptor, Cursor};

/// Paginated read access to the remote form service. The production
/// implementation is [`FormClient`]; tests supply canned pages.
#[async_trait]
pub trait FormSource: Send + Sync {
    async fn fetch_page(
        &self,
        page_size: u32,
        page_index: u32,
    ) -> Result<SubmissionPage, ClientError>;

    async fn fetch_cursor(&self, cursor: &Cursor) -> Result<SubmissionPage, ClientError>;

    /// `Ok(None)` means the attachment is no longer available and should be
    /// skipped without a warning.
    async fn fetch_attachment(
        &self,
        descriptor: &AttachmentDescriptor,
    ) -> Result<Option<FetchedAttachment>, ClientError>;
}

#[async_trait]
impl FormSource for FormClient {
    async fn fetch_page(
        &self,
        page_size: u32,
        page_index: u32,
    ) -> Result<SubmissionPage, ClientError> {
        FormClient::fetch_page(self, page_size, page_index).await
    }

    async fn fetch_cursor(&self, cursor: &Cursor) -> Result<SubmissionPage, ClientError> {
        FormClient::fetch_cursor(self, cursor).await
    }

    async fn fetch_attachment(
        &self,
        descriptor: &AttachmentDescriptor,
    ) -> Result<Option<FetchedAttachment>, ClientError> {
        FormClient::fetch_attachment(self, descriptor).await
    }
}
