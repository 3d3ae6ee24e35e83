//! The concrete [`PolicyDocSource`] the offline compiler's published
//! artifacts are read back through (§4.R, §4.Q), backed by whatever
//! [`BlobStore`] the daemon was built with.

use async_trait::async_trait;
use refund_adjudicator::{PolicyDocError, PolicyDocSource};
use refund_blob_store::{policy_paths, BlobStore, BlobStoreError};
use refund_core::graph::PageIndexEntry;

pub struct BlobPolicyDocSource<'a> {
    blob: &'a dyn BlobStore,
}

impl<'a> BlobPolicyDocSource<'a> {
    pub fn new(blob: &'a dyn BlobStore) -> Self {
        BlobPolicyDocSource { blob }
    }
}

fn into_policy_doc_error(err: BlobStoreError) -> PolicyDocError {
    match err {
        BlobStoreError::NotFound(path) => PolicyDocError::NotFound(path),
        BlobStoreError::Unavailable(msg) => PolicyDocError::Unavailable(msg),
    }
}

#[async_trait]
impl<'a> PolicyDocSource for BlobPolicyDocSource<'a> {
    /// The page index's line offsets span one combined document rather
    /// than per-file text (see `refund_blob_store::policy_paths`), so
    /// every filename resolves to the same blob.
    async fn load_markdown(&self, _filename: &str) -> Result<String, PolicyDocError> {
        let bytes = self.blob.get(policy_paths::COMBINED_MARKDOWN).await.map_err(into_policy_doc_error)?;
        String::from_utf8(bytes).map_err(|e| PolicyDocError::Unavailable(format!("combined markdown not utf-8: {e}")))
    }

    async fn load_page_index(&self) -> Result<Vec<PageIndexEntry>, PolicyDocError> {
        let bytes = self.blob.get(policy_paths::PAGE_INDEX).await.map_err(into_policy_doc_error)?;
        serde_json::from_slice(&bytes).map_err(|e| PolicyDocError::Unavailable(format!("page index decode: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use refund_blob_store::fake::InMemoryBlobStore;

    #[tokio::test]
    async fn loads_markdown_and_index_published_by_the_compiler() {
        let store = InMemoryBlobStore::default();
        store.put(policy_paths::COMBINED_MARKDOWN, b"# hello".to_vec()).await.unwrap();
        let index = vec![PageIndexEntry { filename: "f.pdf".into(), page: 1, start_line: 0, end_line: 1 }];
        store.put(policy_paths::PAGE_INDEX, serde_json::to_vec(&index).unwrap()).await.unwrap();

        let source = BlobPolicyDocSource::new(&store);
        assert_eq!(source.load_markdown("f.pdf").await.unwrap(), "# hello");
        assert_eq!(source.load_page_index().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_markdown_surfaces_not_found() {
        let store = InMemoryBlobStore::default();
        let source = BlobPolicyDocSource::new(&store);
        let err = source.load_markdown("anything").await.unwrap_err();
        assert!(matches!(err, PolicyDocError::NotFound(_)));
    }
}
