//! # Content manager
//!
//! Stores and verifies post bodies and attachments in the content store,
//! and keeps content alive exactly as long as some admitted event refers
//! to it.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use domains::wire::{decode_post, encode_post};
use domains::{
    sha256_hex, AttachmentVerificationResult, ContentHash, ContentStore, DomainError, EventId,
    Post, PostVerificationResult, Result,
};
use tracing::{debug, warn};

pub const DEFAULT_MAX_POST_SIZE: usize = 8192;
pub const DEFAULT_MAX_ATTACHMENT_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentLimits {
    pub max_post_size: usize,
    pub max_attachment_size: usize,
}

impl Default for ContentLimits {
    fn default() -> Self {
        Self {
            max_post_size: DEFAULT_MAX_POST_SIZE,
            max_attachment_size: DEFAULT_MAX_ATTACHMENT_SIZE,
        }
    }
}

/// Outcome of fetching and checking the payload of one event.
#[derive(Debug, Clone, PartialEq)]
pub struct PostReceipt {
    pub post: PostVerificationResult,
    /// `None` when the post has no attachment or was rejected first
    pub attachment: Option<AttachmentVerificationResult>,
    pub content: Option<Post>,
}

impl PostReceipt {
    fn rejected(post: PostVerificationResult) -> Self {
        Self {
            post,
            attachment: None,
            content: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.post == PostVerificationResult::Ok
            && matches!(self.attachment, None | Some(AttachmentVerificationResult::Ok))
    }

    /// Missing content may show up later; anything else never will.
    pub fn is_retryable(&self) -> bool {
        self.post == PostVerificationResult::ContentUnavailable
            || self.attachment == Some(AttachmentVerificationResult::ContentUnavailable)
    }
}

pub struct ContentManager {
    store: Arc<dyn ContentStore>,
    limits: ContentLimits,
    /// content hash -> events referencing it
    refs: DashMap<ContentHash, HashSet<EventId>>,
    /// event -> content it references
    by_event: DashMap<EventId, Vec<ContentHash>>,
}

impl ContentManager {
    pub fn new(store: Arc<dyn ContentStore>, limits: ContentLimits) -> Self {
        Self {
            store,
            limits,
            refs: DashMap::new(),
            by_event: DashMap::new(),
        }
    }

    pub fn limits(&self) -> ContentLimits {
        self.limits
    }

    pub async fn add_post(&self, post: &Post) -> Result<ContentHash> {
        let bytes = encode_post(post);
        if bytes.len() > self.limits.max_post_size {
            return Err(DomainError::TooLarge {
                kind: "post",
                size: bytes.len(),
                limit: self.limits.max_post_size,
            });
        }
        self.store.put(bytes).await
    }

    pub async fn get_post(&self, hash: &str) -> Result<Option<Post>> {
        match self.store.get(hash).await? {
            Some(bytes) => Ok(Some(decode_post(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn save_attachment(&self, data: Bytes) -> Result<ContentHash> {
        if data.len() > self.limits.max_attachment_size {
            return Err(DomainError::TooLarge {
                kind: "attachment",
                size: data.len(),
                limit: self.limits.max_attachment_size,
            });
        }
        self.store.put(data).await
    }

    pub async fn get_attachment(&self, hash: &str) -> Result<Option<Bytes>> {
        self.store.get(hash).await
    }

    async fn fetch(&self, hash: &str) -> Option<Bytes> {
        match self.store.get(hash).await {
            Ok(found) => found,
            Err(err) => {
                warn!(%hash, error = %err, "content fetch failed");
                None
            }
        }
    }

    /// Fetches and checks the payload of `event_id`, pinning it on success.
    pub async fn post_received(&self, event_id: &str, hash: &str) -> PostReceipt {
        let Some(bytes) = self.fetch(hash).await else {
            return PostReceipt::rejected(PostVerificationResult::ContentUnavailable);
        };
        if bytes.len() > self.limits.max_post_size {
            return PostReceipt::rejected(PostVerificationResult::TooLarge);
        }
        if sha256_hex(&bytes) != hash {
            warn!(%event_id, %hash, "post does not match its address");
            return PostReceipt::rejected(PostVerificationResult::Invalid);
        }
        let post = match decode_post(&bytes) {
            Ok(post) => post,
            Err(err) => {
                debug!(%event_id, error = %err, "post failed to decode");
                return PostReceipt::rejected(PostVerificationResult::DeserializationError);
            }
        };

        let mut hashes = vec![hash.to_string()];
        let attachment = match post.attachment() {
            Some(tim) => {
                let result = self.check_attachment(tim).await;
                if result == AttachmentVerificationResult::Ok {
                    hashes.push(tim.to_string());
                }
                Some(result)
            }
            None => None,
        };
        let mut receipt = PostReceipt {
            post: PostVerificationResult::Ok,
            attachment,
            content: Some(post),
        };
        if !receipt.is_ok() {
            return receipt;
        }

        for hash in &hashes {
            if let Err(err) = self.store.pin(hash).await {
                warn!(%hash, error = %err, "pin failed");
                receipt.post = PostVerificationResult::ContentUnavailable;
                return receipt;
            }
        }
        for hash in &hashes {
            self.refs
                .entry(hash.clone())
                .or_default()
                .insert(event_id.to_string());
        }
        self.by_event.insert(event_id.to_string(), hashes);
        receipt
    }

    async fn check_attachment(&self, tim: &str) -> AttachmentVerificationResult {
        let Some(bytes) = self.fetch(tim).await else {
            return AttachmentVerificationResult::ContentUnavailable;
        };
        if bytes.len() > self.limits.max_attachment_size {
            return AttachmentVerificationResult::TooLarge;
        }
        if sha256_hex(&bytes) != tim {
            warn!(%tim, "attachment does not match its address");
            return AttachmentVerificationResult::Invalid;
        }
        AttachmentVerificationResult::Ok
    }

    /// Drops `event_id`'s references, deleting content nothing else uses.
    /// Returns the hashes that were deleted.
    pub async fn post_deleted(&self, event_id: &str) -> Result<Vec<ContentHash>> {
        let Some((_, hashes)) = self.by_event.remove(event_id) else {
            return Ok(Vec::new());
        };
        let mut unused = Vec::new();
        for hash in hashes {
            let now_empty = match self.refs.get_mut(&hash) {
                Some(mut events) => {
                    events.remove(event_id);
                    events.is_empty()
                }
                None => true,
            };
            if now_empty {
                self.refs.remove(&hash);
                unused.push(hash);
            }
        }
        for hash in &unused {
            self.store.unpin(hash).await?;
            self.store.delete(hash).await?;
            debug!(%hash, "content collected");
        }
        Ok(unused)
    }

    /// Deletes content stored for a publish that was never admitted.
    /// Hashes an event references, or that are pinned, are kept.
    pub async fn discard(&self, hashes: &[ContentHash]) -> Result<()> {
        for hash in hashes {
            if self.references(hash) > 0 || self.store.is_pinned(hash).await? {
                continue;
            }
            self.store.delete(hash).await?;
            debug!(%hash, "discarded unpublished content");
        }
        Ok(())
    }

    /// Number of events referencing `hash`.
    pub fn references(&self, hash: &str) -> usize {
        self.refs.get(hash).map_or(0, |events| events.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domains::MockContentStore;
    use storage_adapters::MemoryContentStore;

    fn manager(store: Arc<MemoryContentStore>) -> ContentManager {
        ContentManager::new(store, ContentLimits::default())
    }

    fn post(com: &str) -> Post {
        Post {
            time: 1.0,
            com: com.into(),
            ..Post::default()
        }
    }

    #[tokio::test]
    async fn test_post_roundtrip_through_store() {
        let content = manager(Arc::new(MemoryContentStore::new()));
        let hash = content.add_post(&post("hello")).await.unwrap();
        assert_eq!(content.get_post(&hash).await.unwrap(), Some(post("hello")));
        assert_eq!(content.get_post("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversize_is_refused() {
        let limits = ContentLimits {
            max_post_size: 16,
            max_attachment_size: 4,
        };
        let content = ContentManager::new(Arc::new(MemoryContentStore::new()), limits);
        let err = content.add_post(&post(&"x".repeat(64))).await.unwrap_err();
        assert!(matches!(err, DomainError::TooLarge { kind: "post", .. }));
        let err = content
            .save_attachment(Bytes::from_static(b"12345"))
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::TooLarge { kind: "attachment", .. }));
    }

    #[tokio::test]
    async fn test_received_post_is_pinned() {
        let store = Arc::new(MemoryContentStore::new());
        let content = manager(store.clone());
        let hash = content.add_post(&post("hi")).await.unwrap();
        let receipt = content.post_received("e1", &hash).await;
        assert!(receipt.is_ok());
        assert_eq!(receipt.content, Some(post("hi")));
        assert!(store.is_pinned(&hash).await.unwrap());
        assert_eq!(content.references(&hash), 1);
    }

    #[tokio::test]
    async fn test_missing_post_is_unavailable() {
        let content = manager(Arc::new(MemoryContentStore::new()));
        let receipt = content.post_received("e1", "abcd").await;
        assert_eq!(receipt.post, PostVerificationResult::ContentUnavailable);
        assert!(receipt.is_retryable());
    }

    #[tokio::test]
    async fn test_mismatched_hash_is_invalid() {
        let store = Arc::new(MemoryContentStore::new());
        let content = manager(store.clone());
        let bytes = encode_post(&post("real"));
        store.insert_unchecked("ab".repeat(32), bytes);
        let receipt = content.post_received("e1", &"ab".repeat(32)).await;
        assert_eq!(receipt.post, PostVerificationResult::Invalid);
        assert!(!receipt.is_retryable());
    }

    #[tokio::test]
    async fn test_tampered_post_fails_to_deserialize() {
        let store = Arc::new(MemoryContentStore::new());
        let content = manager(store.clone());
        let mut bytes = encode_post(&post("real")).to_vec();
        // Unknown field 99, varint 1
        bytes.extend_from_slice(&[0x98, 0x06, 0x01]);
        let hash = store.put(Bytes::from(bytes)).await.unwrap();
        let receipt = content.post_received("e1", &hash).await;
        assert_eq!(receipt.post, PostVerificationResult::DeserializationError);
    }

    #[tokio::test]
    async fn test_attachment_is_checked() {
        let store = Arc::new(MemoryContentStore::new());
        let content = manager(store.clone());
        let mut with_missing = post("a");
        with_missing.tim = "cd".repeat(32);
        let hash = content.add_post(&with_missing).await.unwrap();
        let receipt = content.post_received("e1", &hash).await;
        assert_eq!(
            receipt.attachment,
            Some(AttachmentVerificationResult::ContentUnavailable)
        );
        assert!(!receipt.is_ok());
        assert!(!store.is_pinned(&hash).await.unwrap());

        store.insert_unchecked("cd".repeat(32), Bytes::from_static(b"bogus"));
        let receipt = content.post_received("e1", &hash).await;
        assert_eq!(receipt.attachment, Some(AttachmentVerificationResult::Invalid));
    }

    #[tokio::test]
    async fn test_shared_attachment_survives_until_last_reference() {
        let store = Arc::new(MemoryContentStore::new());
        let content = manager(store.clone());
        let tim = content
            .save_attachment(Bytes::from_static(b"png bytes"))
            .await
            .unwrap();
        let mut first = post("one");
        first.tim = tim.clone();
        let mut second = post("two");
        second.tim = tim.clone();
        let h1 = content.add_post(&first).await.unwrap();
        let h2 = content.add_post(&second).await.unwrap();
        assert!(content.post_received("e1", &h1).await.is_ok());
        assert!(content.post_received("e2", &h2).await.is_ok());
        assert_eq!(content.references(&tim), 2);

        let freed = content.post_deleted("e1").await.unwrap();
        assert_eq!(freed, vec![h1.clone()]);
        assert!(store.contains(&tim));
        assert!(!store.contains(&h1));

        let freed = content.post_deleted("e2").await.unwrap();
        assert_eq!(freed.len(), 2);
        assert!(!store.contains(&tim));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_discard_keeps_referenced_content() {
        let store = Arc::new(MemoryContentStore::new());
        let content = manager(store.clone());
        let kept = content.add_post(&post("live")).await.unwrap();
        assert!(content.post_received("e1", &kept).await.is_ok());
        let dropped = content.add_post(&post("rejected")).await.unwrap();

        content.discard(&[kept.clone(), dropped.clone()]).await.unwrap();
        assert!(store.contains(&kept));
        assert!(!store.contains(&dropped));
    }

    #[tokio::test]
    async fn test_deleting_unknown_event_is_noop() {
        let mut store = MockContentStore::new();
        store.expect_delete().never();
        let content = ContentManager::new(Arc::new(store), ContentLimits::default());
        assert!(content.post_deleted("nothing").await.unwrap().is_empty());
    }
}
