//! # Board node
//!
//! One member's view of a board: its feed, the board built on it, and the
//! content manager both share. All feed mutation goes through one async
//! mutex, so admissions are applied one at a time.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use domains::{
    Clock, ContentHash, ContentStore, EventId, LogId, LogStore, MemberTag, Post, ProofSystem, Result as DomainResult,
    VerificationResult, TYPE_POST, TYPE_THREAD,
};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::board::{BoardConfig, BulletinBoard, CatalogPage, PostView};
use crate::content::{ContentLimits, ContentManager};
use crate::feed::{EventFeed, FeedConfig, FeedError, FeedEvent, NewEventOutcome};

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub feed: FeedConfig,
    pub board: BoardConfig,
    pub content: ContentLimits,
}

/// Port implementations a node runs on.
#[derive(Clone)]
pub struct NodePorts {
    pub logs: Arc<dyn LogStore>,
    pub content: Arc<dyn ContentStore>,
    pub prover: Arc<dyn ProofSystem>,
    pub clock: Arc<dyn Clock>,
}

/// A file attached to a new post.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub filename: String,
    pub data: Bytes,
}

#[derive(Clone)]
pub struct BoardNode {
    feed: Arc<Mutex<EventFeed<BulletinBoard>>>,
    content: Arc<ContentManager>,
    notify: broadcast::Sender<FeedEvent>,
    clock: Arc<dyn Clock>,
    member_tag: MemberTag,
    log_ids: Vec<LogId>,
}

impl BoardNode {
    pub async fn new(config: NodeConfig, ports: NodePorts) -> Result<Self, FeedError> {
        let content = Arc::new(ContentManager::new(ports.content, config.content));
        let board = BulletinBoard::new(config.board, Arc::clone(&content));
        let feed = EventFeed::new(
            config.feed,
            board,
            ports.logs,
            ports.prover,
            Arc::clone(&ports.clock),
        )
        .await?;
        Ok(Self {
            notify: feed.notifier(),
            member_tag: feed.member_tag().to_string(),
            log_ids: feed.log_ids(),
            feed: Arc::new(Mutex::new(feed)),
            content,
            clock: ports.clock,
        })
    }

    pub fn member_tag(&self) -> &str {
        &self.member_tag
    }

    pub fn log_ids(&self) -> &[LogId] {
        &self.log_ids
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FeedEvent> {
        self.notify.subscribe()
    }

    pub fn feed(&self) -> &Arc<Mutex<EventFeed<BulletinBoard>>> {
        &self.feed
    }

    pub fn content(&self) -> &Arc<ContentManager> {
        &self.content
    }

    /// Starts a thread. `post.resto` must be empty.
    pub async fn new_thread(
        &self,
        post: Post,
        attachment: Option<Attachment>,
    ) -> Result<NewEventOutcome, FeedError> {
        if post.resto().is_some() {
            debug!("thread with a parent refused");
            return Ok(invalid());
        }
        self.publish(TYPE_THREAD, post, attachment).await
    }

    /// Replies to the thread named by `post.resto`.
    pub async fn new_post(
        &self,
        post: Post,
        attachment: Option<Attachment>,
    ) -> Result<NewEventOutcome, FeedError> {
        if post.resto().is_none() {
            debug!("reply without a thread refused");
            return Ok(invalid());
        }
        self.publish(TYPE_POST, post, attachment).await
    }

    async fn publish(
        &self,
        event_type: &str,
        mut post: Post,
        attachment: Option<Attachment>,
    ) -> Result<NewEventOutcome, FeedError> {
        if post.time == 0.0 {
            post.time = self.clock.now() as f64;
        }
        let mut stored = Vec::new();
        let outcome = self
            .announce(event_type, &mut post, attachment, &mut stored)
            .await;
        let admitted = matches!(&outcome, Ok(o) if o.result == VerificationResult::Valid);
        if !admitted {
            if let Err(err) = self.content.discard(&stored).await {
                warn!(error = %err, "failed to discard unpublished content");
            }
        }
        let outcome = outcome?;
        info!(%event_type, result = %outcome.result, event_id = ?outcome.event_id, "post published");
        Ok(outcome)
    }

    /// Stores the post and its attachment, recording each hash in `stored`,
    /// then publishes the event.
    async fn announce(
        &self,
        event_type: &str,
        post: &mut Post,
        attachment: Option<Attachment>,
        stored: &mut Vec<ContentHash>,
    ) -> Result<NewEventOutcome, FeedError> {
        if let Some(attachment) = attachment {
            self.attach(post, attachment).await?;
            stored.push(post.tim.clone());
        }
        let hash = self.content.add_post(post).await?;
        stored.push(hash.clone());
        self.feed.lock().await.new_event(event_type, &hash).await
    }

    async fn attach(&self, post: &mut Post, attachment: Attachment) -> DomainResult<()> {
        let size = attachment.data.len();
        let hash = self.content.save_attachment(attachment.data).await?;
        let path = Path::new(&attachment.filename);
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_string();
        post.filename = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        if !ext.is_empty() {
            post.ext = format!(".{ext}");
        }
        if post.mime.is_empty() {
            if let Some(mime) = mime_guess::from_ext(&ext).first() {
                post.mime = mime.to_string();
            }
        }
        post.fsize = size as f64;
        post.sha256 = hash.clone();
        post.tim = hash;
        Ok(())
    }

    pub async fn get_attachment(&self, hash: &str) -> DomainResult<Option<Bytes>> {
        self.content.get_attachment(hash).await
    }

    pub async fn get_post_by_id(&self, event_id: &str) -> Option<PostView> {
        self.feed.lock().await.handler().get_post_by_id(event_id)
    }

    pub async fn get_thread_content(&self, thread_id: &str) -> Option<Vec<PostView>> {
        self.feed.lock().await.handler().get_thread_content(thread_id)
    }

    pub async fn get_catalog(&self) -> Vec<CatalogPage> {
        self.feed.lock().await.handler().get_catalog()
    }

    pub async fn get_thread_length(&self, thread_id: &str) -> Option<usize> {
        self.feed.lock().await.handler().get_thread_length(thread_id)
    }

    pub async fn get_thread_id(&self, event_id: &str) -> Option<EventId> {
        self.feed
            .lock()
            .await
            .handler()
            .get_thread_id(event_id)
            .map(str::to_string)
    }

    pub async fn add_peer(&self, peer: &str, log_ids: &[LogId]) -> Result<(), FeedError> {
        self.feed.lock().await.add_peer(peer, log_ids).await
    }

    pub async fn remove_peer(&self, peer: &str) -> bool {
        self.feed.lock().await.remove_peer(peer)
    }

    pub async fn sync_all(&self) -> usize {
        self.feed.lock().await.sync_all().await
    }

    /// One maintenance round: sync every peer, then collect garbage.
    pub async fn maintain(&self) -> (usize, usize) {
        let mut feed = self.feed.lock().await;
        let admitted = feed.sync_all().await;
        let collected = feed.mark_events_for_deletion().await;
        debug!(admitted, collected, "maintenance round");
        (admitted, collected)
    }

    /// Runs [`maintain`](Self::maintain) every `interval` until `shutdown`
    /// flips to true or its sender is dropped.
    pub async fn run_maintenance(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_ms = interval.as_millis() as u64, "maintenance loop started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.maintain().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("maintenance loop stopped");
    }
}

fn invalid() -> NewEventOutcome {
    NewEventOutcome {
        result: VerificationResult::Invalid,
        event_id: None,
        exists: false,
    }
}
