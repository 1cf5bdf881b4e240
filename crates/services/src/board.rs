//! # Bulletin board
//!
//! Turns feed events into threads. A THREAD event opens a thread keyed by
//! its event id. A POST event joins the thread its `resto` names. Threads
//! are ordered by their most recent post in `last_modified`. When there
//! are more than `max_threads`, the least recently bumped one is deleted
//! together with every event in it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use domains::{EventHeader, EventId, Post, Timestamp, TYPE_POST, TYPE_THREAD};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::content::ContentManager;
use crate::feed::{FeedContext, FeedEvent, FeedHandler};
use crate::timeline::Timeline;

pub const DEFAULT_MAX_THREADS: usize = 256;
pub const DEFAULT_ORPHAN_GRACE_SECS: u64 = 600;
pub const THREADS_PER_PAGE: usize = 16;
pub const MAX_CATALOG_PAGES: usize = 17;
pub const CATALOG_LAST_REPLIES: usize = 3;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BoardError {
    #[error("thread {0} is not on the board")]
    MissingThread(EventId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoardConfig {
    pub max_threads: usize,
    /// How long a thread may wait for its OP before it is dropped
    pub orphan_grace_secs: u64,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            max_threads: DEFAULT_MAX_THREADS,
            orphan_grace_secs: DEFAULT_ORPHAN_GRACE_SECS,
        }
    }
}

/// A post as served to readers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PostView {
    pub id: EventId,
    /// Short display number
    pub no: String,
    #[serde(flatten)]
    pub post: Post,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replies: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_replies: Option<Vec<PostView>>,
}

impl PostView {
    fn new(id: &str, post: &Post) -> Self {
        Self {
            id: id.to_string(),
            no: id.chars().take(16).collect(),
            post: post.clone(),
            replies: None,
            images: None,
            last_modified: None,
            last_replies: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogPage {
    pub page: usize,
    pub threads: Vec<PostView>,
}

pub struct BulletinBoard {
    config: BoardConfig,
    content: Arc<ContentManager>,
    /// thread id -> its posts by claimed time, OP included once known
    threads: HashMap<EventId, Timeline>,
    last_modified: Timeline,
    post_to_thread: HashMap<EventId, EventId>,
    posts: HashMap<EventId, Post>,
    /// Admitted events whose payload has not been verified yet
    missing_payload: HashSet<EventId>,
}

impl BulletinBoard {
    pub fn new(config: BoardConfig, content: Arc<ContentManager>) -> Self {
        Self {
            config,
            content,
            threads: HashMap::new(),
            last_modified: Timeline::new(),
            post_to_thread: HashMap::new(),
            posts: HashMap::new(),
            missing_payload: HashSet::new(),
        }
    }

    pub fn config(&self) -> BoardConfig {
        self.config
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    pub fn is_missing_payload(&self, event_id: &str) -> bool {
        self.missing_payload.contains(event_id)
    }

    /// Fetches and verifies the payload of `event_id`, caching the post.
    async fn fetch_payload(&mut self, ctx: &mut FeedContext<'_>, event_id: &str, header: &EventHeader) {
        let mut receipt = self
            .content
            .post_received(event_id, &header.payload_hash)
            .await;
        ctx.emit(FeedEvent::SyncPayloadResult {
            event_id: event_id.to_string(),
            result: receipt.post,
        });
        if receipt.is_ok() {
            if let Some(post) = receipt.content.take() {
                self.missing_payload.remove(event_id);
                self.posts.insert(event_id.to_string(), post);
                return;
            }
        }
        if receipt.is_retryable() {
            debug!(%event_id, "payload not available yet");
            self.missing_payload.insert(event_id.to_string());
        } else {
            warn!(
                %event_id,
                post = ?receipt.post,
                attachment = ?receipt.attachment,
                "rejecting event with bad payload"
            );
            self.missing_payload.remove(event_id);
            ctx.emit(FeedEvent::TimelineRejectedEvent {
                event_id: event_id.to_string(),
            });
            ctx.schedule_deletion(event_id);
        }
    }

    /// Places a verified event on the board.
    fn index_event(&mut self, ctx: &mut FeedContext<'_>, event_id: &str) {
        let Some(header) = ctx.header(event_id) else {
            return;
        };
        let (event_type, claimed) = (header.event_type.clone(), header.claimed);
        let Some(post) = self.posts.get(event_id) else {
            return;
        };

        let thread_id = match event_type.as_str() {
            TYPE_THREAD => event_id.to_string(),
            TYPE_POST => {
                let Some(resto) = post.resto().map(str::to_string) else {
                    debug!(%event_id, "reply without a thread");
                    self.reject(ctx, event_id);
                    return;
                };
                if !self.threads.contains_key(&resto) {
                    let op_admitted = ctx.in_timeline(&resto)
                        && ctx
                            .header(&resto)
                            .is_some_and(|h| h.event_type == TYPE_THREAD);
                    if !op_admitted {
                        debug!(%event_id, thread = %resto, "reply to unknown thread dropped");
                        self.reject(ctx, event_id);
                        return;
                    }
                    // OP admitted but its payload is still pending
                    self.threads.insert(resto.clone(), Timeline::new());
                }
                resto
            }
            other => {
                debug!(%event_id, event_type = %other, "ignoring event type");
                return;
            }
        };

        self.threads
            .entry(thread_id.clone())
            .or_default()
            .set_time(event_id, claimed);
        self.post_to_thread
            .insert(event_id.to_string(), thread_id.clone());
        if let Err(err) = self.update_thread_bump(ctx, &thread_id) {
            error!(error = %err, "bump on a thread that is not indexed");
        }
    }

    fn reject(&mut self, ctx: &mut FeedContext<'_>, event_id: &str) {
        ctx.emit(FeedEvent::TimelineRejectedEvent {
            event_id: event_id.to_string(),
        });
        ctx.schedule_deletion(event_id);
    }

    /// Moves `thread_id` in the freshness index, then enforces the orphan
    /// window and the thread cap.
    pub fn update_thread_bump(
        &mut self,
        ctx: &mut FeedContext<'_>,
        thread_id: &str,
    ) -> Result<(), BoardError> {
        let latest = self
            .threads
            .get(thread_id)
            .ok_or_else(|| BoardError::MissingThread(thread_id.to_string()))?
            .get_most_recent()
            .map(|(time, _)| time);
        match latest {
            Some(time) => self.last_modified.set_time(thread_id, time),
            None => self.remove_thread(ctx, thread_id),
        }
        self.sweep_orphans(ctx);
        self.bump_off(ctx);
        Ok(())
    }

    /// Removes threads still missing their OP after the grace window, and
    /// threads left empty.
    pub fn sweep_orphans(&mut self, ctx: &mut FeedContext<'_>) {
        let now = ctx.now();
        let grace = self.config.orphan_grace_secs;
        let orphans: Vec<EventId> = self
            .threads
            .iter()
            .filter(|(id, timeline)| match timeline.get_least_recent() {
                None => true,
                Some((oldest, _)) => {
                    !timeline.contains(id) && now.saturating_sub(oldest) > grace
                }
            })
            .map(|(id, _)| id.clone())
            .collect();
        for thread_id in orphans {
            info!(thread = %thread_id, "dropping orphan thread");
            self.remove_thread(ctx, &thread_id);
        }
    }

    /// Evicts least recently bumped threads until the cap holds.
    pub fn bump_off(&mut self, ctx: &mut FeedContext<'_>) {
        while self.last_modified.get_size() > self.config.max_threads {
            let Some(thread_id) = self
                .last_modified
                .get_least_recent()
                .map(|(_, id)| id.to_string())
            else {
                break;
            };
            info!(thread = %thread_id, "thread bumped off the board");
            self.remove_thread(ctx, &thread_id);
        }
    }

    /// Deletes a thread and schedules deletion of all of its events.
    pub fn remove_thread(&mut self, ctx: &mut FeedContext<'_>, thread_id: &str) {
        self.last_modified.unset_time(thread_id);
        let Some(timeline) = self.threads.remove(thread_id) else {
            return;
        };
        for (_, event_id) in timeline.get_events() {
            self.post_to_thread.remove(event_id);
            ctx.schedule_deletion(event_id);
        }
        ctx.schedule_deletion(thread_id);
    }

    /// Takes one event off its thread.
    fn remove_event(&mut self, ctx: &mut FeedContext<'_>, event_id: &str) {
        self.missing_payload.remove(event_id);
        let Some(thread_id) = self.post_to_thread.remove(event_id) else {
            return;
        };
        if thread_id == event_id {
            self.remove_thread(ctx, &thread_id);
            return;
        }
        let Some(thread) = self.threads.get_mut(&thread_id) else {
            return;
        };
        thread.unset_time(event_id);
        match thread.get_most_recent().map(|(time, _)| time) {
            Some(time) => self.last_modified.set_time(&thread_id, time),
            None => self.remove_thread(ctx, &thread_id),
        }
    }

    fn thread_posts(&self, thread_id: &str) -> Option<&Timeline> {
        self.threads.get(thread_id)
    }

    pub fn get_post_by_id(&self, event_id: &str) -> Option<PostView> {
        self.posts
            .get(event_id)
            .map(|post| PostView::new(event_id, post))
    }

    /// Replies (excluding the OP) and images (including the OP's).
    fn counts(&self, thread_id: &str, thread: &Timeline) -> (usize, usize) {
        thread
            .get_events()
            .fold((0, 0), |(replies, images), (_, id)| {
                let has_image = self
                    .posts
                    .get(id)
                    .is_some_and(|p| p.attachment().is_some());
                let is_reply = id != thread_id;
                (replies + usize::from(is_reply), images + usize::from(has_image))
            })
    }

    /// OP first, then replies oldest first. `None` until the OP is known.
    pub fn get_thread_content(&self, thread_id: &str) -> Option<Vec<PostView>> {
        let thread = self.thread_posts(thread_id)?;
        let op = self.posts.get(thread_id).filter(|_| thread.contains(thread_id))?;
        let (replies, images) = self.counts(thread_id, thread);

        let mut head = PostView::new(thread_id, op);
        head.replies = Some(replies);
        head.images = Some(images);
        let mut content = vec![head];
        content.extend(
            thread
                .get_events()
                .filter(|(_, id)| *id != thread_id)
                .filter_map(|(_, id)| self.get_post_by_id(id)),
        );
        Some(content)
    }

    /// Pages of OPs, most recently bumped first.
    pub fn get_catalog(&self) -> Vec<CatalogPage> {
        let mut ops = self
            .last_modified
            .entries_reversed()
            .filter_map(|(time, thread_id)| self.catalog_entry(thread_id, time));

        let mut pages = Vec::new();
        for page in 1..=MAX_CATALOG_PAGES {
            let threads: Vec<PostView> = ops.by_ref().take(THREADS_PER_PAGE).collect();
            if threads.is_empty() {
                break;
            }
            pages.push(CatalogPage { page, threads });
        }
        pages
    }

    fn catalog_entry(&self, thread_id: &str, last_modified: Timestamp) -> Option<PostView> {
        let thread = self.thread_posts(thread_id)?;
        if !thread.contains(thread_id) {
            return None;
        }
        let op = self.posts.get(thread_id)?;
        let (replies, images) = self.counts(thread_id, thread);
        let mut last_replies: Vec<PostView> = thread
            .entries_reversed()
            .filter(|(_, id)| *id != thread_id)
            .take(CATALOG_LAST_REPLIES)
            .filter_map(|(_, id)| self.get_post_by_id(id))
            .collect();
        last_replies.reverse();

        let mut view = PostView::new(thread_id, op);
        view.replies = Some(replies);
        view.images = Some(images);
        view.last_modified = Some(last_modified);
        view.last_replies = Some(last_replies);
        Some(view)
    }

    /// Posts in the thread, OP included.
    pub fn get_thread_length(&self, thread_id: &str) -> Option<usize> {
        self.thread_posts(thread_id).map(Timeline::get_size)
    }

    pub fn get_thread_id(&self, event_id: &str) -> Option<&str> {
        self.post_to_thread.get(event_id).map(String::as_str)
    }

    /// Thread ids, most recently bumped first.
    pub fn threads_by_bump(&self) -> impl Iterator<Item = &str> {
        self.last_modified.entries_reversed().map(|(_, id)| id)
    }
}

#[async_trait]
impl FeedHandler for BulletinBoard {
    async fn on_event_header_sync(
        &mut self,
        ctx: &mut FeedContext<'_>,
        event_id: &str,
        header: &EventHeader,
    ) {
        self.fetch_payload(ctx, event_id, header).await;
    }

    async fn on_timeline_add(&mut self, ctx: &mut FeedContext<'_>, event_id: &str, _time: Timestamp) {
        if !self.posts.contains_key(event_id) {
            return;
        }
        self.index_event(ctx, event_id);
    }

    async fn on_timeline_remove(&mut self, ctx: &mut FeedContext<'_>, event_id: &str) {
        self.remove_event(ctx, event_id);
    }

    async fn on_event_deleted(&mut self, ctx: &mut FeedContext<'_>, event_id: &str) {
        self.remove_event(ctx, event_id);
        self.posts.remove(event_id);
        if let Err(err) = self.content.post_deleted(event_id).await {
            warn!(%event_id, error = %err, "content cleanup failed");
        }
    }

    async fn on_sync_completed(&mut self, ctx: &mut FeedContext<'_>) {
        let pending: Vec<EventId> = self.missing_payload.iter().cloned().collect();
        for event_id in pending {
            if !ctx.in_timeline(&event_id) {
                self.missing_payload.remove(&event_id);
                continue;
            }
            let Some(header) = ctx.header(&event_id).cloned() else {
                continue;
            };
            self.fetch_payload(ctx, &event_id, &header).await;
            if self.posts.contains_key(&event_id) {
                debug!(%event_id, "payload arrived");
                self.index_event(ctx, &event_id);
            }
        }
        self.sweep_orphans(ctx);
    }

    fn is_referenced(&self, event_id: &str) -> bool {
        self.post_to_thread.contains_key(event_id)
    }

    fn grace_period(&self) -> u64 {
        self.config.orphan_grace_secs
    }
}
