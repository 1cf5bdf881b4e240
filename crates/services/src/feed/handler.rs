//! Hooks the feed calls into as events are admitted, re-timed and deleted,
//! and the [`FeedContext`] a hook may read and schedule deletions through.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use domains::{EventHeader, EventId, MemberTag, Timestamp};
use tokio::sync::broadcast;

use super::{EventRecord, FeedEvent};
use crate::timeline::Timeline;

/// Board-side reactions to feed changes.
///
/// Every hook has a no-op default. Hooks run inside the feed's admission
/// path and must not block on the network for long.
#[async_trait]
pub trait FeedHandler: Send + Sync {
    /// A new event header passed the gate and is about to enter the timeline.
    async fn on_event_header_sync(
        &mut self,
        _ctx: &mut FeedContext<'_>,
        _event_id: &str,
        _header: &EventHeader,
    ) {
    }

    async fn on_timeline_add(&mut self, _ctx: &mut FeedContext<'_>, _event_id: &str, _time: Timestamp) {}

    async fn on_timeline_remove(&mut self, _ctx: &mut FeedContext<'_>, _event_id: &str) {}

    /// The event record is gone and its id tombstoned.
    async fn on_event_deleted(&mut self, _ctx: &mut FeedContext<'_>, _event_id: &str) {}

    async fn on_sync_completed(&mut self, _ctx: &mut FeedContext<'_>) {}

    /// Unreferenced events are collected by `mark_events_for_deletion`.
    fn is_referenced(&self, _event_id: &str) -> bool {
        true
    }

    /// Seconds an unreferenced event survives before collection.
    fn grace_period(&self) -> u64 {
        0
    }
}

/// View of the feed handed to [`FeedHandler`] hooks.
pub struct FeedContext<'a> {
    pub(crate) events: &'a HashMap<EventId, EventRecord>,
    pub(crate) timeline: &'a Timeline,
    pub(crate) deletions: &'a mut VecDeque<EventId>,
    pub(crate) notify: &'a broadcast::Sender<FeedEvent>,
    pub(crate) member_tag: &'a MemberTag,
    pub(crate) now: Timestamp,
}

impl FeedContext<'_> {
    pub fn header(&self, event_id: &str) -> Option<&EventHeader> {
        self.events.get(event_id).map(|record| &record.header)
    }

    /// Consensus time of an event currently in the feed timeline.
    pub fn timeline_time(&self, event_id: &str) -> Option<Timestamp> {
        self.timeline.get_time(event_id)
    }

    pub fn in_timeline(&self, event_id: &str) -> bool {
        self.timeline.contains(event_id)
    }

    pub fn schedule_deletion(&mut self, event_id: &str) {
        self.deletions.push_back(event_id.to_string());
    }

    pub fn emit(&self, event: FeedEvent) {
        let _ = self.notify.send(event);
    }

    pub fn member_tag(&self) -> &str {
        self.member_tag
    }

    /// Clock reading taken when the current operation started.
    pub fn now(&self) -> Timestamp {
        self.now
    }
}
