//! # Event feed
//!
//! The replicated, proof-gated event log a board is built on.
//!
//! Each node appends [`FeedEntry`] records to its own log. A record says
//! "this node admitted this header at this time". Syncing reads the logs of
//! known peers, runs every unknown header through the [`RateLimitGate`] and
//! admits it, and folds every known header's attestation into the event's
//! consensus time.
//!
//! The board reacts to admissions and deletions through [`FeedHandler`].

mod consensus;
mod handler;

pub use consensus::calculate_consensus_time;
pub use handler::{FeedContext, FeedHandler};

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use domains::{
    Clock, DomainError, EventHeader, EventId, EventTypeRegistry, FeedEntry, LogId, LogStore,
    MemberTag, ProofSystem, ReplicatedLog, Timestamp, VerificationResult,
};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::rate_limit::{ClaimAge, RateLimitGate, DEFAULT_MAX_CLOCK_SKEW, DEFAULT_MAX_EVENT_AGE};
use crate::timeline::Timeline;

pub const DEFAULT_MAX_INVALID_PER_PEER: u32 = 16;
const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("unknown peer {0}")]
    UnknownPeer(MemberTag),

    /// The peer exceeded the invalid-entry budget and is no longer synced
    #[error("peer {0} is isolated after too many invalid entries")]
    PeerFailed(MemberTag),

    #[error(transparent)]
    Domain(#[from] DomainError),
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Namespace mixed into every epoch tag
    pub topic: String,
    pub group_id: String,
    pub registry: EventTypeRegistry,
    pub max_invalid_per_peer: u32,
    /// Seconds a claimed time may lag behind the local clock
    pub max_event_age: u64,
    pub max_clock_skew: u64,
}

impl FeedConfig {
    pub fn new(
        topic: impl Into<String>,
        group_id: impl Into<String>,
        registry: EventTypeRegistry,
    ) -> Self {
        Self {
            topic: topic.into(),
            group_id: group_id.into(),
            registry,
            max_invalid_per_peer: DEFAULT_MAX_INVALID_PER_PEER,
            max_event_age: DEFAULT_MAX_EVENT_AGE,
            max_clock_skew: DEFAULT_MAX_CLOCK_SKEW,
        }
    }
}

/// Notifications published on the feed's broadcast channel.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    PeerAdded {
        peer: MemberTag,
    },
    PeerRemoved {
        peer: MemberTag,
    },
    /// This node published an event
    PublishReceivedTime {
        event_id: EventId,
        time: Timestamp,
    },
    SyncEventStart {
        peer: MemberTag,
        log: LogId,
        from: u64,
        to: u64,
    },
    SyncFatalError {
        peer: MemberTag,
        invalid: u32,
    },
    SyncEventResult {
        peer: MemberTag,
        index: u64,
        result: VerificationResult,
    },
    SyncPayloadResult {
        event_id: EventId,
        result: domains::PostVerificationResult,
    },
    SyncDuplicateEvent {
        peer: MemberTag,
        index: u64,
    },
    /// An unknown event claimed a time past the admission horizon
    SyncExpiredEvent {
        peer: MemberTag,
        index: u64,
    },
    /// A peer attested an event this node already knew
    SyncEventReceivedTime {
        peer: MemberTag,
        event_id: EventId,
        time: Timestamp,
    },
    TimelineAddEvent {
        event_id: EventId,
        time: Timestamp,
    },
    TimelineRemoveEvent {
        event_id: EventId,
    },
    /// The handler refused an admitted event
    TimelineRejectedEvent {
        event_id: EventId,
    },
    ConsensusTimeChanged {
        event_id: EventId,
        from: Timestamp,
        to: Timestamp,
    },
    SyncCompleted {
        peers: usize,
        admitted: usize,
    },
}

/// Result of publishing a local event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEventOutcome {
    pub result: VerificationResult,
    pub event_id: Option<EventId>,
    /// The event id was already known to this feed
    pub exists: bool,
}

impl NewEventOutcome {
    fn rejected(result: VerificationResult) -> Self {
        Self {
            result,
            event_id: None,
            exists: false,
        }
    }
}

/// An admitted event and the times members reported receiving it.
#[derive(Debug, Clone)]
pub struct EventRecord {
    pub header: EventHeader,
    /// Attestations in arrival order, one per member
    received: Vec<(MemberTag, Timestamp)>,
    consensus_time: Timestamp,
}

impl EventRecord {
    fn new(header: EventHeader) -> Self {
        Self {
            header,
            received: Vec::new(),
            consensus_time: 0,
        }
    }

    /// Records `member`'s receipt time. Returns false if it already attested.
    fn attest(&mut self, member: &str, time: Timestamp) -> bool {
        if self.received.iter().any(|(m, _)| m == member) {
            return false;
        }
        self.received.push((member.to_string(), time));
        true
    }

    /// Recomputes the consensus over the first `n` attestations.
    fn recompute(&mut self, n: usize) -> Timestamp {
        let times: Vec<f64> = self.received.iter().map(|(_, t)| *t as f64).collect();
        if let Some(consensus) = calculate_consensus_time(&times, n) {
            self.consensus_time = consensus.max(0.0).floor() as Timestamp;
        }
        self.consensus_time
    }

    pub fn received_times(&self) -> impl Iterator<Item = (&str, Timestamp)> {
        self.received.iter().map(|(m, t)| (m.as_str(), *t))
    }

    pub fn received_from(&self, member: &str) -> Option<Timestamp> {
        self.received
            .iter()
            .find(|(m, _)| m == member)
            .map(|(_, t)| *t)
    }

    pub fn consensus_time(&self) -> Timestamp {
        self.consensus_time
    }
}

struct PeerLog {
    log: Arc<dyn ReplicatedLog>,
    cursor: u64,
}

#[derive(Default)]
struct PeerState {
    logs: Vec<PeerLog>,
    invalid: u32,
    failed: bool,
}

/// What one log entry turned into.
enum Ingested {
    Admitted,
    Attested,
    /// Too old to admit; not held against the peer
    Expired,
    Rejected(VerificationResult),
}

/// Feed state hooks are allowed to see.
struct FeedState {
    events: HashMap<EventId, EventRecord>,
    timeline: Timeline,
    deletions: VecDeque<EventId>,
    notify: broadcast::Sender<FeedEvent>,
    member_tag: MemberTag,
}

impl FeedState {
    fn context(&mut self, now: Timestamp) -> FeedContext<'_> {
        FeedContext {
            events: &self.events,
            timeline: &self.timeline,
            deletions: &mut self.deletions,
            notify: &self.notify,
            member_tag: &self.member_tag,
            now,
        }
    }

    fn emit(&self, event: FeedEvent) {
        // No subscribers is fine
        let _ = self.notify.send(event);
    }
}

pub struct EventFeed<H: FeedHandler> {
    state: FeedState,
    handler: H,
    gate: RateLimitGate,
    log: Arc<dyn ReplicatedLog>,
    logs: Arc<dyn LogStore>,
    prover: Arc<dyn ProofSystem>,
    clock: Arc<dyn Clock>,
    peers: BTreeMap<MemberTag, PeerState>,
    /// Deleted events and their claimed times
    tombstones: HashMap<EventId, Timestamp>,
    group_id: String,
    max_invalid_per_peer: u32,
}

impl<H: FeedHandler> EventFeed<H> {
    /// Creates (or reopens) this node's log in `logs` and builds the feed.
    pub async fn new(
        config: FeedConfig,
        handler: H,
        logs: Arc<dyn LogStore>,
        prover: Arc<dyn ProofSystem>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, FeedError> {
        let log = logs.create(&format!("{}-feed", config.topic)).await?;
        let member_tag = log.id();
        let (notify, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let gate = RateLimitGate::new(
            config.topic.clone(),
            config.group_id.clone(),
            Arc::new(config.registry),
            Arc::clone(&prover),
        )
        .with_max_event_age(config.max_event_age)
        .with_max_clock_skew(config.max_clock_skew);
        info!(member = %member_tag, topic = %config.topic, "event feed ready");
        Ok(Self {
            state: FeedState {
                events: HashMap::new(),
                timeline: Timeline::new(),
                deletions: VecDeque::new(),
                notify,
                member_tag,
            },
            handler,
            gate,
            log,
            logs,
            prover,
            clock,
            peers: BTreeMap::new(),
            tombstones: HashMap::new(),
            group_id: config.group_id,
            max_invalid_per_peer: config.max_invalid_per_peer.max(1),
        })
    }

    pub fn member_tag(&self) -> &str {
        &self.state.member_tag
    }

    /// Logs other members need to open to replicate this node.
    pub fn log_ids(&self) -> Vec<LogId> {
        vec![self.log.id()]
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FeedEvent> {
        self.state.notify.subscribe()
    }

    /// Sender half of the notification channel, for subscribing without
    /// holding the feed.
    pub fn notifier(&self) -> broadcast::Sender<FeedEvent> {
        self.state.notify.clone()
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn timeline(&self) -> &Timeline {
        &self.state.timeline
    }

    pub fn event(&self, event_id: &str) -> Option<&EventRecord> {
        self.state.events.get(event_id)
    }

    pub fn is_deleted(&self, event_id: &str) -> bool {
        self.tombstones.contains_key(event_id)
    }

    pub fn peers(&self) -> impl Iterator<Item = &str> {
        self.peers.keys().map(String::as_str)
    }

    /// `None` for unknown peers.
    pub fn peer_failed(&self, peer: &str) -> Option<bool> {
        self.peers.get(peer).map(|state| state.failed)
    }

    /// Members whose attestations count towards consensus.
    fn member_count(&self) -> usize {
        self.peers.len() + 1
    }

    /// Publishes a new event of `event_type` whose payload lives at
    /// `payload_hash`.
    pub async fn new_event(
        &mut self,
        event_type: &str,
        payload_hash: &str,
    ) -> Result<NewEventOutcome, FeedError> {
        let now = self.clock.now();
        if !self.gate.registry().contains(event_type) {
            warn!(%event_type, "refusing to publish unregistered event type");
            return Ok(NewEventOutcome::rejected(VerificationResult::Invalid));
        }
        let Some(inputs) = self.gate.next_inputs(event_type, now) else {
            info!(%event_type, "rate limit reached, not publishing");
            return Ok(NewEventOutcome::rejected(VerificationResult::Invalid));
        };

        let seq = self.log.len().await?;
        let signal = EventHeader::signal_for(
            event_type,
            &self.state.member_tag,
            seq,
            now,
            payload_hash,
        )?;
        let proof = self
            .prover
            .create_proof(&signal, &inputs, &self.group_id)
            .await?;
        let header = EventHeader {
            event_type: event_type.to_string(),
            origin: self.state.member_tag.clone(),
            seq,
            claimed: now,
            payload_hash: payload_hash.to_string(),
            proof,
        };
        let event_id = header.event_id()?;
        if self.state.events.contains_key(&event_id) || self.tombstones.contains_key(&event_id) {
            return Ok(NewEventOutcome {
                result: VerificationResult::Duplicate,
                event_id: Some(event_id),
                exists: true,
            });
        }

        let result = self
            .gate
            .submit(event_type, &header.proof, now, now)
            .await;
        if result != VerificationResult::Valid {
            warn!(%event_id, %result, "own event rejected by the gate");
            return Ok(NewEventOutcome {
                result,
                event_id: Some(event_id),
                exists: false,
            });
        }
        self.gate.record_own(event_type, now);

        let entry = FeedEntry {
            header: header.clone(),
            received: now,
        };
        self.log.append(entry.encode()?).await?;

        let mut record = EventRecord::new(header);
        let own = self.state.member_tag.clone();
        record.attest(&own, now);
        self.admit(event_id.clone(), record).await;
        self.state.emit(FeedEvent::PublishReceivedTime {
            event_id: event_id.clone(),
            time: now,
        });
        debug!(%event_id, %event_type, "published");
        Ok(NewEventOutcome {
            result,
            event_id: Some(event_id),
            exists: false,
        })
    }

    /// Starts replicating `peer` from `log_ids`. Calling it again with the
    /// same arguments has no effect.
    pub async fn add_peer(&mut self, peer: &str, log_ids: &[LogId]) -> Result<(), FeedError> {
        if peer == self.state.member_tag {
            debug!("ignoring self as peer");
            return Ok(());
        }
        let own_log = self.log.id();
        let is_new = !self.peers.contains_key(peer);
        let mut opened = Vec::new();
        for id in log_ids {
            let known = *id == own_log
                || self
                    .peers
                    .get(peer)
                    .is_some_and(|state| state.logs.iter().any(|l| l.log.id() == *id));
            if !known && !opened.iter().any(|l: &Arc<dyn ReplicatedLog>| l.id() == *id) {
                opened.push(self.logs.open(id).await?);
            }
        }
        let state = self.peers.entry(peer.to_string()).or_default();
        state
            .logs
            .extend(opened.into_iter().map(|log| PeerLog { log, cursor: 0 }));
        if is_new {
            info!(%peer, "peer added");
            self.state.emit(FeedEvent::PeerAdded {
                peer: peer.to_string(),
            });
        }
        Ok(())
    }

    /// Stops replicating `peer`. Its attestations stay on the events.
    pub fn remove_peer(&mut self, peer: &str) -> bool {
        if self.peers.remove(peer).is_none() {
            return false;
        }
        info!(%peer, "peer removed");
        self.state.emit(FeedEvent::PeerRemoved {
            peer: peer.to_string(),
        });
        true
    }

    /// Reads `peer`'s logs from where the last session stopped.
    /// Returns the number of newly admitted events.
    #[instrument(skip(self), fields(session = %Uuid::new_v4()))]
    pub async fn sync_peer(&mut self, peer: &str) -> Result<usize, FeedError> {
        let state = self
            .peers
            .get(peer)
            .ok_or_else(|| FeedError::UnknownPeer(peer.to_string()))?;
        if state.failed {
            return Err(FeedError::PeerFailed(peer.to_string()));
        }

        let mut admitted = 0;
        for slot in 0..state.logs.len() {
            let Some((log, cursor)) = self.peer_log(peer, slot) else {
                break;
            };
            let len = log.len().await?;
            if cursor >= len {
                continue;
            }
            self.state.emit(FeedEvent::SyncEventStart {
                peer: peer.to_string(),
                log: log.id(),
                from: cursor,
                to: len,
            });
            debug!(log = %log.id(), from = cursor, to = len, "syncing");

            for index in cursor..len {
                let Some(bytes) = log.get(index).await? else {
                    // Not replicated yet, resume here next session
                    break;
                };
                let ingested = self.ingest(peer, &bytes).await?;
                if let Some(state) = self.peers.get_mut(peer) {
                    if let Some(pl) = state.logs.get_mut(slot) {
                        pl.cursor = index + 1;
                    }
                }

                let result = match ingested {
                    Ingested::Admitted => {
                        admitted += 1;
                        VerificationResult::Valid
                    }
                    Ingested::Attested => VerificationResult::Valid,
                    Ingested::Expired => {
                        debug!(%peer, index, "skipping expired event");
                        self.state.emit(FeedEvent::SyncExpiredEvent {
                            peer: peer.to_string(),
                            index,
                        });
                        continue;
                    }
                    Ingested::Rejected(result) => result,
                };
                self.state.emit(FeedEvent::SyncEventResult {
                    peer: peer.to_string(),
                    index,
                    result,
                });
                match result {
                    VerificationResult::Invalid => {
                        if self.on_invalid_input(peer, index) {
                            return Err(FeedError::PeerFailed(peer.to_string()));
                        }
                    }
                    VerificationResult::Duplicate => self.on_duplicate_input(peer, index),
                    VerificationResult::Valid => {}
                }
            }
        }
        Ok(admitted)
    }

    fn peer_log(&self, peer: &str, slot: usize) -> Option<(Arc<dyn ReplicatedLog>, u64)> {
        let pl = self.peers.get(peer)?.logs.get(slot)?;
        Some((Arc::clone(&pl.log), pl.cursor))
    }

    /// Syncs every healthy peer, then lets the handler retry pending work.
    pub async fn sync_all(&mut self) -> usize {
        let peers: Vec<MemberTag> = self
            .peers
            .iter()
            .filter(|(_, state)| !state.failed)
            .map(|(tag, _)| tag.clone())
            .collect();
        let mut admitted = 0;
        for peer in &peers {
            match self.sync_peer(peer).await {
                Ok(n) => admitted += n,
                Err(err) => warn!(%peer, error = %err, "peer sync failed"),
            }
        }

        let now = self.clock.now();
        let mut ctx = self.state.context(now);
        self.handler.on_sync_completed(&mut ctx).await;
        self.process_deletions().await;
        self.expire_tombstones(now);
        self.state.emit(FeedEvent::SyncCompleted {
            peers: peers.len(),
            admitted,
        });
        admitted
    }

    async fn ingest(&mut self, peer: &str, bytes: &[u8]) -> Result<Ingested, FeedError> {
        let entry = match FeedEntry::decode(bytes) {
            Ok(entry) => entry,
            Err(err) => {
                debug!(%peer, error = %err, "undecodable log entry");
                return Ok(Ingested::Rejected(VerificationResult::Invalid));
            }
        };
        let event_id = entry.header.event_id()?;

        if self.tombstones.contains_key(&event_id) {
            return Ok(Ingested::Rejected(VerificationResult::Duplicate));
        }

        let n = self.member_count();
        if let Some(record) = self.state.events.get_mut(&event_id) {
            // One attestation per member; a second entry is a replay
            if !record.attest(peer, entry.received) {
                return Ok(Ingested::Rejected(VerificationResult::Duplicate));
            }
            let before = record.consensus_time();
            let after = record.recompute(n);
            self.state.emit(FeedEvent::SyncEventReceivedTime {
                peer: peer.to_string(),
                event_id: event_id.clone(),
                time: entry.received,
            });
            if before != after && self.state.timeline.contains(&event_id) {
                self.state.timeline.set_time(&event_id, after);
                self.state.emit(FeedEvent::ConsensusTimeChanged {
                    event_id,
                    from: before,
                    to: after,
                });
            }
            return Ok(Ingested::Attested);
        }

        let header = entry.header;
        if !self.gate.registry().contains(&header.event_type) {
            debug!(%event_id, event_type = %header.event_type, "unregistered event type");
            return Ok(Ingested::Rejected(VerificationResult::Invalid));
        }
        if header.expected_signal()? != header.proof.signal {
            debug!(%event_id, "proof is not bound to this header");
            return Ok(Ingested::Rejected(VerificationResult::Invalid));
        }
        let now = self.clock.now();
        if self.gate.claim_age(header.claimed, now) == ClaimAge::Expired {
            return Ok(Ingested::Expired);
        }
        let result = self
            .gate
            .submit(&header.event_type, &header.proof, header.claimed, now)
            .await;
        if result != VerificationResult::Valid {
            debug!(%event_id, %result, "gate rejected event");
            return Ok(Ingested::Rejected(result));
        }

        // Attest our own receipt so peers syncing from us count it
        let own = FeedEntry {
            header: header.clone(),
            received: now,
        };
        self.log.append(own.encode()?).await?;

        let mut record = EventRecord::new(header);
        record.attest(peer, entry.received);
        let me = self.state.member_tag.clone();
        record.attest(&me, now);
        self.admit(event_id, record).await;
        Ok(Ingested::Admitted)
    }

    /// Common admission path: header hook, timeline insert, timeline hook.
    async fn admit(&mut self, event_id: EventId, mut record: EventRecord) {
        let time = record.recompute(self.member_count());
        let header = record.header.clone();
        self.state.events.insert(event_id.clone(), record);

        let now = self.clock.now();
        let mut ctx = self.state.context(now);
        self.handler
            .on_event_header_sync(&mut ctx, &event_id, &header)
            .await;

        self.state.timeline.set_time(&event_id, time);
        self.state.emit(FeedEvent::TimelineAddEvent {
            event_id: event_id.clone(),
            time,
        });
        let mut ctx = self.state.context(now);
        self.handler.on_timeline_add(&mut ctx, &event_id, time).await;

        self.process_deletions().await;
    }

    /// Returns true when this entry pushed the peer over its budget.
    fn on_invalid_input(&mut self, peer: &str, index: u64) -> bool {
        let Some(state) = self.peers.get_mut(peer) else {
            return false;
        };
        state.invalid += 1;
        warn!(%peer, index, invalid = state.invalid, "invalid input from peer");
        if state.invalid < self.max_invalid_per_peer {
            return false;
        }
        state.failed = true;
        let invalid = state.invalid;
        warn!(%peer, invalid, "peer isolated");
        self.state.emit(FeedEvent::SyncFatalError {
            peer: peer.to_string(),
            invalid,
        });
        true
    }

    fn on_duplicate_input(&mut self, peer: &str, index: u64) {
        debug!(%peer, index, "duplicate input");
        self.state.emit(FeedEvent::SyncDuplicateEvent {
            peer: peer.to_string(),
            index,
        });
    }

    pub fn schedule_event_deletion(&mut self, event_id: &str) {
        self.state.deletions.push_back(event_id.to_string());
    }

    /// Drains the deletion queue, including deletions hooks schedule while
    /// it runs. Returns the number of events removed.
    pub async fn process_deletions(&mut self) -> usize {
        let mut removed = 0;
        while let Some(event_id) = self.state.deletions.pop_front() {
            if !self.state.events.contains_key(&event_id) {
                continue;
            }
            let now = self.clock.now();
            if self.state.timeline.unset_time(&event_id).is_some() {
                let mut ctx = self.state.context(now);
                self.handler.on_timeline_remove(&mut ctx, &event_id).await;
            }
            if let Some(record) = self.state.events.remove(&event_id) {
                self.tombstones.insert(event_id.clone(), record.header.claimed);
            }

            let mut ctx = self.state.context(now);
            self.handler.on_event_deleted(&mut ctx, &event_id).await;
            debug!(%event_id, "event deleted");
            self.state.emit(FeedEvent::TimelineRemoveEvent { event_id });
            removed += 1;
        }
        removed
    }

    /// Forgets deleted events the gate would now refuse as expired.
    fn expire_tombstones(&mut self, now: Timestamp) {
        let before = self.tombstones.len();
        let gate = &self.gate;
        self.tombstones
            .retain(|_, claimed| gate.claim_age(*claimed, now) != ClaimAge::Expired);
        let expired = before - self.tombstones.len();
        if expired > 0 {
            debug!(expired, "tombstones expired");
        }
    }

    /// Deletes events the handler no longer references once they are older
    /// than its grace period.
    pub async fn mark_events_for_deletion(&mut self) -> usize {
        let now = self.clock.now();
        let grace = self.handler.grace_period();
        let stale: Vec<EventId> = self
            .state
            .timeline
            .get_events()
            .filter(|(time, id)| now.saturating_sub(*time) > grace && !self.handler.is_referenced(id))
            .map(|(_, id)| id.to_string())
            .collect();
        if !stale.is_empty() {
            info!(count = stale.len(), "collecting unreferenced events");
        }
        self.state.deletions.extend(stale);
        self.process_deletions().await
    }
}
