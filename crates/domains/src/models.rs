//! # Domain Models
//!
//! These structs represent the core entities of feedboard.
//! Identifiers are lowercase hex SHA-256 digests, so they are content-derived
//! and globally unique without coordination.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::Result;

/// Event identifier: hex SHA-256 of the serialized [`EventHeader`].
pub type EventId = String;
/// Content address: hex SHA-256 of the stored bytes.
pub type ContentHash = String;
/// Stable tag identifying a peer (member) of the swarm.
pub type MemberTag = String;
/// Identifier of a replicated log inside a `LogStore`.
pub type LogId = String;
/// Unix time in seconds.
pub type Timestamp = u64;

/// Event type tag for a new thread (OP).
pub const TYPE_THREAD: &str = "THREAD";
/// Event type tag for a reply.
pub const TYPE_POST: &str = "POST";

/// Hex SHA-256 of arbitrary bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Outcome of admitting an event or a proof.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationResult {
    Valid,
    Invalid,
    Duplicate,
}

impl std::fmt::Display for VerificationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VerificationResult::Valid => "VALID",
            VerificationResult::Invalid => "INVALID",
            VerificationResult::Duplicate => "DUPLICATE",
        };
        f.write_str(s)
    }
}

/// Outcome of fetching and checking a post body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PostVerificationResult {
    Ok,
    TooLarge,
    ContentUnavailable,
    DeserializationError,
    Invalid,
}

/// Outcome of fetching and checking an attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttachmentVerificationResult {
    Ok,
    TooLarge,
    ContentUnavailable,
    Invalid,
}

/// One rate-limit rule: at most `message_limit` events per `epoch` seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NullifierSpec {
    /// Epoch length in seconds
    pub epoch: u64,
    /// Messages allowed per epoch
    pub message_limit: u32,
}

impl NullifierSpec {
    pub fn new(epoch: u64, message_limit: u32) -> Self {
        Self {
            epoch,
            message_limit,
        }
    }

    /// Index of the epoch window containing `time`.
    pub fn window(&self, time: Timestamp) -> u64 {
        time / self.epoch.max(1)
    }
}

/// Registered event types and the rate limits that gate each of them.
///
/// Built once when a feed is constructed and never mutated afterwards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventTypeRegistry {
    types: BTreeMap<String, Vec<NullifierSpec>>,
}

impl EventTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style registration; every rule must hold at once.
    pub fn with_type(mut self, event_type: impl Into<String>, specs: Vec<NullifierSpec>) -> Self {
        self.types.insert(event_type.into(), specs);
        self
    }

    pub fn specs(&self, event_type: &str) -> Option<&[NullifierSpec]> {
        self.types.get(event_type).map(Vec::as_slice)
    }

    pub fn contains(&self, event_type: &str) -> bool {
        self.types.contains_key(event_type)
    }

    pub fn event_types(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }
}

/// Private input to proof creation for one nullifier spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NullifierInput {
    pub epoch_tag: String,
    /// 1-based index of this message inside the epoch window
    pub message_id: u32,
    pub message_limit: u32,
}

/// Public part of a nullifier, carried inside a [`Proof`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicNullifier {
    pub epoch_tag: String,
    pub message_limit: u32,
    /// Identity-derived tag, stable for one identity within one epoch window
    pub nullifier: String,
}

/// A membership proof binding a signal to an anonymous group member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    pub group_id: String,
    /// Hash of the data this proof authorizes
    pub signal: String,
    pub nullifiers: Vec<PublicNullifier>,
    /// Opaque proof bytes, hex encoded
    pub proof: String,
}

/// The unsigned part of a header; its hash is the proof signal.
#[derive(Serialize)]
struct SignalMaterial<'a> {
    event_type: &'a str,
    origin: &'a str,
    seq: u64,
    claimed: Timestamp,
    payload_hash: &'a str,
}

/// Header of a feed event as stored in the replicated log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHeader {
    pub event_type: String,
    /// Member tag of the publishing peer
    pub origin: MemberTag,
    /// Length of the publisher's log when the event was appended
    pub seq: u64,
    /// Time asserted by the publisher
    pub claimed: Timestamp,
    /// Address of the payload in the content store
    pub payload_hash: ContentHash,
    pub proof: Proof,
}

impl EventHeader {
    /// Signal a proof must commit to for a header with these fields.
    pub fn signal_for(
        event_type: &str,
        origin: &str,
        seq: u64,
        claimed: Timestamp,
        payload_hash: &str,
    ) -> Result<String> {
        let material = SignalMaterial {
            event_type,
            origin,
            seq,
            claimed,
            payload_hash,
        };
        Ok(sha256_hex(&serde_json::to_vec(&material)?))
    }

    /// Recomputes the signal from this header's own fields.
    pub fn expected_signal(&self) -> Result<String> {
        Self::signal_for(
            &self.event_type,
            &self.origin,
            self.seq,
            self.claimed,
            &self.payload_hash,
        )
    }

    pub fn event_id(&self) -> Result<EventId> {
        Ok(sha256_hex(&serde_json::to_vec(self)?))
    }
}

/// One record of a peer's replicated log: the peer admitted `header` at
/// its local time `received`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedEntry {
    pub header: EventHeader,
    pub received: Timestamp,
}

impl FeedEntry {
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(buf)?)
    }
}

/// Author-supplied post content.
///
/// Empty strings and zeroes mean "absent", matching the wire format where
/// default values are never written.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Post {
    /// UNIX timestamp the post was created, in seconds
    pub time: f64,
    /// Comment
    pub com: String,
    /// OP subject text
    pub sub: String,
    /// Display name; clients default it to "Anonymous"
    pub name: String,
    /// Tripcode, `!tripcode` or `!!securetripcode`
    pub trip: String,
    /// For replies: the thread being replied to. Empty for an OP
    pub resto: String,
    /// Filename as it appeared on the poster's device
    pub filename: String,
    /// File extension including the dot
    pub ext: String,
    /// Content address of the attachment
    pub tim: String,
    pub w: i32,
    pub h: i32,
    pub sha256: String,
    pub md5: String,
    /// File size in bytes
    pub fsize: f64,
    pub mime: String,
}

impl Post {
    /// Parent thread, if this post is a reply.
    pub fn resto(&self) -> Option<&str> {
        (!self.resto.is_empty()).then_some(self.resto.as_str())
    }

    /// Attachment content address, if any.
    pub fn attachment(&self) -> Option<&str> {
        (!self.tim.is_empty()).then_some(self.tim.as_str())
    }

    pub fn mime_type(&self) -> Option<mime::Mime> {
        self.mime.parse().ok()
    }
}
