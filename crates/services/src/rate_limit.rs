//! # Rate-limit gate
//!
//! Admission control for feed events. Every event carries a membership
//! proof with one public nullifier per configured [`NullifierSpec`]. The
//! gate checks that each nullifier belongs to the window implied by the
//! event's claimed time and that the identity behind it has not used up
//! that window's quota.
//!
//! Identity is never trusted directly: the only inputs are the proof's
//! validity (delegated to the `ProofSystem`) and nullifier reuse.
//!
//! Claimed times are only admitted within `[now - max_event_age,
//! now + max_clock_skew]`. A window is forgotten only once every time it
//! covers has fallen out of that range, so a forgotten window can never be
//! refilled.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use domains::{
    EventTypeRegistry, NullifierInput, NullifierSpec, Proof, ProofSystem, Timestamp,
    VerificationResult,
};
use tracing::{debug, warn};

/// Default admission horizon for claimed times, in seconds.
pub const DEFAULT_MAX_EVENT_AGE: u64 = 7 * 86_400;
/// Default tolerance for claims ahead of the local clock, in seconds.
pub const DEFAULT_MAX_CLOCK_SKEW: u64 = 60;

/// Where a claimed time falls relative to the admission range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimAge {
    Current,
    /// Older than the admission horizon
    Expired,
    /// Further ahead of the local clock than the allowed skew
    Future,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct NullifierKey {
    epoch_tag: String,
    nullifier: String,
}

#[derive(Debug)]
struct WindowRecord {
    epoch: u64,
    window: u64,
    /// Signals admitted under this nullifier
    signals: HashSet<String>,
}

impl WindowRecord {
    /// Every time in the window is older than `max_age`.
    fn expired(&self, now: Timestamp, max_age: u64) -> bool {
        window_expired(self.epoch, self.window, now, max_age)
    }
}

fn window_expired(epoch: u64, window: u64, now: Timestamp, max_age: u64) -> bool {
    let end = window.saturating_add(1).saturating_mul(epoch);
    end.saturating_add(max_age) <= now
}

pub struct RateLimitGate {
    topic: String,
    group_id: String,
    registry: Arc<EventTypeRegistry>,
    prover: Arc<dyn ProofSystem>,
    records: HashMap<NullifierKey, WindowRecord>,
    /// Messages this node published per epoch tag, used to pick message ids
    own_usage: HashMap<String, (NullifierSpec, u64, u32)>,
    max_event_age: u64,
    max_clock_skew: u64,
}

impl RateLimitGate {
    pub fn new(
        topic: impl Into<String>,
        group_id: impl Into<String>,
        registry: Arc<EventTypeRegistry>,
        prover: Arc<dyn ProofSystem>,
    ) -> Self {
        Self {
            topic: topic.into(),
            group_id: group_id.into(),
            registry,
            prover,
            records: HashMap::new(),
            own_usage: HashMap::new(),
            max_event_age: DEFAULT_MAX_EVENT_AGE,
            max_clock_skew: DEFAULT_MAX_CLOCK_SKEW,
        }
    }

    pub fn with_max_event_age(mut self, secs: u64) -> Self {
        self.max_event_age = secs;
        self
    }

    pub fn with_max_clock_skew(mut self, secs: u64) -> Self {
        self.max_clock_skew = secs;
        self
    }

    pub fn claim_age(&self, claimed: Timestamp, now: Timestamp) -> ClaimAge {
        if claimed.saturating_add(self.max_event_age) < now {
            ClaimAge::Expired
        } else if claimed > now.saturating_add(self.max_clock_skew) {
            ClaimAge::Future
        } else {
            ClaimAge::Current
        }
    }

    pub fn registry(&self) -> &EventTypeRegistry {
        &self.registry
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// External nullifier for `event_type` under `spec` at `time`.
    pub fn epoch_tag(&self, event_type: &str, spec: &NullifierSpec, time: Timestamp) -> String {
        format!(
            "{}|{}|{}|{}",
            self.topic,
            event_type,
            spec.epoch,
            spec.window(time)
        )
    }

    /// Proof inputs for this node's next message of `event_type`.
    ///
    /// Returns `None` when the type is unknown or when any window's quota
    /// is already spent, since no valid proof can exist in that case.
    pub fn next_inputs(&self, event_type: &str, time: Timestamp) -> Option<Vec<NullifierInput>> {
        let specs = self.registry.specs(event_type)?;
        let mut inputs = Vec::with_capacity(specs.len());
        for spec in specs {
            let epoch_tag = self.epoch_tag(event_type, spec, time);
            let used = self
                .own_usage
                .get(&epoch_tag)
                .map(|(_, _, count)| *count)
                .unwrap_or(0);
            if used >= spec.message_limit {
                debug!(%epoch_tag, used, limit = spec.message_limit, "local quota exhausted");
                return None;
            }
            inputs.push(NullifierInput {
                epoch_tag,
                message_id: used + 1,
                message_limit: spec.message_limit,
            });
        }
        Some(inputs)
    }

    /// Records that this node published an event of `event_type` at `time`.
    pub fn record_own(&mut self, event_type: &str, time: Timestamp) {
        let Some(specs) = self.registry.specs(event_type).map(<[_]>::to_vec) else {
            return;
        };
        for spec in specs {
            let epoch_tag = self.epoch_tag(event_type, &spec, time);
            self.own_usage
                .entry(epoch_tag)
                .or_insert((spec, spec.window(time), 0))
                .2 += 1;
        }
    }

    /// Checks a proof for an event of `event_type` claimed at `claimed`
    /// and, if it passes, records its nullifiers.
    pub async fn submit(
        &mut self,
        event_type: &str,
        proof: &Proof,
        claimed: Timestamp,
        now: Timestamp,
    ) -> VerificationResult {
        self.prune(now);
        let age = self.claim_age(claimed, now);
        if age != ClaimAge::Current {
            debug!(claimed, now, ?age, "claimed time outside admission range");
            return VerificationResult::Invalid;
        }

        let Some(specs) = self.registry.specs(event_type).map(<[_]>::to_vec) else {
            debug!(%event_type, "unregistered event type");
            return VerificationResult::Invalid;
        };
        if proof.nullifiers.len() != specs.len() {
            debug!(
                expected = specs.len(),
                got = proof.nullifiers.len(),
                "nullifier count mismatch"
            );
            return VerificationResult::Invalid;
        }

        match self.prover.verify_proof(proof, &self.group_id).await {
            Ok(VerificationResult::Valid) => {}
            Ok(other) => {
                debug!(result = %other, "proof rejected by verifier");
                return VerificationResult::Invalid;
            }
            Err(err) => {
                warn!(error = %err, "proof verification failed");
                return VerificationResult::Invalid;
            }
        }

        let mut keys = Vec::with_capacity(specs.len());
        for (spec, public) in specs.iter().zip(&proof.nullifiers) {
            let expected_tag = self.epoch_tag(event_type, spec, claimed);
            if public.epoch_tag != expected_tag || public.message_limit != spec.message_limit {
                debug!(
                    expected = %expected_tag,
                    got = %public.epoch_tag,
                    "nullifier does not match claimed time"
                );
                return VerificationResult::Invalid;
            }
            let key = NullifierKey {
                epoch_tag: expected_tag,
                nullifier: public.nullifier.clone(),
            };
            if let Some(record) = self.records.get(&key) {
                if record.signals.contains(&proof.signal) {
                    return VerificationResult::Duplicate;
                }
                if record.signals.len() >= spec.message_limit as usize {
                    debug!(epoch_tag = %key.epoch_tag, "message limit exceeded");
                    return VerificationResult::Invalid;
                }
            }
            keys.push((key, *spec));
        }

        for (key, spec) in keys {
            self.records
                .entry(key)
                .or_insert_with(|| WindowRecord {
                    epoch: spec.epoch,
                    window: spec.window(claimed),
                    signals: HashSet::new(),
                })
                .signals
                .insert(proof.signal.clone());
        }
        VerificationResult::Valid
    }

    /// Drops windows whose every time is past the admission horizon.
    pub fn prune(&mut self, now: Timestamp) {
        let max_age = self.max_event_age;
        self.records.retain(|_, record| !record.expired(now, max_age));
        self.own_usage
            .retain(|_, (spec, window, _)| !window_expired(spec.epoch, *window, now, max_age));
    }

    /// Number of tracked (window, identity) records.
    pub fn tracked(&self) -> usize {
        self.records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domains::{MockProofSystem, PublicNullifier};

    fn registry(limit: u32) -> Arc<EventTypeRegistry> {
        Arc::new(
            EventTypeRegistry::new()
                .with_type("POST", vec![NullifierSpec::new(10, limit), NullifierSpec::new(86400, 2048)]),
        )
    }

    fn accepting_prover() -> Arc<dyn ProofSystem> {
        let mut prover = MockProofSystem::new();
        prover
            .expect_verify_proof()
            .returning(|_, _| Ok(VerificationResult::Valid));
        Arc::new(prover)
    }

    fn proof_for(gate: &RateLimitGate, identity: &str, signal: &str, claimed: Timestamp) -> Proof {
        let specs = gate.registry().specs("POST").unwrap().to_vec();
        Proof {
            group_id: "g".into(),
            signal: signal.into(),
            nullifiers: specs
                .iter()
                .map(|spec| PublicNullifier {
                    epoch_tag: gate.epoch_tag("POST", spec, claimed),
                    message_limit: spec.message_limit,
                    nullifier: format!("{identity}:{}", spec.window(claimed)),
                })
                .collect(),
            proof: String::new(),
        }
    }

    #[tokio::test]
    async fn test_limit_plus_one_is_invalid() {
        for limit in 1..=4u32 {
            let mut gate = RateLimitGate::new("t", "g", registry(limit), accepting_prover());
            for i in 0..limit {
                let proof = proof_for(&gate, "alice", &format!("sig{i}"), 100);
                assert_eq!(gate.submit("POST", &proof, 100, 100).await, VerificationResult::Valid);
            }
            let proof = proof_for(&gate, "alice", "one-too-many", 101);
            assert_eq!(gate.submit("POST", &proof, 101, 101).await, VerificationResult::Invalid);
        }
    }

    #[tokio::test]
    async fn test_replay_is_duplicate() {
        let mut gate = RateLimitGate::new("t", "g", registry(1), accepting_prover());
        let proof = proof_for(&gate, "alice", "sig", 100);
        assert_eq!(gate.submit("POST", &proof, 100, 100).await, VerificationResult::Valid);
        assert_eq!(gate.submit("POST", &proof, 100, 100).await, VerificationResult::Duplicate);
    }

    #[tokio::test]
    async fn test_other_identity_has_own_quota() {
        let mut gate = RateLimitGate::new("t", "g", registry(1), accepting_prover());
        let a = proof_for(&gate, "alice", "a", 100);
        let b = proof_for(&gate, "bob", "b", 100);
        assert_eq!(gate.submit("POST", &a, 100, 100).await, VerificationResult::Valid);
        assert_eq!(gate.submit("POST", &b, 100, 100).await, VerificationResult::Valid);
    }

    #[tokio::test]
    async fn test_next_window_resets_quota() {
        let mut gate = RateLimitGate::new("t", "g", registry(1), accepting_prover());
        let first = proof_for(&gate, "alice", "a", 100);
        let later = proof_for(&gate, "alice", "b", 110);
        assert_eq!(gate.submit("POST", &first, 100, 100).await, VerificationResult::Valid);
        assert_eq!(gate.submit("POST", &later, 110, 110).await, VerificationResult::Valid);
    }

    #[tokio::test]
    async fn test_nullifier_for_wrong_window_is_invalid() {
        let mut gate = RateLimitGate::new("t", "g", registry(1), accepting_prover());
        let proof = proof_for(&gate, "alice", "a", 100);
        // Claims a time in a different 10s window than the proof was built for
        assert_eq!(gate.submit("POST", &proof, 250, 250).await, VerificationResult::Invalid);
        assert_eq!(gate.tracked(), 0);
    }

    #[tokio::test]
    async fn test_unregistered_type_is_invalid() {
        let mut gate = RateLimitGate::new("t", "g", registry(1), accepting_prover());
        let proof = proof_for(&gate, "alice", "a", 100);
        assert_eq!(gate.submit("THREAD", &proof, 100, 100).await, VerificationResult::Invalid);
    }

    #[tokio::test]
    async fn test_rejected_proof_records_nothing() {
        let mut prover = MockProofSystem::new();
        prover
            .expect_verify_proof()
            .returning(|_, _| Ok(VerificationResult::Invalid));
        let mut gate = RateLimitGate::new("t", "g", registry(1), Arc::new(prover));
        let proof = proof_for(&gate, "alice", "a", 100);
        assert_eq!(gate.submit("POST", &proof, 100, 100).await, VerificationResult::Invalid);
        assert_eq!(gate.tracked(), 0);
    }

    #[tokio::test]
    async fn test_old_windows_are_pruned() {
        let mut gate = RateLimitGate::new("t", "g", registry(1), accepting_prover())
            .with_max_event_age(50);
        let proof = proof_for(&gate, "alice", "a", 100);
        gate.submit("POST", &proof, 100, 100).await;
        assert_eq!(gate.tracked(), 2);
        gate.prune(159);
        assert_eq!(gate.tracked(), 2);
        gate.prune(160);
        // The daily window is still live
        assert_eq!(gate.tracked(), 1);
    }

    #[tokio::test]
    async fn test_backdated_claims_cannot_refill_a_forgotten_window() {
        let mut gate = RateLimitGate::new("t", "g", registry(1), accepting_prover())
            .with_max_event_age(50);
        let first = proof_for(&gate, "alice", "a", 100);
        assert_eq!(gate.submit("POST", &first, 100, 140).await, VerificationResult::Valid);

        for (i, now) in [200u64, 300, 1000, 1000, 1000].into_iter().enumerate() {
            let again = proof_for(&gate, "alice", &format!("again{i}"), 100);
            assert_eq!(gate.submit("POST", &again, 100, now).await, VerificationResult::Invalid);
        }
        assert_eq!(gate.claim_age(100, 1000), ClaimAge::Expired);
    }

    #[tokio::test]
    async fn test_default_horizon_rejects_week_old_claims() {
        let mut gate = RateLimitGate::new("t", "g", registry(1), accepting_prover());
        let now = 100 + DEFAULT_MAX_EVENT_AGE + 1;
        for i in 0..5 {
            let proof = proof_for(&gate, "alice", &format!("sig{i}"), 100);
            assert_eq!(gate.submit("POST", &proof, 100, now).await, VerificationResult::Invalid);
        }
        assert_eq!(gate.tracked(), 0);
    }

    #[tokio::test]
    async fn test_future_claims_are_bounded_by_skew() {
        let mut gate = RateLimitGate::new("t", "g", registry(1), accepting_prover())
            .with_max_clock_skew(60);
        let far = proof_for(&gate, "alice", "far", 1061);
        assert_eq!(gate.submit("POST", &far, 1061, 1000).await, VerificationResult::Invalid);
        let near = proof_for(&gate, "bob", "near", 1060);
        assert_eq!(gate.submit("POST", &near, 1060, 1000).await, VerificationResult::Valid);
    }

    #[test]
    fn test_next_inputs_counts_own_messages() {
        let mut gate = RateLimitGate::new("t", "g", registry(2), accepting_prover());
        let inputs = gate.next_inputs("POST", 100).unwrap();
        assert_eq!(inputs[0].message_id, 1);
        gate.record_own("POST", 100);
        assert_eq!(gate.next_inputs("POST", 100).unwrap()[0].message_id, 2);
        gate.record_own("POST", 100);
        assert!(gate.next_inputs("POST", 100).is_none());
        assert!(gate.next_inputs("POST", 110).is_some());
        assert!(gate.next_inputs("THREAD", 100).is_none());
    }
}
