//! # feedboard
//!
//! Runs one board node on in-memory storage with the dev membership prover,
//! syncing and collecting garbage on a fixed interval until Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use auth_adapters::{DevMembershipProver, MembershipGroup};
use configs::{LimitSettings, LogSettings, Settings};
use domains::{EventTypeRegistry, NullifierSpec, TYPE_POST, TYPE_THREAD};
use secrecy::{ExposeSecret, SecretString};
use services::{
    BoardConfig, BoardNode, ContentLimits, FeedConfig, FeedEvent, NodeConfig, NodePorts,
};
use storage_adapters::{MemoryContentStore, MemoryLogStore, SystemClock};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load().context("loading settings")?;
    init_tracing(&settings.log);

    let secret = if settings.identity.secret.expose_secret().is_empty() {
        warn!("no identity secret configured, using a throwaway identity");
        SecretString::from(uuid::Uuid::new_v4().to_string())
    } else {
        settings.identity.secret
    };

    let group = Arc::new(MembershipGroup::new(settings.node.group_id.clone()));
    let prover = DevMembershipProver::join(secret, Arc::clone(&group));
    info!(commitment = %prover.commitment(), group = %group.id(), "identity ready");

    let mut feed = FeedConfig::new(
        settings.node.topic.clone(),
        settings.node.group_id.clone(),
        registry(&settings.board.thread_limits, &settings.board.post_limits),
    );
    feed.max_invalid_per_peer = settings.node.max_invalid_per_peer;
    feed.max_event_age = settings.node.max_event_age_secs;
    feed.max_clock_skew = settings.node.max_clock_skew_secs;

    let config = NodeConfig {
        feed,
        board: BoardConfig {
            max_threads: settings.board.max_threads,
            orphan_grace_secs: settings.board.orphan_grace_secs,
        },
        content: ContentLimits {
            max_post_size: settings.board.max_post_size,
            max_attachment_size: settings.board.max_attachment_size,
        },
    };
    let ports = NodePorts {
        logs: Arc::new(MemoryLogStore::new()),
        content: Arc::new(MemoryContentStore::new()),
        prover: Arc::new(prover),
        clock: Arc::new(SystemClock),
    };
    let node = BoardNode::new(config, ports)
        .await
        .context("starting board node")?;
    info!(member = %node.member_tag(), logs = ?node.log_ids(), "feedboard node started");

    let logger = tokio::spawn(log_feed_events(node.subscribe()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let maintenance = {
        let node = node.clone();
        let interval = Duration::from_millis(settings.node.sync_interval_ms);
        tokio::spawn(async move { node.run_maintenance(interval, shutdown_rx).await })
    };

    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    if let Err(err) = maintenance.await {
        error!(error = %err, "maintenance task panicked");
    }
    logger.abort();
    Ok(())
}

fn init_tracing(log: &LogSettings) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.filter));
    let registry = tracing_subscriber::registry().with(filter);
    if log.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn registry(thread_limits: &[LimitSettings], post_limits: &[LimitSettings]) -> EventTypeRegistry {
    let specs = |limits: &[LimitSettings]| {
        limits
            .iter()
            .map(|l| NullifierSpec::new(l.epoch_secs, l.message_limit))
            .collect::<Vec<_>>()
    };
    EventTypeRegistry::new()
        .with_type(TYPE_THREAD, specs(thread_limits))
        .with_type(TYPE_POST, specs(post_limits))
}

/// Mirrors feed notifications into the log.
async fn log_feed_events(mut events: broadcast::Receiver<FeedEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => log_feed_event(&event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "feed event logger fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn log_feed_event(event: &FeedEvent) {
    match event {
        FeedEvent::PeerAdded { peer } => info!(%peer, "peer added"),
        FeedEvent::PeerRemoved { peer } => info!(%peer, "peer removed"),
        FeedEvent::PublishReceivedTime { event_id, time } => {
            info!(%event_id, time, "published")
        }
        FeedEvent::SyncFatalError { peer, invalid } => {
            error!(%peer, invalid, "peer sent too many invalid entries")
        }
        FeedEvent::TimelineAddEvent { event_id, time } => {
            debug!(%event_id, time, "timeline add")
        }
        FeedEvent::TimelineRemoveEvent { event_id } => debug!(%event_id, "timeline remove"),
        FeedEvent::TimelineRejectedEvent { event_id } => warn!(%event_id, "event rejected"),
        FeedEvent::ConsensusTimeChanged { event_id, from, to } => {
            debug!(%event_id, from, to, "consensus time changed")
        }
        FeedEvent::SyncCompleted { peers, admitted } => {
            if *admitted > 0 {
                info!(peers, admitted, "sync completed");
            }
        }
        other => tracing::trace!(event = ?other, "feed event"),
    }
}
