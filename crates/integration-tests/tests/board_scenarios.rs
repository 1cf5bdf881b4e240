//! End-to-end board behaviour: eviction, rejection and content lifetime.

use bytes::Bytes;
use domains::{sha256_hex, PostVerificationResult, TYPE_THREAD};
use integration_tests::{
    drain_events, follow, node_config, op, permissive_registry, reply, Swarm,
};
use services::{Attachment, FeedEvent};

fn payload_results(events: &[FeedEvent], id: &str) -> Vec<PostVerificationResult> {
    events
        .iter()
        .filter_map(|e| match e {
            FeedEvent::SyncPayloadResult { event_id, result } if event_id == id => Some(*result),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_oldest_thread_is_bumped_off_everywhere() {
    let mut swarm = Swarm::new(1000);
    let alpha = swarm.spawn("alpha", node_config(permissive_registry(), 2)).await;
    let bravo = swarm.spawn("bravo", node_config(permissive_registry(), 2)).await;
    follow(&bravo.node, &alpha.node).await;

    let a = alpha.node.new_thread(op("A"), None).await.unwrap().event_id.unwrap();
    swarm.clock.advance(10);
    let b = alpha.node.new_thread(op("B"), None).await.unwrap().event_id.unwrap();
    swarm.clock.advance(10);
    let c = alpha.node.new_thread(op("C"), None).await.unwrap().event_id.unwrap();
    bravo.node.sync_all().await;

    for node in [&alpha.node, &bravo.node] {
        let catalog = node.get_catalog().await;
        let order: Vec<&str> = catalog[0].threads.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(order, vec![c.as_str(), b.as_str()]);
        assert!(node.get_post_by_id(&a).await.is_none());
        assert!(node.feed().lock().await.is_deleted(&a));
    }
}

#[tokio::test]
async fn test_reply_bumps_its_thread_back_on_top() {
    let mut swarm = Swarm::new(1000);
    let alpha = swarm.spawn("alpha", node_config(permissive_registry(), 2)).await;

    let a = alpha.node.new_thread(op("A"), None).await.unwrap().event_id.unwrap();
    swarm.clock.advance(10);
    let b = alpha.node.new_thread(op("B"), None).await.unwrap().event_id.unwrap();
    swarm.clock.advance(10);
    alpha.node.new_post(reply(&a, "bump"), None).await.unwrap();
    swarm.clock.advance(10);
    let c = alpha.node.new_thread(op("C"), None).await.unwrap().event_id.unwrap();

    let catalog = alpha.node.get_catalog().await;
    let order: Vec<&str> = catalog[0].threads.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(order, vec![c.as_str(), a.as_str()]);
    assert!(alpha.node.get_thread_length(&b).await.is_none());
    assert_eq!(catalog[0].threads[1].replies, Some(1));
}

#[tokio::test]
async fn test_reply_to_unknown_thread_is_dropped() {
    let mut swarm = Swarm::new(1000);
    let alpha = swarm.spawn("alpha", node_config(permissive_registry(), 16)).await;
    let bravo = swarm.spawn("bravo", node_config(permissive_registry(), 16)).await;
    follow(&bravo.node, &alpha.node).await;
    let mut events = bravo.node.subscribe();

    let id = alpha
        .node
        .new_post(reply("ffff", "anyone?"), None)
        .await
        .unwrap()
        .event_id
        .unwrap();
    bravo.node.sync_all().await;

    for node in [&alpha.node, &bravo.node] {
        assert!(node.get_thread_length("ffff").await.is_none());
        assert!(node.get_thread_id(&id).await.is_none());
        assert!(node.get_catalog().await.is_empty());
        assert!(node.feed().lock().await.is_deleted(&id));
    }
    assert!(drain_events(&mut events)
        .contains(&FeedEvent::TimelineRejectedEvent { event_id: id }));
}

#[tokio::test]
async fn test_shared_attachment_outlives_one_of_its_posts() {
    let mut swarm = Swarm::new(1000);
    let alpha = swarm.spawn("alpha", node_config(permissive_registry(), 16)).await;
    let image = Bytes::from_static(b"GIF89a not really");
    let attachment = || {
        Some(Attachment {
            filename: "same.gif".into(),
            data: image.clone(),
        })
    };

    let first = alpha.node.new_thread(op("one"), attachment()).await.unwrap().event_id.unwrap();
    let second = alpha.node.new_thread(op("two"), attachment()).await.unwrap().event_id.unwrap();
    let tim = sha256_hex(&image);
    assert_eq!(alpha.node.get_post_by_id(&first).await.unwrap().post.tim, tim);
    assert_eq!(alpha.node.content().references(&tim), 2);

    {
        let mut feed = alpha.node.feed().lock().await;
        feed.schedule_event_deletion(&first);
        assert_eq!(feed.process_deletions().await, 1);
    }
    assert!(alpha.store.contains(&tim));
    assert_eq!(alpha.node.content().references(&tim), 1);
    assert_eq!(alpha.node.get_attachment(&tim).await.unwrap(), Some(image.clone()));

    {
        let mut feed = alpha.node.feed().lock().await;
        feed.schedule_event_deletion(&second);
        assert_eq!(feed.process_deletions().await, 1);
    }
    assert!(!alpha.store.contains(&tim));
    assert_eq!(alpha.node.content().references(&tim), 0);
    assert!(alpha.node.get_catalog().await.is_empty());
}

#[tokio::test]
async fn test_tampered_payload_is_rejected() {
    let mut swarm = Swarm::new(1000);
    let mallory = swarm.spawn("mallory", node_config(permissive_registry(), 16)).await;
    let bravo = swarm.spawn("bravo", node_config(permissive_registry(), 16)).await;
    follow(&bravo.node, &mallory.node).await;

    let id = mallory.node.new_thread(op("honest"), None).await.unwrap().event_id.unwrap();
    let hash = mallory
        .node
        .feed()
        .lock()
        .await
        .event(&id)
        .unwrap()
        .header
        .payload_hash
        .clone();
    mallory
        .store
        .insert_unchecked(hash, Bytes::from_static(b"\x22\x05evil!"));
    let mut events = bravo.node.subscribe();

    bravo.node.sync_all().await;

    assert_eq!(
        payload_results(&drain_events(&mut events), &id),
        vec![PostVerificationResult::Invalid]
    );
    assert!(bravo.node.get_post_by_id(&id).await.is_none());
    assert!(bravo.node.get_catalog().await.is_empty());
    assert!(bravo.node.feed().lock().await.is_deleted(&id));
}

#[tokio::test]
async fn test_undecodable_payload_is_rejected() {
    let mut swarm = Swarm::new(1000);
    let mallory = swarm.spawn("mallory", node_config(permissive_registry(), 16)).await;
    let bravo = swarm.spawn("bravo", node_config(permissive_registry(), 16)).await;
    follow(&bravo.node, &mallory.node).await;

    // Field 1 is not part of the post format
    let junk = Bytes::from_static(b"\x08\x01");
    let hash = mallory.node.content().save_attachment(junk).await.unwrap();
    let outcome = mallory
        .node
        .feed()
        .lock()
        .await
        .new_event(TYPE_THREAD, &hash)
        .await
        .unwrap();
    let id = outcome.event_id.unwrap();
    let mut events = bravo.node.subscribe();

    bravo.node.sync_all().await;

    assert_eq!(
        payload_results(&drain_events(&mut events), &id),
        vec![PostVerificationResult::DeserializationError]
    );
    assert!(bravo.node.feed().lock().await.is_deleted(&id));
}

#[tokio::test]
async fn test_orphan_thread_is_swept_after_grace() {
    let mut swarm = Swarm::new(1000);
    let alpha = swarm.spawn("alpha", node_config(permissive_registry(), 16)).await;
    let bravo = swarm.spawn("bravo", node_config(permissive_registry(), 16)).await;
    follow(&bravo.node, &alpha.node).await;

    // An OP whose body nobody can serve
    let missing = sha256_hex(b"never stored anywhere");
    let op_id = alpha
        .node
        .feed()
        .lock()
        .await
        .new_event(TYPE_THREAD, &missing)
        .await
        .unwrap()
        .event_id
        .unwrap();
    swarm.clock.advance(5);
    let reply_id = alpha
        .node
        .new_post(reply(&op_id, "first!"), None)
        .await
        .unwrap()
        .event_id
        .unwrap();

    bravo.node.sync_all().await;
    assert_eq!(bravo.node.get_thread_length(&op_id).await, Some(1));
    assert!(bravo.node.get_thread_content(&op_id).await.is_none());
    assert!(bravo
        .node
        .feed()
        .lock()
        .await
        .handler()
        .is_missing_payload(&op_id));

    swarm.clock.advance(601);
    bravo.node.maintain().await;

    assert!(bravo.node.get_thread_length(&op_id).await.is_none());
    let feed = bravo.node.feed().lock().await;
    assert!(feed.is_deleted(&op_id));
    assert!(feed.is_deleted(&reply_id));
}

#[tokio::test]
async fn test_late_payload_is_picked_up_on_sync() {
    let mut swarm = Swarm::new(1000);
    let alpha = swarm.spawn("alpha", node_config(permissive_registry(), 16)).await;
    let bravo = swarm.spawn("bravo", node_config(permissive_registry(), 16)).await;
    follow(&bravo.node, &alpha.node).await;

    let mut post = op("slow");
    post.time = 1000.0;
    let body = domains::wire::encode_post(&post);
    let hash = sha256_hex(&body);
    let id = alpha
        .node
        .feed()
        .lock()
        .await
        .new_event(TYPE_THREAD, &hash)
        .await
        .unwrap()
        .event_id
        .unwrap();

    bravo.node.sync_all().await;
    assert!(bravo.node.get_post_by_id(&id).await.is_none());

    alpha.store.insert_unchecked(hash, body);
    bravo.node.sync_all().await;
    let view = bravo.node.get_post_by_id(&id).await.unwrap();
    assert_eq!(view.post.com, "slow");
    assert_eq!(bravo.node.get_catalog().await[0].threads[0].id, id);
}
