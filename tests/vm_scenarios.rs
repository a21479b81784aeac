// =============================================================================
// Orbiton Matrix Homeserver Core - Evaluation Pipeline Scenarios
// =============================================================================
//
// Project: Orbiton - Federated Matrix Homeserver Core
// Contributors: Orbiton Development Team
// License: Apache 2.0 / MIT
//
// Description:
//   End-to-end scenarios through the evaluation pipeline over the in-memory
//   engine: local room creation, missing-prev soft failure and horizon
//   release, redaction projection, counter discipline and replay
//   idempotence.
//
// =============================================================================

use std::time::Duration;

use orbiton::{
    service::{
        pdu::gen_event_id_canonical_json,
        rooms::RoomVersion,
        vm::{EvalOpts, Phase},
    },
    test_utils, Error,
};
use ruma::{events::TimelineEventType, RoomVersionId};
use serde_json::json;

/// Scenario: a locally injected m.room.create becomes the room's single
/// head, occupies the create slot, and advances the counters by exactly its
/// own issue.
#[tokio::test]
async fn test_local_create_scenario() {
    let _serial = test_utils::serial().await;
    let services = test_utils::init_services().await;
    let before = services.vm.counters();

    let (room_id, creator) = test_utils::create_test_room(services).await;

    let after = services.vm.counters();
    // Create plus the creator's join.
    assert_eq!(after.uncommitted, before.uncommitted + 2);
    assert!(after.retired <= after.committed && after.committed < after.uncommitted);

    let create = services
        .rooms
        .state
        .room_state_get(&room_id, "m.room.create", "")
        .unwrap()
        .expect("create occupies its slot");
    assert_eq!(create.kind, TimelineEventType::RoomCreate);
    assert_eq!(create.sender, creator);

    let heads = services.rooms.head.heads(&room_id).unwrap();
    assert_eq!(heads.len(), 1, "the join is the single head");
}

/// Scenario: an event referencing a missing prev soft-fails: it is written,
/// a horizon row appears, and the head set does not include it. When the
/// missing event arrives, the referrer upgrades.
#[tokio::test]
async fn test_missing_prev_soft_fail_and_horizon_release() {
    let _serial = test_utils::serial().await;
    let services = test_utils::init_services().await;
    let (room_id, creator) = test_utils::create_test_room(services).await;
    let anchor = test_utils::send_test_message(services, &room_id, &creator, "anchor").await;

    let room_version = RoomVersion::new(&RoomVersionId::V6).unwrap();
    let create_id = services
        .rooms
        .state
        .room_state_get(&room_id, "m.room.create", "")
        .unwrap()
        .unwrap()
        .event_id
        .clone();
    let join_id = services
        .rooms
        .state
        .room_state_get(&room_id, "m.room.member", creator.as_str())
        .unwrap()
        .unwrap()
        .event_id
        .clone();

    // The "missing" event exists only as JSON for now; its id is derived
    // from its content.
    let missing_json = json!({
        "room_id": room_id.as_str(),
        "sender": creator.as_str(),
        "origin_server_ts": 1_700_000_100_000u64,
        "type": "m.room.message",
        "content": { "msgtype": "m.text", "body": "late arrival" },
        "prev_events": [anchor.as_str()],
        "auth_events": [create_id.as_str(), join_id.as_str()],
        "depth": 3,
        "hashes": { "sha256": "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa" },
    });
    let missing_raw = serde_json::value::to_raw_value(&missing_json).unwrap();
    let (missing_id, _) = gen_event_id_canonical_json(
        &missing_raw,
        &room_version.id,
        &room_version.rules,
    )
    .unwrap();

    // The referrer arrives first, pointing at the unseen event.
    let referrer_json = json!({
        "room_id": room_id.as_str(),
        "sender": creator.as_str(),
        "origin_server_ts": 1_700_000_200_000u64,
        "type": "m.room.message",
        "content": { "msgtype": "m.text", "body": "early arrival" },
        "prev_events": [missing_id.as_str()],
        "auth_events": [create_id.as_str(), join_id.as_str()],
        "depth": 4,
        "hashes": { "sha256": "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa" },
    });
    let referrer_raw = serde_json::value::to_raw_value(&referrer_json).unwrap();

    let mut opts = EvalOpts::federation();
    opts.phases = opts.phases.without(Phase::Verify);

    let result = services
        .vm
        .eval(None, &referrer_raw, opts.clone())
        .await
        .expect("referrer is written despite the gap");
    assert!(result.soft_failed, "missing prev soft-fails the referrer");

    // The horizon records the gap; the head set excludes the referrer.
    let referrers = services.rooms.head.horizon_referrers(&missing_id).unwrap();
    assert_eq!(referrers, vec![result.idx]);
    assert!(services.rooms.timeline.is_soft_failed(result.idx).unwrap());
    let heads = services.rooms.head.heads(&room_id).unwrap();
    assert!(
        heads.iter().all(|(id, _)| **id != *result.event_id),
        "soft-failed event is not a head"
    );

    // The sounding measures the referrer's depth on both edges.
    let sounding = services.rooms.head.sounding(&room_id).unwrap().unwrap();
    assert_eq!(sounding, (4, 4));

    // Now the missing event arrives; the horizon releases and the referrer
    // re-enters the pipeline.
    services
        .vm
        .eval(None, &missing_raw, opts)
        .await
        .expect("missing event evaluates");

    let mut upgraded = false;
    for _ in 0..40 {
        if !services.rooms.timeline.is_soft_failed(result.idx).unwrap() {
            upgraded = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(upgraded, "referrer upgrades after the gap fills");
    assert!(services
        .rooms
        .head
        .horizon_referrers(&missing_id)
        .unwrap()
        .is_empty());
}

/// Scenario: a redaction commits, its target keeps index and indexes, and
/// the projection strips the content.
#[tokio::test]
async fn test_redaction_scenario() {
    let _serial = test_utils::serial().await;
    let services = test_utils::init_services().await;
    let (room_id, creator) = test_utils::create_test_room(services).await;
    let target = test_utils::send_test_message(services, &room_id, &creator, "redact me").await;

    let target_idx = services
        .rooms
        .short
        .get_eventidx(&target)
        .unwrap()
        .expect("target is stored");

    let result = services
        .vm
        .inject(
            orbiton::service::pdu::PduBuilder {
                event_type: TimelineEventType::RoomRedaction,
                content: serde_json::value::to_raw_value(&json!({ "reason": "testing" }))
                    .unwrap(),
                unsigned: None,
                state_key: None,
                redacts: Some(std::sync::Arc::from(&*target)),
                timestamp: None,
            },
            &creator,
            &room_id,
            test_utils::local_quiet_opts(),
        )
        .await
        .expect("redaction evaluates");

    // Target index unchanged, content stripped.
    assert_eq!(
        services.rooms.short.get_eventidx(&target).unwrap(),
        Some(target_idx)
    );
    let redacted = services
        .rooms
        .timeline
        .get_pdu_by_idx(target_idx)
        .unwrap()
        .expect("target remains stored");
    assert!(redacted.is_redacted());
    let content: serde_json::Value = serde_json::from_str(redacted.content.get()).unwrap();
    assert!(content.get("body").is_none(), "body is stripped");

    // The forward type index carries the redaction.
    let redactions = services
        .rooms
        .timeline
        .events_by_type(&TimelineEventType::RoomRedaction)
        .unwrap();
    assert!(redactions.contains(&result.idx));
}

/// Replays: resubmitting a retired event with replays on advances no
/// counter; with replays off it fails fast as non-unique.
#[tokio::test]
async fn test_replay_idempotence() {
    let _serial = test_utils::serial().await;
    let services = test_utils::init_services().await;
    let (room_id, creator) = test_utils::create_test_room(services).await;
    let message = test_utils::send_test_message(services, &room_id, &creator, "once").await;

    let idx = services
        .rooms
        .short
        .get_eventidx(&message)
        .unwrap()
        .unwrap();
    let json = services
        .rooms
        .timeline
        .get_pdu_json_by_idx(idx)
        .unwrap()
        .unwrap();
    let raw = serde_json::value::to_raw_value(&json).unwrap();

    let before = services.vm.counters();

    let mut replay_opts = EvalOpts::federation();
    replay_opts.replays = true;
    replay_opts.phases = replay_opts.phases.without(Phase::Verify);
    let replayed = services
        .vm
        .eval(None, &raw, replay_opts)
        .await
        .expect("replay is idempotent");
    assert_eq!(replayed.idx, idx);

    let after = services.vm.counters();
    assert_eq!(before.uncommitted, after.uncommitted, "no new index issued");
    assert_eq!(before.retired, after.retired);

    let mut strict_opts = EvalOpts::federation();
    strict_opts.phases = strict_opts.phases.without(Phase::Verify);
    let fault = services
        .vm
        .eval(None, &raw, strict_opts)
        .await
        .expect_err("duplicate without replays fails fast");
    assert!(matches!(fault.error(), Error::NotUnique(_)));
}

/// Boundary: empty prev_events is valid only for m.room.create; depth
/// beyond known prevs plus one rejects at CONFORM.
#[tokio::test]
async fn test_conform_boundaries() {
    let _serial = test_utils::serial().await;
    let services = test_utils::init_services().await;
    let (room_id, creator) = test_utils::create_test_room(services).await;
    let head = test_utils::send_test_message(services, &room_id, &creator, "base").await;

    let create_id = services
        .rooms
        .state
        .room_state_get(&room_id, "m.room.create", "")
        .unwrap()
        .unwrap()
        .event_id
        .clone();
    let join_id = services
        .rooms
        .state
        .room_state_get(&room_id, "m.room.member", creator.as_str())
        .unwrap()
        .unwrap()
        .event_id
        .clone();

    let mut opts = EvalOpts::federation();
    opts.phases = opts.phases.without(Phase::Verify);

    // No prevs on a non-create event.
    let orphan = json!({
        "room_id": room_id.as_str(),
        "sender": creator.as_str(),
        "origin_server_ts": 1_700_000_300_000u64,
        "type": "m.room.message",
        "content": { "msgtype": "m.text", "body": "orphan" },
        "prev_events": [],
        "auth_events": [create_id.as_str(), join_id.as_str()],
        "depth": 9,
        "hashes": { "sha256": "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa" },
    });
    let raw = serde_json::value::to_raw_value(&orphan).unwrap();
    let fault = services.vm.eval(None, &raw, opts.clone()).await.unwrap_err();
    assert_eq!(fault.phase(), Phase::Conform);

    // Depth runs past max(prev depths) + 1.
    let too_deep = json!({
        "room_id": room_id.as_str(),
        "sender": creator.as_str(),
        "origin_server_ts": 1_700_000_400_000u64,
        "type": "m.room.message",
        "content": { "msgtype": "m.text", "body": "too deep" },
        "prev_events": [head.as_str()],
        "auth_events": [create_id.as_str(), join_id.as_str()],
        "depth": 40,
        "hashes": { "sha256": "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa" },
    });
    let raw = serde_json::value::to_raw_value(&too_deep).unwrap();
    let fault = services.vm.eval(None, &raw, opts).await.unwrap_err();
    assert_eq!(fault.phase(), Phase::Conform);
}

/// A state event whose state_key names another user rejects in the auth
/// pipeline.
#[tokio::test]
async fn test_foreign_state_key_rejected() {
    let _serial = test_utils::serial().await;
    let services = test_utils::init_services().await;
    let (room_id, creator) = test_utils::create_test_room(services).await;

    let fault = services
        .vm
        .inject(
            orbiton::service::pdu::PduBuilder {
                event_type: TimelineEventType::from("m.custom.state".to_owned()),
                content: serde_json::value::to_raw_value(&json!({})).unwrap(),
                unsigned: None,
                state_key: Some("@someoneelse:orbiton.rs".to_owned()),
                redacts: None,
                timestamp: None,
            },
            &creator,
            &room_id,
            test_utils::local_quiet_opts(),
        )
        .await
        .expect_err("foreign mxid state_key rejects");

    assert!(matches!(fault.error(), Error::AuthFail { rule: "rule_9", .. }));
}
