// =============================================================================
// Orbiton Matrix Homeserver Core - State Resolution Fork Tests
// =============================================================================
//
// Project: Orbiton - Federated Matrix Homeserver Core
// Contributors: Orbiton Development Team
// License: Apache 2.0 / MIT
//
// Description:
//   Conflicting state across DAG forks: the resolver's winner lands in the
//   current-state column, the loser stays reachable through the state
//   history, and the outcome is deterministic in event fields rather than
//   arrival order.
//
// =============================================================================

use orbiton::{
    service::vm::{EvalOpts, Phase},
    test_utils,
};
use serde_json::json;

fn fork_opts() -> EvalOpts {
    let mut opts = EvalOpts::federation();
    opts.phases = opts.phases.without(Phase::Verify);
    opts
}

/// Two heads modify (m.room.topic, ""): the resolver picks by its ordering
/// (here: higher origin_server_ts), regardless of which fork arrived last.
#[tokio::test]
async fn test_conflicting_topic_forks() {
    let services = test_utils::init_services().await;
    let (room_id, creator) = test_utils::create_test_room(services).await;

    // Two anchors so the fork tips sit at distinct depths.
    let m1 = test_utils::send_test_message(services, &room_id, &creator, "anchor one").await;
    let m2 = test_utils::send_test_message(services, &room_id, &creator, "anchor two").await;

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

    // Fork A: later timestamp, submitted FIRST.
    let topic_a = json!({
        "room_id": room_id.as_str(),
        "sender": creator.as_str(),
        "origin_server_ts": 1_700_000_900_000u64,
        "type": "m.room.topic",
        "state_key": "",
        "content": { "topic": "winner by ordering" },
        "prev_events": [m1.as_str()],
        "auth_events": [create_id.as_str(), join_id.as_str()],
        "depth": 3,
        "hashes": { "sha256": "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa" },
    });
    // Fork B: earlier timestamp, submitted SECOND (it triggers resolution).
    let topic_b = json!({
        "room_id": room_id.as_str(),
        "sender": creator.as_str(),
        "origin_server_ts": 1_700_000_800_000u64,
        "type": "m.room.topic",
        "state_key": "",
        "content": { "topic": "loser by ordering" },
        "prev_events": [m2.as_str()],
        "auth_events": [create_id.as_str(), join_id.as_str()],
        "depth": 4,
        "hashes": { "sha256": "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa" },
    });

    let raw_a = serde_json::value::to_raw_value(&topic_a).unwrap();
    let raw_b = serde_json::value::to_raw_value(&topic_b).unwrap();

    let result_a = services.vm.eval(None, &raw_a, fork_opts()).await.unwrap();
    assert!(!result_a.soft_failed);
    let result_b = services.vm.eval(None, &raw_b, fork_opts()).await.unwrap();
    assert!(!result_b.soft_failed);

    // Both tips are heads: a genuine fork.
    let heads = services.rooms.head.heads(&room_id).unwrap();
    assert_eq!(heads.len(), 2, "the room has forked");

    // The resolver's winner occupies the slot: the mainline ordering applies
    // later-timestamped events last, so fork A wins although it arrived
    // first and sits at a shallower depth.
    let winner_idx = services
        .rooms
        .state
        .room_state_get_idx(&room_id, "m.room.topic", "")
        .unwrap()
        .expect("topic slot is occupied");
    assert_eq!(winner_idx, result_a.idx);

    // The loser remains reachable through the per-slot history at its depth.
    let history = services
        .rooms
        .state
        .state_history(&room_id, "m.room.topic", "")
        .unwrap();
    let depths: Vec<u64> = history.iter().map(|(depth, _)| *depth).collect();
    assert!(depths.contains(&3), "winner recorded at depth 3");
    assert!(depths.contains(&4), "loser recorded at depth 4");
    let idxs: Vec<u64> = history.iter().map(|(_, idx)| *idx).collect();
    assert!(idxs.contains(&result_b.idx), "loser still reachable");
}

/// Resolution is pure in the event fields: recomputing from scratch yields
/// the same current state.
#[tokio::test]
async fn test_recompute_is_deterministic() {
    let services = test_utils::init_services().await;
    let (room_id, creator) = test_utils::create_test_room(services).await;
    test_utils::send_test_message(services, &room_id, &creator, "settled").await;

    let before = services.rooms.state.full_state(&room_id).unwrap();
    services.rooms.state.recompute(&room_id).unwrap();
    let after = services.rooms.state.full_state(&room_id).unwrap();

    assert_eq!(before, after, "recompute agrees with incremental state");
}
