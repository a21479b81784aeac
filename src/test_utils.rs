// =============================================================================
// Orbiton Matrix Homeserver Core - Test Utilities
// =============================================================================
//
// Project: Orbiton - Federated Matrix Homeserver Core
// Contributors: Orbiton Development Team
// License: Apache 2.0 / MIT
//
// Description:
//   Shared test environment: a process-wide service container over the
//   in-memory engine, plus helpers that drive real rooms through the
//   evaluation pipeline. Tests isolate by creating their own rooms.
//
// =============================================================================

use std::sync::{Once, OnceLock};

use figment::providers::{Format, Toml};
use ruma::{events::TimelineEventType, OwnedRoomId, OwnedUserId, RoomId, UserId};
use serde_json::value::to_raw_value;

use crate::{
    config::Config,
    database::KeyValueDatabase,
    service::{
        pdu::PduBuilder,
        vm::EvalOpts,
    },
    utils, Services,
};

static INIT: Once = Once::new();

static SERIAL: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

/// Serializes tests that assert on the process-wide sequence counters.
pub async fn serial() -> tokio::sync::MutexGuard<'static, ()> {
    SERIAL.lock().await
}

/// Initialize test logging (call once per test process).
pub fn init_test_environment() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter("debug")
            .try_init();
    });
}

fn test_config() -> Config {
    figment::Figment::new()
        .merge(Toml::string(
            r#"
            server_name = "orbiton.rs"
            database_backend = "memory"
            database_path = "/tmp/orbiton-test"
            allow_federation = true
            "#,
        ))
        .extract()
        .expect("test config parses")
}

/// The process-wide test services, built once over the memory engine.
pub async fn init_services() -> &'static Services {
    init_test_environment();

    static SETUP: OnceLock<()> = OnceLock::new();
    SETUP.get_or_init(|| {
        let config = test_config();
        let db = KeyValueDatabase::load_or_create(&config).expect("memory engine opens");
        let services = Services::build(db, config).expect("services build");
        crate::init_services(services).expect("services install once");
    });

    crate::services()
}

/// Evaluation options for locally driven tests: hard faults, no federation
/// traffic.
pub fn local_quiet_opts() -> EvalOpts {
    let mut opts = EvalOpts::local();
    opts.notify_servers = false;
    opts
}

/// Creates a fresh v6 room with a creator who has joined; returns both.
pub async fn create_test_room(services: &'static Services) -> (OwnedRoomId, OwnedUserId) {
    let server_name = services.globals.server_name();
    let room_id = RoomId::parse(format!(
        "!{}:{}",
        utils::random_string(12).to_lowercase(),
        server_name
    ))
    .expect("generated room id is valid")
    .to_owned();
    let creator = UserId::parse(format!(
        "@{}:{}",
        utils::random_string(12).to_lowercase(),
        server_name
    ))
    .expect("generated user id is valid")
    .to_owned();

    services
        .vm
        .inject(
            PduBuilder {
                event_type: TimelineEventType::RoomCreate,
                content: to_raw_value(&serde_json::json!({
                    "creator": creator.as_str(),
                    "room_version": "6",
                }))
                .expect("static json serializes"),
                unsigned: None,
                state_key: Some(String::new()),
                redacts: None,
                timestamp: None,
            },
            &creator,
            &room_id,
            local_quiet_opts(),
        )
        .await
        .expect("room create evaluates");

    services
        .vm
        .inject(
            PduBuilder {
                event_type: TimelineEventType::RoomMember,
                content: to_raw_value(&serde_json::json!({ "membership": "join" }))
                    .expect("static json serializes"),
                unsigned: None,
                state_key: Some(creator.as_str().to_owned()),
                redacts: None,
                timestamp: None,
            },
            &creator,
            &room_id,
            local_quiet_opts(),
        )
        .await
        .expect("creator join evaluates");

    (room_id, creator)
}

/// Sends one message event through the pipeline; returns its event id.
pub async fn send_test_message(
    services: &'static Services,
    room_id: &RoomId,
    sender: &UserId,
    body: &str,
) -> ruma::OwnedEventId {
    let result = services
        .vm
        .inject(
            PduBuilder {
                event_type: TimelineEventType::RoomMessage,
                content: to_raw_value(&serde_json::json!({
                    "msgtype": "m.text",
                    "body": body,
                }))
                .expect("static json serializes"),
                unsigned: None,
                state_key: None,
                redacts: None,
                timestamp: None,
            },
            sender,
            room_id,
            local_quiet_opts(),
        )
        .await
        .expect("message evaluates");

    (*result.event_id).to_owned()
}
