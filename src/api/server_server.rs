// =============================================================================
// Orbiton Matrix Homeserver Core - Federation Routes
// =============================================================================
//
// Project: Orbiton - Federated Matrix Homeserver Core
// Contributors: Orbiton Development Team
// License: Apache 2.0 / MIT
//
// Description:
//   The server-server HTTP surface: event and state retrieval, auth chains,
//   backfill and frontfill, join templates, transaction ingestion and the
//   key endpoints. URI templates are bit-exact for wire compatibility.
//   Authenticated routes verify the X-Matrix authorization signature against
//   the origin's published keys; transaction ingestion deduplicates by
//   (origin, txn_id) so redelivery is at-most-once.
//
// =============================================================================

use std::{collections::BTreeMap, sync::Arc};

use axum::{
    extract::{Path, Query},
    http::{HeaderMap, Method, Uri},
    routing::{get, post, put},
    Json, Router,
};
use ruma::{
    CanonicalJsonValue, EventId, OwnedEventId, OwnedServerName, OwnedUserId, RoomId, ServerName,
};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, warn};

use crate::{
    service::vm::EvalOpts,
    services, utils, Error, Result,
};

pub fn router() -> Router {
    Router::new()
        .route("/_matrix/federation/v1/version", get(get_server_version))
        .route("/_matrix/federation/v1/event/:event_id", get(get_event))
        .route(
            "/_matrix/federation/v1/event_auth/:room_id/:event_id",
            get(get_event_auth),
        )
        .route("/_matrix/federation/v1/state/:room_id", get(get_room_state))
        .route("/_matrix/federation/v1/backfill/:room_id", get(get_backfill))
        .route(
            "/_matrix/federation/v1/get_missing_events/:room_id",
            get(get_missing_events).post(get_missing_events_post),
        )
        .route(
            "/_matrix/federation/v1/make_join/:room_id/:user_id",
            get(make_join),
        )
        .route("/_matrix/federation/v1/send/:txn_id", put(send_transaction))
        .route(
            "/_matrix/federation/v1/query_auth/:room_id/:event_id",
            post(query_auth),
        )
        .route("/_matrix/federation/v1/publicRooms", get(public_rooms))
        .route(
            "/_matrix/federation/v1/user/devices/:user_id",
            get(user_devices),
        )
        .route("/_matrix/federation/v1/user/keys/query", post(user_keys_query))
        .route("/_matrix/federation/v1/user/keys/claim", post(user_keys_claim))
        .route("/_matrix/key/v2/server", get(get_server_keys))
        .route("/_matrix/key/v2/server/:key_id", get(get_server_keys))
        .route("/_matrix/key/v2/query", post(query_keys))
        .route("/.well-known/matrix/server", get(well_known))
}

/// Verifies the X-Matrix authorization of a federation request and returns
/// the asserted origin.
async fn authenticate(
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    content: Option<&JsonValue>,
) -> Result<OwnedServerName> {
    let header = headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or(Error::BadRequest(
            ruma::api::client::error::ErrorKind::MissingToken,
            "missing X-Matrix authorization",
        ))?;

    let params = header
        .strip_prefix("X-Matrix ")
        .ok_or(Error::BadRequest(
            ruma::api::client::error::ErrorKind::MissingToken,
            "authorization is not X-Matrix",
        ))?;

    let mut origin = None;
    let mut key_id = None;
    let mut signature = None;
    for pair in params.split(',') {
        let Some((name, value)) = pair.trim().split_once('=') else {
            continue;
        };
        let value = value.trim_matches('"');
        match name {
            "origin" => origin = ServerName::parse(value).ok(),
            "key" => key_id = Some(value.to_owned()),
            "sig" => signature = Some(value.to_owned()),
            _ => {}
        }
    }

    let (origin, key_id, signature) = match (origin, key_id, signature) {
        (Some(o), Some(k), Some(s)) => (o, k, s),
        _ => {
            return Err(Error::BadRequest(
                ruma::api::client::error::ErrorKind::MissingToken,
                "malformed X-Matrix authorization",
            ))
        }
    };

    // Reassemble the canonical request form the origin signed.
    let mut request_map = ruma::CanonicalJsonObject::new();
    request_map.insert(
        "method".to_owned(),
        CanonicalJsonValue::String(method.as_str().to_owned()),
    );
    request_map.insert(
        "uri".to_owned(),
        CanonicalJsonValue::String(
            uri.path_and_query()
                .map(|pq| pq.as_str().to_owned())
                .unwrap_or_else(|| uri.path().to_owned()),
        ),
    );
    request_map.insert(
        "origin".to_owned(),
        CanonicalJsonValue::String(origin.as_str().to_owned()),
    );
    request_map.insert(
        "destination".to_owned(),
        CanonicalJsonValue::String(services().globals.server_name().as_str().to_owned()),
    );
    if let Some(content) = content {
        request_map.insert(
            "content".to_owned(),
            CanonicalJsonValue::try_from(content.clone())
                .map_err(|e| Error::BadJson(e.to_string()))?,
        );
    }

    let mut signatures = ruma::CanonicalJsonObject::new();
    let mut origin_signatures = ruma::CanonicalJsonObject::new();
    origin_signatures.insert(key_id, CanonicalJsonValue::String(signature));
    signatures.insert(
        origin.as_str().to_owned(),
        CanonicalJsonValue::Object(origin_signatures),
    );
    request_map.insert(
        "signatures".to_owned(),
        CanonicalJsonValue::Object(signatures),
    );

    services()
        .keys
        .verify_request(&origin, &request_map)
        .await
        .map_err(|e| {
            warn!(%origin, %e, "request authentication failed");
            Error::BadRequest(
                ruma::api::client::error::ErrorKind::UnknownToken { soft_logout: false },
                "request signature verification failed",
            )
        })?;

    Ok(origin)
}

fn wire_pdu(json: &ruma::CanonicalJsonObject) -> JsonValue {
    serde_json::to_value(json).expect("canonical json serializes")
}

async fn get_server_version() -> Json<JsonValue> {
    Json(json!({
        "server": {
            "name": "Orbiton",
            "version": env!("CARGO_PKG_VERSION"),
        }
    }))
}

async fn get_event(
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    Path(event_id): Path<OwnedEventId>,
) -> Result<Json<JsonValue>> {
    let origin = authenticate(&method, &uri, &headers, None).await?;
    debug!(%origin, %event_id, "event requested over federation");

    let json = services()
        .rooms
        .timeline
        .get_pdu_json(&event_id)?
        .ok_or(Error::NotFound("event not found"))?;

    Ok(Json(json!({
        "origin": services().globals.server_name().as_str(),
        "origin_server_ts": utils::millis_since_unix_epoch(),
        "pdus": [wire_pdu(&json)],
    })))
}

#[derive(Deserialize)]
struct IdsOnlyParams {
    #[serde(default)]
    ids_only: bool,
}

async fn get_event_auth(
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    Path((room_id, event_id)): Path<(ruma::OwnedRoomId, OwnedEventId)>,
    Query(params): Query<IdsOnlyParams>,
) -> Result<Json<JsonValue>> {
    authenticate(&method, &uri, &headers, None).await?;

    let chain_ids = services()
        .rooms
        .auth_chain
        .get_auth_chain_ids(&room_id, vec![Arc::from(&*event_id)])
        .await?;

    if params.ids_only {
        let ids: Vec<String> = chain_ids.iter().map(|id| id.to_string()).collect();
        return Ok(Json(json!({ "auth_chain_ids": ids })));
    }

    let mut chain = Vec::with_capacity(chain_ids.len());
    for id in chain_ids {
        if let Some(json) = services().rooms.timeline.get_pdu_json(&id)? {
            chain.push(wire_pdu(&json));
        }
    }
    Ok(Json(json!({ "auth_chain": chain })))
}

#[derive(Deserialize)]
struct StateParams {
    event_id: Option<OwnedEventId>,
    #[serde(default)]
    ids_only: bool,
}

async fn get_room_state(
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    Path(room_id): Path<ruma::OwnedRoomId>,
    Query(params): Query<StateParams>,
) -> Result<Json<JsonValue>> {
    authenticate(&method, &uri, &headers, None).await?;

    let state = match &params.event_id {
        Some(event_id) => services().rooms.state.state_at_event(&room_id, event_id)?,
        None => services().rooms.state.full_state(&room_id)?,
    };

    let state_ids: Vec<Arc<EventId>> = state
        .values()
        .filter_map(|idx| services().rooms.short.get_eventid(*idx).ok())
        .collect();

    let auth_chain_ids = services()
        .rooms
        .auth_chain
        .get_auth_chain_ids(&room_id, state_ids.clone())
        .await?;

    if params.ids_only {
        return Ok(Json(json!({
            "pdu_ids": state_ids.iter().map(|id| id.to_string()).collect::<Vec<_>>(),
            "auth_chain_ids": auth_chain_ids.iter().map(|id| id.to_string()).collect::<Vec<_>>(),
        })));
    }

    let mut pdus = Vec::with_capacity(state_ids.len());
    for id in &state_ids {
        if let Some(json) = services().rooms.timeline.get_pdu_json(id)? {
            pdus.push(wire_pdu(&json));
        }
    }
    let mut auth_chain = Vec::with_capacity(auth_chain_ids.len());
    for id in &auth_chain_ids {
        if let Some(json) = services().rooms.timeline.get_pdu_json(id)? {
            auth_chain.push(wire_pdu(&json));
        }
    }

    Ok(Json(json!({ "auth_chain": auth_chain, "pdus": pdus })))
}

#[derive(Deserialize)]
struct BackfillParams {
    event_id: Option<OwnedEventId>,
    limit: Option<u64>,
}

async fn get_backfill(
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    Path(room_id): Path<ruma::OwnedRoomId>,
    Query(params): Query<BackfillParams>,
) -> Result<Json<JsonValue>> {
    let origin = authenticate(&method, &uri, &headers, None).await?;
    debug!(%origin, %room_id, "backfill requested");

    let limit = params.limit.unwrap_or(10).min(100) as usize;

    // Window below the anchor in reverse causal order.
    let anchor_depth = match &params.event_id {
        Some(event_id) => {
            let idx = services()
                .rooms
                .short
                .get_eventidx(event_id)?
                .ok_or(Error::NotFound("backfill anchor unknown"))?;
            services()
                .rooms
                .timeline
                .depth_of(idx)?
                .unwrap_or(u64::MAX)
        }
        None => u64::MAX,
    };

    let mut pdus = Vec::new();
    for (depth, idx) in services()
        .rooms
        .timeline
        .room_events(&room_id)?
        .into_iter()
        .rev()
    {
        if depth > anchor_depth {
            continue;
        }
        if let Some(json) = services().rooms.timeline.get_pdu_json_by_idx(idx)? {
            pdus.push(wire_pdu(&json));
        }
        if pdus.len() >= limit {
            break;
        }
    }

    Ok(Json(json!({
        "origin": services().globals.server_name().as_str(),
        "origin_server_ts": utils::millis_since_unix_epoch(),
        "pdus": pdus,
    })))
}

#[derive(Deserialize, Default)]
struct MissingEventsBody {
    #[serde(default)]
    earliest_events: Vec<OwnedEventId>,
    #[serde(default)]
    latest_events: Vec<OwnedEventId>,
    limit: Option<u64>,
}

async fn get_missing_events(
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    Path(room_id): Path<ruma::OwnedRoomId>,
) -> Result<Json<JsonValue>> {
    authenticate(&method, &uri, &headers, None).await?;
    missing_events_inner(&room_id, MissingEventsBody::default())
}

async fn get_missing_events_post(
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    Path(room_id): Path<ruma::OwnedRoomId>,
    Json(body): Json<JsonValue>,
) -> Result<Json<JsonValue>> {
    authenticate(&method, &uri, &headers, Some(&body)).await?;
    let body: MissingEventsBody =
        serde_json::from_value(body).map_err(|e| Error::BadJson(e.to_string()))?;
    missing_events_inner(&room_id, body)
}

/// Frontfill: walk back from the latest references until the earliest set,
/// returning the events in between.
fn missing_events_inner(
    room_id: &RoomId,
    body: MissingEventsBody,
) -> Result<Json<JsonValue>> {
    let limit = body.limit.unwrap_or(10).min(50) as usize;
    let stop: std::collections::HashSet<&EventId> =
        body.earliest_events.iter().map(|id| id.as_ref()).collect();

    let mut queue: Vec<OwnedEventId> = body.latest_events;
    let mut seen = std::collections::HashSet::new();
    let mut events = Vec::new();

    while let Some(event_id) = queue.pop() {
        if events.len() >= limit {
            break;
        }
        if stop.contains(&*event_id) || !seen.insert(event_id.clone()) {
            continue;
        }
        let Some(pdu) = services().rooms.timeline.get_pdu(&event_id)? else {
            continue;
        };
        if pdu.room_id != room_id {
            continue;
        }
        if let Some(json) = services().rooms.timeline.get_pdu_json(&event_id)? {
            events.push(wire_pdu(&json));
        }
        for prev in &pdu.prev_events {
            queue.push((**prev).to_owned());
        }
    }

    Ok(Json(json!({ "events": events })))
}

async fn make_join(
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    Path((room_id, user_id)): Path<(ruma::OwnedRoomId, OwnedUserId)>,
) -> Result<Json<JsonValue>> {
    authenticate(&method, &uri, &headers, None).await?;

    let room_version = services().rooms.state.room_version(&room_id)?;
    if !services()
        .globals
        .supported_room_versions()
        .contains(&room_version.id)
    {
        return Err(Error::BadRequest(
            ruma::api::client::error::ErrorKind::InvalidParam,
            "room version not supported",
        ));
    }

    let heads = services().rooms.head.heads(&room_id)?;
    let prev_events: Vec<String> = heads.iter().map(|(id, _)| id.to_string()).collect();
    let mut depth = 0u64;
    for (_, idx) in &heads {
        if let Some(d) = services().rooms.timeline.depth_of(*idx)? {
            depth = depth.max(d + 1);
        }
    }

    let content = serde_json::value::to_raw_value(&json!({ "membership": "join" }))
        .expect("static json serializes");
    let auth_events = services().rooms.state.auth_events_for(
        &room_id,
        &ruma::events::TimelineEventType::RoomMember,
        &user_id,
        Some(user_id.as_str()),
        &content,
    )?;

    // An unsigned template; the joining server hashes and signs it.
    let event = json!({
        "room_id": room_id.as_str(),
        "sender": user_id.as_str(),
        "origin": user_id.server_name().as_str(),
        "origin_server_ts": utils::millis_since_unix_epoch(),
        "type": "m.room.member",
        "state_key": user_id.as_str(),
        "content": { "membership": "join" },
        "prev_events": prev_events,
        "auth_events": auth_events
            .values()
            .map(|pdu| pdu.event_id.to_string())
            .collect::<Vec<_>>(),
        "depth": depth,
    });

    Ok(Json(json!({
        "room_version": room_version.id.as_str(),
        "event": event,
    })))
}

async fn send_transaction(
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    Path(txn_id): Path<String>,
    Json(body): Json<JsonValue>,
) -> Result<Json<JsonValue>> {
    let origin = authenticate(&method, &uri, &headers, Some(&body)).await?;

    // At-most-once: a replayed transaction answers with its stored result.
    if let Some(stored) = services().globals.db.txn_response(&origin, &txn_id)? {
        debug!(%origin, txn_id, "replayed transaction answered from dedup");
        return Ok(Json(stored));
    }

    let pdus = body
        .get("pdus")
        .and_then(|p| p.as_array())
        .cloned()
        .unwrap_or_default();
    if pdus.len() > 50 {
        return Err(Error::BadRequest(
            ruma::api::client::error::ErrorKind::TooLarge,
            "transaction carries too many pdus",
        ));
    }

    let opts = EvalOpts::federation();
    let limit = opts.limit.unwrap_or(50);

    let mut results: BTreeMap<String, JsonValue> = BTreeMap::new();
    for pdu in pdus.iter().take(limit) {
        let raw = serde_json::value::to_raw_value(pdu).expect("body json serializes");
        match services().vm.eval(Some(&origin), &raw, opts.clone()).await {
            Ok(result) => {
                results.insert(result.event_id.to_string(), json!({}));
            }
            Err(fault) => {
                let event_id = pdu
                    .get("event_id")
                    .and_then(|id| id.as_str())
                    .unwrap_or("$unknown")
                    .to_owned();
                let error = fault.error();
                warn!(%origin, %event_id, %error, "pdu rejected");
                results.insert(event_id, json!({ "error": error.to_string() }));
            }
        }
    }

    let response = json!({ "pdus": results });
    services()
        .globals
        .db
        .store_txn_response(&origin, &txn_id, &response)?;

    Ok(Json(response))
}

async fn query_auth(
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    Path((room_id, event_id)): Path<(ruma::OwnedRoomId, OwnedEventId)>,
    Json(body): Json<JsonValue>,
) -> Result<Json<JsonValue>> {
    let origin = authenticate(&method, &uri, &headers, Some(&body)).await?;

    // Evaluate whatever chain the peer offers; rejects are reported back.
    let mut rejects = Vec::new();
    if let Some(remote_chain) = body.get("auth_chain").and_then(|c| c.as_array()) {
        let mut opts = EvalOpts::federation();
        opts.replays = true;
        for pdu in remote_chain {
            let raw = serde_json::value::to_raw_value(pdu).expect("body json serializes");
            if let Err(fault) = services().vm.eval(Some(&origin), &raw, opts.clone()).await {
                if let Some(id) = pdu.get("event_id").and_then(|id| id.as_str()) {
                    warn!(event_id = id, phase = fault.phase().name(), "offered auth event rejected");
                    rejects.push(id.to_owned());
                }
            }
        }
    }

    let chain_ids = services()
        .rooms
        .auth_chain
        .get_auth_chain_ids(&room_id, vec![Arc::from(&*event_id)])
        .await?;

    let mut auth_chain = Vec::with_capacity(chain_ids.len());
    let mut missing = Vec::new();
    for id in &chain_ids {
        match services().rooms.timeline.get_pdu_json(id)? {
            Some(json) => auth_chain.push(wire_pdu(&json)),
            None => missing.push(id.to_string()),
        }
    }

    Ok(Json(json!({
        "auth_chain": auth_chain,
        "missing": missing,
        "rejects": rejects,
    })))
}

async fn public_rooms() -> Json<JsonValue> {
    Json(json!({
        "chunk": [],
        "total_room_count_estimate": 0,
    }))
}

async fn user_devices(Path(user_id): Path<OwnedUserId>) -> Json<JsonValue> {
    Json(json!({
        "user_id": user_id.as_str(),
        "stream_id": 0,
        "devices": [],
    }))
}

async fn user_keys_query() -> Json<JsonValue> {
    Json(json!({ "device_keys": {} }))
}

async fn user_keys_claim() -> Json<JsonValue> {
    Json(json!({ "one_time_keys": {} }))
}

async fn get_server_keys() -> Result<Json<JsonValue>> {
    Ok(Json(services().keys.own_server_keys()?))
}

async fn query_keys(Json(body): Json<JsonValue>) -> Result<Json<JsonValue>> {
    // Notary surface: answer with our own keys when requested; third-party
    // keys are only served once cached.
    let mut server_keys = Vec::new();
    if let Some(requested) = body.get("server_keys").and_then(|v| v.as_object()) {
        for name in requested.keys() {
            if name == services().globals.server_name().as_str() {
                server_keys.push(services().keys.own_server_keys()?);
            }
        }
    }
    Ok(Json(json!({ "server_keys": server_keys })))
}

async fn well_known() -> Result<Json<JsonValue>> {
    let config = &services().globals.config;
    let target = config
        .well_known_server
        .clone()
        .unwrap_or_else(|| format!("{}:{}", config.server_name, config.port));
    Ok(Json(json!({ "m.server": target })))
}
