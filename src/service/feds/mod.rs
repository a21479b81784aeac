// =============================================================================
// Orbiton Matrix Homeserver Core - Federation Fan-Out
// =============================================================================
//
// Project: Orbiton - Federated Matrix Homeserver Core
// Contributors: Orbiton Development Team
// License: Apache 2.0 / MIT
//
// Description:
//   Executes one logical query against every known origin of a room in
//   parallel under a deadline, streaming per-peer results to the caller's
//   callback in arrival order. Peers latched in error are skipped at
//   enumeration; a failed peer never fails the fan-out; peers that miss the
//   deadline are delivered exactly once with a timeout error.
//
// =============================================================================

use std::{collections::HashSet, sync::Arc, time::Duration};

use futures_util::{stream::FuturesUnordered, StreamExt};
use http::Method;
use ruma::{OwnedEventId, OwnedRoomId, OwnedServerName, OwnedUserId, RoomId};
use serde_json::Value as JsonValue;
use tokio::time::Instant;
use tracing::debug;

use crate::{services, Error, Result};

/// The fan-out operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FedOp {
    Version,
    State,
    Event,
    Head,
    Auth,
    Keys,
    Backfill,
    Send,
}

/// Options of one fan-out execution.
#[derive(Clone, Debug)]
pub struct FedOpts {
    pub op: FedOp,
    pub room_id: Option<OwnedRoomId>,
    pub event_id: Option<OwnedEventId>,
    /// For `head` (make_join probing).
    pub user_id: Option<OwnedUserId>,
    pub timeout: Duration,
    /// For `backfill`.
    pub limit: Option<u64>,
    /// Ids-only projections of `state` and `auth`.
    pub ids_only: bool,
    /// For `keys`: (server_name, key_id).
    pub key_target: Option<(OwnedServerName, String)>,
    /// For `send`: (txn_id, body).
    pub txn: Option<(String, JsonValue)>,
}

impl FedOpts {
    pub fn new(op: FedOp, room_id: &RoomId) -> Self {
        Self {
            op,
            room_id: Some(room_id.to_owned()),
            event_id: None,
            user_id: None,
            timeout: Duration::from_secs(
                services().globals.config.federation_timeout_s,
            ),
            limit: None,
            ids_only: false,
            key_target: None,
            txn: None,
        }
    }
}

/// One per-peer result. Results are independent; ordering is arrival order.
#[derive(Debug)]
pub struct FedResult {
    pub origin: OwnedServerName,
    pub eptr: Option<Arc<Error>>,
    pub object: JsonValue,
}

pub struct Service;

impl Service {
    /// Runs the fan-out. The callback returns true to continue consuming
    /// results, false to stop early. Returns the number of origins queried.
    #[tracing::instrument(skip(self, opts, callback), fields(op = ?opts.op))]
    pub async fn execute<F>(&self, opts: FedOpts, mut callback: F) -> Result<usize>
    where
        F: FnMut(FedResult) -> bool,
    {
        let origins = self.enumerate(&opts).await?;
        let queried = origins.len();
        if origins.is_empty() {
            return Ok(0);
        }

        let deadline = Instant::now() + opts.timeout;

        let mut in_flight: FuturesUnordered<_> = origins
            .iter()
            .cloned()
            .map(|origin| {
                let opts = opts.clone();
                async move {
                    let result = request_one(&origin, &opts).await;
                    (origin, result)
                }
            })
            .collect();

        let mut outstanding: HashSet<OwnedServerName> = origins.into_iter().collect();

        loop {
            tokio::select! {
                next = in_flight.next() => {
                    let Some((origin, result)) = next else {
                        break;
                    };
                    outstanding.remove(&origin);
                    let keep_going = match result {
                        Ok(object) => callback(FedResult {
                            origin,
                            eptr: None,
                            object,
                        }),
                        Err(error) => callback(FedResult {
                            origin,
                            eptr: Some(Arc::new(error)),
                            object: JsonValue::Null,
                        }),
                    };
                    if !keep_going {
                        return Ok(queried);
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    break;
                }
            }
        }

        // Every non-responding peer appears exactly once, with a timeout.
        for origin in outstanding {
            debug!(%origin, "fan-out member timed out");
            let keep_going = callback(FedResult {
                origin,
                eptr: Some(Arc::new(Error::Timeout("fan-out deadline elapsed"))),
                object: JsonValue::Null,
            });
            if !keep_going {
                break;
            }
        }

        Ok(queried)
    }

    /// Origins of the room, minus ourselves and every latched peer.
    async fn enumerate(&self, opts: &FedOpts) -> Result<Vec<OwnedServerName>> {
        let room_id = opts
            .room_id
            .as_ref()
            .ok_or(Error::BadRequest(
                ruma::api::client::error::ErrorKind::InvalidParam,
                "fan-out without a room",
            ))?;

        let mut origins = Vec::new();
        for origin in services().rooms.state.room_servers(room_id)? {
            if origin == services().globals.server_name() {
                continue;
            }
            if services().peers.is_latched(&origin).await {
                debug!(%origin, "skipping latched peer");
                continue;
            }
            origins.push(origin);
        }
        Ok(origins)
    }
}

async fn request_one(origin: &OwnedServerName, opts: &FedOpts) -> Result<JsonValue> {
    let (method, path, body) = match opts.op {
        FedOp::Version => (
            Method::GET,
            "/_matrix/federation/v1/version".to_owned(),
            None,
        ),
        FedOp::Event => {
            let event_id = opts
                .event_id
                .as_ref()
                .ok_or(Error::BadRequest(
                    ruma::api::client::error::ErrorKind::InvalidParam,
                    "event fan-out without event_id",
                ))?;
            (
                Method::GET,
                format!("/_matrix/federation/v1/event/{event_id}"),
                None,
            )
        }
        FedOp::Auth => {
            let room_id = opts.room_id.as_ref().expect("enumerate checked room_id");
            let event_id = opts
                .event_id
                .as_ref()
                .ok_or(Error::BadRequest(
                    ruma::api::client::error::ErrorKind::InvalidParam,
                    "auth fan-out without event_id",
                ))?;
            let query = if opts.ids_only { "?ids_only=true" } else { "" };
            (
                Method::GET,
                format!("/_matrix/federation/v1/event_auth/{room_id}/{event_id}{query}"),
                None,
            )
        }
        FedOp::State => {
            let room_id = opts.room_id.as_ref().expect("enumerate checked room_id");
            let mut query = String::new();
            if let Some(event_id) = &opts.event_id {
                query = format!("?event_id={event_id}");
                if opts.ids_only {
                    query.push_str("&ids_only=true");
                }
            } else if opts.ids_only {
                query = "?ids_only=true".to_owned();
            }
            (
                Method::GET,
                format!("/_matrix/federation/v1/state/{room_id}{query}"),
                None,
            )
        }
        FedOp::Head => {
            let room_id = opts.room_id.as_ref().expect("enumerate checked room_id");
            let user_id = opts
                .user_id
                .as_ref()
                .ok_or(Error::BadRequest(
                    ruma::api::client::error::ErrorKind::InvalidParam,
                    "head fan-out without user_id",
                ))?;
            (
                Method::GET,
                format!("/_matrix/federation/v1/make_join/{room_id}/{user_id}"),
                None,
            )
        }
        FedOp::Keys => {
            let (server, key_id) = opts
                .key_target
                .as_ref()
                .ok_or(Error::BadRequest(
                    ruma::api::client::error::ErrorKind::InvalidParam,
                    "keys fan-out without a target",
                ))?;
            (
                Method::POST,
                "/_matrix/key/v2/query".to_owned(),
                Some(serde_json::json!({
                    "server_keys": { server.as_str(): { key_id: {} } }
                })),
            )
        }
        FedOp::Backfill => {
            let room_id = opts.room_id.as_ref().expect("enumerate checked room_id");
            let event_id = opts
                .event_id
                .as_ref()
                .ok_or(Error::BadRequest(
                    ruma::api::client::error::ErrorKind::InvalidParam,
                    "backfill fan-out without event_id",
                ))?;
            let limit = opts.limit.unwrap_or(10);
            (
                Method::GET,
                format!(
                    "/_matrix/federation/v1/backfill/{room_id}?event_id={event_id}&limit={limit}"
                ),
                None,
            )
        }
        FedOp::Send => {
            let (txn_id, body) = opts
                .txn
                .as_ref()
                .ok_or(Error::BadRequest(
                    ruma::api::client::error::ErrorKind::InvalidParam,
                    "send fan-out without a transaction",
                ))?;
            (
                Method::PUT,
                format!("/_matrix/federation/v1/send/{txn_id}"),
                Some(body.clone()),
            )
        }
    };

    services()
        .peers
        .request(origin, method, &path, body, opts.timeout)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils;

    /// Test: enumeration excludes ourselves and latched peers; a fan-out
    /// over an empty origin set completes immediately
    #[tokio::test]
    async fn test_enumeration_and_empty_fanout() {
        let services = test_utils::init_services().await;
        let (room_id, _) = test_utils::create_test_room(services).await;

        // The only member is local, so no origins remain.
        let queried = services
            .feds
            .execute(FedOpts::new(FedOp::Version, &room_id), |_| {
                panic!("no results expected")
            })
            .await
            .unwrap();
        assert_eq!(queried, 0);
    }
}
