// =============================================================================
// Orbiton Matrix Homeserver Core - Fetch Coordinator
// =============================================================================
//
// Project: Orbiton - Federated Matrix Homeserver Core
// Contributors: Orbiton Development Team
// License: Apache 2.0 / MIT
//
// Description:
//   De-duplicated, bounded-concurrency retrieval of missing events, auth
//   chains, state slices and backfill windows. At most one request is in
//   flight per key; concurrent callers subscribe to the same promise. A
//   per-room cap bounds concurrency across keys; origins demote on failure
//   streaks and are excluded once attempted. Successfully fetched events
//   re-enter the evaluation pipeline with the causality phases softened.
//
// =============================================================================

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use http::Method;
use ruma::{EventId, OwnedEventId, OwnedRoomId, OwnedServerName, RoomId, ServerName};
use serde_json::value::to_raw_value;
use tokio::sync::{watch, Mutex, Semaphore};
use tracing::{debug, warn};

use crate::{
    service::vm::{EvalOpts, Phase},
    services, utils, Error, Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FetchOp {
    Event,
    Auth,
    State,
    Backfill,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FetchKey {
    pub op: FetchOp,
    pub room_id: OwnedRoomId,
    pub event_id: OwnedEventId,
}

/// Terminal record of one coordinated request.
#[derive(Clone, Debug)]
pub struct FetchRequest {
    pub started: u64,
    pub attempted: HashSet<OwnedServerName>,
    pub eptr: Option<Arc<Error>>,
    pub finished: bool,
    /// Origin of the most recent attempt.
    pub origin: Option<OwnedServerName>,
}

type Outcome = Option<std::result::Result<(), Arc<Error>>>;

pub struct Service {
    in_flight: Mutex<HashMap<FetchKey, watch::Receiver<Outcome>>>,
    room_limits: Mutex<HashMap<OwnedRoomId, Arc<Semaphore>>>,
    /// Last finished request per key, for operator surfaces.
    finished: Mutex<HashMap<FetchKey, FetchRequest>>,
}

impl Service {
    pub fn new() -> Self {
        Self {
            in_flight: Mutex::new(HashMap::new()),
            room_limits: Mutex::new(HashMap::new()),
            finished: Mutex::new(HashMap::new()),
        }
    }

    /// Fetches one missing event and submits it to the evaluation pipeline.
    pub async fn event(
        &self,
        room_id: &RoomId,
        event_id: &EventId,
        origin_hint: Option<&ServerName>,
    ) -> Result<()> {
        self.run(
            FetchKey {
                op: FetchOp::Event,
                room_id: room_id.to_owned(),
                event_id: event_id.to_owned(),
            },
            origin_hint,
        )
        .await
    }

    /// Fetches the auth chain behind one event, admitting each member.
    pub async fn auth(
        &self,
        room_id: &RoomId,
        event_id: &EventId,
        origin_hint: Option<&ServerName>,
    ) -> Result<()> {
        self.run(
            FetchKey {
                op: FetchOp::Auth,
                room_id: room_id.to_owned(),
                event_id: event_id.to_owned(),
            },
            origin_hint,
        )
        .await
    }

    /// Fetches the state slice at one event, admitting each member.
    pub async fn state(
        &self,
        room_id: &RoomId,
        event_id: &EventId,
        origin_hint: Option<&ServerName>,
    ) -> Result<()> {
        self.run(
            FetchKey {
                op: FetchOp::State,
                room_id: room_id.to_owned(),
                event_id: event_id.to_owned(),
            },
            origin_hint,
        )
        .await
    }

    /// Backfills a window of history below one event.
    pub async fn backfill(
        &self,
        room_id: &RoomId,
        event_id: &EventId,
        origin_hint: Option<&ServerName>,
    ) -> Result<()> {
        self.run(
            FetchKey {
                op: FetchOp::Backfill,
                room_id: room_id.to_owned(),
                event_id: event_id.to_owned(),
            },
            origin_hint,
        )
        .await
    }

    /// The terminal record of the most recent request under a key.
    pub async fn last_request(&self, key: &FetchKey) -> Option<FetchRequest> {
        self.finished.lock().await.get(key).cloned()
    }

    /// Background horizon sweeper: periodically retries the events the
    /// store is still missing, which is what drains the soundings.
    pub fn start_horizon_sweeper(&self, interval: Duration) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;

                let rows = match services().rooms.head.horizon() {
                    Ok(rows) => rows,
                    Err(e) => {
                        warn!(%e, "horizon sweep could not read the ledger");
                        continue;
                    }
                };

                for (missing, referrer) in rows {
                    let room_id = match services().rooms.timeline.room_id_of(referrer) {
                        Ok(Some(room_id)) => room_id,
                        _ => continue,
                    };
                    if let Err(e) = services().fetch.event(&room_id, &missing, None).await {
                        debug!(%missing, %e, "horizon sweep attempt failed");
                    }
                }
            }
        });
    }

    /// Single-flight execution: the first caller drives the request, every
    /// concurrent caller subscribes to its promise.
    async fn run(&self, key: FetchKey, origin_hint: Option<&ServerName>) -> Result<()> {
        let (tx, driver) = {
            let mut in_flight = self.in_flight.lock().await;
            if let Some(rx) = in_flight.get(&key) {
                (None, Some(rx.clone()))
            } else {
                let (tx, rx) = watch::channel::<Outcome>(None);
                in_flight.insert(key.clone(), rx);
                (Some(tx), None)
            }
        };

        if let Some(mut rx) = driver {
            // Subscriber path: await the driver's terminal result.
            loop {
                if let Some(outcome) = rx.borrow().clone() {
                    return outcome.map_err(|e| Error::Unavailable(e.to_string()));
                }
                if rx.changed().await.is_err() {
                    return Err(Error::Unavailable("fetch driver vanished".to_owned()));
                }
            }
        }

        let tx = tx.expect("driver path holds the sender");
        let limit = self.room_limit(&key.room_id).await;
        let _permit = limit
            .acquire()
            .await
            .map_err(|_| Error::Unavailable("room fetch limit closed".to_owned()))?;

        let mut request = FetchRequest {
            started: utils::secs_since_unix_epoch(),
            attempted: HashSet::new(),
            eptr: None,
            finished: false,
            origin: None,
        };

        let outcome = self.attempt_origins(&key, origin_hint, &mut request).await;

        request.finished = true;
        if let Err(error) = &outcome {
            request.eptr = Some(Arc::clone(error));
        }

        self.finished.lock().await.insert(key.clone(), request);
        self.in_flight.lock().await.remove(&key);
        let _ = tx.send(Some(outcome.clone()));

        outcome.map_err(|e| Error::Unavailable(e.to_string()))
    }

    async fn room_limit(&self, room_id: &OwnedRoomId) -> Arc<Semaphore> {
        let cap = services().globals.config.room_fetch_concurrency;
        Arc::clone(
            self.room_limits
                .lock()
                .await
                .entry(room_id.clone())
                .or_insert_with(|| Arc::new(Semaphore::new(cap))),
        )
    }

    /// Tries origins in demotion order until one yields the events.
    async fn attempt_origins(
        &self,
        key: &FetchKey,
        origin_hint: Option<&ServerName>,
        request: &mut FetchRequest,
    ) -> std::result::Result<(), Arc<Error>> {
        let mut origins: Vec<OwnedServerName> = Vec::new();
        if let Some(hint) = origin_hint {
            origins.push(hint.to_owned());
        }
        if let Ok(room_origins) = services().rooms.state.room_servers(&key.room_id) {
            for origin in room_origins {
                if origin != services().globals.server_name()
                    && !origins.contains(&origin)
                {
                    origins.push(origin);
                }
            }
        }

        // Origins with failure streaks demote to the back of the order.
        let mut keyed = Vec::with_capacity(origins.len());
        for origin in origins {
            let streak = services().peers.failure_streak(&origin).await;
            keyed.push((streak, origin));
        }
        keyed.sort_by_key(|(streak, _)| *streak);

        let mut last_error: Arc<Error> =
            Arc::new(Error::NotFound("no origin could satisfy the fetch"));

        for (_, origin) in keyed {
            if request.attempted.contains(&origin) {
                continue;
            }
            if services().peers.is_latched(&origin).await {
                debug!(%origin, "fetch skipping latched origin");
                continue;
            }
            request.attempted.insert(origin.clone());
            request.origin = Some(origin.clone());

            match self.attempt_one(key, &origin).await {
                Ok(()) => return Ok(()),
                Err(error) => {
                    warn!(%origin, %error, op = ?key.op, event_id = %key.event_id, "fetch attempt failed");
                    last_error = Arc::new(error);
                }
            }
        }

        Err(last_error)
    }

    async fn attempt_one(&self, key: &FetchKey, origin: &ServerName) -> Result<()> {
        let timeout = Duration::from_secs(services().globals.config.federation_timeout_s);

        let (path, pdu_field): (String, &str) = match key.op {
            FetchOp::Event => (
                format!("/_matrix/federation/v1/event/{}", key.event_id),
                "pdus",
            ),
            FetchOp::Auth => (
                format!(
                    "/_matrix/federation/v1/event_auth/{}/{}",
                    key.room_id, key.event_id
                ),
                "auth_chain",
            ),
            FetchOp::State => (
                format!(
                    "/_matrix/federation/v1/state/{}?event_id={}",
                    key.room_id, key.event_id
                ),
                "pdus",
            ),
            FetchOp::Backfill => (
                format!(
                    "/_matrix/federation/v1/backfill/{}?event_id={}&limit=50",
                    key.room_id, key.event_id
                ),
                "pdus",
            ),
        };

        let response = services()
            .peers
            .request(origin, Method::GET, &path, None, timeout)
            .await?;

        let pdus = response
            .get(pdu_field)
            .and_then(|v| v.as_array())
            .ok_or(Error::BadServerResponse(
                origin.to_owned(),
                "fetch response has no pdus",
            ))?;

        // Fetched events re-enter the pipeline with recursive expansion
        // softened so a deep gap cannot blow the budget.
        let mut opts = EvalOpts::federation();
        opts.replays = true;
        opts.room_head_resolve = true;
        opts.nothrows = opts.nothrows.with(Phase::FetchPrev);

        let mut admitted = 0usize;
        for pdu in pdus {
            let raw = to_raw_value(pdu).expect("fetched json serializes");
            match services()
                .vm
                .eval_boxed(Some(origin), &raw, opts.clone())
                .await
            {
                Ok(_) => admitted += 1,
                Err(fault) => {
                    warn!(phase = fault.phase().name(), "fetched event rejected");
                }
            }
        }

        debug!(admitted, total = pdus.len(), "fetch batch evaluated");

        // An event fetch succeeds only if the requested event itself is now
        // known; chain, state and backfill fetches succeed on any progress.
        let satisfied = match key.op {
            FetchOp::Event => services()
                .rooms
                .short
                .get_eventidx(&key.event_id)?
                .is_some(),
            _ => admitted > 0,
        };
        if satisfied {
            Ok(())
        } else {
            Err(Error::NotFound("origin could not satisfy the fetch"))
        }
    }
}

impl Default for Service {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils;

    /// Test: a fetch for an event no origin can provide terminates with a
    /// terminal eptr and records its attempt set
    #[tokio::test]
    async fn test_fetch_without_origins_terminates() {
        let services = test_utils::init_services().await;
        let (room_id, _) = test_utils::create_test_room(services).await;

        let missing: OwnedEventId = "$missing:nowhere.example".try_into().unwrap();
        let err = services
            .fetch
            .event(&room_id, &missing, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)));

        let key = FetchKey {
            op: FetchOp::Event,
            room_id,
            event_id: missing,
        };
        let record = services.fetch.last_request(&key).await.unwrap();
        assert!(record.finished);
        assert!(record.eptr.is_some());
        assert!(record.attempted.is_empty(), "no remote origins exist");
    }
}
