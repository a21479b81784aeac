// =============================================================================
// Orbiton Matrix Homeserver Core - Event Store Surface
// =============================================================================
//
// Project: Orbiton - Federated Matrix Homeserver Core
// Contributors: Orbiton Development Team
// License: Apache 2.0 / MIT
//
// Description:
//   Narrow read APIs over the content-addressed event log, the batched commit
//   path the evaluation pipeline drives, redaction projection, bulk purge and
//   the secondary-index repair routines. Every secondary index is a
//   deterministic function of the primary record and lands in the same
//   transaction as the primary row.
//
// Architecture:
//   • Reads by primary key only; the cached-only mode never touches the engine
//   • One commit transaction per event; readers observe all deltas or none
//   • Redaction keeps the event and its indexes, stripping only content
//
// =============================================================================

mod data;

use std::sync::Arc;

pub use data::Data;

use ruma::{
    canonical_json::to_canonical_value,
    events::{room::create::RoomCreateEventContent, TimelineEventType},
    uint, CanonicalJsonObject, CanonicalJsonValue, EventId, MilliSecondsSinceUnixEpoch, RoomId,
    UserId,
};
use serde_json::value::to_raw_value;
use tracing::{debug, info, warn};

use crate::{
    service::pdu::{EventHash, PduBuilder, PduEvent},
    services,
    utils,
    Error, Result,
};

use super::{EventIdFormat, RoomVersion};

/// Everything the WRITE phase hands the store for one event, primary record
/// plus the resolved reference targets the derived columns need.
pub struct EventCommit {
    pub idx: u64,
    pub pdu: Arc<PduEvent>,
    pub json: CanonicalJsonObject,
    /// Written for reference and forwarded causality, but not applied to the
    /// head set or current state.
    pub soft_failed: bool,
    /// prev_events with their local indexes; None marks a horizon gap.
    pub prev_refs: Vec<(Arc<EventId>, Option<u64>)>,
    /// auth_events with their local indexes; None marks a horizon gap.
    pub auth_refs: Vec<(Arc<EventId>, Option<u64>)>,
    /// Index of the state event this one supersedes in its slot, if any.
    pub prev_state_idx: Option<u64>,
    /// Whether the event takes its `(type, state_key)` slot on commit.
    pub apply_state: bool,
    /// Whether the commit updates the head set.
    pub update_head: bool,
}

pub struct Service {
    pub db: &'static dyn Data,
}

impl Service {
    /// Returns the pdu, preferring the in-memory cache.
    #[tracing::instrument(skip(self))]
    pub fn get_pdu(&self, event_id: &EventId) -> Result<Option<Arc<PduEvent>>> {
        if let Some(pdu) = self.db.get_pdu_cached(event_id)? {
            return Ok(Some(pdu));
        }

        let Some(idx) = services().rooms.short.get_eventidx(event_id)? else {
            return Ok(None);
        };

        self.get_pdu_by_idx(idx)
    }

    /// Cached-only read: never issues engine I/O. Fails INCOMPLETE on a miss
    /// so hot paths can decide whether to block instead.
    pub fn get_pdu_nonblocking(&self, event_id: &EventId) -> Result<Arc<PduEvent>> {
        self.db
            .get_pdu_cached(event_id)?
            .ok_or(Error::Incomplete)
    }

    #[tracing::instrument(skip(self))]
    pub fn get_pdu_by_idx(&self, idx: u64) -> Result<Option<Arc<PduEvent>>> {
        let Some(json) = self.db.get_pdu_json(idx)? else {
            return Ok(None);
        };

        let pdu: PduEvent = serde_json::from_value(
            serde_json::to_value(&json).expect("CanonicalJsonObject is a valid value"),
        )
        .map_err(|_| Error::bad_database("event in db is not a valid PDU"))?;

        let pdu = Arc::new(pdu);
        self.db.cache_pdu(&pdu.event_id, Arc::clone(&pdu));
        Ok(Some(pdu))
    }

    pub fn get_pdu_json(&self, event_id: &EventId) -> Result<Option<CanonicalJsonObject>> {
        let Some(idx) = services().rooms.short.get_eventidx(event_id)? else {
            return Ok(None);
        };
        self.db.get_pdu_json(idx)
    }

    pub fn get_pdu_json_by_idx(&self, idx: u64) -> Result<Option<CanonicalJsonObject>> {
        self.db.get_pdu_json(idx)
    }

    /// Narrow single-field read off the field fan-out column.
    pub fn get_field(&self, idx: u64, field: &str) -> Result<Option<CanonicalJsonValue>> {
        self.db.get_field(idx, field)
    }

    pub fn is_soft_failed(&self, idx: u64) -> Result<bool> {
        self.db.is_soft_failed(idx)
    }

    /// Index of the redaction applied to an event, if any.
    pub fn redacted_by(&self, idx: u64) -> Result<Option<u64>> {
        self.db.redacted_by(idx)
    }

    pub fn room_id_of(&self, idx: u64) -> Result<Option<ruma::OwnedRoomId>> {
        match self.get_field(idx, "room_id")? {
            Some(CanonicalJsonValue::String(room)) => Ok(Some(
                ruma::RoomId::parse(room.as_str())
                    .map_err(|_| Error::bad_database("invalid room_id field in db"))?
                    .to_owned(),
            )),
            Some(_) => Err(Error::bad_database("room_id field in db is not a string")),
            None => Ok(None),
        }
    }

    pub fn depth_of(&self, idx: u64) -> Result<Option<u64>> {
        match self.get_field(idx, "depth")? {
            Some(CanonicalJsonValue::Integer(depth)) => Ok(Some(
                u64::try_from(i64::from(depth))
                    .map_err(|_| Error::bad_database("negative depth in db"))?,
            )),
            Some(_) => Err(Error::bad_database("depth field in db is not an integer")),
            None => Ok(None),
        }
    }

    /// Events in a room ordered by (depth, idx); ascending causal order.
    pub fn room_events(&self, room_id: &RoomId) -> Result<Vec<(u64, u64)>> {
        self.db.room_events_by_depth(room_id)
    }

    pub fn events_by_sender(&self, sender: &UserId) -> Result<Vec<u64>> {
        self.db.index_scan("sender_eventidx", sender.as_bytes())
    }

    pub fn events_by_type(&self, kind: &TimelineEventType) -> Result<Vec<u64>> {
        self.db
            .index_scan("type_eventidx", kind.to_string().as_bytes())
    }

    pub fn events_by_origin(&self, origin: &ruma::ServerName) -> Result<Vec<u64>> {
        self.db.index_scan("origin_eventidx", origin.as_bytes())
    }

    /// The single commit entry: applies the event and every derived index
    /// atomically. By this point the event is fully authenticated; no auth
    /// happens here.
    #[tracing::instrument(skip(self, commit), fields(idx = commit.idx, event_id = %commit.pdu.event_id))]
    pub fn append_pdu(&self, commit: &EventCommit) -> Result<()> {
        self.db.persist(commit)?;
        self.db
            .cache_pdu(&commit.pdu.event_id, Arc::clone(&commit.pdu));

        debug!(
            soft_failed = commit.soft_failed,
            "appended event to the store"
        );
        Ok(())
    }

    /// Applies a redaction to its target: content is stripped to the room
    /// version's preserved set; the target keeps its idx and every index.
    #[tracing::instrument(skip(self, reason))]
    pub fn redact_pdu(
        &self,
        target_id: &EventId,
        reason: &PduEvent,
        reason_idx: u64,
        room_version: &RoomVersion,
    ) -> Result<()> {
        let Some(target_idx) = services().rooms.short.get_eventidx(target_id)? else {
            // Redactions of unseen events are valid; the mark applies when
            // the target arrives.
            warn!(%target_id, "redaction target is not known locally");
            return Ok(());
        };

        let Some(mut pdu) = self.get_pdu_by_idx(target_idx)? else {
            return Err(Error::bad_database("event index without event json"));
        };

        let pdu_mut = Arc::make_mut(&mut pdu);
        pdu_mut.redact(&room_version.rules.redaction, reason)?;
        let json = pdu_mut.to_canonical_object()?;

        self.db
            .replace_pdu_json(target_idx, &json, Some(reason_idx))?;
        self.db.cache_pdu(target_id, pdu);

        info!(%target_id, by = %reason.event_id, "event redacted");
        Ok(())
    }

    /// Bulk deletion of a room across every column keyed by it, including
    /// the per-event rows of its events.
    #[tracing::instrument(skip(self))]
    pub fn purge_room(&self, room_id: &RoomId) -> Result<u64> {
        let purged = self.db.purge_room(room_id)?;
        info!(%room_id, purged, "room purged from the store");
        Ok(purged)
    }

    /// On-demand reverse check of one event's derived rows. Drift surfaces
    /// as a repairable-inconsistency signal.
    pub fn verify_index(&self, idx: u64) -> Result<()> {
        self.db.verify_index(idx)
    }

    /// Regenerates one secondary column from the primary records.
    #[tracing::instrument(skip(self))]
    pub fn rebuild_index(&self, tree: &'static str) -> Result<u64> {
        let rebuilt = self.db.rebuild_index(tree)?;
        info!(tree, rebuilt, "secondary index rebuilt");
        Ok(rebuilt)
    }

    /// Builds, hashes and signs a locally-authored event on the current
    /// heads. The caller owns the room lock; evaluation happens in the VM.
    pub fn create_event(
        &self,
        pdu_builder: PduBuilder,
        sender: &UserId,
        room_id: &RoomId,
    ) -> Result<(PduEvent, CanonicalJsonObject)> {
        let PduBuilder {
            event_type,
            content,
            unsigned,
            state_key,
            redacts,
            timestamp,
        } = pdu_builder;

        let prev_events: Vec<Arc<EventId>> = services()
            .rooms
            .head
            .heads(room_id)?
            .into_iter()
            .map(|(event_id, _)| Arc::from(&*event_id))
            .take(20)
            .collect();

        // If there is no create event yet, we are creating the room.
        let room_version = match services().rooms.state.room_version(room_id) {
            Ok(version) => version,
            Err(_) if event_type == TimelineEventType::RoomCreate => {
                let content: RoomCreateEventContent = serde_json::from_str(content.get())
                    .map_err(|_| Error::BadJson("invalid content in create event".to_owned()))?;
                RoomVersion::new(&content.room_version)?
            }
            Err(e) => return Err(e),
        };

        let auth_events = services().rooms.state.auth_events_for(
            room_id,
            &event_type,
            sender,
            state_key.as_deref(),
            &content,
        )?;

        let mut depth = uint!(0);
        for event_id in &prev_events {
            if let Some(pdu) = self.get_pdu(event_id)? {
                depth = std::cmp::max(depth, pdu.depth + uint!(1));
            }
        }

        let mut unsigned = unsigned.unwrap_or_default();
        if let Some(state_key) = &state_key {
            if let Some(prev_pdu) =
                services()
                    .rooms
                    .state
                    .room_state_get(room_id, &event_type.to_string(), state_key)?
            {
                unsigned.insert(
                    "prev_content".to_owned(),
                    serde_json::from_str(prev_pdu.content.get())
                        .expect("stored content is valid json"),
                );
                unsigned.insert(
                    "prev_sender".to_owned(),
                    serde_json::to_value(&prev_pdu.sender).expect("UserId serializes"),
                );
            }
        }

        let mut pdu = PduEvent {
            event_id: ruma::event_id!("$thiswillbefilledinlater").into(),
            room_id: room_id.to_owned(),
            sender: sender.to_owned(),
            origin: Some(services().globals.server_name().to_owned()),
            origin_server_ts: timestamp
                .map(|ts| ts.get())
                .unwrap_or_else(|| MilliSecondsSinceUnixEpoch::now().get()),
            kind: event_type,
            content,
            state_key,
            prev_events,
            depth,
            auth_events: auth_events
                .values()
                .map(|pdu| pdu.event_id.clone())
                .collect(),
            redacts,
            unsigned: if unsigned.is_empty() {
                None
            } else {
                Some(to_raw_value(&unsigned).expect("to_raw_value always works"))
            },
            hashes: EventHash {
                sha256: "aaa".to_owned(),
            },
            signatures: None,
        };

        // Must hold against its own auth selection before we bother signing.
        let auth_set =
            super::event_auth::AuthSet::new(auth_events.values().cloned().collect());
        super::event_auth::check(&pdu, &room_version, &auth_set)?;

        let mut pdu_json = utils::to_canonical_object(&pdu)?;
        pdu_json.remove("event_id");
        pdu_json.insert(
            "origin".to_owned(),
            to_canonical_value(services().globals.server_name())
                .expect("server name is a valid CanonicalJsonValue"),
        );

        ruma::signatures::hash_and_sign_event(
            services().globals.server_name().as_str(),
            services().globals.keypair(),
            &mut pdu_json,
            &room_version.rules.redaction,
        )
        .map_err(|e| match e {
            ruma::signatures::Error::PduSize => {
                Error::BadRequest(ruma::api::client::error::ErrorKind::TooLarge, "event is too large")
            }
            _ => Error::Internal(format!("signing event failed: {e}")),
        })?;

        pdu.event_id = match room_version.event_id_format {
            EventIdFormat::ReferenceHash => EventId::parse_arc(format!(
                "${}",
                ruma::signatures::reference_hash(&pdu_json, &room_version.rules)
                    .expect("event format validated when event was hashed")
            ))
            .expect("ruma's reference hashes are valid event ids"),
            EventIdFormat::ServerAssigned => EventId::parse_arc(format!(
                "${}:{}",
                utils::random_string(18),
                services().globals.server_name()
            ))
            .expect("locally generated event ids are valid"),
        };

        pdu_json.insert(
            "event_id".to_owned(),
            CanonicalJsonValue::String(pdu.event_id.as_str().to_owned()),
        );

        // Mirror the signed material back into the typed event.
        if let Some(CanonicalJsonValue::Object(hashes)) = pdu_json.get("hashes") {
            if let Some(CanonicalJsonValue::String(sha256)) = hashes.get("sha256") {
                pdu.hashes = EventHash {
                    sha256: sha256.clone(),
                };
            }
        }
        if let Some(signatures) = pdu_json.get("signatures") {
            pdu.signatures = Some(
                to_raw_value(signatures).expect("canonical value serializes"),
            );
        }

        Ok((pdu, pdu_json))
    }

    /// First event of a room in causal order, if any.
    pub fn first_pdu_in_room(&self, room_id: &RoomId) -> Result<Option<Arc<PduEvent>>> {
        match self.room_events(room_id)?.first() {
            Some((_, idx)) => self.get_pdu_by_idx(*idx),
            None => Ok(None),
        }
    }

    pub fn room_exists(&self, room_id: &RoomId) -> Result<bool> {
        Ok(!self.room_events(room_id)?.is_empty())
    }
}
