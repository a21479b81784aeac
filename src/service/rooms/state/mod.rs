// =============================================================================
// Orbiton Matrix Homeserver Core - Room State
// =============================================================================
//
// Project: Orbiton - Federated Matrix Homeserver Core
// Contributors: Orbiton Development Team
// License: Apache 2.0 / MIT
//
// Description:
//   The resolved (type, state_key) → event mapping of each room: reads off
//   the current-state column, the write-side auth-events selection, state at
//   a set of prev events computed from the DAG, and the full recompute that
//   re-runs resolution at the heads.
//
// =============================================================================

mod data;

use std::{
    collections::{BTreeMap, BTreeSet, BinaryHeap, HashSet},
    sync::Arc,
};

pub use data::Data;

use ruma::{
    events::TimelineEventType, EventId, OwnedServerName, RoomId, ServerName, UserId,
};
use serde::Deserialize;
use serde_json::value::RawValue as RawJsonValue;
use tracing::{debug, info, warn};

use crate::{
    service::{
        pdu::PduEvent,
        rooms::{event_auth, state_res, RoomVersion},
    },
    services, Error, Result,
};

pub struct Service {
    pub db: &'static dyn Data,
}

impl Service {
    /// Current occupant of a state slot.
    pub fn room_state_get(
        &self,
        room_id: &RoomId,
        kind: &str,
        state_key: &str,
    ) -> Result<Option<Arc<PduEvent>>> {
        match self.db.state_get_idx(room_id, kind, state_key)? {
            Some(idx) => services().rooms.timeline.get_pdu_by_idx(idx),
            None => Ok(None),
        }
    }

    pub fn room_state_get_idx(
        &self,
        room_id: &RoomId,
        kind: &str,
        state_key: &str,
    ) -> Result<Option<u64>> {
        self.db.state_get_idx(room_id, kind, state_key)
    }

    /// Full current state as (type, state_key) → idx.
    pub fn full_state(&self, room_id: &RoomId) -> Result<state_res::StateMap> {
        Ok(self.db.state_full(room_id)?.into_iter().collect())
    }

    /// Per-slot history in depth order, from the state-node column.
    pub fn state_history(
        &self,
        room_id: &RoomId,
        kind: &str,
        state_key: &str,
    ) -> Result<Vec<(u64, u64)>> {
        self.db.state_history(room_id, kind, state_key)
    }

    /// The room's immutable version, read off the create event.
    pub fn room_version(&self, room_id: &RoomId) -> Result<RoomVersion> {
        #[derive(Deserialize)]
        struct ExtractVersion {
            #[serde(default = "default_version")]
            room_version: ruma::RoomVersionId,
        }
        fn default_version() -> ruma::RoomVersionId {
            ruma::RoomVersionId::V1
        }

        let create = self
            .room_state_get(room_id, "m.room.create", "")?
            .ok_or(Error::NotFound("room has no create event"))?;

        let content: ExtractVersion = serde_json::from_str(create.content.get())
            .map_err(|_| Error::bad_database("invalid create event content in db"))?;

        RoomVersion::new(&content.room_version)
    }

    /// Write-side auth selection: the current values of create, power
    /// levels, join rules (for membership joins/invites), the sender's
    /// membership, and the target's membership when it differs.
    #[tracing::instrument(skip(self, content))]
    pub fn auth_events_for(
        &self,
        room_id: &RoomId,
        kind: &TimelineEventType,
        sender: &UserId,
        state_key: Option<&str>,
        content: &RawJsonValue,
    ) -> Result<BTreeMap<(String, String), Arc<PduEvent>>> {
        let mut selected = BTreeMap::new();
        let mut push = |kind: &str, state_key: &str| -> Result<()> {
            if let Some(pdu) = self.room_state_get(room_id, kind, state_key)? {
                selected.insert((kind.to_owned(), state_key.to_owned()), pdu);
            }
            Ok(())
        };

        if *kind == TimelineEventType::RoomCreate {
            return Ok(selected);
        }

        push("m.room.create", "")?;
        push("m.room.power_levels", "")?;

        if *kind == TimelineEventType::RoomMember {
            #[derive(Deserialize)]
            struct ExtractMembership {
                membership: String,
            }
            let membership = serde_json::from_str::<ExtractMembership>(content.get())
                .map(|c| c.membership)
                .unwrap_or_default();
            if membership == "join" || membership == "invite" {
                push("m.room.join_rules", "")?;
            }
        }

        push("m.room.member", sender.as_str())?;

        if let Some(state_key) = state_key {
            if state_key != sender.as_str() && state_key.starts_with('@') {
                push("m.room.member", state_key)?;
            }
        }

        Ok(selected)
    }

    /// State before an event: per-branch latest slot occupants collected by
    /// a backwards walk from each prev, resolved across branches.
    #[tracing::instrument(skip(self, prev_events))]
    pub fn state_at_prevs(
        &self,
        room_id: &RoomId,
        prev_events: &[Arc<EventId>],
    ) -> Result<state_res::StateMap> {
        let room_version = self.room_version(room_id)?;

        let mut branch_states = Vec::with_capacity(prev_events.len());
        for prev in prev_events {
            branch_states.push(self.branch_state(prev)?);
        }

        let fetch = |idx: u64| {
            services()
                .rooms
                .timeline
                .get_pdu_by_idx(idx)
                .ok()
                .flatten()
        };
        let idx_of = |event_id: &EventId| {
            services()
                .rooms
                .short
                .get_eventidx(event_id)
                .ok()
                .flatten()
        };
        let ctx = state_res::Context {
            fetch: &fetch,
            idx_of: &idx_of,
        };

        state_res::resolve(&room_version, &branch_states, &ctx)
    }

    /// State at one event, the event's own slot included: the federation
    /// `/state` projection.
    pub fn state_at_event(
        &self,
        room_id: &RoomId,
        event_id: &EventId,
    ) -> Result<state_res::StateMap> {
        let mut state = self.branch_state(event_id)?;
        if let Some(idx) = services().rooms.short.get_eventidx(event_id)? {
            if let Some(pdu) = services().rooms.timeline.get_pdu_by_idx(idx)? {
                if pdu.room_id != room_id {
                    return Err(Error::NotFound("event is not in this room"));
                }
                if let Some(state_key) = &pdu.state_key {
                    state.insert((pdu.kind.to_string(), state_key.clone()), idx);
                }
            }
        }
        Ok(state)
    }

    /// Latest state per slot along one branch: a backwards walk in depth
    /// order; the deepest occupant wins a slot, with the event id breaking
    /// same-depth ties so every honest server agrees.
    fn branch_state(&self, tip: &EventId) -> Result<state_res::StateMap> {
        let mut slots: BTreeMap<(String, String), (u64, String, u64)> = BTreeMap::new();
        let mut queue: BinaryHeap<(u64, u64)> = BinaryHeap::new();
        let mut visited = HashSet::new();

        let Some(tip_idx) = services().rooms.short.get_eventidx(tip)? else {
            return Err(Error::NotFound("branch tip is not locally known"));
        };
        let tip_depth = services()
            .rooms
            .timeline
            .depth_of(tip_idx)?
            .unwrap_or_default();
        queue.push((tip_depth, tip_idx));
        visited.insert(tip_idx);

        while let Some((depth, idx)) = queue.pop() {
            let Some(pdu) = services().rooms.timeline.get_pdu_by_idx(idx)? else {
                continue;
            };

            if let Some(state_key) = &pdu.state_key {
                let slot = (pdu.kind.to_string(), state_key.clone());
                let candidate = (depth, pdu.event_id.to_string(), idx);
                match slots.get(&slot) {
                    Some(existing) if *existing >= candidate => {}
                    _ => {
                        slots.insert(slot, candidate);
                    }
                }
            }

            for prev in &pdu.prev_events {
                let Some(prev_idx) = services().rooms.short.get_eventidx(prev)? else {
                    // Horizon gap behind this branch; the walk covers what
                    // is locally known.
                    warn!(missing = %prev, "state walk hit the event horizon");
                    continue;
                };
                if visited.insert(prev_idx) {
                    let prev_depth = services()
                        .rooms
                        .timeline
                        .depth_of(prev_idx)?
                        .unwrap_or_default();
                    queue.push((prev_depth, prev_idx));
                }
            }
        }

        Ok(slots
            .into_iter()
            .map(|(slot, (_, _, idx))| (slot, idx))
            .collect())
    }

    /// Recomputes the current-state column from scratch at the heads. Each
    /// branch walk includes its tip, so resolution alone decides the slots.
    #[tracing::instrument(skip(self))]
    pub fn recompute(&self, room_id: &RoomId) -> Result<usize> {
        let heads = services().rooms.head.heads(room_id)?;
        let prev_ids: Vec<Arc<EventId>> = heads
            .iter()
            .map(|(event_id, _)| Arc::from(&**event_id))
            .collect();

        let resolved = self.state_at_prevs(room_id, &prev_ids)?;

        let entries: Vec<((String, String), u64)> = resolved.into_iter().collect();
        self.db.set_state(room_id, &entries)?;
        info!(%room_id, slots = entries.len(), "room state recomputed");
        Ok(entries.len())
    }

    /// Auth selection out of an arbitrary resolved state map, for checks
    /// against historical state (the pipeline's prev-state pass).
    pub fn auth_set_from_map(
        &self,
        state: &state_res::StateMap,
        event: &PduEvent,
    ) -> Result<event_auth::AuthSet> {
        let mut events = Vec::new();
        let mut push = |kind: &str, state_key: &str| -> Result<()> {
            if let Some(idx) = state.get(&(kind.to_owned(), state_key.to_owned())) {
                if let Some(pdu) = services().rooms.timeline.get_pdu_by_idx(*idx)? {
                    events.push(pdu);
                }
            }
            Ok(())
        };

        push("m.room.create", "")?;
        push("m.room.power_levels", "")?;
        push("m.room.member", event.sender.as_str())?;
        if event.kind == TimelineEventType::RoomMember {
            push("m.room.join_rules", "")?;
            if let Some(state_key) = event.state_key.as_deref() {
                if state_key != event.sender.as_str() {
                    push("m.room.member", state_key)?;
                }
            }
        }

        Ok(event_auth::AuthSet::new(events))
    }

    /// Membership value of a user in the current state.
    pub fn user_membership(&self, room_id: &RoomId, user_id: &UserId) -> Result<Option<String>> {
        Ok(self
            .room_state_get(room_id, "m.room.member", user_id.as_str())?
            .and_then(|pdu| event_auth::membership(&pdu)))
    }

    /// Distinct servers with at least one joined user; the fan-out's origin
    /// enumeration.
    pub fn room_servers(&self, room_id: &RoomId) -> Result<Vec<OwnedServerName>> {
        let mut servers = BTreeSet::new();
        for ((kind, state_key), idx) in self.db.state_full(room_id)? {
            if kind != "m.room.member" {
                continue;
            }
            let Some(pdu) = services().rooms.timeline.get_pdu_by_idx(idx)? else {
                continue;
            };
            if event_auth::membership(&pdu).as_deref() != Some("join") {
                continue;
            }
            if let Ok(user_id) = <&UserId>::try_from(state_key.as_str()) {
                servers.insert(user_id.server_name().to_owned());
            }
        }
        Ok(servers.into_iter().collect())
    }

    /// Server ACL check against the current m.room.server_acl content.
    pub fn server_acl_allows(&self, room_id: &RoomId, server: &ServerName) -> Result<bool> {
        #[derive(Deserialize)]
        struct AclContent {
            #[serde(default)]
            allow: Option<Vec<String>>,
            #[serde(default)]
            deny: Vec<String>,
        }

        let Some(acl_event) = self.room_state_get(room_id, "m.room.server_acl", "")? else {
            return Ok(true);
        };
        let Ok(acl) = serde_json::from_str::<AclContent>(acl_event.content.get()) else {
            warn!(%room_id, "unparsable m.room.server_acl content");
            return Ok(true);
        };

        let name = server.as_str();
        if acl.deny.iter().any(|pattern| glob_match(pattern, name)) {
            return Ok(false);
        }
        match acl.allow {
            Some(allow) => Ok(allow.iter().any(|pattern| glob_match(pattern, name))),
            None => Ok(true),
        }
    }

    /// Whether a user may redact the target, under the current state.
    pub fn user_can_redact(
        &self,
        room_id: &RoomId,
        sender: &UserId,
        target_id: &EventId,
    ) -> Result<bool> {
        let Some(target) = services().rooms.timeline.get_pdu(target_id)? else {
            return Ok(false);
        };

        let auth_events = self.auth_events_for(
            room_id,
            &TimelineEventType::RoomRedaction,
            sender,
            None,
            &serde_json::value::to_raw_value(&serde_json::json!({}))
                .expect("empty object serializes"),
        )?;
        let auth = event_auth::AuthSet::new(auth_events.into_values().collect());
        let levels = event_auth::PowerLevels::from_auth(&auth);
        let sender_level = levels.user_level(sender.as_str(), &auth);

        Ok(event_auth::user_can_redact(
            sender,
            sender_level,
            levels.redact,
            &target,
        ))
    }

    pub fn is_disabled(&self, room_id: &RoomId) -> Result<bool> {
        self.db.is_disabled(room_id)
    }

    pub fn set_disabled(&self, room_id: &RoomId, disabled: bool) -> Result<()> {
        debug!(%room_id, disabled, "room federation toggle");
        self.db.set_disabled(room_id, disabled)
    }
}

/// Matches `*` (any run) and `?` (any one char); the server ACL dialect.
fn glob_match(pattern: &str, value: &str) -> bool {
    fn inner(pattern: &[u8], value: &[u8]) -> bool {
        match (pattern.first(), value.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                inner(&pattern[1..], value)
                    || (!value.is_empty() && inner(pattern, &value[1..]))
            }
            (Some(b'?'), Some(_)) => inner(&pattern[1..], &value[1..]),
            (Some(p), Some(v)) if p == v => inner(&pattern[1..], &value[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), value.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::glob_match;

    /// Test: the server ACL glob dialect
    #[test]
    fn test_glob_match() {
        assert!(glob_match("*", "anything.example"));
        assert!(glob_match("*.example.com", "host.example.com"));
        assert!(!glob_match("*.example.com", "example.com"));
        assert!(glob_match("host?.example", "host1.example"));
        assert!(!glob_match("host?.example", "host12.example"));
        assert!(glob_match("exact.example", "exact.example"));
        assert!(!glob_match("exact.example", "other.example"));
    }
}
