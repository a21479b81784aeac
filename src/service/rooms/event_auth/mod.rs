// =============================================================================
// Orbiton Matrix Homeserver Core - Event Authorization Rules
// =============================================================================
//
// Project: Orbiton - Federated Matrix Homeserver Core
// Contributors: Orbiton Development Team
// License: Apache 2.0 / MIT
//
// Description:
//   The fixed authorization rule pipeline. Rules run in order and
//   short-circuit on the first failure; failures carry the rule name and a
//   human-readable reason. Rules 1, 4, 5, 7, 10 and 11 dispatch on the event
//   type, the rest are universal. The pipeline operates over the event and
//   its resolved auth references only; it never consults the store.
//
// =============================================================================

use std::{collections::BTreeMap, sync::Arc};

use ruma::{events::TimelineEventType, UserId};
use serde::Deserialize;
use tracing::trace;

use crate::{
    service::{pdu::PduEvent, rooms::EventIdFormat},
    Error, Result,
};

use super::RoomVersion;

/// The resolved auth references an authorization check runs against.
pub struct AuthSet {
    events: Vec<Arc<PduEvent>>,
}

impl AuthSet {
    pub fn new(events: Vec<Arc<PduEvent>>) -> Self {
        Self { events }
    }

    pub fn get(&self, kind: &str, state_key: &str) -> Option<&Arc<PduEvent>> {
        self.events.iter().find(|pdu| {
            pdu.kind.to_string() == kind && pdu.state_key.as_deref() == Some(state_key)
        })
    }

    pub fn create(&self) -> Option<&Arc<PduEvent>> {
        self.get("m.room.create", "")
    }

    pub fn power_levels(&self) -> Option<&Arc<PduEvent>> {
        self.get("m.room.power_levels", "")
    }

    pub fn join_rules(&self) -> Option<&Arc<PduEvent>> {
        self.get("m.room.join_rules", "")
    }

    pub fn member(&self, user_id: &str) -> Option<&Arc<PduEvent>> {
        self.get("m.room.member", user_id)
    }

    pub fn events(&self) -> &[Arc<PduEvent>] {
        &self.events
    }
}

fn fail(rule: &'static str, reason: impl Into<String>) -> Error {
    Error::AuthFail {
        rule,
        reason: reason.into(),
    }
}

#[derive(Deserialize)]
struct ExtractMembership {
    membership: String,
}

/// Membership of an m.room.member event's content, if parseable.
pub fn membership(pdu: &PduEvent) -> Option<String> {
    serde_json::from_str::<ExtractMembership>(pdu.content.get())
        .ok()
        .map(|c| c.membership)
}

#[derive(Deserialize)]
struct ExtractCreator {
    creator: String,
}

#[derive(Deserialize)]
struct ExtractJoinRule {
    join_rule: String,
}

/// Lenient power-levels projection: levels may arrive as integers or, in
/// older rooms, as strings.
#[derive(Debug, Clone)]
pub struct PowerLevels {
    pub users: BTreeMap<String, i64>,
    pub users_default: i64,
    pub events: BTreeMap<String, i64>,
    pub events_default: i64,
    pub state_default: i64,
    pub ban: i64,
    pub kick: i64,
    pub redact: i64,
    pub invite: i64,
    /// Whether an m.room.power_levels event backs these values.
    pub from_event: bool,
}

fn level_of(value: &serde_json::Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

fn level_map(value: Option<&serde_json::Value>) -> BTreeMap<String, i64> {
    value
        .and_then(|v| v.as_object())
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| Some((k.clone(), level_of(v)?)))
                .collect()
        })
        .unwrap_or_default()
}

impl PowerLevels {
    /// Levels in effect given the auth set. Without a power_levels event the
    /// creator holds 100 and every threshold is 0.
    pub fn from_auth(auth: &AuthSet) -> Self {
        let Some(pl_event) = auth.power_levels() else {
            return Self {
                users: BTreeMap::new(),
                users_default: 0,
                events: BTreeMap::new(),
                events_default: 0,
                state_default: 0,
                ban: 0,
                kick: 0,
                redact: 0,
                invite: 0,
                from_event: false,
            };
        };

        let content: serde_json::Value =
            serde_json::from_str(pl_event.content.get()).unwrap_or_default();
        let field = |name: &str, default: i64| {
            content.get(name).and_then(level_of).unwrap_or(default)
        };

        Self {
            users: level_map(content.get("users")),
            users_default: field("users_default", 0),
            events: level_map(content.get("events")),
            events_default: field("events_default", 0),
            state_default: field("state_default", 50),
            ban: field("ban", 50),
            kick: field("kick", 50),
            redact: field("redact", 50),
            invite: field("invite", 0),
            from_event: true,
        }
    }

    pub fn user_level(&self, user_id: &str, auth: &AuthSet) -> i64 {
        if let Some(level) = self.users.get(user_id) {
            return *level;
        }
        if !self.from_event {
            // Without a power_levels event the creator holds 100.
            if let Some(create) = auth.create() {
                if let Ok(content) =
                    serde_json::from_str::<ExtractCreator>(create.content.get())
                {
                    if content.creator == user_id {
                        return 100;
                    }
                }
            }
        }
        self.users_default
    }

    /// Required level to send an event of this type.
    pub fn required_level(&self, event: &PduEvent) -> i64 {
        if let Some(level) = self.events.get(&event.kind.to_string()) {
            return *level;
        }
        if event.is_state() {
            self.state_default
        } else {
            self.events_default
        }
    }
}

/// Whether an event can shift power in the resolver's sense: create,
/// power_levels, join_rules, and membership changes done to another user.
pub fn is_power_event(pdu: &PduEvent) -> bool {
    match pdu.kind {
        TimelineEventType::RoomCreate
        | TimelineEventType::RoomPowerLevels
        | TimelineEventType::RoomJoinRules => true,
        TimelineEventType::RoomMember => {
            let Some(state_key) = pdu.state_key.as_deref() else {
                return false;
            };
            if state_key == pdu.sender.as_str() {
                return false;
            }
            matches!(membership(pdu).as_deref(), Some("leave") | Some("ban"))
        }
        _ => false,
    }
}

/// Runs the full rule pipeline. Short-circuits on the first failing rule.
#[tracing::instrument(skip_all, fields(event_id = %event.event_id, kind = %event.kind))]
pub fn check(event: &PduEvent, room_version: &RoomVersion, auth: &AuthSet) -> Result<()> {
    // 1. If type is m.room.create
    if event.kind == TimelineEventType::RoomCreate {
        return check_create(event);
    }

    // 2. Reject if event has auth_events that are malformed or outside the
    // selection algorithm.
    check_rule_2(event, auth)?;

    // 3. If event does not have an m.room.create in its auth_events, reject.
    if auth.create().is_none() {
        return Err(fail("rule_3", "missing m.room.create in auth_events"));
    }

    // 4. If type is m.room.aliases: allow (versions 1-5 check the domain).
    if event.kind == TimelineEventType::RoomAliases {
        return check_aliases(event, room_version);
    }

    // 5. If type is m.room.member
    if event.kind == TimelineEventType::RoomMember {
        return check_member(event, room_version, auth);
    }

    // 6. If the sender's current membership state is not join, reject.
    let sender_membership = auth
        .member(event.sender.as_str())
        .and_then(|m| membership(m));
    if sender_membership.as_deref() != Some("join") {
        return Err(fail("rule_6", "sender is not joined to room"));
    }

    // 7. If type is m.room.third_party_invite: sender needs invite level.
    if event.kind == TimelineEventType::RoomThirdPartyInvite {
        let levels = PowerLevels::from_auth(auth);
        if levels.user_level(event.sender.as_str(), auth) < levels.invite {
            return Err(fail(
                "rule_7",
                "sender has insufficient power to invite via third party",
            ));
        }
        return Ok(());
    }

    // 8. If the event type's required power level is greater than the
    // sender's power level, reject.
    let levels = PowerLevels::from_auth(auth);
    let sender_level = levels.user_level(event.sender.as_str(), auth);
    if sender_level < levels.required_level(event) {
        return Err(fail(
            "rule_8",
            format!(
                "sender has insufficient power for event type: {} < {}",
                sender_level,
                levels.required_level(event)
            ),
        ));
    }

    // 9. If the event has a state_key that starts with an @ and does not
    // match the sender, reject.
    if let Some(state_key) = event.state_key.as_deref() {
        if state_key.starts_with('@') && state_key != event.sender.as_str() {
            return Err(fail(
                "rule_9",
                "sender cannot set another user's mxid in a state_key",
            ));
        }
    }

    // 10. If type is m.room.power_levels
    if event.kind == TimelineEventType::RoomPowerLevels {
        return check_power_levels(event, &levels, sender_level);
    }

    // 11. If type is m.room.redaction
    if event.kind == TimelineEventType::RoomRedaction {
        return check_redaction(event, room_version, &levels, sender_level);
    }

    // 12. Otherwise, allow.
    trace!("event allowed");
    Ok(())
}

fn check_create(event: &PduEvent) -> Result<()> {
    if !event.prev_events.is_empty() {
        return Err(fail("rule_1", "create event cannot have prev_events"));
    }

    let room_domain = event
        .room_id
        .server_name()
        .map(|s| s.as_str())
        .unwrap_or_default();
    if room_domain != event.sender.server_name().as_str() {
        return Err(fail(
            "rule_1",
            "room_id domain does not match sender domain",
        ));
    }

    if serde_json::from_str::<ExtractCreator>(event.content.get()).is_err() {
        return Err(fail("rule_1", "create event has no creator"));
    }

    Ok(())
}

fn check_rule_2(event: &PduEvent, auth: &AuthSet) -> Result<()> {
    let events = auth.events();
    for (i, a) in events.iter().enumerate() {
        // a. duplicate entries for a given (type, state_key) pair
        for b in events.iter().skip(i + 1) {
            if a.kind == b.kind && a.state_key == b.state_key {
                return Err(fail(
                    "rule_2",
                    "duplicate (type, state_key) in auth_events",
                ));
            }
        }

        // aa. auth events from another room
        if a.room_id != event.room_id {
            return Err(fail(
                "rule_2",
                format!(
                    "auth event {} in {} cannot be used in {}",
                    a.event_id, a.room_id, event.room_id
                ),
            ));
        }

        // b. entries whose (type, state_key) the selection algorithm would
        // never produce
        let allowed = match a.kind {
            TimelineEventType::RoomCreate
            | TimelineEventType::RoomPowerLevels
            | TimelineEventType::RoomJoinRules => true,
            TimelineEventType::RoomMember => {
                a.state_key.as_deref() == Some(event.sender.as_str())
                    || a.state_key == event.state_key
            }
            _ => false,
        };
        if !allowed {
            return Err(fail(
                "rule_2",
                "reference in auth_events is not an auth event",
            ));
        }
    }

    Ok(())
}

fn check_aliases(event: &PduEvent, room_version: &RoomVersion) -> Result<()> {
    // Versions 1-5: the state_key must be the sender's domain. Version 6
    // dropped the special case.
    if room_version.special_case_aliases {
        if event.state_key.as_deref() != Some(event.sender.server_name().as_str()) {
            return Err(fail(
                "rule_4",
                "alias state_key does not match sender domain",
            ));
        }
    }
    Ok(())
}

fn check_member(event: &PduEvent, room_version: &RoomVersion, auth: &AuthSet) -> Result<()> {
    let Some(target) = event.state_key.as_deref() else {
        return Err(fail("rule_5", "member event without state_key"));
    };
    let Some(new_membership) = membership(event) else {
        return Err(fail("rule_5", "member event without membership"));
    };

    let sender_membership = auth
        .member(event.sender.as_str())
        .and_then(|m| membership(m))
        .unwrap_or_else(|| "leave".to_owned());
    let target_membership = auth
        .member(target)
        .and_then(|m| membership(m))
        .unwrap_or_else(|| "leave".to_owned());
    let join_rule = auth
        .join_rules()
        .and_then(|jr| serde_json::from_str::<ExtractJoinRule>(jr.content.get()).ok())
        .map(|c| c.join_rule)
        .unwrap_or_else(|| "invite".to_owned());

    let levels = PowerLevels::from_auth(auth);
    let sender_level = levels.user_level(event.sender.as_str(), auth);
    let target_level = levels.user_level(target, auth);

    match new_membership.as_str() {
        "join" => {
            // The creator's first join rides directly on the create event.
            if event.prev_events.len() == 1 {
                if let Some(create) = auth.create() {
                    if event.prev_events[0] == create.event_id {
                        let creator = serde_json::from_str::<ExtractCreator>(
                            create.content.get(),
                        )
                        .map(|c| c.creator)
                        .unwrap_or_default();
                        if creator == target && creator == event.sender.as_str() {
                            return Ok(());
                        }
                    }
                }
            }

            if event.sender.as_str() != target {
                return Err(fail("rule_5", "cannot join on behalf of another user"));
            }
            if target_membership == "ban" {
                return Err(fail("rule_5", "target is banned from the room"));
            }
            match join_rule.as_str() {
                "public" => Ok(()),
                "invite" | "knock" => {
                    if matches!(target_membership.as_str(), "join" | "invite") {
                        Ok(())
                    } else {
                        Err(fail("rule_5", "room requires an invite to join"))
                    }
                }
                _ => Err(fail("rule_5", "join rule forbids joining")),
            }
        }
        "invite" => {
            if event.content.get().contains("third_party_invite") {
                return Err(fail(
                    "rule_5",
                    "third party invites are not accepted in this room",
                ));
            }
            if sender_membership != "join" {
                return Err(fail("rule_5", "inviter is not joined to room"));
            }
            if matches!(target_membership.as_str(), "join" | "ban") {
                return Err(fail("rule_5", "target cannot be invited"));
            }
            if sender_level < levels.invite {
                return Err(fail("rule_5", "sender has insufficient power to invite"));
            }
            Ok(())
        }
        "leave" => {
            if event.sender.as_str() == target {
                if matches!(sender_membership.as_str(), "join" | "invite" | "knock") {
                    Ok(())
                } else {
                    Err(fail("rule_5", "cannot leave a room one is not in"))
                }
            } else {
                if sender_membership != "join" {
                    return Err(fail("rule_5", "kicker is not joined to room"));
                }
                if target_membership == "ban" && sender_level < levels.ban {
                    return Err(fail("rule_5", "sender cannot lift a ban"));
                }
                if sender_level >= levels.kick && target_level < sender_level {
                    Ok(())
                } else {
                    Err(fail("rule_5", "sender has insufficient power to kick"))
                }
            }
        }
        "ban" => {
            if sender_membership != "join" {
                return Err(fail("rule_5", "sender is not joined to room"));
            }
            if sender_level >= levels.ban && target_level < sender_level {
                Ok(())
            } else {
                Err(fail("rule_5", "sender has insufficient power to ban"))
            }
        }
        "knock" => {
            // Knocking arrived after the supported version window.
            let _ = room_version;
            Err(fail("rule_5", "knocking is not supported in this room version"))
        }
        other => Err(fail("rule_5", format!("unknown membership: {other}"))),
    }
}

fn check_power_levels(event: &PduEvent, old: &PowerLevels, sender_level: i64) -> Result<()> {
    let new_content: serde_json::Value = serde_json::from_str(event.content.get())
        .map_err(|_| fail("rule_10", "power_levels content is not an object"))?;

    let new_users = level_map(new_content.get("users"));
    let new_events = level_map(new_content.get("events"));

    // Every changed threshold: both the old and new value must be within the
    // sender's own level.
    let thresholds: &[(&str, i64)] = &[
        ("users_default", old.users_default),
        ("events_default", old.events_default),
        ("state_default", old.state_default),
        ("ban", old.ban),
        ("kick", old.kick),
        ("redact", old.redact),
        ("invite", old.invite),
    ];
    for (name, old_value) in thresholds {
        let new_value = new_content.get(*name).and_then(level_of).unwrap_or(*old_value);
        if new_value != *old_value && (*old_value > sender_level || new_value > sender_level) {
            return Err(fail(
                "rule_10",
                format!("cannot move {name} beyond own power level"),
            ));
        }
    }

    // Per-type event levels.
    for key in old.events.keys().chain(new_events.keys()) {
        let old_value = old.events.get(key).copied();
        let new_value = new_events.get(key).copied();
        if old_value != new_value {
            if old_value.map_or(false, |v| v > sender_level)
                || new_value.map_or(false, |v| v > sender_level)
            {
                return Err(fail(
                    "rule_10",
                    format!("cannot move level for {key} beyond own power level"),
                ));
            }
        }
    }

    // Per-user levels: changing or removing another user's entry requires
    // strictly outranking them; no value may exceed the sender's own.
    for key in old.users.keys().chain(new_users.keys()) {
        let old_value = old.users.get(key).copied();
        let new_value = new_users.get(key).copied();
        if old_value == new_value {
            continue;
        }
        if key != event.sender.as_str() {
            if old_value.map_or(false, |v| v >= sender_level) {
                return Err(fail(
                    "rule_10",
                    format!("cannot change the level of {key} who is not outranked"),
                ));
            }
        }
        if new_value.map_or(false, |v| v > sender_level) {
            return Err(fail(
                "rule_10",
                format!("cannot raise {key} beyond own power level"),
            ));
        }
    }

    Ok(())
}

fn check_redaction(
    event: &PduEvent,
    room_version: &RoomVersion,
    levels: &PowerLevels,
    sender_level: i64,
) -> Result<()> {
    if sender_level >= levels.redact {
        return Ok(());
    }

    match room_version.event_id_format {
        // Versions 1-2: a server may redact its own users' events; the
        // event_id carries the domain to compare.
        EventIdFormat::ServerAssigned => {
            if let Some(redacts) = &event.redacts {
                if redacts.server_name().map(|s| s.as_str())
                    == Some(event.sender.server_name().as_str())
                {
                    return Ok(());
                }
            }
            Err(fail("rule_11", "sender has insufficient power to redact"))
        }
        // Versions 3+: accepted here, enforced when the redaction is applied
        // to its target.
        EventIdFormat::ReferenceHash => Ok(()),
    }
}

/// Application-time redaction check: the sender outranks the redact level or
/// authored the target event.
pub fn user_can_redact(
    sender: &UserId,
    sender_level: i64,
    redact_level: i64,
    target: &PduEvent,
) -> bool {
    sender_level >= redact_level || target.sender == *sender
}

#[cfg(test)]
mod tests {
    use super::*;
    use ruma::{room_id, user_id, RoomVersionId, UInt};
    use serde_json::value::to_raw_value;

    fn pdu(
        kind: TimelineEventType,
        sender: &str,
        state_key: Option<&str>,
        content: serde_json::Value,
        depth: u32,
    ) -> Arc<PduEvent> {
        Arc::new(PduEvent {
            event_id: ruma::EventId::parse_arc(format!(
                "${}{}:orbiton.rs",
                kind.to_string().replace('.', ""),
                depth
            ))
            .unwrap(),
            room_id: room_id!("!room:orbiton.rs").to_owned(),
            sender: ruma::UserId::parse(sender).unwrap().to_owned(),
            origin: None,
            origin_server_ts: UInt::from(1u32),
            kind,
            content: to_raw_value(&content).unwrap(),
            state_key: state_key.map(|s| s.to_owned()),
            prev_events: vec![],
            depth: UInt::from(depth),
            auth_events: vec![],
            redacts: None,
            unsigned: None,
            hashes: crate::service::pdu::EventHash {
                sha256: "aaa".to_owned(),
            },
            signatures: None,
        })
    }

    fn room_v6() -> RoomVersion {
        RoomVersion::new(&RoomVersionId::V6).unwrap()
    }

    fn create_event() -> Arc<PduEvent> {
        pdu(
            TimelineEventType::RoomCreate,
            "@alice:orbiton.rs",
            Some(""),
            serde_json::json!({ "creator": "@alice:orbiton.rs", "room_version": "6" }),
            0,
        )
    }

    fn join_event(user: &str, depth: u32) -> Arc<PduEvent> {
        pdu(
            TimelineEventType::RoomMember,
            user,
            Some(user),
            serde_json::json!({ "membership": "join" }),
            depth,
        )
    }

    /// Test: a message from a joined sender passes; from a non-member fails
    /// at the membership rule
    #[test]
    fn test_rule_6_membership_gate() {
        let auth = AuthSet::new(vec![create_event(), join_event("@alice:orbiton.rs", 1)]);
        let message = pdu(
            TimelineEventType::RoomMessage,
            "@alice:orbiton.rs",
            None,
            serde_json::json!({ "body": "hi", "msgtype": "m.text" }),
            2,
        );
        check(&message, &room_v6(), &auth).unwrap();

        let auth_nobody = AuthSet::new(vec![create_event()]);
        let err = check(&message, &room_v6(), &auth_nobody).unwrap_err();
        match err {
            Error::AuthFail { rule, .. } => assert_eq!(rule, "rule_6"),
            other => panic!("expected AuthFail, got {other:?}"),
        }
    }

    /// Test: missing create in auth set rejects at rule 3
    #[test]
    fn test_rule_3_create_presence() {
        let auth = AuthSet::new(vec![join_event("@alice:orbiton.rs", 1)]);
        let message = pdu(
            TimelineEventType::RoomMessage,
            "@alice:orbiton.rs",
            None,
            serde_json::json!({ "body": "hi" }),
            2,
        );
        let err = check(&message, &room_v6(), &auth).unwrap_err();
        assert!(matches!(err, Error::AuthFail { rule: "rule_3", .. }));
    }

    /// Test: duplicate (type, state_key) in auth events rejects at rule 2
    #[test]
    fn test_rule_2_duplicate_slots() {
        let auth = AuthSet::new(vec![
            create_event(),
            join_event("@alice:orbiton.rs", 1),
            join_event("@alice:orbiton.rs", 2),
        ]);
        let message = pdu(
            TimelineEventType::RoomMessage,
            "@alice:orbiton.rs",
            None,
            serde_json::json!({ "body": "hi" }),
            3,
        );
        let err = check(&message, &room_v6(), &auth).unwrap_err();
        assert!(matches!(err, Error::AuthFail { rule: "rule_2", .. }));
    }

    /// Test: a state_key starting with @ must equal the sender
    #[test]
    fn test_rule_9_foreign_mxid_state_key() {
        let auth = AuthSet::new(vec![create_event(), join_event("@alice:orbiton.rs", 1)]);
        let sneaky = pdu(
            TimelineEventType::from("m.custom.state".to_owned()),
            "@alice:orbiton.rs",
            Some("@bob:orbiton.rs"),
            serde_json::json!({}),
            2,
        );
        let err = check(&sneaky, &room_v6(), &auth).unwrap_err();
        assert!(matches!(err, Error::AuthFail { rule: "rule_9", .. }));
    }

    /// Test: power threshold on event types is enforced at rule 8
    #[test]
    fn test_rule_8_power_threshold() {
        let power = pdu(
            TimelineEventType::RoomPowerLevels,
            "@alice:orbiton.rs",
            Some(""),
            serde_json::json!({
                "users": { "@alice:orbiton.rs": 100 },
                "users_default": 0,
                "events": { "m.room.topic": 50 },
                "state_default": 50,
            }),
            2,
        );
        let auth = AuthSet::new(vec![
            create_event(),
            join_event("@bob:orbiton.rs", 3),
            power,
        ]);

        let topic = pdu(
            TimelineEventType::RoomTopic,
            "@bob:orbiton.rs",
            Some(""),
            serde_json::json!({ "topic": "nope" }),
            4,
        );
        let err = check(&topic, &room_v6(), &auth).unwrap_err();
        assert!(matches!(err, Error::AuthFail { rule: "rule_8", .. }));
    }

    /// Test: membership transitions: banned users cannot join, invites
    /// require power
    #[test]
    fn test_rule_5_membership_transitions() {
        let ban = pdu(
            TimelineEventType::RoomMember,
            "@alice:orbiton.rs",
            Some("@mallory:orbiton.rs"),
            serde_json::json!({ "membership": "ban" }),
            2,
        );
        let join_rules = pdu(
            TimelineEventType::RoomJoinRules,
            "@alice:orbiton.rs",
            Some(""),
            serde_json::json!({ "join_rule": "public" }),
            2,
        );
        let auth = AuthSet::new(vec![create_event(), join_rules, ban]);

        let rejoin = pdu(
            TimelineEventType::RoomMember,
            "@mallory:orbiton.rs",
            Some("@mallory:orbiton.rs"),
            serde_json::json!({ "membership": "join" }),
            3,
        );
        let err = check(&rejoin, &room_v6(), &auth).unwrap_err();
        assert!(matches!(err, Error::AuthFail { rule: "rule_5", .. }));
    }

    /// Test: the creator's first join is allowed directly on create
    #[test]
    fn test_rule_5_creator_first_join() {
        let create = create_event();
        let mut join = (*join_event("@alice:orbiton.rs", 1)).clone();
        join.prev_events = vec![create.event_id.clone()];
        let auth = AuthSet::new(vec![create]);
        check(&join, &room_v6(), &auth).unwrap();
    }

    /// Test: power level changes beyond one's own level reject at rule 10
    #[test]
    fn test_rule_10_power_level_changes() {
        let power = pdu(
            TimelineEventType::RoomPowerLevels,
            "@alice:orbiton.rs",
            Some(""),
            serde_json::json!({
                "users": { "@alice:orbiton.rs": 100, "@bob:orbiton.rs": 50 },
                "users_default": 0,
            }),
            2,
        );
        let auth = AuthSet::new(vec![
            create_event(),
            join_event("@bob:orbiton.rs", 3),
            power,
        ]);

        // Bob (50) trying to demote Alice (100).
        let coup = pdu(
            TimelineEventType::RoomPowerLevels,
            "@bob:orbiton.rs",
            Some(""),
            serde_json::json!({
                "users": { "@alice:orbiton.rs": 0, "@bob:orbiton.rs": 50 },
                "users_default": 0,
            }),
            4,
        );
        let err = check(&coup, &room_v6(), &auth).unwrap_err();
        assert!(matches!(err, Error::AuthFail { rule: "rule_10", .. }));
    }

    /// Test: power-event classification for the resolver
    #[test]
    fn test_is_power_event() {
        assert!(is_power_event(&create_event()));
        assert!(!is_power_event(&join_event("@alice:orbiton.rs", 1)));

        let kick = pdu(
            TimelineEventType::RoomMember,
            "@alice:orbiton.rs",
            Some("@bob:orbiton.rs"),
            serde_json::json!({ "membership": "leave" }),
            2,
        );
        assert!(is_power_event(&kick));
    }
}
