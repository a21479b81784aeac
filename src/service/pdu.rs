// =============================================================================
// Orbiton Matrix Homeserver Core - Persistent Data Unit
// =============================================================================
//
// Project: Orbiton - Federated Matrix Homeserver Core
// Contributors: Orbiton Development Team
// License: Apache 2.0 / MIT
//
// Description:
//   The event record: immutable, signed, content-addressed. The canonical
//   preimage for hashing and signing excludes event_id, hashes, signatures
//   and unsigned; in room versions 3 and up the event_id is derived from the
//   reference hash of that preimage.
//
// Dependencies:
//   • Matrix protocol types with ruma
//   • Serialization with serde
//   • Structured logging with tracing
//
// =============================================================================

use std::{collections::BTreeMap, sync::Arc};

use ruma::{
    canonical_json::redact_content_in_place,
    events::TimelineEventType,
    room_version_rules::{RedactionRules, RoomVersionRules},
    CanonicalJsonObject, CanonicalJsonValue, EventId, MilliSecondsSinceUnixEpoch, OwnedEventId,
    OwnedRoomId, OwnedServerName, OwnedUserId, RoomVersionId, ServerName, UInt,
};
use serde::{Deserialize, Serialize};
use serde_json::value::{to_raw_value, RawValue as RawJsonValue};
use tracing::warn;

use crate::{utils, Error, Result};

/// Content hashes of a PDU.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EventHash {
    /// The SHA-256 hash, unpadded base64.
    pub sha256: String,
}

#[derive(Clone, Deserialize, Debug, Serialize)]
pub struct PduEvent {
    pub event_id: Arc<EventId>,
    pub room_id: OwnedRoomId,
    pub sender: OwnedUserId,
    /// Homeserver that authored the event. Absent on some implementations;
    /// falls back to the sender's server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<OwnedServerName>,
    pub origin_server_ts: UInt,
    #[serde(rename = "type")]
    pub kind: TimelineEventType,
    pub content: Box<RawJsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    pub prev_events: Vec<Arc<EventId>>,
    pub depth: UInt,
    pub auth_events: Vec<Arc<EventId>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redacts: Option<Arc<EventId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsigned: Option<Box<RawJsonValue>>,
    pub hashes: EventHash,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signatures: Option<Box<RawJsonValue>>,
}

impl PduEvent {
    /// Whether this event occupies a `(type, state_key)` slot in room state.
    pub fn is_state(&self) -> bool {
        self.state_key.is_some()
    }

    pub fn origin(&self) -> &ServerName {
        self.origin
            .as_deref()
            .unwrap_or_else(|| self.sender.server_name())
    }

    pub fn state_key(&self) -> Option<&str> {
        self.state_key.as_deref()
    }

    pub fn event_type(&self) -> &TimelineEventType {
        &self.kind
    }

    /// Strips content down to the room version's preserved set and records
    /// the redaction under `unsigned.redacted_because`. The event keeps its
    /// identity and indexes.
    #[tracing::instrument(skip(self, reason))]
    pub fn redact(&mut self, redaction_rules: &RedactionRules, reason: &PduEvent) -> Result<()> {
        if reason.kind != TimelineEventType::RoomRedaction {
            return Err(Error::bad_database(
                "redaction reason is not a redaction event",
            ));
        }

        if self.is_redacted() {
            warn!(event_id = %self.event_id, "event is already redacted");
            return Ok(());
        }

        self.unsigned = None;

        let mut content = serde_json::from_str(self.content.get())
            .map_err(|_| Error::bad_database("PDU in db has invalid content"))?;

        redact_content_in_place(&mut content, redaction_rules, self.kind.to_string())
            .map_err(|e| Error::Internal(format!("redaction failed: {e}")))?;

        self.unsigned = Some(
            to_raw_value(&serde_json::json!({
                "redacted_because": serde_json::to_value(reason)
                    .expect("to_value(PduEvent) always works"),
            }))
            .expect("to raw value always works"),
        );

        self.content = to_raw_value(&content).expect("to raw value always works");
        Ok(())
    }

    pub fn is_redacted(&self) -> bool {
        #[derive(Deserialize)]
        struct ExtractRedactedBecause {
            redacted_because: Option<serde::de::IgnoredAny>,
        }

        let Some(unsigned) = &self.unsigned else {
            return false;
        };

        let Ok(unsigned) = ExtractRedactedBecause::deserialize(&**unsigned) else {
            return false;
        };

        unsigned.redacted_because.is_some()
    }

    /// Stamps `unsigned.age` for client projections.
    pub fn add_age(&mut self) -> Result<()> {
        let mut unsigned: BTreeMap<String, Box<RawJsonValue>> = self
            .unsigned
            .as_ref()
            .map_or_else(|| Ok(BTreeMap::new()), |u| serde_json::from_str(u.get()))
            .map_err(|_| Error::bad_database("invalid unsigned in pdu event"))?;

        let server_ts: u64 = self.origin_server_ts.into();
        let age = utils::millis_since_unix_epoch().saturating_sub(server_ts);
        unsigned.insert(
            "age".to_owned(),
            to_raw_value(&age).expect("u64 to raw value always works"),
        );
        self.unsigned = Some(to_raw_value(&unsigned).expect("unsigned is valid"));

        Ok(())
    }

    /// The canonical object this PDU serializes to on the federation wire.
    pub fn to_canonical_object(&self) -> Result<CanonicalJsonObject> {
        utils::to_canonical_object(self)
    }

    /// The canonical preimage hashes and signatures cover: the event without
    /// `event_id`, `hashes`, `signatures` and `unsigned`.
    pub fn canonical_preimage(&self) -> Result<CanonicalJsonObject> {
        let mut object = self.to_canonical_object()?;
        object.remove("event_id");
        object.remove("hashes");
        object.remove("signatures");
        object.remove("unsigned");
        Ok(object)
    }
}

impl PartialEq for PduEvent {
    fn eq(&self, other: &Self) -> bool {
        self.event_id == other.event_id
    }
}

impl Eq for PduEvent {}

impl PartialOrd for PduEvent {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PduEvent {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.event_id.cmp(&other.event_id)
    }
}

/// Assigns an event id to an inbound canonical JSON body. Room versions 1
/// and 2 carry a server-assigned id on the wire; versions 3 and up derive it
/// from the reference hash.
pub fn gen_event_id_canonical_json(
    pdu: &RawJsonValue,
    room_version_id: &RoomVersionId,
    rules: &RoomVersionRules,
) -> Result<(OwnedEventId, CanonicalJsonObject)> {
    let mut value: CanonicalJsonObject = serde_json::from_str(pdu.get())
        .map_err(|e| Error::BadJson(format!("invalid PDU in server response: {e}")))?;

    let event_id = match room_version_id {
        RoomVersionId::V1 | RoomVersionId::V2 => match value.get("event_id") {
            Some(CanonicalJsonValue::String(id)) => EventId::parse(id.as_str())
                .map_err(|_| Error::BadJson("invalid event_id in pdu".to_owned()))?
                .to_owned(),
            _ => return Err(Error::BadJson("missing event_id in v1/v2 pdu".to_owned())),
        },
        _ => {
            value.remove("event_id");
            let hash = ruma::signatures::reference_hash(&value, rules)
                .map_err(|e| Error::BadJson(format!("cannot hash pdu: {e}")))?;
            EventId::parse(format!("${hash}"))
                .expect("ruma's reference hashes are valid event ids")
        }
    };

    value.insert(
        "event_id".to_owned(),
        CanonicalJsonValue::String(event_id.as_str().to_owned()),
    );

    Ok((event_id, value))
}

/// Build the inner timeline event of a locally-authored PDU; everything else
/// (prev selection, auth selection, depth, hashing, signing) is filled in by
/// the timeline service.
#[derive(Debug, Deserialize)]
pub struct PduBuilder {
    #[serde(rename = "type")]
    pub event_type: TimelineEventType,
    pub content: Box<RawJsonValue>,
    pub unsigned: Option<BTreeMap<String, serde_json::Value>>,
    pub state_key: Option<String>,
    pub redacts: Option<Arc<EventId>>,
    /// For past-timestamp injection by trusted tooling; `None` is now.
    pub timestamp: Option<MilliSecondsSinceUnixEpoch>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ruma::{room_id, user_id};

    pub(crate) fn message_pdu() -> PduEvent {
        PduEvent {
            event_id: EventId::parse_arc("$construct:orbiton.rs").unwrap(),
            room_id: room_id!("!room:orbiton.rs").to_owned(),
            sender: user_id!("@alice:orbiton.rs").to_owned(),
            origin: None,
            origin_server_ts: UInt::from(1_700_000_000u32),
            kind: TimelineEventType::RoomMessage,
            content: to_raw_value(&serde_json::json!({
                "msgtype": "m.text",
                "body": "hello"
            }))
            .unwrap(),
            state_key: None,
            prev_events: vec![],
            depth: UInt::from(1u32),
            auth_events: vec![],
            redacts: None,
            unsigned: None,
            hashes: EventHash {
                sha256: "aaa".to_owned(),
            },
            signatures: None,
        }
    }

    fn redaction_pdu() -> PduEvent {
        let mut pdu = message_pdu();
        pdu.kind = TimelineEventType::RoomRedaction;
        pdu.redacts = Some(EventId::parse_arc("$construct:orbiton.rs").unwrap());
        pdu.content = to_raw_value(&serde_json::json!({ "reason": "spam" })).unwrap();
        pdu
    }

    /// Test: the canonical preimage excludes exactly the unsigned fields
    #[test]
    fn test_canonical_preimage_exclusions() {
        let pdu = message_pdu();
        let preimage = pdu.canonical_preimage().unwrap();
        assert!(!preimage.contains_key("event_id"));
        assert!(!preimage.contains_key("hashes"));
        assert!(!preimage.contains_key("signatures"));
        assert!(!preimage.contains_key("unsigned"));
        assert!(preimage.contains_key("content"));
        assert!(preimage.contains_key("depth"));
    }

    /// Test: origin falls back to the sender's server when absent
    #[test]
    fn test_origin_fallback() {
        let mut pdu = message_pdu();
        assert_eq!(pdu.origin().as_str(), "orbiton.rs");

        pdu.origin = Some(ServerName::parse("other.example").unwrap().to_owned());
        assert_eq!(pdu.origin().as_str(), "other.example");
    }

    /// Test: redaction strips message content, marks redacted_because, and
    /// a second application is a no-op
    #[test]
    fn test_redact_strips_and_marks() {
        let mut target = message_pdu();
        let reason = redaction_pdu();
        let rules = RoomVersionId::V6.rules().unwrap().redaction;

        target.redact(&rules, &reason).unwrap();
        assert!(target.is_redacted());
        let content: serde_json::Value = serde_json::from_str(target.content.get()).unwrap();
        assert!(content.get("body").is_none(), "body is not preserved");

        let snapshot = target.content.get().to_owned();
        target.redact(&rules, &reason).unwrap();
        assert_eq!(target.content.get(), snapshot);
    }

    /// Test: v3+ event ids come from the reference hash of the body
    #[test]
    fn test_gen_event_id_v6() {
        let body = to_raw_value(&serde_json::json!({
            "room_id": "!room:orbiton.rs",
            "sender": "@alice:orbiton.rs",
            "origin_server_ts": 1_700_000_000u64,
            "type": "m.room.message",
            "content": { "msgtype": "m.text", "body": "hi" },
            "prev_events": [],
            "auth_events": [],
            "depth": 1,
        }))
        .unwrap();

        let version = RoomVersionId::V6;
        let rules = version.rules().unwrap();
        let (event_id, object) = gen_event_id_canonical_json(&body, &version, &rules).unwrap();
        assert!(event_id.as_str().starts_with('$'));
        assert_eq!(
            object.get("event_id"),
            Some(&CanonicalJsonValue::String(event_id.to_string()))
        );

        // Deterministic: same body, same id.
        let (event_id2, _) = gen_event_id_canonical_json(&body, &version, &rules).unwrap();
        assert_eq!(event_id, event_id2);
    }

    /// Test: v1 bodies must carry their server-assigned id
    #[test]
    fn test_gen_event_id_v1_requires_field() {
        let body = to_raw_value(&serde_json::json!({
            "room_id": "!room:orbiton.rs",
            "sender": "@alice:orbiton.rs",
            "type": "m.room.message",
            "content": {},
        }))
        .unwrap();

        let version = RoomVersionId::V1;
        let rules = version.rules().unwrap();
        assert!(gen_event_id_canonical_json(&body, &version, &rules).is_err());
    }
}
