// =============================================================================
// Orbiton Matrix Homeserver Core - Room Services
// =============================================================================
//
// Project: Orbiton - Federated Matrix Homeserver Core
// Contributors: Orbiton Development Team
// License: Apache 2.0 / MIT
//
// Description:
//   Room-scoped services: the event store surface, the event-index mapping,
//   reverse references and the horizon, the head set, the auth chain, the
//   authorization rules and state resolution.
//
// =============================================================================

pub mod auth_chain;
pub mod event_auth;
pub mod head;
pub mod refs;
pub mod short;
pub mod state;
pub mod state_res;
pub mod timeline;

use ruma::{room_version_rules::RoomVersionRules, RoomVersionId};

use crate::{Error, Result};

pub trait Data:
    auth_chain::Data + head::Data + refs::Data + short::Data + state::Data + timeline::Data
{
}

pub struct Service {
    pub auth_chain: auth_chain::Service,
    pub head: head::Service,
    pub refs: refs::Service,
    pub short: short::Service,
    pub state: state::Service,
    pub timeline: timeline::Service,
}

/// Which resolution algorithm a room version runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolutionAlgorithm {
    V1,
    V2,
}

/// How event ids come into being in a room version.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventIdFormat {
    /// `$localpart:server`, assigned by the origin server (versions 1–2).
    ServerAssigned,
    /// Base64 of the reference hash over the canonical preimage (3+).
    ReferenceHash,
}

/// Per-room-version strategy, computed once from the version string instead
/// of branching on it throughout the pipeline.
#[derive(Clone, Debug)]
pub struct RoomVersion {
    pub id: RoomVersionId,
    pub rules: RoomVersionRules,
    pub resolution: ResolutionAlgorithm,
    pub event_id_format: EventIdFormat,
    /// Versions 1-5 authorize m.room.aliases by sender domain.
    pub special_case_aliases: bool,
    /// Versions 5 and up refuse signatures from expired keys.
    pub strict_key_validity: bool,
}

impl RoomVersion {
    pub fn new(id: &RoomVersionId) -> Result<Self> {
        let rules = id
            .rules()
            .ok_or(Error::Conforms("unknown room version"))?;

        let (resolution, event_id_format, special_case_aliases) = match id {
            RoomVersionId::V1 => (ResolutionAlgorithm::V1, EventIdFormat::ServerAssigned, true),
            RoomVersionId::V2 => (ResolutionAlgorithm::V2, EventIdFormat::ServerAssigned, true),
            RoomVersionId::V3 | RoomVersionId::V4 | RoomVersionId::V5 => {
                (ResolutionAlgorithm::V2, EventIdFormat::ReferenceHash, true)
            }
            RoomVersionId::V6 => (ResolutionAlgorithm::V2, EventIdFormat::ReferenceHash, false),
            _ => return Err(Error::Conforms("room version is not supported")),
        };

        Ok(Self {
            id: id.clone(),
            rules,
            resolution,
            event_id_format,
            special_case_aliases,
            strict_key_validity: matches!(id, RoomVersionId::V5 | RoomVersionId::V6),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test: the strategy table covers exactly versions 1 through 6
    #[test]
    fn test_room_version_strategy_window() {
        let v1 = RoomVersion::new(&RoomVersionId::V1).unwrap();
        assert_eq!(v1.resolution, ResolutionAlgorithm::V1);
        assert_eq!(v1.event_id_format, EventIdFormat::ServerAssigned);

        let v2 = RoomVersion::new(&RoomVersionId::V2).unwrap();
        assert_eq!(v2.resolution, ResolutionAlgorithm::V2);
        assert_eq!(v2.event_id_format, EventIdFormat::ServerAssigned);

        for id in [
            RoomVersionId::V3,
            RoomVersionId::V4,
            RoomVersionId::V5,
            RoomVersionId::V6,
        ] {
            let v = RoomVersion::new(&id).unwrap();
            assert_eq!(v.resolution, ResolutionAlgorithm::V2);
            assert_eq!(v.event_id_format, EventIdFormat::ReferenceHash);
        }

        assert!(RoomVersion::new(&RoomVersionId::V10).is_err());
    }
}
