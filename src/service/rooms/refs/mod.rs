// =============================================================================
// Orbiton Matrix Homeserver Core - Reverse Event References
// =============================================================================
//
// Project: Orbiton - Federated Matrix Homeserver Core
// Contributors: Orbiton Development Team
// License: Apache 2.0 / MIT
//
// Description:
//   Reverse adjacency over the room DAG: who references an event, and as
//   what. Successor (NEXT), auth descendant (NEXT_AUTH) and state supersession
//   (PREV_STATE) edges are written by the commit transaction; traversals carry
//   a visited set keyed by event_idx, never pointers.
//
// =============================================================================

mod data;

pub use data::Data;

use crate::Result;

/// Kind tag of a reverse-adjacency row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RefKind {
    /// Referrer lists the event in `prev_events`.
    Next = 0,
    /// Referrer lists the event in `auth_events`.
    NextAuth = 1,
    /// Referrer superseded the event's `(type, state_key)` slot.
    PrevState = 2,
}

impl RefKind {
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Next),
            1 => Some(Self::NextAuth),
            2 => Some(Self::PrevState),
            _ => None,
        }
    }
}

pub struct Service {
    pub db: &'static dyn Data,
}

impl Service {
    /// Indexes of events referencing `idx` with the given kind.
    pub fn referrers(&self, idx: u64, kind: RefKind) -> Result<Vec<u64>> {
        self.db.referrers(idx, kind)
    }

    /// Whether any later event references `idx` as prev; the head set is
    /// exactly the events for which this is false.
    pub fn is_referenced(&self, idx: u64) -> Result<bool> {
        Ok(!self.db.referrers(idx, RefKind::Next)?.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ref_kind_tags_round_trip() {
        for kind in [RefKind::Next, RefKind::NextAuth, RefKind::PrevState] {
            assert_eq!(RefKind::from_u8(kind as u8), Some(kind));
        }
        assert_eq!(RefKind::from_u8(3), None);
    }
}
