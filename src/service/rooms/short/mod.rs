// =============================================================================
// Orbiton Matrix Homeserver Core - Event Index Mapping
// =============================================================================
//
// Project: Orbiton - Federated Matrix Homeserver Core
// Contributors: Orbiton Development Team
// License: Apache 2.0 / MIT
//
// Description:
//   The event-index surface: every durably accepted event owns a dense,
//   process-monotone u64 used as the primary key of all secondary columns.
//   Allocation happens in the evaluation pipeline's ISSUE phase; this service
//   answers both directions of the mapping once the WRITE phase has made it
//   durable.
//
// =============================================================================

mod data;

use std::sync::Arc;

pub use data::Data;
use ruma::EventId;

use crate::{Error, Result};

pub struct Service {
    pub db: &'static dyn Data,
}

impl Service {
    /// Resolves an event id to its index; None while the event is unknown
    /// or still in flight before WRITE.
    pub fn get_eventidx(&self, event_id: &EventId) -> Result<Option<u64>> {
        self.db.get_eventidx(event_id)
    }

    pub fn get_eventidx_or_err(&self, event_id: &EventId) -> Result<u64> {
        self.get_eventidx(event_id)?
            .ok_or(Error::NotFound("event has no index"))
    }

    pub fn get_eventid(&self, idx: u64) -> Result<Arc<EventId>> {
        self.db
            .get_eventid(idx)?
            .ok_or(Error::NotFound("event index has no event id"))
    }

    /// Highest index with a durable mapping; seeds the sequence counters on
    /// startup so trailing gaps from aborted ISSUEs are skipped over.
    pub fn max_eventidx(&self) -> Result<u64> {
        self.db.max_eventidx()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils;

    /// Test: both directions of the mapping agree after a commit
    #[tokio::test]
    async fn test_mapping_round_trip() {
        let services = test_utils::init_services().await;
        let (room_id, creator) = test_utils::create_test_room(services).await;

        let head = services.rooms.head.heads(&room_id).unwrap();
        assert_eq!(head.len(), 1, "fresh room has exactly one head");
        let (event_id, idx) = head.into_iter().next().unwrap();

        assert_eq!(
            services.rooms.short.get_eventidx(&event_id).unwrap(),
            Some(idx)
        );
        assert_eq!(&*services.rooms.short.get_eventid(idx).unwrap(), &*event_id);
        assert!(services.rooms.short.max_eventidx().unwrap() >= idx);

        let _ = creator;
    }
}
