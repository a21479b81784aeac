// =============================================================================
// Orbiton Matrix Homeserver Core - Room Head / DAG Manager
// =============================================================================
//
// Project: Orbiton - Federated Matrix Homeserver Core
// Contributors: Orbiton Development Team
// License: Apache 2.0 / MIT
//
// Description:
//   Tracks the unreferenced tips of each room's event DAG, the horizon of
//   referenced-but-missing events, and the depth measurements that drive
//   background backfill. Head rows are maintained incrementally by the commit
//   transaction; `reset` recomputes them from scratch and `rebuild` verifies
//   and patches.
//
// =============================================================================

mod data;

pub use data::Data;

use std::collections::{BTreeSet, HashMap, HashSet};

use ruma::{EventId, OwnedEventId, RoomId};
use tracing::{debug, info, warn};

use crate::{services, Result};

pub struct Service {
    pub db: &'static dyn Data,
}

impl Service {
    /// Current DAG tips of a room: events no other local event references
    /// as prev.
    pub fn heads(&self, room_id: &RoomId) -> Result<Vec<(OwnedEventId, u64)>> {
        self.db.heads(room_id)
    }

    /// Strong form: discard the stored head set and recompute it from a full
    /// scan of the room in depth order. Used after purge, restore, or
    /// detected corruption.
    #[tracing::instrument(skip(self))]
    pub fn reset(&self, room_id: &RoomId) -> Result<usize> {
        let heads = self.compute_heads(room_id)?;
        self.db.replace_heads(room_id, &heads)?;
        info!(%room_id, heads = heads.len(), "head set reset from store");
        Ok(heads.len())
    }

    /// Incremental form: verify the stored head set against the store and
    /// patch only divergent entries. Returns the number of corrections.
    #[tracing::instrument(skip(self))]
    pub fn rebuild(&self, room_id: &RoomId) -> Result<usize> {
        let expected: HashMap<OwnedEventId, u64> =
            self.compute_heads(room_id)?.into_iter().collect();
        let stored: HashMap<OwnedEventId, u64> = self.heads(room_id)?.into_iter().collect();

        let mut corrections = 0;
        for (event_id, idx) in &expected {
            if stored.get(event_id) != Some(idx) {
                self.db.add_head(room_id, event_id, *idx)?;
                corrections += 1;
            }
        }
        for event_id in stored.keys() {
            if !expected.contains_key(event_id) {
                self.db.remove_head(room_id, event_id)?;
                corrections += 1;
            }
        }

        if corrections > 0 {
            warn!(%room_id, corrections, "head set diverged from store");
        }
        Ok(corrections)
    }

    fn compute_heads(&self, room_id: &RoomId) -> Result<Vec<(OwnedEventId, u64)>> {
        let mut heads: HashMap<OwnedEventId, u64> = HashMap::new();

        for (_depth, idx) in services().rooms.timeline.room_events(room_id)? {
            if services().rooms.timeline.is_soft_failed(idx)? {
                continue;
            }
            let Some(pdu) = services().rooms.timeline.get_pdu_by_idx(idx)? else {
                continue;
            };
            for prev in &pdu.prev_events {
                heads.remove(&**prev);
            }
            heads.insert((*pdu.event_id).to_owned(), idx);
        }

        Ok(heads.into_iter().collect())
    }

    /// Referrer indexes waiting on a missing event.
    pub fn horizon_referrers(&self, missing: &EventId) -> Result<Vec<u64>> {
        self.db.horizon_referrers(missing)
    }

    /// Every (missing event, referrer) pair currently on the horizon.
    pub fn horizon(&self) -> Result<Vec<(OwnedEventId, u64)>> {
        self.db.horizon_all()
    }

    /// Consumes the horizon rows of a newly admitted event, returning the
    /// referrers that should re-enter the evaluation pipeline.
    #[tracing::instrument(skip(self))]
    pub fn release_horizon(&self, admitted: &EventId) -> Result<Vec<u64>> {
        let referrers = self.db.horizon_referrers(admitted)?;
        if !referrers.is_empty() {
            self.db.remove_horizon(admitted)?;
            debug!(%admitted, referrers = referrers.len(), "horizon released");
        }
        Ok(referrers)
    }

    /// Every missing event id currently referenced from a room, with the
    /// depths of its referrers.
    fn gaps(&self, room_id: &RoomId) -> Result<Vec<(OwnedEventId, u64)>> {
        let mut gaps = Vec::new();
        for (missing, referrer_idx) in self.db.horizon_all()? {
            let Some(referrer_room) = services().rooms.timeline.room_id_of(referrer_idx)? else {
                continue;
            };
            if referrer_room != room_id {
                continue;
            }
            let Some(depth) = services().rooms.timeline.depth_of(referrer_idx)? else {
                continue;
            };
            gaps.push((missing, depth));
        }
        Ok(gaps)
    }

    /// The (first-gap-depth, last-gap-depth) measurement of a room; None
    /// when the local copy has no unresolved references.
    #[tracing::instrument(skip(self))]
    pub fn sounding(&self, room_id: &RoomId) -> Result<Option<(u64, u64)>> {
        let gaps = self.gaps(room_id)?;
        let min = gaps.iter().map(|(_, depth)| *depth).min();
        let max = gaps.iter().map(|(_, depth)| *depth).max();
        Ok(min.zip(max))
    }

    /// The first depth on either side of the largest unfilled span of the
    /// room's depth axis; None when the depths are contiguous.
    #[tracing::instrument(skip(self))]
    pub fn twain(&self, room_id: &RoomId) -> Result<Option<(u64, u64)>> {
        let depths: BTreeSet<u64> = services()
            .rooms
            .timeline
            .room_events(room_id)?
            .into_iter()
            .map(|(depth, _)| depth)
            .collect();

        let mut best: Option<(u64, u64)> = None;
        let mut previous: Option<u64> = None;
        for depth in depths {
            if let Some(prev) = previous {
                if depth > prev + 1 {
                    let span = depth - prev;
                    if best.map_or(true, |(lo, hi)| span > hi - lo) {
                        best = Some((prev, depth));
                    }
                }
            }
            previous = Some(depth);
        }

        Ok(best)
    }

    /// Whether the event ids are all locally admitted; used by CONFORM's
    /// depth check to distinguish gaps from lies.
    pub fn all_known(&self, event_ids: &[std::sync::Arc<EventId>]) -> Result<bool> {
        let mut seen = HashSet::new();
        for event_id in event_ids {
            if !seen.insert(event_id.as_str()) {
                continue;
            }
            if services().rooms.short.get_eventidx(event_id)?.is_none() {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use crate::test_utils;

    /// Test: head set after quiescence equals the unreferenced-tip law
    #[tokio::test]
    async fn test_head_set_law_and_reset_agree() {
        let services = test_utils::init_services().await;
        let (room_id, creator) = test_utils::create_test_room(services).await;

        // A couple of messages on top of create, serially.
        for body in ["one", "two"] {
            test_utils::send_test_message(services, &room_id, &creator, body).await;
        }

        let incremental = services.rooms.head.heads(&room_id).unwrap();
        assert_eq!(incremental.len(), 1, "a linear room has one tip");

        // reset recomputes from the store; it must agree with the
        // incrementally maintained set.
        services.rooms.head.reset(&room_id).unwrap();
        let recomputed = services.rooms.head.heads(&room_id).unwrap();
        assert_eq!(incremental, recomputed);

        // rebuild finds nothing to patch afterwards.
        assert_eq!(services.rooms.head.rebuild(&room_id).unwrap(), 0);
    }
}
