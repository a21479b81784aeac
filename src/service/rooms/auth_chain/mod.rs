// =============================================================================
// Orbiton Matrix Homeserver Core - Auth Chain
// =============================================================================
//
// Project: Orbiton - Federated Matrix Homeserver Core
// Contributors: Orbiton Development Team
// License: Apache 2.0 / MIT
//
// Description:
//   Transitive closure of auth_events references. Traversal is iterative
//   breadth-first with a visited set keyed by event_idx; chain depth is
//   bounded by room size, not by specification. Closures are cached per
//   sorted chunk of starting indexes.
//
// =============================================================================

mod data;

use std::{
    collections::{BTreeSet, HashSet},
    sync::Arc,
};

pub use data::Data;
use ruma::{api::client::error::ErrorKind, EventId, RoomId};
use tracing::{debug, error, warn};

use crate::{services, Error, Result};

pub struct Service {
    pub db: &'static dyn Data,
}

impl Service {
    pub fn get_cached_authchain(&self, key: &[u64]) -> Result<Option<Arc<HashSet<u64>>>> {
        self.db.get_cached_authchain(key)
    }

    #[tracing::instrument(skip(self))]
    pub fn cache_authchain(&self, key: Vec<u64>, auth_chain: Arc<HashSet<u64>>) -> Result<()> {
        self.db.cache_authchain(key, auth_chain)
    }

    /// The union of the auth chains of `starting_events`, as indexes.
    #[tracing::instrument(skip(self, starting_events))]
    pub async fn get_auth_chain(
        &self,
        room_id: &RoomId,
        starting_events: Vec<Arc<EventId>>,
    ) -> Result<HashSet<u64>> {
        const NUM_BUCKETS: usize = 50;

        let mut buckets = vec![BTreeSet::new(); NUM_BUCKETS];

        let mut i = 0;
        for id in starting_events {
            let Some(idx) = services().rooms.short.get_eventidx(&id)? else {
                warn!(event_id = %id, "auth chain requested for unknown event");
                continue;
            };
            let bucket_id = (idx % NUM_BUCKETS as u64) as usize;
            buckets[bucket_id].insert((idx, id.clone()));
            i += 1;
            if i % 100 == 0 {
                tokio::task::yield_now().await;
            }
        }

        let mut full_auth_chain = HashSet::new();

        let mut hits = 0;
        let mut misses = 0;
        for chunk in buckets {
            if chunk.is_empty() {
                continue;
            }

            let chunk_key: Vec<u64> = chunk.iter().map(|(idx, _)| idx).copied().collect();
            if let Some(cached) = self.get_cached_authchain(&chunk_key)? {
                hits += 1;
                full_auth_chain.extend(cached.iter().copied());
                continue;
            }
            misses += 1;

            let mut chunk_cache = HashSet::new();
            let mut i = 0;
            for (idx, event_id) in chunk {
                if let Some(cached) = self.get_cached_authchain(&[idx])? {
                    chunk_cache.extend(cached.iter().copied());
                } else {
                    let auth_chain = Arc::new(self.get_auth_chain_inner(room_id, &event_id)?);
                    self.cache_authchain(vec![idx], Arc::clone(&auth_chain))?;
                    debug!(
                        event_id = ?event_id,
                        chain_length = ?auth_chain.len(),
                        "cache missed event"
                    );
                    chunk_cache.extend(auth_chain.iter());

                    i += 1;
                    if i % 100 == 0 {
                        tokio::task::yield_now().await;
                    }
                };
            }
            let chunk_cache = Arc::new(chunk_cache);
            self.cache_authchain(chunk_key, Arc::clone(&chunk_cache))?;
            full_auth_chain.extend(chunk_cache.iter());
        }

        debug!(
            chain_length = ?full_auth_chain.len(),
            hits = ?hits,
            misses = ?misses,
            "auth chain stats",
        );

        Ok(full_auth_chain)
    }

    /// Same closure projected back to event ids.
    pub async fn get_auth_chain_ids(
        &self,
        room_id: &RoomId,
        starting_events: Vec<Arc<EventId>>,
    ) -> Result<Vec<Arc<EventId>>> {
        Ok(self
            .get_auth_chain(room_id, starting_events)
            .await?
            .into_iter()
            .filter_map(|idx| services().rooms.short.get_eventid(idx).ok())
            .collect())
    }

    #[tracing::instrument(skip(self, event_id))]
    fn get_auth_chain_inner(&self, room_id: &RoomId, event_id: &EventId) -> Result<HashSet<u64>> {
        let mut todo = vec![Arc::from(event_id)];
        let mut found = HashSet::new();

        while let Some(event_id) = todo.pop() {
            match services().rooms.timeline.get_pdu(&event_id) {
                Ok(Some(pdu)) => {
                    if pdu.room_id != room_id {
                        return Err(Error::BadRequestString(
                            ErrorKind::forbidden(),
                            "auth event crosses a room boundary".to_owned(),
                        ));
                    }
                    for auth_event in &pdu.auth_events {
                        let Some(auth_idx) =
                            services().rooms.short.get_eventidx(auth_event)?
                        else {
                            warn!(?auth_event, "missing auth event referenced in chain");
                            continue;
                        };

                        if found.insert(auth_idx) {
                            todo.push(auth_event.clone());
                        }
                    }
                }
                Ok(None) => {
                    warn!(?event_id, "could not find pdu mentioned in auth events");
                }
                Err(error) => {
                    error!(?event_id, ?error, "could not load event in auth chain");
                }
            }
        }

        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use crate::test_utils;
    use std::collections::HashSet;

    /// Test: the closure of a member event is exactly {create} plus its own
    /// selection, and contains exactly one m.room.create
    #[tokio::test]
    async fn test_closure_contains_single_create() {
        let services = test_utils::init_services().await;
        let (room_id, creator) = test_utils::create_test_room(services).await;
        let message =
            test_utils::send_test_message(services, &room_id, &creator, "closure test").await;

        let pdu = services
            .rooms
            .timeline
            .get_pdu(&message)
            .unwrap()
            .expect("message is stored");

        let chain = services
            .rooms
            .auth_chain
            .get_auth_chain(&room_id, vec![std::sync::Arc::from(&*message)])
            .await
            .unwrap();

        // Every auth reference of the message is in its chain.
        for auth_event in &pdu.auth_events {
            let idx = services
                .rooms
                .short
                .get_eventidx(auth_event)
                .unwrap()
                .expect("auth event stored");
            assert!(chain.contains(&idx));
        }

        // Exactly one create event in the closure.
        let mut creates = 0;
        for idx in &chain {
            let pdu = services
                .rooms
                .timeline
                .get_pdu_by_idx(*idx)
                .unwrap()
                .expect("chain member stored");
            if pdu.kind == ruma::events::TimelineEventType::RoomCreate {
                creates += 1;
                assert_eq!(pdu.room_id, room_id);
            }
        }
        assert_eq!(creates, 1);

        // ids projection matches the idx set.
        let ids = services
            .rooms
            .auth_chain
            .get_auth_chain_ids(&room_id, vec![std::sync::Arc::from(&*message)])
            .await
            .unwrap();
        let round_trip: HashSet<u64> = ids
            .iter()
            .map(|id| {
                services
                    .rooms
                    .short
                    .get_eventidx(id)
                    .unwrap()
                    .expect("id maps back")
            })
            .collect();
        assert_eq!(round_trip, chain);
    }
}
