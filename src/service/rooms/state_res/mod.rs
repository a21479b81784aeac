// =============================================================================
// Orbiton Matrix Homeserver Core - State Resolution
// =============================================================================
//
// Project: Orbiton - Federated Matrix Homeserver Core
// Contributors: Orbiton Development Team
// License: Apache 2.0 / MIT
//
// Description:
//   Deterministic resolution of conflicting room state across DAG forks.
//   Version 1 rooms order conflicted candidates by depth and content hash;
//   version 2 and later run the full algorithm: auth difference, reverse
//   topological power ordering, iterative auth checks, mainline ordering,
//   and re-application of the unconflicted map. The resolver is pure: same
//   inputs produce the same outputs on any honest server, with no dependence
//   on wall clock or local ordering outside event fields.
//
// =============================================================================

use std::{
    cmp::Reverse,
    collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap, HashSet},
    sync::Arc,
};

use sha2::{Digest, Sha256};
use tracing::{debug, instrument, trace};

use crate::{
    service::{
        pdu::PduEvent,
        rooms::{event_auth, event_auth::AuthSet, ResolutionAlgorithm, RoomVersion},
    },
    Error, Result,
};

/// Resolved state: `(type, state_key)` to event index.
pub type StateMap = BTreeMap<(String, String), u64>;

/// Store access the resolver is allowed: event by index, index by id.
pub struct Context<'a> {
    pub fetch: &'a dyn Fn(u64) -> Option<Arc<PduEvent>>,
    pub idx_of: &'a dyn Fn(&ruma::EventId) -> Option<u64>,
}

impl<'a> Context<'a> {
    fn event(&self, idx: u64) -> Result<Arc<PduEvent>> {
        (self.fetch)(idx).ok_or(Error::NotFound("event referenced during resolution"))
    }

    /// Auth chain of one event as indexes, iterative with a visited set.
    fn auth_chain(&self, idx: u64) -> Result<HashSet<u64>> {
        let mut found = HashSet::new();
        let mut todo = vec![idx];
        while let Some(current) = todo.pop() {
            let Some(pdu) = (self.fetch)(current) else {
                continue;
            };
            for auth_id in &pdu.auth_events {
                let Some(auth_idx) = (self.idx_of)(auth_id) else {
                    continue;
                };
                if found.insert(auth_idx) {
                    todo.push(auth_idx);
                }
            }
        }
        Ok(found)
    }
}

/// Resolves a set of state snapshots into one state map.
#[instrument(skip_all, fields(sets = state_sets.len(), algorithm = ?room_version.resolution))]
pub fn resolve(
    room_version: &RoomVersion,
    state_sets: &[StateMap],
    ctx: &Context<'_>,
) -> Result<StateMap> {
    match state_sets.len() {
        0 => return Ok(StateMap::new()),
        1 => return Ok(state_sets[0].clone()),
        _ => {}
    }

    match room_version.resolution {
        ResolutionAlgorithm::V1 => resolve_v1(room_version, state_sets, ctx),
        ResolutionAlgorithm::V2 => resolve_v2(room_version, state_sets, ctx),
    }
}

fn split_conflicted(
    state_sets: &[StateMap],
) -> (StateMap, BTreeMap<(String, String), BTreeSet<u64>>) {
    let mut occurrences: BTreeMap<(String, String), BTreeSet<u64>> = BTreeMap::new();
    for set in state_sets {
        for (key, idx) in set {
            occurrences.entry(key.clone()).or_default().insert(*idx);
        }
    }

    let mut unconflicted = StateMap::new();
    let mut conflicted = BTreeMap::new();
    for (key, idxs) in occurrences {
        // A slot absent from some set counts as conflicted.
        let everywhere = state_sets.iter().all(|set| set.contains_key(&key));
        if idxs.len() == 1 && everywhere {
            unconflicted.insert(key, *idxs.iter().next().expect("len is 1"));
        } else {
            conflicted.insert(key, idxs);
        }
    }

    (unconflicted, conflicted)
}

/// Auth selection out of a partially resolved state, for iterative checks.
fn auth_set_from_state(
    state: &StateMap,
    event: &PduEvent,
    ctx: &Context<'_>,
) -> Result<AuthSet> {
    let mut events = Vec::new();
    let mut push = |kind: &str, state_key: &str| -> Result<()> {
        if let Some(idx) = state.get(&(kind.to_owned(), state_key.to_owned())) {
            events.push(ctx.event(*idx)?);
        }
        Ok(())
    };

    push("m.room.create", "")?;
    push("m.room.power_levels", "")?;
    push("m.room.member", event.sender.as_str())?;
    if event.kind == ruma::events::TimelineEventType::RoomMember {
        push("m.room.join_rules", "")?;
        if let Some(state_key) = event.state_key.as_deref() {
            if state_key != event.sender.as_str() {
                push("m.room.member", state_key)?;
            }
        }
    }

    Ok(AuthSet::new(events))
}

fn apply_if_authorized(
    room_version: &RoomVersion,
    state: &mut StateMap,
    idx: u64,
    ctx: &Context<'_>,
) -> Result<bool> {
    let pdu = ctx.event(idx)?;
    let auth = auth_set_from_state(state, &pdu, ctx)?;
    match event_auth::check(&pdu, room_version, &auth) {
        Ok(()) => {
            let key = (
                pdu.kind.to_string(),
                pdu.state_key.clone().unwrap_or_default(),
            );
            state.insert(key, idx);
            Ok(true)
        }
        Err(Error::AuthFail { rule, reason }) => {
            trace!(event_id = %pdu.event_id, rule, reason, "candidate rejected during resolution");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// Content-hash tie break of the v1 algorithm.
fn event_id_hash(pdu: &PduEvent) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(pdu.event_id.as_bytes());
    hasher.finalize().into()
}

fn resolve_v1(
    room_version: &RoomVersion,
    state_sets: &[StateMap],
    ctx: &Context<'_>,
) -> Result<StateMap> {
    let (unconflicted, conflicted) = split_conflicted(state_sets);
    let mut resolved = unconflicted;

    // Power-bearing slots first, then everything else, each slot ordered by
    // (depth desc, event id hash asc); the first authorized candidate wins.
    let mut slots: Vec<_> = conflicted.into_iter().collect();
    slots.sort_by_key(|(key, _)| {
        let priority = match key.0.as_str() {
            "m.room.power_levels" => 0,
            "m.room.join_rules" => 1,
            "m.room.member" => 2,
            _ => 3,
        };
        (priority, key.clone())
    });

    for (key, candidate_idxs) in slots {
        let mut candidates = Vec::new();
        for idx in candidate_idxs {
            candidates.push((idx, ctx.event(idx)?));
        }
        candidates.sort_by(|(_, a), (_, b)| {
            b.depth
                .cmp(&a.depth)
                .then_with(|| event_id_hash(a).cmp(&event_id_hash(b)))
        });

        let mut winner = None;
        for (idx, _) in &candidates {
            if apply_if_authorized(room_version, &mut resolved, *idx, ctx)? {
                winner = Some(*idx);
                break;
            }
        }
        if winner.is_none() {
            // No candidate authorizes against the partial state; keep the
            // ordering winner for determinism.
            if let Some((idx, _)) = candidates.first() {
                resolved.insert(key, *idx);
            }
        }
    }

    Ok(resolved)
}

/// Power of an event's sender as seen by its own auth references.
fn sender_power(pdu: &PduEvent, ctx: &Context<'_>) -> Result<i64> {
    let mut auth_events = Vec::new();
    for auth_id in &pdu.auth_events {
        if let Some(idx) = (ctx.idx_of)(auth_id) {
            if let Some(auth_pdu) = (ctx.fetch)(idx) {
                auth_events.push(auth_pdu);
            }
        }
    }
    let auth = AuthSet::new(auth_events);
    let levels = event_auth::PowerLevels::from_auth(&auth);
    Ok(levels.user_level(pdu.sender.as_str(), &auth))
}

#[derive(PartialEq, Eq, PartialOrd, Ord, Clone)]
struct PowerOrderKey {
    negated_power: i64,
    origin_server_ts: u64,
    event_id: String,
}

fn power_order_key(idx: u64, ctx: &Context<'_>) -> Result<PowerOrderKey> {
    let pdu = ctx.event(idx)?;
    Ok(PowerOrderKey {
        negated_power: -sender_power(&pdu, ctx)?,
        origin_server_ts: u64::from(pdu.origin_server_ts),
        event_id: pdu.event_id.to_string(),
    })
}

/// Kahn's algorithm over the auth graph restricted to `events`, visiting
/// ready nodes in power-order. Ancestors come out before descendants.
fn reverse_topological_power_sort(
    events: &BTreeSet<u64>,
    ctx: &Context<'_>,
) -> Result<Vec<u64>> {
    let mut outgoing: HashMap<u64, Vec<u64>> = HashMap::new();
    let mut indegree: HashMap<u64, usize> = events.iter().map(|idx| (*idx, 0)).collect();

    for &idx in events {
        let pdu = ctx.event(idx)?;
        for auth_id in &pdu.auth_events {
            let Some(auth_idx) = (ctx.idx_of)(auth_id) else {
                continue;
            };
            if events.contains(&auth_idx) {
                // Edge auth ancestor -> event: the ancestor sorts first.
                outgoing.entry(auth_idx).or_default().push(idx);
                *indegree.entry(idx).or_default() += 1;
            }
        }
    }

    let mut ready: BinaryHeap<Reverse<(PowerOrderKey, u64)>> = BinaryHeap::new();
    for (&idx, &degree) in &indegree {
        if degree == 0 {
            ready.push(Reverse((power_order_key(idx, ctx)?, idx)));
        }
    }

    let mut sorted = Vec::with_capacity(events.len());
    while let Some(Reverse((_, idx))) = ready.pop() {
        sorted.push(idx);
        if let Some(nexts) = outgoing.get(&idx) {
            for &next in nexts {
                let degree = indegree.get_mut(&next).expect("node is in the graph");
                *degree -= 1;
                if *degree == 0 {
                    ready.push(Reverse((power_order_key(next, ctx)?, next)));
                }
            }
        }
    }

    if sorted.len() != events.len() {
        return Err(Error::Internal(
            "cycle in auth graph during resolution".to_owned(),
        ));
    }

    Ok(sorted)
}

/// Mainline position: distance of the event's closest power_levels ancestor
/// along the resolved power_levels chain.
fn mainline_sort(
    events: &BTreeSet<u64>,
    resolved_power_levels: Option<u64>,
    ctx: &Context<'_>,
) -> Result<Vec<u64>> {
    // Build the mainline by walking the power_levels auth chain.
    let mut mainline = Vec::new();
    let mut current = resolved_power_levels;
    while let Some(idx) = current {
        mainline.push(idx);
        current = None;
        let pdu = ctx.event(idx)?;
        for auth_id in &pdu.auth_events {
            if let Some(auth_idx) = (ctx.idx_of)(auth_id) {
                if let Some(auth_pdu) = (ctx.fetch)(auth_idx) {
                    if auth_pdu.kind == ruma::events::TimelineEventType::RoomPowerLevels {
                        current = Some(auth_idx);
                        break;
                    }
                }
            }
        }
    }
    let mainline_position: HashMap<u64, usize> = mainline
        .iter()
        .rev()
        .enumerate()
        .map(|(position, idx)| (*idx, position + 1))
        .collect();

    // Closest mainline ancestor of one event, walking its power_levels
    // auth references.
    let closest = |start: u64| -> Result<usize> {
        let mut seen = HashSet::new();
        let mut current = Some(start);
        while let Some(idx) = current {
            if !seen.insert(idx) {
                break;
            }
            if let Some(position) = mainline_position.get(&idx) {
                return Ok(*position);
            }
            current = None;
            let pdu = ctx.event(idx)?;
            for auth_id in &pdu.auth_events {
                if let Some(auth_idx) = (ctx.idx_of)(auth_id) {
                    if let Some(auth_pdu) = (ctx.fetch)(auth_idx) {
                        if auth_pdu.kind == ruma::events::TimelineEventType::RoomPowerLevels {
                            current = Some(auth_idx);
                            break;
                        }
                    }
                }
            }
        }
        Ok(0)
    };

    let mut keyed = Vec::with_capacity(events.len());
    for &idx in events {
        let pdu = ctx.event(idx)?;
        keyed.push((
            closest(idx)?,
            u64::from(pdu.origin_server_ts),
            pdu.event_id.to_string(),
            idx,
        ));
    }
    keyed.sort();

    Ok(keyed.into_iter().map(|(_, _, _, idx)| idx).collect())
}

fn resolve_v2(
    room_version: &RoomVersion,
    state_sets: &[StateMap],
    ctx: &Context<'_>,
) -> Result<StateMap> {
    let (unconflicted, conflicted) = split_conflicted(state_sets);
    if conflicted.is_empty() {
        return Ok(unconflicted);
    }

    // Full conflicted set: conflicted values plus the auth difference of the
    // state sets.
    let mut full_conflicted: BTreeSet<u64> =
        conflicted.values().flatten().copied().collect();

    let mut chains: Vec<HashSet<u64>> = Vec::with_capacity(state_sets.len());
    for set in state_sets {
        let mut chain = HashSet::new();
        for idx in set.values() {
            chain.insert(*idx);
            chain.extend(ctx.auth_chain(*idx)?);
        }
        chains.push(chain);
    }
    let union: HashSet<u64> = chains.iter().flatten().copied().collect();
    let intersection: HashSet<u64> = union
        .iter()
        .filter(|idx| chains.iter().all(|chain| chain.contains(idx)))
        .copied()
        .collect();
    full_conflicted.extend(union.difference(&intersection));

    debug!(
        conflicted = conflicted.len(),
        full_conflicted = full_conflicted.len(),
        "resolving state"
    );

    // Only events we can actually load participate.
    full_conflicted.retain(|idx| (ctx.fetch)(*idx).is_some());

    // Power events plus their auth chains within the full conflicted set,
    // in reverse topological power order, auth checked iteratively.
    let mut power_events = BTreeSet::new();
    for &idx in &full_conflicted {
        let pdu = ctx.event(idx)?;
        if event_auth::is_power_event(&pdu) {
            power_events.insert(idx);
            for chained in ctx.auth_chain(idx)? {
                if full_conflicted.contains(&chained) {
                    power_events.insert(chained);
                }
            }
        }
    }

    let sorted_power = reverse_topological_power_sort(&power_events, ctx)?;

    let mut partial = unconflicted.clone();
    for idx in &sorted_power {
        apply_if_authorized(room_version, &mut partial, *idx, ctx)?;
    }

    // Remaining conflicted events in mainline order, auth checked onto the
    // partially resolved state.
    let resolved_power_levels = partial
        .get(&("m.room.power_levels".to_owned(), String::new()))
        .copied();
    let remaining: BTreeSet<u64> = full_conflicted
        .iter()
        .filter(|idx| !power_events.contains(idx))
        .copied()
        .collect();

    for idx in mainline_sort(&remaining, resolved_power_levels, ctx)? {
        apply_if_authorized(room_version, &mut partial, idx, ctx)?;
    }

    // The unconflicted map overwrites whatever resolution produced.
    for (key, idx) in unconflicted {
        partial.insert(key, idx);
    }

    Ok(partial)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test: trivial cases, zero and one state set
    #[test]
    fn test_resolve_trivial_sets() {
        let room_version = RoomVersion::new(&ruma::RoomVersionId::V6).unwrap();
        let fetch = |_| None;
        let idx_of = |_: &ruma::EventId| None;
        let ctx = Context {
            fetch: &fetch,
            idx_of: &idx_of,
        };

        assert!(resolve(&room_version, &[], &ctx).unwrap().is_empty());

        let mut only = StateMap::new();
        only.insert(("m.room.create".to_owned(), String::new()), 1);
        assert_eq!(
            resolve(&room_version, std::slice::from_ref(&only), &ctx).unwrap(),
            only
        );
    }

    /// Test: the unconflicted/conflicted split treats absence as conflict
    #[test]
    fn test_split_conflicted_absence() {
        let mut a = StateMap::new();
        a.insert(("m.room.create".to_owned(), String::new()), 1);
        a.insert(("m.room.topic".to_owned(), String::new()), 2);

        let mut b = StateMap::new();
        b.insert(("m.room.create".to_owned(), String::new()), 1);

        let (unconflicted, conflicted) = split_conflicted(&[a, b]);
        assert_eq!(
            unconflicted.get(&("m.room.create".to_owned(), String::new())),
            Some(&1)
        );
        assert!(conflicted.contains_key(&("m.room.topic".to_owned(), String::new())));
    }
}
