use std::sync::Arc;

use ruma::{CanonicalJsonObject, CanonicalJsonValue, EventId, RoomId};
use tracing::warn;

use crate::{
    database::{abstraction::Transaction, KeyValueDatabase},
    service::{
        pdu::PduEvent,
        rooms::{
            refs::RefKind,
            timeline::{Data, EventCommit},
        },
    },
    utils, Error, Result,
};

impl Data for KeyValueDatabase {
    fn get_pdu_cached(&self, event_id: &EventId) -> Result<Option<Arc<PduEvent>>> {
        Ok(self
            .pdu_cache
            .lock()
            .expect("lock is not poisoned")
            .get_mut(&event_id.to_owned())
            .map(|pdu| Arc::clone(&*pdu)))
    }

    fn cache_pdu(&self, event_id: &EventId, pdu: Arc<PduEvent>) {
        self.pdu_cache
            .lock()
            .expect("lock is not poisoned")
            .insert(event_id.to_owned(), pdu);
    }

    fn get_pdu_json(&self, idx: u64) -> Result<Option<CanonicalJsonObject>> {
        self.eventidx_json
            .get(&idx.to_be_bytes())?
            .map(|bytes| {
                serde_json::from_slice(&bytes)
                    .map_err(|_| Error::bad_database("invalid event json in db"))
            })
            .transpose()
    }

    fn get_field(&self, idx: u64, field: &str) -> Result<Option<CanonicalJsonValue>> {
        let mut key = idx.to_be_bytes().to_vec();
        key.push(utils::KEY_SEPARATOR);
        key.extend_from_slice(field.as_bytes());

        self.eventidx_field
            .get(&key)?
            .map(|bytes| {
                serde_json::from_slice(&bytes)
                    .map_err(|_| Error::bad_database("invalid field json in db"))
            })
            .transpose()
    }

    fn is_soft_failed(&self, idx: u64) -> Result<bool> {
        Ok(self
            .softfailed_eventidx
            .get(&idx.to_be_bytes())?
            .is_some())
    }

    fn redacted_by(&self, idx: u64) -> Result<Option<u64>> {
        self.redacted_eventidx
            .get(&idx.to_be_bytes())?
            .map(|bytes| utils::u64_from_bytes(&bytes))
            .transpose()
    }

    fn persist(&self, commit: &EventCommit) -> Result<()> {
        let pdu = &commit.pdu;
        let idx_bytes = commit.idx.to_be_bytes();
        let room = pdu.room_id.as_bytes();
        let depth = u64::from(pdu.depth);

        let mut txn = Transaction::new();

        // Primary record and the identity mapping.
        txn.put(
            "eventid_eventidx",
            pdu.event_id.as_bytes().to_vec(),
            idx_bytes.to_vec(),
        );
        txn.put(
            "eventidx_eventid",
            idx_bytes.to_vec(),
            pdu.event_id.as_bytes().to_vec(),
        );
        txn.put(
            "eventidx_json",
            idx_bytes.to_vec(),
            serde_json::to_vec(&commit.json).expect("canonical json serializes"),
        );

        // Field fan-out for narrow reads.
        for (field, value) in &commit.json {
            let mut key = idx_bytes.to_vec();
            key.push(utils::KEY_SEPARATOR);
            key.extend_from_slice(field.as_bytes());
            txn.put(
                "eventidx_field",
                key,
                serde_json::to_vec(value).expect("canonical value serializes"),
            );
        }

        // By-value indexes.
        txn.put(
            "sender_eventidx",
            utils::make_key(&[pdu.sender.as_bytes(), &idx_bytes]),
            Vec::new(),
        );
        txn.put(
            "type_eventidx",
            utils::make_key(&[pdu.kind.to_string().as_bytes(), &idx_bytes]),
            Vec::new(),
        );
        txn.put(
            "origin_eventidx",
            utils::make_key(&[pdu.origin().as_bytes(), &idx_bytes]),
            Vec::new(),
        );

        // Causal-order traversal index: room ++ depth ++ idx.
        let mut depth_key = utils::make_key(&[room, &depth.to_be_bytes()]);
        depth_key.extend_from_slice(&idx_bytes);
        txn.put("roomid_depth", depth_key, Vec::new());

        // Reverse adjacency and the horizon.
        for (prev_id, prev_idx) in &commit.prev_refs {
            match prev_idx {
                Some(prev_idx) => {
                    let mut key = prev_idx.to_be_bytes().to_vec();
                    key.push(RefKind::Next as u8);
                    key.extend_from_slice(&idx_bytes);
                    txn.put("eventrefs", key, Vec::new());
                }
                None => {
                    txn.put(
                        "eventhorizon",
                        utils::make_key(&[prev_id.as_bytes(), &idx_bytes]),
                        Vec::new(),
                    );
                }
            }
            if commit.update_head {
                txn.delete(
                    "roomid_head",
                    utils::make_key(&[room, prev_id.as_bytes()]),
                );
            }
        }
        for (auth_id, auth_idx) in &commit.auth_refs {
            match auth_idx {
                Some(auth_idx) => {
                    let mut key = auth_idx.to_be_bytes().to_vec();
                    key.push(RefKind::NextAuth as u8);
                    key.extend_from_slice(&idx_bytes);
                    txn.put("eventrefs", key, Vec::new());
                }
                None => {
                    txn.put(
                        "eventhorizon",
                        utils::make_key(&[auth_id.as_bytes(), &idx_bytes]),
                        Vec::new(),
                    );
                }
            }
        }

        if commit.update_head {
            txn.put(
                "roomid_head",
                utils::make_key(&[room, pdu.event_id.as_bytes()]),
                idx_bytes.to_vec(),
            );
        }

        // State slot application and history.
        if let Some(state_key) = pdu.state_key.as_deref() {
            if commit.apply_state {
                let kind = pdu.kind.to_string();
                txn.put(
                    "roomid_state",
                    utils::make_key(&[room, kind.as_bytes(), state_key.as_bytes()]),
                    idx_bytes.to_vec(),
                );
                txn.put(
                    "statenode",
                    utils::make_key(&[
                        room,
                        &depth.to_be_bytes(),
                        kind.as_bytes(),
                        state_key.as_bytes(),
                    ]),
                    idx_bytes.to_vec(),
                );
                if let Some(prev_state_idx) = commit.prev_state_idx {
                    let mut key = prev_state_idx.to_be_bytes().to_vec();
                    key.push(RefKind::PrevState as u8);
                    key.extend_from_slice(&idx_bytes);
                    txn.put("eventrefs", key, Vec::new());
                }
            }
        }

        if commit.soft_failed {
            txn.put("softfailed_eventidx", idx_bytes.to_vec(), Vec::new());
        } else {
            // Upgrades after a horizon release clear the mark.
            txn.delete("softfailed_eventidx", idx_bytes.to_vec());
        }

        self.apply(txn)
    }

    fn replace_pdu_json(
        &self,
        idx: u64,
        json: &CanonicalJsonObject,
        redacted_by: Option<u64>,
    ) -> Result<()> {
        let idx_bytes = idx.to_be_bytes();

        let mut txn = Transaction::new();
        txn.put(
            "eventidx_json",
            idx_bytes.to_vec(),
            serde_json::to_vec(json).expect("canonical json serializes"),
        );

        // Field projections follow the new json; stale fields drop.
        let field_prefix = {
            let mut p = idx_bytes.to_vec();
            p.push(utils::KEY_SEPARATOR);
            p
        };
        for (key, _) in self.eventidx_field.scan_prefix(field_prefix.clone()) {
            txn.delete("eventidx_field", key);
        }
        for (field, value) in json {
            let mut key = field_prefix.clone();
            key.extend_from_slice(field.as_bytes());
            txn.put(
                "eventidx_field",
                key,
                serde_json::to_vec(value).expect("canonical value serializes"),
            );
        }

        if let Some(redacted_by) = redacted_by {
            txn.put(
                "redacted_eventidx",
                idx_bytes.to_vec(),
                redacted_by.to_be_bytes().to_vec(),
            );
        }

        self.apply(txn)
    }

    fn room_events_by_depth(&self, room_id: &RoomId) -> Result<Vec<(u64, u64)>> {
        let prefix = utils::make_key(&[room_id.as_bytes(), b""]);

        let mut events = Vec::new();
        for (key, _) in self.roomid_depth.scan_prefix(prefix.clone()) {
            let remainder = &key[prefix.len()..];
            if remainder.len() != 16 {
                return Err(Error::bad_database("depth index key malformed"));
            }
            let depth = utils::u64_from_bytes(&remainder[..8])?;
            let idx = utils::u64_from_bytes(&remainder[8..])?;
            events.push((depth, idx));
        }
        Ok(events)
    }

    fn index_scan(&self, tree: &'static str, value: &[u8]) -> Result<Vec<u64>> {
        let tree = match tree {
            "sender_eventidx" => &self.sender_eventidx,
            "type_eventidx" => &self.type_eventidx,
            "origin_eventidx" => &self.origin_eventidx,
            _ => return Err(Error::Internal(format!("{tree} is not a scan index"))),
        };
        let prefix = utils::make_key(&[value, b""]);

        let mut found = Vec::new();
        for (key, _) in tree.scan_prefix(prefix) {
            found.push(utils::u64_from_bytes(&key[key.len() - 8..])?);
        }
        Ok(found)
    }

    fn purge_room(&self, room_id: &RoomId) -> Result<u64> {
        let mut txn = Transaction::new();
        let mut purged = 0u64;

        for (depth, idx) in self.room_events_by_depth(room_id)? {
            let idx_bytes = idx.to_be_bytes();
            let Some(json) = self.get_pdu_json(idx)? else {
                continue;
            };
            let pdu: PduEvent = serde_json::from_value(
                serde_json::to_value(&json).expect("stored json round-trips"),
            )
            .map_err(|_| Error::bad_database("unparsable event during purge"))?;

            txn.delete("eventid_eventidx", pdu.event_id.as_bytes().to_vec());
            txn.delete("eventidx_eventid", idx_bytes.to_vec());
            txn.delete("eventidx_json", idx_bytes.to_vec());
            let field_prefix = {
                let mut p = idx_bytes.to_vec();
                p.push(utils::KEY_SEPARATOR);
                p
            };
            for (key, _) in self.eventidx_field.scan_prefix(field_prefix) {
                txn.delete("eventidx_field", key);
            }
            txn.delete(
                "sender_eventidx",
                utils::make_key(&[pdu.sender.as_bytes(), &idx_bytes]),
            );
            txn.delete(
                "type_eventidx",
                utils::make_key(&[pdu.kind.to_string().as_bytes(), &idx_bytes]),
            );
            txn.delete(
                "origin_eventidx",
                utils::make_key(&[pdu.origin().as_bytes(), &idx_bytes]),
            );
            let mut depth_key =
                utils::make_key(&[room_id.as_bytes(), &depth.to_be_bytes()]);
            depth_key.extend_from_slice(&idx_bytes);
            txn.delete("roomid_depth", depth_key);
            txn.delete("softfailed_eventidx", idx_bytes.to_vec());
            txn.delete("redacted_eventidx", idx_bytes.to_vec());
            txn.delete("authchain_cache", idx_bytes.to_vec());

            // Adjacency rows where this event is the target.
            for (key, _) in self.eventrefs.scan_prefix(idx_bytes.to_vec()) {
                txn.delete("eventrefs", key);
            }

            self.pdu_cache
                .lock()
                .expect("lock is not poisoned")
                .remove(&(*pdu.event_id).to_owned());

            purged += 1;
        }

        // Adjacency rows where a purged event is the referrer, and horizon
        // rows from this room's events, need a full sweep.
        let purged_idxs: std::collections::HashSet<u64> = self
            .room_events_by_depth(room_id)?
            .into_iter()
            .map(|(_, idx)| idx)
            .collect();
        for (key, _) in self.eventrefs.iter() {
            if key.len() >= 8 {
                if let Ok(referrer) = utils::u64_from_bytes(&key[key.len() - 8..]) {
                    if purged_idxs.contains(&referrer) {
                        txn.delete("eventrefs", key);
                    }
                }
            }
        }
        for (key, _) in self.eventhorizon.iter() {
            if let Ok((_, referrer)) = utils::split_trailing_u64(&key) {
                if purged_idxs.contains(&referrer) {
                    txn.delete("eventhorizon", key);
                }
            }
        }

        // Room-keyed columns.
        for tree_name in ["roomid_head", "roomid_state", "statenode", "roomid_depth"] {
            let tree = match tree_name {
                "roomid_head" => &self.roomid_head,
                "roomid_state" => &self.roomid_state,
                "statenode" => &self.statenode,
                _ => &self.roomid_depth,
            };
            for (key, _) in tree.scan_prefix(utils::make_key(&[room_id.as_bytes(), b""])) {
                txn.delete(tree_name, key);
            }
        }
        txn.delete("disabled_rooms", room_id.as_bytes().to_vec());

        self.apply(txn)?;
        Ok(purged)
    }

    fn verify_index(&self, idx: u64) -> Result<()> {
        let drift = |detail: String| Error::Corruption {
            repairable: true,
            detail,
        };

        let Some(json) = self.get_pdu_json(idx)? else {
            return Err(Error::NotFound("event index has no primary row"));
        };
        let pdu: PduEvent = serde_json::from_value(
            serde_json::to_value(&json).expect("stored json round-trips"),
        )
        .map_err(|_| Error::bad_database("unparsable event during verification"))?;

        // Identity mapping agrees both ways.
        match self.eventid_eventidx.get(pdu.event_id.as_bytes())? {
            Some(bytes) if utils::u64_from_bytes(&bytes)? == idx => {}
            _ => {
                return Err(drift(format!(
                    "eventid_eventidx disagrees for idx {idx}"
                )))
            }
        }

        // Each by-value secondary key derivable from the primary exists.
        let idx_bytes = idx.to_be_bytes();
        let checks: [(&str, Vec<u8>); 3] = [
            (
                "sender_eventidx",
                utils::make_key(&[pdu.sender.as_bytes(), &idx_bytes]),
            ),
            (
                "type_eventidx",
                utils::make_key(&[pdu.kind.to_string().as_bytes(), &idx_bytes]),
            ),
            (
                "origin_eventidx",
                utils::make_key(&[pdu.origin().as_bytes(), &idx_bytes]),
            ),
        ];
        for (tree_name, key) in checks {
            let tree = match tree_name {
                "sender_eventidx" => &self.sender_eventidx,
                "type_eventidx" => &self.type_eventidx,
                _ => &self.origin_eventidx,
            };
            if tree.get(&key)?.is_none() {
                return Err(drift(format!("{tree_name} row missing for idx {idx}")));
            }
        }

        Ok(())
    }

    fn rebuild_index(&self, tree: &'static str) -> Result<u64> {
        if !matches!(
            tree,
            "sender_eventidx" | "type_eventidx" | "origin_eventidx" | "roomid_depth"
        ) {
            return Err(Error::Internal(format!("{tree} cannot be rebuilt")));
        }

        let mut txn = Transaction::new();

        // Drop the whole secondary, regenerate from the primary column.
        let target = match tree {
            "sender_eventidx" => &self.sender_eventidx,
            "type_eventidx" => &self.type_eventidx,
            "origin_eventidx" => &self.origin_eventidx,
            _ => &self.roomid_depth,
        };
        for (key, _) in target.iter() {
            txn.delete(tree, key);
        }

        let mut rebuilt = 0u64;
        for (key, _) in self.eventidx_json.iter() {
            let idx = utils::u64_from_bytes(&key)?;
            let Some(json) = self.get_pdu_json(idx)? else {
                continue;
            };
            let Ok(pdu) = serde_json::from_value::<PduEvent>(
                serde_json::to_value(&json).expect("stored json round-trips"),
            ) else {
                warn!(idx, "skipping unparsable event during index rebuild");
                continue;
            };
            let idx_bytes = idx.to_be_bytes();

            let row = match tree {
                "sender_eventidx" => utils::make_key(&[pdu.sender.as_bytes(), &idx_bytes]),
                "type_eventidx" => {
                    utils::make_key(&[pdu.kind.to_string().as_bytes(), &idx_bytes])
                }
                "origin_eventidx" => utils::make_key(&[pdu.origin().as_bytes(), &idx_bytes]),
                _ => {
                    let mut key = utils::make_key(&[
                        pdu.room_id.as_bytes(),
                        &u64::from(pdu.depth).to_be_bytes(),
                    ]);
                    key.extend_from_slice(&idx_bytes);
                    key
                }
            };
            txn.put(tree, row, Vec::new());
            rebuilt += 1;
        }

        self.apply(txn)?;
        Ok(rebuilt)
    }
}
