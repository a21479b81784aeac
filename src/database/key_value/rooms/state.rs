use ruma::RoomId;

use crate::{
    database::{abstraction::Transaction, KeyValueDatabase},
    service, utils, Error, Result,
};

fn slot_key(room_id: &RoomId, kind: &str, state_key: &str) -> Vec<u8> {
    utils::make_key(&[room_id.as_bytes(), kind.as_bytes(), state_key.as_bytes()])
}

/// Splits `type ++ 0xff ++ state_key` back into its parts.
fn split_slot(remainder: &[u8]) -> Result<(String, String)> {
    let mut parts = remainder.splitn(2, |&b| b == utils::KEY_SEPARATOR);
    let kind = parts
        .next()
        .ok_or_else(|| Error::bad_database("state key misses type"))
        .and_then(utils::string_from_bytes)?;
    let state_key = parts
        .next()
        .map(utils::string_from_bytes)
        .transpose()?
        .unwrap_or_default();
    Ok((kind, state_key))
}

impl service::rooms::state::Data for KeyValueDatabase {
    fn state_get_idx(
        &self,
        room_id: &RoomId,
        kind: &str,
        state_key: &str,
    ) -> Result<Option<u64>> {
        self.roomid_state
            .get(&slot_key(room_id, kind, state_key))?
            .map(|bytes| utils::u64_from_bytes(&bytes))
            .transpose()
    }

    fn state_full(&self, room_id: &RoomId) -> Result<Vec<((String, String), u64)>> {
        let prefix = utils::make_key(&[room_id.as_bytes(), b""]);

        let mut entries = Vec::new();
        for (key, value) in self.roomid_state.scan_prefix(prefix.clone()) {
            let slot = split_slot(&key[prefix.len()..])?;
            entries.push((slot, utils::u64_from_bytes(&value)?));
        }
        Ok(entries)
    }

    fn set_state(&self, room_id: &RoomId, entries: &[((String, String), u64)]) -> Result<()> {
        let prefix = utils::make_key(&[room_id.as_bytes(), b""]);

        let mut txn = Transaction::new();
        for (key, _) in self.roomid_state.scan_prefix(prefix) {
            txn.delete("roomid_state", key);
        }
        for ((kind, state_key), idx) in entries {
            txn.put(
                "roomid_state",
                slot_key(room_id, kind, state_key),
                idx.to_be_bytes().to_vec(),
            );
        }
        self.apply(txn)
    }

    fn state_history(
        &self,
        room_id: &RoomId,
        kind: &str,
        state_key: &str,
    ) -> Result<Vec<(u64, u64)>> {
        let prefix = utils::make_key(&[room_id.as_bytes(), b""]);

        // statenode is keyed (room, depth, type, state_key) so depth-ordered
        // iteration is the natural scan; the slot filter rides on top.
        let mut history = Vec::new();
        for (key, value) in self.statenode.scan_prefix(prefix.clone()) {
            let remainder = &key[prefix.len()..];
            if remainder.len() < 9 {
                return Err(Error::bad_database("statenode key too short"));
            }
            let depth = utils::u64_from_bytes(&remainder[..8])?;
            let (row_kind, row_state_key) = split_slot(&remainder[9..])?;
            if row_kind == kind && row_state_key == state_key {
                history.push((depth, utils::u64_from_bytes(&value)?));
            }
        }
        Ok(history)
    }

    fn is_disabled(&self, room_id: &RoomId) -> Result<bool> {
        Ok(self.disabled_rooms.get(room_id.as_bytes())?.is_some())
    }

    fn set_disabled(&self, room_id: &RoomId, disabled: bool) -> Result<()> {
        if disabled {
            self.disabled_rooms.insert(room_id.as_bytes(), &[])
        } else {
            self.disabled_rooms.remove(room_id.as_bytes())
        }
    }
}
