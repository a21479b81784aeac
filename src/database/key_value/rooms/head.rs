use ruma::{EventId, OwnedEventId, RoomId};

use crate::{
    database::{abstraction::Transaction, KeyValueDatabase},
    service, utils, Error, Result,
};

impl service::rooms::head::Data for KeyValueDatabase {
    fn heads(&self, room_id: &RoomId) -> Result<Vec<(OwnedEventId, u64)>> {
        let prefix = utils::make_key(&[room_id.as_bytes(), b""]);

        let mut heads = Vec::new();
        for (key, value) in self.roomid_head.scan_prefix(prefix.clone()) {
            let event_id = utils::string_from_bytes(&key[prefix.len()..])?;
            let event_id = EventId::parse(event_id)
                .map_err(|_| Error::bad_database("invalid event id in head column"))?
                .to_owned();
            heads.push((event_id, utils::u64_from_bytes(&value)?));
        }
        Ok(heads)
    }

    fn add_head(&self, room_id: &RoomId, event_id: &EventId, idx: u64) -> Result<()> {
        self.roomid_head.insert(
            &utils::make_key(&[room_id.as_bytes(), event_id.as_bytes()]),
            &idx.to_be_bytes(),
        )
    }

    fn remove_head(&self, room_id: &RoomId, event_id: &EventId) -> Result<()> {
        self.roomid_head
            .remove(&utils::make_key(&[room_id.as_bytes(), event_id.as_bytes()]))
    }

    fn replace_heads(&self, room_id: &RoomId, heads: &[(OwnedEventId, u64)]) -> Result<()> {
        let prefix = utils::make_key(&[room_id.as_bytes(), b""]);

        let mut txn = Transaction::new();
        for (key, _) in self.roomid_head.scan_prefix(prefix) {
            txn.delete("roomid_head", key);
        }
        for (event_id, idx) in heads {
            txn.put(
                "roomid_head",
                utils::make_key(&[room_id.as_bytes(), event_id.as_bytes()]),
                idx.to_be_bytes().to_vec(),
            );
        }
        self.apply(txn)
    }

    fn horizon_referrers(&self, missing: &EventId) -> Result<Vec<u64>> {
        let prefix = utils::make_key(&[missing.as_bytes(), b""]);

        let mut referrers = Vec::new();
        for (key, _) in self.eventhorizon.scan_prefix(prefix) {
            referrers.push(utils::u64_from_bytes(&key[key.len() - 8..])?);
        }
        Ok(referrers)
    }

    fn remove_horizon(&self, missing: &EventId) -> Result<()> {
        let prefix = utils::make_key(&[missing.as_bytes(), b""]);

        let mut txn = Transaction::new();
        for (key, _) in self.eventhorizon.scan_prefix(prefix) {
            txn.delete("eventhorizon", key);
        }
        self.apply(txn)
    }

    fn horizon_all(&self) -> Result<Vec<(OwnedEventId, u64)>> {
        let mut rows = Vec::new();
        for (key, _) in self.eventhorizon.iter() {
            if key.len() < 10 {
                return Err(Error::bad_database("horizon row key too short"));
            }
            let (head, referrer) = utils::split_trailing_u64(&key)?;
            let event_id = utils::string_from_bytes(head)?;
            let event_id = EventId::parse(event_id)
                .map_err(|_| Error::bad_database("invalid event id in horizon column"))?
                .to_owned();
            rows.push((event_id, referrer));
        }
        Ok(rows)
    }
}
