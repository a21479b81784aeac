use std::sync::Arc;

use ruma::EventId;

use crate::{database::KeyValueDatabase, service, utils, Error, Result};

impl service::rooms::short::Data for KeyValueDatabase {
    fn get_eventidx(&self, event_id: &EventId) -> Result<Option<u64>> {
        self.eventid_eventidx
            .get(event_id.as_bytes())?
            .map(|bytes| utils::u64_from_bytes(&bytes))
            .transpose()
    }

    fn get_eventid(&self, idx: u64) -> Result<Option<Arc<EventId>>> {
        self.eventidx_eventid
            .get(&idx.to_be_bytes())?
            .map(|bytes| {
                let id = utils::string_from_bytes(&bytes)?;
                EventId::parse_arc(id)
                    .map_err(|_| Error::bad_database("invalid event id in db"))
            })
            .transpose()
    }

    fn max_eventidx(&self) -> Result<u64> {
        Ok(self
            .eventidx_eventid
            .iter_from(&u64::MAX.to_be_bytes(), true)
            .next()
            .map(|(key, _)| utils::u64_from_bytes(&key))
            .transpose()?
            .unwrap_or(0))
    }
}
