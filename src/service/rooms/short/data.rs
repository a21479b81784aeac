use std::sync::Arc;

use ruma::EventId;

use crate::Result;

pub trait Data: Send + Sync {
    fn get_eventidx(&self, event_id: &EventId) -> Result<Option<u64>>;
    fn get_eventid(&self, idx: u64) -> Result<Option<Arc<EventId>>>;
    fn max_eventidx(&self) -> Result<u64>;
}
