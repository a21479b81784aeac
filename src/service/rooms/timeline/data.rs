use std::sync::Arc;

use ruma::{CanonicalJsonObject, CanonicalJsonValue, EventId, RoomId};

use super::EventCommit;
use crate::{service::pdu::PduEvent, Result};

pub trait Data: Send + Sync {
    /// In-memory cache probe; never issues engine I/O.
    fn get_pdu_cached(&self, event_id: &EventId) -> Result<Option<Arc<PduEvent>>>;
    fn cache_pdu(&self, event_id: &EventId, pdu: Arc<PduEvent>);

    fn get_pdu_json(&self, idx: u64) -> Result<Option<CanonicalJsonObject>>;
    fn get_field(&self, idx: u64, field: &str) -> Result<Option<CanonicalJsonValue>>;
    fn is_soft_failed(&self, idx: u64) -> Result<bool>;

    /// Index of the redaction applied to this event, if any.
    fn redacted_by(&self, idx: u64) -> Result<Option<u64>>;

    /// Applies an event commit atomically across the primary column and
    /// every derived column.
    fn persist(&self, commit: &EventCommit) -> Result<()>;

    /// Swaps the stored json of an event in place (redaction projection),
    /// optionally recording the redacting event.
    fn replace_pdu_json(
        &self,
        idx: u64,
        json: &CanonicalJsonObject,
        redacted_by: Option<u64>,
    ) -> Result<()>;

    /// All events of a room as (depth, idx), ascending.
    fn room_events_by_depth(&self, room_id: &RoomId) -> Result<Vec<(u64, u64)>>;

    /// Scan of one of the by-value secondary indexes (sender/type/origin).
    fn index_scan(&self, tree: &'static str, value: &[u8]) -> Result<Vec<u64>>;

    fn purge_room(&self, room_id: &RoomId) -> Result<u64>;
    fn verify_index(&self, idx: u64) -> Result<()>;
    fn rebuild_index(&self, tree: &'static str) -> Result<u64>;
}
