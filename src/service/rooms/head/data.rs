use ruma::{EventId, OwnedEventId, RoomId};

use crate::Result;

pub trait Data: Send + Sync {
    fn heads(&self, room_id: &RoomId) -> Result<Vec<(OwnedEventId, u64)>>;
    fn add_head(&self, room_id: &RoomId, event_id: &EventId, idx: u64) -> Result<()>;
    fn remove_head(&self, room_id: &RoomId, event_id: &EventId) -> Result<()>;
    fn replace_heads(&self, room_id: &RoomId, heads: &[(OwnedEventId, u64)]) -> Result<()>;

    fn horizon_referrers(&self, missing: &EventId) -> Result<Vec<u64>>;
    fn remove_horizon(&self, missing: &EventId) -> Result<()>;
    fn horizon_all(&self) -> Result<Vec<(OwnedEventId, u64)>>;
}
