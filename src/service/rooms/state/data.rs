use ruma::RoomId;

use crate::Result;

pub trait Data: Send + Sync {
    fn state_get_idx(&self, room_id: &RoomId, kind: &str, state_key: &str)
        -> Result<Option<u64>>;
    fn state_full(&self, room_id: &RoomId) -> Result<Vec<((String, String), u64)>>;

    /// Replaces the current-state column of a room wholesale.
    fn set_state(&self, room_id: &RoomId, entries: &[((String, String), u64)]) -> Result<()>;

    /// Slot history as (depth, idx), ascending by depth.
    fn state_history(
        &self,
        room_id: &RoomId,
        kind: &str,
        state_key: &str,
    ) -> Result<Vec<(u64, u64)>>;

    fn is_disabled(&self, room_id: &RoomId) -> Result<bool>;
    fn set_disabled(&self, room_id: &RoomId, disabled: bool) -> Result<()>;
}
