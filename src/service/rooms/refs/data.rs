use super::RefKind;
use crate::Result;

pub trait Data: Send + Sync {
    fn referrers(&self, idx: u64, kind: RefKind) -> Result<Vec<u64>>;
}
