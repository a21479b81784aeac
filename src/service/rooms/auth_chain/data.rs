use std::{collections::HashSet, sync::Arc};

use crate::Result;

pub trait Data: Send + Sync {
    fn get_cached_authchain(&self, key: &[u64]) -> Result<Option<Arc<HashSet<u64>>>>;
    fn cache_authchain(&self, key: Vec<u64>, auth_chain: Arc<HashSet<u64>>) -> Result<()>;
}
