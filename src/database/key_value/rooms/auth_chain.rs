use std::{collections::HashSet, sync::Arc};

use crate::{database::KeyValueDatabase, service, utils, Result};

impl service::rooms::auth_chain::Data for KeyValueDatabase {
    fn get_cached_authchain(&self, key: &[u64]) -> Result<Option<Arc<HashSet<u64>>>> {
        // Check in-memory cache first.
        if let Some(chain) = self
            .auth_chain_cache
            .lock()
            .expect("lock is not poisoned")
            .get_mut(&key.to_vec())
        {
            return Ok(Some(Arc::clone(chain)));
        }

        // Single-index closures also persist durably.
        if key.len() == 1 {
            if let Some(bytes) = self.authchain_cache_tree.get(&key[0].to_be_bytes())? {
                let chain: HashSet<u64> = bytes
                    .chunks_exact(8)
                    .map(utils::u64_from_bytes)
                    .collect::<Result<_>>()?;
                let chain = Arc::new(chain);
                self.auth_chain_cache
                    .lock()
                    .expect("lock is not poisoned")
                    .insert(key.to_vec(), Arc::clone(&chain));
                return Ok(Some(chain));
            }
        }

        Ok(None)
    }

    fn cache_authchain(&self, key: Vec<u64>, auth_chain: Arc<HashSet<u64>>) -> Result<()> {
        if key.len() == 1 {
            let bytes: Vec<u8> = auth_chain
                .iter()
                .flat_map(|idx| idx.to_be_bytes())
                .collect();
            self.authchain_cache_tree
                .insert(&key[0].to_be_bytes(), &bytes)?;
        }

        self.auth_chain_cache
            .lock()
            .expect("lock is not poisoned")
            .insert(key, auth_chain);

        Ok(())
    }
}
