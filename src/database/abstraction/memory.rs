// =============================================================================
// Orbiton Matrix Homeserver Core - In-Memory Storage Engine
// =============================================================================
//
// Project: Orbiton - Federated Matrix Homeserver Core
// Contributors: Orbiton Development Team
// License: Apache 2.0 / MIT
//
// Description:
//   Ordered-map engine implementing the adapter contract without touching
//   disk. Powers the test suites and ephemeral deployments. Transactions are
//   applied under a single engine-wide write lock, which gives readers the
//   all-or-nothing view the contract demands.
//
// =============================================================================

use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    ops::Bound,
    pin::Pin,
    sync::{Arc, RwLock},
};

use tokio::sync::watch;

use super::{increment_bytes, KeyValueDatabaseEngine, KvTree, Transaction, TransactionOp};
use crate::{Config, Error, Result};

type TreeData = BTreeMap<Vec<u8>, Vec<u8>>;

pub struct Engine {
    trees: RwLock<HashMap<&'static str, Arc<MemoryTree>>>,
}

pub struct MemoryTree {
    data: RwLock<TreeData>,
    watchers: RwLock<HashMap<Vec<u8>, watch::Sender<()>>>,
}

impl MemoryTree {
    fn new() -> Self {
        Self {
            data: RwLock::new(BTreeMap::new()),
            watchers: RwLock::new(HashMap::new()),
        }
    }

    fn wake_watchers(&self, key: &[u8]) {
        let watchers = self.watchers.read().expect("lock is not poisoned");
        for (prefix, tx) in watchers.iter() {
            if key.starts_with(prefix) {
                let _ = tx.send(());
            }
        }
    }
}

impl Engine {
    fn tree(&self, name: &'static str) -> Arc<MemoryTree> {
        let mut trees = self.trees.write().expect("lock is not poisoned");
        Arc::clone(trees.entry(name).or_insert_with(|| Arc::new(MemoryTree::new())))
    }
}

impl KeyValueDatabaseEngine for Engine {
    fn open(_config: &Config) -> Result<Self> {
        Ok(Self {
            trees: RwLock::new(HashMap::new()),
        })
    }

    fn open_tree(&self, name: &'static str) -> Result<Arc<dyn KvTree>> {
        Ok(self.tree(name))
    }

    fn write_transaction(&self, txn: Transaction) -> Result<()> {
        // Acquire every touched tree's write guard before applying the first
        // delta; readers cannot observe a partial apply.
        let mut arcs: HashMap<&'static str, Arc<MemoryTree>> = HashMap::new();
        for op in txn.ops() {
            let name = match op {
                TransactionOp::Put { tree, .. } | TransactionOp::Delete { tree, .. } => *tree,
            };
            arcs.entry(name).or_insert_with(|| self.tree(name));
        }

        let mut touched: Vec<(Arc<MemoryTree>, Vec<u8>)> = Vec::with_capacity(txn.len());
        {
            let mut guards = HashMap::new();
            for (name, tree) in arcs.iter() {
                let guard = tree
                    .data
                    .write()
                    .map_err(|_| Error::bad_database("memory engine lock poisoned"))?;
                guards.insert(*name, guard);
            }

            for op in txn.ops() {
                match op {
                    TransactionOp::Put { tree, key, value } => {
                        let guard = guards.get_mut(tree).expect("guard collected above");
                        guard.insert(key.clone(), value.clone());
                        touched.push((Arc::clone(&arcs[tree]), key.clone()));
                    }
                    TransactionOp::Delete { tree, key } => {
                        let guard = guards.get_mut(tree).expect("guard collected above");
                        guard.remove(key);
                    }
                }
            }
        }

        for (tree, key) in touched {
            tree.wake_watchers(&key);
        }

        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn memory_usage(&self) -> Result<String> {
        let trees = self.trees.read().expect("lock is not poisoned");
        let mut total = 0usize;
        for tree in trees.values() {
            let data = tree.data.read().expect("lock is not poisoned");
            total += data.iter().map(|(k, v)| k.len() + v.len()).sum::<usize>();
        }
        Ok(format!(
            "{} trees, approximately {:.2} MB resident",
            trees.len(),
            total as f64 / 1024.0 / 1024.0
        ))
    }
}

impl KvTree for MemoryTree {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self
            .data
            .read()
            .expect("lock is not poisoned")
            .get(key)
            .cloned())
    }

    fn insert(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.data
            .write()
            .expect("lock is not poisoned")
            .insert(key.to_vec(), value.to_vec());
        self.wake_watchers(key);
        Ok(())
    }

    fn insert_batch(&self, iter: &mut dyn Iterator<Item = (Vec<u8>, Vec<u8>)>) -> Result<()> {
        let mut data = self.data.write().expect("lock is not poisoned");
        for (key, value) in iter {
            data.insert(key, value);
        }
        Ok(())
    }

    fn remove(&self, key: &[u8]) -> Result<()> {
        self.data
            .write()
            .expect("lock is not poisoned")
            .remove(key);
        Ok(())
    }

    fn iter<'a>(&'a self) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a> {
        let data = self.data.read().expect("lock is not poisoned");
        let items: Vec<_> = data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        Box::new(items.into_iter())
    }

    fn iter_from<'a>(
        &'a self,
        from: &[u8],
        backwards: bool,
    ) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a> {
        let data = self.data.read().expect("lock is not poisoned");
        let items: Vec<_> = if backwards {
            data.range::<[u8], _>((Bound::Unbounded, Bound::Included(from)))
                .rev()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        } else {
            data.range::<[u8], _>((Bound::Included(from), Bound::Unbounded))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        Box::new(items.into_iter())
    }

    fn increment(&self, key: &[u8]) -> Result<Vec<u8>> {
        let mut data = self.data.write().expect("lock is not poisoned");
        let new = increment_bytes(data.get(key).map(Vec::as_slice));
        data.insert(key.to_vec(), new.clone());
        Ok(new)
    }

    fn scan_prefix<'a>(
        &'a self,
        prefix: Vec<u8>,
    ) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a> {
        let data = self.data.read().expect("lock is not poisoned");
        let items: Vec<_> = data
            .range::<[u8], _>((Bound::Included(prefix.as_slice()), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Box::new(items.into_iter())
    }

    fn watch_prefix<'a>(&'a self, prefix: &[u8]) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        let mut rx = {
            let mut watchers = self.watchers.write().expect("lock is not poisoned");
            watchers
                .entry(prefix.to_vec())
                .or_insert_with(|| watch::channel(()).0)
                .subscribe()
        };

        Box::pin(async move {
            // The first change after subscription resolves the future.
            let _ = rx.changed().await;
        })
    }

    fn clear(&self) -> Result<()> {
        self.data.write().expect("lock is not poisoned").clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use figment::providers::{Format, Toml};

    fn test_config() -> Config {
        figment::Figment::new()
            .merge(Toml::string(
                r#"
                server_name = "orbiton.rs"
                database_path = "/tmp/unused"
                database_backend = "memory"
                "#,
            ))
            .extract()
            .expect("test config parses")
    }

    /// Test: basic tree operations round-trip
    #[test]
    fn test_tree_operations() {
        let engine = Engine::open(&test_config()).unwrap();
        let tree = engine.open_tree("test").unwrap();

        tree.insert(b"key", b"value").unwrap();
        assert_eq!(tree.get(b"key").unwrap(), Some(b"value".to_vec()));

        tree.remove(b"key").unwrap();
        assert_eq!(tree.get(b"key").unwrap(), None);
    }

    /// Test: scan_prefix stops at the prefix boundary
    #[test]
    fn test_scan_prefix_boundary() {
        let engine = Engine::open(&test_config()).unwrap();
        let tree = engine.open_tree("test").unwrap();

        tree.insert(b"a\xffx", b"1").unwrap();
        tree.insert(b"a\xffy", b"2").unwrap();
        tree.insert(b"b\xffz", b"3").unwrap();

        let hits: Vec<_> = tree.scan_prefix(b"a\xff".to_vec()).collect();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, b"a\xffx");
    }

    /// Test: a cross-tree transaction lands atomically and wholly
    #[test]
    fn test_write_transaction_across_trees() {
        let engine = Engine::open(&test_config()).unwrap();
        let one = engine.open_tree("one").unwrap();
        let two = engine.open_tree("two").unwrap();
        one.insert(b"stale", b"x").unwrap();

        let mut txn = Transaction::new();
        txn.put("one", b"fresh".to_vec(), b"1".to_vec());
        txn.delete("one", b"stale".to_vec());
        txn.put("two", b"fresh".to_vec(), b"2".to_vec());
        engine.write_transaction(txn).unwrap();

        assert_eq!(one.get(b"fresh").unwrap(), Some(b"1".to_vec()));
        assert_eq!(one.get(b"stale").unwrap(), None);
        assert_eq!(two.get(b"fresh").unwrap(), Some(b"2".to_vec()));
    }

    /// Test: applying the same transaction twice is indistinguishable from
    /// applying it once
    #[test]
    fn test_transaction_idempotent_replay() {
        let engine = Engine::open(&test_config()).unwrap();
        let tree = engine.open_tree("one").unwrap();

        let mut txn = Transaction::new();
        txn.put("one", b"k".to_vec(), b"v".to_vec());
        txn.delete("one", b"gone".to_vec());

        let mut replay = Transaction::new();
        for op in txn.ops() {
            match op {
                TransactionOp::Put { tree, key, value } => {
                    replay.put(tree, key.clone(), value.clone())
                }
                TransactionOp::Delete { tree, key } => replay.delete(tree, key.clone()),
            }
        }

        engine.write_transaction(txn).unwrap();
        let after_once: Vec<_> = tree.iter().collect();
        engine.write_transaction(replay).unwrap();
        let after_twice: Vec<_> = tree.iter().collect();
        assert_eq!(after_once, after_twice);
    }

    /// Test: iter_from walks backwards inclusively
    #[test]
    fn test_iter_from_backwards() {
        let engine = Engine::open(&test_config()).unwrap();
        let tree = engine.open_tree("test").unwrap();
        for i in 0u64..5 {
            tree.insert(&i.to_be_bytes(), b"x").unwrap();
        }

        let keys: Vec<u64> = tree
            .iter_from(&3u64.to_be_bytes(), true)
            .map(|(k, _)| u64::from_be_bytes(k.try_into().unwrap()))
            .collect();
        assert_eq!(keys, vec![3, 2, 1, 0]);
    }

    /// Test: watch_prefix resolves on a matching write
    #[tokio::test]
    async fn test_watch_prefix() {
        let engine = Engine::open(&test_config()).unwrap();
        let tree = engine.open_tree("test").unwrap();

        let watcher = tree.watch_prefix(b"room1");
        tree.insert(b"room1\xffevent", b"x").unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), watcher)
            .await
            .expect("watcher resolves after matching write");
    }
}
