// =============================================================================
// Orbiton Matrix Homeserver Core - RocksDB Storage Engine
// =============================================================================
//
// Project: Orbiton - Federated Matrix Homeserver Core
// Contributors: Orbiton Development Team
// License: Apache 2.0 / MIT
//
// Description:
//   RocksDB behind the adapter: one column family per tree, cross-tree
//   transactions as a single WriteBatch, WAL flushed on sync(). The database
//   directory and its column-family subdirectories must not be managed
//   out-of-band.
//
// =============================================================================

use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{Arc, RwLock},
};

use rocksdb::{
    BoundColumnFamily, DBWithThreadMode, Direction, IteratorMode, MultiThreaded, Options,
    WriteBatch,
};
use tokio::sync::watch;

use super::{increment_bytes, KeyValueDatabaseEngine, KvTree, Transaction, TransactionOp};
use crate::{Config, Error, Result};

type Db = DBWithThreadMode<MultiThreaded>;

pub struct Engine {
    rocks: Arc<Db>,
    max_open_files: i32,
    cache: rocksdb::Cache,
    old_cfs: Vec<String>,
    increment_lock: Arc<RwLock<()>>,
}

fn db_options(max_open_files: i32, rocksdb_cache: &rocksdb::Cache) -> Options {
    let mut block_based_options = rocksdb::BlockBasedOptions::default();
    block_based_options.set_block_cache(rocksdb_cache);
    block_based_options.set_bloom_filter(10.0, false);
    block_based_options.set_block_size(4 * 1024);
    block_based_options.set_cache_index_and_filter_blocks(true);

    let mut db_opts = Options::default();
    db_opts.set_block_based_table_factory(&block_based_options);
    db_opts.create_if_missing(true);
    db_opts.create_missing_column_families(true);
    db_opts.increase_parallelism(num_cpus());
    db_opts.set_max_open_files(max_open_files);
    db_opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
    db_opts.set_compaction_style(rocksdb::DBCompactionStyle::Level);
    db_opts.set_level_compaction_dynamic_level_bytes(true);

    // Lazy WAL by default; sync() forces it down.
    db_opts.set_manual_wal_flush(true);

    db_opts
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(1)
}

fn map_err(e: rocksdb::Error) -> Error {
    Error::Corruption {
        repairable: false,
        detail: e.to_string(),
    }
}

impl KeyValueDatabaseEngine for Engine {
    fn open(config: &Config) -> Result<Self> {
        let cache_capacity_bytes = (config.db_cache_capacity_mb * 1024.0 * 1024.0) as usize;
        let rocksdb_cache = rocksdb::Cache::new_lru_cache(cache_capacity_bytes);

        let db_opts = db_options(512, &rocksdb_cache);

        let cfs = Db::list_cf(&db_opts, &config.database_path).unwrap_or_default();

        let rocks = Db::open_cf_descriptors(
            &db_opts,
            &config.database_path,
            cfs.iter().map(|name| {
                rocksdb::ColumnFamilyDescriptor::new(name, db_options(512, &rocksdb_cache))
            }),
        )
        .map_err(map_err)?;

        Ok(Self {
            rocks: Arc::new(rocks),
            max_open_files: 512,
            cache: rocksdb_cache,
            old_cfs: cfs,
            increment_lock: Arc::new(RwLock::new(())),
        })
    }

    fn open_tree(&self, name: &'static str) -> Result<Arc<dyn KvTree>> {
        if !self.old_cfs.contains(&name.to_owned()) {
            // An unknown tree name on an existing database is a new column.
            let _ = self
                .rocks
                .create_cf(name, &db_options(self.max_open_files, &self.cache));
        }

        Ok(Arc::new(RocksDbTree {
            name,
            db: Arc::clone(&self.rocks),
            increment_lock: Arc::clone(&self.increment_lock),
            watchers: RwLock::new(HashMap::new()),
        }))
    }

    fn write_transaction(&self, txn: Transaction) -> Result<()> {
        let mut batch = WriteBatch::default();
        for op in txn.ops() {
            match op {
                TransactionOp::Put { tree, key, value } => {
                    batch.put_cf(&cf(&self.rocks, tree)?, key, value);
                }
                TransactionOp::Delete { tree, key } => {
                    batch.delete_cf(&cf(&self.rocks, tree)?, key);
                }
            }
        }
        self.rocks.write(batch).map_err(map_err)
    }

    fn flush(&self) -> Result<()> {
        self.rocks.flush().map_err(map_err)
    }

    fn sync(&self) -> Result<()> {
        self.rocks.flush_wal(true).map_err(map_err)
    }

    fn memory_usage(&self) -> Result<String> {
        let stats =
            rocksdb::perf::get_memory_usage_stats(Some(&[&*self.rocks]), Some(&[&self.cache]))
                .map_err(map_err)?;
        Ok(format!(
            "Approximate memory usage of all the mem-tables: {:.3} MB\n\
             Approximate memory usage of un-flushed mem-tables: {:.3} MB\n\
             Approximate memory usage of all the table readers: {:.3} MB\n\
             Approximate memory usage by cache: {:.3} MB",
            stats.mem_table_total as f64 / 1024.0 / 1024.0,
            stats.mem_table_unflushed as f64 / 1024.0 / 1024.0,
            stats.mem_table_readers_total as f64 / 1024.0 / 1024.0,
            stats.cache_total as f64 / 1024.0 / 1024.0,
        ))
    }
}

fn cf<'a>(db: &'a Db, name: &str) -> Result<Arc<BoundColumnFamily<'a>>> {
    db.cf_handle(name)
        .ok_or_else(|| Error::bad_database("column family is missing"))
}

pub struct RocksDbTree {
    name: &'static str,
    db: Arc<Db>,
    increment_lock: Arc<RwLock<()>>,
    watchers: RwLock<HashMap<Vec<u8>, watch::Sender<()>>>,
}

impl RocksDbTree {
    fn wake_watchers(&self, key: &[u8]) {
        let watchers = self.watchers.read().expect("lock is not poisoned");
        for (prefix, tx) in watchers.iter() {
            if key.starts_with(prefix) {
                let _ = tx.send(());
            }
        }
    }
}

impl KvTree for RocksDbTree {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.db
            .get_cf(&cf(&self.db, self.name)?, key)
            .map_err(map_err)
    }

    fn insert(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.db
            .put_cf(&cf(&self.db, self.name)?, key, value)
            .map_err(map_err)?;
        self.wake_watchers(key);
        Ok(())
    }

    fn insert_batch(&self, iter: &mut dyn Iterator<Item = (Vec<u8>, Vec<u8>)>) -> Result<()> {
        let handle = cf(&self.db, self.name)?;
        let mut batch = WriteBatch::default();
        for (key, value) in iter {
            batch.put_cf(&handle, key, value);
        }
        self.db.write(batch).map_err(map_err)
    }

    fn remove(&self, key: &[u8]) -> Result<()> {
        self.db
            .delete_cf(&cf(&self.db, self.name)?, key)
            .map_err(map_err)
    }

    fn iter<'a>(&'a self) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a> {
        let handle = cf(&self.db, self.name).expect("column family exists");
        Box::new(
            self.db
                .iterator_cf(&handle, IteratorMode::Start)
                .filter_map(|r| r.ok())
                .map(|(k, v)| (k.to_vec(), v.to_vec())),
        )
    }

    fn iter_from<'a>(
        &'a self,
        from: &[u8],
        backwards: bool,
    ) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a> {
        let handle = cf(&self.db, self.name).expect("column family exists");
        let direction = if backwards {
            Direction::Reverse
        } else {
            Direction::Forward
        };
        Box::new(
            self.db
                .iterator_cf(&handle, IteratorMode::From(from, direction))
                .filter_map(|r| r.ok())
                .map(|(k, v)| (k.to_vec(), v.to_vec())),
        )
    }

    fn increment(&self, key: &[u8]) -> Result<Vec<u8>> {
        let _guard = self
            .increment_lock
            .write()
            .map_err(|_| Error::bad_database("increment lock poisoned"))?;

        let handle = cf(&self.db, self.name)?;
        let old = self.db.get_cf(&handle, key).map_err(map_err)?;
        let new = increment_bytes(old.as_deref());
        self.db.put_cf(&handle, key, &new).map_err(map_err)?;
        Ok(new)
    }

    fn scan_prefix<'a>(
        &'a self,
        prefix: Vec<u8>,
    ) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a> {
        let handle = cf(&self.db, self.name).expect("column family exists");
        Box::new(
            self.db
                .iterator_cf(&handle, IteratorMode::From(&prefix, Direction::Forward))
                .filter_map(|r| r.ok())
                .map(|(k, v)| (k.to_vec(), v.to_vec()))
                .take_while(move |(k, _)| k.starts_with(&prefix)),
        )
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
            let _ = rx.changed().await;
        })
    }
}
