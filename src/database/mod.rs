// =============================================================================
// Orbiton Matrix Homeserver Core - Events Database
// =============================================================================
//
// Project: Orbiton - Federated Matrix Homeserver Core
// Contributors: Orbiton Development Team
// License: Apache 2.0 / MIT
//
// Description:
//   The "events" database: every durable column of the event store, opened
//   through the engine adapter. All external references into the store are by
//   event_idx (preferred) or event_id; rows are owned solely by the store.
//
// Architecture:
//   • One tree per logical column, names are stable on-disk identifiers
//   • Cross-tree commits go through KeyValueDatabaseEngine::write_transaction
//   • In-memory caches may evict at any time; durable rows never do
//
// =============================================================================

pub mod abstraction;
pub mod key_value;

use std::sync::{Arc, Mutex as StdMutex};

use lru_cache::LruCache;
use ruma::OwnedEventId;
use tracing::{error, info};

use crate::{service::pdu::PduEvent, Config, Error, Result};
use abstraction::{KeyValueDatabaseEngine, KvTree, Transaction};

pub struct KeyValueDatabase {
    pub(crate) engine: Arc<dyn KeyValueDatabaseEngine>,

    // §3.4 columns
    pub(crate) eventid_eventidx: Arc<dyn KvTree>,
    pub(crate) eventidx_eventid: Arc<dyn KvTree>,
    pub(crate) eventidx_json: Arc<dyn KvTree>,
    pub(crate) eventidx_field: Arc<dyn KvTree>,
    pub(crate) statenode: Arc<dyn KvTree>,
    pub(crate) roomid_head: Arc<dyn KvTree>,
    pub(crate) roomid_state: Arc<dyn KvTree>,
    pub(crate) eventrefs: Arc<dyn KvTree>,
    pub(crate) eventhorizon: Arc<dyn KvTree>,
    pub(crate) sender_eventidx: Arc<dyn KvTree>,
    pub(crate) type_eventidx: Arc<dyn KvTree>,
    pub(crate) origin_eventidx: Arc<dyn KvTree>,
    pub(crate) roomid_depth: Arc<dyn KvTree>,
    pub(crate) softfailed_eventidx: Arc<dyn KvTree>,
    pub(crate) redacted_eventidx: Arc<dyn KvTree>,

    // Operational columns
    pub(crate) global: Arc<dyn KvTree>,
    pub(crate) server_signingkeys: Arc<dyn KvTree>,
    pub(crate) disabled_rooms: Arc<dyn KvTree>,
    pub(crate) origintxnid_response: Arc<dyn KvTree>,
    pub(crate) authchain_cache_tree: Arc<dyn KvTree>,

    // Caches; evictable at any time, never authoritative.
    pub(crate) pdu_cache: StdMutex<LruCache<OwnedEventId, Arc<PduEvent>>>,
    pub(crate) auth_chain_cache: StdMutex<LruCache<Vec<u64>, Arc<std::collections::HashSet<u64>>>>,
}

/// Every tree name, for purge and index-rebuild iteration.
pub const ALL_TREES: &[&str] = &[
    "eventid_eventidx",
    "eventidx_eventid",
    "eventidx_json",
    "eventidx_field",
    "statenode",
    "roomid_head",
    "roomid_state",
    "eventrefs",
    "eventhorizon",
    "sender_eventidx",
    "type_eventidx",
    "origin_eventidx",
    "roomid_depth",
    "softfailed_eventidx",
    "redacted_eventidx",
    "global",
    "server_signingkeys",
    "disabled_rooms",
    "origintxnid_response",
    "authchain_cache",
];

impl KeyValueDatabase {
    /// Opens (creating if necessary) the events database for the configured
    /// backend and leaks it: services hold `&'static` data handles for the
    /// process lifetime, torn down with the process.
    pub fn load_or_create(config: &Config) -> Result<&'static Self> {
        let engine: Arc<dyn KeyValueDatabaseEngine> = match config.database_backend.as_str() {
            "memory" => Arc::new(abstraction::memory::Engine::open(config)?),
            #[cfg(feature = "backend_rocksdb")]
            "rocksdb" => {
                std::fs::create_dir_all(&config.database_path)?;
                Arc::new(abstraction::rocksdb::Engine::open(config)?)
            }
            backend => {
                error!("Database backend {} is not available in this build", backend);
                return Err(Error::bad_config("database backend not supported"));
            }
        };

        let cache_entries =
            (1000.0 * config.cache_capacity_modifier) as usize;

        let db = Self {
            eventid_eventidx: engine.open_tree("eventid_eventidx")?,
            eventidx_eventid: engine.open_tree("eventidx_eventid")?,
            eventidx_json: engine.open_tree("eventidx_json")?,
            eventidx_field: engine.open_tree("eventidx_field")?,
            statenode: engine.open_tree("statenode")?,
            roomid_head: engine.open_tree("roomid_head")?,
            roomid_state: engine.open_tree("roomid_state")?,
            eventrefs: engine.open_tree("eventrefs")?,
            eventhorizon: engine.open_tree("eventhorizon")?,
            sender_eventidx: engine.open_tree("sender_eventidx")?,
            type_eventidx: engine.open_tree("type_eventidx")?,
            origin_eventidx: engine.open_tree("origin_eventidx")?,
            roomid_depth: engine.open_tree("roomid_depth")?,
            softfailed_eventidx: engine.open_tree("softfailed_eventidx")?,
            redacted_eventidx: engine.open_tree("redacted_eventidx")?,
            global: engine.open_tree("global")?,
            server_signingkeys: engine.open_tree("server_signingkeys")?,
            disabled_rooms: engine.open_tree("disabled_rooms")?,
            origintxnid_response: engine.open_tree("origintxnid_response")?,
            authchain_cache_tree: engine.open_tree("authchain_cache")?,
            pdu_cache: StdMutex::new(LruCache::new(cache_entries)),
            auth_chain_cache: StdMutex::new(LruCache::new(cache_entries)),
            engine,
        };

        info!("📦 Events database opened ({})", config.database_backend);

        Ok(Box::leak(Box::new(db)))
    }

    pub fn apply(&self, txn: Transaction) -> Result<()> {
        self.engine.write_transaction(txn)
    }

    pub fn flush(&self) -> Result<()> {
        self.engine.flush()
    }

    /// Forces the write-ahead log down; `retired` advances behind this.
    pub fn sync(&self) -> Result<()> {
        self.engine.sync()
    }

    pub fn memory_usage(&self) -> Result<String> {
        self.engine.memory_usage()
    }
}
