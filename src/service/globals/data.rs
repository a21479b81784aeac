use ruma::{signatures::Ed25519KeyPair, ServerName};

use crate::Result;

pub trait Data: Send + Sync {
    /// Loads the persisted keypair, creating one on first start.
    fn load_keypair(&self) -> Result<Ed25519KeyPair>;
    fn remove_keypair(&self) -> Result<()>;

    fn database_version(&self) -> Result<u64>;
    fn bump_database_version(&self, new_version: u64) -> Result<()>;

    /// Receiver-side transaction dedup: the stored response of an already
    /// processed `PUT /send/{txn_id}`, making redelivery at-most-once.
    fn txn_response(
        &self,
        origin: &ServerName,
        txn_id: &str,
    ) -> Result<Option<serde_json::Value>>;
    fn store_txn_response(
        &self,
        origin: &ServerName,
        txn_id: &str,
        response: &serde_json::Value,
    ) -> Result<()>;
}
