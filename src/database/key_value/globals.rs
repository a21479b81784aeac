use ruma::signatures::Ed25519KeyPair;
use tracing::debug;

use crate::{database::KeyValueDatabase, service, utils, Error, Result};

const KEYPAIR_KEY: &[u8] = b"keypair";
const VERSION_KEY: &[u8] = b"version";

impl service::globals::Data for KeyValueDatabase {
    fn load_keypair(&self) -> Result<Ed25519KeyPair> {
        let keypair_bytes = match self.global.get(KEYPAIR_KEY)? {
            Some(bytes) => bytes,
            None => {
                // First start: generate and persist a fresh key, prefixed
                // with a random version.
                let mut value = utils::random_string(8).into_bytes();
                value.push(utils::KEY_SEPARATOR);
                value.extend_from_slice(
                    &Ed25519KeyPair::generate()
                        .map_err(|_| Error::bad_database("keypair generation failed"))?,
                );
                self.global.insert(KEYPAIR_KEY, &value)?;
                debug!("generated new server keypair");
                value
            }
        };

        let mut parts = keypair_bytes.splitn(2, |&b| b == utils::KEY_SEPARATOR);
        let version = parts
            .next()
            .filter(|bytes| !bytes.is_empty())
            .ok_or_else(|| Error::bad_database("stored keypair has no version"))
            .and_then(utils::string_from_bytes)?;
        let der = parts
            .next()
            .ok_or_else(|| Error::bad_database("stored keypair has no key material"))?;

        Ed25519KeyPair::from_der(der, version)
            .map_err(|_| Error::bad_database("stored keypair is invalid"))
    }

    fn remove_keypair(&self) -> Result<()> {
        self.global.remove(KEYPAIR_KEY)
    }

    fn database_version(&self) -> Result<u64> {
        self.global
            .get(VERSION_KEY)?
            .map_or(Ok(0), |bytes| utils::u64_from_bytes(&bytes))
    }

    fn bump_database_version(&self, new_version: u64) -> Result<()> {
        self.global
            .insert(VERSION_KEY, &new_version.to_be_bytes())
    }

    fn txn_response(
        &self,
        origin: &ruma::ServerName,
        txn_id: &str,
    ) -> Result<Option<serde_json::Value>> {
        self.origintxnid_response
            .get(&utils::make_key(&[origin.as_bytes(), txn_id.as_bytes()]))?
            .map(|bytes| {
                serde_json::from_slice(&bytes)
                    .map_err(|_| Error::bad_database("invalid stored txn response"))
            })
            .transpose()
    }

    fn store_txn_response(
        &self,
        origin: &ruma::ServerName,
        txn_id: &str,
        response: &serde_json::Value,
    ) -> Result<()> {
        self.origintxnid_response.insert(
            &utils::make_key(&[origin.as_bytes(), txn_id.as_bytes()]),
            &serde_json::to_vec(response).expect("response serializes"),
        )
    }
}
