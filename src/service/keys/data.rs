use std::{
    collections::BTreeMap,
    time::{Duration, SystemTime},
};

use ruma::{
    api::federation::discovery::{OldVerifyKey, ServerSigningKeys, VerifyKey},
    MilliSecondsSinceUnixEpoch, ServerName,
};
use serde::{Deserialize, Serialize};

use crate::Result;

/// Similar to ServerSigningKeys, but drops the fields we don't require
/// post-validation.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SigningKeys {
    pub verify_keys: BTreeMap<String, VerifyKey>,
    pub old_verify_keys: BTreeMap<String, OldVerifyKey>,
    pub valid_until_ts: MilliSecondsSinceUnixEpoch,
}

impl From<ServerSigningKeys> for SigningKeys {
    fn from(value: ServerSigningKeys) -> Self {
        let ServerSigningKeys {
            verify_keys,
            old_verify_keys,
            valid_until_ts,
            ..
        } = value;

        Self {
            verify_keys: verify_keys
                .into_iter()
                .map(|(id, key)| (id.to_string(), key))
                .collect(),
            old_verify_keys: old_verify_keys
                .into_iter()
                .map(|(id, key)| (id.to_string(), key))
                .collect(),
            valid_until_ts,
        }
    }
}

impl SigningKeys {
    pub fn empty_with_validity(days: u64) -> Self {
        Self {
            verify_keys: BTreeMap::new(),
            old_verify_keys: BTreeMap::new(),
            valid_until_ts: MilliSecondsSinceUnixEpoch::from_system_time(
                SystemTime::now() + Duration::from_secs(days * 86400),
            )
            .expect("validity fits the timestamp range"),
        }
    }
}

pub trait Data: Send + Sync {
    /// Only extends the cached keys; verify_keys stay usable so requests
    /// from the origin keep validating.
    fn add_signing_key_from_trusted_server(
        &self,
        origin: &ServerName,
        new_keys: ServerSigningKeys,
    ) -> Result<SigningKeys>;

    /// Extends cached keys and retires verify_keys absent from the new set
    /// into old_verify_keys.
    fn add_signing_key_from_origin(
        &self,
        origin: &ServerName,
        new_keys: ServerSigningKeys,
    ) -> Result<SigningKeys>;

    fn signing_keys_for(&self, origin: &ServerName) -> Result<Option<SigningKeys>>;
}
