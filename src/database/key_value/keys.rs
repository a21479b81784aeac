use ruma::{api::federation::discovery::ServerSigningKeys, ServerName};

use crate::{
    database::KeyValueDatabase,
    service::keys::{Data, SigningKeys},
    Error, Result,
};

impl Data for KeyValueDatabase {
    fn add_signing_key_from_trusted_server(
        &self,
        origin: &ServerName,
        new_keys: ServerSigningKeys,
    ) -> Result<SigningKeys> {
        let mut keys = self
            .signing_keys_for(origin)?
            .unwrap_or_else(|| SigningKeys::empty_with_validity(7));

        // A notary only ever extends; it cannot retire the origin's own
        // published keys.
        let new_keys = SigningKeys::from(new_keys);
        keys.verify_keys.extend(new_keys.verify_keys);
        keys.old_verify_keys.extend(new_keys.old_verify_keys);
        keys.valid_until_ts = std::cmp::max(keys.valid_until_ts, new_keys.valid_until_ts);

        self.store_keys(origin, &keys)?;
        Ok(keys)
    }

    fn add_signing_key_from_origin(
        &self,
        origin: &ServerName,
        new_keys: ServerSigningKeys,
    ) -> Result<SigningKeys> {
        let old = self.signing_keys_for(origin)?;
        let mut keys = SigningKeys::from(new_keys);

        // Keys the origin stopped publishing retire into old_verify_keys so
        // a compromised key cannot keep signing.
        if let Some(old) = old {
            for (key_id, key) in old.verify_keys {
                if !keys.verify_keys.contains_key(&key_id) {
                    keys.old_verify_keys.insert(
                        key_id,
                        ruma::api::federation::discovery::OldVerifyKey::new(
                            old.valid_until_ts,
                            key.key,
                        ),
                    );
                }
            }
            for (key_id, key) in old.old_verify_keys {
                keys.old_verify_keys.entry(key_id).or_insert(key);
            }
        }

        self.store_keys(origin, &keys)?;
        Ok(keys)
    }

    fn signing_keys_for(&self, origin: &ServerName) -> Result<Option<SigningKeys>> {
        self.server_signingkeys
            .get(origin.as_bytes())?
            .map(|bytes| {
                serde_json::from_slice(&bytes)
                    .map_err(|_| Error::bad_database("invalid signing keys in db"))
            })
            .transpose()
    }
}

impl KeyValueDatabase {
    fn store_keys(&self, origin: &ServerName, keys: &SigningKeys) -> Result<()> {
        self.server_signingkeys.insert(
            origin.as_bytes(),
            &serde_json::to_vec(keys).expect("signing keys serialize"),
        )
    }
}
