// =============================================================================
// Orbiton Matrix Homeserver Core - Server Keys
// =============================================================================
//
// Project: Orbiton - Federated Matrix Homeserver Core
// Contributors: Orbiton Development Team
// License: Apache 2.0 / MIT
//
// Description:
//   Verify-key management: our own published key set, the store of remote
//   servers' signing keys, direct and notary fetching of missing keys, and
//   event signature verification for the pipeline's VERIFY phase. Key expiry
//   is enforced for room versions that demand it.
//
// =============================================================================

mod data;

use std::{collections::BTreeMap, time::Duration};

pub use data::{Data, SigningKeys};

use http::Method;
use ruma::{
    api::federation::discovery::ServerSigningKeys, serde::Base64, CanonicalJsonObject,
    CanonicalJsonValue, MilliSecondsSinceUnixEpoch, OwnedServerName, ServerName,
};
use tracing::{debug, warn};

use crate::{service::rooms::RoomVersion, services, utils, Error, Result};

pub struct Service {
    pub db: &'static dyn Data,
}

impl Service {
    /// Verifies hashes and signatures of one event against known server
    /// keys, fetching missing keys from the signing servers first.
    #[tracing::instrument(skip(self, value))]
    pub async fn verify_event(
        &self,
        value: &CanonicalJsonObject,
        room_version: &RoomVersion,
    ) -> Result<ruma::signatures::Verified> {
        let origin_server_ts = match value.get("origin_server_ts") {
            Some(CanonicalJsonValue::Integer(ts)) => {
                MilliSecondsSinceUnixEpoch(
                    u64::try_from(i64::from(*ts))
                        .map_err(|_| Error::Conforms("origin_server_ts is negative"))?
                        .try_into()
                        .map_err(|_| Error::Conforms("origin_server_ts out of range"))?,
                )
            }
            _ => return Err(Error::Conforms("event has no origin_server_ts")),
        };

        let signature_servers: Vec<OwnedServerName> = match value.get("signatures") {
            Some(CanonicalJsonValue::Object(signatures)) => signatures
                .keys()
                .filter_map(|name| ServerName::parse(name.as_str()).ok())
                .collect(),
            _ => {
                return Err(Error::VerifyFail(
                    "event carries no signatures".to_owned(),
                ))
            }
        };

        let mut public_key_map = ruma::signatures::PublicKeyMap::new();
        for server in signature_servers {
            let keys = self.signing_keys_for(&server, origin_server_ts, room_version).await?;
            let mut key_set = BTreeMap::new();
            for (key_id, key) in keys {
                key_set.insert(key_id, key);
            }
            public_key_map.insert(server.as_str().to_owned(), key_set);
        }

        ruma::signatures::verify_event(&public_key_map, value, &room_version.rules)
            .map_err(|e| Error::VerifyFail(e.to_string()))
    }

    /// Usable verify keys of a server at an event's timestamp. Expired keys
    /// drop out when the room version enforces validity windows.
    async fn signing_keys_for(
        &self,
        server: &ServerName,
        origin_server_ts: MilliSecondsSinceUnixEpoch,
        room_version: &RoomVersion,
    ) -> Result<BTreeMap<String, Base64>> {
        if server == services().globals.server_name() {
            let mut keys = BTreeMap::new();
            keys.insert(
                format!("ed25519:{}", services().globals.keypair().version()),
                Base64::new(services().globals.keypair().public_key().to_vec()),
            );
            return Ok(keys);
        }

        let mut stored = self.db.signing_keys_for(server)?;
        if stored.is_none() {
            if let Err(e) = self.fetch_signing_keys(server).await {
                warn!(%server, %e, "could not fetch signing keys");
            }
            stored = self.db.signing_keys_for(server)?;
        }

        let Some(stored) = stored else {
            return Err(Error::VerifyFail(format!("no known keys for {server}")));
        };

        let strict = room_version.strict_key_validity;
        let mut usable = BTreeMap::new();
        for (key_id, key) in stored.verify_keys {
            if strict && stored.valid_until_ts < origin_server_ts {
                continue;
            }
            usable.insert(key_id, key.key);
        }
        for (key_id, key) in stored.old_verify_keys {
            if strict && key.expired_ts < origin_server_ts {
                continue;
            }
            usable.insert(key_id, key.key);
        }

        if usable.is_empty() {
            return Err(Error::VerifyFail(format!(
                "all known keys for {server} are expired"
            )));
        }
        Ok(usable)
    }

    /// Fetches a server's keys: direct first, then through the configured
    /// notaries.
    #[tracing::instrument(skip(self))]
    pub async fn fetch_signing_keys(&self, server: &ServerName) -> Result<SigningKeys> {
        let timeout = Duration::from_secs(services().globals.config.federation_timeout_s);

        match services()
            .peers
            .request(
                server,
                Method::GET,
                "/_matrix/key/v2/server",
                None,
                timeout,
            )
            .await
        {
            Ok(response) => {
                if let Ok(keys) =
                    serde_json::from_value::<ServerSigningKeys>(response.clone())
                {
                    debug!(%server, "keys fetched directly");
                    return self.db.add_signing_key_from_origin(server, keys);
                }
                warn!(%server, "direct key response unparsable");
            }
            Err(e) => debug!(%server, %e, "direct key fetch failed"),
        }

        for notary in &services().globals.config.trusted_servers {
            let body = serde_json::json!({
                "server_keys": { server.as_str(): {} }
            });
            let Ok(response) = services()
                .peers
                .request(
                    notary,
                    Method::POST,
                    "/_matrix/key/v2/query",
                    Some(body),
                    timeout,
                )
                .await
            else {
                continue;
            };

            let Some(server_keys) = response.get("server_keys").and_then(|v| v.as_array())
            else {
                continue;
            };
            for entry in server_keys {
                if let Ok(keys) = serde_json::from_value::<ServerSigningKeys>(entry.clone()) {
                    if keys.server_name == server {
                        debug!(%server, %notary, "keys fetched via notary");
                        return self.db.add_signing_key_from_trusted_server(server, keys);
                    }
                }
            }
        }

        Err(Error::NotFound("no notary could provide the keys"))
    }

    /// Verifies a signed request object (X-Matrix authorization) against
    /// the origin's known keys, fetching them if necessary. No expiry
    /// filter: requests verify against any key the origin has published.
    pub async fn verify_request(
        &self,
        origin: &ServerName,
        object: &CanonicalJsonObject,
    ) -> Result<()> {
        let mut stored = self.db.signing_keys_for(origin)?;
        if stored.is_none() {
            self.fetch_signing_keys(origin).await.ok();
            stored = self.db.signing_keys_for(origin)?;
        }
        let Some(stored) = stored else {
            return Err(Error::BadRequest(
                ruma::api::client::error::ErrorKind::MissingToken,
                "origin's signing keys are unknown",
            ));
        };

        let mut key_set = BTreeMap::new();
        for (key_id, key) in stored.verify_keys {
            key_set.insert(key_id, key.key);
        }
        for (key_id, key) in stored.old_verify_keys {
            key_set.insert(key_id, key.key);
        }
        let mut public_key_map = ruma::signatures::PublicKeyMap::new();
        public_key_map.insert(origin.as_str().to_owned(), key_set);

        ruma::signatures::verify_json(&public_key_map, object)
            .map_err(|e| Error::VerifyFail(format!("request signature invalid: {e}")))
    }

    /// Our own key descriptor for `GET /_matrix/key/v2/server`, signed.
    pub fn own_server_keys(&self) -> Result<serde_json::Value> {
        let server_name = services().globals.server_name();
        let keypair = services().globals.keypair();
        let valid_until =
            utils::millis_since_unix_epoch() + Duration::from_secs(7 * 86400).as_millis() as u64;

        let mut verify_keys = serde_json::Map::new();
        verify_keys.insert(
            format!("ed25519:{}", keypair.version()),
            serde_json::json!({
                "key": Base64::<ruma::serde::base64::Standard>::new(keypair.public_key().to_vec()),
            }),
        );

        let mut object = utils::to_canonical_object(serde_json::json!({
            "server_name": server_name.as_str(),
            "verify_keys": verify_keys,
            "old_verify_keys": {},
            "valid_until_ts": valid_until,
        }))?;

        ruma::signatures::sign_json(server_name.as_str(), keypair, &mut object)
            .map_err(|e| Error::Internal(format!("signing key descriptor failed: {e}")))?;

        Ok(serde_json::to_value(&object).expect("canonical object serializes"))
    }
}
