// =============================================================================
// Orbiton Matrix Homeserver Core - Configuration
// =============================================================================
//
// Project: Orbiton - Federated Matrix Homeserver Core
// Contributors: Orbiton Development Team
// License: Apache 2.0 / MIT
//
// Description:
//   Server configuration loaded from a TOML file with ORBITON_ environment
//   overrides. Covers the listener, the events database, federation timeouts
//   and the supported room version window.
//
// =============================================================================

use std::{
    collections::BTreeMap,
    fmt,
    net::{IpAddr, Ipv4Addr},
    path::PathBuf,
};

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use ruma::{OwnedServerName, RoomVersionId};
use serde::Deserialize;
use tracing::warn;

use crate::{Error, Result};

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The name other homeservers know this server by. Immutable once the
    /// database has been created.
    pub server_name: OwnedServerName,

    #[serde(default = "default_address")]
    pub address: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_database_backend")]
    pub database_backend: String,
    pub database_path: PathBuf,
    #[serde(default = "default_db_cache_capacity_mb")]
    pub db_cache_capacity_mb: f64,
    #[serde(default = "default_cache_capacity_modifier")]
    pub cache_capacity_modifier: f64,

    #[serde(default = "true_fn")]
    pub allow_federation: bool,
    /// Peers we ask for keys of third servers (notary requests).
    #[serde(default)]
    pub trusted_servers: Vec<OwnedServerName>,
    #[serde(default = "default_federation_timeout_s")]
    pub federation_timeout_s: u64,
    /// Upper bound of concurrently outstanding fetches per room.
    #[serde(default = "default_room_fetch_concurrency")]
    pub room_fetch_concurrency: usize,
    /// Tags a single peer link carries before submitters have to wait.
    #[serde(default = "default_peer_link_capacity")]
    pub peer_link_capacity: usize,

    #[serde(default = "default_default_room_version")]
    pub default_room_version: RoomVersionId,

    #[serde(default = "default_log")]
    pub log: String,

    /// Optional `.well-known/matrix/server` delegation target.
    #[serde(default)]
    pub well_known_server: Option<String>,

    #[serde(flatten)]
    pub catchall: BTreeMap<String, figment::value::Value>,
}

const DEPRECATED_KEYS: &[&str] = &["cache_capacity", "max_concurrent_requests"];

impl Config {
    pub fn load(path: Option<&std::path::Path>) -> Result<Self> {
        let mut figment = Figment::new();
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment
            .merge(Env::prefixed("ORBITON_").global())
            .extract::<Config>()
            .map_err(|e| {
                tracing::error!("Configuration is invalid: {}", e);
                Error::bad_config("configuration is invalid")
            })
    }

    pub fn warn_deprecated(&self) {
        let mut was_deprecated = false;
        for key in self
            .catchall
            .keys()
            .filter(|key| DEPRECATED_KEYS.iter().any(|s| s == key))
        {
            warn!("Config parameter {} is deprecated", key);
            was_deprecated = true;
        }

        if was_deprecated {
            warn!("Read the documentation for current config parameters");
        }
    }

    /// Room versions this server can fully evaluate. Versions above the
    /// window are stored and forwarded but not authored.
    pub fn supported_room_versions(&self) -> Vec<RoomVersionId> {
        vec![
            RoomVersionId::V1,
            RoomVersionId::V2,
            RoomVersionId::V3,
            RoomVersionId::V4,
            RoomVersionId::V5,
            RoomVersionId::V6,
        ]
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lines = [
            ("Server name", self.server_name.as_str().to_owned()),
            ("Database backend", self.database_backend.clone()),
            ("Database path", self.database_path.display().to_string()),
            ("Federation", self.allow_federation.to_string()),
            (
                "Default room version",
                self.default_room_version.to_string(),
            ),
        ];

        for (name, value) in lines {
            writeln!(f, "{}: {}", name, value)?;
        }
        Ok(())
    }
}

fn true_fn() -> bool {
    true
}

fn default_address() -> IpAddr {
    Ipv4Addr::LOCALHOST.into()
}

fn default_port() -> u16 {
    8448
}

fn default_database_backend() -> String {
    "rocksdb".to_owned()
}

fn default_db_cache_capacity_mb() -> f64 {
    300.0
}

fn default_cache_capacity_modifier() -> f64 {
    1.0
}

fn default_federation_timeout_s() -> u64 {
    30
}

fn default_room_fetch_concurrency() -> usize {
    8
}

fn default_peer_link_capacity() -> usize {
    16
}

fn default_log() -> String {
    "warn,orbiton=info".to_owned()
}

pub fn default_default_room_version() -> RoomVersionId {
    RoomVersionId::V6
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Config {
        Figment::new()
            .merge(Toml::string(
                r#"
                server_name = "orbiton.rs"
                database_path = "/tmp/orbiton-test"
                database_backend = "memory"
                "#,
            ))
            .extract()
            .expect("minimal config parses")
    }

    /// Test: defaults fill every field the file omits
    #[test]
    fn test_minimal_config_defaults() {
        let config = minimal();
        assert_eq!(config.server_name.as_str(), "orbiton.rs");
        assert_eq!(config.port, 8448);
        assert!(config.allow_federation);
        assert_eq!(config.default_room_version, RoomVersionId::V6);
        assert_eq!(config.federation_timeout_s, 30);
    }

    /// Test: supported room version window is exactly 1 through 6
    #[test]
    fn test_supported_room_versions() {
        let config = minimal();
        let versions = config.supported_room_versions();
        assert_eq!(versions.len(), 6);
        assert!(versions.contains(&RoomVersionId::V1));
        assert!(versions.contains(&RoomVersionId::V6));
        assert!(!versions.contains(&RoomVersionId::V10));
    }
}
