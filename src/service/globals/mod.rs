// =============================================================================
// Orbiton Matrix Homeserver Core - Global Service
// =============================================================================
//
// Project: Orbiton - Federated Matrix Homeserver Core
// Contributors: Orbiton Development Team
// License: Apache 2.0 / MIT
//
// Description:
//   Process-wide handles: configuration, the server's signing keypair, the
//   federation HTTP client, the supported room-version window and the
//   shutdown flag. Constructed first, torn down last.
//
// =============================================================================

mod data;

use std::sync::{atomic::AtomicBool, Arc};

pub use data::Data;

use ruma::{RoomVersionId, ServerName};
use tracing::{error, info};

use crate::{Config, Error, Result};

pub struct Service {
    pub db: &'static dyn Data,
    pub config: Config,
    keypair: Arc<ruma::signatures::Ed25519KeyPair>,
    federation_client: reqwest::Client,
    pub shutdown: AtomicBool,
}

impl Service {
    pub fn load(db: &'static dyn Data, config: Config) -> Result<Self> {
        let keypair = match db.load_keypair() {
            Ok(k) => Arc::new(k),
            Err(e) => {
                error!("Keypair invalid: {}. Deleting...", e);
                db.remove_keypair()?;
                return Err(e);
            }
        };

        let federation_client = reqwest::Client::builder()
            .user_agent(concat!("orbiton/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|_| Error::bad_config("failed to build federation HTTP client"))?;

        info!(
            "🔑 Server keypair ready (ed25519:{})",
            keypair.version()
        );

        Ok(Self {
            db,
            config,
            keypair,
            federation_client,
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn server_name(&self) -> &ServerName {
        self.config.server_name.as_ref()
    }

    /// Returns this server's keypair.
    pub fn keypair(&self) -> &ruma::signatures::Ed25519KeyPair {
        &self.keypair
    }

    /// Client for federation requests; cheap to clone.
    pub fn federation_client(&self) -> reqwest::Client {
        self.federation_client.clone()
    }

    pub fn supported_room_versions(&self) -> Vec<RoomVersionId> {
        self.config.supported_room_versions()
    }

    pub fn database_version(&self) -> Result<u64> {
        self.db.database_version()
    }

    pub fn bump_database_version(&self, new_version: u64) -> Result<()> {
        self.db.bump_database_version(new_version)
    }

    pub async fn shutdown(&self) {
        self.shutdown
            .store(true, std::sync::atomic::Ordering::Relaxed);
        info!("Shutdown signal received");
    }
}
