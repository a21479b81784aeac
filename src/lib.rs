// =============================================================================
// Orbiton Matrix Homeserver Core - Library Crate
// =============================================================================
//
// Project: Orbiton - Federated Matrix Homeserver Core
// Contributors: Orbiton Development Team
// License: Apache 2.0 / MIT
//
// Description:
//   Core library of the Orbiton homeserver: the content-addressed event
//   store, the phased event evaluation pipeline, room state resolution and
//   the authorization chain, and the federation I/O core.
//
// =============================================================================

pub mod api;
pub mod clap;
pub mod config;
pub mod database;
pub mod service;
pub mod test_utils;
pub mod utils;

pub use config::Config;
pub use database::KeyValueDatabase;
pub use service::{pdu::PduEvent, Services};
pub use utils::error::{Error, Result};

// Re-export the protocol stack for downstream tooling.
pub use ruma;
pub use tokio;
pub use tracing;

use std::sync::OnceLock;

static SERVICES: OnceLock<Services> = OnceLock::new();

/// The process-wide service container. Initialized exactly once, in a fixed
/// order, before the listener starts.
pub fn services() -> &'static Services {
    SERVICES.get().expect("services are initialized")
}

/// Installs the service container; fails if called twice.
pub fn init_services(services: Services) -> Result<()> {
    SERVICES
        .set(services)
        .map_err(|_| Error::Internal("services already initialized".to_owned()))
}
