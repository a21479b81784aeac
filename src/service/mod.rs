// =============================================================================
// Orbiton Matrix Homeserver Core - Service Container
// =============================================================================
//
// Project: Orbiton - Federated Matrix Homeserver Core
// Contributors: Orbiton Development Team
// License: Apache 2.0 / MIT
//
// Description:
//   Central container for the homeserver core's services: globals, the room
//   services (store surface, indexes, heads, auth chain, state), the event
//   evaluation pipeline, the fetch coordinator, the federation fan-out, the
//   peer pool, the sender and the key service. Built once in dependency
//   order; exposed as `&'static` through the crate-level accessor.
//
// =============================================================================

pub mod feds;
pub mod fetch;
pub mod globals;
pub mod keys;
pub mod pdu;
pub mod peers;
pub mod rooms;
pub mod sending;
pub mod vm;

use tracing::{debug, info};

use crate::{Config, Result};

pub struct Services {
    pub globals: globals::Service,
    pub rooms: rooms::Service,
    pub vm: vm::Service,
    pub fetch: fetch::Service,
    pub feds: feds::Service,
    pub peers: peers::Service,
    pub sending: sending::Service,
    pub keys: keys::Service,
}

impl Services {
    pub fn build<
        D: globals::Data
            + keys::Data
            + rooms::short::Data
            + rooms::timeline::Data
            + rooms::head::Data
            + rooms::refs::Data
            + rooms::state::Data
            + rooms::auth_chain::Data
            + 'static,
    >(
        db: &'static D,
        config: Config,
    ) -> Result<Self> {
        info!("🚀 Initializing Orbiton homeserver core services");

        let globals = globals::Service::load(db, config)?;
        debug!("✅ Globals loaded");

        let rooms = rooms::Service {
            auth_chain: rooms::auth_chain::Service { db },
            head: rooms::head::Service { db },
            refs: rooms::refs::Service { db },
            short: rooms::short::Service { db },
            state: rooms::state::Service { db },
            timeline: rooms::timeline::Service { db },
        };
        debug!("✅ Room services initialized");

        // The sequence counters reseed from the highest durable index;
        // trailing gaps from aborted issues are skipped over.
        let highest = rooms.short.max_eventidx()?;
        let vm = vm::Service::new(highest);
        debug!(highest, "✅ Evaluation pipeline ready");

        let services = Self {
            globals,
            rooms,
            vm,
            fetch: fetch::Service::new(),
            feds: feds::Service,
            peers: peers::Service::new(),
            sending: sending::Service::build(),
            keys: keys::Service { db },
        };

        info!("✅ Services initialized");
        Ok(services)
    }
}
