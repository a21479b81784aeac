// =============================================================================
// Orbiton Matrix Homeserver Core - Column Implementations
// =============================================================================
//
// Project: Orbiton - Federated Matrix Homeserver Core
// Contributors: Orbiton Development Team
// License: Apache 2.0 / MIT
//
// Description:
//   Implementations of the service data traits over the durable columns.
//
// =============================================================================

mod globals;
mod keys;
mod rooms;
