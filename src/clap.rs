// =============================================================================
// Orbiton Matrix Homeserver Core - Command Line Arguments
// =============================================================================
//
// Project: Orbiton - Federated Matrix Homeserver Core
// Contributors: Orbiton Development Team
// License: Apache 2.0 / MIT
//
// =============================================================================

use std::path::PathBuf;

use clap::Parser;

/// Command line arguments.
#[derive(Parser, Debug)]
#[clap(about, version)]
pub struct Args {
    /// Path to the configuration file; environment variables prefixed with
    /// ORBITON_ override its values.
    #[clap(short, long)]
    pub config: Option<PathBuf>,
}

pub fn parse() -> Args {
    Args::parse()
}
