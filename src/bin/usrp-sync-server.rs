//! USRP Sync Server - reference coordinator for the ready / go handshake
//!
//! Answers each device's readiness announcement, and once the expected number
//! of distinct serials has checked in, broadcasts a single release.
//!
//! # Usage
//!
//! ```bash
//! usrp-sync-server --expected 3
//! usrp-sync-server --expected 2 --token SYNC --release-delay 1.5 --report sync_report.json
//! ```

use anyhow::Result;
use clap::Parser;

use usrp_sync_toolbox::cli::ServerArgs;
use usrp_sync_toolbox::commands::run_server;

fn main() -> Result<()> {
    let args = ServerArgs::parse();

    if !args.quiet {
        usrp_sync_toolbox::display_license_notice("usrp-sync-server");
        tracing_subscriber::fmt::init();
    }

    run_server(&args)?;
    Ok(())
}
