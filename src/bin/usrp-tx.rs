//! USRP TX - arm a transmitter for a PPS-synchronized run
//!
//! Configures external clock and time references, sets the front-panel GPIO
//! lines up as software-controlled outputs driven low, announces the device
//! serial to the sync server and waits for its release. Then zeroes the device
//! clock on the next PPS edge and queues the GPIO "go" edge at `--go-time`.
//!
//! # Usage
//!
//! ```bash
//! # Wait for the sync server before arming
//! usrp-tx --server-ip 192.168.1.10
//!
//! # Also transmit the reference sequence as a burst at the go time
//! usrp-tx --server-ip 192.168.1.10 --transmit-reference --reference-file zc-sequence-sc16.dat
//!
//! # Stand-alone
//! usrp-tx --ignore-server
//! ```

use anyhow::Result;
use clap::Parser;

use usrp_sync_toolbox::cli::TxArgs;
use usrp_sync_toolbox::commands::run_tx;

fn main() -> Result<()> {
    let args = TxArgs::parse();

    if !args.common.quiet {
        usrp_sync_toolbox::display_license_notice("usrp-tx");
        tracing_subscriber::fmt::init();
    }

    run_tx(&args)?;

    println!();
    println!("Done!");
    println!();
    Ok(())
}
