//! USRP RX - arm a receiver for a PPS-synchronized run and capture to disk
//!
//! Same arming sequence as `usrp-tx`, then records `--duration` seconds of
//! both channels starting exactly at the go time.
//!
//! # Usage
//!
//! ```bash
//! usrp-rx --server-ip 192.168.1.10 --rate 1e6 --duration 5 --output-dir captures
//! ```
//!
//! # Output Format
//!
//! ```text
//! <output-dir>/
//! ├── usrp_samples_<serial>_0.dat   raw sc16, channel 0
//! ├── usrp_samples_<serial>_1.dat   raw sc16, channel 1
//! └── usrp_samples_<serial>.json    capture metadata
//! ```

use anyhow::Result;
use clap::Parser;

use usrp_sync_toolbox::cli::RxArgs;
use usrp_sync_toolbox::commands::run_rx;

fn main() -> Result<()> {
    let args = RxArgs::parse();

    if !args.common.quiet {
        usrp_sync_toolbox::display_license_notice("usrp-rx");
        tracing_subscriber::fmt::init();
    }

    run_rx(&args)?;

    println!();
    println!("Done!");
    println!();
    Ok(())
}
