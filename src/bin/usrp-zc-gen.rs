//! USRP ZC Gen - write the Zadoff-Chu reference sequence file
//!
//! Generates the frequency-domain Zadoff-Chu sequence, zero pads it to the
//! FFT size, converts it to the time domain and stores it as raw sc16, the
//! file `usrp-tx --transmit-reference` reads.
//!
//! # Usage
//!
//! ```bash
//! # Default: u=1, N=813, 1024-point IFFT, 0.85 of full scale
//! usrp-zc-gen
//!
//! # Shorter sequence
//! usrp-zc-gen --root 7 --length 353 --fft-size 512 -o zc-353.dat
//! ```

use anyhow::Result;
use clap::Parser;

use usrp_sync_toolbox::cli::ZcArgs;
use usrp_sync_toolbox::commands::run_zc;

fn main() -> Result<()> {
    let args = ZcArgs::parse();

    if !args.quiet {
        usrp_sync_toolbox::display_license_notice("usrp-zc-gen");
        tracing_subscriber::fmt::init();
    }

    run_zc(&args)?;
    Ok(())
}
