//! USRP Sync Toolbox - PPS-synchronized transmit and receive runs across multiple USRPs
//!
//! This crate provides command-line tools and library functions for arming several USRP
//! software-defined radios against a shared external PPS / 10 MHz reference and releasing
//! them together through a small ZeroMQ "ready / go" handshake.
//!
//! # Overview
//!
//! Each tool configures its device (external clock and time source, front-panel GPIO as
//! software-controlled outputs), announces its serial number to a sync server and blocks
//! until the server broadcasts a release. It then zeroes the device clock on the next PPS
//! edge and queues a timed GPIO edge, so every unit signals "go" on the same device-clock
//! instant.
//!
//! # Command-Line Tools
//!
//! - `usrp-tx` - arm a transmitter, optionally send the reference sequence as a timed burst
//! - `usrp-rx` - arm a receiver and capture both channels to disk from the go time on
//! - `usrp-sync-server` - reference coordinator: collect announcements, broadcast the release
//! - `usrp-zc-gen` - write the Zadoff-Chu reference sequence file the transmitter sends
//!
//! # Quick Start
//!
//! ```bash
//! # Coordinator for one transmitter and two receivers
//! usrp-sync-server --expected 3
//!
//! # On each host
//! usrp-zc-gen --output zc-sequence-sc16.dat
//! usrp-tx --server-ip 192.168.1.10 --rate 1e6 --transmit-reference
//! usrp-rx --server-ip 192.168.1.10 --rate 1e6 --duration 5 --output-dir captures
//!
//! # Without hardware or server
//! usrp-rx --args type=sim,serial=SIM0001 --ignore-server --settle 0
//! ```
//!
//! # Output Format
//!
//! ```text
//! captures/
//! ├── usrp_samples_<serial>_0.dat   raw sc16 (i16 I, i16 Q, little-endian)
//! ├── usrp_samples_<serial>_1.dat
//! └── usrp_samples_<serial>.json    capture metadata
//! ```
//!
//! # Library Usage
//!
//! - [`sync`] - handshake client
//! - [`coordinator`] - handshake server
//! - [`controller`] - the arming sequence
//! - [`device`] - driver seam, simulated and UHD backends
//! - [`iq`] - sc16 samples, reference sequence and sample files
//! - [`capture`] - timed capture and burst transmission
//! - [`zc`] - Zadoff-Chu reference waveform
//! - [`commands`] - the flow of each tool, callable without a process
//! - [`cli`] - command-line argument definitions
//!
//! # License
//!
//! This project is licensed under the GNU General Public License v3.0.

pub mod capture;
pub mod cli;
pub mod commands;
pub mod controller;
pub mod coordinator;
pub mod device;
pub mod iq;
pub mod sync;
pub mod zc;

use chrono::Datelike;

/// Display GPL license notice for a program
pub fn display_license_notice(program_name: &str) {
	let version = env!("CARGO_PKG_VERSION");
	let current_year = chrono::Utc::now().year();
	let copyright_year = if current_year == 2026 {
		"2026".to_string()
	} else {
		format!("2026-{}", current_year)
	};

	println!("{} {} Copyright (C) {} the usrp-sync-toolbox authors", program_name, version, copyright_year);
	println!("This program comes with ABSOLUTELY NO WARRANTY.");
	println!("For details see https://www.gnu.org/licenses/gpl-3.0.html#license-text.");
	println!("This is free software, and you are welcome to redistribute it under certain conditions.");
	println!();
}
