use anyhow::Result;
use clap::{Args, Parser};
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;

use crate::controller::{RX_GO_TIME_SECS, SequenceConfig, TX_GO_TIME_SECS};
use crate::coordinator::ServerConfig;
use crate::device::{Direction, TimeSpec};
use crate::sync::{ANNOUNCE_PORT, DEFAULT_RELEASE_TOKEN, RELEASE_PORT, SyncConfig};
use crate::zc::ZcParams;

/// Options shared by the transmit and receive tools
#[derive(Args, Clone, Debug)]
pub struct CommonArgs {
    #[arg(
        long = "iq_port",
        default_value = "8888",
        help = "Port to stream IQ samples to (accepted for compatibility, unused)"
    )]
    pub iq_port: String,

    #[arg(
        long,
        required_unless_present = "ignore_server",
        help = "SYNC server IP address"
    )]
    pub server_ip: Option<String>,

    #[arg(long, help = "Discard waiting till SYNC server")]
    pub ignore_server: bool,

    #[arg(long, default_value_t = ANNOUNCE_PORT, help = "SYNC server announce (REQ/REP) port")]
    pub announce_port: u16,

    #[arg(long, default_value_t = RELEASE_PORT, help = "SYNC server release (PUB/SUB) port")]
    pub release_port: u16,

    #[arg(
        long,
        help = "Give up waiting for the SYNC server after this many seconds (default: wait forever)"
    )]
    pub sync_timeout: Option<f64>,

    #[arg(
        long,
        help = "Only accept a release broadcast with exactly this payload (default: any message releases)"
    )]
    pub expect_token: Option<String>,

    #[arg(
        long,
        default_value = "2.0",
        help = "Seconds to wait after the PPS time reset before queuing the go edge"
    )]
    pub settle: f64,

    #[arg(long, short = 'q', help = "Minimal output mode")]
    pub quiet: bool,
}

impl CommonArgs {
    /// Handshake configuration, `None` when the server is ignored
    pub fn sync_config(&self) -> Result<Option<SyncConfig>> {
        if self.ignore_server {
            return Ok(None);
        }
        let server_ip = self
            .server_ip
            .clone()
            .ok_or_else(|| {
                anyhow::anyhow!("--server-ip is required unless --ignore-server is set")
            })?;

        let mut config = SyncConfig::new(server_ip);
        config.announce_port = self.announce_port;
        config.release_port = self.release_port;
        config.timeout = self.sync_timeout.map(secs_to_duration).transpose()?;
        config.expected_token = self.expect_token.as_ref().map(|t| t.as_bytes().to_vec());
        Ok(Some(config))
    }

    fn apply(&self, config: &mut SequenceConfig, go_time: f64) -> Result<()> {
        validate_rate(config.rate)?;
        config.settle = secs_to_duration(self.settle)?;
        if !go_time.is_finite() || go_time < 0.0 {
            return Err(anyhow::anyhow!("invalid go time {}", go_time));
        }
        config.go_time = TimeSpec::from_secs_f64(go_time);
        Ok(())
    }

    fn to_json(&self) -> serde_json::Value {
        json!({
            "iq_port": self.iq_port,
            "server_ip": self.server_ip,
            "ignore_server": self.ignore_server,
            "announce_port": self.announce_port,
            "release_port": self.release_port,
            "sync_timeout": self.sync_timeout,
            "expect_token": self.expect_token,
            "settle": self.settle,
        })
    }
}

#[derive(Parser, Clone, Debug)]
#[command(name = "usrp-tx")]
#[command(about = "Arm a USRP for a PPS-synchronized transmit run")]
pub struct TxArgs {
    #[arg(long, default_value = "type=b200,mode_n=integer", help = "give device arguments here")]
    pub args: String,

    #[arg(long, default_value = "1e6", help = "rate of outgoing samples")]
    pub rate: f64,

    #[arg(
        long,
        default_value_t = TX_GO_TIME_SECS,
        help = "Device time (seconds after the PPS reset) of the GPIO go edge"
    )]
    pub go_time: f64,

    #[arg(long, help = "Transmit the reference sequence as a burst at the go time")]
    pub transmit_reference: bool,

    #[arg(
        long,
        default_value = "zc-sequence-sc16.dat",
        help = "Reference sequence file (raw sc16)"
    )]
    pub reference_file: PathBuf,

    #[command(flatten)]
    pub common: CommonArgs,
}

impl TxArgs {
    pub fn sequence_config(&self) -> Result<SequenceConfig> {
        let mut config = SequenceConfig::new(Direction::Tx, self.rate);
        self.common.apply(&mut config, self.go_time)?;
        Ok(config)
    }
}

#[derive(Parser, Clone, Debug)]
#[command(name = "usrp-rx")]
#[command(about = "Arm a USRP for a PPS-synchronized receive run and capture to disk")]
pub struct RxArgs {
    #[arg(long, default_value = "type=b210", help = "give device arguments here")]
    pub args: String,

    #[arg(long, default_value = "10e6", help = "rate of incoming samples")]
    pub rate: f64,

    #[arg(
        long,
        default_value_t = RX_GO_TIME_SECS,
        help = "Device time (seconds after the PPS reset) of the GPIO go edge and capture start"
    )]
    pub go_time: f64,

    #[arg(long, short = 'd', default_value = "5.0", help = "Capture duration in seconds")]
    pub duration: f64,

    #[arg(
        long,
        short = 'o',
        default_value = ".",
        help = "Directory for usrp_samples_<serial>_<channel>.dat files"
    )]
    pub output_dir: PathBuf,

    #[command(flatten)]
    pub common: CommonArgs,
}

impl RxArgs {
    pub fn sequence_config(&self) -> Result<SequenceConfig> {
        let mut config = SequenceConfig::new(Direction::Rx, self.rate);
        self.common.apply(&mut config, self.go_time)?;
        Ok(config)
    }

    pub fn capture_duration(&self) -> Result<Duration> {
        secs_to_duration(self.duration)
    }

    /// Tool configuration as stored in the capture sidecar
    pub fn to_config_json(&self) -> serde_json::Value {
        json!({
            "args": self.args,
            "rate": self.rate,
            "go_time": self.go_time,
            "duration": self.duration,
            "output_dir": self.output_dir.display().to_string(),
            "common": self.common.to_json(),
            "tool_version": env!("CARGO_PKG_VERSION"),
        })
    }
}

#[derive(Parser, Clone, Debug)]
#[command(name = "usrp-sync-server")]
#[command(about = "Collect readiness announcements from USRP tools and broadcast a single release")]
pub struct ServerArgs {
    #[arg(long, short = 'n', help = "Number of distinct devices to wait for")]
    pub expected: usize,

    #[arg(long, default_value = "*", help = "Address to bind both sockets to")]
    pub bind: String,

    #[arg(long, default_value_t = ANNOUNCE_PORT, help = "Announce (REQ/REP) port")]
    pub announce_port: u16,

    #[arg(long, default_value_t = RELEASE_PORT, help = "Release (PUB/SUB) port")]
    pub release_port: u16,

    #[arg(long, default_value = DEFAULT_RELEASE_TOKEN, help = "Payload of the release broadcast")]
    pub token: String,

    #[arg(
        long,
        default_value = "1.0",
        help = "Seconds between the last announcement and the broadcast"
    )]
    pub release_delay: f64,

    #[arg(long, help = "Give up after this many seconds without all devices")]
    pub timeout: Option<f64>,

    #[arg(long, help = "Write a JSON report of the participants to this file")]
    pub report: Option<PathBuf>,

    #[arg(long, short = 'q', help = "Minimal output mode")]
    pub quiet: bool,
}

impl ServerArgs {
    pub fn server_config(&self) -> Result<ServerConfig> {
        if self.expected == 0 {
            return Err(anyhow::anyhow!("--expected must be at least 1"));
        }
        Ok(ServerConfig {
            bind_ip: self.bind.clone(),
            announce_port: self.announce_port,
            release_port: self.release_port,
            release_token: self.token.clone(),
            release_delay: secs_to_duration(self.release_delay)?,
            timeout: self.timeout.map(secs_to_duration).transpose()?,
        })
    }
}

#[derive(Parser, Clone, Debug)]
#[command(name = "usrp-zc-gen")]
#[command(about = "Write the Zadoff-Chu reference sequence as raw sc16")]
pub struct ZcArgs {
    #[arg(
        long,
        short = 'o',
        default_value = "zc-sequence-sc16.dat",
        help = "Output file"
    )]
    pub output: PathBuf,

    #[arg(long, short = 'u', default_value_t = 1, help = "Root index")]
    pub root: u64,

    #[arg(
        long,
        short = 'N',
        default_value_t = 813,
        help = "Sequence length (coprime with the root)"
    )]
    pub length: usize,

    #[arg(long, default_value_t = 0, help = "Cyclic shift")]
    pub shift: u64,

    #[arg(long, default_value_t = 1024, help = "Inverse FFT size (zero padding)")]
    pub fft_size: usize,

    #[arg(long, default_value_t = 0.85, help = "Largest I/Q component as a fraction of full scale")]
    pub peak: f64,

    #[arg(long, short = 'q', help = "Minimal output mode")]
    pub quiet: bool,
}

impl ZcArgs {
    pub fn params(&self) -> ZcParams {
        ZcParams {
            root: self.root,
            length: self.length,
            cyclic_shift: self.shift,
            fft_size: self.fft_size,
            peak: self.peak,
        }
    }
}

fn secs_to_duration(secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs)
        .map_err(|e| anyhow::anyhow!("invalid duration {}: {}", secs, e))
}

/// Sample rates must be finite and positive; NaN fails the comparison.
fn validate_rate(rate: f64) -> Result<()> {
    if rate > 0.0 && rate.is_finite() {
        Ok(())
    } else {
        Err(anyhow::anyhow!("invalid sample rate {}", rate))
    }
}
