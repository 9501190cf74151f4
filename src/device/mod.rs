//! Device seam between the run sequence and the radio driver.
//!
//! The controller only needs a handful of driver operations: reference
//! selection, GPIO attribute writes, timed commands and stream handles.
//! [`SdrDevice`] captures exactly those so the sequence can run against the
//! UHD backend or the simulated one.

pub mod sim;
#[cfg(feature = "uhd")]
pub mod uhd;

use anyhow::Result;
use std::fmt;
use std::time::Duration;

use crate::iq::Sc16;

/// Stream direction, also selects which info block the serial is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Rx,
    Tx,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Rx => write!(f, "rx"),
            Direction::Tx => write!(f, "tx"),
        }
    }
}

/// GPIO attribute registers written by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpioAttr {
    /// Data direction, 1 = output
    Ddr,
    /// 0 = software controlled, 1 = ATR controlled
    Ctrl,
    /// Output level
    Out,
}

impl GpioAttr {
    pub fn as_str(&self) -> &'static str {
        match self {
            GpioAttr::Ddr => "DDR",
            GpioAttr::Ctrl => "CTRL",
            GpioAttr::Out => "OUT",
        }
    }
}

/// Device time, split the way the driver represents it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeSpec {
    pub full_secs: i64,
    pub frac_secs: f64,
}

impl TimeSpec {
    pub const ZERO: TimeSpec = TimeSpec {
        full_secs: 0,
        frac_secs: 0.0,
    };

    pub fn from_secs_f64(secs: f64) -> Self {
        let full = secs.floor();
        Self {
            full_secs: full as i64,
            frac_secs: secs - full,
        }
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.full_secs as f64 + self.frac_secs
    }
}

/// Receive stream command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StreamCommand {
    StartContinuous { at: Option<TimeSpec> },
    NumSamplesAndDone { samples: usize, at: Option<TimeSpec> },
    StopContinuous,
}

/// Result of one receive call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecvOutcome {
    /// Samples written to each channel buffer
    pub samples: usize,
    pub overflow: bool,
    /// Set on the packet that completes a NumSamplesAndDone command
    pub end_of_burst: bool,
}

/// Burst flags attached to a transmit call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TxMetadata {
    pub at: Option<TimeSpec>,
    pub start_of_burst: bool,
    pub end_of_burst: bool,
}

pub trait RxStream {
    fn max_samples_per_packet(&self) -> usize;

    fn issue_stream_cmd(&mut self, cmd: StreamCommand) -> Result<()>;

    /// Receive into one buffer per stream channel. Each buffer is filled from
    /// the start; its length bounds the number of samples requested.
    fn recv(&mut self, buffers: &mut [Vec<Sc16>], timeout: Duration) -> Result<RecvOutcome>;
}

pub trait TxStream {
    fn max_samples_per_packet(&self) -> usize;

    /// Send one slice per stream channel, all of equal length. Returns the
    /// number of samples sent per channel.
    fn send(&mut self, buffers: &[&[Sc16]], md: TxMetadata, timeout: Duration) -> Result<usize>;
}

/// Driver operations used by the synchronized run sequence.
pub trait SdrDevice {
    fn set_clock_source(&mut self, source: &str) -> Result<()>;

    fn set_time_source(&mut self, source: &str) -> Result<()>;

    fn set_gpio_attr(&mut self, bank: &str, attr: GpioAttr, value: u32, mask: u32) -> Result<()>;

    /// Motherboard serial number as reported in the rx or tx info block.
    fn serial(&mut self, direction: Direction) -> Result<String>;

    fn set_rate(&mut self, direction: Direction, rate: f64, channel: usize) -> Result<()>;

    /// Latch `time` into the device clock on the next PPS edge.
    fn set_time_next_pps(&mut self, time: TimeSpec) -> Result<()>;

    /// Subsequent register writes execute at `time` instead of immediately.
    fn set_command_time(&mut self, time: TimeSpec) -> Result<()>;

    fn clear_command_time(&mut self) -> Result<()>;

    fn rx_stream(&mut self, channels: &[usize]) -> Result<Box<dyn RxStream>>;

    fn tx_stream(&mut self, channels: &[usize]) -> Result<Box<dyn TxStream>>;
}

/// Driver connection string, e.g. `type=b200,mode_n=integer`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceArgs {
    pairs: Vec<(String, String)>,
}

impl DeviceArgs {
    pub fn parse(args: &str) -> Result<Self> {
        let mut pairs = Vec::new();
        for part in args.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (key, value) = part.split_once('=').ok_or_else(|| {
                anyhow::anyhow!("invalid device argument '{}' (expected key=value)", part)
            })?;
            pairs.push((key.trim().to_string(), value.trim().to_string()));
        }
        Ok(Self { pairs })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn device_type(&self) -> Option<&str> {
        self.get("type")
    }

    pub fn is_simulated(&self) -> bool {
        self.device_type() == Some("sim")
    }
}

impl fmt::Display for DeviceArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<String> = self.pairs.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        write!(f, "{}", joined.join(","))
    }
}

/// Open the device named by the argument string.
pub fn open_device(args: &DeviceArgs) -> Result<Box<dyn SdrDevice>> {
    if args.is_simulated() {
        let serial = args.get("serial").unwrap_or(sim::DEFAULT_SERIAL);
        tracing::info!("Opening simulated device (serial {})", serial);
        return Ok(Box::new(sim::SimulatedDevice::new(serial)));
    }
    open_hardware(args)
}

#[cfg(feature = "uhd")]
fn open_hardware(args: &DeviceArgs) -> Result<Box<dyn SdrDevice>> {
    tracing::info!("Opening USRP with args '{}'", args);
    Ok(Box::new(uhd::UhdDevice::open(&args.to_string())?))
}

#[cfg(not(feature = "uhd"))]
fn open_hardware(args: &DeviceArgs) -> Result<Box<dyn SdrDevice>> {
    Err(anyhow::anyhow!(
        "cannot open '{}': built without UHD support (rebuild with --features uhd, or use --args type=sim)",
        args
    ))
}
