//! Fixed call sequence that arms a device for a PPS-synchronized run.
//!
//! References and GPIO are configured first and the stream handle exists
//! before the handshake. The device clock is zeroed on the PPS edge only after
//! the unit has been released, and the GPIO "go" edge is a timed command so
//! every unit toggles on the same device-clock instant.

use anyhow::Result;
use std::thread;
use std::time::Duration;

use crate::device::{Direction, GpioAttr, RxStream, SdrDevice, TimeSpec, TxStream};
use crate::sync::Handshake;

/// GPIO bank and bit patterns used to signal "go" to external hardware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpioConfig {
    pub bank: String,
    /// Lines driven by the run, 0x0F = pins 0..3
    pub line_mask: u32,
    pub high: u32,
    pub low: u32,
}

impl Default for GpioConfig {
    fn default() -> Self {
        Self {
            bank: "FP0".to_string(),
            line_mask: 0x0F,
            high: 0xFF,
            low: 0x00,
        }
    }
}

/// Parameters of the arming sequence
#[derive(Debug, Clone)]
pub struct SequenceConfig {
    pub direction: Direction,
    pub channels: Vec<usize>,
    pub rate: f64,
    pub clock_source: String,
    pub time_source: String,
    pub gpio: GpioConfig,
    /// Wall-clock pause after the PPS time reset
    pub settle: Duration,
    /// Device time at which the GPIO go edge fires
    pub go_time: TimeSpec,
}

impl SequenceConfig {
    pub fn new(direction: Direction, rate: f64) -> Self {
        Self {
            direction,
            channels: vec![0, 1],
            rate,
            clock_source: "external".to_string(),
            time_source: "external".to_string(),
            gpio: GpioConfig::default(),
            settle: Duration::from_millis(2000),
            go_time: TimeSpec::from_secs_f64(match direction {
                Direction::Tx => TX_GO_TIME_SECS,
                Direction::Rx => RX_GO_TIME_SECS,
            }),
        }
    }
}

/// Default go offset of the transmit tool, in device seconds.
pub const TX_GO_TIME_SECS: f64 = 4.0;
/// Default go offset of the receive tool, in device seconds.
pub const RX_GO_TIME_SECS: f64 = 3.0;

pub enum StreamHandle {
    Rx(Box<dyn RxStream>),
    Tx(Box<dyn TxStream>),
}

/// A device that has gone through the sequence and has its go edge queued.
pub struct ArmedRun {
    pub serial: String,
    pub stream: StreamHandle,
    pub go_time: TimeSpec,
}

/// Run the arming sequence. `handshake` is `None` when the sync server is
/// ignored.
pub fn arm(
    device: &mut dyn SdrDevice,
    config: &SequenceConfig,
    handshake: Option<&mut dyn Handshake>,
) -> Result<ArmedRun> {
    println!("Setting up PPS + 10MHz");
    device.set_clock_source(&config.clock_source)?;
    device.set_time_source(&config.time_source)?;

    println!("Setting up GPIO");
    configure_gpio(device, &config.gpio)?;

    let serial = device.serial(config.direction)?;
    println!("Serial number: {}", serial);

    for &channel in &config.channels {
        device.set_rate(config.direction, config.rate, channel)?;
    }
    tracing::info!(
        "{} rate {:.3} Msps on channels {:?}",
        config.direction,
        config.rate / 1e6,
        config.channels
    );

    let stream = match config.direction {
        Direction::Rx => StreamHandle::Rx(device.rx_stream(&config.channels)?),
        Direction::Tx => StreamHandle::Tx(device.tx_stream(&config.channels)?),
    };

    match handshake {
        Some(handshake) => handshake.synchronize(&serial)?,
        None => println!("Ignoring waiting for server"),
    }

    // Processed shortly after the last PPS edge; the clock reads 0.0 from the
    // next one on.
    device.set_time_next_pps(TimeSpec::ZERO)?;
    println!("[SYNC] Resetting time.");
    if !config.settle.is_zero() {
        thread::sleep(config.settle);
    }

    schedule_go(device, &config.gpio, config.go_time)?;
    tracing::info!("GPIO go edge queued for device time {:.3}s", config.go_time.as_secs_f64());

    Ok(ArmedRun {
        serial,
        stream,
        go_time: config.go_time,
    })
}

/// Pins as outputs, software controlled, driven low.
pub fn configure_gpio(device: &mut dyn SdrDevice, gpio: &GpioConfig) -> Result<()> {
    device.set_gpio_attr(&gpio.bank, GpioAttr::Ddr, gpio.high, gpio.line_mask)?;
    device.set_gpio_attr(&gpio.bank, GpioAttr::Ctrl, gpio.low, gpio.line_mask)?;
    device.set_gpio_attr(&gpio.bank, GpioAttr::Out, gpio.low, gpio.line_mask)?;
    Ok(())
}

/// Queue the output-high write at `at` device time.
pub fn schedule_go(device: &mut dyn SdrDevice, gpio: &GpioConfig, at: TimeSpec) -> Result<()> {
    device.set_command_time(at)?;
    let result = device.set_gpio_attr(&gpio.bank, GpioAttr::Out, gpio.high, gpio.line_mask);
    // Never leave later writes timed, even if the GPIO write failed
    device.clear_command_time()?;
    result
}
