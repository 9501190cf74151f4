//! Simulated device backend.
//!
//! Opened with `--args type=sim[,serial=XYZ]`. Every driver call is appended
//! to a shared [`CallLog`] so a run can be inspected after the fact, receive
//! streams produce low-amplitude noise and transmit streams swallow what they
//! are given.

use anyhow::Result;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{
    Direction, GpioAttr, RecvOutcome, RxStream, SdrDevice, StreamCommand, TimeSpec, TxMetadata,
    TxStream,
};
use crate::iq::Sc16;

pub const DEFAULT_SERIAL: &str = "SIM0000";

/// Samples per packet reported by simulated streams.
pub const DEFAULT_PACKET_SIZE: usize = 2040;

/// One recorded driver call.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCall {
    ClockSource(String),
    TimeSource(String),
    Gpio {
        bank: String,
        attr: GpioAttr,
        value: u32,
        mask: u32,
    },
    Serial(Direction),
    Rate {
        direction: Direction,
        rate: f64,
        channel: usize,
    },
    TimeNextPps(TimeSpec),
    CommandTime(TimeSpec),
    ClearCommandTime,
    OpenRxStream(Vec<usize>),
    OpenTxStream(Vec<usize>),
    StreamCmd(StreamCommand),
    TxSend { samples: usize, md: TxMetadata },
}

/// Shared, cloneable view of the calls a simulated device received.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<DeviceCall>>>);

impl CallLog {
    fn push(&self, call: DeviceCall) {
        if let Ok(mut calls) = self.0.lock() {
            calls.push(call);
        }
    }

    pub fn calls(&self) -> Vec<DeviceCall> {
        self.0.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

pub struct SimulatedDevice {
    serial: String,
    packet_size: usize,
    log: CallLog,
}

impl SimulatedDevice {
    pub fn new(serial: &str) -> Self {
        Self {
            serial: serial.to_string(),
            packet_size: DEFAULT_PACKET_SIZE,
            log: CallLog::default(),
        }
    }

    pub fn with_packet_size(mut self, packet_size: usize) -> Self {
        self.packet_size = packet_size.max(1);
        self
    }

    pub fn call_log(&self) -> CallLog {
        self.log.clone()
    }
}

impl SdrDevice for SimulatedDevice {
    fn set_clock_source(&mut self, source: &str) -> Result<()> {
        self.log.push(DeviceCall::ClockSource(source.to_string()));
        Ok(())
    }

    fn set_time_source(&mut self, source: &str) -> Result<()> {
        self.log.push(DeviceCall::TimeSource(source.to_string()));
        Ok(())
    }

    fn set_gpio_attr(&mut self, bank: &str, attr: GpioAttr, value: u32, mask: u32) -> Result<()> {
        self.log.push(DeviceCall::Gpio {
            bank: bank.to_string(),
            attr,
            value,
            mask,
        });
        Ok(())
    }

    fn serial(&mut self, direction: Direction) -> Result<String> {
        self.log.push(DeviceCall::Serial(direction));
        Ok(self.serial.clone())
    }

    fn set_rate(&mut self, direction: Direction, rate: f64, channel: usize) -> Result<()> {
        if !(rate > 0.0 && rate.is_finite()) {
            return Err(anyhow::anyhow!("invalid {} rate {}", direction, rate));
        }
        self.log.push(DeviceCall::Rate {
            direction,
            rate,
            channel,
        });
        Ok(())
    }

    fn set_time_next_pps(&mut self, time: TimeSpec) -> Result<()> {
        self.log.push(DeviceCall::TimeNextPps(time));
        Ok(())
    }

    fn set_command_time(&mut self, time: TimeSpec) -> Result<()> {
        self.log.push(DeviceCall::CommandTime(time));
        Ok(())
    }

    fn clear_command_time(&mut self) -> Result<()> {
        self.log.push(DeviceCall::ClearCommandTime);
        Ok(())
    }

    fn rx_stream(&mut self, channels: &[usize]) -> Result<Box<dyn RxStream>> {
        self.log.push(DeviceCall::OpenRxStream(channels.to_vec()));
        Ok(Box::new(SimRxStream {
            packet_size: self.packet_size,
            pending: Pending::Idle,
            rng: fastrand::Rng::with_seed(seed_from(&self.serial)),
            log: self.log.clone(),
        }))
    }

    fn tx_stream(&mut self, channels: &[usize]) -> Result<Box<dyn TxStream>> {
        self.log.push(DeviceCall::OpenTxStream(channels.to_vec()));
        Ok(Box::new(SimTxStream {
            channels: channels.len(),
            packet_size: self.packet_size,
            log: self.log.clone(),
        }))
    }
}

fn seed_from(serial: &str) -> u64 {
    serial
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325u64, |h, b| (h ^ b as u64).wrapping_mul(0x100_0000_01b3))
}

enum Pending {
    Idle,
    Continuous,
    Remaining(usize),
}

struct SimRxStream {
    packet_size: usize,
    pending: Pending,
    rng: fastrand::Rng,
    log: CallLog,
}

impl RxStream for SimRxStream {
    fn max_samples_per_packet(&self) -> usize {
        self.packet_size
    }

    fn issue_stream_cmd(&mut self, cmd: StreamCommand) -> Result<()> {
        self.log.push(DeviceCall::StreamCmd(cmd));
        self.pending = match cmd {
            StreamCommand::StartContinuous { .. } => Pending::Continuous,
            StreamCommand::NumSamplesAndDone { samples, .. } => Pending::Remaining(samples),
            StreamCommand::StopContinuous => Pending::Idle,
        };
        Ok(())
    }

    fn recv(&mut self, buffers: &mut [Vec<Sc16>], _timeout: Duration) -> Result<RecvOutcome> {
        let capacity = buffers
            .iter()
            .map(|b| b.len())
            .min()
            .unwrap_or(0)
            .min(self.packet_size);

        let (count, end_of_burst) = match self.pending {
            Pending::Idle => {
                return Err(anyhow::anyhow!("receive timed out: stream not started"));
            }
            Pending::Continuous => (capacity, false),
            Pending::Remaining(left) => {
                let n = left.min(capacity);
                let left = left - n;
                self.pending = if left == 0 {
                    Pending::Idle
                } else {
                    Pending::Remaining(left)
                };
                (n, left == 0)
            }
        };

        for buf in buffers.iter_mut() {
            for s in buf.iter_mut().take(count) {
                *s = Sc16::new(self.rng.i16(-64..64), self.rng.i16(-64..64));
            }
        }

        Ok(RecvOutcome {
            samples: count,
            overflow: false,
            end_of_burst,
        })
    }
}

struct SimTxStream {
    channels: usize,
    packet_size: usize,
    log: CallLog,
}

impl TxStream for SimTxStream {
    fn max_samples_per_packet(&self) -> usize {
        self.packet_size
    }

    fn send(&mut self, buffers: &[&[Sc16]], md: TxMetadata, _timeout: Duration) -> Result<usize> {
        if buffers.len() != self.channels {
            return Err(anyhow::anyhow!(
                "expected {} channel buffers, got {}",
                self.channels,
                buffers.len()
            ));
        }
        let samples = buffers.first().map(|b| b.len()).unwrap_or(0);
        if buffers.iter().any(|b| b.len() != samples) {
            return Err(anyhow::anyhow!("channel buffers differ in length"));
        }
        self.log.push(DeviceCall::TxSend { samples, md });
        Ok(samples)
    }
}
