use anyhow::Result;
use std::time::Duration;

use usrp_sync_toolbox::controller::{GpioConfig, SequenceConfig, StreamHandle, arm};
use usrp_sync_toolbox::device::sim::{CallLog, DeviceCall, SimulatedDevice};
use usrp_sync_toolbox::device::{Direction, GpioAttr, TimeSpec};
use usrp_sync_toolbox::sync::Handshake;

/// Handshake double that notes who announced and how far the device
/// sequence had progressed at that moment.
struct RecordingHandshake {
    log: CallLog,
    identities: Vec<String>,
    calls_before: Option<usize>,
    fail: bool,
}

impl RecordingHandshake {
    fn new(log: CallLog) -> Self {
        Self {
            log,
            identities: Vec::new(),
            calls_before: None,
            fail: false,
        }
    }
}

impl Handshake for RecordingHandshake {
    fn synchronize(&mut self, identity: &str) -> Result<()> {
        self.identities.push(identity.to_string());
        self.calls_before = Some(self.log.calls().len());
        if self.fail {
            return Err(anyhow::anyhow!("coordinator unreachable"));
        }
        Ok(())
    }
}

fn quick_config(direction: Direction) -> SequenceConfig {
    let mut config = SequenceConfig::new(direction, 1e6);
    config.settle = Duration::ZERO;
    config
}

fn gpio(attr: GpioAttr, value: u32) -> DeviceCall {
    DeviceCall::Gpio {
        bank: "FP0".to_string(),
        attr,
        value,
        mask: 0x0F,
    }
}

#[test]
fn test_receive_sequence_issues_calls_in_order() -> Result<()> {
    let mut device = SimulatedDevice::new("31DBE03");
    let log = device.call_log();
    let mut handshake = RecordingHandshake::new(log.clone());

    let armed = arm(&mut device, &quick_config(Direction::Rx), Some(&mut handshake))?;

    assert_eq!(armed.serial, "31DBE03");
    assert_eq!(armed.go_time, TimeSpec::from_secs_f64(3.0));
    assert!(matches!(armed.stream, StreamHandle::Rx(_)));

    let expected = vec![
        DeviceCall::ClockSource("external".to_string()),
        DeviceCall::TimeSource("external".to_string()),
        gpio(GpioAttr::Ddr, 0xFF),
        gpio(GpioAttr::Ctrl, 0x00),
        gpio(GpioAttr::Out, 0x00),
        DeviceCall::Serial(Direction::Rx),
        DeviceCall::Rate {
            direction: Direction::Rx,
            rate: 1e6,
            channel: 0,
        },
        DeviceCall::Rate {
            direction: Direction::Rx,
            rate: 1e6,
            channel: 1,
        },
        DeviceCall::OpenRxStream(vec![0, 1]),
        DeviceCall::TimeNextPps(TimeSpec::ZERO),
        DeviceCall::CommandTime(TimeSpec::from_secs_f64(3.0)),
        gpio(GpioAttr::Out, 0xFF),
        DeviceCall::ClearCommandTime,
    ];
    assert_eq!(log.calls(), expected);

    // Handshake ran once, with the serial, after the stream and before the PPS reset
    assert_eq!(handshake.identities, vec!["31DBE03".to_string()]);
    assert_eq!(handshake.calls_before, Some(9));
    Ok(())
}

#[test]
fn test_transmit_sequence_uses_tx_info_and_later_go_time() -> Result<()> {
    let mut device = SimulatedDevice::new("31DEA71");
    let log = device.call_log();
    let mut handshake = RecordingHandshake::new(log.clone());

    let armed = arm(&mut device, &quick_config(Direction::Tx), Some(&mut handshake))?;

    assert!(matches!(armed.stream, StreamHandle::Tx(_)));
    let calls = log.calls();
    assert!(calls.contains(&DeviceCall::Serial(Direction::Tx)));
    assert!(calls.contains(&DeviceCall::OpenTxStream(vec![0, 1])));
    assert!(calls.contains(&DeviceCall::CommandTime(TimeSpec::from_secs_f64(4.0))));
    Ok(())
}

#[test]
fn test_ignoring_server_skips_handshake_but_not_timing() -> Result<()> {
    let mut device = SimulatedDevice::new("SIM0001");
    let log = device.call_log();

    arm(&mut device, &quick_config(Direction::Rx), None)?;

    let calls = log.calls();
    let reset = calls
        .iter()
        .position(|c| *c == DeviceCall::TimeNextPps(TimeSpec::ZERO))
        .ok_or_else(|| anyhow::anyhow!("time was never reset"))?;
    let go = calls
        .iter()
        .position(|c| *c == gpio(GpioAttr::Out, 0xFF))
        .ok_or_else(|| anyhow::anyhow!("go edge never queued"))?;
    assert!(reset < go);
    assert_eq!(calls.last(), Some(&DeviceCall::ClearCommandTime));
    Ok(())
}

#[test]
fn test_failed_handshake_never_resets_time() {
    let mut device = SimulatedDevice::new("SIM0002");
    let log = device.call_log();
    let mut handshake = RecordingHandshake::new(log.clone());
    handshake.fail = true;

    let result = arm(&mut device, &quick_config(Direction::Rx), Some(&mut handshake));

    assert!(result.is_err());
    let calls = log.calls();
    assert!(!calls.iter().any(|c| matches!(c, DeviceCall::TimeNextPps(_))));
    assert!(!calls.iter().any(|c| matches!(c, DeviceCall::CommandTime(_))));
}

#[test]
fn test_custom_gpio_and_go_time() -> Result<()> {
    let mut device = SimulatedDevice::new("SIM0003");
    let log = device.call_log();
    let mut config = quick_config(Direction::Rx);
    config.gpio = GpioConfig {
        bank: "FP0".to_string(),
        line_mask: 0x01,
        high: 0x01,
        low: 0x00,
    };
    config.go_time = TimeSpec::from_secs_f64(5.25);

    arm(&mut device, &config, None)?;

    let calls = log.calls();
    assert!(calls.contains(&DeviceCall::CommandTime(TimeSpec {
        full_secs: 5,
        frac_secs: 0.25,
    })));
    assert!(calls.contains(&DeviceCall::Gpio {
        bank: "FP0".to_string(),
        attr: GpioAttr::Out,
        value: 0x01,
        mask: 0x01,
    }));
    Ok(())
}

#[test]
fn test_invalid_rate_stops_before_stream() {
    let mut device = SimulatedDevice::new("SIM0004");
    let log = device.call_log();
    let mut config = quick_config(Direction::Rx);
    config.rate = 0.0;

    assert!(arm(&mut device, &config, None).is_err());
    assert!(!log
        .calls()
        .iter()
        .any(|c| matches!(c, DeviceCall::OpenRxStream(_))));
}
