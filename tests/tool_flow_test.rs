//! Whole-tool runs against the simulated device.

use anyhow::Result;
use clap::Parser;
use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;

use usrp_sync_toolbox::cli::{RxArgs, ServerArgs, TxArgs, ZcArgs};
use usrp_sync_toolbox::commands::{run_rx, run_tx, run_zc, serve};
use usrp_sync_toolbox::coordinator::{ServerConfig, SyncServer};
use usrp_sync_toolbox::iq::{decode_sc16, metadata_file_name, sample_file_name};

fn rx_args(output_dir: &Path, extra: &[&str]) -> Result<RxArgs> {
    let dir = output_dir.display().to_string();
    let mut argv = vec![
        "usrp-rx",
        "--args",
        "type=sim,serial=SIMFLOW",
        "--settle",
        "0",
        "--go-time",
        "0",
        "--rate",
        "1e3",
        "--duration",
        "0.5",
        "--output-dir",
        dir.as_str(),
    ];
    argv.extend_from_slice(extra);
    Ok(RxArgs::try_parse_from(argv)?)
}

#[test]
fn test_receive_tool_writes_channels_and_sidecar() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let args = rx_args(dir.path(), &["--ignore-server"])?;

    let outcome = run_rx(&args)?;

    assert_eq!(outcome.serial, "SIMFLOW");
    assert_eq!(outcome.stats.requested, 500);
    assert_eq!(outcome.stats.received, 500);
    assert_eq!(
        outcome.files,
        vec![
            dir.path().join(sample_file_name("SIMFLOW", 0)),
            dir.path().join(sample_file_name("SIMFLOW", 1)),
        ]
    );
    for path in &outcome.files {
        assert_eq!(decode_sc16(&fs::read(path)?).len(), 500);
    }

    assert_eq!(outcome.metadata, dir.path().join(metadata_file_name("SIMFLOW")));
    let sidecar: serde_json::Value = serde_json::from_str(&fs::read_to_string(&outcome.metadata)?)?;
    assert_eq!(sidecar["serial"], "SIMFLOW");
    assert_eq!(sidecar["samples_per_channel"], serde_json::json!([500, 500]));
    assert_eq!(sidecar["sample_format"], "sc16");
    assert_eq!(sidecar["tool_config"]["rate"], 1e3);
    assert_eq!(sidecar["tool_config"]["duration"], 0.5);
    assert_eq!(sidecar["tool_config"]["common"]["ignore_server"], true);
    Ok(())
}

#[test]
fn test_transmit_tool_sends_generated_reference() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let reference = dir.path().join("zc-sequence-sc16.dat");
    let reference_arg = reference.display().to_string();

    let zc = ZcArgs::try_parse_from(["usrp-zc-gen", "-o", reference_arg.as_str()])?;
    assert_eq!(run_zc(&zc)?, 1024);

    let args = TxArgs::try_parse_from([
        "usrp-tx",
        "--args",
        "type=sim,serial=SIMTXFLOW",
        "--ignore-server",
        "--settle",
        "0",
        "--go-time",
        "0",
        "--transmit-reference",
        "--reference-file",
        reference_arg.as_str(),
    ])?;
    let outcome = run_tx(&args)?;

    assert_eq!(outcome.serial, "SIMTXFLOW");
    // Simulated packets hold 2040 samples: two copies of the 1024-sample file
    assert_eq!(outcome.burst_samples, Some(2048));
    Ok(())
}

#[test]
fn test_transmit_tool_without_reference_only_arms() -> Result<()> {
    let args = TxArgs::try_parse_from([
        "usrp-tx",
        "--args",
        "type=sim",
        "--ignore-server",
        "--settle",
        "0",
        "--reference-file",
        "does-not-exist.dat",
    ])?;
    let outcome = run_tx(&args)?;
    assert_eq!(outcome.burst_samples, None);
    Ok(())
}

#[test]
fn test_transmit_tool_fails_on_missing_reference() -> Result<()> {
    let args = TxArgs::try_parse_from([
        "usrp-tx",
        "--args",
        "type=sim",
        "--ignore-server",
        "--settle",
        "0",
        "--transmit-reference",
        "--reference-file",
        "does-not-exist.dat",
    ])?;
    assert!(run_tx(&args).is_err());
    Ok(())
}

#[test]
fn test_server_report_lists_the_released_receiver() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let report_path = dir.path().join("sync_report.json");
    let report_arg = report_path.display().to_string();

    let mut server = SyncServer::bind(ServerConfig {
        bind_ip: "127.0.0.1".to_string(),
        announce_port: 0,
        release_port: 0,
        release_delay: Duration::from_millis(500),
        timeout: Some(Duration::from_secs(10)),
        ..Default::default()
    })?;
    let announce_port = server.announce_port()?.to_string();
    let release_port = server.release_port()?.to_string();

    let capture_dir = dir.path().join("captures");
    let args = rx_args(
        &capture_dir,
        &[
            "--server-ip",
            "127.0.0.1",
            "--announce-port",
            announce_port.as_str(),
            "--release-port",
            release_port.as_str(),
            "--sync-timeout",
            "10",
            "--expect-token",
            "SYNC",
        ],
    )?;
    let receiver = thread::spawn(move || run_rx(&args).map(|outcome| outcome.stats.received));

    let server_args = ServerArgs::try_parse_from([
        "usrp-sync-server",
        "--expected",
        "1",
        "--report",
        report_arg.as_str(),
        "-q",
    ])?;
    let report = serve(&mut server, &server_args)?;
    assert_eq!(report.participant_count, 1);

    let received = receiver
        .join()
        .map_err(|_| anyhow::anyhow!("receiver thread panicked"))??;
    assert_eq!(received, 500);

    let written: serde_json::Value = serde_json::from_str(&fs::read_to_string(&report_path)?)?;
    assert_eq!(written["participant_count"], 1);
    assert_eq!(written["participants"][0]["id"], "SIMFLOW");
    assert_eq!(written["participants"][0]["announcements"], 1);
    assert!(written["released_at"].is_string());
    assert!(capture_dir.join(metadata_file_name("SIMFLOW")).exists());
    Ok(())
}
