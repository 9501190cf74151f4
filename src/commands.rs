use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;

use crate::capture::{CaptureStats, capture_to_files, samples_for, transmit_burst};
use crate::cli::{RxArgs, ServerArgs, TxArgs, ZcArgs};
use crate::controller::{ArmedRun, SequenceConfig, StreamHandle, arm};
use crate::coordinator::{SyncReport, SyncServer};
use crate::device::{DeviceArgs, open_device};
use crate::iq::{CaptureMetadata, ChannelFiles, local_hostname, read_reference_sequence};
use crate::sync::{Handshake, SyncClient};
use crate::zc::write_reference_file;

pub struct TxOutcome {
    pub serial: String,
    /// Samples sent per channel when the reference burst was transmitted
    pub burst_samples: Option<usize>,
}

pub struct RxOutcome {
    pub serial: String,
    pub files: Vec<PathBuf>,
    pub metadata: PathBuf,
    pub stats: CaptureStats,
}

/// Open the device, run the handshake if configured and arm the run.
fn open_and_arm(
    device_args: &str,
    sequence: &SequenceConfig,
    client: Option<SyncClient>,
) -> Result<ArmedRun> {
    let mut device = open_device(&DeviceArgs::parse(device_args)?)?;
    let mut client = client;
    arm(
        device.as_mut(),
        sequence,
        client.as_mut().map(|c| c as &mut dyn Handshake),
    )
}

fn first_wait(armed: &ArmedRun) -> Duration {
    Duration::from_secs_f64(armed.go_time.as_secs_f64())
}

pub fn run_tx(args: &TxArgs) -> Result<TxOutcome> {
    let sequence = args.sequence_config()?;
    let client = match args.common.sync_config()? {
        Some(config) => Some(SyncClient::connect(config)?),
        None => None,
    };
    let armed = open_and_arm(&args.args, &sequence, client)?;
    let wait = first_wait(&armed);

    if !args.transmit_reference {
        return Ok(TxOutcome {
            serial: armed.serial,
            burst_samples: None,
        });
    }

    let StreamHandle::Tx(mut stream) = armed.stream else {
        return Err(anyhow::anyhow!("expected a transmit stream"));
    };
    let reference =
        read_reference_sequence(&args.reference_file, stream.max_samples_per_packet())?;
    println!(
        "Transmitting {} samples ({} x {}) at device time {:.3}s",
        reference.samples.len(),
        reference.repetitions,
        reference.samples_in_file,
        armed.go_time.as_secs_f64()
    );
    let sent = transmit_burst(
        stream.as_mut(),
        sequence.channels.len(),
        &reference.samples,
        armed.go_time,
        wait,
    )?;

    Ok(TxOutcome {
        serial: armed.serial,
        burst_samples: Some(sent),
    })
}

pub fn run_rx(args: &RxArgs) -> Result<RxOutcome> {
    let sequence = args.sequence_config()?;
    let duration = args.capture_duration()?;
    let client = match args.common.sync_config()? {
        Some(config) => Some(SyncClient::connect(config)?),
        None => None,
    };

    let started_at = chrono::Utc::now();
    let armed = open_and_arm(&args.args, &sequence, client)?;
    let wait = first_wait(&armed);

    let StreamHandle::Rx(mut stream) = armed.stream else {
        return Err(anyhow::anyhow!("expected a receive stream"));
    };

    let mut files = ChannelFiles::create(&args.output_dir, &armed.serial, &sequence.channels)?;
    for path in files.paths() {
        println!("Writing {}", path.display());
    }

    let total = samples_for(duration, sequence.rate);
    let stats = capture_to_files(stream.as_mut(), armed.go_time, total, wait, &mut files)?;
    let paths = files.paths().to_vec();
    let per_channel = files.finish()?;

    let metadata = CaptureMetadata {
        run_id: uuid::Uuid::new_v4().to_string(),
        host: local_hostname(),
        serial: armed.serial.clone(),
        channels: sequence.channels.clone(),
        files: paths.iter().map(|p| p.display().to_string()).collect(),
        sample_rate: sequence.rate,
        go_time_secs: armed.go_time.as_secs_f64(),
        requested_samples: stats.requested,
        samples_per_channel: per_channel,
        overflows: stats.overflows,
        sample_format: "sc16".to_string(),
        started_at: started_at.to_rfc3339(),
        finished_at: chrono::Utc::now().to_rfc3339(),
        tool_config: args.to_config_json(),
    };
    let metadata_path = metadata.write_to(&args.output_dir)?;
    println!(
        "Captured {} samples per channel ({} overflows), metadata in {}",
        stats.received,
        stats.overflows,
        metadata_path.display()
    );

    Ok(RxOutcome {
        serial: armed.serial,
        files: paths,
        metadata: metadata_path,
        stats,
    })
}

/// Collect the participants on an already bound server, release them and
/// write the report.
pub fn serve(server: &mut SyncServer, args: &ServerArgs) -> Result<SyncReport> {
    server.wait_for_participants(args.expected)?;
    server.release()?;

    let report = server.report();
    if !args.quiet {
        report.print_report();
    }
    if let Some(path) = &args.report {
        let contents = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, contents)
            .with_context(|| format!("cannot write report '{}'", path.display()))?;
        println!("Report written to {}", path.display());
    }
    Ok(report)
}

pub fn run_server(args: &ServerArgs) -> Result<SyncReport> {
    let mut server = SyncServer::bind(args.server_config()?)?;
    serve(&mut server, args)
}

/// Write the reference file, returning its length in samples.
pub fn run_zc(args: &ZcArgs) -> Result<usize> {
    let samples = write_reference_file(&args.output, &args.params())?;
    println!("Wrote {} samples to {}", samples.len(), args.output.display());
    Ok(samples.len())
}
