use anyhow::Result;
use std::time::Duration;

use crate::device::{RxStream, StreamCommand, TimeSpec, TxMetadata, TxStream};
use crate::iq::{ChannelFiles, Sc16};

/// Extra margin on top of the go time for the first receive call.
const FIRST_PACKET_MARGIN: Duration = Duration::from_secs(2);
const PACKET_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub requested: u64,
    pub received: u64,
    pub overflows: u64,
}

/// Receive `total` samples per channel starting at device time `start` and
/// append them to `files`.
///
/// `first_wait` bounds the first receive call; it must cover the time until
/// the device clock reaches `start`.
pub fn capture_to_files(
    stream: &mut dyn RxStream,
    start: TimeSpec,
    total: usize,
    first_wait: Duration,
    files: &mut ChannelFiles,
) -> Result<CaptureStats> {
    let channels = files.channels().len();
    let packet = stream.max_samples_per_packet().max(1);
    let mut buffers = vec![vec![Sc16::default(); packet]; channels];
    let mut stats = CaptureStats {
        requested: total as u64,
        ..Default::default()
    };

    if total == 0 {
        return Ok(stats);
    }

    stream.issue_stream_cmd(StreamCommand::NumSamplesAndDone {
        samples: total,
        at: Some(start),
    })?;
    tracing::info!(
        "Capturing {} samples on {} channel(s) from device time {:.3}s",
        total,
        channels,
        start.as_secs_f64()
    );

    let mut timeout = first_wait + FIRST_PACKET_MARGIN;
    while (stats.received as usize) < total {
        let want = (total - stats.received as usize).min(packet);
        for buf in buffers.iter_mut() {
            buf.resize(want, Sc16::default());
        }

        let outcome = stream.recv(&mut buffers, timeout)?;
        timeout = PACKET_TIMEOUT;

        if outcome.overflow {
            stats.overflows += 1;
        }
        if outcome.samples > 0 {
            for (index, buf) in buffers.iter().enumerate() {
                files.write(index, &buf[..outcome.samples])?;
            }
            stats.received += outcome.samples as u64;
        }
        if outcome.end_of_burst {
            break;
        }
    }

    if stats.overflows > 0 {
        tracing::warn!("{} overflows during capture", stats.overflows);
    }
    if stats.received < stats.requested {
        tracing::warn!(
            "Stream ended early: {} of {} samples",
            stats.received,
            stats.requested
        );
    }
    Ok(stats)
}

/// Number of samples covering `duration` at `rate`.
pub fn samples_for(duration: Duration, rate: f64) -> usize {
    (duration.as_secs_f64() * rate).round() as usize
}

/// Send `samples` on every stream channel as a single burst starting at
/// device time `start`. Returns the samples sent per channel.
pub fn transmit_burst(
    stream: &mut dyn TxStream,
    channels: usize,
    samples: &[Sc16],
    start: TimeSpec,
    first_wait: Duration,
) -> Result<usize> {
    if samples.is_empty() {
        return Err(anyhow::anyhow!("nothing to transmit: empty burst"));
    }
    let packet = stream.max_samples_per_packet().max(1);
    let mut sent = 0usize;
    let mut timeout = first_wait + FIRST_PACKET_MARGIN;

    while sent < samples.len() {
        let end = (sent + packet).min(samples.len());
        let chunk = &samples[sent..end];
        let buffers: Vec<&[Sc16]> = vec![chunk; channels];
        let md = TxMetadata {
            at: if sent == 0 { Some(start) } else { None },
            start_of_burst: sent == 0,
            end_of_burst: end == samples.len(),
        };

        let n = stream.send(&buffers, md, timeout)?;
        if n == 0 {
            return Err(anyhow::anyhow!(
                "transmit stalled after {} of {} samples",
                sent,
                samples.len()
            ));
        }
        sent += n;
        timeout = PACKET_TIMEOUT;
    }

    tracing::info!(
        "Burst of {} samples queued for device time {:.3}s",
        sent,
        start.as_secs_f64()
    );
    Ok(sent)
}
