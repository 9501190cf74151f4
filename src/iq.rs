//! sc16 sample type and the IQ files the tools read and write.
//!
//! Samples are stored as raw interleaved little-endian `i16` pairs
//! (`re`, `im`), 4 bytes per complex sample, the layout the driver's `sc16`
//! CPU format uses in memory.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Size in bytes of one complex sample on disk.
pub const SC16_BYTES: usize = 4;

/// One complex 16-bit integer sample.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sc16 {
    pub re: i16,
    pub im: i16,
}

impl Sc16 {
    pub const fn new(re: i16, im: i16) -> Self {
        Self { re, im }
    }

    pub fn to_le_bytes(self) -> [u8; SC16_BYTES] {
        let re = self.re.to_le_bytes();
        let im = self.im.to_le_bytes();
        [re[0], re[1], im[0], im[1]]
    }

    pub fn from_le_bytes(bytes: [u8; SC16_BYTES]) -> Self {
        Self {
            re: i16::from_le_bytes([bytes[0], bytes[1]]),
            im: i16::from_le_bytes([bytes[2], bytes[3]]),
        }
    }
}

/// Decode a byte buffer into samples. Trailing bytes that do not form a
/// whole sample are dropped.
pub fn decode_sc16(bytes: &[u8]) -> Vec<Sc16> {
    bytes
        .chunks_exact(SC16_BYTES)
        .map(|c| Sc16::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

pub fn encode_sc16(samples: &[Sc16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * SC16_BYTES);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

/// A reference sequence loaded from disk and tiled to a minimum length.
#[derive(Debug, Clone)]
pub struct ReferenceSequence {
    pub samples: Vec<Sc16>,
    pub samples_in_file: usize,
    pub repetitions: usize,
}

/// Number of whole copies of an `samples_in_file` long sequence needed to
/// hold at least `min_samples` samples.
pub fn repetitions_for(min_samples: usize, samples_in_file: usize) -> usize {
    min_samples.div_ceil(samples_in_file)
}

/// Read the reference sequence file and repeat its content until at least
/// `min_samples` samples are available.
///
/// The result holds exactly `S * ceil(M / S)` samples, where `S` is the
/// number of samples in the file and `M` is `min_samples`, which must be at
/// least 1.
pub fn read_reference_sequence(path: &Path, min_samples: usize) -> Result<ReferenceSequence> {
    if min_samples == 0 {
        return Err(anyhow::anyhow!(
            "reference sequence requested with a minimum of 0 samples"
        ));
    }
    if !path.exists() {
        return Err(anyhow::anyhow!(
            "reference sequence file '{}' not found",
            path.display()
        ));
    }

    let mut file = File::open(path)
        .with_context(|| format!("error opening '{}'", path.display()))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)
        .with_context(|| format!("error reading '{}'", path.display()))?;

    let samples_in_file = bytes.len() / SC16_BYTES;
    if samples_in_file == 0 {
        return Err(anyhow::anyhow!(
            "reference sequence file '{}' holds no complete sample",
            path.display()
        ));
    }
    let trailing = bytes.len() % SC16_BYTES;
    if trailing != 0 {
        tracing::warn!(
            "Ignoring {} trailing bytes in '{}' (not a whole sc16 sample)",
            trailing,
            path.display()
        );
    }

    let repetitions = repetitions_for(min_samples, samples_in_file);
    tracing::info!("Reading {} times...", repetitions);
    tracing::info!("Reading {} samples...", samples_in_file);

    let one_pass = decode_sc16(&bytes[..samples_in_file * SC16_BYTES]);
    let mut samples = Vec::with_capacity(samples_in_file * repetitions);
    for _ in 0..repetitions {
        samples.extend_from_slice(&one_pass);
    }

    tracing::info!("samples_length: {}", samples.len());

    Ok(ReferenceSequence {
        samples,
        samples_in_file,
        repetitions,
    })
}

/// File name used for the samples a device received on one channel.
pub fn sample_file_name(serial: &str, channel: usize) -> String {
    format!("usrp_samples_{}_{}.dat", serial, channel)
}

/// File name of the JSON sidecar describing a capture.
pub fn metadata_file_name(serial: &str) -> String {
    format!("usrp_samples_{}.json", serial)
}

/// One truncating binary output file per received channel.
pub struct ChannelFiles {
    channels: Vec<usize>,
    paths: Vec<PathBuf>,
    writers: Vec<BufWriter<File>>,
    counts: Vec<u64>,
}

impl ChannelFiles {
    pub fn create(dir: &Path, serial: &str, channels: &[usize]) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("cannot create output directory '{}'", dir.display()))?;

        let mut paths = Vec::with_capacity(channels.len());
        let mut writers = Vec::with_capacity(channels.len());
        for &channel in channels {
            let path = dir.join(sample_file_name(serial, channel));
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)
                .with_context(|| format!("cannot open '{}'", path.display()))?;
            writers.push(BufWriter::with_capacity(1 << 20, file));
            paths.push(path);
        }

        Ok(Self {
            channels: channels.to_vec(),
            paths,
            writers,
            counts: vec![0; channels.len()],
        })
    }

    pub fn channels(&self) -> &[usize] {
        &self.channels
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Append samples to the file of the channel at `index` (position in the
    /// channel list, not the device channel number).
    pub fn write(&mut self, index: usize, samples: &[Sc16]) -> Result<()> {
        let writer = self
            .writers
            .get_mut(index)
            .ok_or_else(|| anyhow::anyhow!("no output file for channel index {}", index))?;
        for s in samples {
            writer.write_all(&s.to_le_bytes())?;
        }
        self.counts[index] += samples.len() as u64;
        Ok(())
    }

    /// Flush every file and return the number of samples written per channel.
    pub fn finish(mut self) -> Result<Vec<u64>> {
        for (writer, path) in self.writers.iter_mut().zip(&self.paths) {
            writer
                .flush()
                .with_context(|| format!("cannot flush '{}'", path.display()))?;
        }
        Ok(self.counts)
    }
}

/// Sidecar written next to the sample files of a receive run.
#[derive(Debug, Clone, Serialize)]
pub struct CaptureMetadata {
    pub run_id: String,
    pub host: String,
    pub serial: String,
    pub channels: Vec<usize>,
    pub files: Vec<String>,
    pub sample_rate: f64,
    pub go_time_secs: f64,
    pub requested_samples: u64,
    pub samples_per_channel: Vec<u64>,
    pub overflows: u64,
    pub sample_format: String,
    pub started_at: String,
    pub finished_at: String,
    pub tool_config: serde_json::Value,
}

impl CaptureMetadata {
    pub fn write_to(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(metadata_file_name(&self.serial));
        let contents = serde_json::to_string_pretty(self)?;
        fs::write(&path, contents)
            .with_context(|| format!("cannot write '{}'", path.display()))?;
        Ok(path)
    }
}

/// Host name for metadata, `unknown` if it cannot be read.
pub fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}
