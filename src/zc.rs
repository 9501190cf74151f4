//! Zadoff-Chu reference waveform.
//!
//! The sequence is placed in the frequency domain (zero padded to the
//! transform size and rotated so its centre lands on DC), taken to the time
//! domain with an inverse FFT, scaled so the largest I or Q component reaches
//! `peak` of full scale, and quantized to sc16. The result is the file
//! `usrp-tx --transmit-reference` sends.

use anyhow::Result;
use num_complex::Complex64;
use rustfft::{Fft, FftPlanner};
use std::f64::consts::PI;
use std::path::Path;
use std::sync::Arc;

use crate::iq::{Sc16, encode_sc16};

/// Parameters of the generated reference.
#[derive(Debug, Clone, PartialEq)]
pub struct ZcParams {
    /// Root index `u`, `0 < u < length`, coprime with `length`
    pub root: u64,
    /// Sequence length, usually prime
    pub length: usize,
    pub cyclic_shift: u64,
    /// Inverse FFT size, at least `length`
    pub fft_size: usize,
    /// Largest I/Q magnitude as a fraction of full scale
    pub peak: f64,
}

impl Default for ZcParams {
    fn default() -> Self {
        Self {
            root: 1,
            length: 813,
            cyclic_shift: 0,
            fft_size: 1024,
            peak: 0.85,
        }
    }
}

impl ZcParams {
    pub fn validate(&self) -> Result<()> {
        if self.root == 0 {
            return Err(anyhow::anyhow!("root index must be strictly positive"));
        }
        if self.root >= self.length as u64 {
            return Err(anyhow::anyhow!(
                "root index {} must be smaller than the length {}",
                self.root,
                self.length
            ));
        }
        if gcd(self.root, self.length as u64) != 1 {
            return Err(anyhow::anyhow!(
                "root index {} and length {} are not coprime",
                self.root,
                self.length
            ));
        }
        if self.fft_size < self.length {
            return Err(anyhow::anyhow!(
                "FFT size {} is smaller than the sequence length {}",
                self.fft_size,
                self.length
            ));
        }
        if !(self.peak > 0.0 && self.peak <= 1.0) {
            return Err(anyhow::anyhow!("peak {} must be in (0, 1]", self.peak));
        }
        Ok(())
    }
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// `x[n] = exp(-j * pi * u * n * (n + cf + 2q) / N)` with `cf = N mod 2`.
pub fn zadoff_chu(root: u64, length: usize, cyclic_shift: u64) -> Vec<Complex64> {
    let n_len = length as f64;
    let cf = (length % 2) as f64;
    let q2 = 2.0 * cyclic_shift as f64;
    (0..length)
        .map(|n| {
            let n = n as f64;
            let phase = -PI * root as f64 * n * (n + cf + q2) / n_len;
            Complex64::from_polar(1.0, phase)
        })
        .collect()
}

/// Time-domain waveform of the reference, before quantization.
pub fn reference_waveform(params: &ZcParams) -> Result<Vec<Complex64>> {
    params.validate()?;

    let mut buffer = vec![Complex64::new(0.0, 0.0); params.fft_size];
    buffer[..params.length].copy_from_slice(&zadoff_chu(
        params.root,
        params.length,
        params.cyclic_shift,
    ));
    buffer.rotate_left(params.length.div_ceil(2));

    let mut planner = FftPlanner::new();
    let ifft: Arc<dyn Fft<f64>> = planner.plan_fft_inverse(params.fft_size);
    ifft.process(&mut buffer);

    let max_component = buffer
        .iter()
        .map(|c| c.re.abs().max(c.im.abs()))
        .fold(0.0f64, f64::max);
    if max_component == 0.0 {
        return Err(anyhow::anyhow!("reference waveform is all zeros"));
    }
    let scale = params.peak / max_component;
    for c in buffer.iter_mut() {
        *c *= scale;
    }
    Ok(buffer)
}

/// Quantize to sc16, truncating toward zero.
pub fn quantize(waveform: &[Complex64]) -> Vec<Sc16> {
    waveform
        .iter()
        .map(|c| Sc16::new((c.re * 32768.0) as i16, (c.im * 32768.0) as i16))
        .collect()
}

pub fn generate_reference(params: &ZcParams) -> Result<Vec<Sc16>> {
    Ok(quantize(&reference_waveform(params)?))
}

/// Generate the reference and write it as raw sc16 to `path`.
pub fn write_reference_file(path: &Path, params: &ZcParams) -> Result<Vec<Sc16>> {
    let samples = generate_reference(params)?;
    std::fs::write(path, encode_sc16(&samples))
        .map_err(|e| anyhow::anyhow!("cannot write '{}': {}", path.display(), e))?;
    tracing::info!(
        "Wrote {} samples (u={}, N={}) to {}",
        samples.len(),
        params.root,
        params.length,
        path.display()
    );
    Ok(samples)
}
