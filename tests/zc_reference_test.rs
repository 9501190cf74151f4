use anyhow::Result;
use rustfft::num_complex::Complex64;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

use usrp_sync_toolbox::iq::read_reference_sequence;
use usrp_sync_toolbox::zc::{
    ZcParams, generate_reference, reference_waveform, write_reference_file, zadoff_chu,
};

#[test]
fn test_sequence_has_unit_magnitude() {
    let seq = zadoff_chu(7, 353, 0);
    assert_eq!(seq.len(), 353);
    for c in &seq {
        assert!((c.norm() - 1.0).abs() < 1e-12);
    }
    assert_eq!(seq[0], Complex64::new(1.0, 0.0));
}

#[test]
fn test_default_reference_length_and_peak() -> Result<()> {
    let samples = generate_reference(&ZcParams::default())?;
    assert_eq!(samples.len(), 1024);

    // 0.85 of full scale, truncated toward zero
    let peak = samples
        .iter()
        .map(|s| s.re.unsigned_abs().max(s.im.unsigned_abs()))
        .max()
        .unwrap_or(0);
    assert_eq!(peak, 27852);
    Ok(())
}

#[test]
fn test_unused_bins_stay_empty() -> Result<()> {
    let params = ZcParams::default();
    let mut spectrum = reference_waveform(&params)?;
    let fft: Arc<dyn Fft<f64>> = FftPlanner::new().plan_fft_forward(params.fft_size);
    fft.process(&mut spectrum);

    let max = spectrum.iter().map(|c| c.norm()).fold(0.0f64, f64::max);
    // 1024 - 813 zero-padded bins, shifted by ceil(813 / 2)
    for (bin, c) in spectrum.iter().enumerate().take(617).skip(406) {
        assert!(c.norm() < 1e-9 * max, "bin {} = {}", bin, c.norm());
    }
    // Occupied bins carry the constant-magnitude sequence
    assert!((spectrum[405].norm() - max).abs() < 1e-6 * max);
    assert!((spectrum[617].norm() - max).abs() < 1e-6 * max);
    Ok(())
}

#[test]
fn test_written_file_reads_back_as_reference() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("zc-sequence-sc16.dat");

    let written = write_reference_file(&path, &ZcParams::default())?;
    assert_eq!(std::fs::metadata(&path)?.len(), 1024 * 4);

    let seq = read_reference_sequence(&path, 2040)?;
    assert_eq!(seq.samples_in_file, 1024);
    assert_eq!(seq.repetitions, 2);
    assert_eq!(&seq.samples[..1024], written.as_slice());
    assert_eq!(&seq.samples[1024..], written.as_slice());
    Ok(())
}

#[test]
fn test_short_sequence_variant() -> Result<()> {
    let params = ZcParams {
        root: 7,
        length: 353,
        fft_size: 512,
        ..Default::default()
    };
    assert_eq!(generate_reference(&params)?.len(), 512);
    Ok(())
}

#[test]
fn test_invalid_parameters_are_rejected() {
    let bad = [
        ZcParams { root: 0, ..Default::default() },
        ZcParams { root: 813, ..Default::default() },
        // 813 = 3 * 271
        ZcParams { root: 3, ..Default::default() },
        ZcParams { fft_size: 512, ..Default::default() },
        ZcParams { peak: 1.5, ..Default::default() },
        ZcParams { peak: f64::NAN, ..Default::default() },
    ];
    for params in bad {
        assert!(generate_reference(&params).is_err(), "{:?}", params);
    }
}
