//! Spectral front end: Hann window, FFT, log compression and per-band auto-gain

use super::{AudioConfig, ConfigError, NUM_BANDS};
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::sync::Arc;

/// Floor for the auto-gain denominator so silent bands don't blow up
const BAND_MAX_FLOOR: f32 = 0.01;

/// Turns one block of normalized samples into `NUM_BANDS` visual heights.
///
/// All buffers, including the FFT scratch space, are allocated once here and
/// reused for every cycle.
pub struct SpectralTransform {
    fft_size: usize,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    buffer: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,

    // Per-band running max for auto-gain (decays slowly)
    band_max: [f32; NUM_BANDS],

    log_scale: f32,
    log_norm: f32,
    band_max_decay: f32,
}

impl SpectralTransform {
    /// Plan the forward FFT for `config.fft_size`.
    pub fn new(config: &AudioConfig) -> Result<Self, ConfigError> {
        let fft_size = config.fft_size;
        if !fft_size.is_power_of_two() {
            return Err(ConfigError::FftSizeNotPowerOfTwo(fft_size));
        }
        if fft_size < NUM_BANDS {
            return Err(ConfigError::FftSizeTooSmall {
                size: fft_size,
                bands: NUM_BANDS,
            });
        }

        let fft = FftPlanner::new().plan_fft_forward(fft_size);
        let scratch = vec![Complex::default(); fft.get_inplace_scratch_len()];

        // Create Hann window
        let window: Vec<f32> = (0..fft_size)
            .map(|i| {
                0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / (fft_size - 1) as f32).cos())
            })
            .collect();

        Ok(Self {
            fft_size,
            fft,
            window,
            buffer: vec![Complex::default(); fft_size],
            scratch,
            band_max: [0.0; NUM_BANDS],
            log_scale: config.log_scale,
            log_norm: (1.0 + config.log_scale).ln(),
            band_max_decay: config.band_max_decay,
        })
    }

    /// Get FFT size
    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    /// Window and transform `samples` into the internal buffer.
    ///
    /// A block of the wrong length is logged and skipped.
    fn transform(&mut self, samples: &[f32]) -> bool {
        if samples.len() != self.fft_size {
            log::error!(
                "Spectral transform got {} samples, expected {}; skipping block",
                samples.len(),
                self.fft_size
            );
            return false;
        }

        for ((slot, &sample), &w) in self.buffer.iter_mut().zip(samples).zip(&self.window) {
            *slot = Complex::new(sample * w, 0.0);
        }
        self.fft.process_with_scratch(&mut self.buffer, &mut self.scratch);
        true
    }

    /// Magnitudes of the first `NUM_BANDS` bins of the windowed spectrum.
    ///
    /// Returns `false` (and a zeroed `out`) when the block had the wrong length.
    pub fn magnitudes(&mut self, samples: &[f32], out: &mut [f32; NUM_BANDS]) -> bool {
        if !self.transform(samples) {
            out.fill(0.0);
            return false;
        }
        for (mag, bin) in out.iter_mut().zip(&self.buffer) {
            *mag = bin.norm();
        }
        true
    }

    /// Compute auto-gained heights in `[0, NUM_BANDS-1]` and return the AGC energy.
    ///
    /// The AGC energy is the sum of the heights divided by `NUM_BANDS-1`. It is
    /// only used to drive the envelope coefficients.
    pub fn process(&mut self, samples: &[f32], heights: &mut [f32; NUM_BANDS]) -> f32 {
        if !self.magnitudes(samples, heights) {
            return 0.0;
        }

        let full_scale = (NUM_BANDS - 1) as f32;
        let mut sum = 0.0;
        for (height, band_max) in heights.iter_mut().zip(self.band_max.iter_mut()) {
            let scaled = (1.0 + *height * self.log_scale).ln() / self.log_norm;
            *band_max = (*band_max * self.band_max_decay).max(scaled);
            let normalized = scaled / (*band_max).max(BAND_MAX_FLOOR) * full_scale;
            *height = normalized;
            sum += normalized;
        }

        sum / full_scale
    }
}
