//! Audio capture and analysis module

mod beat;
mod capture;
mod envelope;
mod fft;
mod handoff;
mod sources;
mod worker;

pub use beat::BeatDetector;
pub use capture::{AudioCapture, AudioContext, CaptureError, FrameProcessor};
pub use envelope::{attack_coefficient, decay_coefficient, EnvelopeTracker};
pub use fft::SpectralTransform;
pub use handoff::{Frame, FrameHandoff};
pub use sources::{
    list_input_devices, CpalSource, InputDevice, ReplaySource, SampleSource, SourceError,
};
pub use worker::spawn_worker;

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Number of visual frequency bins exposed to the renderer
pub const NUM_BANDS: usize = 64;

/// Configuration errors, reported before anything is opened or spawned
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("FFT size {0} is not a power of two")]
    FftSizeNotPowerOfTwo(usize),

    #[error("FFT size {size} is smaller than the {bands} visual bins")]
    FftSizeTooSmall { size: usize, bands: usize },

    #[error("Sample rate must be nonzero")]
    ZeroSampleRate,

    #[error("Beat bin range {low}..{high} is empty or exceeds {bands} bins")]
    BeatRange { low: usize, high: usize, bands: usize },

    #[error("Beat interval window {min_ms}..{max_ms} ms is empty")]
    BeatIntervals { min_ms: u64, max_ms: u64 },
}

/// Audio processing configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Sample rate in Hz
    pub sample_rate: u32,

    /// FFT window size; also the number of samples read per cycle
    pub fft_size: usize,

    /// Log compression constant `K` in `ln(1 + mag*K) / ln(1 + K)`
    pub log_scale: f32,

    /// Per-cycle decay of the per-band running max used for auto-gain
    pub band_max_decay: f32,

    /// Cycles a peak is held before it starts falling
    pub peak_hold_cycles: u8,

    /// Per-cycle multiplier applied to a falling peak
    pub peak_decay: f32,

    /// Minimum time between processing cycles
    #[serde(with = "millis")]
    pub min_cycle_interval: Duration,

    /// Upper bound on a single hardware read
    #[serde(with = "millis")]
    pub read_timeout: Duration,

    /// Pause after a failed read before the next attempt
    #[serde(with = "millis")]
    pub error_backoff: Duration,

    /// Beat detection tuning
    pub beat: BeatConfig,

    /// Capture thread placement
    pub worker: WorkerConfig,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            fft_size: 512,
            log_scale: 8.0,
            band_max_decay: 0.995,
            peak_hold_cycles: 3,
            peak_decay: 0.9,
            min_cycle_interval: Duration::from_millis(30),
            read_timeout: Duration::from_millis(100),
            error_backoff: Duration::from_millis(10),
            beat: BeatConfig::default(),
            worker: WorkerConfig::default(),
        }
    }
}

impl AudioConfig {
    /// Check the invariants the pipeline relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_rate == 0 {
            return Err(ConfigError::ZeroSampleRate);
        }
        if !self.fft_size.is_power_of_two() {
            return Err(ConfigError::FftSizeNotPowerOfTwo(self.fft_size));
        }
        if self.fft_size < NUM_BANDS {
            return Err(ConfigError::FftSizeTooSmall {
                size: self.fft_size,
                bands: NUM_BANDS,
            });
        }
        self.beat.validate()
    }
}

/// Beat detector tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BeatConfig {
    /// First bin (inclusive) summed into the beat energy
    pub low_bin: usize,

    /// Last bin (exclusive) summed into the beat energy
    pub high_bin: usize,

    /// Standard deviations above the mean required to fire
    pub sensitivity: f32,

    /// Absolute floor the summed energy must exceed
    pub noise_floor: f32,

    /// Beats closer than this are suppressed
    pub min_interval_ms: u64,

    /// Intervals at or above this are ignored for tempo
    pub max_interval_ms: u64,
}

impl Default for BeatConfig {
    fn default() -> Self {
        Self {
            low_bin: 1,
            high_bin: 8,
            sensitivity: 1.2,
            noise_floor: 40.0,
            min_interval_ms: 300,
            max_interval_ms: 2000,
        }
    }
}

impl BeatConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.low_bin >= self.high_bin || self.high_bin > NUM_BANDS {
            return Err(ConfigError::BeatRange {
                low: self.low_bin,
                high: self.high_bin,
                bands: NUM_BANDS,
            });
        }
        if self.min_interval_ms >= self.max_interval_ms {
            return Err(ConfigError::BeatIntervals {
                min_ms: self.min_interval_ms,
                max_ms: self.max_interval_ms,
            });
        }
        Ok(())
    }
}

/// Where and how the capture thread runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Thread name
    pub name: String,

    /// Pin to this core id when the platform allows it
    pub core: Option<usize>,

    /// Request maximum scheduling priority when the platform allows it
    pub high_priority: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "audio-capture".to_string(),
            core: None,
            high_priority: true,
        }
    }
}

/// Serialize durations as whole milliseconds
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
