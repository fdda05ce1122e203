//! Sample sources: the capture peripheral abstraction and its implementations

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, StreamConfig, SupportedStreamConfig, SupportedStreamConfigRange};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Blocks of backlog the microphone FIFO keeps before dropping the oldest samples
const FIFO_BLOCKS: usize = 4;

/// Audio source errors
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("No input device found")]
    NoInputDevice,

    #[error("Input device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to enumerate devices: {0}")]
    EnumerationError(String),

    #[error("Failed to get device config: {0}")]
    ConfigError(String),

    #[error("Failed to build audio stream: {0}")]
    StreamError(String),

    #[error("Failed to start stream: {0}")]
    PlayError(String),

    #[error("Thread error: {0}")]
    ThreadError(String),

    #[error("Source is not open")]
    NotOpen,

    #[error("No samples within {0:?}")]
    Timeout(Duration),

    #[error("Source has no more samples")]
    Exhausted,
}

/// A steady-rate source of mono signed PCM blocks.
///
/// `open` is called once when capture starts and `close` once after the
/// capture thread has exited. `read_block` may return fewer samples than
/// requested; the caller treats the rest as silence.
pub trait SampleSource: Send {
    /// Prepare the peripheral for `block_size`-sample reads at `sample_rate`.
    fn open(&mut self, sample_rate: u32, block_size: usize) -> Result<(), SourceError>;

    /// Fill `buf` with up to `buf.len()` samples, waiting at most `timeout`.
    fn read_block(&mut self, buf: &mut [i32], timeout: Duration) -> Result<usize, SourceError>;

    /// Release the peripheral.
    fn close(&mut self);

    /// Significant bits per sample; full scale is `2^(bits-1)`
    fn sample_bits(&self) -> u32 {
        16
    }
}

/// Input device information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputDevice {
    /// Device name as reported by the host
    pub name: String,

    /// Whether this is the host's default input
    pub is_default: bool,
}

/// List available input devices (microphones)
pub fn list_input_devices() -> Result<Vec<InputDevice>, SourceError> {
    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    let devices = host
        .input_devices()
        .map_err(|e| SourceError::EnumerationError(e.to_string()))?
        .filter_map(|device| device.name().ok())
        .map(|name| InputDevice {
            is_default: default_name.as_deref() == Some(name.as_str()),
            name,
        })
        .collect();

    Ok(devices)
}

/// Bounded sample FIFO that drops the oldest samples when full
struct SampleFifo {
    samples: VecDeque<i32>,
    capacity: usize,
}

impl SampleFifo {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push_samples(&mut self, data: &[i32]) {
        for &sample in data {
            if self.samples.len() == self.capacity {
                self.samples.pop_front();
            }
            self.samples.push_back(sample);
        }
    }

    /// Move up to `out.len()` of the oldest samples into `out`
    fn pop_into(&mut self, out: &mut [i32]) -> usize {
        let count = out.len().min(self.samples.len());
        for (slot, sample) in out.iter_mut().zip(self.samples.drain(..count)) {
            *slot = sample;
        }
        count
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// FIFO shared between the cpal callback and `read_block`
struct SharedFifo {
    fifo: Mutex<SampleFifo>,
    ready: Condvar,
}

impl SharedFifo {
    fn new(capacity: usize) -> Self {
        Self {
            fifo: Mutex::new(SampleFifo::new(capacity)),
            ready: Condvar::new(),
        }
    }

    /// Producer side: append samples and wake a waiting reader
    fn push(&self, data: &[i32]) {
        self.fifo.lock().push_samples(data);
        self.ready.notify_one();
    }

    /// Wait until `buf` can be filled or `deadline` passes, then drain what is there.
    fn read_until(&self, deadline: Instant, buf: &mut [i32]) -> usize {
        let mut fifo = self.fifo.lock();
        while fifo.len() < buf.len() {
            if self.ready.wait_until(&mut fifo, deadline).timed_out() {
                break;
            }
        }
        fifo.pop_into(buf)
    }
}

/// Microphone capture through cpal.
///
/// cpal streams are not `Send`, so the stream lives on a dedicated thread for
/// as long as the source is open and feeds a bounded FIFO that `read_block`
/// drains.
pub struct CpalSource {
    device_name: Option<String>,
    shared: Option<Arc<SharedFifo>>,
    stop_tx: Option<mpsc::Sender<()>>,
    thread_handle: Option<JoinHandle<()>>,
}

impl CpalSource {
    /// Capture from the named input device, or the default one when `None`
    pub fn new(device_name: Option<String>) -> Self {
        Self {
            device_name,
            shared: None,
            stop_tx: None,
            thread_handle: None,
        }
    }
}

impl SampleSource for CpalSource {
    fn open(&mut self, sample_rate: u32, block_size: usize) -> Result<(), SourceError> {
        self.close();

        let shared = Arc::new(SharedFifo::new(block_size * FIFO_BLOCKS));
        let shared_clone = shared.clone();
        let device_name = self.device_name.clone();
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let thread_handle = thread::Builder::new()
            .name("audio-input".to_string())
            .spawn(move || {
                let stream = match build_input(device_name.as_deref(), sample_rate, shared_clone) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                // Keep the stream alive until close() or the sender is dropped
                let _ = stop_rx.recv();
                drop(stream);
                log::info!("Audio input stream closed");
            })
            .map_err(|e| SourceError::ThreadError(e.to_string()))?;

        let setup = ready_rx.recv().unwrap_or_else(|_| {
            Err(SourceError::ThreadError(
                "input thread exited during setup".to_string(),
            ))
        });
        if let Err(e) = setup {
            let _ = thread_handle.join();
            return Err(e);
        }

        self.shared = Some(shared);
        self.stop_tx = Some(stop_tx);
        self.thread_handle = Some(thread_handle);
        Ok(())
    }

    fn read_block(&mut self, buf: &mut [i32], timeout: Duration) -> Result<usize, SourceError> {
        let shared = self.shared.as_ref().ok_or(SourceError::NotOpen)?;

        match shared.read_until(Instant::now() + timeout, buf) {
            0 => Err(SourceError::Timeout(timeout)),
            count => Ok(count),
        }
    }

    fn close(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
        self.shared = None;
    }
}

impl Drop for CpalSource {
    fn drop(&mut self) {
        self.close();
    }
}

/// Open the input device and start a stream feeding `shared`
fn build_input(
    device_name: Option<&str>,
    sample_rate: u32,
    shared: Arc<SharedFifo>,
) -> Result<cpal::Stream, SourceError> {
    let host = cpal::default_host();

    let device = match device_name {
        Some(name) => host
            .input_devices()
            .map_err(|e| SourceError::EnumerationError(e.to_string()))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| SourceError::DeviceNotFound(name.to_string()))?,
        None => host.default_input_device().ok_or(SourceError::NoInputDevice)?,
    };

    let ranges = device
        .supported_input_configs()
        .map_err(|e| SourceError::ConfigError(e.to_string()))?;
    let supported = pick_input_config(ranges, sample_rate)?;
    let channels = supported.channels() as usize;
    let config: StreamConfig = supported.config();

    log::info!(
        "Audio input: {} at {} Hz, {} channels",
        device.name().unwrap_or_else(|_| "Unknown".to_string()),
        sample_rate,
        channels
    );

    let stream = match supported.sample_format() {
        SampleFormat::F32 => build_stream::<f32>(&device, &config, shared, channels),
        SampleFormat::I16 => build_stream::<i16>(&device, &config, shared, channels),
        SampleFormat::U16 => build_stream::<u16>(&device, &config, shared, channels),
        other => {
            return Err(SourceError::ConfigError(format!(
                "Unsupported sample format {:?}",
                other
            )))
        }
    }
    .map_err(|e| SourceError::StreamError(e.to_string()))?;

    stream
        .play()
        .map_err(|e| SourceError::PlayError(e.to_string()))?;

    Ok(stream)
}

/// Sample formats `build_stream` can convert, most preferred first
const STREAM_FORMATS: [SampleFormat; 3] = [SampleFormat::F32, SampleFormat::I16, SampleFormat::U16];

/// Choose a supported input configuration running at exactly `sample_rate`.
///
/// Prefers float samples, then the fewest channels to downmix.
fn pick_input_config(
    ranges: impl IntoIterator<Item = SupportedStreamConfigRange>,
    sample_rate: u32,
) -> Result<SupportedStreamConfig, SourceError> {
    let rate = cpal::SampleRate(sample_rate);

    ranges
        .into_iter()
        .filter(|range| range.min_sample_rate() <= rate && rate <= range.max_sample_rate())
        .filter_map(|range| {
            let rank = STREAM_FORMATS
                .iter()
                .position(|&format| format == range.sample_format())?;
            Some((rank, range))
        })
        .min_by_key(|(rank, range)| (*rank, range.channels()))
        .map(|(_, range)| range.with_sample_rate(rate))
        .ok_or_else(|| {
            SourceError::ConfigError(format!(
                "Device has no supported input configuration at {} Hz",
                sample_rate
            ))
        })
}

/// Build input stream for given sample type
fn build_stream<T: cpal::Sample + cpal::SizedSample>(
    device: &Device,
    config: &StreamConfig,
    shared: Arc<SharedFifo>,
    channels: usize,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    f32: cpal::FromSample<T>,
{
    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            // Downmix to mono and rescale to 16-bit PCM
            let mono: Vec<i32> = data
                .chunks(channels)
                .map(|frame| {
                    let sum: f32 = frame
                        .iter()
                        .map(|s| <f32 as cpal::Sample>::from_sample(*s))
                        .sum();
                    let sample = (sum / channels as f32).clamp(-1.0, 1.0);
                    (sample * i16::MAX as f32) as i32
                })
                .collect();

            shared.push(&mono);
        },
        |err| {
            log::error!("Audio stream error: {}", err);
        },
        None,
    )
}

/// Replays an in-memory PCM buffer paced in real time at the sample rate.
///
/// Useful for demos and for exercising the capture thread without hardware.
pub struct ReplaySource {
    samples: Vec<i32>,
    bits: u32,
    looping: bool,
    position: usize,
    sample_rate: u32,
    opened_at: Option<Instant>,
    delivered: u64,
    max_backlog: u64,
}

impl ReplaySource {
    /// Replay `samples` once, as 16-bit PCM
    pub fn new(samples: Vec<i32>) -> Self {
        Self {
            samples,
            bits: 16,
            looping: false,
            position: 0,
            sample_rate: 0,
            opened_at: None,
            delivered: 0,
            max_backlog: 0,
        }
    }

    /// Restart from the beginning instead of running dry
    pub fn looping(mut self) -> Self {
        self.looping = true;
        self
    }

    /// Declare a different significant bit width
    pub fn with_sample_bits(mut self, bits: u32) -> Self {
        self.bits = bits;
        self
    }

    /// Wall-clock instant the next block is due
    fn due(&self, opened_at: Instant, count: usize) -> Instant {
        let samples_due = self.delivered + count as u64;
        opened_at + Duration::from_secs_f64(samples_due as f64 / self.sample_rate as f64)
    }

    /// Drop samples a slow reader fell behind on, like a hardware ring overflowing.
    fn skip_backlog(&mut self, opened_at: Instant) {
        let now = (opened_at.elapsed().as_secs_f64() * self.sample_rate as f64) as u64;
        let behind = now.saturating_sub(self.delivered);
        if behind <= self.max_backlog {
            return;
        }

        let skip = behind - self.max_backlog;
        let len = self.samples.len();
        self.position = if self.looping {
            ((self.position as u64 + skip) % len as u64) as usize
        } else {
            (self.position as u64 + skip).min(len as u64) as usize
        };
        self.delivered += skip;
        log::trace!("Replay skipped {} samples of backlog", skip);
    }
}

impl SampleSource for ReplaySource {
    fn open(&mut self, sample_rate: u32, block_size: usize) -> Result<(), SourceError> {
        self.sample_rate = sample_rate;
        self.position = 0;
        self.delivered = 0;
        self.max_backlog = (block_size * FIFO_BLOCKS) as u64;
        self.opened_at = Some(Instant::now());
        Ok(())
    }

    fn read_block(&mut self, buf: &mut [i32], timeout: Duration) -> Result<usize, SourceError> {
        let opened_at = self.opened_at.ok_or(SourceError::NotOpen)?;
        if !self.samples.is_empty() {
            self.skip_backlog(opened_at);
        }
        let exhausted = !self.looping && self.position >= self.samples.len();
        if self.samples.is_empty() || exhausted {
            return Err(SourceError::Exhausted);
        }

        let wait = self.due(opened_at, buf.len()).saturating_duration_since(Instant::now());
        if wait > timeout {
            thread::sleep(timeout);
            return Err(SourceError::Timeout(timeout));
        }
        thread::sleep(wait);

        let mut count = 0;
        for slot in buf.iter_mut() {
            if self.position >= self.samples.len() {
                if !self.looping {
                    break;
                }
                self.position = 0;
            }
            *slot = self.samples[self.position];
            self.position += 1;
            count += 1;
        }

        self.delivered += count as u64;
        Ok(count)
    }

    fn close(&mut self) {
        self.opened_at = None;
    }

    fn sample_bits(&self) -> u32 {
        self.bits
    }
}
