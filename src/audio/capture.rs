//! Audio capture implementation using a dedicated thread

use super::{
    spawn_worker, AudioConfig, BeatDetector, ConfigError, EnvelopeTracker, Frame, FrameHandoff,
    SampleSource, SourceError, SpectralTransform, NUM_BANDS,
};
use parking_lot::Mutex;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Longest nap while waiting out the minimum cycle interval
const IDLE_SLEEP: Duration = Duration::from_millis(5);

/// Extra gain applied to the boosted energy value
const ENERGY_HEADROOM: f32 = 1.5;

/// Audio capture errors
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Invalid audio configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to open sample source: {0}")]
    SourceOpen(#[source] SourceError),

    #[error("Thread error: {0}")]
    ThreadError(String),
}

/// Snapshot handed to the renderer once per tick
#[derive(Debug, Clone, PartialEq)]
pub struct AudioContext {
    /// Bar heights scaled to 0-255
    pub heights: [u8; NUM_BANDS],

    /// Held peaks scaled to 0-255
    pub peaks: [u8; NUM_BANDS],

    /// A beat was detected in the frame this snapshot is the first to report
    pub is_beat: bool,

    /// Estimated tempo, 0 until known
    pub bpm: u16,

    /// Beats detected since capture started
    pub total_beats: u32,

    /// Percentage of the tempo history filled with usable intervals
    pub tempo_confidence: u8,

    /// Mean bar height in visual-height units
    pub energy: f32,

    /// `energy` scaled to 0-255
    pub energy_u8: u8,

    /// `energy` with 1.5x headroom, scaled to 0-255 and clamped
    pub energy_boosted_u8: u8,
}

impl Default for AudioContext {
    fn default() -> Self {
        Self {
            heights: [0; NUM_BANDS],
            peaks: [0; NUM_BANDS],
            is_beat: false,
            bpm: 0,
            total_beats: 0,
            tempo_confidence: 0,
            energy: 0.0,
            energy_u8: 0,
            energy_boosted_u8: 0,
        }
    }
}

impl AudioContext {
    /// Quantize a frame; beat fields are left at their defaults.
    fn from_frame(frame: &Frame) -> Self {
        let mut context = Self::default();
        for i in 0..NUM_BANDS {
            context.heights[i] = to_u8(frame.heights[i].clamp(0.0, NUM_BANDS as f32));
            context.peaks[i] = to_u8(frame.peaks[i].clamp(0.0, (NUM_BANDS - 1) as f32));
        }
        context.energy = frame.energy;
        context.energy_u8 = to_u8(frame.energy);
        context.energy_boosted_u8 = to_u8(frame.energy * ENERGY_HEADROOM);
        context
    }
}

fn to_u8(value: f32) -> u8 {
    (value * 255.0 / (NUM_BANDS - 1) as f32).clamp(0.0, 255.0) as u8
}

/// Capture-side pipeline: sample normalization, spectrum and envelope.
///
/// Owns every buffer it needs, so a cycle allocates nothing.
pub struct FrameProcessor {
    spectrum: SpectralTransform,
    envelope: EnvelopeTracker,
    samples: Vec<f32>,
    heights: [f32; NUM_BANDS],
    full_scale: f32,
}

impl FrameProcessor {
    /// Build the pipeline for samples carrying `sample_bits` significant bits.
    pub fn new(config: &AudioConfig, sample_bits: u32) -> Result<Self, ConfigError> {
        let spectrum = SpectralTransform::new(config)?;
        let bits = sample_bits.clamp(1, 32);

        Ok(Self {
            samples: vec![0.0; spectrum.fft_size()],
            spectrum,
            envelope: EnvelopeTracker::new(config),
            heights: [0.0; NUM_BANDS],
            full_scale: 2f32.powi(bits as i32 - 1),
        })
    }

    /// Samples consumed per cycle
    pub fn block_size(&self) -> usize {
        self.samples.len()
    }

    /// Run one block through the pipeline; missing samples count as silence.
    pub fn process(&mut self, block: &[i32]) -> Frame {
        let used = block.len().min(self.samples.len());
        for (out, &sample) in self.samples.iter_mut().zip(&block[..used]) {
            *out = sample as f32 / self.full_scale;
        }
        self.samples[used..].fill(0.0);

        let agc_energy = self.spectrum.process(&self.samples, &mut self.heights);
        self.envelope.update(&self.heights, agc_energy)
    }
}

/// Consumer-side state: last frame seen and the beat detector it feeds
struct ContextReader {
    last_seen: u64,
    detector: BeatDetector,
    latest: AudioContext,
}

impl ContextReader {
    fn new(config: &AudioConfig) -> Self {
        Self {
            last_seen: 0,
            detector: BeatDetector::new(config.beat.clone()),
            latest: AudioContext::default(),
        }
    }

    /// Build the snapshot for `now_ms`.
    ///
    /// The detector runs once per published frame; polling again before the
    /// next publish repeats the previous snapshot with `is_beat` cleared.
    fn read(&mut self, handoff: &FrameHandoff, now_ms: u64) -> AudioContext {
        let Some(frame) = handoff.read_if_newer(&mut self.last_seen) else {
            return AudioContext {
                is_beat: false,
                ..self.latest.clone()
            };
        };

        let mut context = AudioContext::from_frame(&frame);
        context.is_beat = self.detector.update(&context.heights, now_ms);
        context.bpm = self.detector.bpm().round() as u16;
        context.total_beats = self.detector.total_beats();
        context.tempo_confidence = self.detector.confidence();

        self.latest = context.clone();
        context
    }
}

/// Commands sent to the capture thread
enum CaptureCommand {
    Stop,
}

/// Running capture: owns the sample source, the capture thread and the
/// consumer side of the frame handoff.
///
/// Dropping the handle stops capture.
pub struct AudioCapture {
    /// Command sender to control the capture thread
    command_tx: mpsc::Sender<CaptureCommand>,

    /// Handle to the capture thread
    thread_handle: Option<JoinHandle<()>>,

    /// Source shared with the capture thread; locked only around reads and close
    source: Arc<Mutex<Box<dyn SampleSource>>>,

    /// Frames published by the capture thread
    handoff: Arc<FrameHandoff>,

    reader: ContextReader,
    started_at: Instant,
}

impl AudioCapture {
    /// Open `source` and start the capture thread.
    pub fn start<S: SampleSource + 'static>(
        config: AudioConfig,
        source: S,
    ) -> Result<Self, CaptureError> {
        config.validate()?;

        let mut source: Box<dyn SampleSource> = Box::new(source);
        let processor = FrameProcessor::new(&config, source.sample_bits())?;
        source
            .open(config.sample_rate, config.fft_size)
            .map_err(CaptureError::SourceOpen)?;

        let source = Arc::new(Mutex::new(source));
        let handoff = Arc::new(FrameHandoff::new());
        let (command_tx, command_rx) = mpsc::channel();

        let thread_handle = {
            let loop_config = config.clone();
            let source = source.clone();
            let handoff = handoff.clone();
            spawn_worker(&config.worker, move || {
                run_capture_loop(loop_config, processor, source, handoff, command_rx)
            })
        };
        let thread_handle = match thread_handle {
            Ok(handle) => handle,
            Err(e) => {
                source.lock().close();
                return Err(CaptureError::ThreadError(e.to_string()));
            }
        };

        log::info!(
            "Audio capture started: {} Hz, {}-sample blocks, {} bins",
            config.sample_rate,
            config.fft_size,
            NUM_BANDS
        );

        Ok(Self {
            command_tx,
            thread_handle: Some(thread_handle),
            source,
            handoff,
            reader: ContextReader::new(&config),
            started_at: Instant::now(),
        })
    }

    /// Snapshot for this render tick; never waits on the capture thread's I/O.
    pub fn get_context(&mut self) -> AudioContext {
        let now_ms = self.started_at.elapsed().as_millis() as u64;
        self.reader.read(&self.handoff, now_ms)
    }

    /// Frames published by the capture thread so far
    pub fn frames_published(&self) -> u64 {
        self.handoff.updates()
    }

    /// Whether the capture thread is still owned by this handle
    pub fn is_running(&self) -> bool {
        self.thread_handle.is_some()
    }

    /// Stop the capture thread, then close the source.
    pub fn stop(&mut self) {
        let Some(handle) = self.thread_handle.take() else {
            return;
        };

        let _ = self.command_tx.send(CaptureCommand::Stop);
        if handle.join().is_err() {
            log::error!("Audio capture thread panicked");
        }
        // The thread is gone, so nothing can be blocked in a read
        self.source.lock().close();
        log::info!("Audio capture stopped");
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Run the capture loop until told to stop
fn run_capture_loop(
    config: AudioConfig,
    mut processor: FrameProcessor,
    source: Arc<Mutex<Box<dyn SampleSource>>>,
    handoff: Arc<FrameHandoff>,
    command_rx: mpsc::Receiver<CaptureCommand>,
) {
    let mut block = vec![0i32; processor.block_size()];
    let mut last_cycle: Option<Instant> = None;
    let mut failed_reads: u32 = 0;

    loop {
        // Check for stop command (non-blocking)
        match command_rx.try_recv() {
            Ok(CaptureCommand::Stop) => {
                log::info!("Audio capture stopping");
                break;
            }
            Err(mpsc::TryRecvError::Disconnected) => {
                log::info!("Audio capture channel disconnected");
                break;
            }
            Err(mpsc::TryRecvError::Empty) => {}
        }

        if let Some(last) = last_cycle {
            let elapsed = last.elapsed();
            if elapsed < config.min_cycle_interval {
                thread::sleep((config.min_cycle_interval - elapsed).min(IDLE_SLEEP));
                continue;
            }
        }
        last_cycle = Some(Instant::now());

        let read = source.lock().read_block(&mut block, config.read_timeout);
        let count = match read {
            Ok(count) => {
                if failed_reads > 0 {
                    log::info!("Audio input recovered after {} failed reads", failed_reads);
                    failed_reads = 0;
                }
                count
            }
            Err(e) => {
                failed_reads = failed_reads.saturating_add(1);
                if failed_reads == 1 {
                    log::warn!("Audio read failed: {}", e);
                } else {
                    log::debug!("Audio read failed ({} in a row): {}", failed_reads, e);
                }
                thread::sleep(config.error_backoff);
                continue;
            }
        };

        // Short read: the rest of the block is silence
        let count = count.min(block.len());
        block[count..].fill(0);

        let frame = processor.process(&block);
        handoff.publish(&frame);
    }
}
