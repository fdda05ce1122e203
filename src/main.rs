//! Console visualizer: captures audio and logs beats, tempo and a level meter.

use matrix_audio::audio::{
    list_input_devices, AudioCapture, AudioConfig, AudioContext, CaptureError, CpalSource,
    ReplaySource, NUM_BANDS,
};
use std::env;
use std::error::Error;
use std::thread;
use std::time::{Duration, Instant};

/// Render tick, roughly 60 Hz
const TICK: Duration = Duration::from_millis(16);

/// Columns in the logged level meter
const METER_WIDTH: usize = 16;

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let config = load_config()?;
    let seconds = match env::args().nth(1) {
        Some(arg) => Some(arg.parse::<u64>()?),
        None => None,
    };

    match list_input_devices() {
        Ok(devices) => log::info!("Input devices: {}", serde_json::to_string(&devices)?),
        Err(e) => log::warn!("Could not list input devices: {}", e),
    }

    let mut capture = start_capture(config)?;
    let started = Instant::now();
    let mut last_meter = Instant::now();

    while seconds.map_or(true, |s| started.elapsed() < Duration::from_secs(s)) {
        let context = capture.get_context();

        if context.is_beat {
            log::info!(
                "Beat #{} | {} BPM ({}% confident)",
                context.total_beats,
                context.bpm,
                context.tempo_confidence
            );
        }
        if last_meter.elapsed() >= Duration::from_millis(250) {
            log::info!("[{}] energy {:3}", meter(&context), context.energy_u8);
            last_meter = Instant::now();
        }

        thread::sleep(TICK);
    }

    capture.stop();
    log::info!(
        "Captured {} frames, {} beats",
        capture.frames_published(),
        capture.get_context().total_beats
    );
    Ok(())
}

/// Defaults, optionally overridden by JSON in `MATRIX_AUDIO_CONFIG`
fn load_config() -> Result<AudioConfig, Box<dyn Error>> {
    let Ok(json) = env::var("MATRIX_AUDIO_CONFIG") else {
        return Ok(AudioConfig::default());
    };
    let config: AudioConfig = serde_json::from_str(&json)?;
    config.validate()?;
    Ok(config)
}

/// Microphone capture, or a 120 BPM click track when no input can be opened
fn start_capture(config: AudioConfig) -> Result<AudioCapture, CaptureError> {
    let device = env::var("MATRIX_AUDIO_DEVICE").ok();

    match AudioCapture::start(config.clone(), CpalSource::new(device)) {
        Ok(capture) => Ok(capture),
        Err(CaptureError::SourceOpen(e)) => {
            log::warn!("No live input ({}); replaying a click track", e);
            AudioCapture::start(config.clone(), click_track(config.sample_rate))
        }
        Err(e) => Err(e),
    }
}

/// Two seconds of 30 ms kick-like bursts every 500 ms, looped
fn click_track(sample_rate: u32) -> ReplaySource {
    let rate = sample_rate as usize;
    let click_len = rate * 30 / 1000;
    let mut samples = vec![0i32; rate * 2];

    for beat in 0..4 {
        let start = beat * rate / 2;
        for i in 0..click_len {
            let t = i as f32 / sample_rate as f32;
            let fade = 1.0 - i as f32 / click_len as f32;
            let tone = (2.0 * std::f32::consts::PI * 120.0 * t).sin();
            samples[start + i] = (tone * fade * 20_000.0) as i32;
        }
    }

    ReplaySource::new(samples).looping()
}

/// Coarse bar meter averaging groups of bins
fn meter(context: &AudioContext) -> String {
    const GLYPHS: [char; 5] = [' ', '.', ':', '|', '#'];
    let group = NUM_BANDS / METER_WIDTH;

    context
        .heights
        .chunks(group)
        .map(|bins| {
            let mean = bins.iter().map(|&h| h as usize).sum::<usize>() / bins.len();
            GLYPHS[(mean * (GLYPHS.len() - 1) / 255).min(GLYPHS.len() - 1)]
        })
        .collect()
}
