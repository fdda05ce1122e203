//! Adaptive-threshold beat detection and median-filtered tempo estimation

use super::{BeatConfig, NUM_BANDS};

/// Frames of sub-range energy kept for the adaptive threshold
const ENERGY_HISTORY: usize = 64;

/// Inter-beat intervals kept for the tempo estimate
const INTERVAL_HISTORY: usize = 12;

/// Intervals needed before a tempo is reported
const MIN_INTERVALS_FOR_BPM: usize = 3;

/// Plausible tempo range estimates are folded into
const BPM_RANGE: (f32, f32) = (60.0, 180.0);

/// Weight of the previous estimate when smoothing BPM
const BPM_SMOOTHING: f32 = 0.7;

/// Beat detector fed once per distinct frame by the consumer.
///
/// A beat fires when the energy of a low-frequency sub-range rises above
/// `mean + std * sensitivity` of its recent history, no earlier than
/// `min_interval_ms` after the previous beat. Intervals between beats feed a
/// median tempo estimate.
pub struct BeatDetector {
    config: BeatConfig,

    energy_history: [f32; ENERGY_HISTORY],
    energy_pos: usize,

    intervals: [u64; INTERVAL_HISTORY],
    interval_pos: usize,

    last_beat_ms: Option<u64>,
    bpm: f32,
    total_beats: u32,
}

impl BeatDetector {
    pub fn new(config: BeatConfig) -> Self {
        Self {
            config,
            energy_history: [0.0; ENERGY_HISTORY],
            energy_pos: 0,
            intervals: [0; INTERVAL_HISTORY],
            interval_pos: 0,
            last_beat_ms: None,
            bpm: 0.0,
            total_beats: 0,
        }
    }

    /// Feed one frame of 8-bit heights observed at `now_ms`; returns true on a beat.
    pub fn update(&mut self, heights: &[u8; NUM_BANDS], now_ms: u64) -> bool {
        let current: f32 = heights[self.config.low_bin..self.config.high_bin]
            .iter()
            .map(|&h| h as f32)
            .sum();

        self.energy_history[self.energy_pos] = current;
        self.energy_pos = (self.energy_pos + 1) % ENERGY_HISTORY;

        let threshold = self.threshold();
        let rested = self
            .last_beat_ms
            .map(|last| now_ms.saturating_sub(last) > self.config.min_interval_ms)
            .unwrap_or(true);

        if current <= threshold || !rested || current <= self.config.noise_floor {
            return false;
        }

        self.total_beats = self.total_beats.wrapping_add(1);
        if let Some(last) = self.last_beat_ms {
            let interval = now_ms - last;
            if interval < self.config.max_interval_ms {
                self.intervals[self.interval_pos] = interval;
                self.interval_pos = (self.interval_pos + 1) % INTERVAL_HISTORY;
                self.update_bpm();
            }
        }
        self.last_beat_ms = Some(now_ms);

        log::trace!(
            "Beat #{} at {} ms (energy {:.0} > {:.0}), bpm {:.1}",
            self.total_beats,
            now_ms,
            current,
            threshold,
            self.bpm
        );
        true
    }

    /// `mean + std * sensitivity` over the whole energy ring
    fn threshold(&self) -> f32 {
        let n = ENERGY_HISTORY as f32;
        let mean = self.energy_history.iter().sum::<f32>() / n;
        let variance = self
            .energy_history
            .iter()
            .map(|v| {
                let d = v - mean;
                d * d
            })
            .sum::<f32>()
            / n;
        mean + variance.sqrt() * self.config.sensitivity
    }

    fn update_bpm(&mut self) {
        let mut sorted = [0u64; INTERVAL_HISTORY];
        let mut count = 0;
        for &ms in &self.intervals {
            if ms > 0 && ms < self.config.max_interval_ms {
                sorted[count] = ms;
                count += 1;
            }
        }
        if count < MIN_INTERVALS_FOR_BPM {
            return;
        }

        let valid = &mut sorted[..count];
        valid.sort_unstable();
        let median = valid[valid.len() / 2];
        let new_bpm = 60_000.0 / median as f32;

        self.bpm = if self.bpm == 0.0 {
            new_bpm
        } else {
            self.bpm * BPM_SMOOTHING + new_bpm * (1.0 - BPM_SMOOTHING)
        };

        // Octave-fold into a plausible tempo
        while self.bpm < BPM_RANGE.0 {
            self.bpm *= 2.0;
        }
        while self.bpm > BPM_RANGE.1 {
            self.bpm /= 2.0;
        }
    }

    /// Smoothed tempo estimate, 0 until enough intervals are known
    pub fn bpm(&self) -> f32 {
        self.bpm
    }

    /// Beats registered since construction
    pub fn total_beats(&self) -> u32 {
        self.total_beats
    }

    /// Percentage of interval slots filled
    pub fn confidence(&self) -> u8 {
        let filled = self.intervals.iter().filter(|&&ms| ms > 0).count();
        (filled * 100 / INTERVAL_HISTORY) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME_MS: u64 = 10;

    fn frame(level: u8) -> [u8; NUM_BANDS] {
        let mut heights = [0; NUM_BANDS];
        heights[1..8].fill(level);
        heights
    }

    /// Two loud frames at each onset on a 10 ms frame clock, low hum otherwise.
    fn run_onsets(detector: &mut BeatDetector, onsets: &[u64], until_ms: u64) -> Vec<u64> {
        let mut beats = Vec::new();
        let mut t = 0;
        while t <= until_ms {
            let spiking = onsets.iter().any(|&o| t >= o && t < o + FRAME_MS * 2);
            if detector.update(&frame(if spiking { 200 } else { 5 }), t) {
                beats.push(t);
            }
            t += FRAME_MS;
        }
        beats
    }

    fn periodic(period_ms: u64, count: u64) -> Vec<u64> {
        (1..=count).map(|i| i * period_ms + 300).collect()
    }

    #[test]
    fn silence_never_fires() {
        let mut detector = BeatDetector::new(BeatConfig::default());
        for i in 0..500 {
            assert!(!detector.update(&frame(0), i * FRAME_MS));
        }
        assert_eq!(detector.total_beats(), 0);
        assert_eq!(detector.bpm(), 0.0);
        assert_eq!(detector.confidence(), 0);
    }

    #[test]
    fn spikes_below_noise_floor_are_ignored() {
        let mut detector = BeatDetector::new(BeatConfig::default());
        let mut t = 0;
        while t < 3000 {
            // 7 bins * 5 = 35, under the floor of 40
            let level = if t % 600 == 0 { 5 } else { 0 };
            assert!(!detector.update(&frame(level), t));
            t += FRAME_MS;
        }
        assert_eq!(detector.total_beats(), 0);
    }

    #[test]
    fn beats_are_never_closer_than_min_interval() {
        let mut detector = BeatDetector::new(BeatConfig::default());
        // Onsets every 90 ms, far faster than the 300 ms refractory period
        let onsets: Vec<u64> = (0..60).map(|i| 300 + i * 90).collect();
        let beats = run_onsets(&mut detector, &onsets, 6000);

        assert!(beats.len() > 1);
        for pair in beats.windows(2) {
            assert!(pair[1] - pair[0] > 300, "beats at {} and {}", pair[0], pair[1]);
        }
        assert_eq!(detector.total_beats() as usize, beats.len());
    }

    #[test]
    fn two_onsets_100ms_apart_register_once() {
        let mut detector = BeatDetector::new(BeatConfig::default());
        let beats = run_onsets(&mut detector, &[500, 600], 1500);
        assert_eq!(beats, vec![500]);
    }

    #[test]
    fn steady_500ms_train_locks_to_120_bpm() {
        let mut early = BeatDetector::new(BeatConfig::default());
        let beats = run_onsets(&mut early, &periodic(500, 3), 2000);
        assert_eq!(beats.len(), 3);
        assert_eq!(early.bpm(), 0.0, "two intervals are not enough");

        let mut detector = BeatDetector::new(BeatConfig::default());
        let beats = run_onsets(&mut detector, &periodic(500, 4), 2500);
        assert_eq!(beats, vec![800, 1300, 1800, 2300]);
        assert!((detector.bpm() - 120.0).abs() < 0.5, "got {}", detector.bpm());
        assert_eq!(detector.total_beats(), 4);
    }

    #[test]
    fn long_train_stays_at_120_bpm() {
        let mut detector = BeatDetector::new(BeatConfig::default());
        let beats = run_onsets(&mut detector, &periodic(500, 20), 11_000);

        assert_eq!(beats.len(), 20);
        assert!((detector.bpm() - 120.0).abs() < 0.5, "got {}", detector.bpm());
        assert_eq!(detector.confidence(), 100);
    }

    #[test]
    fn alternating_intervals_fold_into_range() {
        let mut detector = BeatDetector::new(BeatConfig::default());
        let mut onsets = Vec::new();
        let mut t = 300;
        for i in 0..12 {
            onsets.push(t);
            t += if i % 2 == 0 { 500 } else { 1000 };
        }
        let beats = run_onsets(&mut detector, &onsets, t);

        assert_eq!(beats.len(), 12);
        let bpm = detector.bpm();
        assert!((60.0..=180.0).contains(&bpm), "got {bpm}");
    }

    #[test]
    fn slow_tempo_is_doubled_into_range() {
        let mut detector = BeatDetector::new(BeatConfig::default());
        // 1500 ms spacing is 40 BPM
        run_onsets(&mut detector, &periodic(1500, 4), 6500);
        assert!((detector.bpm() - 80.0).abs() < 0.5, "got {}", detector.bpm());
    }

    #[test]
    fn long_gaps_count_as_beats_but_not_intervals() {
        let mut detector = BeatDetector::new(BeatConfig::default());
        let beats = run_onsets(&mut detector, &periodic(2400, 4), 10_000);

        assert_eq!(beats.len(), 4);
        assert_eq!(detector.total_beats(), 4);
        assert_eq!(detector.confidence(), 0);
        assert_eq!(detector.bpm(), 0.0);
    }

    #[test]
    fn confidence_grows_with_filled_intervals() {
        let mut detector = BeatDetector::new(BeatConfig::default());
        let mut previous = detector.confidence();
        assert_eq!(previous, 0);

        let mut t = 0;
        for _ in 0..20 {
            for _ in 0..40 {
                detector.update(&frame(5), t);
                t += FRAME_MS;
            }
            assert!(detector.update(&frame(200), t));
            t += FRAME_MS;

            let confidence = detector.confidence();
            assert!(confidence >= previous);
            previous = confidence;
        }
        assert_eq!(previous, 100);
    }

    #[test]
    fn even_interval_count_uses_upper_median() {
        let mut detector = BeatDetector::new(BeatConfig::default());
        let beats = run_onsets(&mut detector, &[300, 700, 1100, 1700, 2300], 2500);
        assert_eq!(beats.len(), 5);

        // [400, 400, 600] gives 150 BPM; [400, 400, 600, 600] picks 600 ms (100 BPM)
        // and smooths to 0.7 * 150 + 0.3 * 100
        assert!((detector.bpm() - 135.0).abs() < 0.5, "got {}", detector.bpm());
    }
}
