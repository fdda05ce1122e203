//! Per-bin attack/decay envelope with peak hold

use super::{AudioConfig, Frame, NUM_BANDS};

/// Rise coefficient for a given AGC energy.
///
/// Louder overall input makes every bin follow rises faster.
pub fn attack_coefficient(agc_energy: f32) -> f32 {
    (1.0 + agc_energy * 10.0).clamp(0.2, 0.9)
}

/// Fall coefficient for a given AGC energy.
///
/// Louder overall input makes every bin let go sooner.
pub fn decay_coefficient(agc_energy: f32) -> f32 {
    (1.0 - agc_energy * 0.15).clamp(0.6, 0.95)
}

/// Smooths auto-gained heights into the bar and peak values the renderer sees
pub struct EnvelopeTracker {
    last_height: [f32; NUM_BANDS],
    peak: [f32; NUM_BANDS],
    hold: [u8; NUM_BANDS],
    hold_cycles: u8,
    peak_decay: f32,
}

impl EnvelopeTracker {
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            last_height: [0.0; NUM_BANDS],
            peak: [0.0; NUM_BANDS],
            hold: [0; NUM_BANDS],
            hold_cycles: config.peak_hold_cycles,
            peak_decay: config.peak_decay,
        }
    }

    /// Advance one processing cycle and return the clamped output frame.
    pub fn update(&mut self, current: &[f32; NUM_BANDS], agc_energy: f32) -> Frame {
        let attack = attack_coefficient(agc_energy);
        let decay = decay_coefficient(agc_energy);

        for i in 0..NUM_BANDS {
            let target = current[i];
            let height = &mut self.last_height[i];
            if target > *height {
                *height = *height * (1.0 - attack) + target * attack;
            } else {
                *height = *height * decay + target * (1.0 - decay);
            }

            if *height > self.peak[i] {
                self.peak[i] = *height;
                self.hold[i] = self.hold_cycles;
            } else if self.hold[i] > 0 {
                self.hold[i] -= 1;
            } else {
                self.peak[i] *= self.peak_decay;
            }
        }

        let mut frame = Frame::default();
        for i in 0..NUM_BANDS {
            frame.heights[i] = self.last_height[i].clamp(0.0, NUM_BANDS as f32);
            frame.peaks[i] = self.peak[i].clamp(0.0, (NUM_BANDS - 1) as f32);
        }
        frame.energy = frame.heights.iter().sum::<f32>() / NUM_BANDS as f32;
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_approx(actual: f32, expected: f32, tolerance: f32) {
        assert!(
            (actual - expected).abs() <= tolerance,
            "expected {expected} +/- {tolerance}, got {actual}"
        );
    }

    fn tracker() -> EnvelopeTracker {
        EnvelopeTracker::new(&AudioConfig::default())
    }

    #[test]
    fn coefficients_stay_in_range_and_move_with_energy() {
        let energies = [0.0, 0.1, 0.5, 1.0, 2.0, 3.0, 10.0, 64.0];
        for pair in energies.windows(2) {
            let (quiet, loud) = (pair[0], pair[1]);
            assert!(attack_coefficient(loud) >= attack_coefficient(quiet));
            assert!(decay_coefficient(loud) <= decay_coefficient(quiet));
        }
        for &e in &energies {
            assert!((0.2..=0.9).contains(&attack_coefficient(e)));
            assert!((0.6..=0.95).contains(&decay_coefficient(e)));
        }

        // Inside the unclamped window decay falls strictly
        assert!(decay_coefficient(1.0) < decay_coefficient(0.5));
        assert!(decay_coefficient(2.0) < decay_coefficient(1.0));
        assert_approx(decay_coefficient(0.0), 0.95, 1e-6);
        assert_approx(decay_coefficient(10.0), 0.6, 1e-6);
        assert_approx(attack_coefficient(0.0), 0.9, 1e-6);
    }

    #[test]
    fn step_input_converges_monotonically() {
        let mut env = tracker();
        let mut input = [0.0; NUM_BANDS];
        input[5] = 40.0;

        let mut previous = 0.0;
        for _ in 0..20 {
            let frame = env.update(&input, 1.0);
            assert!(frame.heights[5] >= previous);
            assert!(frame.heights[5] <= 40.0);
            previous = frame.heights[5];
        }
        assert_approx(previous, 40.0, 1e-3);

        input[5] = 0.0;
        for _ in 0..20 {
            let frame = env.update(&input, 1.0);
            assert!(frame.heights[5] <= previous);
            previous = frame.heights[5];
        }
        assert!(previous < 40.0 * 0.85_f32.powi(19));
    }

    #[test]
    fn peak_holds_then_decays_geometrically() {
        let mut env = tracker();
        let mut input = [0.0; NUM_BANDS];
        input[3] = 50.0;

        let spike = env.update(&input, 0.0);
        let held = spike.peaks[3];
        assert_approx(held, 45.0, 1e-4);

        // Fastest decay keeps the bar below the falling peak
        input[3] = 0.0;
        for _ in 0..3 {
            let frame = env.update(&input, 10.0);
            assert_eq!(frame.peaks[3], held);
        }

        let mut expected = held;
        for _ in 0..5 {
            expected *= 0.9;
            let frame = env.update(&input, 10.0);
            assert_approx(frame.peaks[3], expected, 1e-4);
        }
    }

    #[test]
    fn outputs_are_clamped_and_energy_is_mean_height() {
        let mut env = tracker();
        let input = [200.0; NUM_BANDS];

        let frame = env.update(&input, 0.0);

        assert!(frame.heights.iter().all(|&h| h == NUM_BANDS as f32));
        assert!(frame.peaks.iter().all(|&p| p == (NUM_BANDS - 1) as f32));
        assert_approx(frame.energy, NUM_BANDS as f32, 1e-4);
    }

    #[test]
    fn silence_stays_at_zero() {
        let mut env = tracker();
        let input = [0.0; NUM_BANDS];
        for _ in 0..10 {
            let frame = env.update(&input, 0.0);
            assert_eq!(frame.energy, 0.0);
            assert!(frame.peaks.iter().all(|&p| p == 0.0));
        }
    }
}
