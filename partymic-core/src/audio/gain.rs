//! User gain with an independent mute switch.

/// Upper bound of the user-controlled gain.
pub const MAX_GAIN: f32 = 2.0;

/// Clamp a requested gain into `0..=MAX_GAIN`. NaN maps to silence.
pub fn clamp_gain(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, MAX_GAIN)
    }
}

#[derive(Debug, Clone)]
pub struct GainStage {
    gain: f32,
    muted: bool,
    /// Gain applied at the end of the last processed block.
    applied: f32,
}

impl GainStage {
    pub fn new(gain: f32, muted: bool) -> Self {
        let gain = clamp_gain(gain);
        let mut stage = Self {
            gain,
            muted,
            applied: 0.0,
        };
        stage.applied = stage.effective_gain();
        stage
    }

    /// Returns the value actually stored.
    pub fn set_gain(&mut self, value: f32) -> f32 {
        self.gain = clamp_gain(value);
        self.gain
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn effective_gain(&self) -> f32 {
        if self.muted { 0.0 } else { self.gain }
    }

    /// Scale `samples` in place, ramping linearly from the previously
    /// applied gain to the current effective gain across the block.
    pub fn process(&mut self, samples: &mut [f32]) {
        let target = self.effective_gain();
        let start = self.applied;
        let n = samples.len();
        if n == 0 {
            return;
        }
        if (target - start).abs() < f32::EPSILON {
            for s in samples.iter_mut() {
                *s *= target;
            }
        } else {
            let step = (target - start) / n as f32;
            for (i, s) in samples.iter_mut().enumerate() {
                *s *= start + step * (i + 1) as f32;
            }
        }
        self.applied = target;
    }
}
