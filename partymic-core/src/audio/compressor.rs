//! Fixed-parameter dynamics compressor.
//!
//! Feed-forward design modelled on the Web Audio `DynamicsCompressorNode`:
//! a per-sample level detector in dB, a soft-knee static curve, one-pole
//! attack/release smoothing of the gain reduction, and automatic makeup gain
//! of `(1 / full_range_gain)^0.6`.

/// Compressor settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompressorParams {
    pub threshold_db: f32,
    pub knee_db: f32,
    pub ratio: f32,
    pub attack_secs: f32,
    pub release_secs: f32,
}

/// The only settings the microphone chain uses. They keep a close, loud
/// microphone from clipping and are not user configurable.
pub const MIC_COMPRESSOR: CompressorParams = CompressorParams {
    threshold_db: -50.0,
    knee_db: 40.0,
    ratio: 12.0,
    attack_secs: 0.0,
    release_secs: 0.25,
};

const MAKEUP_EXPONENT: f32 = 0.6;
const SILENCE_DB: f32 = -200.0;

fn db_to_linear(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

fn linear_to_db(value: f32) -> f32 {
    if value <= 0.0 {
        SILENCE_DB
    } else {
        20.0 * value.log10()
    }
}

/// One-pole smoothing coefficient for a time constant. Zero means instant.
fn time_coefficient(secs: f32, sample_rate: u32) -> f32 {
    if secs <= 0.0 || sample_rate == 0 {
        0.0
    } else {
        (-1.0 / (secs * sample_rate as f32)).exp()
    }
}

impl CompressorParams {
    /// Output level in dB for a steady input level in dB.
    pub fn static_curve(&self, input_db: f32) -> f32 {
        let over = input_db - self.threshold_db;
        let half_knee = self.knee_db / 2.0;
        if self.knee_db > 0.0 && over.abs() <= half_knee {
            let x = over + half_knee;
            input_db + (1.0 / self.ratio - 1.0) * x * x / (2.0 * self.knee_db)
        } else if over > half_knee {
            self.threshold_db + over / self.ratio
        } else {
            input_db
        }
    }

    /// Linear makeup gain applied after reduction.
    pub fn makeup_gain(&self) -> f32 {
        let full_range_gain = db_to_linear(self.static_curve(0.0));
        (1.0 / full_range_gain).powf(MAKEUP_EXPONENT)
    }
}

#[derive(Debug, Clone)]
pub struct DynamicsCompressor {
    params: CompressorParams,
    attack_coef: f32,
    release_coef: f32,
    makeup: f32,
    /// Smoothed gain reduction in dB (always <= 0).
    reduction_db: f32,
}

impl DynamicsCompressor {
    pub fn new(params: CompressorParams, sample_rate: u32) -> Self {
        Self {
            params,
            attack_coef: time_coefficient(params.attack_secs, sample_rate),
            release_coef: time_coefficient(params.release_secs, sample_rate),
            makeup: params.makeup_gain(),
            reduction_db: 0.0,
        }
    }

    pub fn params(&self) -> &CompressorParams {
        &self.params
    }

    /// Current gain reduction in dB, like the Web Audio `reduction` meter.
    pub fn reduction_db(&self) -> f32 {
        self.reduction_db
    }

    pub fn process(&mut self, samples: &mut [f32]) {
        for s in samples.iter_mut() {
            let level_db = linear_to_db(s.abs());
            let target = (self.params.static_curve(level_db) - level_db).min(0.0);
            let coef = if target < self.reduction_db {
                self.attack_coef
            } else {
                self.release_coef
            };
            self.reduction_db = coef * self.reduction_db + (1.0 - coef) * target;
            *s *= db_to_linear(self.reduction_db) * self.makeup;
        }
    }

    pub fn reset(&mut self) {
        self.reduction_db = 0.0;
    }
}
