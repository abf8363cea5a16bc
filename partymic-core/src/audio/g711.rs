//! G.711 µ-law (PCMU) codec and a linear resampler.
//!
//! PCMU is what the peer transport carries: 8 kHz mono, 20 ms per frame.

pub const PCMU_SAMPLE_RATE: u32 = 8_000;
pub const PCMU_FRAME_MS: u32 = 20;
pub const PCMU_FRAME_SAMPLES: usize = (PCMU_SAMPLE_RATE * PCMU_FRAME_MS / 1000) as usize;

const BIAS: i32 = 0x84;
const CLIP: i32 = 32_635;

fn to_i16(sample: f32) -> i16 {
    let s = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
    (s * i16::MAX as f32).round() as i16
}

pub fn encode_sample(sample: i16) -> u8 {
    let mut pcm = sample as i32;
    let sign = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0x00
    };
    let pcm = pcm.min(CLIP) + BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && pcm & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (pcm >> (exponent + 3)) & 0x0F;
    !(sign | (exponent << 4) as u8 | mantissa as u8)
}

pub fn decode_sample(byte: u8) -> i16 {
    let byte = !byte;
    let sign = byte & 0x80;
    let exponent = ((byte >> 4) & 0x07) as i32;
    let mantissa = (byte & 0x0F) as i32;
    let magnitude = (((mantissa << 3) + BIAS) << exponent) - BIAS;
    if sign != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// Encode float samples in `[-1, 1]` to µ-law bytes.
pub fn encode_frame(samples: &[f32]) -> Vec<u8> {
    samples.iter().map(|&s| encode_sample(to_i16(s))).collect()
}

/// Decode µ-law bytes to float samples in `[-1, 1]`.
pub fn decode_frame(bytes: &[u8]) -> Vec<f32> {
    bytes
        .iter()
        .map(|&b| decode_sample(b) as f32 / i16::MAX as f32)
        .collect()
}

/// Linear-interpolation resampler. Good enough for voice at PCMU rates.
pub fn resample_linear(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || input.is_empty() || from_rate == 0 || to_rate == 0 {
        return input.to_vec();
    }
    let out_len = (input.len() as u64 * to_rate as u64 / from_rate as u64) as usize;
    let step = from_rate as f64 / to_rate as f64;
    let last = input.len() - 1;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = pos.floor() as usize;
            let frac = (pos - idx as f64) as f32;
            let a = input[idx.min(last)];
            let b = input[(idx + 1).min(last)];
            a + (b - a) * frac
        })
        .collect()
}
