//! Convolution reverb with a synthesized impulse response.
//!
//! The impulse response is two seconds of stereo white noise under an
//! exponential decay that falls 60 dB over its length. It is downmixed to
//! mono and normalised to unit energy before use, and convolved with a
//! uniformly partitioned overlap-save FFT convolver.

use std::sync::Arc;

use rand::Rng;
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

/// Impulse response length in seconds.
pub const IMPULSE_SECONDS: f32 = 2.0;
pub const IMPULSE_CHANNELS: usize = 2;
/// Convolver partition size in samples. Also the reverb's latency.
pub const REVERB_BLOCK: usize = 128;
/// Wet level mixed over the dry signal.
pub const REVERB_WET: f32 = 0.35;

/// Amplitude envelope at `t` seconds: `exp(-t * ln(1000) / IMPULSE_SECONDS)`.
pub fn decay_envelope(t: f32) -> f32 {
    (-t * 1000f32.ln() / IMPULSE_SECONDS).exp()
}

#[derive(Debug, Clone)]
pub struct ImpulseResponse {
    sample_rate: u32,
    channels: Vec<Vec<f32>>,
}

impl ImpulseResponse {
    pub fn synthesize<R: Rng + ?Sized>(sample_rate: u32, rng: &mut R) -> Self {
        let len = (sample_rate as f32 * IMPULSE_SECONDS) as usize;
        let channels = (0..IMPULSE_CHANNELS)
            .map(|_| {
                (0..len)
                    .map(|i| {
                        let t = i as f32 / sample_rate as f32;
                        rng.random_range(-1.0f32..1.0) * decay_envelope(t)
                    })
                    .collect()
            })
            .collect();
        Self {
            sample_rate,
            channels,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn len(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn channel(&self, index: usize) -> Option<&[f32]> {
        self.channels.get(index).map(Vec::as_slice)
    }

    /// Average of all channels scaled to unit energy.
    pub fn to_mono_normalized(&self) -> Vec<f32> {
        let count = self.channels.len().max(1) as f32;
        let mut mono: Vec<f32> = (0..self.len())
            .map(|i| self.channels.iter().map(|c| c[i]).sum::<f32>() / count)
            .collect();
        let energy: f32 = mono.iter().map(|s| s * s).sum();
        if energy > 0.0 {
            let scale = energy.sqrt().recip();
            for s in &mut mono {
                *s *= scale;
            }
        }
        mono
    }
}

/// Uniformly partitioned overlap-save convolver.
///
/// Output lags input by exactly `block` samples.
pub struct PartitionedConvolver {
    block: usize,
    fft: Arc<dyn Fft<f32>>,
    ifft: Arc<dyn Fft<f32>>,
    /// Spectra of the zero-padded impulse partitions.
    partitions: Vec<Vec<Complex<f32>>>,
    /// Input spectra, newest at `fdl_head`.
    fdl: Vec<Vec<Complex<f32>>>,
    fdl_head: usize,
    /// Previous block followed by the current block.
    window: Vec<f32>,
    input: Vec<f32>,
    output: Vec<f32>,
    pos: usize,
    scratch: Vec<Complex<f32>>,
    acc: Vec<Complex<f32>>,
}

impl PartitionedConvolver {
    pub fn new(impulse: &[f32], block: usize) -> Self {
        let block = block.max(1);
        let n = block * 2;
        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(n);
        let ifft = planner.plan_fft_inverse(n);

        let partitions: Vec<Vec<Complex<f32>>> = impulse
            .chunks(block)
            .map(|chunk| {
                let mut buf = vec![Complex::new(0.0, 0.0); n];
                for (dst, &src) in buf.iter_mut().zip(chunk) {
                    dst.re = src;
                }
                fft.process(&mut buf);
                buf
            })
            .collect();
        let fdl = vec![vec![Complex::new(0.0, 0.0); n]; partitions.len().max(1)];

        Self {
            block,
            fft,
            ifft,
            partitions,
            fdl,
            fdl_head: 0,
            window: vec![0.0; n],
            input: vec![0.0; block],
            output: vec![0.0; block],
            pos: 0,
            scratch: vec![Complex::new(0.0, 0.0); n],
            acc: vec![Complex::new(0.0, 0.0); n],
        }
    }

    pub fn block_size(&self) -> usize {
        self.block
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Convolve `samples` in place.
    pub fn process(&mut self, samples: &mut [f32]) {
        for s in samples.iter_mut() {
            self.input[self.pos] = *s;
            *s = self.output[self.pos];
            self.pos += 1;
            if self.pos == self.block {
                self.pos = 0;
                self.run_block();
            }
        }
    }

    fn run_block(&mut self) {
        let b = self.block;
        let n = b * 2;

        self.window.copy_within(b.., 0);
        self.window[b..].copy_from_slice(&self.input);

        self.fdl_head = (self.fdl_head + self.fdl.len() - 1) % self.fdl.len();
        let slot = &mut self.fdl[self.fdl_head];
        for (dst, &src) in slot.iter_mut().zip(&self.window) {
            *dst = Complex::new(src, 0.0);
        }
        self.fft.process(slot);

        for c in &mut self.acc {
            *c = Complex::new(0.0, 0.0);
        }
        let depth = self.fdl.len();
        for (p, h) in self.partitions.iter().enumerate() {
            let x = &self.fdl[(self.fdl_head + p) % depth];
            for ((a, xv), hv) in self.acc.iter_mut().zip(x).zip(h) {
                *a += xv * hv;
            }
        }

        self.scratch.copy_from_slice(&self.acc);
        self.ifft.process(&mut self.scratch);
        let scale = 1.0 / n as f32;
        for (dst, c) in self.output.iter_mut().zip(&self.scratch[b..]) {
            *dst = c.re * scale;
        }
    }

    pub fn reset(&mut self) {
        for spectrum in &mut self.fdl {
            spectrum.fill(Complex::new(0.0, 0.0));
        }
        self.window.fill(0.0);
        self.input.fill(0.0);
        self.output.fill(0.0);
        self.pos = 0;
    }
}

/// Dry signal plus a fixed proportion of the convolved signal.
pub struct ConvolutionReverb {
    convolver: PartitionedConvolver,
    wet: f32,
    wet_buf: Vec<f32>,
}

impl ConvolutionReverb {
    pub fn new(impulse: &ImpulseResponse) -> Self {
        Self {
            convolver: PartitionedConvolver::new(&impulse.to_mono_normalized(), REVERB_BLOCK),
            wet: REVERB_WET,
            wet_buf: Vec::new(),
        }
    }

    pub fn with_rng<R: Rng + ?Sized>(sample_rate: u32, rng: &mut R) -> Self {
        Self::new(&ImpulseResponse::synthesize(sample_rate, rng))
    }

    pub fn wet(&self) -> f32 {
        self.wet
    }

    pub fn process(&mut self, samples: &mut [f32]) {
        self.wet_buf.clear();
        self.wet_buf.extend_from_slice(samples);
        self.convolver.process(&mut self.wet_buf);
        for (dry, wet) in samples.iter_mut().zip(&self.wet_buf) {
            *dry += wet * self.wet;
        }
    }
}

impl std::fmt::Debug for ConvolutionReverb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConvolutionReverb")
            .field("wet", &self.wet)
            .field("block", &self.convolver.block_size())
            .field("partitions", &self.convolver.partition_count())
            .finish()
    }
}
