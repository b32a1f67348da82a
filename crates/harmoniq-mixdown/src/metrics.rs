//! Objective measurements of a rendered mix.
//!
//! Levels use the AES17 convention: RMS is referenced to a full-scale sine,
//! so a 0 dBFS sine reads 0 dBFS RMS. Loudness follows ITU-R BS.1770
//! (K-weighting, 400 ms gating blocks with 75 % overlap, absolute and
//! relative gates).

use std::f64::consts::PI;

use serde::Serialize;

use harmoniq_plugin_host::AudioBuffer;

use crate::level::{linear_to_db, FLOOR_DB, SILENCE_THRESHOLD};
use crate::output::RenderedMix;

const ABSOLUTE_GATE_LUFS: f64 = -70.0;
const RELATIVE_GATE_LU: f64 = -10.0;
/// 100 ms steps per 400 ms gating block.
const STEPS_PER_BLOCK: usize = 4;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderMetrics {
    pub rms_db: f32,
    pub peak_db: f32,
    /// `None` when no gating block passes the BS.1770 gates.
    pub lufs_integrated: Option<f32>,
    /// Runs of consecutive blocks that came out silent while the inputs
    /// were active, counting only runs at least as long as the dropout
    /// window.
    pub dropout_count: usize,
    pub silence_percentage: f32,
    pub clipped: bool,
    pub empty: bool,
}

impl RenderMetrics {
    /// Baseline for a render with no active tracks. Levels sit at the floor
    /// and silence is reported as zero, since there was nothing to drop out.
    pub fn empty() -> Self {
        Self {
            rms_db: FLOOR_DB,
            peak_db: FLOOR_DB,
            lufs_integrated: None,
            dropout_count: 0,
            silence_percentage: 0.0,
            clipped: false,
            empty: true,
        }
    }

    /// Measures a finished `mix`. `input_active[b]` tells whether any track
    /// fed signal into block `b` of `block_size` frames.
    pub fn measure(
        mix: &RenderedMix,
        block_size: usize,
        input_active: &[bool],
        dropout_window: usize,
    ) -> Self {
        let mut meter = MixMeter::new(mix.sample_rate(), dropout_window);
        let block_size = block_size.max(1);
        let frames = mix.frames();
        let mut start = 0;
        for block in 0.. {
            if start >= frames {
                break;
            }
            let end = (start + block_size).min(frames);
            let active = input_active.get(block).copied().unwrap_or(false);
            meter.push_with(mix.channels(), end - start, active, |channel| {
                &mix.channel(channel)[start..end]
            });
            start = end;
        }
        meter.finish()
    }
}

/// Running measurement of a mix, fed one output block at a time.
///
/// Holds scalars plus one loudness power per 100 ms of audio, so
/// [`MixMeter::finish`] costs the same after a cancel at any point of a
/// render.
#[derive(Debug, Clone)]
pub struct MixMeter {
    sum_squares: f64,
    samples: u64,
    peak: f32,
    clipped: bool,
    frames: u64,
    silent_frames: u64,
    /// Per-frame scratch: some channel at or above the silence threshold.
    loud: Vec<bool>,
    dropout_window: usize,
    dropout_run: usize,
    dropouts: usize,
    loudness: LoudnessMeter,
}

impl MixMeter {
    pub fn new(sample_rate: f64, dropout_window: usize) -> Self {
        Self {
            sum_squares: 0.0,
            samples: 0,
            peak: 0.0,
            clipped: false,
            frames: 0,
            silent_frames: 0,
            loud: Vec::new(),
            dropout_window: dropout_window.max(1),
            dropout_run: 0,
            dropouts: 0,
            loudness: LoudnessMeter::new(sample_rate),
        }
    }

    /// Reserves room for a render of `frames` frames of `block_size`.
    pub fn with_capacity(mut self, frames: usize, block_size: usize) -> Self {
        self.loud.reserve(block_size);
        self.loudness.reserve(frames);
        self
    }

    /// Frames measured so far.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Adds one output block. `input_active` tells whether any track fed
    /// signal into it.
    pub fn push_block(&mut self, block: &AudioBuffer, input_active: bool) {
        self.push_with(block.channels(), block.frames(), input_active, |channel| {
            block.channel(channel)
        });
    }

    fn push_with<'s>(
        &mut self,
        channels: usize,
        frames: usize,
        input_active: bool,
        channel: impl Fn(usize) -> &'s [f32],
    ) {
        self.loud.clear();
        self.loud.resize(frames, false);
        for index in 0..channels {
            let samples = channel(index);
            for (loud, sample) in self.loud.iter_mut().zip(samples) {
                let level = sample.abs();
                self.sum_squares += f64::from(*sample) * f64::from(*sample);
                self.peak = self.peak.max(level);
                self.clipped |= level >= 1.0;
                *loud |= level >= SILENCE_THRESHOLD;
            }
            self.samples += samples.len().min(frames) as u64;
        }

        let silent = self.loud.iter().filter(|loud| !**loud).count();
        self.silent_frames += silent as u64;
        self.frames += frames as u64;
        if input_active && frames > 0 && silent == frames {
            self.dropout_run += 1;
            if self.dropout_run == self.dropout_window {
                self.dropouts += 1;
            }
        } else {
            self.dropout_run = 0;
        }

        self.loudness.push(channels, frames, channel);
    }

    pub fn finish(&self) -> RenderMetrics {
        let rms_db = if self.samples == 0 {
            FLOOR_DB
        } else {
            let rms = (self.sum_squares / self.samples as f64).sqrt() * std::f64::consts::SQRT_2;
            linear_to_db(rms as f32)
        };
        let silence_percentage = if self.frames == 0 {
            0.0
        } else {
            (self.silent_frames as f64 * 100.0 / self.frames as f64) as f32
        };
        RenderMetrics {
            rms_db,
            peak_db: linear_to_db(self.peak),
            lufs_integrated: self.loudness.integrated(),
            dropout_count: self.dropouts,
            silence_percentage,
            clipped: self.clipped,
            empty: false,
        }
    }
}

/// RMS over every channel, relative to a full-scale sine.
pub fn rms_db(channels: &[&[f32]]) -> f32 {
    let mut sum = 0.0f64;
    let mut count = 0usize;
    for channel in channels {
        sum += channel.iter().map(|s| f64::from(*s) * f64::from(*s)).sum::<f64>();
        count += channel.len();
    }
    if count == 0 {
        return FLOOR_DB;
    }
    let rms = (sum / count as f64).sqrt() * std::f64::consts::SQRT_2;
    linear_to_db(rms as f32)
}

pub fn peak_db(channels: &[&[f32]]) -> f32 {
    let peak = channels
        .iter()
        .flat_map(|channel| channel.iter())
        .fold(0.0f32, |peak, sample| peak.max(sample.abs()));
    linear_to_db(peak)
}

#[derive(Debug, Clone, Copy)]
struct Biquad {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
    z1: f64,
    z2: f64,
}

impl Biquad {
    fn new(b0: f64, b1: f64, b2: f64, a1: f64, a2: f64) -> Self {
        Self {
            b0,
            b1,
            b2,
            a1,
            a2,
            z1: 0.0,
            z2: 0.0,
        }
    }

    #[inline]
    fn process(&mut self, x: f64) -> f64 {
        let y = self.b0 * x + self.z1;
        self.z1 = self.b1 * x - self.a1 * y + self.z2;
        self.z2 = self.b2 * x - self.a2 * y;
        y
    }
}

/// The two BS.1770 pre-filters (high shelf, then high pass) for `sample_rate`.
fn k_weighting(sample_rate: f64) -> (Biquad, Biquad) {
    let f0 = 1681.974450955533;
    let gain_db = 3.999843853973347;
    let q = 0.7071752369554196;
    let k = (PI * f0 / sample_rate).tan();
    let vh = 10f64.powf(gain_db / 20.0);
    let vb = vh.powf(0.4996667741545416);
    let a0 = 1.0 + k / q + k * k;
    let shelf = Biquad::new(
        (vh + vb * k / q + k * k) / a0,
        2.0 * (k * k - vh) / a0,
        (vh - vb * k / q + k * k) / a0,
        2.0 * (k * k - 1.0) / a0,
        (1.0 - k / q + k * k) / a0,
    );

    let f0 = 38.13547087602444;
    let q = 0.5003270373238773;
    let k = (PI * f0 / sample_rate).tan();
    let a0 = 1.0 + k / q + k * k;
    let highpass = Biquad::new(
        1.0,
        -2.0,
        1.0,
        2.0 * (k * k - 1.0) / a0,
        (1.0 - k / q + k * k) / a0,
    );
    (shelf, highpass)
}

/// Gated integrated loudness in LUFS. Every channel is weighted 1.0.
pub fn integrated_loudness(channels: &[&[f32]], sample_rate: f64) -> Option<f32> {
    let frames = channels.iter().map(|c| c.len()).min().unwrap_or(0);
    let mut meter = LoudnessMeter::new(sample_rate);
    let chunk = meter.step.max(1);
    let mut start = 0;
    while start < frames {
        let end = (start + chunk).min(frames);
        meter.push(channels.len(), end - start, |channel| {
            &channels[channel][start..end]
        });
        start = end;
    }
    meter.integrated()
}

/// BS.1770 loudness, streamed: K-weighted energy is summed into 100 ms
/// steps and each 400 ms gating block keeps a single mean power.
#[derive(Debug, Clone)]
struct LoudnessMeter {
    sample_rate: f64,
    /// Frames per 100 ms step.
    step: usize,
    filters: Vec<(Biquad, Biquad)>,
    /// Per-frame energy of the block being pushed, summed over channels.
    energy: Vec<f64>,
    step_energy: f64,
    step_fill: usize,
    recent: [f64; STEPS_PER_BLOCK],
    steps: usize,
    block_powers: Vec<f64>,
}

impl LoudnessMeter {
    fn new(sample_rate: f64) -> Self {
        Self {
            sample_rate,
            step: (0.1 * sample_rate).round() as usize,
            filters: Vec::new(),
            energy: Vec::new(),
            step_energy: 0.0,
            step_fill: 0,
            recent: [0.0; STEPS_PER_BLOCK],
            steps: 0,
            block_powers: Vec::new(),
        }
    }

    fn reserve(&mut self, frames: usize) {
        if self.step > 0 {
            self.block_powers.reserve(frames / self.step);
        }
    }

    fn push<'s>(&mut self, channels: usize, frames: usize, channel: impl Fn(usize) -> &'s [f32]) {
        if self.step == 0 || channels == 0 {
            return;
        }
        if self.filters.len() < channels {
            let sample_rate = self.sample_rate;
            self.filters
                .resize_with(channels, || k_weighting(sample_rate));
        }
        self.energy.clear();
        self.energy.resize(frames, 0.0);
        for (index, (shelf, highpass)) in self.filters.iter_mut().take(channels).enumerate() {
            for (energy, sample) in self.energy.iter_mut().zip(channel(index)) {
                let y = highpass.process(shelf.process(f64::from(*sample)));
                *energy += y * y;
            }
        }
        for frame in 0..frames {
            self.step_energy += self.energy[frame];
            self.step_fill += 1;
            if self.step_fill == self.step {
                self.close_step();
            }
        }
    }

    fn close_step(&mut self) {
        self.recent[self.steps % STEPS_PER_BLOCK] = self.step_energy;
        self.steps += 1;
        self.step_energy = 0.0;
        self.step_fill = 0;
        if self.steps >= STEPS_PER_BLOCK {
            let block_frames = (self.step * STEPS_PER_BLOCK) as f64;
            self.block_powers
                .push(self.recent.iter().sum::<f64>() / block_frames);
        }
    }

    fn integrated(&self) -> Option<f32> {
        let loudness = |power: f64| -0.691 + 10.0 * power.log10();
        let gated_mean = |threshold: f64| {
            let (sum, count) = self
                .block_powers
                .iter()
                .filter(|power| **power > 0.0 && loudness(**power) > threshold)
                .fold((0.0, 0usize), |(sum, count), power| (sum + power, count + 1));
            (count > 0).then(|| sum / count as f64)
        };

        let absolute = gated_mean(ABSOLUTE_GATE_LUFS)?;
        let relative_gate = loudness(absolute) + RELATIVE_GATE_LU;
        let integrated = gated_mean(relative_gate.max(ABSOLUTE_GATE_LUFS))?;
        Some(loudness(integrated) as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(frequency: f32, amplitude: f32, frames: usize, sample_rate: f32) -> Vec<f32> {
        (0..frames)
            .map(|i| {
                amplitude * (std::f32::consts::TAU * frequency * i as f32 / sample_rate).sin()
            })
            .collect()
    }

    #[test]
    fn full_scale_sine_reads_zero_dbfs() {
        let tone = sine(1_000.0, 1.0, 48_000, 48_000.0);
        assert!(rms_db(&[&tone]).abs() < 0.01);
        assert!(peak_db(&[&tone]).abs() < 0.01);
    }

    #[test]
    fn silence_sits_on_the_floor() {
        let silence = vec![0.0f32; 4_800];
        assert_eq!(rms_db(&[&silence]), FLOOR_DB);
        assert_eq!(integrated_loudness(&[&silence], 48_000.0), None);
    }

    #[test]
    fn stereo_sine_loudness_is_near_its_level() {
        // A 1 kHz stereo sine at -20 dBFS peak reads close to -20 LUFS; the
        // K-weighting shelf adds a little under 1 dB at 1 kHz.
        let tone = sine(1_000.0, 0.1, 96_000, 48_000.0);
        let lufs = integrated_loudness(&[&tone, &tone], 48_000.0).unwrap();
        assert!((-21.0..=-19.0).contains(&lufs), "{lufs}");
    }

    #[test]
    fn short_renders_have_no_loudness() {
        let tone = sine(1_000.0, 0.5, 4_800, 48_000.0);
        assert_eq!(integrated_loudness(&[&tone], 48_000.0), None);
    }

    fn mono_block(value: f32, frames: usize) -> AudioBuffer {
        AudioBuffer::from_channels(vec![vec![value; frames]])
    }

    #[test]
    fn consecutive_silent_blocks_count_as_one_dropout() {
        let pattern = [0.5, 0.0, 0.0, 0.5];
        let run = |window: usize, active: [bool; 4]| {
            let mut meter = MixMeter::new(48_000.0, window);
            for (value, active) in pattern.into_iter().zip(active) {
                meter.push_block(&mono_block(value, 10), active);
            }
            meter.finish()
        };
        assert_eq!(run(1, [true; 4]).dropout_count, 1);
        assert_eq!(run(3, [true; 4]).dropout_count, 0);
        assert_eq!(run(1, [true, false, false, true]).dropout_count, 0);
        assert_eq!(run(1, [true; 4]).silence_percentage, 50.0);
    }

    #[test]
    fn streamed_blocks_match_a_whole_buffer_measurement() {
        let tone = sine(997.0, 0.3, 48_000, 48_000.0);
        let mut meter = MixMeter::new(48_000.0, 1).with_capacity(tone.len(), 333);
        for chunk in tone.chunks(333) {
            let block = AudioBuffer::from_channels(vec![chunk.to_vec(), chunk.to_vec()]);
            meter.push_block(&block, true);
        }
        let streamed = meter.finish();
        assert_eq!(meter.frames(), 48_000);
        assert!((streamed.rms_db - rms_db(&[&tone, &tone])).abs() < 1e-3);
        assert_eq!(streamed.peak_db, peak_db(&[&tone]));
        let whole = integrated_loudness(&[&tone, &tone], 48_000.0).unwrap();
        let streamed_lufs = streamed.lufs_integrated.unwrap();
        assert!((streamed_lufs - whole).abs() < 1e-3, "{streamed_lufs} vs {whole}");
        assert!(!streamed.clipped);
        assert_eq!(streamed.dropout_count, 0);
    }

    #[test]
    fn finishing_keeps_one_power_per_step_not_per_sample() {
        let mut meter = MixMeter::new(48_000.0, 1);
        let block = mono_block(0.25, 4_800);
        for _ in 0..100 {
            meter.push_block(&block, true);
        }
        // Ten seconds: 100 steps give 97 overlapping gating blocks.
        assert_eq!(meter.loudness.block_powers.len(), 97);
        assert!(meter.finish().lufs_integrated.is_some());
    }

    #[test]
    fn measuring_a_finished_mix_splits_it_into_blocks() {
        let mut mix = RenderedMix::silent(48_000.0, 1, 40);
        mix.channel_mut(0)[..10].fill(0.5);
        mix.channel_mut(0)[30..].fill(0.5);
        let metrics = RenderMetrics::measure(&mix, 10, &[true; 4], 2);
        assert_eq!(metrics.dropout_count, 1);
        assert_eq!(metrics.silence_percentage, 50.0);
        assert!(!metrics.empty);
    }
}
