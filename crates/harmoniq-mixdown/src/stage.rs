//! Built-in processing stages.

use harmoniq_plugin_host::{AudioBuffer, InstanceId};

use crate::level::db_to_linear;

/// A DSP stage computed in-process.
///
/// `process` runs once per block on the render path and must not allocate;
/// anything sized by the sample rate or block length belongs in `prepare`.
pub trait BuiltinStage: Send {
    fn name(&self) -> &str;

    fn prepare(&mut self, sample_rate: f64, max_block: usize, channels: usize);

    /// Clears internal state so a render starts from silence.
    fn reset(&mut self) {}

    /// Reads `input.frames()` frames and writes the same count to `output`.
    fn process(&mut self, input: &AudioBuffer, output: &mut AudioBuffer);

    fn latency_samples(&self) -> u32 {
        0
    }
}

/// What a stage runs.
pub enum StageProcessor {
    Builtin(Box<dyn BuiltinStage>),
    Hosted(InstanceId),
}

/// One slot of a track or master chain.
pub struct EffectStage {
    pub processor: StageProcessor,
    /// Bypassed stages pass the signal through untouched.
    pub bypass: bool,
    /// Wet amount in `[0, 1]`; `None` means fully wet.
    pub mix: Option<f32>,
}

impl EffectStage {
    pub fn builtin(stage: impl BuiltinStage + 'static) -> Self {
        Self {
            processor: StageProcessor::Builtin(Box::new(stage)),
            bypass: false,
            mix: None,
        }
    }

    pub fn hosted(instance: InstanceId) -> Self {
        Self {
            processor: StageProcessor::Hosted(instance),
            bypass: false,
            mix: None,
        }
    }

    pub fn bypassed(mut self, bypass: bool) -> Self {
        self.bypass = bypass;
        self
    }

    pub fn with_mix(mut self, mix: f32) -> Self {
        self.mix = Some(mix.clamp(0.0, 1.0));
        self
    }

    pub fn label(&self) -> String {
        match &self.processor {
            StageProcessor::Builtin(stage) => stage.name().to_owned(),
            StageProcessor::Hosted(instance) => instance.to_string(),
        }
    }
}

impl std::fmt::Debug for EffectStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EffectStage")
            .field("stage", &self.label())
            .field("bypass", &self.bypass)
            .field("mix", &self.mix)
            .finish()
    }
}

fn map_samples(input: &AudioBuffer, output: &mut AudioBuffer, mut f: impl FnMut(f32) -> f32) {
    let channels = input.channels().min(output.channels());
    for channel in 0..channels {
        let source = input.channel(channel);
        for (out, sample) in output.channel_mut(channel).iter_mut().zip(source) {
            *out = f(*sample);
        }
    }
}

#[derive(Debug, Clone)]
pub struct GainStage {
    linear: f32,
}

impl GainStage {
    pub fn from_db(db: f32) -> Self {
        Self {
            linear: db_to_linear(db),
        }
    }

    pub fn linear(linear: f32) -> Self {
        Self { linear }
    }
}

impl BuiltinStage for GainStage {
    fn name(&self) -> &str {
        "gain"
    }

    fn prepare(&mut self, _sample_rate: f64, _max_block: usize, _channels: usize) {}

    fn process(&mut self, input: &AudioBuffer, output: &mut AudioBuffer) {
        let gain = self.linear;
        map_samples(input, output, |sample| sample * gain);
    }
}

/// Rational tanh approximation; reaches ±1 at ±3.
#[inline]
pub fn soft_clip(sample: f32) -> f32 {
    let x = sample.clamp(-3.0, 3.0);
    let a = x.abs();
    (x * (27.0 + a * a)) / (27.0 + 9.0 * a * a)
}

#[derive(Debug, Clone)]
pub struct SoftClip {
    drive: f32,
}

impl SoftClip {
    pub fn new(drive: f32) -> Self {
        Self {
            drive: drive.max(0.0),
        }
    }
}

impl Default for SoftClip {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl BuiltinStage for SoftClip {
    fn name(&self) -> &str {
        "soft-clip"
    }

    fn prepare(&mut self, _sample_rate: f64, _max_block: usize, _channels: usize) {}

    fn process(&mut self, input: &AudioBuffer, output: &mut AudioBuffer) {
        let drive = self.drive;
        map_samples(input, output, |sample| soft_clip(sample * drive));
    }
}

fn time_to_coeff(ms: f32, sample_rate: f32) -> f32 {
    (-1.0 / ((ms.max(0.1) / 1_000.0) * sample_rate.max(1.0))).exp()
}

/// Brickwall peak limiter with instant attack and exponential release.
#[derive(Debug, Clone)]
pub struct Limiter {
    ceiling_db: f32,
    release_ms: f32,
    ceiling: f32,
    release_coeff: f32,
    gain: Vec<f32>,
}

impl Limiter {
    pub fn new(ceiling_db: f32, release_ms: f32) -> Self {
        Self {
            ceiling_db,
            release_ms,
            ceiling: db_to_linear(ceiling_db),
            release_coeff: time_to_coeff(release_ms, 48_000.0),
            gain: Vec::new(),
        }
    }

    pub fn ceiling_db(&self) -> f32 {
        self.ceiling_db
    }
}

impl Default for Limiter {
    fn default() -> Self {
        Self::new(-0.3, 80.0)
    }
}

impl BuiltinStage for Limiter {
    fn name(&self) -> &str {
        "limiter"
    }

    fn prepare(&mut self, sample_rate: f64, _max_block: usize, channels: usize) {
        self.release_coeff = time_to_coeff(self.release_ms, sample_rate as f32);
        self.gain = vec![1.0; channels];
    }

    fn reset(&mut self) {
        self.gain.fill(1.0);
    }

    fn process(&mut self, input: &AudioBuffer, output: &mut AudioBuffer) {
        let channels = input.channels().min(output.channels()).min(self.gain.len());
        for channel in 0..channels {
            let gain = &mut self.gain[channel];
            let source = input.channel(channel);
            for (out, sample) in output.channel_mut(channel).iter_mut().zip(source) {
                let abs = sample.abs();
                if abs * *gain > self.ceiling && abs > 1e-6 {
                    *gain = self.ceiling / abs;
                } else {
                    *gain += (1.0 - *gain) * (1.0 - self.release_coeff);
                    if abs * *gain > self.ceiling {
                        *gain = self.ceiling / abs;
                    }
                }
                *out = sample * *gain;
            }
        }
    }
}

/// First-order lowpass, 6 dB per octave.
#[derive(Debug, Clone)]
pub struct OnePoleLowpass {
    cutoff_hz: f32,
    coeff: f32,
    state: Vec<f32>,
}

impl OnePoleLowpass {
    pub fn new(cutoff_hz: f32) -> Self {
        Self {
            cutoff_hz,
            coeff: 1.0,
            state: Vec::new(),
        }
    }
}

impl BuiltinStage for OnePoleLowpass {
    fn name(&self) -> &str {
        "lowpass"
    }

    fn prepare(&mut self, sample_rate: f64, _max_block: usize, channels: usize) {
        let rate = sample_rate.max(1.0) as f32;
        let cutoff = self.cutoff_hz.clamp(1.0, rate * 0.49);
        self.coeff = 1.0 - (-std::f32::consts::TAU * cutoff / rate).exp();
        self.state = vec![0.0; channels];
    }

    fn reset(&mut self) {
        self.state.fill(0.0);
    }

    fn process(&mut self, input: &AudioBuffer, output: &mut AudioBuffer) {
        let channels = input.channels().min(output.channels()).min(self.state.len());
        for channel in 0..channels {
            let state = &mut self.state[channel];
            let source = input.channel(channel);
            for (out, sample) in output.channel_mut(channel).iter_mut().zip(source) {
                *state += (*sample - *state) * self.coeff;
                *out = *state;
            }
        }
    }
}

/// Fixed delay; reports the delay as latency.
#[derive(Debug, Clone)]
pub struct DelayLine {
    samples: usize,
    lines: Vec<Vec<f32>>,
    write: usize,
}

impl DelayLine {
    pub fn new(samples: usize) -> Self {
        Self {
            samples,
            lines: Vec::new(),
            write: 0,
        }
    }
}

impl BuiltinStage for DelayLine {
    fn name(&self) -> &str {
        "delay"
    }

    fn prepare(&mut self, _sample_rate: f64, _max_block: usize, channels: usize) {
        self.lines = vec![vec![0.0; self.samples.max(1)]; channels];
        self.write = 0;
    }

    fn reset(&mut self) {
        for line in &mut self.lines {
            line.fill(0.0);
        }
        self.write = 0;
    }

    fn process(&mut self, input: &AudioBuffer, output: &mut AudioBuffer) {
        if self.samples == 0 {
            map_samples(input, output, |sample| sample);
            return;
        }
        let frames = input.frames();
        let channels = input.channels().min(output.channels()).min(self.lines.len());
        for channel in 0..channels {
            let line = &mut self.lines[channel];
            let len = line.len();
            let mut position = self.write;
            let source = input.channel(channel);
            for (out, sample) in output.channel_mut(channel).iter_mut().zip(source) {
                *out = line[position];
                line[position] = *sample;
                position = (position + 1) % len;
            }
        }
        if let Some(len) = self.lines.first().map(Vec::len) {
            self.write = (self.write + frames) % len;
        }
    }

    fn latency_samples(&self) -> u32 {
        self.samples as u32
    }
}
