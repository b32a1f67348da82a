use std::f64::consts::TAU;

use harmoniq_plugin_host::AudioBuffer;

/// Audio material feeding a track, supplied by whatever owns clips and
/// patterns.
///
/// Rendering is random access by frame so a source never carries playback
/// state between blocks, which keeps renders repeatable.
pub trait TrackSource: Send + Sync {
    fn channels(&self) -> usize;

    /// Writes `output.frames()` frames starting at `start_frame` into the
    /// first [`channels`](Self::channels) channels of `output`.
    fn render(&self, start_frame: usize, sample_rate: f64, output: &mut AudioBuffer);
}

/// Pre-rendered sample data. Frames past the end are silence.
#[derive(Debug, Clone)]
pub struct AudioClip {
    sample_rate: f64,
    channels: Vec<Vec<f32>>,
}

impl AudioClip {
    pub fn new(sample_rate: f64, channels: Vec<Vec<f32>>) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    pub fn mono(sample_rate: f64, samples: Vec<f32>) -> Self {
        Self::new(sample_rate, vec![samples])
    }

    pub fn frames(&self) -> usize {
        self.channels.iter().map(Vec::len).min().unwrap_or(0)
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    fn sample(&self, channel: usize, position: f64) -> f32 {
        let data = &self.channels[channel];
        let index = position.floor();
        if index < 0.0 {
            return 0.0;
        }
        let index = index as usize;
        let Some(current) = data.get(index) else {
            return 0.0;
        };
        let next = data.get(index + 1).copied().unwrap_or(0.0);
        let frac = (position - index as f64) as f32;
        current + (next - current) * frac
    }
}

impl TrackSource for AudioClip {
    fn channels(&self) -> usize {
        self.channels.len()
    }

    fn render(&self, start_frame: usize, sample_rate: f64, output: &mut AudioBuffer) {
        let frames = output.frames();
        let step = if sample_rate > 0.0 {
            self.sample_rate / sample_rate
        } else {
            1.0
        };
        let channels = self.channels.len().min(output.channels());
        for channel in 0..channels {
            let target = output.channel_mut(channel);
            if step == 1.0 {
                let source = &self.channels[channel];
                let available = source.len().saturating_sub(start_frame).min(frames);
                if available > 0 {
                    target[..available]
                        .copy_from_slice(&source[start_frame..start_frame + available]);
                }
                target[available..].fill(0.0);
            } else {
                for (offset, sample) in target.iter_mut().enumerate() {
                    *sample = self.sample(channel, (start_frame + offset) as f64 * step);
                }
            }
        }
    }
}

/// Mono sine oscillator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SineSource {
    pub frequency: f64,
    pub amplitude: f32,
    pub phase: f64,
}

impl SineSource {
    pub fn new(frequency: f64, amplitude: f32) -> Self {
        Self {
            frequency,
            amplitude,
            phase: 0.0,
        }
    }

    pub fn with_phase(mut self, phase: f64) -> Self {
        self.phase = phase;
        self
    }
}

impl TrackSource for SineSource {
    fn channels(&self) -> usize {
        1
    }

    fn render(&self, start_frame: usize, sample_rate: f64, output: &mut AudioBuffer) {
        if output.channels() == 0 {
            return;
        }
        let increment = TAU * self.frequency / sample_rate.max(1.0);
        for (offset, sample) in output.channel_mut(0).iter_mut().enumerate() {
            let phase = self.phase + increment * (start_frame + offset) as f64;
            *sample = self.amplitude * phase.sin() as f32;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip_pads_with_silence_past_its_end() {
        let clip = AudioClip::mono(48_000.0, vec![1.0, 2.0, 3.0]);
        let mut buffer = AudioBuffer::new(1, 4);
        clip.render(1, 48_000.0, &mut buffer);
        assert_eq!(buffer.channel(0), &[2.0, 3.0, 0.0, 0.0]);
    }

    #[test]
    fn clip_resamples_linearly() {
        let clip = AudioClip::mono(24_000.0, vec![0.0, 1.0, 0.0]);
        let mut buffer = AudioBuffer::new(1, 4);
        clip.render(0, 48_000.0, &mut buffer);
        assert_eq!(buffer.channel(0), &[0.0, 0.5, 1.0, 0.5]);
    }

    #[test]
    fn sine_is_continuous_across_blocks() {
        let sine = SineSource::new(1_000.0, 1.0);
        let mut whole = AudioBuffer::new(1, 64);
        sine.render(0, 48_000.0, &mut whole);
        let mut tail = AudioBuffer::new(1, 32);
        sine.render(32, 48_000.0, &mut tail);
        assert_eq!(&whole.channel(0)[32..], tail.channel(0));
    }
}
