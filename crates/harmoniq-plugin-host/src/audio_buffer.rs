use std::ops::{Index, IndexMut};

/// Planar audio buffer shared by bindings, chains and the render pipeline.
///
/// Storage is allocated up front; `set_frames` only moves the logical length
/// within the allocated capacity so block loops never reallocate.
#[derive(Clone, Debug, Default)]
pub struct AudioBuffer {
    channels: Vec<Vec<f32>>,
    frames: usize,
}

impl AudioBuffer {
    /// Creates a buffer with the provided number of channels and frames,
    /// initialised to silence.
    pub fn new(channels: usize, frames: usize) -> Self {
        Self {
            channels: (0..channels).map(|_| vec![0.0; frames]).collect(),
            frames,
        }
    }

    pub fn from_channels(channels: Vec<Vec<f32>>) -> Self {
        let frames = channels.iter().map(Vec::len).min().unwrap_or(0);
        Self { channels, frames }
    }

    pub fn channels(&self) -> usize {
        self.channels.len()
    }

    /// Logical number of frames in the current block.
    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn capacity(&self) -> usize {
        self.channels.iter().map(Vec::len).min().unwrap_or(0)
    }

    /// Sets the logical block length, clamped to the allocated capacity.
    pub fn set_frames(&mut self, frames: usize) {
        self.frames = frames.min(self.capacity());
    }

    pub fn clear(&mut self) {
        for channel in &mut self.channels {
            channel.fill(0.0);
        }
    }

    /// Resizes the allocation. Not for use inside a block loop.
    pub fn resize(&mut self, channels: usize, frames: usize) {
        if self.channels.len() != channels {
            self.channels.resize_with(channels, Vec::new);
        }
        for channel in &mut self.channels {
            channel.resize(frames, 0.0);
        }
        self.frames = frames;
    }

    pub fn channel(&self, index: usize) -> &[f32] {
        &self.channels[index][..self.frames]
    }

    pub fn channel_mut(&mut self, index: usize) -> &mut [f32] {
        let frames = self.frames;
        &mut self.channels[index][..frames]
    }

    pub fn channel_slices(&self) -> impl Iterator<Item = &[f32]> {
        let frames = self.frames;
        self.channels.iter().map(move |channel| &channel[..frames])
    }

    pub fn channel_slices_mut(&mut self) -> impl Iterator<Item = &mut [f32]> {
        let frames = self.frames;
        self.channels
            .iter_mut()
            .map(move |channel| &mut channel[..frames])
    }

    /// Copies the current block of `other`; channel counts must match and
    /// the logical length follows `other`.
    pub fn copy_from(&mut self, other: &AudioBuffer) {
        debug_assert_eq!(self.channels.len(), other.channels.len());
        self.set_frames(other.frames);
        let frames = self.frames;
        for (dst, src) in self.channels.iter_mut().zip(other.channels.iter()) {
            dst[..frames].copy_from_slice(&src[..frames]);
        }
    }

    pub fn apply_gain(&mut self, gain: f32) {
        for channel in self.channel_slices_mut() {
            for sample in channel {
                *sample *= gain;
            }
        }
    }

    /// `self = dry * (1 - mix) + self * mix`, block lengths must match.
    pub fn mix_with_dry(&mut self, dry: &AudioBuffer, mix: f32) {
        let mix = mix.clamp(0.0, 1.0);
        let frames = self.frames.min(dry.frames);
        for (wet, dry) in self.channels.iter_mut().zip(dry.channels.iter()) {
            for (w, d) in wet[..frames].iter_mut().zip(&dry[..frames]) {
                *w = *d + (*w - *d) * mix;
            }
        }
    }

    pub fn is_finite(&self) -> bool {
        self.channel_slices()
            .all(|channel| channel.iter().all(|sample| sample.is_finite()))
    }

    pub fn peak(&self) -> f32 {
        self.channel_slices()
            .flat_map(|channel| channel.iter())
            .fold(0.0f32, |peak, sample| peak.max(sample.abs()))
    }
}

impl Index<usize> for AudioBuffer {
    type Output = [f32];

    fn index(&self, index: usize) -> &Self::Output {
        self.channel(index)
    }
}

impl IndexMut<usize> for AudioBuffer {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        self.channel_mut(index)
    }
}
