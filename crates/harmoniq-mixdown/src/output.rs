use std::fmt;

use harmoniq_plugin_host::InstanceId;
use serde::Serialize;

use crate::gain::GainPlan;
use crate::metrics::RenderMetrics;

/// Contiguous render artifact, stored channel after channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderedMix {
    sample_rate: f64,
    channels: usize,
    frames: usize,
    samples: Vec<f32>,
}

impl RenderedMix {
    pub fn silent(sample_rate: f64, channels: usize, frames: usize) -> Self {
        Self {
            sample_rate,
            channels,
            frames,
            samples: vec![0.0; channels * frames],
        }
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate > 0.0 {
            self.frames as f64 / self.sample_rate
        } else {
            0.0
        }
    }

    pub fn channel(&self, index: usize) -> &[f32] {
        &self.samples[index * self.frames..(index + 1) * self.frames]
    }

    pub(crate) fn channel_mut(&mut self, index: usize) -> &mut [f32] {
        &mut self.samples[index * self.frames..(index + 1) * self.frames]
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<f32> {
        self.samples
    }

    /// Frame-interleaved iterator, the layout most encoders expect.
    pub fn interleaved(&self) -> impl Iterator<Item = f32> + '_ {
        (0..self.frames).flat_map(move |frame| {
            (0..self.channels).map(move |channel| self.samples[channel * self.frames + frame])
        })
    }
}

/// Where in the mix a warning came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum StageLocation {
    Track { track: String, stage: usize },
    Master { stage: usize },
}

impl fmt::Display for StageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageLocation::Track { track, stage } => write!(f, "track {track} stage {stage}"),
            StageLocation::Master { stage } => write!(f, "master stage {stage}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum WarningKind {
    NonFinite,
    FrameMismatch { expected: usize, actual: usize },
    SampleRateUnsupported { active: f64, requested: f64 },
    StageFailed { reason: String },
    InstanceDegraded { instance: InstanceId },
}

/// Something the render recovered from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderWarning {
    pub location: StageLocation,
    pub label: String,
    /// Block index the problem surfaced in; `None` for problems found while
    /// preparing.
    pub block: Option<usize>,
    pub kind: WarningKind,
}

impl fmt::Display for RenderWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.location, self.label)?;
        if let Some(block) = self.block {
            write!(f, " block {block}")?;
        }
        match &self.kind {
            WarningKind::NonFinite => write!(f, ": non-finite output, stage isolated"),
            WarningKind::FrameMismatch { expected, actual } => write!(
                f,
                ": produced {actual} frames instead of {expected}, stage isolated"
            ),
            WarningKind::SampleRateUnsupported { active, requested } => write!(
                f,
                ": runs at {active} Hz, cannot render at {requested} Hz, bypassed"
            ),
            WarningKind::StageFailed { reason } => write!(f, ": {reason}, stage isolated"),
            WarningKind::InstanceDegraded { instance } => {
                write!(f, ": instance {instance} degraded")
            }
        }
    }
}

/// Everything a finished render hands back.
#[derive(Debug, Clone, Serialize)]
pub struct RenderOutput {
    pub mix: RenderedMix,
    pub metrics: RenderMetrics,
    pub warnings: Vec<RenderWarning>,
    pub gain: GainPlan,
}
