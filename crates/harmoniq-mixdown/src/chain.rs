//! Runs an ordered list of stages over one signal, block by block.

use harmoniq_plugin_host::{
    AudioBuffer, HostError, InstanceId, InstanceLease, InstanceManager, ProcessingAnomaly,
};

use crate::error::RenderError;
use crate::output::{RenderWarning, StageLocation, WarningKind};
use crate::stage::{BuiltinStage, StageProcessor};
use crate::track::TrackEffects;

enum RuntimeProcessor<'a> {
    Builtin(&'a mut dyn BuiltinStage),
    Hosted(InstanceLease),
}

struct RuntimeStage<'a> {
    processor: RuntimeProcessor<'a>,
    bypass: bool,
    mix: Option<f32>,
    /// Set once the stage misbehaves; it stays out of the signal path for
    /// the rest of the render.
    isolated: bool,
    label: String,
}

impl RuntimeStage<'_> {
    fn latency(&self) -> u32 {
        match &self.processor {
            RuntimeProcessor::Builtin(stage) => stage.latency_samples(),
            RuntimeProcessor::Hosted(lease) => lease.latency(),
        }
    }
}

/// The render-time form of a [`TrackEffects`].
///
/// Hosted stages hold an [`InstanceLease`] for as long as the processor
/// lives, so no other render can drive the same instances meanwhile.
/// Dropping the processor stops processing on every leased instance and
/// leaves them `Active`.
pub struct ChainProcessor<'a> {
    track: Option<String>,
    stages: Vec<RuntimeStage<'a>>,
    scratch: AudioBuffer,
    warnings: Vec<RenderWarning>,
}

impl<'a> ChainProcessor<'a> {
    pub fn for_track(
        track: impl Into<String>,
        effects: &'a mut TrackEffects,
        host: Option<&InstanceManager>,
    ) -> Result<Self, RenderError> {
        Self::build(Some(track.into()), effects, host)
    }

    pub fn for_master(
        effects: &'a mut TrackEffects,
        host: Option<&InstanceManager>,
    ) -> Result<Self, RenderError> {
        Self::build(None, effects, host)
    }

    fn build(
        track: Option<String>,
        effects: &'a mut TrackEffects,
        host: Option<&InstanceManager>,
    ) -> Result<Self, RenderError> {
        let host = match host {
            Some(host) => Some(host),
            None if effects.needs_host() => {
                return Err(RenderError::NoHost {
                    track: track.unwrap_or_else(|| "master".to_owned()),
                })
            }
            None => None,
        };

        let mut stages = Vec::new();
        match effects {
            TrackEffects::None => {}
            TrackEffects::Chain(chain) => {
                if let Some(host) = host {
                    let snapshot = host.refresh_chain_metrics(*chain)?;
                    for instance in snapshot.instances() {
                        stages.push(hosted_stage(host, *instance, false, None)?);
                    }
                }
            }
            TrackEffects::Stages(list) => {
                for stage in list.iter_mut() {
                    let (bypass, mix) = (stage.bypass, stage.mix);
                    match &mut stage.processor {
                        StageProcessor::Builtin(builtin) => {
                            let label = builtin.name().to_owned();
                            stages.push(RuntimeStage {
                                processor: RuntimeProcessor::Builtin(builtin.as_mut()),
                                bypass,
                                mix,
                                isolated: false,
                                label,
                            });
                        }
                        StageProcessor::Hosted(instance) => {
                            if let Some(host) = host {
                                stages.push(hosted_stage(host, *instance, bypass, mix)?);
                            }
                        }
                    }
                }
            }
        }

        Ok(Self {
            track,
            stages,
            scratch: AudioBuffer::default(),
            warnings: Vec::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Sum of the latencies of the stages still in the signal path.
    pub fn latency_samples(&self) -> u32 {
        self.stages
            .iter()
            .filter(|stage| !stage.bypass && !stage.isolated)
            .map(RuntimeStage::latency)
            .sum()
    }

    /// Sizes the scratch buffer and readies every stage for a render.
    ///
    /// A hosted stage that cannot run at `sample_rate` is bypassed with a
    /// warning rather than failing the render.
    pub fn prepare(&mut self, sample_rate: f64, max_block: usize, channels: usize) {
        self.scratch = AudioBuffer::new(channels, max_block);
        self.warnings.reserve(self.stages.len() * 2);
        for index in 0..self.stages.len() {
            let stage = &mut self.stages[index];
            if stage.bypass {
                continue;
            }
            let failure = match &mut stage.processor {
                RuntimeProcessor::Builtin(builtin) => {
                    builtin.prepare(sample_rate, max_block, channels);
                    builtin.reset();
                    None
                }
                RuntimeProcessor::Hosted(lease) => lease.prepare(sample_rate, max_block).err(),
            };
            if let Some(err) = failure {
                let kind = match err {
                    HostError::SampleRateUnsupported { active, requested } => {
                        WarningKind::SampleRateUnsupported { active, requested }
                    }
                    other => WarningKind::StageFailed {
                        reason: other.to_string(),
                    },
                };
                stage.isolated = true;
                let warning = RenderWarning {
                    location: self.location(index),
                    label: self.stages[index].label.clone(),
                    block: None,
                    kind,
                };
                tracing::warn!("{warning}");
                self.warnings.push(warning);
            }
        }
    }

    /// Runs `signal` through every live stage in order, in place.
    ///
    /// A stage whose output is unusable leaves `signal` as it was before
    /// that stage and is isolated for the rest of the render.
    pub fn process(&mut self, signal: &mut AudioBuffer, block: usize) {
        let frames = signal.frames();
        for index in 0..self.stages.len() {
            let stage = &mut self.stages[index];
            if stage.bypass || stage.isolated {
                continue;
            }
            self.scratch.set_frames(frames);
            let result = match &mut stage.processor {
                RuntimeProcessor::Builtin(builtin) => {
                    builtin.process(signal, &mut self.scratch);
                    validate(&self.scratch, frames)
                }
                RuntimeProcessor::Hosted(lease) => lease.process(signal, &mut self.scratch, frames),
            };
            match result {
                Ok(()) => {
                    if let Some(mix) = stage.mix {
                        self.scratch.mix_with_dry(signal, mix);
                    }
                    std::mem::swap(signal, &mut self.scratch);
                }
                Err(anomaly) => self.isolate(index, block, anomaly),
            }
        }
    }

    pub fn warnings(&self) -> &[RenderWarning] {
        &self.warnings
    }

    pub fn take_warnings(&mut self) -> Vec<RenderWarning> {
        std::mem::take(&mut self.warnings)
    }

    fn location(&self, stage: usize) -> StageLocation {
        match &self.track {
            Some(track) => StageLocation::Track {
                track: track.clone(),
                stage,
            },
            None => StageLocation::Master { stage },
        }
    }

    // Off the steady-state path: only runs once per misbehaving stage.
    fn isolate(&mut self, index: usize, block: usize, anomaly: ProcessingAnomaly) {
        let kind = match anomaly {
            ProcessingAnomaly::NonFinite => WarningKind::NonFinite,
            ProcessingAnomaly::FrameMismatch { expected, actual } => {
                WarningKind::FrameMismatch { expected, actual }
            }
            ProcessingAnomaly::Failed => WarningKind::StageFailed {
                reason: "processing failed".to_owned(),
            },
            ProcessingAnomaly::Contended => WarningKind::StageFailed {
                reason: "instance locked by another caller".to_owned(),
            },
        };
        let location = self.location(index);
        let stage = &mut self.stages[index];
        stage.isolated = true;
        let warning = RenderWarning {
            location: location.clone(),
            label: stage.label.clone(),
            block: Some(block),
            kind,
        };
        tracing::warn!("{warning}");
        self.warnings.push(warning);

        if let RuntimeProcessor::Hosted(lease) = &stage.processor {
            lease.mark_degraded();
            self.warnings.push(RenderWarning {
                location,
                label: stage.label.clone(),
                block: Some(block),
                kind: WarningKind::InstanceDegraded {
                    instance: lease.id(),
                },
            });
        }
    }
}

fn hosted_stage<'a>(
    host: &InstanceManager,
    instance: InstanceId,
    bypass: bool,
    mix: Option<f32>,
) -> Result<RuntimeStage<'a>, RenderError> {
    let lease = host.acquire_render_lease(instance)?;
    let label = format!("{} ({instance})", lease.descriptor().name);
    Ok(RuntimeStage {
        processor: RuntimeProcessor::Hosted(lease),
        bypass,
        mix,
        isolated: false,
        label,
    })
}

fn validate(output: &AudioBuffer, frames: usize) -> Result<(), ProcessingAnomaly> {
    if output.frames() != frames {
        return Err(ProcessingAnomaly::FrameMismatch {
            expected: frames,
            actual: output.frames(),
        });
    }
    if !output.is_finite() {
        return Err(ProcessingAnomaly::NonFinite);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{EffectStage, GainStage, SoftClip};

    struct Poison {
        after: usize,
        calls: usize,
    }

    impl BuiltinStage for Poison {
        fn name(&self) -> &str {
            "poison"
        }

        fn prepare(&mut self, _sample_rate: f64, _max_block: usize, _channels: usize) {}

        fn reset(&mut self) {
            self.calls = 0;
        }

        fn process(&mut self, input: &AudioBuffer, output: &mut AudioBuffer) {
            self.calls += 1;
            let poisoned = self.calls > self.after;
            for channel in 0..input.channels() {
                let source = input.channel(channel);
                for (out, sample) in output.channel_mut(channel).iter_mut().zip(source) {
                    *out = if poisoned { f32::NAN } else { *sample };
                }
            }
        }
    }

    fn block(value: f32) -> AudioBuffer {
        AudioBuffer::from_channels(vec![vec![value; 8], vec![value; 8]])
    }

    #[test]
    fn empty_chain_passes_the_signal_through() {
        let mut effects = TrackEffects::None;
        let mut chain = ChainProcessor::for_track("t", &mut effects, None).unwrap();
        chain.prepare(48_000.0, 8, 2);
        let mut signal = block(0.25);
        chain.process(&mut signal, 0);
        assert_eq!(signal.channel(1), &[0.25; 8]);
        assert_eq!(chain.latency_samples(), 0);
    }

    #[test]
    fn bypass_and_mix_are_honoured() {
        let mut effects = TrackEffects::stages([
            EffectStage::builtin(GainStage::linear(4.0)).bypassed(true),
            EffectStage::builtin(GainStage::linear(3.0)).with_mix(0.5),
        ]);
        let mut chain = ChainProcessor::for_track("t", &mut effects, None).unwrap();
        chain.prepare(48_000.0, 8, 2);
        let mut signal = block(0.1);
        chain.process(&mut signal, 0);
        // 0.1 dry blended half-and-half with 0.3 wet.
        assert!(signal.channel(0).iter().all(|s| (s - 0.2).abs() < 1e-6));
    }

    #[test]
    fn non_finite_stage_is_isolated_and_keeps_the_dry_signal() {
        let mut effects = TrackEffects::stages([
            EffectStage::builtin(GainStage::linear(0.5)),
            EffectStage::builtin(Poison { after: 1, calls: 0 }),
            EffectStage::builtin(SoftClip::new(1.0)),
        ]);
        let mut chain = ChainProcessor::for_track("bass", &mut effects, None).unwrap();
        chain.prepare(48_000.0, 8, 2);
        for index in 0..3 {
            let mut signal = block(0.2);
            chain.process(&mut signal, index);
            assert!(signal.is_finite());
            let expected = crate::stage::soft_clip(0.1);
            assert!((signal.channel(0)[0] - expected).abs() < 1e-6);
        }
        let warnings = chain.warnings();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].kind, WarningKind::NonFinite);
        assert_eq!(warnings[0].block, Some(1));
        assert_eq!(
            warnings[0].location,
            StageLocation::Track {
                track: "bass".into(),
                stage: 1
            }
        );
    }

    #[test]
    fn hosted_stages_without_a_host_are_rejected() {
        let mut effects = TrackEffects::stages([EffectStage::hosted(InstanceId::from_raw(7))]);
        let err = ChainProcessor::for_master(&mut effects, None)
            .err()
            .expect("needs a host");
        assert!(matches!(err, RenderError::NoHost { track } if track == "master"));
    }
}
