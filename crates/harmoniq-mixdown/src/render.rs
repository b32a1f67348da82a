//! The offline render pipeline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use harmoniq_plugin_host::{AudioBuffer, InstanceManager};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::chain::ChainProcessor;
use crate::error::RenderError;
use crate::gain::{GainPlan, GainStaging, PanLaw};
use crate::level::{db_to_linear, SILENCE_THRESHOLD};
use crate::metrics::{MixMeter, RenderMetrics};
use crate::output::{RenderOutput, RenderedMix};
use crate::source::TrackSource;
use crate::track::{active_tracks, Track, TrackEffects};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderOptions {
    pub sample_rate: f64,
    /// Frames per block; fixed for the whole render.
    pub block_size: usize,
    pub channels: usize,
    pub duration_seconds: f64,
    /// Requests above this fail before anything is allocated.
    pub max_duration_seconds: f64,
    pub gain_staging: GainStaging,
    pub pan_law: PanLaw,
    /// Render the tracks of each block on the rayon pool.
    pub parallel: bool,
    /// Shortest run of silent blocks, under active input, reported as a
    /// dropout.
    pub dropout_window_blocks: usize,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            sample_rate: 48_000.0,
            block_size: 512,
            channels: 2,
            duration_seconds: 10.0,
            max_duration_seconds: 3_600.0,
            gain_staging: GainStaging::default(),
            pan_law: PanLaw::default(),
            parallel: true,
            dropout_window_blocks: 1,
        }
    }
}

impl RenderOptions {
    pub fn with_duration(mut self, seconds: f64) -> Self {
        self.duration_seconds = seconds;
        self
    }

    pub fn with_sample_rate(mut self, sample_rate: f64) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_gain_staging(mut self, gain_staging: GainStaging) -> Self {
        self.gain_staging = gain_staging;
        self
    }

    /// Checks the options and returns the number of frames to render.
    pub fn validate(&self) -> Result<usize, RenderError> {
        if !(self.sample_rate.is_finite() && self.sample_rate > 0.0) {
            return Err(RenderError::InvalidOptions("sample rate must be positive"));
        }
        if self.block_size == 0 {
            return Err(RenderError::InvalidOptions(
                "block size must be at least one frame",
            ));
        }
        if self.channels == 0 {
            return Err(RenderError::InvalidOptions(
                "at least one output channel is required",
            ));
        }
        if !self.duration_seconds.is_finite() || self.duration_seconds < 0.0 {
            return Err(RenderError::InvalidOptions(
                "duration must be a non-negative number of seconds",
            ));
        }
        if self.max_duration_seconds.is_nan() {
            return Err(RenderError::InvalidOptions("maximum duration is not a number"));
        }
        if self.duration_seconds > self.max_duration_seconds {
            return Err(RenderError::DurationExceeded {
                requested: self.duration_seconds,
                max: self.max_duration_seconds,
            });
        }
        Ok((self.duration_seconds * self.sample_rate).round() as usize)
    }
}

/// Shared cancellation flag, checked between blocks.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

struct TrackRuntime<'a> {
    source: Arc<dyn TrackSource>,
    chain: ChainProcessor<'a>,
    buffer: AudioBuffer,
    gain: f32,
    pan: (f32, f32),
    input_active: bool,
}

impl TrackRuntime<'_> {
    fn render_block(&mut self, start: usize, frames: usize, sample_rate: f64, block: usize) {
        self.buffer.set_frames(frames);
        self.buffer.clear();
        self.source.render(start, sample_rate, &mut self.buffer);
        if self.source.channels() == 1 {
            let mut channels = self.buffer.channel_slices_mut();
            if let Some(first) = channels.next() {
                for other in channels {
                    other.copy_from_slice(first);
                }
            }
        }
        self.input_active = self.buffer.peak() >= SILENCE_THRESHOLD;

        self.chain.process(&mut self.buffer, block);

        let (left, right) = self.pan;
        for (channel, samples) in self.buffer.channel_slices_mut().enumerate() {
            let gain = self.gain
                * match channel {
                    0 => left,
                    1 => right,
                    _ => 1.0,
                };
            for sample in samples {
                *sample *= gain;
            }
        }
    }
}

/// Renders a set of tracks into one mixed buffer.
///
/// Given the same tracks, parameter values and chain order a render always
/// produces the same samples: every stage is reset before the first block
/// and tracks are summed in order whatever thread rendered them.
pub struct OfflineRenderer<'h> {
    host: Option<&'h InstanceManager>,
    options: RenderOptions,
    cancel: CancelToken,
}

impl<'h> OfflineRenderer<'h> {
    pub fn new(options: RenderOptions) -> Self {
        Self {
            host: None,
            options,
            cancel: CancelToken::new(),
        }
    }

    /// Needed as soon as any track uses hosted plugins.
    pub fn with_host(mut self, host: &'h InstanceManager) -> Self {
        self.host = Some(host);
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn options(&self) -> &RenderOptions {
        &self.options
    }

    pub fn render(
        &self,
        tracks: &mut [Track],
        master: &mut TrackEffects,
    ) -> Result<RenderOutput, RenderError> {
        let options = &self.options;
        let total_frames = options.validate()?;
        let sample_rate = options.sample_rate;
        let block_size = options.block_size;
        let channels = options.channels;

        let active = active_tracks(tracks);
        if active.is_empty() {
            tracing::info!("no active tracks, rendering {total_frames} frames of silence");
            return Ok(RenderOutput {
                mix: RenderedMix::silent(sample_rate, channels, total_frames),
                metrics: RenderMetrics::empty(),
                warnings: Vec::new(),
                gain: GainPlan::unity(),
            });
        }

        let plan = options.gain_staging.plan(active.len());
        tracing::debug!(
            "gain staging for {} tracks: per track {:.4}, master {:.4}",
            active.len(),
            plan.per_track,
            plan.master
        );

        let mut runtimes = Vec::with_capacity(active.len());
        for (index, track) in tracks.iter_mut().enumerate() {
            if active.binary_search(&index).is_err() {
                continue;
            }
            let Track {
                id,
                source,
                effects,
                gain_db,
                pan,
                ..
            } = track;
            let mut chain = ChainProcessor::for_track(id.clone(), effects, self.host)?;
            chain.prepare(sample_rate, block_size, channels);
            let pan = if channels >= 2 {
                options.pan_law.gains(*pan)
            } else {
                (1.0, 1.0)
            };
            runtimes.push(TrackRuntime {
                source: Arc::clone(source),
                chain,
                buffer: AudioBuffer::new(channels, block_size),
                gain: plan.per_track * db_to_linear(*gain_db),
                pan,
                input_active: false,
            });
        }
        let mut master_chain = ChainProcessor::for_master(master, self.host)?;
        master_chain.prepare(sample_rate, block_size, channels);

        let blocks = total_frames.div_ceil(block_size);
        let mut mix = RenderedMix::silent(sample_rate, channels, total_frames);
        let mut bus = AudioBuffer::new(channels, block_size);
        let mut meter = MixMeter::new(sample_rate, options.dropout_window_blocks)
            .with_capacity(total_frames, block_size);
        let started = Instant::now();

        for block in 0..blocks {
            if self.cancel.is_cancelled() {
                // Leases stop processing as they drop; instances stay loaded.
                drop(runtimes);
                drop(master_chain);
                self.refresh_chain_latencies(tracks, master);
                let frames_rendered = block * block_size;
                let metrics = meter.finish();
                tracing::info!("render cancelled after {block} of {blocks} blocks");
                return Err(RenderError::Cancelled {
                    frames_rendered,
                    metrics: Box::new(metrics),
                });
            }

            let start = block * block_size;
            let frames = block_size.min(total_frames - start);
            if options.parallel {
                runtimes
                    .par_iter_mut()
                    .for_each(|track| track.render_block(start, frames, sample_rate, block));
            } else {
                runtimes
                    .iter_mut()
                    .for_each(|track| track.render_block(start, frames, sample_rate, block));
            }

            bus.set_frames(frames);
            bus.clear();
            let mut active_input = false;
            for track in &runtimes {
                active_input |= track.input_active;
                for (sum, samples) in bus.channel_slices_mut().zip(track.buffer.channel_slices()) {
                    for (out, sample) in sum.iter_mut().zip(samples) {
                        *out += *sample;
                    }
                }
            }

            bus.apply_gain(plan.master);
            master_chain.process(&mut bus, block);
            meter.push_block(&bus, active_input);

            for channel in 0..channels {
                mix.channel_mut(channel)[start..start + frames].copy_from_slice(bus.channel(channel));
            }
        }

        let mut warnings = Vec::new();
        for track in &mut runtimes {
            warnings.extend(track.chain.take_warnings());
        }
        warnings.extend(master_chain.take_warnings());
        drop(runtimes);
        drop(master_chain);
        self.refresh_chain_latencies(tracks, master);

        let metrics = meter.finish();
        tracing::info!(
            "rendered {total_frames} frames in {:.1} ms: rms {:.1} dBFS, peak {:.1} dBFS, {} warnings",
            started.elapsed().as_secs_f64() * 1_000.0,
            metrics.rms_db,
            metrics.peak_db,
            warnings.len()
        );
        Ok(RenderOutput {
            mix,
            metrics,
            warnings,
            gain: plan,
        })
    }

    /// Re-reads the latency of every hosted chain once the leases are gone,
    /// so parameter changes applied during the render show up in the
    /// host's chain totals.
    fn refresh_chain_latencies(&self, tracks: &[Track], master: &TrackEffects) {
        let Some(host) = self.host else {
            return;
        };
        let chains = tracks
            .iter()
            .map(|track| &track.effects)
            .chain(std::iter::once(master))
            .filter_map(|effects| match effects {
                TrackEffects::Chain(chain) => Some(*chain),
                _ => None,
            });
        for chain in chains {
            if let Err(err) = host.refresh_chain_metrics(chain) {
                tracing::warn!("could not refresh latency of chain {chain}: {err}");
            }
        }
    }
}

/// Renders `tracks` with built-in stages only and no master chain.
pub fn render_offline(
    tracks: &mut [Track],
    options: &RenderOptions,
) -> Result<RenderOutput, RenderError> {
    OfflineRenderer::new(options.clone()).render(tracks, &mut TrackEffects::None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SineSource;

    #[test]
    fn duration_cap_fails_before_rendering() {
        let options = RenderOptions {
            duration_seconds: 120.0,
            max_duration_seconds: 60.0,
            ..RenderOptions::default()
        };
        let mut tracks = vec![Track::new("a", SineSource::new(440.0, 0.5))];
        let err = render_offline(&mut tracks, &options).unwrap_err();
        assert!(matches!(
            err,
            RenderError::DurationExceeded { requested, max } if requested == 120.0 && max == 60.0
        ));
    }

    #[test]
    fn invalid_options_are_rejected() {
        let zero_block = RenderOptions::default().with_block_size(0);
        assert!(matches!(
            zero_block.validate(),
            Err(RenderError::InvalidOptions(_))
        ));
        let negative = RenderOptions::default().with_duration(-1.0);
        assert!(matches!(negative.validate(), Err(RenderError::InvalidOptions(_))));
        assert_eq!(
            RenderOptions::default().with_duration(0.5).validate().unwrap(),
            24_000
        );
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let options: RenderOptions =
            serde_json::from_str(r#"{ "sample_rate": 44100.0, "gain_staging": "unity" }"#).unwrap();
        assert_eq!(options.sample_rate, 44_100.0);
        assert_eq!(options.gain_staging, GainStaging::Unity);
        assert_eq!(options.block_size, 512);
    }

    #[test]
    fn last_block_may_be_short() {
        let options = RenderOptions::default()
            .with_duration(0.01)
            .with_block_size(128)
            .with_gain_staging(GainStaging::Unity);
        let mut tracks = vec![Track::new("a", SineSource::new(1_000.0, 0.5))];
        let output = render_offline(&mut tracks, &options).unwrap();
        assert_eq!(output.mix.frames(), 480);
        assert!(output.mix.channel(1)[479] != 0.0);
    }

    #[test]
    fn serial_and_parallel_renders_match() {
        let build = || {
            (1..=4)
                .map(|i| Track::new(format!("t{i}"), SineSource::new(110.0 * i as f64, 0.2)))
                .collect::<Vec<_>>()
        };
        let options = RenderOptions::default().with_duration(0.2);
        let parallel = render_offline(&mut build(), &options).unwrap();
        let serial = render_offline(
            &mut build(),
            &RenderOptions {
                parallel: false,
                ..options.clone()
            },
        )
        .unwrap();
        assert_eq!(parallel.mix, serial.mix);
    }
}
