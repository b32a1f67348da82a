//! Offline mixdown for Harmoniq Studio.
//!
//! Tracks pull their material from a [`TrackSource`], run it through an
//! effect chain of built-in stages and hosted plugins, and are gain staged,
//! panned and summed block by block into a master bus. The master bus has
//! its own chain. The result is a [`RenderedMix`] plus [`RenderMetrics`].

mod chain;
mod error;
pub mod gain;
pub mod level;
pub mod metrics;
mod output;
mod render;
pub mod source;
pub mod stage;
mod track;

pub use chain::ChainProcessor;
pub use error::RenderError;
pub use gain::{CalibrationTier, GainCalibration, GainPlan, GainStaging, MasterGain, PanLaw};
pub use metrics::{MixMeter, RenderMetrics};
pub use output::{RenderOutput, RenderWarning, RenderedMix, StageLocation, WarningKind};
pub use render::{render_offline, CancelToken, OfflineRenderer, RenderOptions};
pub use source::{AudioClip, SineSource, TrackSource};
pub use stage::{
    BuiltinStage, DelayLine, EffectStage, GainStage, Limiter, OnePoleLowpass, SoftClip,
    StageProcessor,
};
pub use track::{active_tracks, Track, TrackEffects};

pub use harmoniq_plugin_host as host;
