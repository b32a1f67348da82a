use harmoniq_plugin_host::HostError;
use thiserror::Error;

use crate::metrics::RenderMetrics;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("requested duration of {requested:.2}s exceeds the {max:.2}s render limit")]
    DurationExceeded { requested: f64, max: f64 },
    #[error("invalid render options: {0}")]
    InvalidOptions(&'static str),
    #[error("invalid gain calibration: {0}")]
    Calibration(String),
    #[error("track {track} uses hosted plugins but the renderer has no plugin host")]
    NoHost { track: String },
    #[error(transparent)]
    Host(#[from] HostError),
    /// The partial buffer was discarded; `metrics` describe what had been
    /// rendered up to the cancellation point.
    #[error("render cancelled after {frames_rendered} frames")]
    Cancelled {
        frames_rendered: usize,
        metrics: Box<RenderMetrics>,
    },
}
