//! Gain staging for the summing bus.
//!
//! Independent, equally loud tracks add in power, so the bus RMS grows with
//! `sqrt(N)`. Each tier of a [`GainCalibration`] names a target RMS and a
//! master gain, and the per-track gain is derived so that N tracks land on
//! the target:
//!
//! ```text
//! per_track = target_linear / (sqrt(N) * master)
//! ```
//!
//! The default tiers are empirically tuned for equal-loudness material.
//! Correlated or unevenly balanced mixes need their own calibration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::RenderError;
use crate::level::db_to_linear;

/// How a tier picks the master gain.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MasterGain {
    Fixed { gain: f32 },
    /// `base / sqrt(N)`.
    InverseSqrt { base: f32 },
}

impl MasterGain {
    fn resolve(self, tracks: usize) -> f32 {
        match self {
            MasterGain::Fixed { gain } => gain,
            MasterGain::InverseSqrt { base } => base / (tracks.max(1) as f32).sqrt(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationTier {
    /// Largest active track count this tier covers; `None` covers the rest.
    pub max_tracks: Option<usize>,
    pub target_rms_db: f32,
    pub master: MasterGain,
}

/// Ordered calibration tiers; the first tier whose `max_tracks` covers the
/// active track count wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GainCalibration {
    pub tiers: Vec<CalibrationTier>,
}

impl Default for GainCalibration {
    fn default() -> Self {
        Self {
            tiers: vec![
                CalibrationTier {
                    max_tracks: Some(1),
                    target_rms_db: -22.0,
                    master: MasterGain::Fixed { gain: 0.5 },
                },
                CalibrationTier {
                    max_tracks: Some(3),
                    target_rms_db: -16.0,
                    master: MasterGain::Fixed { gain: 0.8 },
                },
                CalibrationTier {
                    max_tracks: None,
                    target_rms_db: -16.0,
                    master: MasterGain::InverseSqrt { base: 0.8 },
                },
            ],
        }
    }
}

impl GainCalibration {
    pub fn from_json(text: &str) -> Result<Self, RenderError> {
        serde_json::from_str(text).map_err(|err| RenderError::Calibration(err.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, RenderError> {
        let text = std::fs::read_to_string(path)
            .map_err(|err| RenderError::Calibration(format!("{}: {err}", path.display())))?;
        Self::from_json(&text)
    }

    pub fn tier(&self, tracks: usize) -> Option<&CalibrationTier> {
        self.tiers
            .iter()
            .find(|tier| tier.max_tracks.map_or(true, |max| tracks <= max))
    }

    /// Gains for `tracks` active tracks. Falls back to unity when no tier
    /// matches.
    pub fn plan(&self, tracks: usize) -> GainPlan {
        if tracks == 0 {
            return GainPlan::unity();
        }
        let Some(tier) = self.tier(tracks) else {
            return GainPlan::unity();
        };
        let master = tier.master.resolve(tracks);
        let target = db_to_linear(tier.target_rms_db);
        let per_track = if master > 0.0 {
            target / ((tracks as f32).sqrt() * master)
        } else {
            0.0
        };
        GainPlan {
            per_track,
            master,
            target_rms_db: Some(tier.target_rms_db),
        }
    }
}

/// Resolved gains for one render.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GainPlan {
    pub per_track: f32,
    pub master: f32,
    pub target_rms_db: Option<f32>,
}

impl GainPlan {
    pub fn unity() -> Self {
        Self {
            per_track: 1.0,
            master: 1.0,
            target_rms_db: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GainStaging {
    Calibrated(GainCalibration),
    /// No automatic staging; only track and master gains apply.
    Unity,
}

impl Default for GainStaging {
    fn default() -> Self {
        GainStaging::Calibrated(GainCalibration::default())
    }
}

impl GainStaging {
    pub fn plan(&self, tracks: usize) -> GainPlan {
        match self {
            GainStaging::Calibrated(calibration) => calibration.plan(tracks),
            GainStaging::Unity => GainPlan::unity(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PanLaw {
    /// -3 dB at centre, sin/cos taper.
    ConstantPower,
    /// Unity at centre; the opposite side is attenuated linearly.
    #[default]
    Balanced,
}

impl PanLaw {
    /// Left and right gains for a pan position in `[-1, 1]`.
    #[inline]
    pub fn gains(self, pan: f32) -> (f32, f32) {
        let pan = if pan.is_finite() { pan.clamp(-1.0, 1.0) } else { 0.0 };
        match self {
            PanLaw::ConstantPower => {
                let theta = (pan + 1.0) * 0.5 * std::f32::consts::FRAC_PI_2;
                (theta.cos(), theta.sin())
            }
            PanLaw::Balanced => {
                if pan <= 0.0 {
                    (1.0, 1.0 + pan)
                } else {
                    (1.0 - pan, 1.0)
                }
            }
        }
    }
}
