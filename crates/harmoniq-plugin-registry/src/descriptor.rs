use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Binary plugin formats the registry knows how to discover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
pub enum PluginFormat {
    Clap,
    Vst3,
}

impl PluginFormat {
    pub const ALL: [PluginFormat; 2] = [PluginFormat::Clap, PluginFormat::Vst3];

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "clap" => Some(Self::Clap),
            "vst3" => Some(Self::Vst3),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            PluginFormat::Clap => "clap",
            PluginFormat::Vst3 => "vst3",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            PluginFormat::Clap => "CLAP",
            PluginFormat::Vst3 => "VST3",
        }
    }

    /// Standard search paths for this format on the current platform.
    pub fn standard_roots(self) -> (Vec<PathBuf>, Vec<PathBuf>) {
        let mut system = Vec::new();
        let mut user = Vec::new();
        match self {
            PluginFormat::Clap => {
                if cfg!(target_os = "macos") {
                    system.push(PathBuf::from("/Library/Audio/Plug-Ins/CLAP"));
                } else if cfg!(target_os = "windows") {
                    system.push(PathBuf::from("C:\\Program Files\\Common Files\\CLAP"));
                } else {
                    system.push(PathBuf::from("/usr/lib/clap"));
                    system.push(PathBuf::from("/usr/local/lib/clap"));
                }
                if let Some(home) = dirs::home_dir() {
                    if cfg!(target_os = "macos") {
                        user.push(home.join("Library/Audio/Plug-Ins/CLAP"));
                    } else {
                        user.push(home.join(".clap"));
                    }
                }
                if let Some(extra) = std::env::var_os("CLAP_PATH") {
                    user.extend(std::env::split_paths(&extra));
                }
            }
            PluginFormat::Vst3 => {
                if cfg!(target_os = "macos") {
                    system.push(PathBuf::from("/Library/Audio/Plug-Ins/VST3"));
                } else if cfg!(target_os = "windows") {
                    system.push(PathBuf::from("C:\\Program Files\\Common Files\\VST3"));
                } else {
                    system.push(PathBuf::from("/usr/lib/vst3"));
                    system.push(PathBuf::from("/usr/local/lib/vst3"));
                }
                if let Some(home) = dirs::home_dir() {
                    if cfg!(target_os = "macos") {
                        user.push(home.join("Library/Audio/Plug-Ins/VST3"));
                    } else {
                        user.push(home.join(".vst3"));
                    }
                }
            }
        }
        (system, user)
    }
}

impl fmt::Display for PluginFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash, Default)]
pub enum PluginCategory {
    Instrument,
    Effect,
    Analyzer,
    NoteEffect,
    #[default]
    Utility,
}

impl PluginCategory {
    /// Maps CLAP style feature strings onto a category.
    pub fn from_features<'a>(features: impl IntoIterator<Item = &'a str>) -> Option<Self> {
        let mut found = None;
        for feature in features {
            let category = match feature {
                "instrument" => PluginCategory::Instrument,
                "audio-effect" => PluginCategory::Effect,
                "analyzer" => PluginCategory::Analyzer,
                "note-effect" => PluginCategory::NoteEffect,
                "utility" => PluginCategory::Utility,
                _ => continue,
            };
            // Instruments win over anything else the plugin advertises.
            if category == PluginCategory::Instrument {
                return Some(category);
            }
            found.get_or_insert(category);
        }
        found
    }

    pub fn infer_from_name(name: &str) -> Self {
        let lowercase = name.to_ascii_lowercase();
        if lowercase.contains("synth")
            || lowercase.contains("drum")
            || lowercase.contains("bass")
            || lowercase.contains("piano")
        {
            PluginCategory::Instrument
        } else if lowercase.contains("eq")
            || lowercase.contains("compress")
            || lowercase.contains("limit")
            || lowercase.contains("reverb")
            || lowercase.contains("delay")
            || lowercase.contains("filter")
        {
            PluginCategory::Effect
        } else if lowercase.contains("meter") || lowercase.contains("scope") {
            PluginCategory::Analyzer
        } else {
            PluginCategory::Utility
        }
    }
}

/// Static description of one automatable parameter.
///
/// The index is the stable position in the plugin's parameter table and is
/// the only key used once an instance is running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    pub index: u32,
    pub name: String,
    pub min: f64,
    pub max: f64,
    pub default: f64,
    #[serde(default)]
    pub unit: String,
}

impl ParameterDef {
    pub fn new(index: u32, name: impl Into<String>, min: f64, max: f64, default: f64) -> Self {
        let (min, max) = ordered(min, max);
        Self {
            index,
            name: name.into(),
            min,
            max,
            default: clamp_between(default, min, max),
            unit: String::new(),
        }
    }

    /// Finite bounds in order and a finite default inside them.
    pub fn is_well_formed(&self) -> bool {
        self.min.is_finite()
            && self.max.is_finite()
            && self.default.is_finite()
            && self.min <= self.max
            && (self.min..=self.max).contains(&self.default)
    }

    /// Usable form of a definition reported by a plugin or read from disk.
    ///
    /// Swapped bounds are reordered and a bad default falls back into range.
    /// `None` when either bound is not a finite number.
    pub fn sanitized(&self) -> Option<ParameterDef> {
        if !self.min.is_finite() || !self.max.is_finite() {
            return None;
        }
        let (min, max) = ordered(self.min, self.max);
        let default = if self.default.is_finite() {
            self.default.clamp(min, max)
        } else {
            min
        };
        Some(ParameterDef {
            min,
            max,
            default,
            ..self.clone()
        })
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    /// Never panics, even on malformed bounds; NaN lands on the lower bound.
    pub fn clamp(&self, value: f64) -> f64 {
        let (min, max) = ordered(self.min, self.max);
        clamp_between(value, min, max)
    }

    pub fn normalised(&self, value: f64) -> f64 {
        if (self.max - self.min).abs() <= f64::EPSILON {
            0.0
        } else {
            (self.clamp(value) - self.min) / (self.max - self.min)
        }
    }

    pub fn from_normalised(&self, value: f64) -> f64 {
        self.min + value.clamp(0.0, 1.0) * (self.max - self.min)
    }
}

fn ordered(a: f64, b: f64) -> (f64, f64) {
    if b < a {
        (b, a)
    } else {
        (a, b)
    }
}

// `f64::clamp` panics on NaN bounds; `max`/`min` skip a NaN operand instead.
fn clamp_between(value: f64, min: f64, max: f64) -> f64 {
    value.max(min).min(max)
}

/// Immutable metadata for one plugin entry point inside a binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub id: String,
    pub name: String,
    pub vendor: String,
    pub format: PluginFormat,
    pub binary_path: PathBuf,
    #[serde(default)]
    pub entry_index: u32,
    #[serde(default)]
    pub category: PluginCategory,
    pub audio_inputs: u32,
    pub audio_outputs: u32,
    #[serde(default)]
    pub supports_midi: bool,
    #[serde(default)]
    pub parameter_defs: Vec<ParameterDef>,
    #[serde(default)]
    pub declared_latency_samples: u32,
    pub version: Option<String>,
    #[serde(default)]
    pub quarantined: bool,
    pub last_seen: DateTime<Utc>,
}

impl PluginDescriptor {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        vendor: impl Into<String>,
        format: PluginFormat,
        binary_path: impl Into<PathBuf>,
    ) -> Self {
        let name = name.into();
        Self {
            id: id.into(),
            category: PluginCategory::infer_from_name(&name),
            name,
            vendor: vendor.into(),
            format,
            binary_path: binary_path.into(),
            entry_index: 0,
            audio_inputs: 2,
            audio_outputs: 2,
            supports_midi: false,
            parameter_defs: Vec::new(),
            declared_latency_samples: 0,
            version: None,
            quarantined: false,
            last_seen: Utc::now(),
        }
    }

    pub fn with_entry_index(mut self, entry_index: u32) -> Self {
        self.entry_index = entry_index;
        self
    }

    pub fn with_category(mut self, category: PluginCategory) -> Self {
        self.category = category;
        self
    }

    pub fn with_io(mut self, audio_inputs: u32, audio_outputs: u32) -> Self {
        self.audio_inputs = audio_inputs;
        self.audio_outputs = audio_outputs;
        self
    }

    pub fn with_midi(mut self, supports_midi: bool) -> Self {
        self.supports_midi = supports_midi;
        self
    }

    /// Installs the parameter table, renumbering indices to match positions.
    pub fn with_parameters(mut self, parameters: impl IntoIterator<Item = ParameterDef>) -> Self {
        self.parameter_defs = parameters
            .into_iter()
            .enumerate()
            .map(|(index, mut def)| {
                def.index = index as u32;
                def
            })
            .collect();
        self
    }

    pub fn with_latency(mut self, samples: u32) -> Self {
        self.declared_latency_samples = samples;
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn parameter(&self, index: u32) -> Option<&ParameterDef> {
        self.parameter_defs.get(index as usize)
    }

    pub fn is_effect(&self) -> bool {
        self.audio_inputs > 0 && self.audio_outputs > 0
    }

    pub fn binary_path(&self) -> &Path {
        &self.binary_path
    }

    pub fn mark_quarantined(&mut self) {
        self.quarantined = true;
    }
}

impl fmt::Display for PluginDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.vendor)
    }
}
