use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Deserialize;
use walkdir::WalkDir;

use crate::{ParameterDef, PluginCategory, PluginDescriptor, PluginFormat};

#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub system_roots: Vec<PathBuf>,
    pub user_roots: Vec<PathBuf>,
    pub formats: Vec<PluginFormat>,
    pub max_depth: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        let mut system_roots = Vec::new();
        let mut user_roots = Vec::new();
        for format in PluginFormat::ALL {
            let (system, user) = format.standard_roots();
            system_roots.extend(system);
            user_roots.extend(user);
        }
        Self {
            system_roots,
            user_roots,
            formats: PluginFormat::ALL.to_vec(),
            max_depth: 4,
        }
    }
}

impl ScanConfig {
    /// A config that only scans the given roots.
    pub fn with_roots(roots: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            system_roots: Vec::new(),
            user_roots: roots.into_iter().collect(),
            ..Self::default()
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid manifest: {0}")]
    Manifest(#[from] serde_json::Error),
    #[error("unsupported plugin format")]
    Unsupported,
    #[error("invalid plugin binary: {0}")]
    Binary(String),
    #[error("plugin binary temporarily unavailable: {0}")]
    Transient(String),
}

impl ProbeError {
    /// Lock and permission races are worth another attempt later.
    pub fn is_transient(&self) -> bool {
        match self {
            ProbeError::Transient(_) => true,
            ProbeError::Io(err) => matches!(
                err.kind(),
                ErrorKind::PermissionDenied | ErrorKind::WouldBlock | ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}

/// Turns a candidate binary into one descriptor per exported entry point.
pub trait PluginProber {
    fn probe(&self, format: PluginFormat, path: &Path)
        -> Result<Vec<PluginDescriptor>, ProbeError>;
}

/// Reads descriptors from a `manifest.json` sidecar next to the binary.
///
/// Binaries without a manifest get a single stub descriptor derived from the
/// file name.
#[derive(Debug, Default)]
pub struct ManifestProber;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ManifestFile {
    Bundle { plugins: Vec<ManifestPlugin> },
    Single(ManifestPlugin),
}

#[derive(Debug, Deserialize)]
struct ManifestPlugin {
    id: Option<String>,
    name: Option<String>,
    vendor: Option<String>,
    #[serde(default)]
    features: Vec<String>,
    version: Option<String>,
    audio_inputs: Option<u32>,
    audio_outputs: Option<u32>,
    supports_midi: Option<bool>,
    latency_samples: Option<u32>,
    #[serde(default)]
    parameters: Vec<ManifestParameter>,
}

#[derive(Debug, Deserialize)]
struct ManifestParameter {
    name: String,
    min: f64,
    max: f64,
    default: Option<f64>,
    #[serde(default)]
    unit: String,
}

impl PluginProber for ManifestProber {
    fn probe(
        &self,
        format: PluginFormat,
        path: &Path,
    ) -> Result<Vec<PluginDescriptor>, ProbeError> {
        let Some(manifest) = find_manifest(path)? else {
            return Ok(vec![stub_descriptor(format, path)]);
        };
        let plugins = match manifest {
            ManifestFile::Bundle { plugins } => plugins,
            ManifestFile::Single(plugin) => vec![plugin],
        };
        if plugins.is_empty() {
            return Err(ProbeError::Binary(format!(
                "{} declares no plugins",
                path.display()
            )));
        }
        Ok(plugins
            .into_iter()
            .enumerate()
            .map(|(entry, plugin)| manifest_descriptor(format, path, entry as u32, plugin))
            .collect())
    }
}

fn manifest_descriptor(
    format: PluginFormat,
    path: &Path,
    entry_index: u32,
    plugin: ManifestPlugin,
) -> PluginDescriptor {
    let stub = stub_descriptor(format, path);
    let id = plugin.id.unwrap_or_else(|| {
        if entry_index == 0 {
            stub.id.clone()
        } else {
            format!("{}:{entry_index}", stub.id)
        }
    });
    let name = plugin.name.unwrap_or(stub.name);
    let category = PluginCategory::from_features(plugin.features.iter().map(String::as_str))
        .unwrap_or_else(|| PluginCategory::infer_from_name(&name));
    let parameters = plugin.parameters.into_iter().map(|param| {
        let default = param.default.unwrap_or(param.min);
        ParameterDef::new(0, param.name, param.min, param.max, default).with_unit(param.unit)
    });
    let mut descriptor = PluginDescriptor::new(
        id,
        name,
        plugin.vendor.unwrap_or_default(),
        format,
        path,
    )
    .with_entry_index(entry_index)
    .with_category(category)
    .with_io(
        plugin.audio_inputs.unwrap_or(2),
        plugin.audio_outputs.unwrap_or(2),
    )
    .with_midi(plugin.supports_midi.unwrap_or(false))
    .with_parameters(parameters)
    .with_latency(plugin.latency_samples.unwrap_or(0));
    descriptor.version = plugin.version;
    descriptor
}

fn find_manifest(path: &Path) -> Result<Option<ManifestFile>, ProbeError> {
    let mut candidates = Vec::new();
    if path.is_dir() {
        candidates.push(path.join("manifest.json"));
        candidates.push(path.join("Contents/manifest.json"));
    } else {
        candidates.push(path.with_extension("json"));
        if let Some(parent) = path.parent() {
            candidates.push(parent.join("manifest.json"));
        }
    }
    for candidate in candidates {
        if candidate.is_file() {
            let raw = fs::read_to_string(candidate)?;
            let manifest: ManifestFile = serde_json::from_str(&raw)?;
            return Ok(Some(manifest));
        }
    }
    Ok(None)
}

/// Placeholder descriptor for binaries nothing else is known about.
pub fn stub_descriptor(format: PluginFormat, path: &Path) -> PluginDescriptor {
    let name = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let mut id = name.clone();
    id.push('#');
    id.push_str(format.extension());
    PluginDescriptor::new(id, name, String::new(), format, path)
}

#[derive(Debug, Default)]
pub struct ScanReport {
    pub descriptors: Vec<PluginDescriptor>,
    /// Candidates that could not be probed this time but may be retried.
    pub errors: Vec<(PathBuf, ProbeError)>,
}

impl ScanReport {
    pub fn into_descriptors(self) -> Vec<PluginDescriptor> {
        self.descriptors
    }

    pub fn quarantined(&self) -> impl Iterator<Item = &PluginDescriptor> {
        self.descriptors.iter().filter(|d| d.quarantined)
    }
}

pub fn scan_plugins<P: PluginProber + ?Sized>(config: &ScanConfig, prober: &P) -> ScanReport {
    let mut descriptors = BTreeMap::new();
    let mut errors = Vec::new();

    for root in config.system_roots.iter().chain(config.user_roots.iter()) {
        if !root.exists() {
            continue;
        }
        let mut walker = WalkDir::new(root)
            .max_depth(config.max_depth)
            .follow_links(true)
            .into_iter();
        while let Some(entry) = walker.next() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    if let Some(io) = err.io_error() {
                        log::debug!("skipping entry while scanning {}: {}", root.display(), io);
                    }
                    continue;
                }
            };
            let Some((format, candidate)) = classify_candidate(entry.path()) else {
                continue;
            };
            if entry.file_type().is_dir() {
                // Bundles are probed as a whole, never descended into.
                walker.skip_current_dir();
            }
            if !config.formats.contains(&format) {
                continue;
            }
            match prober.probe(format, &candidate) {
                Ok(found) => {
                    for mut descriptor in found {
                        descriptor.last_seen = Utc::now();
                        descriptors.insert(
                            (descriptor.binary_path.clone(), descriptor.entry_index),
                            descriptor,
                        );
                    }
                }
                Err(err) if err.is_transient() => {
                    log::debug!("deferring {}: {}", candidate.display(), err);
                    errors.push((candidate, err));
                }
                Err(err) => {
                    log::debug!("quarantining {}: {}", candidate.display(), err);
                    let mut stub = stub_descriptor(format, &candidate);
                    stub.mark_quarantined();
                    descriptors.insert((candidate, 0), stub);
                }
            }
        }
    }

    ScanReport {
        descriptors: descriptors.into_values().collect(),
        errors,
    }
}

fn classify_candidate(path: &Path) -> Option<(PluginFormat, PathBuf)> {
    let name = path.file_name()?.to_str()?;
    if path.is_file() {
        if name == "plugin.clap" {
            let bundle = path.parent()?.parent()?;
            if bundle.extension().and_then(|ext| ext.to_str()) == Some("clap") {
                return Some((PluginFormat::Clap, bundle.to_path_buf()));
            }
        }
        let format = PluginFormat::from_extension(path.extension()?.to_str()?)?;
        return Some((format, path.to_path_buf()));
    }
    if path.is_dir() {
        if let Some(format) = path
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(PluginFormat::from_extension)
        {
            return Some((format, path.to_path_buf()));
        }
    }
    None
}
