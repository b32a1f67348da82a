//! JSON cache of scanned plugin descriptors.
//!
//! A scan only has to open binaries that changed since the cache was
//! written. The file is replaced atomically, so a crash mid-write leaves the
//! previous cache in place.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::descriptor::PluginDescriptor;

/// Bumped whenever [`PluginDescriptor`] changes shape.
const CACHE_VERSION: u32 = 1;
const CACHE_DIR: &str = "HarmoniqStudio";
const CACHE_FILE: &str = "plugin-descriptors.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no per-user configuration directory on this system")]
    NoConfigDir,
    #[error("cannot read descriptor cache {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("descriptor cache {} is corrupt: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("cannot write descriptor cache {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    #[serde(default)]
    version: u32,
    descriptors: Vec<PluginDescriptor>,
}

#[derive(Debug)]
pub struct DescriptorStore {
    path: PathBuf,
    descriptors: Mutex<Vec<PluginDescriptor>>,
}

impl DescriptorStore {
    /// Opens the cache at `path`. A missing file is an empty cache; a file
    /// from another cache version is discarded and rebuilt on the next scan.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let descriptors = match fs::read_to_string(&path) {
            Ok(raw) => {
                let file: CacheFile =
                    serde_json::from_str(&raw).map_err(|source| StoreError::Parse {
                        path: path.clone(),
                        source,
                    })?;
                if file.version == CACHE_VERSION {
                    file.descriptors
                } else {
                    log::info!(
                        "discarding descriptor cache {} (version {}, expected {CACHE_VERSION})",
                        path.display(),
                        file.version
                    );
                    Vec::new()
                }
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(source) => return Err(StoreError::Read { path, source }),
        };
        Ok(Self {
            path,
            descriptors: Mutex::new(descriptors),
        })
    }

    /// `<config dir>/HarmoniqStudio/plugin-descriptors.json`.
    pub fn default_path() -> Result<PathBuf, StoreError> {
        dirs::config_dir()
            .map(|dir| dir.join(CACHE_DIR).join(CACHE_FILE))
            .ok_or(StoreError::NoConfigDir)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn descriptors(&self) -> Vec<PluginDescriptor> {
        self.descriptors.lock().clone()
    }

    /// Stores `descriptor`, replacing whatever was cached for the same
    /// binary entry.
    pub fn upsert(&self, descriptor: PluginDescriptor) -> Result<(), StoreError> {
        let mut cached = self.descriptors.lock();
        match slot_for(&mut cached, &descriptor) {
            Some(slot) => *slot = descriptor,
            None => cached.push(descriptor),
        }
        self.write(&cached)
    }

    /// Folds a scan into the cache. An entry is only replaced by a sighting
    /// at least as recent; the result is ordered newest first.
    pub fn merge(&self, scanned: Vec<PluginDescriptor>) -> Result<(), StoreError> {
        let mut cached = self.descriptors.lock();
        for descriptor in scanned {
            match slot_for(&mut cached, &descriptor) {
                Some(slot) if descriptor.last_seen >= slot.last_seen => *slot = descriptor,
                Some(_) => {}
                None => cached.push(descriptor),
            }
        }
        cached.sort_by(|a, b| b.last_seen.cmp(&a.last_seen).then_with(|| a.name.cmp(&b.name)));
        self.write(&cached)
    }

    fn write(&self, descriptors: &[PluginDescriptor]) -> Result<(), StoreError> {
        let failed = |source: io::Error| StoreError::Write {
            path: self.path.clone(),
            source,
        };
        let file = CacheFile {
            version: CACHE_VERSION,
            descriptors: descriptors.to_vec(),
        };
        let json = serde_json::to_vec_pretty(&file).map_err(|err| failed(err.into()))?;

        if let Some(dir) = self.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(failed)?;
        }
        let staging = self.path.with_extension("json.partial");
        fs::write(&staging, json).map_err(failed)?;
        fs::rename(&staging, &self.path).map_err(failed)?;
        log::debug!("wrote {} descriptors to {}", descriptors.len(), self.path.display());
        Ok(())
    }
}

/// A binary entry is identified by its path and its index inside the file.
fn slot_for<'a>(
    cached: &'a mut [PluginDescriptor],
    descriptor: &PluginDescriptor,
) -> Option<&'a mut PluginDescriptor> {
    cached.iter_mut().find(|entry| {
        entry.binary_path == descriptor.binary_path && entry.entry_index == descriptor.entry_index
    })
}
