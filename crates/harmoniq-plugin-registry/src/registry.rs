use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

use crate::{scan_plugins, DescriptorStore, PluginDescriptor, PluginProber, ScanConfig, ScanReport, StoreError};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("unknown plugin id: {0}")]
    UnknownPlugin(String),
}

/// Descriptor cache keyed by plugin id.
///
/// Built once at startup and shared behind an `Arc`; there is no global
/// instance.
#[derive(Debug, Default)]
pub struct Registry {
    descriptors: RwLock<BTreeMap<String, Arc<PluginDescriptor>>>,
    store: Option<DescriptorStore>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry backed by a persistent cache, preloading what the
    /// cache already knows.
    pub fn with_store(store: DescriptorStore) -> Self {
        let descriptors = store
            .descriptors()
            .into_iter()
            .map(|descriptor| (descriptor.id.clone(), Arc::new(descriptor)))
            .collect();
        Self {
            descriptors: RwLock::new(descriptors),
            store: Some(store),
        }
    }

    pub fn scan<P: PluginProber + ?Sized>(
        &self,
        config: &ScanConfig,
        prober: &P,
    ) -> Result<ScanReport, RegistryError> {
        let report = scan_plugins(config, prober);
        {
            let mut descriptors = self.descriptors.write();
            for descriptor in &report.descriptors {
                descriptors.insert(descriptor.id.clone(), Arc::new(descriptor.clone()));
            }
        }
        if let Some(store) = &self.store {
            store.merge(report.descriptors.clone())?;
        }
        log::debug!(
            "scan finished: {} descriptors, {} deferred",
            report.descriptors.len(),
            report.errors.len()
        );
        Ok(report)
    }

    /// Adds or replaces a descriptor. Persisted when a store is attached.
    pub fn insert(&self, descriptor: PluginDescriptor) -> Result<Arc<PluginDescriptor>, RegistryError> {
        if let Some(store) = &self.store {
            store.upsert(descriptor.clone())?;
        }
        let descriptor = Arc::new(descriptor);
        let previous = self
            .descriptors
            .write()
            .insert(descriptor.id.clone(), Arc::clone(&descriptor));
        if let Some(previous) = previous {
            if previous.binary_path != descriptor.binary_path {
                log::debug!(
                    "plugin id {} moved from {} to {}",
                    descriptor.id,
                    previous.binary_path.display(),
                    descriptor.binary_path.display()
                );
            }
        }
        Ok(descriptor)
    }

    pub fn get(&self, id: &str) -> Option<Arc<PluginDescriptor>> {
        self.descriptors.read().get(id).cloned()
    }

    pub fn require(&self, id: &str) -> Result<Arc<PluginDescriptor>, RegistryError> {
        self.get(id)
            .ok_or_else(|| RegistryError::UnknownPlugin(id.to_owned()))
    }

    /// All descriptors exported by the binary at `path`, ordered by entry index.
    pub fn find_by_path(&self, path: &Path) -> Vec<Arc<PluginDescriptor>> {
        let mut found: Vec<_> = self
            .descriptors
            .read()
            .values()
            .filter(|descriptor| descriptor.binary_path == path)
            .cloned()
            .collect();
        found.sort_by_key(|descriptor| descriptor.entry_index);
        found
    }

    pub fn remove(&self, id: &str) -> Option<Arc<PluginDescriptor>> {
        self.descriptors.write().remove(id)
    }

    pub fn descriptors(&self) -> Vec<Arc<PluginDescriptor>> {
        self.descriptors.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.descriptors.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
