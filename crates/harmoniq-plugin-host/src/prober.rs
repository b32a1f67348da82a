use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use harmoniq_plugin_registry::{PluginDescriptor, PluginFormat, PluginProber, ProbeError};

use crate::binding::{abandon, PluginBinding};
use crate::error::HostError;

/// Registry prober that opens each candidate through its format binding and
/// reads the descriptors the plugin reports about itself.
pub struct BindingProber {
    bindings: HashMap<PluginFormat, Arc<dyn PluginBinding>>,
}

impl BindingProber {
    pub fn new(bindings: impl IntoIterator<Item = Arc<dyn PluginBinding>>) -> Self {
        Self {
            bindings: bindings
                .into_iter()
                .map(|binding| (binding.format(), binding))
                .collect(),
        }
    }

    /// Prober over the native bindings compiled into this build.
    pub fn native() -> Self {
        Self::new(crate::formats::native_bindings())
    }
}

impl PluginProber for BindingProber {
    fn probe(&self, format: PluginFormat, path: &Path) -> Result<Vec<PluginDescriptor>, ProbeError> {
        let binding = self.bindings.get(&format).ok_or(ProbeError::Unsupported)?;
        probe_binary(binding.as_ref(), path).map_err(|err| match err {
            HostError::TransientLoad(err) => ProbeError::Transient(err.to_string()),
            other => ProbeError::Binary(other.to_string()),
        })
    }
}

/// Loads every entry of the binary just long enough to read its descriptor.
pub(crate) fn probe_binary(
    binding: &dyn PluginBinding,
    path: &Path,
) -> Result<Vec<PluginDescriptor>, HostError> {
    let count = binding.entry_count(path)?;
    let mut descriptors = Vec::with_capacity(count as usize);
    for index in 0..count {
        let mut handle = binding.load_plugin(path, index)?;
        // Extensions such as parameters are only reachable once initialized;
        // a refusal still leaves the static part of the descriptor.
        if let Err(err) = binding.initialize(&mut handle) {
            tracing::debug!("probe of {} entry {index} could not initialize: {err}", path.display());
        }
        let descriptor = binding.get_descriptor(&handle);
        abandon(binding, handle).map_err(|rejected| rejected.error)?;
        descriptors.push(descriptor?);
    }
    Ok(descriptors)
}
