//! Format adapters behind [`PluginBinding`](crate::binding::PluginBinding).

pub mod clap;
#[cfg(any(test, feature = "fake-plugins"))]
pub mod fake;

use std::sync::Arc;

use harmoniq_plugin_registry::PluginFormat;

use crate::binding::PluginBinding;

/// Bindings compiled into this build, one per supported format.
pub fn native_bindings() -> Vec<Arc<dyn PluginBinding>> {
    vec![Arc::new(clap::ClapBinding::new())]
}

/// Whether a native binding exists for `format`.
pub fn is_hostable(format: PluginFormat) -> bool {
    matches!(format, PluginFormat::Clap)
}
