//! Native plugin hosting for Harmoniq Studio.
//!
//! Plugins are opaque binaries behind a fixed ABI. Each supported format has a
//! [`PluginBinding`] that knows how to load, drive and release them; the
//! [`InstanceManager`] sits on top, owns every live instance, composes them
//! into chains and hands out [`InstanceLease`]s to the render path.

mod audio_buffer;
mod binding;
mod chain;
mod config;
mod diagnostics;
mod error;
pub mod formats;
mod instance;
mod lifecycle;
mod manager;
mod params;
mod prober;

pub use audio_buffer::AudioBuffer;
pub use binding::{
    bring_up, shut_down, ActivationConfig, HandleLedger, NativeHandle, ParamEvent, PluginBinding,
    ProcessStatus, UnloadRejected,
};
pub use chain::{ChainId, PluginChain};
pub use config::{ConfigError, HostConfig, RetryPolicy};
pub use diagnostics::{Diagnostics, HostDiagnostic, ProcessingAnomaly};
pub use error::{HostError, LoadError, TransientLoadError};
pub use formats::clap::ClapBinding;
pub use instance::{InstanceId, InstanceLease};
pub use lifecycle::{LifecycleOp, PluginState, StateError};
pub use manager::{HostStats, InstanceManager};
pub use params::ParameterTable;
pub use prober::BindingProber;

pub use harmoniq_plugin_registry as registry;
