use std::any::Any;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use harmoniq_plugin_registry::{ParameterDef, PluginDescriptor, PluginFormat};
use serde::{Deserialize, Serialize};

use crate::audio_buffer::AudioBuffer;
use crate::error::HostError;
use crate::lifecycle::{LifecycleOp, PluginState, StateError};

/// Sample rate and block bounds passed to `activate`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActivationConfig {
    pub sample_rate: f64,
    pub min_block_size: u32,
    pub max_block_size: u32,
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000.0,
            min_block_size: 1,
            max_block_size: 1024,
        }
    }
}

/// A parameter change delivered with a process call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamEvent {
    pub index: u32,
    pub value: f64,
    /// Frame offset inside the block.
    pub offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Continue,
    ContinueIfNotQuiet,
    Tail,
    Sleep,
    Error,
}

/// Opaque, move-only ownership token for one native plugin instance.
///
/// Only the binding that created a handle can see what is inside it. The
/// token is consumed by [`PluginBinding::unload_plugin`], so a released
/// instance cannot be reached again.
pub struct NativeHandle {
    serial: u64,
    format: PluginFormat,
    state: PluginState,
    aborting: bool,
    slot: Option<Box<dyn Any + Send>>,
}

impl NativeHandle {
    pub(crate) fn new<T: Any + Send>(serial: u64, format: PluginFormat, slot: T) -> Self {
        Self {
            serial,
            format,
            state: PluginState::Loaded,
            aborting: false,
            slot: Some(Box::new(slot)),
        }
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn format(&self) -> PluginFormat {
        self.format
    }

    pub fn state(&self) -> PluginState {
        self.state
    }

    /// Target state for `op`, without committing it.
    pub(crate) fn check(&self, op: LifecycleOp) -> Result<PluginState, StateError> {
        self.state.apply(op)
    }

    pub(crate) fn commit(&mut self, state: PluginState) {
        self.state = state;
    }

    /// Check a binding runs before releasing the handle.
    pub(crate) fn check_release(&self) -> Result<PluginState, StateError> {
        let op = if self.aborting {
            LifecycleOp::Abort
        } else {
            LifecycleOp::Unload
        };
        self.state.apply(op)
    }

    pub(crate) fn slot<T: Any>(&self, expected: PluginFormat) -> Result<&T, HostError> {
        self.slot
            .as_ref()
            .and_then(|slot| slot.downcast_ref::<T>())
            .ok_or(HostError::FormatMismatch {
                expected,
                found: self.format,
            })
    }

    pub(crate) fn slot_mut<T: Any>(&mut self, expected: PluginFormat) -> Result<&mut T, HostError> {
        let found = self.format;
        self.slot
            .as_mut()
            .and_then(|slot| slot.downcast_mut::<T>())
            .ok_or(HostError::FormatMismatch { expected, found })
    }

    /// Takes the native resources out for release.
    pub(crate) fn take_slot<T: Any>(mut self, expected: PluginFormat) -> Result<Box<T>, Self> {
        match self.slot.take().map(|slot| slot.downcast::<T>()) {
            Some(Ok(slot)) => {
                self.state = PluginState::Unloaded;
                Ok(slot)
            }
            Some(Err(slot)) => {
                self.slot = Some(slot);
                tracing::error!(
                    "handle {} is not a {} handle",
                    self.serial,
                    expected.label()
                );
                Err(self)
            }
            None => Err(self),
        }
    }
}

impl fmt::Debug for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeHandle")
            .field("serial", &self.serial)
            .field("format", &self.format)
            .field("state", &self.state)
            .finish()
    }
}

impl Drop for NativeHandle {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            // Releasing here would run native teardown from an arbitrary
            // thread and state; keep the resources alive instead.
            tracing::error!(
                "native handle {} ({}) dropped while {}; leaking it",
                self.serial,
                self.format.label(),
                self.state
            );
            std::mem::forget(slot);
        }
    }
}

/// Returned when a binding refuses to unload; the caller keeps ownership.
#[derive(Debug)]
pub struct UnloadRejected {
    pub error: HostError,
    pub handle: NativeHandle,
}

/// Counts handles a binding has created and not yet released.
#[derive(Debug, Default)]
pub struct HandleLedger {
    next_serial: AtomicU64,
    outstanding: AtomicUsize,
}

impl HandleLedger {
    pub(crate) fn issue(&self) -> u64 {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        self.next_serial.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn release(&self) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }
}

/// Capability set every plugin format adapter implements.
///
/// The instance manager only talks to this trait; which implementation
/// backs an instance is chosen from `PluginDescriptor::format`.
///
/// `process` is called once per block on the processing thread and must not
/// allocate. Output is not trusted: callers validate sample count and
/// finiteness themselves.
pub trait PluginBinding: Send + Sync {
    fn format(&self) -> PluginFormat;

    /// Number of plugin entry points exported by the binary.
    fn entry_count(&self, path: &Path) -> Result<u32, HostError>;

    fn load_plugin(&self, path: &Path, entry_index: u32) -> Result<NativeHandle, HostError>;

    fn get_descriptor(&self, handle: &NativeHandle) -> Result<PluginDescriptor, HostError>;

    /// `Ok(false)` when the plugin declined; the handle stays `Loaded`.
    fn initialize(&self, handle: &mut NativeHandle) -> Result<bool, HostError>;

    fn activate(
        &self,
        handle: &mut NativeHandle,
        config: ActivationConfig,
    ) -> Result<bool, HostError>;

    fn deactivate(&self, handle: &mut NativeHandle) -> Result<(), HostError>;

    fn start_processing(&self, handle: &mut NativeHandle) -> Result<bool, HostError>;

    fn stop_processing(&self, handle: &mut NativeHandle) -> Result<(), HostError>;

    /// Clears internal DSP state (tails, delay lines) without reactivating.
    fn reset(&self, handle: &mut NativeHandle) -> Result<(), HostError>;

    fn process(
        &self,
        handle: &mut NativeHandle,
        inputs: &AudioBuffer,
        outputs: &mut AudioBuffer,
        frames: usize,
        events: &[ParamEvent],
    ) -> Result<ProcessStatus, HostError>;

    fn parameter_count(&self, handle: &NativeHandle) -> Result<u32, HostError>;

    fn parameter_info(&self, handle: &NativeHandle, index: u32) -> Result<ParameterDef, HostError>;

    fn parameter_value(&self, handle: &NativeHandle, index: u32) -> Result<f64, HostError>;

    fn set_parameter_value(
        &self,
        handle: &mut NativeHandle,
        index: u32,
        value: f64,
    ) -> Result<(), HostError>;

    fn latency(&self, handle: &NativeHandle) -> Result<u32, HostError>;

    /// Releases every native resource behind `handle`. Valid from `Loaded` or
    /// `Deactivated`; otherwise the handle is handed back.
    fn unload_plugin(&self, handle: NativeHandle) -> Result<(), UnloadRejected>;

    fn outstanding_handles(&self) -> usize;
}

/// Walks a freshly loaded handle up to `Active`, tearing it down on failure.
pub fn bring_up(
    binding: &dyn PluginBinding,
    mut handle: NativeHandle,
    config: ActivationConfig,
    initialize_attempts: u32,
) -> Result<NativeHandle, HostError> {
    let mut initialized = false;
    let mut last_error = None;
    for _ in 0..initialize_attempts.max(1) {
        match binding.initialize(&mut handle) {
            Ok(true) => {
                initialized = true;
                break;
            }
            Ok(false) => last_error = Some(HostError::Refused("initialize")),
            Err(err) => last_error = Some(err),
        }
    }
    if !initialized {
        release_quietly(binding, handle);
        return Err(last_error.unwrap_or(HostError::Refused("initialize")));
    }
    match binding.activate(&mut handle, config) {
        Ok(true) => Ok(handle),
        Ok(false) => {
            release_quietly(binding, handle);
            Err(HostError::Refused("activate"))
        }
        Err(err) => {
            release_quietly(binding, handle);
            Err(err)
        }
    }
}

/// Tears a handle down from whatever state it is in.
pub fn shut_down(binding: &dyn PluginBinding, mut handle: NativeHandle) -> Result<(), HostError> {
    if handle.state() == PluginState::Processing {
        binding.stop_processing(&mut handle)?;
    }
    if handle.state() == PluginState::Active {
        binding.deactivate(&mut handle)?;
    }
    binding
        .unload_plugin(handle)
        .map_err(|rejected| rejected.error)
}

/// Releases a handle whose bring-up was abandoned before activation, which
/// may leave it `Initialized`.
pub(crate) fn abandon(
    binding: &dyn PluginBinding,
    mut handle: NativeHandle,
) -> Result<(), UnloadRejected> {
    handle.aborting = true;
    binding.unload_plugin(handle)
}

fn release_quietly(binding: &dyn PluginBinding, handle: NativeHandle) {
    if let Err(rejected) = abandon(binding, handle) {
        tracing::error!("failed to release plugin after bring-up failure: {}", rejected.error);
    }
}
