use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use atomic_float::AtomicF32;
use harmoniq_plugin_registry::PluginDescriptor;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::audio_buffer::AudioBuffer;
use crate::binding::{
    bring_up, shut_down, ActivationConfig, NativeHandle, ParamEvent, PluginBinding, ProcessStatus,
};
use crate::diagnostics::{Diagnostics, HostDiagnostic, ProcessingAnomaly};
use crate::error::HostError;
use crate::lifecycle::PluginState;
use crate::params::ParameterTable;

/// Smoothing factor for the per-block CPU estimate.
const CPU_SMOOTHING: f32 = 0.1;

/// Stable identifier of a loaded plugin instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(u64);

impl InstanceId {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "inst-{}", self.0)
    }
}

/// State touched by whoever currently drives the native handle.
pub(crate) struct InstanceCore {
    pub(crate) handle: Option<NativeHandle>,
    /// Preallocated to the parameter count.
    events: Vec<ParamEvent>,
}

impl InstanceCore {
    fn new(handle: NativeHandle, parameters: usize) -> Self {
        Self {
            handle: Some(handle),
            events: Vec::with_capacity(parameters),
        }
    }

    pub(crate) fn handle(&mut self, id: InstanceId) -> Result<&mut NativeHandle, HostError> {
        self.handle.as_mut().ok_or(HostError::UnknownInstance(id))
    }
}

// Who may lock `InstanceRecord::core`. A render owns it for the lifetime of
// its lease; control-path queries borrow it only while nobody else does.
const OWNER_FREE: u8 = 0;
const OWNER_RENDER: u8 = 1;
const OWNER_QUERY: u8 = 2;

fn state_code(state: PluginState) -> u8 {
    state as u8
}

fn state_from_code(code: u8) -> PluginState {
    match code {
        1 => PluginState::Loaded,
        2 => PluginState::Initialized,
        3 => PluginState::Active,
        4 => PluginState::Processing,
        5 => PluginState::Deactivated,
        _ => PluginState::Unloaded,
    }
}

struct QueryClaim<'a>(&'a AtomicU8);

impl Drop for QueryClaim<'_> {
    fn drop(&mut self) {
        self.0.store(OWNER_FREE, Ordering::Release);
    }
}

/// Everything the manager knows about one instance. The native handle lives
/// inside and never leaves except to be unloaded.
pub(crate) struct InstanceRecord {
    pub(crate) id: InstanceId,
    pub(crate) descriptor: Arc<PluginDescriptor>,
    pub(crate) binding: Arc<dyn PluginBinding>,
    pub(crate) params: ParameterTable,
    pub(crate) activation: ActivationConfig,
    pub(crate) core: Mutex<InstanceCore>,
    /// Mirror of the handle's lifecycle state, readable without `core`.
    state: AtomicU8,
    owner: AtomicU8,
    latency: AtomicU32,
    cpu: AtomicF32,
    degraded: AtomicBool,
}

impl InstanceRecord {
    pub(crate) fn new(
        id: InstanceId,
        descriptor: Arc<PluginDescriptor>,
        binding: Arc<dyn PluginBinding>,
        handle: NativeHandle,
        activation: ActivationConfig,
        latency: u32,
    ) -> Self {
        let params = ParameterTable::new(descriptor.parameter_defs.clone());
        let state = AtomicU8::new(state_code(handle.state()));
        let core = InstanceCore::new(handle, params.len());
        Self {
            id,
            descriptor,
            binding,
            params,
            activation,
            core: Mutex::new(core),
            state,
            owner: AtomicU8::new(OWNER_FREE),
            latency: AtomicU32::new(latency),
            cpu: AtomicF32::new(0.0),
            degraded: AtomicBool::new(false),
        }
    }

    pub(crate) fn state(&self) -> PluginState {
        state_from_code(self.state.load(Ordering::Acquire))
    }

    /// Call with `core` locked after anything that may move the handle.
    pub(crate) fn publish_state(&self, core: &InstanceCore) {
        let state = core
            .handle
            .as_ref()
            .map_or(PluginState::Unloaded, NativeHandle::state);
        self.state.store(state_code(state), Ordering::Release);
    }

    pub(crate) fn latency(&self) -> u32 {
        self.latency.load(Ordering::Relaxed)
    }

    /// Re-queries the plugin's latency unless a render holds the instance,
    /// in which case the cached figure is returned.
    pub(crate) fn refresh_latency(&self) -> u32 {
        let queried = self.with_idle_core(|core| {
            core.handle
                .as_ref()
                .map(|handle| self.binding.latency(handle))
        });
        match queried {
            Some(Some(Ok(latency))) => self.latency.store(latency, Ordering::Relaxed),
            Some(Some(Err(err))) => tracing::warn!("latency query failed for {}: {err}", self.id),
            _ => {}
        }
        self.latency()
    }

    /// Runs `query` with `core` locked, or returns `None` without touching
    /// the lock when a render owns the instance.
    fn with_idle_core<R>(&self, query: impl FnOnce(&mut InstanceCore) -> R) -> Option<R> {
        self.owner
            .compare_exchange(OWNER_FREE, OWNER_QUERY, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        let _claim = QueryClaim(&self.owner);
        let mut core = self.core.lock();
        Some(query(&mut core))
    }

    pub(crate) fn cpu_usage(&self) -> f32 {
        self.cpu.load(Ordering::Relaxed)
    }

    fn record_cpu(&self, fraction: f32) {
        let previous = self.cpu.load(Ordering::Relaxed);
        let smoothed = previous + (fraction - previous) * CPU_SMOOTHING;
        self.cpu.store(smoothed, Ordering::Relaxed);
    }

    pub(crate) fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Claims the instance for a render or an unload. Waits out a query in
    /// flight; fails if a render already holds it.
    pub(crate) fn try_lease(&self) -> bool {
        loop {
            match self.owner.compare_exchange(
                OWNER_FREE,
                OWNER_RENDER,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(OWNER_QUERY) => thread::yield_now(),
                Err(_) => return false,
            }
        }
    }

    pub(crate) fn release_lease(&self) {
        self.owner.store(OWNER_FREE, Ordering::Release);
    }
}

/// Instance brought up for one render because the shared one was activated
/// for another sample rate or a smaller block size.
struct PrivateCopy {
    core: InstanceCore,
    activation: ActivationConfig,
    latency: u32,
}

impl PrivateCopy {
    fn fits(&self, sample_rate: f64, max_block: usize) -> bool {
        self.activation.sample_rate == sample_rate
            && max_block <= self.activation.max_block_size as usize
    }
}

/// Exclusive right to drive one instance through a render.
///
/// At most one lease exists per instance, so two renders can never share a
/// live native handle. Dropping the lease returns the instance to `Active`
/// and releases it.
pub struct InstanceLease {
    record: Arc<InstanceRecord>,
    diagnostics: Diagnostics,
    initialize_attempts: u32,
    private: Option<PrivateCopy>,
    sample_rate: f64,
    prepared: bool,
}

impl InstanceLease {
    pub(crate) fn new(
        record: Arc<InstanceRecord>,
        diagnostics: Diagnostics,
        initialize_attempts: u32,
    ) -> Self {
        Self {
            record,
            diagnostics,
            initialize_attempts,
            private: None,
            sample_rate: 0.0,
            prepared: false,
        }
    }

    pub fn id(&self) -> InstanceId {
        self.record.id
    }

    pub fn descriptor(&self) -> &PluginDescriptor {
        &self.record.descriptor
    }

    pub fn latency(&self) -> u32 {
        self.private
            .as_ref()
            .map_or_else(|| self.record.latency(), |private| private.latency)
    }

    pub fn is_degraded(&self) -> bool {
        self.record.is_degraded()
    }

    /// Whether this render drives a private copy instead of the shared
    /// instance.
    pub fn runs_private_copy(&self) -> bool {
        self.private.is_some()
    }

    /// Puts the instance into `Processing` with cleared DSP state.
    ///
    /// When the shared instance was activated for another sample rate or a
    /// smaller block, a private copy with the same parameter values is
    /// activated for this render instead and released with the lease. Fails
    /// with [`HostError::SampleRateUnsupported`] only if the plugin refuses
    /// to activate at `sample_rate`.
    pub fn prepare(&mut self, sample_rate: f64, max_block: usize) -> Result<(), HostError> {
        let shared = self.record.activation;
        let shared_fits =
            shared.sample_rate == sample_rate && max_block <= shared.max_block_size as usize;
        if shared_fits {
            self.release_private();
        } else if !self
            .private
            .as_ref()
            .is_some_and(|private| private.fits(sample_rate, max_block))
        {
            self.release_private();
            self.private = Some(self.instantiate_private(sample_rate, max_block)?);
        }

        self.with_core(|binding, id, core| {
            let handle = core.handle(id)?;
            if handle.state() == PluginState::Processing {
                binding.stop_processing(handle)?;
            }
            binding.reset(handle)?;
            if !binding.start_processing(handle)? {
                return Err(HostError::Refused("start processing"));
            }
            Ok(())
        })?;
        self.record.degraded.store(false, Ordering::Relaxed);
        self.sample_rate = sample_rate;
        self.prepared = true;
        Ok(())
    }

    fn instantiate_private(
        &self,
        sample_rate: f64,
        max_block: usize,
    ) -> Result<PrivateCopy, HostError> {
        let record = &*self.record;
        let shared = record.activation;
        let max_block = u32::try_from(max_block).unwrap_or(u32::MAX);
        let activation = ActivationConfig {
            sample_rate,
            min_block_size: shared.min_block_size.min(max_block).max(1),
            max_block_size: shared.max_block_size.max(max_block),
        };
        let binding = record.binding.as_ref();
        let descriptor = &record.descriptor;
        let handle = binding.load_plugin(&descriptor.binary_path, descriptor.entry_index)?;
        let mut handle = match bring_up(binding, handle, activation, self.initialize_attempts) {
            Ok(handle) => handle,
            Err(HostError::Refused("activate")) if sample_rate != shared.sample_rate => {
                return Err(HostError::SampleRateUnsupported {
                    active: shared.sample_rate,
                    requested: sample_rate,
                })
            }
            Err(HostError::Refused("activate")) => {
                return Err(HostError::BlockSizeUnsupported {
                    max: shared.max_block_size,
                    requested: max_block as usize,
                })
            }
            Err(err) => return Err(err),
        };
        let latency = match copy_parameters(record, &mut handle) {
            Ok(latency) => latency,
            Err(err) => {
                if let Err(teardown) = shut_down(binding, handle) {
                    tracing::error!("failed to release private copy of {}: {teardown}", record.id);
                }
                return Err(err);
            }
        };
        tracing::info!(
            "{} ({}) runs as a private copy at {sample_rate} Hz for this render",
            record.id,
            record.descriptor
        );
        Ok(PrivateCopy {
            core: InstanceCore::new(handle, record.params.len()),
            activation,
            latency,
        })
    }

    fn release_private(&mut self) {
        let Some(mut private) = self.private.take() else {
            return;
        };
        let record = &*self.record;
        if let Some(handle) = private.core.handle.take() {
            if let Err(err) = shut_down(record.binding.as_ref(), handle) {
                tracing::error!("failed to release private copy of {}: {err}", record.id);
            }
        }
        // Writes applied to the copy count as applied for the shared handle too.
        let mut core = record.core.lock();
        if let Some(handle) = core.handle.as_mut() {
            match copy_parameters(record, handle) {
                Ok(latency) => record.latency.store(latency, Ordering::Relaxed),
                Err(err) => tracing::warn!("could not sync parameters of {}: {err}", record.id),
            }
        }
    }

    /// Control-path access to whichever core this lease drives.
    fn with_core<R>(
        &mut self,
        drive: impl FnOnce(
            &dyn PluginBinding,
            InstanceId,
            &mut InstanceCore,
        ) -> Result<R, HostError>,
    ) -> Result<R, HostError> {
        let record = &*self.record;
        match self.private.as_mut() {
            Some(private) => drive(record.binding.as_ref(), record.id, &mut private.core),
            None => {
                let mut core = record.core.lock();
                let result = drive(record.binding.as_ref(), record.id, &mut core);
                record.publish_state(&core);
                result
            }
        }
    }

    /// Runs one block. Pending parameter writes are delivered first.
    ///
    /// Never allocates. Output is validated here: a wrong frame count or
    /// non-finite samples come back as a [`ProcessingAnomaly`] and the
    /// caller must not use `output`.
    pub fn process(
        &mut self,
        input: &AudioBuffer,
        output: &mut AudioBuffer,
        frames: usize,
    ) -> Result<(), ProcessingAnomaly> {
        let record = &*self.record;
        let diagnostics = &self.diagnostics;
        let mut shared = None;
        let core: &mut InstanceCore = match self.private.as_mut() {
            Some(private) => &mut private.core,
            // The lease keeps control-path queries off `core`, so a miss
            // here means someone bypassed it.
            None => match record.core.try_lock() {
                Some(guard) => &mut **shared.insert(guard),
                None => {
                    return Err(report(diagnostics, record.id, ProcessingAnomaly::Contended))
                }
            },
        };
        let InstanceCore { handle, events } = core;
        let Some(handle) = handle.as_mut() else {
            return Err(report(diagnostics, record.id, ProcessingAnomaly::Failed));
        };
        record.params.apply_pending(events);

        let started = Instant::now();
        let result = record.binding.process(handle, input, output, frames, events);
        let elapsed = started.elapsed().as_secs_f32();
        drop(shared);

        if frames > 0 && self.sample_rate > 0.0 {
            let block_seconds = frames as f32 / self.sample_rate as f32;
            record.record_cpu(elapsed / block_seconds);
        }

        match result {
            Ok(ProcessStatus::Error) => {
                return Err(report(diagnostics, record.id, ProcessingAnomaly::Failed))
            }
            Err(err) => {
                tracing::warn!("{} failed to process: {err}", record.id);
                return Err(report(diagnostics, record.id, ProcessingAnomaly::Failed));
            }
            Ok(_) => {}
        }
        if output.frames() != frames {
            let anomaly = ProcessingAnomaly::FrameMismatch {
                expected: frames,
                actual: output.frames(),
            };
            return Err(report(diagnostics, record.id, anomaly));
        }
        if !output.is_finite() {
            return Err(report(diagnostics, record.id, ProcessingAnomaly::NonFinite));
        }
        Ok(())
    }

    /// Flags the instance as degraded for the rest of this render.
    pub fn mark_degraded(&self) {
        if !self.record.degraded.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                "plugin instance {} ({}) degraded, bypassing it",
                self.record.id,
                self.record.descriptor
            );
            self.diagnostics.emit(HostDiagnostic::Degraded {
                instance: self.record.id,
            });
        }
    }

    /// Returns the instance to `Active` so it stays reusable. A private copy
    /// is released instead.
    pub fn finish(&mut self) -> Result<(), HostError> {
        if !self.prepared {
            return Ok(());
        }
        self.prepared = false;
        if self.private.is_some() {
            self.release_private();
            return Ok(());
        }
        self.with_core(|binding, id, core| {
            let handle = core.handle(id)?;
            if handle.state() == PluginState::Processing {
                binding.stop_processing(handle)?;
            }
            Ok(())
        })
    }
}

fn report(
    diagnostics: &Diagnostics,
    instance: InstanceId,
    anomaly: ProcessingAnomaly,
) -> ProcessingAnomaly {
    diagnostics.emit(HostDiagnostic::Anomaly { instance, anomaly });
    anomaly
}

/// Pushes the table's applied values into `handle` and returns its latency.
fn copy_parameters(record: &InstanceRecord, handle: &mut NativeHandle) -> Result<u32, HostError> {
    for index in 0..record.params.len() as u32 {
        let value = record.params.applied_value(index)?;
        record.binding.set_parameter_value(handle, index, value)?;
    }
    record.binding.latency(handle)
}

impl fmt::Debug for InstanceLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceLease")
            .field("instance", &self.record.id)
            .field("prepared", &self.prepared)
            .finish()
    }
}

impl Drop for InstanceLease {
    fn drop(&mut self) {
        if let Err(err) = self.finish() {
            tracing::error!("failed to stop processing on {}: {err}", self.record.id);
        }
        self.release_private();
        self.record.release_lease();
    }
}
