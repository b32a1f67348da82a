//! In-process plugin doubles.
//!
//! [`FakeBinding`] implements [`PluginBinding`] with the same handle and
//! lifecycle rules as the native bindings, but the "binaries" are entries
//! installed under a path at runtime. Tests and benchmarks use it to drive the
//! instance manager and render pipeline without plugins on disk.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use harmoniq_plugin_registry::{ParameterDef, PluginCategory, PluginDescriptor, PluginFormat};
use parking_lot::Mutex;

use crate::audio_buffer::AudioBuffer;
use crate::binding::{
    ActivationConfig, HandleLedger, NativeHandle, ParamEvent, PluginBinding, ProcessStatus,
    UnloadRejected,
};
use crate::error::{HostError, LoadError, TransientLoadError};
use crate::lifecycle::LifecycleOp;

/// Signal processing performed by a fake plugin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FakeDsp {
    /// Multiplies by the `gain` parameter.
    Gain,
    /// `tanh(drive * x)`.
    SoftClip,
    /// Pure delay; reports the delay as latency.
    Delay { samples: u32 },
    /// Behaves like [`FakeDsp::Gain`] until `blocks` blocks were processed,
    /// then emits NaN.
    NanAfter { blocks: u32 },
    /// Passes audio through but reports one frame less than requested.
    Truncate,
    /// Passes audio through and reports its `lookahead` parameter, in
    /// samples, as latency.
    Lookahead { max: u32 },
}

impl FakeDsp {
    fn parameters(self) -> Vec<ParameterDef> {
        match self {
            FakeDsp::Gain | FakeDsp::NanAfter { .. } => {
                vec![ParameterDef::new(0, "gain", 0.0, 4.0, 1.0)]
            }
            FakeDsp::SoftClip => vec![ParameterDef::new(0, "drive", 0.1, 10.0, 1.0)],
            FakeDsp::Lookahead { max } => {
                vec![ParameterDef::new(0, "lookahead", 0.0, f64::from(max), 0.0)]
            }
            FakeDsp::Delay { .. } | FakeDsp::Truncate => Vec::new(),
        }
    }
}

/// Definition of one fake plugin entry.
#[derive(Debug)]
pub struct FakePlugin {
    pub id: String,
    pub name: String,
    pub dsp: FakeDsp,
    pub latency: u32,
    /// Number of `initialize` calls each new instance refuses before
    /// succeeding.
    pub fail_initialize_times: u32,
    /// Sample rates `activate` accepts; empty accepts everything.
    pub sample_rates: Vec<f64>,
    transient_failures: AtomicU32,
}

impl FakePlugin {
    pub fn new(id: impl Into<String>, dsp: FakeDsp) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            dsp,
            latency: 0,
            fail_initialize_times: 0,
            sample_rates: Vec::new(),
            transient_failures: AtomicU32::new(0),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_latency(mut self, samples: u32) -> Self {
        self.latency = samples;
        self
    }

    pub fn failing_initialize(mut self, times: u32) -> Self {
        self.fail_initialize_times = times;
        self
    }

    pub fn with_sample_rates(mut self, rates: impl IntoIterator<Item = f64>) -> Self {
        self.sample_rates = rates.into_iter().collect();
        self
    }

    /// The next `times` loads fail with a [`TransientLoadError`].
    pub fn with_transient_failures(self, times: u32) -> Self {
        self.transient_failures.store(times, Ordering::SeqCst);
        self
    }

    fn reported_latency(&self) -> u32 {
        match self.dsp {
            FakeDsp::Delay { samples } => samples,
            _ => self.latency,
        }
    }

    fn descriptor(&self, path: &Path, entry_index: u32) -> PluginDescriptor {
        PluginDescriptor::new(
            self.id.clone(),
            self.name.clone(),
            "Harmoniq Test Fixtures",
            PluginFormat::Clap,
            path,
        )
        .with_entry_index(entry_index)
        .with_category(PluginCategory::Effect)
        .with_io(2, 2)
        .with_parameters(self.dsp.parameters())
        .with_latency(self.reported_latency())
        .with_version("1.0.0")
    }
}

struct FakeSlot {
    plugin: Arc<FakePlugin>,
    descriptor: PluginDescriptor,
    params: Vec<f64>,
    initialize_refusals: u32,
    delay_lines: Vec<Vec<f32>>,
    delay_pos: usize,
    blocks: u32,
}

impl FakeSlot {
    fn param(&self, index: usize) -> f64 {
        self.params.get(index).copied().unwrap_or(1.0)
    }
}

/// Binding whose plugins live in memory.
#[derive(Debug, Default)]
pub struct FakeBinding {
    plugins: Mutex<HashMap<PathBuf, Vec<Arc<FakePlugin>>>>,
    ledger: HandleLedger,
}

impl FakeBinding {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `plugin` as the next entry of the binary at `path` and
    /// returns its descriptor.
    pub fn install(&self, path: impl Into<PathBuf>, plugin: FakePlugin) -> PluginDescriptor {
        let path = path.into();
        let mut plugins = self.plugins.lock();
        let entries = plugins.entry(path.clone()).or_default();
        let descriptor = plugin.descriptor(&path, entries.len() as u32);
        entries.push(Arc::new(plugin));
        descriptor
    }

    fn entry(&self, path: &Path, entry_index: u32) -> Result<Arc<FakePlugin>, HostError> {
        let plugins = self.plugins.lock();
        let entries = plugins
            .get(path)
            .ok_or_else(|| LoadError::MissingBinary(path.to_path_buf()))?;
        entries.get(entry_index as usize).cloned().ok_or_else(|| {
            LoadError::EntryOutOfRange {
                path: path.to_path_buf(),
                index: entry_index,
                count: entries.len() as u32,
            }
            .into()
        })
    }
}

const FORMAT: PluginFormat = PluginFormat::Clap;

impl PluginBinding for FakeBinding {
    fn format(&self) -> PluginFormat {
        FORMAT
    }

    fn entry_count(&self, path: &Path) -> Result<u32, HostError> {
        self.plugins
            .lock()
            .get(path)
            .map(|entries| entries.len() as u32)
            .ok_or_else(|| LoadError::MissingBinary(path.to_path_buf()).into())
    }

    fn load_plugin(&self, path: &Path, entry_index: u32) -> Result<NativeHandle, HostError> {
        let plugin = self.entry(path, entry_index)?;
        let remaining = plugin.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            plugin.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(TransientLoadError {
                path: path.to_path_buf(),
                source: io::Error::new(io::ErrorKind::WouldBlock, "binary is locked"),
            }
            .into());
        }
        let descriptor = plugin.descriptor(path, entry_index);
        let params = descriptor
            .parameter_defs
            .iter()
            .map(|def| def.default)
            .collect();
        let slot = FakeSlot {
            initialize_refusals: plugin.fail_initialize_times,
            plugin,
            descriptor,
            params,
            delay_lines: Vec::new(),
            delay_pos: 0,
            blocks: 0,
        };
        Ok(NativeHandle::new(self.ledger.issue(), FORMAT, slot))
    }

    fn get_descriptor(&self, handle: &NativeHandle) -> Result<PluginDescriptor, HostError> {
        Ok(handle.slot::<FakeSlot>(FORMAT)?.descriptor.clone())
    }

    fn initialize(&self, handle: &mut NativeHandle) -> Result<bool, HostError> {
        let next = handle.check(LifecycleOp::Initialize)?;
        let slot = handle.slot_mut::<FakeSlot>(FORMAT)?;
        if slot.initialize_refusals > 0 {
            slot.initialize_refusals -= 1;
            return Ok(false);
        }
        handle.commit(next);
        Ok(true)
    }

    fn activate(
        &self,
        handle: &mut NativeHandle,
        config: ActivationConfig,
    ) -> Result<bool, HostError> {
        let next = handle.check(LifecycleOp::Activate)?;
        let slot = handle.slot_mut::<FakeSlot>(FORMAT)?;
        let rates = &slot.plugin.sample_rates;
        if !rates.is_empty() && !rates.iter().any(|rate| *rate == config.sample_rate) {
            return Ok(false);
        }
        if let FakeDsp::Delay { samples } = slot.plugin.dsp {
            let len = samples.max(1) as usize;
            slot.delay_lines = vec![vec![0.0; len]; 2];
            slot.delay_pos = 0;
        }
        handle.commit(next);
        Ok(true)
    }

    fn deactivate(&self, handle: &mut NativeHandle) -> Result<(), HostError> {
        let next = handle.check(LifecycleOp::Deactivate)?;
        handle.commit(next);
        Ok(())
    }

    fn start_processing(&self, handle: &mut NativeHandle) -> Result<bool, HostError> {
        let next = handle.check(LifecycleOp::StartProcessing)?;
        handle.commit(next);
        Ok(true)
    }

    fn stop_processing(&self, handle: &mut NativeHandle) -> Result<(), HostError> {
        let next = handle.check(LifecycleOp::StopProcessing)?;
        handle.commit(next);
        Ok(())
    }

    fn reset(&self, handle: &mut NativeHandle) -> Result<(), HostError> {
        handle.check(LifecycleOp::Reset)?;
        let slot = handle.slot_mut::<FakeSlot>(FORMAT)?;
        for line in &mut slot.delay_lines {
            line.fill(0.0);
        }
        slot.delay_pos = 0;
        slot.blocks = 0;
        Ok(())
    }

    fn process(
        &self,
        handle: &mut NativeHandle,
        inputs: &AudioBuffer,
        outputs: &mut AudioBuffer,
        frames: usize,
        events: &[ParamEvent],
    ) -> Result<ProcessStatus, HostError> {
        handle.check(LifecycleOp::Process)?;
        let slot = handle.slot_mut::<FakeSlot>(FORMAT)?;
        for event in events {
            if let Some(param) = slot.params.get_mut(event.index as usize) {
                *param = event.value;
            }
        }
        outputs.set_frames(frames);
        let frames = frames.min(inputs.frames()).min(outputs.frames());
        let channels = inputs.channels().min(outputs.channels());

        match slot.plugin.dsp {
            FakeDsp::Gain | FakeDsp::NanAfter { .. } => {
                let gain = slot.param(0) as f32;
                let poisoned = matches!(slot.plugin.dsp, FakeDsp::NanAfter { blocks } if slot.blocks >= blocks);
                for channel in 0..channels {
                    let input = &inputs.channel(channel)[..frames];
                    let output = &mut outputs.channel_mut(channel)[..frames];
                    for (out, sample) in output.iter_mut().zip(input) {
                        *out = if poisoned { f32::NAN } else { sample * gain };
                    }
                }
            }
            FakeDsp::SoftClip => {
                let drive = slot.param(0) as f32;
                for channel in 0..channels {
                    let input = &inputs.channel(channel)[..frames];
                    let output = &mut outputs.channel_mut(channel)[..frames];
                    for (out, sample) in output.iter_mut().zip(input) {
                        *out = (sample * drive).tanh();
                    }
                }
            }
            FakeDsp::Delay { samples } => {
                let len = slot.delay_lines.first().map_or(0, Vec::len);
                let start = slot.delay_pos;
                for channel in 0..channels.min(slot.delay_lines.len()) {
                    let line = &mut slot.delay_lines[channel];
                    let input = &inputs.channel(channel)[..frames];
                    let output = &mut outputs.channel_mut(channel)[..frames];
                    let mut pos = start;
                    for (out, sample) in output.iter_mut().zip(input) {
                        if samples == 0 {
                            *out = *sample;
                        } else {
                            *out = line[pos];
                            line[pos] = *sample;
                            pos = (pos + 1) % len;
                        }
                    }
                }
                if len > 0 {
                    slot.delay_pos = (start + frames) % len;
                }
            }
            FakeDsp::Truncate => {
                for channel in 0..channels {
                    let input = &inputs.channel(channel)[..frames];
                    outputs.channel_mut(channel)[..frames].copy_from_slice(input);
                }
                outputs.set_frames(frames.saturating_sub(1));
            }
            FakeDsp::Lookahead { .. } => {
                for channel in 0..channels {
                    let input = &inputs.channel(channel)[..frames];
                    outputs.channel_mut(channel)[..frames].copy_from_slice(input);
                }
            }
        }
        slot.blocks = slot.blocks.saturating_add(1);
        Ok(ProcessStatus::Continue)
    }

    fn parameter_count(&self, handle: &NativeHandle) -> Result<u32, HostError> {
        Ok(handle.slot::<FakeSlot>(FORMAT)?.params.len() as u32)
    }

    fn parameter_info(&self, handle: &NativeHandle, index: u32) -> Result<ParameterDef, HostError> {
        let slot = handle.slot::<FakeSlot>(FORMAT)?;
        slot.descriptor
            .parameter(index)
            .cloned()
            .ok_or(HostError::ParameterIndex {
                index,
                count: slot.params.len() as u32,
            })
    }

    fn parameter_value(&self, handle: &NativeHandle, index: u32) -> Result<f64, HostError> {
        let slot = handle.slot::<FakeSlot>(FORMAT)?;
        slot.params
            .get(index as usize)
            .copied()
            .ok_or(HostError::ParameterIndex {
                index,
                count: slot.params.len() as u32,
            })
    }

    fn set_parameter_value(
        &self,
        handle: &mut NativeHandle,
        index: u32,
        value: f64,
    ) -> Result<(), HostError> {
        if !value.is_finite() {
            return Err(HostError::NonFiniteValue(value));
        }
        let slot = handle.slot_mut::<FakeSlot>(FORMAT)?;
        let count = slot.params.len() as u32;
        let def = slot
            .descriptor
            .parameter(index)
            .ok_or(HostError::ParameterIndex { index, count })?;
        let value = def.clamp(value);
        slot.params[index as usize] = value;
        Ok(())
    }

    fn latency(&self, handle: &NativeHandle) -> Result<u32, HostError> {
        let slot = handle.slot::<FakeSlot>(FORMAT)?;
        Ok(match slot.plugin.dsp {
            FakeDsp::Lookahead { .. } => slot.param(0).round() as u32,
            _ => slot.plugin.reported_latency(),
        })
    }

    fn unload_plugin(&self, handle: NativeHandle) -> Result<(), UnloadRejected> {
        if let Err(err) = handle.check_release() {
            return Err(UnloadRejected {
                error: err.into(),
                handle,
            });
        }
        match handle.take_slot::<FakeSlot>(FORMAT) {
            Ok(_) => {
                self.ledger.release();
                Ok(())
            }
            Err(handle) => Err(UnloadRejected {
                error: HostError::FormatMismatch {
                    expected: FORMAT,
                    found: handle.format(),
                },
                handle,
            }),
        }
    }

    fn outstanding_handles(&self) -> usize {
        self.ledger.outstanding()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::{bring_up, shut_down};
    use crate::lifecycle::PluginState;

    fn binding_with(plugin: FakePlugin) -> (FakeBinding, PluginDescriptor) {
        let binding = FakeBinding::new();
        let descriptor = binding.install("/fake/test.clap", plugin);
        (binding, descriptor)
    }

    #[test]
    fn rejected_initialize_leaves_handle_loaded() {
        let (binding, descriptor) =
            binding_with(FakePlugin::new("fake.gain", FakeDsp::Gain).failing_initialize(1));
        let mut handle = binding.load_plugin(&descriptor.binary_path, 0).unwrap();
        assert!(!binding.initialize(&mut handle).unwrap());
        assert_eq!(handle.state(), PluginState::Loaded);
        assert!(binding.initialize(&mut handle).unwrap());
        assert_eq!(handle.state(), PluginState::Initialized);
        let rejected = binding.unload_plugin(handle).unwrap_err();
        assert!(matches!(rejected.error, HostError::State(_)));
        let mut handle = rejected.handle;
        assert!(binding
            .activate(&mut handle, ActivationConfig::default())
            .unwrap());
        shut_down(&binding, handle).unwrap();
        assert_eq!(binding.outstanding_handles(), 0);
    }

    #[test]
    fn refused_activation_still_releases_the_handle() {
        let (binding, descriptor) = binding_with(
            FakePlugin::new("fake.gain", FakeDsp::Gain).with_sample_rates([44_100.0]),
        );
        let handle = binding.load_plugin(&descriptor.binary_path, 0).unwrap();
        let err = bring_up(&binding, handle, ActivationConfig::default(), 1).unwrap_err();
        assert!(matches!(err, HostError::Refused("activate")));
        assert_eq!(binding.outstanding_handles(), 0);
    }

    #[test]
    fn out_of_order_calls_fail_without_side_effects() {
        let (binding, descriptor) = binding_with(FakePlugin::new("fake.gain", FakeDsp::Gain));
        let mut handle = binding.load_plugin(&descriptor.binary_path, 0).unwrap();
        let input = AudioBuffer::new(2, 16);
        let mut output = AudioBuffer::new(2, 16);
        let err = binding
            .process(&mut handle, &input, &mut output, 16, &[])
            .unwrap_err();
        assert!(matches!(err, HostError::State(_)));
        assert_eq!(handle.state(), PluginState::Loaded);

        let handle = bring_up(&binding, handle, ActivationConfig::default(), 1).unwrap();
        let rejected = binding.unload_plugin(handle).unwrap_err();
        assert!(matches!(rejected.error, HostError::State(_)));
        assert_eq!(rejected.handle.state(), PluginState::Active);
        shut_down(&binding, rejected.handle).unwrap();
        assert_eq!(binding.outstanding_handles(), 0);
    }

    #[test]
    fn delay_reports_latency_and_delays_signal() {
        let (binding, descriptor) =
            binding_with(FakePlugin::new("fake.delay", FakeDsp::Delay { samples: 3 }));
        let handle = binding.load_plugin(&descriptor.binary_path, 0).unwrap();
        let mut handle = bring_up(&binding, handle, ActivationConfig::default(), 1).unwrap();
        assert_eq!(binding.latency(&handle).unwrap(), 3);
        assert!(binding.start_processing(&mut handle).unwrap());

        let mut input = AudioBuffer::new(2, 8);
        input.channel_mut(0)[0] = 1.0;
        let mut output = AudioBuffer::new(2, 8);
        binding
            .process(&mut handle, &input, &mut output, 8, &[])
            .unwrap();
        assert_eq!(output.channel(0)[3], 1.0);
        assert_eq!(output.channel(0)[0], 0.0);

        binding.stop_processing(&mut handle).unwrap();
        shut_down(&binding, handle).unwrap();
    }

    #[test]
    fn transient_failures_run_out() {
        let (binding, descriptor) = binding_with(
            FakePlugin::new("fake.gain", FakeDsp::Gain).with_transient_failures(1),
        );
        let err = binding.load_plugin(&descriptor.binary_path, 0).unwrap_err();
        assert!(err.is_retryable());
        let handle = binding.load_plugin(&descriptor.binary_path, 0).unwrap();
        binding.unload_plugin(handle).unwrap();
    }
}
