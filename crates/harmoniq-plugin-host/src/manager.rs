use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use arc_swap::ArcSwap;
use crossbeam_channel::Receiver;
use harmoniq_plugin_registry::{ParameterDef, PluginDescriptor, PluginFormat, Registry};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::binding::{bring_up, ActivationConfig, NativeHandle, PluginBinding};
use crate::chain::{ChainId, PluginChain};
use crate::config::HostConfig;
use crate::diagnostics::{Diagnostics, HostDiagnostic};
use crate::error::{HostError, LoadError};
use crate::instance::{InstanceId, InstanceLease, InstanceRecord};
use crate::lifecycle::{LifecycleOp, PluginState, StateError};
use crate::prober::probe_binary;

/// Aggregate view over every live instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HostStats {
    pub total_instances: usize,
    /// Distinct plugins (descriptor ids) with at least one instance.
    pub loaded_plugins: usize,
    pub total_cpu_usage: f32,
    pub total_latency: u64,
    pub by_format: BTreeMap<PluginFormat, usize>,
}

#[derive(Default)]
struct Topology {
    chains: BTreeMap<ChainId, Arc<ArcSwap<PluginChain>>>,
    membership: HashMap<InstanceId, ChainId>,
}

/// Central owner of plugin instances and chain topology.
///
/// All methods are control-path operations: they may block, allocate and
/// talk to native code. The processing path only ever touches an
/// [`InstanceLease`].
pub struct InstanceManager {
    registry: Arc<Registry>,
    bindings: HashMap<PluginFormat, Arc<dyn PluginBinding>>,
    config: HostConfig,
    instances: RwLock<BTreeMap<InstanceId, Arc<InstanceRecord>>>,
    retired: Mutex<BTreeSet<InstanceId>>,
    topology: Mutex<Topology>,
    diagnostics: Diagnostics,
    next_instance: AtomicU64,
    next_chain: AtomicU64,
}

impl InstanceManager {
    /// Manager over the native bindings compiled into this build.
    pub fn new(registry: Arc<Registry>, config: HostConfig) -> Self {
        let mut manager = Self::empty(registry, config);
        for binding in crate::formats::native_bindings() {
            manager = manager.with_binding(binding);
        }
        manager
    }

    /// Manager without any binding; add them with [`Self::with_binding`].
    pub fn empty(registry: Arc<Registry>, config: HostConfig) -> Self {
        let diagnostics = Diagnostics::new(config.diagnostics_capacity);
        Self {
            registry,
            bindings: HashMap::new(),
            config,
            instances: RwLock::new(BTreeMap::new()),
            retired: Mutex::new(BTreeSet::new()),
            topology: Mutex::new(Topology::default()),
            diagnostics,
            next_instance: AtomicU64::new(1),
            next_chain: AtomicU64::new(1),
        }
    }

    /// Installs `binding` for its format, replacing any previous one.
    pub fn with_binding(mut self, binding: Arc<dyn PluginBinding>) -> Self {
        self.bindings.insert(binding.format(), binding);
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn diagnostics(&self) -> Receiver<HostDiagnostic> {
        self.diagnostics.receiver()
    }

    fn binding_for(&self, format: PluginFormat) -> Result<Arc<dyn PluginBinding>, HostError> {
        self.bindings
            .get(&format)
            .cloned()
            .ok_or(HostError::NoBinding(format))
    }

    fn record(&self, id: InstanceId) -> Result<Arc<InstanceRecord>, HostError> {
        self.instances
            .read()
            .get(&id)
            .cloned()
            .ok_or(HostError::UnknownInstance(id))
    }

    // ---- loading -------------------------------------------------------

    pub fn load_plugin(&self, descriptor: &PluginDescriptor) -> Result<InstanceId, HostError> {
        self.load_plugin_with(descriptor, self.config.activation)
    }

    /// Loads, initializes and activates an instance of `descriptor`.
    pub fn load_plugin_with(
        &self,
        descriptor: &PluginDescriptor,
        activation: ActivationConfig,
    ) -> Result<InstanceId, HostError> {
        let binding = self.binding_for(descriptor.format)?;
        let handle = self.load_with_retry(binding.as_ref(), descriptor)?;
        let handle = bring_up(
            binding.as_ref(),
            handle,
            activation,
            self.config.initialize_attempts,
        )?;

        let (runtime, latency) = match self.runtime_details(binding.as_ref(), &handle) {
            Ok(details) => details,
            Err(err) => {
                if let Err(teardown) = crate::binding::shut_down(binding.as_ref(), handle) {
                    tracing::error!("failed to tear down {}: {teardown}", descriptor.id);
                }
                return Err(err);
            }
        };
        // The binary is the authority on its parameters once initialized.
        let mut runtime_descriptor = descriptor.clone();
        if !runtime.parameter_defs.is_empty() || descriptor.parameter_defs.is_empty() {
            runtime_descriptor.parameter_defs = runtime.parameter_defs;
        }
        runtime_descriptor.audio_inputs = runtime.audio_inputs;
        runtime_descriptor.audio_outputs = runtime.audio_outputs;

        let id = InstanceId::from_raw(self.next_instance.fetch_add(1, Ordering::Relaxed));
        let record = InstanceRecord::new(
            id,
            Arc::new(runtime_descriptor),
            binding,
            handle,
            activation,
            latency,
        );
        tracing::info!(
            "loaded plugin instance {id}: {} at {} Hz, latency {latency}",
            record.descriptor,
            activation.sample_rate
        );
        self.instances.write().insert(id, Arc::new(record));
        Ok(id)
    }

    fn runtime_details(
        &self,
        binding: &dyn PluginBinding,
        handle: &NativeHandle,
    ) -> Result<(PluginDescriptor, u32), HostError> {
        Ok((binding.get_descriptor(handle)?, binding.latency(handle)?))
    }

    fn load_with_retry(
        &self,
        binding: &dyn PluginBinding,
        descriptor: &PluginDescriptor,
    ) -> Result<NativeHandle, HostError> {
        let policy = &self.config.retry;
        let attempts = policy.attempts.max(1);
        let mut retry = 0;
        loop {
            match binding.load_plugin(&descriptor.binary_path, descriptor.entry_index) {
                Ok(handle) => return Ok(handle),
                Err(err) if err.is_retryable() && retry + 1 < attempts => {
                    let delay = policy.backoff(retry);
                    retry += 1;
                    tracing::warn!(
                        "transient failure loading {} (attempt {retry}/{attempts}): {err}; retrying in {delay:?}",
                        descriptor.binary_path.display()
                    );
                    self.diagnostics.emit(HostDiagnostic::LoadRetry {
                        path: descriptor.binary_path.clone(),
                        attempt: retry,
                        delay_ms: delay.as_millis() as u64,
                    });
                    thread::sleep(delay);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Loads the registry entry with plugin id `id`.
    pub fn load_plugin_by_id(&self, id: &str) -> Result<InstanceId, HostError> {
        let descriptor = self.registry.require(id)?;
        self.load_plugin(&descriptor)
    }

    /// Loads the first entry of the binary at `path`, probing and caching its
    /// descriptors when the registry has not seen it yet.
    pub fn load_plugin_path(&self, path: &Path) -> Result<InstanceId, HostError> {
        if let Some(descriptor) = self.registry.find_by_path(path).into_iter().next() {
            return self.load_plugin(&descriptor);
        }
        let format = path
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(PluginFormat::from_extension)
            .ok_or_else(|| LoadError::InvalidBinary {
                path: path.to_path_buf(),
                format: PluginFormat::Clap,
                reason: "unrecognised plugin extension".into(),
            })?;
        let binding = self.binding_for(format)?;
        let descriptors = probe_binary(binding.as_ref(), path)?;
        let mut first = None;
        for descriptor in descriptors {
            let stored = self.registry.insert(descriptor)?;
            first.get_or_insert(stored);
        }
        let descriptor = first.ok_or_else(|| LoadError::EntryOutOfRange {
            path: path.to_path_buf(),
            index: 0,
            count: 0,
        })?;
        self.load_plugin(&descriptor)
    }

    /// Loads on a background thread so the caller's thread is never held up
    /// by native initialization.
    pub fn spawn_load(
        self: &Arc<Self>,
        descriptor: PluginDescriptor,
    ) -> thread::JoinHandle<Result<InstanceId, HostError>> {
        let manager = Arc::clone(self);
        thread::spawn(move || manager.load_plugin(&descriptor))
    }

    /// Fresh instance of the same plugin with the same parameter values,
    /// for renders that need isolated plugin state.
    pub fn duplicate_instance(&self, id: InstanceId) -> Result<InstanceId, HostError> {
        let source = self.record(id)?;
        let copy = self.load_plugin_with(&source.descriptor, source.activation)?;
        let target = self.record(copy)?;
        for (index, value) in source.params.values().into_iter().enumerate() {
            if (index as u32) < target.params.len() as u32 {
                target.params.write(index as u32, value)?;
            }
        }
        Ok(copy)
    }

    // ---- unloading -----------------------------------------------------

    /// Deactivates and unloads an instance, detaching it from its chain.
    ///
    /// A second unload of the same id is a [`StateError`].
    pub fn unload_plugin(&self, id: InstanceId) -> Result<(), HostError> {
        let record = match self.record(id) {
            Ok(record) => record,
            Err(err) => {
                if self.retired.lock().contains(&id) {
                    return Err(StateError {
                        operation: LifecycleOp::Unload,
                        state: PluginState::Unloaded,
                    }
                    .into());
                }
                return Err(err);
            }
        };
        if !record.try_lease() {
            return Err(HostError::Busy(id));
        }
        let result = self.tear_down(&record);
        if result.is_err() {
            record.release_lease();
            return result;
        }
        self.instances.write().remove(&id);
        self.retired.lock().insert(id);
        self.detach(id);
        tracing::info!("unloaded plugin instance {id}: {}", record.descriptor);
        result
    }

    fn tear_down(&self, record: &InstanceRecord) -> Result<(), HostError> {
        let binding = record.binding.as_ref();
        let mut core = record.core.lock();
        let stopped = core.handle(record.id).and_then(|handle| {
            if handle.state() == PluginState::Processing {
                binding.stop_processing(handle)?;
            }
            if handle.state() == PluginState::Active {
                binding.deactivate(handle)?;
            }
            Ok(())
        });
        if let Err(err) = stopped {
            record.publish_state(&core);
            return Err(err);
        }
        let Some(handle) = core.handle.take() else {
            return Err(HostError::UnknownInstance(record.id));
        };
        let result = match binding.unload_plugin(handle) {
            Ok(()) => Ok(()),
            Err(rejected) => {
                core.handle = Some(rejected.handle);
                Err(rejected.error)
            }
        };
        record.publish_state(&core);
        result
    }

    fn detach(&self, id: InstanceId) {
        let mut topology = self.topology.lock();
        if let Some(chain) = topology.membership.remove(&id) {
            if let Some(slot) = topology.chains.get(&chain) {
                let current = slot.load_full();
                let order = current
                    .instances()
                    .iter()
                    .copied()
                    .filter(|member| *member != id)
                    .collect();
                slot.store(Arc::new(self.rebuild(&current, order)));
            }
        }
    }

    /// Unloads every instance and drops every chain.
    pub fn shutdown(&self) -> Result<(), HostError> {
        let ids: Vec<_> = self.instances.read().keys().copied().collect();
        let mut first_error = None;
        for id in ids {
            if let Err(err) = self.unload_plugin(id) {
                tracing::error!("failed to unload {id} during shutdown: {err}");
                first_error.get_or_insert(err);
            }
        }
        let mut topology = self.topology.lock();
        topology.chains.clear();
        topology.membership.clear();
        first_error.map_or(Ok(()), Err)
    }

    // ---- instance queries ----------------------------------------------

    pub fn instance_ids(&self) -> Vec<InstanceId> {
        self.instances.read().keys().copied().collect()
    }

    pub fn instance_state(&self, id: InstanceId) -> Result<PluginState, HostError> {
        Ok(self.record(id)?.state())
    }

    pub fn instance_descriptor(&self, id: InstanceId) -> Result<Arc<PluginDescriptor>, HostError> {
        Ok(Arc::clone(&self.record(id)?.descriptor))
    }

    pub fn instance_latency(&self, id: InstanceId) -> Result<u32, HostError> {
        Ok(self.record(id)?.refresh_latency())
    }

    pub fn instance_cpu_usage(&self, id: InstanceId) -> Result<f32, HostError> {
        Ok(self.record(id)?.cpu_usage())
    }

    /// Whether the last render flagged the instance as producing bad output.
    pub fn is_degraded(&self, id: InstanceId) -> Result<bool, HostError> {
        Ok(self.record(id)?.is_degraded())
    }

    pub fn parameter_count(&self, id: InstanceId) -> Result<u32, HostError> {
        Ok(self.record(id)?.params.len() as u32)
    }

    pub fn parameter_info(&self, id: InstanceId, index: u32) -> Result<ParameterDef, HostError> {
        Ok(self.record(id)?.params.def(index)?.clone())
    }

    pub fn parameter_value(&self, id: InstanceId, index: u32) -> Result<f64, HostError> {
        self.record(id)?.params.value(index)
    }

    /// Queues a parameter change; it reaches the plugin at the start of the
    /// next processed block. Returns the clamped value.
    pub fn set_parameter_value(
        &self,
        id: InstanceId,
        index: u32,
        value: f64,
    ) -> Result<f64, HostError> {
        self.record(id)?.params.write(index, value)
    }

    /// Exclusive processing access for one render. Fails with
    /// [`HostError::Busy`] while another render holds the instance.
    pub fn acquire_render_lease(&self, id: InstanceId) -> Result<InstanceLease, HostError> {
        let record = self.record(id)?;
        if !record.try_lease() {
            return Err(HostError::Busy(id));
        }
        Ok(InstanceLease::new(
            record,
            self.diagnostics.clone(),
            self.config.initialize_attempts,
        ))
    }

    /// Native handles created and not yet released, across all bindings.
    pub fn outstanding_handles(&self) -> usize {
        self.bindings
            .values()
            .map(|binding| binding.outstanding_handles())
            .sum()
    }

    pub fn get_stats(&self) -> HostStats {
        let instances = self.instances.read();
        let mut stats = HostStats {
            total_instances: instances.len(),
            ..HostStats::default()
        };
        let mut plugins = BTreeSet::new();
        for record in instances.values() {
            plugins.insert(record.descriptor.id.as_str());
            stats.total_cpu_usage += record.cpu_usage();
            stats.total_latency += u64::from(record.latency());
            *stats.by_format.entry(record.descriptor.format).or_default() += 1;
        }
        stats.loaded_plugins = plugins.len();
        stats
    }

    // ---- chains --------------------------------------------------------

    pub fn create_chain(&self, name: impl Into<String>) -> ChainId {
        let id = ChainId::from_raw(self.next_chain.fetch_add(1, Ordering::Relaxed));
        let chain = PluginChain::new(id, name);
        self.topology
            .lock()
            .chains
            .insert(id, Arc::new(ArcSwap::from_pointee(chain)));
        id
    }

    /// Removes the chain. Its instances stay loaded and become unchained.
    pub fn destroy_chain(&self, chain: ChainId) -> Result<(), HostError> {
        let mut topology = self.topology.lock();
        let slot = topology
            .chains
            .remove(&chain)
            .ok_or(HostError::UnknownChain(chain))?;
        for instance in slot.load().instances() {
            topology.membership.remove(instance);
        }
        Ok(())
    }

    pub fn chain_ids(&self) -> Vec<ChainId> {
        self.topology.lock().chains.keys().copied().collect()
    }

    /// Current published order of `chain`. Later edits do not affect it.
    pub fn chain_snapshot(&self, chain: ChainId) -> Result<Arc<PluginChain>, HostError> {
        let topology = self.topology.lock();
        let slot = topology
            .chains
            .get(&chain)
            .ok_or(HostError::UnknownChain(chain))?;
        Ok(slot.load_full())
    }

    /// Chain that `instance` currently belongs to.
    pub fn chain_of(&self, instance: InstanceId) -> Option<ChainId> {
        self.topology.lock().membership.get(&instance).copied()
    }

    /// Inserts `instance` at `position` (appends when `None` or past the end).
    pub fn add_to_chain(
        &self,
        chain: ChainId,
        instance: InstanceId,
        position: Option<usize>,
    ) -> Result<(), HostError> {
        self.record(instance)?;
        let mut topology = self.topology.lock();
        let slot = Arc::clone(
            topology
                .chains
                .get(&chain)
                .ok_or(HostError::UnknownChain(chain))?,
        );
        if let Some(owner) = topology.membership.get(&instance) {
            return Err(HostError::AlreadyChained {
                instance,
                chain: *owner,
            });
        }
        let current = slot.load_full();
        let mut order = current.instances().to_vec();
        let position = position.unwrap_or(order.len()).min(order.len());
        order.insert(position, instance);
        slot.store(Arc::new(self.rebuild(&current, order)));
        topology.membership.insert(instance, chain);
        Ok(())
    }

    pub fn remove_from_chain(&self, chain: ChainId, instance: InstanceId) -> Result<(), HostError> {
        let mut topology = self.topology.lock();
        let slot = Arc::clone(
            topology
                .chains
                .get(&chain)
                .ok_or(HostError::UnknownChain(chain))?,
        );
        let current = slot.load_full();
        if !current.contains(instance) {
            return Err(HostError::NotInChain { instance, chain });
        }
        let order = current
            .instances()
            .iter()
            .copied()
            .filter(|member| *member != instance)
            .collect();
        slot.store(Arc::new(self.rebuild(&current, order)));
        topology.membership.remove(&instance);
        Ok(())
    }

    /// Replaces the order of `chain`; `order` must be a permutation of its
    /// current members.
    pub fn reorder_chain(&self, chain: ChainId, order: &[InstanceId]) -> Result<(), HostError> {
        let topology = self.topology.lock();
        let slot = topology
            .chains
            .get(&chain)
            .ok_or(HostError::UnknownChain(chain))?;
        let current = slot.load_full();
        if !current.is_permutation(order) {
            return Err(HostError::InvalidOrder(chain));
        }
        slot.store(Arc::new(self.rebuild(&current, order.to_vec())));
        Ok(())
    }

    /// New chain made of duplicates of every member of `chain`, in order.
    pub fn duplicate_chain(&self, chain: ChainId) -> Result<ChainId, HostError> {
        let source = self.chain_snapshot(chain)?;
        let mut copies = Vec::with_capacity(source.len());
        for instance in source.instances() {
            match self.duplicate_instance(*instance) {
                Ok(copy) => copies.push(copy),
                Err(err) => {
                    for copy in copies {
                        if let Err(cleanup) = self.unload_plugin(copy) {
                            tracing::error!("failed to unload duplicate {copy}: {cleanup}");
                        }
                    }
                    return Err(err);
                }
            }
        }
        let id = self.create_chain(format!("{} (copy)", source.name()));
        for copy in copies {
            self.add_to_chain(id, copy, None)?;
        }
        Ok(id)
    }

    pub fn get_chain_latency(&self, chain: ChainId) -> Result<u32, HostError> {
        Ok(self.chain_snapshot(chain)?.latency_samples())
    }

    pub fn get_chain_cpu_usage(&self, chain: ChainId) -> Result<f32, HostError> {
        Ok(self.chain_snapshot(chain)?.cpu_usage())
    }

    /// Re-queries member latencies and CPU figures and republishes the chain.
    pub fn refresh_chain_metrics(&self, chain: ChainId) -> Result<Arc<PluginChain>, HostError> {
        let topology = self.topology.lock();
        let slot = topology
            .chains
            .get(&chain)
            .ok_or(HostError::UnknownChain(chain))?;
        let current = slot.load_full();
        let refreshed = Arc::new(self.rebuild(&current, current.instances().to_vec()));
        slot.store(Arc::clone(&refreshed));
        Ok(refreshed)
    }

    fn rebuild(&self, chain: &PluginChain, order: Vec<InstanceId>) -> PluginChain {
        let instances = self.instances.read();
        let mut latency = 0u32;
        let mut cpu = 0.0f32;
        for id in &order {
            if let Some(record) = instances.get(id) {
                latency = latency.saturating_add(record.refresh_latency());
                cpu += record.cpu_usage();
            }
        }
        chain.with_order(order, latency, cpu)
    }
}

impl Drop for InstanceManager {
    fn drop(&mut self) {
        if !self.instances.get_mut().is_empty() {
            if let Err(err) = self.shutdown() {
                tracing::error!("plugin host shutdown incomplete: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::fake::{FakeBinding, FakeDsp, FakePlugin};

    fn manager() -> (InstanceManager, Arc<FakeBinding>) {
        let binding = Arc::new(FakeBinding::new());
        let config = HostConfig {
            retry: crate::config::RetryPolicy {
                attempts: 3,
                initial_backoff_ms: 1,
                multiplier: 1.0,
            },
            ..HostConfig::default()
        };
        let manager = InstanceManager::empty(Arc::new(Registry::new()), config)
            .with_binding(binding.clone());
        (manager, binding)
    }

    #[test]
    fn transient_load_failures_are_retried() {
        let (manager, binding) = manager();
        let descriptor = binding.install(
            "/fake/locked.clap",
            FakePlugin::new("fake.locked", FakeDsp::Gain).with_transient_failures(2),
        );
        let id = manager.load_plugin(&descriptor).unwrap();
        assert_eq!(manager.instance_state(id).unwrap(), PluginState::Active);
        let retries = manager
            .diagnostics()
            .try_iter()
            .filter(|d| matches!(d, HostDiagnostic::LoadRetry { .. }))
            .count();
        assert_eq!(retries, 2);
        manager.shutdown().unwrap();
        assert_eq!(binding.outstanding_handles(), 0);
    }

    #[test]
    fn retries_give_up_after_policy_attempts() {
        let (manager, binding) = manager();
        let descriptor = binding.install(
            "/fake/locked.clap",
            FakePlugin::new("fake.locked", FakeDsp::Gain).with_transient_failures(5),
        );
        let err = manager.load_plugin(&descriptor).unwrap_err();
        assert!(err.is_retryable());
        assert!(manager.instance_ids().is_empty());
    }

    #[test]
    fn refused_initialize_is_retried_up_to_the_configured_attempts() {
        let (manager, binding) = manager();
        let flaky = binding.install(
            "/fake/flaky.clap",
            FakePlugin::new("fake.flaky", FakeDsp::Gain).failing_initialize(1),
        );
        assert!(manager.load_plugin(&flaky).is_ok());

        let stubborn = binding.install(
            "/fake/stubborn.clap",
            FakePlugin::new("fake.stubborn", FakeDsp::Gain).failing_initialize(5),
        );
        let err = manager.load_plugin(&stubborn).unwrap_err();
        assert!(matches!(err, HostError::Refused("initialize")));
        manager.shutdown().unwrap();
        assert_eq!(binding.outstanding_handles(), 0);
    }

    #[test]
    fn leased_instances_cannot_be_unloaded_or_leased_twice() {
        let (manager, binding) = manager();
        let descriptor = binding.install("/fake/gain.clap", FakePlugin::new("fake.gain", FakeDsp::Gain));
        let id = manager.load_plugin(&descriptor).unwrap();
        let lease = manager.acquire_render_lease(id).unwrap();
        assert!(matches!(manager.acquire_render_lease(id), Err(HostError::Busy(_))));
        assert!(matches!(manager.unload_plugin(id), Err(HostError::Busy(_))));
        drop(lease);
        manager.unload_plugin(id).unwrap();
    }

    #[test]
    fn stats_group_by_format_and_plugin() {
        let (manager, binding) = manager();
        let gain = binding.install("/fake/gain.clap", FakePlugin::new("fake.gain", FakeDsp::Gain));
        let delay = binding.install(
            "/fake/delay.clap",
            FakePlugin::new("fake.delay", FakeDsp::Delay { samples: 32 }),
        );
        manager.load_plugin(&gain).unwrap();
        manager.load_plugin(&gain).unwrap();
        manager.load_plugin(&delay).unwrap();

        let stats = manager.get_stats();
        assert_eq!(stats.total_instances, 3);
        assert_eq!(stats.loaded_plugins, 2);
        assert_eq!(stats.total_latency, 32);
        assert_eq!(stats.by_format.get(&PluginFormat::Clap), Some(&3));
    }
}
