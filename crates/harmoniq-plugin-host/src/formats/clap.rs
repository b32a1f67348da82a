//! CLAP binding built on the `clap-sys` ABI definitions.

use std::collections::HashMap;
use std::ffi::{c_char, c_void, CStr, CString};
use std::fmt;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::{Arc, Weak};

use clap_sys::audio_buffer::clap_audio_buffer;
use clap_sys::entry::clap_plugin_entry;
use clap_sys::events::{
    clap_event_header, clap_event_param_value, clap_input_events, clap_output_events,
    CLAP_CORE_EVENT_SPACE_ID, CLAP_EVENT_PARAM_VALUE,
};
use clap_sys::ext::audio_ports::{clap_audio_port_info, clap_plugin_audio_ports, CLAP_EXT_AUDIO_PORTS};
use clap_sys::ext::latency::{clap_plugin_latency, CLAP_EXT_LATENCY};
use clap_sys::ext::note_ports::{clap_plugin_note_ports, CLAP_EXT_NOTE_PORTS};
use clap_sys::ext::params::{clap_param_info, clap_plugin_params, CLAP_EXT_PARAMS};
use clap_sys::plugin_factory::{clap_plugin_factory, CLAP_PLUGIN_FACTORY_ID};
use clap_sys::host::clap_host;
use clap_sys::id::clap_id;
use clap_sys::plugin::{clap_plugin, clap_plugin_descriptor};
use clap_sys::process::{
    clap_process, CLAP_PROCESS_CONTINUE, CLAP_PROCESS_CONTINUE_IF_NOT_QUIET, CLAP_PROCESS_SLEEP,
    CLAP_PROCESS_TAIL,
};
use clap_sys::version::CLAP_VERSION;
use harmoniq_plugin_registry::{ParameterDef, PluginCategory, PluginDescriptor, PluginFormat};
use libloading::Library;
use parking_lot::Mutex;

use crate::audio_buffer::AudioBuffer;
use crate::binding::{
    ActivationConfig, HandleLedger, NativeHandle, ParamEvent, PluginBinding, ProcessStatus,
    UnloadRejected,
};
use crate::error::{HostError, LoadError};
use crate::lifecycle::{LifecycleOp, PluginState};

const FORMAT: PluginFormat = PluginFormat::Clap;
const HOST_NAME: &[u8] = b"Harmoniq Studio\0";
const HOST_VENDOR: &[u8] = b"Harmoniq Studio Contributors\0";
const HOST_URL: &[u8] = b"https://github.com/BobTheZombie/Harmoniq-Studio\0";
const HOST_VERSION: &[u8] = b"0.1.0\0";
const MAX_CHANNELS: usize = 8;

/// A loaded CLAP binary. Shared by every instance created from it.
struct ClapLibrary {
    path: PathBuf,
    entry: *const clap_plugin_entry,
    _lib: Library,
}

unsafe impl Send for ClapLibrary {}
unsafe impl Sync for ClapLibrary {}

impl ClapLibrary {
    fn load(path: &Path) -> Result<Self, HostError> {
        std::fs::metadata(path).map_err(|err| HostError::from_open(path.to_path_buf(), FORMAT, err))?;
        let binary = bundle_binary(path);
        let lib = unsafe { Library::new(&binary) }.map_err(LoadError::from)?;
        let entry = unsafe {
            let symbol = lib
                .get::<*const clap_plugin_entry>(b"clap_entry\0")
                .map_err(|_| invalid(path, "missing clap_entry symbol"))?;
            *symbol
        };
        if entry.is_null() {
            return Err(invalid(path, "clap_entry is null"));
        }
        let version = unsafe { (*entry).clap_version };
        if version.major < 1 {
            return Err(LoadError::AbiMismatch {
                path: path.to_path_buf(),
                found: format!("{}.{}.{}", version.major, version.minor, version.revision),
                required: format!("{}.x", CLAP_VERSION.major),
            }
            .into());
        }
        let init = unsafe { (*entry).init }.ok_or_else(|| invalid(path, "entry has no init"))?;
        let c_path = CString::new(binary.to_string_lossy().as_bytes())
            .map_err(|_| invalid(path, "path contains a NUL byte"))?;
        if !unsafe { init(c_path.as_ptr()) } {
            return Err(invalid(path, "entry init failed"));
        }
        tracing::debug!("loaded CLAP library {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            entry,
            _lib: lib,
        })
    }

    fn factory(&self) -> Result<&clap_plugin_factory, HostError> {
        let get_factory = unsafe { (*self.entry).get_factory }
            .ok_or_else(|| invalid(&self.path, "entry has no get_factory"))?;
        let factory = unsafe { get_factory(CLAP_PLUGIN_FACTORY_ID.as_ptr()) } as *const clap_plugin_factory;
        if factory.is_null() {
            return Err(invalid(&self.path, "no plugin factory"));
        }
        Ok(unsafe { &*factory })
    }

    fn plugin_count(&self) -> Result<u32, HostError> {
        let factory = self.factory()?;
        let count = factory
            .get_plugin_count
            .ok_or_else(|| invalid(&self.path, "factory has no get_plugin_count"))?;
        Ok(unsafe { count(factory) })
    }

    fn plugin_descriptor(&self, index: u32) -> Result<&clap_plugin_descriptor, HostError> {
        let count = self.plugin_count()?;
        if index >= count {
            return Err(LoadError::EntryOutOfRange {
                path: self.path.clone(),
                index,
                count,
            }
            .into());
        }
        let factory = self.factory()?;
        let get = factory
            .get_plugin_descriptor
            .ok_or_else(|| invalid(&self.path, "factory has no get_plugin_descriptor"))?;
        let descriptor = unsafe { get(factory, index) };
        if descriptor.is_null() {
            return Err(invalid(&self.path, "null plugin descriptor"));
        }
        Ok(unsafe { &*descriptor })
    }
}

impl Drop for ClapLibrary {
    fn drop(&mut self) {
        unsafe {
            if let Some(deinit) = (*self.entry).deinit {
                deinit();
            }
        }
        tracing::debug!("released CLAP library {}", self.path.display());
    }
}

fn bundle_binary(path: &Path) -> PathBuf {
    if path.is_dir() {
        let stem = path.file_stem().unwrap_or_default();
        path.join("Contents").join("MacOS").join(stem)
    } else {
        path.to_path_buf()
    }
}

fn invalid(path: &Path, reason: &str) -> HostError {
    LoadError::InvalidBinary {
        path: path.to_path_buf(),
        format: FORMAT,
        reason: reason.to_owned(),
    }
    .into()
}

unsafe fn c_string(ptr: *const c_char) -> String {
    if ptr.is_null() {
        String::new()
    } else {
        CStr::from_ptr(ptr).to_string_lossy().into_owned()
    }
}

unsafe fn features(descriptor: &clap_plugin_descriptor) -> Vec<String> {
    let mut found = Vec::new();
    let mut cursor = descriptor.features;
    if cursor.is_null() {
        return found;
    }
    while !(*cursor).is_null() {
        found.push(c_string(*cursor));
        cursor = cursor.add(1);
    }
    found
}

/// Parameter events handed to the plugin for one process or flush call.
struct EventQueue {
    events: Vec<clap_event_param_value>,
}

impl EventQueue {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Vec::with_capacity(capacity),
        }
    }

    fn push(&mut self, param_id: clap_id, value: f64, time: u32) {
        if self.events.len() == self.events.capacity() {
            return;
        }
        self.events.push(clap_event_param_value {
            header: clap_event_header {
                size: std::mem::size_of::<clap_event_param_value>() as u32,
                time,
                space_id: CLAP_CORE_EVENT_SPACE_ID,
                type_: CLAP_EVENT_PARAM_VALUE,
                flags: 0,
            },
            param_id,
            cookie: ptr::null_mut(),
            note_id: -1,
            port_index: -1,
            channel: -1,
            key: -1,
            value,
        });
    }

    fn input_list(&mut self) -> clap_input_events {
        clap_input_events {
            ctx: self as *mut EventQueue as *mut c_void,
            size: Some(input_events_size),
            get: Some(input_events_get),
        }
    }
}

unsafe extern "C" fn input_events_size(list: *const clap_input_events) -> u32 {
    let queue = &*((*list).ctx as *const EventQueue);
    queue.events.len() as u32
}

unsafe extern "C" fn input_events_get(
    list: *const clap_input_events,
    index: u32,
) -> *const clap_event_header {
    let queue = &*((*list).ctx as *const EventQueue);
    queue
        .events
        .get(index as usize)
        .map_or(ptr::null(), |event| &event.header as *const clap_event_header)
}

unsafe extern "C" fn output_events_try_push(
    _list: *const clap_output_events,
    _event: *const clap_event_header,
) -> bool {
    // Plugin-originated events are not routed anywhere yet.
    true
}

unsafe extern "C" fn host_get_extension(
    _host: *const clap_host,
    _extension_id: *const c_char,
) -> *const c_void {
    ptr::null()
}

unsafe extern "C" fn host_request(_host: *const clap_host) {}

fn host_shim() -> Box<clap_host> {
    Box::new(clap_host {
        clap_version: CLAP_VERSION,
        host_data: ptr::null_mut(),
        name: HOST_NAME.as_ptr().cast(),
        vendor: HOST_VENDOR.as_ptr().cast(),
        url: HOST_URL.as_ptr().cast(),
        version: HOST_VERSION.as_ptr().cast(),
        get_extension: Some(host_get_extension),
        request_restart: Some(host_request),
        request_process: Some(host_request),
        request_callback: Some(host_request),
    })
}

/// Native state behind a CLAP [`NativeHandle`].
struct ClapSlot {
    plugin: *const clap_plugin,
    descriptor: PluginDescriptor,
    params: *const clap_plugin_params,
    latency: *const clap_plugin_latency,
    param_ids: Vec<clap_id>,
    input_ports: u32,
    output_ports: u32,
    output_channels: u32,
    queued: Box<EventQueue>,
    input_ptrs: Vec<*mut f32>,
    output_ptrs: Vec<*mut f32>,
    steady_time: i64,
    _host: Box<clap_host>,
    _library: Arc<ClapLibrary>,
}

unsafe impl Send for ClapSlot {}

impl ClapSlot {
    fn plugin(&self) -> &clap_plugin {
        unsafe { &*self.plugin }
    }

    unsafe fn extension<T>(&self, id: &CStr) -> *const T {
        match self.plugin().get_extension {
            Some(get_extension) => get_extension(self.plugin, id.as_ptr()) as *const T,
            None => ptr::null(),
        }
    }

    fn param_id(&self, index: u32) -> Result<clap_id, HostError> {
        self.param_ids
            .get(index as usize)
            .copied()
            .ok_or(HostError::ParameterIndex {
                index,
                count: self.param_ids.len() as u32,
            })
    }

    /// Reads extensions that are only reachable after `init`.
    unsafe fn query_extensions(&mut self) {
        self.params = self.extension(CLAP_EXT_PARAMS);
        self.latency = self.extension(CLAP_EXT_LATENCY);

        let mut defs = Vec::new();
        self.param_ids.clear();
        if let Some(params) = self.params.as_ref() {
            let count = params.count.map_or(0, |count| count(self.plugin));
            for index in 0..count {
                let Some(get_info) = params.get_info else { break };
                let mut info: clap_param_info = std::mem::zeroed();
                if !get_info(self.plugin, index, &mut info) {
                    continue;
                }
                let name = c_string(info.name.as_ptr());
                let reported = ParameterDef {
                    index: defs.len() as u32,
                    name,
                    min: info.min_value,
                    max: info.max_value,
                    default: info.default_value,
                    unit: String::new(),
                };
                let Some(def) = reported.sanitized() else {
                    tracing::warn!(
                        "skipping CLAP parameter {} ({}): bounds {}..{} are not finite",
                        info.id,
                        reported.name,
                        reported.min,
                        reported.max
                    );
                    continue;
                };
                defs.push(def);
                self.param_ids.push(info.id);
            }
        }
        self.queued = Box::new(EventQueue::with_capacity(defs.len() * 2));

        let ports: *const clap_plugin_audio_ports = self.extension(CLAP_EXT_AUDIO_PORTS);
        if let Some(ports) = ports.as_ref() {
            let (inputs, input_channels) = port_layout(self.plugin, ports, true);
            let (outputs, output_channels) = port_layout(self.plugin, ports, false);
            self.input_ports = inputs;
            self.output_ports = outputs;
            self.output_channels = output_channels;
            self.descriptor.audio_inputs = input_channels;
            self.descriptor.audio_outputs = output_channels;
        }
        let notes: *const clap_plugin_note_ports = self.extension(CLAP_EXT_NOTE_PORTS);
        if let Some(notes) = notes.as_ref() {
            if let Some(count) = notes.count {
                self.descriptor.supports_midi = count(self.plugin, true) > 0;
            }
        }
        self.descriptor.parameter_defs = defs;
    }
}

/// Port count and channel count of the main port.
unsafe fn port_layout(
    plugin: *const clap_plugin,
    ports: &clap_plugin_audio_ports,
    is_input: bool,
) -> (u32, u32) {
    let count = ports.count.map_or(0, |count| count(plugin, is_input));
    if count == 0 {
        return (0, 0);
    }
    let mut info: clap_audio_port_info = std::mem::zeroed();
    let channels = match ports.get {
        Some(get) if get(plugin, 0, is_input, &mut info) => info.channel_count,
        _ => 2,
    };
    (count, channels)
}

/// Hosts CLAP plugins from native dynamic libraries.
#[derive(Default)]
pub struct ClapBinding {
    libraries: Mutex<HashMap<PathBuf, Weak<ClapLibrary>>>,
    ledger: HandleLedger,
}

impl fmt::Debug for ClapBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClapBinding")
            .field("libraries", &self.libraries.lock().len())
            .field("outstanding", &self.ledger.outstanding())
            .finish()
    }
}

impl ClapBinding {
    pub fn new() -> Self {
        Self::default()
    }

    fn library(&self, path: &Path) -> Result<Arc<ClapLibrary>, HostError> {
        let mut libraries = self.libraries.lock();
        if let Some(library) = libraries.get(path).and_then(Weak::upgrade) {
            return Ok(library);
        }
        let library = Arc::new(ClapLibrary::load(path)?);
        libraries.insert(path.to_path_buf(), Arc::downgrade(&library));
        libraries.retain(|_, weak| weak.strong_count() > 0);
        Ok(library)
    }
}

impl PluginBinding for ClapBinding {
    fn format(&self) -> PluginFormat {
        FORMAT
    }

    fn entry_count(&self, path: &Path) -> Result<u32, HostError> {
        self.library(path)?.plugin_count()
    }

    fn load_plugin(&self, path: &Path, entry_index: u32) -> Result<NativeHandle, HostError> {
        let library = self.library(path)?;
        let raw = library.plugin_descriptor(entry_index)?;
        let (id, name, vendor, version, features) = unsafe {
            (
                c_string(raw.id),
                c_string(raw.name),
                c_string(raw.vendor),
                c_string(raw.version),
                features(raw),
            )
        };
        if id.is_empty() {
            return Err(invalid(path, "plugin descriptor has no id"));
        }
        let category = PluginCategory::from_features(features.iter().map(String::as_str))
            .unwrap_or_else(|| PluginCategory::infer_from_name(&name));
        let mut descriptor = PluginDescriptor::new(id.clone(), name, vendor, FORMAT, path)
            .with_entry_index(entry_index)
            .with_category(category)
            .with_midi(category == PluginCategory::Instrument);
        if !version.is_empty() {
            descriptor = descriptor.with_version(version);
        }

        let host = host_shim();
        let factory = library.factory()?;
        let create = factory
            .create_plugin
            .ok_or_else(|| invalid(path, "factory has no create_plugin"))?;
        let c_id = CString::new(id).map_err(|_| invalid(path, "plugin id contains a NUL byte"))?;
        let plugin = unsafe { create(factory, &*host, c_id.as_ptr()) };
        if plugin.is_null() {
            return Err(invalid(path, "create_plugin returned null"));
        }

        let slot = ClapSlot {
            plugin,
            descriptor,
            params: ptr::null(),
            latency: ptr::null(),
            param_ids: Vec::new(),
            input_ports: 1,
            output_ports: 1,
            output_channels: 2,
            queued: Box::new(EventQueue::with_capacity(0)),
            input_ptrs: Vec::with_capacity(MAX_CHANNELS),
            output_ptrs: Vec::with_capacity(MAX_CHANNELS),
            steady_time: 0,
            _host: host,
            _library: library,
        };
        let serial = self.ledger.issue();
        tracing::info!("Loaded CLAP plugin: {} (handle {serial})", slot.descriptor);
        Ok(NativeHandle::new(serial, FORMAT, slot))
    }

    fn get_descriptor(&self, handle: &NativeHandle) -> Result<PluginDescriptor, HostError> {
        Ok(handle.slot::<ClapSlot>(FORMAT)?.descriptor.clone())
    }

    fn initialize(&self, handle: &mut NativeHandle) -> Result<bool, HostError> {
        let next = handle.check(LifecycleOp::Initialize)?;
        let slot = handle.slot_mut::<ClapSlot>(FORMAT)?;
        let ok = match slot.plugin().init {
            Some(init) => unsafe { init(slot.plugin) },
            None => false,
        };
        if !ok {
            tracing::warn!("{} refused to initialize", slot.descriptor);
            return Ok(false);
        }
        unsafe { slot.query_extensions() };
        handle.commit(next);
        Ok(true)
    }

    fn activate(
        &self,
        handle: &mut NativeHandle,
        config: ActivationConfig,
    ) -> Result<bool, HostError> {
        let next = handle.check(LifecycleOp::Activate)?;
        let slot = handle.slot_mut::<ClapSlot>(FORMAT)?;
        let Some(activate) = slot.plugin().activate else {
            return Ok(false);
        };
        let ok = unsafe {
            activate(
                slot.plugin,
                config.sample_rate,
                config.min_block_size.max(1),
                config.max_block_size.max(config.min_block_size.max(1)),
            )
        };
        if ok {
            slot.steady_time = 0;
            handle.commit(next);
        }
        Ok(ok)
    }

    fn deactivate(&self, handle: &mut NativeHandle) -> Result<(), HostError> {
        let next = handle.check(LifecycleOp::Deactivate)?;
        let slot = handle.slot_mut::<ClapSlot>(FORMAT)?;
        if let Some(deactivate) = slot.plugin().deactivate {
            unsafe { deactivate(slot.plugin) };
        }
        handle.commit(next);
        Ok(())
    }

    fn start_processing(&self, handle: &mut NativeHandle) -> Result<bool, HostError> {
        let next = handle.check(LifecycleOp::StartProcessing)?;
        let slot = handle.slot_mut::<ClapSlot>(FORMAT)?;
        let ok = match slot.plugin().start_processing {
            Some(start) => unsafe { start(slot.plugin) },
            None => true,
        };
        if ok {
            handle.commit(next);
        }
        Ok(ok)
    }

    fn stop_processing(&self, handle: &mut NativeHandle) -> Result<(), HostError> {
        let next = handle.check(LifecycleOp::StopProcessing)?;
        let slot = handle.slot_mut::<ClapSlot>(FORMAT)?;
        if let Some(stop) = slot.plugin().stop_processing {
            unsafe { stop(slot.plugin) };
        }
        handle.commit(next);
        Ok(())
    }

    fn reset(&self, handle: &mut NativeHandle) -> Result<(), HostError> {
        handle.check(LifecycleOp::Reset)?;
        let slot = handle.slot_mut::<ClapSlot>(FORMAT)?;
        if let Some(reset) = slot.plugin().reset {
            unsafe { reset(slot.plugin) };
        }
        slot.steady_time = 0;
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
        let slot = handle.slot_mut::<ClapSlot>(FORMAT)?;
        let Some(process) = slot.plugin().process else {
            return Ok(ProcessStatus::Error);
        };
        outputs.set_frames(frames);
        let frames = frames.min(inputs.frames()).min(outputs.frames());

        for event in events {
            if let Some(id) = slot.param_ids.get(event.index as usize).copied() {
                slot.queued.push(id, event.value, event.offset);
            }
        }

        slot.input_ptrs.clear();
        for channel in 0..inputs.channels().min(MAX_CHANNELS) {
            slot.input_ptrs.push(inputs.channel(channel).as_ptr() as *mut f32);
        }
        let output_channels = outputs.channels().min(MAX_CHANNELS);
        let plugin_channels = (slot.output_channels as usize).clamp(1, output_channels.max(1));
        slot.output_ptrs.clear();
        for channel in 0..plugin_channels.min(output_channels) {
            slot.output_ptrs.push(outputs.channel_mut(channel).as_mut_ptr());
        }

        let input = clap_audio_buffer {
            data32: slot.input_ptrs.as_mut_ptr() as *const *const f32,
            data64: ptr::null_mut(),
            channel_count: slot.input_ptrs.len() as u32,
            latency: 0,
            constant_mask: 0,
        };
        let mut output = clap_audio_buffer {
            data32: slot.output_ptrs.as_mut_ptr() as *const *const f32,
            data64: ptr::null_mut(),
            channel_count: slot.output_ptrs.len() as u32,
            latency: 0,
            constant_mask: 0,
        };
        let in_events = slot.queued.input_list();
        let out_events = clap_output_events {
            ctx: ptr::null_mut(),
            try_push: Some(output_events_try_push),
        };
        let process_data = clap_process {
            steady_time: slot.steady_time,
            frames_count: frames as u32,
            transport: ptr::null(),
            audio_inputs: &input,
            audio_outputs: &mut output,
            audio_inputs_count: u32::from(slot.input_ports > 0),
            audio_outputs_count: u32::from(slot.output_ports > 0),
            in_events: &in_events,
            out_events: &out_events,
        };
        let status = unsafe { process(slot.plugin, &process_data) };
        slot.queued.events.clear();
        slot.steady_time += frames as i64;

        // Mono plugins in a wider chain: mirror the first channel.
        if plugin_channels < output_channels {
            for channel in plugin_channels..output_channels {
                for frame in 0..frames {
                    let sample = outputs.channel(0)[frame];
                    outputs.channel_mut(channel)[frame] = sample;
                }
            }
        }

        Ok(match status {
            CLAP_PROCESS_CONTINUE => ProcessStatus::Continue,
            CLAP_PROCESS_CONTINUE_IF_NOT_QUIET => ProcessStatus::ContinueIfNotQuiet,
            CLAP_PROCESS_TAIL => ProcessStatus::Tail,
            CLAP_PROCESS_SLEEP => ProcessStatus::Sleep,
            _ => ProcessStatus::Error,
        })
    }

    fn parameter_count(&self, handle: &NativeHandle) -> Result<u32, HostError> {
        Ok(handle.slot::<ClapSlot>(FORMAT)?.param_ids.len() as u32)
    }

    fn parameter_info(&self, handle: &NativeHandle, index: u32) -> Result<ParameterDef, HostError> {
        let slot = handle.slot::<ClapSlot>(FORMAT)?;
        slot.param_id(index)?;
        Ok(slot.descriptor.parameter_defs[index as usize].clone())
    }

    fn parameter_value(&self, handle: &NativeHandle, index: u32) -> Result<f64, HostError> {
        let slot = handle.slot::<ClapSlot>(FORMAT)?;
        let id = slot.param_id(index)?;
        let fallback = slot.descriptor.parameter_defs[index as usize].default;
        let Some(params) = (unsafe { slot.params.as_ref() }) else {
            return Ok(fallback);
        };
        let mut value = fallback;
        if let Some(get_value) = params.get_value {
            if !unsafe { get_value(slot.plugin, id, &mut value) } {
                value = fallback;
            }
        }
        Ok(value)
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
        let state = handle.state();
        let slot = handle.slot_mut::<ClapSlot>(FORMAT)?;
        let id = slot.param_id(index)?;
        let value = slot.descriptor.parameter_defs[index as usize].clamp(value);
        slot.queued.push(id, value, 0);
        if state == PluginState::Processing {
            // Delivered with the next process call.
            return Ok(());
        }
        let flush = unsafe { slot.params.as_ref() }.and_then(|params| params.flush);
        if let Some(flush) = flush {
            let in_events = slot.queued.input_list();
            let out_events = clap_output_events {
                ctx: ptr::null_mut(),
                try_push: Some(output_events_try_push),
            };
            unsafe { flush(slot.plugin, &in_events, &out_events) };
            slot.queued.events.clear();
        }
        Ok(())
    }

    fn latency(&self, handle: &NativeHandle) -> Result<u32, HostError> {
        let slot = handle.slot::<ClapSlot>(FORMAT)?;
        if handle.state().is_active() {
            if let Some(latency) = unsafe { slot.latency.as_ref() } {
                if let Some(get) = latency.get {
                    return Ok(unsafe { get(slot.plugin) });
                }
            }
        }
        Ok(slot.descriptor.declared_latency_samples)
    }

    fn unload_plugin(&self, handle: NativeHandle) -> Result<(), UnloadRejected> {
        if let Err(err) = handle.check_release() {
            return Err(UnloadRejected {
                error: err.into(),
                handle,
            });
        }
        let serial = handle.serial();
        let slot = match handle.take_slot::<ClapSlot>(FORMAT) {
            Ok(slot) => slot,
            Err(handle) => {
                return Err(UnloadRejected {
                    error: HostError::FormatMismatch {
                        expected: FORMAT,
                        found: handle.format(),
                    },
                    handle,
                })
            }
        };
        if let Some(destroy) = slot.plugin().destroy {
            unsafe { destroy(slot.plugin) };
        }
        self.ledger.release();
        tracing::info!("Unloaded CLAP plugin: {} (handle {serial})", slot.descriptor);
        Ok(())
    }

    fn outstanding_handles(&self) -> usize {
        self.ledger.outstanding()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_binary_is_a_load_error() {
        let binding = ClapBinding::new();
        let err = binding
            .load_plugin(Path::new("/definitely/not/here.clap"), 0)
            .unwrap_err();
        assert!(matches!(err, HostError::Load(LoadError::MissingBinary(_))));
        assert_eq!(binding.outstanding_handles(), 0);
    }

    #[test]
    fn garbage_file_is_rejected_without_a_handle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.clap");
        std::fs::write(&path, b"not a shared object").unwrap();
        let binding = ClapBinding::new();
        let err = binding.load_plugin(&path, 0).unwrap_err();
        assert!(matches!(err, HostError::Load(_)), "{err}");
        assert!(!err.is_retryable());
        assert_eq!(binding.outstanding_handles(), 0);
    }
}
