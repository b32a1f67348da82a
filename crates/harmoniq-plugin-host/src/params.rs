use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use harmoniq_plugin_registry::ParameterDef;

use crate::binding::ParamEvent;
use crate::error::HostError;

/// Fixed, index-addressed parameter table with double-buffered values.
///
/// Control-path writes land in the pending slot; the processing thread
/// promotes them at block boundaries with [`ParameterTable::apply_pending`],
/// so a block never sees a value change halfway through.
#[derive(Debug)]
pub struct ParameterTable {
    defs: Vec<ParameterDef>,
    current: Box<[AtomicU64]>,
    pending: Box<[AtomicU64]>,
    dirty: Box<[AtomicBool]>,
}

impl ParameterTable {
    /// Definitions with non-finite bounds are pinned to zero so every
    /// stored value stays inside `[min, max]`.
    pub fn new(defs: Vec<ParameterDef>) -> Self {
        let defs: Vec<ParameterDef> = defs
            .into_iter()
            .map(|def| {
                def.sanitized().unwrap_or_else(|| {
                    tracing::warn!("parameter {} ({}) has unusable bounds", def.index, def.name);
                    ParameterDef {
                        min: 0.0,
                        max: 0.0,
                        default: 0.0,
                        ..def
                    }
                })
            })
            .collect();
        let bits = |def: &ParameterDef| AtomicU64::new(def.default.to_bits());
        Self {
            current: defs.iter().map(bits).collect(),
            pending: defs.iter().map(bits).collect(),
            dirty: defs.iter().map(|_| AtomicBool::new(false)).collect(),
            defs,
        }
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    pub fn defs(&self) -> &[ParameterDef] {
        &self.defs
    }

    pub fn def(&self, index: u32) -> Result<&ParameterDef, HostError> {
        self.defs
            .get(index as usize)
            .ok_or(HostError::ParameterIndex {
                index,
                count: self.defs.len() as u32,
            })
    }

    /// Queues a new value, clamped to the parameter's range. Returns the
    /// value that will be applied.
    pub fn write(&self, index: u32, value: f64) -> Result<f64, HostError> {
        if !value.is_finite() {
            return Err(HostError::NonFiniteValue(value));
        }
        let value = self.def(index)?.clamp(value);
        let slot = index as usize;
        self.pending[slot].store(value.to_bits(), Ordering::Relaxed);
        self.dirty[slot].store(true, Ordering::Release);
        Ok(value)
    }

    /// Latest requested value, applied or not.
    pub fn value(&self, index: u32) -> Result<f64, HostError> {
        self.def(index)?;
        let slot = index as usize;
        let source = if self.dirty[slot].load(Ordering::Acquire) {
            &self.pending[slot]
        } else {
            &self.current[slot]
        };
        Ok(f64::from_bits(source.load(Ordering::Relaxed)))
    }

    /// Value the processing thread is currently using.
    pub fn applied_value(&self, index: u32) -> Result<f64, HostError> {
        self.def(index)?;
        Ok(f64::from_bits(
            self.current[index as usize].load(Ordering::Relaxed),
        ))
    }

    /// Seeds a value straight into both slots. Control path only, before the
    /// instance is processing.
    pub fn seed(&self, index: u32, value: f64) -> Result<(), HostError> {
        let value = self.def(index)?.clamp(value);
        let slot = index as usize;
        self.current[slot].store(value.to_bits(), Ordering::Relaxed);
        self.pending[slot].store(value.to_bits(), Ordering::Relaxed);
        Ok(())
    }

    /// Promotes pending writes and records them as block-start events.
    ///
    /// `events` must have capacity for `len()` entries; it is cleared first
    /// and never grows past that.
    pub fn apply_pending(&self, events: &mut Vec<ParamEvent>) {
        events.clear();
        for (index, dirty) in self.dirty.iter().enumerate() {
            if !dirty.swap(false, Ordering::Acquire) {
                continue;
            }
            let bits = self.pending[index].load(Ordering::Relaxed);
            self.current[index].store(bits, Ordering::Relaxed);
            if events.len() < events.capacity() {
                events.push(ParamEvent {
                    index: index as u32,
                    value: f64::from_bits(bits),
                    offset: 0,
                });
            }
        }
    }

    /// Snapshot of requested values, indexed like the definitions.
    pub fn values(&self) -> Vec<f64> {
        (0..self.defs.len() as u32)
            .filter_map(|index| self.value(index).ok())
            .collect()
    }
}
