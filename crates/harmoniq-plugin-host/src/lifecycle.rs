//! Plugin lifecycle state machine shared by every binding.
//!
//! ```text
//! Unloaded -> Loaded -> Initialized -> Active <-> Processing
//!                                        |
//!                                        v
//!                                   Deactivated -> Unloaded
//! ```
//!
//! Bindings ask [`PluginState::apply`] for the target state before touching
//! native code and only commit it once the native call succeeded, so a
//! rejected or failed call never changes the recorded state.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PluginState {
    Unloaded,
    Loaded,
    Initialized,
    Active,
    Processing,
    Deactivated,
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PluginState::Unloaded => "unloaded",
            PluginState::Loaded => "loaded",
            PluginState::Initialized => "initialized",
            PluginState::Active => "active",
            PluginState::Processing => "processing",
            PluginState::Deactivated => "deactivated",
        };
        f.write_str(label)
    }
}

/// Calls that are only valid from particular states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleOp {
    Initialize,
    Activate,
    StartProcessing,
    StopProcessing,
    Deactivate,
    Unload,
    /// Release of a handle abandoned before activation: a failed bring-up or
    /// a descriptor read. Never issued by the manager's unload.
    Abort,
    Process,
    Reset,
}

impl LifecycleOp {
    pub fn name(self) -> &'static str {
        match self {
            LifecycleOp::Initialize => "initialize",
            LifecycleOp::Activate => "activate",
            LifecycleOp::StartProcessing => "start processing",
            LifecycleOp::StopProcessing => "stop processing",
            LifecycleOp::Deactivate => "deactivate",
            LifecycleOp::Unload => "unload",
            LifecycleOp::Abort => "abort",
            LifecycleOp::Process => "process",
            LifecycleOp::Reset => "reset",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cannot {} while {state}", .operation.name())]
pub struct StateError {
    pub operation: LifecycleOp,
    pub state: PluginState,
}

impl PluginState {
    /// Returns the state reached by performing `op` from `self`.
    pub fn apply(self, op: LifecycleOp) -> Result<PluginState, StateError> {
        use LifecycleOp as Op;
        use PluginState as S;
        let next = match (op, self) {
            (Op::Initialize, S::Loaded) => S::Initialized,
            (Op::Activate, S::Initialized) => S::Active,
            (Op::StartProcessing, S::Active) => S::Processing,
            (Op::StopProcessing, S::Processing) => S::Active,
            (Op::Deactivate, S::Active) => S::Deactivated,
            (Op::Unload, S::Loaded | S::Deactivated) => S::Unloaded,
            (Op::Abort, S::Loaded | S::Initialized) => S::Unloaded,
            (Op::Process, S::Processing) => S::Processing,
            (Op::Reset, S::Active | S::Processing) => self,
            (operation, state) => return Err(StateError { operation, state }),
        };
        Ok(next)
    }

    pub fn is_active(self) -> bool {
        matches!(self, PluginState::Active | PluginState::Processing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATES: [PluginState; 6] = [
        PluginState::Unloaded,
        PluginState::Loaded,
        PluginState::Initialized,
        PluginState::Active,
        PluginState::Processing,
        PluginState::Deactivated,
    ];

    #[test]
    fn full_lifecycle_walks_legal_edges() {
        let mut state = PluginState::Loaded;
        for op in [
            LifecycleOp::Initialize,
            LifecycleOp::Activate,
            LifecycleOp::StartProcessing,
            LifecycleOp::Process,
            LifecycleOp::StopProcessing,
            LifecycleOp::Deactivate,
            LifecycleOp::Unload,
        ] {
            state = state.apply(op).unwrap();
        }
        assert_eq!(state, PluginState::Unloaded);
    }

    #[test]
    fn process_is_only_valid_while_processing() {
        for state in ALL_STATES {
            let result = state.apply(LifecycleOp::Process);
            assert_eq!(result.is_ok(), state == PluginState::Processing, "{state}");
        }
        let err = PluginState::Loaded.apply(LifecycleOp::Process).unwrap_err();
        assert_eq!(err.to_string(), "cannot process while loaded");
    }

    #[test]
    fn deactivate_requires_leaving_processing_first() {
        assert!(PluginState::Processing
            .apply(LifecycleOp::Deactivate)
            .is_err());
        assert!(PluginState::Active.apply(LifecycleOp::Unload).is_err());
        assert!(PluginState::Deactivated.apply(LifecycleOp::Activate).is_err());
        assert!(PluginState::Unloaded.apply(LifecycleOp::Unload).is_err());
    }

    #[test]
    fn unload_is_refused_between_initialize_and_deactivate() {
        for state in ALL_STATES {
            let legal = matches!(state, PluginState::Loaded | PluginState::Deactivated);
            assert_eq!(state.apply(LifecycleOp::Unload).is_ok(), legal, "{state}");
        }
        assert_eq!(
            PluginState::Initialized.apply(LifecycleOp::Abort),
            Ok(PluginState::Unloaded)
        );
        assert!(PluginState::Active.apply(LifecycleOp::Abort).is_err());
        assert!(PluginState::Deactivated.apply(LifecycleOp::Abort).is_err());
    }
}
