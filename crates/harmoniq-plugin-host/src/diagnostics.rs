//! Out-of-band reporting for failures that must not unwind through the
//! processing path.

use std::path::PathBuf;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use serde::Serialize;

use crate::instance::InstanceId;

/// Something wrong with a stage's output for one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProcessingAnomaly {
    /// NaN or infinite samples.
    NonFinite,
    /// The stage produced a different number of frames than requested.
    FrameMismatch { expected: usize, actual: usize },
    /// The binding returned an error or an error status.
    Failed,
    /// The instance was locked by someone else when the block came due.
    Contended,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum HostDiagnostic {
    LoadRetry {
        path: PathBuf,
        attempt: u32,
        delay_ms: u64,
    },
    Anomaly {
        instance: InstanceId,
        anomaly: ProcessingAnomaly,
    },
    Degraded {
        instance: InstanceId,
    },
    HandleLeaked {
        instance: InstanceId,
    },
}

/// Bounded broadcast point for [`HostDiagnostic`]s.
///
/// Emitting never blocks; when the channel is full the diagnostic is
/// dropped.
#[derive(Debug, Clone)]
pub struct Diagnostics {
    sender: Sender<HostDiagnostic>,
    receiver: Receiver<HostDiagnostic>,
}

impl Diagnostics {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = crossbeam_channel::bounded(capacity.max(1));
        Self { sender, receiver }
    }

    pub fn emit(&self, diagnostic: HostDiagnostic) {
        match self.sender.try_send(diagnostic) {
            Ok(()) => {}
            Err(TrySendError::Full(dropped)) => {
                tracing::debug!("diagnostics channel full, dropping {dropped:?}");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    pub fn receiver(&self) -> Receiver<HostDiagnostic> {
        self.receiver.clone()
    }
}
