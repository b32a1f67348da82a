use std::path::PathBuf;

use harmoniq_plugin_registry::{PluginFormat, RegistryError};
use thiserror::Error;

use crate::chain::ChainId;
use crate::instance::InstanceId;
use crate::lifecycle::StateError;

/// Permanent failure to bring a binary into memory. Retrying will not help.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("plugin binary not found at {0}")]
    MissingBinary(PathBuf),
    #[error("failed to load plugin library: {0}")]
    Library(#[from] libloading::Error),
    #[error("{path} is not a valid {format} binary: {reason}")]
    InvalidBinary {
        path: PathBuf,
        format: PluginFormat,
        reason: String,
    },
    #[error("{path} was built against ABI {found}, host requires {required}")]
    AbiMismatch {
        path: PathBuf,
        found: String,
        required: String,
    },
    #[error("entry {index} requested but {path} only exports {count}")]
    EntryOutOfRange {
        path: PathBuf,
        index: u32,
        count: u32,
    },
    #[error("{0} hosting is not available")]
    UnsupportedFormat(PluginFormat),
}

/// A lock or permission race while touching the binary; safe to retry.
#[derive(Debug, Error)]
#[error("plugin binary {path} is temporarily unavailable: {source}")]
pub struct TransientLoadError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// Errors that can occur while loading or managing plugins.
#[derive(Debug, Error)]
pub enum HostError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    TransientLoad(#[from] TransientLoadError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("plugin refused to {0}")]
    Refused(&'static str),
    #[error("plugin cannot run at {requested} Hz (shared instance runs at {active} Hz)")]
    SampleRateUnsupported { active: f64, requested: f64 },
    #[error("plugin activated for blocks of at most {max} frames cannot take {requested}")]
    BlockSizeUnsupported { max: u32, requested: usize },
    #[error("handle belongs to a {found} plugin, binding expects {expected}")]
    FormatMismatch {
        expected: PluginFormat,
        found: PluginFormat,
    },
    #[error("no binding registered for {0} plugins")]
    NoBinding(PluginFormat),
    #[error("unknown plugin instance {0}")]
    UnknownInstance(InstanceId),
    #[error("unknown chain {0}")]
    UnknownChain(ChainId),
    #[error("instance {instance} is already part of chain {chain}")]
    AlreadyChained { instance: InstanceId, chain: ChainId },
    #[error("instance {instance} is not part of chain {chain}")]
    NotInChain { instance: InstanceId, chain: ChainId },
    #[error("new order is not a permutation of chain {0}")]
    InvalidOrder(ChainId),
    #[error("parameter index {index} out of range ({count} parameters)")]
    ParameterIndex { index: u32, count: u32 },
    #[error("parameter value {0} is not finite")]
    NonFiniteValue(f64),
    #[error("instance {0} is in use by a render")]
    Busy(InstanceId),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl HostError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, HostError::TransientLoad(_))
    }

    /// Classifies an I/O error raised while opening a binary.
    pub(crate) fn from_open(path: PathBuf, format: PluginFormat, err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound => LoadError::MissingBinary(path).into(),
            ErrorKind::PermissionDenied | ErrorKind::WouldBlock | ErrorKind::Interrupted => {
                TransientLoadError { path, source: err }.into()
            }
            _ => LoadError::InvalidBinary {
                path,
                format,
                reason: err.to_string(),
            }
            .into(),
        }
    }
}
