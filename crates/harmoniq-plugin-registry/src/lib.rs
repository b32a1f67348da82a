//! Plugin descriptor registry used by the Harmoniq plugin host.
//!
//! Descriptors are discovered by scanning the standard per-format search
//! paths, probed into static metadata and cached on disk. The [`Registry`]
//! is an ordinary value: construct one at startup and hand it to the
//! instance manager.

mod descriptor;
mod registry;
mod scan;
mod store_json;

pub use descriptor::*;
pub use registry::*;
pub use scan::*;
pub use store_json::*;
