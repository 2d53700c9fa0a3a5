pub mod archive;
pub mod cancel;
pub mod checksum;
pub mod config;
pub mod lock;
pub mod manifest;
pub mod paths;
pub mod registry;
pub mod storage;

pub mod reporter;

pub use cancel::{CancelPrompt, CancelToken, Cancelled};
pub use config::{PackSettings, Settings, StorageSettings};
pub use paths::*;
pub use reporter::{NullReporter, ProgressFn, Reporter};
pub use storage::{BackendKind, StorageBackend, StorageError, create_backend};

/// Tool version recorded in manifests.
pub const TOOL_VERSION: &str = env!("CARGO_PKG_VERSION");
