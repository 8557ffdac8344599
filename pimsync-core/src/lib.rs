//! pimsync core library: domain types, target configuration store, errors.
//!
//! - [`types`]: target identity, kinds, folder references, discovered collections
//! - [`error`]: [`ConfigError`]
//! - [`config`]: load / save / lookup of per-user target configuration

pub mod config;
pub mod error;
pub mod types;

pub use config::{SyncConfig, UserTargets};
pub use error::ConfigError;
pub use types::{DiscoveredCollection, FolderRef, Target, TargetConfig, TargetId, TargetKind};
