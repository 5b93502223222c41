//! The daemon crate: `DaemonConfig` plus the `Daemon` registry binding
//! every other `sso-*` crate together (spec.md §4.8, C10). The `ssod`
//! binary in `src/main.rs` is the only consumer of this library target
//! outside of its own test suite.

mod config;
mod daemon;

pub use config::{DaemonConfig, GeneralSection, ObjectTimeoutsSection, StorageSection};
pub use daemon::Daemon;
