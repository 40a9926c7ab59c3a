//! Configuration Management Module
//!
//! Persistent storage of forwarding records and engine settings.

pub mod storage;
pub mod types;

pub use storage::{
    config_dir, forwards_file, load_settings, load_settings_from, settings_file, ForwardStorage,
    StorageError,
};
pub use types::{ForwardFile, ForwardingSettings, FORWARDS_VERSION};
