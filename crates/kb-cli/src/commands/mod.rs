//! CLI command implementations

mod config;
mod restore;
mod up;

pub use config::{config_init, config_path, config_show, load_session, resolve_path};
pub use restore::{restore, restore_command, RestoreOptions, Restored};
pub use up::up_command;
