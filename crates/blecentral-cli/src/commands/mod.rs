//! Command implementations for the CLI.

mod config;
mod connect;
mod scan;

pub use config::cmd_config;
pub use connect::{ConnectArgs, cmd_connect};
pub use scan::cmd_scan;
