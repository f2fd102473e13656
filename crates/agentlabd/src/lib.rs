//! AgentLab controller daemon: configuration, telemetry and the HTTP
//! listeners around the controller kernel.

pub mod cli;
pub mod config;
pub mod duration;
pub mod server;
pub mod telemetry;

pub use cli::Cli;
pub use config::{Config, ConfigError};
