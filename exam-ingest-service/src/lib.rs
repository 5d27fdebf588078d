pub mod app;
pub mod cli;
pub mod config;

pub use app::{build_service, execute, health_report, run};
pub use cli::{Cli, Command};
pub use config::{ConfigError, LlmProvider, Settings};
