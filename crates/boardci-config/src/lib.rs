//! KDL configuration parsing for boardci.
//!
//! This crate handles parsing of:
//! - Stage definitions (`jobdefs/*.kdl`)
//! - System configuration (`boardci.kdl`)
//! - Job variables exported into every command session

pub mod error;
pub mod pipeline;
pub mod system;
pub mod variables;

pub use error::{ConfigError, ConfigResult};
pub use pipeline::{load_definitions, parse_pipeline};
pub use system::{
    GitHubConfig, PowerPolicy, RelayConfig, ServerConfig, ShellConfig, SystemConfig,
    load_system_config, parse_system_config,
};
pub use variables::{JobVariables, shell_quote};
