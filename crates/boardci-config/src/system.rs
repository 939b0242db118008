//! System configuration parsing.
//!
//! ```kdl
//! server {
//!     listen "0.0.0.0:5000"
//!     public-url "https://ci.example.com"
//! }
//! definitions "jobdefs"
//! log-dir "logs"
//! database-url "env:DATABASE_URL"
//! persist-attempts 5
//!
//! shell {
//!     program "/bin/bash"
//!     rcfile ".bashrc"
//!     prompt "BOARDCI $ "
//!     ready-timeout 2
//! }
//!
//! github {
//!     token "env:GITHUB_TOKEN"
//!     webhook-secret "env:GITHUB_SECRET"
//!     context "boardci/hikey"
//! }
//!
//! relay {
//!     command "./hidusb-relay-cmd/hidusb-relay-cmd"
//!     power 1
//!     recovery 2
//!     settle-ms 800
//! }
//!
//! power before="cycle" after="off"
//! ```
//!
//! String values of the form `env:NAME` are read from the environment; an unset
//! variable counts as an absent value.

use crate::pipeline::{get_first_string_arg, get_string_prop};
use crate::{ConfigError, ConfigResult};
use boardci_core::device::PowerAction;
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// System-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    pub server: ServerConfig,
    /// Directory holding the `*.kdl` stage definitions.
    pub definitions: PathBuf,
    /// Directory the per-stage log files are written to.
    pub log_dir: PathBuf,
    /// PostgreSQL URL. Without it job records live in memory only.
    pub database_url: Option<String>,
    /// How many times a status transition is written before giving up.
    pub persist_attempts: u32,
    pub shell: ShellConfig,
    pub github: GitHubConfig,
    pub relay: Option<RelayConfig>,
    pub power: PowerPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen: String,
    /// Base URL used to build links in status notifications.
    pub public_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellConfig {
    pub program: String,
    pub rcfile: Option<PathBuf>,
    pub prompt: String,
    pub ready_timeout: Duration,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GitHubConfig {
    pub token: Option<String>,
    pub webhook_secret: Option<String>,
    pub api_url: String,
    /// Status context shown next to the commit.
    pub context: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub command: PathBuf,
    pub power: u32,
    pub recovery: u32,
    /// Pause between relay operations.
    pub settle: Duration,
}

/// What to do with the board around each run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PowerPolicy {
    pub before: PowerAction,
    pub after: PowerAction,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                listen: "0.0.0.0:5000".to_string(),
                public_url: None,
            },
            definitions: PathBuf::from("jobdefs"),
            log_dir: PathBuf::from("logs"),
            database_url: None,
            persist_attempts: 5,
            shell: ShellConfig::default(),
            github: GitHubConfig {
                api_url: "https://api.github.com".to_string(),
                context: "boardci".to_string(),
                ..Default::default()
            },
            relay: None,
            power: PowerPolicy::default(),
        }
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            program: "/bin/bash".to_string(),
            rcfile: None,
            prompt: "BOARDCI $ ".to_string(),
            ready_timeout: Duration::from_secs(2),
        }
    }
}

/// Read and parse a system configuration file.
pub fn load_system_config(path: &Path) -> ConfigResult<SystemConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_system_config(&content)
}

/// Parse system configuration from KDL text. Missing nodes keep their defaults.
pub fn parse_system_config(kdl: &str) -> ConfigResult<SystemConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = SystemConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "server" => {
                for child in children(node) {
                    match child.name().value() {
                        "listen" => config.server.listen = required_string(child)?,
                        "public-url" => {
                            config.server.public_url = resolve(&required_string(child)?)
                                .map(|u| u.trim_end_matches('/').to_string())
                        }
                        _ => {}
                    }
                }
            }
            "definitions" => config.definitions = PathBuf::from(required_string(node)?),
            "log-dir" => config.log_dir = PathBuf::from(required_string(node)?),
            "database-url" => config.database_url = resolve(&required_string(node)?),
            "persist-attempts" => {
                const EXPECTED: &str = "expected a positive integer";
                let attempts: u32 = bounded_integer(node, "persist-attempts", EXPECTED)?;
                if attempts == 0 {
                    return Err(invalid("persist-attempts", EXPECTED));
                }
                config.persist_attempts = attempts;
            }
            "shell" => {
                for child in children(node) {
                    match child.name().value() {
                        "program" => config.shell.program = required_string(child)?,
                        "rcfile" => config.shell.rcfile = Some(required_string(child)?.into()),
                        "prompt" => config.shell.prompt = required_string(child)?,
                        "ready-timeout" => {
                            let secs: u64 =
                                bounded_integer(child, "shell ready-timeout", "expected seconds")?;
                            if secs == 0 {
                                return Err(invalid("shell ready-timeout", "expected seconds"));
                            }
                            config.shell.ready_timeout = Duration::from_secs(secs);
                        }
                        _ => {}
                    }
                }
            }
            "github" => {
                for child in children(node) {
                    match child.name().value() {
                        "token" => config.github.token = resolve(&required_string(child)?),
                        "webhook-secret" => {
                            config.github.webhook_secret = resolve(&required_string(child)?)
                        }
                        "api-url" => config.github.api_url = required_string(child)?,
                        "context" => config.github.context = required_string(child)?,
                        _ => {}
                    }
                }
            }
            "relay" => config.relay = Some(parse_relay(node)?),
            "power" => {
                if let Some(before) = get_string_prop(node, "before") {
                    config.power.before = parse_power_action("power before", &before)?;
                }
                if let Some(after) = get_string_prop(node, "after") {
                    config.power.after = parse_power_action("power after", &after)?;
                }
            }
            _ => {} // Ignore unknown nodes
        }
    }

    let wants_power =
        config.power.before != PowerAction::Nothing || config.power.after != PowerAction::Nothing;
    if wants_power && config.relay.is_none() {
        return Err(ConfigError::MissingField(
            "relay (required by the power policy)".to_string(),
        ));
    }

    Ok(config)
}

fn parse_relay(node: &KdlNode) -> ConfigResult<RelayConfig> {
    let mut command = None;
    let mut power = 1;
    let mut recovery = 2;
    let mut settle = Duration::from_millis(800);

    for child in children(node) {
        match child.name().value() {
            "command" => command = Some(PathBuf::from(required_string(child)?)),
            "power" => {
                power = bounded_integer(child, "relay power", "expected a relay number")?
            }
            "recovery" => {
                recovery = bounded_integer(child, "relay recovery", "expected a relay number")?
            }
            "settle-ms" => {
                settle = Duration::from_millis(bounded_integer(
                    child,
                    "relay settle-ms",
                    "expected milliseconds",
                )?)
            }
            _ => {}
        }
    }

    Ok(RelayConfig {
        command: command.ok_or_else(|| ConfigError::MissingField("relay command".to_string()))?,
        power,
        recovery,
        settle,
    })
}

fn parse_power_action(field: &str, value: &str) -> ConfigResult<PowerAction> {
    value.parse().map_err(|e: boardci_core::Error| invalid(field, &e.to_string()))
}

fn children(node: &KdlNode) -> impl Iterator<Item = &KdlNode> {
    node.children().into_iter().flat_map(|doc| doc.nodes().iter())
}

fn required_string(node: &KdlNode) -> ConfigResult<String> {
    get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField(node.name().value().to_string()))
}

fn first_integer(node: &KdlNode) -> Option<i128> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_integer())
}

/// The first integer argument, if it fits in `T`.
fn bounded_integer<T: TryFrom<i128>>(
    node: &KdlNode,
    field: &str,
    message: &str,
) -> ConfigResult<T> {
    first_integer(node)
        .and_then(|n| T::try_from(n).ok())
        .ok_or_else(|| invalid(field, message))
}

fn invalid(field: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.to_string(),
    }
}

/// Expand `env:NAME` indirections.
fn resolve(value: &str) -> Option<String> {
    match value.strip_prefix("env:") {
        Some(name) => std::env::var(name).ok().filter(|v| !v.is_empty()),
        None => Some(value.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_for_empty_config() {
        let config = parse_system_config("").unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:5000");
        assert_eq!(config.shell.program, "/bin/bash");
        assert_eq!(config.shell.ready_timeout, Duration::from_secs(2));
        assert_eq!(config.persist_attempts, 5);
        assert!(config.database_url.is_none());
        assert!(config.relay.is_none());
        assert_eq!(config.power.before, PowerAction::Nothing);
    }

    #[test]
    fn test_parse_full_config() {
        let kdl = r#"
            server {
                listen "127.0.0.1:8080"
                public-url "https://ci.example.com/"
            }
            definitions "/etc/boardci/jobdefs"
            log-dir "/var/log/boardci"
            persist-attempts 3

            shell {
                program "/bin/sh"
                prompt "HIKEY $ "
                ready-timeout 5
            }

            github {
                token "ghp_literal"
                context "boardci/hikey"
            }

            relay {
                command "./hidusb-relay-cmd"
                power 1
                recovery 2
                settle-ms 500
            }

            power before="cycle" after="off"
        "#;

        let config = parse_system_config(kdl).unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:8080");
        assert_eq!(
            config.server.public_url.as_deref(),
            Some("https://ci.example.com")
        );
        assert_eq!(config.definitions, PathBuf::from("/etc/boardci/jobdefs"));
        assert_eq!(config.persist_attempts, 3);
        assert_eq!(config.shell.prompt, "HIKEY $ ");
        assert_eq!(config.shell.ready_timeout, Duration::from_secs(5));
        assert_eq!(config.github.token.as_deref(), Some("ghp_literal"));
        assert_eq!(config.github.api_url, "https://api.github.com");

        let relay = config.relay.unwrap();
        assert_eq!(relay.recovery, 2);
        assert_eq!(relay.settle, Duration::from_millis(500));
        assert_eq!(config.power.before, PowerAction::Cycle);
        assert_eq!(config.power.after, PowerAction::Off);
    }

    #[test]
    fn test_unset_env_indirection_is_absent() {
        let kdl = r#"
            github {
                webhook-secret "env:BOARDCI_TEST_SURELY_UNSET_SECRET"
            }
        "#;
        let config = parse_system_config(kdl).unwrap();
        assert!(config.github.webhook_secret.is_none());
    }

    #[test]
    fn test_power_policy_requires_relay() {
        let result = parse_system_config(r#"power before="cycle""#);
        assert!(matches!(result.unwrap_err(), ConfigError::MissingField(_)));
    }

    #[test]
    fn test_unknown_power_action() {
        let kdl = r#"
            relay { command "relay" }
            power before="explode"
        "#;
        assert!(matches!(
            parse_system_config(kdl).unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));
    }

    #[test]
    fn test_out_of_range_integers_are_rejected() {
        for kdl in [
            "persist-attempts 4294967296",
            "persist-attempts 0",
            "shell { ready-timeout -1 }",
            "relay { command \"relay\"\n power 4294967297 }",
            "relay { command \"relay\"\n recovery -2 }",
            "relay { command \"relay\"\n settle-ms -5 }",
        ] {
            assert!(
                matches!(
                    parse_system_config(kdl),
                    Err(ConfigError::InvalidValue { .. })
                ),
                "{}",
                kdl
            );
        }
    }
}
