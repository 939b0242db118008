//! Stage definition parsing.
//!
//! A definition file describes one pipeline as an ordered list of stages, each an
//! ordered list of command entries:
//!
//! ```kdl
//! pipeline "hikey"
//!
//! stage "build" {
//!     run "make -j8" timeout=600
//!     run "source env.sh" check=#false
//!     run "./flash.sh" timeout=60 {
//!         expect "OKAY"
//!         expect "FAILED"
//!     }
//!     wait "login:" "Kernel panic" timeout=30
//!     noop
//! }
//!
//! stage "power-off" always=#true {
//!     run "true"
//! }
//! ```

use crate::{ConfigError, ConfigResult};
use boardci_core::pipeline::{
    CommandEntry, DEFAULT_COMMAND_TIMEOUT, DEFAULT_FAIL_FROM, Expectation, Pipeline, Stage,
};
use kdl::{KdlDocument, KdlNode};
use regex::Regex;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Parse one stage definition from KDL text.
pub fn parse_pipeline(kdl: &str) -> ConfigResult<Pipeline> {
    let doc: KdlDocument = kdl.parse()?;

    let mut name = String::new();
    let mut stages: Vec<Stage> = Vec::new();
    let mut seen = HashSet::new();

    for node in doc.nodes() {
        match node.name().value() {
            "pipeline" => {
                name = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("pipeline name".to_string()))?;
            }
            "stage" => {
                let stage = parse_stage(node)?;
                if !seen.insert(stage.name.clone()) {
                    return Err(ConfigError::Duplicate(format!("stage '{}'", stage.name)));
                }
                stages.push(stage);
            }
            _ => {} // Ignore unknown nodes
        }
    }

    if name.is_empty() {
        return Err(ConfigError::MissingField("pipeline name".to_string()));
    }

    Ok(Pipeline { name, stages })
}

/// Load every `*.kdl` definition in `dir`, in file name order.
pub fn load_definitions(dir: &Path) -> ConfigResult<Vec<Pipeline>> {
    let mut paths: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "kdl"))
        .collect();
    paths.sort();

    if paths.is_empty() {
        return Err(ConfigError::NoDefinitions(dir.display().to_string()));
    }

    let mut pipelines = Vec::with_capacity(paths.len());
    for path in paths {
        debug!(path = %path.display(), "Loading stage definition");
        let content = std::fs::read_to_string(&path)?;
        pipelines.push(parse_pipeline(&content)?);
    }
    Ok(pipelines)
}

fn parse_stage(node: &KdlNode) -> ConfigResult<Stage> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("stage name".to_string()))?;
    let always = get_bool_prop(node, "always").unwrap_or(false);

    let mut entries = Vec::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            entries.push(parse_entry(&name, child)?);
        }
    }

    Ok(Stage {
        name,
        entries,
        always,
    })
}

fn parse_entry(stage: &str, node: &KdlNode) -> ConfigResult<CommandEntry> {
    let kind = node.name().value();
    let timeout = get_timeout(node)?.unwrap_or(DEFAULT_COMMAND_TIMEOUT);

    let entry = match kind {
        "noop" => CommandEntry::noop(),
        "send" => {
            let command = require_command(stage, node)?;
            CommandEntry::send(command)
        }
        "run" => {
            let command = require_command(stage, node)?;
            let patterns = collect_expectations(stage, node)?;
            match (get_bool_prop(node, "check"), patterns.is_empty()) {
                (Some(true), false) => {
                    return Err(ConfigError::InvalidValue {
                        field: format!("stage '{}' command '{}'", stage, command),
                        message: "cannot check the return code and expect output at once"
                            .to_string(),
                    });
                }
                (Some(false), true) => CommandEntry::send(command),
                (_, true) => CommandEntry::checked(command),
                (_, false) => CommandEntry {
                    command: Some(command),
                    expectation: pattern_expectation(stage, node, patterns)?,
                    timeout,
                },
            }
        }
        "wait" => {
            let mut patterns = get_all_string_args(node);
            patterns.extend(collect_expectations(stage, node)?);
            if patterns.is_empty() {
                return Err(ConfigError::MissingField(format!(
                    "pattern for wait in stage '{}'",
                    stage
                )));
            }
            CommandEntry {
                command: None,
                expectation: pattern_expectation(stage, node, patterns)?,
                timeout,
            }
        }
        other => {
            return Err(ConfigError::InvalidValue {
                field: format!("stage '{}'", stage),
                message: format!("unknown entry kind: {}", other),
            });
        }
    };

    Ok(entry.with_timeout(timeout))
}

fn require_command(stage: &str, node: &KdlNode) -> ConfigResult<String> {
    get_first_string_arg(node).ok_or_else(|| {
        ConfigError::MissingField(format!(
            "command for '{}' in stage '{}'",
            node.name().value(),
            stage
        ))
    })
}

/// `expect="..."` properties and `expect "..."` children, in declaration order.
/// Any other child node is rejected.
fn collect_expectations(stage: &str, node: &KdlNode) -> ConfigResult<Vec<String>> {
    let mut patterns = get_string_list_prop(node, "expect");
    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "expect" => patterns.extend(get_all_string_args(child)),
                other => {
                    return Err(ConfigError::InvalidValue {
                        field: format!("stage '{}' {}", stage, node.name().value()),
                        message: format!("unknown child node: {}", other),
                    });
                }
            }
        }
    }
    Ok(patterns)
}

fn pattern_expectation(
    stage: &str,
    node: &KdlNode,
    patterns: Vec<String>,
) -> ConfigResult<Expectation> {
    for pattern in &patterns {
        Regex::new(pattern).map_err(|source| ConfigError::Pattern {
            pattern: pattern.clone(),
            source,
        })?;
    }

    let fail_from = match node.get("fail-from").and_then(|v| v.as_integer()) {
        Some(n) if n >= 1 => usize::try_from(n).map_err(|_| ConfigError::InvalidValue {
            field: format!("fail-from in stage '{}'", stage),
            message: format!("out of range: {}", n),
        })?,
        Some(n) => {
            return Err(ConfigError::InvalidValue {
                field: format!("fail-from in stage '{}'", stage),
                message: format!("must be at least 1, got {}", n),
            });
        }
        None => DEFAULT_FAIL_FROM,
    };

    Ok(Expectation::Patterns {
        patterns,
        fail_from,
    })
}

fn get_timeout(node: &KdlNode) -> ConfigResult<Option<Duration>> {
    let Some(value) = node.get("timeout") else {
        return Ok(None);
    };
    let secs = value
        .as_integer()
        .map(|i| i as f64)
        .or_else(|| value.as_float())
        .ok_or_else(|| ConfigError::InvalidValue {
            field: "timeout".to_string(),
            message: format!("expected a number of seconds, got {}", value),
        })?;
    if secs <= 0.0 {
        return Err(ConfigError::InvalidValue {
            field: "timeout".to_string(),
            message: "must be positive".to_string(),
        });
    }
    Duration::try_from_secs_f64(secs)
        .map(Some)
        .map_err(|e| ConfigError::InvalidValue {
            field: "timeout".to_string(),
            message: e.to_string(),
        })
}

// Helper functions for extracting values from KDL nodes

pub(crate) fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

pub(crate) fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

pub(crate) fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

pub(crate) fn get_bool_prop(node: &KdlNode, name: &str) -> Option<bool> {
    node.get(name).and_then(|v| v.as_bool())
}

fn get_string_list_prop(node: &KdlNode, name: &str) -> Vec<String> {
    // Repeated properties (expect="a" expect="b") are kept in order
    node.entries()
        .iter()
        .filter(|e| e.name().is_some_and(|n| n.value() == name))
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}
