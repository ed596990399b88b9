// src/config/validate.rs

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::config::model::{ProjectFile, RawProjectFile};
use crate::errors::{ControllerError, Result};
use crate::reconciler::command::COMMAND_KIND;

/// Resource kinds the `resctl` binary knows how to reconcile.
pub const KNOWN_KINDS: &[&str] = &[COMMAND_KIND];

impl TryFrom<RawProjectFile> for ProjectFile {
    type Error = ControllerError;

    fn try_from(raw: RawProjectFile) -> std::result::Result<Self, Self::Error> {
        validate_config(&raw)?;
        Ok(ProjectFile::new_unchecked(raw))
    }
}

/// Run every check on a raw project file.
pub fn validate_config(cfg: &RawProjectFile) -> Result<()> {
    ensure_has_resources(cfg)?;
    validate_controller_section(cfg)?;
    validate_resources(cfg)?;
    validate_dag(cfg)?;
    Ok(())
}

fn ensure_has_resources(cfg: &RawProjectFile) -> Result<()> {
    if cfg.resource.is_empty() {
        return Err(ControllerError::ConfigError(
            "config must contain at least one [resource.<name>] section".to_string(),
        ));
    }
    Ok(())
}

fn validate_controller_section(cfg: &RawProjectFile) -> Result<()> {
    let c = &cfg.controller;
    let durations = [
        ("flush_interval_ms", c.flush_interval_ms),
        ("shutdown_timeout_ms", c.shutdown_timeout_ms),
        ("flush_timeout_ms", c.flush_timeout_ms),
    ];
    for (field, value) in durations {
        if value == 0 {
            return Err(ControllerError::ConfigError(format!(
                "[controller].{field} must be >= 1 (got 0)"
            )));
        }
    }
    if c.completion_buffer == 0 {
        return Err(ControllerError::ConfigError(
            "[controller].completion_buffer must be >= 1 (got 0)".to_string(),
        ));
    }
    Ok(())
}

fn validate_resources(cfg: &RawProjectFile) -> Result<()> {
    for (name, r) in cfg.resource.iter() {
        if !KNOWN_KINDS.contains(&r.kind.as_str()) {
            return Err(ControllerError::ConfigError(format!(
                "resource '{}' has unknown kind '{}'",
                name, r.kind
            )));
        }
        if r.cmd.trim().is_empty() {
            return Err(ControllerError::ConfigError(format!(
                "resource '{name}' has an empty `cmd`"
            )));
        }
        if r.refresh_every_ms == Some(0) {
            return Err(ControllerError::ConfigError(format!(
                "resource '{name}' has refresh_every_ms = 0"
            )));
        }
        for dep in r.refs.iter() {
            if dep == name {
                return Err(ControllerError::ConfigError(format!(
                    "resource '{name}' cannot reference itself in `refs`"
                )));
            }
            if !cfg.resource.contains_key(dep) {
                return Err(ControllerError::ConfigError(format!(
                    "resource '{}' has unknown reference '{}' in `refs`",
                    name, dep
                )));
            }
        }
    }
    Ok(())
}

fn validate_dag(cfg: &RawProjectFile) -> Result<()> {
    // Edge direction: ref -> resource.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();

    for name in cfg.resource.keys() {
        graph.add_node(name.as_str());
    }
    for (name, r) in cfg.resource.iter() {
        for dep in r.refs.iter() {
            graph.add_edge(dep.as_str(), name.as_str(), ());
        }
    }

    match toposort(&graph, None) {
        Ok(_order) => Ok(()),
        Err(cycle) => Err(ControllerError::DagCycle(format!(
            "cycle detected in resource refs involving '{}'",
            cycle.node_id()
        ))),
    }
}
