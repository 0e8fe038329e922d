//! Error type shared by every luks-autounlock crate.

use crate::workflow::WorkflowEvent;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type AutounlockResult<T> = Result<T, AutounlockError>;

#[derive(Debug, Error)]
pub enum AutounlockError {
    #[error("usage: {0}")]
    Usage(String),

    #[error("{0}")]
    Privilege(String),

    #[error("required tool `{tool}` not found; tried {tried}")]
    MissingTool { tool: String, tried: String },

    #[error("no block device found with UUID {uuid} (volume `{volume}`)")]
    Resolution { volume: String, uuid: String },

    #[error("{} volume(s) failed validation:\n  - {}", .0.len(), .0.join("\n  - "))]
    Validation(Vec<String>),

    #[error("{0}")]
    Provider(String),

    #[error("{}:{line}: {reason}", .path.display())]
    Crypttab {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to parse TOML configuration: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("failed to parse YAML configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("{source}; {}", rollback_summary(.failures))]
    RolledBack {
        source: Box<AutounlockError>,
        failures: Vec<String>,
        /// What the run reported up to the failure, followed by the rollback outcome.
        events: Vec<WorkflowEvent>,
    },
}

impl AutounlockError {
    /// Events a rolled-back run produced before it failed.
    pub fn partial_events(&self) -> &[WorkflowEvent] {
        match self {
            AutounlockError::RolledBack { events, .. } => events,
            _ => &[],
        }
    }

    /// The failure that triggered a rollback, or `self` otherwise.
    pub fn root_cause(&self) -> &AutounlockError {
        match self {
            AutounlockError::RolledBack { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

fn rollback_summary(failures: &[String]) -> String {
    if failures.is_empty() {
        "completed changes were rolled back".to_string()
    } else {
        format!(
            "rollback was incomplete, inspect manually:\n  - {}",
            failures.join("\n  - ")
        )
    }
}
