//! Error types returned by the host runtime.
//!
//! Every builder, configuration, container and lifecycle failure is returned
//! as a value. Only binaries decide whether an error terminates the process.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Errors produced while composing or reading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load config file {path}: {message}")]
    File { path: PathBuf, message: String },
    #[error("invalid command line: {0}")]
    CommandLine(String),
    #[error("invalid default for key {key}: {message}")]
    Default { key: String, message: String },
    #[error("config key {0:?} not found")]
    MissingKey(String),
    #[error("config section {0:?} not found")]
    MissingSection(String),
    #[error("config key {key:?} could not be decoded: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to watch config files: {0}")]
    Watch(#[from] notify::Error),
}

/// Errors produced while building or resolving the dependency graph.
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("no binding registered for type {type_name}")]
    Missing { type_name: &'static str },
    #[error("type {type_name} is bound more than once")]
    Duplicate { type_name: &'static str },
    #[error("dependency cycle detected: {}", path.join(" -> "))]
    Cycle { path: Vec<&'static str> },
    #[error("factory for {type_name} failed: {source}")]
    Factory {
        type_name: &'static str,
        #[source]
        source: anyhow::Error,
    },
    #[error("invalid service registrations: {}", join_all(.0))]
    Invalid(Vec<ContainerError>),
}

fn join_all(errors: &[ContainerError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// A single lifecycle hook failure.
#[derive(Debug)]
pub struct HookFailure {
    pub hook: String,
    pub error: anyhow::Error,
}

impl fmt::Display for HookFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {:#}", self.hook, self.error)
    }
}

/// Errors produced by [`Lifecycle`](crate::lifecycle::Lifecycle) transitions.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("start hook {hook} failed: {source:#}")]
    Start {
        hook: String,
        #[source]
        source: anyhow::Error,
    },
    /// Stop failures in the order they were encountered; the first is primary.
    #[error("{} stop hook(s) failed; first: {}", failures.len(), failures[0])]
    Stop { failures: Vec<HookFailure> },
    #[error("cannot {operation} while host is {state}")]
    InvalidState {
        operation: &'static str,
        state: crate::lifecycle::HostState,
    },
    #[error("stop hook {hook} exceeded the shutdown window of {window:?}")]
    Timeout { hook: String, window: Duration },
}

/// Aggregated build-time validation issues.
#[derive(Debug, Default)]
pub struct ValidationErrors(pub Vec<String>);

impl ValidationErrors {
    pub fn push(&mut self, issue: impl Into<String>) {
        self.0.push(issue.into());
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn extend(&mut self, other: ValidationErrors) {
        self.0.extend(other.0);
    }

    /// Returns `Ok(())` when no issue was recorded.
    ///
    /// # Errors
    ///
    /// Returns `HostError::Validation` carrying every recorded issue.
    pub fn into_result(self) -> Result<(), HostError> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(HostError::Validation(self))
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} issue(s): {}", self.0.len(), self.0.join("; "))
    }
}

/// Top-level error returned by host builders and `run`.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Container(#[from] ContainerError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error("invalid host configuration: {0}")]
    Validation(ValidationErrors),
    #[error("failed to initialize logger: {0}")]
    Logger(String),
    #[error("HTTP drain exceeded {grace:?}; remaining connections were closed")]
    DrainTimeout { grace: Duration },
    #[error("HTTP server failed: {0}")]
    Server(#[source] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HostError {
    /// Flattens this error into validation issues, when it is one.
    #[must_use]
    pub fn into_validation(self) -> Result<ValidationErrors, HostError> {
        match self {
            HostError::Validation(issues) => Ok(issues),
            HostError::Container(ContainerError::Invalid(errors)) => Ok(ValidationErrors(
                errors.iter().map(ToString::to_string).collect(),
            )),
            HostError::Container(err) => Ok(ValidationErrors(vec![err.to_string()])),
            other => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_error_names_first_failure() {
        let err = LifecycleError::Stop {
            failures: vec![
                HookFailure {
                    hook: "b".to_string(),
                    error: anyhow::anyhow!("disk gone"),
                },
                HookFailure {
                    hook: "a".to_string(),
                    error: anyhow::anyhow!("socket gone"),
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.starts_with("2 stop hook(s) failed"));
        assert!(msg.contains("b: disk gone"));
    }

    #[test]
    fn validation_errors_join_issues() {
        let mut issues = ValidationErrors::default();
        assert!(issues.is_empty());
        issues.push("port is empty");
        issues.push("mode is empty");
        let err = issues.into_result().unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid host configuration: 2 issue(s): port is empty; mode is empty"
        );
    }

    #[test]
    fn container_error_flattens_into_validation() {
        let err = HostError::Container(ContainerError::Missing {
            type_name: "app::Repo",
        });
        let issues = err.into_validation().unwrap();
        assert_eq!(issues.0, vec!["no binding registered for type app::Repo"]);
    }
}
