use std::collections::HashMap;
use thiserror::Error;

use crate::plan::Severity;

/// Unified error type for plan coordination
#[derive(Debug, Error)]
pub enum CoordError {
    /// A gate assertion evaluated false
    #[error("Validation failed at {gate} gate of step {step_id}: {assertion}")]
    ValidationFailure {
        step_id: String,
        gate: String,
        assertion: String,
        reason: Option<String>,
    },

    /// A background check failed after its artifact was already consumed
    #[error("Retrospect {retro_id} on step {step_id} failed: {reason}")]
    RetrospectFailure {
        retro_id: String,
        step_id: String,
        reason: String,
    },

    /// Cumulative usage beyond the brief's constraints
    #[error("Budget exceeded: {resource} (used: {used}, attempted: {attempted}, limit: {limit})")]
    BudgetExceeded {
        resource: String,
        used: f64,
        attempted: f64,
        limit: f64,
    },

    /// A gate or retrospect resolved to Escalate/Cancel
    #[error("Escalation required ({severity}): {message}")]
    EscalationRequired {
        severity: Severity,
        message: String,
        notify: Vec<String>,
    },

    /// Replay requested for an artifact whose side effects were already published
    #[error("Replay conflict on {artifact_id}: side effects already published {effects:?}")]
    ReplayConflict {
        artifact_id: String,
        effects: Vec<String>,
    },

    /// Unrecoverable planner failure
    #[error("Planner error: {message}")]
    Planner {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Unrecoverable executor failure after fallbacks
    #[error("Executor error in step {step_id}: {message}")]
    Executor { step_id: String, message: String },

    /// Assertion could not be parsed or evaluated
    #[error("Predicate error in '{assertion}': {message}")]
    Predicate { assertion: String, message: String },

    /// Structural plan problems
    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Step not found: {0}")]
    StepNotFound(String),

    #[error("Artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("Retrospect job not found: {0}")]
    JobNotFound(String),

    #[error("Capability not registered: {0}")]
    CapabilityNotFound(String),

    /// Operation timed out
    #[error("Operation timed out: {operation} (timeout: {timeout_ms}ms)")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// Database/persistence errors
    #[error("Database operation failed: {operation}")]
    Database {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// IO errors
    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Serialization errors
    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        context: HashMap<String, String>,
    },
}

impl CoordError {
    pub fn validation<S: Into<String>, G: Into<String>, A: Into<String>>(
        step_id: S,
        gate: G,
        assertion: A,
        reason: Option<String>,
    ) -> Self {
        Self::ValidationFailure {
            step_id: step_id.into(),
            gate: gate.into(),
            assertion: assertion.into(),
            reason,
        }
    }

    pub fn budget<S: Into<String>>(resource: S, used: f64, attempted: f64, limit: f64) -> Self {
        Self::BudgetExceeded {
            resource: resource.into(),
            used,
            attempted,
            limit,
        }
    }

    pub fn escalation<S: Into<String>>(severity: Severity, message: S, notify: Vec<String>) -> Self {
        Self::EscalationRequired {
            severity,
            message: message.into(),
            notify,
        }
    }

    pub fn planner<S: Into<String>>(message: S) -> Self {
        Self::Planner {
            message: message.into(),
            source: None,
        }
    }

    pub fn planner_with_source<S: Into<String>>(message: S, source: anyhow::Error) -> Self {
        Self::Planner {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn executor<S: Into<String>, M: Into<String>>(step_id: S, message: M) -> Self {
        Self::Executor {
            step_id: step_id.into(),
            message: message.into(),
        }
    }

    pub fn predicate<S: Into<String>, M: Into<String>>(assertion: S, message: M) -> Self {
        Self::Predicate {
            assertion: assertion.into(),
            message: message.into(),
        }
    }

    pub fn invalid_plan<S: Into<String>>(message: S) -> Self {
        Self::InvalidPlan(message.into())
    }

    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    pub fn configuration_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn database<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        operation: S,
        source: E,
    ) -> Self {
        Self::Database {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    pub fn serialization<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        format: S,
        source: E,
    ) -> Self {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
            context: HashMap::new(),
        }
    }

    /// Add context to an internal error
    pub fn with_context<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        if let Self::Internal { ref mut context, .. } = self {
            context.insert(key.into(), value.into());
        }
        self
    }

    /// Whether local recovery (retry/alternate) may still succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::ValidationFailure { .. } | Self::Timeout { .. } | Self::Io { .. } => true,
            Self::Executor { .. } | Self::Database { .. } => true,
            Self::BudgetExceeded { .. }
            | Self::EscalationRequired { .. }
            | Self::ReplayConflict { .. }
            | Self::Planner { .. } => false,
            _ => false,
        }
    }

    /// Whether this error moves a run to `halted` (resumable) rather than `failed`
    pub fn halts_run(&self) -> bool {
        matches!(
            self,
            Self::BudgetExceeded { .. }
                | Self::EscalationRequired { .. }
                | Self::ReplayConflict { .. }
                | Self::ValidationFailure { .. }
        )
    }

    /// Get error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::ValidationFailure { .. } => "validation",
            Self::RetrospectFailure { .. } => "retrospect",
            Self::BudgetExceeded { .. } => "budget",
            Self::EscalationRequired { .. } => "escalation",
            Self::ReplayConflict { .. } => "replay_conflict",
            Self::Planner { .. } => "planner",
            Self::Executor { .. } => "executor",
            Self::Predicate { .. } => "predicate",
            Self::InvalidPlan(_) => "plan",
            Self::StepNotFound(_) | Self::ArtifactNotFound(_) | Self::JobNotFound(_) => {
                "not_found"
            }
            Self::CapabilityNotFound(_) => "capability",
            Self::Timeout { .. } => "timeout",
            Self::Configuration { .. } => "configuration",
            Self::Database { .. } => "database",
            Self::Io { .. } => "io",
            Self::Serialization { .. } => "serialization",
            Self::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, CoordError>;

impl From<std::io::Error> for CoordError {
    fn from(err: std::io::Error) -> Self {
        Self::io("io_operation", err)
    }
}

impl From<serde_json::Error> for CoordError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

impl From<serde_yaml::Error> for CoordError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization("yaml", err)
    }
}

impl From<sled::Error> for CoordError {
    fn from(err: sled::Error) -> Self {
        Self::database("sled_operation", err)
    }
}

impl From<anyhow::Error> for CoordError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(err.to_string()).with_context("source", "anyhow")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = CoordError::validation("ingest", "precondition", "file_exists('x.csv')", None);
        assert!(matches!(err, CoordError::ValidationFailure { .. }));
        assert_eq!(err.category(), "validation");
        assert!(err.to_string().contains("ingest"));
    }

    #[test]
    fn test_error_context() {
        let err = CoordError::internal("boom")
            .with_context("key1", "value1")
            .with_context("key2", "value2");

        if let CoordError::Internal { context, .. } = err {
            assert_eq!(context.get("key1"), Some(&"value1".to_string()));
            assert_eq!(context.get("key2"), Some(&"value2".to_string()));
        } else {
            panic!("Expected internal error");
        }
    }

    #[test]
    fn test_halting_classification() {
        assert!(CoordError::budget("cost_usd", 1.0, 2.5, 2.0).halts_run());
        assert!(CoordError::escalation(Severity::S2, "stop", vec![]).halts_run());
        assert!(!CoordError::executor("ingest", "crashed").halts_run());
        assert!(!CoordError::planner("no plan").halts_run());
        assert!(CoordError::validation("publish", "promotion", "retro_green('R1')", None).halts_run());
        assert!(!CoordError::timeout("step publish", 50).halts_run());
    }

    #[test]
    fn test_error_recoverability() {
        assert!(CoordError::timeout("step", 1000).is_recoverable());
        assert!(!CoordError::planner("bad").is_recoverable());
        assert!(!CoordError::configuration("bad").is_recoverable());
        assert!(CoordError::executor("fetch", "connection reset").is_recoverable());
        assert!(!CoordError::CapabilityNotFound("ghost".into()).is_recoverable());
    }
}
