//! Pluggable checks used by contract validators and retrospects
//!
//! A check reference that names a registered [`Check`] runs that check.
//! Any other reference is treated as an assertion and evaluated against
//! the artifact with the predicate evaluator.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::predicate::{PredicateContext, PredicateEvaluator};

/// What a check gets to look at
#[derive(Debug, Clone, Default)]
pub struct CheckInput {
    pub plan_id: String,
    pub step_id: String,
    pub artifact_id: String,
    /// The artifact value under inspection
    pub output: Value,
    /// Validator arguments (`null` for retrospect checks)
    pub args: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckVerdict {
    pub passed: bool,
    pub reason: Option<String>,
}

impl CheckVerdict {
    pub fn pass() -> Self {
        Self {
            passed: true,
            reason: None,
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            reason: Some(reason.into()),
        }
    }
}

/// A named validation routine
#[async_trait]
pub trait Check: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, input: &CheckInput) -> anyhow::Result<CheckVerdict>;
}

/// Registry for checks
#[derive(Clone)]
pub struct CheckRegistry {
    checks: Arc<RwLock<HashMap<String, Arc<dyn Check>>>>,
}

impl CheckRegistry {
    pub fn new() -> Self {
        Self {
            checks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn register(&self, check: Arc<dyn Check>) {
        let mut checks = self.checks.write();
        checks.insert(check.name().to_string(), check);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Check>> {
        self.checks.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.checks.read().contains_key(name)
    }

    pub fn list(&self) -> Vec<String> {
        self.checks.read().keys().cloned().collect()
    }

    /// Run one check reference. Errors from the check itself count as a
    /// failed verdict.
    pub async fn run(
        &self,
        reference: &str,
        input: &CheckInput,
        predicate: &dyn PredicateEvaluator,
        ctx: &PredicateContext,
    ) -> CheckVerdict {
        if let Some(check) = self.get(reference) {
            return match check.run(input).await {
                Ok(verdict) => verdict,
                Err(e) => CheckVerdict::fail(format!("check '{}' errored: {}", reference, e)),
            };
        }

        debug!("'{}' is not a registered check, evaluating as assertion", reference);
        match predicate.evaluate(reference, ctx) {
            Ok(true) => CheckVerdict::pass(),
            Ok(false) => CheckVerdict::fail(format!("assertion '{}' is false", reference)),
            Err(e) => CheckVerdict::fail(e.to_string()),
        }
    }
}

impl Default for CheckRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Check backed by a plain function
pub struct FnCheck<F> {
    name: String,
    func: F,
}

impl<F> FnCheck<F>
where
    F: Fn(&CheckInput) -> CheckVerdict + Send + Sync,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

#[async_trait]
impl<F> Check for FnCheck<F>
where
    F: Fn(&CheckInput) -> CheckVerdict + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, input: &CheckInput) -> anyhow::Result<CheckVerdict> {
        Ok((self.func)(input))
    }
}
