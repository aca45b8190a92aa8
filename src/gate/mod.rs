//! Gate evaluation
//!
//! A gate is an assertion checked at a fixed point of a step's life. When
//! it fails, its declared `on_fail` is resolved into exactly one fully
//! specified [`GateDecision`]; missing severity and notify targets come from
//! the contract's escalation block and then from the default policies.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::core::policy::DefaultPolicies;
use crate::plan::{Escalation, Gate, GateKind, OnFail, Severity};
use crate::predicate::{PredicateContext, PredicateEvaluator};

/// Resolved failure handling for a gate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum GateDecision {
    Retry {
        max: u32,
    },
    Alternate {
        agent_or_tool: String,
    },
    Replan {
        target: String,
    },
    Escalate {
        severity: Severity,
        notify: Vec<String>,
        message: String,
    },
    Cancel {},
}

impl GateDecision {
    /// Escalate and Cancel move the run toward `halted`
    pub fn halts(&self) -> bool {
        matches!(self, GateDecision::Escalate { .. } | GateDecision::Cancel {})
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GateOutcome {
    Passed,
    Failed {
        kind: GateKind,
        gate_key: String,
        assertion: String,
        reason: Option<String>,
        decision: GateDecision,
    },
}

impl GateOutcome {
    pub fn passed(&self) -> bool {
        matches!(self, GateOutcome::Passed)
    }
}

/// Everything needed to resolve a failed gate besides the gate itself
#[derive(Debug, Clone, Copy)]
pub struct GateScope<'a> {
    pub step_id: &'a str,
    pub escalation: &'a Escalation,
    /// Failed attempts of this gate so far, the current one excluded
    pub attempts: u32,
}

pub struct GateEvaluator {
    predicate: Arc<dyn PredicateEvaluator>,
    policies: Arc<DefaultPolicies>,
}

impl GateEvaluator {
    pub fn new(predicate: Arc<dyn PredicateEvaluator>, policies: Arc<DefaultPolicies>) -> Self {
        Self { predicate, policies }
    }

    pub fn predicate(&self) -> &Arc<dyn PredicateEvaluator> {
        &self.predicate
    }

    pub fn policies(&self) -> &DefaultPolicies {
        &self.policies
    }

    /// Evaluate a gate; a predicate error counts as the gate failing
    pub fn evaluate(&self, gate: &Gate, ctx: &PredicateContext, scope: GateScope<'_>) -> GateOutcome {
        let reason = match self.predicate.evaluate(&gate.assertion, ctx) {
            Ok(true) => {
                debug!("{} gate passed on {}: {}", gate.kind, scope.step_id, gate.assertion);
                return GateOutcome::Passed;
            }
            Ok(false) => None,
            Err(e) => Some(e.to_string()),
        };

        let decision = self.resolve(gate, scope, reason.as_deref());
        warn!(
            "{} gate failed on {}: {} -> {:?}",
            gate.kind, scope.step_id, gate.assertion, decision
        );
        GateOutcome::Failed {
            kind: gate.kind,
            gate_key: gate.key(),
            assertion: gate.assertion.clone(),
            reason,
            decision,
        }
    }

    /// Evaluate gates in order and stop at the first failure
    pub fn evaluate_all<F>(
        &self,
        gates: &[Gate],
        ctx: &PredicateContext,
        step_id: &str,
        escalation: &Escalation,
        attempts: F,
    ) -> GateOutcome
    where
        F: Fn(&Gate) -> u32,
    {
        for gate in gates {
            let scope = GateScope {
                step_id,
                escalation,
                attempts: attempts(gate),
            };
            let outcome = self.evaluate(gate, ctx, scope);
            if !outcome.passed() {
                return outcome;
            }
        }
        GateOutcome::Passed
    }

    /// Resolve a failed gate's `on_fail` into a concrete decision
    pub fn resolve(&self, gate: &Gate, scope: GateScope<'_>, reason: Option<&str>) -> GateDecision {
        let on_fail = gate.on_fail.as_ref().unwrap_or(&self.policies.default_on_fail);
        match on_fail {
            OnFail::Retry { max } => {
                let max = max.unwrap_or(self.policies.retry.max_retries);
                if scope.attempts < max {
                    GateDecision::Retry { max }
                } else {
                    self.exhausted(gate, scope, &format!("after {} retries", max))
                }
            }
            OnFail::Alternate { agent_or_tool } => GateDecision::Alternate {
                agent_or_tool: agent_or_tool.clone(),
            },
            OnFail::Replan { target } => GateDecision::Replan {
                target: target.clone().unwrap_or_else(|| scope.step_id.to_string()),
            },
            OnFail::Escalate {
                severity,
                notify,
                message,
            } => {
                let severity = severity
                    .or(gate.fallback_severity)
                    .or(scope.escalation.severity)
                    .unwrap_or(self.policies.escalation.default_severity);
                let explicit = if notify.is_empty() {
                    scope.escalation.notify.as_slice()
                } else {
                    notify.as_slice()
                };
                let message = message.clone().unwrap_or_else(|| {
                    let mut msg = format!(
                        "{} gate failed on step {}: {}",
                        gate.kind, scope.step_id, gate.assertion
                    );
                    if let Some(reason) = reason {
                        msg.push_str(&format!(" ({})", reason));
                    }
                    msg
                });
                GateDecision::Escalate {
                    notify: self.policies.escalation.notify_for(severity, explicit),
                    severity,
                    message,
                }
            }
            OnFail::Cancel => GateDecision::Cancel {},
        }
    }

    /// Escalation used once local recovery is used up: the gate's fallback
    /// severity, then the contract's, then the policy default.
    pub fn exhausted(&self, gate: &Gate, scope: GateScope<'_>, detail: &str) -> GateDecision {
        let severity = gate
            .fallback_severity
            .or(scope.escalation.severity)
            .unwrap_or(self.policies.escalation.default_severity);
        GateDecision::Escalate {
            notify: self
                .policies
                .escalation
                .notify_for(severity, &scope.escalation.notify),
            severity,
            message: format!(
                "{} gate on step {} still failing {}: {}",
                gate.kind, scope.step_id, detail, gate.assertion
            ),
        }
    }
}
