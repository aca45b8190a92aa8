//! Default policies consulted when gates, contracts or briefs leave
//! retry bounds, escalation routing or budgets unspecified.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::core::budget::BudgetLimits;
use crate::core::errors::{CoordError, Result};
use crate::plan::{Constraints, OnFail, Severity};

/// Delay between local retries of a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RetryStrategy {
    /// Exponential backoff with configurable parameters
    Exponential {
        initial_delay_ms: u64,
        max_delay_ms: u64,
        multiplier: f64,
    },
    /// Linear backoff with fixed delay
    Linear { delay_ms: u64 },
    /// No delay between retries
    Immediate,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::Exponential {
            initial_delay_ms: 100,
            max_delay_ms: 5_000,
            multiplier: 2.0,
        }
    }
}

impl RetryStrategy {
    /// Delay before retry number `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let ms = match self {
            RetryStrategy::Exponential {
                initial_delay_ms,
                max_delay_ms,
                multiplier,
            } => {
                let delay = (*initial_delay_ms as f64 * multiplier.powf(attempt as f64)).round() as u64;
                delay.min(*max_delay_ms)
            }
            RetryStrategy::Linear { delay_ms } => *delay_ms,
            RetryStrategy::Immediate => 0,
        };
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    #[serde(default)]
    pub strategy: RetryStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            strategy: RetryStrategy::default(),
        }
    }
}

/// Who gets notified, by severity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRouting {
    pub default_severity: Severity,
    /// Fallback notify targets, e.g. the on-call team
    pub on_call: Vec<String>,
    #[serde(default)]
    pub by_severity: BTreeMap<Severity, Vec<String>>,
}

impl Default for EscalationRouting {
    fn default() -> Self {
        Self {
            default_severity: Severity::S3,
            on_call: vec!["oncall".to_string()],
            by_severity: BTreeMap::new(),
        }
    }
}

impl EscalationRouting {
    /// Explicit targets win, then per-severity routing, then on-call
    pub fn notify_for(&self, severity: Severity, explicit: &[String]) -> Vec<String> {
        if !explicit.is_empty() {
            return explicit.to_vec();
        }
        self.by_severity
            .get(&severity)
            .filter(|targets| !targets.is_empty())
            .cloned()
            .unwrap_or_else(|| self.on_call.clone())
    }
}

/// Budget thresholds applied when a brief has no constraints of its own
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetDefaults {
    pub cost_usd: Option<f64>,
    pub latency_sec: Option<f64>,
    pub max_tokens: Option<u64>,
}

/// Explicit policy object handed to each coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefaultPolicies {
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub escalation: EscalationRouting,
    #[serde(default)]
    pub budget: BudgetDefaults,
    /// Decision used by gates that declare no `on_fail`
    pub default_on_fail: OnFail,
}

impl Default for DefaultPolicies {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            escalation: EscalationRouting::default(),
            budget: BudgetDefaults::default(),
            default_on_fail: OnFail::Escalate {
                severity: None,
                notify: Vec::new(),
                message: None,
            },
        }
    }
}

impl DefaultPolicies {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let policies: DefaultPolicies = serde_yaml::from_str(yaml)?;
        policies.validate()?;
        Ok(policies)
    }

    pub fn validate(&self) -> Result<()> {
        if let RetryStrategy::Exponential { multiplier, .. } = self.retry.strategy {
            if multiplier < 1.0 {
                return Err(CoordError::configuration_field(
                    "exponential multiplier must be at least 1.0",
                    "retry.strategy.multiplier",
                ));
            }
        }
        if self.escalation.on_call.is_empty() && self.escalation.by_severity.is_empty() {
            return Err(CoordError::configuration_field(
                "escalation routing needs at least one notify target",
                "escalation.on_call",
            ));
        }
        Ok(())
    }

    pub fn severity_or_default(&self, severity: Option<Severity>) -> Severity {
        severity.unwrap_or(self.escalation.default_severity)
    }

    /// Budget limits for a brief; brief constraints win over the defaults
    pub fn limits_for(&self, constraints: &Constraints) -> BudgetLimits {
        let latency_sec = constraints.latency_sec.or(self.budget.latency_sec);
        BudgetLimits {
            cost_usd: constraints.cost_usd.or(self.budget.cost_usd),
            latency_ms: latency_sec.map(|secs| (secs * 1000.0).round().max(0.0) as u64),
            max_tokens: self.budget.max_tokens,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delays() {
        let strategy = RetryStrategy::Exponential {
            initial_delay_ms: 10,
            max_delay_ms: 50,
            multiplier: 2.0,
        };
        assert_eq!(strategy.delay(0), Duration::from_millis(10));
        assert_eq!(strategy.delay(2), Duration::from_millis(40));
        assert_eq!(strategy.delay(5), Duration::from_millis(50));
        assert_eq!(RetryStrategy::Immediate.delay(3), Duration::ZERO);
    }

    #[test]
    fn test_notify_routing() {
        let mut routing = EscalationRouting::default();
        routing
            .by_severity
            .insert(Severity::S1, vec!["incident-commander".into()]);

        assert_eq!(routing.notify_for(Severity::S1, &[]), vec!["incident-commander"]);
        assert_eq!(routing.notify_for(Severity::S2, &[]), vec!["oncall"]);
        assert_eq!(
            routing.notify_for(Severity::S1, &["privacy-team".to_string()]),
            vec!["privacy-team"]
        );
    }

    #[test]
    fn test_limits_prefer_brief_constraints() {
        let policies = DefaultPolicies {
            budget: BudgetDefaults {
                cost_usd: Some(10.0),
                latency_sec: Some(60.0),
                max_tokens: None,
            },
            ..Default::default()
        };
        let constraints = Constraints {
            cost_usd: Some(2.0),
            latency_sec: None,
            tags: vec![],
        };
        let limits = policies.limits_for(&constraints);
        assert_eq!(limits.cost_usd, Some(2.0));
        assert_eq!(limits.latency_ms, Some(60_000));
    }

    #[test]
    fn test_policies_from_yaml() {
        let yaml = r#"
retry:
  max_retries: 4
  strategy: Immediate
escalation:
  default_severity: S2
  on_call: [data-oncall]
default_on_fail:
  action: cancel
"#;
        let policies = DefaultPolicies::from_yaml_str(yaml).unwrap();
        assert_eq!(policies.retry.max_retries, 4);
        assert_eq!(policies.severity_or_default(None), Severity::S2);
        assert_eq!(policies.default_on_fail, OnFail::Cancel);
    }
}
