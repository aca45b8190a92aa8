//! Data model shared by every component: briefs, contracts, gates and
//! retrospect declarations.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

use crate::core::errors::Result;

/// Escalation severity, `S1` being the most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    S1,
    S2,
    S3,
    S4,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::S1 => "S1",
            Severity::S2 => "S2",
            Severity::S3 => "S3",
            Severity::S4 => "S4",
        };
        f.write_str(s)
    }
}

/// Budget and domain constraints of a brief
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Constraints {
    #[serde(default)]
    pub cost_usd: Option<f64>,
    #[serde(default)]
    pub latency_sec: Option<f64>,
    /// Domain tags such as "privacy"
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Named assertion checked once every step has finished
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptanceTest {
    pub name: String,
    pub assertion: String,
}

/// Declarative description of a goal. Immutable once created.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskBrief {
    pub objective: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,
    /// Output key -> type tag
    #[serde(default)]
    pub required_outputs: BTreeMap<String, String>,
    #[serde(default)]
    pub acceptance_tests: Vec<AcceptanceTest>,
    #[serde(default)]
    pub constraints: Constraints,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl TaskBrief {
    pub fn new(objective: impl Into<String>) -> Self {
        Self {
            objective: objective.into(),
            ..Default::default()
        }
    }

    pub fn with_input(mut self, key: impl Into<String>, value: Value) -> Self {
        self.inputs.insert(key.into(), value);
        self
    }

    pub fn with_required_output(mut self, key: impl Into<String>, type_tag: impl Into<String>) -> Self {
        self.required_outputs.insert(key.into(), type_tag.into());
        self
    }

    pub fn with_acceptance_test(mut self, name: impl Into<String>, assertion: impl Into<String>) -> Self {
        self.acceptance_tests.push(AcceptanceTest {
            name: name.into(),
            assertion: assertion.into(),
        });
        self
    }

    pub fn with_budget(mut self, cost_usd: Option<f64>, latency_sec: Option<f64>) -> Self {
        self.constraints.cost_usd = cost_usd;
        self.constraints.latency_sec = latency_sec;
        self
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }
}

/// Named, optionally typed slot. Inputs resolve either from a literal `value`
/// or from a template `reference` (`inputs.key`, `step`, `step.field.sub`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IoSlot {
    pub name: String,
    #[serde(default)]
    pub type_tag: Option<String>,
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub value: Option<Value>,
}

impl IoSlot {
    pub fn reference(name: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_tag: None,
            reference: Some(reference.into()),
            value: None,
        }
    }

    pub fn literal(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            type_tag: None,
            reference: None,
            value: Some(value),
        }
    }

    pub fn typed(name: impl Into<String>, type_tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_tag: Some(type_tag.into()),
            reference: None,
            value: None,
        }
    }

    /// Reference with any `{{ }}` template wrapping removed
    pub fn reference_path(&self) -> Option<&str> {
        self.reference.as_deref().map(strip_template)
    }
}

pub(crate) fn strip_template(reference: &str) -> &str {
    let trimmed = reference.trim();
    trimmed
        .strip_prefix("{{")
        .and_then(|r| r.strip_suffix("}}"))
        .map(str::trim)
        .unwrap_or(trimmed)
}

/// Whether a JSON value satisfies a slot's type tag
pub fn type_matches(type_tag: &str, value: &Value) -> bool {
    match type_tag {
        "string" | "str" => value.is_string(),
        "number" | "float" | "f64" => value.is_number(),
        "int" | "integer" => value.is_i64() || value.is_u64(),
        "bool" | "boolean" => value.is_boolean(),
        "object" | "map" => value.is_object(),
        "array" | "list" => value.is_array(),
        _ => !value.is_null() || type_tag == "any",
    }
}

/// Pluggable validator reference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatorRef {
    #[serde(rename = "fn")]
    pub func: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    Precondition,
    Postcondition,
    Promotion,
}

impl fmt::Display for GateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GateKind::Precondition => "precondition",
            GateKind::Postcondition => "postcondition",
            GateKind::Promotion => "promotion",
        };
        f.write_str(s)
    }
}

/// Declared failure handling of a gate. Missing fields are completed from
/// the contract's escalation block and the default policies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum OnFail {
    Retry {
        #[serde(default)]
        max: Option<u32>,
    },
    Alternate {
        agent_or_tool: String,
    },
    Replan {
        #[serde(default)]
        target: Option<String>,
    },
    Escalate {
        #[serde(default)]
        severity: Option<Severity>,
        #[serde(default)]
        notify: Vec<String>,
        #[serde(default)]
        message: Option<String>,
    },
    Cancel,
}

/// Checkpoint that must pass for execution to proceed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gate {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: GateKind,
    pub assertion: String,
    #[serde(default)]
    pub on_fail: Option<OnFail>,
    /// Severity used once retries are exhausted
    #[serde(default)]
    pub fallback_severity: Option<Severity>,
}

impl Gate {
    pub fn new(kind: GateKind, assertion: impl Into<String>) -> Self {
        Self {
            id: None,
            kind,
            assertion: assertion.into(),
            on_fail: None,
            fallback_severity: None,
        }
    }

    pub fn on_fail(mut self, on_fail: OnFail) -> Self {
        self.on_fail = Some(on_fail);
        self
    }

    pub fn with_fallback_severity(mut self, severity: Severity) -> Self {
        self.fallback_severity = Some(severity);
        self
    }

    /// Stable key used for per-gate attempt counting
    pub fn key(&self) -> String {
        self.id
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.kind, self.assertion))
    }
}

/// Escalation routing attached to a contract or a retrospect
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Escalation {
    #[serde(default)]
    pub severity: Option<Severity>,
    #[serde(default)]
    pub notify: Vec<String>,
}

/// What happens when a retrospect fails
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetroOnFail {
    #[serde(default)]
    pub invalidate_downstream: bool,
    /// Step to re-execute; defaults to the retrospected step
    #[serde(default)]
    pub replay_from: Option<String>,
    /// Parameter overrides applied to the replayed step
    #[serde(default)]
    pub patch: Option<Value>,
    #[serde(default)]
    pub escalate: Option<Escalation>,
}

/// Heavy validation that runs in the background after a step succeeds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrospectSpec {
    pub id: String,
    pub checks: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub on_fail: RetroOnFail,
}

impl RetrospectSpec {
    pub fn new(id: impl Into<String>, checks: Vec<String>) -> Self {
        Self {
            id: id.into(),
            checks,
            timeout_secs: None,
            on_fail: RetroOnFail::default(),
        }
    }

    pub fn invalidating(mut self, replay_from: Option<String>, patch: Option<Value>) -> Self {
        self.on_fail.invalidate_downstream = true;
        self.on_fail.replay_from = replay_from;
        self.on_fail.patch = patch;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }
}

/// Executor-level recovery, applied in order when a capability errors or times out
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Fallback {
    Retry { max: u32 },
    Alternate { agent_or_tool: String },
}

/// Specification of one executable step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionContract {
    pub id: String,
    #[serde(default)]
    pub intent: String,
    pub agent_or_tool: String,
    #[serde(default)]
    pub inputs: Vec<IoSlot>,
    #[serde(default)]
    pub outputs: Vec<IoSlot>,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub preconditions: Vec<String>,
    #[serde(default)]
    pub postconditions: Vec<String>,
    #[serde(default)]
    pub validators: Vec<ValidatorRef>,
    #[serde(default)]
    pub gates: Vec<Gate>,
    #[serde(default)]
    pub retrospects: Vec<RetrospectSpec>,
    #[serde(default)]
    pub fallbacks: Vec<Fallback>,
    #[serde(default)]
    pub side_effects: Vec<String>,
    #[serde(default)]
    pub confidence_floor: Option<f64>,
    #[serde(default)]
    pub requires_retro_green: Vec<String>,
    #[serde(default)]
    pub escalation: Escalation,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl ActionContract {
    /// Gates of one kind, with the bare assertion lists folded in
    pub fn gates_of(&self, kind: GateKind) -> Vec<Gate> {
        let bare: &[String] = match kind {
            GateKind::Precondition => self.preconditions.as_slice(),
            GateKind::Postcondition => self.postconditions.as_slice(),
            GateKind::Promotion => &[],
        };
        bare.iter()
            .map(|assertion| Gate::new(kind, assertion.clone()))
            .chain(self.gates.iter().filter(|g| g.kind == kind).cloned())
            .collect()
    }

    /// Whether this step must pass a promotion check before it runs
    pub fn needs_promotion(&self) -> bool {
        !self.requires_retro_green.is_empty()
            || self.gates.iter().any(|g| g.kind == GateKind::Promotion)
    }

    /// Apply parameter overrides: merged into `params`, and any input slot
    /// of the same name is pinned to the literal value.
    pub fn apply_patch(&mut self, patch: &Value) {
        let Some(overrides) = patch.as_object() else {
            return;
        };
        for (key, value) in overrides {
            self.params.insert(key.clone(), value.clone());
            if let Some(slot) = self.inputs.iter_mut().find(|s| &s.name == key) {
                slot.reference = None;
                slot.value = Some(value.clone());
            }
        }
    }

    /// Stable digest of the contract, used to decide artifact reuse
    pub fn fingerprint(&self) -> u64 {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        serde_json::to_string(self).unwrap_or_default().hash(&mut hasher);
        hasher.finish()
    }
}
