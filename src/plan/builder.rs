//! Declarative builders for plans and contracts

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::model::*;
use super::Plan;
use crate::core::errors::Result;

/// Fluent builder for a single action contract
#[derive(Debug, Clone)]
pub struct ContractBuilder {
    contract: ActionContract,
    deps: Vec<String>,
}

impl ContractBuilder {
    /// Create a new contract with minimal fields
    pub fn new(id: impl Into<String>, agent_or_tool: impl Into<String>) -> Self {
        Self {
            contract: ActionContract {
                id: id.into(),
                agent_or_tool: agent_or_tool.into(),
                ..Default::default()
            },
            deps: Vec::new(),
        }
    }

    pub fn intent(mut self, intent: impl Into<String>) -> Self {
        self.contract.intent = intent.into();
        self
    }

    /// Add a single dependency
    pub fn after(mut self, dep: impl Into<String>) -> Self {
        self.deps.push(dep.into());
        self
    }

    pub fn input_ref(mut self, name: impl Into<String>, reference: impl Into<String>) -> Self {
        self.contract.inputs.push(IoSlot::reference(name, reference));
        self
    }

    pub fn input_value(mut self, name: impl Into<String>, value: Value) -> Self {
        self.contract.inputs.push(IoSlot::literal(name, value));
        self
    }

    pub fn output(mut self, name: impl Into<String>, type_tag: impl Into<String>) -> Self {
        self.contract.outputs.push(IoSlot::typed(name, type_tag));
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.contract.params.insert(key.into(), value);
        self
    }

    pub fn precondition(mut self, assertion: impl Into<String>) -> Self {
        self.contract.preconditions.push(assertion.into());
        self
    }

    pub fn postcondition(mut self, assertion: impl Into<String>) -> Self {
        self.contract.postconditions.push(assertion.into());
        self
    }

    pub fn validator(mut self, func: impl Into<String>, args: Value) -> Self {
        self.contract.validators.push(ValidatorRef {
            func: func.into(),
            args,
        });
        self
    }

    pub fn gate(mut self, gate: Gate) -> Self {
        self.contract.gates.push(gate);
        self
    }

    pub fn retrospect(mut self, spec: RetrospectSpec) -> Self {
        self.contract.retrospects.push(spec);
        self
    }

    pub fn fallback(mut self, fallback: Fallback) -> Self {
        self.contract.fallbacks.push(fallback);
        self
    }

    pub fn side_effect(mut self, tag: impl Into<String>) -> Self {
        self.contract.side_effects.push(tag.into());
        self
    }

    pub fn confidence_floor(mut self, floor: f64) -> Self {
        self.contract.confidence_floor = Some(floor);
        self
    }

    pub fn requires_retro_green(mut self, retro_id: impl Into<String>) -> Self {
        self.contract.requires_retro_green.push(retro_id.into());
        self
    }

    pub fn escalation(mut self, severity: Severity, notify: Vec<String>) -> Self {
        self.contract.escalation = Escalation {
            severity: Some(severity),
            notify,
        };
        self
    }

    /// Set timeout in seconds
    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.contract.timeout_secs = Some(secs);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.contract.metadata.insert(key.into(), value);
        self
    }

    pub fn into_parts(self) -> (ActionContract, Vec<String>) {
        (self.contract, self.deps)
    }
}

/// Fluent builder for a plan. `build` validates the result.
#[derive(Debug, Clone)]
pub struct PlanBuilder {
    plan_id: String,
    version: u64,
    brief: Arc<TaskBrief>,
    steps: Vec<ActionContract>,
    dag: BTreeMap<String, Vec<String>>,
    metadata: BTreeMap<String, Value>,
}

impl PlanBuilder {
    pub fn new(plan_id: impl Into<String>, brief: TaskBrief) -> Self {
        Self {
            plan_id: plan_id.into(),
            version: 1,
            brief: Arc::new(brief),
            steps: Vec::new(),
            dag: BTreeMap::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn step(mut self, step: ContractBuilder) -> Self {
        let (contract, deps) = step.into_parts();
        self.dag.insert(contract.id.clone(), deps);
        self.steps.push(contract);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn build(self) -> Result<Plan> {
        let plan = Plan {
            plan_id: self.plan_id,
            version: self.version,
            task_brief: self.brief,
            steps: self.steps,
            dag: self.dag,
            metadata: self.metadata,
        };
        plan.validate()?;
        Ok(plan)
    }
}
