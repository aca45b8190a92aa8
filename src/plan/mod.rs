//! Versioned plans
//!
//! A plan is an arena of action contracts keyed by string id, with
//! dependencies stored as id lists. Plans are immutable: every patch or
//! replan derives a new plan whose version is the previous one plus one.

pub mod builder;
pub mod model;
pub mod planner;

pub use builder::{ContractBuilder, PlanBuilder};
pub use model::*;
pub use planner::{Planner, StaticPlanner};

use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{EdgeRef, Topo};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::core::errors::{CoordError, Result};

/// A versioned DAG of action contracts derived from a task brief
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: String,
    pub version: u64,
    pub task_brief: Arc<TaskBrief>,
    pub steps: Vec<ActionContract>,
    /// step id -> dependency step ids
    #[serde(default)]
    pub dag: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl Plan {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let plan: Plan = serde_yaml::from_str(yaml)?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let plan: Plan = serde_json::from_str(json)?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn to_yaml_string(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn step(&self, step_id: &str) -> Option<&ActionContract> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn deps_of(&self, step_id: &str) -> &[String] {
        self.dag.get(step_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn step_ids(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.id.clone()).collect()
    }

    /// Build the dependency graph (edge dep -> dependent)
    fn graph(&self) -> Result<(DiGraph<String, ()>, HashMap<String, NodeIndex>)> {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        for step in &self.steps {
            if index.contains_key(&step.id) {
                return Err(CoordError::invalid_plan(format!("duplicate step id '{}'", step.id)));
            }
            let idx = graph.add_node(step.id.clone());
            index.insert(step.id.clone(), idx);
        }
        for (step_id, deps) in &self.dag {
            let &to = index
                .get(step_id)
                .ok_or_else(|| CoordError::invalid_plan(format!("dag names unknown step '{}'", step_id)))?;
            for dep in deps {
                let &from = index.get(dep).ok_or_else(|| {
                    CoordError::invalid_plan(format!("step '{}' depends on unknown step '{}'", step_id, dep))
                })?;
                graph.add_edge(from, to, ());
            }
        }
        Ok((graph, index))
    }

    /// Structural validation: unique ids, known dependencies, acyclicity and
    /// resolvable input references.
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(CoordError::invalid_plan(format!("plan '{}' has no steps", self.plan_id)));
        }
        if let Some(step) = self.steps.iter().find(|s| s.id.trim().is_empty()) {
            return Err(CoordError::invalid_plan(format!(
                "step with intent '{}' has an empty id",
                step.intent
            )));
        }

        let (graph, _) = self.graph()?;
        if is_cyclic_directed(&graph) {
            return Err(CoordError::invalid_plan(format!("plan '{}' contains a cycle", self.plan_id)));
        }

        for step in &self.steps {
            let upstream = self.upstream_steps(&step.id);
            for slot in &step.inputs {
                if slot.value.is_some() {
                    continue;
                }
                let Some(reference) = slot.reference_path() else {
                    continue;
                };
                let head = reference.split('.').next().unwrap_or_default();
                if head == "inputs" {
                    let key = reference.split('.').nth(1).unwrap_or_default();
                    if !self.task_brief.inputs.contains_key(key) {
                        return Err(CoordError::invalid_plan(format!(
                            "step '{}' input '{}' references missing brief input '{}'",
                            step.id, slot.name, key
                        )));
                    }
                } else if !upstream.contains(head) {
                    return Err(CoordError::invalid_plan(format!(
                        "step '{}' input '{}' references '{}' which is not upstream",
                        step.id, slot.name, head
                    )));
                }
            }
        }
        Ok(())
    }

    /// Topological levels: level 0 has no dependencies, level n depends on
    /// something at level n-1.
    pub fn levels(&self) -> Result<Vec<Vec<String>>> {
        let (graph, _) = self.graph()?;
        let mut levels: Vec<Vec<String>> = Vec::new();
        let mut node_levels: HashMap<NodeIndex, usize> = HashMap::new();

        let mut topo = Topo::new(&graph);
        while let Some(idx) = topo.next(&graph) {
            let level = graph
                .edges_directed(idx, petgraph::Direction::Incoming)
                .map(|edge| node_levels.get(&edge.source()).copied().unwrap_or(0) + 1)
                .max()
                .unwrap_or(0);
            node_levels.insert(idx, level);
            while levels.len() <= level {
                levels.push(Vec::new());
            }
            levels[level].push(graph[idx].clone());
        }
        Ok(levels)
    }

    /// Steps in a deterministic topological order (plan order breaks ties)
    pub fn topo_order(&self) -> Result<Vec<String>> {
        let position: HashMap<&str, usize> = self
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.as_str(), i))
            .collect();
        Ok(self
            .levels()?
            .into_iter()
            .flat_map(|mut level| {
                level.sort_by_key(|id| position.get(id.as_str()).copied().unwrap_or(usize::MAX));
                level
            })
            .collect())
    }

    /// Transitive dependencies of a step
    pub fn upstream_steps(&self, step_id: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<&str> = self.deps_of(step_id).iter().map(String::as_str).collect();
        while let Some(id) = queue.pop_front() {
            if seen.insert(id.to_string()) {
                queue.extend(self.deps_of(id).iter().map(String::as_str));
            }
        }
        seen
    }

    /// Transitive dependents of a step
    pub fn downstream_steps(&self, step_id: &str) -> HashSet<String> {
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for (id, deps) in &self.dag {
            for dep in deps {
                dependents.entry(dep.as_str()).or_default().push(id.as_str());
            }
        }
        let mut seen = HashSet::new();
        let mut queue: VecDeque<&str> = dependents.get(step_id).cloned().unwrap_or_default().into();
        while let Some(id) = queue.pop_front() {
            if seen.insert(id.to_string()) {
                if let Some(next) = dependents.get(id) {
                    queue.extend(next.iter().copied());
                }
            }
        }
        seen
    }

    /// New plan version with replaced steps; never mutates `self`
    pub fn derive(&self, steps: Vec<ActionContract>) -> Plan {
        Plan {
            plan_id: self.plan_id.clone(),
            version: self.version + 1,
            task_brief: self.task_brief.clone(),
            steps,
            dag: self.dag.clone(),
            metadata: self.metadata.clone(),
        }
    }

    /// New plan version with `patch` applied to one step's contract
    pub fn patched(&self, step_id: &str, patch: Option<&Value>) -> Result<Plan> {
        if self.step(step_id).is_none() {
            return Err(CoordError::StepNotFound(step_id.to_string()));
        }
        let steps = self
            .steps
            .iter()
            .cloned()
            .map(|mut step| {
                if step.id == step_id {
                    if let Some(patch) = patch {
                        step.apply_patch(patch);
                    }
                }
                step
            })
            .collect();
        Ok(self.derive(steps))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn diamond() -> Plan {
        PlanBuilder::new("diamond", TaskBrief::new("diamond").with_input("path", json!("x.csv")))
            .step(ContractBuilder::new("a", "tool").input_ref("path", "inputs.path"))
            .step(ContractBuilder::new("b", "tool").input_ref("rows", "a.rows").after("a"))
            .step(ContractBuilder::new("c", "tool").after("a"))
            .step(ContractBuilder::new("d", "tool").after("b").after("c"))
            .build()
            .unwrap()
    }

    #[test]
    fn test_levels_and_order() {
        let plan = diamond();
        let levels = plan.levels().unwrap();
        assert_eq!(levels.len(), 3);
        assert_eq!(levels[0], vec!["a".to_string()]);
        assert_eq!(plan.topo_order().unwrap(), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_downstream_and_upstream() {
        let plan = diamond();
        let down = plan.downstream_steps("a");
        assert_eq!(down.len(), 3);
        assert!(plan.downstream_steps("d").is_empty());
        assert_eq!(plan.upstream_steps("d").len(), 3);
    }

    #[test]
    fn test_cycle_rejected() {
        let mut plan = diamond();
        plan.dag.insert("a".into(), vec!["d".into()]);
        assert!(matches!(plan.validate(), Err(CoordError::InvalidPlan(_))));
    }

    #[test]
    fn test_unresolvable_reference_rejected() {
        let result = PlanBuilder::new("bad", TaskBrief::new("bad"))
            .step(ContractBuilder::new("a", "tool").input_ref("x", "inputs.missing"))
            .build();
        assert!(result.is_err());

        let result = PlanBuilder::new("bad", TaskBrief::new("bad"))
            .step(ContractBuilder::new("a", "tool"))
            .step(ContractBuilder::new("b", "tool").input_ref("x", "a.rows"))
            .build();
        assert!(result.is_err(), "reference to a non-upstream step must fail");
    }

    #[test]
    fn test_patch_bumps_version() {
        let plan = diamond();
        let next = plan.patched("b", Some(&json!({"mode": "strict"}))).unwrap();
        assert_eq!(next.version, plan.version + 1);
        assert_eq!(next.step("b").unwrap().params.get("mode"), Some(&json!("strict")));
        assert!(plan.step("b").unwrap().params.is_empty());
        assert!(plan.patched("zzz", None).is_err());
    }

    #[test]
    fn test_yaml_round_trip() {
        let plan = diamond();
        let yaml = plan.to_yaml_string().unwrap();
        let loaded = Plan::from_yaml_str(&yaml).unwrap();
        assert_eq!(loaded, plan);
    }
}
