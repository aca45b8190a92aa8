//! Provenance graph of artifacts
//!
//! Nodes are artifacts, edges run from a consumed artifact to the artifact
//! produced from it. The graph is append-only: nodes are never removed,
//! only marked invalidated. All state sits behind one `RwLock`, so the
//! coordinator can record forward progress while retrospect workers and the
//! replay manager invalidate concurrently.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Bfs, EdgeRef};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

use crate::core::budget::Usage;
use crate::core::errors::{CoordError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactNode {
    pub artifact_id: String,
    pub step_id: String,
    pub plan_id: String,
    pub plan_version: u64,
    /// Label of the checkpoint active when the artifact was recorded
    pub checkpoint: Option<String>,
    /// Externally visible effects performed while producing this artifact
    pub side_effects: Vec<String>,
    pub value: Value,
    /// Fingerprint of the contract that produced the artifact
    pub fingerprint: Option<u64>,
    /// What producing the artifact cost, latency included
    #[serde(default)]
    pub usage: Usage,
    /// Reason, once invalidated
    pub invalidated: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl ArtifactNode {
    pub fn is_active(&self) -> bool {
        self.invalidated.is_none()
    }
}

/// Input for [`LineageTracker::record_artifact`]
#[derive(Debug, Clone, Default)]
pub struct ArtifactRecord {
    pub artifact_id: String,
    pub step_id: String,
    pub plan_id: String,
    pub plan_version: u64,
    pub value: Value,
    pub side_effects: Vec<String>,
    pub fingerprint: Option<u64>,
    pub usage: Usage,
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub label: String,
    pub created_at: DateTime<Utc>,
    /// Number of artifacts recorded before the checkpoint
    pub position: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineageStats {
    pub nodes: usize,
    pub edges: usize,
    pub checkpoints: usize,
    pub invalidated: usize,
}

/// Serializable copy of the whole graph
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LineageSnapshot {
    pub nodes: Vec<ArtifactNode>,
    /// (consumed artifact, produced artifact)
    pub edges: Vec<(String, String)>,
    pub checkpoints: Vec<Checkpoint>,
    pub next_seq: u64,
}

#[derive(Default)]
struct LineageState {
    graph: DiGraph<ArtifactNode, ()>,
    index: HashMap<String, NodeIndex>,
    /// (plan_id, step_id) -> most recently recorded artifact
    latest: HashMap<(String, String), NodeIndex>,
    checkpoints: Vec<Checkpoint>,
}

impl LineageState {
    fn insert(&mut self, mut node: ArtifactNode, depends_on: &[String]) -> Result<NodeIndex> {
        if self.index.contains_key(&node.artifact_id) {
            return Err(CoordError::internal(format!(
                "artifact '{}' is already recorded",
                node.artifact_id
            )));
        }
        let parents = depends_on
            .iter()
            .map(|dep| {
                self.index
                    .get(dep)
                    .copied()
                    .ok_or_else(|| CoordError::ArtifactNotFound(dep.clone()))
            })
            .collect::<Result<Vec<_>>>()?;

        // Built from an invalidated input: born invalidated
        let stale = parents.iter().find(|&&p| !self.graph[p].is_active());
        if let (true, Some(&stale)) = (node.is_active(), stale) {
            node.invalidated = Some(format!(
                "depends on invalidated {}",
                self.graph[stale].artifact_id
            ));
        }

        let key = (node.plan_id.clone(), node.step_id.clone());
        let artifact_id = node.artifact_id.clone();
        let idx = self.graph.add_node(node);
        for parent in parents {
            self.graph.add_edge(parent, idx, ());
        }
        self.index.insert(artifact_id, idx);
        self.latest.insert(key, idx);
        Ok(idx)
    }

    fn current_checkpoint(&self) -> Option<String> {
        self.checkpoints.last().map(|c| c.label.clone())
    }
}

pub struct LineageTracker {
    state: RwLock<LineageState>,
    seq: AtomicU64,
}

impl LineageTracker {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(LineageState::default()),
            seq: AtomicU64::new(0),
        }
    }

    /// Fresh artifact id for a step of a plan version
    pub fn next_artifact_id(&self, plan_id: &str, step_id: &str, plan_version: u64) -> String {
        let n = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}/{}@v{}#{}", plan_id, step_id, plan_version, n)
    }

    /// Record a bare artifact produced by `step_id` from `depends_on`
    pub fn record(&self, step_id: &str, artifact_id: &str, depends_on: &[String]) -> Result<()> {
        self.record_artifact(ArtifactRecord {
            artifact_id: artifact_id.to_string(),
            step_id: step_id.to_string(),
            depends_on: depends_on.to_vec(),
            ..Default::default()
        })
    }

    /// Record an artifact with its value and provenance. Every dependency
    /// must already be recorded.
    pub fn record_artifact(&self, record: ArtifactRecord) -> Result<()> {
        let mut state = self.state.write();
        let node = ArtifactNode {
            artifact_id: record.artifact_id,
            step_id: record.step_id,
            plan_id: record.plan_id,
            plan_version: record.plan_version,
            checkpoint: state.current_checkpoint(),
            side_effects: record.side_effects,
            value: record.value,
            fingerprint: record.fingerprint,
            usage: record.usage,
            invalidated: None,
            recorded_at: Utc::now(),
        };
        debug!(
            "Recording artifact {} (step {}, {} deps)",
            node.artifact_id,
            node.step_id,
            record.depends_on.len()
        );
        state.insert(node, &record.depends_on)?;
        Ok(())
    }

    /// Start a new checkpoint; later artifacts carry its label
    pub fn checkpoint(&self, label: impl Into<String>) {
        let mut state = self.state.write();
        let checkpoint = Checkpoint {
            label: label.into(),
            created_at: Utc::now(),
            position: state.graph.node_count(),
        };
        info!("Lineage checkpoint '{}' at {} artifacts", checkpoint.label, checkpoint.position);
        state.checkpoints.push(checkpoint);
    }

    /// Every artifact that transitively consumed `artifact_id`, in
    /// breadth-first order, excluding the artifact itself
    pub fn downstream_of(&self, artifact_id: &str) -> Result<Vec<String>> {
        let state = self.state.read();
        let &start = state
            .index
            .get(artifact_id)
            .ok_or_else(|| CoordError::ArtifactNotFound(artifact_id.to_string()))?;

        let mut out = Vec::new();
        let mut bfs = Bfs::new(&state.graph, start);
        while let Some(idx) = bfs.next(&state.graph) {
            if idx != start {
                out.push(state.graph[idx].artifact_id.clone());
            }
        }
        Ok(out)
    }

    /// Artifacts `artifact_id` was produced from
    pub fn upstream_of(&self, artifact_id: &str) -> Result<Vec<String>> {
        let state = self.state.read();
        let &idx = state
            .index
            .get(artifact_id)
            .ok_or_else(|| CoordError::ArtifactNotFound(artifact_id.to_string()))?;
        Ok(state
            .graph
            .edges_directed(idx, petgraph::Direction::Incoming)
            .map(|e| state.graph[e.source()].artifact_id.clone())
            .collect())
    }

    /// Mark an artifact invalidated. Returns false if it already was.
    pub fn invalidate(&self, artifact_id: &str, reason: &str) -> Result<bool> {
        let mut state = self.state.write();
        let &idx = state
            .index
            .get(artifact_id)
            .ok_or_else(|| CoordError::ArtifactNotFound(artifact_id.to_string()))?;
        let node = &mut state.graph[idx];
        if node.invalidated.is_some() {
            return Ok(false);
        }
        info!("Invalidating artifact {}: {}", artifact_id, reason);
        node.invalidated = Some(reason.to_string());
        Ok(true)
    }

    pub fn is_active(&self, artifact_id: &str) -> bool {
        let state = self.state.read();
        state
            .index
            .get(artifact_id)
            .is_some_and(|&idx| state.graph[idx].is_active())
    }

    pub fn get(&self, artifact_id: &str) -> Option<ArtifactNode> {
        let state = self.state.read();
        state.index.get(artifact_id).map(|&idx| state.graph[idx].clone())
    }

    /// Most recently recorded artifact of a step, active or not
    pub fn latest_for_step(&self, plan_id: &str, step_id: &str) -> Option<ArtifactNode> {
        let state = self.state.read();
        state
            .latest
            .get(&(plan_id.to_string(), step_id.to_string()))
            .map(|&idx| state.graph[idx].clone())
    }

    /// Active artifacts of a plan (all plans when `plan_id` is None)
    pub fn active_artifacts(&self, plan_id: Option<&str>) -> Vec<ArtifactNode> {
        let state = self.state.read();
        state
            .graph
            .node_weights()
            .filter(|n| n.is_active() && plan_id.map_or(true, |p| n.plan_id == p))
            .cloned()
            .collect()
    }

    pub fn get_stats(&self) -> LineageStats {
        let state = self.state.read();
        LineageStats {
            nodes: state.graph.node_count(),
            edges: state.graph.edge_count(),
            checkpoints: state.checkpoints.len(),
            invalidated: state.graph.node_weights().filter(|n| !n.is_active()).count(),
        }
    }

    /// Graphviz rendering; invalidated artifacts are drawn red and dashed
    pub fn to_dot(&self) -> String {
        let state = self.state.read();
        let mut dot = String::from("digraph Lineage {\n");
        dot.push_str("  graph [rankdir=LR, nodesep=0.5, ranksep=1.0];\n");
        dot.push_str("  node [shape=box, style=rounded, fontname=\"Helvetica\"];\n\n");

        for idx in state.graph.node_indices() {
            let node = &state.graph[idx];
            let (color, style) = if node.is_active() {
                ("#E6FFE6", "rounded,filled")
            } else {
                ("#FFE6E6", "rounded,filled,dashed")
            };
            let mut label = format!("{}\\nstep: {}", node.artifact_id, node.step_id);
            if let Some(cp) = &node.checkpoint {
                label.push_str(&format!("\\ncheckpoint: {}", cp));
            }
            if !node.side_effects.is_empty() {
                label.push_str(&format!("\\neffects: {}", node.side_effects.join(",")));
            }
            dot.push_str(&format!(
                "  \"{}\" [label=\"{}\", fillcolor=\"{}\", style=\"{}\"];\n",
                escape(&node.artifact_id),
                escape(&label),
                color,
                style
            ));
        }
        dot.push('\n');
        for edge in state.graph.edge_references() {
            dot.push_str(&format!(
                "  \"{}\" -> \"{}\";\n",
                escape(&state.graph[edge.source()].artifact_id),
                escape(&state.graph[edge.target()].artifact_id)
            ));
        }
        dot.push_str("}\n");
        dot
    }

    pub fn snapshot(&self) -> LineageSnapshot {
        let state = self.state.read();
        LineageSnapshot {
            nodes: state.graph.node_weights().cloned().collect(),
            edges: state
                .graph
                .edge_references()
                .map(|e| {
                    (
                        state.graph[e.source()].artifact_id.clone(),
                        state.graph[e.target()].artifact_id.clone(),
                    )
                })
                .collect(),
            checkpoints: state.checkpoints.clone(),
            next_seq: self.seq.load(Ordering::Relaxed),
        }
    }

    /// Replace the graph with a snapshot
    pub fn restore(&self, snapshot: LineageSnapshot) -> Result<()> {
        let mut parents: HashMap<&str, Vec<String>> = HashMap::new();
        for (from, to) in &snapshot.edges {
            parents.entry(to.as_str()).or_default().push(from.clone());
        }

        let mut fresh = LineageState {
            checkpoints: snapshot.checkpoints.clone(),
            ..Default::default()
        };
        // Nodes are stored in insertion order, so parents always come first
        for node in snapshot.nodes.iter().cloned() {
            let deps = parents.get(node.artifact_id.as_str()).cloned().unwrap_or_default();
            fresh.insert(node, &deps)?;
        }

        *self.state.write() = fresh;
        self.seq.store(snapshot.next_seq, Ordering::Relaxed);
        info!("Restored lineage with {} artifacts", snapshot.nodes.len());
        Ok(())
    }
}

impl Default for LineageTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn escape(s: &str) -> String {
    s.replace('"', "\\\"")
}
