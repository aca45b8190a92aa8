//! Run-level types shared by the coordinator and its callers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::core::budget::{RunMetrics, Usage};
use crate::core::errors::CoordError;
use crate::coord::hooks::EscalationPayload;
use crate::plan::{Plan, TaskBrief};

/// Terminal (or in-flight) state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    /// Needs human attention; the run can be resumed
    Halted,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Halted => "halted",
            RunStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A step held back by its promotion check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockedStep {
    pub step_id: String,
    /// Retrospect ids that are not yet terminal
    pub waiting_on: Vec<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub run_id: String,
    pub status: RunStatus,
    /// The plan that was run; absent when planning itself failed
    pub plan: Option<Plan>,
    /// step_id -> output value, reused artifacts included
    pub artifacts: BTreeMap<String, Value>,
    /// Step ids in the order their artifacts were recorded
    pub steps_executed: Vec<String>,
    pub steps_reused: Vec<String>,
    pub blocked: Vec<BlockedStep>,
    pub escalations: Vec<EscalationPayload>,
    /// Retrospect job ids scheduled by this run
    pub retrospects: Vec<String>,
    /// Required outputs of the brief, resolved
    pub outputs: BTreeMap<String, Value>,
    pub metrics: RunMetrics,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExecutionResult {
    pub(crate) fn new(run_id: String, plan: Option<Plan>) -> Self {
        Self {
            run_id,
            status: RunStatus::Running,
            plan,
            artifacts: BTreeMap::new(),
            steps_executed: Vec::new(),
            steps_reused: Vec::new(),
            blocked: Vec::new(),
            escalations: Vec::new(),
            retrospects: Vec::new(),
            outputs: BTreeMap::new(),
            metrics: RunMetrics::default(),
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub(crate) fn finish(mut self, status: RunStatus, error: Option<String>) -> Self {
        self.conclude(status, error);
        self
    }

    pub(crate) fn conclude(&mut self, status: RunStatus, error: Option<String>) {
        self.status = status;
        self.error = error;
        self.finished_at = Some(Utc::now());
    }

    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }

    pub fn is_halted(&self) -> bool {
        self.status == RunStatus::Halted
    }

    pub fn plan_version(&self) -> Option<u64> {
        self.plan.as_ref().map(|p| p.version)
    }
}

/// What `execute_task` accepts
#[derive(Debug, Clone)]
pub enum TaskInput {
    /// Handed to the planner first
    Brief(TaskBrief),
    Plan(Plan),
}

impl From<TaskBrief> for TaskInput {
    fn from(brief: TaskBrief) -> Self {
        TaskInput::Brief(brief)
    }
}

impl From<Plan> for TaskInput {
    fn from(plan: Plan) -> Self {
        TaskInput::Plan(plan)
    }
}

/// How a step worker finished
#[derive(Debug)]
pub enum StepResult {
    Succeeded {
        output: Value,
        /// Effects the executor reported, or the declared tags
        side_effects: Vec<String>,
        /// Summed over every attempt
        usage: Usage,
        wall_clock_ms: u64,
        agent_or_tool: String,
    },
    Blocked(BlockedStep),
    Halted {
        escalation: EscalationPayload,
        error: CoordError,
    },
    Replan {
        target: String,
        reason: String,
    },
    Failed(CoordError),
    /// Aborted by the loop after the run stopped
    Cancelled,
}

/// Messages from step workers to the coordinator loop
#[derive(Debug)]
pub enum StepEvent {
    Started { step_id: String },
    Finished { step_id: String, result: StepResult },
}
