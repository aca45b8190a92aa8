//! Coordinator - drives a plan to a terminal state
//!
//! Steps run on spawned workers bounded by a semaphore and report back over
//! a channel. The loop in [`Coordinator::drive`] is the only writer of run
//! state: it charges the budget, records lineage, schedules retrospects and
//! then releases dependents, in that order, so an artifact's lineage edge
//! always exists before anything consumes it. Once the run stops, workers
//! still in flight are aborted.

use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::checks::{Check, CheckInput, CheckRegistry};
use crate::coord::capability::{Capability, StepCtx, StepOutput};
use crate::coord::hooks::{EscalationPayload, EscalationSink, LoggingSink};
use crate::coord::registry::CapabilityRegistry;
use crate::coord::types::{BlockedStep, ExecutionResult, RunStatus, StepEvent, StepResult, TaskInput};
use crate::core::budget::{BudgetTracker, Usage};
use crate::core::config::{millis, CoordinatorConfig};
use crate::core::errors::{CoordError, Result};
use crate::core::policy::DefaultPolicies;
use crate::gate::{GateDecision, GateEvaluator, GateOutcome, GateScope};
use crate::lineage::{ArtifactRecord, LineageTracker};
use crate::plan::{
    type_matches, ActionContract, Fallback, Gate, GateKind, Plan, Planner, TaskBrief,
};
use crate::predicate::{ExprEvaluator, PredicateContext, PredicateEvaluator};
use crate::replay::ReplayManager;
use crate::retrospect::{JobStatus, RetroTarget, RetrospectRunner};
use crate::storage::Persistence;

struct CoordInner {
    config: CoordinatorConfig,
    policies: Arc<DefaultPolicies>,
    planner: Option<Arc<dyn Planner>>,
    capabilities: CapabilityRegistry,
    checks: CheckRegistry,
    predicate: Arc<dyn PredicateEvaluator>,
    gates: GateEvaluator,
    lineage: Arc<LineageTracker>,
    retrospects: RetrospectRunner,
    replays: Arc<ReplayManager>,
    sink: Arc<dyn EscalationSink>,
    store: Option<Arc<dyn Persistence>>,
}

impl CoordInner {
    /// Escalation used when no gate decision carries one
    fn default_escalation(
        &self,
        contract: Option<&ActionContract>,
        message: String,
        context: Value,
    ) -> EscalationPayload {
        let (severity, notify) = match contract {
            Some(c) => (c.escalation.severity, c.escalation.notify.as_slice()),
            None => (None, &[][..]),
        };
        let severity = self.policies.severity_or_default(severity);
        EscalationPayload::new(
            severity,
            self.policies.escalation.notify_for(severity, notify),
            message,
            context,
        )
    }
}

/// Plan coordinator. Cloning shares every service.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<CoordInner>,
}

/// Why the loop stopped scheduling
enum Stop {
    Halt(String),
    Fail(String),
    Replan {
        step_id: String,
        target: String,
        reason: String,
    },
}

enum Drive {
    Finished,
    Replan {
        step_id: String,
        target: String,
        reason: String,
    },
}

impl Coordinator {
    pub fn builder() -> CoordinatorBuilder {
        CoordinatorBuilder::new()
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    pub fn policies(&self) -> &DefaultPolicies {
        &self.inner.policies
    }

    pub fn lineage(&self) -> &Arc<LineageTracker> {
        &self.inner.lineage
    }

    pub fn retrospects(&self) -> &RetrospectRunner {
        &self.inner.retrospects
    }

    pub fn replays(&self) -> &Arc<ReplayManager> {
        &self.inner.replays
    }

    pub fn capabilities(&self) -> &CapabilityRegistry {
        &self.inner.capabilities
    }

    pub fn checks(&self) -> &CheckRegistry {
        &self.inner.checks
    }

    /// Run a brief or a plan to a terminal state. Errors never escape; they
    /// are reported through the result's status and error.
    pub async fn execute_task(&self, input: impl Into<TaskInput>) -> ExecutionResult {
        let run_id = Uuid::new_v4().to_string();
        let plan = match input.into() {
            TaskInput::Plan(plan) => plan,
            TaskInput::Brief(brief) => match self.plan_brief(&brief).await {
                Ok(plan) => plan,
                Err(e) => {
                    error!("Planning failed for run {}: {}", run_id, e);
                    let result = ExecutionResult::new(run_id, None).finish(RunStatus::Failed, Some(e.to_string()));
                    self.save_run(&result).await;
                    return result;
                }
            },
        };

        let result = self.run_plan(run_id, plan, &BTreeSet::new()).await;
        self.save_run(&result).await;
        result
    }

    /// Execute every replay plan queued by failed retrospects. Each plan id
    /// runs once, at its newest version. The replay_from steps, their
    /// dependents and anything invalidated execute again; the rest is reused.
    pub async fn process_replays(&self) -> Vec<ExecutionResult> {
        let mut results = Vec::new();
        for pending in self.inner.replays.take_pending() {
            info!(
                "Replaying plan {} v{} from {:?} ({} tickets)",
                pending.plan.plan_id,
                pending.plan.version,
                pending.replay_from,
                pending.tickets.len()
            );
            let result = self
                .run_plan(Uuid::new_v4().to_string(), pending.plan, &pending.replay_from)
                .await;
            self.save_run(&result).await;
            results.push(result);
        }
        results
    }

    /// Write plans, lineage and retrospect jobs to the configured store
    pub async fn persist(&self) -> Result<()> {
        let store = self.store()?;
        for plan in self.inner.replays.plans() {
            store.save_plan(&plan).await?;
        }
        store.save_lineage(&self.inner.lineage.snapshot()).await?;
        store
            .save_retrospects(&self.inner.retrospects.snapshot())
            .await?;
        info!("Persisted coordinator state");
        Ok(())
    }

    /// Load state written by [`Coordinator::persist`]. Returns how many
    /// unfinished retrospects were started again.
    pub async fn restore(&self) -> Result<usize> {
        let store = self.store()?;
        for plan in store.load_plans().await? {
            self.inner.replays.register_plan(&plan);
        }
        if let Some(snapshot) = store.load_lineage().await? {
            self.inner.lineage.restore(snapshot)?;
        }
        let jobs = store.load_retrospects().await?;
        let respawned = self.inner.retrospects.restore(jobs);
        info!("Restored coordinator state, {} retrospects resumed", respawned);
        Ok(respawned)
    }

    fn store(&self) -> Result<&Arc<dyn Persistence>> {
        self.inner
            .store
            .as_ref()
            .ok_or_else(|| CoordError::configuration_field("no persistence configured", "store"))
    }

    async fn save_run(&self, result: &ExecutionResult) {
        let Some(store) = &self.inner.store else {
            return;
        };
        if let Some(plan) = &result.plan {
            if let Err(e) = store.save_plan(plan).await {
                warn!("Failed to save plan {}: {}", plan.plan_id, e);
            }
        }
        if let Err(e) = store.save_run(result).await {
            warn!("Failed to save run {}: {}", result.run_id, e);
        }
    }

    async fn plan_brief(&self, brief: &TaskBrief) -> Result<Plan> {
        let planner = self
            .inner
            .planner
            .as_ref()
            .ok_or_else(|| CoordError::planner("no planner configured for a task brief"))?;
        let plan = planner
            .plan(brief)
            .await
            .map_err(|e| CoordError::planner_with_source("planner failed", e))?;
        info!("Planner produced plan {} v{} with {} steps", plan.plan_id, plan.version, plan.steps.len());
        Ok(plan)
    }

    /// `replay_from` steps are never reused by the first version driven
    async fn run_plan(&self, run_id: String, plan: Plan, replay_from: &BTreeSet<String>) -> ExecutionResult {
        if let Err(e) = plan.validate() {
            error!("Rejecting plan {} v{}: {}", plan.plan_id, plan.version, e);
            return ExecutionResult::new(run_id, Some(plan)).finish(RunStatus::Failed, Some(e.to_string()));
        }

        let limits = self.inner.policies.limits_for(&plan.task_brief.constraints);
        let budget = match BudgetTracker::new(limits, self.inner.config.enforce_limits) {
            Ok(budget) => budget,
            Err(e) => {
                return ExecutionResult::new(run_id, Some(plan)).finish(RunStatus::Failed, Some(e.to_string()));
            }
        };

        info!(
            "Starting run {} for plan {} v{} ({} steps)",
            run_id,
            plan.plan_id,
            plan.version,
            plan.steps.len()
        );
        let mut result = ExecutionResult::new(run_id, None);
        let mut plan = plan;
        let mut replans = 0u32;
        let mut rerun = replay_from.clone();
        loop {
            let driven = self.drive(Arc::new(plan.clone()), &budget, &rerun, &mut result).await;
            rerun.clear();
            match driven {
                Drive::Finished => break,
                Drive::Replan {
                    step_id,
                    target,
                    reason,
                } => match self.replan(&plan, &step_id, &target, &reason, replans, &mut result).await {
                    Ok(next) => {
                        replans += 1;
                        plan = next;
                    }
                    Err(Stop::Fail(message)) => {
                        result = result.finish(RunStatus::Failed, Some(message));
                        break;
                    }
                    Err(Stop::Halt(message) | Stop::Replan { reason: message, .. }) => {
                        result = result.finish(RunStatus::Halted, Some(message));
                        break;
                    }
                },
            }
        }

        result.metrics = budget.metrics();
        info!(
            "Run {} finished: {} ({} executed, {} reused, cost ${:.4})",
            result.run_id,
            result.status,
            result.steps_executed.len(),
            result.steps_reused.len(),
            result.metrics.cost_usd
        );
        result
    }

    async fn replan(
        &self,
        plan: &Plan,
        step_id: &str,
        target: &str,
        reason: &str,
        replans: u32,
        result: &mut ExecutionResult,
    ) -> std::result::Result<Plan, Stop> {
        let inner = &self.inner;
        let context = json!({
            "run_id": result.run_id,
            "plan_id": plan.plan_id,
            "plan_version": plan.version,
            "step_id": step_id,
            "target": target,
        });

        let halt = |message: String, result: &mut ExecutionResult| {
            let payload = inner.default_escalation(plan.step(step_id), message.clone(), context.clone());
            let error = CoordError::escalation(payload.severity, message, payload.notify.clone());
            inner.sink.notify(payload.clone());
            result.escalations.push(payload);
            Stop::Halt(error.to_string())
        };

        let Some(planner) = inner.planner.as_ref() else {
            return Err(halt(
                format!("step {} asked for a replan but no planner is configured: {}", step_id, reason),
                result,
            ));
        };
        if replans >= inner.config.max_replans {
            return Err(halt(
                format!(
                    "replan limit of {} reached at step {}: {}",
                    inner.config.max_replans, step_id, reason
                ),
                result,
            ));
        }

        let mut next = planner
            .replan(&plan.task_brief, plan, target, reason)
            .await
            .map_err(|e| Stop::Fail(CoordError::planner_with_source("replan failed", e).to_string()))?;
        next.plan_id = plan.plan_id.clone();
        next.version = plan.version + 1;
        next.validate().map_err(|e| Stop::Fail(e.to_string()))?;
        info!(
            "Replanned {} at {} -> v{} ({})",
            plan.plan_id, target, next.version, reason
        );
        Ok(next)
    }

    /// Run one plan version until every step is settled or a stop condition
    /// drains the in-flight work.
    async fn drive(
        &self,
        plan: Arc<Plan>,
        budget: &BudgetTracker,
        rerun: &BTreeSet<String>,
        result: &mut ExecutionResult,
    ) -> Drive {
        let inner = &self.inner;
        inner.replays.register_plan(&plan);
        result.plan = Some((*plan).clone());
        result.artifacts.clear();
        result.steps_reused.clear();
        result.blocked.clear();

        let order = match plan.topo_order() {
            Ok(order) => order,
            Err(e) => {
                result.conclude(RunStatus::Failed, Some(e.to_string()));
                return Drive::Finished;
            }
        };

        let mut state = RunLoop {
            coord: self,
            plan: plan.clone(),
            order,
            artifact_ids: HashMap::new(),
            completed: HashSet::new(),
            in_flight: HashSet::new(),
            cancels: HashMap::new(),
            settled: HashSet::new(),
            semaphore: Arc::new(Semaphore::new(inner.config.max_parallel.max(1))),
            evt_tx: None,
            stop: None,
        };
        state.reuse(budget, rerun, result);

        let carried: HashSet<String> = state.artifact_ids.values().cloned().collect();
        let superseded = inner.retrospects.supersede(&plan.plan_id, plan.version, &carried);
        if !superseded.is_empty() {
            info!(
                "Plan {} v{} superseded {} retrospects",
                plan.plan_id,
                plan.version,
                superseded.len()
            );
        }
        inner
            .lineage
            .checkpoint(format!("{}@v{}", plan.plan_id, plan.version));

        // Reused artifacts may already have spent the budget
        if let Err(e) = budget.check() {
            state.over_budget(None, e, result);
        }

        let (evt_tx, mut evt_rx) = mpsc::channel::<StepEvent>(plan.steps.len().max(1) * 2);
        state.evt_tx = Some(evt_tx);
        if state.stop.is_none() {
            state.schedule_ready(result);
        }

        while !state.in_flight.is_empty() {
            let Some(event) = evt_rx.recv().await else {
                break;
            };
            match event {
                StepEvent::Started { step_id } => debug!("Step {} started", step_id),
                StepEvent::Finished { step_id, result: outcome } => {
                    state.in_flight.remove(&step_id);
                    state.cancels.remove(&step_id);
                    state.apply(budget, &step_id, outcome, result);
                }
            }
            if state.stop.is_none() {
                state.schedule_ready(result);
            } else {
                state.cancel_in_flight();
            }
        }

        match state.stop.take() {
            Some(Stop::Replan {
                step_id,
                target,
                reason,
            }) => Drive::Replan {
                step_id,
                target,
                reason,
            },
            Some(Stop::Fail(message)) => {
                result.conclude(RunStatus::Failed, Some(message));
                Drive::Finished
            }
            Some(Stop::Halt(message)) => {
                result.conclude(RunStatus::Halted, Some(message));
                Drive::Finished
            }
            None if !result.blocked.is_empty() => {
                let ids: Vec<&str> = result.blocked.iter().map(|b| b.step_id.as_str()).collect();
                let message = format!("blocked awaiting retrospects: {}", ids.join(", "));
                info!("Plan {} v{} {}", plan.plan_id, plan.version, message);
                result.conclude(RunStatus::Halted, Some(message));
                Drive::Finished
            }
            None => {
                match state.accept(result) {
                    Ok(()) => result.conclude(RunStatus::Completed, None),
                    Err(message) => result.conclude(RunStatus::Halted, Some(message)),
                }
                Drive::Finished
            }
        }
    }
}

/// Per-version scheduling state owned by the coordinator loop
struct RunLoop<'a> {
    coord: &'a Coordinator,
    plan: Arc<Plan>,
    order: Vec<String>,
    /// step_id -> artifact id recorded (or reused) for this version
    artifact_ids: HashMap<String, String>,
    completed: HashSet<String>,
    in_flight: HashSet<String>,
    /// Abort signal per in-flight worker
    cancels: HashMap<String, oneshot::Sender<()>>,
    /// Blocked, halted, failed or cancelled; never completes in this version
    settled: HashSet<String>,
    semaphore: Arc<Semaphore>,
    evt_tx: Option<mpsc::Sender<StepEvent>>,
    stop: Option<Stop>,
}

impl RunLoop<'_> {
    /// Carry over artifacts whose contract is unchanged and whose
    /// dependencies were carried over too. Steps in `rerun` and everything
    /// downstream of them always execute again. Carried artifacts count
    /// against the budget with the usage recorded when they were produced.
    fn reuse(&mut self, budget: &BudgetTracker, rerun: &BTreeSet<String>, result: &mut ExecutionResult) {
        let lineage = &self.coord.inner.lineage;
        let mut forced: HashSet<String> = HashSet::new();
        for step_id in rerun.iter().filter(|id| self.plan.step(id).is_some()) {
            forced.extend(self.plan.downstream_steps(step_id));
            forced.insert(step_id.clone());
        }

        for step_id in &self.order {
            if forced.contains(step_id) {
                continue;
            }
            let Some(contract) = self.plan.step(step_id) else {
                continue;
            };
            if !self
                .plan
                .deps_of(step_id)
                .iter()
                .all(|dep| self.completed.contains(dep))
            {
                continue;
            }
            let Some(node) = lineage.latest_for_step(&self.plan.plan_id, step_id) else {
                continue;
            };
            if !node.is_active() || node.fingerprint != Some(contract.fingerprint()) {
                continue;
            }
            debug!("Reusing {} for step {}", node.artifact_id, step_id);
            budget.carry(&node.artifact_id, &node.usage);
            self.completed.insert(step_id.clone());
            self.artifact_ids.insert(step_id.clone(), node.artifact_id);
            result.artifacts.insert(step_id.clone(), node.value);
            result.steps_reused.push(step_id.clone());
        }
        if !result.steps_reused.is_empty() {
            info!(
                "Plan {} v{} reuses {} of {} steps (forced: {:?})",
                self.plan.plan_id,
                self.plan.version,
                result.steps_reused.len(),
                self.plan.steps.len(),
                rerun
            );
        }
    }

    fn schedule_ready(&mut self, result: &ExecutionResult) {
        let ready: Vec<String> = self
            .order
            .iter()
            .filter(|id| {
                !self.completed.contains(*id)
                    && !self.in_flight.contains(*id)
                    && !self.settled.contains(*id)
                    && self
                        .plan
                        .deps_of(id)
                        .iter()
                        .all(|dep| self.completed.contains(dep))
            })
            .cloned()
            .collect();

        for step_id in ready {
            let Some(contract) = self.plan.step(&step_id).cloned() else {
                continue;
            };
            let Some(evt_tx) = self.evt_tx.clone() else {
                return;
            };
            let (cancel_tx, cancel_rx) = oneshot::channel();
            let worker = StepWorker {
                inner: self.coord.inner.clone(),
                run_id: result.run_id.clone(),
                plan: self.plan.clone(),
                inputs: resolve_inputs(&contract, &self.plan.task_brief, &result.artifacts),
                artifacts: result.artifacts.clone(),
                contract,
            };
            spawn_step(step_id.clone(), worker, self.semaphore.clone(), evt_tx, cancel_rx);
            self.cancels.insert(step_id.clone(), cancel_tx);
            self.in_flight.insert(step_id);
        }
    }

    /// Single writer for everything a finished step changes. A step that
    /// returned has already performed its side effects, so its artifact is
    /// recorded even when the run stopped or the charge is refused; only
    /// released artifacts feed dependents and retrospects.
    fn apply(&mut self, budget: &BudgetTracker, step_id: &str, outcome: StepResult, result: &mut ExecutionResult) {
        let inner = self.coord.inner.clone();
        let plan = self.plan.clone();
        match outcome {
            StepResult::Succeeded {
                output,
                side_effects,
                usage,
                wall_clock_ms,
                agent_or_tool,
            } => {
                let charged = budget.charge(&usage, wall_clock_ms);
                let usage = Usage {
                    latency_ms: Some(usage.latency_ms.unwrap_or(wall_clock_ms)),
                    ..usage
                };

                let Some(contract) = plan.step(step_id) else {
                    self.stop_on(&CoordError::StepNotFound(step_id.to_string()));
                    return;
                };
                let artifact_id = inner
                    .lineage
                    .next_artifact_id(&plan.plan_id, step_id, plan.version);
                let depends_on: Vec<String> = plan
                    .deps_of(step_id)
                    .iter()
                    .filter_map(|dep| self.artifact_ids.get(dep).cloned())
                    .collect();
                let record = ArtifactRecord {
                    artifact_id: artifact_id.clone(),
                    step_id: step_id.to_string(),
                    plan_id: plan.plan_id.clone(),
                    plan_version: plan.version,
                    value: output.clone(),
                    side_effects,
                    fingerprint: Some(contract.fingerprint()),
                    usage,
                    depends_on,
                };
                if let Err(e) = inner.lineage.record_artifact(record) {
                    error!("Failed to record artifact for {} ({}): {}", step_id, e.category(), e);
                    self.settled.insert(step_id.to_string());
                    self.stop_on(&e);
                    return;
                }

                match charged {
                    Ok(()) => budget.account(&artifact_id),
                    Err(e) => {
                        warn!("Step {} ran over budget, {} recorded but not released", step_id, artifact_id);
                        self.settled.insert(step_id.to_string());
                        self.over_budget(Some(step_id), e, result);
                        return;
                    }
                }
                if self.stop.is_some() {
                    info!("Step {} finished after the run stopped, {} recorded but not released", step_id, artifact_id);
                    self.settled.insert(step_id.to_string());
                    return;
                }
                info!("Step {} completed via {} as {}", step_id, agent_or_tool, artifact_id);

                for spec in &contract.retrospects {
                    let job_id = inner.retrospects.schedule(
                        RetroTarget {
                            plan_id: plan.plan_id.clone(),
                            plan_version: plan.version,
                            step_id: step_id.to_string(),
                            artifact_id: artifact_id.clone(),
                            output: output.clone(),
                        },
                        spec,
                    );
                    result.retrospects.push(job_id);
                }

                self.artifact_ids.insert(step_id.to_string(), artifact_id);
                self.completed.insert(step_id.to_string());
                result.artifacts.insert(step_id.to_string(), output);
                result.steps_executed.push(step_id.to_string());
            }
            StepResult::Blocked(blocked) => {
                info!("Step {} blocked: {}", step_id, blocked.reason);
                self.settled.insert(step_id.to_string());
                result.blocked.push(blocked);
            }
            StepResult::Halted { escalation, error } => {
                warn!("Step {} stopped the run ({}): {}", step_id, error.category(), error);
                inner.sink.notify(escalation.clone());
                result.escalations.push(escalation);
                self.settled.insert(step_id.to_string());
                self.stop_on(&error);
            }
            StepResult::Replan { target, reason } => {
                info!("Step {} requested a replan at {}: {}", step_id, target, reason);
                self.settled.insert(step_id.to_string());
                if self.stop.is_none() {
                    self.stop = Some(Stop::Replan {
                        step_id: step_id.to_string(),
                        target,
                        reason,
                    });
                }
            }
            StepResult::Failed(e) => {
                error!("Step {} failed ({}): {}", step_id, e.category(), e);
                self.settled.insert(step_id.to_string());
                self.stop_on(&e);
            }
            StepResult::Cancelled => {
                debug!("Step {} cancelled", step_id);
                self.settled.insert(step_id.to_string());
            }
        }
    }

    /// Escalate a budget breach, at a step or before any step ran
    fn over_budget(&mut self, step_id: Option<&str>, error: CoordError, result: &mut ExecutionResult) {
        let inner = &self.coord.inner;
        warn!(
            "Budget breach in plan {} v{}: {}",
            self.plan.plan_id, self.plan.version, error
        );
        let payload = inner.default_escalation(
            step_id.and_then(|id| self.plan.step(id)),
            error.to_string(),
            json!({
                "run_id": result.run_id,
                "plan_id": self.plan.plan_id,
                "plan_version": self.plan.version,
                "step_id": step_id,
            }),
        );
        inner.sink.notify(payload.clone());
        result.escalations.push(payload);
        self.stop_on(&error);
    }

    /// Halted runs can be resumed, failed ones cannot
    fn stop_on(&mut self, error: &CoordError) {
        if error.halts_run() {
            self.halt(error.to_string());
        } else {
            self.fail(error.to_string());
        }
    }

    fn halt(&mut self, message: String) {
        if matches!(self.stop, None | Some(Stop::Replan { .. })) {
            self.stop = Some(Stop::Halt(message));
        }
    }

    fn fail(&mut self, message: String) {
        if !matches!(self.stop, Some(Stop::Fail(_))) {
            self.stop = Some(Stop::Fail(message));
        }
    }

    /// Abort every worker still running once the run has stopped
    fn cancel_in_flight(&mut self) {
        for (step_id, cancel) in self.cancels.drain() {
            debug!("Aborting step {}", step_id);
            let _ = cancel.send(());
        }
    }

    /// Required outputs and acceptance tests of the brief
    fn accept(&self, result: &mut ExecutionResult) -> std::result::Result<(), String> {
        let inner = &self.coord.inner;
        let brief = &self.plan.task_brief;

        let mut problems = Vec::new();
        for (key, type_tag) in &brief.required_outputs {
            match find_output(key, &self.order, &result.artifacts) {
                Some(value) if type_matches(type_tag, &value) => {
                    result.outputs.insert(key.clone(), value);
                }
                Some(_) => problems.push(format!("required output '{}' is not a {}", key, type_tag)),
                None => problems.push(format!("required output '{}' is missing", key)),
            }
        }

        if problems.is_empty() {
            let ctx = PredicateContext::new()
                .with("outputs", json!(result.outputs))
                .with("artifacts", json!(result.artifacts))
                .with("inputs", json!(brief.inputs))
                .with("metadata", json!(brief.metadata))
                .with_retro_status(inner.retrospects.statuses_for(&self.plan.plan_id));
            for test in &brief.acceptance_tests {
                match inner.predicate.evaluate(&test.assertion, &ctx) {
                    Ok(true) => debug!("Acceptance test {} passed", test.name),
                    Ok(false) => problems.push(format!(
                        "acceptance test '{}' failed: {}",
                        test.name, test.assertion
                    )),
                    Err(e) => problems.push(format!("acceptance test '{}' errored: {}", test.name, e)),
                }
            }
        }

        if problems.is_empty() {
            return Ok(());
        }
        let message = problems.join("; ");
        warn!("Plan {} v{} not accepted: {}", self.plan.plan_id, self.plan.version, message);
        let payload = inner.default_escalation(
            None,
            message.clone(),
            json!({
                "run_id": result.run_id,
                "plan_id": self.plan.plan_id,
                "plan_version": self.plan.version,
            }),
        );
        inner.sink.notify(payload.clone());
        result.escalations.push(payload);
        Err(message)
    }
}

fn spawn_step(
    step_id: String,
    worker: StepWorker,
    semaphore: Arc<Semaphore>,
    evt_tx: mpsc::Sender<StepEvent>,
    mut cancel: oneshot::Receiver<()>,
) {
    tokio::spawn(async move {
        let permit = tokio::select! {
            permit = semaphore.acquire_owned() => permit,
            Ok(()) = &mut cancel => {
                let _ = evt_tx
                    .send(StepEvent::Finished {
                        step_id,
                        result: StepResult::Cancelled,
                    })
                    .await;
                return;
            }
        };
        let _permit = match permit {
            Ok(permit) => permit,
            Err(_) => {
                let error = CoordError::internal("step semaphore closed").with_context("step_id", &step_id);
                let _ = evt_tx
                    .send(StepEvent::Finished {
                        result: StepResult::Failed(error),
                        step_id,
                    })
                    .await;
                return;
            }
        };
        let _ = evt_tx
            .send(StepEvent::Started {
                step_id: step_id.clone(),
            })
            .await;

        // A panicking capability must still produce an event
        let mut handle = tokio::spawn(worker.run());
        let result = tokio::select! {
            joined = &mut handle => match joined {
                Ok(result) => result,
                Err(e) => StepResult::Failed(CoordError::executor(&step_id, format!("step worker panicked: {}", e))),
            },
            Ok(()) = &mut cancel => {
                handle.abort();
                StepResult::Cancelled
            }
        };
        let _ = evt_tx.send(StepEvent::Finished { step_id, result }).await;
    });
}

/// Resolve input slots: literal values first, then references into the
/// brief inputs or upstream artifacts, then a brief input of the same name.
fn resolve_inputs(contract: &ActionContract, brief: &TaskBrief, artifacts: &BTreeMap<String, Value>) -> Value {
    let mut resolved = Map::new();
    for slot in &contract.inputs {
        let value = if let Some(value) = &slot.value {
            value.clone()
        } else if let Some(path) = slot.reference_path() {
            resolve_reference(path, brief, artifacts)
        } else {
            brief.inputs.get(&slot.name).cloned().unwrap_or(Value::Null)
        };
        resolved.insert(slot.name.clone(), value);
    }
    Value::Object(resolved)
}

fn resolve_reference(path: &str, brief: &TaskBrief, artifacts: &BTreeMap<String, Value>) -> Value {
    let mut parts = path.split('.');
    let head = parts.next().unwrap_or_default();
    let mut current = if head == "inputs" {
        match parts.next() {
            Some(key) => brief.inputs.get(key).cloned(),
            None => Some(json!(brief.inputs)),
        }
    } else {
        artifacts.get(head).cloned()
    };
    for part in parts {
        current = current.and_then(|value| match value {
            Value::Object(mut map) => map.remove(part),
            Value::Array(mut items) => part
                .parse::<usize>()
                .ok()
                .filter(|i| *i < items.len())
                .map(|i| items.swap_remove(i)),
            _ => None,
        });
    }
    current.unwrap_or(Value::Null)
}

/// A required output is either a step's whole artifact or the field of
/// that name on the latest artifact carrying it.
fn find_output(key: &str, order: &[String], artifacts: &BTreeMap<String, Value>) -> Option<Value> {
    if let Some(value) = artifacts.get(key) {
        return Some(value.clone());
    }
    order
        .iter()
        .rev()
        .filter_map(|step_id| artifacts.get(step_id))
        .filter_map(|artifact| artifact.get(key))
        .find(|value| !value.is_null())
        .cloned()
}

/// What to do after a gate stage
enum Flow {
    Proceed,
    /// Start the step over from its preconditions
    Again,
    Stop(StepResult),
}

/// Everything one step needs, detached from the coordinator loop
struct StepWorker {
    inner: Arc<CoordInner>,
    run_id: String,
    plan: Arc<Plan>,
    contract: ActionContract,
    inputs: Value,
    /// Artifacts visible when the step was scheduled
    artifacts: BTreeMap<String, Value>,
}

impl StepWorker {
    async fn run(self) -> StepResult {
        let step_id = self.contract.id.clone();
        info!("Running step {} ({})", step_id, self.contract.agent_or_tool);

        let mut attempts: HashMap<String, u32> = HashMap::new();
        let mut tool = self.contract.agent_or_tool.clone();
        let mut usage = Usage::default();
        let mut wall_clock_ms = 0u64;
        let mut attempt = 0u32;

        loop {
            let mut ctx = self.context(&tool, attempt);

            let pre = self.contract.gates_of(GateKind::Precondition);
            let outcome = self.evaluate(&pre, &ctx, &attempts);
            match self.on_outcome(outcome, &pre, &mut attempts, &mut tool).await {
                Flow::Proceed => {}
                Flow::Again => {
                    attempt += 1;
                    continue;
                }
                Flow::Stop(result) => return result,
            }

            if self.contract.needs_promotion() {
                match self.promote(&mut ctx, &mut attempts, &mut tool).await {
                    Flow::Proceed => {}
                    Flow::Again => {
                        attempt += 1;
                        continue;
                    }
                    Flow::Stop(result) => return result,
                }
            }

            let output = match self.execute(&mut tool, attempt, &mut wall_clock_ms).await {
                Ok(output) => output,
                Err(e) => return StepResult::Failed(e),
            };
            usage.absorb(&output.usage);

            match self.verify(&output, &mut ctx, &mut attempts, &mut tool).await {
                Flow::Proceed => {}
                Flow::Again => {
                    attempt += 1;
                    continue;
                }
                Flow::Stop(result) => return result,
            }

            let side_effects = output
                .side_effects
                .unwrap_or_else(|| self.contract.side_effects.clone());
            return StepResult::Succeeded {
                output: output.output,
                side_effects,
                usage,
                wall_clock_ms,
                agent_or_tool: tool,
            };
        }
    }

    fn context(&self, tool: &str, attempt: u32) -> PredicateContext {
        let brief = &self.plan.task_brief;
        PredicateContext::new()
            .with("inputs", self.inputs.clone())
            .with("params", Value::Object(self.contract.params.clone()))
            .with("artifacts", json!(self.artifacts))
            .with(
                "brief",
                json!({
                    "objective": brief.objective,
                    "inputs": brief.inputs,
                    "constraints": brief.constraints,
                    "metadata": brief.metadata,
                }),
            )
            .with(
                "step",
                json!({
                    "id": self.contract.id,
                    "plan_id": self.plan.plan_id,
                    "plan_version": self.plan.version,
                    "agent_or_tool": tool,
                    "attempt": attempt,
                }),
            )
            .with("metadata", json!(self.contract.metadata))
            .with_retro_status(self.inner.retrospects.statuses_for(&self.plan.plan_id))
    }

    fn evaluate(&self, gates: &[Gate], ctx: &PredicateContext, attempts: &HashMap<String, u32>) -> GateOutcome {
        self.inner.gates.evaluate_all(
            gates,
            ctx,
            &self.contract.id,
            &self.contract.escalation,
            |gate| attempts.get(&gate.key()).copied().unwrap_or(0),
        )
    }

    /// Fail a check that is not a declared assertion (validators, output
    /// slots, confidence floor) through the same decision path as a gate.
    fn fail_local(&self, gate: &Gate, reason: String, attempts: &HashMap<String, u32>) -> GateOutcome {
        let scope = GateScope {
            step_id: &self.contract.id,
            escalation: &self.contract.escalation,
            attempts: attempts.get(&gate.key()).copied().unwrap_or(0),
        };
        let decision = self.inner.gates.resolve(gate, scope, Some(&reason));
        warn!("{} check failed on {}: {} ({})", gate.kind, self.contract.id, gate.assertion, reason);
        GateOutcome::Failed {
            kind: gate.kind,
            gate_key: gate.key(),
            assertion: gate.assertion.clone(),
            reason: Some(reason),
            decision,
        }
    }

    async fn on_outcome(
        &self,
        outcome: GateOutcome,
        gates: &[Gate],
        attempts: &mut HashMap<String, u32>,
        tool: &mut String,
    ) -> Flow {
        let GateOutcome::Failed {
            kind,
            gate_key,
            assertion,
            reason,
            decision,
        } = outcome
        else {
            return Flow::Proceed;
        };
        let tries = attempts.entry(gate_key.clone()).or_insert(0);

        match decision {
            GateDecision::Retry { max } => {
                *tries += 1;
                let delay = self.inner.policies.retry.strategy.delay(*tries - 1);
                warn!(
                    "Retrying step {} after {} gate failure ({}/{}) in {:?}",
                    self.contract.id, kind, tries, max, delay
                );
                tokio::time::sleep(delay).await;
                Flow::Again
            }
            GateDecision::Alternate { agent_or_tool } if *tool != agent_or_tool => {
                *tries += 1;
                warn!(
                    "Switching step {} from {} to {} after {} gate failure",
                    self.contract.id, tool, agent_or_tool, kind
                );
                *tool = agent_or_tool;
                Flow::Again
            }
            GateDecision::Alternate { .. } => {
                let scope = GateScope {
                    step_id: &self.contract.id,
                    escalation: &self.contract.escalation,
                    attempts: *tries,
                };
                let gate = gates
                    .iter()
                    .find(|g| g.key() == gate_key)
                    .cloned()
                    .unwrap_or_else(|| Gate::new(kind, assertion.clone()));
                let decision = self.inner.gates.exhausted(&gate, scope, "on the alternate");
                Flow::Stop(self.halted(kind, &assertion, reason, decision))
            }
            GateDecision::Replan { target } => Flow::Stop(StepResult::Replan {
                target,
                reason: match reason {
                    Some(reason) => format!("{} gate failed: {} ({})", kind, assertion, reason),
                    None => format!("{} gate failed: {}", kind, assertion),
                },
            }),
            decision @ (GateDecision::Escalate { .. } | GateDecision::Cancel {}) => {
                Flow::Stop(self.halted(kind, &assertion, reason, decision))
            }
        }
    }

    fn halted(&self, kind: GateKind, assertion: &str, reason: Option<String>, decision: GateDecision) -> StepResult {
        let context = json!({
            "run_id": self.run_id,
            "plan_id": self.plan.plan_id,
            "plan_version": self.plan.version,
            "step_id": self.contract.id,
            "gate": kind,
            "assertion": assertion,
            "reason": reason,
        });
        let payload = match decision {
            GateDecision::Escalate {
                severity,
                notify,
                message,
            } => EscalationPayload::new(severity, notify, message, context),
            _ => self.inner.default_escalation(
                Some(&self.contract),
                format!("step {} cancelled by {} gate: {}", self.contract.id, kind, assertion),
                context,
            ),
        };
        let error = CoordError::validation(&self.contract.id, kind.to_string(), assertion, reason);
        StepResult::Halted {
            escalation: payload,
            error,
        }
    }

    /// Hold the step until the retrospects it depends on are green
    async fn promote(
        &self,
        ctx: &mut PredicateContext,
        attempts: &mut HashMap<String, u32>,
        tool: &mut String,
    ) -> Flow {
        let inner = &self.inner;
        let plan_id = &self.plan.plan_id;
        let gates = self.contract.gates_of(GateKind::Promotion);

        let mut required = self.contract.requires_retro_green.clone();
        for gate in &gates {
            for id in inner.predicate.referenced_retros(&gate.assertion) {
                if !required.contains(&id) {
                    required.push(id);
                }
            }
        }

        let unsettled = |statuses: &HashMap<String, JobStatus>| -> Vec<String> {
            required
                .iter()
                .filter(|id| !statuses.get(*id).is_some_and(|s| s.is_terminal()))
                .cloned()
                .collect()
        };

        let mut statuses = inner.retrospects.statuses_for(plan_id);
        let wait = inner.config.promotion_wait();
        if !unsettled(&statuses).is_empty() && !wait.is_zero() {
            debug!("Step {} waiting up to {:?} for {:?}", self.contract.id, wait, required);
            statuses = inner.retrospects.wait_for_retros(plan_id, &required, wait).await;
        }
        ctx.set_retro_status(statuses.clone());

        let failed: Vec<&String> = self
            .contract
            .requires_retro_green
            .iter()
            .filter(|id| statuses.get(*id) == Some(&JobStatus::Failed))
            .collect();
        if !failed.is_empty() {
            let assertion = failed
                .iter()
                .map(|id| format!("retro_green('{}')", id))
                .collect::<Vec<_>>()
                .join(" AND ");
            let gate = match gates.first() {
                Some(declared) => Gate {
                    id: None,
                    assertion,
                    ..declared.clone()
                },
                None => Gate::new(GateKind::Promotion, assertion),
            };
            let outcome = self.fail_local(&gate, "required retrospect failed".into(), attempts);
            return self.on_outcome(outcome, &[gate], attempts, tool).await;
        }

        let waiting = unsettled(&statuses);
        let any_failed = required
            .iter()
            .any(|id| statuses.get(id) == Some(&JobStatus::Failed));
        if !waiting.is_empty() && !any_failed {
            return Flow::Stop(StepResult::Blocked(BlockedStep {
                step_id: self.contract.id.clone(),
                reason: format!("retrospects not yet green: {}", waiting.join(", ")),
                waiting_on: waiting,
            }));
        }

        let outcome = self.evaluate(&gates, ctx, attempts);
        self.on_outcome(outcome, &gates, attempts, tool).await
    }

    /// Call the capability, walking the fallbacks in order on error or
    /// timeout. Retries are skipped for errors another attempt cannot fix.
    async fn execute(&self, tool: &mut String, attempt: u32, wall_clock_ms: &mut u64) -> Result<StepOutput> {
        let mut last = match self.try_once(tool, attempt, wall_clock_ms).await {
            Ok(output) => return Ok(output),
            Err(e) => e,
        };

        let mut tries = 0u32;
        for fallback in &self.contract.fallbacks {
            match fallback {
                Fallback::Retry { .. } if !last.is_recoverable() => {
                    debug!("Step {} not retried on {}: {}", self.contract.id, tool, last);
                }
                Fallback::Retry { max } => {
                    for _ in 0..*max {
                        let delay = self.inner.policies.retry.strategy.delay(tries);
                        tries += 1;
                        warn!(
                            "Step {} failed on {} ({}), retrying in {:?}",
                            self.contract.id, tool, last, delay
                        );
                        tokio::time::sleep(delay).await;
                        match self.try_once(tool, attempt + tries, wall_clock_ms).await {
                            Ok(output) => return Ok(output),
                            Err(e) => last = e,
                        }
                    }
                }
                Fallback::Alternate { agent_or_tool } => {
                    tries += 1;
                    warn!(
                        "Step {} failed on {} ({}), falling back to {}",
                        self.contract.id, tool, last, agent_or_tool
                    );
                    *tool = agent_or_tool.clone();
                    match self.try_once(tool, attempt + tries, wall_clock_ms).await {
                        Ok(output) => return Ok(output),
                        Err(e) => last = e,
                    }
                }
            }
        }
        Err(last)
    }

    async fn try_once(&self, tool: &str, attempt: u32, wall_clock_ms: &mut u64) -> Result<StepOutput> {
        let capability = self
            .inner
            .capabilities
            .get(tool)
            .ok_or_else(|| CoordError::CapabilityNotFound(tool.to_string()))?;
        let timeout = self
            .contract
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.inner.config.step_timeout());
        let ctx = StepCtx {
            run_id: self.run_id.clone(),
            plan_id: self.plan.plan_id.clone(),
            plan_version: self.plan.version,
            step_id: self.contract.id.clone(),
            inputs: self.inputs.clone(),
            params: self.contract.params.clone(),
            attempt,
        };

        let started = Instant::now();
        let outcome = tokio::time::timeout(timeout, capability.execute(&self.contract, &ctx)).await;
        *wall_clock_ms += millis(started.elapsed());
        match outcome {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(CoordError::executor(&self.contract.id, e.to_string())),
            Err(_) => Err(CoordError::timeout(
                format!("step {} on {}", self.contract.id, tool),
                millis(timeout),
            )),
        }
    }

    /// Postconditions, validators, declared output types and confidence
    async fn verify(
        &self,
        output: &StepOutput,
        ctx: &mut PredicateContext,
        attempts: &mut HashMap<String, u32>,
        tool: &mut String,
    ) -> Flow {
        let inner = &self.inner;
        ctx.insert("output", output.output.clone());
        ctx.insert("confidence", json!(output.confidence));

        let post = self.contract.gates_of(GateKind::Postcondition);
        let outcome = self.evaluate(&post, ctx, attempts);
        if !outcome.passed() {
            return self.on_outcome(outcome, &post, attempts, tool).await;
        }

        for validator in &self.contract.validators {
            let input = CheckInput {
                plan_id: self.plan.plan_id.clone(),
                step_id: self.contract.id.clone(),
                artifact_id: String::new(),
                output: output.output.clone(),
                args: validator.args.clone(),
            };
            let verdict = inner
                .checks
                .run(&validator.func, &input, inner.predicate.as_ref(), ctx)
                .await;
            if !verdict.passed {
                let gate = Gate::new(GateKind::Postcondition, format!("validator {}", validator.func));
                let reason = verdict.reason.unwrap_or_else(|| "validator rejected output".into());
                let outcome = self.fail_local(&gate, reason, attempts);
                return self.on_outcome(outcome, &[gate], attempts, tool).await;
            }
        }

        for slot in &self.contract.outputs {
            let Some(type_tag) = &slot.type_tag else {
                continue;
            };
            let value = match &output.output {
                Value::Object(map) => map.get(&slot.name),
                other if self.contract.outputs.len() == 1 => Some(other),
                _ => None,
            };
            if !value.is_some_and(|v| type_matches(type_tag, v)) {
                let gate = Gate::new(GateKind::Postcondition, format!("output {}: {}", slot.name, type_tag));
                let reason = match value {
                    Some(_) => format!("output '{}' is not a {}", slot.name, type_tag),
                    None => format!("output '{}' is missing", slot.name),
                };
                let outcome = self.fail_local(&gate, reason, attempts);
                return self.on_outcome(outcome, &[gate], attempts, tool).await;
            }
        }

        if let Some(floor) = self.contract.confidence_floor {
            if !output.confidence.is_some_and(|c| c >= floor) {
                let gate = Gate::new(GateKind::Postcondition, format!("confidence >= {}", floor));
                let reason = match output.confidence {
                    Some(c) => format!("confidence {} below floor {}", c, floor),
                    None => "no confidence reported".to_string(),
                };
                let outcome = self.fail_local(&gate, reason, attempts);
                return self.on_outcome(outcome, &[gate], attempts, tool).await;
            }
        }

        Flow::Proceed
    }
}

/// Builder for [`Coordinator`]
pub struct CoordinatorBuilder {
    config: CoordinatorConfig,
    policies: DefaultPolicies,
    planner: Option<Arc<dyn Planner>>,
    capabilities: CapabilityRegistry,
    checks: CheckRegistry,
    predicate: Option<Arc<dyn PredicateEvaluator>>,
    sink: Option<Arc<dyn EscalationSink>>,
    store: Option<Arc<dyn Persistence>>,
}

impl CoordinatorBuilder {
    pub fn new() -> Self {
        Self {
            config: CoordinatorConfig::default(),
            policies: DefaultPolicies::default(),
            planner: None,
            capabilities: CapabilityRegistry::new(),
            checks: CheckRegistry::new(),
            predicate: None,
            sink: None,
            store: None,
        }
    }

    pub fn config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn policies(mut self, policies: DefaultPolicies) -> Self {
        self.policies = policies;
        self
    }

    pub fn planner(mut self, planner: Arc<dyn Planner>) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn capabilities(mut self, registry: CapabilityRegistry) -> Self {
        self.capabilities = registry;
        self
    }

    pub fn capability(self, capability: Arc<dyn Capability>) -> Self {
        self.capabilities.register(capability);
        self
    }

    pub fn checks(mut self, registry: CheckRegistry) -> Self {
        self.checks = registry;
        self
    }

    pub fn check(self, check: Arc<dyn Check>) -> Self {
        self.checks.register(check);
        self
    }

    /// Replace the built-in expression evaluator
    pub fn predicate(mut self, predicate: Arc<dyn PredicateEvaluator>) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn EscalationSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn store(mut self, store: Arc<dyn Persistence>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> Result<Coordinator> {
        self.config.validate()?;
        self.policies.validate()?;

        let policies = Arc::new(self.policies);
        let predicate: Arc<dyn PredicateEvaluator> = match self.predicate {
            Some(predicate) => predicate,
            None => match &self.config.sandbox_root {
                Some(root) => Arc::new(ExprEvaluator::new().with_sandbox_root(root.clone())),
                None => Arc::new(ExprEvaluator::new()),
            },
        };
        let sink: Arc<dyn EscalationSink> = match self.sink {
            Some(sink) => sink,
            None => Arc::new(LoggingSink),
        };
        let lineage = Arc::new(LineageTracker::new());
        let replays = Arc::new(ReplayManager::new(lineage.clone(), sink.clone(), policies.clone()));
        let retrospects = RetrospectRunner::new(
            self.config.retro_workers,
            self.config.retro_timeout(),
            self.checks.clone(),
            predicate.clone(),
            Some(replays.clone()),
        );

        info!(
            "Coordinator ready: max_parallel={}, retro_workers={}, capabilities={:?}",
            self.config.max_parallel,
            self.config.retro_workers,
            self.capabilities.list()
        );
        Ok(Coordinator {
            inner: Arc::new(CoordInner {
                gates: GateEvaluator::new(predicate.clone(), policies.clone()),
                config: self.config,
                policies,
                planner: self.planner,
                capabilities: self.capabilities,
                checks: self.checks,
                predicate,
                lineage,
                retrospects,
                replays,
                sink,
                store: self.store,
            }),
        })
    }
}

impl Default for CoordinatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::IoSlot;

    #[test]
    fn test_resolve_inputs_prefers_literals() {
        let brief = TaskBrief::new("load").with_input("path", json!("x.csv"));
        let mut artifacts = BTreeMap::new();
        artifacts.insert("ingest".to_string(), json!({"rows": [{"id": 1}, {"id": 2}], "count": 2}));

        let contract = ActionContract {
            id: "sanitize".into(),
            inputs: vec![
                IoSlot::reference("path", "{{ inputs.path }}"),
                IoSlot::reference("second", "ingest.rows.1.id"),
                IoSlot::reference("whole", "ingest"),
                IoSlot::literal("limit", json!(10)),
                IoSlot::reference("gone", "ingest.missing"),
            ],
            ..Default::default()
        };

        let inputs = resolve_inputs(&contract, &brief, &artifacts);
        assert_eq!(inputs["path"], "x.csv");
        assert_eq!(inputs["second"], 2);
        assert_eq!(inputs["whole"]["count"], 2);
        assert_eq!(inputs["limit"], 10);
        assert!(inputs["gone"].is_null());
    }

    #[test]
    fn test_find_output_prefers_latest_step() {
        let order = vec!["a".to_string(), "b".to_string()];
        let mut artifacts = BTreeMap::new();
        artifacts.insert("a".to_string(), json!({"report": "draft"}));
        artifacts.insert("b".to_string(), json!({"report": "final"}));

        assert_eq!(find_output("report", &order, &artifacts), Some(json!("final")));
        assert_eq!(find_output("a", &order, &artifacts), Some(json!({"report": "draft"})));
        assert_eq!(find_output("missing", &order, &artifacts), None);
    }

    #[test]
    fn test_builder_rejects_bad_config() {
        let config = CoordinatorConfig {
            max_parallel: 0,
            ..Default::default()
        };
        assert!(Coordinator::builder().config(config).build().is_err());
        assert!(Coordinator::builder().build().is_ok());
    }
}
