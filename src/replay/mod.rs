//! Replay management
//!
//! Turns invalidation tickets into either a new plan version to re-execute
//! or, when published side effects make silent re-execution unsafe, a
//! cancellation plus escalation.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::coord::hooks::{EscalationPayload, EscalationSink};
use crate::core::errors::{CoordError, Result};
use crate::core::policy::DefaultPolicies;
use crate::lineage::LineageTracker;
use crate::plan::{Escalation, Plan};

/// Request to invalidate an artifact and everything derived from it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvalidationTicket {
    /// Artifact whose correctness is in doubt
    pub target: String,
    pub step_id: String,
    pub plan_id: String,
    pub plan_version: u64,
    pub reason: String,
    /// Step to re-execute
    pub replay_from: String,
    #[serde(default)]
    pub patch: Option<Value>,
    /// Cancel downstream work instead of replaying it
    #[serde(default)]
    pub cancel: bool,
    #[serde(default)]
    pub escalate: Option<Escalation>,
    /// Retrospect job that raised the ticket
    #[serde(default)]
    pub source_job: Option<String>,
    /// Target plus every artifact downstream of it, filled in by `handle`
    #[serde(default)]
    pub affected: Vec<String>,
    #[serde(default = "Utc::now")]
    pub raised_at: DateTime<Utc>,
}

impl InvalidationTicket {
    pub fn new(
        plan_id: impl Into<String>,
        plan_version: u64,
        step_id: impl Into<String>,
        target: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        let step_id = step_id.into();
        Self {
            target: target.into(),
            replay_from: step_id.clone(),
            step_id,
            plan_id: plan_id.into(),
            plan_version,
            reason: reason.into(),
            patch: None,
            cancel: false,
            escalate: None,
            source_job: None,
            affected: Vec::new(),
            raised_at: Utc::now(),
        }
    }

    pub fn replay_from(mut self, step_id: impl Into<String>) -> Self {
        self.replay_from = step_id.into();
        self
    }

    pub fn with_patch(mut self, patch: Value) -> Self {
        self.patch = Some(patch);
        self
    }

    pub fn cancelling(mut self) -> Self {
        self.cancel = true;
        self
    }

    pub fn with_escalation(mut self, escalation: Escalation) -> Self {
        self.escalate = Some(escalation);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplayOutcome {
    /// A new plan version was queued for re-execution
    Replay {
        plan: Plan,
        replay_from: String,
        affected: Vec<String>,
    },
    /// Downstream work was cancelled and escalated
    Cancel {
        affected: Vec<String>,
        /// Affected artifacts that had already published side effects
        published: Vec<String>,
        escalation: EscalationPayload,
    },
}

impl ReplayOutcome {
    pub fn affected(&self) -> &[String] {
        match self {
            ReplayOutcome::Replay { affected, .. } | ReplayOutcome::Cancel { affected, .. } => affected,
        }
    }
}

/// Replay plan waiting for the coordinator
#[derive(Debug, Clone, PartialEq)]
pub struct PendingReplay {
    pub plan: Plan,
    /// Steps patched or invalidated since the last execution
    pub replay_from: BTreeSet<String>,
    pub tickets: Vec<InvalidationTicket>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayStats {
    pub tickets: u64,
    pub replays: u64,
    pub cancels: u64,
    /// Cancels caused by already published side effects
    pub conflicts: u64,
}

pub struct ReplayManager {
    lineage: Arc<LineageTracker>,
    sink: Arc<dyn EscalationSink>,
    policies: Arc<DefaultPolicies>,
    /// plan_id -> newest known version
    plans: DashMap<String, Plan>,
    pending: DashMap<String, PendingReplay>,
    history: Mutex<Vec<InvalidationTicket>>,

    tickets: AtomicU64,
    replays: AtomicU64,
    cancels: AtomicU64,
    conflicts: AtomicU64,
}

impl ReplayManager {
    pub fn new(
        lineage: Arc<LineageTracker>,
        sink: Arc<dyn EscalationSink>,
        policies: Arc<DefaultPolicies>,
    ) -> Self {
        Self {
            lineage,
            sink,
            policies,
            plans: DashMap::new(),
            pending: DashMap::new(),
            history: Mutex::new(Vec::new()),
            tickets: AtomicU64::new(0),
            replays: AtomicU64::new(0),
            cancels: AtomicU64::new(0),
            conflicts: AtomicU64::new(0),
        }
    }

    /// Make a plan version known; older versions never replace newer ones
    pub fn register_plan(&self, plan: &Plan) {
        let mut entry = self
            .plans
            .entry(plan.plan_id.clone())
            .or_insert_with(|| plan.clone());
        if plan.version > entry.version {
            *entry = plan.clone();
        }
    }

    pub fn latest_plan(&self, plan_id: &str) -> Option<Plan> {
        self.plans.get(plan_id).map(|p| p.clone())
    }

    /// Newest version of every known plan
    pub fn plans(&self) -> Vec<Plan> {
        self.plans.iter().map(|p| p.value().clone()).collect()
    }

    /// Invalidate the ticket's target and everything downstream of it, then
    /// queue a replay or cancel and escalate.
    pub fn handle(&self, mut ticket: InvalidationTicket) -> Result<ReplayOutcome> {
        self.tickets.fetch_add(1, Ordering::Relaxed);

        let downstream = self.lineage.downstream_of(&ticket.target)?;
        let mut affected = Vec::with_capacity(downstream.len() + 1);
        affected.push(ticket.target.clone());
        affected.extend(downstream);
        ticket.affected = affected.clone();

        let reason = format!("invalidated by {}: {}", ticket.target, ticket.reason);
        for artifact_id in &affected {
            self.lineage.invalidate(artifact_id, &reason)?;
        }

        let published: Vec<String> = affected
            .iter()
            .filter(|id| {
                self.lineage
                    .get(id)
                    .is_some_and(|node| !node.side_effects.is_empty())
            })
            .cloned()
            .collect();

        let outcome = if ticket.cancel || !published.is_empty() {
            self.cancel(&ticket, affected, published)
        } else {
            self.replay(&ticket, affected)?
        };

        self.history.lock().push(ticket);
        Ok(outcome)
    }

    fn cancel(&self, ticket: &InvalidationTicket, affected: Vec<String>, published: Vec<String>) -> ReplayOutcome {
        self.cancels.fetch_add(1, Ordering::Relaxed);

        let escalate = ticket.escalate.clone().unwrap_or_default();
        let severity = self.policies.severity_or_default(escalate.severity);
        let notify = self.policies.escalation.notify_for(severity, &escalate.notify);

        let message = if published.is_empty() {
            format!(
                "Cancelled downstream of step {} in plan {}: {}",
                ticket.step_id, ticket.plan_id, ticket.reason
            )
        } else {
            self.conflicts.fetch_add(1, Ordering::Relaxed);
            let conflict = CoordError::ReplayConflict {
                artifact_id: ticket.target.clone(),
                effects: published.clone(),
            };
            format!("{} (step {}: {})", conflict, ticket.step_id, ticket.reason)
        };
        warn!("{}", message);

        let escalation = EscalationPayload::new(
            severity,
            notify,
            message,
            json!({
                "plan_id": ticket.plan_id,
                "plan_version": ticket.plan_version,
                "step_id": ticket.step_id,
                "target": ticket.target,
                "affected": affected,
                "published": published,
                "source_job": ticket.source_job,
            }),
        );
        self.sink.notify(escalation.clone());

        ReplayOutcome::Cancel {
            affected,
            published,
            escalation,
        }
    }

    fn replay(&self, ticket: &InvalidationTicket, affected: Vec<String>) -> Result<ReplayOutcome> {
        let base = self.latest_plan(&ticket.plan_id).ok_or_else(|| {
            CoordError::invalid_plan(format!("no plan registered under '{}'", ticket.plan_id))
        })?;
        let plan = base.patched(&ticket.replay_from, ticket.patch.as_ref())?;
        self.register_plan(&plan);

        let mut pending = self
            .pending
            .entry(ticket.plan_id.clone())
            .or_insert_with(|| PendingReplay {
                plan: plan.clone(),
                replay_from: BTreeSet::new(),
                tickets: Vec::new(),
            });
        pending.plan = plan.clone();
        pending.replay_from.insert(ticket.replay_from.clone());
        pending.tickets.push(ticket.clone());
        drop(pending);

        self.replays.fetch_add(1, Ordering::Relaxed);
        info!(
            "Queued replay of plan {} v{} from step {} ({} artifacts invalidated)",
            plan.plan_id,
            plan.version,
            ticket.replay_from,
            affected.len()
        );
        Ok(ReplayOutcome::Replay {
            plan,
            replay_from: ticket.replay_from.clone(),
            affected,
        })
    }

    /// Drain queued replays, newest version per plan
    pub fn take_pending(&self) -> Vec<PendingReplay> {
        let keys: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        keys.into_iter()
            .filter_map(|key| self.pending.remove(&key).map(|(_, pending)| pending))
            .collect()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn history(&self) -> Vec<InvalidationTicket> {
        self.history.lock().clone()
    }

    pub fn get_stats(&self) -> ReplayStats {
        ReplayStats {
            tickets: self.tickets.load(Ordering::Relaxed),
            replays: self.replays.load(Ordering::Relaxed),
            cancels: self.cancels.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
        }
    }
}
