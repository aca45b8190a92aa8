// Core infrastructure modules
pub mod core {
    pub mod budget;
    pub mod config;
    pub mod errors;
    pub mod policy;
    pub mod telemetry;
}

// Plan model and the services that act on it
pub mod checks;
pub mod coord;
pub mod gate;
pub mod lineage;
pub mod plan;
pub mod predicate;
pub mod replay;
pub mod retrospect;
pub mod storage;

// Re-exports for convenience
pub use core::budget::{BudgetLimits, BudgetTracker, RunMetrics, Usage};
pub use core::config::{CoordinatorConfig, CoordinatorConfigBuilder};
pub use core::errors::{CoordError, Result};
pub use core::policy::{BudgetDefaults, DefaultPolicies, EscalationRouting, RetryPolicy, RetryStrategy};
pub use core::telemetry::init_tracing;

pub use checks::{Check, CheckInput, CheckRegistry, CheckVerdict, FnCheck};
pub use coord::{
    BlockedStep, Capability, CapabilityRegistry, CollectingSink, CompositeSink, Coordinator,
    CoordinatorBuilder, EchoCapability, EscalationPayload, EscalationSink, ExecutionResult,
    LoggingSink, RunStatus, StepCtx, StepOutput, TaskInput,
};
pub use gate::{GateDecision, GateEvaluator, GateOutcome};
pub use lineage::{ArtifactNode, LineageStats, LineageTracker};
pub use plan::{
    ActionContract, ContractBuilder, Fallback, Gate, GateKind, OnFail, Plan, PlanBuilder, Planner,
    RetroOnFail, RetrospectSpec, Severity, StaticPlanner, TaskBrief,
};
pub use predicate::{ExprEvaluator, PredicateContext, PredicateEvaluator};
pub use replay::{InvalidationTicket, ReplayManager, ReplayOutcome, ReplayStats};
pub use retrospect::{JobStatus, RetroStats, RetrospectJob, RetrospectRunner};
pub use storage::{Persistence, SledStore};

pub use async_trait::async_trait;
