//! End-to-end tests for plan coordination

use async_trait::async_trait;
use hindsight::{
    Capability, CheckInput, CheckVerdict, CollectingSink, ContractBuilder, Coordinator,
    CoordinatorConfig, DefaultPolicies, Fallback, FnCheck, Gate, GateKind, JobStatus, OnFail,
    PlanBuilder, RetryPolicy, RetryStrategy, RetrospectSpec, RunStatus, Severity, StaticPlanner,
    StepCtx, StepOutput, TaskBrief, Usage,
};
use hindsight::plan::ActionContract;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Capability driven by a closure; counts its calls
struct Scripted<F> {
    name: String,
    calls: AtomicUsize,
    func: F,
}

impl<F> Scripted<F>
where
    F: Fn(&StepCtx, usize) -> anyhow::Result<StepOutput> + Send + Sync,
{
    fn new(name: &str, func: F) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            calls: AtomicUsize::new(0),
            func,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<F> Capability for Scripted<F>
where
    F: Fn(&StepCtx, usize) -> anyhow::Result<StepOutput> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _contract: &ActionContract, ctx: &StepCtx) -> anyhow::Result<StepOutput> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        (self.func)(ctx, n)
    }
}

/// Check that only reports its verdict once released
struct Gated {
    name: &'static str,
    release: Arc<tokio::sync::Notify>,
    pass: bool,
}

impl Gated {
    fn new(name: &'static str, release: Arc<tokio::sync::Notify>, pass: bool) -> Arc<Self> {
        Arc::new(Self { name, release, pass })
    }
}

#[async_trait]
impl hindsight::Check for Gated {
    fn name(&self) -> &str {
        self.name
    }

    async fn run(&self, _input: &CheckInput) -> anyhow::Result<CheckVerdict> {
        self.release.notified().await;
        if self.pass {
            Ok(CheckVerdict::pass())
        } else {
            Ok(CheckVerdict::fail("late finding"))
        }
    }
}

fn fast_policies() -> DefaultPolicies {
    DefaultPolicies {
        retry: RetryPolicy {
            max_retries: 2,
            strategy: RetryStrategy::Immediate,
        },
        ..Default::default()
    }
}

fn echo(name: &str) -> Arc<dyn Capability> {
    Scripted::new(name, |ctx: &StepCtx, _| Ok(StepOutput::success(ctx.inputs.clone())))
}

fn rows_with_ssn() -> Value {
    json!([
        {"name": "ada", "ssn": "123-45-6789"},
        {"name": "bob", "ssn": "987-65-4321"}
    ])
}

async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..400 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

#[tokio::test]
async fn test_precondition_escalation_halts_before_any_step() {
    let missing_root = std::env::temp_dir().join(format!("hindsight-missing-{}", uuid::Uuid::new_v4()));
    let sink = Arc::new(CollectingSink::new());
    let loader = Scripted::new("loader", |_: &StepCtx, _| Ok(StepOutput::success(json!({"rows": []}))));
    let coordinator = Coordinator::builder()
        .config(
            CoordinatorConfig::builder()
                .sandbox_root(missing_root)
                .build()
                .unwrap(),
        )
        .policies(fast_policies())
        .capability(loader.clone())
        .sink(sink.clone())
        .build()
        .unwrap();

    let plan = PlanBuilder::new("etl", TaskBrief::new("load x.csv"))
        .step(
            ContractBuilder::new("ingest", "loader").gate(
                Gate::new(GateKind::Precondition, "file_exists('x.csv')").on_fail(OnFail::Escalate {
                    severity: Some(Severity::S2),
                    notify: vec![],
                    message: None,
                }),
            ),
        )
        .build()
        .unwrap();

    let result = coordinator.execute_task(plan).await;

    assert_eq!(result.status, RunStatus::Halted);
    assert!(result.steps_executed.is_empty());
    assert_eq!(loader.calls(), 0);
    assert_eq!(result.escalations.len(), 1);
    assert_eq!(result.escalations[0].severity, Severity::S2);
    assert_eq!(sink.len(), 1);
    assert!(result.error.unwrap().contains("x.csv"));
}

#[tokio::test]
async fn test_failed_retrospect_replays_only_the_affected_subtree() {
    let loader = Scripted::new("loader", |_: &StepCtx, _| Ok(StepOutput::success(json!({"rows": rows_with_ssn()}))));
    let sanitizer = Scripted::new("sanitizer", |ctx: &StepCtx, _| {
        let strict = ctx.param::<bool>("strict").unwrap_or(false);
        let mut rows: Vec<Value> = ctx.get_input("rows")?;
        if strict {
            for row in rows.iter_mut() {
                if let Some(obj) = row.as_object_mut() {
                    obj.remove("ssn");
                }
            }
        }
        Ok(StepOutput::success(json!({ "rows": rows })))
    });
    let reporter = Scripted::new("reporter", |ctx: &StepCtx, _| {
        let rows: Vec<Value> = ctx.get_input("rows")?;
        Ok(StepOutput::success(json!({"count": rows.len()})))
    });

    let coordinator = Coordinator::builder()
        .config(CoordinatorConfig::development())
        .policies(fast_policies())
        .capability(loader.clone())
        .capability(sanitizer.clone())
        .capability(reporter.clone())
        .check(Arc::new(FnCheck::new("deep_pii_scan", |input: &CheckInput| {
            if input.output.to_string().contains("ssn") {
                CheckVerdict::fail("ssn column survived sanitizing")
            } else {
                CheckVerdict::pass()
            }
        })))
        .build()
        .unwrap();

    let plan = PlanBuilder::new("etl", TaskBrief::new("publish a report"))
        .step(ContractBuilder::new("ingest", "loader"))
        .step(
            ContractBuilder::new("sanitize", "sanitizer")
                .after("ingest")
                .input_ref("rows", "ingest.rows")
                .retrospect(
                    RetrospectSpec::new("deep_pii_scan", vec!["deep_pii_scan".into()])
                        .invalidating(Some("sanitize".into()), Some(json!({"strict": true}))),
                ),
        )
        .step(
            ContractBuilder::new("report", "reporter")
                .after("sanitize")
                .input_ref("rows", "{{ sanitize.rows }}"),
        )
        .build()
        .unwrap();

    // Downstream work does not wait for the scan
    let first = coordinator.execute_task(plan).await;
    assert_eq!(first.status, RunStatus::Completed);
    assert_eq!(first.steps_executed, vec!["ingest", "sanitize", "report"]);
    assert_eq!(first.retrospects.len(), 1);

    let replays = coordinator.replays().clone();
    assert!(eventually(|| replays.has_pending()).await);

    let lineage = coordinator.lineage();
    assert!(lineage.latest_for_step("etl", "ingest").unwrap().is_active());
    assert!(!lineage.latest_for_step("etl", "sanitize").unwrap().is_active());
    assert!(!lineage.latest_for_step("etl", "report").unwrap().is_active());
    assert_eq!(replays.latest_plan("etl").unwrap().version, 2);

    let results = coordinator.process_replays().await;
    assert_eq!(results.len(), 1);
    let replayed = &results[0];
    assert_eq!(replayed.status, RunStatus::Completed);
    assert_eq!(replayed.plan_version(), Some(2));
    assert_eq!(replayed.steps_reused, vec!["ingest"]);
    assert_eq!(replayed.steps_executed, vec!["sanitize", "report"]);
    assert!(!replayed.artifacts["sanitize"].to_string().contains("ssn"));
    assert_eq!(loader.calls(), 1);
    assert_eq!(sanitizer.calls(), 2);

    let stats = coordinator
        .retrospects()
        .wait_idle(Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.ok, 1);
    assert!(!coordinator.replays().has_pending());
    assert_eq!(coordinator.replays().get_stats().replays, 1);
}

#[tokio::test]
async fn test_promotion_blocks_until_retrospects_are_green() {
    let release = Arc::new(tokio::sync::Notify::new());
    let publisher = Scripted::new("publisher", |_: &StepCtx, _| {
        Ok(StepOutput::success(json!({"published": true})).with_side_effects(vec!["write_to_prod_db".into()]))
    });
    let coordinator = Coordinator::builder()
        .config(
            CoordinatorConfig::builder()
                .promotion_wait(Duration::from_millis(200))
                .retro_workers(2)
                .build()
                .unwrap(),
        )
        .policies(fast_policies())
        .capability(echo("producer"))
        .capability(publisher.clone())
        .check(Arc::new(FnCheck::new("quick", |_: &CheckInput| CheckVerdict::pass())))
        .check(Gated::new("gated", release.clone(), true))
        .build()
        .unwrap();

    let plan = PlanBuilder::new("release", TaskBrief::new("ship it").with_input("build", json!(42)))
        .step(
            ContractBuilder::new("produce", "producer")
                .input_ref("build", "inputs.build")
                .retrospect(RetrospectSpec::new("R1", vec!["quick".into()]))
                .retrospect(RetrospectSpec::new("R2", vec!["gated".into()])),
        )
        .step(
            ContractBuilder::new("publish", "publisher")
                .after("produce")
                .side_effect("write_to_prod_db")
                .gate(Gate::new(
                    GateKind::Promotion,
                    "retro_green('R1') AND retro_green('R2')",
                )),
        )
        .build()
        .unwrap();

    let blocked = coordinator.execute_task(plan.clone()).await;
    assert_eq!(blocked.status, RunStatus::Halted);
    assert_eq!(blocked.steps_executed, vec!["produce"]);
    assert_eq!(blocked.blocked.len(), 1);
    assert_eq!(blocked.blocked[0].step_id, "publish");
    assert_eq!(blocked.blocked[0].waiting_on, vec!["R2"]);
    assert!(blocked.escalations.is_empty());
    assert_eq!(publisher.calls(), 0);
    assert_eq!(
        coordinator.retrospects().status_of("release", "R1"),
        Some(JobStatus::Ok)
    );
    assert_eq!(
        coordinator.retrospects().status_of("release", "R2"),
        Some(JobStatus::Running)
    );

    release.notify_one();
    let runner = coordinator.retrospects().clone();
    assert!(eventually(|| runner.status_of("release", "R2") == Some(JobStatus::Ok)).await);

    let resumed = coordinator.execute_task(plan).await;
    assert_eq!(resumed.status, RunStatus::Completed);
    assert_eq!(resumed.steps_reused, vec!["produce"]);
    assert_eq!(resumed.steps_executed, vec!["publish"]);
    assert_eq!(publisher.calls(), 1);
    let node = coordinator.lineage().latest_for_step("release", "publish").unwrap();
    assert_eq!(node.side_effects, vec!["write_to_prod_db"]);
}

#[tokio::test]
async fn test_failed_required_retrospect_escalates_instead_of_publishing() {
    let sink = Arc::new(CollectingSink::new());
    let publisher = Scripted::new("publisher", |_: &StepCtx, _| Ok(StepOutput::success(json!({"ok": true}))));
    let coordinator = Coordinator::builder()
        .config(
            CoordinatorConfig::builder()
                .promotion_wait(Duration::from_secs(2))
                .build()
                .unwrap(),
        )
        .policies(fast_policies())
        .capability(echo("producer"))
        .capability(publisher.clone())
        .check(Arc::new(FnCheck::new("schema", |_: &CheckInput| {
            CheckVerdict::fail("unexpected column")
        })))
        .sink(sink.clone())
        .build()
        .unwrap();

    let plan = PlanBuilder::new("release", TaskBrief::new("ship it"))
        .step(
            ContractBuilder::new("produce", "producer")
                .retrospect(RetrospectSpec::new("schema_check", vec!["schema".into()])),
        )
        .step(
            ContractBuilder::new("publish", "publisher")
                .after("produce")
                .side_effect("write_to_prod_db")
                .requires_retro_green("schema_check")
                .escalation(Severity::S1, vec!["release-managers".into()]),
        )
        .build()
        .unwrap();

    let result = coordinator.execute_task(plan).await;

    assert_eq!(result.status, RunStatus::Halted);
    assert_eq!(publisher.calls(), 0);
    assert_eq!(result.escalations.len(), 1);
    assert_eq!(result.escalations[0].severity, Severity::S1);
    assert!(result.escalations[0]
        .notify
        .contains(&"release-managers".to_string()));
    assert!(!sink.is_empty());
    // Observability-only retrospects never queue a replay
    assert!(!coordinator.replays().has_pending());
}

#[tokio::test]
async fn test_postcondition_escalation_is_never_completed() {
    let empty = Scripted::new("loader", |_: &StepCtx, _| Ok(StepOutput::success(json!({"rows": []}))));
    let downstream = Scripted::new("reporter", |_: &StepCtx, _| Ok(StepOutput::success(json!({}))));
    let coordinator = Coordinator::builder()
        .config(CoordinatorConfig::development())
        .policies(fast_policies())
        .capability(empty.clone())
        .capability(downstream.clone())
        .build()
        .unwrap();

    let plan = PlanBuilder::new("etl", TaskBrief::new("load"))
        .step(ContractBuilder::new("ingest", "loader").postcondition("len(output.rows) > 0"))
        .step(ContractBuilder::new("report", "reporter").after("ingest"))
        .build()
        .unwrap();

    let result = coordinator.execute_task(plan).await;
    assert_eq!(result.status, RunStatus::Halted);
    assert!(result.steps_executed.is_empty());
    assert_eq!(downstream.calls(), 0);
    assert!(coordinator.lineage().latest_for_step("etl", "ingest").is_none());
}

#[tokio::test]
async fn test_postcondition_retry_runs_the_step_again() {
    let warming = Scripted::new("loader", |_: &StepCtx, n| {
        let rows = if n == 0 { json!([]) } else { json!([1, 2]) };
        Ok(StepOutput::success(json!({ "rows": rows })).with_usage(Usage::cost(0.01)))
    });
    let coordinator = Coordinator::builder()
        .config(CoordinatorConfig::development())
        .policies(fast_policies())
        .capability(warming.clone())
        .build()
        .unwrap();

    let plan = PlanBuilder::new("etl", TaskBrief::new("load"))
        .step(
            ContractBuilder::new("ingest", "loader").gate(
                Gate::new(GateKind::Postcondition, "len(output.rows) > 0")
                    .on_fail(OnFail::Retry { max: Some(2) }),
            ),
        )
        .build()
        .unwrap();

    let result = coordinator.execute_task(plan).await;
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(warming.calls(), 2);
    assert_eq!(result.artifacts["ingest"]["rows"], json!([1, 2]));
    // Both attempts are paid for
    assert!((result.metrics.cost_usd - 0.02).abs() < 1e-9);
}

#[tokio::test]
async fn test_budget_breach_halts_without_exceeding_limit() {
    let pricey = Scripted::new("llm", |_: &StepCtx, _| {
        Ok(StepOutput::success(json!({"text": "..."})).with_usage(Usage::cost(0.6).with_tokens(100, 50)))
    });
    let coordinator = Coordinator::builder()
        .config(CoordinatorConfig::development())
        .policies(fast_policies())
        .capability(pricey.clone())
        .build()
        .unwrap();

    let plan = PlanBuilder::new("writer", TaskBrief::new("draft").with_budget(Some(1.0), None))
        .step(ContractBuilder::new("outline", "llm"))
        .step(ContractBuilder::new("draft", "llm").after("outline"))
        .step(ContractBuilder::new("polish", "llm").after("draft"))
        .build()
        .unwrap();

    let result = coordinator.execute_task(plan.clone()).await;
    assert_eq!(result.status, RunStatus::Halted);
    assert_eq!(result.steps_executed, vec!["outline"]);
    assert!(result.metrics.cost_usd <= 1.0);
    assert!((result.metrics.cost_usd - 0.6).abs() < 1e-9);
    assert_eq!(result.metrics.tokens_in, 100);
    assert_eq!(pricey.calls(), 2);
    assert!(result.error.unwrap().contains("Budget exceeded"));

    // The refused step still ran; lineage keeps what it cost
    let draft = coordinator.lineage().latest_for_step("writer", "draft").unwrap();
    assert!((draft.usage.cost_usd - 0.6).abs() < 1e-9);

    // Resuming carries the spend of reused artifacts
    let resumed = coordinator.execute_task(plan).await;
    assert_eq!(resumed.status, RunStatus::Halted);
    assert_eq!(resumed.steps_reused, vec!["outline", "draft"]);
    assert!(resumed.steps_executed.is_empty());
    assert_eq!(pricey.calls(), 2);
    assert!((resumed.metrics.cost_usd - 1.2).abs() < 1e-9);
    assert!(resumed.error.unwrap().contains("Budget exceeded"));
}

#[tokio::test]
async fn test_over_budget_publish_is_cancelled_not_replayed() {
    let release = Arc::new(tokio::sync::Notify::new());
    let sink = Arc::new(CollectingSink::new());
    let publisher = Scripted::new("publisher", |_: &StepCtx, _| {
        Ok(StepOutput::success(json!({"published": true})).with_usage(Usage::cost(5.0)))
    });
    let coordinator = Coordinator::builder()
        .config(CoordinatorConfig::development())
        .policies(fast_policies())
        .capability(echo("loader"))
        .capability(publisher.clone())
        .check(Gated::new("late_audit", release.clone(), false))
        .sink(sink.clone())
        .build()
        .unwrap();

    let plan = PlanBuilder::new("release", TaskBrief::new("ship it").with_budget(Some(1.0), None))
        .step(
            ContractBuilder::new("ingest", "loader")
                .retrospect(RetrospectSpec::new("audit", vec!["late_audit".into()]).invalidating(None, None)),
        )
        .step(
            ContractBuilder::new("publish", "publisher")
                .after("ingest")
                .side_effect("write_to_prod_db"),
        )
        .build()
        .unwrap();

    let result = coordinator.execute_task(plan).await;
    assert_eq!(result.status, RunStatus::Halted);
    assert_eq!(result.steps_executed, vec!["ingest"]);
    assert_eq!(publisher.calls(), 1);
    let published = coordinator.lineage().latest_for_step("release", "publish").unwrap();
    assert_eq!(published.side_effects, vec!["write_to_prod_db"]);

    release.notify_one();
    let replays = coordinator.replays().clone();
    assert!(eventually(|| replays.get_stats().cancels == 1).await);
    let stats = replays.get_stats();
    assert_eq!(stats.conflicts, 1);
    assert_eq!(stats.replays, 0);
    assert!(!replays.has_pending());
    assert!(coordinator.process_replays().await.is_empty());
    assert_eq!(publisher.calls(), 1);
    assert!(!coordinator.lineage().latest_for_step("release", "publish").unwrap().is_active());
    assert!(sink.received().iter().any(|e| e.message.contains("Replay conflict")));
}

#[tokio::test]
async fn test_halt_aborts_steps_still_in_flight() {
    struct SlowPublisher(Arc<AtomicUsize>);

    #[async_trait]
    impl Capability for SlowPublisher {
        fn name(&self) -> &str {
            "mailer"
        }

        async fn execute(&self, _contract: &ActionContract, _ctx: &StepCtx) -> anyhow::Result<StepOutput> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(StepOutput::success(json!({"sent": true})).with_side_effects(vec!["send_email".into()]))
        }
    }

    let sent = Arc::new(AtomicUsize::new(0));
    let pricey = Scripted::new("llm", |_: &StepCtx, _| {
        Ok(StepOutput::success(json!({"text": "..."})).with_usage(Usage::cost(5.0)))
    });
    let coordinator = Coordinator::builder()
        .config(
            CoordinatorConfig::builder()
                .max_parallel(2)
                .step_timeout(Duration::from_secs(2))
                .build()
                .unwrap(),
        )
        .policies(fast_policies())
        .capability(pricey.clone())
        .capability(Arc::new(SlowPublisher(sent.clone())))
        .build()
        .unwrap();

    let plan = PlanBuilder::new("fanout", TaskBrief::new("two branches").with_budget(Some(1.0), None))
        .step(ContractBuilder::new("a", "llm"))
        .step(ContractBuilder::new("b", "mailer").side_effect("send_email"))
        .build()
        .unwrap();

    let started = Instant::now();
    let result = coordinator.execute_task(plan).await;
    let elapsed = started.elapsed();

    assert_eq!(result.status, RunStatus::Halted);
    assert!(!result.steps_executed.contains(&"b".to_string()));
    assert!(elapsed < Duration::from_millis(150), "halt took {:?}", elapsed);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(sent.load(Ordering::SeqCst), 0);
    assert!(coordinator.lineage().latest_for_step("fanout", "b").is_none());
    assert!(coordinator.lineage().latest_for_step("fanout", "a").is_some());
}

#[tokio::test]
async fn test_fallbacks_retry_then_alternate() {
    let flaky = Scripted::new("flaky", |ctx: &StepCtx, n| {
        if n == 0 {
            Err(anyhow::anyhow!("connection reset"))
        } else {
            Ok(StepOutput::success(json!({"attempt": ctx.attempt})))
        }
    });
    let broken = Scripted::new("primary", |_: &StepCtx, _| Err(anyhow::anyhow!("model unavailable")));
    let backup = Scripted::new("backup", |_: &StepCtx, _| Ok(StepOutput::success(json!({"source": "backup"}))));

    let coordinator = Coordinator::builder()
        .config(CoordinatorConfig::development())
        .policies(fast_policies())
        .capability(flaky.clone())
        .capability(broken.clone())
        .capability(backup.clone())
        .build()
        .unwrap();

    let plan = PlanBuilder::new("fallbacks", TaskBrief::new("survive errors"))
        .step(ContractBuilder::new("fetch", "flaky").fallback(Fallback::Retry { max: 2 }))
        .step(
            ContractBuilder::new("summarize", "primary")
                .after("fetch")
                .fallback(Fallback::Retry { max: 1 })
                .fallback(Fallback::Alternate {
                    agent_or_tool: "backup".into(),
                }),
        )
        .build()
        .unwrap();

    let result = coordinator.execute_task(plan).await;
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(flaky.calls(), 2);
    assert_eq!(broken.calls(), 2);
    assert_eq!(backup.calls(), 1);
    assert_eq!(result.artifacts["summarize"]["source"], "backup");
}

#[tokio::test]
async fn test_executor_timeout_fails_the_run() {
    struct Slow;

    #[async_trait]
    impl Capability for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        async fn execute(&self, _contract: &ActionContract, _ctx: &StepCtx) -> anyhow::Result<StepOutput> {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok(StepOutput::default())
        }
    }

    let coordinator = Coordinator::builder()
        .config(
            CoordinatorConfig::builder()
                .step_timeout(Duration::from_millis(50))
                .build()
                .unwrap(),
        )
        .policies(fast_policies())
        .capability(Arc::new(Slow))
        .build()
        .unwrap();

    let plan = PlanBuilder::new("slow", TaskBrief::new("wait"))
        .step(ContractBuilder::new("wait", "slow"))
        .build()
        .unwrap();

    let result = coordinator.execute_task(plan).await;
    assert_eq!(result.status, RunStatus::Failed);
    assert!(result.error.unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_replan_gets_a_new_version_from_the_planner() {
    let brief = TaskBrief::new("write a summary");
    let weak = Scripted::new("small_model", |_: &StepCtx, _| Ok(StepOutput::success(json!({"summary": ""}))));
    let strong = Scripted::new("large_model", |_: &StepCtx, _| {
        Ok(StepOutput::success(json!({"summary": "ok"})).with_confidence(0.9))
    });

    let first = PlanBuilder::new("summary", brief.clone())
        .step(
            ContractBuilder::new("draft", "small_model").gate(
                Gate::new(GateKind::Postcondition, "len(output.summary) > 0")
                    .on_fail(OnFail::Replan { target: None }),
            ),
        )
        .build()
        .unwrap();
    let second = PlanBuilder::new("summary", brief.clone())
        .step(ContractBuilder::new("draft", "large_model").confidence_floor(0.8))
        .build()
        .unwrap();

    let coordinator = Coordinator::builder()
        .config(CoordinatorConfig::development())
        .policies(fast_policies())
        .planner(Arc::new(StaticPlanner::sequence(vec![first, second])))
        .capability(weak.clone())
        .capability(strong.clone())
        .build()
        .unwrap();

    let result = coordinator.execute_task(brief).await;
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.plan_version(), Some(2));
    assert_eq!(result.artifacts["draft"]["summary"], "ok");
    assert_eq!(weak.calls(), 1);
    assert_eq!(strong.calls(), 1);
}

#[tokio::test]
async fn test_brief_without_planner_fails() {
    let coordinator = Coordinator::builder().build().unwrap();
    let result = coordinator.execute_task(TaskBrief::new("anything")).await;
    assert_eq!(result.status, RunStatus::Failed);
    assert!(result.plan.is_none());
    assert!(result.error.unwrap().contains("planner"));
}

#[tokio::test]
async fn test_acceptance_tests_and_required_outputs() {
    let counter = Scripted::new("counter", |_: &StepCtx, _| Ok(StepOutput::success(json!({"count": 3}))));
    let coordinator = Coordinator::builder()
        .config(CoordinatorConfig::development())
        .policies(fast_policies())
        .capability(counter)
        .build()
        .unwrap();

    let passing = TaskBrief::new("count things")
        .with_required_output("count", "int")
        .with_acceptance_test("some_rows", "outputs.count >= 3");
    let plan = PlanBuilder::new("counting", passing)
        .step(ContractBuilder::new("tally", "counter").output("count", "int"))
        .build()
        .unwrap();
    let result = coordinator.execute_task(plan).await;
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.outputs["count"], 3);

    let failing = TaskBrief::new("count things").with_acceptance_test("many_rows", "outputs.count > 10 || artifacts.tally.count > 10");
    let plan = PlanBuilder::new("counting-strict", failing)
        .step(ContractBuilder::new("tally", "counter"))
        .build()
        .unwrap();
    let result = coordinator.execute_task(plan).await;
    assert_eq!(result.status, RunStatus::Halted);
    assert_eq!(result.steps_executed, vec!["tally"]);
    assert!(result.error.unwrap().contains("many_rows"));
}

#[tokio::test]
async fn test_independent_branches_run_concurrently() {
    let gate = Arc::new(tokio::sync::Barrier::new(2));
    struct Meet(Arc<tokio::sync::Barrier>, &'static str);

    #[async_trait]
    impl Capability for Meet {
        fn name(&self) -> &str {
            self.1
        }

        async fn execute(&self, _contract: &ActionContract, _ctx: &StepCtx) -> anyhow::Result<StepOutput> {
            // Both branches must be in flight at once to pass the barrier
            self.0.wait().await;
            Ok(StepOutput::success(json!({"branch": self.1})))
        }
    }

    let coordinator = Coordinator::builder()
        .config(
            CoordinatorConfig::builder()
                .max_parallel(2)
                .step_timeout(Duration::from_secs(2))
                .build()
                .unwrap(),
        )
        .policies(fast_policies())
        .capability(Arc::new(Meet(gate.clone(), "left")))
        .capability(Arc::new(Meet(gate.clone(), "right")))
        .capability(echo("join"))
        .build()
        .unwrap();

    let plan = PlanBuilder::new("fanout", TaskBrief::new("branches"))
        .step(ContractBuilder::new("a", "left"))
        .step(ContractBuilder::new("b", "right"))
        .step(
            ContractBuilder::new("c", "join")
                .after("a")
                .after("b")
                .input_ref("left", "a.branch")
                .input_ref("right", "b.branch"),
        )
        .build()
        .unwrap();

    let result = coordinator.execute_task(plan).await;
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.artifacts["c"], json!({"left": "left", "right": "right"}));
    assert_eq!(result.steps_executed.last().map(String::as_str), Some("c"));
}

#[tokio::test]
async fn test_validator_and_output_type_failures_escalate() {
    let coordinator = Coordinator::builder()
        .config(CoordinatorConfig::development())
        .policies(fast_policies())
        .capability(Scripted::new("loader", |_: &StepCtx, _| {
            Ok(StepOutput::success(json!({"rows": "not-a-list"})))
        }))
        .check(Arc::new(FnCheck::new("min_rows", |input: &CheckInput| {
            let min = input.args["min"].as_u64().unwrap_or(1) as usize;
            match input.output["rows"].as_array() {
                Some(rows) if rows.len() >= min => CheckVerdict::pass(),
                _ => CheckVerdict::fail(format!("fewer than {} rows", min)),
            }
        })))
        .build()
        .unwrap();

    let validated = PlanBuilder::new("validated", TaskBrief::new("load"))
        .step(ContractBuilder::new("ingest", "loader").validator("min_rows", json!({"min": 1})))
        .build()
        .unwrap();
    let result = coordinator.execute_task(validated).await;
    assert_eq!(result.status, RunStatus::Halted);
    assert!(result.escalations[0].message.contains("min_rows"));

    let typed = PlanBuilder::new("typed", TaskBrief::new("load"))
        .step(ContractBuilder::new("ingest", "loader").output("rows", "array"))
        .build()
        .unwrap();
    let result = coordinator.execute_task(typed).await;
    assert_eq!(result.status, RunStatus::Halted);
    assert!(result.error.unwrap().contains("rows"));
}

#[tokio::test]
async fn test_restored_lineage_lets_a_new_process_resume() {
    let store = Arc::new(hindsight::SledStore::temporary().unwrap());
    let plan = PlanBuilder::new("resume", TaskBrief::new("two steps").with_input("n", json!(1)))
        .step(ContractBuilder::new("first", "worker").input_ref("n", "inputs.n"))
        .step(ContractBuilder::new("second", "worker").after("first").input_ref("prev", "first.n"))
        .build()
        .unwrap();

    let before = Scripted::new("worker", |ctx: &StepCtx, _| Ok(StepOutput::success(ctx.inputs.clone())));
    let coordinator = Coordinator::builder()
        .config(CoordinatorConfig::development())
        .policies(fast_policies())
        .capability(before.clone())
        .store(store.clone())
        .build()
        .unwrap();
    let first = coordinator.execute_task(plan.clone()).await;
    assert_eq!(first.status, RunStatus::Completed);
    coordinator.persist().await.unwrap();

    let after = Scripted::new("worker", |ctx: &StepCtx, _| Ok(StepOutput::success(ctx.inputs.clone())));
    let restarted = Coordinator::builder()
        .config(CoordinatorConfig::development())
        .policies(fast_policies())
        .capability(after.clone())
        .store(store.clone())
        .build()
        .unwrap();
    assert_eq!(restarted.restore().await.unwrap(), 0);

    let resumed = restarted.execute_task(plan).await;
    assert_eq!(resumed.status, RunStatus::Completed);
    assert_eq!(resumed.steps_reused, vec!["first", "second"]);
    assert!(resumed.steps_executed.is_empty());
    assert_eq!(resumed.artifacts["second"]["prev"], 1);
    assert_eq!(after.calls(), 0);
    assert_eq!(before.calls(), 2);

    let stored = hindsight::Persistence::load_run(store.as_ref(), &first.run_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, RunStatus::Completed);
}

#[tokio::test]
async fn test_replay_from_an_upstream_step_runs_it_again() {
    let source = Scripted::new("source", |_: &StepCtx, n| Ok(StepOutput::success(json!({"rows": [n]}))));
    let consumer = Scripted::new("consumer", |ctx: &StepCtx, _| Ok(StepOutput::success(ctx.inputs.clone())));
    let coordinator = Coordinator::builder()
        .config(CoordinatorConfig::development())
        .policies(fast_policies())
        .capability(source.clone())
        .capability(consumer.clone())
        .check(Arc::new(FnCheck::new("freshness", |_: &CheckInput| {
            CheckVerdict::fail("source snapshot is stale")
        })))
        .build()
        .unwrap();

    let plan = PlanBuilder::new("refresh", TaskBrief::new("refresh the export"))
        .step(ContractBuilder::new("a", "source"))
        .step(
            ContractBuilder::new("b", "consumer")
                .after("a")
                .input_ref("rows", "a.rows")
                .retrospect(
                    RetrospectSpec::new("freshness", vec!["freshness".into()]).invalidating(Some("a".into()), None),
                ),
        )
        .build()
        .unwrap();

    let first = coordinator.execute_task(plan).await;
    assert_eq!(first.status, RunStatus::Completed);
    let replays = coordinator.replays().clone();
    assert!(eventually(|| replays.has_pending()).await);
    // Only b's artifact was invalidated; a is still active
    assert!(coordinator.lineage().latest_for_step("refresh", "a").unwrap().is_active());

    let results = coordinator.process_replays().await;
    assert_eq!(results.len(), 1);
    let replayed = &results[0];
    assert_eq!(replayed.status, RunStatus::Completed);
    assert!(replayed.steps_reused.is_empty());
    assert_eq!(replayed.steps_executed, vec!["a", "b"]);
    assert_eq!(replayed.artifacts["b"]["rows"], json!([1]));
    assert_eq!(source.calls(), 2);
    assert_eq!(consumer.calls(), 2);
}

#[tokio::test]
async fn test_failed_retrospect_after_publish_cancels_and_escalates() {
    let release = Arc::new(tokio::sync::Notify::new());
    let sink = Arc::new(CollectingSink::new());
    let publisher = Scripted::new("publisher", |_: &StepCtx, _| Ok(StepOutput::success(json!({"ok": true}))));
    let coordinator = Coordinator::builder()
        .config(CoordinatorConfig::development())
        .policies(fast_policies())
        .capability(echo("producer"))
        .capability(publisher.clone())
        .check(Gated::new("late_audit", release.clone(), false))
        .sink(sink.clone())
        .build()
        .unwrap();

    let plan = PlanBuilder::new("release", TaskBrief::new("ship it"))
        .step(
            ContractBuilder::new("produce", "producer").retrospect(
                RetrospectSpec::new("audit", vec!["late_audit".into()])
                    .invalidating(Some("produce".into()), Some(json!({"strict": true}))),
            ),
        )
        .step(
            ContractBuilder::new("publish", "publisher")
                .after("produce")
                .side_effect("write_to_prod_db"),
        )
        .build()
        .unwrap();

    let result = coordinator.execute_task(plan).await;
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.steps_executed, vec!["produce", "publish"]);
    assert!(sink.is_empty());

    release.notify_one();
    let runner = coordinator.retrospects().clone();
    let job_id = result.retrospects[0].clone();
    assert!(
        eventually(|| runner
            .get(&job_id)
            .and_then(|job| job.resolution)
            .is_some_and(|r| r.starts_with("cancelled")))
        .await
    );

    let replays = coordinator.replays();
    assert!(!replays.has_pending());
    assert_eq!(replays.get_stats().cancels, 1);
    assert_eq!(replays.get_stats().conflicts, 1);
    assert_eq!(replays.latest_plan("release").unwrap().version, 1);
    assert_eq!(sink.len(), 1);
    assert!(sink.received()[0].message.contains("Replay conflict"));
    assert!(!coordinator.lineage().latest_for_step("release", "publish").unwrap().is_active());
    assert_eq!(publisher.calls(), 1);
}

#[tokio::test]
async fn test_replan_supersedes_retrospects_of_the_old_version() {
    let release = Arc::new(tokio::sync::Notify::new());
    let brief = TaskBrief::new("write a reviewed summary");
    let first = PlanBuilder::new("summary", brief.clone())
        .step(
            ContractBuilder::new("draft", "small_model").retrospect(
                RetrospectSpec::new("audit", vec!["late_audit".into()]).invalidating(Some("draft".into()), None),
            ),
        )
        .step(
            ContractBuilder::new("review", "reviewer")
                .after("draft")
                .input_ref("summary", "draft.summary")
                .gate(
                    Gate::new(GateKind::Postcondition, "len(output.summary) > 0")
                        .on_fail(OnFail::Replan { target: None }),
                ),
        )
        .build()
        .unwrap();
    let second = PlanBuilder::new("summary", brief.clone())
        .step(ContractBuilder::new("draft", "large_model"))
        .step(
            ContractBuilder::new("review", "reviewer")
                .after("draft")
                .input_ref("summary", "draft.summary"),
        )
        .build()
        .unwrap();

    let coordinator = Coordinator::builder()
        .config(CoordinatorConfig::development())
        .policies(fast_policies())
        .planner(Arc::new(StaticPlanner::sequence(vec![first, second])))
        .capability(Scripted::new("small_model", |_: &StepCtx, _| {
            Ok(StepOutput::success(json!({"summary": ""})))
        }))
        .capability(Scripted::new("large_model", |_: &StepCtx, _| {
            Ok(StepOutput::success(json!({"summary": "ok"})))
        }))
        .capability(echo("reviewer"))
        .check(Gated::new("late_audit", release.clone(), false))
        .build()
        .unwrap();

    let result = coordinator.execute_task(brief).await;
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.plan_version(), Some(2));
    assert_eq!(result.artifacts["review"]["summary"], "ok");

    assert_eq!(result.retrospects.len(), 1);
    let job = coordinator.retrospects().get(&result.retrospects[0]).unwrap();
    assert_eq!(job.plan_version, 1);
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.reason.as_deref(), Some("superseded"));
    assert!(job.superseded);

    // A verdict released now has no job left to land on
    release.notify_one();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!coordinator.replays().has_pending());
    assert_eq!(coordinator.replays().get_stats().tickets, 0);
    assert!(coordinator.lineage().latest_for_step("summary", "draft").unwrap().is_active());
}

#[tokio::test]
async fn test_cancel_gate_halts_the_run() {
    let sink = Arc::new(CollectingSink::new());
    let loader = Scripted::new("loader", |_: &StepCtx, _| Ok(StepOutput::success(json!({"rows": []}))));
    let coordinator = Coordinator::builder()
        .config(CoordinatorConfig::development())
        .policies(fast_policies())
        .capability(loader.clone())
        .capability(echo("reporter"))
        .sink(sink.clone())
        .build()
        .unwrap();

    let plan = PlanBuilder::new("guarded", TaskBrief::new("load").with_input("rows", json!(0)))
        .step(
            ContractBuilder::new("ingest", "loader")
                .input_ref("rows", "inputs.rows")
                .gate(Gate::new(GateKind::Precondition, "inputs.rows > 0").on_fail(OnFail::Cancel)),
        )
        .step(ContractBuilder::new("report", "reporter").after("ingest"))
        .build()
        .unwrap();

    let result = coordinator.execute_task(plan).await;
    assert_eq!(result.status, RunStatus::Halted);
    assert!(result.steps_executed.is_empty());
    assert_eq!(loader.calls(), 0);
    assert_eq!(result.escalations.len(), 1);
    assert!(result.escalations[0].message.contains("cancelled by precondition gate"));
    assert_eq!(sink.len(), 1);
    assert!(result
        .error
        .unwrap()
        .starts_with("Validation failed at precondition gate of step ingest"));
}

#[tokio::test]
async fn test_missing_capability_skips_retries() {
    let backup = Scripted::new("backup", |_: &StepCtx, _| Ok(StepOutput::success(json!({"source": "backup"}))));
    let coordinator = Coordinator::builder()
        .config(CoordinatorConfig::development())
        .policies(DefaultPolicies {
            retry: RetryPolicy {
                max_retries: 2,
                strategy: RetryStrategy::Linear { delay_ms: 200 },
            },
            ..Default::default()
        })
        .capability(backup.clone())
        .build()
        .unwrap();

    let plan = PlanBuilder::new("fallbacks", TaskBrief::new("fetch"))
        .step(
            ContractBuilder::new("fetch", "ghost")
                .fallback(Fallback::Retry { max: 3 })
                .fallback(Fallback::Alternate {
                    agent_or_tool: "backup".into(),
                }),
        )
        .build()
        .unwrap();

    let started = Instant::now();
    let result = coordinator.execute_task(plan).await;
    assert_eq!(result.status, RunStatus::Completed);
    assert!(started.elapsed() < Duration::from_millis(200));
    assert_eq!(backup.calls(), 1);
    assert_eq!(result.artifacts["fetch"]["source"], "backup");
}
