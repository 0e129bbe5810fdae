//! 运行编排器：启动教案/辅导运行，处理幂等键、心跳与事件流
//!
//! 每次运行：注册事件发射器（run_id 已被占用则拒绝）→ 启动心跳任务 → 图引擎执行 → 取消心跳 → 注销发射器。
//! 终态事件由引擎发出；心跳在终态之后到达时被发射器丢弃。后台任务异常退出时由监督任务补发 run.failed。

use std::sync::Arc;
use std::time::Duration;

use futures_util::Stream;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::{ErrorKind, OrchestratorError, Services};
use crate::events::{resumable_stream, EventEmitter, EventType, ReplayEntry};
use crate::graph::{
    plan_graph, tutor_graph, GraphEngine, PlanRequest, PlanState, StageContext, TutorRequest,
    TutorState, WorkflowState,
};
use crate::llm::RouteMetrics;
use crate::resilience::IdempotencyGuard;

/// start_plan_run 的结果
#[derive(Debug, Clone, PartialEq)]
pub enum RunStart {
    /// 新运行已在后台启动，可用 run_id 订阅事件
    Started { run_id: String },
    /// 同一幂等键已有完成结果
    Cached { outcome: Value },
}

#[derive(Clone)]
pub struct Orchestrator {
    services: Arc<Services>,
    plan: GraphEngine<PlanState>,
    tutor: GraphEngine<TutorState>,
    idempotency: Arc<IdempotencyGuard<Value>>,
}

impl Orchestrator {
    pub fn new(services: Arc<Services>) -> Result<Self, OrchestratorError> {
        let plan = plan_graph().map_err(|e| OrchestratorError::Config(e.to_string()))?;
        let tutor = tutor_graph().map_err(|e| OrchestratorError::Config(e.to_string()))?;
        let res = &services.config.resilience;
        let idempotency = IdempotencyGuard::new(
            Duration::from_secs(res.idempotency_ttl_seconds),
            res.idempotency_capacity,
        );
        Ok(Self {
            plan: GraphEngine::new(plan),
            tutor: GraphEngine::new(tutor),
            idempotency: Arc::new(idempotency),
            services,
        })
    }

    /// 按配置构建默认 Services
    pub fn from_config(config: AppConfig) -> Result<Self, OrchestratorError> {
        let services = Services::builder(config).build()?;
        Self::new(Arc::new(services))
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// 同步执行一次教案运行，返回 run.completed 的负载
    pub async fn run_plan(
        &self,
        run_id: &str,
        request: PlanRequest,
        idempotency_key: Option<&str>,
    ) -> Result<Value, OrchestratorError> {
        if let Some(cached) = self.acquire(idempotency_key)? {
            return Ok(cached);
        }
        let emitter = match self.claim_run(run_id).await {
            Ok(emitter) => emitter,
            Err(e) => {
                self.release(idempotency_key);
                return Err(e);
            }
        };
        let tenant = request.tenant.clone();
        self.execute(
            &self.plan,
            emitter,
            PlanState::new(request),
            tenant.as_deref(),
            idempotency_key,
        )
        .await
    }

    /// 后台启动教案运行；返回前已注册发射器，调用方可立即订阅
    ///
    /// run_id 为 None 时生成 UUID；调用方给定的 run_id 已被占用（进行中或已结束）时返回 DuplicateRun。
    pub async fn start_plan_run(
        &self,
        request: PlanRequest,
        run_id: Option<String>,
        idempotency_key: Option<String>,
    ) -> Result<RunStart, OrchestratorError> {
        if let Some(outcome) = self.acquire(idempotency_key.as_deref())? {
            return Ok(RunStart::Cached { outcome });
        }
        let tenant = request.tenant.clone();
        self.spawn_run(
            self.plan.clone(),
            PlanState::new(request),
            tenant,
            run_id,
            idempotency_key,
        )
        .await
    }

    /// 后台启动一轮辅导对话
    pub async fn start_tutor_run(
        &self,
        request: TutorRequest,
        run_id: Option<String>,
        idempotency_key: Option<String>,
    ) -> Result<RunStart, OrchestratorError> {
        if let Some(outcome) = self.acquire(idempotency_key.as_deref())? {
            return Ok(RunStart::Cached { outcome });
        }
        let tenant = request.tenant.clone();
        self.spawn_run(
            self.tutor.clone(),
            TutorState::new(request),
            tenant,
            run_id,
            idempotency_key,
        )
        .await
    }

    async fn spawn_run<S: WorkflowState>(
        &self,
        engine: GraphEngine<S>,
        state: S,
        tenant: Option<String>,
        run_id: Option<String>,
        idempotency_key: Option<String>,
    ) -> Result<RunStart, OrchestratorError> {
        let run_id = run_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let emitter = match self.claim_run(&run_id).await {
            Ok(emitter) => emitter,
            Err(e) => {
                self.release(idempotency_key.as_deref());
                return Err(e);
            }
        };

        let this = self.clone();
        let run_emitter = Arc::clone(&emitter);
        let key = idempotency_key.clone();
        let task = tokio::spawn(async move {
            this.execute(&engine, run_emitter, state, tenant.as_deref(), key.as_deref())
                .await
        });

        let this = self.clone();
        let id = run_id.clone();
        tokio::spawn(async move {
            match task.await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::warn!(run_id = %id, error = %e, "background run failed"),
                Err(e) => {
                    tracing::error!(run_id = %id, error = %e, "background run task aborted");
                    this.release(idempotency_key.as_deref());
                    this.services.bus.remove(&id);
                    emitter
                        .emit(
                            EventType::RunFailed,
                            None,
                            json!({ "error": "internal error", "kind": ErrorKind::Fatal }),
                        )
                        .await;
                }
            }
        });
        Ok(RunStart::Started { run_id })
    }

    /// 执行一轮辅导对话
    pub async fn run_tutor(
        &self,
        run_id: &str,
        request: TutorRequest,
        idempotency_key: Option<&str>,
    ) -> Result<Value, OrchestratorError> {
        if let Some(cached) = self.acquire(idempotency_key)? {
            return Ok(cached);
        }
        let emitter = match self.claim_run(run_id).await {
            Ok(emitter) => emitter,
            Err(e) => {
                self.release(idempotency_key);
                return Err(e);
            }
        };
        let tenant = request.tenant.clone();
        self.execute(
            &self.tutor,
            emitter,
            TutorState::new(request),
            tenant.as_deref(),
            idempotency_key,
        )
        .await
    }

    /// 可续传事件流：先回放 after_seq 之后的已存事件，再转发实时事件，终态后结束
    pub fn event_stream(
        &self,
        run_id: &str,
        after_seq: Option<u64>,
    ) -> impl Stream<Item = ReplayEntry> + Send + 'static {
        let bus = &self.services.bus;
        resumable_stream(bus.store(), bus.subscribe(run_id), run_id.to_string(), after_seq)
    }

    /// 最近 n 条路由记录
    pub fn router_metrics(&self, n: usize) -> Vec<RouteMetrics> {
        self.services
            .router
            .as_ref()
            .map(|r| r.get_recent_metrics(n))
            .unwrap_or_default()
    }

    /// 幂等键检查：None 表示可以开始新运行，Some 为缓存结果
    fn acquire(&self, key: Option<&str>) -> Result<Option<Value>, OrchestratorError> {
        let Some(key) = key else {
            return Ok(None);
        };
        if self.idempotency.try_acquire(key) {
            return Ok(None);
        }
        match self.idempotency.get_result(key) {
            Some(cached) => {
                tracing::info!(idempotency_key = key, "returning cached run outcome");
                Ok(Some(cached))
            }
            None => Err(OrchestratorError::DuplicateRun(key.to_string())),
        }
    }

    fn release(&self, key: Option<&str>) {
        if let Some(key) = key {
            self.idempotency.fail(key);
        }
    }

    /// 占用 run_id：先注册发射器再查终态，已结束的 run 必先标记终态后才注销
    async fn claim_run(&self, run_id: &str) -> Result<Arc<EventEmitter>, OrchestratorError> {
        let bus = &self.services.bus;
        let Some(emitter) = bus.register(run_id) else {
            return Err(OrchestratorError::DuplicateRun(run_id.to_string()));
        };
        let finished = bus.store().is_terminal(run_id).await.unwrap_or_else(|e| {
            tracing::warn!(run_id, error = %e, "replay store lookup failed");
            false
        });
        if finished {
            bus.remove(run_id);
            return Err(OrchestratorError::DuplicateRun(run_id.to_string()));
        }
        Ok(emitter)
    }

    async fn execute<S: WorkflowState>(
        &self,
        engine: &GraphEngine<S>,
        emitter: Arc<EventEmitter>,
        state: S,
        tenant: Option<&str>,
        idempotency_key: Option<&str>,
    ) -> Result<Value, OrchestratorError> {
        let run_id = emitter.run_id().to_string();
        let settings = self.services.config.settings_for(tenant);
        let token = CancellationToken::new();
        let heartbeat = spawn_heartbeat(Arc::clone(&emitter), settings.heartbeat_interval, token.clone());
        // 引擎 panic 时也停止心跳
        let heartbeat_guard = token.drop_guard();

        let ctx = StageContext::new(&run_id, emitter, settings, Arc::clone(&self.services));
        let result = engine.run(state, &ctx).await;

        drop(heartbeat_guard);
        let _ = heartbeat.await;
        self.services.bus.remove(&run_id);

        match result {
            Ok(state) => {
                let outcome = state.outcome();
                if let Some(key) = idempotency_key {
                    self.idempotency.complete(key, outcome.clone());
                }
                Ok(outcome)
            }
            Err(failure) => {
                self.release(idempotency_key);
                Err(OrchestratorError::from(failure))
            }
        }
    }
}

/// 心跳任务：按间隔发 heartbeat，token 取消后退出
fn spawn_heartbeat(
    emitter: Arc<EventEmitter>,
    interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // 第一次 tick 立即完成
        ticker.tick().await;
        let mut beat = 0u64;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    beat += 1;
                    emitter
                        .emit(EventType::Heartbeat, None, json!({ "beat": beat }))
                        .await;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ErrorKind;
    use crate::graph::testing::{builder, draft, events, kinds, ScriptedAgent, ScriptedScorer};
    use futures_util::StreamExt;

    fn orchestrator(scores: &[f64], planner: ScriptedAgent) -> Orchestrator {
        let services = builder([
            Arc::new(planner),
            Arc::new(ScriptedAgent::new("quality").reply(json!({ "score": 90 }))),
            Arc::new(ScriptedAgent::new("executor").reply(json!({ "title": "final" }))),
            Arc::new(ScriptedAgent::new("classifier").reply(json!({ "intent": "chitchat" }))),
            Arc::new(ScriptedAgent::new("tutor").reply(json!("hi"))),
        ])
        .scorer(Arc::new(ScriptedScorer::new(scores)))
        .build()
        .unwrap();
        Orchestrator::new(Arc::new(services)).unwrap()
    }

    #[tokio::test]
    async fn test_cached_outcome_for_same_key() {
        let orch = orchestrator(&[90.0], ScriptedAgent::new("planner").reply(draft("Fractions")));
        let first = orch
            .run_plan("run-a", PlanRequest::new("fractions"), Some("key-1"))
            .await
            .unwrap();
        let second = orch
            .run_plan("run-b", PlanRequest::new("fractions"), Some("key-1"))
            .await
            .unwrap();
        assert_eq!(first, second);
        assert!(events(orch.services(), "run-b").await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_run_releases_key() {
        let planner = ScriptedAgent::new("planner")
            .reply(json!("not a draft"))
            .reply(draft("Fractions"));
        let orch = orchestrator(&[90.0], planner);
        let err = orch
            .run_plan("run-a", PlanRequest::new("fractions"), Some("key-2"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Fatal));
        assert!(orch
            .run_plan("run-b", PlanRequest::new("fractions"), Some("key-2"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_reused_run_id_rejected() {
        let orch = orchestrator(&[90.0], ScriptedAgent::new("planner").reply(draft("Fractions")));
        orch.run_plan("run-a", PlanRequest::new("x"), None).await.unwrap();
        let err = orch
            .run_plan("run-a", PlanRequest::new("x"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::DuplicateRun(_)));
    }

    #[tokio::test]
    async fn test_in_flight_key_is_duplicate() {
        let orch = orchestrator(&[90.0], ScriptedAgent::new("planner").reply(draft("Fractions")));
        assert!(orch.idempotency.try_acquire("key-3"));
        let err = orch
            .start_plan_run(PlanRequest::new("x"), None, Some("key-3".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::DuplicateRun(k) if k == "key-3"));
    }

    #[tokio::test]
    async fn test_started_run_streams_to_terminal() {
        let orch = orchestrator(&[90.0], ScriptedAgent::new("planner").reply(draft("Fractions")));
        let RunStart::Started { run_id } = orch
            .start_plan_run(PlanRequest::new("fractions"), None, None)
            .await
            .unwrap()
        else {
            panic!("expected a new run");
        };
        let streamed: Vec<ReplayEntry> = orch.event_stream(&run_id, None).collect().await;
        assert_eq!(streamed.last().unwrap().kind, EventType::RunCompleted);
        let seqs: Vec<u64> = streamed.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, (1..=streamed.len() as u64).collect::<Vec<_>>());

        let resumed: Vec<ReplayEntry> = orch.event_stream(&run_id, Some(3)).collect().await;
        assert_eq!(resumed.first().unwrap().seq, 4);
        assert_eq!(resumed.len(), streamed.len() - 3);
        assert_eq!(resumed.last().unwrap().payload, streamed.last().unwrap().payload);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_same_run_id_claimed_once() {
        let planner = ScriptedAgent::new("planner")
            .reply(draft("Fractions"))
            .with_delay(Duration::from_secs(2));
        let orch = orchestrator(&[90.0], planner);
        let (a, b) = tokio::join!(
            orch.run_plan("run-x", PlanRequest::new("x"), None),
            orch.run_plan("run-x", PlanRequest::new("x"), None),
        );
        let duplicates = [&a, &b]
            .iter()
            .filter(|r| matches!(r, Err(OrchestratorError::DuplicateRun(id)) if id == "run-x"))
            .count();
        assert_eq!(duplicates, 1);
        assert!(a.is_ok() || b.is_ok());

        let log = kinds(&events(orch.services(), "run-x").await);
        assert_eq!(log.iter().filter(|k| **k == EventType::RunStarted).count(), 1);
        assert_eq!(log.last(), Some(&EventType::RunCompleted));
    }

    #[tokio::test]
    async fn test_caller_supplied_run_id() {
        let orch = orchestrator(&[90.0], ScriptedAgent::new("planner").reply(draft("Fractions")));
        let start = orch
            .start_plan_run(PlanRequest::new("fractions"), Some("lesson-7".into()), None)
            .await
            .unwrap();
        assert_eq!(start, RunStart::Started { run_id: "lesson-7".into() });
        let streamed: Vec<ReplayEntry> = orch.event_stream("lesson-7", None).collect().await;
        assert_eq!(streamed.last().unwrap().kind, EventType::RunCompleted);

        // 已结束的 run_id 不可复用，且失败时释放幂等键
        let err = orch
            .start_plan_run(
                PlanRequest::new("fractions"),
                Some("lesson-7".into()),
                Some("key-7".into()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::DuplicateRun(id) if id == "lesson-7"));
        assert!(orch.idempotency.try_acquire("key-7"));
    }

    struct PanickingScorer;

    impl crate::agents::QualityScorer for PanickingScorer {
        fn score(&self, _draft: &Value, _profile: &Value) -> crate::agents::QualityReport {
            panic!("scorer bug");
        }
    }

    #[tokio::test]
    async fn test_panicked_run_reports_failure() {
        let services = builder([
            Arc::new(ScriptedAgent::new("planner").reply(draft("Fractions"))),
            Arc::new(ScriptedAgent::new("quality")),
            Arc::new(ScriptedAgent::new("executor")),
            Arc::new(ScriptedAgent::new("classifier")),
            Arc::new(ScriptedAgent::new("tutor")),
        ])
        .scorer(Arc::new(PanickingScorer))
        .build()
        .unwrap();
        let orch = Orchestrator::new(Arc::new(services)).unwrap();
        let RunStart::Started { run_id } = orch
            .start_plan_run(PlanRequest::new("fractions"), None, Some("key-p".into()))
            .await
            .unwrap()
        else {
            panic!("expected a new run");
        };
        let streamed: Vec<ReplayEntry> = orch.event_stream(&run_id, None).collect().await;
        let last = streamed.last().unwrap();
        assert_eq!(last.kind, EventType::RunFailed);
        assert!(last.payload.contains("fatal"));
        assert_eq!(orch.services().bus.active_runs(), 0);
        assert!(orch.idempotency.try_acquire("key-p"));
    }

    #[tokio::test]
    async fn test_tutor_run() {
        let orch = orchestrator(&[90.0], ScriptedAgent::new("planner"));
        let outcome = orch
            .run_tutor("chat-1", TutorRequest::new("hello"), None)
            .await
            .unwrap();
        assert_eq!(outcome["answer"], "hi");
        let kinds = kinds(&events(orch.services(), "chat-1").await);
        assert_eq!(kinds.last(), Some(&EventType::RunCompleted));
        assert_eq!(orch.services().bus.active_runs(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_until_cancelled() {
        let services = builder([
            Arc::new(ScriptedAgent::new("planner")),
            Arc::new(ScriptedAgent::new("quality")),
            Arc::new(ScriptedAgent::new("executor")),
            Arc::new(ScriptedAgent::new("classifier")),
            Arc::new(ScriptedAgent::new("tutor")),
        ])
        .build()
        .unwrap();
        let emitter = services.bus.emitter("hb");
        let token = CancellationToken::new();
        let handle = spawn_heartbeat(Arc::clone(&emitter), Duration::from_secs(15), token.clone());

        tokio::time::sleep(Duration::from_secs(46)).await;
        token.cancel();
        handle.await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;

        let log = events(&services, "hb").await;
        assert_eq!(log.len(), 3);
        assert!(log.iter().all(|e| e.kind == EventType::Heartbeat));
    }
}
