//! 阶段图核心类型：运行状态 trait、阶段 trait、阶段上下文与输出

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::time::Instant;

use crate::config::WorkflowSettings;
use crate::core::{Services, StageError};
use crate::events::{EventEmitter, EventType};
use crate::llm::{RouteMetrics, Tier};

/// 运行记录：阶段只产出增量，由 merge 显式合并（按字段后写覆盖）
pub trait WorkflowState: Send + Sync + 'static {
    type Delta: Send + 'static;

    fn merge(&mut self, delta: Self::Delta);

    /// 运行开始时刻（单调时钟），用于工作流时长预算
    fn started_at(&self) -> Instant;

    /// run.started 中的输入摘要
    fn input_summary(&self) -> String;

    /// run.completed 的负载
    fn outcome(&self) -> Value;

    /// 运行结束前的 ai.receipt 负载；None 表示不发
    fn receipt(&self) -> Option<Value> {
        None
    }
}

/// 阶段执行结果：状态增量 + 追踪用的摘要与理由
pub struct StageOutput<D> {
    pub delta: D,
    pub summary: String,
    pub rationale: Option<Value>,
}

impl<D> StageOutput<D> {
    pub fn new(delta: D) -> Self {
        Self {
            delta,
            summary: String::new(),
            rationale: None,
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }

    pub fn with_rationale(mut self, rationale: Value) -> Self {
        self.rationale = Some(rationale);
        self
    }
}

#[async_trait]
pub trait Stage<S: WorkflowState>: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, state: &S, ctx: &StageContext) -> Result<StageOutput<S::Delta>, StageError>;
}

/// 单次运行的上下文：run_id、事件发射器、生效配置与共享服务
pub struct StageContext {
    pub run_id: String,
    pub emitter: Arc<EventEmitter>,
    pub settings: WorkflowSettings,
    pub services: Arc<Services>,
}

impl StageContext {
    pub fn new(
        run_id: impl Into<String>,
        emitter: Arc<EventEmitter>,
        settings: WorkflowSettings,
        services: Arc<Services>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            emitter,
            settings,
            services,
        }
    }

    /// 发出阶段内事件（进度、质量分、工具调用等）
    pub async fn emit(&self, event_type: EventType, stage: &str, payload: Value) {
        self.emitter.emit(event_type, Some(stage), payload).await;
    }
}

/// 一次 Agent 调用的路由记录，用于追踪与 ai.receipt
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteSummary {
    pub stage: String,
    pub tier: Tier,
    pub provider: String,
    pub is_fallback: bool,
    pub reason: String,
    pub score: f64,
}

impl RouteSummary {
    pub fn from_metrics(stage: &str, metrics: &RouteMetrics) -> Self {
        Self {
            stage: stage.to_string(),
            tier: metrics.tier,
            provider: metrics.provider.clone(),
            is_fallback: metrics.is_fallback,
            reason: metrics.decision.reason.clone(),
            score: metrics.decision.score,
        }
    }

    pub fn to_rationale(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// ai.receipt 负载：用到的档位与 Provider、降级次数、迭代次数、最终分、是否采用 LLM 质量意见
pub fn build_receipt(
    routes: &[RouteSummary],
    refinement_iterations: u32,
    final_score: Option<f64>,
    llm_quality_opinion: bool,
) -> Value {
    let tiers: BTreeSet<&str> = routes.iter().map(|r| r.tier.as_str()).collect();
    let providers: BTreeSet<&str> = routes.iter().map(|r| r.provider.as_str()).collect();
    json!({
        "tiers": tiers,
        "providers": providers,
        "model_calls": routes.len(),
        "fallbacks": routes.iter().filter(|r| r.is_fallback).count(),
        "refinement_iterations": refinement_iterations,
        "final_score": final_score,
        "llm_quality_opinion": llm_quality_opinion,
    })
}

/// 租户配置中的模型标识若是档位名（cheap / middle / primary），作为调用方档位覆盖
pub fn tier_override(model: Option<&str>) -> Option<Tier> {
    match model?.trim().to_lowercase().as_str() {
        "cheap" => Some(Tier::Cheap),
        "middle" => Some(Tier::Middle),
        "primary" => Some(Tier::Primary),
        _ => None,
    }
}
