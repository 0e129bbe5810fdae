//! 教案生成流程：planner → validate → decision → {refine → planner | execute} → end
//!
//! validate 是混合质量门：确定性分数总是计算；落在 LLM 区间且质量熔断器闭合时，
//! 再请求一次 LLM 评分并按滞回权重混合。LLM 评分失败在本阶段内恢复，沿用确定性分数。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::Instant;

use super::builder::{GraphBuilder, GraphError, StageGraph};
use super::guard::call_agent;
use super::types::{
    build_receipt, tier_override, RouteSummary, Stage, StageContext, StageOutput, WorkflowState,
};
use crate::agents::QualityReport;
use crate::config::QualityThresholds;
use crate::core::StageError;
use crate::events::EventType;
use crate::trace::summarize;

pub const PLANNER: &str = "planner";
pub const VALIDATE: &str = "validate";
pub const DECISION: &str = "decision";
pub const REFINE: &str = "refine";
pub const EXECUTE: &str = "execute";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Refine,
    Execute,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BlendWeights {
    pub deterministic: f64,
    pub llm: f64,
}

/// 一次质量门的结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Validation {
    pub report: QualityReport,
    pub deterministic_score: f64,
    pub llm_score: Option<f64>,
    pub final_score: f64,
    pub weights: Option<BlendWeights>,
    /// LLM 评分失败原因（已在本阶段恢复）
    pub llm_error: Option<String>,
}

impl Validation {
    pub fn llm_used(&self) -> bool {
        self.llm_score.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IterationScore {
    pub refine_iter: u32,
    pub deterministic: f64,
    pub llm: Option<f64>,
    pub final_score: f64,
}

/// 每轮迭代的分数记录
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Scorecard {
    pub iterations: Vec<IterationScore>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlanRequest {
    pub prompt: String,
    #[serde(default)]
    pub tenant: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    /// 学段、课时等期望，交给确定性评分器
    #[serde(default)]
    pub profile: Value,
}

impl PlanRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }
}

/// 教案运行记录
#[derive(Debug, Clone, Serialize)]
pub struct PlanState {
    pub user_prompt: String,
    pub tenant: Option<String>,
    pub subject: Option<String>,
    pub profile: Value,
    #[serde(skip)]
    pub started_at: Instant,
    pub refine_iter: u32,
    pub draft: Option<Value>,
    pub validation: Option<Validation>,
    #[serde(rename = "final")]
    pub final_plan: Option<Value>,
    pub scorecard: Scorecard,
    pub verdict: Option<Verdict>,
    pub routes: Vec<RouteSummary>,
}

impl PlanState {
    pub fn new(request: PlanRequest) -> Self {
        Self {
            user_prompt: request.prompt,
            tenant: request.tenant,
            subject: request.subject,
            profile: request.profile,
            started_at: Instant::now(),
            refine_iter: 0,
            draft: None,
            validation: None,
            final_plan: None,
            scorecard: Scorecard::default(),
            verdict: None,
            routes: Vec::new(),
        }
    }

    pub fn final_score(&self) -> Option<f64> {
        self.validation.as_ref().map(|v| v.final_score)
    }
}

/// 阶段增量：Some 字段覆盖，scorecard 与 routes 追加
#[derive(Debug, Default)]
pub struct PlanDelta {
    pub refine_iter: Option<u32>,
    pub draft: Option<Value>,
    pub validation: Option<Validation>,
    pub final_plan: Option<Value>,
    pub verdict: Option<Verdict>,
    pub score: Option<IterationScore>,
    pub routes: Vec<RouteSummary>,
}

impl WorkflowState for PlanState {
    type Delta = PlanDelta;

    fn merge(&mut self, delta: PlanDelta) {
        if let Some(iter) = delta.refine_iter {
            self.refine_iter = iter;
        }
        if let Some(draft) = delta.draft {
            self.draft = Some(draft);
        }
        if let Some(validation) = delta.validation {
            self.validation = Some(validation);
        }
        if let Some(final_plan) = delta.final_plan {
            self.final_plan = Some(final_plan);
        }
        if let Some(verdict) = delta.verdict {
            self.verdict = Some(verdict);
        }
        if let Some(score) = delta.score {
            self.scorecard.iterations.push(score);
        }
        self.routes.extend(delta.routes);
    }

    fn started_at(&self) -> Instant {
        self.started_at
    }

    fn input_summary(&self) -> String {
        summarize(&self.user_prompt)
    }

    fn outcome(&self) -> Value {
        json!({
            "final": self.final_plan,
            "score": self.final_score(),
            "refine_iter": self.refine_iter,
            "scorecard": self.scorecard,
        })
    }

    fn receipt(&self) -> Option<Value> {
        let llm_opinion = self.scorecard.iterations.iter().any(|s| s.llm.is_some());
        Some(build_receipt(
            &self.routes,
            self.refine_iter,
            self.final_score(),
            llm_opinion,
        ))
    }
}

/// 决策规则：达到接受阈值或迭代用尽 → execute，否则 refine
pub fn decide(
    score: f64,
    refine_iter: u32,
    max_refinement_iters: u32,
    thresholds: &QualityThresholds,
) -> (Verdict, &'static str) {
    if score >= thresholds.accept_threshold {
        return (Verdict::Execute, "accepted");
    }
    if refine_iter >= max_refinement_iters {
        return (Verdict::Execute, "max_iterations_reached");
    }
    if score < thresholds.refine_threshold {
        (Verdict::Refine, "below_refine_threshold")
    } else {
        (Verdict::Refine, "below_accept_threshold")
    }
}

/// 确定性分数是否落在需要 LLM 意见的区间（闭区间）
pub fn needs_llm_opinion(deterministic: f64, thresholds: &QualityThresholds) -> bool {
    deterministic >= thresholds.llm_band_low && deterministic <= thresholds.llm_band_high
}

/// 靠近任一决策阈值时偏向确定性分数
pub fn blend_weights(deterministic: f64, thresholds: &QualityThresholds) -> BlendWeights {
    let near = |threshold: f64| (deterministic - threshold).abs() <= thresholds.hysteresis_window;
    if near(thresholds.refine_threshold) || near(thresholds.accept_threshold) {
        BlendWeights {
            deterministic: 0.6,
            llm: 0.4,
        }
    } else {
        BlendWeights {
            deterministic: 0.4,
            llm: 0.6,
        }
    }
}

pub fn blend(deterministic: f64, llm: f64, weights: BlendWeights) -> f64 {
    (weights.deterministic * deterministic + weights.llm * llm).clamp(0.0, 100.0)
}

/// 解析 LLM 评分：{"score": n} 或裸数字
pub fn parse_llm_score(value: &Value) -> Option<f64> {
    let raw = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        other => other.get("score").and_then(|s| match s {
            Value::String(s) => s.trim().parse().ok(),
            other => other.as_f64(),
        }),
    }?;
    raw.is_finite().then(|| raw.clamp(0.0, 100.0))
}

fn recommendation(item: &str) -> String {
    match item {
        "title" => "Give the plan a clear, specific title".to_string(),
        "objectives" => "State at least two measurable learning objectives".to_string(),
        "activities" => "Include at least two activities, each with a duration".to_string(),
        "duration_fit" => "Make activity durations add up to the lesson length".to_string(),
        "assessment" => "Describe how learning will be assessed".to_string(),
        "materials" => "List the materials the lesson needs".to_string(),
        "grade_level" => "State the target grade level".to_string(),
        other => format!("Improve {other}"),
    }
}

/// 追加给 planner 的改进反馈
pub fn feedback_block(validation: &Validation) -> Value {
    let recommendations: Vec<String> = validation
        .report
        .checklist
        .iter()
        .filter(|c| !c.passed)
        .map(|c| recommendation(&c.name))
        .collect();
    json!({
        "previous_score": validation.final_score,
        "errors": validation.report.errors,
        "warnings": validation.report.warnings,
        "recommendations": recommendations,
    })
}

fn draft_of<'a>(state: &'a PlanState, stage: &str) -> Result<&'a Value, StageError> {
    state
        .draft
        .as_ref()
        .ok_or_else(|| StageError::Fatal(format!("{stage} reached without a draft")))
}

pub struct PlannerStage;

#[async_trait]
impl Stage<PlanState> for PlannerStage {
    fn name(&self) -> &'static str {
        PLANNER
    }

    async fn run(
        &self,
        state: &PlanState,
        ctx: &StageContext,
    ) -> Result<StageOutput<PlanDelta>, StageError> {
        let revising = state.refine_iter > 0;
        ctx.emit(
            EventType::StageProgress,
            PLANNER,
            json!({
                "message": if revising { "revising draft" } else { "drafting lesson plan" },
                "refine_iter": state.refine_iter,
            }),
        )
        .await;

        let mut context = json!({
            "subject": state.subject,
            "profile": state.profile,
        });
        if revising {
            if let Some(validation) = &state.validation {
                context["refinement_feedback"] = feedback_block(validation);
            }
            if let Some(draft) = &state.draft {
                context["previous_draft"] = draft.clone();
            }
        }

        let services = &ctx.services;
        let output = call_agent(
            services.agents.planner.as_ref(),
            &services.breakers.planner,
            &services.retry_policy,
            &state.user_prompt,
            &context,
            tier_override(ctx.settings.planner_model.as_deref()),
        )
        .await?;

        if !output.value.is_object() {
            return Err(StageError::Fatal("planner returned a non-object draft".into()));
        }
        let title = output.value["title"].as_str().unwrap_or("untitled").to_string();

        if revising {
            ctx.emit(
                EventType::RefinementCompleted,
                PLANNER,
                json!({ "refine_iter": state.refine_iter, "title": title }),
            )
            .await;
        }

        let route = output.route.as_ref().map(|m| RouteSummary::from_metrics(PLANNER, m));
        let mut result = StageOutput::new(PlanDelta {
            draft: Some(output.value),
            routes: route.iter().cloned().collect(),
            ..Default::default()
        })
        .with_summary(format!("draft: {title}"));
        if let Some(route) = route {
            result = result.with_rationale(route.to_rationale());
        }
        Ok(result)
    }
}

pub struct ValidateStage;

#[async_trait]
impl Stage<PlanState> for ValidateStage {
    fn name(&self) -> &'static str {
        VALIDATE
    }

    async fn run(
        &self,
        state: &PlanState,
        ctx: &StageContext,
    ) -> Result<StageOutput<PlanDelta>, StageError> {
        let draft = draft_of(state, VALIDATE)?;
        let services = &ctx.services;
        let thresholds = ctx.settings.quality;

        let report = services.scorer.score(draft, &state.profile);
        let deterministic = report.score;

        let mut llm_score = None;
        let mut weights = None;
        let mut llm_error = None;
        let mut routes = Vec::new();

        if needs_llm_opinion(deterministic, &thresholds) {
            let context = json!({
                "draft": draft,
                "deterministic_score": deterministic,
                "warnings": report.warnings,
                "errors": report.errors,
            });
            let opinion = call_agent(
                services.agents.quality.as_ref(),
                &services.breakers.quality,
                &services.retry_policy,
                "Rate this lesson plan draft.",
                &context,
                None,
            )
            .await;
            match opinion {
                Ok(output) => {
                    routes.extend(output.route.as_ref().map(|m| RouteSummary::from_metrics(VALIDATE, m)));
                    match parse_llm_score(&output.value) {
                        Some(score) => {
                            llm_score = Some(score);
                            weights = Some(blend_weights(deterministic, &thresholds));
                        }
                        None => {
                            tracing::warn!(run_id = %ctx.run_id, stage = VALIDATE, "quality opinion had no score, using deterministic score");
                            llm_error = Some("quality opinion had no score".to_string());
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(run_id = %ctx.run_id, stage = VALIDATE, error = %err, "quality opinion failed, using deterministic score");
                    llm_error = Some(err.public_message());
                }
            }
        }

        let final_score = match (llm_score, weights) {
            (Some(llm), Some(w)) => blend(deterministic, llm, w),
            _ => deterministic,
        };

        ctx.emit(
            EventType::QualityScored,
            VALIDATE,
            json!({
                "deterministic": deterministic,
                "llm": llm_score,
                "final": final_score,
                "weights": weights,
                "llm_error": llm_error,
                "warnings": report.warnings,
                "errors": report.errors,
                "refine_iter": state.refine_iter,
            }),
        )
        .await;

        let rationale = json!({
            "deterministic": deterministic,
            "llm": llm_score,
            "weights": weights,
            "llm_error": llm_error,
        });
        let validation = Validation {
            report,
            deterministic_score: deterministic,
            llm_score,
            final_score,
            weights,
            llm_error,
        };
        Ok(StageOutput::new(PlanDelta {
            score: Some(IterationScore {
                refine_iter: state.refine_iter,
                deterministic,
                llm: llm_score,
                final_score,
            }),
            validation: Some(validation),
            routes,
            ..Default::default()
        })
        .with_summary(format!("score {final_score:.1}"))
        .with_rationale(rationale))
    }
}

pub struct DecisionStage;

#[async_trait]
impl Stage<PlanState> for DecisionStage {
    fn name(&self) -> &'static str {
        DECISION
    }

    async fn run(
        &self,
        state: &PlanState,
        ctx: &StageContext,
    ) -> Result<StageOutput<PlanDelta>, StageError> {
        let score = state
            .final_score()
            .ok_or_else(|| StageError::Fatal("decision reached without a quality score".into()))?;
        let max = ctx.settings.max_refinement_iters;
        let (verdict, reason) = decide(score, state.refine_iter, max, &ctx.settings.quality);
        tracing::info!(run_id = %ctx.run_id, score, refine_iter = state.refine_iter, ?verdict, reason, "quality decision");

        ctx.emit(
            EventType::QualityDecision,
            DECISION,
            json!({
                "verdict": verdict,
                "reason": reason,
                "score": score,
                "refine_iter": state.refine_iter,
                "max_refinement_iters": max,
            }),
        )
        .await;

        Ok(StageOutput::new(PlanDelta {
            verdict: Some(verdict),
            ..Default::default()
        })
        .with_summary(reason)
        .with_rationale(json!({ "verdict": verdict, "reason": reason, "score": score })))
    }
}

pub struct RefineStage;

#[async_trait]
impl Stage<PlanState> for RefineStage {
    fn name(&self) -> &'static str {
        REFINE
    }

    async fn run(
        &self,
        state: &PlanState,
        ctx: &StageContext,
    ) -> Result<StageOutput<PlanDelta>, StageError> {
        let next = state.refine_iter + 1;
        ctx.emit(
            EventType::RefinementStarted,
            REFINE,
            json!({ "refine_iter": next, "previous_score": state.final_score() }),
        )
        .await;
        Ok(StageOutput::new(PlanDelta {
            refine_iter: Some(next),
            ..Default::default()
        })
        .with_summary(format!("refinement {next}")))
    }
}

pub struct ExecuteStage;

#[async_trait]
impl Stage<PlanState> for ExecuteStage {
    fn name(&self) -> &'static str {
        EXECUTE
    }

    async fn run(
        &self,
        state: &PlanState,
        ctx: &StageContext,
    ) -> Result<StageOutput<PlanDelta>, StageError> {
        let draft = draft_of(state, EXECUTE)?;
        let context = json!({
            "draft": draft,
            "subject": state.subject,
            "profile": state.profile,
            "quality": {
                "score": state.final_score(),
                "warnings": state.validation.as_ref().map(|v| &v.report.warnings),
            },
        });

        let services = &ctx.services;
        let output = call_agent(
            services.agents.executor.as_ref(),
            &services.breakers.executor,
            &services.retry_policy,
            &state.user_prompt,
            &context,
            tier_override(ctx.settings.executor_model.as_deref()),
        )
        .await?;

        let route = output.route.as_ref().map(|m| RouteSummary::from_metrics(EXECUTE, m));
        let mut result = StageOutput::new(PlanDelta {
            final_plan: Some(output.value),
            routes: route.iter().cloned().collect(),
            ..Default::default()
        })
        .with_summary("final plan ready");
        if let Some(route) = route {
            result = result.with_rationale(route.to_rationale());
        }
        Ok(result)
    }
}

/// 教案流程图
pub fn plan_graph() -> Result<StageGraph<PlanState>, GraphError> {
    GraphBuilder::new("lesson_plan")
        .stage(PlannerStage)
        .stage(ValidateStage)
        .stage(DecisionStage)
        .stage(RefineStage)
        .stage(ExecuteStage)
        .entry(PLANNER)
        .edge(PLANNER, VALIDATE)
        .edge(VALIDATE, DECISION)
        .branch(DECISION, &[REFINE, EXECUTE], |s: &PlanState| match s.verdict {
            Some(Verdict::Refine) => REFINE,
            _ => EXECUTE,
        })
        .edge(REFINE, PLANNER)
        .end(EXECUTE)
        .build()
}
