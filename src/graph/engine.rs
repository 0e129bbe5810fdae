//! 阶段图引擎
//!
//! 按出边顺序执行阶段：每个阶段前检查时长预算与步数上限，成功时合并增量，失败时不合并。
//! 运行以且仅以一个终态事件结束（run.completed 或 run.failed）。

use std::sync::Arc;

use serde_json::json;
use tokio::time::Instant;

use super::builder::StageGraph;
use super::types::{StageContext, WorkflowState};
use crate::core::{StageError, StageFailure};
use crate::events::EventType;
use crate::trace::{summarize, NodeTrace, TraceStatus};

pub struct GraphEngine<S: WorkflowState> {
    graph: Arc<StageGraph<S>>,
}

impl<S: WorkflowState> Clone for GraphEngine<S> {
    fn clone(&self) -> Self {
        Self {
            graph: Arc::clone(&self.graph),
        }
    }
}

impl<S: WorkflowState> GraphEngine<S> {
    pub fn new(graph: StageGraph<S>) -> Self {
        Self {
            graph: Arc::new(graph),
        }
    }

    pub fn graph(&self) -> &StageGraph<S> {
        &self.graph
    }

    /// 执行整张图直到终点或失败
    pub async fn run(&self, mut state: S, ctx: &StageContext) -> Result<S, StageFailure> {
        tracing::info!(run_id = %ctx.run_id, workflow = %self.graph.name(), "run started");
        ctx.emitter
            .emit(
                EventType::RunStarted,
                None,
                json!({ "workflow": self.graph.name(), "input": state.input_summary() }),
            )
            .await;

        let mut current = self.graph.entry();
        let mut steps = 0usize;

        loop {
            if steps >= ctx.settings.max_graph_steps {
                let err = StageError::Fatal(format!(
                    "graph exceeded {} stage transitions",
                    ctx.settings.max_graph_steps
                ));
                return Err(self.fail(ctx, current, err).await);
            }
            steps += 1;

            let elapsed = state.started_at().elapsed();
            if elapsed > ctx.settings.max_duration {
                let err = StageError::WorkflowTimeout {
                    stage: current.to_string(),
                    limit_secs: ctx.settings.max_duration.as_secs(),
                };
                return Err(self.fail(ctx, current, err).await);
            }

            let Some(stage) = self.graph.stage(current) else {
                let err = StageError::Fatal(format!("stage '{current}' is not registered"));
                return Err(self.fail(ctx, current, err).await);
            };

            tracing::info!(run_id = %ctx.run_id, stage = current, step = steps, "stage started");
            ctx.emitter
                .emit(EventType::StageStarted, Some(current), json!({ "step": steps }))
                .await;

            let input_summary = state.input_summary();
            let started = Instant::now();
            let result = stage.run(&state, ctx).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(output) => {
                    state.merge(output.delta);
                    ctx.emitter
                        .emit(
                            EventType::StageCompleted,
                            Some(current),
                            json!({ "duration_ms": duration_ms, "summary": output.summary }),
                        )
                        .await;
                    self.trace(
                        ctx,
                        NodeTrace {
                            run_id: ctx.run_id.clone(),
                            stage: current.to_string(),
                            status: TraceStatus::Ok,
                            duration_ms,
                            input_summary,
                            output_summary: summarize(&output.summary),
                            rationale: output.rationale,
                        },
                    )
                    .await;
                }
                Err(err) => {
                    tracing::warn!(run_id = %ctx.run_id, stage = current, error = %err, "stage failed");
                    ctx.emitter
                        .emit(
                            EventType::StageFailed,
                            Some(current),
                            json!({
                                "error": err.public_message(),
                                "kind": err.kind(),
                                "duration_ms": duration_ms,
                            }),
                        )
                        .await;
                    self.trace(
                        ctx,
                        NodeTrace {
                            run_id: ctx.run_id.clone(),
                            stage: current.to_string(),
                            status: TraceStatus::Failed,
                            duration_ms,
                            input_summary,
                            output_summary: summarize(&err.to_string()),
                            rationale: None,
                        },
                    )
                    .await;
                    return Err(self.fail(ctx, current, err).await);
                }
            }

            match self.graph.next(current, &state) {
                Ok(Some(next)) => current = next,
                Ok(None) => break,
                Err(err) => return Err(self.fail(ctx, current, err).await),
            }
        }

        if let Some(receipt) = state.receipt() {
            ctx.emitter.emit(EventType::AiReceipt, None, receipt).await;
        }
        ctx.emitter
            .emit(EventType::RunCompleted, None, state.outcome())
            .await;
        tracing::info!(run_id = %ctx.run_id, steps, "run completed");
        Ok(state)
    }

    async fn trace(&self, ctx: &StageContext, trace: NodeTrace) {
        if let Err(e) = ctx.services.trace.append_node_trace(trace).await {
            tracing::warn!(run_id = %ctx.run_id, error = %e, "trace append failed");
        }
    }

    async fn fail(&self, ctx: &StageContext, stage: &str, error: StageError) -> StageFailure {
        tracing::error!(run_id = %ctx.run_id, stage, error = %error, "run failed");
        ctx.emitter
            .emit(
                EventType::RunFailed,
                Some(stage),
                json!({ "error": error.public_message(), "kind": error.kind() }),
            )
            .await;
        StageFailure {
            stage: stage.to_string(),
            error,
        }
    }
}
