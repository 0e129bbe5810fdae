//! 辅导对话流程：classify → {rag_search | ∅} → generate → end

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::Instant;

use super::builder::{GraphBuilder, GraphError, StageGraph};
use super::guard::call_agent;
use super::types::{build_receipt, RouteSummary, Stage, StageContext, StageOutput, WorkflowState};
use crate::agents::Passage;
use crate::core::StageError;
use crate::events::EventType;
use crate::llm::Message;
use crate::resilience::retry;
use crate::trace::summarize;

pub const CLASSIFY: &str = "classify";
pub const RAG_SEARCH: &str = "rag_search";
pub const GENERATE: &str = "generate";

const RETRIEVAL_TOP_K: usize = 3;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TutorRequest {
    pub message: String,
    #[serde(default)]
    pub history: Vec<Message>,
    #[serde(default)]
    pub tenant: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
}

impl TutorRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TutorState {
    pub user_prompt: String,
    pub history: Vec<Message>,
    pub tenant: Option<String>,
    pub subject: Option<String>,
    #[serde(skip)]
    pub started_at: Instant,
    pub intent: Option<String>,
    pub needs_retrieval: bool,
    pub passages: Vec<Passage>,
    pub answer: Option<String>,
    pub routes: Vec<RouteSummary>,
}

impl TutorState {
    pub fn new(request: TutorRequest) -> Self {
        Self {
            user_prompt: request.message,
            history: request.history,
            tenant: request.tenant,
            subject: request.subject,
            started_at: Instant::now(),
            intent: None,
            needs_retrieval: false,
            passages: Vec::new(),
            answer: None,
            routes: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
pub struct TutorDelta {
    pub intent: Option<String>,
    pub needs_retrieval: Option<bool>,
    pub passages: Option<Vec<Passage>>,
    pub answer: Option<String>,
    pub routes: Vec<RouteSummary>,
}

impl WorkflowState for TutorState {
    type Delta = TutorDelta;

    fn merge(&mut self, delta: TutorDelta) {
        if let Some(intent) = delta.intent {
            self.intent = Some(intent);
        }
        if let Some(needs) = delta.needs_retrieval {
            self.needs_retrieval = needs;
        }
        if let Some(passages) = delta.passages {
            self.passages = passages;
        }
        if let Some(answer) = delta.answer {
            self.answer = Some(answer);
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
        let sources: Vec<&str> = self.passages.iter().map(|p| p.id.as_str()).collect();
        json!({
            "answer": self.answer,
            "intent": self.intent,
            "sources": sources,
        })
    }

    fn receipt(&self) -> Option<Value> {
        Some(build_receipt(&self.routes, 0, None, false))
    }
}

fn route_of(stage: &str, metrics: Option<&crate::llm::RouteMetrics>) -> Vec<RouteSummary> {
    metrics
        .map(|m| RouteSummary::from_metrics(stage, m))
        .into_iter()
        .collect()
}

pub struct ClassifyStage;

#[async_trait]
impl Stage<TutorState> for ClassifyStage {
    fn name(&self) -> &'static str {
        CLASSIFY
    }

    async fn run(
        &self,
        state: &TutorState,
        ctx: &StageContext,
    ) -> Result<StageOutput<TutorDelta>, StageError> {
        let services = &ctx.services;
        let context = json!({
            "subject": state.subject,
            "history_turns": state.history.len(),
        });
        let output = call_agent(
            services.agents.classifier.as_ref(),
            &services.breakers.classifier,
            &services.retry_policy,
            &state.user_prompt,
            &context,
            None,
        )
        .await?;

        if !output.value.is_object() {
            return Err(StageError::Fatal("classifier returned a non-object result".into()));
        }
        let intent = output.value["intent"]
            .as_str()
            .unwrap_or("concept_question")
            .to_string();
        let needs_retrieval = output.value["needs_retrieval"].as_bool().unwrap_or(false);

        Ok(StageOutput::new(TutorDelta {
            intent: Some(intent.clone()),
            needs_retrieval: Some(needs_retrieval),
            routes: route_of(CLASSIFY, output.route.as_ref()),
            ..Default::default()
        })
        .with_summary(format!("intent {intent}, retrieval {needs_retrieval}"))
        .with_rationale(output.value))
    }
}

pub struct RagSearchStage;

#[async_trait]
impl Stage<TutorState> for RagSearchStage {
    fn name(&self) -> &'static str {
        RAG_SEARCH
    }

    async fn run(
        &self,
        state: &TutorState,
        ctx: &StageContext,
    ) -> Result<StageOutput<TutorDelta>, StageError> {
        let query = state.user_prompt.as_str();
        ctx.emit(
            EventType::ToolStarted,
            RAG_SEARCH,
            json!({ "tool": "retriever", "query": summarize(query), "top_k": RETRIEVAL_TOP_K }),
        )
        .await;

        let retriever = ctx.services.retriever.as_ref();
        let passages = retry(&ctx.services.retry_policy, || {
            retriever.search(query, RETRIEVAL_TOP_K)
        })
        .await?;

        let ids: Vec<&str> = passages.iter().map(|p| p.id.as_str()).collect();
        ctx.emit(
            EventType::ToolCompleted,
            RAG_SEARCH,
            json!({ "tool": "retriever", "hits": passages.len(), "ids": ids }),
        )
        .await;

        let summary = format!("{} passages", passages.len());
        Ok(StageOutput::new(TutorDelta {
            passages: Some(passages),
            ..Default::default()
        })
        .with_summary(summary))
    }
}

pub struct GenerateStage;

#[async_trait]
impl Stage<TutorState> for GenerateStage {
    fn name(&self) -> &'static str {
        GENERATE
    }

    async fn run(
        &self,
        state: &TutorState,
        ctx: &StageContext,
    ) -> Result<StageOutput<TutorDelta>, StageError> {
        let services = &ctx.services;
        let mut context = json!({
            "history": state.history,
            "intent": state.intent,
            "subject": state.subject,
        });
        if !state.passages.is_empty() {
            context["passages"] = json!(state.passages);
        }

        let output = call_agent(
            services.agents.tutor.as_ref(),
            &services.breakers.tutor,
            &services.retry_policy,
            &state.user_prompt,
            &context,
            None,
        )
        .await?;

        let answer = match output.value {
            Value::String(ref s) => s.clone(),
            ref other => other.to_string(),
        };
        Ok(StageOutput::new(TutorDelta {
            answer: Some(answer.clone()),
            routes: route_of(GENERATE, output.route.as_ref()),
            ..Default::default()
        })
        .with_summary(answer))
    }
}

/// 辅导流程图
pub fn tutor_graph() -> Result<StageGraph<TutorState>, GraphError> {
    GraphBuilder::new("tutor_chat")
        .stage(ClassifyStage)
        .stage(RagSearchStage)
        .stage(GenerateStage)
        .entry(CLASSIFY)
        .branch(CLASSIFY, &[RAG_SEARCH, GENERATE], |s: &TutorState| {
            if s.needs_retrieval {
                RAG_SEARCH
            } else {
                GENERATE
            }
        })
        .edge(RAG_SEARCH, GENERATE)
        .end(GENERATE)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::testing::{builder, context, events, kinds, ScriptedAgent};
    use crate::graph::GraphEngine;
    use crate::trace::InMemoryTraceSink;
    use std::sync::Arc;

    fn agents(needs_retrieval: bool) -> [Arc<ScriptedAgent>; 5] {
        [
            Arc::new(ScriptedAgent::new("planner")),
            Arc::new(ScriptedAgent::new("quality")),
            Arc::new(ScriptedAgent::new("executor")),
            Arc::new(ScriptedAgent::new("classifier").reply(json!({
                "intent": "concept_question",
                "needs_retrieval": needs_retrieval,
            }))),
            Arc::new(ScriptedAgent::new("tutor").reply(json!("Plants use light to make sugar."))),
        ]
    }

    #[tokio::test]
    async fn test_retrieval_path_emits_tool_events() {
        let agents = agents(true);
        let tutor = Arc::clone(&agents[4]);
        let sink = Arc::new(InMemoryTraceSink::new());
        let services = Arc::new(builder(agents).trace_sink(sink.clone()).build().unwrap());
        let ctx = context(Arc::clone(&services), "chat-1");
        let engine = GraphEngine::new(tutor_graph().unwrap());

        let state = engine
            .run(TutorState::new(TutorRequest::new("How does photosynthesis work?")), &ctx)
            .await
            .unwrap();

        assert_eq!(state.answer.as_deref(), Some("Plants use light to make sugar."));
        assert_eq!(state.passages.len(), 1);
        assert_eq!(tutor.contexts()[0]["passages"][0]["id"], "photosynthesis");
        assert_eq!(sink.stages_for("chat-1"), vec![CLASSIFY, RAG_SEARCH, GENERATE]);

        let kinds = kinds(&events(&services, "chat-1").await);
        let started = kinds.iter().position(|k| *k == EventType::ToolStarted).unwrap();
        let completed = kinds.iter().position(|k| *k == EventType::ToolCompleted).unwrap();
        assert!(started < completed);
        assert_eq!(kinds.last(), Some(&EventType::RunCompleted));
    }

    #[tokio::test]
    async fn test_direct_answer_skips_retrieval() {
        let services = Arc::new(builder(agents(false)).build().unwrap());
        let ctx = context(Arc::clone(&services), "chat-2");
        let engine = GraphEngine::new(tutor_graph().unwrap());

        let history = vec![Message::user("hi"), Message::assistant("hello!")];
        let state = engine
            .run(TutorState::new(TutorRequest::new("thanks").with_history(history)), &ctx)
            .await
            .unwrap();

        assert!(state.passages.is_empty());
        let kinds = kinds(&events(&services, "chat-2").await);
        assert!(!kinds.contains(&EventType::ToolStarted));
        assert_eq!(state.outcome()["answer"], "Plants use light to make sugar.");
    }
}
