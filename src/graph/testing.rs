//! 测试用的脚本化协作者

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::agents::{
    Agent, AgentError, AgentOutput, KeywordRetriever, QualityReport, QualityScorer,
};
use crate::config::AppConfig;
use crate::core::{Services, ServicesBuilder};
use crate::events::{EventType, InMemoryReplayStore, ReplayEntry};
use crate::graph::StageContext;
use crate::resilience::RetryPolicy;
use crate::trace::InMemoryTraceSink;

/// 按顺序返回预设结果；脚本用完后重复最后一个成功值
pub struct ScriptedAgent {
    name: String,
    script: Mutex<VecDeque<Result<Value, AgentError>>>,
    last: Mutex<Option<Value>>,
    contexts: Mutex<Vec<Value>>,
    delay: Duration,
}

impl ScriptedAgent {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            script: Mutex::new(VecDeque::new()),
            last: Mutex::new(None),
            contexts: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
        }
    }

    /// 每次调用先等待 delay（配合暂停时钟模拟慢调用）
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn reply(self, value: Value) -> Self {
        self.script.lock().unwrap().push_back(Ok(value));
        self
    }

    pub fn fail(self, err: AgentError) -> Self {
        self.script.lock().unwrap().push_back(Err(err));
        self
    }

    pub fn calls(&self) -> usize {
        self.contexts.lock().unwrap().len()
    }

    pub fn contexts(&self) -> Vec<Value> {
        self.contexts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(
        &self,
        _prompt: &str,
        context: &Value,
        _provider_override: Option<crate::llm::Tier>,
    ) -> Result<AgentOutput, AgentError> {
        self.contexts.lock().unwrap().push(context.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Ok(value)) => {
                *self.last.lock().unwrap() = Some(value.clone());
                Ok(AgentOutput::new(value))
            }
            Some(Err(err)) => Err(err),
            None => match self.last.lock().unwrap().clone() {
                Some(value) => Ok(AgentOutput::new(value)),
                None => Err(AgentError::InvalidOutput(format!("{} script exhausted", self.name))),
            },
        }
    }
}

/// 按顺序返回预设分数；用完后重复最后一个
pub struct ScriptedScorer {
    scores: Mutex<VecDeque<f64>>,
    last: Mutex<f64>,
}

impl ScriptedScorer {
    pub fn new(scores: &[f64]) -> Self {
        Self {
            scores: Mutex::new(scores.iter().copied().collect()),
            last: Mutex::new(0.0),
        }
    }
}

impl QualityScorer for ScriptedScorer {
    fn score(&self, _draft: &Value, _profile: &Value) -> QualityReport {
        let mut last = self.last.lock().unwrap();
        if let Some(next) = self.scores.lock().unwrap().pop_front() {
            *last = next;
        }
        QualityReport {
            score: *last,
            checklist: Vec::new(),
            warnings: vec!["scripted warning".into()],
            errors: Vec::new(),
        }
    }
}

pub fn draft(title: &str) -> Value {
    serde_json::json!({
        "title": title,
        "objectives": ["a", "b"],
        "activities": [],
        "assessment": "quiz",
        "materials": []
    })
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(2, Duration::from_millis(1), 1.0)
}

/// 全部协作者由调用方注入的构建器
pub fn builder(agents: [Arc<ScriptedAgent>; 5]) -> ServicesBuilder {
    let [planner, quality, executor, classifier, tutor] = agents;
    Services::builder(AppConfig::default())
        .planner(planner)
        .quality_agent(quality)
        .executor(executor)
        .classifier(classifier)
        .tutor(tutor)
        .retriever(Arc::new(
            KeywordRetriever::new()
                .with_doc("photosynthesis", "Photosynthesis turns light energy into chemical energy in plants."),
        ))
        .trace_sink(Arc::new(InMemoryTraceSink::new()))
        .replay_store(Arc::new(InMemoryReplayStore::default()))
        .retry_policy(fast_retry())
}

pub fn context(services: Arc<Services>, run_id: &str) -> StageContext {
    let emitter = services.bus.emitter(run_id);
    let settings = services.config.settings_for(None);
    StageContext::new(run_id, emitter, settings, services)
}

pub async fn events(services: &Services, run_id: &str) -> Vec<ReplayEntry> {
    services.bus.store().replay(run_id, None).await.unwrap()
}

pub fn kinds(entries: &[ReplayEntry]) -> Vec<EventType> {
    entries.iter().map(|e| e.kind).collect()
}
