//! 依赖容器：进程启动时构建一次，以 Arc 句柄传入引擎；测试可构建独立实例
//!
//! ServicesBuilder 未显式注入的组件按配置补齐：路由器由 [llm.*] 组装（都未配置时回落到 Mock），
//! Agent 为基于路由器的 LlmAgent，回放存储按 [replay] 创建。

use std::sync::Arc;
use std::time::Duration;

use crate::agents::{
    Agent, ChecklistScorer, KeywordRetriever, LessonPlanDraft, LlmAgent, QualityScorer, Retriever,
};
use crate::config::{AppConfig, ProviderSection};
use crate::core::OrchestratorError;
use crate::events::{create_replay_store, EventBus, ReplayStore};
use crate::llm::{build_router, ModelRouter, Tier};
use crate::resilience::{CircuitBreaker, RetryPolicy};
use crate::trace::{LogTraceSink, TraceSink};

const PLANNER_PROMPT: &str = "You are an experienced teacher who writes structured lesson plans. \
Return a JSON object with title, subject, grade_level, objectives, activities (name, duration_minutes, description), assessment and materials.";
const QUALITY_PROMPT: &str = "You review lesson plans. Rate the plan from 0 to 100 for clarity, alignment of objectives and activities, and feasibility. \
Return JSON: {\"score\": <number>, \"rationale\": <string>}.";
const EXECUTOR_PROMPT: &str = "You finalize lesson plans. Turn the draft into a classroom-ready plan and return it as a JSON object with the same fields plus teacher_notes.";
const CLASSIFIER_PROMPT: &str = "Classify the student's message. \
Return JSON: {\"intent\": \"concept_question\" | \"practice\" | \"chitchat\", \"needs_retrieval\": <bool>}.";
const TUTOR_PROMPT: &str = "You are a patient tutor. Answer the student's question using the provided reference passages when they are relevant.";

/// 各阶段使用的 Agent
#[derive(Clone)]
pub struct AgentSet {
    pub planner: Arc<dyn Agent>,
    pub quality: Arc<dyn Agent>,
    pub executor: Arc<dyn Agent>,
    pub classifier: Arc<dyn Agent>,
    pub tutor: Arc<dyn Agent>,
}

/// 每个受保护调用点一个熔断器，在所有运行之间共享
pub struct Breakers {
    pub planner: Arc<CircuitBreaker>,
    pub quality: Arc<CircuitBreaker>,
    pub executor: Arc<CircuitBreaker>,
    pub classifier: Arc<CircuitBreaker>,
    pub tutor: Arc<CircuitBreaker>,
}

impl Breakers {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        let make = |name: &str| Arc::new(CircuitBreaker::new(name, failure_threshold, cooldown));
        Self {
            planner: make("planner"),
            quality: make("quality"),
            executor: make("executor"),
            classifier: make("classifier"),
            tutor: make("tutor"),
        }
    }
}

pub struct Services {
    pub config: AppConfig,
    /// 未注入路由器且全部 Agent 由外部提供时为 None
    pub router: Option<Arc<ModelRouter>>,
    pub agents: AgentSet,
    pub scorer: Arc<dyn QualityScorer>,
    pub retriever: Arc<dyn Retriever>,
    pub breakers: Breakers,
    pub retry_policy: RetryPolicy,
    pub trace: Arc<dyn TraceSink>,
    pub bus: Arc<EventBus>,
}

impl Services {
    pub fn builder(config: AppConfig) -> ServicesBuilder {
        ServicesBuilder::new(config)
    }
}

/// Services 构建器
pub struct ServicesBuilder {
    config: AppConfig,
    router: Option<Arc<ModelRouter>>,
    planner: Option<Arc<dyn Agent>>,
    quality: Option<Arc<dyn Agent>>,
    executor: Option<Arc<dyn Agent>>,
    classifier: Option<Arc<dyn Agent>>,
    tutor: Option<Arc<dyn Agent>>,
    scorer: Option<Arc<dyn QualityScorer>>,
    retriever: Option<Arc<dyn Retriever>>,
    trace: Option<Arc<dyn TraceSink>>,
    replay_store: Option<Arc<dyn ReplayStore>>,
    retry_policy: Option<RetryPolicy>,
}

impl ServicesBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            router: None,
            planner: None,
            quality: None,
            executor: None,
            classifier: None,
            tutor: None,
            scorer: None,
            retriever: None,
            trace: None,
            replay_store: None,
            retry_policy: None,
        }
    }

    pub fn router(mut self, router: Arc<ModelRouter>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn planner(mut self, agent: Arc<dyn Agent>) -> Self {
        self.planner = Some(agent);
        self
    }

    /// 质量门的 LLM 评分 Agent
    pub fn quality_agent(mut self, agent: Arc<dyn Agent>) -> Self {
        self.quality = Some(agent);
        self
    }

    pub fn executor(mut self, agent: Arc<dyn Agent>) -> Self {
        self.executor = Some(agent);
        self
    }

    pub fn classifier(mut self, agent: Arc<dyn Agent>) -> Self {
        self.classifier = Some(agent);
        self
    }

    pub fn tutor(mut self, agent: Arc<dyn Agent>) -> Self {
        self.tutor = Some(agent);
        self
    }

    pub fn scorer(mut self, scorer: Arc<dyn QualityScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    pub fn retriever(mut self, retriever: Arc<dyn Retriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    pub fn trace_sink(mut self, trace: Arc<dyn TraceSink>) -> Self {
        self.trace = Some(trace);
        self
    }

    pub fn replay_store(mut self, store: Arc<dyn ReplayStore>) -> Self {
        self.replay_store = Some(store);
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    fn all_agents_injected(&self) -> bool {
        self.planner.is_some()
            && self.quality.is_some()
            && self.executor.is_some()
            && self.classifier.is_some()
            && self.tutor.is_some()
    }

    /// 由配置组装路由器；没有任何 Provider 时回落到 Mock
    fn router_from_config(config: &AppConfig) -> Result<Arc<ModelRouter>, OrchestratorError> {
        let llm = &config.llm;
        let tiers = [
            (Tier::Cheap, llm.cheap.as_ref()),
            (Tier::Middle, llm.middle.as_ref()),
            (Tier::Primary, llm.primary.as_ref()),
        ];
        let mock = ProviderSection {
            provider: "mock".into(),
            model: "echo".into(),
            base_url: None,
            api_key_env: None,
        };
        let tiers = if tiers.iter().all(|(_, section)| section.is_none()) {
            tracing::warn!("No [llm.*] provider configured, using Mock LLM");
            [(Tier::Cheap, None), (Tier::Middle, Some(&mock)), (Tier::Primary, None)]
        } else {
            tiers
        };
        build_router(&config.router, &tiers)
            .map(Arc::new)
            .map_err(|e| OrchestratorError::Config(e.to_string()))
    }

    pub fn build(self) -> Result<Services, OrchestratorError> {
        let router = match self.router.clone() {
            Some(r) => Some(r),
            None if self.all_agents_injected() => None,
            None => Some(Self::router_from_config(&self.config)?),
        };

        let llm_agent = |name: &str, prompt: &str| -> Option<LlmAgent> {
            router
                .as_ref()
                .map(|r| LlmAgent::new(name, Arc::clone(r), prompt))
        };
        let missing = |name: &str| OrchestratorError::Config(format!("no agent for '{name}'"));

        let planner: Arc<dyn Agent> = match self.planner {
            Some(a) => a,
            None => Arc::new(
                llm_agent("planner", PLANNER_PROMPT)
                    .ok_or_else(|| missing("planner"))?
                    .json_schema::<LessonPlanDraft>("lesson_plan"),
            ),
        };
        let quality: Arc<dyn Agent> = match self.quality {
            Some(a) => a,
            None => Arc::new(
                llm_agent("quality", QUALITY_PROMPT)
                    .ok_or_else(|| missing("quality"))?
                    .json_object(),
            ),
        };
        let executor: Arc<dyn Agent> = match self.executor {
            Some(a) => a,
            None => Arc::new(
                llm_agent("executor", EXECUTOR_PROMPT)
                    .ok_or_else(|| missing("executor"))?
                    .json_object(),
            ),
        };
        let classifier: Arc<dyn Agent> = match self.classifier {
            Some(a) => a,
            None => Arc::new(
                llm_agent("classifier", CLASSIFIER_PROMPT)
                    .ok_or_else(|| missing("classifier"))?
                    .json_object(),
            ),
        };
        let tutor: Arc<dyn Agent> = match self.tutor {
            Some(a) => a,
            None => Arc::new(llm_agent("tutor", TUTOR_PROMPT).ok_or_else(|| missing("tutor"))?),
        };

        let store = match self.replay_store {
            Some(s) => s,
            None => create_replay_store(&self.config.replay)
                .map_err(|e| OrchestratorError::Config(e.to_string()))?,
        };

        let res = &self.config.resilience;
        let retry_policy = self.retry_policy.unwrap_or_else(|| {
            RetryPolicy::new(
                res.max_attempts,
                Duration::from_millis(res.initial_delay_ms),
                res.backoff_factor,
            )
            .with_max_delay(Duration::from_millis(res.max_delay_ms))
        });
        let breakers = Breakers::new(
            res.failure_threshold,
            Duration::from_secs(res.cooldown_seconds),
        );

        Ok(Services {
            router,
            agents: AgentSet {
                planner,
                quality,
                executor,
                classifier,
                tutor,
            },
            scorer: self.scorer.unwrap_or_else(|| Arc::new(ChecklistScorer)),
            retriever: self
                .retriever
                .unwrap_or_else(|| Arc::new(KeywordRetriever::new())),
            breakers,
            retry_policy,
            trace: self.trace.unwrap_or_else(|| Arc::new(LogTraceSink)),
            bus: Arc::new(EventBus::new(store)),
            config: self.config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{MockLlmClient, ResponseFormat};

    #[test]
    fn test_defaults_fall_back_to_mock_router() {
        let services = Services::builder(AppConfig::default()).build().unwrap();
        let router = services.router.as_ref().unwrap();
        assert_eq!(router.provider_count(), 1);
        assert_eq!(services.retry_policy.max_attempts, 3);
        assert!(services.breakers.planner.check());
    }

    #[test]
    fn test_configured_resilience() {
        let mut config = AppConfig::default();
        config.resilience.max_attempts = 5;
        config.resilience.initial_delay_ms = 10;
        let services = Services::builder(config).build().unwrap();
        assert_eq!(services.retry_policy.max_attempts, 5);
        assert_eq!(services.retry_policy.initial_delay, Duration::from_millis(10));
        assert_eq!(services.retry_policy.max_delay, Duration::from_secs(30));
    }

    #[test]
    fn test_planner_requests_schema() {
        let router = Arc::new(
            ModelRouter::builder()
                .provider(Tier::Cheap, Arc::new(MockLlmClient::default()))
                .build()
                .unwrap(),
        );
        let agent = LlmAgent::new("planner", router, PLANNER_PROMPT)
            .json_schema::<LessonPlanDraft>("lesson_plan");
        assert!(matches!(agent.response_format(), ResponseFormat::JsonSchema { .. }));
    }
}
