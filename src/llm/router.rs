//! 多模型档位路由器
//!
//! 根据请求复杂度自动选择档位：
//! - 五个维度打分（token 量、结构化输出、工具、历史长度、意图关键词），加权求和得到综合分
//! - 综合分 ≤ 0.40 走 cheap，≤ 0.70 走 middle，其余走 primary
//! - 硬规则先于打分匹配最近一条消息，命中即跳过打分
//! - 档位未配置 Provider 时按 primary → middle → cheap 降级
//!
//! 每次 generate / stream 追加一条 RouteMetrics 到定长环形缓冲区，供运行时查看。

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{LlmClient, LlmError, LlmRequest, ModelCapabilities, ResponseFormat, Role, TokenStream};

/// 综合分权重：token / structured / tool / history / intent
pub const WEIGHT_TOKEN: f64 = 0.25;
pub const WEIGHT_STRUCTURED: f64 = 0.25;
pub const WEIGHT_TOOL: f64 = 0.25;
pub const WEIGHT_HISTORY: f64 = 0.15;
pub const WEIGHT_INTENT: f64 = 0.10;

/// cheap 档上限（含）
pub const CHEAP_MAX: f64 = 0.40;
/// middle 档上限（含）
pub const MIDDLE_MAX: f64 = 0.70;

pub const REASON_RULE_OVERRIDE: &str = "rule_override";
pub const REASON_RULES_DEFAULT: &str = "rules_default";
pub const REASON_CALLER_OVERRIDE: &str = "caller_override";

/// 成本/能力档位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Cheap,
    Middle,
    Primary,
}

impl Tier {
    /// 降级顺序
    pub const FALLBACK_ORDER: [Tier; 3] = [Tier::Primary, Tier::Middle, Tier::Cheap];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Cheap => "cheap",
            Tier::Middle => "middle",
            Tier::Primary => "primary",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 路由模式：rules 仅按硬规则 + 默认档位；weighted 规则未命中时加权打分
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RoutingMode {
    Rules,
    #[default]
    Weighted,
}

/// 五个复杂度维度，均归一化到 [0,1]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct RouteFeatures {
    pub token_score: f64,
    pub structured_score: f64,
    pub tool_score: f64,
    pub history_score: f64,
    pub intent_score: f64,
}

impl RouteFeatures {
    /// 所有维度同一取值（测试与基准用）
    pub fn uniform(value: f64) -> Self {
        Self {
            token_score: value,
            structured_score: value,
            tool_score: value,
            history_score: value,
            intent_score: value,
        }
    }
}

/// 各维度加权贡献
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub token: f64,
    pub structured: f64,
    pub tool: f64,
    pub history: f64,
    pub intent: f64,
}

impl ScoreBreakdown {
    pub fn total(&self) -> f64 {
        self.token + self.structured + self.tool + self.history + self.intent
    }
}

/// 路由决策：每次请求新建，不可变
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDecision {
    pub tier: Tier,
    pub score: f64,
    pub reason: String,
    /// 硬规则命中时为 None
    pub score_breakdown: Option<ScoreBreakdown>,
}

/// 纯函数：特征 → 决策
pub fn compute_route(features: &RouteFeatures) -> RouteDecision {
    let breakdown = ScoreBreakdown {
        token: WEIGHT_TOKEN * features.token_score,
        structured: WEIGHT_STRUCTURED * features.structured_score,
        tool: WEIGHT_TOOL * features.tool_score,
        history: WEIGHT_HISTORY * features.history_score,
        intent: WEIGHT_INTENT * features.intent_score,
    };
    let score = breakdown.total().clamp(0.0, 1.0);
    let tier = tier_for_score(score);
    RouteDecision {
        tier,
        score,
        reason: format!("weighted score {:.2} -> {}", score, tier),
        score_breakdown: Some(breakdown),
    }
}

pub fn tier_for_score(score: f64) -> Tier {
    if score <= CHEAP_MAX {
        Tier::Cheap
    } else if score <= MIDDLE_MAX {
        Tier::Middle
    } else {
        Tier::Primary
    }
}

/// 消息字符数 → token 分（阶梯函数）
pub fn token_score(chars: usize) -> f64 {
    match chars {
        0..=2499 => 0.1,
        2500..=4999 => 0.4,
        5000..=9999 => 0.7,
        _ => 1.0,
    }
}

pub fn structured_score(format: &ResponseFormat) -> f64 {
    match format {
        ResponseFormat::Text => 0.0,
        ResponseFormat::JsonObject => 0.6,
        ResponseFormat::JsonSchema { .. } => 1.0,
    }
}

pub fn tool_score(tool_count: usize) -> f64 {
    match tool_count {
        0 => 0.0,
        1..=5 => 0.6,
        _ => 1.0,
    }
}

/// 之前的对话轮数 → 历史分
pub fn history_score(prior_turns: usize) -> f64 {
    match prior_turns {
        0..=4 => 0.0,
        5..=14 => 0.3,
        15..=24 => 0.6,
        _ => 1.0,
    }
}

pub fn intent_score(matches: usize) -> f64 {
    match matches {
        0 => 0.0,
        1 => 0.3,
        2 => 0.6,
        _ => 1.0,
    }
}

/// 特征提取器：持有复杂度关键词
#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    keywords: Vec<String>,
}

impl FeatureExtractor {
    pub fn new(keywords: Vec<String>) -> Self {
        Self {
            keywords: keywords.into_iter().map(|k| k.to_lowercase()).collect(),
        }
    }

    pub fn extract(&self, request: &LlmRequest) -> RouteFeatures {
        let latest = request.latest_user_message().to_lowercase();
        let matches = self
            .keywords
            .iter()
            .filter(|k| latest.contains(k.as_str()))
            .count();
        // 除最新一条外的 user/assistant/tool 消息
        let prior_turns = request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .count()
            .saturating_sub(1);

        RouteFeatures {
            token_score: token_score(request.total_chars()),
            structured_score: structured_score(&request.response_format),
            tool_score: tool_score(request.tools.len()),
            history_score: history_score(prior_turns),
            intent_score: intent_score(matches),
        }
    }
}

/// 硬规则：正则匹配最近一条 User 消息
#[derive(Debug, Clone)]
pub struct HardRule {
    pattern: Regex,
    tier: Tier,
}

impl HardRule {
    pub fn new(pattern: &str, tier: Tier) -> Result<Self, RouterError> {
        let pattern = Regex::new(pattern).map_err(|e| RouterError::InvalidRule {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self { pattern, tier })
    }

    pub fn matches(&self, text: &str) -> bool {
        self.pattern.is_match(text)
    }
}

/// 单次路由调用的遥测记录
#[derive(Debug, Clone, Serialize)]
pub struct RouteMetrics {
    pub tier: Tier,
    pub provider: String,
    pub latency_ms: u64,
    pub token_estimate: u64,
    pub is_fallback: bool,
    pub features: RouteFeatures,
    pub decision: RouteDecision,
    pub timestamp_ms: i64,
}

/// 路由结果与本次遥测
#[derive(Debug, Clone)]
pub struct RoutedCompletion {
    pub content: String,
    pub metrics: RouteMetrics,
}

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("No provider configured for any tier")]
    NoProviders,
    #[error("Invalid routing rule '{pattern}': {reason}")]
    InvalidRule { pattern: String, reason: String },
}

/// 路由器构建器
pub struct ModelRouterBuilder {
    providers: HashMap<Tier, Arc<dyn LlmClient>>,
    rules: Vec<HardRule>,
    mode: RoutingMode,
    default_tier: Tier,
    keywords: Vec<String>,
    metrics_capacity: usize,
}

impl ModelRouterBuilder {
    pub fn provider(mut self, tier: Tier, client: Arc<dyn LlmClient>) -> Self {
        self.providers.insert(tier, client);
        self
    }

    pub fn rule(mut self, rule: HardRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn mode(mut self, mode: RoutingMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn default_tier(mut self, tier: Tier) -> Self {
        self.default_tier = tier;
        self
    }

    pub fn keywords(mut self, keywords: Vec<String>) -> Self {
        self.keywords = keywords;
        self
    }

    pub fn metrics_capacity(mut self, capacity: usize) -> Self {
        self.metrics_capacity = capacity;
        self
    }

    pub fn build(self) -> Result<ModelRouter, RouterError> {
        if self.providers.is_empty() {
            return Err(RouterError::NoProviders);
        }
        let capacity = self.metrics_capacity.max(1);
        Ok(ModelRouter {
            providers: self.providers,
            rules: self.rules,
            mode: self.mode,
            default_tier: self.default_tier,
            extractor: FeatureExtractor::new(self.keywords),
            metrics: Mutex::new(VecDeque::with_capacity(capacity)),
            metrics_capacity: capacity,
        })
    }
}

/// 多档位路由器
pub struct ModelRouter {
    providers: HashMap<Tier, Arc<dyn LlmClient>>,
    rules: Vec<HardRule>,
    mode: RoutingMode,
    default_tier: Tier,
    extractor: FeatureExtractor,
    metrics: Mutex<VecDeque<RouteMetrics>>,
    metrics_capacity: usize,
}

impl ModelRouter {
    pub fn builder() -> ModelRouterBuilder {
        ModelRouterBuilder {
            providers: HashMap::new(),
            rules: Vec::new(),
            mode: RoutingMode::Weighted,
            default_tier: Tier::Middle,
            keywords: Vec::new(),
            metrics_capacity: 100,
        }
    }

    /// 计算特征与决策（不调用 Provider）
    pub fn route(&self, request: &LlmRequest) -> (RouteFeatures, RouteDecision) {
        let features = self.extractor.extract(request);
        let latest = request.latest_user_message();

        if let Some(rule) = self.rules.iter().find(|r| r.matches(latest)) {
            let decision = RouteDecision {
                tier: rule.tier,
                score: 0.0,
                reason: REASON_RULE_OVERRIDE.to_string(),
                score_breakdown: None,
            };
            return (features, decision);
        }

        let decision = match self.mode {
            RoutingMode::Weighted => compute_route(&features),
            RoutingMode::Rules => RouteDecision {
                tier: self.default_tier,
                score: 0.0,
                reason: REASON_RULES_DEFAULT.to_string(),
                score_breakdown: None,
            },
        };
        (features, decision)
    }

    /// 解析档位到 Provider；缺失时按 primary → middle → cheap 降级，返回 (client, 实际档位, 是否降级)
    pub fn resolve(&self, tier: Tier) -> Result<(Arc<dyn LlmClient>, Tier, bool), LlmError> {
        if let Some(client) = self.providers.get(&tier) {
            return Ok((Arc::clone(client), tier, false));
        }
        Tier::FALLBACK_ORDER
            .iter()
            .find_map(|t| self.providers.get(t).map(|c| (Arc::clone(c), *t, true)))
            .ok_or_else(|| LlmError::NotConfigured(tier.to_string()))
    }

    /// 路由并调用；override_tier 跳过硬规则与打分
    pub async fn generate_routed(
        &self,
        request: &LlmRequest,
        override_tier: Option<Tier>,
    ) -> Result<RoutedCompletion, LlmError> {
        let (features, decision) = self.decide(request, override_tier);
        let (client, actual, is_fallback) = self.resolve(decision.tier)?;
        if is_fallback {
            tracing::warn!(wanted = %decision.tier, used = %actual, "tier has no provider, falling back");
        }
        tracing::debug!(tier = %decision.tier, score = decision.score, reason = %decision.reason, "route decided");

        let start = Instant::now();
        let result = client.generate(request).await;
        let metrics = self.record(
            &client,
            actual,
            is_fallback,
            start,
            request,
            features,
            decision,
        );
        result.map(|content| RoutedCompletion { content, metrics })
    }

    fn decide(
        &self,
        request: &LlmRequest,
        override_tier: Option<Tier>,
    ) -> (RouteFeatures, RouteDecision) {
        match override_tier {
            Some(tier) => (
                self.extractor.extract(request),
                RouteDecision {
                    tier,
                    score: 0.0,
                    reason: REASON_CALLER_OVERRIDE.to_string(),
                    score_breakdown: None,
                },
            ),
            None => self.route(request),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        client: &Arc<dyn LlmClient>,
        tier: Tier,
        is_fallback: bool,
        start: Instant,
        request: &LlmRequest,
        features: RouteFeatures,
        decision: RouteDecision,
    ) -> RouteMetrics {
        let metrics = RouteMetrics {
            tier,
            provider: client.capabilities().name,
            latency_ms: start.elapsed().as_millis() as u64,
            token_estimate: request.estimated_tokens(),
            is_fallback,
            features,
            decision,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        };
        let mut buf = self.metrics.lock().unwrap_or_else(|e| e.into_inner());
        if buf.len() == self.metrics_capacity {
            buf.pop_front();
        }
        buf.push_back(metrics.clone());
        metrics
    }

    /// 最近 n 条（不足则全部），按时间先后排列
    pub fn get_recent_metrics(&self, n: usize) -> Vec<RouteMetrics> {
        let buf = self.metrics.lock().unwrap_or_else(|e| e.into_inner());
        let skip = buf.len().saturating_sub(n);
        buf.iter().skip(skip).cloned().collect()
    }

    /// 已配置 Provider 的档位数
    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }
}

#[async_trait]
impl LlmClient for ModelRouter {
    fn capabilities(&self) -> ModelCapabilities {
        let (client, _, _) = match self.resolve(Tier::Primary) {
            Ok(found) => found,
            Err(_) => return ModelCapabilities::new("router", "none"),
        };
        let inner = client.capabilities();
        ModelCapabilities::new("router", inner.model)
            .with_json_schema(inner.supports_json_schema)
            .with_tools(inner.supports_tools)
            .with_streaming(inner.supports_streaming)
    }

    async fn generate(&self, request: &LlmRequest) -> Result<String, LlmError> {
        self.generate_routed(request, None).await.map(|r| r.content)
    }

    async fn stream(&self, request: &LlmRequest) -> Result<TokenStream, LlmError> {
        let (features, decision) = self.route(request);
        let (client, actual, is_fallback) = self.resolve(decision.tier)?;
        let start = Instant::now();
        let result = client.stream(request).await;
        self.record(&client, actual, is_fallback, start, request, features, decision);
        result
    }
}
