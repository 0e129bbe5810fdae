//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `LESSONFLOW__*` 覆盖（双下划线表示嵌套，如
//! `LESSONFLOW__WORKFLOW__MAX_REFINEMENT_ITERS=3`）。`[tenants.<id>]` 段提供按租户覆盖的默认值。

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::llm::router::{RoutingMode, Tier};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub workflow: WorkflowSection,
    pub quality: QualitySection,
    pub router: RouterSection,
    pub llm: LlmSection,
    pub resilience: ResilienceSection,
    pub replay: ReplaySection,
    pub tenants: HashMap<String, TenantSection>,
}

/// [workflow] 段：精炼轮数、整体超时、心跳间隔
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkflowSection {
    pub max_refinement_iters: u32,
    pub max_workflow_duration_seconds: u64,
    pub heartbeat_interval_secs: u64,
    /// 图跳转上限，防止误配置的环无限执行；实际上限不低于精炼轮数所需的步数
    pub max_graph_steps: usize,
}

impl Default for WorkflowSection {
    fn default() -> Self {
        Self {
            max_refinement_iters: 2,
            max_workflow_duration_seconds: 300,
            heartbeat_interval_secs: 15,
            max_graph_steps: 32,
        }
    }
}

/// [quality] 段：决策阈值与混合质量门参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QualitySection {
    pub refine_threshold: f64,
    pub accept_threshold: f64,
    pub llm_band_low: f64,
    pub llm_band_high: f64,
    pub hysteresis_window: f64,
}

impl Default for QualitySection {
    fn default() -> Self {
        Self {
            refine_threshold: 60.0,
            accept_threshold: 80.0,
            llm_band_low: 60.0,
            llm_band_high: 85.0,
            hysteresis_window: 5.0,
        }
    }
}

/// [router] 段：路由模式、硬规则、复杂度关键词、指标容量
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouterSection {
    pub mode: RoutingMode,
    /// rules 模式下无规则命中时使用的档位
    pub default_tier: Tier,
    pub metrics_capacity: usize,
    pub rules: Vec<RuleEntry>,
    pub keywords: Vec<String>,
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            mode: RoutingMode::Weighted,
            default_tier: Tier::Middle,
            metrics_capacity: 100,
            rules: Vec::new(),
            keywords: default_keywords(),
        }
    }
}

/// 一条硬规则：正则 pattern 命中最近一条消息时直接选 tier
#[derive(Debug, Clone, Deserialize)]
pub struct RuleEntry {
    pub pattern: String,
    pub tier: Tier,
}

fn default_keywords() -> Vec<String> {
    [
        "analyze",
        "compare",
        "evaluate",
        "differentiate",
        "scaffold",
        "accessibility",
        "assessment",
        "rubric",
        "curriculum",
        "standards",
        "multi-step",
        "explain why",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// [llm] 段：三个档位各自的 Provider（可缺省）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LlmSection {
    pub cheap: Option<ProviderSection>,
    pub middle: Option<ProviderSection>,
    pub primary: Option<ProviderSection>,
}

/// 单个 Provider：后端类型、模型、可选 base_url 与 API Key 环境变量名
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSection {
    /// openai / deepseek / mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub api_key_env: Option<String>,
}

/// [resilience] 段：熔断、重试、幂等
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResilienceSection {
    pub failure_threshold: u32,
    pub cooldown_seconds: u64,
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub backoff_factor: f64,
    /// 单次退避等待的上限
    pub max_delay_ms: u64,
    pub idempotency_ttl_seconds: u64,
    pub idempotency_capacity: usize,
}

impl Default for ResilienceSection {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_seconds: 60,
            max_attempts: 3,
            initial_delay_ms: 1000,
            backoff_factor: 2.0,
            max_delay_ms: 30_000,
            idempotency_ttl_seconds: 300,
            idempotency_capacity: 1000,
        }
    }
}

/// 回放存储后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReplayBackend {
    #[default]
    Memory,
    Sqlite,
}

/// [replay] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReplaySection {
    pub backend: ReplayBackend,
    pub sqlite_path: PathBuf,
    pub keep_last: usize,
    pub ttl_seconds: u64,
}

impl Default for ReplaySection {
    fn default() -> Self {
        Self {
            backend: ReplayBackend::Memory,
            sqlite_path: PathBuf::from("data/replay.db"),
            keep_last: 100,
            ttl_seconds: 1800,
        }
    }
}

/// [tenants.<id>] 段：只覆盖写出的字段
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TenantSection {
    pub max_refinement_iters: Option<u32>,
    pub max_workflow_duration_seconds: Option<u64>,
    pub planner_model: Option<String>,
    pub executor_model: Option<String>,
}

/// 单次运行实际生效的工作流参数（全局默认 + 租户覆盖）
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowSettings {
    pub max_refinement_iters: u32,
    pub max_duration: Duration,
    pub max_graph_steps: usize,
    pub heartbeat_interval: Duration,
    pub planner_model: Option<String>,
    pub executor_model: Option<String>,
    pub quality: QualityThresholds,
}

/// 决策与质量门阈值
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityThresholds {
    pub refine_threshold: f64,
    pub accept_threshold: f64,
    pub llm_band_low: f64,
    pub llm_band_high: f64,
    pub hysteresis_window: f64,
}

impl From<&QualitySection> for QualityThresholds {
    fn from(q: &QualitySection) -> Self {
        Self {
            refine_threshold: q.refine_threshold,
            accept_threshold: q.accept_threshold,
            llm_band_low: q.llm_band_low,
            llm_band_high: q.llm_band_high,
            hysteresis_window: q.hysteresis_window,
        }
    }
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self::from(&QualitySection::default())
    }
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        AppConfig::default().settings_for(None)
    }
}

/// 教案流程每轮精炼经过 planner / validate / decision / refine 四步，收尾再走 planner / validate / decision / execute
pub fn steps_for_refinement(max_refinement_iters: u32) -> usize {
    (max_refinement_iters as usize)
        .saturating_mul(4)
        .saturating_add(8)
}

impl AppConfig {
    /// Settings 协作者：租户覆盖优先，缺省回落到 [workflow]
    pub fn settings_for(&self, tenant: Option<&str>) -> WorkflowSettings {
        let overrides = tenant.and_then(|t| self.tenants.get(t));
        let wf = &self.workflow;
        let max_refinement_iters = overrides
            .and_then(|o| o.max_refinement_iters)
            .unwrap_or(wf.max_refinement_iters);
        WorkflowSettings {
            max_refinement_iters,
            max_duration: Duration::from_secs(
                overrides
                    .and_then(|o| o.max_workflow_duration_seconds)
                    .unwrap_or(wf.max_workflow_duration_seconds),
            ),
            max_graph_steps: wf
                .max_graph_steps
                .max(steps_for_refinement(max_refinement_iters)),
            heartbeat_interval: Duration::from_secs(wf.heartbeat_interval_secs.max(1)),
            planner_model: overrides.and_then(|o| o.planner_model.clone()),
            executor_model: overrides.and_then(|o| o.executor_model.clone()),
            quality: QualityThresholds::from(&self.quality),
        }
    }
}

/// 从 config 目录加载配置，环境变量 LESSONFLOW__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 LESSONFLOW__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("LESSONFLOW")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.workflow.max_refinement_iters, 2);
        assert_eq!(cfg.workflow.max_workflow_duration_seconds, 300);
        assert_eq!(cfg.resilience.failure_threshold, 5);
        assert_eq!(cfg.resilience.max_attempts, 3);
        assert_eq!(cfg.replay.keep_last, 100);
        assert_eq!(cfg.replay.ttl_seconds, 1800);
        assert_eq!(cfg.router.metrics_capacity, 100);
        assert_eq!(cfg.quality.hysteresis_window, 5.0);
    }

    #[test]
    fn test_tenant_overrides() {
        let mut cfg = AppConfig::default();
        cfg.tenants.insert(
            "school-a".to_string(),
            TenantSection {
                max_refinement_iters: Some(4),
                planner_model: Some("gpt-4o".to_string()),
                ..TenantSection::default()
            },
        );

        let a = cfg.settings_for(Some("school-a"));
        assert_eq!(a.max_refinement_iters, 4);
        assert_eq!(a.max_duration, Duration::from_secs(300));
        assert_eq!(a.planner_model.as_deref(), Some("gpt-4o"));

        let other = cfg.settings_for(Some("unknown"));
        assert_eq!(other.max_refinement_iters, 2);
        assert!(other.planner_model.is_none());
    }

    #[test]
    fn test_step_cap_follows_refinement_iters() {
        let mut cfg = AppConfig::default();
        cfg.tenants.insert(
            "school-b".to_string(),
            TenantSection {
                max_refinement_iters: Some(8),
                ..TenantSection::default()
            },
        );
        assert_eq!(cfg.settings_for(None).max_graph_steps, 32);
        assert_eq!(cfg.settings_for(Some("school-b")).max_graph_steps, 40);

        cfg.workflow.max_graph_steps = 100;
        assert_eq!(cfg.settings_for(Some("school-b")).max_graph_steps, 100);
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[workflow]
max_refinement_iters = 3

[router]
mode = "rules"
default_tier = "cheap"

[[router.rules]]
pattern = "(?i)translate"
tier = "cheap"

[llm.primary]
provider = "mock"
model = "mock-large"

[replay]
backend = "sqlite"
keep_last = 50
"#
        )
        .unwrap();

        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.workflow.max_refinement_iters, 3);
        assert_eq!(cfg.workflow.max_workflow_duration_seconds, 300);
        assert_eq!(cfg.router.mode, RoutingMode::Rules);
        assert_eq!(cfg.router.default_tier, Tier::Cheap);
        assert_eq!(cfg.router.rules.len(), 1);
        assert_eq!(cfg.llm.primary.as_ref().unwrap().model, "mock-large");
        assert!(cfg.llm.cheap.is_none());
        assert_eq!(cfg.replay.backend, ReplayBackend::Sqlite);
        assert_eq!(cfg.replay.keep_last, 50);
    }
}
