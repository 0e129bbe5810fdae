//! Provider 工厂：按 [llm.<tier>] 配置创建客户端，并组装 ModelRouter
//!
//! - openai：OpenAI 兼容端点（base_url 可选）
//! - deepseek：固定 https://api.deepseek.com，Key 优先 DEEPSEEK_API_KEY
//! - mock：本地脚本客户端，无需网络

use std::sync::Arc;

use crate::config::{ProviderSection, RouterSection};
use crate::llm::router::{HardRule, ModelRouter, RouterError, Tier};
use crate::llm::{LlmClient, LlmError, MockLlmClient, OpenAiClient};

pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub const DEEPSEEK_CHAT: &str = "deepseek-chat";

/// 按配置创建单个 Provider
pub fn create_provider(section: &ProviderSection) -> Result<Arc<dyn LlmClient>, LlmError> {
    let api_key = section
        .api_key_env
        .as_deref()
        .and_then(|var| std::env::var(var).ok());

    match section.provider.to_lowercase().as_str() {
        "openai" => Ok(Arc::new(OpenAiClient::new(
            "openai",
            section.base_url.as_deref(),
            &section.model,
            api_key.as_deref(),
        ))),
        "deepseek" => {
            let key = api_key
                .or_else(|| std::env::var("DEEPSEEK_API_KEY").ok())
                .or_else(|| std::env::var("OPENAI_API_KEY").ok());
            let model = if section.model.is_empty() {
                DEEPSEEK_CHAT
            } else {
                section.model.as_str()
            };
            Ok(Arc::new(OpenAiClient::new(
                "deepseek",
                Some(section.base_url.as_deref().unwrap_or(DEEPSEEK_BASE_URL)),
                model,
                key.as_deref(),
            )))
        }
        "mock" => Ok(Arc::new(MockLlmClient::new(format!("mock:{}", section.model)))),
        other => Err(LlmError::NotConfigured(format!("unknown provider '{other}'"))),
    }
}

/// 由 [router] 与 [llm] 段组装路由器；至少需要一个档位配置了 Provider
pub fn build_router(
    router: &RouterSection,
    tiers: &[(Tier, Option<&ProviderSection>)],
) -> Result<ModelRouter, FactoryError> {
    let mut builder = ModelRouter::builder()
        .mode(router.mode)
        .default_tier(router.default_tier)
        .keywords(router.keywords.clone())
        .metrics_capacity(router.metrics_capacity);

    for (tier, section) in tiers {
        if let Some(section) = section {
            let client = create_provider(section)?;
            tracing::info!(tier = %tier, provider = %section.provider, model = %section.model, "provider configured");
            builder = builder.provider(*tier, client);
        }
    }

    for rule in &router.rules {
        builder = builder.rule(HardRule::new(&rule.pattern, rule.tier)?);
    }

    Ok(builder.build()?)
}

#[derive(thiserror::Error, Debug)]
pub enum FactoryError {
    #[error(transparent)]
    Provider(#[from] LlmError),
    #[error(transparent)]
    Router(#[from] RouterError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuleEntry;

    fn section(provider: &str, model: &str) -> ProviderSection {
        ProviderSection {
            provider: provider.to_string(),
            model: model.to_string(),
            base_url: None,
            api_key_env: None,
        }
    }

    #[test]
    fn test_create_mock_provider() {
        let p = create_provider(&section("mock", "small")).unwrap();
        assert_eq!(p.capabilities().name, "mock:small");
    }

    #[test]
    fn test_create_openai_compatible_providers() {
        let p = create_provider(&section("openai", "gpt-4o-mini")).unwrap();
        assert_eq!(p.capabilities().name, "openai");
        let p = create_provider(&section("DeepSeek", "")).unwrap();
        assert_eq!(p.capabilities().name, "deepseek");
        assert_eq!(p.capabilities().model, DEEPSEEK_CHAT);
    }

    #[test]
    fn test_unknown_provider() {
        assert!(create_provider(&section("carrier-pigeon", "x")).is_err());
    }

    #[test]
    fn test_build_router_requires_a_provider() {
        let router = RouterSection::default();
        let err = build_router(&router, &[(Tier::Cheap, None)]);
        assert!(matches!(err, Err(FactoryError::Router(RouterError::NoProviders))));
    }

    #[test]
    fn test_build_router_with_rules() {
        let mut router = RouterSection::default();
        router.rules.push(RuleEntry {
            pattern: "(?i)quiz".to_string(),
            tier: Tier::Cheap,
        });
        let cheap = section("mock", "c");
        let built = build_router(&router, &[(Tier::Cheap, Some(&cheap)), (Tier::Primary, None)])
            .unwrap();
        assert_eq!(built.provider_count(), 1);
    }
}
