//! LLM 层：Provider 抽象与实现（OpenAI 兼容 / DeepSeek / Mock）以及多档位路由器

pub mod factory;
pub mod message;
pub mod mock;
pub mod openai;
pub mod router;
pub mod traits;

pub use factory::{build_router, create_provider, FactoryError};
pub use message::{LlmRequest, Message, ResponseFormat, Role, ToolSpec};
pub use mock::MockLlmClient;
pub use openai::OpenAiClient;
pub use router::{
    compute_route, HardRule, ModelRouter, RouteDecision, RouteFeatures, RouteMetrics,
    RoutedCompletion, RouterError, RoutingMode, ScoreBreakdown, Tier,
};
pub use traits::{LlmClient, LlmError, ModelCapabilities, TokenStream};
