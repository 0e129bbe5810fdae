//! LessonFlow - 教案生成与辅导对话的运行编排核心
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量），租户设置
//! - **core**: 错误分类、依赖容器（Services）、运行编排器（Orchestrator）
//! - **graph**: 阶段图引擎与构建器，教案生成 / 辅导对话两条流程
//! - **llm**: Provider 抽象与实现（OpenAI 兼容 / DeepSeek / Mock）、多档位模型路由
//! - **resilience**: 熔断器、指数退避重试、幂等守卫
//! - **events**: SSE 事件、发射器、回放存储（内存 / SQLite）与可续传流
//! - **agents**: 外部协作者（Agent、质量评分器、检索器）
//! - **trace**: 阶段追踪记录
//! - **observability**: 日志初始化

pub mod agents;
pub mod config;
pub mod core;
pub mod events;
pub mod graph;
pub mod llm;
pub mod observability;
pub mod resilience;
pub mod trace;

pub use crate::core::{Orchestrator, OrchestratorError, RunStart, Services};
