//! 核心编排层：错误分类、依赖容器、运行编排器

pub mod error;
pub mod orchestrator;
pub mod services;

pub use error::{ErrorKind, OrchestratorError, StageError, StageFailure};
pub use orchestrator::{Orchestrator, RunStart};
pub use services::{AgentSet, Breakers, Services, ServicesBuilder};
