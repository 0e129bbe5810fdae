//! 阶段图：通用引擎与构建器，以及教案生成、辅导对话两条流程
//!
//! ## 模块
//! - `types`：WorkflowState / Stage / StageContext
//! - `builder`：GraphBuilder，声明阶段与边并校验
//! - `engine`：GraphEngine，逐阶段执行、发事件、写追踪
//! - `guard`：熔断 + 重试包装的 Agent 调用
//! - `plan` / `tutor`：两条具体流程

pub mod builder;
pub mod engine;
pub mod guard;
pub mod plan;
pub mod tutor;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use builder::{Edge, GraphBuilder, GraphError, StageGraph};
pub use engine::GraphEngine;
pub use guard::{call_agent, guarded_call};
pub use plan::{
    decide, plan_graph, PlanDelta, PlanRequest, PlanState, Scorecard, Validation, Verdict,
};
pub use tutor::{tutor_graph, TutorDelta, TutorRequest, TutorState};
pub use types::{
    build_receipt, tier_override, RouteSummary, Stage, StageContext, StageOutput, WorkflowState,
};
