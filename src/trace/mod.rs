//! 阶段追踪：每个阶段结束后写一条 NodeTrace（输入/输出摘要、耗时、路由理由）
//!
//! 追踪写入失败只记日志，不影响运行。

use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

const SUMMARY_MAX_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceStatus {
    Ok,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeTrace {
    pub run_id: String,
    pub stage: String,
    pub status: TraceStatus,
    pub duration_ms: u64,
    pub input_summary: String,
    pub output_summary: String,
    /// 路由决策等理由信息
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rationale: Option<Value>,
}

#[derive(thiserror::Error, Debug)]
#[error("trace sink error: {0}")]
pub struct TraceError(pub String);

#[async_trait]
pub trait TraceSink: Send + Sync {
    async fn append_node_trace(&self, trace: NodeTrace) -> Result<(), TraceError>;
}

/// 截断为摘要（按字符）
pub fn summarize(text: &str) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(SUMMARY_MAX_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

/// 写入 tracing 日志的默认实现
#[derive(Debug, Default)]
pub struct LogTraceSink;

#[async_trait]
impl TraceSink for LogTraceSink {
    async fn append_node_trace(&self, trace: NodeTrace) -> Result<(), TraceError> {
        tracing::info!(
            run_id = %trace.run_id,
            stage = %trace.stage,
            status = ?trace.status,
            duration_ms = trace.duration_ms,
            input = %trace.input_summary,
            output = %trace.output_summary,
            "node trace"
        );
        Ok(())
    }
}

/// 内存实现，便于检查记录内容
#[derive(Debug, Default)]
pub struct InMemoryTraceSink {
    traces: Mutex<Vec<NodeTrace>>,
}

impl InMemoryTraceSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn traces(&self) -> Vec<NodeTrace> {
        self.traces.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn stages_for(&self, run_id: &str) -> Vec<String> {
        self.traces()
            .into_iter()
            .filter(|t| t.run_id == run_id)
            .map(|t| t.stage)
            .collect()
    }
}

#[async_trait]
impl TraceSink for InMemoryTraceSink {
    async fn append_node_trace(&self, trace: NodeTrace) -> Result<(), TraceError> {
        self.traces
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(trace);
        Ok(())
    }
}
