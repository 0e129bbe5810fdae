//! 运行生命周期事件：固定事件类型枚举与 SSE 线上结构

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 事件类型（穷举，线上字符串固定）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "run.started")]
    RunStarted,
    #[serde(rename = "run.completed")]
    RunCompleted,
    #[serde(rename = "run.failed")]
    RunFailed,
    #[serde(rename = "stage.started")]
    StageStarted,
    #[serde(rename = "stage.progress")]
    StageProgress,
    #[serde(rename = "stage.completed")]
    StageCompleted,
    #[serde(rename = "stage.failed")]
    StageFailed,
    #[serde(rename = "quality.scored")]
    QualityScored,
    #[serde(rename = "quality.decision")]
    QualityDecision,
    #[serde(rename = "refinement.started")]
    RefinementStarted,
    #[serde(rename = "refinement.completed")]
    RefinementCompleted,
    #[serde(rename = "tool.started")]
    ToolStarted,
    #[serde(rename = "tool.completed")]
    ToolCompleted,
    /// 运行结束前一次性发出的可信度摘要
    #[serde(rename = "ai.receipt")]
    AiReceipt,
    #[serde(rename = "heartbeat")]
    Heartbeat,
}

impl EventType {
    pub const ALL: [EventType; 15] = [
        EventType::RunStarted,
        EventType::RunCompleted,
        EventType::RunFailed,
        EventType::StageStarted,
        EventType::StageProgress,
        EventType::StageCompleted,
        EventType::StageFailed,
        EventType::QualityScored,
        EventType::QualityDecision,
        EventType::RefinementStarted,
        EventType::RefinementCompleted,
        EventType::ToolStarted,
        EventType::ToolCompleted,
        EventType::AiReceipt,
        EventType::Heartbeat,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::RunStarted => "run.started",
            EventType::RunCompleted => "run.completed",
            EventType::RunFailed => "run.failed",
            EventType::StageStarted => "stage.started",
            EventType::StageProgress => "stage.progress",
            EventType::StageCompleted => "stage.completed",
            EventType::StageFailed => "stage.failed",
            EventType::QualityScored => "quality.scored",
            EventType::QualityDecision => "quality.decision",
            EventType::RefinementStarted => "refinement.started",
            EventType::RefinementCompleted => "refinement.completed",
            EventType::ToolStarted => "tool.started",
            EventType::ToolCompleted => "tool.completed",
            EventType::AiReceipt => "ai.receipt",
            EventType::Heartbeat => "heartbeat",
        }
    }

    pub fn parse(s: &str) -> Option<EventType> {
        Self::ALL.iter().copied().find(|t| t.as_str() == s)
    }

    /// run.completed / run.failed
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventType::RunCompleted | EventType::RunFailed)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单条 SSE 事件，发出后不可变
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SseEvent {
    pub run_id: String,
    pub seq: u64,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub stage: Option<String>,
    pub payload: Value,
    /// Unix 毫秒
    pub ts: i64,
}

/// 回放日志条目：序列化一次，实时流与回放共用同一份字节
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayEntry {
    pub seq: u64,
    pub kind: EventType,
    pub payload: String,
}

impl ReplayEntry {
    pub fn from_event(event: &SseEvent) -> Result<Self, serde_json::Error> {
        Ok(Self {
            seq: event.seq,
            kind: event.event_type,
            payload: serde_json::to_string(event)?,
        })
    }

    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_names() {
        for t in EventType::ALL {
            let s = serde_json::to_string(&t).unwrap();
            assert_eq!(s, format!("\"{}\"", t.as_str()));
            assert_eq!(EventType::parse(t.as_str()), Some(t));
        }
        assert_eq!(EventType::parse("run.cancelled"), None);
    }

    #[test]
    fn test_event_shape() {
        let ev = SseEvent {
            run_id: "r1".into(),
            seq: 3,
            event_type: EventType::StageStarted,
            stage: Some("planner".into()),
            payload: json!({"attempt": 1}),
            ts: 1_700_000_000_000,
        };
        let v: Value = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "stage.started");
        assert_eq!(v["seq"], 3);
        assert_eq!(v["stage"], "planner");
        let keys: Vec<&String> = v.as_object().unwrap().keys().collect();
        assert_eq!(keys.len(), 6);

        let entry = ReplayEntry::from_event(&ev).unwrap();
        let back: SseEvent = serde_json::from_str(&entry.payload).unwrap();
        assert_eq!(back, ev);
    }

    #[test]
    fn test_terminal_kinds() {
        let terminal: Vec<_> = EventType::ALL.iter().filter(|t| t.is_terminal()).collect();
        assert_eq!(terminal, vec![&EventType::RunCompleted, &EventType::RunFailed]);
    }
}
