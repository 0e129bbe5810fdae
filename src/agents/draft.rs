//! 教案草稿结构与 JSON Schema（schemars 生成，用于结构化输出请求）

use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};

/// 教学活动
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Activity {
    pub name: String,
    /// 分钟
    #[serde(default)]
    pub duration_minutes: u32,
    #[serde(default)]
    pub description: String,
}

/// Planner 输出的教案草稿
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LessonPlanDraft {
    pub title: String,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub grade_level: Option<String>,
    /// 学习目标
    #[serde(default)]
    pub objectives: Vec<String>,
    #[serde(default)]
    pub activities: Vec<Activity>,
    /// 评估方式
    #[serde(default)]
    pub assessment: String,
    #[serde(default)]
    pub materials: Vec<String>,
}

impl LessonPlanDraft {
    pub fn total_minutes(&self) -> u32 {
        self.activities.iter().map(|a| a.duration_minutes).sum()
    }
}

/// 草稿的 JSON Schema
pub fn draft_schema() -> serde_json::Value {
    let schema = schema_for!(LessonPlanDraft);
    serde_json::to_value(&schema).unwrap_or(serde_json::Value::Null)
}
