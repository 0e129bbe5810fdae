//! 确定性质量评分：按检查项给草稿打 0–100 分，同时给出警告与错误列表

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::draft::LessonPlanDraft;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChecklistItem {
    pub name: String,
    pub passed: bool,
    pub points: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    /// 0..=100
    pub score: f64,
    pub checklist: Vec<ChecklistItem>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl QualityReport {
    /// 从检查项累计得分
    pub fn from_checklist(checklist: Vec<ChecklistItem>, warnings: Vec<String>, errors: Vec<String>) -> Self {
        let score = checklist
            .iter()
            .filter(|c| c.passed)
            .map(|c| c.points)
            .sum::<f64>()
            .clamp(0.0, 100.0);
        Self {
            score,
            checklist,
            warnings,
            errors,
        }
    }
}

pub trait QualityScorer: Send + Sync {
    /// profile：学段、科目、课时等期望（可为 Null）
    fn score(&self, draft: &Value, profile: &Value) -> QualityReport;
}

/// 默认评分器：结构完整性检查表
#[derive(Debug, Default, Clone)]
pub struct ChecklistScorer;

impl ChecklistScorer {
    fn item(name: &str, passed: bool, points: f64) -> ChecklistItem {
        ChecklistItem {
            name: name.to_string(),
            passed,
            points,
        }
    }
}

impl QualityScorer for ChecklistScorer {
    fn score(&self, draft: &Value, profile: &Value) -> QualityReport {
        let draft: LessonPlanDraft = match serde_json::from_value(draft.clone()) {
            Ok(d) => d,
            Err(e) => {
                return QualityReport {
                    score: 0.0,
                    checklist: Vec::new(),
                    warnings: Vec::new(),
                    errors: vec![format!("draft does not match lesson plan structure: {e}")],
                }
            }
        };

        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        let has_title = !draft.title.trim().is_empty();
        if !has_title {
            errors.push("missing title".to_string());
        }

        let objectives = draft.objectives.iter().filter(|o| !o.trim().is_empty()).count();
        if objectives == 0 {
            errors.push("no learning objectives".to_string());
        } else if objectives == 1 {
            warnings.push("only one learning objective".to_string());
        }

        let activities = draft.activities.len();
        let timed = draft.activities.iter().all(|a| a.duration_minutes > 0);
        if activities < 2 {
            errors.push("fewer than two activities".to_string());
        } else if !timed {
            warnings.push("some activities have no duration".to_string());
        }

        let expected_minutes = profile
            .get("duration_minutes")
            .and_then(Value::as_u64)
            .map(|m| m as u32);
        let fits_duration = match expected_minutes {
            Some(expected) => {
                let total = draft.total_minutes();
                let diff = total.abs_diff(expected);
                if diff > expected / 5 {
                    warnings.push(format!("activities total {total} min, expected about {expected} min"));
                    false
                } else {
                    true
                }
            }
            None => draft.total_minutes() > 0,
        };

        let has_assessment = !draft.assessment.trim().is_empty();
        if !has_assessment {
            errors.push("missing assessment".to_string());
        }
        if draft.materials.is_empty() {
            warnings.push("no materials listed".to_string());
        }

        let grade_ok = match profile.get("grade_level").and_then(Value::as_str) {
            Some(want) => draft.grade_level.as_deref() == Some(want),
            None => draft.grade_level.is_some(),
        };

        let checklist = vec![
            Self::item("title", has_title, 10.0),
            Self::item("objectives", objectives >= 2, 20.0),
            Self::item("activities", activities >= 2 && timed, 25.0),
            Self::item("duration_fit", fits_duration, 15.0),
            Self::item("assessment", has_assessment, 15.0),
            Self::item("materials", !draft.materials.is_empty(), 10.0),
            Self::item("grade_level", grade_ok, 5.0),
        ];
        QualityReport::from_checklist(checklist, warnings, errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn full_draft() -> Value {
        json!({
            "title": "Fractions on a number line",
            "grade_level": "grade 4",
            "objectives": ["place fractions on a line", "compare fractions"],
            "activities": [
                {"name": "warm-up", "duration_minutes": 10},
                {"name": "guided practice", "duration_minutes": 20},
                {"name": "exit ticket", "duration_minutes": 15}
            ],
            "assessment": "exit ticket with three items",
            "materials": ["number line strips"]
        })
    }

    #[test]
    fn test_complete_draft_scores_full() {
        let profile = json!({"duration_minutes": 45, "grade_level": "grade 4"});
        let report = ChecklistScorer.score(&full_draft(), &profile);
        assert_eq!(report.score, 100.0);
        assert!(report.errors.is_empty());
        assert_eq!(report.checklist.len(), 7);
    }

    #[test]
    fn test_missing_parts_reduce_score() {
        let draft = json!({"title": "Cells", "objectives": ["identify organelles"]});
        let report = ChecklistScorer.score(&draft, &Value::Null);
        // 仅 title 通过
        assert_eq!(report.score, 10.0);
        assert!(report.errors.iter().any(|e| e.contains("assessment")));
        assert!(report.warnings.iter().any(|w| w.contains("one learning objective")));
    }

    #[test]
    fn test_duration_mismatch_warns() {
        let profile = json!({"duration_minutes": 90});
        let report = ChecklistScorer.score(&full_draft(), &profile);
        assert_eq!(report.score, 85.0);
        assert!(report.warnings.iter().any(|w| w.contains("expected about 90")));
    }

    #[test]
    fn test_unparseable_draft() {
        let report = ChecklistScorer.score(&json!("just text"), &Value::Null);
        assert_eq!(report.score, 0.0);
        assert_eq!(report.errors.len(), 1);
    }
}
