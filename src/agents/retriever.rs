//! 检索器：tutor 流程的 rag_search 阶段使用

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::AgentError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Passage {
    pub id: String,
    pub text: String,
    pub score: f64,
}

#[async_trait]
pub trait Retriever: Send + Sync {
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<Passage>, AgentError>;
}

/// 内存关键词检索：按查询词命中比例打分
#[derive(Debug, Default, Clone)]
pub struct KeywordRetriever {
    docs: Vec<(String, String)>,
}

impl KeywordRetriever {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_doc(mut self, id: impl Into<String>, text: impl Into<String>) -> Self {
        self.docs.push((id.into(), text.into()));
        self
    }

    fn terms(text: &str) -> Vec<String> {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.chars().count() > 2)
            .map(|t| t.to_lowercase())
            .collect()
    }
}

#[async_trait]
impl Retriever for KeywordRetriever {
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<Passage>, AgentError> {
        let terms = Self::terms(query);
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let mut hits: Vec<Passage> = self
            .docs
            .iter()
            .filter_map(|(id, text)| {
                let lower = text.to_lowercase();
                let matched = terms.iter().filter(|t| lower.contains(t.as_str())).count();
                (matched > 0).then(|| Passage {
                    id: id.clone(),
                    text: text.clone(),
                    score: matched as f64 / terms.len() as f64,
                })
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        hits.truncate(top_k);
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ranked_by_overlap() {
        let r = KeywordRetriever::new()
            .with_doc("a", "Photosynthesis converts light energy in chloroplasts")
            .with_doc("b", "Mitochondria release energy")
            .with_doc("c", "Fractions and decimals");
        let hits = r.search("how does light energy work", 5).await.unwrap();
        assert_eq!(hits.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
        assert!(hits[0].score > hits[1].score);

        let hits = r.search("energy", 1).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(r.search("a b", 3).await.unwrap().is_empty());
    }
}
