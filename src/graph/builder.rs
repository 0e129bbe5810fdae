//! 阶段图构建器
//!
//! 提供流畅的 API 声明阶段与边（顺序、条件分支、结束），build 时校验所有端点都已注册。

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use super::types::{Stage, WorkflowState};
use crate::core::StageError;

/// 条件边的路由函数：读取当前状态，返回下一阶段名
pub type BranchFn<S> = Arc<dyn Fn(&S) -> &'static str + Send + Sync>;

/// 阶段的出边
pub enum Edge<S> {
    Next(&'static str),
    Branch {
        route: BranchFn<S>,
        targets: Vec<&'static str>,
    },
    End,
}

#[derive(Error, Debug, PartialEq)]
pub enum GraphError {
    #[error("Graph has no entry stage")]
    MissingEntry,
    #[error("Unknown stage: {0}")]
    UnknownStage(String),
    #[error("Stage registered twice: {0}")]
    DuplicateStage(String),
    #[error("Stage has more than one outgoing edge: {0}")]
    DuplicateEdge(String),
    #[error("Stage has no outgoing edge: {0}")]
    MissingEdge(String),
}

/// 已校验的阶段图
pub struct StageGraph<S: WorkflowState> {
    name: String,
    entry: &'static str,
    stages: HashMap<&'static str, Arc<dyn Stage<S>>>,
    edges: HashMap<&'static str, Edge<S>>,
}

impl<S: WorkflowState> StageGraph<S> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entry(&self) -> &'static str {
        self.entry
    }

    pub fn stage(&self, name: &str) -> Option<Arc<dyn Stage<S>>> {
        self.stages.get(name).cloned()
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.stages.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// 按出边求下一阶段；None 表示到达终点
    pub fn next(&self, from: &str, state: &S) -> Result<Option<&'static str>, StageError> {
        match self.edges.get(from) {
            Some(Edge::Next(to)) => Ok(Some(*to)),
            Some(Edge::End) => Ok(None),
            Some(Edge::Branch { route, targets }) => {
                let to = route(state);
                if targets.contains(&to) {
                    Ok(Some(to))
                } else {
                    Err(StageError::Fatal(format!(
                        "branch from '{from}' chose undeclared stage '{to}'"
                    )))
                }
            }
            None => Err(StageError::Fatal(format!("no edge from stage '{from}'"))),
        }
    }
}

/// 阶段图构建器
pub struct GraphBuilder<S: WorkflowState> {
    name: String,
    entry: Option<&'static str>,
    stages: HashMap<&'static str, Arc<dyn Stage<S>>>,
    edges: HashMap<&'static str, Edge<S>>,
    errors: Vec<GraphError>,
}

impl<S: WorkflowState> GraphBuilder<S> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entry: None,
            stages: HashMap::new(),
            edges: HashMap::new(),
            errors: Vec::new(),
        }
    }

    /// 注册阶段（以 Stage::name 为键）
    pub fn stage(mut self, stage: impl Stage<S> + 'static) -> Self {
        let name = stage.name();
        if self.stages.insert(name, Arc::new(stage)).is_some() {
            self.errors.push(GraphError::DuplicateStage(name.to_string()));
        }
        self
    }

    /// 设置入口阶段
    pub fn entry(mut self, name: &'static str) -> Self {
        self.entry = Some(name);
        self
    }

    fn add_edge(mut self, from: &'static str, edge: Edge<S>) -> Self {
        if self.edges.insert(from, edge).is_some() {
            self.errors.push(GraphError::DuplicateEdge(from.to_string()));
        }
        self
    }

    /// 顺序边
    pub fn edge(self, from: &'static str, to: &'static str) -> Self {
        self.add_edge(from, Edge::Next(to))
    }

    /// 条件边：route 的返回值必须在 targets 之中
    pub fn branch<F>(self, from: &'static str, targets: &[&'static str], route: F) -> Self
    where
        F: Fn(&S) -> &'static str + Send + Sync + 'static,
    {
        self.add_edge(
            from,
            Edge::Branch {
                route: Arc::new(route),
                targets: targets.to_vec(),
            },
        )
    }

    /// 终止边
    pub fn end(self, from: &'static str) -> Self {
        self.add_edge(from, Edge::End)
    }

    /// 构建阶段图
    pub fn build(mut self) -> Result<StageGraph<S>, GraphError> {
        if !self.errors.is_empty() {
            return Err(self.errors.remove(0));
        }
        let entry = self.entry.ok_or(GraphError::MissingEntry)?;
        let known = |name: &str| self.stages.contains_key(name);

        if !known(entry) {
            return Err(GraphError::UnknownStage(entry.to_string()));
        }
        for (from, edge) in &self.edges {
            if !known(*from) {
                return Err(GraphError::UnknownStage(from.to_string()));
            }
            let targets: Vec<&str> = match edge {
                Edge::Next(to) => vec![*to],
                Edge::Branch { targets, .. } => targets.clone(),
                Edge::End => Vec::new(),
            };
            if let Some(missing) = targets.into_iter().find(|t| !known(*t)) {
                return Err(GraphError::UnknownStage(missing.to_string()));
            }
        }
        let mut names: Vec<_> = self.stages.keys().copied().collect();
        names.sort_unstable();
        if let Some(name) = names.into_iter().find(|n| !self.edges.contains_key(n)) {
            return Err(GraphError::MissingEdge(name.to_string()));
        }

        Ok(StageGraph {
            name: self.name,
            entry,
            stages: self.stages,
            edges: self.edges,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StageError;
    use crate::graph::types::{StageContext, StageOutput};
    use async_trait::async_trait;
    use serde_json::Value;
    use tokio::time::Instant;

    struct Counter {
        value: u32,
        started: Instant,
    }

    impl WorkflowState for Counter {
        type Delta = u32;
        fn merge(&mut self, delta: u32) {
            self.value += delta;
        }
        fn started_at(&self) -> Instant {
            self.started
        }
        fn input_summary(&self) -> String {
            String::new()
        }
        fn outcome(&self) -> Value {
            Value::from(self.value)
        }
    }

    struct Named(&'static str);

    #[async_trait]
    impl Stage<Counter> for Named {
        fn name(&self) -> &'static str {
            self.0
        }
        async fn run(&self, _state: &Counter, _ctx: &StageContext) -> Result<StageOutput<u32>, StageError> {
            Ok(StageOutput::new(1))
        }
    }

    fn counter(value: u32) -> Counter {
        Counter {
            value,
            started: Instant::now(),
        }
    }

    #[test]
    fn test_build_and_walk() {
        let graph = GraphBuilder::<Counter>::new("demo")
            .stage(Named("a"))
            .stage(Named("b"))
            .stage(Named("c"))
            .entry("a")
            .branch("a", &["b", "c"], |s: &Counter| if s.value > 1 { "c" } else { "b" })
            .edge("b", "c")
            .end("c")
            .build()
            .unwrap();

        assert_eq!(graph.entry(), "a");
        assert_eq!(graph.next("a", &counter(0)).unwrap(), Some("b"));
        assert_eq!(graph.next("a", &counter(5)).unwrap(), Some("c"));
        assert_eq!(graph.next("c", &counter(0)).unwrap(), None);
        assert_eq!(graph.stage_names(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_validation_errors() {
        let err = GraphBuilder::<Counter>::new("x").stage(Named("a")).end("a").build();
        assert_eq!(err.err(), Some(GraphError::MissingEntry));

        let err = GraphBuilder::<Counter>::new("x")
            .stage(Named("a"))
            .entry("a")
            .edge("a", "ghost")
            .build();
        assert_eq!(err.err(), Some(GraphError::UnknownStage("ghost".into())));

        let err = GraphBuilder::<Counter>::new("x")
            .stage(Named("a"))
            .stage(Named("b"))
            .entry("a")
            .edge("a", "b")
            .build();
        assert_eq!(err.err(), Some(GraphError::MissingEdge("b".into())));

        let err = GraphBuilder::<Counter>::new("x")
            .stage(Named("a"))
            .stage(Named("a"))
            .entry("a")
            .end("a")
            .build();
        assert_eq!(err.err(), Some(GraphError::DuplicateStage("a".into())));
    }

    #[test]
    fn test_undeclared_branch_target_is_fatal() {
        let graph = GraphBuilder::<Counter>::new("x")
            .stage(Named("a"))
            .stage(Named("b"))
            .entry("a")
            .branch("a", &["b"], |_: &Counter| "a")
            .end("b")
            .build()
            .unwrap();
        assert!(matches!(graph.next("a", &counter(0)), Err(StageError::Fatal(_))));
    }
}
