//! LessonFlow 命令行
//!
//! 按给定提示生成一份教案（或用 --tutor 进行一轮辅导对话），把每个事件按 SSE `data:` 行打印到 stdout。

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use futures_util::StreamExt;
use serde_json::json;

use lessonflow::config::load_config;
use lessonflow::events::EventType;
use lessonflow::graph::{PlanRequest, TutorRequest};
use lessonflow::{observability, Orchestrator, RunStart};

#[derive(Parser, Debug)]
#[command(name = "lessonflow", version, about = "Generate a lesson plan and stream run events")]
struct Cli {
    /// 教案需求或学生提问
    prompt: String,

    /// 额外的配置文件
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    tenant: Option<String>,

    #[arg(long)]
    subject: Option<String>,

    /// 期望课时（分钟）
    #[arg(long)]
    duration: Option<u32>,

    /// 目标学段
    #[arg(long)]
    grade: Option<String>,

    /// 辅导对话模式
    #[arg(long)]
    tutor: bool,

    /// 指定 run_id（默认生成 UUID）
    #[arg(long)]
    run_id: Option<String>,

    #[arg(long)]
    idempotency_key: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();
    let cli = Cli::parse();

    let cfg = load_config(cli.config.clone()).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        Default::default()
    });
    let orchestrator = Orchestrator::from_config(cfg).context("Failed to build orchestrator")?;

    let start = if cli.tutor {
        let mut request = TutorRequest::new(cli.prompt);
        request.tenant = cli.tenant;
        request.subject = cli.subject;
        orchestrator.start_tutor_run(request, cli.run_id, cli.idempotency_key).await
    } else {
        let mut profile = serde_json::Map::new();
        if let Some(minutes) = cli.duration {
            profile.insert("duration_minutes".into(), json!(minutes));
        }
        if let Some(grade) = cli.grade {
            profile.insert("grade_level".into(), json!(grade));
        }
        let request = PlanRequest {
            prompt: cli.prompt,
            tenant: cli.tenant,
            subject: cli.subject,
            profile: serde_json::Value::Object(profile),
        };
        orchestrator.start_plan_run(request, cli.run_id, cli.idempotency_key).await
    }
    .context("Failed to start run")?;

    let run_id = match start {
        RunStart::Started { run_id } => run_id,
        RunStart::Cached { outcome } => {
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            return Ok(());
        }
    };

    let mut events = Box::pin(orchestrator.event_stream(&run_id, None));
    let mut failed = false;
    while let Some(entry) = events.next().await {
        println!("data: {}\n", entry.payload);
        failed = entry.kind == EventType::RunFailed;
    }

    if failed {
        anyhow::bail!("run {run_id} failed");
    }
    Ok(())
}
