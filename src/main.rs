use anyhow::Context;
use quizgen_scheduler::config::Config;
use quizgen_scheduler::logging;
use quizgen_scheduler::scheduler::{AdmissionScheduler, spawn_refill_task};
use quizgen_scheduler::worker::{GenerationOutcome, Generator, PageTask, PageWorker, WorkerOptions};
use std::sync::Arc;
use std::time::Duration;

/// 演练用生成器：不调用真实模型，只模拟耗时与用量，用于在上线前检验配额配置与并发度。
struct DryRunGenerator;

impl Generator for DryRunGenerator {
    async fn generate(&self, model_id: &str, task: &PageTask) -> anyhow::Result<GenerationOutcome> {
        // 用 uuid 的随机位做一点耗时抖动。
        let jitter = (uuid::Uuid::new_v4().as_u128() % 150) as u64;
        tokio::time::sleep(Duration::from_millis(50 + jitter)).await;
        tracing::debug!(model_id, page = task.page_number, "dry-run 生成完成");
        Ok(GenerationOutcome {
            tokens_used: task.estimated_tokens * 9 / 10,
            question_count: 5,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::load().context("加载配置失败")?;

    logging::init_tracing(cfg.log_level(), cfg.log_json);
    if !cfg.quota_file_found {
        tracing::info!(path = %cfg.quota_config.display(), "未找到配额文件，使用内置模型配额");
    }

    let scheduler = Arc::new(
        AdmissionScheduler::new(&cfg.models, cfg.policy.clone()).context("初始化准入调度器失败")?,
    );

    let unknown: Vec<&str> = cfg
        .candidates
        .iter()
        .map(String::as_str)
        .filter(|c| !scheduler.is_known(c))
        .collect();
    if !unknown.is_empty() {
        tracing::warn!(?unknown, "候选列表中存在未配置的模型，将被跳过");
    }

    let refill_task = spawn_refill_task(scheduler.clone(), cfg.refill_interval);

    let tasks: Vec<PageTask> = (1..=cfg.dry_run_pages)
        .map(|page| PageTask {
            upload_id: "dry-run".to_string(),
            page_number: page,
            estimated_tokens: 1200 + u64::from(page % 5) * 400,
        })
        .collect();

    tracing::info!(
        pages = tasks.len(),
        concurrency = cfg.worker_concurrency,
        candidates = ?cfg.candidates,
        quota_config = %cfg.quota_config.display(),
        "开始 dry-run 页面生成"
    );

    let mut options = WorkerOptions::new(
        cfg.candidates.clone(),
        cfg.worker_concurrency,
        cfg.generation_max_attempts,
    );
    options.acquire_deadline = cfg.acquire_deadline;
    let worker = PageWorker::new(scheduler.clone(), DryRunGenerator, options);

    tokio::select! {
        results = worker.run(tasks) => {
            let mut ok = 0usize;
            let mut failed = 0usize;
            let mut retryable = 0usize;
            let mut reserved = 0u64;
            let mut used = 0u64;
            for r in &results {
                match r {
                    Ok(rec) => {
                        ok += 1;
                        reserved += rec.tokens_reserved;
                        used += rec.tokens_used;
                    }
                    Err(e) => {
                        failed += 1;
                        if e.is_transient() {
                            retryable += 1;
                        }
                        tracing::warn!("页面处理失败：{e}");
                    }
                }
            }
            tracing::info!("dry-run 完成：成功 {ok}，失败 {failed}（可重试 {retryable}），预留 {reserved} tokens，实际 {used} tokens");
        }
        _ = shutdown_signal() => {}
    }

    refill_task.abort();
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("收到退出信号，准备退出...");
}
