//! 页面生成 worker：为每一页预留模型配额，调用生成器，并记录预留量与实际用量。
//!
//! 生成器（调用视觉模型）属于外部协作方，这里只通过 [`Generator`] 约定接口。

use crate::error::SchedulerError;
use crate::scheduler::{AdmissionScheduler, Reservation};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// 生成失败后的重试间隔（递增）。
const RETRY_DELAYS_MS: [u64; 4] = [1_000, 5_000, 15_000, 30_000];

/// 一页待生成的任务。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageTask {
    pub upload_id: String,
    pub page_number: u32,
    pub estimated_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationOutcome {
    pub tokens_used: u64,
    pub question_count: u32,
}

/// 一次成功生成的用量记录：成本核算以预留量为准，实际用量用于校准估算。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageRecord {
    pub upload_id: String,
    pub page_number: u32,
    pub reservation_id: uuid::Uuid,
    pub model_id: String,
    pub tokens_reserved: u64,
    pub tokens_used: u64,
    pub question_count: u32,
    pub attempts: u32,
}

pub trait Generator: Send + Sync + 'static {
    fn generate(
        &self,
        model_id: &str,
        task: &PageTask,
    ) -> impl Future<Output = anyhow::Result<GenerationOutcome>> + Send;
}

/// 带截止时间的预留：超时返回 `DeadlineExceeded`。
///
/// 超时前未完成的 acquire 不会扣减任何配额；已返回的预留视为已消耗，没有回滚。
pub async fn acquire_with_deadline<S: AsRef<str>>(
    scheduler: &AdmissionScheduler,
    candidates: &[S],
    estimated_tokens: u64,
    deadline: Duration,
) -> Result<Reservation, SchedulerError> {
    match tokio::time::timeout(deadline, scheduler.acquire(candidates, estimated_tokens)).await {
        Ok(res) => res,
        Err(_) => Err(SchedulerError::DeadlineExceeded(deadline)),
    }
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub candidates: Vec<String>,
    pub concurrency: usize,
    pub max_attempts: u32,
    /// 单次等待配额的上限；None 表示一直等。
    pub acquire_deadline: Option<Duration>,
    pub retry_delays: Vec<Duration>,
}

impl WorkerOptions {
    pub fn new(candidates: Vec<String>, concurrency: usize, max_attempts: u32) -> Self {
        Self {
            candidates,
            concurrency: concurrency.max(1),
            max_attempts: max_attempts.max(1),
            acquire_deadline: None,
            retry_delays: RETRY_DELAYS_MS
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
        }
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        self.retry_delays
            .get(attempt as usize)
            .or(self.retry_delays.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }
}

pub struct PageWorker<G> {
    scheduler: Arc<AdmissionScheduler>,
    generator: Arc<G>,
    options: Arc<WorkerOptions>,
}

impl<G: Generator> PageWorker<G> {
    pub fn new(scheduler: Arc<AdmissionScheduler>, generator: G, options: WorkerOptions) -> Self {
        Self {
            scheduler,
            generator: Arc::new(generator),
            options: Arc::new(options),
        }
    }

    /// 并发处理所有页面，按输入顺序返回每页结果。
    pub async fn run(
        &self,
        tasks: Vec<PageTask>,
    ) -> Vec<Result<UsageRecord, SchedulerError>> {
        let semaphore = Arc::new(Semaphore::new(self.options.concurrency));
        let mut handles = Vec::with_capacity(tasks.len());

        for task in tasks {
            let scheduler = self.scheduler.clone();
            let generator = self.generator.clone();
            let options = self.options.clone();
            let semaphore = semaphore.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| SchedulerError::Generation(e.into()))?;
                process_page(&scheduler, generator.as_ref(), &options, &task).await
            }));
        }

        let mut out = Vec::with_capacity(handles.len());
        for res in futures::future::join_all(handles).await {
            out.push(match res {
                Ok(r) => r,
                Err(e) => Err(SchedulerError::Generation(e.into())),
            });
        }
        out
    }
}

/// 单页处理：预留 → 生成；生成失败时重新预留后重试（上一次预留已消耗）。
async fn process_page<G: Generator>(
    scheduler: &AdmissionScheduler,
    generator: &G,
    options: &WorkerOptions,
    task: &PageTask,
) -> Result<UsageRecord, SchedulerError> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;

        let acquired = match options.acquire_deadline {
            Some(deadline) => {
                acquire_with_deadline(
                    scheduler,
                    options.candidates.as_slice(),
                    task.estimated_tokens,
                    deadline,
                )
                .await
            }
            None => {
                scheduler
                    .acquire(options.candidates.as_slice(), task.estimated_tokens)
                    .await
            }
        };
        let reservation = match acquired {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(
                    upload_id = %task.upload_id,
                    page = task.page_number,
                    attempt,
                    retryable = e.is_transient(),
                    "预留配额失败：{e}"
                );
                return Err(e);
            }
        };

        match generator.generate(&reservation.model_id, task).await {
            Ok(outcome) => {
                tracing::info!(
                    upload_id = %task.upload_id,
                    page = task.page_number,
                    model_id = %reservation.model_id,
                    reservation_id = %reservation.id,
                    tokens_reserved = reservation.tokens_reserved,
                    tokens_used = outcome.tokens_used,
                    questions = outcome.question_count,
                    "页面生成完成"
                );
                if outcome.tokens_used > reservation.tokens_reserved {
                    tracing::warn!(
                        upload_id = %task.upload_id,
                        page = task.page_number,
                        tokens_reserved = reservation.tokens_reserved,
                        tokens_used = outcome.tokens_used,
                        "实际用量超过预留量，估算偏低"
                    );
                }
                return Ok(UsageRecord {
                    upload_id: task.upload_id.clone(),
                    page_number: task.page_number,
                    reservation_id: reservation.id,
                    model_id: reservation.model_id,
                    tokens_reserved: reservation.tokens_reserved,
                    tokens_used: outcome.tokens_used,
                    question_count: outcome.question_count,
                    attempts: attempt,
                });
            }
            Err(e) => {
                if attempt >= options.max_attempts {
                    tracing::warn!(
                        upload_id = %task.upload_id,
                        page = task.page_number,
                        attempt,
                        error = %format!("{e:#}"),
                        "页面生成失败，已达到最大重试次数"
                    );
                    return Err(SchedulerError::Generation(e));
                }
                let delay = options.retry_delay(attempt - 1);
                tracing::info!(
                    upload_id = %task.upload_id,
                    page = task.page_number,
                    model_id = %reservation.model_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "页面生成失败，稍后重试：{e:#}"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
