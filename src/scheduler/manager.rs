use crate::error::SchedulerError;
use crate::scheduler::clock::{Clock, SystemClock};
use crate::scheduler::policy::AdmissionPolicy;
use crate::scheduler::selector::{self, Scan};
use crate::scheduler::types::{ModelBuckets, ModelQuotaConfig, ModelSnapshot, Reservation};
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

/// 准入调度器：集中维护所有模型的三维配额，并按调用方偏好顺序分配模型。
///
/// 由进程的组装入口创建一次，通过 `Arc` 在各 worker 间共享。
#[derive(Debug)]
pub struct AdmissionScheduler {
    /// 构造后键集合不再变化；每个模型一把锁。
    models: HashMap<String, Mutex<ModelBuckets>>,
    /// 配置中的模型顺序（用于补充与快照的稳定遍历）。
    order: Vec<String>,
    policy: ArcSwap<AdmissionPolicy>,
    clock: Arc<dyn Clock>,
    refilled: Notify,
}

impl AdmissionScheduler {
    pub fn new(
        models: &[ModelQuotaConfig],
        policy: AdmissionPolicy,
    ) -> Result<Self, SchedulerError> {
        Self::with_clock(models, policy, Arc::new(SystemClock))
    }

    pub fn with_clock(
        models: &[ModelQuotaConfig],
        policy: AdmissionPolicy,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SchedulerError> {
        policy.validate()?;
        if models.is_empty() {
            return Err(SchedulerError::config("至少需要配置一个模型"));
        }

        let now = clock.now();
        let mut map = HashMap::with_capacity(models.len());
        let mut order = Vec::with_capacity(models.len());
        for cfg in models {
            let id = cfg.model_id.trim();
            if id.is_empty() {
                return Err(SchedulerError::config("model_id 不能为空"));
            }
            if map.contains_key(id) {
                return Err(SchedulerError::config(format!("重复的 model_id: {id}")));
            }
            map.insert(id.to_string(), Mutex::new(ModelBuckets::new(cfg, now)));
            order.push(id.to_string());
        }

        tracing::info!(models = ?order, "准入调度器已初始化");

        Ok(Self {
            models: map,
            order,
            policy: ArcSwap::from_pointee(policy),
            clock,
            refilled: Notify::new(),
        })
    }

    pub fn policy(&self) -> Arc<AdmissionPolicy> {
        self.policy.load_full()
    }

    /// 替换预留策略；已在等待中的 acquire 仍沿用其入口时读取的策略。
    pub fn update_policy(&self, policy: AdmissionPolicy) -> Result<(), SchedulerError> {
        policy.validate()?;
        tracing::info!(
            safety_factor = policy.safety_factor,
            min_tokens = policy.min_tokens,
            retry_backoff_ms = policy.retry_backoff.as_millis() as u64,
            "准入策略已更新"
        );
        self.policy.store(Arc::new(policy));
        Ok(())
    }

    pub fn is_known(&self, model_id: &str) -> bool {
        self.models.contains_key(model_id)
    }

    /// 为一次生成调用预留配额，返回选中的模型与实际预留的 token 数。
    ///
    /// - 按 candidates 顺序 first-fit；未配置的模型跳过
    /// - 所有候选都没有余额时挂起等待，直到补充后有模型满足
    /// - candidates 中没有任何已配置模型时立即返回 `NoKnownCandidate`
    /// - 已知候选的容量上限都装不下 tokens_needed（或某维容量为 0）时立即返回 `Unsatisfiable`
    ///
    /// 等待方之间不保证 FIFO。future 在成功前被 drop 不会留下任何扣减。
    pub async fn acquire<S: AsRef<str>>(
        &self,
        candidates: &[S],
        estimated_tokens: u64,
    ) -> Result<Reservation, SchedulerError> {
        let policy = self.policy.load_full();
        let tokens_needed = policy.tokens_needed(estimated_tokens);
        let mut waited = false;

        loop {
            // 先登记通知再扫描：扫描失败与开始等待之间发生的补充不会丢失。
            let notified = self.refilled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match selector::first_fit(&self.models, candidates, tokens_needed).await {
                Scan::Admitted(model_id) => {
                    let reservation = Reservation {
                        id: Uuid::new_v4(),
                        model_id,
                        tokens_reserved: tokens_needed,
                    };
                    tracing::debug!(
                        reservation_id = %reservation.id,
                        model_id = %reservation.model_id,
                        tokens_reserved = reservation.tokens_reserved,
                        estimated_tokens,
                        waited,
                        "配额预留成功"
                    );
                    return Ok(reservation);
                }
                Scan::NoKnownCandidate => {
                    tracing::warn!(
                        candidates = ?candidates.iter().map(|c| c.as_ref()).collect::<Vec<&str>>(),
                        "候选模型均未配置，拒绝预留"
                    );
                    return Err(SchedulerError::no_known_candidate(candidates));
                }
                Scan::Unsatisfiable => {
                    tracing::warn!(
                        candidates = ?candidates.iter().map(|c| c.as_ref()).collect::<Vec<&str>>(),
                        tokens_needed,
                        "候选模型容量上限不足，拒绝预留"
                    );
                    return Err(SchedulerError::unsatisfiable(tokens_needed, candidates));
                }
                Scan::Exhausted => {}
            }

            if !waited {
                tracing::debug!(tokens_needed, "候选模型配额不足，进入等待");
                waited = true;
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(policy.retry_backoff) => {}
            }

            // 机会性补充：不唤醒其他等待方，避免互相惊群。
            self.refill_pass(false).await;
        }
    }

    /// 非阻塞的单次尝试：没有余额时返回 `Ok(None)`。
    pub async fn try_acquire<S: AsRef<str>>(
        &self,
        candidates: &[S],
        estimated_tokens: u64,
    ) -> Result<Option<Reservation>, SchedulerError> {
        let tokens_needed = self.policy.load().tokens_needed(estimated_tokens);
        match selector::first_fit(&self.models, candidates, tokens_needed).await {
            Scan::Admitted(model_id) => Ok(Some(Reservation {
                id: Uuid::new_v4(),
                model_id,
                tokens_reserved: tokens_needed,
            })),
            Scan::Exhausted => Ok(None),
            Scan::NoKnownCandidate => Err(SchedulerError::no_known_candidate(candidates)),
            Scan::Unsatisfiable => Err(SchedulerError::unsatisfiable(tokens_needed, candidates)),
        }
    }

    /// 定时补充：按经过时间补充所有模型的三个桶，并检查 UTC 跨日重置；有余额增加时唤醒等待方。
    pub async fn refill(&self) {
        self.refill_pass(true).await;
    }

    async fn refill_pass(&self, wake: bool) {
        let now = self.clock.now();
        let mut gained = false;
        for id in &self.order {
            let Some(slot) = self.models.get(id) else {
                continue;
            };
            let mut buckets = slot.lock().await;
            let today_before = buckets.reset_date;
            gained |= buckets.refill_to(now);
            if buckets.reset_date != today_before {
                tracing::info!(model_id = %id, date = %buckets.reset_date, "日配额已按 UTC 跨日重置");
            }
        }

        if wake && gained {
            self.refilled.notify_waiters();
        }
    }

    /// 读取所有模型当前余额（按配置顺序）。
    pub async fn snapshot(&self) -> Vec<ModelSnapshot> {
        let mut out = Vec::with_capacity(self.order.len());
        for id in &self.order {
            let Some(slot) = self.models.get(id) else {
                continue;
            };
            let b = slot.lock().await;
            out.push(ModelSnapshot {
                model_id: id.clone(),
                requests_available: b.requests.available(),
                requests_capacity: b.requests.capacity(),
                tokens_available: b.tokens.available(),
                tokens_capacity: b.tokens.capacity(),
                day_available: b.day.available(),
                day_capacity: b.day.capacity(),
            });
        }
        out
    }

    #[cfg(test)]
    async fn with_buckets<R>(&self, model_id: &str, f: impl FnOnce(&mut ModelBuckets) -> R) -> R {
        let slot = self.models.get(model_id).expect("unknown model in test");
        let mut b = slot.lock().await;
        f(&mut *b)
    }
}
