//! 后台补充任务：周期性补充所有模型的配额，并顺带检查 UTC 跨日重置。

use crate::scheduler::AdmissionScheduler;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// 默认补充间隔；日配额重置最多滞后一个间隔。
pub const DEFAULT_REFILL_INTERVAL: Duration = Duration::from_secs(60);

/// 启动后台补充任务，进程存活期间一直运行；返回的句柄仅用于退出时 abort。
pub fn spawn_refill_task(
    scheduler: Arc<AdmissionScheduler>,
    interval: Duration,
) -> JoinHandle<()> {
    let interval = interval.max(Duration::from_millis(10));
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // interval 的第一次 tick 立即完成；启动时所有桶都是满的，跳过。
        tick.tick().await;

        loop {
            tick.tick().await;
            scheduler.refill().await;

            if tracing::enabled!(tracing::Level::DEBUG) {
                for m in scheduler.snapshot().await {
                    tracing::debug!(
                        model_id = %m.model_id,
                        requests_available = m.requests_available,
                        tokens_available = m.tokens_available,
                        day_available = m.day_available,
                        "配额补充完成"
                    );
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{AdmissionPolicy, ManualClock, ModelQuotaConfig};
    use chrono::{TimeZone, Utc};

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn background_task_wakes_waiters() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 7, 1, 9, 0, 0).unwrap());
        let scheduler = Arc::new(
            AdmissionScheduler::with_clock(
                &[ModelQuotaConfig::new("m", 1, 100_000, 1000)],
                AdmissionPolicy {
                    // 拉长退避，确保唤醒来自后台补充而不是等待方自己的轮询。
                    retry_backoff: Duration::from_secs(30),
                    ..AdmissionPolicy::default()
                },
                Arc::new(clock.clone()),
            )
            .unwrap(),
        );

        scheduler.acquire(&["m"], 0).await.unwrap();
        let pending = {
            let s = scheduler.clone();
            tokio::spawn(async move { s.acquire(&["m"], 0).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished());

        clock.advance(chrono::Duration::minutes(1));
        let task = spawn_refill_task(scheduler.clone(), Duration::from_millis(50));

        let r = tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .expect("refill task should admit the waiter")
            .unwrap()
            .unwrap();
        assert_eq!(r.model_id, "m");
        task.abort();
    }
}
