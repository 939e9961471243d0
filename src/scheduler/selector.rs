//! 选择算法：按调用方给出的偏好顺序做 first-fit。
//!
//! 每个模型各自一把锁；检查与扣减在同一次加锁内完成，扫描过程中任一时刻只持有一把锁。

use crate::scheduler::types::ModelBuckets;
use std::collections::HashMap;
use tokio::sync::Mutex;

/// 单次扫描的结果。
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Scan {
    /// 选中并已扣减的模型。
    Admitted(String),
    /// 至少有一个已知候选，但当前都没有足够余额。
    Exhausted,
    /// 候选列表中没有任何已配置的模型。
    NoKnownCandidate,
    /// 已知候选的容量上限都装不下这次请求，等待没有意义。
    Unsatisfiable,
}

pub(crate) async fn first_fit<S: AsRef<str>>(
    models: &HashMap<String, Mutex<ModelBuckets>>,
    candidates: &[S],
    tokens_needed: u64,
) -> Scan {
    let mut any_known = false;
    let mut any_satisfiable = false;

    for candidate in candidates {
        let model_id = candidate.as_ref();
        // 未配置的模型直接跳过，容忍调用方与配置之间的漂移。
        let Some(slot) = models.get(model_id) else {
            continue;
        };
        any_known = true;

        let mut buckets = slot.lock().await;
        if !buckets.can_ever_admit(tokens_needed) {
            continue;
        }
        any_satisfiable = true;
        if buckets.try_debit(tokens_needed) {
            return Scan::Admitted(model_id.to_string());
        }
    }

    match (any_known, any_satisfiable) {
        (false, _) => Scan::NoKnownCandidate,
        (true, false) => Scan::Unsatisfiable,
        (true, true) => Scan::Exhausted,
    }
}
