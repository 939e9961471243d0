use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use uuid::Uuid;

const MINUTES_PER_DAY: f64 = 24.0 * 60.0;

/// 单个模型的静态配额（启动时加载，之后不再变化）。
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ModelQuotaConfig {
    #[serde(alias = "id")]
    pub model_id: String,
    #[serde(alias = "rpm")]
    pub requests_per_minute: u64,
    #[serde(alias = "tpm")]
    pub tokens_per_minute: u64,
    #[serde(alias = "rpd")]
    pub requests_per_day: u64,
}

impl ModelQuotaConfig {
    pub fn new(
        model_id: impl Into<String>,
        requests_per_minute: u64,
        tokens_per_minute: u64,
        requests_per_day: u64,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            requests_per_minute,
            tokens_per_minute,
            requests_per_day,
        }
    }
}

/// 令牌桶：available 始终落在 [0, capacity]。
#[derive(Debug, Clone)]
pub struct QuotaBucket {
    capacity: f64,
    available: f64,
    refill_per_minute: f64,
}

impl QuotaBucket {
    /// 新建的桶是满的。
    pub fn full(capacity: u64, refill_per_minute: f64) -> Self {
        let capacity = capacity as f64;
        Self {
            capacity,
            available: capacity,
            refill_per_minute: if refill_per_minute.is_finite() {
                refill_per_minute.max(0.0)
            } else {
                0.0
            },
        }
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn available(&self) -> f64 {
        self.available
    }

    pub fn has(&self, amount: f64) -> bool {
        self.available >= amount
    }

    /// 扣减；调用方须先用 has 检查（同一把锁内）。
    pub fn debit(&mut self, amount: f64) {
        debug_assert!(self.available >= amount);
        self.available = (self.available - amount).clamp(0.0, self.capacity);
    }

    /// 按经过的分钟数补充，返回实际增加量。
    pub fn refill(&mut self, elapsed_minutes: f64) -> f64 {
        if !(elapsed_minutes.is_finite() && elapsed_minutes > 0.0) {
            return 0.0;
        }
        let before = self.available;
        self.available = (before + self.refill_per_minute * elapsed_minutes).min(self.capacity);
        self.available - before
    }

    pub fn reset(&mut self) {
        self.available = self.capacity;
    }

    #[cfg(test)]
    pub(crate) fn drain(&mut self) {
        self.available = 0.0;
    }
}

/// 一个模型的三维配额状态，整体受同一把锁保护。
#[derive(Debug)]
pub struct ModelBuckets {
    pub requests: QuotaBucket,
    pub tokens: QuotaBucket,
    pub day: QuotaBucket,
    /// 上次连续补充的时间点。
    pub last_refill: DateTime<Utc>,
    /// 日配额最近一次重置所在的 UTC 日期。
    pub reset_date: NaiveDate,
}

impl ModelBuckets {
    pub fn new(cfg: &ModelQuotaConfig, now: DateTime<Utc>) -> Self {
        Self {
            requests: QuotaBucket::full(
                cfg.requests_per_minute,
                cfg.requests_per_minute as f64,
            ),
            tokens: QuotaBucket::full(cfg.tokens_per_minute, cfg.tokens_per_minute as f64),
            day: QuotaBucket::full(
                cfg.requests_per_day,
                cfg.requests_per_day as f64 / MINUTES_PER_DAY,
            ),
            last_refill: now,
            reset_date: now.date_naive(),
        }
    }

    /// 容量上限本身就装不下这次请求：再怎么补充也不可能放行。
    pub fn can_ever_admit(&self, tokens_needed: u64) -> bool {
        self.requests.capacity() >= 1.0
            && self.tokens.capacity() >= tokens_needed as f64
            && self.day.capacity() >= 1.0
    }

    pub fn can_admit(&self, tokens_needed: u64) -> bool {
        self.requests.has(1.0) && self.tokens.has(tokens_needed as f64) && self.day.has(1.0)
    }

    /// 三个维度同时满足才扣减；返回是否成功。
    pub fn try_debit(&mut self, tokens_needed: u64) -> bool {
        if !self.can_admit(tokens_needed) {
            return false;
        }
        self.requests.debit(1.0);
        self.tokens.debit(tokens_needed as f64);
        self.day.debit(1.0);
        true
    }

    /// 连续补充 + 跨日重置。返回本次是否有任何桶增加了余额。
    pub fn refill_to(&mut self, now: DateTime<Utc>) -> bool {
        let mut gained = false;

        // 时钟回拨时不补充，也不把 last_refill 往回挪。
        if now > self.last_refill {
            let elapsed_minutes = (now - self.last_refill).num_milliseconds() as f64 / 60_000.0;
            gained |= self.requests.refill(elapsed_minutes) > 0.0;
            gained |= self.tokens.refill(elapsed_minutes) > 0.0;
            gained |= self.day.refill(elapsed_minutes) > 0.0;
            self.last_refill = now;
        }

        // 只有日期前进才重置；时钟回拨跨过零点不会重复重置。
        let today = now.date_naive();
        if today > self.reset_date {
            gained |= self.day.available() < self.day.capacity();
            self.day.reset();
            self.reset_date = today;
        }

        gained
    }
}

/// acquire 的结果：选中的模型与实际预留的 token 数。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub id: Uuid,
    pub model_id: String,
    pub tokens_reserved: u64,
}

/// 某个模型当前余额的只读快照。
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSnapshot {
    pub model_id: String,
    pub requests_available: f64,
    pub requests_capacity: f64,
    pub tokens_available: f64,
    pub tokens_capacity: f64,
    pub day_available: f64,
    pub day_capacity: f64,
}
