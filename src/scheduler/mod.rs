//! 准入调度（Admission Scheduler）模块。
//!
//! 目标：多个 worker 并发调用上游视觉模型时，按调用方给出的模型偏好顺序，
//! 在每分钟请求数、每分钟 token 数、每日请求数三个维度上原子地预留配额；
//! 暂时没有余额时挂起等待，由后台任务持续补充。

mod clock;
mod manager;
mod policy;
mod refresher;
mod selector;
mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use manager::AdmissionScheduler;
pub use policy::{AdmissionPolicy, DEFAULT_MIN_TOKENS, DEFAULT_RETRY_BACKOFF, DEFAULT_SAFETY_FACTOR};
pub use refresher::{DEFAULT_REFILL_INTERVAL, spawn_refill_task};
pub use types::{ModelQuotaConfig, ModelSnapshot, QuotaBucket, Reservation};
