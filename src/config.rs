use crate::logging::LogLevel;
use crate::scheduler::{
    AdmissionPolicy, DEFAULT_MIN_TOKENS, DEFAULT_REFILL_INTERVAL, DEFAULT_RETRY_BACKOFF,
    DEFAULT_SAFETY_FACTOR, ModelQuotaConfig,
};
use anyhow::Context;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_QUOTA_CONFIG: &str = "./quota.toml";
const DEFAULT_WORKER_CONCURRENCY: usize = 4;
const DEFAULT_GENERATION_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_DRY_RUN_PAGES: u32 = 20;

/// 未提供 quota.toml 时使用的内置模型配额（免费档位量级）。
fn default_models() -> Vec<ModelQuotaConfig> {
    vec![
        ModelQuotaConfig::new("gemini-2.0-flash", 15, 1_000_000, 1500),
        ModelQuotaConfig::new("gemini-2.0-flash-lite", 30, 1_000_000, 1500),
        ModelQuotaConfig::new("gemini-1.5-flash", 15, 1_000_000, 1500),
    ]
}

#[derive(Debug, Clone)]
pub struct Config {
    pub quota_config: PathBuf,
    /// quota_config 指向的文件是否存在（不存在时使用内置模型配额）。
    pub quota_file_found: bool,
    pub debug: String,
    pub log_json: bool,

    pub models: Vec<ModelQuotaConfig>,
    /// worker 默认使用的模型偏好顺序。
    pub candidates: Vec<String>,
    pub policy: AdmissionPolicy,
    pub refill_interval: Duration,

    pub worker_concurrency: usize,
    pub generation_max_attempts: u32,
    /// 单页等待配额的上限；None 表示一直等。
    pub acquire_deadline: Option<Duration>,
    pub dry_run_pages: u32,
}

#[derive(Debug, Default, Deserialize)]
struct RawEnv {
    #[serde(alias = "QUOTA_CONFIG")]
    quota_config: Option<String>,
    #[serde(alias = "DEBUG")]
    debug: Option<String>,
    #[serde(alias = "LOG_JSON")]
    log_json: Option<bool>,

    #[serde(alias = "CANDIDATES")]
    candidates: Option<String>,
    #[serde(alias = "SAFETY_FACTOR")]
    safety_factor: Option<f64>,
    #[serde(alias = "MIN_TOKENS")]
    min_tokens: Option<u64>,
    #[serde(alias = "RETRY_BACKOFF_MS")]
    retry_backoff_ms: Option<u64>,
    #[serde(alias = "REFILL_INTERVAL_SECS")]
    refill_interval_secs: Option<u64>,

    #[serde(alias = "WORKER_CONCURRENCY")]
    worker_concurrency: Option<usize>,
    #[serde(alias = "GENERATION_MAX_ATTEMPTS")]
    generation_max_attempts: Option<u32>,
    #[serde(alias = "ACQUIRE_DEADLINE_MS")]
    acquire_deadline_ms: Option<u64>,
    #[serde(alias = "DRY_RUN_PAGES")]
    dry_run_pages: Option<u32>,
}

/// quota.toml 的结构：模型列表 + 可选的策略项（环境变量优先）。
#[derive(Debug, Default, Deserialize)]
struct RawFile {
    #[serde(default)]
    models: Vec<ModelQuotaConfig>,
    candidates: Option<Vec<String>>,
    safety_factor: Option<f64>,
    min_tokens: Option<u64>,
    retry_backoff_ms: Option<u64>,
    refill_interval_secs: Option<u64>,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let raw_env = Figment::from(Env::raw())
            .extract::<RawEnv>()
            .unwrap_or_default();

        let quota_config = PathBuf::from(
            raw_env
                .quota_config
                .clone()
                .unwrap_or_else(|| DEFAULT_QUOTA_CONFIG.to_string()),
        );
        let raw_file = load_quota_file(&quota_config)?;

        let mut cfg = Self::from_raw(quota_config, raw_env, raw_file);

        // 命令行覆盖：-debug <level>
        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            if arg == "-debug"
                && let Some(v) = args.next()
            {
                cfg.debug = v;
            }
        }

        Ok(cfg)
    }

    fn from_raw(quota_config: PathBuf, env: RawEnv, file: Option<RawFile>) -> Self {
        let quota_file_found = file.is_some();
        let file = file.unwrap_or_default();
        let models = if file.models.is_empty() {
            default_models()
        } else {
            file.models
        };

        let candidates = parse_list(env.candidates.as_deref())
            .or(file.candidates.filter(|c| !c.is_empty()))
            .unwrap_or_else(|| models.iter().map(|m| m.model_id.clone()).collect());

        let policy = AdmissionPolicy {
            safety_factor: env
                .safety_factor
                .or(file.safety_factor)
                .unwrap_or(DEFAULT_SAFETY_FACTOR),
            min_tokens: env
                .min_tokens
                .or(file.min_tokens)
                .unwrap_or(DEFAULT_MIN_TOKENS),
            retry_backoff: env
                .retry_backoff_ms
                .or(file.retry_backoff_ms)
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_RETRY_BACKOFF),
        };

        let refill_interval = env
            .refill_interval_secs
            .or(file.refill_interval_secs)
            .filter(|s| *s > 0)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_REFILL_INTERVAL);

        Self {
            quota_config,
            quota_file_found,
            debug: env.debug.unwrap_or_else(|| "low".to_string()),
            log_json: env.log_json.unwrap_or(false),
            models,
            candidates,
            policy,
            refill_interval,
            worker_concurrency: env
                .worker_concurrency
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_WORKER_CONCURRENCY),
            generation_max_attempts: env
                .generation_max_attempts
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_GENERATION_MAX_ATTEMPTS),
            acquire_deadline: env
                .acquire_deadline_ms
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
            dry_run_pages: env.dry_run_pages.unwrap_or(DEFAULT_DRY_RUN_PAGES),
        }
    }

    pub fn log_level(&self) -> LogLevel {
        LogLevel::parse(&self.debug)
    }
}

/// 文件不存在时返回 None；此时 tracing 尚未初始化，由调用方在日志就绪后再报告。
fn load_quota_file(path: &Path) -> anyhow::Result<Option<RawFile>> {
    if !path.is_file() {
        return Ok(None);
    }
    Figment::from(Toml::file(path))
        .extract::<RawFile>()
        .map(Some)
        .with_context(|| format!("解析配额文件失败: {}", path.display()))
}

fn parse_list(value: Option<&str>) -> Option<Vec<String>> {
    let out: Vec<String> = value?
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect();
    if out.is_empty() { None } else { Some(out) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_file(toml: &str) -> RawFile {
        Figment::from(Toml::string(toml)).extract().unwrap()
    }

    #[test]
    fn quota_file_models_and_policy() {
        let file = parse_file(
            r#"
            safety_factor = 1.5
            retry_backoff_ms = 250
            candidates = ["b", "a"]

            [[models]]
            model_id = "a"
            requests_per_minute = 10
            tokens_per_minute = 250000
            requests_per_day = 500

            [[models]]
            id = "b"
            rpm = 5
            tpm = 1000
            rpd = 20
            "#,
        );
        let cfg = Config::from_raw(PathBuf::from("q.toml"), RawEnv::default(), Some(file));

        assert_eq!(
            cfg.models,
            vec![
                ModelQuotaConfig::new("a", 10, 250_000, 500),
                ModelQuotaConfig::new("b", 5, 1000, 20),
            ]
        );
        assert_eq!(cfg.candidates, vec!["b".to_string(), "a".to_string()]);
        assert_eq!(cfg.policy.safety_factor, 1.5);
        assert_eq!(cfg.policy.min_tokens, DEFAULT_MIN_TOKENS);
        assert_eq!(cfg.policy.retry_backoff, Duration::from_millis(250));
        assert_eq!(cfg.refill_interval, DEFAULT_REFILL_INTERVAL);
        assert!(cfg.quota_file_found);
        assert_eq!(cfg.acquire_deadline, None);
    }

    #[test]
    fn env_overrides_file_and_defaults_fill_gaps() {
        let env = RawEnv {
            candidates: Some(" x , ,y ".to_string()),
            safety_factor: Some(1.1),
            refill_interval_secs: Some(0),
            worker_concurrency: Some(0),
            acquire_deadline_ms: Some(2500),
            ..RawEnv::default()
        };
        let file = parse_file("safety_factor = 2.0\nmin_tokens = 10");
        let cfg = Config::from_raw(PathBuf::from("q.toml"), env, Some(file));

        assert_eq!(cfg.models, default_models());
        assert_eq!(cfg.candidates, vec!["x".to_string(), "y".to_string()]);
        assert_eq!(cfg.policy.safety_factor, 1.1);
        assert_eq!(cfg.policy.min_tokens, 10);
        assert_eq!(cfg.refill_interval, DEFAULT_REFILL_INTERVAL);
        assert_eq!(cfg.worker_concurrency, DEFAULT_WORKER_CONCURRENCY);
        assert_eq!(cfg.log_level(), LogLevel::Low);
        assert_eq!(cfg.acquire_deadline, Some(Duration::from_millis(2500)));
    }

    #[test]
    fn zero_acquire_deadline_means_wait_forever() {
        let env = RawEnv {
            acquire_deadline_ms: Some(0),
            ..RawEnv::default()
        };
        let cfg = Config::from_raw(PathBuf::new(), env, None);
        assert_eq!(cfg.acquire_deadline, None);
    }

    #[test]
    fn candidates_default_to_model_order() {
        let cfg = Config::from_raw(PathBuf::new(), RawEnv::default(), None);
        assert_eq!(
            cfg.candidates,
            default_models()
                .into_iter()
                .map(|m| m.model_id)
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn missing_quota_file_is_not_an_error() {
        let path = PathBuf::from("./definitely-missing-quota.toml");
        let raw = load_quota_file(&path).unwrap();
        assert!(raw.is_none());

        let cfg = Config::from_raw(path, RawEnv::default(), raw);
        assert!(!cfg.quota_file_found);
        assert_eq!(cfg.models, default_models());
    }
}
