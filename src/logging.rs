use tracing_subscriber::EnvFilter;

const CRATE_TARGET: &str = "quizgen_scheduler";

/// 日志等级（DEBUG 环境变量 / -debug 参数）：
/// - off：完全关闭日志
/// - low：本项目 info（启动、跨日重置、生成失败等）
/// - medium：本项目 debug（每次预留、进入等待、每轮补充后的余额）
/// - high：本项目 trace
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Low = 1,
    Medium = 2,
    High = 3,
}

impl LogLevel {
    pub fn parse(debug: &str) -> Self {
        match debug.trim().to_lowercase().as_str() {
            "off" | "none" => Self::Off,
            "medium" | "debug" => Self::Medium,
            "high" | "all" | "trace" => Self::High,
            _ => Self::Low,
        }
    }

    fn crate_directive(self) -> Option<&'static str> {
        match self {
            Self::Off => None,
            Self::Low => Some("info"),
            Self::Medium => Some("debug"),
            Self::High => Some("trace"),
        }
    }

    /// 过滤规则：依赖库默认 warn；RUST_LOG 已显式指定本项目时尊重 RUST_LOG。
    pub fn directives(self, rust_log: &str) -> String {
        let Some(level) = self.crate_directive() else {
            return "off".to_string();
        };
        let rust_log = rust_log.trim();
        if rust_log.is_empty() {
            format!("warn,{CRATE_TARGET}={level}")
        } else if rust_log.contains(CRATE_TARGET) {
            rust_log.to_string()
        } else {
            format!("{rust_log},{CRATE_TARGET}={level}")
        }
    }
}

/// 初始化全局 tracing subscriber；重复调用时静默忽略。
pub fn init_tracing(level: LogLevel, json: bool) {
    let env = std::env::var("RUST_LOG").unwrap_or_default();
    let filter = EnvFilter::new(level.directives(&env));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true);

    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
