use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("配置错误: {0}")]
    Config(String),

    /// 候选列表里没有任何已配置的模型（含空列表）。
    #[error("候选模型均未配置: {0:?}")]
    NoKnownCandidate(Vec<String>),

    /// 已知候选的配额上限都小于本次需要的量，永远无法放行。
    #[error("候选模型容量不足以容纳 {tokens_needed} tokens: {candidates:?}")]
    Unsatisfiable {
        tokens_needed: u64,
        candidates: Vec<String>,
    },

    #[error("等待配额超时（{0:?}）")]
    DeadlineExceeded(Duration),

    #[error("生成失败: {0:#}")]
    Generation(#[source] anyhow::Error),
}

impl SchedulerError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn no_known_candidate(candidates: &[impl AsRef<str>]) -> Self {
        Self::NoKnownCandidate(
            candidates
                .iter()
                .map(|c| AsRef::<str>::as_ref(c).to_string())
                .collect(),
        )
    }

    pub fn unsatisfiable(tokens_needed: u64, candidates: &[impl AsRef<str>]) -> Self {
        Self::Unsatisfiable {
            tokens_needed,
            candidates: candidates
                .iter()
                .map(|c| AsRef::<str>::as_ref(c).to_string())
                .collect(),
        }
    }

    /// 是否可以通过稍后重试恢复（仅超时属于此类）。
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::DeadlineExceeded(_))
    }
}
