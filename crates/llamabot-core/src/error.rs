use thiserror::Error;

use crate::{logit::LogitRuleKey, token::TokenId};

#[derive(Error, Debug)]
pub enum Error {
    /// A generation is already in flight on this context.
    #[error("context is already processing")]
    Busy,

    #[error("out of context: capacity {capacity}, requested {requested}")]
    OutOfContext { capacity: usize, requested: usize },

    /// Synchronizer or buffer logic is broken; never a user condition.
    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("native backend: {0}")]
    Backend(String),

    #[error("token {0} not found in candidates")]
    NotFound(TokenId),

    #[error("duplicate logit rule {0:?}")]
    DuplicateRule(LogitRuleKey),

    #[error("invalid sampler sets: {0}")]
    InvalidSamplerSets(String),

    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    #[error("worker disconnected")]
    Disconnected,

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn invariant(message: impl Into<String>) -> Self {
        let message = message.into();
        log::error!("[invariant] {message}");
        Self::Invariant(message)
    }

    /// Errors after which the cache mirror can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Invariant(_) | Self::Backend(_) | Self::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
