//! Chat inference runtime over a native LLM backend: a mirrored KV cache kept in
//! sync with the desired token buffer, keyed logit rules, and switchable
//! sampler sets.

pub mod backend;
pub mod context;
pub mod error;
pub mod kv;
pub mod logit;
pub mod sampler;
pub mod split;
pub mod template;
pub mod token;
pub mod worker;

pub use context::{
    ChatContext, ChatResponse, ChatSettings, ContextState, FinishReason, OverflowPolicy,
    TokenCounter,
};
pub use error::{Error, Result};
pub use template::{ChatMessage, ChatTemplate};
pub use token::{Token, TokenId, TokenMask};
pub use worker::{ChatHandle, Generation};
