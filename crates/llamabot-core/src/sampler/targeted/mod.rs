//! Selectors that steer the running average probability of accepted tokens
//! toward a configured target.
//!
//! Every selector here keeps a [`TargetHistory`] and shares the same step:
//! the greedy bypass check, pruning below `min_probability`, a selector-specific
//! reshape around the next target, and a stochastic draw.

use std::collections::{HashMap, VecDeque};

use derivative::Derivative;
use serde::{Deserialize, Serialize};

use super::{sample_softmax, SampleContext};
use crate::{
    token::{TokenData, TokenDataArray, TokenId},
    Error, Result,
};

mod entropy;
mod shaped;
mod temperature;

pub use entropy::{TargetedEntropy, TargetedEntropyParams};
pub use shaped::{
    GaussianParams, PowerLawParams, Shape, ShapedTargeted, UnboundedQuadraticParams,
};
pub use temperature::{TargetedTemperature, TargetedTemperatureParams};

/// Feedback queue of accepted-token probabilities.
#[derive(Debug, Clone)]
pub struct TargetHistory {
    queue: VecDeque<f32>,
    capacity: usize,
    target: f32,
    min: f32,
    max: f32,
}

impl TargetHistory {
    pub fn new(capacity: usize, target: f32, min: f32, max: f32) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity),
            capacity,
            target,
            min,
            max,
        }
    }

    pub fn target(&self) -> f32 {
        self.target
    }

    pub fn queue(&self) -> &VecDeque<f32> {
        &self.queue
    }

    /// The probability the next accepted token should have so the window
    /// average lands on the target.
    pub fn next_target(&self) -> f32 {
        let n = self.queue.len();
        if n == 0 {
            return self.target;
        }
        let next = match n < self.capacity {
            true => self.target * (n + 1) as f32 - self.queue.iter().sum::<f32>(),
            false => self.target * self.capacity as f32 - self.queue.iter().skip(1).sum::<f32>(),
        };
        next.clamp(self.min, self.max)
    }

    pub fn push(&mut self, p: f32) {
        if self.capacity == 0 {
            return;
        }
        if self.queue.len() == self.capacity {
            self.queue.pop_front();
        }
        self.queue.push_back(p);
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

/// True when `piece` starts a new word after `previous`.
///
/// Empty pieces and pieces not led by a letter start a word, as does an
/// uppercase letter right after a lowercase one (a PascalCase boundary).
/// Everything else continues the word in progress.
pub fn is_new_word(previous: &str, piece: &str) -> bool {
    let Some(first) = piece.chars().next() else {
        return true;
    };
    if !first.is_alphabetic() {
        return true;
    }
    let Some(last) = previous.chars().last() else {
        return true;
    };
    first.is_uppercase() && last.is_lowercase()
}

/// Why a step skipped reshaping and returned the top token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bypass {
    Included,
    Probability,
    PreservedWord,
}

/// Greedy short-circuit ahead of the targeted reshape.
#[derive(Debug, Clone, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct TopOnly {
    /// Tokens that are always taken greedily when they are on top.
    pub include: Vec<TokenId>,
    /// Tokens that never bypass.
    pub exclude: Vec<TokenId>,
    #[derivative(Default(value = "1.0"))]
    pub max_probability: f32,
    /// Per-token overrides of `max_probability`.
    pub token_max_probability: HashMap<TokenId, f32>,
    /// Word continuations at or above this probability are taken greedily.
    #[derivative(Default(value = "1.0"))]
    pub preserve_words: f32,
    /// Whether bypasses caused by word preservation still feed the history.
    pub factor_preserved_words: bool,
}

impl TopOnly {
    pub fn check(&self, top: &TokenData, previous: &str, piece: &str) -> Option<Bypass> {
        if self.exclude.contains(&top.id) {
            return None;
        }
        if self.include.contains(&top.id) {
            return Some(Bypass::Included);
        }
        let max = self
            .token_max_probability
            .get(&top.id)
            .copied()
            .unwrap_or(self.max_probability);
        if top.p >= max {
            return Some(Bypass::Probability);
        }
        if top.p >= self.preserve_words && !is_new_word(previous, piece) {
            return Some(Bypass::PreservedWord);
        }
        None
    }

    /// Whether a bypass of this kind updates the feedback history.
    pub fn updates_history(&self, bypass: Bypass) -> bool {
        bypass == Bypass::PreservedWord && self.factor_preserved_words
    }
}

#[derive(Debug, Clone, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct TargetedParams {
    #[derivative(Default(value = "0.5"))]
    pub target: f32,
    #[derivative(Default(value = "10"))]
    pub queue_size: usize,
    #[derivative(Default(value = "0.0"))]
    pub min_target: f32,
    #[derivative(Default(value = "1.0"))]
    pub max_target: f32,
    /// Candidates below this probability are dropped before reshaping.
    #[derivative(Default(value = "0.0"))]
    pub min_probability: f32,
    pub top_only: TopOnly,
}

impl TargetedParams {
    pub fn history(&self) -> TargetHistory {
        TargetHistory::new(self.queue_size, self.target, self.min_target, self.max_target)
    }
}

/// One targeted step. `reshape` rewrites the live logits around the target.
pub(crate) fn select<F>(
    params: &TargetedParams,
    history: &mut TargetHistory,
    context: &mut SampleContext,
    reshape: F,
) -> Result<TokenId>
where
    F: FnOnce(&mut TokenDataArray, f32),
{
    let previous = context.recent_text(1);
    let vocab = context.vocab;
    let original = context.original;
    let candidates = &mut *context.candidates;
    candidates.prune_masked();
    candidates.softmax();

    let Some(top) = candidates.top() else {
        return Err(Error::invariant("no candidates to select from"));
    };
    // thresholds and feedback work on the model's own probabilities
    let top = TokenData {
        p: original.get(top.id)?.p,
        ..top
    };
    if let Some(bypass) = params.top_only.check(&top, &previous, vocab.piece(top.id)) {
        if params.top_only.updates_history(bypass) {
            history.push(top.p);
        }
        log::trace!("[targeted][bypass: {bypass:?}][token: {}]", top.id);
        return Ok(top.id);
    }

    if params.min_probability > 0.0 {
        for data in candidates.as_mut_slice().iter_mut().skip(1) {
            if data.p < params.min_probability {
                data.logit = f32::NEG_INFINITY;
            }
        }
        candidates.prune_masked();
    }

    let target = history.next_target();
    reshape(candidates, target);
    candidates.prune_masked();
    let token = sample_softmax(candidates, context.rng);

    let p = original.get(token)?.p;
    history.push(p);
    log::trace!("[targeted][target: {target}][token: {token}][p: {p}]");
    Ok(token)
}
