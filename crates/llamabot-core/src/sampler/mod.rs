use crate::{
    backend::Vocabulary,
    token::{SequencedToken, TokenDataArray, TokenId},
    Result,
};

pub mod blocker;
pub mod filter;
pub mod greedy;
pub mod mirostat;
pub mod penalty;
pub mod registry;
pub mod set;
pub mod targeted;
pub mod temperature;

pub use registry::{SamplerConfig, SamplerRegistry};
pub use set::{SamplerSet, SamplerSetConfig, SamplerSetStack, SamplerStackPolicy};

/// Everything a sampler may look at during one step.
pub struct SampleContext<'a> {
    /// The distribution being reshaped.
    pub candidates: &'a mut TokenDataArray,
    /// The raw model distribution of this step with probabilities, in id order.
    pub original: &'a TokenDataArray,
    /// Live tokens of the context buffer, oldest first.
    pub history: &'a [SequencedToken],
    pub vocab: &'a Vocabulary,
    pub rng: &'a mut fastrand::Rng,
}

impl SampleContext<'_> {
    /// Text of the most recent live tokens, at least `chars` long when available.
    pub fn recent_text(&self, chars: usize) -> String {
        let mut pieces = Vec::new();
        let mut len = 0;
        for token in self.history.iter().rev() {
            if len >= chars {
                break;
            }
            len += token.token.value.chars().count();
            pieces.push(token.token.value.as_str());
        }
        pieces.into_iter().rev().collect()
    }
}

/// Reshapes the candidate distribution.
pub trait Sampler: Send {
    /// Update the candidate logits in place.
    fn transform(&mut self, context: &mut SampleContext) -> Result<()>;
}

/// Emits the final token of a step.
pub trait Selector: Send {
    /// Select one token from the distribution, and also update the state.
    fn sample(&mut self, context: &mut SampleContext) -> Result<TokenId>;
    /// Drop any running state accumulated across steps.
    fn reset(&mut self) {}
}

/// Softmax the live candidates and draw one of them.
pub(crate) fn sample_softmax(candidates: &mut TokenDataArray, rng: &mut fastrand::Rng) -> TokenId {
    candidates.softmax();
    let rand = rng.f32();
    candidates
        .pick(rand)
        .or_else(|| candidates.top())
        .map(|x| x.id)
        .unwrap_or_default()
}
