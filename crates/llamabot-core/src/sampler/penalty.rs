use std::collections::HashMap;

use derivative::Derivative;
use serde::{Deserialize, Serialize};

use super::{SampleContext, Sampler};
use crate::{
    token::{TokenId, TokenMask},
    Result,
};

#[derive(Debug, Clone, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct Repetition {
    /// Divides positive logits and multiplies negative ones of every repeated token.
    #[derivative(Default(value = "1.1"))]
    pub penalty: f32,
    #[derivative(Default(value = "0.0"))]
    pub presence: f32,
    #[derivative(Default(value = "0.0"))]
    pub frequency: f32,
    /// Weight of an occurrence is `decay^distance` from the end of the buffer.
    #[derivative(Default(value = "1.0"))]
    pub decay: f32,
    /// How many live tokens to look back; zero means the whole buffer.
    #[derivative(Default(value = "64"))]
    pub window: usize,
    /// Only tokens whose provenance intersects this mask are counted.
    #[derivative(Default(value = "TokenMask::BOT | TokenMask::USER"))]
    pub mask: TokenMask,
}

impl Repetition {
    fn penalties(&self, context: &SampleContext) -> HashMap<TokenId, f32> {
        let window = match self.window {
            0 => context.history.len(),
            x => x.min(context.history.len()),
        };
        let mut penalties = HashMap::new();
        for (index, token) in context.history.iter().rev().take(window).enumerate() {
            if token.is_null() || !token.token.mask.intersects(self.mask) {
                continue;
            }
            let penalty = penalties.entry(token.id()).or_insert(self.presence);
            *penalty += self.frequency * self.decay.powf(index as f32);
        }
        penalties
    }
}

impl Sampler for Repetition {
    fn transform(&mut self, context: &mut SampleContext) -> Result<()> {
        let penalties = self.penalties(context);
        if penalties.is_empty() {
            return Ok(());
        }
        for (token, penalty) in penalties {
            let Some(index) = context.candidates.find(token) else {
                continue;
            };
            let data = &mut context.candidates.as_mut_slice()[index];
            if data.logit == f32::NEG_INFINITY {
                continue;
            }
            data.logit = match data.logit > 0.0 {
                true => data.logit / self.penalty,
                false => data.logit * self.penalty,
            };
            data.logit -= penalty;
        }
        context.candidates.invalidate();
        Ok(())
    }
}
