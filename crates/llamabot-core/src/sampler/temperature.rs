use derivative::Derivative;
use serde::{Deserialize, Serialize};

use super::{
    filter::{TailFree, TopK},
    sample_softmax, SampleContext, Sampler, Selector,
};
use crate::{
    token::{TokenDataArray, TokenId},
    Result,
};

/// Divides every logit by `temperature`; zero or below collapses to the top token.
#[derive(Debug, Clone, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct Temperature {
    #[derivative(Default(value = "1.0"))]
    pub temperature: f32,
}

impl Temperature {
    pub fn apply(&self, candidates: &mut TokenDataArray) {
        if self.temperature == 1.0 {
            return;
        }
        if self.temperature <= 0.0 {
            candidates.sort();
            for data in candidates.as_mut_slice().iter_mut().skip(1) {
                data.logit = f32::NEG_INFINITY;
            }
            return;
        }
        for data in candidates.as_mut_slice() {
            data.logit /= self.temperature;
        }
    }
}

impl Sampler for Temperature {
    fn transform(&mut self, context: &mut SampleContext) -> Result<()> {
        self.apply(context.candidates);
        Ok(())
    }
}

/// Plain stochastic selection with optional top-k and tail free cuts.
#[derive(Debug, Clone, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct TemperatureSelector {
    #[derivative(Default(value = "1.0"))]
    pub temperature: f32,
    #[derivative(Default(value = "0"))]
    pub top_k: usize,
    #[derivative(Default(value = "1.0"))]
    pub tfs: f32,
}

impl Selector for TemperatureSelector {
    fn sample(&mut self, context: &mut SampleContext) -> Result<TokenId> {
        let candidates = &mut *context.candidates;
        TopK { k: self.top_k }.apply(candidates);
        TailFree {
            z: self.tfs,
            min_keep: 1,
        }
        .apply(candidates);
        Temperature {
            temperature: self.temperature,
        }
        .apply(candidates);
        candidates.prune_masked();
        Ok(sample_softmax(candidates, context.rng))
    }
}
