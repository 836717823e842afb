use derivative::Derivative;
use serde::{Deserialize, Serialize};

use super::{
    select,
    temperature::{apply_temperature, bisect},
    TargetHistory, TargetedParams,
};
use crate::{
    sampler::{SampleContext, Selector},
    token::TokenId,
    Result,
};

#[derive(Debug, Clone, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct TargetedEntropyParams {
    #[serde(flatten)]
    pub targeted: TargetedParams,
    #[derivative(Default(value = "0.1"))]
    pub min_temp: f32,
    #[derivative(Default(value = "2.0"))]
    pub max_temp: f32,
}

/// Picks the temperature whose distribution entropy equals `-ln(target)`.
#[derive(Debug, Clone)]
pub struct TargetedEntropy {
    pub params: TargetedEntropyParams,
    pub history: TargetHistory,
}

impl TargetedEntropy {
    pub fn new(params: TargetedEntropyParams) -> Self {
        let history = params.targeted.history();
        Self { params, history }
    }
}

/// Entropy in nats of `softmax(logits / temperature)`.
fn entropy(logits: &[f32], temperature: f32) -> f32 {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let weights: Vec<f32> = logits
        .iter()
        .map(|x| ((x - max) / temperature).exp())
        .collect();
    let sum: f32 = weights.iter().sum();
    weights
        .iter()
        .map(|w| w / sum)
        .filter(|&p| p > 0.0)
        .map(|p| -p * p.ln())
        .sum()
}

impl Selector for TargetedEntropy {
    fn sample(&mut self, context: &mut SampleContext) -> Result<TokenId> {
        let TargetedEntropyParams {
            targeted,
            min_temp,
            max_temp,
        } = &self.params;
        select(targeted, &mut self.history, context, |candidates, target| {
            let logits: Vec<f32> = candidates.iter().map(|x| x.logit).collect();
            let goal = -target.max(f32::MIN_POSITIVE).ln();
            let temperature = bisect(*min_temp, *max_temp, goal, true, |t| entropy(&logits, t));
            log::trace!("[targeted][entropy: {goal}][temperature: {temperature}]");
            apply_temperature(candidates, temperature);
        })
    }

    fn reset(&mut self) {
        self.history.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entropy_rises_with_temperature() {
        let logits = [2.0, 1.0, 0.5, 0.0];
        assert!(entropy(&logits, 0.5) < entropy(&logits, 1.0));
        assert!(entropy(&logits, 1.0) < entropy(&logits, 4.0));
    }

    #[test]
    fn bisected_entropy_hits_goal() {
        let logits = [2.0, 1.0, 0.5, 0.0];
        let goal = -(0.5f32).ln();
        let temperature = bisect(0.05, 10.0, goal, true, |t| entropy(&logits, t));
        assert!((entropy(&logits, temperature) - goal).abs() < 1e-3);
    }
}
