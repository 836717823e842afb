use derivative::Derivative;
use serde::{Deserialize, Serialize};

use super::{select, TargetHistory, TargetedParams};
use crate::{
    sampler::{SampleContext, Selector},
    token::{TokenDataArray, TokenId},
    Result,
};

const BISECT_STEPS: usize = 32;

#[derive(Debug, Clone, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct TargetedTemperatureParams {
    #[serde(flatten)]
    pub targeted: TargetedParams,
    #[derivative(Default(value = "0.1"))]
    pub min_temp: f32,
    #[derivative(Default(value = "2.0"))]
    pub max_temp: f32,
}

/// Picks the temperature whose top probability equals the next target.
#[derive(Debug, Clone)]
pub struct TargetedTemperature {
    pub params: TargetedTemperatureParams,
    pub history: TargetHistory,
}

impl TargetedTemperature {
    pub fn new(params: TargetedTemperatureParams) -> Self {
        let history = params.targeted.history();
        Self { params, history }
    }
}

/// Top probability of `softmax(logits / temperature)`.
fn top_probability(logits: &[f32], temperature: f32) -> f32 {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let sum: f32 = logits
        .iter()
        .map(|x| ((x - max) / temperature).exp())
        .sum();
    1.0 / sum
}

/// Bisects `[min, max]` for the temperature at which `measure` hits `goal`.
/// `measure` must be monotonic in temperature; `rising` gives its direction.
pub(super) fn bisect(
    min: f32,
    max: f32,
    goal: f32,
    rising: bool,
    measure: impl Fn(f32) -> f32,
) -> f32 {
    let below = |t: f32| (measure(t) < goal) == rising;
    if !below(min) {
        return min;
    }
    if below(max) {
        return max;
    }
    let (mut lo, mut hi) = (min, max);
    for _ in 0..BISECT_STEPS {
        let mid = 0.5 * (lo + hi);
        match below(mid) {
            true => lo = mid,
            false => hi = mid,
        }
    }
    0.5 * (lo + hi)
}

pub(super) fn apply_temperature(candidates: &mut TokenDataArray, temperature: f32) {
    for data in candidates.as_mut_slice() {
        data.logit /= temperature;
    }
}

impl Selector for TargetedTemperature {
    fn sample(&mut self, context: &mut SampleContext) -> Result<TokenId> {
        let TargetedTemperatureParams {
            targeted,
            min_temp,
            max_temp,
        } = &self.params;
        select(targeted, &mut self.history, context, |candidates, target| {
            let logits: Vec<f32> = candidates.iter().map(|x| x.logit).collect();
            let temperature = bisect(*min_temp, *max_temp, target, false, |t| {
                top_probability(&logits, t)
            });
            log::trace!("[targeted][temperature: {temperature}]");
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
    fn bisected_temperature_hits_target() {
        let logits = [3.0, 2.0, 1.0, 0.0];
        let temperature = bisect(0.1, 10.0, 0.5, false, |t| top_probability(&logits, t));
        assert!((top_probability(&logits, temperature) - 0.5).abs() < 1e-3);
    }

    #[test]
    fn unreachable_targets_clamp_to_bounds() {
        let logits = [3.0, 2.0, 1.0, 0.0];
        // sharper than the coldest allowed temperature
        assert_eq!(bisect(1.0, 2.0, 0.99, false, |t| top_probability(&logits, t)), 1.0);
        // flatter than the hottest allowed temperature
        assert_eq!(bisect(0.5, 1.0, 0.26, false, |t| top_probability(&logits, t)), 1.0);
    }
}
