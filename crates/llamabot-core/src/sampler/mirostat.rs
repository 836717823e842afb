use derivative::Derivative;
use serde::{Deserialize, Serialize};

use super::{sample_softmax, temperature::Temperature, SampleContext, Selector};
use crate::{
    token::{TokenDataArray, TokenId},
    Result,
};

#[derive(Debug, Clone, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct MirostatParams {
    #[derivative(Default(value = "3.0"))]
    pub tau: f32,
    #[derivative(Default(value = "0.1"))]
    #[serde(alias = "learning_rate")]
    pub eta: f32,
    /// Number of top candidates used to estimate the Zipf exponent (v1 only).
    #[derivative(Default(value = "100"))]
    pub m: usize,
    /// Applied before truncation (v2 only).
    #[derivative(Default(value = "1.0"))]
    pub temperature: f32,
}

#[derive(Debug, Clone, Default)]
pub struct MirostatState {
    pub mu: f32,
}

impl MirostatState {
    fn new(params: &MirostatParams) -> Self {
        Self {
            mu: params.tau * 2.0,
        }
    }

    /// Moves `mu` against the surprise error of the selected token, capped at `4 * tau`.
    fn update(&mut self, params: &MirostatParams, candidates: &TokenDataArray, token: TokenId) {
        let p = candidates.get(token).map(|x| x.p).unwrap_or_default();
        if p <= 0.0 {
            return;
        }
        let surprise = -p.log2();
        self.mu -= params.eta * (surprise - params.tau);
        self.mu = self.mu.min(4.0 * params.tau);
    }
}

/// Mirostat v1: derives a top-k cutoff from the estimated Zipf exponent.
#[derive(Debug, Clone, Default)]
pub struct MirostatV1 {
    pub params: MirostatParams,
    pub state: MirostatState,
}

impl MirostatV1 {
    pub fn new(params: MirostatParams) -> Self {
        let state = MirostatState::new(&params);
        Self { params, state }
    }

    fn zipf_exponent(&self, candidates: &TokenDataArray) -> f32 {
        let m = self.params.m.min(candidates.len());
        let probs = candidates.as_slice();
        let (mut sum_ti_bi, mut sum_ti_sq) = (0.0, 0.0);
        for i in 0..m.saturating_sub(1) {
            if probs[i + 1].p <= 0.0 {
                break;
            }
            let t_i = ((i + 2) as f32 / (i + 1) as f32).ln();
            let b_i = (probs[i].p / probs[i + 1].p).ln();
            sum_ti_bi += t_i * b_i;
            sum_ti_sq += t_i * t_i;
        }
        match sum_ti_sq > 0.0 {
            true => sum_ti_bi / sum_ti_sq,
            false => 1.0,
        }
    }
}

impl Selector for MirostatV1 {
    fn sample(&mut self, context: &mut SampleContext) -> Result<TokenId> {
        let candidates = &mut *context.candidates;
        candidates.prune_masked();
        candidates.softmax();

        let n = candidates.len() as f32;
        let s_hat = self.zipf_exponent(candidates);
        let epsilon = s_hat - 1.0;
        let k = ((epsilon * 2f32.powf(self.state.mu)) / (1.0 - n.powf(-epsilon))).powf(1.0 / s_hat);
        let k = match k.is_finite() {
            true => (k.round() as usize).clamp(1, candidates.len()),
            false => candidates.len(),
        };
        candidates.truncate(k);

        let token = sample_softmax(candidates, context.rng);
        self.state.update(&self.params, candidates, token);
        log::trace!("[mirostat][v1][k: {k}][mu: {}]", self.state.mu);
        Ok(token)
    }

    fn reset(&mut self) {
        self.state = MirostatState::new(&self.params);
    }
}

/// Mirostat v2: truncates every candidate whose surprise exceeds `mu`.
#[derive(Debug, Clone, Default)]
pub struct MirostatV2 {
    pub params: MirostatParams,
    pub state: MirostatState,
}

impl MirostatV2 {
    pub fn new(params: MirostatParams) -> Self {
        let state = MirostatState::new(&params);
        Self { params, state }
    }
}

impl Selector for MirostatV2 {
    fn sample(&mut self, context: &mut SampleContext) -> Result<TokenId> {
        let candidates = &mut *context.candidates;
        Temperature {
            temperature: self.params.temperature,
        }
        .apply(candidates);
        candidates.prune_masked();
        candidates.softmax();

        let mu = self.state.mu;
        let k = candidates
            .iter()
            .position(|x| -x.p.log2() > mu)
            .unwrap_or(candidates.len());
        candidates.truncate(k);

        let token = sample_softmax(candidates, context.rng);
        self.state.update(&self.params, candidates, token);
        log::trace!("[mirostat][v2][k: {k}][mu: {}]", self.state.mu);
        Ok(token)
    }

    fn reset(&mut self) {
        self.state = MirostatState::new(&self.params);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Vocabulary;

    fn step(selector: &mut impl Selector, logits: &[f32], seed: u64) -> TokenId {
        let mut candidates = TokenDataArray::from_logits(logits);
        let mut original = candidates.clone();
        original.softmax();
        let vocab = Vocabulary::default();
        let mut rng = fastrand::Rng::with_seed(seed);
        let mut context = SampleContext {
            candidates: &mut candidates,
            original: &original,
            history: &[],
            vocab: &vocab,
            rng: &mut rng,
        };
        selector.sample(&mut context).unwrap()
    }

    #[test]
    fn mu_starts_at_twice_tau() {
        let selector = MirostatV2::new(MirostatParams::default());
        assert_eq!(selector.state.mu, 6.0);
    }

    #[test]
    fn v2_low_mu_is_greedy() {
        let mut selector = MirostatV2::new(MirostatParams {
            tau: 0.01,
            ..Default::default()
        });
        for seed in 0..8 {
            assert_eq!(step(&mut selector, &[1.0, 3.0, 0.5, 2.0], seed), 1);
        }
        assert!(selector.state.mu <= 4.0 * 0.01);
    }

    #[test]
    fn v1_picks_a_live_token() {
        let mut selector = MirostatV1::new(MirostatParams::default());
        let logits = [4.0, 3.0, 2.0, 1.0, f32::NEG_INFINITY];
        for seed in 0..8 {
            assert_ne!(step(&mut selector, &logits, seed), 4);
        }
        selector.reset();
        assert_eq!(selector.state.mu, 6.0);
    }

    #[test]
    fn v1_mu_stays_capped_on_certain_tokens() {
        let mut selector = MirostatV1::new(MirostatParams::default());
        for seed in 0..40 {
            assert_eq!(step(&mut selector, &[30.0, 0.0, 0.0], seed), 0);
        }
        assert!(selector.state.mu <= 4.0 * 3.0);
        assert!(selector.state.mu > 6.0);
    }
}
