//! Truncating reshapers.
//!
//! Dropped candidates are masked to `-inf` rather than cut from the array, so
//! logit rules further down the pipeline can still find every token.

use derivative::Derivative;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use super::{SampleContext, Sampler};
use crate::{token::TokenDataArray, Result};

/// Masks every live entry after the first `keep` of a sorted array.
fn mask_tail(candidates: &mut TokenDataArray, keep: usize) {
    let slice = candidates.as_mut_slice();
    let keep = keep.max(1);
    if keep >= slice.len() {
        return;
    }
    for data in &mut slice[keep..] {
        data.logit = f32::NEG_INFINITY;
        data.p = 0.0;
    }
}

/// Sorts and softmaxes the live entries, returning how many are not masked.
fn prepare(candidates: &mut TokenDataArray) -> usize {
    candidates.sort();
    candidates.softmax();
    candidates
        .iter()
        .position(|x| x.logit == f32::NEG_INFINITY)
        .unwrap_or(candidates.len())
}

#[derive(Debug, Clone, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct TopK {
    #[derivative(Default(value = "40"))]
    pub k: usize,
}

impl TopK {
    pub fn apply(&self, candidates: &mut TokenDataArray) {
        if self.k == 0 || self.k >= candidates.len() {
            return;
        }
        candidates.sort();
        mask_tail(candidates, self.k);
    }
}

impl Sampler for TopK {
    fn transform(&mut self, context: &mut SampleContext) -> Result<()> {
        self.apply(context.candidates);
        Ok(())
    }
}

#[derive(Debug, Clone, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct TopP {
    #[derivative(Default(value = "0.95"))]
    pub p: f32,
    #[derivative(Default(value = "1"))]
    pub min_keep: usize,
}

impl Sampler for TopP {
    fn transform(&mut self, context: &mut SampleContext) -> Result<()> {
        if self.p >= 1.0 {
            return Ok(());
        }
        let live = prepare(context.candidates);
        let mut cum = 0.0;
        let mut keep = live;
        for (index, data) in context.candidates.iter().take(live).enumerate() {
            cum += data.p;
            if cum >= self.p && index + 1 >= self.min_keep {
                keep = index + 1;
                break;
            }
        }
        mask_tail(context.candidates, keep);
        Ok(())
    }
}

#[derive(Debug, Clone, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct MinP {
    #[derivative(Default(value = "0.05"))]
    pub p: f32,
    #[derivative(Default(value = "1"))]
    pub min_keep: usize,
}

impl Sampler for MinP {
    fn transform(&mut self, context: &mut SampleContext) -> Result<()> {
        if self.p <= 0.0 {
            return Ok(());
        }
        let live = prepare(context.candidates);
        let Some(top) = context.candidates.top() else {
            return Ok(());
        };
        let threshold = top.p * self.p;
        let keep = context
            .candidates
            .iter()
            .take(live)
            .take_while(|x| x.p >= threshold)
            .count()
            .max(self.min_keep);
        mask_tail(context.candidates, keep);
        Ok(())
    }
}

/// Tail free sampling: cuts where the curvature of the sorted distribution flattens.
#[derive(Debug, Clone, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct TailFree {
    #[derivative(Default(value = "1.0"))]
    pub z: f32,
    #[derivative(Default(value = "1"))]
    pub min_keep: usize,
}

impl TailFree {
    pub fn apply(&self, candidates: &mut TokenDataArray) {
        if self.z >= 1.0 || candidates.len() <= 2 {
            return;
        }
        let live = prepare(candidates);
        if live <= 2 {
            return;
        }

        let probs = candidates.iter().take(live).map(|x| x.p).collect_vec();
        let first = probs.windows(2).map(|w| w[0] - w[1]).collect_vec();
        let second = first.windows(2).map(|w| (w[0] - w[1]).abs()).collect_vec();
        let sum: f32 = second.iter().sum();
        if sum <= 0.0 {
            return;
        }

        let mut cum = 0.0;
        let mut keep = live;
        for (index, value) in second.iter().enumerate() {
            cum += value / sum;
            if cum > self.z && index >= self.min_keep {
                keep = index;
                break;
            }
        }
        mask_tail(candidates, keep);
    }
}

impl Sampler for TailFree {
    fn transform(&mut self, context: &mut SampleContext) -> Result<()> {
        self.apply(context.candidates);
        Ok(())
    }
}

/// Locally typical sampling: keeps the tokens whose surprise is closest to the entropy.
#[derive(Debug, Clone, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct Typical {
    #[derivative(Default(value = "0.95"))]
    pub p: f32,
    #[derivative(Default(value = "1"))]
    pub min_keep: usize,
}

impl Sampler for Typical {
    fn transform(&mut self, context: &mut SampleContext) -> Result<()> {
        if self.p >= 1.0 {
            return Ok(());
        }
        let candidates = &mut *context.candidates;
        let live = prepare(candidates);

        let entropy: f32 = candidates
            .iter()
            .take(live)
            .filter(|x| x.p > 0.0)
            .map(|x| -x.p * x.p.ln())
            .sum();
        let mut scored = candidates
            .iter()
            .take(live)
            .enumerate()
            .map(|(index, x)| {
                let surprise = match x.p > 0.0 {
                    true => -x.p.ln(),
                    false => f32::INFINITY,
                };
                ((surprise - entropy).abs(), index)
            })
            .collect_vec();
        scored.sort_unstable_by(|x, y| x.0.total_cmp(&y.0));

        let slice = candidates.as_slice();
        let mut cum = 0.0;
        let mut keep = scored.len();
        for (count, (_, index)) in scored.iter().enumerate() {
            cum += slice[*index].p;
            if cum > self.p && count + 1 >= self.min_keep {
                keep = count + 1;
                break;
            }
        }

        let mut dropped = vec![false; candidates.len()];
        for (_, index) in &scored[keep..] {
            dropped[*index] = true;
        }
        if dropped.iter().any(|&x| x) {
            for (data, _) in candidates
                .as_mut_slice()
                .iter_mut()
                .zip(dropped)
                .filter(|(_, dropped)| *dropped)
            {
                data.logit = f32::NEG_INFINITY;
                data.p = 0.0;
            }
            candidates.invalidate();
        }
        Ok(())
    }
}
