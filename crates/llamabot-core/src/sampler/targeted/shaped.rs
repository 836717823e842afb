use derivative::Derivative;
use serde::{Deserialize, Serialize};

use super::{select, TargetHistory, TargetedParams};
use crate::{
    sampler::{SampleContext, Selector},
    token::{TokenDataArray, TokenId},
    Result,
};

#[derive(Debug, Clone, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct GaussianParams {
    #[serde(flatten)]
    pub targeted: TargetedParams,
    #[derivative(Default(value = "0.2"))]
    pub width: f32,
}

#[derive(Debug, Clone, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct PowerLawParams {
    #[serde(flatten)]
    pub targeted: TargetedParams,
    #[derivative(Default(value = "0.2"))]
    pub width: f32,
    #[derivative(Default(value = "2.0"))]
    pub tail_heaviness: f32,
}

#[derive(Debug, Clone, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct UnboundedQuadraticParams {
    #[serde(flatten)]
    pub targeted: TargetedParams,
    #[derivative(Default(value = "0.2"))]
    pub width: f32,
    #[derivative(Default(value = "10.0"))]
    pub sharpness: f32,
}

/// How a candidate's logit falls off with its distance from the target probability.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Shape {
    Gaussian { width: f32 },
    PowerLaw { width: f32, tail_heaviness: f32 },
    /// Quadratic within one width of the target, linear beyond.
    UnboundedQuadratic { width: f32, sharpness: f32 },
}

impl Shape {
    pub fn width(&self) -> f32 {
        match *self {
            Shape::Gaussian { width }
            | Shape::PowerLaw { width, .. }
            | Shape::UnboundedQuadratic { width, .. } => width,
        }
    }

    pub fn logit(&self, distance: f32) -> f32 {
        match *self {
            Shape::Gaussian { width } => -(distance * distance) / (2.0 * width * width),
            Shape::PowerLaw {
                width,
                tail_heaviness,
            } => {
                let x = distance / width;
                -tail_heaviness * (1.0 + x * x).ln()
            }
            Shape::UnboundedQuadratic { width, sharpness } => {
                let x = distance / width;
                match x <= 1.0 {
                    true => -sharpness * 0.5 * x * x,
                    false => -sharpness * (x - 0.5),
                }
            }
        }
    }

    /// Rewrites every live logit from the distance of its probability to `target`.
    pub fn reshape(&self, candidates: &mut TokenDataArray, target: f32) {
        if self.width() <= f32::EPSILON {
            let closest = candidates
                .iter()
                .min_by(|x, y| (x.p - target).abs().total_cmp(&(y.p - target).abs()))
                .map(|x| x.id);
            for data in candidates.as_mut_slice() {
                if Some(data.id) != closest {
                    data.logit = f32::NEG_INFINITY;
                }
            }
        } else {
            for data in candidates.as_mut_slice() {
                data.logit = self.logit((data.p - target).abs());
            }
        }
        candidates.invalidate();
    }
}

/// Gaussian, power-law and unbounded-quadratic targeted selectors.
#[derive(Debug, Clone)]
pub struct ShapedTargeted {
    pub params: TargetedParams,
    pub shape: Shape,
    pub history: TargetHistory,
}

impl ShapedTargeted {
    pub fn new(params: TargetedParams, shape: Shape) -> Self {
        let history = params.history();
        Self {
            params,
            shape,
            history,
        }
    }

    pub fn gaussian(params: GaussianParams) -> Self {
        let GaussianParams { targeted, width } = params;
        Self::new(targeted, Shape::Gaussian { width })
    }

    pub fn power_law(params: PowerLawParams) -> Self {
        let PowerLawParams {
            targeted,
            width,
            tail_heaviness,
        } = params;
        Self::new(
            targeted,
            Shape::PowerLaw {
                width,
                tail_heaviness,
            },
        )
    }

    pub fn unbounded_quadratic(params: UnboundedQuadraticParams) -> Self {
        let UnboundedQuadraticParams {
            targeted,
            width,
            sharpness,
        } = params;
        Self::new(targeted, Shape::UnboundedQuadratic { width, sharpness })
    }
}

impl Selector for ShapedTargeted {
    fn sample(&mut self, context: &mut SampleContext) -> Result<TokenId> {
        let shape = self.shape;
        select(&self.params, &mut self.history, context, |candidates, target| {
            shape.reshape(candidates, target)
        })
    }

    fn reset(&mut self) {
        self.history.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Vocabulary;

    fn distribution(probs: &[f32]) -> TokenDataArray {
        let logits: Vec<f32> = probs.iter().map(|p| p.ln()).collect();
        let mut candidates = TokenDataArray::from_logits(&logits);
        candidates.softmax();
        candidates
    }

    #[test]
    fn zero_width_picks_closest() {
        let mut candidates = distribution(&[0.6, 0.3, 0.1]);
        Shape::Gaussian { width: 0.0 }.reshape(&mut candidates, 0.25);
        candidates.prune_masked();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates.top().map(|x| x.id), Some(1));
    }

    #[test]
    fn shapes_peak_at_target() {
        for shape in [
            Shape::Gaussian { width: 0.1 },
            Shape::PowerLaw {
                width: 0.1,
                tail_heaviness: 2.0,
            },
            Shape::UnboundedQuadratic {
                width: 0.1,
                sharpness: 5.0,
            },
        ] {
            let mut candidates = distribution(&[0.6, 0.3, 0.1]);
            shape.reshape(&mut candidates, 0.3);
            assert_eq!(candidates.top().map(|x| x.id), Some(1), "{shape:?}");
        }
    }

    #[test]
    fn quadratic_is_unbounded() {
        let shape = Shape::UnboundedQuadratic {
            width: 0.1,
            sharpness: 1.0,
        };
        assert!(shape.logit(10.0) < shape.logit(1.0));
        assert!((shape.logit(0.1) - (-0.5)).abs() < 1e-6);
    }

    #[test]
    fn zero_width_selector_is_deterministic() {
        let mut selector = ShapedTargeted::gaussian(GaussianParams {
            targeted: TargetedParams {
                target: 0.3,
                ..Default::default()
            },
            width: 0.0,
        });
        let vocab = Vocabulary::default();
        for seed in 0..4 {
            let mut candidates = distribution(&[0.6, 0.3, 0.1]);
            let original = candidates.clone();
            let mut rng = fastrand::Rng::with_seed(seed);
            let mut context = SampleContext {
                candidates: &mut candidates,
                original: &original,
                history: &[],
                vocab: &vocab,
                rng: &mut rng,
            };
            selector.history.clear();
            assert_eq!(selector.sample(&mut context).unwrap(), 1);
        }
    }
}
