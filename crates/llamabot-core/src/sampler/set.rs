use std::collections::HashSet;

use derivative::Derivative;
use serde::{Deserialize, Serialize};

use super::{SampleContext, Sampler, SamplerConfig, SamplerRegistry, Selector};
use crate::{logit::LogitRuleCollection, token::TokenId, Error, Result};

/// What happens to the set stack when the buffer is rebuilt for a new response.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SamplerStackPolicy {
    /// Start again from the default set.
    #[default]
    Reset,
    /// Keep whatever set was active at the end of the last response.
    Persist,
    /// Re-derive the stack by scanning the rebuilt buffer for triggers.
    Replay,
}

#[derive(Debug, Clone, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct SamplerSetConfig {
    #[derivative(Default(value = "\"default\".into()"))]
    pub name: String,
    /// Token text that activates this set.
    pub push: Option<String>,
    /// Token text that leaves this set.
    pub pop: Option<String>,
    pub samplers: Vec<SamplerConfig>,
    #[derivative(Default(value = "SamplerConfig::new(\"Temperature\")"))]
    pub selector: SamplerConfig,
}

/// A named bundle of reshapers and one selector.
pub struct SamplerSet {
    pub name: String,
    pub push: Option<TokenId>,
    pub pop: Option<TokenId>,
    pub samplers: Vec<Box<dyn Sampler>>,
    pub selector: Box<dyn Selector>,
}

impl SamplerSet {
    /// Builds a set, resolving trigger text to single token ids with `resolve`.
    pub fn build(
        config: &SamplerSetConfig,
        registry: &SamplerRegistry,
        resolve: impl Fn(&str) -> Result<TokenId>,
    ) -> Result<Self> {
        let samplers = config
            .samplers
            .iter()
            .map(|x| registry.sampler(x))
            .collect::<Result<Vec<_>>>()?;
        let selector = registry.selector(&config.selector)?;
        let push = config.push.as_deref().map(&resolve).transpose()?;
        let pop = config.pop.as_deref().map(&resolve).transpose()?;
        Ok(Self {
            name: config.name.clone(),
            push,
            pop,
            samplers,
            selector,
        })
    }

    pub fn is_default(&self) -> bool {
        self.push.is_none() && self.pop.is_none()
    }

    /// One full sampling step: clamp snapshot, reshapers, rules, then the selector.
    pub fn sample(
        &mut self,
        rules: &mut LogitRuleCollection,
        context: &mut SampleContext,
    ) -> Result<TokenId> {
        context.candidates.softmax();
        rules.start_clamp(context.candidates)?;
        for sampler in self.samplers.iter_mut() {
            sampler.transform(context)?;
        }
        rules.apply_penalty(context.candidates)?;
        rules.apply_bias(context.candidates)?;
        rules.apply_clamp(context.candidates)?;
        self.selector.sample(context)
    }
}

/// Stack of active sampler sets driven by trigger tokens.
pub struct SamplerSetStack {
    sets: Vec<SamplerSet>,
    default: usize,
    stack: Vec<usize>,
}

impl SamplerSetStack {
    pub fn new(sets: Vec<SamplerSet>) -> Result<Self> {
        let defaults = sets
            .iter()
            .enumerate()
            .filter(|(_, set)| set.is_default())
            .map(|(index, _)| index)
            .collect::<Vec<_>>();
        let default = match defaults[..] {
            [index] => index,
            _ => {
                return Err(Error::InvalidSamplerSets(format!(
                    "expected exactly one default set, found {}",
                    defaults.len()
                )))
            }
        };

        let mut push = HashSet::new();
        let mut pop = HashSet::new();
        for set in &sets {
            if !set.is_default() && set.push.is_none() {
                return Err(Error::InvalidSamplerSets(format!(
                    "set `{}` has a pop trigger but no push trigger",
                    set.name
                )));
            }
            if let Some(id) = set.push {
                if !push.insert(id) {
                    return Err(Error::InvalidSamplerSets(format!("duplicate push token {id}")));
                }
            }
            if let Some(id) = set.pop {
                if !pop.insert(id) {
                    return Err(Error::InvalidSamplerSets(format!("duplicate pop token {id}")));
                }
            }
        }

        Ok(Self {
            sets,
            default,
            stack: vec![],
        })
    }

    fn top(&self) -> usize {
        self.stack.last().copied().unwrap_or(self.default)
    }

    pub fn current(&mut self) -> &mut SamplerSet {
        let index = self.top();
        &mut self.sets[index]
    }

    pub fn current_name(&self) -> &str {
        &self.sets[self.top()].name
    }

    /// Number of sets pushed above the default.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Pops on the pop trigger of the current set, otherwise pushes on any push trigger.
    pub fn accept(&mut self, token: TokenId) {
        if !self.stack.is_empty() && self.sets[self.top()].pop == Some(token) {
            let index = self.stack.pop();
            log::debug!("[sampler][pop: {:?}]", index.map(|x| &self.sets[x].name));
            return;
        }
        if let Some(index) = self.sets.iter().position(|set| set.push == Some(token)) {
            self.stack.push(index);
            log::debug!("[sampler][push: {}]", self.sets[index].name);
        }
    }

    pub fn reset(&mut self) {
        self.stack.clear();
    }

    /// Rebuilds the stack from scratch over `tokens`.
    pub fn replay(&mut self, tokens: impl IntoIterator<Item = TokenId>) {
        self.reset();
        for token in tokens {
            self.accept(token);
        }
    }

    /// Indices of the pushed sets, bottom first.
    pub fn pushed(&self) -> &[usize] {
        &self.stack
    }

    /// Restores a stack saved from [`Self::pushed`] and accepts `tokens` on top of it.
    pub fn rewind(&mut self, pushed: &[usize], tokens: impl IntoIterator<Item = TokenId>) {
        self.stack = pushed.to_vec();
        for token in tokens {
            self.accept(token);
        }
    }

    /// Drops the running state of every selector.
    pub fn reset_selectors(&mut self) {
        for set in self.sets.iter_mut() {
            set.selector.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(name: &str, push: Option<TokenId>, pop: Option<TokenId>) -> SamplerSet {
        let registry = SamplerRegistry::builtin();
        SamplerSet {
            name: name.into(),
            push,
            pop,
            samplers: vec![],
            selector: registry.selector(&SamplerConfig::new("Greedy")).unwrap(),
        }
    }

    #[test]
    fn requires_exactly_one_default() {
        assert!(matches!(
            SamplerSetStack::new(vec![set("a", None, None), set("b", None, None)]),
            Err(Error::InvalidSamplerSets(_))
        ));
        assert!(matches!(
            SamplerSetStack::new(vec![set("a", Some(1), Some(2))]),
            Err(Error::InvalidSamplerSets(_))
        ));
    }

    #[test]
    fn triggers_are_unique() {
        let sets = vec![
            set("default", None, None),
            set("think", Some(10), Some(11)),
            set("code", Some(10), Some(12)),
        ];
        assert!(SamplerSetStack::new(sets).is_err());

        let sets = vec![
            set("default", None, None),
            set("think", Some(10), Some(11)),
            set("code", Some(12), Some(11)),
        ];
        assert!(SamplerSetStack::new(sets).is_err());
    }

    #[test]
    fn push_pop_follow_tokens() {
        let sets = vec![
            set("default", None, None),
            set("think", Some(10), Some(11)),
            set("code", Some(20), Some(21)),
        ];
        let mut stack = SamplerSetStack::new(sets).unwrap();
        assert_eq!(stack.current_name(), "default");

        stack.accept(10);
        stack.accept(20);
        assert_eq!(stack.current_name(), "code");
        assert_eq!(stack.depth(), 2);

        // the pop of a set below the top is ignored
        stack.accept(11);
        assert_eq!(stack.current_name(), "code");

        stack.accept(21);
        stack.accept(11);
        assert_eq!(stack.current_name(), "default");

        stack.replay([5, 10, 6]);
        assert_eq!(stack.current_name(), "think");
        stack.reset();
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn rewind_restores_saved_stack() {
        let sets = vec![
            set("default", None, None),
            set("think", Some(10), Some(11)),
            set("code", Some(20), Some(21)),
        ];
        let mut stack = SamplerSetStack::new(sets).unwrap();
        stack.accept(10);
        let pushed = stack.pushed().to_vec();

        stack.accept(5);
        stack.accept(20);
        assert_eq!(stack.current_name(), "code");

        // `20` was taken back, `5` stays
        stack.rewind(&pushed, [5]);
        assert_eq!(stack.current_name(), "think");
        assert_eq!(stack.depth(), 1);
    }

    #[test]
    fn resolves_trigger_text() {
        let config = SamplerSetConfig {
            name: "think".into(),
            push: Some("<think>".into()),
            pop: Some("</think>".into()),
            ..Default::default()
        };
        let resolve = |text: &str| match text {
            "<think>" => Ok(10),
            "</think>" => Ok(11),
            _ => Err(Error::InvalidSettings(text.into())),
        };
        let set = SamplerSet::build(&config, &SamplerRegistry::builtin(), resolve).unwrap();
        assert_eq!((set.push, set.pop), (Some(10), Some(11)));
        assert!(!set.is_default());
    }
}
