//! Keyed bias/penalty/clamp rules applied to the candidate distribution.
//!
//! At most one rule of each kind exists per token. Rules carry a [`Lifetime`]
//! and are swept by the chat context when that lifetime ends.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    token::{TokenDataArray, TokenId},
    Error, Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LogitRuleKind {
    Bias,
    Penalty,
    Clamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogitRuleKey {
    pub kind: LogitRuleKind,
    pub token: TokenId,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Lifetime {
    /// Cleared after every selected token.
    Token,
    /// Cleared after every response.
    Message,
    /// Kept until removed explicitly.
    #[default]
    Context,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogitBiasType {
    #[default]
    Additive,
    Multiplicative,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LogitBias {
    pub token: TokenId,
    pub value: f32,
    #[serde(default)]
    pub kind: LogitBiasType,
    #[serde(default)]
    pub lifetime: Lifetime,
}

impl LogitBias {
    pub fn new(token: TokenId, value: f32, kind: LogitBiasType, lifetime: Lifetime) -> Self {
        Self {
            token,
            value,
            kind,
            lifetime,
        }
    }

    /// A bias that makes the token impossible to select.
    pub fn block(token: TokenId, lifetime: Lifetime) -> Self {
        Self::new(token, f32::NEG_INFINITY, LogitBiasType::Additive, lifetime)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LogitPenalty {
    pub token: TokenId,
    pub value: f32,
    #[serde(default)]
    pub lifetime: Lifetime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogitClampType {
    PreventIncrease,
    PreventDecrease,
    PreventChange,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LogitClamp {
    pub token: TokenId,
    pub kind: LogitClampType,
    #[serde(default)]
    pub lifetime: Lifetime,
    /// Probability captured by [`LogitRuleCollection::start_clamp`].
    #[serde(skip)]
    pub start: Option<f32>,
}

impl LogitClamp {
    pub fn new(token: TokenId, kind: LogitClampType, lifetime: Lifetime) -> Self {
        Self {
            token,
            kind,
            lifetime,
            start: None,
        }
    }

    fn clamp(&self, start: f32, value: f32) -> f32 {
        match self.kind {
            LogitClampType::PreventIncrease => start.min(value),
            LogitClampType::PreventDecrease => start.max(value),
            LogitClampType::PreventChange => start,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LogitRule {
    Bias(LogitBias),
    Penalty(LogitPenalty),
    Clamp(LogitClamp),
}

impl LogitRule {
    pub fn key(&self) -> LogitRuleKey {
        let (kind, token) = match self {
            LogitRule::Bias(rule) => (LogitRuleKind::Bias, rule.token),
            LogitRule::Penalty(rule) => (LogitRuleKind::Penalty, rule.token),
            LogitRule::Clamp(rule) => (LogitRuleKind::Clamp, rule.token),
        };
        LogitRuleKey { kind, token }
    }

    pub fn lifetime(&self) -> Lifetime {
        match self {
            LogitRule::Bias(rule) => rule.lifetime,
            LogitRule::Penalty(rule) => rule.lifetime,
            LogitRule::Clamp(rule) => rule.lifetime,
        }
    }
}

impl From<LogitBias> for LogitRule {
    fn from(value: LogitBias) -> Self {
        Self::Bias(value)
    }
}

impl From<LogitPenalty> for LogitRule {
    fn from(value: LogitPenalty) -> Self {
        Self::Penalty(value)
    }
}

impl From<LogitClamp> for LogitRule {
    fn from(value: LogitClamp) -> Self {
        Self::Clamp(value)
    }
}

#[derive(Debug, Default, Clone)]
pub struct LogitRuleCollection {
    rules: BTreeMap<LogitRuleKey, LogitRule>,
}

impl LogitRuleCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn add(&mut self, rule: impl Into<LogitRule>) -> Result<()> {
        let rule = rule.into();
        let key = rule.key();
        if self.rules.contains_key(&key) {
            return Err(Error::DuplicateRule(key));
        }
        self.rules.insert(key, rule);
        Ok(())
    }

    pub fn add_or_update(&mut self, rule: impl Into<LogitRule>) {
        let rule = rule.into();
        self.rules.insert(rule.key(), rule);
    }

    pub fn get(&self, key: &LogitRuleKey) -> Option<&LogitRule> {
        self.rules.get(key)
    }

    pub fn remove(&mut self, key: &LogitRuleKey) -> Option<LogitRule> {
        self.rules.remove(key)
    }

    /// Purges every rule with the given lifetime; returns how many were removed.
    pub fn remove_lifetime(&mut self, lifetime: Lifetime) -> usize {
        let before = self.rules.len();
        self.rules.retain(|_, rule| rule.lifetime() != lifetime);
        before - self.rules.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogitRule> {
        self.rules.values()
    }

    pub fn of_kind(&self, kind: LogitRuleKind) -> impl Iterator<Item = &LogitRule> {
        self.rules
            .iter()
            .filter(move |(key, _)| key.kind == kind)
            .map(|(_, rule)| rule)
    }

    pub fn biases(&self) -> impl Iterator<Item = &LogitBias> {
        self.rules.values().filter_map(|rule| match rule {
            LogitRule::Bias(rule) => Some(rule),
            _ => None,
        })
    }

    pub fn penalties(&self) -> impl Iterator<Item = &LogitPenalty> {
        self.rules.values().filter_map(|rule| match rule {
            LogitRule::Penalty(rule) => Some(rule),
            _ => None,
        })
    }

    pub fn clamps(&self) -> impl Iterator<Item = &LogitClamp> {
        self.rules.values().filter_map(|rule| match rule {
            LogitRule::Clamp(rule) => Some(rule),
            _ => None,
        })
    }

    /// Snapshots the probability of every clamped token. Expects probabilities
    /// to be current.
    pub fn start_clamp(&mut self, candidates: &TokenDataArray) -> Result<()> {
        for rule in self.rules.values_mut() {
            if let LogitRule::Clamp(clamp) = rule {
                clamp.start = Some(candidates.get(clamp.token)?.p);
            }
        }
        Ok(())
    }

    /// Pushes penalized logits toward zero/negative regardless of sign.
    pub fn apply_penalty(&self, candidates: &mut TokenDataArray) -> Result<()> {
        let mut changed = false;
        for penalty in self.penalties() {
            let data = candidates.get_mut(penalty.token)?;
            data.logit = match data.logit > 0.0 {
                true => data.logit / penalty.value,
                false => data.logit * penalty.value,
            };
            changed = true;
        }
        if changed {
            candidates.invalidate();
        }
        Ok(())
    }

    pub fn apply_bias(&self, candidates: &mut TokenDataArray) -> Result<()> {
        let mut changed = false;
        for bias in self.biases() {
            let data = candidates.get_mut(bias.token)?;
            match bias.kind {
                LogitBiasType::Additive => {
                    data.logit += bias.value;
                    data.p += bias.value;
                }
                LogitBiasType::Multiplicative => {
                    data.logit = match data.logit > 0.0 {
                        true => data.logit * bias.value,
                        false => data.logit / bias.value,
                    };
                    data.p *= bias.value;
                }
            }
            changed = true;
        }
        if changed {
            candidates.invalidate();
        }
        Ok(())
    }

    /// Recomputes probabilities and rewrites every clamped token that moved in
    /// the forbidden direction since [`LogitRuleCollection::start_clamp`].
    pub fn apply_clamp(&self, candidates: &mut TokenDataArray) -> Result<()> {
        if self.clamps().next().is_none() {
            return Ok(());
        }
        candidates.softmax();
        let mut changed = false;
        for clamp in self.clamps() {
            let Some(start) = clamp.start else {
                continue;
            };
            let data = candidates.get_mut(clamp.token)?;
            let target = clamp.clamp(start, data.p);
            if target == data.p {
                continue;
            }
            // solve for the logit that renormalizes to `target` against the rest
            let odds = |x: f32| (x / (1.0 - x)).ln();
            data.logit = match target {
                x if x <= 0.0 => f32::NEG_INFINITY,
                x if x < 1.0 && data.p > 0.0 && data.p < 1.0 => {
                    data.logit + odds(x) - odds(data.p)
                }
                _ => data.logit,
            };
            data.p = target;
            changed = true;
        }
        if changed {
            candidates.invalidate();
        }
        Ok(())
    }
}
