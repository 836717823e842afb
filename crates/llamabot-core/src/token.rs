use std::{
    cmp::Ordering,
    fmt,
    hash::{Hash, Hasher},
    ops::{BitOr, BitOrAssign},
};

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use voracious_radix_sort::{RadixSort, Radixable};

use crate::{Error, Result};

pub type TokenId = i32;
pub type SeqId = i32;

/// Provenance of a token inside the context buffer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenMask(u8);

impl TokenMask {
    pub const UNDEFINED: Self = Self(0);
    pub const USER: Self = Self(1);
    pub const BOT: Self = Self(2);
    pub const PROMPT: Self = Self(4);
    pub const TEMPLATE: Self = Self(8);
    pub const ALL: Self = Self(1 | 2 | 4 | 8);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn is_undefined(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for TokenMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for TokenMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// A vocabulary entry: identity is the id alone.
#[derive(Clone)]
pub struct Token {
    pub id: TokenId,
    pub value: String,
    pub mask: TokenMask,
}

impl Token {
    pub const NULL_ID: TokenId = -1;

    pub fn new(id: TokenId, value: impl Into<String>, mask: TokenMask) -> Self {
        Self {
            id,
            value: value.into(),
            mask,
        }
    }

    pub fn null() -> Self {
        Self::new(Self::NULL_ID, String::new(), TokenMask::UNDEFINED)
    }

    pub fn is_null(&self) -> bool {
        self.id == Self::NULL_ID
    }

    pub fn with_mask(self, mask: TokenMask) -> Self {
        Self { mask, ..self }
    }
}

impl Default for Token {
    fn default() -> Self {
        Self::null()
    }
}

impl PartialEq for Token {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Token {}

impl Hash for Token {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state)
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:?})", self.id, self.value)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

/// A token together with the cache sequences it belongs to.
#[derive(Debug, Clone, Default)]
pub struct SequencedToken {
    pub token: Token,
    pub seq_ids: Vec<SeqId>,
}

impl SequencedToken {
    pub fn new(token: Token, seq_ids: impl Into<Vec<SeqId>>) -> Self {
        Self {
            token,
            seq_ids: seq_ids.into(),
        }
    }

    /// Places the token in the default sequence `0`.
    pub fn single(token: Token) -> Self {
        Self::new(token, vec![0])
    }

    pub fn id(&self) -> TokenId {
        self.token.id
    }

    pub fn is_null(&self) -> bool {
        self.token.is_null()
    }
}

impl PartialEq for SequencedToken {
    fn eq(&self, other: &Self) -> bool {
        self.token == other.token
    }
}

impl Eq for SequencedToken {}

impl From<Token> for SequencedToken {
    fn from(token: Token) -> Self {
        Self::single(token)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokenData {
    pub id: TokenId,
    pub logit: f32,
    pub p: f32,
}

impl PartialOrd for TokenData {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.logit.partial_cmp(&other.logit)
    }
}

impl PartialEq for TokenData {
    fn eq(&self, other: &Self) -> bool {
        self.logit == other.logit
    }
}

impl Radixable<f32> for TokenData {
    type Key = f32;

    #[inline]
    fn key(&self) -> Self::Key {
        self.logit
    }
}

/// Candidate distribution of one decode step.
///
/// Entries past `size` are pruned but keep their storage, so truncation never
/// reallocates. `ordered` is only true while the live entries are sorted by
/// descending logit.
#[derive(Debug, Clone, Default)]
pub struct TokenDataArray {
    data: Vec<TokenData>,
    size: usize,
    ordered: bool,
}

impl TokenDataArray {
    pub fn from_logits(logits: &[f32]) -> Self {
        let data = logits
            .iter()
            .enumerate()
            .map(|(id, &logit)| TokenData {
                id: id as TokenId,
                logit,
                p: 0.0,
            })
            .collect_vec();
        let size = data.len();
        Self {
            data,
            size,
            ordered: false,
        }
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn is_ordered(&self) -> bool {
        self.ordered
    }

    /// Must be called by anything that changes the relative order of logits.
    pub fn invalidate(&mut self) {
        self.ordered = false;
    }

    pub fn as_slice(&self) -> &[TokenData] {
        &self.data[..self.size]
    }

    /// Mutable access to the live entries. Callers that reorder logits must
    /// call [`TokenDataArray::invalidate`].
    pub fn as_mut_slice(&mut self) -> &mut [TokenData] {
        &mut self.data[..self.size]
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TokenData> {
        self.as_slice().iter()
    }

    /// Sorts live entries by descending logit.
    pub fn sort(&mut self) {
        if self.ordered {
            return;
        }
        let live = &mut self.data[..self.size];
        if live.iter().any(|x| x.logit.is_nan()) {
            live.sort_unstable_by(|x, y| y.logit.total_cmp(&x.logit));
        } else {
            live.voracious_sort();
            live.reverse();
        }
        self.ordered = true;
    }

    /// Recomputes `p` over the live entries without reordering them.
    pub fn softmax(&mut self) {
        let live = &mut self.data[..self.size];
        if live.is_empty() {
            return;
        }
        let max = live
            .iter()
            .map(|x| x.logit)
            .fold(f32::NEG_INFINITY, f32::max);
        if max == f32::NEG_INFINITY {
            let p = 1.0 / live.len() as f32;
            live.iter_mut().for_each(|x| x.p = p);
            return;
        }
        let mut sum = 0.0;
        for x in live.iter_mut() {
            x.p = (x.logit - max).exp();
            sum += x.p;
        }
        live.iter_mut().for_each(|x| x.p /= sum);
    }

    /// Renormalizes the existing probabilities of the live entries to sum to one.
    pub fn normalize(&mut self) {
        let live = &mut self.data[..self.size];
        let sum: f32 = live.iter().map(|x| x.p).sum();
        if sum > 0.0 {
            live.iter_mut().for_each(|x| x.p /= sum);
        }
    }

    /// Keeps the `k` most likely entries.
    pub fn truncate(&mut self, k: usize) {
        if k >= self.size {
            return;
        }
        self.sort();
        self.size = k.max(1);
    }

    /// Drops every live entry whose logit is `-inf`, keeping at least one.
    pub fn prune_masked(&mut self) {
        self.sort();
        let keep = self
            .as_slice()
            .iter()
            .position(|x| x.logit == f32::NEG_INFINITY)
            .unwrap_or(self.size);
        self.size = keep.max(1);
    }

    pub fn find(&self, id: TokenId) -> Option<usize> {
        let index = usize::try_from(id).ok()?;
        if !self.ordered && index < self.size && self.data[index].id == id {
            return Some(index);
        }
        self.as_slice().iter().position(|x| x.id == id)
    }

    pub fn get(&self, id: TokenId) -> Result<&TokenData> {
        match self.find(id) {
            Some(index) => Ok(&self.data[index]),
            None => Err(Error::NotFound(id)),
        }
    }

    pub fn get_mut(&mut self, id: TokenId) -> Result<&mut TokenData> {
        match self.find(id) {
            Some(index) => Ok(&mut self.data[index]),
            None => Err(Error::NotFound(id)),
        }
    }

    /// The live entry with the highest logit.
    pub fn top(&self) -> Option<TokenData> {
        match self.ordered {
            true => self.as_slice().first().copied(),
            false => self
                .iter()
                .copied()
                .max_by(|x, y| x.logit.total_cmp(&y.logit)),
        }
    }

    /// The first entry whose cumulative probability reaches `rand`.
    /// Probabilities must be normalized.
    pub fn pick(&self, rand: f32) -> Option<TokenData> {
        let mut cum = 0.0;
        for x in self.iter() {
            cum += x.p;
            if rand <= cum {
                return Some(*x);
            }
        }
        self.iter().rev().find(|x| x.p > 0.0).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_equality_ignores_value_and_mask() {
        let a = Token::new(5, " hello", TokenMask::BOT);
        let b = Token::new(5, "other", TokenMask::USER);
        assert_eq!(a, b);
        assert!(Token::null().is_null());
        assert_eq!(SequencedToken::single(a), SequencedToken::new(b, vec![1, 2]));
    }

    #[test]
    fn mask_operations() {
        let mask = TokenMask::USER | TokenMask::BOT;
        assert!(mask.contains(TokenMask::USER));
        assert!(!mask.contains(TokenMask::PROMPT));
        assert!(mask.intersects(TokenMask::BOT | TokenMask::TEMPLATE));
        assert!(TokenMask::default().is_undefined());
    }

    #[test]
    fn sort_truncate_keeps_storage() {
        let mut array = TokenDataArray::from_logits(&[0.1, 3.0, -1.0, 2.0]);
        assert!(!array.is_ordered());
        array.truncate(2);
        assert!(array.is_ordered());
        assert_eq!(array.len(), 2);
        assert_eq!(array.as_slice()[0].id, 1);
        assert_eq!(array.as_slice()[1].id, 3);
        assert!(array.get(2).is_err());
    }

    #[test]
    fn softmax_preserves_order() {
        let mut array = TokenDataArray::from_logits(&[1.0, 2.0, 3.0]);
        array.softmax();
        let sum: f32 = array.iter().map(|x| x.p).sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert_eq!(array.as_slice()[2].id, 2);
        assert!(array.as_slice()[2].p > array.as_slice()[0].p);
    }

    #[test]
    fn lookup_after_sort() {
        let mut array = TokenDataArray::from_logits(&[0.5, 0.1, 0.9]);
        array.sort();
        assert_eq!(array.get(1).map(|x| x.logit).ok(), Some(0.1));
        assert!(matches!(array.get(7), Err(Error::NotFound(7))));
        assert_eq!(array.top().map(|x| x.id), Some(2));
    }

    #[test]
    fn prune_masked_keeps_one() {
        let mut array = TokenDataArray::from_logits(&[f32::NEG_INFINITY, 1.0, f32::NEG_INFINITY]);
        array.prune_masked();
        assert_eq!(array.len(), 1);
        assert_eq!(array.as_slice()[0].id, 1);
    }

    #[test]
    fn pick_falls_back_to_last_live_entry() {
        let mut array = TokenDataArray::from_logits(&[0.0, 0.0, 0.0]);
        for (data, p) in array.as_mut_slice().iter_mut().zip([0.3, 0.4, 0.0]) {
            data.p = p;
        }
        assert_eq!(array.pick(0.5).map(|x| x.id), Some(1));
        // rounding left the sum short of `rand`
        assert_eq!(array.pick(0.9).map(|x| x.id), Some(1));
    }
}
