use std::collections::{BTreeMap, HashSet};

use crate::{token::SequencedToken, Error, Result};

/// What a cell receives when a pass is committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellTransform {
    /// Take the cell from this old index.
    Move(usize),
    /// Pin the cell in place.
    Keep,
}

/// Mirror of the native KV cache, indexed like the token buffer.
#[derive(Debug, Clone)]
pub struct KvCacheState {
    cells: Vec<SequencedToken>,
    /// Keyed by destination index.
    transforms: BTreeMap<usize, CellTransform>,
    moved: HashSet<usize>,
    logits_position: Option<usize>,
}

impl KvCacheState {
    pub fn new(capacity: usize) -> Self {
        Self {
            cells: vec![SequencedToken::default(); capacity],
            transforms: BTreeMap::new(),
            moved: HashSet::new(),
            logits_position: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.cells.len()
    }

    /// One past the last occupied cell.
    pub fn len(&self) -> usize {
        self.cells
            .iter()
            .rposition(|x| !x.is_null())
            .map(|x| x + 1)
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<&SequencedToken> {
        self.cells.get(index).filter(|x| !x.is_null())
    }

    pub fn cells(&self) -> &[SequencedToken] {
        &self.cells[..self.len()]
    }

    /// Position whose logits the backend currently holds.
    pub fn logits_position(&self) -> Option<usize> {
        self.logits_position
    }

    pub fn set_logits_position(&mut self, position: Option<usize>) {
        self.logits_position = position;
    }

    pub fn write(&mut self, index: usize, token: SequencedToken) -> Result<()> {
        match self.cells.get_mut(index) {
            Some(cell) => {
                *cell = token;
                Ok(())
            }
            None => Err(Error::OutOfContext {
                capacity: self.cells.len(),
                requested: index + 1,
            }),
        }
    }

    pub fn clear(&mut self) {
        self.cells
            .iter_mut()
            .for_each(|x| *x = SequencedToken::default());
        self.transforms.clear();
        self.moved.clear();
        self.logits_position = None;
    }

    pub fn begin_pass(&mut self) {
        self.transforms.clear();
        self.moved.clear();
    }

    fn claim(&mut self, to: usize, transform: CellTransform) -> Result<()> {
        if to >= self.cells.len() {
            return Err(Error::invariant(format!("transform target {to} out of range")));
        }
        if self.transforms.insert(to, transform).is_some() {
            return Err(Error::invariant(format!("cell {to} transformed twice")));
        }
        Ok(())
    }

    pub fn keep(&mut self, index: usize) -> Result<()> {
        self.claim(index, CellTransform::Keep)
    }

    pub fn relocate(&mut self, from: usize, to: usize) -> Result<()> {
        if !self.moved.insert(from) {
            return Err(Error::invariant(format!("cell {from} moved twice")));
        }
        self.claim(to, CellTransform::Move(from))
    }

    /// Applies the pending transforms; every cell without one is emptied.
    pub fn commit(&mut self) -> Result<()> {
        let capacity = self.cells.len();
        let old = std::mem::replace(&mut self.cells, vec![SequencedToken::default(); capacity]);
        for (&to, &transform) in &self.transforms {
            let from = match transform {
                CellTransform::Keep => to,
                CellTransform::Move(from) => from,
            };
            match old.get(from) {
                Some(cell) => self.cells[to] = cell.clone(),
                None => return Err(Error::invariant(format!("move source {from} out of range"))),
            }
        }
        if let Some(position) = self.logits_position {
            if self.transforms.get(&position) != Some(&CellTransform::Keep) {
                self.logits_position = None;
            }
        }
        self.transforms.clear();
        self.moved.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::{Token, TokenMask};

    fn token(id: i32) -> SequencedToken {
        SequencedToken::single(Token::new(id, id.to_string(), TokenMask::BOT))
    }

    #[test]
    fn commit_moves_and_clears() {
        let mut cache = KvCacheState::new(5);
        for (index, id) in [1, 2, 3, 4].into_iter().enumerate() {
            cache.write(index, token(id)).unwrap();
        }
        cache.set_logits_position(Some(3));
        cache.begin_pass();
        cache.keep(0).unwrap();
        cache.relocate(2, 1).unwrap();
        cache.relocate(3, 2).unwrap();
        cache.commit().unwrap();

        let ids: Vec<i32> = cache.cells().iter().map(|x| x.id()).collect();
        assert_eq!(ids, vec![1, 3, 4]);
        assert_eq!(cache.logits_position(), None);
    }

    #[test]
    fn double_targets_and_moves_are_invariant_violations() {
        let mut cache = KvCacheState::new(4);
        cache.begin_pass();
        cache.keep(1).unwrap();
        assert!(matches!(cache.relocate(2, 1), Err(Error::Invariant(_))));

        cache.begin_pass();
        cache.relocate(3, 1).unwrap();
        assert!(matches!(cache.relocate(3, 2), Err(Error::Invariant(_))));
    }
}
