//! A deterministic in-memory backend for tests and dry runs.
//!
//! Logits come from scripted rows: every decode that requests logits moves to
//! the next row and the last row repeats forever. The KV cache is simulated
//! cell by cell so cache operations can be checked against the mirror.

use super::{DecodeItem, NativeBackend, ALL_SEQUENCES};
use crate::{
    token::{SeqId, TokenId},
    Error, Result,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    Decode(Vec<DecodeItem>),
    Remove { start: usize, end: usize },
    Shift { start: usize, end: usize, delta: isize },
    Clear,
}

pub struct ScriptedBackend {
    pieces: Vec<String>,
    bos: Option<TokenId>,
    rows: Vec<Vec<f32>>,
    row: Option<usize>,
    n_ctx: usize,
    n_batch: usize,
    cells: Vec<Option<TokenId>>,
    calls: Vec<BackendCall>,
    latch: Option<flume::Receiver<()>>,
}

impl ScriptedBackend {
    pub fn new<I, S>(pieces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let pieces: Vec<String> = pieces.into_iter().map(Into::into).collect();
        let n_ctx = 512;
        Self {
            pieces,
            bos: None,
            rows: vec![],
            row: None,
            n_ctx,
            n_batch: 64,
            cells: vec![None; n_ctx],
            calls: vec![],
            latch: None,
        }
    }

    pub fn with_context_size(mut self, n_ctx: usize) -> Self {
        self.n_ctx = n_ctx;
        self.cells = vec![None; n_ctx];
        self
    }

    pub fn with_batch_size(mut self, n_batch: usize) -> Self {
        self.n_batch = n_batch;
        self
    }

    pub fn with_bos(mut self, bos: TokenId) -> Self {
        self.bos = Some(bos);
        self
    }

    /// Appends a logits row.
    pub fn with_row(mut self, row: Vec<f32>) -> Self {
        self.rows.push(row);
        self
    }

    /// Appends a row where `token` leads every other token by `margin`.
    pub fn with_favorite(self, token: TokenId, margin: f32) -> Self {
        let row = self.favorite_row(&[(token, margin)]);
        self.with_row(row)
    }

    /// A row of zeros with the given tokens raised.
    pub fn favorite_row(&self, raised: &[(TokenId, f32)]) -> Vec<f32> {
        let mut row = vec![0.0; self.pieces.len()];
        for &(token, value) in raised {
            if let Some(x) = usize::try_from(token).ok().and_then(|x| row.get_mut(x)) {
                *x = value;
            }
        }
        row
    }

    /// Every decode blocks until the latch yields a value or its sender is dropped.
    pub fn with_latch(mut self, latch: flume::Receiver<()>) -> Self {
        self.latch = Some(latch);
        self
    }

    pub fn calls(&self) -> &[BackendCall] {
        &self.calls
    }

    pub fn clear_calls(&mut self) {
        self.calls.clear();
    }

    pub fn decoded_batches(&self) -> Vec<Vec<DecodeItem>> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                BackendCall::Decode(batch) => Some(batch.clone()),
                _ => None,
            })
            .collect()
    }

    /// Simulated cache contents up to the last occupied cell.
    pub fn cells(&self) -> Vec<Option<TokenId>> {
        let end = self
            .cells
            .iter()
            .rposition(Option::is_some)
            .map(|x| x + 1)
            .unwrap_or_default();
        self.cells[..end].to_vec()
    }

    fn check_seq(seq: SeqId) -> Result<()> {
        match seq {
            ALL_SEQUENCES | 0 => Ok(()),
            seq => Err(Error::Backend(format!("unknown sequence {seq}"))),
        }
    }
}

impl NativeBackend for ScriptedBackend {
    fn n_vocab(&self) -> usize {
        self.pieces.len()
    }

    fn n_ctx(&self) -> usize {
        self.n_ctx
    }

    fn n_batch(&self) -> usize {
        self.n_batch
    }

    /// Greedy longest-piece match from the left.
    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>> {
        let mut tokens = vec![];
        if add_bos {
            tokens.extend(self.bos);
        }
        let mut rest = text;
        while !rest.is_empty() {
            let best = self
                .pieces
                .iter()
                .enumerate()
                .filter(|(_, piece)| !piece.is_empty() && rest.starts_with(piece.as_str()))
                .max_by_key(|(_, piece)| piece.len());
            match best {
                Some((id, piece)) => {
                    tokens.push(id as TokenId);
                    rest = &rest[piece.len()..];
                }
                None => return Err(Error::Backend(format!("cannot tokenize {rest:?}"))),
            }
        }
        Ok(tokens)
    }

    fn token_to_piece(&self, token: TokenId) -> Result<String> {
        usize::try_from(token)
            .ok()
            .and_then(|x| self.pieces.get(x))
            .cloned()
            .ok_or_else(|| Error::Backend(format!("token {token} out of vocabulary")))
    }

    fn decode(&mut self, batch: &[DecodeItem]) -> Result<()> {
        if let Some(latch) = &self.latch {
            let _ = latch.recv();
        }
        if batch.len() > self.n_batch {
            return Err(Error::Backend("batch exceeds n_batch".into()));
        }
        for item in batch {
            let Some(cell) = self.cells.get_mut(item.position) else {
                return Err(Error::Backend(format!("position {} out of context", item.position)));
            };
            if cell.is_some() {
                return Err(Error::Backend(format!("cell {} already occupied", item.position)));
            }
            *cell = Some(item.token);
        }
        if batch.iter().any(|x| x.logits) && !self.rows.is_empty() {
            let next = self.row.map(|x| x + 1).unwrap_or_default();
            self.row = Some(next.min(self.rows.len() - 1));
        }
        self.calls.push(BackendCall::Decode(batch.to_vec()));
        Ok(())
    }

    fn logits(&self) -> Result<&[f32]> {
        match self.row {
            Some(row) => Ok(&self.rows[row]),
            None => Err(Error::Backend("no logits available".into())),
        }
    }

    fn remove_cache_tokens(&mut self, seq: SeqId, start: usize, end: usize) -> Result<()> {
        Self::check_seq(seq)?;
        let end = end.min(self.n_ctx);
        for cell in self.cells.iter_mut().take(end).skip(start) {
            *cell = None;
        }
        self.calls.push(BackendCall::Remove { start, end });
        Ok(())
    }

    fn shift_cache_tokens(
        &mut self,
        seq: SeqId,
        start: usize,
        end: usize,
        delta: isize,
    ) -> Result<()> {
        Self::check_seq(seq)?;
        let moved: Vec<(usize, TokenId)> = (start..end.min(self.n_ctx))
            .filter_map(|x| self.cells[x].take().map(|token| (x, token)))
            .collect();
        for (from, token) in moved {
            let to = from
                .checked_add_signed(delta)
                .filter(|&x| x < self.n_ctx)
                .ok_or_else(|| Error::Backend(format!("shift of {from} by {delta} out of range")))?;
            if self.cells[to].is_some() {
                return Err(Error::Backend(format!("shift onto occupied cell {to}")));
            }
            self.cells[to] = Some(token);
        }
        self.calls.push(BackendCall::Shift { start, end, delta });
        Ok(())
    }

    fn clear_cache(&mut self) -> Result<()> {
        self.cells.iter_mut().for_each(|x| *x = None);
        self.calls.push(BackendCall::Clear);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_longest_piece_first() {
        let backend = ScriptedBackend::new(["<s>", "he", "hello", "llo", " "]).with_bos(0);
        assert_eq!(backend.tokenize("hello he", true).unwrap(), vec![0, 2, 4, 1]);
        assert!(backend.tokenize("x", false).is_err());
    }

    #[test]
    fn rows_advance_per_logits_decode() {
        let mut backend = ScriptedBackend::new(["a", "b"])
            .with_row(vec![1.0, 0.0])
            .with_row(vec![0.0, 1.0]);
        assert!(backend.logits().is_err());
        let item = |position| DecodeItem {
            token: 0,
            position,
            seq_ids: vec![0],
            logits: true,
        };
        backend.decode(&[item(0)]).unwrap();
        assert_eq!(backend.logits().unwrap(), &[1.0, 0.0]);
        backend.decode(&[item(1)]).unwrap();
        backend.decode(&[item(2)]).unwrap();
        assert_eq!(backend.logits().unwrap(), &[0.0, 1.0]);
    }
}
