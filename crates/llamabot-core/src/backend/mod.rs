//! The contract the core consumes from a native inference library.

use std::path::PathBuf;

use derivative::Derivative;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::{
    token::{SeqId, Token, TokenId, TokenMask},
    Error, Result,
};

pub mod scripted;

/// Sequence id that addresses every sequence in cache operations.
pub const ALL_SEQUENCES: SeqId = -1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeItem {
    pub token: TokenId,
    pub position: usize,
    pub seq_ids: Vec<SeqId>,
    /// Whether the backend should produce logits for this position.
    pub logits: bool,
}

/// Primitive operations of a loaded model and context.
///
/// Implementations are single threaded: one context handle never sees
/// concurrent calls.
pub trait NativeBackend {
    fn n_vocab(&self) -> usize;
    fn n_ctx(&self) -> usize;
    fn n_batch(&self) -> usize;

    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>>;
    fn token_to_piece(&self, token: TokenId) -> Result<String>;

    /// Evaluates one batch. Positions are already ordered and fit `n_batch`.
    fn decode(&mut self, batch: &[DecodeItem]) -> Result<()>;
    /// Logits of the last decoded item that requested them.
    fn logits(&self) -> Result<&[f32]>;

    /// Removes cells in `[start, end)`.
    fn remove_cache_tokens(&mut self, seq: SeqId, start: usize, end: usize) -> Result<()>;
    /// Moves cells in `[start, end)` by `delta` positions.
    fn shift_cache_tokens(&mut self, seq: SeqId, start: usize, end: usize, delta: isize)
        -> Result<()>;
    fn clear_cache(&mut self) -> Result<()>;
}

/// Submits `items` ordered by position in `n_batch` sized slices.
///
/// Only the item at the highest position requests logits, and it is always
/// the last one decoded.
pub fn decode_batched<B>(backend: &mut B, mut items: Vec<DecodeItem>) -> Result<()>
where
    B: NativeBackend + ?Sized,
{
    let Some(max) = items.iter().map(|x| x.position).max() else {
        return Ok(());
    };
    items.sort_by_key(|x| x.position);
    if items.iter().tuple_windows().any(|(x, y)| x.position == y.position) {
        return Err(Error::invariant("two decode items share a position"));
    }
    for item in items.iter_mut() {
        item.logits = item.position == max;
    }
    match items.last() {
        Some(item) if item.position == max => {}
        _ => return Err(Error::invariant("last decoded item is not the last position")),
    }

    let n_batch = backend.n_batch().max(1);
    for chunk in items.chunks(n_batch) {
        backend.decode(chunk)?;
    }
    Ok(())
}

/// Every piece of the model vocabulary, materialized once per context.
#[derive(Debug, Default, Clone)]
pub struct Vocabulary {
    pieces: Vec<String>,
}

impl Vocabulary {
    pub fn new<I, S>(pieces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let pieces = pieces.into_iter().map(Into::into).collect();
        Self { pieces }
    }

    pub fn load<B: NativeBackend + ?Sized>(backend: &B) -> Result<Self> {
        let pieces = (0..backend.n_vocab())
            .map(|id| backend.token_to_piece(id as TokenId))
            .collect::<Result<Vec<_>>>()?;
        log::info!("[vocab] loaded {} pieces", pieces.len());
        Ok(Self { pieces })
    }

    pub fn len(&self) -> usize {
        self.pieces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    /// The piece of `id`, empty for ids outside the vocabulary.
    pub fn piece(&self, id: TokenId) -> &str {
        usize::try_from(id)
            .ok()
            .and_then(|index| self.pieces.get(index))
            .map(String::as_str)
            .unwrap_or_default()
    }

    pub fn token(&self, id: TokenId, mask: TokenMask) -> Token {
        Token::new(id, self.piece(id), mask)
    }

    /// Text of a token sequence.
    pub fn detokenize(&self, tokens: &[TokenId]) -> String {
        tokens.iter().map(|&id| self.piece(id)).collect()
    }
}

#[allow(non_camel_case_types)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheType {
    F32,
    #[default]
    F16,
    Q8_0,
    Q5_1,
    Q5_0,
    Q4_1,
    Q4_0,
}

#[derive(Debug, Clone, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct BackendSettings {
    #[derivative(Default(value = "\"assets/models/model.gguf\".into()"))]
    pub model_path: PathBuf,
    #[derivative(Default(value = "4096"))]
    pub context_length: usize,
    #[derivative(Default(value = "512"))]
    pub batch_size: usize,
    /// Worker threads of the native library; `None` lets it decide.
    pub threads: Option<usize>,
    #[derivative(Default(value = "0"))]
    pub gpu_layers: u32,
    pub rope_freq_base: Option<f32>,
    pub rope_freq_scale: Option<f32>,
    pub type_k: CacheType,
    pub type_v: CacheType,
    pub flash_attention: bool,
}

impl BackendSettings {
    pub fn validate(&self) -> Result<()> {
        if self.type_v != CacheType::F16 && !self.flash_attention {
            return Err(Error::InvalidSettings(format!(
                "V cache type {:?} requires flash attention",
                self.type_v
            )));
        }
        if self.context_length == 0 || self.batch_size == 0 {
            return Err(Error::InvalidSettings(
                "context length and batch size must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{scripted::ScriptedBackend, *};

    fn item(token: TokenId, position: usize) -> DecodeItem {
        DecodeItem {
            token,
            position,
            seq_ids: vec![0],
            logits: false,
        }
    }

    #[test]
    fn batches_are_ordered_and_end_on_max() {
        let mut backend = ScriptedBackend::new(["a", "b", "c", "d"]).with_batch_size(2);
        let items = vec![item(3, 4), item(0, 2), item(1, 3), item(2, 5), item(1, 6)];
        decode_batched(&mut backend, items).unwrap();

        let batches = backend.decoded_batches();
        assert_eq!(batches.len(), 3);
        let positions: Vec<usize> = batches.concat().iter().map(|x| x.position).collect();
        assert_eq!(positions, vec![2, 3, 4, 5, 6]);
        let last = batches.last().and_then(|x| x.last()).unwrap();
        assert_eq!(last.position, 6);
        assert!(last.logits);
        assert_eq!(batches.concat().iter().filter(|x| x.logits).count(), 1);
    }

    #[test]
    fn duplicate_positions_are_invariant_violations() {
        let mut backend = ScriptedBackend::new(["a"]);
        let items = vec![item(0, 1), item(0, 1)];
        assert!(matches!(
            decode_batched(&mut backend, items),
            Err(Error::Invariant(_))
        ));
    }

    #[test]
    fn quantized_v_cache_needs_flash_attention() {
        let mut settings = BackendSettings {
            type_v: CacheType::Q8_0,
            ..Default::default()
        };
        assert!(matches!(settings.validate(), Err(Error::InvalidSettings(_))));
        settings.flash_attention = true;
        assert!(settings.validate().is_ok());
        assert!(BackendSettings::default().validate().is_ok());
    }

    #[test]
    fn cache_type_names() {
        let json = serde_json::to_string(&CacheType::Q8_0).unwrap();
        assert_eq!(json, "\"q8_0\"");
    }
}
