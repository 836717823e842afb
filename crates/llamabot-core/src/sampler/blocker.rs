use serde::{Deserialize, Serialize};

use super::{SampleContext, Sampler};
use crate::Result;

/// Bans every candidate whose piece would complete one of `sequences`, either
/// on its own or by finishing a prefix already present at the end of the buffer.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubsequenceBlocker {
    pub sequences: Vec<String>,
}

impl SubsequenceBlocker {
    /// Byte offsets `k` such that the text ends with `sequence[..k]`.
    fn open_prefixes(text: &str, sequence: &str) -> Vec<usize> {
        sequence
            .char_indices()
            .map(|(index, _)| index)
            .skip(1)
            .filter(|&index| text.ends_with(&sequence[..index]))
            .collect()
    }

    fn completes(piece: &str, sequence: &str, prefixes: &[usize]) -> bool {
        piece.contains(sequence)
            || prefixes
                .iter()
                .any(|&index| piece.starts_with(&sequence[index..]))
    }
}

impl Sampler for SubsequenceBlocker {
    fn transform(&mut self, context: &mut SampleContext) -> Result<()> {
        let longest = self
            .sequences
            .iter()
            .map(|x| x.chars().count())
            .max()
            .unwrap_or_default();
        if longest == 0 {
            return Ok(());
        }

        let text = context.recent_text(longest);
        let open = self
            .sequences
            .iter()
            .filter(|x| !x.is_empty())
            .map(|x| (x.as_str(), Self::open_prefixes(&text, x)))
            .collect::<Vec<_>>();

        let vocab = context.vocab;
        let mut blocked = false;
        for data in context.candidates.as_mut_slice() {
            let piece = vocab.piece(data.id);
            if piece.is_empty() || data.logit == f32::NEG_INFINITY {
                continue;
            }
            if open
                .iter()
                .any(|(sequence, prefixes)| Self::completes(piece, sequence, prefixes))
            {
                data.logit = f32::NEG_INFINITY;
                blocked = true;
            }
        }
        if blocked {
            log::trace!("[blocker] masked completions of {:?}", self.sequences);
            context.candidates.invalidate();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::Vocabulary,
        token::{SequencedToken, Token, TokenDataArray, TokenMask},
    };

    #[test]
    fn blocks_whole_and_partial_completions() {
        let vocab = Vocabulary::new(["<", "|end", "|", "end|>", "x", "<|end|>"]);
        let history = vec![SequencedToken::single(Token::new(
            0,
            "<",
            TokenMask::BOT,
        ))];
        let mut candidates = TokenDataArray::from_logits(&[0.0; 6]);
        let original = candidates.clone();
        let mut rng = fastrand::Rng::with_seed(3);
        let mut context = SampleContext {
            candidates: &mut candidates,
            original: &original,
            history: &history,
            vocab: &vocab,
            rng: &mut rng,
        };
        let mut blocker = SubsequenceBlocker {
            sequences: vec!["<|end|>".into()],
        };
        blocker.transform(&mut context).unwrap();

        let masked = |id| candidates.get(id).unwrap().logit == f32::NEG_INFINITY;
        // "<" + "|end" only opens the sequence further; it does not complete it
        assert!(!masked(1));
        assert!(!masked(0));
        assert!(!masked(4));
        assert!(masked(5));
    }

    #[test]
    fn prefix_offsets() {
        assert_eq!(SubsequenceBlocker::open_prefixes("ab<|", "<|end|>"), vec![2]);
        assert!(SubsequenceBlocker::completes("end|>", "<|end|>", &[2]));
        assert!(!SubsequenceBlocker::completes("end", "<|end|>", &[2]));
    }
}
