//! Splits a long response into several messages at its most natural breaks.

use derivative::Derivative;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct SplitSettings {
    /// Pieces longer than this are split again.
    #[derivative(Default(value = "1800"))]
    pub max_chars: usize,
    /// Tokens at either end of a piece that are never split points.
    #[derivative(Default(value = "4"))]
    pub margin: usize,
    /// Text whose probability marks a break.
    #[derivative(Default(value = "\"\\n\".into()"))]
    pub marker: String,
}

/// One generated token with the probability the marker had in its place.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitPoint {
    pub text: String,
    pub marker_p: f32,
}

/// Recursively cuts before the interior token where the marker was most likely.
pub fn split(tokens: &[SplitPoint], settings: &SplitSettings) -> Vec<String> {
    let mut pieces = vec![];
    split_range(tokens, settings, &mut pieces);
    pieces
        .into_iter()
        .map(|x| x.trim().to_string())
        .filter(|x| !x.is_empty())
        .collect()
}

fn split_range(tokens: &[SplitPoint], settings: &SplitSettings, pieces: &mut Vec<String>) {
    let text: String = tokens.iter().map(|x| x.text.as_str()).collect();
    if text.chars().count() <= settings.max_chars || tokens.len() < 2 {
        pieces.push(text);
        return;
    }

    let start = settings.margin.max(1);
    let end = tokens.len().saturating_sub(settings.margin);
    let at = match start < end {
        true => (start..end)
            .max_by(|&x, &y| tokens[x].marker_p.total_cmp(&tokens[y].marker_p).then(y.cmp(&x)))
            .unwrap_or(tokens.len() / 2),
        false => tokens.len() / 2,
    };
    log::trace!("[split][at: {at}][p: {}]", tokens[at].marker_p);

    split_range(&tokens[..at], settings, pieces);
    split_range(&tokens[at..], settings, pieces);
}
