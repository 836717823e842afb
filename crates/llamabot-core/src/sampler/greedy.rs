use serde::{Deserialize, Serialize};

use super::{SampleContext, Selector};
use crate::{token::TokenId, Error, Result};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Greedy {}

impl Selector for Greedy {
    fn sample(&mut self, context: &mut SampleContext) -> Result<TokenId> {
        match context.candidates.top() {
            Some(data) => Ok(data.id),
            None => Err(Error::invariant("no candidates to select from")),
        }
    }
}
