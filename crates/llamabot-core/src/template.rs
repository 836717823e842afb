use derivative::Derivative;
use serde::{Deserialize, Serialize};

use crate::{
    backend::{NativeBackend, Vocabulary},
    token::{Token, TokenId, TokenMask},
    Result,
};

/// One logical chat turn, independent of tokenization.
#[derive(Debug, Clone, PartialEq, Eq, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct ChatMessage {
    pub user: String,
    pub content: String,
    /// Id of the message on the chat platform, if it came from one.
    pub external_id: Option<u64>,
    #[derivative(Default(value = "TokenMask::USER"))]
    pub content_mask: TokenMask,
    /// Render the content alone, without header or terminator.
    pub content_only: bool,
}

impl ChatMessage {
    pub fn new(user: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_mask(self, content_mask: TokenMask) -> Self {
        Self {
            content_mask,
            ..self
        }
    }

    pub fn with_external_id(self, external_id: u64) -> Self {
        Self {
            external_id: Some(external_id),
            ..self
        }
    }

    pub fn prompt(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            content_mask: TokenMask::PROMPT,
            content_only: true,
            ..Default::default()
        }
    }

    pub fn is_prompt(&self) -> bool {
        self.content_mask.contains(TokenMask::PROMPT)
    }
}

/// Renders messages as `start_header user end_header content end_message`.
#[derive(Debug, Clone, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct ChatTemplate {
    #[derivative(Default(value = "\"<|start_header_id|>\".into()"))]
    pub start_header: String,
    #[derivative(Default(value = "\"<|end_header_id|>\\n\\n\".into()"))]
    pub end_header: String,
    #[derivative(Default(value = "\"<|eot_id|>\".into()"))]
    pub end_message: String,
    pub stop_token_ids: Vec<TokenId>,
    #[derivative(Default(value = "true"))]
    pub add_bos: bool,
}

impl ChatTemplate {
    pub fn render(&self, message: &ChatMessage, complete: bool) -> String {
        let mut text = String::new();
        if !message.content_only {
            text.push_str(&self.start_header);
            text.push_str(&message.user);
            text.push_str(&self.end_header);
        }
        text.push_str(&message.content);
        if complete && !message.content_only {
            text.push_str(&self.end_message);
        }
        text
    }

    fn tokens<B: NativeBackend + ?Sized>(
        backend: &B,
        vocab: &Vocabulary,
        text: &str,
        mask: TokenMask,
        add_bos: bool,
    ) -> Result<Vec<Token>> {
        if text.is_empty() && !add_bos {
            return Ok(vec![]);
        }
        let ids = backend.tokenize(text, add_bos)?;
        Ok(ids.into_iter().map(|id| vocab.token(id, mask)).collect())
    }

    /// Tokens of the header that opens a turn of `user`.
    pub fn header<B: NativeBackend + ?Sized>(
        &self,
        backend: &B,
        vocab: &Vocabulary,
        user: &str,
    ) -> Result<Vec<Token>> {
        let text = format!("{}{}{}", self.start_header, user, self.end_header);
        Self::tokens(backend, vocab, &text, TokenMask::TEMPLATE, false)
    }

    /// Tokens of the header opening without the user name.
    pub fn start<B: NativeBackend + ?Sized>(
        &self,
        backend: &B,
        vocab: &Vocabulary,
    ) -> Result<Vec<Token>> {
        Self::tokens(backend, vocab, &self.start_header, TokenMask::TEMPLATE, false)
    }

    pub fn bos<B: NativeBackend + ?Sized>(
        &self,
        backend: &B,
        vocab: &Vocabulary,
    ) -> Result<Vec<Token>> {
        match self.add_bos {
            true => Self::tokens(backend, vocab, "", TokenMask::TEMPLATE, true),
            false => Ok(vec![]),
        }
    }

    /// Tokenizes a message with template parts and content masked separately.
    /// An incomplete message leaves its terminator off so it can be continued.
    pub fn tokenize<B: NativeBackend + ?Sized>(
        &self,
        backend: &B,
        vocab: &Vocabulary,
        message: &ChatMessage,
        complete: bool,
    ) -> Result<Vec<Token>> {
        let mut tokens = vec![];
        if !message.content_only {
            tokens.extend(self.header(backend, vocab, &message.user)?);
        }
        tokens.extend(Self::tokens(
            backend,
            vocab,
            &message.content,
            message.content_mask,
            false,
        )?);
        if complete && !message.content_only {
            tokens.extend(Self::tokens(
                backend,
                vocab,
                &self.end_message,
                TokenMask::TEMPLATE,
                false,
            )?);
        }
        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::scripted::ScriptedBackend;

    fn template() -> ChatTemplate {
        ChatTemplate {
            start_header: "<h>".into(),
            end_header: "</h>".into(),
            end_message: "<e>".into(),
            stop_token_ids: vec![2],
            add_bos: false,
        }
    }

    #[test]
    fn renders_header_content_terminator() {
        let message = ChatMessage::new("Alice", "hi");
        assert_eq!(template().render(&message, true), "<h>Alice</h>hi<e>");
        assert_eq!(template().render(&message, false), "<h>Alice</h>hi");
        assert_eq!(template().render(&ChatMessage::prompt("sys"), true), "sys");
    }

    #[test]
    fn masks_template_and_content() {
        let backend = ScriptedBackend::new(["<h>", "</h>", "<e>", "Alice", "hi"]);
        let vocab = Vocabulary::load(&backend).unwrap();
        let message = ChatMessage::new("Alice", "hi");
        let tokens = template().tokenize(&backend, &vocab, &message, true).unwrap();
        let masks: Vec<TokenMask> = tokens.iter().map(|x| x.mask).collect();
        assert_eq!(
            masks,
            vec![
                TokenMask::TEMPLATE,
                TokenMask::TEMPLATE,
                TokenMask::TEMPLATE,
                TokenMask::USER,
                TokenMask::TEMPLATE,
            ]
        );
        assert_eq!(tokens[3].value, "hi");
    }
}
