use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use derivative::Derivative;
use serde::{Deserialize, Serialize};

use crate::{
    backend::{NativeBackend, Vocabulary},
    kv::{self, KvCacheState, PointerArray, SyncReport},
    logit::{Lifetime, LogitBias, LogitRule, LogitRuleCollection},
    sampler::{
        SampleContext, SamplerRegistry, SamplerSet, SamplerSetConfig, SamplerSetStack,
        SamplerStackPolicy,
    },
    split::{self, SplitPoint, SplitSettings},
    template::{ChatMessage, ChatTemplate},
    token::{SequencedToken, Token, TokenDataArray, TokenId, TokenMask},
    Error, Result,
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// A stop token or stop string ended the response.
    #[default]
    Stop,
    /// `max_tokens` was reached.
    Length,
    /// The running flag was cleared mid-response.
    Interrupted,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct TokenCounter {
    #[serde(alias = "prompt_tokens")]
    pub prompt: usize,
    #[serde(alias = "completion_tokens")]
    pub completion: usize,
    #[serde(alias = "total_tokens")]
    pub total: usize,
    pub duration: Duration,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    #[default]
    Idle,
    Evaluating,
    Interrupted,
    Completed,
}

/// What to do when a generated token no longer fits the context.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// End the attempt with an out-of-context error.
    #[default]
    Fail,
    /// Drop `discard` tokens after the first `keep` and carry on.
    Slide { keep: usize, discard: usize },
}

#[derive(Debug, Clone, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct ChatSettings {
    #[derivative(Default(value = "\"Bot\".into()"))]
    pub bot_name: String,
    pub template: ChatTemplate,
    /// Zero means no limit besides the context size.
    #[derivative(Default(value = "512"))]
    pub max_tokens: usize,
    pub stop_strings: Vec<String>,
    #[derivative(Default(value = "\"…\".into()"))]
    pub interrupt_marker: String,
    /// How many times a stop as the first continued token is blocked.
    #[derivative(Default(value = "3"))]
    pub continue_retry_limit: usize,
    pub split: Option<SplitSettings>,
    #[derivative(Default(value = "32"))]
    pub predict_max_tokens: usize,
    /// Room kept free for the response when old messages are dropped.
    #[derivative(Default(value = "256"))]
    pub response_reserve: usize,
    pub sampler_sets: Vec<SamplerSetConfig>,
    pub stack_policy: SamplerStackPolicy,
    pub overflow: OverflowPolicy,
    pub seed: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub messages: Vec<ChatMessage>,
    pub finish: FinishReason,
    pub counter: TokenCounter,
}

impl ChatResponse {
    /// All generated text joined back together.
    pub fn content(&self) -> String {
        self.messages
            .iter()
            .map(|x| x.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// How the rebuilt buffer ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tail {
    /// Open a new bot turn.
    Respond,
    /// Leave the last message open to extend it.
    Continue,
    /// Open a turn without naming its speaker.
    Predict,
}

/// A conversation bound to one native context.
pub struct ChatContext<B> {
    backend: B,
    settings: ChatSettings,
    vocab: Vocabulary,
    buffer: PointerArray<SequencedToken>,
    cache: KvCacheState,
    rules: LogitRuleCollection,
    samplers: SamplerSetStack,
    split_marker: Option<TokenId>,
    rng: fastrand::Rng,
    running: Arc<AtomicBool>,
}

/// Resolves trigger text that must map onto exactly one token.
fn single_token<B: NativeBackend + ?Sized>(backend: &B, text: &str) -> Result<TokenId> {
    match backend.tokenize(text, false)?[..] {
        [id] => Ok(id),
        ref ids => Err(Error::InvalidSettings(format!(
            "`{text}` is {} tokens, expected exactly one",
            ids.len()
        ))),
    }
}

impl<B: NativeBackend> ChatContext<B> {
    pub fn new(backend: B, settings: ChatSettings) -> Result<Self> {
        Self::with_registry(backend, settings, &SamplerRegistry::builtin())
    }

    pub fn with_registry(
        backend: B,
        settings: ChatSettings,
        registry: &SamplerRegistry,
    ) -> Result<Self> {
        let n_ctx = backend.n_ctx();
        if settings.response_reserve >= n_ctx {
            return Err(Error::InvalidSettings(format!(
                "response reserve {} does not fit context {n_ctx}",
                settings.response_reserve
            )));
        }
        if let OverflowPolicy::Slide { keep, discard } = settings.overflow {
            if discard == 0 || keep + discard >= n_ctx {
                return Err(Error::InvalidSettings(format!(
                    "cannot slide {discard} tokens after {keep} in context {n_ctx}"
                )));
            }
        }

        let vocab = Vocabulary::load(&backend)?;
        let configs = match settings.sampler_sets.is_empty() {
            true => vec![SamplerSetConfig::default()],
            false => settings.sampler_sets.clone(),
        };
        let sets = configs
            .iter()
            .map(|config| SamplerSet::build(config, registry, |text| single_token(&backend, text)))
            .collect::<Result<Vec<_>>>()?;
        let samplers = SamplerSetStack::new(sets)?;
        let split_marker = settings
            .split
            .as_ref()
            .map(|split| single_token(&backend, &split.marker))
            .transpose()?;
        let rng = match settings.seed {
            Some(seed) => fastrand::Rng::with_seed(seed),
            None => fastrand::Rng::new(),
        };

        log::info!("[context] created with {n_ctx} cells, {} vocab", vocab.len());
        Ok(Self {
            backend,
            settings,
            vocab,
            buffer: PointerArray::new(n_ctx),
            cache: KvCacheState::new(n_ctx),
            rules: LogitRuleCollection::new(),
            samplers,
            split_marker,
            rng,
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn settings(&self) -> &ChatSettings {
        &self.settings
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn vocab(&self) -> &Vocabulary {
        &self.vocab
    }

    pub fn buffer(&self) -> &PointerArray<SequencedToken> {
        &self.buffer
    }

    pub fn cache(&self) -> &KvCacheState {
        &self.cache
    }

    pub fn rules(&self) -> &LogitRuleCollection {
        &self.rules
    }

    pub fn rules_mut(&mut self) -> &mut LogitRuleCollection {
        &mut self.rules
    }

    pub fn add_rule(&mut self, rule: impl Into<LogitRule>) {
        self.rules.add_or_update(rule);
    }

    pub fn samplers(&self) -> &SamplerSetStack {
        &self.samplers
    }

    /// Cleared to interrupt generation; checked once per produced token.
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Drops the buffer and the sampler stack. With `native` the backend cache
    /// and its mirror go too; without it the mirror is kept so the next sync
    /// reconciles against what the backend still holds.
    pub fn forget(&mut self, native: bool) -> Result<()> {
        self.buffer.clear();
        self.samplers.reset();
        self.samplers.reset_selectors();
        if native {
            self.cache.clear();
            self.backend.clear_cache()?;
        }
        log::info!("[context][forget][native: {native}]");
        Ok(())
    }

    pub fn evaluate(&mut self) -> Result<SyncReport> {
        kv::evaluate(&mut self.cache, &self.buffer, &mut self.backend)
    }

    /// Rewrites the buffer from `messages`, dropping the oldest non-prompt
    /// messages until the prompt and the response reserve fit.
    fn rebuild(&mut self, messages: &[ChatMessage], tail: Tail) -> Result<usize> {
        let template = &self.settings.template;
        let backend = &self.backend;
        let vocab = &self.vocab;

        let last = messages.len().saturating_sub(1);
        let mut rendered = messages
            .iter()
            .enumerate()
            .map(|(index, message)| {
                let complete = !(tail == Tail::Continue && index == last);
                let tokens = template.tokenize(backend, vocab, message, complete)?;
                Ok((message.is_prompt(), tokens))
            })
            .collect::<Result<Vec<_>>>()?;
        let head = template.bos(backend, vocab)?;
        let end = match tail {
            Tail::Respond => template.header(backend, vocab, &self.settings.bot_name)?,
            Tail::Continue => vec![],
            Tail::Predict => template.start(backend, vocab)?,
        };

        let budget = self.buffer.capacity() - self.settings.response_reserve;
        let mut total = head.len() + end.len() + rendered.iter().map(|(_, x)| x.len()).sum::<usize>();
        let mut dropped = 0;
        while total > budget {
            // the message being continued is never dropped
            let droppable = rendered.len() - usize::from(tail == Tail::Continue);
            let Some(index) = rendered[..droppable].iter().position(|(prompt, _)| !prompt) else {
                return Err(Error::OutOfContext {
                    capacity: budget,
                    requested: total,
                });
            };
            let (_, tokens) = rendered.remove(index);
            total -= tokens.len();
            dropped += 1;
        }
        if dropped > 0 {
            log::info!("[context][rebuild] dropped {dropped} old messages");
        }

        self.buffer.clear();
        let tokens = head
            .into_iter()
            .chain(rendered.into_iter().flat_map(|(_, x)| x))
            .chain(end)
            .map(SequencedToken::single);
        self.buffer.extend(tokens)?;
        Ok(total)
    }

    fn prime_samplers(&mut self) {
        match self.settings.stack_policy {
            SamplerStackPolicy::Reset => self.samplers.reset(),
            SamplerStackPolicy::Persist => {}
            SamplerStackPolicy::Replay => {
                let tokens = self.buffer.iter().map(SequencedToken::id).collect::<Vec<_>>();
                self.samplers.replay(tokens);
            }
        }
    }

    /// Appends one token, applying the overflow policy when the buffer is full.
    fn write_token(&mut self, token: Token) -> Result<()> {
        if self.buffer.available() == 0 {
            match self.settings.overflow {
                OverflowPolicy::Fail => {
                    return Err(Error::OutOfContext {
                        capacity: self.buffer.capacity(),
                        requested: self.buffer.len() + 1,
                    })
                }
                OverflowPolicy::Slide { keep, discard } => {
                    log::info!("[context][slide][keep: {keep}][discard: {discard}]");
                    self.buffer.slide(keep + discard, discard)?;
                }
            }
        }
        self.samplers.accept(token.id);
        self.buffer.write(SequencedToken::single(token))
    }

    /// Runs the active sampler set over the current logits. Also returns the
    /// probability the split marker had at this step.
    fn sample_token(&mut self) -> Result<(TokenId, f32)> {
        let logits = self.backend.logits()?;
        if logits.len() != self.vocab.len() {
            return Err(Error::Backend(format!(
                "logits have {} entries, vocabulary has {}",
                logits.len(),
                self.vocab.len()
            )));
        }
        let mut candidates = TokenDataArray::from_logits(logits);
        let mut original = candidates.clone();
        original.softmax();
        let marker_p = self
            .split_marker
            .and_then(|id| original.get(id).ok())
            .map(|x| x.p)
            .unwrap_or_default();

        let mut context = SampleContext {
            candidates: &mut candidates,
            original: &original,
            history: self.buffer.as_slice(),
            vocab: &self.vocab,
            rng: &mut self.rng,
        };
        let token = self.samplers.current().sample(&mut self.rules, &mut context)?;
        Ok((token, marker_p))
    }

    /// Earliest byte offset in `text` where a stop string starts.
    fn find_stop(&self, text: &str) -> Option<usize> {
        self.settings
            .stop_strings
            .iter()
            .filter(|x| !x.is_empty())
            .filter_map(|x| text.find(x.as_str()))
            .min()
    }

    /// Generates the bot's next message from `messages`.
    ///
    /// With `continue_last` the last message is extended instead of opening a
    /// new turn. Errors that leave the cache mirror untrustworthy also make the
    /// context forget everything, native cache included.
    pub fn read_response(
        &mut self,
        messages: &[ChatMessage],
        continue_last: bool,
    ) -> Result<ChatResponse> {
        let result = self.generate(messages, continue_last);
        self.rules.remove_lifetime(Lifetime::Token);
        self.rules.remove_lifetime(Lifetime::Message);
        self.running.store(true, Ordering::SeqCst);
        if let Err(err) = &result {
            log::error!("[context] generation failed: {err}");
            if err.is_fatal() {
                if let Err(err) = self.forget(true) {
                    log::error!("[context] forget failed: {err}");
                }
            }
        }
        result
    }

    fn generate(&mut self, messages: &[ChatMessage], continue_last: bool) -> Result<ChatResponse> {
        let start = Instant::now();
        let tail = match continue_last {
            true => Tail::Continue,
            false => Tail::Respond,
        };
        let prompt = self.rebuild(messages, tail)?;
        self.prime_samplers();
        let pushed = self.samplers.pushed().to_vec();
        self.evaluate()?;

        let mut produced: Vec<Token> = vec![];
        let mut points: Vec<SplitPoint> = vec![];
        let mut text = String::new();
        let mut retries = 0;

        let finish = loop {
            if !self.running.load(Ordering::SeqCst) {
                log::info!("[context][interrupted]");
                break FinishReason::Interrupted;
            }
            if self.settings.max_tokens > 0 && produced.len() >= self.settings.max_tokens {
                break FinishReason::Length;
            }

            let (id, marker_p) = self.sample_token()?;
            let piece = self.vocab.piece(id).to_string();

            let stop_token = self.settings.template.stop_token_ids.contains(&id);
            let candidate = format!("{text}{piece}");
            let stop_at = match stop_token {
                true => Some(text.len()),
                false => self.find_stop(&candidate),
            };

            let Some(at) = stop_at else {
                self.rules.remove_lifetime(Lifetime::Token);
                self.write_token(self.vocab.token(id, TokenMask::BOT))?;
                text = candidate;
                produced.push(self.vocab.token(id, TokenMask::BOT));
                points.push(SplitPoint {
                    text: piece,
                    marker_p,
                });
                self.evaluate()?;
                continue;
            };

            if continue_last && produced.is_empty() && retries < self.settings.continue_retry_limit {
                retries += 1;
                log::debug!("[context][continue][blocked: {id}][retry: {retries}]");
                self.rules.add_or_update(LogitBias::block(id, Lifetime::Token));
                continue;
            }

            self.rules.remove_lifetime(Lifetime::Token);

            // roll back tokens that run into the stop, then re-add what precedes it
            let mut covered = text.len();
            let produced_len = produced.len();
            while covered > at {
                let Some(token) = produced.pop() else {
                    break;
                };
                points.pop();
                covered -= token.value.len();
                self.buffer.truncate(self.buffer.len() - 1);
            }
            if produced.len() < produced_len {
                self.samplers
                    .rewind(&pushed, produced.iter().map(|token| token.id));
            }
            let rest = &candidate[covered..at];
            if !rest.is_empty() {
                for id in self.backend.tokenize(rest, false)? {
                    let token = self.vocab.token(id, TokenMask::BOT);
                    self.write_token(token.clone())?;
                    points.push(SplitPoint {
                        text: token.value.clone(),
                        marker_p: 0.0,
                    });
                    produced.push(token);
                }
            }
            text = candidate[..at].to_string();
            log::debug!("[context][stop][token: {stop_token}][at: {at}]");
            break FinishReason::Stop;
        };

        let mut contents = match (&self.settings.split, continue_last) {
            (Some(settings), false) => split::split(&points, settings),
            _ => vec![text],
        };
        for content in contents.iter_mut() {
            *content = match continue_last {
                true => content.trim_end().to_string(),
                false => content.trim().to_string(),
            };
        }
        contents.retain(|x| !x.is_empty());
        if finish == FinishReason::Interrupted {
            match contents.last_mut() {
                Some(last) => last.push_str(&self.settings.interrupt_marker),
                None => contents.push(self.settings.interrupt_marker.clone()),
            }
        }

        let messages = contents
            .into_iter()
            .map(|content| ChatMessage::new(&self.settings.bot_name, content).with_mask(TokenMask::BOT))
            .collect();
        let counter = TokenCounter {
            prompt,
            completion: produced.len(),
            total: prompt + produced.len(),
            duration: start.elapsed(),
        };
        log::info!(
            "[context][done][finish: {finish:?}][prompt: {prompt}][completion: {}]",
            counter.completion
        );
        Ok(ChatResponse {
            messages,
            finish,
            counter,
        })
    }

    /// Opens a new turn without a speaker and lets the model name one.
    ///
    /// Returns `None` when no header end shows up within `predict_max_tokens`.
    pub fn predict_next_user(&mut self, messages: &[ChatMessage]) -> Result<Option<String>> {
        let result = self.predict(messages);
        self.running.store(true, Ordering::SeqCst);
        if let Err(err) = &result {
            log::error!("[context] prediction failed: {err}");
            if err.is_fatal() {
                if let Err(err) = self.forget(true) {
                    log::error!("[context] forget failed: {err}");
                }
            }
        }
        result
    }

    fn predict(&mut self, messages: &[ChatMessage]) -> Result<Option<String>> {
        self.rebuild(messages, Tail::Predict)?;
        self.evaluate()?;

        let end_header = self.settings.template.end_header.clone();
        let mut text = String::new();
        for _ in 0..self.settings.predict_max_tokens {
            if !self.running.load(Ordering::SeqCst) {
                return Ok(None);
            }
            let logits = self.backend.logits()?;
            let Some(id) = logits
                .iter()
                .enumerate()
                .max_by(|x, y| x.1.total_cmp(y.1))
                .map(|(id, _)| id as TokenId)
            else {
                return Ok(None);
            };
            if self.settings.template.stop_token_ids.contains(&id) {
                return Ok(None);
            }
            text.push_str(self.vocab.piece(id));
            if let Some(at) = text.find(end_header.as_str()) {
                let name = text[..at].trim().to_string();
                log::debug!("[context][predict][user: {name}]");
                return Ok(Some(name));
            }
            self.write_token(self.vocab.token(id, TokenMask::TEMPLATE))?;
            self.evaluate()?;
        }
        Ok(None)
    }
}
