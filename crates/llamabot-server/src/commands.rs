//! Slash commands: a name table with typed options, validated before dispatch.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Mutex, MutexGuard, PoisonError},
};

use flume::Receiver;
use itertools::Itertools;
use llamabot_core::{ChatHandle, ChatResponse, Generation};
use thiserror::Error;

use crate::{
    channel::{AvatarCache, ChannelSettings, ChannelStore},
    driver::TurnDriver,
};

/// Failures shown to the user as a friendly reply.
#[derive(Debug, Error)]
pub enum UserError {
    #[error("no message found")]
    NoMessageFound,
    #[error("this channel type is not supported")]
    ChannelTypeUnsupported,
    #[error("invalid input: {0}")]
    ValidationFailed(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<llamabot_core::Error> for UserError {
    fn from(value: llamabot_core::Error) -> Self {
        Self::Internal(value.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    /// One word.
    String,
    Integer,
    Boolean,
    /// The rest of the line.
    Text,
}

#[derive(Debug, Clone, Copy)]
pub struct OptionSpec {
    pub name: &'static str,
    pub kind: OptionKind,
    pub required: bool,
}

impl OptionSpec {
    pub const fn required(name: &'static str, kind: OptionKind) -> Self {
        Self {
            name,
            kind,
            required: true,
        }
    }

    pub const fn optional(name: &'static str, kind: OptionKind) -> Self {
        Self {
            name,
            kind,
            required: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    String(String),
    Integer(i64),
    Boolean(bool),
}

#[derive(Debug, Default, Clone)]
pub struct Options(HashMap<&'static str, OptionValue>);

impl Options {
    pub fn str(&self, name: &str) -> Option<&str> {
        match self.0.get(name)? {
            OptionValue::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn integer(&self, name: &str) -> Option<i64> {
        match self.0.get(name)? {
            OptionValue::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn boolean(&self, name: &str) -> Option<bool> {
        match self.0.get(name)? {
            OptionValue::Boolean(value) => Some(*value),
            _ => None,
        }
    }
}

/// What a command leaves for the front-end to do.
pub enum Reply {
    Text(String),
    /// A new bot message being generated.
    Response(Receiver<llamabot_core::Result<ChatResponse>>),
    /// Text extending the bot's last message.
    Continuation(Receiver<llamabot_core::Result<ChatResponse>>),
    Prediction(Receiver<llamabot_core::Result<Option<String>>>),
    /// Cached state being dropped once the running generation is done.
    Forget(Receiver<llamabot_core::Result<()>>),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Everything commands of one channel act upon.
pub struct Session {
    pub channel: u64,
    pub bot_name: String,
    pub default_prompt: String,
    pub driver: TurnDriver,
    pub store: ChannelStore,
    pub settings: Mutex<ChannelSettings>,
    pub avatars: Mutex<AvatarCache>,
}

impl Session {
    pub fn handle(&self) -> &ChatHandle {
        self.driver.handle()
    }

    /// Channel zero stands for direct messages, which keep no channel settings.
    pub fn is_direct(&self) -> bool {
        self.channel == 0
    }

    /// Puts the channel prompt at the head of the transcript.
    pub fn refresh_prompt(&self) {
        let prompt = lock(&self.settings).prompt_message(&self.default_prompt);
        self.handle().update(|messages| match messages.first_mut() {
            Some(first) if first.is_prompt() => *first = prompt,
            _ => messages.insert(0, prompt),
        });
    }

    fn update_settings(&self, f: impl FnOnce(&mut ChannelSettings)) -> Result<(), UserError> {
        if self.is_direct() {
            return Err(UserError::ChannelTypeUnsupported);
        }
        {
            let mut settings = lock(&self.settings);
            f(&mut settings);
            self.store.save(self.channel, &settings)?;
        }
        self.refresh_prompt();
        Ok(())
    }
}

pub struct Invocation<'a> {
    pub session: &'a Session,
    pub registry: &'a CommandRegistry,
    pub options: Options,
}

pub type Handler = fn(&Invocation) -> Result<Reply, UserError>;

pub struct Command {
    pub name: &'static str,
    pub description: &'static str,
    pub options: Vec<OptionSpec>,
    pub handler: Handler,
}

impl Command {
    /// Parses the arguments after the command name against the option table.
    pub fn parse(&self, args: &str) -> Result<Options, UserError> {
        let mut options = Options::default();
        let mut rest = args.trim();
        for spec in &self.options {
            let raw = match spec.kind {
                OptionKind::Text => std::mem::take(&mut rest),
                _ => {
                    let (word, tail) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
                    rest = tail.trim_start();
                    word
                }
            };
            if raw.is_empty() {
                match spec.required {
                    true => {
                        return Err(UserError::ValidationFailed(format!(
                            "`{}` is required",
                            spec.name
                        )))
                    }
                    false => continue,
                }
            }
            let value = match spec.kind {
                OptionKind::String | OptionKind::Text => OptionValue::String(raw.to_string()),
                OptionKind::Integer => raw.parse().map(OptionValue::Integer).map_err(|_| {
                    UserError::ValidationFailed(format!("`{}` must be an integer", spec.name))
                })?,
                OptionKind::Boolean => match raw {
                    "true" | "yes" | "on" => OptionValue::Boolean(true),
                    "false" | "no" | "off" => OptionValue::Boolean(false),
                    _ => {
                        return Err(UserError::ValidationFailed(format!(
                            "`{}` must be true or false",
                            spec.name
                        )))
                    }
                },
            };
            options.0.insert(spec.name, value);
        }
        if !rest.is_empty() {
            return Err(UserError::ValidationFailed(format!(
                "unexpected argument `{rest}`"
            )));
        }
        Ok(options)
    }

    pub fn usage(&self) -> String {
        let options = self
            .options
            .iter()
            .map(|x| match x.required {
                true => format!("<{}>", x.name),
                false => format!("[{}]", x.name),
            })
            .join(" ");
        format!("/{} {}", self.name, options).trim_end().to_string()
    }
}

#[derive(Default)]
pub struct CommandRegistryBuilder {
    commands: BTreeMap<&'static str, Command>,
}

impl CommandRegistryBuilder {
    pub fn command(
        mut self,
        name: &'static str,
        description: &'static str,
        options: &[OptionSpec],
        handler: Handler,
    ) -> Self {
        let command = Command {
            name,
            description,
            options: options.to_vec(),
            handler,
        };
        if self.commands.insert(name, command).is_some() {
            log::warn!("[commands] `{name}` registered twice, keeping the last");
        }
        self
    }

    pub fn build(self) -> CommandRegistry {
        CommandRegistry {
            commands: self.commands,
        }
    }
}

pub struct CommandRegistry {
    commands: BTreeMap<&'static str, Command>,
}

impl CommandRegistry {
    pub fn builder() -> CommandRegistryBuilder {
        Default::default()
    }

    pub fn builtin() -> Self {
        use OptionKind::*;
        Self::builder()
            .command("clear", "Clear the conversation.", &[], clear)
            .command("forget", "Drop the model's cached state.", &[], forget)
            .command(
                "prompt",
                "Show or set this channel's prompt.",
                &[OptionSpec::optional("text", Text)],
                prompt,
            )
            .command(
                "think",
                "Set or clear a hidden note about a user.",
                &[OptionSpec::required("user", String), OptionSpec::optional("text", Text)],
                think,
            )
            .command("interrupt", "Stop the running response.", &[], interrupt)
            .command("continue", "Extend the bot's last message.", &[], continue_last)
            .command("predict", "Guess who speaks next.", &[], predict)
            .command(
                "history",
                "Show the latest messages.",
                &[OptionSpec::optional("count", Integer)],
                history,
            )
            .command(
                "avatar",
                "Show or set a user's avatar.",
                &[OptionSpec::required("user", String), OptionSpec::optional("url", String)],
                avatar,
            )
            .command("help", "List commands.", &[], help)
            .build()
    }

    pub fn get(&self, name: &str) -> Option<&Command> {
        self.commands.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Command> {
        self.commands.values()
    }

    /// Runs `/name args...`.
    pub fn execute(&self, session: &Session, line: &str) -> Result<Reply, UserError> {
        let line = line.trim().trim_start_matches('/');
        let (name, args) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let command = self
            .get(name)
            .ok_or_else(|| UserError::ValidationFailed(format!("unknown command `{name}`")))?;
        let options = command.parse(args)?;
        log::debug!("[commands][{name}] {options:?}");
        (command.handler)(&Invocation {
            session,
            registry: self,
            options,
        })
    }
}

fn text(value: impl Into<String>) -> Result<Reply, UserError> {
    Ok(Reply::Text(value.into()))
}

fn clear(invocation: &Invocation) -> Result<Reply, UserError> {
    invocation.session.handle().clear();
    invocation.session.refresh_prompt();
    text("Conversation cleared.")
}

fn forget(invocation: &Invocation) -> Result<Reply, UserError> {
    let receiver = invocation.session.handle().queue_forget(true)?;
    Ok(Reply::Forget(receiver))
}

fn prompt(invocation: &Invocation) -> Result<Reply, UserError> {
    let session = invocation.session;
    match invocation.options.str("text") {
        Some(value) => {
            let value = value.to_string();
            session.update_settings(|settings| settings.prompt = Some(value))?;
            text("Prompt updated.")
        }
        None => {
            let settings = lock(&session.settings);
            text(settings.prompt_message(&session.default_prompt).content)
        }
    }
}

fn think(invocation: &Invocation) -> Result<Reply, UserError> {
    let options = &invocation.options;
    let user = options.str("user").unwrap_or_default().to_string();
    let thought = options.str("text").map(str::to_string);
    let reply = match thought.is_some() {
        true => format!("Noted about {user}."),
        false => format!("Forgot notes about {user}."),
    };
    invocation
        .session
        .update_settings(|settings| match thought {
            Some(thought) => {
                settings.thoughts.insert(user, thought);
            }
            None => {
                settings.thoughts.remove(&user);
            }
        })?;
    text(reply)
}

fn interrupt(invocation: &Invocation) -> Result<Reply, UserError> {
    let running = invocation.session.handle().is_busy();
    invocation.session.driver.cancel();
    match running {
        true => text("Interrupting."),
        false => text("Nothing is running."),
    }
}

fn continue_last(invocation: &Invocation) -> Result<Reply, UserError> {
    let session = invocation.session;
    let last = session.handle().snapshot().pop();
    if !last.is_some_and(|x| x.user == session.bot_name) {
        return Err(UserError::NoMessageFound);
    }
    match session.handle().try_read_response(true)? {
        Generation::Busy => text("Already processing."),
        Generation::Started(receiver) => Ok(Reply::Continuation(receiver)),
    }
}

fn predict(invocation: &Invocation) -> Result<Reply, UserError> {
    match invocation.session.handle().try_predict_next_user()? {
        Generation::Busy => text("Already processing."),
        Generation::Started(receiver) => Ok(Reply::Prediction(receiver)),
    }
}

fn history(invocation: &Invocation) -> Result<Reply, UserError> {
    let count = match invocation.options.integer("count") {
        Some(count) if count <= 0 => {
            return Err(UserError::ValidationFailed("`count` must be positive".into()))
        }
        Some(count) => count as usize,
        None => 10,
    };
    let messages = invocation.session.handle().snapshot();
    let lines = messages
        .iter()
        .filter(|x| !x.is_prompt())
        .rev()
        .take(count)
        .collect_vec()
        .into_iter()
        .rev()
        .map(|x| format!("{}: {}", x.user, x.content))
        .join("\n");
    match lines.is_empty() {
        true => Err(UserError::NoMessageFound),
        false => text(lines),
    }
}

fn avatar(invocation: &Invocation) -> Result<Reply, UserError> {
    let session = invocation.session;
    let user = invocation.options.str("user").unwrap_or_default();
    let mut avatars = lock(&session.avatars);
    match invocation.options.str("url") {
        Some(url) => {
            if !url.starts_with("https://") && !url.starts_with("http://") {
                return Err(UserError::ValidationFailed("`url` must be an http(s) URL".into()));
            }
            avatars.set(session.channel, user, url);
            avatars.save()?;
            text(format!("Avatar of {user} updated."))
        }
        None => match avatars.get(session.channel, user) {
            Some(url) => text(url),
            None => text(format!("{user} has no avatar.")),
        },
    }
}

fn help(invocation: &Invocation) -> Result<Reply, UserError> {
    let lines = invocation
        .registry
        .iter()
        .map(|x| format!("{:<28}{}", x.usage(), x.description))
        .join("\n");
    text(lines)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> CommandRegistry {
        CommandRegistry::builtin()
    }

    #[test]
    fn parses_words_and_rest_of_line() {
        let registry = registry();
        let think = registry.get("think").unwrap();
        let options = think.parse("Alice  likes long walks").unwrap();
        assert_eq!(options.str("user"), Some("Alice"));
        assert_eq!(options.str("text"), Some("likes long walks"));

        let options = think.parse("Alice").unwrap();
        assert_eq!(options.str("text"), None);
    }

    #[test]
    fn validates_option_schema() {
        let registry = registry();
        assert!(matches!(
            registry.get("think").unwrap().parse(""),
            Err(UserError::ValidationFailed(_))
        ));
        assert!(matches!(
            registry.get("history").unwrap().parse("many"),
            Err(UserError::ValidationFailed(_))
        ));
        assert!(matches!(
            registry.get("clear").unwrap().parse("now"),
            Err(UserError::ValidationFailed(_))
        ));
        let options = registry.get("history").unwrap().parse("5").unwrap();
        assert_eq!(options.integer("count"), Some(5));
    }

    #[test]
    fn booleans_accept_common_spellings() {
        let command = Command {
            name: "toggle",
            description: "",
            options: vec![OptionSpec::required("on", OptionKind::Boolean)],
            handler: help,
        };
        assert_eq!(command.parse("yes").unwrap().boolean("on"), Some(true));
        assert_eq!(command.parse("off").unwrap().boolean("on"), Some(false));
        assert!(command.parse("maybe").is_err());
    }

    #[test]
    fn usage_marks_required_options() {
        let registry = registry();
        assert_eq!(registry.get("avatar").unwrap().usage(), "/avatar <user> [url]");
        assert_eq!(registry.get("clear").unwrap().usage(), "/clear");
        assert_eq!(registry.iter().count(), 10);
    }
}
