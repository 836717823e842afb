//! Per-channel state kept on disk as JSON.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use anyhow::Result;
use llamabot_core::{sampler::SamplerSetConfig, ChatMessage};
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelSettings {
    /// Replaces the character prompt when set.
    pub prompt: Option<String>,
    /// Hidden notes per user, rendered after the prompt.
    pub thoughts: BTreeMap<String, String>,
    /// Replaces the configured sampler sets when set.
    pub sampler_sets: Option<Vec<SamplerSetConfig>>,
}

impl ChannelSettings {
    /// The prompt message that opens every transcript of this channel.
    pub fn prompt_message(&self, fallback: &str) -> ChatMessage {
        let mut text = self.prompt.as_deref().unwrap_or(fallback).to_string();
        for (user, thought) in &self.thoughts {
            text.push_str(&format!("\n[{user}] {thought}"));
        }
        ChatMessage::prompt(text)
    }
}

/// Reads and writes `<dir>/<channel>.json`.
#[derive(Debug, Clone)]
pub struct ChannelStore {
    dir: PathBuf,
}

impl ChannelStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, channel: u64) -> PathBuf {
        self.dir.join(format!("{channel}.json"))
    }

    /// A channel without a file gets default settings.
    pub fn load(&self, channel: u64) -> Result<ChannelSettings> {
        let path = self.path(channel);
        if !path.exists() {
            return Ok(Default::default());
        }
        let contents = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn save(&self, channel: u64, settings: &ChannelSettings) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let contents = serde_json::to_string_pretty(settings)?;
        std::fs::write(self.path(channel), contents)?;
        log::info!("[channel][save] {channel}");
        Ok(())
    }
}

/// Avatar URLs by channel, then user name.
#[derive(Debug, Default, Clone)]
pub struct AvatarCache {
    entries: BTreeMap<u64, BTreeMap<String, String>>,
    path: PathBuf,
}

impl AvatarCache {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let entries = match path.exists() {
            true => serde_json::from_str(&std::fs::read_to_string(path)?)?,
            false => Default::default(),
        };
        Ok(Self {
            entries,
            path: path.into(),
        })
    }

    pub fn get(&self, channel: u64, user: &str) -> Option<&str> {
        self.entries.get(&channel)?.get(user).map(String::as_str)
    }

    pub fn set(&mut self, channel: u64, user: impl Into<String>, url: impl Into<String>) {
        self.entries
            .entry(channel)
            .or_default()
            .insert(user.into(), url.into());
    }

    pub fn save(&self) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(&self.entries)?)?;
        Ok(())
    }
}
