use std::path::PathBuf;

use derivative::Derivative;
use llamabot_core::{
    backend::BackendSettings,
    sampler::{SamplerSetConfig, SamplerStackPolicy},
    split::SplitSettings,
    ChatSettings, ChatTemplate, OverflowPolicy,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backend: BackendSettings,
    pub character: CharacterOption,
    pub sampler_sets: Vec<SamplerSetConfig>,
    pub chat: ChatOption,
    pub storage: StorageOption,
}

#[derive(Debug, Derivative, Clone, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct CharacterOption {
    /// Name the bot speaks under.
    #[derivative(Default(value = "\"Llama\".into()"))]
    pub name: String,
    /// Prompt used by channels that never set their own.
    pub prompt: String,
    pub template: ChatTemplate,
    pub stop_strings: Vec<String>,
}

#[derive(Debug, Derivative, Clone, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct ChatOption {
    #[derivative(Default(value = "512"))]
    pub max_tokens: usize,
    pub split: Option<SplitSettings>,
    #[derivative(Default(value = "3"))]
    pub continue_retry_limit: usize,
    pub stack_policy: SamplerStackPolicy,
    pub overflow: OverflowPolicy,
    #[derivative(Default(value = "\"…\".into()"))]
    pub interrupt_marker: String,
    #[derivative(Default(value = "256"))]
    pub response_reserve: usize,
    #[derivative(Default(value = "32"))]
    pub predict_max_tokens: usize,
    /// Bot turns the driver may take after one external message.
    #[derivative(Default(value = "1"))]
    pub max_autonomous_turns: usize,
    /// Answer the first turn without asking who speaks next.
    #[derivative(Default(value = "true"))]
    pub always_reply: bool,
    pub seed: Option<u64>,
}

#[derive(Debug, Derivative, Clone, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct StorageOption {
    /// One `<channel>.json` per channel.
    #[derivative(Default(value = "\"assets/channels\".into()"))]
    pub channels: PathBuf,
    #[derivative(Default(value = "\"assets/avatars.json\".into()"))]
    pub avatars: PathBuf,
    /// Channel the console talks in.
    pub channel: u64,
}

impl Config {
    /// Chat settings of a channel; its own sampler sets win over the global ones.
    pub fn chat_settings(&self, overrides: Option<&[SamplerSetConfig]>) -> ChatSettings {
        let Self {
            character,
            sampler_sets,
            chat,
            ..
        } = self;
        ChatSettings {
            bot_name: character.name.clone(),
            template: character.template.clone(),
            max_tokens: chat.max_tokens,
            stop_strings: character.stop_strings.clone(),
            interrupt_marker: chat.interrupt_marker.clone(),
            continue_retry_limit: chat.continue_retry_limit,
            split: chat.split.clone(),
            predict_max_tokens: chat.predict_max_tokens,
            response_reserve: chat.response_reserve,
            sampler_sets: overrides
                .map(<[_]>::to_vec)
                .unwrap_or_else(|| sampler_sets.clone()),
            stack_policy: chat.stack_policy,
            overflow: chat.overflow,
            seed: chat.seed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let text = r#"
            [backend]
            model_path = "assets/models/llama.gguf"
            context_length = 8192
            type_v = "q8_0"
            flash_attention = true

            [character]
            name = "Nyx"
            prompt = "You are Nyx."
            stop_strings = ["\nUser:"]

            [character.template]
            stop_token_ids = [128009]

            [[sampler_sets]]
            samplers = [{ type = "Repetition", penalty = 1.2 }, { type = "MinP", p = 0.1 }]
            selector = { type = "TargetedEntropy", target = 0.4 }

            [[sampler_sets]]
            name = "think"
            push = "<think>"
            pop = "</think>"
            selector = { type = "Greedy" }

            [chat]
            max_tokens = 300
            overflow = { slide = { keep = 64, discard = 512 } }
            split = { max_chars = 1900 }

            [storage]
            channel = 42
        "#;
        let config: Config = toml::from_str(text).unwrap();
        config.backend.validate().unwrap();
        assert_eq!(config.sampler_sets.len(), 2);
        assert_eq!(config.storage.channel, 42);

        let settings = config.chat_settings(None);
        assert_eq!(settings.bot_name, "Nyx");
        assert_eq!(settings.template.stop_token_ids, vec![128009]);
        assert_eq!(
            settings.overflow,
            OverflowPolicy::Slide {
                keep: 64,
                discard: 512
            }
        );
        assert_eq!(settings.split.map(|x| x.max_chars), Some(1900));
        assert_eq!(settings.sampler_sets[1].push.as_deref(), Some("<think>"));
    }

    #[test]
    fn channel_overrides_replace_sampler_sets() {
        let config = Config::default();
        let overrides = vec![SamplerSetConfig::default()];
        let settings = config.chat_settings(Some(&overrides));
        assert_eq!(settings.sampler_sets.len(), 1);
        assert!(config.chat_settings(None).sampler_sets.is_empty());
    }

    #[test]
    fn shipped_config_is_valid() {
        let text = include_str!("../../../assets/configs/Config.toml");
        let config: Config = toml::from_str(text).unwrap();
        config.backend.validate().unwrap();
        assert_eq!(config.chat.max_autonomous_turns, 2);
        assert_eq!(config.sampler_sets[0].samplers.len(), 2);
    }
}
