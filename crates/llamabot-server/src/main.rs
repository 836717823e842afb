use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use clap::{command, CommandFactory, Parser};
use llamabot_core::{ChatHandle, ChatSettings};
use llamabot_server::{
    channel::{AvatarCache, ChannelStore},
    commands::{CommandRegistry, Session},
    config::Config,
    console,
    driver::TurnDriver,
    load_config,
};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Log generation details.
    #[arg(long, short)]
    verbose: bool,
}

#[cfg(feature = "llama-cpp")]
fn spawn_context(config: &Config, settings: ChatSettings) -> Result<ChatHandle> {
    use llamabot_core::ChatContext;
    use llamabot_server::llama::LlamaCppBackend;

    let backend = config.backend.clone();
    let handle = ChatHandle::spawn(move || {
        let backend = LlamaCppBackend::load(&backend)?;
        ChatContext::new(backend, settings)
    })?;
    Ok(handle)
}

#[cfg(not(feature = "llama-cpp"))]
fn spawn_context(_config: &Config, _settings: ChatSettings) -> Result<ChatHandle> {
    anyhow::bail!("no inference backend compiled in; rebuild with `--features llama-cpp`")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        true => log::LevelFilter::Debug,
        false => log::LevelFilter::Info,
    };
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Warn)
        .with_module_level("llamabot_server", level)
        .with_module_level("llamabot_core", level)
        .init()?;

    let cmd = Args::command();
    let version = cmd.get_version().unwrap_or("0.0.1");
    let bin_name = cmd.get_bin_name().unwrap_or("llamabot");
    log::info!("{}\tversion: {}", bin_name, version);

    let path = args
        .config
        .clone()
        .unwrap_or("assets/configs/Config.toml".into());
    log::info!("reading config {}...", path.to_string_lossy());
    let config = load_config(path).await?;
    config.backend.validate()?;

    let channel = config.storage.channel;
    let store = ChannelStore::new(&config.storage.channels);
    let channel_settings = store.load(channel)?;
    let avatars = AvatarCache::load(&config.storage.avatars)?;
    let settings = config.chat_settings(channel_settings.sampler_sets.as_deref());

    let handle = {
        let config = config.clone();
        tokio::task::spawn_blocking(move || spawn_context(&config, settings)).await??
    };

    let driver = TurnDriver::new(
        handle,
        config.character.name.clone(),
        config.chat.max_autonomous_turns,
        config.chat.always_reply,
    );
    let session = Arc::new(Session {
        channel,
        bot_name: config.character.name.clone(),
        default_prompt: config.character.prompt.clone(),
        driver,
        store,
        settings: channel_settings.into(),
        avatars: avatars.into(),
    });
    session.refresh_prompt();

    console::run(session, Arc::new(CommandRegistry::builtin())).await
}
