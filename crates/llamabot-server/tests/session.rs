use std::{sync::Mutex, time::Duration};

use llamabot_core::{
    backend::scripted::ScriptedBackend,
    sampler::{SamplerConfig, SamplerSetConfig},
    ChatContext, ChatHandle, ChatMessage, ChatSettings, ChatTemplate, Generation, TokenId,
};
use llamabot_server::{
    channel::{AvatarCache, ChannelSettings, ChannelStore},
    commands::{CommandRegistry, Reply, Session, UserError},
    driver::{TurnDriver, TurnEnd},
};

const PIECES: [&str; 12] = [
    "<h>", "</h>", "<e>", "Bot", "Alice", " hello", "hello", "hi", "\n", " ", "h", "!",
];
const END_HEADER: TokenId = 1;
const STOP: TokenId = 2;
const BOT: TokenId = 3;
const ALICE: TokenId = 4;
const HELLO: TokenId = 5;

fn settings() -> ChatSettings {
    ChatSettings {
        template: ChatTemplate {
            start_header: "<h>".into(),
            end_header: "</h>".into(),
            end_message: "<e>".into(),
            stop_token_ids: vec![STOP],
            add_bos: false,
        },
        sampler_sets: vec![SamplerSetConfig {
            selector: SamplerConfig::new("Greedy"),
            ..Default::default()
        }],
        response_reserve: 16,
        ..Default::default()
    }
}

fn handle(rows: &[TokenId]) -> ChatHandle {
    let rows = rows.to_vec();
    ChatHandle::spawn(move || {
        let mut backend = ScriptedBackend::new(PIECES).with_context_size(128);
        for token in rows {
            backend = backend.with_favorite(token, 5.0);
        }
        ChatContext::new(backend, settings())
    })
    .unwrap()
}

fn session(channel: u64, dir: &tempfile::TempDir) -> Session {
    session_with(channel, dir, handle(&[STOP]))
}

fn session_with(channel: u64, dir: &tempfile::TempDir, handle: ChatHandle) -> Session {
    let store = ChannelStore::new(dir.path().join("channels"));
    let settings = store.load(channel).unwrap();
    let avatars = AvatarCache::load(dir.path().join("avatars.json")).unwrap();
    let session = Session {
        channel,
        bot_name: "Bot".into(),
        default_prompt: "You are Bot.".into(),
        driver: TurnDriver::new(handle, "Bot", 1, true),
        store,
        settings: Mutex::new(settings),
        avatars: Mutex::new(avatars),
    };
    session.refresh_prompt();
    session
}

fn reply_text(reply: Result<Reply, UserError>) -> String {
    match reply.unwrap() {
        Reply::Text(text) => text,
        _ => panic!("expected a text reply"),
    }
}

#[test]
fn missing_channel_file_gives_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let store = ChannelStore::new(dir.path());
    let settings = store.load(7).unwrap();
    assert!(settings.prompt.is_none());
    assert!(settings.thoughts.is_empty());
    assert!(settings.sampler_sets.is_none());
}

#[test]
fn channel_settings_survive_reload() {
    let dir = tempfile::tempdir().unwrap();
    let store = ChannelStore::new(dir.path().join("nested"));
    let mut settings = ChannelSettings {
        prompt: Some("Be brief.".into()),
        ..Default::default()
    };
    settings.thoughts.insert("Alice".into(), "likes tea".into());
    store.save(7, &settings).unwrap();

    let loaded = store.load(7).unwrap();
    assert_eq!(loaded.prompt.as_deref(), Some("Be brief."));
    assert_eq!(loaded.thoughts.get("Alice").map(String::as_str), Some("likes tea"));
    assert_eq!(
        loaded.prompt_message("unused").content,
        "Be brief.\n[Alice] likes tea"
    );
}

#[test]
fn avatars_are_kept_per_channel() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("avatars.json");
    let mut avatars = AvatarCache::load(&path).unwrap();
    avatars.set(1, "Alice", "https://example.com/a.png");
    avatars.save().unwrap();

    let avatars = AvatarCache::load(&path).unwrap();
    assert_eq!(avatars.get(1, "Alice"), Some("https://example.com/a.png"));
    assert_eq!(avatars.get(2, "Alice"), None);
}

#[test]
fn thoughts_reach_the_prompt_and_disk() {
    let dir = tempfile::tempdir().unwrap();
    let session = session(5, &dir);
    let registry = CommandRegistry::builtin();

    reply_text(registry.execute(&session, "/think Alice likes tea"));
    let first = session.handle().snapshot().remove(0);
    assert!(first.is_prompt());
    assert_eq!(first.content, "You are Bot.\n[Alice] likes tea");
    assert_eq!(session.handle().len(), 1);

    let stored = session.store.load(5).unwrap();
    assert_eq!(stored.thoughts.get("Alice").map(String::as_str), Some("likes tea"));

    reply_text(registry.execute(&session, "/think Alice"));
    let first = session.handle().snapshot().remove(0);
    assert_eq!(first.content, "You are Bot.");
}

#[test]
fn direct_messages_keep_no_settings() {
    let dir = tempfile::tempdir().unwrap();
    let session = session(0, &dir);
    let registry = CommandRegistry::builtin();

    assert!(matches!(
        registry.execute(&session, "/prompt Be brief."),
        Err(UserError::ChannelTypeUnsupported)
    ));
    assert_eq!(
        reply_text(registry.execute(&session, "/prompt")),
        "You are Bot."
    );
}

#[test]
fn commands_without_messages_report_it() {
    let dir = tempfile::tempdir().unwrap();
    let session = session(5, &dir);
    let registry = CommandRegistry::builtin();

    assert!(matches!(
        registry.execute(&session, "/history"),
        Err(UserError::NoMessageFound)
    ));
    assert!(matches!(
        registry.execute(&session, "/continue"),
        Err(UserError::NoMessageFound)
    ));
    assert!(matches!(
        registry.execute(&session, "/avatar Alice ftp://example.com"),
        Err(UserError::ValidationFailed(_))
    ));
    assert!(matches!(
        registry.execute(&session, "/nothing"),
        Err(UserError::ValidationFailed(_))
    ));
}

#[test]
fn history_lists_latest_messages() {
    let dir = tempfile::tempdir().unwrap();
    let session = session(5, &dir);
    let registry = CommandRegistry::builtin();
    for content in ["one", "two", "three"] {
        session.handle().push(ChatMessage::new("Alice", content));
    }

    assert_eq!(
        reply_text(registry.execute(&session, "/history 2")),
        "Alice: two\nAlice: three"
    );
    reply_text(registry.execute(&session, "/clear"));
    assert_eq!(session.handle().len(), 1);
}

#[tokio::test]
async fn bot_replies_then_yields_to_predicted_speaker() {
    // reply, stop, then predict `Alice</h>`
    let handle = handle(&[HELLO, STOP, ALICE, END_HEADER]);
    let driver = TurnDriver::new(handle.clone(), "Bot", 3, true);

    // nobody listens, so nothing is waited for
    let (outbox, _) = flume::unbounded();
    let (replies, end) = driver
        .on_message(ChatMessage::new("Alice", "hi"), &outbox)
        .await
        .unwrap();
    assert_eq!(end, TurnEnd::Yield);
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].user, "Bot");
    assert_eq!(replies[0].content, "hello");

    let transcript = handle.snapshot();
    assert_eq!(transcript.len(), 2);
    assert_eq!(transcript[1].content, "hello");
    assert!(!handle.is_busy());
}

#[tokio::test]
async fn prediction_can_keep_the_bot_quiet() {
    let handle = handle(&[ALICE, END_HEADER]);
    let driver = TurnDriver::new(handle.clone(), "Bot", 3, false);

    // nobody listens, so nothing is waited for
    let (outbox, _) = flume::unbounded();
    let (replies, end) = driver
        .on_message(ChatMessage::new("Alice", "hi"), &outbox)
        .await
        .unwrap();
    assert_eq!(end, TurnEnd::Yield);
    assert!(replies.is_empty());
    assert_eq!(handle.len(), 1);
}

#[tokio::test]
async fn turns_end_at_the_limit() {
    let handle = handle(&[HELLO, STOP]);
    let driver = TurnDriver::new(handle, "Bot", 1, true);

    // nobody listens, so nothing is waited for
    let (outbox, _) = flume::unbounded();
    let (replies, end) = driver
        .on_message(ChatMessage::new("Alice", "hi"), &outbox)
        .await
        .unwrap();
    assert_eq!(end, TurnEnd::Exhausted);
    assert_eq!(replies.len(), 1);
}

#[tokio::test]
async fn next_turn_waits_until_the_reply_is_shown() {
    // reply, stop, predict `Bot</h>`, reply, stop
    let handle = handle(&[HELLO, STOP, BOT, END_HEADER, HELLO, STOP]);
    let driver = TurnDriver::new(handle.clone(), "Bot", 2, true);
    let (outbox, shown) = flume::unbounded();
    let turns = {
        let driver = driver.clone();
        tokio::spawn(async move {
            driver
                .on_message(ChatMessage::new("Alice", "hi"), &outbox)
                .await
        })
    };

    let first = shown.recv_async().await.unwrap();
    assert_eq!(first.content, "hello");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!turns.is_finished());
    assert_eq!(handle.len(), 2);

    driver.self_message_received();
    let second = tokio::time::timeout(Duration::from_secs(5), shown.recv_async())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.content, "hello");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!turns.is_finished());

    driver.self_message_received();
    let (replies, end) = tokio::time::timeout(Duration::from_secs(5), turns)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(end, TurnEnd::Exhausted);
    assert_eq!(replies.len(), 2);
    assert_eq!(handle.len(), 3);
}

#[test]
fn forget_is_queued_behind_a_running_generation() {
    let dir = tempfile::tempdir().unwrap();
    let (latch, gate) = flume::unbounded::<()>();
    let handle = ChatHandle::spawn(move || {
        let backend = ScriptedBackend::new(PIECES)
            .with_context_size(128)
            .with_favorite(STOP, 5.0)
            .with_latch(gate);
        ChatContext::new(backend, settings())
    })
    .unwrap();
    let session = session_with(5, &dir, handle.clone());
    handle.push(ChatMessage::new("Alice", "hi"));
    let Generation::Started(response) = handle.try_read_response(false).unwrap() else {
        panic!("expected the generation to start");
    };

    // the command returns while the generation still holds the context
    let reply = CommandRegistry::builtin().execute(&session, "/forget").unwrap();
    let Reply::Forget(forgotten) = reply else {
        panic!("expected a forget reply");
    };
    assert!(forgotten.try_recv().is_err());
    assert!(handle.is_busy());

    drop(latch);
    response.recv().unwrap().unwrap();
    forgotten.recv().unwrap().unwrap();
}
