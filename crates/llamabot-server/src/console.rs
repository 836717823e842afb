//! Line based front-end: `Name: text` is a message, `/command ...` a command.

use std::sync::Arc;

use anyhow::Result;
use lazy_static::lazy_static;
use llamabot_core::{ChatMessage, ChatResponse, FinishReason};
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::commands::{CommandRegistry, Reply, Session};

lazy_static! {
    static ref MESSAGE: Regex = Regex::new(r"^(?P<user>[^/:\s][^:]*?)\s*:\s?(?P<content>.*)$").unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Message { user: String, content: String },
    Command(String),
    Empty,
    Invalid,
}

pub fn parse_line(line: &str) -> Input {
    let line = line.trim_end();
    if line.trim().is_empty() {
        return Input::Empty;
    }
    if line.starts_with('/') {
        return Input::Command(line.to_string());
    }
    match MESSAGE.captures(line) {
        Some(captures) => Input::Message {
            user: captures["user"].trim().to_string(),
            content: captures["content"].to_string(),
        },
        None => Input::Invalid,
    }
}

fn print_messages(messages: &[ChatMessage]) {
    for message in messages {
        println!("{}: {}", message.user, message.content);
    }
}

async fn finish(session: Arc<Session>, reply: Reply) -> Result<()> {
    match reply {
        Reply::Text(text) => println!("{text}"),
        Reply::Response(receiver) => {
            let ChatResponse { messages, .. } = receiver.recv_async().await??;
            for message in &messages {
                session.handle().push(message.clone());
            }
            print_messages(&messages);
        }
        Reply::Continuation(receiver) => {
            let response = receiver.recv_async().await??;
            let content = response.content();
            session.handle().extend_last(&session.bot_name, &content);
            if let Some(last) = session.handle().snapshot().pop() {
                println!("{}: {}", last.user, last.content);
            }
            if response.finish == FinishReason::Interrupted {
                log::info!("[console] continuation interrupted");
            }
        }
        Reply::Prediction(receiver) => match receiver.recv_async().await?? {
            Some(user) => println!("next: {user}"),
            None => println!("next: nobody"),
        },
        Reply::Forget(receiver) => {
            receiver.recv_async().await??;
            println!("Cached state dropped.");
        }
    }
    Ok(())
}

/// Lets the bot answer `message`, printing each reply as soon as it is ready.
async fn take_turns(session: Arc<Session>, message: ChatMessage) {
    let (outbox, replies) = flume::unbounded::<ChatMessage>();
    let printer = {
        let session = session.clone();
        tokio::spawn(async move {
            while let Ok(reply) = replies.recv_async().await {
                print_messages(std::slice::from_ref(&reply));
                session.driver.self_message_received();
            }
        })
    };

    match session.driver.on_message(message, &outbox).await {
        Ok((replies, end)) => log::debug!("[console][turns: {}][end: {end:?}]", replies.len()),
        Err(err) => log::error!("[console] turn failed: {err}"),
    }
    drop(outbox);
    let _ = printer.await;
}

/// Reads stdin until it closes.
pub async fn run(session: Arc<Session>, registry: Arc<CommandRegistry>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("type `Name: message` to talk, `/help` for commands");

    while let Some(line) = lines.next_line().await? {
        match parse_line(&line) {
            Input::Empty => {}
            Input::Invalid => println!("expected `Name: message` or `/command`"),
            Input::Message { user, content } => {
                let message = ChatMessage::new(user, content);
                tokio::spawn(take_turns(session.clone(), message));
            }
            Input::Command(command) => match registry.execute(&session, &command) {
                Ok(reply) => {
                    let session = session.clone();
                    tokio::spawn(async move {
                        if let Err(err) = finish(session, reply).await {
                            println!("{err}");
                        }
                    });
                }
                Err(err) => println!("{err}"),
            },
        }
    }
    Ok(())
}
