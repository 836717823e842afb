use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Result;
use flume::Sender;
use llamabot_core::{ChatHandle, ChatMessage, ChatResponse, Generation};
use tokio::sync::watch;

const SETTLE: Duration = Duration::from_millis(10);

/// Stays signalled until reset; waiters pass straight through while set.
#[derive(Debug, Clone)]
pub struct ResetEvent {
    sender: Arc<watch::Sender<bool>>,
}

impl Default for ResetEvent {
    fn default() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }
}

impl ResetEvent {
    pub fn set(&self) {
        self.sender.send_replace(true);
    }

    pub fn reset(&self) {
        self.sender.send_replace(false);
    }

    pub fn is_set(&self) -> bool {
        *self.sender.borrow()
    }

    pub async fn wait(&self) {
        let mut receiver = self.sender.subscribe();
        // the sender lives in `self`, so this never reports a closed channel
        let _ = receiver.wait_for(|x| *x).await;
    }
}

/// Why the driver stopped taking turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnEnd {
    /// Somebody else is expected to speak.
    Yield,
    /// A newer external message took over.
    Cancelled,
    /// A generation was already running.
    Busy,
    /// `max_autonomous_turns` bot messages were produced.
    Exhausted,
}

/// Decides when the bot speaks after external messages.
#[derive(Clone)]
pub struct TurnDriver {
    handle: ChatHandle,
    bot_name: String,
    max_turns: usize,
    always_reply: bool,
    epoch: Arc<AtomicU64>,
    self_message: ResetEvent,
}

async fn receive<T>(generation: Generation<T>) -> Result<Option<T>> {
    match generation {
        Generation::Busy => Ok(None),
        Generation::Started(receiver) => Ok(Some(receiver.recv_async().await??)),
    }
}

impl TurnDriver {
    pub fn new(
        handle: ChatHandle,
        bot_name: impl Into<String>,
        max_turns: usize,
        always_reply: bool,
    ) -> Self {
        Self {
            handle,
            bot_name: bot_name.into(),
            max_turns,
            always_reply,
            epoch: Default::default(),
            self_message: Default::default(),
        }
    }

    pub fn handle(&self) -> &ChatHandle {
        &self.handle
    }

    /// Invalidates any autonomous turn in progress and interrupts its generation.
    pub fn cancel(&self) -> u64 {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        if self.handle.try_interrupt() {
            log::info!("[driver][cancel][epoch: {epoch}]");
        }
        epoch
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    /// Called when the bot's own message comes back from the chat surface.
    pub fn self_message_received(&self) {
        self.self_message.set();
    }

    /// Appends an external message and lets the bot take its turns.
    pub async fn on_message(
        &self,
        message: ChatMessage,
        outbox: &Sender<ChatMessage>,
    ) -> Result<(Vec<ChatMessage>, TurnEnd)> {
        let epoch = self.cancel();
        self.handle.push(message);
        // an interrupted generation releases the gate after its current token
        while self.handle.is_busy() {
            tokio::time::sleep(SETTLE).await;
        }
        self.run(epoch, outbox).await
    }

    /// Takes bot turns until another speaker is predicted or the epoch moves on.
    ///
    /// Every reply is sent to `outbox`, and the driver then waits for
    /// [`Self::self_message_received`] before going on. Without a receiver on
    /// the other end nothing is waited for.
    pub async fn run(
        &self,
        epoch: u64,
        outbox: &Sender<ChatMessage>,
    ) -> Result<(Vec<ChatMessage>, TurnEnd)> {
        let mut replies = vec![];
        for turn in 0..self.max_turns {
            if !self.is_current(epoch) {
                return Ok((replies, TurnEnd::Cancelled));
            }

            if turn > 0 || !self.always_reply {
                let Some(speaker) = receive(self.handle.try_predict_next_user()?).await? else {
                    return Ok((replies, TurnEnd::Busy));
                };
                log::debug!("[driver][predict][speaker: {speaker:?}]");
                if speaker.as_deref() != Some(self.bot_name.as_str()) {
                    return Ok((replies, TurnEnd::Yield));
                }
                if !self.is_current(epoch) {
                    return Ok((replies, TurnEnd::Cancelled));
                }
            }

            let Some(ChatResponse { messages, .. }) =
                receive(self.handle.try_read_response(false)?).await?
            else {
                return Ok((replies, TurnEnd::Busy));
            };
            if messages.is_empty() {
                return Ok((replies, TurnEnd::Yield));
            }

            for message in messages {
                self.self_message.reset();
                self.handle.push(message.clone());
                replies.push(message.clone());
                match outbox.send(message) {
                    Ok(()) => self.self_message.wait().await,
                    Err(_) => log::debug!("[driver] no front-end to show the reply"),
                }
            }
        }
        Ok((replies, TurnEnd::Exhausted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reset_event_blocks_until_set() {
        let event = ResetEvent::default();
        assert!(!event.is_set());

        let waiter = {
            let event = event.clone();
            tokio::spawn(async move { event.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        event.set();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();

        // stays set until reset
        event.wait().await;
        event.reset();
        assert!(!event.is_set());
    }
}
