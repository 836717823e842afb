use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use flume::{Receiver, Sender};

use crate::{
    backend::NativeBackend,
    context::{ChatContext, ChatResponse, ContextState, FinishReason},
    logit::LogitRule,
    template::ChatMessage,
    Error, Result,
};

/// Outcome of a non-blocking generation request.
#[derive(Debug)]
pub enum Generation<T> {
    /// Another generation holds the context.
    Busy,
    /// The request was queued; the result arrives on the receiver.
    Started(Receiver<Result<T>>),
}

impl<T> Generation<T> {
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy)
    }
}

enum ThreadRequest {
    /// Generate the bot's next message from the current transcript.
    Read {
        continue_last: bool,
        gate: BusyGuard,
        sender: Sender<Result<ChatResponse>>,
    },
    /// Predict who speaks next.
    Predict {
        gate: BusyGuard,
        sender: Sender<Result<Option<String>>>,
    },
    /// Drop cached state, optionally the native cache too.
    Forget {
        native: bool,
        sender: Sender<Result<()>>,
    },
    /// Add or update a logit rule.
    Rule(LogitRule),
}

struct Shared {
    messages: Mutex<Vec<ChatMessage>>,
    state: Mutex<ContextState>,
    busy: AtomicBool,
    running: Arc<AtomicBool>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn set_state(&self, state: ContextState) {
        *lock(&self.state) = state;
    }
}

/// Holds the busy gate; releases it when dropped.
struct BusyGuard(Arc<Shared>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.busy.store(false, Ordering::SeqCst);
    }
}

/// Thread-safe handle to a chat context running on its own worker thread.
///
/// The transcript lives here; every generation reads a snapshot of it. At most
/// one generation runs at a time and a second one is refused instead of queued.
#[derive(Clone)]
pub struct ChatHandle {
    shared: Arc<Shared>,
    sender: Sender<ThreadRequest>,
}

impl ChatHandle {
    /// Starts the worker thread. `factory` builds the context on that thread so
    /// backends bound to their creating thread work.
    pub fn spawn<B, F>(factory: F) -> Result<Self>
    where
        B: NativeBackend + 'static,
        F: FnOnce() -> Result<ChatContext<B>> + Send + 'static,
    {
        let (sender, receiver) = flume::unbounded();
        let (ready_sender, ready) = flume::bounded(1);

        let thread = std::thread::Builder::new()
            .name("chat-context".into())
            .spawn(move || {
                let context = match factory() {
                    Ok(context) => context,
                    Err(err) => {
                        let _ = ready_sender.send(Err(err));
                        return;
                    }
                };
                let running = context.running_flag();
                let shared = Arc::new(Shared {
                    messages: Mutex::new(vec![]),
                    state: Mutex::new(ContextState::Idle),
                    busy: AtomicBool::new(false),
                    running,
                });
                if ready_sender.send(Ok(shared.clone())).is_ok() {
                    run(context, receiver, shared);
                }
            });
        if let Err(err) = thread {
            return Err(Error::Backend(format!("cannot spawn worker: {err}")));
        }

        let shared = ready.recv().map_err(|_| Error::Disconnected)??;
        log::info!("[worker] chat context ready");
        Ok(Self { shared, sender })
    }

    fn try_acquire(&self) -> Option<BusyGuard> {
        self.shared
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()?;
        self.shared.running.store(true, Ordering::SeqCst);
        Some(BusyGuard(self.shared.clone()))
    }

    fn send(&self, request: ThreadRequest) -> Result<()> {
        self.sender.send(request).map_err(|_| Error::Disconnected)
    }

    /// Starts generating a response unless one is already running.
    pub fn try_read_response(&self, continue_last: bool) -> Result<Generation<ChatResponse>> {
        let Some(gate) = self.try_acquire() else {
            return Ok(Generation::Busy);
        };
        let (sender, receiver) = flume::bounded(1);
        self.send(ThreadRequest::Read {
            continue_last,
            gate,
            sender,
        })?;
        Ok(Generation::Started(receiver))
    }

    /// Blocking form of [`Self::try_read_response`]; fails with [`Error::Busy`].
    pub fn read_response(&self, continue_last: bool) -> Result<ChatResponse> {
        match self.try_read_response(continue_last)? {
            Generation::Busy => Err(Error::Busy),
            Generation::Started(receiver) => receiver.recv().map_err(|_| Error::Disconnected)?,
        }
    }

    pub fn try_predict_next_user(&self) -> Result<Generation<Option<String>>> {
        let Some(gate) = self.try_acquire() else {
            return Ok(Generation::Busy);
        };
        let (sender, receiver) = flume::bounded(1);
        self.send(ThreadRequest::Predict { gate, sender })?;
        Ok(Generation::Started(receiver))
    }

    /// Asks a running generation to stop after its current token.
    /// Returns `false` when nothing is running.
    pub fn try_interrupt(&self) -> bool {
        if !self.shared.busy.load(Ordering::SeqCst) {
            return false;
        }
        self.shared.running.store(false, Ordering::SeqCst);
        log::info!("[worker] interrupt requested");
        true
    }

    /// Queues a forget behind any running generation. The receiver yields once it is done.
    pub fn queue_forget(&self, native: bool) -> Result<Receiver<Result<()>>> {
        let (sender, receiver) = flume::bounded(1);
        self.send(ThreadRequest::Forget { native, sender })?;
        Ok(receiver)
    }

    /// Blocking form of [`Self::queue_forget`].
    pub fn forget(&self, native: bool) -> Result<()> {
        self.queue_forget(native)?
            .recv()
            .map_err(|_| Error::Disconnected)?
    }

    pub fn add_rule(&self, rule: impl Into<LogitRule>) -> Result<()> {
        self.send(ThreadRequest::Rule(rule.into()))
    }

    pub fn is_busy(&self) -> bool {
        self.shared.busy.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ContextState {
        *lock(&self.shared.state)
    }

    pub fn push(&self, message: ChatMessage) {
        lock(&self.shared.messages).push(message);
    }

    /// Inserts at `index`, clamped to the end of the transcript.
    pub fn insert(&self, index: usize, message: ChatMessage) {
        let mut messages = lock(&self.shared.messages);
        let index = index.min(messages.len());
        messages.insert(index, message);
    }

    /// Removes the message with the given platform id.
    pub fn remove(&self, external_id: u64) -> Option<ChatMessage> {
        let mut messages = lock(&self.shared.messages);
        let index = messages
            .iter()
            .position(|x| x.external_id == Some(external_id))?;
        Some(messages.remove(index))
    }

    /// Replaces the content of the message with the given platform id.
    pub fn edit(&self, external_id: u64, content: impl Into<String>) -> bool {
        let mut messages = lock(&self.shared.messages);
        match messages
            .iter_mut()
            .find(|x| x.external_id == Some(external_id))
        {
            Some(message) => {
                message.content = content.into();
                true
            }
            None => false,
        }
    }

    /// Appends to the last message if it is from `user`, else pushes a new one.
    pub fn extend_last(&self, user: &str, content: &str) {
        let mut messages = lock(&self.shared.messages);
        match messages.last_mut() {
            Some(last) if last.user == user && !last.is_prompt() => last.content.push_str(content),
            _ => messages.push(ChatMessage::new(user, content)),
        }
    }

    /// Runs `f` on the transcript under its lock.
    pub fn update<R>(&self, f: impl FnOnce(&mut Vec<ChatMessage>) -> R) -> R {
        f(&mut lock(&self.shared.messages))
    }

    pub fn clear(&self) {
        lock(&self.shared.messages).clear();
    }

    pub fn snapshot(&self) -> Vec<ChatMessage> {
        lock(&self.shared.messages).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.shared.messages).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.shared.messages).is_empty()
    }
}

impl fmt::Display for ChatHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for message in lock(&self.shared.messages).iter() {
            match message.is_prompt() {
                true => writeln!(f, "{}", message.content)?,
                false => writeln!(f, "{}: {}", message.user, message.content)?,
            }
        }
        Ok(())
    }
}

fn run<B: NativeBackend>(
    mut context: ChatContext<B>,
    receiver: Receiver<ThreadRequest>,
    shared: Arc<Shared>,
) {
    while let Ok(request) = receiver.recv() {
        match request {
            ThreadRequest::Read {
                continue_last,
                gate,
                sender,
            } => {
                let messages = lock(&shared.messages).clone();
                shared.set_state(ContextState::Evaluating);
                let result = context.read_response(&messages, continue_last);
                shared.set_state(match &result {
                    Ok(response) if response.finish == FinishReason::Interrupted => {
                        ContextState::Interrupted
                    }
                    _ => ContextState::Completed,
                });
                drop(gate);
                let _ = sender.send(result);
            }
            ThreadRequest::Predict { gate, sender } => {
                let messages = lock(&shared.messages).clone();
                shared.set_state(ContextState::Evaluating);
                let result = context.predict_next_user(&messages);
                shared.set_state(ContextState::Completed);
                drop(gate);
                let _ = sender.send(result);
            }
            ThreadRequest::Forget { native, sender } => {
                let _ = sender.send(context.forget(native));
                shared.set_state(ContextState::Idle);
            }
            ThreadRequest::Rule(rule) => context.add_rule(rule),
        }
    }
    log::info!("[worker] chat context stopped");
}
