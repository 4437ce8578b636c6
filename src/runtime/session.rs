//! Conversation session: the composition root
//!
//! One async mutex guards the state, the message store and the stream task
//! handle. Every transition (read state, decide, write state, run effects,
//! emit events) happens while holding it, so observers see a linear
//! history. Events go out over a bounded channel while the lock is held:
//! a slow consumer slows the stream down instead of growing memory, and the
//! consumer must therefore drain the receiver concurrently with calls into
//! the session.

use super::monitor::{ConnectionMonitor, ConnectionStatus};
use super::task::StreamTask;
use crate::config::SessionConfig;
use crate::error::DomainError;
use crate::llm::{ChatTransport, FragmentStream, Fragment, StreamEvent, StreamOutcome, StreamingClient};
use crate::state_machine::{transition, Effect, Event, PartialContent, SessionState, TransitionError};
use crate::store::{Message, MessageStore, TokenEstimator, WordHeuristic};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;

/// Notifications delivered to the session's consumer, in order
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Fragment(Fragment),
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    Error(DomainError),
}

/// Why a request was turned away
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("message is empty")]
    EmptyMessage,
    #[error("a response is still streaming")]
    Busy,
    #[error("cancellation in progress")]
    CancellationInProgress,
    #[error("session has shut down")]
    ShutDown,
    #[error("{0}")]
    Invalid(String),
}

impl From<TransitionError> for RejectReason {
    fn from(e: TransitionError) -> Self {
        match e {
            TransitionError::EmptyMessage => RejectReason::EmptyMessage,
            TransitionError::Busy => RejectReason::Busy,
            TransitionError::CancellationInProgress => RejectReason::CancellationInProgress,
            TransitionError::InvalidTransition(detail) => RejectReason::Invalid(detail),
        }
    }
}

/// Result of `submit`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    Rejected(RejectReason),
}

impl SubmitOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, SubmitOutcome::Accepted)
    }
}

struct SessionCore {
    state: SessionState,
    store: MessageStore,
    task: Option<StreamTask>,
    last_error: Option<DomainError>,
    monitor: Option<ConnectionMonitor>,
    /// How the stream task settles the partial reply when it acknowledges a cancel
    cancel_policy: PartialContent,
    next_stream_id: u64,
    shut_down: bool,
}

struct Shared {
    core: Mutex<SessionCore>,
    config: SessionConfig,
    client: StreamingClient,
    estimator: Arc<dyn TokenEstimator + Send + Sync>,
    events: mpsc::Sender<SessionEvent>,
    state_tx: watch::Sender<SessionState>,
}

/// Handle to one conversation. Cheap to clone; all clones drive the same
/// session.
#[derive(Clone)]
pub struct ConversationSession {
    shared: Arc<Shared>,
}

impl ConversationSession {
    /// Build a session and the receiver its events are delivered on
    pub fn new(
        config: SessionConfig,
        transport: Arc<dyn ChatTransport>,
    ) -> Result<(Self, mpsc::Receiver<SessionEvent>), DomainError> {
        Self::with_estimator(config, transport, Arc::new(WordHeuristic))
    }

    pub fn with_estimator(
        config: SessionConfig,
        transport: Arc<dyn ChatTransport>,
        estimator: Arc<dyn TokenEstimator + Send + Sync>,
    ) -> Result<(Self, mpsc::Receiver<SessionEvent>), DomainError> {
        config.validate()?;
        let store = MessageStore::with_system_prompt(config.max_history_messages, &config.system_prompt)?;
        let (events, events_rx) = mpsc::channel(config.event_buffer);
        let (state_tx, _) = watch::channel(SessionState::Idle);

        tracing::info!(
            endpoint = %transport.endpoint(),
            model = %config.model,
            max_history_messages = config.max_history_messages,
            max_context_tokens = config.max_context_tokens,
            "Session created"
        );

        let shared = Arc::new(Shared {
            core: Mutex::new(SessionCore {
                state: SessionState::Idle,
                store,
                task: None,
                last_error: None,
                monitor: None,
                cancel_policy: PartialContent::default(),
                next_stream_id: 1,
                shut_down: false,
            }),
            client: StreamingClient::new(transport),
            config,
            estimator,
            events,
            state_tx,
        });

        Ok((Self { shared }, events_rx))
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    pub fn client(&self) -> &StreamingClient {
        &self.shared.client
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    /// Start a new turn. Accepted only when no stream is in flight.
    pub async fn submit(&self, text: &str) -> SubmitOutcome {
        let mut core = self.shared.core.lock().await;
        if core.shut_down {
            return SubmitOutcome::Rejected(RejectReason::ShutDown);
        }

        // A finished task may still be returning after its final transition.
        if core.state.is_ready() {
            if let Some(task) = core.task.take() {
                task.join().await;
            }
        }

        match self
            .shared
            .apply(&mut core, Event::Submit {
                text: text.to_string(),
            })
            .await
        {
            Ok(()) => SubmitOutcome::Accepted,
            Err(e) => {
                tracing::debug!(reason = %e, state = %core.state.name(), "Submit rejected");
                SubmitOutcome::Rejected(e.into())
            }
        }
    }

    /// Cancel the in-flight stream with the configured partial-content policy
    pub async fn cancel(&self) {
        let policy = PartialContent::from_keep(self.shared.config.keep_partial_on_cancel);
        self.cancel_with(policy).await;
    }

    /// Cancel the in-flight stream and settle the partial reply per `partial`.
    ///
    /// Returns once the stream task has terminated and the session is back
    /// to `Idle`. No-op when nothing is streaming; if another caller is
    /// already cancelling, waits for that cancellation to finish. The task
    /// acknowledges the cancel itself, so dropping this future early does
    /// not leave the session stuck in `Cancelling`.
    pub async fn cancel_with(&self, partial: PartialContent) {
        {
            let mut core = self.shared.core.lock().await;
            let state = core.state.clone();
            match state {
                SessionState::Streaming => {
                    core.cancel_policy = partial;
                    if let Err(e) = self.shared.apply(&mut core, Event::CancelRequested).await {
                        tracing::error!(error = %e, "Cancel request rejected");
                        return;
                    }
                }
                SessionState::Cancelling => {}
                SessionState::Idle | SessionState::Error { .. } => return,
            }
        }
        self.shared.settle().await;
    }

    /// Leave the `Error` state without submitting
    pub async fn acknowledge(&self) -> Result<(), RejectReason> {
        let mut core = self.shared.core.lock().await;
        self.shared
            .apply(&mut core, Event::Acknowledge)
            .await
            .map_err(RejectReason::from)
    }

    /// Cancel anything in flight, then start over with only the configured
    /// system prompt.
    pub async fn new_conversation(&self) -> Result<(), RejectReason> {
        self.cancel_with(PartialContent::Discard).await;

        let mut core = self.shared.core.lock().await;
        if core.shut_down {
            return Err(RejectReason::ShutDown);
        }
        // Someone submitted between our cancel and relock
        if core.state.is_busy() {
            return Err(RejectReason::Busy);
        }
        if matches!(core.state, SessionState::Error { .. }) {
            self.shared.apply(&mut core, Event::Acknowledge).await?;
        }

        core.store.clear();
        let prompt = self.shared.config.system_prompt.trim();
        if !prompt.is_empty() {
            core.store.append(Message::system(prompt));
        }
        tracing::info!("Started new conversation");
        Ok(())
    }

    /// Cancel and await every background task, then refuse further work.
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        let partial = PartialContent::from_keep(self.shared.config.keep_partial_on_cancel);
        loop {
            let mut core = self.shared.core.lock().await;
            if core.state == SessionState::Streaming {
                core.cancel_policy = partial;
            }
            if let Err(e) = self.shared.apply(&mut core, Event::Shutdown).await {
                tracing::error!(error = %e, "Shutdown transition rejected");
            }

            if core.state == SessionState::Cancelling {
                drop(core);
                self.shared.settle().await;
                continue;
            }

            core.shut_down = true;
            let task = core.task.take();
            let monitor = core.monitor.take();
            drop(core);

            if let Some(task) = task {
                task.join().await;
            }
            if let Some(monitor) = monitor {
                monitor.stop().await;
            }
            tracing::info!("Session shut down");
            return;
        }
    }

    /// Check the configured model is installed, pulling it if allowed
    pub async fn ensure_model_ready(&self) -> Result<(), DomainError> {
        let config = &self.shared.config;
        self.shared
            .client
            .ensure_model_ready(&config.model, config.pull_if_missing)
            .await
    }

    /// Start polling backend reachability. Returns the status channel; a
    /// second call reuses the running monitor.
    pub async fn start_connection_monitor(&self) -> watch::Receiver<ConnectionStatus> {
        let mut core = self.shared.core.lock().await;
        if let Some(monitor) = &core.monitor {
            return monitor.status();
        }
        let monitor = ConnectionMonitor::spawn(
            Arc::clone(self.shared.client.transport()),
            self.shared.config.connection_check_interval(),
        );
        let status = monitor.status();
        core.monitor = Some(monitor);
        status
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn state(&self) -> SessionState {
        self.shared.state_tx.borrow().clone()
    }

    /// Watch state changes without consuming the event channel
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state_tx.subscribe()
    }

    pub async fn last_error(&self) -> Option<DomainError> {
        self.shared.core.lock().await.last_error.clone()
    }

    /// The reply streamed so far in the current turn
    pub async fn pending_reply(&self) -> Option<String> {
        let core = self.shared.core.lock().await;
        core.store.pending().map(|m| m.content.clone())
    }

    pub async fn export(&self) -> Vec<Message> {
        self.shared.core.lock().await.store.export()
    }

    pub async fn export_json(&self) -> Result<String, serde_json::Error> {
        self.shared.core.lock().await.store.export_json()
    }

    /// Messages the next request would carry
    pub async fn context(&self) -> Vec<Message> {
        let core = self.shared.core.lock().await;
        core.store
            .context(self.shared.config.max_context_tokens, self.shared.estimator.as_ref())
    }

    pub async fn estimated_tokens(&self) -> usize {
        let core = self.shared.core.lock().await;
        core.store.estimated_tokens(self.shared.estimator.as_ref())
    }

    /// Load persisted history. Refused while a stream is in flight.
    pub async fn replace_messages(&self, messages: Vec<Message>) -> Result<(), RejectReason> {
        let mut core = self.shared.core.lock().await;
        if core.state.is_busy() {
            return Err(RejectReason::Busy);
        }
        core.store.replace_messages(messages);
        tracing::info!(messages = core.store.len(), "History replaced");
        Ok(())
    }
}

impl Shared {
    /// Run one event through the machine and execute its effects.
    /// Caller holds the lock.
    async fn apply(
        self: &Arc<Self>,
        core: &mut SessionCore,
        event: Event,
    ) -> Result<(), TransitionError> {
        let from = core.state.clone();
        let result = transition(&core.state, event)?;
        core.state = result.new_state;

        for effect in result.effects {
            self.execute(core, effect).await;
        }

        if core.state != from {
            tracing::info!(from = %from.name(), to = %core.state.name(), "Session state changed");
            self.state_tx.send_replace(core.state.clone());
            self.emit(SessionEvent::StateChanged {
                from,
                to: core.state.clone(),
            })
            .await;
        }
        Ok(())
    }

    async fn execute(self: &Arc<Self>, core: &mut SessionCore, effect: Effect) {
        match effect {
            Effect::ClearError => {
                core.last_error = None;
            }

            Effect::PersistUserMessage { text } => {
                core.store.append(Message::user(text));
            }

            Effect::BeginAssistant => {
                core.store.begin_assistant();
            }

            Effect::SpawnStream => {
                let context = core
                    .store
                    .context(self.config.max_context_tokens, self.estimator.as_ref());
                let id = core.next_stream_id;
                core.next_stream_id += 1;

                tracing::info!(
                    stream_id = id,
                    model = %self.config.model,
                    context_messages = context.len(),
                    "Starting stream"
                );

                let cancel = CancellationToken::new();
                let fragments =
                    self.client
                        .stream(&context, &self.config.stream_options(), cancel.clone());
                let handle = tokio::spawn(Arc::clone(self).run_stream(id, fragments));
                core.task = Some(StreamTask::new(id, cancel, handle));
            }

            Effect::ForwardFragment { fragment } => {
                core.store.append_pending(&fragment.content);
                self.emit(SessionEvent::Fragment(fragment)).await;
            }

            Effect::FinalizeAssistant => {
                if let Some(message) = core.store.finalize_pending() {
                    tracing::debug!(chars = message.content.len(), "Assistant reply stored");
                }
            }

            Effect::DiscardAssistant => {
                core.store.discard_pending();
            }

            Effect::RollbackUserMessage => {
                if let Some(message) = core.store.rollback_last_user() {
                    tracing::debug!(message_id = %message.id, "Rolled back unanswered user message");
                }
            }

            Effect::AbortStream => {
                if let Some(task) = &core.task {
                    tracing::info!(stream_id = task.id(), "Aborting stream");
                    task.cancel();
                }
            }

            Effect::RecordError { error } => {
                tracing::error!(kind = %error.kind, error = %error, "Stream failed");
                core.last_error = Some(error.clone());
                self.emit(SessionEvent::Error(error)).await;
            }
        }
    }

    async fn emit(&self, event: SessionEvent) {
        // A dropped receiver only means nobody is listening any more.
        if self.events.send(event).await.is_err() {
            tracing::debug!("Session event receiver dropped");
        }
    }

    /// Body of the stream task: feed every event through the machine.
    ///
    /// Boxed so the task's type does not depend on `apply`, which spawns it.
    fn run_stream(self: Arc<Self>, id: u64, mut fragments: FragmentStream) -> BoxFuture<'static, ()> {
        async move {
            while let Some(event) = fragments.next().await {
                let event = match event {
                    StreamEvent::Fragment(fragment) => Event::FragmentReceived { fragment },
                    StreamEvent::Finished(StreamOutcome::Completed) => Event::StreamCompleted,
                    StreamEvent::Finished(StreamOutcome::Failed(error)) => {
                        Event::StreamFailed { error }
                    }
                    StreamEvent::Finished(StreamOutcome::Cancelled) => {
                        tracing::info!(stream_id = id, "Stream cancelled");
                        break;
                    }
                };
                let finished = matches!(event, Event::StreamCompleted | Event::StreamFailed { .. });

                let mut core = self.core.lock().await;
                if let Err(e) = self.apply(&mut core, event).await {
                    tracing::warn!(stream_id = id, error = %e, "Dropping stream event");
                }
                if finished {
                    tracing::info!(
                        stream_id = id,
                        attempts = fragments.attempts(),
                        "Stream finished"
                    );
                    // Completed or failed after cancel was signalled
                    self.acknowledge_cancel(&mut core, id).await;
                    return;
                }
            }

            // Release the transport before Cancelling can become Idle
            drop(fragments);
            let mut core = self.core.lock().await;
            self.acknowledge_cancel(&mut core, id).await;
        }
        .boxed()
    }

    /// Move Cancelling -> Idle with the recorded partial-content policy
    async fn acknowledge_cancel(self: &Arc<Self>, core: &mut SessionCore, id: u64) {
        if core.state != SessionState::Cancelling {
            return;
        }
        let partial = core.cancel_policy;
        if let Err(e) = self.apply(core, Event::CancelAcknowledged { partial }).await {
            tracing::error!(stream_id = id, error = %e, "Cancel acknowledgement rejected");
        }
    }

    /// Wait until no cancellation is in progress, then reap the finished
    /// stream task so callers return only after it has terminated.
    async fn settle(&self) {
        let mut state = self.state_tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = state
            .wait_for(|s| !matches!(s, SessionState::Cancelling))
            .await;
        drop(state);

        let task = {
            let mut core = self.core.lock().await;
            // A new submit may already own the slot; leave its task alone.
            if core.state.is_ready() {
                core.task.take()
            } else {
                None
            }
        };
        if let Some(task) = task {
            task.join().await;
        }
    }
}
