//! Mock implementations for testing
//!
//! These mocks enable session and client tests without a real backend.

use crate::llm::{ChatRequest, ChatTransport, ChunkStream, ModelInfo, RawChunk, TransportError};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

// ============================================================================
// Mock Transport
// ============================================================================

/// What the next `open_stream` call does
pub enum MockResponse {
    /// Yield these items, then end
    Stream(Vec<Result<RawChunk, TransportError>>),
    /// Yield the chunks, notify the gate, then park until dropped
    Gated {
        chunks: Vec<RawChunk>,
        gate: Arc<Notify>,
    },
    /// Fail to connect
    Fail(TransportError),
    /// Never finish connecting
    Hang,
}

impl MockResponse {
    pub fn chunks(chunks: Vec<RawChunk>) -> Self {
        MockResponse::Stream(chunks.into_iter().map(Ok).collect())
    }

    /// A stream that stalls after `chunks`; the returned gate fires once
    /// every chunk has been handed out.
    pub fn gated(chunks: Vec<RawChunk>) -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        (
            MockResponse::Gated {
                chunks,
                gate: Arc::clone(&gate),
            },
            gate,
        )
    }
}

/// Counts streams that have been opened and not yet dropped
struct LiveGuard(Arc<AtomicUsize>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Transport that plays back queued responses
pub struct MockTransport {
    responses: Mutex<VecDeque<MockResponse>>,
    requests: Mutex<Vec<ChatRequest>>,
    models: Mutex<Vec<ModelInfo>>,
    pulled: Mutex<Vec<String>>,
    offline: AtomicBool,
    opens: AtomicUsize,
    live: Arc<AtomicUsize>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            models: Mutex::new(Vec::new()),
            pulled: Mutex::new(Vec::new()),
            offline: AtomicBool::new(false),
            opens: AtomicUsize::new(0),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Queue the behaviour of the next `open_stream`
    pub fn push(&self, response: MockResponse) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn set_models(&self, names: &[&str]) {
        *self.models.lock().unwrap() = names.iter().map(|n| ModelInfo::named(*n)).collect();
    }

    /// Make `list_models` fail as if the host were down
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of `open_stream` calls so far
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Streams handed out and not yet dropped
    pub fn live_streams(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn pulled(&self) -> Vec<String> {
        self.pulled.lock().unwrap().clone()
    }

    fn track(&self, stream: ChunkStream) -> ChunkStream {
        self.live.fetch_add(1, Ordering::SeqCst);
        let guard = LiveGuard(Arc::clone(&self.live));
        Box::pin(stream.map(move |item| {
            let _ = &guard;
            item
        }))
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatTransport for MockTransport {
    async fn open_stream(&self, request: &ChatRequest) -> Result<ChunkStream, TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        let response = self.responses.lock().unwrap().pop_front();

        match response {
            Some(MockResponse::Stream(items)) => Ok(self.track(Box::pin(futures::stream::iter(items)))),
            Some(MockResponse::Gated { chunks, gate }) => {
                let parked = futures::stream::once(async move {
                    gate.notify_one();
                    futures::future::pending::<Result<RawChunk, TransportError>>().await
                });
                let stream = futures::stream::iter(chunks.into_iter().map(Ok)).chain(parked);
                Ok(self.track(Box::pin(stream)))
            }
            Some(MockResponse::Fail(error)) => Err(error),
            Some(MockResponse::Hang) => {
                futures::future::pending::<Result<ChunkStream, TransportError>>().await
            }
            None => Err(TransportError::other("no mock response queued")),
        }
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, TransportError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionRefused("mock offline".into()));
        }
        Ok(self.models.lock().unwrap().clone())
    }

    async fn pull_model(&self, model: &str) -> Result<(), TransportError> {
        self.pulled.lock().unwrap().push(model.to_string());
        self.models.lock().unwrap().push(ModelInfo::named(model));
        Ok(())
    }

    fn endpoint(&self) -> &str {
        "mock://backend"
    }
}

// ============================================================================
// Session Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::error::DomainErrorKind;
    use crate::runtime::{
        ConnectionStatus, ConversationSession, RejectReason, SessionEvent, SubmitOutcome,
    };
    use crate::state_machine::{PartialContent, SessionState};
    use crate::store::Role;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(5);

    fn test_config() -> SessionConfig {
        SessionConfig {
            system_prompt: "be helpful".to_string(),
            batch_size: 4,
            max_retries: 3,
            retry_backoff_ms: 5,
            max_backoff_ms: 20,
            request_timeout_secs: 5,
            event_buffer: 256,
            connection_check_interval_secs: 1,
            ..SessionConfig::default()
        }
    }

    fn start(
        transport: &Arc<MockTransport>,
        config: SessionConfig,
    ) -> (ConversationSession, mpsc::Receiver<SessionEvent>) {
        ConversationSession::new(config, transport.clone()).unwrap()
    }

    fn words(n: usize) -> Vec<RawChunk> {
        (0..n).map(|i| RawChunk::content(format!("w{i} "))).collect()
    }

    fn joined(n: usize) -> String {
        words(n).iter().map(|c| c.content.as_str()).collect::<String>()
    }

    /// Read events until one matches `stop` (inclusive)
    async fn collect_until(
        rx: &mut mpsc::Receiver<SessionEvent>,
        stop: impl Fn(&SessionEvent) -> bool,
    ) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        loop {
            let event = tokio::time::timeout(WAIT, rx.recv())
                .await
                .expect("timed out waiting for session event")
                .expect("event channel closed");
            let done = stop(&event);
            events.push(event);
            if done {
                return events;
            }
        }
    }

    fn settled(event: &SessionEvent) -> bool {
        matches!(
            event,
            SessionEvent::StateChanged {
                to: SessionState::Idle | SessionState::Error { .. },
                ..
            }
        )
    }

    fn drain(rx: &mut mpsc::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn fragments(events: &[SessionEvent]) -> Vec<&crate::llm::Fragment> {
        events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Fragment(f) => Some(f),
                _ => None,
            })
            .collect()
    }

    fn state_change(from: SessionState, to: SessionState) -> SessionEvent {
        SessionEvent::StateChanged { from, to }
    }

    #[tokio::test]
    async fn test_mock_transport_plays_back_in_order() {
        let transport = MockTransport::new();
        transport.push(MockResponse::Fail(TransportError::UnexpectedClose));
        transport.push(MockResponse::chunks(words(2)));

        let request = ChatRequest {
            model: "m".into(),
            messages: vec![],
            think: false,
            num_ctx: None,
        };
        assert!(transport.open_stream(&request).await.is_err());
        let items: Vec<_> = transport.open_stream(&request).await.unwrap().collect().await;
        assert_eq!(items.len(), 2);
        assert!(transport.open_stream(&request).await.is_err());
        assert_eq!(transport.open_count(), 3);
        assert_eq!(transport.live_streams(), 0);
    }

    #[tokio::test]
    async fn test_submit_streams_reply_then_idle() {
        let transport = Arc::new(MockTransport::new());
        let mut chunks = vec![RawChunk::content("Hel"), RawChunk::content("lo")];
        chunks.push(RawChunk::done());
        transport.push(MockResponse::chunks(chunks));
        let (session, mut rx) = start(&transport, test_config());

        assert_eq!(session.submit("hi").await, SubmitOutcome::Accepted);
        let events = collect_until(&mut rx, settled).await;

        assert_eq!(events.len(), 3);
        assert_eq!(events[0], state_change(SessionState::Idle, SessionState::Streaming));
        assert!(matches!(&events[1], SessionEvent::Fragment(f) if f.content == "Hello"));
        assert_eq!(events[2], state_change(SessionState::Streaming, SessionState::Idle));

        let history = session.export().await;
        let turns: Vec<(Role, &str)> = history.iter().map(|m| (m.role, m.content.as_str())).collect();
        assert_eq!(
            turns,
            vec![
                (Role::System, "be helpful"),
                (Role::User, "hi"),
                (Role::Assistant, "Hello"),
            ]
        );

        let request = &transport.requests()[0];
        assert_eq!(request.messages.len(), 2);
        assert_eq!(request.messages[1].content, "hi");
    }

    #[tokio::test]
    async fn test_cancel_flushes_partial_batch_and_keeps_it() {
        // Three chunks of a longer reply have arrived; the batch of four never fills.
        let transport = Arc::new(MockTransport::new());
        let (response, gate) = MockResponse::gated(words(3));
        transport.push(response);
        let (session, mut rx) = start(&transport, test_config());

        assert!(session.submit("tell me a story").await.is_accepted());
        gate.notified().await;
        session.cancel_with(PartialContent::Keep).await;

        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(transport.live_streams(), 0);

        let events = drain(&mut rx);
        assert_eq!(
            events,
            vec![
                state_change(SessionState::Idle, SessionState::Streaming),
                state_change(SessionState::Streaming, SessionState::Cancelling),
                SessionEvent::Fragment(crate::llm::Fragment {
                    content: joined(3),
                    thinking: String::new(),
                    chunks: 3,
                }),
                state_change(SessionState::Cancelling, SessionState::Idle),
            ]
        );

        let history = session.export().await;
        let last = history.last().unwrap();
        assert_eq!(last.role, Role::Assistant);
        assert_eq!(last.content, joined(3).trim());
    }

    #[tokio::test]
    async fn test_cancel_discards_partial_by_default() {
        let transport = Arc::new(MockTransport::new());
        let (response, gate) = MockResponse::gated(words(3));
        transport.push(response);
        let (session, mut rx) = start(&transport, test_config());

        assert!(session.submit("hello").await.is_accepted());
        gate.notified().await;
        session.cancel().await;

        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(fragments(&drain(&mut rx)).len(), 1);

        // The unanswered user turn goes with the discarded reply
        let history = session.export().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, Role::System);
        assert!(session.pending_reply().await.is_none());
        assert!(session.last_error().await.is_none());
    }

    #[tokio::test]
    async fn test_failed_turn_does_not_leave_consecutive_user_messages() {
        let transport = Arc::new(MockTransport::new());
        transport.push(MockResponse::Fail(TransportError::ConnectionRefused("down".into())));
        transport.push(MockResponse::chunks(words(1)));
        let config = SessionConfig {
            max_retries: 0,
            ..test_config()
        };
        let (session, mut rx) = start(&transport, config);

        assert!(session.submit("first").await.is_accepted());
        collect_until(&mut rx, settled).await;
        assert!(matches!(
            session.state(),
            SessionState::Error { kind: DomainErrorKind::ConnectionFailure, .. }
        ));
        assert_eq!(session.export().await.len(), 1);

        assert!(session.submit("second").await.is_accepted());
        collect_until(&mut rx, settled).await;

        let requests = transport.requests();
        let roles: Vec<Role> = requests[1].messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User]);
        assert_eq!(requests[1].messages[1].content, "second");
    }

    #[tokio::test]
    async fn test_keep_with_nothing_streamed_rolls_back_user_turn() {
        let transport = Arc::new(MockTransport::new());
        let (response, gate) = MockResponse::gated(vec![]);
        transport.push(response);
        let (session, _rx) = start(&transport, test_config());

        assert!(session.submit("hello").await.is_accepted());
        gate.notified().await;
        session.cancel_with(PartialContent::Keep).await;

        let history = session.export().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, Role::System);
    }

    #[tokio::test]
    async fn test_abandoned_cancel_still_settles() {
        let transport = Arc::new(MockTransport::new());
        let (response, gate) = MockResponse::gated(words(2));
        transport.push(response);
        transport.push(MockResponse::chunks(words(1)));
        let (session, mut rx) = start(&transport, test_config());

        assert!(session.submit("hi").await.is_accepted());
        gate.notified().await;

        // Start a cancel and give up on it before it completes
        {
            let mut cancel = Box::pin(session.cancel());
            assert!(futures::poll!(cancel.as_mut()).is_pending());
            assert_eq!(session.state(), SessionState::Cancelling);
        }

        let mut state = session.subscribe_state();
        tokio::time::timeout(WAIT, state.wait_for(|s| *s == SessionState::Idle))
            .await
            .unwrap()
            .unwrap();
        drop(state);

        assert!(session.submit("again").await.is_accepted());
        let events = collect_until(&mut rx, |e| {
            *e == state_change(SessionState::Streaming, SessionState::Idle)
        })
        .await;
        assert!(events.contains(&state_change(SessionState::Cancelling, SessionState::Idle)));

        tokio::time::timeout(WAIT, session.shutdown()).await.unwrap();
        assert_eq!(transport.live_streams(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_after_abandoned_cancel() {
        let transport = Arc::new(MockTransport::new());
        let (response, gate) = MockResponse::gated(words(2));
        transport.push(response);
        let (session, _rx) = start(&transport, test_config());

        assert!(session.submit("hi").await.is_accepted());
        gate.notified().await;
        {
            let mut cancel = Box::pin(session.cancel());
            assert!(futures::poll!(cancel.as_mut()).is_pending());
        }

        tokio::time::timeout(WAIT, session.shutdown()).await.unwrap();
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(transport.live_streams(), 0);
    }

    #[tokio::test]
    async fn test_connection_retries_are_invisible_on_success() {
        let transport = Arc::new(MockTransport::new());
        transport.push(MockResponse::Fail(TransportError::ConnectionRefused("down".into())));
        transport.push(MockResponse::Fail(TransportError::ConnectionRefused("down".into())));
        transport.push(MockResponse::chunks(words(2)));
        let (session, mut rx) = start(&transport, test_config());

        assert!(session.submit("hi").await.is_accepted());
        let events = collect_until(&mut rx, settled).await;

        assert_eq!(transport.open_count(), 3);
        assert!(!events.iter().any(|e| matches!(e, SessionEvent::Error(_))));
        assert_eq!(events.last().unwrap(), &state_change(SessionState::Streaming, SessionState::Idle));
        assert!(session.last_error().await.is_none());
    }

    #[tokio::test]
    async fn test_mid_stream_disconnect_enters_error() {
        let transport = Arc::new(MockTransport::new());
        let mut items: Vec<Result<RawChunk, TransportError>> =
            words(8).into_iter().map(Ok).collect();
        items.push(Err(TransportError::Disconnected("connection reset".into())));
        transport.push(MockResponse::Stream(items));
        let (session, mut rx) = start(&transport, test_config());

        assert!(session.submit("hi").await.is_accepted());
        let events = collect_until(&mut rx, settled).await;

        assert_eq!(fragments(&events).len(), 2);
        let error = events
            .iter()
            .find_map(|e| match e {
                SessionEvent::Error(err) => Some(err.clone()),
                _ => None,
            })
            .expect("error event");
        assert_eq!(error.kind, DomainErrorKind::StreamingFailure);
        assert!(matches!(
            session.state(),
            SessionState::Error { kind: DomainErrorKind::StreamingFailure, .. }
        ));
        assert_eq!(transport.open_count(), 1);

        // Partial content survives a failure
        let history = session.export().await;
        assert_eq!(history.last().unwrap().content, joined(8).trim());
        assert_eq!(session.last_error().await, Some(error));
    }

    #[tokio::test]
    async fn test_single_flight() {
        let transport = Arc::new(MockTransport::new());
        let (response, gate) = MockResponse::gated(words(1));
        transport.push(response);
        let (session, _rx) = start(&transport, test_config());

        assert!(session.submit("first").await.is_accepted());
        gate.notified().await;
        assert_eq!(
            session.submit("second").await,
            SubmitOutcome::Rejected(RejectReason::Busy)
        );
        assert_eq!(transport.open_count(), 1);

        session.cancel().await;
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_concurrent_cancels_settle_once() {
        let transport = Arc::new(MockTransport::new());
        let (response, gate) = MockResponse::gated(words(2));
        transport.push(response);
        let (session, mut rx) = start(&transport, test_config());

        assert!(session.submit("hi").await.is_accepted());
        gate.notified().await;

        let other = session.clone();
        tokio::join!(session.cancel(), other.cancel());

        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(transport.live_streams(), 0);
        let events = drain(&mut rx);
        let to_idle = events
            .iter()
            .filter(|e| **e == state_change(SessionState::Cancelling, SessionState::Idle))
            .count();
        assert_eq!(to_idle, 1);
    }

    #[tokio::test]
    async fn test_cancel_when_idle_is_noop() {
        let transport = Arc::new(MockTransport::new());
        let (session, mut rx) = start(&transport, test_config());

        session.cancel().await;
        assert_eq!(session.state(), SessionState::Idle);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_submit_recovers_from_error() {
        let transport = Arc::new(MockTransport::new());
        transport.push(MockResponse::Fail(TransportError::ModelNotFound("llama3.2".into())));
        transport.push(MockResponse::chunks(words(1)));
        let (session, mut rx) = start(&transport, test_config());

        assert!(session.submit("hi").await.is_accepted());
        collect_until(&mut rx, settled).await;
        assert!(matches!(
            session.state(),
            SessionState::Error { kind: DomainErrorKind::ModelNotFound, .. }
        ));
        // Not a connection failure, so no retry
        assert_eq!(transport.open_count(), 1);

        assert!(session.submit("again").await.is_accepted());
        let events = collect_until(&mut rx, settled).await;
        assert!(matches!(
            &events[0],
            SessionEvent::StateChanged {
                from: SessionState::Error { kind: DomainErrorKind::ModelNotFound, .. },
                to: SessionState::Streaming,
            }
        ));
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.last_error().await.is_none());
    }

    #[tokio::test]
    async fn test_acknowledge_clears_error() {
        let transport = Arc::new(MockTransport::new());
        transport.push(MockResponse::Fail(TransportError::Status {
            status: 500,
            body: "boom".into(),
        }));
        let (session, mut rx) = start(&transport, test_config());

        assert!(session.submit("hi").await.is_accepted());
        collect_until(&mut rx, settled).await;
        assert!(session.last_error().await.is_some());

        session.acknowledge().await.unwrap();
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.last_error().await.is_none());
    }

    #[tokio::test]
    async fn test_empty_submit_rejected() {
        let transport = Arc::new(MockTransport::new());
        let (session, _rx) = start(&transport, test_config());

        assert_eq!(
            session.submit("  \n").await,
            SubmitOutcome::Rejected(RejectReason::EmptyMessage)
        );
        assert_eq!(transport.open_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_and_awaits_everything() {
        let transport = Arc::new(MockTransport::new());
        let (response, gate) = MockResponse::gated(words(2));
        transport.push(response);
        let (session, mut rx) = start(&transport, test_config());

        let mut status = session.start_connection_monitor().await;
        assert!(session.submit("hi").await.is_accepted());
        gate.notified().await;

        tokio::time::timeout(WAIT, session.shutdown()).await.unwrap();

        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(transport.live_streams(), 0);
        assert_eq!(
            session.submit("more").await,
            SubmitOutcome::Rejected(RejectReason::ShutDown)
        );

        // Monitor task is gone, so its status channel is closed
        tokio::time::timeout(WAIT, async {
            while status.changed().await.is_ok() {}
        })
        .await
        .unwrap();
        assert_ne!(*status.borrow(), ConnectionStatus::Offline);

        let events = drain(&mut rx);
        assert_eq!(
            events.last().unwrap(),
            &state_change(SessionState::Cancelling, SessionState::Idle)
        );

        // Idempotent
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_new_conversation_resets_history() {
        let transport = Arc::new(MockTransport::new());
        transport.push(MockResponse::chunks(words(2)));
        let (session, mut rx) = start(&transport, test_config());

        assert!(session.submit("hi").await.is_accepted());
        collect_until(&mut rx, settled).await;
        assert_eq!(session.export().await.len(), 3);

        session.new_conversation().await.unwrap();
        let history = session.export().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, Role::System);
        assert_eq!(history[0].content, "be helpful");
    }

    #[tokio::test]
    async fn test_replace_messages_refused_while_streaming() {
        let transport = Arc::new(MockTransport::new());
        let (response, gate) = MockResponse::gated(words(1));
        transport.push(response);
        let (session, _rx) = start(&transport, test_config());

        assert!(session.submit("hi").await.is_accepted());
        gate.notified().await;
        assert_eq!(
            session.replace_messages(vec![]).await,
            Err(RejectReason::Busy)
        );
        session.cancel().await;
        session
            .replace_messages(vec![crate::store::Message::user("restored")])
            .await
            .unwrap();
        let history = session.export().await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].content, "restored");
    }

    #[tokio::test]
    async fn test_zero_history_config_rejected() {
        let transport = Arc::new(MockTransport::new());
        let config = SessionConfig {
            max_history_messages: 0,
            ..test_config()
        };
        let err = ConversationSession::new(config, transport).err().unwrap();
        assert_eq!(err.kind, DomainErrorKind::ConfigInvalid);
    }

    #[tokio::test]
    async fn test_ensure_model_ready_uses_config() {
        let transport = Arc::new(MockTransport::new());
        transport.set_models(&["llama3.2:latest"]);
        let (session, _rx) = start(&transport, test_config());

        session.ensure_model_ready().await.unwrap();
        assert!(transport.pulled().is_empty());
    }
}
