//! Routes client events to chat exchanges and chat events back to clients

use chrono::Utc;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chat::{ChatError, ChatService};
use crate::server::protocol::{
    CancelPayload, ChatMessagePayload, ClientEvent, ConnectionEstablished, HistoryPayload, HistoryRequestPayload,
    Pong, ServerEvent,
};
use crate::session::generate_session_id;

pub type ConnectionId = u64;

struct Connection {
    outbound: mpsc::UnboundedSender<ServerEvent>,
    /// Session used when an inbound event does not name one
    session_id: String,
}

/// Connection registry and event router.
///
/// Generations run in their own tasks and outlive the connection that started
/// them: a disconnect only stops delivery, the answer is still persisted.
pub struct Multiplexer {
    chat: Arc<ChatService>,
    connections: Mutex<HashMap<ConnectionId, Connection>>,
    inflight: Mutex<HashMap<(ConnectionId, String), InFlight>>,
    next_id: AtomicU64,
    next_request: AtomicU64,
}

/// The request currently running for a (connection, session) pair
struct InFlight {
    request: u64,
    cancel: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Multiplexer {
    pub fn new(chat: Arc<ChatService>) -> Arc<Self> {
        Arc::new(Self {
            chat,
            connections: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            next_request: AtomicU64::new(1),
        })
    }

    /// Register a connection bound to `requested` or a fresh session, and
    /// announce the session to the client
    pub async fn connect(&self, requested: Option<String>) -> (ConnectionId, mpsc::UnboundedReceiver<ServerEvent>) {
        let session_id = requested
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(generate_session_id);
        self.chat.store().get_or_create(&session_id).await;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (outbound, receiver) = mpsc::unbounded_channel();
        lock(&self.connections).insert(
            id,
            Connection {
                outbound,
                session_id: session_id.clone(),
            },
        );

        info!("Connection {} opened for session {}", id, session_id);
        self.deliver(
            id,
            ServerEvent::ConnectionEstablished(ConnectionEstablished {
                session_id,
                message: "Connected to chat service".to_string(),
            }),
        );

        (id, receiver)
    }

    /// Forget a connection. In-flight generations keep running.
    pub fn disconnect(&self, id: ConnectionId) {
        if lock(&self.connections).remove(&id).is_some() {
            info!("Connection {} closed", id);
        }
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.connections).len()
    }

    pub fn bound_session(&self, id: ConnectionId) -> Option<String> {
        lock(&self.connections).get(&id).map(|c| c.session_id.clone())
    }

    /// Send an event to one connection. Returns false when it is gone.
    fn deliver(&self, id: ConnectionId, event: ServerEvent) -> bool {
        let connections = lock(&self.connections);
        match connections.get(&id) {
            Some(connection) => {
                if connection.outbound.send(event).is_err() {
                    debug!("Connection {} receiver dropped", id);
                    return false;
                }
                true
            }
            None => {
                debug!(
                    "Dropping event for closed connection {} (session {:?})",
                    id,
                    event.session_id()
                );
                false
            }
        }
    }

    fn resolve_session(&self, id: ConnectionId, requested: Option<String>) -> Option<String> {
        requested
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .or_else(|| self.bound_session(id))
    }

    /// Handle a raw text frame
    pub async fn handle_text(self: &Arc<Self>, id: ConnectionId, text: &str) {
        match ClientEvent::parse(text) {
            Ok(event) => self.handle_event(id, event).await,
            Err(message) => {
                warn!("Connection {} sent an invalid frame: {}", id, message);
                let session_id = self.bound_session(id).unwrap_or_default();
                self.deliver(id, ServerEvent::error(session_id, &ChatError::Validation(message)));
            }
        }
    }

    pub async fn handle_event(self: &Arc<Self>, id: ConnectionId, event: ClientEvent) {
        match event {
            ClientEvent::ChatMessage(payload) => self.start_chat(id, payload).await,
            ClientEvent::Cancel(payload) => self.cancel(id, payload),
            ClientEvent::GetHistory(payload) => self.send_history(id, payload).await,
            ClientEvent::Ping => {
                self.deliver(id, ServerEvent::Pong(Pong { timestamp: Utc::now() }));
            }
        }
    }

    async fn start_chat(self: &Arc<Self>, id: ConnectionId, payload: ChatMessagePayload) {
        let Some(session_id) = self.resolve_session(id, payload.session_id) else {
            debug!("Ignoring chat message from unknown connection {}", id);
            return;
        };
        if let Err(error) = self.chat.validate(&payload.message) {
            self.deliver(id, ServerEvent::error(session_id, &error));
            return;
        }
        self.chat.store().get_or_create(&session_id).await;

        let key = (id, session_id.clone());
        let request = self.next_request.fetch_add(1, Ordering::Relaxed);
        let cancel = {
            let mut inflight = lock(&self.inflight);
            if inflight.contains_key(&key) {
                None
            } else {
                let cancel = CancellationToken::new();
                inflight.insert(
                    key.clone(),
                    InFlight {
                        request,
                        cancel: cancel.clone(),
                    },
                );
                Some(cancel)
            }
        };
        let Some(cancel) = cancel else {
            self.deliver(
                id,
                ServerEvent::error(session_id.clone(), &ChatError::RequestInProgress(session_id)),
            );
            return;
        };

        debug!("Connection {} started a request on session {}", id, session_id);
        let mut stream = self.chat.begin(session_id, payload.message, cancel);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut finished = false;
            while let Some(event) = stream.next().await {
                if event.is_terminal() && !finished {
                    this.finish(&key, request);
                    finished = true;
                }
                this.deliver(id, event.into());
            }
            if !finished {
                this.finish(&key, request);
            }
        });
    }

    /// Free the (connection, session) slot if it still belongs to `request`
    fn finish(&self, key: &(ConnectionId, String), request: u64) {
        let mut inflight = lock(&self.inflight);
        if inflight.get(key).is_some_and(|entry| entry.request == request) {
            inflight.remove(key);
        }
    }

    fn cancel(&self, id: ConnectionId, payload: CancelPayload) {
        let Some(session_id) = self.resolve_session(id, payload.session_id) else {
            return;
        };
        match lock(&self.inflight).get(&(id, session_id.clone())) {
            Some(entry) => {
                debug!(
                    "Connection {} cancelled request {} on session {}",
                    id, entry.request, session_id
                );
                entry.cancel.cancel();
            }
            None => debug!("Nothing to cancel for connection {} on session {}", id, session_id),
        }
    }

    async fn send_history(&self, id: ConnectionId, payload: HistoryRequestPayload) {
        let Some(session_id) = self.resolve_session(id, payload.session_id) else {
            return;
        };
        let event = match self.chat.store().list_messages(&session_id, payload.limit).await {
            Ok(messages) => ServerEvent::ChatHistory(HistoryPayload {
                session_id,
                messages,
            }),
            Err(e) => ServerEvent::error(session_id, &ChatError::from(e)),
        };
        self.deliver(id, event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::ChatSettings;
    use crate::provider::testing::{ScriptedProvider, Step};
    use crate::provider::AnswerCompletion;
    use crate::session::{HistoryFormatter, Role, SessionStore, Source, StoreLimits};
    use std::time::Duration;
    use tokio::sync::Notify;

    fn multiplexer(provider: ScriptedProvider) -> Arc<Multiplexer> {
        multiplexer_with(provider, StoreLimits::default())
    }

    fn multiplexer_with(provider: ScriptedProvider, limits: StoreLimits) -> Arc<Multiplexer> {
        let store = Arc::new(SessionStore::new(limits));
        let chat = Arc::new(ChatService::new(
            store,
            Arc::new(provider),
            HistoryFormatter::default(),
            ChatSettings::default(),
        ));
        Multiplexer::new(chat)
    }

    async fn recv(receiver: &mut mpsc::UnboundedReceiver<ServerEvent>) -> ServerEvent {
        tokio::time::timeout(Duration::from_secs(2), receiver.recv())
            .await
            .expect("timed out waiting for event")
            .expect("channel closed")
    }

    fn chat_message(session_id: &str, message: &str) -> String {
        serde_json::json!({
            "event": "chat_message",
            "data": {"sessionId": session_id, "message": message, "timestamp": "2024-01-01T00:00:00Z"}
        })
        .to_string()
    }

    async fn wait_for_messages(mux: &Multiplexer, session_id: &str, count: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while tokio::time::Instant::now() < deadline {
            let len = mux.chat.store().list_messages(session_id, None).await.map(|m| m.len()).unwrap_or(0);
            if len >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_connect_announces_requested_session() {
        let mux = multiplexer(ScriptedProvider::default());
        let (_id, mut rx) = mux.connect(Some("s1".to_string())).await;

        match recv(&mut rx).await {
            ServerEvent::ConnectionEstablished(payload) => assert_eq!(payload.session_id, "s1"),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(mux.chat.store().contains("s1").await);

        let (_id, mut rx) = mux.connect(None).await;
        match recv(&mut rx).await {
            ServerEvent::ConnectionEstablished(payload) => assert!(payload.session_id.starts_with("session_")),
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(mux.connection_count(), 2);
    }

    #[tokio::test]
    async fn test_chunks_then_complete_reach_originating_connection() {
        let mux = multiplexer(ScriptedProvider::answering(&["Hi", " there"], vec![Source::new("doc.pdf", 0.9)]));
        let (id, mut rx) = mux.connect(Some("s1".to_string())).await;
        let (_other, mut other_rx) = mux.connect(Some("s2".to_string())).await;
        recv(&mut rx).await;
        recv(&mut other_rx).await;

        mux.handle_text(id, &chat_message("s1", "hello")).await;

        let mut chunks = Vec::new();
        let complete = loop {
            match recv(&mut rx).await {
                ServerEvent::ChatResponseChunk(chunk) => {
                    assert_eq!(chunk.session_id, "s1");
                    assert!(!chunk.is_final);
                    chunks.push(chunk.content);
                }
                ServerEvent::ChatResponseComplete(complete) => break complete,
                other => panic!("unexpected event: {:?}", other),
            }
        };

        assert_eq!(chunks, vec!["Hi", " there"]);
        assert_eq!(complete.sources.len(), 1);
        assert_eq!(complete.sources[0].document, "doc.pdf");

        let stored = mux.chat.store().list_messages("s1", None).await.unwrap();
        assert_eq!(stored[1].id, complete.message_id);
        assert_eq!(stored[1].content, "Hi there");
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_does_not_cancel_generation() {
        let notify = Arc::new(Notify::new());
        let mux = multiplexer(ScriptedProvider::new(vec![
            Step::Delta("late".to_string()),
            Step::Pause(notify.clone()),
            Step::Done(AnswerCompletion::default()),
        ]));
        let (id, mut rx) = mux.connect(Some("s1".to_string())).await;
        recv(&mut rx).await;

        mux.handle_text(id, &chat_message("s1", "hello")).await;
        assert!(matches!(recv(&mut rx).await, ServerEvent::ChatResponseChunk(_)));

        mux.disconnect(id);
        notify.notify_one();
        wait_for_messages(&mux, "s1", 2).await;

        let stored = mux.chat.store().list_messages("s1", None).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].role, Role::Assistant);
        assert_eq!(stored[1].content, "late");
    }

    #[tokio::test]
    async fn test_duplicate_request_on_same_connection_is_rejected() {
        let notify = Arc::new(Notify::new());
        let mux = multiplexer(ScriptedProvider::new(vec![
            Step::Pause(notify.clone()),
            Step::Done(AnswerCompletion::default()),
        ]));
        let (id, mut rx) = mux.connect(Some("s1".to_string())).await;
        recv(&mut rx).await;

        mux.handle_text(id, &chat_message("s1", "first")).await;
        mux.handle_text(id, &chat_message("s1", "second")).await;

        match recv(&mut rx).await {
            ServerEvent::ChatError(error) => {
                assert_eq!(error.code, "REQUEST_IN_PROGRESS");
                assert!(!error.retryable);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        notify.notify_one();
        assert!(matches!(recv(&mut rx).await, ServerEvent::ChatResponseComplete(_)));

        // The slot is free again once the first request resolved.
        notify.notify_one();
        mux.handle_text(id, &chat_message("s1", "third")).await;
        assert!(matches!(recv(&mut rx).await, ServerEvent::ChatResponseComplete(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_finished_request_does_not_free_the_next_one() {
        for _ in 0..50 {
            let notify = Arc::new(Notify::new());
            let mux = multiplexer(ScriptedProvider::new(vec![
                Step::Pause(notify.clone()),
                Step::Done(AnswerCompletion::default()),
            ]));
            let (id, mut rx) = mux.connect(Some("s1".to_string())).await;
            recv(&mut rx).await;

            notify.notify_one();
            mux.handle_text(id, &chat_message("s1", "first")).await;
            assert!(matches!(recv(&mut rx).await, ServerEvent::ChatResponseComplete(_)));

            // The first task may still be winding down while the next request starts.
            mux.handle_text(id, &chat_message("s1", "second")).await;
            tokio::task::yield_now().await;
            mux.handle_text(id, &chat_message("s1", "third")).await;
            match recv(&mut rx).await {
                ServerEvent::ChatError(error) => assert_eq!(error.code, "REQUEST_IN_PROGRESS"),
                other => panic!("unexpected event: {:?}", other),
            }

            mux.handle_text(id, r#"{"event":"cancel","data":{"sessionId":"s1"}}"#).await;
            match recv(&mut rx).await {
                ServerEvent::ChatError(error) => assert_eq!(error.code, "CANCELLED"),
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_invalid_message_does_not_create_or_evict_sessions() {
        let limits = StoreLimits {
            max_sessions: 1,
            ..Default::default()
        };
        let mux = multiplexer_with(ScriptedProvider::answering(&["x"], Vec::new()), limits);
        let (id, mut rx) = mux.connect(Some("keep".to_string())).await;
        recv(&mut rx).await;

        mux.handle_text(id, &chat_message("other", "   ")).await;
        match recv(&mut rx).await {
            ServerEvent::ChatError(error) => {
                assert_eq!(error.code, "VALIDATION_ERROR");
                assert_eq!(error.session_id, "other");
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(mux.chat.store().contains("keep").await);
        assert!(!mux.chat.store().contains("other").await);
        assert_eq!(mux.chat.store().session_count().await, 1);
    }

    #[tokio::test]
    async fn test_cancel_ends_with_cancelled_error() {
        let mux = multiplexer(ScriptedProvider::new(vec![Step::Delta("a".to_string()), Step::Hang]));
        let (id, mut rx) = mux.connect(Some("s1".to_string())).await;
        recv(&mut rx).await;

        mux.handle_text(id, &chat_message("s1", "hello")).await;
        assert!(matches!(recv(&mut rx).await, ServerEvent::ChatResponseChunk(_)));

        mux.handle_text(id, r#"{"event":"cancel","data":{"sessionId":"s1"}}"#).await;
        match recv(&mut rx).await {
            ServerEvent::ChatError(error) => assert_eq!(error.code, "CANCELLED"),
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(mux.chat.store().list_messages("s1", None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_frame_yields_validation_error() {
        let mux = multiplexer(ScriptedProvider::default());
        let (id, mut rx) = mux.connect(Some("s1".to_string())).await;
        recv(&mut rx).await;

        mux.handle_text(id, "{oops").await;
        match recv(&mut rx).await {
            ServerEvent::ChatError(error) => {
                assert_eq!(error.session_id, "s1");
                assert_eq!(error.code, "VALIDATION_ERROR");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_blank_message_is_rejected() {
        let mux = multiplexer(ScriptedProvider::answering(&["x"], Vec::new()));
        let (id, mut rx) = mux.connect(Some("s1".to_string())).await;
        recv(&mut rx).await;

        mux.handle_text(id, &chat_message("s1", "  ")).await;
        match recv(&mut rx).await {
            ServerEvent::ChatError(error) => assert_eq!(error.code, "VALIDATION_ERROR"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ping_and_history() {
        let mux = multiplexer(ScriptedProvider::answering(&["answer"], Vec::new()));
        let (id, mut rx) = mux.connect(Some("s1".to_string())).await;
        recv(&mut rx).await;

        mux.handle_text(id, r#"{"event":"ping"}"#).await;
        assert!(matches!(recv(&mut rx).await, ServerEvent::Pong(_)));

        mux.handle_text(id, &chat_message("s1", "question")).await;
        loop {
            if let ServerEvent::ChatResponseComplete(_) = recv(&mut rx).await {
                break;
            }
        }

        mux.handle_text(id, r#"{"event":"get_history","data":{"limit":1}}"#).await;
        match recv(&mut rx).await {
            ServerEvent::ChatHistory(history) => {
                assert_eq!(history.session_id, "s1");
                assert_eq!(history.messages.len(), 1);
                assert_eq!(history.messages[0].content, "answer");
            }
            other => panic!("unexpected event: {:?}", other),
        }

        mux.handle_text(id, r#"{"event":"get_history","data":{"sessionId":"missing"}}"#).await;
        match recv(&mut rx).await {
            ServerEvent::ChatError(error) => assert_eq!(error.code, "SESSION_NOT_FOUND"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_message_without_session_uses_bound_session() {
        let mux = multiplexer(ScriptedProvider::answering(&["ok"], Vec::new()));
        let (id, mut rx) = mux.connect(Some("bound".to_string())).await;
        recv(&mut rx).await;

        mux.handle_text(id, r#"{"event":"chat_message","data":{"message":"hi"}}"#).await;
        match recv(&mut rx).await {
            ServerEvent::ChatResponseChunk(chunk) => assert_eq!(chunk.session_id, "bound"),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
