//! The session state machine and its event loop.
//!
//! Every external signal (identity change, peer change, inbound push,
//! history result, send result) enters through [`ChatSession::handle`] on a
//! single task. Async work is spawned and reports back through the same
//! inbox, tagged with the conversation key or connection epoch it was issued
//! for, so results that arrive after the conversation moved on are ignored.

use std::sync::Arc;

use shared::domain::{ConversationKey, Identity};
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info};

use crate::{
    channel::{ChannelManager, ChannelState},
    error::ChatError,
    history::{HistoryApi, HistoryLoader, HistorySource, LoadedHistory},
    identity::IdentityResolver,
    reconciler::{PushOutcome, Reconciler, RenderedMessage},
    sender::{MessageApi, OutboundSender},
    transport::{RealtimeConnection, RealtimeConnector, TransportEvent},
};

const CHAT_EVENT_CAPACITY: usize = 256;

pub struct SessionDeps {
    pub identity: IdentityResolver,
    pub history: Arc<dyn HistoryApi>,
    pub messages: Arc<dyn MessageApi>,
    pub connector: Arc<dyn RealtimeConnector>,
}

pub enum SessionEvent {
    IdentityChanged(Option<Identity>),
    PeerSelected(Option<Identity>),
    ComposeChanged(String),
    SendRequested,
    /// The view went away. A selected peer only leaves the room; with no
    /// peer the connection is closed.
    Teardown,
    Shutdown,
    Connected {
        identity: Identity,
        result: Result<Arc<dyn RealtimeConnection>, String>,
    },
    Inbound {
        epoch: u64,
        event: TransportEvent,
    },
    HistoryLoaded(LoadedHistory),
    SendFinished {
        content: String,
        result: Result<(), String>,
    },
}

/// Everything the view needs to render the conversation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChatView {
    pub identity: Option<Identity>,
    pub peer: Option<Identity>,
    pub channel_state: ChannelState,
    pub connection_error: Option<String>,
    pub loading: bool,
    pub sending: bool,
    pub compose: String,
    pub last_send_error: Option<String>,
    pub messages: Vec<RenderedMessage>,
}

#[derive(Debug, Clone)]
pub enum ChatEvent {
    ChannelStateChanged(ChannelState),
    HistoryLoaded {
        key: ConversationKey,
        count: usize,
        source: HistorySource,
    },
    MessageAppended(RenderedMessage),
    ConnectionError(String),
    SendFailed(String),
}

pub struct ChatSession {
    identity: Option<Identity>,
    peer: Option<Identity>,
    resolver: IdentityResolver,
    history: HistoryLoader,
    messages_api: Arc<dyn MessageApi>,
    channel: ChannelManager,
    reconciler: Reconciler,
    sender: OutboundSender,
    loading: Option<ConversationKey>,
    inbox: mpsc::UnboundedSender<SessionEvent>,
    events: broadcast::Sender<ChatEvent>,
}

impl ChatSession {
    /// The identity is read once here; later changes arrive as
    /// [`SessionEvent::IdentityChanged`].
    pub fn new(
        deps: SessionDeps,
        inbox: mpsc::UnboundedSender<SessionEvent>,
        events: broadcast::Sender<ChatEvent>,
    ) -> Self {
        let identity = deps.identity.current_identity();
        Self {
            identity,
            peer: None,
            history: HistoryLoader::new(deps.history),
            messages_api: deps.messages,
            channel: ChannelManager::new(deps.connector, inbox.clone()),
            resolver: deps.identity,
            reconciler: Reconciler::new(),
            sender: OutboundSender::new(),
            loading: None,
            inbox,
            events,
        }
    }

    pub fn key(&self) -> Option<ConversationKey> {
        match (&self.identity, &self.peer) {
            (Some(identity), Some(peer)) => {
                Some(ConversationKey::new(identity.clone(), peer.clone()))
            }
            _ => None,
        }
    }

    pub fn channel_state(&self) -> ChannelState {
        self.channel.state()
    }

    pub fn view(&self) -> ChatView {
        ChatView {
            identity: self.identity.clone(),
            peer: self.peer.clone(),
            channel_state: self.channel.state(),
            connection_error: self.channel.connection_error().map(str::to_string),
            loading: self.loading.is_some(),
            sending: self.sender.is_sending(),
            compose: self.sender.compose().to_string(),
            last_send_error: self.sender.last_error().map(str::to_string),
            messages: self.reconciler.rendered(),
        }
    }

    /// Applies one event. Returns false once the session has shut down.
    pub fn handle(&mut self, event: SessionEvent) -> bool {
        match event {
            SessionEvent::IdentityChanged(identity) => {
                let peer = self.peer.clone();
                self.set_conversation(identity, peer);
            }
            SessionEvent::PeerSelected(peer) => {
                let identity = self.identity.clone();
                self.set_conversation(identity, peer);
            }
            SessionEvent::ComposeChanged(text) => self.sender.set_compose(text),
            SessionEvent::SendRequested => self.start_send(),
            SessionEvent::Teardown => {
                let peer = self.peer.take();
                self.channel.teardown(peer.as_ref());
                self.reconciler.reset(None);
                self.loading = None;
            }
            SessionEvent::Shutdown => {
                self.channel.close();
                return false;
            }
            SessionEvent::Connected { identity, result } => self.on_connected(&identity, result),
            SessionEvent::Inbound { epoch, event } => self.on_inbound(epoch, event),
            SessionEvent::HistoryLoaded(loaded) => self.on_history(loaded),
            SessionEvent::SendFinished { content, result } => {
                if let Err(reason) = &result {
                    let _ = self.events.send(ChatEvent::SendFailed(reason.clone()));
                }
                self.sender.finish(&content, result);
            }
        }
        true
    }

    fn set_conversation(&mut self, identity: Option<Identity>, peer: Option<Identity>) {
        if identity == self.identity && peer == self.peer {
            return;
        }
        let previous_identity = std::mem::replace(&mut self.identity, identity);
        let previous_peer = std::mem::replace(&mut self.peer, peer);

        // The prior conversation is discarded before anything new is loaded.
        let key = self.key();
        self.reconciler.reset(key.clone());
        self.loading = None;

        self.sync_channel(previous_identity, previous_peer);

        if let Some(key) = key {
            self.start_history_load(key);
        }
    }

    fn sync_channel(&mut self, previous_identity: Option<Identity>, previous_peer: Option<Identity>) {
        let identity_changed = previous_identity != self.identity;
        if identity_changed {
            self.channel.close();
        }
        let previous_peer = previous_peer.filter(|_| !identity_changed);

        match (self.identity.clone(), self.peer.clone()) {
            (Some(identity), Some(peer)) => {
                if self.channel.is_ready_for(&identity) {
                    match previous_peer {
                        Some(previous) => self.channel.switch(&previous, &peer),
                        None => self.channel.join(&peer),
                    }
                } else {
                    self.channel
                        .ensure_connected(&identity, self.resolver.credentials());
                }
            }
            (Some(_), None) => {
                if let Some(previous) = previous_peer {
                    self.channel.leave(&previous);
                }
            }
            (None, _) => self.channel.close(),
        }
    }

    fn start_history_load(&mut self, key: ConversationKey) {
        self.loading = Some(key.clone());
        let loader = self.history.clone();
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            let loaded = loader.load(key).await;
            let _ = inbox.send(SessionEvent::HistoryLoaded(loaded));
        });
    }

    fn on_history(&mut self, loaded: LoadedHistory) {
        if self.loading.as_ref() != Some(&loaded.key) {
            debug!(conversation = %loaded.key, "discarding stale history result");
            return;
        }
        self.loading = None;

        let count = loaded.messages.len();
        if !self.reconciler.apply_history(&loaded.key, loaded.messages) {
            debug!(conversation = %loaded.key, "history no longer matches active conversation");
            return;
        }
        let _ = self.events.send(ChatEvent::HistoryLoaded {
            key: loaded.key,
            count,
            source: loaded.source,
        });
    }

    fn on_connected(
        &mut self,
        identity: &Identity,
        result: Result<Arc<dyn RealtimeConnection>, String>,
    ) {
        if !self.channel.install(identity, result) {
            if let Some(reason) = self.channel.connection_error() {
                let _ = self.events.send(ChatEvent::ConnectionError(reason.to_string()));
            }
            return;
        }
        if self.identity.as_ref() != Some(identity) {
            return;
        }
        if let Some(peer) = self.peer.clone() {
            self.channel.join(&peer);
        }
    }

    fn on_inbound(&mut self, epoch: u64, event: TransportEvent) {
        match event {
            TransportEvent::Message(message) => {
                let id = message.id.clone();
                match self.reconciler.accept_push(message) {
                    PushOutcome::Appended => {
                        if let Some(rendered) = self.reconciler.render_one(&id) {
                            let _ = self.events.send(ChatEvent::MessageAppended(rendered));
                        }
                    }
                    outcome => debug!(message_id = %id, ?outcome, "push not applied"),
                }
            }
            TransportEvent::Error(_) | TransportEvent::Closed if !self.channel.is_current(epoch) => {
                debug!(epoch, "ignoring health event from replaced connection");
            }
            TransportEvent::Error(reason) => {
                self.channel.fail(reason.clone());
                let _ = self.events.send(ChatEvent::ConnectionError(reason));
            }
            TransportEvent::Closed => {
                let reason = "realtime connection closed".to_string();
                self.channel.fail(reason.clone());
                let _ = self.events.send(ChatEvent::ConnectionError(reason));
            }
        }
    }

    fn start_send(&mut self) {
        let Some(request) = self.sender.prepare(self.peer.as_ref()) else {
            debug!("send skipped: nothing to send");
            return;
        };
        let api = Arc::clone(&self.messages_api);
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            let result = api
                .post_message(&request)
                .await
                .map(|created| debug!(message_id = %created.id, "message accepted by backend"))
                .map_err(|err| ChatError::Send(format!("{err:#}")).to_string());
            let _ = inbox.send(SessionEvent::SendFinished {
                content: request.content,
                result,
            });
        });
    }
}

/// Cloneable front door to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    inbox: mpsc::UnboundedSender<SessionEvent>,
    view: watch::Receiver<ChatView>,
    events: broadcast::Sender<ChatEvent>,
}

impl SessionHandle {
    fn post(&self, event: SessionEvent) -> Result<(), ChatError> {
        self.inbox.send(event).map_err(|_| ChatError::SessionClosed)
    }

    pub fn select_peer(&self, peer: Identity) -> Result<(), ChatError> {
        self.post(SessionEvent::PeerSelected(Some(peer)))
    }

    pub fn clear_peer(&self) -> Result<(), ChatError> {
        self.post(SessionEvent::PeerSelected(None))
    }

    pub fn set_identity(&self, identity: Option<Identity>) -> Result<(), ChatError> {
        self.post(SessionEvent::IdentityChanged(identity))
    }

    pub fn set_compose(&self, text: impl Into<String>) -> Result<(), ChatError> {
        self.post(SessionEvent::ComposeChanged(text.into()))
    }

    pub fn send(&self) -> Result<(), ChatError> {
        self.post(SessionEvent::SendRequested)
    }

    pub fn teardown(&self) -> Result<(), ChatError> {
        self.post(SessionEvent::Teardown)
    }

    pub fn shutdown(&self) -> Result<(), ChatError> {
        self.post(SessionEvent::Shutdown)
    }

    pub fn view(&self) -> ChatView {
        self.view.borrow().clone()
    }

    pub fn watch_view(&self) -> watch::Receiver<ChatView> {
        self.view.clone()
    }

    /// Resolves with the first published view matching `predicate`.
    pub async fn wait_for_view(
        &self,
        mut predicate: impl FnMut(&ChatView) -> bool,
    ) -> Result<ChatView, ChatError> {
        let mut view = self.view.clone();
        let matched = view
            .wait_for(|current| predicate(current))
            .await
            .map_err(|_| ChatError::SessionClosed)?;
        Ok((*matched).clone())
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }
}

/// Starts the session loop and the identity watch. The loop ends on
/// [`SessionHandle::shutdown`].
pub fn spawn_session(deps: SessionDeps) -> (SessionHandle, JoinHandle<()>) {
    let (inbox_tx, mut inbox_rx) = mpsc::unbounded_channel();
    let (events, _) = broadcast::channel(CHAT_EVENT_CAPACITY);
    let resolver = deps.identity.clone();
    let mut session = ChatSession::new(deps, inbox_tx.clone(), events.clone());
    let (view_tx, view_rx) = watch::channel(session.view());

    let handle = SessionHandle {
        inbox: inbox_tx,
        view: view_rx,
        events: events.clone(),
    };
    let seen = session.view().identity;
    info!(
        identity = ?seen.as_ref().map(Identity::as_str),
        "chat session started"
    );
    let identity_watch = resolver.watch(handle.clone(), seen);

    let task = tokio::spawn(async move {
        while let Some(event) = inbox_rx.recv().await {
            let state_before = session.channel_state();
            let running = session.handle(event);

            let state_after = session.channel_state();
            if state_after != state_before {
                let _ = events.send(ChatEvent::ChannelStateChanged(state_after));
            }
            view_tx.send_replace(session.view());
            if !running {
                break;
            }
        }
        identity_watch.abort();
        info!("chat session stopped");
    });

    (handle, task)
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
