use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use shared::{
    domain::{Identity, MessageId},
    protocol::{ClientSignal, MessagePayload, ParticipantRef, SendMessageRequest},
};
use tokio::{
    sync::{broadcast, Notify},
    time::{sleep, timeout},
};

use crate::{
    history::HistoryApi,
    identity::{IdentityResolver, MemorySessionStore, USER_ID_KEY},
    sender::MessageApi,
    session::SessionDeps,
    transport::{RealtimeConnection, RealtimeConnector, TransportEvent},
};

pub(crate) fn id(raw: &str) -> Identity {
    Identity::normalize(raw).expect("identity")
}

pub(crate) fn msg(id: &str, from: &str, to: &str, content: &str, at: i64) -> MessagePayload {
    MessagePayload {
        id: MessageId(id.to_string()),
        sender: ParticipantRef::raw(from),
        recipient: ParticipantRef::raw(to),
        content: content.to_string(),
        created_at: Utc.timestamp_opt(at, 0).single(),
    }
}

pub(crate) fn store_for(user: &str) -> Arc<MemorySessionStore> {
    let store = MemorySessionStore::new();
    store.set(USER_ID_KEY, user);
    Arc::new(store)
}

/// Polls `check` until it holds, failing the test after two seconds.
pub(crate) async fn eventually(mut check: impl FnMut() -> bool) {
    timeout(Duration::from_secs(2), async {
        while !check() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

pub(crate) struct FakeConnection {
    signals: Mutex<Vec<ClientSignal>>,
    events: broadcast::Sender<TransportEvent>,
    connected: AtomicBool,
}

impl FakeConnection {
    pub(crate) fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            signals: Mutex::new(Vec::new()),
            events,
            connected: AtomicBool::new(true),
        })
    }

    pub(crate) fn signals(&self) -> Vec<ClientSignal> {
        self.signals.lock().expect("signals lock").clone()
    }

    pub(crate) fn push(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn listeners(&self) -> usize {
        self.events.receiver_count()
    }

    /// Simulates the server dropping the link.
    pub(crate) fn drop_link(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.push(TransportEvent::Closed);
    }
}

impl RealtimeConnection for FakeConnection {
    fn emit(&self, signal: ClientSignal) -> Result<()> {
        if !self.is_connected() {
            return Err(anyhow!("fake connection is closed"));
        }
        self.signals.lock().expect("signals lock").push(signal);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub(crate) struct FakeConnector {
    connections: Mutex<Vec<Arc<FakeConnection>>>,
    credentials: Mutex<Vec<Option<String>>>,
    fail_with: Mutex<Option<String>>,
}

impl FakeConnector {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn fail_with(&self, reason: &str) {
        *self.fail_with.lock().expect("fail lock") = Some(reason.to_string());
    }

    pub(crate) fn recover(&self) {
        *self.fail_with.lock().expect("fail lock") = None;
    }

    pub(crate) fn connect_count(&self) -> usize {
        self.credentials.lock().expect("credentials lock").len()
    }

    pub(crate) fn credentials(&self) -> Vec<Option<String>> {
        self.credentials.lock().expect("credentials lock").clone()
    }

    pub(crate) fn connections(&self) -> Vec<Arc<FakeConnection>> {
        self.connections.lock().expect("connections lock").clone()
    }

    pub(crate) fn last(&self) -> Arc<FakeConnection> {
        self.connections()
            .last()
            .cloned()
            .expect("no connection opened yet")
    }
}

#[async_trait]
impl RealtimeConnector for FakeConnector {
    async fn connect(
        &self,
        _identity: &Identity,
        credentials: Option<String>,
    ) -> Result<Arc<dyn RealtimeConnection>> {
        self.credentials
            .lock()
            .expect("credentials lock")
            .push(credentials);
        if let Some(reason) = self.fail_with.lock().expect("fail lock").clone() {
            return Err(anyhow!(reason));
        }
        let connection = FakeConnection::new();
        self.connections
            .lock()
            .expect("connections lock")
            .push(Arc::clone(&connection));
        Ok(connection)
    }
}

type Canned = std::result::Result<Vec<MessagePayload>, String>;

/// History backend keyed by peer. Unconfigured peers have an empty
/// conversation and no fallback.
#[derive(Default)]
pub(crate) struct FakeHistory {
    conversations: Mutex<HashMap<Identity, Canned>>,
    fallbacks: Mutex<HashMap<Identity, Canned>>,
    gates: Mutex<HashMap<Identity, Arc<Notify>>>,
    calls: Mutex<Vec<String>>,
}

impl FakeHistory {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn conversation(&self, peer: &str, messages: Vec<MessagePayload>) {
        self.conversations
            .lock()
            .expect("history lock")
            .insert(id(peer), Ok(messages));
    }

    pub(crate) fn fail_conversation(&self, peer: &str, reason: &str) {
        self.conversations
            .lock()
            .expect("history lock")
            .insert(id(peer), Err(reason.to_string()));
    }

    pub(crate) fn fallback(&self, peer: &str, messages: Vec<MessagePayload>) {
        self.fallbacks
            .lock()
            .expect("history lock")
            .insert(id(peer), Ok(messages));
    }

    /// Holds the primary fetch for `peer` until the returned notify fires.
    pub(crate) fn gate(&self, peer: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.gates
            .lock()
            .expect("history lock")
            .insert(id(peer), Arc::clone(&gate));
        gate
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("history lock").clone()
    }
}

#[async_trait]
impl HistoryApi for FakeHistory {
    async fn fetch_conversation(
        &self,
        self_identity: &Identity,
        peer: &Identity,
    ) -> Result<Vec<MessagePayload>> {
        self.calls
            .lock()
            .expect("history lock")
            .push(format!("conversation:{self_identity}:{peer}"));
        let gate = self.gates.lock().expect("history lock").get(peer).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let canned = self.conversations.lock().expect("history lock").get(peer).cloned();
        match canned {
            Some(Ok(messages)) => Ok(messages),
            Some(Err(reason)) => Err(anyhow!(reason)),
            None => Ok(Vec::new()),
        }
    }

    async fn fetch_with_peer(&self, peer: &Identity) -> Result<Vec<MessagePayload>> {
        self.calls
            .lock()
            .expect("history lock")
            .push(format!("peer:{peer}"));
        let canned = self.fallbacks.lock().expect("history lock").get(peer).cloned();
        match canned {
            Some(Ok(messages)) => Ok(messages),
            Some(Err(reason)) => Err(anyhow!(reason)),
            None => Err(anyhow!("no fallback for {peer}")),
        }
    }
}

#[derive(Default)]
pub(crate) struct FakeMessageApi {
    requests: Mutex<Vec<SendMessageRequest>>,
    fail_with: Mutex<Option<String>>,
    gate: Mutex<Option<Arc<Notify>>>,
}

impl FakeMessageApi {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn fail_with(&self, reason: &str) {
        *self.fail_with.lock().expect("api lock") = Some(reason.to_string());
    }

    pub(crate) fn gate(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock().expect("api lock") = Some(Arc::clone(&gate));
        gate
    }

    pub(crate) fn requests(&self) -> Vec<SendMessageRequest> {
        self.requests.lock().expect("api lock").clone()
    }
}

#[async_trait]
impl MessageApi for FakeMessageApi {
    async fn post_message(&self, request: &SendMessageRequest) -> Result<MessagePayload> {
        let count = {
            let mut requests = self.requests.lock().expect("api lock");
            requests.push(request.clone());
            requests.len()
        };
        let gate = self.gate.lock().expect("api lock").clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if let Some(reason) = self.fail_with.lock().expect("api lock").clone() {
            return Err(anyhow!(reason));
        }
        Ok(MessagePayload {
            id: MessageId(format!("sent-{count}")),
            sender: ParticipantRef::raw("self"),
            recipient: ParticipantRef::from(&request.recipient),
            content: request.content.clone(),
            created_at: None,
        })
    }
}

pub(crate) fn deps(
    store: Arc<MemorySessionStore>,
    history: Arc<FakeHistory>,
    messages: Arc<FakeMessageApi>,
    connector: Arc<FakeConnector>,
) -> SessionDeps {
    SessionDeps {
        identity: IdentityResolver::new(store),
        history,
        messages,
        connector,
    }
}
