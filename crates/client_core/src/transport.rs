//! Realtime transport seam and its websocket implementation.
//!
//! A connection carries outbound [`ClientSignal`]s and fans inbound server
//! frames out as [`TransportEvent`]s over a broadcast channel. Room
//! membership and listener ownership live in [`crate::channel`].

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::{
    domain::Identity,
    protocol::{ClientSignal, MessagePayload, ServerEvent},
};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::ChatError;

const TRANSPORT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(MessagePayload),
    Error(String),
    Closed,
}

pub trait RealtimeConnection: Send + Sync {
    /// Queues a signal; never blocks the caller.
    fn emit(&self, signal: ClientSignal) -> Result<()>;
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
    fn disconnect(&self);
    fn is_connected(&self) -> bool;
}

#[async_trait]
pub trait RealtimeConnector: Send + Sync {
    async fn connect(
        &self,
        identity: &Identity,
        credentials: Option<String>,
    ) -> Result<Arc<dyn RealtimeConnection>>;
}

/// Connector that fails every attempt; used when no socket endpoint is configured.
pub struct MissingRealtimeConnector;

#[async_trait]
impl RealtimeConnector for MissingRealtimeConnector {
    async fn connect(
        &self,
        identity: &Identity,
        _credentials: Option<String>,
    ) -> Result<Arc<dyn RealtimeConnection>> {
        Err(anyhow!(
            "realtime transport unavailable for identity {identity}"
        ))
    }
}

/// Derives the websocket endpoint from a base URL: same origin, `ws(s)`
/// scheme, path `/ws`.
pub fn socket_endpoint(base_url: &str) -> std::result::Result<Url, ChatError> {
    let invalid = |reason: &str| ChatError::InvalidUrl {
        url: base_url.to_string(),
        reason: reason.to_string(),
    };
    let mut url = Url::parse(base_url.trim()).map_err(|err| invalid(&err.to_string()))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        _ => return Err(invalid("scheme must be http, https, ws or wss")),
    };
    url.set_scheme(scheme)
        .map_err(|()| invalid("cannot switch scheme"))?;
    url.set_path("/ws");
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

pub struct WsConnector {
    endpoint: Url,
}

impl WsConnector {
    pub fn new(base_url: &str) -> std::result::Result<Self, ChatError> {
        Ok(Self {
            endpoint: socket_endpoint(base_url)?,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn endpoint_with_credentials(&self, credentials: Option<&str>) -> Url {
        let mut url = self.endpoint.clone();
        if let Some(token) = credentials {
            url.query_pairs_mut().append_pair("token", token);
        }
        url
    }
}

#[async_trait]
impl RealtimeConnector for WsConnector {
    async fn connect(
        &self,
        identity: &Identity,
        credentials: Option<String>,
    ) -> Result<Arc<dyn RealtimeConnection>> {
        let url = self.endpoint_with_credentials(credentials.as_deref());
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("failed to connect websocket: {}", self.endpoint))?;
        info!(%identity, endpoint = %self.endpoint, "realtime connection established");
        Ok(Arc::new(WsConnection::start(ws_stream)))
    }
}

enum Outbound {
    Signal(ClientSignal),
    Close,
}

pub struct WsConnection {
    outbound: mpsc::UnboundedSender<Outbound>,
    events: broadcast::Sender<TransportEvent>,
    connected: Arc<AtomicBool>,
    reader_task: JoinHandle<()>,
}

impl WsConnection {
    fn start<S>(ws_stream: tokio_tungstenite::WebSocketStream<S>) -> Self
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();
        let (events, _) = broadcast::channel(TRANSPORT_EVENT_CAPACITY);
        let connected = Arc::new(AtomicBool::new(true));

        // The writer is not aborted on drop: it flushes whatever is queued,
        // including a Close, and ends once the outbound sender is gone.
        let writer_events = events.clone();
        tokio::spawn(async move {
            while let Some(next) = outbound_rx.recv().await {
                match next {
                    Outbound::Signal(signal) => {
                        let text = match serde_json::to_string(&signal) {
                            Ok(text) => text,
                            Err(err) => {
                                warn!(%err, "failed to encode client signal");
                                continue;
                            }
                        };
                        if let Err(err) = ws_writer.send(Message::Text(text)).await {
                            let reason = ChatError::Transport(format!("websocket send failed: {err}"));
                            let _ = writer_events.send(TransportEvent::Error(reason.to_string()));
                            break;
                        }
                    }
                    Outbound::Close => {
                        let _ = ws_writer.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        });

        let reader_events = events.clone();
        let reader_connected = Arc::clone(&connected);
        let reader_task = tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(ServerEvent::NewMessage(message)) => {
                            let _ = reader_events.send(TransportEvent::Message(message));
                        }
                        Ok(ServerEvent::Error(api_error)) => {
                            let _ = reader_events.send(TransportEvent::Error(api_error.to_string()));
                        }
                        Err(err) => {
                            warn!(%err, "ignoring unparsable server frame");
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        let reason = ChatError::Transport(format!("websocket receive failed: {err}"));
                        let _ = reader_events.send(TransportEvent::Error(reason.to_string()));
                        break;
                    }
                }
            }
            reader_connected.store(false, Ordering::SeqCst);
            let _ = reader_events.send(TransportEvent::Closed);
            debug!("websocket reader finished");
        });

        Self {
            outbound,
            events,
            connected,
            reader_task,
        }
    }
}

impl RealtimeConnection for WsConnection {
    fn emit(&self, signal: ClientSignal) -> Result<()> {
        if !self.is_connected() {
            return Err(anyhow!("websocket is not connected"));
        }
        self.outbound
            .send(Outbound::Signal(signal))
            .map_err(|_| anyhow!("websocket writer has stopped"))
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.outbound.send(Outbound::Close);
        }
        self.reader_task.abort();
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for WsConnection {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_endpoint_keeps_origin_and_switches_scheme() {
        let url = socket_endpoint("https://play.example.com/api?x=1").expect("endpoint");
        assert_eq!(url.as_str(), "wss://play.example.com/ws");

        let url = socket_endpoint("http://127.0.0.1:5000").expect("endpoint");
        assert_eq!(url.as_str(), "ws://127.0.0.1:5000/ws");
    }

    #[test]
    fn socket_endpoint_rejects_unknown_scheme() {
        let err = socket_endpoint("ftp://example.com").expect_err("must fail");
        assert!(matches!(err, ChatError::InvalidUrl { .. }));
        assert!(socket_endpoint("not a url").is_err());
    }

    #[test]
    fn credentials_are_sent_as_token_query() {
        let connector = WsConnector::new("http://localhost:8080").expect("connector");
        let url = connector.endpoint_with_credentials(Some("abc def"));
        assert_eq!(url.as_str(), "ws://localhost:8080/ws?token=abc+def");
        assert_eq!(
            connector.endpoint_with_credentials(None).as_str(),
            "ws://localhost:8080/ws"
        );
    }
}
