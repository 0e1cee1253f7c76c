//! Channel lifecycle: one realtime connection per identity, reference-counted
//! room interest, and a single replaceable inbound listener.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use shared::{domain::Identity, protocol::ClientSignal};
use tokio::{
    sync::{broadcast::error::RecvError, mpsc},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    session::SessionEvent,
    transport::{RealtimeConnection, RealtimeConnector},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelState {
    #[default]
    Unconnected,
    Connecting,
    Joined,
    Error,
}

/// Which peers currently need a user room joined. The room is joined on the
/// first interested peer and left when the last one goes away.
#[derive(Debug, Default)]
pub struct RoomInterest {
    rooms: HashMap<Identity, HashSet<Identity>>,
}

impl RoomInterest {
    /// Returns true when this is the first interest in `room`.
    pub fn acquire(&mut self, room: &Identity, peer: &Identity) -> bool {
        let peers = self.rooms.entry(room.clone()).or_default();
        let first = peers.is_empty();
        peers.insert(peer.clone()) && first
    }

    /// Returns true when this released the last interest in `room`.
    pub fn release(&mut self, room: &Identity, peer: &Identity) -> bool {
        let Some(peers) = self.rooms.get_mut(room) else {
            return false;
        };
        if !peers.remove(peer) {
            return false;
        }
        if peers.is_empty() {
            self.rooms.remove(room);
            true
        } else {
            false
        }
    }

    pub fn count(&self, room: &Identity) -> usize {
        self.rooms.get(room).map_or(0, HashSet::len)
    }

    pub fn clear(&mut self) {
        self.rooms.clear();
    }
}

struct Channel {
    identity: Identity,
    epoch: u64,
    connection: Arc<dyn RealtimeConnection>,
}

pub struct ChannelManager {
    connector: Arc<dyn RealtimeConnector>,
    inbox: mpsc::UnboundedSender<SessionEvent>,
    channel: Option<Channel>,
    pending: Option<Identity>,
    interest: RoomInterest,
    listener: Option<JoinHandle<()>>,
    next_epoch: u64,
    state: ChannelState,
    connection_error: Option<String>,
}

impl ChannelManager {
    pub fn new(
        connector: Arc<dyn RealtimeConnector>,
        inbox: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            connector,
            inbox,
            channel: None,
            pending: None,
            interest: RoomInterest::default(),
            listener: None,
            next_epoch: 0,
            state: ChannelState::Unconnected,
            connection_error: None,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn connection_error(&self) -> Option<&str> {
        self.connection_error.as_deref()
    }

    /// A live connection exists for `identity`. A dead one is not reused, so
    /// re-selecting a conversation after a transport failure reconnects.
    pub fn is_ready_for(&self, identity: &Identity) -> bool {
        self.channel.as_ref().is_some_and(|channel| {
            &channel.identity == identity && channel.connection.is_connected()
        })
    }

    pub fn has_connection(&self) -> bool {
        self.channel.is_some()
    }

    pub fn has_listener(&self) -> bool {
        self.listener.is_some()
    }

    /// True when `epoch` names the connection currently owned.
    pub fn is_current(&self, epoch: u64) -> bool {
        self.channel
            .as_ref()
            .is_some_and(|channel| channel.epoch == epoch)
    }

    /// Starts a connect for `identity` unless one exists or is in flight.
    /// A connection held for another identity is closed first. The result
    /// comes back as [`SessionEvent::Connected`].
    pub fn ensure_connected(&mut self, identity: &Identity, credentials: Option<String>) {
        if self.is_ready_for(identity) || self.pending.as_ref() == Some(identity) {
            return;
        }
        if self.channel.is_some() {
            self.close();
        }

        self.pending = Some(identity.clone());
        self.connection_error = None;
        self.state = ChannelState::Connecting;
        info!(%identity, "opening realtime channel");

        let connector = Arc::clone(&self.connector);
        let inbox = self.inbox.clone();
        let identity = identity.clone();
        tokio::spawn(async move {
            let result = connector
                .connect(&identity, credentials)
                .await
                .map_err(|err| format!("{err:#}"));
            let _ = inbox.send(SessionEvent::Connected { identity, result });
        });
    }

    /// Adopts a finished connect. Returns false (and disconnects any late
    /// connection) when `identity` is no longer the one being connected.
    pub fn install(
        &mut self,
        identity: &Identity,
        result: Result<Arc<dyn RealtimeConnection>, String>,
    ) -> bool {
        if self.pending.as_ref() != Some(identity) {
            debug!(%identity, "discarding connect result for superseded identity");
            if let Ok(connection) = result {
                connection.disconnect();
            }
            return false;
        }
        self.pending = None;

        match result {
            Ok(connection) => {
                self.next_epoch += 1;
                self.channel = Some(Channel {
                    identity: identity.clone(),
                    epoch: self.next_epoch,
                    connection,
                });
                self.state = ChannelState::Unconnected;
                true
            }
            Err(reason) => {
                self.fail(reason);
                false
            }
        }
    }

    /// Replaces the inbound listener, then registers interest of `peer` in the
    /// user room. The join signal goes out only for the first interest, and
    /// always after the listener is subscribed.
    pub fn join(&mut self, peer: &Identity) {
        let Some(channel) = self.channel.as_ref() else {
            warn!(%peer, "join requested without a realtime channel");
            return;
        };
        let room = channel.identity.clone();
        let connection = Arc::clone(&channel.connection);
        let epoch = channel.epoch;

        self.replace_listener(connection.as_ref(), epoch);

        if self.interest.acquire(&room, peer) {
            if let Err(err) = connection.emit(ClientSignal::JoinUserRoom(room.clone())) {
                self.fail(format!("failed to join user room: {err:#}"));
                return;
            }
            info!(identity = %room, %peer, "joined user room");
        }
        if self.state != ChannelState::Error {
            self.state = ChannelState::Joined;
        }
    }

    /// Peer switch under the same identity: the new interest is taken before
    /// the old one is dropped, so the room stays joined and only the listener
    /// is replaced.
    pub fn switch(&mut self, from: &Identity, to: &Identity) {
        self.join(to);
        if let Some(channel) = self.channel.as_ref() {
            let room = channel.identity.clone();
            self.interest.release(&room, from);
        }
    }

    /// Drops the listener and the interest of `peer`; the connection stays open.
    pub fn leave(&mut self, peer: &Identity) {
        self.stop_listener();
        let Some(channel) = self.channel.as_ref() else {
            return;
        };
        let room = channel.identity.clone();
        if self.interest.release(&room, peer) {
            if let Err(err) = channel
                .connection
                .emit(ClientSignal::LeaveUserRoom(room.clone()))
            {
                warn!(identity = %room, error = %format!("{err:#}"), "failed to leave user room");
            } else {
                info!(identity = %room, %peer, "left user room");
            }
        }
        if self.state != ChannelState::Error {
            self.state = ChannelState::Unconnected;
        }
    }

    /// View teardown: with a peer still selected only the room is left;
    /// without one the connection is closed and discarded.
    pub fn teardown(&mut self, peer: Option<&Identity>) {
        match peer {
            Some(peer) => self.leave(peer),
            None => self.close(),
        }
    }

    pub fn close(&mut self) {
        self.stop_listener();
        self.pending = None;
        self.interest.clear();
        if let Some(channel) = self.channel.take() {
            channel.connection.disconnect();
            info!(identity = %channel.identity, "realtime channel closed");
        }
        self.state = ChannelState::Unconnected;
        self.connection_error = None;
    }

    /// Non-fatal: recorded for the view, never retried here.
    pub fn fail(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(%reason, "realtime channel error");
        self.state = ChannelState::Error;
        self.connection_error = Some(reason);
    }

    fn replace_listener(&mut self, connection: &dyn RealtimeConnection, epoch: u64) {
        self.stop_listener();
        let mut events = connection.subscribe();
        let inbox = self.inbox.clone();
        self.listener = Some(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if inbox.send(SessionEvent::Inbound { epoch, event }).is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "inbound listener lagged; messages dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }));
    }

    fn stop_listener(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

impl Drop for ChannelManager {
    fn drop(&mut self) {
        self.stop_listener();
    }
}

#[cfg(test)]
#[path = "tests/channel_tests.rs"]
mod tests;
