//! Client-side session manager for one-to-one realtime chat.
//!
//! [`session::spawn_session`] wires the pieces together: identity comes from
//! an injected [`identity::SessionStore`], history from [`history::HistoryApi`],
//! sends go through [`sender::MessageApi`], and live pushes arrive over a
//! [`transport::RealtimeConnector`]. [`api::HttpBackend`] and
//! [`transport::WsConnector`] are the network implementations.

pub mod api;
pub mod channel;
pub mod error;
pub mod history;
pub mod identity;
pub mod reconciler;
pub mod sender;
pub mod session;
pub mod transport;

pub use api::HttpBackend;
pub use channel::ChannelState;
pub use error::ChatError;
pub use history::{HistoryApi, HistorySource};
pub use identity::{IdentityResolver, MemorySessionStore, SessionStore};
pub use reconciler::{Direction, RenderedMessage};
pub use sender::MessageApi;
pub use session::{spawn_session, ChatEvent, ChatView, SessionDeps, SessionHandle};
pub use transport::{MissingRealtimeConnector, RealtimeConnection, RealtimeConnector, WsConnector};

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;
