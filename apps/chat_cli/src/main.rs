mod config;
mod render;

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{
    spawn_session, ChatEvent, HttpBackend, IdentityResolver, MemorySessionStore, SessionDeps,
    SessionHandle, WsConnector,
};
use shared::domain::Identity;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::{
    config::load_settings,
    render::{parse_command, Command, Transcript},
};

#[derive(Parser, Debug)]
#[command(about = "Terminal client for one-to-one realtime chat")]
struct Args {
    #[arg(long, default_value = "chat.toml")]
    config: PathBuf,
    #[arg(long)]
    api_url: Option<String>,
    #[arg(long)]
    socket_url: Option<String>,
    /// JSON object holding `token`, `userId` and/or `user`.
    #[arg(long)]
    session_file: Option<PathBuf>,
    #[arg(long)]
    peer: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut settings = load_settings(&args.config);
    if let Some(v) = args.api_url {
        settings.api_base_url = v;
    }
    if let Some(v) = args.socket_url {
        settings.socket_url = Some(v);
    }
    if let Some(v) = args.session_file {
        settings.session_file = Some(v);
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.log_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let store = match &settings.session_file {
        Some(path) => MemorySessionStore::load_json_file(path)?,
        None => MemorySessionStore::new(),
    };
    let resolver = IdentityResolver::new(Arc::new(store));
    if resolver.current_identity().is_none() {
        warn!("no identity in session state; conversations stay empty until one is set");
    }

    let backend = HttpBackend::new(&settings.api_base_url)
        .context("invalid api base url")?
        .with_credentials(resolver.clone());
    let connector =
        WsConnector::new(settings.socket_origin()).context("invalid socket url")?;
    info!(api = %settings.api_base_url, socket = %connector.endpoint(), "starting chat client");

    let backend = Arc::new(backend);
    let (session, task) = spawn_session(SessionDeps {
        identity: resolver,
        history: backend.clone(),
        messages: backend,
        connector: Arc::new(connector),
    });

    let printer = tokio::spawn(print_session(session.clone()));

    if let Some(peer) = args.peer.as_deref().and_then(Identity::normalize) {
        session.select_peer(peer)?;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };
        match parse_command(&line) {
            Some(Command::Peer(peer)) => session.select_peer(peer)?,
            Some(Command::Leave) => session.clear_peer()?,
            Some(Command::Quit) => break,
            Some(Command::Send(text)) => {
                session.set_compose(text)?;
                session.send()?;
            }
            None => eprintln!("usage: /peer <id> | /leave | /quit | <message>"),
        }
    }

    session.teardown()?;
    session.shutdown()?;
    task.await.context("session task failed")?;
    printer.abort();
    Ok(())
}

async fn print_session(session: SessionHandle) {
    let mut view = session.watch_view();
    let mut events = session.subscribe_events();
    let mut transcript = Transcript::default();
    loop {
        tokio::select! {
            changed = view.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = view.borrow_and_update().clone();
                for line in transcript.update(&current) {
                    println!("{line}");
                }
            }
            event = events.recv() => match event {
                Ok(ChatEvent::ConnectionError(reason)) => eprintln!("! connection: {reason}"),
                Ok(ChatEvent::SendFailed(reason)) => eprintln!("! not sent: {reason}"),
                Ok(ChatEvent::ChannelStateChanged(state)) => info!(?state, "channel state"),
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}
