//! Server side of one client socket.
//!
//! A session decodes and validates inbound events, forwards the valid ones
//! to the engine, and pumps the engine's outbound queues back over the
//! socket. Anything malformed is dropped without a reply; the socket is
//! never closed over bad input.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use log::{debug, trace, warn};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::engine::{Command, EngineHandle, Outbound, SessionHandle};
use crate::network::message::ClientEvent;
use crate::roster::SessionId;

/// Length of the volatile outbound queue; overflow drops the event.
const VOLATILE_QUEUE: usize = 64;

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// Drive one socket until it closes or the engine kicks it.
pub async fn serve(socket: WebSocket, engine: EngineHandle, config: Arc<Config>, remote_addr: String) {
    let id: SessionId = NEXT_SESSION.fetch_add(1, Ordering::Relaxed);
    let (reliable_tx, mut reliable_rx) = mpsc::unbounded_channel();
    let (volatile_tx, mut volatile_rx) = mpsc::channel(VOLATILE_QUEUE);
    engine.send(Command::Connect {
        id,
        handle: SessionHandle {
            reliable: reliable_tx,
            volatile: volatile_tx,
            remote_addr,
        },
    });

    let (mut sink, mut stream) = socket.split();
    let writer = tokio::spawn(async move {
        loop {
            let (event, close) = tokio::select! {
                biased;
                out = reliable_rx.recv() => match out {
                    Some(Outbound::Event(event)) => (Some(event), false),
                    Some(Outbound::Close) => (None, true),
                    None => break,
                },
                event = volatile_rx.recv() => match event {
                    Some(event) => (Some(event), false),
                    None => break,
                },
            };
            if close {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            if let Some(event) = event {
                let text = match event.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("session {}: cannot serialize event: {}", id, e);
                        continue;
                    }
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        }
    });

    while let Some(msg) = stream.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                debug!("session {}: socket error: {}", id, e);
                break;
            }
        };
        match msg {
            Message::Text(text) => handle_text(id, &engine, &config, &text),
            Message::Close(_) => break,
            // Binary frames are not part of the protocol; pings are
            // answered by the transport.
            _ => {}
        }
    }

    engine.send(Command::Disconnect { id });
    let _ = writer.await;
}

/// Decode and validate one inbound frame, forwarding it if it survives.
fn handle_text(id: SessionId, engine: &EngineHandle, config: &Config, text: &str) {
    let event: ClientEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(e) => {
            trace!("session {}: ignoring malformed event: {}", id, e);
            return;
        }
    };
    match event {
        ClientEvent::Client(req) => match req.validate() {
            Ok(()) => engine.send(Command::Bind { id, req }),
            Err(e) => trace!("session {}: ignoring client event: {}", id, e),
        },
        ClientEvent::Paint(req) => match req.validate(config) {
            Ok(paint) => engine.send(Command::Paint { id, paint }),
            Err(e) => trace!("session {}: ignoring paint event: {}", id, e),
        },
        ClientEvent::Stroke(req) => match req.validate(config) {
            Ok(stroke) => engine.send(Command::Stroke { id, stroke }),
            Err(e) => trace!("session {}: ignoring stroke event: {}", id, e),
        },
        ClientEvent::Pointer(req) => match req.validate(config) {
            Ok(pointer) => engine.send(Command::Pointer { id, pointer }),
            Err(e) => trace!("session {}: ignoring pointer event: {}", id, e),
        },
        ClientEvent::Chat(req) => match req.validate() {
            Ok(()) => engine.send(Command::Chat { id, req }),
            Err(e) => trace!("session {}: ignoring chat event: {}", id, e),
        },
    }
}
