//! The room engine: one task owning all mutable room state.
//!
//! Sessions, the broker peer and the HTTP handlers never touch the canvas
//! or the roster directly; they enqueue [`Command`]s and the engine applies
//! them one at a time, so every mutation is serialized. Outbound delivery
//! is split per session into a reliable queue and a small volatile queue
//! whose overflow drops the event (stroke and pointer hints only).

use std::collections::HashMap;

use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::canvas::Canvas;
use crate::codec::Decoded;
use crate::config::Config;
use crate::network::frame::FramePayload;
use crate::network::message::{
    self, BindRequest, ChatPayload, ChatRequest, PaintPayload, PointerPayload, ServerEvent,
    StrokePayload, ValidPaint,
};
use crate::roster::{Client, Roster, SessionId};

/// Messages delivered on a session's reliable queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Event(ServerEvent),
    /// Force-disconnect: the session sends a close frame and hangs up.
    Close,
}

/// Sender half of one attached session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub reliable: mpsc::UnboundedSender<Outbound>,
    pub volatile: mpsc::Sender<ServerEvent>,
    pub remote_addr: String,
}

/// Raised on the persistence channel for every layer mutation. Only
/// `Change` (an authoritative local edit) triggers a snapshot write;
/// `Update` marks an edit replicated from a peer server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerSignal {
    Change(usize),
    Update(usize),
}

#[derive(Debug)]
pub enum Command {
    Connect {
        id: SessionId,
        handle: SessionHandle,
    },
    Bind {
        id: SessionId,
        req: BindRequest,
    },
    Paint {
        id: SessionId,
        paint: ValidPaint,
    },
    Stroke {
        id: SessionId,
        stroke: StrokePayload,
    },
    Pointer {
        id: SessionId,
        pointer: PointerPayload,
    },
    Chat {
        id: SessionId,
        req: ChatRequest,
    },
    Disconnect {
        id: SessionId,
    },
    /// A frame received from a peer server via the broker.
    Remote {
        origin: Uuid,
        payload: FramePayload,
    },
    /// Servers declared dead by the liveness loop.
    PruneServers(Vec<Uuid>),
    LoadLayer {
        n: usize,
        raster: Decoded,
        blob: Vec<u8>,
        reply: oneshot::Sender<bool>,
    },
    LocalClients {
        reply: oneshot::Sender<Vec<Client>>,
    },
    RemoteServerIds {
        reply: oneshot::Sender<Vec<Uuid>>,
    },
    Flatten {
        reply: oneshot::Sender<Option<Vec<u8>>>,
    },
    LayerSnapshot {
        n: usize,
        reply: oneshot::Sender<Option<Vec<u8>>>,
    },
    Shutdown,
}

/// Cloneable handle for enqueueing work on an engine.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl EngineHandle {
    pub fn send(&self, cmd: Command) {
        let _ = self.tx.send(cmd);
    }

    pub async fn flatten(&self) -> Option<Vec<u8>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Flatten { reply });
        rx.await.ok().flatten()
    }

    pub async fn layer_snapshot(&self, n: usize) -> Option<Vec<u8>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::LayerSnapshot { n, reply });
        rx.await.ok().flatten()
    }

    pub async fn local_clients(&self) -> Vec<Client> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::LocalClients { reply });
        rx.await.unwrap_or_default()
    }

    pub async fn remote_server_ids(&self) -> Vec<Uuid> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::RemoteServerIds { reply });
        rx.await.unwrap_or_default()
    }

    /// Returns false when the raster was discarded (dimension mismatch).
    pub async fn load_layer(&self, n: usize, raster: Decoded, blob: Vec<u8>) -> bool {
        let (reply, rx) = oneshot::channel();
        self.send(Command::LoadLayer {
            n,
            raster,
            blob,
            reply,
        });
        rx.await.unwrap_or(false)
    }
}

struct SessionState {
    handle: SessionHandle,
    uuid: Option<Uuid>,
}

pub struct Engine {
    id: Uuid,
    config: Config,
    canvas: Canvas,
    roster: Roster,
    sessions: HashMap<SessionId, SessionState>,
    rx: mpsc::UnboundedReceiver<Command>,
    broker: Option<mpsc::UnboundedSender<FramePayload>>,
    signals: Option<mpsc::UnboundedSender<LayerSignal>>,
}

impl Engine {
    pub fn new(id: Uuid, config: Config, canvas: Canvas) -> (Engine, EngineHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = Engine {
            id,
            config,
            canvas,
            roster: Roster::new(),
            sessions: HashMap::new(),
            rx,
            broker: None,
            signals: None,
        };
        (engine, EngineHandle { tx })
    }

    /// Attach the broker publish queue; frames the engine originates are
    /// published there with this server's id.
    pub fn set_broker(&mut self, tx: mpsc::UnboundedSender<FramePayload>) {
        self.broker = Some(tx);
    }

    /// Attach the persistence signal channel.
    pub fn set_signals(&mut self, tx: mpsc::UnboundedSender<LayerSignal>) {
        self.signals = Some(tx);
    }

    pub async fn run(mut self) {
        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                Command::Connect { id, handle } => self.handle_connect(id, handle),
                Command::Bind { id, req } => self.handle_bind(id, req),
                Command::Paint { id, paint } => self.handle_paint(id, paint),
                Command::Stroke { id, stroke } => self.handle_stroke(id, stroke),
                Command::Pointer { id, pointer } => self.handle_pointer(id, pointer),
                Command::Chat { id, req } => self.handle_chat(id, req),
                Command::Disconnect { id } => self.handle_disconnect(id),
                Command::Remote { origin, payload } => self.handle_remote(origin, payload),
                Command::PruneServers(dead) => self.handle_prune(dead),
                Command::LoadLayer {
                    n,
                    raster,
                    blob,
                    reply,
                } => {
                    let _ = reply.send(self.handle_load_layer(n, raster, blob));
                }
                Command::LocalClients { reply } => {
                    let _ = reply.send(self.roster.local_clients(self.id));
                }
                Command::RemoteServerIds { reply } => {
                    let _ = reply.send(self.roster.remote_server_ids(self.id));
                }
                Command::Flatten { reply } => {
                    let _ = reply.send(match self.canvas.flatten() {
                        Ok(blob) => Some(blob),
                        Err(e) => {
                            warn!("flatten failed: {}", e);
                            None
                        }
                    });
                }
                Command::LayerSnapshot { n, reply } => {
                    let blob = self.canvas.layer_mut(n).and_then(|l| match l.encode_snapshot() {
                        Ok(blob) => Some(blob),
                        Err(e) => {
                            warn!("layer {}: snapshot encode failed: {}", n, e);
                            None
                        }
                    });
                    let _ = reply.send(blob);
                }
                Command::Shutdown => break,
            }
        }
        // Dropping the signal sender lets the persist task drain and exit.
        debug!("engine {} stopped", self.id);
    }

    fn handle_connect(&mut self, id: SessionId, handle: SessionHandle) {
        debug!("session {} connected from {}", id, handle.remote_addr);
        let _ = handle
            .reliable
            .send(Outbound::Event(ServerEvent::Server { id: self.id }));
        let _ = handle.reliable.send(Outbound::Event(ServerEvent::Config(
            self.config.distributable(),
        )));
        self.sessions.insert(
            id,
            SessionState {
                handle,
                uuid: None,
            },
        );
    }

    fn handle_bind(&mut self, id: SessionId, req: BindRequest) {
        let remote_addr = match self.sessions.get(&id) {
            Some(s) => s.handle.remote_addr.clone(),
            None => return,
        };
        let bound = self.roster.bind(
            req.uuid.as_deref(),
            req.pin.as_deref(),
            &req.name,
            &remote_addr,
            id,
            self.id,
        );
        if let Some(old) = bound.kicked.filter(|old| *old != id) {
            info!("session {} superseded by {}", old, id);
            self.kick(old);
        }
        // A session re-binding under a different identity abandons its
        // previous record.
        if let Some(prev) = self.sessions.get(&id).and_then(|s| s.uuid) {
            if prev != bound.uuid && self.roster.session_of(&prev) == Some(id) {
                self.roster.mark_offline(&prev);
            }
        }
        if let Some(state) = self.sessions.get_mut(&id) {
            state.uuid = Some(bound.uuid);
        }

        let (name, pin) = match self.roster.get(&bound.uuid) {
            Some(c) => (c.name.clone(), c.pin.clone()),
            None => return,
        };
        info!(
            "{} client {} ({:?}) on session {}",
            if bound.created { "new" } else { "rebound" },
            bound.uuid,
            name,
            id
        );
        self.send_reliable(
            id,
            ServerEvent::Client {
                uuid: bound.uuid,
                name: name.clone(),
                pin,
            },
        );
        self.system_message(format!("! {} has join.", name));
        self.broadcast_roster();
        self.publish_provide();
    }

    fn handle_paint(&mut self, id: SessionId, paint: ValidPaint) {
        let client = match self.bound_client(id) {
            Some(c) => c.dist(),
            None => return,
        };
        let applied = self.apply_patch(&paint.payload, &paint.patch);
        let event = ServerEvent::Paint {
            client: client.clone(),
            paint: paint.payload.clone(),
        };
        self.broadcast(&event, Some(id));
        self.send_reliable(id, ServerEvent::Painted);
        self.publish(FramePayload::Paint {
            client,
            body: paint.payload,
        });
        if let Some(layer) = applied {
            self.signal(LayerSignal::Change(layer));
        }
    }

    fn handle_stroke(&mut self, id: SessionId, stroke: StrokePayload) {
        let client = match self.bound_client(id) {
            Some(c) => c.dist(),
            None => return,
        };
        let event = ServerEvent::Stroke {
            client: client.clone(),
            stroke: stroke.clone(),
        };
        self.broadcast_volatile(&event, Some(id));
        self.publish(FramePayload::Stroke {
            client,
            body: stroke,
        });
    }

    fn handle_pointer(&mut self, id: SessionId, pointer: PointerPayload) {
        let client = match self.bound_client(id) {
            Some(c) => c.dist(),
            None => return,
        };
        let event = ServerEvent::Pointer {
            client: client.clone(),
            pointer,
        };
        self.broadcast_volatile(&event, Some(id));
        self.publish(FramePayload::Pointer {
            client,
            body: pointer,
        });
    }

    fn handle_chat(&mut self, id: SessionId, req: ChatRequest) {
        let client = match self.bound_client(id) {
            Some(c) => c.dist(),
            None => return,
        };
        let chat = ChatPayload {
            message: req.message,
            time: req.time.unwrap_or_else(now_ms),
        };
        let event = ServerEvent::Chat {
            client: Some(client.clone()),
            chat: chat.clone(),
        };
        self.broadcast(&event, None);
        self.publish(FramePayload::Chat { client, body: chat });
    }

    fn handle_disconnect(&mut self, id: SessionId) {
        let state = match self.sessions.remove(&id) {
            Some(s) => s,
            None => return,
        };
        debug!("session {} disconnected", id);
        let uuid = match state.uuid {
            Some(u) => u,
            None => return,
        };
        // A kicked session's uuid already belongs to its successor; only
        // the current holder marks the client offline.
        if self.roster.session_of(&uuid) != Some(id) {
            return;
        }
        let name = self
            .roster
            .get(&uuid)
            .map(|c| c.name.clone())
            .unwrap_or_default();
        self.roster.mark_offline(&uuid);
        self.system_message(format!("! {} has left.", name));
        self.broadcast_roster();
        self.publish_provide();
    }

    fn handle_remote(&mut self, origin: Uuid, payload: FramePayload) {
        match payload {
            FramePayload::Provide { clients } => {
                let kicked = self.roster.reconcile(origin, clients);
                for session in kicked {
                    self.kick(session);
                }
                self.broadcast_roster();
            }
            FramePayload::System { body } => {
                let event = ServerEvent::Chat {
                    client: None,
                    chat: ChatPayload {
                        message: body,
                        time: now_ms(),
                    },
                };
                self.broadcast(&event, None);
            }
            FramePayload::Chat { client, body } => {
                let event = ServerEvent::Chat {
                    client: Some(client),
                    chat: body,
                };
                self.broadcast(&event, None);
            }
            FramePayload::Paint { client, body } => {
                let patch = match message::decode_patch(&body.data) {
                    Ok(patch) => patch,
                    Err(e) => {
                        warn!("peer {}: dropping undecodable paint: {}", origin, e);
                        return;
                    }
                };
                let applied = self.apply_patch(&body, &patch);
                let event = ServerEvent::Paint {
                    client,
                    paint: body,
                };
                self.broadcast(&event, None);
                if let Some(layer) = applied {
                    self.signal(LayerSignal::Update(layer));
                }
            }
            FramePayload::Stroke { client, body } => {
                let event = ServerEvent::Stroke {
                    client,
                    stroke: body,
                };
                self.broadcast_volatile(&event, None);
            }
            FramePayload::Pointer { client, body } => {
                let event = ServerEvent::Pointer {
                    client,
                    pointer: body,
                };
                self.broadcast_volatile(&event, None);
            }
            // Presence and liveness frames are answered by the broker task.
            FramePayload::Collect | FramePayload::Ping | FramePayload::Pong => {}
        }
    }

    fn handle_prune(&mut self, dead: Vec<Uuid>) {
        if dead.is_empty() {
            return;
        }
        info!("pruning dead servers: {:?}", dead);
        self.roster.prune_dead_servers(&dead);
        self.broadcast_roster();
    }

    fn handle_load_layer(&mut self, n: usize, raster: Decoded, blob: Vec<u8>) -> bool {
        if raster.width != self.canvas.width() || raster.height != self.canvas.height() {
            warn!(
                "layer {}: discarding snapshot sized {}x{} (canvas is {}x{})",
                n,
                raster.width,
                raster.height,
                self.canvas.width(),
                self.canvas.height()
            );
            return false;
        }
        let layer = match self.canvas.layer_mut(n) {
            Some(layer) => layer,
            None => return false,
        };
        layer.load(raster.data, Some(blob));
        info!("layer {} restored from snapshot", n);
        // Anyone already attached holds a stale raster; make them re-sync.
        let sessions: Vec<SessionId> = self.sessions.keys().copied().collect();
        for id in sessions {
            self.kick(id);
        }
        true
    }

    /// Server-generated chat: local fan-out plus a `system` frame.
    fn system_message(&mut self, text: String) {
        let event = ServerEvent::Chat {
            client: None,
            chat: ChatPayload {
                message: text.clone(),
                time: now_ms(),
            },
        };
        self.broadcast(&event, None);
        self.publish(FramePayload::System { body: text });
    }

    fn apply_patch(&mut self, payload: &PaintPayload, patch: &Decoded) -> Option<usize> {
        let layer = self.canvas.layer_mut(payload.layer_number)?;
        layer.write(&patch.data, payload.x, payload.y, patch.width, patch.height);
        Some(layer.index())
    }

    fn bound_client(&self, id: SessionId) -> Option<&Client> {
        let uuid = self.sessions.get(&id)?.uuid?;
        self.roster.get(&uuid)
    }

    fn send_reliable(&self, id: SessionId, event: ServerEvent) {
        if let Some(state) = self.sessions.get(&id) {
            let _ = state.handle.reliable.send(Outbound::Event(event));
        }
    }

    fn kick(&self, id: SessionId) {
        if let Some(state) = self.sessions.get(&id) {
            let _ = state.handle.reliable.send(Outbound::Close);
        }
    }

    fn broadcast(&self, event: &ServerEvent, except: Option<SessionId>) {
        for (id, state) in &self.sessions {
            if Some(*id) == except {
                continue;
            }
            let _ = state.handle.reliable.send(Outbound::Event(event.clone()));
        }
    }

    fn broadcast_volatile(&self, event: &ServerEvent, except: Option<SessionId>) {
        for (id, state) in &self.sessions {
            if Some(*id) == except {
                continue;
            }
            if let Err(mpsc::error::TrySendError::Full(_)) =
                state.handle.volatile.try_send(event.clone())
            {
                debug!("session {}: volatile queue full, dropping event", id);
            }
        }
    }

    fn broadcast_roster(&self) {
        self.broadcast(
            &ServerEvent::Clients {
                clients: self.roster.snapshot_online(),
            },
            None,
        );
    }

    fn publish(&self, payload: FramePayload) {
        if let Some(tx) = &self.broker {
            let _ = tx.send(payload);
        }
    }

    fn signal(&self, sig: LayerSignal) {
        if let Some(tx) = &self.signals {
            let _ = tx.send(sig);
        }
    }

    fn publish_provide(&self) {
        if self.broker.is_some() {
            self.publish(FramePayload::Provide {
                clients: self.roster.local_clients(self.id),
            });
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A handle wired to a bare channel instead of a running engine.
#[cfg(test)]
pub(crate) fn test_handle() -> (EngineHandle, mpsc::UnboundedReceiver<Command>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EngineHandle { tx }, rx)
}
