//! Multi-server coordination over a shared pub/sub broker.
//!
//! Each server of a room runs one broker peer. It republishes what the
//! engine originates, feeds received frames back into the engine, answers
//! presence demands (`collect` -> `provide`) and liveness probes
//! (`ping` -> `pong`), and declares unresponsive peers dead.
//!
//! Frames published by this server come back on every subscribed channel;
//! they are recognized by origin id and dropped before they can touch
//! local state.

use std::collections::HashSet;
use std::time::Duration;

use futures_util::StreamExt;
use log::{debug, info, warn};
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep, Instant};
use uuid::Uuid;

use crate::engine::{Command, EngineHandle};
use crate::network::frame::{Channel, Frame, FramePayload};

/// Settling delay before the presence bootstrap.
const COLLECT_DELAY: Duration = Duration::from_secs(3);
/// Cadence of liveness probes.
const PING_INTERVAL: Duration = Duration::from_secs(10);
/// How long pong replies are collected after a probe.
const PONG_WINDOW: Duration = Duration::from_secs(6);

struct BrokerPeer {
    server_id: Uuid,
    prefix: String,
    engine: EngineHandle,
    publish: redis::aio::MultiplexedConnection,
}

/// Connect, subscribe and run until the engine drops its publish queue.
///
/// An error return means the broker link is gone; the caller logs it and
/// the room continues single-host with its state intact.
pub async fn run(
    url: &str,
    prefix: String,
    server_id: Uuid,
    engine: EngineHandle,
    mut outbox: mpsc::UnboundedReceiver<FramePayload>,
) -> Result<(), redis::RedisError> {
    let client = redis::Client::open(url)?;
    let publish = client.get_multiplexed_async_connection().await?;
    let mut pubsub = client.get_async_pubsub().await?;
    for channel in Channel::ALL.iter() {
        pubsub.subscribe(channel.with_prefix(&prefix)).await?;
    }
    info!("broker peer {} subscribed with prefix {:?}", server_id, prefix);

    let mut peer = BrokerPeer {
        server_id,
        prefix,
        engine,
        publish,
    };
    let stream = pubsub.on_message();
    tokio::pin!(stream);

    let bootstrap = sleep(COLLECT_DELAY);
    tokio::pin!(bootstrap);
    let mut bootstrapped = false;

    let mut pinger = interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);

    // Liveness window: peers expected to answer the last ping and those
    // that already did.
    let mut expected: HashSet<Uuid> = HashSet::new();
    let mut heard: HashSet<Uuid> = HashSet::new();
    let window = sleep(Duration::ZERO);
    tokio::pin!(window);
    let mut window_open = false;

    loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(msg) => peer.handle_message(msg, &mut heard, window_open).await,
                None => {
                    warn!("broker subscription closed");
                    break;
                }
            },
            payload = outbox.recv() => match payload {
                Some(payload) => peer.publish_frame(&payload).await,
                None => break,
            },
            () = &mut bootstrap, if !bootstrapped => {
                bootstrapped = true;
                debug!("presence bootstrap: demanding client lists");
                peer.publish_frame(&FramePayload::Collect).await;
            },
            _ = pinger.tick() => {
                let remotes = peer.engine.remote_server_ids().await;
                if !remotes.is_empty() {
                    expected = remotes.into_iter().collect();
                    heard.clear();
                    window.as_mut().reset(Instant::now() + PONG_WINDOW);
                    window_open = true;
                    peer.publish_frame(&FramePayload::Ping).await;
                }
            },
            () = &mut window, if window_open => {
                window_open = false;
                let dead = dead_peers(&expected, &heard);
                if !dead.is_empty() {
                    peer.engine.send(Command::PruneServers(dead));
                }
            },
        }
    }
    Ok(())
}

impl BrokerPeer {
    async fn handle_message(
        &mut self,
        msg: redis::Msg,
        heard: &mut HashSet<Uuid>,
        window_open: bool,
    ) {
        let channel = match Channel::from_name(&self.prefix, msg.get_channel_name()) {
            Some(channel) => channel,
            None => return,
        };
        let raw: String = match msg.get_payload() {
            Ok(raw) => raw,
            Err(e) => {
                debug!("dropping unreadable frame on {}: {}", channel.as_str(), e);
                return;
            }
        };
        let frame = match Frame::decode(channel, &raw) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("dropping malformed frame on {}: {}", channel.as_str(), e);
                return;
            }
        };
        if frame.origin == self.server_id {
            return;
        }
        match frame.payload {
            FramePayload::Collect => {
                let clients = self.engine.local_clients().await;
                self.publish_frame(&FramePayload::Provide { clients }).await;
            }
            FramePayload::Ping => {
                self.publish_frame(&FramePayload::Pong).await;
            }
            FramePayload::Pong => {
                if window_open {
                    heard.insert(frame.origin);
                }
            }
            payload => {
                self.engine.send(Command::Remote {
                    origin: frame.origin,
                    payload,
                });
            }
        }
    }

    async fn publish_frame(&mut self, payload: &FramePayload) {
        let raw = match Frame::encode(self.server_id, payload) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("cannot encode {} frame: {}", payload.channel().as_str(), e);
                return;
            }
        };
        let channel = payload.channel().with_prefix(&self.prefix);
        if let Err(e) = self.publish.publish::<_, _, i64>(&channel, raw).await {
            warn!("publish on {} failed: {}", channel, e);
        }
    }
}

/// Remote servers that were expected to answer the last ping but did not.
fn dead_peers(expected: &HashSet<Uuid>, heard: &HashSet<Uuid>) -> Vec<Uuid> {
    let mut dead: Vec<Uuid> = expected.difference(heard).copied().collect();
    dead.sort();
    dead
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dead_peers_is_the_unanswered_set() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        let expected: HashSet<Uuid> = [a, b, c].iter().copied().collect();
        let heard: HashSet<Uuid> = [b].iter().copied().collect();

        let dead = dead_peers(&expected, &heard);
        assert_eq!(2, dead.len());
        assert!(dead.contains(&a) && dead.contains(&c));

        // A pong from an unknown server never produces a prune entry.
        let stray: HashSet<Uuid> = [Uuid::new_v4()].iter().copied().collect();
        assert_eq!(dead_peers(&stray, &stray), Vec::<Uuid>::new());

        // Everyone answered.
        assert!(dead_peers(&expected, &expected).is_empty());
    }
}
