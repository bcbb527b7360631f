//! Frames exchanged between servers of one room over the pub/sub broker.
//!
//! Every frame is a JSON object carrying at least `{"server": {"id": ...}}`
//! so receivers can drop their own loopback traffic. The channel a frame
//! arrives on, not the payload, decides its meaning; channel names are
//! prefixed with the configured room key.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::network::message::{ChatPayload, PaintPayload, PointerPayload, StrokePayload};
use crate::roster::{Client, DistClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Collect,
    Provide,
    Ping,
    Pong,
    System,
    Chat,
    Paint,
    Stroke,
    Pointer,
}

impl Channel {
    pub const ALL: [Channel; 9] = [
        Channel::Collect,
        Channel::Provide,
        Channel::Ping,
        Channel::Pong,
        Channel::System,
        Channel::Chat,
        Channel::Paint,
        Channel::Stroke,
        Channel::Pointer,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Collect => "collect",
            Channel::Provide => "provide",
            Channel::Ping => "ping",
            Channel::Pong => "pong",
            Channel::System => "system",
            Channel::Chat => "chat",
            Channel::Paint => "paint",
            Channel::Stroke => "stroke",
            Channel::Pointer => "pointer",
        }
    }

    pub fn with_prefix(self, prefix: &str) -> String {
        format!("{}{}", prefix, self.as_str())
    }

    /// Resolve a subscribed channel name back to its kind.
    pub fn from_name(prefix: &str, name: &str) -> Option<Channel> {
        let suffix = name.strip_prefix(prefix)?;
        Channel::ALL.iter().copied().find(|c| c.as_str() == suffix)
    }
}

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("malformed frame")]
    Json(#[from] serde_json::Error),
    #[error("frame is missing its {0}")]
    Missing(&'static str),
    #[error("unexpected collect target")]
    BadTarget,
}

/// A decoded inter-server frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Server that published the frame.
    pub origin: Uuid,
    pub payload: FramePayload,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FramePayload {
    /// Demand: every peer replies with a `Provide`.
    Collect,
    /// The sender's authoritative list of locally hosted clients.
    Provide { clients: Vec<Client> },
    Ping,
    Pong,
    /// Server-generated chat to broadcast globally.
    System { body: String },
    Chat { client: DistClient, body: ChatPayload },
    Paint { client: DistClient, body: PaintPayload },
    Stroke { client: DistClient, body: StrokePayload },
    Pointer { client: DistClient, body: PointerPayload },
}

impl FramePayload {
    pub fn channel(&self) -> Channel {
        match self {
            FramePayload::Collect => Channel::Collect,
            FramePayload::Provide { .. } => Channel::Provide,
            FramePayload::Ping => Channel::Ping,
            FramePayload::Pong => Channel::Pong,
            FramePayload::System { .. } => Channel::System,
            FramePayload::Chat { .. } => Channel::Chat,
            FramePayload::Paint { .. } => Channel::Paint,
            FramePayload::Stroke { .. } => Channel::Stroke,
            FramePayload::Pointer { .. } => Channel::Pointer,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ServerRef {
    id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFrame {
    server: ServerRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    client: Option<DistClient>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    body: Option<Value>,
}

impl Frame {
    /// Serialize a payload for publishing from `origin`.
    pub fn encode(origin: Uuid, payload: &FramePayload) -> Result<String, FrameError> {
        let mut wire = WireFrame {
            server: ServerRef { id: origin },
            target: None,
            client: None,
            body: None,
        };
        match payload {
            FramePayload::Collect => {
                wire.target = Some("clients".to_string());
            }
            FramePayload::Provide { clients } => {
                wire.target = Some("clients".to_string());
                wire.body = Some(serde_json::to_value(clients)?);
            }
            FramePayload::Ping | FramePayload::Pong => {}
            FramePayload::System { body } => {
                wire.body = Some(Value::String(body.clone()));
            }
            FramePayload::Chat { client, body } => {
                wire.client = Some(client.clone());
                wire.body = Some(serde_json::to_value(body)?);
            }
            FramePayload::Paint { client, body } => {
                wire.client = Some(client.clone());
                wire.body = Some(serde_json::to_value(body)?);
            }
            FramePayload::Stroke { client, body } => {
                wire.client = Some(client.clone());
                wire.body = Some(serde_json::to_value(body)?);
            }
            FramePayload::Pointer { client, body } => {
                wire.client = Some(client.clone());
                wire.body = Some(serde_json::to_value(body)?);
            }
        }
        Ok(serde_json::to_string(&wire)?)
    }

    /// Parse a frame received on `channel`.
    pub fn decode(channel: Channel, raw: &str) -> Result<Frame, FrameError> {
        let wire: WireFrame = serde_json::from_str(raw)?;
        let origin = wire.server.id;
        let payload = match channel {
            Channel::Collect => {
                check_target(&wire)?;
                FramePayload::Collect
            }
            Channel::Provide => {
                check_target(&wire)?;
                let body = wire.body.ok_or(FrameError::Missing("body"))?;
                FramePayload::Provide {
                    clients: serde_json::from_value(body)?,
                }
            }
            Channel::Ping => FramePayload::Ping,
            Channel::Pong => FramePayload::Pong,
            Channel::System => {
                let body = wire.body.ok_or(FrameError::Missing("body"))?;
                FramePayload::System {
                    body: serde_json::from_value(body)?,
                }
            }
            Channel::Chat => FramePayload::Chat {
                client: wire.client.ok_or(FrameError::Missing("client"))?,
                body: decode_body(wire.body)?,
            },
            Channel::Paint => FramePayload::Paint {
                client: wire.client.ok_or(FrameError::Missing("client"))?,
                body: decode_body(wire.body)?,
            },
            Channel::Stroke => FramePayload::Stroke {
                client: wire.client.ok_or(FrameError::Missing("client"))?,
                body: decode_body(wire.body)?,
            },
            Channel::Pointer => FramePayload::Pointer {
                client: wire.client.ok_or(FrameError::Missing("client"))?,
                body: decode_body(wire.body)?,
            },
        };
        Ok(Frame { origin, payload })
    }
}

fn check_target(wire: &WireFrame) -> Result<(), FrameError> {
    match wire.target.as_deref() {
        Some("clients") => Ok(()),
        _ => Err(FrameError::BadTarget),
    }
}

fn decode_body<T: serde::de::DeserializeOwned>(body: Option<Value>) -> Result<T, FrameError> {
    let body = body.ok_or(FrameError::Missing("body"))?;
    Ok(serde_json::from_value(body)?)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::network::message::PaintMode;

    fn origin() -> Uuid {
        Uuid::parse_str("11111111-2222-4333-8444-555555555555").unwrap()
    }

    fn dist() -> DistClient {
        DistClient {
            uuid: Uuid::nil(),
            name: "a".to_string(),
            server_id: origin(),
        }
    }

    #[test]
    fn roundtrip_every_channel() {
        let payloads = vec![
            FramePayload::Collect,
            FramePayload::Provide {
                clients: vec![Client {
                    uuid: Uuid::nil(),
                    pin: "00001111".to_string(),
                    name: "a".to_string(),
                    remote_addr: "127.0.0.1".to_string(),
                    is_online: true,
                    server_id: origin(),
                }],
            },
            FramePayload::Ping,
            FramePayload::Pong,
            FramePayload::System {
                body: "! a has left.".to_string(),
            },
            FramePayload::Chat {
                client: dist(),
                body: ChatPayload {
                    message: "hi".to_string(),
                    time: 1000,
                },
            },
            FramePayload::Paint {
                client: dist(),
                body: PaintPayload {
                    layer_number: 0,
                    mode: PaintMode::Normal,
                    x: 1,
                    y: 2,
                    data: "AAAA".to_string(),
                },
            },
            FramePayload::Stroke {
                client: dist(),
                body: StrokePayload {
                    points: vec![crate::network::message::StrokePoint(1, 2, 3)],
                },
            },
            FramePayload::Pointer {
                client: dist(),
                body: PointerPayload { x: -1, y: 4 },
            },
        ];
        for payload in payloads {
            let raw = Frame::encode(origin(), &payload).unwrap();
            let frame = Frame::decode(payload.channel(), &raw).unwrap();
            assert_eq!(origin(), frame.origin);
            assert_eq!(payload, frame.payload, "channel {:?}", payload.channel());
        }
    }

    #[test]
    fn every_frame_names_its_origin() {
        let raw = Frame::encode(origin(), &FramePayload::Ping).unwrap();
        let value: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(
            "11111111-2222-4333-8444-555555555555",
            value["server"]["id"]
        );
    }

    #[test]
    fn decode_bad() {
        let cases = [
            (Channel::Ping, "{}", "no server field"),
            (Channel::Provide, r#"{"server":{"id":"11111111-2222-4333-8444-555555555555"}}"#, "provide without body"),
            (Channel::Collect, r#"{"server":{"id":"11111111-2222-4333-8444-555555555555"},"target":"layers"}"#, "wrong collect target"),
            (Channel::Chat, r#"{"server":{"id":"11111111-2222-4333-8444-555555555555"},"body":{"message":"hi","time":1}}"#, "chat without client"),
        ];
        for (channel, raw, description) in cases.iter() {
            assert!(Frame::decode(*channel, raw).is_err(), "{}", description);
        }
    }

    #[test]
    fn channel_names() {
        assert_eq!("reichat:paint", Channel::Paint.with_prefix("reichat:"));
        assert_eq!(
            Some(Channel::Paint),
            Channel::from_name("reichat:", "reichat:paint")
        );
        assert_eq!(None, Channel::from_name("reichat:", "other:paint"));
        assert_eq!(None, Channel::from_name("reichat:", "reichat:nonsense"));
    }
}
