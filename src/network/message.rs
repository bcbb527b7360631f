//! Socket events exchanged with end-user clients.
//!
//! All events are JSON objects tagged by a `type` field. Inbound events are
//! deserialized into the loose `*Request` shapes and then validated into
//! the payload types the engine works with; a frame that fails either step
//! is dropped silently and must have zero side effects.
//!
//! # Validation rules
//!
//! | event   | rule |
//! |---------|------|
//! | client  | `uuid` length 36 if present; name 1..=16 chars |
//! | paint   | `0 <= layerNumber < layerCount`; `x`, `y` finite non-negative (floored); `mode` in {normal, erase}; `data` a well-formed base64 snapshot blob |
//! | stroke  | points are `[x, y, pressure]` triples, `x, y >= 0`, `pressure > 0`, `x <= width`, `y <= height`; `x, y` rounded, pressure floored; extra elements dropped |
//! | pointer | `x`, `y` finite, floored, within `-1..=width` / `-1..=height` (`-1` means off-canvas) |
//! | chat    | message non-empty, non-whitespace, at most 256 chars |

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::codec::{self, CodecError, Decoded};
use crate::config::{Config, DistConfig};
use crate::roster::DistClient;

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("uuid must be 36 characters")]
    BadUuid,
    #[error("name must be 1-16 characters")]
    BadName,
    #[error("layer number out of range")]
    BadLayer,
    #[error("coordinates out of range")]
    BadCoordinates,
    #[error("malformed stroke point")]
    BadStrokePoint,
    #[error("empty or oversized chat message")]
    BadChatMessage,
    #[error("patch is not valid base64")]
    BadPatchEncoding(#[from] base64::DecodeError),
    #[error("patch is not a valid snapshot")]
    BadPatch(#[from] CodecError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaintMode {
    Normal,
    Erase,
}

/// Validated paint payload; `data` stays base64 on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaintPayload {
    pub layer_number: usize,
    pub mode: PaintMode,
    pub x: u32,
    pub y: u32,
    pub data: String,
}

/// An `[x, y, pressure]` triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrokePoint(pub u32, pub u32, pub u32);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrokePayload {
    pub points: Vec<StrokePoint>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointerPayload {
    pub x: i32,
    pub y: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatPayload {
    pub message: String,
    /// Milliseconds since the epoch.
    pub time: i64,
}

/// A paint event that passed validation: the wire payload plus its decoded
/// patch raster.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidPaint {
    pub payload: PaintPayload,
    pub patch: Decoded,
}

/// Events received from a client socket.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientEvent {
    Client(BindRequest),
    Paint(PaintRequest),
    Stroke(StrokeRequest),
    Pointer(PointerRequest),
    Chat(ChatRequest),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BindRequest {
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub pin: Option<String>,
    pub name: String,
}

impl BindRequest {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(uuid) = &self.uuid {
            if uuid.len() != 36 {
                return Err(ValidationError::BadUuid);
            }
        }
        let len = self.name.chars().count();
        if len < 1 || len > 16 {
            return Err(ValidationError::BadName);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaintRequest {
    pub layer_number: f64,
    pub mode: PaintMode,
    pub x: f64,
    pub y: f64,
    pub data: String,
}

impl PaintRequest {
    pub fn validate(self, config: &Config) -> Result<ValidPaint, ValidationError> {
        if !self.layer_number.is_finite()
            || self.layer_number < 0.0
            || self.layer_number.fract() != 0.0
            || self.layer_number >= config.layer_count as f64
        {
            return Err(ValidationError::BadLayer);
        }
        let x = floor_coordinate(self.x)?;
        let y = floor_coordinate(self.y)?;
        let patch = decode_patch(&self.data)?;
        Ok(ValidPaint {
            payload: PaintPayload {
                layer_number: self.layer_number as usize,
                mode: self.mode,
                x,
                y,
                data: self.data,
            },
            patch,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StrokeRequest {
    pub points: Vec<Vec<f64>>,
}

impl StrokeRequest {
    pub fn validate(&self, config: &Config) -> Result<StrokePayload, ValidationError> {
        let mut points = Vec::with_capacity(self.points.len());
        for raw in &self.points {
            if raw.len() < 3 {
                return Err(ValidationError::BadStrokePoint);
            }
            let (x, y, pressure) = (raw[0], raw[1], raw[2]);
            if !x.is_finite() || !y.is_finite() || !pressure.is_finite() {
                return Err(ValidationError::BadStrokePoint);
            }
            if x < 0.0 || y < 0.0 || pressure <= 0.0 {
                return Err(ValidationError::BadStrokePoint);
            }
            if x > config.canvas_width as f64 || y > config.canvas_height as f64 {
                return Err(ValidationError::BadStrokePoint);
            }
            points.push(StrokePoint(
                x.round() as u32,
                y.round() as u32,
                pressure.floor() as u32,
            ));
        }
        Ok(StrokePayload { points })
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PointerRequest {
    pub x: f64,
    pub y: f64,
}

impl PointerRequest {
    pub fn validate(&self, config: &Config) -> Result<PointerPayload, ValidationError> {
        if !self.x.is_finite() || !self.y.is_finite() {
            return Err(ValidationError::BadCoordinates);
        }
        let x = self.x.floor();
        let y = self.y.floor();
        if x < -1.0 || x > config.canvas_width as f64 || y < -1.0 || y > config.canvas_height as f64
        {
            return Err(ValidationError::BadCoordinates);
        }
        Ok(PointerPayload {
            x: x as i32,
            y: y as i32,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub time: Option<i64>,
}

impl ChatRequest {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.message.trim().is_empty() || self.message.chars().count() > 256 {
            return Err(ValidationError::BadChatMessage);
        }
        Ok(())
    }
}

/// Events the server emits to client sockets.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerEvent {
    Server {
        id: Uuid,
    },
    Config(DistConfig),
    Client {
        uuid: Uuid,
        name: String,
        pin: String,
    },
    Clients {
        clients: Vec<DistClient>,
    },
    Chat {
        #[serde(skip_serializing_if = "Option::is_none")]
        client: Option<DistClient>,
        #[serde(flatten)]
        chat: ChatPayload,
    },
    Paint {
        client: DistClient,
        #[serde(flatten)]
        paint: PaintPayload,
    },
    Painted,
    Stroke {
        client: DistClient,
        #[serde(flatten)]
        stroke: StrokePayload,
    },
    Pointer {
        client: DistClient,
        #[serde(flatten)]
        pointer: PointerPayload,
    },
}

impl ServerEvent {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Floor a finite non-negative coordinate into pixel space.
fn floor_coordinate(v: f64) -> Result<u32, ValidationError> {
    if !v.is_finite() || v < 0.0 || v > u32::MAX as f64 {
        return Err(ValidationError::BadCoordinates);
    }
    Ok(v.floor() as u32)
}

/// Encode a patch raster as the base64 `data` field of a paint event.
pub fn encode_patch(width: u32, height: u32, rgba: &[u8]) -> Result<String, CodecError> {
    Ok(BASE64.encode(codec::encode(width, height, rgba)?))
}

/// Decode the base64 `data` field of a paint event back into its raster.
pub fn decode_patch(data: &str) -> Result<Decoded, ValidationError> {
    let raw = BASE64.decode(data.as_bytes())?;
    Ok(codec::decode(&raw)?)
}
