//! Framing of the WebSocket protocol.
//!
//! Every frame is a JSON object. Clients send
//! `{ eventName, data, exchangeId }`, where `data` is itself a JSON document
//! encoded as a string. A frame with an `exchangeId` is a request and gets
//! exactly one `<Event>_Success` or `<Event>_Error` reply; a frame without one
//! is a notification and never gets a reply. The server additionally pushes
//! unsolicited frames with a null `exchangeId`.

use crate::validation::{self, ValidationError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tilerace_db::TileCoords;
use tokio::sync::mpsc;

/// Sending half of a connection's outbound queue.
pub type Outbound = mpsc::UnboundedSender<ServerFrame>;

/// An inbound frame exactly as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ClientFrame {
    pub event_name: String,
    pub data: Option<String>,
    pub exchange_id: Option<String>,
}

/// Fatal framing errors. The connection is closed without a reply.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame does not match the frame schema: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("binary frame is not valid UTF-8")]
    NotUtf8,
}

impl ClientFrame {
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn parse_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        let text = std::str::from_utf8(bytes).map_err(|_| FrameError::NotUtf8)?;
        Self::parse(text)
    }

    /// Split the frame into its payload and the kind of operation it asks for.
    pub fn into_inbound(self, outbound: &Outbound) -> Inbound {
        let operation = match self.exchange_id {
            Some(id) => Operation::Request(Exchange {
                id,
                event_name: self.event_name.clone(),
                outbound: outbound.clone(),
                completed: false,
            }),
            None => Operation::Notification,
        };

        Inbound {
            event_name: self.event_name,
            data: self.data,
            operation,
        }
    }
}

/// A frame sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerFrame {
    pub event_name: String,
    pub data: Option<String>,
    pub error: Option<String>,
    pub exchange_id: Option<String>,
}

impl ServerFrame {
    /// An unsolicited frame.
    pub fn push<T: Serialize + ?Sized>(event_name: &str, data: &T) -> Self {
        Self {
            event_name: event_name.to_string(),
            data: encode(event_name, data),
            error: None,
            exchange_id: None,
        }
    }

    fn success<T: Serialize + ?Sized>(event_name: &str, exchange_id: &str, data: &T) -> Self {
        Self {
            event_name: format!("{event_name}_Success"),
            data: encode(event_name, data),
            error: None,
            exchange_id: Some(exchange_id.to_string()),
        }
    }

    fn failure(event_name: &str, exchange_id: &str, message: &str) -> Self {
        Self {
            event_name: format!("{event_name}_Error"),
            data: None,
            error: Some(message.to_string()),
            exchange_id: Some(exchange_id.to_string()),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

fn encode<T: Serialize + ?Sized>(event_name: &str, data: &T) -> Option<String> {
    match serde_json::to_string(data) {
        Ok(json) => Some(json),
        Err(err) => {
            tracing::error!(event = event_name, ?err, "Failed to encode frame data");
            None
        }
    }
}

/// What a frame asks the server to do, decided once at the dispatch boundary.
pub enum Operation {
    /// The client waits for exactly one reply.
    Request(Exchange),
    /// Fire-and-forget; failures are only logged.
    Notification,
}

pub struct Inbound {
    pub event_name: String,
    pub data: Option<String>,
    pub operation: Operation,
}

/// A pending request. At most one reply is ever sent for it.
#[derive(Debug)]
pub struct Exchange {
    id: String,
    event_name: String,
    outbound: Outbound,
    completed: bool,
}

impl Exchange {
    /// Send the success reply. Returns false if nothing was sent.
    pub fn resolve<T: Serialize + ?Sized>(&mut self, data: &T) -> bool {
        let frame = ServerFrame::success(&self.event_name, &self.id, data);
        self.complete(frame)
    }

    /// Send the error reply. Returns false if nothing was sent.
    pub fn reject(&mut self, message: &str) -> bool {
        let frame = ServerFrame::failure(&self.event_name, &self.id, message);
        self.complete(frame)
    }

    fn complete(&mut self, frame: ServerFrame) -> bool {
        if self.completed {
            tracing::error!(
                event = %self.event_name,
                exchange_id = %self.id,
                "Attempted to resolve an already resolved exchange"
            );
            return false;
        }

        self.completed = true;
        self.outbound.send(frame).is_ok()
    }
}

/// Per-event payload errors. Reported back when the frame was a request.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error("Malformed event data")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackUpload {
    pub name: String,
    pub tile_coords: TileCoords,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackEdit {
    pub id: String,
    pub name: String,
    pub tile_coords: TileCoords,
}

/// Character telemetry as reported by a racer. Missing or null numbers are
/// read as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CharacterMotion {
    #[serde(deserialize_with = "number_or_zero")]
    pub x: f64,
    #[serde(deserialize_with = "number_or_zero")]
    pub y: f64,
    #[serde(deserialize_with = "number_or_zero")]
    pub vx: f64,
    #[serde(deserialize_with = "number_or_zero")]
    pub vy: f64,
    /// Horizontal input intent
    #[serde(deserialize_with = "number_or_zero")]
    pub ih: f64,
    /// Vertical input intent
    #[serde(deserialize_with = "number_or_zero")]
    pub iv: f64,
}

impl CharacterMotion {
    /// Input intents are limited to [-1, 1].
    pub fn sanitized(self) -> Self {
        Self {
            ih: self.ih.clamp(-1.0, 1.0),
            iv: self.iv.clamp(-1.0, 1.0),
            ..self
        }
    }
}

fn number_or_zero<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    let value = Option::<f64>::deserialize(deserializer)?.unwrap_or(0.0);
    Ok(if value.is_finite() { value } else { 0.0 })
}

/// Every event a client may send, with its decoded payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Track { track_id: String },
    TrackCreate(TrackUpload),
    TrackUpdate(TrackEdit),
    TrackDelete { track_id: String },
    PlayTrack { track_id: String },
    RaceQueueEnter { track_id: String },
    RaceQueueLeave,
    RaceQueueReady,
    RaceCharacterUpdate(CharacterMotion),
    RaceCharacterFinish,
}

impl ClientEvent {
    /// Decode the payload of a frame. Unknown event names yield `Ok(None)`.
    pub fn decode(event_name: &str, data: Option<&str>) -> Result<Option<Self>, PayloadError> {
        let event = match event_name {
            "Track" => Self::Track {
                track_id: track_id(data)?,
            },
            "Track_Create" => {
                let upload: TrackUpload = payload(data)?;
                validation::validate_track_name(&upload.name)?;
                validation::validate_tile_coords(&upload.tile_coords)?;
                Self::TrackCreate(upload)
            }
            "Track_Update" => {
                let edit: TrackEdit = payload(data)?;
                validation::validate_track_id(&edit.id)?;
                validation::validate_track_name(&edit.name)?;
                validation::validate_tile_coords(&edit.tile_coords)?;
                Self::TrackUpdate(edit)
            }
            "Track_Delete" => Self::TrackDelete {
                track_id: track_id(data)?,
            },
            "Play_Track" => Self::PlayTrack {
                track_id: track_id(data)?,
            },
            "Race_Queue_Enter" => Self::RaceQueueEnter {
                track_id: track_id(data)?,
            },
            "Race_Queue_Leave" => Self::RaceQueueLeave,
            "Race_Queue_Ready" => Self::RaceQueueReady,
            "Race_Character_Update" => {
                let motion: Option<CharacterMotion> = payload(data)?;
                Self::RaceCharacterUpdate(motion.unwrap_or_default().sanitized())
            }
            "Race_Character_Finish" => Self::RaceCharacterFinish,
            _ => return Ok(None),
        };

        Ok(Some(event))
    }

    /// Leaving and readying up in a lobby are never answered, even when the
    /// frame carries an exchange id.
    pub fn expects_reply(&self) -> bool {
        !matches!(self, Self::RaceQueueLeave | Self::RaceQueueReady)
    }
}

fn payload<T: DeserializeOwned>(data: Option<&str>) -> Result<T, PayloadError> {
    Ok(serde_json::from_str(data.unwrap_or("null"))?)
}

/// A track id is sent as a bare JSON string.
fn track_id(data: Option<&str>) -> Result<String, PayloadError> {
    let value: serde_json::Value = payload(data)?;
    match value {
        serde_json::Value::String(id) => {
            validation::validate_track_id(&id)?;
            Ok(id)
        }
        _ => Err(ValidationError::TrackIdInvalid.into()),
    }
}
