//! JSON request/response envelopes.
//!
//! Requests are `{"name": <command>, "value": <payload>}`; responses reuse
//! the name and carry either `value` or `error`.

use crate::capture::Resolution;
use crate::detection::Detection;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt::Display;

pub const CAMERA_DEVICES_GET: &str = "camera-devices-get";
pub const CAMERA_DEVICE_PLAY: &str = "camera-device-play";
pub const CAMERA_DEVICE_STOP: &str = "camera-device-stop";
pub const DRPAI_MODEL_START: &str = "drpai-model-start";
pub const DRPAI_MODEL_STOP: &str = "drpai-model-stop";
pub const DETECTION_RESULT: &str = "drpai-object-detection-result";

pub const UNKNOWN_REQUEST: &str = "unknown request";

#[derive(Debug, Deserialize)]
struct Envelope {
    name: String,
    #[serde(default)]
    value: Value,
}

#[derive(Debug, Deserialize)]
struct PlayPayload {
    device: String,
    #[serde(default)]
    width: u32,
    #[serde(default)]
    height: u32,
}

#[derive(Debug, Deserialize, Default)]
struct StopPayload {
    #[serde(default)]
    device: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelPayload {
    model: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    ListDevices,
    StartCapture {
        device: String,
        resolution: Resolution,
    },
    StopCapture {
        device: Option<String>,
    },
    LoadModel {
        model: String,
    },
    UnloadModel,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::ListDevices => CAMERA_DEVICES_GET,
            Command::StartCapture { .. } => CAMERA_DEVICE_PLAY,
            Command::StopCapture { .. } => CAMERA_DEVICE_STOP,
            Command::LoadModel { .. } => DRPAI_MODEL_START,
            Command::UnloadModel => DRPAI_MODEL_STOP,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown request: {0}")]
    Malformed(serde_json::Error),
    #[error("unknown request")]
    Unknown { name: String },
    #[error("invalid payload: {reason}")]
    InvalidPayload { name: String, reason: String },
}

impl ProtocolError {
    /// Name to answer with.
    pub fn name(&self) -> &str {
        match self {
            ProtocolError::Malformed(_) => "unknown",
            ProtocolError::Unknown { name } | ProtocolError::InvalidPayload { name, .. } => {
                name.as_str()
            }
        }
    }
}

fn payload<T: DeserializeOwned>(name: &str, value: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(value).map_err(|e| ProtocolError::InvalidPayload {
        name: name.to_string(),
        reason: e.to_string(),
    })
}

pub fn parse_request(bytes: &[u8]) -> Result<Command, ProtocolError> {
    let Envelope { name, value } =
        serde_json::from_slice(bytes).map_err(ProtocolError::Malformed)?;
    match name.as_str() {
        CAMERA_DEVICES_GET => Ok(Command::ListDevices),
        CAMERA_DEVICE_PLAY => {
            let p: PlayPayload = payload(&name, value)?;
            Ok(Command::StartCapture {
                device: p.device,
                resolution: Resolution::new(p.width, p.height),
            })
        }
        CAMERA_DEVICE_STOP => {
            let p: StopPayload = if value.is_null() {
                StopPayload::default()
            } else {
                payload(&name, value)?
            };
            Ok(Command::StopCapture { device: p.device })
        }
        DRPAI_MODEL_START => {
            let p: ModelPayload = payload(&name, value)?;
            Ok(Command::LoadModel { model: p.model })
        }
        DRPAI_MODEL_STOP => Ok(Command::UnloadModel),
        _ => Err(ProtocolError::Unknown { name }),
    }
}

pub fn success<T: Serialize>(name: &str, value: &T) -> Result<String, serde_json::Error> {
    Ok(json!({ "name": name, "value": serde_json::to_value(value)? }).to_string())
}

pub fn failure(name: &str, error: impl Display) -> String {
    json!({ "name": name, "error": error.to_string() }).to_string()
}

pub fn detection_result(detections: &[Detection]) -> Result<String, serde_json::Error> {
    success(DETECTION_RESULT, &detections)
}
