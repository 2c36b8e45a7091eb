//! Wire protocol for the FanTuner IPC endpoint.
//!
//! Defines the request/response/notification schema exchanged over the
//! local socket, plus the length-prefixed frame codec used to carry them.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame size accepted on either side of the connection.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

static REQUEST_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generates a process-unique request id for correlation.
pub fn generate_request_id() -> u64 {
    REQUEST_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
}

fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// Reads one length-prefixed frame: a 4-byte little-endian length followed
/// by that many bytes of UTF-8 JSON. Aborts on a non-positive or
/// over-`MAX_FRAME_LEN` length.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, FrameError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await.map_err(|_| FrameError::ConnectionClosed)?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len == 0 {
        return Err(FrameError::InvalidLength(len));
    }
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(|_| FrameError::ConnectionClosed)?;
    Ok(payload)
}

/// Writes one length-prefixed frame. Rejects payloads over `MAX_FRAME_LEN`
/// rather than truncating or splitting them.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(payload.len()));
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_le_bytes()).await.map_err(|_| FrameError::ConnectionClosed)?;
    writer.write_all(payload).await.map_err(|_| FrameError::ConnectionClosed)?;
    writer.flush().await.map_err(|_| FrameError::ConnectionClosed)?;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame length {0} is not positive")]
    InvalidLength(usize),
    #[error("frame length {0} exceeds the {MAX_FRAME_LEN} byte limit")]
    TooLarge(usize),
    #[error("connection closed mid-frame")]
    ConnectionClosed,
}

/// Client-to-server envelope: every request carries a client-generated id
/// used to correlate its response, plus a send timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: u64,
    pub timestamp_ms: u64,
    #[serde(flatten)]
    pub request: Request,
}

impl RequestEnvelope {
    pub fn new(request: Request) -> Self {
        Self { id: generate_request_id(), timestamp_ms: now_ms(), request }
    }

    pub fn with_id(id: u64, request: Request) -> Self {
        Self { id, timestamp_ms: now_ms(), request }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "data")]
pub enum Request {
    GetStatus,
    GetSensors,
    GetFans,
    GetConfig,
    SetConfig { config: ConfigDto },
    SetFanSpeed { fan_key: String, percent: f32 },
    SetProfile { profile_id: String },
    SubscribeSensors { interval_ms: u64 },
    UnsubscribeSensors,
}

impl Request {
    pub fn type_name(&self) -> &'static str {
        match self {
            Request::GetStatus => "GetStatus",
            Request::GetSensors => "GetSensors",
            Request::GetFans => "GetFans",
            Request::GetConfig => "GetConfig",
            Request::SetConfig { .. } => "SetConfig",
            Request::SetFanSpeed { .. } => "SetFanSpeed",
            Request::SetProfile { .. } => "SetProfile",
            Request::SubscribeSensors { .. } => "SubscribeSensors",
            Request::UnsubscribeSensors => "UnsubscribeSensors",
        }
    }

    /// Validates request parameters before they are acted on by the server.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Request::GetStatus
            | Request::GetSensors
            | Request::GetFans
            | Request::GetConfig
            | Request::UnsubscribeSensors => Ok(()),
            Request::SetConfig { .. } => Ok(()),
            Request::SetFanSpeed { fan_key, percent } => {
                if fan_key.is_empty() {
                    return Err("fan_key cannot be empty".to_string());
                }
                if !(0.0..=100.0).contains(percent) {
                    return Err(format!("percent {percent} out of range [0, 100]"));
                }
                Ok(())
            }
            Request::SetProfile { profile_id } => {
                if profile_id.is_empty() {
                    return Err("profile_id cannot be empty".to_string());
                }
                Ok(())
            }
            Request::SubscribeSensors { interval_ms } => {
                if !(100..=60_000).contains(interval_ms) {
                    return Err(format!("interval_ms {interval_ms} out of range [100, 60000]"));
                }
                Ok(())
            }
        }
    }
}

/// Server-to-client envelope for request responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: u64,
    pub timestamp_ms: u64,
    #[serde(flatten)]
    pub response: Response,
}

impl ResponseEnvelope {
    pub fn new(id: u64, response: Response) -> Self {
        Self { id, timestamp_ms: now_ms(), response }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum Response {
    #[serde(rename = "status")]
    Status(StatusDto),
    #[serde(rename = "sensors")]
    Sensors(SensorsDto),
    #[serde(rename = "fans")]
    Fans(FansDto),
    #[serde(rename = "config")]
    Config(ConfigDto),
    #[serde(rename = "ack")]
    Ack { ok: bool, message: Option<String>, original_request_id: u64 },
    #[serde(rename = "error")]
    Error { message: String, original_request_id: u64 },
}

impl Response {
    pub fn ack(original_request_id: u64) -> Self {
        Response::Ack { ok: true, message: None, original_request_id }
    }

    pub fn ack_failed(original_request_id: u64, message: impl Into<String>) -> Self {
        Response::Ack { ok: false, message: Some(message.into()), original_request_id }
    }

    pub fn error(original_request_id: u64, message: impl Into<String>) -> Self {
        Response::Error { message: message.into(), original_request_id }
    }
}

/// Unsolicited server-to-client push, not correlated to any request id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: u64,
    pub timestamp_ms: u64,
    #[serde(flatten)]
    pub payload: NotificationPayload,
}

impl Notification {
    pub fn new(payload: NotificationPayload) -> Self {
        Self { id: generate_request_id(), timestamp_ms: now_ms(), payload }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum NotificationPayload {
    SensorUpdate { sensors: Vec<SensorReadingDto>, fans: Vec<FanDeviceDto>, emergency: bool },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusDto {
    pub running: bool,
    pub version: String,
    pub uptime_seconds: u64,
    pub emergency_active: bool,
    pub emergency_reason: Option<String>,
    pub active_profile_id: String,
    pub active_profile_name: String,
    pub warnings: Vec<String>,
    pub connected_clients: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorsDto {
    pub sensors: Vec<SensorReadingDto>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FansDto {
    pub fans: Vec<FanDeviceDto>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorReadingDto {
    pub key: String,
    pub display_name: String,
    pub hardware_name: String,
    pub hardware_kind: String,
    pub value: f32,
    pub unit: String,
    pub timestamp_ms: u64,
    pub is_stale: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FanDeviceDto {
    pub key: String,
    pub display_name: String,
    pub hardware_name: String,
    pub capability: String,
    pub current_rpm: u32,
    pub current_duty_percent: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurvePointDto {
    pub temperature: f32,
    pub fan_percent: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FanCurveDto {
    pub id: String,
    pub name: String,
    pub source_sensor_key: Option<String>,
    pub points: Vec<CurvePointDto>,
    pub min_percent: f32,
    pub max_percent: f32,
    pub hysteresis: f32,
    pub response_time_seconds: f32,
    pub interpolation: String,
    pub dead_band_percent: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FanAssignmentDto {
    pub fan_key: String,
    pub mode: String,
    pub manual_percent: Option<f32>,
    pub curve_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FanProfileDto {
    pub id: String,
    pub name: String,
    pub is_default: bool,
    pub assignments: std::collections::HashMap<String, FanAssignmentDto>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigDto {
    pub poll_interval_ms: u64,
    pub emergency_cpu_celsius: f32,
    pub emergency_gpu_celsius: f32,
    pub emergency_hysteresis_celsius: f32,
    pub default_min_fan_percent: f32,
    pub max_consecutive_failures: u32,
    pub active_profile_id: String,
    pub curves: std::collections::HashMap<String, FanCurveDto>,
    pub profiles: std::collections::HashMap<String, FanProfileDto>,
    pub telemetry_enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_envelope_round_trips_through_json() {
        let envelope = RequestEnvelope::new(Request::SetFanSpeed { fan_key: "hw0:fan1:0".to_string(), percent: 42.0 });
        let json = serde_json::to_vec(&envelope).unwrap();
        let decoded: RequestEnvelope = serde_json::from_slice(&json).unwrap();
        assert_eq!(decoded.id, envelope.id);
        assert_eq!(decoded.request.type_name(), "SetFanSpeed");
    }

    #[test]
    fn set_fan_speed_rejects_out_of_range_percent() {
        let req = Request::SetFanSpeed { fan_key: "fan0".to_string(), percent: 250.0 };
        assert!(req.validate().is_err());
    }

    #[test]
    fn subscribe_sensors_rejects_too_small_interval() {
        let req = Request::SubscribeSensors { interval_ms: 10 };
        assert!(req.validate().is_err());
    }

    #[test]
    fn unknown_tag_fails_to_deserialize_as_error() {
        let raw = br#"{"id":1,"timestamp_ms":0,"cmd":"NotARealCommand"}"#;
        let result: Result<RequestEnvelope, _> = serde_json::from_slice(raw);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn frame_round_trips() {
        let envelope = ResponseEnvelope::new(1, Response::ack(1));
        let payload = serde_json::to_vec(&envelope).unwrap();

        let mut buf = Vec::new();
        write_frame(&mut buf, &payload).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let decoded_payload = read_frame(&mut cursor).await.unwrap();
        let decoded: ResponseEnvelope = serde_json::from_slice(&decoded_payload).unwrap();
        assert_eq!(decoded.id, 1);
    }

    #[tokio::test]
    async fn frame_over_max_length_is_rejected() {
        let mut buf = Vec::new();
        let oversized = ((MAX_FRAME_LEN + 1) as u32).to_le_bytes();
        buf.extend_from_slice(&oversized);
        let mut cursor = std::io::Cursor::new(buf);
        let result = read_frame(&mut cursor).await;
        assert!(matches!(result, Err(FrameError::TooLarge(_))));
    }

    #[tokio::test]
    async fn zero_length_frame_is_rejected() {
        let mut cursor = std::io::Cursor::new(0u32.to_le_bytes().to_vec());
        let result = read_frame(&mut cursor).await;
        assert!(matches!(result, Err(FrameError::InvalidLength(_))));
    }
}
