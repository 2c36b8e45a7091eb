//! IPC Endpoint: the server side of the length-prefixed local message
//! channel. Accepts connections on a Unix domain socket, serves
//! `Request`/`Response` pairs, and broadcasts `SensorUpdate` notifications
//! to subscribed connections.

use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use fantuner_core::FanControlCapability;
use fantuner_error::{FanTunerError, Result};
use fantuner_protocol::{
    read_frame, write_frame, FansDto, FrameError, Notification, Request, RequestEnvelope, Response, ResponseEnvelope,
    SensorsDto, StatusDto,
};

use crate::cancellation::CancellationToken;
use crate::control_loop::SharedState;
use crate::dto::{config_from_dto, config_to_dto, fan_to_dto, sensor_to_dto};

/// Owner-only: the daemon runs privileged and this is the only principal
/// that should reach it.
const SOCKET_MODE: u32 = 0o600;

/// Acceptor pool size.
const ACCEPTOR_TASKS: usize = 4;

/// Rejects further connections beyond this count.
const MAX_CLIENTS: usize = 64;

struct PeerCredentials {
    uid: u32,
    pid: i32,
}

fn get_peer_credentials(stream: &UnixStream) -> Option<PeerCredentials> {
    let fd = stream.as_raw_fd();
    let mut cred = libc::ucred { pid: 0, uid: 0, gid: 0 };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
    // SAFETY: fd is a valid, open socket for the lifetime of this call; cred and len
    // are correctly sized for SO_PEERCRED per getsockopt(2).
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut cred as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return None;
    }
    Some(PeerCredentials { uid: cred.uid, pid: cred.pid })
}

/// Runs the IPC endpoint until `cancel` fires. Returns once the listener
/// and every connection task have stopped.
pub async fn run(socket_path: &str, state: Arc<SharedState>, cancel: Arc<CancellationToken>) -> Result<()> {
    let path = Path::new(socket_path);
    if path.exists() {
        let metadata = std::fs::symlink_metadata(path)?;
        if metadata.file_type().is_symlink() {
            return Err(FanTunerError::generic("socket path is a symlink - refusing for security"));
        }
        std::fs::remove_file(path)?;
    }

    let listener = Arc::new(UnixListener::bind(path)?);
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(SOCKET_MODE))?;
    info!("listening on {socket_path} (mode {SOCKET_MODE:o})");

    let mut acceptors = Vec::with_capacity(ACCEPTOR_TASKS);
    for _ in 0..ACCEPTOR_TASKS {
        let listener = listener.clone();
        let state = state.clone();
        let cancel = cancel.clone();
        acceptors.push(tokio::spawn(async move { accept_loop(listener, state, cancel).await }));
    }

    cancel.cancelled().await;
    info!("stopping IPC endpoint");
    for task in acceptors {
        let _ = task.await;
    }

    let _ = std::fs::remove_file(path);
    Ok(())
}

async fn accept_loop(listener: Arc<UnixListener>, state: Arc<SharedState>, cancel: Arc<CancellationToken>) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        if state.connected_clients.load(Ordering::SeqCst) >= MAX_CLIENTS {
                            warn!("max clients ({MAX_CLIENTS}) reached, rejecting connection");
                            drop(stream);
                            continue;
                        }
                        state.connected_clients.fetch_add(1, Ordering::SeqCst);
                        let state = state.clone();
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, state.clone(), cancel).await;
                            state.connected_clients.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                    Err(e) => error!("accept error: {e}"),
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
}

async fn handle_connection(stream: UnixStream, state: Arc<SharedState>, cancel: Arc<CancellationToken>) {
    if let Some(cred) = get_peer_credentials(&stream) {
        debug!("accepted connection from uid={} pid={}", cred.uid, cred.pid);
    }

    let (mut read_half, write_half) = stream.into_split();
    let writer = Arc::new(Mutex::new(write_half));
    let subscribed = Arc::new(AtomicBool::new(false));
    let mut telemetry_rx = state.telemetry_tx.subscribe();

    loop {
        tokio::select! {
            frame = read_frame(&mut read_half) => {
                match frame {
                    Ok(payload) => {
                        if !handle_frame(&payload, &state, &writer, &subscribed).await {
                            break;
                        }
                    }
                    Err(FrameError::ConnectionClosed) => break,
                    Err(e) => {
                        warn!("frame error, closing connection: {e}");
                        break;
                    }
                }
            }
            notification = telemetry_rx.recv() => {
                match notification {
                    Ok(notification) => {
                        if subscribed.load(Ordering::SeqCst) {
                            if send_notification(&writer, &notification).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        debug!("telemetry receiver lagged, dropped {n} notifications");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = cancel.cancelled() => break,
        }
    }

    if subscribed.swap(false, Ordering::SeqCst) {
        state.subscriber_count.fetch_sub(1, Ordering::SeqCst);
    }

    // Let any in-flight write drain before the socket drops.
    let mut guard = writer.lock().await;
    let _ = guard.shutdown().await;
}

async fn send_notification(writer: &Arc<Mutex<tokio::net::unix::OwnedWriteHalf>>, notification: &Notification) -> std::io::Result<()> {
    let payload = serde_json::to_vec(notification)?;
    let mut guard = writer.lock().await;
    write_frame(&mut *guard, &payload).await.map_err(|e| std::io::Error::new(std::io::ErrorKind::BrokenPipe, e.to_string()))
}

/// Parses and dispatches one request frame. Returns `false` if the
/// connection should be closed (write failure).
async fn handle_frame(
    payload: &[u8],
    state: &Arc<SharedState>,
    writer: &Arc<Mutex<tokio::net::unix::OwnedWriteHalf>>,
    subscribed: &Arc<AtomicBool>,
) -> bool {
    // Parse loosely first so a malformed/unknown request still correlates by id.
    let raw: serde_json::Value = match serde_json::from_slice(payload) {
        Ok(v) => v,
        Err(e) => {
            return send_response(writer, ResponseEnvelope::new(0, Response::error(0, format!("malformed request: {e}")))).await;
        }
    };
    let id = raw.get("id").and_then(|v| v.as_u64()).unwrap_or(0);

    let envelope: RequestEnvelope = match serde_json::from_value(raw) {
        Ok(e) => e,
        Err(e) => {
            return send_response(writer, ResponseEnvelope::new(id, Response::error(id, format!("unrecognized request: {e}")))).await;
        }
    };

    if let Err(e) = envelope.request.validate() {
        return send_response(writer, ResponseEnvelope::new(envelope.id, Response::error(envelope.id, e))).await;
    }

    let response = dispatch(envelope.id, envelope.request, state, subscribed).await;
    send_response(writer, ResponseEnvelope::new(envelope.id, response)).await
}

async fn send_response(writer: &Arc<Mutex<tokio::net::unix::OwnedWriteHalf>>, envelope: ResponseEnvelope) -> bool {
    let Ok(payload) = serde_json::to_vec(&envelope) else { return false };
    let mut guard = writer.lock().await;
    write_frame(&mut *guard, &payload).await.is_ok()
}

async fn dispatch(request_id: u64, request: Request, state: &Arc<SharedState>, subscribed: &Arc<AtomicBool>) -> Response {
    match request {
        Request::GetStatus => {
            let config = state.config.current();
            let safety_status = state.safety.status();
            let profile_name = config.profiles.get(&config.active_profile_id).map(|p| p.name.clone()).unwrap_or_default();
            let mut warnings = safety_status.active_warnings;
            warnings.extend(state.adapter.warnings());
            Response::Status(StatusDto {
                running: true,
                version: env!("CARGO_PKG_VERSION").to_string(),
                uptime_seconds: state.started_at.elapsed().as_secs(),
                emergency_active: safety_status.emergency.active,
                emergency_reason: safety_status.emergency.reason,
                active_profile_id: config.active_profile_id,
                active_profile_name: profile_name,
                warnings,
                connected_clients: state.connected_clients.load(Ordering::SeqCst) as u32,
            })
        }
        Request::GetSensors => {
            let sensors = state.sensors.read().await;
            Response::Sensors(SensorsDto { sensors: sensors.iter().map(sensor_to_dto).collect() })
        }
        Request::GetFans => {
            let fans = state.fans.read().await;
            Response::Fans(FansDto { fans: fans.iter().map(fan_to_dto).collect() })
        }
        Request::GetConfig => Response::Config(config_to_dto(&state.config.current())),
        Request::SetConfig { config } => match config_from_dto(&config) {
            Ok(parsed) => match state.config.save(parsed.clone()) {
                Ok(()) => {
                    state.safety.update_thresholds(&parsed);
                    Response::ack(request_id)
                }
                Err(e) => Response::ack_failed(request_id, e.to_string()),
            },
            Err(e) => Response::ack_failed(request_id, e),
        },
        Request::SetFanSpeed { fan_key, percent } => {
            let fans = state.fans.read().await;
            let Some(fan) = fans.iter().find(|f| f.id.key() == fan_key) else {
                return Response::error(request_id, format!("fan not found: {fan_key}"));
            };
            if fan.capability != FanControlCapability::FullControl {
                return Response::ack_failed(request_id, format!("fan {fan_key} is not FullControl"));
            }
            let (ok, warning) = state.safety.validate_fan_speed(percent, fan);
            if !ok {
                return Response::ack_failed(request_id, warning.unwrap_or_default());
            }
            let applied = state.adapter.set_speed(&fan.id, percent);
            if applied {
                Response::Ack { ok: true, message: warning, original_request_id: request_id }
            } else {
                Response::ack_failed(request_id, "adapter rejected the write")
            }
        }
        Request::SetProfile { profile_id } => match state.config.set_active_profile(&profile_id) {
            Ok(()) => Response::ack(request_id),
            Err(e) => Response::ack_failed(request_id, e.to_string()),
        },
        Request::SubscribeSensors { interval_ms: _ } => {
            if !subscribed.swap(true, Ordering::SeqCst) {
                state.subscriber_count.fetch_add(1, Ordering::SeqCst);
            }
            Response::ack(request_id)
        }
        Request::UnsubscribeSensors => {
            if subscribed.swap(false, Ordering::SeqCst) {
                state.subscriber_count.fetch_sub(1, Ordering::SeqCst);
            }
            Response::ack(request_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fantuner_core::{ConfigStore, HardwareAdapter, MockAdapter, SafetySupervisor};

    fn test_state() -> Arc<SharedState> {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(ConfigStore::load(dir.path().join("config.json")).unwrap());
        let safety = Arc::new(SafetySupervisor::new(&config.current()));
        let adapter: Arc<dyn HardwareAdapter> = Arc::new(MockAdapter::new());
        adapter.initialize().unwrap();
        Arc::new(SharedState::new(config, safety, adapter))
    }

    #[tokio::test]
    async fn set_fan_speed_on_unknown_fan_is_not_found() {
        let state = test_state();
        let subscribed = Arc::new(AtomicBool::new(false));
        let response = dispatch(1, Request::SetFanSpeed { fan_key: "nope".to_string(), percent: 50.0 }, &state, &subscribed).await;
        assert!(matches!(response, Response::Error { .. }));
    }

    #[tokio::test]
    async fn set_config_round_trips_poll_interval() {
        let state = test_state();
        let subscribed = Arc::new(AtomicBool::new(false));
        let mut dto = config_to_dto(&state.config.current());
        dto.poll_interval_ms = 2000;
        let response = dispatch(1, Request::SetConfig { config: dto }, &state, &subscribed).await;
        assert!(matches!(response, Response::Ack { ok: true, .. }));
        assert_eq!(state.config.current().poll_interval_ms, 2000);
    }

    #[tokio::test]
    async fn subscribe_then_unsubscribe_tracks_subscriber_count() {
        let state = test_state();
        let subscribed = Arc::new(AtomicBool::new(false));

        dispatch(1, Request::SubscribeSensors { interval_ms: 1000 }, &state, &subscribed).await;
        assert_eq!(state.subscriber_count.load(Ordering::SeqCst), 1);

        dispatch(2, Request::UnsubscribeSensors, &state, &subscribed).await;
        assert_eq!(state.subscriber_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn set_profile_unknown_id_fails() {
        let state = test_state();
        let subscribed = Arc::new(AtomicBool::new(false));
        let response = dispatch(1, Request::SetProfile { profile_id: "nope".to_string() }, &state, &subscribed).await;
        assert!(matches!(response, Response::Ack { ok: false, .. }));
    }

    #[tokio::test]
    async fn ack_echoes_the_requests_envelope_id() {
        let state = test_state();
        let subscribed = Arc::new(AtomicBool::new(false));
        let response = dispatch(42, Request::SetProfile { profile_id: "nope".to_string() }, &state, &subscribed).await;
        assert!(matches!(response, Response::Ack { original_request_id: 42, .. }));
    }
}
