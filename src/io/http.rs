//! HTTP adapter
//!
//! - `POST /command/{load,start,reset}` - run a command through the dispatcher
//! - `GET /status` - device status and current race
//! - `GET /races` - finished races, oldest first
//! - `GET /metrics` - Prometheus text format
//! - `GET /health` - liveness
//!
//! Command responses are `{"success":true,...}` or
//! `{"success":false,"error":"..."}` with 409 (invalid state),
//! 503 (hardware or controller unavailable) or 504 (ack timeout).

use crate::domain::events::DeviceStatus;
use crate::domain::race::RaceView;
use crate::domain::types::{Command, RaceId, RaceState};
use crate::infra::metrics::Metrics;
use crate::io::prometheus::format_prometheus_metrics;
use crate::services::broadcaster::Broadcaster;
use crate::services::controller::RaceSnapshot;
use crate::services::dispatcher::{CommandDispatcher, CommandError};
use crate::services::sensor_gate::SensorGate;
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Shared state for request handlers
#[derive(Clone)]
pub struct HttpContext {
    pub dispatcher: Arc<CommandDispatcher>,
    pub gate: SensorGate,
    pub snapshots: watch::Receiver<Arc<RaceSnapshot>>,
    pub broadcaster: Broadcaster,
    pub metrics: Arc<Metrics>,
    pub site_id: Arc<str>,
}

#[derive(Serialize)]
struct CommandBody {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    state: Option<RaceState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    race_id: Option<RaceId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ack_latency_us: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
struct StatusBody<'a> {
    site: &'a str,
    device: &'a DeviceStatus,
    state: RaceState,
    race: Option<&'a RaceView>,
    subscribers: usize,
}

fn response(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(body.into()));
    *resp.status_mut() = status;
    let headers = resp.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    resp
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => response(status, "application/json", body),
        Err(e) => {
            error!(error = %e, "http_serialize_failed");
            response(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", "serialization failed")
        }
    }
}

fn error_status(err: &CommandError) -> StatusCode {
    match err {
        CommandError::InvalidState(_) => StatusCode::CONFLICT,
        CommandError::HardwareUnavailable(_) | CommandError::ControllerUnavailable => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        CommandError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
    }
}

async fn run_command(name: &str, ctx: &HttpContext) -> Response<Full<Bytes>> {
    let command: Command = match name.parse() {
        Ok(command) => command,
        Err(e) => {
            let body = CommandBody {
                success: false,
                state: None,
                race_id: None,
                ack_latency_us: None,
                error: Some(format!("{}", e)),
            };
            return json(StatusCode::NOT_FOUND, &body);
        }
    };

    match ctx.dispatcher.dispatch(command).await {
        Ok(ack) => json(
            StatusCode::OK,
            &CommandBody {
                success: true,
                state: Some(ack.state),
                race_id: ack.race_id,
                ack_latency_us: Some(ack.ack_latency.as_micros() as u64),
                error: None,
            },
        ),
        Err(e) => json(
            error_status(&e),
            &CommandBody {
                success: false,
                state: None,
                race_id: None,
                ack_latency_us: None,
                error: Some(e.to_string()),
            },
        ),
    }
}

/// Route a request; separated from hyper types for testing
pub async fn respond(method: &Method, path: &str, ctx: &HttpContext) -> Response<Full<Bytes>> {
    match (method, path) {
        (&Method::POST, p) if p.starts_with("/command/") => {
            run_command(&p["/command/".len()..], ctx).await
        }
        (&Method::OPTIONS, p) if p.starts_with("/command/") => {
            let mut resp = response(StatusCode::OK, "text/plain", "");
            let headers = resp.headers_mut();
            headers.insert("Access-Control-Allow-Methods", HeaderValue::from_static("POST, OPTIONS"));
            headers.insert("Access-Control-Allow-Headers", HeaderValue::from_static("Content-Type"));
            resp
        }
        (&Method::GET, "/status") => {
            let device = ctx.gate.status();
            let snapshot = ctx.snapshots.borrow().clone();
            json(
                StatusCode::OK,
                &StatusBody {
                    site: &ctx.site_id,
                    device: &device,
                    state: snapshot.state,
                    race: snapshot.race.as_ref(),
                    subscribers: ctx.broadcaster.subscriber_count(),
                },
            )
        }
        (&Method::GET, "/races") => {
            let snapshot = ctx.snapshots.borrow().clone();
            json(StatusCode::OK, &snapshot.history)
        }
        (&Method::GET, "/metrics") => {
            let state = ctx.snapshots.borrow().state;
            let body = format_prometheus_metrics(
                &ctx.metrics.report(),
                state,
                &ctx.broadcaster.subscribers(),
                &ctx.site_id,
            );
            response(StatusCode::OK, "text/plain; version=0.0.4; charset=utf-8", body)
        }
        (&Method::GET, "/health") => response(StatusCode::OK, "text/plain", "ok"),
        _ => response(StatusCode::NOT_FOUND, "text/plain", "Not Found"),
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    ctx: HttpContext,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let resp = respond(req.method(), req.uri().path(), &ctx).await;
    if req.method() == Method::POST {
        info!(path = %req.uri().path(), status = %resp.status().as_u16(), "http_command");
    }
    Ok(resp)
}

/// Start the HTTP server
pub async fn start_http_server(
    port: u16,
    ctx: HttpContext,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!(port = %port, site = %ctx.site_id, "http_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let ctx = ctx.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| handle_request(req, ctx.clone()));
                            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                                error!(error = %e, "http_connection_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "http_accept_error");
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("http_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::config::{SimSettings, TimingSettings};
    use crate::io::simulator::SimulatedHardware;
    use crate::services::controller::RaceController;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn context() -> (HttpContext, watch::Sender<bool>) {
        let metrics = Arc::new(Metrics::new());
        let (tx, rx) = mpsc::channel(64);
        let gate = SensorGate::new(tx.clone(), Duration::from_millis(5), metrics.clone());
        let broadcaster = Broadcaster::new(16, metrics.clone());
        let controller = RaceController::new(
            TimingSettings::default(),
            gate.clone(),
            broadcaster.clone(),
            metrics.clone(),
        );
        let snapshots = controller.subscribe_snapshot();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(controller.run(rx, shutdown_rx));

        let hardware = Arc::new(SimulatedHardware::new(gate.clone(), SimSettings::default()));
        let dispatcher = Arc::new(CommandDispatcher::new(
            tx,
            hardware,
            gate.clone(),
            Duration::from_secs(2),
            metrics.clone(),
        ));
        let ctx = HttpContext {
            dispatcher,
            gate,
            snapshots,
            broadcaster,
            metrics,
            site_id: Arc::from("track1"),
        };
        (ctx, shutdown_tx)
    }

    async fn body_json(resp: Response<Full<Bytes>>) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_in_idle_is_conflict() {
        let (ctx, _shutdown) = context();
        let resp = respond(&Method::POST, "/command/start", &ctx).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let body = body_json(resp).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "invalid transition: cannot start while idle");
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_reports_state() {
        let (ctx, _shutdown) = context();
        let resp = respond(&Method::POST, "/command/load", &ctx).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["state"], "loaded");
        assert_eq!(body["race_id"], 1);
        assert!(body.get("error").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_command() {
        let (ctx, _shutdown) = context();
        let resp = respond(&Method::POST, "/command/launch", &ctx).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(resp).await["success"], false);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_and_health() {
        let (ctx, _shutdown) = context();
        let body = body_json(respond(&Method::GET, "/status", &ctx).await).await;
        assert_eq!(body["site"], "track1");
        assert_eq!(body["state"], "idle");
        assert_eq!(body["device"]["sensors"]["sensor1"], true);
        assert!(body["race"].is_null());

        let resp = respond(&Method::GET, "/health", &ctx).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let resp = respond(&Method::GET, "/nope", &ctx).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cors_preflight() {
        let (ctx, _shutdown) = context();
        let resp = respond(&Method::OPTIONS, "/command/load", &ctx).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["Access-Control-Allow-Origin"], "*");
        assert_eq!(resp.headers()["Access-Control-Allow-Methods"], "POST, OPTIONS");
    }
}
