//! Actix Web surface: session control, status, health, metrics and the MJPEG feed.

use std::{sync::Arc, time::Duration};

use actix_web::{
    App, HttpResponse, HttpServer,
    error::InternalError,
    http::{StatusCode, header},
    middleware::DefaultHeaders,
    web::{self, Bytes},
};
use anyhow::{Context, Result};
use async_stream::stream;
use chrono::Utc;
use pose_core::RemotePoseProvider;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};
use video_ingest::{CaptureSource, SystemCaptureOpener};

use crate::monitor::{
    config::MonitorConfig,
    data::{SessionId, unix_seconds},
    notify::WebhookDispatcher,
    session::{MonitorBackends, SessionError, SessionManager, SessionShared},
    telemetry,
    watchdog::current_millis,
};

const STREAM_INTERVAL: Duration = Duration::from_millis(33);

/// Build the backends, serve HTTP until the server is told to stop, then stop
/// any active session.
pub fn run(config: MonitorConfig) -> Result<()> {
    telemetry::init_metrics_recorder();

    let alerts = WebhookDispatcher::new(config.notify.clone())?;
    let pose = RemotePoseProvider::new(config.pose_url.clone(), config.pose_timeout)
        .context("failed to build pose client")?;
    let backends = MonitorBackends {
        opener: Arc::new(SystemCaptureOpener::default()),
        pose: Arc::new(pose),
        alerts: Arc::new(alerts),
    };
    let bind = (config.bind.clone(), config.port);
    info!(
        bind = %bind.0,
        port = bind.1,
        webhook = %config.notify.webhook_url,
        pose = %config.pose_url,
        "fall monitor service starting"
    );
    let manager = web::Data::new(SessionManager::new(config, backends));

    let server_manager = manager.clone();
    let served = actix_web::rt::System::new().block_on(async move {
        HttpServer::new(move || {
            App::new()
                .app_data(server_manager.clone())
                .wrap(cors_headers())
                .configure(configure)
        })
        .bind(bind)?
        .run()
        .await
    });

    manager.shutdown();
    served.context("HTTP server failed")
}

/// Register routes and request extractors.
pub(crate) fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().error_handler(|err, _req| {
        let response = failure(StatusCode::BAD_REQUEST, &format!("Invalid request: {err}"));
        InternalError::from_response(err, response).into()
    }))
    .route("/", web::get().to(index))
    .service(
        web::resource("/start")
            .route(web::post().to(start))
            .route(web::method(actix_web::http::Method::OPTIONS).to(preflight)),
    )
    .service(
        web::resource("/stop")
            .route(web::post().to(stop))
            .route(web::method(actix_web::http::Method::OPTIONS).to(preflight)),
    )
    .route("/status", web::get().to(status))
    .route("/video_feed", web::get().to(video_feed))
    .route("/health", web::get().to(health))
    .route("/metrics", web::get().to(metrics_handler));
}

pub(crate) fn cors_headers() -> DefaultHeaders {
    DefaultHeaders::new()
        .add((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .add((header::ACCESS_CONTROL_ALLOW_HEADERS, "*"))
        .add((header::ACCESS_CONTROL_ALLOW_METHODS, "GET, POST, OPTIONS"))
        .add((header::ACCESS_CONTROL_EXPOSE_HEADERS, "Content-Type"))
}

fn failure(status: StatusCode, message: &str) -> HttpResponse {
    HttpResponse::build(status).json(json!({ "success": false, "error": message }))
}

fn session_failure(err: &SessionError) -> HttpResponse {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    failure(status, &err.to_string())
}

/// `camera_url` may arrive as a device index or as a string.
#[derive(Deserialize)]
#[serde(untagged)]
enum CameraUrl {
    Index(i64),
    Text(String),
}

impl CameraUrl {
    fn into_uri(self) -> String {
        match self {
            CameraUrl::Index(index) => index.to_string(),
            CameraUrl::Text(text) => text,
        }
    }
}

#[derive(Deserialize)]
struct StartRequest {
    #[serde(default)]
    session_id: Option<SessionId>,
    #[serde(default)]
    camera_url: Option<CameraUrl>,
    #[serde(default)]
    camera_type: Option<String>,
}

async fn index() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "service": "fallwatch",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "endpoints": {
            "health": "/health",
            "status": "/status",
            "video_feed": "/video_feed",
            "metrics": "/metrics",
            "start": "/start (POST)",
            "stop": "/stop (POST)",
        }
    }))
}

async fn preflight() -> HttpResponse {
    HttpResponse::NoContent().finish()
}

async fn start(manager: web::Data<SessionManager>, body: web::Json<StartRequest>) -> HttpResponse {
    let request = body.into_inner();
    let Some(session_id) = request.session_id else {
        return failure(StatusCode::BAD_REQUEST, "session_id is required");
    };
    let camera_url = request
        .camera_url
        .map(CameraUrl::into_uri)
        .unwrap_or_else(|| "0".to_string());
    let camera_type = request.camera_type.unwrap_or_else(|| "webcam".to_string());
    info!(session = %session_id, %camera_type, %camera_url, "start requested");
    let source = CaptureSource::from_request(&camera_url, &camera_type);

    let manager = manager.into_inner();
    match web::block(move || manager.start(session_id, source)).await {
        Ok(Ok(session_id)) => HttpResponse::Ok().json(json!({
            "success": true,
            "session_id": session_id,
            "message": "Monitoring started successfully",
        })),
        Ok(Err(err)) => {
            error!("start failed: {err}");
            session_failure(&err)
        }
        Err(err) => failure(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}

async fn stop(manager: web::Data<SessionManager>) -> HttpResponse {
    let manager = manager.into_inner();
    match web::block(move || manager.stop()).await {
        Ok(Ok(session_id)) => HttpResponse::Ok().json(json!({
            "success": true,
            "message": format!("Session {session_id} stopped"),
        })),
        Ok(Err(err)) => session_failure(&err),
        Err(err) => failure(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}

#[derive(Serialize)]
struct StatusResponse {
    status: &'static str,
    fall_detected: bool,
    session_id: Option<SessionId>,
    is_running: bool,
    consecutive_candidates: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    fall_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'static str>,
    timestamp: f64,
}

async fn status(manager: web::Data<SessionManager>) -> HttpResponse {
    let snapshot = manager.status();
    HttpResponse::Ok().json(StatusResponse {
        status: if snapshot.running { "monitoring" } else { "idle" },
        fall_detected: snapshot.fall_detected,
        error: snapshot.session_id.is_none().then_some("No active session"),
        session_id: snapshot.session_id,
        is_running: snapshot.running,
        consecutive_candidates: snapshot.consecutive_candidates,
        fall_time: snapshot.fall_time.map(unix_seconds),
        timestamp: unix_seconds(snapshot.timestamp),
    })
}

async fn health(manager: web::Data<SessionManager>) -> HttpResponse {
    let session = manager.current();
    let pipeline = match session.as_deref() {
        Some(shared) if shared.is_running() => {
            match shared.health.stale_component(current_millis()) {
                Some(component) => format!("stalled:{}", component.label()),
                None => "ok".to_string(),
            }
        }
        _ => "idle".to_string(),
    };
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "timestamp": unix_seconds(Utc::now()),
        "active_session": session.as_ref().map(|shared| shared.id.clone()),
        "is_monitoring": session.as_deref().is_some_and(SessionShared::is_running),
        "pipeline": pipeline,
        "fps": session.as_ref().and_then(|shared| shared.latest_frame()).map(|packet| packet.fps),
    }))
}

async fn metrics_handler() -> HttpResponse {
    match telemetry::prometheus_handle() {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::ServiceUnavailable().body("metrics recorder not installed"),
    }
}

/// Multipart MJPEG feed of the active session's latest frame.
///
/// The stream re-sends the latest frame on a fixed cadence and ends when the
/// session stops.
async fn video_feed(manager: web::Data<SessionManager>) -> HttpResponse {
    let Some(shared) = manager.current().filter(|shared| shared.is_running()) else {
        return failure(StatusCode::NOT_FOUND, "No active session");
    };
    let stream = stream! {
        let mut interval = actix_web::rt::time::interval(STREAM_INTERVAL);
        while shared.is_running() {
            interval.tick().await;
            if let Some(packet) = shared.latest_frame() {
                let mut payload = Vec::with_capacity(packet.jpeg.len() + 64);
                payload.extend_from_slice(b"--frame\r\n");
                payload.extend_from_slice(
                    format!(
                        "X-Sequence: {}\r\nX-Timestamp: {}\r\n",
                        packet.frame_number, packet.timestamp_ms
                    )
                    .as_bytes(),
                );
                payload.extend_from_slice(b"Content-Type: image/jpeg\r\n\r\n");
                payload.extend_from_slice(&packet.jpeg);
                payload.extend_from_slice(b"\r\n");
                yield Ok::<Bytes, actix_web::Error>(Bytes::from(payload));
            }
        }
    };

    HttpResponse::Ok()
        .append_header((header::CACHE_CONTROL, "no-cache"))
        .content_type("multipart/x-mixed-replace; boundary=frame")
        .streaming(stream)
}
