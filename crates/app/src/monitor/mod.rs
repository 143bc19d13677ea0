//! Fall monitoring service: capture, pose evaluation, alerting and the HTTP
//! surface that controls a single monitoring session.
//!
//! Submodules:
//! - `config`: CLI configuration parsing.
//! - `session`: Single active session lifecycle (start/stop/status).
//! - `pipeline`: Per-session capture → pose → decide → encode loop.
//! - `notify`: Cooldown gate and webhook delivery.
//! - `annotation`: Overlay drawing.
//! - `encoding`: JPEG and snapshot encoding.
//! - `server`: Actix Web endpoints.
//! - `watchdog`: Per-stage heartbeats reported by `/health`.
//! - `data`: Shared structs passed between stages.

pub use config::{MonitorConfig, ServeArgs, TelemetryOptions};
/// Serve the HTTP surface until shutdown.
pub use server::run;

mod annotation;
mod config;
mod data;
mod encoding;
mod notify;
mod pipeline;
mod server;
mod session;
pub(crate) mod telemetry;
mod watchdog;
