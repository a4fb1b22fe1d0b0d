//! Standalone metrics exporter
//!
//! Serves the metrics endpoint on its own listener, independent of the host
//! application's router. Used when the host cannot mount the handler or when
//! scraping should happen on a separate port.

use crate::error::ExportError;
use crate::handlers::{self, AppState};
use axum::http::StatusCode;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// Environment marker set by auto-reloaders in the child process
pub const RELOADER_ENV: &str = "RUN_MAIN";

/// A running standalone exporter
///
/// Dropping the handle leaves the server running; call
/// [`RunningExporter::shutdown`] to stop it.
#[derive(Debug)]
pub struct RunningExporter {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl RunningExporter {
    /// Address the exporter is bound to
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Stop serving
    pub fn shutdown(self) {
        self.task.abort();
        tracing::info!(addr = %self.addr, "Standalone exporter stopped");
    }
}

/// Refuse to start when `run_main` carries the auto-reloader marker
///
/// The reloader forks the process and both copies would try to bind the same
/// port.
pub fn refuse_under_reloader(run_main: Option<&str>) -> Result<(), ExportError> {
    if run_main == Some("true") {
        return Err(ExportError::AutoReloader);
    }
    Ok(())
}

/// Start the standalone exporter configured in `[export]`
///
/// Returns `Ok(None)` when no standalone port is configured, or when every
/// port of the configured range is taken.
///
/// # Errors
///
/// - [`ExportError::AutoReloader`] when `RUN_MAIN=true`
/// - [`ExportError::InvalidAddress`] when `export.address` is not an IP
/// - [`ExportError::Bind`] when a single configured port cannot be bound
pub async fn start(state: AppState) -> Result<Option<RunningExporter>, ExportError> {
    let run_main = std::env::var(RELOADER_ENV).ok();
    start_with_marker(state, run_main.as_deref()).await
}

/// [`start`] with the reloader marker passed in
pub async fn start_with_marker(
    state: AppState,
    run_main: Option<&str>,
) -> Result<Option<RunningExporter>, ExportError> {
    let export = &state.config().export;
    if !export.standalone_enabled() {
        tracing::debug!("No standalone exporter port configured");
        return Ok(None);
    }
    refuse_under_reloader(run_main)?;

    let ip: IpAddr = export
        .address
        .parse()
        .map_err(|e: std::net::AddrParseError| ExportError::InvalidAddress {
            address: export.address.clone(),
            reason: e.to_string(),
        })?;

    let listener = if export.port_range.is_some() {
        match bind_first_free(ip, &export.candidate_ports()).await {
            Some(listener) => listener,
            None => {
                tracing::warn!(
                    address = %ip,
                    ports = ?export.port_range,
                    "No free port in the configured range, standalone exporter not started"
                );
                return Ok(None);
            }
        }
    } else {
        let addr = SocketAddr::new(ip, export.port.unwrap_or_default());
        TcpListener::bind(addr)
            .await
            .map_err(|source| ExportError::Bind {
                addr: addr.to_string(),
                source,
            })?
    };

    let addr = listener.local_addr().map_err(|source| ExportError::Bind {
        addr: ip.to_string(),
        source,
    })?;
    let timeout = Duration::from_secs(export.timeout_seconds);
    let path = export.path.clone();
    let app = handlers::router(state)
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            timeout,
        ))
        .layer(TraceLayer::new_for_http());

    let task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "Standalone exporter stopped with an error");
        }
    });

    tracing::info!(
        addr = %addr,
        path = %path,
        "Standalone exporter listening"
    );
    Ok(Some(RunningExporter { addr, task }))
}

async fn bind_first_free(ip: IpAddr, ports: &[u16]) -> Option<TcpListener> {
    for &port in ports {
        match TcpListener::bind(SocketAddr::new(ip, port)).await {
            Ok(listener) => return Some(listener),
            Err(e) => {
                tracing::debug!(port, error = %e, "Port unavailable, trying next");
            }
        }
    }
    None
}
