// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! `GET /healthz`: liveness plus a digest of the most recent run.

use crate::config::format_duration;
use crate::report::Report;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::CONTENT_TYPE;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{debug, error, info};
use serde_json::{Value, json};
use std::sync::{Arc, RwLock};
use time::format_description::well_known::Rfc3339;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NOTFOUND: &[u8] = b"Not Found";

type HttpResponse = Response<BoxBody<Bytes, std::io::Error>>;

/// Most recent report, shared between the scheduler (writer) and the
/// listener (readers).
#[derive(Debug, Default)]
pub struct HealthState {
    last: RwLock<Option<Report>>,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_last(&self, report: Report) {
        let mut last = self.last.write().unwrap_or_else(|e| e.into_inner());
        *last = Some(report);
    }

    /// Body of a `/healthz` response.
    pub fn snapshot(&self) -> Value {
        let last = self.last.read().unwrap_or_else(|e| e.into_inner());
        let mut body = json!({ "status": "ok" });
        if let (Some(report), Some(map)) = (last.as_ref(), body.as_object_mut()) {
            map.insert("last_status".into(), json!(report.status));
            map.insert(
                "last_started".into(),
                json!(report.started.format(&Rfc3339).unwrap_or_default()),
            );
            map.insert(
                "last_duration".into(),
                json!(format_duration(report.duration)),
            );
            map.insert("last_backend".into(), json!(report.backend));
            map.insert(
                "last_reboot_required".into(),
                json!(report.reboot_required),
            );
        }
        body
    }
}

fn healthz(state: &HealthState) -> Result<HttpResponse, hyper::http::Error> {
    let body = serde_json::to_vec(&state.snapshot()).unwrap_or_else(|e| {
        error!("Failed to serialize health response: {e}");
        b"{\"status\":\"ok\"}".to_vec()
    });
    Response::builder()
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(body.into()).map_err(|e| match e {}).boxed())
}

fn not_found() -> Result<HttpResponse, hyper::http::Error> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Full::new(NOTFOUND.into()).map_err(|e| match e {}).boxed())
}

fn handle_request<B>(req: &Request<B>, state: &HealthState) -> Result<HttpResponse, hyper::http::Error> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/healthz") => healthz(state),
        _ => {
            debug!("{} request to unknown endpoint: {}", req.method(), req.uri().path());
            not_found()
        }
    }
}

/// Serve until `cancel` fires. Connections already accepted finish on
/// their own tasks.
pub async fn serve(
    listener: TcpListener,
    state: Arc<HealthState>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    info!("health server listening on {}", listener.local_addr()?);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("health accept failed: {e}");
                        continue;
                    }
                };
                let io = TokioIo::new(stream);
                let state = Arc::clone(&state);
                tokio::task::spawn(async move {
                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { handle_request(&req, &state) }
                    });
                    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                        debug!("error serving health connection from {peer}: {err}");
                    }
                });
            }
            _ = cancel.cancelled() => {
                info!("health server stopped");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::Status;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn get(addr: std::net::SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    fn body(response: &str) -> Value {
        let (_, body) = response.split_once("\r\n\r\n").unwrap();
        serde_json::from_str(body).unwrap()
    }

    #[test]
    fn test_snapshot_without_runs() {
        assert_eq!(HealthState::new().snapshot(), json!({ "status": "ok" }));
    }

    #[tokio::test]
    async fn test_healthz_reports_last_run() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(HealthState::new());
        let cancel = CancellationToken::new();
        let server = tokio::spawn(serve(listener, Arc::clone(&state), cancel.clone()));

        let response = get(addr, "/healthz").await;
        assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
        assert!(response.contains("content-type: application/json"), "{response}");
        assert_eq!(body(&response), json!({ "status": "ok" }));

        let mut report = Report::new("Server Patcher", "web-1");
        report.status = Status::Success;
        report.backend = "dnf".to_string();
        report.reboot_required = true;
        report.duration = Duration::from_secs(95);
        state.set_last(report);

        let value = body(&get(addr, "/healthz").await);
        assert_eq!(value["status"], "ok");
        assert_eq!(value["last_status"], "success");
        assert_eq!(value["last_backend"], "dnf");
        assert_eq!(value["last_duration"], "1m35s");
        assert_eq!(value["last_reboot_required"], true);
        assert!(value["last_started"].as_str().unwrap().ends_with('Z'));

        let response = get(addr, "/metrics").await;
        assert!(response.starts_with("HTTP/1.1 404 Not Found"), "{response}");

        cancel.cancel();
        server.await.unwrap().unwrap();
    }
}
