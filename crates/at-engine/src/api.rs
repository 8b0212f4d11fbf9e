//! Minimal JSON over HTTP/1.1 front for [`AutoTuneService`].
//!
//! One request per connection, no keep-alive, no chunked bodies.

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use uuid::Uuid;

use at_types::{AtError, AutoTuneRequest};

use crate::orchestrator::failure_message;
use crate::service::AutoTuneService;

const MAX_HEADER_BYTES: usize = 16 * 1024;
const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    fn error(status: u16, detail: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "detail": detail.into() }),
        }
    }

    fn from_error(err: &AtError) -> Self {
        match err {
            AtError::NotFound { .. } => Self::error(404, failure_message(err)),
            AtError::Validation(message) => Self::error(400, message.clone()),
            other => Self::error(500, other.to_string()),
        }
    }

    fn reason(&self) -> &'static str {
        match self.status {
            200 => "OK",
            400 => "Bad Request",
            404 => "Not Found",
            405 => "Method Not Allowed",
            413 => "Payload Too Large",
            _ => "Internal Server Error",
        }
    }

    pub fn to_http(&self) -> String {
        let body = self.body.to_string();
        format!(
            "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            self.status,
            self.reason(),
            body.len(),
            body
        )
    }
}

fn parse_id(raw: &str) -> Result<Uuid, ApiResponse> {
    Uuid::parse_str(raw).map_err(|_| ApiResponse::error(400, format!("Invalid id: {raw}")))
}

fn respond<T: serde::Serialize>(result: Result<T, AtError>) -> ApiResponse {
    match result.and_then(|value| serde_json::to_value(value).map_err(AtError::from)) {
        Ok(body) => ApiResponse::ok(body),
        Err(e) => ApiResponse::from_error(&e),
    }
}

/// Dispatch one request.
pub async fn route(service: &AutoTuneService, method: &str, path: &str, body: &[u8]) -> ApiResponse {
    let path = path.split('?').next().unwrap_or_default().trim_end_matches('/');
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    let result = match (method, segments.as_slice()) {
        ("GET", ["health"]) => Ok(ApiResponse::ok(json!({ "status": "ok", "service": "autotune" }))),
        ("GET", ["autotune"]) => Ok(respond(service.list().map(|jobs| json!({ "jobs": jobs })))),
        ("POST", ["autotune", "run"]) => match serde_json::from_slice::<AutoTuneRequest>(body) {
            Ok(request) => Ok(respond(service.start(request))),
            Err(e) => Err(ApiResponse::error(400, format!("Invalid request body: {e}"))),
        },
        ("GET", ["autotune", id]) => parse_id(id).map(|id| {
            respond(service.get_status(id).map(|job| {
                let message = if job.phase_message.is_empty() {
                    job.status.to_string()
                } else {
                    job.phase_message.clone()
                };
                json!({ "job": job, "message": message })
            }))
        }),
        ("DELETE", ["autotune", id]) => parse_id(id).map(|id| match service.delete(id) {
            Ok(true) => ApiResponse::ok(json!({ "status": "deleted", "job_id": id })),
            Ok(false) => ApiResponse::error(404, "AutoTune job not found"),
            Err(e) => ApiResponse::from_error(&e),
        }),
        ("POST", ["autotune", id, "cancel"]) => parse_id(id).map(|id| {
            respond(
                service
                    .cancel(id)
                    .map(|cancelled| json!({ "job_id": id, "cancelled": cancelled })),
            )
        }),
        ("GET", ["experiments", id, "progress"]) => parse_id(id).map(|id| {
            match service.progress(id) {
                Some(progress) => respond(Ok(progress)),
                None => ApiResponse::error(404, "No progress reported"),
            }
        }),
        ("POST", ["compute-targets", id, "test"]) => match parse_id(id) {
            Ok(id) => Ok(respond(service.test_compute_target(id).await)),
            Err(response) => Err(response),
        },
        (_, ["health"])
        | (_, ["autotune", ..])
        | (_, ["experiments", _, "progress"])
        | (_, ["compute-targets", _, "test"]) => {
            Err(ApiResponse::error(405, "Method not allowed"))
        }
        _ => Err(ApiResponse::error(404, "Not found")),
    };
    result.unwrap_or_else(|response| response)
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Read one request from `socket`, dispatch it and write the response.
pub async fn handle_connection(
    service: &AutoTuneService,
    socket: &mut TcpStream,
) -> std::io::Result<()> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        if let Some(end) = find_header_end(&buf) {
            break end;
        }
        if buf.len() > MAX_HEADER_BYTES {
            let response = ApiResponse::error(413, "Headers too large");
            socket.write_all(response.to_http().as_bytes()).await?;
            return socket.shutdown().await;
        }
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let mut lines = head.lines();
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or("/").to_string();
    let content_length = lines
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);

    let response = if content_length > MAX_BODY_BYTES {
        ApiResponse::error(413, "Body too large")
    } else {
        let mut body = buf[header_end..].to_vec();
        while body.len() < content_length {
            let n = socket.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..n]);
        }
        body.truncate(content_length);
        route(service, &method, &path, &body).await
    };

    tracing::debug!(%method, %path, status = response.status, "Handled request");
    socket.write_all(response.to_http().as_bytes()).await?;
    socket.shutdown().await
}

/// Accept connections forever, one task per connection.
pub async fn serve(listener: TcpListener, service: AutoTuneService) -> std::io::Result<()> {
    loop {
        let (mut socket, peer) = listener.accept().await?;
        let service = service.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(&service, &mut socket).await {
                tracing::warn!(%peer, error = %e, "Connection error");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Liveness, Progress};
    use crate::testing::{self, Harness, StaticFactory};
    use at_store::JobStore;
    use std::sync::Arc;

    fn service() -> (AutoTuneService, Harness) {
        let h = Harness::new();
        let service = AutoTuneService::new(
            h.store.clone(),
            h.catalog.clone(),
            testing::predictor(),
            Arc::new(StaticFactory(h.delegates())),
        )
        .with_liveness(Liveness::new())
        .with_search_space(testing::small_space());
        (service, h)
    }

    #[tokio::test]
    async fn health() {
        let (service, _h) = service();
        let response = route(&service, "GET", "/health", b"").await;
        assert_eq!(response.status, 200);
        assert_eq!(response.body["status"], "ok");
    }

    #[tokio::test]
    async fn run_then_poll() {
        let (service, h) = service();
        let body = json!({
            "dataset_id": h.dataset.id,
            "benchmark_id": h.benchmark.id,
            "top_k": 1,
        })
        .to_string();

        let started = route(&service, "POST", "/autotune/run", body.as_bytes()).await;
        assert_eq!(started.status, 200, "{}", started.body);
        assert_eq!(started.body["status"], "pending");
        let id: Uuid = serde_json::from_value(started.body["job_id"].clone()).unwrap();

        service.wait(id).await.unwrap();
        let polled = route(&service, "GET", &format!("/autotune/{id}"), b"").await;
        assert_eq!(polled.status, 200);
        assert_eq!(polled.body["job"]["status"], "completed");
        assert!(polled.body["message"].as_str().unwrap().starts_with("Complete!"));

        let listed = route(&service, "GET", "/autotune/", b"").await;
        assert_eq!(listed.body["jobs"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn errors_map_to_status_codes() {
        let (service, h) = service();

        let missing = route(&service, "GET", &format!("/autotune/{}", Uuid::new_v4()), b"").await;
        assert_eq!(missing.status, 404);
        assert_eq!(missing.body["detail"], "AutoTune job not found");

        let bad_id = route(&service, "GET", "/autotune/not-a-uuid", b"").await;
        assert_eq!(bad_id.status, 400);

        let bad_body = route(&service, "POST", "/autotune/run", b"{").await;
        assert_eq!(bad_body.status, 400);

        let bad_top_k = json!({ "dataset_id": h.dataset.id, "benchmark_id": h.benchmark.id, "top_k": 0 });
        let rejected = route(&service, "POST", "/autotune/run", bad_top_k.to_string().as_bytes()).await;
        assert_eq!(rejected.status, 400);

        let deleted = route(&service, "DELETE", &format!("/autotune/{}", Uuid::new_v4()), b"").await;
        assert_eq!(deleted.status, 404);

        let target = format!("/compute-targets/{}/test", Uuid::new_v4());
        let unknown_target = route(&service, "POST", &target, b"").await;
        assert_eq!(unknown_target.status, 404);
        assert_eq!(unknown_target.body["detail"], "Compute target not found");

        assert_eq!(route(&service, "PUT", "/autotune", b"").await.status, 405);
        assert_eq!(route(&service, "GET", "/metrics", b"").await.status, 404);
    }

    #[tokio::test]
    async fn delete_and_progress_routes() {
        let (service, h) = service();
        let job = h.pending_job(1);
        let deleted = route(&service, "DELETE", &format!("/autotune/{}", job.id), b"").await;
        assert_eq!(deleted.status, 200);
        assert_eq!(deleted.body["status"], "deleted");
        assert!(JobStore::get(&h.store, job.id).unwrap().is_none());

        let experiment = Uuid::new_v4();
        let path = format!("/experiments/{experiment}/progress");
        assert_eq!(route(&service, "GET", &path, b"").await.status, 404);
        service.liveness().progress.report(
            experiment,
            Progress {
                global_step: 4,
                epoch: 0.5,
                max_steps: 8,
            },
        );
        let progress = route(&service, "GET", &path, b"").await;
        assert_eq!(progress.body["global_step"], 4);
    }

    #[test]
    fn http_rendering() {
        let response = ApiResponse::error(404, "Not found");
        let text = response.to_http();
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.ends_with(r#"{"detail":"Not found"}"#));
        assert_eq!(find_header_end(b"GET / HTTP/1.1\r\nHost: x\r\n\r\nbody"), Some(27));
    }
}
