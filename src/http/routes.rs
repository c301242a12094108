//! Request routing and JSON encoding.

use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use hyper::{Method, Request, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{error, warn};

use crate::admission::{IdentifierType, LimitConfig};
use crate::api::{
    CancelResponse, CheckRequest, EnqueueRequest, ErrorBody, KeyRequest, QueueRef,
    ReleaseRequest, ReleaseResponse, ResetResponse,
};
use crate::error::AdmissionError;
use crate::metrics::MetricsFilter;
use crate::service::AdmissionService;

type HttpResult = Result<Response<Full<Bytes>>, AdmissionError>;

/// Handle one HTTP request. Every failure becomes a JSON error response.
pub async fn handle_request<B>(req: Request<B>, service: &AdmissionService) -> Response<Full<Bytes>>
where
    B: Body,
    B::Error: std::fmt::Display,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    match route(req, service).await {
        Ok(response) => response,
        Err(e) => {
            match &e {
                AdmissionError::Validation(_) | AdmissionError::QueueFull { .. } => {
                    warn!(method = %method, path = %path, error = %e, "Request rejected")
                }
                AdmissionError::NotFound(_) => {}
                _ => error!(method = %method, path = %path, error = %e, "Request failed"),
            }
            error_response(&e)
        }
    }
}

async fn route<B>(req: Request<B>, service: &AdmissionService) -> HttpResult
where
    B: Body,
    B::Error: std::fmt::Display,
{
    let query = parse_query(req.uri().query());
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    match (method, path.as_str()) {
        (Method::GET, "/healthz") => json(StatusCode::OK, &serde_json::json!({ "status": "ok" })),

        (Method::PUT, "/config") => {
            let config: LimitConfig = read_json(req).await?;
            let stored = service.put_config(config).await?;
            json(StatusCode::OK, &stored)
        }
        (Method::GET, "/config") => {
            let key = key_from_query(&query)?;
            json(StatusCode::OK, &service.get_config(&key).await?)
        }

        (Method::POST, "/check") => {
            let check: CheckRequest = read_json(req).await?;
            json(StatusCode::OK, &service.check(&check).await?)
        }

        (Method::POST, "/queue") => {
            let enqueue: EnqueueRequest = read_json(req).await?;
            json(StatusCode::OK, &service.enqueue(&enqueue).await?)
        }
        (Method::GET, "/queue/status") => {
            let queue_ref = queue_ref_from_query(&query)?;
            json(StatusCode::OK, &service.queue_status(&queue_ref).await?)
        }
        (Method::GET, "/queue/outcome") => {
            let queue_ref = queue_ref_from_query(&query)?;
            json(StatusCode::OK, &service.queue_outcome(&queue_ref).await?)
        }
        (Method::POST, "/queue/cancel") => {
            let queue_ref: QueueRef = read_json(req).await?;
            let cancelled = service.cancel(&queue_ref).await?;
            json(StatusCode::OK, &CancelResponse { cancelled })
        }

        (Method::POST, "/release") => {
            let release: ReleaseRequest = read_json(req).await?;
            let concurrent_in_flight = service.release(&release).await?;
            json(StatusCode::OK, &ReleaseResponse { concurrent_in_flight })
        }

        (Method::GET, "/metrics") => {
            let filter = MetricsFilter {
                identifier: query.get("identifier").cloned(),
                identifier_type: query
                    .get("identifierType")
                    .map(|t| t.parse::<IdentifierType>())
                    .transpose()?,
            };
            json(StatusCode::OK, &service.metrics(&filter))
        }

        (Method::POST, "/reset") => {
            let key: KeyRequest = read_json(req).await?;
            let discarded_entries = service.reset_state(&key).await?;
            json(
                StatusCode::OK,
                &ResetResponse {
                    reset: true,
                    discarded_entries,
                },
            )
        }

        (
            _,
            "/healthz" | "/config" | "/check" | "/queue" | "/queue/status" | "/queue/outcome"
            | "/queue/cancel" | "/release" | "/metrics" | "/reset",
        ) => Ok(plain(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed")),

        _ => Ok(plain(StatusCode::NOT_FOUND, "Not Found")),
    }
}

fn parse_query(query: Option<&str>) -> HashMap<String, String> {
    query
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default()
}

fn required<'a>(query: &'a HashMap<String, String>, name: &str) -> Result<&'a str, AdmissionError> {
    query
        .get(name)
        .map(String::as_str)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| AdmissionError::Validation(format!("query parameter '{}' is required", name)))
}

fn key_from_query(query: &HashMap<String, String>) -> Result<KeyRequest, AdmissionError> {
    Ok(KeyRequest {
        identifier: required(query, "identifier")?.to_string(),
        identifier_type: required(query, "identifierType")?.parse()?,
    })
}

fn queue_ref_from_query(query: &HashMap<String, String>) -> Result<QueueRef, AdmissionError> {
    let key = key_from_query(query)?;
    Ok(QueueRef {
        identifier: key.identifier,
        identifier_type: key.identifier_type,
        request_id: required(query, "requestId")?.to_string(),
    })
}

async fn read_json<B, T>(req: Request<B>) -> Result<T, AdmissionError>
where
    B: Body,
    B::Error: std::fmt::Display,
    T: DeserializeOwned,
{
    let bytes = req
        .into_body()
        .collect()
        .await
        .map_err(|e| AdmissionError::Validation(format!("failed to read body: {}", e)))?
        .to_bytes();
    serde_json::from_slice(&bytes)
        .map_err(|e| AdmissionError::Validation(format!("invalid JSON body: {}", e)))
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> HttpResult {
    let body = serde_json::to_vec(value)
        .map_err(|e| AdmissionError::Internal(format!("failed to encode response: {}", e)))?;
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(response)
}

fn plain(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}

fn error_response(err: &AdmissionError) -> Response<Full<Bytes>> {
    let (status, code, retry_after) = match err {
        AdmissionError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error", None),
        AdmissionError::QueueFull { retry_after, .. } => {
            (StatusCode::CONFLICT, "queue_full", Some(*retry_after))
        }
        AdmissionError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found", None),
        AdmissionError::Internal(_) | AdmissionError::Config(_) | AdmissionError::Io(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", None)
        }
    };

    let body = ErrorBody {
        error: code.to_string(),
        message: err.to_string(),
        retry_after_ms: retry_after.map(|d| d.as_millis() as u64),
    };
    let mut response = match json(status, &body) {
        Ok(response) => response,
        Err(_) => plain(status, "error"),
    };
    if let Some(retry_after) = retry_after {
        // Whole seconds, rounded up
        let secs = retry_after.as_millis().div_ceil(1000).max(1) as u64;
        response
            .headers_mut()
            .insert(RETRY_AFTER, HeaderValue::from(secs));
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;

    fn service() -> AdmissionService {
        service_with_clock().0
    }

    fn service_with_clock() -> (AdmissionService, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_millis(1_700_000_000_000));
        let service = AdmissionService::in_memory(clock.clone(), Duration::from_millis(100));
        (service, clock)
    }

    fn request(method: Method, uri: &str, body: Option<Value>) -> Request<Full<Bytes>> {
        let bytes = body
            .map(|b| Bytes::from(serde_json::to_vec(&b).unwrap()))
            .unwrap_or_default();
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Full::new(bytes))
            .unwrap()
    }

    async fn call(service: &AdmissionService, req: Request<Full<Bytes>>) -> (StatusCode, Value) {
        let response = handle_request(req, service).await;
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_healthz() {
        let service = service();
        let (status, body) = call(&service, request(Method::GET, "/healthz", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_config_round_trip_and_missing() {
        let service = service();
        let (status, _) = call(
            &service,
            request(
                Method::PUT,
                "/config",
                Some(json!({
                    "identifier": "u1",
                    "identifierType": "user",
                    "limits": {"perSecond": 2},
                    "burstAllowance": 0,
                    "queuePolicy": {"enabled": true, "maxQueueSize": 5, "maxWaitMs": 1000},
                    "priority": "normal"
                })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(
            &service,
            request(Method::GET, "/config?identifier=u1&identifierType=user", None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["limits"]["perSecond"], 2);

        let (status, body) = call(
            &service,
            request(Method::GET, "/config?identifier=nobody&identifierType=user", None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.is_null());
    }

    #[tokio::test]
    async fn test_invalid_config_is_bad_request() {
        let service = service();
        let (status, body) = call(
            &service,
            request(
                Method::PUT,
                "/config",
                Some(json!({"identifier": "u1", "identifierType": "user", "limits": {"perMinute": 0}})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "validation_error");

        let (status, _) = call(
            &service,
            request(Method::PUT, "/config", Some(json!({"identifierType": "robot"}))),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_check_sequence() {
        let service = service();
        call(
            &service,
            request(
                Method::PUT,
                "/config",
                Some(json!({"identifier": "u1", "identifierType": "user", "limits": {"perSecond": 2}})),
            ),
        )
        .await;

        let mut allowed = Vec::new();
        let mut last = Value::Null;
        for _ in 0..3 {
            let (status, body) = call(
                &service,
                request(
                    Method::POST,
                    "/check",
                    Some(json!({"identifier": "u1", "identifierType": "user", "requestWeight": 1, "operation": "get"})),
                ),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            allowed.push(body["allowed"].as_bool().unwrap());
            last = body;
        }

        assert_eq!(allowed, vec![true, true, false]);
        assert!(last["retryAfterMs"].as_u64().unwrap() <= 1000);
    }

    #[tokio::test]
    async fn test_queue_full_is_conflict_with_retry_hint() {
        let service = service();
        call(
            &service,
            request(
                Method::PUT,
                "/config",
                Some(json!({
                    "identifier": "k1",
                    "identifierType": "api_key",
                    "queuePolicy": {"enabled": true, "maxQueueSize": 1, "maxWaitMs": 5000}
                })),
            ),
        )
        .await;

        let enqueue = |id: &str| {
            request(
                Method::POST,
                "/queue",
                Some(json!({"identifier": "k1", "identifierType": "api_key", "requestId": id, "operation": "upload", "priority": "high"})),
            )
        };

        let (status, body) = call(&service, enqueue("r1")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["position"], 1);
        assert_eq!(body["estimatedWaitMs"], 100);

        let response = handle_request(enqueue("r2"), &service).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(response.headers()[RETRY_AFTER], "1");

        let (status, body) = call(
            &service,
            request(
                Method::GET,
                "/queue/status?requestId=r1&identifier=k1&identifierType=api_key",
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["queueSize"], 1);

        let (_, body) = call(
            &service,
            request(
                Method::POST,
                "/queue/cancel",
                Some(json!({"identifier": "k1", "identifierType": "api_key", "requestId": "r1"})),
            ),
        )
        .await;
        assert_eq!(body["cancelled"], true);

        let (status, body) = call(
            &service,
            request(
                Method::GET,
                "/queue/status?requestId=r1&identifier=k1&identifierType=api_key",
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.is_null());
    }

    #[tokio::test]
    async fn test_queue_outcome_reports_admitted_and_expired() {
        let (service, clock) = service_with_clock();
        call(
            &service,
            request(
                Method::PUT,
                "/config",
                Some(json!({"identifier": "u1", "identifierType": "user", "limits": {"concurrent": 5}})),
            ),
        )
        .await;

        let enqueue = |id: &str| {
            request(
                Method::POST,
                "/queue",
                Some(json!({"identifier": "u1", "identifierType": "user", "requestId": id, "operation": "op", "maxWaitMs": 100})),
            )
        };
        let outcome = |id: &str| {
            request(
                Method::GET,
                &format!("/queue/outcome?requestId={}&identifier=u1&identifierType=user", id),
                None,
            )
        };

        call(&service, enqueue("admitted")).await;
        service.scheduler().drain_once().await;
        for _ in 0..4 {
            let (_, body) = call(
                &service,
                request(Method::POST, "/check", Some(json!({"identifier": "u1", "identifierType": "user"}))),
            )
            .await;
            assert_eq!(body["allowed"], true);
        }

        call(&service, enqueue("expired")).await;
        clock.advance(Duration::from_millis(200));
        service.scheduler().drain_once().await;

        let (status, admitted) = call(&service, outcome("admitted")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(admitted["status"], "admitted");
        let (_, expired) = call(&service, outcome("expired")).await;
        assert_eq!(expired["status"], "expired");
        assert_ne!(admitted["status"], expired["status"]);

        // Both have left the queue.
        let (_, body) = call(
            &service,
            request(
                Method::GET,
                "/queue/status?requestId=expired&identifier=u1&identifierType=user",
                None,
            ),
        )
        .await;
        assert!(body.is_null());

        let (_, body) = call(&service, outcome("unknown")).await;
        assert!(body.is_null());
    }

    #[tokio::test]
    async fn test_metrics_reset_and_release() {
        let service = service();
        let check = json!({"identifier": "10.0.0.1", "identifierType": "ip"});
        call(&service, request(Method::POST, "/check", Some(check.clone()))).await;

        let (_, body) = call(
            &service,
            request(Method::POST, "/release", Some(json!({"identifier": "10.0.0.1", "identifierType": "ip"}))),
        )
        .await;
        assert_eq!(body["concurrentInFlight"], 0);

        let (status, body) = call(
            &service,
            request(Method::GET, "/metrics?identifierType=ip", None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["totals"]["allowed"], 1);
        assert_eq!(body["identifiers"][0]["identifier"], "10.0.0.1");

        let (status, body) = call(&service, request(Method::POST, "/reset", Some(check))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["reset"], true);
    }

    #[tokio::test]
    async fn test_missing_query_and_unknown_routes() {
        let service = service();
        let (status, _) = call(&service, request(Method::GET, "/config?identifier=u1", None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&service, request(Method::GET, "/metrics?identifierType=robot", None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let response = handle_request(request(Method::GET, "/nope", None), &service).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = handle_request(request(Method::DELETE, "/check", None), &service).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_malformed_json_is_bad_request() {
        let service = service();
        let req = Request::builder()
            .method(Method::POST)
            .uri("/check")
            .body(Full::new(Bytes::from_static(b"{not json")))
            .unwrap();
        let (status, body) = call(&service, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "validation_error");
    }
}
