//! Blocking HTTP client for the Knack REST API (record listing only).
//!
//! - Uses `ureq` (no async).
//! - Authenticates every request with the application id / REST API key headers.
//! - Paces page requests to a configured rate and retries throttled (429),
//!   server-side (5xx) and transport failures with jittered exponential backoff.

use http::StatusCode;
use log::{debug, warn};
use rand::Rng;
use serde::de::DeserializeOwned;
use std::cell::Cell;
use std::num::NonZeroU32;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::{KnackCredentials, MAX_ROWS_PER_PAGE};
use crate::models::knack::RecordPage;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(500);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);
// 1000 rich records comfortably fit; ureq's default cap is 10 MiB.
const MAX_BODY_BYTES: u64 = 64 * 1024 * 1024;

#[derive(Debug)]
pub enum KnackClientError {
    Transport(String),
    Http { status: u16, message: String },
    RateLimited { retry_after: Option<Duration> },
    Json { path: String, message: String },
    InvalidRequest(String),
}

impl KnackClientError {
    fn is_retryable(&self) -> bool {
        match self {
            KnackClientError::Transport(_) | KnackClientError::RateLimited { .. } => true,
            KnackClientError::Http { status, .. } => *status >= 500,
            KnackClientError::Json { .. } | KnackClientError::InvalidRequest(_) => false,
        }
    }
}

impl core::fmt::Display for KnackClientError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            KnackClientError::Transport(s) => write!(f, "transport error: {}", s),
            KnackClientError::Http { status, message } => write!(f, "http {}: {}", status, message),
            KnackClientError::RateLimited { retry_after } => match retry_after {
                Some(d) => write!(f, "rate limited (retry after {}s)", d.as_secs()),
                None => write!(f, "rate limited"),
            },
            KnackClientError::Json { path, message } => write!(f, "json error at {}: {}", path, message),
            KnackClientError::InvalidRequest(s) => write!(f, "invalid request: {}", s),
        }
    }
}

impl std::error::Error for KnackClientError {}

/// Source of record pages; the sync only depends on this.
pub trait RecordSource {
    fn fetch_page(&self, object: &str, page: u32, rows_per_page: NonZeroU32) -> Result<RecordPage, KnackClientError>;
}

pub struct KnackClient {
    agent: ureq::Agent,
    base_url: String,
    app_id: String,
    api_key: String,
    max_retries: u32,
    retry_base_delay: Duration,
    min_spacing: Option<Duration>,
    last_request: Cell<Option<Instant>>,
}

impl KnackClient {
    pub fn new(
        base_url: impl Into<String>,
        credentials: &KnackCredentials,
        max_retries: u32,
        requests_per_second: Option<NonZeroU32>,
    ) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(Some(REQUEST_TIMEOUT))
            .build()
            .into();

        KnackClient {
            agent,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            app_id: credentials.app_id.clone(),
            api_key: credentials.api_key.clone(),
            max_retries,
            retry_base_delay: DEFAULT_RETRY_BASE_DELAY,
            min_spacing: requests_per_second.map(|limit| Duration::from_secs_f64(1.0 / limit.get() as f64)),
            last_request: Cell::new(None),
        }
    }

    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    fn wait_for_slot(&self) {
        if let (Some(spacing), Some(last)) = (self.min_spacing, self.last_request.get()) {
            let elapsed = last.elapsed();
            if elapsed < spacing {
                thread::sleep(spacing - elapsed);
            }
        }
        self.last_request.set(Some(Instant::now()));
    }

    fn backoff(&self, attempt: u32, err: &KnackClientError) -> Duration {
        if let KnackClientError::RateLimited {
            retry_after: Some(after),
        } = err
        {
            return (*after).min(MAX_RETRY_DELAY);
        }
        let exp = self.retry_base_delay.saturating_mul(1u32 << attempt.min(6));
        let jitter_ms = if self.retry_base_delay.is_zero() {
            0
        } else {
            rand::rng().random_range(0..=self.retry_base_delay.as_millis() as u64 / 2)
        };
        (exp + Duration::from_millis(jitter_ms)).min(MAX_RETRY_DELAY)
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T, KnackClientError> {
        let mut attempt = 0;
        loop {
            match self.get_json_once(path, query) {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let delay = self.backoff(attempt, &e);
                    attempt += 1;
                    warn!(
                        "GET {} failed ({}); retry {}/{} in {}ms",
                        path,
                        e,
                        attempt,
                        self.max_retries,
                        delay.as_millis()
                    );
                    thread::sleep(delay);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn get_json_once<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T, KnackClientError> {
        self.wait_for_slot();

        let url = self.url(path);
        let mut req = self
            .agent
            .get(&url)
            .header("Accept", "application/json")
            .header("X-Knack-Application-Id", self.app_id.as_str())
            .header("X-Knack-REST-API-Key", self.api_key.as_str());
        for (k, v) in query {
            req = req.query(k, v);
        }

        let mut res = req.call().map_err(|e| KnackClientError::Transport(e.to_string()))?;
        let status = res.status();
        let retry_after = res
            .headers()
            .get(http::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = res
            .body_mut()
            .with_config()
            .limit(MAX_BODY_BYTES)
            .read_to_string()
            .map_err(|e| KnackClientError::Transport(e.to_string()))?;

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(KnackClientError::RateLimited { retry_after });
        }
        if !status.is_success() {
            let message = if body.trim().is_empty() { String::from("<no body>") } else { body };
            return Err(KnackClientError::Http {
                status: status.as_u16(),
                message,
            });
        }

        debug!("GET {} -> {} ({} bytes)", path, status.as_u16(), body.len());
        let de = &mut serde_json::Deserializer::from_str(&body);
        serde_path_to_error::deserialize(de).map_err(|e| KnackClientError::Json {
            path: e.path().to_string(),
            message: e.inner().to_string(),
        })
    }
}

impl RecordSource for KnackClient {
    fn fetch_page(&self, object: &str, page: u32, rows_per_page: NonZeroU32) -> Result<RecordPage, KnackClientError> {
        if page == 0 {
            return Err(KnackClientError::InvalidRequest("pages are 1-based".to_string()));
        }
        if rows_per_page.get() > MAX_ROWS_PER_PAGE {
            return Err(KnackClientError::InvalidRequest(format!(
                "rows_per_page {} exceeds {}",
                rows_per_page, MAX_ROWS_PER_PAGE
            )));
        }
        self.get_json(
            &format!("/objects/{}/records", object),
            &[
                ("page", page.to_string()),
                ("rows_per_page", rows_per_page.to_string()),
                ("format", "both".to_string()),
            ],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn credentials() -> KnackCredentials {
        KnackCredentials {
            app_id: "app-123".to_string(),
            api_key: "key-456".to_string(),
        }
    }

    fn client(server: &MockServer, retries: u32) -> KnackClient {
        KnackClient::new(server.base_url(), &credentials(), retries, None).with_retry_base_delay(Duration::ZERO)
    }

    fn rows(n: u32) -> NonZeroU32 {
        NonZeroU32::new(n).unwrap()
    }

    #[test]
    fn fetches_a_page_with_auth_headers() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/objects/object_2/records")
                .query_param("page", "2")
                .query_param("rows_per_page", "100")
                .header("X-Knack-Application-Id", "app-123")
                .header("X-Knack-REST-API-Key", "key-456");
            then.status(200).json_body(json!({
                "total_pages": 2,
                "current_page": 2,
                "total_records": 101,
                "records": [{ "id": "est1", "field_44": "Example College" }]
            }));
        });

        let page = client(&server, 0).fetch_page("object_2", 2, rows(100)).unwrap();
        mock.assert();
        assert!(page.is_last());
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.records[0].text("field_44").as_deref(), Some("Example College"));
    }

    #[test]
    fn retries_server_errors_then_gives_up() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/objects/object_10/records");
            then.status(503).body("maintenance");
        });

        let err = client(&server, 2).fetch_page("object_10", 1, rows(500)).unwrap_err();
        mock.assert_calls(3);
        match err {
            KnackClientError::Http { status, message } => {
                assert_eq!(status, 503);
                assert_eq!(message, "maintenance");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn does_not_retry_client_errors() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/objects/object_10/records");
            then.status(401).body("{\"errors\":[\"Invalid API key\"]}");
        });

        let err = client(&server, 3).fetch_page("object_10", 1, rows(500)).unwrap_err();
        mock.assert_calls(1);
        assert!(matches!(err, KnackClientError::Http { status: 401, .. }));
    }

    #[test]
    fn rate_limit_is_retryable() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/objects/object_29/records");
            then.status(429).header("Retry-After", "0");
        });

        let err = client(&server, 1).fetch_page("object_29", 1, rows(1000)).unwrap_err();
        mock.assert_calls(2);
        assert!(matches!(err, KnackClientError::RateLimited { .. }));
    }

    #[test]
    fn reports_json_path_on_bad_payload() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/objects/object_2/records");
            then.status(200).json_body(json!({
                "total_pages": 1,
                "current_page": 1,
                "total_records": 1,
                "records": [{ "no_id": true }]
            }));
        });

        let err = client(&server, 0).fetch_page("object_2", 1, rows(100)).unwrap_err();
        match err {
            KnackClientError::Json { path, .. } => assert!(path.starts_with("records[0]"), "{}", path),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn rejects_invalid_paging_without_calling_api() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET);
            then.status(200);
        });
        let c = client(&server, 0);
        assert!(matches!(
            c.fetch_page("object_2", 0, rows(100)),
            Err(KnackClientError::InvalidRequest(_))
        ));
        assert!(matches!(
            c.fetch_page("object_2", 1, rows(1001)),
            Err(KnackClientError::InvalidRequest(_))
        ));
        mock.assert_calls(0);
    }
}
