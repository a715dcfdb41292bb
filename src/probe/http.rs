//! HTTP probe implementation.

use super::{Anomaly, ConfigError, Outcome, Probe, ProbeError, TargetConfig};
use crate::db::TargetId;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{redirect, Method, Url};
use std::collections::HashMap;
use std::error::Error as StdError;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

const ALLOWED_METHODS: [&str; 4] = ["GET", "POST", "PUT", "DELETE"];
const MAX_REDIRECTS: usize = 10;

/// Checks an HTTP endpoint and classifies the response.
pub struct HttpProbe {
    target_id: TargetId,
    client: reqwest::Client,
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Option<serde_json::Value>,
    expected_response_code: Option<u16>,
    expected_content_pattern: Option<String>,
    latency_threshold: Duration,
    error_mapping: HashMap<String, String>,
}

/// [`ProbeConstructor`](super::ProbeConstructor) for `"http"` targets.
pub fn build_http_probe(config: &TargetConfig) -> Result<Arc<dyn Probe>, ConfigError> {
    Ok(Arc::new(HttpProbe::new(config)?))
}

impl HttpProbe {
    /// Validate the target's HTTP settings and build its client.
    pub fn new(config: &TargetConfig) -> Result<Self, ConfigError> {
        let url = parse_endpoint(&config.endpoint)?;
        let method = parse_method(config.method.as_deref())?;

        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| ConfigError::InvalidHeader(name.clone()))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| ConfigError::InvalidHeader(name.as_str().to_string()))?;
            headers.insert(name, value);
        }

        // A body that is not a JSON document is sent as a JSON string.
        let body = config.request_body.as_ref().map(|raw| {
            serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.clone()))
        });

        let client = reqwest::Client::builder()
            .timeout(config.check_timeout)
            .redirect(redirect::Policy::limited(MAX_REDIRECTS))
            .user_agent(concat!("statuswatch/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            target_id: config.id,
            client,
            method,
            url,
            headers,
            body,
            expected_response_code: config.expected_response_code,
            expected_content_pattern: config.expected_content_pattern.clone(),
            latency_threshold: Duration::from_millis(config.latency_threshold_ms),
            error_mapping: config.error_mapping.clone(),
        })
    }

    /// Classify a 2xx response.
    ///
    /// Latency wins over status code, which wins over content.
    pub fn classify_response(&self, status: u16, latency: Duration, body: &str) -> Outcome {
        if latency > self.latency_threshold {
            return Anomaly::degraded("High latency").into();
        }

        if let Some(expected) = self.expected_response_code {
            if status != expected {
                return Anomaly::partial_outage("Unexpected status code").into();
            }
        }

        if let Some(pattern) = &self.expected_content_pattern {
            if !body.contains(pattern.as_str()) {
                return Anomaly::partial_outage("Unexpected response content").into();
            }
        }

        Outcome::Healthy
    }

    /// Classify a non-2xx response.
    pub fn classify_status(&self, status: u16) -> Anomaly {
        let message = self
            .error_mapping
            .get(&status.to_string())
            .cloned()
            .unwrap_or_else(|| format!("Service failed with status code {}", status));

        match status {
            500..=599 => Anomaly::major_outage(message),
            _ => Anomaly::partial_outage(message),
        }
    }

    fn classify_error(&self, err: &reqwest::Error) -> Anomaly {
        if err.is_timeout() {
            return Anomaly::service_timeout();
        }

        if err.is_redirect() {
            return Anomaly::partial_outage("Too many redirects");
        }

        if let Some(io_err) = find_io_error(err) {
            if is_resource_exhaustion(io_err) {
                return Anomaly::major_outage("Connection pool exhausted");
            }
            if matches!(
                io_err.kind(),
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
            ) {
                return Anomaly::major_outage("Connection error");
            }
        }

        if err.is_connect() {
            return Anomaly::major_outage("Connection error");
        }

        tracing::warn!("Unexpected HTTP failure for target {}: {}", self.target_id, err);
        Anomaly::service_unavailable()
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn check(&self) -> Result<Outcome, ProbeError> {
        let mut request = self
            .client
            .request(self.method.clone(), self.url.clone())
            .headers(self.headers.clone());
        if let Some(body) = &self.body {
            request = request.json(body);
        }

        let start = Instant::now();

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) if e.is_builder() => return Err(ProbeError::Request(e.to_string())),
            Err(e) => return Ok(self.classify_error(&e).into()),
        };

        let status = response.status().as_u16();
        if !response.status().is_success() {
            tracing::debug!(
                target_id = self.target_id,
                endpoint = %self.url,
                status,
                "HTTP check returned error status"
            );
            return Ok(self.classify_status(status).into());
        }

        // Read the full body to measure complete transfer time
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => return Ok(self.classify_error(&e).into()),
        };
        let latency = start.elapsed();

        tracing::debug!(
            target_id = self.target_id,
            endpoint = %self.url,
            status,
            latency_ms = latency.as_millis() as u64,
            "HTTP check completed"
        );

        Ok(self.classify_response(status, latency, &body))
    }
}

fn parse_endpoint(endpoint: &str) -> Result<Url, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason: reason.to_string(),
    };

    let url = Url::parse(endpoint).map_err(|e| invalid(&e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid("scheme must be http or https"));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(invalid("missing host"));
    }
    Ok(url)
}

fn parse_method(method: Option<&str>) -> Result<Method, ConfigError> {
    let method = method.unwrap_or("GET").trim().to_ascii_uppercase();
    if !ALLOWED_METHODS.contains(&method.as_str()) {
        return Err(ConfigError::InvalidMethod(method));
    }
    Method::from_bytes(method.as_bytes()).map_err(|_| ConfigError::InvalidMethod(method))
}

/// Walk the source chain looking for the underlying socket error.
fn find_io_error<'a>(err: &'a (dyn StdError + 'static)) -> Option<&'a io::Error> {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            return Some(io_err);
        }
        current = e.source();
    }
    None
}

/// No local port left, or out of file descriptors (ENFILE / EMFILE).
fn is_resource_exhaustion(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::AddrNotAvailable || matches!(err.raw_os_error(), Some(23 | 24))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorDefaults;
    use crate::db::{IncidentCategory, TargetDef};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn config_for(endpoint: &str) -> TargetConfig {
        let def = TargetDef {
            id: 1,
            endpoint: endpoint.to_string(),
            check_timeout_secs: 2.0,
            ..Default::default()
        };
        TargetConfig::from_def(&def, &MonitorDefaults::default())
    }

    /// Serve the same canned response to every connection.
    async fn serve(
        status_line: &'static str,
        extra_headers: &'static str,
        body: &'static str,
        delay: Duration,
    ) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let _ = socket.read(&mut buf).await;
                    tokio::time::sleep(delay).await;
                    let response = format!(
                        "HTTP/1.1 {}\r\n{}Content-Length: {}\r\nConnection: close\r\n\r\n{}",
                        status_line,
                        extra_headers,
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        format!("http://{}/health", addr)
    }

    async fn check(config: &TargetConfig) -> Outcome {
        HttpProbe::new(config).unwrap().check().await.unwrap()
    }

    #[test]
    fn test_slow_success_is_degraded() {
        let probe = HttpProbe::new(&config_for("http://127.0.0.1/")).unwrap();
        let outcome = probe.classify_response(200, Duration::from_millis(1500), "ok");
        assert_eq!(outcome, Anomaly::degraded("High latency").into());
        assert_eq!(
            probe.classify_response(200, Duration::from_millis(20), "ok"),
            Outcome::Healthy
        );
    }

    #[test]
    fn test_latency_takes_priority_over_content() {
        let mut config = config_for("http://127.0.0.1/");
        config.expected_response_code = Some(204);
        config.expected_content_pattern = Some("ready".to_string());
        let probe = HttpProbe::new(&config).unwrap();

        let slow = probe.classify_response(200, Duration::from_secs(2), "");
        assert_eq!(slow.anomaly().unwrap().category, IncidentCategory::Degraded);

        let wrong_code = probe.classify_response(200, Duration::ZERO, "");
        assert_eq!(wrong_code, Anomaly::partial_outage("Unexpected status code").into());

        let wrong_body = probe.classify_response(204, Duration::ZERO, "starting");
        assert_eq!(wrong_body, Anomaly::partial_outage("Unexpected response content").into());

        assert_eq!(probe.classify_response(204, Duration::ZERO, "ready"), Outcome::Healthy);
    }

    #[test]
    fn test_error_mapping_replaces_message_not_category() {
        let mut config = config_for("http://127.0.0.1/");
        config.error_mapping =
            HashMap::from([("503".to_string(), "Scheduled maintenance".to_string())]);
        let probe = HttpProbe::new(&config).unwrap();

        assert_eq!(
            probe.classify_status(503),
            Anomaly::major_outage("Scheduled maintenance")
        );
        assert_eq!(
            probe.classify_status(502),
            Anomaly::major_outage("Service failed with status code 502")
        );
        assert_eq!(
            probe.classify_status(404).category,
            IncidentCategory::PartialOutage
        );
        assert_eq!(
            probe.classify_status(304).category,
            IncidentCategory::PartialOutage
        );
    }

    #[test]
    fn test_invalid_settings_are_rejected() {
        assert!(matches!(
            HttpProbe::new(&config_for("ftp://example.com/")),
            Err(ConfigError::InvalidEndpoint { .. })
        ));
        assert!(matches!(
            HttpProbe::new(&config_for("not a url")),
            Err(ConfigError::InvalidEndpoint { .. })
        ));

        let mut config = config_for("https://example.com/");
        config.method = Some("PATCH".to_string());
        assert!(matches!(HttpProbe::new(&config), Err(ConfigError::InvalidMethod(_))));

        let mut config = config_for("https://example.com/");
        config.method = Some("post".to_string());
        assert!(HttpProbe::new(&config).is_ok());

        let mut config = config_for("https://example.com/");
        config.headers = HashMap::from([("bad header".to_string(), "x".to_string())]);
        assert!(matches!(HttpProbe::new(&config), Err(ConfigError::InvalidHeader(_))));
    }

    #[tokio::test]
    async fn test_healthy_endpoint() {
        let endpoint = serve("200 OK", "", "status: ready", Duration::ZERO).await;
        let mut config = config_for(&endpoint);
        config.expected_content_pattern = Some("ready".to_string());

        assert_eq!(check(&config).await, Outcome::Healthy);
    }

    #[tokio::test]
    async fn test_missing_content_is_partial_outage() {
        let endpoint = serve("200 OK", "", "status: starting", Duration::ZERO).await;
        let mut config = config_for(&endpoint);
        config.expected_content_pattern = Some("ready".to_string());

        assert_eq!(
            check(&config).await,
            Anomaly::partial_outage("Unexpected response content").into()
        );
    }

    #[tokio::test]
    async fn test_server_error_is_major_outage() {
        let endpoint = serve("503 Service Unavailable", "", "", Duration::ZERO).await;
        let outcome = check(&config_for(&endpoint)).await;

        assert_eq!(
            outcome,
            Anomaly::major_outage("Service failed with status code 503").into()
        );
    }

    #[tokio::test]
    async fn test_client_error_is_partial_outage() {
        let endpoint = serve("404 Not Found", "", "", Duration::ZERO).await;
        let outcome = check(&config_for(&endpoint)).await;

        assert_eq!(
            outcome.anomaly().map(|a| a.category),
            Some(IncidentCategory::PartialOutage)
        );
    }

    #[tokio::test]
    async fn test_connection_refused_is_connection_error() {
        // Grab a free port, then close it so nothing is listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let outcome = check(&config_for(&format!("http://{}/", addr))).await;
        assert_eq!(outcome, Anomaly::major_outage("Connection error").into());
    }

    #[tokio::test]
    async fn test_slow_endpoint_times_out() {
        let endpoint = serve("200 OK", "", "late", Duration::from_secs(5)).await;
        let mut config = config_for(&endpoint);
        config.check_timeout = Duration::from_millis(200);

        assert_eq!(check(&config).await, Anomaly::service_timeout().into());
    }

    #[tokio::test]
    async fn test_redirect_loop_is_partial_outage() {
        let endpoint = serve("302 Found", "Location: /again\r\n", "", Duration::ZERO).await;

        assert_eq!(
            check(&config_for(&endpoint)).await,
            Anomaly::partial_outage("Too many redirects").into()
        );
    }
}
