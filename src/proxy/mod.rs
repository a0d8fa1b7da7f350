//! Gateway event <-> local HTTP translation
//!
//! Events arrive with the external routing prefix still on the path. The
//! translator strips it, replays the request against the loopback Grafana,
//! and turns the answer back into the gateway's response shape. It never
//! invents a response: if Grafana cannot be reached the error propagates.

mod event;
mod headers;

pub use event::{GatewayRequestEvent, GatewayResponse, RequestContext};
pub use headers::{case_variants, fold_headers};

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE,
    TRANSFER_ENCODING,
};
use reqwest::{redirect, Method, Url};

use crate::clock::SharedClock;
use crate::error::{GrafanaLambdaError, Result};

/// Forwarding knobs
#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// Base URL of the local server, without a trailing slash
    pub target: String,
    /// External prefix removed from inbound paths
    pub path_prefix: String,
    /// Total tries while the server is not yet accepting connections
    pub connect_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            target: "http://127.0.0.1:3000".to_string(),
            path_prefix: "/grafana".to_string(),
            connect_attempts: 20,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
        }
    }
}

/// Remove `prefix` from the front of `path` when it is a whole segment
pub fn strip_path_prefix<'a>(path: &'a str, prefix: &str) -> &'a str {
    let prefix = prefix.trim_end_matches('/');
    match path.strip_prefix(prefix) {
        Some("") => "/",
        Some(rest) if rest.starts_with('/') => rest,
        _ => path,
    }
}

/// Charset a response body should be decoded with, if it is text at all.
///
/// An explicit `charset` parameter wins; `text/*` without one falls back to
/// ISO-8859-1 (RFC 2616 default). Anything else is treated as binary.
pub fn declared_charset(headers: &HeaderMap) -> Option<String> {
    let content_type = headers.get(CONTENT_TYPE)?.to_str().ok()?;
    let mut parts = content_type.split(';');
    let mime = parts.next()?.trim();

    for param in parts {
        if let Some((key, value)) = param.split_once('=') {
            if key.trim().eq_ignore_ascii_case("charset") {
                let value = value.trim().trim_matches('"');
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }

    if mime.to_ascii_lowercase().starts_with("text/") {
        Some("ISO-8859-1".to_string())
    } else {
        None
    }
}

/// Convert a local response into the gateway's response shape
pub async fn translate_response(response: reqwest::Response) -> Result<GatewayResponse> {
    let status_code = response.status().as_u16();

    let mut headers = response.headers().clone();
    headers.remove(CONTENT_LENGTH);
    headers.remove(TRANSFER_ENCODING);

    let (body, is_base64_encoded) = match declared_charset(&headers) {
        Some(charset) => (response.text_with_charset(&charset).await?, false),
        None => (STANDARD.encode(response.bytes().await?), true),
    };

    tracing::debug!(status_code, is_base64_encoded, "Translated response");
    Ok(GatewayResponse {
        status_code,
        headers: fold_headers(&headers),
        body,
        is_base64_encoded,
    })
}

/// Replays gateway events against the loopback server
pub struct RequestTranslator {
    client: reqwest::Client,
    clock: SharedClock,
    settings: ProxySettings,
}

impl RequestTranslator {
    pub fn new(settings: ProxySettings, clock: SharedClock) -> Result<Self> {
        // Redirects belong to the external client.
        let client = reqwest::Client::builder()
            .redirect(redirect::Policy::none())
            .build()?;

        Ok(Self {
            client,
            clock,
            settings,
        })
    }

    /// Local URL for `event`: prefix stripped, query string reattached
    pub fn target_url(&self, event: &GatewayRequestEvent) -> Result<Url> {
        let path = strip_path_prefix(&event.path, &self.settings.path_prefix);
        let mut url = Url::parse(&format!(
            "{}{}",
            self.settings.target.trim_end_matches('/'),
            path
        ))
        .map_err(|e| GrafanaLambdaError::InvalidEvent(format!("bad path {}: {}", event.path, e)))?;

        let pairs = event.query_pairs();
        if !pairs.is_empty() {
            url.query_pairs_mut().extend_pairs(pairs);
        }
        Ok(url)
    }

    /// Forward `event` to the local server and translate the answer
    pub async fn forward(&self, event: &GatewayRequestEvent) -> Result<GatewayResponse> {
        let url = self.target_url(event)?;
        let method = Method::from_bytes(event.http_method.as_bytes()).map_err(|_| {
            GrafanaLambdaError::InvalidEvent(format!("bad method {}", event.http_method))
        })?;
        let headers = request_headers(event);
        let body = if event.is_base64_encoded {
            Some(STANDARD.decode(event.body.as_deref().unwrap_or_default())?)
        } else {
            None
        };

        tracing::info!(method = %method, url = %url, "Forwarding request");

        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut request = self
                .client
                .request(method.clone(), url.clone())
                .headers(headers.clone());
            if let Some(body) = &body {
                request = request.body(body.clone());
            }

            match request.send().await {
                Ok(response) => return translate_response(response).await,
                Err(e) if e.is_connect() && attempt < self.settings.connect_attempts => {
                    let backoff = self.backoff(attempt);
                    tracing::debug!(
                        attempt,
                        "Grafana not listening yet, retrying in {:?}",
                        backoff
                    );
                    self.clock.sleep(backoff).await;
                }
                Err(e) if e.is_connect() => {
                    return Err(GrafanaLambdaError::Unreachable {
                        url: url.to_string(),
                        attempts: attempt,
                        source: e,
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << (attempt.saturating_sub(1)).min(16);
        self.settings
            .initial_backoff
            .saturating_mul(factor)
            .min(self.settings.max_backoff)
    }
}

/// Event headers as a `HeaderMap`, minus what must be recomputed locally
fn request_headers(event: &GatewayRequestEvent) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in &event.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => tracing::debug!("Dropping unrepresentable header {}", name),
        }
    }
    headers.remove(CONTENT_LENGTH);
    // Bodies are passed through as-is; keep them uncompressed.
    headers.remove(ACCEPT_ENCODING);
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use axum::http;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn local_response(builder: http::response::Builder, body: Vec<u8>) -> reqwest::Response {
        reqwest::Response::from(builder.body(body).unwrap())
    }

    #[test]
    fn test_strip_path_prefix() {
        assert_eq!(strip_path_prefix("/grafana/public/img/x.png", "/grafana"), "/public/img/x.png");
        assert_eq!(strip_path_prefix("/grafana", "/grafana"), "/");
        assert_eq!(strip_path_prefix("/grafana/", "/grafana/"), "/");
        assert_eq!(strip_path_prefix("/grafanax/login", "/grafana"), "/grafanax/login");
        assert_eq!(strip_path_prefix("/login", "/grafana"), "/login");
    }

    #[test]
    fn test_declared_charset() {
        let mut headers = HeaderMap::new();
        assert_eq!(declared_charset(&headers), None);

        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
        assert_eq!(declared_charset(&headers).as_deref(), Some("utf-8"));

        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json; Charset=\"UTF-8\""),
        );
        assert_eq!(declared_charset(&headers).as_deref(), Some("UTF-8"));

        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html"));
        assert_eq!(declared_charset(&headers).as_deref(), Some("ISO-8859-1"));

        headers.insert(CONTENT_TYPE, HeaderValue::from_static("image/png"));
        assert_eq!(declared_charset(&headers), None);
    }

    #[tokio::test]
    async fn test_text_response_passes_through() {
        let response = local_response(
            http::Response::builder()
                .status(200)
                .header("content-type", "text/plain; charset=utf-8")
                .header("content-length", "5"),
            b"hello".to_vec(),
        );

        let translated = translate_response(response).await.unwrap();

        assert_eq!(translated.status_code, 200);
        assert_eq!(translated.body, "hello");
        assert!(!translated.is_base64_encoded);
        assert!(!translated.headers.contains_key("content-length"));
        assert_eq!(translated.headers["content-type"], "text/plain; charset=utf-8");
    }

    #[tokio::test]
    async fn test_binary_response_is_base64() {
        let png = vec![0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];
        let response = local_response(
            http::Response::builder()
                .status(200)
                .header("content-type", "image/png")
                .header("transfer-encoding", "chunked"),
            png.clone(),
        );

        let translated = translate_response(response).await.unwrap();

        assert!(translated.is_base64_encoded);
        assert_eq!(translated.body, STANDARD.encode(&png));
        assert!(!translated.headers.contains_key("transfer-encoding"));
    }

    #[tokio::test]
    async fn test_redirect_with_cookies() {
        let response = local_response(
            http::Response::builder()
                .status(302)
                .header("location", "/prod/grafana/login")
                .header("set-cookie", "grafana_session=; Max-Age=0")
                .header("set-cookie", "redirect_to=%2F; Path=/"),
            Vec::new(),
        );

        let translated = translate_response(response).await.unwrap();

        assert_eq!(translated.status_code, 302);
        assert_eq!(translated.headers["location"], "/prod/grafana/login");
        assert_eq!(translated.headers["set-cookie"], "grafana_session=; Max-Age=0");
        assert_eq!(translated.headers["set-cookiE"], "redirect_to=%2F; Path=/");
    }

    #[test]
    fn test_target_url() {
        let translator =
            RequestTranslator::new(ProxySettings::default(), Arc::new(SystemClock)).unwrap();
        let event = GatewayRequestEvent {
            http_method: "GET".into(),
            path: "/grafana/api/search".into(),
            query_string_parameters: Some(HashMap::from([("query".into(), "cpu load".into())])),
            ..GatewayRequestEvent::default()
        };

        assert_eq!(
            translator.target_url(&event).unwrap().as_str(),
            "http://127.0.0.1:3000/api/search?query=cpu+load"
        );
    }

    #[test]
    fn test_request_headers_drop_recomputed_fields() {
        let event = GatewayRequestEvent {
            headers: HashMap::from([
                ("Host".to_string(), "example.com".to_string()),
                ("Content-Length".to_string(), "7".to_string()),
                ("Accept-Encoding".to_string(), "gzip".to_string()),
                ("Cookie".to_string(), "grafana_session=abc".to_string()),
            ]),
            ..GatewayRequestEvent::default()
        };

        let headers = request_headers(&event);

        assert_eq!(headers.len(), 2);
        assert_eq!(headers["host"], "example.com");
        assert_eq!(headers["cookie"], "grafana_session=abc");
    }

    #[test]
    fn test_backoff_is_capped() {
        let translator =
            RequestTranslator::new(ProxySettings::default(), Arc::new(SystemClock)).unwrap();
        assert_eq!(translator.backoff(1), Duration::from_millis(100));
        assert_eq!(translator.backoff(2), Duration::from_millis(200));
        assert_eq!(translator.backoff(4), Duration::from_millis(800));
        assert_eq!(translator.backoff(5), Duration::from_secs(1));
        assert_eq!(translator.backoff(19), Duration::from_secs(1));
    }
}
