use axum::{
    body::Body,
    extract::Request,
    http::{header, HeaderMap, HeaderName, HeaderValue},
    response::Response,
};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::{GatewayError, Result};

const MAX_REDIRECTS: usize = 10;

/// Streaming HTTP client that proxies a request to a target URL.
pub struct Forwarder {
    client: reqwest::Client,
    default_timeout: Duration,
}

impl Forwarder {
    pub fn new(default_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(20)
            .user_agent(concat!("gatehouse/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| GatewayError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            default_timeout,
        })
    }

    /// Request deadline: the global default unless the route specifies a
    /// smaller value. `route_timeout_seconds <= 0` means "use the default".
    pub fn effective_timeout(&self, route_timeout_seconds: i32) -> Duration {
        if route_timeout_seconds > 0 {
            self.default_timeout
                .min(Duration::from_secs(route_timeout_seconds as u64))
        } else {
            self.default_timeout
        }
    }

    /// Forward the inbound request to `target_url` and return the upstream
    /// response with its status, headers, and a streamed body. Redirects are
    /// followed up to the limit, then the terminal response is streamed.
    pub async fn forward(
        &self,
        target_url: &str,
        req: Request,
        remote_addr: SocketAddr,
        timeout: Duration,
    ) -> Result<Response> {
        let (parts, body) = req.into_parts();

        let host = parts
            .headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .or_else(|| parts.uri.authority().map(|a| a.to_string()));

        let tls = parts.uri.scheme_str() == Some("https");
        let mut headers = build_forward_headers(
            &parts.headers,
            &remote_addr.to_string(),
            tls,
            host.as_deref(),
        );
        inject_trace_headers(&mut headers, Uuid::new_v4());

        debug!(method = %parts.method, target = %target_url, "Forwarding request");

        let response = self
            .client
            .request(parts.method, target_url)
            .headers(headers)
            .timeout(timeout)
            .body(reqwest::Body::wrap_stream(body.into_data_stream()))
            .send()
            .await
            .map_err(|e| {
                error!(target = %target_url, error = %e, "Upstream request failed");
                GatewayError::Upstream(e.to_string())
            })?;

        let mut builder = Response::builder().status(response.status());
        for (name, value) in response.headers().iter() {
            if !is_hop_by_hop_header(name) {
                builder = builder.header(name, value);
            }
        }

        builder
            .body(Body::from_stream(response.bytes_stream()))
            .map_err(|e| GatewayError::Internal(format!("Failed to build response: {}", e)))
    }

    /// Liveness probe used by the periodic backend health check.
    pub async fn probe(&self, url: &str) -> bool {
        match self
            .client
            .get(url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(response) => !response.status().is_server_error(),
            Err(_) => false,
        }
    }
}

/// Clone inbound headers, strip hop-by-hop headers, and set the forwarded
/// headers. Existing `X-Forwarded-*` values are overwritten.
fn build_forward_headers(
    inbound: &HeaderMap,
    remote_addr: &str,
    tls: bool,
    host: Option<&str>,
) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(inbound.len() + 3);
    for (name, value) in inbound.iter() {
        if !is_hop_by_hop_header(name) && name != header::HOST {
            headers.append(name, value.clone());
        }
    }

    if let Ok(value) = HeaderValue::from_str(remote_addr) {
        headers.insert("x-forwarded-for", value);
    }
    headers.insert(
        "x-forwarded-proto",
        HeaderValue::from_static(if tls { "https" } else { "http" }),
    );
    if let Some(host) = host {
        if let Ok(value) = HeaderValue::from_str(host) {
            headers.insert("x-forwarded-host", value);
        }
    }

    headers
}

/// Adapt the outbound header map as the carrier for trace propagation.
fn inject_trace_headers(headers: &mut HeaderMap, request_id: Uuid) {
    if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
        headers.insert("x-request-id", value);
    }
}

fn is_hop_by_hop_header(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}
