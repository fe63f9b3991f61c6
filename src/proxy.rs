use actix_web::error::{ErrorBadGateway, ErrorInternalServerError};
use actix_web::http::StatusCode;
use actix_web::{HttpRequest, HttpResponse, Result as ActixResult, web};

use crate::live;

/// Middleware description for the declared API proxy: requests the static
/// tree cannot answer are forwarded to this target. Built once, immutable.
#[derive(Debug, Clone)]
pub struct ProxyDescriptor {
    pub target: String,
}

impl ProxyDescriptor {
    /// A request is proxied when it is not a plain GET, or when it is a GET
    /// that missed the static tree and does not accept text/html (API
    /// clients); navigation requests and the live-reload scope stay with the
    /// dev server.
    pub fn should_proxy(&self, path: &str, method: &str, accept: Option<&str>) -> bool {
        if path.starts_with(live::SCOPE_PATH) {
            return false;
        }
        method != "GET" || accept.is_some_and(|value| !value.contains("text/html"))
    }
}

/// Builds the proxy descriptor from the package.json `proxy` field. An
/// absent rule means no proxying; a rule with a non-http(s) scheme is a
/// configuration error.
pub fn prepare(declared_rule: Option<&str>) -> anyhow::Result<Option<ProxyDescriptor>> {
    let Some(rule) = declared_rule else {
        return Ok(None);
    };

    if !rule.starts_with("http://") && !rule.starts_with("https://") {
        anyhow::bail!(
            "When \"proxy\" is specified in package.json it must start with either http:// or https://"
        );
    }

    Ok(Some(ProxyDescriptor {
        target: rule.trim_end_matches('/').to_string(),
    }))
}

/// Forwards one request to the proxy target, preserving method, path, query,
/// headers and body, and mirrors the upstream response back.
pub async fn forward(
    client: &reqwest::Client,
    descriptor: &ProxyDescriptor,
    req: &HttpRequest,
    body: web::Bytes,
) -> ActixResult<HttpResponse> {
    let mut url = format!("{}{}", descriptor.target, req.uri().path());
    if let Some(query) = req.uri().query() {
        url.push('?');
        url.push_str(query);
    }

    let method = reqwest::Method::from_bytes(req.method().as_str().as_bytes())
        .map_err(ErrorInternalServerError)?;

    let mut outbound = client.request(method, &url);
    for (name, value) in req.headers() {
        if is_hop_header(name.as_str()) {
            continue;
        }
        outbound = outbound.header(name.as_str(), value.as_bytes());
    }

    let upstream = outbound
        .body(body.to_vec())
        .send()
        .await
        .map_err(ErrorBadGateway)?;

    let status =
        StatusCode::from_u16(upstream.status().as_u16()).map_err(ErrorInternalServerError)?;
    let mut response = HttpResponse::build(status);
    for (name, value) in upstream.headers() {
        if is_hop_header(name.as_str()) {
            continue;
        }
        response.append_header((name.as_str(), value.as_bytes()));
    }

    let bytes = upstream.bytes().await.map_err(ErrorBadGateway)?;
    Ok(response.body(bytes))
}

/// Connection-scoped headers must not cross the proxy boundary.
fn is_hop_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "host"
            | "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> ProxyDescriptor {
        ProxyDescriptor {
            target: "http://localhost:4000".into(),
        }
    }

    #[test]
    fn absent_rule_means_no_proxy() {
        assert!(prepare(None).unwrap().is_none());
    }

    #[test]
    fn valid_targets_are_kept_without_trailing_slash() {
        let descriptor = prepare(Some("http://localhost:4000/")).unwrap().unwrap();
        assert_eq!(descriptor.target, "http://localhost:4000");

        let descriptor = prepare(Some("https://api.dev.local")).unwrap().unwrap();
        assert_eq!(descriptor.target, "https://api.dev.local");
    }

    #[test]
    fn non_http_schemes_are_rejected() {
        let error = prepare(Some("ws://localhost:4000")).unwrap_err();
        assert!(error.to_string().contains("http://"));

        assert!(prepare(Some("localhost:4000")).is_err());
    }

    #[test]
    fn non_get_requests_are_always_proxied() {
        assert!(descriptor().should_proxy("/api/items", "POST", Some("text/html")));
        assert!(descriptor().should_proxy("/api/items", "DELETE", None));
    }

    #[test]
    fn get_requests_are_proxied_only_for_api_clients() {
        assert!(descriptor().should_proxy("/api/items", "GET", Some("application/json")));
        assert!(!descriptor().should_proxy(
            "/dashboard",
            "GET",
            Some("text/html,application/xhtml+xml")
        ));
        assert!(!descriptor().should_proxy("/dashboard", "GET", None));
    }

    #[test]
    fn live_reload_scope_is_never_proxied() {
        assert!(!descriptor().should_proxy("/__devserve/events", "GET", Some("application/json")));
        assert!(!descriptor().should_proxy("/__devserve/client.js", "POST", None));
    }

    #[test]
    fn hop_headers_are_filtered() {
        assert!(is_hop_header("Connection"));
        assert!(is_hop_header("host"));
        assert!(is_hop_header("transfer-encoding"));
        assert!(!is_hop_header("content-type"));
        assert!(!is_hop_header("authorization"));
    }
}
