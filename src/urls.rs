use std::net::{IpAddr, UdpSocket};

use crate::context::Protocol;

/// Browser-facing URLs derived once from protocol, host, port and the public
/// URL prefix. An unspecified bind host renders as `localhost` for the
/// browser; the LAN URL is only offered when the server listens on all
/// interfaces.
#[derive(Debug, Clone)]
pub struct ResolvedUrls {
    pub local_url: String,
    pub lan_url: Option<String>,
    pub host: String,
    pub port: u16,
}

impl ResolvedUrls {
    pub fn resolve(protocol: Protocol, host: &str, port: u16, public_url_prefix: &str) -> Self {
        let lan_url = if is_unspecified(host) {
            lan_ip().map(|ip| render(protocol, &ip.to_string(), port, public_url_prefix))
        } else {
            None
        };

        Self {
            local_url: render(protocol, display_host(host), port, public_url_prefix),
            lan_url,
            host: host.to_string(),
            port,
        }
    }
}

fn render(protocol: Protocol, host: &str, port: u16, prefix: &str) -> String {
    format!("{}://{host}:{port}{prefix}", protocol.scheme())
}

fn display_host(host: &str) -> &str {
    if is_unspecified(host) { "localhost" } else { host }
}

fn is_unspecified(host: &str) -> bool {
    matches!(host, "0.0.0.0" | "::" | "[::]")
}

/// Discovers the outward-facing interface address without sending traffic;
/// connecting a UDP socket only selects a route.
fn lan_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).ok()?;
    socket.connect(("8.8.8.8", 80)).ok()?;
    Some(socket.local_addr().ok()?.ip())
}
