//! Status page served for the apex host and unresolvable hosts.
//!
//! A read-only HTML summary of the registry snapshot; no control actions.

use std::fmt::Write as _;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use axum::response::{Html, IntoResponse, Response};

use crate::frontend::FrontendState;
use crate::session::TunnelInfo;

pub async fn status_page(state: &FrontendState) -> Response {
    let snapshot = state.registry.snapshot().await;
    let html = render(
        &snapshot,
        state.started_at.elapsed(),
        state.config.redact_peer_addrs,
    );
    Html(html).into_response()
}

pub(crate) fn render(tunnels: &[TunnelInfo], uptime: Duration, redact: bool) -> String {
    let total_requests: u64 = tunnels.iter().map(|t| t.requests).sum();
    let total_errors: u64 = tunnels.iter().map(|t| t.errors).sum();

    let mut page = String::new();
    page.push_str("<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\"><title>gale</title></head>\n<body>\n");
    let _ = writeln!(page, "<h1>gale tunnel server</h1>");
    let _ = writeln!(
        page,
        "<p>uptime {} &middot; {} tunnel(s) &middot; {} request(s) &middot; {} error(s)</p>",
        format_duration(uptime),
        tunnels.len(),
        total_requests,
        total_errors
    );

    if tunnels.is_empty() {
        page.push_str("<p>No tunnels registered.</p>\n");
    } else {
        page.push_str(
            "<table border=\"1\" cellpadding=\"4\">\n<tr><th>subdomain</th><th>client</th>\
             <th>uptime</th><th>last heartbeat</th><th>requests</th><th>errors</th>\
             <th>bytes in/out</th></tr>\n",
        );
        for tunnel in tunnels {
            let _ = writeln!(
                page,
                "<tr><td>{}</td><td>{}</td><td>{}</td><td>{} ago</td><td>{}</td><td>{}</td><td>{}/{}</td></tr>",
                tunnel.subdomain,
                display_addr(&tunnel.peer_addr, redact),
                format_duration(tunnel.age),
                format_duration(tunnel.since_heartbeat),
                tunnel.requests,
                tunnel.errors,
                tunnel.bytes_in,
                tunnel.bytes_out,
            );
        }
        page.push_str("</table>\n");
    }
    page.push_str("</body>\n</html>\n");
    page
}

/// Render a duration as `1d2h3m4s`, dropping leading zero units.
pub(crate) fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;
    let seconds = total % 60;

    let mut out = String::new();
    if days > 0 {
        let _ = write!(out, "{days}d");
    }
    if hours > 0 || !out.is_empty() {
        let _ = write!(out, "{hours}h");
    }
    if minutes > 0 || !out.is_empty() {
        let _ = write!(out, "{minutes}m");
    }
    let _ = write!(out, "{seconds}s");
    out
}

/// Peer address for display, optionally redacted to its /24 (IPv4) or the
/// first four segments (IPv6).
pub(crate) fn display_addr(addr: &SocketAddr, redact: bool) -> String {
    if !redact {
        return addr.ip().to_string();
    }
    match addr.ip() {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            format!("{}.{}.{}.0/24", octets[0], octets[1], octets[2])
        }
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            format!(
                "{:x}:{:x}:{:x}:{:x}::/64",
                segments[0], segments[1], segments[2], segments[3]
            )
        }
    }
}
