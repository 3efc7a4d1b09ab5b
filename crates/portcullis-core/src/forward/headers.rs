//! Request-line and header rewriting for the upstream call.

use crate::gate::Admission;
use crate::seccom::{claim_header_name, state_header_name, SecComExchange};
use crate::template::{expand, TemplateContext};
use portcullis_types::models::{ServiceDescriptor, Target};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::HashMap;

/// Headers that never cross the proxy boundary.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

/// Whether a header may be copied across the proxy.
pub fn is_end_to_end(name: &str) -> bool {
    !HOP_BY_HOP.contains(&name.to_ascii_lowercase().as_str())
}

/// Rewritten request line: target scheme/host/port, target root + remaining
/// path, query passed through.
pub fn build_target_url(target: &Target, remaining_path: &str, raw_query: Option<&str>) -> String {
    let root = target.root.trim_end_matches('/');
    let mut url = format!("{}://{}{}{}", target.scheme, target.host, root, remaining_path);
    if let Some(q) = raw_query {
        if !q.is_empty() {
            url.push('?');
            url.push_str(q);
        }
    }
    url
}

/// What the header rewrite needs to know about the inbound request.
pub struct InboundMeta<'a> {
    /// Inbound headers, lowercased names
    pub headers: &'a HashMap<String, String>,
    /// Inbound query parameters
    pub query: &'a HashMap<String, String>,
    /// Resolved client IP
    pub client_ip: &'a str,
    /// Scheme the client used (http|https)
    pub proto: &'a str,
    /// Host the client addressed
    pub host: &'a str,
}

/// Build the upstream header map: end-to-end inbound headers, the forwarding
/// trio, the exchange tokens and the expanded `additionalHeaders`.
pub fn upstream_headers(
    service: &ServiceDescriptor,
    target: &Target,
    inbound: &InboundMeta<'_>,
    admission: &Admission,
    exchange: Option<&SecComExchange>,
) -> HeaderMap {
    let mut out = HeaderMap::new();

    for (name, value) in inbound.headers {
        if !is_end_to_end(name) {
            continue;
        }
        if let (Ok(name), Ok(value)) =
            (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value))
        {
            out.insert(name, value);
        }
    }

    insert(&mut out, "host", &format!("{}:{}", target.hostname(), target.port()));

    let forwarded_for = match inbound.headers.get("x-forwarded-for") {
        Some(existing) => format!("{existing}, {}", inbound.client_ip),
        None => inbound.client_ip.to_string(),
    };
    insert(&mut out, "x-forwarded-for", &forwarded_for);
    insert(&mut out, "x-forwarded-proto", inbound.proto);
    insert(&mut out, "x-forwarded-host", inbound.host);

    if let Some(exchange) = exchange {
        if let Some(ref token) = exchange.state_token {
            insert(&mut out, state_header_name(service), token);
        }
        if let Some(ref token) = exchange.claim_token {
            insert(&mut out, claim_header_name(service), token);
        }
    }

    if !service.additional_headers.is_empty() {
        let ctx = TemplateContext {
            apikey: admission.apikey.as_ref(),
            user: admission.user.as_ref(),
            headers: inbound.headers,
            query: inbound.query,
        };
        for (name, template) in &service.additional_headers {
            insert(&mut out, name, &expand(template, &ctx));
        }
    }

    out
}

fn insert(map: &mut HeaderMap, name: &str, value: &str) {
    if let (Ok(name), Ok(value)) =
        (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value))
    {
        map.insert(name, value);
    } else {
        tracing::warn!("dropping unrepresentable header {:?}", name);
    }
}
