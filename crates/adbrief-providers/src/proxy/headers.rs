//! Header rewriting for the auth proxy.

use http::header::{AUTHORIZATION, CONTENT_LENGTH, HOST};
use http::{HeaderMap, HeaderName, HeaderValue};

/// Connection-scoped headers that must not be forwarded in either direction.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub(crate) fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Builds upstream request headers.
///
/// Drops hop-by-hop headers, `host`, `content-length` and the vendor key
/// header, then sets `Authorization: <scheme> <key>` from the inbound key
/// or, failing that, `fallback_key`.
pub(crate) fn translate_request_headers(
    inbound: &HeaderMap,
    key_header: &HeaderName,
    auth_scheme: &str,
    fallback_key: Option<&str>,
) -> HeaderMap {
    let inbound_key = inbound
        .get(key_header)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|k| !k.is_empty());

    let mut headers = HeaderMap::with_capacity(inbound.len());
    for (name, value) in inbound {
        if is_hop_by_hop(name) || name == HOST || name == CONTENT_LENGTH || name == key_header {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    let key = inbound_key.or(fallback_key.map(str::trim).filter(|k| !k.is_empty()));
    if let Some(key) = key
        && let Ok(value) = HeaderValue::from_str(&format!("{auth_scheme} {key}"))
    {
        headers.insert(AUTHORIZATION, value);
    }
    headers
}

/// Copies upstream response headers minus hop-by-hop ones.
pub(crate) fn filter_response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(upstream.len());
    for (name, value) in upstream {
        if !is_hop_by_hop(name) {
            headers.append(name.clone(), value.clone());
        }
    }
    headers
}
