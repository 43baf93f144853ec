//! Route filters applied to the outgoing request and the returned response

use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::warn;

use crate::routing::Filter;

/// Rewrite a request path through the route's path filters, in order
pub fn rewrite_path(filters: &[Filter], path: &str) -> String {
    let mut path = path.to_string();
    for filter in filters {
        match filter {
            Filter::StripPrefix { parts } => path = strip_segments(&path, *parts),
            Filter::PrefixPath { prefix } => path = join_prefix(prefix, &path),
            Filter::SetPath { path: fixed } => path = fixed.clone(),
            _ => {}
        }
    }
    path
}

fn strip_segments(path: &str, parts: usize) -> String {
    let trailing = path.len() > 1 && path.ends_with('/');
    let remaining: Vec<&str> = path
        .split('/')
        .filter(|s| !s.is_empty())
        .skip(parts)
        .collect();

    if remaining.is_empty() {
        return "/".to_string();
    }
    let mut out = format!("/{}", remaining.join("/"));
    if trailing {
        out.push('/');
    }
    out
}

fn join_prefix(prefix: &str, path: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    if path == "/" {
        return if prefix.is_empty() { "/".into() } else { prefix.into() };
    }
    format!("{}{}", prefix, path)
}

/// Apply header filters to the outgoing request. Returns the Host override,
/// if a `SetRequestHost` filter is present.
pub fn apply_request_headers(filters: &[Filter], headers: &mut HeaderMap) -> Option<String> {
    let mut host = None;
    for filter in filters {
        match filter {
            Filter::AddRequestHeader { name, value } => append(headers, name, value),
            Filter::RemoveRequestHeader { name } => {
                if let Ok(name) = HeaderName::from_bytes(name.as_bytes()) {
                    headers.remove(name);
                }
            }
            Filter::SetRequestHost { host: h } => host = Some(h.clone()),
            _ => {}
        }
    }
    host
}

/// Apply header filters to the response headed back to the client
pub fn apply_response_headers(filters: &[Filter], headers: &mut HeaderMap) {
    for filter in filters {
        if let Filter::AddResponseHeader { name, value } = filter {
            append(headers, name, value);
        }
    }
}

fn append(headers: &mut HeaderMap, name: &str, value: &str) {
    match (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
    ) {
        (Ok(name), Ok(value)) => {
            headers.append(name, value);
        }
        // Route validation rejects these; only reachable for hand-built tables
        _ => warn!(header = name, "Skipping invalid header filter"),
    }
}
