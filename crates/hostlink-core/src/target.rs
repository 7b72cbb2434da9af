//! Request-target parsing for upgrade requests.
//!
//! The query portion is first tried as a single JSON object (raw, then
//! percent-decoded). If that fails it is parsed as `key=value&key=value`
//! pairs with URL-decoding.

use serde_json::Value;
use std::collections::HashMap;

/// Path and connection params derived from an upgrade request target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTarget {
    pub path: String,
    /// `None` when the target carries no query.
    pub params: Option<HashMap<String, String>>,
}

/// Split a request target such as `/a?x=1` into path and params.
pub fn parse_request_target(raw: &str) -> RequestTarget {
    let (path, query) = match raw.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (raw, None),
    };
    let path = if path.is_empty() { "/" } else { path }.to_string();

    let params = match query {
        Some(q) if !q.is_empty() => Some(parse_json_query(q).unwrap_or_else(|| parse_pairs(q))),
        _ => None,
    };

    RequestTarget { path, params }
}

fn parse_json_query(query: &str) -> Option<HashMap<String, String>> {
    let candidate = match serde_json::from_str::<Value>(query) {
        Ok(v) => v,
        Err(_) => serde_json::from_str::<Value>(&urlencoding::decode(query).ok()?).ok()?,
    };
    let Value::Object(map) = candidate else {
        return None;
    };
    Some(
        map.into_iter()
            .map(|(k, v)| {
                let v = match v {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                (k, v)
            })
            .collect(),
    )
}

fn parse_pairs(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|seg| !seg.is_empty())
        .map(|seg| {
            let (k, v) = seg.split_once('=').unwrap_or((seg, ""));
            (decode_component(k), decode_component(v))
        })
        .collect()
}

fn decode_component(s: &str) -> String {
    let spaced = s.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => spaced,
    }
}
