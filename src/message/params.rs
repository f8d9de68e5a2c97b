//! Parameter extraction: query string, urlencoded form body, cookies, JSON keys.

use crate::message::{MalformedMessage, Message};

/// Failure to interpret a body for inspection.
#[derive(Debug, thiserror::Error)]
pub enum BodyError {
    #[error(transparent)]
    Framing(#[from] MalformedMessage),

    #[error("body is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl Message {
    /// Decoded `(name, value)` pairs from the query string.
    pub fn query_params(&self) -> Vec<(String, String)> {
        self.query()
            .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
            .unwrap_or_default()
    }

    /// Decoded `(name, value)` pairs from an urlencoded form body.
    pub fn form_params(&self) -> Result<Vec<(String, String)>, BodyError> {
        let is_form = self
            .content_type()
            .map(|ct| ct.to_ascii_lowercase().starts_with("application/x-www-form-urlencoded"))
            .unwrap_or(false);
        if !is_form {
            return Ok(Vec::new());
        }
        let body = self.decoded_body()?;
        Ok(url::form_urlencoded::parse(&body).into_owned().collect())
    }

    /// `(name, value)` pairs from every `Cookie` header.
    pub fn cookies(&self) -> Vec<(String, String)> {
        self.headers_named("cookie")
            .flat_map(|value| value.split(';'))
            .filter_map(|pair| {
                let pair = pair.trim();
                if pair.is_empty() {
                    return None;
                }
                let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
                Some((name.trim().to_string(), value.trim().to_string()))
            })
            .collect()
    }

    /// True if the content type declares JSON.
    pub fn is_json(&self) -> bool {
        self.content_type()
            .map(|ct| {
                let ct = ct.to_ascii_lowercase();
                ct.contains("application/json") || ct.contains("+json")
            })
            .unwrap_or(false)
    }

    /// Every object key in the JSON body, depth-first.
    pub fn json_keys(&self) -> Result<Vec<String>, BodyError> {
        let body = self.decoded_body()?;
        let value: serde_json::Value = serde_json::from_slice(&body)?;
        let mut keys = Vec::new();
        collect_keys(&value, &mut keys);
        Ok(keys)
    }
}

fn collect_keys(value: &serde_json::Value, keys: &mut Vec<String>) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, nested) in map {
                keys.push(key.clone());
                collect_keys(nested, keys);
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                collect_keys(item, keys);
            }
        }
        _ => {}
    }
}
