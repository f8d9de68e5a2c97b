//! Duplicate request detection.

use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashSet;

use crate::config::HighlightConfig;
use crate::highlight::assets::{self, StaticGroups};
use crate::message::{HighlightColor, Message};

/// Paints first sightings cyan and repeats (and static assets) gray.
pub struct DuplicateHighlighter {
    settings: ArcSwap<HighlightConfig>,
    seen: DashSet<String>,
}

impl DuplicateHighlighter {
    pub fn new(config: HighlightConfig) -> Self {
        Self {
            settings: ArcSwap::from_pointee(config),
            seen: DashSet::new(),
        }
    }

    pub fn settings(&self) -> Arc<HighlightConfig> {
        self.settings.load_full()
    }

    /// Swap settings. A change forgets every request seen so far, since keys
    /// built under the old settings are not comparable.
    pub fn update(&self, config: HighlightConfig) {
        if *self.settings.load_full() == config {
            return;
        }
        self.settings.store(Arc::new(config));
        let cleared = self.reset();
        tracing::info!(cleared, "Highlight settings changed, duplicate history reset");
    }

    /// Forget every request seen so far. Returns how many keys were dropped.
    pub fn reset(&self) -> usize {
        let cleared = self.seen.len();
        self.seen.clear();
        cleared
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }

    /// Colour for `request`, or `None` for no highlight.
    ///
    /// Records the request as seen.
    pub fn classify(&self, request: &Message, secure: bool) -> Option<HighlightColor> {
        let config = self.settings.load();
        let gray = if config.disable_gray {
            None
        } else {
            Some(HighlightColor::Gray)
        };

        let groups = StaticGroups {
            images: config.static_images,
            scripts: config.static_scripts,
            fonts_media: config.static_fonts_media,
        };
        if request.path().map(|p| assets::is_static(p, &groups)).unwrap_or(false) {
            return gray;
        }

        if self.seen.insert(duplicate_key(request, secure, &config)) {
            Some(HighlightColor::Cyan)
        } else {
            gray
        }
    }

    /// Annotate `request` with its colour. Disabled highlighting leaves it as is.
    pub fn apply(&self, request: Message, secure: bool) -> Message {
        if !self.settings.load().enabled {
            return request;
        }
        let color = self.classify(&request, secure);
        request.with_highlight(color)
    }
}

/// Identity of a request for duplicate detection.
///
/// `METHOD scheme://host:port/path PART&PART...` with parts sorted so
/// parameter order does not matter.
pub fn duplicate_key(request: &Message, secure: bool, config: &HighlightConfig) -> String {
    let scheme = match request.scheme() {
        Some(scheme) => scheme.to_ascii_lowercase(),
        None if secure => "https".to_string(),
        None => "http".to_string(),
    };
    let port = request
        .port()
        .unwrap_or(if scheme == "https" { 443 } else { 80 });
    let host = request.host().unwrap_or_default();
    let path = request.path().unwrap_or("");
    let method = request.method().unwrap_or("");

    let mut parts = Vec::new();

    for (name, value) in request.query_params() {
        if config.use_get_names {
            parts.push(format!("GN:{}", name));
        }
        if config.use_get_values {
            parts.push(format!("GV:{}={}", name, value));
        }
    }

    if config.use_post_names || config.use_post_values {
        match request.form_params() {
            Ok(params) => {
                for (name, value) in params {
                    if config.use_post_names {
                        parts.push(format!("PN:{}", name));
                    }
                    if config.use_post_values {
                        parts.push(format!("PV:{}={}", name, value));
                    }
                }
            }
            Err(e) => tracing::debug!(error = %e, "Form body ignored for duplicate key"),
        }
    }

    if config.use_cookie_names || config.use_cookie_values {
        for (name, value) in request.cookies() {
            if config.use_cookie_names {
                parts.push(format!("CN:{}", name));
            }
            if config.use_cookie_values {
                parts.push(format!("CV:{}={}", name, value));
            }
        }
    }

    if config.use_json_keys && request.is_json() {
        match request.json_keys() {
            Ok(keys) => parts.extend(keys.into_iter().map(|k| format!("J:{}", k))),
            Err(e) => tracing::debug!(error = %e, "JSON body ignored for duplicate key"),
        }
    }

    if config.use_header_names || config.use_header_values {
        for header in request.headers().iter().filter(|h| !h.is("cookie")) {
            let name = header.name().to_ascii_lowercase();
            if config.use_header_values {
                parts.push(format!("HV:{}={}", name, header.value()));
            }
            if config.use_header_names {
                parts.push(format!("HN:{}", name));
            }
        }
    }

    parts.sort();
    format!("{} {}://{}:{}{} {}", method, scheme, host, port, path, parts.join("&"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Direction;

    fn request(raw: &[u8]) -> Message {
        Message::parse(raw, Direction::Request).unwrap()
    }

    #[test]
    fn test_first_cyan_then_gray() {
        let hl = DuplicateHighlighter::new(HighlightConfig::default());
        let a = request(b"GET /search?q=1&page=2 HTTP/1.1\r\nHost: Example.com\r\n\r\n");
        let reordered = request(b"GET /search?page=2&q=1 HTTP/1.1\r\nHost: example.com:80\r\n\r\n");
        let other_value = request(b"GET /search?q=2&page=2 HTTP/1.1\r\nHost: example.com\r\n\r\n");

        assert_eq!(hl.classify(&a, false), Some(HighlightColor::Cyan));
        assert_eq!(hl.classify(&reordered, false), Some(HighlightColor::Gray));
        // Query values are part of the key by default
        assert_eq!(hl.classify(&other_value, false), Some(HighlightColor::Cyan));
        // Same request over TLS is a different origin
        assert_eq!(hl.classify(&a, true), Some(HighlightColor::Cyan));
    }

    #[test]
    fn test_static_assets_and_disable_gray() {
        let hl = DuplicateHighlighter::new(HighlightConfig::default());
        let js = request(b"GET /static/app.js?v=3 HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(hl.classify(&js, false), Some(HighlightColor::Gray));
        assert_eq!(hl.seen_count(), 0);

        hl.update(HighlightConfig {
            disable_gray: true,
            ..HighlightConfig::default()
        });
        assert_eq!(hl.classify(&js, false), None);

        hl.update(HighlightConfig {
            static_scripts: false,
            disable_gray: true,
            ..HighlightConfig::default()
        });
        assert_eq!(hl.classify(&js, false), Some(HighlightColor::Cyan));
        assert_eq!(hl.classify(&js, false), None);
    }

    #[test]
    fn test_settings_change_and_reset_clear_history() {
        let hl = DuplicateHighlighter::new(HighlightConfig::default());
        let req = request(b"GET /a HTTP/1.1\r\nHost: x\r\n\r\n");
        hl.classify(&req, false);
        assert_eq!(hl.classify(&req, false), Some(HighlightColor::Gray));

        // Unchanged settings keep history
        hl.update(HighlightConfig::default());
        assert_eq!(hl.classify(&req, false), Some(HighlightColor::Gray));

        hl.update(HighlightConfig {
            use_header_names: true,
            ..HighlightConfig::default()
        });
        assert_eq!(hl.classify(&req, false), Some(HighlightColor::Cyan));

        assert_eq!(hl.reset(), 1);
        assert_eq!(hl.classify(&req, false), Some(HighlightColor::Cyan));
    }

    #[test]
    fn test_key_parts() {
        let config = HighlightConfig {
            use_cookie_names: true,
            use_header_names: true,
            ..HighlightConfig::default()
        };
        let req = request(
            b"POST https://api.test/v1/login?next=%2F HTTP/1.1\r\nHost: api.test\r\nCookie: sid=1\r\nContent-Type: application/json\r\nContent-Length: 24\r\n\r\n{\"user\":\"a\",\"pass\":\"b\"}\n",
        );
        let key = duplicate_key(&req, false, &config);
        assert!(key.starts_with("POST https://api.test:443/v1/login "));
        assert!(key.contains("GN:next"));
        assert!(key.contains("GV:next=/"));
        assert!(key.contains("CN:sid"));
        assert!(key.contains("J:pass"));
        assert!(key.contains("J:user"));
        assert!(key.contains("HN:content-type"));
        assert!(!key.contains("HN:cookie"));
    }

    #[test]
    fn test_disabled_leaves_message_untouched() {
        let hl = DuplicateHighlighter::new(HighlightConfig {
            enabled: false,
            ..HighlightConfig::default()
        });
        let req = request(b"GET /a HTTP/1.1\r\nHost: x\r\n\r\n");
        let out = hl.apply(req.clone(), false);
        assert_eq!(out.annotations().highlight, None);
        assert_eq!(hl.seen_count(), 0);
    }
}
