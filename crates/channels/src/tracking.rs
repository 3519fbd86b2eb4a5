//! Click and open tracking instrumentation for outgoing HTML.
//!
//! Links are routed through `{base}/t/c/{tracking_id}?url={original}` and an
//! invisible beacon `{base}/t/o/{tracking_id}.gif` is appended to the body.

use regex::{Captures, Regex};
use std::sync::OnceLock;
use url::form_urlencoded;

fn href_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?i)href\s*=\s*(?:"(https?://[^"]*)"|'(https?://[^']*)'|(https?://[^\s"'<>`=]+))"#,
        )
            .expect("href regex is valid")
    })
}

/// Builds tracking URLs under a public base URL.
#[derive(Debug, Clone)]
pub struct TrackingLinks {
    base_url: String,
}

impl TrackingLinks {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn click_url(&self, tracking_id: &str, target: &str) -> String {
        let encoded: String = form_urlencoded::byte_serialize(target.as_bytes()).collect();
        format!("{}/t/c/{}?url={}", self.base_url, tracking_id, encoded)
    }

    pub fn open_url(&self, tracking_id: &str) -> String {
        format!("{}/t/o/{}.gif", self.base_url, tracking_id)
    }

    /// Rewrite every absolute http(s) link in `html` through the click
    /// redirector, whether the `href` value is double-, single- or unquoted. Links already pointing at the redirector are left alone.
    pub fn rewrite_links(&self, html: &str, tracking_id: &str) -> String {
        let redirect_prefix = format!("{}/t/c/", self.base_url);
        href_regex()
            .replace_all(html, |caps: &Captures| {
                let (target, quote) = match (caps.get(1), caps.get(2), caps.get(3)) {
                    (Some(m), _, _) => (m.as_str(), '"'),
                    (None, Some(m), _) => (m.as_str(), '\''),
                    // Unquoted values are quoted on the way out.
                    (None, None, Some(m)) => (m.as_str(), '"'),
                    (None, None, None) => return caps[0].to_string(),
                };
                if target.starts_with(&redirect_prefix) {
                    return caps[0].to_string();
                }
                format!(
                    "href={quote}{}{quote}",
                    self.click_url(tracking_id, &decode_entities(target))
                )
            })
            .into_owned()
    }

    pub fn open_beacon(&self, tracking_id: &str) -> String {
        format!(
            r#"<img src="{}" width="1" height="1" alt="" style="display:none" />"#,
            self.open_url(tracking_id)
        )
    }

    /// Rewrite links and add the open beacon, before `</body>` when present.
    pub fn instrument(&self, html: &str, tracking_id: &str) -> String {
        let rewritten = self.rewrite_links(html, tracking_id);
        let beacon = self.open_beacon(tracking_id);
        match rewritten.to_ascii_lowercase().rfind("</body>") {
            Some(pos) => {
                let mut out = String::with_capacity(rewritten.len() + beacon.len());
                out.push_str(&rewritten[..pos]);
                out.push_str(&beacon);
                out.push_str(&rewritten[pos..]);
                out
            }
            None => format!("{rewritten}{beacon}"),
        }
    }
}

/// Undo the one HTML entity that routinely appears in href query strings.
fn decode_entities(href: &str) -> String {
    href.replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn links() -> TrackingLinks {
        TrackingLinks::new("https://mail.example.com/")
    }

    #[test]
    fn test_click_url_encodes_target() {
        assert_eq!(
            links().click_url("abc", "https://x.io/a?b=1&c=2"),
            "https://mail.example.com/t/c/abc?url=https%3A%2F%2Fx.io%2Fa%3Fb%3D1%26c%3D2"
        );
    }

    #[test]
    fn test_rewrites_both_quote_styles() {
        let html = r#"<a href="https://a.io/x">A</a> <a HREF='http://b.io'>B</a> <a href="mailto:z@z.io">Z</a>"#;
        let out = links().rewrite_links(html, "t1");
        assert!(out.contains(r#"href="https://mail.example.com/t/c/t1?url=https%3A%2F%2Fa.io%2Fx""#));
        assert!(out.contains(r#"href='https://mail.example.com/t/c/t1?url=http%3A%2F%2Fb.io'"#));
        assert!(out.contains(r#"href="mailto:z@z.io""#));
    }

    #[test]
    fn test_rewrites_unquoted_href() {
        let html = r#"<a href=https://a.io/start class=cta>Go</a><a href=#top>Top</a>"#;
        let out = links().rewrite_links(html, "t2");
        assert!(out.contains(
            r#"<a href="https://mail.example.com/t/c/t2?url=https%3A%2F%2Fa.io%2Fstart" class=cta>"#
        ));
        assert!(out.contains("href=#top"));
        assert_eq!(links().rewrite_links(&out, "t2"), out);
    }

    #[test]
    fn test_does_not_double_wrap() {
        let l = links();
        let once = l.rewrite_links(r#"<a href="https://a.io">A</a>"#, "t1");
        let twice = l.rewrite_links(&once, "t1");
        assert_eq!(once, twice);
    }

    #[test]
    fn test_entity_in_href_is_decoded() {
        let out = links().rewrite_links(r#"<a href="https://a.io/?x=1&amp;y=2">A</a>"#, "t");
        assert!(out.contains("url=https%3A%2F%2Fa.io%2F%3Fx%3D1%26y%3D2"));
    }

    #[test]
    fn test_instrument_places_beacon() {
        let l = links();
        let with_body = l.instrument("<html><body><p>Hi</p></BODY></html>", "t9");
        assert!(with_body.contains(r#"<img src="https://mail.example.com/t/o/t9.gif""#));
        let beacon_at = with_body.find("<img").unwrap();
        let close_at = with_body.find("</BODY>").unwrap();
        assert!(beacon_at < close_at);

        let fragment = l.instrument("<p>Hi</p>", "t9");
        assert!(fragment.starts_with("<p>Hi</p><img"));
    }
}
