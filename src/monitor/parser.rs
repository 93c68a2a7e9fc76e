//! Per-`SourceType` payload parsing (spec.md §4.1 "Parsing rules", §9
//! "Regex-based parsing" design note; grounded on
//! `production_regulatory_monitor.cpp`'s per-source extraction split).

use crate::types::Severity;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::Value;

/// One extracted, not-yet-deduplicated candidate regulatory event.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub title: String,
    pub description: String,
    pub content_url: String,
    pub change_type: String,
    pub severity: Severity,
    pub published_at: DateTime<Utc>,
}

pub trait SourceParser: Send + Sync {
    fn parse(&self, body: &str, base_url: &str) -> Vec<Candidate>;
}

const RSS_KEYWORDS: [&str; 4] = ["Rule", "Release", "Statement", "Commission"];

pub struct RssParser;

impl SourceParser for RssParser {
    fn parse(&self, body: &str, _base_url: &str) -> Vec<Candidate> {
        let item_re = Regex::new(r"(?s)<item>(.*?)</item>").unwrap();
        let title_re = Regex::new(r"(?s)<title>(.*?)</title>").unwrap();
        let link_re = Regex::new(r"(?s)<link>(.*?)</link>").unwrap();
        let description_re = Regex::new(r"(?s)<description>(.*?)</description>").unwrap();
        let pubdate_re = Regex::new(r"(?s)<pubDate>(.*?)</pubDate>").unwrap();

        item_re
            .captures_iter(body)
            .filter_map(|item| {
                let block = item.get(1)?.as_str();
                let title = title_re.captures(block)?.get(1)?.as_str().trim().to_string();
                if !RSS_KEYWORDS.iter().any(|k| title.contains(k)) {
                    return None;
                }
                let link = link_re.captures(block).and_then(|c| c.get(1)).map(|m| m.as_str().trim().to_string()).unwrap_or_default();
                let description = description_re
                    .captures(block)
                    .and_then(|c| c.get(1))
                    .map(|m| m.as_str().trim().to_string())
                    .unwrap_or_default();
                let published_at = pubdate_re
                    .captures(block)
                    .and_then(|c| c.get(1))
                    .and_then(|m| parse_rfc822(m.as_str().trim()))
                    .unwrap_or_else(epoch);
                let severity = if title.contains("Emergency") { Severity::Critical } else { Severity::High };
                Some(Candidate {
                    title,
                    description,
                    content_url: link,
                    change_type: "rss_update".to_string(),
                    severity,
                    published_at,
                })
            })
            .collect()
    }
}

/// RFC 822 with a fallback to RFC 2822's strict form.
fn parse_rfc822(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(s)
        .map(|d| d.with_timezone(&Utc))
        .or_else(|_| DateTime::parse_from_str(s, "%a, %d %b %Y %H:%M:%S %z").map(|d| d.with_timezone(&Utc)))
        .ok()
}

const HTML_KEYWORDS: [&str; 5] = ["Policy", "Guidance", "Consultation", "Statement", "Rule"];

pub struct HtmlParser;

impl SourceParser for HtmlParser {
    fn parse(&self, body: &str, base_url: &str) -> Vec<Candidate> {
        let anchor_re = Regex::new(r#"(?si)<a\s+href="([^"]*news[^"]*)"[^>]*>(.*?)</a>"#).unwrap();
        let keyword_pattern = HTML_KEYWORDS.join("|");
        let keyword_re = Regex::new(&keyword_pattern).unwrap();

        anchor_re
            .captures_iter(body)
            .filter_map(|cap| {
                let href = cap.get(1)?.as_str().trim();
                let text = strip_tags(cap.get(2)?.as_str());
                if !keyword_re.is_match(&text) {
                    return None;
                }
                let content_url = normalize_link(href, base_url);
                Some(Candidate {
                    title: text.clone(),
                    description: text,
                    content_url,
                    change_type: "html_update".to_string(),
                    severity: Severity::Medium,
                    published_at: epoch(),
                })
            })
            .collect()
    }
}

/// HTML anchors without an `http` prefix are resolved against the
/// source's base host (spec.md §4.1 "Link normalization").
fn normalize_link(href: &str, base_url: &str) -> String {
    if href.starts_with("http") {
        href.to_string()
    } else {
        let base = base_url.trim_end_matches('/');
        let path = href.trim_start_matches('/');
        format!("{base}/{path}")
    }
}

fn strip_tags(s: &str) -> String {
    let tag_re = Regex::new(r"<[^>]*>").unwrap();
    tag_re.replace_all(s, "").trim().to_string()
}

pub struct ApiParser;

impl SourceParser for ApiParser {
    fn parse(&self, body: &str, _base_url: &str) -> Vec<Candidate> {
        let Ok(parsed) = serde_json::from_str::<Value>(body) else { return Vec::new() };
        let items = match &parsed {
            Value::Array(items) => items.clone(),
            Value::Object(obj) => obj.get("items").and_then(|v| v.as_array()).cloned().unwrap_or_default(),
            _ => Vec::new(),
        };
        items
            .into_iter()
            .filter_map(|item| {
                let title = item.get("title")?.as_str()?.trim().to_string();
                if title.is_empty() {
                    return None;
                }
                Some(Candidate {
                    title,
                    description: item.get("description").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                    content_url: item.get("link").or_else(|| item.get("url")).and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                    change_type: "api_update".to_string(),
                    severity: Severity::Medium,
                    published_at: epoch(),
                })
            })
            .collect()
    }
}

/// No-date sentinel used when a source gives no parseable publish
/// timestamp, so the regulatory-item id stays stable across repeated
/// sweeps of the same unchanged content (spec.md §8 Scenario 5).
fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(0, 0).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rss_filters_by_keyword_and_flags_emergency() {
        let body = r#"
            <rss><channel>
            <item><title>New Rule on Capital Adequacy</title><link>http://x/a</link>
            <description>desc</description><pubDate>Wed, 02 Oct 2024 15:00:00 GMT</pubDate></item>
            <item><title>Office newsletter</title><link>http://x/b</link>
            <description>irrelevant</description></item>
            <item><title>Emergency Rule Amendment</title><link>http://x/c</link>
            <description>urgent</description></item>
            </channel></rss>
        "#;
        let candidates = RssParser.parse(body, "http://x");
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].severity, Severity::High);
        assert_eq!(candidates[1].severity, Severity::Critical);
    }

    #[test]
    fn html_extracts_and_normalizes_relative_links() {
        let body = r#"<a href="/news/2024/new-policy">New Policy Announced</a>
                       <a href="/other/page">Unrelated Page</a>"#;
        let candidates = HtmlParser.parse(body, "https://regulator.gov");
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].content_url, "https://regulator.gov/news/2024/new-policy");
        assert_eq!(candidates[0].severity, Severity::Medium);
    }

    #[test]
    fn api_parses_json_array_feed() {
        let body = r#"[{"title":"New Requirement","description":"d","link":"http://x/1"}]"#;
        let candidates = ApiParser.parse(body, "http://x");
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].title, "New Requirement");
    }
}
