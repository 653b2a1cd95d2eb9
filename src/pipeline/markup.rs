//! Markup handling: clean, validate and rewrite model-generated HTML.
//!
//! Even well-prompted models wrap their answer in ` ```html ` fences, return
//! it as a JSON string, or add a sentence of commentary before the document.
//! [`clean_html_response`] applies a fixed sequence of pure rules to recover
//! the markup, and fails with a validation error (which the retry executor
//! re-prompts on) when nothing usable remains.
//!
//! The remaining helpers work on cleaned markup: tag skeletons for the
//! translation structure check, visible text for the context window, and
//! image-placeholder substitution for generation.

use crate::error::UnitError;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use scraper::{CaseSensitivity, Html, Node, Selector};

/// Apply all cleanup rules to a raw model response.
///
/// Rules (applied in order):
/// 1. Normalise line endings (CRLF → LF)
/// 2. Strip outer code fences
/// 3. Unwrap a JSON string or a `{"html": …}` object
/// 4. Extract the `<html>`, else `<body>`, else outermost `<div>` region
/// 5. Strip invisible Unicode
pub fn clean_html_response(raw: &str) -> Result<String, UnitError> {
    let s = normalise_line_endings(raw);
    let s = strip_code_fences(&s);
    let s = unwrap_json(&s);
    let s = extract_markup_region(&s)
        .ok_or_else(|| UnitError::Validation("response contains no HTML document".into()))?;
    let s = remove_invisible_chars(s);
    if s.trim().is_empty() {
        return Err(UnitError::Validation("empty HTML document".into()));
    }
    Ok(s)
}

// ── Rule 1: Normalise line endings ───────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule 2: Strip outer code fences ──────────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```[a-zA-Z]*\n(.*?)\n?```\s*$").unwrap());

fn strip_code_fences(input: &str) -> String {
    if let Some(caps) = RE_OUTER_FENCES.captures(input.trim()) {
        caps[1].to_string()
    } else {
        input.trim().to_string()
    }
}

// ── Rule 3: Unwrap JSON ──────────────────────────────────────────────────────

fn unwrap_json(input: &str) -> String {
    let t = input.trim();
    if !(t.starts_with('{') || t.starts_with('"')) {
        return t.to_string();
    }
    match serde_json::from_str::<serde_json::Value>(t) {
        Ok(serde_json::Value::String(s)) => s,
        Ok(serde_json::Value::Object(map)) => match map.get("html") {
            Some(serde_json::Value::String(s)) => s.clone(),
            _ => t.to_string(),
        },
        _ => t.to_string(),
    }
}

// ── Rule 4: Extract the markup region ────────────────────────────────────────

fn region<'a>(s: &'a str, lower: &str, open: &str, close: &str) -> Option<&'a str> {
    let start = lower.find(open)?;
    let end = lower.rfind(close)? + close.len();
    (end > start).then(|| &s[start..end])
}

fn extract_markup_region(input: &str) -> Option<&str> {
    // ASCII lowercasing keeps byte offsets aligned with `input`.
    let lower = input.to_ascii_lowercase();
    region(input, &lower, "<html", "</html>")
        .or_else(|| region(input, &lower, "<body", "</body>"))
        .or_else(|| region(input, &lower, "<div", "</div>"))
}

// ── Rule 5: Strip invisible Unicode ──────────────────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input
        .chars()
        .filter(|c| !matches!(c, '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{2060}' | '\u{FEFF}'))
        .collect()
}

// ── Validation ───────────────────────────────────────────────────────────────

static BODY: Lazy<Selector> = Lazy::new(|| Selector::parse("body").unwrap());

/// Check that cleaned markup parses into a document with actual content.
pub fn ensure_parseable(html: &str) -> Result<(), UnitError> {
    let doc = Html::parse_document(html);
    let body = doc
        .select(&BODY)
        .next()
        .ok_or_else(|| UnitError::Validation("markup has no body".into()))?;
    let has_text = body.text().any(|t| !t.trim().is_empty());
    let has_media = body.descendants().any(|n| match n.value() {
        Node::Element(e) => {
            matches!(
                e.name(),
                "img" | "svg" | "image" | "picture" | "video" | "audio" | "object" | "math"
            ) || (e.name() == "div"
                && e.has_class("image-placeholder", CaseSensitivity::AsciiCaseInsensitive))
        }
        _ => false,
    });
    if has_text || has_media {
        Ok(())
    } else {
        Err(UnitError::Validation("markup body is empty".into()))
    }
}

/// Element names under `<body>`, in document order.
pub fn tag_skeleton(html: &str) -> Vec<String> {
    let doc = Html::parse_document(html);
    let Some(body) = doc.select(&BODY).next() else {
        return Vec::new();
    };
    body.descendants()
        .skip(1)
        .filter_map(|n| n.value().as_element().map(|e| e.name().to_string()))
        .collect()
}

/// Compare tag skeletons; `Err` describes the first divergence.
pub fn compare_skeletons(source: &str, translated: &str) -> Result<(), UnitError> {
    let a = tag_skeleton(source);
    let b = tag_skeleton(translated);
    if a == b {
        return Ok(());
    }
    let at = a.iter().zip(&b).position(|(x, y)| x != y).unwrap_or(a.len().min(b.len()));
    Err(UnitError::Validation(format!(
        "tag structure differs at element {at}: expected {:?}, got {:?} ({} vs {} elements)",
        a.get(at),
        b.get(at),
        a.len(),
        b.len()
    )))
}

/// Visible text under `<body>` with whitespace collapsed. Scripts and styles excluded.
pub fn visible_text(html: &str) -> String {
    let doc = Html::parse_document(html);
    let Some(body) = doc.select(&BODY).next() else {
        return String::new();
    };
    let mut parts: Vec<&str> = Vec::new();
    for node in body.descendants() {
        if let Node::Text(text) = node.value() {
            let hidden = node
                .parent()
                .and_then(|p| p.value().as_element().map(|e| matches!(e.name(), "script" | "style")))
                .unwrap_or(false);
            if !hidden {
                parts.extend(text.split_whitespace());
            }
        }
    }
    parts.join(" ")
}

// ── Documents ────────────────────────────────────────────────────────────────

const XML_PROLOG: &str = "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<!DOCTYPE html>\n";

/// Turn cleaned model output into a complete chapter document.
pub fn to_xhtml_document(title: &str, markup: &str, stylesheet_href: &str) -> String {
    if markup.trim_start().to_ascii_lowercase().starts_with("<html") {
        return format!("{XML_PROLOG}{}\n", markup.trim());
    }
    let inner = if markup.trim_start().to_ascii_lowercase().starts_with("<body") {
        markup.trim().to_string()
    } else {
        format!("<body>\n{}\n</body>", markup.trim())
    };
    format!(
        "{XML_PROLOG}<html xmlns=\"http://www.w3.org/1999/xhtml\">\n<head>\n<meta charset=\"utf-8\"/>\n<title>{}</title>\n<link rel=\"stylesheet\" type=\"text/css\" href=\"{}\"/>\n</head>\n{}\n</html>\n",
        escape_text(title),
        stylesheet_href,
        inner
    )
}

/// Re-attach the source file's prolog (XML declaration, doctype) to a translation.
pub fn reattach_prolog(source: &str, translated: &str) -> String {
    let lower = source.to_ascii_lowercase();
    let prolog = lower.find("<html").map(|i| &source[..i]).unwrap_or("");
    if prolog.trim().is_empty() || translated.trim_start().starts_with("<?xml") {
        return format!("{}\n", translated.trim());
    }
    format!("{}{}\n", prolog, translated.trim())
}

/// Minimal text escaping for element content and attribute values.
pub fn escape_text(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

// ── Image placeholders ───────────────────────────────────────────────────────

/// An image slot the model left in generated markup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholder {
    pub id: Option<String>,
    /// Page relative to the first rendered page (0 = first).
    pub page: Option<usize>,
    pub description: String,
}

static RE_PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?s)<div\b([^>]*\bclass\s*=\s*["'][^"']*\bimage-placeholder\b[^"']*["'][^>]*?)(?:/>|>.*?</div>)"#,
    )
    .unwrap()
});

static RE_ATTR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\b(id|data-page|data-description)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).unwrap()
});

fn parse_placeholder(attrs: &str) -> Placeholder {
    let mut p = Placeholder {
        id: None,
        page: None,
        description: String::new(),
    };
    for caps in RE_ATTR.captures_iter(attrs) {
        let value = caps
            .get(2)
            .or_else(|| caps.get(3))
            .map_or("", |m| m.as_str())
            .to_string();
        match &caps[1] {
            "id" => p.id = Some(value),
            "data-page" => p.page = value.trim().parse().ok(),
            _ => p.description = value,
        }
    }
    p
}

/// All placeholders in document order.
pub fn find_placeholders(html: &str) -> Vec<Placeholder> {
    RE_PLACEHOLDER
        .captures_iter(html)
        .map(|c| parse_placeholder(&c[1]))
        .collect()
}

/// Replace each placeholder with `resolve(placeholder)`; `None` keeps it.
///
/// Returns the rewritten markup and the number of replacements.
pub fn replace_placeholders<F>(html: &str, mut resolve: F) -> (String, usize)
where
    F: FnMut(&Placeholder) -> Option<String>,
{
    let mut replaced = 0;
    let out = RE_PLACEHOLDER.replace_all(html, |caps: &Captures| {
        let placeholder = parse_placeholder(&caps[1]);
        match resolve(&placeholder) {
            Some(markup) => {
                replaced += 1;
                markup
            }
            None => caps[0].to_string(),
        }
    });
    (out.into_owned(), replaced)
}

/// `<img>` markup for an extracted image.
pub fn image_tag(src: &str, alt: &str) -> String {
    format!(
        "<div class=\"figure\"><img src=\"{}\" alt=\"{}\"/></div>",
        escape_text(src),
        escape_text(alt)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_fences_and_commentary() {
        let raw = "```html\n<html><body><p>Hi</p></body></html>\n```";
        assert_eq!(clean_html_response(raw).unwrap(), "<html><body><p>Hi</p></body></html>");

        let raw = "Here is the chapter:\n<HTML><body><p>Hi</p></body></HTML>\nHope it helps!";
        assert_eq!(clean_html_response(raw).unwrap(), "<HTML><body><p>Hi</p></body></HTML>");
    }

    #[test]
    fn unwraps_json_payloads() {
        let raw = r#"{"html": "<body><p>x</p></body>"}"#;
        assert_eq!(clean_html_response(raw).unwrap(), "<body><p>x</p></body>");
        let raw = r#""<div>quoted</div>""#;
        assert_eq!(clean_html_response(raw).unwrap(), "<div>quoted</div>");
    }

    #[test]
    fn falls_back_to_outer_div() {
        let raw = "<div><h1>T</h1><div>inner</div></div> trailing";
        assert_eq!(clean_html_response(raw).unwrap(), "<div><h1>T</h1><div>inner</div></div>");
    }

    #[test]
    fn no_markup_is_validation_error() {
        assert!(matches!(
            clean_html_response("Sorry, I can't help with that."),
            Err(UnitError::Validation(_))
        ));
        assert!(clean_html_response("").is_err());
    }

    #[test]
    fn removes_invisible_characters() {
        let out = clean_html_response("<div>a\u{200B}b\u{FEFF}</div>").unwrap();
        assert_eq!(out, "<div>ab</div>");
    }

    #[test]
    fn parseable_requires_content() {
        assert!(ensure_parseable("<html><body><p>text</p></body></html>").is_ok());
        assert!(ensure_parseable("<html><body>   </body></html>").is_err());
        assert!(ensure_parseable("<html><body><div></div><div> </div></body></html>").is_err());
        assert!(ensure_parseable(r#"<body><img src="../images/a.jpg"/></body>"#).is_ok());
        assert!(ensure_parseable(
            r#"<body><div class="image-placeholder" data-page="0"></div></body>"#
        )
        .is_ok());
    }

    #[test]
    fn skeleton_ignores_text_changes() {
        let a = "<html><body><h1>Title</h1><p>One <em>two</em></p></body></html>";
        let b = "<html><body><h1>Titre</h1><p>Un <em>deux</em></p></body></html>";
        assert!(compare_skeletons(a, b).is_ok());
        assert_eq!(tag_skeleton(a), vec!["h1", "p", "em"]);
    }

    #[test]
    fn skeleton_detects_dropped_element() {
        let a = "<body><h1>T</h1><p>x</p><p>y</p></body>";
        let b = "<body><h1>T</h1><p>x y</p></body>";
        let err = compare_skeletons(a, b).unwrap_err();
        assert!(err.to_string().contains("3 vs 2"), "got: {err}");
    }

    #[test]
    fn visible_text_collapses_whitespace_and_skips_style() {
        let html = "<html><head><title>T</title></head><body><style>p{}</style><h1>Hello</h1>\n<p>big   world</p></body></html>";
        assert_eq!(visible_text(html), "Hello big world");
    }

    #[test]
    fn finds_and_replaces_placeholders() {
        let html = r#"<p>a</p><div class="image-placeholder" id="img1" data-page="2" data-description="A map"></div><div class='image-placeholder' data-page='x'/>"#;
        let found = find_placeholders(html);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].id.as_deref(), Some("img1"));
        assert_eq!(found[0].page, Some(2));
        assert_eq!(found[0].description, "A map");
        assert_eq!(found[1].page, None);

        let (out, n) = replace_placeholders(html, |p| {
            p.page.map(|page| image_tag(&format!("../images/p{page}.jpg"), &p.description))
        });
        assert_eq!(n, 1);
        assert!(out.contains(r#"<img src="../images/p2.jpg" alt="A map"/>"#));
        assert!(out.contains("data-page='x'"));
    }

    #[test]
    fn wraps_fragments_into_documents() {
        let doc = to_xhtml_document("A & B", "<h1>A</h1>", "../stylesheet.css");
        assert!(doc.starts_with("<?xml"));
        assert!(doc.contains("<title>A &amp; B</title>"));
        assert!(doc.contains("<body>\n<h1>A</h1>\n</body>"));
        let full = to_xhtml_document("T", "<html><body><p>x</p></body></html>", "s.css");
        assert!(full.ends_with("<html><body><p>x</p></body></html>\n"));
    }

    #[test]
    fn prolog_is_carried_over() {
        let src = "<?xml version=\"1.0\"?>\n<!DOCTYPE html>\n<html><body>a</body></html>";
        let out = reattach_prolog(src, "<html><body>b</body></html>");
        assert!(out.starts_with("<?xml version=\"1.0\"?>\n<!DOCTYPE html>\n<html>"));
    }
}
