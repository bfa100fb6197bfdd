//! Follow-up URL extraction for terms-acceptance interstitials.
//!
//! When a document URL answers with HTML instead of a PDF, the page usually
//! points at the real document through one of a few known shapes. Candidates
//! are returned in priority order, deduplicated, and capped.

use once_cell::sync::OnceCell;
use regex::Regex;
use reqwest::Url;

fn tag_re(cell: &'static OnceCell<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).unwrap())
}

fn attr(attrs: &str, name: &str) -> Option<String> {
    static ATTR: OnceCell<Regex> = OnceCell::new();
    let re = tag_re(&ATTR, r#"(?is)([a-z_:-]+)\s*=\s*(?:"([^"]*)"|'([^']*)')"#);
    re.captures_iter(attrs).find_map(|c| {
        let key = c.get(1)?.as_str();
        if key.eq_ignore_ascii_case(name) {
            let v = c.get(2).or_else(|| c.get(3))?.as_str();
            Some(html_escape::decode_html_entities(v).trim().to_string())
        } else {
            None
        }
    })
}

fn is_accept_label(text: &str) -> bool {
    let t = super::normalize_text(text).to_ascii_lowercase();
    ["accept", "agree", "continue", "proceed"]
        .iter()
        .any(|k| t.contains(k))
}

/// Candidate document URLs found on an interstitial page served from `page_url`.
pub fn candidates(html: &str, page_url: &str, max: usize) -> Vec<String> {
    static INPUT: OnceCell<Regex> = OnceCell::new();
    static ANCHOR: OnceCell<Regex> = OnceCell::new();
    static FORM: OnceCell<Regex> = OnceCell::new();
    static FRAME: OnceCell<Regex> = OnceCell::new();

    let input_re = tag_re(&INPUT, r"(?is)<input\b([^>]*)>");
    let anchor_re = tag_re(&ANCHOR, r"(?is)<a\b([^>]*)>(.*?)</a>");
    let form_re = tag_re(&FORM, r"(?is)<form\b([^>]*)>(.*?)</form>");
    let frame_re = tag_re(&FRAME, r"(?is)<(?:iframe|embed|object)\b([^>]*)>");

    let base = Url::parse(page_url).ok();
    let mut raw: Vec<String> = Vec::new();

    // 1) hidden pdfURL field
    for c in input_re.captures_iter(html) {
        let attrs = &c[1];
        if attr(attrs, "name").is_some_and(|n| n.eq_ignore_ascii_case("pdfurl")) {
            if let Some(v) = attr(attrs, "value") {
                raw.push(v);
            }
        }
    }

    // 2) accept/agree/continue/proceed links
    for c in anchor_re.captures_iter(html) {
        if is_accept_label(&c[2]) {
            if let Some(h) = attr(&c[1], "href") {
                raw.push(h);
            }
        }
    }

    // 3) consent forms, submitted as GET with their hidden fields
    for c in form_re.captures_iter(html) {
        let body = &c[2];
        let labelled = input_re.captures_iter(body).any(|i| {
            attr(&i[1], "value").is_some_and(|v| is_accept_label(&v))
        }) || is_accept_label(body);
        if !labelled {
            continue;
        }
        let Some(action) = attr(&c[1], "action") else { continue };
        let fields: Vec<(String, String)> = input_re
            .captures_iter(body)
            .filter(|i| attr(&i[1], "type").is_some_and(|t| t.eq_ignore_ascii_case("hidden")))
            .filter_map(|i| Some((attr(&i[1], "name")?, attr(&i[1], "value").unwrap_or_default())))
            .collect();
        match resolve(base.as_ref(), &action) {
            Some(mut url) if !fields.is_empty() => {
                url.query_pairs_mut().extend_pairs(fields.iter());
                raw.push(url.to_string());
            }
            _ => raw.push(action),
        }
    }

    // 4) embedded viewers
    for c in frame_re.captures_iter(html) {
        let attrs = &c[1];
        if let Some(src) = attr(attrs, "src").or_else(|| attr(attrs, "data")) {
            let l = src.to_ascii_lowercase();
            if l.contains("pdf") || l.contains("display") {
                raw.push(src);
            }
        }
    }

    // 5) direct document links
    for c in anchor_re.captures_iter(html) {
        if let Some(h) = attr(&c[1], "href") {
            if h.to_ascii_lowercase().contains(".pdf") {
                raw.push(h);
            }
        }
    }

    let mut out: Vec<String> = Vec::new();
    for r in raw {
        let Some(url) = resolve(base.as_ref(), &r) else { continue };
        let s = url.to_string();
        if s == page_url || out.contains(&s) {
            continue;
        }
        out.push(s);
        if out.len() >= max {
            break;
        }
    }
    out
}

fn resolve(base: Option<&Url>, href: &str) -> Option<Url> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
        return None;
    }
    match base {
        Some(b) => b.join(href).ok(),
        None => Url::parse(href).ok(),
    }
    .filter(|u| matches!(u.scheme(), "http" | "https"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = "https://www.asx.com.au/asx/v2/statistics/displayAnnouncement.do?idsId=1";

    #[test]
    fn hidden_pdf_url_comes_first() {
        let html = r#"
            <form method="post" action="/asx/v2/statistics/announcementTerms.do">
              <input type="hidden" name="pdfURL" value="/asxpdf/20251107/pdf/06abc.pdf">
              <input type="submit" value="Agree and proceed">
            </form>
            <a href="/asxpdf/other.pdf">direct</a>
        "#;
        let c = candidates(html, PAGE, 5);
        assert_eq!(c[0], "https://www.asx.com.au/asxpdf/20251107/pdf/06abc.pdf");
        assert!(c[1].starts_with("https://www.asx.com.au/asx/v2/statistics/announcementTerms.do?pdfURL="));
        assert_eq!(c[2], "https://www.asx.com.au/asxpdf/other.pdf");
    }

    #[test]
    fn iframe_and_accept_link() {
        let html = r#"
            <a href="/terms?accept=1">I Accept</a>
            <iframe src="https://cdn.example.com/display/doc.pdf"></iframe>
            <a href="javascript:void(0)">Continue</a>
        "#;
        let c = candidates(html, PAGE, 5);
        assert_eq!(
            c,
            vec![
                "https://www.asx.com.au/terms?accept=1".to_string(),
                "https://cdn.example.com/display/doc.pdf".to_string(),
            ]
        );
    }

    #[test]
    fn capped_and_deduplicated() {
        let html: String = (0..20)
            .map(|i| format!(r#"<a href="/doc{}.pdf">d</a><a href="/doc{}.pdf">d</a>"#, i, i))
            .collect();
        let c = candidates(&html, PAGE, 3);
        assert_eq!(c.len(), 3);
        assert_eq!(c[0], "https://www.asx.com.au/doc0.pdf");
        assert_eq!(c[1], "https://www.asx.com.au/doc1.pdf");
    }

    #[test]
    fn plain_page_yields_nothing() {
        assert!(candidates("<html><body>Not found</body></html>", PAGE, 5).is_empty());
    }
}
