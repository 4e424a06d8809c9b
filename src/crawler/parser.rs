//! HTML link and metadata extraction
//!
//! Link extraction follows `<a href>` and canonical `<link>` tags, skipping
//! non-navigational schemes, fragment-only anchors, and download links.
//! `rel="nofollow"` links ARE followed; nofollow addresses ranking, not
//! crawling.

use scraper::{Html, Selector};
use url::Url;

/// Metadata pulled from a fetched page
#[derive(Debug, Clone, Default)]
pub struct PageMetadata {
    pub title: Option<String>,
    pub description: Option<String>,
}

/// Extracts all followable absolute links from an HTML document.
pub fn extract_links(html: &str, base_url: &Url) -> Vec<String> {
    let document = Html::parse_document(html);
    let mut links = Vec::new();

    if let Ok(selector) = Selector::parse("a[href]") {
        for element in document.select(&selector) {
            if element.value().attr("download").is_some() {
                continue;
            }
            if let Some(href) = element.value().attr("href") {
                if let Some(absolute) = resolve_link(href, base_url) {
                    links.push(absolute);
                }
            }
        }
    }

    if let Ok(selector) = Selector::parse("link[rel='canonical'][href]") {
        for element in document.select(&selector) {
            if let Some(href) = element.value().attr("href") {
                if let Some(absolute) = resolve_link(href, base_url) {
                    links.push(absolute);
                }
            }
        }
    }

    links
}

/// Extracts the title and description from an HTML document.
///
/// The description prefers `<meta name="description">` and falls back to
/// `<meta property="og:description">`.
pub fn extract_metadata(html: &str) -> PageMetadata {
    let document = Html::parse_document(html);

    let title = Selector::parse("title").ok().and_then(|selector| {
        document
            .select(&selector)
            .next()
            .map(|el| el.text().collect::<String>().trim().to_string())
            .filter(|s| !s.is_empty())
    });

    let description = meta_content(&document, "meta[name='description']")
        .or_else(|| meta_content(&document, "meta[property='og:description']"));

    PageMetadata { title, description }
}

fn meta_content(document: &Html, selector: &str) -> Option<String> {
    let selector = Selector::parse(selector).ok()?;
    document
        .select(&selector)
        .next()
        .and_then(|el| el.value().attr("content"))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Resolves an href to an absolute HTTP(S) URL, or rejects it.
fn resolve_link(href: &str, base_url: &Url) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') {
        return None;
    }
    if href.starts_with("javascript:")
        || href.starts_with("mailto:")
        || href.starts_with("tel:")
        || href.starts_with("data:")
    {
        return None;
    }
    match base_url.join(href) {
        Ok(absolute) if absolute.scheme() == "http" || absolute.scheme() == "https" => {
            Some(absolute.to_string())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://example.com/page").unwrap()
    }

    #[test]
    fn test_absolute_link() {
        let html = r#"<a href="https://example.com/other">x</a>"#;
        assert_eq!(
            extract_links(html, &base()),
            vec!["https://example.com/other"]
        );
    }

    #[test]
    fn test_relative_links_resolve() {
        let html = r#"<a href="/abs">a</a><a href="rel">b</a>"#;
        let links = extract_links(html, &base());
        assert_eq!(
            links,
            vec!["https://example.com/abs", "https://example.com/rel"]
        );
    }

    #[test]
    fn test_skips_special_schemes() {
        let html = r#"
            <a href="javascript:void(0)">j</a>
            <a href="mailto:x@example.com">m</a>
            <a href="tel:+15551234">t</a>
            <a href="data:text/plain,hi">d</a>
        "#;
        assert!(extract_links(html, &base()).is_empty());
    }

    #[test]
    fn test_skips_fragment_only() {
        let html = r##"<a href="#section">jump</a>"##;
        assert!(extract_links(html, &base()).is_empty());
    }

    #[test]
    fn test_skips_download_links() {
        let html = r#"<a href="/file.zip" download>get</a>"#;
        assert!(extract_links(html, &base()).is_empty());
    }

    #[test]
    fn test_follows_nofollow() {
        let html = r#"<a href="/page" rel="nofollow">n</a>"#;
        assert_eq!(extract_links(html, &base()), vec!["https://example.com/page"]);
    }

    #[test]
    fn test_canonical_link_included() {
        let html =
            r#"<link rel="canonical" href="https://example.com/canonical" /><a href="/a">a</a>"#;
        let links = extract_links(html, &base());
        assert!(links.contains(&"https://example.com/canonical".to_string()));
        assert!(links.contains(&"https://example.com/a".to_string()));
    }

    #[test]
    fn test_title_extraction() {
        let html = "<html><head><title>  A Title  </title></head><body></body></html>";
        let meta = extract_metadata(html);
        assert_eq!(meta.title.as_deref(), Some("A Title"));
    }

    #[test]
    fn test_missing_title() {
        let meta = extract_metadata("<html><body>no head</body></html>");
        assert_eq!(meta.title, None);
    }

    #[test]
    fn test_description_extraction() {
        let html = r#"<head><meta name="description" content="About this page"></head>"#;
        let meta = extract_metadata(html);
        assert_eq!(meta.description.as_deref(), Some("About this page"));
    }

    #[test]
    fn test_og_description_fallback() {
        let html = r#"<head><meta property="og:description" content="Social blurb"></head>"#;
        let meta = extract_metadata(html);
        assert_eq!(meta.description.as_deref(), Some("Social blurb"));
    }

    #[test]
    fn test_named_description_preferred_over_og() {
        let html = r#"<head>
            <meta property="og:description" content="Social">
            <meta name="description" content="Plain">
        </head>"#;
        let meta = extract_metadata(html);
        assert_eq!(meta.description.as_deref(), Some("Plain"));
    }

    #[test]
    fn test_malformed_html_does_not_panic() {
        let html = "<html><a href='/x'<b>broken";
        let _ = extract_links(html, &base());
        let _ = extract_metadata(html);
    }
}
