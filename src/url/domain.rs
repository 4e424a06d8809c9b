use url::Url;

/// Extracts the lowercase host from a URL
///
/// # Examples
///
/// ```
/// use url::Url;
/// use kumo::extract_domain;
///
/// let url = Url::parse("https://Blog.Example.com/post").unwrap();
/// assert_eq!(extract_domain(&url), Some("blog.example.com".to_string()));
/// ```
pub fn extract_domain(url: &Url) -> Option<String> {
    url.host_str().map(|h| h.to_lowercase())
}

/// Tests whether a host belongs to the crawl domain.
///
/// A host is in scope when it equals the job domain or is a subdomain of it
/// (`host == domain || host ends-with "." + domain`). Ports are not part of
/// the comparison.
pub fn in_scope(host: &str, job_domain: &str) -> bool {
    let host = host.to_lowercase();
    let domain = job_domain.to_lowercase();
    host == domain || host.ends_with(&format!(".{}", domain))
}
