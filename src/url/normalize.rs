use crate::{UrlError, UrlResult};
use url::Url;

/// Tracking query parameters removed during normalization
const TRACKING_PARAMS: &[&str] = &["fbclid", "gclid"];

/// Normalizes a URL into its canonical dedup form
///
/// # Normalization Steps
///
/// 1. Parse the URL; reject if malformed or non-HTTP(S)
/// 2. Lowercase the host
/// 3. Strip default ports (80 for http, 443 for https)
/// 4. Strip the trailing slash from the path, except for the root `/`
/// 5. Drop the fragment
/// 6. Drop tracking query parameters (`utm_*`, `fbclid`, `gclid`)
/// 7. Sort remaining query parameters lexicographically by key
/// 8. Preserve the scheme
///
/// The scheme is deliberately preserved: whether an origin serves http or
/// https is decided by the seed, not rewritten here.
///
/// # Arguments
///
/// * `url_str` - The URL string to normalize
///
/// # Returns
///
/// * `Ok(Url)` - The normalized URL
/// * `Err(UrlError)` - The URL could not be parsed or has no host
///
/// # Examples
///
/// ```
/// use kumo::normalize_url;
///
/// let url = normalize_url("https://EXAMPLE.com:443/page/?b=2&a=1#top").unwrap();
/// assert_eq!(url.as_str(), "https://example.com/page?a=1&b=2");
/// ```
pub fn normalize_url(url_str: &str) -> UrlResult<Url> {
    let mut url = Url::parse(url_str).map_err(|e| UrlError::Parse(e.to_string()))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(UrlError::InvalidScheme(url.scheme().to_string()));
    }

    // Lowercase the host. The url crate already lowercases registered domain
    // names at parse time, but set it explicitly for IDN/edge forms.
    match url.host_str() {
        Some(host) => {
            let lowered = host.to_lowercase();
            url.set_host(Some(&lowered))
                .map_err(|e| UrlError::Parse(e.to_string()))?;
        }
        None => return Err(UrlError::MissingHost),
    }

    // Strip default ports. Url::set_port(None) removes an explicit port;
    // Url::port() already returns None for scheme defaults, so only clear
    // when the parsed port matches the default.
    let is_default = matches!(
        (url.scheme(), url.port()),
        (_, None) | ("http", Some(80)) | ("https", Some(443))
    );
    if is_default {
        let _ = url.set_port(None);
    }

    // Trailing slash, except root
    let trimmed = {
        let path = url.path();
        if path.len() > 1 && path.ends_with('/') {
            Some(path.trim_end_matches('/').to_string())
        } else {
            None
        }
    };
    if let Some(trimmed) = trimmed {
        url.set_path(if trimmed.is_empty() { "/" } else { &trimmed });
    }

    url.set_fragment(None);

    if url.query().is_some() {
        let mut params: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(key, _)| !is_tracking_param(key))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        params.sort_by(|a, b| a.0.cmp(&b.0));

        if params.is_empty() {
            url.set_query(None);
        } else {
            let query = params
                .iter()
                .map(|(k, v)| {
                    if v.is_empty() {
                        k.clone()
                    } else {
                        format!("{}={}", k, v)
                    }
                })
                .collect::<Vec<_>>()
                .join("&");
            url.set_query(Some(&query));
        }
    }

    Ok(url)
}

/// Checks if a query parameter carries tracking state only
fn is_tracking_param(key: &str) -> bool {
    key.starts_with("utm_") || TRACKING_PARAMS.contains(&key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lowercase_host() {
        let result = normalize_url("https://EXAMPLE.COM/Page").unwrap();
        assert_eq!(result.as_str(), "https://example.com/Page");
    }

    #[test]
    fn test_strip_default_https_port() {
        let result = normalize_url("https://example.com:443/page").unwrap();
        assert_eq!(result.as_str(), "https://example.com/page");
    }

    #[test]
    fn test_strip_default_http_port() {
        let result = normalize_url("http://example.com:80/page").unwrap();
        assert_eq!(result.as_str(), "http://example.com/page");
    }

    #[test]
    fn test_keep_explicit_port() {
        let result = normalize_url("http://example.com:8080/page").unwrap();
        assert_eq!(result.as_str(), "http://example.com:8080/page");
    }

    #[test]
    fn test_remove_trailing_slash() {
        let result = normalize_url("https://example.com/page/").unwrap();
        assert_eq!(result.as_str(), "https://example.com/page");
    }

    #[test]
    fn test_keep_root_slash() {
        let result = normalize_url("https://example.com/").unwrap();
        assert_eq!(result.as_str(), "https://example.com/");
    }

    #[test]
    fn test_empty_path_becomes_root() {
        let result = normalize_url("https://example.com").unwrap();
        assert_eq!(result.as_str(), "https://example.com/");
    }

    #[test]
    fn test_remove_fragment() {
        let result = normalize_url("https://example.com/page#section").unwrap();
        assert_eq!(result.as_str(), "https://example.com/page");
    }

    #[test]
    fn test_remove_tracking_params() {
        let result =
            normalize_url("https://example.com/page?utm_source=a&fbclid=b&gclid=c").unwrap();
        assert_eq!(result.as_str(), "https://example.com/page");
    }

    #[test]
    fn test_custom_utm_param_removed() {
        let result = normalize_url("https://example.com/page?utm_anything=x").unwrap();
        assert_eq!(result.as_str(), "https://example.com/page");
    }

    #[test]
    fn test_sort_query_params() {
        let result = normalize_url("https://example.com/page?b=2&a=1").unwrap();
        assert_eq!(result.as_str(), "https://example.com/page?a=1&b=2");
    }

    #[test]
    fn test_mixed_query_params() {
        let result =
            normalize_url("https://example.com/page?keep=yes&utm_medium=email&another=v").unwrap();
        assert_eq!(result.as_str(), "https://example.com/page?another=v&keep=yes");
    }

    #[test]
    fn test_scheme_preserved() {
        let result = normalize_url("http://example.com/page").unwrap();
        assert_eq!(result.scheme(), "http");
    }

    #[test]
    fn test_invalid_scheme() {
        let result = normalize_url("ftp://example.com/file");
        assert!(matches!(result, Err(UrlError::InvalidScheme(_))));
    }

    #[test]
    fn test_malformed_url() {
        assert!(normalize_url("not a url").is_err());
    }

    #[test]
    fn test_idempotent() {
        let inputs = [
            "https://Example.com:443/a/b/?z=1&a=2#frag",
            "http://example.com",
            "https://example.com/page?utm_source=x",
            "http://sub.example.com:8080/deep/path/",
        ];
        for input in inputs {
            let once = normalize_url(input).unwrap();
            let twice = normalize_url(once.as_str()).unwrap();
            assert_eq!(once, twice, "not idempotent for {}", input);
        }
    }

    #[test]
    fn test_dedup_equivalence_class() {
        // All spell the same page
        let expected = "https://a.test/a";
        for input in [
            "https://a.test/a",
            "https://a.test/a/",
            "https://a.test/a?utm_source=x",
            "https://a.test/a#top",
        ] {
            assert_eq!(normalize_url(input).unwrap().as_str(), expected);
        }
    }
}
