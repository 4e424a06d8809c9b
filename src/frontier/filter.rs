//! Per-job link filtering
//!
//! Filter order: in-domain, then exclude patterns (any match rejects), then
//! include patterns (when non-empty, at least one must match). Patterns are
//! compiled once per job; recompiling per page would dominate discovery cost.

use crate::job::JobConfig;
use crate::url::in_scope;
use regex::Regex;
use url::Url;

/// Compiled link acceptance filter for one job
#[derive(Debug)]
pub struct LinkFilter {
    domain: String,
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl LinkFilter {
    /// Compiles the job's patterns. Pattern validity was already checked at
    /// job creation, so a failure here means the stored config was edited
    /// out-of-band.
    pub fn compile(domain: &str, config: &JobConfig) -> Result<Self, regex::Error> {
        let include = config
            .include_patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        let exclude = config
            .exclude_patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            domain: domain.to_lowercase(),
            include,
            exclude,
        })
    }

    /// Decides whether a discovered link enters the frontier.
    pub fn accepts(&self, url: &Url) -> bool {
        let host = match url.host_str() {
            Some(host) => host,
            None => return false,
        };
        if !in_scope(host, &self.domain) {
            return false;
        }

        let text = url.as_str();
        if self.exclude.iter().any(|re| re.is_match(text)) {
            return false;
        }
        if !self.include.is_empty() && !self.include.iter().any(|re| re.is_match(text)) {
            return false;
        }
        true
    }
}
