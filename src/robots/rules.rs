//! Parsed robots.txt rules
//!
//! Wraps the `robotstxt` matcher for allow/deny decisions and parses the
//! `Crawl-delay` directive manually, since the matcher does not expose it.

use robotstxt::DefaultMatcher;

/// Allow/deny rules plus crawl-delay for one domain
///
/// A `None` body means robots.txt was absent or unreachable; by policy that
/// allows everything (the crawler is polite by rate-limit, and the file is
/// advisory).
#[derive(Debug, Clone)]
pub struct RobotsRules {
    body: Option<String>,
}

impl RobotsRules {
    pub fn from_body(body: Option<String>) -> Self {
        Self { body }
    }

    /// Permissive rules, used when no robots.txt exists.
    pub fn allow_all() -> Self {
        Self { body: None }
    }

    pub fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }

    /// Checks if a URL is allowed for the given user agent.
    pub fn is_allowed(&self, url: &str, user_agent: &str) -> bool {
        match &self.body {
            None => true,
            Some(body) if body.is_empty() => true,
            Some(body) => {
                let mut matcher = DefaultMatcher::default();
                matcher.one_agent_allowed_by_robots(body, user_agent, url)
            }
        }
    }

    /// Extracts the `Crawl-delay` declared for `user_agent`, in seconds.
    ///
    /// The directive binds to the most recent `User-agent` group; a group
    /// naming our agent wins over the `*` group.
    pub fn crawl_delay(&self, user_agent: &str) -> Option<f64> {
        let body = self.body.as_deref()?;
        let agent = user_agent.to_lowercase();

        let mut group_agents: Vec<String> = Vec::new();
        let mut in_directives = false;
        let mut wildcard_delay: Option<f64> = None;
        let mut agent_delay: Option<f64> = None;

        for line in body.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim().to_lowercase();
            let value = value.trim();

            match key.as_str() {
                "user-agent" => {
                    // A User-agent line after other directives starts a new group
                    if in_directives {
                        group_agents.clear();
                        in_directives = false;
                    }
                    group_agents.push(value.to_lowercase());
                }
                "crawl-delay" => {
                    in_directives = true;
                    let parsed = value.parse::<f64>().ok().filter(|d| d.is_finite() && *d >= 0.0);
                    if let Some(delay) = parsed {
                        if group_agents.iter().any(|ua| ua != "*" && agent.contains(ua.as_str())) {
                            agent_delay = Some(delay);
                        } else if group_agents.iter().any(|ua| ua == "*") {
                            wildcard_delay = Some(delay);
                        }
                    }
                }
                _ => {
                    in_directives = true;
                }
            }
        }

        agent_delay.or(wildcard_delay)
    }
}
