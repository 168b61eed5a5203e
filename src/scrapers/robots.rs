//! Minimal robots.txt honoring with a per-domain rule cache.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use reqwest::Client;
use tracing::debug;
use url::Url;

const CACHE_TTL: Duration = Duration::from_secs(24 * 3600);

/// Parsed rules for one host: `(allow, path-prefix)` pairs from the groups
/// that apply to our user agent. The longest matching prefix wins; at equal
/// length Allow beats Disallow.
#[derive(Debug, Clone, Default)]
struct RobotsRules {
    rules: Vec<(bool, String)>,
}

impl RobotsRules {
    fn parse(body: &str, user_agent: &str) -> Self {
        let ua_token = user_agent
            .split('/')
            .next()
            .unwrap_or(user_agent)
            .to_lowercase();
        let mut rules = Vec::new();
        let mut group_applies = false;
        let mut in_group_header = false;

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
                    let agent = value.to_lowercase();
                    let matches = agent == "*" || ua_token.contains(&agent);
                    if in_group_header {
                        group_applies = group_applies || matches;
                    } else {
                        group_applies = matches;
                    }
                    in_group_header = true;
                }
                "allow" | "disallow" => {
                    in_group_header = false;
                    if group_applies && !value.is_empty() {
                        rules.push((key == "allow", value.to_string()));
                    }
                }
                _ => {
                    in_group_header = false;
                }
            }
        }
        Self { rules }
    }

    fn allows(&self, path: &str) -> bool {
        let mut verdict = true;
        let mut best_len = 0usize;
        for (allow, prefix) in &self.rules {
            if path.starts_with(prefix.as_str()) {
                let len = prefix.len();
                if len > best_len || (len == best_len && *allow) {
                    best_len = len;
                    verdict = *allow;
                }
            }
        }
        verdict
    }
}

/// Fetches and caches robots.txt per domain. Unreachable or unparsable files
/// allow everything — politeness must not take the scraper down.
pub struct RobotsCache {
    client: Client,
    user_agent: String,
    cache: Mutex<HashMap<String, (RobotsRules, Instant)>>,
}

impl RobotsCache {
    pub fn new(client: Client, user_agent: String) -> Self {
        Self {
            client,
            user_agent,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn allowed(&self, page_url: &str) -> bool {
        let Ok(parsed) = Url::parse(page_url) else {
            return true;
        };
        let Some(host) = parsed.host_str().map(|h| h.to_string()) else {
            return true;
        };

        let cached = {
            let cache = self.cache.lock();
            cache
                .get(&host)
                .filter(|(_, at)| at.elapsed() < CACHE_TTL)
                .map(|(rules, _)| rules.clone())
        };
        let rules = match cached {
            Some(rules) => rules,
            None => {
                let robots_url = format!("{}://{}/robots.txt", parsed.scheme(), host);
                let body = match self.client.get(&robots_url).send().await {
                    Ok(resp) if resp.status().is_success() => resp.text().await.unwrap_or_default(),
                    Ok(resp) => {
                        debug!(%robots_url, status = %resp.status(), "robots.txt not available");
                        String::new()
                    }
                    Err(err) => {
                        debug!(%robots_url, %err, "robots.txt fetch failed");
                        String::new()
                    }
                };
                let rules = RobotsRules::parse(&body, &self.user_agent);
                self.cache
                    .lock()
                    .insert(host, (rules.clone(), Instant::now()));
                rules
            }
        };

        let path = if parsed.path().is_empty() {
            "/"
        } else {
            parsed.path()
        };
        rules.allows(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROBOTS: &str = "
User-agent: *
Disallow: /cart
Disallow: /checkout
Allow: /cart/shared

User-agent: EvilBot
Disallow: /
";

    #[test]
    fn wildcard_group_applies_to_us() {
        let rules = RobotsRules::parse(ROBOTS, "DealBot/1.0");
        assert!(rules.allows("/category/phones"));
        assert!(!rules.allows("/cart"));
        assert!(!rules.allows("/checkout/step1"));
    }

    #[test]
    fn longest_prefix_wins_and_allow_breaks_ties() {
        let rules = RobotsRules::parse(ROBOTS, "DealBot/1.0");
        assert!(rules.allows("/cart/shared/abc"));
    }

    #[test]
    fn foreign_group_is_ignored() {
        let rules = RobotsRules::parse(ROBOTS, "DealBot/1.0");
        // The EvilBot blanket ban does not apply to us.
        assert!(rules.allows("/"));
    }

    #[test]
    fn empty_file_allows_everything() {
        let rules = RobotsRules::parse("", "DealBot/1.0");
        assert!(rules.allows("/anything"));
    }
}
