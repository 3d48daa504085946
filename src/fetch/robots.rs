//! robots.txt rules per origin.
//!
//! Rules are grouped by `User-agent`. The group naming our product token
//! wins, `*` is the fallback, and no group at all means everything is
//! allowed. Within a group the longest matching pattern decides, with
//! `Allow` winning ties. Patterns support `*` and a trailing `$`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Rule {
    allow: bool,
    pattern: String,
}

/// Parsed rules for one user agent at one origin.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RobotsRules {
    rules: Vec<Rule>,
    disallow_all: bool,
}

impl RobotsRules {
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn disallow_all() -> Self {
        Self {
            rules: Vec::new(),
            disallow_all: true,
        }
    }

    /// Rules in `body` that apply to `user_agent`.
    pub fn parse(body: &str, user_agent: &str) -> Self {
        let token = product_token(user_agent);

        let mut specific: Vec<Rule> = Vec::new();
        let mut wildcard: Vec<Rule> = Vec::new();
        let mut matched_specific = false;

        // Agents of the group being read, and whether rules have started.
        let mut agents: Vec<String> = Vec::new();
        let mut in_rules = false;

        for line in body.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();

            match key.as_str() {
                "user-agent" => {
                    if in_rules {
                        agents.clear();
                        in_rules = false;
                    }
                    agents.push(value.to_ascii_lowercase());
                }
                "allow" | "disallow" => {
                    in_rules = true;
                    if value.is_empty() {
                        continue;
                    }
                    let rule = Rule {
                        allow: key == "allow",
                        pattern: value.to_string(),
                    };
                    if agents.iter().any(|a| *a == token) {
                        matched_specific = true;
                        specific.push(rule.clone());
                    }
                    if agents.iter().any(|a| a == "*") {
                        wildcard.push(rule);
                    }
                }
                _ => {}
            }
        }

        let rules = if matched_specific { specific } else { wildcard };
        Self {
            rules,
            disallow_all: false,
        }
    }

    /// Whether `path` (path plus optional `?query`) may be fetched.
    pub fn allows(&self, path: &str) -> bool {
        if self.disallow_all {
            return false;
        }
        if path == "/robots.txt" {
            return true;
        }
        self.rules
            .iter()
            .filter(|r| pattern_matches(&r.pattern, path))
            .max_by_key(|r| (r.pattern.len(), r.allow))
            .map_or(true, |r| r.allow)
    }
}

/// `linewatch/0.1 (+https://...)` → `linewatch`.
fn product_token(user_agent: &str) -> String {
    user_agent
        .split(|c: char| c == '/' || c.is_whitespace())
        .next()
        .unwrap_or("")
        .to_ascii_lowercase()
}

fn pattern_matches(pattern: &str, path: &str) -> bool {
    let (pattern, anchored) = match pattern.strip_suffix('$') {
        Some(p) => (p, true),
        None => (pattern, false),
    };
    let mut parts = pattern.split('*');
    let first = parts.next().unwrap_or("");
    let Some(mut rest) = path.strip_prefix(first) else {
        return false;
    };
    let parts: Vec<&str> = parts.collect();
    if parts.is_empty() {
        return !anchored || rest.is_empty();
    }
    for (i, part) in parts.iter().enumerate() {
        if anchored && i == parts.len() - 1 {
            return rest.ends_with(part);
        }
        match rest.find(part) {
            Some(idx) => rest = &rest[idx + part.len()..],
            None => return false,
        }
    }
    true
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// Rules per origin (`scheme://host:port`), kept for `ttl`.
#[derive(Debug)]
pub struct RobotsCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, (Instant, Arc<RobotsRules>)>>,
}

impl RobotsCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, origin: &str) -> Option<Arc<RobotsRules>> {
        self.get_at(origin, Instant::now())
    }

    pub fn get_at(&self, origin: &str, now: Instant) -> Option<Arc<RobotsRules>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(origin)
            .filter(|(fetched, _)| now.saturating_duration_since(*fetched) < self.ttl)
            .map(|(_, rules)| Arc::clone(rules))
    }

    pub fn insert(&self, origin: &str, rules: RobotsRules) -> Arc<RobotsRules> {
        self.insert_at(origin, rules, Instant::now())
    }

    pub fn insert_at(&self, origin: &str, rules: RobotsRules, now: Instant) -> Arc<RobotsRules> {
        let rules = Arc::new(rules);
        debug!(origin, rules = rules.rules.len(), "robots.txt cached");
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(origin.to_string(), (now, Arc::clone(&rules)));
        rules
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
