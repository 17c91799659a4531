//! Per-record request predicate.
//!
//! Each configured trie carries one of these, compiled once. A record
//! passes when every present pattern matches its field; an absent pattern
//! accepts everything, and an empty field never matches a present pattern.
//! The predicate is pure and shares nothing, so it can be evaluated from
//! any number of worker threads at once.

use regex::Regex;

#[derive(Debug, Clone)]
pub struct RequestFilter {
    ua_re: Option<Regex>,
    ep_re: Option<Regex>,
}

impl RequestFilter {
    /// Compile the optional user-agent and endpoint patterns. Empty
    /// strings mean "no pattern".
    pub fn new(ua_pattern: Option<&str>, ep_pattern: Option<&str>) -> Result<Self, regex::Error> {
        Ok(Self {
            ua_re: compile(ua_pattern)?,
            ep_re: compile(ep_pattern)?,
        })
    }

    pub fn accept_all() -> Self {
        Self {
            ua_re: None,
            ep_re: None,
        }
    }

    pub fn ua_ok(&self, user_agent: &str) -> bool {
        match &self.ua_re {
            None => true,
            Some(re) => !user_agent.is_empty() && re.is_match(user_agent),
        }
    }

    pub fn ep_ok(&self, endpoint: &str) -> bool {
        match &self.ep_re {
            None => true,
            Some(re) => !endpoint.is_empty() && re.is_match(endpoint),
        }
    }

    /// Whether a record with these fields passes the predicate.
    pub fn accepts(&self, user_agent: &str, endpoint: &str) -> bool {
        self.ua_ok(user_agent) && self.ep_ok(endpoint)
    }
}

fn compile(pattern: Option<&str>) -> Result<Option<Regex>, regex::Error> {
    match pattern {
        None => Ok(None),
        Some("") => Ok(None),
        Some(p) => Ok(Some(Regex::new(p)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_patterns_accept_everything() {
        let f = RequestFilter::accept_all();
        assert!(f.accepts("", ""));
        assert!(f.accepts("curl/8.0", "/index.html"));
    }

    #[test]
    fn empty_pattern_string_means_no_pattern() {
        let f = RequestFilter::new(Some(""), Some("")).unwrap();
        assert!(f.accepts("", "/anything"));
    }

    #[test]
    fn both_patterns_must_match() {
        let f = RequestFilter::new(Some("(?i)bot"), Some("^/api/")).unwrap();
        assert!(f.accepts("EvilBot/1.0", "/api/login"));
        assert!(!f.accepts("EvilBot/1.0", "/static/app.css"));
        assert!(!f.accepts("Mozilla/5.0", "/api/login"));
    }

    #[test]
    fn empty_field_never_matches_a_present_pattern() {
        let f = RequestFilter::new(Some(".*"), None).unwrap();
        assert!(!f.accepts("", "/x"));
        let f = RequestFilter::new(None, Some(".*")).unwrap();
        assert!(!f.accepts("ua", ""));
    }

    #[test]
    fn filtering_is_idempotent() {
        let f = RequestFilter::new(Some("bot"), Some("/api")).unwrap();
        let records = [
            ("somebot", "/api/x"),
            ("browser", "/api/x"),
            ("somebot", "/"),
        ];
        let once: Vec<_> = records
            .iter()
            .filter(|(ua, ep)| f.accepts(ua, ep))
            .collect();
        let twice: Vec<_> = once
            .iter()
            .filter(|(ua, ep)| f.accepts(ua, ep))
            .copied()
            .collect();
        assert_eq!(once, twice);
    }

    #[test]
    fn bad_pattern_is_a_compile_error() {
        assert!(RequestFilter::new(Some("("), None).is_err());
    }
}
