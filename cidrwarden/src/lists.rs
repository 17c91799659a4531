//! Allow/deny list files.
//!
//! Two line-oriented formats: CIDR lists (one CIDR or bare IP per line)
//! and user-agent lists (one string per line). `#` starts a comment that
//! runs to end of line; blank lines are skipped. Parse failures are
//! reported per line and never abort the load.

use std::fs;
use std::io;
use std::path::Path;

use crate::addr::Cidr;

/// A parse failure attributed to its source line (1-based).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineError {
    pub line: usize,
    pub message: String,
}

impl std::fmt::Display for LineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

#[derive(Debug, Default)]
pub struct CidrList {
    pub entries: Vec<Cidr>,
    pub errors: Vec<LineError>,
}

impl CidrList {
    /// Whether any entry contains `addr`.
    pub fn contains_addr(&self, addr: u32) -> bool {
        self.entries.iter().any(|c| c.contains_addr(addr))
    }

    /// Whether any entry overlaps `cidr`.
    pub fn intersects(&self, cidr: &Cidr) -> bool {
        self.entries.iter().any(|c| c.intersects(cidr))
    }
}

/// Parse CIDR list text. Bare addresses load as `/32`.
pub fn parse_cidr_list(text: &str) -> CidrList {
    let mut list = CidrList::default();
    for (idx, raw) in text.lines().enumerate() {
        let Some(entry) = strip_line(raw) else {
            continue;
        };
        match entry.parse::<Cidr>() {
            Ok(cidr) => list.entries.push(cidr),
            Err(err) => list.errors.push(LineError {
                line: idx + 1,
                message: err.to_string(),
            }),
        }
    }
    list
}

pub fn load_cidr_list(path: &Path) -> io::Result<CidrList> {
    Ok(parse_cidr_list(&fs::read_to_string(path)?))
}

/// Exact strings matched as substrings of a request's user agent.
#[derive(Debug, Default, Clone)]
pub struct UaList {
    pub entries: Vec<String>,
}

impl UaList {
    /// True when the user agent contains any listed string verbatim.
    pub fn matches(&self, user_agent: &str) -> bool {
        self.entries.iter().any(|e| user_agent.contains(e))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub fn parse_ua_list(text: &str) -> UaList {
    let entries = text
        .lines()
        .filter_map(strip_line)
        .map(str::to_string)
        .collect();
    UaList { entries }
}

pub fn load_ua_list(path: &Path) -> io::Result<UaList> {
    Ok(parse_ua_list(&fs::read_to_string(path)?))
}

/// Strip a trailing comment and surrounding whitespace; `None` for lines
/// with no content.
fn strip_line(raw: &str) -> Option<&str> {
    let line = match raw.find('#') {
        Some(pos) => &raw[..pos],
        None => raw,
    };
    let line = line.trim();
    (!line.is_empty()).then_some(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cidr_list_parses_entries_and_reports_bad_lines() {
        let text = "\
# network blocks
10.0.0.0/8
192.168.1.77        # bare address becomes /32
not-a-cidr
172.16.0.0/33

2001:db8::/32
";
        let list = parse_cidr_list(text);
        assert_eq!(
            list.entries,
            vec![
                "10.0.0.0/8".parse().unwrap(),
                "192.168.1.77/32".parse().unwrap(),
            ]
        );
        assert_eq!(list.errors.len(), 3);
        assert_eq!(list.errors[0].line, 4);
        assert_eq!(list.errors[1].line, 5);
        assert_eq!(list.errors[2].line, 7);
    }

    #[test]
    fn cidr_list_membership() {
        let list = parse_cidr_list("10.0.0.0/8\n172.16.0.0/16\n");
        assert!(list.contains_addr(crate::addr::parse_addr("10.200.1.1").unwrap()));
        assert!(!list.contains_addr(crate::addr::parse_addr("11.0.0.1").unwrap()));
        assert!(list.intersects(&"10.5.0.0/24".parse().unwrap()));
        assert!(list.intersects(&"0.0.0.0/0".parse().unwrap()));
        assert!(!list.intersects(&"192.168.0.0/16".parse().unwrap()));
    }

    #[test]
    fn ua_list_matches_by_substring() {
        let list = parse_ua_list("badbot\nscrapy   # known scraper\n\n# comment only\n");
        assert_eq!(list.entries, vec!["badbot", "scrapy"]);
        assert!(list.matches("Mozilla/5.0 compatible; badbot/2.1"));
        assert!(list.matches("scrapy/2.11"));
        assert!(!list.matches("Mozilla/5.0"));
        assert!(!list.matches(""));
    }

    #[test]
    fn empty_input_yields_empty_lists() {
        assert!(parse_cidr_list("").entries.is_empty());
        assert!(parse_ua_list("\n\n# nothing\n").is_empty());
    }
}
