//! The structured analysis result.
//!
//! One record per run (or per live iteration) carrying run metadata,
//! global parsing statistics, per-trie filtering/detection results, and
//! aggregated warnings/errors. Pretty and compact renderings are the same
//! JSON schema; plain is a fixed tabular layout for terminals.
//!
//! Warnings and errors append under a mutex so worker threads can report
//! while the owning orchestrator fills in the rest; everything else is
//! written by a single owner and only rendered once complete.

use std::fmt::Write as _;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

/// How to render a [`Report`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    Pretty,
    Compact,
    Plain,
}

/// A deduplicated diagnostic with an occurrence count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Note {
    pub message: String,
    pub count: u64,
}

#[derive(Debug, Serialize)]
pub struct Metadata {
    pub generated_at: DateTime<Utc>,
    /// "static" or "live".
    pub analysis_type: String,
    pub version: String,
    pub duration_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct ParsingStats {
    pub duration_ms: u64,
    pub rate_per_second: u64,
    pub format: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct General {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,
    pub total_requests: u64,
    pub unique_ips: u64,
    pub parsing: ParsingStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_range: Option<TimeRange>,
}

#[derive(Debug, Default, Serialize)]
pub struct TrieParameters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub useragent_regex: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint_regex: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_range: Option<TimeRange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cidr_ranges: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_for_jail: Option<Vec<bool>>,
}

/// A range-of-interest count.
#[derive(Debug, Serialize)]
pub struct RangeCount {
    pub cidr: String,
    pub count: u32,
}

#[derive(Debug, Default, Serialize)]
pub struct TrieStats {
    pub total_requests_after_filtering: u64,
    pub unique_ips: u64,
    pub insert_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cidr_analysis: Option<Vec<RangeCount>>,
}

#[derive(Debug, Serialize)]
pub struct DetectionParams {
    pub min_cluster_size: u32,
    pub min_depth: u8,
    pub max_depth: u8,
    pub mean_subnet_difference: f64,
}

/// Result of one detection pass over one trie.
#[derive(Debug, Serialize)]
pub struct DetectionReport {
    pub parameters: DetectionParams,
    pub execution_time_us: u64,
    pub detected_ranges: Vec<RangeCount>,
    pub merged_ranges: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct TrieReport {
    pub name: String,
    pub parameters: TrieParameters,
    pub stats: TrieStats,
    pub data: Vec<DetectionReport>,
}

#[derive(Debug, Serialize)]
pub struct LiveStats {
    pub window_size: u64,
    pub processed_batch: u64,
    pub loop_duration_ms: u64,
    pub cluster_duration_ms: u64,
    pub active_bans: u64,
    pub detected_cidrs: u64,
    pub merged_cidrs: u64,
}

#[derive(Debug, Serialize)]
pub struct Report {
    pub metadata: Metadata,
    pub general: General,
    pub tries: Vec<TrieReport>,
    #[serde(serialize_with = "serialize_notes")]
    warnings: Mutex<Vec<Note>>,
    #[serde(serialize_with = "serialize_notes")]
    errors: Mutex<Vec<Note>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub live_stats: Option<LiveStats>,
}

fn serialize_notes<S: Serializer>(notes: &Mutex<Vec<Note>>, serializer: S) -> Result<S::Ok, S::Error> {
    notes.lock().unwrap().serialize(serializer)
}

impl Report {
    pub fn new(analysis_type: &str, generated_at: DateTime<Utc>) -> Self {
        Self {
            metadata: Metadata {
                generated_at,
                analysis_type: analysis_type.to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                duration_ms: 0,
            },
            general: General {
                log_file: None,
                total_requests: 0,
                unique_ips: 0,
                parsing: ParsingStats {
                    duration_ms: 0,
                    rate_per_second: 0,
                    format: String::new(),
                },
                time_range: None,
            },
            tries: Vec::new(),
            warnings: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
            live_stats: None,
        }
    }

    /// Append a warning, merging with an existing note of the same message.
    pub fn push_warning(&self, message: &str) {
        push_note(&self.warnings, message, 1);
    }

    /// Append an error, merging with an existing note of the same message.
    pub fn push_error(&self, message: &str) {
        push_note(&self.errors, message, 1);
    }

    /// Append a note observed `count` times (for pre-aggregated rejects).
    pub fn push_warning_count(&self, message: &str, count: u64) {
        push_note(&self.warnings, message, count);
    }

    pub fn warning_count(&self) -> usize {
        self.warnings.lock().unwrap().len()
    }

    pub fn render(&self, mode: RenderMode) -> String {
        match mode {
            RenderMode::Pretty => {
                serde_json::to_string_pretty(self).expect("report serialisation cannot fail")
            }
            RenderMode::Compact => {
                serde_json::to_string(self).expect("report serialisation cannot fail")
            }
            RenderMode::Plain => self.render_plain(),
        }
    }

    fn render_plain(&self) -> String {
        let mut out = String::new();
        let m = &self.metadata;
        let _ = writeln!(out, "{} analysis  {}", m.analysis_type, m.generated_at);
        let _ = writeln!(out, "version {}  took {} ms", m.version, m.duration_ms);
        let g = &self.general;
        if let Some(file) = &g.log_file {
            let _ = writeln!(out, "log file       {file}");
        }
        let _ = writeln!(out, "requests       {}", g.total_requests);
        let _ = writeln!(out, "unique ips     {}", g.unique_ips);
        let _ = writeln!(
            out,
            "parsing        {} ms ({}/s, format {:?})",
            g.parsing.duration_ms, g.parsing.rate_per_second, g.parsing.format
        );
        for trie in &self.tries {
            let _ = writeln!(out);
            let _ = writeln!(out, "== trie {} ==", trie.name);
            let _ = writeln!(
                out,
                "filtered       {} requests, {} unique ips, inserted in {} ms",
                trie.stats.total_requests_after_filtering,
                trie.stats.unique_ips,
                trie.stats.insert_time_ms
            );
            if let Some(ranges) = &trie.stats.cidr_analysis {
                for r in ranges {
                    let _ = writeln!(out, "range          {:<20} {:>8}", r.cidr, r.count);
                }
            }
            for detection in &trie.data {
                let p = &detection.parameters;
                let _ = writeln!(
                    out,
                    "detection      size>={} depth {}..{} diff {} ({} us)",
                    p.min_cluster_size,
                    p.min_depth,
                    p.max_depth,
                    p.mean_subnet_difference,
                    detection.execution_time_us
                );
                for r in &detection.detected_ranges {
                    let _ = writeln!(out, "  detected     {:<20} {:>8}", r.cidr, r.count);
                }
                for c in &detection.merged_ranges {
                    let _ = writeln!(out, "  merged       {c}");
                }
            }
        }
        if let Some(live) = &self.live_stats {
            let _ = writeln!(out);
            let _ = writeln!(
                out,
                "live           window {} batch {} loop {} ms detect {} ms",
                live.window_size, live.processed_batch, live.loop_duration_ms, live.cluster_duration_ms
            );
            let _ = writeln!(
                out,
                "bans           {} active, {} detected, {} merged",
                live.active_bans, live.detected_cidrs, live.merged_cidrs
            );
        }
        let warnings = self.warnings.lock().unwrap();
        for w in warnings.iter() {
            let _ = writeln!(out, "warning        {} (x{})", w.message, w.count);
        }
        let errors = self.errors.lock().unwrap();
        for e in errors.iter() {
            let _ = writeln!(out, "error          {} (x{})", e.message, e.count);
        }
        out
    }
}

fn push_note(notes: &Mutex<Vec<Note>>, message: &str, count: u64) {
    let mut notes = notes.lock().unwrap();
    match notes.iter_mut().find(|n| n.message == message) {
        Some(note) => note.count += count,
        None => notes.push(Note {
            message: message.to_string(),
            count,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;
    use std::thread;

    fn report() -> Report {
        let mut r = Report::new("static", Utc.timestamp_opt(1_700_000_000, 0).unwrap());
        r.general.total_requests = 1000;
        r.general.unique_ips = 42;
        r.general.parsing = ParsingStats {
            duration_ms: 12,
            rate_per_second: 83_333,
            format: "%h %t".to_string(),
        };
        r.tries.push(TrieReport {
            name: "default".to_string(),
            parameters: TrieParameters::default(),
            stats: TrieStats {
                total_requests_after_filtering: 900,
                unique_ips: 40,
                insert_time_ms: 1,
                cidr_analysis: None,
            },
            data: vec![DetectionReport {
                parameters: DetectionParams {
                    min_cluster_size: 500,
                    min_depth: 16,
                    max_depth: 24,
                    mean_subnet_difference: 1.0,
                },
                execution_time_us: 250,
                detected_ranges: vec![RangeCount {
                    cidr: "192.168.1.0/24".to_string(),
                    count: 812,
                }],
                merged_ranges: vec!["192.168.1.0/24".to_string()],
            }],
        });
        r
    }

    #[test]
    fn pretty_and_compact_share_a_schema() {
        let r = report();
        let pretty: serde_json::Value = serde_json::from_str(&r.render(RenderMode::Pretty)).unwrap();
        let compact: serde_json::Value =
            serde_json::from_str(&r.render(RenderMode::Compact)).unwrap();
        assert_eq!(pretty, compact);
        assert_eq!(pretty["metadata"]["analysis_type"], "static");
        assert_eq!(pretty["tries"][0]["data"][0]["detected_ranges"][0]["count"], 812);
        assert!(pretty["warnings"].as_array().unwrap().is_empty());
    }

    #[test]
    fn absent_optional_fields_are_omitted() {
        let r = report();
        let json: serde_json::Value = serde_json::from_str(&r.render(RenderMode::Compact)).unwrap();
        assert!(json["general"].get("log_file").is_none());
        assert!(json.get("live_stats").is_none());
    }

    #[test]
    fn notes_aggregate_by_message() {
        let r = report();
        r.push_warning("invalid IPv4 address");
        r.push_warning("invalid IPv4 address");
        r.push_warning("malformed log line");
        r.push_warning_count("invalid IPv4 address", 3);
        let json: serde_json::Value = serde_json::from_str(&r.render(RenderMode::Compact)).unwrap();
        let warnings = json["warnings"].as_array().unwrap();
        assert_eq!(warnings.len(), 2);
        assert_eq!(warnings[0]["message"], "invalid IPv4 address");
        assert_eq!(warnings[0]["count"], 5);
    }

    #[test]
    fn note_appends_are_thread_safe() {
        let r = Arc::new(report());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let r = Arc::clone(&r);
                thread::spawn(move || {
                    for _ in 0..100 {
                        r.push_error("rejected record");
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let json: serde_json::Value = serde_json::from_str(&r.render(RenderMode::Compact)).unwrap();
        assert_eq!(json["errors"][0]["count"], 800);
    }

    #[test]
    fn plain_rendering_mentions_the_essentials() {
        let r = report();
        r.push_warning("something odd");
        let plain = r.render(RenderMode::Plain);
        assert!(plain.contains("static analysis"));
        assert!(plain.contains("192.168.1.0/24"));
        assert!(plain.contains("something odd"));
    }
}
