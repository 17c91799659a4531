//! Daemon configuration.
//!
//! One TOML file drives both verbs. Each `[[trie]]` block describes a
//! configured window/trie pair with its filter patterns and one or more
//! `[[trie.cluster]]` detection parameter sets. Validation runs before
//! anything touches the network or filesystem; failures exit with the
//! config-error code.

use std::fmt;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use cidrwarden::addr::Cidr;
use cidrwarden::cluster::ClusterParams;
use cidrwarden::durfmt;
use cidrwarden::filter::RequestFilter;
use cidrwarden::logfmt::LogFormat;

pub const DEFAULT_LOG_FORMAT: &str = "%h %^ %^ [%t] \"%r\" %s %b \"%^\" \"%u\"";

fn default_listen() -> String {
    "0.0.0.0:5044".to_string()
}

fn default_log_format() -> String {
    DEFAULT_LOG_FORMAT.to_string()
}

fn default_window_age() -> Duration {
    Duration::from_secs(600)
}

fn default_window_size() -> usize {
    100_000
}

fn default_sleep_interval() -> Duration {
    Duration::from_secs(5)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WardenConfig {
    /// TCP address the framed ingest listens on (live verb).
    #[serde(default = "default_listen")]
    pub listen: String,
    pub jail_file: PathBuf,
    pub ban_file: PathBuf,
    /// Template for raw log lines, both in files and framed events.
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// CIDRs that must never be jailed.
    pub whitelist: Option<PathBuf>,
    /// CIDRs always published in the banfile.
    pub blacklist: Option<PathBuf>,
    /// User agents whose requests are always ignored.
    pub ua_allow: Option<PathBuf>,
    /// User agents whose source addresses are always jailed.
    pub ua_deny: Option<PathBuf>,
    #[serde(rename = "trie")]
    pub tries: Vec<TrieConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrieConfig {
    pub name: String,
    pub useragent_regex: Option<String>,
    pub endpoint_regex: Option<String>,
    /// Oldest record retained by the sliding window.
    #[serde(default = "default_window_age", with = "durfmt::serde_duration")]
    pub window_age: Duration,
    /// Most records retained by the sliding window.
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    /// Live iteration period contribution; the loop runs at the longest
    /// configured interval.
    #[serde(default = "default_sleep_interval", with = "durfmt::serde_duration")]
    pub sleep_interval: Duration,
    /// Static verb: only records inside this range are considered.
    pub time_range: Option<TimeRangeConfig>,
    /// Ranges of interest counted into the report.
    #[serde(default)]
    pub cidr_ranges: Vec<String>,
    #[serde(rename = "cluster")]
    pub clusters: Vec<ClusterConfig>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeRangeConfig {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    pub min_cluster_size: u32,
    pub min_depth: u8,
    pub max_depth: u8,
    pub mean_subnet_difference: f64,
    #[serde(default)]
    pub use_for_jail: bool,
}

impl ClusterConfig {
    pub fn params(&self) -> ClusterParams {
        ClusterParams {
            min_size: self.min_cluster_size,
            min_depth: self.min_depth,
            max_depth: self.max_depth,
            mean_diff_threshold: self.mean_subnet_difference,
        }
    }
}

impl TrieConfig {
    pub fn filter(&self) -> Result<RequestFilter, regex::Error> {
        RequestFilter::new(
            self.useragent_regex.as_deref(),
            self.endpoint_regex.as_deref(),
        )
    }
}

/// Validation failures, one message per problem.
#[derive(Debug)]
pub struct ConfigErrors(pub Vec<String>);

impl fmt::Display for ConfigErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "invalid configuration:")?;
        for msg in &self.0 {
            writeln!(f, "  - {msg}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ConfigErrors {}

impl WardenConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        let config: WardenConfig = toml::from_str(&text)
            .with_context(|| format!("cannot parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Check everything that can be checked without touching the network.
    /// `live` additionally requires a bindable listen address.
    pub fn validate(&self, live: bool) -> Result<(), ConfigErrors> {
        let mut errors = Vec::new();

        if self.tries.is_empty() {
            errors.push("at least one [[trie]] block is required".to_string());
        }
        if live && self.listen.parse::<SocketAddr>().is_err() {
            errors.push(format!("listen address {:?} is not host:port", self.listen));
        }
        if let Err(err) = LogFormat::parse(&self.log_format) {
            errors.push(format!("log_format: {err}"));
        }

        for (i, trie) in self.tries.iter().enumerate() {
            let name = if trie.name.is_empty() {
                errors.push(format!("trie #{i} has an empty name"));
                format!("#{i}")
            } else {
                trie.name.clone()
            };
            if self
                .tries
                .iter()
                .filter(|other| other.name == trie.name)
                .count()
                > 1
            {
                errors.push(format!("trie name {name:?} is not unique"));
            }
            if trie.window_size == 0 {
                errors.push(format!("trie {name:?}: window_size must be at least 1"));
            }
            if trie.clusters.is_empty() {
                errors.push(format!("trie {name:?}: at least one [[trie.cluster]] is required"));
            }
            if let Err(err) = trie.filter() {
                errors.push(format!("trie {name:?}: {err}"));
            }
            if let Some(range) = &trie.time_range {
                if range.start > range.end {
                    errors.push(format!("trie {name:?}: time_range start is after end"));
                }
            }
            for raw in &trie.cidr_ranges {
                if raw.parse::<Cidr>().is_err() {
                    errors.push(format!("trie {name:?}: bad cidr range {raw:?}"));
                }
            }
            for (j, cluster) in trie.clusters.iter().enumerate() {
                if let Err(err) = cluster.params().validate() {
                    errors.push(format!("trie {name:?} cluster #{j}: {err}"));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            // Deduplicate repeated messages (e.g. the same duplicate name
            // reported from both ends).
            errors.dedup();
            Err(ConfigErrors(errors))
        }
    }
}
