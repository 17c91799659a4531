//! One-shot analysis of an access-log file.
//!
//! The file is parsed once by a pool of worker threads (rejected lines
//! are counted, never sent), then each configured trie filters the record
//! set in parallel, inserts the surviving addresses, and runs its
//! detection parameter sets. Jail updates happen only for parameter sets
//! marked `use_for_jail`.

use std::collections::HashMap;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::Instant;

use anyhow::Context;
use chrono::{DateTime, Utc};
use log::{info, warn};

use cidrwarden::addr::{merge, parse_addr, Cidr};
use cidrwarden::cluster::collect;
use cidrwarden::filter::RequestFilter;
use cidrwarden::jail::Jail;
use cidrwarden::lists::{load_cidr_list, load_ua_list, CidrList, UaList};
use cidrwarden::logfmt::LogFormat;
use cidrwarden::report::{
    DetectionParams, DetectionReport, ParsingStats, RangeCount, RenderMode, Report, TimeRange,
    TrieParameters, TrieReport, TrieStats,
};
use cidrwarden::trie::CountedTrie;

use crate::config::{TrieConfig, WardenConfig};

/// A parsed access-log record, trimmed to what filtering and insertion
/// need.
#[derive(Debug, Clone)]
struct ParsedRecord {
    addr: u32,
    ts: Option<DateTime<Utc>>,
    endpoint: String,
    user_agent: String,
}

pub fn run(
    config: &WardenConfig,
    log_file: &Path,
    mode: RenderMode,
    output: Option<&PathBuf>,
) -> anyhow::Result<()> {
    let started = Instant::now();
    let now = Utc::now();
    let mut report = Report::new("static", now);
    report.general.log_file = Some(log_file.display().to_string());

    let format = LogFormat::parse(&config.log_format).context("log_format")?;
    let text = fs::read_to_string(log_file)
        .with_context(|| format!("cannot read log file {}", log_file.display()))?;

    let whitelist = load_optional_cidrs(config.whitelist.as_deref(), &report, "whitelist");
    let ua_allow = load_optional_uas(config.ua_allow.as_deref(), &report, "ua_allow");
    let ua_deny = load_optional_uas(config.ua_deny.as_deref(), &report, "ua_deny");

    // Parse phase: fan the lines out over a bounded worker pool. Rejects
    // are counted locally and merged, never sent as records.
    let parse_started = Instant::now();
    let lines: Vec<&str> = text.lines().collect();
    let (records, rejects) = parse_lines(&lines, &format);
    let parse_ms = parse_started.elapsed().as_millis() as u64;

    for (kind, count) in &rejects {
        report.push_warning_count(kind, *count);
    }

    report.general.total_requests = records.len() as u64;
    report.general.unique_ips = records.iter().map(|r| r.addr).collect::<HashSet<_>>().len() as u64;
    report.general.parsing = ParsingStats {
        duration_ms: parse_ms,
        rate_per_second: if parse_ms == 0 {
            lines.len() as u64 * 1000
        } else {
            lines.len() as u64 * 1000 / parse_ms
        },
        format: config.log_format.clone(),
    };
    report.general.time_range = time_range_of(&records);
    info!(
        "parsed {} records from {} lines in {} ms",
        records.len(),
        lines.len(),
        parse_ms
    );

    // Addresses whose user agent is always jailed.
    let denied_addrs: Vec<u32> = if ua_deny.is_empty() {
        Vec::new()
    } else {
        records
            .iter()
            .filter(|r| ua_deny.matches(&r.user_agent))
            .map(|r| r.addr)
            .collect()
    };

    let mut to_jail: Vec<Cidr> = denied_addrs.into_iter().map(Cidr::single).collect();

    for trie_config in &config.tries {
        let (trie_report, jail_cidrs) =
            analyse_trie(trie_config, &records, &ua_allow, &report)?;
        to_jail.extend(jail_cidrs);
        report.tries.push(trie_report);
    }

    let jail_configured = config
        .tries
        .iter()
        .any(|t| t.clusters.iter().any(|c| c.use_for_jail));
    if jail_configured || !to_jail.is_empty() {
        let mut merged = merge(to_jail);
        merged.retain(|c| !whitelist.intersects(c));
        let (mut jail, load_warning) = Jail::load(&config.jail_file);
        if let Some(warning) = load_warning {
            report.push_warning(&warning);
        }
        let outcome = jail.update(merged.iter().map(|c| c.to_string()), now);
        if let Some(summary) = outcome.summary() {
            report.push_error(&summary);
        }
        if let Err(err) = jail.save(&config.jail_file) {
            report.push_error(&format!("cannot persist jail: {err}"));
        }
    }

    report.metadata.duration_ms = started.elapsed().as_millis() as u64;

    let rendered = report.render(mode);
    match output {
        Some(path) => fs::write(path, rendered)
            .with_context(|| format!("cannot write report to {}", path.display()))?,
        None => println!("{rendered}"),
    }
    Ok(())
}

/// Parse lines in parallel; returns accepted records plus reject counts
/// by kind.
fn parse_lines(lines: &[&str], format: &LogFormat) -> (Vec<ParsedRecord>, HashMap<String, u64>) {
    let workers = thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .min(lines.len().max(1));
    let chunk_size = lines.len().div_ceil(workers);

    let (tx, rx) = mpsc::channel::<(Vec<ParsedRecord>, HashMap<String, u64>)>();
    thread::scope(|scope| {
        for chunk in lines.chunks(chunk_size.max(1)) {
            let tx = tx.clone();
            scope.spawn(move || {
                let mut records = Vec::with_capacity(chunk.len());
                let mut rejects: HashMap<String, u64> = HashMap::new();
                for line in chunk {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match parse_one(line, format) {
                        Ok(record) => records.push(record),
                        Err(kind) => *rejects.entry(kind.to_string()).or_default() += 1,
                    }
                }
                // Rejected lines never hit the channel as records.
                let _ = tx.send((records, rejects));
            });
        }
        drop(tx);

        let mut records = Vec::with_capacity(lines.len());
        let mut rejects: HashMap<String, u64> = HashMap::new();
        for (mut chunk_records, chunk_rejects) in rx {
            records.append(&mut chunk_records);
            for (kind, count) in chunk_rejects {
                *rejects.entry(kind).or_default() += count;
            }
        }
        (records, rejects)
    })
}

fn parse_one(line: &str, format: &LogFormat) -> Result<ParsedRecord, &'static str> {
    let http = format.parse_line(line).map_err(|err| err.kind_label())?;
    let addr = parse_addr(&http.ip).map_err(|_| "invalid IPv4 address")?;
    Ok(ParsedRecord {
        addr,
        ts: http.ts,
        endpoint: http.endpoint().to_string(),
        user_agent: http.agent().to_string(),
    })
}

/// Filter the record set for one trie in parallel, insert, detect.
fn analyse_trie(
    trie_config: &TrieConfig,
    records: &[ParsedRecord],
    ua_allow: &UaList,
    report: &Report,
) -> anyhow::Result<(TrieReport, Vec<Cidr>)> {
    let filter = trie_config.filter().context("filter")?;
    let time_range = trie_config.time_range;

    let accepted = filter_records(records, &filter, ua_allow, time_range.as_ref());

    let insert_started = Instant::now();
    let mut addrs: Vec<u32> = accepted.clone();
    addrs.sort_unstable();
    let mut trie = CountedTrie::new();
    trie.insert_sorted_batch(&addrs);
    let insert_ms = insert_started.elapsed().as_millis() as u64;

    let unique = {
        let mut a = addrs.clone();
        a.dedup();
        a.len() as u64
    };

    let cidr_analysis = if trie_config.cidr_ranges.is_empty() {
        None
    } else {
        let mut counts = Vec::new();
        for raw in &trie_config.cidr_ranges {
            match raw.parse::<Cidr>() {
                Ok(cidr) => counts.push(RangeCount {
                    cidr: cidr.to_string(),
                    count: trie.count_in_range(&cidr),
                }),
                Err(err) => report.push_warning(&format!("bad cidr range {raw:?}: {err}")),
            }
        }
        Some(counts)
    };

    let mut data = Vec::with_capacity(trie_config.clusters.len());
    let mut jail_cidrs = Vec::new();
    for cluster in &trie_config.clusters {
        let params = cluster.params();
        let detect_started = Instant::now();
        let emitted = collect(&trie, &params);
        let execution_time_us = detect_started.elapsed().as_micros() as u64;

        let detected_ranges: Vec<RangeCount> = emitted
            .iter()
            .map(|c| RangeCount {
                cidr: c.to_string(),
                count: trie.count_in_range(c),
            })
            .collect();
        let merged = merge(emitted);
        if cluster.use_for_jail {
            jail_cidrs.extend(merged.iter().copied());
        }
        data.push(DetectionReport {
            parameters: DetectionParams {
                min_cluster_size: cluster.min_cluster_size,
                min_depth: cluster.min_depth,
                max_depth: cluster.max_depth,
                mean_subnet_difference: cluster.mean_subnet_difference,
            },
            execution_time_us,
            detected_ranges,
            merged_ranges: merged.iter().map(Cidr::to_string).collect(),
        });
    }

    let trie_report = TrieReport {
        name: trie_config.name.clone(),
        parameters: TrieParameters {
            useragent_regex: trie_config.useragent_regex.clone(),
            endpoint_regex: trie_config.endpoint_regex.clone(),
            time_range: time_range.map(|r| TimeRange {
                start: r.start,
                end: r.end,
            }),
            cidr_ranges: (!trie_config.cidr_ranges.is_empty())
                .then(|| trie_config.cidr_ranges.clone()),
            use_for_jail: Some(trie_config.clusters.iter().map(|c| c.use_for_jail).collect()),
        },
        stats: TrieStats {
            total_requests_after_filtering: accepted.len() as u64,
            unique_ips: unique,
            insert_time_ms: insert_ms,
            cidr_analysis,
        },
        data,
    };
    Ok((trie_report, jail_cidrs))
}

/// Apply one trie's predicate over the record set with a worker pool.
/// Workers send only accepted addresses.
fn filter_records(
    records: &[ParsedRecord],
    filter: &RequestFilter,
    ua_allow: &UaList,
    time_range: Option<&crate::config::TimeRangeConfig>,
) -> Vec<u32> {
    let workers = thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .min(records.len().max(1));
    let chunk_size = records.len().div_ceil(workers);

    let (tx, rx) = mpsc::channel::<Vec<u32>>();
    thread::scope(|scope| {
        for chunk in records.chunks(chunk_size.max(1)) {
            let tx = tx.clone();
            scope.spawn(move || {
                let accepted: Vec<u32> = chunk
                    .iter()
                    .filter(|r| {
                        if !ua_allow.is_empty() && ua_allow.matches(&r.user_agent) {
                            return false;
                        }
                        if let Some(range) = time_range {
                            match r.ts {
                                Some(ts) if ts >= range.start && ts <= range.end => {}
                                _ => return false,
                            }
                        }
                        filter.accepts(&r.user_agent, &r.endpoint)
                    })
                    .map(|r| r.addr)
                    .collect();
                let _ = tx.send(accepted);
            });
        }
        drop(tx);

        let mut out = Vec::new();
        for mut chunk in rx {
            out.append(&mut chunk);
        }
        out
    })
}

fn load_optional_cidrs(path: Option<&Path>, report: &Report, what: &str) -> CidrList {
    let Some(path) = path else {
        return CidrList::default();
    };
    match load_cidr_list(path) {
        Ok(list) => {
            for err in &list.errors {
                report.push_warning(&format!("{what} {}: {err}", path.display()));
            }
            list
        }
        Err(err) => {
            warn!("cannot read {what} {}: {err}", path.display());
            report.push_warning(&format!("cannot read {what} {}: {err}", path.display()));
            CidrList::default()
        }
    }
}

fn load_optional_uas(path: Option<&Path>, report: &Report, what: &str) -> UaList {
    let Some(path) = path else {
        return UaList::default();
    };
    match load_ua_list(path) {
        Ok(list) => list,
        Err(err) => {
            warn!("cannot read {what} {}: {err}", path.display());
            report.push_warning(&format!("cannot read {what} {}: {err}", path.display()));
            UaList::default()
        }
    }
}

fn time_range_of(records: &[ParsedRecord]) -> Option<TimeRange> {
    let mut stamps = records.iter().filter_map(|r| r.ts);
    let first = stamps.next()?;
    let (start, end) = stamps.fold((first, first), |(lo, hi), ts| (lo.min(ts), hi.max(ts)));
    Some(TimeRange { start, end })
}
