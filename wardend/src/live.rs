//! The long-running detection loop.
//!
//! One ingest session feeds every configured window/trie pair. Each
//! iteration pulls a batch, updates the windows, runs every detection
//! parameter set, merges the jail-bound emissions, updates and persists
//! the jail, rewrites the banfile, and emits a live-stats record. The
//! loop leaves cleanly on client EOF or a termination signal, persisting
//! the jail one final time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::Utc;
use log::{error, info, warn};

use cidrwarden::addr::{merge, Cidr};
use cidrwarden::banfile;
use cidrwarden::cluster::{collect, ClusterParams};
use cidrwarden::filter::RequestFilter;
use cidrwarden::jail::Jail;
use cidrwarden::lists::{load_cidr_list, load_ua_list, CidrList, UaList};
use cidrwarden::logfmt::LogFormat;
use cidrwarden::report::{
    DetectionParams, DetectionReport, LiveStats, RangeCount, RenderMode, Report, TrieParameters,
    TrieReport, TrieStats,
};
use cidrwarden::window::{SlidingWindow, TimedRecord};
use ingest::{Batch, IngestListener, ResolvedRequest};

use crate::config::{TrieConfig, WardenConfig};

const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

/// One configured window/trie pair with its compiled filter.
struct LiveTrie {
    config: TrieConfig,
    filter: RequestFilter,
    clusters: Vec<(ClusterParams, bool)>,
    window: SlidingWindow,
}

impl LiveTrie {
    fn new(config: &TrieConfig) -> anyhow::Result<Self> {
        let filter = config.filter().context("filter")?;
        let clusters = config
            .clusters
            .iter()
            .map(|c| (c.params(), c.use_for_jail))
            .collect();
        let max_age = chrono::TimeDelta::from_std(config.window_age)
            .context("window_age out of range")?;
        Ok(Self {
            config: config.clone(),
            filter,
            clusters,
            window: SlidingWindow::new(max_age, config.window_size),
        })
    }
}

pub fn run(config: &WardenConfig, shutdown: Arc<AtomicBool>) -> anyhow::Result<()> {
    let listener = IngestListener::bind(&config.listen)
        .with_context(|| format!("cannot bind ingest port {}", config.listen))?;
    run_inner(config, listener, shutdown)
}

fn run_inner(
    config: &WardenConfig,
    listener: IngestListener,
    shutdown: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let format = LogFormat::parse(&config.log_format).context("log_format")?;
    let whitelist = load_list(config.whitelist.as_deref(), "whitelist");
    let blacklist = load_list(config.blacklist.as_deref(), "blacklist");
    let ua_allow = load_uas(config.ua_allow.as_deref(), "ua_allow");
    let ua_deny = load_uas(config.ua_deny.as_deref(), "ua_deny");

    let mut tries: Vec<LiveTrie> = config
        .tries
        .iter()
        .map(LiveTrie::new)
        .collect::<anyhow::Result<_>>()?;
    let period = config
        .tries
        .iter()
        .map(|t| t.sleep_interval)
        .max()
        .unwrap_or(Duration::from_secs(5));

    let Some(mut session) = listener.accept(&shutdown)? else {
        info!("shutdown requested before a client connected");
        return Ok(());
    };

    let (mut jail, load_warning) = Jail::load(&config.jail_file);
    if let Some(warning) = load_warning {
        warn!("{warning}");
    }

    // Reject kinds already logged once; later occurrences only count.
    let mut logged_rejects: HashMap<&'static str, u64> = HashMap::new();
    let mut iteration: u64 = 0;

    while !shutdown.load(Ordering::Relaxed) {
        let iter_started = Instant::now();

        let batch = match session.next_batch() {
            Ok(batch) => batch,
            Err(err) => {
                error!("ingest session failed: {err}");
                break;
            }
        };
        let events = match batch {
            Batch::Timeout => continue,
            Batch::Eof => {
                info!("ingest client disconnected; leaving the loop");
                break;
            }
            Batch::Events(events) => events,
        };
        if events.is_empty() {
            continue;
        }
        iteration += 1;

        let mut rejects: HashMap<&'static str, u64> = HashMap::new();
        let mut requests: Vec<ResolvedRequest> = Vec::with_capacity(events.len());
        for event in &events {
            match event.resolve(Some(&format)) {
                Ok(request) => requests.push(request),
                Err(err) => {
                    let kind = err.kind_label();
                    let seen = logged_rejects.entry(kind).or_insert(0);
                    if *seen == 0 {
                        warn!("rejected ingest record: {err}");
                    }
                    *seen += 1;
                    *rejects.entry(kind).or_default() += 1;
                }
            }
        }
        // Always-ignore user agents drop out before any trie sees them.
        if !ua_allow.is_empty() {
            requests.retain(|r| !ua_allow.matches(&r.user_agent));
        }

        let now = Utc::now();
        let mut report = Report::new("live", now);
        for (kind, count) in &rejects {
            report.push_warning_count(kind, *count);
        }

        let mut to_jail: Vec<Cidr> = Vec::new();
        let mut detected_total = 0u64;
        let mut cluster_time = Duration::ZERO;

        // Always-jail user agents contribute their source addresses
        // directly.
        if !ua_deny.is_empty() {
            to_jail.extend(
                requests
                    .iter()
                    .filter(|r| ua_deny.matches(&r.user_agent))
                    .map(|r| Cidr::single(r.addr)),
            );
        }

        for trie in &mut tries {
            let records: Vec<TimedRecord> = requests
                .iter()
                .filter_map(|r| {
                    let ua_ok = trie.filter.ua_ok(&r.user_agent);
                    let ep_ok = trie.filter.ep_ok(&r.endpoint);
                    (ua_ok && ep_ok).then_some(TimedRecord {
                        addr: r.addr,
                        ts: r.ts,
                        ua_ok,
                        ep_ok,
                    })
                })
                .collect();
            trie.window.update(&records, now);

            let mut data = Vec::with_capacity(trie.clusters.len());
            for (params, use_for_jail) in &trie.clusters {
                let detect_started = Instant::now();
                let emitted = collect(trie.window.trie(), params);
                let elapsed = detect_started.elapsed();
                cluster_time += elapsed;

                detected_total += emitted.len() as u64;
                let detected_ranges: Vec<RangeCount> = emitted
                    .iter()
                    .map(|c| RangeCount {
                        cidr: c.to_string(),
                        count: trie.window.trie().count_in_range(c),
                    })
                    .collect();
                let merged = merge(emitted);
                if *use_for_jail {
                    to_jail.extend(merged.iter().copied());
                }
                data.push(DetectionReport {
                    parameters: DetectionParams {
                        min_cluster_size: params.min_size,
                        min_depth: params.min_depth,
                        max_depth: params.max_depth,
                        mean_subnet_difference: params.mean_diff_threshold,
                    },
                    execution_time_us: elapsed.as_micros() as u64,
                    detected_ranges,
                    merged_ranges: merged.iter().map(Cidr::to_string).collect(),
                });
            }

            report.tries.push(TrieReport {
                name: trie.config.name.clone(),
                parameters: TrieParameters {
                    useragent_regex: trie.config.useragent_regex.clone(),
                    endpoint_regex: trie.config.endpoint_regex.clone(),
                    time_range: None,
                    cidr_ranges: None,
                    use_for_jail: Some(trie.clusters.iter().map(|(_, j)| *j).collect()),
                },
                stats: TrieStats {
                    total_requests_after_filtering: trie.window.len() as u64,
                    unique_ips: trie.window.unique_addrs() as u64,
                    insert_time_ms: 0,
                    cidr_analysis: None,
                },
                data,
            });
        }

        // Merge the jail-bound emissions and keep whitelisted ranges out.
        let mut merged = merge(to_jail);
        merged.retain(|c| !whitelist.intersects(c));

        let outcome = jail.update(merged.iter().map(|c| c.to_string()), now);
        if let Some(summary) = outcome.summary() {
            error!("{summary}");
            report.push_error(&summary);
        }
        if let Err(err) = jail.save(&config.jail_file) {
            // Persistence failures are reported, not fatal.
            error!("cannot persist jail: {err}");
            report.push_error(&format!("cannot persist jail: {err}"));
        }
        let active = jail.list_active();
        if let Err(err) = banfile::write(&config.ban_file, &active, &blacklist.entries, now) {
            error!("cannot write banfile: {err}");
            report.push_error(&format!("cannot write banfile: {err}"));
        }

        report.general.total_requests = requests.len() as u64;
        report.metadata.duration_ms = iter_started.elapsed().as_millis() as u64;
        report.live_stats = Some(LiveStats {
            window_size: tries.iter().map(|t| t.window.len() as u64).sum(),
            processed_batch: events.len() as u64,
            loop_duration_ms: iter_started.elapsed().as_millis() as u64,
            cluster_duration_ms: cluster_time.as_millis() as u64,
            active_bans: active.len() as u64,
            detected_cidrs: detected_total,
            merged_cidrs: merged.len() as u64,
        });
        println!("{}", report.render(RenderMode::Compact));
        info!(
            "iteration {iteration}: {} events, {} active bans",
            events.len(),
            active.len()
        );

        sleep_remainder(period, iter_started.elapsed(), &shutdown);
    }

    session.close();
    jail.save(&config.jail_file)
        .context("final jail persistence")?;
    info!("live loop stopped; jail persisted");
    Ok(())
}

/// Sleep out the rest of the iteration period, waking early on shutdown.
fn sleep_remainder(period: Duration, spent: Duration, shutdown: &AtomicBool) {
    let mut remaining = period.saturating_sub(spent);
    while !remaining.is_zero() && !shutdown.load(Ordering::Relaxed) {
        let nap = remaining.min(SHUTDOWN_POLL);
        thread::sleep(nap);
        remaining -= nap;
    }
}

fn load_list(path: Option<&std::path::Path>, what: &str) -> CidrList {
    let Some(path) = path else {
        return CidrList::default();
    };
    match load_cidr_list(path) {
        Ok(list) => {
            for err in &list.errors {
                warn!("{what} {}: {err}", path.display());
            }
            list
        }
        Err(err) => {
            warn!("cannot read {what} {}: {err}", path.display());
            CidrList::default()
        }
    }
}

fn load_uas(path: Option<&std::path::Path>, what: &str) -> UaList {
    let Some(path) = path else {
        return UaList::default();
    };
    match load_ua_list(path) {
        Ok(list) => list,
        Err(err) => {
            warn!("cannot read {what} {}: {err}", path.display());
            UaList::default()
        }
    }
}
