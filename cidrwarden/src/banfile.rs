//! The published blocklist.
//!
//! A plain text file: a modification-timestamp comment, the active jail
//! bans, and optionally a manual blacklist block. Comment lines (`# `)
//! and blanks are ignored by the reader. Writes are atomic (temp +
//! rename) so readers never observe a partial file.

use std::fs;
use std::io;
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::addr::Cidr;
use crate::lists::{parse_cidr_list, CidrList};

const ACTIVE_HEADER: &str = "# Active jail bans:";
const MANUAL_HEADER: &str = "# Manual blacklist entries:";
const MANUAL_FOOTER: &str = "# End of manual blacklist";

/// Render the banfile body.
pub fn render(active: &[Cidr], manual: &[Cidr], now: DateTime<Utc>) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "# Last modified: {}\n",
        now.to_rfc3339_opts(SecondsFormat::Secs, true)
    ));
    out.push_str(ACTIVE_HEADER);
    out.push('\n');
    for cidr in active {
        out.push_str(&cidr.to_string());
        out.push('\n');
    }
    if !manual.is_empty() {
        out.push_str(MANUAL_HEADER);
        out.push('\n');
        for cidr in manual {
            out.push_str(&cidr.to_string());
            out.push('\n');
        }
        out.push_str(MANUAL_FOOTER);
        out.push('\n');
    }
    out
}

/// Write the banfile atomically.
pub fn write(
    path: &Path,
    active: &[Cidr],
    manual: &[Cidr],
    now: DateTime<Utc>,
) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, render(active, manual, now))?;
    fs::rename(&tmp, path)
}

/// Read every CIDR listed in a banfile, comments and blanks skipped,
/// per-line parse errors reported.
pub fn read(path: &Path) -> io::Result<CidrList> {
    Ok(parse_cidr_list(&fs::read_to_string(path)?))
}
