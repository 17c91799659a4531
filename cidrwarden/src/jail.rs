//! Escalating ban jail.
//!
//! Five cells with fixed, increasing ban durations. A CIDR entering the
//! jail starts in the first cell; re-offending after its ban has lapsed
//! promotes it one cell up. Filling a range that already has jailed
//! sub-ranges collapses them into the wider range; filling a range whose
//! super-range is jailed touches only the super-range.
//!
//! The whole jail serialises to a JSON file and reloads exactly,
//! inactive prisoners and timestamps included. All operations take an
//! explicit `now`.

use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::addr::{AddrError, Cidr};
use crate::durfmt;

pub const CELL_COUNT: usize = 5;

const CELL_DURATIONS: [Duration; CELL_COUNT] = [
    Duration::from_secs(10 * 60),
    Duration::from_secs(4 * 60 * 60),
    Duration::from_secs(7 * 24 * 60 * 60),
    Duration::from_secs(30 * 24 * 60 * 60),
    Duration::from_secs(180 * 24 * 60 * 60),
];

const CELL_DESCRIPTIONS: [&str; CELL_COUNT] = [
    "first offence",
    "second offence",
    "repeat offender",
    "persistent offender",
    "long-term ban",
];

#[derive(Debug, Error)]
pub enum JailError {
    #[error("unparsable CIDR: {0}")]
    BadCidr(#[from] AddrError),
    #[error("jail file I/O: {0}")]
    Io(#[from] io::Error),
    #[error("jail file does not describe {CELL_COUNT} cells")]
    BadCellCount,
}

/// A jailed CIDR and its ban metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prisoner {
    pub cidr: Cidr,
    pub ban_start: DateTime<Utc>,
    pub ban_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cell {
    pub id: usize,
    pub description: String,
    #[serde(with = "durfmt::serde_duration")]
    pub ban_duration: Duration,
    pub prisoners: Vec<Prisoner>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Jail {
    cells: Vec<Cell>,
    all_cidrs: Vec<Cidr>,
}

/// Outcome of a batched [`Jail::update`].
#[derive(Debug, Default)]
pub struct UpdateOutcome {
    pub total: usize,
    pub failures: Vec<(String, JailError)>,
}

impl UpdateOutcome {
    /// One-line summary of the failures, if any, surfacing the first
    /// underlying error.
    pub fn summary(&self) -> Option<String> {
        let (input, err) = self.failures.first()?;
        Some(format!(
            "{} of {} CIDRs failed to jail (first: {:?}: {})",
            self.failures.len(),
            self.total,
            input,
            err
        ))
    }
}

impl Jail {
    pub fn new() -> Self {
        let cells = (0..CELL_COUNT)
            .map(|id| Cell {
                id,
                description: CELL_DESCRIPTIONS[id].to_string(),
                ban_duration: CELL_DURATIONS[id],
                prisoners: Vec::new(),
            })
            .collect();
        Self {
            cells,
            all_cidrs: Vec::new(),
        }
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn all_cidrs(&self) -> &[Cidr] {
        &self.all_cidrs
    }

    pub fn prisoner_count(&self) -> usize {
        self.cells.iter().map(|c| c.prisoners.len()).sum()
    }

    /// Deactivate every ban whose duration has lapsed.
    pub fn refresh(&mut self, now: DateTime<Utc>) {
        for cell in &mut self.cells {
            let limit = TimeDelta::from_std(cell.ban_duration).unwrap_or(TimeDelta::MAX);
            for prisoner in &mut cell.prisoners {
                if now - prisoner.ban_start > limit {
                    prisoner.ban_active = false;
                }
            }
        }
    }

    /// Admit one CIDR, escalating and collapsing per the cell rules.
    pub fn fill(&mut self, input: &str, now: DateTime<Utc>) -> Result<(), JailError> {
        let cidr: Cidr = input.parse()?;

        // Exact match: promote only once the current ban has lapsed.
        if let Some((ci, pi)) = self.find_exact(&cidr) {
            if !self.cells[ci].prisoners[pi].ban_active {
                self.promote(ci, pi, now);
            }
            return Ok(());
        }

        // Jailed sub-ranges: collapse them all into the wider range.
        let sub_matches = self.find_subranges(&cidr);
        if !sub_matches.is_empty() {
            let max_cell = sub_matches.iter().map(|&(ci, _)| ci).max().unwrap();
            let mut active_start = None;
            for &(ci, pi) in &sub_matches {
                if ci == max_cell && self.cells[ci].prisoners[pi].ban_active && active_start.is_none()
                {
                    active_start = Some(self.cells[ci].prisoners[pi].ban_start);
                }
            }
            self.remove_prisoners(&sub_matches);

            let (cell, ban_start) = match active_start {
                // An active match pins the new prisoner to that cell with
                // its ban clock.
                Some(start) => (max_cell, start),
                None => ((max_cell + 1).min(CELL_COUNT - 1), now),
            };
            self.cells[cell].prisoners.push(Prisoner {
                cidr,
                ban_start,
                ban_active: true,
            });
            self.all_cidrs.push(cidr);
            return Ok(());
        }

        // A jailed super-range subsumes the input; the input itself is not
        // inserted.
        if let Some((ci, pi)) = self.find_superrange(&cidr) {
            if !self.cells[ci].prisoners[pi].ban_active {
                self.promote(ci, pi, now);
            }
            return Ok(());
        }

        self.cells[0].prisoners.push(Prisoner {
            cidr,
            ban_start: now,
            ban_active: true,
        });
        self.all_cidrs.push(cidr);
        Ok(())
    }

    /// `refresh` once, then `fill` every entry, collecting per-entry
    /// failures instead of aborting the batch.
    pub fn update<I, S>(&mut self, cidrs: I, now: DateTime<Utc>) -> UpdateOutcome
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.refresh(now);
        let mut outcome = UpdateOutcome::default();
        for input in cidrs {
            outcome.total += 1;
            if let Err(err) = self.fill(input.as_ref(), now) {
                outcome.failures.push((input.as_ref().to_string(), err));
            }
        }
        outcome
    }

    /// Every CIDR with a currently active ban, in cell order.
    pub fn list_active(&self) -> Vec<Cidr> {
        self.cells
            .iter()
            .flat_map(|cell| cell.prisoners.iter())
            .filter(|p| p.ban_active)
            .map(|p| p.cidr)
            .collect()
    }

    /// Move a prisoner one cell up (or restart it in the last cell) with a
    /// fresh, active ban.
    fn promote(&mut self, ci: usize, pi: usize, now: DateTime<Utc>) {
        let mut prisoner = self.cells[ci].prisoners.remove(pi);
        prisoner.ban_start = now;
        prisoner.ban_active = true;
        let target = (ci + 1).min(CELL_COUNT - 1);
        self.cells[target].prisoners.push(prisoner);
    }

    fn find_exact(&self, cidr: &Cidr) -> Option<(usize, usize)> {
        self.position(|p| p.cidr == *cidr)
    }

    /// Prisoners strictly contained by `cidr`, in (cell, slot) order.
    fn find_subranges(&self, cidr: &Cidr) -> Vec<(usize, usize)> {
        let mut matches = Vec::new();
        for (ci, cell) in self.cells.iter().enumerate() {
            for (pi, p) in cell.prisoners.iter().enumerate() {
                if cidr.contains(&p.cidr) && p.cidr != *cidr {
                    matches.push((ci, pi));
                }
            }
        }
        matches
    }

    fn find_superrange(&self, cidr: &Cidr) -> Option<(usize, usize)> {
        self.position(|p| p.cidr.contains(cidr) && p.cidr != *cidr)
    }

    fn position<F: Fn(&Prisoner) -> bool>(&self, pred: F) -> Option<(usize, usize)> {
        for (ci, cell) in self.cells.iter().enumerate() {
            if let Some(pi) = cell.prisoners.iter().position(&pred) {
                return Some((ci, pi));
            }
        }
        None
    }

    /// Remove the given (cell, slot) prisoners and drop their CIDRs from
    /// the registry.
    fn remove_prisoners(&mut self, targets: &[(usize, usize)]) {
        let mut removed: Vec<Cidr> = Vec::with_capacity(targets.len());
        for (ci, cell) in self.cells.iter_mut().enumerate() {
            let mut slot = 0usize;
            cell.prisoners.retain(|p| {
                let hit = targets.contains(&(ci, slot));
                if hit {
                    removed.push(p.cidr);
                }
                slot += 1;
                !hit
            });
        }
        self.all_cidrs.retain(|c| !removed.contains(c));
    }

    /// Load a jail from disk. A missing file is an empty jail; a corrupt
    /// file falls back to an empty jail and reports the failure.
    pub fn load(path: &Path) -> (Self, Option<String>) {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return (Self::new(), None),
            Err(err) => {
                let msg = format!("cannot read jail file {}: {err}", path.display());
                warn!("{msg}");
                return (Self::new(), Some(msg));
            }
        };
        if text.trim().is_empty() {
            return (Self::new(), None);
        }
        match serde_json::from_str::<Jail>(&text) {
            Ok(jail) if jail.cells.len() == CELL_COUNT => (jail, None),
            Ok(_) => {
                let msg = format!(
                    "jail file {} is corrupt (wrong cell count); starting with an empty jail",
                    path.display()
                );
                warn!("{msg}");
                (Self::new(), Some(msg))
            }
            Err(err) => {
                let msg = format!(
                    "jail file {} is corrupt ({err}); starting with an empty jail",
                    path.display()
                );
                warn!("{msg}");
                (Self::new(), Some(msg))
            }
        }
    }

    /// Persist atomically: write a temp file next to the target, then
    /// rename over it.
    pub fn save(&self, path: &Path) -> Result<(), JailError> {
        let json = serde_json::to_string_pretty(self).expect("jail serialisation cannot fail");
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl Default for Jail {
    fn default() -> Self {
        Self::new()
    }
}
