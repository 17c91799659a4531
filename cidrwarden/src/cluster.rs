//! Cluster detection over the counted trie.
//!
//! A subtree becomes a detected CIDR when it is large enough, deep enough,
//! and cohesive: its two children carry comparable shares of the subtree's
//! count. Cohesion uses integer arithmetic only; the configured threshold
//! is fixed to thousandths once up front.
//!
//! Emitted CIDRs are neither sorted nor deduplicated here; callers pass
//! them through [`crate::addr::merge`] before use.

use std::thread;

use thiserror::Error;

use crate::addr::Cidr;
use crate::trie::CountedTrie;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ClusterError {
    #[error("min_depth {min_depth} exceeds max_depth {max_depth}")]
    DepthOrder { min_depth: u8, max_depth: u8 },
    #[error("depth {0} out of range (0-32)")]
    DepthRange(u8),
    #[error("mean_diff_threshold {0} outside [0, 2]")]
    ThresholdRange(f64),
    #[error("min_size must be at least 1")]
    ZeroMinSize,
}

/// Thresholds governing CIDR emission for one detection pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClusterParams {
    /// Minimum number of addresses a subtree must hold.
    pub min_size: u32,
    /// Shallowest prefix length that may be emitted.
    pub min_depth: u8,
    /// Deepest prefix length visited; subtrees are cut off here.
    pub max_depth: u8,
    /// Child-balance threshold in [0, 2]; 0 demands perfect balance,
    /// 2 accepts any split.
    pub mean_diff_threshold: f64,
}

impl ClusterParams {
    pub fn validate(&self) -> Result<(), ClusterError> {
        if self.min_size == 0 {
            return Err(ClusterError::ZeroMinSize);
        }
        if self.max_depth > 32 {
            return Err(ClusterError::DepthRange(self.max_depth));
        }
        if self.min_depth > self.max_depth {
            return Err(ClusterError::DepthOrder {
                min_depth: self.min_depth,
                max_depth: self.max_depth,
            });
        }
        if !(0.0..=2.0).contains(&self.mean_diff_threshold) {
            return Err(ClusterError::ThresholdRange(self.mean_diff_threshold));
        }
        Ok(())
    }

    /// Threshold in thousandths, the form the balance test consumes.
    fn threshold_thousandths(&self) -> u64 {
        (self.mean_diff_threshold * 1000.0).round() as u64
    }
}

/// Integer form of `|a - b| / count < threshold / 2`.
fn balanced(a: u32, b: u32, count: u32, threshold_thousandths: u64) -> bool {
    if a == b {
        return true;
    }
    let diff = a.abs_diff(b) as u64;
    2000 * diff < threshold_thousandths * count as u64
}

/// One work item of the traversal: a node with the prefix and depth it
/// represents.
#[derive(Clone, Copy)]
struct Visit {
    node: u32,
    prefix: u32,
    depth: u8,
}

/// Walk the trie and emit every CIDR satisfying `params`.
pub fn collect(trie: &CountedTrie, params: &ClusterParams) -> Vec<Cidr> {
    let mut out = Vec::new();
    let mut stack = vec![Visit {
        node: trie.root(),
        prefix: 0,
        depth: 0,
    }];
    walk(trie, params, &mut stack, &mut out, None);
    out
}

/// Core traversal. Processes `stack` until empty; when `cut_depth` is set,
/// nodes reaching that depth are pushed onto the returned frontier instead
/// of being descended into.
fn walk(
    trie: &CountedTrie,
    params: &ClusterParams,
    stack: &mut Vec<Visit>,
    out: &mut Vec<Cidr>,
    cut_depth: Option<u8>,
) -> Vec<Visit> {
    let threshold = params.threshold_thousandths();
    let mut frontier = Vec::new();

    while let Some(visit) = stack.pop() {
        let node = trie.node(visit.node);

        if visit.depth == params.max_depth {
            if node.count >= params.min_size {
                out.push(Cidr::new_unchecked(visit.prefix, visit.depth));
            }
            continue;
        }
        if node.count < params.min_size {
            continue;
        }

        let a = node.child(0).map_or(0, |c| trie.node(c).count);
        let b = node.child(1).map_or(0, |c| trie.node(c).count);

        if node.is_leaf() {
            continue;
        }
        if balanced(a, b, node.count, threshold) && visit.depth >= params.min_depth {
            out.push(Cidr::new_unchecked(visit.prefix, visit.depth));
            continue;
        }

        if cut_depth == Some(visit.depth) {
            frontier.push(visit);
            continue;
        }

        // Push the larger child first so the smaller one is processed
        // first, keeping the peak stack depth down.
        let order: [usize; 2] = if a <= b { [1, 0] } else { [0, 1] };
        for &bit in &order {
            if let Some(child) = node.child(bit) {
                let mut prefix = visit.prefix;
                if bit == 1 {
                    prefix |= 1u32 << (31 - visit.depth);
                }
                stack.push(Visit {
                    node: child,
                    prefix,
                    depth: visit.depth + 1,
                });
            }
        }
    }

    frontier
}

/// Partitioned variant for large tries: apply the normal rules down to a
/// shallow cut depth, then hand the surviving subtrees to a pool of scoped
/// worker threads and concatenate their emissions.
pub fn collect_parallel(trie: &CountedTrie, params: &ClusterParams, workers: usize) -> Vec<Cidr> {
    let workers = workers.max(1);
    if workers == 1 {
        return collect(trie, params);
    }

    // Enough splits to produce roughly `workers` subtrees.
    let cut = (usize::BITS - (workers - 1).leading_zeros()) as u8;
    let cut = cut.min(params.max_depth);

    let mut out = Vec::new();
    let mut stack = vec![Visit {
        node: trie.root(),
        prefix: 0,
        depth: 0,
    }];
    let frontier = walk(trie, params, &mut stack, &mut out, Some(cut));
    if frontier.is_empty() {
        return out;
    }

    let chunk = frontier.len().div_ceil(workers);
    let results: Vec<Vec<Cidr>> = thread::scope(|scope| {
        let handles: Vec<_> = frontier
            .chunks(chunk)
            .map(|part| {
                scope.spawn(move || {
                    let mut emitted = Vec::new();
                    let mut stack = part.to_vec();
                    walk(trie, params, &mut stack, &mut emitted, None);
                    emitted
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for part in results {
        out.extend(part);
    }
    out
}
