//! Online detection of abusive CIDR ranges in HTTP access traffic.
//!
//! The pipeline: request records accumulate in a [`window::SlidingWindow`]
//! whose counted [`trie::CountedTrie`] mirrors the live address multiset;
//! [`cluster::collect`] walks the trie and emits cohesive, sufficiently
//! large subtrees as CIDRs; [`addr::merge`] reduces emissions to a minimal
//! cover; the [`jail::Jail`] escalates repeat offenders through fixed ban
//! durations and persists across runs; [`banfile`] publishes the active
//! blocklist.

pub mod addr;
pub mod banfile;
pub mod cluster;
pub mod durfmt;
pub mod filter;
pub mod jail;
pub mod lists;
pub mod logfmt;
pub mod report;
pub mod trie;
pub mod window;

pub use addr::{merge, parse_addr, Cidr};
pub use cluster::{collect, collect_parallel, ClusterParams};
pub use filter::RequestFilter;
pub use jail::Jail;
pub use logfmt::LogFormat;
pub use report::{RenderMode, Report};
pub use trie::{CountedTrie, SharedTrie};
pub use window::{SlidingWindow, TimedRecord};
