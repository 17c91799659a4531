//! IPv4 address codec and CIDR arithmetic.
//!
//! Addresses are packed big-endian into a `u32`; a CIDR is a `(prefix, len)`
//! pair kept in canonical form (host bits zero). Everything here is pure and
//! allocation-free except [`merge`].

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddrError {
    #[error("not an IPv4 address: {0:?}")]
    NotIpv4(String),
    #[error("invalid CIDR notation: {0:?}")]
    BadCidr(String),
    #[error("prefix length {0} out of range (0-32)")]
    BadPrefixLen(u32),
}

/// Parse a dotted-quad IPv4 address into its packed `u32` form.
///
/// IPv6 and anything else that is not strictly `a.b.c.d` is rejected,
/// never coerced.
pub fn parse_addr(s: &str) -> Result<u32, AddrError> {
    let ip = Ipv4Addr::from_str(s.trim()).map_err(|_| AddrError::NotIpv4(s.to_string()))?;
    Ok(u32::from(ip))
}

/// Format a packed address back to dotted-quad form.
pub fn format_addr(addr: u32) -> String {
    Ipv4Addr::from(addr).to_string()
}

/// A contiguous IPv4 address range in prefix notation.
///
/// Always canonical: the host bits of `prefix` are zero. The derived
/// ordering is `(prefix, len)`, which is exactly the sort key [`merge`]
/// relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cidr {
    prefix: u32,
    len: u8,
}

impl Cidr {
    /// Build a CIDR from a prefix and length, masking any host bits down
    /// to the network address.
    pub fn new(prefix: u32, len: u8) -> Result<Self, AddrError> {
        if len > 32 {
            return Err(AddrError::BadPrefixLen(len as u32));
        }
        Ok(Self {
            prefix: prefix & !host_mask(len),
            len,
        })
    }

    /// A `/32` covering exactly one address.
    pub fn single(addr: u32) -> Self {
        Self {
            prefix: addr,
            len: 32,
        }
    }

    pub(crate) fn new_unchecked(prefix: u32, len: u8) -> Self {
        debug_assert!(len <= 32);
        debug_assert_eq!(prefix & host_mask(len), 0);
        Self { prefix, len }
    }

    pub fn prefix(&self) -> u32 {
        self.prefix
    }

    pub fn len(&self) -> u8 {
        self.len
    }

    /// Inclusive `(start, end)` bounds of the range.
    pub fn range(&self) -> (u32, u32) {
        (self.prefix, self.prefix | host_mask(self.len))
    }

    /// Whether `addr` falls inside this range. A `/0` contains everything.
    pub fn contains_addr(&self, addr: u32) -> bool {
        addr & !host_mask(self.len) == self.prefix
    }

    /// Whether `other` is a sub-range of (or equal to) this range.
    pub fn contains(&self, other: &Cidr) -> bool {
        self.len <= other.len && other.prefix & !host_mask(self.len) == self.prefix
    }

    /// Whether the two ranges share at least one address.
    pub fn intersects(&self, other: &Cidr) -> bool {
        self.contains(other) || other.contains(self)
    }

    /// The other half of this range's parent, if this is not `/0`.
    fn sibling(&self) -> Option<Cidr> {
        if self.len == 0 {
            return None;
        }
        Some(Cidr {
            prefix: self.prefix ^ (1u32 << (32 - self.len)),
            len: self.len,
        })
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", Ipv4Addr::from(self.prefix), self.len)
    }
}

impl FromStr for Cidr {
    type Err = AddrError;

    /// Accepts `a.b.c.d/len` or a bare address as a `/32`. Host bits are
    /// masked to the network address.
    fn from_str(s: &str) -> Result<Self, AddrError> {
        let s = s.trim();
        match s.split_once('/') {
            Some((addr, len)) => {
                let prefix = parse_addr(addr).map_err(|_| AddrError::BadCidr(s.to_string()))?;
                let len: u8 = len.parse().map_err(|_| AddrError::BadCidr(s.to_string()))?;
                Cidr::new(prefix, len)
            }
            None => Ok(Cidr::single(parse_addr(s)?)),
        }
    }
}

impl serde::Serialize for Cidr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Cidr {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Mask covering the host bits of a prefix of length `len`.
fn host_mask(len: u8) -> u32 {
    if len == 0 {
        u32::MAX
    } else {
        (1u64 << (32 - len)).wrapping_sub(1) as u32
    }
}

/// Collapse a list of CIDRs into a minimal cover.
///
/// Sorts by `(prefix, len)`, drops entries fully contained in another, then
/// coalesces same-length sibling halves into their parent prefix, repeating
/// until a fixpoint. `merge(merge(l)) == merge(l)`.
pub fn merge(mut cidrs: Vec<Cidr>) -> Vec<Cidr> {
    loop {
        cidrs.sort_unstable();
        cidrs.dedup();

        // Sorted order guarantees a containing range precedes everything it
        // contains, so comparing against the last kept entry is enough.
        let mut kept: Vec<Cidr> = Vec::with_capacity(cidrs.len());
        for c in cidrs.drain(..) {
            match kept.last() {
                Some(last) if last.contains(&c) => {}
                _ => kept.push(c),
            }
        }

        let mut coalesced = false;
        for c in kept {
            let merged_pair = match (cidrs.last(), c.sibling()) {
                (Some(&last), Some(sib)) if last == sib && last.prefix < c.prefix => {
                    Some(Cidr {
                        prefix: last.prefix,
                        len: last.len - 1,
                    })
                }
                _ => None,
            };
            match merged_pair {
                Some(parent) => {
                    cidrs.pop();
                    cidrs.push(parent);
                    coalesced = true;
                }
                None => cidrs.push(c),
            }
        }

        if !coalesced {
            return cidrs;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cidr(s: &str) -> Cidr {
        s.parse().unwrap()
    }

    #[test]
    fn parse_addr_packs_octets() {
        assert_eq!(parse_addr("10.0.0.1").unwrap(), 0x0A000001);
        assert_eq!(parse_addr("255.255.255.255").unwrap(), u32::MAX);
        assert_eq!(parse_addr("0.0.0.0").unwrap(), 0);
    }

    #[test]
    fn parse_addr_rejects_garbage() {
        assert!(parse_addr("10.0.0").is_err());
        assert!(parse_addr("10.0.0.256").is_err());
        assert!(parse_addr("::1").is_err());
        assert!(parse_addr("2001:db8::1").is_err());
        assert!(parse_addr("example.com").is_err());
    }

    #[test]
    fn cidr_parse_and_format_roundtrip() {
        let c = cidr("192.168.1.0/24");
        assert_eq!(c.prefix(), 0xC0A80100);
        assert_eq!(c.len(), 24);
        assert_eq!(c.to_string(), "192.168.1.0/24");
    }

    #[test]
    fn cidr_parse_masks_host_bits() {
        assert_eq!(cidr("10.0.0.77/24"), cidr("10.0.0.0/24"));
    }

    #[test]
    fn cidr_parse_bare_address_is_slash_32() {
        assert_eq!(cidr("10.1.2.3"), Cidr::single(0x0A010203));
    }

    #[test]
    fn cidr_parse_rejects_bad_input() {
        assert!("10.0.0.0/33".parse::<Cidr>().is_err());
        assert!("10.0.0/24".parse::<Cidr>().is_err());
        assert!("::/0".parse::<Cidr>().is_err());
        assert!("10.0.0.0/x".parse::<Cidr>().is_err());
    }

    #[test]
    fn zero_length_contains_everything() {
        let all = cidr("0.0.0.0/0");
        assert!(all.contains_addr(0));
        assert!(all.contains_addr(u32::MAX));
        assert_eq!(all.range(), (0, u32::MAX));
    }

    #[test]
    fn slash_32_contains_exactly_one() {
        let one = cidr("10.0.0.1/32");
        assert!(one.contains_addr(0x0A000001));
        assert!(!one.contains_addr(0x0A000002));
        assert_eq!(one.range(), (0x0A000001, 0x0A000001));
    }

    #[test]
    fn contains_cidr_is_sub_super_test() {
        let net = cidr("10.0.0.0/16");
        assert!(net.contains(&cidr("10.0.1.0/24")));
        assert!(net.contains(&net));
        assert!(!net.contains(&cidr("10.1.0.0/24")));
        assert!(!cidr("10.0.1.0/24").contains(&net));
    }

    #[test]
    fn intersects_in_either_direction() {
        assert!(cidr("10.0.0.0/8").intersects(&cidr("10.2.0.0/16")));
        assert!(cidr("10.2.0.0/16").intersects(&cidr("10.0.0.0/8")));
        assert!(!cidr("10.0.0.0/16").intersects(&cidr("10.1.0.0/16")));
    }

    #[test]
    fn merge_collapses_siblings_and_contained() {
        let merged = merge(vec![
            cidr("10.0.0.0/24"),
            cidr("10.0.0.128/25"),
            cidr("10.0.1.0/24"),
            cidr("11.0.0.0/8"),
        ]);
        assert_eq!(merged, vec![cidr("10.0.0.0/23"), cidr("11.0.0.0/8")]);
    }

    #[test]
    fn merge_cascades_up_multiple_levels() {
        let merged = merge(vec![
            cidr("10.0.0.0/26"),
            cidr("10.0.0.64/26"),
            cidr("10.0.0.128/26"),
            cidr("10.0.0.192/26"),
        ]);
        assert_eq!(merged, vec![cidr("10.0.0.0/24")]);
    }

    #[test]
    fn merge_does_not_join_non_siblings() {
        // Adjacent but halves of different parents.
        let merged = merge(vec![cidr("10.0.1.0/24"), cidr("10.0.2.0/24")]);
        assert_eq!(merged, vec![cidr("10.0.1.0/24"), cidr("10.0.2.0/24")]);
    }

    #[test]
    fn merge_is_idempotent() {
        let input = vec![
            cidr("10.0.0.0/24"),
            cidr("10.0.1.0/24"),
            cidr("10.0.0.0/16"),
            cidr("172.16.4.0/22"),
        ];
        let once = merge(input.clone());
        assert_eq!(merge(once.clone()), once);
    }

    #[test]
    fn merge_handles_empty_and_single() {
        assert!(merge(vec![]).is_empty());
        assert_eq!(merge(vec![cidr("10.0.0.0/8")]), vec![cidr("10.0.0.0/8")]);
    }

    #[test]
    fn serde_roundtrip_as_string() {
        let c = cidr("192.168.0.0/16");
        let json = serde_json::to_string(&c).unwrap();
        assert_eq!(json, "\"192.168.0.0/16\"");
        assert_eq!(serde_json::from_str::<Cidr>(&json).unwrap(), c);
    }
}
