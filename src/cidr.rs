//! Minimal covering CIDR blocks and the per-family coverage tracker.
//!
//! A [`CidrTracker`] maintains the smallest aligned address block that
//! contains every address it has ever been shown. The block only ever
//! grows: when a new address falls outside the current block, the prefix
//! is shortened to the longest run of leading bits the block's base and
//! the new address share. Growth driven by that rule is order-independent,
//! so the final block after any sequence of observations equals the
//! minimal block enclosing the smallest and largest address seen.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// IP address family tracked independently by the discoverer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IpFamily {
    /// IPv4, 32-bit addresses.
    V4,
    /// IPv6, 128-bit addresses.
    V6,
}

impl IpFamily {
    /// Returns the family of the given address.
    #[must_use]
    pub const fn of(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => Self::V4,
            IpAddr::V6(_) => Self::V6,
        }
    }

    /// Address width in bits: 32 for IPv4, 128 for IPv6.
    #[must_use]
    pub const fn width(self) -> u8 {
        match self {
            Self::V4 => 32,
            Self::V6 => 128,
        }
    }
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4 => f.write_str("IPv4"),
            Self::V6 => f.write_str("IPv6"),
        }
    }
}

/// An aligned, contiguous block of addresses of one family, described by a
/// base address and a prefix length.
///
/// Invariants: all bits of the base beyond the prefix are zero, and the
/// prefix length never exceeds the family width.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CidrBlock {
    base: IpAddr,
    prefix_len: u8,
}

impl CidrBlock {
    /// The block's base address.
    #[must_use]
    pub const fn base(&self) -> IpAddr {
        self.base
    }

    /// Number of leading bits fixed for this block.
    #[must_use]
    pub const fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// The family this block belongs to.
    #[must_use]
    pub const fn family(&self) -> IpFamily {
        IpFamily::of(self.base)
    }

    /// Returns `true` if `ip` is of this block's family and lies within
    /// the block's range.
    #[must_use]
    pub fn contains(&self, ip: IpAddr) -> bool {
        IpFamily::of(ip) == self.family()
            && common_prefix_len(to_bits(self.base), to_bits(ip)) >= self.prefix_len
    }
}

impl fmt::Display for CidrBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.prefix_len)
    }
}

/// Tracks the minimal covering block for one address family.
///
/// Pure in-memory state machine: no I/O, no locking. The tracker starts
/// empty; the first observation creates a host-sized block, and every
/// later observation either leaves the block alone or replaces it with a
/// strict superset. There is no operation that shrinks the block.
#[derive(Debug)]
pub struct CidrTracker {
    family: IpFamily,
    // Base address left-aligned into the top `width` bits, plus prefix.
    cidr: Option<(u128, u8)>,
}

impl CidrTracker {
    /// Creates an empty tracker for the given family.
    #[must_use]
    pub const fn new(family: IpFamily) -> Self {
        Self { family, cidr: None }
    }

    /// Folds `ip` into the covering block, growing it if necessary.
    ///
    /// Returns `true` if the block changed (including its creation on the
    /// first observation), `false` if `ip` was already covered.
    pub fn observe(&mut self, ip: IpAddr) -> bool {
        debug_assert_eq!(IpFamily::of(ip), self.family);
        let addr = to_bits(ip);
        let width = self.family.width();

        let Some((base, prefix)) = self.cidr else {
            self.cidr = Some((addr, width));
            return true;
        };

        let shared = common_prefix_len(base, addr).min(width);
        if shared >= prefix {
            return false;
        }
        self.cidr = Some((base & prefix_mask(shared), shared));
        true
    }

    /// Current covering block, or `None` if no address has been observed.
    #[must_use]
    pub fn current(&self) -> Option<CidrBlock> {
        self.cidr.map(|(base, prefix_len)| CidrBlock {
            base: from_bits(base, self.family),
            prefix_len,
        })
    }
}

/// Left-aligns an address into a `u128` so that its most significant bit
/// occupies bit 127 regardless of family.
fn to_bits(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u128::from(u32::from(v4)) << 96,
        IpAddr::V6(v6) => u128::from(v6),
    }
}

fn from_bits(bits: u128, family: IpFamily) -> IpAddr {
    match family {
        #[allow(clippy::cast_possible_truncation)]
        IpFamily::V4 => IpAddr::V4(Ipv4Addr::from((bits >> 96) as u32)),
        IpFamily::V6 => IpAddr::V6(Ipv6Addr::from(bits)),
    }
}

/// Number of leading bits two left-aligned addresses share.
fn common_prefix_len(a: u128, b: u128) -> u8 {
    #[allow(clippy::cast_possible_truncation)]
    let len = (a ^ b).leading_zeros() as u8;
    len
}

/// Mask keeping the top `prefix_len` bits of a left-aligned address.
fn prefix_mask(prefix_len: u8) -> u128 {
    if prefix_len == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(prefix_len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn block(tracker: &CidrTracker) -> String {
        tracker.current().unwrap().to_string()
    }

    #[test]
    fn family_of_address() {
        assert_eq!(IpFamily::of(ip("10.0.0.1")), IpFamily::V4);
        assert_eq!(IpFamily::of(ip("10::1")), IpFamily::V6);
    }

    #[test]
    fn family_width() {
        assert_eq!(IpFamily::V4.width(), 32);
        assert_eq!(IpFamily::V6.width(), 128);
    }

    #[test]
    fn empty_tracker_has_no_block() {
        let tracker = CidrTracker::new(IpFamily::V4);
        assert!(tracker.current().is_none());
    }

    #[test]
    fn ipv4_growth_sequence() {
        let mut tracker = CidrTracker::new(IpFamily::V4);

        assert!(tracker.observe(ip("10.10.0.1")));
        assert_eq!(block(&tracker), "10.10.0.1/32");

        assert!(tracker.observe(ip("10.10.0.2")));
        assert_eq!(block(&tracker), "10.10.0.0/30");

        assert!(tracker.observe(ip("10.10.0.5")));
        assert_eq!(block(&tracker), "10.10.0.0/29");

        // Already covered: no change.
        assert!(!tracker.observe(ip("10.10.0.4")));
        assert_eq!(block(&tracker), "10.10.0.0/29");
    }

    #[test]
    fn ipv6_growth_sequence() {
        let mut tracker = CidrTracker::new(IpFamily::V6);

        assert!(tracker.observe(ip("10::1")));
        assert_eq!(block(&tracker), "10::1/128");

        assert!(tracker.observe(ip("10::2")));
        assert_eq!(block(&tracker), "10::/126");

        assert!(tracker.observe(ip("10::5")));
        assert_eq!(block(&tracker), "10::/125");

        assert!(!tracker.observe(ip("10::4")));
        assert_eq!(block(&tracker), "10::/125");
    }

    #[test]
    fn observe_is_idempotent() {
        let mut tracker = CidrTracker::new(IpFamily::V4);
        assert!(tracker.observe(ip("10.10.0.1")));
        assert!(!tracker.observe(ip("10.10.0.1")));
        assert_eq!(block(&tracker), "10.10.0.1/32");
    }

    #[test]
    fn growth_is_order_independent() {
        let addrs = ["10.10.0.5", "10.10.0.1", "10.10.0.2", "10.10.0.4"];

        let mut forward = CidrTracker::new(IpFamily::V4);
        let mut reverse = CidrTracker::new(IpFamily::V4);
        for a in addrs {
            forward.observe(ip(a));
        }
        for a in addrs.iter().rev() {
            reverse.observe(ip(*a));
        }

        assert_eq!(forward.current(), reverse.current());
        assert_eq!(block(&forward), "10.10.0.0/29");
    }

    #[test]
    fn block_is_minimal_for_min_and_max() {
        // 10.0.0.7 and 10.0.0.9 differ first at bit 28: expect /28.
        let mut tracker = CidrTracker::new(IpFamily::V4);
        tracker.observe(ip("10.0.0.8"));
        tracker.observe(ip("10.0.0.7"));
        tracker.observe(ip("10.0.0.9"));
        assert_eq!(block(&tracker), "10.0.0.0/28");
    }

    #[test]
    fn growth_is_monotonic() {
        let mut tracker = CidrTracker::new(IpFamily::V4);
        let addrs = ["192.168.1.1", "192.168.1.200", "192.168.77.3", "10.0.0.1"];

        let mut prev: Option<CidrBlock> = None;
        for a in addrs {
            tracker.observe(ip(a));
            let cur = tracker.current().unwrap();
            if let Some(prev) = prev {
                assert!(cur.prefix_len() <= prev.prefix_len());
                assert!(cur.contains(prev.base()));
            }
            prev = Some(cur);
        }
        assert_eq!(block(&tracker), "0.0.0.0/0");
    }

    #[test]
    fn can_grow_to_zero_prefix() {
        let mut tracker = CidrTracker::new(IpFamily::V4);
        tracker.observe(ip("0.0.0.1"));
        tracker.observe(ip("255.255.255.255"));
        assert_eq!(block(&tracker), "0.0.0.0/0");
    }

    #[test]
    fn ipv6_can_grow_to_zero_prefix() {
        let mut tracker = CidrTracker::new(IpFamily::V6);
        tracker.observe(ip("::1"));
        tracker.observe(ip("ffff::1"));
        assert_eq!(block(&tracker), "::/0");
    }

    #[test]
    fn contains_checks_family_and_range() {
        let mut tracker = CidrTracker::new(IpFamily::V4);
        tracker.observe(ip("10.10.0.1"));
        tracker.observe(ip("10.10.0.2"));

        let block = tracker.current().unwrap();
        assert!(block.contains(ip("10.10.0.3")));
        assert!(!block.contains(ip("10.10.0.4")));
        assert!(!block.contains(ip("10::1")));
    }

    #[test]
    fn block_accessors() {
        let mut tracker = CidrTracker::new(IpFamily::V6);
        tracker.observe(ip("10::1"));
        tracker.observe(ip("10::2"));

        let block = tracker.current().unwrap();
        assert_eq!(block.base(), ip("10::"));
        assert_eq!(block.prefix_len(), 126);
        assert_eq!(block.family(), IpFamily::V6);
    }
}
