// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Browse allow-list: which source addresses may feed legacy browse packets
// into the daemon.
//
// An unparsable BrowseAllow line is kept as `Invalid` rather than dropped so
// that a config typo stays visible in the rule list instead of silently
// widening or narrowing the filter.

use std::net::IpAddr;

use tracing::warn;

/// One `BrowseAllow` rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowRule {
    /// `BrowseAllow all` — every sender is accepted.
    All,
    /// Exact source address match.
    Exact(IpAddr),
    /// Network match: `(src & mask) == addr`.
    Network { addr: IpAddr, mask: IpAddr },
    /// Line that did not parse; never matches.
    Invalid(String),
}

impl AllowRule {
    /// Parse a single `BrowseAllow` value: `all`, an address, `addr/mask`
    /// (dotted IPv4 mask), or `addr/prefixlen`.
    pub fn parse(value: &str) -> AllowRule {
        let value = value.trim();
        if value.eq_ignore_ascii_case("all") {
            return AllowRule::All;
        }

        if let Some((addr_part, suffix)) = value.split_once('/') {
            let Ok(addr) = addr_part.parse::<IpAddr>() else {
                return invalid(value);
            };
            // Dotted mask form is IPv4-only; a bare number is a prefix
            // length for either family.
            if suffix.contains('.') {
                match (addr, suffix.parse::<std::net::Ipv4Addr>()) {
                    (IpAddr::V4(_), Ok(mask)) => AllowRule::Network {
                        addr,
                        mask: IpAddr::V4(mask),
                    },
                    _ => invalid(value),
                }
            } else {
                let Ok(bits) = suffix.parse::<u32>() else {
                    return invalid(value);
                };
                match prefix_mask(&addr, bits) {
                    Some(mask) => AllowRule::Network { addr, mask },
                    None => invalid(value),
                }
            }
        } else {
            match value.parse::<IpAddr>() {
                Ok(addr) => AllowRule::Exact(addr),
                Err(_) => invalid(value),
            }
        }
    }
}

fn invalid(value: &str) -> AllowRule {
    warn!(value, "BrowseAllow value not understood");
    AllowRule::Invalid(value.to_string())
}

/// Build a netmask for `bits` leading one-bits in `addr`'s family.
fn prefix_mask(addr: &IpAddr, bits: u32) -> Option<IpAddr> {
    match addr {
        IpAddr::V4(_) => {
            if bits > 32 {
                return None;
            }
            let mask = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
            Some(IpAddr::V4(mask.into()))
        }
        IpAddr::V6(_) => {
            if bits > 128 {
                return None;
            }
            let mask = if bits == 0 {
                0
            } else {
                u128::MAX << (128 - bits)
            };
            Some(IpAddr::V6(mask.into()))
        }
    }
}

/// The configured set of allow rules.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    rules: Vec<AllowRule>,
}

impl AllowList {
    pub fn new(rules: Vec<AllowRule>) -> Self {
        Self { rules }
    }

    pub fn push(&mut self, rule: AllowRule) {
        self.rules.push(rule);
    }

    pub fn rules(&self) -> &[AllowRule] {
        &self.rules
    }

    /// Whether a browse packet from `src` may be processed.
    ///
    /// An empty rule list, or any `all` rule, accepts every sender.
    pub fn allowed(&self, src: IpAddr) -> bool {
        if self.rules.is_empty() || self.rules.iter().any(|r| matches!(r, AllowRule::All)) {
            return true;
        }
        self.rules.iter().any(|rule| match rule {
            AllowRule::All => true,
            AllowRule::Exact(addr) => *addr == src,
            AllowRule::Network { addr, mask } => masked(src, *mask) == Some(*addr),
            AllowRule::Invalid(_) => false,
        })
    }
}

/// Apply `mask` to `addr`; `None` when the families differ.
fn masked(addr: IpAddr, mask: IpAddr) -> Option<IpAddr> {
    match (addr, mask) {
        (IpAddr::V4(a), IpAddr::V4(m)) => {
            Some(IpAddr::V4((u32::from(a) & u32::from(m)).into()))
        }
        (IpAddr::V6(a), IpAddr::V6(m)) => {
            Some(IpAddr::V6((u128::from(a) & u128::from(m)).into()))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn empty_list_allows_everyone() {
        let list = AllowList::default();
        assert!(list.allowed(ip("192.168.1.5")));
        assert!(list.allowed(ip("2001:db8::1")));
    }

    #[test]
    fn all_rule_allows_everyone() {
        let list = AllowList::new(vec![AllowRule::parse("all")]);
        assert!(list.allowed(ip("10.0.0.1")));
    }

    #[test]
    fn exact_match() {
        let list = AllowList::new(vec![AllowRule::parse("10.0.0.7")]);
        assert!(list.allowed(ip("10.0.0.7")));
        assert!(!list.allowed(ip("10.0.0.8")));
    }

    #[test]
    fn prefix_network_match() {
        let list = AllowList::new(vec![AllowRule::parse("10.0.0.0/8")]);
        assert!(list.allowed(ip("10.200.3.4")));
        assert!(!list.allowed(ip("192.168.1.5")));
    }

    #[test]
    fn dotted_mask_network_match() {
        let list = AllowList::new(vec![AllowRule::parse("192.168.1.0/255.255.255.0")]);
        assert!(list.allowed(ip("192.168.1.77")));
        assert!(!list.allowed(ip("192.168.2.77")));
    }

    #[test]
    fn ipv6_prefix_match() {
        let list = AllowList::new(vec![AllowRule::parse("2001:db8::/32")]);
        assert!(list.allowed(ip("2001:db8:1234::1")));
        assert!(!list.allowed(ip("2001:db9::1")));
    }

    #[test]
    fn invalid_rule_is_kept_and_never_matches() {
        let list = AllowList::new(vec![AllowRule::parse("not-an-address")]);
        assert_eq!(list.rules().len(), 1);
        assert!(matches!(list.rules()[0], AllowRule::Invalid(_)));
        // One invalid rule must not widen the filter to allow-all.
        assert!(!list.allowed(ip("10.0.0.1")));
    }

    #[test]
    fn oversized_prefix_is_invalid() {
        assert!(matches!(AllowRule::parse("10.0.0.0/33"), AllowRule::Invalid(_)));
        assert!(matches!(AllowRule::parse("2001:db8::/129"), AllowRule::Invalid(_)));
    }

    #[test]
    fn family_mismatch_never_matches() {
        let list = AllowList::new(vec![AllowRule::parse("10.0.0.0/8")]);
        assert!(!list.allowed(ip("2001:db8::1")));
    }
}
