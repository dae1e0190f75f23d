// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Broadcast-capable network interface tracking.
//
// The broadcaster needs one UDP destination per interface and the discovery
// paths need to recognise the daemon's own addresses.  The set is rebuilt
// on demand; network-change notifications funnel through a debounced
// refresh so a flapping link triggers one enumeration, not a storm.

use std::net::{IpAddr, SocketAddr};

use if_addrs::IfAddr;
use tracing::{debug, warn};

/// Seconds to wait after the last network-change notification before
/// re-enumerating interfaces.
const REFRESH_DEBOUNCE_SECS: u64 = 10;

/// One usable broadcast interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetInterface {
    /// Interface address as text, for URI substitution and logging.
    pub address: IpAddr,
    /// Broadcast destination including the browse port.
    pub broadcast: SocketAddr,
}

/// The daemon's current view of broadcast-capable interfaces.
#[derive(Debug, Default)]
pub struct NetifTracker {
    interfaces: Vec<NetInterface>,
    pending_refresh: Option<u64>,
}

impl NetifTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interfaces(&self) -> &[NetInterface] {
        &self.interfaces
    }

    /// Whether `addr` is one of this host's interface addresses.
    pub fn has_address(&self, addr: IpAddr) -> bool {
        self.interfaces.iter().any(|iface| iface.address == addr)
    }

    /// Note a network-change notification.  The actual enumeration runs
    /// once the debounce window has passed without further notifications.
    pub fn request_refresh(&mut self, now: u64) {
        self.pending_refresh = Some(now + REFRESH_DEBOUNCE_SECS);
    }

    /// Whether a deferred refresh is due.
    pub fn refresh_due(&self, now: u64) -> bool {
        self.pending_refresh.is_some_and(|at| at <= now)
    }

    /// When the deferred refresh should run, if one is pending.
    pub fn pending_refresh_at(&self) -> Option<u64> {
        self.pending_refresh
    }

    /// Re-enumerate the system's interfaces, replacing the set.
    pub fn refresh(&mut self, browse_port: u16) {
        self.pending_refresh = None;
        let ifaces = match if_addrs::get_if_addrs() {
            Ok(ifaces) => ifaces,
            Err(err) => {
                warn!(%err, "unable to enumerate network interfaces");
                return;
            }
        };

        self.interfaces.clear();
        for iface in &ifaces {
            if let Some(net) = usable_interface(iface.is_loopback(), &iface.addr, browse_port) {
                debug!(address = %net.address, "network interface");
                self.interfaces.push(net);
            }
        }
    }
}

/// Filter one OS-reported interface down to a broadcast destination.
///
/// Loopback, broadcast-less, and IPv6 link-local interfaces are skipped.
fn usable_interface(is_loopback: bool, addr: &IfAddr, browse_port: u16) -> Option<NetInterface> {
    if is_loopback {
        return None;
    }
    match addr {
        IfAddr::V4(v4) => {
            let broadcast = v4.broadcast?;
            Some(NetInterface {
                address: IpAddr::V4(v4.ip),
                broadcast: SocketAddr::new(IpAddr::V4(broadcast), browse_port),
            })
        }
        IfAddr::V6(v6) => {
            // fe80::/10
            if (v6.ip.segments()[0] & 0xffc0) == 0xfe80 {
                return None;
            }
            let broadcast = v6.broadcast?;
            Some(NetInterface {
                address: IpAddr::V6(v6.ip),
                broadcast: SocketAddr::new(IpAddr::V6(broadcast), browse_port),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use if_addrs::{Ifv4Addr, Ifv6Addr};

    fn v4(ip: &str, broadcast: Option<&str>) -> IfAddr {
        IfAddr::V4(Ifv4Addr {
            ip: ip.parse().unwrap(),
            netmask: "255.255.255.0".parse().unwrap(),
            prefixlen: 24,
            broadcast: broadcast.map(|b| b.parse().unwrap()),
        })
    }

    fn v6(ip: &str, broadcast: Option<&str>) -> IfAddr {
        IfAddr::V6(Ifv6Addr {
            ip: ip.parse().unwrap(),
            netmask: "ffff:ffff:ffff:ffff::".parse().unwrap(),
            prefixlen: 64,
            broadcast: broadcast.map(|b| b.parse().unwrap()),
        })
    }

    #[test]
    fn loopback_is_skipped() {
        assert!(usable_interface(true, &v4("127.0.0.1", Some("127.255.255.255")), 631).is_none());
    }

    #[test]
    fn missing_broadcast_is_skipped() {
        assert!(usable_interface(false, &v4("10.0.0.4", None), 631).is_none());
    }

    #[test]
    fn usable_v4_carries_browse_port() {
        let net = usable_interface(false, &v4("10.0.0.4", Some("10.0.0.255")), 631).unwrap();
        assert_eq!(net.address, "10.0.0.4".parse::<IpAddr>().unwrap());
        assert_eq!(net.broadcast, "10.0.0.255:631".parse().unwrap());
    }

    #[test]
    fn ipv6_link_local_is_never_used() {
        assert!(usable_interface(false, &v6("fe80::1", Some("fe80::ffff")), 631).is_none());
    }

    #[test]
    fn refresh_debounce_coalesces() {
        let mut tracker = NetifTracker::new();
        tracker.request_refresh(100);
        assert!(!tracker.refresh_due(105));
        // A second notification restarts the window.
        tracker.request_refresh(105);
        assert!(!tracker.refresh_due(110));
        assert!(tracker.refresh_due(115));
    }
}
