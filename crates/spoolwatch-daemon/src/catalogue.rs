// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// The remote printer catalogue: the authoritative in-memory set of printers
// the daemon is maintaining local queues for.
//
// Entries are ordered by queue name.  Names are unique among non-duplicate
// entries; duplicate entries share a name on purpose — they are standby
// records for failover and never own a local queue.

use tempfile::TempPath;

/// Per-entry reconciliation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrinterStatus {
    /// Created from a previous session's leftover queue; must be
    /// re-confirmed by discovery or it will be retired.
    Unconfirmed,
    /// Local queue exists and matches; steady state.
    Confirmed,
    /// Scheduled for local queue creation or update.
    ToBeCreated,
    /// Scheduled for creation from a legacy browse packet; the queue lives
    /// on a lease and must be re-asserted before `BrowseTimeout`.
    BrowsePacketReceived,
    /// Scheduled for removal.
    Disappeared,
}

/// What is sent along with the ADD_MODIFY when the queue is created.
#[derive(Debug, Default)]
pub enum DescriptionSource {
    /// No description artefact; the remote print service provides the
    /// driver (remote shared queues).
    #[default]
    Raw,
    /// Synthesised printer description file.
    DescriptionFile(TempPath),
    /// Generated interface script invoking the PDL filter.
    InterfaceScript(TempPath),
}

/// Reconciler deadline offsets, in seconds.  `IMMEDIATELY` and `REMOVE`
/// are negative so the `deadline <= now` test fires on the next pass.
pub mod timeout {
    pub const IMMEDIATELY: i64 = -1;
    pub const CONFIRM: i64 = 10;
    pub const RETRY: i64 = 10;
    pub const REMOVE: i64 = -1;
}

/// One local queue the daemon maintains (or intends to).
#[derive(Debug)]
pub struct RemotePrinterEntry {
    /// Local queue name, sanitised.
    pub name: String,
    /// Device URI of the remote printer.
    pub uri: String,
    /// Sanitised remote host, `.local` suffix stripped.
    pub host: String,
    /// Discovery identity, set iff the entry came from DNS-SD.
    pub service_name: String,
    pub service_type: String,
    pub service_domain: String,
    pub status: PrinterStatus,
    /// Absolute clock second after which the reconciler must act;
    /// `None` means steady state, nothing scheduled.
    pub deadline: Option<u64>,
    /// Standby record for a same-named queue on another host.
    pub duplicate: bool,
    pub description: DescriptionSource,
}

impl RemotePrinterEntry {
    /// Whether this entry's deadline has passed.
    pub fn due(&self, now: u64) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= now)
    }

    /// Case-insensitive match on the DNS-SD service identity triple.
    pub fn matches_service(&self, name: &str, service_type: &str, domain: &str) -> bool {
        self.service_name.eq_ignore_ascii_case(name)
            && self.service_type.eq_ignore_ascii_case(service_type)
            && self.service_domain.eq_ignore_ascii_case(domain)
    }
}

/// What the reconciler timer should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextWake {
    /// Nothing scheduled anywhere; idle until an event arrives.
    Idle,
    /// A deadline is already past; run again immediately.
    Immediate,
    /// Earliest future deadline, in clock seconds.
    At(u64),
}

/// Ordered set of remote printer entries.
#[derive(Debug, Default)]
pub struct Catalogue {
    entries: Vec<RemotePrinterEntry>,
}

impl Catalogue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[RemotePrinterEntry] {
        &self.entries
    }

    pub fn get(&self, index: usize) -> Option<&RemotePrinterEntry> {
        self.entries.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut RemotePrinterEntry> {
        self.entries.get_mut(index)
    }

    /// Insert keeping name order; returns the entry's index.
    pub fn insert(&mut self, entry: RemotePrinterEntry) -> usize {
        let key = entry.name.to_ascii_lowercase();
        let index = self
            .entries
            .partition_point(|e| e.name.to_ascii_lowercase() <= key);
        self.entries.insert(index, entry);
        index
    }

    /// Remove the entry at `index`, dropping any description artefact.
    pub fn remove(&mut self, index: usize) -> RemotePrinterEntry {
        self.entries.remove(index)
    }

    /// Find the entry an intake event should update: same name and either
    /// same host, an unknown host, or a state that a rediscovery may claim.
    pub fn find_intake_match(&self, name: &str, host: &str) -> Option<usize> {
        self.entries.iter().position(|e| {
            e.name.eq_ignore_ascii_case(name)
                && (e.host.is_empty()
                    || e.status == PrinterStatus::Unconfirmed
                    || e.status == PrinterStatus::Disappeared
                    || e.host.eq_ignore_ascii_case(host))
        })
    }

    /// Find the entry matching a DNS-SD REMOVE event.
    pub fn find_by_service(
        &self,
        name: &str,
        service_type: &str,
        domain: &str,
    ) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.matches_service(name, service_type, domain))
    }

    /// Find a standby duplicate for `name` on a host other than `host`.
    pub fn find_duplicate_for(&self, name: &str, host: &str) -> Option<usize> {
        self.entries.iter().position(|e| {
            e.duplicate
                && e.name.eq_ignore_ascii_case(name)
                && !e.host.eq_ignore_ascii_case(host)
        })
    }

    /// First entry sharing `name`, regardless of state.
    pub fn find_same_name(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.name.eq_ignore_ascii_case(name))
    }

    /// Compute when the reconciler should next run.
    pub fn next_wake(&self, now: u64) -> NextWake {
        let mut earliest: Option<u64> = None;
        for entry in &self.entries {
            let Some(deadline) = entry.deadline else {
                continue;
            };
            if deadline <= now {
                return NextWake::Immediate;
            }
            earliest = Some(earliest.map_or(deadline, |e| e.min(deadline)));
        }
        match earliest {
            Some(at) => NextWake::At(at),
            None => NextWake::Idle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn entry(name: &str, host: &str) -> RemotePrinterEntry {
        RemotePrinterEntry {
            name: name.into(),
            uri: format!("ipp://{host}:631/printers/{name}"),
            host: host.into(),
            service_name: String::new(),
            service_type: String::new(),
            service_domain: String::new(),
            status: PrinterStatus::ToBeCreated,
            deadline: Some(0),
            duplicate: false,
            description: DescriptionSource::Raw,
        }
    }

    #[test]
    fn insert_keeps_name_order() {
        let mut cat = Catalogue::new();
        cat.insert(entry("zeta", "a"));
        cat.insert(entry("Alpha", "a"));
        cat.insert(entry("mid", "a"));
        let names: Vec<_> = cat.entries().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["Alpha", "mid", "zeta"]);
    }

    #[test]
    fn intake_match_considers_host_and_state() {
        let mut cat = Catalogue::new();
        let mut confirmed = entry("laser", "hosta");
        confirmed.status = PrinterStatus::Confirmed;
        confirmed.deadline = None;
        cat.insert(confirmed);

        // Same name, same host: matches.
        assert!(cat.find_intake_match("LASER", "HostA").is_some());
        // Same name, different host, confirmed: no match.
        assert!(cat.find_intake_match("laser", "hostb").is_none());

        cat.get_mut(0).unwrap().status = PrinterStatus::Disappeared;
        // Disappeared entries may be claimed by any host.
        assert!(cat.find_intake_match("laser", "hostb").is_some());
    }

    #[test]
    fn service_identity_match_is_case_insensitive() {
        let mut cat = Catalogue::new();
        let mut e = entry("laser", "hosta");
        e.service_name = "HP LaserJet".into();
        e.service_type = "_ipp._tcp.local.".into();
        e.service_domain = "local".into();
        cat.insert(e);
        assert!(cat
            .find_by_service("hp laserjet", "_IPP._tcp.local.", "LOCAL")
            .is_some());
        assert!(cat.find_by_service("other", "_ipp._tcp.local.", "local").is_none());
    }

    #[test]
    fn duplicate_lookup_requires_other_host() {
        let mut cat = Catalogue::new();
        let mut dup = entry("laser", "hostb");
        dup.duplicate = true;
        cat.insert(dup);
        assert!(cat.find_duplicate_for("laser", "hosta").is_some());
        assert!(cat.find_duplicate_for("laser", "hostb").is_none());
    }

    #[test]
    fn next_wake_prefers_immediate() {
        let mut cat = Catalogue::new();
        let mut a = entry("a", "h");
        a.deadline = Some(50);
        let mut b = entry("b", "h");
        b.deadline = Some(5);
        cat.insert(a);
        cat.insert(b);

        assert_eq!(cat.next_wake(4), NextWake::At(5));
        assert_eq!(cat.next_wake(5), NextWake::Immediate);
    }

    #[test]
    fn next_wake_idle_when_all_steady() {
        let mut cat = Catalogue::new();
        let mut a = entry("a", "h");
        a.status = PrinterStatus::Confirmed;
        a.deadline = None;
        cat.insert(a);
        assert_eq!(cat.next_wake(100), NextWake::Idle);
    }
}
