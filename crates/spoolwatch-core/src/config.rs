// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Daemon configuration.
//
// The config file is the classic one-directive-per-line key/value format
// with case-insensitive keys.  A line that fails to parse is logged and
// skipped; unknown keys are logged and ignored.  Startup never aborts on a
// bad config line.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::allow::{AllowList, AllowRule};

/// Default config file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/cups/spoolwatch.conf";

/// Browse protocol selection for one direction (local or remote).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Protocols {
    /// DNS-SD / mDNS service discovery.
    pub dnssd: bool,
    /// Legacy CUPS UDP browsing.
    pub cups: bool,
}

impl Protocols {
    pub const NONE: Protocols = Protocols {
        dnssd: false,
        cups: false,
    };

    pub fn is_none(&self) -> bool {
        !self.dnssd && !self.cups
    }

    /// Parse a comma/space/tab-separated protocol list: `dnssd`, `cups`,
    /// `none`.  Unknown tokens are logged and skipped.
    fn parse(value: &str) -> Protocols {
        let mut protocols = Protocols::NONE;
        for token in value.split([',', ' ', '\t']).filter(|t| !t.is_empty()) {
            if token.eq_ignore_ascii_case("dnssd") {
                protocols.dnssd = true;
            } else if token.eq_ignore_ascii_case("cups") {
                protocols.cups = true;
            } else if !token.eq_ignore_ascii_case("none") {
                warn!(protocol = token, "unknown browse protocol");
            }
        }
        protocols
    }
}

/// One `BrowsePoll` upstream print server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollTarget {
    pub server: String,
    pub port: u16,
    /// Pinned IPP version, or `None` to use the client default.
    pub version: Option<(u8, u8)>,
}

impl PollTarget {
    /// Parse `host[:port][/version=X.Y]`.
    pub fn parse(value: &str, default_port: u16) -> Option<PollTarget> {
        let value = value.trim();
        if value.is_empty() {
            return None;
        }

        let (rest, version) = match value.split_once('/') {
            Some((host_port, option)) => {
                let version = match option.to_ascii_lowercase().strip_prefix("version=") {
                    Some("1.0") => Some((1, 0)),
                    Some("1.1") => Some((1, 1)),
                    Some("2.0") => Some((2, 0)),
                    Some("2.1") => Some((2, 1)),
                    Some("2.2") => Some((2, 2)),
                    _ => {
                        warn!(option, "ignoring unknown BrowsePoll server option");
                        None
                    }
                };
                (host_port, version)
            }
            None => (value, None),
        };

        let (server, port) = match rest.rsplit_once(':') {
            // Only treat the suffix as a port when it is numeric; an IPv6
            // literal without a port also contains colons.
            Some((host, port_str)) => match port_str.parse::<u16>() {
                Ok(port) if !host.is_empty() => (host.to_string(), port),
                _ => (rest.to_string(), default_port),
            },
            None => (rest.to_string(), default_port),
        };

        Some(PollTarget {
            server,
            port,
            version,
        })
    }
}

/// Auto-shutdown operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AutoShutdownMode {
    /// Never shut down on an empty catalogue.
    #[default]
    Off,
    /// Shut down once the catalogue has been empty for the timeout.
    On,
    /// Bound to discovery-service availability: auto-shutdown is enabled
    /// while the DNS-SD service is gone and disabled while it is present.
    Avahi,
}

/// Complete daemon configuration after file + command line merging.
#[derive(Debug, Clone)]
pub struct Config {
    pub browse_local_protocols: Protocols,
    pub browse_remote_protocols: Protocols,
    pub browse_poll: Vec<PollTarget>,
    pub browse_allow: AllowList,
    pub domain_socket: Option<PathBuf>,
    pub create_ipp_printer_queues: bool,
    pub autoshutdown: AutoShutdownMode,
    pub autoshutdown_timeout: u64,
    pub browse_port: u16,
    pub browse_interval: u64,
    pub browse_timeout: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            browse_local_protocols: Protocols::NONE,
            browse_remote_protocols: Protocols {
                dnssd: true,
                cups: false,
            },
            browse_poll: Vec::new(),
            browse_allow: AllowList::default(),
            domain_socket: None,
            create_ipp_printer_queues: false,
            autoshutdown: AutoShutdownMode::Off,
            autoshutdown_timeout: 30,
            browse_port: 631,
            browse_interval: 60,
            browse_timeout: 300,
        }
    }
}

impl Config {
    /// Load the configuration file, falling back to defaults when it does
    /// not exist or cannot be read.
    pub fn load(path: &Path) -> Config {
        let mut config = Config::default();
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) => {
                debug!(path = %path.display(), %err, "no config file, using defaults");
                return config;
            }
        };
        for line in contents.lines() {
            config.apply_line(line);
        }
        config
    }

    /// Parse config file contents (exposed for tests).
    pub fn from_str(contents: &str) -> Config {
        let mut config = Config::default();
        for line in contents.lines() {
            config.apply_line(line);
        }
        config
    }

    fn apply_line(&mut self, line: &str) {
        let line = match line.find('#') {
            Some(pos) => &line[..pos],
            None => line,
        }
        .trim();
        if line.is_empty() {
            return;
        }

        let (key, value) = match line.split_once(char::is_whitespace) {
            Some((key, value)) => (key, value.trim()),
            None => (line, ""),
        };
        debug!(key, value, "reading config directive");

        if key.eq_ignore_ascii_case("BrowseProtocols") {
            let protocols = Protocols::parse(value);
            self.browse_local_protocols = protocols;
            self.browse_remote_protocols = protocols;
        } else if key.eq_ignore_ascii_case("BrowseLocalProtocols") {
            self.browse_local_protocols = Protocols::parse(value);
        } else if key.eq_ignore_ascii_case("BrowseRemoteProtocols") {
            self.browse_remote_protocols = Protocols::parse(value);
        } else if key.eq_ignore_ascii_case("BrowsePoll") {
            match PollTarget::parse(value, self.browse_port) {
                Some(target) => {
                    debug!(server = %target.server, port = target.port, "adding BrowsePoll server");
                    self.browse_poll.push(target);
                }
                None => warn!(value, "BrowsePoll value not understood"),
            }
        } else if key.eq_ignore_ascii_case("BrowseAllow") {
            self.browse_allow.push(AllowRule::parse(value));
        } else if key.eq_ignore_ascii_case("DomainSocket") {
            if !value.is_empty() {
                self.domain_socket = Some(PathBuf::from(value));
            }
        } else if key.eq_ignore_ascii_case("CreateIPPPrinterQueues") {
            if let Some(flag) = parse_bool(value) {
                self.create_ipp_printer_queues = flag;
            }
        } else if key.eq_ignore_ascii_case("AutoShutdown") {
            for token in value.split([',', ' ', '\t']).filter(|t| !t.is_empty()) {
                match parse_autoshutdown(token) {
                    Some(mode) => self.autoshutdown = mode,
                    None => warn!(mode = token, "unknown auto shutdown mode"),
                }
            }
        } else if key.eq_ignore_ascii_case("AutoShutdownTimeout") {
            match value.parse::<i64>() {
                Ok(timeout) if timeout >= 0 => self.autoshutdown_timeout = timeout as u64,
                _ => warn!(value, "invalid auto shutdown timeout"),
            }
        } else if key.eq_ignore_ascii_case("BrowsePort") {
            match value.parse::<u16>() {
                Ok(port) if port != 0 => self.browse_port = port,
                _ => warn!(value, "invalid browse port"),
            }
        } else if key.eq_ignore_ascii_case("BrowseInterval") {
            match value.parse::<u64>() {
                Ok(interval) => self.browse_interval = interval,
                Err(_) => warn!(value, "invalid browse interval"),
            }
        } else if key.eq_ignore_ascii_case("BrowseTimeout") {
            match value.parse::<u64>() {
                Ok(timeout) => self.browse_timeout = timeout,
                Err(_) => warn!(value, "invalid browse timeout"),
            }
        } else {
            warn!(key, "unknown config directive ignored");
        }
    }

    /// Drop unsupported directions after the file and CLI are merged:
    /// locally originated DNS-SD announcements are the job of the print
    /// service itself.
    pub fn normalise(&mut self) {
        if self.browse_local_protocols.dnssd {
            warn!("local DNS-SD announcement not supported, dropping");
            self.browse_local_protocols.dnssd = false;
        }
    }

    /// Nothing to listen for, nothing to send, nobody to poll.
    pub fn is_idle(&self) -> bool {
        self.browse_local_protocols.is_none()
            && self.browse_remote_protocols.is_none()
            && self.browse_poll.is_empty()
    }
}

/// Parse on|off|yes|no|true|false|1|0.
pub fn parse_bool(value: &str) -> Option<bool> {
    if value.eq_ignore_ascii_case("on")
        || value.eq_ignore_ascii_case("yes")
        || value.eq_ignore_ascii_case("true")
        || value == "1"
    {
        Some(true)
    } else if value.eq_ignore_ascii_case("off")
        || value.eq_ignore_ascii_case("no")
        || value.eq_ignore_ascii_case("false")
        || value == "0"
    {
        Some(false)
    } else {
        None
    }
}

/// Parse one auto-shutdown mode token.
pub fn parse_autoshutdown(value: &str) -> Option<AutoShutdownMode> {
    if value.eq_ignore_ascii_case("avahi") {
        Some(AutoShutdownMode::Avahi)
    } else if value.eq_ignore_ascii_case("none") {
        Some(AutoShutdownMode::Off)
    } else {
        parse_bool(value).map(|flag| {
            if flag {
                AutoShutdownMode::On
            } else {
                AutoShutdownMode::Off
            }
        })
    }
}
