// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// The daemon context and its event loop.
//
// One `Daemon` value owns the catalogue, the local printer view, the
// clock, and the interface set.  Discovery sources run as producer tasks
// and feed typed events into a single mpsc channel; the loop is the only
// consumer and the only mutator, so the catalogue needs no locks.  Signals
// arrive as loop events, never as work on a signal thread.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use spoolwatch_core::config::{AutoShutdownMode, Config};
use spoolwatch_core::error::Result;

use crate::broadcast::{self, BrowseAdvert};
use crate::catalogue::{timeout, Catalogue, DescriptionSource, NextWake, PrinterStatus, RemotePrinterEntry};
use crate::clock::{offset, Clock};
use crate::cups::{IppService, PolledPrinter};
use crate::dnssd::{self, ResolvedService};
use crate::intake::Advert;
use crate::local_view::LocalPrinterView;
use crate::netif::NetifTracker;
use crate::poll;

/// Events processed by the daemon's main loop.
#[derive(Debug)]
pub enum DaemonEvent {
    /// A DNS-SD service was resolved.
    ServiceResolved(ResolvedService),
    /// A DNS-SD service went away.
    ServiceRemoved {
        fullname: String,
        service_type: String,
    },
    /// The discovery service itself disappeared.
    DiscoveryLost,
    /// The discovery service is (back) up and browsers are running.
    DiscoveryRestored,
    /// A legacy browse packet passed the allow-list and parsed.
    BrowsePacket { src: IpAddr, advert: BrowseAdvert },
    /// A poll worker reports its server's shared printers.
    PolledPrinters {
        server: String,
        printers: Vec<PolledPrinter>,
        /// `true` after a full enumeration, `false` for a keepalive.
        fresh: bool,
    },
}

/// The daemon process context.
pub struct Daemon {
    pub(crate) config: Config,
    pub(crate) clock: Clock,
    pub(crate) catalogue: Catalogue,
    pub(crate) view: LocalPrinterView,
    pub(crate) cups: IppService,
    pub(crate) netifs: NetifTracker,
    pub(crate) autoshutdown_enabled: bool,
    autoshutdown_at: Option<u64>,
    reconcile_at: Option<u64>,
    reconcile_idle: bool,
    browse_socket: Option<Arc<UdpSocket>>,
    events_tx: mpsc::Sender<DaemonEvent>,
    cancel: CancellationToken,
}

impl Daemon {
    pub fn new(config: Config) -> (Self, mpsc::Receiver<DaemonEvent>) {
        let (events_tx, events_rx) = mpsc::channel(256);
        let autoshutdown_enabled = config.autoshutdown != AutoShutdownMode::Off;
        let view = LocalPrinterView::new(config.browse_interval);
        let daemon = Self {
            config,
            clock: Clock::new(),
            catalogue: Catalogue::new(),
            view,
            cups: IppService::local(),
            netifs: NetifTracker::new(),
            autoshutdown_enabled,
            autoshutdown_at: None,
            reconcile_at: None,
            reconcile_idle: true,
            browse_socket: None,
            events_tx,
            cancel: CancellationToken::new(),
        };
        (daemon, events_rx)
    }

    /// Run until a termination signal or auto-shutdown.
    pub async fn run(mut self, mut events: mpsc::Receiver<DaemonEvent>) -> Result<()> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigusr1 = signal(SignalKind::user_defined1())?;
        let mut sigusr2 = signal(SignalKind::user_defined2())?;

        self.netifs.refresh(self.config.browse_port);
        self.wait_for_print_service().await;
        self.recover_previous_queues();
        self.start_sources().await;

        if self.config.is_idle() {
            info!("nothing left to do");
            return Ok(());
        }

        if self.autoshutdown_enabled && self.catalogue.is_empty() {
            self.arm_autoshutdown();
        }
        self.rearm_reconciler();

        let broadcasting =
            self.config.browse_local_protocols.cups && self.browse_socket.is_some();
        let mut broadcast_interval = tokio::time::interval(Duration::from_secs(
            self.config.browse_interval.max(1),
        ));
        // Stand-in for host network-change notifications; actual refreshes
        // still go through the 10 s debounce.
        let mut netif_check = tokio::time::interval(Duration::from_secs(60));
        netif_check.tick().await;

        loop {
            let reconcile_at = self
                .reconcile_at
                .map(|at| self.clock.instant_at(at));
            let autoshutdown_at = self.autoshutdown_at.map(|at| self.clock.instant_at(at));
            let netif_at = self
                .netifs
                .pending_refresh_at()
                .map(|at| self.clock.instant_at(at));

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("caught SIGTERM, shutting down");
                    break;
                }
                _ = sigint.recv() => {
                    info!("caught SIGINT, shutting down");
                    break;
                }
                _ = sigusr1.recv() => {
                    info!("caught SIGUSR1, switching to permanent mode");
                    self.set_autoshutdown(false);
                }
                _ = sigusr2.recv() => {
                    info!("caught SIGUSR2, switching to auto shutdown mode");
                    self.set_autoshutdown(true);
                }
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {}
                },
                _ = sleep_opt(reconcile_at) => {
                    self.reconcile_pass().await;
                }
                _ = sleep_opt(autoshutdown_at) => {
                    self.autoshutdown_at = None;
                    if self.autoshutdown_enabled && self.catalogue.is_empty() {
                        info!(
                            timeout = self.config.autoshutdown_timeout,
                            "no queues maintained any more, shutting down"
                        );
                        break;
                    }
                }
                _ = broadcast_interval.tick(), if broadcasting => {
                    self.broadcast_pass().await;
                }
                _ = netif_check.tick() => {
                    self.netifs.request_refresh(self.clock.now());
                }
                _ = sleep_opt(netif_at) => {
                    self.netifs.refresh(self.config.browse_port);
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    // -- event handling ------------------------------------------------------

    async fn handle_event(&mut self, event: DaemonEvent) {
        match event {
            DaemonEvent::ServiceResolved(resolved) => {
                // Services advertised by this machine are not remote
                // printers.
                if resolved
                    .addresses
                    .iter()
                    .any(|addr| self.netifs.has_address(*addr))
                {
                    debug!(name = %resolved.service_name, "ignoring local service");
                    return;
                }
                let resource = resolved
                    .txt
                    .get("rp")
                    .map(|rp| rp.trim_start_matches('/').to_string())
                    .unwrap_or_default();
                let advert = Advert {
                    host: resolved.host,
                    port: resolved.port,
                    resource,
                    service_name: resolved.service_name,
                    service_type: resolved.service_type,
                    service_domain: resolved.service_domain,
                    txt: Some(resolved.txt),
                };
                let _ = self.intake(advert).await;
                self.rearm_reconciler();
            }

            DaemonEvent::ServiceRemoved {
                fullname,
                service_type,
            } => {
                self.handle_service_removed(&fullname, &service_type);
                self.rearm_reconciler();
            }

            DaemonEvent::DiscoveryLost => self.discovery_lost().await,
            DaemonEvent::DiscoveryRestored => self.discovery_restored(),

            DaemonEvent::BrowsePacket { src, advert } => {
                debug!(%src, uri = %advert.uri, "browse packet received");
                self.found_shared_printer(&advert.uri, &advert.info).await;
                self.rearm_reconciler();
            }

            DaemonEvent::PolledPrinters {
                server,
                printers,
                fresh,
            } => {
                debug!(
                    server = %server,
                    count = printers.len(),
                    fresh,
                    "polled printer list"
                );
                // Our own poll-driven intake must not count as an external
                // configuration change.
                self.view.set_inhibit(true);
                for printer in printers {
                    self.found_shared_printer(&printer.uri, &printer.info).await;
                }
                self.view.set_inhibit(false);
                self.rearm_reconciler();
            }
        }
    }

    /// Disappearance protocol for DNS-SD REMOVE events.
    fn handle_service_removed(&mut self, fullname: &str, service_type: &str) {
        let instance = dnssd::instance_name(fullname, service_type);
        let Some(index) = self
            .catalogue
            .find_by_service(instance, service_type, "local")
        else {
            return;
        };
        let now = self.clock.now();

        let (name, host, duplicate) = {
            let entry = match self.catalogue.get(index) {
                Some(entry) => entry,
                None => return,
            };
            (entry.name.clone(), entry.host.clone(), entry.duplicate)
        };

        let standby = if duplicate {
            None
        } else {
            self.catalogue.find_duplicate_for(&name, &host)
        };

        if let Some(standby_index) = standby {
            // Fail over: this entry adopts the standby's identity and the
            // queue is updated in place; the standby record is dropped.
            let (uri, new_host, service_name, stype, domain, description) = {
                let standby = match self.catalogue.get_mut(standby_index) {
                    Some(standby) => standby,
                    None => return,
                };
                standby.status = PrinterStatus::Disappeared;
                standby.deadline = Some(offset(now, timeout::IMMEDIATELY));
                (
                    standby.uri.clone(),
                    standby.host.clone(),
                    standby.service_name.clone(),
                    standby.service_type.clone(),
                    standby.service_domain.clone(),
                    std::mem::take(&mut standby.description),
                )
            };
            let entry = match self.catalogue.get_mut(index) {
                Some(entry) => entry,
                None => return,
            };
            info!(
                name = %entry.name,
                host = %new_host,
                uri = %uri,
                "printer disappeared, replacing by standby"
            );
            entry.uri = uri;
            entry.host = new_host;
            entry.service_name = service_name;
            entry.service_type = stype;
            entry.service_domain = domain;
            entry.description = description;
            entry.status = PrinterStatus::ToBeCreated;
            entry.deadline = Some(offset(now, timeout::IMMEDIATELY));
        } else {
            let entry = match self.catalogue.get_mut(index) {
                Some(entry) => entry,
                None => return,
            };
            info!(
                name = %entry.name,
                host = %entry.host,
                "printer disappeared, no standby available"
            );
            entry.status = PrinterStatus::Disappeared;
            entry.deadline = Some(offset(now, timeout::REMOVE));
        }
    }

    /// The discovery service went away: retire every DNS-SD queue now and,
    /// in avahi-bound mode, enter auto-shutdown.
    async fn discovery_lost(&mut self) {
        warn!("discovery service lost, removing DNS-SD queues");
        let now = self.clock.now();
        for index in 0..self.catalogue.len() {
            if let Some(entry) = self.catalogue.get_mut(index) {
                if !entry.service_type.is_empty() {
                    entry.status = PrinterStatus::Disappeared;
                    entry.deadline = Some(offset(now, timeout::IMMEDIATELY));
                }
            }
        }
        self.reconcile_pass().await;

        if self.config.autoshutdown == AutoShutdownMode::Avahi {
            info!("switching to auto shutdown mode");
            self.autoshutdown_enabled = true;
            if self.catalogue.is_empty() && self.autoshutdown_at.is_none() {
                self.arm_autoshutdown();
            }
        }
    }

    fn discovery_restored(&mut self) {
        if self.config.autoshutdown == AutoShutdownMode::Avahi {
            info!("discovery service available, switching to permanent mode");
            self.autoshutdown_enabled = false;
            self.autoshutdown_at = None;
        }
    }

    // -- timers --------------------------------------------------------------

    /// Recompute the reconciler wheel from the catalogue.
    pub(crate) fn rearm_reconciler(&mut self) {
        let now = self.clock.now();
        match self.catalogue.next_wake(now) {
            NextWake::Idle => {
                if !self.reconcile_idle {
                    debug!("listening");
                }
                self.reconcile_at = None;
                self.reconcile_idle = true;
            }
            NextWake::Immediate => {
                self.reconcile_at = Some(now);
                self.reconcile_idle = false;
            }
            NextWake::At(at) => {
                debug!(seconds = at - now, "checking queues soon");
                self.reconcile_at = Some(at);
                self.reconcile_idle = false;
            }
        }
    }

    fn arm_autoshutdown(&mut self) {
        info!(
            timeout = self.config.autoshutdown_timeout,
            "no queues to maintain, scheduling shutdown"
        );
        self.autoshutdown_at = Some(self.clock.now() + self.config.autoshutdown_timeout);
    }

    fn set_autoshutdown(&mut self, enabled: bool) {
        self.autoshutdown_enabled = enabled;
        if enabled {
            if self.catalogue.is_empty() && self.autoshutdown_at.is_none() {
                self.arm_autoshutdown();
            }
        } else {
            self.autoshutdown_at = None;
        }
    }

    /// Called by intake when the catalogue gains an entry.
    pub(crate) fn note_catalogue_grew(&mut self) {
        if self.autoshutdown_at.is_some() {
            debug!("new queues to maintain, cancelling pending shutdown");
            self.autoshutdown_at = None;
        }
    }

    /// Called by the reconciler when entries were removed.
    pub(crate) fn note_catalogue_shrunk(&mut self) {
        if self.autoshutdown_enabled
            && self.catalogue.is_empty()
            && self.autoshutdown_at.is_none()
        {
            self.arm_autoshutdown();
        }
    }

    pub(crate) async fn refresh_view(&mut self) -> Result<()> {
        self.view.refresh(&self.cups).await
    }

    // -- startup -------------------------------------------------------------

    async fn wait_for_print_service(&mut self) {
        loop {
            match self.cups.get_local_printers().await {
                Ok(printers) => {
                    self.view.replace(printers);
                    return;
                }
                Err(err) => {
                    debug!(%err, "waiting for local print service");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// Re-adopt queues this daemon created in a prior session.  They are
    /// retired unless discovery re-confirms them in time.
    fn recover_previous_queues(&mut self) {
        let now = self.clock.now();
        let lease = if self.config.browse_remote_protocols.cups {
            self.config.browse_timeout as i64
        } else {
            timeout::CONFIRM
        };

        let previous: Vec<(String, String)> = self
            .view
            .daemon_controlled()
            .map(|printer| (printer.name.clone(), printer.device_uri.clone()))
            .collect();

        for (name, device_uri) in previous {
            info!(name = %name, uri = %device_uri, "found queue from previous session");
            self.catalogue.insert(RemotePrinterEntry {
                name,
                uri: device_uri,
                host: String::new(),
                service_name: String::new(),
                service_type: String::new(),
                service_domain: String::new(),
                status: PrinterStatus::Unconfirmed,
                deadline: Some(offset(now, lease)),
                duplicate: false,
                description: DescriptionSource::Raw,
            });
        }
    }

    /// Bind the browse socket and spawn the discovery producer tasks.
    async fn start_sources(&mut self) {
        let config = &mut self.config;

        if config.browse_local_protocols.cups || config.browse_remote_protocols.cups {
            match UdpSocket::bind(("0.0.0.0", config.browse_port)).await {
                Ok(socket) => {
                    if let Err(err) = socket.set_broadcast(true) {
                        warn!(%err, "failed to allow broadcast");
                        config.browse_local_protocols.cups = false;
                    }
                    self.browse_socket = Some(Arc::new(socket));
                }
                Err(err) => {
                    // Just the legacy direction dies; everything else keeps
                    // running.
                    warn!(port = config.browse_port, %err, "failed to bind browse socket");
                    config.browse_local_protocols.cups = false;
                    config.browse_remote_protocols.cups = false;
                }
            }
        }

        if config.browse_remote_protocols.cups {
            if let Some(socket) = &self.browse_socket {
                broadcast::spawn_listener(
                    Arc::clone(socket),
                    config.browse_allow.clone(),
                    self.events_tx.clone(),
                    self.cancel.child_token(),
                );
            }
        }

        if config.browse_remote_protocols.dnssd {
            dnssd::spawn_browser(self.events_tx.clone(), self.cancel.child_token());
        }

        for target in config.browse_poll.clone() {
            poll::spawn_poller(
                target,
                config.browse_interval,
                self.events_tx.clone(),
                self.cancel.child_token(),
            );
        }
    }

    // -- broadcast -----------------------------------------------------------

    /// One outgoing broadcast cycle for the locally shared queues.
    async fn broadcast_pass(&mut self) {
        self.netifs.refresh(self.config.browse_port);
        if let Err(err) = self.refresh_view().await {
            debug!(%err, "view refresh before broadcast failed");
        }

        let Some(socket) = self.browse_socket.clone() else {
            return;
        };
        let response = match self.cups.get_printers_for_broadcast().await {
            Ok(response) => response,
            Err(err) => {
                debug!(%err, "browse send failed");
                return;
            }
        };
        let data = broadcast::collect_browse_data(response.attributes());
        debug!(count = data.len(), "sending browse data");
        broadcast::broadcast_cycle(
            &socket,
            self.netifs.interfaces(),
            &data,
            self.config.browse_timeout,
        )
        .await;
    }

    // -- shutdown ------------------------------------------------------------

    /// Retire every maintained queue, then stop the producer tasks.
    async fn shutdown(&mut self) {
        self.cancel.cancel();

        let now = self.clock.now();
        for index in 0..self.catalogue.len() {
            if let Some(entry) = self.catalogue.get_mut(index) {
                entry.status = PrinterStatus::Disappeared;
                entry.deadline = Some(offset(now, timeout::IMMEDIATELY));
            }
        }
        self.reconcile_pass().await;
        self.view.shutdown(&self.cups).await;
        info!("main loop exited");
    }
}

/// Sleep until `at`, or forever when nothing is scheduled.
async fn sleep_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn daemon() -> Daemon {
        let (daemon, _events) = Daemon::new(Config::default());
        daemon
    }

    fn dnssd_entry(name: &str, host: &str, instance: &str) -> RemotePrinterEntry {
        RemotePrinterEntry {
            name: name.into(),
            uri: format!("ipp://{host}:631/printers/{name}"),
            host: host.into(),
            service_name: instance.into(),
            service_type: "_ipp._tcp.local.".into(),
            service_domain: "local".into(),
            status: PrinterStatus::Confirmed,
            deadline: None,
            duplicate: false,
            description: DescriptionSource::Raw,
        }
    }

    #[test]
    fn removal_without_standby_marks_disappeared() {
        let mut d = daemon();
        d.catalogue.insert(dnssd_entry("hplj", "hosta", "HPLJ"));

        d.handle_service_removed("HPLJ._ipp._tcp.local.", "_ipp._tcp.local.");

        let entry = d.catalogue.get(0).unwrap();
        assert_eq!(entry.status, PrinterStatus::Disappeared);
        assert!(entry.deadline.is_some());
    }

    #[test]
    fn removal_with_standby_takes_over_identity() {
        let mut d = daemon();
        d.catalogue.insert(dnssd_entry("hplj", "hosta", "HPLJ"));
        let mut standby = dnssd_entry("hplj", "hostb", "HPLJ B");
        standby.duplicate = true;
        standby.status = PrinterStatus::ToBeCreated;
        d.catalogue.insert(standby);

        d.handle_service_removed("HPLJ._ipp._tcp.local.", "_ipp._tcp.local.");

        // The surviving entry now points at host B and is scheduled for a
        // queue update; the standby record is on its way out.
        let takeover = d
            .catalogue
            .entries()
            .iter()
            .find(|e| !e.duplicate)
            .unwrap();
        assert_eq!(takeover.host, "hostb");
        assert_eq!(takeover.uri, "ipp://hostb:631/printers/hplj");
        assert_eq!(takeover.status, PrinterStatus::ToBeCreated);
        assert!(takeover.deadline.is_some());

        let standby = d
            .catalogue
            .entries()
            .iter()
            .find(|e| e.duplicate)
            .unwrap();
        assert_eq!(standby.status, PrinterStatus::Disappeared);
    }

    #[test]
    fn removal_of_unknown_service_is_ignored() {
        let mut d = daemon();
        d.catalogue.insert(dnssd_entry("hplj", "hosta", "HPLJ"));

        d.handle_service_removed("Other._ipp._tcp.local.", "_ipp._tcp.local.");

        assert_eq!(d.catalogue.get(0).unwrap().status, PrinterStatus::Confirmed);
    }

    #[test]
    fn autoshutdown_arms_on_empty_and_cancels_on_growth() {
        let mut d = daemon();
        d.set_autoshutdown(true);
        assert!(d.autoshutdown_at.is_some());

        // Intake growing the catalogue cancels the pending shutdown.
        d.note_catalogue_grew();
        assert!(d.autoshutdown_at.is_none());

        // Disabling clears any pending timer too.
        d.set_autoshutdown(true);
        d.set_autoshutdown(false);
        assert!(d.autoshutdown_at.is_none());
    }
}
