// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// DNS-SD printer discovery.
//
// Browses `_ipp._tcp.local.` and `_ipps._tcp.local.` through `mdns-sd` and
// forwards resolved services and removals to the daemon loop.  When the
// mDNS daemon fails, the supervisor reports the loss (which may arm
// auto-shutdown), then keeps retrying; browsers are recreated on success.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::daemon::DaemonEvent;

/// mDNS service type for plain IPP.
pub const IPP_SERVICE: &str = "_ipp._tcp.local.";

/// mDNS service type for TLS-secured IPP.
pub const IPPS_SERVICE: &str = "_ipps._tcp.local.";

/// Delay before reconnecting after the mDNS daemon goes away.
const RECONNECT_DELAY: Duration = Duration::from_secs(10);

/// A fully resolved printer service.
#[derive(Debug, Clone)]
pub struct ResolvedService {
    /// Instance part of the service name.
    pub service_name: String,
    /// e.g. `_ipp._tcp.local.`
    pub service_type: String,
    pub service_domain: String,
    /// Hostname without the trailing dot.
    pub host: String,
    pub port: u16,
    pub addresses: Vec<IpAddr>,
    pub txt: HashMap<String, String>,
}

/// Split a full service name into its instance part.
///
/// `My Printer._ipp._tcp.local.` with type `_ipp._tcp.local.` yields
/// `My Printer`.
pub fn instance_name<'a>(fullname: &'a str, service_type: &str) -> &'a str {
    fullname
        .strip_suffix(service_type)
        .map(|name| name.trim_end_matches('.'))
        .unwrap_or(fullname)
}

fn resolved_from(info: &ServiceInfo) -> ResolvedService {
    let service_type = info.get_type().to_string();
    let txt: HashMap<String, String> = info
        .get_properties()
        .iter()
        .map(|prop| (prop.key().to_ascii_lowercase(), prop.val_str().to_string()))
        .collect();

    ResolvedService {
        service_name: instance_name(info.get_fullname(), &service_type).to_string(),
        service_domain: "local".to_string(),
        service_type,
        host: info.get_hostname().trim_end_matches('.').to_string(),
        port: info.get_port(),
        addresses: info.get_addresses().iter().copied().collect(),
        txt,
    }
}

/// Spawn the browser supervisor.
pub fn spawn_browser(
    tx: mpsc::Sender<DaemonEvent>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if cancel.is_cancelled() {
                break;
            }

            match start_browsers() {
                Ok((daemon, ipp_rx, ipps_rx)) => {
                    info!("DNS-SD browsers running");
                    if tx.send(DaemonEvent::DiscoveryRestored).await.is_err() {
                        let _ = daemon.shutdown();
                        break;
                    }

                    let lost = drain_browsers(&tx, &cancel, ipp_rx, ipps_rx).await;
                    let _ = daemon.shutdown();
                    if !lost {
                        // Cancelled or loop gone.
                        break;
                    }
                    warn!("DNS-SD service lost, tearing down browsers");
                }
                Err(err) => {
                    warn!(%err, "failed to start DNS-SD browsers");
                }
            }

            if tx.send(DaemonEvent::DiscoveryLost).await.is_err() {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            }
        }
        debug!("DNS-SD supervisor stopped");
    })
}

type BrowseReceivers = (
    ServiceDaemon,
    mdns_sd::Receiver<ServiceEvent>,
    mdns_sd::Receiver<ServiceEvent>,
);

fn start_browsers() -> Result<BrowseReceivers, mdns_sd::Error> {
    let daemon = ServiceDaemon::new()?;
    let ipp_rx = daemon.browse(IPP_SERVICE)?;
    let ipps_rx = match daemon.browse(IPPS_SERVICE) {
        Ok(rx) => rx,
        Err(err) => {
            let _ = daemon.shutdown();
            return Err(err);
        }
    };
    Ok((daemon, ipp_rx, ipps_rx))
}

/// Forward events until a receiver dies (returns `true`) or we are
/// cancelled (returns `false`).
async fn drain_browsers(
    tx: &mpsc::Sender<DaemonEvent>,
    cancel: &CancellationToken,
    ipp_rx: mdns_sd::Receiver<ServiceEvent>,
    ipps_rx: mdns_sd::Receiver<ServiceEvent>,
) -> bool {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return false,
            event = ipp_rx.recv_async() => event,
            event = ipps_rx.recv_async() => event,
        };

        let event = match event {
            Ok(event) => event,
            Err(_) => return true,
        };

        let forwarded = match event {
            ServiceEvent::ServiceResolved(info) => {
                let resolved = resolved_from(&info);
                debug!(
                    name = %resolved.service_name,
                    service_type = %resolved.service_type,
                    host = %resolved.host,
                    "service resolved"
                );
                tx.send(DaemonEvent::ServiceResolved(resolved)).await
            }
            ServiceEvent::ServiceRemoved(service_type, fullname) => {
                debug!(name = %fullname, "service removed");
                tx.send(DaemonEvent::ServiceRemoved {
                    fullname,
                    service_type,
                })
                .await
            }
            ServiceEvent::SearchStarted(ty) | ServiceEvent::SearchStopped(ty) => {
                debug!(service_type = %ty, "browser state change");
                Ok(())
            }
            ServiceEvent::ServiceFound(ty, fullname) => {
                debug!(service_type = %ty, name = %fullname, "service found, resolving");
                Ok(())
            }
        };

        if forwarded.is_err() {
            return false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_name_strips_type_suffix() {
        assert_eq!(
            instance_name("HPLJ._ipp._tcp.local.", "_ipp._tcp.local."),
            "HPLJ"
        );
        assert_eq!(
            instance_name("My Printer (2)._ipps._tcp.local.", "_ipps._tcp.local."),
            "My Printer (2)"
        );
    }

    #[test]
    fn instance_name_passes_through_on_mismatch() {
        assert_eq!(
            instance_name("oddball.example.", "_ipp._tcp.local."),
            "oddball.example."
        );
    }
}
