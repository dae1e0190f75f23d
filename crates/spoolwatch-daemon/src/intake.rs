// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Intake & naming: the single path every discovery event funnels through.
//
// An advertisement either updates an existing catalogue entry or becomes a
// new one, with the local queue name derived from the remote queue name or
// the printer model.  Sanitisation is strict because queue names and PDL
// strings end up on filter command lines; a forged advertisement must
// never be able to smuggle shell metacharacters through.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::catalogue::{
    timeout, DescriptionSource, PrinterStatus, RemotePrinterEntry,
};
use crate::clock::offset;
use crate::cups::IppService;
use crate::daemon::Daemon;
use crate::descriptor;
use crate::uri;

/// PDLs a direct network printer can be driven with, driverlessly.
const USABLE_PDLS: [&str; 5] = [
    "application/postscript",
    "application/pdf",
    "image/pwg-raster",
    "application/vnd.hp-PCL",
    "application/vnd.hp-PCLXL",
];

/// TXT keys tried, in order, for a direct printer's model name.
const MODEL_KEYS: [&str; 3] = ["ty", "usb_mdl", "product"];

/// Sanitiser mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sanitise {
    /// Queue names and make/model strings: `[A-Za-z0-9_]`.
    Name,
    /// MIME type lists and hostnames: additionally `/`, `.`, `,`.
    Pdl,
}

/// Collapse every run of disallowed characters into a single `-` and trim
/// dashes from both ends.
pub fn sanitise(input: &str, mode: Sanitise) -> String {
    let mut out = String::with_capacity(input.len());
    let mut have_dash = false;
    for c in input.chars() {
        let allowed = c.is_ascii_alphanumeric()
            || c == '_'
            || (mode == Sanitise::Pdl && (c == '/' || c == '.' || c == ','));
        if allowed {
            out.push(c);
            have_dash = false;
        } else if !have_dash {
            out.push('-');
            have_dash = true;
        }
    }
    out.trim_matches('-').to_string()
}

/// Strip a trailing `.local` or `.local.` label, case-insensitively.
pub fn strip_local_suffix(host: &str) -> &str {
    let lower = host.to_ascii_lowercase();
    if let Some(stripped) = lower.strip_suffix(".local.") {
        &host[..stripped.len()]
    } else if let Some(stripped) = lower.strip_suffix(".local") {
        &host[..stripped.len()]
    } else {
        host
    }
}

/// What kind of printer an advertisement describes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueKind {
    /// Remote shared queue on a print server; tail is the remote name.
    Shared { remote_queue: String },
    /// Network printer speaking IPP directly.
    Direct,
}

/// Classify by resource path: `printers/...` and `classes/...` are shared
/// queues, anything else is a direct printer.
pub fn classify(resource: &str) -> QueueKind {
    let lower = resource.to_ascii_lowercase();
    if let Some(tail) = lower.strip_prefix("printers/") {
        QueueKind::Shared {
            remote_queue: resource[resource.len() - tail.len()..].to_string(),
        }
    } else if let Some(tail) = lower.strip_prefix("classes/") {
        QueueKind::Shared {
            remote_queue: resource[resource.len() - tail.len()..].to_string(),
        }
    } else {
        QueueKind::Direct
    }
}

/// Whether any advertised PDL is one we can drive without a device driver.
pub fn pdl_usable(pdl: &str) -> bool {
    let lower = pdl.to_ascii_lowercase();
    USABLE_PDLS
        .iter()
        .any(|usable| lower.contains(&usable.to_ascii_lowercase()))
}

/// A shared queue without a `product` TXT entry in parentheses is raw: the
/// remote side has no description file and the queue is unusable from here.
pub fn is_raw_shared_queue(
    txt: Option<&HashMap<String, String>>,
    service_domain: &str,
) -> bool {
    match txt {
        Some(txt) => match txt.get("product") {
            Some(value) => !(value.starts_with('(') && value.ends_with(')')),
            None => true,
        },
        // No TXT record at all: raw if this came from service discovery,
        // fine if it came from broadcast or polling.
        None => !service_domain.is_empty(),
    }
}

/// Pick the direct-printer model from the TXT record.
pub fn model_from_txt(txt: Option<&HashMap<String, String>>) -> Option<String> {
    let txt = txt?;
    for key in MODEL_KEYS {
        if let Some(value) = txt.get(key) {
            if value.len() >= 3 {
                return Some(value.clone());
            }
        }
    }
    None
}

/// One normalised discovery event, whichever source produced it.
#[derive(Debug, Clone)]
pub struct Advert {
    pub host: String,
    pub port: u16,
    /// Resource path without leading slash.
    pub resource: String,
    pub service_name: String,
    pub service_type: String,
    pub service_domain: String,
    pub txt: Option<HashMap<String, String>>,
}

impl Daemon {
    /// Process one advertisement; returns the affected catalogue index.
    pub(crate) async fn intake(&mut self, advert: Advert) -> Option<usize> {
        // Compose the device URI.  The secured service type upgrades the
        // scheme.
        let secured = advert.service_type.to_ascii_lowercase().contains("_ipps");
        let scheme = if secured { "ipps" } else { "ipp" };
        let device_uri = uri::assemble(scheme, &advert.host, advert.port, &advert.resource);

        let remote_host =
            strip_local_suffix(&sanitise(&advert.host, Sanitise::Pdl)).to_string();

        let kind = classify(&advert.resource);

        let mut pdl = None;
        let mut make_model = None;
        let remote_queue = match &kind {
            QueueKind::Shared { remote_queue } => {
                if is_raw_shared_queue(advert.txt.as_ref(), &advert.service_domain) {
                    debug!(
                        queue = %remote_queue,
                        host = %remote_host,
                        "remote queue is raw, ignored"
                    );
                    return None;
                }
                debug!(queue = %remote_queue, host = %remote_host, "found shared queue");
                sanitise(remote_queue, Sanitise::Name)
            }
            QueueKind::Direct => {
                pdl = advert
                    .txt
                    .as_ref()
                    .and_then(|txt| txt.get("pdl"))
                    .filter(|value| value.len() >= 3)
                    .map(|value| sanitise(value, Sanitise::Pdl));
                if !self.config.create_ipp_printer_queues {
                    debug!(uri = %device_uri, "direct printer queues disabled, ignored");
                    return None;
                }
                if !pdl.as_deref().is_some_and(pdl_usable) {
                    debug!(uri = %device_uri, "no usable PDL advertised, ignored");
                    return None;
                }
                make_model = model_from_txt(advert.txt.as_ref());
                make_model
                    .as_deref()
                    .map(|model| sanitise(model, Sanitise::Name))
                    .filter(|name| !name.is_empty())
                    .unwrap_or_else(|| "printer".to_string())
            }
        };
        let remote_queue = if remote_queue.is_empty() {
            "printer".to_string()
        } else {
            remote_queue
        };

        // Collision resolution against the queues that already exist
        // locally.
        if let Err(err) = self.refresh_view().await {
            debug!(%err, "could not refresh local printer view");
        }

        let uri_taken = self.view.find_by_uri(&device_uri).is_some();
        let local_queue_name = if uri_taken {
            remote_queue.clone()
        } else {
            match choose_local_name(&self.view, &remote_queue, &remote_host) {
                Some(name) => name,
                None => {
                    debug!(name = %remote_queue, "name and fallback both taken, ignored");
                    return None;
                }
            }
        };

        let existing = self
            .catalogue
            .find_intake_match(&local_queue_name, &remote_host);

        if uri_taken {
            // Another instance or a prior session already points a queue at
            // this URI; only a matching catalogue entry makes it ours.
            if existing.is_none() {
                debug!(uri = %device_uri, "queue with this URI already exists, ignored");
            }
            return existing;
        }

        let now = self.clock.now();
        if let Some(index) = existing {
            let entry = self.catalogue.get_mut(index)?;

            let upgrade_to_ipps = secured && entry.uri.to_ascii_lowercase().starts_with("ipp:");
            let tail_changed = !uri_tail(&entry.uri).eq_ignore_ascii_case(uri_tail(&device_uri));

            if upgrade_to_ipps || tail_changed {
                info!(
                    name = %entry.name,
                    host = %remote_host,
                    uri = %device_uri,
                    "updating queue device URI"
                );
                entry.uri = device_uri;
                entry.host = remote_host;
                entry.service_name = advert.service_name.clone();
                entry.service_type = advert.service_type.clone();
                entry.service_domain = advert.service_domain.clone();
                entry.status = PrinterStatus::ToBeCreated;
                entry.deadline = Some(offset(now, timeout::IMMEDIATELY));
            } else {
                if entry.status == PrinterStatus::Unconfirmed
                    || entry.status == PrinterStatus::Disappeared
                {
                    debug!(name = %entry.name, "marking entry as confirmed");
                    entry.status = PrinterStatus::Confirmed;
                    entry.deadline = None;
                }
                // Backfill identity fields left empty by recovery or
                // broadcast discovery.
                if entry.host.is_empty() {
                    entry.host = remote_host;
                }
                if entry.service_name.is_empty() {
                    entry.service_name = advert.service_name.clone();
                }
                if entry.service_type.is_empty() {
                    entry.service_type = advert.service_type.clone();
                }
                if entry.service_domain.is_empty() {
                    entry.service_domain = advert.service_domain.clone();
                }
            }
            return Some(index);
        }

        // New entry.
        let description = match &kind {
            QueueKind::Shared { .. } => DescriptionSource::Raw,
            QueueKind::Direct => {
                match self
                    .build_direct_description(
                        &device_uri,
                        &local_queue_name,
                        pdl.as_deref().unwrap_or(""),
                        make_model.as_deref().unwrap_or(""),
                    )
                    .await
                {
                    Some(description) => description,
                    None => return None,
                }
            }
        };

        let mut entry = RemotePrinterEntry {
            name: local_queue_name,
            uri: device_uri,
            host: remote_host,
            service_name: advert.service_name,
            service_type: advert.service_type,
            service_domain: advert.service_domain,
            status: PrinterStatus::ToBeCreated,
            deadline: Some(offset(now, timeout::IMMEDIATELY)),
            duplicate: false,
            description,
        };

        if matches!(kind, QueueKind::Shared { .. }) {
            // Same name from another server: the queue can only have one
            // owner, the other entry becomes (or this one starts as) a
            // standby duplicate.
            if let Some(other) = self.catalogue.find_same_name(&entry.name) {
                let other = self.catalogue.get_mut(other)?;
                if other.status != PrinterStatus::Disappeared
                    && other.status != PrinterStatus::Unconfirmed
                {
                    info!(
                        name = %entry.name,
                        host = %other.host,
                        "printer already available, adding standby entry"
                    );
                    entry.duplicate = true;
                } else {
                    info!(
                        name = %entry.name,
                        host = %other.host,
                        "replacing unconfirmed entry, marking old as standby"
                    );
                    other.duplicate = true;
                }
            }
        }

        info!(name = %entry.name, uri = %entry.uri, "new remote printer");
        let index = self.catalogue.insert(entry);
        self.note_catalogue_grew();
        Some(index)
    }

    /// Probe a direct printer and produce its description artefact.
    ///
    /// A printer we cannot reach is not set up at all; a printer whose
    /// attributes do not yield a description file gets an interface script.
    async fn build_direct_description(
        &self,
        device_uri: &str,
        queue_name: &str,
        pdl: &str,
        make_model: &str,
    ) -> Option<DescriptionSource> {
        let response = match IppService::probe_printer(device_uri).await {
            Ok(response) => response,
            Err(err) => {
                warn!(uri = %device_uri, %err, "cannot reach printer, ignored");
                return None;
            }
        };

        if let Some(bytes) = descriptor::synthesize_description(response.attributes()) {
            match descriptor::write_description_file(&bytes) {
                Ok(path) => return Some(DescriptionSource::DescriptionFile(path)),
                Err(err) => warn!(%err, "could not write description file"),
            }
        }

        let model = sanitise(make_model, Sanitise::Name);
        match descriptor::write_interface_script(queue_name, pdl, &model) {
            Ok(path) => Some(DescriptionSource::InterfaceScript(path)),
            Err(err) => {
                warn!(%err, "could not write interface script, printer ignored");
                None
            }
        }
    }

    /// Shared handling for printers discovered via legacy broadcast or
    /// polling: validate the URI shape, drop our own broadcasts, then run
    /// intake and apply the lease-based status adjustment.
    pub(crate) async fn found_shared_printer(&mut self, printer_uri: &str, info: &str) {
        let Some((_, host, port, resource)) = uri::split(printer_uri) else {
            debug!(uri = %printer_uri, "don't understand URI");
            return;
        };

        // Our own broadcasts come back with one of our interface
        // addresses as the host.
        if let Ok(addr) = host.parse::<std::net::IpAddr>() {
            if self.netifs.has_address(addr) {
                debug!(%addr, "ignoring own broadcast");
                return;
            }
        }

        let lower = resource.to_ascii_lowercase();
        if !lower.starts_with("printers/") && !lower.starts_with("classes/") {
            debug!(uri = %printer_uri, "don't understand URI");
            return;
        }

        let advert = Advert {
            host,
            port,
            resource,
            service_name: info.to_string(),
            service_type: String::new(),
            service_domain: String::new(),
            txt: None,
        };

        let now = self.clock.now();
        let browse_timeout = self.config.browse_timeout;
        if let Some(index) = self.intake(advert).await {
            if let Some(entry) = self.catalogue.get_mut(index) {
                if entry.status == PrinterStatus::ToBeCreated {
                    entry.status = PrinterStatus::BrowsePacketReceived;
                } else {
                    // Lease renewal: the advertisement must repeat before
                    // the browse timeout or the queue is retired.
                    entry.status = PrinterStatus::Disappeared;
                    entry.deadline = Some(now + browse_timeout);
                }
            }
        }
    }
}

/// Everything from the first `:` on — the URI without its scheme.
fn uri_tail(uri: &str) -> &str {
    uri.split_once(':').map(|(_, tail)| tail).unwrap_or(uri)
}

/// Pick the local queue name, working around foreign queues.
///
/// A queue we created may be reused; a queue someone else created pushes
/// us to `name@host`, and when that is foreign too the printer is
/// ignored (`None`).
fn choose_local_name(
    view: &crate::local_view::LocalPrinterView,
    remote_queue: &str,
    remote_host: &str,
) -> Option<String> {
    if let Some(local) = view.get(remote_queue) {
        if !local.daemon_controlled {
            let fallback = format!("{remote_queue}@{remote_host}");
            debug!(taken = %remote_queue, %fallback, "queue name already taken");
            if let Some(local) = view.get(&fallback) {
                if !local.daemon_controlled {
                    return None;
                }
            }
            return Some(fallback);
        }
    }
    Some(remote_queue.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitise_name_mode() {
        assert_eq!(sanitise("HP LaserJet 4", Sanitise::Name), "HP-LaserJet-4");
        assert_eq!(sanitise("(HP LaserJet)", Sanitise::Name), "HP-LaserJet");
        assert_eq!(sanitise("a//b..c", Sanitise::Name), "a-b-c");
        assert_eq!(sanitise("___", Sanitise::Name), "___");
        assert_eq!(sanitise("!!!", Sanitise::Name), "");
    }

    #[test]
    fn sanitise_pdl_mode_keeps_mime_chars() {
        assert_eq!(
            sanitise("application/pdf,image/pwg-raster", Sanitise::Pdl),
            "application/pdf,image/pwg-raster"
        );
        assert_eq!(sanitise("a$b;c", Sanitise::Pdl), "a-b-c");
    }

    #[test]
    fn sanitise_collapses_runs_to_single_dash() {
        assert_eq!(sanitise("a   !!  b", Sanitise::Name), "a-b");
    }

    #[test]
    fn sanitise_is_idempotent() {
        for input in ["HP LaserJet 4", "a$b;c", "--x--", "printer.local"] {
            for mode in [Sanitise::Name, Sanitise::Pdl] {
                let once = sanitise(input, mode);
                assert_eq!(sanitise(&once, mode), once);
            }
        }
    }

    #[test]
    fn local_suffix_stripping() {
        assert_eq!(strip_local_suffix("printer.local"), "printer");
        assert_eq!(strip_local_suffix("printer.local."), "printer");
        assert_eq!(strip_local_suffix("printer.LOCAL"), "printer");
        assert_eq!(strip_local_suffix("printer.example.com"), "printer.example.com");
        // The dotted form is recognised as a whole, not as `.local` plus
        // a stray dot.
        assert_eq!(strip_local_suffix("a.local.local."), "a.local");
    }

    #[test]
    fn classify_resources() {
        assert_eq!(
            classify("printers/hplj"),
            QueueKind::Shared {
                remote_queue: "hplj".into()
            }
        );
        assert_eq!(
            classify("CLASSES/lab"),
            QueueKind::Shared {
                remote_queue: "lab".into()
            }
        );
        assert_eq!(classify("ipp/print"), QueueKind::Direct);
        assert_eq!(classify(""), QueueKind::Direct);
    }

    #[test]
    fn pdl_usability() {
        assert!(pdl_usable("application/pdf"));
        assert!(pdl_usable("image/urf,application/PDF,image/jpeg"));
        assert!(pdl_usable("application/vnd.hp-pclxl"));
        assert!(!pdl_usable("application/octet-stream"));
        assert!(!pdl_usable(""));
    }

    fn txt(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn raw_queue_detection() {
        // product present and parenthesised: not raw.
        let good = txt(&[("product", "(HP LaserJet)")]);
        assert!(!is_raw_shared_queue(Some(&good), "local"));
        // product missing or unparenthesised: raw.
        let missing = txt(&[("ty", "HP LaserJet")]);
        assert!(is_raw_shared_queue(Some(&missing), "local"));
        let bad = txt(&[("product", "HP LaserJet")]);
        assert!(is_raw_shared_queue(Some(&bad), "local"));
        // No TXT from service discovery: raw.
        assert!(is_raw_shared_queue(None, "local"));
        // No TXT from broadcast/polling: usable.
        assert!(!is_raw_shared_queue(None, ""));
    }

    #[test]
    fn model_key_priority() {
        let record = txt(&[("ty", "HP LaserJet 4"), ("product", "(LJ4)")]);
        assert_eq!(model_from_txt(Some(&record)).unwrap(), "HP LaserJet 4");
        let record = txt(&[("usb_mdl", "LaserJet"), ("product", "(LJ4 Model)")]);
        assert_eq!(model_from_txt(Some(&record)).unwrap(), "LaserJet");
        // Short values are skipped.
        let record = txt(&[("ty", "x"), ("product", "(HP LaserJet)")]);
        assert_eq!(model_from_txt(Some(&record)).unwrap(), "(HP LaserJet)");
        assert_eq!(model_from_txt(None), None);
    }

    #[test]
    fn uri_tail_ignores_scheme() {
        assert_eq!(uri_tail("ipp://h:631/p"), "//h:631/p");
        assert!(uri_tail("ipp://h:631/p").eq_ignore_ascii_case(uri_tail("IPPS://h:631/p")));
    }

    fn view_with(printers: Vec<crate::cups::LocalPrinter>) -> crate::local_view::LocalPrinterView {
        let mut view = crate::local_view::LocalPrinterView::new(60);
        view.replace(printers);
        view
    }

    fn local(name: &str, ours: bool) -> crate::cups::LocalPrinter {
        crate::cups::LocalPrinter {
            name: name.into(),
            device_uri: format!("usb://{name}"),
            daemon_controlled: ours,
        }
    }

    #[test]
    fn free_name_is_used_directly() {
        let view = view_with(vec![]);
        assert_eq!(
            choose_local_name(&view, "hplj", "printer").as_deref(),
            Some("hplj")
        );
    }

    #[test]
    fn our_own_queue_does_not_force_fallback() {
        let view = view_with(vec![local("hplj", true)]);
        assert_eq!(
            choose_local_name(&view, "hplj", "printer").as_deref(),
            Some("hplj")
        );
    }

    #[test]
    fn foreign_queue_forces_host_fallback() {
        let view = view_with(vec![local("hplj", false)]);
        assert_eq!(
            choose_local_name(&view, "hplj", "printer").as_deref(),
            Some("hplj@printer")
        );
    }

    #[test]
    fn foreign_fallback_rejects_printer() {
        let view = view_with(vec![local("hplj", false), local("hplj@printer", false)]);
        assert_eq!(choose_local_name(&view, "hplj", "printer"), None);
    }
}
