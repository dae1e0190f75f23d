// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Legacy CUPS browsing over UDP: inbound packet listener and outbound
// broadcaster.
//
// The wire format is one text line per printer:
//
//   <type-hex> <state-hex> <uri> "<location>" "<info>" "<make-model>"
//   lease-duration=<secs>[ <opt>=<val>...]
//
// The inbound parser requires the first three fields; the quoted fields
// are optional.  One malformed datagram must never take down the listener.

use std::net::IpAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use spoolwatch_core::allow::AllowList;
use spoolwatch_core::error::{Result, SpoolwatchError};

use crate::cups::printer_type;
use crate::daemon::DaemonEvent;
use crate::netif::NetInterface;
use crate::uri;

/// Maximum browse packet size, matching the classic implementation.
pub const MAX_PACKET: usize = 2048;

/// One parsed inbound browse advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowseAdvert {
    pub type_flags: u32,
    pub state: u32,
    pub uri: String,
    pub location: String,
    pub info: String,
}

/// Parse an inbound browse packet.
///
/// Bounds are explicit: the packet is treated as an opaque string, quoted
/// fields are scanned with the terminator required, and nothing beyond the
/// buffer is ever touched.
pub fn parse_browse_packet(packet: &str) -> Result<BrowseAdvert> {
    let mut tokens = packet.split_whitespace();

    let type_flags = tokens
        .next()
        .and_then(|t| u32::from_str_radix(t, 16).ok())
        .ok_or_else(|| SpoolwatchError::BrowsePacket("missing type field".into()))?;
    let state = tokens
        .next()
        .and_then(|t| u32::from_str_radix(t, 16).ok())
        .ok_or_else(|| SpoolwatchError::BrowsePacket("missing state field".into()))?;
    let uri = tokens
        .next()
        .ok_or_else(|| SpoolwatchError::BrowsePacket("missing uri field".into()))?
        .to_string();

    // Optional quoted fields: location, then info.
    let mut location = String::new();
    let mut info = String::new();
    if let Some(start) = packet.find('"') {
        let rest = &packet[start + 1..];
        let end = rest
            .find('"')
            .ok_or_else(|| SpoolwatchError::BrowsePacket("unterminated location field".into()))?;
        location = rest[..end].to_string();

        let after = rest[end + 1..].trim_start();
        if let Some(rest) = after.strip_prefix('"') {
            let end = rest
                .find('"')
                .ok_or_else(|| SpoolwatchError::BrowsePacket("unterminated info field".into()))?;
            info = rest[..end].to_string();
        }
    }

    Ok(BrowseAdvert {
        type_flags,
        state,
        uri,
        location,
        info,
    })
}

/// One outbound advertisement built from a local shared queue.
#[derive(Debug, Clone)]
pub struct BrowseData {
    pub type_flags: u32,
    pub state: u32,
    pub uri: String,
    pub location: String,
    pub info: String,
    pub make_model: String,
    /// Pre-rendered `key=value` pairs appended after lease-duration.
    pub browse_options: String,
}

/// Render one outbound packet, or `None` when it would exceed the wire
/// limit (oversize packets are dropped, never truncated).
pub fn format_browse_packet(
    data: &BrowseData,
    uri: &str,
    browse_timeout: u64,
) -> Option<String> {
    let packet = format!(
        "{:x} {:x} {} \"{}\" \"{}\" \"{}\" lease-duration={}{}{}\n",
        data.type_flags,
        data.state,
        uri,
        data.location,
        data.info,
        data.make_model,
        browse_timeout,
        if data.browse_options.is_empty() { "" } else { " " },
        data.browse_options,
    );
    if packet.len() >= MAX_PACKET {
        return None;
    }
    Some(packet)
}

/// Build the outgoing advertisement list from a Get-Printers reply,
/// skipping queues not marked shared.
pub fn collect_browse_data(attrs: &ipp::prelude::IppAttributes) -> Vec<BrowseData> {
    use ipp::prelude::{DelimiterTag, IppValue};

    let mut browse_data = Vec::new();
    for group in attrs.groups_of(DelimiterTag::PrinterAttributes) {
        let printer = group.attributes();

        let number = |name: &str| {
            printer.get(name).and_then(|attr| match attr.value() {
                IppValue::Enum(value) | IppValue::Integer(value) => Some(*value as u32),
                _ => None,
            })
        };
        // Quotes would corrupt the packet's quoted fields.
        let text = |name: &str| {
            printer
                .get(name)
                .map(|attr| attr.value().to_string().replace('"', ""))
        };

        let Some(type_flags) = number("printer-type") else {
            continue;
        };
        if type_flags & printer_type::NOT_SHARED != 0 {
            continue;
        }
        let Some(state) = number("printer-state") else {
            continue;
        };
        let (Some(uri), Some(location), Some(info), Some(make_model)) = (
            text("printer-uri-supported"),
            text("printer-location"),
            text("printer-info"),
            text("printer-make-and-model"),
        ) else {
            continue;
        };

        let mut options = String::new();
        if let Some(auth) = text("auth-info-required") {
            if !auth.eq_ignore_ascii_case("none") {
                options.push_str(&format!("auth-info-required={auth} "));
            }
        }
        if let Some(uuid) = text("printer-uuid") {
            options.push_str(&format!("uuid={uuid} "));
        }
        if let Some(attr) = printer.get("job-sheets-default") {
            if let IppValue::Array(values) = attr.value() {
                if values.len() == 2 {
                    options.push_str(&format!("job-sheets={},{} ", values[0], values[1]));
                }
            }
        }
        for (name, attr) in printer {
            let Some(option) = name.strip_suffix("-default") else {
                continue;
            };
            if name.as_str() == "job-sheets-default" {
                continue;
            }
            match attr.value() {
                IppValue::Keyword(value)
                | IppValue::NameWithoutLanguage(value)
                | IppValue::OctetString(value) => {
                    options.push_str(&format!("{option}={} ", escape_option_value(value)));
                }
                _ => {}
            }
        }

        browse_data.push(BrowseData {
            type_flags,
            state,
            uri,
            location,
            info,
            make_model,
            browse_options: options.trim_end().to_string(),
        });
    }
    browse_data
}

/// Escape separators in a default-option value for the packet's
/// option list.
fn escape_option_value(value: &str) -> String {
    value
        .split([' ', '"', '\'', '\\'])
        .collect::<Vec<_>>()
        .join("\\")
}

/// Spawn the inbound listener.  Disallowed and malformed packets are
/// dropped; the socket watch continues regardless.
pub fn spawn_listener(
    socket: Arc<UdpSocket>,
    allow: AllowList,
    tx: mpsc::Sender<DaemonEvent>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = [0u8; MAX_PACKET];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = socket.recv_from(&mut buf) => {
                    let (len, src) = match received {
                        Ok(received) => received,
                        Err(err) => {
                            warn!(%err, "error receiving browse packet");
                            continue;
                        }
                    };

                    if !allow.allowed(src.ip()) {
                        debug!(src = %src.ip(), "browse packet disallowed");
                        continue;
                    }

                    let packet = String::from_utf8_lossy(&buf[..len]);
                    let advert = match parse_browse_packet(&packet) {
                        Ok(advert) => advert,
                        Err(err) => {
                            debug!(src = %src.ip(), %err, "ignoring browse packet");
                            continue;
                        }
                    };

                    // Deletion over broadcast is handled by lease timeout,
                    // not by the delete bit.
                    if advert.type_flags & printer_type::DELETE != 0 {
                        continue;
                    }

                    if tx
                        .send(DaemonEvent::BrowsePacket {
                            src: src.ip(),
                            advert,
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }
        debug!("browse listener stopped");
    })
}

/// Send one broadcast cycle: every advertisement on every interface, with
/// the interface address substituted into the device URI.
pub async fn broadcast_cycle(
    socket: &UdpSocket,
    interfaces: &[NetInterface],
    browse_data: &[BrowseData],
    browse_timeout: u64,
) {
    for data in browse_data {
        for iface in interfaces {
            let host = match iface.address {
                IpAddr::V4(v4) => v4.to_string(),
                IpAddr::V6(v6) => format!("[{v6}]"),
            };
            let uri = match uri::with_host(&data.uri, &host) {
                Some(uri) => uri,
                None => data.uri.clone(),
            };

            let Some(packet) = format_browse_packet(data, &uri, browse_timeout) else {
                warn!(uri = %data.uri, "oversize browse packet not sent");
                continue;
            };

            if let Err(err) = socket.send_to(packet.as_bytes(), iface.broadcast).await {
                warn!(dest = %iface.broadcast, %err, "browse packet send failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_packet() {
        let advert = parse_browse_packet(
            "6 3 ipp://host:631/printers/laser \"Lab\" \"Laser Printer\" \"HP LaserJet\" lease-duration=300\n",
        )
        .unwrap();
        assert_eq!(advert.type_flags, 0x6);
        assert_eq!(advert.state, 0x3);
        assert_eq!(advert.uri, "ipp://host:631/printers/laser");
        assert_eq!(advert.location, "Lab");
        assert_eq!(advert.info, "Laser Printer");
    }

    #[test]
    fn quoted_fields_are_optional() {
        let advert = parse_browse_packet("800c 3 ipp://host:631/printers/laser").unwrap();
        assert_eq!(advert.type_flags, 0x800c);
        assert_eq!(advert.location, "");
        assert_eq!(advert.info, "");
    }

    #[test]
    fn location_without_info_is_accepted() {
        let advert = parse_browse_packet("6 3 ipp://h/printers/a \"Office\"").unwrap();
        assert_eq!(advert.location, "Office");
        assert_eq!(advert.info, "");
    }

    #[test]
    fn rejects_missing_fields() {
        assert!(parse_browse_packet("").is_err());
        assert!(parse_browse_packet("6").is_err());
        assert!(parse_browse_packet("6 3").is_err());
        assert!(parse_browse_packet("zz 3 ipp://h/p").is_err());
    }

    #[test]
    fn rejects_unterminated_quote() {
        assert!(parse_browse_packet("6 3 ipp://h/p \"Office").is_err());
        assert!(parse_browse_packet("6 3 ipp://h/p \"Office\" \"Laser").is_err());
    }

    #[test]
    fn parser_survives_hostile_input() {
        // No panics on binary garbage, embedded NULs, or very long tokens.
        let _ = parse_browse_packet("\u{0}\u{0}\u{0}");
        let _ = parse_browse_packet(&"a".repeat(4096));
        let long = format!("6 3 ipp://h/{} \"x\"", "p".repeat(3000));
        let _ = parse_browse_packet(&long);
    }

    fn data() -> BrowseData {
        BrowseData {
            type_flags: 0x6,
            state: 3,
            uri: "ipp://localhost:631/printers/laser".into(),
            location: "Lab".into(),
            info: "Laser".into(),
            make_model: "HP LaserJet".into(),
            browse_options: String::new(),
        }
    }

    #[test]
    fn formats_packet_with_lease() {
        let packet = format_browse_packet(&data(), "ipp://10.0.0.4:631/printers/laser", 300).unwrap();
        assert!(packet.starts_with("6 3 ipp://10.0.0.4:631/printers/laser \"Lab\" \"Laser\" \"HP LaserJet\" lease-duration=300"));
        assert!(packet.ends_with('\n'));
    }

    #[test]
    fn appends_browse_options() {
        let mut d = data();
        d.browse_options = "uuid=urn:uuid:1234".into();
        let packet = format_browse_packet(&d, &d.uri.clone(), 300).unwrap();
        assert!(packet.contains("lease-duration=300 uuid=urn:uuid:1234"));
    }

    #[test]
    fn oversize_packet_is_dropped_not_truncated() {
        let mut d = data();
        d.info = "x".repeat(MAX_PACKET);
        assert!(format_browse_packet(&d, &d.uri.clone(), 300).is_none());
    }

    #[test]
    fn collects_only_shared_queues() {
        use ipp::prelude::{DelimiterTag, IppAttribute, IppAttributes, IppValue};

        let mut attrs = IppAttributes::default();
        let shared = [
            ("printer-type", IppValue::Enum(0x6)),
            ("printer-state", IppValue::Enum(3)),
            (
                "printer-uri-supported",
                IppValue::Uri("ipp://localhost:631/printers/laser".into()),
            ),
            ("printer-location", IppValue::TextWithoutLanguage("\"Lab\"".into())),
            ("printer-info", IppValue::TextWithoutLanguage("Laser".into())),
            (
                "printer-make-and-model",
                IppValue::TextWithoutLanguage("HP LaserJet".into()),
            ),
            (
                "printer-uuid",
                IppValue::Uri("urn:uuid:1234".into()),
            ),
        ];
        for (name, value) in shared {
            attrs.add(DelimiterTag::PrinterAttributes, IppAttribute::new(name, value));
        }

        let data = collect_browse_data(&attrs);
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].uri, "ipp://localhost:631/printers/laser");
        // Quotes from attribute values never reach the packet.
        assert_eq!(data[0].location, "Lab");
        assert!(data[0].browse_options.contains("uuid=urn:uuid:1234"));

        // An unshared queue produces nothing.
        let mut unshared = IppAttributes::default();
        unshared.add(
            DelimiterTag::PrinterAttributes,
            IppAttribute::new(
                "printer-type",
                IppValue::Enum((0x6 | printer_type::NOT_SHARED) as i32),
            ),
        );
        assert!(collect_browse_data(&unshared).is_empty());
    }

    #[test]
    fn round_trip_format_then_parse() {
        let packet = format_browse_packet(&data(), &data().uri, 300).unwrap();
        let advert = parse_browse_packet(&packet).unwrap();
        assert_eq!(advert.uri, data().uri);
        assert_eq!(advert.info, "Laser");
    }
}
