// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Small device-URI helpers.
//
// Device URIs here are the printing flavour (`ipp://host:port/resource`);
// we only ever need to split them, rebuild them, and swap the host, so a
// dedicated parser is simpler and stricter than a general URL library.

/// Split `scheme://host[:port]/resource` into its parts.
///
/// The resource is returned without its leading slash and with any query
/// string removed.  Returns `None` when the shape does not match.
pub fn split(uri: &str) -> Option<(String, String, u16, String)> {
    let (scheme, rest) = uri.split_once("://")?;
    if scheme.is_empty() {
        return None;
    }

    let (authority, resource) = match rest.split_once('/') {
        Some((authority, resource)) => (authority, resource),
        None => (rest, ""),
    };
    if authority.is_empty() {
        return None;
    }

    // Strip userinfo if present; we never dial with credentials.
    let authority = authority.rsplit_once('@').map_or(authority, |(_, h)| h);

    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port_str)) if !port_str.is_empty() && !port_str.contains(']') => {
            (host, port_str.parse::<u16>().ok()?)
        }
        _ => (authority, 631),
    };
    if host.is_empty() {
        return None;
    }

    let resource = resource.split('?').next().unwrap_or("");
    Some((
        scheme.to_string(),
        host.trim_matches(['[', ']']).to_string(),
        port,
        resource.to_string(),
    ))
}

/// Assemble `scheme://host:port/resource`.
pub fn assemble(scheme: &str, host: &str, port: u16, resource: &str) -> String {
    let resource = resource.trim_start_matches('/');
    format!("{scheme}://{host}:{port}/{resource}")
}

/// Rewrite the host part of a device URI, keeping everything else.
///
/// Used by the broadcaster to substitute the interface address for
/// `localhost` in per-interface packets.
pub fn with_host(uri: &str, new_host: &str) -> Option<String> {
    let (scheme, _, port, resource) = split(uri)?;
    Some(assemble(&scheme, new_host, port, &resource))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_full_uri() {
        let (scheme, host, port, resource) =
            split("ipp://printer.local:631/printers/hplj").unwrap();
        assert_eq!(scheme, "ipp");
        assert_eq!(host, "printer.local");
        assert_eq!(port, 631);
        assert_eq!(resource, "printers/hplj");
    }

    #[test]
    fn default_port_and_empty_resource() {
        let (_, host, port, resource) = split("ipp://printer.local").unwrap();
        assert_eq!(host, "printer.local");
        assert_eq!(port, 631);
        assert_eq!(resource, "");
    }

    #[test]
    fn strips_query_string() {
        let (_, _, _, resource) = split("ipp://h:631/printers/a?waitjob=false").unwrap();
        assert_eq!(resource, "printers/a");
    }

    #[test]
    fn rejects_garbage() {
        assert!(split("not a uri").is_none());
        assert!(split("://missing-scheme/x").is_none());
        assert!(split("ipp:///printers/x").is_none());
    }

    #[test]
    fn host_substitution() {
        let uri = with_host("ipp://localhost:631/printers/laser", "10.0.0.4").unwrap();
        assert_eq!(uri, "ipp://10.0.0.4:631/printers/laser");
    }

    #[test]
    fn round_trips_through_assemble() {
        let uri = assemble("ipps", "host", 631, "printers/a");
        let (scheme, host, port, resource) = split(&uri).unwrap();
        assert_eq!(assemble(&scheme, &host, port, &resource), uri);
    }
}
