//! Loopback port negotiation for the companion server.

use std::net::{Ipv4Addr, Ipv6Addr, TcpListener};

use tracing::{info, warn};

/// The four loopback ports handed to the companion server on launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortSet {
    pub debug: u16,
    pub control: u16,
    pub agent: u16,
    pub extension: u16,
}

/// How many consecutive candidates to probe before falling back.
const MAX_PORT_ATTEMPTS: u16 = 100;

/// Highest well-known port; binding below this needs elevated privileges.
const WELL_KNOWN_PORT_MAX: u16 = 1023;

/// Ports above the well-known range that the HTTP scheme refuses because
/// they belong to other system services.
const RESTRICTED_PORTS: &[u16] = &[
    1719, 1720, 1723, 2049, 3659, 4045, 4190, 5060, 5061, 6000, 6566, 6665, 6666, 6667, 6668,
    6669, 6679, 6697, 10080,
];

/// Pick a free, policy-compliant port starting from `preferred`.
///
/// Scans up to [`MAX_PORT_ATTEMPTS`] consecutive candidates and returns the
/// first one that passes [`port_allowed`] and binds on both loopback
/// stacks. Falls back to `preferred` unchanged when nothing in the window
/// qualifies so startup is never blocked on port pressure.
pub fn resolve_port(preferred: u16) -> u16 {
    resolve_port_with(preferred, port_is_free)
}

/// Same scan with an injectable availability probe.
pub fn resolve_port_with(preferred: u16, mut probe: impl FnMut(u16) -> bool) -> u16 {
    for offset in 0..MAX_PORT_ATTEMPTS {
        let Some(candidate) = preferred.checked_add(offset) else {
            break;
        };
        if !port_allowed(candidate) || !probe(candidate) {
            continue;
        }
        if candidate != preferred {
            info!(preferred, candidate, "preferred port in use, picked fallback");
        }
        return candidate;
    }

    warn!(
        preferred,
        attempts = MAX_PORT_ATTEMPTS,
        "no available port in scan window, using preferred port anyway"
    );
    preferred
}

/// Policy check: nonzero, outside the well-known range, not restricted.
pub fn port_allowed(port: u16) -> bool {
    port > WELL_KNOWN_PORT_MAX && !RESTRICTED_PORTS.contains(&port)
}

/// Whether binding below the well-known cutoff.
pub fn is_well_known(port: u16) -> bool {
    port <= WELL_KNOWN_PORT_MAX
}

/// A port counts as free only when both loopback stacks accept a bind, so a
/// dual-stack companion never ends up half-reachable. The probe sockets are
/// dropped immediately; nothing reserves the port, so another process can
/// still claim it between the probe and the real bind.
fn port_is_free(port: u16) -> bool {
    if TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_err() {
        return false;
    }
    TcpListener::bind((Ipv6Addr::LOCALHOST, port)).is_ok()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn free_except(occupied: &[u16]) -> impl FnMut(u16) -> bool + '_ {
        let occupied: HashSet<u16> = occupied.iter().copied().collect();
        move |port| !occupied.contains(&port)
    }

    #[test]
    fn returns_preferred_when_free() {
        assert_eq!(resolve_port_with(9001, free_except(&[])), 9001);
    }

    #[test]
    fn returns_lowest_free_candidate_above_preferred() {
        assert_eq!(resolve_port_with(9001, free_except(&[9001, 9002])), 9003);
    }

    #[test]
    fn falls_back_to_preferred_when_window_exhausted() {
        let occupied: Vec<u16> = (9001..9200).collect();
        assert_eq!(resolve_port_with(9001, free_except(&occupied)), 9001);
    }

    #[test]
    fn skips_restricted_ports() {
        // 10080 is restricted for the http scheme; the scan must step over it.
        assert_eq!(resolve_port_with(10080, free_except(&[])), 10081);
    }

    #[test]
    fn skips_well_known_ports() {
        assert_eq!(resolve_port_with(1000, free_except(&[])), 1024);
    }

    #[test]
    fn clamps_scan_at_max_port() {
        let occupied: Vec<u16> = (65530..=65535).collect();
        assert_eq!(resolve_port_with(65530, free_except(&occupied)), 65530);
    }

    #[test]
    fn probe_is_not_called_for_disallowed_ports() {
        let mut probed = Vec::new();
        resolve_port_with(1022, |port| {
            probed.push(port);
            true
        });
        assert_eq!(probed, vec![1024]);
    }
}
