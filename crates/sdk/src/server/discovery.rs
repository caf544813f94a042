//! Parsing of the discovery endpoint's server list.
//!
//! The endpoint answers `GET /xgrpc/serverlist` with one `host[:port]` entry
//! per line.

use std::borrow::Cow;

use tracing::warn;

use super::ServerDescriptor;
use crate::config::DEFAULT_SERVER_PORT;

/// Path of the server list on the discovery endpoint.
pub const SERVER_LIST_PATH: &str = "/xgrpc/serverlist";

/// Returns the URL serving the server list for `endpoint` (`host:port`).
#[must_use]
pub fn server_list_url(endpoint: &str) -> String {
    format!("http://{endpoint}{SERVER_LIST_PATH}")
}

/// Parses a newline-delimited server list.
///
/// Entries are `[scheme://]host[:port]`. IPv6 hosts are accepted bracketed
/// (`[::1]:9000`) or bare, in which case they take the default port. Blank
/// lines are ignored. An absent port defaults to 8848. Lines whose port does
/// not parse are skipped with a warning; they never abort the parse.
#[must_use]
pub fn parse_server_list(body: &str, scheme: &str, context_path: &str) -> Vec<ServerDescriptor> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let Some((host, port)) = split_host_port(line) else {
                warn!(line, "skipping server list entry with unterminated IPv6 host");
                return None;
            };
            let port = match port {
                Some(port) => match port.trim().parse::<u16>() {
                    Ok(port) if port > 0 => port,
                    _ => {
                        warn!(line, "skipping server list entry with malformed port");
                        return None;
                    },
                },
                None => DEFAULT_SERVER_PORT,
            };
            let bare_host = host.split_once("://").map_or(&*host, |(_, rest)| rest);
            if bare_host.trim().is_empty() {
                warn!(line, "skipping server list entry without host");
                return None;
            }
            Some(
                ServerDescriptor::new(host, port)
                    .with_scheme(scheme)
                    .with_context_path(context_path),
            )
        })
        .collect()
}

/// Splits an entry into its host, scheme prefix included, and port text.
///
/// A bare IPv6 address comes back bracketed with no port. Returns `None` for
/// a `[` without its closing `]`.
fn split_host_port(line: &str) -> Option<(Cow<'_, str>, Option<&str>)> {
    let authority_start = line.find("://").map_or(0, |i| i + 3);
    let authority = &line[authority_start..];

    if let Some(bracketed) = authority.strip_prefix('[') {
        let host_end = authority_start + bracketed.find(']')? + 2;
        let tail = &line[host_end..];
        let port = (!tail.is_empty()).then(|| tail.strip_prefix(':').unwrap_or(tail));
        return Some((Cow::Borrowed(&line[..host_end]), port));
    }

    match authority.matches(':').count() {
        0 => Some((Cow::Borrowed(line), None)),
        1 => line.rsplit_once(':').map(|(host, port)| (Cow::Borrowed(host), Some(port))),
        _ => Some((Cow::Owned(format!("{}[{authority}]", &line[..authority_start])), None)),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn parses_entries_with_and_without_port() {
        let servers = parse_server_list("10.0.0.1:9000\n10.0.0.2\n", "http", "/xgrpc");
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].host(), "10.0.0.1");
        assert_eq!(servers[0].port(), 9000);
        assert_eq!(servers[1].host(), "10.0.0.2");
        assert_eq!(servers[1].port(), 8848);
    }

    #[test]
    fn malformed_port_line_is_skipped() {
        let servers = parse_server_list("10.0.0.1:abc\n10.0.0.2:8850\n", "http", "/xgrpc");
        assert_eq!(servers, vec![ServerDescriptor::new("10.0.0.2", 8850)]);
    }

    #[test]
    fn blank_and_whitespace_lines_are_ignored() {
        let servers = parse_server_list("\n  10.0.0.1:8848  \r\n\n", "http", "/xgrpc");
        assert_eq!(servers, vec![ServerDescriptor::new("10.0.0.1", 8848)]);
    }

    #[test]
    fn applies_scheme_and_context_path() {
        let servers = parse_server_list("a.example.io", "https", "/ctx");
        assert_eq!(servers[0].address(), "https://a.example.io:8848");
        assert_eq!(servers[0].context_path(), "/ctx");
    }

    #[test]
    fn scheme_prefixed_entry_keeps_its_port() {
        let body = "http://10.0.0.1:9000\nhttps://a.example.io\n";
        let servers = parse_server_list(body, "http", "/xgrpc");
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].host(), "http://10.0.0.1");
        assert_eq!(servers[0].port(), 9000);
        assert_eq!(servers[0].address(), "http://10.0.0.1:9000");
        assert_eq!(servers[1].host(), "https://a.example.io");
        assert_eq!(servers[1].port(), 8848);
    }

    #[test]
    fn ipv6_entries_are_kept() {
        let body = "[fe80::1]:9000\n::1\n[2001:db8::7]\nhttp://[::1]:8850\n";
        let servers = parse_server_list(body, "http", "/xgrpc");
        let parsed: Vec<_> = servers.iter().map(|s| (s.host(), s.port())).collect();
        assert_eq!(
            parsed,
            vec![
                ("[fe80::1]", 9000),
                ("[::1]", 8848),
                ("[2001:db8::7]", 8848),
                ("http://[::1]", 8850),
            ]
        );
        assert_eq!(servers[0].address(), "http://[fe80::1]:9000");
    }

    #[test]
    fn malformed_ipv6_entries_are_skipped() {
        let body = "[fe80::1\n[fe80::1]:\n[fe80::1]x\n[::2]:8848\n";
        let servers = parse_server_list(body, "http", "/xgrpc");
        assert_eq!(servers, vec![ServerDescriptor::new("[::2]", 8848)]);
    }

    #[test]
    fn server_list_url_format() {
        assert_eq!(server_list_url("disc.local:8080"), "http://disc.local:8080/xgrpc/serverlist");
    }

    proptest! {
        #[test]
        fn every_well_formed_line_is_kept(
            entries in xgrpc_test_utils::strategies::arb_server_entries(1..16)
        ) {
            let body: String = entries.iter().map(|(h, p)| format!("{h}:{p}\n")).collect();
            let servers = parse_server_list(&body, "http", "/xgrpc");
            prop_assert_eq!(servers.len(), entries.len());
            for (server, (host, port)) in servers.iter().zip(entries.iter()) {
                prop_assert_eq!(server.host(), host.as_str());
                prop_assert_eq!(server.port(), *port);
            }
        }

        #[test]
        fn parse_never_panics(body in ".{0,256}") {
            let _ = parse_server_list(&body, "http", "/xgrpc");
        }
    }
}
