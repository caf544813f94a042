//! Proptest strategies for server addressing.
//!
//! # Usage
//!
//! ```no_run
//! use proptest::prelude::*;
//! use xgrpc_test_utils::strategies;
//!
//! proptest! {
//!     #[test]
//!     fn my_property(entries in strategies::arb_server_entries(1..8)) {
//!         prop_assert!(!entries.is_empty());
//!     }
//! }
//! ```

use std::ops::Range;

use proptest::prelude::*;

/// Generates a hostname: a DNS-style name or a dotted IPv4 address.
///
/// Never contains `:` or whitespace, so `host:port` strings split unambiguously.
pub fn arb_host() -> impl Strategy<Value = String> {
    prop_oneof![
        "[a-z][a-z0-9-]{0,15}(\\.[a-z][a-z0-9]{0,7}){0,2}",
        (any::<u8>(), any::<u8>(), any::<u8>(), any::<u8>())
            .prop_map(|(a, b, c, d)| format!("{a}.{b}.{c}.{d}")),
    ]
}

/// Generates a non-zero TCP port.
pub fn arb_port() -> impl Strategy<Value = u16> {
    1..=u16::MAX
}

/// Generates `count` `(host, port)` pairs.
pub fn arb_server_entries(count: Range<usize>) -> impl Strategy<Value = Vec<(String, u16)>> {
    proptest::collection::vec((arb_host(), arb_port()), count)
}

/// Generates connection labels: small string maps with short keys and values.
pub fn arb_labels() -> impl Strategy<Value = std::collections::HashMap<String, String>> {
    proptest::collection::hash_map("[a-zA-Z][a-zA-Z0-9_]{0,11}", "[a-zA-Z0-9_.-]{0,16}", 0..6)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn hosts_have_no_separators(host in arb_host()) {
            prop_assert!(!host.is_empty());
            prop_assert!(!host.contains(':'));
            prop_assert!(!host.chars().any(char::is_whitespace));
        }

        #[test]
        fn entries_respect_count(entries in arb_server_entries(2..5)) {
            prop_assert!((2..5).contains(&entries.len()));
            prop_assert!(entries.iter().all(|(_, port)| *port > 0));
        }
    }
}
