//! Endpoint selection: primary host, environment routing, fallback pool.
//!
//! The fallback pool exists only for the default production endpoint.  A
//! custom `realtime_host` or a non-default `environment` pins the client to
//! that endpoint; such configurations never use fallbacks.

use rand::seq::SliceRandom;

use crate::options::ClientOptions;

pub const DEFAULT_DOMAIN: &str = "rtlink.io";

/// Labeled alternates under the public domain, tried after repeated retries
/// against the primary host fail.
pub const FALLBACK_HOSTS: [&str; 5] = [
    "a.fallback.rtlink.io",
    "b.fallback.rtlink.io",
    "c.fallback.rtlink.io",
    "d.fallback.rtlink.io",
    "e.fallback.rtlink.io",
];

/// The host choice for the next transport open.
///
/// Cycles through the fallback pool in shuffled order; the permutation is
/// stable until the pool wraps, then reshuffled.
#[derive(Debug)]
pub struct HostCursor {
    primary: String,
    port: u16,
    tls: bool,
    shuffled: Vec<String>,
    next_idx: usize,
}

impl HostCursor {
    pub fn from_options(opts: &ClientOptions) -> Self {
        let (primary, fallbacks) = match (&opts.realtime_host, &opts.environment) {
            (Some(host), _) => (host.clone(), Vec::new()),
            (None, Some(env)) => (format!("{env}-realtime.{DEFAULT_DOMAIN}"), Vec::new()),
            (None, None) => (
                format!("realtime.{DEFAULT_DOMAIN}"),
                FALLBACK_HOSTS.iter().map(|h| (*h).to_owned()).collect(),
            ),
        };
        let mut shuffled = fallbacks;
        shuffled.shuffle(&mut rand::thread_rng());
        HostCursor {
            primary,
            port: opts.port.unwrap_or(if opts.tls { 443 } else { 80 }),
            tls: opts.tls,
            shuffled,
            next_idx: 0,
        }
    }

    pub fn primary(&self) -> &str {
        &self.primary
    }

    pub fn has_fallbacks(&self) -> bool {
        !self.shuffled.is_empty()
    }

    /// The next fallback host in shuffled order.
    ///
    /// Callers must check [`HostCursor::has_fallbacks`] first; custom-host
    /// configurations have an empty pool.
    pub fn next_fallback(&mut self) -> String {
        if self.next_idx >= self.shuffled.len() {
            self.shuffled.shuffle(&mut rand::thread_rng());
            self.next_idx = 0;
        }
        let host = self.shuffled[self.next_idx].clone();
        self.next_idx += 1;
        host
    }

    /// WebSocket URL prefix for `host`, without query parameters.
    pub fn base_url(&self, host: &str) -> String {
        let scheme = if self.tls { "wss" } else { "ws" };
        format!("{scheme}://{host}:{}", self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_use_primary_with_fallback_pool() {
        let cursor = HostCursor::from_options(&ClientOptions::with_key("k"));
        assert_eq!(cursor.primary(), "realtime.rtlink.io");
        assert!(cursor.has_fallbacks());
        assert_eq!(cursor.base_url("realtime.rtlink.io"), "wss://realtime.rtlink.io:443");
    }

    #[test]
    fn environment_routes_to_named_deployment_without_fallbacks() {
        let mut opts = ClientOptions::with_key("k");
        opts.environment = Some("sandbox".to_owned());
        let cursor = HostCursor::from_options(&opts);
        assert_eq!(cursor.primary(), "sandbox-realtime.rtlink.io");
        assert!(!cursor.has_fallbacks());
    }

    #[test]
    fn custom_host_disables_fallbacks() {
        let mut opts = ClientOptions::with_key("k");
        opts.realtime_host = Some("realtime.example.com".to_owned());
        opts.tls = false;
        opts.port = Some(8080);
        let cursor = HostCursor::from_options(&opts);
        assert_eq!(cursor.primary(), "realtime.example.com");
        assert!(!cursor.has_fallbacks());
        assert_eq!(
            cursor.base_url("realtime.example.com"),
            "ws://realtime.example.com:8080"
        );
    }

    #[test]
    fn fallback_cursor_cycles_the_whole_pool() {
        let mut cursor = HostCursor::from_options(&ClientOptions::with_key("k"));
        let mut seen: Vec<String> = (0..FALLBACK_HOSTS.len())
            .map(|_| cursor.next_fallback())
            .collect();
        seen.sort();
        let mut expected: Vec<String> = FALLBACK_HOSTS.iter().map(|h| (*h).to_owned()).collect();
        expected.sort();
        assert_eq!(seen, expected, "one full cycle visits every fallback once");
    }

    #[test]
    fn plain_tcp_defaults_to_port_80() {
        let mut opts = ClientOptions::with_key("k");
        opts.tls = false;
        let cursor = HostCursor::from_options(&opts);
        assert_eq!(cursor.base_url("realtime.rtlink.io"), "ws://realtime.rtlink.io:80");
    }
}
