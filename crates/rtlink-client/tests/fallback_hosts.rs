//! Fallback host selection: the default endpoint falls back to the public
//! pool after a failed retry, while custom environments always pin to
//! their primary host.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rtlink_client::hosts::FALLBACK_HOSTS;
use rtlink_client::transport::{Connector, WsStream};
use rtlink_client::{ClientOptions, Connection, Error};
use rtlink_test_utils::MockRealtimeServer;

/// Routes every host at the mock server, recording which host each attempt
/// asked for, and failing the first N attempts outright.
struct RecordingConnector {
    target: String,
    hosts: Arc<Mutex<Vec<String>>>,
    fail_remaining: AtomicUsize,
}

impl RecordingConnector {
    fn new(server: &MockRealtimeServer, fail_first: usize) -> Self {
        RecordingConnector {
            target: format!("ws://{}", server.local_addr()),
            hosts: Arc::new(Mutex::new(Vec::new())),
            fail_remaining: AtomicUsize::new(fail_first),
        }
    }

    fn hosts(&self) -> Vec<String> {
        self.hosts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for RecordingConnector {
    async fn connect(&self, url: &str) -> Result<WsStream, Error> {
        let after_scheme = url.split_once("//").map_or(url, |(_, rest)| rest);
        let host = after_scheme
            .split([':', '/'])
            .next()
            .unwrap_or(after_scheme)
            .to_owned();
        self.hosts.lock().unwrap().push(host);

        if self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Connection("connection refused".to_owned()));
        }

        let rewritten = match url.split_once("/?") {
            Some((_, query)) => format!("{}/?{}", self.target, query),
            None => self.target.clone(),
        };
        let (ws, _) = tokio_tungstenite::connect_async(&rewritten)
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;
        Ok(ws)
    }
}

fn base_opts() -> ClientOptions {
    let mut opts = ClientOptions::with_key("app.key:secret");
    opts.tls = false;
    opts.disconnected_retry_timeout = Duration::from_millis(30);
    opts.suspended_retry_timeout = Duration::from_millis(30);
    opts.suspend_after_attempts = 10;
    opts
}

#[tokio::test]
async fn third_attempt_uses_a_fallback_host() {
    let server = MockRealtimeServer::start().await.unwrap();
    let connector = Arc::new(RecordingConnector::new(&server, 2));
    let conn =
        Connection::with_connector(base_opts(), Arc::clone(&connector) as Arc<dyn Connector>)
            .unwrap();

    conn.connect().await.expect("connect via fallback");

    let hosts = connector.hosts();
    assert_eq!(hosts.len(), 3);
    assert_eq!(hosts[0], "realtime.rtlink.io");
    // First retry of the disconnected state still targets the primary.
    assert_eq!(hosts[1], "realtime.rtlink.io");
    assert!(
        FALLBACK_HOSTS.contains(&hosts[2].as_str()),
        "third attempt must use the fallback pool, got {}",
        hosts[2]
    );
}

#[tokio::test]
async fn custom_environment_never_uses_fallbacks() {
    let server = MockRealtimeServer::start().await.unwrap();
    let connector = Arc::new(RecordingConnector::new(&server, 2));
    let mut opts = base_opts();
    opts.environment = Some("sandbox".to_owned());
    let conn =
        Connection::with_connector(opts, Arc::clone(&connector) as Arc<dyn Connector>).unwrap();

    conn.connect().await.expect("connect");

    let hosts = connector.hosts();
    assert_eq!(hosts.len(), 3);
    assert!(
        hosts.iter().all(|h| h == "sandbox-realtime.rtlink.io"),
        "every attempt must pin to the environment host, got {hosts:?}"
    );
}
