//! A server that advertises `max_idle_interval` and then goes silent is
//! treated as lost once the watchdog fires.

use rtlink_client::{ClientOptions, Connection, ConnectionState};
use rtlink_protocol::error_codes;
use rtlink_test_utils::{MockRealtimeServer, ServerBehavior};
use std::time::Duration;

#[tokio::test]
async fn silent_server_trips_the_idle_watchdog() {
    let behavior = ServerBehavior {
        max_idle_interval: Some(50),
        ..ServerBehavior::default()
    };
    let server = MockRealtimeServer::start_with(behavior).await.unwrap();

    let mut opts = ClientOptions::with_key("app.key:secret");
    opts.realtime_host = Some("127.0.0.1".to_owned());
    opts.port = Some(server.local_addr().port());
    opts.tls = false;
    opts.realtime_request_timeout = Duration::from_millis(100);
    // Keep the reconnect far away so the test observes the Disconnected gap.
    opts.disconnected_retry_timeout = Duration::from_secs(30);
    let conn = Connection::new(opts).unwrap();

    conn.connect().await.expect("connect");
    let mut events = conn.state_changes();

    let change = events.recv().await.unwrap();
    assert_eq!(change.previous, ConnectionState::Connected);
    assert_eq!(change.current, ConnectionState::Disconnected);
    let info = change.error.expect("watchdog attaches an error");
    assert_eq!(info.code, error_codes::TIMEOUT);
}
