//! Close deadline: a server that swallows the Close frame cannot hold the
//! client in Closing forever.

use rtlink_client::{ClientOptions, Connection, ConnectionState};
use rtlink_test_utils::{MockRealtimeServer, ServerBehavior};
use std::time::{Duration, Instant};

#[tokio::test]
async fn close_forces_closed_after_the_deadline() {
    let behavior = ServerBehavior {
        swallow_close: true,
        ..ServerBehavior::default()
    };
    let server = MockRealtimeServer::start_with(behavior).await.unwrap();

    let mut opts = ClientOptions::with_key("app.key:secret");
    opts.realtime_host = Some("127.0.0.1".to_owned());
    opts.port = Some(server.local_addr().port());
    opts.tls = false;
    opts.realtime_request_timeout = Duration::from_millis(150);
    let conn = Connection::new(opts).unwrap();

    conn.connect().await.expect("connect");

    let started = Instant::now();
    conn.close().await.expect("close resolves on deadline");
    assert!(
        started.elapsed() >= Duration::from_millis(150),
        "close resolved before the deadline"
    );
    assert_eq!(conn.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn close_passes_through_closing_state() {
    let behavior = ServerBehavior {
        swallow_close: true,
        ..ServerBehavior::default()
    };
    let server = MockRealtimeServer::start_with(behavior).await.unwrap();

    let mut opts = ClientOptions::with_key("app.key:secret");
    opts.realtime_host = Some("127.0.0.1".to_owned());
    opts.port = Some(server.local_addr().port());
    opts.tls = false;
    opts.realtime_request_timeout = Duration::from_millis(100);
    let conn = Connection::new(opts).unwrap();
    conn.connect().await.expect("connect");

    let mut events = conn.state_changes();
    let closer = conn.clone();
    let close = tokio::spawn(async move { closer.close().await });

    let first = events.recv().await.unwrap();
    assert_eq!(first.current, ConnectionState::Closing);
    let second = events.recv().await.unwrap();
    assert_eq!(second.current, ConnectionState::Closed);

    close.await.unwrap().expect("close");
}
