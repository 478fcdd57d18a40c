// mock_server: A mock realtime endpoint for testing the connection client.
//
// Accepts WebSocket connections on 127.0.0.1:<port>, captures each
// connection's handshake query parameters, greets with a Connected frame,
// and acks ack-required frames per the configured behavior.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use futures_util::{Sink, SinkExt, StreamExt};
use rtlink_protocol::{
    Action, ConnectionDetails, ErrorInfo, Format, ProtocolMessage, decode, encode,
};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::Message;

// ---------------------------------------------------------------------------
// Behavior
// ---------------------------------------------------------------------------

/// Scripted per-connection behavior.
#[derive(Debug, Clone)]
pub struct ServerBehavior {
    /// Fixed connection id; `None` generates a fresh UUID per connection
    /// (so resume attempts look like a new session).
    pub connection_id: Option<String>,
    /// Fixed connection key; `None` generates one per connection.
    pub connection_key: Option<String>,
    /// Warning attached to the Connected frame (e.g. resume rejection).
    pub connected_error: Option<ErrorInfo>,
    /// Send this Error frame instead of Connected and stop serving.
    pub reject_with: Option<ErrorInfo>,
    /// Ack ack-required frames as they arrive.
    pub auto_ack: bool,
    /// Only ack the first N ack-required frames, then go quiet.
    pub ack_limit: Option<usize>,
    /// Answer inbound Heartbeat frames with a Heartbeat.
    pub echo_heartbeats: bool,
    /// Ignore Close frames entirely (never reply Closed).
    pub swallow_close: bool,
    /// Drop the connection after receiving this many protocol frames.
    pub drop_after_frames: Option<usize>,
    /// Advertised `max_idle_interval` in the Connected frame, ms.
    pub max_idle_interval: Option<u64>,
}

impl Default for ServerBehavior {
    fn default() -> Self {
        ServerBehavior {
            connection_id: None,
            connection_key: None,
            connected_error: None,
            reject_with: None,
            auto_ack: true,
            ack_limit: None,
            echo_heartbeats: true,
            swallow_close: false,
            drop_after_frames: None,
            max_idle_interval: None,
        }
    }
}

// ---------------------------------------------------------------------------
// ConnectionRecord
// ---------------------------------------------------------------------------

/// What the server observed on one client connection.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRecord {
    /// Handshake query parameters, e.g. `resume`, `recover`, `key`.
    pub query: HashMap<String, String>,
    /// Protocol frames received from the client, in arrival order.
    pub frames: Vec<ProtocolMessage>,
}

// ---------------------------------------------------------------------------
// MockRealtimeServer
// ---------------------------------------------------------------------------

/// A mock realtime endpoint for integration testing.
///
/// Binds to port 0 (random) and exposes the actual bound port.  Each test
/// spins up its own isolated instance.
///
/// # Protocol behavior
///
/// - Every accepted connection is greeted with a `Connected` frame carrying
///   a connection id, key, and serial (echoing the client's resume position
///   when a `resume` parameter is present).
/// - Ack-required frames are answered with `Ack{msg_serial, count: 1}`
///   while `auto_ack` allows; `Close` is answered with `Closed` unless
///   `swallow_close` is set.
pub struct MockRealtimeServer {
    addr: SocketAddr,
    records: Arc<Mutex<Vec<ConnectionRecord>>>,
    /// Handle to the background accept loop; dropped with the server.
    _task: tokio::task::JoinHandle<()>,
}

impl MockRealtimeServer {
    /// Start with default behavior: greet, auto-ack, echo heartbeats.
    pub async fn start() -> Result<Self, Box<dyn std::error::Error>> {
        Self::start_with(ServerBehavior::default()).await
    }

    /// Start with scripted behavior.
    pub async fn start_with(behavior: ServerBehavior) -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let records: Arc<Mutex<Vec<ConnectionRecord>>> = Arc::new(Mutex::new(Vec::new()));

        let task = {
            let records = Arc::clone(&records);
            tokio::spawn(async move {
                Self::accept_loop(listener, behavior, records).await;
            })
        };

        Ok(Self {
            addr,
            records,
            _task: task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Snapshot of every connection observed so far.
    pub fn connections(&self) -> Vec<ConnectionRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn connection_count(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    // -- internal --

    async fn accept_loop(
        listener: TcpListener,
        behavior: ServerBehavior,
        records: Arc<Mutex<Vec<ConnectionRecord>>>,
    ) {
        loop {
            match listener.accept().await {
                Ok((stream, _peer)) => {
                    let behavior = behavior.clone();
                    let records = Arc::clone(&records);
                    tokio::spawn(async move {
                        // Client drops are routine in tests; swallow errors.
                        let _ = Self::handle_connection(stream, behavior, records).await;
                    });
                }
                Err(_) => break,
            }
        }
    }

    async fn handle_connection(
        stream: tokio::net::TcpStream,
        behavior: ServerBehavior,
        records: Arc<Mutex<Vec<ConnectionRecord>>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        // Capture the handshake query string during the upgrade.
        let query: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let capture = Arc::clone(&query);
        let callback = move |req: &Request, resp: Response| {
            *capture.lock().unwrap() = req.uri().query().map(str::to_owned);
            Ok(resp)
        };
        let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback).await?;

        let query = parse_query(query.lock().unwrap().as_deref().unwrap_or(""));
        let reply_format = match query.get("format").map(String::as_str) {
            Some("msgpack") => Format::MsgPack,
            _ => Format::Json,
        };
        let record_idx = {
            let mut records = records.lock().unwrap();
            records.push(ConnectionRecord {
                query: query.clone(),
                frames: Vec::new(),
            });
            records.len() - 1
        };

        if let Some(error) = behavior.reject_with.clone() {
            let mut frame = ProtocolMessage::new(Action::Error);
            frame.error = Some(error);
            send_frame(&mut ws, &frame, reply_format).await?;
            // Leave the socket open so the client can read the error.
            while let Some(msg) = ws.next().await {
                if matches!(msg, Ok(Message::Close(_)) | Err(_)) {
                    break;
                }
            }
            return Ok(());
        }

        // Greet with Connected.  On resume, echo the client's serial so its
        // cursor does not regress; otherwise start at -1.
        let connection_serial = match query.get("resume") {
            Some(_) => query
                .get("connection_serial")
                .and_then(|s| s.parse().ok())
                .unwrap_or(-1),
            None => -1,
        };
        let connected = ProtocolMessage {
            action: Action::Connected,
            connection_id: Some(
                behavior
                    .connection_id
                    .clone()
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            ),
            connection_key: Some(
                behavior
                    .connection_key
                    .clone()
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            ),
            connection_serial: Some(connection_serial),
            connection_details: Some(ConnectionDetails {
                max_idle_interval: behavior.max_idle_interval,
                ..ConnectionDetails::default()
            }),
            error: behavior.connected_error.clone(),
            ..ProtocolMessage::default()
        };
        send_frame(&mut ws, &connected, reply_format).await?;

        let mut frames_seen = 0usize;
        let mut acked = 0usize;
        while let Some(msg_result) = ws.next().await {
            let frame = match msg_result? {
                Message::Text(t) => decode(t.as_bytes(), Format::Json)?,
                Message::Binary(b) => decode(&b, Format::MsgPack)?,
                Message::Ping(data) => {
                    ws.send(Message::Pong(data)).await?;
                    continue;
                }
                Message::Close(_) => break,
                _ => continue,
            };
            records.lock().unwrap()[record_idx].frames.push(frame.clone());
            frames_seen += 1;

            if frame.action == Action::Close {
                if behavior.swallow_close {
                    continue;
                }
                send_frame(&mut ws, &ProtocolMessage::new(Action::Closed), reply_format).await?;
                break;
            }
            if frame.action == Action::Heartbeat && behavior.echo_heartbeats {
                send_frame(&mut ws, &ProtocolMessage::heartbeat(), reply_format).await?;
            }
            if frame.ack_required()
                && behavior.auto_ack
                && behavior.ack_limit.is_none_or(|limit| acked < limit)
            {
                if let Some(serial) = frame.msg_serial {
                    send_frame(&mut ws, &ProtocolMessage::ack(serial, 1), reply_format).await?;
                    acked += 1;
                }
            }
            if behavior
                .drop_after_frames
                .is_some_and(|n| frames_seen >= n)
            {
                // Abrupt drop: no close handshake.
                return Ok(());
            }
        }

        Ok(())
    }
}

async fn send_frame<S>(
    ws: &mut S,
    frame: &ProtocolMessage,
    format: Format,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let bytes = encode(frame, format)?;
    let msg = match format {
        Format::Json => Message::Text(String::from_utf8(bytes)?.into()),
        Format::MsgPack => Message::Binary(bytes.into()),
    };
    ws.send(msg).await?;
    Ok(())
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.to_owned(), v.to_owned()))
        })
        .collect()
}
