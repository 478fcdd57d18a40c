//! Frames sent before connect queue in order, take serials 0,1,... and
//! flush to the wire once Connected; a single ack covering the run settles
//! every awaiter.
//!
//! Uses an inline scripted server so the ack can cover both frames at once.

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use rtlink_client::{ClientOptions, Connection};
use rtlink_protocol::{
    Action, ChannelMessage, Format, ProtocolMessage, decode, encode,
};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::protocol::Message;

fn payload(name: &str) -> ProtocolMessage {
    ProtocolMessage::message(
        "race-updates",
        ChannelMessage {
            name: Some(name.to_owned()),
            ..ChannelMessage::default()
        },
    )
}

async fn send_json(
    ws: &mut (impl Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    frame: &ProtocolMessage,
) {
    let text = String::from_utf8(encode(frame, Format::Json).unwrap()).unwrap();
    ws.send(Message::Text(text.into())).await.unwrap();
}

async fn recv_frame(
    ws: &mut (impl Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin),
) -> ProtocolMessage {
    loop {
        match ws.next().await.expect("stream open").expect("ws ok") {
            Message::Text(t) => return decode(t.as_bytes(), Format::Json).unwrap(),
            Message::Close(_) => panic!("unexpected close"),
            _ => continue,
        }
    }
}

#[tokio::test]
async fn queued_sends_flush_in_order_with_contiguous_serials() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        let connected = ProtocolMessage {
            action: Action::Connected,
            connection_id: Some("conn-1".to_owned()),
            connection_key: Some("key-1".to_owned()),
            connection_serial: Some(-1),
            ..ProtocolMessage::default()
        };
        send_json(&mut ws, &connected).await;

        // Both queued frames must arrive, in order, serials 0 then 1.
        let m1 = recv_frame(&mut ws).await;
        assert_eq!(m1.msg_serial, Some(0));
        assert_eq!(m1.messages.as_ref().unwrap()[0].name.as_deref(), Some("m1"));
        let m2 = recv_frame(&mut ws).await;
        assert_eq!(m2.msg_serial, Some(1));
        assert_eq!(m2.messages.as_ref().unwrap()[0].name.as_deref(), Some("m2"));

        // One ack covering the whole run.
        send_json(&mut ws, &ProtocolMessage::ack(0, 2)).await;

        // Hold the connection open until the client is done.
        while let Some(msg) = ws.next().await {
            if matches!(msg, Ok(Message::Close(_)) | Err(_)) {
                break;
            }
        }
    });

    let mut opts = ClientOptions::with_key("app.key:secret");
    opts.realtime_host = Some("127.0.0.1".to_owned());
    opts.port = Some(addr.port());
    opts.tls = false;
    let conn = Connection::new(opts).unwrap();

    // Queue while still Initialized; yield after each spawn so the send
    // commands enqueue in order before the connect.
    let c1 = conn.clone();
    let send1 = tokio::spawn(async move { c1.send(payload("m1")).await });
    tokio::task::yield_now().await;
    let c2 = conn.clone();
    let send2 = tokio::spawn(async move { c2.send(payload("m2")).await });
    tokio::task::yield_now().await;

    conn.connect().await.expect("connect");

    send1.await.unwrap().expect("m1 acked");
    send2.await.unwrap().expect("m2 acked");

    drop(conn);
    server.await.unwrap();
}
