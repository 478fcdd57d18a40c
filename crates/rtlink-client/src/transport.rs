//! Transport adapter: a WebSocket stream carrying protocol frames.
//!
//! The connection manager owns at most one stream at a time and is the only
//! component that opens or drops them.  The [`Connector`] seam exists so
//! tests can route any host to a loopback server; production uses
//! [`WsConnector`].

use async_trait::async_trait;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::error::{Error, Result};
use rtlink_protocol::{Format, ProtocolMessage, decode, encode};

pub type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Opens a frame stream to a fully-formed endpoint URL.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<WsStream>;
}

/// Production connector: plain `connect_async` against the given URL.
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<WsStream> {
        let (ws, _response) = connect_async(url)
            .await
            .map_err(|e| Error::Connection(format!("{url}: {e}")))?;
        Ok(ws)
    }
}

/// Compose the handshake URL from a `wss://host:port` prefix and query
/// parameters.
pub(crate) fn build_url(base: &str, params: &[(String, String)]) -> String {
    let mut url = format!("{base}/");
    for (i, (k, v)) in params.iter().enumerate() {
        url.push(if i == 0 { '?' } else { '&' });
        url.push_str(k);
        url.push('=');
        url.push_str(v);
    }
    url
}

/// Encode one protocol frame as a WebSocket message: JSON travels as text,
/// MessagePack as binary.
pub(crate) fn encode_frame(msg: &ProtocolMessage, format: Format) -> Result<Message> {
    let bytes = encode(msg, format)?;
    Ok(match format {
        Format::Json => Message::Text(
            String::from_utf8(bytes)
                .map_err(|e| Error::Connection(format!("non-utf8 json frame: {e}")))?
                .into(),
        ),
        Format::MsgPack => Message::Binary(bytes.into()),
    })
}

/// Decode an inbound WebSocket message, keyed by frame type rather than the
/// negotiated format so a peer answering in either encoding is accepted.
/// Control frames decode to `None`.
pub(crate) fn decode_frame(ws_msg: &Message) -> Result<Option<ProtocolMessage>> {
    match ws_msg {
        Message::Text(t) => Ok(Some(decode(t.as_bytes(), Format::Json)?)),
        Message::Binary(b) => Ok(Some(decode(b, Format::MsgPack)?)),
        _ => Ok(None),
    }
}
