//! Realtime connection subsystem for the rtlink pub/sub service.
//!
//! Maintains a persistent, authenticated, full-duplex WebSocket session
//! with a realtime endpoint: connection lifecycle, resume/recover across
//! reconnects, heartbeats, host failover, and ack/serial accounting for
//! outbound frames.
//!
//! The entry point is [`Connection`], built from [`ClientOptions`]:
//!
//! ```no_run
//! use rtlink_client::{ClientOptions, Connection};
//! use rtlink_protocol::{ChannelMessage, ProtocolMessage};
//!
//! # async fn demo() -> Result<(), rtlink_client::Error> {
//! let conn = Connection::new(ClientOptions::with_key("app.key:secret"))?;
//! conn.connect().await?;
//! conn.send(ProtocolMessage::message(
//!     "race-updates",
//!     ChannelMessage {
//!         name: Some("update".to_owned()),
//!         data: Some(serde_json::json!({"pos": 1})),
//!         client_id: None,
//!     },
//! ))
//! .await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod bus;
pub mod connection;
pub mod error;
pub mod hosts;
mod manager;
pub mod options;
mod queues;
pub mod state;
pub mod transport;

pub use connection::Connection;
pub use error::{Error, Result};
pub use options::{ClientOptions, RecoverInfo};
pub use state::{ConnectionState, StateChange};
