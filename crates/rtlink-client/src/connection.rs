//! User-facing connection handle.
//!
//! [`Connection`] is a cheap cloneable handle over the connection task: it
//! validates options, spawns the task, and forwards operations over a
//! command channel.  The task exits when the last handle is dropped.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::auth::provider_from_options;
use crate::error::{Error, Result};
use crate::manager::{Command, ConnectionTask};
use crate::options::ClientOptions;
use crate::state::{ConnectionState, StateChange};
use crate::transport::{Connector, WsConnector};
use rtlink_protocol::ProtocolMessage;

/// A realtime connection to the messaging endpoint.
#[derive(Clone)]
pub struct Connection {
    tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    events_tx: broadcast::Sender<StateChange>,
    frames_tx: broadcast::Sender<ProtocolMessage>,
}

impl Connection {
    /// Validate `options` and spawn the connection task.
    ///
    /// The connection starts Initialized; nothing touches the network until
    /// [`Connection::connect`] or a queued send followed by connect.
    pub fn new(options: ClientOptions) -> Result<Self> {
        Self::with_connector(options, Arc::new(WsConnector))
    }

    /// Like [`Connection::new`] with a custom transport connector.  Used by
    /// tests to route hosts at a loopback server.
    pub fn with_connector(options: ClientOptions, connector: Arc<dyn Connector>) -> Result<Self> {
        options.validate()?;
        let auth = provider_from_options(&options)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let task = ConnectionTask::new(options, auth, connector, rx)?;
        let state_rx = task.state_watch();
        let events_tx = task.state_events_sender();
        let frames_tx = task.frames_sender();
        tokio::spawn(task.run());
        Ok(Connection {
            tx,
            state_rx,
            events_tx,
            frames_tx,
        })
    }

    /// Open the connection; resolves on the next entry into Connected.
    ///
    /// A no-op transition-wise while Connecting or Connected.  Rejected with
    /// the terminal error if the connection reaches Closed or Failed first.
    pub async fn connect(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Connect { reply })?;
        rx.await.map_err(|_| task_gone())?
    }

    /// Close the connection; resolves once Closed.
    ///
    /// A no-op while Closing or Closed; disallowed from Failed.
    pub async fn close(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Close { reply })?;
        rx.await.map_err(|_| task_gone())?
    }

    /// Round-trip a heartbeat and measure the elapsed time.
    ///
    /// Fails in Initialized, Closed and Failed; in the other non-Connected
    /// states the ping waits for the next Connected.  No implicit timeout:
    /// callers arm their own deadline.
    pub async fn ping(&self) -> Result<Duration> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Ping { reply })?;
        rx.await.map_err(|_| task_gone())?
    }

    /// Enqueue a frame for transmission.
    ///
    /// Ack-required frames get the next serial and resolve when the server
    /// acks them; other frames resolve once written to the transport.
    pub async fn send(&self, msg: ProtocolMessage) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Send { msg, reply })?;
        rx.await.map_err(|_| task_gone())?
    }

    /// `"{key}:{serial}"` for handing to a fresh client's `recover` option,
    /// present only while a resumable session exists.
    pub async fn recovery_key(&self) -> Option<String> {
        let (reply, rx) = oneshot::channel();
        if self.command(Command::RecoveryKey { reply }).is_err() {
            return None;
        }
        rx.await.unwrap_or(None)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Subscribe to state transitions, delivered in transition order.
    pub fn state_changes(&self) -> broadcast::Receiver<StateChange> {
        self.events_tx.subscribe()
    }

    /// Subscribe to inbound protocol frames (channel registry tap).
    pub fn frames(&self) -> broadcast::Receiver<ProtocolMessage> {
        self.frames_tx.subscribe()
    }

    fn command(&self, cmd: Command) -> Result<()> {
        self.tx.send(cmd).map_err(|_| task_gone())
    }
}

fn task_gone() -> Error {
    Error::Connection("connection task terminated".to_owned())
}
