//! Connection manager: the task that owns every piece of mutable connection
//! state.
//!
//! All state transitions, queue mutations and bus publishes happen on this
//! one task; the facade talks to it over a command channel and other
//! components observe through broadcast taps.  Long work (credential fetch,
//! DNS, TLS) runs inside a stored connect future; its completion carries the
//! generation it was started under and is dropped if the generation moved.
//!
//! # Open sequence
//! 1. Pick a host (primary, or a fallback after repeated retries).
//! 2. Fetch fresh auth params, append `format`, `echo`, `timestamp`, `v`,
//!    and resume/recover parameters, then dial.
//! 3. Await the server's `Connected` frame; only then enter Connected.
//!
//! # Close sequence
//! Transition to Closing, send an ack-required `Close` frame, await the
//! server's `Closed` or force the transition when the deadline lapses.

use std::collections::VecDeque;
use std::future::pending;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

use crate::auth::AuthProvider;
use crate::bus::{MessageBus, PROTOCOL_MESSAGE_EVENT};
use crate::error::{Error, Result};
use crate::hosts::HostCursor;
use crate::options::{ClientOptions, RecoverInfo};
use crate::queues::{OutgoingQueue, PendingQueue, QueuedFrame, SerialCounter};
use crate::state::{ConnectionState, StateChange, StateMachine, StateWaiter};
use crate::transport::{Connector, WsStream, build_url, decode_frame, encode_frame};
use rtlink_protocol::{Action, ErrorInfo, ProtocolMessage, error_codes};

/// Wire protocol version sent on every handshake.
const PROTOCOL_VERSION: &str = "1";

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Requests from the facade to the connection task.
pub(crate) enum Command {
    Connect {
        reply: StateWaiter,
    },
    Close {
        reply: StateWaiter,
    },
    Ping {
        reply: oneshot::Sender<Result<Duration>>,
    },
    Send {
        msg: ProtocolMessage,
        reply: oneshot::Sender<Result<()>>,
    },
    RecoveryKey {
        reply: oneshot::Sender<Option<String>>,
    },
}

// ---------------------------------------------------------------------------
// ConnectionTask
// ---------------------------------------------------------------------------

/// Identity granted by the server while a session is live.
struct ConnectionIdentity {
    id: String,
}

type PingWaiter = (Instant, oneshot::Sender<Result<Duration>>);
type ConnectOutcome = (u64, Result<WsStream>);
type ConnectFuture = Pin<Box<dyn Future<Output = ConnectOutcome> + Send>>;

enum TaskEvent {
    Command(Option<Command>),
    ConnectDone(ConnectOutcome),
    Transport(Option<std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>),
    RetryTimer,
    OpenDeadline,
    CloseDeadline,
    IdleDeadline,
}

pub(crate) struct ConnectionTask {
    opts: ClientOptions,
    auth: Arc<dyn AuthProvider>,
    connector: Arc<dyn Connector>,
    rx: mpsc::UnboundedReceiver<Command>,

    state: StateMachine,
    outgoing: OutgoingQueue,
    pending: PendingQueue,
    serials: SerialCounter,
    hosts: HostCursor,

    incoming_bus: MessageBus,
    outgoing_bus: MessageBus,
    frames_tx: broadcast::Sender<ProtocolMessage>,
    /// Shared with the heartbeat handler subscribed on the incoming bus.
    ping_waiters: Arc<Mutex<VecDeque<PingWaiter>>>,
    /// Pings issued before Connected; armed on arrival.
    queued_pings: Vec<oneshot::Sender<Result<Duration>>>,

    transport: Option<WsStream>,
    connect_fut: Option<ConnectFuture>,
    identity: Option<ConnectionIdentity>,
    resume_key: Option<String>,
    last_connection_serial: Option<i64>,
    recover: Option<RecoverInfo>,

    /// Failed attempts since the last Connected; drives suspend escalation.
    consecutive_failures: u32,
    /// Retry attempts begun in the current Disconnected/Suspended episode;
    /// the second and later retries may use fallback hosts.
    episode_retries: u32,
    retry_at: Option<Instant>,
    open_deadline: Option<Instant>,
    close_deadline: Option<Instant>,
    last_activity: Instant,
    max_idle: Option<Duration>,
}

impl ConnectionTask {
    pub(crate) fn new(
        opts: ClientOptions,
        auth: Arc<dyn AuthProvider>,
        connector: Arc<dyn Connector>,
        rx: mpsc::UnboundedReceiver<Command>,
    ) -> Result<Self> {
        let recover = match &opts.recover {
            Some(s) => Some(RecoverInfo::parse(s)?),
            None => None,
        };
        let hosts = HostCursor::from_options(&opts);
        let (frames_tx, _) = broadcast::channel(256);
        let mut incoming_bus = MessageBus::new("incoming");
        let outgoing_bus = MessageBus::new("outgoing");

        // Permanent incoming-bus subscribers: the ping handler and the frame
        // tap feeding external (channel registry) subscribers.
        let ping_waiters: Arc<Mutex<VecDeque<PingWaiter>>> = Arc::new(Mutex::new(VecDeque::new()));
        let waiters = Arc::clone(&ping_waiters);
        incoming_bus.subscribe(
            PROTOCOL_MESSAGE_EVENT,
            Box::new(move |msg| {
                if msg.action == Action::Heartbeat {
                    if let Some((start, reply)) = waiters.lock().unwrap().pop_front() {
                        let _ = reply.send(Ok(start.elapsed()));
                    }
                }
                Ok(())
            }),
        )?;
        let tap = frames_tx.clone();
        incoming_bus.subscribe(
            PROTOCOL_MESSAGE_EVENT,
            Box::new(move |msg| {
                let _ = tap.send(msg.clone());
                Ok(())
            }),
        )?;

        Ok(ConnectionTask {
            opts,
            auth,
            connector,
            rx,
            state: StateMachine::new(),
            outgoing: OutgoingQueue::new(),
            pending: PendingQueue::new(),
            serials: SerialCounter::new(),
            hosts,
            incoming_bus,
            outgoing_bus,
            frames_tx,
            ping_waiters,
            queued_pings: Vec::new(),
            transport: None,
            connect_fut: None,
            identity: None,
            resume_key: None,
            last_connection_serial: None,
            recover,
            consecutive_failures: 0,
            episode_retries: 0,
            retry_at: None,
            open_deadline: None,
            close_deadline: None,
            last_activity: Instant::now(),
            max_idle: None,
        })
    }

    pub(crate) fn state_watch(&self) -> tokio::sync::watch::Receiver<ConnectionState> {
        self.state.watch()
    }

    pub(crate) fn state_events_sender(&self) -> broadcast::Sender<StateChange> {
        self.state.events_sender()
    }

    pub(crate) fn frames_sender(&self) -> broadcast::Sender<ProtocolMessage> {
        self.frames_tx.clone()
    }

    // -----------------------------------------------------------------------
    // Event loop
    // -----------------------------------------------------------------------

    pub(crate) async fn run(mut self) {
        loop {
            match self.next_event().await {
                TaskEvent::Command(None) => {
                    debug!("facade dropped, connection task exiting");
                    self.transport = None;
                    break;
                }
                TaskEvent::Command(Some(cmd)) => self.handle_command(cmd).await,
                TaskEvent::ConnectDone(outcome) => self.handle_connect_done(outcome).await,
                TaskEvent::Transport(item) => self.handle_transport_item(item).await,
                TaskEvent::RetryTimer => {
                    self.retry_at = None;
                    self.begin_retry_attempt();
                }
                TaskEvent::OpenDeadline => {
                    self.open_deadline = None;
                    self.fail_attempt(ErrorInfo::new(
                        error_codes::TIMEOUT,
                        "connection attempt timed out",
                        true,
                    ));
                }
                TaskEvent::CloseDeadline => {
                    self.close_deadline = None;
                    self.force_closed();
                }
                TaskEvent::IdleDeadline => {
                    self.connection_lost(ErrorInfo::new(
                        error_codes::TIMEOUT,
                        "no server activity within the max idle interval",
                        true,
                    ));
                }
            }
        }
    }

    async fn next_event(&mut self) -> TaskEvent {
        let idle_at = if self.transport.is_some() {
            self.max_idle
                .map(|d| self.last_activity + d + self.opts.realtime_request_timeout)
        } else {
            None
        };
        tokio::select! {
            biased;
            cmd = self.rx.recv() => TaskEvent::Command(cmd),
            outcome = poll_opt(&mut self.connect_fut) => TaskEvent::ConnectDone(outcome),
            item = next_ws(&mut self.transport) => TaskEvent::Transport(item),
            () = sleep_opt(self.retry_at) => TaskEvent::RetryTimer,
            () = sleep_opt(self.open_deadline) => TaskEvent::OpenDeadline,
            () = sleep_opt(self.close_deadline) => TaskEvent::CloseDeadline,
            () = sleep_opt(idle_at) => TaskEvent::IdleDeadline,
        }
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect { reply } => self.handle_connect(reply),
            Command::Close { reply } => self.handle_close(reply).await,
            Command::Ping { reply } => self.handle_ping(reply).await,
            Command::Send { msg, reply } => self.handle_send(msg, reply).await,
            Command::RecoveryKey { reply } => {
                let _ = reply.send(self.recovery_key());
            }
        }
    }

    fn handle_connect(&mut self, reply: StateWaiter) {
        match self.state.current() {
            ConnectionState::Connected | ConnectionState::Connecting => {
                self.state.add_waiter(ConnectionState::Connected, reply);
            }
            from => {
                if from.is_terminal() {
                    // Failed/Closed re-open as a fresh session.
                    self.reset_session_state();
                }
                self.consecutive_failures = 0;
                self.episode_retries = 0;
                self.retry_at = None;
                match self.state.transition(ConnectionState::Connecting, None, None) {
                    Ok(_) => {
                        self.state.add_waiter(ConnectionState::Connected, reply);
                        let host = self.hosts.primary().to_owned();
                        self.spawn_connect(host);
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
        }
    }

    async fn handle_close(&mut self, reply: StateWaiter) {
        match self.state.current() {
            ConnectionState::Closed => {
                let _ = reply.send(Ok(()));
            }
            ConnectionState::Closing => {
                self.state.add_waiter(ConnectionState::Closed, reply);
            }
            ConnectionState::Failed => {
                let _ = reply.send(Err(Error::InvalidStateTransition {
                    from: ConnectionState::Failed,
                    to: ConnectionState::Closing,
                }));
            }
            ConnectionState::Initialized => {
                let _ = self.state.transition(ConnectionState::Closed, None, None);
                self.enter_terminal(Error::Connection("connection closed".to_owned()));
                let _ = reply.send(Ok(()));
            }
            _ => {
                self.retry_at = None;
                self.connect_fut = None;
                self.open_deadline = None;
                if let Err(e) = self.state.transition(ConnectionState::Closing, None, None) {
                    let _ = reply.send(Err(e));
                    return;
                }
                self.state.add_waiter(ConnectionState::Closed, reply);
                if self.transport.is_some() {
                    let mut close = ProtocolMessage::close();
                    close.msg_serial = Some(self.serials.assign());
                    let entry = QueuedFrame {
                        msg: close.clone(),
                        waiter: None,
                    };
                    if let Err(e) = self.pending.push(entry) {
                        warn!(error = %e, "close frame could not enter the pending queue");
                    }
                    if let Err(e) = self.write_frame(&close).await {
                        debug!(error = %e, "close frame write failed, closing immediately");
                        self.force_closed();
                        return;
                    }
                    self.close_deadline =
                        Some(Instant::now() + self.opts.realtime_request_timeout);
                } else {
                    self.force_closed();
                }
            }
        }
    }

    async fn handle_ping(&mut self, reply: oneshot::Sender<Result<Duration>>) {
        match self.state.current() {
            ConnectionState::Initialized | ConnectionState::Closed | ConnectionState::Failed => {
                let _ = reply.send(Err(Error::Connection(format!(
                    "cannot ping in state {:?}",
                    self.state.current()
                ))));
            }
            ConnectionState::Connected => self.arm_ping(reply).await,
            // Connecting/Disconnected/Suspended/Closing: deferred until
            // Connected, rejected on a terminal transition.
            _ => self.queued_pings.push(reply),
        }
    }

    async fn arm_ping(&mut self, reply: oneshot::Sender<Result<Duration>>) {
        self.ping_waiters
            .lock()
            .unwrap()
            .push_back((Instant::now(), reply));
        if let Err(e) = self.write_frame(&ProtocolMessage::heartbeat()).await {
            warn!(error = %e, "heartbeat write failed");
            self.connection_lost(ErrorInfo::new(
                error_codes::CONNECTION_FAILED,
                e.to_string(),
                true,
            ));
        }
    }

    async fn handle_send(&mut self, mut msg: ProtocolMessage, reply: oneshot::Sender<Result<()>>) {
        let state = self.state.current();
        if matches!(
            state,
            ConnectionState::Closing | ConnectionState::Closed | ConnectionState::Failed
        ) {
            let err = match self.state.error_reason() {
                Some(info) => Error::from_error_info(info.clone()),
                None => Error::Connection(format!("cannot send in state {state:?}")),
            };
            let _ = reply.send(Err(err));
            return;
        }
        if !self.opts.queue_messages && state != ConnectionState::Connected {
            let _ = reply.send(Err(Error::Connection(
                "not connected and message queueing is disabled".to_owned(),
            )));
            return;
        }

        let ack_required = msg.ack_required();
        if ack_required {
            msg.msg_serial = Some(self.serials.assign());
        }
        self.outgoing.push_back(QueuedFrame {
            msg: msg.clone(),
            waiter: Some(reply),
        });
        if let Err(e) = self.outgoing_bus.publish(PROTOCOL_MESSAGE_EVENT, &msg) {
            // Enqueue aborted: take the frame back out and return the serial.
            if let Some(frame) = self.outgoing.pop_back() {
                if ack_required {
                    self.serials.rollback();
                }
                frame.settle(Err(e));
            }
            return;
        }
        if state == ConnectionState::Connected {
            self.drain_outgoing().await;
        }
    }

    fn recovery_key(&self) -> Option<String> {
        match (&self.resume_key, self.last_connection_serial) {
            (Some(key), Some(serial)) => Some(format!("{key}:{serial}")),
            _ => None,
        }
    }

    // -----------------------------------------------------------------------
    // Connect attempts
    // -----------------------------------------------------------------------

    /// Retry timer fired while Disconnected or Suspended.
    fn begin_retry_attempt(&mut self) {
        let prev = self.state.current();
        if !matches!(
            prev,
            ConnectionState::Disconnected | ConnectionState::Suspended
        ) {
            return;
        }
        let use_fallback = self.episode_retries >= 1 && self.hosts.has_fallbacks();
        let host = if use_fallback {
            self.hosts.next_fallback()
        } else {
            self.hosts.primary().to_owned()
        };
        self.episode_retries += 1;
        match self.state.transition(ConnectionState::Connecting, None, None) {
            Ok(_) => {
                info!(host = %host, attempt = self.episode_retries, fallback = use_fallback, "reconnecting");
                self.spawn_connect(host);
            }
            Err(e) => warn!(error = %e, "retry could not enter Connecting"),
        }
    }

    /// Build the handshake URL off-task and dial.  The stored future's
    /// completion is tagged with the generation it was started under.
    fn spawn_connect(&mut self, host: String) {
        let auth = Arc::clone(&self.auth);
        let connector = Arc::clone(&self.connector);
        let base = self.hosts.base_url(&host);
        let format = self.opts.format;
        let echo = self.opts.echo_messages;
        let session_params = self.session_params();
        let generation = self.state.generation();

        self.connect_fut = Some(Box::pin(async move {
            let result = async {
                let mut params = auth.auth_params().await?;
                params.push(("format".to_owned(), format.as_param().to_owned()));
                params.push(("echo".to_owned(), echo.to_string()));
                params.push((
                    "timestamp".to_owned(),
                    Utc::now().timestamp_millis().to_string(),
                ));
                params.push(("v".to_owned(), PROTOCOL_VERSION.to_owned()));
                params.extend(session_params);
                let url = build_url(&base, &params);
                connector.connect(&url).await
            }
            .await;
            (generation, result)
        }));
        self.open_deadline = Some(Instant::now() + self.opts.realtime_request_timeout);
    }

    /// Resume takes precedence; an unconsumed recover key is used once.
    fn session_params(&self) -> Vec<(String, String)> {
        if let (Some(key), Some(serial)) = (&self.resume_key, self.last_connection_serial) {
            return vec![
                ("resume".to_owned(), key.clone()),
                ("connection_serial".to_owned(), serial.to_string()),
            ];
        }
        if let Some(recover) = &self.recover {
            return vec![
                ("recover".to_owned(), recover.key.clone()),
                ("connection_serial".to_owned(), recover.serial.clone()),
            ];
        }
        Vec::new()
    }

    async fn handle_connect_done(&mut self, (generation, result): ConnectOutcome) {
        self.connect_fut = None;
        if generation != self.state.generation()
            || self.state.current() != ConnectionState::Connecting
        {
            debug!("dropping stale connect completion");
            return;
        }
        match result {
            Ok(ws) => {
                // Transport is up; Connected is entered only when the server
                // says so (the open deadline still covers the wait).
                self.transport = Some(ws);
                self.last_activity = Instant::now();
            }
            Err(e) => {
                let info = match &e {
                    Error::Auth(info) => info.clone(),
                    _ => ErrorInfo::new(error_codes::CONNECTION_FAILED, e.to_string(), true),
                };
                self.fail_attempt(info);
            }
        }
    }

    /// A connect attempt failed before reaching Connected.
    fn fail_attempt(&mut self, info: ErrorInfo) {
        self.transport = None;
        self.connect_fut = None;
        self.open_deadline = None;
        if info.is_auth_failure() || !info.retryable {
            warn!(error = %info, "connection failed terminally");
            let _ = self
                .state
                .transition(ConnectionState::Failed, Some(info.clone()), None);
            self.enter_terminal(Error::from_error_info(info));
            return;
        }
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.opts.suspend_after_attempts {
            // Suspension outlives the server's session state; resume is gone.
            self.resume_key = None;
            self.last_connection_serial = None;
            let retry = self.opts.suspended_retry_timeout;
            let _ = self.state.transition(
                ConnectionState::Suspended,
                Some(ErrorInfo::new(
                    error_codes::CONNECTION_SUSPENDED,
                    info.message.clone(),
                    true,
                )),
                Some(retry),
            );
            self.retry_at = Some(Instant::now() + retry);
        } else {
            let retry = self.opts.disconnected_retry_timeout;
            let _ = self
                .state
                .transition(ConnectionState::Disconnected, Some(info), Some(retry));
            self.retry_at = Some(Instant::now() + retry);
        }
    }

    // -----------------------------------------------------------------------
    // Transport events
    // -----------------------------------------------------------------------

    async fn handle_transport_item(
        &mut self,
        item: Option<std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>,
    ) {
        match item {
            None => self.transport_gone("stream ended".to_owned()),
            Some(Err(e)) => self.transport_gone(e.to_string()),
            Some(Ok(ws_msg)) => {
                self.last_activity = Instant::now();
                match ws_msg {
                    Message::Ping(data) => {
                        if let Some(ws) = self.transport.as_mut() {
                            let _ = ws.send(Message::Pong(data)).await;
                        }
                    }
                    Message::Close(_) => self.transport_gone("peer closed".to_owned()),
                    other => match decode_frame(&other) {
                        Ok(Some(msg)) => self.route_incoming(msg).await,
                        Ok(None) => {}
                        Err(e) => warn!(error = %e, "undecodable frame"),
                    },
                }
            }
        }
    }

    fn transport_gone(&mut self, detail: String) {
        if self.state.current() == ConnectionState::Connecting {
            self.fail_attempt(ErrorInfo::new(error_codes::CONNECTION_FAILED, detail, true));
        } else {
            self.connection_lost(ErrorInfo::new(error_codes::CONNECTION_FAILED, detail, true));
        }
    }

    /// The transport died underneath an established (or closing) session.
    fn connection_lost(&mut self, info: ErrorInfo) {
        self.transport = None;
        self.max_idle = None;
        match self.state.current() {
            ConnectionState::Closing => {
                // Good enough: the server will never answer the Close now.
                self.close_deadline = None;
                let _ = self.state.transition(ConnectionState::Closed, None, None);
                self.enter_terminal(Error::Connection("connection closed".to_owned()));
            }
            ConnectionState::Connected => {
                info!(error = %info, "connection lost");
                // In-flight pings died with the wire; queued ones keep
                // waiting for the next Connected.
                self.reject_armed_pings(&Error::Connection(info.message.clone()));
                // Resumable: pending frames replay at the front of the queue.
                let replay = self.pending.take_all();
                self.outgoing.requeue_front(replay);
                if !info.retryable {
                    self.resume_key = None;
                    self.last_connection_serial = None;
                }
                self.consecutive_failures = 0;
                self.episode_retries = 0;
                let retry = self.opts.disconnected_retry_timeout;
                let _ = self
                    .state
                    .transition(ConnectionState::Disconnected, Some(info), Some(retry));
                self.retry_at = Some(Instant::now() + retry);
            }
            // Anywhere else the transport should already be gone; nothing to
            // drive.
            state => debug!(?state, "transport loss in quiescent state"),
        }
    }

    // -----------------------------------------------------------------------
    // Incoming routing
    // -----------------------------------------------------------------------

    async fn route_incoming(&mut self, msg: ProtocolMessage) {
        if let Some(serial) = msg.connection_serial {
            self.last_connection_serial = Some(serial);
        }
        match msg.action {
            Action::Connected => self.handle_connected_frame(&msg).await,
            Action::Ack => self.apply_ack(&msg, true),
            Action::Nack => self.apply_ack(&msg, false),
            Action::Error if msg.channel.is_none() => {
                let info = msg.error.clone().unwrap_or_else(|| {
                    ErrorInfo::new(error_codes::INTERNAL_ERROR, "server error", false)
                });
                warn!(error = %info, "connection error from server");
                self.transport = None;
                let _ = self
                    .state
                    .transition(ConnectionState::Failed, Some(info.clone()), None);
                self.enter_terminal(Error::from_error_info(info));
            }
            Action::Disconnected => {
                let info = msg.error.clone().unwrap_or_else(|| {
                    ErrorInfo::new(error_codes::CONNECTION_FAILED, "server disconnected", true)
                });
                self.connection_lost(info);
            }
            Action::Closed => {
                if self.state.current() == ConnectionState::Closing {
                    self.close_deadline = None;
                    self.transport = None;
                    let _ = self.state.transition(
                        ConnectionState::Closed,
                        msg.error.clone(),
                        None,
                    );
                    self.enter_terminal(Error::Connection("connection closed".to_owned()));
                } else {
                    warn!(state = ?self.state.current(), "unsolicited Closed frame");
                }
            }
            Action::Unknown => {
                warn!("ignoring frame with unknown action");
                return;
            }
            // Heartbeat and channel traffic carry no connection-level state;
            // subscribers pick them up from the bus below.
            _ => {}
        }
        let _ = self.incoming_bus.publish(PROTOCOL_MESSAGE_EVENT, &msg);
    }

    async fn handle_connected_frame(&mut self, msg: &ProtocolMessage) {
        let mut key = msg.connection_key.clone();
        if let Some(details) = &msg.connection_details {
            if details.connection_key.is_some() {
                key = details.connection_key.clone();
            }
            self.max_idle = details.max_idle_interval.map(Duration::from_millis);
        }

        // A different connection id means the old generation is dead: its
        // pending frames cannot be acked any more, and queued serials belong
        // to it.
        let generation_changed = match (&self.identity, &msg.connection_id) {
            (Some(old), Some(new_id)) => old.id != *new_id,
            _ => false,
        };
        if generation_changed {
            let n = self.pending.reject_all(&Error::ConnectionReset(
                "connection id changed on reconnect".to_owned(),
            ));
            if n > 0 {
                warn!(rejected = n, "pending frames rejected by connection reset");
            }
            self.serials.reset();
            self.outgoing.reassign_serials(&mut self.serials);
        }
        if let Some(info) = &msg.error {
            warn!(error = %info, "server accepted connection with warning");
        }

        self.identity = msg
            .connection_id
            .clone()
            .map(|id| ConnectionIdentity { id });
        self.resume_key = key;
        self.recover = None;
        self.consecutive_failures = 0;
        self.episode_retries = 0;
        self.open_deadline = None;

        match self
            .state
            .transition(ConnectionState::Connected, msg.error.clone(), None)
        {
            Ok(change) => {
                info!(
                    connection_id = ?self.identity.as_ref().map(|i| i.id.as_str()),
                    generation = self.state.generation(),
                    resumed = !generation_changed && change.previous != ConnectionState::Initialized,
                    "connected"
                );
            }
            Err(e) => {
                warn!(error = %e, "Connected frame in unexpected state");
                return;
            }
        }

        for reply in std::mem::take(&mut self.queued_pings) {
            self.arm_ping(reply).await;
        }
        self.drain_outgoing().await;
    }

    fn apply_ack(&mut self, msg: &ProtocolMessage, positive: bool) {
        let Some(serial) = msg.msg_serial else {
            warn!("ack frame without serial");
            return;
        };
        let count = msg.count.unwrap_or(1);
        let report = if positive {
            self.pending.ack(serial, count)
        } else {
            self.pending.nack(serial, count, msg.error.clone())
        };
        for violation in &report.violations {
            warn!(violation = %violation, "ack serial violation");
        }
        debug!(serial, count, settled = report.settled, positive, "ack applied");
    }

    // -----------------------------------------------------------------------
    // Outgoing drain
    // -----------------------------------------------------------------------

    /// Drain the outgoing queue to the transport in FIFO order.
    ///
    /// Ack-required frames enter the pending queue before their transport
    /// write, so a fast server ack always finds its entry.  On a write
    /// failure the drain stops: the written frame stays pending for replay,
    /// the rest stays queued.
    async fn drain_outgoing(&mut self) {
        while self.state.current() == ConnectionState::Connected {
            let Some(frame) = self.outgoing.pop_front() else {
                break;
            };
            let msg = frame.msg.clone();
            if msg.ack_required() {
                if let Err(e) = self.pending.push(frame) {
                    warn!(error = %e, "frame could not enter the pending queue");
                    continue;
                }
                if let Err(e) = self.write_frame(&msg).await {
                    self.connection_lost(ErrorInfo::new(
                        error_codes::CONNECTION_FAILED,
                        e.to_string(),
                        true,
                    ));
                    break;
                }
            } else {
                match self.write_frame(&msg).await {
                    Ok(()) => frame.settle(Ok(())),
                    Err(e) => {
                        self.outgoing.requeue_front(vec![frame]);
                        self.connection_lost(ErrorInfo::new(
                            error_codes::CONNECTION_FAILED,
                            e.to_string(),
                            true,
                        ));
                        break;
                    }
                }
            }
            tokio::task::yield_now().await;
        }
    }

    async fn write_frame(&mut self, msg: &ProtocolMessage) -> Result<()> {
        let ws = self
            .transport
            .as_mut()
            .ok_or_else(|| Error::Connection("no transport".to_owned()))?;
        let ws_msg = encode_frame(msg, self.opts.format)?;
        ws.send(ws_msg)
            .await
            .map_err(|e| Error::Connection(e.to_string()))
    }

    // -----------------------------------------------------------------------
    // Terminal housekeeping
    // -----------------------------------------------------------------------

    fn force_closed(&mut self) {
        if self.state.current() != ConnectionState::Closing {
            return;
        }
        let _ = self.state.transition(ConnectionState::Closed, None, None);
        self.enter_terminal(Error::Timeout("close handshake deadline".to_owned()));
    }

    /// Housekeeping shared by every arrival in Closed or Failed.
    fn enter_terminal(&mut self, err: Error) {
        self.transport = None;
        self.connect_fut = None;
        self.retry_at = None;
        self.open_deadline = None;
        self.close_deadline = None;
        self.max_idle = None;
        let rejected = self.pending.reject_all(&err) + self.outgoing.reject_all(&err);
        if rejected > 0 {
            debug!(rejected, "frames rejected on terminal state");
        }
        self.reject_pings(&err);
        self.reset_session_state();
    }

    /// Forget everything tied to the server-side session.
    fn reset_session_state(&mut self) {
        self.identity = None;
        self.resume_key = None;
        self.last_connection_serial = None;
        self.recover = None;
        self.serials.reset();
    }

    fn reject_pings(&mut self, err: &Error) {
        for reply in std::mem::take(&mut self.queued_pings) {
            let _ = reply.send(Err(err.clone()));
        }
        self.reject_armed_pings(err);
    }

    fn reject_armed_pings(&mut self, err: &Error) {
        for (_, reply) in self.ping_waiters.lock().unwrap().drain(..) {
            let _ = reply.send(Err(err.clone()));
        }
    }
}

// ---------------------------------------------------------------------------
// Select helpers
// ---------------------------------------------------------------------------

async fn poll_opt(fut: &mut Option<ConnectFuture>) -> ConnectOutcome {
    match fut {
        Some(f) => f.as_mut().await,
        None => pending().await,
    }
}

async fn next_ws(
    transport: &mut Option<WsStream>,
) -> Option<std::result::Result<Message, tokio_tungstenite::tungstenite::Error>> {
    match transport {
        Some(ws) => ws.next().await,
        None => pending().await,
    }
}

async fn sleep_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => pending().await,
    }
}
