use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use strum_macros::Display;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{Bytes, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async_tls_with_config};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;
use uuid::Uuid;

use super::context_pool::{ContextOutcome, ContextPool};
use super::output_queue::OutputQueue;
use super::tls;
use crate::config::{IdentityConfig, UplinkConfig};
use crate::error::{CancelReason, UplinkError};
use crate::message::GwMessage;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Lifecycle of the uplink session.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Registering,
    Ready,
}

struct Shared {
    config: UplinkConfig,
    identity: IdentityConfig,
    endpoint: Url,
    pool: ContextPool,
    queue: OutputQueue,
    /// Exclusive owner of the write half; reconnect takes both halves.
    sink: Mutex<Option<WsSink>>,
    /// Exclusive owner of the read half.
    stream: Mutex<Option<WsStream>>,
    state: watch::Sender<LinkState>,
    request_reconnect: Notify,
    reconnect_flag: AtomicBool,
    last_received: StdMutex<Instant>,
    commands: mpsc::UnboundedSender<GwMessage>,
    cancel: CancellationToken,
}

impl Shared {
    fn mark_reconnect(&self) {
        self.reconnect_flag.store(true, Ordering::SeqCst);
        self.request_reconnect.notify_waiters();
    }

    fn reconnect_requested(&self) -> bool {
        self.reconnect_flag.load(Ordering::SeqCst)
    }

    fn touch_last_received(&self) {
        *self
            .last_received
            .lock()
            .expect("last-received lock poisoned") = Instant::now();
    }

    fn since_last_received(&self) -> Duration {
        self.last_received
            .lock()
            .expect("last-received lock poisoned")
            .elapsed()
    }
}

/// Persistent WebSocket session to the server.
///
/// Two long-lived tasks share the socket: the sender owns connecting,
/// registering, forwarding the output queue and ping probes; the receiver
/// owns frame reads and dispatch. A failure on either side raises a
/// reconnect request which only the sender acts upon, so at most one
/// reconnect is in flight at any moment.
pub struct UplinkConnector {
    shared: Arc<Shared>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl UplinkConnector {
    /// Creates a connector. Unsolicited downstream commands are delivered
    /// on the returned channel in arrival order.
    ///
    /// # Errors
    ///
    /// Returns [`UplinkError::Endpoint`] when host and port do not form a
    /// valid WebSocket URL.
    pub fn new(
        config: UplinkConfig,
        identity: IdentityConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<GwMessage>), UplinkError> {
        let scheme = if config.tls.is_some() { "wss" } else { "ws" };
        let endpoint = Url::parse(&format!("{scheme}://{}:{}", config.host, config.port))?;

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(LinkState::Disconnected);
        let shared = Arc::new(Shared {
            pool: ContextPool::new(config.context_capacity, config.resend_timeout),
            queue: OutputQueue::new(config.queue_capacity, config.resend_timeout),
            sink: Mutex::new(None),
            stream: Mutex::new(None),
            state,
            request_reconnect: Notify::new(),
            reconnect_flag: AtomicBool::new(false),
            last_received: StdMutex::new(Instant::now()),
            commands,
            cancel: CancellationToken::new(),
            endpoint,
            config,
            identity,
        });

        Ok((
            Self {
                shared,
                tasks: StdMutex::new(Vec::new()),
            },
            command_rx,
        ))
    }

    /// Spawns the sender, receiver and context-reaper tasks.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock().expect("task list lock poisoned");
        if !tasks.is_empty() {
            return;
        }
        tasks.push(tokio::spawn(run_sender(Arc::clone(&self.shared))));
        tasks.push(tokio::spawn(run_receiver(Arc::clone(&self.shared))));
        tasks.push(tokio::spawn(run_reaper(Arc::clone(&self.shared))));
    }

    /// Stops both tasks, closes the socket and cancels outstanding
    /// contexts with a shutdown reason.
    pub async fn stop(&self) {
        self.shared.cancel.cancel();
        self.shared.pool.cancel_all(CancelReason::Shutdown);
        self.shared.request_reconnect.notify_waiters();

        self.shared.sink.lock().await.take();
        self.shared.stream.lock().await.take();
        let _ = self.shared.state.send(LinkState::Disconnected);

        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().expect("task list lock poisoned");
            tasks.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }
        info!("uplink connector stopped");
    }

    /// Queues a message for eventual delivery and returns immediately.
    pub fn send_message(&self, message: GwMessage) {
        self.shared.queue.enqueue(message);
    }

    /// Queues a request and waits up to `timeout` for the correlated
    /// response.
    ///
    /// # Errors
    ///
    /// [`UplinkError::Timeout`] when no response arrives in time,
    /// [`UplinkError::Cancelled`] when the session drops or the connector
    /// stops, and [`UplinkError::Capacity`] when too many requests are
    /// outstanding.
    pub async fn send_and_wait(
        &self,
        message: GwMessage,
        timeout: Duration,
    ) -> Result<GwMessage, UplinkError> {
        let correlation_id = message.id();
        let outcome = self.shared.pool.register(correlation_id)?;
        self.shared.queue.enqueue(message);

        match tokio::time::timeout(timeout, outcome).await {
            Ok(Ok(ContextOutcome::Fulfilled(response))) => Ok(response),
            Ok(Ok(ContextOutcome::TimedOut)) => Err(UplinkError::Timeout),
            Ok(Ok(ContextOutcome::Cancelled(reason))) => Err(UplinkError::Cancelled { reason }),
            Ok(Err(_)) => Err(UplinkError::NotRunning),
            Err(_) => {
                self.shared.pool.abandon(correlation_id);
                Err(UplinkError::Timeout)
            }
        }
    }

    /// Observes the session lifecycle.
    #[must_use]
    pub fn state(&self) -> watch::Receiver<LinkState> {
        self.shared.state.subscribe()
    }

    /// Returns how many requests currently await a response.
    #[must_use]
    pub fn outstanding_requests(&self) -> usize {
        self.shared.pool.outstanding()
    }

    /// Returns how many messages wait in the output queue.
    #[must_use]
    pub fn queued_messages(&self) -> usize {
        self.shared.queue.len()
    }

    /// Age of the oldest queued message, for backpressure decisions.
    #[must_use]
    pub fn oldest_queued_age(&self) -> Option<Duration> {
        self.shared.queue.peek_age_oldest()
    }
}

async fn run_reaper(shared: Arc<Shared>) {
    let mut tick = tokio::time::interval(shared.pool.reap_interval());
    loop {
        tokio::select! {
            () = shared.cancel.cancelled() => break,
            _ = tick.tick() => {
                shared.pool.reap(Instant::now());
            }
        }
    }
}

// ── Sender ───────────────────────────────────────────────────────────

async fn run_sender(shared: Arc<Shared>) {
    while !shared.cancel.is_cancelled() {
        match connect_and_register(&shared).await {
            Ok(()) => forward_until_disconnect(&shared).await,
            Err(error) => {
                let _ = shared.state.send(LinkState::Disconnected);
                warn!(%error, "uplink connection attempt failed");
                tokio::select! {
                    () = shared.cancel.cancelled() => break,
                    () = tokio::time::sleep(shared.config.retry_connect_timeout) => {}
                }
            }
        }
    }
    debug!("uplink sender exiting");
}

/// Opens the socket, upgrades to WebSocket and performs the
/// register/acknowledge exchange. On success the halves are published and
/// the session is `Ready`.
#[instrument(skip(shared), fields(endpoint = %shared.endpoint))]
async fn connect_and_register(shared: &Shared) -> Result<(), String> {
    let _ = shared.state.send(LinkState::Connecting);

    let connector = tls::build_connector(shared.config.tls.as_ref())?;
    let (socket, _response) = connect_async_tls_with_config(
        shared.endpoint.as_str(),
        None,
        true,
        connector,
    )
    .await
    .map_err(|error| format!("websocket connect failed: {error}"))?;
    let (mut sink, mut stream) = socket.split();

    let _ = shared.state.send(LinkState::Registering);
    let register = GwMessage::Register {
        id: Uuid::new_v4(),
        gateway_id: shared.identity.id.clone(),
        version: shared.identity.version.clone(),
    };
    let frame = register
        .to_frame()
        .map_err(|error| format!("register frame failed: {error}"))?;
    sink.send(Message::Text(frame.into()))
        .await
        .map_err(|error| format!("register send failed: {error}"))?;

    wait_for_register_ack(shared, &mut stream).await?;

    *shared.sink.lock().await = Some(sink);
    *shared.stream.lock().await = Some(stream);
    shared.touch_last_received();
    shared.reconnect_flag.store(false, Ordering::SeqCst);
    let _ = shared.state.send(LinkState::Ready);
    info!("gateway registered with the server");
    Ok(())
}

async fn wait_for_register_ack(shared: &Shared, stream: &mut WsStream) -> Result<(), String> {
    let deadline = Instant::now() + shared.config.receive_timeout;
    loop {
        let frame = tokio::time::timeout_at(deadline, stream.next())
            .await
            .map_err(|_| "no registration acknowledgement in time".to_string())?;
        match frame {
            Some(Ok(Message::Text(text))) => {
                match GwMessage::from_frame(text.as_str(), shared.config.max_message_size) {
                    Ok(GwMessage::RegisterAck { .. }) => return Ok(()),
                    Ok(other) => {
                        debug!(correlation_id = %other.id(), "ignoring pre-ack message");
                    }
                    Err(error) => return Err(format!("malformed registration reply: {error}")),
                }
            }
            Some(Ok(_)) => {}
            Some(Err(error)) => return Err(format!("read failed while registering: {error}")),
            None => return Err("server closed the socket while registering".to_string()),
        }
    }
}

/// Ready-state loop: forwards queued messages, probes with pings when
/// idle, and tears the session down on any failure signal.
async fn forward_until_disconnect(shared: &Shared) {
    loop {
        if shared.cancel.is_cancelled() {
            teardown(shared, CancelReason::Shutdown).await;
            return;
        }
        if shared.reconnect_requested() {
            teardown(shared, CancelReason::Disconnect).await;
            return;
        }
        if shared.since_last_received() > 2 * shared.config.busy_sleep {
            warn!("no traffic from server beyond the liveness window");
            teardown(shared, CancelReason::Disconnect).await;
            return;
        }

        tokio::select! {
            () = shared.cancel.cancelled() => {}
            () = shared.request_reconnect.notified() => {}
            ready = shared.queue.dequeue_ready(shared.config.busy_sleep) => {
                match ready {
                    Some(message) => send_message_frame(shared, message).await,
                    None => send_ping(shared).await,
                }
            }
        }
    }
}

async fn send_message_frame(shared: &Shared, message: GwMessage) {
    let frame = match message.to_frame() {
        Ok(frame) => frame,
        Err(error) => {
            warn!(%error, "dropping unencodable message");
            return;
        }
    };

    let mut sink = shared.sink.lock().await;
    let Some(socket) = sink.as_mut() else {
        shared.queue.requeue_front(message);
        shared.mark_reconnect();
        return;
    };

    let sent = tokio::time::timeout(
        shared.config.send_timeout,
        socket.send(Message::Text(frame.into())),
    )
    .await;
    match sent {
        Ok(Ok(())) => debug!(correlation_id = %message.id(), "message forwarded"),
        Ok(Err(error)) => {
            warn!(%error, "send failed, requesting reconnect");
            shared.queue.requeue_front(message);
            shared.mark_reconnect();
        }
        Err(_) => {
            warn!("send timed out, requesting reconnect");
            shared.queue.requeue_front(message);
            shared.mark_reconnect();
        }
    }
}

async fn send_ping(shared: &Shared) {
    let mut sink = shared.sink.lock().await;
    let Some(socket) = sink.as_mut() else {
        shared.mark_reconnect();
        return;
    };
    if let Err(error) = socket.send(Message::Ping(Bytes::new())).await {
        warn!(%error, "ping failed, requesting reconnect");
        shared.mark_reconnect();
    }
}

/// Closes the socket and cancels outstanding work. Both socket locks are
/// taken, so no send or receive interleaves with the reconnect.
async fn teardown(shared: &Shared, reason: CancelReason) {
    let _ = shared.state.send(LinkState::Disconnected);
    shared.sink.lock().await.take();
    shared.stream.lock().await.take();
    shared.pool.cancel_all(reason);
    shared.queue.flush_on_disconnect();
    shared.reconnect_flag.store(false, Ordering::SeqCst);
    debug!(%reason, "uplink session closed");
}

// ── Receiver ─────────────────────────────────────────────────────────

async fn run_receiver(shared: Arc<Shared>) {
    let mut state = shared.state.subscribe();
    loop {
        if shared.cancel.is_cancelled() {
            break;
        }

        if *state.borrow_and_update() != LinkState::Ready {
            tokio::select! {
                () = shared.cancel.cancelled() => break,
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            continue;
        }

        match read_one_frame(&shared).await {
            ReadStep::Idle => {}
            ReadStep::Frame(message) => dispatch_frame(&shared, message),
            ReadStep::Failed => {
                shared.mark_reconnect();
                // Only the sender cycles the session; wait for the next
                // state version so a single reconnect handles the failure.
                tokio::select! {
                    () = shared.cancel.cancelled() => break,
                    changed = state.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
    debug!("uplink receiver exiting");
}

enum ReadStep {
    Idle,
    Frame(Message),
    Failed,
}

async fn read_one_frame(shared: &Shared) -> ReadStep {
    let mut stream = shared.stream.lock().await;
    let Some(socket) = stream.as_mut() else {
        return ReadStep::Failed;
    };

    match tokio::time::timeout(shared.config.poll_timeout, socket.next()).await {
        Err(_) => ReadStep::Idle,
        Ok(Some(Ok(message))) => ReadStep::Frame(message),
        Ok(Some(Err(error))) => {
            warn!(%error, "read failed, requesting reconnect");
            ReadStep::Failed
        }
        Ok(None) => {
            warn!("server closed the socket");
            ReadStep::Failed
        }
    }
}

fn dispatch_frame(shared: &Shared, message: Message) {
    shared.touch_last_received();
    match message {
        Message::Text(text) => {
            match GwMessage::from_frame(text.as_str(), shared.config.max_message_size) {
                Ok(message) => dispatch_message(shared, message),
                Err(error) => {
                    warn!(%error, "bad frame from server, requesting reconnect");
                    shared.mark_reconnect();
                }
            }
        }
        Message::Pong(_) | Message::Ping(_) => {}
        Message::Close(_) => {
            warn!("close frame from server, requesting reconnect");
            shared.mark_reconnect();
        }
        other => debug!(?other, "ignoring non-text frame"),
    }
}

fn dispatch_message(shared: &Shared, message: GwMessage) {
    if message.is_response() {
        shared.pool.fulfill(message.id(), message);
        return;
    }
    if message.is_command() {
        if shared.commands.send(message).is_err() {
            warn!("command router is gone, dropping downstream command");
        }
        return;
    }
    debug!(correlation_id = %message.id(), "ignoring unexpected message kind");
}
