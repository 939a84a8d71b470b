//! The connection kernel.
//!
//! One kernel task runs per client. It owns the socket, the request and
//! subscription registries, the reconnect backoff and the connection state.
//! Everything else talks to it over channels:
//!
//! - client handles send [`Command`]s (connect, request, subscribe);
//! - socket tasks send events tagged with the generation of the attempt
//!   that produced them (opened, open failed, frame, failed, closed);
//! - three timers live inside the loop: the open watchdog, the backoff delay
//!   and the stability timer of the current socket.
//!
//! The loop handles one input at a time, so there is never more than one
//! transition in progress. Socket events are polled before commands, so
//! after an open the registries are replayed before any newly queued
//! request goes out.
//!
//! # Reconnect
//!
//! ```text
//! Connected --close/error--> Disconnected --backoff--> Connecting --open--> Connected
//!                                 ^                        |
//!                                 +---refused / watchdog---+
//! ```
//!
//! A reconnect while already `Disconnected` is a no-op, and every detach bumps
//! the generation. A close and an error reported together for one socket
//! therefore cause a single reconnect, and late events from a replaced socket
//! are dropped.
//!
//! The backoff schedule restarts only once a socket has stayed open for
//! `reconnect_delay_ms`. A node that accepts and immediately drops the socket
//! is therefore retried with growing delays instead of in a tight loop.

use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::backoff::{Backoff, BackoffError};
use crate::config::ClientConfig;
use crate::envelope::{Envelope, Frame, Query};
use crate::error::ClientError;
use crate::requests::{RequestRegistry, Responder};
use crate::state::ConnectionState;
use crate::subscriptions::{Handler, SubscriptionRegistry};
use crate::transport::{Connector, FrameSink, FrameStream, OpenRequest, Socket};
use crate::Result;

/// Requests from client handles to the kernel.
pub(crate) enum Command {
    /// Resolves once the socket is open.
    Connect { done: oneshot::Sender<Result<()>> },
    /// Registers a request and sends it if connected.
    Request {
        verb: String,
        query: Query,
        responder: Responder,
    },
    /// Registers a room and subscribes to it if connected.
    Subscribe {
        room: String,
        handler: Handler,
        done: oneshot::Sender<Result<()>>,
    },
}

enum SocketEvent {
    Opened(Socket),
    OpenFailed(ClientError),
    Frame(String),
    Failed(ClientError),
    Closed,
}

struct Event {
    generation: u64,
    kind: SocketEvent,
}

pub(crate) struct ConnectionKernel {
    connector: Arc<dyn Connector>,
    open_request: OpenRequest,
    connect_timeout: Duration,
    /// How long a socket must stay open before the backoff restarts.
    stable_after: Duration,
    schema: Option<Envelope>,

    state_tx: watch::Sender<ConnectionState>,
    requests: RequestRegistry,
    subscriptions: SubscriptionRegistry,
    backoff: Backoff,
    connect_waiters: Vec<oneshot::Sender<Result<()>>>,

    /// Bumped on every detach. Socket events carry the value current when the
    /// attempt started.
    generation: u64,
    sink: Option<FrameSink>,
    /// Open attempt while connecting, frame reader while connected.
    socket_task: Option<JoinHandle<()>>,
    watchdog: Option<Pin<Box<Sleep>>>,
    next_attempt: Option<Pin<Box<Sleep>>>,
    stable: Option<Pin<Box<Sleep>>>,

    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    commands: mpsc::Receiver<Command>,
    cancel: CancellationToken,
}

impl ConnectionKernel {
    pub(crate) fn new(
        config: &ClientConfig,
        connector: Arc<dyn Connector>,
        commands: mpsc::Receiver<Command>,
        state_tx: watch::Sender<ConnectionState>,
        cancel: CancellationToken,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            connector,
            open_request: config.open_request(),
            connect_timeout: config.connect_timeout(),
            stable_after: config.reconnect_delay(),
            schema: config.schema.as_ref().map(Envelope::schema),
            state_tx,
            requests: RequestRegistry::new(),
            subscriptions: SubscriptionRegistry::new(),
            backoff: Backoff::from_config(config),
            connect_waiters: Vec::new(),
            generation: 0,
            sink: None,
            socket_task: None,
            watchdog: None,
            next_attempt: None,
            stable: None,
            events_tx,
            events_rx,
            commands,
            cancel,
        }
    }

    /// Runs until cancelled or until every client handle is gone.
    pub(crate) async fn run(mut self) {
        debug!(url = %self.open_request.url, "connection kernel started");
        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    debug!("shutdown requested");
                    break;
                }

                Some(event) = self.events_rx.recv() => self.handle_event(event).await,

                _ = fire(&mut self.watchdog) => {
                    self.watchdog = None;
                    self.on_watchdog();
                }

                _ = fire(&mut self.next_attempt) => {
                    self.next_attempt = None;
                    self.start_attempt();
                }

                _ = fire(&mut self.stable) => {
                    self.stable = None;
                    trace!("socket stable, backoff reset");
                    self.backoff.reset();
                }

                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("all client handles dropped");
                        break;
                    }
                },
            }
        }
        self.close().await;
    }

    fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    fn update_state(&self, state: ConnectionState) {
        if *self.state_tx.borrow() == state {
            return;
        }
        info!(state = %state, "connection state changed");
        self.state_tx.send_replace(state);
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { done } => {
                let state = self.state();
                if state.is_connected() {
                    let _ = done.send(Ok(()));
                    return;
                }
                self.connect_waiters.push(done);
                // idle: never started, or the backoff budget ran out
                if state.is_disconnected() && self.next_attempt.is_none() {
                    self.backoff.reset();
                    self.start_attempt();
                }
            }
            Command::Request {
                verb,
                query,
                responder,
            } => {
                let envelope = self.requests.register(verb, query, responder);
                let id = envelope.id.unwrap_or_default();
                if !self.state().is_connected() {
                    debug!(id, "not connected, request held for replay");
                    return;
                }
                if let Err(err) = self.transmit(&envelope).await {
                    self.requests
                        .reject(id, ClientError::SendFailure(err.to_string()));
                }
            }
            Command::Subscribe {
                room,
                handler,
                done,
            } => {
                self.subscriptions.insert(room.clone(), handler);
                if self.state().is_connected() {
                    // on failure the room goes out again with the next replay
                    let _ = self.transmit(&Envelope::subscribe(room)).await;
                }
                let _ = done.send(Ok(()));
            }
        }
    }

    async fn handle_event(&mut self, event: Event) {
        if event.generation != self.generation {
            trace!(
                generation = event.generation,
                current = self.generation,
                "event from a replaced socket dropped"
            );
            return;
        }
        match event.kind {
            SocketEvent::Opened(socket) => self.on_open(socket).await,
            SocketEvent::OpenFailed(err) => {
                warn!(error = %err, "connection attempt failed");
                self.reconnect(err.to_string());
            }
            SocketEvent::Frame(text) => self.on_frame(&text).await,
            SocketEvent::Failed(err) => {
                warn!(error = %err, "socket error");
                self.reconnect(err.to_string());
            }
            SocketEvent::Closed => {
                info!("socket closed by peer");
                self.reconnect("socket closed".into());
            }
        }
    }

    /// Drops the current socket or attempt. Later events from it are stale.
    fn detach(&mut self) {
        if let Some(task) = self.socket_task.take() {
            task.abort();
        }
        self.sink = None;
        self.watchdog = None;
        self.stable = None;
        self.generation += 1;
    }

    fn start_attempt(&mut self) {
        self.detach();
        self.update_state(ConnectionState::Connecting);

        let generation = self.generation;
        let connector = self.connector.clone();
        let request = self.open_request.clone();
        let events = self.events_tx.clone();

        debug!(generation, url = %request.url, "opening socket");
        self.watchdog = Some(Box::pin(sleep(self.connect_timeout)));
        self.socket_task = Some(tokio::spawn(async move {
            let kind = match connector.open(&request).await {
                Ok(socket) => SocketEvent::Opened(socket),
                Err(err) => SocketEvent::OpenFailed(err),
            };
            let _ = events.send(Event { generation, kind });
        }));
    }

    async fn on_open(&mut self, socket: Socket) {
        self.watchdog = None;
        self.stable = Some(Box::pin(sleep(self.stable_after)));

        let Socket { sink, stream } = socket;
        self.sink = Some(sink);
        self.socket_task = Some(tokio::spawn(read_frames(
            stream,
            self.generation,
            self.events_tx.clone(),
        )));
        self.update_state(ConnectionState::Connected);

        if let Some(schema) = self.schema.clone() {
            if self.transmit(&schema).await.is_err() {
                return;
            }
        }

        let resent = self.requests.replay();
        if !resent.is_empty() {
            info!(count = resent.len(), "replaying pending requests");
        }
        for envelope in resent {
            if self.transmit(&envelope).await.is_err() {
                return;
            }
        }
        for envelope in self.subscriptions.replay() {
            if self.transmit(&envelope).await.is_err() {
                return;
            }
        }

        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
    }

    async fn on_frame(&mut self, text: &str) {
        trace!(frame = text, "frame received");
        match Frame::classify(text) {
            Ok(Frame::Heartbeat(pong)) => {
                let _ = self.send_text(pong).await;
            }
            Ok(Frame::Response(response)) => {
                let id = response.id;
                if !self.requests.resolve(response) {
                    debug!(?id, "response for unknown request dropped");
                }
            }
            Ok(Frame::Publish(publish)) => {
                self.subscriptions.dispatch(publish);
            }
            Ok(Frame::Other(value)) => trace!(%value, "frame ignored"),
            Err(err) => warn!(error = %err, "undecodable frame dropped"),
        }
    }

    fn on_watchdog(&mut self) {
        if self.state().is_connecting() {
            warn!(
                timeout_ms = self.connect_timeout.as_millis() as u64,
                "socket did not open in time"
            );
            self.reconnect("connection attempt timed out".into());
        }
    }

    fn reconnect(&mut self, reason: String) {
        if self.state().is_disconnected() {
            trace!(reason = %reason, "reconnect already in progress");
            return;
        }
        self.detach();
        self.update_state(ConnectionState::Disconnected(reason));

        match self.backoff.next_sleep() {
            Ok(delay) => {
                debug!(
                    attempt = self.backoff.attempt(),
                    delay_ms = delay.as_millis() as u64,
                    "reconnect scheduled"
                );
                self.next_attempt = Some(Box::pin(sleep(delay)));
            }
            Err(err) => self.give_up(err),
        }
    }

    fn give_up(&mut self, err: BackoffError) {
        let failed = self
            .requests
            .fail_all(|| ClientError::RetriesPolicy(err.clone()));
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(ClientError::RetriesPolicy(err.clone())));
        }
        error!(error = %err, failed, "giving up on reconnecting");
        self.update_state(ConnectionState::Disconnected(err.to_string()));
    }

    async fn transmit(&mut self, envelope: &Envelope) -> Result<()> {
        let text = envelope.encode()?;
        self.send_text(text).await
    }

    /// Writes one frame. A write failure is also reported as a socket error,
    /// which starts a reconnect.
    async fn send_text(&mut self, text: String) -> Result<()> {
        let Some(sink) = self.sink.as_mut() else {
            return Err(ClientError::ConnectionLost("not connected".into()));
        };
        trace!(frame = %text, "frame sent");
        if let Err(err) = sink.send(text).await {
            let _ = self.events_tx.send(Event {
                generation: self.generation,
                kind: SocketEvent::Failed(ClientError::ConnectionLost(err.to_string())),
            });
            return Err(err);
        }
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            let _ = sink.close().await;
        }
        self.detach();
        self.next_attempt = None;

        let failed = self.requests.fail_all(|| ClientError::Closed);
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(ClientError::Closed));
        }
        self.update_state(ConnectionState::Disconnected("client shut down".into()));
        info!(failed, "connection kernel stopped");
    }
}

/// Completes when the timer fires; never completes without a timer.
async fn fire(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer.as_mut() {
        Some(timer) => timer.await,
        None => pending().await,
    }
}

async fn read_frames(
    mut stream: FrameStream,
    generation: u64,
    events: mpsc::UnboundedSender<Event>,
) {
    let kind = loop {
        match stream.next().await {
            Some(Ok(text)) => {
                let frame = Event {
                    generation,
                    kind: SocketEvent::Frame(text),
                };
                if events.send(frame).is_err() {
                    return;
                }
            }
            Some(Err(err)) => break SocketEvent::Failed(err),
            None => break SocketEvent::Closed,
        }
    };
    let _ = events.send(Event { generation, kind });
}
