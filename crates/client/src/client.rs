//! Public client handle.
//!
//! [`Client`] is a cheap, cloneable handle on one connection kernel. Building
//! it spawns the kernel and the retry worker on the current tokio runtime;
//! they stop when [`Client::shutdown`] is called or the last handle is dropped.
//!
//! # Examples
//!
//! ```ignore
//! use tether_client::{Client, ClientConfig, Query};
//!
//! let client = Client::new(ClientConfig::new("ws://127.0.0.1:3000"))?;
//!
//! client.subscribe("orders", |data| println!("order event: {data}")).await?;
//!
//! let user = client.request("GET", "/users/5").await?;
//! let created = client
//!     .request("POST", Query::with_body("/users", serde_json::json!({"name": "Ana"})))
//!     .await?;
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, instrument, Instrument};
use validator::Validate;

use crate::config::ClientConfig;
use crate::connection::{Command, ConnectionKernel};
use crate::envelope::{Envelope, Query};
use crate::error::{ClientError, RemoteError};
use crate::retry::{is_timeout_signal, Dispatch, RetryScheduler};
use crate::state::ConnectionState;
use crate::transport::{Connector, WsConnector};
use crate::Result;

/// Configures and starts a [`Client`].
pub struct ClientBuilder {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
}

impl ClientBuilder {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            connector: Arc::new(WsConnector),
        }
    }

    /// Replaces the WebSocket connector.
    pub fn connector(mut self, connector: impl Connector) -> Self {
        self.connector = Arc::new(connector);
        self
    }

    /// Validates the configuration and spawns the kernel and retry worker.
    ///
    /// Must be called from within a tokio runtime. No socket is opened until
    /// the first `connect` or `request`.
    pub fn build(self) -> Result<Client> {
        self.config.validate()?;

        let cancel = CancellationToken::new();
        let (commands, commands_rx) = mpsc::channel(self.config.command_channel_capacity);
        let (state_tx, state) = watch::channel(ConnectionState::default());
        let span = info_span!("tether", client_id = %self.config.client_id);

        let kernel = ConnectionKernel::new(
            &self.config,
            self.connector,
            commands_rx,
            state_tx,
            cancel.clone(),
        );
        let kernel = tokio::spawn(kernel.run().instrument(span.clone()));

        let dispatch = KernelDispatch { commands };
        let retry = span.in_scope(|| {
            RetryScheduler::spawn(
                Arc::new(dispatch.clone()),
                self.config.retry_delay(),
                self.config.retry_window(),
                cancel.clone(),
            )
        });

        Ok(Client {
            inner: Arc::new(Inner {
                client_id: self.config.client_id,
                dispatch,
                state,
                retry,
                cancel,
                kernel: Mutex::new(Some(kernel)),
            }),
        })
    }
}

/// Command-channel side of the kernel.
#[derive(Clone)]
struct KernelDispatch {
    commands: mpsc::Sender<Command>,
}

impl KernelDispatch {
    async fn command(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ClientError::Closed)
    }

    async fn connect(&self) -> Result<()> {
        let (done, result) = oneshot::channel();
        self.command(Command::Connect { done }).await?;
        result.await.unwrap_or(Err(ClientError::Closed))
    }

    async fn send(&self, verb: &str, query: Query) -> Result<Envelope> {
        let (responder, result) = oneshot::channel();
        self.command(Command::Request {
            verb: verb.to_owned(),
            query,
            responder,
        })
        .await?;
        result.await.unwrap_or(Err(ClientError::Closed))
    }
}

#[async_trait]
impl Dispatch for KernelDispatch {
    async fn dispatch(&self, verb: &str, query: &Query) -> Result<Envelope> {
        self.connect().await?;
        self.send(verb, query.clone()).await
    }
}

struct Inner {
    client_id: String,
    dispatch: KernelDispatch,
    state: watch::Receiver<ConnectionState>,
    retry: RetryScheduler,
    cancel: CancellationToken,
    kernel: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Handle on a resilient request/subscribe connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    /// Builds a client on the WebSocket connector.
    pub fn new(config: ClientConfig) -> Result<Self> {
        ClientBuilder::new(config).build()
    }

    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder::new(config)
    }

    /// Completes once the socket is open.
    ///
    /// Concurrent calls share one attempt; calls while connected return at
    /// once. Fails only when the reconnect budget runs out or the client is
    /// shut down.
    pub async fn connect(&self) -> Result<()> {
        self.inner.dispatch.connect().await
    }

    /// Sends one request and returns the full response envelope.
    ///
    /// Does not connect: a request issued while disconnected waits for the
    /// next open. No error check is applied to the response.
    pub async fn send(&self, verb: &str, query: impl Into<Query>) -> Result<Envelope> {
        self.inner.dispatch.send(verb, query.into()).await
    }

    /// Connects if needed, sends the request and checks the response.
    ///
    /// - A node timeout (see [`is_timeout_signal`]) is retried after the
    ///   delay the node asked for, within the configured retry window.
    /// - A body with a truthy `error` fails with [`ClientError::Remote`].
    /// - Otherwise the body is returned (`Value::Null` when absent).
    #[instrument(level = "debug", skip_all, fields(client_id = %self.inner.client_id, verb = %verb))]
    pub async fn request(&self, verb: &str, query: impl Into<Query>) -> Result<Value> {
        let query = query.into();
        let response = self.inner.dispatch.dispatch(verb, &query).await?;
        self.check(response, verb, &query).await
    }

    async fn check(&self, mut response: Envelope, verb: &str, query: &Query) -> Result<Value> {
        let mut deadline = None;
        loop {
            if is_timeout_signal(&response) {
                let until = *deadline.get_or_insert_with(|| self.inner.retry.deadline());
                debug!(id = ?response.id, url = query.url(), "node timed out, retrying");
                response = self.inner.retry.retry(&response, verb, query, until).await?;
                continue;
            }
            if response.is_error() {
                return Err(ClientError::Remote(RemoteError { envelope: response }));
            }
            return Ok(response.body.unwrap_or(Value::Null));
        }
    }

    /// Registers `handler` for the `PUBLISH` messages of `room` and joins it.
    ///
    /// Allowed before connecting; the room is joined on every open. A second
    /// subscription to the same room replaces the handler.
    pub async fn subscribe<F>(&self, room: impl Into<String>, handler: F) -> Result<()>
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        let (done, result) = oneshot::channel();
        self.inner
            .dispatch
            .command(Command::Subscribe {
                room: room.into(),
                handler: Arc::new(handler),
                done,
            })
            .await?;
        result.await.unwrap_or(Err(ClientError::Closed))
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    /// Watch receiver that sees every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.clone()
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// Stops the kernel and the retry worker. Pending requests fail with
    /// [`ClientError::Closed`]. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        if let Some(kernel) = self.inner.kernel.lock().await.take() {
            let _ = kernel.await;
        }
    }
}
