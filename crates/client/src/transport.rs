//! Socket seam between the connection kernel and the network.
//!
//! The kernel never touches WebSocket types. It asks a [`Connector`] to open a
//! [`Socket`], which is a sink of outgoing text frames plus a stream of
//! incoming ones. The stream ending means the socket closed; an `Err` item
//! means it failed. Either way the kernel reconnects.
//!
//! [`WsConnector`] is the production implementation on `tokio-tungstenite`.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{future, Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::Message;
use tracing::trace;

use crate::error::ClientError;
use crate::Result;

pub type FrameSink = Pin<Box<dyn Sink<String, Error = ClientError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// One open socket, split into its write and read halves.
pub struct Socket {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Where to connect and with which credentials.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenRequest {
    pub url: String,
    /// Sent as `Authorization: bearer <token>`.
    pub bearer: Option<String>,
}

/// Opens sockets for the connection kernel.
///
/// One call per attempt. The kernel enforces the attempt watchdog, so an
/// implementation may take as long as it likes.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self, request: &OpenRequest) -> Result<Socket>;
}

/// WebSocket connector. Text frames carry the protocol; binary frames are
/// decoded as UTF-8 when possible, control frames are left to tungstenite.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, request: &OpenRequest) -> Result<Socket> {
        let mut http = request.url.as_str().into_client_request()?;
        if let Some(token) = &request.bearer {
            http.headers_mut()
                .insert(AUTHORIZATION, HeaderValue::from_str(&format!("bearer {token}"))?);
        }

        let (ws, response) = connect_async(http).await?;
        trace!(status = %response.status(), url = %request.url, "websocket handshake complete");

        let (sink, stream) = ws.split();
        let sink = sink.with(|text: String| future::ready(Ok::<_, ClientError>(Message::text(text))));
        let stream = stream.filter_map(|message| {
            future::ready(match message {
                Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                Ok(Message::Binary(bytes)) => String::from_utf8(bytes.to_vec()).ok().map(Ok),
                Ok(_) => None,
                Err(err) => Some(Err(ClientError::from(err))),
            })
        });

        Ok(Socket {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

/// In-memory connector for kernel tests: every accepted open hands the test a
/// [`memory::Peer`] standing in for the server side.
#[cfg(test)]
pub(crate) mod memory {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use futures_util::{sink, stream};
    use tokio::sync::mpsc;

    use super::*;

    /// How the next open attempt behaves.
    #[derive(Debug, Clone, Copy, PartialEq)]
    pub enum Behaviour {
        Accept,
        Refuse,
        /// Never completes; only the kernel watchdog ends it.
        Hang,
    }

    /// Server side of one in-memory socket.
    pub struct Peer {
        pub request: OpenRequest,
        received: mpsc::UnboundedReceiver<String>,
        outgoing: Option<mpsc::UnboundedSender<Result<String>>>,
    }

    impl Peer {
        /// Next frame written by the client, decoded as JSON.
        pub async fn recv(&mut self) -> Option<serde_json::Value> {
            let text = self.received.recv().await?;
            serde_json::from_str(&text).ok()
        }

        pub fn send(&self, frame: serde_json::Value) {
            if let Some(outgoing) = &self.outgoing {
                let _ = outgoing.send(Ok(frame.to_string()));
            }
        }

        pub fn send_raw(&self, text: &str) {
            if let Some(outgoing) = &self.outgoing {
                let _ = outgoing.send(Ok(text.to_owned()));
            }
        }

        pub fn fail(&self, reason: &str) {
            if let Some(outgoing) = &self.outgoing {
                let _ = outgoing.send(Err(ClientError::ConnectionLost(reason.to_owned())));
            }
        }

        /// Ends the client's incoming stream.
        pub fn close(&mut self) {
            self.outgoing = None;
        }

        /// Makes every further client write fail while the stream stays open.
        pub fn stop_reading(&mut self) {
            self.received.close();
        }
    }

    pub struct MemoryConnector {
        peers: mpsc::UnboundedSender<Peer>,
        plan: Mutex<VecDeque<Behaviour>>,
    }

    impl MemoryConnector {
        pub fn new() -> (Self, mpsc::UnboundedReceiver<Peer>) {
            let (peers, accepted) = mpsc::unbounded_channel();
            let connector = Self {
                peers,
                plan: Mutex::new(VecDeque::new()),
            };
            (connector, accepted)
        }

        /// Queues behaviours for the next attempts. Unplanned attempts accept.
        pub fn plan(self, behaviours: impl IntoIterator<Item = Behaviour>) -> Self {
            if let Ok(mut plan) = self.plan.lock() {
                plan.extend(behaviours);
            }
            self
        }

        fn next_behaviour(&self) -> Behaviour {
            self.plan
                .lock()
                .ok()
                .and_then(|mut plan| plan.pop_front())
                .unwrap_or(Behaviour::Accept)
        }
    }

    #[async_trait]
    impl Connector for MemoryConnector {
        async fn open(&self, request: &OpenRequest) -> Result<Socket> {
            match self.next_behaviour() {
                Behaviour::Refuse => {
                    return Err(ClientError::ConnectionLost("connection refused".into()))
                }
                Behaviour::Hang => future::pending::<()>().await,
                Behaviour::Accept => {}
            }

            let (to_peer, received) = mpsc::unbounded_channel::<String>();
            let (outgoing, from_peer) = mpsc::unbounded_channel::<Result<String>>();

            let sink = sink::unfold(to_peer, |to_peer, text: String| async move {
                to_peer
                    .send(text)
                    .map_err(|_| ClientError::ConnectionLost("peer gone".into()))?;
                Ok::<_, ClientError>(to_peer)
            });
            let stream = stream::unfold(from_peer, |mut from_peer| async move {
                from_peer.recv().await.map(|item| (item, from_peer))
            });

            let peer = Peer {
                request: request.clone(),
                received,
                outgoing: Some(outgoing),
            };
            self.peers
                .send(peer)
                .map_err(|_| ClientError::ConnectionLost("test harness gone".into()))?;

            Ok(Socket {
                sink: Box::pin(sink),
                stream: Box::pin(stream),
            })
        }
    }
}
