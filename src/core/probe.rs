//! Probe runner.
//!
//! A `Probe` drives one [`Client`] through the configured workload: connect,
//! join every room with a logging handler, then issue the request list once
//! or on a fixed interval. Failed requests are logged and counted; they never
//! stop the run.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use tether_client::Client;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::probe::{ProbeConfig, ProbeRequest};

/// Counters shared with the room handlers.
#[derive(Debug, Default)]
pub struct ProbeStats {
    room_events: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

impl ProbeStats {
    pub fn room_events(&self) -> u64 {
        self.room_events.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Outcome of one pass over the request list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundReport {
    pub succeeded: usize,
    pub failed: usize,
}

pub struct Probe {
    client: Client,
    config: ProbeConfig,
    stats: Arc<ProbeStats>,
}

impl Probe {
    pub fn new(client: Client, config: ProbeConfig) -> Self {
        Self {
            client,
            config,
            stats: Arc::new(ProbeStats::default()),
        }
    }

    pub fn stats(&self) -> &ProbeStats {
        &self.stats
    }

    /// Connects, joins the rooms and runs the request rounds.
    ///
    /// With `interval_secs = 0` this returns after one round. Otherwise it
    /// only returns on a connect or subscribe failure.
    ///
    /// # Errors
    ///
    /// Returns the client error when the first connect gives up or a room
    /// cannot be joined.
    pub async fn run(&self) -> tether_client::Result<()> {
        info!(client_id = %self.client.client_id(), "Connecting...");
        self.client.connect().await?;
        info!("Connected");

        self.join_rooms().await?;

        if self.config.interval_secs == 0 {
            let report = self.round().await;
            info!(
                succeeded = report.succeeded,
                failed = report.failed,
                "Probe round complete"
            );
            return Ok(());
        }

        let mut ticker = time::interval(Duration::from_secs(self.config.interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "Probe rounds started (interval: {}s, {} requests)",
            self.config.interval_secs,
            self.config.requests.len()
        );

        loop {
            ticker.tick().await;
            let report = self.round().await;
            info!(
                succeeded = report.succeeded,
                failed = report.failed,
                total_succeeded = self.stats.succeeded(),
                total_failed = self.stats.failed(),
                "Probe round complete"
            );
        }
    }

    /// Subscribes to every configured room. Each event is logged and counted.
    pub async fn join_rooms(&self) -> tether_client::Result<()> {
        for room in &self.config.rooms {
            let stats = Arc::clone(&self.stats);
            let name = room.clone();
            self.client
                .subscribe(room.as_str(), move |data| {
                    stats.room_events.fetch_add(1, Ordering::Relaxed);
                    info!(room = %name, %data, "Room event");
                })
                .await?;
            debug!(room = %room, "Joined room");
        }
        Ok(())
    }

    /// Issues every configured request in order.
    pub async fn round(&self) -> RoundReport {
        let mut report = RoundReport::default();
        for request in &self.config.requests {
            if self.issue(request).await {
                report.succeeded += 1;
            } else {
                report.failed += 1;
            }
        }
        report
    }

    async fn issue(&self, request: &ProbeRequest) -> bool {
        let start = Instant::now();
        match self.client.request(&request.verb, request.query()).await {
            Ok(body) => {
                self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
                info!(
                    verb = %request.verb,
                    url = %request.url,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    %body,
                    "Request succeeded"
                );
                true
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    verb = %request.verb,
                    url = %request.url,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    error = %e,
                    "Request failed"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use futures_util::{sink, stream};
    use serde_json::json;
    use tether_client::{
        Action, ClientConfig, ClientError, Connector, Envelope, OpenRequest, Socket,
    };
    use tokio::sync::mpsc;
    use tracing_test::traced_test;

    use super::*;

    /// Answers every request with its url, `/fail` with an error body, and
    /// publishes one event into each room as soon as it is joined.
    struct FakeNode;

    fn answer(request: &Envelope) -> Option<Envelope> {
        let id = request.id?;
        let url = request.url.clone().unwrap_or_default();
        let body = if url == "/fail" {
            json!({ "error": true, "reason": "not found" })
        } else {
            json!({ "url": url })
        };
        Some(Envelope::response(id, body))
    }

    #[async_trait]
    impl Connector for FakeNode {
        async fn open(&self, _request: &OpenRequest) -> tether_client::Result<Socket> {
            let (to_node, mut inbox) = mpsc::unbounded_channel::<String>();
            let (outbox, from_node) = mpsc::unbounded_channel::<String>();

            tokio::spawn(async move {
                while let Some(text) = inbox.recv().await {
                    let Ok(frame) = Envelope::decode(&text) else {
                        continue;
                    };
                    let reply = match &frame.action {
                        Action::Subscribe => frame
                            .room
                            .clone()
                            .map(|room| Envelope::publish(room.clone(), json!({ "joined": room }))),
                        Action::Verb(_) => answer(&frame),
                        _ => None,
                    };
                    if let Some(reply) = reply {
                        if outbox.send(reply.encode().unwrap()).is_err() {
                            break;
                        }
                    }
                }
            });

            let sink = sink::unfold(to_node, |to_node, text: String| async move {
                to_node
                    .send(text)
                    .map_err(|_| ClientError::ConnectionLost("node gone".into()))?;
                Ok::<_, ClientError>(to_node)
            });
            let stream = stream::unfold(from_node, |mut from_node| async move {
                from_node.recv().await.map(|text| (Ok(text), from_node))
            });

            Ok(Socket {
                sink: Box::pin(sink),
                stream: Box::pin(stream),
            })
        }
    }

    struct DeadNode;

    #[async_trait]
    impl Connector for DeadNode {
        async fn open(&self, _request: &OpenRequest) -> tether_client::Result<Socket> {
            Err(ClientError::ConnectionLost("connection refused".into()))
        }
    }

    fn request(verb: &str, url: &str) -> ProbeRequest {
        ProbeRequest {
            verb: verb.into(),
            url: url.into(),
            body: None,
        }
    }

    fn probe(connector: impl Connector, config: ProbeConfig) -> Probe {
        let client = Client::builder(ClientConfig::default())
            .connector(connector)
            .build()
            .unwrap();
        Probe::new(client, config)
    }

    #[tokio::test]
    async fn test_single_round_counts_results_and_room_events() {
        let probe = probe(
            FakeNode,
            ProbeConfig {
                rooms: vec!["room-a".into(), "room-b".into()],
                requests: vec![request("GET", "/users/5"), request("GET", "/fail")],
                interval_secs: 0,
            },
        );

        probe.run().await.unwrap();

        assert_eq!(probe.stats().succeeded(), 1);
        assert_eq!(probe.stats().failed(), 1);
        // Publishes are dispatched before the later responses resolve.
        assert_eq!(probe.stats().room_events(), 2);
        probe.client.shutdown().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn test_failed_request_is_logged_and_run_continues() {
        let probe = probe(
            FakeNode,
            ProbeConfig {
                requests: vec![request("DELETE", "/fail"), request("GET", "/users/5")],
                ..ProbeConfig::default()
            },
        );

        probe.run().await.unwrap();

        assert_eq!(probe.stats().failed(), 1);
        assert_eq!(probe.stats().succeeded(), 1);
        assert!(logs_contain("Request failed"));
        assert!(logs_contain("not found"));
        probe.client.shutdown().await;
    }

    #[tokio::test]
    async fn test_round_report() {
        let probe = probe(
            FakeNode,
            ProbeConfig {
                requests: vec![
                    request("GET", "/a"),
                    request("GET", "/fail"),
                    request("POST", "/b"),
                ],
                ..ProbeConfig::default()
            },
        );

        let report = probe.round().await;
        assert_eq!(
            report,
            RoundReport {
                succeeded: 2,
                failed: 1
            }
        );
        probe.client.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_repeats_rounds() {
        let probe = Arc::new(probe(
            FakeNode,
            ProbeConfig {
                requests: vec![request("GET", "/users/5")],
                interval_secs: 10,
                ..ProbeConfig::default()
            },
        ));

        let runner = {
            let probe = Arc::clone(&probe);
            tokio::spawn(async move { probe.run().await })
        };

        time::sleep(Duration::from_secs(25)).await;
        assert!(probe.stats().succeeded() >= 2);
        assert!(!runner.is_finished());

        runner.abort();
        probe.client.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_ends_run() {
        let client = Client::builder(ClientConfig {
            max_reconnect_attempts: 1,
            ..ClientConfig::default()
        })
        .connector(DeadNode)
        .build()
        .unwrap();
        let probe = Probe::new(client, ProbeConfig::default());

        assert!(probe.run().await.is_err());
        assert_eq!(probe.stats().succeeded(), 0);
        probe.client.shutdown().await;
    }
}
