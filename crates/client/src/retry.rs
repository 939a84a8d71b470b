//! Delayed re-issue of requests the node reported as timed out.
//!
//! When a response says the node timed out (see [`is_timeout_signal`]), the
//! facade hands the call to the [`RetryScheduler`]. The scheduler waits for
//! the delay the node asked for (the digits of its `reason`, in milliseconds),
//! or the configured default, and then issues the same verb and query again.
//!
//! One worker serves the queue one job at a time. New jobs go to the front,
//! so the most recent failure is retried before older ones still waiting.
//! Every call carries a deadline fixed at its first retry; once it passes the
//! call fails with [`ClientError::RetryWindowExceeded`] instead of being
//! retried again.
//!
//! ```text
//! RES {"error":true,"reason":"retry in 1000ms"}  -> wait 1000 ms, re-issue
//! RES "request timed out"                          -> wait retry_delay_ms, re-issue
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, Instrument};

use crate::envelope::{Envelope, Query};
use crate::error::ClientError;
use crate::Result;

/// Issues a request and waits for its response envelope.
///
/// The client implements this on top of its kernel; tests substitute fakes.
#[async_trait]
pub trait Dispatch: Send + Sync + 'static {
    async fn dispatch(&self, verb: &str, query: &Query) -> Result<Envelope>;
}

/// True when the response reports a node-side timeout.
///
/// That is a string body containing `timed out`, or a body `reason` that
/// contains `timed out` or starts with `retry` (case-insensitive).
pub fn is_timeout_signal(response: &Envelope) -> bool {
    match &response.body {
        Some(Value::String(text)) => text.contains("timed out"),
        _ => response.reason().is_some_and(|reason| {
            let reason = reason.to_ascii_lowercase();
            reason.contains("timed out") || reason.starts_with("retry")
        }),
    }
}

/// Delay requested by the response: every non-digit of `reason` is dropped
/// and the rest read as milliseconds. Falls back to `default`.
pub fn retry_delay(response: &Envelope, default: Duration) -> Duration {
    response
        .reason()
        .map(|reason| reason.chars().filter(char::is_ascii_digit).collect::<String>())
        .and_then(|digits| digits.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

struct RetryJob {
    delay: Duration,
    deadline: Instant,
    verb: String,
    query: Query,
    done: oneshot::Sender<Result<Envelope>>,
}

#[derive(Default)]
struct RetryQueue {
    jobs: Mutex<VecDeque<RetryJob>>,
    notify: Notify,
}

impl RetryQueue {
    fn push_front(&self, job: RetryJob) {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_front(job);
        self.notify.notify_one();
    }

    async fn pop(&self) -> RetryJob {
        loop {
            let next = self
                .jobs
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front();
            if let Some(job) = next {
                return job;
            }
            self.notify.notified().await;
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn fail_all(&self) {
        let jobs = std::mem::take(&mut *self.jobs.lock().unwrap_or_else(PoisonError::into_inner));
        for job in jobs {
            let _ = job.done.send(Err(ClientError::Closed));
        }
    }
}

/// Front-of-queue retry worker.
pub struct RetryScheduler {
    queue: Arc<RetryQueue>,
    default_delay: Duration,
    window: Duration,
    worker: JoinHandle<()>,
}

impl RetryScheduler {
    /// Spawns the worker. It runs until `cancel` fires; jobs still queued
    /// then fail with [`ClientError::Closed`].
    pub fn spawn(
        dispatcher: Arc<dyn Dispatch>,
        default_delay: Duration,
        window: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let queue = Arc::new(RetryQueue::default());
        let worker = tokio::spawn(run(queue.clone(), dispatcher, cancel).in_current_span());
        Self {
            queue,
            default_delay,
            window,
            worker,
        }
    }

    /// Deadline for a call whose first retry starts now.
    pub fn deadline(&self) -> Instant {
        Instant::now() + self.window
    }

    /// Queues a retry of `verb`/`query` after the delay `prior` asks for and
    /// waits for the re-issued response.
    pub async fn retry(
        &self,
        prior: &Envelope,
        verb: &str,
        query: &Query,
        deadline: Instant,
    ) -> Result<Envelope> {
        let delay = retry_delay(prior, self.default_delay);
        debug!(verb, url = query.url(), delay_ms = delay.as_millis() as u64, "retry scheduled");
        let done = self.enqueue(delay, deadline, verb, query);
        done.await.unwrap_or(Err(ClientError::Closed))
    }

    fn enqueue(
        &self,
        delay: Duration,
        deadline: Instant,
        verb: &str,
        query: &Query,
    ) -> oneshot::Receiver<Result<Envelope>> {
        let (done, result) = oneshot::channel();
        self.queue.push_front(RetryJob {
            delay,
            deadline,
            verb: verb.to_owned(),
            query: query.clone(),
            done,
        });
        result
    }

    /// Jobs waiting for the worker.
    #[cfg(test)]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

impl Drop for RetryScheduler {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

async fn run(queue: Arc<RetryQueue>, dispatcher: Arc<dyn Dispatch>, cancel: CancellationToken) {
    loop {
        let job = tokio::select! {
            _ = cancel.cancelled() => break,
            job = queue.pop() => job,
        };
        if job.done.is_closed() {
            continue;
        }

        let now = Instant::now();
        if now >= job.deadline {
            let _ = job.done.send(Err(ClientError::RetryWindowExceeded));
            continue;
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = job.done.send(Err(ClientError::Closed));
                break;
            }
            _ = sleep(job.delay.min(job.deadline - now)) => {}
        }

        if Instant::now() >= job.deadline {
            debug!(verb = %job.verb, url = job.query.url(), "retry window closed before re-issue");
            let _ = job.done.send(Err(ClientError::RetryWindowExceeded));
            continue;
        }

        trace!(verb = %job.verb, url = job.query.url(), "re-issuing request");
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            let result =
                match timeout_at(job.deadline, dispatcher.dispatch(&job.verb, &job.query)).await {
                    Ok(result) => result,
                    Err(_) => Err(ClientError::RetryWindowExceeded),
                };
            let _ = job.done.send(result);
        }
        .in_current_span());
    }
    queue.fail_all();
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    /// Records every dispatch and answers from a script (last answer repeats).
    struct Scripted {
        calls: Mutex<Vec<(Instant, String)>>,
        answers: Mutex<VecDeque<Envelope>>,
        hang: bool,
    }

    impl Scripted {
        fn new(answers: Vec<Envelope>) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                answers: Mutex::new(answers.into()),
                hang: false,
            })
        }

        fn hanging() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                answers: Mutex::new(VecDeque::new()),
                hang: true,
            })
        }

        fn urls(&self) -> Vec<String> {
            self.calls.lock().unwrap().iter().map(|(_, url)| url.clone()).collect()
        }
    }

    #[async_trait]
    impl Dispatch for Scripted {
        async fn dispatch(&self, _verb: &str, query: &Query) -> Result<Envelope> {
            self.calls
                .lock()
                .unwrap()
                .push((Instant::now(), query.url().to_owned()));
            if self.hang {
                std::future::pending::<()>().await;
            }
            let mut answers = self.answers.lock().unwrap();
            let answer = if answers.len() > 1 {
                answers.pop_front()
            } else {
                answers.front().cloned()
            };
            Ok(answer.unwrap_or_else(|| Envelope::response(0, json!("ok"))))
        }
    }

    fn scheduler(dispatcher: Arc<dyn Dispatch>, window_ms: u64) -> RetryScheduler {
        RetryScheduler::spawn(
            dispatcher,
            Duration::from_millis(500),
            Duration::from_millis(window_ms),
            CancellationToken::new(),
        )
    }

    fn timed_out(reason: &str) -> Envelope {
        Envelope::response(1, json!({"error": true, "reason": reason}))
    }

    #[test]
    fn test_timeout_signal_detection() {
        assert!(is_timeout_signal(&Envelope::response(1, json!("request timed out"))));
        assert!(is_timeout_signal(&timed_out("retry in 1000ms")));
        assert!(is_timeout_signal(&timed_out("Retry later")));
        assert!(is_timeout_signal(&timed_out("upstream Timed Out")));
        assert!(!is_timeout_signal(&timed_out("forbidden")));
        assert!(!is_timeout_signal(&Envelope::response(1, json!({"error": true}))));
        assert!(!is_timeout_signal(&Envelope::response(1, json!("fine"))));
    }

    #[test]
    fn test_delay_from_reason_digits() {
        let default = Duration::from_millis(500);
        assert_eq!(
            retry_delay(&timed_out("retry in 1000ms"), default),
            Duration::from_millis(1000)
        );
        assert_eq!(retry_delay(&timed_out("retry soon"), default), default);
        assert_eq!(
            retry_delay(&Envelope::response(1, json!("timed out")), default),
            default
        );
        assert_eq!(
            retry_delay(&timed_out("retry in 99999999999999999999999ms"), default),
            default
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_waits_for_requested_delay() {
        let dispatcher = Scripted::new(vec![Envelope::response(2, json!({"name": "Ana"}))]);
        let retry = scheduler(dispatcher.clone(), 5000);

        let started = Instant::now();
        let deadline = retry.deadline();
        let response = retry
            .retry(&timed_out("retry in 1000ms"), "GET", &"/users/5".into(), deadline)
            .await
            .unwrap();

        assert_eq!(response.body, Some(json!({"name": "Ana"})));
        let calls = dispatcher.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(
            (calls[0].0 - started).as_millis(),
            1000,
            "re-issued after the delay named in the reason"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_beyond_window_fails() {
        let dispatcher = Scripted::new(vec![]);
        let retry = scheduler(dispatcher.clone(), 1000);

        let started = Instant::now();
        let err = retry
            .retry(&timed_out("retry in 3000ms"), "GET", &"/slow".into(), retry.deadline())
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::RetryWindowExceeded));
        assert_eq!((Instant::now() - started).as_millis(), 1000);
        assert!(dispatcher.urls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_reissue_is_bounded_by_window() {
        let dispatcher = Scripted::hanging();
        let retry = scheduler(dispatcher.clone(), 2000);

        let started = Instant::now();
        let err = retry
            .retry(&timed_out("retry in 100ms"), "GET", &"/slow".into(), retry.deadline())
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::RetryWindowExceeded));
        assert_eq!((Instant::now() - started).as_millis(), 2000);
        assert_eq!(dispatcher.urls(), vec!["/slow".to_owned()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_retries_run_first() {
        let dispatcher = Scripted::new(vec![]);
        let retry = scheduler(dispatcher.clone(), 60_000);
        let deadline = retry.deadline();

        let first = retry.enqueue(Duration::from_millis(100), deadline, "GET", &"/x".into());
        while retry.queued() > 0 {
            tokio::task::yield_now().await;
        }
        // the worker is now sleeping on /x
        let older = retry.enqueue(Duration::from_millis(10), deadline, "GET", &"/a".into());
        let newer = retry.enqueue(Duration::from_millis(10), deadline, "GET", &"/b".into());

        first.await.unwrap().unwrap();
        older.await.unwrap().unwrap();
        newer.await.unwrap().unwrap();
        assert_eq!(dispatcher.urls(), vec!["/x", "/b", "/a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_fails_queued_jobs() {
        let dispatcher = Scripted::new(vec![]);
        let cancel = CancellationToken::new();
        let retry = RetryScheduler::spawn(
            dispatcher.clone(),
            Duration::from_millis(500),
            Duration::from_secs(60),
            cancel.clone(),
        );

        let deadline = retry.deadline();
        let sleeping = retry.enqueue(Duration::from_secs(10), deadline, "GET", &"/a".into());
        while retry.queued() > 0 {
            tokio::task::yield_now().await;
        }
        let waiting = retry.enqueue(Duration::from_secs(10), deadline, "GET", &"/b".into());

        cancel.cancel();
        assert!(matches!(sleeping.await.unwrap(), Err(ClientError::Closed)));
        assert!(matches!(waiting.await.unwrap(), Err(ClientError::Closed)));
        assert!(dispatcher.urls().is_empty());
    }
}
