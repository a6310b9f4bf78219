//! The dispatch loop: bounded-concurrency handler execution and settlement.

use crate::connection::ConnectionState;
use crate::error::WorkerError;
use crate::handler::PayloadHandler;
use crate::message::{WorkMessage, WorkResult};
use crate::publisher::{ReplyPublisher, ReplySink};
use crate::retry::{FailureAction, FailurePolicy};
use futures_util::{FutureExt, Stream, StreamExt};
use sha2::{Digest, Sha256};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Why [`DispatchLoop::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The shutdown token was cancelled.
    Shutdown,
    /// The inbound stream ended, usually because the channel closed.
    StreamClosed,
    /// The connection left the `Connected` state.
    Disconnected,
}

/// How a single message was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    Requeued,
    DeadLettered,
    /// Rejected without requeue on a queue that has no dead-letter exchange,
    /// so the broker dropped it.
    Discarded,
    /// Settlement failed, the broker will redeliver once the channel is gone.
    Unsettled,
}

/// What the worker asks the broker to do with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Ack,
    Requeue,
    DeadLetter,
}

/// Failure handling applied to every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchRules {
    pub failure_policy: FailurePolicy,
    /// Whether the work queue routes rejected messages to a dead-letter
    /// exchange. Without one a final rejection drops the message.
    pub dead_letter: bool,
}

impl DispatchRules {
    pub fn new(failure_policy: FailurePolicy) -> Self {
        Self { failure_policy, dead_letter: true }
    }

    pub fn without_dead_letter(mut self) -> Self {
        self.dead_letter = false;
        self
    }
}

impl Default for DispatchRules {
    fn default() -> Self {
        Self::new(FailurePolicy::default())
    }
}

/// Runs the handler for every inbound message with at most
/// `max_concurrency` invocations in flight.
///
/// Handlers are entered in delivery order: the next message is only taken
/// once the previous handler has been polled for the first time.
pub struct DispatchLoop<S> {
    handler: Arc<dyn PayloadHandler>,
    publisher: Arc<ReplyPublisher<S>>,
    rules: DispatchRules,
    permits: Arc<Semaphore>,
    in_flight: JoinSet<Settlement>,
}

impl<S: ReplySink + 'static> DispatchLoop<S> {
    pub fn new(
        handler: Arc<dyn PayloadHandler>,
        publisher: Arc<ReplyPublisher<S>>,
        rules: DispatchRules,
        max_concurrency: u16,
    ) -> Self {
        Self {
            handler,
            publisher,
            rules,
            permits: Arc::new(Semaphore::new(usize::from(max_concurrency.max(1)))),
            in_flight: JoinSet::new(),
        }
    }

    /// Number of handler tasks that have not finished yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Pulls messages from `inbound` until shutdown, stream end or
    /// disconnect. In-flight work keeps running after this returns; use
    /// [`DispatchLoop::drain`] to wait for it.
    pub async fn run<I>(
        &mut self,
        mut inbound: I,
        mut connection_state: watch::Receiver<ConnectionState>,
        shutdown: &CancellationToken,
    ) -> LoopExit
    where
        I: Stream<Item = WorkMessage> + Unpin,
    {
        log::info!(target: "dispatch", "Dispatching to handler '{}'.", self.handler.handler_name());

        loop {
            self.reap();

            // Capacity first, so no message is taken off the channel that
            // cannot be started right away.
            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return LoopExit::Shutdown,
                _ = wait_disconnected(&mut connection_state) => return LoopExit::Disconnected,
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return LoopExit::Shutdown,
                },
            };

            let message = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return LoopExit::Shutdown,
                _ = wait_disconnected(&mut connection_state) => return LoopExit::Disconnected,
                next = inbound.next() => match next {
                    Some(message) => message,
                    None => return LoopExit::StreamClosed,
                },
            };

            // An aborted task drops the sender, which also ends the wait.
            let _ = self.spawn(message, permit).await;
        }
    }

    fn spawn(&mut self, message: WorkMessage, permit: OwnedSemaphorePermit) -> oneshot::Receiver<()> {
        let handler = self.handler.clone();
        let publisher = self.publisher.clone();
        let rules = self.rules;
        let (started_tx, started_rx) = oneshot::channel();

        self.in_flight.spawn(async move {
            let settlement =
                process_signalled(message, handler.as_ref(), publisher.as_ref(), rules, Some(started_tx)).await;
            drop(permit);
            settlement
        });
        started_rx
    }

    fn reap(&mut self) {
        while let Some(joined) = self.in_flight.try_join_next() {
            if let Err(e) = joined {
                log::error!(target: "dispatch", "Handler task ended abnormally: {}", e);
            }
        }
    }

    /// Waits for in-flight work up to `timeout`. Returns the number of tasks
    /// abandoned when the deadline passed; their messages stay unacknowledged
    /// and are redelivered by the broker.
    pub async fn drain(&mut self, timeout: Duration) -> usize {
        let pending = self.in_flight.len();
        if pending > 0 {
            log::info!(target: "dispatch", "Draining {} in-flight message(s)...", pending);
        }

        let in_flight = &mut self.in_flight;
        let finished = tokio::time::timeout(timeout, async {
            while let Some(joined) = in_flight.join_next().await {
                if let Err(e) = joined {
                    log::error!(target: "dispatch", "Handler task ended abnormally: {}", e);
                }
            }
        })
        .await;

        if finished.is_ok() {
            return 0;
        }

        let abandoned = self.in_flight.len();
        self.in_flight.abort_all();
        while self.in_flight.join_next().await.is_some() {}
        log::warn!(
            target: "dispatch",
            "Drain timeout of {:?} exceeded, abandoned {} in-flight message(s); the broker will redeliver them.",
            timeout, abandoned
        );
        abandoned
    }
}

async fn wait_disconnected(state: &mut watch::Receiver<ConnectionState>) {
    if state.wait_for(|s| *s != ConnectionState::Connected).await.is_err() {
        // Sender gone: the connection owner no longer reports state.
        std::future::pending::<()>().await;
    }
}

/// Handles one message end to end: invoke, reply, settle.
pub async fn process<S: ReplySink>(
    message: WorkMessage,
    handler: &dyn PayloadHandler,
    publisher: &ReplyPublisher<S>,
    rules: DispatchRules,
) -> Settlement {
    process_signalled(message, handler, publisher, rules, None).await
}

/// Like [`process`], firing `started` right after the first poll of the
/// handler future.
async fn process_signalled<S: ReplySink>(
    message: WorkMessage,
    handler: &dyn PayloadHandler,
    publisher: &ReplyPublisher<S>,
    rules: DispatchRules,
    mut started: Option<oneshot::Sender<()>>,
) -> Settlement {
    let tag = message.delivery_tag;

    let mut call = AssertUnwindSafe(handler.call(&message.payload)).catch_unwind();
    let outcome = std::future::poll_fn(|cx| {
        let polled = call.poll_unpin(cx);
        if let Some(started) = started.take() {
            let _ = started.send(());
        }
        polled
    })
    .await
    .unwrap_or_else(|_| Err(WorkerError::handler("handler panicked")));

    match outcome {
        Ok(body) => {
            let result = WorkResult::Success(body);
            match publisher
                .publish(message.reply_to.as_deref(), message.correlation_id.as_deref(), &result)
                .await
            {
                Ok(_) => settle(&message, Verdict::Ack, rules).await,
                Err(e) => {
                    log::warn!(target: "dispatch", "Reply for message {} not published, requeueing: {}", tag, e);
                    settle(&message, Verdict::Requeue, rules).await
                }
            }
        }
        Err(WorkerError::Decode(reason)) => {
            log::error!(
                target: "dispatch",
                "Malformed payload rejected. Tag: {}, sha256: {}, length: {}, error: {}",
                tag,
                payload_checksum(&message.payload),
                message.payload.len(),
                reason
            );
            settle(&message, Verdict::DeadLetter, rules).await
        }
        Err(e) => {
            log::error!(target: "dispatch", "Failed to process message. Tag: {}, Error: {}", tag, e);
            match rules.failure_policy.action(message.redelivered) {
                FailureAction::Requeue => settle(&message, Verdict::Requeue, rules).await,
                FailureAction::DeadLetter => {
                    // Final answer for the caller before the message leaves the queue.
                    let result = WorkResult::Failure(e.to_string());
                    if let Err(publish_err) = publisher
                        .publish(message.reply_to.as_deref(), message.correlation_id.as_deref(), &result)
                        .await
                    {
                        log::warn!(
                            target: "dispatch",
                            "Failure reply for message {} not published, requeueing: {}",
                            tag, publish_err
                        );
                        return settle(&message, Verdict::Requeue, rules).await;
                    }
                    settle(&message, Verdict::DeadLetter, rules).await
                }
            }
        }
    }
}

async fn settle(message: &WorkMessage, verdict: Verdict, rules: DispatchRules) -> Settlement {
    let tag = message.delivery_tag;
    let (result, settled) = match verdict {
        Verdict::Ack => (message.ack().await, Settlement::Acked),
        Verdict::Requeue => (message.reject(true).await, Settlement::Requeued),
        Verdict::DeadLetter if rules.dead_letter => (message.reject(false).await, Settlement::DeadLettered),
        Verdict::DeadLetter => {
            log::error!(
                target: "dispatch",
                "No dead-letter exchange on the work queue, message {} is discarded. sha256: {}, length: {}",
                tag,
                payload_checksum(&message.payload),
                message.payload.len()
            );
            (message.reject(false).await, Settlement::Discarded)
        }
    };

    match result {
        Ok(()) => {
            log::debug!(target: "dispatch", "Message {} settled: {:?}.", tag, settled);
            settled
        }
        Err(e) => {
            log::warn!(
                target: "dispatch",
                "Could not settle message {} ({:?}), it will be redelivered: {}",
                tag, verdict, e
            );
            Settlement::Unsettled
        }
    }
}

pub fn payload_checksum(payload: &[u8]) -> String {
    format!("{:x}", Sha256::digest(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::tests::Calculator;
    use crate::handler::JsonHandler;
    use crate::testing::{message, MemorySink, SettleLog};
    use async_trait::async_trait;
    use futures_util::stream;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn connected() -> (watch::Sender<ConnectionState>, watch::Receiver<ConnectionState>) {
        watch::channel(ConnectionState::Connected)
    }

    fn calculator_loop(sink: MemorySink, rules: DispatchRules, max: u16) -> DispatchLoop<MemorySink> {
        DispatchLoop::new(
            Arc::new(JsonHandler::new(Calculator)),
            Arc::new(ReplyPublisher::new(sink)),
            rules,
            max,
        )
    }

    #[tokio::test]
    async fn test_add_request_gets_correlated_reply_and_ack() {
        let log = Arc::new(SettleLog::default());
        let mut dispatch = calculator_loop(MemorySink::default(), DispatchRules::default(), 2);
        let inbound = stream::iter(vec![message(
            br#"{"op":"add","a":2,"b":3}"#,
            Some("caller.replies"),
            Some("corr-7"),
            1,
            false,
            &log,
        )]);
        let (_state_tx, state_rx) = connected();

        let exit = dispatch.run(inbound, state_rx, &CancellationToken::new()).await;
        assert_eq!(exit, LoopExit::StreamClosed);
        assert_eq!(dispatch.drain(Duration::from_secs(1)).await, 0);

        let sent = dispatch.publisher.sink().sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].reply_to, "caller.replies");
        assert_eq!(sent[0].correlation_id.as_deref(), Some("corr-7"));
        assert_eq!(sent[0].body, br#"{"result":5}"#.to_vec());
        assert_eq!(log.acks(), 1);
        assert_eq!(log.total(), 1);
    }

    #[tokio::test]
    async fn test_fire_and_forget_is_acked_without_reply() {
        let log = Arc::new(SettleLog::default());
        let publisher = ReplyPublisher::new(MemorySink::default());
        let handler = JsonHandler::new(Calculator);

        let settlement = process(
            message(br#"{"op":"add","a":1,"b":1}"#, None, Some("c"), 3, false, &log),
            &handler,
            &publisher,
            DispatchRules::default(),
        )
        .await;

        assert_eq!(settlement, Settlement::Acked);
        assert!(publisher.sink().sent().is_empty());
        assert_eq!(log.acks(), 1);
    }

    #[tokio::test]
    async fn test_malformed_payload_dead_lettered_without_reply() {
        let log = Arc::new(SettleLog::default());
        let publisher = ReplyPublisher::new(MemorySink::default());
        let handler = JsonHandler::new(Calculator);

        let settlement = process(
            message(b"\x00\x01not json", Some("replies"), Some("c"), 4, false, &log),
            &handler,
            &publisher,
            DispatchRules::default(),
        )
        .await;

        assert_eq!(settlement, Settlement::DeadLettered);
        assert!(publisher.sink().sent().is_empty());
        assert_eq!(log.dead_lettered(), 1);
        assert_eq!(log.requeued(), 0);
        assert_eq!(log.acks(), 0);
    }

    #[tokio::test]
    async fn test_handler_failure_requeued_once_then_dead_lettered() {
        let log = Arc::new(SettleLog::default());
        let publisher = ReplyPublisher::new(MemorySink::default());
        let handler = JsonHandler::new(Calculator);
        let payload = br#"{"op":"div","a":1,"b":0}"#;

        let first = process(
            message(payload, Some("replies"), Some("c"), 5, false, &log),
            &handler,
            &publisher,
            DispatchRules::default(),
        )
        .await;
        assert_eq!(first, Settlement::Requeued);
        assert!(publisher.sink().sent().is_empty());

        let second = process(
            message(payload, Some("replies"), Some("c"), 6, true, &log),
            &handler,
            &publisher,
            DispatchRules::default(),
        )
        .await;
        assert_eq!(second, Settlement::DeadLettered);

        let sent = publisher.sink().sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].is_error);
        assert_eq!(log.requeued(), 1);
        assert_eq!(log.dead_lettered(), 1);
        assert_eq!(log.acks(), 0);
    }

    #[tokio::test]
    async fn test_dead_letter_policy_skips_requeue() {
        let log = Arc::new(SettleLog::default());
        let publisher = ReplyPublisher::new(MemorySink::default());
        let handler = JsonHandler::new(Calculator);

        let settlement = process(
            message(br#"{"op":"div","a":1,"b":0}"#, None, None, 8, false, &log),
            &handler,
            &publisher,
            DispatchRules::new(FailurePolicy::DeadLetter),
        )
        .await;

        assert_eq!(settlement, Settlement::DeadLettered);
        assert_eq!(log.requeued(), 0);
    }

    #[tokio::test]
    async fn test_final_rejection_without_dead_letter_exchange_is_discarded() {
        let log = Arc::new(SettleLog::default());
        let publisher = ReplyPublisher::new(MemorySink::default());
        let handler = JsonHandler::new(Calculator);
        let rules = DispatchRules::default().without_dead_letter();

        let malformed = process(
            message(b"{\"op\":", Some("replies"), Some("c"), 11, false, &log),
            &handler,
            &publisher,
            rules,
        )
        .await;
        assert_eq!(malformed, Settlement::Discarded);

        let failed = process(
            message(br#"{"op":"div","a":1,"b":0}"#, Some("replies"), Some("c"), 12, true, &log),
            &handler,
            &publisher,
            rules,
        )
        .await;
        assert_eq!(failed, Settlement::Discarded);

        // The caller still gets the terminal failure document.
        let sent = publisher.sink().sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].is_error);
        assert_eq!(log.dead_lettered(), 2);
        assert_eq!(log.acks(), 0);
    }

    #[tokio::test]
    async fn test_publish_failure_never_acks() {
        let log = Arc::new(SettleLog::default());
        let publisher = ReplyPublisher::new(MemorySink::failing());
        let handler = JsonHandler::new(Calculator);

        let settlement = process(
            message(br#"{"op":"add","a":2,"b":3}"#, Some("replies"), Some("c"), 9, false, &log),
            &handler,
            &publisher,
            DispatchRules::default(),
        )
        .await;

        assert_eq!(settlement, Settlement::Requeued);
        assert_eq!(log.acks(), 0);
        assert_eq!(log.requeued(), 1);
    }

    struct Panicky;

    #[async_trait]
    impl PayloadHandler for Panicky {
        async fn call(&self, _payload: &[u8]) -> Result<Vec<u8>, WorkerError> {
            panic!("handler bug");
        }
    }

    #[tokio::test]
    async fn test_panicking_handler_is_a_handler_failure() {
        let log = Arc::new(SettleLog::default());
        let publisher = ReplyPublisher::new(MemorySink::default());

        let settlement = process(
            message(b"{}", Some("replies"), Some("c"), 10, false, &log),
            &Panicky,
            &publisher,
            DispatchRules::default(),
        )
        .await;

        assert_eq!(settlement, Settlement::Requeued);
    }

    /// Records the highest number of simultaneous invocations.
    struct Gauge {
        current: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl Gauge {
        fn new(delay: Duration) -> Self {
            Self {
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
                delay,
            }
        }
    }

    #[async_trait]
    impl PayloadHandler for Gauge {
        async fn call(&self, payload: &[u8]) -> Result<Vec<u8>, WorkerError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(payload.to_vec())
        }
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_limit() {
        let log = Arc::new(SettleLog::default());
        let gauge = Arc::new(Gauge::new(Duration::from_millis(15)));
        let mut dispatch = DispatchLoop::new(
            gauge.clone(),
            Arc::new(ReplyPublisher::new(MemorySink::default())),
            DispatchRules::default(),
            3,
        );
        let burst: Vec<_> = (0..25)
            .map(|i| message(b"x", Some("replies"), Some("c"), i, false, &log))
            .collect();
        let (_state_tx, state_rx) = connected();

        dispatch.run(stream::iter(burst), state_rx, &CancellationToken::new()).await;
        assert!(dispatch.in_flight() <= 3);
        assert_eq!(dispatch.drain(Duration::from_secs(5)).await, 0);

        assert_eq!(gauge.calls.load(Ordering::SeqCst), 25);
        assert_eq!(gauge.peak.load(Ordering::SeqCst), 3);
        assert_eq!(log.acks(), 25);
        assert_eq!(dispatch.publisher.sink().sent().len(), 25);
    }

    #[tokio::test]
    async fn test_shutdown_stops_intake() {
        let log = Arc::new(SettleLog::default());
        let gauge = Arc::new(Gauge::new(Duration::from_millis(1)));
        let mut dispatch = DispatchLoop::new(
            gauge.clone(),
            Arc::new(ReplyPublisher::new(MemorySink::default())),
            DispatchRules::default(),
            4,
        );
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let (_state_tx, state_rx) = connected();

        let inbound = stream::iter(vec![message(b"x", None, None, 1, false, &log)]);
        let exit = dispatch.run(inbound, state_rx, &shutdown).await;

        assert_eq!(exit, LoopExit::Shutdown);
        assert_eq!(dispatch.drain(Duration::from_millis(50)).await, 0);
        assert_eq!(gauge.calls.load(Ordering::SeqCst), 0);
        assert_eq!(log.total(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_pauses_intake() {
        let log = Arc::new(SettleLog::default());
        let mut dispatch = calculator_loop(MemorySink::default(), DispatchRules::default(), 1);
        let (state_tx, state_rx) = connected();
        state_tx.send_replace(ConnectionState::Disconnected);

        let inbound = stream::pending::<WorkMessage>();
        let exit = dispatch.run(inbound, state_rx, &CancellationToken::new()).await;

        assert_eq!(exit, LoopExit::Disconnected);
        assert_eq!(log.total(), 0);
    }

    #[tokio::test]
    async fn test_drain_timeout_abandons_slow_work() {
        let log = Arc::new(SettleLog::default());
        let mut dispatch = DispatchLoop::new(
            Arc::new(Gauge::new(Duration::from_secs(60))),
            Arc::new(ReplyPublisher::new(MemorySink::default())),
            DispatchRules::default(),
            3,
        );
        let (_state_tx, state_rx) = connected();
        let inbound = stream::iter(vec![
            message(b"a", Some("r"), Some("1"), 1, false, &log),
            message(b"b", Some("r"), Some("2"), 2, false, &log),
        ]);

        dispatch.run(inbound, state_rx, &CancellationToken::new()).await;
        let abandoned = dispatch.drain(Duration::from_millis(30)).await;

        assert_eq!(abandoned, 2);
        assert_eq!(dispatch.in_flight(), 0);
        assert_eq!(log.total(), 0);
    }

    /// Records the first payload byte of each invocation as it is entered.
    #[derive(Default)]
    struct EntryOrder {
        entered: std::sync::Mutex<Vec<u8>>,
    }

    #[async_trait]
    impl PayloadHandler for EntryOrder {
        async fn call(&self, payload: &[u8]) -> Result<Vec<u8>, WorkerError> {
            self.entered.lock().unwrap().push(payload[0]);
            tokio::task::yield_now().await;
            Ok(Vec::new())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_handlers_entered_in_delivery_order_across_threads() {
        for _ in 0..200 {
            let log = Arc::new(SettleLog::default());
            let order = Arc::new(EntryOrder::default());
            let mut dispatch = DispatchLoop::new(
                order.clone(),
                Arc::new(ReplyPublisher::new(MemorySink::default())),
                DispatchRules::default(),
                16,
            );
            let burst: Vec<_> = (0..16u8)
                .map(|i| message(&[i], None, None, u64::from(i), false, &log))
                .collect();
            let (_state_tx, state_rx) = connected();

            dispatch.run(stream::iter(burst), state_rx, &CancellationToken::new()).await;
            assert_eq!(dispatch.drain(Duration::from_secs(5)).await, 0);

            assert_eq!(*order.entered.lock().unwrap(), (0..16u8).collect::<Vec<_>>());
            assert_eq!(log.acks(), 16);
        }
    }

    #[test]
    fn test_checksum_is_sha256_hex() {
        assert_eq!(
            payload_checksum(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
