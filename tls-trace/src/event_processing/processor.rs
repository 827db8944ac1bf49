//! Event Processor Implementation
//!
//! Owns the bounded event queue, the connection tracker and the sink.
//! Producers call `write` from any task; a single `serve` loop consumes the
//! queue so per-connection order is the order of writes. `close` stops
//! intake, drains, flushes every connection and closes the sink.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info, warn};
use tls_trace_common::SslDataEvent;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::{mpsc, watch, OnceCell};
use tokio::time::{Duration, Instant, MissedTickBehavior};

use crate::configuration::Configuration;
use crate::errors::{Result, TlsTraceError};
use crate::event_processing::tracker::{CloseReason, ConnectionTracker, TrackerOutput};
use crate::output_strategy::{create_sink, Sink};
use crate::stats::{ProcessorStats, StatsSnapshot};

type EventQueue = mpsc::Receiver<Box<SslDataEvent>>;
type Outcome = watch::Sender<Option<Result<()>>>;

/// Floor for the idle sweep period; a zero period cannot drive an interval.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    Created,
    Serving,
    Closing,
    Closed,
}

impl ProcessorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessorState::Created => "created",
            ProcessorState::Serving => "serving",
            ProcessorState::Closing => "closing",
            ProcessorState::Closed => "closed",
        }
    }
}

impl std::fmt::Display for ProcessorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

struct Lifecycle {
    state: ProcessorState,
    serve_started: bool,
    sender: Option<mpsc::Sender<Box<SslDataEvent>>>,
    receiver: Option<EventQueue>,
    pipeline: Option<Pipeline>,
}

/// Tracker plus sink, owned by whichever task drains the queue.
struct Pipeline {
    tracker: ConnectionTracker,
    sink: Box<dyn Sink>,
    stats: Arc<ProcessorStats>,
    first_error: Option<TlsTraceError>,
}

impl Pipeline {
    fn handle(&mut self, event: &SslDataEvent, now: Instant) {
        self.stats.record_processed();
        match self.tracker.dispatch(event, now) {
            Ok(outputs) => self.forward(outputs),
            Err(error) if error.is_malformed() => {
                self.stats.record_malformed();
                warn!("dropping event: {}", error);
            }
            Err(error) => self.record_error(error),
        }
        self.stats
            .set_connections_opened(self.tracker.connections_opened());
    }

    fn sweep(&mut self, now: Instant) {
        let outputs = self.tracker.evict_idle(now);
        if !outputs.is_empty() {
            debug!("idle sweep produced {} outputs", outputs.len());
        }
        self.forward(outputs);
    }

    fn forward(&mut self, outputs: Vec<TrackerOutput>) {
        for output in outputs {
            let result = match &output {
                TrackerOutput::Record(record) => {
                    let result = self.sink.emit(record);
                    if result.is_ok() {
                        self.stats.record_emitted(record.unit.len());
                    }
                    result
                }
                TrackerOutput::Closed(info) => {
                    self.stats.record_closed(info.reason == CloseReason::Idle);
                    self.sink.connection_closed(info)
                }
            };

            if let Err(error) = result {
                self.stats.record_sink_error();
                self.record_error(error);
            }
        }
    }

    fn record_error(&mut self, error: TlsTraceError) {
        warn!("{}", error);
        self.first_error.get_or_insert(error);
    }

    /// Flush every connection and close the sink, returning the first error
    /// seen over the whole run.
    fn finish(mut self) -> Result<()> {
        let outputs = self.tracker.flush_all();
        self.forward(outputs);
        if let Err(error) = self.sink.close() {
            self.record_error(error);
        }

        match self.stats.snapshot().to_json() {
            Ok(summary) => info!("processing summary: {}", summary),
            Err(e) => warn!("failed to serialize processing summary: {}", e),
        }

        match self.first_error.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

pub struct EventProcessor {
    config: Configuration,
    lifecycle: Arc<Mutex<Lifecycle>>,
    finished: Arc<Outcome>,
    close_outcome: OnceCell<Result<()>>,
    stats: Arc<ProcessorStats>,
}

impl EventProcessor {
    /// Create a processor writing to the sink selected by the configuration.
    pub fn new(config: Configuration) -> Self {
        let sink = create_sink(&config);
        Self::with_sink(config, sink)
    }

    pub fn with_sink(config: Configuration, sink: Box<dyn Sink>) -> Self {
        let (sender, receiver) = mpsc::channel(config.pipeline.queue_capacity.max(1));
        let stats = Arc::new(ProcessorStats::new());
        let pipeline = Pipeline {
            tracker: ConnectionTracker::new(&config.tracking),
            sink,
            stats: stats.clone(),
            first_error: None,
        };
        let (finished, _) = watch::channel(None);

        Self {
            config,
            lifecycle: Arc::new(Mutex::new(Lifecycle {
                state: ProcessorState::Created,
                serve_started: false,
                sender: Some(sender),
                receiver: Some(receiver),
                pipeline: Some(pipeline),
            })),
            finished: Arc::new(finished),
            close_outcome: OnceCell::new(),
            stats,
        }
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        lock(&self.lifecycle)
    }

    pub fn state(&self) -> ProcessorState {
        self.lifecycle().state
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    /// Run the consume loop until `close` is called and the queue is drained.
    pub async fn serve(&self) -> Result<()> {
        let (receiver, pipeline) = {
            let mut lifecycle = self.lifecycle();
            if lifecycle.serve_started {
                return Err(TlsTraceError::AlreadyServing);
            }
            if lifecycle.state != ProcessorState::Created {
                return Err(TlsTraceError::Closed);
            }
            match (lifecycle.receiver.take(), lifecycle.pipeline.take()) {
                (Some(receiver), Some(pipeline)) => {
                    lifecycle.serve_started = true;
                    lifecycle.state = ProcessorState::Serving;
                    (receiver, pipeline)
                }
                _ => return Err(TlsTraceError::Closed),
            }
        };

        info!(
            "serving events (queue capacity {}, {} output to {})",
            self.config.pipeline.queue_capacity,
            self.config.output.mode,
            self.config.output.destination.display()
        );
        let outcome = self.consume(receiver, pipeline).await;

        self.lifecycle().state = ProcessorState::Closed;
        self.finished.send_replace(Some(outcome.clone()));
        info!("event processor stopped");
        outcome
    }

    async fn consume(&self, mut receiver: EventQueue, mut pipeline: Pipeline) -> Result<()> {
        let period = self.config.tracking.sweep_interval.max(MIN_SWEEP_INTERVAL);
        let mut sweep = tokio::time::interval(period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        sweep.tick().await;

        loop {
            tokio::select! {
                next = receiver.recv() => match next {
                    Some(event) => pipeline.handle(&event, Instant::now()),
                    None => break,
                },
                _ = sweep.tick() => pipeline.sweep(Instant::now()),
            }
        }

        debug!("event queue closed and drained");
        pipeline.finish()
    }

    fn sender(&self) -> Result<mpsc::Sender<Box<SslDataEvent>>> {
        let lifecycle = self.lifecycle();
        match lifecycle.state {
            ProcessorState::Created | ProcessorState::Serving => {
                lifecycle.sender.clone().ok_or(TlsTraceError::Closed)
            }
            ProcessorState::Closing | ProcessorState::Closed => Err(TlsTraceError::Closed),
        }
    }

    /// Enqueue one event. Under backpressure waits up to the configured write
    /// timeout, then fails with `QueueFull`; with the drop policy a full queue
    /// discards the event instead.
    pub async fn write(&self, event: SslDataEvent) -> Result<()> {
        let sender = self.sender()?;
        if self.config.drops_on_overflow() {
            return self.offer(&sender, event);
        }

        match sender
            .send_timeout(Box::new(event), self.config.pipeline.write_timeout)
            .await
        {
            Ok(()) => {
                self.stats.record_queued();
                Ok(())
            }
            Err(SendTimeoutError::Timeout(_)) => Err(TlsTraceError::QueueFull {
                capacity: self.config.pipeline.queue_capacity,
            }),
            Err(SendTimeoutError::Closed(_)) => Err(TlsTraceError::Closed),
        }
    }

    /// Enqueue without waiting.
    pub fn try_write(&self, event: SslDataEvent) -> Result<()> {
        let sender = self.sender()?;
        self.offer(&sender, event)
    }

    fn offer(&self, sender: &mpsc::Sender<Box<SslDataEvent>>, event: SslDataEvent) -> Result<()> {
        match sender.try_send(Box::new(event)) {
            Ok(()) => {
                self.stats.record_queued();
                Ok(())
            }
            Err(TrySendError::Full(event)) if self.config.drops_on_overflow() => {
                self.stats.record_dropped();
                warn!(
                    "queue full, dropping event from pid {} fd {}",
                    event.pid, event.fd
                );
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(TlsTraceError::QueueFull {
                capacity: self.config.pipeline.queue_capacity,
            }),
            Err(TrySendError::Closed(_)) => Err(TlsTraceError::Closed),
        }
    }

    /// Stop intake, drain, flush and close the sink. Every call returns the
    /// outcome of the first.
    pub async fn close(&self) -> Result<()> {
        self.close_outcome
            .get_or_init(|| self.shutdown())
            .await
            .clone()
    }

    async fn shutdown(&self) -> Result<()> {
        let unserved = {
            let mut lifecycle = self.lifecycle();
            let previous = lifecycle.state;
            if previous != ProcessorState::Closed {
                lifecycle.state = ProcessorState::Closing;
            }
            // Dropping the stored sender ends `recv` once in-flight writes land.
            lifecycle.sender = None;
            match previous {
                ProcessorState::Created => lifecycle.receiver.take().zip(lifecycle.pipeline.take()),
                _ => None,
            }
        };
        info!("closing event processor");

        if let Some((receiver, pipeline)) = unserved {
            debug!("serve never ran, draining queue during close");
            // Detached so that a cancelled close cannot strand the queue; a
            // later close picks the outcome up from `finished`.
            tokio::spawn(drain_unserved(
                receiver,
                pipeline,
                self.lifecycle.clone(),
                self.finished.clone(),
            ));
        }

        let timeout = self.config.pipeline.close_timeout;
        let mut finished = self.finished.subscribe();
        let drained = tokio::time::timeout(timeout, async move {
            match finished.wait_for(Option::is_some).await {
                Ok(outcome) => (*outcome).clone().unwrap_or(Ok(())),
                Err(_) => Err(TlsTraceError::Closed),
            }
        })
        .await;

        match drained {
            Ok(outcome) => {
                match &outcome {
                    Ok(()) => info!("event processor closed cleanly"),
                    Err(e) => warn!("event processor closed with error: {}", e),
                }
                outcome
            }
            Err(_) => {
                warn!("close timed out after {:?}", timeout);
                Err(TlsTraceError::DrainTimeout { timeout })
            }
        }
    }
}

fn lock(lifecycle: &Mutex<Lifecycle>) -> MutexGuard<'_, Lifecycle> {
    lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn drain_unserved(
    mut receiver: EventQueue,
    mut pipeline: Pipeline,
    lifecycle: Arc<Mutex<Lifecycle>>,
    finished: Arc<Outcome>,
) {
    while let Some(event) = receiver.recv().await {
        pipeline.handle(&event, Instant::now());
    }
    let outcome = pipeline.finish();
    lock(&lifecycle).state = ProcessorState::Closed;
    finished.send_replace(Some(outcome));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::OverflowPolicy;
    use crate::event_processing::{ConnectionInfo, StreamRecord, UnitEnd};
    use assert_matches::assert_matches;
    use std::time::Duration;
    use tls_trace_common::{EventKind, MAX_DATA_SIZE};

    #[derive(Clone, Default)]
    struct RecordingSink {
        records: Arc<Mutex<Vec<StreamRecord>>>,
        closed_connections: Arc<Mutex<Vec<ConnectionInfo>>>,
        close_calls: Arc<Mutex<u32>>,
        fail_close: bool,
    }

    impl Sink for RecordingSink {
        fn emit(&mut self, record: &StreamRecord) -> Result<()> {
            self.records.lock().unwrap().push(record.clone());
            Ok(())
        }

        fn connection_closed(&mut self, info: &ConnectionInfo) -> Result<()> {
            self.closed_connections.lock().unwrap().push(info.clone());
            Ok(())
        }

        fn close(&mut self) -> Result<()> {
            *self.close_calls.lock().unwrap() += 1;
            if self.fail_close {
                return Err(TlsTraceError::sink_io(
                    "closing test sink",
                    std::io::Error::new(std::io::ErrorKind::Other, "disk gone"),
                ));
            }
            Ok(())
        }
    }

    /// Blocks every `emit` until the test sends a release.
    struct GatedSink {
        release: std::sync::mpsc::Receiver<()>,
        inner: RecordingSink,
    }

    impl Sink for GatedSink {
        fn emit(&mut self, record: &StreamRecord) -> Result<()> {
            let _ = self.release.recv();
            self.inner.emit(record)
        }

        fn connection_closed(&mut self, info: &ConnectionInfo) -> Result<()> {
            self.inner.connection_closed(info)
        }

        fn close(&mut self) -> Result<()> {
            self.inner.close()
        }
    }

    fn gated_processor(
        config: Configuration,
    ) -> (Arc<EventProcessor>, RecordingSink, std::sync::mpsc::Sender<()>) {
        let (release_tx, release) = std::sync::mpsc::channel();
        let inner = RecordingSink::default();
        let sink = GatedSink {
            release,
            inner: inner.clone(),
        };
        let processor = Arc::new(EventProcessor::with_sink(config, Box::new(sink)));
        (processor, inner, release_tx)
    }

    fn config() -> Configuration {
        Configuration::builder()
            .with_queue_capacity(16)
            .with_write_timeout(Duration::from_millis(20))
            .with_close_timeout(Duration::from_secs(5))
            .build()
            .unwrap()
    }

    fn processor_with(config: Configuration) -> (Arc<EventProcessor>, RecordingSink) {
        let sink = RecordingSink::default();
        let processor = Arc::new(EventProcessor::with_sink(config, Box::new(sink.clone())));
        (processor, sink)
    }

    fn read(ts: u64, payload: &[u8]) -> SslDataEvent {
        SslDataEvent::new()
            .with_kind(EventKind::DataRead)
            .with_pid(100)
            .with_fd(7)
            .with_timestamp(ts)
            .with_payload(payload)
    }

    /// Spawn `serve` and wait until it owns the queue.
    async fn spawn_serve(processor: &Arc<EventProcessor>) -> tokio::task::JoinHandle<Result<()>> {
        let serving = processor.clone();
        let handle = tokio::spawn(async move { serving.serve().await });
        while processor.state() == ProcessorState::Created {
            tokio::task::yield_now().await;
        }
        handle
    }

    mod lifecycle_tests {
        use super::*;

        #[tokio::test]
        async fn should_reject_second_serve() {
            let (processor, _) = processor_with(config());
            let handle = spawn_serve(&processor).await;

            assert_matches!(processor.serve().await, Err(TlsTraceError::AlreadyServing));

            processor.close().await.unwrap();
            handle.await.unwrap().unwrap();
            assert_eq!(processor.state(), ProcessorState::Closed);
        }

        #[tokio::test]
        async fn should_reject_write_after_close() {
            let (processor, _) = processor_with(config());
            let handle = spawn_serve(&processor).await;

            processor.close().await.unwrap();

            assert_matches!(processor.write(read(1, b"late")).await, Err(TlsTraceError::Closed));
            assert_matches!(processor.try_write(read(2, b"late")), Err(TlsTraceError::Closed));
            handle.await.unwrap().unwrap();
        }

        #[tokio::test]
        async fn should_return_same_outcome_and_close_sink_once() {
            let sink = RecordingSink {
                fail_close: true,
                ..RecordingSink::default()
            };
            let processor = Arc::new(EventProcessor::with_sink(config(), Box::new(sink.clone())));
            let handle = spawn_serve(&processor).await;

            let first = processor.close().await;
            let second = processor.close().await;

            assert_matches!(first, Err(TlsTraceError::SinkIo { .. }));
            assert_matches!(second, Err(TlsTraceError::SinkIo { .. }));
            assert_eq!(*sink.close_calls.lock().unwrap(), 1);
            assert!(handle.await.unwrap().is_err());
        }

        #[tokio::test]
        async fn should_drain_queue_when_serve_never_ran() {
            let (processor, sink) = processor_with(config());
            processor.write(read(1, b"queued")).await.unwrap();

            processor.close().await.unwrap();

            assert_eq!(sink.records.lock().unwrap().len(), 1);
            assert_eq!(processor.state(), ProcessorState::Closed);
            assert_matches!(processor.serve().await, Err(TlsTraceError::Closed));
        }

        #[tokio::test]
        async fn should_serve_with_unvalidated_zero_sweep_interval() {
            let mut config = Configuration::default();
            config.tracking.sweep_interval = Duration::ZERO;
            let (processor, sink) = processor_with(config);
            let handle = spawn_serve(&processor).await;

            processor.write(read(1, b"still delivered")).await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;

            assert_matches!(processor.close().await, Ok(()));
            assert_matches!(handle.await.unwrap(), Ok(()));
            assert_eq!(sink.records.lock().unwrap().len(), 1);
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn should_report_drain_timeout_and_repeat_it() {
            let config = Configuration::builder()
                .with_close_timeout(Duration::from_millis(50))
                .build()
                .unwrap();
            let (processor, sink, release) = gated_processor(config);
            let handle = spawn_serve(&processor).await;
            processor.write(read(1, b"stuck")).await.unwrap();

            let first = processor.close().await;
            let second = processor.close().await;

            assert_matches!(first, Err(TlsTraceError::DrainTimeout { timeout }) if timeout == Duration::from_millis(50));
            assert_matches!(second, Err(TlsTraceError::DrainTimeout { .. }));

            release.send(()).unwrap();
            assert_matches!(handle.await.unwrap(), Ok(()));
            assert_eq!(sink.records.lock().unwrap().len(), 1);
            assert_eq!(processor.state(), ProcessorState::Closed);
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn should_complete_close_after_earlier_close_was_cancelled() {
            let (processor, sink, release) = gated_processor(config());
            processor.write(read(1, b"queued")).await.unwrap();

            let cancelled = tokio::time::timeout(Duration::from_millis(20), processor.close()).await;
            assert!(cancelled.is_err());

            release.send(()).unwrap();
            assert_matches!(processor.close().await, Ok(()));
            assert_eq!(sink.records.lock().unwrap().len(), 1);
            assert_eq!(processor.state(), ProcessorState::Closed);
        }
    }

    mod backpressure_tests {
        use super::*;

        #[tokio::test]
        async fn should_fail_with_queue_full_after_write_timeout() {
            let config = Configuration::builder()
                .with_queue_capacity(1)
                .with_write_timeout(Duration::from_millis(10))
                .build()
                .unwrap();
            let (processor, _) = processor_with(config);

            processor.write(read(1, b"a")).await.unwrap();
            let result = processor.write(read(2, b"b")).await;

            assert_matches!(result, Err(TlsTraceError::QueueFull { capacity: 1 }));
            assert_matches!(
                processor.try_write(read(3, b"c")),
                Err(TlsTraceError::QueueFull { .. })
            );
        }

        #[tokio::test]
        async fn should_count_drops_under_drop_policy() {
            let config = Configuration::builder()
                .with_queue_capacity(1)
                .with_overflow_policy(OverflowPolicy::Drop)
                .build()
                .unwrap();
            let (processor, sink) = processor_with(config);

            processor.write(read(1, b"kept")).await.unwrap();
            processor.write(read(2, b"lost")).await.unwrap();
            processor.close().await.unwrap();

            let stats = processor.stats();
            assert_eq!(stats.events_queued, 1);
            assert_eq!(stats.events_dropped, 1);
            assert_eq!(&sink.records.lock().unwrap()[0].unit.data[..], b"kept");
        }
    }

    mod processing_tests {
        use super::*;

        #[tokio::test]
        async fn should_join_continuations_into_one_unit() {
            let (processor, sink) = processor_with(config());
            let handle = spawn_serve(&processor).await;

            processor.write(read(1, &[b'a'; MAX_DATA_SIZE])).await.unwrap();
            processor.write(read(2, &[b'b'; MAX_DATA_SIZE])).await.unwrap();
            processor.write(read(3, &[b'c'; 10])).await.unwrap();
            processor.close().await.unwrap();
            handle.await.unwrap().unwrap();

            let records = sink.records.lock().unwrap();
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].unit.len(), 8202);
            assert_eq!(records[0].unit.end, UnitEnd::Complete);
        }

        #[tokio::test]
        async fn should_isolate_malformed_event() {
            let (processor, sink) = processor_with(config());
            let handle = spawn_serve(&processor).await;

            processor.write(read(1, &[b'a'; MAX_DATA_SIZE])).await.unwrap();
            processor
                .write(read(2, b"bad").with_data_len(MAX_DATA_SIZE as u32 + 1))
                .await
                .unwrap();
            processor.write(read(3, b"end")).await.unwrap();

            assert!(processor.close().await.is_ok());
            handle.await.unwrap().unwrap();

            let records = sink.records.lock().unwrap();
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].unit.len(), MAX_DATA_SIZE + 3);
            assert_eq!(processor.stats().malformed_events, 1);
        }

        #[tokio::test]
        async fn should_flush_pending_tail_at_shutdown() {
            let (processor, sink) = processor_with(config());
            let handle = spawn_serve(&processor).await;

            processor.write(read(1, &[b'a'; MAX_DATA_SIZE])).await.unwrap();
            processor.close().await.unwrap();
            handle.await.unwrap().unwrap();

            let records = sink.records.lock().unwrap();
            assert_eq!(records[0].unit.end, UnitEnd::Flushed);
            let closed = sink.closed_connections.lock().unwrap();
            assert_eq!(closed[0].reason, CloseReason::Shutdown);
        }

        #[tokio::test(start_paused = true)]
        async fn should_evict_idle_connection_during_serve() {
            let config = Configuration::builder()
                .with_idle_timeout(Duration::from_secs(5))
                .with_sweep_interval(Duration::from_secs(1))
                .build()
                .unwrap();
            let (processor, sink) = processor_with(config);
            let handle = spawn_serve(&processor).await;

            processor.write(read(1, &[b'a'; MAX_DATA_SIZE])).await.unwrap();
            tokio::time::sleep(Duration::from_secs(7)).await;

            assert_eq!(processor.stats().connections_evicted, 1);
            {
                let closed = sink.closed_connections.lock().unwrap();
                assert_eq!(closed.len(), 1);
                assert_eq!(closed[0].reason, CloseReason::Idle);
            }

            processor.close().await.unwrap();
            handle.await.unwrap().unwrap();
            assert_eq!(sink.closed_connections.lock().unwrap().len(), 1);
        }
    }
}
