//! Flush coordinator
//!
//! Owns the flush mode state machine and the single-flight drain. Any
//! trigger (manual request, immediate-mode enqueue, platform scheduler
//! job, app-background transition) funnels into [`FlushCoordinator::flush_data`],
//! which is serialized process-wide by a compare-and-set flag: a second
//! call while a drain is active returns immediately instead of waiting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::Result;
use crate::queue::EventQueueStore;
use crate::types::{EventRecord, FlushMode, ProjectSettings};

use super::scheduler::PlatformScheduler;
use super::transport::{DeliveryOutcome, EventTransport};

/// Callback invoked when a record is permanently dropped (retry exhaustion
/// or semantic rejection). The string is the failure reason.
pub type DropObserver = Box<dyn Fn(&EventRecord, &str) + Send + Sync>;

/// Result of a `flush_data` call.
#[derive(Debug, Clone, PartialEq)]
pub enum FlushOutcome {
    /// A drain was already in flight; nothing was done
    AlreadyRunning,
    /// A drain pass completed
    Completed(FlushStats),
}

/// Counters for one drain pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushStats {
    /// Records acknowledged and removed
    pub delivered: usize,
    /// Records left queued for a later attempt
    pub retried: usize,
    /// Records removed permanently and reported as failed
    pub dropped: usize,
}

/// Clears the drain flag on every exit path of a pass.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Drains the durable queue against the network, honoring per-record retry
/// state and the flush mode state machine.
pub struct FlushCoordinator<T: EventTransport> {
    queue: Arc<EventQueueStore>,
    transport: Arc<T>,
    scheduler: Arc<dyn PlatformScheduler>,
    mode: Mutex<FlushMode>,
    period: Duration,
    max_retries: i32,
    running: AtomicBool,
    drop_observer: Mutex<Option<DropObserver>>,
}

impl<T: EventTransport> FlushCoordinator<T> {
    pub fn new(
        queue: Arc<EventQueueStore>,
        transport: Arc<T>,
        scheduler: Arc<dyn PlatformScheduler>,
        mode: FlushMode,
        period: Duration,
        max_retries: i32,
    ) -> Self {
        Self {
            queue,
            transport,
            scheduler,
            mode: Mutex::new(mode),
            period,
            max_retries,
            running: AtomicBool::new(false),
            drop_observer: Mutex::new(None),
        }
    }

    /// Register the observer notified about permanently dropped records
    pub fn set_drop_observer(&self, observer: DropObserver) {
        *self.drop_observer.lock().unwrap() = Some(observer);
    }

    /// The active flush mode
    pub fn mode(&self) -> FlushMode {
        *self.mode.lock().unwrap()
    }

    /// Assign a flush mode; `Period` starts the platform scheduler, every
    /// other mode stops it.
    pub fn set_mode(&self, mode: FlushMode) {
        *self.mode.lock().unwrap() = mode;
        self.on_mode_changed(mode);
    }

    fn on_mode_changed(&self, mode: FlushMode) {
        tracing::debug!(mode = %mode, "Flush mode changed");
        match mode {
            FlushMode::Period => self.scheduler.start(self.period),
            FlushMode::Manual | FlushMode::Immediate | FlushMode::AppClose => {
                self.scheduler.stop()
            }
        }
    }

    /// App became visible: `AppClose` temporarily elevates to `Period` so
    /// events flush while the app is in use.
    pub fn on_app_foreground(&self) {
        if self.mode() == FlushMode::AppClose {
            self.set_mode(FlushMode::Period);
        }
    }

    /// App went to background: revert a temporary `Period` elevation back to
    /// `AppClose`. Returns true when the caller must perform the one
    /// pre-suspend flush attempt.
    pub fn on_app_background(&self) -> bool {
        if self.mode() == FlushMode::Period {
            self.set_mode(FlushMode::AppClose);
            return true;
        }
        false
    }

    /// Stop scheduling further drains. An in-flight drain finishes its
    /// current record on its own.
    pub fn shutdown(&self) {
        self.scheduler.stop();
    }

    /// Drain the queue against the network.
    ///
    /// Single-flight process-wide: if a drain is already active this
    /// returns [`FlushOutcome::AlreadyRunning`] immediately.
    pub async fn flush_data(&self) -> Result<FlushOutcome> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::warn!("Flush already in progress, skipping");
            return Ok(FlushOutcome::AlreadyRunning);
        }
        let _guard = DrainGuard(&self.running);

        let stats = self.drain().await?;
        tracing::info!(
            delivered = stats.delivered,
            retried = stats.retried,
            dropped = stats.dropped,
            "Flush pass complete"
        );
        Ok(FlushOutcome::Completed(stats))
    }

    async fn drain(&self) -> Result<FlushStats> {
        // Bookkeeping reads/removes take the queue lock briefly; the lock is
        // never held across a delivery await.
        let pending = self.queue.list_pending()?;

        // Group by destination, preserving first-seen creation order across
        // projects and creation order within each project.
        let mut order: Vec<ProjectSettings> = Vec::new();
        let mut groups: HashMap<ProjectSettings, Vec<EventRecord>> = HashMap::new();
        for record in pending {
            if !groups.contains_key(&record.project) {
                order.push(record.project.clone());
            }
            groups.entry(record.project.clone()).or_default().push(record);
        }

        let mut stats = FlushStats::default();
        for project in order {
            let records = groups.remove(&project).unwrap_or_default();
            for record in records {
                self.deliver_one(&record, &mut stats).await?;
            }
        }
        Ok(stats)
    }

    async fn deliver_one(&self, record: &EventRecord, stats: &mut FlushStats) -> Result<()> {
        let outcome = self
            .transport
            .deliver(&record.project, std::slice::from_ref(record))
            .await;

        match outcome {
            DeliveryOutcome::Delivered => {
                self.queue.remove(record.seq)?;
                stats.delivered += 1;
                tracing::debug!(seq = record.seq, event_type = %record.event_type, "Event delivered");
            }
            DeliveryOutcome::Retryable(reason) => {
                let tries = self.queue.increment_tries(record.seq)?;
                if tries > self.max_retries {
                    self.queue.remove(record.seq)?;
                    stats.dropped += 1;
                    tracing::error!(
                        seq = record.seq,
                        tries,
                        reason = %reason,
                        "Retry limit reached, dropping event"
                    );
                    self.report_dropped(record, &reason);
                } else {
                    stats.retried += 1;
                    tracing::warn!(
                        seq = record.seq,
                        tries,
                        reason = %reason,
                        "Delivery failed, event stays queued"
                    );
                }
            }
            DeliveryOutcome::Rejected(reason) => {
                self.queue.remove(record.seq)?;
                stats.dropped += 1;
                tracing::error!(
                    seq = record.seq,
                    reason = %reason,
                    "Event rejected by backend, dropping"
                );
                self.report_dropped(record, &reason);
            }
        }
        Ok(())
    }

    fn report_dropped(&self, record: &EventRecord, reason: &str) {
        if let Some(observer) = self.drop_observer.lock().unwrap().as_ref() {
            observer(record, reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::types::{EventCategory, NewEventRecord, PropertyMap};
    use std::collections::BTreeMap;
    use std::collections::VecDeque;
    use std::future::Future;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    /// Transport with a scripted sequence of outcomes; repeats the last
    /// outcome when the script runs out. Optionally gates each delivery on
    /// a notify, for the single-flight test.
    struct MockTransport {
        script: Mutex<VecDeque<DeliveryOutcome>>,
        calls: Mutex<Vec<(String, String)>>,
        call_count: AtomicUsize,
        gate: Option<Arc<Notify>>,
        started: Arc<AtomicBool>,
    }

    impl MockTransport {
        fn always(outcome: DeliveryOutcome) -> Self {
            Self::scripted(vec![outcome])
        }

        fn scripted(outcomes: Vec<DeliveryOutcome>) -> Self {
            Self {
                script: Mutex::new(outcomes.into()),
                calls: Mutex::new(Vec::new()),
                call_count: AtomicUsize::new(0),
                gate: None,
                started: Arc::new(AtomicBool::new(false)),
            }
        }

        fn gated(outcome: DeliveryOutcome, gate: Arc<Notify>) -> Self {
            let mut transport = Self::always(outcome);
            transport.gate = Some(gate);
            transport
        }

        fn calls(&self) -> Vec<(String, String)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl EventTransport for MockTransport {
        fn deliver(
            &self,
            project: &ProjectSettings,
            events: &[EventRecord],
        ) -> impl Future<Output = DeliveryOutcome> + Send {
            self.started.store(true, Ordering::SeqCst);
            self.call_count.fetch_add(1, Ordering::SeqCst);
            for event in events {
                self.calls
                    .lock()
                    .unwrap()
                    .push((project.project_token.clone(), event.event_type.clone()));
            }
            let outcome = {
                let mut script = self.script.lock().unwrap();
                if script.len() > 1 {
                    script.pop_front().unwrap()
                } else {
                    script.front().cloned().unwrap_or(DeliveryOutcome::Delivered)
                }
            };
            let gate = self.gate.clone();
            async move {
                if let Some(gate) = gate {
                    gate.notified().await;
                }
                outcome
            }
        }
    }

    /// Scheduler that counts start/stop calls.
    #[derive(Default)]
    struct RecordingScheduler {
        starts: AtomicUsize,
        stops: AtomicUsize,
    }

    impl PlatformScheduler for RecordingScheduler {
        fn start(&self, _period: Duration) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn test_queue() -> Arc<EventQueueStore> {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        Arc::new(EventQueueStore::new(Arc::new(db)))
    }

    fn enqueue(queue: &EventQueueStore, event_type: &str, token: &str) -> i64 {
        queue
            .append(&NewEventRecord {
                category: EventCategory::TrackEvent,
                event_type: event_type.to_string(),
                timestamp: 1.0,
                customer_ids: BTreeMap::new(),
                properties: PropertyMap::new(),
                project: ProjectSettings::new("https://api.example.com", token, None),
            })
            .unwrap()
    }

    fn coordinator(
        queue: Arc<EventQueueStore>,
        transport: MockTransport,
        max_retries: i32,
    ) -> FlushCoordinator<MockTransport> {
        FlushCoordinator::new(
            queue,
            Arc::new(transport),
            Arc::new(RecordingScheduler::default()),
            FlushMode::Manual,
            Duration::from_secs(60),
            max_retries,
        )
    }

    #[tokio::test]
    async fn test_successful_drain_removes_in_order() {
        let queue = test_queue();
        enqueue(&queue, "a", "p1");
        enqueue(&queue, "b", "p1");
        enqueue(&queue, "c", "p1");

        let flush = coordinator(Arc::clone(&queue), MockTransport::always(DeliveryOutcome::Delivered), 3);
        let outcome = flush.flush_data().await.unwrap();
        assert_eq!(
            outcome,
            FlushOutcome::Completed(FlushStats {
                delivered: 3,
                retried: 0,
                dropped: 0
            })
        );
        assert_eq!(queue.count().unwrap(), 0);

        let calls = flush.transport.calls();
        let types: Vec<&str> = calls.iter().map(|(_, t)| t.as_str()).collect();
        assert_eq!(types, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_retryable_failure_keeps_record_until_limit() {
        let queue = test_queue();
        enqueue(&queue, "a", "p1");

        let flush = coordinator(
            Arc::clone(&queue),
            MockTransport::always(DeliveryOutcome::Retryable("503".to_string())),
            3,
        );
        let dropped: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&dropped);
        flush.set_drop_observer(Box::new(move |record, _reason| {
            sink.lock().unwrap().push(record.event_type.clone());
        }));

        // Failing passes up to the retry limit: record stays, tries accumulate
        flush.flush_data().await.unwrap();
        assert_eq!(queue.count().unwrap(), 1);
        assert_eq!(queue.list_pending().unwrap()[0].tries, 1);
        flush.flush_data().await.unwrap();
        assert_eq!(queue.list_pending().unwrap()[0].tries, 2);
        flush.flush_data().await.unwrap();
        assert_eq!(queue.count().unwrap(), 1);
        assert_eq!(queue.list_pending().unwrap()[0].tries, 3);

        // The attempt beyond the limit: dropped, reported, never retried again
        let outcome = flush.flush_data().await.unwrap();
        assert_eq!(
            outcome,
            FlushOutcome::Completed(FlushStats {
                delivered: 0,
                retried: 0,
                dropped: 1
            })
        );
        assert_eq!(queue.count().unwrap(), 0);
        assert_eq!(dropped.lock().unwrap().as_slice(), ["a"]);

        // The initial attempt plus exactly max_retries retries
        assert_eq!(flush.transport.call_count.load(Ordering::SeqCst), 4);

        // Further passes have nothing to do
        flush.flush_data().await.unwrap();
        assert_eq!(flush.transport.call_count.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_single_retry_bound_allows_one_retry() {
        let queue = test_queue();
        enqueue(&queue, "a", "p1");

        let flush = coordinator(
            Arc::clone(&queue),
            MockTransport::always(DeliveryOutcome::Retryable("timeout".to_string())),
            1,
        );

        // First failure must not drop the record; one retry is still owed.
        flush.flush_data().await.unwrap();
        assert_eq!(queue.count().unwrap(), 1);
        assert_eq!(queue.list_pending().unwrap()[0].tries, 1);

        // The retry fails too, exceeding the bound: now it drops.
        flush.flush_data().await.unwrap();
        assert_eq!(queue.count().unwrap(), 0);
        assert_eq!(flush.transport.call_count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rejected_record_dropped_immediately() {
        let queue = test_queue();
        enqueue(&queue, "bad", "p1");

        let flush = coordinator(
            Arc::clone(&queue),
            MockTransport::always(DeliveryOutcome::Rejected("400".to_string())),
            10,
        );
        let outcome = flush.flush_data().await.unwrap();
        assert_eq!(
            outcome,
            FlushOutcome::Completed(FlushStats {
                delivered: 0,
                retried: 0,
                dropped: 1
            })
        );
        assert_eq!(queue.count().unwrap(), 0);
        assert_eq!(flush.transport.call_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejection_does_not_block_other_projects() {
        let queue = test_queue();
        enqueue(&queue, "a", "p1");
        enqueue(&queue, "b", "p2");

        // First call (project p1) rejected, second (p2) delivered
        let flush = coordinator(
            Arc::clone(&queue),
            MockTransport::scripted(vec![
                DeliveryOutcome::Rejected("400".to_string()),
                DeliveryOutcome::Delivered,
            ]),
            3,
        );
        let outcome = flush.flush_data().await.unwrap();
        assert_eq!(
            outcome,
            FlushOutcome::Completed(FlushStats {
                delivered: 1,
                retried: 0,
                dropped: 1
            })
        );
        assert_eq!(queue.count().unwrap(), 0);

        let calls = flush.transport.calls();
        assert_eq!(calls[0].0, "p1");
        assert_eq!(calls[1].0, "p2");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_single_flight() {
        let queue = test_queue();
        enqueue(&queue, "a", "p1");

        let gate = Arc::new(Notify::new());
        let transport = MockTransport::gated(DeliveryOutcome::Delivered, Arc::clone(&gate));
        let started = Arc::clone(&transport.started);
        let flush = Arc::new(coordinator(Arc::clone(&queue), transport, 3));

        let first = {
            let flush = Arc::clone(&flush);
            tokio::spawn(async move { flush.flush_data().await.unwrap() })
        };

        // Wait until the first drain is inside the transport call
        while !started.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }

        // Second call returns immediately without draining
        let second = flush.flush_data().await.unwrap();
        assert_eq!(second, FlushOutcome::AlreadyRunning);

        gate.notify_one();
        let first = first.await.unwrap();
        assert_eq!(
            first,
            FlushOutcome::Completed(FlushStats {
                delivered: 1,
                retried: 0,
                dropped: 0
            })
        );

        // Flag cleared: a later flush runs again
        enqueue(&queue, "b", "p1");
        gate.notify_one();
        let third = flush.flush_data().await.unwrap();
        assert_eq!(
            third,
            FlushOutcome::Completed(FlushStats {
                delivered: 1,
                retried: 0,
                dropped: 0
            })
        );
    }

    #[test]
    fn test_mode_transitions_drive_scheduler() {
        let queue = test_queue();
        let scheduler = Arc::new(RecordingScheduler::default());
        let flush = FlushCoordinator::new(
            queue,
            Arc::new(MockTransport::always(DeliveryOutcome::Delivered)),
            Arc::clone(&scheduler) as Arc<dyn PlatformScheduler>,
            FlushMode::Manual,
            Duration::from_secs(60),
            3,
        );

        flush.set_mode(FlushMode::Period);
        assert_eq!(scheduler.starts.load(Ordering::SeqCst), 1);

        flush.set_mode(FlushMode::Manual);
        assert_eq!(scheduler.stops.load(Ordering::SeqCst), 1);

        // AppClose → foreground elevates to Period
        flush.set_mode(FlushMode::AppClose);
        flush.on_app_foreground();
        assert_eq!(flush.mode(), FlushMode::Period);
        assert_eq!(scheduler.starts.load(Ordering::SeqCst), 2);

        // Background reverts and requests exactly one flush
        assert!(flush.on_app_background());
        assert_eq!(flush.mode(), FlushMode::AppClose);

        // Backgrounding again without elevation requests nothing
        assert!(!flush.on_app_background());

        // Foreground in a non-AppClose mode does not elevate
        flush.set_mode(FlushMode::Immediate);
        flush.on_app_foreground();
        assert_eq!(flush.mode(), FlushMode::Immediate);
    }
}
