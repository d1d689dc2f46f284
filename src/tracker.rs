//! The main tracking service
//!
//! [`Trackwire`] wires the durable queue, identity repository, project
//! router, session state machine, and flush coordinator into one service
//! object with a synchronous public API. Network work runs on an owned
//! tokio runtime; producers never wait on the network unless they ask to
//! (manual flush, pre-suspend flush).
//!
//! Every producer funnels into a single track pipeline that snapshots the
//! active identity, merges default properties, fans the event out to its
//! routed projects, and appends one durable record per destination. A
//! pipeline mutex serializes producers against the anonymize protocol so
//! no event is ever stamped with a half-switched identity.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::TrackwireConfig;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::flush::{
    DropObserver, EventTransport, FlushCoordinator, FlushOutcome, HttpTransport, NoopScheduler,
    PlatformScheduler,
};
use crate::identity::CustomerIdentityRepository;
use crate::queue::EventQueueStore;
use crate::routing::ProjectRouter;
use crate::session::{SessionTracker, SessionTransition};
use crate::types::{
    current_time_seconds, CampaignClick, EventCategory, FlushMode, NewEventRecord,
    ProjectSettings, PropertyMap, PropertyValue, PurchasedItem, TrackedEvent,
};

/// Persisted-state key holding the last uploaded push token.
const STATE_PUSH_TOKEN: &str = "push_token";
/// Persisted-state key marking that the install event was already tracked.
const STATE_INSTALL_TRACKED: &str = "install_tracked";
/// Persisted-state key holding the first-touch campaign click, as JSON.
const STATE_CAMPAIGN_CLICK: &str = "campaign_click";

/// Read-only callback invoked for every event accepted by the pipeline.
///
/// Observers run inside the pipeline lock and must not call back into the
/// tracker. The in-app eligibility engine is the intended consumer.
pub type EventObserver = Box<dyn Fn(&TrackedEvent) + Send + Sync>;

/// The tracking service.
///
/// Generic over the transport so tests substitute a scripted one; production
/// code uses [`Trackwire::with_http`].
pub struct Trackwire<T: EventTransport> {
    config: TrackwireConfig,
    db: Arc<Database>,
    queue: Arc<EventQueueStore>,
    identity: Arc<CustomerIdentityRepository>,
    router: Arc<ProjectRouter>,
    session: SessionTracker,
    flush: Arc<FlushCoordinator<T>>,
    runtime: tokio::runtime::Runtime,
    initialized: AtomicBool,
    /// Serializes producers against the anonymize protocol
    pipeline: Mutex<()>,
    observers: Mutex<Vec<EventObserver>>,
}

impl Trackwire<HttpTransport> {
    /// Build a service backed by the real HTTP transport and the database at
    /// the configured path.
    pub fn with_http(config: TrackwireConfig) -> Result<Self> {
        let transport = HttpTransport::new(30)?;
        Self::new(config, transport, Arc::new(NoopScheduler))
    }
}

impl<T: EventTransport> Trackwire<T> {
    pub fn new(
        config: TrackwireConfig,
        transport: T,
        scheduler: Arc<dyn PlatformScheduler>,
    ) -> Result<Self> {
        config.validate()?;
        let db = Arc::new(Database::open(&config.database_path())?);
        Self::with_database(config, transport, scheduler, db)
    }

    /// Build a service on an already-open database. Used by tests to run
    /// against an in-memory database, and to share a database across service
    /// restarts.
    pub fn with_database(
        config: TrackwireConfig,
        transport: T,
        scheduler: Arc<dyn PlatformScheduler>,
        db: Arc<Database>,
    ) -> Result<Self> {
        config.validate()?;
        db.migrate()?;

        let queue = Arc::new(EventQueueStore::new(Arc::clone(&db)));
        let identity = Arc::new(CustomerIdentityRepository::new(Arc::clone(&db)));
        let router = Arc::new(ProjectRouter::from_config(&config));
        let session = SessionTracker::new(config.session_timeout_secs);
        let flush = Arc::new(FlushCoordinator::new(
            Arc::clone(&queue),
            Arc::new(transport),
            scheduler,
            FlushMode::Manual,
            Duration::from_secs(config.flush_period_secs),
            config.max_retries,
        ));
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()?;

        Ok(Self {
            config,
            db,
            queue,
            identity,
            router,
            session,
            flush,
            runtime,
            initialized: AtomicBool::new(false),
            pipeline: Mutex::new(()),
            observers: Mutex::new(Vec::new()),
        })
    }

    // ============================================
    // Lifecycle
    // ============================================

    /// Bring the service online.
    ///
    /// Activates the configured flush mode and tracks the once-only install
    /// event. Calling this twice on the same instance is an error.
    pub fn init(&self) -> Result<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            tracing::error!("Trackwire is already initialized");
            return Err(Error::AlreadyInitialized);
        }
        tracing::info!(
            project_token = %self.config.project_token,
            flush_mode = %self.config.flush_mode,
            "Initializing Trackwire"
        );
        self.flush.set_mode(self.config.flush_mode);

        let _guard = self.pipeline.lock().unwrap();
        self.track_install_locked()
    }

    /// Stop scheduled flushing. Queued records stay durable for the next run.
    pub fn shutdown(&self) {
        tracing::info!("Shutting down Trackwire");
        self.flush.shutdown();
        self.initialized.store(false, Ordering::SeqCst);
    }

    /// App became visible. Elevates a deferred flush mode and, under
    /// automatic session tracking, resumes or restarts the session.
    pub fn on_app_foreground(&self, timestamp: Option<f64>) -> Result<()> {
        if !self.ensure_initialized() {
            return Ok(());
        }
        tracing::debug!("App entered foreground");
        self.flush.on_app_foreground();
        if self.config.automatic_session_tracking {
            let ts = timestamp.unwrap_or_else(current_time_seconds);
            let _guard = self.pipeline.lock().unwrap();
            for transition in self.session.on_foreground(ts) {
                self.apply_session_transition(transition)?;
            }
        }
        Ok(())
    }

    /// App went to background. Records the grace-window timestamp and, when
    /// the flush mode calls for it, performs one blocking flush attempt
    /// before the process may be suspended.
    pub fn on_app_background(&self, timestamp: Option<f64>) -> Result<()> {
        if !self.ensure_initialized() {
            return Ok(());
        }
        tracing::debug!("App entered background");
        if self.config.automatic_session_tracking {
            let ts = timestamp.unwrap_or_else(current_time_seconds);
            self.session.on_background(ts);
        }
        if self.flush.on_app_background() {
            self.runtime.block_on(self.flush.flush_data())?;
        }
        Ok(())
    }

    /// The active flush mode.
    pub fn flush_mode(&self) -> FlushMode {
        self.flush.mode()
    }

    /// Switch the flush mode at runtime.
    pub fn set_flush_mode(&self, mode: FlushMode) {
        self.flush.set_mode(mode);
    }

    /// Register the observer notified about permanently dropped records.
    pub fn set_drop_observer(&self, observer: DropObserver) {
        self.flush.set_drop_observer(observer);
    }

    /// Register a read-only pipeline observer.
    pub fn add_event_observer(&self, observer: EventObserver) {
        self.observers.lock().unwrap().push(observer);
    }

    /// Start timestamp of the active session, if any.
    pub fn session_start_ts(&self) -> Option<f64> {
        self.session.session_start_ts()
    }

    // ============================================
    // Producers
    // ============================================

    /// Track a custom event under the caller-supplied type label.
    pub fn track_event(
        &self,
        event_type: &str,
        properties: PropertyMap,
        timestamp: Option<f64>,
    ) -> Result<()> {
        self.track(EventCategory::TrackEvent, Some(event_type), properties, timestamp)
    }

    /// Track an event of any category. Internal producers and the public
    /// wrappers all land here.
    pub fn track(
        &self,
        category: EventCategory,
        event_type: Option<&str>,
        properties: PropertyMap,
        timestamp: Option<f64>,
    ) -> Result<()> {
        if !self.ensure_initialized() {
            return Ok(());
        }
        let _guard = self.pipeline.lock().unwrap();
        self.track_locked(category, event_type, properties, timestamp)
    }

    /// Update the registered identifiers of the current customer and track
    /// the identity-update event that carries them upstream.
    pub fn identify(
        &self,
        ids: BTreeMap<String, String>,
        properties: PropertyMap,
    ) -> Result<()> {
        if !self.ensure_initialized() {
            return Ok(());
        }
        let _guard = self.pipeline.lock().unwrap();
        self.identity.set(ids)?;
        self.track_locked(EventCategory::TrackCustomer, None, properties, None)
    }

    /// Track a completed purchase.
    pub fn track_payment(&self, item: PurchasedItem, timestamp: Option<f64>) -> Result<()> {
        self.track(EventCategory::Payment, None, item.to_properties(), timestamp)
    }

    /// Persist and upload the current push notification token.
    ///
    /// The empty string revokes the token upstream.
    pub fn track_push_token(&self, token: &str) -> Result<()> {
        if !self.ensure_initialized() {
            return Ok(());
        }
        let _guard = self.pipeline.lock().unwrap();
        self.db.set_state(STATE_PUSH_TOKEN, token)?;
        self.track_token_locked(token)
    }

    /// Track that a push notification reached the device.
    pub fn track_delivered_push(
        &self,
        data: PropertyMap,
        timestamp: Option<f64>,
    ) -> Result<()> {
        self.track_push_status(EventCategory::PushDelivered, "delivered", data, timestamp)
    }

    /// Track that the user opened a push notification.
    pub fn track_clicked_push(&self, data: PropertyMap, timestamp: Option<f64>) -> Result<()> {
        self.track_push_status(EventCategory::PushOpened, "clicked", data, timestamp)
    }

    fn track_push_status(
        &self,
        category: EventCategory,
        status: &str,
        data: PropertyMap,
        timestamp: Option<f64>,
    ) -> Result<()> {
        let mut props = PropertyMap::new();
        props.insert("action_type".into(), "mobile notification".into());
        props.insert("status".into(), status.into());
        props.insert("platform".into(), "mobile".into());
        props.extend(data);
        self.track(category, None, props, timestamp)
    }

    /// Record a campaign click-through as the first-touch attribution for
    /// the current identity and track the click event.
    ///
    /// Returns false when the URL does not look like a campaign link.
    pub fn handle_campaign_click(&self, url: &str, timestamp: Option<f64>) -> Result<bool> {
        if !self.ensure_initialized() {
            return Ok(false);
        }
        if !is_campaign_url(url) {
            tracing::warn!(url, "Ignoring invalid campaign click URL");
            return Ok(false);
        }
        let ts = timestamp.unwrap_or_else(current_time_seconds);
        let _guard = self.pipeline.lock().unwrap();

        let click = CampaignClick {
            url: url.to_string(),
            created_at: ts,
        };
        self.db
            .set_state(STATE_CAMPAIGN_CLICK, &serde_json::to_string(&click)?)?;

        let mut props = PropertyMap::new();
        props.insert("url".into(), url.into());
        props.insert("platform".into(), "mobile".into());
        props.insert("timestamp".into(), PropertyValue::Number(ts));
        self.track_locked(EventCategory::CampaignClick, None, props, Some(ts))?;
        Ok(true)
    }

    /// Manually open a session. Rejected while automatic session tracking
    /// owns the session lifecycle.
    pub fn track_session_start(&self, timestamp: Option<f64>) -> Result<()> {
        if !self.ensure_initialized() {
            return Ok(());
        }
        if self.config.automatic_session_tracking {
            let conflict = Error::ConflictingMode(
                "manual session start while automatic session tracking is enabled".to_string(),
            );
            tracing::warn!(error = %conflict, "Ignoring session call");
            return Ok(());
        }
        let ts = timestamp.unwrap_or_else(current_time_seconds);
        let _guard = self.pipeline.lock().unwrap();
        if let Some(transition) = self.session.track_session_start(ts) {
            self.apply_session_transition(transition)?;
        }
        Ok(())
    }

    /// Manually close the active session. Rejected while automatic session
    /// tracking owns the session lifecycle.
    pub fn track_session_end(&self, timestamp: Option<f64>) -> Result<()> {
        if !self.ensure_initialized() {
            return Ok(());
        }
        if self.config.automatic_session_tracking {
            let conflict = Error::ConflictingMode(
                "manual session end while automatic session tracking is enabled".to_string(),
            );
            tracing::warn!(error = %conflict, "Ignoring session call");
            return Ok(());
        }
        let ts = timestamp.unwrap_or_else(current_time_seconds);
        let _guard = self.pipeline.lock().unwrap();
        if let Some(transition) = self.session.track_session_end(ts) {
            self.apply_session_transition(transition)?;
        }
        Ok(())
    }

    // ============================================
    // Flush
    // ============================================

    /// Drain the queue now, blocking until the pass completes.
    pub fn flush_data(&self) -> Result<FlushOutcome> {
        if !self.ensure_initialized() {
            return Err(Error::NotInitialized);
        }
        self.runtime.block_on(self.flush.flush_data())
    }

    /// Number of records waiting in the queue.
    pub fn pending_count(&self) -> Result<i64> {
        self.queue.count()
    }

    // ============================================
    // Anonymize
    // ============================================

    /// Discard the current customer identity and start a fresh one,
    /// optionally switching the main project at the same time.
    ///
    /// Already-queued records keep their original identity snapshot and
    /// destination. The stored push token transfers to the new identity;
    /// campaign attribution does not.
    pub fn anonymize(&self, new_project: Option<ProjectSettings>) -> Result<()> {
        if !self.ensure_initialized() {
            return Ok(());
        }
        if let Some(project) = &new_project {
            crate::config::validate_project("anonymize", project)?;
        }
        let _guard = self.pipeline.lock().unwrap();
        tracing::info!("Anonymizing customer identity");

        // Capture the token, then revoke it under the outgoing identity so
        // the backend stops addressing pushes to it.
        let token = self.db.get_state(STATE_PUSH_TOKEN)?;
        self.track_token_locked("")?;

        // Attribution belongs to the outgoing identity.
        self.db.clear_state(STATE_CAMPAIGN_CLICK)?;

        // Switch identity, then project, so everything below is stamped
        // with the new cookie and routed to the new destination.
        self.identity.reset()?;
        if let Some(project) = new_project {
            self.router.set_main(project);
        }

        // The new identity gets its own install event and session.
        self.track_locked(
            EventCategory::Install,
            None,
            Self::install_properties(),
            None,
        )?;
        let transition = self.session.restart(current_time_seconds());
        self.apply_session_transition(transition)?;

        // Re-register the device token under the new identity.
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            self.track_token_locked(&token)?;
        }
        Ok(())
    }

    // ============================================
    // Pipeline internals
    // ============================================

    fn ensure_initialized(&self) -> bool {
        if self.initialized.load(Ordering::SeqCst) {
            return true;
        }
        tracing::error!("Trackwire is not initialized");
        false
    }

    /// The track pipeline. Callers hold the pipeline lock.
    fn track_locked(
        &self,
        category: EventCategory,
        event_type: Option<&str>,
        properties: PropertyMap,
        timestamp: Option<f64>,
    ) -> Result<()> {
        let identity = self.identity.get()?;
        let customer_ids = identity.to_map();
        let ts = timestamp.unwrap_or_else(current_time_seconds);
        let label = event_type
            .or_else(|| category.default_event_type())
            .unwrap_or_else(|| category.as_str())
            .to_string();

        // Caller-supplied properties win over configured defaults.
        let mut merged = self.config.default_properties.clone();
        merged.extend(properties);

        for project in self.router.resolve(category) {
            self.queue.append(&NewEventRecord {
                category,
                event_type: label.clone(),
                timestamp: ts,
                customer_ids: customer_ids.clone(),
                properties: merged.clone(),
                project,
            })?;
        }

        self.notify_observers(&TrackedEvent {
            event_type: label,
            properties: merged,
            timestamp: ts,
        });

        if self.flush.mode() == FlushMode::Immediate {
            self.spawn_flush();
        }
        Ok(())
    }

    fn track_token_locked(&self, token: &str) -> Result<()> {
        let mut props = PropertyMap::new();
        props.insert("push_notification_id".into(), token.into());
        self.track_locked(EventCategory::PushToken, None, props, None)
    }

    fn track_install_locked(&self) -> Result<()> {
        if self.db.get_state(STATE_INSTALL_TRACKED)?.is_some() {
            return Ok(());
        }
        self.track_locked(
            EventCategory::Install,
            None,
            Self::install_properties(),
            None,
        )?;
        self.db.set_state(STATE_INSTALL_TRACKED, "true")
    }

    fn install_properties() -> PropertyMap {
        let mut props = PropertyMap::new();
        props.insert("sdk".into(), "trackwire".into());
        props.insert("sdk_version".into(), env!("CARGO_PKG_VERSION").into());
        props
    }

    fn apply_session_transition(&self, transition: SessionTransition) -> Result<()> {
        match transition {
            SessionTransition::Started { ts } => {
                let mut props = PropertyMap::new();
                if let Some(click) = self.stored_campaign_click()? {
                    if click.is_fresh(self.config.campaign_ttl_secs, ts) {
                        props.insert("location".into(), click.url.as_str().into());
                    }
                }
                self.track_locked(EventCategory::SessionStart, None, props, Some(ts))
            }
            SessionTransition::Ended { ts, duration } => {
                let mut props = PropertyMap::new();
                props.insert("duration".into(), PropertyValue::Number(duration));
                self.track_locked(EventCategory::SessionEnd, None, props, Some(ts))
            }
        }
    }

    fn stored_campaign_click(&self) -> Result<Option<CampaignClick>> {
        match self.db.get_state(STATE_CAMPAIGN_CLICK)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn notify_observers(&self, event: &TrackedEvent) {
        for observer in self.observers.lock().unwrap().iter() {
            observer(event);
        }
    }

    fn spawn_flush(&self) {
        let flush = Arc::clone(&self.flush);
        self.runtime.spawn(async move {
            if let Err(e) = flush.flush_data().await {
                tracing::error!(error = %e, "Background flush failed");
            }
        });
    }
}

/// A campaign link needs a scheme and a non-empty query string carrying the
/// attribution parameters.
fn is_campaign_url(url: &str) -> bool {
    let Some((scheme, rest)) = url.split_once("://") else {
        return false;
    };
    if scheme.is_empty() {
        return false;
    }
    matches!(rest.split_once('?'), Some((_, query)) if !query.is_empty())
}
