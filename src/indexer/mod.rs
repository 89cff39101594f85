//! Bulk backfill and live maintenance of the search index.
//!
//! A build walks the mailbox newest to oldest one page at a time. Every
//! message of a page becomes its own unit of work (fetch detail, decrypt,
//! extract, encrypt, store); units run concurrently up to `worker_limit`
//! and the page counts as done only when all of them finished. Pausing
//! cancels the current run's token: units that already started run to
//! completion, nothing new is started, and the watermark only ever moves
//! past fully processed pages.
mod events;
mod progress;

pub use progress::estimate_minutes_remaining;

use crate::cache::CacheSlot;
use crate::config::EngineConfig;
use crate::crypto::SearchCipher;
use crate::engine::Collaborators;
use crate::errors::EngineResult;
use crate::mailbox::{
    BackgroundTask, Mailbox, MailboxEvent, MessageDecryptor, MessageMetadata, MessagePage,
    NetworkStatus, SystemSignal, ThermalState,
};
use crate::sanitize;
use crate::storage::IndexStore;
use crate::types::{
    now_ts, BuildPhase, BuildProgress, DecryptedMessageContent, IndexState, IndexedMessage,
    PauseReasons,
};
use events::QueueItem;
use futures::stream::{self, StreamExt};
use progress::EtaWindow;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Metadata key under which the build watermark is persisted.
pub const WATERMARK_KEY: &str = "last_message_time_indexed";
/// Metadata key holding the unix time the last build finished.
pub const LAST_BUILT_KEY: &str = "last_build_completed_at";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BuildOutcome {
    Complete,
    /// Stopped early because the index reached its storage limit.
    Partial,
    Paused(PauseReasons),
    /// Stopped without a pause reason (engine shutdown or index deletion).
    Cancelled,
}

enum UnitOutcome {
    Indexed,
    Skipped,
    StoreFailed,
}

#[derive(Default)]
struct PageTally {
    candidates: usize,
    indexed: usize,
    skipped: usize,
    store_failed: usize,
}

struct BuildState {
    reasons: PauseReasons,
    cancel: CancellationToken,
    watermark: Option<i64>,
    eta: EtaWindow,
    background_active: bool,
}

struct Inner {
    user_id: String,
    config: EngineConfig,
    store: Arc<IndexStore>,
    cipher: Arc<SearchCipher>,
    cache: Arc<CacheSlot>,
    mailbox: Arc<dyn Mailbox>,
    decryptor: Arc<dyn MessageDecryptor>,
    background: Arc<dyn BackgroundTask>,
    state: Mutex<BuildState>,
    /// Parent of every run's token; once cancelled no run starts again.
    shutdown: CancellationToken,
    progress: watch::Sender<BuildProgress>,
    /// Runs that are queued or executing.
    runs: watch::Sender<usize>,
    run_lock: tokio::sync::Mutex<()>,
    events: mpsc::UnboundedSender<QueueItem>,
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, BuildState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_phase(&self, phase: BuildPhase) {
        self.progress.send_modify(|p| p.phase = phase);
    }
}

/// Handle to a user's index builder. Cheap to clone; all clones drive the
/// same state machine.
#[derive(Clone)]
pub struct IndexBuilder {
    inner: Arc<Inner>,
}

impl IndexBuilder {
    /// Must be called inside a tokio runtime: it starts the event queue task.
    pub fn new(
        user_id: &str,
        config: EngineConfig,
        store: Arc<IndexStore>,
        cipher: Arc<SearchCipher>,
        cache: Arc<CacheSlot>,
        collaborators: &Collaborators,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (progress, _) = watch::channel(BuildProgress::default());
        let (runs, _) = watch::channel(0usize);

        let inner = Arc::new(Inner {
            user_id: user_id.to_string(),
            state: Mutex::new(BuildState {
                reasons: PauseReasons::default(),
                cancel: CancellationToken::new(),
                watermark: None,
                eta: EtaWindow::new(config.eta_window),
                background_active: false,
            }),
            config,
            store,
            cipher,
            cache,
            shutdown: CancellationToken::new(),
            mailbox: collaborators.mailbox.clone(),
            decryptor: collaborators.decryptor.clone(),
            background: collaborators.background.clone(),
            progress,
            runs,
            run_lock: tokio::sync::Mutex::new(()),
            events: events_tx,
        });

        tokio::spawn(events::run_queue(
            Arc::downgrade(&inner),
            events_rx,
            inner.progress.subscribe(),
        ));

        Self { inner }
    }

    pub fn progress(&self) -> BuildProgress {
        self.inner.progress.borrow().clone()
    }

    pub fn index_state(&self) -> IndexState {
        self.progress().index_state()
    }

    pub fn subscribe(&self) -> watch::Receiver<BuildProgress> {
        self.inner.progress.subscribe()
    }

    pub fn pause_reasons(&self) -> PauseReasons {
        self.inner.lock_state().reasons
    }

    /// Timestamp the next page request starts from (inclusive).
    pub fn watermark(&self) -> Option<i64> {
        self.inner.lock_state().watermark
    }

    /// Runs the build on the current task until it completes, pauses or
    /// hits the storage limit.
    pub async fn build(&self) -> EngineResult<BuildOutcome> {
        self.inner.runs.send_modify(|n| *n += 1);
        self.run().await
    }

    pub fn spawn_build(&self) -> JoinHandle<EngineResult<BuildOutcome>> {
        self.inner.runs.send_modify(|n| *n += 1);
        if self.pause_reasons().is_empty() && !self.is_stopped() {
            self.inner.set_phase(BuildPhase::Building);
        }
        let builder = self.clone();
        tokio::spawn(async move { builder.run().await })
    }

    /// Starts a build when the index holds fewer rows than the server reports.
    pub async fn refresh(&self) -> EngineResult<bool> {
        if matches!(
            self.progress().phase,
            BuildPhase::Building | BuildPhase::Completing
        ) {
            return Ok(false);
        }

        let stored = self.inner.store.count().await?;
        let page = self
            .inner
            .mailbox
            .fetch_page(&self.inner.config.label, None)
            .await?;
        let total = page.total;
        self.inner.progress.send_modify(|p| {
            p.processed = stored;
            p.total = total;
            p.percent = progress::percent(stored, total);
        });

        if stored < total {
            info!(user = %self.inner.user_id, stored, total, "Index behind mailbox; starting build");
            self.spawn_build();
            return Ok(true);
        }
        Ok(false)
    }

    /// Resolves once no build is queued or running.
    pub async fn wait_until_settled(&self) -> BuildProgress {
        let mut runs = self.inner.runs.subscribe();
        let _ = runs.wait_for(|n| *n == 0).await;
        self.progress()
    }

    pub fn pause(&self) {
        self.update_reasons(|r| r.user = true);
    }

    /// Clears the user pause and any failure pauses; the build resumes when
    /// no other trigger still holds it.
    pub fn resume(&self) {
        self.update_reasons(|r| {
            r.user = false;
            r.fetch_failures = false;
            r.storage_failures = false;
        });
    }

    /// Shuts the builder down: the current run and any run still queued
    /// end without indexing further. No pause reason is recorded.
    pub fn stop(&self) {
        self.inner.shutdown.cancel();
        info!(user = %self.inner.user_id, "Index builder stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    pub fn handle_signal(&self, signal: SystemSignal) {
        debug!(user = %self.inner.user_id, ?signal, "System signal");
        match signal {
            SystemSignal::Network(status) => {
                let blocked = match status {
                    NetworkStatus::Offline => true,
                    NetworkStatus::Cellular => self.inner.config.wifi_only,
                    NetworkStatus::Wifi => false,
                };
                self.update_reasons(|r| r.network = blocked);
            }
            SystemSignal::Thermal(ThermalState::Critical) => {
                self.update_reasons(|r| r.thermal = true)
            }
            SystemSignal::Thermal(ThermalState::Nominal | ThermalState::Fair) => {
                self.update_reasons(|r| r.thermal = false)
            }
            SystemSignal::Thermal(ThermalState::Serious) => {}
            SystemSignal::BackgroundTimeExpired => {
                self.update_reasons(|r| r.background_time = true)
            }
            SystemSignal::BackgroundTimeRenewed => {
                self.update_reasons(|r| r.background_time = false)
            }
        }
    }

    /// Queues a mailbox change. Applied immediately unless a build is
    /// running, otherwise once it stops; always in arrival order.
    pub fn submit_event(&self, event: MailboxEvent) {
        if self.inner.events.send(QueueItem::Event(event)).is_err() {
            warn!(user = %self.inner.user_id, "Event queue closed; dropping mailbox event");
        }
    }

    /// Resolves once every event submitted before this call was applied.
    pub async fn flush_events(&self) {
        let (tx, rx) = oneshot::channel();
        if self.inner.events.send(QueueItem::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    fn update_reasons(&self, change: impl FnOnce(&mut PauseReasons)) {
        let (before, after) = {
            let mut state = self.inner.lock_state();
            let before = state.reasons;
            change(&mut state.reasons);
            if !state.reasons.is_empty() {
                state.cancel.cancel();
            }
            (before, state.reasons)
        };
        if before == after {
            return;
        }

        let mut resume = false;
        self.inner.progress.send_modify(|p| {
            p.pause_reasons = after;
            if !after.is_empty() && p.phase == BuildPhase::Building {
                p.phase = BuildPhase::Paused;
            }
            if after.is_empty() && p.phase == BuildPhase::Paused {
                resume = true;
            }
        });

        if after.is_empty() {
            info!(user = %self.inner.user_id, "Pause reasons cleared");
        } else {
            info!(user = %self.inner.user_id, reasons = ?after, "Search index build paused");
        }
        if resume {
            self.spawn_build();
        }
    }

    async fn run(&self) -> EngineResult<BuildOutcome> {
        let result = {
            let _run = self.inner.run_lock.lock().await;
            self.run_locked().await
        };

        if let Err(e) = &result {
            let message = e.to_string();
            self.inner
                .progress
                .send_modify(|p| p.last_error = Some(message));
        }

        // The last run out decides the resting phase.
        if *self.inner.runs.borrow() == 1 {
            let phase = match &result {
                Ok(BuildOutcome::Complete | BuildOutcome::Partial | BuildOutcome::Cancelled) => {
                    BuildPhase::Idle
                }
                Ok(BuildOutcome::Paused(_)) => BuildPhase::Paused,
                Err(_) if self.pause_reasons().is_empty() => BuildPhase::Idle,
                Err(_) => BuildPhase::Paused,
            };
            self.inner.set_phase(phase);
        }
        self.inner.runs.send_modify(|n| *n = n.saturating_sub(1));
        result
    }

    async fn run_locked(&self) -> EngineResult<BuildOutcome> {
        let (cancel, begin) = {
            let mut state = self.inner.lock_state();
            if self.inner.shutdown.is_cancelled() {
                return Ok(BuildOutcome::Cancelled);
            }
            if !state.reasons.is_empty() {
                return Ok(BuildOutcome::Paused(state.reasons));
            }
            state.cancel = self.inner.shutdown.child_token();
            let begin = !state.background_active;
            state.background_active = true;
            (state.cancel.clone(), begin)
        };
        if begin {
            self.inner.background.begin();
        }

        self.inner.progress.send_modify(|p| {
            p.phase = BuildPhase::Building;
            p.partial = false;
            p.last_error = None;
        });

        let started = Instant::now();
        info!(user = %self.inner.user_id, "Search index build started");
        let outcome = self.run_pages(&cancel).await?;

        match &outcome {
            BuildOutcome::Complete => self.complete(false).await,
            BuildOutcome::Partial => self.complete(true).await,
            BuildOutcome::Paused(reasons) => {
                info!(user = %self.inner.user_id, reasons = ?reasons, "Build run paused")
            }
            BuildOutcome::Cancelled => info!(user = %self.inner.user_id, "Build run cancelled"),
        }
        debug!(user = %self.inner.user_id, elapsed_ms = ?started.elapsed().as_millis(), "Build run finished");
        Ok(outcome)
    }

    async fn run_pages(&self, cancel: &CancellationToken) -> EngineResult<BuildOutcome> {
        let mut watermark = self.load_watermark().await;

        loop {
            if cancel.is_cancelled() {
                return Ok(self.stopped());
            }

            let Some(page) = self.fetch_page(watermark, cancel).await? else {
                return Ok(self.stopped());
            };
            let total = page.total;
            self.inner.progress.send_modify(|p| p.total = total);

            let Some(page_min) = page.messages.iter().map(|m| m.timestamp).min() else {
                debug!(user = %self.inner.user_id, ?watermark, "Empty page; mailbox exhausted");
                return Ok(BuildOutcome::Complete);
            };
            if cancel.is_cancelled() {
                return Ok(self.stopped());
            }

            let started = Instant::now();
            let page_len = page.limit.max(page.messages.len());
            let tally = self.process_page(page, cancel).await;

            if tally.skipped > 0 {
                // Partially processed; the page is fetched again on resume.
                return Ok(self.stopped());
            }
            if tally.candidates > 0 && tally.store_failed == tally.candidates {
                warn!(user = %self.inner.user_id, failed = tally.store_failed, "Every write of the page failed");
                self.inner.progress.send_modify(|p| {
                    p.last_error = Some("index store rejected every write of a page".into())
                });
                self.update_reasons(|r| r.storage_failures = true);
                return Ok(self.stopped());
            }

            let next = if tally.indexed == 0 && watermark == Some(page_min) {
                page_min - 1
            } else {
                page_min
            };
            watermark = Some(next);
            self.save_watermark(next).await;

            let (processed, size) = self.record_page(started.elapsed(), page_len).await;
            info!(
                user = %self.inner.user_id,
                indexed = tally.indexed,
                failed = tally.store_failed,
                processed,
                total,
                watermark = next,
                elapsed_ms = ?started.elapsed().as_millis(),
                "Indexed page"
            );

            if let Some(limit) = self.inner.config.storage_limit_bytes {
                if size > limit {
                    warn!(user = %self.inner.user_id, size_bytes = size, limit_bytes = limit, "Storage limit reached; index stays partial");
                    return Ok(BuildOutcome::Partial);
                }
            }
            if processed >= total {
                return Ok(BuildOutcome::Complete);
            }
        }
    }

    fn stopped(&self) -> BuildOutcome {
        let reasons = self.pause_reasons();
        if reasons.is_empty() {
            BuildOutcome::Cancelled
        } else {
            BuildOutcome::Paused(reasons)
        }
    }

    /// Fetches with exponential backoff. `Ok(None)` means the run was
    /// cancelled while waiting.
    async fn fetch_page(
        &self,
        end_time: Option<i64>,
        cancel: &CancellationToken,
    ) -> EngineResult<Option<MessagePage>> {
        let config = &self.inner.config;
        let mut failures = 0u32;

        loop {
            match self.inner.mailbox.fetch_page(&config.label, end_time).await {
                Ok(page) => return Ok(Some(page)),
                Err(e) => {
                    failures += 1;
                    warn!(user = %self.inner.user_id, failures, error = %e, "Page fetch failed");
                    if failures >= config.max_fetch_failures {
                        self.update_reasons(|r| r.fetch_failures = true);
                        return Err(e);
                    }
                }
            }

            let delay = Duration::from_millis(
                config
                    .retry_backoff_ms
                    .saturating_mul(1u64 << (failures - 1).min(16)),
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Ok(None),
            }
        }
    }

    async fn process_page(&self, page: MessagePage, cancel: &CancellationToken) -> PageTally {
        let mut candidates = Vec::with_capacity(page.messages.len());
        for message in page.messages {
            match self.inner.store.contains(&message.id).await {
                Ok(true) => {}
                Ok(false) => candidates.push(message),
                Err(e) => {
                    warn!(message_id = %message.id, error = %e, "Index lookup failed; reindexing");
                    candidates.push(message);
                }
            }
        }

        let mut tally = PageTally {
            candidates: candidates.len(),
            ..PageTally::default()
        };
        let outcomes: Vec<UnitOutcome> = stream::iter(candidates)
            .map(|message| self.run_unit(message, cancel))
            .buffer_unordered(self.inner.config.worker_limit.max(1))
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                UnitOutcome::Indexed => tally.indexed += 1,
                UnitOutcome::Skipped => tally.skipped += 1,
                UnitOutcome::StoreFailed => tally.store_failed += 1,
            }
        }
        tally
    }

    async fn run_unit(&self, message: MessageMetadata, cancel: &CancellationToken) -> UnitOutcome {
        if cancel.is_cancelled() {
            return UnitOutcome::Skipped;
        }
        let message_id = message.id.clone();
        match self.index_message(message).await {
            Ok(()) => UnitOutcome::Indexed,
            Err(e) => {
                warn!(message_id = %message_id, error = %e, "Writing index row failed");
                UnitOutcome::StoreFailed
            }
        }
    }

    /// Fetch detail, decrypt, extract, encrypt, store. Only the store write
    /// can fail; every other failure is recorded on the row.
    pub(crate) async fn index_message(&self, message: MessageMetadata) -> EngineResult<()> {
        let row = self.prepare_row(message).await;
        self.inner.store.insert(&row).await
    }

    async fn prepare_row(&self, message: MessageMetadata) -> IndexedMessage {
        let detail = if message.has_detail() {
            message
        } else {
            match self.inner.mailbox.fetch_detail(&message.id).await {
                Ok(detail) => detail,
                Err(e) => {
                    warn!(message_id = %message.id, error = %e, "Fetching message detail failed");
                    return base_row(&message).mark_decryption_failed();
                }
            }
        };

        let fallback = base_row(&detail);
        let decryptor = self.inner.decryptor.clone();
        let cipher = self.inner.cipher.clone();
        let remove_quotes = self.inner.config.remove_quotes;

        match tokio::task::spawn_blocking(move || {
            encrypt_row(decryptor.as_ref(), &cipher, &detail, remove_quotes)
        })
        .await
        {
            Ok(row) => row,
            Err(e) => {
                warn!(message_id = %fallback.message_id, error = %e, "Indexing task failed");
                fallback
            }
        }
    }

    async fn load_watermark(&self) -> Option<i64> {
        if let Some(watermark) = self.watermark() {
            return Some(watermark);
        }
        match self.inner.store.get_meta(WATERMARK_KEY).await {
            Ok(Some(raw)) => {
                let parsed = raw.parse::<i64>().ok();
                self.inner.lock_state().watermark = parsed;
                parsed
            }
            Ok(None) => None,
            Err(e) => {
                warn!(user = %self.inner.user_id, error = %e, "Loading watermark failed");
                None
            }
        }
    }

    async fn save_watermark(&self, watermark: i64) {
        self.inner.lock_state().watermark = Some(watermark);
        if let Err(e) = self
            .inner
            .store
            .set_meta(WATERMARK_KEY, &watermark.to_string())
            .await
        {
            warn!(user = %self.inner.user_id, error = %e, "Persisting watermark failed");
        }
    }

    /// Refreshes counts, size and the time estimate after a page.
    async fn record_page(&self, elapsed: Duration, page_len: usize) -> (u64, u64) {
        let processed = match self.inner.store.count().await {
            Ok(n) => n,
            Err(e) => {
                warn!(user = %self.inner.user_id, error = %e, "Counting index rows failed");
                self.progress().processed
            }
        };
        let size = self.inner.store.size_on_disk().await.unwrap_or_else(|e| {
            warn!(user = %self.inner.user_id, error = %e, "Measuring index failed");
            self.progress().index_size_bytes
        });
        let average = {
            let mut state = self.inner.lock_state();
            state.eta.record(elapsed);
            state.eta.average()
        };

        self.inner.progress.send_modify(|p| {
            p.processed = processed;
            p.index_size_bytes = size;
            p.percent = progress::percent(processed, p.total);
            p.minutes_remaining = average.map(|avg| {
                estimate_minutes_remaining(avg, p.total.saturating_sub(processed), page_len)
            });
        });
        (processed, size)
    }

    /// End-of-build bookkeeping, once per finished build.
    async fn complete(&self, partial: bool) {
        self.inner.set_phase(BuildPhase::Completing);

        let processed = self.inner.store.count().await.unwrap_or_else(|e| {
            warn!(user = %self.inner.user_id, error = %e, "Counting index rows failed");
            self.progress().processed
        });
        let size = self.inner.store.size_on_disk().await.unwrap_or(0);

        self.inner.progress.send_modify(|p| {
            p.processed = processed;
            p.index_size_bytes = size;
            p.partial = partial;
            if partial {
                p.percent = progress::percent(processed, p.total);
                p.minutes_remaining = None;
            } else {
                p.percent = 100.0;
                p.minutes_remaining = Some(0);
            }
        });

        let end = {
            let mut state = self.inner.lock_state();
            state.eta.clear();
            std::mem::replace(&mut state.background_active, false)
        };
        if end {
            self.inner.background.end();
        }
        self.inner.cache.invalidate();

        if let Err(e) = self
            .inner
            .store
            .set_meta(LAST_BUILT_KEY, &now_ts().to_string())
            .await
        {
            warn!(user = %self.inner.user_id, error = %e, "Recording build time failed");
        }

        info!(
            user = %self.inner.user_id,
            processed,
            size_bytes = size,
            partial,
            "Search index build complete"
        );
    }
}

fn base_row(message: &MessageMetadata) -> IndexedMessage {
    IndexedMessage::metadata_only(
        &message.id,
        message.timestamp,
        message.order,
        message.label_ids.clone(),
        message.location,
    )
}

fn encrypt_row(
    decryptor: &dyn MessageDecryptor,
    cipher: &SearchCipher,
    detail: &MessageMetadata,
    remove_quotes: bool,
) -> IndexedMessage {
    let base = base_row(detail);

    let raw_body = match decryptor.decrypt(detail) {
        Ok(body) => body,
        Err(e) => {
            warn!(message_id = %detail.id, error = %e, "Message decryption failed");
            return base.mark_decryption_failed();
        }
    };

    let Some(body) =
        sanitize::extract_or_none(&detail.id, &raw_body, &detail.mime_type, remove_quotes)
    else {
        return base;
    };

    let content = DecryptedMessageContent {
        subject: detail.subject.clone(),
        sender: detail.sender.clone(),
        to_list: detail.to_list.clone(),
        cc_list: detail.cc_list.clone(),
        bcc_list: detail.bcc_list.clone(),
        body,
    };
    match cipher.encrypt(&content) {
        Ok(payload) => base.with_content(payload),
        Err(e) => {
            warn!(message_id = %detail.id, error = %e, "Encrypting content failed");
            base
        }
    }
}
