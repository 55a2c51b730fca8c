//! The campaign dispatch engine.
//!
//! A [`Manager`] polls its [`Store`](store::Store) for runnable campaigns,
//! runs one producer task per running campaign, and drains the shared
//! message channel with a fixed pool of workers that deliver through
//! registered messengers under process-global rate control.
//!
//! There is no fairness between concurrently running campaigns: messages are
//! processed in enqueue order across all campaigns. Operators bound the
//! number of campaigns running at once instead.

#![deny(clippy::pedantic, clippy::all)]
#![allow(
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::module_name_repetitions
)]

pub mod ratelimit;
pub mod render;
pub mod store;

mod pipeline;
mod worker;

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use courier_common::{
    config::ConfigError,
    models::{Campaign, CampaignStatus, Message},
    Config,
};
use courier_messenger::Registry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::{sync::Notify, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{ratelimit::RateLimiter, render::CompiledCampaign};

pub use store::{MemoryStore, Store, StoreError};

/// Consecutive counter-flush failures tolerated before a campaign is
/// cancelled with reason "store-error".
const FLUSH_FAILURE_GRACE: u32 = 5;

/// The engine has been stopped; no further messages are accepted.
#[derive(Debug, Error)]
#[error("dispatch engine is stopped")]
pub struct Stopped;

/// Operator-facing event fired on campaign completion or cancellation.
#[derive(Debug, Clone)]
pub struct Notification {
    pub campaign_id: u64,
    pub campaign_uuid: Uuid,
    pub campaign_name: String,
    pub status: CampaignStatus,
    pub reason: Option<String>,
}

type NotifyFn = dyn Fn(Notification) + Send + Sync;

/// One unit of work on the shared channel.
pub(crate) struct Job {
    pub(crate) message: Message,
    pub(crate) campaign_id: Option<u64>,
}

/// In-memory record of one running (or paused) campaign.
///
/// Created when the campaign starts, released on its terminal transition.
pub(crate) struct CampaignRuntime {
    pub(crate) id: u64,
    pub(crate) uuid: Uuid,
    pub(crate) name: String,
    pub(crate) compiled: CompiledCampaign,
    pub(crate) cancel: CancellationToken,
    paused: AtomicBool,
    pub(crate) resume: Notify,
    /// Transient send errors seen so far.
    pub(crate) errors: AtomicU64,
    /// Messages enqueued but not yet terminally handled.
    pub(crate) in_flight: AtomicU64,
    /// Set once the producer has run out of audience.
    pub(crate) exhausted: AtomicBool,
    finalized: AtomicBool,
    /// Messages handed to the channel over the runtime's lifetime.
    pub(crate) enqueued: AtomicU64,
    /// Messages that reached a terminal outcome.
    pub(crate) completed: AtomicU64,
    /// Closed batches awaiting the completion watermark:
    /// (enqueued count when the batch closed, last subscriber id in it).
    pub(crate) batch_marks: Mutex<std::collections::VecDeque<(u64, u64)>>,
    /// Highest subscriber id handed to the channel.
    pub(crate) cursor: AtomicU64,
    /// Sent-counter updates not yet flushed to the store.
    pub(crate) buffered_sent: AtomicU64,
    pub(crate) flush_failures: AtomicU32,
}

impl CampaignRuntime {
    fn new(campaign: &Campaign, compiled: CompiledCampaign, cancel: CancellationToken) -> Self {
        Self {
            id: campaign.id,
            uuid: campaign.uuid,
            name: campaign.name.clone(),
            compiled,
            cancel,
            paused: AtomicBool::new(campaign.status == CampaignStatus::Paused),
            resume: Notify::new(),
            errors: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
            exhausted: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
            enqueued: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            batch_marks: Mutex::new(std::collections::VecDeque::new()),
            cursor: AtomicU64::new(campaign.last_subscriber_id),
            buffered_sent: AtomicU64::new(0),
            flush_failures: AtomicU32::new(0),
        }
    }

    /// Highest subscriber id of a batch whose messages have all reached a
    /// terminal outcome. The persisted cursor never runs ahead of actual
    /// completions, so a restart repeats at most the open batches and loses
    /// nothing.
    fn completed_cursor(&self) -> Option<u64> {
        let completed = self.completed.load(Ordering::SeqCst);
        let mut marks = self.batch_marks.lock();
        let mut safe = None;
        while marks.front().is_some_and(|(enqueued, _)| *enqueued <= completed) {
            safe = marks.pop_front().map(|(_, id)| id);
        }
        safe
    }

    pub(crate) fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
        if !paused {
            self.resume.notify_one();
        }
    }

    /// First caller wins the right to run the terminal transition.
    fn try_finalize(&self) -> bool {
        !self.finalized.swap(true, Ordering::SeqCst)
    }

    fn unfinalize(&self) {
        self.finalized.store(false, Ordering::SeqCst);
    }
}

pub(crate) enum FlushOutcome {
    Clean,
    Failed { exceeded: bool },
}

pub(crate) struct Inner {
    pub(crate) config: Config,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) registry: Registry,
    pub(crate) runtimes: DashMap<u64, Arc<CampaignRuntime>>,
    pub(crate) limiter: RateLimiter,
    pub(crate) tx: async_channel::Sender<Job>,
    pub(crate) rx: async_channel::Receiver<Job>,
    pub(crate) cancel: CancellationToken,
    notify: RwLock<Option<Box<NotifyFn>>>,
    workers: Mutex<Option<JoinSet<()>>>,
}

impl Inner {
    pub(crate) fn emit(&self, runtime: &CampaignRuntime, status: CampaignStatus, reason: Option<&str>) {
        if let Some(callback) = self.notify.read().as_ref() {
            callback(Notification {
                campaign_id: runtime.id,
                campaign_uuid: runtime.uuid,
                campaign_name: runtime.name.clone(),
                status,
                reason: reason.map(str::to_string),
            });
        }
    }

    fn emit_for_campaign(&self, campaign: &Campaign, status: CampaignStatus, reason: Option<&str>) {
        if let Some(callback) = self.notify.read().as_ref() {
            callback(Notification {
                campaign_id: campaign.id,
                campaign_uuid: campaign.uuid,
                campaign_name: campaign.name.clone(),
                status,
                reason: reason.map(str::to_string),
            });
        }
    }

    /// Flush the campaign's buffered sent-counter and cursor to the store.
    ///
    /// On failure the delta is put back for the next attempt, so a buffer of
    /// Δ always reaches the store as exactly Δ.
    pub(crate) async fn flush_campaign(&self, runtime: &CampaignRuntime) -> FlushOutcome {
        let delta = runtime.buffered_sent.swap(0, Ordering::SeqCst);
        if delta == 0 {
            return FlushOutcome::Clean;
        }

        match self.store.increment_campaign_count(runtime.id, delta).await {
            Ok(()) => {
                runtime.flush_failures.store(0, Ordering::SeqCst);
                if let Some(cursor) = runtime.completed_cursor() {
                    if let Err(e) = self.store.save_cursor(runtime.id, cursor).await {
                        warn!(campaign_id = runtime.id, error = %e, "error saving cursor");
                    }
                }
                FlushOutcome::Clean
            }
            Err(e) => {
                runtime.buffered_sent.fetch_add(delta, Ordering::SeqCst);
                let failures = runtime.flush_failures.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(
                    campaign_id = runtime.id,
                    attempt = failures,
                    error = %e,
                    "error flushing sent counters"
                );
                FlushOutcome::Failed {
                    exceeded: failures > FLUSH_FAILURE_GRACE,
                }
            }
        }
    }

    /// Flush and, on sustained store failure, cancel the campaign.
    pub(crate) async fn flush_and_police(&self, runtime: &Arc<CampaignRuntime>) {
        if let FlushOutcome::Failed { exceeded: true } = self.flush_campaign(runtime).await {
            self.cancel_campaign_runtime(runtime, "store-error").await;
        }
    }

    /// Finish the campaign once its audience is exhausted and the last
    /// in-flight message is accounted for.
    pub(crate) async fn maybe_finish(&self, runtime: &Arc<CampaignRuntime>) {
        if !runtime.exhausted.load(Ordering::SeqCst)
            || runtime.in_flight.load(Ordering::SeqCst) != 0
            || !runtime.try_finalize()
        {
            return;
        }

        // The final flush must land before the terminal transition; when the
        // store is down, back off and let the flush tick try again.
        match self.flush_campaign(runtime).await {
            FlushOutcome::Clean => {}
            FlushOutcome::Failed { exceeded } => {
                if exceeded {
                    runtime.unfinalize();
                    self.cancel_campaign_runtime(runtime, "store-error").await;
                } else {
                    runtime.unfinalize();
                }
                return;
            }
        }

        match self
            .store
            .update_campaign_status(runtime.id, CampaignStatus::Finished, None)
            .await
        {
            Ok(()) => {
                info!(campaign = %runtime.name, "campaign finished");
                self.emit(runtime, CampaignStatus::Finished, None);
            }
            Err(e) => {
                // Raced an external terminal transition; nothing to do.
                warn!(campaign = %runtime.name, error = %e, "could not mark campaign finished");
            }
        }

        self.runtimes.remove(&runtime.id);
    }

    /// Cancel a running campaign: stop production, flush what we have,
    /// record the reason, notify, and release the runtime.
    pub(crate) async fn cancel_campaign_runtime(
        &self,
        runtime: &Arc<CampaignRuntime>,
        reason: &str,
    ) {
        if !runtime.try_finalize() {
            return;
        }

        runtime.cancel.cancel();
        let _ = self.flush_campaign(runtime).await;

        if let Err(e) = self
            .store
            .update_campaign_status(runtime.id, CampaignStatus::Cancelled, Some(reason))
            .await
        {
            warn!(campaign_id = runtime.id, error = %e, "error recording campaign cancellation");
        }

        info!(campaign = %runtime.name, reason, "campaign cancelled");
        self.emit(runtime, CampaignStatus::Cancelled, Some(reason));
        self.runtimes.remove(&runtime.id);
    }

    /// One poll of the store: start what became runnable, reconcile what is
    /// tracked in memory against externally-changed statuses.
    async fn scan(self: &Arc<Self>) {
        let campaigns = match self.store.next_campaigns().await {
            Ok(campaigns) => campaigns,
            Err(e) => {
                error!(error = %e, "error scanning for campaigns");
                return;
            }
        };

        let mut seen = HashSet::new();
        for campaign in campaigns {
            seen.insert(campaign.id);

            if let Some(entry) = self.runtimes.get(&campaign.id) {
                if campaign.status == CampaignStatus::Running && entry.paused() {
                    info!(campaign = %campaign.name, "campaign resumed");
                    entry.set_paused(false);
                }
                continue;
            }

            self.launch(campaign).await;
        }

        // Tracked runtimes that dropped out of the runnable set changed
        // status externally (pause, cancel) or were finished elsewhere.
        let missing: Vec<Arc<CampaignRuntime>> = self
            .runtimes
            .iter()
            .filter(|entry| !seen.contains(&entry.id))
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for runtime in missing {
            match self.store.campaign(runtime.id).await {
                Ok(campaign) => match campaign.status {
                    CampaignStatus::Paused => {
                        if !runtime.paused() {
                            info!(campaign = %runtime.name, "campaign paused");
                            runtime.set_paused(true);
                        }
                    }
                    CampaignStatus::Cancelled => {
                        self.cancel_campaign_runtime(
                            &runtime,
                            campaign.status_reason.as_deref().unwrap_or("operator"),
                        )
                        .await;
                    }
                    CampaignStatus::Finished => {
                        if runtime.try_finalize() {
                            runtime.cancel.cancel();
                            self.runtimes.remove(&runtime.id);
                        }
                    }
                    CampaignStatus::Draft
                    | CampaignStatus::Scheduled
                    | CampaignStatus::Running => {}
                },
                Err(e) => {
                    error!(campaign_id = runtime.id, error = %e, "error reconciling campaign");
                }
            }
        }
    }

    /// Bring a newly-runnable campaign up: verify its messenger, seed the
    /// expected total, compile templates, and start its producer.
    async fn launch(self: &Arc<Self>, mut campaign: Campaign) {
        if campaign.status == CampaignStatus::Scheduled {
            if let Err(e) = self
                .store
                .update_campaign_status(campaign.id, CampaignStatus::Running, None)
                .await
            {
                error!(campaign_id = campaign.id, error = %e, "error starting scheduled campaign");
                return;
            }
            campaign.status = CampaignStatus::Running;
        }

        if !self.registry.contains(&campaign.messenger) {
            let reason = format!("unknown messenger \"{}\"", campaign.messenger);
            error!(
                campaign = %campaign.name,
                messenger = %campaign.messenger,
                "cancelling campaign: messenger is not registered"
            );
            let _ = self
                .store
                .update_campaign_status(campaign.id, CampaignStatus::Cancelled, Some(&reason))
                .await;
            self.emit_for_campaign(&campaign, CampaignStatus::Cancelled, Some(&reason));
            return;
        }

        // Store hiccups here are left for the next scan to retry.
        let audience = match self.store.campaign_audience_size(campaign.id).await {
            Ok(size) => size,
            Err(e) => {
                error!(campaign_id = campaign.id, error = %e, "error sizing campaign audience");
                return;
            }
        };
        if let Err(e) = self.store.set_campaign_to_send(campaign.id, audience).await {
            error!(campaign_id = campaign.id, error = %e, "error recording campaign to_send");
            return;
        }

        match render::compile(&campaign, &self.config, self.store.as_ref()).await {
            Ok(compiled) => {
                let runtime = Arc::new(CampaignRuntime::new(
                    &campaign,
                    compiled,
                    self.cancel.child_token(),
                ));
                self.runtimes.insert(campaign.id, Arc::clone(&runtime));
                info!(
                    campaign = %campaign.name,
                    recipients = audience,
                    messenger = %campaign.messenger,
                    "campaign started"
                );
                tokio::spawn(pipeline::produce(Arc::clone(self), runtime));
            }
            Err(e) => {
                error!(campaign = %campaign.name, error = %e, "template compilation failed");
                let _ = self
                    .store
                    .update_campaign_status(
                        campaign.id,
                        CampaignStatus::Cancelled,
                        Some("render-error"),
                    )
                    .await;
                self.emit_for_campaign(&campaign, CampaignStatus::Cancelled, Some("render-error"));
            }
        }
    }

    async fn flush_all(self: &Arc<Self>) {
        let runtimes: Vec<Arc<CampaignRuntime>> = self
            .runtimes
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for runtime in runtimes {
            self.flush_and_police(&runtime).await;
            // A finish that was blocked on a failed flush completes here.
            self.maybe_finish(&runtime).await;
        }
    }
}

/// The engine handle: start with [`run`](Manager::run), stop with
/// [`stop`](Manager::stop), inject ad-hoc messages with
/// [`push`](Manager::push).
pub struct Manager {
    inner: Arc<Inner>,
}

impl Manager {
    /// Build an engine over a store and a set of registered messengers.
    ///
    /// # Errors
    /// If the configuration fails validation.
    pub fn new(
        mut config: Config,
        store: Arc<dyn Store>,
        registry: Registry,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        // Sized so workers never starve while the queue stays bounded.
        let (tx, rx) = async_channel::bounded(config.concurrency * 2);

        Ok(Self {
            inner: Arc::new(Inner {
                limiter: RateLimiter::new(&config),
                config,
                store,
                registry,
                runtimes: DashMap::new(),
                tx,
                rx,
                cancel: CancellationToken::new(),
                notify: RwLock::new(None),
                workers: Mutex::new(None),
            }),
        })
    }

    /// Install the operator callback fired on campaign completion and
    /// cancellation.
    pub fn set_notify(&self, callback: impl Fn(Notification) + Send + Sync + 'static) {
        *self.inner.notify.write() = Some(Box::new(callback));
    }

    /// Run the engine: spawn the worker pool and poll the store until
    /// [`stop`](Manager::stop) is called.
    pub async fn run(&self) {
        info!(
            concurrency = self.inner.config.concurrency,
            message_rate = self.inner.config.message_rate,
            "dispatch engine starting"
        );

        {
            let mut workers = JoinSet::new();
            for _ in 0..self.inner.config.concurrency {
                workers.spawn(worker::worker_loop(Arc::clone(&self.inner)));
            }
            *self.inner.workers.lock() = Some(workers);
        }

        let mut scan_timer =
            tokio::time::interval(Duration::from_secs(self.inner.config.scan_interval_secs));
        let mut flush_timer =
            tokio::time::interval(Duration::from_secs(self.inner.config.flush_interval_secs));

        loop {
            tokio::select! {
                biased;
                () = self.inner.cancel.cancelled() => break,
                _ = scan_timer.tick() => self.inner.scan().await,
                _ = flush_timer.tick() => self.inner.flush_all().await,
            }
        }
    }

    /// Gracefully stop: cancel all runtimes, stop production, and wait up to
    /// `shutdown_grace` for workers to drain their in-flight messages.
    /// Exceeding the grace abandons the remaining workers with a warning;
    /// their queued messages are lost and counters may undercount.
    pub async fn stop(&self) {
        info!("dispatch engine stopping");
        self.inner.cancel.cancel();

        let grace = Duration::from_secs(self.inner.config.shutdown_grace_secs);
        let workers = self.inner.workers.lock().take();
        if let Some(mut workers) = workers {
            let drained = tokio::time::timeout(grace, async {
                while workers.join_next().await.is_some() {}
            })
            .await;

            if drained.is_err() {
                warn!(
                    grace_secs = self.inner.config.shutdown_grace_secs,
                    abandoned = workers.len(),
                    "shutdown grace exceeded; abandoning workers"
                );
                workers.abort_all();
            }
        }

        // Best-effort final accounting.
        let runtimes: Vec<Arc<CampaignRuntime>> = self
            .inner
            .runtimes
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for runtime in runtimes {
            let _ = self.inner.flush_campaign(&runtime).await;
        }

        self.inner.registry.close_all().await;
        info!("dispatch engine stopped");
    }

    /// Inject an ad-hoc message, e.g. an operator notification. It shares
    /// the worker pool and rate limits but bypasses the campaign pipeline.
    pub async fn push(&self, message: Message) -> Result<(), Stopped> {
        tokio::select! {
            biased;
            () = self.inner.cancel.cancelled() => Err(Stopped),
            sent = self.inner.tx.send(Job { message, campaign_id: None }) => {
                sent.map_err(|_| Stopped)
            }
        }
    }

    /// Number of campaigns currently tracked in memory.
    pub fn running_campaigns(&self) -> usize {
        self.inner.runtimes.len()
    }
}
