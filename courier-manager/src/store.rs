//! Store adapter: the engine's only view of persistent state.
//!
//! The schema itself lives elsewhere; the engine reaches it through the
//! [`Store`] trait. [`MemoryStore`] is a complete in-process implementation
//! used by the test suite and the binary's demo mode.

use std::{
    collections::{BTreeMap, HashMap},
    fmt::Debug,
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use chrono::Utc;
use courier_common::models::{Campaign, CampaignStatus, Subscriber, SubscriberStatus};
use parking_lot::RwLock;
use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No campaign with the given id.
    #[error("campaign not found: {0}")]
    NotFound(u64),

    /// A terminal campaign status cannot be left.
    #[error("illegal status transition: {from} -> {to}")]
    InvalidTransition {
        from: CampaignStatus,
        to: CampaignStatus,
    },

    /// The backing store is temporarily unreachable.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Anything else.
    #[error("store error: {0}")]
    Internal(String),
}

/// Specialized `Result` type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Persistence boundary of the campaign engine.
///
/// Cursor pagination in [`next_subscribers`](Store::next_subscribers) is
/// monotone: the pipeline relies on it to never double-send within a single
/// run. Implementations are assumed internally thread-safe.
#[async_trait]
pub trait Store: Send + Sync + Debug {
    /// Campaigns that should be running: status `scheduled` with a due
    /// `send_at`, or status `running`.
    async fn next_campaigns(&self) -> Result<Vec<Campaign>>;

    /// Fetch one campaign.
    async fn campaign(&self, id: u64) -> Result<Campaign>;

    /// Up to `limit` enabled subscribers of the campaign's audience with
    /// `id > after_id`, ordered by id ascending.
    async fn next_subscribers(
        &self,
        campaign_id: u64,
        after_id: u64,
        limit: usize,
    ) -> Result<Vec<Subscriber>>;

    /// Idempotent status transition. Rejects terminal -> non-terminal.
    /// Stamps `started_at` on the first transition to running and
    /// `finished_at` on a terminal transition.
    async fn update_campaign_status(
        &self,
        id: u64,
        status: CampaignStatus,
        reason: Option<&str>,
    ) -> Result<()>;

    /// Number of enabled subscribers in the campaign's audience.
    async fn campaign_audience_size(&self, id: u64) -> Result<u64>;

    /// Record the expected total for this run.
    async fn set_campaign_to_send(&self, id: u64, to_send: u64) -> Result<()>;

    /// Additive sent-counter update, safe under concurrent calls. The stored
    /// counter never exceeds `to_send`: redeliveries across a restart
    /// boundary are clamped rather than inflating the total.
    async fn increment_campaign_count(&self, id: u64, delta: u64) -> Result<()>;

    /// Persist the progress cursor alongside the counters.
    async fn save_cursor(&self, id: u64, last_subscriber_id: u64) -> Result<()>;

    /// Stable, deduplicated UUID for a tracked URL.
    async fn create_link(&self, url: &str) -> Result<Uuid>;

    /// Operator-facing wrapper over [`update_campaign_status`](Store::update_campaign_status).
    async fn pause_campaign(&self, id: u64) -> Result<()> {
        self.update_campaign_status(id, CampaignStatus::Paused, None)
            .await
    }

    /// Operator-facing wrapper over [`update_campaign_status`](Store::update_campaign_status).
    async fn cancel_campaign(&self, id: u64) -> Result<()> {
        self.update_campaign_status(id, CampaignStatus::Cancelled, None)
            .await
    }
}

/// In-memory store.
///
/// Campaigns, per-campaign audiences, and the link table live in maps behind
/// `RwLock`s. Fine for tests and single-process demo runs; real deployments
/// put a database behind the [`Store`] trait instead.
#[derive(Debug, Default)]
pub struct MemoryStore {
    campaigns: RwLock<HashMap<u64, Campaign>>,
    audiences: RwLock<HashMap<u64, BTreeMap<u64, Subscriber>>>,
    links: RwLock<HashMap<String, Uuid>>,
    /// When set, counter updates fail with [`StoreError::Unavailable`].
    counter_outage: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_campaign(&self, campaign: Campaign) {
        self.campaigns.write().insert(campaign.id, campaign);
    }

    pub fn add_subscriber(&self, campaign_id: u64, subscriber: Subscriber) {
        self.audiences
            .write()
            .entry(campaign_id)
            .or_default()
            .insert(subscriber.id, subscriber);
    }

    pub fn add_subscribers(
        &self,
        campaign_id: u64,
        subscribers: impl IntoIterator<Item = Subscriber>,
    ) {
        let mut audiences = self.audiences.write();
        let audience = audiences.entry(campaign_id).or_default();
        for subscriber in subscribers {
            audience.insert(subscriber.id, subscriber);
        }
    }

    /// Snapshot a campaign, mostly for assertions.
    pub fn get_campaign(&self, id: u64) -> Option<Campaign> {
        self.campaigns.read().get(&id).cloned()
    }

    /// Number of distinct tracked links.
    pub fn link_count(&self) -> usize {
        self.links.read().len()
    }

    /// Toggle simulated counter-update failures.
    pub fn set_counter_outage(&self, failing: bool) {
        self.counter_outage.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn next_campaigns(&self) -> Result<Vec<Campaign>> {
        let now = Utc::now();
        let campaigns = self.campaigns.read();
        Ok(campaigns
            .values()
            .filter(|c| match c.status {
                CampaignStatus::Running => true,
                CampaignStatus::Scheduled => c.send_at.is_none_or(|at| at <= now),
                _ => false,
            })
            .cloned()
            .collect())
    }

    async fn campaign(&self, id: u64) -> Result<Campaign> {
        self.campaigns
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn next_subscribers(
        &self,
        campaign_id: u64,
        after_id: u64,
        limit: usize,
    ) -> Result<Vec<Subscriber>> {
        let audiences = self.audiences.read();
        let Some(audience) = audiences.get(&campaign_id) else {
            return Ok(Vec::new());
        };

        Ok(audience
            .range(after_id + 1..)
            .map(|(_, sub)| sub)
            .filter(|sub| sub.status == SubscriberStatus::Enabled)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn update_campaign_status(
        &self,
        id: u64,
        status: CampaignStatus,
        reason: Option<&str>,
    ) -> Result<()> {
        let mut campaigns = self.campaigns.write();
        let campaign = campaigns.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        if campaign.status == status {
            return Ok(());
        }
        if campaign.status.is_terminal() {
            return Err(StoreError::InvalidTransition {
                from: campaign.status,
                to: status,
            });
        }

        campaign.status = status;
        if let Some(reason) = reason {
            campaign.status_reason = Some(reason.to_string());
        }
        if status == CampaignStatus::Running && campaign.started_at.is_none() {
            campaign.started_at = Some(Utc::now());
        }
        if status.is_terminal() {
            campaign.finished_at = Some(Utc::now());
        }

        Ok(())
    }

    async fn campaign_audience_size(&self, id: u64) -> Result<u64> {
        let audiences = self.audiences.read();
        Ok(audiences
            .get(&id)
            .map(|audience| {
                audience
                    .values()
                    .filter(|sub| sub.status == SubscriberStatus::Enabled)
                    .count() as u64
            })
            .unwrap_or(0))
    }

    async fn set_campaign_to_send(&self, id: u64, to_send: u64) -> Result<()> {
        let mut campaigns = self.campaigns.write();
        let campaign = campaigns.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        campaign.to_send = to_send;
        Ok(())
    }

    async fn increment_campaign_count(&self, id: u64, delta: u64) -> Result<()> {
        if self.counter_outage.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "simulated counter outage".to_string(),
            ));
        }

        let mut campaigns = self.campaigns.write();
        let campaign = campaigns.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        campaign.sent = (campaign.sent + delta).min(campaign.to_send);
        Ok(())
    }

    async fn save_cursor(&self, id: u64, last_subscriber_id: u64) -> Result<()> {
        let mut campaigns = self.campaigns.write();
        let campaign = campaigns.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        campaign.last_subscriber_id = campaign.last_subscriber_id.max(last_subscriber_id);
        Ok(())
    }

    async fn create_link(&self, url: &str) -> Result<Uuid> {
        let mut links = self.links.write();
        Ok(*links
            .entry(url.to_string())
            .or_insert_with(Uuid::new_v4))
    }
}

#[cfg(test)]
mod tests {
    use courier_common::models::{ContentType, Headers};

    use super::*;

    fn campaign(id: u64, status: CampaignStatus) -> Campaign {
        Campaign {
            id,
            uuid: Uuid::new_v4(),
            name: format!("campaign-{id}"),
            subject: "subject".to_string(),
            body: "body".to_string(),
            alt_body: None,
            content_type: ContentType::Plain,
            headers: Headers::new(),
            tags: Vec::new(),
            messenger: "email".to_string(),
            send_at: None,
            status,
            status_reason: None,
            sent: 0,
            to_send: 0,
            last_subscriber_id: 0,
            started_at: None,
            finished_at: None,
        }
    }

    fn subscriber(id: u64, status: SubscriberStatus) -> Subscriber {
        Subscriber {
            id,
            uuid: Uuid::new_v4(),
            email: format!("user-{id}@example.com"),
            name: format!("User {id}"),
            attribs: serde_json::Map::new(),
            status,
        }
    }

    #[tokio::test]
    async fn next_campaigns_picks_due_and_running() {
        let store = MemoryStore::new();
        store.add_campaign(campaign(1, CampaignStatus::Running));
        store.add_campaign(campaign(2, CampaignStatus::Draft));
        store.add_campaign(campaign(3, CampaignStatus::Paused));

        let mut due = campaign(4, CampaignStatus::Scheduled);
        due.send_at = Some(Utc::now() - chrono::Duration::minutes(1));
        store.add_campaign(due);

        let mut future = campaign(5, CampaignStatus::Scheduled);
        future.send_at = Some(Utc::now() + chrono::Duration::hours(1));
        store.add_campaign(future);

        let mut ids: Vec<u64> = store
            .next_campaigns()
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 4]);
    }

    #[tokio::test]
    async fn cursor_pagination_is_monotone_and_skips_disabled() {
        let store = MemoryStore::new();
        store.add_campaign(campaign(1, CampaignStatus::Running));
        store.add_subscribers(
            1,
            (1..=10).map(|id| {
                subscriber(
                    id,
                    if id == 4 {
                        SubscriberStatus::Blocklisted
                    } else {
                        SubscriberStatus::Enabled
                    },
                )
            }),
        );

        let first = store.next_subscribers(1, 0, 3).await.unwrap();
        assert_eq!(first.iter().map(|s| s.id).collect::<Vec<_>>(), vec![1, 2, 3]);

        let second = store.next_subscribers(1, 3, 3).await.unwrap();
        assert_eq!(second.iter().map(|s| s.id).collect::<Vec<_>>(), vec![5, 6, 7]);

        let tail = store.next_subscribers(1, 7, 100).await.unwrap();
        assert_eq!(tail.iter().map(|s| s.id).collect::<Vec<_>>(), vec![8, 9, 10]);
    }

    #[tokio::test]
    async fn terminal_statuses_are_write_once() {
        let store = MemoryStore::new();
        store.add_campaign(campaign(1, CampaignStatus::Running));

        store
            .update_campaign_status(1, CampaignStatus::Cancelled, Some("operator"))
            .await
            .unwrap();

        // Idempotent repeat is fine.
        store
            .update_campaign_status(1, CampaignStatus::Cancelled, None)
            .await
            .unwrap();

        // Leaving a terminal status is not.
        let err = store
            .update_campaign_status(1, CampaignStatus::Running, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        let snapshot = store.get_campaign(1).unwrap();
        assert_eq!(snapshot.status, CampaignStatus::Cancelled);
        assert_eq!(snapshot.status_reason.as_deref(), Some("operator"));
        assert!(snapshot.finished_at.is_some());
    }

    #[tokio::test]
    async fn sent_counter_is_clamped_to_to_send() {
        let store = MemoryStore::new();
        store.add_campaign(campaign(1, CampaignStatus::Running));
        store.set_campaign_to_send(1, 10).await.unwrap();

        store.increment_campaign_count(1, 7).await.unwrap();
        assert_eq!(store.get_campaign(1).unwrap().sent, 7);

        // Redelivery overshoot across a restart boundary.
        store.increment_campaign_count(1, 7).await.unwrap();
        assert_eq!(store.get_campaign(1).unwrap().sent, 10);
    }

    #[tokio::test]
    async fn links_are_deduplicated() {
        let store = MemoryStore::new();
        let a = store.create_link("https://example.com/a").await.unwrap();
        let b = store.create_link("https://example.com/b").await.unwrap();
        let a_again = store.create_link("https://example.com/a").await.unwrap();

        assert_eq!(a, a_again);
        assert_ne!(a, b);
        assert_eq!(store.link_count(), 2);
    }

    #[tokio::test]
    async fn counter_outage_is_reported() {
        let store = MemoryStore::new();
        store.add_campaign(campaign(1, CampaignStatus::Running));
        store.set_counter_outage(true);

        let err = store.increment_campaign_count(1, 1).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));

        store.set_counter_outage(false);
        store.increment_campaign_count(1, 1).await.unwrap();
    }
}
