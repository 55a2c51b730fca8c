//! Test doubles and fixtures shared by the integration tests.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use courier_common::{
    models::{
        Campaign, CampaignStatus, ContentType, Headers, Message, Subscriber, SubscriberStatus,
    },
    Config,
};
use courier_messenger::{error, Messenger, MessengerError, TransientError};
use uuid::Uuid;

/// How a [`MockMessenger`] responds to pushes.
#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    Succeed,
    /// Every push fails with a transient error.
    TransientFail,
    /// Every push blocks for the given duration, then succeeds.
    Delay(Duration),
}

/// Counting messenger double. Records the start instant of every push and
/// the number of completed pushes.
#[derive(Debug)]
pub struct MockMessenger {
    name: String,
    behavior: Behavior,
    calls: AtomicU64,
    completed: AtomicU64,
    started_at: Mutex<Vec<Instant>>,
    subjects: Mutex<Vec<String>>,
}

impl MockMessenger {
    pub fn new(name: &str) -> Arc<Self> {
        Self::with_behavior(name, Behavior::Succeed)
    }

    pub fn failing(name: &str) -> Arc<Self> {
        Self::with_behavior(name, Behavior::TransientFail)
    }

    pub fn slow(name: &str, delay: Duration) -> Arc<Self> {
        Self::with_behavior(name, Behavior::Delay(delay))
    }

    pub fn with_behavior(name: &str, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            behavior,
            calls: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            started_at: Mutex::new(Vec::new()),
            subjects: Mutex::new(Vec::new()),
        })
    }

    /// Number of pushes started.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of pushes that ran to completion.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn started_at(&self) -> Vec<Instant> {
        self.started_at.lock().expect("mock mutex poisoned").clone()
    }

    pub fn subjects(&self) -> Vec<String> {
        self.subjects.lock().expect("mock mutex poisoned").clone()
    }

    /// Wait until at least `expected` pushes have started.
    pub async fn wait_for_calls(&self, expected: u64, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while self.calls() < expected {
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {expected} messenger calls (saw {})",
                self.calls()
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

#[async_trait]
impl Messenger for MockMessenger {
    fn name(&self) -> &str {
        &self.name
    }

    async fn push(&self, message: &Message) -> error::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started_at
            .lock()
            .expect("mock mutex poisoned")
            .push(Instant::now());
        self.subjects
            .lock()
            .expect("mock mutex poisoned")
            .push(message.subject.clone());

        match self.behavior {
            Behavior::Succeed => {}
            Behavior::TransientFail => {
                return Err(MessengerError::Transient(TransientError::ServerBusy(
                    "simulated 451".to_string(),
                )));
            }
            Behavior::Delay(delay) => tokio::time::sleep(delay).await,
        }

        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Poll `condition` until it holds or the timeout expires.
pub async fn wait_until(timeout: Duration, what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// A fast-polling config suitable for tests.
pub fn test_config() -> Config {
    Config {
        batch_size: 3,
        concurrency: 2,
        message_rate: 1000,
        scan_interval_secs: 1,
        flush_interval_secs: 1,
        shutdown_grace_secs: 3,
        root_url: "https://lists.test".to_string(),
        ..Config::default()
    }
}

pub fn campaign(id: u64, messenger: &str) -> Campaign {
    Campaign {
        id,
        uuid: Uuid::new_v4(),
        name: format!("campaign-{id}"),
        subject: "Hello {{subscriber.name}}".to_string(),
        body: "<p>News for {{subscriber.name}}</p>".to_string(),
        alt_body: None,
        content_type: ContentType::Html,
        headers: Headers::new(),
        tags: Vec::new(),
        messenger: messenger.to_string(),
        send_at: None,
        status: CampaignStatus::Running,
        status_reason: None,
        sent: 0,
        to_send: 0,
        last_subscriber_id: 0,
        started_at: None,
        finished_at: None,
    }
}

pub fn subscribers(range: std::ops::RangeInclusive<u64>) -> Vec<Subscriber> {
    range
        .map(|id| Subscriber {
            id,
            uuid: Uuid::new_v4(),
            email: format!("user-{id}@example.com"),
            name: format!("User {id}"),
            attribs: serde_json::Map::new(),
            status: SubscriberStatus::Enabled,
        })
        .collect()
}
