//! Shared data model for campaigns, subscribers, and the messages derived
//! from them.

use std::fmt::{self, Display};

use chrono::{DateTime, Utc};
use serde::{de::Deserializer, ser::SerializeSeq, Deserialize, Serialize};
use uuid::Uuid;

/// Content type of a campaign body.
///
/// Markdown bodies are converted to HTML before dispatch; the message that
/// reaches a messenger only ever carries `Html` or `Plain`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    #[default]
    Html,
    Plain,
    Markdown,
}

impl ContentType {
    /// MIME type used in outgoing mail headers.
    pub const fn mime(self) -> &'static str {
        match self {
            Self::Html | Self::Markdown => "text/html",
            Self::Plain => "text/plain",
        }
    }
}

impl Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Html => "html",
            Self::Plain => "plain",
            Self::Markdown => "markdown",
        })
    }
}

/// Lifecycle state of a campaign.
///
/// `Cancelled` and `Finished` are terminal: once a campaign reaches either,
/// no further transition is accepted by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Running,
    Paused,
    Cancelled,
    Finished,
}

impl CampaignStatus {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Finished)
    }
}

impl Display for CampaignStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Draft => "draft",
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
            Self::Finished => "finished",
        })
    }
}

/// Subscription state. Only `Enabled` subscribers are dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SubscriberStatus {
    #[default]
    Enabled,
    Disabled,
    Blocklisted,
}

/// An ordered list of header key/value pairs.
///
/// Serialized as a list of single-entry objects (`[{"X-Tag": "a"}, ...]`)
/// so that header order survives the wire format.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    pub fn iter(&self) -> std::slice::Iter<'_, (String, String)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<(String, String)>> for Headers {
    fn from(pairs: Vec<(String, String)>) -> Self {
        Self(pairs)
    }
}

impl<'h> IntoIterator for &'h Headers {
    type Item = &'h (String, String);
    type IntoIter = std::slice::Iter<'h, (String, String)>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl Serialize for Headers {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.0.len()))?;
        for (name, value) in &self.0 {
            let mut entry = serde_json::Map::with_capacity(1);
            entry.insert(name.clone(), serde_json::Value::String(value.clone()));
            seq.serialize_element(&entry)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for Headers {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let entries = Vec::<serde_json::Map<String, serde_json::Value>>::deserialize(deserializer)?;
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            for (name, value) in entry {
                match value {
                    serde_json::Value::String(s) => out.push((name, s)),
                    other => out.push((name, other.to_string())),
                }
            }
        }
        Ok(Self(out))
    }
}

/// An operator-defined dispatch job: one rendered message per subscriber of
/// the target audience.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: u64,
    pub uuid: Uuid,
    pub name: String,

    /// Subject template.
    pub subject: String,
    /// Body template.
    pub body: String,
    /// Optional plain-text alternative body template.
    #[serde(default)]
    pub alt_body: Option<String>,
    pub content_type: ContentType,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub tags: Vec<String>,

    /// Name of the messenger backend that delivers this campaign.
    pub messenger: String,

    #[serde(default)]
    pub send_at: Option<DateTime<Utc>>,
    pub status: CampaignStatus,
    /// Human-readable reason recorded with a cancellation.
    #[serde(default)]
    pub status_reason: Option<String>,

    /// Messages delivered so far.
    #[serde(default)]
    pub sent: u64,
    /// Total audience size expected for this run.
    #[serde(default)]
    pub to_send: u64,
    /// Progress cursor: highest subscriber id dispatched and flushed.
    #[serde(default)]
    pub last_subscriber_id: u64,

    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

/// A recipient of campaigns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: u64,
    pub uuid: Uuid,
    pub email: String,
    pub name: String,
    /// Arbitrary operator-defined attributes, exposed to templates.
    #[serde(default)]
    pub attribs: serde_json::Map<String, serde_json::Value>,
    pub status: SubscriberStatus,
}

/// The slice of campaign state a message carries to its messenger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignRef {
    pub uuid: Uuid,
    pub name: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl From<&Campaign> for CampaignRef {
    fn from(campaign: &Campaign) -> Self {
        Self {
            uuid: campaign.uuid,
            name: campaign.name.clone(),
            headers: campaign.headers.clone(),
            tags: campaign.tags.clone(),
        }
    }
}

/// A single rendered message bound for a messenger.
///
/// Messages are ephemeral: created by a campaign pipeline (or pushed ad-hoc),
/// consumed by one worker, and discarded after a terminal outcome.
#[derive(Debug, Clone)]
pub struct Message {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
    pub alt_body: Option<String>,
    pub content_type: ContentType,
    pub headers: Headers,
    /// Name of the messenger that should carry this message.
    pub messenger: String,
    pub campaign: Option<CampaignRef>,
    pub subscriber: Option<Subscriber>,
    /// Delivery attempts already made for this message.
    pub retries: u32,
}

impl Message {
    /// An ad-hoc message outside any campaign, e.g. an operator notification.
    /// Always carried by the built-in email messenger.
    pub fn notification(
        from: impl Into<String>,
        to: Vec<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            to,
            subject: subject.into(),
            body: body.into(),
            alt_body: None,
            content_type: ContentType::Html,
            headers: Headers::new(),
            messenger: "email".to_string(),
            campaign: None,
            subscriber: None,
            retries: 0,
        }
    }
}

/// Wire document POSTed by the postback messenger.
///
/// Field names are stable; unknown fields are ignored on decode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostbackPayload {
    pub subject: String,
    pub content_type: ContentType,
    pub body: String,
    pub recipients: Vec<PostbackRecipient>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub campaign: Option<CampaignRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostbackRecipient {
    pub uuid: Uuid,
    pub email: String,
    pub name: String,
    #[serde(default)]
    pub attribs: serde_json::Map<String, serde_json::Value>,
    pub status: SubscriberStatus,
}

impl From<&Message> for PostbackPayload {
    fn from(message: &Message) -> Self {
        let recipients = message
            .subscriber
            .iter()
            .map(|sub| PostbackRecipient {
                uuid: sub.uuid,
                email: sub.email.clone(),
                name: sub.name.clone(),
                attribs: sub.attribs.clone(),
                status: sub.status,
            })
            .collect();

        Self {
            subject: message.subject.clone(),
            content_type: message.content_type,
            body: message.body.clone(),
            recipients,
            campaign: message.campaign.clone(),
        }
    }
}
