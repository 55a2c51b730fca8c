//! Per-campaign template compilation and per-subscriber rendering.
//!
//! Templates are compiled once when a campaign starts and shared read-only
//! by the pipeline. Rendering is sandboxed: only string templates are
//! registered, so no filesystem or environment template features are
//! reachable.
//!
//! For markdown campaigns the processing order is fixed: markdown to HTML
//! first, then the tracking-link rewrite, then variable substitution. User
//! content therefore cannot forge tracking URLs.

use std::sync::OnceLock;

use courier_common::{
    models::{Campaign, CampaignRef, ContentType, Message, Subscriber},
    Config,
};
use handlebars::Handlebars;
use regex::Regex;
use thiserror::Error;
use uuid::Uuid;

use crate::store::{Store, StoreError};

const SUBJECT_TEMPLATE: &str = "subject";
const BODY_TEMPLATE: &str = "body";
const ALT_TEMPLATE: &str = "alt";

/// Template variable carrying the view-tracking pixel URL.
const VIEW_URL_VAR: &str = "{{view_url}}";

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("template parse error: {0}")]
    Parse(#[from] Box<handlebars::TemplateError>),

    #[error("template render error: {0}")]
    Render(#[from] Box<handlebars::RenderError>),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Builders for the fixed tracking URL shapes.
#[derive(Debug, Clone)]
pub struct TrackingUrls {
    root: String,
}

impl TrackingUrls {
    pub fn new(root: &str) -> Self {
        Self {
            root: root.trim_end_matches('/').to_string(),
        }
    }

    pub fn unsubscribe(&self, campaign: Uuid, subscriber: Uuid) -> String {
        format!("{}/subscription/{campaign}/{subscriber}", self.root)
    }

    pub fn optin(&self, subscriber: Uuid, query: &str) -> String {
        format!("{}/subscription/optin/{subscriber}?{query}", self.root)
    }

    pub fn link(&self, campaign: Uuid, subscriber: &str, link: Uuid) -> String {
        format!("{}/link/{campaign}/{subscriber}/{link}", self.root)
    }

    pub fn view_pixel(&self, campaign: Uuid, subscriber: Uuid) -> String {
        format!("{}/campaign/{campaign}/{subscriber}/px.png", self.root)
    }

    pub fn message(&self, campaign: Uuid, subscriber: Uuid) -> String {
        format!("{}/campaign/{campaign}/{subscriber}", self.root)
    }
}

/// A campaign's templates, compiled once and immutable for the lifetime of
/// its runtime.
pub struct CompiledCampaign {
    registry: Handlebars<'static>,
    reference: CampaignRef,
    campaign_uuid: Uuid,
    messenger: String,
    content_type: ContentType,
    from_email: String,
    urls: TrackingUrls,
    individual_tracking: bool,
    unsubscribe_header: bool,
    has_alt: bool,
}

/// Compile a campaign's subject and body.
///
/// Markdown is converted, links are pre-extracted through
/// [`Store::create_link`] and rewritten to tracked URLs, and HTML bodies
/// that do not place `{{view_url}}` themselves get the tracking pixel
/// appended.
pub async fn compile(
    campaign: &Campaign,
    config: &Config,
    store: &dyn Store,
) -> Result<CompiledCampaign, RenderError> {
    let urls = TrackingUrls::new(&config.root_url);

    let mut body = campaign.body.clone();
    let mut content_type = campaign.content_type;

    if content_type == ContentType::Markdown {
        body = markdown_to_html(&body);
        content_type = ContentType::Html;
    }

    if content_type == ContentType::Html {
        body = rewrite_links(
            &body,
            campaign.uuid,
            config.individual_tracking,
            &urls,
            store,
        )
        .await?;

        if !body.contains(VIEW_URL_VAR) {
            body.push_str("\n<img src=\"{{view_url}}\" alt=\"\" width=\"1\" height=\"1\" />");
        }
    }

    let mut registry = Handlebars::new();
    registry.register_escape_fn(handlebars::no_escape);
    registry
        .register_template_string(SUBJECT_TEMPLATE, &campaign.subject)
        .map_err(Box::new)?;
    registry
        .register_template_string(BODY_TEMPLATE, &body)
        .map_err(Box::new)?;

    let has_alt = if let Some(alt) = &campaign.alt_body {
        registry
            .register_template_string(ALT_TEMPLATE, alt)
            .map_err(Box::new)?;
        true
    } else {
        false
    };

    Ok(CompiledCampaign {
        registry,
        reference: CampaignRef::from(campaign),
        campaign_uuid: campaign.uuid,
        messenger: campaign.messenger.clone(),
        content_type,
        from_email: config.from_email.clone(),
        urls,
        individual_tracking: config.individual_tracking,
        unsubscribe_header: config.unsubscribe_header,
        has_alt,
    })
}

impl std::fmt::Debug for CompiledCampaign {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledCampaign")
            .field("campaign", &self.reference.name)
            .field("messenger", &self.messenger)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

impl CompiledCampaign {
    pub fn messenger(&self) -> &str {
        &self.messenger
    }

    /// Expand the templates for one subscriber.
    pub fn render(&self, subscriber: &Subscriber) -> Result<Message, RenderError> {
        // Link and view URLs carry the nil UUID when individual tracking is
        // off; the unsubscribe URL always needs the real one to function.
        let tracked_subscriber = if self.individual_tracking {
            subscriber.uuid
        } else {
            Uuid::nil()
        };

        let unsubscribe_url = self.urls.unsubscribe(self.campaign_uuid, subscriber.uuid);
        let data = serde_json::json!({
            "subscriber": {
                "uuid": subscriber.uuid,
                "email": subscriber.email,
                "name": subscriber.name,
                "attribs": subscriber.attribs,
            },
            "campaign": {
                "uuid": self.campaign_uuid,
                "name": self.reference.name,
            },
            "unsubscribe_url": unsubscribe_url,
            "optin_url": self.urls.optin(subscriber.uuid, "l=all"),
            "message_url": self.urls.message(self.campaign_uuid, tracked_subscriber),
            "view_url": self.urls.view_pixel(self.campaign_uuid, tracked_subscriber),
        });

        let subject = self
            .registry
            .render(SUBJECT_TEMPLATE, &data)
            .map_err(Box::new)?;
        let body = self.registry.render(BODY_TEMPLATE, &data).map_err(Box::new)?;
        let alt_body = if self.has_alt {
            Some(self.registry.render(ALT_TEMPLATE, &data).map_err(Box::new)?)
        } else {
            None
        };

        let mut headers = self.reference.headers.clone();
        if self.unsubscribe_header {
            headers.push("List-Unsubscribe-Post", "List-Unsubscribe=One-Click");
            headers.push("List-Unsubscribe", format!("<{unsubscribe_url}>"));
        }

        Ok(Message {
            from: self.from_email.clone(),
            to: vec![subscriber.email.clone()],
            subject,
            body,
            alt_body,
            content_type: self.content_type,
            headers,
            messenger: self.messenger.clone(),
            campaign: Some(self.reference.clone()),
            subscriber: Some(subscriber.clone()),
            retries: 0,
        })
    }
}

fn markdown_to_html(markdown: &str) -> String {
    let parser = pulldown_cmark::Parser::new_ext(markdown, pulldown_cmark::Options::all());
    let mut html = String::with_capacity(markdown.len() * 2);
    pulldown_cmark::html::push_html(&mut html, parser);
    html
}

fn href_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"href\s*=\s*"(https?://[^"]+)""#).expect("static pattern")
    })
}

/// Replace every `href` URL in the body with its tracked form.
///
/// Each distinct URL gets a stable UUID from the store. URLs containing
/// template expressions are left alone; the subscriber segment stays a
/// template variable so it is filled per recipient.
async fn rewrite_links(
    body: &str,
    campaign: Uuid,
    individual_tracking: bool,
    urls: &TrackingUrls,
    store: &dyn Store,
) -> Result<String, RenderError> {
    let mut spans = Vec::new();
    for captures in href_pattern().captures_iter(body) {
        let url = captures.get(1).expect("group 1 always present");
        if url.as_str().contains("{{") {
            continue;
        }
        spans.push((url.range(), url.as_str().to_string()));
    }

    if spans.is_empty() {
        return Ok(body.to_string());
    }

    let subscriber_segment = if individual_tracking {
        "{{subscriber.uuid}}".to_string()
    } else {
        Uuid::nil().to_string()
    };

    let mut out = String::with_capacity(body.len());
    let mut copied = 0;
    for (range, url) in spans {
        let link_uuid = store.create_link(&url).await?;
        out.push_str(&body[copied..range.start]);
        out.push_str(&urls.link(campaign, &subscriber_segment, link_uuid));
        copied = range.end;
    }
    out.push_str(&body[copied..]);

    Ok(out)
}

#[cfg(test)]
mod tests {
    use courier_common::models::{CampaignStatus, Headers, SubscriberStatus};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::store::MemoryStore;

    fn campaign(content_type: ContentType, subject: &str, body: &str) -> Campaign {
        Campaign {
            id: 1,
            uuid: Uuid::new_v4(),
            name: "spring-launch".to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
            alt_body: None,
            content_type,
            headers: Headers::from(vec![("X-Campaign".to_string(), "spring".to_string())]),
            tags: vec!["launch".to_string()],
            messenger: "email".to_string(),
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

    fn subscriber() -> Subscriber {
        let mut attribs = serde_json::Map::new();
        attribs.insert("city".to_string(), serde_json::json!("Pune"));
        Subscriber {
            id: 3,
            uuid: Uuid::new_v4(),
            email: "meera@example.com".to_string(),
            name: "Meera".to_string(),
            attribs,
            status: SubscriberStatus::Enabled,
        }
    }

    fn config() -> Config {
        let mut config = Config {
            root_url: "https://lists.example.com/".to_string(),
            individual_tracking: true,
            ..Config::default()
        };
        config.validate().unwrap();
        config
    }

    #[tokio::test]
    async fn renders_subscriber_and_campaign_variables() {
        let store = MemoryStore::new();
        let campaign = campaign(
            ContentType::Html,
            "Hello {{subscriber.name}}",
            "<p>{{subscriber.attribs.city}} news from {{campaign.name}}</p>",
        );
        let compiled = compile(&campaign, &config(), &store).await.unwrap();

        let subscriber = subscriber();
        let message = compiled.render(&subscriber).unwrap();

        assert_eq!(message.subject, "Hello Meera");
        assert!(message.body.contains("<p>Pune news from spring-launch</p>"));
        assert_eq!(message.to, vec!["meera@example.com".to_string()]);
        assert_eq!(message.from, config().from_email);
    }

    #[tokio::test]
    async fn links_are_rewritten_and_deduplicated() {
        let store = MemoryStore::new();
        let campaign = campaign(
            ContentType::Html,
            "S",
            r#"<a href="https://shop.example.com/sale">sale</a> and again <a href="https://shop.example.com/sale">here</a>"#,
        );
        let compiled = compile(&campaign, &config(), &store).await.unwrap();
        assert_eq!(store.link_count(), 1);

        let subscriber = subscriber();
        let message = compiled.render(&subscriber).unwrap();

        let prefix = format!(
            "https://lists.example.com/link/{}/{}/",
            campaign.uuid, subscriber.uuid
        );
        assert_eq!(message.body.matches(&prefix).count(), 2);
        assert!(!message.body.contains("shop.example.com"));
    }

    #[tokio::test]
    async fn markdown_links_are_tracked() {
        // The markdown pass runs first, so markdown-authored links end up
        // tracked just like raw HTML ones.
        let store = MemoryStore::new();
        let campaign = campaign(
            ContentType::Markdown,
            "S",
            "Visit [our site](https://example.com/home) today.",
        );
        let compiled = compile(&campaign, &config(), &store).await.unwrap();
        assert_eq!(store.link_count(), 1);

        let message = compiled.render(&subscriber()).unwrap();
        assert_eq!(message.content_type, ContentType::Html);
        assert!(message.body.contains("/link/"));
        assert!(!message.body.contains("https://example.com/home"));
    }

    #[tokio::test]
    async fn nil_subscriber_uuid_without_individual_tracking() {
        let store = MemoryStore::new();
        let mut config = config();
        config.individual_tracking = false;

        let campaign = campaign(
            ContentType::Html,
            "S",
            r#"<a href="https://example.com/x">x</a>"#,
        );
        let compiled = compile(&campaign, &config, &store).await.unwrap();
        let subscriber = subscriber();
        let message = compiled.render(&subscriber).unwrap();

        let nil = Uuid::nil().to_string();
        assert!(message.body.contains(&format!("/link/{}/{nil}/", campaign.uuid)));
        assert!(message.body.contains(&format!("/campaign/{}/{nil}/px.png", campaign.uuid)));
        // The unsubscribe header still carries the real UUID.
        let unsub = message
            .headers
            .iter()
            .find(|(name, _)| name == "List-Unsubscribe")
            .unwrap();
        assert!(unsub.1.contains(&subscriber.uuid.to_string()));
    }

    #[tokio::test]
    async fn pixel_is_appended_unless_placed() {
        let store = MemoryStore::new();
        let auto = compile(&campaign(ContentType::Html, "S", "<p>b</p>"), &config(), &store)
            .await
            .unwrap();
        let message = auto.render(&subscriber()).unwrap();
        assert_eq!(message.body.matches("/px.png").count(), 1);

        let manual = compile(
            &campaign(ContentType::Html, "S", r#"<img src="{{view_url}}" />"#),
            &config(),
            &store,
        )
        .await
        .unwrap();
        let message = manual.render(&subscriber()).unwrap();
        assert_eq!(message.body.matches("/px.png").count(), 1);
    }

    #[tokio::test]
    async fn plain_bodies_are_left_alone() {
        let store = MemoryStore::new();
        let campaign = campaign(
            ContentType::Plain,
            "S",
            "See https://example.com/plain for details.",
        );
        let compiled = compile(&campaign, &config(), &store).await.unwrap();
        let message = compiled.render(&subscriber()).unwrap();

        assert_eq!(store.link_count(), 0);
        assert!(message.body.contains("https://example.com/plain"));
        assert!(!message.body.contains("px.png"));
    }

    #[tokio::test]
    async fn campaign_headers_and_unsubscribe_header_are_attached() {
        let store = MemoryStore::new();
        let compiled = compile(&campaign(ContentType::Html, "S", "<p>b</p>"), &config(), &store)
            .await
            .unwrap();
        let message = compiled.render(&subscriber()).unwrap();

        let names: Vec<&str> = message
            .headers
            .iter()
            .map(|(name, _)| name.as_str())
            .collect();
        assert_eq!(
            names,
            vec!["X-Campaign", "List-Unsubscribe-Post", "List-Unsubscribe"]
        );
    }

    #[tokio::test]
    async fn broken_templates_fail_compilation() {
        let store = MemoryStore::new();
        let campaign = campaign(ContentType::Html, "{{#if subscriber.name}}oops", "<p>b</p>");
        assert!(compile(&campaign, &config(), &store).await.is_err());
    }
}
