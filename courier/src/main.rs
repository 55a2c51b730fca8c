//! courier: bulk campaign dispatch daemon.
//!
//! Wires the pieces together: configuration, logging, messenger backends,
//! the in-memory store (optionally seeded from a JSON file), and the
//! dispatch engine. Runs until ctrl-c, then drains gracefully.

mod config;

use std::sync::Arc;

use anyhow::Context;
use courier_common::models::{Campaign, Message, Subscriber};
use courier_manager::{Manager, MemoryStore, Notification, Store};
use courier_messenger::{email::EmailMessenger, postback::PostbackMessenger, Registry};
use serde::Deserialize;
use tracing::{info, warn};

use crate::config::AppConfig;

/// Shape of the optional seed file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Seed {
    campaigns: Vec<Campaign>,
    /// (campaign id, subscriber) pairs.
    subscribers: Vec<(u64, Subscriber)>,
}

fn build_registry(app: &AppConfig) -> anyhow::Result<Registry> {
    let mut registry = Registry::new();

    let servers: Vec<_> = app
        .smtp
        .iter()
        .filter(|entry| entry.enabled)
        .map(|entry| entry.server.clone())
        .collect();
    if servers.is_empty() {
        warn!("no SMTP servers enabled; the \"email\" messenger is unavailable");
    } else {
        for server in &servers {
            info!(host = %server.host, port = server.port, "loaded SMTP relay");
        }
        registry
            .register(Arc::new(EmailMessenger::new("email", servers)?))
            .context("error registering email messenger")?;
    }

    for entry in app.messengers.iter().filter(|entry| entry.enabled) {
        let name = entry.config.name.clone();
        registry
            .register(Arc::new(PostbackMessenger::new(entry.config.clone())?))
            .with_context(|| format!("error registering postback messenger {name}"))?;
        info!(messenger = %name, "loaded postback messenger");
    }

    Ok(registry)
}

fn seed_store(store: &MemoryStore, path: &str) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("error reading seed file {path}"))?;
    let seed: Seed = serde_json::from_str(&raw)
        .with_context(|| format!("error parsing seed file {path}"))?;

    let campaigns = seed.campaigns.len();
    for campaign in seed.campaigns {
        store.add_campaign(campaign);
    }
    for (campaign_id, subscriber) in seed.subscribers {
        store.add_subscriber(campaign_id, subscriber);
    }
    info!(campaigns, seed_file = %path, "seeded the in-memory store");

    Ok(())
}

/// Forward campaign lifecycle events to the operators' mailboxes through
/// the shared worker pool.
fn notify_operators(manager: &Arc<Manager>, from: String, recipients: Vec<String>) {
    let weak = Arc::downgrade(manager);
    manager.set_notify(move |event: Notification| {
        let Some(manager) = weak.upgrade() else {
            return;
        };

        let subject = format!(
            "campaign \"{}\" {}",
            event.campaign_name, event.status
        );
        let body = match &event.reason {
            Some(reason) => format!(
                "<p>Campaign <b>{}</b> ({}) is now {}: {reason}</p>",
                event.campaign_name, event.campaign_uuid, event.status
            ),
            None => format!(
                "<p>Campaign <b>{}</b> ({}) is now {}.</p>",
                event.campaign_name, event.campaign_uuid, event.status
            ),
        };

        let message = Message::notification(from.clone(), recipients.clone(), subject, body);
        tokio::spawn(async move {
            if let Err(e) = manager.push(message).await {
                warn!(error = %e, "error queueing operator notification");
            }
        });
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    courier_common::logging::init();

    let app = AppConfig::load().context("error loading configuration")?;

    let store = Arc::new(MemoryStore::new());
    if let Some(path) = &app.seed_file {
        seed_store(&store, path)?;
    }

    let registry = build_registry(&app)?;
    let from_email = app.app.from_email.clone();
    let manager = Arc::new(
        Manager::new(app.app, store as Arc<dyn Store>, registry)
            .context("error building dispatch engine")?,
    );

    if !app.notify_emails.is_empty() {
        notify_operators(&manager, from_email, app.notify_emails.clone());
    }

    let runner = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.run().await })
    };

    tokio::signal::ctrl_c()
        .await
        .context("error waiting for shutdown signal")?;
    info!("interrupt received; shutting down");

    manager.stop().await;
    runner.abort();

    Ok(())
}
